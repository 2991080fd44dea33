use std::{
  io,
  pin::Pin,
  task::{Context, Poll},
};

use tokio::{
  io::{AsyncRead, AsyncWrite, BufStream, ReadBuf},
  net::{self, TcpStream},
};

#[cfg(test)]
use tokio::io::DuplexStream;

/// Buffered byte stream beneath the transport stack.
#[derive(Debug)]
pub enum Stream {
  Tcp(BufStream<TcpStream>),
  #[cfg(test)]
  Duplex(DuplexStream),
}

impl Stream {
  /// Connects to a `host:port` endpoint, resolving the host if needed.
  pub async fn connect(host_port: impl AsRef<str>) -> io::Result<Self> {
    let host_port = host_port.as_ref();
    let addrs = net::lookup_host(host_port).await?.collect::<Vec<_>>();
    if addrs.is_empty() {
      return Err(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("{} did not resolve to any address", host_port),
      ));
    }
    let stream = TcpStream::connect(addrs.as_slice()).await.map(BufStream::new)?;
    Ok(Self::Tcp(stream))
  }
}

impl AsyncRead for Stream {
  fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
    match self.get_mut() {
      Stream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
      #[cfg(test)]
      Stream::Duplex(s) => Pin::new(s).poll_read(cx, buf),
    }
  }
}

impl AsyncWrite for Stream {
  fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
    match self.get_mut() {
      Stream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
      #[cfg(test)]
      Stream::Duplex(s) => Pin::new(s).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    match self.get_mut() {
      Stream::Tcp(s) => Pin::new(s).poll_flush(cx),
      #[cfg(test)]
      Stream::Duplex(s) => Pin::new(s).poll_flush(cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    match self.get_mut() {
      Stream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
      #[cfg(test)]
      Stream::Duplex(s) => Pin::new(s).poll_shutdown(cx),
    }
  }
}
