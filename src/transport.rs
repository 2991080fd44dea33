use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::sasl::{Mechanism, QOP_AUTH, QOP_PROPERTY};
use crate::stream::Stream;
use crate::{Error, Result};

/// Handshake status bytes.
pub const START: u8 = 1;
pub const OK: u8 = 2;
pub const BAD: u8 = 3;
pub const ERROR: u8 = 4;
pub const COMPLETE: u8 = 5;

// Handshake payloads above this are rejected outright.
const MAX_SASL_PAYLOAD: usize = 104_857_600;

/// Bound shared by every stream the transport stack runs over.
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

/// The byte transport beneath the RPC client: either the raw stream
/// (noSasl) or the SASL framing layer.
pub enum Transport<S = Stream> {
  Raw(S),
  Sasl(SaslTransport<S>),
}

impl<S: Io> Transport<S> {
  /// Runs the SASL handshake, if any.
  pub async fn open(&mut self) -> Result<()> {
    match self {
      Transport::Raw(_) => Ok(()),
      Transport::Sasl(t) => t.open().await,
    }
  }

  pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
    match self {
      Transport::Raw(s) => {
        s.read_exact(buf).await?;
        Ok(())
      }
      Transport::Sasl(t) => t.read_exact(buf).await,
    }
  }

  /// Buffers (Sasl) or writes through (Raw) an outgoing chunk.
  pub async fn write(&mut self, buf: &[u8]) -> Result<()> {
    match self {
      Transport::Raw(s) => {
        s.write_all(buf).await?;
        Ok(())
      }
      Transport::Sasl(t) => {
        t.write(buf);
        Ok(())
      }
    }
  }

  /// Flushes one message: for the SASL layer this seals a data frame.
  pub async fn flush(&mut self) -> Result<()> {
    match self {
      Transport::Raw(s) => {
        s.flush().await?;
        Ok(())
      }
      Transport::Sasl(t) => t.flush().await,
    }
  }

  pub async fn close(&mut self) -> Result<()> {
    match self {
      Transport::Raw(s) => {
        s.shutdown().await?;
        Ok(())
      }
      Transport::Sasl(t) => t.close().await,
    }
  }

  pub fn is_open(&self) -> bool {
    match self {
      Transport::Raw(_) => true,
      Transport::Sasl(t) => t.is_open(),
    }
  }
}

/// SASL framing layer over a byte stream.
///
/// `open` drives the mechanism through the server's challenge loop; after
/// that every logical message travels as a `[len:u32 BE][payload]` frame,
/// with the payload wrap-processed whenever a security layer was
/// negotiated.
pub struct SaslTransport<S> {
  stream: S,
  mechanism: Mechanism,
  read_buffer: BytesMut,
  write_buffer: BytesMut,
  should_wrap: bool,
  closed: bool,
}

impl<S: Io> SaslTransport<S> {
  pub fn new(stream: S, mechanism: Mechanism) -> Self {
    Self {
      stream,
      mechanism,
      read_buffer: BytesMut::new(),
      write_buffer: BytesMut::new(),
      should_wrap: false,
      closed: false,
    }
  }

  /// Negotiates the SASL mechanism with the server.
  pub async fn open(&mut self) -> Result<()> {
    if self.mechanism.is_complete() {
      return Err(Error::Sasl("SASL transport already open".into()));
    }

    self.send_start_message().await?;

    // Drive the challenge loop. The mechanism decides when it is done;
    // the server signals its own completion with a COMPLETE status.
    let mut last_status = None;
    while !self.mechanism.is_complete() {
      let (status, payload) = self.receive_sasl_message().await?;
      if status != OK && status != COMPLETE {
        return Err(Error::Sasl(format!("expected COMPLETE or OK, got status {}", status)));
      }
      let response = self.mechanism.evaluate_challenge(&payload)?;
      last_status = Some(status);
      if status == COMPLETE {
        break;
      }
      let out_status = if self.mechanism.is_complete() { COMPLETE } else { OK };
      self.send_sasl_message(out_status, &response).await?;
    }

    // The server still owes its final verdict when its last frame was OK.
    if last_status == Some(OK) {
      let (status, _) = self.receive_sasl_message().await?;
      if status != COMPLETE {
        return Err(Error::Sasl("expected SASL COMPLETE".into()));
      }
    }

    let qop = self.mechanism.negotiated_property(QOP_PROPERTY)?;
    if qop != QOP_AUTH {
      self.should_wrap = true;
    }
    debug!(mechanism = self.mechanism.name(), qop = %qop, "sasl handshake complete");
    Ok(())
  }

  async fn send_start_message(&mut self) -> Result<()> {
    let initial_response = if self.mechanism.has_initial_response() {
      self.mechanism.evaluate_challenge(&[])?
    } else {
      Vec::new()
    };

    self.send_sasl_message(START, self.mechanism.name().as_bytes()).await?;
    let status = if self.mechanism.is_complete() { COMPLETE } else { OK };
    self.send_sasl_message(status, &initial_response).await
  }

  async fn send_sasl_message(&mut self, status: u8, body: &[u8]) -> Result<()> {
    let mut frame = BytesMut::with_capacity(5 + body.len());
    frame.put_u8(status);
    frame.put_u32(body.len() as u32);
    frame.put_slice(body);
    self.stream.write_all(&frame).await?;
    self.stream.flush().await?;
    trace!(status, len = body.len(), "sent sasl message");
    Ok(())
  }

  async fn receive_sasl_message(&mut self) -> Result<(u8, Vec<u8>)> {
    let mut header = [0u8; 5];
    self.stream.read_exact(&mut header).await?;
    let status = header[0];
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > MAX_SASL_PAYLOAD {
      let message = format!("Invalid payload header length: {}", len);
      let _ = self.send_sasl_message(ERROR, message.as_bytes()).await;
      return Err(Error::Sasl(message));
    }
    let mut payload = vec![0; len];
    self.stream.read_exact(&mut payload).await?;
    trace!(status, len, "received sasl message");
    Ok((status, payload))
  }

  pub fn write(&mut self, buf: &[u8]) {
    self.write_buffer.put_slice(buf);
  }

  pub async fn flush(&mut self) -> Result<()> {
    let payload = if self.should_wrap {
      self.mechanism.wrap(&self.write_buffer)?
    } else {
      self.write_buffer.to_vec()
    };

    let mut frame = BytesMut::with_capacity(4 + payload.len());
    frame.put_u32(payload.len() as u32);
    frame.put_slice(&payload);
    self.stream.write_all(&frame).await?;
    self.stream.flush().await?;
    trace!(len = self.write_buffer.len(), wrapped = payload.len(), "flushed data frame");
    self.write_buffer.clear();
    Ok(())
  }

  pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
    while self.read_buffer.is_empty() {
      self.read_frame().await?;
    }
    let n = buf.len().min(self.read_buffer.len());
    buf[..n].copy_from_slice(&self.read_buffer[..n]);
    self.read_buffer.advance(n);
    Ok(n)
  }

  pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
      filled += self.read(&mut buf[filled..]).await?;
    }
    Ok(())
  }

  /// Reads one data frame into the local buffer, unwrapping if a security
  /// layer is active. A frame is consumed whole; leftovers stay buffered
  /// for subsequent reads.
  async fn read_frame(&mut self) -> Result<()> {
    let mut header = [0u8; 4];
    self.stream.read_exact(&mut header).await?;
    let len = u32::from_be_bytes(header) as usize;
    let mut data = vec![0; len];
    self.stream.read_exact(&mut data).await?;
    let data = if self.should_wrap { self.mechanism.unwrap(&data)? } else { data };
    trace!(len, unwrapped = data.len(), "read data frame");
    self.read_buffer.put_slice(&data);
    Ok(())
  }

  pub async fn close(&mut self) -> Result<()> {
    self.closed = true;
    self.mechanism.dispose();
    self.stream.shutdown().await?;
    Ok(())
  }

  /// Open means the underlying stream has not been shut down and the SASL
  /// session reports complete.
  pub fn is_open(&self) -> bool {
    !self.closed && self.mechanism.is_complete()
  }
}

#[cfg(test)]
mod test {
  use md5::{Digest, Md5};
  use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

  use super::{SaslTransport, COMPLETE, ERROR, OK, START};
  use crate::sasl::digest_security::{DigestPrivacy, SecurityCtx};
  use crate::sasl::{CramMd5Mechanism, DigestMd5Mechanism, Mechanism, PlainMechanism};

  async fn read_sasl_frame(s: &mut DuplexStream) -> (u8, Vec<u8>) {
    let mut header = [0u8; 5];
    s.read_exact(&mut header).await.unwrap();
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    let mut payload = vec![0; len];
    s.read_exact(&mut payload).await.unwrap();
    (header[0], payload)
  }

  async fn write_sasl_frame(s: &mut DuplexStream, status: u8, payload: &[u8]) {
    s.write_all(&[status]).await.unwrap();
    s.write_all(&(payload.len() as u32).to_be_bytes()).await.unwrap();
    s.write_all(payload).await.unwrap();
    s.flush().await.unwrap();
  }

  async fn read_data_frame(s: &mut DuplexStream) -> Vec<u8> {
    let mut header = [0u8; 4];
    s.read_exact(&mut header).await.unwrap();
    let mut payload = vec![0; u32::from_be_bytes(header) as usize];
    s.read_exact(&mut payload).await.unwrap();
    payload
  }

  async fn write_data_frame(s: &mut DuplexStream, payload: &[u8]) {
    s.write_all(&(payload.len() as u32).to_be_bytes()).await.unwrap();
    s.write_all(payload).await.unwrap();
    s.flush().await.unwrap();
  }

  #[tokio::test]
  async fn plain_handshake_then_framed_data() {
    let (client_io, mut server_io) = duplex(8192);
    let mechanism = Mechanism::Plain(PlainMechanism::new("", "anonymous", "anonymous"));
    let mut transport = SaslTransport::new(client_io, mechanism);

    let server = tokio::spawn(async move {
      let (status, payload) = read_sasl_frame(&mut server_io).await;
      assert_eq!(START, status);
      assert_eq!(b"PLAIN".to_vec(), payload);

      // PLAIN completes on its initial response; no further challenges.
      let (status, payload) = read_sasl_frame(&mut server_io).await;
      assert_eq!(COMPLETE, status);
      assert_eq!(b"\x00anonymous\x00anonymous".to_vec(), payload);

      assert_eq!(b"ping".to_vec(), read_data_frame(&mut server_io).await);
      write_data_frame(&mut server_io, b"pong").await;
    });

    assert!(!transport.is_open());
    transport.open().await.unwrap();
    assert!(transport.is_open());

    transport.write(b"ping");
    transport.flush().await.unwrap();

    let mut reply = [0u8; 4];
    transport.read_exact(&mut reply).await.unwrap();
    assert_eq!(b"pong", &reply);
    server.await.unwrap();

    // Closing shuts the stream down, so the transport is no longer open.
    transport.close().await.unwrap();
    assert!(!transport.is_open());
  }

  #[tokio::test]
  async fn oversize_handshake_payload_is_rejected_with_error_frame() {
    let (client_io, mut server_io) = duplex(8192);
    let mechanism = Mechanism::CramMd5(CramMd5Mechanism::new("user", "pw"));
    let mut transport = SaslTransport::new(client_io, mechanism);

    let server = tokio::spawn(async move {
      let (status, _) = read_sasl_frame(&mut server_io).await;
      assert_eq!(START, status);
      let (status, _) = read_sasl_frame(&mut server_io).await;
      assert_eq!(OK, status);

      // Declare a payload one byte over the 100 MiB cap.
      server_io.write_all(&[OK]).await.unwrap();
      server_io.write_all(&104_857_601u32.to_be_bytes()).await.unwrap();
      server_io.flush().await.unwrap();

      let (status, payload) = read_sasl_frame(&mut server_io).await;
      assert_eq!(ERROR, status);
      assert_eq!(b"Invalid payload header length: 104857601".to_vec(), payload);
    });

    let err = transport.open().await.unwrap_err();
    assert!(err.to_string().contains("104857601"), "{}", err);
    assert!(!transport.is_open());
    server.await.unwrap();
  }

  #[tokio::test]
  async fn rejects_unexpected_handshake_status() {
    let (client_io, mut server_io) = duplex(8192);
    let mechanism = Mechanism::CramMd5(CramMd5Mechanism::new("user", "pw"));
    let mut transport = SaslTransport::new(client_io, mechanism);

    let server = tokio::spawn(async move {
      read_sasl_frame(&mut server_io).await;
      read_sasl_frame(&mut server_io).await;
      write_sasl_frame(&mut server_io, super::BAD, b"no").await;
    });

    assert!(transport.open().await.is_err());
    server.await.unwrap();
  }

  // Hand-rolled RFC 2831 arithmetic, kept independent of the mechanism
  // under test.
  mod rfc2831 {
    use super::{Digest, Md5};

    pub const USERNAME: &str = "etl";
    pub const PASSWORD: &str = "secret";
    pub const REALM: &str = "warehouse";
    pub const NONCE: &str = "3nonce9";
    pub const DIGEST_URI: &str = "hive/warehouse.example.com";

    fn h(data: &[u8]) -> [u8; 16] {
      Md5::digest(data).into()
    }

    pub fn a1(cnonce: &str) -> Vec<u8> {
      let mut a1 = h(format!("{}:{}:{}", USERNAME, REALM, PASSWORD).as_bytes()).to_vec();
      a1.extend_from_slice(format!(":{}:{}", NONCE, cnonce).as_bytes());
      a1
    }

    pub fn digest(cnonce: &str, initial: bool) -> String {
      let a2 = format!(
        "{}:{}:00000000000000000000000000000000",
        if initial { "AUTHENTICATE" } else { "" },
        DIGEST_URI
      );
      let y = format!(
        "{}:00000001:{}:auth-conf:{}",
        NONCE,
        cnonce,
        hex::encode(h(a2.as_bytes()))
      );
      let x = hex::encode(h(&a1(cnonce)));
      hex::encode(h(format!("{}:{}", x, y).as_bytes()))
    }

    pub fn keys(cnonce: &str) -> ([u8; 16], [u8; 16], [u8; 16], [u8; 16]) {
      let h_a1 = h(&a1(cnonce));
      let derive = |prefix: &[u8], magic: &str| {
        let mut input = prefix.to_vec();
        input.extend_from_slice(magic.as_bytes());
        h(&input)
      };
      (
        derive(&h_a1, "Digest session key to client-to-server signing key magic constant"),
        derive(&h_a1, "Digest session key to server-to-client signing key magic constant"),
        derive(&h_a1, "Digest H(A1) to client-to-server sealing key magic constant"),
        derive(&h_a1, "Digest H(A1) to server-to-client sealing key magic constant"),
      )
    }
  }

  fn field<'a>(response: &'a str, key: &str) -> &'a str {
    let start = response.find(key).unwrap() + key.len();
    let rest = &response[start..];
    let end = rest.find([',', '"']).unwrap_or(rest.len());
    &rest[..end]
  }

  #[tokio::test]
  async fn digest_md5_auth_conf_handshake_and_wrapped_frames() {
    let (client_io, mut server_io) = duplex(65536);
    let mechanism = Mechanism::DigestMd5(DigestMd5Mechanism::new(
      "",
      rfc2831::USERNAME,
      rfc2831::PASSWORD,
      "hive",
      "warehouse.example.com",
    ));
    let mut transport = SaslTransport::new(client_io, mechanism);

    let server = tokio::spawn(async move {
      let (status, payload) = read_sasl_frame(&mut server_io).await;
      assert_eq!(START, status);
      assert_eq!(b"DIGEST-MD5".to_vec(), payload);
      let (status, payload) = read_sasl_frame(&mut server_io).await;
      assert_eq!(OK, status);
      assert!(payload.is_empty());

      let challenge = format!(
        r#"realm="{}",nonce="{}",qop="auth-conf",cipher="rc4,rc4-56,rc4-40""#,
        rfc2831::REALM,
        rfc2831::NONCE
      );
      write_sasl_frame(&mut server_io, OK, challenge.as_bytes()).await;

      let (status, payload) = read_sasl_frame(&mut server_io).await;
      assert_eq!(OK, status);
      let response = String::from_utf8(payload).unwrap();
      let cnonce = field(&response, "cnonce=\"").to_string();
      assert_eq!(rfc2831::digest(&cnonce, true), field(&response, "response="));
      assert!(response.contains("cipher=rc4"));

      write_sasl_frame(&mut server_io, OK, format!("rspauth={}", rfc2831::digest(&cnonce, false)).as_bytes()).await;

      let (status, payload) = read_sasl_frame(&mut server_io).await;
      assert_eq!(COMPLETE, status);
      assert!(payload.is_empty());
      write_sasl_frame(&mut server_io, COMPLETE, b"").await;

      // Data phase: the server's context mirrors the client's keys.
      let (kic, kis, kcc, kcs) = rfc2831::keys(&cnonce);
      let mut ctx = DigestPrivacy::new(kis, kic, kcs, kcc);

      let frame = read_data_frame(&mut server_io).await;
      assert!(frame.len() >= b"select 1 from t".len() + 16);
      assert!(!frame.windows(7).any(|w| w == b"select "));
      assert_eq!(b"select 1 from t".to_vec(), ctx.unwrap(&frame).unwrap());

      write_data_frame(&mut server_io, &ctx.wrap(b"ok").unwrap()).await;
    });

    transport.open().await.unwrap();
    assert!(transport.is_open());

    transport.write(b"select 1 from t");
    transport.flush().await.unwrap();

    let mut reply = [0u8; 2];
    transport.read_exact(&mut reply).await.unwrap();
    assert_eq!(b"ok", &reply);
    server.await.unwrap();
  }
}
