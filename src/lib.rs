mod conn;
mod rows;
mod rpc;
pub mod sasl;
mod stmt;
mod stream;
#[cfg(test)]
mod testutil;
pub mod transport;

pub use conn::{ConnParams, Connection, DEFAULT_FETCH_SIZE};
pub use rows::{Row, Rows, Value};
pub use rpc::types::{TColumnDesc, TOperationHandle, TSessionHandle, TStatus, TTypeId};
pub use stmt::Statement;
pub use stream::Stream;
pub use transport::{SaslTransport, Transport};

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("io error: {0}")]
  Io(#[from] io::Error),
  #[error("invalid connection url: {0}")]
  Url(String),
  #[error("sasl: {0}")]
  Sasl(String),
  #[error("kerberos: {0}")]
  Kerberos(String),
  #[error("rpc protocol error: {0}")]
  Rpc(String),
  #[error("error from server: {0}")]
  Server(String),
  #[error("operation failed: {0}")]
  Operation(String),
  #[error("{0} is not supported")]
  Unsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
