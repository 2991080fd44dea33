//! Hand-written client stub for the warehouse RPC service, speaking the
//! strict binary protocol over the (possibly SASL-framed) transport.

pub(crate) mod compact;
pub mod types;
pub(crate) mod wire;

use tracing::trace;

use crate::transport::{Io, Transport};
use crate::{Error, Result};

use types::{
  TCloseOperationReq, TCloseOperationResp, TCloseSessionReq, TCloseSessionResp, TExecuteStatementReq,
  TExecuteStatementResp, TFetchResultsReq, TFetchResultsResp, TGetOperationStatusReq, TGetOperationStatusResp,
  TGetResultSetMetadataReq, TGetResultSetMetadataResp, TOpenSessionReq, TOpenSessionResp,
};
use wire::{MessageReader, MessageWriter, MSG_EXCEPTION, MSG_REPLY, T_I32, T_STRING, T_STRUCT};

/// A remote exception raised by the RPC layer itself (unknown method,
/// internal error, ...) rather than by the service.
#[derive(Debug, Default)]
struct TApplicationException {
  message: Option<String>,
  exception_type: i32,
}

impl TApplicationException {
  async fn read<S: Io>(r: &mut MessageReader<'_, S>) -> Result<Self> {
    let mut exception = Self::default();
    while let Some((ftype, id)) = r.read_field_begin().await? {
      match (id, ftype) {
        (1, T_STRING) => exception.message = Some(r.read_string().await?),
        (2, T_I32) => exception.exception_type = r.read_i32().await?,
        (_, t) => r.skip(t).await?,
      }
    }
    Ok(exception)
  }
}

/// RPC client over one transport. One request is in flight at a time;
/// replies are matched on method name and sequence id.
pub struct Client<S> {
  transport: Transport<S>,
  seq_id: i32,
}

impl<S: Io> Client<S> {
  pub fn new(transport: Transport<S>) -> Self {
    Self { transport, seq_id: 0 }
  }

  pub async fn open_session(&mut self, req: TOpenSessionReq) -> Result<TOpenSessionResp> {
    let seq_id = self.send("OpenSession", |w| req.write(w)).await?;
    let mut r = self.receive("OpenSession", seq_id).await?;
    let mut resp = None;
    while let Some((ftype, id)) = r.read_field_begin().await? {
      match (id, ftype) {
        (0, T_STRUCT) => resp = Some(TOpenSessionResp::read(&mut r).await?),
        (_, t) => r.skip(t).await?,
      }
    }
    missing_result(resp)
  }

  pub async fn close_session(&mut self, req: TCloseSessionReq) -> Result<TCloseSessionResp> {
    let seq_id = self.send("CloseSession", |w| req.write(w)).await?;
    let mut r = self.receive("CloseSession", seq_id).await?;
    let mut resp = None;
    while let Some((ftype, id)) = r.read_field_begin().await? {
      match (id, ftype) {
        (0, T_STRUCT) => resp = Some(TCloseSessionResp::read(&mut r).await?),
        (_, t) => r.skip(t).await?,
      }
    }
    missing_result(resp)
  }

  pub async fn execute_statement(&mut self, req: TExecuteStatementReq) -> Result<TExecuteStatementResp> {
    let seq_id = self.send("ExecuteStatement", |w| req.write(w)).await?;
    let mut r = self.receive("ExecuteStatement", seq_id).await?;
    let mut resp = None;
    while let Some((ftype, id)) = r.read_field_begin().await? {
      match (id, ftype) {
        (0, T_STRUCT) => resp = Some(TExecuteStatementResp::read(&mut r).await?),
        (_, t) => r.skip(t).await?,
      }
    }
    missing_result(resp)
  }

  pub async fn get_operation_status(&mut self, req: TGetOperationStatusReq) -> Result<TGetOperationStatusResp> {
    let seq_id = self.send("GetOperationStatus", |w| req.write(w)).await?;
    let mut r = self.receive("GetOperationStatus", seq_id).await?;
    let mut resp = None;
    while let Some((ftype, id)) = r.read_field_begin().await? {
      match (id, ftype) {
        (0, T_STRUCT) => resp = Some(TGetOperationStatusResp::read(&mut r).await?),
        (_, t) => r.skip(t).await?,
      }
    }
    missing_result(resp)
  }

  pub async fn get_result_set_metadata(&mut self, req: TGetResultSetMetadataReq) -> Result<TGetResultSetMetadataResp> {
    let seq_id = self.send("GetResultSetMetadata", |w| req.write(w)).await?;
    let mut r = self.receive("GetResultSetMetadata", seq_id).await?;
    let mut resp = None;
    while let Some((ftype, id)) = r.read_field_begin().await? {
      match (id, ftype) {
        (0, T_STRUCT) => resp = Some(TGetResultSetMetadataResp::read(&mut r).await?),
        (_, t) => r.skip(t).await?,
      }
    }
    missing_result(resp)
  }

  pub async fn fetch_results(&mut self, req: TFetchResultsReq) -> Result<TFetchResultsResp> {
    let seq_id = self.send("FetchResults", |w| req.write(w)).await?;
    let mut r = self.receive("FetchResults", seq_id).await?;
    let mut resp = None;
    while let Some((ftype, id)) = r.read_field_begin().await? {
      match (id, ftype) {
        (0, T_STRUCT) => resp = Some(TFetchResultsResp::read(&mut r).await?),
        (_, t) => r.skip(t).await?,
      }
    }
    missing_result(resp)
  }

  pub async fn close_operation(&mut self, req: TCloseOperationReq) -> Result<TCloseOperationResp> {
    let seq_id = self.send("CloseOperation", |w| req.write(w)).await?;
    let mut r = self.receive("CloseOperation", seq_id).await?;
    let mut resp = None;
    while let Some((ftype, id)) = r.read_field_begin().await? {
      match (id, ftype) {
        (0, T_STRUCT) => resp = Some(TCloseOperationResp::read(&mut r).await?),
        (_, t) => r.skip(t).await?,
      }
    }
    missing_result(resp)
  }

  pub async fn close_transport(&mut self) -> Result<()> {
    self.transport.close().await
  }

  /// Writes one method call: the request struct is field 1 of the
  /// method's args struct.
  async fn send(&mut self, name: &str, write_req: impl FnOnce(&mut MessageWriter)) -> Result<i32> {
    self.seq_id += 1;
    let seq_id = self.seq_id;

    let mut w = MessageWriter::call(name, seq_id);
    w.field_begin(T_STRUCT, 1);
    write_req(&mut w);
    w.stop();
    let message = w.finish();

    trace!(method = name, seq_id, len = message.len(), "rpc call");
    self.transport.write(&message).await?;
    self.transport.flush().await?;
    Ok(seq_id)
  }

  /// Reads the reply envelope, decoding remote exceptions and verifying
  /// that the reply matches the call just sent.
  async fn receive(&mut self, name: &str, seq_id: i32) -> Result<MessageReader<'_, S>> {
    let mut r = MessageReader::new(&mut self.transport);
    let (reply_name, message_type, reply_seq_id) = r.read_message_begin().await?;
    if message_type == MSG_EXCEPTION {
      let exception = TApplicationException::read(&mut r).await?;
      return Err(Error::Rpc(format!(
        "{} failed: {} (type {})",
        name,
        exception.message.unwrap_or_else(|| "unknown error".into()),
        exception.exception_type
      )));
    }
    if message_type != MSG_REPLY {
      return Err(Error::Rpc(format!("unexpected message type {}", message_type)));
    }
    if reply_name != name || reply_seq_id != seq_id {
      return Err(Error::Rpc(format!(
        "reply out of sync: got {}#{}, expected {}#{}",
        reply_name, reply_seq_id, name, seq_id
      )));
    }
    Ok(r)
  }
}

fn missing_result<T>(resp: Option<T>) -> Result<T> {
  resp.ok_or_else(|| Error::Rpc("reply carries no result".into()))
}
