//! Scripted in-memory RPC peers for unit tests.

use tokio::io::DuplexStream;

use crate::conn::Connection;
use crate::rpc::types::{TSessionHandle, SUCCESS_STATUS};
use crate::rpc::wire::{MessageReader, MessageWriter, MSG_CALL, MSG_REPLY, T_I32, T_STRUCT};
use crate::rpc::Client;
use crate::stream::Stream;
use crate::transport::Transport;

/// A connection whose transport ends in an in-memory pipe, plus the
/// server side of that pipe.
pub(crate) fn connection_pair(fetch_size: i64, server_protocol: i32) -> (Connection, Transport<DuplexStream>) {
  let (client_io, server_io) = tokio::io::duplex(1 << 20);
  let conn = Connection {
    client: Client::new(Transport::Raw(Stream::Duplex(client_io))),
    session_handle: TSessionHandle::default(),
    server_protocol,
    fetch_size,
  };
  (conn, Transport::Raw(server_io))
}

/// Reads one method call, consuming its args; returns `(name, seq id)`.
pub(crate) async fn read_call(transport: &mut Transport<DuplexStream>) -> (String, i32) {
  let mut r = MessageReader::new(transport);
  let (name, message_type, seq_id) = r.read_message_begin().await.unwrap();
  assert_eq!(MSG_CALL, message_type);
  while let Some((ftype, _)) = r.read_field_begin().await.unwrap() {
    r.skip(ftype).await.unwrap();
  }
  (name, seq_id)
}

/// Writes one reply message; `body` writes the result struct's fields
/// (the trailing stop for the result struct and the args struct are
/// appended here).
pub(crate) async fn write_reply(
  transport: &mut Transport<DuplexStream>,
  name: &str,
  seq_id: i32,
  body: impl FnOnce(&mut MessageWriter),
) {
  let mut w = MessageWriter::new(name, MSG_REPLY, seq_id);
  w.field_begin(T_STRUCT, 0);
  body(&mut w);
  w.stop();
  w.stop();
  transport.write(&w.finish()).await.unwrap();
  transport.flush().await.unwrap();
}

/// Writes a SUCCESS `TStatus` as field 1 of the surrounding struct.
pub(crate) fn write_success_status(w: &mut MessageWriter) {
  w.field_begin(T_STRUCT, 1);
  w.field_begin(T_I32, 1);
  w.put_i32(SUCCESS_STATUS);
  w.stop();
}

/// Writes a minimal operation handle as struct field `id`.
pub(crate) fn write_operation_handle(w: &mut MessageWriter, id: i16) {
  use crate::rpc::wire::{T_BOOL, T_STRING};

  w.field_begin(T_STRUCT, id);
  w.field_begin(T_STRUCT, 1);
  w.field_begin(T_STRING, 1);
  w.put_binary(b"guid");
  w.field_begin(T_STRING, 2);
  w.put_binary(b"secret");
  w.stop();
  w.field_begin(T_I32, 2);
  w.put_i32(0);
  w.field_begin(T_BOOL, 3);
  w.put_bool(true);
  w.stop();
}
