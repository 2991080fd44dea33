use bytes::{BufMut, Bytes, BytesMut};

use crate::transport::{Io, Transport};
use crate::{Error, Result};

// Thrift binary-protocol type ids.
pub const T_STOP: u8 = 0;
pub const T_BOOL: u8 = 2;
pub const T_BYTE: u8 = 3;
pub const T_DOUBLE: u8 = 4;
pub const T_I16: u8 = 6;
pub const T_I32: u8 = 8;
pub const T_I64: u8 = 10;
pub const T_STRING: u8 = 11;
pub const T_STRUCT: u8 = 12;
pub const T_MAP: u8 = 13;
pub const T_SET: u8 = 14;
pub const T_LIST: u8 = 15;

pub const MSG_CALL: u8 = 1;
pub const MSG_REPLY: u8 = 2;
pub const MSG_EXCEPTION: u8 = 3;

const VERSION_1: u32 = 0x8001_0000;
const VERSION_MASK: u32 = 0xFFFF_0000;

/// Serializes one strict binary-protocol message into an owned buffer.
pub(crate) struct MessageWriter {
  buf: BytesMut,
}

impl MessageWriter {
  pub(crate) fn new(name: &str, message_type: u8, seq_id: i32) -> Self {
    let mut buf = BytesMut::new();
    buf.put_u32(VERSION_1 | message_type as u32);
    buf.put_u32(name.len() as u32);
    buf.put_slice(name.as_bytes());
    buf.put_i32(seq_id);
    Self { buf }
  }

  pub(crate) fn call(name: &str, seq_id: i32) -> Self {
    Self::new(name, MSG_CALL, seq_id)
  }

  pub(crate) fn field_begin(&mut self, ttype: u8, id: i16) {
    self.buf.put_u8(ttype);
    self.buf.put_i16(id);
  }

  pub(crate) fn stop(&mut self) {
    self.buf.put_u8(T_STOP);
  }

  pub(crate) fn put_bool(&mut self, v: bool) {
    self.buf.put_u8(v as u8);
  }

  pub(crate) fn put_i16(&mut self, v: i16) {
    self.buf.put_i16(v);
  }

  pub(crate) fn put_i32(&mut self, v: i32) {
    self.buf.put_i32(v);
  }

  pub(crate) fn put_i64(&mut self, v: i64) {
    self.buf.put_i64(v);
  }

  pub(crate) fn put_string(&mut self, v: &str) {
    self.put_binary(v.as_bytes());
  }

  pub(crate) fn put_binary(&mut self, v: &[u8]) {
    self.buf.put_u32(v.len() as u32);
    self.buf.put_slice(v);
  }

  pub(crate) fn map_begin(&mut self, key_type: u8, value_type: u8, len: usize) {
    self.buf.put_u8(key_type);
    self.buf.put_u8(value_type);
    self.buf.put_u32(len as u32);
  }

  pub(crate) fn list_begin(&mut self, element_type: u8, len: usize) {
    self.buf.put_u8(element_type);
    self.buf.put_u32(len as u32);
  }

  pub(crate) fn finish(self) -> Bytes {
    self.buf.freeze()
  }
}

/// Demand-driven binary-protocol reader. Bytes are pulled from the
/// transport as the message is parsed, so a response may arrive split
/// across any number of frames.
pub(crate) struct MessageReader<'a, S> {
  transport: &'a mut Transport<S>,
}

impl<'a, S: Io> MessageReader<'a, S> {
  pub(crate) fn new(transport: &'a mut Transport<S>) -> Self {
    Self { transport }
  }

  pub(crate) async fn read_u8(&mut self) -> Result<u8> {
    let mut buf = [0u8; 1];
    self.transport.read_exact(&mut buf).await?;
    Ok(buf[0])
  }

  pub(crate) async fn read_bool(&mut self) -> Result<bool> {
    Ok(self.read_u8().await? != 0)
  }

  pub(crate) async fn read_i16(&mut self) -> Result<i16> {
    let mut buf = [0u8; 2];
    self.transport.read_exact(&mut buf).await?;
    Ok(i16::from_be_bytes(buf))
  }

  pub(crate) async fn read_i32(&mut self) -> Result<i32> {
    let mut buf = [0u8; 4];
    self.transport.read_exact(&mut buf).await?;
    Ok(i32::from_be_bytes(buf))
  }

  pub(crate) async fn read_i64(&mut self) -> Result<i64> {
    let mut buf = [0u8; 8];
    self.transport.read_exact(&mut buf).await?;
    Ok(i64::from_be_bytes(buf))
  }

  pub(crate) async fn read_f64(&mut self) -> Result<f64> {
    let mut buf = [0u8; 8];
    self.transport.read_exact(&mut buf).await?;
    Ok(f64::from_be_bytes(buf))
  }

  async fn read_len(&mut self) -> Result<usize> {
    let len = self.read_i32().await?;
    usize::try_from(len).map_err(|_| Error::Rpc(format!("negative length {} on the wire", len)))
  }

  pub(crate) async fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0; len];
    self.transport.read_exact(&mut buf).await?;
    Ok(buf)
  }

  pub(crate) async fn read_binary(&mut self) -> Result<Vec<u8>> {
    let len = self.read_len().await?;
    self.read_bytes(len).await
  }

  pub(crate) async fn read_string(&mut self) -> Result<String> {
    let bytes = self.read_binary().await?;
    String::from_utf8(bytes).map_err(|_| Error::Rpc("string on the wire is not valid utf-8".into()))
  }

  /// Returns `(name, message type, sequence id)`.
  pub(crate) async fn read_message_begin(&mut self) -> Result<(String, u8, i32)> {
    let first = self.read_i32().await? as u32;
    if first & VERSION_MASK != VERSION_1 {
      return Err(Error::Rpc(format!("bad rpc message version: {:#010x}", first)));
    }
    let message_type = (first & 0xFF) as u8;
    let name = self.read_string().await?;
    let seq_id = self.read_i32().await?;
    Ok((name, message_type, seq_id))
  }

  /// Returns `None` at the struct's stop field.
  pub(crate) async fn read_field_begin(&mut self) -> Result<Option<(u8, i16)>> {
    let ttype = self.read_u8().await?;
    if ttype == T_STOP {
      return Ok(None);
    }
    let id = self.read_i16().await?;
    Ok(Some((ttype, id)))
  }

  pub(crate) async fn read_list_begin(&mut self) -> Result<(u8, usize)> {
    let element_type = self.read_u8().await?;
    let len = self.read_len().await?;
    Ok((element_type, len))
  }

  pub(crate) async fn read_map_begin(&mut self) -> Result<(u8, u8, usize)> {
    let key_type = self.read_u8().await?;
    let value_type = self.read_u8().await?;
    let len = self.read_len().await?;
    Ok((key_type, value_type, len))
  }

  /// Skips a value of the given type, iteratively; nested structs and
  /// collections are tracked on an explicit work stack.
  pub(crate) async fn skip(&mut self, ttype: u8) -> Result<()> {
    enum Pending {
      Value(u8),
      Struct,
      List { element_type: u8, remaining: usize },
      Map { key_type: u8, value_type: u8, remaining: usize },
    }

    let mut stack = vec![Pending::Value(ttype)];
    while let Some(pending) = stack.pop() {
      match pending {
        Pending::Value(T_BOOL) | Pending::Value(T_BYTE) => {
          self.read_u8().await?;
        }
        Pending::Value(T_I16) => {
          self.read_i16().await?;
        }
        Pending::Value(T_I32) => {
          self.read_i32().await?;
        }
        Pending::Value(T_I64) => {
          self.read_i64().await?;
        }
        Pending::Value(T_DOUBLE) => {
          self.read_f64().await?;
        }
        Pending::Value(T_STRING) => {
          self.read_binary().await?;
        }
        Pending::Value(T_STRUCT) => stack.push(Pending::Struct),
        Pending::Value(T_LIST) | Pending::Value(T_SET) => {
          let (element_type, remaining) = self.read_list_begin().await?;
          stack.push(Pending::List { element_type, remaining });
        }
        Pending::Value(T_MAP) => {
          let (key_type, value_type, remaining) = self.read_map_begin().await?;
          stack.push(Pending::Map {
            key_type,
            value_type,
            remaining,
          });
        }
        Pending::Value(other) => {
          return Err(Error::Rpc(format!("cannot skip unknown wire type {}", other)));
        }
        Pending::Struct => {
          if let Some((ttype, _)) = self.read_field_begin().await? {
            stack.push(Pending::Struct);
            stack.push(Pending::Value(ttype));
          }
        }
        Pending::List { element_type, remaining } => {
          if remaining > 0 {
            stack.push(Pending::List {
              element_type,
              remaining: remaining - 1,
            });
            stack.push(Pending::Value(element_type));
          }
        }
        Pending::Map {
          key_type,
          value_type,
          remaining,
        } => {
          if remaining > 0 {
            stack.push(Pending::Map {
              key_type,
              value_type,
              remaining: remaining - 1,
            });
            stack.push(Pending::Value(value_type));
            stack.push(Pending::Value(key_type));
          }
        }
      }
    }
    Ok(())
  }
}
