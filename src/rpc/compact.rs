use bytes::{Buf, Bytes};

use crate::{Error, Result};

// Thrift compact-protocol type ids.
pub const CT_STOP: u8 = 0;
pub const CT_BOOLEAN_TRUE: u8 = 1;
pub const CT_BOOLEAN_FALSE: u8 = 2;
pub const CT_BYTE: u8 = 3;
pub const CT_I16: u8 = 4;
pub const CT_I32: u8 = 5;
pub const CT_I64: u8 = 6;
pub const CT_DOUBLE: u8 = 7;
pub const CT_BINARY: u8 = 8;
pub const CT_LIST: u8 = 9;
pub const CT_SET: u8 = 10;
pub const CT_MAP: u8 = 11;
pub const CT_STRUCT: u8 = 12;

/// Compact-protocol reader over an in-memory buffer. Only decoding is
/// needed: the server embeds column batches as compact-encoded blobs
/// inside binary-protocol fetch responses.
pub(crate) struct CompactReader {
  buf: Bytes,
  last_field_id: i16,
  field_id_stack: Vec<i16>,
  pending_bool: Option<bool>,
}

impl CompactReader {
  pub(crate) fn new(buf: Bytes) -> Self {
    Self {
      buf,
      last_field_id: 0,
      field_id_stack: Vec::new(),
      pending_bool: None,
    }
  }

  fn read_u8(&mut self) -> Result<u8> {
    if !self.buf.has_remaining() {
      return Err(Error::Rpc("column blob ended unexpectedly".into()));
    }
    Ok(self.buf.get_u8())
  }

  fn read_varint(&mut self) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0;
    loop {
      let byte = self.read_u8()?;
      value |= u64::from(byte & 0x7F) << shift;
      if byte & 0x80 == 0 {
        return Ok(value);
      }
      shift += 7;
      if shift > 63 {
        return Err(Error::Rpc("varint in column blob is too long".into()));
      }
    }
  }

  fn read_zigzag32(&mut self) -> Result<i32> {
    let v = self.read_varint()? as u32;
    Ok((v >> 1) as i32 ^ -((v & 1) as i32))
  }

  fn read_zigzag64(&mut self) -> Result<i64> {
    let v = self.read_varint()?;
    Ok((v >> 1) as i64 ^ -((v & 1) as i64))
  }

  pub(crate) fn read_struct_begin(&mut self) {
    self.field_id_stack.push(self.last_field_id);
    self.last_field_id = 0;
  }

  pub(crate) fn read_struct_end(&mut self) {
    self.last_field_id = self.field_id_stack.pop().unwrap_or(0);
  }

  /// Returns `None` at the struct's stop field. Field ids are
  /// delta-encoded against the previous field of the same struct.
  pub(crate) fn read_field_begin(&mut self) -> Result<Option<(u8, i16)>> {
    let byte = self.read_u8()?;
    if byte == CT_STOP {
      return Ok(None);
    }
    let delta = byte >> 4;
    let ctype = byte & 0x0F;
    let id = if delta == 0 {
      self.read_zigzag32()? as i16
    } else {
      self.last_field_id + delta as i16
    };
    self.last_field_id = id;
    match ctype {
      CT_BOOLEAN_TRUE => self.pending_bool = Some(true),
      CT_BOOLEAN_FALSE => self.pending_bool = Some(false),
      _ => {}
    }
    Ok(Some((ctype, id)))
  }

  pub(crate) fn read_bool(&mut self) -> Result<bool> {
    if let Some(v) = self.pending_bool.take() {
      return Ok(v);
    }
    Ok(self.read_u8()? == CT_BOOLEAN_TRUE)
  }

  pub(crate) fn read_byte(&mut self) -> Result<i8> {
    Ok(self.read_u8()? as i8)
  }

  pub(crate) fn read_i16(&mut self) -> Result<i16> {
    Ok(self.read_zigzag32()? as i16)
  }

  pub(crate) fn read_i32(&mut self) -> Result<i32> {
    self.read_zigzag32()
  }

  pub(crate) fn read_i64(&mut self) -> Result<i64> {
    self.read_zigzag64()
  }

  pub(crate) fn read_double(&mut self) -> Result<f64> {
    if self.buf.remaining() < 8 {
      return Err(Error::Rpc("column blob ended unexpectedly".into()));
    }
    Ok(self.buf.get_f64_le())
  }

  pub(crate) fn read_binary(&mut self) -> Result<Bytes> {
    let len = self.read_varint()? as usize;
    if self.buf.remaining() < len {
      return Err(Error::Rpc("column blob ended unexpectedly".into()));
    }
    Ok(self.buf.split_to(len))
  }

  pub(crate) fn read_string(&mut self) -> Result<String> {
    let bytes = self.read_binary()?;
    String::from_utf8(bytes.to_vec()).map_err(|_| Error::Rpc("string in column blob is not valid utf-8".into()))
  }

  /// Returns `(element type, length)`.
  pub(crate) fn read_list_begin(&mut self) -> Result<(u8, usize)> {
    let byte = self.read_u8()?;
    let element_type = byte & 0x0F;
    let short_len = byte >> 4;
    let len = if short_len == 0x0F {
      self.read_varint()? as usize
    } else {
      short_len as usize
    };
    Ok((element_type, len))
  }

  pub(crate) fn skip(&mut self, ctype: u8) -> Result<()> {
    match ctype {
      CT_BOOLEAN_TRUE | CT_BOOLEAN_FALSE => {
        self.read_bool()?;
      }
      CT_BYTE => {
        self.read_byte()?;
      }
      CT_I16 | CT_I32 | CT_I64 => {
        self.read_zigzag64()?;
      }
      CT_DOUBLE => {
        self.read_double()?;
      }
      CT_BINARY => {
        self.read_binary()?;
      }
      CT_LIST | CT_SET => {
        let (element_type, len) = self.read_list_begin()?;
        for _ in 0..len {
          self.skip(element_type)?;
        }
      }
      CT_MAP => {
        let len = self.read_varint()? as usize;
        if len > 0 {
          let kv = self.read_u8()?;
          for _ in 0..len {
            self.skip(kv >> 4)?;
            self.skip(kv & 0x0F)?;
          }
        }
      }
      CT_STRUCT => {
        self.read_struct_begin();
        while let Some((ftype, _)) = self.read_field_begin()? {
          self.skip(ftype)?;
        }
        self.read_struct_end();
      }
      other => {
        return Err(Error::Rpc(format!("cannot skip unknown compact type {}", other)));
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod test {
  use bytes::Bytes;

  use super::CompactReader;

  #[test]
  fn decodes_varints_and_zigzag() {
    // 300 varint-encoded, then zigzag(-3) and zigzag(4).
    let mut r = CompactReader::new(Bytes::from_static(&[0xAC, 0x02, 0x05, 0x08]));
    assert_eq!(300, r.read_varint().unwrap());
    assert_eq!(-3, r.read_i32().unwrap());
    assert_eq!(4, r.read_i32().unwrap());
  }

  #[test]
  fn decodes_short_and_long_list_headers() {
    // Short form: size 3, element type binary (8).
    let mut r = CompactReader::new(Bytes::from_static(&[0x38]));
    assert_eq!((8, 3), r.read_list_begin().unwrap());

    // Long form: size 20 as a varint after the 0xF marker.
    let mut r = CompactReader::new(Bytes::from_static(&[0xF8, 0x14]));
    assert_eq!((8, 20), r.read_list_begin().unwrap());
  }

  #[test]
  fn decodes_delta_field_ids() {
    // Field 1 (i32, zigzag 10), field 3 (i64, zigzag 2), stop.
    let mut r = CompactReader::new(Bytes::from_static(&[0x15, 0x14, 0x26, 0x04, 0x00]));
    r.read_struct_begin();
    assert_eq!(Some((5, 1)), r.read_field_begin().unwrap());
    assert_eq!(10, r.read_i32().unwrap());
    assert_eq!(Some((6, 3)), r.read_field_begin().unwrap());
    assert_eq!(2, r.read_i64().unwrap());
    assert_eq!(None, r.read_field_begin().unwrap());
    r.read_struct_end();
  }

  #[test]
  fn rejects_truncated_blobs() {
    let mut r = CompactReader::new(Bytes::from_static(&[0x96]));
    assert!(r.read_varint().is_err());
  }
}
