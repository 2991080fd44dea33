use hmac::{Hmac, Mac};
use md5::Md5;
use rc4::{consts::U16, KeyInit, Rc4, StreamCipher};

use crate::{Error, Result};

type HmacMd5 = Hmac<Md5>;

const MAC_HMAC_LEN: usize = 10;
const MAC_MSG_TYPE: [u8; 2] = [0x00, 0x01];
// HMAC(10) + message type(2) + sequence number(4).
const MAC_TRAILER_LEN: usize = 16;

/// Per-message transform shared by the DIGEST-MD5 integrity and privacy
/// layers. The mechanism owns one of these for the session's lifetime.
pub(crate) trait SecurityCtx: Send {
  fn wrap(&mut self, msg: &[u8]) -> Result<Vec<u8>>;
  fn unwrap(&mut self, msg: &[u8]) -> Result<Vec<u8>>;
}

/// HMAC(ki, seqnum || msg), truncated to 10 bytes per RFC 2831.
fn msg_hmac(key: &[u8; 16], seq: [u8; 4], msg: &[u8]) -> [u8; MAC_HMAC_LEN] {
  let mut mac = <HmacMd5 as Mac>::new_from_slice(key).expect("hmac-md5 accepts keys of any length");
  mac.update(&seq);
  mac.update(msg);
  let digest = mac.finalize().into_bytes();
  let mut out = [0u8; MAC_HMAC_LEN];
  out.copy_from_slice(&digest[..MAC_HMAC_LEN]);
  out
}

/// auth-int: append `HMAC[..10] || {0x00,0x01} || seqnum` to each message.
pub(crate) struct DigestIntegrity {
  send_seq: u32,
  read_seq: u32,
  kic: [u8; 16],
  kis: [u8; 16],
}

impl DigestIntegrity {
  pub(crate) fn new(kic: [u8; 16], kis: [u8; 16]) -> Self {
    Self {
      send_seq: 0,
      read_seq: 0,
      kic,
      kis,
    }
  }
}

impl SecurityCtx for DigestIntegrity {
  fn wrap(&mut self, msg: &[u8]) -> Result<Vec<u8>> {
    if msg.is_empty() {
      return Ok(Vec::new());
    }
    let seq = self.send_seq.to_be_bytes();
    let mut wrapped = Vec::with_capacity(msg.len() + MAC_TRAILER_LEN);
    wrapped.extend_from_slice(msg);
    wrapped.extend_from_slice(&msg_hmac(&self.kic, seq, msg));
    wrapped.extend_from_slice(&MAC_MSG_TYPE);
    wrapped.extend_from_slice(&seq);
    self.send_seq = self.send_seq.wrapping_add(1);
    Ok(wrapped)
  }

  fn unwrap(&mut self, msg: &[u8]) -> Result<Vec<u8>> {
    if msg.is_empty() {
      return Ok(Vec::new());
    }
    if msg.len() < MAC_TRAILER_LEN {
      return Err(Error::Sasl("sasl frame shorter than its integrity trailer".into()));
    }
    let data_len = msg.len() - MAC_TRAILER_LEN;
    let seq = self.read_seq.to_be_bytes();
    let expected = msg_hmac(&self.kis, seq, &msg[..data_len]);

    let (data, trailer) = msg.split_at(data_len);
    if trailer[..MAC_HMAC_LEN] != expected
      || trailer[MAC_HMAC_LEN..MAC_HMAC_LEN + 2] != MAC_MSG_TYPE
      || trailer[MAC_HMAC_LEN + 2..] != seq
    {
      return Err(Error::Sasl("HMAC integrity check failed".into()));
    }
    self.read_seq = self.read_seq.wrapping_add(1);
    Ok(data.to_vec())
  }
}

/// auth-conf: RC4-encrypt `msg || HMAC[..10]`, then append the plaintext
/// `{0x00,0x01} || seqnum` trailer. The RC4 streams persist across messages.
pub(crate) struct DigestPrivacy {
  send_seq: u32,
  read_seq: u32,
  kic: [u8; 16],
  kis: [u8; 16],
  encryptor: Rc4<U16>,
  decryptor: Rc4<U16>,
}

impl DigestPrivacy {
  pub(crate) fn new(kic: [u8; 16], kis: [u8; 16], kcc: [u8; 16], kcs: [u8; 16]) -> Self {
    Self {
      send_seq: 0,
      read_seq: 0,
      kic,
      kis,
      encryptor: Rc4::new(&kcc.into()),
      decryptor: Rc4::new(&kcs.into()),
    }
  }
}

impl SecurityCtx for DigestPrivacy {
  fn wrap(&mut self, msg: &[u8]) -> Result<Vec<u8>> {
    if msg.is_empty() {
      return Ok(Vec::new());
    }
    let seq = self.send_seq.to_be_bytes();
    let mac = msg_hmac(&self.kic, seq, msg);

    let mut wrapped = Vec::with_capacity(msg.len() + MAC_TRAILER_LEN);
    wrapped.extend_from_slice(msg);
    wrapped.extend_from_slice(&mac);
    self.encryptor.apply_keystream(&mut wrapped);
    wrapped.extend_from_slice(&MAC_MSG_TYPE);
    wrapped.extend_from_slice(&seq);
    self.send_seq = self.send_seq.wrapping_add(1);
    Ok(wrapped)
  }

  fn unwrap(&mut self, msg: &[u8]) -> Result<Vec<u8>> {
    if msg.is_empty() {
      return Ok(Vec::new());
    }
    if msg.len() < MAC_TRAILER_LEN {
      return Err(Error::Sasl("sasl frame shorter than its privacy trailer".into()));
    }
    let encrypted_len = msg.len() - MAC_MSG_TYPE.len() - 4;
    let mut decrypted = msg[..encrypted_len].to_vec();
    self.decryptor.apply_keystream(&mut decrypted);

    let data_len = encrypted_len - MAC_HMAC_LEN;
    let seq = self.read_seq.to_be_bytes();
    let expected = msg_hmac(&self.kis, seq, &decrypted[..data_len]);

    let trailer = &msg[encrypted_len..];
    if decrypted[data_len..] != expected || trailer[..2] != MAC_MSG_TYPE || trailer[2..] != seq {
      return Err(Error::Sasl("HMAC privacy check failed".into()));
    }
    self.read_seq = self.read_seq.wrapping_add(1);
    decrypted.truncate(data_len);
    Ok(decrypted)
  }
}
