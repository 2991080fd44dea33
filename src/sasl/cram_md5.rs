use hmac::{Hmac, Mac};
use md5::Md5;

use super::{QOP_AUTH, QOP_PROPERTY};
use crate::{Error, Result};

type HmacMd5 = Hmac<Md5>;

/// HMAC-MD5 over `text`, hex-encoded, per RFC 2104 (keys longer than the
/// 64-byte block are replaced by their MD5 digest).
pub(crate) fn hmac_md5_hex(key: &[u8], text: &[u8]) -> String {
  let mut mac = HmacMd5::new_from_slice(key).expect("hmac-md5 accepts keys of any length");
  mac.update(text);
  hex::encode(mac.finalize().into_bytes())
}

/// CRAM-MD5 (RFC 2195): one challenge, answered with `username HEX(HMAC)`.
pub struct CramMd5Mechanism {
  completed: bool,
  username: String,
  password: String,
}

impl CramMd5Mechanism {
  pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
    Self {
      completed: false,
      username: username.into(),
      password: password.into(),
    }
  }

  pub(crate) fn evaluate_challenge(&mut self, challenge: &[u8]) -> Result<Vec<u8>> {
    if self.completed {
      return Err(Error::Sasl("CRAM-MD5 authentication already completed".into()));
    }
    let digest = hmac_md5_hex(self.password.as_bytes(), challenge);
    self.completed = true;
    Ok(format!("{} {}", self.username, digest).into_bytes())
  }

  pub(crate) fn is_complete(&self) -> bool {
    self.completed
  }

  pub(crate) fn wrap(&self) -> Result<Vec<u8>> {
    self.no_security_layer()
  }

  pub(crate) fn unwrap(&self) -> Result<Vec<u8>> {
    self.no_security_layer()
  }

  fn no_security_layer(&self) -> Result<Vec<u8>> {
    if self.completed {
      Err(Error::Sasl("CRAM-MD5 supports neither integrity nor privacy".into()))
    } else {
      Err(Error::Sasl("CRAM-MD5 authentication not completed".into()))
    }
  }

  pub(crate) fn negotiated_property(&self, name: &str) -> Result<String> {
    if !self.completed {
      return Err(Error::Sasl("CRAM-MD5 authentication not completed".into()));
    }
    if name == QOP_PROPERTY {
      Ok(QOP_AUTH.to_string())
    } else {
      Ok(String::new())
    }
  }

  pub(crate) fn dispose(&mut self) {
    self.password.clear();
  }
}

#[cfg(test)]
mod test {
  use md5::{Digest, Md5};

  use super::{hmac_md5_hex, CramMd5Mechanism};

  #[test]
  fn hmac_md5_reference_vector() {
    // RFC 2202 test case 2.
    assert_eq!(
      "750c783e6ab0b503eaa86e310a5db738",
      hmac_md5_hex(b"Jefe", b"what do ya want for nothing?")
    );
  }

  #[test]
  fn long_keys_are_digested() {
    let key = [0xAAu8; 80];
    let digested: [u8; 16] = Md5::digest(key).into();
    assert_eq!(
      hmac_md5_hex(&key, b"Test Using Larger Than Block-Size Key"),
      hmac_md5_hex(&digested, b"Test Using Larger Than Block-Size Key"),
    );
  }

  #[test]
  fn answers_challenge_once() {
    let mut mechanism = CramMd5Mechanism::new("joe", "tanstaaftanstaaf");
    let response = mechanism.evaluate_challenge(b"<1896.697170952@postoffice.reston.mci.net>").unwrap();
    let response = String::from_utf8(response).unwrap();
    let (user, digest) = response.split_once(' ').unwrap();
    assert_eq!("joe", user);
    assert_eq!(32, digest.len());
    assert!(mechanism.is_complete());
    assert!(mechanism.evaluate_challenge(b"again").is_err());
  }
}
