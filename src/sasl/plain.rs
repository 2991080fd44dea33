use super::{QOP_AUTH, QOP_PROPERTY};
use crate::{Error, Result};

/// PLAIN (RFC 4616): a single `authzid NUL authcid NUL password` response.
pub struct PlainMechanism {
  completed: bool,
  authzid: String,
  username: String,
  password: String,
}

impl PlainMechanism {
  pub fn new(authzid: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
    Self {
      completed: false,
      authzid: authzid.into(),
      username: username.into(),
      password: password.into(),
    }
  }

  pub(crate) fn evaluate_challenge(&mut self, _challenge: &[u8]) -> Result<Vec<u8>> {
    if self.completed {
      return Err(Error::Sasl("PLAIN authentication already completed".into()));
    }
    self.completed = true;

    let mut response = Vec::with_capacity(self.authzid.len() + self.username.len() + self.password.len() + 2);
    response.extend_from_slice(self.authzid.as_bytes());
    response.push(0);
    response.extend_from_slice(self.username.as_bytes());
    response.push(0);
    response.extend_from_slice(self.password.as_bytes());
    Ok(response)
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
      Err(Error::Sasl("PLAIN supports neither integrity nor privacy".into()))
    } else {
      Err(Error::Sasl("PLAIN authentication not completed".into()))
    }
  }

  pub(crate) fn negotiated_property(&self, name: &str) -> Result<String> {
    if !self.completed {
      return Err(Error::Sasl("PLAIN authentication not completed".into()));
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
  use super::PlainMechanism;

  #[test]
  fn builds_initial_response() {
    let mut mechanism = PlainMechanism::new("", "anonymous", "hunter2");
    assert!(!mechanism.is_complete());
    let response = mechanism.evaluate_challenge(&[]).unwrap();
    assert_eq!(b"\x00anonymous\x00hunter2".to_vec(), response);
    assert!(mechanism.is_complete());
    assert_eq!("auth", mechanism.negotiated_property("sasl.qop").unwrap());
  }

  #[test]
  fn rejects_second_evaluate_and_security_layer() {
    let mut mechanism = PlainMechanism::new("admin", "user", "pw");
    mechanism.evaluate_challenge(&[]).unwrap();
    assert!(mechanism.evaluate_challenge(&[]).is_err());
    assert!(mechanism.wrap().is_err());
    assert!(mechanism.unwrap().is_err());
  }
}
