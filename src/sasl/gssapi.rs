use cross_krb5::{ClientCtx, InitiateFlags, K5Ctx, PendingClientCtx, Step};

use super::{QOP_AUTH, QOP_AUTH_CONF, QOP_AUTH_INT, QOP_PROPERTY};
use crate::{Error, Result};

const MUTUAL_AUTH: u32 = 0x2;
const REPLAY_PROT: u32 = 0x4;
const SEQUENCE: u32 = 0x8;
const CONFIDENTIALITY: u32 = 0x10;
const INTEGRITY: u32 = 0x20;

// QOP bits offered by the server in the first byte of its signed header.
const QOP_BIT_INTEGRITY: u8 = 0x02;
const QOP_BIT_PRIVACY: u8 = 0x04;

const MAX_RECV_BUFFER: u32 = 65536;

enum ContextState {
  Unstarted,
  Pending(PendingClientCtx),
  Established(ClientCtx),
}

/// GSSAPI/Kerberos mechanism. Ticket acquisition and wrap tokens are
/// delegated to the platform Kerberos library through `cross_krb5`.
pub struct GssapiMechanism {
  authzid: String,
  client_principal: Option<String>,
  service_principal: String,
  state: ContextState,
  completed: bool,
  integrity: bool,
  privacy: bool,
}

impl GssapiMechanism {
  /// `protocol` is the service part of the server principal (e.g. `hive`),
  /// `server_name` the host the service ticket is requested for.
  pub fn new(
    authzid: impl Into<String>,
    protocol: impl AsRef<str>,
    server_name: impl AsRef<str>,
    client_principal: Option<String>,
  ) -> Self {
    Self {
      authzid: authzid.into(),
      client_principal,
      service_principal: format!("{}/{}", protocol.as_ref(), server_name.as_ref()),
      state: ContextState::Unstarted,
      completed: false,
      integrity: false,
      privacy: false,
    }
  }

  pub(crate) fn evaluate_challenge(&mut self, challenge: &[u8]) -> Result<Vec<u8>> {
    if self.completed {
      return Err(Error::Sasl("GSSAPI authentication already completed".into()));
    }

    match std::mem::replace(&mut self.state, ContextState::Unstarted) {
      ContextState::Unstarted => {
        let flags =
          InitiateFlags::from_bits_retain(MUTUAL_AUTH | REPLAY_PROT | SEQUENCE | CONFIDENTIALITY | INTEGRITY);
        let (pending, token) = ClientCtx::new(
          flags,
          self.client_principal.as_deref(),
          &self.service_principal,
          None,
        )
        .map_err(|e| Error::Kerberos(e.to_string()))?;
        self.state = ContextState::Pending(pending);
        Ok(token.as_ref().to_vec())
      }
      ContextState::Pending(pending) => match pending.step(challenge).map_err(|e| Error::Kerberos(e.to_string()))? {
        Step::Finished((ctx, token)) => {
          self.state = ContextState::Established(ctx);
          Ok(token.map(|t| t.as_ref().to_vec()).unwrap_or_default())
        }
        Step::Continue((pending, token)) => {
          self.state = ContextState::Pending(pending);
          Ok(token.as_ref().to_vec())
        }
      },
      ContextState::Established(mut ctx) => {
        if challenge.is_empty() {
          self.state = ContextState::Established(ctx);
          return Ok(Vec::new());
        }
        // The server's signed QOP header: [qop:1][max message size:3 BE].
        let header = ctx.unwrap(challenge).map_err(|e| Error::Kerberos(e.to_string()))?;
        let header: [u8; 4] = header.as_ref()
          .try_into()
          .map_err(|_| Error::Sasl("GSSAPI negotiation header must be 4 bytes".into()))?;

        let qop_bits = header[0];
        let server_max = u32::from_be_bytes([0, header[1], header[2], header[3]]);
        if qop_bits & QOP_BIT_PRIVACY != 0 {
          self.integrity = true;
          self.privacy = true;
        } else if qop_bits & QOP_BIT_INTEGRITY != 0 {
          self.integrity = true;
        }

        let max_len = server_max.min(MAX_RECV_BUFFER);
        let mut reply = (((qop_bits as u32) << 24) | max_len).to_be_bytes().to_vec();
        reply.extend_from_slice(self.authzid.as_bytes());

        let signed = ctx
          .wrap(self.privacy, &reply)
          .map_err(|e| Error::Kerberos(e.to_string()))?;
        self.completed = true;
        self.state = ContextState::Established(ctx);
        Ok(signed.as_ref().to_vec())
      }
    }
  }

  pub(crate) fn is_complete(&self) -> bool {
    self.completed
  }

  fn established(&mut self) -> Result<&mut ClientCtx> {
    if !self.completed {
      return Err(Error::Sasl("GSSAPI authentication not completed".into()));
    }
    if !self.integrity {
      return Err(Error::Sasl("no security layer negotiated".into()));
    }
    match &mut self.state {
      ContextState::Established(ctx) => Ok(ctx),
      _ => Err(Error::Sasl("GSSAPI context disposed".into())),
    }
  }

  pub(crate) fn wrap(&mut self, outgoing: &[u8]) -> Result<Vec<u8>> {
    let privacy = self.privacy;
    let ctx = self.established()?;
    let wrapped = ctx.wrap(privacy, outgoing).map_err(|e| Error::Kerberos(e.to_string()))?;
    Ok(wrapped.as_ref().to_vec())
  }

  pub(crate) fn unwrap(&mut self, incoming: &[u8]) -> Result<Vec<u8>> {
    let ctx = self.established()?;
    let unwrapped = ctx.unwrap(incoming).map_err(|e| Error::Kerberos(e.to_string()))?;
    Ok(unwrapped.as_ref().to_vec())
  }

  pub(crate) fn negotiated_property(&self, name: &str) -> Result<String> {
    if !self.completed {
      return Err(Error::Sasl("GSSAPI authentication not completed".into()));
    }
    if name == QOP_PROPERTY {
      let qop = if self.privacy {
        QOP_AUTH_CONF
      } else if self.integrity {
        QOP_AUTH_INT
      } else {
        QOP_AUTH
      };
      Ok(qop.to_string())
    } else {
      Ok(String::new())
    }
  }

  pub(crate) fn dispose(&mut self) {
    self.state = ContextState::Unstarted;
  }
}

#[cfg(test)]
mod test {
  use super::GssapiMechanism;

  #[test]
  fn security_layer_requires_completion() {
    let mut mechanism = GssapiMechanism::new("", "hive", "warehouse.example.com", None);
    assert!(!mechanism.is_complete());
    assert!(mechanism.wrap(b"data").is_err());
    assert!(mechanism.unwrap(b"data").is_err());
    assert!(mechanism.negotiated_property("sasl.qop").is_err());
  }

  #[test]
  fn builds_service_principal() {
    let mechanism = GssapiMechanism::new("", "hive", "warehouse.example.com", Some("etl@EXAMPLE.COM".into()));
    assert_eq!("hive/warehouse.example.com", mechanism.service_principal);
  }
}
