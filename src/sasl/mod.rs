//! SASL client mechanisms used to authenticate the session channel.
//!
//! Each mechanism produces challenge responses during the handshake and,
//! once a security layer has been negotiated, wraps and unwraps every data
//! frame that crosses the transport.

mod cram_md5;
mod digest_md5;
pub(crate) mod digest_security;
#[cfg(feature = "kerberos")]
mod gssapi;
mod plain;

pub use cram_md5::CramMd5Mechanism;
pub use digest_md5::DigestMd5Mechanism;
#[cfg(feature = "kerberos")]
pub use gssapi::GssapiMechanism;
pub use plain::PlainMechanism;

use crate::Result;

/// Quality-of-protection levels, as exchanged on the wire.
pub const QOP_AUTH: &str = "auth";
pub const QOP_AUTH_INT: &str = "auth-int";
pub const QOP_AUTH_CONF: &str = "auth-conf";

/// Property name under which the negotiated QOP is reported.
pub const QOP_PROPERTY: &str = "sasl.qop";

/// A SASL client mechanism.
///
/// All four variants share the same capability surface; the transport only
/// ever talks to this enum.
pub enum Mechanism {
  Plain(PlainMechanism),
  CramMd5(CramMd5Mechanism),
  DigestMd5(DigestMd5Mechanism),
  #[cfg(feature = "kerberos")]
  Gssapi(GssapiMechanism),
}

impl Mechanism {
  pub fn name(&self) -> &'static str {
    match self {
      Mechanism::Plain(_) => "PLAIN",
      Mechanism::CramMd5(_) => "CRAM-MD5",
      Mechanism::DigestMd5(_) => "DIGEST-MD5",
      #[cfg(feature = "kerberos")]
      Mechanism::Gssapi(_) => "GSSAPI",
    }
  }

  /// Whether the mechanism sends a response before the first server challenge.
  pub fn has_initial_response(&self) -> bool {
    match self {
      Mechanism::Plain(_) => true,
      Mechanism::CramMd5(_) | Mechanism::DigestMd5(_) => false,
      #[cfg(feature = "kerberos")]
      Mechanism::Gssapi(_) => true,
    }
  }

  /// Consumes a server challenge and produces the next client response.
  pub fn evaluate_challenge(&mut self, challenge: &[u8]) -> Result<Vec<u8>> {
    match self {
      Mechanism::Plain(m) => m.evaluate_challenge(challenge),
      Mechanism::CramMd5(m) => m.evaluate_challenge(challenge),
      Mechanism::DigestMd5(m) => m.evaluate_challenge(challenge),
      #[cfg(feature = "kerberos")]
      Mechanism::Gssapi(m) => m.evaluate_challenge(challenge),
    }
  }

  pub fn is_complete(&self) -> bool {
    match self {
      Mechanism::Plain(m) => m.is_complete(),
      Mechanism::CramMd5(m) => m.is_complete(),
      Mechanism::DigestMd5(m) => m.is_complete(),
      #[cfg(feature = "kerberos")]
      Mechanism::Gssapi(m) => m.is_complete(),
    }
  }

  /// Applies the negotiated security layer to an outgoing frame.
  ///
  /// Only callable once authentication completed and a QOP of integrity or
  /// privacy was negotiated.
  pub fn wrap(&mut self, outgoing: &[u8]) -> Result<Vec<u8>> {
    match self {
      Mechanism::Plain(m) => m.wrap(),
      Mechanism::CramMd5(m) => m.wrap(),
      Mechanism::DigestMd5(m) => m.wrap(outgoing),
      #[cfg(feature = "kerberos")]
      Mechanism::Gssapi(m) => m.wrap(outgoing),
    }
  }

  /// Removes the negotiated security layer from an incoming frame.
  pub fn unwrap(&mut self, incoming: &[u8]) -> Result<Vec<u8>> {
    match self {
      Mechanism::Plain(m) => m.unwrap(),
      Mechanism::CramMd5(m) => m.unwrap(),
      Mechanism::DigestMd5(m) => m.unwrap(incoming),
      #[cfg(feature = "kerberos")]
      Mechanism::Gssapi(m) => m.unwrap(incoming),
    }
  }

  /// Reports a property negotiated during the handshake, e.g. `sasl.qop`.
  pub fn negotiated_property(&self, name: &str) -> Result<String> {
    match self {
      Mechanism::Plain(m) => m.negotiated_property(name),
      Mechanism::CramMd5(m) => m.negotiated_property(name),
      Mechanism::DigestMd5(m) => m.negotiated_property(name),
      #[cfg(feature = "kerberos")]
      Mechanism::Gssapi(m) => m.negotiated_property(name),
    }
  }

  /// Discards key material and any security context.
  pub fn dispose(&mut self) {
    match self {
      Mechanism::Plain(m) => m.dispose(),
      Mechanism::CramMd5(m) => m.dispose(),
      Mechanism::DigestMd5(m) => m.dispose(),
      #[cfg(feature = "kerberos")]
      Mechanism::Gssapi(m) => m.dispose(),
    }
  }
}
