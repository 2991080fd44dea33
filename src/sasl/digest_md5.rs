use std::sync::OnceLock;

use md5::{Digest, Md5};
use rand::Rng;
use regex::Regex;

use super::digest_security::{DigestIntegrity, DigestPrivacy, SecurityCtx};
use super::{QOP_AUTH, QOP_AUTH_CONF, QOP_AUTH_INT, QOP_PROPERTY};
use crate::{Error, Result};

const MAX_CHALLENGE_LEN: usize = 2048;
const CNONCE_LEN: usize = 16;

const CLIENT_INT_MAGIC: &[u8] = b"Digest session key to client-to-server signing key magic constant";
const SERVER_INT_MAGIC: &[u8] = b"Digest session key to server-to-client signing key magic constant";
const CLIENT_SEAL_MAGIC: &[u8] = b"Digest H(A1) to client-to-server sealing key magic constant";
const SERVER_SEAL_MAGIC: &[u8] = b"Digest H(A1) to server-to-client sealing key magic constant";

fn challenge_re() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| Regex::new(r#"([a-zA-Z0-9]+)=("[^"]*"|[^,]*)"#).expect("challenge grammar compiles"))
}

/// A parsed server challenge (RFC 2831 digest-challenge).
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Challenge {
  pub realm: String,
  pub nonce: String,
  pub qop: Vec<String>,
  pub cipher: Vec<String>,
}

impl Challenge {
  pub fn parse(challenge: &[u8]) -> Result<Self> {
    let text = std::str::from_utf8(challenge)
      .map_err(|_| Error::Sasl("digest challenge is not valid utf-8".into()))?;

    let mut parsed = Self::default();
    for capture in challenge_re().captures_iter(text) {
      let key = &capture[1];
      let value = capture[2].trim_matches('"');
      match key {
        "realm" => parsed.realm = value.to_string(),
        "nonce" => parsed.nonce = value.to_string(),
        "qop" => parsed.qop = value.split(',').map(|v| v.trim().to_string()).collect(),
        "cipher" => parsed.cipher = value.split(',').map(|v| v.trim().to_string()).collect(),
        _ => {}
      }
    }
    if parsed.nonce.is_empty() {
      return Err(Error::Sasl("digest challenge is missing a nonce".into()));
    }
    if parsed.qop.is_empty() {
      parsed.qop = vec![QOP_AUTH.to_string()];
    }
    Ok(parsed)
  }
}

fn generate_cnonce() -> String {
  let mut rng = rand::thread_rng();
  (0..CNONCE_LEN)
    .map(|_| rng.sample(rand::distributions::Alphanumeric) as char)
    .collect()
}

fn md5_bytes(input: &[u8]) -> [u8; 16] {
  Md5::digest(input).into()
}

fn md5_concat(prefix: &[u8], suffix: &[u8]) -> [u8; 16] {
  let mut hasher = Md5::new();
  hasher.update(prefix);
  hasher.update(suffix);
  hasher.finalize().into()
}

fn integrity_keys(a1: &[u8]) -> ([u8; 16], [u8; 16]) {
  let h = md5_bytes(a1);
  (md5_concat(&h, CLIENT_INT_MAGIC), md5_concat(&h, SERVER_INT_MAGIC))
}

fn privacy_keys(a1: &[u8], cipher: &str) -> ([u8; 16], [u8; 16]) {
  let h = md5_bytes(a1);
  let n = match cipher {
    "rc4-40" => 5,
    "rc4-56" => 7,
    _ => 16,
  };
  (md5_concat(&h[..n], CLIENT_SEAL_MAGIC), md5_concat(&h[..n], SERVER_SEAL_MAGIC))
}

fn choose_cipher(options: &[String]) -> &'static str {
  for candidate in ["rc4", "rc4-56", "rc4-40"] {
    if options.iter().any(|c| c == candidate) {
      return candidate;
    }
  }
  ""
}

/// DIGEST-MD5 (RFC 2831): two challenge/response steps, then an optional
/// integrity or privacy layer over every data frame.
pub struct DigestMd5Mechanism {
  authzid: String,
  username: String,
  password: String,
  protocol: String,
  server_name: String,

  token: Option<Challenge>,
  completed: bool,
  cnonce: String,
  cipher: &'static str,
  security: Option<Box<dyn SecurityCtx>>,
}

impl DigestMd5Mechanism {
  pub fn new(
    authzid: impl Into<String>,
    username: impl Into<String>,
    password: impl Into<String>,
    protocol: impl Into<String>,
    server_name: impl Into<String>,
  ) -> Self {
    Self {
      authzid: authzid.into(),
      username: username.into(),
      password: password.into(),
      protocol: protocol.into(),
      server_name: server_name.into(),
      token: None,
      completed: false,
      cnonce: String::new(),
      cipher: "",
      security: None,
    }
  }

  fn token(&self) -> Result<&Challenge> {
    self
      .token
      .as_ref()
      .ok_or_else(|| Error::Sasl("DIGEST-MD5 challenge not received yet".into()))
  }

  /// A1 = H(username:realm:password) : nonce : cnonce [ : authzid ]
  fn a1(&self) -> Result<Vec<u8>> {
    let token = self.token()?;
    let secret = md5_bytes(format!("{}:{}:{}", self.username, token.realm, self.password).as_bytes());

    let mut a1 = secret.to_vec();
    a1.push(b':');
    a1.extend_from_slice(token.nonce.as_bytes());
    a1.push(b':');
    a1.extend_from_slice(self.cnonce.as_bytes());
    if !self.authzid.is_empty() {
      a1.push(b':');
      a1.extend_from_slice(self.authzid.as_bytes());
    }
    Ok(a1)
  }

  /// A2 = "AUTHENTICATE":digest-uri for the response, "":digest-uri for
  /// rspauth; integrity and privacy QOPs append 32 zeros.
  fn a2(&self, initial: bool) -> Result<String> {
    let token = self.token()?;
    let mut a2 = if initial { "AUTHENTICATE".to_string() } else { String::new() };
    a2.push(':');
    a2.push_str(&self.protocol);
    a2.push('/');
    a2.push_str(&self.server_name);
    if token.qop[0] == QOP_AUTH_CONF || token.qop[0] == QOP_AUTH_INT {
      a2.push_str(":00000000000000000000000000000000");
    }
    Ok(a2)
  }

  fn compute(&self, initial: bool) -> Result<String> {
    let token = self.token()?;
    let x = hex::encode(md5_bytes(&self.a1()?));
    let a2_hex = hex::encode(md5_bytes(self.a2(initial)?.as_bytes()));
    let y = [
      token.nonce.as_str(),
      "00000001",
      self.cnonce.as_str(),
      token.qop[0].as_str(),
      a2_hex.as_str(),
    ]
    .join(":");
    Ok(hex::encode(md5_bytes(format!("{}:{}", x, y).as_bytes())))
  }

  fn challenge_step1(&mut self, challenge: &[u8]) -> Result<Vec<u8>> {
    let token = Challenge::parse(challenge)?;
    if self.cnonce.is_empty() {
      self.cnonce = generate_cnonce();
    }
    self.cipher = choose_cipher(&token.cipher);

    let qop = token.qop[0].clone();
    let realm = token.realm.clone();
    let nonce = token.nonce.clone();
    self.token = Some(token);
    let response = self.compute(true)?;

    let mut out = format!(
      r#"username="{}", realm="{}", nonce="{}", cnonce="{}", nc=00000001, qop={}, digest-uri="{}/{}", response={}, charset=utf-8"#,
      self.username, realm, nonce, self.cnonce, qop, self.protocol, self.server_name, response,
    );
    if !self.cipher.is_empty() {
      out.push_str(", cipher=");
      out.push_str(self.cipher);
    }
    Ok(out.into_bytes())
  }

  fn challenge_step2(&mut self, challenge: &[u8]) -> Result<()> {
    let text = std::str::from_utf8(challenge)
      .map_err(|_| Error::Sasl("digest rspauth is not valid utf-8".into()))?;
    let rspauth = text
      .strip_prefix("rspauth=")
      .ok_or_else(|| Error::Sasl(format!("rspauth not in {:?}", text)))?;

    if rspauth != self.compute(false)? {
      return Err(Error::Sasl("rspauth did not match digest".into()));
    }

    let qop = self.token()?.qop[0].clone();
    if qop == QOP_AUTH_CONF || qop == QOP_AUTH_INT {
      let a1 = self.a1()?;
      let (kic, kis) = integrity_keys(&a1);
      if qop == QOP_AUTH_CONF {
        let (kcc, kcs) = privacy_keys(&a1, self.cipher);
        self.security = Some(Box::new(DigestPrivacy::new(kic, kis, kcc, kcs)));
      } else {
        self.security = Some(Box::new(DigestIntegrity::new(kic, kis)));
      }
    }
    self.completed = true;
    Ok(())
  }

  pub(crate) fn evaluate_challenge(&mut self, challenge: &[u8]) -> Result<Vec<u8>> {
    if challenge.len() > MAX_CHALLENGE_LEN {
      return Err(Error::Sasl(format!(
        "invalid digest-challenge length {}, expected < {}",
        challenge.len(),
        MAX_CHALLENGE_LEN
      )));
    }
    if challenge.starts_with(b"rspauth") {
      self.challenge_step2(challenge)?;
      return Ok(Vec::new());
    }
    self.challenge_step1(challenge)
  }

  pub(crate) fn is_complete(&self) -> bool {
    self.completed
  }

  fn security_ctx(&mut self) -> Result<&mut Box<dyn SecurityCtx>> {
    if !self.completed {
      return Err(Error::Sasl("DIGEST-MD5 authentication not completed".into()));
    }
    self
      .security
      .as_mut()
      .ok_or_else(|| Error::Sasl("neither integrity nor privacy was negotiated".into()))
  }

  pub(crate) fn wrap(&mut self, outgoing: &[u8]) -> Result<Vec<u8>> {
    self.security_ctx()?.wrap(outgoing)
  }

  pub(crate) fn unwrap(&mut self, incoming: &[u8]) -> Result<Vec<u8>> {
    self.security_ctx()?.unwrap(incoming)
  }

  pub(crate) fn negotiated_property(&self, name: &str) -> Result<String> {
    if !self.completed {
      return Err(Error::Sasl("DIGEST-MD5 authentication not completed".into()));
    }
    match name {
      QOP_PROPERTY => Ok(self.token()?.qop[0].clone()),
      "sasl.bound.server.name" => Ok(self.server_name.clone()),
      "sasl.maxbuffer" => Ok("65536".to_string()),
      "sasl.sendmaxbuffer" => Ok("0".to_string()),
      _ => Ok(String::new()),
    }
  }

  pub(crate) fn dispose(&mut self) {
    self.security = None;
    self.password.clear();
  }
}

#[cfg(test)]
mod test {
  use super::{choose_cipher, Challenge, DigestMd5Mechanism};

  // RFC 2831 section 4 example exchange.
  const RFC_CHALLENGE: &[u8] = br#"realm="elwood.innosoft.com",nonce="OA6MG9tEQGm2hh",qop="auth",algorithm=md5-sess,charset=utf-8"#;

  fn rfc_mechanism() -> DigestMd5Mechanism {
    let mut mechanism = DigestMd5Mechanism::new("", "chris", "secret", "imap", "elwood.innosoft.com");
    mechanism.cnonce = "OA6MHXh6VqTrRk".to_string();
    mechanism
  }

  #[test]
  fn parses_quoted_values_with_commas() {
    let err = Challenge::parse(br#"ax="vcx,fgfdg""#).unwrap_err();
    // No nonce in that challenge; parsing itself must not split the value.
    assert!(err.to_string().contains("nonce"));

    let parsed = Challenge::parse(br#"nonce="abc",qop="auth,auth-int,auth-conf",cipher="rc4,rc4-56""#).unwrap();
    assert_eq!(vec!["auth", "auth-int", "auth-conf"], parsed.qop);
    assert_eq!(vec!["rc4", "rc4-56"], parsed.cipher);
  }

  #[test]
  fn qop_defaults_to_auth() {
    let parsed = Challenge::parse(br#"realm="r",nonce="n""#).unwrap();
    assert_eq!(vec!["auth"], parsed.qop);
    assert!(parsed.cipher.is_empty());
  }

  #[test]
  fn prefers_strongest_cipher() {
    let options = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    assert_eq!("rc4", choose_cipher(&options(&["rc4-40", "rc4", "rc4-56"])));
    assert_eq!("rc4-56", choose_cipher(&options(&["rc4-40", "rc4-56"])));
    assert_eq!("rc4-40", choose_cipher(&options(&["rc4-40"])));
    assert_eq!("", choose_cipher(&options(&["des"])));
  }

  #[test]
  fn computes_rfc2831_response() {
    let mut mechanism = rfc_mechanism();
    let response = mechanism.evaluate_challenge(RFC_CHALLENGE).unwrap();
    let response = String::from_utf8(response).unwrap();
    assert!(response.contains("response=d388dad90d4bbd760a152321f2143af7"), "{}", response);
    assert!(response.contains(r#"username="chris""#));
    assert!(response.contains(r#"digest-uri="imap/elwood.innosoft.com""#));
    assert!(response.contains("nc=00000001"));
    assert!(!mechanism.is_complete());
  }

  #[test]
  fn accepts_rfc2831_rspauth() {
    let mut mechanism = rfc_mechanism();
    mechanism.evaluate_challenge(RFC_CHALLENGE).unwrap();
    let out = mechanism
      .evaluate_challenge(b"rspauth=ea40f60335c427b5527b84dbabcdfffd")
      .unwrap();
    assert!(out.is_empty());
    assert!(mechanism.is_complete());
    assert_eq!("auth", mechanism.negotiated_property("sasl.qop").unwrap());
    // qop=auth negotiates no security layer.
    assert!(mechanism.wrap(b"x").is_err());
  }

  #[test]
  fn rejects_bad_rspauth() {
    let mut mechanism = rfc_mechanism();
    mechanism.evaluate_challenge(RFC_CHALLENGE).unwrap();
    assert!(mechanism
      .evaluate_challenge(b"rspauth=00000000000000000000000000000000")
      .is_err());
    assert!(!mechanism.is_complete());
  }

  #[test]
  fn rejects_oversize_challenge() {
    let mut mechanism = rfc_mechanism();
    let oversized = vec![b'a'; 2049];
    assert!(mechanism.evaluate_challenge(&oversized).is_err());
  }
}
