use std::collections::BTreeMap;
use std::fmt;
#[cfg(feature = "kerberos")]
use std::net::IpAddr;
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use crate::rpc::types::{TCloseSessionReq, TOpenSessionReq, TOpenSessionResp, TSessionHandle, PROTOCOL_V8};
use crate::rpc::Client;
#[cfg(feature = "kerberos")]
use crate::sasl::GssapiMechanism;
use crate::sasl::{Mechanism, PlainMechanism};
use crate::stmt::Statement;
use crate::stream::Stream;
use crate::transport::{SaslTransport, Transport};
use crate::{Error, Result};

pub const DEFAULT_FETCH_SIZE: i64 = 1000;

fn kv_re() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| Regex::new("([^;]*)=([^;]*);?").expect("option grammar compiles"))
}

/// Connection parameters parsed from a `hive2://` URI.
///
/// `hive2://host[:port][,host:port]*/[db][;k=v]*[?hive.conf=v[;...]][#hive.var=v[;...]]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnParams {
  pub db_name: String,
  pub uri: String,
  pub addresses: Vec<String>,
  pub hive_conf: BTreeMap<String, String>,
  pub hive_var: BTreeMap<String, String>,
  pub session_var: BTreeMap<String, String>,
}

impl ConnParams {
  pub fn parse(uri: &str) -> Result<Self> {
    let (_, rest) = uri
      .split_once("://")
      .ok_or_else(|| Error::Url(format!("{} has no scheme", uri)))?;

    let (rest, fragment) = match rest.split_once('#') {
      Some((rest, fragment)) => (rest, Some(fragment)),
      None => (rest, None),
    };
    let (rest, query) = match rest.split_once('?') {
      Some((rest, query)) => (rest, Some(query)),
      None => (rest, None),
    };
    let (authority, path) = match rest.split_once('/') {
      Some((authority, path)) => (authority, Some(path)),
      None => (rest, None),
    };

    if authority.is_empty() {
      return Err(Error::Url(format!("{} has no host", uri)));
    }

    let mut params = Self {
      db_name: "default".to_string(),
      uri: uri.to_string(),
      addresses: authority.split(',').map(str::to_string).collect(),
      hive_conf: BTreeMap::new(),
      hive_var: BTreeMap::new(),
      session_var: BTreeMap::new(),
    };

    if let Some(path) = path.filter(|p| !p.is_empty()) {
      match path.split_once(';') {
        None => params.db_name = path.to_string(),
        Some((db_name, session_vars)) => {
          if !db_name.is_empty() {
            params.db_name = db_name.to_string();
          }
          parse_options(session_vars, &mut params.session_var);
        }
      }
    }
    if let Some(query) = query {
      parse_options(query, &mut params.hive_conf);
    }
    if let Some(fragment) = fragment {
      parse_options(fragment, &mut params.hive_var);
    }
    Ok(params)
  }
}

fn parse_options(options: &str, bucket: &mut BTreeMap<String, String>) {
  for capture in kv_re().captures_iter(options) {
    bucket.insert(capture[1].to_string(), capture[2].to_string());
  }
}

fn format_options(f: &mut fmt::Formatter<'_>, options: &BTreeMap<String, String>) -> fmt::Result {
  for (i, (key, value)) in options.iter().enumerate() {
    if i > 0 {
      write!(f, ";")?;
    }
    write!(f, "{}={}", key, value)?;
  }
  Ok(())
}

impl fmt::Display for ConnParams {
  /// Canonical form: all three option buckets survive a parse/format
  /// round trip, though not necessarily in their original order.
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "hive2://{}/{}", self.addresses.join(","), self.db_name)?;
    for (key, value) in &self.session_var {
      write!(f, ";{}={}", key, value)?;
    }
    if !self.hive_conf.is_empty() {
      write!(f, "?")?;
      format_options(f, &self.hive_conf)?;
    }
    if !self.hive_var.is_empty() {
      write!(f, "#")?;
      format_options(f, &self.hive_var)?;
    }
    Ok(())
  }
}

/// One authenticated session over one transport.
pub struct Connection {
  pub(crate) client: Client<Stream>,
  pub(crate) session_handle: TSessionHandle,
  pub(crate) server_protocol: i32,
  pub(crate) fetch_size: i64,
}

impl Connection {
  pub async fn connect(uri: &str) -> Result<Self> {
    Self::connect_params(ConnParams::parse(uri)?).await
  }

  pub async fn connect_params(params: ConnParams) -> Result<Self> {
    let fetch_size = params
      .session_var
      .get("fetchSize")
      .and_then(|v| v.parse().ok())
      .unwrap_or(DEFAULT_FETCH_SIZE);

    let transport = open_transport(&params).await?;
    let mut client = Client::new(transport);
    let resp = open_session(&mut client, &params).await?;

    let session_handle = resp
      .session_handle
      .ok_or_else(|| Error::Rpc("open session reply carries no session handle".into()))?;
    debug!(protocol = resp.server_protocol_version, "session opened");

    Ok(Self {
      client,
      session_handle,
      server_protocol: resp.server_protocol_version,
      fetch_size,
    })
  }

  /// Binds a SQL string to this connection. The server is not contacted
  /// until the statement executes.
  pub fn prepare(&mut self, sql: impl Into<String>) -> Statement<'_> {
    Statement::new(self, sql.into())
  }

  /// Closes the session, then the transport. A close-session failure
  /// takes precedence over a transport shutdown failure.
  pub async fn close(mut self) -> Result<()> {
    let req = TCloseSessionReq {
      session_handle: self.session_handle.clone(),
    };
    let session_result = self.client.close_session(req).await;
    let transport_result = self.client.close_transport().await;
    session_result?;
    transport_result
  }

  pub fn begin_transaction(&mut self) -> Result<()> {
    Err(Error::Unsupported("begin transaction"))
  }

  pub fn fetch_size(&self) -> i64 {
    self.fetch_size
  }

  pub fn server_protocol(&self) -> i32 {
    self.server_protocol
  }
}

async fn open_transport(params: &ConnParams) -> Result<Transport<Stream>> {
  let host_port = params
    .addresses
    .first()
    .ok_or_else(|| Error::Url("no address to connect to".into()))?;
  let stream = Stream::connect(host_port).await?;

  if params.session_var.get("auth").map(String::as_str) == Some("noSasl") {
    return Ok(Transport::Raw(stream));
  }

  let principal = params.session_var.get("principal");
  let user_principal = params.session_var.get("user.principal");
  let mechanism = match (principal, user_principal) {
    #[cfg(feature = "kerberos")]
    (Some(principal), Some(user_principal)) => {
      // The platform Kerberos library picks these up when acquiring the
      // ticket-granting credentials.
      if let Some(keytab) = params.session_var.get("user.keytab") {
        std::env::set_var("KRB5_CLIENT_KTNAME", keytab);
      }
      if let Some(krb5_conf) = params.session_var.get("user.krb5.conf") {
        std::env::set_var("KRB5_CONFIG", krb5_conf);
      }
      let service = principal
        .split(['/', '@'])
        .find(|part| !part.is_empty())
        .ok_or_else(|| Error::Url(format!("malformed principal {}", principal)))?;
      let service_host = service_host(host_port);
      debug!(service, host = %service_host, "using kerberos authentication");
      Mechanism::Gssapi(GssapiMechanism::new("", service, service_host, Some(user_principal.clone())))
    }
    #[cfg(not(feature = "kerberos"))]
    (Some(_), Some(_)) => {
      return Err(Error::Unsupported("kerberos authentication (`kerberos` feature disabled)"));
    }
    _ => {
      let username = params.session_var.get("username").cloned().unwrap_or_else(|| "anonymous".into());
      let password = params.session_var.get("password").cloned().unwrap_or_else(|| "anonymous".into());
      Mechanism::Plain(PlainMechanism::new("", username, password))
    }
  };

  let mut transport = Transport::Sasl(SaslTransport::new(stream, mechanism));
  transport.open().await?;
  Ok(transport)
}

/// The host the service ticket is requested for: the reverse-DNS name of
/// the endpoint when it resolves, the literal host otherwise.
#[cfg(feature = "kerberos")]
fn service_host(host_port: &str) -> String {
  let host = host_port.rsplit_once(':').map(|(host, _)| host).unwrap_or(host_port);
  match host.parse::<IpAddr>() {
    Ok(ip) => dns_lookup::lookup_addr(&ip).unwrap_or_else(|_| host.to_string()),
    Err(_) => host.to_string(),
  }
}

async fn open_session(client: &mut Client<Stream>, params: &ConnParams) -> Result<TOpenSessionResp> {
  let mut configuration = BTreeMap::new();
  for (key, value) in &params.hive_conf {
    configuration.insert(format!("set:hiveconf:{}", key), value.clone());
  }
  // Remote clients set hive vars through 'set hivevar:key=value'.
  for (key, value) in &params.hive_var {
    configuration.insert(format!("set:hivevar:{}", key), value.clone());
  }
  configuration.insert("use:database".to_string(), params.db_name.clone());
  if let Some(proxy_user) = params.session_var.get("hive.server2.proxy.user") {
    configuration.insert("hive.server2.proxy.user".to_string(), proxy_user.clone());
  }

  // Credentials ride the open request only when SASL is disabled.
  let no_sasl = params.session_var.get("auth").map(String::as_str) == Some("noSasl");
  let (username, password) = if no_sasl {
    (
      params.session_var.get("username").filter(|v| !v.is_empty()).cloned(),
      params.session_var.get("password").filter(|v| !v.is_empty()).cloned(),
    )
  } else {
    (None, None)
  };

  let req = TOpenSessionReq {
    client_protocol: PROTOCOL_V8,
    username,
    password,
    configuration,
  };
  let resp = client.open_session(req).await?;
  resp.status.check(false)?;
  Ok(resp)
}

#[cfg(test)]
mod test {
  use super::ConnParams;

  #[test]
  fn parses_kerberos_url() {
    let params = ConnParams::parse(
      "hive2://h:10001/default;principal=hive/_HOST@R;user.principal=u@R;user.keytab=/k;user.krb5.conf=/c\
       ?hive.server2.thrift.http.path=hs2#gfd=gdfg",
    )
    .unwrap();

    assert_eq!(vec!["h:10001"], params.addresses);
    assert_eq!("default", params.db_name);
    assert_eq!(4, params.session_var.len());
    assert_eq!(Some("hive/_HOST@R"), params.session_var.get("principal").map(String::as_str));
    assert_eq!(Some("u@R"), params.session_var.get("user.principal").map(String::as_str));
    assert_eq!(Some("/k"), params.session_var.get("user.keytab").map(String::as_str));
    assert_eq!(Some("/c"), params.session_var.get("user.krb5.conf").map(String::as_str));
    assert_eq!(
      Some("hs2"),
      params.hive_conf.get("hive.server2.thrift.http.path").map(String::as_str)
    );
    assert_eq!(Some("gdfg"), params.hive_var.get("gfd").map(String::as_str));
  }

  #[test]
  fn database_defaults_when_absent() {
    let params = ConnParams::parse("hive2://warehouse:10000").unwrap();
    assert_eq!("default", params.db_name);
    assert!(params.session_var.is_empty());

    let params = ConnParams::parse("hive2://warehouse:10000/").unwrap();
    assert_eq!("default", params.db_name);

    let params = ConnParams::parse("hive2://warehouse:10000/;fetchSize=100").unwrap();
    assert_eq!("default", params.db_name);
    assert_eq!(Some("100"), params.session_var.get("fetchSize").map(String::as_str));
  }

  #[test]
  fn parses_plain_database_path() {
    let params = ConnParams::parse("hive2://warehouse:10000/sales").unwrap();
    assert_eq!("sales", params.db_name);
    assert!(params.session_var.is_empty());
  }

  #[test]
  fn splits_multiple_addresses() {
    let params = ConnParams::parse("hive2://h1:10000,h2:10000,h3:10000/db").unwrap();
    assert_eq!(vec!["h1:10000", "h2:10000", "h3:10000"], params.addresses);
    assert_eq!("db", params.db_name);
  }

  #[test]
  fn rejects_urls_without_scheme_or_host() {
    assert!(ConnParams::parse("warehouse:10000/db").is_err());
    assert!(ConnParams::parse("hive2:///db").is_err());
  }

  #[test]
  fn canonical_format_round_trips() {
    let params = ConnParams::parse(
      "hive2://h1:1,h2:2/db;auth=noSasl;username=u?a=1;b=2#x=y;z=w",
    )
    .unwrap();
    let mut reparsed = ConnParams::parse(&params.to_string()).unwrap();
    reparsed.uri = params.uri.clone();
    assert_eq!(params, reparsed);
  }

  #[tokio::test]
  async fn open_session_prefixes_configuration() {
    use std::collections::BTreeMap;

    use crate::rpc::types::PROTOCOL_V8;
    use crate::rpc::wire::{MessageReader, T_I32, T_MAP, T_STRING, T_STRUCT};
    use crate::rpc::Client;
    use crate::stream::Stream;
    use crate::testutil::{write_reply, write_success_status};
    use crate::transport::Transport;

    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    let mut client = Client::new(Transport::Raw(Stream::Duplex(client_io)));
    let params = ConnParams::parse(
      "hive2://h:1/db;auth=noSasl;username=u;password=p;hive.server2.proxy.user=etl?a=1#b=2",
    )
    .unwrap();

    let server = tokio::spawn(async move {
      let mut transport = Transport::Raw(server_io);
      let mut r = MessageReader::new(&mut transport);
      let (name, _, seq_id) = r.read_message_begin().await.unwrap();
      assert_eq!("OpenSession", name);

      let mut protocol = None;
      let mut username = None;
      let mut password = None;
      let mut configuration = BTreeMap::new();
      while let Some((ftype, id)) = r.read_field_begin().await.unwrap() {
        match (id, ftype) {
          (1, T_STRUCT) => {
            while let Some((ftype, id)) = r.read_field_begin().await.unwrap() {
              match (id, ftype) {
                (1, T_I32) => protocol = Some(r.read_i32().await.unwrap()),
                (2, T_STRING) => username = Some(r.read_string().await.unwrap()),
                (3, T_STRING) => password = Some(r.read_string().await.unwrap()),
                (4, T_MAP) => {
                  let (_, _, len) = r.read_map_begin().await.unwrap();
                  for _ in 0..len {
                    let key = r.read_string().await.unwrap();
                    let value = r.read_string().await.unwrap();
                    configuration.insert(key, value);
                  }
                }
                (_, t) => r.skip(t).await.unwrap(),
              }
            }
          }
          (_, t) => r.skip(t).await.unwrap(),
        }
      }
      assert_eq!(Some(PROTOCOL_V8), protocol);
      assert_eq!(Some("u".to_string()), username);
      assert_eq!(Some("p".to_string()), password);
      assert_eq!(Some("1"), configuration.get("set:hiveconf:a").map(String::as_str));
      assert_eq!(Some("2"), configuration.get("set:hivevar:b").map(String::as_str));
      assert_eq!(Some("db"), configuration.get("use:database").map(String::as_str));
      assert_eq!(Some("etl"), configuration.get("hive.server2.proxy.user").map(String::as_str));
      drop(r);

      write_reply(&mut transport, "OpenSession", seq_id, |w| {
        write_success_status(w);
        w.field_begin(T_I32, 2);
        w.put_i32(PROTOCOL_V8);
        w.field_begin(T_STRUCT, 3);
        w.field_begin(T_STRUCT, 1);
        w.field_begin(T_STRING, 1);
        w.put_binary(b"g");
        w.field_begin(T_STRING, 2);
        w.put_binary(b"s");
        w.stop();
        w.stop();
      })
      .await;
    });

    let resp = super::open_session(&mut client, &params).await.unwrap();
    assert_eq!(PROTOCOL_V8, resp.server_protocol_version);
    assert!(resp.session_handle.is_some());
    server.await.unwrap();
  }
}
