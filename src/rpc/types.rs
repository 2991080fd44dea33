//! The subset of the TCLIService wire surface this driver speaks. Field
//! ids and enum values follow the published service definition; unknown
//! fields are skipped so newer servers stay readable.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;

use super::compact::{CompactReader, CT_BINARY, CT_LIST, CT_STRUCT};
use super::wire::{MessageReader, MessageWriter, T_BOOL, T_I32, T_I64, T_LIST, T_MAP, T_STRING, T_STRUCT};
use crate::transport::Io;
use crate::{Error, Result};

pub const SUCCESS_STATUS: i32 = 0;
pub const SUCCESS_WITH_INFO_STATUS: i32 = 1;
pub const STILL_EXECUTING_STATUS: i32 = 2;
pub const ERROR_STATUS: i32 = 3;
pub const INVALID_HANDLE_STATUS: i32 = 4;

/// Server protocol versions, V1..V10. Columnar result pages are used when
/// the server reports a version newer than V6.
pub const PROTOCOL_V6: i32 = 5;
pub const PROTOCOL_V8: i32 = 7;

pub const CHARACTER_MAXIMUM_LENGTH: &str = "characterMaximumLength";
pub const PRECISION: &str = "precision";
pub const SCALE: &str = "scale";

#[derive(Debug, Clone, Default)]
pub struct TStatus {
  pub status_code: i32,
  pub info_messages: Vec<String>,
  pub sql_state: Option<String>,
  pub error_code: Option<i32>,
  pub error_message: Option<String>,
}

impl TStatus {
  /// True iff the status is SUCCESS, or SUCCESS_WITH_INFO when tolerated.
  pub fn verify_success(&self, with_info: bool) -> bool {
    self.status_code == SUCCESS_STATUS || (with_info && self.status_code == SUCCESS_WITH_INFO_STATUS)
  }

  pub fn verify_success_with_info(&self) -> bool {
    self.verify_success(true)
  }

  pub(crate) fn check(&self, with_info: bool) -> Result<()> {
    if self.verify_success(with_info) {
      Ok(())
    } else {
      Err(Error::Server(self.to_string()))
    }
  }

  pub(crate) async fn read<S: Io>(r: &mut MessageReader<'_, S>) -> Result<Self> {
    let mut status = Self::default();
    while let Some((ftype, id)) = r.read_field_begin().await? {
      match (id, ftype) {
        (1, T_I32) => status.status_code = r.read_i32().await?,
        (2, T_LIST) => {
          let (_, len) = r.read_list_begin().await?;
          for _ in 0..len {
            status.info_messages.push(r.read_string().await?);
          }
        }
        (3, T_STRING) => status.sql_state = Some(r.read_string().await?),
        (4, T_I32) => status.error_code = Some(r.read_i32().await?),
        (5, T_STRING) => status.error_message = Some(r.read_string().await?),
        (_, t) => r.skip(t).await?,
      }
    }
    Ok(status)
  }
}

impl fmt::Display for TStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let code = match self.status_code {
      SUCCESS_STATUS => "SUCCESS_STATUS".to_string(),
      SUCCESS_WITH_INFO_STATUS => "SUCCESS_WITH_INFO_STATUS".to_string(),
      STILL_EXECUTING_STATUS => "STILL_EXECUTING_STATUS".to_string(),
      ERROR_STATUS => "ERROR_STATUS".to_string(),
      INVALID_HANDLE_STATUS => "INVALID_HANDLE_STATUS".to_string(),
      other => format!("UNKNOWN_STATUS({})", other),
    };
    write!(f, "TStatus(statusCode={}", code)?;
    if let Some(sql_state) = &self.sql_state {
      write!(f, ", sqlState={}", sql_state)?;
    }
    if let Some(error_code) = self.error_code {
      write!(f, ", errorCode={}", error_code)?;
    }
    if let Some(error_message) = &self.error_message {
      write!(f, ", errorMessage={}", error_message)?;
    }
    write!(f, ")")
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TOperationState {
  Initialized = 0,
  Running = 1,
  Finished = 2,
  Canceled = 3,
  Closed = 4,
  Error = 5,
  Unknown = 6,
  Pending = 7,
  Timedout = 8,
}

impl TOperationState {
  pub fn from_i32(value: i32) -> Option<Self> {
    match value {
      0 => Some(Self::Initialized),
      1 => Some(Self::Running),
      2 => Some(Self::Finished),
      3 => Some(Self::Canceled),
      4 => Some(Self::Closed),
      5 => Some(Self::Error),
      6 => Some(Self::Unknown),
      7 => Some(Self::Pending),
      8 => Some(Self::Timedout),
      _ => None,
    }
  }
}

/// Primitive type ids, as reported in result-set metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TTypeId {
  Boolean = 0,
  TinyInt = 1,
  SmallInt = 2,
  Int = 3,
  BigInt = 4,
  Float = 5,
  Double = 6,
  String = 7,
  Timestamp = 8,
  Binary = 9,
  Array = 10,
  Map = 11,
  Struct = 12,
  Union = 13,
  UserDefined = 14,
  Decimal = 15,
  Null = 16,
  Date = 17,
  Varchar = 18,
  Char = 19,
  IntervalYearMonth = 20,
  IntervalDayTime = 21,
}

impl TTypeId {
  pub fn from_i32(value: i32) -> Option<Self> {
    match value {
      0 => Some(Self::Boolean),
      1 => Some(Self::TinyInt),
      2 => Some(Self::SmallInt),
      3 => Some(Self::Int),
      4 => Some(Self::BigInt),
      5 => Some(Self::Float),
      6 => Some(Self::Double),
      7 => Some(Self::String),
      8 => Some(Self::Timestamp),
      9 => Some(Self::Binary),
      10 => Some(Self::Array),
      11 => Some(Self::Map),
      12 => Some(Self::Struct),
      13 => Some(Self::Union),
      14 => Some(Self::UserDefined),
      15 => Some(Self::Decimal),
      16 => Some(Self::Null),
      17 => Some(Self::Date),
      18 => Some(Self::Varchar),
      19 => Some(Self::Char),
      20 => Some(Self::IntervalYearMonth),
      21 => Some(Self::IntervalDayTime),
      _ => None,
    }
  }

  pub fn name(&self) -> &'static str {
    match self {
      Self::Boolean => "BOOLEAN",
      Self::TinyInt => "TINYINT",
      Self::SmallInt => "SMALLINT",
      Self::Int => "INT",
      Self::BigInt => "BIGINT",
      Self::Float => "FLOAT",
      Self::Double => "DOUBLE",
      Self::String => "STRING",
      Self::Timestamp => "TIMESTAMP",
      Self::Binary => "BINARY",
      Self::Array => "ARRAY",
      Self::Map => "MAP",
      Self::Struct => "STRUCT",
      Self::Union => "UNIONTYPE",
      Self::UserDefined => "USER_DEFINED",
      Self::Decimal => "DECIMAL",
      Self::Null => "NULL",
      Self::Date => "DATE",
      Self::Varchar => "VARCHAR",
      Self::Char => "CHAR",
      Self::IntervalYearMonth => "INTERVAL_YEAR_MONTH",
      Self::IntervalDayTime => "INTERVAL_DAY_TIME",
    }
  }
}

#[derive(Debug, Clone, Default)]
pub struct THandleIdentifier {
  pub guid: Vec<u8>,
  pub secret: Vec<u8>,
}

impl THandleIdentifier {
  fn write(&self, w: &mut MessageWriter) {
    w.field_begin(T_STRING, 1);
    w.put_binary(&self.guid);
    w.field_begin(T_STRING, 2);
    w.put_binary(&self.secret);
    w.stop();
  }

  async fn read<S: Io>(r: &mut MessageReader<'_, S>) -> Result<Self> {
    let mut handle = Self::default();
    while let Some((ftype, id)) = r.read_field_begin().await? {
      match (id, ftype) {
        (1, T_STRING) => handle.guid = r.read_binary().await?,
        (2, T_STRING) => handle.secret = r.read_binary().await?,
        (_, t) => r.skip(t).await?,
      }
    }
    Ok(handle)
  }
}

#[derive(Debug, Clone, Default)]
pub struct TSessionHandle {
  pub session_id: THandleIdentifier,
}

impl TSessionHandle {
  pub(crate) fn write(&self, w: &mut MessageWriter) {
    w.field_begin(T_STRUCT, 1);
    self.session_id.write(w);
    w.stop();
  }

  pub(crate) async fn read<S: Io>(r: &mut MessageReader<'_, S>) -> Result<Self> {
    let mut handle = Self::default();
    while let Some((ftype, id)) = r.read_field_begin().await? {
      match (id, ftype) {
        (1, T_STRUCT) => handle.session_id = THandleIdentifier::read(r).await?,
        (_, t) => r.skip(t).await?,
      }
    }
    Ok(handle)
  }
}

#[derive(Debug, Clone, Default)]
pub struct TOperationHandle {
  pub operation_id: THandleIdentifier,
  pub operation_type: i32,
  pub has_result_set: bool,
}

impl TOperationHandle {
  pub(crate) fn write(&self, w: &mut MessageWriter) {
    w.field_begin(T_STRUCT, 1);
    self.operation_id.write(w);
    w.field_begin(T_I32, 2);
    w.put_i32(self.operation_type);
    w.field_begin(T_BOOL, 3);
    w.put_bool(self.has_result_set);
    w.stop();
  }

  pub(crate) async fn read<S: Io>(r: &mut MessageReader<'_, S>) -> Result<Self> {
    let mut handle = Self::default();
    while let Some((ftype, id)) = r.read_field_begin().await? {
      match (id, ftype) {
        (1, T_STRUCT) => handle.operation_id = THandleIdentifier::read(r).await?,
        (2, T_I32) => handle.operation_type = r.read_i32().await?,
        (3, T_BOOL) => handle.has_result_set = r.read_bool().await?,
        (_, t) => r.skip(t).await?,
      }
    }
    Ok(handle)
  }
}

#[derive(Debug, Clone)]
pub struct TOpenSessionReq {
  pub client_protocol: i32,
  pub username: Option<String>,
  pub password: Option<String>,
  pub configuration: BTreeMap<String, String>,
}

impl TOpenSessionReq {
  pub(crate) fn write(&self, w: &mut MessageWriter) {
    w.field_begin(T_I32, 1);
    w.put_i32(self.client_protocol);
    if let Some(username) = &self.username {
      w.field_begin(T_STRING, 2);
      w.put_string(username);
    }
    if let Some(password) = &self.password {
      w.field_begin(T_STRING, 3);
      w.put_string(password);
    }
    w.field_begin(T_MAP, 4);
    w.map_begin(T_STRING, T_STRING, self.configuration.len());
    for (key, value) in &self.configuration {
      w.put_string(key);
      w.put_string(value);
    }
    w.stop();
  }
}

#[derive(Debug, Default)]
pub struct TOpenSessionResp {
  pub status: TStatus,
  pub server_protocol_version: i32,
  pub session_handle: Option<TSessionHandle>,
}

impl TOpenSessionResp {
  pub(crate) async fn read<S: Io>(r: &mut MessageReader<'_, S>) -> Result<Self> {
    let mut resp = Self::default();
    while let Some((ftype, id)) = r.read_field_begin().await? {
      match (id, ftype) {
        (1, T_STRUCT) => resp.status = TStatus::read(r).await?,
        (2, T_I32) => resp.server_protocol_version = r.read_i32().await?,
        (3, T_STRUCT) => resp.session_handle = Some(TSessionHandle::read(r).await?),
        (_, t) => r.skip(t).await?,
      }
    }
    Ok(resp)
  }
}

#[derive(Debug, Clone)]
pub struct TCloseSessionReq {
  pub session_handle: TSessionHandle,
}

impl TCloseSessionReq {
  pub(crate) fn write(&self, w: &mut MessageWriter) {
    w.field_begin(T_STRUCT, 1);
    self.session_handle.write(w);
    w.stop();
  }
}

#[derive(Debug, Default)]
pub struct TCloseSessionResp {
  pub status: TStatus,
}

impl TCloseSessionResp {
  pub(crate) async fn read<S: Io>(r: &mut MessageReader<'_, S>) -> Result<Self> {
    let mut resp = Self::default();
    while let Some((ftype, id)) = r.read_field_begin().await? {
      match (id, ftype) {
        (1, T_STRUCT) => resp.status = TStatus::read(r).await?,
        (_, t) => r.skip(t).await?,
      }
    }
    Ok(resp)
  }
}

#[derive(Debug, Clone)]
pub struct TExecuteStatementReq {
  pub session_handle: TSessionHandle,
  pub statement: String,
  pub run_async: bool,
}

impl TExecuteStatementReq {
  pub(crate) fn write(&self, w: &mut MessageWriter) {
    w.field_begin(T_STRUCT, 1);
    self.session_handle.write(w);
    w.field_begin(T_STRING, 2);
    w.put_string(&self.statement);
    w.field_begin(T_BOOL, 4);
    w.put_bool(self.run_async);
    w.stop();
  }
}

#[derive(Debug, Default)]
pub struct TExecuteStatementResp {
  pub status: TStatus,
  pub operation_handle: Option<TOperationHandle>,
}

impl TExecuteStatementResp {
  pub(crate) async fn read<S: Io>(r: &mut MessageReader<'_, S>) -> Result<Self> {
    let mut resp = Self::default();
    while let Some((ftype, id)) = r.read_field_begin().await? {
      match (id, ftype) {
        (1, T_STRUCT) => resp.status = TStatus::read(r).await?,
        (2, T_STRUCT) => resp.operation_handle = Some(TOperationHandle::read(r).await?),
        (_, t) => r.skip(t).await?,
      }
    }
    Ok(resp)
  }
}

#[derive(Debug, Clone)]
pub struct TGetOperationStatusReq {
  pub operation_handle: TOperationHandle,
}

impl TGetOperationStatusReq {
  pub(crate) fn write(&self, w: &mut MessageWriter) {
    w.field_begin(T_STRUCT, 1);
    self.operation_handle.write(w);
    w.stop();
  }
}

#[derive(Debug, Default)]
pub struct TGetOperationStatusResp {
  pub status: TStatus,
  pub operation_state: Option<i32>,
  pub sql_state: Option<String>,
  pub error_code: Option<i32>,
  pub error_message: Option<String>,
}

impl TGetOperationStatusResp {
  pub(crate) async fn read<S: Io>(r: &mut MessageReader<'_, S>) -> Result<Self> {
    let mut resp = Self::default();
    while let Some((ftype, id)) = r.read_field_begin().await? {
      match (id, ftype) {
        (1, T_STRUCT) => resp.status = TStatus::read(r).await?,
        (2, T_I32) => resp.operation_state = Some(r.read_i32().await?),
        (3, T_STRING) => resp.sql_state = Some(r.read_string().await?),
        (4, T_I32) => resp.error_code = Some(r.read_i32().await?),
        (5, T_STRING) => resp.error_message = Some(r.read_string().await?),
        (_, t) => r.skip(t).await?,
      }
    }
    Ok(resp)
  }
}

#[derive(Debug, Clone)]
pub struct TCloseOperationReq {
  pub operation_handle: TOperationHandle,
}

impl TCloseOperationReq {
  pub(crate) fn write(&self, w: &mut MessageWriter) {
    w.field_begin(T_STRUCT, 1);
    self.operation_handle.write(w);
    w.stop();
  }
}

#[derive(Debug, Default)]
pub struct TCloseOperationResp {
  pub status: TStatus,
}

impl TCloseOperationResp {
  pub(crate) async fn read<S: Io>(r: &mut MessageReader<'_, S>) -> Result<Self> {
    let mut resp = Self::default();
    while let Some((ftype, id)) = r.read_field_begin().await? {
      match (id, ftype) {
        (1, T_STRUCT) => resp.status = TStatus::read(r).await?,
        (_, t) => r.skip(t).await?,
      }
    }
    Ok(resp)
  }
}

#[derive(Debug, Clone)]
pub struct TGetResultSetMetadataReq {
  pub operation_handle: TOperationHandle,
}

impl TGetResultSetMetadataReq {
  pub(crate) fn write(&self, w: &mut MessageWriter) {
    w.field_begin(T_STRUCT, 1);
    self.operation_handle.write(w);
    w.stop();
  }
}

#[derive(Debug, Default)]
pub struct TGetResultSetMetadataResp {
  pub status: TStatus,
  pub schema: Option<TTableSchema>,
}

impl TGetResultSetMetadataResp {
  pub(crate) async fn read<S: Io>(r: &mut MessageReader<'_, S>) -> Result<Self> {
    let mut resp = Self::default();
    while let Some((ftype, id)) = r.read_field_begin().await? {
      match (id, ftype) {
        (1, T_STRUCT) => resp.status = TStatus::read(r).await?,
        (2, T_STRUCT) => resp.schema = Some(TTableSchema::read(r).await?),
        (_, t) => r.skip(t).await?,
      }
    }
    Ok(resp)
  }
}

#[derive(Debug, Clone, Default)]
pub struct TTableSchema {
  pub columns: Vec<TColumnDesc>,
}

impl TTableSchema {
  pub(crate) async fn read<S: Io>(r: &mut MessageReader<'_, S>) -> Result<Self> {
    let mut schema = Self::default();
    while let Some((ftype, id)) = r.read_field_begin().await? {
      match (id, ftype) {
        (1, T_LIST) => {
          let (_, len) = r.read_list_begin().await?;
          for _ in 0..len {
            schema.columns.push(TColumnDesc::read(r).await?);
          }
        }
        (_, t) => r.skip(t).await?,
      }
    }
    Ok(schema)
  }
}

#[derive(Debug, Clone, Default)]
pub struct TColumnDesc {
  pub column_name: String,
  pub type_desc: TTypeDesc,
  pub position: i32,
  pub comment: Option<String>,
}

impl TColumnDesc {
  pub(crate) async fn read<S: Io>(r: &mut MessageReader<'_, S>) -> Result<Self> {
    let mut desc = Self::default();
    while let Some((ftype, id)) = r.read_field_begin().await? {
      match (id, ftype) {
        (1, T_STRING) => desc.column_name = r.read_string().await?,
        (2, T_STRUCT) => desc.type_desc = TTypeDesc::read(r).await?,
        (3, T_I32) => desc.position = r.read_i32().await?,
        (4, T_STRING) => desc.comment = Some(r.read_string().await?),
        (_, t) => r.skip(t).await?,
      }
    }
    Ok(desc)
  }

  /// The primitive entry describing this column, if the type is primitive.
  pub fn primitive_entry(&self) -> Option<&TPrimitiveTypeEntry> {
    self.type_desc.types.first().and_then(|entry| match entry {
      TTypeEntry::Primitive(primitive) => Some(primitive),
      TTypeEntry::Other => None,
    })
  }
}

#[derive(Debug, Clone, Default)]
pub struct TTypeDesc {
  pub types: Vec<TTypeEntry>,
}

impl TTypeDesc {
  pub(crate) async fn read<S: Io>(r: &mut MessageReader<'_, S>) -> Result<Self> {
    let mut desc = Self::default();
    while let Some((ftype, id)) = r.read_field_begin().await? {
      match (id, ftype) {
        (1, T_LIST) => {
          let (_, len) = r.read_list_begin().await?;
          for _ in 0..len {
            desc.types.push(TTypeEntry::read(r).await?);
          }
        }
        (_, t) => r.skip(t).await?,
      }
    }
    Ok(desc)
  }
}

/// Union over type entries; only primitive entries are interpreted.
#[derive(Debug, Clone)]
pub enum TTypeEntry {
  Primitive(TPrimitiveTypeEntry),
  Other,
}

impl TTypeEntry {
  pub(crate) async fn read<S: Io>(r: &mut MessageReader<'_, S>) -> Result<Self> {
    let mut entry = Self::Other;
    while let Some((ftype, id)) = r.read_field_begin().await? {
      match (id, ftype) {
        (1, T_STRUCT) => entry = Self::Primitive(TPrimitiveTypeEntry::read(r).await?),
        (_, t) => r.skip(t).await?,
      }
    }
    Ok(entry)
  }
}

#[derive(Debug, Clone, Default)]
pub struct TPrimitiveTypeEntry {
  pub type_id: i32,
  pub type_qualifiers: Option<TTypeQualifiers>,
}

impl TPrimitiveTypeEntry {
  pub(crate) async fn read<S: Io>(r: &mut MessageReader<'_, S>) -> Result<Self> {
    let mut entry = Self::default();
    while let Some((ftype, id)) = r.read_field_begin().await? {
      match (id, ftype) {
        (1, T_I32) => entry.type_id = r.read_i32().await?,
        (2, T_STRUCT) => entry.type_qualifiers = Some(TTypeQualifiers::read(r).await?),
        (_, t) => r.skip(t).await?,
      }
    }
    Ok(entry)
  }

  pub fn type_id(&self) -> Option<TTypeId> {
    TTypeId::from_i32(self.type_id)
  }

  pub fn qualifier_i32(&self, name: &str) -> Option<i32> {
    self
      .type_qualifiers
      .as_ref()
      .and_then(|q| q.qualifiers.get(name))
      .and_then(|v| match v {
        TTypeQualifierValue::I32(value) => Some(*value),
        TTypeQualifierValue::String(_) => None,
      })
  }
}

#[derive(Debug, Clone, Default)]
pub struct TTypeQualifiers {
  pub qualifiers: BTreeMap<String, TTypeQualifierValue>,
}

impl TTypeQualifiers {
  pub(crate) async fn read<S: Io>(r: &mut MessageReader<'_, S>) -> Result<Self> {
    let mut qualifiers = Self::default();
    while let Some((ftype, id)) = r.read_field_begin().await? {
      match (id, ftype) {
        (1, T_MAP) => {
          let (_, _, len) = r.read_map_begin().await?;
          for _ in 0..len {
            let key = r.read_string().await?;
            let value = TTypeQualifierValue::read(r).await?;
            qualifiers.qualifiers.insert(key, value);
          }
        }
        (_, t) => r.skip(t).await?,
      }
    }
    Ok(qualifiers)
  }
}

#[derive(Debug, Clone)]
pub enum TTypeQualifierValue {
  I32(i32),
  String(String),
}

impl TTypeQualifierValue {
  pub(crate) async fn read<S: Io>(r: &mut MessageReader<'_, S>) -> Result<Self> {
    let mut value = None;
    while let Some((ftype, id)) = r.read_field_begin().await? {
      match (id, ftype) {
        (1, T_I32) => value = Some(Self::I32(r.read_i32().await?)),
        (2, T_STRING) => value = Some(Self::String(r.read_string().await?)),
        (_, t) => r.skip(t).await?,
      }
    }
    value.ok_or_else(|| Error::Rpc("empty type qualifier value".into()))
  }
}

pub const FETCH_NEXT: i32 = 0;

#[derive(Debug, Clone)]
pub struct TFetchResultsReq {
  pub operation_handle: TOperationHandle,
  pub orientation: i32,
  pub max_rows: i64,
}

impl TFetchResultsReq {
  pub(crate) fn write(&self, w: &mut MessageWriter) {
    w.field_begin(T_STRUCT, 1);
    self.operation_handle.write(w);
    w.field_begin(T_I32, 2);
    w.put_i32(self.orientation);
    w.field_begin(T_I64, 3);
    w.put_i64(self.max_rows);
    w.stop();
  }
}

#[derive(Debug, Default)]
pub struct TFetchResultsResp {
  pub status: TStatus,
  pub has_more_rows: Option<bool>,
  pub results: Option<TRowSet>,
}

impl TFetchResultsResp {
  pub(crate) async fn read<S: Io>(r: &mut MessageReader<'_, S>) -> Result<Self> {
    let mut resp = Self::default();
    while let Some((ftype, id)) = r.read_field_begin().await? {
      match (id, ftype) {
        (1, T_STRUCT) => resp.status = TStatus::read(r).await?,
        (2, T_BOOL) => resp.has_more_rows = Some(r.read_bool().await?),
        (3, T_STRUCT) => resp.results = Some(TRowSet::read(r).await?),
        (_, t) => r.skip(t).await?,
      }
    }
    Ok(resp)
  }
}

/// One fetched page: either materialized rows, explicit columns, or a
/// compact-encoded column blob plus its column count.
#[derive(Debug, Default)]
pub struct TRowSet {
  pub start_row_offset: i64,
  pub rows: Vec<TRow>,
  pub columns: Vec<TColumn>,
  pub binary_columns: Option<Bytes>,
  pub column_count: Option<i32>,
}

impl TRowSet {
  pub(crate) async fn read<S: Io>(r: &mut MessageReader<'_, S>) -> Result<Self> {
    let mut row_set = Self::default();
    while let Some((ftype, id)) = r.read_field_begin().await? {
      match (id, ftype) {
        (1, T_I64) => row_set.start_row_offset = r.read_i64().await?,
        (2, T_LIST) => {
          let (_, len) = r.read_list_begin().await?;
          for _ in 0..len {
            row_set.rows.push(TRow::read(r).await?);
          }
        }
        (3, T_LIST) => {
          let (_, len) = r.read_list_begin().await?;
          for _ in 0..len {
            row_set.columns.push(TColumn::read(r).await?);
          }
        }
        (4, T_STRING) => row_set.binary_columns = Some(r.read_binary().await?.into()),
        (5, T_I32) => row_set.column_count = Some(r.read_i32().await?),
        (_, t) => r.skip(t).await?,
      }
    }
    Ok(row_set)
  }
}

#[derive(Debug, Default)]
pub struct TRow {
  pub col_vals: Vec<TColumnValue>,
}

impl TRow {
  pub(crate) async fn read<S: Io>(r: &mut MessageReader<'_, S>) -> Result<Self> {
    let mut row = Self::default();
    while let Some((ftype, id)) = r.read_field_begin().await? {
      match (id, ftype) {
        (1, T_LIST) => {
          let (_, len) = r.read_list_begin().await?;
          for _ in 0..len {
            row.col_vals.push(TColumnValue::read(r).await?);
          }
        }
        (_, t) => r.skip(t).await?,
      }
    }
    Ok(row)
  }
}

/// Union over the tagged cell values of a row-oriented page.
#[derive(Debug, Clone, PartialEq)]
pub enum TColumnValue {
  Bool(Option<bool>),
  Byte(Option<i8>),
  I16(Option<i16>),
  I32(Option<i32>),
  I64(Option<i64>),
  Double(Option<f64>),
  String(Option<String>),
  Unset,
}

impl TColumnValue {
  pub(crate) async fn read<S: Io>(r: &mut MessageReader<'_, S>) -> Result<Self> {
    let mut value = Self::Unset;
    while let Some((ftype, id)) = r.read_field_begin().await? {
      if ftype != T_STRUCT {
        r.skip(ftype).await?;
        continue;
      }
      value = match id {
        1 => Self::Bool(read_optional_value(r, |v| v != 0).await?),
        2 => Self::Byte(read_optional_value(r, |v| v as i8).await?),
        3 => Self::I16(read_optional_i16(r).await?),
        4 => Self::I32(read_optional_i32(r).await?),
        5 => Self::I64(read_optional_i64(r).await?),
        6 => Self::Double(read_optional_f64(r).await?),
        7 => Self::String(read_optional_string(r).await?),
        _ => {
          r.skip(T_STRUCT).await?;
          continue;
        }
      };
    }
    Ok(value)
  }
}

async fn read_optional_value<S: Io, T>(r: &mut MessageReader<'_, S>, convert: impl Fn(u8) -> T) -> Result<Option<T>> {
  let mut value = None;
  while let Some((ftype, id)) = r.read_field_begin().await? {
    match (id, ftype) {
      (1, _) => value = Some(convert(r.read_u8().await?)),
      (_, t) => r.skip(t).await?,
    }
  }
  Ok(value)
}

async fn read_optional_i16<S: Io>(r: &mut MessageReader<'_, S>) -> Result<Option<i16>> {
  let mut value = None;
  while let Some((ftype, id)) = r.read_field_begin().await? {
    match (id, ftype) {
      (1, _) => value = Some(r.read_i16().await?),
      (_, t) => r.skip(t).await?,
    }
  }
  Ok(value)
}

async fn read_optional_i32<S: Io>(r: &mut MessageReader<'_, S>) -> Result<Option<i32>> {
  let mut value = None;
  while let Some((ftype, id)) = r.read_field_begin().await? {
    match (id, ftype) {
      (1, _) => value = Some(r.read_i32().await?),
      (_, t) => r.skip(t).await?,
    }
  }
  Ok(value)
}

async fn read_optional_i64<S: Io>(r: &mut MessageReader<'_, S>) -> Result<Option<i64>> {
  let mut value = None;
  while let Some((ftype, id)) = r.read_field_begin().await? {
    match (id, ftype) {
      (1, _) => value = Some(r.read_i64().await?),
      (_, t) => r.skip(t).await?,
    }
  }
  Ok(value)
}

async fn read_optional_f64<S: Io>(r: &mut MessageReader<'_, S>) -> Result<Option<f64>> {
  let mut value = None;
  while let Some((ftype, id)) = r.read_field_begin().await? {
    match (id, ftype) {
      (1, _) => value = Some(r.read_f64().await?),
      (_, t) => r.skip(t).await?,
    }
  }
  Ok(value)
}

async fn read_optional_string<S: Io>(r: &mut MessageReader<'_, S>) -> Result<Option<String>> {
  let mut value = None;
  while let Some((ftype, id)) = r.read_field_begin().await? {
    match (id, ftype) {
      (1, _) => value = Some(r.read_string().await?),
      (_, t) => r.skip(t).await?,
    }
  }
  Ok(value)
}

/// Union over the columns of a columnar page. Each column carries its
/// values and a packed null bitmap.
#[derive(Debug, Clone)]
pub enum TColumn {
  Bool { values: Vec<bool>, nulls: Bytes },
  Byte { values: Vec<i8>, nulls: Bytes },
  I16 { values: Vec<i16>, nulls: Bytes },
  I32 { values: Vec<i32>, nulls: Bytes },
  I64 { values: Vec<i64>, nulls: Bytes },
  Double { values: Vec<f64>, nulls: Bytes },
  String { values: Vec<String>, nulls: Bytes },
  Binary { values: Vec<Bytes>, nulls: Bytes },
}

impl TColumn {
  /// Number of rows carried by this column.
  pub fn len(&self) -> usize {
    match self {
      TColumn::Bool { values, .. } => values.len(),
      TColumn::Byte { values, .. } => values.len(),
      TColumn::I16 { values, .. } => values.len(),
      TColumn::I32 { values, .. } => values.len(),
      TColumn::I64 { values, .. } => values.len(),
      TColumn::Double { values, .. } => values.len(),
      TColumn::String { values, .. } => values.len(),
      TColumn::Binary { values, .. } => values.len(),
    }
  }

  pub fn nulls(&self) -> &[u8] {
    match self {
      TColumn::Bool { nulls, .. } => nulls,
      TColumn::Byte { nulls, .. } => nulls,
      TColumn::I16 { nulls, .. } => nulls,
      TColumn::I32 { nulls, .. } => nulls,
      TColumn::I64 { nulls, .. } => nulls,
      TColumn::Double { nulls, .. } => nulls,
      TColumn::String { nulls, .. } => nulls,
      TColumn::Binary { nulls, .. } => nulls,
    }
  }

  pub(crate) async fn read<S: Io>(r: &mut MessageReader<'_, S>) -> Result<Self> {
    let mut column = None;
    while let Some((ftype, id)) = r.read_field_begin().await? {
      if ftype != T_STRUCT {
        r.skip(ftype).await?;
        continue;
      }
      column = Some(Self::read_variant(r, id).await?);
    }
    column.ok_or_else(|| Error::Rpc("column union carries no value".into()))
  }

  async fn read_variant<S: Io>(r: &mut MessageReader<'_, S>, id: i16) -> Result<Self> {
    let mut nulls = Bytes::new();
    match id {
      1 => {
        let mut values = Vec::new();
        while let Some((ftype, fid)) = r.read_field_begin().await? {
          match (fid, ftype) {
            (1, T_LIST) => {
              let (_, len) = r.read_list_begin().await?;
              values.reserve(len);
              for _ in 0..len {
                values.push(r.read_u8().await? != 0);
              }
            }
            (2, T_STRING) => nulls = r.read_binary().await?.into(),
            (_, t) => r.skip(t).await?,
          }
        }
        Ok(TColumn::Bool { values, nulls })
      }
      2 => {
        let mut values = Vec::new();
        while let Some((ftype, fid)) = r.read_field_begin().await? {
          match (fid, ftype) {
            (1, T_LIST) => {
              let (_, len) = r.read_list_begin().await?;
              values.reserve(len);
              for _ in 0..len {
                values.push(r.read_u8().await? as i8);
              }
            }
            (2, T_STRING) => nulls = r.read_binary().await?.into(),
            (_, t) => r.skip(t).await?,
          }
        }
        Ok(TColumn::Byte { values, nulls })
      }
      3 => {
        let mut values = Vec::new();
        while let Some((ftype, fid)) = r.read_field_begin().await? {
          match (fid, ftype) {
            (1, T_LIST) => {
              let (_, len) = r.read_list_begin().await?;
              values.reserve(len);
              for _ in 0..len {
                values.push(r.read_i16().await?);
              }
            }
            (2, T_STRING) => nulls = r.read_binary().await?.into(),
            (_, t) => r.skip(t).await?,
          }
        }
        Ok(TColumn::I16 { values, nulls })
      }
      4 => {
        let mut values = Vec::new();
        while let Some((ftype, fid)) = r.read_field_begin().await? {
          match (fid, ftype) {
            (1, T_LIST) => {
              let (_, len) = r.read_list_begin().await?;
              values.reserve(len);
              for _ in 0..len {
                values.push(r.read_i32().await?);
              }
            }
            (2, T_STRING) => nulls = r.read_binary().await?.into(),
            (_, t) => r.skip(t).await?,
          }
        }
        Ok(TColumn::I32 { values, nulls })
      }
      5 => {
        let mut values = Vec::new();
        while let Some((ftype, fid)) = r.read_field_begin().await? {
          match (fid, ftype) {
            (1, T_LIST) => {
              let (_, len) = r.read_list_begin().await?;
              values.reserve(len);
              for _ in 0..len {
                values.push(r.read_i64().await?);
              }
            }
            (2, T_STRING) => nulls = r.read_binary().await?.into(),
            (_, t) => r.skip(t).await?,
          }
        }
        Ok(TColumn::I64 { values, nulls })
      }
      6 => {
        let mut values = Vec::new();
        while let Some((ftype, fid)) = r.read_field_begin().await? {
          match (fid, ftype) {
            (1, T_LIST) => {
              let (_, len) = r.read_list_begin().await?;
              values.reserve(len);
              for _ in 0..len {
                values.push(r.read_f64().await?);
              }
            }
            (2, T_STRING) => nulls = r.read_binary().await?.into(),
            (_, t) => r.skip(t).await?,
          }
        }
        Ok(TColumn::Double { values, nulls })
      }
      7 => {
        let mut values = Vec::new();
        while let Some((ftype, fid)) = r.read_field_begin().await? {
          match (fid, ftype) {
            (1, T_LIST) => {
              let (_, len) = r.read_list_begin().await?;
              values.reserve(len);
              for _ in 0..len {
                values.push(r.read_string().await?);
              }
            }
            (2, T_STRING) => nulls = r.read_binary().await?.into(),
            (_, t) => r.skip(t).await?,
          }
        }
        Ok(TColumn::String { values, nulls })
      }
      8 => {
        let mut values = Vec::new();
        while let Some((ftype, fid)) = r.read_field_begin().await? {
          match (fid, ftype) {
            (1, T_LIST) => {
              let (_, len) = r.read_list_begin().await?;
              values.reserve(len);
              for _ in 0..len {
                values.push(r.read_binary().await?.into());
              }
            }
            (2, T_STRING) => nulls = r.read_binary().await?.into(),
            (_, t) => r.skip(t).await?,
          }
        }
        Ok(TColumn::Binary { values, nulls })
      }
      other => {
        r.skip(T_STRUCT).await?;
        Err(Error::Rpc(format!("unknown column union tag {}", other)))
      }
    }
  }

  /// Decodes one column record from a compact-encoded blob.
  pub(crate) fn read_compact(r: &mut CompactReader) -> Result<Self> {
    r.read_struct_begin();
    let mut column = None;
    while let Some((ftype, id)) = r.read_field_begin()? {
      if ftype != CT_STRUCT {
        r.skip(ftype)?;
        continue;
      }
      column = Some(Self::read_compact_variant(r, id)?);
    }
    r.read_struct_end();
    column.ok_or_else(|| Error::Rpc("column union carries no value".into()))
  }

  fn read_compact_variant(r: &mut CompactReader, id: i16) -> Result<Self> {
    r.read_struct_begin();
    let mut nulls = Bytes::new();
    let column = match id {
      1 => {
        let mut values = Vec::new();
        while let Some((ftype, fid)) = r.read_field_begin()? {
          match (fid, ftype) {
            (1, CT_LIST) => {
              let (_, len) = r.read_list_begin()?;
              values.reserve(len);
              for _ in 0..len {
                values.push(r.read_bool()?);
              }
            }
            (2, CT_BINARY) => nulls = r.read_binary()?,
            (_, t) => r.skip(t)?,
          }
        }
        TColumn::Bool { values, nulls }
      }
      2 => {
        let mut values = Vec::new();
        while let Some((ftype, fid)) = r.read_field_begin()? {
          match (fid, ftype) {
            (1, CT_LIST) => {
              let (_, len) = r.read_list_begin()?;
              values.reserve(len);
              for _ in 0..len {
                values.push(r.read_byte()?);
              }
            }
            (2, CT_BINARY) => nulls = r.read_binary()?,
            (_, t) => r.skip(t)?,
          }
        }
        TColumn::Byte { values, nulls }
      }
      3 => {
        let mut values = Vec::new();
        while let Some((ftype, fid)) = r.read_field_begin()? {
          match (fid, ftype) {
            (1, CT_LIST) => {
              let (_, len) = r.read_list_begin()?;
              values.reserve(len);
              for _ in 0..len {
                values.push(r.read_i16()?);
              }
            }
            (2, CT_BINARY) => nulls = r.read_binary()?,
            (_, t) => r.skip(t)?,
          }
        }
        TColumn::I16 { values, nulls }
      }
      4 => {
        let mut values = Vec::new();
        while let Some((ftype, fid)) = r.read_field_begin()? {
          match (fid, ftype) {
            (1, CT_LIST) => {
              let (_, len) = r.read_list_begin()?;
              values.reserve(len);
              for _ in 0..len {
                values.push(r.read_i32()?);
              }
            }
            (2, CT_BINARY) => nulls = r.read_binary()?,
            (_, t) => r.skip(t)?,
          }
        }
        TColumn::I32 { values, nulls }
      }
      5 => {
        let mut values = Vec::new();
        while let Some((ftype, fid)) = r.read_field_begin()? {
          match (fid, ftype) {
            (1, CT_LIST) => {
              let (_, len) = r.read_list_begin()?;
              values.reserve(len);
              for _ in 0..len {
                values.push(r.read_i64()?);
              }
            }
            (2, CT_BINARY) => nulls = r.read_binary()?,
            (_, t) => r.skip(t)?,
          }
        }
        TColumn::I64 { values, nulls }
      }
      6 => {
        let mut values = Vec::new();
        while let Some((ftype, fid)) = r.read_field_begin()? {
          match (fid, ftype) {
            (1, CT_LIST) => {
              let (_, len) = r.read_list_begin()?;
              values.reserve(len);
              for _ in 0..len {
                values.push(r.read_double()?);
              }
            }
            (2, CT_BINARY) => nulls = r.read_binary()?,
            (_, t) => r.skip(t)?,
          }
        }
        TColumn::Double { values, nulls }
      }
      7 => {
        let mut values = Vec::new();
        while let Some((ftype, fid)) = r.read_field_begin()? {
          match (fid, ftype) {
            (1, CT_LIST) => {
              let (_, len) = r.read_list_begin()?;
              values.reserve(len);
              for _ in 0..len {
                values.push(r.read_string()?);
              }
            }
            (2, CT_BINARY) => nulls = r.read_binary()?,
            (_, t) => r.skip(t)?,
          }
        }
        TColumn::String { values, nulls }
      }
      8 => {
        let mut values = Vec::new();
        while let Some((ftype, fid)) = r.read_field_begin()? {
          match (fid, ftype) {
            (1, CT_LIST) => {
              let (_, len) = r.read_list_begin()?;
              values.reserve(len);
              for _ in 0..len {
                values.push(r.read_binary()?);
              }
            }
            (2, CT_BINARY) => nulls = r.read_binary()?,
            (_, t) => r.skip(t)?,
          }
        }
        TColumn::Binary { values, nulls }
      }
      other => {
        return Err(Error::Rpc(format!("unknown column union tag {}", other)));
      }
    };
    r.read_struct_end();
    Ok(column)
  }
}
