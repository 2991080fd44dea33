use bytes::Bytes;
use tracing::debug;

use crate::rpc::compact::CompactReader;
use crate::rpc::types::{
  TColumn, TColumnDesc, TColumnValue, TFetchResultsReq, TGetResultSetMetadataReq, TRow, TRowSet, TTypeId, FETCH_NEXT,
  PROTOCOL_V6,
};
use crate::stmt::Statement;
use crate::{Error, Result};

/// A strongly-typed cell value. Cells are `Option<Value>`; `None` is SQL
/// NULL.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
  Bool(bool),
  TinyInt(i8),
  SmallInt(i16),
  Int(i32),
  BigInt(i64),
  Double(f64),
  String(String),
  Binary(Bytes),
}

pub type Row = Vec<Option<Value>>;

/// Lazy row cursor over a statement's results. Pages are fetched on
/// demand; each page is decoded row-oriented or columnar depending on the
/// server's protocol version.
pub struct Rows<'a> {
  stmt: Statement<'a>,
  columns: Vec<TColumnDesc>,
  column_names: Vec<String>,
  page: Option<Page>,
}

impl<'a> Rows<'a> {
  /// Retrieves and caches the result schema. Statements without one
  /// (DDL) legally yield an empty column list.
  pub(crate) async fn new(mut stmt: Statement<'a>) -> Result<Self> {
    let handle = stmt
      .handle
      .clone()
      .ok_or_else(|| Error::Operation("no operation in flight".into()))?;
    let resp = stmt
      .conn
      .client
      .get_result_set_metadata(TGetResultSetMetadataReq { operation_handle: handle })
      .await?;
    resp.status.check(false)?;

    let columns = resp.schema.map(|schema| schema.columns).unwrap_or_default();
    let column_names = columns.iter().map(|c| c.column_name.clone()).collect();
    Ok(Self {
      stmt,
      columns,
      column_names,
      page: None,
    })
  }

  pub fn column_names(&self) -> &[String] {
    &self.column_names
  }

  pub fn columns(&self) -> &[TColumnDesc] {
    &self.columns
  }

  /// The database type name of a column, e.g. `VARCHAR`.
  pub fn column_type_name(&self, index: usize) -> Option<&'static str> {
    self
      .columns
      .get(index)
      .and_then(TColumnDesc::primitive_entry)
      .and_then(|entry| entry.type_id())
      .map(|type_id| type_id.name())
  }

  /// The declared length of a CHAR or VARCHAR column.
  pub fn column_length(&self, index: usize) -> Option<i32> {
    let entry = self.columns.get(index).and_then(TColumnDesc::primitive_entry)?;
    match entry.type_id()? {
      TTypeId::Char | TTypeId::Varchar => entry.qualifier_i32(crate::rpc::types::CHARACTER_MAXIMUM_LENGTH),
      _ => None,
    }
  }

  /// Precision and scale of a DECIMAL column; absent qualifiers default
  /// to 10 and 0.
  pub fn column_precision_scale(&self, index: usize) -> Option<(i32, i32)> {
    let entry = self.columns.get(index).and_then(TColumnDesc::primitive_entry)?;
    if entry.type_id()? != TTypeId::Decimal {
      return None;
    }
    let precision = entry.qualifier_i32(crate::rpc::types::PRECISION).unwrap_or(10);
    let scale = entry.qualifier_i32(crate::rpc::types::SCALE).unwrap_or(0);
    Some((precision, scale))
  }

  /// Returns the next row, or `None` once the result stream is drained.
  /// May block in the poll loop and once per fetched page.
  pub async fn next(&mut self) -> Result<Option<Row>> {
    self.stmt.wait_for_operation().await?;

    if !self.page.as_ref().map(Page::has_next).unwrap_or(false) {
      let handle = self
        .stmt
        .handle
        .clone()
        .ok_or_else(|| Error::Operation("no operation in flight".into()))?;
      let resp = self
        .stmt
        .conn
        .client
        .fetch_results(TFetchResultsReq {
          operation_handle: handle,
          orientation: FETCH_NEXT,
          max_rows: self.stmt.conn.fetch_size,
        })
        .await?;
      if !resp.status.verify_success_with_info() {
        return Err(Error::Server(resp.status.to_string()));
      }
      let results = resp
        .results
        .ok_or_else(|| Error::Rpc("fetch reply carries no result page".into()))?;

      let page = if self.stmt.conn.server_protocol > PROTOCOL_V6 {
        Page::columnar(results)?
      } else {
        Page::row_based(results)
      };
      debug!(rows = page.remaining(), "fetched result page");
      self.page = Some(page);
    }

    Ok(self.page.as_mut().and_then(Page::next))
  }

  /// Closes the underlying operation.
  pub async fn close(mut self) -> Result<()> {
    self.stmt.close_operation().await
  }
}

/// One decoded result page.
enum Page {
  Rows { rows: Vec<TRow>, offset: usize },
  Columns { columns: Vec<TColumn>, row_count: usize, offset: usize },
}

impl Page {
  fn row_based(results: TRowSet) -> Self {
    Page::Rows {
      rows: results.rows,
      offset: 0,
    }
  }

  /// Builds a columnar page. A page arrives either with explicit columns
  /// or as one compact-encoded blob holding `column_count` column
  /// records.
  fn columnar(results: TRowSet) -> Result<Self> {
    let columns = match results.binary_columns {
      Some(blob) => {
        let column_count = results.column_count.unwrap_or(0).max(0) as usize;
        let mut reader = CompactReader::new(blob);
        let mut columns = Vec::with_capacity(column_count);
        for _ in 0..column_count {
          columns.push(TColumn::read_compact(&mut reader)?);
        }
        columns
      }
      None => results.columns,
    };

    let row_count = columns.first().map(TColumn::len).unwrap_or(0);
    if columns.iter().any(|column| column.len() != row_count) {
      return Err(Error::Rpc("columns of a result page disagree on row count".into()));
    }
    Ok(Page::Columns {
      columns,
      row_count,
      offset: 0,
    })
  }

  fn has_next(&self) -> bool {
    self.remaining() > 0
  }

  fn remaining(&self) -> usize {
    match self {
      Page::Rows { rows, offset } => rows.len().saturating_sub(*offset),
      Page::Columns { row_count, offset, .. } => row_count.saturating_sub(*offset),
    }
  }

  fn next(&mut self) -> Option<Row> {
    match self {
      Page::Rows { rows, offset } => {
        let row = rows.get(*offset)?;
        *offset += 1;
        Some(row.col_vals.iter().map(row_cell).collect())
      }
      Page::Columns {
        columns,
        row_count,
        offset,
      } => {
        if *offset >= *row_count {
          return None;
        }
        let row = columns.iter().map(|column| column_cell(column, *offset)).collect();
        *offset += 1;
        Some(row)
      }
    }
  }
}

fn row_cell(value: &TColumnValue) -> Option<Value> {
  match value {
    TColumnValue::Bool(v) => v.map(Value::Bool),
    TColumnValue::Byte(v) => v.map(Value::TinyInt),
    TColumnValue::I16(v) => v.map(Value::SmallInt),
    TColumnValue::I32(v) => v.map(Value::Int),
    TColumnValue::I64(v) => v.map(Value::BigInt),
    TColumnValue::Double(v) => v.map(Value::Double),
    TColumnValue::String(v) => v.clone().map(Value::String),
    TColumnValue::Unset => None,
  }
}

/// Row `index` of a column is NULL iff bit `index % 8` of byte
/// `index / 8` is set in the column's null bitmap.
fn is_null(nulls: &[u8], index: usize) -> bool {
  nulls.get(index / 8).map(|byte| byte & (1 << (index % 8)) != 0).unwrap_or(false)
}

fn column_cell(column: &TColumn, index: usize) -> Option<Value> {
  if is_null(column.nulls(), index) {
    return None;
  }
  match column {
    TColumn::Bool { values, .. } => values.get(index).copied().map(Value::Bool),
    TColumn::Byte { values, .. } => values.get(index).copied().map(Value::TinyInt),
    TColumn::I16 { values, .. } => values.get(index).copied().map(Value::SmallInt),
    TColumn::I32 { values, .. } => values.get(index).copied().map(Value::Int),
    TColumn::I64 { values, .. } => values.get(index).copied().map(Value::BigInt),
    TColumn::Double { values, .. } => values.get(index).copied().map(Value::Double),
    TColumn::String { values, .. } => values.get(index).cloned().map(Value::String),
    TColumn::Binary { values, .. } => values.get(index).cloned().map(Value::Binary),
  }
}
