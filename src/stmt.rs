use tracing::debug;

use crate::conn::Connection;
use crate::rpc::types::{
  TCloseOperationReq, TExecuteStatementReq, TGetOperationStatusReq, TOperationHandle, TOperationState,
};
use crate::rows::Rows;
use crate::{Error, Result};

/// One SQL statement bound to a connection. Holds at most one in-flight
/// operation handle at a time.
pub struct Statement<'a> {
  pub(crate) conn: &'a mut Connection,
  sql: String,
  pub(crate) handle: Option<TOperationHandle>,

  is_cancelled: bool,
  is_query_closed: bool,
  is_execute_statement_failed: bool,
  is_operation_complete: bool,
}

impl<'a> Statement<'a> {
  pub(crate) fn new(conn: &'a mut Connection, sql: String) -> Self {
    Self {
      conn,
      sql,
      handle: None,
      is_cancelled: false,
      is_query_closed: false,
      is_execute_statement_failed: false,
      is_operation_complete: false,
    }
  }

  pub fn sql(&self) -> &str {
    &self.sql
  }

  pub fn is_cancelled(&self) -> bool {
    self.is_cancelled
  }

  pub fn is_query_closed(&self) -> bool {
    self.is_query_closed
  }

  pub fn is_execute_statement_failed(&self) -> bool {
    self.is_execute_statement_failed
  }

  pub fn is_operation_complete(&self) -> bool {
    self.is_operation_complete
  }

  fn reset_flags(&mut self) {
    self.is_cancelled = false;
    self.is_query_closed = false;
    self.is_execute_statement_failed = false;
    self.is_operation_complete = false;
  }

  /// Submits the statement asynchronously; the server starts working and
  /// hands back an operation handle to poll.
  pub async fn execute(&mut self) -> Result<()> {
    self.close_operation().await?;
    self.reset_flags();

    let req = TExecuteStatementReq {
      session_handle: self.conn.session_handle.clone(),
      statement: self.sql.clone(),
      run_async: true,
    };
    let resp = match self.conn.client.execute_statement(req).await {
      Ok(resp) => resp,
      Err(err) => {
        self.is_execute_statement_failed = true;
        return Err(err);
      }
    };
    if !resp.status.verify_success_with_info() {
      self.is_execute_statement_failed = true;
      return Err(Error::Server(resp.status.to_string()));
    }
    self.handle = resp.operation_handle;
    self.is_execute_statement_failed = false;
    debug!(sql = %self.sql, "statement submitted");
    Ok(())
  }

  /// Polls the operation until the server reports a terminal state.
  /// FINISHED and CLOSED latch completion; everything else terminal is an
  /// error. RUNNING, PENDING and INITIALIZED keep the loop going.
  pub async fn wait_for_operation(&mut self) -> Result<()> {
    while !self.is_operation_complete {
      let handle = self
        .handle
        .clone()
        .ok_or_else(|| Error::Operation("no operation in flight".into()))?;
      let resp = self
        .conn
        .client
        .get_operation_status(TGetOperationStatusReq { operation_handle: handle })
        .await?;
      if !resp.status.verify_success_with_info() {
        return Err(Error::Server(resp.status.to_string()));
      }

      match resp.operation_state.and_then(TOperationState::from_i32) {
        Some(TOperationState::Finished) | Some(TOperationState::Closed) => {
          self.is_operation_complete = true;
        }
        Some(TOperationState::Canceled) => {
          self.is_cancelled = true;
          return Err(Error::Operation("query was cancelled".into()));
        }
        Some(TOperationState::Timedout) => {
          return Err(Error::Operation("query timed out".into()));
        }
        Some(TOperationState::Error) => {
          return Err(Error::Operation(format!(
            "msg: {}, sqlState: {}, errorCode: {}",
            resp.error_message.unwrap_or_default(),
            resp.sql_state.unwrap_or_default(),
            resp.error_code.unwrap_or_default(),
          )));
        }
        Some(TOperationState::Unknown) => {
          return Err(Error::Operation("unknown query".into()));
        }
        _ => {}
      }
    }
    Ok(())
  }

  /// Executes the statement and returns a lazy row cursor over its
  /// results.
  pub async fn query(mut self) -> Result<Rows<'a>> {
    self.execute().await?;
    Rows::new(self).await
  }

  /// Closes the server-side operation, if one exists. Latches the closed
  /// flag and clears any recorded execute failure.
  pub async fn close(&mut self) -> Result<()> {
    self.close_operation().await
  }

  pub(crate) async fn close_operation(&mut self) -> Result<()> {
    if let Some(handle) = self.handle.clone() {
      let resp = self
        .conn
        .client
        .close_operation(TCloseOperationReq { operation_handle: handle })
        .await?;
      if !resp.status.verify_success_with_info() {
        return Err(Error::Server(resp.status.to_string()));
      }
    }
    self.is_query_closed = true;
    self.is_execute_statement_failed = false;
    self.handle = None;
    Ok(())
  }
}

#[cfg(test)]
mod test {
  use crate::rpc::types::PROTOCOL_V8;
  use crate::rpc::wire::{T_I32, T_STRING, T_STRUCT};
  use crate::testutil::{connection_pair, read_call, write_operation_handle, write_reply, write_success_status};

  #[tokio::test]
  async fn poll_loops_until_terminal_error_and_close_still_succeeds() {
    let (mut conn, mut server_transport) = connection_pair(1000, PROTOCOL_V8);

    let server = tokio::spawn(async move {
      let (name, seq_id) = read_call(&mut server_transport).await;
      assert_eq!("ExecuteStatement", name);
      write_reply(&mut server_transport, "ExecuteStatement", seq_id, |w| {
        write_success_status(w);
        write_operation_handle(w, 2);
      })
      .await;

      // INITIALIZED, RUNNING, RUNNING, then a terminal ERROR.
      for state in [0, 1, 1] {
        let (name, seq_id) = read_call(&mut server_transport).await;
        assert_eq!("GetOperationStatus", name);
        write_reply(&mut server_transport, "GetOperationStatus", seq_id, |w| {
          write_success_status(w);
          w.field_begin(T_I32, 2);
          w.put_i32(state);
        })
        .await;
      }
      let (name, seq_id) = read_call(&mut server_transport).await;
      assert_eq!("GetOperationStatus", name);
      write_reply(&mut server_transport, "GetOperationStatus", seq_id, |w| {
        write_success_status(w);
        w.field_begin(T_I32, 2);
        w.put_i32(5);
        w.field_begin(T_STRING, 3);
        w.put_string("42000");
        w.field_begin(T_I32, 4);
        w.put_i32(10);
        w.field_begin(T_STRING, 5);
        w.put_string("x");
      })
      .await;

      let (name, seq_id) = read_call(&mut server_transport).await;
      assert_eq!("CloseOperation", name);
      write_reply(&mut server_transport, "CloseOperation", seq_id, write_success_status).await;
    });

    let mut stmt = conn.prepare("select * from missing");
    stmt.execute().await.unwrap();
    assert!(!stmt.is_execute_statement_failed());
    assert!(stmt.handle.is_some());

    let err = stmt.wait_for_operation().await.unwrap_err().to_string();
    assert!(err.contains("x"), "{}", err);
    assert!(err.contains("42000"), "{}", err);
    assert!(err.contains("10"), "{}", err);
    assert!(!stmt.is_operation_complete());
    // The handle survives a terminal error so the operation can be closed.
    assert!(stmt.handle.is_some());

    stmt.close().await.unwrap();
    assert!(stmt.handle.is_none());
    assert!(stmt.is_query_closed());
    server.await.unwrap();
  }

  #[tokio::test]
  async fn poll_latches_completion_on_finished() {
    let (mut conn, mut server_transport) = connection_pair(1000, PROTOCOL_V8);

    let server = tokio::spawn(async move {
      let (_, seq_id) = read_call(&mut server_transport).await;
      write_reply(&mut server_transport, "ExecuteStatement", seq_id, |w| {
        write_success_status(w);
        write_operation_handle(w, 2);
      })
      .await;

      let (name, seq_id) = read_call(&mut server_transport).await;
      assert_eq!("GetOperationStatus", name);
      write_reply(&mut server_transport, "GetOperationStatus", seq_id, |w| {
        write_success_status(w);
        w.field_begin(T_I32, 2);
        w.put_i32(2);
      })
      .await;
      // No further status calls: completion latches client-side.
    });

    let mut stmt = conn.prepare("select 1");
    stmt.execute().await.unwrap();
    stmt.wait_for_operation().await.unwrap();
    assert!(stmt.is_operation_complete());
    stmt.wait_for_operation().await.unwrap();
    server.await.unwrap();
  }

  #[tokio::test]
  async fn failed_execute_latches_flag() {
    let (mut conn, mut server_transport) = connection_pair(1000, PROTOCOL_V8);

    let server = tokio::spawn(async move {
      let (_, seq_id) = read_call(&mut server_transport).await;
      write_reply(&mut server_transport, "ExecuteStatement", seq_id, |w| {
        // ERROR_STATUS with a server message, no handle.
        w.field_begin(T_STRUCT, 1);
        w.field_begin(T_I32, 1);
        w.put_i32(3);
        w.field_begin(T_STRING, 5);
        w.put_string("semantic analysis failed");
        w.stop();
      })
      .await;
    });

    let mut stmt = conn.prepare("select bogus");
    let err = stmt.execute().await.unwrap_err().to_string();
    assert!(err.contains("semantic analysis failed"), "{}", err);
    assert!(stmt.is_execute_statement_failed());
    assert!(stmt.handle.is_none());

    // Close short-circuits without a handle and clears the failure.
    stmt.close().await.unwrap();
    assert!(!stmt.is_execute_statement_failed());
    assert!(stmt.is_query_closed());
    server.await.unwrap();
  }

  #[tokio::test]
  async fn begin_transaction_is_unsupported() {
    let (mut conn, _server_transport) = connection_pair(1000, PROTOCOL_V8);
    let err = conn.begin_transaction().unwrap_err().to_string();
    assert!(err.contains("not supported"), "{}", err);
  }

}
