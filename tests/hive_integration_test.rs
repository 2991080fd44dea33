use hive2::{Connection, Value};

// These run against a real HiveServer2, e.g. the apache/hive docker image
// published on port 10000.

#[tokio::test]
#[ignore = "requires a running HiveServer2"]
async fn test_connect_and_show_databases() {
  let mut conn = Connection::connect("hive2://localhost:10000/default;auth=noSasl").await.unwrap();
  let stmt = conn.prepare("SHOW DATABASES");
  let mut rows = stmt.query().await.unwrap();
  assert_eq!(["database_name".to_string()].as_slice(), rows.column_names());

  let mut names = Vec::new();
  while let Some(row) = rows.next().await.unwrap() {
    match row.into_iter().next().flatten() {
      Some(Value::String(name)) => names.push(name),
      other => panic!("unexpected cell {:?}", other),
    }
  }
  assert!(names.contains(&"default".to_string()));

  rows.close().await.unwrap();
  conn.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running HiveServer2"]
async fn test_typed_select() {
  let mut conn = Connection::connect("hive2://localhost:10000/default;auth=noSasl").await.unwrap();
  let stmt = conn.prepare("SELECT 1, CAST(2.5 AS DOUBLE), 'three', NULL");
  let mut rows = stmt.query().await.unwrap();

  let row = rows.next().await.unwrap().unwrap();
  assert_eq!(Some(Value::Int(1)), row[0]);
  assert_eq!(Some(Value::Double(2.5)), row[1]);
  assert_eq!(Some(Value::String("three".to_string())), row[2]);
  assert_eq!(None, row[3]);
  assert_eq!(None, rows.next().await.unwrap());

  rows.close().await.unwrap();
  conn.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a kerberized HiveServer2 and a reachable KDC"]
async fn test_connect_with_kerberos() {
  let conn = Connection::connect(
    "hive2://warehouse.example.com:10000/default;principal=hive/_HOST@EXAMPLE.COM;\
     user.principal=etl@EXAMPLE.COM;user.keytab=/etc/security/etl.keytab;user.krb5.conf=/etc/krb5.conf",
  )
  .await
  .unwrap();
  conn.close().await.unwrap();
}
