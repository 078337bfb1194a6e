//! Protocol-level session tests over an in-memory duplex stream.

use kvstore::MemStore;
use pgsrv::Handler;
use sqlengine::{Engine, Options, Params};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

/// Builds an engine with database `d` and table `t(id INTEGER, v VARCHAR)`
/// holding two rows.
fn seeded_engine() -> Arc<Engine> {
    let engine = Arc::new(Engine::new(MemStore::new(), Options::default()));
    let mut session = engine.session();
    session
        .exec("CREATE DATABASE d; USE DATABASE d", &Params::new())
        .unwrap();
    session
        .exec(
            "CREATE TABLE t (id INTEGER, v VARCHAR, PRIMARY KEY id)",
            &Params::new(),
        )
        .unwrap();
    session
        .exec(
            "UPSERT INTO t (id, v) VALUES (1, 'a'), (2, 'b')",
            &Params::new(),
        )
        .unwrap();
    engine
}

struct TestClient {
    stream: DuplexStream,
}

impl TestClient {
    /// Spawns a handler on the server half and completes the startup
    /// handshake, consuming messages through the first ReadyForQuery.
    async fn connect(engine: Arc<Engine>) -> TestClient {
        let (client, server) = tokio::io::duplex(1 << 16);
        tokio::spawn(async move {
            let handler = Handler::new(engine);
            let _ = handler.handle_connection(server).await;
        });

        let mut client = TestClient { stream: client };
        client.send_startup().await;

        let msgs = client.read_until_ready().await;
        assert_eq!(msgs[0].0, b'R', "expected AuthenticationOk first");
        assert!(msgs.iter().any(|(t, _)| *t == b'S'));
        assert!(msgs.iter().any(|(t, _)| *t == b'K'));
        client
    }

    async fn send_startup(&mut self) {
        let mut params = Vec::new();
        for (k, v) in [("user", "tester"), ("database", "d")] {
            params.extend_from_slice(k.as_bytes());
            params.push(0);
            params.extend_from_slice(v.as_bytes());
            params.push(0);
        }
        params.push(0);

        let len = 4 + 4 + params.len();
        self.stream.write_i32(len as i32).await.unwrap();
        self.stream.write_i32(0x30000).await.unwrap();
        self.stream.write_all(&params).await.unwrap();
    }

    async fn send_frame(&mut self, msg_type: u8, payload: &[u8]) {
        self.stream.write_u8(msg_type).await.unwrap();
        self.stream.write_i32(payload.len() as i32 + 4).await.unwrap();
        self.stream.write_all(payload).await.unwrap();
    }

    async fn send_query(&mut self, sql: &str) {
        let mut payload = sql.as_bytes().to_vec();
        payload.push(0);
        self.send_frame(b'Q', &payload).await;
    }

    async fn send_parse(&mut self, name: &str, sql: &str) {
        let mut payload = Vec::new();
        payload.extend_from_slice(name.as_bytes());
        payload.push(0);
        payload.extend_from_slice(sql.as_bytes());
        payload.push(0);
        payload.extend_from_slice(&0i16.to_be_bytes());
        self.send_frame(b'P', &payload).await;
    }

    async fn send_bind(&mut self, portal: &str, statement: &str, params: &[&[u8]]) {
        let mut payload = Vec::new();
        payload.extend_from_slice(portal.as_bytes());
        payload.push(0);
        payload.extend_from_slice(statement.as_bytes());
        payload.push(0);
        payload.extend_from_slice(&0i16.to_be_bytes()); // all-text params
        payload.extend_from_slice(&(params.len() as i16).to_be_bytes());
        for param in params {
            payload.extend_from_slice(&(param.len() as i32).to_be_bytes());
            payload.extend_from_slice(param);
        }
        payload.extend_from_slice(&0i16.to_be_bytes()); // default result formats
        self.send_frame(b'B', &payload).await;
    }

    async fn send_describe(&mut self, object_type: u8, name: &str) {
        let mut payload = vec![object_type];
        payload.extend_from_slice(name.as_bytes());
        payload.push(0);
        self.send_frame(b'D', &payload).await;
    }

    async fn send_execute(&mut self, portal: &str) {
        let mut payload = portal.as_bytes().to_vec();
        payload.push(0);
        payload.extend_from_slice(&0i32.to_be_bytes());
        self.send_frame(b'E', &payload).await;
    }

    async fn send_sync(&mut self) {
        self.send_frame(b'S', &[]).await;
    }

    async fn read_msg(&mut self) -> (u8, Vec<u8>) {
        let msg_type = self.stream.read_u8().await.unwrap();
        let len = self.stream.read_i32().await.unwrap() as usize;
        let mut payload = vec![0; len - 4];
        self.stream.read_exact(&mut payload).await.unwrap();
        (msg_type, payload)
    }

    /// Reads messages until (and including) ReadyForQuery.
    async fn read_until_ready(&mut self) -> Vec<(u8, Vec<u8>)> {
        let mut msgs = Vec::new();
        loop {
            let msg = self.read_msg().await;
            let done = msg.0 == b'Z';
            msgs.push(msg);
            if done {
                return msgs;
            }
        }
    }
}

fn types(msgs: &[(u8, Vec<u8>)]) -> Vec<u8> {
    msgs.iter().map(|(t, _)| *t).collect()
}

/// SQLSTATE field of an ErrorResponse payload.
fn error_code(payload: &[u8]) -> String {
    payload
        .split(|b| *b == 0)
        .find_map(|field| field.strip_prefix(b"C"))
        .map(|code| String::from_utf8_lossy(code).to_string())
        .expect("error response has a code field")
}

#[tokio::test]
async fn ssl_request_is_refused_with_n() {
    let engine = seeded_engine();
    let (mut client, server) = tokio::io::duplex(1 << 16);
    tokio::spawn(async move {
        let handler = Handler::new(engine);
        let _ = handler.handle_connection(server).await;
    });

    client.write_i32(8).await.unwrap();
    client.write_i32((1234 << 16) ^ 5679).await.unwrap();
    assert_eq!(client.read_u8().await.unwrap(), b'N');

    // the client retries with a plain startup and the session proceeds
    let mut client = TestClient { stream: client };
    client.send_startup().await;
    let msgs = client.read_until_ready().await;
    assert_eq!(msgs[0].0, b'R');
}

#[tokio::test]
async fn simple_query_streams_rows() {
    let mut client = TestClient::connect(seeded_engine()).await;
    client
        .send_query("SELECT id, v FROM t ORDER BY id DESC")
        .await;

    let msgs = client.read_until_ready().await;
    assert_eq!(types(&msgs), vec![b'T', b'D', b'D', b'C', b'Z']);

    // first data row is (2, 'b'): 2 cells, "2" then "b"
    let (_, first_row) = &msgs[1];
    assert_eq!(&first_row[..2], &[0, 2]);
    assert!(first_row[2..].starts_with(&[0, 0, 0, 1, b'2']));

    let (_, complete) = &msgs[3];
    assert_eq!(&complete[..], b"SELECT 2\x00");
}

#[tokio::test]
async fn simple_query_set_and_version() {
    let mut client = TestClient::connect(seeded_engine()).await;

    client.send_query("SET client_encoding TO 'UTF8'").await;
    let msgs = client.read_until_ready().await;
    assert_eq!(types(&msgs), vec![b'C', b'Z']);

    client.send_query("SELECT VERSION()").await;
    let msgs = client.read_until_ready().await;
    assert_eq!(types(&msgs), vec![b'T', b'D', b'C', b'Z']);

    client.send_query(";").await;
    let msgs = client.read_until_ready().await;
    assert_eq!(types(&msgs), vec![b'C', b'Z']);
}

#[tokio::test]
async fn simple_query_rejects_database_statements() {
    let mut client = TestClient::connect(seeded_engine()).await;

    client.send_query("USE DATABASE d").await;
    let msgs = client.read_until_ready().await;
    assert_eq!(types(&msgs), vec![b'E', b'Z']);
    assert_eq!(error_code(&msgs[0].1), "0A000");

    client.send_query("CREATE DATABASE nope").await;
    let msgs = client.read_until_ready().await;
    assert_eq!(types(&msgs), vec![b'E', b'Z']);
}

#[tokio::test]
async fn simple_query_dml_gets_command_tags() {
    let mut client = TestClient::connect(seeded_engine()).await;

    client.send_query("UPSERT INTO t (id, v) VALUES (3, 'c')").await;
    let msgs = client.read_until_ready().await;
    assert_eq!(types(&msgs), vec![b'C', b'Z']);
    assert_eq!(&msgs[0].1[..], b"UPSERT 1\x00");

    client.send_query("DELETE FROM t WHERE id = 3").await;
    let msgs = client.read_until_ready().await;
    assert_eq!(&msgs[0].1[..], b"DELETE 1\x00");
}

#[tokio::test]
async fn extended_query_happy_path() {
    let mut client = TestClient::connect(seeded_engine()).await;

    client
        .send_parse("", "SELECT v FROM t WHERE id = $1")
        .await;
    client.send_bind("", "", &[b"1"]).await;
    client.send_describe(b'P', "").await;
    client.send_execute("").await;
    client.send_sync().await;

    let msgs = client.read_until_ready().await;
    assert_eq!(types(&msgs), vec![b'1', b'2', b'T', b'D', b'C', b'Z']);

    // the single data row carries 'a'
    let (_, row) = &msgs[3];
    assert_eq!(&row[..], &[0, 1, 0, 0, 0, 1, b'a']);
}

#[tokio::test]
async fn describe_statement_reports_parameters() {
    let mut client = TestClient::connect(seeded_engine()).await;

    client
        .send_parse("stmt", "SELECT v FROM t WHERE id = $1")
        .await;
    client.send_describe(b'S', "stmt").await;
    client.send_sync().await;

    let msgs = client.read_until_ready().await;
    assert_eq!(types(&msgs), vec![b'1', b't', b'T', b'Z']);

    // one parameter with the int8 oid
    let (_, params) = &msgs[1];
    assert_eq!(&params[..], &[0, 1, 0, 0, 0, 20]);
}

#[tokio::test]
async fn extended_error_recovery_discards_until_sync() {
    let mut client = TestClient::connect(seeded_engine()).await;

    // parse fails on an unknown table; bind and execute must be discarded
    client.send_parse("", "SELECT * FROM nope").await;
    client.send_bind("", "", &[]).await;
    client.send_execute("").await;
    client.send_sync().await;

    let msgs = client.read_until_ready().await;
    assert_eq!(types(&msgs), vec![b'E', b'Z']);
    assert_eq!(error_code(&msgs[0].1), "42P01");
}

#[tokio::test]
async fn sync_outside_error_state_answers_once() {
    let mut client = TestClient::connect(seeded_engine()).await;

    client.send_sync().await;
    let msgs = client.read_until_ready().await;
    assert_eq!(types(&msgs), vec![b'Z']);

    client.send_sync().await;
    let msgs = client.read_until_ready().await;
    assert_eq!(types(&msgs), vec![b'Z']);
}

#[tokio::test]
async fn non_select_cannot_be_prepared() {
    let mut client = TestClient::connect(seeded_engine()).await;

    client
        .send_parse("", "UPSERT INTO t (id, v) VALUES (9, 'z')")
        .await;
    client.send_sync().await;

    let msgs = client.read_until_ready().await;
    assert_eq!(types(&msgs), vec![b'E', b'Z']);
    assert_eq!(error_code(&msgs[0].1), "0A000");
}

#[tokio::test]
async fn redefining_a_named_statement_is_fatal() {
    let mut client = TestClient::connect(seeded_engine()).await;

    client.send_parse("s1", "SELECT id FROM t").await;
    client.send_sync().await;
    let msgs = client.read_until_ready().await;
    assert_eq!(types(&msgs), vec![b'1', b'Z']);

    client.send_parse("s1", "SELECT v FROM t").await;
    let (msg_type, payload) = client.read_msg().await;
    assert_eq!(msg_type, b'E');
    assert!(payload.starts_with(b"SFATAL\x00"));

    // the server closes the connection after the fatal error
    let mut rest = Vec::new();
    client.stream.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn set_prepared_through_extended_protocol() {
    let mut client = TestClient::connect(seeded_engine()).await;

    client.send_parse("", "SET client_encoding TO 'UTF8'").await;
    client.send_bind("", "", &[]).await;
    client.send_execute("").await;
    client.send_sync().await;

    let msgs = client.read_until_ready().await;
    // EmptyQueryResponse instead of CommandComplete
    assert_eq!(types(&msgs), vec![b'1', b'2', b'I', b'Z']);
}

#[tokio::test]
async fn unknown_message_type_is_reported() {
    let mut client = TestClient::connect(seeded_engine()).await;

    client.send_frame(b'z', b"junk").await;
    let (msg_type, payload) = client.read_msg().await;
    assert_eq!(msg_type, b'E');
    assert_eq!(error_code(&payload), "08P01");

    // the session keeps serving
    client.send_query("SELECT COUNT() FROM t").await;
    let msgs = client.read_until_ready().await;
    assert_eq!(types(&msgs), vec![b'T', b'D', b'C', b'Z']);
}
