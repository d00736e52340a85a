//! Integration test: full dispatch loop over real TCP.
//!
//! Wires endpoint + queue + pool + workers against a scripted backend
//! and drives it with protocol-level clients. Covers the happy path,
//! the codec error-surfacing divergence, malformed-frame resilience
//! and reply routing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use sqlmux::{
    codec_by_name, ClientConn, Connection, ConnectionPool, Connector, Dispatcher, Endpoint,
    RequestHandler, RequestQueue, Result, Row, ServerError,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Scripted outcome per query text; unknown queries return no rows.
#[derive(Clone)]
enum Outcome {
    Rows(Vec<Row>),
    Fail(String),
}

struct ScriptedConnector {
    script: HashMap<String, Outcome>,
}

struct ScriptedConn {
    script: Arc<HashMap<String, Outcome>>,
}

struct SharedScript(Arc<HashMap<String, Outcome>>);

impl Connector for SharedScript {
    fn connect(&self) -> Result<Box<dyn Connection>> {
        Ok(Box::new(ScriptedConn {
            script: Arc::clone(&self.0),
        }))
    }
}

impl Connection for ScriptedConn {
    fn is_valid(&mut self) -> bool {
        true
    }

    fn execute(&mut self, sql: &str) -> Result<Vec<Row>> {
        match self.script.get(sql) {
            Some(Outcome::Rows(rows)) => Ok(rows.clone()),
            Some(Outcome::Fail(message)) => Err(ServerError::Query(message.clone())),
            None => Ok(vec![]),
        }
    }
}

impl ScriptedConnector {
    fn new() -> Self {
        Self {
            script: HashMap::new(),
        }
    }

    fn rows(mut self, sql: &str, rows: Vec<Row>) -> Self {
        self.script.insert(sql.to_string(), Outcome::Rows(rows));
        self
    }

    fn failure(mut self, sql: &str, message: &str) -> Self {
        self.script
            .insert(sql.to_string(), Outcome::Fail(message.to_string()));
        self
    }
}

struct TestServer {
    addr: String,
    stop: Arc<AtomicBool>,
    pool: Arc<ConnectionPool>,
    thread: Option<JoinHandle<()>>,
}

impl TestServer {
    fn start(codec_name: &str, connector: ScriptedConnector) -> Self {
        let script = Arc::new(connector.script);
        let pool = ConnectionPool::new(
            Arc::new(SharedScript(script)),
            2,
            Duration::from_secs(3600),
        )
        .unwrap();
        let endpoint = Endpoint::bind("127.0.0.1:0").unwrap();
        let addr = endpoint.local_addr().to_string();
        let codec = codec_by_name(codec_name).unwrap();
        let queue = Arc::new(RequestQueue::unbounded());
        let handler = Arc::new(RequestHandler::new(
            Arc::clone(&pool),
            Arc::clone(&codec),
            Arc::clone(&endpoint),
        ));

        let dispatcher = Dispatcher::start(endpoint, queue, codec, handler, 4);
        let stop = dispatcher.stop_flag();
        let thread = std::thread::spawn(move || {
            dispatcher.run();
            dispatcher.shutdown();
        });

        Self {
            addr,
            stop,
            pool,
            thread: Some(thread),
        }
    }

    fn client(&self, identity: &[u8]) -> ClientConn {
        let mut client = ClientConn::connect(&self.addr, identity).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        client
    }

    /// Client whose reads give up quickly, for asserting "no reply".
    fn impatient_client(&self, identity: &[u8]) -> ClientConn {
        let mut client = ClientConn::connect(&self.addr, identity).unwrap();
        client
            .set_read_timeout(Some(Duration::from_millis(400)))
            .unwrap();
        client
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.pool.shutdown();
    }
}

fn json_request(id: &str, query: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({ "id": id, "query": query })).unwrap()
}

fn msgpack_request(id: &str, query: &str) -> Vec<u8> {
    #[derive(serde::Serialize)]
    struct Req<'a> {
        id: &'a str,
        query: &'a str,
    }
    rmp_serde::to_vec_named(&Req { id, query }).unwrap()
}

// ---------------------------------------------------------------------------
// Happy path
// ---------------------------------------------------------------------------

#[test]
fn happy_path_json() {
    let server = TestServer::start(
        "json",
        ScriptedConnector::new().rows("SELECT 1", vec![Row::from_pairs([("1", "1")])]),
    );
    let mut client = server.client(b"C1");

    client.send(&json_request("q1", "SELECT 1")).unwrap();

    let (identity, payload) = client.recv().unwrap().unwrap();
    assert_eq!(identity, b"C1");
    assert_eq!(
        std::str::from_utf8(&payload).unwrap(),
        r#"{"id":"q1","data":[{"1":"1"}]}"#
    );
}

#[test]
fn happy_path_msgpack() {
    #[derive(serde::Deserialize)]
    struct Reply {
        id: String,
        data: Vec<Row>,
    }

    let server = TestServer::start(
        "msgpack",
        ScriptedConnector::new().rows(
            "SELECT a, b FROM t",
            vec![
                Row::from_pairs([("a", "1"), ("b", "x")]),
                Row::from_pairs([("a", "2"), ("b", "y")]),
            ],
        ),
    );
    let mut client = server.client(b"C1");

    client
        .send(&msgpack_request("q5", "SELECT a, b FROM t"))
        .unwrap();

    let (_, payload) = client.recv().unwrap().unwrap();
    let reply: Reply = rmp_serde::from_slice(&payload).unwrap();
    assert_eq!(reply.id, "q5");
    assert_eq!(reply.data.len(), 2);
    let columns: Vec<&str> = reply.data[0].columns().collect();
    assert_eq!(columns, vec!["a", "b"]);
}

// ---------------------------------------------------------------------------
// Codec error-surfacing divergence
// ---------------------------------------------------------------------------

#[test]
fn bad_sql_msgpack_gets_error_reply() {
    let server = TestServer::start(
        "msgpack",
        ScriptedConnector::new().failure("SELEC 1", "syntax error at or near \"SELEC\""),
    );
    let mut client = server.client(b"C2");

    client.send(&msgpack_request("q2", "SELEC 1")).unwrap();

    let (_, payload) = client.recv().unwrap().unwrap();
    let decoded: std::collections::BTreeMap<String, String> =
        rmp_serde::from_slice(&payload).unwrap();
    assert_eq!(decoded["id"], "q2");
    assert!(decoded["ERROR:SQLException"].contains("syntax error"));
}

#[test]
fn bad_sql_json_gets_no_reply() {
    let server = TestServer::start(
        "json",
        ScriptedConnector::new()
            .failure("SELEC 1", "syntax error at or near \"SELEC\"")
            .rows("SELECT 1", vec![Row::from_pairs([("1", "1")])]),
    );
    let mut client = server.impatient_client(b"C2");

    client.send(&json_request("q2", "SELEC 1")).unwrap();

    // The divergence: same bad query, no reply under the text codec.
    assert!(client.recv().is_err(), "json codec must drop error replies");

    // The connection and loop are still healthy afterwards.
    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    client.send(&json_request("q3", "SELECT 1")).unwrap();
    let (_, payload) = client.recv().unwrap().unwrap();
    assert!(std::str::from_utf8(&payload).unwrap().contains("\"q3\""));
}

// ---------------------------------------------------------------------------
// Malformed traffic
// ---------------------------------------------------------------------------

#[test]
fn short_unit_is_discarded_and_loop_survives() {
    let server = TestServer::start(
        "json",
        ScriptedConnector::new().rows("SELECT 1", vec![Row::from_pairs([("1", "1")])]),
    );
    let mut client = server.client(b"C3");

    // Two-part unit: no payload frame.
    client.send_parts(&[b"C3", b"{\"id\":\"q\"}"]).unwrap();
    // Empty payload.
    client.send_parts(&[b"C3", b"", b""]).unwrap();
    // Non-empty delimiter.
    client
        .send_parts(&[b"C3", b"junk", b"{\"id\":\"q\",\"query\":\"SELECT 1\"}"])
        .unwrap();

    // A well-formed request still gets served.
    client.send(&json_request("q1", "SELECT 1")).unwrap();
    let (_, payload) = client.recv().unwrap().unwrap();
    assert!(std::str::from_utf8(&payload).unwrap().contains("\"q1\""));
}

#[test]
fn missing_fields_are_rejected_without_reply() {
    let server = TestServer::start(
        "json",
        ScriptedConnector::new().rows("SELECT 1", vec![Row::from_pairs([("1", "1")])]),
    );
    let mut client = server.impatient_client(b"C4");

    client.send(br#"{"query":"SELECT 1"}"#).unwrap();
    client.send(br#"{"id":"q1"}"#).unwrap();
    client.send(b"not json").unwrap();

    assert!(client.recv().is_err(), "rejected payloads produce no reply");

    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    client.send(&json_request("q1", "SELECT 1")).unwrap();
    let (_, payload) = client.recv().unwrap().unwrap();
    assert!(std::str::from_utf8(&payload).unwrap().contains("\"q1\""));
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

#[test]
fn replies_route_to_the_originating_peer() {
    let server = TestServer::start(
        "json",
        ScriptedConnector::new()
            .rows("SELECT 'a'", vec![Row::from_pairs([("v", "a")])])
            .rows("SELECT 'b'", vec![Row::from_pairs([("v", "b")])]),
    );
    let mut alpha = server.client(b"alpha");
    let mut beta = server.client(b"beta");

    alpha.send(&json_request("qa", "SELECT 'a'")).unwrap();
    beta.send(&json_request("qb", "SELECT 'b'")).unwrap();

    let (identity, payload) = alpha.recv().unwrap().unwrap();
    assert_eq!(identity, b"alpha");
    assert!(std::str::from_utf8(&payload).unwrap().contains("\"qa\""));

    let (identity, payload) = beta.recv().unwrap().unwrap();
    assert_eq!(identity, b"beta");
    assert!(std::str::from_utf8(&payload).unwrap().contains("\"qb\""));
}

#[test]
fn many_requests_all_answered_order_free() {
    const REQUESTS: usize = 40;

    let server = TestServer::start(
        "json",
        ScriptedConnector::new().rows("SELECT 1", vec![Row::from_pairs([("1", "1")])]),
    );
    let mut client = server.client(b"C5");

    for i in 0..REQUESTS {
        client
            .send(&json_request(&format!("q{}", i), "SELECT 1"))
            .unwrap();
    }

    // With 4 workers replies may arrive out of order; every id must
    // show up exactly once.
    let mut seen = std::collections::HashSet::new();
    for _ in 0..REQUESTS {
        let (_, payload) = client.recv().unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        let id = value["id"].as_str().unwrap().to_string();
        assert!(seen.insert(id), "duplicate reply");
    }
    assert_eq!(seen.len(), REQUESTS);
}
