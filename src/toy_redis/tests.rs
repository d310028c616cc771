use std::{collections::HashSet, net::SocketAddr, sync::Arc, time::Duration};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

use crate::config::Config;
use crate::toy_redis::commands::{process_line, process_request, run_session};
use crate::toy_redis::error::{ProtocolError, SessionError};
use crate::toy_redis::request::{parse_request, Command};
use crate::toy_redis::server::SessionStats;
use crate::toy_redis::{KeyValueStore, Server};

const READ_TIMEOUT: Duration = Duration::from_secs(5);

#[test]
fn test_parse_get_request() {
    let command = parse_request("GET mykey\n").unwrap();
    assert_eq!(
        command,
        Command::Get {
            key: "mykey".into()
        }
    );
}

#[test]
fn test_parse_set_request() {
    let command = parse_request("SET mykey myvalue\r\n").unwrap();
    assert_eq!(
        command,
        Command::Set {
            key: "mykey".into(),
            value: "myvalue".into()
        }
    );
}

#[test]
fn test_parse_without_terminator() {
    assert_eq!(
        parse_request("GET mykey"),
        Ok(Command::Get {
            key: "mykey".into()
        })
    );
}

#[test]
fn test_parse_wrong_arity() {
    assert_eq!(
        parse_request("SET onlykey\n"),
        Err(ProtocolError::WrongArity {
            verb: "SET",
            expected: 2,
            got: 1
        })
    );
    assert_eq!(
        parse_request("SET k v extra\n"),
        Err(ProtocolError::WrongArity {
            verb: "SET",
            expected: 2,
            got: 3
        })
    );
    assert_eq!(
        parse_request("GET\n"),
        Err(ProtocolError::WrongArity {
            verb: "GET",
            expected: 1,
            got: 0
        })
    );
    // A doubled space yields an empty token, which still counts.
    assert!(matches!(
        parse_request("GET  key\n"),
        Err(ProtocolError::WrongArity { got: 2, .. })
    ));
}

#[test]
fn test_parse_empty_key() {
    assert_eq!(
        parse_request("GET \n"),
        Err(ProtocolError::MissingKey { verb: "GET" })
    );
    assert_eq!(
        parse_request("SET  value\n"),
        Err(ProtocolError::MissingKey { verb: "SET" })
    );
}

#[test]
fn test_parse_unknown_verb() {
    assert_eq!(
        parse_request("get mykey\n"),
        Err(ProtocolError::UnknownVerb("get".into()))
    );
    assert_eq!(
        parse_request("\n"),
        Err(ProtocolError::UnknownVerb(String::new()))
    );
}

#[tokio::test]
async fn test_process_set_echoes_and_get_reads_back() {
    let store = KeyValueStore::new();
    assert_eq!(process_line(&store, "SET a 1\n").await, "1");
    assert_eq!(process_line(&store, "GET a\n").await, "1");
    assert_eq!(process_line(&store, "GET b\n").await, "");
}

#[tokio::test]
async fn test_process_errors_are_empty_and_leave_store_alone() {
    let store = KeyValueStore::new();
    assert_eq!(process_line(&store, "SET onlykey\n").await, "");
    assert_eq!(process_line(&store, "DEL onlykey\n").await, "");
    assert_eq!(process_line(&store, "GET \n").await, "");
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn test_process_set_empty_value() {
    let store = KeyValueStore::new();
    assert_eq!(process_line(&store, "SET k \n").await, "");
    assert_eq!(store.get("k").await.as_deref(), Some(""));
    assert_eq!(process_line(&store, "GET k\n").await, "");
}

#[tokio::test]
async fn test_process_rejects_invalid_utf8() {
    let store = KeyValueStore::new();
    assert_eq!(process_request(&store, b"SET k \xff\n").await, "");
    assert!(store.is_empty().await);
    assert_eq!(process_request(&store, b"SET k v\n").await, "v");
}

#[tokio::test]
async fn test_session_survives_invalid_utf8() {
    let store = KeyValueStore::new();
    let (mut client, server) = tokio::io::duplex(1024);

    client
        .write_all(b"SET k \xff\xfe\nGET nosuch\nSET a b\n")
        .await
        .unwrap();
    client.shutdown().await.unwrap();

    run_session(server, &store, READ_TIMEOUT).await.unwrap();

    let mut output = String::new();
    client.read_to_string(&mut output).await.unwrap();
    assert_eq!(output, "\n\nb\n");
    assert_eq!(store.get("a").await.as_deref(), Some("b"));
    assert_eq!(store.get("k").await, None);
}

#[tokio::test]
async fn test_session_answers_in_order_and_drops_partial_line() {
    let store = KeyValueStore::new();
    let (mut client, server) = tokio::io::duplex(1024);

    client
        .write_all(b"SET a b\nGET a\nBOGUS\nSET c d")
        .await
        .unwrap();
    client.shutdown().await.unwrap();

    run_session(server, &store, READ_TIMEOUT).await.unwrap();

    let mut output = String::new();
    client.read_to_string(&mut output).await.unwrap();
    assert_eq!(output, "b\nb\n\n");
    assert_eq!(store.get("c").await, None);
}

#[tokio::test]
async fn test_session_idle_timeout() {
    let store = KeyValueStore::new();
    let (_client, server) = tokio::io::duplex(64);

    let result = run_session(server, &store, Duration::from_millis(100)).await;
    assert!(matches!(result, Err(SessionError::Idle(_))));
}

struct TestClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    async fn send(&mut self, command: &str) -> String {
        self.writer
            .write_all(format!("{command}\n").as_bytes())
            .await
            .unwrap();

        let mut response = String::new();
        let read = tokio::time::timeout(READ_TIMEOUT, self.reader.read_line(&mut response))
            .await
            .expect("response timed out")
            .unwrap();
        assert!(read > 0, "server closed the connection");
        response.trim_end_matches('\n').to_string()
    }

    /// Waits for the server to close the connection.
    async fn closed_within(&mut self, limit: Duration) -> bool {
        let mut buf = String::new();
        match tokio::time::timeout(limit, self.reader.read_line(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) => true,
            Ok(Ok(_)) | Err(_) => false,
        }
    }
}

async fn start_server(idle_timeout_secs: u64) -> (SocketAddr, Arc<SessionStats>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = Config {
        idle_timeout_secs,
        stats_interval_secs: 0,
        ..Config::default()
    };
    let server = Server::new(listener, &config);
    let addr = server.local_addr().unwrap();
    let stats = server.stats();
    tokio::spawn(server.run());
    (addr, stats)
}

#[tokio::test]
async fn test_round_trip_across_connections() {
    let (addr, _) = start_server(5).await;

    let mut writer = TestClient::connect(addr).await;
    assert_eq!(writer.send("SET mykey myvalue").await, "myvalue");
    assert_eq!(writer.send("GET mykey").await, "myvalue");

    let mut reader = TestClient::connect(addr).await;
    assert_eq!(reader.send("GET mykey").await, "myvalue");
}

#[tokio::test]
async fn test_overwrite_and_absent_key() {
    let (addr, _) = start_server(5).await;
    let mut client = TestClient::connect(addr).await;

    assert_eq!(client.send("GET nosuchkey").await, "");
    assert_eq!(client.send("SET k v1").await, "v1");
    assert_eq!(client.send("SET k v2").await, "v2");
    assert_eq!(client.send("GET k").await, "v2");
}

#[tokio::test]
async fn test_malformed_input_keeps_connection_usable() {
    let (addr, _) = start_server(5).await;
    let mut client = TestClient::connect(addr).await;

    assert_eq!(client.send("SET onlykey").await, "");
    assert_eq!(client.send("SET k v extra").await, "");
    assert_eq!(client.send("PING").await, "");
    assert_eq!(client.send("").await, "");
    assert_eq!(client.send("SET onlykey value\r").await, "value");
    assert_eq!(client.send("GET onlykey").await, "value");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sessions_are_isolated() {
    let (addr, _) = start_server(5).await;

    let mut handles = Vec::new();
    for id in 0..10 {
        handles.push(tokio::spawn(async move {
            let mut client = TestClient::connect(addr).await;
            for op in 0..20 {
                let key = format!("client{id}_key");
                let value = format!("client{id}_value{op}");
                assert_eq!(client.send(&format!("SET {key} {value}")).await, value);
                assert_eq!(client.send(&format!("GET {key}")).await, value);
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_same_key_writes_stay_whole() {
    let (addr, _) = start_server(5).await;
    let written: HashSet<String> = (0..8).map(|i| format!("writer{i}_{}", "v".repeat(i))).collect();

    let mut handles = Vec::new();
    for value in written.iter().cloned() {
        handles.push(tokio::spawn(async move {
            let mut client = TestClient::connect(addr).await;
            for _ in 0..25 {
                assert_eq!(client.send(&format!("SET shared {value}")).await, value);
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let mut client = TestClient::connect(addr).await;
    let last = client.send("GET shared").await;
    assert!(written.contains(&last), "unexpected value {last:?}");
}

#[tokio::test]
async fn test_idle_session_is_closed_without_affecting_others() {
    let (addr, _) = start_server(1).await;

    let mut idle = TestClient::connect(addr).await;
    assert_eq!(idle.send("SET idle yes").await, "yes");

    let mut busy = TestClient::connect(addr).await;
    for i in 0..8 {
        assert_eq!(busy.send(&format!("SET busy {i}")).await, i.to_string());
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    assert!(idle.closed_within(Duration::from_secs(3)).await);
    assert_eq!(busy.send("GET idle").await, "yes");
}

#[tokio::test]
async fn test_active_sessions_drop_to_zero_after_disconnect() {
    let (addr, stats) = start_server(5).await;

    let mut clients = Vec::new();
    for i in 0..3 {
        let mut client = TestClient::connect(addr).await;
        assert_eq!(client.send(&format!("SET k{i} v")).await, "v");
        clients.push(client);
    }
    assert_eq!(stats.active(), 3);
    drop(clients);

    let drained = async {
        while stats.active() != 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    tokio::time::timeout(READ_TIMEOUT, drained)
        .await
        .expect("sessions did not finish");
    assert_eq!(stats.total(), 3);
}
