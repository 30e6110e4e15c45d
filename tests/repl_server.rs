//! End-to-end tests over loopback TCP.

#![allow(clippy::panic, clippy::unwrap_used, clippy::expect_used, missing_docs)]

use std::net::SocketAddr;
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use replwire::config::ReplConfig;
use replwire::dispatch::StructuredMessage;
use replwire::server::ReplServer;
use replwire::session::protocol::{self, MessageResponse, ResponseStatus};

const BANNER: &str = "hello from replwire";
const READ_TIMEOUT: Duration = Duration::from_secs(5);
const SLOW_EVAL: &str = "for (var i = 0; i < 20000; i++) {} i";

struct Client {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    local_addr: SocketAddr,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let local_addr = stream.local_addr().expect("local addr");
        let (read, writer) = stream.into_split();
        let mut client = Self {
            lines: BufReader::new(read).lines(),
            writer,
            local_addr,
        };
        assert_eq!(client.recv().await.as_deref(), Some(BANNER));
        client
    }

    async fn send(&mut self, line: &str) {
        self.send_bytes(format!("{line}\n").as_bytes()).await;
    }

    async fn send_bytes(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.expect("write");
    }

    async fn recv(&mut self) -> Option<String> {
        tokio::time::timeout(READ_TIMEOUT, self.lines.next_line())
            .await
            .expect("read timed out")
            .unwrap_or(None)
    }

    async fn ask(&mut self, line: &str) -> String {
        self.send(line).await;
        self.recv().await.expect("connection closed")
    }
}

async fn started() -> (ReplServer, SocketAddr) {
    started_with(ReplConfig::default()).await
}

async fn started_with(config: ReplConfig) -> (ReplServer, SocketAddr) {
    let server = ReplServer::new(config.with_banner(BANNER)).expect("server");
    let addr = server.start(0).await.expect("start");
    (server, addr)
}

async fn wait_for_sessions(server: &ReplServer, expected: usize) {
    for _ in 0..400 {
        if server.status().await.session_count == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("session count never reached {expected}");
}

#[tokio::test]
async fn evaluates_raw_code() {
    let (server, addr) = started().await;
    let mut client = Client::connect(addr).await;

    assert_eq!(client.ask("1+1").await, "2");
    assert_eq!(client.ask("'a' + 'b'").await, "\"ab\"");

    server.stop().await;
}

#[tokio::test]
async fn empty_lines_are_ignored() {
    let (server, addr) = started().await;
    let mut client = Client::connect(addr).await;

    client.send("").await;
    client.send("   ").await;
    assert_eq!(client.ask("40 + 2").await, "42");

    server.stop().await;
}

#[tokio::test]
async fn errors_keep_the_session_usable() {
    let (server, addr) = started().await;
    let mut client = Client::connect(addr).await;

    let reply = client.ask("undefinedVar.foo").await;
    assert!(reply.starts_with("Error: ReferenceError"), "got {reply}");

    let reply = client.ask("function (").await;
    assert!(reply.starts_with("Error: SyntaxError"), "got {reply}");

    assert_eq!(client.ask("3 * 3").await, "9");
    server.stop().await;
}

#[tokio::test]
async fn sessions_share_engine_state() {
    let (server, addr) = started().await;
    let mut first = Client::connect(addr).await;
    let mut second = Client::connect(addr).await;

    assert_eq!(first.ask("var counter = 41").await, "undefined");
    assert_eq!(second.ask("++counter").await, "42");

    server.stop().await;
}

#[tokio::test]
async fn replies_are_not_cross_delivered() {
    let (server, addr) = started().await;
    let mut first = Client::connect(addr).await;
    let mut second = Client::connect(addr).await;

    for i in 0..20 {
        first.send(&format!("'first-{i}'")).await;
        second.send(&format!("'second-{i}'")).await;
    }
    for i in 0..20 {
        assert_eq!(first.recv().await, Some(format!("\"first-{i}\"")));
        assert_eq!(second.recv().await, Some(format!("\"second-{i}\"")));
    }

    server.stop().await;
}

#[tokio::test]
async fn session_id_command_matches_registry() {
    let (server, addr) = started().await;
    let mut client = Client::connect(addr).await;

    let reply = client.ask("/session_id").await;
    let Some(id) = reply.strip_prefix("/session_id ") else {
        panic!("unexpected reply {reply}");
    };

    let info = server
        .find_session_for_peer(client.local_addr)
        .await
        .expect("session registered");
    assert_eq!(info.id.to_string(), id);

    server.stop().await;
}

#[tokio::test]
async fn structured_message_round_trip() {
    let (server, addr) = started().await;
    let mut client = Client::connect(addr).await;

    let message = StructuredMessage::eval(json!(7), "[1, 2, 3].map(x => x * 2)");
    let line = protocol::encode_message(&message).expect("encode");
    let response = MessageResponse::from_line(&client.ask(&line).await).expect("decode");

    assert_eq!(response.id, json!(7));
    assert_eq!(response.status, ResponseStatus::Ok);
    assert_eq!(response.result, json!([2, 4, 6]));
    assert_eq!(response.msg_type, "eval_response");

    let info = server
        .find_session_for_peer(client.local_addr)
        .await
        .expect("session registered");
    assert_eq!(response.session_id, info.id);

    server.stop().await;
}

#[tokio::test]
async fn structured_call_and_error() {
    let (server, addr) = started().await;
    let mut client = Client::connect(addr).await;

    let args = vec![json!(3), json!(9), json!(4)];
    let call = StructuredMessage::call(json!("max"), "Math.max", args);
    let line = protocol::encode_message(&call).expect("encode");
    let response = MessageResponse::from_line(&client.ask(&line).await).expect("decode");
    assert_eq!(response.status, ResponseStatus::Ok);
    assert_eq!(response.result, json!(9));

    let missing = StructuredMessage::call(json!("bad"), "nothing.here", Vec::new());
    let line = protocol::encode_message(&missing).expect("encode");
    let response = MessageResponse::from_line(&client.ask(&line).await).expect("decode");
    assert_eq!(response.id, json!("bad"));
    assert_eq!(response.status, ResponseStatus::Error);

    let reply = client.ask("/message not-base64!!").await;
    let response = MessageResponse::from_line(&reply).expect("decode");
    assert_eq!(response.status, ResponseStatus::Error);

    assert_eq!(client.ask("1").await, "1");
    server.stop().await;
}

#[tokio::test]
async fn quit_says_goodbye_and_deregisters() {
    let (server, addr) = started().await;
    let mut client = Client::connect(addr).await;
    wait_for_sessions(&server, 1).await;

    assert_eq!(client.ask("/quit").await, "Bye!");
    assert_eq!(client.recv().await, None);
    wait_for_sessions(&server, 0).await;

    let mut short = Client::connect(addr).await;
    assert_eq!(short.ask("/q").await, "Bye!");
    assert_eq!(short.recv().await, None);

    server.stop().await;
}

#[tokio::test]
async fn registry_follows_connections() {
    let (server, addr) = started().await;
    assert_eq!(server.status().await.session_count, 0);

    let first = Client::connect(addr).await;
    wait_for_sessions(&server, 1).await;
    let second = Client::connect(addr).await;
    wait_for_sessions(&server, 2).await;

    drop(first);
    wait_for_sessions(&server, 1).await;
    drop(second);
    wait_for_sessions(&server, 0).await;

    server.stop().await;
}

#[tokio::test]
async fn disconnect_with_queued_work_is_harmless() {
    let (server, addr) = started().await;
    let mut leaver = Client::connect(addr).await;
    for _ in 0..10 {
        leaver.send(SLOW_EVAL).await;
    }
    drop(leaver);
    wait_for_sessions(&server, 0).await;

    let mut stayer = Client::connect(addr).await;
    assert_eq!(stayer.ask("'still here'").await, "\"still here\"");
    server.stop().await;
}

#[tokio::test]
async fn double_start_is_rejected() {
    let (server, addr) = started().await;
    let err = server.start(0).await.expect_err("second start");
    assert_eq!(err.kind(), "AlreadyRunningError");

    let mut client = Client::connect(addr).await;
    assert_eq!(client.ask("2 + 2").await, "4");
    server.stop().await;
}

#[tokio::test]
async fn stop_closes_everything() {
    let (server, addr) = started().await;
    let mut client = Client::connect(addr).await;
    wait_for_sessions(&server, 1).await;

    server.stop().await;
    let status = server.status().await;
    assert!(!status.running);
    assert_eq!(status.session_count, 0);
    assert!(status.to_string().starts_with("STOPPED"));

    assert_eq!(client.recv().await, None);
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn quit_waits_for_queued_results() {
    let (server, addr) = started().await;
    let mut client = Client::connect(addr).await;

    client.send_bytes(format!("{SLOW_EVAL}\n/quit\n").as_bytes()).await;
    assert_eq!(client.recv().await.as_deref(), Some("20000"));
    assert_eq!(client.recv().await.as_deref(), Some("Bye!"));
    assert_eq!(client.recv().await, None);

    server.stop().await;
}

#[tokio::test]
async fn local_replies_keep_request_order() {
    let (server, addr) = started().await;
    let mut client = Client::connect(addr).await;

    let batch = format!("{SLOW_EVAL}\n/session_id\n/message %%%\n{SLOW_EVAL}\n");
    client.send_bytes(batch.as_bytes()).await;
    assert_eq!(client.recv().await.as_deref(), Some("20000"));
    let reply = client.recv().await.expect("session id reply");
    assert!(reply.starts_with("/session_id "), "got {reply}");
    let reply = client.recv().await.expect("parse error reply");
    let response = MessageResponse::from_line(&reply).expect("decode");
    assert_eq!(response.status, ResponseStatus::Error);
    assert_eq!(client.recv().await.as_deref(), Some("20000"));

    server.stop().await;
}

#[tokio::test]
async fn oversized_line_is_rejected_and_session_survives() {
    let config = ReplConfig {
        max_line_bytes: 64,
        ..ReplConfig::default()
    };
    let (server, addr) = started_with(config).await;
    let mut client = Client::connect(addr).await;

    let long = format!("'{}'", "x".repeat(200));
    let reply = client.ask(&long).await;
    assert!(reply.starts_with("Error: ParseError"), "got {reply}");
    assert_eq!(client.ask("1+1").await, "2");

    server.stop().await;
}

#[tokio::test]
async fn invalid_utf8_is_rejected_and_session_survives() {
    let (server, addr) = started().await;
    let mut client = Client::connect(addr).await;

    client.send_bytes(&[0xff, 0xfe, 0x41, b'\n']).await;
    let reply = client.recv().await.expect("parse error reply");
    assert!(reply.starts_with("Error: ParseError"), "got {reply}");
    assert_eq!(client.ask("5 * 5").await, "25");

    server.stop().await;
}

#[tokio::test]
async fn abandoned_connection_is_deregistered() {
    let (server, addr) = started().await;
    let mut client = Client::connect(addr).await;
    wait_for_sessions(&server, 1).await;

    // Results keep arriving for a peer that has stopped reading and left.
    for _ in 0..5 {
        client.send(SLOW_EVAL).await;
    }
    let Client { lines, writer, .. } = client;
    drop(lines);
    drop(writer);
    wait_for_sessions(&server, 0).await;

    let mut next = Client::connect(addr).await;
    assert_eq!(next.ask("'ok'").await, "\"ok\"");
    server.stop().await;
}
