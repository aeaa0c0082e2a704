//! End-to-end scenarios: real Unix socket clients on one side, a real HTTP
//! executor on the other, one relay in between.

#![cfg(unix)]

use std::path::PathBuf;
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use command_relay::{
    client::{send_command, SendOptions},
    events::EventEmitter,
    http_api::relay_api_router_with_auth,
    protocol::{Command, RequestId, TIMEOUT_ERROR},
    relay::{Relay, RelayOptions},
    service::{relay_channel, run_relay},
    socket::{bind_socket, serve_socket},
};

const READ_LIMIT: Duration = Duration::from_secs(5);

struct Harness {
    _dir: TempDir,
    socket_path: PathBuf,
    base_url: String,
    http: reqwest::Client,
    shutdown: watch::Sender<bool>,
    relay_task: JoinHandle<Relay>,
}

impl Harness {
    async fn start(timeout: Duration) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let socket_path = dir.path().join("relay.sock");
        let socket_listener = bind_socket(&socket_path).expect("bind socket");
        let http_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind http");
        let base_url = format!("http://{}", http_listener.local_addr().unwrap());

        let relay = Relay::new(
            RelayOptions {
                timeout,
                ..RelayOptions::default()
            },
            EventEmitter::disabled(),
        );
        let (handle, requests) = relay_channel(64);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let relay_task = tokio::spawn(run_relay(relay, requests, shutdown_rx.clone()));
        tokio::spawn(serve_socket(
            socket_listener,
            handle.clone(),
            shutdown_rx.clone(),
        ));
        let router = relay_api_router_with_auth(handle, None);
        let mut http_shutdown = shutdown_rx;
        tokio::spawn(async move {
            let _ = axum::serve(http_listener, router)
                .with_graceful_shutdown(async move {
                    let _ = http_shutdown.wait_for(|stop| *stop).await;
                })
                .await;
        });

        Self {
            _dir: dir,
            socket_path,
            base_url,
            http: reqwest::Client::new(),
            shutdown,
            relay_task,
        }
    }

    async fn connect(&self) -> TestClient {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .expect("connect to relay socket");
        let (read, writer) = stream.into_split();
        TestClient {
            lines: BufReader::new(read).lines(),
            writer,
        }
    }

    /// `GET /poll`: `None` on 204.
    async fn poll(&self) -> Option<Value> {
        let response = self
            .http
            .get(format!("{}/poll", self.base_url))
            .send()
            .await
            .expect("poll request");
        match response.status().as_u16() {
            204 => None,
            200 => Some(response.json().await.expect("poll body")),
            other => panic!("unexpected poll status {other}"),
        }
    }

    /// Poll until a command shows up; submissions race the socket reader.
    async fn poll_next(&self) -> Value {
        tokio::time::timeout(READ_LIMIT, async {
            loop {
                if let Some(command) = self.poll().await {
                    return command;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("a command should be queued")
    }

    async fn respond(&self, body: Value) -> (u16, Value) {
        let response = self
            .http
            .post(format!("{}/response", self.base_url))
            .json(&body)
            .send()
            .await
            .expect("response request");
        let status = response.status().as_u16();
        (status, response.json().await.expect("response body"))
    }

    async fn status(&self) -> Value {
        self.http
            .get(format!("{}/status", self.base_url))
            .send()
            .await
            .expect("status request")
            .json()
            .await
            .expect("status body")
    }

    async fn wait_for_queue_depth(&self, depth: u64) {
        tokio::time::timeout(READ_LIMIT, async {
            while self.status().await["queueDepth"] != json!(depth) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("queue depth should settle");
    }
}

struct TestClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    async fn send(&mut self, command: Value) {
        let mut line = command.to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await.expect("write command");
    }

    async fn next_result(&mut self) -> Value {
        let line = tokio::time::timeout(READ_LIMIT, self.lines.next_line())
            .await
            .expect("result should arrive")
            .expect("read result")
            .expect("connection should stay open");
        serde_json::from_str(&line).expect("result should be json")
    }

    async fn expect_silence(&mut self, window: Duration) {
        if let Ok(line) = tokio::time::timeout(window, self.lines.next_line()).await {
            panic!("expected no further results, got {line:?}");
        }
    }
}

#[tokio::test]
async fn unanswered_command_times_out() {
    let harness = Harness::start(Duration::from_millis(300)).await;
    let mut client = harness.connect().await;

    client
        .send(json!({"type": "navigate", "data": {"url": "https://example.com"}, "requestId": 1}))
        .await;

    let result = client.next_result().await;
    assert_eq!(
        result,
        json!({"requestId": 1, "success": false, "error": TIMEOUT_ERROR})
    );

    // The command itself stays queued for a late executor.
    let status = harness.status().await;
    assert_eq!(status["pendingCalls"], json!(0));
    assert_eq!(status["stats"]["timedOut"], json!(1));
}

#[tokio::test]
async fn answered_command_is_delivered_once() {
    let harness = Harness::start(Duration::from_millis(400)).await;
    let mut client = harness.connect().await;

    client.send(json!({"type": "get_tabs", "requestId": 2})).await;

    let command = harness.poll_next().await;
    assert_eq!(command["type"], json!("get_tabs"));
    assert_eq!(command["requestId"], json!(2));

    let answer = json!({"requestId": 2, "success": true, "data": {"tabs": [{"id": 7}]}});
    let (status, body) = harness.respond(answer.clone()).await;
    assert_eq!(status, 200);
    assert_eq!(body["delivered"], json!(true));

    assert_eq!(client.next_result().await, answer);
    // Past the original deadline: the cancelled timer must not fire.
    client.expect_silence(Duration::from_millis(700)).await;
}

#[tokio::test]
async fn commands_from_different_clients_are_polled_in_arrival_order() {
    let harness = Harness::start(Duration::from_secs(10)).await;
    let mut first = harness.connect().await;
    let mut second = harness.connect().await;

    first.send(json!({"type": "click", "data": {"sel": "a"}, "requestId": 3})).await;
    harness.wait_for_queue_depth(1).await;
    second.send(json!({"type": "click", "data": {"sel": "b"}, "requestId": 4})).await;
    harness.wait_for_queue_depth(2).await;

    assert_eq!(harness.poll_next().await["requestId"], json!(3));
    assert_eq!(harness.poll_next().await["requestId"], json!(4));
    assert_eq!(harness.poll().await, None);

    // Answer out of order; each result still finds its own caller.
    harness
        .respond(json!({"requestId": 4, "success": true, "data": "b"}))
        .await;
    harness
        .respond(json!({"requestId": 3, "success": true, "data": "a"}))
        .await;
    assert_eq!(second.next_result().await["data"], json!("b"));
    assert_eq!(first.next_result().await["data"], json!("a"));
}

#[tokio::test]
async fn result_for_unknown_id_is_accepted_and_ignored() {
    let harness = Harness::start(Duration::from_secs(10)).await;
    let mut client = harness.connect().await;
    client.send(json!({"type": "screenshot", "requestId": 5})).await;
    harness.wait_for_queue_depth(1).await;

    let (status, body) = harness
        .respond(json!({"requestId": 99, "success": true, "data": null}))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["delivered"], json!(false));

    client.expect_silence(Duration::from_millis(200)).await;
    let status = harness.status().await;
    assert_eq!(status["pendingCalls"], json!(1));
    assert_eq!(status["stats"]["unknownCompletions"], json!(1));
}

#[tokio::test]
async fn executor_failure_is_relayed_verbatim() {
    let harness = Harness::start(Duration::from_secs(10)).await;
    let mut client = harness.connect().await;
    client
        .send(json!({"type": "navigate", "data": {"url": "bad://"}, "requestId": "nav-1"}))
        .await;

    let command = harness.poll_next().await;
    assert_eq!(command["requestId"], json!("nav-1"));

    let failure = json!({"requestId": "nav-1", "success": false, "error": "Invalid URL", "code": 17});
    harness.respond(failure.clone()).await;
    assert_eq!(client.next_result().await, failure);
}

#[tokio::test]
async fn duplicate_outstanding_id_is_rejected() {
    let harness = Harness::start(Duration::from_secs(10)).await;
    let mut first = harness.connect().await;
    let mut second = harness.connect().await;

    first.send(json!({"type": "click", "requestId": 8})).await;
    harness.wait_for_queue_depth(1).await;
    second.send(json!({"type": "click", "requestId": 8})).await;

    let rejection = second.next_result().await;
    assert_eq!(rejection["requestId"], json!(8));
    assert_eq!(rejection["success"], json!(false));
    assert!(rejection["error"]
        .as_str()
        .unwrap()
        .starts_with("Duplicate requestId 8"));

    harness
        .respond(json!({"requestId": 8, "success": true, "data": 1}))
        .await;
    assert_eq!(first.next_result().await["data"], json!(1));
}

#[tokio::test]
async fn send_command_round_trips_through_the_executor() {
    let harness = Harness::start(Duration::from_secs(10)).await;

    let executor = async {
        let command = harness.poll_next().await;
        assert_eq!(command["type"], json!("get_url"));
        harness
            .respond(json!({
                "requestId": command["requestId"],
                "success": true,
                "data": {"url": "https://example.com"},
            }))
            .await;
    };
    let caller = async {
        let opts = SendOptions {
            timeout: READ_LIMIT,
            connect_attempts: 1,
            retry_delay: Duration::from_millis(10),
        };
        send_command(
            &harness.socket_path,
            &Command::new("get_url", Value::Null).with_request_id(RequestId::Text("u-1".into())),
            &opts,
        )
        .await
        .expect("relay should answer")
    };

    let ((), result) = tokio::join!(executor, caller);
    assert!(result.success);
    assert_eq!(result.request_id, Some(RequestId::Text("u-1".into())));
    assert_eq!(result.data, Some(json!({"url": "https://example.com"})));
}

#[tokio::test]
async fn shutdown_answers_every_waiting_client() {
    let harness = Harness::start(Duration::from_secs(30)).await;
    let mut client = harness.connect().await;
    client.send(json!({"type": "navigate", "requestId": 11})).await;
    harness.wait_for_queue_depth(1).await;

    harness.shutdown.send(true).expect("relay running");
    let relay = harness.relay_task.await.expect("relay loop exits cleanly");
    assert_eq!(relay.pending_calls(), 0);

    let result = client.next_result().await;
    assert_eq!(result["requestId"], json!(11));
    assert_eq!(result["success"], json!(false));
    assert_eq!(result["error"], json!("Relay is shutting down"));
}
