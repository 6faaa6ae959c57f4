//! Integration tests: boot an in-process WebSocket server that simulates
//! the hub side of the protocol, connect a real [`HubConnection`] over a
//! real tokio-tungstenite transport, and drive the full lifecycle.
//!
//! Covered end to end:
//! - negotiation (scripted HTTP), transport URL building, handshake
//! - invoke → completion, both value and hub-error outcomes
//! - server-to-client invocations reaching registered handlers
//! - handshake rejection
//! - frames split arbitrarily across websocket messages
//! - server-timeout watchdog
//! - automatic reconnection after the server drops the socket
//! - legacy-server detection with reconnect enabled
//! - concurrent stop calls joining one outcome

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;

use hubwire_client::http::{HttpClient, HttpClientFactory, HttpRequest, HttpResponse};
use hubwire_client::{ConnectionState, Error, HubConnectionBuilder};

const RS: char = '\u{1e}';

// ── Mini hub: in-process WS server ──────────────────────────────────────

/// One accepted client connection, exposed to the test as channels.
struct HubSession {
    /// The request path the client connected with (`/hub?id=...`).
    path: String,
    /// Push raw websocket messages to the client. Dropping this closes
    /// the connection.
    to_client: mpsc::Sender<Message>,
    /// Text frames received from the client.
    from_client: mpsc::Receiver<String>,
}

impl HubSession {
    /// Answer the client's handshake frame with `response`.
    async fn answer_handshake(&mut self, response: &str) {
        let first = self.recv().await;
        assert!(
            first.contains("\"protocol\":\"json\""),
            "expected a handshake frame, got: {first}"
        );
        assert!(first.contains("\"version\":1"));
        self.send_text(response).await;
    }

    async fn accept_handshake(&mut self) {
        self.answer_handshake(&format!("{{}}{RS}")).await;
    }

    async fn send_text(&mut self, text: &str) {
        self.to_client
            .send(Message::Text(text.to_owned()))
            .await
            .expect("client connection is gone");
    }

    async fn recv(&mut self) -> String {
        tokio::time::timeout(Duration::from_secs(5), self.from_client.recv())
            .await
            .expect("timeout waiting for a client frame")
            .expect("client connection closed")
    }

    /// Receive frames until one that is not a ping, decoded as JSON.
    async fn recv_non_ping(&mut self) -> Value {
        loop {
            let raw = self.recv().await;
            let frame: Value =
                serde_json::from_str(raw.trim_end_matches(RS)).expect("client sent malformed JSON");
            if frame["type"] != json!(6) {
                return frame;
            }
        }
    }
}

/// Boot a tiny WS server on an ephemeral port; each accepted connection is
/// delivered to the test as a [`HubSession`].
async fn start_mini_hub() -> (SocketAddr, mpsc::Receiver<HubSession>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (session_tx, session_rx) = mpsc::channel(8);

    tokio::spawn(async move {
        while let Ok((stream, _peer)) = listener.accept().await {
            let session_tx = session_tx.clone();
            tokio::spawn(async move {
                let mut path = String::new();
                let ws = tokio_tungstenite::accept_hdr_async(
                    stream,
                    |request: &Request, response: Response| {
                        path = request.uri().to_string();
                        Ok(response)
                    },
                )
                .await
                .expect("websocket accept failed");

                let (mut sink, mut stream) = ws.split();

                let (to_client_tx, mut to_client_rx) = mpsc::channel::<Message>(16);
                let (from_client_tx, from_client_rx) = mpsc::channel::<String>(64);

                let _ = session_tx
                    .send(HubSession {
                        path,
                        to_client: to_client_tx,
                        from_client: from_client_rx,
                    })
                    .await;

                let writer = tokio::spawn(async move {
                    while let Some(message) = to_client_rx.recv().await {
                        if sink.send(message).await.is_err() {
                            return;
                        }
                    }
                    // The test dropped its sender: close the socket.
                    let _ = sink.close().await;
                });

                let reader = tokio::spawn(async move {
                    while let Some(Ok(message)) = stream.next().await {
                        if let Message::Text(text) = message {
                            if from_client_tx.send(text).await.is_err() {
                                return;
                            }
                        }
                    }
                });

                let _ = tokio::join!(writer, reader);
            });
        }
    });

    (addr, session_rx)
}

// ── Scripted negotiate endpoint ─────────────────────────────────────────

struct ScriptedNegotiate {
    body: String,
}

#[async_trait]
impl HttpClient for ScriptedNegotiate {
    async fn post(&self, url: &str, _request: HttpRequest) -> Result<HttpResponse, Error> {
        assert!(
            url.contains("/negotiate?negotiateVersion=1"),
            "unexpected negotiate url: {url}"
        );
        Ok(HttpResponse {
            status: 200,
            body: self.body.clone(),
        })
    }
}

fn negotiate_factory(body: &str) -> HttpClientFactory {
    let body = body.to_owned();
    Arc::new(move |_config| {
        Arc::new(ScriptedNegotiate { body: body.clone() }) as Arc<dyn HttpClient>
    })
}

async fn wait_for_state(
    hub: &hubwire_client::HubConnection,
    state: ConnectionState,
) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while hub.state() != state {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for state {state:?}, currently {:?}",
            hub.state()
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ── Tests ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn negotiate_handshake_and_invoke_round_trip() {
    let (addr, mut sessions) = start_mini_hub().await;

    let hub = Arc::new(
        HubConnectionBuilder::new()
            .with_url(format!("http://{addr}/hub"))
            .with_http_client_factory(negotiate_factory(
                r#"{"connectionId":"c1","connectionToken":"tok-1","negotiateVersion":1,
                    "availableTransports":[{"transport":"WebSockets","transferFormats":["Text","Binary"]}]}"#,
            ))
            .build()
            .unwrap(),
    );

    let starting = {
        let hub = hub.clone();
        tokio::spawn(async move { hub.start().await })
    };

    let mut session = sessions.recv().await.expect("no client connection");
    assert!(
        session.path.contains("/hub") && session.path.contains("id=tok-1"),
        "transport url missing the connection token: {}",
        session.path
    );
    session.accept_handshake().await;

    starting.await.unwrap().unwrap();
    assert_eq!(hub.state(), ConnectionState::Connected);
    assert_eq!(hub.connection_id().as_deref(), Some("c1"));

    // ── invoke("Add", [2, 3]) → completion with result 5 ─────────────
    let invoking = {
        let hub = hub.clone();
        tokio::spawn(async move { hub.invoke("Add", vec![json!(2), json!(3)]).await })
    };

    let frame = session.recv_non_ping().await;
    assert_eq!(frame["type"], 1);
    assert_eq!(frame["target"], "Add");
    assert_eq!(frame["arguments"], json!([2, 3]));
    let id = frame["invocationId"].as_str().unwrap().to_owned();

    session
        .send_text(&format!(
            "{{\"type\":3,\"invocationId\":\"{id}\",\"result\":5}}{RS}"
        ))
        .await;

    assert_eq!(invoking.await.unwrap().unwrap(), json!(5));

    // ── a hub-side error reaches the invoker ─────────────────────────
    let invoking = {
        let hub = hub.clone();
        tokio::spawn(async move { hub.invoke("Explode", vec![]).await })
    };
    let frame = session.recv_non_ping().await;
    let id = frame["invocationId"].as_str().unwrap().to_owned();
    session
        .send_text(&format!(
            "{{\"type\":3,\"invocationId\":\"{id}\",\"error\":\"kaboom\"}}{RS}"
        ))
        .await;

    match invoking.await.unwrap() {
        Err(Error::Hub(reason)) => assert_eq!(reason, "kaboom"),
        other => panic!("expected Hub error, got {other:?}"),
    }

    hub.stop().await.unwrap();
    assert_eq!(hub.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn server_invokes_registered_client_handler() {
    let (addr, mut sessions) = start_mini_hub().await;

    let hub = Arc::new(
        HubConnectionBuilder::new()
            .with_url(format!("ws://{addr}/hub"))
            .skip_negotiation()
            .build()
            .unwrap(),
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    hub.on("Echo", move |args| {
        let _ = tx.send(args.to_vec());
    })
    .unwrap();

    let starting = {
        let hub = hub.clone();
        tokio::spawn(async move { hub.start().await })
    };
    let mut session = sessions.recv().await.unwrap();
    session.accept_handshake().await;
    starting.await.unwrap().unwrap();

    session
        .send_text(&format!(
            "{{\"type\":1,\"target\":\"Echo\",\"arguments\":[\"hi\"]}}{RS}"
        ))
        .await;

    let args = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(args, vec![json!("hi")]);

    // Exactly once.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());

    hub.stop().await.unwrap();
}

#[tokio::test]
async fn handshake_rejection_surfaces_and_disconnects() {
    let (addr, mut sessions) = start_mini_hub().await;

    let hub = Arc::new(
        HubConnectionBuilder::new()
            .with_url(format!("ws://{addr}/hub"))
            .skip_negotiation()
            .build()
            .unwrap(),
    );

    let starting = {
        let hub = hub.clone();
        tokio::spawn(async move { hub.start().await })
    };
    let mut session = sessions.recv().await.unwrap();
    session
        .answer_handshake(&format!("{{\"error\":\"bad protocol\"}}{RS}"))
        .await;

    match starting.await.unwrap() {
        Err(Error::HandshakeRejected(reason)) => assert_eq!(reason, "bad protocol"),
        other => panic!("expected HandshakeRejected, got {other:?}"),
    }
    assert_eq!(hub.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn frames_split_across_websocket_messages_reassemble() {
    let (addr, mut sessions) = start_mini_hub().await;

    let hub = Arc::new(
        HubConnectionBuilder::new()
            .with_url(format!("ws://{addr}/hub"))
            .skip_negotiation()
            .build()
            .unwrap(),
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    hub.on("X", move |args| {
        let _ = tx.send(args.to_vec());
    })
    .unwrap();

    let starting = {
        let hub = hub.clone();
        tokio::spawn(async move { hub.start().await })
    };
    let mut session = sessions.recv().await.unwrap();
    session.accept_handshake().await;
    starting.await.unwrap().unwrap();

    // A ping and an invocation, split mid-frame across three messages.
    session.send_text("{\"type\":6}").await;
    session
        .send_text(&format!("{RS}{{\"type\":1,\"target\":\"X\""))
        .await;
    session
        .send_text(&format!(",\"arguments\":[]}}{RS}"))
        .await;

    let args = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(args, Vec::<Value>::new());
    assert_eq!(hub.state(), ConnectionState::Connected);

    hub.stop().await.unwrap();
}

#[tokio::test]
async fn keepalive_pings_flow_at_the_configured_interval() {
    let (addr, mut sessions) = start_mini_hub().await;

    let hub = Arc::new(
        HubConnectionBuilder::new()
            .with_url(format!("ws://{addr}/hub"))
            .skip_negotiation()
            .with_keepalive_interval(Duration::from_secs(1))
            .build()
            .unwrap(),
    );

    let starting = {
        let hub = hub.clone();
        tokio::spawn(async move { hub.start().await })
    };
    let mut session = sessions.recv().await.unwrap();
    session.accept_handshake().await;
    starting.await.unwrap().unwrap();

    // The initial ping plus at least one interval-driven ping. Feed the
    // client a frame now and then so its own server-timeout stays quiet.
    let mut pings = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(8);
    while pings < 2 && tokio::time::Instant::now() < deadline {
        session.send_text(&format!("{{\"type\":6}}{RS}")).await;
        tokio::select! {
            frame = session.from_client.recv() => {
                let frame = frame.expect("client closed");
                if frame.contains("\"type\":6") {
                    pings += 1;
                }
            }
            _ = tokio::time::sleep(Duration::from_millis(500)) => {}
        }
    }
    assert!(pings >= 2, "expected repeated pings, saw {pings}");

    hub.stop().await.unwrap();
}

#[tokio::test]
async fn silent_server_trips_the_timeout_watchdog() {
    let (addr, mut sessions) = start_mini_hub().await;

    let hub = Arc::new(
        HubConnectionBuilder::new()
            .with_url(format!("ws://{addr}/hub"))
            .skip_negotiation()
            .with_server_timeout(Duration::from_secs(1))
            .build()
            .unwrap(),
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    hub.set_disconnected(move |error| {
        let _ = tx.send(error);
    });

    let starting = {
        let hub = hub.clone();
        tokio::spawn(async move { hub.start().await })
    };
    let mut session = sessions.recv().await.unwrap();
    session.accept_handshake().await;
    starting.await.unwrap().unwrap();

    // Say nothing; the watchdog hard-stops the connection.
    let error = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("server timeout never fired")
        .unwrap();
    match error {
        Some(Error::ServerTimeout(ms)) => assert_eq!(ms, 1000),
        other => panic!("expected ServerTimeout, got {other:?}"),
    }
    assert_eq!(hub.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn dropped_socket_triggers_reconnect_with_backoff() {
    let (addr, mut sessions) = start_mini_hub().await;

    let hub = Arc::new(
        HubConnectionBuilder::new()
            .with_url(format!("ws://{addr}/hub"))
            .skip_negotiation()
            .with_automatic_reconnect(Some(vec![
                Duration::ZERO,
                Duration::from_millis(100),
            ]))
            .build()
            .unwrap(),
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    hub.set_disconnected(move |error| {
        let _ = tx.send(error.is_some());
    });

    let starting = {
        let hub = hub.clone();
        tokio::spawn(async move { hub.start().await })
    };
    let mut first = sessions.recv().await.unwrap();
    first.accept_handshake().await;
    starting.await.unwrap().unwrap();

    // Kill the connection from the server side.
    drop(first);

    // The disconnection carried a real error...
    let abnormal = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(abnormal, "expected an abnormal disconnect");

    // ...and a fresh connection attempt follows, handshake included.
    let mut second = tokio::time::timeout(Duration::from_secs(5), sessions.recv())
        .await
        .expect("no reconnect attempt observed")
        .unwrap();
    second.accept_handshake().await;

    wait_for_state(&hub, ConnectionState::Connected).await;

    // A stop during the reconnected session is still graceful.
    hub.stop().await.unwrap();
    assert_eq!(hub.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn reconnect_retries_until_an_attempt_succeeds() {
    let (addr, mut sessions) = start_mini_hub().await;

    let hub = Arc::new(
        HubConnectionBuilder::new()
            .with_url(format!("ws://{addr}/hub"))
            .skip_negotiation()
            .with_automatic_reconnect(Some(vec![
                Duration::ZERO,
                Duration::from_millis(100),
            ]))
            .build()
            .unwrap(),
    );

    let starting = {
        let hub = hub.clone();
        tokio::spawn(async move { hub.start().await })
    };
    let mut first = sessions.recv().await.unwrap();
    first.accept_handshake().await;
    starting.await.unwrap().unwrap();

    drop(first);

    // Attempt 1 gets its handshake rejected and fails...
    let mut second = tokio::time::timeout(Duration::from_secs(5), sessions.recv())
        .await
        .expect("no first reconnect attempt")
        .unwrap();
    second
        .answer_handshake(&format!("{{\"error\":\"not yet\"}}{RS}"))
        .await;

    // ...attempt 2 follows after the next backoff and succeeds.
    let mut third = tokio::time::timeout(Duration::from_secs(5), sessions.recv())
        .await
        .expect("no second reconnect attempt")
        .unwrap();
    third.accept_handshake().await;

    wait_for_state(&hub, ConnectionState::Connected).await;
    hub.stop().await.unwrap();
}

#[tokio::test]
async fn invoke_before_start_fails_cleanly() {
    let (addr, _sessions) = start_mini_hub().await;

    let hub = HubConnectionBuilder::new()
        .with_url(format!("ws://{addr}/hub"))
        .skip_negotiation()
        .build()
        .unwrap();

    match hub.invoke("Early", vec![json!(1)]).await {
        Err(Error::Transport(reason)) => assert!(reason.contains("disconnected")),
        other => panic!("expected a transport error, got {other:?}"),
    }
    // A failed send never leaks a registered callback.
    assert_eq!(hub.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn user_stop_suppresses_reconnect() {
    let (addr, mut sessions) = start_mini_hub().await;

    let hub = Arc::new(
        HubConnectionBuilder::new()
            .with_url(format!("ws://{addr}/hub"))
            .skip_negotiation()
            .with_automatic_reconnect(Some(vec![Duration::ZERO]))
            .build()
            .unwrap(),
    );

    let starting = {
        let hub = hub.clone();
        tokio::spawn(async move { hub.start().await })
    };
    let mut session = sessions.recv().await.unwrap();
    session.accept_handshake().await;
    starting.await.unwrap().unwrap();

    hub.stop().await.unwrap();

    // No reconnect attempt shows up after a graceful stop.
    let attempt = tokio::time::timeout(Duration::from_millis(500), sessions.recv()).await;
    assert!(attempt.is_err(), "graceful stop must not reconnect");
}

#[tokio::test]
async fn legacy_server_is_fatal_even_with_reconnect_enabled() {
    let (addr, mut sessions) = start_mini_hub().await;

    let hub = Arc::new(
        HubConnectionBuilder::new()
            .with_url(format!("http://{addr}/hub"))
            .with_http_client_factory(negotiate_factory(r#"{"ProtocolVersion":"1.4"}"#))
            .with_automatic_reconnect(None)
            .build()
            .unwrap(),
    );

    match hub.start().await {
        Err(Error::LegacyServerDetected) => {}
        other => panic!("expected LegacyServerDetected, got {other:?}"),
    }
    assert_eq!(hub.state(), ConnectionState::Disconnected);

    // Fatal: no transport connection is ever attempted.
    let attempt = tokio::time::timeout(Duration::from_millis(500), sessions.recv()).await;
    assert!(attempt.is_err(), "legacy detection must not reconnect");
}

#[tokio::test]
async fn concurrent_stops_share_one_outcome() {
    let (addr, mut sessions) = start_mini_hub().await;

    let hub = Arc::new(
        HubConnectionBuilder::new()
            .with_url(format!("ws://{addr}/hub"))
            .skip_negotiation()
            .build()
            .unwrap(),
    );

    let starting = {
        let hub = hub.clone();
        tokio::spawn(async move { hub.start().await })
    };
    let mut session = sessions.recv().await.unwrap();
    session.accept_handshake().await;
    starting.await.unwrap().unwrap();

    let mut stops = Vec::new();
    for _ in 0..3 {
        let hub = hub.clone();
        stops.push(tokio::spawn(async move { hub.stop().await }));
    }
    for stop in stops {
        assert!(stop.await.unwrap().is_ok());
    }
    assert_eq!(hub.state(), ConnectionState::Disconnected);

    // The hub stays usable: in-flight operations after stop fail cleanly.
    assert!(hub.invoke("Anything", vec![]).await.is_err());
}
