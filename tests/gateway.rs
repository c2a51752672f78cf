//! End-to-end tests against an in-process fake gateway (axum REST + WebSocket).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use clawdbot_companion::channel::ChannelNotice;
use clawdbot_companion::supervisor::ChannelStatus;
use clawdbot_companion::transport::{detect_gateway, TransportError};
use clawdbot_companion::{
    Config, ConfigPatch, ConnectionState, Error, HttpTransport, MemoryStore, Notification,
    Subscription, Supervisor, SupervisorHandle, Transport, WsChannel,
};

const WAIT: Duration = Duration::from_secs(10);

#[derive(Clone)]
struct Gateway {
    rest_secret: String,
    ws_secret: String,
    fail_chat: Arc<AtomicBool>,
}

impl Gateway {
    fn new(secret: &str) -> Self {
        Self {
            rest_secret: secret.to_string(),
            ws_secret: secret.to_string(),
            fail_chat: Arc::new(AtomicBool::new(false)),
        }
    }

    fn authorize(&self, headers: &HeaderMap) -> Result<(), Response> {
        let given = headers
            .get("x-api-secret")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if given == self.rest_secret {
            Ok(())
        } else {
            Err((
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "Unauthorized"})),
            )
                .into_response())
        }
    }
}

fn status_body() -> Value {
    json!({"ok": true, "version": "2.0.0", "uptime": 42})
}

async fn status(State(gw): State<Gateway>, headers: HeaderMap) -> Response {
    if let Err(denied) = gw.authorize(&headers) {
        return denied;
    }
    Json(status_body()).into_response()
}

/// Unauthenticated health check, as served by a real gateway.
async fn health() -> Json<Value> {
    Json(status_body())
}

async fn sessions(State(gw): State<Gateway>, headers: HeaderMap) -> Response {
    if let Err(denied) = gw.authorize(&headers) {
        return denied;
    }
    Json(json!({"sessions": [
        {"key": "main", "label": "Main", "active": true},
        {"key": "cron"}
    ]}))
    .into_response()
}

async fn messages(
    State(gw): State<Gateway>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if let Err(denied) = gw.authorize(&headers) {
        return denied;
    }
    let limit: usize = params
        .get("limit")
        .and_then(|l| l.parse().ok())
        .unwrap_or(50);
    let list: Vec<Value> = (0..30)
        .take(limit)
        .map(|i| json!({"content": format!("message {i}"), "timestamp": 1_700_000_000_000_i64 + i, "fromMe": i % 2 == 0}))
        .collect();
    Json(Value::Array(list)).into_response()
}

async fn chat(State(gw): State<Gateway>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    if let Err(denied) = gw.authorize(&headers) {
        return denied;
    }
    if gw.fail_chat.load(Ordering::SeqCst) {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    Json(json!({"ok": true, "echo": body["message"], "target": body.get("target")})).into_response()
}

async fn ws_upgrade(State(gw): State<Gateway>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| push_session(socket, gw))
}

async fn push_session(mut socket: WebSocket, gw: Gateway) {
    // Sent before the client's auth frame is answered; must be dropped.
    let early = json!({"type": "new_message", "content": "too early"}).to_string();
    if socket.send(Message::Text(early.into())).await.is_err() {
        return;
    }

    while let Some(Ok(msg)) = socket.recv().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => return,
            _ => continue,
        };
        let frame: Value = serde_json::from_str(text.as_str()).unwrap_or_default();
        if frame["type"] != "auth" {
            continue;
        }
        if frame["secret"] == gw.ws_secret.as_str() {
            for reply in [
                json!({"type": "auth", "success": true}),
                json!({"type": "typing"}),
                json!({"type": "new_message", "content": "hello from gateway"}),
            ] {
                if socket
                    .send(Message::Text(reply.to_string().into()))
                    .await
                    .is_err()
                {
                    return;
                }
            }
        } else {
            let reply = json!({"type": "auth", "success": false, "error": "Invalid secret"});
            let _ = socket.send(Message::Text(reply.to_string().into())).await;
            return;
        }
    }
}

async fn spawn_gateway(gw: Gateway) -> SocketAddr {
    let app = Router::new()
        .route("/status", get(health))
        .route("/api/status", get(status))
        .route("/api/sessions", get(sessions))
        .route("/api/messages", get(messages))
        .route("/api/chat", post(chat))
        .route("/ws", get(ws_upgrade))
        .with_state(gw);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn config_for(addr: SocketAddr, secret: &str) -> Config {
    let mut config = Config::default();
    config.apply(ConfigPatch {
        gateway_url: Some(format!("http://{addr}")),
        api_secret: Some(secret.to_string()),
        ..ConfigPatch::default()
    });
    config
}

async fn start(config: Config) -> (SupervisorHandle, Subscription) {
    let handle = Supervisor::spawn(
        config,
        Box::new(MemoryStore::default()),
        Arc::new(HttpTransport::new().unwrap()),
        Box::new(WsChannel::new()),
    );
    let events = handle.subscribe().await.unwrap();
    (handle, events)
}

/// Receive notifications until `pred` matches; returns everything seen.
async fn until(events: &mut Subscription, pred: impl Fn(&Notification) -> bool) -> Vec<Notification> {
    let mut seen = Vec::new();
    loop {
        let n = tokio::time::timeout(WAIT, events.recv())
            .await
            .expect("timed out waiting for notification")
            .expect("supervisor stopped");
        let done = pred(&n);
        seen.push(n);
        if done {
            return seen;
        }
    }
}

#[tokio::test]
async fn connects_and_receives_push_events_after_auth() {
    let addr = spawn_gateway(Gateway::new("s3cret")).await;
    let (handle, mut events) = start(config_for(addr, "s3cret")).await;

    let status = handle.test_connection().await.unwrap();
    assert_eq!(status["version"], "2.0.0");

    let seen = until(&mut events, |n| matches!(n, Notification::NewMessage { .. })).await;
    assert!(seen.contains(&Notification::Channel {
        status: ChannelStatus::Authenticated
    }));
    let contents: Vec<_> = seen
        .iter()
        .filter_map(|n| match n {
            Notification::NewMessage { payload } => payload["content"].as_str(),
            _ => None,
        })
        .collect();
    assert_eq!(contents, vec!["hello from gateway"]);
    assert_eq!(
        handle.connection_state().await.unwrap(),
        ConnectionState::Connected
    );

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn fetches_resources_through_supervisor() {
    let addr = spawn_gateway(Gateway::new("s3cret")).await;
    let (handle, _events) = start(config_for(addr, "s3cret")).await;

    let sessions = handle.sessions().await.unwrap();
    assert_eq!(sessions.value.len(), 2);
    assert_eq!(sessions.value[0].key, "main");
    assert!(!sessions.value[1].active);

    let messages = handle.messages(10).await.unwrap();
    assert_eq!(messages.value.len(), 10);
    assert!(messages.value[0].from_me);

    let summary = handle.app_state().await.unwrap();
    assert_eq!(summary.active_sessions, 2);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn wrong_secret_is_reported_and_not_retried() {
    let addr = spawn_gateway(Gateway::new("s3cret")).await;
    let (handle, _events) = start(config_for(addr, "wrong")).await;

    let err = handle.test_connection().await.unwrap_err();
    assert_eq!(err, Error::Authentication);
    assert_eq!(err.to_string(), "Invalid API secret");
    assert_eq!(
        handle.connection_state().await.unwrap(),
        ConnectionState::Disconnected
    );

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn push_channel_rejection_enters_error_state() {
    let mut gw = Gateway::new("s3cret");
    gw.ws_secret = "different".into();
    let addr = spawn_gateway(gw).await;
    let (handle, mut events) = start(config_for(addr, "s3cret")).await;

    handle.connect().await.unwrap();
    until(&mut events, |n| {
        matches!(
            n,
            Notification::ConnectionStateChanged {
                state: ConnectionState::Error,
                ..
            }
        )
    })
    .await;
    let summary = handle.app_state().await.unwrap();
    assert_eq!(summary.connection_error.as_deref(), Some("Invalid API secret"));

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn chat_failure_does_not_change_state() {
    let gw = Gateway::new("s3cret");
    let fail_chat = Arc::clone(&gw.fail_chat);
    let addr = spawn_gateway(gw).await;
    let (handle, _events) = start(config_for(addr, "s3cret")).await;
    handle.test_connection().await.unwrap();

    let sent = handle
        .send_message("hello", Some("main".into()))
        .await
        .unwrap();
    assert_eq!(sent["echo"], "hello");
    assert_eq!(sent["target"], "main");

    fail_chat.store(true, Ordering::SeqCst);
    let err = handle.send_message("again", None).await.unwrap_err();
    assert_eq!(err.to_string(), "HTTP 500");
    assert_eq!(
        handle.connection_state().await.unwrap(),
        ConnectionState::Connected
    );

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn unreachable_gateway_reports_network_error() {
    // Bind then drop to get a port nobody listens on.
    let addr = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let (handle, mut events) = start(config_for(addr, "s3cret")).await;

    assert!(matches!(
        handle.test_connection().await,
        Err(Error::Network(_))
    ));
    let seen = until(&mut events, |n| {
        matches!(
            n,
            Notification::ConnectionStateChanged {
                state: ConnectionState::Disconnected,
                ..
            }
        )
    })
    .await;
    assert!(matches!(
        seen.last(),
        Some(Notification::ConnectionStateChanged { error: Some(_), .. })
    ));

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn transport_maps_gateway_responses() {
    let addr = spawn_gateway(Gateway::new("s3cret")).await;
    let transport = HttpTransport::new().unwrap();

    let good = config_for(addr, "s3cret").endpoint();
    let messages = transport.messages(&good, 5).await.unwrap();
    assert_eq!(messages.len(), 5);

    let bad = config_for(addr, "nope").endpoint();
    let err = transport.status(&bad).await.unwrap_err();
    assert!(err.is_unauthorized());
    assert_eq!(
        err,
        TransportError::Http {
            status: 401,
            message: "Unauthorized".into()
        }
    );
}

#[tokio::test]
async fn detect_finds_local_gateway() {
    let addr = spawn_gateway(Gateway::new("s3cret")).await;
    let probe = detect_gateway(addr.port()).await;
    assert!(probe.running);
    assert_eq!(probe.version.as_deref(), Some("2.0.0"));
    assert_eq!(probe.uptime, Some(json!(42)));

    // The API status route still wants the secret.
    let transport = HttpTransport::new().unwrap();
    let anonymous = config_for(addr, "").endpoint();
    assert!(matches!(
        transport.status(&anonymous).await,
        Err(TransportError::Http { status: 401, .. })
    ));
}

#[tokio::test]
async fn ws_channel_drops_events_before_auth() {
    use clawdbot_companion::PushChannel;

    let addr = spawn_gateway(Gateway::new("s3cret")).await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut channel = WsChannel::new();
    channel
        .open(config_for(addr, "s3cret").event_target(), 3, tx)
        .await;

    let mut notices = Vec::new();
    loop {
        let (generation, notice) = tokio::time::timeout(WAIT, rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(generation, 3);
        let done = matches!(notice, ChannelNotice::Event { .. });
        notices.push(notice);
        if done {
            break;
        }
    }
    assert_eq!(notices[0], ChannelNotice::Opened);
    assert_eq!(notices[1], ChannelNotice::Authenticated);
    assert!(matches!(
        &notices[2],
        ChannelNotice::Event { payload, .. } if payload["content"] == "hello from gateway"
    ));
    assert!(channel.is_open());

    channel.close().await;
    assert!(!channel.is_open());
}
