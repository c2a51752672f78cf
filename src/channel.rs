//! Push channel to the gateway's event endpoint.
//!
//! [`WsChannel`] keeps at most one WebSocket open. Each socket is driven by a
//! single spawned I/O task that:
//!
//! 1. connects and reports [`ChannelNotice::Opened`],
//! 2. sends `{"type":"auth","secret":…}`,
//! 3. classifies every inbound text frame by its `type` discriminator,
//! 4. reports the socket's end as [`ChannelNotice::Closed`] or
//!    [`ChannelNotice::Errored`].
//!
//! Business events (`new_message`, `chat_response`, `status`) that arrive
//! before the gateway confirms the `auth` frame are dropped. Unknown frame types
//! and unparseable text are logged and ignored; nothing on the socket is fatal
//! to the process.
//!
//! Every notice is tagged with the generation passed to [`PushChannel::open`],
//! so the owner can discard notices from a socket it already replaced.
//! Reconnecting is the owner's job: the channel itself never retries.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::config::EventTarget;

/// How long a graceful close may take before the I/O task is aborted.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Business event kinds carried by the push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    NewMessage,
    ChatResponse,
    Status,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::NewMessage => "new_message",
            EventKind::ChatResponse => "chat_response",
            EventKind::Status => "status",
        }
    }
}

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// `type: "auth"`. `success` is `None` when the gateway did not say.
    Auth {
        success: Option<bool>,
        error: Option<String>,
    },
    Event { kind: EventKind, payload: Value },
    Unknown(String),
}

/// Classify a text frame. Errors only when the text is not a JSON object
/// with a string `type`.
pub fn classify(text: &str) -> Result<Frame, String> {
    let value: Value = serde_json::from_str(text).map_err(|e| format!("invalid JSON: {e}"))?;
    let Some(kind) = value.get("type").and_then(Value::as_str) else {
        return Err("frame has no `type`".to_string());
    };
    let frame = match kind {
        "auth" => Frame::Auth {
            success: value.get("success").and_then(Value::as_bool),
            error: value
                .get("error")
                .or_else(|| value.get("message"))
                .and_then(Value::as_str)
                .map(String::from),
        },
        "new_message" => Frame::Event {
            kind: EventKind::NewMessage,
            payload: value,
        },
        "chat_response" => Frame::Event {
            kind: EventKind::ChatResponse,
            payload: value,
        },
        "status" => Frame::Event {
            kind: EventKind::Status,
            payload: value,
        },
        other => Frame::Unknown(other.to_string()),
    };
    Ok(frame)
}

/// What the channel reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelNotice {
    Opened,
    Authenticated,
    /// The gateway answered the `auth` frame with `success: false`.
    Rejected(String),
    Closed,
    Errored(String),
    Event { kind: EventKind, payload: Value },
}

/// Receiving side for `(generation, notice)` pairs.
pub type NoticeSender = mpsc::UnboundedSender<(u64, ChannelNotice)>;

/// Owner-facing contract of a push channel.
#[async_trait]
pub trait PushChannel: Send {
    /// Open a new socket, replacing any existing one. Notices are tagged with
    /// `generation`.
    async fn open(&mut self, target: EventTarget, generation: u64, notices: NoticeSender);

    /// Close the socket, if any. Returns once the socket has been dropped.
    async fn close(&mut self);
}

struct Running {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// `tokio-tungstenite` implementation of [`PushChannel`].
#[derive(Default)]
pub struct WsChannel {
    running: Option<Running>,
}

impl WsChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a socket task is still running.
    pub fn is_open(&self) -> bool {
        self.running.as_ref().is_some_and(|r| !r.task.is_finished())
    }
}

#[async_trait]
impl PushChannel for WsChannel {
    async fn open(&mut self, target: EventTarget, generation: u64, notices: NoticeSender) {
        self.close().await;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(socket_task(target, generation, notices, shutdown_rx));
        self.running = Some(Running {
            shutdown: shutdown_tx,
            task,
        });
    }

    async fn close(&mut self) {
        let Some(Running { shutdown, mut task }) = self.running.take() else {
            return;
        };
        let _ = shutdown.send(());
        if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
            warn!("push channel did not close in time, aborting");
            task.abort();
            let _ = task.await;
        }
    }
}

/// Per-socket I/O loop. Owns the socket for its whole life.
async fn socket_task(
    target: EventTarget,
    generation: u64,
    notices: NoticeSender,
    mut shutdown: oneshot::Receiver<()>,
) {
    let notify = |notice: ChannelNotice| {
        let _ = notices.send((generation, notice));
    };

    let connect = tokio_tungstenite::connect_async(target.url.as_str());
    let ws_stream = tokio::select! {
        result = connect => match result {
            Ok((ws, _)) => ws,
            Err(e) => {
                warn!("push channel connect to {} failed: {e}", target.url);
                notify(ChannelNotice::Errored(format!("WebSocket connect failed: {e}")));
                return;
            }
        },
        _ = &mut shutdown => return,
    };

    info!("push channel connected to {}", target.url);
    notify(ChannelNotice::Opened);

    let (mut ws_sink, mut ws_reader) = ws_stream.split();

    let auth = json!({ "type": "auth", "secret": target.secret }).to_string();
    if let Err(e) = ws_sink.send(Message::Text(auth.into())).await {
        notify(ChannelNotice::Errored(format!("failed to send auth frame: {e}")));
        return;
    }

    let mut authenticated = false;

    loop {
        tokio::select! {
            msg = ws_reader.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match handle_text(&text, &mut authenticated) {
                            Some(ChannelNotice::Rejected(reason)) => {
                                notify(ChannelNotice::Rejected(reason));
                                let _ = ws_sink.send(Message::Close(None)).await;
                                return;
                            }
                            Some(notice) => notify(notice),
                            None => {}
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("push channel closed by gateway");
                        notify(ChannelNotice::Closed);
                        return;
                    }
                    Some(Err(e)) => {
                        warn!("push channel error: {e}");
                        notify(ChannelNotice::Errored(e.to_string()));
                        return;
                    }
                    _ => {} // Binary/Ping/Pong
                }
            }
            _ = &mut shutdown => {
                debug!("push channel closing on request");
                let _ = ws_sink.send(Message::Close(None)).await;
                return;
            }
        }
    }
}

/// Turn one text frame into the notice to report, if any.
fn handle_text(text: &str, authenticated: &mut bool) -> Option<ChannelNotice> {
    let frame = match classify(text) {
        Ok(f) => f,
        Err(e) => {
            warn!("ignoring push frame: {e}");
            return None;
        }
    };
    match frame {
        Frame::Auth {
            success: Some(true),
            ..
        } => {
            *authenticated = true;
            Some(ChannelNotice::Authenticated)
        }
        Frame::Auth {
            success: Some(false),
            error,
        } => Some(ChannelNotice::Rejected(
            error.unwrap_or_else(|| "authentication rejected".to_string()),
        )),
        Frame::Auth { success: None, .. } => {
            debug!("auth frame without verdict ignored");
            None
        }
        Frame::Event { kind, payload } if *authenticated => {
            Some(ChannelNotice::Event { kind, payload })
        }
        Frame::Event { kind, .. } => {
            debug!("dropping {} received before authentication", kind.as_str());
            None
        }
        Frame::Unknown(kind) => {
            debug!("ignoring push frame of unknown type {kind}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_known_types() {
        assert_eq!(
            classify(r#"{"type":"auth","success":true}"#).unwrap(),
            Frame::Auth {
                success: Some(true),
                error: None
            }
        );
        let Frame::Event { kind, payload } =
            classify(r#"{"type":"new_message","content":"hi"}"#).unwrap()
        else {
            panic!("expected event");
        };
        assert_eq!(kind, EventKind::NewMessage);
        assert_eq!(payload["content"], "hi");
        assert!(matches!(
            classify(r#"{"type":"chat_response"}"#).unwrap(),
            Frame::Event {
                kind: EventKind::ChatResponse,
                ..
            }
        ));
        assert!(matches!(
            classify(r#"{"type":"status","uptime":3}"#).unwrap(),
            Frame::Event {
                kind: EventKind::Status,
                ..
            }
        ));
    }

    #[test]
    fn classify_unknown_and_invalid() {
        assert_eq!(
            classify(r#"{"type":"typing"}"#).unwrap(),
            Frame::Unknown("typing".into())
        );
        assert!(classify("not json").is_err());
        assert!(classify(r#"{"content":"x"}"#).is_err());
        assert!(classify(r#"{"type":5}"#).is_err());
    }

    #[test]
    fn events_before_auth_are_dropped() {
        let mut authed = false;
        assert_eq!(
            handle_text(r#"{"type":"new_message","content":"early"}"#, &mut authed),
            None
        );
        assert_eq!(
            handle_text(r#"{"type":"auth","success":true}"#, &mut authed),
            Some(ChannelNotice::Authenticated)
        );
        assert!(authed);
        assert!(matches!(
            handle_text(r#"{"type":"new_message","content":"late"}"#, &mut authed),
            Some(ChannelNotice::Event {
                kind: EventKind::NewMessage,
                ..
            })
        ));
    }

    #[test]
    fn auth_rejection_carries_reason() {
        let mut authed = false;
        assert_eq!(
            handle_text(
                r#"{"type":"auth","success":false,"error":"bad secret"}"#,
                &mut authed
            ),
            Some(ChannelNotice::Rejected("bad secret".into()))
        );
        assert_eq!(
            handle_text(r#"{"type":"auth","success":false}"#, &mut authed),
            Some(ChannelNotice::Rejected("authentication rejected".into()))
        );
        assert!(!authed);
    }

    #[test]
    fn noise_is_ignored() {
        let mut authed = true;
        assert_eq!(handle_text("garbage", &mut authed), None);
        assert_eq!(handle_text(r#"{"type":"pong"}"#, &mut authed), None);
        assert_eq!(handle_text(r#"{"type":"auth"}"#, &mut authed), None);
    }

    #[tokio::test]
    async fn connect_failure_reports_errored() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut channel = WsChannel::new();
        channel
            .open(
                EventTarget {
                    url: "ws://127.0.0.1:9/ws".into(),
                    secret: "s".into(),
                },
                7,
                tx,
            )
            .await;
        let (generation, notice) = rx.recv().await.unwrap();
        assert_eq!(generation, 7);
        assert!(matches!(notice, ChannelNotice::Errored(_)));
        channel.close().await;
        assert!(!channel.is_open());
    }
}
