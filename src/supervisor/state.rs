//! Values the supervisor exposes: connection state, cached snapshots, and the
//! notifications pushed to subscribers.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::Value;

use crate::channel::EventKind;
use crate::config::{Config, ConnectionMode, Readiness};
use crate::error::Error;
use crate::transport::{MessageRecord, SessionRecord};

/// Connection state. Exactly one value at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Unconfigured,
    Disconnected,
    Connecting,
    Connected,
    /// The gateway rejected the shared secret on the push channel.
    Error,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Unconfigured => "unconfigured",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last successfully retrieved value of a resource.
///
/// `fetched_at_ms` is `None` until the first successful fetch and is only
/// moved forward by a successful fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot<T> {
    pub value: T,
    pub fetched_at_ms: Option<u64>,
}

impl<T> Snapshot<T> {
    pub(crate) fn replace(&mut self, value: T) {
        self.value = value;
        self.fetched_at_ms = Some(now_ms());
    }
}

impl Snapshot<Vec<MessageRecord>> {
    /// Copy of the snapshot holding at most `limit` messages.
    pub(crate) fn capped(&self, limit: usize) -> Self {
        Self {
            value: self.value.iter().take(limit).cloned().collect(),
            fetched_at_ms: self.fetched_at_ms,
        }
    }
}

pub type StatusSnapshot = Snapshot<Option<Value>>;
pub type SessionSnapshot = Snapshot<Vec<SessionRecord>>;
pub type MessageSnapshot = Snapshot<Vec<MessageRecord>>;

/// Which cached resource changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Status,
    Sessions,
    Messages,
}

/// Push-channel status as shown in the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "status", content = "message")]
pub enum ChannelStatus {
    Open,
    Authenticated,
    Closed,
    Error(String),
}

/// Everything pushed to subscribers.
///
/// State changes arrive in transition order. Cache updates for different
/// resources carry no ordering guarantee relative to each other.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Notification {
    ConnectionStateChanged {
        state: ConnectionState,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ConfigChanged {
        config: Config,
    },
    CacheUpdated {
        kind: ResourceKind,
    },
    NewMessage {
        payload: Value,
    },
    ChatResponse {
        payload: Value,
    },
    SystemStatus {
        payload: Value,
    },
    Channel {
        status: ChannelStatus,
    },
    /// Request for a desktop notification; only sent when notifications are
    /// enabled in the configuration.
    Alert {
        title: String,
        body: String,
    },
}

impl Notification {
    pub(crate) fn from_event(kind: EventKind, payload: Value) -> Self {
        match kind {
            EventKind::NewMessage => Notification::NewMessage { payload },
            EventKind::ChatResponse => Notification::ChatResponse { payload },
            EventKind::Status => Notification::SystemStatus { payload },
        }
    }
}

/// Success/failure envelope handed to the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<Result<Value, Error>> for CommandOutcome {
    fn from(result: Result<Value, Error>) -> Self {
        match result {
            Ok(value) => CommandOutcome {
                success: true,
                result: Some(value),
                error: None,
            },
            Err(e) => CommandOutcome {
                success: false,
                result: None,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Summary used by the settings/dashboard view.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSummary {
    pub state: ConnectionState,
    pub connection_error: Option<String>,
    pub connection_mode: ConnectionMode,
    pub readiness: Readiness,
    pub active_sessions: usize,
    pub uptime_secs: u64,
    pub onboarding_seen: bool,
    pub first_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    pub platform: &'static str,
    pub arch: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
}

impl SystemInfo {
    pub(crate) fn current(uptime_secs: u64) -> Self {
        Self {
            platform: std::env::consts::OS,
            arch: std::env::consts::ARCH,
            version: env!("CARGO_PKG_VERSION"),
            uptime_secs,
        }
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

/// First `max` characters of `text`, with an ellipsis when cut.
pub(crate) fn truncate_chars(text: &str, max: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max).collect();
    if chars.next().is_some() {
        format!("{head}…")
    } else {
        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn outcome_from_auth_failure() {
        let outcome = CommandOutcome::from(Err(Error::Authentication));
        assert_eq!(
            serde_json::to_value(&outcome).unwrap(),
            json!({"success": false, "error": "Invalid API secret"})
        );
    }

    #[test]
    fn outcome_from_success() {
        let outcome = CommandOutcome::from(Ok(json!({"ok": true})));
        assert!(outcome.success);
        assert_eq!(outcome.result, Some(json!({"ok": true})));
    }

    #[test]
    fn notification_wire_shape() {
        let n = Notification::ConnectionStateChanged {
            state: ConnectionState::Connecting,
            error: None,
        };
        assert_eq!(
            serde_json::to_value(&n).unwrap(),
            json!({"type": "connectionStateChanged", "state": "connecting"})
        );
        let n = Notification::Channel {
            status: ChannelStatus::Error("boom".into()),
        };
        assert_eq!(
            serde_json::to_value(&n).unwrap(),
            json!({"type": "channel", "status": {"status": "error", "message": "boom"}})
        );
    }

    #[test]
    fn capped_keeps_timestamp() {
        let mut snap = MessageSnapshot::default();
        snap.replace(
            (0..5)
                .map(|i| MessageRecord {
                    content: i.to_string(),
                    timestamp: None,
                    from_me: false,
                })
                .collect(),
        );
        let capped = snap.capped(2);
        assert_eq!(capped.value.len(), 2);
        assert_eq!(capped.fetched_at_ms, snap.fetched_at_ms);
    }

    #[test]
    fn truncate_chars_respects_boundaries() {
        assert_eq!(truncate_chars("short", 50), "short");
        assert_eq!(truncate_chars("héllo wörld", 5), "héllo…");
    }
}
