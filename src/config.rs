//! Companion configuration model.
//!
//! A [`Config`] is an immutable snapshot: the supervisor owns the live copy and
//! hands clones (or the narrower [`Endpoint`] / [`EventTarget`] views) to the
//! transport and the push channel. Mutation happens only through
//! [`Config::apply`] with a [`ConfigPatch`], which re-derives dependent fields.
//!
//! Persisted keys are camelCase, matching the JSON the presentation layer sends:
//!
//! ```json
//! {
//!   "gatewayUrl": "http://localhost:3000",
//!   "apiUrl": "http://localhost:3000/api",
//!   "eventUrl": "ws://localhost:3000/ws",
//!   "apiSecret": "clawdbot-…",
//!   "notificationsEnabled": true,
//!   "autoConnect": false,
//!   "startMinimized": false,
//!   "theme": "dark",
//!   "connectionMode": "local"
//! }
//! ```
//!
//! Environment overrides (applied by the binary at startup, highest wins):
//! `CLAWDBOT_GATEWAY_URL`, `CLAWDBOT_API_SECRET`, `CLAWDBOT_PORT`.

use std::fmt;

use rand::Rng;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::{ConfigStore, StoreError};

/// Port used for the default gateway URL when `CLAWDBOT_PORT` is not set.
pub const DEFAULT_GATEWAY_PORT: u16 = 3000;

/// How the companion reaches its gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    /// Setup not finished; no connection attempts are made.
    Unconfigured,
    /// Gateway on this machine; api/event URLs derive from the gateway URL.
    #[default]
    Local,
    /// Gateway elsewhere; api/event URLs are taken as entered.
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Dark,
    Light,
}

/// A named canned message shown as a one-click action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuickAction {
    pub name: String,
    pub message: String,
}

/// Full companion configuration.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub gateway_url: String,
    pub api_url: String,
    pub event_url: String,
    pub api_secret: String,
    pub notifications_enabled: bool,
    pub auto_connect: bool,
    pub start_minimized: bool,
    pub theme: Theme,
    pub connection_mode: ConnectionMode,
    pub onboarding_seen: bool,
    pub quick_actions: Vec<QuickAction>,
    /// Page size used by the periodic message refresh.
    pub messages_limit: usize,
    pub refresh_interval_secs: u64,
    pub reconnect_delay_secs: u64,
}

/// Partial update. Only `Some` fields are written.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigPatch {
    pub gateway_url: Option<String>,
    pub api_url: Option<String>,
    pub event_url: Option<String>,
    pub api_secret: Option<String>,
    pub notifications_enabled: Option<bool>,
    pub auto_connect: Option<bool>,
    pub start_minimized: Option<bool>,
    pub theme: Option<Theme>,
    pub connection_mode: Option<ConnectionMode>,
    pub onboarding_seen: Option<bool>,
    pub quick_actions: Option<Vec<QuickAction>>,
    pub messages_limit: Option<usize>,
    pub refresh_interval_secs: Option<u64>,
    pub reconnect_delay_secs: Option<u64>,
}

/// Whether the configuration is complete enough to connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Readiness {
    /// Mode is `unconfigured` or there is no gateway URL.
    Unconfigured,
    /// Endpoint present but no shared secret.
    Incomplete,
    Ready,
}

impl Readiness {
    pub fn message(self) -> &'static str {
        match self {
            Readiness::Unconfigured => "Gateway URL not set",
            Readiness::Incomplete => "API secret not configured",
            Readiness::Ready => "Ready to connect",
        }
    }
}

/// REST base URL plus the shared secret, as read by the transport.
#[derive(Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub api_base: String,
    pub secret: Option<String>,
}

/// Push-channel URL plus the shared secret for the `auth` frame.
#[derive(Clone, PartialEq, Eq)]
pub struct EventTarget {
    pub url: String,
    pub secret: String,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("api_base", &self.api_base)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl fmt::Debug for EventTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventTarget")
            .field("url", &self.url)
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secret = if self.api_secret.is_empty() {
            ""
        } else {
            "<redacted>"
        };
        f.debug_struct("Config")
            .field("gateway_url", &self.gateway_url)
            .field("api_url", &self.api_url)
            .field("event_url", &self.event_url)
            .field("api_secret", &secret)
            .field("notifications_enabled", &self.notifications_enabled)
            .field("auto_connect", &self.auto_connect)
            .field("start_minimized", &self.start_minimized)
            .field("theme", &self.theme)
            .field("connection_mode", &self.connection_mode)
            .field("onboarding_seen", &self.onboarding_seen)
            .field("quick_actions", &self.quick_actions)
            .field("messages_limit", &self.messages_limit)
            .field("refresh_interval_secs", &self.refresh_interval_secs)
            .field("reconnect_delay_secs", &self.reconnect_delay_secs)
            .finish()
    }
}

fn default_gateway_url() -> String {
    let port = std::env::var("CLAWDBOT_PORT")
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(DEFAULT_GATEWAY_PORT);
    format!("http://localhost:{port}")
}
fn default_quick_actions() -> Vec<QuickAction> {
    [
        ("Status", "status"),
        ("Sessions", "sessions list"),
        ("Health", "health"),
    ]
    .into_iter()
    .map(|(name, message)| QuickAction {
        name: name.to_string(),
        message: message.to_string(),
    })
    .collect()
}
fn default_messages_limit() -> usize {
    50
}
fn default_refresh_interval_secs() -> u64 {
    5
}
fn default_reconnect_delay_secs() -> u64 {
    5
}

impl Default for Config {
    fn default() -> Self {
        let gateway_url = default_gateway_url();
        let api_url = derive_api_url(&gateway_url);
        let event_url = derive_event_url(&gateway_url).unwrap_or_default();
        Self {
            gateway_url,
            api_url,
            event_url,
            api_secret: String::new(),
            notifications_enabled: true,
            auto_connect: false,
            start_minimized: false,
            theme: Theme::Dark,
            connection_mode: ConnectionMode::Local,
            onboarding_seen: false,
            quick_actions: default_quick_actions(),
            messages_limit: default_messages_limit(),
            refresh_interval_secs: default_refresh_interval_secs(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
        }
    }
}

/// `http://host:port` → `http://host:port/api`.
fn derive_api_url(gateway_url: &str) -> String {
    format!("{}/api", gateway_url.trim_end_matches('/'))
}

/// `http(s)://host:port/...` → `ws(s)://host:port/ws`.
fn derive_event_url(gateway_url: &str) -> Option<String> {
    let base = gateway_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        return None;
    };
    Some(format!("{ws_base}/ws"))
}

impl Config {
    /// Keys persisted in the store, one per field.
    pub const KEYS: [&'static str; 14] = [
        "gatewayUrl",
        "apiUrl",
        "eventUrl",
        "apiSecret",
        "notificationsEnabled",
        "autoConnect",
        "startMinimized",
        "theme",
        "connectionMode",
        "onboardingSeen",
        "quickActions",
        "messagesLimit",
        "refreshIntervalSecs",
        "reconnectDelaySecs",
    ];

    /// Configuration after an explicit reset: defaults, but not yet set up.
    pub fn unconfigured() -> Self {
        Self {
            connection_mode: ConnectionMode::Unconfigured,
            ..Self::default()
        }
    }

    /// Clear the store down to the unconfigured mode, so a later
    /// [`Config::load`] also comes back unconfigured.
    pub fn reset(store: &mut dyn ConfigStore) -> Result<Self, StoreError> {
        let config = Self::unconfigured();
        store.clear()?;
        store.set(
            "connectionMode",
            serde_json::to_value(config.connection_mode)
                .map_err(|e| StoreError::Decode(e.to_string()))?,
        )?;
        Ok(config)
    }

    /// Read every key from the store, falling back to its default. Values that
    /// fail to decode are logged and replaced by the default.
    pub fn load(store: &dyn ConfigStore) -> Result<Self, StoreError> {
        let mut merged = serde_json::to_value(Self::default())
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        for key in Self::KEYS {
            if let Some(value) = store.get(key)? {
                merged[key] = value;
            }
        }
        match serde_json::from_value(merged) {
            Ok(config) => Ok(config),
            Err(e) => {
                tracing::warn!("stored configuration is invalid ({e}), using defaults per key");
                Ok(Self::load_lenient(store))
            }
        }
    }

    fn load_lenient(store: &dyn ConfigStore) -> Self {
        let defaults = Self::default();
        let mut merged = match serde_json::to_value(&defaults) {
            Ok(v) => v,
            Err(_) => return defaults,
        };
        for key in Self::KEYS {
            let Ok(Some(value)) = store.get(key) else {
                continue;
            };
            let previous = std::mem::replace(&mut merged[key], value);
            if serde_json::from_value::<Self>(merged.clone()).is_err() {
                tracing::warn!("ignoring invalid stored value for {key}");
                merged[key] = previous;
            }
        }
        serde_json::from_value(merged).unwrap_or(defaults)
    }

    /// Write every field to the store.
    pub fn persist(&self, store: &mut dyn ConfigStore) -> Result<(), StoreError> {
        let value = serde_json::to_value(self).map_err(|e| StoreError::Decode(e.to_string()))?;
        let Value::Object(fields) = value else {
            return Err(StoreError::Decode("config did not serialize to an object".into()));
        };
        store.set_many(fields.into_iter().collect())
    }

    /// Apply a partial update and re-derive dependent URLs.
    ///
    /// Returns `true` when a connection-relevant field (urls, secret, mode)
    /// changed, i.e. any live connection was made against stale settings.
    pub fn apply(&mut self, patch: ConfigPatch) -> bool {
        let before = (
            self.gateway_url.clone(),
            self.api_url.clone(),
            self.event_url.clone(),
            self.api_secret.clone(),
            self.connection_mode,
        );

        if let Some(v) = patch.gateway_url {
            self.gateway_url = v.trim().trim_end_matches('/').to_string();
            // Entering a gateway finishes setup unless a mode comes with it.
            if self.connection_mode == ConnectionMode::Unconfigured
                && patch.connection_mode.is_none()
                && !self.gateway_url.is_empty()
            {
                self.connection_mode = ConnectionMode::Local;
            }
        }
        if let Some(v) = patch.api_url {
            self.api_url = v.trim().trim_end_matches('/').to_string();
        }
        if let Some(v) = patch.event_url {
            self.event_url = v.trim().to_string();
        }
        if let Some(v) = patch.api_secret {
            self.api_secret = v;
        }
        if let Some(v) = patch.notifications_enabled {
            self.notifications_enabled = v;
        }
        if let Some(v) = patch.auto_connect {
            self.auto_connect = v;
        }
        if let Some(v) = patch.start_minimized {
            self.start_minimized = v;
        }
        if let Some(v) = patch.theme {
            self.theme = v;
        }
        if let Some(v) = patch.connection_mode {
            self.connection_mode = v;
        }
        if let Some(v) = patch.onboarding_seen {
            self.onboarding_seen = v;
        }
        if let Some(v) = patch.quick_actions {
            self.quick_actions = v;
        }
        if let Some(v) = patch.messages_limit {
            self.messages_limit = v.max(1);
        }
        if let Some(v) = patch.refresh_interval_secs {
            self.refresh_interval_secs = v.max(1);
        }
        if let Some(v) = patch.reconnect_delay_secs {
            self.reconnect_delay_secs = v.max(1);
        }

        self.derive();

        before
            != (
                self.gateway_url.clone(),
                self.api_url.clone(),
                self.event_url.clone(),
                self.api_secret.clone(),
                self.connection_mode,
            )
    }

    fn derive(&mut self) {
        match self.connection_mode {
            ConnectionMode::Local => {
                self.api_url = derive_api_url(&self.gateway_url);
                if let Some(event) = derive_event_url(&self.gateway_url) {
                    self.event_url = event;
                }
            }
            ConnectionMode::Remote => {
                if self.api_url.is_empty() {
                    self.api_url = derive_api_url(&self.gateway_url);
                }
                if self.event_url.is_empty() {
                    self.event_url = derive_event_url(&self.gateway_url).unwrap_or_default();
                }
            }
            ConnectionMode::Unconfigured => {}
        }
    }

    pub fn readiness(&self) -> Readiness {
        if self.connection_mode == ConnectionMode::Unconfigured || self.gateway_url.is_empty() {
            Readiness::Unconfigured
        } else if self.api_secret.is_empty() {
            Readiness::Incomplete
        } else {
            Readiness::Ready
        }
    }

    /// Check that a connection attempt could be made with these settings.
    pub fn check_usable(&self) -> Result<(), String> {
        if self.readiness() == Readiness::Unconfigured {
            return Err(Readiness::Unconfigured.message().to_string());
        }
        validate_gateway_url(&self.api_url).map_err(|e| format!("API URL: {e}"))?;
        let event = Url::parse(&self.event_url).map_err(|_| "Event URL: Invalid URL format")?;
        if !matches!(event.scheme(), "ws" | "wss") {
            return Err("Event URL must use ws or wss protocol".to_string());
        }
        Ok(())
    }

    pub fn is_usable(&self) -> bool {
        self.check_usable().is_ok()
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            api_base: self.api_url.trim_end_matches('/').to_string(),
            secret: (!self.api_secret.is_empty()).then(|| self.api_secret.clone()),
        }
    }

    pub fn event_target(&self) -> EventTarget {
        EventTarget {
            url: self.event_url.clone(),
            secret: self.api_secret.clone(),
        }
    }

    pub fn quick_action(&self, name: &str) -> Option<&QuickAction> {
        self.quick_actions
            .iter()
            .find(|a| a.name.eq_ignore_ascii_case(name))
    }

    /// Apply `CLAWDBOT_GATEWAY_URL` / `CLAWDBOT_API_SECRET` overrides.
    pub fn apply_env_overrides(&mut self) {
        let patch = ConfigPatch {
            gateway_url: std::env::var("CLAWDBOT_GATEWAY_URL").ok(),
            api_secret: std::env::var("CLAWDBOT_API_SECRET").ok(),
            ..ConfigPatch::default()
        };
        if patch != ConfigPatch::default() {
            self.apply(patch);
        }
    }
}

/// Validate a gateway/API URL: parseable, `http`/`https`, with a host.
pub fn validate_gateway_url(url: &str) -> Result<Url, String> {
    let parsed = Url::parse(url).map_err(|_| "Invalid URL format".to_string())?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err("URL must use http or https protocol".to_string());
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err("Invalid hostname".to_string());
    }
    Ok(parsed)
}

/// Fresh shared secret: `clawdbot-` plus 32 random alphanumerics.
pub fn generate_api_secret() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(32)
        .map(char::from)
        .collect();
    format!("clawdbot-{suffix}")
}
