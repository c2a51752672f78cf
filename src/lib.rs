#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]

//! # clawdbot-companion
//!
//! Connection core of the desktop companion for a Clawdbot gateway.
//!
//! The gateway exposes a REST API (`/status`, `/sessions`, `/messages`,
//! `/chat`, authenticated by an `X-API-Secret` header) and a WebSocket push
//! channel that streams `new_message`, `chat_response` and `status` events
//! after an `auth` handshake. This crate keeps one supervised connection to
//! it and hands a presentation layer (tray/window UI, or the bundled CLI)
//! cached data plus a stream of [`Notification`]s.
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — CLI entry point, tracing setup, Ctrl-C handling
//! config.rs        — Config model, patch/derive/validate, env overrides
//! store.rs         — ConfigStore trait, JSON file store, in-memory store
//! error.rs         — user-facing error taxonomy
//! transport.rs     — REST client for the gateway (reqwest), gateway probe
//! channel.rs       — push channel (tokio-tungstenite), auth + event framing
//! supervisor/
//!   mod.rs         — connection state machine actor + SupervisorHandle
//!   state.rs       — ConnectionState, snapshots, notifications, summaries
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use clawdbot_companion::{Config, FileStore, HttpTransport, Supervisor, WsChannel};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let store = FileStore::open_default()?;
//! let config = Config::load(&store)?;
//! let handle = Supervisor::spawn(
//!     config,
//!     Box::new(store),
//!     Arc::new(HttpTransport::new()?),
//!     Box::new(WsChannel::new()),
//! );
//! let mut events = handle.subscribe().await?;
//! handle.connect().await?;
//! while let Some(n) = events.recv().await {
//!     println!("{}", serde_json::to_string(&n)?);
//! }
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod error;
pub mod store;
pub mod supervisor;
pub mod transport;

pub use channel::{PushChannel, WsChannel};
pub use config::{Config, ConfigPatch, ConnectionMode, Readiness};
pub use error::Error;
pub use store::{ConfigStore, FileStore, MemoryStore};
pub use supervisor::{
    AppSummary, CommandOutcome, ConnectionState, Notification, Subscription, Supervisor,
    SupervisorHandle,
};
pub use transport::{HttpTransport, Transport};
