//! Connection supervisor.
//!
//! [`Supervisor`] composes a [`Transport`] and a [`PushChannel`] into one
//! connection state machine and owns everything mutable about the connection:
//! the live [`Config`], the cached status/sessions/messages snapshots, the one
//! push socket, the reconnect deadline, and the refresh deadline.
//!
//! It runs as a single actor task. The presentation layer only ever holds a
//! [`SupervisorHandle`], which can invoke the named operations and subscribe
//! to [`Notification`]s; it has no access to sockets, timers, or the store.
//!
//! ```text
//!   Unconfigured ──config completed──▶ Disconnected ◀──────────────┐
//!        ▲                               │    ▲                     │
//!      reset                          connect  test failed /    channel lost
//!        │                               ▼    │   disconnect        │
//!       any                           Connecting ──test ok──▶ Connected
//! ```
//!
//! Timers are plain deadlines held by the actor (`reconnect_at`,
//! `refresh_at`). Cancelling one means clearing it, so a cancelled timer can
//! never fire and at most one reconnect is ever pending. Results of spawned
//! requests and push-channel notices carry the attempt/epoch/generation they
//! belong to and are dropped when stale.

mod state;

pub use state::{
    AppSummary, ChannelStatus, CommandOutcome, ConnectionState, MessageSnapshot, Notification,
    ResourceKind, SessionSnapshot, Snapshot, StatusSnapshot, SystemInfo,
};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::channel::{ChannelNotice, EventKind, NoticeSender, PushChannel};
use crate::config::{Config, ConfigPatch, Readiness};
use crate::error::Error;
use crate::store::ConfigStore;
use crate::transport::{MessageRecord, SessionRecord, Transport, TransportError};

use state::truncate_chars;

/// Delay before the startup auto-connect, so early subscribers see it.
pub const AUTO_CONNECT_DELAY: Duration = Duration::from_secs(1);

/// Characters of a new message shown in its desktop alert.
const ALERT_BODY_CHARS: usize = 50;

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Connect {
        started: Reply<Result<(), Error>>,
        outcome: Option<Reply<Result<Value, Error>>>,
    },
    Disconnect {
        reply: Reply<()>,
    },
    UpdateConfig {
        patch: ConfigPatch,
        reply: Reply<Result<Config, Error>>,
    },
    GetConfig {
        reply: Reply<Config>,
    },
    MarkOnboardingSeen {
        reply: Reply<Result<(), Error>>,
    },
    Reset {
        reply: Reply<Result<(), Error>>,
    },
    Status {
        wait: bool,
        reply: Reply<StatusSnapshot>,
    },
    Sessions {
        wait: bool,
        reply: Reply<SessionSnapshot>,
    },
    Messages {
        wait: bool,
        limit: usize,
        reply: Reply<MessageSnapshot>,
    },
    Send {
        text: String,
        target: Option<String>,
        reply: Reply<Result<Value, Error>>,
    },
    QuickAction {
        name: String,
        reply: Reply<Result<Value, Error>>,
    },
    State {
        reply: Reply<ConnectionState>,
    },
    AppState {
        reply: Reply<AppSummary>,
    },
    SystemInfo {
        reply: Reply<SystemInfo>,
    },
    Subscribe {
        reply: Reply<Subscription>,
    },
    Unsubscribe {
        id: u64,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// Output of a spawned request task.
enum Completed {
    Tested {
        attempt: u64,
        result: Result<Value, TransportError>,
    },
    Status {
        epoch: u64,
        result: Result<Value, TransportError>,
    },
    Sessions {
        epoch: u64,
        result: Result<Vec<SessionRecord>, TransportError>,
    },
    Messages {
        epoch: u64,
        limit: usize,
        result: Result<Vec<MessageRecord>, TransportError>,
    },
    Sent,
}

/// A subscriber's notification stream.
pub struct Subscription {
    pub id: u64,
    receiver: mpsc::UnboundedReceiver<Notification>,
}

impl Subscription {
    /// Next notification, or `None` once the supervisor has stopped.
    pub async fn recv(&mut self) -> Option<Notification> {
        self.receiver.recv().await
    }

    /// Next notification if one is already queued.
    pub fn try_recv(&mut self) -> Option<Notification> {
        self.receiver.try_recv().ok()
    }
}

/// Cloneable handle to a running [`Supervisor`].
///
/// Every method returns [`Error::Stopped`] once the supervisor has shut down.
/// When the last handle is dropped the supervisor shuts down by itself.
#[derive(Clone)]
pub struct SupervisorHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl SupervisorHandle {
    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, Error> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).map_err(|_| Error::Stopped)?;
        rx.await.map_err(|_| Error::Stopped)
    }

    /// Start connecting. Returns once the attempt has started; its outcome is
    /// reported through `ConnectionStateChanged` notifications.
    pub async fn connect(&self) -> Result<(), Error> {
        self.request(|started| Command::Connect {
            started,
            outcome: None,
        })
        .await?
    }

    /// Connect and wait for the connection test. `Ok` carries the gateway's
    /// status payload.
    pub async fn test_connection(&self) -> Result<Value, Error> {
        let (tx, rx) = oneshot::channel();
        self.request(|started| Command::Connect {
            started,
            outcome: Some(tx),
        })
        .await??;
        rx.await.map_err(|_| Error::Stopped)?
    }

    pub async fn disconnect(&self) -> Result<(), Error> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    /// Apply a partial config update, persist it, and return the new config.
    pub async fn update_config(&self, patch: ConfigPatch) -> Result<Config, Error> {
        self.request(|reply| Command::UpdateConfig { patch, reply })
            .await?
    }

    pub async fn config(&self) -> Result<Config, Error> {
        self.request(|reply| Command::GetConfig { reply }).await
    }

    pub async fn mark_onboarding_seen(&self) -> Result<(), Error> {
        self.request(|reply| Command::MarkOnboardingSeen { reply })
            .await?
    }

    /// Drop the connection, clear caches and stored configuration.
    pub async fn reset(&self) -> Result<(), Error> {
        self.request(|reply| Command::Reset { reply }).await?
    }

    /// Cached status now; a refresh is started in the background.
    pub async fn query_status(&self) -> Result<StatusSnapshot, Error> {
        self.request(|reply| Command::Status { wait: false, reply })
            .await
    }

    pub async fn query_sessions(&self) -> Result<SessionSnapshot, Error> {
        self.request(|reply| Command::Sessions { wait: false, reply })
            .await
    }

    pub async fn query_messages(&self, limit: usize) -> Result<MessageSnapshot, Error> {
        self.request(|reply| Command::Messages {
            wait: false,
            limit,
            reply,
        })
        .await
    }

    /// Fetch status and wait for it; falls back to the last good value.
    pub async fn status(&self) -> Result<StatusSnapshot, Error> {
        self.request(|reply| Command::Status { wait: true, reply })
            .await
    }

    pub async fn sessions(&self) -> Result<SessionSnapshot, Error> {
        self.request(|reply| Command::Sessions { wait: true, reply })
            .await
    }

    /// Fetch up to `limit` messages; falls back to the cached ones (capped to
    /// `limit`, timestamp untouched) when the gateway is unreachable.
    pub async fn messages(&self, limit: usize) -> Result<MessageSnapshot, Error> {
        self.request(|reply| Command::Messages {
            wait: true,
            limit,
            reply,
        })
        .await
    }

    /// Send a chat message. Failure never changes the connection state.
    pub async fn send_message(
        &self,
        text: impl Into<String>,
        target: Option<String>,
    ) -> Result<Value, Error> {
        let text = text.into();
        self.request(|reply| Command::Send {
            text,
            target,
            reply,
        })
        .await?
    }

    /// Send the message of the named quick action.
    pub async fn send_quick_action(&self, name: impl Into<String>) -> Result<Value, Error> {
        let name = name.into();
        self.request(|reply| Command::QuickAction { name, reply })
            .await?
    }

    pub async fn connection_state(&self) -> Result<ConnectionState, Error> {
        self.request(|reply| Command::State { reply }).await
    }

    pub async fn app_state(&self) -> Result<AppSummary, Error> {
        self.request(|reply| Command::AppState { reply }).await
    }

    pub async fn system_info(&self) -> Result<SystemInfo, Error> {
        self.request(|reply| Command::SystemInfo { reply }).await
    }

    pub async fn subscribe(&self) -> Result<Subscription, Error> {
        self.request(|reply| Command::Subscribe { reply }).await
    }

    pub fn unsubscribe(&self, id: u64) {
        let _ = self.commands.send(Command::Unsubscribe { id });
    }

    /// Cancel timers, close the socket, abort in-flight requests, and stop.
    pub async fn shutdown(&self) -> Result<(), Error> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

/// The supervisor actor. Construct with [`Supervisor::spawn`].
pub struct Supervisor {
    config: Config,
    store: Box<dyn ConfigStore>,
    transport: Arc<dyn Transport>,
    channel: Box<dyn PushChannel>,

    state: ConnectionState,
    last_error: Option<Error>,

    status: StatusSnapshot,
    sessions: SessionSnapshot,
    messages: MessageSnapshot,
    /// In-flight fetches and the callers waiting on them. Present = in flight.
    status_fetch: Option<Vec<Reply<StatusSnapshot>>>,
    sessions_fetch: Option<Vec<Reply<SessionSnapshot>>>,
    messages_fetch: HashMap<usize, Vec<Reply<MessageSnapshot>>>,

    /// Current connection attempt; bumped whenever an attempt is abandoned.
    attempt: u64,
    attempt_waiters: Vec<Reply<Result<Value, Error>>>,
    /// Generation of the open socket; bumped on every open.
    channel_generation: u64,
    channel_live: bool,
    /// The push channel refused the secret before the connection test finished.
    channel_rejected: bool,
    /// Bumped when cached data stops matching the configured endpoint.
    epoch: u64,

    reconnect_at: Option<Instant>,
    refresh_at: Option<Instant>,

    subscribers: Vec<(u64, mpsc::UnboundedSender<Notification>)>,
    next_subscriber: u64,

    requests: JoinSet<Completed>,
    notices_tx: NoticeSender,
    notices_rx: mpsc::UnboundedReceiver<(u64, ChannelNotice)>,
    commands: mpsc::UnboundedReceiver<Command>,
    started: std::time::Instant,
}

impl Supervisor {
    /// Start the supervisor on the current tokio runtime.
    ///
    /// The initial state is `Disconnected` for a usable config, otherwise
    /// `Unconfigured`. With `autoConnect` set, a connect is scheduled after
    /// [`AUTO_CONNECT_DELAY`].
    pub fn spawn(
        config: Config,
        store: Box<dyn ConfigStore>,
        transport: Arc<dyn Transport>,
        channel: Box<dyn PushChannel>,
    ) -> SupervisorHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();

        let usable = config.is_usable();
        let state = if usable {
            ConnectionState::Disconnected
        } else {
            ConnectionState::Unconfigured
        };
        let reconnect_at =
            (usable && config.auto_connect).then(|| Instant::now() + AUTO_CONNECT_DELAY);
        info!("supervisor starting in state {state}");

        let supervisor = Supervisor {
            config,
            store,
            transport,
            channel,
            state,
            last_error: None,
            status: Snapshot::default(),
            sessions: Snapshot::default(),
            messages: Snapshot::default(),
            status_fetch: None,
            sessions_fetch: None,
            messages_fetch: HashMap::new(),
            attempt: 0,
            attempt_waiters: Vec::new(),
            channel_generation: 0,
            channel_live: false,
            channel_rejected: false,
            epoch: 0,
            reconnect_at,
            refresh_at: None,
            subscribers: Vec::new(),
            next_subscriber: 1,
            requests: JoinSet::new(),
            notices_tx,
            notices_rx,
            commands: commands_rx,
            started: std::time::Instant::now(),
        };
        tokio::spawn(supervisor.run());

        SupervisorHandle {
            commands: commands_tx,
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        self.shutdown().await;
                        return;
                    }
                },
                Some((generation, notice)) = self.notices_rx.recv() => {
                    self.on_notice(generation, notice).await;
                }
                Some(done) = self.requests.join_next() => match done {
                    Ok(completed) => self.on_completed(completed).await,
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => warn!("request task failed: {e}"),
                },
                () = wait_until(self.reconnect_at) => self.on_reconnect_due().await,
                () = wait_until(self.refresh_at) => self.on_refresh_due(),
            }
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { started, outcome } => self.handle_connect(started, outcome).await,
            Command::Disconnect { reply } => {
                self.teardown_connection(Error::Superseded).await;
                self.last_error = None;
                if self.state != ConnectionState::Unconfigured {
                    self.transition(ConnectionState::Disconnected);
                }
                let _ = reply.send(());
            }
            Command::UpdateConfig { patch, reply } => {
                let result = self.update_config(patch).await;
                let _ = reply.send(result);
            }
            Command::GetConfig { reply } => {
                let _ = reply.send(self.config.clone());
            }
            Command::MarkOnboardingSeen { reply } => {
                self.config.onboarding_seen = true;
                let saved = self
                    .store
                    .set("onboardingSeen", Value::Bool(true))
                    .map_err(|e| Error::Configuration(format!("failed to save configuration: {e}")));
                self.notify(Notification::ConfigChanged {
                    config: self.config.clone(),
                });
                let _ = reply.send(saved);
            }
            Command::Reset { reply } => {
                let result = self.reset().await;
                let _ = reply.send(result);
            }
            Command::Status { wait, reply } => {
                if wait && self.state != ConnectionState::Unconfigured {
                    self.fetch_status(Some(reply));
                } else {
                    let _ = reply.send(self.status.clone());
                    self.fetch_status(None);
                }
            }
            Command::Sessions { wait, reply } => {
                if wait && self.state != ConnectionState::Unconfigured {
                    self.fetch_sessions(Some(reply));
                } else {
                    let _ = reply.send(self.sessions.clone());
                    self.fetch_sessions(None);
                }
            }
            Command::Messages { wait, limit, reply } => {
                let limit = limit.max(1);
                if wait && self.state != ConnectionState::Unconfigured {
                    self.fetch_messages(limit, Some(reply));
                } else {
                    let _ = reply.send(self.messages.capped(limit));
                    self.fetch_messages(limit, None);
                }
            }
            Command::Send {
                text,
                target,
                reply,
            } => self.send_message(text, target, reply),
            Command::QuickAction { name, reply } => {
                let message = self.config.quick_action(&name).map(|a| a.message.clone());
                match message {
                    Some(text) => self.send_message(text, None, reply),
                    None => {
                        let _ = reply.send(Err(Error::Configuration(format!(
                            "Unknown quick action: {name}"
                        ))));
                    }
                }
            }
            Command::State { reply } => {
                let _ = reply.send(self.state);
            }
            Command::AppState { reply } => {
                let _ = reply.send(AppSummary {
                    state: self.state,
                    connection_error: self.last_error.as_ref().map(ToString::to_string),
                    connection_mode: self.config.connection_mode,
                    readiness: self.config.readiness(),
                    active_sessions: self.sessions.value.len(),
                    uptime_secs: self.started.elapsed().as_secs(),
                    onboarding_seen: self.config.onboarding_seen,
                    first_run: self.store.is_empty(),
                });
            }
            Command::SystemInfo { reply } => {
                let _ = reply.send(SystemInfo::current(self.started.elapsed().as_secs()));
            }
            Command::Subscribe { reply } => {
                let (tx, rx) = mpsc::unbounded_channel();
                let id = self.next_subscriber;
                self.next_subscriber += 1;
                self.subscribers.push((id, tx));
                let _ = reply.send(Subscription { id, receiver: rx });
            }
            Command::Unsubscribe { id } => self.subscribers.retain(|(sid, _)| *sid != id),
            // Handled in `run` because it ends the loop.
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    // --- Connection lifecycle ---

    async fn handle_connect(
        &mut self,
        started: Reply<Result<(), Error>>,
        outcome: Option<Reply<Result<Value, Error>>>,
    ) {
        let usable = if self.state == ConnectionState::Unconfigured {
            Err(Readiness::Unconfigured.message().to_string())
        } else {
            self.config.check_usable()
        };
        if let Err(msg) = usable {
            warn!("cannot connect: {msg}");
            let err = Error::Configuration(msg);
            if let Some(outcome) = outcome {
                let _ = outcome.send(Err(err.clone()));
            }
            let _ = started.send(Err(err));
            return;
        }

        self.begin_attempt().await;
        if let Some(outcome) = outcome {
            self.attempt_waiters.push(outcome);
        }
        let _ = started.send(Ok(()));
    }

    /// Close whatever is open, enter `Connecting`, open the push channel, and
    /// start the connection test.
    async fn begin_attempt(&mut self) {
        self.teardown_connection(Error::Superseded).await;
        self.last_error = None;
        self.transition(ConnectionState::Connecting);
        self.open_channel().await;

        let attempt = self.attempt;
        let transport = Arc::clone(&self.transport);
        let endpoint = self.config.endpoint();
        info!("testing connection to {}", endpoint.api_base);
        self.requests.spawn(async move {
            Completed::Tested {
                attempt,
                result: transport.test_connection(&endpoint).await,
            }
        });
    }

    /// Abandon the current attempt and stop every connection resource:
    /// reconnect deadline, refresh deadline, push socket.
    async fn teardown_connection(&mut self, reason: Error) {
        self.attempt += 1;
        self.channel_rejected = false;
        self.reconnect_at = None;
        self.refresh_at = None;
        self.close_channel().await;
        self.finish_attempt(&Err(reason));
    }

    fn finish_attempt(&mut self, result: &Result<Value, Error>) {
        for waiter in self.attempt_waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }

    async fn on_tested(&mut self, attempt: u64, result: Result<Value, TransportError>) {
        if attempt != self.attempt || self.state != ConnectionState::Connecting {
            debug!("ignoring result of abandoned connection attempt {attempt}");
            return;
        }
        let rejected = std::mem::take(&mut self.channel_rejected);
        match result {
            Ok(status) => {
                self.status.replace(Some(status.clone()));
                self.notify(Notification::CacheUpdated {
                    kind: ResourceKind::Status,
                });
                if rejected {
                    self.enter_auth_error().await;
                    return;
                }
                if !self.channel_live {
                    warn!("connected without a push channel");
                }
                self.transition(ConnectionState::Connected);
                self.refresh_at = Some(Instant::now());
                self.finish_attempt(&Ok(status));
            }
            Err(e) => {
                let err = Error::from(e);
                warn!("connection test failed: {err}");
                self.close_channel().await;
                self.last_error = Some(err.clone());
                self.transition(ConnectionState::Disconnected);
                self.alert("Connection failed", &err.to_string());
                if err.is_transient() {
                    self.schedule_reconnect();
                }
                self.finish_attempt(&Err(err));
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        let delay = Duration::from_secs(self.config.reconnect_delay_secs);
        info!("reconnecting in {}s", delay.as_secs());
        self.reconnect_at = Some(Instant::now() + delay);
    }

    async fn on_reconnect_due(&mut self) {
        self.reconnect_at = None;
        if self.state == ConnectionState::Disconnected && self.config.is_usable() {
            self.begin_attempt().await;
        }
    }

    async fn open_channel(&mut self) {
        self.channel_generation += 1;
        self.channel_live = true;
        self.channel
            .open(
                self.config.event_target(),
                self.channel_generation,
                self.notices_tx.clone(),
            )
            .await;
    }

    async fn close_channel(&mut self) {
        if self.channel_live {
            self.channel_live = false;
            self.channel.close().await;
        }
    }

    async fn on_notice(&mut self, generation: u64, notice: ChannelNotice) {
        if generation != self.channel_generation || !self.channel_live {
            debug!("ignoring notice from closed push channel {generation}");
            return;
        }
        match notice {
            ChannelNotice::Opened => self.notify(Notification::Channel {
                status: ChannelStatus::Open,
            }),
            ChannelNotice::Authenticated => {
                info!("push channel authenticated");
                self.notify(Notification::Channel {
                    status: ChannelStatus::Authenticated,
                });
                self.alert("Clawdbot", "Connected to gateway");
            }
            ChannelNotice::Event { kind, payload } => {
                if kind == EventKind::NewMessage {
                    let body = payload["content"].as_str().unwrap_or_default();
                    let body = truncate_chars(body, ALERT_BODY_CHARS);
                    self.alert("New message", &body);
                }
                self.notify(Notification::from_event(kind, payload));
            }
            ChannelNotice::Rejected(reason) => {
                warn!("gateway rejected the shared secret: {reason}");
                self.notify(Notification::Channel {
                    status: ChannelStatus::Error(reason),
                });
                self.close_channel().await;
                if self.state == ConnectionState::Connecting {
                    // The pending connection test decides between Error and
                    // Disconnected (a REST 401).
                    self.channel_rejected = true;
                } else {
                    self.enter_auth_error().await;
                }
            }
            ChannelNotice::Closed => {
                self.notify(Notification::Channel {
                    status: ChannelStatus::Closed,
                });
                self.on_channel_lost("push channel closed".to_string()).await;
            }
            ChannelNotice::Errored(message) => {
                self.notify(Notification::Channel {
                    status: ChannelStatus::Error(message.clone()),
                });
                self.on_channel_lost(message).await;
            }
        }
    }

    /// The gateway accepts REST but refused the push channel's secret.
    async fn enter_auth_error(&mut self) {
        self.teardown_connection(Error::Authentication).await;
        self.last_error = Some(Error::Authentication);
        self.transition(ConnectionState::Error);
    }

    async fn on_channel_lost(&mut self, reason: String) {
        // Reap the finished socket task.
        self.close_channel().await;
        if self.state == ConnectionState::Connecting {
            warn!("push channel lost while connecting: {reason}");
        } else if self.state == ConnectionState::Connected {
            warn!("push channel lost: {reason}");
            let err = Error::Network(reason);
            self.teardown_connection(err.clone()).await;
            self.last_error = Some(err);
            self.transition(ConnectionState::Disconnected);
            self.schedule_reconnect();
        }
    }

    // --- Configuration ---

    async fn update_config(&mut self, patch: ConfigPatch) -> Result<Config, Error> {
        let relevant = self.config.apply(patch);
        let saved = self.config.persist(self.store.as_mut());
        self.notify(Notification::ConfigChanged {
            config: self.config.clone(),
        });

        if relevant {
            info!("connection settings changed, dropping current connection");
            self.bump_epoch();
            self.teardown_connection(Error::Superseded).await;
            self.last_error = None;
            if self.state != ConnectionState::Unconfigured || self.config.is_usable() {
                self.transition(ConnectionState::Disconnected);
            }
        }

        saved.map_err(|e| Error::Configuration(format!("failed to save configuration: {e}")))?;
        Ok(self.config.clone())
    }

    async fn reset(&mut self) -> Result<(), Error> {
        info!("resetting configuration");
        self.teardown_connection(Error::Superseded).await;
        self.status = Snapshot::default();
        self.sessions = Snapshot::default();
        self.messages = Snapshot::default();
        self.bump_epoch();

        let cleared = match Config::reset(self.store.as_mut()) {
            Ok(config) => {
                self.config = config;
                Ok(())
            }
            Err(e) => {
                self.config = Config::unconfigured();
                Err(e)
            }
        };
        self.last_error = None;
        self.transition(ConnectionState::Unconfigured);
        self.notify(Notification::ConfigChanged {
            config: self.config.clone(),
        });
        for kind in [
            ResourceKind::Status,
            ResourceKind::Sessions,
            ResourceKind::Messages,
        ] {
            self.notify(Notification::CacheUpdated { kind });
        }
        cleared.map_err(|e| Error::Configuration(format!("failed to clear configuration: {e}")))
    }

    /// Invalidate in-flight fetches; their waiters get the current cache.
    fn bump_epoch(&mut self) {
        self.epoch += 1;
        for waiter in self.status_fetch.take().unwrap_or_default() {
            let _ = waiter.send(self.status.clone());
        }
        for waiter in self.sessions_fetch.take().unwrap_or_default() {
            let _ = waiter.send(self.sessions.clone());
        }
        for (limit, waiters) in self.messages_fetch.drain() {
            for waiter in waiters {
                let _ = waiter.send(self.messages.capped(limit));
            }
        }
    }

    // --- Cached resources ---

    fn on_refresh_due(&mut self) {
        self.refresh_at = None;
        if self.state != ConnectionState::Connected {
            return;
        }
        self.refresh_at =
            Some(Instant::now() + Duration::from_secs(self.config.refresh_interval_secs));
        self.fetch_status(None);
        self.fetch_sessions(None);
        self.fetch_messages(self.config.messages_limit, None);
    }

    fn fetch_status(&mut self, waiter: Option<Reply<StatusSnapshot>>) {
        if self.state == ConnectionState::Unconfigured {
            return;
        }
        let in_flight = self.status_fetch.is_some();
        let pending = self.status_fetch.get_or_insert_with(Vec::new);
        pending.extend(waiter);
        if in_flight {
            return;
        }
        debug!("refreshing status");
        let transport = Arc::clone(&self.transport);
        let endpoint = self.config.endpoint();
        let epoch = self.epoch;
        self.requests.spawn(async move {
            Completed::Status {
                epoch,
                result: transport.status(&endpoint).await,
            }
        });
    }

    fn fetch_sessions(&mut self, waiter: Option<Reply<SessionSnapshot>>) {
        if self.state == ConnectionState::Unconfigured {
            return;
        }
        let in_flight = self.sessions_fetch.is_some();
        let pending = self.sessions_fetch.get_or_insert_with(Vec::new);
        pending.extend(waiter);
        if in_flight {
            return;
        }
        debug!("refreshing sessions");
        let transport = Arc::clone(&self.transport);
        let endpoint = self.config.endpoint();
        let epoch = self.epoch;
        self.requests.spawn(async move {
            Completed::Sessions {
                epoch,
                result: transport.sessions(&endpoint).await,
            }
        });
    }

    fn fetch_messages(&mut self, limit: usize, waiter: Option<Reply<MessageSnapshot>>) {
        if self.state == ConnectionState::Unconfigured {
            return;
        }
        let in_flight = self.messages_fetch.contains_key(&limit);
        self.messages_fetch.entry(limit).or_default().extend(waiter);
        if in_flight {
            return;
        }
        debug!("refreshing messages (limit {limit})");
        let transport = Arc::clone(&self.transport);
        let endpoint = self.config.endpoint();
        let epoch = self.epoch;
        self.requests.spawn(async move {
            Completed::Messages {
                epoch,
                limit,
                result: transport.messages(&endpoint, limit).await,
            }
        });
    }

    async fn on_completed(&mut self, completed: Completed) {
        match completed {
            Completed::Tested { attempt, result } => self.on_tested(attempt, result).await,
            Completed::Status { epoch, result } => {
                if epoch != self.epoch {
                    return;
                }
                match result {
                    Ok(value) => {
                        self.status.replace(Some(value));
                        self.notify(Notification::CacheUpdated {
                            kind: ResourceKind::Status,
                        });
                    }
                    Err(e) => debug!("status refresh failed, keeping last value: {e}"),
                }
                for waiter in self.status_fetch.take().unwrap_or_default() {
                    let _ = waiter.send(self.status.clone());
                }
            }
            Completed::Sessions { epoch, result } => {
                if epoch != self.epoch {
                    return;
                }
                match result {
                    Ok(sessions) => {
                        self.sessions.replace(sessions);
                        self.notify(Notification::CacheUpdated {
                            kind: ResourceKind::Sessions,
                        });
                    }
                    Err(e) => debug!("sessions refresh failed, keeping last value: {e}"),
                }
                for waiter in self.sessions_fetch.take().unwrap_or_default() {
                    let _ = waiter.send(self.sessions.clone());
                }
            }
            Completed::Messages {
                epoch,
                limit,
                result,
            } => {
                if epoch != self.epoch {
                    return;
                }
                match result {
                    Ok(mut messages) => {
                        messages.truncate(limit);
                        self.messages.replace(messages);
                        self.notify(Notification::CacheUpdated {
                            kind: ResourceKind::Messages,
                        });
                    }
                    Err(e) => debug!("messages refresh failed, keeping last value: {e}"),
                }
                for waiter in self.messages_fetch.remove(&limit).unwrap_or_default() {
                    let _ = waiter.send(self.messages.capped(limit));
                }
            }
            Completed::Sent => {}
        }
    }

    fn send_message(
        &mut self,
        text: String,
        target: Option<String>,
        reply: Reply<Result<Value, Error>>,
    ) {
        if self.state == ConnectionState::Unconfigured {
            let _ = reply.send(Err(Error::Configuration(
                Readiness::Unconfigured.message().to_string(),
            )));
            return;
        }
        let transport = Arc::clone(&self.transport);
        let endpoint = self.config.endpoint();
        self.requests.spawn(async move {
            let result = transport
                .send_message(&endpoint, &text, target.as_deref())
                .await
                .map_err(Error::from);
            if let Err(e) = &result {
                warn!("send failed: {e}");
            }
            let _ = reply.send(result);
            Completed::Sent
        });
    }

    // --- Notifications ---

    fn transition(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        info!("connection state {} -> {next}", self.state);
        self.state = next;
        self.notify(Notification::ConnectionStateChanged {
            state: next,
            error: self.last_error.as_ref().map(ToString::to_string),
        });
    }

    fn alert(&mut self, title: &str, body: &str) {
        if self.config.notifications_enabled {
            self.notify(Notification::Alert {
                title: title.to_string(),
                body: body.to_string(),
            });
        }
    }

    fn notify(&mut self, notification: Notification) {
        self.subscribers
            .retain(|(_, tx)| tx.send(notification.clone()).is_ok());
    }

    async fn shutdown(&mut self) {
        info!("supervisor shutting down");
        self.teardown_connection(Error::Stopped).await;
        self.requests.shutdown().await;
        self.status_fetch = None;
        self.sessions_fetch = None;
        self.messages_fetch.clear();
    }
}

/// Resolve at `deadline`, or never when there is none.
async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
