//! One logical connection (identified or unidentified).
//!
//! All mutation happens on a single [`ConnectionActor`] task. Callers talk to
//! it through a cloneable [`ConnectionHandle`]; commands, transport events,
//! signal changes and three optional timers are all funnelled through one
//! `select!`, so reconciliation never races itself.
//!
//! Cheap reads (observed state, the initial-queue flag, the keepalive window
//! and the open-waiters) live behind a separate std mutex so readers never
//! wait on the actor.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::TransportConfig;
use crate::desired_state::{
    DesiredState, KeepAliveTrigger, KeepAliveWindow, SignalSnapshot, evaluate,
};
use crate::dispatch::MessageDispatch;
use crate::error::{ServiceError, TransportError};
use crate::metrics::TransportMetrics;
use crate::request::{AuthClass, ChatRequest, ChatResponse};
use crate::request_info::Responder;
use crate::signals::{
    BackgroundActivity, CredentialsProvider, FatalStateSink, OutageReporter, SignalEvent,
    SignalProvider,
};
use crate::transport::{
    ChatTransport, ConnectionState, LinkChange, Transport, TransportContext, TransportEvent,
    TransportParts,
};

/// Notifications published by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    StateChanged {
        class: AuthClass,
        state: ConnectionState,
    },
    /// The server has delivered everything queued while we were offline.
    InitialQueueEmptied { class: AuthClass },
}

pub(crate) enum ConnectionCommand {
    Send {
        request: ChatRequest,
        responder: Responder,
    },
    AcquireToken(u64),
    ReleaseToken(u64),
    Reconcile,
    Shutdown,
}

struct FastState {
    state: ConnectionState,
    has_emptied_initial_queue: bool,
    keepalive: KeepAliveWindow,
    waiters: HashMap<u64, oneshot::Sender<()>>,
    next_waiter: u64,
    shut_down: bool,
}

struct Shared {
    fast: Mutex<FastState>,
    next_token: AtomicU64,
}

impl Shared {
    fn new() -> Self {
        Self {
            fast: Mutex::new(FastState {
                state: ConnectionState::Closed,
                has_emptied_initial_queue: false,
                keepalive: KeepAliveWindow::default(),
                waiters: HashMap::new(),
                next_waiter: 0,
                shut_down: false,
            }),
            next_token: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FastState> {
        self.fast.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Keeps a connection wanted while held. Released on drop.
pub struct ConnectionToken {
    id: u64,
    class: AuthClass,
    commands: mpsc::UnboundedSender<ConnectionCommand>,
}

impl ConnectionToken {
    pub fn class(&self) -> AuthClass {
        self.class
    }

    pub fn release(self) {
        drop(self)
    }
}

impl Drop for ConnectionToken {
    fn drop(&mut self) {
        let _ = self.commands.send(ConnectionCommand::ReleaseToken(self.id));
    }
}

impl fmt::Debug for ConnectionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionToken")
            .field("id", &self.id)
            .field("class", &self.class)
            .finish()
    }
}

/// Deregisters an open-waiter if its future is dropped first.
struct WaiterGuard {
    shared: Arc<Shared>,
    id: u64,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        self.shared.lock().waiters.remove(&self.id);
    }
}

/// Handle to communicate with a connection actor
#[derive(Clone)]
pub struct ConnectionHandle {
    class: AuthClass,
    commands: mpsc::UnboundedSender<ConnectionCommand>,
    shared: Arc<Shared>,
    events: broadcast::Sender<ConnectionEvent>,
    signals: Arc<dyn SignalProvider>,
    request_timeout: Duration,
}

impl ConnectionHandle {
    pub fn class(&self) -> AuthClass {
        self.class
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    pub fn has_emptied_initial_queue(&self) -> bool {
        self.shared.lock().has_emptied_initial_queue
    }

    /// Events from every connection sharing this handle's event channel.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn request_connection(&self) -> ConnectionToken {
        let id = self.shared.next_token.fetch_add(1, Ordering::Relaxed);
        let _ = self.commands.send(ConnectionCommand::AcquireToken(id));
        ConnectionToken {
            id,
            class: self.class,
            commands: self.commands.clone(),
        }
    }

    /// A push notification arrived; stay connected long enough to fetch.
    pub fn did_receive_push(&self) {
        self.shared
            .lock()
            .keepalive
            .extend(KeepAliveTrigger::ReceivedPush, Instant::now());
        let _ = self.commands.send(ConnectionCommand::Reconcile);
    }

    /// Resolves once the connection is open. Only fails if the connection
    /// has shut down.
    pub async fn wait_for_open(&self) -> Result<(), TransportError> {
        let (opened, _guard) = {
            let mut fast = self.shared.lock();
            if fast.shut_down {
                return Err(TransportError::network("connection shut down"));
            }
            if fast.state == ConnectionState::Open {
                return Ok(());
            }
            let id = fast.next_waiter;
            fast.next_waiter += 1;
            let (tx, rx) = oneshot::channel();
            fast.waiters.insert(id, tx);
            (
                rx,
                WaiterGuard {
                    shared: self.shared.clone(),
                    id,
                },
            )
        };
        opened
            .await
            .map_err(|_| TransportError::network("connection shut down"))
    }

    /// Send once open. The caller is expected to hold a [`ConnectionToken`]
    /// so the connection is wanted while we wait.
    pub async fn make_request(&self, request: ChatRequest) -> Result<ChatResponse, TransportError> {
        if self.signals.is_expired() {
            return Err(TransportError::InvalidAppState("app expired".into()));
        }
        if !self.signals.is_app_ready() {
            return Err(TransportError::InvalidAppState("app not ready".into()));
        }

        tokio::time::timeout(self.request_timeout, self.wait_for_open())
            .await
            .map_err(|_| TransportError::network("timed out waiting for connection"))??;

        let (responder, response) = oneshot::channel();
        self.commands
            .send(ConnectionCommand::Send { request, responder })
            .map_err(|_| TransportError::network("connection shut down"))?;
        response
            .await
            .map_err(|_| TransportError::network("request abandoned"))?
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(ConnectionCommand::Shutdown);
    }

    #[cfg(test)]
    pub(crate) fn waiter_count(&self) -> usize {
        self.shared.lock().waiters.len()
    }
}

/// Everything a connection actor needs from its owner.
pub(crate) struct ConnectionDeps {
    pub class: AuthClass,
    pub config: Arc<TransportConfig>,
    pub signals: Arc<dyn SignalProvider>,
    pub credentials: Arc<dyn CredentialsProvider>,
    pub dispatcher: Arc<dyn MessageDispatch>,
    pub outage: Arc<dyn OutageReporter>,
    pub fatal: Arc<dyn FatalStateSink>,
    pub metrics: Arc<TransportMetrics>,
    pub parts: TransportParts,
    pub events: broadcast::Sender<ConnectionEvent>,
}

enum Step {
    Command(Option<ConnectionCommand>),
    Transport(TransportEvent),
    Signal(Result<SignalEvent, RecvError>),
    Heartbeat,
    KeepAliveTick,
    Reconnect,
}

/// The actor that owns one logical connection
struct ConnectionActor {
    class: AuthClass,
    config: Arc<TransportConfig>,
    signals: Arc<dyn SignalProvider>,
    outage: Arc<dyn OutageReporter>,
    fatal: Arc<dyn FatalStateSink>,
    metrics: Arc<TransportMetrics>,
    transport: ChatTransport,
    shared: Arc<Shared>,
    events: broadcast::Sender<ConnectionEvent>,
    commands: mpsc::UnboundedReceiver<ConnectionCommand>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    signal_events: Option<broadcast::Receiver<SignalEvent>>,
    tokens: HashSet<u64>,
    heartbeat: Option<Interval>,
    keepalive_ticker: Option<Interval>,
    reconnect: Option<Interval>,
    background_activity: Option<BackgroundActivity>,
}

/// Spawn a connection actor and return its handle
pub(crate) fn spawn(deps: ConnectionDeps) -> (ConnectionHandle, JoinHandle<()>) {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (transport_tx, transport_rx) = mpsc::unbounded_channel();

    let ctx = TransportContext {
        class: deps.class,
        config: deps.config.clone(),
        signals: deps.signals.clone(),
        credentials: deps.credentials,
        dispatcher: deps.dispatcher,
        events: transport_tx,
        metrics: deps.metrics.clone(),
    };
    let transport = ChatTransport::build(deps.config.mode_for(deps.class), ctx, &deps.parts);
    info!(class = %deps.class, transport = transport.kind(), "starting connection");

    let shared = Arc::new(Shared::new());
    // Subscribed before the task starts so no change is missed.
    let signal_events = Some(deps.signals.subscribe());

    let handle = ConnectionHandle {
        class: deps.class,
        commands: commands_tx,
        shared: shared.clone(),
        events: deps.events.clone(),
        signals: deps.signals.clone(),
        request_timeout: deps.config.request_timeout,
    };

    let actor = ConnectionActor {
        class: deps.class,
        config: deps.config,
        signals: deps.signals,
        outage: deps.outage,
        fatal: deps.fatal,
        metrics: deps.metrics,
        transport,
        shared,
        events: deps.events,
        commands: commands_rx,
        transport_events: transport_rx,
        signal_events,
        tokens: HashSet::new(),
        heartbeat: None,
        keepalive_ticker: None,
        reconnect: None,
        background_activity: None,
    };

    let task = tokio::spawn(actor.run());
    (handle, task)
}

/// First tick one full period from now.
fn repeating(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn recv_signal(
    signals: &mut Option<broadcast::Receiver<SignalEvent>>,
) -> Result<SignalEvent, RecvError> {
    match signals {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl ConnectionActor {
    async fn run(mut self) {
        debug!(class = %self.class, "connection actor started");
        self.apply_desired_socket_state();

        loop {
            match self.next_step().await {
                Step::Command(None) | Step::Command(Some(ConnectionCommand::Shutdown)) => break,
                Step::Command(Some(command)) => self.handle_command(command),
                Step::Transport(event) => {
                    let change = self.transport.handle_event(event);
                    self.sync_state();
                    if let Some(change) = change {
                        self.handle_link_change(change);
                    }
                }
                Step::Signal(Ok(event)) => self.handle_signal(event),
                Step::Signal(Err(RecvError::Lagged(skipped))) => {
                    warn!(class = %self.class, skipped, "signal subscription lagged, reconciling");
                    self.apply_desired_socket_state();
                }
                Step::Signal(Err(RecvError::Closed)) => {
                    debug!(class = %self.class, "signal provider closed its channel");
                    self.signal_events = None;
                }
                Step::Heartbeat => self.heartbeat(),
                Step::KeepAliveTick | Step::Reconnect => self.apply_desired_socket_state(),
            }
        }

        self.stop();
    }

    async fn next_step(&mut self) -> Step {
        tokio::select! {
            command = self.commands.recv() => Step::Command(command),
            Some(event) = self.transport_events.recv() => Step::Transport(event),
            signal = recv_signal(&mut self.signal_events) => Step::Signal(signal),
            _ = tick(&mut self.heartbeat) => Step::Heartbeat,
            _ = tick(&mut self.keepalive_ticker) => Step::KeepAliveTick,
            _ = tick(&mut self.reconnect) => Step::Reconnect,
        }
    }

    fn handle_command(&mut self, command: ConnectionCommand) {
        match command {
            ConnectionCommand::Send { request, responder } => {
                if self.transport.state() == ConnectionState::Open {
                    self.transport.send(request, responder);
                } else {
                    debug!(class = %self.class, path = %request.path, "no open connection for request");
                    let _ = responder.send(Err(TransportError::network("no open connection")));
                }
            }
            ConnectionCommand::AcquireToken(id) => {
                self.tokens.insert(id);
                self.apply_desired_socket_state();
            }
            ConnectionCommand::ReleaseToken(id) => {
                if self.tokens.remove(&id) {
                    self.apply_desired_socket_state();
                }
            }
            ConnectionCommand::Reconcile => self.apply_desired_socket_state(),
            // Handled by the run loop.
            ConnectionCommand::Shutdown => {}
        }
    }

    fn handle_signal(&mut self, event: SignalEvent) {
        debug!(class = %self.class, ?event, "signal changed");
        if event.requires_cycle() && self.transport.state() != ConnectionState::Closed {
            self.cycle_socket(&format!("{event:?}"));
        } else {
            self.apply_desired_socket_state();
        }
    }

    fn handle_link_change(&mut self, change: LinkChange) {
        match change {
            LinkChange::Failed(reason) => {
                warn!(class = %self.class, %reason, "connection failed");
                self.metrics.connection_failed();
                self.outage.report_connection_failure();
            }
            LinkChange::Cycle(reason) => self.cycle_socket(&reason),
            LinkChange::QueueEmptied => {
                let first = {
                    let mut fast = self.shared.lock();
                    !std::mem::replace(&mut fast.has_emptied_initial_queue, true)
                };
                if first {
                    info!(class = %self.class, "initial queue emptied");
                    let _ = self
                        .events
                        .send(ConnectionEvent::InitialQueueEmptied { class: self.class });
                }
                self.apply_desired_socket_state();
            }
            LinkChange::KeepAlive(trigger) => {
                self.shared.lock().keepalive.extend(trigger, Instant::now());
                self.apply_desired_socket_state();
            }
            LinkChange::Fatal(error) => {
                error!(class = %self.class, %error, "fatal chat service condition");
                match error {
                    ServiceError::AppExpired => self.fatal.app_expired(),
                    ServiceError::DeviceDeregistered => self.fatal.device_deregistered(),
                    _ => {}
                }
            }
        }
    }

    fn heartbeat(&mut self) {
        if !self.desired_state().should_be_open() {
            self.apply_desired_socket_state();
            return;
        }
        if let Err(reason) = self.transport.heartbeat() {
            warn!(class = %self.class, %reason, "heartbeat failed");
            self.metrics.connection_failed();
            self.outage.report_connection_failure();
            self.transport.disconnect(&reason);
            self.sync_state();
        }
    }

    /// Force-disconnect, then reconnect if still wanted.
    fn cycle_socket(&mut self, reason: &str) {
        info!(class = %self.class, %reason, "cycling socket");
        self.transport.disconnect(reason);
        self.sync_state();
        self.apply_desired_socket_state();
    }

    fn snapshot(&self) -> SignalSnapshot {
        let state = self.transport.state();
        let (keepalive, emptied) = {
            let mut fast = self.shared.lock();
            let keepalive = fast.keepalive.active(Instant::now()).map(|k| k.trigger);
            (keepalive, fast.has_emptied_initial_queue)
        };
        SignalSnapshot {
            app_ready: self.signals.is_app_ready(),
            registered: self.signals.is_registered(),
            expired: self.signals.is_expired(),
            main_app: self.signals.is_main_app(),
            has_tokens: !self.tokens.is_empty(),
            foreground: self.signals.is_foreground(),
            keepalive,
            call_in_progress: self.signals.has_current_call(),
            draining_initial_queue: self.class == AuthClass::Identified
                && !emptied
                && state != ConnectionState::Closed,
            pending_requests: self.transport.has_pending_requests(),
        }
    }

    fn desired_state(&self) -> DesiredState {
        evaluate(&self.snapshot())
    }

    fn apply_desired_socket_state(&mut self) {
        let desired = self.desired_state();
        if desired.should_be_open() {
            if self.transport.state() == ConnectionState::Closed {
                debug!(class = %self.class, %desired, "opening");
                self.transport.connect();
            }
            if self.signals.is_foreground() {
                self.keepalive_ticker = None;
                self.background_activity = None;
            } else {
                if self.keepalive_ticker.is_none() {
                    self.keepalive_ticker = Some(repeating(self.config.keepalive_check_interval));
                }
                if self.background_activity.is_none() {
                    self.background_activity = self.signals.begin_background_activity();
                }
            }
        } else {
            if self.transport.state() != ConnectionState::Closed {
                info!(class = %self.class, %desired, "closing");
                self.transport.disconnect(&desired.to_string());
            }
            self.keepalive_ticker = None;
            self.background_activity = None;
            self.reconnect = None;
        }
        self.sync_state();
    }

    /// Publish the transport's state, filling in any skipped step so
    /// observers always see Closed → Connecting → Open → Closed.
    fn sync_state(&mut self) {
        let actual = self.transport.state();
        let previous = self.shared.lock().state;
        if previous == actual {
            return;
        }
        match (previous, actual) {
            (ConnectionState::Closed, ConnectionState::Open) => {
                self.publish(ConnectionState::Connecting)
            }
            (ConnectionState::Open, ConnectionState::Connecting) => {
                self.publish(ConnectionState::Closed)
            }
            _ => {}
        }
        self.publish(actual);
    }

    fn publish(&mut self, state: ConnectionState) {
        let waiters = {
            let mut fast = self.shared.lock();
            fast.state = state;
            if state == ConnectionState::Open {
                fast.has_emptied_initial_queue = false;
                std::mem::take(&mut fast.waiters)
            } else {
                HashMap::new()
            }
        };
        info!(class = %self.class, %state, "connection state changed");

        match state {
            ConnectionState::Open => {
                for (_, waiter) in waiters {
                    let _ = waiter.send(());
                }
                self.outage.report_connection_success();
                self.reconnect = None;
                self.heartbeat = self
                    .transport
                    .uses_heartbeat()
                    .then(|| repeating(self.config.heartbeat_interval));
            }
            ConnectionState::Closed => {
                self.heartbeat = None;
                if self.reconnect.is_none() && self.desired_state().should_be_open() {
                    debug!(class = %self.class, "arming reconnect timer");
                    self.reconnect = Some(repeating(self.config.reconnect_interval));
                }
            }
            ConnectionState::Connecting => {}
        }

        let _ = self.events.send(ConnectionEvent::StateChanged {
            class: self.class,
            state,
        });
    }

    fn stop(&mut self) {
        self.transport.disconnect("shutting down");
        self.sync_state();
        self.heartbeat = None;
        self.keepalive_ticker = None;
        self.reconnect = None;
        self.background_activity = None;

        // Dropping the senders fails every waiter.
        let waiters = {
            let mut fast = self.shared.lock();
            fast.shut_down = true;
            std::mem::take(&mut fast.waiters)
        };
        drop(waiters);

        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let ConnectionCommand::Send { responder, .. } = command {
                let _ = responder.send(Err(TransportError::network("connection shut down")));
            }
        }
        info!(class = %self.class, "connection stopped");
    }
}
