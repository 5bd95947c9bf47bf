//! Shared test utilities: channel-backed sockets, a scriptable chat service
//! and recording collaborators.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::channel::mpsc as fmpsc;
use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};

use crate::config::{TransportConfig, TransportMode};
use crate::dispatch::{DispatchOutcome, MessageDispatch};
use crate::error::{ServiceError, TransportError};
use crate::manager::{Collaborators, ServiceClients};
use crate::metrics::TransportMetrics;
use crate::request::{AuthClass, ChatRequest, Headers};
use crate::signals::{FatalStateSink, ManualSignals, OutageReporter, StaticCredentials};
use crate::state_machine::{self, ConnectionDeps, ConnectionEvent, ConnectionHandle};
use crate::transport::frame::WireMessage;
use crate::transport::service::{ChatService, ServiceAck, ServiceListener, ServiceResponse};
use crate::transport::socket::{ConnectRequest, Connector, FramedSocket};
use crate::transport::stats::{LogNotifier, MemoryStore};
use crate::transport::{ConnectionState, TransportContext, TransportEvent, TransportParts};

// =============================================================================
// Sockets
// =============================================================================

/// The far end of a [`socket_pair`]. Dropping it ends the client's stream.
pub(crate) struct MockServer {
    pub request: Option<ConnectRequest>,
    from_client: fmpsc::UnboundedReceiver<WireMessage>,
    to_client: fmpsc::UnboundedSender<Result<WireMessage, TransportError>>,
}

impl MockServer {
    pub fn class(&self) -> Option<AuthClass> {
        self.request.as_ref().map(|r| r.class)
    }

    pub async fn next_frame(&mut self) -> WireMessage {
        self.from_client
            .next()
            .await
            .expect("client closed the socket")
    }

    pub fn try_next_frame(&mut self) -> Option<WireMessage> {
        self.from_client.next().now_or_never().flatten()
    }

    pub fn send(&self, frame: WireMessage) {
        let _ = self.to_client.unbounded_send(Ok(frame));
    }
}

pub(crate) fn socket_pair() -> (FramedSocket, MockServer) {
    let (to_server, from_client) = fmpsc::unbounded::<WireMessage>();
    let (to_client, from_server) = fmpsc::unbounded::<Result<WireMessage, TransportError>>();
    let sink = to_server.sink_map_err(|e| TransportError::network(e.to_string()));
    let socket = FramedSocket {
        sink: Box::pin(sink),
        stream: from_server.boxed(),
    };
    let server = MockServer {
        request: None,
        from_client,
        to_client,
    };
    (socket, server)
}

/// Connector whose sockets are [`MockServer`]s handed out by [`accept`].
///
/// [`accept`]: MockConnector::accept
pub(crate) struct MockConnector {
    servers_tx: mpsc::UnboundedSender<MockServer>,
    servers_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MockServer>>,
    failures: Mutex<VecDeque<String>>,
    stalled: AtomicBool,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        let (servers_tx, servers_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            servers_tx,
            servers_rx: tokio::sync::Mutex::new(servers_rx),
            failures: Mutex::new(VecDeque::new()),
            stalled: AtomicBool::new(false),
        })
    }

    /// The server side of the next successful connect.
    pub async fn accept(&self) -> MockServer {
        self.servers_rx
            .lock()
            .await
            .recv()
            .await
            .expect("connector dropped")
    }

    pub fn fail_next(&self, reason: &str) {
        self.failures.lock().unwrap().push_back(reason.to_string());
    }

    /// Connect attempts never complete.
    pub fn stall(&self) {
        self.stalled.store(true, Ordering::SeqCst);
    }
}

impl Connector for MockConnector {
    fn connect(
        &self,
        request: ConnectRequest,
    ) -> BoxFuture<'static, Result<FramedSocket, TransportError>> {
        if self.stalled.load(Ordering::SeqCst) {
            return futures::future::pending().boxed();
        }
        if let Some(reason) = self.failures.lock().unwrap().pop_front() {
            return futures::future::ready(Err(TransportError::network(reason))).boxed();
        }
        let (socket, mut server) = socket_pair();
        server.request = Some(request);
        let _ = self.servers_tx.send(server);
        futures::future::ready(Ok(socket)).boxed()
    }
}

// =============================================================================
// Collaborators
// =============================================================================

/// Records every envelope and answers with a settable outcome.
pub(crate) struct RecordingDispatcher {
    processed: Mutex<Vec<(Vec<u8>, u64)>>,
    outcome: Mutex<DispatchOutcome>,
    decisions: Arc<AtomicUsize>,
}

impl Default for RecordingDispatcher {
    fn default() -> Self {
        Self {
            processed: Mutex::new(Vec::new()),
            outcome: Mutex::new(DispatchOutcome::ShouldAck),
            decisions: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl RecordingDispatcher {
    pub fn processed(&self) -> Vec<(Vec<u8>, u64)> {
        self.processed.lock().unwrap().clone()
    }

    pub fn set_outcome(&self, outcome: DispatchOutcome) {
        *self.outcome.lock().unwrap() = outcome;
    }

    /// Wait until `n` ack decisions have been delivered.
    pub async fn wait_for_decisions(&self, n: usize) {
        while self.decisions.load(Ordering::SeqCst) < n {
            tokio::task::yield_now().await;
        }
    }
}

impl MessageDispatch for RecordingDispatcher {
    fn process(
        &self,
        envelope: Vec<u8>,
        delivery_timestamp: u64,
    ) -> BoxFuture<'static, DispatchOutcome> {
        self.processed
            .lock()
            .unwrap()
            .push((envelope, delivery_timestamp));
        let outcome = self.outcome.lock().unwrap().clone();
        let decisions = self.decisions.clone();
        async move {
            decisions.fetch_add(1, Ordering::SeqCst);
            outcome
        }
        .boxed()
    }
}

#[derive(Default)]
pub(crate) struct RecordingOutage {
    successes: AtomicUsize,
    failures: AtomicUsize,
}

impl RecordingOutage {
    pub fn successes(&self) -> usize {
        self.successes.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }
}

impl OutageReporter for RecordingOutage {
    fn report_connection_success(&self) {
        self.successes.fetch_add(1, Ordering::SeqCst);
    }

    fn report_connection_failure(&self) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub(crate) struct RecordingFatal {
    expired: AtomicUsize,
    deregistered: AtomicUsize,
}

impl RecordingFatal {
    pub fn expired(&self) -> usize {
        self.expired.load(Ordering::SeqCst)
    }

    pub fn deregistered(&self) -> usize {
        self.deregistered.load(Ordering::SeqCst)
    }
}

impl FatalStateSink for RecordingFatal {
    fn app_expired(&self) {
        self.expired.fetch_add(1, Ordering::SeqCst);
    }

    fn device_deregistered(&self) {
        self.deregistered.fetch_add(1, Ordering::SeqCst);
    }
}

// =============================================================================
// Chat service
// =============================================================================

pub(crate) struct NullListener;

impl ServiceListener for NullListener {
    fn incoming_message(&self, _envelope: Vec<u8>, _delivery_timestamp: u64, _ack: ServiceAck) {}
    fn queue_empty(&self) {}
    fn connection_interrupted(&self, _error: Option<ServiceError>) {}
}

/// Decrements the in-flight count when a connect or disconnect finishes.
struct OpGuard<'a>(&'a AtomicUsize);

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Scriptable [`ChatService`] that tracks lifecycle overlap.
pub(crate) struct MockChatService {
    this: Weak<MockChatService>,
    latency: Duration,
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    /// Most connect/disconnect operations ever running at once.
    pub max_overlap: AtomicUsize,
    pub acks: Arc<AtomicUsize>,
    active: AtomicUsize,
    connected: AtomicBool,
    connect_error: Mutex<Option<ServiceError>>,
    responses: Mutex<VecDeque<Result<ServiceResponse, ServiceError>>>,
    listener: Mutex<Option<Arc<dyn ServiceListener>>>,
    sent: Mutex<Vec<ChatRequest>>,
}

impl MockChatService {
    pub fn new() -> Arc<Self> {
        Self::with_latency(Duration::ZERO)
    }

    pub fn with_latency(latency: Duration) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            latency,
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            max_overlap: AtomicUsize::new(0),
            acks: Arc::new(AtomicUsize::new(0)),
            active: AtomicUsize::new(0),
            connected: AtomicBool::new(false),
            connect_error: Mutex::new(None),
            responses: Mutex::new(VecDeque::new()),
            listener: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
        })
    }

    fn this(&self) -> Arc<Self> {
        self.this.upgrade().expect("mock service dropped")
    }

    fn begin_op(&self) -> OpGuard<'_> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_overlap.fetch_max(now, Ordering::SeqCst);
        OpGuard(&self.active)
    }

    async fn pause(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn current_listener(&self) -> Option<Arc<dyn ServiceListener>> {
        self.listener.lock().unwrap().clone()
    }

    /// Every later connect fails with `error`.
    pub fn fail_connects(&self, error: ServiceError) {
        *self.connect_error.lock().unwrap() = Some(error);
    }

    /// Report an interruption the client did not ask for.
    pub fn drop_connection(&self, error: Option<ServiceError>) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(listener) = self.current_listener() {
            listener.connection_interrupted(error);
        }
    }

    /// Queue the result for the next `send`.
    pub fn respond_with(&self, result: Result<ServiceResponse, ServiceError>) {
        self.responses.lock().unwrap().push_back(result);
    }

    pub fn push_message(&self, envelope: &[u8], delivery_timestamp: u64) {
        let acks = self.acks.clone();
        if let Some(listener) = self.current_listener() {
            listener.incoming_message(
                envelope.to_vec(),
                delivery_timestamp,
                ServiceAck::new(move || {
                    acks.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
    }

    pub fn push_queue_empty(&self) {
        if let Some(listener) = self.current_listener() {
            listener.queue_empty();
        }
    }

    pub fn sent_paths(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.path.clone())
            .collect()
    }

    pub async fn wait_for_disconnects(&self, n: usize) {
        while self.disconnects.load(Ordering::SeqCst) < n {
            tokio::task::yield_now().await;
        }
    }
}

impl ChatService for MockChatService {
    fn connect(
        &self,
        _credentials: Option<crate::signals::Credentials>,
        listener: Arc<dyn ServiceListener>,
    ) -> BoxFuture<'static, Result<(), ServiceError>> {
        let this = self.this();
        async move {
            let _op = this.begin_op();
            this.connects.fetch_add(1, Ordering::SeqCst);
            this.pause().await;
            if let Some(error) = this.connect_error.lock().unwrap().clone() {
                return Err(error);
            }
            *this.listener.lock().unwrap() = Some(listener);
            this.connected.store(true, Ordering::SeqCst);
            Ok(())
        }
        .boxed()
    }

    fn disconnect(&self) -> BoxFuture<'static, ()> {
        let this = self.this();
        async move {
            let _op = this.begin_op();
            this.pause().await;
            if this.connected.swap(false, Ordering::SeqCst)
                && let Some(listener) = this.current_listener()
            {
                listener.connection_interrupted(None);
            }
            this.disconnects.fetch_add(1, Ordering::SeqCst);
        }
        .boxed()
    }

    fn send(
        &self,
        request: ChatRequest,
        _timeout: Duration,
    ) -> BoxFuture<'static, Result<ServiceResponse, ServiceError>> {
        self.sent.lock().unwrap().push(request);
        let queued = self.responses.lock().unwrap().pop_front();
        let connected = self.connected.load(Ordering::SeqCst);
        async move {
            match queued {
                Some(result) => result,
                None if connected => Ok(ServiceResponse {
                    status: 200,
                    headers: Headers::new(),
                    body: None,
                }),
                None => Err(ServiceError::ServiceInactive),
            }
        }
        .boxed()
    }
}

// =============================================================================
// Transport harness
// =============================================================================

/// A [`TransportContext`] whose events land in the harness.
pub(crate) struct Harness {
    pub ctx: TransportContext,
    pub dispatcher: Arc<RecordingDispatcher>,
    pub signals: Arc<ManualSignals>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl Harness {
    pub async fn next_event(&mut self) -> TransportEvent {
        self.events.recv().await.expect("event channel closed")
    }

    pub fn try_next_event(&mut self) -> Option<TransportEvent> {
        self.events.try_recv().ok()
    }
}

pub(crate) fn context(class: AuthClass) -> Harness {
    context_with(class, TransportConfig::default())
}

pub(crate) fn context_with(class: AuthClass, config: TransportConfig) -> Harness {
    let (events, rx) = mpsc::unbounded_channel();
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let signals = Arc::new(ManualSignals::ready());
    let ctx = TransportContext {
        class,
        config: Arc::new(config),
        signals: signals.clone(),
        credentials: Arc::new(StaticCredentials::new("alice.1", "hunter2")),
        dispatcher: dispatcher.clone(),
        events,
        metrics: Arc::new(TransportMetrics::new()),
    };
    Harness {
        ctx,
        dispatcher,
        signals,
        events: rx,
    }
}

// =============================================================================
// Connection environment
// =============================================================================

/// Everything needed to run connections against mocks.
pub(crate) struct TestEnv {
    pub config: TransportConfig,
    pub signals: Arc<ManualSignals>,
    pub credentials: Arc<StaticCredentials>,
    pub dispatcher: Arc<RecordingDispatcher>,
    pub connector: Arc<MockConnector>,
    pub outage: Arc<RecordingOutage>,
    pub fatal: Arc<RecordingFatal>,
    pub metrics: Arc<TransportMetrics>,
    service: Option<Arc<MockChatService>>,
}

impl TestEnv {
    /// A ready, registered, backgrounded main app.
    pub fn new() -> Self {
        Self {
            config: TransportConfig::default(),
            signals: Arc::new(ManualSignals::ready()),
            credentials: Arc::new(StaticCredentials::new("alice.1", "hunter2")),
            dispatcher: Arc::new(RecordingDispatcher::default()),
            connector: MockConnector::new(),
            outage: Arc::new(RecordingOutage::default()),
            fatal: Arc::new(RecordingFatal::default()),
            metrics: Arc::new(TransportMetrics::new()),
            service: None,
        }
    }

    pub fn with_service() -> Self {
        Self {
            service: Some(MockChatService::new()),
            ..Self::new()
        }
    }

    pub fn service(&self) -> &Arc<MockChatService> {
        self.service
            .as_ref()
            .expect("environment has no chat service")
    }

    fn services(&self) -> Option<ServiceClients> {
        self.service.as_ref().map(|service| ServiceClients {
            identified: service.clone(),
            unidentified: service.clone(),
        })
    }

    pub fn collaborators(&self) -> Collaborators {
        let collaborators = Collaborators::new(
            self.signals.clone(),
            self.credentials.clone(),
            self.dispatcher.clone(),
            self.connector.clone(),
        )
        .with_outage(self.outage.clone())
        .with_fatal(self.fatal.clone());
        match self.services() {
            Some(services) => collaborators.with_services(services),
            None => collaborators,
        }
    }

    pub fn spawn_connection(
        &self,
        class: AuthClass,
    ) -> (ConnectionHandle, broadcast::Receiver<ConnectionEvent>) {
        self.spawn_connection_in(class, TransportMode::Framed)
    }

    pub fn spawn_connection_in(
        &self,
        class: AuthClass,
        mode: TransportMode,
    ) -> (ConnectionHandle, broadcast::Receiver<ConnectionEvent>) {
        let mut config = self.config.clone();
        match class {
            AuthClass::Identified => config.identified_mode = mode,
            AuthClass::Unidentified => config.unidentified_mode = mode,
        }
        let (events, rx) = broadcast::channel(64);
        let service: Option<Arc<dyn ChatService>> = self
            .service
            .as_ref()
            .map(|service| service.clone() as Arc<dyn ChatService>);
        let (handle, _task) = state_machine::spawn(ConnectionDeps {
            class,
            config: Arc::new(config),
            signals: self.signals.clone(),
            credentials: self.credentials.clone(),
            dispatcher: self.dispatcher.clone(),
            outage: self.outage.clone(),
            fatal: self.fatal.clone(),
            metrics: self.metrics.clone(),
            parts: TransportParts {
                connector: self.connector.clone(),
                service,
                stats_store: Arc::new(MemoryStore::new()),
                notifier: Arc::new(LogNotifier),
            },
            events,
        });
        (handle, rx)
    }
}

/// The next state change, skipping other events.
pub(crate) async fn next_state(events: &mut broadcast::Receiver<ConnectionEvent>) -> ConnectionState {
    loop {
        if let ConnectionEvent::StateChanged { state, .. } =
            events.recv().await.expect("event channel closed")
        {
            return state;
        }
    }
}

pub(crate) async fn wait_for_state(
    events: &mut broadcast::Receiver<ConnectionEvent>,
    class: AuthClass,
    state: ConnectionState,
) {
    loop {
        if let ConnectionEvent::StateChanged { class: c, state: s } =
            events.recv().await.expect("event channel closed")
            && c == class
            && s == state
        {
            return;
        }
    }
}
