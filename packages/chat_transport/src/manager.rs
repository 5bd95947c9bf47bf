//! Owns the identified and unidentified connections and routes requests to
//! the right one.

use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::TransportConfig;
use crate::dispatch::MessageDispatch;
use crate::error::TransportError;
use crate::metrics::{MetricsSnapshot, TransportMetrics};
use crate::request::{AuthClass, ChatRequest, ChatResponse};
use crate::signals::{CredentialsProvider, FatalStateSink, OutageReporter, SignalProvider};
use crate::state_machine::{self, ConnectionDeps, ConnectionEvent, ConnectionHandle, ConnectionToken};
use crate::transport::ConnectionState;
use crate::transport::TransportParts;
use crate::transport::service::ChatService;
use crate::transport::socket::Connector;
use crate::transport::stats::{KeyValueStore, LogNotifier, MemoryStore, ShadowingNotifier};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Alternate chat-service clients, one per connection class.
#[derive(Clone)]
pub struct ServiceClients {
    pub identified: Arc<dyn ChatService>,
    pub unidentified: Arc<dyn ChatService>,
}

/// Logs outage and fatal-state reports. Used when the embedder supplies none.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHooks;

impl OutageReporter for LoggingHooks {
    fn report_connection_success(&self) {
        debug!("chat connection succeeded");
    }

    fn report_connection_failure(&self) {
        debug!("chat connection failed");
    }
}

impl FatalStateSink for LoggingHooks {
    fn app_expired(&self) {
        error!("chat service reports the app has expired");
    }

    fn device_deregistered(&self) {
        error!("chat service reports this device is deregistered");
    }
}

/// Everything the manager needs from the embedding application.
#[derive(Clone)]
pub struct Collaborators {
    pub signals: Arc<dyn SignalProvider>,
    pub credentials: Arc<dyn CredentialsProvider>,
    pub dispatcher: Arc<dyn MessageDispatch>,
    pub connector: Arc<dyn Connector>,
    pub outage: Arc<dyn OutageReporter>,
    pub fatal: Arc<dyn FatalStateSink>,
    pub services: Option<ServiceClients>,
    pub stats_store: Arc<dyn KeyValueStore>,
    pub shadow_notifier: Arc<dyn ShadowingNotifier>,
}

impl Collaborators {
    pub fn new(
        signals: Arc<dyn SignalProvider>,
        credentials: Arc<dyn CredentialsProvider>,
        dispatcher: Arc<dyn MessageDispatch>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            signals,
            credentials,
            dispatcher,
            connector,
            outage: Arc::new(LoggingHooks),
            fatal: Arc::new(LoggingHooks),
            services: None,
            stats_store: Arc::new(MemoryStore::new()),
            shadow_notifier: Arc::new(LogNotifier),
        }
    }

    pub fn with_outage(mut self, outage: Arc<dyn OutageReporter>) -> Self {
        self.outage = outage;
        self
    }

    pub fn with_fatal(mut self, fatal: Arc<dyn FatalStateSink>) -> Self {
        self.fatal = fatal;
        self
    }

    pub fn with_services(mut self, services: ServiceClients) -> Self {
        self.services = Some(services);
        self
    }

    pub fn with_stats_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.stats_store = store;
        self
    }

    pub fn with_shadow_notifier(mut self, notifier: Arc<dyn ShadowingNotifier>) -> Self {
        self.shadow_notifier = notifier;
        self
    }

    fn parts_for(&self, class: AuthClass) -> TransportParts {
        TransportParts {
            connector: self.connector.clone(),
            service: self.services.as_ref().map(|clients| match class {
                AuthClass::Identified => clients.identified.clone(),
                AuthClass::Unidentified => clients.unidentified.clone(),
            }),
            stats_store: self.stats_store.clone(),
            notifier: self.shadow_notifier.clone(),
        }
    }
}

/// The two persistent chat connections.
pub struct ConnectionManager {
    identified: ConnectionHandle,
    unidentified: ConnectionHandle,
    events: broadcast::Sender<ConnectionEvent>,
    metrics: Arc<TransportMetrics>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Spawn both connection actors. Must be called within a tokio runtime.
    pub fn start(config: TransportConfig, collaborators: Collaborators) -> Self {
        let config = Arc::new(config);
        let metrics = Arc::new(TransportMetrics::new());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let spawn = |class: AuthClass| {
            state_machine::spawn(ConnectionDeps {
                class,
                config: config.clone(),
                signals: collaborators.signals.clone(),
                credentials: collaborators.credentials.clone(),
                dispatcher: collaborators.dispatcher.clone(),
                outage: collaborators.outage.clone(),
                fatal: collaborators.fatal.clone(),
                metrics: metrics.clone(),
                parts: collaborators.parts_for(class),
                events: events.clone(),
            })
        };
        let (identified, identified_task) = spawn(AuthClass::Identified);
        let (unidentified, unidentified_task) = spawn(AuthClass::Unidentified);

        info!(url = %config.chat_url, "connection manager started");
        Self {
            identified,
            unidentified,
            events,
            metrics,
            tasks: Mutex::new(vec![identified_task, unidentified_task]),
        }
    }

    fn connection(&self, class: AuthClass) -> &ConnectionHandle {
        match class {
            AuthClass::Identified => &self.identified,
            AuthClass::Unidentified => &self.unidentified,
        }
    }

    /// Send `request` over the connection its auth requires, opening it if
    /// needed.
    pub async fn make_request(&self, request: ChatRequest) -> Result<ChatResponse, TransportError> {
        let class = request.auth_class()?;
        let connection = self.connection(class);
        // Held until the request resolves, whichever way it goes.
        let _token = connection.request_connection();
        connection.make_request(request).await
    }

    /// One keep-open token per connection.
    pub fn request_connections(&self) -> Vec<ConnectionToken> {
        AuthClass::ALL
            .iter()
            .map(|class| self.connection(*class).request_connection())
            .collect()
    }

    pub fn did_receive_push(&self) {
        for class in AuthClass::ALL {
            self.connection(class).did_receive_push();
        }
    }

    pub async fn wait_for_open(&self, class: AuthClass) -> Result<(), TransportError> {
        self.connection(class).wait_for_open().await
    }

    pub fn identified_connection_state(&self) -> ConnectionState {
        self.identified.state()
    }

    pub fn has_emptied_initial_queue(&self) -> bool {
        self.identified.has_emptied_initial_queue()
    }

    pub fn connection_state(&self, class: AuthClass) -> ConnectionState {
        self.connection(class).state()
    }

    /// Events from both connections.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Stop both connections, failing outstanding work, and wait for them.
    pub async fn shutdown(&self) {
        self.identified.shutdown();
        self.unidentified.shutdown();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            if let Err(e) = task.await {
                warn!("connection task ended abnormally: {e}");
            }
        }
        info!("connection manager stopped");
    }
}
