//! Transport over an externally-owned async chat-service client.
//!
//! The client's `connect` and `disconnect` must never overlap for the same
//! instance. [`ShadowClient`] serializes them by recording the single most
//! recent lifecycle operation (a [`TransitionTask`]) and chaining each new
//! operation after it. Registration happens synchronously under a lock, so
//! the order in which callers *begin* operations is the order they run in.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tracing::{debug, info, warn};

use crate::desired_state::KeepAliveTrigger;
use crate::dispatch::DispatchOutcome;
use crate::error::{ServiceError, TransportError};
use crate::request::{AuthClass, ChatRequest, ChatResponse, Headers};
use crate::request_info::Responder;
use crate::signals::{Credentials, CredentialsProvider};
use crate::transport::{ConnectionState, LinkChange, Transport, TransportContext, TransportEvent};

/// Raw response from the chat service, before status classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Option<Vec<u8>>,
}

/// Acknowledges one pushed message back through the service.
pub struct ServiceAck(Box<dyn FnOnce() + Send>);

impl ServiceAck {
    pub fn new(ack: impl FnOnce() + Send + 'static) -> Self {
        Self(Box::new(ack))
    }

    pub fn send(self) {
        (self.0)()
    }
}

impl fmt::Debug for ServiceAck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ServiceAck")
    }
}

/// Callbacks from the chat service while connected.
pub trait ServiceListener: Send + Sync + 'static {
    fn incoming_message(&self, envelope: Vec<u8>, delivery_timestamp: u64, ack: ServiceAck);
    fn queue_empty(&self);
    /// The connection dropped. Also called once for every `disconnect` of an
    /// established connection.
    fn connection_interrupted(&self, error: Option<ServiceError>);
}

/// An alternate chat-service client.
pub trait ChatService: Send + Sync + 'static {
    fn connect(
        &self,
        credentials: Option<Credentials>,
        listener: Arc<dyn ServiceListener>,
    ) -> BoxFuture<'static, Result<(), ServiceError>>;

    fn disconnect(&self) -> BoxFuture<'static, ()>;

    fn send(
        &self,
        request: ChatRequest,
        timeout: Duration,
    ) -> BoxFuture<'static, Result<ServiceResponse, ServiceError>>;
}

pub(crate) type ConnectAttempt = Shared<BoxFuture<'static, Result<(), ServiceError>>>;
pub(crate) type DisconnectAttempt = Shared<BoxFuture<'static, ()>>;

/// The single in-flight (or last finished) lifecycle operation.
enum TransitionTask {
    Connecting(ConnectAttempt),
    Disconnecting(DisconnectAttempt),
}

#[derive(Default)]
struct Lifecycle {
    transition: Option<TransitionTask>,
    /// Interruptions we caused ourselves by disconnecting.
    expected_interruptions: u32,
}

struct ShadowClientInner {
    label: &'static str,
    service: Arc<dyn ChatService>,
    credentials: Option<Arc<dyn CredentialsProvider>>,
    listener: Arc<dyn ServiceListener>,
    lifecycle: Mutex<Lifecycle>,
}

/// Lifecycle wrapper around a [`ChatService`].
#[derive(Clone)]
pub struct ShadowClient {
    inner: Arc<ShadowClientInner>,
}

impl ShadowClient {
    /// `credentials` is sampled at each connect; `None` connects unauthenticated.
    pub fn new(
        label: &'static str,
        service: Arc<dyn ChatService>,
        credentials: Option<Arc<dyn CredentialsProvider>>,
        listener: Arc<dyn ServiceListener>,
    ) -> Self {
        Self {
            inner: Arc::new(ShadowClientInner {
                label,
                service,
                credentials,
                listener,
                lifecycle: Mutex::new(Lifecycle::default()),
            }),
        }
    }

    fn lifecycle(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.inner
            .lifecycle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn expected_interruptions(&self) -> u32 {
        self.lifecycle().expected_interruptions
    }

    /// Whether the last connect attempt completed successfully.
    pub fn is_connected(&self) -> bool {
        matches!(
            &self.lifecycle().transition,
            Some(TransitionTask::Connecting(attempt)) if matches!(attempt.peek(), Some(Ok(())))
        )
    }

    /// Join the running or successful connect, or start a new one after any
    /// disconnect in progress.
    pub(crate) fn begin_connect(&self) -> ConnectAttempt {
        let mut lifecycle = self.lifecycle();
        let prior_disconnect = match &lifecycle.transition {
            Some(TransitionTask::Connecting(attempt)) => match attempt.peek() {
                None | Some(Ok(())) => return attempt.clone(),
                Some(Err(_)) => None,
            },
            Some(TransitionTask::Disconnecting(done)) => Some(done.clone()),
            None => None,
        };

        let service = self.inner.service.clone();
        let listener: Arc<dyn ServiceListener> = Arc::new(InterruptionFilter {
            client: Arc::downgrade(&self.inner),
        });
        let credentials = self
            .inner
            .credentials
            .as_ref()
            .and_then(|provider| provider.credentials());
        let label = self.inner.label;

        // Spawned so it progresses even if every waiter goes away.
        let task = tokio::spawn(async move {
            if let Some(done) = prior_disconnect {
                done.await;
            }
            debug!(client = label, "chat service connecting");
            service.connect(credentials, listener).await
        });
        let attempt = async move {
            task.await.unwrap_or_else(|e| {
                Err(ServiceError::ConnectionFailed(format!("connect task failed: {e}")))
            })
        }
        .boxed()
        .shared();

        lifecycle.transition = Some(TransitionTask::Connecting(attempt.clone()));
        attempt
    }

    /// Disconnect after the current connect attempt settles. A no-op unless a
    /// connect is in flight or completed.
    pub(crate) fn begin_disconnect(&self) -> DisconnectAttempt {
        let mut lifecycle = self.lifecycle();
        let attempt = match lifecycle.transition.take() {
            Some(TransitionTask::Connecting(attempt)) => attempt,
            Some(TransitionTask::Disconnecting(done)) => {
                lifecycle.transition = Some(TransitionTask::Disconnecting(done.clone()));
                return done;
            }
            None => return futures::future::ready(()).boxed().shared(),
        };
        lifecycle.expected_interruptions += 1;

        let service = self.inner.service.clone();
        let inner = Arc::downgrade(&self.inner);
        let label = self.inner.label;
        let task = tokio::spawn(async move {
            match attempt.await {
                Ok(()) => {
                    debug!(client = label, "chat service disconnecting");
                    service.disconnect().await;
                }
                Err(_) => {
                    // Nothing to interrupt, so the interruption never comes.
                    if let Some(inner) = inner.upgrade() {
                        let mut lifecycle =
                            inner.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
                        lifecycle.expected_interruptions =
                            lifecycle.expected_interruptions.saturating_sub(1);
                    }
                }
            }
        });
        let done = async move {
            let _ = task.await;
        }
        .boxed()
        .shared();

        lifecycle.transition = Some(TransitionTask::Disconnecting(done.clone()));
        done
    }

    pub async fn ensure_connected(&self) -> Result<(), ServiceError> {
        self.begin_connect().await
    }

    pub async fn disconnect(&self) {
        self.begin_disconnect().await
    }

    pub fn send(
        &self,
        request: ChatRequest,
        timeout: Duration,
    ) -> BoxFuture<'static, Result<ServiceResponse, ServiceError>> {
        self.inner.service.send(request, timeout)
    }
}

/// Sits between the service and the real listener, absorbing the
/// interruptions our own disconnects cause.
struct InterruptionFilter {
    client: std::sync::Weak<ShadowClientInner>,
}

impl ServiceListener for InterruptionFilter {
    fn incoming_message(&self, envelope: Vec<u8>, delivery_timestamp: u64, ack: ServiceAck) {
        if let Some(client) = self.client.upgrade() {
            client
                .listener
                .incoming_message(envelope, delivery_timestamp, ack);
        }
    }

    fn queue_empty(&self) {
        if let Some(client) = self.client.upgrade() {
            client.listener.queue_empty();
        }
    }

    fn connection_interrupted(&self, error: Option<ServiceError>) {
        let Some(client) = self.client.upgrade() else {
            return;
        };
        let expected = {
            let mut lifecycle = client.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
            if lifecycle.expected_interruptions > 0 {
                lifecycle.expected_interruptions -= 1;
                true
            } else {
                // Forget the dead connection so the next connect starts fresh.
                if let Some(TransitionTask::Connecting(attempt)) = &lifecycle.transition
                    && matches!(attempt.peek(), Some(Ok(())))
                {
                    lifecycle.transition = None;
                }
                false
            }
        };

        if expected {
            debug!(client = client.label, "expected chat service interruption");
        } else {
            warn!(client = client.label, error = ?error, "chat service connection interrupted");
            client.listener.connection_interrupted(error);
        }
    }
}

/// Forwards service callbacks into the owning connection's actor.
struct ForwardingListener {
    ctx: TransportContext,
}

impl ServiceListener for ForwardingListener {
    fn incoming_message(&self, envelope: Vec<u8>, delivery_timestamp: u64, ack: ServiceAck) {
        self.ctx.post(TransportEvent::ServiceMessage {
            envelope,
            delivery_timestamp,
            ack,
        });
    }

    fn queue_empty(&self) {
        self.ctx.post(TransportEvent::ServiceQueueEmpty);
    }

    fn connection_interrupted(&self, error: Option<ServiceError>) {
        self.ctx.post(TransportEvent::ServiceInterrupted { error });
    }
}

/// [`Transport`] that uses a [`ChatService`] as the sole transport.
pub(crate) struct ServiceTransport {
    ctx: TransportContext,
    client: ShadowClient,
    state: ConnectionState,
    epoch: u64,
    in_flight: usize,
}

impl ServiceTransport {
    pub(crate) fn new(ctx: TransportContext, service: Arc<dyn ChatService>) -> Self {
        let listener = Arc::new(ForwardingListener { ctx: ctx.clone() });
        let credentials = match ctx.class {
            AuthClass::Identified => Some(ctx.credentials.clone()),
            AuthClass::Unidentified => None,
        };
        let label = match ctx.class {
            AuthClass::Identified => "identified",
            AuthClass::Unidentified => "unidentified",
        };
        Self {
            client: ShadowClient::new(label, service, credentials, listener),
            ctx,
            state: ConnectionState::Closed,
            epoch: 0,
            in_flight: 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn client(&self) -> &ShadowClient {
        &self.client
    }
}

/// Ask the dispatcher about a service push; ack through the service if told to.
pub(crate) fn dispatch_service_message(
    ctx: &TransportContext,
    envelope: Vec<u8>,
    delivery_timestamp: u64,
    ack: ServiceAck,
) {
    ctx.metrics.push_received();
    let decision = ctx.dispatcher.process(envelope, delivery_timestamp);
    let metrics = ctx.metrics.clone();
    let class = ctx.class;
    tokio::spawn(async move {
        match decision.await {
            DispatchOutcome::ShouldAck => {
                ack.send();
                metrics.ack_sent();
            }
            DispatchOutcome::ShouldNotAck(reason) => {
                info!(%class, %reason, "not acknowledging pushed message");
            }
        }
    });
}

impl Transport for ServiceTransport {
    fn state(&self) -> ConnectionState {
        self.state
    }

    fn connect(&mut self) {
        if self.state != ConnectionState::Closed {
            return;
        }
        self.epoch += 1;
        let epoch = self.epoch;
        let attempt = self.client.begin_connect();
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            match attempt.await {
                Ok(()) => ctx.post(TransportEvent::ServiceConnected { epoch }),
                Err(error) => ctx.post(TransportEvent::ServiceConnectFailed { epoch, error }),
            }
        });
        self.ctx.metrics.connect_attempt();
        self.state = ConnectionState::Connecting;
    }

    fn disconnect(&mut self, reason: &str) {
        if self.state == ConnectionState::Closed {
            return;
        }
        info!(class = %self.ctx.class, %reason, "disconnecting chat service");
        // Runs detached; later connects chain after it.
        drop(self.client.begin_disconnect());
        self.state = ConnectionState::Closed;
    }

    fn send(&mut self, request: ChatRequest, responder: Responder) {
        if self.state != ConnectionState::Open {
            let _ = responder.send(Err(TransportError::network("chat service not connected")));
            return;
        }
        self.in_flight += 1;
        self.ctx.metrics.request_sent();
        let response = self.client.send(request, self.ctx.config.request_timeout);
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            let result = response.await;
            let outcome = result.as_ref().map(|_| ()).map_err(|e| e.clone());
            let delivered = match result {
                Ok(raw) => ChatResponse::from_status(raw.status, raw.headers, raw.body),
                // Process-wide conditions are escalated, never handed to the caller.
                Err(e) if e.is_fatal() => Err(TransportError::network(e.to_string())),
                Err(e) => Err(e.into()),
            };
            let _ = responder.send(delivered);
            ctx.post(TransportEvent::ServiceRequestFinished { result: outcome });
        });
    }

    fn has_pending_requests(&self) -> bool {
        self.in_flight > 0
    }

    fn handle_event(&mut self, event: TransportEvent) -> Option<LinkChange> {
        match event {
            TransportEvent::ServiceConnected { epoch } => {
                if epoch == self.epoch && self.state == ConnectionState::Connecting {
                    info!(class = %self.ctx.class, epoch, "chat service connected");
                    self.ctx.metrics.connection_opened();
                    self.state = ConnectionState::Open;
                }
                None
            }
            TransportEvent::ServiceConnectFailed { epoch, error } => {
                if epoch != self.epoch || self.state != ConnectionState::Connecting {
                    return None;
                }
                self.state = ConnectionState::Closed;
                if error.is_fatal() {
                    Some(LinkChange::Fatal(error))
                } else {
                    Some(LinkChange::Failed(error.to_string()))
                }
            }
            TransportEvent::ServiceInterrupted { error } => {
                if self.state == ConnectionState::Closed {
                    return None;
                }
                self.state = ConnectionState::Closed;
                match error {
                    Some(error) if error.is_fatal() => Some(LinkChange::Fatal(error)),
                    Some(error) => Some(LinkChange::Failed(error.to_string())),
                    None => Some(LinkChange::Failed("chat service interrupted".to_string())),
                }
            }
            TransportEvent::ServiceMessage {
                envelope,
                delivery_timestamp,
                ack,
            } => {
                dispatch_service_message(&self.ctx, envelope, delivery_timestamp, ack);
                Some(LinkChange::KeepAlive(KeepAliveTrigger::ReceivedMessage))
            }
            TransportEvent::ServiceQueueEmpty => Some(LinkChange::QueueEmptied),
            TransportEvent::ServiceRequestFinished { result } => {
                self.in_flight = self.in_flight.saturating_sub(1);
                match result {
                    Ok(()) => Some(LinkChange::KeepAlive(KeepAliveTrigger::ReceivedResponse)),
                    Err(error) if error.is_fatal() => {
                        self.disconnect("fatal chat service error");
                        Some(LinkChange::Fatal(error))
                    }
                    Err(_) => None,
                }
            }
            other => {
                debug!(class = %self.ctx.class, event = ?other, "ignoring event");
                None
            }
        }
    }

    fn uses_heartbeat(&self) -> bool {
        false
    }
}
