//! Physical transports behind a logical connection.
//!
//! A [`Transport`] is driven entirely from its connection's actor task: every
//! method is synchronous and anything slow runs on spawned tasks that report
//! back as [`TransportEvent`]s on the context's event channel. Events carry
//! the epoch of the attempt that produced them so stale ones can be ignored.

pub mod frame;
pub mod multiplexer;
pub mod service;
pub mod shadowed;
pub mod socket;
pub mod stats;

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;

use crate::config::{TransportConfig, TransportMode};
use crate::desired_state::KeepAliveTrigger;
use crate::dispatch::MessageDispatch;
use crate::error::ServiceError;
use crate::metrics::TransportMetrics;
use crate::request::{AuthClass, ChatRequest};
use crate::request_info::Responder;
use crate::signals::{CredentialsProvider, SignalProvider};

use self::frame::WireMessage;
use self::multiplexer::FramedTransport;
use self::service::{ChatService, ServiceAck, ServiceTransport};
use self::shadowed::ShadowedTransport;
use self::socket::{ConnectRequest, Connector, FramedSocket};
use self::stats::{KeyValueStore, ShadowingNotifier};

/// Observable state of a logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Closed => write!(f, "closed"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Open => write!(f, "open"),
        }
    }
}

/// Reports from transport tasks back to the owning actor.
pub(crate) enum TransportEvent {
    SocketOpened { epoch: u64, socket: FramedSocket },
    SocketConnectFailed { epoch: u64, reason: String },
    FrameReceived { epoch: u64, frame: WireMessage },
    SocketClosed { epoch: u64, reason: String },
    RequestTimedOut { epoch: u64, id: u64 },
    ServiceConnected { epoch: u64 },
    ServiceConnectFailed { epoch: u64, error: ServiceError },
    ServiceInterrupted { error: Option<ServiceError> },
    ServiceMessage { envelope: Vec<u8>, delivery_timestamp: u64, ack: ServiceAck },
    ServiceQueueEmpty,
    ServiceRequestFinished { result: Result<(), ServiceError> },
    /// The shadow service connection dropped or failed to come up.
    ShadowLost { error: Option<ServiceError> },
    ShadowRetry,
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SocketOpened { epoch, .. } => write!(f, "SocketOpened({epoch})"),
            Self::SocketConnectFailed { epoch, reason } => {
                write!(f, "SocketConnectFailed({epoch}, {reason})")
            }
            Self::FrameReceived { epoch, .. } => write!(f, "FrameReceived({epoch})"),
            Self::SocketClosed { epoch, reason } => write!(f, "SocketClosed({epoch}, {reason})"),
            Self::RequestTimedOut { epoch, id } => write!(f, "RequestTimedOut({epoch}, {id})"),
            Self::ServiceConnected { epoch } => write!(f, "ServiceConnected({epoch})"),
            Self::ServiceConnectFailed { epoch, error } => {
                write!(f, "ServiceConnectFailed({epoch}, {error})")
            }
            Self::ServiceInterrupted { error } => write!(f, "ServiceInterrupted({error:?})"),
            Self::ServiceMessage { .. } => write!(f, "ServiceMessage"),
            Self::ServiceQueueEmpty => write!(f, "ServiceQueueEmpty"),
            Self::ServiceRequestFinished { result } => {
                write!(f, "ServiceRequestFinished({result:?})")
            }
            Self::ShadowLost { error } => write!(f, "ShadowLost({error:?})"),
            Self::ShadowRetry => write!(f, "ShadowRetry"),
        }
    }
}

/// What a transport event means for the logical connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LinkChange {
    /// The physical connection failed or dropped; the transport is closed.
    Failed(String),
    /// The connection is presumed dead and should be torn down and reopened.
    Cycle(String),
    QueueEmptied,
    KeepAlive(KeepAliveTrigger),
    /// A process-wide condition; the transport is closed.
    Fatal(ServiceError),
}

/// Shared plumbing handed to each transport.
#[derive(Clone)]
pub(crate) struct TransportContext {
    pub class: AuthClass,
    pub config: Arc<TransportConfig>,
    pub signals: Arc<dyn SignalProvider>,
    pub credentials: Arc<dyn CredentialsProvider>,
    pub dispatcher: Arc<dyn MessageDispatch>,
    pub events: mpsc::UnboundedSender<TransportEvent>,
    pub metrics: Arc<TransportMetrics>,
}

impl TransportContext {
    pub fn connect_request(&self) -> ConnectRequest {
        ConnectRequest {
            class: self.class,
            credentials: match self.class {
                AuthClass::Identified => self.credentials.credentials(),
                AuthClass::Unidentified => None,
            },
            receive_stories: self.signals.stories_enabled(),
        }
    }

    /// Post an event to the actor. Fails silently once the actor is gone.
    pub fn post(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}

/// The capability every transport variant provides to its connection.
pub(crate) trait Transport {
    fn state(&self) -> ConnectionState;

    /// Start connecting unless already connecting or open.
    fn connect(&mut self);

    /// Tear down, failing all pending requests.
    fn disconnect(&mut self, reason: &str);

    /// Send over the open connection. Callers check [`Transport::state`] first.
    fn send(&mut self, request: ChatRequest, responder: Responder);

    fn has_pending_requests(&self) -> bool;

    fn handle_event(&mut self, event: TransportEvent) -> Option<LinkChange>;

    fn uses_heartbeat(&self) -> bool;

    /// Send a keepalive. `Err` means the previous one was never answered.
    fn heartbeat(&mut self) -> Result<(), String> {
        Ok(())
    }
}

/// External pieces needed to build the configured transport.
#[derive(Clone)]
pub(crate) struct TransportParts {
    pub connector: Arc<dyn Connector>,
    pub service: Option<Arc<dyn ChatService>>,
    pub stats_store: Arc<dyn KeyValueStore>,
    pub notifier: Arc<dyn ShadowingNotifier>,
}

pub(crate) enum ChatTransport {
    Framed(FramedTransport),
    Service(ServiceTransport),
    Shadowed(ShadowedTransport),
}

impl ChatTransport {
    pub fn build(mode: TransportMode, ctx: TransportContext, parts: &TransportParts) -> Self {
        let service = match (mode, &parts.service) {
            (TransportMode::Framed, _) => None,
            (_, Some(service)) => Some(service.clone()),
            (_, None) => {
                warn!(
                    class = %ctx.class,
                    ?mode,
                    "no chat service client supplied, falling back to framed transport"
                );
                None
            }
        };

        match (mode, service) {
            (TransportMode::Service, Some(service)) => {
                ChatTransport::Service(ServiceTransport::new(ctx, service))
            }
            (TransportMode::Shadowed, Some(service)) => ChatTransport::Shadowed(
                ShadowedTransport::new(ctx, parts.connector.clone(), service, parts),
            ),
            _ => ChatTransport::Framed(FramedTransport::new(ctx, parts.connector.clone())),
        }
    }

    fn inner(&self) -> &dyn Transport {
        match self {
            ChatTransport::Framed(t) => t,
            ChatTransport::Service(t) => t,
            ChatTransport::Shadowed(t) => t,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn Transport {
        match self {
            ChatTransport::Framed(t) => t,
            ChatTransport::Service(t) => t,
            ChatTransport::Shadowed(t) => t,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ChatTransport::Framed(_) => "framed",
            ChatTransport::Service(_) => "service",
            ChatTransport::Shadowed(_) => "shadowed",
        }
    }
}

impl Transport for ChatTransport {
    fn state(&self) -> ConnectionState {
        self.inner().state()
    }

    fn connect(&mut self) {
        self.inner_mut().connect()
    }

    fn disconnect(&mut self, reason: &str) {
        self.inner_mut().disconnect(reason)
    }

    fn send(&mut self, request: ChatRequest, responder: Responder) {
        self.inner_mut().send(request, responder)
    }

    fn has_pending_requests(&self) -> bool {
        self.inner().has_pending_requests()
    }

    fn handle_event(&mut self, event: TransportEvent) -> Option<LinkChange> {
        self.inner_mut().handle_event(event)
    }

    fn uses_heartbeat(&self) -> bool {
        self.inner().uses_heartbeat()
    }

    fn heartbeat(&mut self) -> Result<(), String> {
        self.inner_mut().heartbeat()
    }
}
