//! Persistent, multiplexed chat connections.
//!
//! A [`ConnectionManager`] keeps two logical connections to a chat server:
//! an *identified* one authenticated as the account, and an *unidentified*
//! one for anonymous and sealed-sender traffic. Each is driven by its own
//! actor that continually compares the socket's actual state with the state
//! the app's lifecycle signals say it should be in, and connects or
//! disconnects to match.
//!
//! Many requests share one socket. Responses are matched by id, and server
//! pushes are handed to a [`MessageDispatch`] that decides whether each may
//! be acknowledged.
//!
//! ```ignore
//! let manager = ConnectionManager::start(
//!     TransportConfig::default(),
//!     Collaborators::new(signals, credentials, dispatcher, connector),
//! );
//! let response = manager
//!     .make_request(ChatRequest::get("/v1/config", RequestAuth::Identified))
//!     .await?;
//! ```

pub mod config;
pub mod desired_state;
pub mod dispatch;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod request;
pub(crate) mod request_info;
pub mod signals;
pub mod state_machine;
pub mod transport;

#[cfg(test)]
mod e2e_tests;
#[cfg(test)]
pub(crate) mod test_helpers;

pub use config::{ChatFileConfig, TransportConfig, TransportMode, load_config};
pub use desired_state::{CloseReason, DesiredState, KeepAliveTrigger, OpenReason};
pub use dispatch::{DispatchOutcome, MessageDispatch};
pub use error::{ServiceError, TransportError};
pub use manager::{Collaborators, ConnectionManager, LoggingHooks, ServiceClients};
pub use metrics::MetricsSnapshot;
pub use request::{AuthClass, ChatRequest, ChatResponse, Headers, RequestAuth};
pub use signals::{
    BackgroundActivity, Credentials, CredentialsProvider, FatalStateSink, ManualSignals,
    OutageReporter, SignalEvent, SignalProvider, StaticCredentials,
};
pub use state_machine::{ConnectionEvent, ConnectionHandle, ConnectionToken};
pub use transport::ConnectionState;
pub use transport::service::{ChatService, ServiceAck, ServiceListener, ServiceResponse};
pub use transport::socket::{ConnectRequest, Connector, FramedSocket, WebSocketConnector};
pub use transport::stats::{ComparisonStats, KeyValueStore, MemoryStore, ShadowingNotifier};
