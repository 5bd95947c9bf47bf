//! Boundary to the component that decrypts and processes pushed envelopes.

use futures::future::BoxFuture;

/// Whether a pushed message may be acknowledged to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    ShouldAck,
    /// The server keeps the message and redelivers it later.
    ShouldNotAck(String),
}

/// Consumer of pushed message envelopes.
///
/// `process` is called on the connection's serial context in frame order.
/// Implementations must enqueue the envelope before returning the future;
/// the future then only reports the ack decision. Queue-empty handling relies
/// on this to be sequenced after every preceding message.
pub trait MessageDispatch: Send + Sync + 'static {
    fn process(&self, envelope: Vec<u8>, delivery_timestamp: u64)
    -> BoxFuture<'static, DispatchOutcome>;
}
