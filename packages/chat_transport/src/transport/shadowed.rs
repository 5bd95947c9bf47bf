//! Framed transport that also keeps a chat-service connection alive and
//! mirrors a sample of keepalive probes onto it.
//!
//! The framed socket is always authoritative. Shadow probes run after the
//! primary response has been handed back, and their outcomes only feed the
//! comparison stats.

use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{ServiceError, TransportError};
use crate::request::{AuthClass, ChatRequest, RequestAuth};
use crate::request_info::Responder;
use crate::transport::frame::KEEPALIVE_PATH;
use crate::transport::multiplexer::FramedTransport;
use crate::transport::service::{ChatService, ServiceAck, ServiceListener, ShadowClient};
use crate::transport::socket::Connector;
use crate::transport::stats::{ShadowOutcome, StatsRecorder, stats_key};
use crate::transport::{
    ConnectionState, LinkChange, Transport, TransportContext, TransportEvent, TransportParts,
};

/// Listener for the shadow connection. Pushes belong to the primary, so
/// anything arriving here is dropped without an ack. Interruptions go back to
/// the owning actor so the shadow can be reopened.
struct ShadowListener {
    ctx: TransportContext,
}

impl ServiceListener for ShadowListener {
    fn incoming_message(&self, _envelope: Vec<u8>, _delivery_timestamp: u64, _ack: ServiceAck) {
        debug!(class = %self.ctx.class, "ignoring message on shadow connection");
    }

    fn queue_empty(&self) {}

    fn connection_interrupted(&self, error: Option<ServiceError>) {
        debug!(class = %self.ctx.class, ?error, "shadow connection interrupted");
        self.ctx.post(TransportEvent::ShadowLost { error });
    }
}

pub(crate) struct ShadowedTransport {
    ctx: TransportContext,
    primary: FramedTransport,
    shadow: ShadowClient,
    recorder: StatsRecorder,
    shadow_active: bool,
}

impl ShadowedTransport {
    pub(crate) fn new(
        ctx: TransportContext,
        connector: Arc<dyn Connector>,
        service: Arc<dyn ChatService>,
        parts: &TransportParts,
    ) -> Self {
        let credentials = match ctx.class {
            AuthClass::Identified => Some(ctx.credentials.clone()),
            AuthClass::Unidentified => None,
        };
        let shadow = ShadowClient::new(
            "shadow",
            service,
            credentials,
            Arc::new(ShadowListener { ctx: ctx.clone() }),
        );
        let recorder = StatsRecorder::spawn(
            stats_key(ctx.class),
            parts.stats_store.clone(),
            parts.notifier.clone(),
        );
        Self {
            primary: FramedTransport::new(ctx.clone(), connector),
            ctx,
            shadow,
            recorder,
            shadow_active: false,
        }
    }

    /// Follow the primary: connect the shadow once it opens, drop it once
    /// it closes.
    fn sync_shadow(&mut self) {
        match (self.primary.state(), self.shadow_active) {
            (ConnectionState::Open, false) => {
                self.shadow_active = true;
                let attempt = self.shadow.begin_connect();
                let ctx = self.ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = attempt.await {
                        warn!(class = %ctx.class, "shadow connect failed: {e}");
                        ctx.post(TransportEvent::ShadowLost { error: Some(e) });
                    }
                });
            }
            (ConnectionState::Closed, true) => {
                self.shadow_active = false;
                drop(self.shadow.begin_disconnect());
            }
            _ => {}
        }
    }

    /// The shadow went away without being asked to. Reopen it after the
    /// reconnect interval if the primary is still up by then.
    fn shadow_lost(&mut self, error: Option<ServiceError>) {
        if !self.shadow_active {
            return;
        }
        debug!(class = %self.ctx.class, ?error, "scheduling shadow reconnect");
        self.shadow_active = false;
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(ctx.config.reconnect_interval).await;
            ctx.post(TransportEvent::ShadowRetry);
        });
    }

    fn probe_auth(&self) -> RequestAuth {
        match self.ctx.class {
            AuthClass::Identified => RequestAuth::Identified,
            AuthClass::Unidentified => RequestAuth::Anonymous,
        }
    }

    #[cfg(test)]
    pub(crate) fn recorder(&self) -> &StatsRecorder {
        &self.recorder
    }

    #[cfg(test)]
    pub(crate) fn shadow(&self) -> &ShadowClient {
        &self.shadow
    }
}

fn should_shadow(frequency: f64) -> bool {
    frequency >= 1.0 || (frequency > 0.0 && rand::random::<f64>() < frequency)
}

impl Transport for ShadowedTransport {
    fn state(&self) -> ConnectionState {
        self.primary.state()
    }

    fn connect(&mut self) {
        self.primary.connect();
    }

    fn disconnect(&mut self, reason: &str) {
        self.primary.disconnect(reason);
        self.sync_shadow();
    }

    fn send(&mut self, request: ChatRequest, responder: Responder) {
        let (tx, rx) = oneshot::channel();
        self.primary.send(request, tx);

        let shadow = self.shadow.clone();
        let recorder = self.recorder.clone();
        let signals = self.ctx.signals.clone();
        let metrics = self.ctx.metrics.clone();
        let shadowing = self.ctx.config.shadowing.clone();
        let probe = ChatRequest::get(KEEPALIVE_PATH, self.probe_auth());
        tokio::spawn(async move {
            let result = rx
                .await
                .unwrap_or_else(|_| Err(TransportError::network("request abandoned")));
            let succeeded = result.is_ok();
            let _ = responder.send(result);

            if succeeded && signals.is_app_ready() && should_shadow(shadowing.frequency) {
                metrics.shadow_probe();
                let outcome = shadow.send(probe, shadowing.request_timeout).await;
                recorder.record(ShadowOutcome::from_result(&outcome));
            }
        });
    }

    fn has_pending_requests(&self) -> bool {
        self.primary.has_pending_requests()
    }

    fn handle_event(&mut self, event: TransportEvent) -> Option<LinkChange> {
        match event {
            TransportEvent::ShadowLost { error } => {
                self.shadow_lost(error);
                None
            }
            TransportEvent::ShadowRetry => {
                self.sync_shadow();
                None
            }
            event => {
                let change = self.primary.handle_event(event);
                self.sync_shadow();
                change
            }
        }
    }

    fn uses_heartbeat(&self) -> bool {
        true
    }

    fn heartbeat(&mut self) -> Result<(), String> {
        self.primary.heartbeat()
    }
}
