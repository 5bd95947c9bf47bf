//! Framed socket transport: many concurrent requests and server pushes over
//! one physical socket.
//!
//! The reader and writer tasks only shuttle frames; everything that touches
//! the pending-request table happens on the owning actor through
//! [`FramedMultiplexer::handle_frame`] and friends.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

use crate::desired_state::KeepAliveTrigger;
use crate::dispatch::DispatchOutcome;
use crate::error::TransportError;
use crate::request::{ChatRequest, ChatResponse};
use crate::request_info::{PendingRequests, RequestInfo, Responder};
use crate::transport::frame::{
    DELIVERY_TIMESTAMP_HEADER, KEEPALIVE_PATH, MESSAGE_PATH, QUEUE_EMPTY_PATH, RequestFrame,
    ResponseFrame, WireMessage,
};
use crate::transport::socket::{Connector, FramedSocket};
use crate::transport::{ConnectionState, LinkChange, Transport, TransportContext, TransportEvent};

/// How long a closing writer waits for the close handshake.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// One live socket and its outstanding requests.
pub(crate) struct FramedMultiplexer {
    epoch: u64,
    ctx: TransportContext,
    outbound: mpsc::UnboundedSender<WireMessage>,
    pending: PendingRequests,
    outstanding_ping: Option<u64>,
    _tasks: DropGuard,
}

impl FramedMultiplexer {
    pub(crate) fn start(epoch: u64, socket: FramedSocket, ctx: TransportContext) -> Self {
        let cancel = CancellationToken::new();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<WireMessage>();
        let FramedSocket {
            mut sink,
            mut stream,
        } = socket;

        let writer_ctx = ctx.clone();
        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    message = outbound_rx.recv() => {
                        let Some(message) = message else { break };
                        if let Err(e) = sink.send(message).await {
                            writer_ctx.post(TransportEvent::SocketClosed {
                                epoch,
                                reason: format!("write failed: {e}"),
                            });
                            return;
                        }
                    }
                }
            }
            let _ = tokio::time::timeout(CLOSE_GRACE, sink.close()).await;
        });

        let reader_ctx = ctx.clone();
        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            let reason = loop {
                tokio::select! {
                    _ = reader_cancel.cancelled() => return,
                    item = stream.next() => match item {
                        Some(Ok(frame)) => reader_ctx.post(TransportEvent::FrameReceived { epoch, frame }),
                        Some(Err(e)) => break e.to_string(),
                        None => break "stream ended".to_string(),
                    },
                }
            };
            reader_ctx.post(TransportEvent::SocketClosed { epoch, reason });
        });

        Self {
            epoch,
            ctx,
            outbound,
            pending: PendingRequests::new(),
            outstanding_ping: None,
            _tasks: cancel.drop_guard(),
        }
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) fn has_pending_requests(&self) -> bool {
        !self.pending.is_empty()
    }

    pub(crate) fn send(&mut self, request: ChatRequest, responder: Responder) {
        let id = self.pending.fresh_id();
        let info = RequestInfo::new(id, &request, responder);
        let headers = request.wire_headers().to_lines();
        let frame = RequestFrame {
            verb: request.verb,
            path: request.path,
            id,
            headers,
            body: request.body,
        };
        debug!(class = %self.ctx.class, epoch = self.epoch, request_id = id, verb = %frame.verb, path = %frame.path, "sending request");

        if self.outbound.send(WireMessage::Request(frame)).is_err() {
            info.fail(TransportError::network("socket writer gone"));
            return;
        }

        let timeout = self.ctx.config.request_timeout;
        let timer_ctx = self.ctx.clone();
        let epoch = self.epoch;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            timer_ctx.post(TransportEvent::RequestTimedOut { epoch, id });
        });
        self.pending.insert(info, Some(timer.abort_handle()));
        self.ctx.metrics.request_sent();
    }

    pub(crate) fn handle_frame(&mut self, frame: WireMessage) -> Option<LinkChange> {
        match frame {
            WireMessage::Response(response) => self.handle_response(response),
            WireMessage::Request(push) => self.handle_push(push),
        }
    }

    fn handle_response(&mut self, response: ResponseFrame) -> Option<LinkChange> {
        if self.outstanding_ping == Some(response.id) {
            debug!(class = %self.ctx.class, epoch = self.epoch, status = response.status, "keepalive answered");
            self.outstanding_ping = None;
            return None;
        }

        // Can legitimately race a timeout that already removed the entry.
        let Some(info) = self.pending.remove(response.id) else {
            warn!(
                class = %self.ctx.class,
                epoch = self.epoch,
                request_id = response.id,
                "response for unknown request, dropping"
            );
            return None;
        };

        let headers = response.headers();
        info.complete(ChatResponse::from_status(
            response.status,
            headers,
            response.body,
        ));
        Some(LinkChange::KeepAlive(KeepAliveTrigger::ReceivedResponse))
    }

    fn handle_push(&mut self, push: RequestFrame) -> Option<LinkChange> {
        self.ctx.metrics.push_received();

        if push.is("PUT", MESSAGE_PATH) {
            let delivery_timestamp = push
                .headers()
                .get(DELIVERY_TIMESTAMP_HEADER)
                .and_then(|value| value.parse::<u64>().ok())
                .unwrap_or_else(|| {
                    error!(
                        class = %self.ctx.class,
                        push_id = push.id,
                        "pushed message has no valid delivery timestamp"
                    );
                    0
                });

            // Enqueued synchronously, so a later queue-empty is ordered after it.
            let decision = self
                .ctx
                .dispatcher
                .process(push.body.unwrap_or_default(), delivery_timestamp);

            let outbound = self.outbound.clone();
            let metrics = self.ctx.metrics.clone();
            let class = self.ctx.class;
            let id = push.id;
            tokio::spawn(async move {
                match decision.await {
                    DispatchOutcome::ShouldAck => {
                        if outbound
                            .send(WireMessage::Response(ResponseFrame::ack(id)))
                            .is_ok()
                        {
                            metrics.ack_sent();
                        } else {
                            debug!(%class, push_id = id, "socket closed before ack");
                        }
                    }
                    DispatchOutcome::ShouldNotAck(reason) => {
                        info!(%class, push_id = id, %reason, "not acknowledging pushed message");
                    }
                }
            });
            return Some(LinkChange::KeepAlive(KeepAliveTrigger::ReceivedMessage));
        }

        self.ack(push.id);
        if push.path == QUEUE_EMPTY_PATH {
            return Some(LinkChange::QueueEmptied);
        }
        debug!(
            class = %self.ctx.class,
            verb = %push.verb,
            path = %push.path,
            "unhandled push, acknowledged"
        );
        None
    }

    fn ack(&self, id: u64) {
        if self
            .outbound
            .send(WireMessage::Response(ResponseFrame::ack(id)))
            .is_ok()
        {
            self.ctx.metrics.ack_sent();
        }
    }

    /// Fail a request whose timer fired. A stalled request means the socket
    /// is presumed dead.
    pub(crate) fn time_out(&mut self, id: u64) -> Option<LinkChange> {
        let info = self.pending.remove(id)?;
        info.fail(TransportError::network("request timed out"));
        self.ctx.metrics.request_timed_out();
        warn!(class = %self.ctx.class, epoch = self.epoch, request_id = id, "request timed out");
        Some(LinkChange::Cycle(format!("request {id} timed out")))
    }

    pub(crate) fn heartbeat(&mut self) -> Result<(), String> {
        if let Some(id) = self.outstanding_ping {
            return Err(format!("keepalive {id} unanswered"));
        }
        let id = self.pending.fresh_id();
        self.outbound
            .send(WireMessage::Request(RequestFrame {
                verb: "GET".to_string(),
                path: KEEPALIVE_PATH.to_string(),
                id,
                headers: Vec::new(),
                body: None,
            }))
            .map_err(|_| "socket writer gone".to_string())?;
        self.outstanding_ping = Some(id);
        self.ctx.metrics.heartbeat_sent();
        Ok(())
    }

    /// Fail every pending request. The socket tasks stop when `self` drops.
    pub(crate) fn shutdown(mut self, reason: &str) -> usize {
        self.pending.fail_all(reason)
    }
}

enum FramedLink {
    Idle,
    Connecting { epoch: u64, _attempt: DropGuard },
    Open(FramedMultiplexer),
}

/// [`Transport`] over a [`Connector`]-supplied framed socket.
pub(crate) struct FramedTransport {
    ctx: TransportContext,
    connector: Arc<dyn Connector>,
    link: FramedLink,
    next_epoch: u64,
}

impl FramedTransport {
    pub(crate) fn new(ctx: TransportContext, connector: Arc<dyn Connector>) -> Self {
        Self {
            ctx,
            connector,
            link: FramedLink::Idle,
            next_epoch: 0,
        }
    }

    fn open_epoch(&self) -> Option<u64> {
        match &self.link {
            FramedLink::Open(mux) => Some(mux.epoch()),
            _ => None,
        }
    }

    fn connecting_epoch(&self) -> Option<u64> {
        match &self.link {
            FramedLink::Connecting { epoch, .. } => Some(*epoch),
            _ => None,
        }
    }

    fn mux_for(&mut self, epoch: u64) -> Option<&mut FramedMultiplexer> {
        match &mut self.link {
            FramedLink::Open(mux) if mux.epoch() == epoch => Some(mux),
            _ => None,
        }
    }
}

impl Transport for FramedTransport {
    fn state(&self) -> ConnectionState {
        match self.link {
            FramedLink::Idle => ConnectionState::Closed,
            FramedLink::Connecting { .. } => ConnectionState::Connecting,
            FramedLink::Open(_) => ConnectionState::Open,
        }
    }

    fn connect(&mut self) {
        if !matches!(self.link, FramedLink::Idle) {
            return;
        }
        self.next_epoch += 1;
        let epoch = self.next_epoch;
        let attempt = self.connector.connect(self.ctx.connect_request());
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = task_cancel.cancelled() => {}
                result = attempt => match result {
                    Ok(socket) => ctx.post(TransportEvent::SocketOpened { epoch, socket }),
                    Err(e) => ctx.post(TransportEvent::SocketConnectFailed {
                        epoch,
                        reason: e.to_string(),
                    }),
                },
            }
        });
        self.ctx.metrics.connect_attempt();
        debug!(class = %self.ctx.class, epoch, "connecting");
        self.link = FramedLink::Connecting {
            epoch,
            _attempt: cancel.drop_guard(),
        };
    }

    fn disconnect(&mut self, reason: &str) {
        match std::mem::replace(&mut self.link, FramedLink::Idle) {
            FramedLink::Open(mux) => {
                let epoch = mux.epoch();
                let failed = mux.shutdown(reason);
                info!(class = %self.ctx.class, epoch, failed, %reason, "socket closed");
            }
            FramedLink::Connecting { epoch, .. } => {
                debug!(class = %self.ctx.class, epoch, %reason, "connect attempt abandoned");
            }
            FramedLink::Idle => {}
        }
    }

    fn send(&mut self, request: ChatRequest, responder: Responder) {
        match &mut self.link {
            FramedLink::Open(mux) => mux.send(request, responder),
            _ => {
                let _ = responder.send(Err(TransportError::network("socket not open")));
            }
        }
    }

    fn has_pending_requests(&self) -> bool {
        match &self.link {
            FramedLink::Open(mux) => mux.has_pending_requests(),
            _ => false,
        }
    }

    fn handle_event(&mut self, event: TransportEvent) -> Option<LinkChange> {
        match event {
            TransportEvent::SocketOpened { epoch, socket } => {
                if self.connecting_epoch() != Some(epoch) {
                    debug!(class = %self.ctx.class, epoch, "discarding stale socket");
                    return None;
                }
                info!(class = %self.ctx.class, epoch, "socket open");
                self.ctx.metrics.connection_opened();
                self.link = FramedLink::Open(FramedMultiplexer::start(
                    epoch,
                    socket,
                    self.ctx.clone(),
                ));
                None
            }
            TransportEvent::SocketConnectFailed { epoch, reason } => {
                if self.connecting_epoch() != Some(epoch) {
                    return None;
                }
                self.link = FramedLink::Idle;
                Some(LinkChange::Failed(reason))
            }
            TransportEvent::FrameReceived { epoch, frame } => {
                self.mux_for(epoch)?.handle_frame(frame)
            }
            TransportEvent::SocketClosed { epoch, reason } => {
                if self.open_epoch() != Some(epoch) {
                    return None;
                }
                self.disconnect(&reason);
                Some(LinkChange::Failed(reason))
            }
            TransportEvent::RequestTimedOut { epoch, id } => self.mux_for(epoch)?.time_out(id),
            other => {
                debug!(class = %self.ctx.class, event = ?other, "ignoring event");
                None
            }
        }
    }

    fn uses_heartbeat(&self) -> bool {
        true
    }

    fn heartbeat(&mut self) -> Result<(), String> {
        match &mut self.link {
            FramedLink::Open(mux) => mux.heartbeat(),
            _ => Ok(()),
        }
    }
}
