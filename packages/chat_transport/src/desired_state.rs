//! Whether a connection *should* be open right now, and why.
//!
//! The decision is pure data: a [`SignalSnapshot`] goes in, and the first
//! rule in [`RULES`] with an opinion decides. Keeping it free of I/O makes
//! the priority order directly testable.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    AppNotReady,
    NotRegistered,
    AppExpired,
    PersistentConnectionsUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenReason {
    UnsubmittedRequest,
    Foreground,
    BackgroundKeepAlive(KeepAliveTrigger),
    CallInProgress,
    DrainingInitialQueue,
    PendingRequests,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesiredState {
    Closed(CloseReason),
    Open(OpenReason),
    /// Nothing wants the socket; treated as closed.
    NoOpinion,
}

impl DesiredState {
    pub fn should_be_open(&self) -> bool {
        matches!(self, DesiredState::Open(_))
    }
}

impl fmt::Display for DesiredState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DesiredState::Closed(reason) => write!(f, "closed ({reason:?})"),
            DesiredState::Open(reason) => write!(f, "open ({reason:?})"),
            DesiredState::NoOpinion => write!(f, "no opinion"),
        }
    }
}

/// Everything the decision depends on, sampled at one instant.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalSnapshot {
    pub app_ready: bool,
    pub registered: bool,
    pub expired: bool,
    pub main_app: bool,
    pub has_tokens: bool,
    pub foreground: bool,
    pub keepalive: Option<KeepAliveTrigger>,
    pub call_in_progress: bool,
    /// Identified connection, connecting or open, queue-empty not yet seen.
    pub draining_initial_queue: bool,
    pub pending_requests: bool,
}

type Rule = fn(&SignalSnapshot) -> Option<DesiredState>;

fn app_not_ready(s: &SignalSnapshot) -> Option<DesiredState> {
    (!s.app_ready).then_some(DesiredState::Closed(CloseReason::AppNotReady))
}

fn not_registered(s: &SignalSnapshot) -> Option<DesiredState> {
    (!s.registered).then_some(DesiredState::Closed(CloseReason::NotRegistered))
}

fn app_expired(s: &SignalSnapshot) -> Option<DesiredState> {
    s.expired.then_some(DesiredState::Closed(CloseReason::AppExpired))
}

fn not_main_app(s: &SignalSnapshot) -> Option<DesiredState> {
    (!s.main_app).then_some(DesiredState::Closed(CloseReason::PersistentConnectionsUnavailable))
}

fn unsubmitted_request(s: &SignalSnapshot) -> Option<DesiredState> {
    s.has_tokens.then_some(DesiredState::Open(OpenReason::UnsubmittedRequest))
}

fn foreground(s: &SignalSnapshot) -> Option<DesiredState> {
    s.foreground.then_some(DesiredState::Open(OpenReason::Foreground))
}

fn background_keepalive(s: &SignalSnapshot) -> Option<DesiredState> {
    s.keepalive
        .map(|trigger| DesiredState::Open(OpenReason::BackgroundKeepAlive(trigger)))
}

fn call_in_progress(s: &SignalSnapshot) -> Option<DesiredState> {
    s.call_in_progress.then_some(DesiredState::Open(OpenReason::CallInProgress))
}

fn draining_initial_queue(s: &SignalSnapshot) -> Option<DesiredState> {
    s.draining_initial_queue.then_some(DesiredState::Open(OpenReason::DrainingInitialQueue))
}

fn pending_requests(s: &SignalSnapshot) -> Option<DesiredState> {
    s.pending_requests.then_some(DesiredState::Open(OpenReason::PendingRequests))
}

/// Rules in priority order. Close reasons always outrank open reasons.
pub const RULES: &[(&str, Rule)] = &[
    ("app_not_ready", app_not_ready),
    ("not_registered", not_registered),
    ("app_expired", app_expired),
    ("not_main_app", not_main_app),
    ("unsubmitted_request", unsubmitted_request),
    ("foreground", foreground),
    ("background_keepalive", background_keepalive),
    ("call_in_progress", call_in_progress),
    ("draining_initial_queue", draining_initial_queue),
    ("pending_requests", pending_requests),
];

pub fn evaluate(snapshot: &SignalSnapshot) -> DesiredState {
    RULES
        .iter()
        .find_map(|(_, rule)| rule(snapshot))
        .unwrap_or(DesiredState::NoOpinion)
}

/// Recent activity that justifies staying connected in the background.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveTrigger {
    ReceivedPush,
    ReceivedMessage,
    ReceivedResponse,
}

impl KeepAliveTrigger {
    pub fn ttl(self) -> Duration {
        match self {
            KeepAliveTrigger::ReceivedPush => Duration::from_secs(20),
            KeepAliveTrigger::ReceivedMessage => Duration::from_secs(15),
            KeepAliveTrigger::ReceivedResponse => Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackgroundKeepAlive {
    pub trigger: KeepAliveTrigger,
    pub expires_at: Instant,
}

/// Retains only the keepalive with the furthest expiry.
#[derive(Debug, Default)]
pub(crate) struct KeepAliveWindow {
    current: Option<BackgroundKeepAlive>,
}

impl KeepAliveWindow {
    pub(crate) fn extend(&mut self, trigger: KeepAliveTrigger, now: Instant) {
        let candidate = BackgroundKeepAlive {
            trigger,
            expires_at: now + trigger.ttl(),
        };
        match self.current {
            Some(existing) if existing.expires_at >= candidate.expires_at => {}
            _ => self.current = Some(candidate),
        }
    }

    /// The live keepalive, culling it once `now` is past its expiry.
    pub(crate) fn active(&mut self, now: Instant) -> Option<BackgroundKeepAlive> {
        if let Some(existing) = self.current
            && now > existing.expires_at
        {
            self.current = None;
        }
        self.current
    }
}
