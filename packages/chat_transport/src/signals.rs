//! Collaborator contracts the connection layer samples and reports to.
//!
//! The state machines never consult ambient globals: everything they know
//! about the app's lifecycle comes through an injected [`SignalProvider`],
//! sampled synchronously while computing the desired state, plus its
//! [`SignalEvent`] broadcast for change notification.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::broadcast;

/// Change notifications published by a [`SignalProvider`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalEvent {
    AppReady,
    RegistrationChanged,
    AppExpiryChanged,
    ForegroundChanged,
    CallStateChanged,
    CensorshipChanged,
    ProxyChanged,
    StoriesEnabledChanged,
}

impl SignalEvent {
    /// Whether the change invalidates something baked into the connection at
    /// connect time (credentials, endpoint, connect headers), requiring a full
    /// disconnect/reconnect rather than a plain reconciliation.
    pub fn requires_cycle(self) -> bool {
        matches!(
            self,
            SignalEvent::RegistrationChanged
                | SignalEvent::CensorshipChanged
                | SignalEvent::ProxyChanged
                | SignalEvent::StoriesEnabledChanged
        )
    }
}

/// Held while the connection is open in the background. The platform may use
/// it to keep the process scheduled; dropping it ends the activity.
pub struct BackgroundActivity {
    on_end: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl BackgroundActivity {
    pub fn new(on_end: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            on_end: Some(Box::new(on_end)),
        }
    }
}

impl Drop for BackgroundActivity {
    fn drop(&mut self) {
        if let Some(on_end) = self.on_end.take() {
            on_end();
        }
    }
}

impl std::fmt::Debug for BackgroundActivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundActivity").finish_non_exhaustive()
    }
}

/// App lifecycle gates, sampled synchronously.
pub trait SignalProvider: Send + Sync + 'static {
    fn is_app_ready(&self) -> bool;
    fn is_registered(&self) -> bool;
    fn is_expired(&self) -> bool;
    fn is_foreground(&self) -> bool;
    /// Only the main app may hold persistent connections; extensions may not.
    fn is_main_app(&self) -> bool;
    fn has_current_call(&self) -> bool;

    fn stories_enabled(&self) -> bool {
        false
    }

    fn begin_background_activity(&self) -> Option<BackgroundActivity> {
        None
    }

    fn subscribe(&self) -> broadcast::Receiver<SignalEvent>;
}

/// Settable [`SignalProvider`]. Every setter that changes a value publishes
/// the matching event.
pub struct ManualSignals {
    app_ready: AtomicBool,
    registered: AtomicBool,
    expired: AtomicBool,
    foreground: AtomicBool,
    main_app: AtomicBool,
    current_call: AtomicBool,
    stories_enabled: AtomicBool,
    background_activities: Arc<AtomicUsize>,
    events: broadcast::Sender<SignalEvent>,
}

impl Default for ManualSignals {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualSignals {
    /// Everything off except `is_main_app`.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            app_ready: AtomicBool::new(false),
            registered: AtomicBool::new(false),
            expired: AtomicBool::new(false),
            foreground: AtomicBool::new(false),
            main_app: AtomicBool::new(true),
            current_call: AtomicBool::new(false),
            stories_enabled: AtomicBool::new(false),
            background_activities: Arc::new(AtomicUsize::new(0)),
            events,
        }
    }

    /// A ready, registered main app in the background.
    pub fn ready() -> Self {
        let signals = Self::new();
        signals.app_ready.store(true, Ordering::SeqCst);
        signals.registered.store(true, Ordering::SeqCst);
        signals
    }

    fn update(&self, flag: &AtomicBool, value: bool, event: SignalEvent) {
        if flag.swap(value, Ordering::SeqCst) != value {
            let _ = self.events.send(event);
        }
    }

    pub fn set_app_ready(&self, value: bool) {
        self.update(&self.app_ready, value, SignalEvent::AppReady);
    }

    pub fn set_registered(&self, value: bool) {
        self.update(&self.registered, value, SignalEvent::RegistrationChanged);
    }

    pub fn set_expired(&self, value: bool) {
        self.update(&self.expired, value, SignalEvent::AppExpiryChanged);
    }

    pub fn set_foreground(&self, value: bool) {
        self.update(&self.foreground, value, SignalEvent::ForegroundChanged);
    }

    pub fn set_main_app(&self, value: bool) {
        self.main_app.store(value, Ordering::SeqCst);
    }

    pub fn set_current_call(&self, value: bool) {
        self.update(&self.current_call, value, SignalEvent::CallStateChanged);
    }

    pub fn set_stories_enabled(&self, value: bool) {
        self.update(
            &self.stories_enabled,
            value,
            SignalEvent::StoriesEnabledChanged,
        );
    }

    /// Publish an event with no backing flag (censorship, proxy).
    pub fn notify(&self, event: SignalEvent) {
        let _ = self.events.send(event);
    }

    /// Background activities currently held.
    pub fn background_activities(&self) -> usize {
        self.background_activities.load(Ordering::SeqCst)
    }
}

impl SignalProvider for ManualSignals {
    fn is_app_ready(&self) -> bool {
        self.app_ready.load(Ordering::SeqCst)
    }

    fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    fn is_expired(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }

    fn is_foreground(&self) -> bool {
        self.foreground.load(Ordering::SeqCst)
    }

    fn is_main_app(&self) -> bool {
        self.main_app.load(Ordering::SeqCst)
    }

    fn has_current_call(&self) -> bool {
        self.current_call.load(Ordering::SeqCst)
    }

    fn stories_enabled(&self) -> bool {
        self.stories_enabled.load(Ordering::SeqCst)
    }

    fn begin_background_activity(&self) -> Option<BackgroundActivity> {
        self.background_activities.fetch_add(1, Ordering::SeqCst);
        let counter = self.background_activities.clone();
        Some(BackgroundActivity::new(move || {
            counter.fetch_sub(1, Ordering::SeqCst);
        }))
    }

    fn subscribe(&self) -> broadcast::Receiver<SignalEvent> {
        self.events.subscribe()
    }
}

/// Account credentials used to authenticate the identified connection.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Synchronous credential lookup at connect time. `None` means unregistered.
pub trait CredentialsProvider: Send + Sync + 'static {
    fn credentials(&self) -> Option<Credentials>;
}

/// Fixed credentials.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials(pub Option<Credentials>);

impl StaticCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self(Some(Credentials {
            username: username.into(),
            password: password.into(),
        }))
    }
}

impl CredentialsProvider for StaticCredentials {
    fn credentials(&self) -> Option<Credentials> {
        self.0.clone()
    }
}

/// Fire-and-forget connectivity hooks feeding outage detection.
pub trait OutageReporter: Send + Sync + 'static {
    fn report_connection_success(&self);
    fn report_connection_failure(&self);
}

/// Receives process-wide fatal conditions surfaced by a transport.
pub trait FatalStateSink: Send + Sync + 'static {
    fn app_expired(&self);
    fn device_deregistered(&self);
}
