use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::request::AuthClass;

// =============================================================================
// File config (figment-deserialized from defaults / chat.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   chat.toml:       [transport]
//                    request_timeout_secs = 20
//
//   env var:         CHAT_TRANSPORT__REQUEST_TIMEOUT_SECS=20   (double underscore = nesting)
//
//   (single underscore stays within field names: CHAT_SHADOWING__REQUEST_TIMEOUT_SECS)

/// Which implementation carries a logical connection.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Framed socket from the configured connector.
    #[default]
    Framed,
    /// The alternate chat-service client only.
    Service,
    /// Framed socket, with keepalive probes mirrored onto the chat service.
    Shadowed,
}

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChatFileConfig {
    #[serde(default)]
    pub transport: TransportFileConfig,
    #[serde(default)]
    pub shadowing: ShadowingFileConfig,
}

/// Connection tunables (lives under `[transport]` in chat.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransportFileConfig {
    #[serde(default = "default_chat_url")]
    pub chat_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Fixed delay between reconnect attempts. Not a backoff.
    #[serde(default = "default_reconnect_interval_secs")]
    pub reconnect_interval_secs: u64,
    #[serde(default = "default_keepalive_check_interval_ms")]
    pub keepalive_check_interval_ms: u64,
    #[serde(default)]
    pub identified_mode: TransportMode,
    #[serde(default)]
    pub unidentified_mode: TransportMode,
}

impl Default for TransportFileConfig {
    fn default() -> Self {
        Self {
            chat_url: default_chat_url(),
            request_timeout_secs: default_request_timeout_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            reconnect_interval_secs: default_reconnect_interval_secs(),
            keepalive_check_interval_ms: default_keepalive_check_interval_ms(),
            identified_mode: TransportMode::default(),
            unidentified_mode: TransportMode::default(),
        }
    }
}

/// Shadow probing tunables (lives under `[shadowing]` in chat.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShadowingFileConfig {
    /// Probability of probing after a successful primary request.
    #[serde(default)]
    pub frequency: f64,
    #[serde(default = "default_shadow_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ShadowingFileConfig {
    fn default() -> Self {
        Self {
            frequency: 0.0,
            request_timeout_secs: default_shadow_request_timeout_secs(),
        }
    }
}

fn default_chat_url() -> String {
    "ws://127.0.0.1:8080".to_string()
}
fn default_request_timeout_secs() -> u64 {
    10
}
fn default_heartbeat_interval_secs() -> u64 {
    30
}
fn default_reconnect_interval_secs() -> u64 {
    5
}
fn default_keepalive_check_interval_ms() -> u64 {
    1000
}
fn default_shadow_request_timeout_secs() -> u64 {
    3
}

/// Build a figment that layers: defaults → chat.toml → CHAT_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `CHAT_TRANSPORT__CHAT_URL=wss://chat.example.org`  →  `transport.chat_url`
///   `CHAT_SHADOWING__FREQUENCY=0.5`  →  `shadowing.frequency = 0.5`
pub fn load_config(config_file: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let mut figment = Figment::from(Serialized::defaults(ChatFileConfig::default()));
    if let Some(path) = config_file {
        figment = figment.merge(Toml::file(path));
    }
    figment.merge(Env::prefixed("CHAT_").split("__"))
}

// =============================================================================
// Runtime config (derived from ChatFileConfig)
// =============================================================================

/// Resolved transport configuration (runtime view).
#[derive(Clone, Debug)]
pub struct TransportConfig {
    pub chat_url: String,
    pub request_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub reconnect_interval: Duration,
    /// How often a backgrounded connection re-checks its keepalive window.
    pub keepalive_check_interval: Duration,
    pub identified_mode: TransportMode,
    pub unidentified_mode: TransportMode,
    pub shadowing: ShadowingConfig,
}

#[derive(Clone, Debug)]
pub struct ShadowingConfig {
    /// Always within `0.0..=1.0`.
    pub frequency: f64,
    pub request_timeout: Duration,
}

impl TransportConfig {
    /// Timer periods are floored so a zero in the file cannot produce a
    /// zero-length interval.
    pub fn from_file(fc: &ChatFileConfig) -> Self {
        let transport = &fc.transport;
        Self {
            chat_url: transport.chat_url.clone(),
            request_timeout: Duration::from_secs(transport.request_timeout_secs.max(1)),
            heartbeat_interval: Duration::from_secs(transport.heartbeat_interval_secs.max(1)),
            reconnect_interval: Duration::from_secs(transport.reconnect_interval_secs.max(1)),
            keepalive_check_interval: Duration::from_millis(
                transport.keepalive_check_interval_ms.max(1),
            ),
            identified_mode: transport.identified_mode,
            unidentified_mode: transport.unidentified_mode,
            shadowing: ShadowingConfig {
                frequency: clamp_frequency(fc.shadowing.frequency),
                request_timeout: Duration::from_secs(fc.shadowing.request_timeout_secs.max(1)),
            },
        }
    }

    pub fn mode_for(&self, class: AuthClass) -> TransportMode {
        match class {
            AuthClass::Identified => self.identified_mode,
            AuthClass::Unidentified => self.unidentified_mode,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::from_file(&ChatFileConfig::default())
    }
}

fn clamp_frequency(frequency: f64) -> f64 {
    if frequency.is_nan() {
        0.0
    } else {
        frequency.clamp(0.0, 1.0)
    }
}
