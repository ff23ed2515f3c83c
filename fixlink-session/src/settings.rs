use std::{net::IpAddr, path::PathBuf};

use fixlink_core::fields::FixString;
use serde::{Deserialize, Deserializer};
use tokio::time::Duration;

use crate::session_id::SessionId;

fn duration_from_seconds<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Duration::from_secs(u64::deserialize(deserializer)?))
}

fn default_logon_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_logout_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_test_request_grace() -> u32 {
    1
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Initiator,
    Acceptor,
}

/// Message store backend selector.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    File,
    Sqlite,
}

#[derive(Clone, Debug, Deserialize)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    /// Backing location; required for `file` and `sqlite`.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl StoreSettings {
    pub fn memory() -> StoreSettings {
        StoreSettings {
            backend: StoreBackend::Memory,
            path: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ReconnectSettings {
    pub enabled: bool,
    /// Initial retry delay, doubled after every failed attempt.
    #[serde(
        default = "ReconnectSettings::default_interval",
        deserialize_with = "duration_from_seconds"
    )]
    pub interval: Duration,
    /// Upper bound for the doubled delay.
    #[serde(
        default = "ReconnectSettings::default_interval_cap",
        deserialize_with = "duration_from_seconds"
    )]
    pub interval_cap: Duration,
    /// 0 means unlimited.
    #[serde(default)]
    pub max_attempts: u32,
}

impl ReconnectSettings {
    fn default_interval() -> Duration {
        Duration::from_secs(1)
    }

    fn default_interval_cap() -> Duration {
        Duration::from_secs(30)
    }

    pub fn disabled() -> ReconnectSettings {
        ReconnectSettings {
            enabled: false,
            interval: Self::default_interval(),
            interval_cap: Self::default_interval_cap(),
            max_attempts: 0,
        }
    }
}

impl Default for ReconnectSettings {
    fn default() -> ReconnectSettings {
        ReconnectSettings::disabled()
    }
}

/// Endpoint-scope configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct Settings {
    pub connection_type: ConnectionType,
    /// IP address; local for an acceptor, remote for an initiator.
    pub host: IpAddr,
    /// Port number
    pub port: u16,
    /// FIX SenderCompID<49> field value for outgoing messages.
    pub sender_comp_id: FixString,
    /// Timeout \[s\] for inbound/outbound traffic. When reached,
    /// `TestRequest<1>` is sent when inbound traffic is missing or
    /// `Heartbeat<0>` is sent when outbound traffic is missing.
    #[serde(deserialize_with = "duration_from_seconds")]
    pub heart_bt_int: Duration,
    /// Timeout \[s\] for `Logon<A>`; when reached the connection is dropped.
    #[serde(
        default = "default_logon_timeout",
        deserialize_with = "duration_from_seconds"
    )]
    pub logon_timeout: Duration,
    /// Timeout \[s\] for the `Logout<5>` confirmation; when reached the
    /// connection is dropped without waiting any longer.
    #[serde(
        default = "default_logout_timeout",
        deserialize_with = "duration_from_seconds"
    )]
    pub logout_timeout: Duration,
    /// How many unanswered `TestRequest<1>` challenges are tolerated
    /// before the peer is deemed dead.
    #[serde(default = "default_test_request_grace")]
    pub test_request_grace: u32,
    #[serde(default)]
    pub reconnect: ReconnectSettings,
    /// TLS switch; the TLS context itself is built externally and handed
    /// in as the byte stream, these fields only feed that builder.
    #[serde(default)]
    pub use_ssl: bool,
    #[serde(default)]
    pub ssl_certificate: Option<PathBuf>,
    #[serde(default)]
    pub ssl_private_key: Option<PathBuf>,
    pub store: StoreSettings,
}

/// Credentials carried in Logon<A> tags 553/554.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct Credentials {
    pub username: FixString,
    pub password: FixString,
}

/// Per-session configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct SessionSettings {
    pub session_id: SessionId,

    /// Send `ResetSeqNumFlag<141>=Y` on the next Logon and reset both
    /// counters to 1.
    pub reset_seq_num_on_logon: bool,

    pub check_comp_id: bool,
    pub check_latency: bool,
    /// Maximum accepted difference between SendingTime<52> and local time.
    #[serde(deserialize_with = "duration_from_seconds")]
    pub max_latency: Duration,

    pub reset_on_logout: bool,
    pub reset_on_disconnect: bool,

    /// Enable message persistence. Disabling it turns every resend into
    /// gap fills.
    pub persist: bool,

    /// Credentials sent on Logon (initiator) or demanded from the peer's
    /// Logon (acceptor).
    #[serde(default)]
    pub credentials: Option<Credentials>,
}

impl SessionSettings {
    /// Permissive defaults used by tests and examples.
    pub fn new(session_id: SessionId) -> SessionSettings {
        SessionSettings {
            session_id,
            reset_seq_num_on_logon: false,
            check_comp_id: true,
            check_latency: false,
            max_latency: Duration::from_secs(120),
            reset_on_logout: false,
            reset_on_disconnect: false,
            persist: true,
            credentials: None,
        }
    }
}
