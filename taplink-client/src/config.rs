//! SDK and connection configuration.
//!
//! Library configuration is plain serde data. Durations use humantime
//! strings when serialized so persisted configs stay readable.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default WebSocket port of a Tapro terminal.
pub const DEFAULT_LAN_PORT: u16 = 8443;

/// Identity of the merchant application using the SDK.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SdkConfig {
    /// Merchant application id; travels as the envelope `appSign`.
    pub app_id: String,
    /// Merchant secret. Opaque to the communication core.
    pub secret_key: String,
    /// Protocol version announced in every envelope.
    pub version: String,
}

/// Which link carries the envelope traffic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionMode {
    /// In-process IPC with the Tapro host application.
    AppToApp,
    /// USB/serial cable.
    Cable,
    /// WebSocket over the local network.
    Lan,
}

/// The cable link protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CableProtocol {
    /// Probe the supported protocols and remember the result.
    Auto,
    /// USB Android Open Accessory.
    UsbAoa,
    /// USB virtual serial port.
    UsbVsp,
    /// RS-232 serial.
    Rs232,
}

/// Options for one connection.
///
/// Two configurations are equivalent iff their mode plus the mode-specific
/// fields match; [`ConnectionConfig::is_equivalent`] implements that rule.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// The transport to use.
    pub mode: ConnectionMode,
    /// LAN host. Ignored for other modes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// LAN port, 1..=65535.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Selects `wss` over `ws` for the LAN transport.
    #[serde(default)]
    pub secure: bool,
    /// Cable protocol selection. Ignored for other modes.
    #[serde(default = "default_cable_protocol")]
    pub cable_protocol: CableProtocol,
}

fn default_cable_protocol() -> CableProtocol {
    CableProtocol::Auto
}

impl ConnectionConfig {
    /// A LAN configuration for the given endpoint.
    pub fn lan(host: impl Into<String>, port: u16, secure: bool) -> Self {
        Self {
            mode: ConnectionMode::Lan,
            host: Some(host.into()),
            port: Some(port),
            secure,
            cable_protocol: CableProtocol::Auto,
        }
    }

    /// An app-to-app configuration.
    pub fn app_to_app() -> Self {
        Self {
            mode: ConnectionMode::AppToApp,
            host: None,
            port: None,
            secure: false,
            cable_protocol: CableProtocol::Auto,
        }
    }

    /// A cable configuration.
    pub fn cable(protocol: CableProtocol) -> Self {
        Self {
            mode: ConnectionMode::Cable,
            host: None,
            port: None,
            secure: false,
            cable_protocol: protocol,
        }
    }

    /// The LAN port, defaulted when unset.
    pub fn lan_port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_LAN_PORT)
    }

    /// Equivalence: mode plus mode-specific fields.
    pub fn is_equivalent(&self, other: &ConnectionConfig) -> bool {
        if self.mode != other.mode {
            return false;
        }
        match self.mode {
            ConnectionMode::Lan => {
                self.host == other.host
                    && self.lan_port() == other.lan_port()
                    && self.secure == other.secure
            }
            ConnectionMode::Cable => self.cable_protocol == other.cable_protocol,
            ConnectionMode::AppToApp => true,
        }
    }
}

/// Tunables of the LAN transport.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LanSettings {
    /// Heartbeat cadence.
    #[serde(with = "humantime_serde", default = "default_heartbeat_interval")]
    pub heartbeat_interval: Duration,
    /// Deadline for a heartbeat reply.
    #[serde(with = "humantime_serde", default = "default_heartbeat_timeout")]
    pub heartbeat_timeout: Duration,
    /// Fraction of the reply deadline after which a reply counts as delayed.
    #[serde(default = "default_heartbeat_delay_ratio")]
    pub heartbeat_delay_ratio: f64,
    /// Consecutive heartbeat failures before the connection is declared dead.
    #[serde(default = "default_heartbeat_failure_threshold")]
    pub heartbeat_failure_threshold: u32,
    /// How long one discovery round listens for advertisements.
    #[serde(with = "humantime_serde", default = "default_discovery_window")]
    pub discovery_window: Duration,
    /// Upper bound on automatic reconnect attempts.
    #[serde(default = "default_reconnect_max_retries")]
    pub reconnect_max_retries: u32,
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_heartbeat_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_heartbeat_delay_ratio() -> f64 {
    0.5
}

fn default_heartbeat_failure_threshold() -> u32 {
    2
}

fn default_discovery_window() -> Duration {
    Duration::from_secs(2)
}

fn default_reconnect_max_retries() -> u32 {
    3
}

impl Default for LanSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: default_heartbeat_interval(),
            heartbeat_timeout: default_heartbeat_timeout(),
            heartbeat_delay_ratio: default_heartbeat_delay_ratio(),
            heartbeat_failure_threshold: default_heartbeat_failure_threshold(),
            discovery_window: default_discovery_window(),
            reconnect_max_retries: default_reconnect_max_retries(),
        }
    }
}
