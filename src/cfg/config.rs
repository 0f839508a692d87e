// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, net::Ipv4Addr, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::cfg::enums::{ConnectionKind, SecureMode, YesNo};

/// Default multicast group for routing/discovery per §4.5/§6.
pub const DEFAULT_ROUTING_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 23, 12);
pub const DEFAULT_ROUTING_PORT: u16 = 3671;

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// What kind of connection/channel this client instance drives.
    pub connection: ConnectionConfig,
    /// Discovery (search/description) timing and multicast behavior.
    pub discovery: DiscoveryConfig,
    /// Routing-channel multicast and congestion parameters.
    pub routing: RoutingConfig,
    /// KNX IP Secure credentials and tuning.
    pub secure: SecureConfig,
    /// Implementation/runtime parameters outside the protocol itself.
    pub runtime: RuntimeConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
/// Per-connection parameters shared by Tunnel and DeviceManagement (§4.3).
pub struct ConnectionConfig {
    #[serde(rename = "Kind")]
    pub kind: ConnectionKind,

    #[serde(rename = "RemoteControlEndpoint")]
    /// `host:port` of the server's control endpoint.
    pub remote_control_endpoint: String,

    #[serde(rename = "NatAware", default)]
    /// When `Yes`, HPAI structures are sent zeroed and the peer's observed
    /// source address is used instead (§4.2).
    pub nat_aware: YesNo,

    #[serde(rename = "AckTimeout", with = "serde_millis")]
    /// Time to wait for `Connect.res`/`ConnectionState.res`/`Disconnect.res`
    /// before retrying or giving up (§4.3, standard value 10s).
    pub ack_timeout: Duration,

    #[serde(rename = "MaxAckAttempts", default = "default_max_ack_attempts")]
    /// Retransmission attempts for tunneling (2) vs devmgmt (4) requests.
    pub max_ack_attempts: u32,

    #[serde(rename = "HeartbeatInterval", with = "serde_secs")]
    /// Cadence of `ConnectionState.req` heartbeats (standard value 60s).
    pub heartbeat_interval: Duration,

    #[serde(rename = "HeartbeatWait", with = "serde_secs")]
    /// Time to wait for a heartbeat's `ConnectionState.res` (standard 10s).
    pub heartbeat_wait: Duration,

    #[serde(rename = "HeartbeatRetries", default = "default_heartbeat_retries")]
    /// Heartbeat retries at the shorter 1s cadence before declaring the
    /// connection dead (standard value 4).
    pub heartbeat_retries: u32,

    #[serde(rename = "ConfirmationTimeout", with = "serde_millis")]
    /// Time to wait for the `.con` confirmation matching a sent cEMI frame.
    pub confirmation_timeout: Duration,
}

fn default_max_ack_attempts() -> u32 {
    2
}

fn default_heartbeat_retries() -> u32 {
    4
}

#[derive(Deserialize, Serialize, Debug, Clone)]
/// Discovery (§6) timing and multicast join behavior.
pub struct DiscoveryConfig {
    #[serde(rename = "SearchTimeout", with = "serde_secs")]
    /// How long a `SearchRequest` stays open collecting responses.
    pub search_timeout: Duration,

    #[serde(rename = "DescriptionTimeout", with = "serde_secs")]
    /// How long a one-shot `DescriptionRequest` waits for its reply.
    pub description_timeout: Duration,

    #[serde(rename = "JoinMulticastForResponses", default)]
    /// Whether the discovery socket also joins the multicast group so
    /// multicast-addressed `SearchResponse`s are received.
    pub join_multicast_for_responses: YesNo,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
/// Routing-channel (§4.5) parameters.
pub struct RoutingConfig {
    #[serde(rename = "MulticastGroup", default = "default_routing_group")]
    pub multicast_group: Ipv4Addr,

    #[serde(rename = "MulticastPort", default = "default_routing_port")]
    pub multicast_port: u16,

    #[serde(rename = "Interface", default)]
    /// Local NIC to join the multicast group on; empty selects the OS
    /// default interface.
    pub interface: String,

    #[serde(rename = "LoopbackSuppressionCapacity", default = "default_loopback_capacity")]
    /// Size of the FIFO of recently-sent frame fingerprints used to drop
    /// our own multicast echoes (§4.5).
    pub loopback_suppression_capacity: usize,

    #[serde(rename = "LatencyToleranceMs", default)]
    /// Maximum age, in milliseconds, a secure routing group-timer frame may
    /// have before being rejected; 0 when secure routing is disabled.
    pub latency_tolerance_ms: u32,
}

fn default_routing_group() -> Ipv4Addr {
    DEFAULT_ROUTING_GROUP
}

fn default_routing_port() -> u16 {
    DEFAULT_ROUTING_PORT
}

fn default_loopback_capacity() -> usize {
    20
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
/// KNX IP Secure credentials (§4.7/§4.9).
pub struct SecureConfig {
    #[serde(rename = "Mode", default)]
    pub mode: Option<SecureMode>,

    #[serde(rename = "UserId", default)]
    /// Tunneling user id (1 = management, 2.. = regular tunnel users).
    pub user_id: u8,

    #[serde(rename = "UserPassword", default)]
    pub user_password: String,

    #[serde(rename = "DeviceAuthenticationPassword", default)]
    /// Empty string means CBC-MAC device authentication is skipped (§11).
    pub device_authentication_password: String,

    #[serde(rename = "BackboneKeyHex", default)]
    /// 16-byte AES key for secure routing, hex-encoded.
    pub backbone_key_hex: String,

    #[serde(rename = "SerialNumberOverride", default)]
    /// 6-byte serial number, hex-encoded; empty derives one from the local
    /// interface's MAC address (§11).
    pub serial_number_override: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
/// Runtime-only settings that do not map to protocol fields.
pub struct RuntimeConfig {
    #[serde(rename = "MaxConnections")]
    /// External limit on simultaneously tracked connections/sessions.
    pub max_connections: u32,

    #[serde(rename = "TimeoutConnection", with = "serde_secs")]
    /// Timeout for establishing the underlying TCP/UDP socket.
    pub timeout_connection: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            kind: ConnectionKind::Tunnel,
            remote_control_endpoint: String::new(),
            nat_aware: YesNo::No,
            ack_timeout: Duration::from_secs(10),
            max_ack_attempts: default_max_ack_attempts(),
            heartbeat_interval: Duration::from_secs(60),
            heartbeat_wait: Duration::from_secs(10),
            heartbeat_retries: default_heartbeat_retries(),
            confirmation_timeout: Duration::from_secs(3),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            search_timeout: Duration::from_secs(10),
            description_timeout: Duration::from_secs(10),
            join_multicast_for_responses: YesNo::No,
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            multicast_group: DEFAULT_ROUTING_GROUP,
            multicast_port: DEFAULT_ROUTING_PORT,
            interface: String::new(),
            loopback_suppression_capacity: default_loopback_capacity(),
            latency_tolerance_ms: 0,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            discovery: DiscoveryConfig::default(),
            routing: RoutingConfig::default(),
            secure: SecureConfig::default(),
            runtime: RuntimeConfig {
                max_connections: 1,
                timeout_connection: Duration::from_secs(5),
            },
        }
    }
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value. `path` is resolved against the current working
    /// directory before reading, so a relative path behaves the same
    /// regardless of which directory the caller happened to launch from.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let resolved = crate::cfg::cli::resolve_config_path(path)?;
        let s = fs::read_to_string(&resolved)
            .with_context(|| format!("failed to read config file: {resolved:?}"))?;
        let mut cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(
            !self.connection.remote_control_endpoint.is_empty(),
            "RemoteControlEndpoint must not be empty"
        );
        ensure!(!self.connection.ack_timeout.is_zero(), "AckTimeout must be > 0");
        ensure!(self.connection.max_ack_attempts >= 1, "MaxAckAttempts must be >= 1");

        ensure!(
            self.routing.multicast_group.is_multicast(),
            "RoutingConfig.MulticastGroup must be a multicast address"
        );
        ensure!(
            self.routing.loopback_suppression_capacity >= 1,
            "LoopbackSuppressionCapacity must be >= 1"
        );

        // Routing connections always use secure routing mode or none, never the
        // unicast session mode meant for Tunnel/DeviceManagement.
        if self.connection.kind == ConnectionKind::Routing {
            ensure!(
                !matches!(self.secure.mode, Some(SecureMode::Unicast)),
                "Routing connections cannot use Unicast secure mode"
            );
        } else {
            ensure!(
                !matches!(self.secure.mode, Some(SecureMode::Routing)),
                "Tunnel/DeviceManagement connections cannot use Routing secure mode"
            );
        }

        if matches!(self.secure.mode, Some(SecureMode::Routing)) {
            ensure!(
                self.routing.latency_tolerance_ms > 0,
                "LatencyToleranceMs must be > 0 when secure routing is enabled"
            );
            ensure!(
                !self.secure.backbone_key_hex.is_empty(),
                "BackboneKeyHex is required when secure routing is enabled"
            );
        }

        if matches!(self.secure.mode, Some(SecureMode::Unicast)) {
            ensure!(self.secure.user_id >= 1, "UserId must be >= 1 for a secure session");
        }

        ensure!(self.runtime.max_connections >= 1, "MaxConnections must be >= 1");

        Ok(())
    }
}

/// Serde helper for representing `Duration` as a number of whole seconds.
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Serde helper for representing `Duration` as a number of milliseconds.
mod serde_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let mut cfg = Config::default();
        cfg.connection.remote_control_endpoint = "192.168.1.10:3671".to_string();
        cfg.validate_and_normalize().expect("default config should validate");
    }

    #[test]
    fn secure_routing_requires_latency_tolerance() {
        let mut cfg = Config::default();
        cfg.connection.remote_control_endpoint = "192.168.1.10:3671".to_string();
        cfg.connection.kind = ConnectionKind::Routing;
        cfg.secure.mode = Some(SecureMode::Routing);
        cfg.secure.backbone_key_hex = "00112233445566778899aabbccddeeff".to_string();
        assert!(cfg.validate_and_normalize().is_err());
        cfg.routing.latency_tolerance_ms = 2000;
        cfg.validate_and_normalize().expect("should validate once tolerance is set");
    }

    #[test]
    fn rejects_unicast_secure_on_routing_connection() {
        let mut cfg = Config::default();
        cfg.connection.remote_control_endpoint = "192.168.1.10:3671".to_string();
        cfg.connection.kind = ConnectionKind::Routing;
        cfg.secure.mode = Some(SecureMode::Unicast);
        assert!(cfg.validate_and_normalize().is_err());
    }

    #[test]
    fn load_from_file_resolves_the_path_and_validates() {
        let mut cfg = Config::default();
        cfg.connection.remote_control_endpoint = "192.168.1.10:3671".to_string();
        let yaml = serde_yaml::to_string(&cfg).expect("serialize fixture config");

        let mut path = std::env::temp_dir();
        path.push(format!("knxnetip_core_config_test_{}.yaml", std::process::id()));
        fs::write(&path, yaml).expect("write temp config");

        let loaded = Config::load_from_file(&path).expect("load_from_file should resolve and parse");
        assert_eq!(loaded.connection.remote_control_endpoint, "192.168.1.10:3671");

        fs::remove_file(&path).ok();
    }

    #[test]
    fn load_from_file_rejects_a_missing_path() {
        assert!(Config::load_from_file("definitely/not/a/real/config.yaml").is_err());
    }
}
