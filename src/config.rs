// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Manager configuration.

use crate::error::EngineError;
use crate::formatter::LogFormat;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// Wire protocol used to reach the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Udp,
    Tcp,
    Dtls,
    Tls,
}

impl Protocol {
    fn parse(s: &str) -> Result<Self, EngineError> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(Protocol::Udp),
            "tcp" => Ok(Protocol::Tcp),
            "dtls" => Ok(Protocol::Dtls),
            "tls" => Ok(Protocol::Tls),
            other => Err(EngineError::Config(format!("unknown protocol {other:?}"))),
        }
    }

    pub fn is_datagram(self) -> bool {
        matches!(self, Protocol::Udp | Protocol::Dtls)
    }

    pub fn is_secure(self) -> bool {
        matches!(self, Protocol::Dtls | Protocol::Tls)
    }
}

/// Peer certificate verification policy for TLS/DTLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// Verify the peer certificate against the system trust store.
    Certificate,
    /// Skip verification entirely (testing only).
    None,
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    // === Destination ===
    pub server: String,
    pub port: u16,
    pub protocol: Protocol,

    // === Wire format ===
    pub log_format: LogFormat,
    pub structured_data: Option<String>,

    // === Security ===
    pub auth_mode: AuthMode,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
    pub ca_path: Option<String>,

    // === Identity ===
    pub namespace: Option<String>,

    // === Persistence ===
    pub state_file: String,

    // === Connection ===
    pub connection_retry: Duration,
    pub keepalive: bool,
    pub keepalive_time: Duration,
    pub keepalive_interval: Duration,
    pub keepalive_count: u32,
    pub no_delay: bool,
    pub send_buffer: usize,

    // === Rate limiting ===
    pub rate_limit_interval: Duration,
    pub rate_limit_burst: u32,

    // === Bind ===
    pub bind_address: Option<IpAddr>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            port: 514, // default for UDP/TCP; 6514 (IANA syslog-tls) for TLS/DTLS
            protocol: Protocol::Udp,

            log_format: LogFormat::Rfc5424,
            structured_data: None,

            auth_mode: AuthMode::Certificate,
            cert_path: None,
            key_path: None,
            ca_path: None,

            namespace: None,

            state_file: "/var/lib/netlogd/state".to_string(),

            connection_retry: Duration::from_secs(30), // doubled on repeated failure, capped at 10x
            keepalive: true,
            keepalive_time: Duration::from_secs(60), // TCP_KEEPIDLE
            keepalive_interval: Duration::from_secs(60), // TCP_KEEPINTVL
            keepalive_count: 9, // TCP_KEEPCNT
            no_delay: true,
            send_buffer: 0, // OS default

            rate_limit_interval: Duration::from_secs(30),
            rate_limit_burst: 10_000,

            bind_address: None,
        }
    }
}

impl ManagerConfig {
    pub fn with_server(mut self, server: impl Into<String>, port: u16) -> Self {
        self.server = server.into();
        self.port = port;
        self
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_state_file(mut self, path: impl Into<String>) -> Self {
        self.state_file = path.into();
        self
    }

    /// Apply a `KEY=VALUE` file on top of the current defaults. Unknown keys
    /// are ignored rather than rejected, since the same file format is used
    /// for the cursor state file and future keys should not break old
    /// configs.
    pub fn load_file(mut self, path: &Path) -> Result<Self, EngineError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("reading {}: {e}", path.display())))?;
        let map = parse_key_value(&contents);

        if let Some(v) = map.get("SERVER") {
            self.server = v.clone();
        }
        if let Some(v) = map.get("PORT") {
            self.port = v
                .parse()
                .map_err(|_| EngineError::Config(format!("invalid PORT {v:?}")))?;
        }
        if let Some(v) = map.get("PROTOCOL") {
            self.protocol = Protocol::parse(v)?;
        }
        if let Some(v) = map.get("LOGFORMAT") {
            self.log_format = match v.to_ascii_lowercase().as_str() {
                "rfc5424" => LogFormat::Rfc5424,
                "rfc3339" => LogFormat::Rfc3339,
                other => return Err(EngineError::Config(format!("unknown LogFormat {other:?}"))),
            };
        }
        if let Some(v) = map.get("STRUCTUREDDATA") {
            self.structured_data = Some(v.clone());
        }
        if let Some(v) = map.get("NAMESPACE") {
            self.namespace = Some(v.clone());
        }
        if let Some(v) = map.get("STATEFILE") {
            self.state_file = v.clone();
        }
        if let Some(v) = map.get("CERT") {
            self.cert_path = Some(v.clone());
        }
        if let Some(v) = map.get("KEY") {
            self.key_path = Some(v.clone());
        }
        if let Some(v) = map.get("CACERT") {
            self.ca_path = Some(v.clone());
        }
        if let Some(v) = map.get("CONNECTIONRETRYUSEC") {
            let usec: u64 = v
                .parse()
                .map_err(|_| EngineError::Config(format!("invalid ConnectionRetryUSec {v:?}")))?;
            self.connection_retry = Duration::from_micros(usec);
        }
        if let Some(v) = map.get("KEEPALIVE") {
            self.keepalive = parse_bool(v)?;
        }
        if let Some(v) = map.get("KEEPALIVETIMEUSEC") {
            self.keepalive_time = Duration::from_micros(parse_usec(v)?);
        }
        if let Some(v) = map.get("KEEPALIVEINTERVALUSEC") {
            self.keepalive_interval = Duration::from_micros(parse_usec(v)?);
        }
        if let Some(v) = map.get("KEEPALIVECOUNT") {
            self.keepalive_count = v
                .parse()
                .map_err(|_| EngineError::Config(format!("invalid KeepAliveCount {v:?}")))?;
        }
        if let Some(v) = map.get("NODELAY") {
            self.no_delay = parse_bool(v)?;
        }
        if let Some(v) = map.get("SENDBUFFER") {
            self.send_buffer = v
                .parse()
                .map_err(|_| EngineError::Config(format!("invalid SendBuffer {v:?}")))?;
        }

        Ok(self)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.server.is_empty() {
            return Err(EngineError::Config("Server is required".into()));
        }
        if self.protocol.is_secure() && self.auth_mode == AuthMode::Certificate {
            if self.ca_path.is_none() {
                return Err(EngineError::Config(
                    "CACert is required when AuthMode=Certificate".into(),
                ));
            }
        }
        Ok(())
    }
}

fn parse_bool(v: &str) -> Result<bool, EngineError> {
    match v.to_ascii_lowercase().as_str() {
        "yes" | "true" | "1" | "on" => Ok(true),
        "no" | "false" | "0" | "off" => Ok(false),
        other => Err(EngineError::Config(format!("invalid boolean {other:?}"))),
    }
}

fn parse_usec(v: &str) -> Result<u64, EngineError> {
    v.parse().map_err(|_| EngineError::Config(format!("invalid microsecond value {v:?}")))
}

fn parse_key_value(contents: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            map.insert(key.trim().to_ascii_uppercase(), value.trim().to_string());
        }
    }
    map
}
