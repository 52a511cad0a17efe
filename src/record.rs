// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The log record shape handed from the journal pump to the formatter, and
//! the resolved destination (`Endpoint`) handed from the resolver to the
//! transport layer.

use std::fmt;
use std::net::IpAddr;

/// A timestamp with explicit microsecond precision and a local UTC offset,
/// since RFC 5424 renders both and the journal source hands them over
/// separately rather than as a single `SystemTime`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    /// Seconds since the Unix epoch.
    pub secs: i64,
    /// Microseconds within the second, `0..1_000_000`.
    pub micros: u32,
    /// Local UTC offset in seconds, e.g. `-18000` for US Eastern standard
    /// time.
    pub offset_secs: i32,
}

impl Timestamp {
    pub fn now_utc() -> Self {
        let now = chrono::Utc::now();
        Self {
            secs: now.timestamp(),
            micros: now.timestamp_subsec_micros(),
            offset_secs: 0,
        }
    }

    /// Render as `YYYY-MM-DDTHH:MM:SS.ffffff±HH:MM`, always including
    /// fractional seconds whenever microseconds are available.
    pub fn to_rfc3339_micros(self) -> String {
        use chrono::{FixedOffset, TimeZone};
        let offset = FixedOffset::east_opt(self.offset_secs).unwrap_or_else(|| FixedOffset::east_opt(0).unwrap());
        let dt = offset
            .timestamp_opt(self.secs, self.micros * 1_000)
            .single()
            .unwrap_or_else(|| offset.timestamp_opt(0, 0).unwrap());
        dt.format("%Y-%m-%dT%H:%M:%S%.6f%:z").to_string()
    }
}

/// One journal entry expanded into syslog fields. Immutable; lives only for
/// the duration of one send attempt.
#[derive(Debug, Clone)]
pub struct LogRecord {
    /// 0-7, lower is more severe.
    pub severity: u8,
    /// 0-23.
    pub facility: u8,
    pub identifier: Option<String>,
    /// Non-empty; UTF-8 preferred but not required.
    pub message: Vec<u8>,
    pub hostname: Option<String>,
    pub pid: Option<String>,
    pub timestamp: Timestamp,
    pub structured_data: Option<String>,
    pub msgid: Option<String>,
}

impl LogRecord {
    /// `facility*8 + severity`, the PRI value.
    pub fn pri(&self) -> u16 {
        u16::from(self.facility) * 8 + u16::from(self.severity)
    }
}

/// A resolved destination: IP family, address, port, and the original
/// server name, retained for TLS SNI and certificate validation. Replaced
/// as a whole on reconnect; never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub addr: IpAddr,
    pub port: u16,
    pub server_name: String,
}

impl Endpoint {
    pub fn new(addr: IpAddr, port: u16, server_name: impl Into<String>) -> Self {
        Self {
            addr,
            port,
            server_name: server_name.into(),
        }
    }

    pub fn socket_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.addr, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({})", self.addr, self.port, self.server_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pri_matches_spec_example() {
        // severity 6, facility 1 -> PRI 14
        let record = LogRecord {
            severity: 6,
            facility: 1,
            identifier: Some("app".into()),
            message: b"hello".to_vec(),
            hostname: None,
            pid: Some("42".into()),
            timestamp: Timestamp {
                secs: 1_700_000_000,
                micros: 123_456,
                offset_secs: 0,
            },
            structured_data: None,
            msgid: None,
        };
        assert_eq!(record.pri(), 14);
    }

    #[test]
    fn timestamp_renders_micros_and_offset() {
        let ts = Timestamp {
            secs: 1_700_000_000,
            micros: 123_456,
            offset_secs: 0,
        };
        assert_eq!(ts.to_rfc3339_micros(), "2023-11-14T22:13:20.123456+00:00");
    }

    #[test]
    fn endpoint_builds_socket_addr() {
        let ep = Endpoint::new("127.0.0.1".parse().unwrap(), 9514, "collector.example.com");
        assert_eq!(ep.socket_addr().port(), 9514);
    }
}
