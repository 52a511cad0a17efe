// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! RFC 5424 and legacy RFC 3339 message formatters.
//!
//! Builds each message as a gather list so the transport layer can hand the
//! pieces straight to a vectored write instead of forcing an allocation per
//! message.

use crate::record::LogRecord;
use std::borrow::Cow;

/// Which of the two wire formats to render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Rfc5424,
    /// The legacy `<PRI>TIMESTAMP HOST APP[PID]: MSG` layout.
    Rfc3339,
}

const NIL: &str = "-";

/// An ordered sequence of byte slices treated as one logical message
/// ("gather list"). `render` flattens it; transports that
/// can write vectored should prefer `parts()` directly.
pub struct Framed {
    parts: Vec<Cow<'static, str>>,
}

impl Framed {
    fn new() -> Self {
        Self { parts: Vec::with_capacity(16) }
    }

    fn push(&mut self, s: impl Into<Cow<'static, str>>) {
        self.parts.push(s.into());
    }

    pub fn parts(&self) -> &[Cow<'static, str>] {
        &self.parts
    }

    /// Flatten into one buffer. Secure transports coalesce before writing
    /// secure transports coalesce before writing; this is that flattening step.
    pub fn to_bytes(&self) -> Vec<u8> {
        let total: usize = self.parts.iter().map(|p| p.len()).sum();
        let mut out = Vec::with_capacity(total);
        for p in &self.parts {
            out.extend_from_slice(p.as_bytes());
        }
        out
    }
}

/// Render `record` into the given format. `structured_data_override`, when
/// present, wins over the record's own structured-data block (SD defaults
/// to the manager's configured override, then the record's own, then NIL).
/// `framed` appends a trailing `\n` for
/// stream transports (TCP/TLS); datagram transports (UDP/DTLS) pass `false`
/// and rely on datagram boundaries.
pub fn format(
    record: &LogRecord,
    format: LogFormat,
    structured_data_override: Option<&str>,
    framed: bool,
) -> Framed {
    match format {
        LogFormat::Rfc5424 => format_5424(record, structured_data_override, framed),
        LogFormat::Rfc3339 => format_3339(record, framed),
    }
}

fn format_5424(record: &LogRecord, sd_override: Option<&str>, framed: bool) -> Framed {
    let mut out = Framed::new();
    out.push(format!("<{}>1 ", record.pri()));
    out.push(record.timestamp.to_rfc3339_micros());
    out.push(" ");
    out.push(nil_or(record.hostname.as_deref()));
    out.push(" ");
    out.push(nil_or(record.identifier.as_deref()));
    out.push(" ");
    out.push(nil_or(record.pid.as_deref()));
    out.push(" ");
    out.push(nil_or(record.msgid.as_deref()));
    out.push(" ");
    let sd = sd_override.or(record.structured_data.as_deref());
    out.push(nil_or(sd));
    out.push(" ");
    out.push(String::from_utf8_lossy(&record.message).into_owned());
    if framed {
        out.push("\n");
    }
    out
}

fn format_3339(record: &LogRecord, framed: bool) -> Framed {
    // <PRI>TIMESTAMP HOST APP[PID]: MSG
    let mut out = Framed::new();
    out.push(format!("<{}>", record.pri()));
    out.push(record.timestamp.to_rfc3339_micros());
    out.push(" ");
    out.push(nil_or(record.hostname.as_deref()));
    out.push(" ");
    let app = record.identifier.as_deref().unwrap_or(NIL);
    match record.pid.as_deref() {
        Some(pid) => out.push(format!("{}[{}]: ", app, pid)),
        None => out.push(format!("{}: ", app)),
    }
    out.push(String::from_utf8_lossy(&record.message).into_owned());
    if framed {
        out.push("\n");
    }
    out
}

fn nil_or(value: Option<&str>) -> Cow<'static, str> {
    match value {
        Some(v) if !v.is_empty() => Cow::Owned(v.to_string()),
        _ => Cow::Borrowed(NIL),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Timestamp;

    fn sample() -> LogRecord {
        LogRecord {
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
        }
    }

    #[test]
    fn s1_udp_happy_path_matches_spec() {
        let framed = format(&sample(), LogFormat::Rfc5424, None, false);
        let rendered = String::from_utf8(framed.to_bytes()).unwrap();
        assert_eq!(
            rendered,
            "<14>1 2023-11-14T22:13:20.123456+00:00 - app 42 - - hello"
        );
    }

    #[test]
    fn s2_tcp_framing_appends_newline() {
        let framed = format(&sample(), LogFormat::Rfc5424, None, true);
        let rendered = String::from_utf8(framed.to_bytes()).unwrap();
        assert!(rendered.ends_with('\n'));
        assert!(rendered.trim_end_matches('\n').ends_with("hello"));
    }

    #[test]
    fn structured_data_override_wins_over_record() {
        let mut record = sample();
        record.structured_data = Some("[record@1 x=\"1\"]".into());
        let framed = format(&record, LogFormat::Rfc5424, Some("[override@1 y=\"2\"]"), false);
        let rendered = String::from_utf8(framed.to_bytes()).unwrap();
        assert!(rendered.contains("[override@1 y=\"2\"]"));
        assert!(!rendered.contains("record@1"));
    }

    #[test]
    fn missing_optionals_degrade_to_nil() {
        let mut record = sample();
        record.identifier = None;
        record.pid = None;
        record.msgid = None;
        let framed = format(&record, LogFormat::Rfc5424, None, false);
        let rendered = String::from_utf8(framed.to_bytes()).unwrap();
        assert_eq!(
            rendered,
            "<14>1 2023-11-14T22:13:20.123456+00:00 - - - - - hello"
        );
    }

    #[test]
    fn rfc3339_legacy_layout() {
        let framed = format(&sample(), LogFormat::Rfc3339, None, true);
        let rendered = String::from_utf8(framed.to_bytes()).unwrap();
        assert!(rendered.starts_with("<14>2023-11-14T22:13:20.123456+00:00 - app[42]: hello"));
        assert!(rendered.ends_with('\n'));
    }

    #[test]
    fn round_trip_rfc5424_fields_survive() {
        // re-parse a rendered message and recover its fields.
        let framed = format(&sample(), LogFormat::Rfc5424, None, false);
        let rendered = String::from_utf8(framed.to_bytes()).unwrap();
        let after_pri = rendered.splitn(2, '>').nth(1).unwrap();
        let fields: Vec<&str> = after_pri.splitn(8, ' ').collect();
        // VERSION TIMESTAMP HOST APP PROCID MSGID SD MSG
        assert_eq!(fields[0], "1");
        assert_eq!(fields[3], "app");
        assert_eq!(fields[4], "42");
        assert_eq!(fields[7], "hello");
    }
}
