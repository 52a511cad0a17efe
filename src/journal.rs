// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The journal source contract, a token-bucket rate limiter, and the
//! Journal Pump that ties a `JournalSource` to the formatter, transport, and
//! cursor tracker.
//!
//! The pump is readiness-driven: pull one record, rate-limit it, format it,
//! send it, advance the cursor, loop.

use crate::config::ManagerConfig;
use crate::cursor::CursorTracker;
use crate::error::EngineError;
use crate::formatter::{self, LogFormat};
use crate::record::LogRecord;
use crate::transport::{SendOutcome, Transport};
use std::collections::VecDeque;
use std::io::{self, BufRead};
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

/// The real journal reader is an external collaborator out of scope here;
/// this trait is what the pump depends on so tests can exercise it without
/// journald.
pub trait JournalSource {
    /// Resume from `cursor`, or from the start if `None`.
    fn seek(&mut self, cursor: Option<&str>) -> io::Result<()>;
    /// Pull the next record, if one is available without blocking.
    fn next_record(&mut self) -> io::Result<Option<(String, LogRecord)>>;
    /// The fd to register for readiness, or `-1` if this source has no
    /// meaningful one and should instead be polled on a timer (true of both
    /// implementations here — tailing a regular file isn't select()able any
    /// more usefully than an in-memory queue is).
    fn as_raw_fd(&self) -> RawFd;
}

/// A `VecDeque`-backed source for unit tests.
#[derive(Default)]
pub struct InMemoryJournal {
    records: VecDeque<(String, LogRecord)>,
}

impl InMemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, cursor: impl Into<String>, record: LogRecord) {
        self.records.push_back((cursor.into(), record));
    }
}

impl JournalSource for InMemoryJournal {
    fn seek(&mut self, cursor: Option<&str>) -> io::Result<()> {
        if let Some(cursor) = cursor {
            while let Some((front, _)) = self.records.front() {
                if front == cursor {
                    self.records.pop_front();
                    break;
                }
                self.records.pop_front();
            }
        }
        Ok(())
    }

    fn next_record(&mut self) -> io::Result<Option<(String, LogRecord)>> {
        Ok(self.records.pop_front())
    }

    fn as_raw_fd(&self) -> RawFd {
        -1
    }
}

/// Tails a newline-delimited record file: each line is
/// `cursor\tseverity\tfacility\tidentifier\tmessage`, used by the example
/// binary and integration tests in place of journald.
pub struct FileJournal {
    reader: io::BufReader<std::fs::File>,
}

impl FileJournal {
    pub fn open(path: &std::path::Path) -> io::Result<Self> {
        let file = std::fs::File::open(path)?;
        Ok(Self { reader: io::BufReader::new(file) })
    }
}

impl JournalSource for FileJournal {
    fn seek(&mut self, cursor: Option<&str>) -> io::Result<()> {
        if cursor.is_none() {
            return Ok(());
        }
        // Skip lines up to and including the persisted cursor; anything
        // already-acknowledged should not be re-sent on restart.
        let target = cursor.unwrap().to_string();
        loop {
            let mut line = String::new();
            let n = self.reader.read_line(&mut line)?;
            if n == 0 {
                break;
            }
            if let Some((this_cursor, _)) = line.split_once('\t') {
                if this_cursor == target {
                    break;
                }
            }
        }
        Ok(())
    }

    fn next_record(&mut self) -> io::Result<Option<(String, LogRecord)>> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line)?;
        if n == 0 {
            return Ok(None);
        }
        let line = line.trim_end_matches('\n');
        parse_tab_record(line)
            .map(Some)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed journal record"))
    }

    fn as_raw_fd(&self) -> RawFd {
        use std::os::unix::io::AsRawFd;
        self.reader.get_ref().as_raw_fd()
    }
}

fn parse_tab_record(line: &str) -> Option<(String, LogRecord)> {
    let mut fields = line.splitn(5, '\t');
    let cursor = fields.next()?.to_string();
    let severity: u8 = fields.next()?.parse().ok()?;
    let facility: u8 = fields.next()?.parse().ok()?;
    let identifier = fields.next()?.to_string();
    let message = fields.next()?.to_string();
    let record = LogRecord {
        severity,
        facility,
        identifier: (!identifier.is_empty()).then_some(identifier),
        message: message.into_bytes(),
        hostname: None,
        pid: None,
        timestamp: crate::record::Timestamp::now_utc(),
        structured_data: None,
        msgid: None,
    };
    Some((cursor, record))
}

/// Token bucket: `burst` tokens refill one at a time every
/// `interval/burst`, capped at `burst`.
pub struct RateLimiter {
    burst: u32,
    refill_period: Duration,
    tokens: u32,
    last_refill: Instant,
    suppressed: u64,
}

impl RateLimiter {
    pub fn new(interval: Duration, burst: u32, now: Instant) -> Self {
        let burst = burst.max(1);
        Self {
            burst,
            refill_period: interval / burst,
            tokens: burst,
            last_refill: now,
            suppressed: 0,
        }
    }

    fn refill(&mut self, now: Instant) {
        if self.refill_period.is_zero() {
            self.tokens = self.burst;
            return;
        }
        let elapsed = now.saturating_duration_since(self.last_refill);
        let gained = (elapsed.as_nanos() / self.refill_period.as_nanos().max(1)) as u32;
        if gained > 0 {
            self.tokens = self.burst.min(self.tokens + gained);
            self.last_refill = now;
        }
    }

    pub fn try_acquire(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            self.suppressed += 1;
            false
        }
    }

    /// Drain the suppressed count. The caller logs it exactly once, the
    /// next time a token becomes available.
    pub fn take_suppressed(&mut self) -> u64 {
        std::mem::take(&mut self.suppressed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpOutcome {
    /// A record was sent and the cursor advanced.
    Sent,
    /// No record was available right now.
    Idle,
    /// A record exists but the transport isn't ready yet; nothing was
    /// consumed from the journal — a would-block keeps the current record
    /// un-advanced.
    TransportNotReady,
    /// A record was dropped by the rate limiter.
    RateLimited,
}

pub struct JournalPump<J: JournalSource> {
    source: J,
    cursor: CursorTracker,
    limiter: RateLimiter,
    format: LogFormat,
    structured_data: Option<String>,
    framed: bool,
    /// A record pulled from the source but not yet successfully sent; kept
    /// here so a `WouldBlock` doesn't lose it.
    pending: Option<(String, LogRecord)>,
}

impl<J: JournalSource> JournalPump<J> {
    pub fn new(mut source: J, cursor: CursorTracker, config: &ManagerConfig, framed: bool, now: Instant) -> io::Result<Self> {
        source.seek(cursor.persisted())?;
        Ok(Self {
            source,
            cursor,
            limiter: RateLimiter::new(config.rate_limit_interval, config.rate_limit_burst, now),
            format: config.log_format,
            structured_data: config.structured_data.clone(),
            framed,
            pending: None,
        })
    }

    pub fn cursor(&self) -> &CursorTracker {
        &self.cursor
    }

    pub fn cursor_mut(&mut self) -> &mut CursorTracker {
        &mut self.cursor
    }

    /// Advance the pump by one record. `transport_ready` reflects the
    /// connection state machine's current state (only `Ready` accepts
    /// writes); `transport` is `None` when there is nothing connected yet.
    pub fn pump_once(
        &mut self,
        now: Instant,
        transport_ready: bool,
        transport: Option<&mut dyn Transport>,
    ) -> Result<PumpOutcome, EngineError> {
        if self.pending.is_none() {
            match self.source.next_record().map_err(EngineError::TransportBroken)? {
                Some(item) => self.pending = Some(item),
                None => return Ok(PumpOutcome::Idle),
            }
        }

        if !self.limiter.try_acquire(now) {
            // Drop the pending record; it still advances `read` (the record
            // existed and was seen) but never `sent`.
            if let Some((cursor, _)) = self.pending.take() {
                self.cursor.record_read(cursor);
            }
            return Ok(PumpOutcome::RateLimited);
        }

        // A token just became available again after one or more drops:
        // Report the suppressed count exactly once here, the first time a
        // token becomes available again.
        let suppressed = self.limiter.take_suppressed();
        if suppressed > 0 {
            tracing::warn!(suppressed, "rate limit suppressed messages");
        }

        if !transport_ready || transport.is_none() {
            return Ok(PumpOutcome::TransportNotReady);
        }
        let transport = transport.unwrap();

        let (cursor, record) = self.pending.take().expect("checked above");
        self.cursor.record_read(cursor.clone());

        let framed = formatter::format(&record, self.format, self.structured_data.as_deref(), self.framed);
        match transport.send(framed.parts()) {
            Ok(SendOutcome::Sent) => {
                self.cursor.record_sent();
                Ok(PumpOutcome::Sent)
            }
            Ok(SendOutcome::WouldBlock) => {
                // Put it back: do not advance `sent`, and re-attempt this
                // exact record next time instead of pulling a new one.
                self.pending = Some((cursor, record));
                Ok(PumpOutcome::TransportNotReady)
            }
            Err(e) => {
                self.pending = Some((cursor, record));
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Timestamp;
    use crate::transport::SendOutcome;
    use tempfile::TempDir;

    fn record(n: u8) -> LogRecord {
        LogRecord {
            severity: 6,
            facility: 1,
            identifier: Some("app".into()),
            message: format!("msg {n}").into_bytes(),
            hostname: None,
            pid: None,
            timestamp: Timestamp { secs: 1_700_000_000, micros: 0, offset_secs: 0 },
            structured_data: None,
            msgid: None,
        }
    }

    struct AlwaysSends;
    impl Transport for AlwaysSends {
        fn send(&mut self, _parts: &[std::borrow::Cow<'_, str>]) -> Result<SendOutcome, EngineError> {
            Ok(SendOutcome::Sent)
        }
        fn is_ready(&self) -> bool {
            true
        }
    }

    struct AlwaysBlocks;
    impl Transport for AlwaysBlocks {
        fn send(&mut self, _parts: &[std::borrow::Cow<'_, str>]) -> Result<SendOutcome, EngineError> {
            Ok(SendOutcome::WouldBlock)
        }
        fn is_ready(&self) -> bool {
            true
        }
    }

    fn make_pump(dir: &TempDir) -> JournalPump<InMemoryJournal> {
        let mut source = InMemoryJournal::new();
        source.push("c1", record(1));
        source.push("c2", record(2));
        let cursor = CursorTracker::load(dir.path().join("state")).unwrap();
        let config = ManagerConfig::default();
        JournalPump::new(source, cursor, &config, false, Instant::now()).unwrap()
    }

    #[test]
    fn sends_and_advances_cursor() {
        let dir = TempDir::new().unwrap();
        let mut pump = make_pump(&dir);
        let mut transport = AlwaysSends;
        let outcome = pump.pump_once(Instant::now(), true, Some(&mut transport)).unwrap();
        assert_eq!(outcome, PumpOutcome::Sent);
        pump.cursor_mut().flush().unwrap();
        assert_eq!(pump.cursor().persisted(), Some("c1"));
    }

    #[test]
    fn would_block_keeps_record_pending_not_advanced() {
        let dir = TempDir::new().unwrap();
        let mut pump = make_pump(&dir);
        let mut transport = AlwaysBlocks;
        let outcome = pump.pump_once(Instant::now(), true, Some(&mut transport)).unwrap();
        assert_eq!(outcome, PumpOutcome::TransportNotReady);
        assert_eq!(pump.cursor().persisted(), None);

        // Retrying with a working transport sends the SAME record (c1), not
        // a new one.
        let mut ok = AlwaysSends;
        let outcome = pump.pump_once(Instant::now(), true, Some(&mut ok)).unwrap();
        assert_eq!(outcome, PumpOutcome::Sent);
        pump.cursor_mut().flush().unwrap();
        assert_eq!(pump.cursor().persisted(), Some("c1"));
    }

    #[test]
    fn not_ready_does_not_consume_the_journal() {
        let dir = TempDir::new().unwrap();
        let mut pump = make_pump(&dir);
        let outcome = pump.pump_once(Instant::now(), false, None).unwrap();
        assert_eq!(outcome, PumpOutcome::TransportNotReady);
        assert_eq!(pump.cursor().persisted(), None);
    }

    #[test]
    fn idle_when_journal_empty() {
        let dir = TempDir::new().unwrap();
        let source = InMemoryJournal::new();
        let cursor = CursorTracker::load(dir.path().join("state")).unwrap();
        let config = ManagerConfig::default();
        let mut pump = JournalPump::new(source, cursor, &config, false, Instant::now()).unwrap();
        let mut transport = AlwaysSends;
        assert_eq!(pump.pump_once(Instant::now(), true, Some(&mut transport)).unwrap(), PumpOutcome::Idle);
    }

    #[test]
    fn rate_limiter_refills_over_time() {
        let now = Instant::now();
        let mut limiter = RateLimiter::new(Duration::from_secs(10), 2, now);
        assert!(limiter.try_acquire(now));
        assert!(limiter.try_acquire(now));
        assert!(!limiter.try_acquire(now)); // exhausted
        assert_eq!(limiter.take_suppressed(), 1);

        let later = now + Duration::from_secs(6); // one refill period (5s) has passed
        assert!(limiter.try_acquire(later));
    }

    #[test]
    fn file_journal_round_trips_a_record() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.tsv");
        std::fs::write(&path, "c1\t6\t1\tapp\thello world\n").unwrap();
        let mut journal = FileJournal::open(&path).unwrap();
        let (cursor, record) = journal.next_record().unwrap().unwrap();
        assert_eq!(cursor, "c1");
        assert_eq!(record.severity, 6);
        assert_eq!(record.message, b"hello world");
        assert!(journal.next_record().unwrap().is_none());
    }
}
