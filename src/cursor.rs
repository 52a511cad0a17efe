// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Cursor tracker: persists the last forwarded journal position so a
//! restart resumes roughly where it left off, for at-least-once delivery.
//!
//! The write discipline — write to a temp file, then rename over the real
//! path — means a crash mid-write can never leave a truncated or
//! partially-written state file behind.

use crate::error::EngineError;
use std::path::{Path, PathBuf};

/// Tracks three positions: the last record read from the journal, the last
/// one confirmed sent, and the one durably on disk. `sent` never leads
/// `read`; `persisted` never leads `sent`.
pub struct CursorTracker {
    path: PathBuf,
    read: Option<String>,
    sent: Option<String>,
    persisted: Option<String>,
}

impl CursorTracker {
    /// Load the persisted cursor, if any, from `path`. A missing file is not
    /// an error — it just means a fresh start with no cursor.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let path = path.into();
        let persisted = match std::fs::read_to_string(&path) {
            Ok(contents) => parse_cursor_line(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(EngineError::Persist(e)),
        };
        Ok(Self {
            path,
            read: persisted.clone(),
            sent: persisted.clone(),
            persisted,
        })
    }

    pub fn persisted(&self) -> Option<&str> {
        self.persisted.as_deref()
    }

    /// Call after a record is pulled from the journal, before it's sent.
    pub fn record_read(&mut self, cursor: impl Into<String>) {
        self.read = Some(cursor.into());
    }

    /// Call only after the transport confirms the record was written
    /// Advances only after the send actually succeeds, never before.
    pub fn record_sent(&mut self) {
        self.sent = self.read.clone();
    }

    /// Write `sent` to disk if it has advanced past what's already
    /// persisted. Returns whether a write happened.
    pub fn flush(&mut self) -> Result<bool, EngineError> {
        if self.sent == self.persisted {
            return Ok(false);
        }
        let Some(cursor) = self.sent.clone() else {
            return Ok(false);
        };
        write_atomic(&self.path, &cursor).map_err(EngineError::Persist)?;
        self.persisted = Some(cursor);
        Ok(true)
    }
}

fn parse_cursor_line(contents: &str) -> Option<String> {
    contents
        .lines()
        .find_map(|line| line.strip_prefix("LAST_CURSOR="))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn write_atomic(path: &Path, cursor: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, format!("LAST_CURSOR={cursor}\n"))?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}
