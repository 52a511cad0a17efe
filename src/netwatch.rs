// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Network-change watcher.
//!
//! Polls `/run/systemd/netif/state` on an interval and reports link-up /
//! link-down transitions, debounced so a flapping interface doesn't retrigger
//! reconnects faster than the connection state machine can react.
//!
//! Multiple link events collapse into a single up/down signal, since the
//! forwarder only cares whether *a* route exists, not which interface. The
//! file format is a flat `KEY=VALUE` line scanner, not a full ini parser.

use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkChange {
    pub state: LinkState,
}

/// Operational states considered "up" per `networkd`'s `OPER_STATE` values.
/// Anything else (`off`, `no-carrier`, `dormant`, missing) is treated as
/// down.
fn is_up_state(value: &str) -> bool {
    matches!(value, "routable" | "degraded" | "carrier")
}

pub struct NetworkWatcher {
    path: PathBuf,
    poll_interval: Duration,
    debounce: Duration,
    last_poll: Option<Instant>,
    last_change: Option<Instant>,
    current: LinkState,
}

impl NetworkWatcher {
    pub fn new(path: impl Into<PathBuf>, poll_interval: Duration, debounce: Duration) -> Self {
        Self {
            path: path.into(),
            poll_interval,
            debounce,
            last_poll: None,
            last_change: None,
            current: LinkState::Down,
            // Start Down: the first poll always reports a real state rather
            // than assuming connectivity at startup.
        }
    }

    /// Call on every reactor wakeup. Returns `Some` only when enough time has
    /// passed since the last poll AND the observed state differs from the
    /// current one AND the debounce window since the last reported change has
    /// elapsed. Returns `None` otherwise, including when the state file is
    /// absent or unreadable (treated as a fallback to the parent directory's
    /// absence — i.e. no event, not an error.
    pub fn poll(&mut self, now: Instant) -> Option<NetworkChange> {
        if let Some(last) = self.last_poll {
            if now.duration_since(last) < self.poll_interval {
                return None;
            }
        }
        self.last_poll = Some(now);

        let observed = self.read_state().unwrap_or(LinkState::Down);
        if observed == self.current {
            return None;
        }
        if let Some(last_change) = self.last_change {
            if now.duration_since(last_change) < self.debounce {
                return None;
            }
        }

        self.current = observed;
        self.last_change = Some(now);
        Some(NetworkChange { state: observed })
    }

    fn read_state(&self) -> std::io::Result<LinkState> {
        let contents = std::fs::read_to_string(&self.path)?;
        let oper_state = parse_key_value(&contents, "OPER_STATE");
        Ok(match oper_state {
            Some(v) if is_up_state(&v) => LinkState::Up,
            _ => LinkState::Down,
        })
    }

    pub fn current(&self) -> LinkState {
        self.current
    }
}

fn parse_key_value(contents: &str, key: &str) -> Option<String> {
    contents.lines().find_map(|line| {
        let (k, v) = line.split_once('=')?;
        (k.trim() == key).then(|| v.trim().to_string())
    })
}
