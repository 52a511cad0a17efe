// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Engine-wide error taxonomy.
//!
//! Kinds mirror the semantic categories the connection state machine reacts
//! to: resolve/connect/handshake failures fold into `Backoff`, persistence
//! failures are logged and retried, and `WouldBlock`/`RateLimited` are not
//! represented here at all since they are control flow, not errors.

use std::io;

/// Top-level error type returned by fallible engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Unrecognized option, unusable address family, or a missing required
    /// field. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// DNS lookup failed.
    #[error("resolve failed: {0}")]
    Resolve(#[source] io::Error),

    /// Socket creation or `connect()` failed.
    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),

    /// TLS/DTLS handshake failed. The OpenSSL error string is preserved;
    /// this is always a handshake error, never reclassified.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Peer closed the connection cleanly.
    #[error("transport closed by peer")]
    TransportClosed,

    /// Unexpected I/O error on an established transport.
    #[error("transport error: {0}")]
    TransportBroken(#[source] io::Error),

    /// A plain-transport send did not become writable within its wait.
    #[error("send timed out")]
    Timeout,

    /// Cursor state file could not be written. Non-fatal: logged and
    /// retried on the next flush.
    #[error("cursor persist failed: {0}")]
    Persist(#[source] io::Error),
}

impl EngineError {
    /// True for the subset of errors that should drive the connection state
    /// machine into `Backoff`. `Config`/`Persist` never do.
    pub fn drives_backoff(&self) -> bool {
        matches!(
            self,
            EngineError::Resolve(_)
                | EngineError::Connect(_)
                | EngineError::Handshake(_)
                | EngineError::TransportClosed
                | EngineError::TransportBroken(_)
                | EngineError::Timeout
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_and_persist_do_not_drive_backoff() {
        assert!(!EngineError::Config("bad".into()).drives_backoff());
        assert!(!EngineError::Persist(io::Error::other("disk full")).drives_backoff());
    }

    #[test]
    fn transport_errors_drive_backoff() {
        assert!(EngineError::TransportClosed.drives_backoff());
        assert!(EngineError::Timeout.drives_backoff());
        assert!(EngineError::Handshake("x509 verify failed".into()).drives_backoff());
    }
}
