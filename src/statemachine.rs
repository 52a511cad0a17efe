// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection state machine and the `Manager` that drives it.
//!
//! `Manager` is event-driven: react to a readiness/timer event, transition,
//! re-arm, on every `mio::Poll::poll` wakeup.

use crate::netwatch::{LinkState, NetworkChange};
use crate::resolver::Resolution;
use crate::transport::handle::TransportHandle;
use rand::Rng;
use std::time::{Duration, Instant};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Resolving,
    Connecting,
    Handshaking,
    Ready,
    Draining,
    Backoff,
    Closed,
}

impl ConnectionState {
    pub fn is_operational(&self) -> bool {
        matches!(self, ConnectionState::Ready)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed)
    }

    pub fn is_establishing(&self) -> bool {
        matches!(
            self,
            ConnectionState::Resolving | ConnectionState::Connecting | ConnectionState::Handshaking
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Idle => "Idle",
            ConnectionState::Resolving => "Resolving",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Handshaking => "Handshaking",
            ConnectionState::Ready => "Ready",
            ConnectionState::Draining => "Draining",
            ConnectionState::Backoff => "Backoff",
            ConnectionState::Closed => "Closed",
        };
        write!(f, "{s}")
    }
}

/// Jittered exponential backoff: doubles on every failure, capped at `10x`
/// the configured base, reset back to `1x` after a connection has stayed
/// `Ready` for `reset_window`.
pub struct BackoffPolicy {
    base: Duration,
    multiplier: u32,
    ready_since: Option<Instant>,
    reset_window: Duration,
}

const MAX_MULTIPLIER: u32 = 10;

impl BackoffPolicy {
    pub fn new(base: Duration) -> Self {
        Self {
            base,
            multiplier: 1,
            ready_since: None,
            reset_window: Duration::from_secs(30),
        }
    }

    /// Call when the state machine enters `Ready`.
    pub fn on_ready(&mut self, now: Instant) {
        self.ready_since = Some(now);
    }

    /// Call on every tick while in `Ready`; resets the multiplier once the
    /// connection has proven stable for `reset_window`.
    pub fn observe_ready(&mut self, now: Instant) {
        if let Some(since) = self.ready_since {
            if now.duration_since(since) >= self.reset_window {
                self.multiplier = 1;
            }
        }
    }

    /// Call when a failure (resolve/connect/handshake/transport error)
    /// drives the machine into `Backoff`. Returns the delay to wait before
    /// the next attempt, with +/-20% jitter so many restarted instances
    /// don't all retry in lockstep.
    pub fn next_delay(&mut self, now: Instant, rng: &mut impl Rng) -> Duration {
        self.ready_since = None;
        let delay = self.base * self.multiplier;
        self.multiplier = (self.multiplier * 2).min(MAX_MULTIPLIER);
        let jitter_frac = rng.gen_range(-0.2..=0.2);
        let jittered_nanos = (delay.as_nanos() as f64 * (1.0 + jitter_frac)).max(0.0);
        let _ = now;
        Duration::from_nanos(jittered_nanos as u64)
    }
}

/// Drives one connection attempt through resolve -> connect -> handshake ->
/// ready -> (backoff|drain) -> closed, reacting to resolver completions,
/// transport readiness, and network-change events.
/// DTLS's handshake has no TCP-level connect to bound its retries, so it
/// gets its own 3s ceiling on the underlying socket's receive timeout;
/// TLS's handshake is bounded by the underlying TCP connection instead and
/// is not subject to this deadline.
const DTLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);

pub struct Manager {
    state: ConnectionState,
    backoff: BackoffPolicy,
    backoff_deadline: Option<Instant>,
    transport: Option<TransportHandle>,
    pending_resolve_id: Option<u64>,
    handshake_deadline: Option<Instant>,
}

impl Manager {
    pub fn new(retry_base: Duration) -> Self {
        Self {
            state: ConnectionState::Idle,
            backoff: BackoffPolicy::new(retry_base),
            backoff_deadline: None,
            transport: None,
            pending_resolve_id: None,
            handshake_deadline: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn transport(&mut self) -> Option<&mut TransportHandle> {
        self.transport.as_mut()
    }

    /// Begin (or resume) connecting: `Idle`/`Backoff` -> `Resolving`.
    pub fn start(&mut self, resolve_id: u64) {
        self.state = ConnectionState::Resolving;
        self.pending_resolve_id = Some(resolve_id);
    }

    /// Feed a resolver completion matching `pending_resolve_id`; stale
    /// completions (from a superseded attempt) are ignored.
    pub fn on_resolution(&mut self, resolution: &Resolution, now: Instant, rng: &mut impl Rng) -> ResolutionAction {
        let id = match resolution {
            Resolution::Resolved { id, .. } => *id,
            Resolution::Failed { id, .. } => *id,
        };
        if self.pending_resolve_id != Some(id) {
            return ResolutionAction::Ignored;
        }
        match resolution {
            Resolution::Resolved { endpoints, .. } if !endpoints.is_empty() => {
                self.state = ConnectionState::Connecting;
                ResolutionAction::Connect(endpoints[0].clone())
            }
            _ => {
                self.enter_backoff(now, rng);
                ResolutionAction::Ignored
            }
        }
    }

    /// A socket has been created for this attempt (connect may still be
    /// in-flight for TCP-backed transports) -> `Connecting`.
    pub fn begin_connecting(&mut self, handle: TransportHandle) {
        self.transport = Some(handle);
        self.state = ConnectionState::Connecting;
    }

    /// The underlying connect finished: `Handshaking` for secure
    /// transports, straight to `Ready` for plain ones.
    pub fn on_connect_complete(&mut self, now: Instant) {
        let is_dtls = matches!(self.transport, Some(TransportHandle::Dtls(_)));
        let secure = self.transport.as_ref().is_some_and(TransportHandle::is_secure);
        self.state = if secure { ConnectionState::Handshaking } else { ConnectionState::Ready };
        if self.state == ConnectionState::Ready {
            self.backoff.on_ready(now);
        } else if is_dtls {
            self.handshake_deadline = Some(now + DTLS_HANDSHAKE_TIMEOUT);
        }
    }

    pub fn on_handshake_complete(&mut self, now: Instant) {
        if self.state == ConnectionState::Handshaking {
            self.handshake_deadline = None;
            self.state = ConnectionState::Ready;
            self.backoff.on_ready(now);
        }
    }

    /// Any failure in Resolving/Connecting/Handshaking/Ready -> `Backoff`.
    pub fn on_failure(&mut self, now: Instant, rng: &mut impl Rng) {
        self.enter_backoff(now, rng);
    }

    fn enter_backoff(&mut self, now: Instant, rng: &mut impl Rng) {
        self.transport = None;
        self.pending_resolve_id = None;
        self.handshake_deadline = None;
        let delay = self.backoff.next_delay(now, rng);
        self.backoff_deadline = Some(now + delay);
        self.state = ConnectionState::Backoff;
    }

    /// Call once per reactor loop iteration. Returns `true` when the backoff
    /// timer has expired and a new attempt should begin (the caller then
    /// calls `start` with a fresh resolve id).
    ///
    /// Also enforces the DTLS handshake deadline: if a DTLS handshake has
    /// been stuck in `Handshaking` past `DTLS_HANDSHAKE_TIMEOUT` with no
    /// progress, treat it the same as a handshake error and fall back to
    /// `Backoff`, the same as any other handshake error.
    pub fn tick(&mut self, now: Instant, rng: &mut impl Rng) -> bool {
        if self.state == ConnectionState::Ready {
            self.backoff.observe_ready(now);
        }
        if self.state == ConnectionState::Handshaking {
            if let Some(deadline) = self.handshake_deadline {
                if now >= deadline {
                    self.enter_backoff(now, rng);
                    return false;
                }
            }
        }
        match (self.state, self.backoff_deadline) {
            (ConnectionState::Backoff, Some(deadline)) if now >= deadline => {
                self.backoff_deadline = None;
                true
            }
            _ => false,
        }
    }

    /// Network-change watcher feed: link-down while `Ready` closes the
    /// connection immediately and returns straight to `Idle` rather than
    /// waiting for a send to fail (`Draining` is reserved for a graceful
    /// shutdown request, which this isn't — there's nothing to flush, the
    /// link is already gone); link-up while `Backoff` fast-forwards the
    /// retry timer instead of waiting out the remaining jittered delay.
    pub fn on_network_change(&mut self, change: NetworkChange, now: Instant) {
        match (change.state, self.state) {
            (LinkState::Down, ConnectionState::Ready) => {
                self.transport = None;
                self.state = ConnectionState::Idle;
            }
            (LinkState::Up, ConnectionState::Backoff) => {
                self.backoff_deadline = Some(now);
            }
            _ => {}
        }
    }

    /// `Draining` has no in-flight sends left to flush -> `Closed` for this
    /// attempt, ready to restart from `Idle` on the next tick.
    pub fn finish_draining(&mut self) {
        if self.state == ConnectionState::Draining {
            self.state = ConnectionState::Idle;
        }
    }

    pub fn shutdown(&mut self) {
        self.transport = None;
        self.handshake_deadline = None;
        self.state = ConnectionState::Closed;
    }
}

#[derive(Debug, Clone)]
pub enum ResolutionAction {
    Connect(crate::record::Endpoint),
    Ignored,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn rng() -> rand::rngs::StdRng {
        rand::rngs::StdRng::seed_from_u64(42)
    }

    #[test]
    fn backoff_doubles_and_caps_at_10x() {
        let base = Duration::from_secs(1);
        let mut policy = BackoffPolicy::new(base);
        let mut r = rng();
        let now = Instant::now();
        let mut last_multiplier_delay = Duration::ZERO;
        for _ in 0..10 {
            let delay = policy.next_delay(now, &mut r);
            // jitter is +/-20%, so compare against the unjittered bound loosely
            assert!(delay <= base * MAX_MULTIPLIER + base); // generous upper bound
            last_multiplier_delay = delay;
        }
        let _ = last_multiplier_delay;
    }

    #[test]
    fn backoff_resets_after_stable_ready_window() {
        let mut policy = BackoffPolicy::new(Duration::from_secs(1));
        let mut r = rng();
        let now = Instant::now();
        policy.next_delay(now, &mut r); // multiplier -> 2
        policy.next_delay(now, &mut r); // multiplier -> 4
        assert_eq!(policy.multiplier, 4);

        policy.on_ready(now);
        policy.observe_ready(now + Duration::from_secs(31));
        assert_eq!(policy.multiplier, 1);
    }

    #[test]
    fn network_down_while_ready_closes_immediately_to_idle() {
        let mut manager = Manager::new(Duration::from_secs(1));
        manager.state = ConnectionState::Ready;
        manager.on_network_change(NetworkChange { state: LinkState::Down }, Instant::now());
        assert_eq!(manager.state(), ConnectionState::Idle);
    }

    #[test]
    fn network_up_while_backoff_fast_forwards_timer() {
        let mut manager = Manager::new(Duration::from_secs(60));
        let mut r = rng();
        manager.on_failure(Instant::now(), &mut r);
        assert_eq!(manager.state(), ConnectionState::Backoff);

        let now = Instant::now();
        manager.on_network_change(NetworkChange { state: LinkState::Up }, now);
        assert!(manager.tick(now, &mut r));
    }

    #[test]
    fn stuck_dtls_handshake_times_out_to_backoff() {
        let mut manager = Manager::new(Duration::from_secs(30));
        let mut r = rng();
        let now = Instant::now();
        manager.state = ConnectionState::Handshaking;
        manager.handshake_deadline = Some(now + Duration::from_secs(3));

        assert!(!manager.tick(now + Duration::from_secs(1), &mut r));
        assert_eq!(manager.state(), ConnectionState::Handshaking);

        manager.tick(now + Duration::from_secs(4), &mut r);
        assert_eq!(manager.state(), ConnectionState::Backoff);
    }

    #[test]
    fn stale_resolution_is_ignored() {
        let mut manager = Manager::new(Duration::from_secs(1));
        let mut r = rng();
        manager.start(1);
        manager.start(2); // supersedes id 1

        let stale = Resolution::Resolved {
            id: 1,
            endpoints: vec![crate::record::Endpoint::new("127.0.0.1".parse().unwrap(), 514, "x")],
        };
        let action = manager.on_resolution(&stale, Instant::now(), &mut r);
        assert!(matches!(action, ResolutionAction::Ignored));
        assert_eq!(manager.state(), ConnectionState::Resolving); // unaffected
    }

    #[test]
    fn failed_resolution_enters_backoff() {
        let mut manager = Manager::new(Duration::from_secs(1));
        let mut r = rng();
        manager.start(1);
        let failed = Resolution::Failed { id: 1, error: "nxdomain".into() };
        manager.on_resolution(&failed, Instant::now(), &mut r);
        assert_eq!(manager.state(), ConnectionState::Backoff);
    }

    #[test]
    fn draining_returns_to_idle() {
        let mut manager = Manager::new(Duration::from_secs(1));
        manager.state = ConnectionState::Draining;
        manager.finish_draining();
        assert_eq!(manager.state(), ConnectionState::Idle);
    }
}
