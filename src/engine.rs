// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Ties the resolver, connection state machine, network watcher, and
//! journal pump together into a single-threaded reactor loop: one
//! `mio::Poll::poll`, route each event by token, re-arm, repeat.

use crate::addr::{display_socket_addr, is_loopback_or_link_local};
use crate::config::{ManagerConfig, Protocol};
use crate::cursor::CursorTracker;
use crate::journal::{JournalPump, JournalSource, PumpOutcome};
use crate::netwatch::NetworkWatcher;
use crate::record::Endpoint;
use crate::resolver::Resolver;
use crate::statemachine::{ConnectionState, Manager, ResolutionAction};
use crate::transport::handle::TransportHandle;
use crate::transport::plain::PlainTransport;
use crate::transport::secure::SecureTransport;
use mio::{Events, Poll, Token, Waker};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const WAKER_TOKEN: Token = Token(0);
const TRANSPORT_TOKEN: Token = Token(1);

const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(200);
const MAX_EVENTS: usize = 128;
const NETWATCH_PATH: &str = "/run/systemd/netif/state";
const NETWATCH_POLL_INTERVAL: Duration = Duration::from_secs(2);
const NETWATCH_DEBOUNCE: Duration = Duration::from_secs(5);
const CURSOR_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Shared flag flipped by the Ctrl+C handler; the reactor observes it on
/// every wakeup.
#[derive(Clone)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let _ = self.waker.wake();
    }
}

/// A plain transport whose underlying socket is connected/connecting but
/// hasn't yet started its TLS/DTLS handshake (kept separate from
/// `Manager`'s `TransportHandle` until the handshake can begin, since a TCP
/// connect may still be in flight).
struct PendingSecure {
    protocol: Protocol,
    underlying: PlainTransport,
    endpoint: Endpoint,
}

pub struct Engine<J: JournalSource> {
    config: ManagerConfig,
    poll: Poll,
    resolver: Resolver,
    manager: Manager,
    netwatch: NetworkWatcher,
    pump: JournalPump<J>,
    rng: StdRng,
    running: Arc<AtomicBool>,
    waker: Arc<Waker>,
    pending_secure: Option<PendingSecure>,
    current_endpoint: Option<Endpoint>,
}

impl<J: JournalSource> Engine<J> {
    pub fn new(config: ManagerConfig, source: J) -> Result<Self, crate::error::EngineError> {
        let poll = Poll::new().map_err(crate::error::EngineError::Connect)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN).map_err(crate::error::EngineError::Connect)?);
        let resolver = Resolver::spawn(waker.clone());
        let manager = Manager::new(config.connection_retry);
        let netwatch = NetworkWatcher::new(NETWATCH_PATH, NETWATCH_POLL_INTERVAL, NETWATCH_DEBOUNCE);

        let cursor = CursorTracker::load(config.state_file.clone())?;
        let framed = !config.protocol.is_datagram();
        let pump = JournalPump::new(source, cursor, &config, framed, Instant::now())
            .map_err(crate::error::EngineError::TransportBroken)?;

        Ok(Self {
            config,
            poll,
            resolver,
            manager,
            netwatch,
            pump,
            rng: StdRng::from_entropy(),
            running: Arc::new(AtomicBool::new(true)),
            waker,
            pending_secure: None,
            current_endpoint: None,
        })
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle { flag: self.running.clone(), waker: self.waker.clone() }
    }

    /// Run until `StopHandle::stop` is called. Flushes the cursor before
    /// returning.
    pub fn run(&mut self) -> Result<(), crate::error::EngineError> {
        let resolve_id = self.resolver.resolve(self.config.server.clone(), self.config.port);
        self.manager.start(resolve_id);
        tracing::info!(server = %self.config.server, port = self.config.port, "starting forwarder");

        let mut events = Events::with_capacity(MAX_EVENTS);
        let mut last_cursor_flush = Instant::now();

        loop {
            self.poll
                .poll(&mut events, Some(DEFAULT_POLL_TIMEOUT))
                .map_err(crate::error::EngineError::TransportBroken)?;

            for event in events.iter() {
                if event.token() == WAKER_TOKEN {
                    self.drain_resolutions();
                } else if event.token() == TRANSPORT_TOKEN {
                    self.on_transport_event(event.is_writable());
                }
            }

            let now = Instant::now();
            if self.manager.tick(now, &mut self.rng) {
                let id = self.resolver.resolve(self.config.server.clone(), self.config.port);
                self.manager.start(id);
            }
            if let Some(change) = self.netwatch.poll(now) {
                let peer_is_local = self
                    .current_endpoint
                    .as_ref()
                    .is_some_and(|e| is_loopback_or_link_local(&e.addr));
                if peer_is_local {
                    tracing::debug!(state = ?change.state, "ignoring network change for loopback/link-local peer");
                } else {
                    tracing::info!(state = ?change.state, "network state changed");
                    self.manager.on_network_change(change, now);
                }
            }
            if self.manager.state() == ConnectionState::Draining {
                self.manager.finish_draining();
            }

            self.drain_pump(now);

            if now.duration_since(last_cursor_flush) >= CURSOR_FLUSH_INTERVAL {
                match self.pump.cursor_mut().flush() {
                    Ok(true) => tracing::debug!("cursor flushed"),
                    Ok(false) => {}
                    Err(e) => tracing::warn!(error = %e, "cursor flush failed"),
                }
                last_cursor_flush = now;
            }

            if !self.running.load(Ordering::SeqCst) {
                self.manager.shutdown();
                break;
            }
        }

        self.pump.cursor_mut().flush()?;
        Ok(())
    }

    fn drain_resolutions(&mut self) {
        for resolution in self.resolver.poll_results() {
            let now = Instant::now();
            let action = self.manager.on_resolution(&resolution, now, &mut self.rng);
            if let ResolutionAction::Connect(endpoint) = action {
                self.begin_connect(&endpoint);
            }
        }
    }

    fn begin_connect(&mut self, endpoint: &Endpoint) {
        self.current_endpoint = Some(endpoint.clone());
        tracing::debug!(endpoint = %display_socket_addr(endpoint.socket_addr()), protocol = ?self.config.protocol, "connecting");
        let registry = self.poll.registry();
        let outcome = match self.config.protocol {
            Protocol::Udp => PlainTransport::connect_udp(endpoint, &self.config, TRANSPORT_TOKEN)
                .and_then(|mut t| register(registry, &mut t).map(|()| ConnectOutcome::Plain(TransportHandle::Udp(t)))),
            Protocol::Tcp => PlainTransport::connect_tcp(endpoint, &self.config, TRANSPORT_TOKEN)
                .and_then(|mut t| register(registry, &mut t).map(|()| ConnectOutcome::Plain(TransportHandle::Tcp(t)))),
            Protocol::Tls => PlainTransport::connect_tcp(endpoint, &self.config, TRANSPORT_TOKEN)
                .and_then(|mut t| register(registry, &mut t).map(|()| ConnectOutcome::PendingTls(t))),
            Protocol::Dtls => PlainTransport::connect_udp(endpoint, &self.config, TRANSPORT_TOKEN)
                .and_then(|mut t| register(registry, &mut t).map(|()| ConnectOutcome::PendingDtls(t))),
        };

        match outcome {
            Ok(ConnectOutcome::Plain(handle)) => {
                self.manager.begin_connecting(handle);
                self.maybe_advance_plain_connect();
            }
            Ok(ConnectOutcome::PendingTls(underlying)) => {
                self.pending_secure = Some(PendingSecure { protocol: Protocol::Tls, underlying, endpoint: endpoint.clone() });
            }
            Ok(ConnectOutcome::PendingDtls(underlying)) => {
                self.pending_secure = Some(PendingSecure { protocol: Protocol::Dtls, underlying, endpoint: endpoint.clone() });
                self.start_handshake_if_ready();
            }
            Err(e) => {
                tracing::warn!(error = %e, "connect failed");
                self.manager.on_failure(Instant::now(), &mut self.rng);
            }
        }
    }

    /// UDP's `connect()` never actually blocks, so a DTLS handshake can
    /// start as soon as the underlying socket exists, without waiting for a
    /// writable event.
    fn start_handshake_if_ready(&mut self) {
        let Some(pending) = self.pending_secure.take() else { return };
        if pending.protocol != Protocol::Dtls {
            self.pending_secure = Some(pending);
            return;
        }
        self.start_secure_handshake(pending);
    }

    fn start_secure_handshake(&mut self, pending: PendingSecure) {
        let PendingSecure { protocol, underlying, endpoint } = pending;
        let verify_peer = self.config.auth_mode == crate::config::AuthMode::Certificate;
        let ca_path = self.config.ca_path.clone();

        let result = match protocol {
            Protocol::Tls => underlying
                .into_tcp_stream()
                .ok_or_else(|| crate::error::EngineError::Config("expected tcp stream".into()))
                .and_then(|stream| SecureTransport::start_tls(stream, &endpoint, ca_path.as_deref(), verify_peer, TRANSPORT_TOKEN)),
            Protocol::Dtls => underlying
                .into_udp_socket()
                .ok_or_else(|| crate::error::EngineError::Config("expected udp socket".into()))
                .and_then(|socket| SecureTransport::start_dtls(socket, &endpoint, ca_path.as_deref(), verify_peer, TRANSPORT_TOKEN)),
            _ => unreachable!("only Tls/Dtls are ever pending"),
        };

        match result {
            Ok(secure) => {
                let handle = match protocol {
                    Protocol::Tls => TransportHandle::Tls(secure),
                    Protocol::Dtls => TransportHandle::Dtls(secure),
                    _ => unreachable!(),
                };
                self.manager.begin_connecting(handle);
                self.manager.on_connect_complete(Instant::now());
                self.advance_handshake();
            }
            Err(e) => {
                tracing::warn!(error = %e, "handshake start failed");
                self.manager.on_failure(Instant::now(), &mut self.rng);
            }
        }
    }

    fn maybe_advance_plain_connect(&mut self) {
        if self.manager.state() != ConnectionState::Connecting {
            return;
        }
        if let Some(TransportHandle::Tcp(plain)) = self.manager.transport() {
            match plain.check_tcp_connected() {
                Ok(true) => self.manager.on_connect_complete(Instant::now()),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "tcp connect failed");
                    self.manager.on_failure(Instant::now(), &mut self.rng);
                }
            }
        } else if let Some(TransportHandle::Udp(_)) = self.manager.transport() {
            self.manager.on_connect_complete(Instant::now());
        }
    }

    fn advance_handshake(&mut self) {
        if self.manager.state() != ConnectionState::Handshaking {
            return;
        }
        if let Some(TransportHandle::Tls(secure) | TransportHandle::Dtls(secure)) = self.manager.transport() {
            match secure.advance_handshake() {
                Ok(true) => self.manager.on_handshake_complete(Instant::now()),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "handshake failed");
                    self.manager.on_failure(Instant::now(), &mut self.rng);
                }
            }
        }
    }

    fn on_transport_event(&mut self, writable: bool) {
        // A TCP connect completing, for a protocol that still needs a TLS
        // handshake started on top of it.
        if writable {
            if let Some(mut pending) = self.pending_secure.take() {
                match pending.underlying.check_tcp_connected() {
                    Ok(true) => self.start_secure_handshake(pending),
                    Ok(false) => self.pending_secure = Some(pending),
                    Err(e) => {
                        tracing::warn!(error = %e, "tcp connect failed before tls handshake");
                        self.manager.on_failure(Instant::now(), &mut self.rng);
                    }
                }
                return;
            }
        }

        self.maybe_advance_plain_connect();
        self.advance_handshake();
    }

    fn drain_pump(&mut self, now: Instant) {
        let ready = self.manager.state().is_operational();
        loop {
            let transport = self.manager.transport().map(|h| match h {
                TransportHandle::Udp(t) | TransportHandle::Tcp(t) => t as &mut dyn crate::transport::Transport,
                TransportHandle::Tls(t) | TransportHandle::Dtls(t) => t as &mut dyn crate::transport::Transport,
            });
            match self.pump.pump_once(now, ready, transport) {
                // Sent and RateLimited both consumed a record from the
                // journal; keep draining so a burst doesn't wait for the
                // next reactor wakeup to be dropped.
                Ok(PumpOutcome::Sent) | Ok(PumpOutcome::RateLimited) => continue,
                Ok(PumpOutcome::Idle) | Ok(PumpOutcome::TransportNotReady) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "send failed");
                    if e.drives_backoff() {
                        self.manager.on_failure(now, &mut self.rng);
                    }
                    break;
                }
            }
        }
    }
}

enum ConnectOutcome {
    Plain(TransportHandle),
    PendingTls(PlainTransport),
    PendingDtls(PlainTransport),
}

fn register(registry: &mio::Registry, transport: &mut PlainTransport) -> Result<(), crate::error::EngineError> {
    transport.register(registry).map_err(crate::error::EngineError::Connect)
}
