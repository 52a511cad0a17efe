// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Resolver adapter.
//!
//! `getaddrinfo` blocks, and the reactor thread must never block. A single
//! long-lived worker thread receives `Resolve` requests over an
//! `mpsc::Sender`, performs the blocking lookup, and wakes the reactor
//! through a shared `mio::Waker` so the completion is picked up on the next
//! `Poll::poll` without spawning a dedicated OS thread per lookup.

use crate::record::Endpoint;
use std::net::ToSocketAddrs;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use mio::Waker;

/// A request to resolve `host:port` into a prioritized address list.
struct Request {
    id: u64,
    host: String,
    port: u16,
}

/// Outcome of a resolve request, delivered in request order per id.
pub enum Resolution {
    Resolved { id: u64, endpoints: Vec<Endpoint> },
    Failed { id: u64, error: String },
}

/// Runs on the reactor thread. Owns the sending half of the command channel
/// and the receiving half of the result channel.
pub struct Resolver {
    next_id: u64,
    commands: Sender<Request>,
    results: Receiver<Resolution>,
    _worker: JoinHandle<()>,
}

impl Resolver {
    /// `waker` is the same `mio::Waker` registered with the reactor's
    /// `Poll`; the worker thread calls `wake()` after every completed
    /// lookup so the reactor's next `poll()` returns even with no socket
    /// readiness to report.
    pub fn spawn(waker: Arc<Waker>) -> Self {
        let (command_tx, command_rx) = channel::<Request>();
        let (result_tx, result_rx) = channel::<Resolution>();

        let worker = thread::Builder::new()
            .name("netlogd-resolver".into())
            .spawn(move || resolver_loop(command_rx, result_tx, waker))
            .expect("failed to spawn resolver thread");

        Self {
            next_id: 0,
            commands: command_tx,
            results: result_rx,
            _worker: worker,
        }
    }

    /// Submit a resolve request. Returns a request id; the matching
    /// `Resolution` arrives later via `poll_results`. Cancellation is
    /// cooperative: a caller simply ignores a `Resolution` whose id no
    /// longer matches the connection attempt it was issued for.
    pub fn resolve(&mut self, host: impl Into<String>, port: u16) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        // The channel is unbounded and the worker never exits while `self`
        // lives, so this can only fail if the worker panicked.
        let _ = self.commands.send(Request { id, host: host.into(), port });
        id
    }

    /// Drain all resolutions completed since the last call. Called from the
    /// reactor loop after a wakeup.
    pub fn poll_results(&self) -> Vec<Resolution> {
        self.results.try_iter().collect()
    }
}

fn resolver_loop(commands: Receiver<Request>, results: Sender<Resolution>, waker: Arc<Waker>) {
    while let Ok(request) = commands.recv() {
        let outcome = resolve_blocking(&request.host, request.port);
        let resolution = match outcome {
            Ok(endpoints) if !endpoints.is_empty() => Resolution::Resolved { id: request.id, endpoints },
            Ok(_) => Resolution::Failed {
                id: request.id,
                error: "no addresses returned".to_string(),
            },
            Err(e) => Resolution::Failed { id: request.id, error: e.to_string() },
        };
        if results.send(resolution).is_err() {
            break; // reactor side dropped; nothing left to do
        }
        let _ = waker.wake();
    }
}

fn resolve_blocking(host: &str, port: u16) -> std::io::Result<Vec<Endpoint>> {
    // IPv4 addresses are preferred first, matching the original's
    // `AF_INET`-before-`AF_INET6` ordering; multi-address races are broken
    // by connection attempt order, not by this list's order alone.
    let mut v4 = Vec::new();
    let mut v6 = Vec::new();
    for addr in (host, port).to_socket_addrs()? {
        let endpoint = Endpoint::new(addr.ip(), addr.port(), host.to_string());
        if addr.is_ipv4() {
            v4.push(endpoint);
        } else {
            v6.push(endpoint);
        }
    }
    v4.extend(v6);
    Ok(v4)
}
