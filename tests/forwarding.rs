// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end forwarding tests against a real local listener: UDP happy path
//! and TCP framing, driving the whole `Engine` reactor loop over a loopback
//! socket instead of poking at its pieces directly.

use netlogd::config::{ManagerConfig, Protocol};
use netlogd::engine::Engine;
use netlogd::formatter::LogFormat;
use netlogd::journal::InMemoryJournal;
use netlogd::record::{LogRecord, Timestamp};
use std::io::Read;
use std::net::{TcpListener, UdpSocket};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn sample_record() -> LogRecord {
    LogRecord {
        severity: 6,
        facility: 1,
        identifier: Some("app".into()),
        message: b"hello".to_vec(),
        hostname: None,
        pid: Some("42".into()),
        timestamp: Timestamp { secs: 1_700_000_000, micros: 123_456, offset_secs: 0 },
        structured_data: None,
        msgid: None,
    }
}

#[test]
fn s1_udp_happy_path_end_to_end() {
    let listener = UdpSocket::bind("127.0.0.1:0").unwrap();
    listener.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let port = listener.local_addr().unwrap().port();

    let dir = TempDir::new().unwrap();
    let mut source = InMemoryJournal::new();
    source.push("c1", sample_record());

    let config = ManagerConfig::default()
        .with_server("127.0.0.1", port)
        .with_protocol(Protocol::Udp)
        .with_state_file(dir.path().join("state").display().to_string());
    let mut config = config;
    config.log_format = LogFormat::Rfc5424;

    let mut engine = Engine::new(config, source).unwrap();
    let stop = engine.stop_handle();
    let handle = thread::spawn(move || engine.run());

    let mut buf = [0u8; 512];
    let (n, _) = listener.recv_from(&mut buf).expect("datagram should arrive");
    let received = String::from_utf8_lossy(&buf[..n]).into_owned();

    stop.stop();
    handle.join().unwrap().unwrap();

    assert_eq!(received, "<14>1 2023-11-14T22:13:20.123456+00:00 - app 42 - - hello");
}

#[test]
fn s2_tcp_framing_end_to_end() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let dir = TempDir::new().unwrap();
    let mut source = InMemoryJournal::new();
    source.push("c1", sample_record());

    let mut config = ManagerConfig::default()
        .with_server("127.0.0.1", port)
        .with_protocol(Protocol::Tcp)
        .with_state_file(dir.path().join("state").display().to_string());
    config.log_format = LogFormat::Rfc5424;

    let mut engine = Engine::new(config, source).unwrap();
    let stop = engine.stop_handle();
    let handle = thread::spawn(move || engine.run());

    listener.set_nonblocking(false).unwrap();
    let (mut stream, _) = listener.accept().expect("collector should receive a connection");
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut buf = [0u8; 512];
    let n = stream.read(&mut buf).expect("record should arrive");
    let received = String::from_utf8_lossy(&buf[..n]).into_owned();

    stop.stop();
    handle.join().unwrap().unwrap();

    assert!(received.ends_with('\n'));
    assert_eq!(received.trim_end_matches('\n'), "<14>1 2023-11-14T22:13:20.123456+00:00 - app 42 - - hello");
}

#[test]
fn cursor_persists_after_successful_udp_send() {
    let listener = UdpSocket::bind("127.0.0.1:0").unwrap();
    listener.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let port = listener.local_addr().unwrap().port();

    let dir = TempDir::new().unwrap();
    let state_path = dir.path().join("state");
    let mut source = InMemoryJournal::new();
    source.push("s=1;i=1", sample_record());

    let config = ManagerConfig::default()
        .with_server("127.0.0.1", port)
        .with_protocol(Protocol::Udp)
        .with_state_file(state_path.display().to_string());

    let mut engine = Engine::new(config, source).unwrap();
    let stop = engine.stop_handle();
    let handle = thread::spawn(move || engine.run());

    let mut buf = [0u8; 512];
    listener.recv_from(&mut buf).expect("datagram should arrive");

    // Give the pump a moment to advance the in-memory `sent` cursor before
    // asking the engine to flush it to disk on shutdown.
    thread::sleep(Duration::from_millis(50));
    stop.stop();
    handle.join().unwrap().unwrap();

    let contents = std::fs::read_to_string(&state_path).unwrap();
    assert_eq!(contents.trim(), "LAST_CURSOR=s=1;i=1");
}
