// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! netlogd — forward the local journal to a remote syslog collector.
//!
//! # Usage
//!
//! ```bash
//! # Forward over UDP in RFC 5424 format
//! netlogd --server collector.example.com --port 514
//!
//! # Forward over TLS, verifying the collector's certificate
//! netlogd --server collector.example.com --port 6514 --protocol tls --ca-cert /etc/ssl/certs/ca.pem
//!
//! # Read from a recorded journal file instead of the live journal
//! netlogd --server collector.example.com --input journal.tsv
//! ```

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use netlogd::config::{AuthMode, Protocol};
use netlogd::formatter::LogFormat;
use netlogd::journal::FileJournal;
use netlogd::ManagerConfig;
use std::path::PathBuf;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "netlogd")]
#[command(author = "naskel.com")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Forward the local journal to a remote syslog collector")]
#[command(long_about = None)]
struct Cli {
    /// Collector hostname or address
    #[arg(short, long)]
    server: Option<String>,

    /// Collector port (defaults to 514 for udp/tcp, 6514 for tls/dtls)
    #[arg(short, long)]
    port: Option<u16>,

    /// Transport protocol
    #[arg(long, value_enum, default_value = "udp")]
    protocol: ProtocolArg,

    /// Wire format
    #[arg(long, value_enum, default_value = "rfc5424")]
    format: FormatArg,

    /// Structured data block to attach to every message (RFC 5424 only)
    #[arg(long)]
    structured_data: Option<String>,

    /// Namespace tag added to the journal cursor's reconnect identity
    #[arg(long)]
    namespace: Option<String>,

    /// Path to the cursor/state file
    #[arg(long, default_value = "/var/lib/netlogd/state")]
    state_file: PathBuf,

    /// Optional KEY=VALUE config file, applied before flags
    #[arg(long)]
    config: Option<PathBuf>,

    /// Client certificate (TLS/DTLS)
    #[arg(long)]
    cert: Option<String>,

    /// Client private key (TLS/DTLS)
    #[arg(long)]
    key: Option<String>,

    /// CA bundle used to verify the collector (TLS/DTLS)
    #[arg(long = "ca-cert")]
    ca_cert: Option<String>,

    /// Skip peer certificate verification (testing only)
    #[arg(long)]
    insecure: bool,

    /// Read journal records from this newline-delimited file instead of the
    /// live journal (see `netlogd::journal::FileJournal`)
    #[arg(long)]
    input: PathBuf,

    /// Verbose internal logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ProtocolArg {
    Udp,
    Tcp,
    Tls,
    Dtls,
}

impl From<ProtocolArg> for Protocol {
    fn from(arg: ProtocolArg) -> Self {
        match arg {
            ProtocolArg::Udp => Protocol::Udp,
            ProtocolArg::Tcp => Protocol::Tcp,
            ProtocolArg::Tls => Protocol::Tls,
            ProtocolArg::Dtls => Protocol::Dtls,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    Rfc5424,
    Rfc3339,
}

impl From<FormatArg> for LogFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Rfc5424 => LogFormat::Rfc5424,
            FormatArg::Rfc3339 => LogFormat::Rfc3339,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("netlogd=debug")
    } else {
        EnvFilter::new("netlogd=info")
    };
    fmt().with_env_filter(filter).with_target(false).init();

    let config = build_config(&cli).context("building configuration")?;
    config.validate().context("invalid configuration")?;

    tracing::info!(
        server = %config.server,
        port = config.port,
        protocol = ?config.protocol,
        "starting netlogd"
    );

    let source = FileJournal::open(&cli.input)
        .with_context(|| format!("opening journal source {}", cli.input.display()))?;

    let mut eng = netlogd::engine::Engine::new(config, source).context("failed to create engine")?;

    let stop_handle = eng.stop_handle();
    ctrlc::set_handler(move || {
        tracing::info!("received shutdown signal");
        stop_handle.stop();
    })
    .context("installing signal handler")?;

    eng.run().context("engine error")?;

    tracing::info!("netlogd stopped");
    Ok(())
}

/// 514 for UDP/TCP, 6514 (IANA syslog-tls) for TLS/DTLS.
fn default_port(protocol: Protocol) -> u16 {
    if protocol.is_secure() {
        6514
    } else {
        514
    }
}

fn build_config(cli: &Cli) -> Result<ManagerConfig> {
    let mut config = ManagerConfig::default();
    if let Some(path) = &cli.config {
        config = config
            .load_file(path)
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("loading config file {}", path.display()))?;
    }

    if let Some(server) = &cli.server {
        config.server = server.clone();
    }
    config.protocol = cli.protocol.into();
    config.port = cli.port.unwrap_or_else(|| default_port(config.protocol));
    config.log_format = cli.format.into();
    if cli.structured_data.is_some() {
        config.structured_data = cli.structured_data.clone();
    }
    if cli.namespace.is_some() {
        config.namespace = cli.namespace.clone();
    }
    config.state_file = cli.state_file.display().to_string();
    if cli.cert.is_some() {
        config.cert_path = cli.cert.clone();
    }
    if cli.key.is_some() {
        config.key_path = cli.key.clone();
    }
    if cli.ca_cert.is_some() {
        config.ca_path = cli.ca_cert.clone();
    }
    if cli.insecure {
        config.auth_mode = AuthMode::None;
    }

    Ok(config)
}
