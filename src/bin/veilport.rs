// Demo binary: run one encrypted session as client or server.
// Numan Thabit 2025

use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use veilport::{Config, SessionState, TransportSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Initiate the handshake toward --remote.
    Client,
    /// Wait for an inbound handshake.
    Server,
}

/// Encrypted reliable datagram transport over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Run as client (initiator) or server (responder).
    #[arg(short, long, value_enum, default_value_t = Mode::Client)]
    mode: Mode,

    /// Local bind address.
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    /// Local port (0 = ephemeral).
    #[arg(short, long, default_value_t = 0)]
    port: u16,

    /// Remote host (client mode).
    #[arg(short, long, default_value = "127.0.0.1")]
    remote: String,

    /// Remote port (client mode).
    #[arg(long, default_value_t = 12_345)]
    remote_port: u16,

    /// Pre-shared key as hex, optional 0x prefix.
    #[arg(long, default_value = "")]
    psk: String,

    /// Maximum transmission unit.
    #[arg(long, default_value_t = 1400)]
    mtu: usize,

    /// Log level: trace, debug, info, warn, error.
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Send periodic pings once connected.
    #[arg(long)]
    ping: bool,

    /// Ping interval in milliseconds.
    #[arg(long, default_value_t = 1000)]
    ping_interval: u64,

    /// Optional INI config file; flags override its values.
    #[arg(long)]
    config: Option<String>,
}

fn build_config(cli: &Cli) -> Result<Config, veilport::ConfigError> {
    let mut config = match &cli.config {
        Some(path) => Config::from_path(path)?,
        None => Config::default(),
    };

    config.network.local_host = cli.bind.clone();
    config.network.local_port = cli.port;
    if cli.mode == Mode::Client {
        config.network.peer_host = cli.remote.clone();
        config.network.peer_port = cli.remote_port;
    } else {
        config.network.peer_host.clear();
        config.network.peer_port = 0;
    }
    config.network.mtu = cli.mtu;
    if !cli.psk.is_empty() {
        config.security.psk = cli.psk.clone();
    }
    config.validate()?;
    Ok(config)
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            return ExitCode::from(1);
        }
    };

    let mut session = match TransportSession::new(config) {
        Ok(session) => session,
        Err(err) => {
            error!(error = %err, "failed to create session");
            return ExitCode::from(1);
        }
    };

    session.set_data_callback(|payload| {
        info!(bytes = payload.len(), "data received");
        if let Ok(text) = std::str::from_utf8(&payload) {
            println!("{text}");
        }
    });
    session.set_state_callback(|state| info!(?state, "session state"));
    session.set_error_callback(|message| error!(error = message, "session error"));

    if let Err(err) = session.start() {
        error!(error = %err, "failed to start session");
        return ExitCode::from(1);
    }

    let mut last_ping_ms: u64 = 0;
    let mut elapsed_ms: u64 = 0;
    loop {
        if let Err(err) = session.process(50) {
            error!(error = %err, "process failed");
        }
        elapsed_ms += 50;

        if cli.ping
            && session.is_connected()
            && elapsed_ms.saturating_sub(last_ping_ms) >= cli.ping_interval
        {
            last_ping_ms = elapsed_ms;
            if let Err(err) = session.send_ping() {
                error!(error = %err, "ping failed");
            } else {
                info!(rtt_ms = session.rtt_ms(), "ping sent");
            }
        }

        match session.state() {
            SessionState::Closing | SessionState::Closed | SessionState::Disconnected => break,
            _ => {}
        }
    }

    session.stop();
    let stats = session.stats();
    info!(
        packets_sent = stats.packets_sent,
        packets_received = stats.packets_received,
        retransmitted = stats.packets_retransmitted,
        "session finished"
    );
    ExitCode::SUCCESS
}
