// Prometheus export of the session's transport statistics.
// Numan Thabit 2025

use prometheus::{IntGauge, Registry};
use thiserror::Error;

use crate::session::TransportStats;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

/// Gauges mirroring [`TransportStats`]; refresh them from a snapshot with
/// [`Metrics::observe`].
#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,
    pub packets_sent: IntGauge,
    pub packets_received: IntGauge,
    pub bytes_sent: IntGauge,
    pub bytes_received: IntGauge,
    pub packets_dropped_rate_limit: IntGauge,
    pub packets_dropped_replay: IntGauge,
    pub packets_retransmitted: IntGauge,
    pub messages_fragmented: IntGauge,
    pub messages_assembled: IntGauge,
    pub session_rotations: IntGauge,
    pub handshake_failures: IntGauge,
    pub decryption_failures: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new_custom(Some("veilport".into()), None)?;

        macro_rules! register_gauge {
            ($name:expr, $help:expr) => {{
                let gauge = IntGauge::new($name, $help)?;
                registry.register(Box::new(gauge.clone()))?;
                gauge
            }};
        }

        let packets_sent = register_gauge!("packets_sent", "Datagrams sent");
        let packets_received = register_gauge!("packets_received", "Datagrams received");
        let bytes_sent = register_gauge!("bytes_sent", "Bytes sent");
        let bytes_received = register_gauge!("bytes_received", "Bytes received");
        let packets_dropped_rate_limit = register_gauge!(
            "packets_dropped_rate_limit",
            "Sends refused by the rate limiter"
        );
        let packets_dropped_replay =
            register_gauge!("packets_dropped_replay", "Datagrams refused by replay protection");
        let packets_retransmitted =
            register_gauge!("packets_retransmitted", "Packets retransmitted after timeout");
        let messages_fragmented =
            register_gauge!("messages_fragmented", "Outbound messages split into fragments");
        let messages_assembled =
            register_gauge!("messages_assembled", "Inbound messages reassembled");
        let session_rotations = register_gauge!("session_rotations", "Short session id rotations");
        let handshake_failures = register_gauge!("handshake_failures", "Failed handshake attempts");
        let decryption_failures =
            register_gauge!("decryption_failures", "AEAD authentication failures");

        Ok(Self {
            registry,
            packets_sent,
            packets_received,
            bytes_sent,
            bytes_received,
            packets_dropped_rate_limit,
            packets_dropped_replay,
            packets_retransmitted,
            messages_fragmented,
            messages_assembled,
            session_rotations,
            handshake_failures,
            decryption_failures,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Pushes a stats snapshot into the gauges.
    pub fn observe(&self, stats: &TransportStats) {
        self.packets_sent.set(stats.packets_sent as i64);
        self.packets_received.set(stats.packets_received as i64);
        self.bytes_sent.set(stats.bytes_sent as i64);
        self.bytes_received.set(stats.bytes_received as i64);
        self.packets_dropped_rate_limit
            .set(stats.packets_dropped_rate_limit as i64);
        self.packets_dropped_replay
            .set(stats.packets_dropped_replay as i64);
        self.packets_retransmitted
            .set(stats.packets_retransmitted as i64);
        self.messages_fragmented.set(stats.messages_fragmented as i64);
        self.messages_assembled.set(stats.messages_assembled as i64);
        self.session_rotations.set(stats.session_rotations as i64);
        self.handshake_failures.set(stats.handshake_failures as i64);
        self.decryption_failures.set(stats.decryption_failures as i64);
    }
}
