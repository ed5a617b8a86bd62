// Retransmission store, RFC 6298 RTT estimation, and timeout sweeps.
// Numan Thabit 2025

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::Deserialize;

/// Tunables for the retransmission manager.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetransmitConfig {
    /// RTO before the first RTT sample.
    pub initial_rto_ms: u64,
    pub min_rto_ms: u64,
    pub max_rto_ms: u64,
    /// Retransmissions per packet before it is dropped.
    pub max_retries: u32,
    /// In-flight cap in packets.
    pub max_unacked_packets: usize,
    /// In-flight cap in bytes.
    pub max_unacked_bytes: usize,
    /// SRTT smoothing factor (RFC 6298 alpha).
    pub rtt_alpha: f64,
    /// RTTVAR smoothing factor (RFC 6298 beta).
    pub rtt_beta: f64,
}

impl Default for RetransmitConfig {
    fn default() -> Self {
        Self {
            initial_rto_ms: 200,
            min_rto_ms: 100,
            max_rto_ms: 10_000,
            max_retries: 5,
            max_unacked_packets: 1024,
            max_unacked_bytes: 1_048_576,
            rtt_alpha: 0.125,
            rtt_beta: 0.25,
        }
    }
}

/// Smoothed RTT state per RFC 6298.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt_ms: f64,
    rttvar_ms: f64,
    initialized: bool,
}

impl RttEstimator {
    fn new() -> Self {
        Self {
            srtt_ms: 0.0,
            rttvar_ms: 0.0,
            initialized: false,
        }
    }

    /// Folds in one RTT sample and returns the resulting unclamped RTO.
    fn update(&mut self, sample_ms: u64, alpha: f64, beta: f64) -> f64 {
        let sample = sample_ms as f64;
        if !self.initialized {
            self.srtt_ms = sample;
            self.rttvar_ms = sample / 2.0;
            self.initialized = true;
        } else {
            self.rttvar_ms = (1.0 - beta) * self.rttvar_ms + beta * (self.srtt_ms - sample).abs();
            self.srtt_ms = (1.0 - alpha) * self.srtt_ms + alpha * sample;
        }
        self.srtt_ms + 4.0 * self.rttvar_ms
    }

    pub fn srtt_ms(&self) -> u64 {
        self.srtt_ms as u64
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }
}

#[derive(Debug)]
struct UnackedEntry {
    sealed: Bytes,
    first_send_ms: u64,
    last_send_ms: u64,
    retry_count: u32,
}

/// Outcome of a timeout sweep: packets to put back on the wire and
/// sequences dropped after exhausting their retries.
#[derive(Debug, Default)]
pub struct TimeoutSweep {
    pub retransmit: Vec<(u64, Bytes)>,
    pub dropped: Vec<u64>,
}

/// Holds sealed packets until they are selectively acknowledged.
///
/// RTT samples follow Karn's rule: only packets that were never
/// retransmitted contribute, so ambiguous echoes never skew the estimate.
#[derive(Debug)]
pub struct RetransmissionManager {
    config: RetransmitConfig,
    unacked: BTreeMap<u64, UnackedEntry>,
    unacked_bytes: usize,
    rtt: RttEstimator,
    rto_ms: u64,
    total_retransmits: u64,
    total_drops: u64,
}

impl RetransmissionManager {
    pub fn new(config: RetransmitConfig) -> Self {
        let rto_ms = config.initial_rto_ms;
        Self {
            config,
            unacked: BTreeMap::new(),
            unacked_bytes: 0,
            rtt: RttEstimator::new(),
            rto_ms,
            total_retransmits: 0,
            total_drops: 0,
        }
    }

    pub fn unacked_packets(&self) -> usize {
        self.unacked.len()
    }

    pub fn unacked_bytes(&self) -> usize {
        self.unacked_bytes
    }

    pub fn rto_ms(&self) -> u64 {
        self.rto_ms
    }

    pub fn srtt_ms(&self) -> u64 {
        self.rtt.srtt_ms()
    }

    pub fn rtt_initialized(&self) -> bool {
        self.rtt.is_initialized()
    }

    pub fn total_retransmits(&self) -> u64 {
        self.total_retransmits
    }

    pub fn total_drops(&self) -> u64 {
        self.total_drops
    }

    pub fn contains(&self, sequence: u64) -> bool {
        self.unacked.contains_key(&sequence)
    }

    /// Whether another packet of `bytes` fits under the in-flight caps.
    pub fn can_send(&self, bytes: usize) -> bool {
        self.unacked.len() < self.config.max_unacked_packets
            && self.unacked_bytes + bytes <= self.config.max_unacked_bytes
    }

    /// Stores a sealed packet for possible retransmission.
    pub fn register_packet(&mut self, sequence: u64, sealed: Bytes, now_ms: u64) -> bool {
        if !self.can_send(sealed.len()) || self.unacked.contains_key(&sequence) {
            return false;
        }

        self.unacked_bytes += sealed.len();
        self.unacked.insert(
            sequence,
            UnackedEntry {
                sealed,
                first_send_ms: now_ms,
                last_send_ms: now_ms,
                retry_count: 0,
            },
        );
        true
    }

    /// Acknowledges one sequence, sampling RTT when Karn's rule permits.
    pub fn ack_packet(&mut self, sequence: u64, ack_ms: u64) {
        let entry = match self.unacked.remove(&sequence) {
            Some(entry) => entry,
            None => return,
        };

        if entry.retry_count == 0 {
            let sample = ack_ms.saturating_sub(entry.first_send_ms);
            self.update_rtt(sample);
        }

        self.unacked_bytes -= entry.sealed.len();
    }

    /// Applies a selective acknowledgment: everything at or below
    /// `ack_number`, plus the sequences named by the bitmap.
    pub fn process_sack(&mut self, ack_number: u64, bitmap: u64, ack_ms: u64) {
        let below: Vec<u64> = self
            .unacked
            .range(..=ack_number)
            .map(|(&seq, _)| seq)
            .collect();
        for seq in below {
            self.ack_packet(seq, ack_ms);
        }

        for i in 0..64u64 {
            if bitmap & (1u64 << i) != 0 {
                self.ack_packet(ack_number + 1 + i, ack_ms);
            }
        }
    }

    /// Sweeps for expired packets: retransmits those with retries left
    /// (doubling the RTO each time) and drops the exhausted ones.
    pub fn retransmit_expired(&mut self, now_ms: u64) -> TimeoutSweep {
        let mut sweep = TimeoutSweep::default();

        for (&seq, entry) in self.unacked.iter_mut() {
            if now_ms.saturating_sub(entry.last_send_ms) < self.rto_ms {
                continue;
            }

            if entry.retry_count >= self.config.max_retries {
                sweep.dropped.push(seq);
                continue;
            }

            sweep.retransmit.push((seq, entry.sealed.clone()));
            entry.last_send_ms = now_ms;
            entry.retry_count += 1;
            self.total_retransmits += 1;
            self.rto_ms = (self.rto_ms * 2).min(self.config.max_rto_ms);
        }

        for &seq in &sweep.dropped {
            if let Some(entry) = self.unacked.remove(&seq) {
                self.unacked_bytes -= entry.sealed.len();
            }
            self.total_drops += 1;
        }

        sweep
    }

    fn update_rtt(&mut self, sample_ms: u64) {
        let rto = self
            .rtt
            .update(sample_ms, self.config.rtt_alpha, self.config.rtt_beta);
        self.rto_ms = (rto as u64).clamp(self.config.min_rto_ms, self.config.max_rto_ms);
    }

    pub fn reset(&mut self) {
        self.unacked.clear();
        self.unacked_bytes = 0;
        self.rtt = RttEstimator::new();
        self.rto_ms = self.config.initial_rto_ms;
        self.total_retransmits = 0;
        self.total_drops = 0;
    }

    /// Drains every stored sequence, e.g. on session teardown.
    pub fn drain(&mut self) -> Vec<u64> {
        let sequences: Vec<u64> = self.unacked.keys().copied().collect();
        self.unacked.clear();
        self.unacked_bytes = 0;
        sequences
    }
}
