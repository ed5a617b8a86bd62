// Dual token-bucket rate limiting for the send path.
// Numan Thabit 2025

use serde::Deserialize;

/// Tunables for the rate limiter.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    pub packets_per_second: u64,
    pub bytes_per_second: u64,
    /// Bucket capacity in packets.
    pub burst_packets: u64,
    /// Bucket capacity in bytes.
    pub burst_bytes: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            packets_per_second: 10_000,
            bytes_per_second: 100_000_000,
            burst_packets: 100,
            burst_bytes: 1_000_000,
        }
    }
}

/// Token buckets over packets and bytes with a shared refill timestamp.
///
/// Buckets start full. A send is admitted only when both a packet token and
/// enough byte tokens are available.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    packet_tokens: u64,
    byte_tokens: u64,
    last_refill_ms: Option<u64>,
    packets_dropped: u64,
    bytes_dropped: u64,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        let packet_tokens = config.burst_packets;
        let byte_tokens = config.burst_bytes;
        Self {
            config,
            packet_tokens,
            byte_tokens,
            last_refill_ms: None,
            packets_dropped: 0,
            bytes_dropped: 0,
        }
    }

    pub fn packets_dropped(&self) -> u64 {
        self.packets_dropped
    }

    pub fn bytes_dropped(&self) -> u64 {
        self.bytes_dropped
    }

    pub fn check(&self, packet_bytes: usize) -> bool {
        self.packet_tokens >= 1 && self.byte_tokens >= packet_bytes as u64
    }

    /// Admits one packet of `packet_bytes`, or counts the drop.
    pub fn try_consume(&mut self, packet_bytes: usize) -> bool {
        if !self.check(packet_bytes) {
            self.packets_dropped += 1;
            self.bytes_dropped += packet_bytes as u64;
            return false;
        }
        self.packet_tokens -= 1;
        self.byte_tokens -= packet_bytes as u64;
        true
    }

    /// Adds tokens for `elapsed_ms` of wall time, capped at the bursts.
    pub fn refill(&mut self, elapsed_ms: u64) {
        if elapsed_ms == 0 {
            return;
        }

        let packet_add = self.config.packets_per_second * elapsed_ms / 1000;
        let byte_add = self.config.bytes_per_second * elapsed_ms / 1000;

        self.packet_tokens = (self.packet_tokens + packet_add).min(self.config.burst_packets);
        self.byte_tokens = (self.byte_tokens + byte_add).min(self.config.burst_bytes);
    }

    /// Refills based on the injected clock.
    pub fn refill_at(&mut self, now_ms: u64) {
        match self.last_refill_ms {
            Some(last) if now_ms > last => {
                self.refill(now_ms - last);
                self.last_refill_ms = Some(now_ms);
            }
            Some(_) => {}
            None => self.last_refill_ms = Some(now_ms),
        }
    }

    pub fn reset(&mut self) {
        self.packet_tokens = self.config.burst_packets;
        self.byte_tokens = self.config.burst_bytes;
        self.packets_dropped = 0;
        self.bytes_dropped = 0;
    }
}
