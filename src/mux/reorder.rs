// In-order delivery of data frames, with gap-tolerant forced flush.
// Numan Thabit 2025

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::Deserialize;

/// Tunables for the reorder buffer.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReorderConfig {
    /// Maximum packets held while waiting for a gap to fill.
    pub max_buffered_packets: usize,
    /// Maximum payload bytes held.
    pub max_buffered_bytes: usize,
    /// How long a gap may stall delivery before it is skipped.
    pub max_delay_ms: u64,
}

impl Default for ReorderConfig {
    fn default() -> Self {
        Self {
            max_buffered_packets: 256,
            max_buffered_bytes: 1_048_576,
            max_delay_ms: 1000,
        }
    }
}

#[derive(Debug)]
struct BufferedPacket {
    payload: Bytes,
    arrival_ms: u64,
}

/// Orders data frames by sequence before handing them to the application.
///
/// `next_expected` starts at 1 (the first data sequence). Contiguous runs
/// are drained by [`ReorderBuffer::deliver`]; [`ReorderBuffer::flush`] gives
/// up on gaps older than `max_delay_ms` and advances past them.
#[derive(Debug)]
pub struct ReorderBuffer {
    config: ReorderConfig,
    buffer: BTreeMap<u64, BufferedPacket>,
    next_expected: u64,
    buffered_bytes: usize,
}

impl ReorderBuffer {
    pub fn new(config: ReorderConfig) -> Self {
        Self {
            config,
            buffer: BTreeMap::new(),
            next_expected: 1,
            buffered_bytes: 0,
        }
    }

    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    pub fn buffered_packets(&self) -> usize {
        self.buffer.len()
    }

    /// Accepts an in-window data frame. Stale sequences, duplicates, and
    /// frames that would exceed the caps are rejected.
    pub fn insert(&mut self, sequence: u64, payload: Bytes, now_ms: u64) -> bool {
        if sequence < self.next_expected || self.buffer.contains_key(&sequence) {
            return false;
        }

        if self.buffer.len() >= self.config.max_buffered_packets {
            return false;
        }

        if self.buffered_bytes + payload.len() > self.config.max_buffered_bytes {
            return false;
        }

        self.buffered_bytes += payload.len();
        self.buffer.insert(
            sequence,
            BufferedPacket {
                payload,
                arrival_ms: now_ms,
            },
        );
        true
    }

    /// Drains the contiguous run starting at `next_expected`.
    pub fn deliver(&mut self) -> Vec<(u64, Bytes)> {
        let mut delivered = Vec::new();
        while let Some(packet) = self.buffer.remove(&self.next_expected) {
            self.buffered_bytes -= packet.payload.len();
            delivered.push((self.next_expected, packet.payload));
            self.next_expected += 1;
        }
        delivered
    }

    /// Delivers in-order packets, then force-delivers entries whose gap has
    /// stalled longer than `max_delay_ms`, skipping the missing sequences.
    pub fn flush(&mut self, now_ms: u64) -> Vec<(u64, Bytes)> {
        let mut delivered = self.deliver();

        loop {
            let oldest = match self.buffer.iter().next() {
                Some((&seq, packet)) => (seq, packet.arrival_ms),
                None => break,
            };

            if now_ms.saturating_sub(oldest.1) < self.config.max_delay_ms {
                break;
            }

            let packet = self.buffer.remove(&oldest.0).expect("entry just observed");
            self.buffered_bytes -= packet.payload.len();
            self.next_expected = oldest.0 + 1;
            delivered.push((oldest.0, packet.payload));

            delivered.extend(self.deliver());
        }

        delivered
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.next_expected = 1;
        self.buffered_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer() -> ReorderBuffer {
        ReorderBuffer::new(ReorderConfig::default())
    }

    fn payload(tag: u8) -> Bytes {
        Bytes::from(vec![tag; 4])
    }

    #[test]
    fn contiguous_sequences_deliver_in_order() {
        let mut buf = buffer();
        assert!(buf.insert(2, payload(2), 0));
        assert!(buf.insert(3, payload(3), 0));
        assert!(buf.deliver().is_empty());

        assert!(buf.insert(1, payload(1), 0));
        let delivered = buf.deliver();
        let seqs: Vec<u64> = delivered.iter().map(|(s, _)| *s).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(buf.next_expected(), 4);
    }

    #[test]
    fn rejects_stale_and_duplicate() {
        let mut buf = buffer();
        assert!(buf.insert(1, payload(1), 0));
        buf.deliver();
        assert!(!buf.insert(1, payload(1), 0));

        assert!(buf.insert(5, payload(5), 0));
        assert!(!buf.insert(5, payload(5), 0));
    }

    #[test]
    fn packet_cap_enforced() {
        let mut buf = ReorderBuffer::new(ReorderConfig {
            max_buffered_packets: 2,
            ..ReorderConfig::default()
        });
        assert!(buf.insert(2, payload(2), 0));
        assert!(buf.insert(3, payload(3), 0));
        assert!(!buf.insert(4, payload(4), 0));
    }

    #[test]
    fn byte_cap_enforced() {
        let mut buf = ReorderBuffer::new(ReorderConfig {
            max_buffered_bytes: 6,
            ..ReorderConfig::default()
        });
        assert!(buf.insert(2, payload(2), 0));
        assert!(!buf.insert(3, payload(3), 0));
    }

    #[test]
    fn flush_skips_stalled_gap() {
        let mut buf = ReorderBuffer::new(ReorderConfig {
            max_delay_ms: 100,
            ..ReorderConfig::default()
        });
        // Sequence 1 never arrives.
        assert!(buf.insert(2, payload(2), 0));
        assert!(buf.insert(3, payload(3), 0));
        assert!(buf.flush(50).is_empty());

        let delivered = buf.flush(150);
        let seqs: Vec<u64> = delivered.iter().map(|(s, _)| *s).collect();
        assert_eq!(seqs, vec![2, 3]);
        assert_eq!(buf.next_expected(), 4);
    }

    #[test]
    fn flush_respects_fresh_entries() {
        let mut buf = ReorderBuffer::new(ReorderConfig {
            max_delay_ms: 100,
            ..ReorderConfig::default()
        });
        assert!(buf.insert(2, payload(2), 0));
        assert!(buf.insert(5, payload(5), 140));

        let delivered = buf.flush(150);
        let seqs: Vec<u64> = delivered.iter().map(|(s, _)| *s).collect();
        // 2 is overdue and skipped past; 5 arrived recently and stays.
        assert_eq!(seqs, vec![2]);
        assert_eq!(buf.next_expected(), 3);
        assert_eq!(buf.buffered_packets(), 1);
    }

    #[test]
    fn flush_drains_contiguous_after_skip() {
        let mut buf = ReorderBuffer::new(ReorderConfig {
            max_delay_ms: 100,
            ..ReorderConfig::default()
        });
        // Gap at 1; 2 and 3 contiguous behind it, 3 arrived late but within
        // the same overdue window.
        assert!(buf.insert(2, payload(2), 0));
        assert!(buf.insert(3, payload(3), 10));

        let delivered = buf.flush(200);
        let seqs: Vec<u64> = delivered.iter().map(|(s, _)| *s).collect();
        assert_eq!(seqs, vec![2, 3]);
    }
}
