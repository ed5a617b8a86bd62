// Short session id rotation driven by packet, byte, and time budgets.
// Numan Thabit 2025

use serde::Deserialize;

use crate::crypto::keys;

/// Budgets that trigger a rotation.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    pub packets_per_session: u64,
    pub bytes_per_session: u64,
    pub seconds_per_session: u64,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            packets_per_session: 1_000_000,
            bytes_per_session: 1 << 30,
            seconds_per_session: 3600,
        }
    }
}

/// Tracks traffic volume and refreshes the 64-bit short session id before
/// the packet counter can approach nonce reuse.
#[derive(Debug)]
pub struct SessionRotator {
    config: RotationConfig,
    current_id: u64,
    packets_sent: u64,
    packets_received: u64,
    bytes_sent: u64,
    bytes_received: u64,
    session_start_ms: u64,
    rotations: u64,
}

impl SessionRotator {
    pub fn new(config: RotationConfig, now_ms: u64) -> Self {
        Self {
            config,
            current_id: 0,
            packets_sent: 0,
            packets_received: 0,
            bytes_sent: 0,
            bytes_received: 0,
            session_start_ms: now_ms,
            rotations: 0,
        }
    }

    pub fn current_id(&self) -> u64 {
        self.current_id
    }

    pub fn rotations(&self) -> u64 {
        self.rotations
    }

    /// Installs an externally derived short id (handshake completion or a
    /// peer-advertised rotation) without touching the rotation counter.
    pub fn adopt_id(&mut self, id: u64, now_ms: u64) {
        self.current_id = id;
        self.reset_counters(now_ms);
    }

    pub fn on_packet_sent(&mut self, bytes: usize) {
        self.packets_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    pub fn on_packet_received(&mut self, bytes: usize) {
        self.packets_received += 1;
        self.bytes_received += bytes as u64;
    }

    pub fn should_rotate(&self, now_ms: u64) -> bool {
        if self.packets_sent + self.packets_received >= self.config.packets_per_session {
            return true;
        }
        if self.bytes_sent + self.bytes_received >= self.config.bytes_per_session {
            return true;
        }
        now_ms.saturating_sub(self.session_start_ms) >= self.config.seconds_per_session * 1000
    }

    /// Draws a fresh short id from the CSPRNG and resets the budgets.
    pub fn rotate(&mut self, now_ms: u64) -> u64 {
        self.rotate_to(keys::random_u64(), now_ms)
    }

    /// Rotates to a caller-chosen short id, counting the rotation.
    pub fn rotate_to(&mut self, id: u64, now_ms: u64) -> u64 {
        self.current_id = id;
        self.reset_counters(now_ms);
        self.rotations += 1;
        self.current_id
    }

    fn reset_counters(&mut self, now_ms: u64) {
        self.packets_sent = 0;
        self.packets_received = 0;
        self.bytes_sent = 0;
        self.bytes_received = 0;
        self.session_start_ms = now_ms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rotator(packets: u64, bytes: u64, seconds: u64) -> SessionRotator {
        SessionRotator::new(
            RotationConfig {
                packets_per_session: packets,
                bytes_per_session: bytes,
                seconds_per_session: seconds,
            },
            0,
        )
    }

    #[test]
    fn packet_budget_triggers_rotation() {
        let mut rot = rotator(3, u64::MAX, u64::MAX / 1000);
        rot.on_packet_sent(10);
        rot.on_packet_received(10);
        assert!(!rot.should_rotate(0));
        rot.on_packet_sent(10);
        assert!(rot.should_rotate(0));
    }

    #[test]
    fn byte_budget_triggers_rotation() {
        let mut rot = rotator(u64::MAX, 100, u64::MAX / 1000);
        rot.on_packet_sent(60);
        assert!(!rot.should_rotate(0));
        rot.on_packet_received(40);
        assert!(rot.should_rotate(0));
    }

    #[test]
    fn time_budget_triggers_rotation() {
        let rot = rotator(u64::MAX, u64::MAX, 10);
        assert!(!rot.should_rotate(9_999));
        assert!(rot.should_rotate(10_000));
    }

    #[test]
    fn rotation_resets_budgets() {
        let mut rot = rotator(2, u64::MAX, u64::MAX / 1000);
        rot.on_packet_sent(10);
        rot.on_packet_sent(10);
        assert!(rot.should_rotate(0));

        let old_id = rot.current_id();
        let new_id = rot.rotate(5);
        assert_ne!(new_id, old_id);
        assert_eq!(rot.rotations(), 1);
        assert!(!rot.should_rotate(5));
    }

    #[test]
    fn adopt_id_does_not_count_as_rotation() {
        let mut rot = rotator(10, 10, 10);
        rot.adopt_id(0x1122_3344_5566_7788, 0);
        assert_eq!(rot.current_id(), 0x1122_3344_5566_7788);
        assert_eq!(rot.rotations(), 0);
    }
}
