// Reassembly of fragmented application messages.
// Numan Thabit 2025

use std::collections::BTreeMap;

use ahash::AHashMap;
use bytes::Bytes;
use serde::Deserialize;
use thiserror::Error;

/// Tunables for the fragment assembler.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FragmentConfig {
    /// Distinct message ids that may be in flight at once.
    pub max_pending_messages: usize,
    /// Maximum declared fragment count per message.
    pub max_fragments_per_message: u16,
    /// Maximum assembled message size in bytes.
    pub max_message_size: usize,
    /// Age limit for incomplete messages.
    pub fragment_timeout_ms: u64,
}

impl Default for FragmentConfig {
    fn default() -> Self {
        Self {
            max_pending_messages: 64,
            max_fragments_per_message: 64,
            max_message_size: 65_536,
            fragment_timeout_ms: 5000,
        }
    }
}

/// Reasons a fragment was refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FragmentError {
    #[error("fragment index {index} out of range for total {total}")]
    IndexOutOfRange { index: u16, total: u16 },
    #[error("declared total {0} exceeds the per-message fragment cap")]
    TooManyFragments(u16),
    #[error("fragment total {got} disagrees with established total {expected}")]
    TotalMismatch { expected: u16, got: u16 },
    #[error("duplicate fragment {index} for message {message_id}")]
    Duplicate { message_id: u32, index: u16 },
    #[error("message would exceed the size cap")]
    MessageTooLarge,
    #[error("too many messages pending assembly")]
    PendingLimit,
}

#[derive(Debug)]
struct PendingMessage {
    total: u16,
    first_fragment_ms: u64,
    total_bytes: usize,
    chunks: BTreeMap<u16, Bytes>,
}

/// Collects fragments by message id and emits assembled messages.
#[derive(Debug)]
pub struct FragmentAssembler {
    config: FragmentConfig,
    pending: AHashMap<u32, PendingMessage>,
    fragments_received: u64,
    messages_assembled: u64,
    messages_expired: u64,
}

impl FragmentAssembler {
    pub fn new(config: FragmentConfig) -> Self {
        Self {
            config,
            pending: AHashMap::default(),
            fragments_received: 0,
            messages_assembled: 0,
            messages_expired: 0,
        }
    }

    pub fn pending_messages(&self) -> usize {
        self.pending.len()
    }

    pub fn messages_assembled(&self) -> u64 {
        self.messages_assembled
    }

    pub fn messages_expired(&self) -> u64 {
        self.messages_expired
    }

    /// Adds one fragment. Returns the assembled message once the last
    /// fragment arrives, `None` while the message is still incomplete.
    pub fn add_fragment(
        &mut self,
        message_id: u32,
        index: u16,
        total: u16,
        chunk: Bytes,
        now_ms: u64,
    ) -> Result<Option<Bytes>, FragmentError> {
        self.fragments_received += 1;

        if total == 0 || index >= total {
            return Err(FragmentError::IndexOutOfRange { index, total });
        }
        if total > self.config.max_fragments_per_message {
            return Err(FragmentError::TooManyFragments(total));
        }

        if !self.pending.contains_key(&message_id) {
            if self.pending.len() >= self.config.max_pending_messages {
                return Err(FragmentError::PendingLimit);
            }
            self.pending.insert(
                message_id,
                PendingMessage {
                    total,
                    first_fragment_ms: now_ms,
                    total_bytes: 0,
                    chunks: BTreeMap::new(),
                },
            );
        }

        let message = self.pending.get_mut(&message_id).expect("entry ensured");

        if message.total != total {
            return Err(FragmentError::TotalMismatch {
                expected: message.total,
                got: total,
            });
        }
        if message.chunks.contains_key(&index) {
            return Err(FragmentError::Duplicate { message_id, index });
        }
        if message.total_bytes + chunk.len() > self.config.max_message_size {
            return Err(FragmentError::MessageTooLarge);
        }

        message.total_bytes += chunk.len();
        message.chunks.insert(index, chunk);

        if message.chunks.len() == usize::from(message.total) {
            let message = self.pending.remove(&message_id).expect("entry present");
            let mut assembled = Vec::with_capacity(message.total_bytes);
            for chunk in message.chunks.values() {
                assembled.extend_from_slice(chunk);
            }
            self.messages_assembled += 1;
            return Ok(Some(Bytes::from(assembled)));
        }

        Ok(None)
    }

    /// Evicts messages whose first fragment is older than the timeout.
    pub fn cleanup_expired(&mut self, now_ms: u64) -> usize {
        let timeout = self.config.fragment_timeout_ms;
        let before = self.pending.len();
        self.pending
            .retain(|_, message| now_ms.saturating_sub(message.first_fragment_ms) <= timeout);
        let cleaned = before - self.pending.len();
        self.messages_expired += cleaned as u64;
        cleaned
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        self.fragments_received = 0;
        self.messages_assembled = 0;
        self.messages_expired = 0;
    }
}
