//! `EngineConfig` — the process-wide configuration table of §6, constructed
//! once and held immutably by `SessionEngine`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub one_time_key_low_watermark: usize,
    pub one_time_key_batch_size: usize,
    pub key_rotation_interval_days: i64,
    pub minimum_channel_operators: usize,
    pub minimum_channel_members: usize,
    pub max_skipped_message_keys: u64,
    /// Process-wide AEAD associated data for this session's ratchet, fixed
    /// at session creation. Configurable so test vectors can pin it.
    pub ratchet_associated_data: Vec<u8>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            one_time_key_low_watermark: 10,
            one_time_key_batch_size: 100,
            key_rotation_interval_days: 7,
            minimum_channel_operators: dl_proto::communication::MINIMUM_CHANNEL_OPERATORS,
            minimum_channel_members: dl_proto::communication::MINIMUM_CHANNEL_MEMBERS,
            max_skipped_message_keys: dl_crypto::ratchet::DEFAULT_MAX_SKIPPED_MESSAGE_KEYS,
            ratchet_associated_data: b"dl-session-v1".to_vec(),
        }
    }
}
