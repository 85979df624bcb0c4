//! Error types for the adapter slot pool and its transfer queue

use crate::adapter::AdapterId;

/// Errors surfaced by the slot pool, the transfer engine and the orchestrator.
///
/// Only failures on the required-adapter path reach the scheduler. Prefetch
/// failures are absorbed inside the orchestrator and show up in the metrics.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("No empty slot for adapter {uid} ({num_slots} slots, all occupied); evict and retry")]
    SlotPoolExhausted { uid: AdapterId, num_slots: usize },

    #[error("Transfer of adapter {uid} into slot {slot} failed: {reason}")]
    TransferFailure {
        uid: AdapterId,
        slot: usize,
        reason: String,
    },

    #[error("Failed to load host weights for adapter {uid}: {reason}")]
    AdapterLoad { uid: AdapterId, reason: String },

    #[error("Adapter {uid} is {size} bytes, slot capacity is {slot_bytes} bytes")]
    AdapterTooLarge {
        uid: AdapterId,
        size: usize,
        slot_bytes: usize,
    },

    #[error("Adapter {uid} is not resident")]
    NotResident { uid: AdapterId },

    #[error("Slot {slot} is not ready for reads")]
    SlotNotReady { slot: usize },

    #[error("Adapter {uid} already occupies slot {slot}")]
    AlreadyResident { uid: AdapterId, slot: usize },

    #[error("Slot index {slot} out of range")]
    InvalidSlot { slot: usize },

    #[error("Slot {slot} is not {expected}")]
    InvalidSlotState { slot: usize, expected: &'static str },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("Failed to start transfer queue: {0}")]
    QueueSpawn(#[from] std::io::Error),
}

impl PoolError {
    /// Whether the scheduler should evict an adapter and call `prepare_batch` again
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SlotPoolExhausted { .. })
    }
}
