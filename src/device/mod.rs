//! Device-side state: the slot pool and the transfer queue that fills it

pub mod slot_pool;
pub mod transfer;

#[cfg(test)]
pub(crate) mod testing;

pub use slot_pool::{AdapterSlot, SlotPool, SlotState};
pub use transfer::{
    CopyBackend, HostCopy, TransferEngine, TransferReceipt, TransferStatus, TransferToken,
};
