//! Fixed pool of device-resident adapter slots
//!
//! Each slot is one fixed-size buffer that holds at most one adapter. The
//! occupancy map (which adapter lives where, and in which state) has a single
//! writer: the orchestrator. The transfer queue only touches buffer bytes.

use crate::adapter::AdapterId;
use crate::error::PoolError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Lifecycle of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// No adapter, free for allocation
    Empty,
    /// A copy into the slot has been issued but its token is not resolved
    Filling,
    /// Copy observed as done; contents are defined for reads
    Ready,
}

impl std::fmt::Display for SlotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "empty"),
            Self::Filling => write!(f, "filling"),
            Self::Ready => write!(f, "ready"),
        }
    }
}

/// Occupancy record for one slot
#[derive(Debug, Clone)]
pub struct AdapterSlot {
    pub slot_index: usize,
    /// Adapter being copied in (Filling) or resident (Ready)
    occupant: Option<AdapterId>,
    pub state: SlotState,
}

impl AdapterSlot {
    fn empty(slot_index: usize) -> Self {
        Self {
            slot_index,
            occupant: None,
            state: SlotState::Empty,
        }
    }

    /// The adapter whose weights are readable from this slot.
    /// Only set once the slot's transfer has been observed as done.
    pub fn resident_uid(&self) -> Option<&AdapterId> {
        match self.state {
            SlotState::Ready => self.occupant.as_ref(),
            _ => None,
        }
    }

    /// The adapter that owns the slot, whether still filling or ready
    pub fn occupant(&self) -> Option<&AdapterId> {
        self.occupant.as_ref()
    }
}

/// Bytes of one device slot
pub(crate) struct SlotBuffer {
    pub(crate) data: Vec<u8>,
    /// Number of valid bytes written by the last copy
    pub(crate) len: usize,
}

/// The device memory backing the pool, shared with the transfer worker
pub(crate) struct DeviceBuffers {
    slot_bytes: usize,
    buffers: Vec<Mutex<SlotBuffer>>,
}

impl DeviceBuffers {
    fn new(num_slots: usize, slot_bytes: usize) -> Self {
        let buffers = (0..num_slots)
            .map(|_| {
                Mutex::new(SlotBuffer {
                    data: vec![0u8; slot_bytes],
                    len: 0,
                })
            })
            .collect();
        Self {
            slot_bytes,
            buffers,
        }
    }

    pub(crate) fn slot_bytes(&self) -> usize {
        self.slot_bytes
    }

    pub(crate) fn slot(&self, index: usize) -> Option<&Mutex<SlotBuffer>> {
        self.buffers.get(index)
    }
}

/// Pool of N fixed-size device slots and the adapter ↔ slot bijection
pub struct SlotPool {
    slots: Vec<AdapterSlot>,
    /// occupant → slot, for every non-empty slot
    index: HashMap<AdapterId, usize>,
    buffers: Arc<DeviceBuffers>,
}

impl SlotPool {
    pub fn new(num_slots: usize, slot_bytes: usize) -> Self {
        debug!(
            "Slot pool: {} slots x {:.2} MB",
            num_slots,
            slot_bytes as f64 / (1024.0 * 1024.0)
        );
        Self {
            slots: (0..num_slots).map(AdapterSlot::empty).collect(),
            index: HashMap::new(),
            buffers: Arc::new(DeviceBuffers::new(num_slots, slot_bytes)),
        }
    }

    pub(crate) fn buffers(&self) -> Arc<DeviceBuffers> {
        Arc::clone(&self.buffers)
    }

    /// Slot currently owned by `uid`, in either Filling or Ready state
    pub fn find_slot(&self, uid: &AdapterId) -> Option<usize> {
        self.index.get(uid).copied()
    }

    /// Lowest-indexed Empty slot, if any.
    /// Does not reserve the slot; the caller marks it filling immediately.
    pub fn allocate_empty_slot(&self) -> Option<usize> {
        self.slots
            .iter()
            .find(|s| s.state == SlotState::Empty)
            .map(|s| s.slot_index)
    }

    /// Empty → Filling for `uid`
    pub fn mark_filling(&mut self, slot: usize, uid: &AdapterId) -> Result<(), PoolError> {
        if let Some(&existing) = self.index.get(uid) {
            return Err(PoolError::AlreadyResident {
                uid: uid.clone(),
                slot: existing,
            });
        }
        let entry = self.slot_mut(slot)?;
        if entry.state != SlotState::Empty {
            return Err(PoolError::InvalidSlotState {
                slot,
                expected: "empty",
            });
        }
        entry.state = SlotState::Filling;
        entry.occupant = Some(uid.clone());
        self.index.insert(uid.clone(), slot);
        Ok(())
    }

    /// Filling → Ready, once the slot's token has been observed as done
    pub fn mark_ready(&mut self, slot: usize, uid: &AdapterId) -> Result<(), PoolError> {
        let entry = self.slot_mut(slot)?;
        if entry.state != SlotState::Filling || entry.occupant.as_ref() != Some(uid) {
            return Err(PoolError::InvalidSlotState {
                slot,
                expected: "filling",
            });
        }
        entry.state = SlotState::Ready;
        Ok(())
    }

    /// Return a slot to Empty, handing back its previous occupant
    pub fn free(&mut self, slot: usize) -> Option<AdapterId> {
        let entry = self.slots.get_mut(slot)?;
        entry.state = SlotState::Empty;
        let previous = entry.occupant.take();
        if let Some(uid) = &previous {
            self.index.remove(uid);
        }
        previous
    }

    pub fn state(&self, slot: usize) -> Option<SlotState> {
        self.slots.get(slot).map(|s| s.state)
    }

    pub fn slot(&self, slot: usize) -> Option<&AdapterSlot> {
        self.slots.get(slot)
    }

    pub fn slots(&self) -> &[AdapterSlot] {
        &self.slots
    }

    /// Whether `uid` is resident and readable
    pub fn is_ready(&self, uid: &AdapterId) -> bool {
        self.find_slot(uid)
            .and_then(|s| self.state(s))
            .map_or(false, |state| state == SlotState::Ready)
    }

    /// Run `f` over the valid bytes of a Ready slot
    pub fn read<R>(&self, slot: usize, f: impl FnOnce(&[u8]) -> R) -> Result<R, PoolError> {
        let entry = self.slots.get(slot).ok_or(PoolError::InvalidSlot { slot })?;
        if entry.state != SlotState::Ready {
            return Err(PoolError::SlotNotReady { slot });
        }
        let buffer = self
            .buffers
            .slot(slot)
            .ok_or(PoolError::InvalidSlot { slot })?
            .lock();
        Ok(f(&buffer.data[..buffer.len]))
    }

    /// Adapters currently readable, ordered by slot
    pub fn resident(&self) -> Vec<AdapterId> {
        self.slots
            .iter()
            .filter_map(|s| s.resident_uid().cloned())
            .collect()
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn num_empty(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state == SlotState::Empty)
            .count()
    }

    pub fn slot_bytes(&self) -> usize {
        self.buffers.slot_bytes()
    }

    fn slot_mut(&mut self, slot: usize) -> Result<&mut AdapterSlot, PoolError> {
        self.slots
            .get_mut(slot)
            .ok_or(PoolError::InvalidSlot { slot })
    }
}
