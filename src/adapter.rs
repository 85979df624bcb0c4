//! Adapter identity, host-resident weights and the collaborator interfaces
//!
//! The pool never reads adapter files itself. Weights arrive through a
//! [`WeightSource`] as host buffers, and eviction decisions come from an
//! [`EvictionPolicy`] driven by the scheduler.

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Unique identifier of a LoRA adapter (one per tenant / request class)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AdapterId(Arc<str>);

impl AdapterId {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AdapterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AdapterId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for AdapterId {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

impl From<u64> for AdapterId {
    fn from(n: u64) -> Self {
        Self::new(n.to_string())
    }
}

/// Immutable host-resident adapter weights, cheap to clone into the transfer queue
#[derive(Clone)]
pub struct HostBuffer {
    data: Arc<[u8]>,
}

impl HostBuffer {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Arc::from(data),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBuffer").field("len", &self.len()).finish()
    }
}

/// Source of host-resident adapter weights (the weight-loading collaborator)
pub trait WeightSource: Send + Sync {
    fn load_host_buffer(&self, uid: &AdapterId) -> Result<HostBuffer>;
}

/// Chooses a resident adapter to discard under slot pressure.
///
/// Invoked by the scheduler, never by the pool itself, after `prepare_batch`
/// reports `SlotPoolExhausted`.
pub trait EvictionPolicy {
    fn evict_one(&mut self) -> Option<AdapterId>;
}

/// Registry of adapter weights already staged in host memory
#[derive(Default)]
pub struct InMemoryWeights {
    buffers: HashMap<AdapterId, HostBuffer>,
}

impl InMemoryWeights {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deterministic weights for adapters `0..n`, `bytes` each.
    /// Every adapter gets a distinct byte pattern so slot contents can be verified.
    pub fn synthetic(n: usize, bytes: usize) -> Self {
        let mut weights = Self::new();
        for i in 0..n {
            let seed = (i as u8).wrapping_mul(31).wrapping_add(7);
            let data: Vec<u8> = (0..bytes).map(|j| seed ^ (j as u8)).collect();
            weights.insert(AdapterId::from(i as u64), HostBuffer::new(data));
        }
        weights
    }

    pub fn insert(&mut self, uid: AdapterId, buffer: HostBuffer) {
        self.buffers.insert(uid, buffer);
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

impl WeightSource for InMemoryWeights {
    fn load_host_buffer(&self, uid: &AdapterId) -> Result<HostBuffer> {
        self.buffers
            .get(uid)
            .cloned()
            .ok_or_else(|| anyhow!("Unknown adapter: {}", uid))
    }
}
