//! Predictive asynchronous prefetch of LoRA adapters into device slots
//!
//! A serving engine keeps a fixed pool of device buffers ("slots"), each able to
//! hold one adapter's weights. Before every batch the scheduler calls
//! [`PrefetchOrchestrator::prepare_batch`] with the adapters the batch needs:
//!
//! - adapters already resident, or already landed by a prefetch, are hits;
//! - adapters with a copy in flight are waited on (also hits);
//! - anything else is copied synchronously (a miss), or fails with
//!   [`PoolError::SlotPoolExhausted`] when no slot is empty.
//!
//! The orchestrator then asks the [`UsagePredictor`] which adapters the next
//! batch is likely to need and queues non-blocking copies for them into empty
//! slots, so the next `prepare_batch` can hit.

pub mod adapter;
pub mod config;
pub mod device;
pub mod error;
pub mod metrics;
pub mod prefetch;
pub mod simulate;

pub use adapter::{AdapterId, EvictionPolicy, HostBuffer, InMemoryWeights, WeightSource};
pub use config::{Config, PoolConfig, PrefetchConfig};
pub use device::{CopyBackend, HostCopy, SlotPool, SlotState, TransferEngine, TransferToken};
pub use error::PoolError;
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use prefetch::{BatchOutcome, PrefetchDecision, PrefetchOrchestrator, UsagePredictor};
