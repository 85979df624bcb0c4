//! Per-batch entry point tying the slot pool, transfer queue and predictor together
//!
//! `prepare_batch` makes every required adapter readable before compute runs,
//! blocking only where it has to, then fires best-effort prefetches for the
//! adapters the predictor expects next. Prefetches only ever target Empty
//! slots; making room is the external eviction policy's job.
//!
//! Per adapter:
//! ```text
//! NotResident ──miss: blocking copy──────────────────────────▶ Ready
//! NotResident ──prefetch──▶ Filling ──wait / reap (hit)──────▶ Ready
//! Ready ──evict (external)───────────────────────────────────▶ NotResident
//! ```

use crate::adapter::{AdapterId, HostBuffer, WeightSource};
use crate::config::{PoolConfig, PrefetchConfig};
use crate::device::slot_pool::{SlotPool, SlotState};
use crate::device::transfer::{CopyBackend, HostCopy, TransferEngine, TransferToken};
use crate::error::PoolError;
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::prefetch::predictor::UsagePredictor;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What `prepare_batch` did for one batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub hits: usize,
    pub misses: usize,
    pub prefetches_issued: usize,
    pub prefetches_skipped: usize,
}

/// Result of a single prefetch request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchDecision {
    /// A copy was submitted to the transfer queue
    Issued,
    /// Already resident, nothing to do
    Resident,
    /// A copy for this adapter is already in flight
    InFlight,
    /// No Empty slot; prefetch never evicts
    NoEmptySlot,
    /// `enable_prefetch` is off; the pool is purely reactive
    Disabled,
    /// Loading or submitting failed; absorbed
    Failed,
}

/// How one required adapter was satisfied
enum Resolution {
    PrefetchHit,
    ResidentHit,
    ResidentReuse,
    Miss,
}

/// Predictive asynchronous prefetch over a fixed pool of adapter slots
pub struct PrefetchOrchestrator {
    config: PrefetchConfig,
    pool: SlotPool,
    engine: TransferEngine,
    predictor: UsagePredictor,
    metrics: MetricsCollector,
    source: Arc<dyn WeightSource>,
    /// Unconsumed prefetch tokens, at most one per adapter
    in_flight: HashMap<AdapterId, TransferToken>,
    /// Landed by a prefetch and not yet required by any batch
    prefetched: HashSet<AdapterId>,
    /// Batch that last failed with `SlotPoolExhausted`, already in the history
    retrying: Option<BTreeSet<AdapterId>>,
}

impl PrefetchOrchestrator {
    /// Build with the plain host-copy backend
    pub fn new(
        pool_config: &PoolConfig,
        config: PrefetchConfig,
        source: Arc<dyn WeightSource>,
    ) -> Result<Self, PoolError> {
        Self::with_backend(pool_config, config, source, Arc::new(HostCopy::new()))
    }

    /// Build over a custom copy backend (throttled link, fault injection).
    /// Starts the transfer worker; fails with `InvalidConfig` on an empty pool
    /// or zero history window.
    pub fn with_backend(
        pool_config: &PoolConfig,
        config: PrefetchConfig,
        source: Arc<dyn WeightSource>,
        backend: Arc<dyn CopyBackend>,
    ) -> Result<Self, PoolError> {
        if pool_config.num_slots == 0 || pool_config.slot_bytes == 0 {
            return Err(PoolError::InvalidConfig {
                reason: "pool needs at least one non-empty slot".into(),
            });
        }
        if config.history_window == 0 {
            return Err(PoolError::InvalidConfig {
                reason: "history_window must be at least 1".into(),
            });
        }

        let pool = SlotPool::new(pool_config.num_slots, pool_config.slot_bytes);
        let engine = TransferEngine::new(&pool, backend)?;

        info!(
            "Adapter pool ready: {} slots, prefetch={}, history_window={}, max_predictions={}",
            pool_config.num_slots, config.enable_prefetch, config.history_window, config.max_predictions
        );

        Ok(Self {
            predictor: UsagePredictor::new(config.history_window),
            config,
            pool,
            engine,
            metrics: MetricsCollector::new(),
            source,
            in_flight: HashMap::new(),
            prefetched: HashSet::new(),
            retrying: None,
        })
    }

    /// Make every adapter in `required_ids` readable, then prefetch predicted ones.
    ///
    /// Fails with `SlotPoolExhausted` when a required adapter has nowhere to go;
    /// the scheduler must evict and call again. Adapters resolved before the
    /// failure stay resident. A retry with the same set is not recorded in the
    /// predictor a second time.
    pub fn prepare_batch(
        &mut self,
        required_ids: &BTreeSet<AdapterId>,
    ) -> Result<BatchOutcome, PoolError> {
        let mut outcome = BatchOutcome::default();

        self.reap_completed();
        if self.retrying.take().as_ref() != Some(required_ids) {
            self.predictor.record_batch(required_ids);
        }

        for uid in required_ids {
            let resolution = match self.resolve_required(uid) {
                Ok(resolution) => resolution,
                Err(e) => {
                    if e.is_retryable() {
                        self.retrying = Some(required_ids.clone());
                    }
                    return Err(e);
                }
            };
            match resolution {
                Resolution::PrefetchHit | Resolution::ResidentHit => outcome.hits += 1,
                Resolution::Miss => outcome.misses += 1,
                Resolution::ResidentReuse => {}
            }
        }

        if !self.config.enable_prefetch {
            return Ok(outcome);
        }

        let predicted = self
            .predictor
            .predict(required_ids, self.config.max_predictions);
        for uid in &predicted {
            match self.request_prefetch(uid) {
                PrefetchDecision::Issued => outcome.prefetches_issued += 1,
                PrefetchDecision::NoEmptySlot => outcome.prefetches_skipped += 1,
                _ => {}
            }
        }

        Ok(outcome)
    }

    fn resolve_required(&mut self, uid: &AdapterId) -> Result<Resolution, PoolError> {
        if self.pool.is_ready(uid) {
            if self.prefetched.remove(uid) {
                debug!("Adapter {}: hit (prefetched earlier)", uid);
                self.metrics.record_prefetch_ready_hit();
                return Ok(Resolution::PrefetchHit);
            }
            if self.config.enable_prefetch {
                self.metrics.record_resident_hit();
                return Ok(Resolution::ResidentHit);
            }
            self.metrics.record_resident_reuse();
            return Ok(Resolution::ResidentReuse);
        }

        if let Some(token) = self.in_flight.remove(uid) {
            let slot = token.target_slot();
            match self.engine.wait(token) {
                Ok(receipt) => {
                    self.pool.mark_ready(slot, uid)?;
                    self.metrics.record_transfer(receipt.copy_time, receipt.bytes);
                    self.metrics.record_prefetch_wait_hit(receipt.waited);
                    debug!(
                        "Adapter {}: hit (waited {:.3}ms on slot {})",
                        uid,
                        receipt.waited.as_secs_f64() * 1000.0,
                        slot
                    );
                    return Ok(Resolution::PrefetchHit);
                }
                Err(e) => {
                    // The batch still gets its adapter through the miss path below
                    warn!("Prefetch of {} failed, loading on demand: {}", uid, e);
                    self.pool.free(slot);
                    self.metrics.record_prefetch_failure();
                }
            }
        }

        self.load_blocking(uid)?;
        Ok(Resolution::Miss)
    }

    fn load_blocking(&mut self, uid: &AdapterId) -> Result<(), PoolError> {
        let slot = self
            .pool
            .allocate_empty_slot()
            .ok_or_else(|| PoolError::SlotPoolExhausted {
                uid: uid.clone(),
                num_slots: self.pool.num_slots(),
            })?;
        let host = self.load_host(uid)?;

        self.pool.mark_filling(slot, uid)?;
        match self.engine.blocking_copy(uid, &host, slot) {
            Ok(copy_time) => {
                self.pool.mark_ready(slot, uid)?;
                self.metrics.record_miss(copy_time, host.len());
                debug!(
                    "Adapter {}: miss (blocking copy {:.3}ms into slot {})",
                    uid,
                    copy_time.as_secs_f64() * 1000.0,
                    slot
                );
                Ok(())
            }
            Err(e) => {
                self.pool.free(slot);
                Err(e)
            }
        }
    }

    /// Issue a non-blocking copy of `uid` into an Empty slot, if one exists.
    /// Repeated requests for an adapter that is resident or in flight are no-ops.
    pub fn request_prefetch(&mut self, uid: &AdapterId) -> PrefetchDecision {
        if !self.config.enable_prefetch {
            return PrefetchDecision::Disabled;
        }
        if self.in_flight.contains_key(uid) {
            return PrefetchDecision::InFlight;
        }
        if self.pool.find_slot(uid).is_some() {
            return PrefetchDecision::Resident;
        }

        let Some(slot) = self.pool.allocate_empty_slot() else {
            debug!("Prefetch of {} skipped: no empty slot", uid);
            self.metrics.record_prefetch_skipped();
            return PrefetchDecision::NoEmptySlot;
        };

        let host = match self.load_host(uid) {
            Ok(host) => host,
            Err(e) => {
                warn!("Prefetch of {} dropped: {}", uid, e);
                self.metrics.record_prefetch_failure();
                return PrefetchDecision::Failed;
            }
        };

        if let Err(e) = self.pool.mark_filling(slot, uid) {
            warn!("Prefetch of {} dropped: {}", uid, e);
            self.metrics.record_prefetch_failure();
            return PrefetchDecision::Failed;
        }

        match self.engine.submit(uid, host, slot) {
            Ok(token) => {
                debug!("Prefetch of {} issued into slot {}", uid, slot);
                self.in_flight.insert(uid.clone(), token);
                self.metrics.record_prefetch_issued();
                PrefetchDecision::Issued
            }
            Err(e) => {
                warn!("Prefetch of {} dropped: {}", uid, e);
                self.pool.free(slot);
                self.metrics.record_prefetch_failure();
                PrefetchDecision::Failed
            }
        }
    }

    /// Resolve prefetch tokens that have already completed, without blocking
    fn reap_completed(&mut self) {
        let done: Vec<AdapterId> = self
            .in_flight
            .iter()
            .filter(|(_, token)| self.engine.poll(token))
            .map(|(uid, _)| uid.clone())
            .collect();

        for uid in done {
            if let Some(token) = self.in_flight.remove(&uid) {
                self.settle_prefetch(uid, token);
            }
        }
    }

    /// Block until every outstanding prefetch has landed or failed
    pub fn wait_in_flight(&mut self) {
        let pending: Vec<(AdapterId, TransferToken)> = self.in_flight.drain().collect();
        for (uid, token) in pending {
            self.settle_prefetch(uid, token);
        }
    }

    fn settle_prefetch(&mut self, uid: AdapterId, token: TransferToken) {
        let slot = token.target_slot();
        match self.engine.wait(token) {
            Ok(receipt) => {
                if let Err(e) = self.pool.mark_ready(slot, &uid) {
                    warn!("Prefetched {} could not be marked ready: {}", uid, e);
                    self.pool.free(slot);
                    return;
                }
                self.metrics.record_transfer(receipt.copy_time, receipt.bytes);
                self.prefetched.insert(uid);
            }
            Err(e) => {
                warn!("Prefetch failed, slot {} returned to pool: {}", slot, e);
                self.pool.free(slot);
                self.metrics.record_prefetch_failure();
            }
        }
    }

    /// External eviction signal: discard `uid`, returning the slot it occupied.
    /// A copy still in flight is allowed to finish first.
    pub fn evict(&mut self, uid: &AdapterId) -> Option<usize> {
        if let Some(token) = self.in_flight.remove(uid) {
            if let Err(e) = self.engine.wait(token) {
                debug!("Discarded failed prefetch of {}: {}", uid, e);
            }
        }
        let slot = self.pool.find_slot(uid)?;
        self.pool.free(slot);
        self.prefetched.remove(uid);
        self.metrics.record_eviction();
        debug!("Evicted adapter {} from slot {}", uid, slot);
        Some(slot)
    }

    /// External signal that `slot` is free, returning its previous occupant
    pub fn free_slot(&mut self, slot: usize) -> Option<AdapterId> {
        let uid = self.pool.slot(slot)?.occupant().cloned()?;
        self.evict(&uid).map(|_| uid)
    }

    /// Read a resident adapter's weights.
    /// Fails with `SlotNotReady` unless its transfer has been observed as done.
    pub fn with_adapter<R>(
        &self,
        uid: &AdapterId,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Result<R, PoolError> {
        let slot = self
            .pool
            .find_slot(uid)
            .ok_or_else(|| PoolError::NotResident { uid: uid.clone() })?;
        self.pool.read(slot, f)
    }

    /// Snapshot of the metrics, also written to the log
    pub fn log_metrics(&self) -> MetricsSnapshot {
        let snapshot = self.metrics.snapshot();
        info!("Adapter prefetch: {}", snapshot);
        snapshot
    }

    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn predictor(&self) -> &UsagePredictor {
        &self.predictor
    }

    pub fn pool(&self) -> &SlotPool {
        &self.pool
    }

    pub fn config(&self) -> &PrefetchConfig {
        &self.config
    }

    /// Adapters with Ready slots
    pub fn resident_adapters(&self) -> Vec<AdapterId> {
        self.pool.resident()
    }

    /// Adapters whose prefetch token has not been consumed yet
    pub fn in_flight(&self) -> Vec<AdapterId> {
        let mut ids: Vec<AdapterId> = self.in_flight.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn num_empty_slots(&self) -> usize {
        self.pool.num_empty()
    }

    /// Copies submitted to the transfer queue so far
    pub fn transfers_submitted(&self) -> u64 {
        self.engine.submitted()
    }

    /// State of the slot holding `uid`, if any
    pub fn adapter_state(&self, uid: &AdapterId) -> Option<SlotState> {
        self.pool.find_slot(uid).and_then(|slot| self.pool.state(slot))
    }

    fn load_host(&self, uid: &AdapterId) -> Result<HostBuffer, PoolError> {
        self.source
            .load_host_buffer(uid)
            .map_err(|e| PoolError::AdapterLoad {
                uid: uid.clone(),
                reason: format!("{:#}", e),
            })
    }
}
