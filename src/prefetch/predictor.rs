//! Frequency/recency predictor over a bounded window of recent batches
//!
//! Keeps the adapter sets of the last `history_window` batches in a ring and a
//! frequency table that always matches the ring's contents: every set pushed
//! adds one per adapter, and every set that falls out of the window takes its
//! contribution back out.

use crate::adapter::AdapterId;
use std::collections::{BTreeSet, HashMap, VecDeque};
use tracing::debug;

pub const DEFAULT_HISTORY_WINDOW: usize = 10;
pub const DEFAULT_MAX_PREDICTIONS: usize = 3;

/// Predicts which adapters the next batch will need
pub struct UsagePredictor {
    capacity: usize,
    /// front = oldest batch, back = most recent
    history: VecDeque<BTreeSet<AdapterId>>,
    /// Number of batches in `history` that contain each adapter
    frequency: HashMap<AdapterId, u64>,
    /// Sequence number of the most recent batch each adapter appeared in
    last_seen: HashMap<AdapterId, u64>,
    /// Batches recorded since creation
    batches_seen: u64,
}

impl UsagePredictor {
    /// `capacity` is clamped to at least one batch
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            history: VecDeque::with_capacity(capacity),
            frequency: HashMap::new(),
            last_seen: HashMap::new(),
            batches_seen: 0,
        }
    }

    /// Push a batch's adapter set, expiring the oldest set if the window is full
    pub fn record_batch(&mut self, ids: &BTreeSet<AdapterId>) {
        if self.history.len() == self.capacity {
            if let Some(expired) = self.history.pop_front() {
                self.uncount(&expired);
            }
        }

        self.batches_seen += 1;
        for uid in ids {
            *self.frequency.entry(uid.clone()).or_insert(0) += 1;
            self.last_seen.insert(uid.clone(), self.batches_seen);
        }
        self.history.push_back(ids.clone());

        debug_assert_eq!(self.total_mass(), self.window_mass());
    }

    fn uncount(&mut self, expired: &BTreeSet<AdapterId>) {
        for uid in expired {
            if let Some(count) = self.frequency.get_mut(uid) {
                *count -= 1;
                if *count == 0 {
                    self.frequency.remove(uid);
                    self.last_seen.remove(uid);
                }
            }
        }
    }

    /// Ranked adapters likely needed next, at most `max_predictions` long.
    ///
    /// Adapters of the current batch come first (decode continuation), then the
    /// rest of the window by descending frequency, ties going to the adapter seen
    /// most recently, then by id.
    pub fn predict(&self, current_ids: &BTreeSet<AdapterId>, max_predictions: usize) -> Vec<AdapterId> {
        let mut predicted: Vec<AdapterId> = current_ids.iter().take(max_predictions).cloned().collect();
        if predicted.len() == max_predictions {
            return predicted;
        }

        let mut candidates: Vec<(&AdapterId, u64, u64)> = self
            .frequency
            .iter()
            .filter(|(uid, _)| !current_ids.contains(*uid))
            .map(|(uid, &count)| (uid, count, self.last_seen.get(uid).copied().unwrap_or(0)))
            .collect();

        candidates.sort_by(|a, b| {
            b.1.cmp(&a.1)
                .then_with(|| b.2.cmp(&a.2))
                .then_with(|| a.0.cmp(b.0))
        });

        predicted.extend(
            candidates
                .into_iter()
                .take(max_predictions - predicted.len())
                .map(|(uid, _, _)| uid.clone()),
        );

        debug!("Predicted next adapters: {:?}", predicted);
        predicted
    }

    /// Number of window batches containing `uid`
    pub fn frequency(&self, uid: &AdapterId) -> u64 {
        self.frequency.get(uid).copied().unwrap_or(0)
    }

    /// Sum of all frequency counts
    pub fn total_mass(&self) -> u64 {
        self.frequency.values().sum()
    }

    /// Sum of the set sizes currently in the window (always equals `total_mass`)
    pub fn window_mass(&self) -> u64 {
        self.history.iter().map(|s| s.len() as u64).sum()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn tracked_adapters(&self) -> usize {
        self.frequency.len()
    }

    /// Frequency table sorted by adapter id (for metrics/debugging)
    pub fn frequency_snapshot(&self) -> Vec<(AdapterId, u64)> {
        let mut snapshot: Vec<(AdapterId, u64)> =
            self.frequency.iter().map(|(k, &v)| (k.clone(), v)).collect();
        snapshot.sort_by(|a, b| a.0.cmp(&b.0));
        snapshot
    }
}

impl Default for UsagePredictor {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_WINDOW)
    }
}
