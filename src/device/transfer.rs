//! Host → device transfer queue with completion tokens
//!
//! Copies submitted here run on a dedicated worker thread (the transfer queue),
//! strictly in submission order and concurrently with the caller (the compute
//! queue). Each submission returns a [`TransferToken`]; the slot's bytes are
//! undefined until that token is observed as done via [`TransferEngine::wait`]
//! or [`TransferEngine::poll`].
//!
//! There is no cancellation: once submitted, a copy runs to completion.

use crate::adapter::{AdapterId, HostBuffer};
use crate::device::slot_pool::{DeviceBuffers, SlotPool};
use crate::error::PoolError;
use anyhow::Result;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Performs the actual byte movement into a slot buffer
pub trait CopyBackend: Send + Sync {
    fn copy(&self, uid: &AdapterId, src: &[u8], dst: &mut [u8]) -> Result<()>;
}

/// Plain host-memory copy, optionally throttled to emulate a PCIe link
#[derive(Debug, Clone, Default)]
pub struct HostCopy {
    bytes_per_sec: Option<u64>,
}

impl HostCopy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit throughput to `mb_per_sec` (0 = unthrottled)
    pub fn throttled(mb_per_sec: u64) -> Self {
        Self {
            bytes_per_sec: (mb_per_sec > 0).then(|| mb_per_sec.saturating_mul(1024 * 1024)),
        }
    }
}

impl CopyBackend for HostCopy {
    fn copy(&self, _uid: &AdapterId, src: &[u8], dst: &mut [u8]) -> Result<()> {
        let start = Instant::now();
        dst.copy_from_slice(src);
        if let Some(bps) = self.bytes_per_sec {
            let target = Duration::from_secs_f64(src.len() as f64 / bps as f64);
            if let Some(remaining) = target.checked_sub(start.elapsed()) {
                std::thread::sleep(remaining);
            }
        }
        Ok(())
    }
}

/// Completion state of a submitted copy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    Pending,
    Done,
    Failed(String),
}

struct CompletionState {
    status: TransferStatus,
    copy_time: Duration,
    bytes: usize,
}

/// Shared between the worker (writer) and the token (reader)
struct Completion {
    state: Mutex<CompletionState>,
    signal: Condvar,
}

impl Completion {
    fn new() -> Self {
        Self {
            state: Mutex::new(CompletionState {
                status: TransferStatus::Pending,
                copy_time: Duration::ZERO,
                bytes: 0,
            }),
            signal: Condvar::new(),
        }
    }

    fn finish(&self, result: std::result::Result<(Duration, usize), String>) {
        let mut state = self.state.lock();
        match result {
            Ok((copy_time, bytes)) => {
                state.status = TransferStatus::Done;
                state.copy_time = copy_time;
                state.bytes = bytes;
            }
            Err(reason) => state.status = TransferStatus::Failed(reason),
        }
        self.signal.notify_all();
    }
}

/// Handle to one in-flight (or completed, not yet consumed) copy.
/// Consumed by [`TransferEngine::wait`].
pub struct TransferToken {
    uid: AdapterId,
    target_slot: usize,
    issued_at: Instant,
    completion: Arc<Completion>,
}

impl TransferToken {
    pub fn uid(&self) -> &AdapterId {
        &self.uid
    }

    pub fn target_slot(&self) -> usize {
        self.target_slot
    }

    pub fn issued_at(&self) -> Instant {
        self.issued_at
    }

    pub fn status(&self) -> TransferStatus {
        self.completion.state.lock().status.clone()
    }
}

impl std::fmt::Debug for TransferToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferToken")
            .field("uid", &self.uid)
            .field("target_slot", &self.target_slot)
            .field("status", &self.status())
            .finish()
    }
}

/// Outcome of resolving a token
#[derive(Debug, Clone)]
pub struct TransferReceipt {
    pub uid: AdapterId,
    pub slot: usize,
    /// Time the caller spent blocked in `wait`
    pub waited: Duration,
    /// Time the copy itself took on the transfer queue
    pub copy_time: Duration,
    pub bytes: usize,
}

struct TransferJob {
    uid: AdapterId,
    host: HostBuffer,
    slot: usize,
    completion: Arc<Completion>,
}

/// Asynchronous copy engine backed by a dedicated transfer thread
pub struct TransferEngine {
    sender: Option<Sender<TransferJob>>,
    worker: Option<JoinHandle<()>>,
    buffers: Arc<DeviceBuffers>,
    backend: Arc<dyn CopyBackend>,
    submitted: AtomicU64,
}

impl TransferEngine {
    /// Start the transfer queue for the slots of `pool`
    pub fn new(pool: &SlotPool, backend: Arc<dyn CopyBackend>) -> Result<Self, PoolError> {
        let buffers = pool.buffers();
        let (sender, receiver) = unbounded::<TransferJob>();

        let bg_buffers = Arc::clone(&buffers);
        let bg_backend = Arc::clone(&backend);
        let worker = std::thread::Builder::new()
            .name("adapter-transfer".into())
            .spawn(move || Self::transfer_loop(receiver, bg_buffers, bg_backend))?;

        info!("Transfer queue started ({} slots)", pool.num_slots());

        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
            buffers,
            backend,
            submitted: AtomicU64::new(0),
        })
    }

    fn transfer_loop(
        receiver: Receiver<TransferJob>,
        buffers: Arc<DeviceBuffers>,
        backend: Arc<dyn CopyBackend>,
    ) {
        // Ends once every sender is dropped and the queue has drained
        for job in receiver.iter() {
            let result = copy_into_slot(&buffers, backend.as_ref(), &job.uid, job.slot, &job.host)
                .map(|copy_time| (copy_time, job.host.len()));
            if let Err(reason) = &result {
                debug!("Transfer of {} into slot {} failed: {}", job.uid, job.slot, reason);
            }
            job.completion.finish(result);
        }
        debug!("Transfer queue drained, worker exiting");
    }

    /// Queue a non-blocking copy of `host` into `target_slot`.
    /// Returns immediately with a Pending token.
    pub fn submit(
        &self,
        uid: &AdapterId,
        host: HostBuffer,
        target_slot: usize,
    ) -> Result<TransferToken, PoolError> {
        self.check_fits(uid, &host, target_slot)?;

        let completion = Arc::new(Completion::new());
        let job = TransferJob {
            uid: uid.clone(),
            host,
            slot: target_slot,
            completion: Arc::clone(&completion),
        };

        let sender = self.sender.as_ref().ok_or_else(|| queue_closed(uid, target_slot))?;
        sender
            .send(job)
            .map_err(|_| queue_closed(uid, target_slot))?;
        self.submitted.fetch_add(1, Ordering::Relaxed);

        Ok(TransferToken {
            uid: uid.clone(),
            target_slot,
            issued_at: Instant::now(),
            completion,
        })
    }

    /// Block until the token's copy has run, consuming the token
    pub fn wait(&self, token: TransferToken) -> Result<TransferReceipt, PoolError> {
        let start = Instant::now();
        let mut state = token.completion.state.lock();
        while state.status == TransferStatus::Pending {
            token.completion.signal.wait(&mut state);
        }
        let waited = start.elapsed();

        match &state.status {
            TransferStatus::Failed(reason) => Err(PoolError::TransferFailure {
                uid: token.uid.clone(),
                slot: token.target_slot,
                reason: reason.clone(),
            }),
            _ => Ok(TransferReceipt {
                uid: token.uid.clone(),
                slot: token.target_slot,
                waited,
                copy_time: state.copy_time,
                bytes: state.bytes,
            }),
        }
    }

    /// Non-blocking completion check (true once done or failed)
    pub fn poll(&self, token: &TransferToken) -> bool {
        token.completion.state.lock().status != TransferStatus::Pending
    }

    /// Copy inline on the calling thread; used on a miss where nothing can overlap.
    /// Returns the copy duration.
    pub fn blocking_copy(
        &self,
        uid: &AdapterId,
        host: &HostBuffer,
        target_slot: usize,
    ) -> Result<Duration, PoolError> {
        self.check_fits(uid, host, target_slot)?;
        copy_into_slot(&self.buffers, self.backend.as_ref(), uid, target_slot, host).map_err(
            |reason| PoolError::TransferFailure {
                uid: uid.clone(),
                slot: target_slot,
                reason,
            },
        )
    }

    /// Number of copies accepted by the transfer queue
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    fn check_fits(
        &self,
        uid: &AdapterId,
        host: &HostBuffer,
        target_slot: usize,
    ) -> Result<(), PoolError> {
        if self.buffers.slot(target_slot).is_none() {
            return Err(PoolError::InvalidSlot { slot: target_slot });
        }
        if host.len() > self.buffers.slot_bytes() {
            return Err(PoolError::AdapterTooLarge {
                uid: uid.clone(),
                size: host.len(),
                slot_bytes: self.buffers.slot_bytes(),
            });
        }
        Ok(())
    }
}

impl Drop for TransferEngine {
    fn drop(&mut self) {
        // Closing the channel lets the worker finish queued copies and exit
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Transfer worker panicked; copies still queued were lost");
            }
        }
    }
}

fn queue_closed(uid: &AdapterId, slot: usize) -> PoolError {
    PoolError::TransferFailure {
        uid: uid.clone(),
        slot,
        reason: "transfer queue closed".into(),
    }
}

fn copy_into_slot(
    buffers: &DeviceBuffers,
    backend: &dyn CopyBackend,
    uid: &AdapterId,
    slot: usize,
    host: &HostBuffer,
) -> std::result::Result<Duration, String> {
    let start = Instant::now();
    let cell = buffers
        .slot(slot)
        .ok_or_else(|| format!("slot {} out of range", slot))?;
    let mut buffer = cell.lock();
    let src = host.as_bytes();
    if src.len() > buffer.data.len() {
        return Err(format!(
            "{} bytes exceed slot capacity {}",
            src.len(),
            buffer.data.len()
        ));
    }
    buffer.len = 0;
    backend
        .copy(uid, src, &mut buffer.data[..src.len()])
        .map_err(|e| e.to_string())?;
    buffer.len = src.len();
    Ok(start.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testing::{FailingCopy, GatedCopy};

    fn host(bytes: &[u8]) -> HostBuffer {
        HostBuffer::new(bytes.to_vec())
    }

    #[test]
    fn test_submit_and_wait() {
        let mut pool = SlotPool::new(2, 8);
        let engine = TransferEngine::new(&pool, Arc::new(HostCopy::new())).unwrap();
        let uid = AdapterId::from("a");

        pool.mark_filling(1, &uid).unwrap();
        let token = engine.submit(&uid, host(&[1, 2, 3]), 1).unwrap();
        assert_eq!(token.target_slot(), 1);
        assert_eq!(engine.submitted(), 1);

        let receipt = engine.wait(token).unwrap();
        assert_eq!(receipt.bytes, 3);
        assert_eq!(receipt.slot, 1);

        pool.mark_ready(1, &uid).unwrap();
        assert_eq!(pool.read(1, |b| b.to_vec()).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_poll_reports_pending_until_copy_runs() {
        let pool = SlotPool::new(1, 8);
        let gate = Arc::new(GatedCopy::new());
        let engine = TransferEngine::new(&pool, gate.clone()).unwrap();

        let token = engine.submit(&AdapterId::from("a"), host(&[9; 4]), 0).unwrap();
        assert!(!engine.poll(&token));
        assert_eq!(token.status(), TransferStatus::Pending);

        gate.open();
        let receipt = engine.wait(token).unwrap();
        assert_eq!(receipt.bytes, 4);
    }

    #[test]
    fn test_copies_complete_in_submission_order() {
        let pool = SlotPool::new(2, 8);
        let gate = Arc::new(GatedCopy::new());
        let engine = TransferEngine::new(&pool, gate.clone()).unwrap();

        let first = engine.submit(&AdapterId::from("a"), host(&[1]), 0).unwrap();
        let second = engine.submit(&AdapterId::from("b"), host(&[2]), 1).unwrap();
        gate.open();

        engine.wait(second).unwrap();
        assert!(engine.poll(&first));
    }

    #[test]
    fn test_blocking_copy() {
        let mut pool = SlotPool::new(1, 8);
        let engine = TransferEngine::new(&pool, Arc::new(HostCopy::new())).unwrap();
        let uid = AdapterId::from("a");

        pool.mark_filling(0, &uid).unwrap();
        engine.blocking_copy(&uid, &host(&[5, 6]), 0).unwrap();
        pool.mark_ready(0, &uid).unwrap();
        assert_eq!(pool.read(0, |b| b.to_vec()).unwrap(), vec![5, 6]);
        assert_eq!(engine.submitted(), 0);
    }

    #[test]
    fn test_oversized_buffer_rejected() {
        let pool = SlotPool::new(1, 2);
        let engine = TransferEngine::new(&pool, Arc::new(HostCopy::new())).unwrap();
        let err = engine
            .submit(&AdapterId::from("a"), host(&[0; 3]), 0)
            .unwrap_err();
        assert!(matches!(err, PoolError::AdapterTooLarge { size: 3, .. }));
        assert_eq!(engine.submitted(), 0);

        let err = engine
            .blocking_copy(&AdapterId::from("a"), &host(&[0; 1]), 4)
            .unwrap_err();
        assert!(matches!(err, PoolError::InvalidSlot { slot: 4 }));
    }

    #[test]
    fn test_failed_copy_surfaces_on_wait() {
        let pool = SlotPool::new(1, 8);
        let uid = AdapterId::from("bad");
        let engine = TransferEngine::new(&pool, Arc::new(FailingCopy::new([uid.clone()]))).unwrap();

        let token = engine.submit(&uid, host(&[1]), 0).unwrap();
        let err = engine.wait(token).unwrap_err();
        assert!(matches!(err, PoolError::TransferFailure { slot: 0, .. }));

        let err = engine.blocking_copy(&uid, &host(&[1]), 0).unwrap_err();
        assert!(err.to_string().contains("injected device fault"));
    }

    #[test]
    fn test_throttled_copy_takes_time() {
        let backend = HostCopy::throttled(1);
        let src = vec![0u8; 64 * 1024];
        let mut dst = vec![0u8; 64 * 1024];
        let start = Instant::now();
        backend.copy(&AdapterId::from("a"), &src, &mut dst).unwrap();
        // 64 KiB at 1 MiB/s ≈ 62ms
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_huge_bandwidth_saturates() {
        assert_eq!(HostCopy::throttled(u64::MAX).bytes_per_sec, Some(u64::MAX));
        assert_eq!(HostCopy::throttled(0).bytes_per_sec, None);

        let src = vec![7u8; 1024];
        let mut dst = vec![0u8; 1024];
        HostCopy::throttled(u64::MAX)
            .copy(&AdapterId::from("a"), &src, &mut dst)
            .unwrap();
        assert_eq!(dst, src);
    }

    #[test]
    fn test_drop_drains_queue() {
        let pool = SlotPool::new(1, 8);
        let engine = TransferEngine::new(&pool, Arc::new(HostCopy::new())).unwrap();
        let token = engine.submit(&AdapterId::from("a"), host(&[1]), 0).unwrap();
        let completion = Arc::clone(&token.completion);
        drop(engine);
        assert_eq!(completion.state.lock().status, TransferStatus::Done);
    }
}
