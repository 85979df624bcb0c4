//! Copy backends for exercising in-flight and failure paths in tests

use crate::adapter::AdapterId;
use crate::device::transfer::CopyBackend;
use anyhow::{bail, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;

/// Holds every copy until [`GatedCopy::open`] is called
pub(crate) struct GatedCopy {
    open: Mutex<bool>,
    signal: Condvar,
}

impl GatedCopy {
    pub(crate) fn new() -> Self {
        Self {
            open: Mutex::new(false),
            signal: Condvar::new(),
        }
    }

    pub(crate) fn open(&self) {
        *self.open.lock() = true;
        self.signal.notify_all();
    }
}

impl CopyBackend for GatedCopy {
    fn copy(&self, _uid: &AdapterId, src: &[u8], dst: &mut [u8]) -> Result<()> {
        let mut open = self.open.lock();
        while !*open {
            self.signal.wait(&mut open);
        }
        dst.copy_from_slice(src);
        Ok(())
    }
}

/// Fails every copy of the listed adapters
pub(crate) struct FailingCopy {
    faulty: HashSet<AdapterId>,
}

impl FailingCopy {
    pub(crate) fn new(faulty: impl IntoIterator<Item = AdapterId>) -> Self {
        Self {
            faulty: faulty.into_iter().collect(),
        }
    }
}

impl CopyBackend for FailingCopy {
    fn copy(&self, uid: &AdapterId, src: &[u8], dst: &mut [u8]) -> Result<()> {
        if self.faulty.contains(uid) {
            bail!("injected device fault");
        }
        dst.copy_from_slice(src);
        Ok(())
    }
}
