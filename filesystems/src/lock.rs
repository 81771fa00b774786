// Per-volume serialization with a bounded acquire, for hosts that drive
// one volume from several threads. Within one volume every public entry
// point runs under this lock; between volumes no ordering is imposed.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use silt_core::{BlockDevice, FsError};

use crate::families::fat::FatVolume;

struct Inner<D: BlockDevice> {
    /// The volume, absent while some thread is operating on it.
    slot: Mutex<Option<FatVolume<D>>>,
    cv: Condvar,
}

/// A `FatVolume` shared between threads, serialized with a deadline.
///
/// `with` either runs the closure holding the volume exclusively, or
/// fails with `FsError::Timeout` without touching any state.
pub struct SharedVolume<D: BlockDevice> {
    inner: Arc<Inner<D>>,
    timeout: Duration,
}

impl<D: BlockDevice> Clone for SharedVolume<D> {
    fn clone(&self) -> Self {
        SharedVolume {
            inner: Arc::clone(&self.inner),
            timeout: self.timeout,
        }
    }
}

impl<D: BlockDevice> SharedVolume<D> {
    pub fn new(vol: FatVolume<D>, timeout: Duration) -> Self {
        SharedVolume {
            inner: Arc::new(Inner {
                slot: Mutex::new(Some(vol)),
                cv: Condvar::new(),
            }),
            timeout,
        }
    }

    /// Run `f` with exclusive access to the volume.
    pub fn with<R>(&self, f: impl FnOnce(&mut FatVolume<D>) -> R) -> Result<R, FsError> {
        let deadline = Instant::now() + self.timeout;
        let mut guard = self
            .inner
            .slot
            .lock()
            .map_err(|_| FsError::Internal("volume lock poisoned"))?;
        let mut vol = loop {
            if let Some(v) = guard.take() {
                break v;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(FsError::Timeout);
            }
            let (g, res) = self
                .inner
                .cv
                .wait_timeout(guard, remaining)
                .map_err(|_| FsError::Internal("volume lock poisoned"))?;
            guard = g;
            if res.timed_out() && guard.is_none() {
                return Err(FsError::Timeout);
            }
        };
        drop(guard);

        let r = f(&mut vol);

        if let Ok(mut guard) = self.inner.slot.lock() {
            *guard = Some(vol);
        }
        self.inner.cv.notify_one();
        Ok(r)
    }

    /// Tear the wrapper down and get the volume back. Fails with
    /// `Timeout` when another thread still holds it past the deadline.
    pub fn into_inner(self) -> Result<FatVolume<D>, FsError> {
        let deadline = Instant::now() + self.timeout;
        let mut guard = self
            .inner
            .slot
            .lock()
            .map_err(|_| FsError::Internal("volume lock poisoned"))?;
        loop {
            if let Some(v) = guard.take() {
                return Ok(v);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(FsError::Timeout);
            }
            let (g, _) = self
                .inner
                .cv
                .wait_timeout(guard, remaining)
                .map_err(|_| FsError::Internal("volume lock poisoned"))?;
            guard = g;
        }
    }
}
