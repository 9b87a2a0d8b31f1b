//! Reader–writer gates used by the range data path.
//!
//! A [`Barrier`] is a writer-preferring gate: normal operations pass
//! through in shared mode, and a maintenance step *activates* the
//! barrier in exclusive mode — no new operation may begin, and in-flight
//! ones complete before the activator proceeds. Guards release on every
//! exit path, including panics and early returns.

use std::sync::{
    RwLock, RwLockReadGuard, RwLockWriteGuard,
    atomic::{AtomicBool, Ordering},
};

/// A reader–writer gate over no data.
#[derive(Debug, Default)]
pub struct Barrier {
    gate: RwLock<()>,
}

impl Barrier {
    /// Creates an open barrier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Passes through the barrier in shared mode (normal operations).
    /// Blocks while an activator holds the barrier.
    pub fn enter(&self) -> BarrierPass<'_> {
        BarrierPass {
            _guard: self.gate.read().unwrap_or_else(|poisoned| poisoned.into_inner()),
        }
    }

    /// Activates the barrier in exclusive mode (maintenance steps).
    /// Blocks until in-flight shared holders drain.
    pub fn activate(&self) -> BarrierHold<'_> {
        BarrierHold {
            _guard: self
                .gate
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        }
    }
}

/// Shared passage through a [`Barrier`].
#[derive(Debug)]
pub struct BarrierPass<'a> {
    _guard: RwLockReadGuard<'a, ()>,
}

/// Exclusive hold of a [`Barrier`].
#[derive(Debug)]
pub struct BarrierHold<'a> {
    _guard: RwLockWriteGuard<'a, ()>,
}

// ------------------------------------------------------------------------------------------------
// Maintenance guard
// ------------------------------------------------------------------------------------------------

/// Marks a range busy while one maintenance task runs on it.
///
/// The scheduler skips ranges whose guard reports `in_progress`.
#[derive(Debug, Default)]
pub struct MaintenanceGuard {
    busy: AtomicBool,
}

impl MaintenanceGuard {
    /// Whether a maintenance task currently holds the guard.
    pub fn in_progress(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Marks the range busy for the lifetime of the returned activator.
    ///
    /// Maintenance entry points are serialized upstream (the scheduler
    /// never enqueues a busy range twice), so this does not need to be
    /// a lock.
    pub fn activate(&self) -> MaintenanceActivator<'_> {
        self.busy.store(true, Ordering::Release);
        MaintenanceActivator { guard: self }
    }
}

/// Clears the busy flag on drop.
#[derive(Debug)]
pub struct MaintenanceActivator<'a> {
    guard: &'a MaintenanceGuard,
}

impl Drop for MaintenanceActivator<'_> {
    fn drop(&mut self) {
        self.guard.busy.store(false, Ordering::Release);
    }
}
