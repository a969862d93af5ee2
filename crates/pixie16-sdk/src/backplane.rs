//! Backplane coordination.
//!
//! The PXI backplane carries a handful of shared lines that exactly one
//! module may drive at a time. Each line is a cooperative role won and
//! released with lock-free compare-and-exchange; contention fails fast and
//! never blocks. The sync-wait set tracks which slots intend to take part
//! in a synchronous start.

use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Mutex;

use pixie16_hw::pci::MAX_SLOTS;
use tracing::info;

use crate::error::{Error, Result};

/// Sentinel for a role nobody holds.
pub const RELEASED: i32 = -1;

/// A single backplane role: the module number of the leader, or
/// [`RELEASED`].
#[derive(Debug)]
pub struct Role {
    label: &'static str,
    leader: AtomicI32,
}

impl Role {
    fn new(label: &'static str) -> Self {
        Self { label, leader: AtomicI32::new(RELEASED) }
    }

    /// Try to take the role for `module`. Succeeds only from the released
    /// state.
    pub fn request(&self, module: i32) -> bool {
        let requested = self
            .leader
            .compare_exchange(RELEASED, module, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if requested {
            info!("backplane: {}: leader: module={module}", self.label);
        }
        requested
    }

    /// Release the role. Succeeds only if `module` holds it.
    pub fn release(&self, module: i32) -> bool {
        let released = self
            .leader
            .compare_exchange(module, RELEASED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if released {
            info!("backplane: {}: released: module={module}", self.label);
        }
        released
    }

    /// The current leader, or [`RELEASED`].
    #[must_use]
    pub fn leader(&self) -> i32 {
        self.leader.load(Ordering::Acquire)
    }

    /// Whether anyone holds the role.
    #[must_use]
    pub fn has_leader(&self) -> bool {
        self.leader() != RELEASED
    }

    /// Whether the role is held by a module other than `module`.
    #[must_use]
    pub fn not_leader(&self, module: i32) -> bool {
        self.has_leader() && self.leader() != module
    }
}

/// The crate's backplane state.
#[derive(Debug)]
pub struct Backplane {
    /// Wired-or trigger pullup drive.
    pub wired_or_triggers: Role,
    /// Run start/stop drive.
    pub run: Role,
    /// Director role: the module whose run control propagates to all.
    pub director: Role,
    sync_waits: AtomicUsize,
    sync_waiters: Mutex<[bool; MAX_SLOTS]>,
}

impl Default for Backplane {
    fn default() -> Self {
        Self {
            wired_or_triggers: Role::new("wired-or-triggers"),
            run: Role::new("run"),
            director: Role::new("director"),
            sync_waits: AtomicUsize::new(0),
            sync_waiters: Mutex::new([false; MAX_SLOTS]),
        }
    }
}

impl Backplane {
    /// Record a module's `SYNCH_WAIT` intent. `value` must be 0 or 1; the
    /// range check against the slot table is an internal invariant.
    ///
    /// # Errors
    ///
    /// Returns `InvalidValue` for a value other than 0/1 and
    /// `InternalFailure` if the waiter count leaves its range (a bug).
    pub fn sync_wait(&self, module: usize, value: u32) -> Result<()> {
        if value > 1 {
            return Err(Error::InvalidValue(format!(
                "module {module}: SYNCH_WAIT must be 0 or 1: {value}"
            )));
        }
        let active = value == 1;
        let mut waiters = self.sync_waiters.lock().expect("sync waiters lock poisoned");
        if module >= waiters.len() {
            return Err(Error::InternalFailure(format!(
                "module {module}: beyond the backplane slot table"
            )));
        }
        if waiters[module] != active {
            waiters[module] = active;
            let waits = if active {
                self.sync_waits.fetch_add(1, Ordering::AcqRel) + 1
            } else {
                self.sync_waits.fetch_sub(1, Ordering::AcqRel) - 1
            };
            // The check is against the slot table, not the crate's module
            // count; a module does not know about its peers.
            if waits > waiters.len() {
                return Err(Error::InternalFailure(format!(
                    "module {module}: invalid backplane sync_wait value: {waits}"
                )));
            }
        }
        Ok(())
    }

    /// Modules currently intending to sync-wait.
    #[must_use]
    pub fn sync_waits(&self) -> usize {
        self.sync_waits.load(Ordering::Acquire)
    }

    /// Check the crate is in a consistent sync-wait state: either no module
    /// waits, or all `num_modules` do.
    ///
    /// # Errors
    ///
    /// Returns `ModuleInvalidOperation` on a partial sync-wait set.
    pub fn sync_wait_valid(&self, num_modules: usize) -> Result<()> {
        let waits = self.sync_waits();
        if waits != 0 && waits != num_modules {
            return Err(Error::ModuleInvalidOperation(format!(
                "sync wait mode enabled and not all modules in the sync wait state \
                 ({waits} of {num_modules})"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_succeeds_once() {
        let bp = Backplane::default();
        assert!(bp.run.request(0));
        assert!(!bp.run.request(1));
        assert_eq!(bp.run.leader(), 0);
    }

    #[test]
    fn release_requires_holder() {
        let bp = Backplane::default();
        assert!(bp.run.request(0));
        assert!(!bp.run.release(1));
        assert!(bp.run.release(0));
        assert!(bp.run.request(1));
    }

    #[test]
    fn not_leader_only_when_held_by_other() {
        let bp = Backplane::default();
        assert!(!bp.director.not_leader(2));
        assert!(bp.director.request(0));
        assert!(bp.director.not_leader(2));
        assert!(!bp.director.not_leader(0));
    }

    #[test]
    fn sync_wait_counts_match_waiters() {
        let bp = Backplane::default();
        bp.sync_wait(0, 1).unwrap();
        bp.sync_wait(3, 1).unwrap();
        assert_eq!(bp.sync_waits(), 2);
        // Re-asserting the same intent changes nothing.
        bp.sync_wait(0, 1).unwrap();
        assert_eq!(bp.sync_waits(), 2);
        bp.sync_wait(0, 0).unwrap();
        assert_eq!(bp.sync_waits(), 1);
    }

    #[test]
    fn sync_wait_rejects_out_of_range_value() {
        let bp = Backplane::default();
        assert_eq!(bp.sync_wait(0, 2).unwrap_err().api_result(), 802);
    }

    #[test]
    fn sync_wait_valid_requires_consensus() {
        let bp = Backplane::default();
        bp.sync_wait_valid(2).unwrap();
        bp.sync_wait(0, 1).unwrap();
        let err = bp.sync_wait_valid(2).unwrap_err();
        assert_eq!(err.api_result(), 206);
        assert!(err.to_string().contains("sync wait"));
        bp.sync_wait(1, 1).unwrap();
        bp.sync_wait_valid(2).unwrap();
    }
}
