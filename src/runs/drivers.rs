//! In-process registry of the runs this instance is driving.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

struct Driver {
    stop: watch::Sender<bool>,
    /// Set when another caller asked to drive the run while this driver
    /// held the slot.
    redrive: Arc<AtomicBool>,
}

/// A claimed driver slot. Dropping it removes the entry if it is still
/// this slot's.
pub struct DriverSlot {
    registry: DriverRegistry,
    run_id: String,
    redrive: Arc<AtomicBool>,
    pub stop: watch::Receiver<bool>,
}

impl DriverSlot {
    /// Gives the slot up unless a drive was requested since the last call.
    /// Returns false when the caller has to re-read the run and keep going.
    pub fn release(&self) -> bool {
        let mut requested = false;
        self.registry.inner.remove_if(&self.run_id, |_, driver| {
            if !Arc::ptr_eq(&driver.redrive, &self.redrive) {
                return false;
            }
            requested = driver.redrive.swap(false, Ordering::SeqCst);
            !requested
        });
        !requested
    }
}

impl Drop for DriverSlot {
    fn drop(&mut self) {
        self.registry.inner.remove_if(&self.run_id, |_, driver| {
            Arc::ptr_eq(&driver.redrive, &self.redrive)
        });
    }
}

#[derive(Clone, Default)]
pub struct DriverRegistry {
    inner: Arc<DashMap<String, Driver>>,
}

impl DriverRegistry {
    /// Claims the run. When another driver holds it, that driver is told to
    /// re-read the run before it lets go and `None` is returned.
    pub fn claim(&self, run_id: &str) -> Option<DriverSlot> {
        match self.inner.entry(run_id.to_string()) {
            Entry::Occupied(current) => {
                current.get().redrive.store(true, Ordering::SeqCst);
                None
            }
            Entry::Vacant(slot) => {
                let (stop_tx, stop) = watch::channel(false);
                let redrive = Arc::new(AtomicBool::new(false));
                slot.insert(Driver {
                    stop: stop_tx,
                    redrive: redrive.clone(),
                });
                Some(DriverSlot {
                    registry: self.clone(),
                    run_id: run_id.to_string(),
                    redrive,
                    stop,
                })
            }
        }
    }

    /// Signals the run's driver to stop. Returns false if nobody drives it.
    pub fn stop(&self, run_id: &str) -> bool {
        match self.inner.get(run_id) {
            Some(driver) => {
                let _ = driver.stop.send(true);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, run_id: &str) -> bool {
        self.inner.contains_key(run_id)
    }
}
