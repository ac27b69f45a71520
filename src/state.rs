use std::sync::{
    atomic::{AtomicI64, AtomicU64, Ordering},
    Arc, Mutex, RwLock,
};

use crate::{
    error::{Error, Result},
    memtable::{ActiveMemtable, FrozenMemtable},
    row::Version,
};

/// Write buffers of a storage unit.
///
/// Writers hold a read lock on `active` while they insert, so the freeze swap
/// (write lock) never hands over a memtable with a write in flight.
pub struct UnitState {
    pub active: RwLock<Arc<ActiveMemtable>>,
    pub frozen: RwLock<Option<Arc<FrozenMemtable>>>,
    next_generation: AtomicU64,
    next_version: AtomicI64,
    freeze_lock: Mutex<()>,
}

impl Default for UnitState {
    fn default() -> Self {
        Self::new()
    }
}

impl UnitState {
    pub fn new() -> Self {
        Self {
            active: RwLock::new(Arc::new(ActiveMemtable::new(0))),
            frozen: RwLock::new(None),
            next_generation: AtomicU64::new(1),
            next_version: AtomicI64::new(1),
            freeze_lock: Mutex::new(()),
        }
    }

    fn next_version(&self) -> Version {
        self.next_version.fetch_add(1, Ordering::SeqCst)
    }

    /// Runs `f` against the active memtable while holding off a freeze.
    pub fn with_active<T>(&self, f: impl FnOnce(&ActiveMemtable) -> Result<T>) -> Result<T> {
        let active = self.active.read()?;
        f(&active)
    }

    /// Runs a write against the active memtable with the version to stamp it
    /// with; later writes win.
    ///
    /// The version is drawn under the same read lock the freeze swap waits
    /// on, so every version in a frozen generation is below every version of
    /// the generation after it.
    pub fn write<T>(&self, f: impl FnOnce(&ActiveMemtable, Version) -> Result<T>) -> Result<T> {
        let active = self.active.read()?;
        f(&active, self.next_version())
    }

    pub fn frozen(&self) -> Result<Option<Arc<FrozenMemtable>>> {
        Ok(self.frozen.read()?.clone())
    }

    /// Swaps the active memtable into the frozen role.
    ///
    /// Fails while a frozen snapshot is still waiting to be committed.
    pub fn freeze(&self) -> Result<Arc<FrozenMemtable>> {
        let _guard = self.freeze_lock.lock()?;
        let mut frozen = self.frozen.write()?;
        if let Some(existing) = frozen.as_ref() {
            return Err(Error::InvalidState(format!(
                "generation {} is still frozen",
                existing.generation()
            )));
        }
        let new_active = Arc::new(ActiveMemtable::new(
            self.next_generation.fetch_add(1, Ordering::SeqCst),
        ));
        let snapshot = {
            let mut active = self.active.write()?;
            let snapshot = Arc::new(active.freeze()?);
            *active = new_active;
            snapshot
        };
        *frozen = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Drops the frozen snapshot once it is fully committed.
    pub fn release_frozen(&self, generation: u64) -> Result<()> {
        let mut frozen = self.frozen.write()?;
        match frozen.as_ref() {
            Some(f) if f.generation() == generation => {
                *frozen = None;
                Ok(())
            }
            _ => Err(Error::InvalidState(format!(
                "generation {} is not the frozen snapshot",
                generation
            ))),
        }
    }
}
