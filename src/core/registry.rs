//! The process-wide module slot, as an explicit value.
//!
//! `try_claim` is the compare-and-swap that keeps instantiation at most once
//! even when several bootstrap attempts race; `publish` fills the slot
//! whether or not the publisher holds the claim, because a companion script
//! may populate it on its own.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::error::{BootError, BootResult};
use crate::instance::ModuleInstance;

/// Explicit initializer a companion script may leave behind. `Ok(None)`
/// means it ran but produced nothing.
pub type Initializer = Box<dyn FnOnce() -> Result<Option<ModuleInstance>, String> + Send>;

enum Slot {
    Empty,
    Claimed,
    Ready(Arc<ModuleInstance>),
}

#[derive(Default)]
struct Shared {
    slot: Mutex<SlotCell>,
    initializer: Mutex<Option<Initializer>>,
}

struct SlotCell(Slot);

impl Default for SlotCell {
    fn default() -> Self {
        SlotCell(Slot::Empty)
    }
}

/// Outcome of [`ModuleRegistry::try_claim`].
pub enum Claim {
    Granted(InitClaim),
    Ready(Arc<ModuleInstance>),
    InProgress,
}

#[derive(Clone, Default)]
pub struct ModuleRegistry {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.slot().0 {
            Slot::Empty => "empty",
            Slot::Claimed => "claimed",
            Slot::Ready(_) => "ready",
        };
        f.debug_struct("ModuleRegistry").field("slot", &state).finish()
    }
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, SlotCell> {
        self.shared.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn initializer_slot(&self) -> MutexGuard<'_, Option<Initializer>> {
        self.shared
            .initializer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self) -> Option<Arc<ModuleInstance>> {
        match &self.slot().0 {
            Slot::Ready(inst) => Some(Arc::clone(inst)),
            _ => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.slot().0, Slot::Ready(_))
    }

    pub fn try_claim(&self) -> Claim {
        let mut cell = self.slot();
        match &cell.0 {
            Slot::Ready(inst) => Claim::Ready(Arc::clone(inst)),
            Slot::Claimed => Claim::InProgress,
            Slot::Empty => {
                cell.0 = Slot::Claimed;
                debug!("Module slot claimed");
                Claim::Granted(InitClaim {
                    registry: self.clone(),
                    settled: false,
                })
            }
        }
    }

    /// Fills the slot. Fails only if an instance is already there.
    pub fn publish(&self, instance: ModuleInstance) -> BootResult<Arc<ModuleInstance>> {
        let mut cell = self.slot();
        if matches!(cell.0, Slot::Ready(_)) {
            warn!("Refusing to publish a second module instance");
            return Err(BootError::AlreadyInitialized);
        }
        let inst = Arc::new(instance);
        cell.0 = Slot::Ready(Arc::clone(&inst));
        info!("Module published ({} exports)", inst.exports().len());
        Ok(inst)
    }

    pub fn expose_initializer<F>(&self, init: F)
    where
        F: FnOnce() -> Result<Option<ModuleInstance>, String> + Send + 'static,
    {
        *self.initializer_slot() = Some(Box::new(init));
    }

    pub fn has_initializer(&self) -> bool {
        self.initializer_slot().is_some()
    }

    /// Removes the initializer so it can run at most once.
    pub fn take_initializer(&self) -> Option<Initializer> {
        self.initializer_slot().take()
    }

    fn release_claim(&self) {
        let mut cell = self.slot();
        if matches!(cell.0, Slot::Claimed) {
            cell.0 = Slot::Empty;
            debug!("Module slot claim released");
        }
    }
}

/// Exclusive right to initialize. Dropping it without publishing puts the
/// slot back to empty so a later attempt can try again.
pub struct InitClaim {
    registry: ModuleRegistry,
    settled: bool,
}

impl InitClaim {
    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn publish(mut self, instance: ModuleInstance) -> BootResult<Arc<ModuleInstance>> {
        self.settled = true;
        self.registry.publish(instance)
    }
}

impl Drop for InitClaim {
    fn drop(&mut self) {
        if !self.settled {
            self.registry.release_claim();
        }
    }
}
