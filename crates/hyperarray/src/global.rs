//! Optional process-wide [`ResourceManager`].
//!
//! Nothing in the library reaches for this; it exists for application
//! boundaries that cannot thread a manager through their call graph.

use std::sync::Arc;

use parking_lot::{const_mutex, Mutex};
use tracing::{debug, warn};

use hyperarray_core::{ComputeConfig, ComputeError, Driver, ResourceManager, Result};

static MANAGER: Mutex<Option<ResourceManager>> = const_mutex(None);

/// Creates the process-wide manager.
///
/// Fails with [`ComputeError::Initialization`] if one already exists or
/// construction fails.
pub fn initialize(driver: Arc<dyn Driver>, config: ComputeConfig) -> Result<()> {
    let mut slot = MANAGER.lock();
    if slot.is_some() {
        warn!("Resource manager already initialized");
        return Err(ComputeError::Initialization(
            "resource manager already initialized".to_string(),
        ));
    }
    *slot = Some(ResourceManager::new(driver, config)?);
    debug!("Global resource manager installed");
    Ok(())
}

/// Runs `f` against the process-wide manager.
///
/// The manager stays locked for the duration of `f`; calling back into this
/// module from `f` deadlocks.
pub fn with<R>(f: impl FnOnce(&mut ResourceManager) -> R) -> Result<R> {
    let mut slot = MANAGER.lock();
    match slot.as_mut() {
        Some(manager) => Ok(f(manager)),
        None => Err(ComputeError::BackendUnavailable(
            "resource manager not initialized".to_string(),
        )),
    }
}

/// Shuts down and removes the process-wide manager.
///
/// Returns `false` if there was none.
pub fn uninitialize() -> bool {
    let manager = MANAGER.lock().take();
    match manager {
        Some(mut manager) => {
            manager.shutdown();
            debug!("Global resource manager removed");
            true
        }
        None => false,
    }
}

/// Whether a process-wide manager exists.
pub fn is_initialized() -> bool {
    MANAGER.lock().is_some()
}
