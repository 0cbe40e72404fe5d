//! Resource manager: owns the driver binding, stream pool and kernel catalog.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::array::{Array, ArrayStore};
use crate::catalog::{CatalogReport, KernelCatalog};
use crate::config::ComputeConfig;
use crate::dispatch::{Dispatcher, LaunchRecord, StreamTarget};
use crate::driver::{check, ContextHandle, DeviceHandle, Driver};
use crate::error::{ComputeError, Result};
use crate::stream::{StreamFamily, StreamPool, StreamSlot};

/// Device attribute id for the compute capability major version.
const ATTR_COMPUTE_CAPABILITY_MAJOR: i32 = 75;
/// Device attribute id for the compute capability minor version.
const ATTR_COMPUTE_CAPABILITY_MINOR: i32 = 76;

/// One accelerator context with its streams and kernels.
///
/// Constructed once per process and passed to whatever needs it. Arrays hold
/// their own reference to the driver and may outlive the manager, but should
/// be dropped before [`shutdown`](Self::shutdown) so their device memory is
/// freed while the context is still alive.
pub struct ResourceManager {
    driver: Arc<dyn Driver>,
    config: ComputeConfig,
    device: DeviceHandle,
    context: ContextHandle,
    device_name: String,
    arrays: ArrayStore,
    streams: StreamPool,
    catalog: KernelCatalog,
    catalog_report: CatalogReport,
    active: bool,
}

fn fatal(e: ComputeError) -> ComputeError {
    ComputeError::Initialization(e.to_string())
}

impl ResourceManager {
    /// Brings up the driver, binds the configured device's primary context
    /// and discovers kernels.
    ///
    /// Any failure before kernel discovery is fatal and reported as
    /// [`ComputeError::Initialization`]. Kernel discovery problems are logged
    /// and leave the catalog partially filled.
    pub fn new(driver: Arc<dyn Driver>, config: ComputeConfig) -> Result<Self> {
        let d = driver.as_ref();
        check(d, "cuInit", d.init()).map_err(fatal)?;
        let version = check(d, "cuDriverGetVersion", d.driver_version()).map_err(fatal)?;
        let count = check(d, "cuDeviceGetCount", d.device_count()).map_err(fatal)?;
        if config.device_ordinal < 0 || config.device_ordinal >= count {
            return Err(ComputeError::Initialization(format!(
                "device ordinal {} out of range ({count} devices)",
                config.device_ordinal
            )));
        }
        let device =
            check(d, "cuDeviceGet", d.device_get(config.device_ordinal)).map_err(fatal)?;
        let device_name = d
            .device_name(device)
            .unwrap_or_else(|_| "unknown device".to_string());
        let major = d.device_attribute(device, ATTR_COMPUTE_CAPABILITY_MAJOR).unwrap_or(0);
        let minor = d.device_attribute(device, ATTR_COMPUTE_CAPABILITY_MINOR).unwrap_or(0);

        let context = check(
            d,
            "cuDevicePrimaryCtxRetain",
            d.primary_context_retain(device),
        )
        .map_err(fatal)?;
        if let Err(e) = check(d, "cuCtxSetCurrent", d.context_set_current(context)) {
            let _ = check(
                d,
                "cuDevicePrimaryCtxRelease",
                d.primary_context_release(device),
            );
            return Err(fatal(e));
        }

        info!(
            backend = d.name(),
            device = %device_name,
            ordinal = config.device_ordinal,
            devices = count,
            driver_version = version,
            compute_capability = %format!("{major}.{minor}"),
            "Accelerator initialized"
        );

        let mut catalog = KernelCatalog::new(Arc::clone(&driver));
        let catalog_report = if !config.load_kernels {
            info!("Kernel loading disabled by configuration");
            CatalogReport::default()
        } else if let Some(dir) = config.resolve_kernel_dir() {
            catalog.discover(&dir, &config.manifest_name, &config.binary_extension)
        } else {
            warn!("No kernel directory could be resolved, kernel loading disabled");
            CatalogReport::default()
        };

        Ok(Self {
            arrays: ArrayStore::new(Arc::clone(&driver)),
            streams: StreamPool::new(Arc::clone(&driver)),
            catalog,
            catalog_report,
            driver,
            config,
            device,
            context,
            device_name,
            active: true,
        })
    }

    /// Configuration the manager was built with.
    pub fn config(&self) -> &ComputeConfig {
        &self.config
    }

    /// Raw device handle, for interop.
    pub fn device(&self) -> DeviceHandle {
        self.device
    }

    /// Raw context handle, for interop.
    pub fn context(&self) -> ContextHandle {
        self.context
    }

    /// Device name reported by the driver.
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// The driver binding.
    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// Array operations.
    ///
    /// Not guarded by [`shutdown`](Self::shutdown): check
    /// [`is_active`](Self::is_active) first, since device allocations made
    /// after the primary context is released are invalid.
    pub fn arrays(&self) -> &ArrayStore {
        &self.arrays
    }

    /// Stream pool.
    pub fn streams(&self) -> &StreamPool {
        &self.streams
    }

    /// Mutable stream pool. Unguarded, like [`arrays`](Self::arrays).
    pub fn streams_mut(&mut self) -> &mut StreamPool {
        &mut self.streams
    }

    /// Kernel catalog.
    pub fn catalog(&self) -> &KernelCatalog {
        &self.catalog
    }

    /// Mutable kernel catalog, for registering modules at runtime.
    /// Unguarded, like [`arrays`](Self::arrays).
    pub fn catalog_mut(&mut self) -> &mut KernelCatalog {
        &mut self.catalog
    }

    /// Outcome of startup kernel discovery.
    pub fn catalog_report(&self) -> CatalogReport {
        self.catalog_report
    }

    /// Whether [`shutdown`](Self::shutdown) has not run yet.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Creates a stream in `family`.
    pub fn create_stream(&mut self, family: StreamFamily) -> Result<StreamSlot> {
        self.ensure_active()?;
        self.streams.create_stream(family)
    }

    /// Destroys the stream in `slot`.
    pub fn destroy_stream(&mut self, slot: StreamSlot) -> Result<()> {
        self.ensure_active()?;
        self.streams.destroy_stream(slot)
    }

    /// Launches `kernel` over `arrays` on `target`.
    pub fn launch(
        &self,
        kernel: &str,
        arrays: &[&Array],
        target: impl Into<StreamTarget>,
    ) -> Result<LaunchRecord> {
        self.ensure_active()?;
        Dispatcher::new(self.driver.as_ref(), &self.catalog, &self.streams).launch(
            kernel,
            arrays,
            target.into(),
        )
    }

    /// Blocks until all queued work in the context completes.
    pub fn synchronize(&self) -> Result<()> {
        self.ensure_active()?;
        check(
            self.driver.as_ref(),
            "cuCtxSynchronize",
            self.driver.context_synchronize(),
        )
    }

    /// Destroys streams, unloads modules and releases the primary context.
    ///
    /// Runs once; later calls and the drop that follows do nothing.
    pub fn shutdown(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        self.streams.teardown();
        self.catalog.teardown();
        let _ = check(
            self.driver.as_ref(),
            "cuDevicePrimaryCtxRelease",
            self.driver.primary_context_release(self.device),
        );
        debug!(device = %self.device_name, "Resource manager shut down");
    }

    fn ensure_active(&self) -> Result<()> {
        if self.active {
            Ok(())
        } else {
            Err(ComputeError::BackendUnavailable(
                "resource manager has been shut down".to_string(),
            ))
        }
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager")
            .field("backend", &self.driver.name())
            .field("device", &self.device_name)
            .field("streams", &self.streams.stats())
            .field("kernels", &self.catalog.len())
            .field("active", &self.active)
            .finish()
    }
}
