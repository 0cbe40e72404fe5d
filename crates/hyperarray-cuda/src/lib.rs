//! CUDA backend for HyperArray
//!
//! Implements [`Driver`](hyperarray_core::Driver) over the CUDA driver API via
//! `cudarc`. `libcuda` is loaded dynamically, so binaries build without a CUDA
//! toolkit and fail at [`CudaDriver::new`] on machines without one.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use hyperarray_core::prelude::*;
//! use hyperarray_cuda::CudaDriver;
//!
//! let driver = Arc::new(CudaDriver::new()?);
//! let manager = ResourceManager::new(driver, ComputeConfig::default())?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

#[cfg(feature = "cuda")]
mod driver;

#[cfg(feature = "cuda")]
pub use driver::CudaDriver;

// Placeholder implementation when CUDA is not available
#[cfg(not(feature = "cuda"))]
mod stub {
    use std::convert::Infallible;
    use std::ffi::c_void;

    use hyperarray_core::driver::{
        ContextHandle, DeviceHandle, DevicePtr, Dim3, Driver, DriverResult, DriverStatus,
        EventHandle, FunctionHandle, ModuleHandle, StreamHandle,
    };
    use hyperarray_core::error::{ComputeError, Result};

    /// Stub CUDA driver when the `cuda` feature is disabled.
    ///
    /// Cannot be constructed.
    pub struct CudaDriver {
        never: Infallible,
    }

    impl CudaDriver {
        /// Always fails: the `cuda` feature is not enabled.
        pub fn new() -> Result<Self> {
            Err(ComputeError::BackendUnavailable(
                "CUDA feature not enabled".to_string(),
            ))
        }
    }

    impl Driver for CudaDriver {
        fn name(&self) -> &str {
            match self.never {}
        }
        fn init(&self) -> DriverResult<()> {
            match self.never {}
        }
        fn driver_version(&self) -> DriverResult<i32> {
            match self.never {}
        }
        fn device_count(&self) -> DriverResult<i32> {
            match self.never {}
        }
        fn device_get(&self, _: i32) -> DriverResult<DeviceHandle> {
            match self.never {}
        }
        fn device_name(&self, _: DeviceHandle) -> DriverResult<String> {
            match self.never {}
        }
        fn device_attribute(&self, _: DeviceHandle, _: i32) -> DriverResult<i32> {
            match self.never {}
        }
        fn primary_context_retain(&self, _: DeviceHandle) -> DriverResult<ContextHandle> {
            match self.never {}
        }
        fn primary_context_release(&self, _: DeviceHandle) -> DriverResult<()> {
            match self.never {}
        }
        fn context_set_current(&self, _: ContextHandle) -> DriverResult<()> {
            match self.never {}
        }
        fn context_synchronize(&self) -> DriverResult<()> {
            match self.never {}
        }
        fn mem_alloc(&self, _: usize) -> DriverResult<DevicePtr> {
            match self.never {}
        }
        fn mem_free(&self, _: DevicePtr) -> DriverResult<()> {
            match self.never {}
        }
        fn memcpy_htod(&self, _: DevicePtr, _: &[u8]) -> DriverResult<()> {
            match self.never {}
        }
        fn memcpy_dtoh(&self, _: &mut [u8], _: DevicePtr) -> DriverResult<()> {
            match self.never {}
        }
        fn module_load_data(&self, _: &[u8]) -> DriverResult<ModuleHandle> {
            match self.never {}
        }
        fn module_unload(&self, _: ModuleHandle) -> DriverResult<()> {
            match self.never {}
        }
        fn module_get_function(&self, _: ModuleHandle, _: &str) -> DriverResult<FunctionHandle> {
            match self.never {}
        }
        unsafe fn launch_kernel(
            &self,
            _: FunctionHandle,
            _: Dim3,
            _: Dim3,
            _: u32,
            _: StreamHandle,
            _: &mut [*mut c_void],
        ) -> DriverResult<()> {
            match self.never {}
        }
        fn stream_create(&self) -> DriverResult<StreamHandle> {
            match self.never {}
        }
        fn stream_destroy(&self, _: StreamHandle) -> DriverResult<()> {
            match self.never {}
        }
        fn stream_synchronize(&self, _: StreamHandle) -> DriverResult<()> {
            match self.never {}
        }
        fn event_create(&self) -> DriverResult<EventHandle> {
            match self.never {}
        }
        fn event_record(&self, _: EventHandle, _: StreamHandle) -> DriverResult<()> {
            match self.never {}
        }
        fn event_synchronize(&self, _: EventHandle) -> DriverResult<()> {
            match self.never {}
        }
        fn event_destroy(&self, _: EventHandle) -> DriverResult<()> {
            match self.never {}
        }
        fn stream_wait_event(&self, _: StreamHandle, _: EventHandle) -> DriverResult<()> {
            match self.never {}
        }
        fn error_string(&self, _: DriverStatus) -> String {
            match self.never {}
        }
    }
}

#[cfg(not(feature = "cuda"))]
pub use stub::CudaDriver;

/// Check if CUDA is available at runtime.
///
/// This function returns false if:
/// - the `cuda` feature is not enabled
/// - the CUDA driver library is not installed
/// - no CUDA devices are present
pub fn is_cuda_available() -> bool {
    cuda_device_count() > 0
}

/// Get CUDA device count.
///
/// Returns 0 if CUDA is not available or the driver library is not installed.
pub fn cuda_device_count() -> usize {
    #[cfg(feature = "cuda")]
    {
        use hyperarray_core::Driver;

        match CudaDriver::new() {
            Ok(driver) => {
                if driver.init().is_err() {
                    return 0;
                }
                driver
                    .device_count()
                    .map(|count| usize::try_from(count).unwrap_or(0))
                    .unwrap_or(0)
            }
            Err(_) => 0,
        }
    }
    #[cfg(not(feature = "cuda"))]
    {
        0
    }
}
