//! Accelerator driver handle.
//!
//! [`Driver`] is the fixed set of device, context, memory, module, stream and
//! event primitives every other component calls through. Implementations
//! report failures as raw integer status codes ([`DriverStatus`]); the rest of
//! the crate converts them into [`ComputeError::Driver`] with [`check`], which
//! also logs the driver's own error string.
//!
//! Handles are plain integers so that they are `Copy`, `Send` and `Sync`
//! regardless of the backend's pointer representation.

use std::ffi::c_void;
use std::fmt;

use crate::error::{ComputeError, Result};

/// Raw driver status code (non-zero on failure).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DriverStatus(pub i32);

impl DriverStatus {
    /// Success.
    pub const SUCCESS: DriverStatus = DriverStatus(0);
    /// An argument was out of range.
    pub const INVALID_VALUE: DriverStatus = DriverStatus(1);
    /// Allocation failed.
    pub const OUT_OF_MEMORY: DriverStatus = DriverStatus(2);
    /// Driver not initialized.
    pub const NOT_INITIALIZED: DriverStatus = DriverStatus(3);
    /// No device present.
    pub const NO_DEVICE: DriverStatus = DriverStatus(100);
    /// Device ordinal out of range.
    pub const INVALID_DEVICE: DriverStatus = DriverStatus(101);
    /// Module image could not be parsed.
    pub const INVALID_IMAGE: DriverStatus = DriverStatus(200);
    /// Handle does not name a live object.
    pub const INVALID_HANDLE: DriverStatus = DriverStatus(400);
    /// Named symbol not found.
    pub const NOT_FOUND: DriverStatus = DriverStatus(500);
    /// Kernel failed while executing.
    pub const LAUNCH_FAILED: DriverStatus = DriverStatus(719);

    /// Returns true for the success code.
    pub fn is_success(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for DriverStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "status {}", self.0)
    }
}

/// Result of a raw driver call.
pub type DriverResult<T> = std::result::Result<T, DriverStatus>;

/// Device ordinal handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DeviceHandle(pub i32);

/// Context handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ContextHandle(pub u64);

/// Address in device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    /// The null device address.
    pub const NULL: DevicePtr = DevicePtr(0);

    /// Returns true for the null address.
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Stream handle. [`StreamHandle::NULL`] is the default stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StreamHandle(pub u64);

impl StreamHandle {
    /// The default (null) stream.
    pub const NULL: StreamHandle = StreamHandle(0);

    /// Returns true for the default stream.
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Loaded module handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleHandle(pub u64);

/// Kernel entry point handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionHandle(pub u64);

/// Event handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle(pub u64);

/// Grid or block dimensions (x, y, z).
pub type Dim3 = (u32, u32, u32);

/// The accelerator driver primitives used by this crate.
///
/// One instance is bound per process and outlives every array, stream and
/// module created through it.
pub trait Driver: Send + Sync {
    /// Backend name for diagnostics.
    fn name(&self) -> &str;

    /// Initialize the driver.
    fn init(&self) -> DriverResult<()>;

    /// Driver version number.
    fn driver_version(&self) -> DriverResult<i32>;

    /// Number of devices.
    fn device_count(&self) -> DriverResult<i32>;

    /// Device handle for an ordinal.
    fn device_get(&self, ordinal: i32) -> DriverResult<DeviceHandle>;

    /// Device marketing name.
    fn device_name(&self, device: DeviceHandle) -> DriverResult<String>;

    /// Integer device attribute.
    fn device_attribute(&self, device: DeviceHandle, attribute: i32) -> DriverResult<i32>;

    /// Retain the device's primary context.
    fn primary_context_retain(&self, device: DeviceHandle) -> DriverResult<ContextHandle>;

    /// Release the device's primary context.
    fn primary_context_release(&self, device: DeviceHandle) -> DriverResult<()>;

    /// Bind a context to the calling thread.
    fn context_set_current(&self, context: ContextHandle) -> DriverResult<()>;

    /// Block until all work in the current context completes.
    fn context_synchronize(&self) -> DriverResult<()>;

    /// Allocate device memory.
    fn mem_alloc(&self, bytes: usize) -> DriverResult<DevicePtr>;

    /// Free device memory.
    fn mem_free(&self, ptr: DevicePtr) -> DriverResult<()>;

    /// Copy host bytes to device memory.
    fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> DriverResult<()>;

    /// Copy device memory to host bytes.
    fn memcpy_dtoh(&self, dst: &mut [u8], src: DevicePtr) -> DriverResult<()>;

    /// Load a module from an in-memory image.
    fn module_load_data(&self, image: &[u8]) -> DriverResult<ModuleHandle>;

    /// Unload a module.
    fn module_unload(&self, module: ModuleHandle) -> DriverResult<()>;

    /// Resolve a kernel symbol inside a module.
    fn module_get_function(&self, module: ModuleHandle, name: &str)
        -> DriverResult<FunctionHandle>;

    /// Enqueue a kernel launch.
    ///
    /// # Safety
    ///
    /// Each entry of `params` must point to a live value whose layout matches
    /// the corresponding kernel parameter, and every device address reachable
    /// from those values must be valid for the kernel's accesses.
    unsafe fn launch_kernel(
        &self,
        function: FunctionHandle,
        grid_dim: Dim3,
        block_dim: Dim3,
        shared_mem_bytes: u32,
        stream: StreamHandle,
        params: &mut [*mut c_void],
    ) -> DriverResult<()>;

    /// Create a stream.
    fn stream_create(&self) -> DriverResult<StreamHandle>;

    /// Destroy a stream.
    fn stream_destroy(&self, stream: StreamHandle) -> DriverResult<()>;

    /// Block until a stream drains.
    fn stream_synchronize(&self, stream: StreamHandle) -> DriverResult<()>;

    /// Create an event.
    fn event_create(&self) -> DriverResult<EventHandle>;

    /// Record an event on a stream.
    fn event_record(&self, event: EventHandle, stream: StreamHandle) -> DriverResult<()>;

    /// Block until an event completes.
    fn event_synchronize(&self, event: EventHandle) -> DriverResult<()>;

    /// Destroy an event.
    fn event_destroy(&self, event: EventHandle) -> DriverResult<()>;

    /// Make a stream wait on an event.
    fn stream_wait_event(&self, stream: StreamHandle, event: EventHandle) -> DriverResult<()>;

    /// Human readable description of a status code.
    fn error_string(&self, status: DriverStatus) -> String;
}

/// Convert a raw driver result, logging failures with the call name and the
/// driver's error string.
pub fn check<T>(driver: &dyn Driver, call: &'static str, result: DriverResult<T>) -> Result<T> {
    result.map_err(|status| {
        let message = driver.error_string(status);
        tracing::error!(call, code = status.0, %message, "Driver call failed");
        ComputeError::Driver {
            call,
            code: status.0,
            message,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDriver;

    #[test]
    fn test_check_maps_status() {
        let driver = SimDriver::new();
        let err = check::<()>(&driver, "cuMemFree", Err(DriverStatus::INVALID_VALUE)).unwrap_err();
        match err {
            ComputeError::Driver {
                call,
                code,
                message,
            } => {
                assert_eq!(call, "cuMemFree");
                assert_eq!(code, 1);
                assert_eq!(message, "invalid argument");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(check(&driver, "cuInit", Ok(7)).unwrap(), 7);
    }

    #[test]
    fn test_null_handles() {
        assert!(StreamHandle::NULL.is_null());
        assert!(StreamHandle::default().is_null());
        assert!(DevicePtr::NULL.is_null());
        assert!(!DevicePtr(0x1000).is_null());
        assert_eq!(DevicePtr(0x1000).to_string(), "0x1000");
    }
}
