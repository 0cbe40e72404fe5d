//! [`Driver`] over the raw CUDA driver API.
//!
//! Calls go straight to `cudarc::driver::sys`, which resolves `libcuda` at
//! first use. Every non-success `CUresult` is returned as its integer code;
//! the driver's description of the code is captured at the failure site so
//! [`Driver::error_string`] can report it later.

use std::collections::HashMap;
use std::ffi::{c_char, c_void, CStr, CString};
use std::ptr;

use cudarc::driver::sys as cuda_sys;
use parking_lot::Mutex;

use hyperarray_core::driver::{
    ContextHandle, DeviceHandle, DevicePtr, Dim3, Driver, DriverResult, DriverStatus,
    EventHandle, FunctionHandle, ModuleHandle, StreamHandle,
};
use hyperarray_core::error::{ComputeError, Result};

/// CUDA driver binding.
pub struct CudaDriver {
    messages: Mutex<HashMap<i32, String>>,
}

impl CudaDriver {
    /// Binds the CUDA driver library.
    ///
    /// Fails with [`ComputeError::BackendUnavailable`] when `libcuda` cannot
    /// be loaded. Device initialization happens later through
    /// [`Driver::init`].
    pub fn new() -> Result<Self> {
        // cudarc panics when the library is missing
        let loaded = std::panic::catch_unwind(|| {
            let mut version = 0;
            unsafe { cuda_sys::cuDriverGetVersion(&mut version) }
        });
        match loaded {
            Ok(_) => {
                tracing::debug!("Bound CUDA driver library");
                Ok(Self {
                    messages: Mutex::new(HashMap::new()),
                })
            }
            Err(_) => Err(ComputeError::BackendUnavailable(
                "CUDA driver library not found".to_string(),
            )),
        }
    }

    fn status(&self, result: cuda_sys::CUresult) -> DriverResult<()> {
        if result == cuda_sys::CUresult::CUDA_SUCCESS {
            return Ok(());
        }
        let code = result as i32;
        let mut messages = self.messages.lock();
        messages.entry(code).or_insert_with(|| describe(result));
        Err(DriverStatus(code))
    }
}

fn describe(result: cuda_sys::CUresult) -> String {
    let mut text: *const c_char = ptr::null();
    // SAFETY: cuGetErrorString writes a pointer to a static string or leaves
    // it null.
    let status = unsafe { cuda_sys::cuGetErrorString(result, &mut text) };
    if status != cuda_sys::CUresult::CUDA_SUCCESS || text.is_null() {
        return format!("{result:?}");
    }
    // SAFETY: non-null pointers from cuGetErrorString are NUL-terminated and
    // static.
    unsafe { CStr::from_ptr(text) }.to_string_lossy().into_owned()
}

fn attribute(id: i32) -> Option<cuda_sys::CUdevice_attribute> {
    use cuda_sys::CUdevice_attribute as A;
    Some(match id {
        1 => A::CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_BLOCK,
        2 => A::CU_DEVICE_ATTRIBUTE_MAX_BLOCK_DIM_X,
        3 => A::CU_DEVICE_ATTRIBUTE_MAX_BLOCK_DIM_Y,
        4 => A::CU_DEVICE_ATTRIBUTE_MAX_BLOCK_DIM_Z,
        5 => A::CU_DEVICE_ATTRIBUTE_MAX_GRID_DIM_X,
        6 => A::CU_DEVICE_ATTRIBUTE_MAX_GRID_DIM_Y,
        7 => A::CU_DEVICE_ATTRIBUTE_MAX_GRID_DIM_Z,
        10 => A::CU_DEVICE_ATTRIBUTE_WARP_SIZE,
        16 => A::CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT,
        75 => A::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR,
        76 => A::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR,
        _ => return None,
    })
}

fn context(handle: ContextHandle) -> cuda_sys::CUcontext {
    handle.0 as usize as cuda_sys::CUcontext
}

fn stream(handle: StreamHandle) -> cuda_sys::CUstream {
    handle.0 as usize as cuda_sys::CUstream
}

fn module(handle: ModuleHandle) -> cuda_sys::CUmodule {
    handle.0 as usize as cuda_sys::CUmodule
}

fn function(handle: FunctionHandle) -> cuda_sys::CUfunction {
    handle.0 as usize as cuda_sys::CUfunction
}

fn event(handle: EventHandle) -> cuda_sys::CUevent {
    handle.0 as usize as cuda_sys::CUevent
}

impl Driver for CudaDriver {
    fn name(&self) -> &str {
        "cuda"
    }

    fn init(&self) -> DriverResult<()> {
        self.status(unsafe { cuda_sys::cuInit(0) })
    }

    fn driver_version(&self) -> DriverResult<i32> {
        let mut version = 0;
        self.status(unsafe { cuda_sys::cuDriverGetVersion(&mut version) })?;
        Ok(version)
    }

    fn device_count(&self) -> DriverResult<i32> {
        let mut count = 0;
        self.status(unsafe { cuda_sys::cuDeviceGetCount(&mut count) })?;
        Ok(count)
    }

    fn device_get(&self, ordinal: i32) -> DriverResult<DeviceHandle> {
        let mut device: cuda_sys::CUdevice = 0;
        self.status(unsafe { cuda_sys::cuDeviceGet(&mut device, ordinal) })?;
        Ok(DeviceHandle(device))
    }

    fn device_name(&self, device: DeviceHandle) -> DriverResult<String> {
        let mut name = [0 as c_char; 256];
        self.status(unsafe {
            cuda_sys::cuDeviceGetName(name.as_mut_ptr(), name.len() as i32, device.0)
        })?;
        // SAFETY: the driver NUL-terminates within the buffer.
        Ok(unsafe { CStr::from_ptr(name.as_ptr()) }
            .to_string_lossy()
            .into_owned())
    }

    fn device_attribute(&self, device: DeviceHandle, id: i32) -> DriverResult<i32> {
        let attrib = attribute(id).ok_or(DriverStatus::INVALID_VALUE)?;
        let mut value = 0;
        self.status(unsafe { cuda_sys::cuDeviceGetAttribute(&mut value, attrib, device.0) })?;
        Ok(value)
    }

    fn primary_context_retain(&self, device: DeviceHandle) -> DriverResult<ContextHandle> {
        let mut ctx: cuda_sys::CUcontext = ptr::null_mut();
        self.status(unsafe { cuda_sys::cuDevicePrimaryCtxRetain(&mut ctx, device.0) })?;
        Ok(ContextHandle(ctx as usize as u64))
    }

    fn primary_context_release(&self, device: DeviceHandle) -> DriverResult<()> {
        self.status(unsafe { cuda_sys::cuDevicePrimaryCtxRelease_v2(device.0) })
    }

    fn context_set_current(&self, ctx: ContextHandle) -> DriverResult<()> {
        self.status(unsafe { cuda_sys::cuCtxSetCurrent(context(ctx)) })
    }

    fn context_synchronize(&self) -> DriverResult<()> {
        self.status(unsafe { cuda_sys::cuCtxSynchronize() })
    }

    fn mem_alloc(&self, bytes: usize) -> DriverResult<DevicePtr> {
        let mut ptr: cuda_sys::CUdeviceptr = 0;
        self.status(unsafe { cuda_sys::cuMemAlloc_v2(&mut ptr, bytes) })?;
        Ok(DevicePtr(ptr))
    }

    fn mem_free(&self, ptr: DevicePtr) -> DriverResult<()> {
        self.status(unsafe { cuda_sys::cuMemFree_v2(ptr.0) })
    }

    fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> DriverResult<()> {
        self.status(unsafe {
            cuda_sys::cuMemcpyHtoD_v2(dst.0, src.as_ptr() as *const c_void, src.len())
        })
    }

    fn memcpy_dtoh(&self, dst: &mut [u8], src: DevicePtr) -> DriverResult<()> {
        self.status(unsafe {
            cuda_sys::cuMemcpyDtoH_v2(dst.as_mut_ptr() as *mut c_void, src.0, dst.len())
        })
    }

    fn module_load_data(&self, image: &[u8]) -> DriverResult<ModuleHandle> {
        // PTX images must be NUL-terminated
        let owned;
        let image = if image.last() == Some(&0) {
            image
        } else {
            let mut terminated = image.to_vec();
            terminated.push(0);
            owned = terminated;
            owned.as_slice()
        };
        let mut handle: cuda_sys::CUmodule = ptr::null_mut();
        self.status(unsafe {
            cuda_sys::cuModuleLoadData(&mut handle, image.as_ptr() as *const c_void)
        })?;
        Ok(ModuleHandle(handle as usize as u64))
    }

    fn module_unload(&self, handle: ModuleHandle) -> DriverResult<()> {
        self.status(unsafe { cuda_sys::cuModuleUnload(module(handle)) })
    }

    fn module_get_function(
        &self,
        handle: ModuleHandle,
        name: &str,
    ) -> DriverResult<FunctionHandle> {
        let name = CString::new(name).map_err(|_| DriverStatus::INVALID_VALUE)?;
        let mut func: cuda_sys::CUfunction = ptr::null_mut();
        self.status(unsafe {
            cuda_sys::cuModuleGetFunction(&mut func, module(handle), name.as_ptr())
        })?;
        Ok(FunctionHandle(func as usize as u64))
    }

    unsafe fn launch_kernel(
        &self,
        func: FunctionHandle,
        grid_dim: Dim3,
        block_dim: Dim3,
        shared_mem_bytes: u32,
        on: StreamHandle,
        params: &mut [*mut c_void],
    ) -> DriverResult<()> {
        // SAFETY: the caller upholds the parameter contract of launch_kernel.
        let result = unsafe {
            cuda_sys::cuLaunchKernel(
                function(func),
                grid_dim.0,
                grid_dim.1,
                grid_dim.2,
                block_dim.0,
                block_dim.1,
                block_dim.2,
                shared_mem_bytes,
                stream(on),
                params.as_mut_ptr(),
                ptr::null_mut(),
            )
        };
        self.status(result)
    }

    fn stream_create(&self) -> DriverResult<StreamHandle> {
        let mut handle: cuda_sys::CUstream = ptr::null_mut();
        self.status(unsafe { cuda_sys::cuStreamCreate(&mut handle, 0) })?;
        Ok(StreamHandle(handle as usize as u64))
    }

    fn stream_destroy(&self, handle: StreamHandle) -> DriverResult<()> {
        self.status(unsafe { cuda_sys::cuStreamDestroy_v2(stream(handle)) })
    }

    fn stream_synchronize(&self, handle: StreamHandle) -> DriverResult<()> {
        self.status(unsafe { cuda_sys::cuStreamSynchronize(stream(handle)) })
    }

    fn event_create(&self) -> DriverResult<EventHandle> {
        let mut handle: cuda_sys::CUevent = ptr::null_mut();
        self.status(unsafe { cuda_sys::cuEventCreate(&mut handle, 0) })?;
        Ok(EventHandle(handle as usize as u64))
    }

    fn event_record(&self, handle: EventHandle, on: StreamHandle) -> DriverResult<()> {
        self.status(unsafe { cuda_sys::cuEventRecord(event(handle), stream(on)) })
    }

    fn event_synchronize(&self, handle: EventHandle) -> DriverResult<()> {
        self.status(unsafe { cuda_sys::cuEventSynchronize(event(handle)) })
    }

    fn event_destroy(&self, handle: EventHandle) -> DriverResult<()> {
        self.status(unsafe { cuda_sys::cuEventDestroy_v2(event(handle)) })
    }

    fn stream_wait_event(&self, on: StreamHandle, handle: EventHandle) -> DriverResult<()> {
        self.status(unsafe { cuda_sys::cuStreamWaitEvent(stream(on), event(handle), 0) })
    }

    fn error_string(&self, status: DriverStatus) -> String {
        self.messages
            .lock()
            .get(&status.0)
            .cloned()
            .unwrap_or_else(|| format!("CUDA error {}", status.0))
    }
}
