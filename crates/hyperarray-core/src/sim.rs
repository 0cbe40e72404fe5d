//! Host-simulated driver.
//!
//! [`SimDriver`] implements [`Driver`] entirely in host memory so the array
//! store, stream pool, kernel catalog and dispatcher can run without an
//! accelerator. It is primarily used for testing.
//!
//! - Device allocations are byte vectors placed at synthetic, 256-byte
//!   aligned addresses.
//! - A module image is text; every `.entry <name>` declaration in it becomes a
//!   resolvable symbol, as with PTX.
//! - Kernel bodies are host closures registered by symbol name. A launch runs
//!   the body synchronously, so issue order is trivially preserved on every
//!   stream. Symbols without a registered body launch as no-ops.
//! - Every call is counted in [`SimStats`], and [`SimDriver::fail_next`]
//!   injects a failure status into the next call of a given kind.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ffi::c_void;
use std::sync::Arc;

use bytemuck::Pod;
use parking_lot::{Mutex, RwLock};

use crate::driver::{
    ContextHandle, DeviceHandle, DevicePtr, Dim3, Driver, DriverResult, DriverStatus,
    EventHandle, FunctionHandle, ModuleHandle, StreamHandle,
};

const BASE_ADDRESS: u64 = 0x7f00_0000_0000;
const ALIGNMENT: u64 = 256;
const MAX_THREADS_PER_BLOCK: u64 = 1024;

/// Host closure standing in for a kernel body.
pub type SimKernel = Arc<dyn Fn(&mut SimLaunch<'_>) -> DriverResult<()> + Send + Sync>;

/// Driver calls that can be made to fail with [`SimDriver::fail_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimCall {
    /// `init`.
    Init,
    /// `mem_alloc`.
    MemAlloc,
    /// `mem_free`.
    MemFree,
    /// `memcpy_htod` and `memcpy_dtoh`.
    Memcpy,
    /// `stream_create`.
    StreamCreate,
    /// `stream_destroy`.
    StreamDestroy,
    /// `module_load_data`.
    ModuleLoad,
    /// `module_get_function`.
    GetFunction,
    /// `launch_kernel`.
    Launch,
}

/// One recorded kernel launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimLaunchRecord {
    /// Symbol name of the launched function.
    pub symbol: String,
    /// Grid dimensions.
    pub grid_dim: Dim3,
    /// Block dimensions.
    pub block_dim: Dim3,
    /// Stream the launch was issued on.
    pub stream: StreamHandle,
    /// Number of kernel parameters.
    pub param_count: usize,
}

/// Call counters.
#[derive(Debug, Clone, Default)]
pub struct SimStats {
    /// Successful device allocations.
    pub allocations: u64,
    /// Successful device frees.
    pub frees: u64,
    /// Bytes currently allocated.
    pub bytes_in_use: usize,
    /// Host-to-device copies.
    pub htod_copies: u64,
    /// Device-to-host copies.
    pub dtoh_copies: u64,
    /// Streams created.
    pub streams_created: u64,
    /// Streams destroyed.
    pub streams_destroyed: u64,
    /// Modules loaded.
    pub modules_loaded: u64,
    /// Modules unloaded.
    pub modules_unloaded: u64,
    /// Primary context retains.
    pub context_retains: u64,
    /// Primary context releases.
    pub context_releases: u64,
    /// Successful launches, in issue order.
    pub launches: Vec<SimLaunchRecord>,
}

impl SimStats {
    /// Allocations not yet freed.
    pub fn live_allocations(&self) -> u64 {
        self.allocations - self.frees
    }
}

/// Simulated device memory.
#[derive(Debug, Default)]
pub struct SimMemory {
    allocations: BTreeMap<u64, Vec<u8>>,
}

impl SimMemory {
    /// Locate `len` bytes starting at `ptr` inside one allocation.
    fn locate(&self, ptr: DevicePtr, len: usize) -> DriverResult<(u64, usize)> {
        let (&base, block) = self
            .allocations
            .range(..=ptr.0)
            .next_back()
            .ok_or(DriverStatus::INVALID_VALUE)?;
        let offset = (ptr.0 - base) as usize;
        if offset + len > block.len() {
            return Err(DriverStatus::INVALID_VALUE);
        }
        Ok((base, offset))
    }

    /// Borrow `len` bytes at `ptr`.
    pub fn bytes(&self, ptr: DevicePtr, len: usize) -> DriverResult<&[u8]> {
        let (base, offset) = self.locate(ptr, len)?;
        Ok(&self.allocations[&base][offset..offset + len])
    }

    /// Mutably borrow `len` bytes at `ptr`.
    pub fn bytes_mut(&mut self, ptr: DevicePtr, len: usize) -> DriverResult<&mut [u8]> {
        let (base, offset) = self.locate(ptr, len)?;
        let block = self
            .allocations
            .get_mut(&base)
            .ok_or(DriverStatus::INVALID_VALUE)?;
        Ok(&mut block[offset..offset + len])
    }

    /// Read `count` elements at `ptr`.
    pub fn read<T: Pod>(&self, ptr: DevicePtr, count: usize) -> DriverResult<Vec<T>> {
        let bytes = self.bytes(ptr, count * std::mem::size_of::<T>())?;
        Ok(bytes
            .chunks_exact(std::mem::size_of::<T>().max(1))
            .map(bytemuck::pod_read_unaligned)
            .collect())
    }

    /// Write elements at `ptr`.
    pub fn write<T: Pod>(&mut self, ptr: DevicePtr, values: &[T]) -> DriverResult<()> {
        let src: &[u8] = bytemuck::cast_slice(values);
        self.bytes_mut(ptr, src.len())?.copy_from_slice(src);
        Ok(())
    }
}

/// View of a launch handed to a [`SimKernel`].
pub struct SimLaunch<'a> {
    /// Grid dimensions.
    pub grid_dim: Dim3,
    /// Block dimensions.
    pub block_dim: Dim3,
    params: &'a [*mut c_void],
    /// Device memory the kernel operates on.
    pub memory: &'a mut SimMemory,
}

impl SimLaunch<'_> {
    /// Number of kernel parameters.
    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    /// Read kernel parameter `index` as a `T`.
    ///
    /// # Safety
    ///
    /// Parameter `index` must point to a live `T`, which holds whenever the
    /// launch satisfied [`Driver::launch_kernel`]'s contract and `T` is the
    /// kernel's declared parameter type.
    pub unsafe fn param<T: Pod>(&self, index: usize) -> DriverResult<T> {
        let ptr = *self.params.get(index).ok_or(DriverStatus::INVALID_VALUE)?;
        if ptr.is_null() {
            return Err(DriverStatus::INVALID_VALUE);
        }
        // SAFETY: the caller guarantees `ptr` points to a live `T`.
        Ok(unsafe { std::ptr::read_unaligned(ptr as *const T) })
    }

    /// Total number of threads in the launch.
    pub fn thread_count(&self) -> u64 {
        let (gx, gy, gz) = self.grid_dim;
        let (bx, by, bz) = self.block_dim;
        [gx, gy, gz, bx, by, bz].iter().map(|&d| d as u64).product()
    }
}

#[derive(Default)]
struct SimState {
    initialized: bool,
    memory: SimMemory,
    next_address: u64,
    next_handle: u64,
    streams: HashSet<u64>,
    events: HashSet<u64>,
    modules: HashMap<u64, Vec<String>>,
    functions: HashMap<u64, (u64, String)>,
    faults: HashMap<SimCall, DriverStatus>,
    stats: SimStats,
}

impl SimState {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn fault(&mut self, call: SimCall) -> DriverResult<()> {
        match self.faults.remove(&call) {
            Some(status) => Err(status),
            None => Ok(()),
        }
    }

    fn stream_is_valid(&self, stream: StreamHandle) -> bool {
        stream.is_null() || self.streams.contains(&stream.0)
    }
}

/// Host-memory implementation of [`Driver`].
pub struct SimDriver {
    state: Mutex<SimState>,
    kernels: RwLock<HashMap<String, SimKernel>>,
}

impl SimDriver {
    /// Create a simulated driver with one device.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                next_address: BASE_ADDRESS,
                ..SimState::default()
            }),
            kernels: RwLock::new(HashMap::new()),
        }
    }

    /// Register a host closure as the body of kernel `symbol`.
    pub fn register_kernel<F>(&self, symbol: &str, body: F)
    where
        F: Fn(&mut SimLaunch<'_>) -> DriverResult<()> + Send + Sync + 'static,
    {
        self.kernels.write().insert(symbol.to_string(), Arc::new(body));
    }

    /// Make the next call of kind `call` fail with `status`.
    pub fn fail_next(&self, call: SimCall, status: DriverStatus) {
        self.state.lock().faults.insert(call, status);
    }

    /// Snapshot of the call counters.
    pub fn stats(&self) -> SimStats {
        self.state.lock().stats.clone()
    }

    /// Number of live streams.
    pub fn live_streams(&self) -> usize {
        self.state.lock().streams.len()
    }

    /// Number of loaded modules.
    pub fn loaded_modules(&self) -> usize {
        self.state.lock().modules.len()
    }

    /// Read device memory directly, bypassing the copy counters.
    pub fn peek<T: Pod>(&self, ptr: DevicePtr, count: usize) -> DriverResult<Vec<T>> {
        self.state.lock().memory.read(ptr, count)
    }

    /// Write device memory directly, bypassing the copy counters.
    pub fn poke<T: Pod>(&self, ptr: DevicePtr, values: &[T]) -> DriverResult<()> {
        self.state.lock().memory.write(ptr, values)
    }
}

impl Default for SimDriver {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_entries(image: &[u8]) -> DriverResult<Vec<String>> {
    let text = std::str::from_utf8(image).map_err(|_| DriverStatus::INVALID_IMAGE)?;
    let text = text.trim_end_matches('\0');
    let mut entries = Vec::new();
    for line in text.lines() {
        let mut tokens = line.split_whitespace();
        while let Some(token) = tokens.next() {
            if token == ".entry" {
                if let Some(name) = tokens.next() {
                    let name = name.split('(').next().unwrap_or(name);
                    if !name.is_empty() {
                        entries.push(name.to_string());
                    }
                }
            }
        }
    }
    Ok(entries)
}

impl Driver for SimDriver {
    fn name(&self) -> &str {
        "sim"
    }

    fn init(&self) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.fault(SimCall::Init)?;
        state.initialized = true;
        Ok(())
    }

    fn driver_version(&self) -> DriverResult<i32> {
        Ok(12060)
    }

    fn device_count(&self) -> DriverResult<i32> {
        if !self.state.lock().initialized {
            return Err(DriverStatus::NOT_INITIALIZED);
        }
        Ok(1)
    }

    fn device_get(&self, ordinal: i32) -> DriverResult<DeviceHandle> {
        if !self.state.lock().initialized {
            return Err(DriverStatus::NOT_INITIALIZED);
        }
        if ordinal != 0 {
            return Err(DriverStatus::INVALID_DEVICE);
        }
        Ok(DeviceHandle(0))
    }

    fn device_name(&self, device: DeviceHandle) -> DriverResult<String> {
        if device.0 != 0 {
            return Err(DriverStatus::INVALID_DEVICE);
        }
        Ok("Simulated Device".to_string())
    }

    fn device_attribute(&self, device: DeviceHandle, attribute: i32) -> DriverResult<i32> {
        if device.0 != 0 {
            return Err(DriverStatus::INVALID_DEVICE);
        }
        Ok(match attribute {
            // compute capability major / minor
            75 => 8,
            76 => 6,
            // max threads per block
            1 => MAX_THREADS_PER_BLOCK as i32,
            _ => 0,
        })
    }

    fn primary_context_retain(&self, device: DeviceHandle) -> DriverResult<ContextHandle> {
        if device.0 != 0 {
            return Err(DriverStatus::INVALID_DEVICE);
        }
        let mut state = self.state.lock();
        state.stats.context_retains += 1;
        Ok(ContextHandle(1))
    }

    fn primary_context_release(&self, device: DeviceHandle) -> DriverResult<()> {
        if device.0 != 0 {
            return Err(DriverStatus::INVALID_DEVICE);
        }
        let mut state = self.state.lock();
        if state.stats.context_releases >= state.stats.context_retains {
            return Err(DriverStatus::INVALID_HANDLE);
        }
        state.stats.context_releases += 1;
        Ok(())
    }

    fn context_set_current(&self, context: ContextHandle) -> DriverResult<()> {
        if context.0 == 0 {
            return Err(DriverStatus::INVALID_HANDLE);
        }
        Ok(())
    }

    fn context_synchronize(&self) -> DriverResult<()> {
        Ok(())
    }

    fn mem_alloc(&self, bytes: usize) -> DriverResult<DevicePtr> {
        let mut state = self.state.lock();
        state.fault(SimCall::MemAlloc)?;
        if bytes == 0 {
            return Err(DriverStatus::INVALID_VALUE);
        }
        let address = state.next_address;
        let span = (bytes as u64).div_ceil(ALIGNMENT) * ALIGNMENT;
        state.next_address += span;
        state.memory.allocations.insert(address, vec![0u8; bytes]);
        state.stats.allocations += 1;
        state.stats.bytes_in_use += bytes;
        Ok(DevicePtr(address))
    }

    fn mem_free(&self, ptr: DevicePtr) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.fault(SimCall::MemFree)?;
        let block = state
            .memory
            .allocations
            .remove(&ptr.0)
            .ok_or(DriverStatus::INVALID_VALUE)?;
        state.stats.frees += 1;
        state.stats.bytes_in_use -= block.len();
        Ok(())
    }

    fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.fault(SimCall::Memcpy)?;
        state.memory.bytes_mut(dst, src.len())?.copy_from_slice(src);
        state.stats.htod_copies += 1;
        Ok(())
    }

    fn memcpy_dtoh(&self, dst: &mut [u8], src: DevicePtr) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.fault(SimCall::Memcpy)?;
        dst.copy_from_slice(state.memory.bytes(src, dst.len())?);
        state.stats.dtoh_copies += 1;
        Ok(())
    }

    fn module_load_data(&self, image: &[u8]) -> DriverResult<ModuleHandle> {
        let mut state = self.state.lock();
        state.fault(SimCall::ModuleLoad)?;
        let entries = parse_entries(image)?;
        let handle = state.handle();
        state.modules.insert(handle, entries);
        state.stats.modules_loaded += 1;
        Ok(ModuleHandle(handle))
    }

    fn module_unload(&self, module: ModuleHandle) -> DriverResult<()> {
        let mut state = self.state.lock();
        state
            .modules
            .remove(&module.0)
            .ok_or(DriverStatus::INVALID_HANDLE)?;
        state.functions.retain(|_, (owner, _)| *owner != module.0);
        state.stats.modules_unloaded += 1;
        Ok(())
    }

    fn module_get_function(
        &self,
        module: ModuleHandle,
        name: &str,
    ) -> DriverResult<FunctionHandle> {
        let mut state = self.state.lock();
        state.fault(SimCall::GetFunction)?;
        let entries = state
            .modules
            .get(&module.0)
            .ok_or(DriverStatus::INVALID_HANDLE)?;
        if !entries.iter().any(|entry| entry == name) {
            return Err(DriverStatus::NOT_FOUND);
        }
        let handle = state.handle();
        state.functions.insert(handle, (module.0, name.to_string()));
        Ok(FunctionHandle(handle))
    }

    unsafe fn launch_kernel(
        &self,
        function: FunctionHandle,
        grid_dim: Dim3,
        block_dim: Dim3,
        _shared_mem_bytes: u32,
        stream: StreamHandle,
        params: &mut [*mut c_void],
    ) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.fault(SimCall::Launch)?;
        let symbol = state
            .functions
            .get(&function.0)
            .map(|(_, symbol)| symbol.clone())
            .ok_or(DriverStatus::INVALID_HANDLE)?;
        if !state.stream_is_valid(stream) {
            return Err(DriverStatus::INVALID_HANDLE);
        }
        let dims = [
            grid_dim.0, grid_dim.1, grid_dim.2, block_dim.0, block_dim.1, block_dim.2,
        ];
        if dims.contains(&0) {
            return Err(DriverStatus::INVALID_VALUE);
        }
        let threads_per_block = block_dim.0 as u64 * block_dim.1 as u64 * block_dim.2 as u64;
        if threads_per_block > MAX_THREADS_PER_BLOCK {
            return Err(DriverStatus::INVALID_VALUE);
        }

        let body = self.kernels.read().get(&symbol).cloned();
        if let Some(body) = body {
            let mut launch = SimLaunch {
                grid_dim,
                block_dim,
                params,
                memory: &mut state.memory,
            };
            body(&mut launch).map_err(|_| DriverStatus::LAUNCH_FAILED)?;
        }

        state.stats.launches.push(SimLaunchRecord {
            symbol,
            grid_dim,
            block_dim,
            stream,
            param_count: params.len(),
        });
        Ok(())
    }

    fn stream_create(&self) -> DriverResult<StreamHandle> {
        let mut state = self.state.lock();
        state.fault(SimCall::StreamCreate)?;
        let handle = state.handle();
        state.streams.insert(handle);
        state.stats.streams_created += 1;
        Ok(StreamHandle(handle))
    }

    fn stream_destroy(&self, stream: StreamHandle) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.fault(SimCall::StreamDestroy)?;
        if !state.streams.remove(&stream.0) {
            return Err(DriverStatus::INVALID_HANDLE);
        }
        state.stats.streams_destroyed += 1;
        Ok(())
    }

    fn stream_synchronize(&self, stream: StreamHandle) -> DriverResult<()> {
        if !self.state.lock().stream_is_valid(stream) {
            return Err(DriverStatus::INVALID_HANDLE);
        }
        Ok(())
    }

    fn event_create(&self) -> DriverResult<EventHandle> {
        let mut state = self.state.lock();
        let handle = state.handle();
        state.events.insert(handle);
        Ok(EventHandle(handle))
    }

    fn event_record(&self, event: EventHandle, stream: StreamHandle) -> DriverResult<()> {
        let state = self.state.lock();
        if !state.events.contains(&event.0) || !state.stream_is_valid(stream) {
            return Err(DriverStatus::INVALID_HANDLE);
        }
        Ok(())
    }

    fn event_synchronize(&self, event: EventHandle) -> DriverResult<()> {
        if !self.state.lock().events.contains(&event.0) {
            return Err(DriverStatus::INVALID_HANDLE);
        }
        Ok(())
    }

    fn event_destroy(&self, event: EventHandle) -> DriverResult<()> {
        if !self.state.lock().events.remove(&event.0) {
            return Err(DriverStatus::INVALID_HANDLE);
        }
        Ok(())
    }

    fn stream_wait_event(&self, stream: StreamHandle, event: EventHandle) -> DriverResult<()> {
        let state = self.state.lock();
        if !state.events.contains(&event.0) || !state.stream_is_valid(stream) {
            return Err(DriverStatus::INVALID_HANDLE);
        }
        Ok(())
    }

    fn error_string(&self, status: DriverStatus) -> String {
        match status.0 {
            0 => "no error",
            1 => "invalid argument",
            2 => "out of memory",
            3 => "initialization error",
            100 => "no CUDA-capable device is detected",
            101 => "invalid device ordinal",
            200 => "device kernel image is invalid",
            400 => "invalid resource handle",
            500 => "named symbol not found",
            719 => "unspecified launch failure",
            _ => "unknown error",
        }
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_copy_free() {
        let driver = SimDriver::new();
        let ptr = driver.mem_alloc(16).unwrap();
        assert_eq!(ptr.0 % ALIGNMENT, 0);

        driver.memcpy_htod(ptr, &[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 4];
        driver.memcpy_dtoh(&mut out, ptr).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);

        // interior pointers resolve to the containing allocation
        driver.memcpy_htod(DevicePtr(ptr.0 + 12), &[9, 9, 9, 9]).unwrap();
        assert_eq!(driver.peek::<u8>(DevicePtr(ptr.0 + 12), 4).unwrap(), vec![9; 4]);

        // out of bounds
        assert_eq!(
            driver.memcpy_htod(DevicePtr(ptr.0 + 14), &[0; 4]),
            Err(DriverStatus::INVALID_VALUE)
        );

        driver.mem_free(ptr).unwrap();
        assert_eq!(driver.mem_free(ptr), Err(DriverStatus::INVALID_VALUE));

        let stats = driver.stats();
        assert_eq!(stats.allocations, 1);
        assert_eq!(stats.frees, 1);
        assert_eq!(stats.bytes_in_use, 0);
    }

    #[test]
    fn test_module_entries() {
        let driver = SimDriver::new();
        let image =
            b".version 8.0\n.visible .entry add_f32(\n.param .u64 p\n)\n.entry scale_f32 (\n";
        let module = driver.module_load_data(image).unwrap();
        assert!(driver.module_get_function(module, "add_f32").is_ok());
        assert!(driver.module_get_function(module, "scale_f32").is_ok());
        assert_eq!(
            driver.module_get_function(module, "missing"),
            Err(DriverStatus::NOT_FOUND)
        );
        driver.module_unload(module).unwrap();
        assert_eq!(
            driver.module_get_function(module, "add_f32"),
            Err(DriverStatus::INVALID_HANDLE)
        );
    }

    #[test]
    fn test_fault_injection_is_one_shot() {
        let driver = SimDriver::new();
        driver.fail_next(SimCall::StreamCreate, DriverStatus::OUT_OF_MEMORY);
        assert_eq!(driver.stream_create(), Err(DriverStatus::OUT_OF_MEMORY));
        assert!(driver.stream_create().is_ok());
    }

    #[test]
    fn test_launch_runs_body() {
        let driver = SimDriver::new();
        driver.register_kernel("fill", |launch| {
            let ptr: u64 = unsafe { launch.param(0)? };
            let n = launch.thread_count() as usize;
            launch.memory.write(DevicePtr(ptr), &vec![7u32; n])
        });
        let module = driver.module_load_data(b".entry fill(").unwrap();
        let function = driver.module_get_function(module, "fill").unwrap();
        let buffer = driver.mem_alloc(4 * 4).unwrap();

        let mut arg = buffer.0;
        let mut params = [&mut arg as *mut u64 as *mut c_void];
        unsafe {
            driver
                .launch_kernel(function, (1, 1, 1), (4, 1, 1), 0, StreamHandle::NULL, &mut params)
                .unwrap();
        }
        assert_eq!(driver.peek::<u32>(buffer, 4).unwrap(), vec![7; 4]);
        assert_eq!(driver.stats().launches[0].symbol, "fill");

        // oversized block is rejected before the body runs
        let result = unsafe {
            driver.launch_kernel(
                function,
                (1, 1, 1),
                (2048, 1, 1),
                0,
                StreamHandle::NULL,
                &mut params,
            )
        };
        assert_eq!(result, Err(DriverStatus::INVALID_VALUE));
    }
}
