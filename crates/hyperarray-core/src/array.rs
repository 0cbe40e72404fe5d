//! Array store: N-dimensional arrays over shared host and device buffers.
//!
//! An [`Array`] pairs a frozen shape with up to two reference-counted buffers,
//! one in host memory and one in device memory. Buffers are shared between
//! arrays by cloning their handle; the underlying memory is freed exactly once,
//! when the last array referencing it releases it or is dropped.
//!
//! All store operations validate their preconditions first. A violation is
//! logged as a warning and returned as an error without touching any buffer.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::driver::{check, DevicePtr, Driver};
use crate::dtype::{Element, ElementType};
use crate::error::{ComputeError, Result};

/// Maximum number of array dimensions.
pub const MAX_DIMS: usize = 4;

/// Which address space a buffer lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferSide {
    /// Host memory.
    Host,
    /// Device memory.
    Device,
}

impl fmt::Display for BufferSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferSide::Host => f.write_str("host"),
            BufferSide::Device => f.write_str("device"),
        }
    }
}

/// Where [`ArrayStore::create_array`] places the initial data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Placement {
    /// Allocate and fill the host buffer only.
    #[default]
    Host,
    /// Allocate and fill the device buffer only.
    Device,
}

/// Immutable shape descriptor with row-major byte strides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayShape {
    element_type: ElementType,
    ndim: usize,
    dims: [usize; MAX_DIMS],
    strides: [usize; MAX_DIMS],
    len: usize,
    byte_len: usize,
}

impl ArrayShape {
    /// Build a shape; `dims.len()` is the dimension count and must be 1..=4.
    ///
    /// Fails with [`ComputeError::ExtentOverflow`] when the byte size does
    /// not fit in `usize`.
    pub fn new(element_type: ElementType, dims: &[usize]) -> Result<Self> {
        let ndim = dims.len();
        if !(1..=MAX_DIMS).contains(&ndim) {
            return Err(ComputeError::InvalidDimensions { ndim });
        }

        let mut shape = [0usize; MAX_DIMS];
        shape[..ndim].copy_from_slice(dims);

        let mut strides = [0usize; MAX_DIMS];
        let mut stride = element_type.size();
        for axis in (0..ndim).rev() {
            strides[axis] = stride;
            stride = stride
                .checked_mul(shape[axis])
                .ok_or(ComputeError::ExtentOverflow(shape[axis]))?;
        }
        let len = dims
            .iter()
            .try_fold(1usize, |len, &extent| len.checked_mul(extent))
            .ok_or(ComputeError::ExtentOverflow(stride))?;

        Ok(Self {
            element_type,
            ndim,
            dims: shape,
            strides,
            len,
            byte_len: stride,
        })
    }

    /// Element type.
    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    /// Number of dimensions.
    pub fn ndim(&self) -> usize {
        self.ndim
    }

    /// Per-dimension extents.
    pub fn dims(&self) -> &[usize] {
        &self.dims[..self.ndim]
    }

    /// Per-dimension strides in bytes.
    pub fn strides(&self) -> &[usize] {
        &self.strides[..self.ndim]
    }

    /// Extent along `axis`, or 1 past the last dimension.
    pub fn extent(&self, axis: usize) -> usize {
        if axis < self.ndim {
            self.dims[axis]
        } else {
            1
        }
    }

    /// Total number of elements.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the array has no elements.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total size in bytes.
    pub fn byte_len(&self) -> usize {
        self.byte_len
    }
}

/// Host memory block shared between arrays.
///
/// Backed by 8-byte words so the contents can be viewed as any element type.
struct HostAllocation {
    words: Mutex<Vec<u64>>,
    byte_len: usize,
}

/// Reference-counted host buffer.
#[derive(Clone)]
pub struct SharedHostBuffer {
    inner: Arc<HostAllocation>,
}

impl SharedHostBuffer {
    fn zeroed(byte_len: usize) -> Self {
        Self {
            inner: Arc::new(HostAllocation {
                words: Mutex::new(vec![0u64; byte_len.div_ceil(8)]),
                byte_len,
            }),
        }
    }

    /// Size in bytes.
    pub fn byte_len(&self) -> usize {
        self.inner.byte_len
    }

    /// Number of arrays sharing this buffer.
    pub fn reference_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Whether two handles share one allocation.
    pub fn same_allocation(&self, other: &SharedHostBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Borrow the contents as bytes.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let words = self.inner.words.lock();
        f(&bytemuck::cast_slice(&words)[..self.inner.byte_len])
    }

    /// Mutably borrow the contents as bytes.
    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut words = self.inner.words.lock();
        f(&mut bytemuck::cast_slice_mut(&mut words)[..self.inner.byte_len])
    }
}

impl fmt::Debug for SharedHostBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedHostBuffer")
            .field("byte_len", &self.inner.byte_len)
            .field("references", &self.reference_count())
            .finish()
    }
}

/// Who frees a device allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Allocated by the store; freed on last release.
    Owned,
    /// Supplied from outside; never freed by the store.
    Foreign,
}

struct DeviceAllocation {
    ptr: DevicePtr,
    byte_len: usize,
    ownership: Ownership,
    driver: Arc<dyn Driver>,
}

impl Drop for DeviceAllocation {
    fn drop(&mut self) {
        if self.ownership == Ownership::Foreign {
            debug!(ptr = %self.ptr, "Detached foreign device buffer");
            return;
        }
        if check(
            self.driver.as_ref(),
            "cuMemFree",
            self.driver.mem_free(self.ptr),
        )
        .is_ok()
        {
            debug!(ptr = %self.ptr, bytes = self.byte_len, "Freed device buffer");
        }
    }
}

/// Reference-counted device buffer.
#[derive(Clone)]
pub struct SharedDeviceBuffer {
    inner: Arc<DeviceAllocation>,
}

impl SharedDeviceBuffer {
    /// Device address of the first byte.
    pub fn ptr(&self) -> DevicePtr {
        self.inner.ptr
    }

    /// Size in bytes.
    pub fn byte_len(&self) -> usize {
        self.inner.byte_len
    }

    /// Whether the store frees this allocation.
    pub fn ownership(&self) -> Ownership {
        self.inner.ownership
    }

    /// Number of arrays sharing this buffer.
    pub fn reference_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Whether two handles share one allocation.
    pub fn same_allocation(&self, other: &SharedDeviceBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for SharedDeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedDeviceBuffer")
            .field("ptr", &self.inner.ptr)
            .field("byte_len", &self.inner.byte_len)
            .field("ownership", &self.inner.ownership)
            .field("references", &self.reference_count())
            .finish()
    }
}

/// N-dimensional array handle over optional host and device buffers.
///
/// The shape is fixed at creation. Dropping an array releases its references
/// to both buffers.
#[derive(Debug)]
pub struct Array {
    shape: ArrayShape,
    host: Option<SharedHostBuffer>,
    device: Option<SharedDeviceBuffer>,
}

impl Array {
    /// Shape descriptor.
    pub fn shape(&self) -> &ArrayShape {
        &self.shape
    }

    /// Number of dimensions.
    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }

    /// Per-dimension extents.
    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    /// Per-dimension strides in bytes.
    pub fn strides(&self) -> &[usize] {
        self.shape.strides()
    }

    /// Total number of elements.
    pub fn len(&self) -> usize {
        self.shape.len()
    }

    /// Whether the array has no elements.
    pub fn is_empty(&self) -> bool {
        self.shape.is_empty()
    }

    /// Size in bytes.
    pub fn byte_len(&self) -> usize {
        self.shape.byte_len()
    }

    /// Element type.
    pub fn element_type(&self) -> ElementType {
        self.shape.element_type()
    }

    /// Whether a host buffer is attached.
    pub fn is_host_allocated(&self) -> bool {
        self.host.is_some()
    }

    /// Whether a device buffer is attached.
    pub fn is_device_allocated(&self) -> bool {
        self.device.is_some()
    }

    /// Host buffer handle, if attached.
    pub fn host_buffer(&self) -> Option<&SharedHostBuffer> {
        self.host.as_ref()
    }

    /// Device buffer handle, if attached.
    pub fn device_buffer(&self) -> Option<&SharedDeviceBuffer> {
        self.device.as_ref()
    }

    /// Device address of the array data, for interop with other libraries.
    pub fn device_ptr(&self) -> Option<DevicePtr> {
        self.device.as_ref().map(SharedDeviceBuffer::ptr)
    }

    /// References to the host buffer, or 0 when unallocated.
    pub fn host_reference_count(&self) -> usize {
        self.host.as_ref().map_or(0, SharedHostBuffer::reference_count)
    }

    /// References to the device buffer, or 0 when unallocated.
    pub fn device_reference_count(&self) -> usize {
        self.device
            .as_ref()
            .map_or(0, SharedDeviceBuffer::reference_count)
    }

    fn host_or_err(&self) -> Result<&SharedHostBuffer> {
        self.host.as_ref().ok_or(ComputeError::NotAllocated {
            side: BufferSide::Host,
        })
    }

    fn device_or_err(&self) -> Result<&SharedDeviceBuffer> {
        self.device.as_ref().ok_or(ComputeError::NotAllocated {
            side: BufferSide::Device,
        })
    }
}

fn reject<T>(err: ComputeError) -> Result<T> {
    warn!(error = %err, "Array operation skipped");
    Err(err)
}

fn check_element<T: Element>(array: &Array, len: usize) -> Result<()> {
    if T::TYPE != array.element_type() {
        return Err(ComputeError::ElementTypeMismatch {
            expected: array.element_type(),
            actual: T::TYPE,
        });
    }
    if len != array.len() {
        return Err(ComputeError::LengthMismatch {
            expected: array.len(),
            actual: len,
        });
    }
    Ok(())
}

fn check_compatible(src: &Array, dst: &Array) -> Result<()> {
    if src.element_type() != dst.element_type() {
        return Err(ComputeError::ElementTypeMismatch {
            expected: dst.element_type(),
            actual: src.element_type(),
        });
    }
    if src.len() != dst.len() {
        return Err(ComputeError::LengthMismatch {
            expected: dst.len(),
            actual: src.len(),
        });
    }
    Ok(())
}

/// Array operations bound to one driver.
#[derive(Clone)]
pub struct ArrayStore {
    driver: Arc<dyn Driver>,
}

impl ArrayStore {
    /// Create a store that allocates through `driver`.
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self { driver }
    }

    /// Create an array without buffers.
    pub fn empty_array(&self, element_type: ElementType, dims: &[usize]) -> Result<Array> {
        let shape = match ArrayShape::new(element_type, dims) {
            Ok(shape) => shape,
            Err(err) => return reject(err),
        };
        Ok(Array {
            shape,
            host: None,
            device: None,
        })
    }

    /// Create an array and fill one side with `data`.
    ///
    /// `dims.len()` is the dimension count. With [`Placement::Device`] only
    /// the device buffer is allocated; with [`Placement::Host`] only the host
    /// buffer.
    pub fn create_array<T: Element>(
        &self,
        dims: &[usize],
        data: &[T],
        placement: Placement,
    ) -> Result<Array> {
        let mut array = self.empty_array(T::TYPE, dims)?;
        if let Err(err) = check_element::<T>(&array, data.len()) {
            return reject(err);
        }
        match placement {
            Placement::Device => {
                self.allocate_device(&mut array)?;
                self.write_device(&array, data)?;
            }
            Placement::Host => {
                self.allocate_host(&mut array)?;
                self.write_host(&array, data)?;
            }
        }
        debug!(
            dims = ?array.dims(),
            element_type = %array.element_type(),
            ?placement,
            "Created array"
        );
        Ok(array)
    }

    /// Allocate the device buffer. Fails without side effects if present.
    pub fn allocate_device(&self, array: &mut Array) -> Result<()> {
        if array.device.is_some() {
            return reject(ComputeError::AlreadyAllocated {
                side: BufferSide::Device,
            });
        }
        let bytes = array.byte_len();
        let ptr = check(self.driver.as_ref(), "cuMemAlloc", self.driver.mem_alloc(bytes))?;
        array.device = Some(SharedDeviceBuffer {
            inner: Arc::new(DeviceAllocation {
                ptr,
                byte_len: bytes,
                ownership: Ownership::Owned,
                driver: Arc::clone(&self.driver),
            }),
        });
        debug!(%ptr, bytes, "Allocated device buffer");
        Ok(())
    }

    /// Allocate a zeroed host buffer. Fails without side effects if present.
    pub fn allocate_host(&self, array: &mut Array) -> Result<()> {
        if array.host.is_some() {
            return reject(ComputeError::AlreadyAllocated {
                side: BufferSide::Host,
            });
        }
        array.host = Some(SharedHostBuffer::zeroed(array.byte_len()));
        Ok(())
    }

    /// Copy the whole host buffer to the device buffer. Both must be allocated.
    pub fn sync_to_device(&self, array: &Array) -> Result<()> {
        let (host, device) = match (array.host_or_err(), array.device_or_err()) {
            (Ok(host), Ok(device)) => (host, device),
            (Err(err), _) | (_, Err(err)) => return reject(err),
        };
        host.with_bytes(|bytes| {
            check(
                self.driver.as_ref(),
                "cuMemcpyHtoD",
                self.driver.memcpy_htod(device.ptr(), bytes),
            )
        })
    }

    /// Copy the whole device buffer to the host buffer. Both must be allocated.
    pub fn sync_to_host(&self, array: &Array) -> Result<()> {
        let (host, device) = match (array.host_or_err(), array.device_or_err()) {
            (Ok(host), Ok(device)) => (host, device),
            (Err(err), _) | (_, Err(err)) => return reject(err),
        };
        host.with_bytes_mut(|bytes| {
            check(
                self.driver.as_ref(),
                "cuMemcpyDtoH",
                self.driver.memcpy_dtoh(bytes, device.ptr()),
            )
        })
    }

    /// Copy the host buffer into `out`.
    pub fn get_host<T: Element>(&self, array: &Array, out: &mut [T]) -> Result<()> {
        let host = match check_element::<T>(array, out.len()).and_then(|_| array.host_or_err()) {
            Ok(host) => host,
            Err(err) => return reject(err),
        };
        host.with_bytes(|bytes| bytemuck::cast_slice_mut::<T, u8>(out).copy_from_slice(bytes));
        Ok(())
    }

    /// Copy the device buffer straight into `out`.
    pub fn get_device<T: Element>(&self, array: &Array, out: &mut [T]) -> Result<()> {
        let device =
            match check_element::<T>(array, out.len()).and_then(|_| array.device_or_err()) {
                Ok(device) => device,
                Err(err) => return reject(err),
            };
        check(
            self.driver.as_ref(),
            "cuMemcpyDtoH",
            self.driver.memcpy_dtoh(bytemuck::cast_slice_mut(out), device.ptr()),
        )
    }

    /// Overwrite the host buffer with `data`.
    pub fn write_host<T: Element>(&self, array: &Array, data: &[T]) -> Result<()> {
        let host = match check_element::<T>(array, data.len()).and_then(|_| array.host_or_err()) {
            Ok(host) => host,
            Err(err) => return reject(err),
        };
        host.with_bytes_mut(|bytes| bytes.copy_from_slice(bytemuck::cast_slice(data)));
        Ok(())
    }

    /// Overwrite the device buffer with `data`.
    pub fn write_device<T: Element>(&self, array: &Array, data: &[T]) -> Result<()> {
        let device =
            match check_element::<T>(array, data.len()).and_then(|_| array.device_or_err()) {
                Ok(device) => device,
                Err(err) => return reject(err),
            };
        check(
            self.driver.as_ref(),
            "cuMemcpyHtoD",
            self.driver.memcpy_htod(device.ptr(), bytemuck::cast_slice(data)),
        )
    }

    /// Drop this array's reference to its host buffer.
    ///
    /// The memory is freed when no other array shares it.
    pub fn release_host(&self, array: &mut Array) -> Result<()> {
        match array.host.take() {
            Some(buffer) => {
                debug!(
                    remaining = buffer.reference_count() - 1,
                    "Released host buffer"
                );
                Ok(())
            }
            None => reject(ComputeError::NotAllocated {
                side: BufferSide::Host,
            }),
        }
    }

    /// Drop this array's reference to its device buffer.
    ///
    /// The memory is freed through the driver when no other array shares it.
    pub fn release_device(&self, array: &mut Array) -> Result<()> {
        match array.device.take() {
            Some(buffer) => {
                debug!(
                    ptr = %buffer.ptr(),
                    remaining = buffer.reference_count() - 1,
                    "Released device buffer"
                );
                Ok(())
            }
            None => reject(ComputeError::NotAllocated {
                side: BufferSide::Device,
            }),
        }
    }

    /// Make `dst` alias `src`'s host buffer, releasing whatever `dst` held.
    pub fn share_host(&self, src: &Array, dst: &mut Array) -> Result<()> {
        let buffer = match check_compatible(src, dst).and_then(|_| src.host_or_err()) {
            Ok(buffer) => buffer.clone(),
            Err(err) => return reject(err),
        };
        if let Some(previous) = dst.host.as_ref() {
            if previous.same_allocation(&buffer) {
                return Ok(());
            }
            self.release_host(dst)?;
        }
        dst.host = Some(buffer);
        Ok(())
    }

    /// Make `dst` alias `src`'s device buffer, releasing whatever `dst` held.
    pub fn share_device(&self, src: &Array, dst: &mut Array) -> Result<()> {
        let buffer = match check_compatible(src, dst).and_then(|_| src.device_or_err()) {
            Ok(buffer) => buffer.clone(),
            Err(err) => return reject(err),
        };
        if let Some(previous) = dst.device.as_ref() {
            if previous.same_allocation(&buffer) {
                return Ok(());
            }
            self.release_device(dst)?;
        }
        dst.device = Some(buffer);
        Ok(())
    }

    /// Make `dst` alias an externally owned device allocation.
    ///
    /// The allocation must hold at least `dst.byte_len()` bytes and outlive
    /// every array sharing it; the store never frees it.
    pub fn share_device_from_ptr(&self, ptr: DevicePtr, dst: &mut Array) -> Result<()> {
        if ptr.is_null() {
            return reject(ComputeError::NotAllocated {
                side: BufferSide::Device,
            });
        }
        if dst.device.is_some() {
            self.release_device(dst)?;
        }
        dst.device = Some(SharedDeviceBuffer {
            inner: Arc::new(DeviceAllocation {
                ptr,
                byte_len: dst.byte_len(),
                ownership: Ownership::Foreign,
                driver: Arc::clone(&self.driver),
            }),
        });
        Ok(())
    }

    /// The device address of `src`'s buffer, for handing to external code.
    pub fn share_device_to_ptr(&self, src: &Array) -> Result<DevicePtr> {
        match src.device_or_err() {
            Ok(buffer) => Ok(buffer.ptr()),
            Err(err) => reject(err),
        }
    }

    /// Run `f` over `src`'s host data viewed as `T`, without copying.
    pub fn share_host_to_slice<T: Element, R>(
        &self,
        src: &Array,
        f: impl FnOnce(&[T]) -> R,
    ) -> Result<R> {
        let host = match check_element::<T>(src, src.len()).and_then(|_| src.host_or_err()) {
            Ok(host) => host,
            Err(err) => return reject(err),
        };
        Ok(host.with_bytes(|bytes| f(bytemuck::cast_slice(bytes))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimCall, SimDriver};
    use crate::driver::DriverStatus;

    fn store() -> (Arc<SimDriver>, ArrayStore) {
        let driver = Arc::new(SimDriver::new());
        let store = ArrayStore::new(driver.clone());
        (driver, store)
    }

    #[test]
    fn test_shape_is_row_major() {
        let shape = ArrayShape::new(ElementType::F32, &[3, 4]).unwrap();
        assert_eq!(shape.ndim(), 2);
        assert_eq!(shape.dims(), &[3, 4]);
        assert_eq!(shape.strides(), &[16, 4]);
        assert_eq!(shape.len(), 12);
        assert_eq!(shape.extent(2), 1);

        let shape = ArrayShape::new(ElementType::F64, &[2, 3, 4, 5]).unwrap();
        assert_eq!(shape.strides(), &[480, 160, 40, 8]);
    }

    #[test]
    fn test_invalid_dimensions() {
        let (_, store) = store();
        assert!(matches!(
            store.empty_array(ElementType::F32, &[]),
            Err(ComputeError::InvalidDimensions { ndim: 0 })
        ));
        assert!(matches!(
            store.create_array::<f32>(&[1, 1, 1, 1, 1], &[0.0], Placement::Host),
            Err(ComputeError::InvalidDimensions { ndim: 5 })
        ));
    }

    #[test]
    fn test_oversized_shape_is_rejected() {
        let (driver, store) = store();
        assert!(matches!(
            store.empty_array(ElementType::F32, &[usize::MAX / 2, 4]),
            Err(ComputeError::ExtentOverflow(_))
        ));
        assert!(matches!(
            ArrayShape::new(ElementType::U8, &[1 << 20, 1 << 20, 1 << 20, 1 << 20]),
            Err(ComputeError::ExtentOverflow(_))
        ));
        assert!(matches!(
            store.create_array::<f64>(&[usize::MAX, 2], &[], Placement::Device),
            Err(ComputeError::ExtentOverflow(_))
        ));
        assert_eq!(driver.stats().allocations, 0);
    }

    #[test]
    fn test_create_device_only() {
        let (driver, store) = store();
        let array = store
            .create_array(&[2, 2], &[1i32, 2, 3, 4], Placement::Device)
            .unwrap();
        assert!(array.is_device_allocated());
        assert!(!array.is_host_allocated());
        let mut out = [0i32; 4];
        store.get_device(&array, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
        drop(array);
        assert_eq!(driver.stats().live_allocations(), 0);
    }

    #[test]
    fn test_double_allocation_is_rejected() {
        let (driver, store) = store();
        let mut array = store.empty_array(ElementType::F32, &[8]).unwrap();
        store.allocate_device(&mut array).unwrap();
        let ptr = array.device_ptr();
        assert!(matches!(
            store.allocate_device(&mut array),
            Err(ComputeError::AlreadyAllocated {
                side: BufferSide::Device
            })
        ));
        assert_eq!(array.device_ptr(), ptr);
        assert_eq!(driver.stats().allocations, 1);

        store.allocate_host(&mut array).unwrap();
        assert!(store.allocate_host(&mut array).is_err());
    }

    #[test]
    fn test_sync_requires_both_sides() {
        let (driver, store) = store();
        let array = store
            .create_array(&[3], &[5.0f32, 6.0, 7.0], Placement::Device)
            .unwrap();
        let copies = driver.stats().htod_copies;
        assert!(matches!(
            store.sync_to_device(&array),
            Err(ComputeError::NotAllocated {
                side: BufferSide::Host
            })
        ));
        assert_eq!(driver.stats().htod_copies, copies);

        let mut out = [0f32; 3];
        store.get_device(&array, &mut out).unwrap();
        assert_eq!(out, [5.0, 6.0, 7.0]);
    }

    #[test]
    fn test_round_trip() {
        let (driver, store) = store();
        let mut array = store
            .create_array(&[4], &[1.5f64, -2.25, 3.0, f64::MAX], Placement::Host)
            .unwrap();
        store.allocate_device(&mut array).unwrap();
        store.sync_to_device(&array).unwrap();

        // mutate on the device side, then pull back
        driver
            .poke(array.device_ptr().unwrap(), &[9.0f64, 8.0, 7.0, 6.0])
            .unwrap();
        store.sync_to_host(&array).unwrap();

        let mut out = [0f64; 4];
        store.get_host(&array, &mut out).unwrap();
        assert_eq!(out, [9.0, 8.0, 7.0, 6.0]);
    }

    #[test]
    fn test_typed_access_checks() {
        let (_, store) = store();
        let array = store
            .create_array(&[2], &[1u32, 2], Placement::Host)
            .unwrap();
        let mut wrong_type = [0f32; 2];
        assert!(matches!(
            store.get_host(&array, &mut wrong_type),
            Err(ComputeError::ElementTypeMismatch { .. })
        ));
        let mut wrong_len = [0u32; 3];
        assert!(matches!(
            store.get_host(&array, &mut wrong_len),
            Err(ComputeError::LengthMismatch { .. })
        ));
        assert!(matches!(
            store.write_device(&array, &[1u32, 2]),
            Err(ComputeError::NotAllocated {
                side: BufferSide::Device
            })
        ));
    }

    #[test]
    fn test_shared_device_buffer_freed_once() {
        let (driver, store) = store();
        let mut src = store
            .create_array(&[4], &[1f32; 4], Placement::Device)
            .unwrap();
        let mut aliases: Vec<Array> = (0..3)
            .map(|_| store.empty_array(ElementType::F32, &[4]).unwrap())
            .collect();
        for alias in &mut aliases {
            store.share_device(&src, alias).unwrap();
        }
        assert_eq!(src.device_reference_count(), 4);

        for alias in &mut aliases {
            store.release_device(alias).unwrap();
            assert_eq!(driver.stats().frees, 0);
        }
        assert_eq!(src.device_reference_count(), 1);

        store.release_device(&mut src).unwrap();
        assert_eq!(driver.stats().frees, 1);
        assert!(!src.is_device_allocated());
        assert!(store.release_device(&mut src).is_err());
        assert_eq!(driver.stats().frees, 1);
    }

    #[test]
    fn test_share_releases_previous_buffer() {
        let (driver, store) = store();
        let src = store
            .create_array(&[2], &[1f32, 2.0], Placement::Device)
            .unwrap();
        let mut dst = store
            .create_array(&[2], &[3f32, 4.0], Placement::Device)
            .unwrap();
        store.share_device(&src, &mut dst).unwrap();
        assert_eq!(driver.stats().frees, 1);
        assert_eq!(dst.device_ptr(), src.device_ptr());

        // sharing again with the same buffer does not stack references
        store.share_device(&src, &mut dst).unwrap();
        assert_eq!(src.device_reference_count(), 2);
    }

    #[test]
    fn test_shared_host_writes_are_visible() {
        let (_, store) = store();
        let src = store
            .create_array(&[3], &[1i64, 2, 3], Placement::Host)
            .unwrap();
        let mut dst = store.empty_array(ElementType::I64, &[3]).unwrap();
        store.share_host(&src, &mut dst).unwrap();
        store.write_host(&dst, &[7i64, 8, 9]).unwrap();

        let sum: i64 = store
            .share_host_to_slice(&src, |values: &[i64]| values.iter().sum())
            .unwrap();
        assert_eq!(sum, 24);
        assert_eq!(src.host_reference_count(), 2);
        drop(dst);
        assert_eq!(src.host_reference_count(), 1);
    }

    #[test]
    fn test_share_rejects_incompatible_arrays() {
        let (_, store) = store();
        let src = store
            .create_array(&[2], &[1f32, 2.0], Placement::Host)
            .unwrap();
        let mut dst = store.empty_array(ElementType::F32, &[3]).unwrap();
        assert!(matches!(
            store.share_host(&src, &mut dst),
            Err(ComputeError::LengthMismatch { .. })
        ));
        assert!(!dst.is_host_allocated());
    }

    #[test]
    fn test_foreign_pointer_is_not_freed() {
        let (driver, store) = store();
        let external = driver.mem_alloc(16).unwrap();
        let mut array = store.empty_array(ElementType::U32, &[4]).unwrap();
        store.share_device_from_ptr(external, &mut array).unwrap();
        assert_eq!(store.share_device_to_ptr(&array).unwrap(), external);
        assert_eq!(
            array.device_buffer().unwrap().ownership(),
            Ownership::Foreign
        );
        drop(array);
        assert_eq!(driver.stats().frees, 0);
        driver.mem_free(external).unwrap();
    }

    #[test]
    fn test_allocation_failure_leaves_array_unallocated() {
        let (driver, store) = store();
        driver.fail_next(SimCall::MemAlloc, DriverStatus::OUT_OF_MEMORY);
        let mut array = store.empty_array(ElementType::F32, &[16]).unwrap();
        let err = store.allocate_device(&mut array).unwrap_err();
        assert!(err.is_driver_error());
        assert!(!array.is_device_allocated());
    }
}
