//! Kernel dispatch.
//!
//! Marshals a launch into the kernel calling convention: one [`LaunchBounds`]
//! followed by one [`ArrayView`] per operand, each passed by pointer. The grid
//! and block sizes come from [`LaunchGeometry::for_extents`] over the largest
//! extent per axis across all operands.

use std::ffi::c_void;
use std::fmt;

use bytemuck::{Pod, Zeroable};
use tracing::{debug, error, warn};

use crate::array::{Array, BufferSide, MAX_DIMS};
use crate::catalog::KernelCatalog;
use crate::driver::{check, Dim3, Driver, StreamHandle};
use crate::error::{ComputeError, Result};
use crate::stream::{StreamPool, StreamSlot};

/// Iteration space shared by every operand of a launch.
///
/// Layout matches `struct { int shape[4]; int ndim; size_t size; }`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct LaunchBounds {
    /// Per-axis extent; unused axes are 0.
    pub shape: [i32; MAX_DIMS],
    /// Number of dimensions.
    pub ndim: i32,
    _pad: i32,
    /// Total element count.
    pub size: u64,
}

impl LaunchBounds {
    /// Bounds covering `array`'s shape.
    pub fn for_array(array: &Array) -> Result<Self> {
        let mut bounds = LaunchBounds {
            ndim: narrow(array.ndim())?,
            size: array.len() as u64,
            ..Self::default()
        };
        for (slot, &extent) in bounds.shape.iter_mut().zip(array.dims()) {
            *slot = narrow(extent)?;
        }
        Ok(bounds)
    }
}

/// Per-operand array descriptor.
///
/// Layout matches `struct { T* data; T* grad; int shape[4]; int strides[4]; int ndim; }`;
/// strides are in bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ArrayView {
    /// Device address of the data.
    pub data: u64,
    /// Device address of the gradient; always null here.
    pub grad: u64,
    /// Per-axis extent.
    pub shape: [i32; MAX_DIMS],
    /// Per-axis stride in bytes.
    pub strides: [i32; MAX_DIMS],
    /// Number of dimensions.
    pub ndim: i32,
    _pad: i32,
}

impl ArrayView {
    /// View of `array`'s device buffer.
    pub fn for_array(array: &Array) -> Result<Self> {
        let data = array.device_ptr().ok_or(ComputeError::NotAllocated {
            side: BufferSide::Device,
        })?;
        let mut view = ArrayView {
            data: data.0,
            ndim: narrow(array.ndim())?,
            ..Self::default()
        };
        for (axis, (&extent, &stride)) in array.dims().iter().zip(array.strides()).enumerate() {
            view.shape[axis] = narrow(extent)?;
            view.strides[axis] = narrow(stride)?;
        }
        Ok(view)
    }
}

fn narrow(value: usize) -> Result<i32> {
    i32::try_from(value).map_err(|_| ComputeError::ExtentOverflow(value))
}

/// Grid and block dimensions of one launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchGeometry {
    /// Blocks per grid.
    pub grid: Dim3,
    /// Threads per block.
    pub block: Dim3,
}

impl LaunchGeometry {
    /// Threads per block along each axis for 1-D work.
    pub const BLOCK_1D: u32 = 256;
    /// Threads per block along each axis for 2-D work.
    pub const BLOCK_2D: u32 = 16;
    /// Threads per block along each axis for 3-D and 4-D work.
    pub const BLOCK_3D: u32 = 8;

    /// Geometry for `ndim`-dimensional work with the given extents on the
    /// first three axes. Axes beyond `ndim` should be 1.
    ///
    /// Returns `None` when a used extent is zero or `ndim` is zero.
    #[must_use]
    pub fn for_extents(ndim: usize, extents: [u32; 3]) -> Option<Self> {
        let (axes, tile) = match ndim {
            0 => return None,
            1 => (1, Self::BLOCK_1D),
            2 => (2, Self::BLOCK_2D),
            _ => (3, Self::BLOCK_3D),
        };
        if extents[..axes].contains(&0) {
            return None;
        }

        let mut block = [1u32; 3];
        let mut grid = [1u32; 3];
        for axis in 0..axes {
            block[axis] = extents[axis].min(tile);
            grid[axis] = extents[axis].div_ceil(block[axis]);
        }
        Some(Self {
            grid: (grid[0], grid[1], grid[2]),
            block: (block[0], block[1], block[2]),
        })
    }

    /// Geometry covering every operand: the largest dimension count and the
    /// largest extent per axis win.
    #[must_use]
    pub fn for_arrays(arrays: &[&Array]) -> Option<Self> {
        let mut ndim = 0;
        let mut extents = [1u32; 3];
        for array in arrays {
            if array.is_empty() {
                return None;
            }
            ndim = ndim.max(array.ndim());
            for (axis, &extent) in array.dims().iter().take(3).enumerate() {
                let extent = u32::try_from(extent).unwrap_or(u32::MAX);
                extents[axis] = extents[axis].max(extent);
            }
        }
        Self::for_extents(ndim, extents)
    }

    /// Total threads launched.
    #[must_use]
    pub fn thread_count(&self) -> u64 {
        let (gx, gy, gz) = self.grid;
        let (bx, by, bz) = self.block;
        [gx, gy, gz, bx, by, bz].iter().map(|&d| u64::from(d)).product()
    }
}

impl fmt::Display for LaunchGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "grid ({}, {}, {}) block ({}, {}, {})",
            self.grid.0, self.grid.1, self.grid.2, self.block.0, self.block.1, self.block.2
        )
    }
}

/// Marshaled kernel arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchArgs {
    bounds: LaunchBounds,
    views: Vec<ArrayView>,
}

impl LaunchArgs {
    /// Marshal `arrays`; the bounds come from the first operand and every
    /// operand needs a device buffer.
    ///
    /// Each view carries its own operand's shape and strides, so operands of
    /// different shapes index correctly. Kernels built for an ABI where every
    /// view repeats the first operand's shape must read it from the bounds
    /// instead.
    pub fn new(arrays: &[&Array]) -> Result<Self> {
        let first = arrays.first().ok_or_else(|| {
            ComputeError::EmptyLaunch("no operands".to_string())
        })?;
        let bounds = LaunchBounds::for_array(first)?;
        let views = arrays
            .iter()
            .map(|array| ArrayView::for_array(array))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { bounds, views })
    }

    /// Bounds descriptor.
    pub fn bounds(&self) -> &LaunchBounds {
        &self.bounds
    }

    /// Operand views in order.
    pub fn views(&self) -> &[ArrayView] {
        &self.views
    }

    /// Pointers to each argument, bounds first.
    ///
    /// The pointers borrow `self` and are valid until it moves or drops.
    pub fn as_param_ptrs(&mut self) -> Vec<*mut c_void> {
        let mut ptrs = Vec::with_capacity(self.views.len() + 1);
        ptrs.push(&mut self.bounds as *mut LaunchBounds as *mut c_void);
        for view in &mut self.views {
            ptrs.push(view as *mut ArrayView as *mut c_void);
        }
        ptrs
    }
}

/// Stream a launch is issued on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamTarget {
    /// The default stream.
    #[default]
    Default,
    /// A pool slot; falls back to the default stream if empty.
    Slot(StreamSlot),
    /// Numeric family id and slot index; a negative family selects the
    /// default stream.
    Ids {
        /// Family id.
        family: i32,
        /// Slot index.
        index: i32,
    },
}

impl From<StreamSlot> for StreamTarget {
    fn from(slot: StreamSlot) -> Self {
        StreamTarget::Slot(slot)
    }
}

/// Summary of an issued launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRecord {
    /// Logical kernel name.
    pub kernel: String,
    /// Grid and block dimensions.
    pub geometry: LaunchGeometry,
    /// Stream the launch was issued on.
    pub stream: StreamHandle,
    /// Number of array operands.
    pub operands: usize,
}

/// Issues kernel launches using a catalog and a stream pool.
pub struct Dispatcher<'a> {
    driver: &'a dyn Driver,
    catalog: &'a KernelCatalog,
    streams: &'a StreamPool,
}

impl<'a> Dispatcher<'a> {
    /// Creates a dispatcher over borrowed components.
    pub fn new(
        driver: &'a dyn Driver,
        catalog: &'a KernelCatalog,
        streams: &'a StreamPool,
    ) -> Self {
        Self {
            driver,
            catalog,
            streams,
        }
    }

    /// Resolves a stream target.
    pub fn resolve_stream(&self, target: StreamTarget) -> StreamHandle {
        match target {
            StreamTarget::Default => StreamHandle::NULL,
            StreamTarget::Slot(slot) => self.streams.stream(slot),
            StreamTarget::Ids { family, index } => self.streams.resolve(family, index),
        }
    }

    /// Launches `kernel` over `arrays`.
    ///
    /// The launch is asynchronous; synchronize the stream or context to
    /// observe completion. A failed precondition or driver call leaves no
    /// work queued.
    pub fn launch(
        &self,
        kernel: &str,
        arrays: &[&Array],
        target: StreamTarget,
    ) -> Result<LaunchRecord> {
        if arrays.is_empty() {
            warn!(kernel, "Launch with no operands skipped");
            return Err(ComputeError::EmptyLaunch(kernel.to_string()));
        }
        let function = match self.catalog.require(kernel) {
            Ok(function) => function,
            Err(e) => {
                warn!(kernel, "Kernel not registered");
                return Err(e);
            }
        };
        let mut args = match LaunchArgs::new(arrays) {
            Ok(args) => args,
            Err(e) => {
                warn!(kernel, error = %e, "Launch arguments rejected");
                return Err(e);
            }
        };
        let Some(geometry) = LaunchGeometry::for_arrays(arrays) else {
            warn!(kernel, "Launch over an empty iteration space skipped");
            return Err(ComputeError::EmptyLaunch(kernel.to_string()));
        };
        let stream = self.resolve_stream(target);

        let mut params = args.as_param_ptrs();
        // SAFETY: every pointer in `params` refers to a field of `args`, which
        // outlives the call, and each view's data address is a live device
        // allocation held by the borrowed operands.
        let status = unsafe {
            self.driver.launch_kernel(
                function,
                geometry.grid,
                geometry.block,
                0,
                stream,
                &mut params,
            )
        };
        drop(params);
        drop(args);

        if let Err(e) = check(self.driver, "cuLaunchKernel", status) {
            error!(kernel, error = %e, "Kernel launch failed");
            return Err(e);
        }
        debug!(kernel, %geometry, stream = stream.0, operands = arrays.len(), "Launched kernel");
        Ok(LaunchRecord {
            kernel: kernel.to_string(),
            geometry,
            stream,
            operands: arrays.len(),
        })
    }
}
