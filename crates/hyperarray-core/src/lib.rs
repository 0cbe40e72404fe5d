//! # HyperArray Core
//!
//! Array, stream and kernel management over a single accelerator context.
//!
//! ## Components
//!
//! - [`Driver`] - The device, context, memory, module, stream and event
//!   primitives everything else calls through
//! - [`ArrayStore`] - N-dimensional arrays over reference-counted host and
//!   device buffers
//! - [`StreamPool`] - Streams grouped by [`StreamFamily`] with stable slots
//! - [`KernelCatalog`] - Logical kernel names resolved from manifest-driven
//!   module binaries
//! - [`Dispatcher`] - Argument marshaling and launch geometry
//! - [`ResourceManager`] - Owns the above for one device
//! - [`SimDriver`] - Host-memory driver for tests and hardware-free runs
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use hyperarray_core::prelude::*;
//!
//! let driver = Arc::new(SimDriver::new());
//! let config = ComputeConfig::builder().with_kernel_loading(false).build();
//! let manager = ResourceManager::new(driver, config).unwrap();
//!
//! let mut array = manager
//!     .arrays()
//!     .create_array(&[2, 3], &[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0], Placement::Host)
//!     .unwrap();
//! manager.arrays().allocate_device(&mut array).unwrap();
//! manager.arrays().sync_to_device(&array).unwrap();
//! assert_eq!(array.strides(), &[12, 4]);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod array;
pub mod catalog;
pub mod config;
pub mod dispatch;
pub mod driver;
pub mod dtype;
pub mod error;
pub mod manager;
pub mod sim;
pub mod stream;

pub use array::{Array, ArrayShape, ArrayStore, BufferSide, Placement};
pub use catalog::{CatalogReport, KernelCatalog, Manifest, ManifestEntry};
pub use config::{ComputeConfig, ComputeConfigBuilder};
pub use dispatch::{
    ArrayView, Dispatcher, LaunchArgs, LaunchBounds, LaunchGeometry, LaunchRecord, StreamTarget,
};
pub use driver::{Driver, DriverResult, DriverStatus};
pub use dtype::{Element, ElementType};
pub use error::{ComputeError, Result};
pub use manager::ResourceManager;
pub use sim::SimDriver;
pub use stream::{StreamEvent, StreamFamily, StreamPool, StreamSlot};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::array::{
        Array, ArrayShape, ArrayStore, BufferSide, Ownership, Placement, SharedDeviceBuffer,
        SharedHostBuffer, MAX_DIMS,
    };
    pub use crate::catalog::{CatalogReport, KernelCatalog, Manifest, ManifestEntry};
    pub use crate::config::{ComputeConfig, ComputeConfigBuilder, KERNEL_DIR_ENV};
    pub use crate::dispatch::{
        ArrayView, Dispatcher, LaunchArgs, LaunchBounds, LaunchGeometry, LaunchRecord,
        StreamTarget,
    };
    pub use crate::driver::{
        ContextHandle, DeviceHandle, DevicePtr, Dim3, Driver, DriverResult, DriverStatus,
        EventHandle, FunctionHandle, ModuleHandle, StreamHandle,
    };
    pub use crate::dtype::{Element, ElementType};
    pub use crate::error::{ComputeError, Result};
    pub use crate::manager::ResourceManager;
    pub use crate::sim::{SimCall, SimDriver, SimLaunch, SimStats};
    pub use crate::stream::{StreamEvent, StreamFamily, StreamPool, StreamPoolStats, StreamSlot};
}
