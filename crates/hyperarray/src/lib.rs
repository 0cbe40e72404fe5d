//! # HyperArray
//!
//! N-dimensional arrays over shared host and device buffers, streams grouped
//! into families, and kernels resolved by logical name from on-disk
//! manifests.
//!
//! ## Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use hyperarray::prelude::*;
//!
//! let driver = Arc::new(SimDriver::new());
//! let config = ComputeConfig::builder().with_kernel_loading(false).build();
//! let mut manager = ResourceManager::new(driver, config).unwrap();
//!
//! let a = manager
//!     .arrays()
//!     .create_array(&[2, 3], &[1.0f32; 6], Placement::Device)
//!     .unwrap();
//! let slot = manager.create_stream(StreamFamily::Compute).unwrap();
//! assert_eq!(a.device_reference_count(), 1);
//! assert_eq!(slot.index, 0);
//! ```
//!
//! ## Backends
//!
//! - **Simulated** - host-memory driver, always available
//! - **CUDA** - NVIDIA GPUs (requires the `cuda` feature)
//!
//! ```toml
//! [dependencies]
//! hyperarray = { version = "0.1", features = ["cuda"] }
//! ```
//!
//! ## Process-wide access
//!
//! A [`ResourceManager`] is an ordinary value. Applications that want a single
//! instance reachable from anywhere can park one in [`global`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod global;

pub use hyperarray_core::*;
pub use hyperarray_cuda::{cuda_device_count, is_cuda_available, CudaDriver};

/// Prelude for convenient imports.
pub mod prelude {
    pub use hyperarray_core::prelude::*;
    pub use hyperarray_cuda::{is_cuda_available, CudaDriver};

    pub use crate::global;
}
