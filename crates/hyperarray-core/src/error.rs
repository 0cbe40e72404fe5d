//! Error types for hyperarray.

use thiserror::Error;

use crate::array::BufferSide;
use crate::dtype::ElementType;
use crate::stream::StreamFamily;

/// Result type alias using [`ComputeError`].
pub type Result<T> = std::result::Result<T, ComputeError>;

/// Errors reported by the array store, stream pool, kernel catalog and dispatcher.
///
/// Every variant except [`ComputeError::Initialization`] is recoverable: the
/// operation that produced it had no effect and shared accelerator state is
/// unchanged.
#[derive(Error, Debug)]
pub enum ComputeError {
    /// A driver call returned a non-success status.
    #[error("{call} failed: {message} (code {code})")]
    Driver {
        /// Name of the driver entry point.
        call: &'static str,
        /// Raw driver status code.
        code: i32,
        /// Driver-provided description of the status.
        message: String,
    },

    /// Array dimension count outside 1..=4.
    #[error("Unsupported number of dimensions: {ndim} (expected 1..=4)")]
    InvalidDimensions {
        /// Requested dimension count.
        ndim: usize,
    },

    /// A buffer the operation needs has not been allocated.
    #[error("{side} memory has not been allocated")]
    NotAllocated {
        /// Which side is missing.
        side: BufferSide,
    },

    /// A buffer is already allocated; allocating again would leak it.
    #[error("{side} memory has already been allocated")]
    AlreadyAllocated {
        /// Which side is already present.
        side: BufferSide,
    },

    /// Typed access with an element type other than the array's.
    #[error("Element type mismatch: array holds {expected}, got {actual}")]
    ElementTypeMismatch {
        /// Array element type.
        expected: ElementType,
        /// Element type used by the caller.
        actual: ElementType,
    },

    /// Caller buffer length differs from the array's element count.
    #[error("Length mismatch: array has {expected} elements, got {actual}")]
    LengthMismatch {
        /// Array element count.
        expected: usize,
        /// Caller-supplied element count.
        actual: usize,
    },

    /// Stream family id outside the closed enumeration.
    #[error("Invalid stream family id: {0}")]
    UnknownStreamFamily(i32),

    /// Stream slot index out of range or empty.
    #[error("Invalid stream slot {index} in {family} family: {reason}")]
    InvalidStreamSlot {
        /// Family the slot was looked up in.
        family: StreamFamily,
        /// Slot index.
        index: usize,
        /// Why the slot was rejected.
        reason: &'static str,
    },

    /// No kernel registered under the logical name.
    #[error("Kernel not found: {0}")]
    KernelNotFound(String),

    /// A launch with no operands or a zero-sized iteration space.
    #[error("Empty launch for kernel {0}")]
    EmptyLaunch(String),

    /// An extent or stride does not fit the 32-bit kernel argument layout.
    #[error("Extent {0} exceeds the kernel argument range")]
    ExtentOverflow(usize),

    /// Manifest file could not be read or parsed.
    #[error("Manifest error: {0}")]
    Manifest(String),

    /// Filesystem error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Backend not compiled in or not present on this system.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The driver could not be brought up at all.
    #[error("Initialization failed: {0}")]
    Initialization(String),
}

impl ComputeError {
    /// Returns true if the error came from the accelerator driver.
    pub fn is_driver_error(&self) -> bool {
        matches!(self, ComputeError::Driver { .. })
    }

    /// Returns true if the error is a caller precondition violation.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            ComputeError::InvalidDimensions { .. }
                | ComputeError::NotAllocated { .. }
                | ComputeError::AlreadyAllocated { .. }
                | ComputeError::ElementTypeMismatch { .. }
                | ComputeError::LengthMismatch { .. }
                | ComputeError::UnknownStreamFamily(_)
                | ComputeError::InvalidStreamSlot { .. }
                | ComputeError::EmptyLaunch(_)
                | ComputeError::ExtentOverflow(_)
        )
    }
}

impl From<toml::de::Error> for ComputeError {
    fn from(e: toml::de::Error) -> Self {
        ComputeError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = ComputeError::Driver {
            call: "cuMemAlloc",
            code: 2,
            message: "out of memory".to_string(),
        };
        assert!(err.is_driver_error());
        assert!(!err.is_precondition());
        assert_eq!(err.to_string(), "cuMemAlloc failed: out of memory (code 2)");

        let err = ComputeError::NotAllocated {
            side: BufferSide::Device,
        };
        assert!(err.is_precondition());
        assert_eq!(err.to_string(), "device memory has not been allocated");
    }
}
