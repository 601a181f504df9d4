// src/error.rs
//
// Typed errors for device-set construction, array allocation and the
// convolution plan. Callers can pattern-match on failure modes rather
// than parsing strings. None of these are recovered inside the crate:
// the failure policy is fail-fast with a precise diagnostic, and any
// retry logic belongs to the calling orchestration layer.

use std::fmt;

/// Errors arising from setup, data movement or kernel loading.
#[derive(Debug)]
pub enum Error {
    /// Bad device list, non-divisible grid/device-count combination, or
    /// an illegal kernel symmetry/realness tag. Surfaced at setup,
    /// never retried.
    Config(String),

    /// Array size / component-count mismatch between cooperating
    /// buffers. Indicates a caller defect.
    ShapeMismatch {
        expected: (usize, [usize; 3]),
        got: (usize, [usize; 3]),
    },

    /// A numerical invariant of the kernel pipeline was violated
    /// (discarded FFT half not negligible, double-populated kernel
    /// slot). Signals a kernel-construction or algorithm bug.
    NumericalInvariant(String),

    /// An underlying device operation failed. Device and stream state
    /// are undefined afterwards; the plan is unusable.
    Device(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::ShapeMismatch { expected, got } => write!(
                f,
                "shape mismatch: expected {} x {:?}, got {} x {:?}",
                expected.0, expected.1, got.0, got.1
            ),
            Self::NumericalInvariant(msg) => {
                write!(f, "numerical invariant violated: {msg}")
            }
            Self::Device(msg) => write!(f, "device failure: {msg}"),
        }
    }
}

impl std::error::Error for Error {}
