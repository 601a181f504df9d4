// src/lib.rs
//
// fieldconv: multi-device FFT convolution engine for 3D vector fields.
//
// A source field (charge, dipole or curl density) is convolved with a
// precomputed translation-invariant kernel by zero-padded FFT,
// distributed across the devices of an explicit DeviceSet. The three
// load-bearing layers are the distributed array (y-slab split, one
// buffer per device), the staged FFT pipeline (device-local z
// transforms, cross-device redistribution, y/x transforms) and the
// convolution plan (symmetry-aware kernel storage plus the
// frequency-domain multiply-accumulate).

pub mod device;
pub mod dist_array;
pub mod error;
pub mod fft;
pub mod field;
pub mod grid;
pub mod kernels;
pub mod plan;
