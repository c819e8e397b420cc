//! Accelerator-runtime abstraction for multi-device transfer benchmarks.
//!
//! This crate provides the foundational types for benchmarking data
//! movement across accelerators: a result-returning runtime abstraction
//! over devices, queues, buffers, and peer access, plus the work
//! decomposition and launch-shape primitives the benchmark patterns build
//! on.
//!
//! # Key Concepts
//!
//! - **Devices**: accelerators addressed by integer ordinal
//! - **Queues**: per-device command queues; in order internally, concurrent
//!   with respect to each other
//! - **Peer access**: one device addressing another's memory directly,
//!   held as a scoped capability
//! - **Markers**: points on a queue's timeline bracketing a measurement
//!
//! # Modules
//!
//! - [`error`]: error types for runtime operations
//! - [`runtime`]: the [`AcceleratorRuntime`] trait and its implementations
//! - [`split`]: contiguous work decomposition
//! - [`types`]: device ids, element scalars, launch shapes
//!
//! [`AcceleratorRuntime`]: runtime::AcceleratorRuntime

pub mod error;
pub mod runtime;
pub mod split;
pub mod types;

// Re-export commonly used items at the crate root
pub use error::{Result, RuntimeError};

/// Prelude module for convenient imports.
///
/// # Example
/// ```
/// use xferbench_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Result, RuntimeError};
    pub use crate::runtime::{AcceleratorRuntime, HostBuffer, HostQueue, HostRuntime, PeerLink};
    pub use crate::split::WorkSplit;
    pub use crate::types::{DeviceId, Element, LaunchShape, DEFAULT_THREADS_PER_GROUP};

    #[cfg(feature = "cuda")]
    pub use crate::runtime::{CudaBuffer, CudaRuntime};
}
