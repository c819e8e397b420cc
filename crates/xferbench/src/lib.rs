//! Multi-accelerator data-movement benchmarks.
//!
//! This crate re-exports the runtime abstraction from [`xferbench_core`]
//! and the benchmark patterns from [`xferbench_patterns`]. The three demo
//! programs under `examples/` mirror the classic micro-benchmark trio:
//!
//! - `multigpu`: one vector addition split across two devices with
//!   overlapped copies and kernels
//! - `p2pcopy`: device-to-device copy bandwidth with and without the peer
//!   fast path
//! - `pingpong`: a two-rank round trip, host-to-host, staged, and with the
//!   transport carrying the device buffer directly
//!
//! # Example
//!
//! ```
//! use xferbench::prelude::*;
//!
//! let runtime = HostRuntime::new(2);
//! let config = PipelineConfig::new(100);
//! let mut host = HostBuffers::filled(100, 1.0_f64, 2.0);
//! let report = run_pipeline(&runtime, &config, &mut host)?;
//! assert!(host.c.iter().all(|&v| v == 3.0));
//! assert!(report.elapsed.as_secs_f64().is_finite());
//! # Ok::<(), xferbench::RuntimeError>(())
//! ```

pub use xferbench_core::error::{Result, RuntimeError};
pub use xferbench_core::runtime::{AcceleratorRuntime, HostRuntime, PeerLink};
pub use xferbench_core::split::WorkSplit;
pub use xferbench_core::types::{DeviceId, Element, LaunchShape};

#[cfg(feature = "cuda")]
pub use xferbench_core::runtime::CudaRuntime;

pub use xferbench_patterns::peer::{run_peer_copy, PeerCopyConfig, PeerCopyReport, PeerPath};
pub use xferbench_patterns::pingpong::{
    run_ping_pong, PingPongConfig, PingPongReport, TransportPath,
};
pub use xferbench_patterns::pipeline::{
    run_pipeline, DeviceContext, HostBuffers, PipelineConfig, PipelineReport,
};

/// Prelude module for convenient imports.
///
/// # Example
/// ```
/// use xferbench::prelude::*;
/// ```
pub mod prelude {
    pub use xferbench_core::prelude::*;
    pub use xferbench_patterns::peer::{run_peer_copy, PeerCopyConfig, PeerCopyReport, PeerPath};
    pub use xferbench_patterns::pingpong::{
        run_ping_pong, PingPongConfig, PingPongReport, RankLink, TransportPath,
    };
    pub use xferbench_patterns::pipeline::{
        run_pipeline, DeviceContext, HostBuffers, PipelineConfig, PipelineReport,
    };
}
