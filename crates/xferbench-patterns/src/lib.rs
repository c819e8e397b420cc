//! Multi-device data-movement benchmark patterns.
//!
//! Three patterns built on the [`xferbench_core`] runtime abstraction:
//!
//! - [`pipeline`]: one element-wise addition split across a collection of
//!   device contexts with overlapped copies and kernels
//! - [`peer`]: repeated device-to-device copies over the direct peer path
//!   or staged through host memory, reported as bandwidth
//! - [`pingpong`]: a two-rank round trip over an in-process transport,
//!   host-to-host, host-staged, or carrying the device buffer directly
//!
//! Every pattern returns a structured report; failures propagate as
//! [`RuntimeError`](xferbench_core::RuntimeError) with the failing
//! operation's context attached.

pub mod peer;
pub mod pingpong;
pub mod pipeline;

pub use peer::{run_peer_copy, PeerCopyConfig, PeerCopyReport, PeerPath};
pub use pingpong::{
    run_ping_pong, PingPongConfig, PingPongReport, RankLink, TransportPath, TAG_PING, TAG_PONG,
};
pub use pipeline::{run_pipeline, DeviceContext, HostBuffers, PipelineConfig, PipelineReport};
