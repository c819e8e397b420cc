//! Device-to-device copy benchmark.
//!
//! Copies one buffer between two devices repeatedly, either over the
//! direct peer path (under a scoped [`PeerLink`]) or staged through host
//! memory, and reports the achieved bandwidth. One untimed warm-up copy
//! absorbs first-use costs before the measurement starts.

use std::time::Duration;
use tracing::debug;
use xferbench_core::error::{Result, RuntimeError};
use xferbench_core::runtime::{AcceleratorRuntime, PeerLink};
use xferbench_core::types::{DeviceId, Element};

/// Default number of timed repetitions.
pub const DEFAULT_REPETITIONS: usize = 10;

/// Which route the copies take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PeerPath {
    /// Direct device-to-device copy under an established peer link.
    Direct,
    /// Copy staged through host memory.
    Staged,
}

/// Configuration of one peer-copy benchmark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeerCopyConfig {
    len: usize,
    repetitions: usize,
}

impl PeerCopyConfig {
    /// Benchmark copies of `len` elements.
    pub fn new(len: usize) -> Self {
        Self {
            len,
            repetitions: DEFAULT_REPETITIONS,
        }
    }

    /// Number of timed repetitions.
    pub fn with_repetitions(mut self, repetitions: usize) -> Self {
        self.repetitions = repetitions;
        self
    }

    /// Element count per copy.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the copy is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Timed repetition count.
    pub fn repetitions(&self) -> usize {
        self.repetitions
    }

    fn validate(&self) -> Result<()> {
        if self.len == 0 {
            return Err(RuntimeError::invalid_config("len", "must be at least 1"));
        }
        if self.repetitions == 0 {
            return Err(RuntimeError::invalid_config(
                "repetitions",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Result of one peer-copy benchmark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCopyReport {
    /// Bytes moved per repetition.
    pub bytes: usize,
    /// Timed repetition count.
    pub repetitions: usize,
    /// Time for all timed repetitions.
    pub elapsed: Duration,
    /// Route the copies took.
    pub path: PeerPath,
}

impl PeerCopyReport {
    /// Achieved bandwidth in GB/s.
    pub fn bandwidth_gbps(&self) -> f64 {
        let total = (self.bytes * self.repetitions) as f64;
        total / 1e9 / self.elapsed.as_secs_f64()
    }
}

/// Copy a buffer from `from` to `to` once untimed, then `repetitions`
/// times under the clock.
///
/// The `Direct` path requires mutual peer accessibility; access is held as
/// a [`PeerLink`] and released on every exit path. The `Staged` path works
/// on any pair of distinct devices.
pub fn run_peer_copy<T, R>(
    runtime: &R,
    config: &PeerCopyConfig,
    from: DeviceId,
    to: DeviceId,
    path: PeerPath,
) -> Result<PeerCopyReport>
where
    T: Element,
    R: AcceleratorRuntime<T>,
{
    config.validate()?;
    if from == to {
        return Err(RuntimeError::invalid_config("devices", "must differ"));
    }
    let needed = from.ordinal().max(to.ordinal()) + 1;
    let available = runtime.device_count();
    if available < needed {
        return Err(RuntimeError::not_enough_devices(needed, available));
    }

    let src_queue = runtime.create_queue(from)?;
    let dst_queue = runtime.create_queue(to)?;
    let src = runtime.alloc(&src_queue, config.len())?;
    let mut dst = runtime.alloc(&dst_queue, config.len())?;

    let link = match path {
        PeerPath::Direct => {
            if !runtime.can_access_peer(from, to)? || !runtime.can_access_peer(to, from)? {
                return Err(RuntimeError::peer_access(
                    from,
                    to,
                    "no direct route between these devices",
                ));
            }
            Some(PeerLink::establish(runtime, from, to)?)
        }
        PeerPath::Staged => None,
    };

    let copy_once = |dst: &mut R::Buffer| match path {
        PeerPath::Direct => runtime.copy_peer(&src_queue, &src, &dst_queue, dst),
        PeerPath::Staged => runtime.copy_peer_staged(&src_queue, &src, &dst_queue, dst),
    };

    // First copy untimed to remove first-touch costs from the measurement.
    copy_once(&mut dst)?;
    runtime.synchronize(&dst_queue)?;

    let start = runtime.record_marker(&dst_queue)?;
    for _ in 0..config.repetitions() {
        copy_once(&mut dst)?;
    }
    runtime.synchronize(&dst_queue)?;
    let stop = runtime.record_marker(&dst_queue)?;
    let elapsed = runtime.elapsed(&start, &stop)?;

    drop(link);

    let report = PeerCopyReport {
        bytes: config.len() * std::mem::size_of::<T>(),
        repetitions: config.repetitions(),
        elapsed,
        path,
    };
    debug!(
        ?path,
        bytes = report.bytes,
        bandwidth_gbps = report.bandwidth_gbps(),
        "peer copy complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use xferbench_core::runtime::HostRuntime;

    #[test]
    fn test_staged_copy_reports_bandwidth() {
        let runtime = HostRuntime::new(2);
        let config = PeerCopyConfig::new(1 << 20);

        let report =
            run_peer_copy::<f64, _>(&runtime, &config, DeviceId(0), DeviceId(1), PeerPath::Staged)
                .unwrap();

        assert_eq!(report.bytes, (1 << 20) * 8);
        assert_eq!(report.repetitions, DEFAULT_REPETITIONS);
        assert_eq!(report.path, PeerPath::Staged);
        let bandwidth = report.bandwidth_gbps();
        assert!(bandwidth > 0.0);
        assert!(bandwidth.is_finite());
        let expected = (report.bytes * report.repetitions) as f64
            / 1e9
            / report.elapsed.as_secs_f64();
        assert_relative_eq!(bandwidth, expected);
    }

    #[test]
    fn test_direct_copy_releases_link() {
        let runtime = HostRuntime::new(2);
        let config = PeerCopyConfig::new(256).with_repetitions(3);

        run_peer_copy::<f64, _>(&runtime, &config, DeviceId(0), DeviceId(1), PeerPath::Direct)
            .unwrap();

        // The link is gone: establishing it again succeeds.
        let relink =
            PeerLink::<f64, _>::establish(&runtime, DeviceId(0), DeviceId(1));
        assert!(relink.is_ok());
    }

    #[test]
    fn test_direct_copy_without_route() {
        let runtime = HostRuntime::new(2).without_peer_access();
        let config = PeerCopyConfig::new(256);

        let result =
            run_peer_copy::<f64, _>(&runtime, &config, DeviceId(0), DeviceId(1), PeerPath::Direct);
        assert!(matches!(result, Err(RuntimeError::PeerAccess { .. })));

        // Staging does not need a route.
        let staged =
            run_peer_copy::<f64, _>(&runtime, &config, DeviceId(0), DeviceId(1), PeerPath::Staged);
        assert!(staged.is_ok());
    }

    #[test]
    fn test_invalid_configs() {
        let runtime = HostRuntime::new(2);

        let empty = PeerCopyConfig::new(0);
        assert!(matches!(
            run_peer_copy::<f64, _>(&runtime, &empty, DeviceId(0), DeviceId(1), PeerPath::Staged),
            Err(RuntimeError::InvalidConfig { .. })
        ));

        let no_reps = PeerCopyConfig::new(16).with_repetitions(0);
        assert!(matches!(
            run_peer_copy::<f64, _>(&runtime, &no_reps, DeviceId(0), DeviceId(1), PeerPath::Staged),
            Err(RuntimeError::InvalidConfig { .. })
        ));

        let same_device = PeerCopyConfig::new(16);
        assert!(matches!(
            run_peer_copy::<f64, _>(
                &runtime,
                &same_device,
                DeviceId(1),
                DeviceId(1),
                PeerPath::Direct
            ),
            Err(RuntimeError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_missing_device() {
        let runtime = HostRuntime::new(1);
        let config = PeerCopyConfig::new(16);
        let result =
            run_peer_copy::<f64, _>(&runtime, &config, DeviceId(0), DeviceId(1), PeerPath::Staged);
        assert!(matches!(
            result,
            Err(RuntimeError::NotEnoughDevices {
                needed: 2,
                available: 1
            })
        ));
    }
}
