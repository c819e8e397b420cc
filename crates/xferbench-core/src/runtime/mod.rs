//! Accelerator runtime abstraction.
//!
//! [`AcceleratorRuntime`] is the result-returning call boundary between the
//! benchmark patterns and whatever actually moves bytes: queues execute
//! enqueued operations in program order, different queues run concurrently,
//! and nothing in this layer terminates the process on failure.
//!
//! Two implementations exist: [`HostRuntime`], an always-available
//! reference implementation over host memory with simulated devices, and
//! (behind the `cuda` feature) `CudaRuntime` over real accelerators.

pub mod host;

#[cfg(feature = "cuda")]
pub mod cuda;

pub use host::{HostBuffer, HostQueue, HostRuntime};

#[cfg(feature = "cuda")]
pub use cuda::{CudaBuffer, CudaRuntime};

use crate::error::Result;
use crate::types::{DeviceId, Element, LaunchShape};
use std::marker::PhantomData;
use std::time::Duration;
use tracing::warn;

/// Trait for accelerator runtimes.
///
/// One method per operation the benchmark patterns need: device discovery,
/// queue creation, allocation, asynchronous copies, the two built-in
/// kernels, synchronization, peer access, and marker-based timing.
///
/// # Ordering contract
///
/// `enqueue_*` methods may return before the operation completes; the
/// operation is guaranteed complete only after [`synchronize`] returns for
/// the queue it was tagged to. Operations on one queue execute in the order
/// they were enqueued. Operations on different queues may overlap.
///
/// [`synchronize`]: AcceleratorRuntime::synchronize
pub trait AcceleratorRuntime<T: Element> {
    /// Device-resident buffer handle.
    type Buffer: Send;
    /// Asynchronous execution queue bound to one device.
    type Queue;
    /// Point on a queue's timeline, recorded for timing.
    type Marker;

    /// Runtime name for identification.
    fn name(&self) -> &str;

    /// Number of devices this runtime exposes.
    fn device_count(&self) -> usize;

    /// Create an execution queue on `device`.
    fn create_queue(&self, device: DeviceId) -> Result<Self::Queue>;

    /// Allocate a zero-initialized buffer of `len` elements on the queue's
    /// device.
    fn alloc(&self, queue: &Self::Queue, len: usize) -> Result<Self::Buffer>;

    /// Element count of a buffer.
    fn buffer_len(&self, buffer: &Self::Buffer) -> usize;

    /// Device a buffer lives on.
    fn buffer_device(&self, buffer: &Self::Buffer) -> DeviceId;

    /// Enqueue a host-to-device copy of all of `src` into the front of
    /// `dst`.
    fn enqueue_write(&self, queue: &Self::Queue, src: &[T], dst: &mut Self::Buffer) -> Result<()>;

    /// Enqueue a device-to-host copy of the front of `src` into all of
    /// `dst`.
    ///
    /// The copy may still be in flight when this returns; synchronize the
    /// queue before reading `dst`.
    fn enqueue_read(&self, queue: &Self::Queue, src: &Self::Buffer, dst: &mut [T]) -> Result<()>;

    /// Enqueue the element-wise addition kernel `out[i] = a[i] + b[i]` over
    /// the first `len` elements.
    ///
    /// The launch covers `shape.groups_for(len)` groups; the kernel
    /// bounds-checks against `len`.
    fn enqueue_add(
        &self,
        queue: &Self::Queue,
        a: &Self::Buffer,
        b: &Self::Buffer,
        out: &mut Self::Buffer,
        len: usize,
        shape: LaunchShape,
    ) -> Result<()>;

    /// Enqueue the increment kernel `buffer[i] += 1` over the first `len`
    /// elements.
    fn enqueue_increment(
        &self,
        queue: &Self::Queue,
        buffer: &mut Self::Buffer,
        len: usize,
        shape: LaunchShape,
    ) -> Result<()>;

    /// Block until every operation enqueued on `queue` has completed.
    fn synchronize(&self, queue: &Self::Queue) -> Result<()>;

    /// Record a timing marker on the queue's timeline.
    fn record_marker(&self, queue: &Self::Queue) -> Result<Self::Marker>;

    /// Wall time between two markers recorded on the same timeline.
    ///
    /// Waits for the `stop` marker to be reached if it has not been yet.
    fn elapsed(&self, start: &Self::Marker, stop: &Self::Marker) -> Result<Duration>;

    /// Whether `to` can address `from`'s memory directly.
    ///
    /// `false` when the devices are the same, matching driver semantics.
    fn can_access_peer(&self, from: DeviceId, to: DeviceId) -> Result<bool>;

    /// Grant `to` direct access to `from`'s memory.
    ///
    /// Errors if access is already enabled for this ordered pair. Prefer
    /// [`PeerLink::establish`], which guarantees release on every exit
    /// path.
    fn enable_peer_access(&self, from: DeviceId, to: DeviceId) -> Result<()>;

    /// Revoke access previously granted by [`enable_peer_access`].
    ///
    /// [`enable_peer_access`]: AcceleratorRuntime::enable_peer_access
    fn disable_peer_access(&self, from: DeviceId, to: DeviceId) -> Result<()>;

    /// Enqueue a direct device-to-device copy of the front of `src` into
    /// `dst`, bypassing host staging.
    ///
    /// Requires peer access between the two devices when they differ.
    fn copy_peer(
        &self,
        src_queue: &Self::Queue,
        src: &Self::Buffer,
        dst_queue: &Self::Queue,
        dst: &mut Self::Buffer,
    ) -> Result<()>;

    /// Device-to-device copy staged through host memory.
    ///
    /// Works regardless of peer accessibility.
    fn copy_peer_staged(
        &self,
        src_queue: &Self::Queue,
        src: &Self::Buffer,
        dst_queue: &Self::Queue,
        dst: &mut Self::Buffer,
    ) -> Result<()>;
}

/// Scoped peer-access capability between two devices.
///
/// [`establish`] enables access in both directions; dropping the link
/// disables both, so release happens on every exit path, including early
/// returns from a failing benchmark. A failure to disable during drop is
/// logged rather than propagated.
///
/// [`establish`]: PeerLink::establish
pub struct PeerLink<'r, T, R>
where
    T: Element,
    R: AcceleratorRuntime<T> + ?Sized,
{
    runtime: &'r R,
    first: DeviceId,
    second: DeviceId,
    _element: PhantomData<T>,
}

impl<'r, T, R> PeerLink<'r, T, R>
where
    T: Element,
    R: AcceleratorRuntime<T> + ?Sized,
{
    /// Enable peer access between `first` and `second` in both directions.
    ///
    /// If the second direction cannot be enabled, the first is rolled back
    /// before the error is returned.
    pub fn establish(runtime: &'r R, first: DeviceId, second: DeviceId) -> Result<Self> {
        runtime.enable_peer_access(first, second)?;
        if let Err(err) = runtime.enable_peer_access(second, first) {
            if let Err(rollback) = runtime.disable_peer_access(first, second) {
                warn!(%first, %second, error = %rollback, "failed to roll back peer access");
            }
            return Err(err);
        }
        Ok(Self {
            runtime,
            first,
            second,
            _element: PhantomData,
        })
    }

    /// First endpoint of the link.
    pub fn first(&self) -> DeviceId {
        self.first
    }

    /// Second endpoint of the link.
    pub fn second(&self) -> DeviceId {
        self.second
    }
}

impl<T, R> Drop for PeerLink<'_, T, R>
where
    T: Element,
    R: AcceleratorRuntime<T> + ?Sized,
{
    fn drop(&mut self) {
        for (from, to) in [(self.first, self.second), (self.second, self.first)] {
            if let Err(err) = self.runtime.disable_peer_access(from, to) {
                warn!(%from, %to, error = %err, "failed to release peer access");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RuntimeError;

    #[test]
    fn test_peer_link_releases_on_drop() {
        let runtime = HostRuntime::new(2);
        {
            let link =
                PeerLink::<f64, _>::establish(&runtime, DeviceId(0), DeviceId(1)).unwrap();
            assert_eq!(link.first(), DeviceId(0));
            assert_eq!(link.second(), DeviceId(1));

            // Both directions are live while the link exists.
            let again: Result<()> =
                AcceleratorRuntime::<f64>::enable_peer_access(&runtime, DeviceId(0), DeviceId(1));
            assert!(matches!(again, Err(RuntimeError::PeerAccess { .. })));
        }

        // After drop the pair can be established again.
        let relink = PeerLink::<f64, _>::establish(&runtime, DeviceId(0), DeviceId(1));
        assert!(relink.is_ok());
    }

    #[test]
    fn test_peer_link_rejects_self_link() {
        let runtime = HostRuntime::new(2);
        let link = PeerLink::<f64, _>::establish(&runtime, DeviceId(0), DeviceId(0));
        assert!(matches!(link, Err(RuntimeError::PeerAccess { .. })));
    }
}
