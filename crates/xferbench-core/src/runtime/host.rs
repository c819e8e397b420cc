//! Host-memory reference runtime with simulated devices.
//!
//! Each simulated device is an allocation ledger; queues execute their
//! operations eagerly and in order, which trivially satisfies the queue
//! ordering contract. Per-device capacities can be set to force allocation
//! failures in tests, and peer reachability can be switched off to exercise
//! the staged copy path.

use super::AcceleratorRuntime;
use crate::error::{Result, RuntimeError};
use crate::types::{DeviceId, Element, LaunchShape};
use parking_lot::Mutex;
use rayon::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Element count above which the kernels run on the rayon pool.
const PARALLEL_THRESHOLD: usize = 1 << 15;

/// Always-available runtime backed by host memory.
pub struct HostRuntime {
    devices: Vec<Arc<DeviceLedger>>,
    peer_table: Mutex<HashSet<(usize, usize)>>,
    peer_reachable: bool,
}

#[derive(Debug)]
struct DeviceLedger {
    /// Capacity in bytes; `None` means unbounded.
    capacity: Option<usize>,
    allocated: Mutex<usize>,
}

/// Buffer owned by one simulated device.
pub struct HostBuffer<T> {
    data: Vec<T>,
    bytes: usize,
    device: DeviceId,
    ledger: Arc<DeviceLedger>,
}

impl<T> Drop for HostBuffer<T> {
    fn drop(&mut self) {
        let mut allocated = self.ledger.allocated.lock();
        *allocated = allocated.saturating_sub(self.bytes);
    }
}

/// Execution queue of one simulated device.
#[derive(Debug, Clone, Copy)]
pub struct HostQueue {
    device: DeviceId,
}

impl HostQueue {
    /// Device this queue is bound to.
    pub fn device(&self) -> DeviceId {
        self.device
    }
}

impl HostRuntime {
    /// Create a runtime exposing `devices` simulated devices, each with
    /// unbounded memory and full peer reachability.
    pub fn new(devices: usize) -> Self {
        Self {
            devices: (0..devices)
                .map(|_| {
                    Arc::new(DeviceLedger {
                        capacity: None,
                        allocated: Mutex::new(0),
                    })
                })
                .collect(),
            peer_table: Mutex::new(HashSet::new()),
            peer_reachable: true,
        }
    }

    /// Cap one device's memory at `bytes`, making later allocations fail
    /// once the cap is reached.
    ///
    /// # Panics
    ///
    /// Panics if `device` does not exist.
    pub fn with_device_capacity(mut self, device: DeviceId, bytes: usize) -> Self {
        let ledger = self
            .devices
            .get_mut(device.ordinal())
            .unwrap_or_else(|| panic!("{device} does not exist"));
        *ledger = Arc::new(DeviceLedger {
            capacity: Some(bytes),
            allocated: Mutex::new(0),
        });
        self
    }

    /// Simulate a topology in which no device can reach another's memory.
    pub fn without_peer_access(mut self) -> Self {
        self.peer_reachable = false;
        self
    }

    /// Bytes currently allocated on `device`.
    pub fn allocated_bytes(&self, device: DeviceId) -> Result<usize> {
        Ok(*self.ledger(device)?.allocated.lock())
    }

    fn ledger(&self, device: DeviceId) -> Result<&Arc<DeviceLedger>> {
        self.devices.get(device.ordinal()).ok_or_else(|| {
            RuntimeError::not_enough_devices(device.ordinal() + 1, self.devices.len())
        })
    }

    fn check_queue_buffer<T>(
        queue: &HostQueue,
        buffer: &HostBuffer<T>,
        direction: &'static str,
    ) -> Result<()> {
        if queue.device != buffer.device {
            return Err(RuntimeError::transfer(
                direction,
                format!(
                    "queue on {} cannot touch a buffer on {}",
                    queue.device, buffer.device
                ),
            ));
        }
        Ok(())
    }
}

impl<T: Element> AcceleratorRuntime<T> for HostRuntime {
    type Buffer = HostBuffer<T>;
    type Queue = HostQueue;
    type Marker = Instant;

    fn name(&self) -> &str {
        "host"
    }

    fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn create_queue(&self, device: DeviceId) -> Result<Self::Queue> {
        self.ledger(device)?;
        trace!(%device, "created queue");
        Ok(HostQueue { device })
    }

    fn alloc(&self, queue: &Self::Queue, len: usize) -> Result<Self::Buffer> {
        let device = queue.device;
        let ledger = Arc::clone(self.ledger(device)?);
        let bytes = len * std::mem::size_of::<T>();

        {
            let mut allocated = ledger.allocated.lock();
            if let Some(capacity) = ledger.capacity {
                if *allocated + bytes > capacity {
                    return Err(RuntimeError::allocation(
                        device,
                        bytes,
                        format!(
                            "device memory exhausted ({} of {} bytes in use)",
                            *allocated, capacity
                        ),
                    ));
                }
            }
            *allocated += bytes;
        }

        debug!(%device, len, bytes, "allocated buffer");
        Ok(HostBuffer {
            data: vec![T::zero(); len],
            bytes,
            device,
            ledger,
        })
    }

    fn buffer_len(&self, buffer: &Self::Buffer) -> usize {
        buffer.data.len()
    }

    fn buffer_device(&self, buffer: &Self::Buffer) -> DeviceId {
        buffer.device
    }

    fn enqueue_write(&self, queue: &Self::Queue, src: &[T], dst: &mut Self::Buffer) -> Result<()> {
        Self::check_queue_buffer(queue, dst, "host-to-device")?;
        if src.len() > dst.data.len() {
            return Err(RuntimeError::transfer(
                "host-to-device",
                format!(
                    "source length {} exceeds destination length {}",
                    src.len(),
                    dst.data.len()
                ),
            ));
        }
        dst.data[..src.len()].copy_from_slice(src);
        trace!(device = %queue.device, len = src.len(), "host-to-device copy");
        Ok(())
    }

    fn enqueue_read(&self, queue: &Self::Queue, src: &Self::Buffer, dst: &mut [T]) -> Result<()> {
        Self::check_queue_buffer(queue, src, "device-to-host")?;
        if dst.len() > src.data.len() {
            return Err(RuntimeError::transfer(
                "device-to-host",
                format!(
                    "destination length {} exceeds source length {}",
                    dst.len(),
                    src.data.len()
                ),
            ));
        }
        dst.copy_from_slice(&src.data[..dst.len()]);
        trace!(device = %queue.device, len = dst.len(), "device-to-host copy");
        Ok(())
    }

    fn enqueue_add(
        &self,
        queue: &Self::Queue,
        a: &Self::Buffer,
        b: &Self::Buffer,
        out: &mut Self::Buffer,
        len: usize,
        shape: LaunchShape,
    ) -> Result<()> {
        let kernel = format!("vector_add_{}", T::KERNEL_SUFFIX);
        for buffer in [a, b] {
            if queue.device != buffer.device {
                return Err(RuntimeError::launch(
                    kernel.clone(),
                    format!("input buffer on {} but queue on {}", buffer.device, queue.device),
                ));
            }
        }
        if queue.device != out.device {
            return Err(RuntimeError::launch(
                kernel,
                format!("output buffer on {} but queue on {}", out.device, queue.device),
            ));
        }
        if len > a.data.len() || len > b.data.len() || len > out.data.len() {
            return Err(RuntimeError::launch(
                kernel,
                format!("slice length {len} exceeds a buffer's length"),
            ));
        }

        trace!(
            device = %queue.device,
            len,
            groups = shape.groups_for(len),
            threads = shape.threads_per_group(),
            "vector add"
        );
        if len >= PARALLEL_THRESHOLD {
            out.data[..len]
                .par_iter_mut()
                .zip(&a.data[..len])
                .zip(&b.data[..len])
                .for_each(|((out, &a), &b)| *out = a + b);
        } else {
            for i in 0..len {
                out.data[i] = a.data[i] + b.data[i];
            }
        }
        Ok(())
    }

    fn enqueue_increment(
        &self,
        queue: &Self::Queue,
        buffer: &mut Self::Buffer,
        len: usize,
        shape: LaunchShape,
    ) -> Result<()> {
        let kernel = format!("increment_{}", T::KERNEL_SUFFIX);
        if queue.device != buffer.device {
            return Err(RuntimeError::launch(
                kernel,
                format!("buffer on {} but queue on {}", buffer.device, queue.device),
            ));
        }
        if len > buffer.data.len() {
            return Err(RuntimeError::launch(
                kernel,
                format!("slice length {len} exceeds buffer length {}", buffer.data.len()),
            ));
        }

        trace!(
            device = %queue.device,
            len,
            groups = shape.groups_for(len),
            "increment"
        );
        if len >= PARALLEL_THRESHOLD {
            buffer.data[..len].par_iter_mut().for_each(|v| *v += T::one());
        } else {
            for v in &mut buffer.data[..len] {
                *v += T::one();
            }
        }
        Ok(())
    }

    fn synchronize(&self, queue: &Self::Queue) -> Result<()> {
        // Eager execution: everything enqueued has already run.
        trace!(device = %queue.device, "synchronized");
        Ok(())
    }

    fn record_marker(&self, queue: &Self::Queue) -> Result<Self::Marker> {
        self.ledger(queue.device)?;
        Ok(Instant::now())
    }

    fn elapsed(&self, start: &Self::Marker, stop: &Self::Marker) -> Result<Duration> {
        Ok(stop.saturating_duration_since(*start))
    }

    fn can_access_peer(&self, from: DeviceId, to: DeviceId) -> Result<bool> {
        self.ledger(from)?;
        self.ledger(to)?;
        Ok(from != to && self.peer_reachable)
    }

    fn enable_peer_access(&self, from: DeviceId, to: DeviceId) -> Result<()> {
        if !AcceleratorRuntime::<T>::can_access_peer(self, from, to)? {
            let reason = if from == to {
                "a device cannot be its own peer"
            } else {
                "peer access not supported by this topology"
            };
            return Err(RuntimeError::peer_access(from, to, reason));
        }
        let inserted = self
            .peer_table
            .lock()
            .insert((from.ordinal(), to.ordinal()));
        if !inserted {
            return Err(RuntimeError::peer_access(from, to, "already enabled"));
        }
        debug!(%from, %to, "peer access enabled");
        Ok(())
    }

    fn disable_peer_access(&self, from: DeviceId, to: DeviceId) -> Result<()> {
        self.ledger(from)?;
        self.ledger(to)?;
        let removed = self
            .peer_table
            .lock()
            .remove(&(from.ordinal(), to.ordinal()));
        if !removed {
            return Err(RuntimeError::peer_access(from, to, "not enabled"));
        }
        debug!(%from, %to, "peer access disabled");
        Ok(())
    }

    fn copy_peer(
        &self,
        src_queue: &Self::Queue,
        src: &Self::Buffer,
        dst_queue: &Self::Queue,
        dst: &mut Self::Buffer,
    ) -> Result<()> {
        Self::check_queue_buffer(src_queue, src, "device-to-device")?;
        Self::check_queue_buffer(dst_queue, dst, "device-to-device")?;
        let len = src.data.len();
        if len > dst.data.len() {
            return Err(RuntimeError::transfer(
                "device-to-device",
                format!(
                    "source length {len} exceeds destination length {}",
                    dst.data.len()
                ),
            ));
        }
        if src.device != dst.device {
            let table = self.peer_table.lock();
            let linked = table.contains(&(src.device.ordinal(), dst.device.ordinal()))
                || table.contains(&(dst.device.ordinal(), src.device.ordinal()));
            if !linked {
                return Err(RuntimeError::peer_access(
                    src.device,
                    dst.device,
                    "direct copy requires an established peer link",
                ));
            }
        }
        dst.data[..len].copy_from_slice(&src.data);
        trace!(from = %src.device, to = %dst.device, len, "direct peer copy");
        Ok(())
    }

    fn copy_peer_staged(
        &self,
        src_queue: &Self::Queue,
        src: &Self::Buffer,
        dst_queue: &Self::Queue,
        dst: &mut Self::Buffer,
    ) -> Result<()> {
        Self::check_queue_buffer(src_queue, src, "device-to-device")?;
        Self::check_queue_buffer(dst_queue, dst, "device-to-device")?;
        let len = src.data.len();
        if len > dst.data.len() {
            return Err(RuntimeError::transfer(
                "device-to-device",
                format!(
                    "source length {len} exceeds destination length {}",
                    dst.data.len()
                ),
            ));
        }
        let staging = src.data.clone();
        dst.data[..len].copy_from_slice(&staging);
        trace!(from = %src.device, to = %dst.device, len, "staged peer copy");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn queue(runtime: &HostRuntime, device: usize) -> HostQueue {
        AcceleratorRuntime::<f64>::create_queue(runtime, DeviceId(device)).unwrap()
    }

    #[test]
    fn test_write_read_roundtrip() {
        let runtime = HostRuntime::new(1);
        let q = queue(&runtime, 0);
        let mut buffer = runtime.alloc(&q, 4).unwrap();

        runtime
            .enqueue_write(&q, &[1.0, 2.0, 3.0, 4.0], &mut buffer)
            .unwrap();
        AcceleratorRuntime::<f64>::synchronize(&runtime, &q).unwrap();

        let mut out = vec![0.0; 4];
        runtime.enqueue_read(&q, &buffer, &mut out).unwrap();
        AcceleratorRuntime::<f64>::synchronize(&runtime, &q).unwrap();
        assert_eq!(out, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_vector_add_small_and_parallel() {
        let runtime = HostRuntime::new(1);
        let q = queue(&runtime, 0);

        for len in [100usize, PARALLEL_THRESHOLD + 17] {
            let mut a = runtime.alloc(&q, len).unwrap();
            let mut b = runtime.alloc(&q, len).unwrap();
            let mut c = runtime.alloc(&q, len).unwrap();
            runtime.enqueue_write(&q, &vec![1.0; len], &mut a).unwrap();
            runtime.enqueue_write(&q, &vec![2.0; len], &mut b).unwrap();
            runtime
                .enqueue_add(&q, &a, &b, &mut c, len, LaunchShape::default())
                .unwrap();
            AcceleratorRuntime::<f64>::synchronize(&runtime, &q).unwrap();

            let mut out = vec![0.0; len];
            runtime.enqueue_read(&q, &c, &mut out).unwrap();
            assert!(out.iter().all(|&v| v == 3.0));
        }
    }

    #[test]
    fn test_add_bounds_checks_slice_length() {
        let runtime = HostRuntime::new(1);
        let q = queue(&runtime, 0);
        let mut a = runtime.alloc(&q, 8).unwrap();
        let mut b = runtime.alloc(&q, 8).unwrap();
        let mut c = runtime.alloc(&q, 8).unwrap();
        runtime.enqueue_write(&q, &[5.0; 8], &mut a).unwrap();
        runtime.enqueue_write(&q, &[7.0; 8], &mut b).unwrap();

        // Only the first 3 elements are touched.
        runtime
            .enqueue_add(&q, &a, &b, &mut c, 3, LaunchShape::default())
            .unwrap();
        let mut out = vec![0.0; 8];
        runtime.enqueue_read(&q, &c, &mut out).unwrap();
        assert_eq!(out, vec![12.0, 12.0, 12.0, 0.0, 0.0, 0.0, 0.0, 0.0]);

        // Asking for more elements than allocated is a launch error.
        let result = runtime.enqueue_add(&q, &a, &b, &mut c, 9, LaunchShape::default());
        assert!(matches!(result, Err(RuntimeError::Launch { .. })));
    }

    #[test]
    fn test_increment() {
        let runtime = HostRuntime::new(1);
        let q = queue(&runtime, 0);
        let mut buffer = runtime.alloc(&q, 5).unwrap();
        runtime.enqueue_write(&q, &[1.0; 5], &mut buffer).unwrap();
        runtime
            .enqueue_increment(&q, &mut buffer, 5, LaunchShape::default())
            .unwrap();

        let mut out = vec![0.0; 5];
        runtime.enqueue_read(&q, &buffer, &mut out).unwrap();
        assert_eq!(out, vec![2.0; 5]);
    }

    #[test]
    fn test_allocation_accounting_and_exhaustion() {
        let runtime = HostRuntime::new(1).with_device_capacity(DeviceId(0), 64);
        let q = queue(&runtime, 0);

        let first: HostBuffer<f64> = runtime.alloc(&q, 4).unwrap();
        assert_eq!(runtime.allocated_bytes(DeviceId(0)).unwrap(), 32);

        // 32 bytes left; 5 more f64 do not fit.
        let second: Result<HostBuffer<f64>> = runtime.alloc(&q, 5);
        assert!(matches!(second, Err(RuntimeError::Allocation { .. })));

        drop(first);
        assert_eq!(runtime.allocated_bytes(DeviceId(0)).unwrap(), 0);
        let third: Result<HostBuffer<f64>> = runtime.alloc(&q, 8);
        assert!(third.is_ok());
    }

    #[test]
    fn test_queue_device_mismatch() {
        let runtime = HostRuntime::new(2);
        let q0 = queue(&runtime, 0);
        let q1 = queue(&runtime, 1);
        let mut buffer = runtime.alloc(&q0, 4).unwrap();

        let result = runtime.enqueue_write(&q1, &[1.0; 4], &mut buffer);
        assert!(matches!(result, Err(RuntimeError::Transfer { .. })));
    }

    #[test]
    fn test_unknown_device() {
        let runtime = HostRuntime::new(1);
        let result = AcceleratorRuntime::<f64>::create_queue(&runtime, DeviceId(7));
        assert!(matches!(
            result,
            Err(RuntimeError::NotEnoughDevices {
                needed: 8,
                available: 1
            })
        ));
    }

    #[test]
    fn test_peer_copy_requires_link() {
        let runtime = HostRuntime::new(2);
        let q0 = queue(&runtime, 0);
        let q1 = queue(&runtime, 1);
        let mut src = runtime.alloc(&q0, 4).unwrap();
        let mut dst = runtime.alloc(&q1, 4).unwrap();
        runtime.enqueue_write(&q0, &[9.0; 4], &mut src).unwrap();

        // Direct copy without a link is rejected; staged always works.
        let direct = runtime.copy_peer(&q0, &src, &q1, &mut dst);
        assert!(matches!(direct, Err(RuntimeError::PeerAccess { .. })));
        runtime.copy_peer_staged(&q0, &src, &q1, &mut dst).unwrap();

        let mut out = vec![0.0; 4];
        runtime.enqueue_read(&q1, &dst, &mut out).unwrap();
        assert_eq!(out, vec![9.0; 4]);
    }

    #[test]
    fn test_peer_copy_direct_with_link() {
        let runtime = HostRuntime::new(2);
        let q0 = queue(&runtime, 0);
        let q1 = queue(&runtime, 1);
        let mut src = runtime.alloc(&q0, 3).unwrap();
        let mut dst = runtime.alloc(&q1, 3).unwrap();
        runtime.enqueue_write(&q0, &[1.0, 2.0, 3.0], &mut src).unwrap();

        AcceleratorRuntime::<f64>::enable_peer_access(&runtime, DeviceId(0), DeviceId(1)).unwrap();
        runtime.copy_peer(&q0, &src, &q1, &mut dst).unwrap();
        AcceleratorRuntime::<f64>::disable_peer_access(&runtime, DeviceId(0), DeviceId(1))
            .unwrap();

        let mut out = vec![0.0; 3];
        runtime.enqueue_read(&q1, &dst, &mut out).unwrap();
        assert_eq!(out, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_peer_access_disabled_topology() {
        let runtime = HostRuntime::new(2).without_peer_access();
        assert!(!AcceleratorRuntime::<f64>::can_access_peer(&runtime, DeviceId(0), DeviceId(1))
            .unwrap());
        let result =
            AcceleratorRuntime::<f64>::enable_peer_access(&runtime, DeviceId(0), DeviceId(1));
        assert!(matches!(result, Err(RuntimeError::PeerAccess { .. })));
    }

    #[test]
    fn test_markers_measure_time() {
        let runtime = HostRuntime::new(1);
        let q = queue(&runtime, 0);
        let start = AcceleratorRuntime::<f64>::record_marker(&runtime, &q).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        let stop = AcceleratorRuntime::<f64>::record_marker(&runtime, &q).unwrap();
        let elapsed = AcceleratorRuntime::<f64>::elapsed(&runtime, &start, &stop).unwrap();
        assert!(elapsed >= Duration::from_millis(2));
    }
}
