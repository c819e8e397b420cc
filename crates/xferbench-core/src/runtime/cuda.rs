//! CUDA runtime implementation over cudarc.
//!
//! One context per device, NVRTC-compiled kernels loaded into every
//! context at startup. Queues are cudarc streams; timing markers are CUDA
//! events recorded on the stream's timeline.

use super::AcceleratorRuntime;
use crate::error::{Result, RuntimeError};
use crate::types::{DeviceId, Element, LaunchShape};
use cudarc::driver::{
    result, sys, CudaContext, CudaEvent, CudaFunction, CudaModule, CudaSlice, CudaStream,
    DeviceRepr, LaunchConfig, PushKernelArg, ValidAsZeroBits,
};
use cudarc::nvrtc::compile_ptx;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Device kernels, one specialization per element type.
const KERNEL_SOURCE: &str = r#"
#define VECTOR_ADD(SUFFIX, T)                                                  \
extern "C" __global__ void vector_add_##SUFFIX(const T *a, const T *b, T *c,   \
                                               unsigned int n) {               \
    unsigned int i = blockIdx.x * blockDim.x + threadIdx.x;                    \
    if (i < n) {                                                               \
        c[i] = a[i] + b[i];                                                    \
    }                                                                          \
}

#define INCREMENT(SUFFIX, T)                                                   \
extern "C" __global__ void increment_##SUFFIX(T *a, unsigned int n) {          \
    unsigned int i = blockIdx.x * blockDim.x + threadIdx.x;                    \
    if (i < n) {                                                               \
        a[i] += (T)1;                                                          \
    }                                                                          \
}

VECTOR_ADD(f32, float)
VECTOR_ADD(f64, double)
VECTOR_ADD(i32, int)
INCREMENT(f32, float)
INCREMENT(f64, double)
INCREMENT(i32, int)
"#;

/// Runtime over real CUDA devices.
pub struct CudaRuntime {
    devices: Vec<CudaDeviceState>,
}

struct CudaDeviceState {
    ctx: Arc<CudaContext>,
    module: Arc<CudaModule>,
}

/// Device buffer plus the ordinal it lives on.
pub struct CudaBuffer<T> {
    slice: CudaSlice<T>,
    device: DeviceId,
}

impl CudaRuntime {
    /// Initialize every visible device and compile the kernels into each
    /// context.
    pub fn new() -> Result<Self> {
        let count = result::device::get_count()
            .map_err(|e| RuntimeError::init(format!("device query failed: {e}")))?
            as usize;
        let ptx = compile_ptx(KERNEL_SOURCE)
            .map_err(|e| RuntimeError::init(format!("kernel compilation failed: {e}")))?;

        let mut devices = Vec::with_capacity(count);
        for ordinal in 0..count {
            let ctx = CudaContext::new(ordinal)
                .map_err(|e| RuntimeError::init(format!("device {ordinal} unavailable: {e}")))?;
            let module = ctx.load_module(ptx.clone()).map_err(|e| {
                RuntimeError::init(format!("module load on device {ordinal} failed: {e}"))
            })?;
            devices.push(CudaDeviceState { ctx, module });
        }
        debug!(count, "cuda runtime initialized");
        Ok(Self { devices })
    }

    /// Check whether any CUDA device can be opened.
    pub fn is_available() -> bool {
        CudaContext::new(0).is_ok()
    }

    fn state(&self, device: DeviceId) -> Result<&CudaDeviceState> {
        self.devices.get(device.ordinal()).ok_or_else(|| {
            RuntimeError::not_enough_devices(device.ordinal() + 1, self.devices.len())
        })
    }

    fn function(&self, device: DeviceId, name: &str) -> Result<CudaFunction> {
        self.state(device)?
            .module
            .load_function(name)
            .map_err(|e| RuntimeError::launch(name, format!("kernel lookup failed: {e}")))
    }

    fn queue_device(queue: &Arc<CudaStream>) -> DeviceId {
        DeviceId(queue.context().ordinal())
    }

    fn cu_device(device: DeviceId) -> Result<sys::CUdevice> {
        result::device::get(device.ordinal() as i32)
            .map_err(|e| RuntimeError::init(format!("{device} handle lookup failed: {e}")))
    }

    fn launch_shape(shape: LaunchShape, len: usize) -> LaunchConfig {
        LaunchConfig {
            grid_dim: (shape.groups_for(len), 1, 1),
            block_dim: (shape.threads_per_group(), 1, 1),
            shared_mem_bytes: 0,
        }
    }
}

impl<T> AcceleratorRuntime<T> for CudaRuntime
where
    T: Element + DeviceRepr + ValidAsZeroBits,
{
    type Buffer = CudaBuffer<T>;
    type Queue = Arc<CudaStream>;
    type Marker = CudaEvent;

    fn name(&self) -> &str {
        "cuda"
    }

    fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn create_queue(&self, device: DeviceId) -> Result<Self::Queue> {
        let stream = self
            .state(device)?
            .ctx
            .new_stream()
            .map_err(|e| RuntimeError::init(format!("stream creation on {device} failed: {e}")))?;
        trace!(%device, "created stream");
        Ok(stream)
    }

    fn alloc(&self, queue: &Self::Queue, len: usize) -> Result<Self::Buffer> {
        let device = Self::queue_device(queue);
        let slice = queue.alloc_zeros::<T>(len).map_err(|e| {
            RuntimeError::allocation(device, len * std::mem::size_of::<T>(), e.to_string())
        })?;
        debug!(%device, len, "allocated device buffer");
        Ok(CudaBuffer { slice, device })
    }

    fn buffer_len(&self, buffer: &Self::Buffer) -> usize {
        buffer.slice.len()
    }

    fn buffer_device(&self, buffer: &Self::Buffer) -> DeviceId {
        buffer.device
    }

    fn enqueue_write(&self, queue: &Self::Queue, src: &[T], dst: &mut Self::Buffer) -> Result<()> {
        let device = Self::queue_device(queue);
        if device != dst.device {
            return Err(RuntimeError::transfer(
                "host-to-device",
                format!("queue on {device} cannot write a buffer on {}", dst.device),
            ));
        }
        if src.len() > dst.slice.len() {
            return Err(RuntimeError::transfer(
                "host-to-device",
                format!(
                    "source length {} exceeds destination length {}",
                    src.len(),
                    dst.slice.len()
                ),
            ));
        }
        if src.is_empty() {
            return Ok(());
        }
        let mut view = dst.slice.slice_mut(0..src.len());
        queue
            .memcpy_htod(src, &mut view)
            .map_err(|e| RuntimeError::transfer("host-to-device", e.to_string()))?;
        trace!(%device, len = src.len(), "host-to-device copy");
        Ok(())
    }

    fn enqueue_read(&self, queue: &Self::Queue, src: &Self::Buffer, dst: &mut [T]) -> Result<()> {
        let device = Self::queue_device(queue);
        if device != src.device {
            return Err(RuntimeError::transfer(
                "device-to-host",
                format!("queue on {device} cannot read a buffer on {}", src.device),
            ));
        }
        if dst.len() > src.slice.len() {
            return Err(RuntimeError::transfer(
                "device-to-host",
                format!(
                    "destination length {} exceeds source length {}",
                    dst.len(),
                    src.slice.len()
                ),
            ));
        }
        if dst.is_empty() {
            return Ok(());
        }
        let view = src.slice.slice(0..dst.len());
        queue
            .memcpy_dtoh(&view, dst)
            .map_err(|e| RuntimeError::transfer("device-to-host", e.to_string()))?;
        trace!(%device, len = dst.len(), "device-to-host copy");
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
        let device = Self::queue_device(queue);
        for buffer in [a.device, b.device, out.device] {
            if device != buffer {
                return Err(RuntimeError::launch(
                    kernel.clone(),
                    format!("buffer on {buffer} but queue on {device}"),
                ));
            }
        }
        if len > a.slice.len() || len > b.slice.len() || len > out.slice.len() {
            return Err(RuntimeError::launch(
                kernel,
                format!("slice length {len} exceeds a buffer's length"),
            ));
        }
        if len == 0 {
            return Ok(());
        }

        let func = self.function(device, &kernel)?;
        let n = len as u32;
        let config = Self::launch_shape(shape, len);
        trace!(%device, len, groups = config.grid_dim.0, "launching {kernel}");
        let mut builder = queue.launch_builder(&func);
        builder.arg(&a.slice);
        builder.arg(&b.slice);
        builder.arg(&mut out.slice);
        builder.arg(&n);
        unsafe { builder.launch(config) }
            .map_err(|e| RuntimeError::launch(kernel, e.to_string()))?;
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
        let device = Self::queue_device(queue);
        if device != buffer.device {
            return Err(RuntimeError::launch(
                kernel,
                format!("buffer on {} but queue on {device}", buffer.device),
            ));
        }
        if len > buffer.slice.len() {
            return Err(RuntimeError::launch(
                kernel,
                format!("slice length {len} exceeds buffer length {}", buffer.slice.len()),
            ));
        }
        if len == 0 {
            return Ok(());
        }

        let func = self.function(device, &kernel)?;
        let n = len as u32;
        let config = Self::launch_shape(shape, len);
        trace!(%device, len, groups = config.grid_dim.0, "launching {kernel}");
        let mut builder = queue.launch_builder(&func);
        builder.arg(&mut buffer.slice);
        builder.arg(&n);
        unsafe { builder.launch(config) }
            .map_err(|e| RuntimeError::launch(kernel, e.to_string()))?;
        Ok(())
    }

    fn synchronize(&self, queue: &Self::Queue) -> Result<()> {
        let device = Self::queue_device(queue);
        queue
            .synchronize()
            .map_err(|e| RuntimeError::sync(device, e.to_string()))?;
        trace!(%device, "synchronized");
        Ok(())
    }

    fn record_marker(&self, queue: &Self::Queue) -> Result<Self::Marker> {
        let device = Self::queue_device(queue);
        let event = queue
            .context()
            .new_event(None)
            .map_err(|e| RuntimeError::sync(device, format!("event creation failed: {e}")))?;
        event
            .record(queue)
            .map_err(|e| RuntimeError::sync(device, format!("event record failed: {e}")))?;
        Ok(event)
    }

    fn elapsed(&self, start: &Self::Marker, stop: &Self::Marker) -> Result<Duration> {
        // The stop event may still be in flight; wait for it before asking
        // the driver for the delta.
        stop.synchronize()
            .map_err(|e| RuntimeError::sync(DeviceId(0), format!("event wait failed: {e}")))?;
        let millis = start
            .elapsed_ms(stop)
            .map_err(|e| RuntimeError::sync(DeviceId(0), format!("event timing failed: {e}")))?;
        Ok(Duration::from_secs_f64(f64::from(millis) / 1e3))
    }

    fn can_access_peer(&self, from: DeviceId, to: DeviceId) -> Result<bool> {
        self.state(from)?;
        self.state(to)?;
        if from == to {
            return Ok(false);
        }
        let target = Self::cu_device(from)?;
        let accessor = Self::cu_device(to)?;
        let mut flag = 0i32;
        let status = unsafe { sys::cuDeviceCanAccessPeer(&mut flag, accessor, target) };
        if status != sys::CUresult::CUDA_SUCCESS {
            return Err(RuntimeError::peer_access(
                from,
                to,
                format!("query failed: {status:?}"),
            ));
        }
        Ok(flag != 0)
    }

    fn enable_peer_access(&self, from: DeviceId, to: DeviceId) -> Result<()> {
        let exposed = self.state(from)?;
        let accessor = self.state(to)?;
        accessor
            .ctx
            .bind_to_thread()
            .map_err(|e| RuntimeError::peer_access(from, to, format!("context bind failed: {e}")))?;
        let status = unsafe { sys::cuCtxEnablePeerAccess(exposed.ctx.cu_ctx(), 0) };
        if status != sys::CUresult::CUDA_SUCCESS {
            return Err(RuntimeError::peer_access(
                from,
                to,
                format!("enable failed: {status:?}"),
            ));
        }
        debug!(%from, %to, "peer access enabled");
        Ok(())
    }

    fn disable_peer_access(&self, from: DeviceId, to: DeviceId) -> Result<()> {
        let exposed = self.state(from)?;
        let accessor = self.state(to)?;
        accessor
            .ctx
            .bind_to_thread()
            .map_err(|e| RuntimeError::peer_access(from, to, format!("context bind failed: {e}")))?;
        let status = unsafe { sys::cuCtxDisablePeerAccess(exposed.ctx.cu_ctx()) };
        if status != sys::CUresult::CUDA_SUCCESS {
            return Err(RuntimeError::peer_access(
                from,
                to,
                format!("disable failed: {status:?}"),
            ));
        }
        debug!(%from, %to, "peer access disabled");
        Ok(())
    }

    fn copy_peer(
        &self,
        _src_queue: &Self::Queue,
        src: &Self::Buffer,
        dst_queue: &Self::Queue,
        dst: &mut Self::Buffer,
    ) -> Result<()> {
        let len = src.slice.len();
        if len > dst.slice.len() {
            return Err(RuntimeError::transfer(
                "device-to-device",
                format!(
                    "source length {len} exceeds destination length {}",
                    dst.slice.len()
                ),
            ));
        }
        // The driver picks the fastest route available: a fabric copy when
        // peer access is enabled, transparent staging otherwise.
        let transferred = src
            .slice
            .clone_peer(dst_queue)
            .map_err(|e| RuntimeError::transfer("device-to-device", e.to_string()))?;
        if len == dst.slice.len() {
            dst.slice = transferred;
        } else {
            let view = transferred.slice(0..len);
            let mut target = dst.slice.slice_mut(0..len);
            dst_queue
                .memcpy_dtod(&view, &mut target)
                .map_err(|e| RuntimeError::transfer("device-to-device", e.to_string()))?;
        }
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
        let len = src.slice.len();
        if len > dst.slice.len() {
            return Err(RuntimeError::transfer(
                "device-to-device",
                format!(
                    "source length {len} exceeds destination length {}",
                    dst.slice.len()
                ),
            ));
        }
        let staging = src_queue
            .memcpy_dtov(&src.slice)
            .map_err(|e| RuntimeError::transfer("device-to-host", e.to_string()))?;
        let mut target = dst.slice.slice_mut(0..len);
        dst_queue
            .memcpy_htod(&staging, &mut target)
            .map_err(|e| RuntimeError::transfer("host-to-device", e.to_string()))?;
        trace!(from = %src.device, to = %dst.device, len, "staged peer copy");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_roundtrip_and_add() {
        if !CudaRuntime::is_available() {
            return;
        }
        let runtime = CudaRuntime::new().unwrap();
        let q = runtime.create_queue(DeviceId(0)).unwrap();

        let mut a = AcceleratorRuntime::<f64>::alloc(&runtime, &q, 256).unwrap();
        let mut b = runtime.alloc(&q, 256).unwrap();
        let mut c = runtime.alloc(&q, 256).unwrap();
        runtime.enqueue_write(&q, &vec![1.0; 256], &mut a).unwrap();
        runtime.enqueue_write(&q, &vec![2.0; 256], &mut b).unwrap();
        runtime
            .enqueue_add(&q, &a, &b, &mut c, 256, LaunchShape::default())
            .unwrap();

        let mut out = vec![0.0; 256];
        runtime.enqueue_read(&q, &c, &mut out).unwrap();
        runtime.synchronize(&q).unwrap();
        assert!(out.iter().all(|&v| v == 3.0));
    }

    #[test]
    #[serial]
    #[ignore = "needs two peer-enabled GPUs"]
    fn test_peer_copy_between_devices() {
        let runtime = CudaRuntime::new().unwrap();
        let q0 = runtime.create_queue(DeviceId(0)).unwrap();
        let q1 = runtime.create_queue(DeviceId(1)).unwrap();

        let mut src = AcceleratorRuntime::<i32>::alloc(&runtime, &q0, 64).unwrap();
        let mut dst = runtime.alloc(&q1, 64).unwrap();
        runtime.enqueue_write(&q0, &vec![7; 64], &mut src).unwrap();
        runtime.synchronize(&q0).unwrap();

        runtime.copy_peer(&q0, &src, &q1, &mut dst).unwrap();
        let mut out = vec![0; 64];
        runtime.enqueue_read(&q1, &dst, &mut out).unwrap();
        runtime.synchronize(&q1).unwrap();
        assert_eq!(out, vec![7; 64]);
    }
}
