//! Overlapped dual-device pipeline.
//!
//! Splits one element-wise addition across a collection of device contexts,
//! one per device. Each context gets three asynchronous operations tagged
//! to its own queue: copy the input slices in, run the addition kernel,
//! copy the result slice out. All contexts have their work issued before
//! any queue is joined, so the copies and kernels of different devices
//! overlap; the measurement is bracketed by markers on the reference
//! device's timeline.

use std::time::Duration;
use tracing::{debug, trace};
use xferbench_core::error::{Result, RuntimeError};
use xferbench_core::runtime::AcceleratorRuntime;
use xferbench_core::split::WorkSplit;
use xferbench_core::types::{DeviceId, Element, LaunchShape};

/// Configuration of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PipelineConfig {
    len: usize,
    devices: usize,
    shape: LaunchShape,
}

impl PipelineConfig {
    /// Pipeline over `len` elements split across two devices.
    pub fn new(len: usize) -> Self {
        Self {
            len,
            devices: 2,
            shape: LaunchShape::default(),
        }
    }

    /// Number of participating devices.
    pub fn with_devices(mut self, devices: usize) -> Self {
        self.devices = devices;
        self
    }

    /// Kernel launch shape.
    pub fn with_launch_shape(mut self, shape: LaunchShape) -> Self {
        self.shape = shape;
        self
    }

    /// Total element count.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the problem is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Participating device count.
    pub fn devices(&self) -> usize {
        self.devices
    }

    /// Launch shape used for the addition kernel.
    pub fn shape(&self) -> LaunchShape {
        self.shape
    }

    fn validate(&self) -> Result<()> {
        if self.devices == 0 {
            return Err(RuntimeError::invalid_config(
                "devices",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// The three host-resident arrays of the full problem.
#[derive(Debug, Clone, PartialEq)]
pub struct HostBuffers<T> {
    /// First input.
    pub a: Vec<T>,
    /// Second input.
    pub b: Vec<T>,
    /// Output, written in disjoint regions by the device contexts.
    pub c: Vec<T>,
}

impl<T: Element> HostBuffers<T> {
    /// Allocate the three arrays, filling the inputs with constants and the
    /// output with zeros.
    pub fn filled(len: usize, a: T, b: T) -> Self {
        Self {
            a: vec![a; len],
            b: vec![b; len],
            c: vec![T::zero(); len],
        }
    }

    /// Element count of the full problem.
    pub fn len(&self) -> usize {
        self.a.len()
    }

    /// Whether the arrays are empty.
    pub fn is_empty(&self) -> bool {
        self.a.is_empty()
    }
}

/// Per-device triple of buffers plus the queue they are tagged to.
///
/// Contexts share nothing; the collection of contexts replaces implicit
/// index pairing between separate handle arrays.
pub struct DeviceContext<T, R>
where
    T: Element,
    R: AcceleratorRuntime<T>,
{
    device: DeviceId,
    split: WorkSplit,
    queue: R::Queue,
    a: R::Buffer,
    b: R::Buffer,
    c: R::Buffer,
}

impl<T, R> DeviceContext<T, R>
where
    T: Element,
    R: AcceleratorRuntime<T>,
{
    /// Create the queue and the three device buffers for one share of the
    /// problem.
    pub fn create(runtime: &R, device: DeviceId, split: WorkSplit) -> Result<Self> {
        let queue = runtime.create_queue(device)?;
        let a = runtime.alloc(&queue, split.len)?;
        let b = runtime.alloc(&queue, split.len)?;
        let c = runtime.alloc(&queue, split.len)?;
        debug!(%device, len = split.len, offset = split.offset, "device context ready");
        Ok(Self {
            device,
            split,
            queue,
            a,
            b,
            c,
        })
    }

    /// Device this context is bound to.
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Share of the problem this context covers.
    pub fn split(&self) -> WorkSplit {
        self.split
    }
}

/// Result of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    /// Time between the start and stop markers on the reference device.
    pub elapsed: Duration,
    /// The decomposition that was executed, in device order.
    pub splits: Vec<WorkSplit>,
}

/// Run the overlapped pipeline: for every device context, enqueue
/// host-to-device copies of its input slices, the addition kernel, and the
/// device-to-host copy of its result slice, without waiting on any other
/// context; then join each queue in device order.
///
/// On success `host.c` equals `host.a + host.b` element-wise and `host.a`
/// and `host.b` are unchanged. Any runtime failure aborts the run with no
/// partial report.
pub fn run_pipeline<T, R>(
    runtime: &R,
    config: &PipelineConfig,
    host: &mut HostBuffers<T>,
) -> Result<PipelineReport>
where
    T: Element,
    R: AcceleratorRuntime<T>,
{
    config.validate()?;
    for (name, len) in [
        ("host.a", host.a.len()),
        ("host.b", host.b.len()),
        ("host.c", host.c.len()),
    ] {
        if len != config.len() {
            return Err(RuntimeError::invalid_config(
                "len",
                format!("{name} holds {len} elements, expected {}", config.len()),
            ));
        }
    }

    let available = runtime.device_count();
    if available < config.devices() {
        return Err(RuntimeError::not_enough_devices(config.devices(), available));
    }

    let splits = WorkSplit::partition(config.len(), config.devices())?;
    let mut contexts = Vec::with_capacity(splits.len());
    for (ordinal, split) in splits.iter().enumerate() {
        contexts.push(DeviceContext::<T, R>::create(
            runtime,
            DeviceId(ordinal),
            *split,
        )?);
    }

    let start = runtime.record_marker(&contexts[0].queue)?;

    // Issue phase: three operations per context, no blocking in between.
    // Each context reads and writes only its own region of the host arrays;
    // the regions are disjoint by construction.
    for ctx in &mut contexts {
        let split = ctx.split;
        if split.is_empty() {
            trace!(device = %ctx.device, "empty share, nothing to issue");
            continue;
        }
        runtime.enqueue_write(&ctx.queue, &host.a[split.range()], &mut ctx.a)?;
        runtime.enqueue_write(&ctx.queue, &host.b[split.range()], &mut ctx.b)?;
        runtime.enqueue_add(&ctx.queue, &ctx.a, &ctx.b, &mut ctx.c, split.len, config.shape())?;
        runtime.enqueue_read(&ctx.queue, &ctx.c, &mut host.c[split.range()])?;
    }

    // Join phase: one blocking wait per queue, in device order.
    for ctx in &contexts {
        runtime.synchronize(&ctx.queue)?;
    }

    let stop = runtime.record_marker(&contexts[0].queue)?;
    let elapsed = runtime.elapsed(&start, &stop)?;
    debug!(?elapsed, devices = contexts.len(), len = config.len(), "pipeline complete");

    Ok(PipelineReport { elapsed, splits })
}
