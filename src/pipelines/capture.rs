// SPDX-License-Identifier: GPL-3.0-only

//! Zero-copy capture pipeline
//!
//! Setup order:
//! 1. capture pool allocated from the heap, sized from the negotiated format
//! 2. VIDIOC_REQBUFS and reconciliation of the granted count with the pool
//! 3. slots attached
//! 4. output pool allocated, imported and bound as render surfaces
//! 5. every slot queued, stream on
//!
//! Anything acquired before a failing step is released in reverse order by
//! [`CapturePipeline::shutdown`], which also runs on drop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::backends::dma_heap::{Allocator, BufferPool, SyncAccess};
use crate::backends::v4l2::{CaptureDevice, CaptureIo, CaptureQueue};
use crate::errors::{PipelineError, PipelineResult, QueueOp};
use crate::gpu::formats::{self, DrmFourcc, FormatInfo};
use crate::gpu::{
    Geometry, GpuDriver, ImageImporter, ImportedImage, RenderSurface, RenderTargetBinder, SampledTexture,
};

/// Action returned by a render stage to control the capture loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopAction {
    /// Keep capturing
    Continue,
    /// Stop after this frame
    Stop,
}

/// Pipeline sizing and timing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Capture buffers requested from the driver
    pub buffer_count: u32,
    /// Render surfaces in the output pool
    pub output_count: usize,
    pub output_format: DrmFourcc,
    pub output_width: u32,
    pub output_height: u32,
    /// Poll the device with this timeout before each dequeue; `None` blocks
    /// in VIDIOC_DQBUF
    pub poll_timeout: Option<Duration>,
}

/// A filled capture buffer, valid until the stage returns
#[derive(Debug)]
pub struct CapturedFrame<'a> {
    pub slot: u32,
    pub sequence: u32,
    pub bytesused: u32,
    pub image: &'a ImportedImage,
    pub texture: &'a SampledTexture,
}

/// External rendering step, called once per captured frame with the next
/// output surface
pub trait RenderStage<G: GpuDriver> {
    fn render(
        &mut self,
        driver: &mut G,
        input: &CapturedFrame<'_>,
        output: &RenderSurface,
    ) -> PipelineResult<LoopAction>;
}

impl<G, F> RenderStage<G> for F
where
    G: GpuDriver,
    F: FnMut(&mut G, &CapturedFrame<'_>, &RenderSurface) -> PipelineResult<LoopAction>,
{
    fn render(
        &mut self,
        driver: &mut G,
        input: &CapturedFrame<'_>,
        output: &RenderSurface,
    ) -> PipelineResult<LoopAction> {
        self(driver, input, output)
    }
}

/// Counters reported when the capture loop ends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Frames rendered and handed back to the driver
    pub frames: u64,
    /// Dequeues and requeues retried after EAGAIN/EINTR
    pub transient_retries: u64,
    /// Poll timeouts with no frame
    pub timeouts: u64,
    /// GPU images created for capture slots
    pub imports: u64,
}

/// One output frame: heap buffer, its image and the framebuffer around it
#[derive(Debug)]
struct OutputFrame {
    image: ImportedImage,
    surface: RenderSurface,
}

pub struct CapturePipeline<D: CaptureIo, A: Allocator, G: GpuDriver> {
    driver: G,
    allocator: A,
    importer: ImageImporter,
    binder: RenderTargetBinder,
    queue: CaptureQueue<D>,
    capture_format: &'static FormatInfo,
    options: PipelineOptions,
    input_pool: BufferPool,
    output_pool: BufferPool,
    outputs: Vec<OutputFrame>,
    next_output: usize,
    last_output: Option<usize>,
    imports: u64,
    shut_down: bool,
}

impl<D: CaptureIo, A: Allocator, G: GpuDriver> CapturePipeline<D, A, G> {
    /// Build the pipeline over a negotiated device and leave it streaming
    pub fn setup(device: CaptureDevice<D>, allocator: A, driver: G, options: PipelineOptions) -> PipelineResult<Self> {
        let fourcc = device.format().pixel_format;
        let capture_format = formats::lookup_v4l2(fourcc)
            .ok_or_else(|| PipelineError::UnsupportedPixelFormat(DrmFourcc(fourcc.into())))?;
        // Each slot is one contiguous buffer
        if device.format().planes.len() > 1 {
            return Err(PipelineError::UnsupportedPixelFormat(capture_format.drm));
        }
        formats::lookup(options.output_format).ok_or(PipelineError::UnsupportedPixelFormat(options.output_format))?;
        if options.buffer_count == 0 {
            return Err(PipelineError::Config("buffer_count must be at least 1".into()));
        }
        if options.output_count == 0 {
            return Err(PipelineError::Config("output_count must be at least 1".into()));
        }

        let mut pipeline = Self {
            driver,
            allocator,
            importer: ImageImporter::new(),
            binder: RenderTargetBinder::new(),
            queue: CaptureQueue::new(device),
            capture_format,
            options,
            input_pool: BufferPool::new("capture"),
            output_pool: BufferPool::new("output"),
            outputs: Vec::new(),
            next_output: 0,
            last_output: None,
            imports: 0,
            shut_down: false,
        };

        // Early returns drop `pipeline`, which unwinds whatever was acquired
        pipeline.allocate_inputs()?;
        pipeline.allocate_outputs()?;
        pipeline.queue.start()?;

        info!(
            capture = %pipeline.capture_format.drm,
            slots = pipeline.queue.len(),
            outputs = pipeline.outputs.len(),
            output_format = %pipeline.options.output_format,
            "Capture pipeline ready"
        );
        Ok(pipeline)
    }

    fn allocate_inputs(&mut self) -> PipelineResult<()> {
        let size = self.queue.device().format().buffer_size();
        let requested = self.options.buffer_count;

        self.input_pool.fill(&mut self.allocator, requested as usize, size)?;

        let granted = self.queue.request(requested)? as usize;
        if granted == 0 {
            return Err(PipelineError::queue_state(
                QueueOp::RequestBuffers,
                "driver granted no buffers",
            ));
        }
        if granted < self.input_pool.len() {
            self.input_pool.truncate(granted);
        } else if granted > self.input_pool.len() {
            self.input_pool.fill(&mut self.allocator, granted, size)?;
        }

        self.queue.attach(&self.input_pool.refs())
    }

    fn allocate_outputs(&mut self) -> PipelineResult<()> {
        let format = self.options.output_format;
        let (width, height) = (self.options.output_width, self.options.output_height);
        let info = formats::lookup(format).ok_or(PipelineError::UnsupportedPixelFormat(format))?;
        let size = info.frame_size(width, height) as usize;

        self.output_pool
            .fill(&mut self.allocator, self.options.output_count, size)?;

        for i in 0..self.output_pool.len() {
            let Some(buffer) = self.output_pool.get(i).map(|h| h.buffer_ref()) else {
                break;
            };
            let image = self
                .importer
                .import(&mut self.driver, buffer, format, Geometry::new(width, height))?;
            let surface = match self.binder.bind(&mut self.driver, &image) {
                Ok(surface) => surface,
                Err(e) => {
                    self.importer.release(&mut self.driver, image);
                    return Err(e);
                }
            };
            self.outputs.push(OutputFrame { image, surface });
        }
        Ok(())
    }

    /// Import and bind a capture slot the first time it is dequeued.
    /// Returns whether a new image was created.
    fn prepare_slot(&mut self, index: u32) -> PipelineResult<bool> {
        let format = self.queue.device().format();
        let geometry = Geometry::new(format.width, format.height).with_stride(format.stride());
        let drm = self.capture_format.drm;

        let Self {
            queue,
            driver,
            importer,
            binder,
            ..
        } = self;
        let slot = queue.slot_mut(index).ok_or_else(|| {
            PipelineError::queue_state(QueueOp::Dequeue, format!("no slot {}", index))
        })?;

        let mut imported = false;
        if slot.image.is_none() {
            slot.image = Some(importer.import(driver, slot.buffer, drm, geometry)?);
            imported = true;
        }
        if slot.sampler.is_none() {
            if let Some(image) = slot.image.as_ref() {
                slot.sampler = Some(binder.bind_sampler(driver, image)?);
            }
        }
        Ok(imported)
    }

    /// Run the capture loop until `stop` is set, the stage asks to stop,
    /// `max_frames` frames were rendered or a non-transient error occurs
    pub fn run<S: RenderStage<G>>(
        &mut self,
        stage: &mut S,
        stop: &AtomicBool,
        max_frames: Option<u64>,
    ) -> PipelineResult<RunStats> {
        let mut stats = RunStats::default();
        let imports_before = self.imports;

        loop {
            if stop.load(Ordering::SeqCst) {
                debug!("Stop signal received");
                break;
            }
            if max_frames.is_some_and(|max| stats.frames >= max) {
                break;
            }

            let index = match self.queue.dequeue(self.options.poll_timeout) {
                Ok(Some(index)) => index,
                Ok(None) => {
                    stats.timeouts += 1;
                    continue;
                }
                Err(e) if e.is_transient() => {
                    debug!(error = %e, "Transient dequeue error, retrying");
                    stats.transient_retries += 1;
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, frames = stats.frames, "Capture loop aborted");
                    return Err(e);
                }
            };

            if self.prepare_slot(index)? {
                self.imports += 1;
            }

            let output_index = self.next_output;
            self.next_output = (self.next_output + 1) % self.outputs.len();
            self.last_output = Some(output_index);

            let action = {
                let slot = self.queue.slot(index).ok_or_else(|| {
                    PipelineError::queue_state(QueueOp::Dequeue, format!("no slot {}", index))
                })?;
                let (Some(image), Some(texture)) = (slot.image.as_ref(), slot.sampler.as_ref()) else {
                    return Err(PipelineError::queue_state(
                        QueueOp::Dequeue,
                        format!("slot {} has no bound image", index),
                    ));
                };
                let fill = slot.last_fill;
                let frame = CapturedFrame {
                    slot: index,
                    sequence: fill.map(|f| f.sequence).unwrap_or_default(),
                    bytesused: fill.map(|f| f.bytesused).unwrap_or_default(),
                    image,
                    texture,
                };
                stage.render(&mut self.driver, &frame, &self.outputs[output_index].surface)?
            };

            stats.frames += 1;
            let requeued = self.requeue_slot(index, stop, &mut stats)?;

            if !requeued {
                debug!(slot = index, "Stop signal received while requeueing");
                break;
            }
            if action == LoopAction::Stop {
                debug!("Render stage requested stop");
                break;
            }
        }

        stats.imports = self.imports - imports_before;
        info!(
            frames = stats.frames,
            retries = stats.transient_retries,
            timeouts = stats.timeouts,
            imports = stats.imports,
            "Capture loop finished"
        );
        Ok(stats)
    }

    /// Hand a consumed slot back to the driver, retrying EAGAIN/EINTR.
    /// Returns `false` if `stop` was raised before the driver took it.
    fn requeue_slot(&mut self, index: u32, stop: &AtomicBool, stats: &mut RunStats) -> PipelineResult<bool> {
        loop {
            match self.queue.requeue(index) {
                Ok(()) => return Ok(true),
                Err(e) if e.is_transient() => {
                    debug!(slot = index, error = %e, "Transient requeue error, retrying");
                    stats.transient_retries += 1;
                    if stop.load(Ordering::SeqCst) {
                        return Ok(false);
                    }
                }
                Err(e) => {
                    warn!(slot = index, error = %e, frames = stats.frames, "Capture loop aborted");
                    return Err(e);
                }
            }
        }
    }

    /// Copy an output frame to memory once the GPU is done with it
    pub fn read_output(&mut self, index: usize) -> PipelineResult<Vec<u8>> {
        let handle = self.output_pool.get(index).ok_or_else(|| {
            PipelineError::BufferAccessFailed(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no output buffer {}", index),
            ))
        })?;

        self.driver.finish();
        let mapping = handle.map().map_err(PipelineError::BufferAccessFailed)?;
        let access = mapping
            .begin_access(SyncAccess::Read)
            .map_err(PipelineError::BufferAccessFailed)?;
        Ok(access.bytes().to_vec())
    }

    /// Index of the output surface most recently handed to the render stage
    pub fn last_output(&self) -> Option<usize> {
        self.last_output
    }

    pub fn output_surfaces(&self) -> impl Iterator<Item = &RenderSurface> {
        self.outputs.iter().map(|o| &o.surface)
    }

    pub fn output_format(&self) -> DrmFourcc {
        self.options.output_format
    }

    pub fn output_size(&self) -> (u32, u32) {
        (self.options.output_width, self.options.output_height)
    }

    pub fn queue(&self) -> &CaptureQueue<D> {
        &self.queue
    }

    pub fn driver(&self) -> &G {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut G {
        &mut self.driver
    }

    pub fn importer(&self) -> &ImageImporter {
        &self.importer
    }

    /// Stop streaming, destroy GPU objects, then close every buffer.
    /// Idempotent.
    pub fn shutdown(&mut self) -> PipelineResult<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;

        let stopped = self.queue.stop();

        for slot in self.queue.slots_mut() {
            if let Some(sampler) = slot.sampler.take() {
                self.binder.release_sampler(&mut self.driver, sampler);
            }
            if let Some(image) = slot.image.take() {
                self.importer.release(&mut self.driver, image);
            }
        }

        while let Some(output) = self.outputs.pop() {
            self.binder.release(&mut self.driver, output.surface);
            self.importer.release(&mut self.driver, output.image);
        }

        self.output_pool.release();
        self.input_pool.release();
        debug!("Capture pipeline shut down");
        stopped
    }
}

impl<D: CaptureIo, A: Allocator, G: GpuDriver> Drop for CapturePipeline<D, A, G> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "Capture pipeline teardown failed");
        }
    }
}
