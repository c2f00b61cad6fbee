// SPDX-License-Identifier: GPL-3.0-only

//! DMABUF capture queue
//!
//! Each slot pairs a driver buffer index with one pool buffer. Slots move
//! `Free -> QueuedToDevice -> Dequeued -> QueuedToDevice -> ...` while
//! streaming and end up `Released` after [`CaptureQueue::stop`].
//!
//! A slot is one contiguous dma-buf. Layouts whose planes live in separate
//! memory (NV12M and friends) cannot be backed by it and are refused at
//! attach time.

use std::time::Duration;

use tracing::{debug, info, warn};

use super::device::CaptureDevice;
use super::io::{CaptureIo, DequeuedBuffer, PlaneRef};
use crate::backends::dma_heap::BufferRef;
use crate::errors::{PipelineError, PipelineResult, QueueOp};
use crate::gpu::{DrmFourcc, ImportedImage, SampledTexture};

/// Ownership of a slot's buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Attached but not yet handed to the driver
    Free,
    /// Owned by the driver, waiting to be filled
    QueuedToDevice,
    /// Filled and owned by the application
    Dequeued,
    /// Stream stopped; the driver no longer knows the slot
    Released,
}

/// One capture buffer as seen by the queue
#[derive(Debug)]
pub struct BufferSlot {
    pub index: u32,
    pub buffer: BufferRef,
    pub state: SlotState,
    /// GPU image, created on the slot's first dequeue and kept until teardown
    pub image: Option<ImportedImage>,
    pub sampler: Option<SampledTexture>,
    /// Metadata of the most recent fill
    pub last_fill: Option<DequeuedBuffer>,
}

/// Capture queue over a negotiated device
#[derive(Debug)]
pub struct CaptureQueue<D: CaptureIo> {
    device: CaptureDevice<D>,
    slots: Vec<BufferSlot>,
    granted: Option<u32>,
    streaming: bool,
}

impl<D: CaptureIo> CaptureQueue<D> {
    pub fn new(device: CaptureDevice<D>) -> Self {
        Self {
            device,
            slots: Vec::new(),
            granted: None,
            streaming: false,
        }
    }

    pub fn device(&self) -> &CaptureDevice<D> {
        &self.device
    }

    /// VIDIOC_REQBUFS for `count` DMABUF buffers; the driver may grant a
    /// different number
    pub fn request(&mut self, count: u32) -> PipelineResult<u32> {
        let mode = self.device.mode();
        let granted = self
            .device
            .io_mut()
            .request_buffers(mode, count)
            .map_err(|e| PipelineError::queue(QueueOp::RequestBuffers, e))?;

        if granted != count {
            info!(requested = count, granted, "Driver adjusted buffer count");
        } else {
            debug!(count, "Capture buffers requested");
        }
        self.granted = Some(granted);
        Ok(granted)
    }

    /// Create one `Free` slot per buffer, in index order
    pub fn attach(&mut self, buffers: &[BufferRef]) -> PipelineResult<()> {
        let granted = self
            .granted
            .ok_or_else(|| PipelineError::queue_state(QueueOp::Queue, "buffers not requested"))?;
        if buffers.len() != granted as usize {
            return Err(PipelineError::queue_state(
                QueueOp::Queue,
                format!("{} buffers for {} granted slots", buffers.len(), granted),
            ));
        }
        if !self.slots.is_empty() {
            return Err(PipelineError::queue_state(QueueOp::Queue, "slots already attached"));
        }

        let format = self.device.format();
        if format.planes.len() > 1 {
            return Err(PipelineError::UnsupportedPixelFormat(DrmFourcc(
                format.pixel_format.into(),
            )));
        }

        let required = format.buffer_size();
        if let Some(small) = buffers.iter().find(|b| b.size < required) {
            return Err(PipelineError::BufferTooSmall {
                required: required as u64,
                actual: small.size,
            });
        }

        self.slots = buffers
            .iter()
            .enumerate()
            .map(|(index, &buffer)| BufferSlot {
                index: index as u32,
                buffer,
                state: SlotState::Free,
                image: None,
                sampler: None,
                last_fill: None,
            })
            .collect();
        Ok(())
    }

    /// Queue every free slot, then start streaming
    pub fn start(&mut self) -> PipelineResult<()> {
        if self.slots.is_empty() {
            return Err(PipelineError::queue_state(QueueOp::StreamOn, "no slots attached"));
        }
        if self.streaming {
            return Ok(());
        }

        for i in 0..self.slots.len() {
            if self.slots[i].state == SlotState::Free {
                self.enqueue(i)?;
            }
        }

        let mode = self.device.mode();
        self.device
            .io_mut()
            .stream_on(mode)
            .map_err(|e| PipelineError::queue(QueueOp::StreamOn, e))?;
        self.streaming = true;

        info!(slots = self.slots.len(), mode = ?mode, "Capture streaming");
        Ok(())
    }

    /// Wait for the next filled buffer and take ownership of its slot.
    ///
    /// With a timeout the device is polled first; `Ok(None)` means nothing
    /// arrived in time.
    pub fn dequeue(&mut self, timeout: Option<Duration>) -> PipelineResult<Option<u32>> {
        if !self.streaming {
            return Err(PipelineError::queue_state(QueueOp::Dequeue, "stream not running"));
        }

        if timeout.is_some() {
            let ready = self
                .device
                .io_mut()
                .wait_readable(timeout)
                .map_err(|e| PipelineError::queue(QueueOp::Poll, e))?;
            if !ready {
                return Ok(None);
            }
        }

        let mode = self.device.mode();
        let filled = self
            .device
            .io_mut()
            .dequeue_buffer(mode, 1)
            .map_err(|e| PipelineError::queue(QueueOp::Dequeue, e))?;

        let slot = self
            .slots
            .get_mut(filled.index as usize)
            .filter(|slot| slot.state == SlotState::QueuedToDevice)
            .ok_or_else(|| {
                PipelineError::queue_state(
                    QueueOp::Dequeue,
                    format!("driver returned index {} it does not own", filled.index),
                )
            })?;

        slot.state = SlotState::Dequeued;
        slot.last_fill = Some(filled);
        Ok(Some(filled.index))
    }

    /// Hand a consumed slot back to the driver
    pub fn requeue(&mut self, index: u32) -> PipelineResult<()> {
        match self.slots.get(index as usize).map(|s| s.state) {
            Some(SlotState::Dequeued) => self.enqueue(index as usize),
            Some(state) => Err(PipelineError::queue_state(
                QueueOp::Queue,
                format!("slot {} is {:?}, not dequeued", index, state),
            )),
            None => Err(PipelineError::queue_state(
                QueueOp::Queue,
                format!("no slot {}", index),
            )),
        }
    }

    fn enqueue(&mut self, i: usize) -> PipelineResult<()> {
        let mode = self.device.mode();
        let slot = &self.slots[i];
        // One descriptor for the whole contiguous buffer, on either API
        let planes = [PlaneRef {
            fd: slot.buffer.fd,
            length: slot.buffer.size as u32,
        }];

        let index = slot.index;
        self.device
            .io_mut()
            .queue_buffer(mode, index, &planes)
            .map_err(|e| PipelineError::queue(QueueOp::Queue, e))?;
        self.slots[i].state = SlotState::QueuedToDevice;
        Ok(())
    }

    /// Stop streaming and drop the driver's buffer bookkeeping.
    ///
    /// Pool buffers stay open. Safe to call more than once.
    pub fn stop(&mut self) -> PipelineResult<()> {
        if self.granted.is_none() && !self.streaming {
            return Ok(());
        }
        let mode = self.device.mode();
        let mut first_error = None;

        if self.streaming {
            if let Err(e) = self.device.io_mut().stream_off(mode) {
                first_error.get_or_insert(PipelineError::queue(QueueOp::StreamOff, e));
            }
            self.streaming = false;
        }

        if self.granted.take().is_some() {
            if let Err(e) = self.device.io_mut().request_buffers(mode, 0) {
                first_error.get_or_insert(PipelineError::queue(QueueOp::RequestBuffers, e));
            }
        }

        for slot in &mut self.slots {
            slot.state = SlotState::Released;
        }
        debug!(slots = self.slots.len(), "Capture queue stopped");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot(&self, index: u32) -> Option<&BufferSlot> {
        self.slots.get(index as usize)
    }

    pub fn slot_mut(&mut self, index: u32) -> Option<&mut BufferSlot> {
        self.slots.get_mut(index as usize)
    }

    pub fn slots(&self) -> &[BufferSlot] {
        &self.slots
    }

    pub fn slots_mut(&mut self) -> &mut [BufferSlot] {
        &mut self.slots
    }
}

impl<D: CaptureIo> Drop for CaptureQueue<D> {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "Capture queue teardown failed");
        }
    }
}
