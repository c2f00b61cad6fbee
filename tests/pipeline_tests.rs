// SPDX-License-Identifier: GPL-3.0-only

//! End-to-end tests of the capture pipeline over fake device, heap and GPU

mod common;

use common::{DeviceEvent, FakeAllocator, FakeDevice, FakeGpu, still_open};
use dmacam::PipelineError;
use dmacam::backends::dma_heap::BufferPool;
use dmacam::backends::v4l2::{CaptureDevice, FormatRequest, SlotState};
use dmacam::errors::{PipelineResult, QueueOp};
use dmacam::gpu::{DrmFourcc, RenderSurface};
use dmacam::pipelines::{CapturePipeline, CapturedFrame, LoopAction, PipelineOptions};
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use v4l::FourCC;

fn options(buffer_count: u32) -> PipelineOptions {
    PipelineOptions {
        buffer_count,
        output_count: 2,
        output_format: DrmFourcc::RGBA8888,
        output_width: 64,
        output_height: 64,
        poll_timeout: None,
    }
}

fn nv12_device(fake: &FakeDevice, width: u32, height: u32) -> CaptureDevice<FakeDevice> {
    let request = FormatRequest {
        width,
        height,
        pixel_format: Some(FourCC::new(b"NV12")),
    };
    CaptureDevice::with_io(fake.clone(), request).unwrap()
}

fn continue_stage(_: &mut FakeGpu, _: &CapturedFrame<'_>, _: &RenderSurface) -> PipelineResult<LoopAction> {
    Ok(LoopAction::Continue)
}

#[test]
fn test_thirty_cycles_import_each_slot_once() {
    let fake = FakeDevice::multi_planar(1920, 1536, b"NV12");
    let alloc = FakeAllocator::new();
    let gpu = FakeGpu::new();
    let mut pipeline =
        CapturePipeline::setup(nv12_device(&fake, 1920, 1536), alloc.clone(), gpu.clone(), options(3)).unwrap();

    let mut per_slot: HashMap<u32, u32> = HashMap::new();
    let mut images = Vec::new();
    let mut stage = |_: &mut FakeGpu, frame: &CapturedFrame<'_>, _: &RenderSurface| -> PipelineResult<LoopAction> {
        *per_slot.entry(frame.slot).or_default() += 1;
        if !images.contains(&frame.image.image) {
            images.push(frame.image.image);
        }
        assert_eq!(frame.image.planes[1].offset, 2_949_120);
        Ok(LoopAction::Continue)
    };

    let stats = pipeline.run(&mut stage, &AtomicBool::new(false), Some(30)).unwrap();
    assert_eq!(stats.frames, 30);
    assert_eq!(stats.imports, 3);
    assert_eq!(images.len(), 3);
    assert_eq!(per_slot.len(), 3);
    assert!(per_slot.values().all(|&n| n == 10));

    // 3 capture images plus one per output surface
    assert_eq!(gpu.state.borrow().images_created, 3 + 2);
    assert!(pipeline.queue().slots().iter().all(|s| s.state == SlotState::QueuedToDevice));

    pipeline.shutdown().unwrap();
    let events = fake.events();
    let tail: Vec<_> = events.iter().rev().take(2).rev().copied().collect();
    assert_eq!(tail, vec![DeviceEvent::StreamOff, DeviceEvent::RequestBuffers(0)]);
    assert_eq!(events.iter().filter(|e| matches!(e, DeviceEvent::Dequeue(_))).count(), 30);

    let st = gpu.state.borrow();
    assert_eq!(st.live_objects(), 0);
    assert_eq!(st.images_destroyed, 5);
    assert_eq!(st.destroyed_after_close, 0);
    drop(st);

    for (fd, inode, _) in alloc.handed_out() {
        assert!(!still_open(fd, inode));
    }
}

#[test]
fn test_allocation_failure_on_second_buffer() {
    let fake = FakeDevice::single_planar(1920, 1536, b"NV12");
    let alloc = FakeAllocator::failing_on(2);
    let gpu = FakeGpu::new();

    let result = CapturePipeline::setup(nv12_device(&fake, 1920, 1536), alloc.clone(), gpu.clone(), options(3));
    assert!(matches!(result, Err(PipelineError::AllocationFailed { .. })));

    assert_eq!(alloc.state.borrow().attempts, 2);
    assert_eq!(fake.queue_count(), 0);
    assert!(!fake.events().contains(&DeviceEvent::StreamOn));
    assert_eq!(gpu.call_count(), 0);
    // Buffer 1 was closed when setup unwound
    let (fd, inode, _) = alloc.handed_out()[0];
    assert!(!still_open(fd, inode));
}

#[test]
fn test_pool_keeps_first_buffer_after_failed_fill() {
    let mut alloc = FakeAllocator::failing_on(2);
    let mut pool = BufferPool::new("capture");

    let result = pool.fill(&mut alloc, 3, 4096);
    assert!(matches!(result, Err(PipelineError::AllocationFailed { size: 4096, .. })));
    assert_eq!(pool.len(), 1);

    let (fd, inode, size) = alloc.handed_out()[0];
    assert_eq!(size, 4096);
    assert!(still_open(fd, inode));
    assert_eq!(pool.get(0).unwrap().buffer_ref().fd, fd);

    pool.release();
    assert!(pool.is_empty());
    assert!(!still_open(fd, inode));
}

#[test]
fn test_fewer_granted_buffers_trims_pool() {
    let fake = FakeDevice::single_planar(640, 480, b"NV12");
    fake.state.borrow_mut().grant = Some(2);
    let alloc = FakeAllocator::new();

    let pipeline = CapturePipeline::setup(nv12_device(&fake, 640, 480), alloc.clone(), FakeGpu::new(), options(4))
        .unwrap();
    assert_eq!(pipeline.queue().len(), 2);
    assert_eq!(fake.queue_count(), 2);

    // 4 capture buffers then 2 output buffers; the last two capture buffers
    // were released after the grant
    let handed_out = alloc.handed_out();
    assert_eq!(handed_out.len(), 6);
    assert!(still_open(handed_out[0].0, handed_out[0].1));
    assert!(!still_open(handed_out[3].0, handed_out[3].1));
}

#[test]
fn test_more_granted_buffers_allocates_extra() {
    let fake = FakeDevice::single_planar(640, 480, b"NV12");
    fake.state.borrow_mut().grant = Some(5);
    let alloc = FakeAllocator::new();

    let pipeline = CapturePipeline::setup(nv12_device(&fake, 640, 480), alloc.clone(), FakeGpu::new(), options(3))
        .unwrap();
    assert_eq!(pipeline.queue().len(), 5);
    assert_eq!(fake.queue_count(), 5);
    assert_eq!(alloc.state.borrow().attempts, 5 + 2);
}

#[test]
fn test_transient_errors_are_retried() {
    let fake = FakeDevice::single_planar(640, 480, b"NV12");
    let mut pipeline =
        CapturePipeline::setup(nv12_device(&fake, 640, 480), FakeAllocator::new(), FakeGpu::new(), options(3))
            .unwrap();
    fake.state.borrow_mut().dequeue_errors.extend([libc::EAGAIN, libc::EINTR, libc::EAGAIN]);

    let stats = pipeline
        .run(&mut continue_stage, &AtomicBool::new(false), Some(4))
        .unwrap();
    assert_eq!(stats.frames, 4);
    assert_eq!(stats.transient_retries, 3);
}

#[test]
fn test_interrupted_requeue_is_retried() {
    let fake = FakeDevice::single_planar(640, 480, b"NV12");
    let mut pipeline =
        CapturePipeline::setup(nv12_device(&fake, 640, 480), FakeAllocator::new(), FakeGpu::new(), options(3))
            .unwrap();
    fake.state.borrow_mut().queue_errors.extend([libc::EINTR, libc::EAGAIN]);

    let stats = pipeline
        .run(&mut continue_stage, &AtomicBool::new(false), Some(5))
        .unwrap();
    assert_eq!(stats.frames, 5);
    assert_eq!(stats.transient_retries, 2);
    // No slot is lost to the failed QBUF
    assert!(pipeline.queue().slots().iter().all(|s| s.state == SlotState::QueuedToDevice));
    let again = pipeline
        .run(&mut continue_stage, &AtomicBool::new(false), Some(6))
        .unwrap();
    assert_eq!(again.frames, 6);
}

#[test]
fn test_fatal_requeue_error_aborts_loop() {
    let fake = FakeDevice::single_planar(640, 480, b"NV12");
    let mut pipeline =
        CapturePipeline::setup(nv12_device(&fake, 640, 480), FakeAllocator::new(), FakeGpu::new(), options(3))
            .unwrap();
    fake.state.borrow_mut().queue_errors.push_back(libc::EINVAL);

    let result = pipeline.run(&mut continue_stage, &AtomicBool::new(false), Some(5));
    assert!(matches!(
        result,
        Err(PipelineError::QueueOperationFailed { op: QueueOp::Queue, .. })
    ));
}

#[test]
fn test_fatal_error_aborts_loop() {
    let fake = FakeDevice::single_planar(640, 480, b"NV12");
    let gpu = FakeGpu::new();
    let mut pipeline =
        CapturePipeline::setup(nv12_device(&fake, 640, 480), FakeAllocator::new(), gpu.clone(), options(3)).unwrap();
    fake.state.borrow_mut().dequeue_errors.push_back(libc::EIO);

    let result = pipeline.run(&mut continue_stage, &AtomicBool::new(false), Some(10));
    assert!(matches!(
        result,
        Err(PipelineError::QueueOperationFailed { op: QueueOp::Dequeue, .. })
    ));

    drop(pipeline);
    assert_eq!(gpu.state.borrow().live_objects(), 0);
    assert!(!fake.state.borrow().streaming);
}

#[test]
fn test_stop_flag_checked_before_dequeue() {
    let fake = FakeDevice::single_planar(640, 480, b"NV12");
    let mut pipeline =
        CapturePipeline::setup(nv12_device(&fake, 640, 480), FakeAllocator::new(), FakeGpu::new(), options(2))
            .unwrap();

    let stats = pipeline.run(&mut continue_stage, &AtomicBool::new(true), None).unwrap();
    assert_eq!(stats, Default::default());
    assert!(!fake.events().iter().any(|e| matches!(e, DeviceEvent::Dequeue(_))));
}

#[test]
fn test_stage_can_stop_loop() {
    let fake = FakeDevice::single_planar(640, 480, b"NV12");
    let mut pipeline =
        CapturePipeline::setup(nv12_device(&fake, 640, 480), FakeAllocator::new(), FakeGpu::new(), options(2))
            .unwrap();

    let mut outputs = Vec::new();
    let mut stage = |_: &mut FakeGpu, frame: &CapturedFrame<'_>, out: &RenderSurface| -> PipelineResult<LoopAction> {
        outputs.push(out.framebuffer);
        Ok(if frame.sequence >= 3 {
            LoopAction::Stop
        } else {
            LoopAction::Continue
        })
    };
    let stats = pipeline.run(&mut stage, &AtomicBool::new(false), None).unwrap();
    assert_eq!(stats.frames, 3);
    // Output surfaces are used round-robin
    assert_eq!(outputs[0], outputs[2]);
    assert_ne!(outputs[0], outputs[1]);
    assert_eq!(pipeline.last_output(), Some(0));
}

#[test]
fn test_output_bind_failure_unwinds_setup() {
    let fake = FakeDevice::single_planar(640, 480, b"NV12");
    let alloc = FakeAllocator::new();
    let gpu = FakeGpu::new();
    gpu.state.borrow_mut().status = 0x8CDD;

    let result = CapturePipeline::setup(nv12_device(&fake, 640, 480), alloc.clone(), gpu.clone(), options(3));
    assert!(matches!(result, Err(PipelineError::FramebufferIncomplete { status: 0x8CDD })));

    assert_eq!(fake.queue_count(), 0);
    assert_eq!(fake.events().last(), Some(&DeviceEvent::RequestBuffers(0)));
    let st = gpu.state.borrow();
    assert_eq!(st.live_objects(), 0);
    assert_eq!(st.destroyed_after_close, 0);
    drop(st);
    for (fd, inode, _) in alloc.handed_out() {
        assert!(!still_open(fd, inode));
    }
}

#[test]
fn test_unsupported_capture_format_fails_before_allocation() {
    let fake = FakeDevice::single_planar(640, 480, b"MJPG");
    let request = FormatRequest {
        width: 640,
        height: 480,
        pixel_format: None,
    };
    let device = CaptureDevice::with_io(fake.clone(), request).unwrap();
    let alloc = FakeAllocator::new();

    let result = CapturePipeline::setup(device, alloc.clone(), FakeGpu::new(), options(3));
    assert!(matches!(result, Err(PipelineError::UnsupportedPixelFormat(f)) if f == DrmFourcc::from_bytes(b"MJPG")));
    assert_eq!(alloc.state.borrow().attempts, 0);
    assert!(fake.events().is_empty());
}

#[test]
fn test_separate_plane_memory_fails_before_allocation() {
    let fake = FakeDevice::multi_planar(1920, 1536, b"NV12");
    fake.state.borrow_mut().split_planes = true;
    let alloc = FakeAllocator::new();
    let gpu = FakeGpu::new();

    let result = CapturePipeline::setup(nv12_device(&fake, 1920, 1536), alloc.clone(), gpu.clone(), options(3));
    assert!(matches!(result, Err(PipelineError::UnsupportedPixelFormat(f)) if f == DrmFourcc::NV12));
    assert_eq!(alloc.state.borrow().attempts, 0);
    assert_eq!(gpu.call_count(), 0);
    assert!(fake.events().is_empty());
}

#[test]
fn test_multi_planar_slots_match_imported_offsets() {
    let fake = FakeDevice::multi_planar(1920, 1536, b"NV12");
    let mut pipeline =
        CapturePipeline::setup(nv12_device(&fake, 1920, 1536), FakeAllocator::new(), FakeGpu::new(), options(2))
            .unwrap();

    let mut stage = |_: &mut FakeGpu, frame: &CapturedFrame<'_>, _: &RenderSurface| -> PipelineResult<LoopAction> {
        let chroma = frame.image.planes[1];
        assert_eq!(chroma.fd, frame.image.planes[0].fd);
        // The queued descriptor covers the chroma plane the GPU samples
        let (_, planes) = fake.state.borrow().queue_calls[frame.slot as usize].clone();
        assert_eq!(planes.len(), 1);
        assert_eq!(planes[0].fd, chroma.fd);
        assert!(planes[0].length as u64 >= chroma.offset + 1_474_560);
        Ok(LoopAction::Continue)
    };
    let stats = pipeline.run(&mut stage, &AtomicBool::new(false), Some(2)).unwrap();
    assert_eq!(stats.frames, 2);
}

#[test]
fn test_read_output_brackets_cpu_access() {
    let fake = FakeDevice::single_planar(640, 480, b"NV12");
    let gpu = FakeGpu::new();
    let mut pipeline =
        CapturePipeline::setup(nv12_device(&fake, 640, 480), FakeAllocator::new(), gpu.clone(), options(2)).unwrap();

    assert_eq!(pipeline.last_output(), None);
    let bytes = pipeline.read_output(1).unwrap();
    assert_eq!(bytes.len(), 64 * 64 * 4);
    assert!(bytes.iter().all(|&b| b == 0));
    assert_eq!(gpu.state.borrow().calls.last(), Some(&"finish"));

    assert!(matches!(
        pipeline.read_output(9),
        Err(PipelineError::BufferAccessFailed(_))
    ));
}
