// SPDX-License-Identifier: GPL-3.0-only

//! Scripted stand-ins for the capture device, the heap and the GPU driver

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::ffi::CString;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use dmacam::PipelineError;
use dmacam::backends::dma_heap::{Allocator, BufferHandle};
use dmacam::backends::v4l2::sys;
use dmacam::backends::v4l2::{CaptureIo, CaptureMode, DequeuedBuffer, DeviceCaps, PlaneFormat, PlaneRef, RawFormat};
use dmacam::errors::PipelineResult;
use dmacam::gpu::formats;
use dmacam::gpu::{
    DriverError, FRAMEBUFFER_COMPLETE, GpuDriver, GpuFramebuffer, GpuImage, GpuRenderbuffer, GpuTexture,
};
use v4l::FourCC;

// ===== Capture device =====

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    RequestBuffers(u32),
    Queue(u32),
    Dequeue(u32),
    StreamOn,
    StreamOff,
}

#[derive(Debug, Default)]
pub struct DeviceState {
    pub capabilities: u32,
    pub width: u32,
    pub height: u32,
    pub fourcc: [u8; 4],
    /// Largest size the driver accepts
    pub max_size: Option<(u32, u32)>,
    /// Count the driver grants regardless of the request
    pub grant: Option<u32>,
    pub fail_set_format: bool,
    /// errno returned by VIDIOC_QUERYCAP
    pub querycap_error: Option<i32>,
    /// Report one memory plane per format plane on the multi-planar API
    pub split_planes: bool,
    /// errnos returned by the next QBUFs issued while streaming
    pub queue_errors: VecDeque<i32>,
    /// errnos returned by the next dequeues, before any buffer
    pub dequeue_errors: VecDeque<i32>,
    /// Index reported by the next dequeue instead of the queued one
    pub bogus_index: Option<u32>,
    pub queued: VecDeque<u32>,
    pub queue_calls: Vec<(u32, Vec<PlaneRef>)>,
    pub events: Vec<DeviceEvent>,
    pub sequence: u32,
    pub streaming: bool,
}

#[derive(Debug, Clone)]
pub struct FakeDevice {
    pub state: Rc<RefCell<DeviceState>>,
}

impl FakeDevice {
    pub fn new(capabilities: u32, width: u32, height: u32, fourcc: &[u8; 4]) -> Self {
        Self {
            state: Rc::new(RefCell::new(DeviceState {
                capabilities,
                width,
                height,
                fourcc: *fourcc,
                ..Default::default()
            })),
        }
    }

    pub fn single_planar(width: u32, height: u32, fourcc: &[u8; 4]) -> Self {
        Self::new(sys::V4L2_CAP_VIDEO_CAPTURE | sys::V4L2_CAP_STREAMING, width, height, fourcc)
    }

    pub fn multi_planar(width: u32, height: u32, fourcc: &[u8; 4]) -> Self {
        Self::new(sys::V4L2_CAP_VIDEO_CAPTURE_MPLANE | sys::V4L2_CAP_STREAMING, width, height, fourcc)
    }

    pub fn events(&self) -> Vec<DeviceEvent> {
        self.state.borrow().events.clone()
    }

    pub fn queue_count(&self) -> usize {
        self.state.borrow().queue_calls.len()
    }
}

/// Plane sizes a driver would report. A contiguous format is one plane on
/// either API; `split` emulates a driver that puts each plane in its own
/// memory.
pub fn planes_for(split: bool, width: u32, height: u32, fourcc: [u8; 4]) -> Vec<PlaneFormat> {
    let Some(info) = formats::lookup_v4l2(FourCC::new(&fourcc)) else {
        return vec![PlaneFormat {
            bytesperline: width * 2,
            sizeimage: width * height * 2,
        }];
    };
    let layouts = info.plane_layouts(width, height);
    let total = info.frame_size(width, height);
    if !split {
        return vec![PlaneFormat {
            bytesperline: layouts[0].pitch as u32,
            sizeimage: total as u32,
        }];
    }
    layouts
        .iter()
        .enumerate()
        .map(|(i, layout)| {
            let end = layouts.get(i + 1).map(|next| next.offset).unwrap_or(total);
            PlaneFormat {
                bytesperline: layout.pitch as u32,
                sizeimage: (end - layout.offset) as u32,
            }
        })
        .collect()
}

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

impl CaptureIo for FakeDevice {
    fn node(&self) -> &Path {
        Path::new("/dev/fake-video0")
    }

    fn query_caps(&mut self) -> io::Result<DeviceCaps> {
        let st = self.state.borrow();
        if let Some(code) = st.querycap_error {
            return Err(errno(code));
        }
        Ok(DeviceCaps {
            driver: "fake".into(),
            card: "Fake Camera".into(),
            bus_info: "platform:fake".into(),
            capabilities: st.capabilities,
        })
    }

    fn get_format(&mut self, mode: CaptureMode) -> io::Result<RawFormat> {
        let st = self.state.borrow();
        Ok(RawFormat {
            mode,
            width: st.width,
            height: st.height,
            pixel_format: FourCC::new(&st.fourcc),
            planes: planes_for(
                mode == CaptureMode::MultiPlanar && st.split_planes,
                st.width,
                st.height,
                st.fourcc,
            ),
        })
    }

    fn set_format(&mut self, format: &RawFormat) -> io::Result<()> {
        let mut st = self.state.borrow_mut();
        if st.fail_set_format {
            return Err(errno(libc::EINVAL));
        }
        let (max_w, max_h) = st.max_size.unwrap_or((u32::MAX, u32::MAX));
        st.width = format.width.min(max_w);
        st.height = format.height.min(max_h);
        st.fourcc = format.pixel_format.repr;
        Ok(())
    }

    fn request_buffers(&mut self, _mode: CaptureMode, count: u32) -> io::Result<u32> {
        let mut st = self.state.borrow_mut();
        st.events.push(DeviceEvent::RequestBuffers(count));
        if count == 0 {
            st.queued.clear();
            return Ok(0);
        }
        Ok(st.grant.unwrap_or(count))
    }

    fn queue_buffer(&mut self, _mode: CaptureMode, index: u32, planes: &[PlaneRef]) -> io::Result<()> {
        let mut st = self.state.borrow_mut();
        if st.streaming {
            if let Some(code) = st.queue_errors.pop_front() {
                return Err(errno(code));
            }
        }
        st.events.push(DeviceEvent::Queue(index));
        st.queue_calls.push((index, planes.to_vec()));
        st.queued.push_back(index);
        Ok(())
    }

    fn dequeue_buffer(&mut self, _mode: CaptureMode, _num_planes: usize) -> io::Result<DequeuedBuffer> {
        let mut st = self.state.borrow_mut();
        if let Some(code) = st.dequeue_errors.pop_front() {
            return Err(errno(code));
        }
        if !st.streaming {
            return Err(errno(libc::EINVAL));
        }
        let index = match st.bogus_index.take() {
            Some(index) => index,
            None => st.queued.pop_front().ok_or_else(|| errno(libc::EAGAIN))?,
        };
        st.events.push(DeviceEvent::Dequeue(index));
        st.sequence += 1;
        let (w, h, fourcc) = (st.width, st.height, st.fourcc);
        Ok(DequeuedBuffer {
            index,
            sequence: st.sequence,
            bytesused: planes_for(false, w, h, fourcc)[0].sizeimage,
            flags: 0,
        })
    }

    fn stream_on(&mut self, _mode: CaptureMode) -> io::Result<()> {
        let mut st = self.state.borrow_mut();
        st.events.push(DeviceEvent::StreamOn);
        st.streaming = true;
        Ok(())
    }

    fn stream_off(&mut self, _mode: CaptureMode) -> io::Result<()> {
        let mut st = self.state.borrow_mut();
        st.events.push(DeviceEvent::StreamOff);
        st.streaming = false;
        Ok(())
    }

    fn wait_readable(&mut self, _timeout: Option<Duration>) -> io::Result<bool> {
        let st = self.state.borrow();
        Ok(!st.queued.is_empty() || !st.dequeue_errors.is_empty() || st.bogus_index.is_some())
    }
}

// ===== Allocator =====

/// Inode of an open fd, `None` when the fd is closed
pub fn inode_of(fd: RawFd) -> Option<u64> {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    let result = unsafe { libc::fstat(fd, &mut stat) };
    (result == 0).then_some(stat.st_ino as u64)
}

/// Whether `fd` still refers to the file it referred to at allocation time
pub fn still_open(fd: RawFd, inode: u64) -> bool {
    inode_of(fd) == Some(inode)
}

#[derive(Debug, Default)]
pub struct AllocState {
    pub attempts: usize,
    /// 1-based attempt that is refused
    pub fail_on: Option<usize>,
    /// (fd, inode, size) of every buffer handed out
    pub handed_out: Vec<(RawFd, u64, usize)>,
}

#[derive(Debug, Clone, Default)]
pub struct FakeAllocator {
    pub state: Rc<RefCell<AllocState>>,
}

impl FakeAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(attempt: usize) -> Self {
        let alloc = Self::default();
        alloc.state.borrow_mut().fail_on = Some(attempt);
        alloc
    }

    pub fn handed_out(&self) -> Vec<(RawFd, u64, usize)> {
        self.state.borrow().handed_out.clone()
    }
}

impl Allocator for FakeAllocator {
    fn allocate(&mut self, size: usize) -> PipelineResult<BufferHandle> {
        let mut st = self.state.borrow_mut();
        st.attempts += 1;
        if st.fail_on == Some(st.attempts) {
            return Err(PipelineError::AllocationFailed {
                size,
                source: errno(libc::ENOMEM),
            });
        }

        let name = CString::new("dmacam-test").map_err(|_| PipelineError::AllocationFailed {
            size,
            source: errno(libc::EINVAL),
        })?;
        let raw = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
        if raw < 0 {
            return Err(PipelineError::AllocationFailed {
                size,
                source: io::Error::last_os_error(),
            });
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        if unsafe { libc::ftruncate(raw, size as libc::off_t) } < 0 {
            return Err(PipelineError::AllocationFailed {
                size,
                source: io::Error::last_os_error(),
            });
        }

        let inode = inode_of(raw).unwrap_or_default();
        st.handed_out.push((raw, inode, size));
        Ok(BufferHandle::new(fd, size))
    }
}

// ===== GPU driver =====

#[derive(Debug)]
pub struct GpuState {
    next_name: u32,
    /// Every driver call, in order
    pub calls: Vec<&'static str>,
    pub attribs: Vec<Vec<i64>>,
    /// Live images with the (fd, inode) pairs they were built from
    pub live_images: HashMap<usize, Vec<(RawFd, u64)>>,
    pub live_renderbuffers: HashSet<u32>,
    pub live_framebuffers: HashSet<u32>,
    pub live_textures: HashSet<u32>,
    pub images_created: usize,
    pub images_destroyed: usize,
    /// Images destroyed after one of their fds had already been closed
    pub destroyed_after_close: usize,
    pub fail_image: Option<u32>,
    pub fail_storage: Option<u32>,
    pub fail_attach: Option<u32>,
    pub fail_texture: Option<u32>,
    pub status: u32,
}

impl Default for GpuState {
    fn default() -> Self {
        Self {
            next_name: 1,
            calls: Vec::new(),
            attribs: Vec::new(),
            live_images: HashMap::new(),
            live_renderbuffers: HashSet::new(),
            live_framebuffers: HashSet::new(),
            live_textures: HashSet::new(),
            images_created: 0,
            images_destroyed: 0,
            destroyed_after_close: 0,
            fail_image: None,
            fail_storage: None,
            fail_attach: None,
            fail_texture: None,
            status: FRAMEBUFFER_COMPLETE,
        }
    }
}

impl GpuState {
    fn name(&mut self) -> u32 {
        let name = self.next_name;
        self.next_name += 1;
        name
    }

    pub fn live_objects(&self) -> usize {
        self.live_images.len()
            + self.live_renderbuffers.len()
            + self.live_framebuffers.len()
            + self.live_textures.len()
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeGpu {
    pub state: Rc<RefCell<GpuState>>,
}

impl FakeGpu {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call_count(&self) -> usize {
        self.state.borrow().calls.len()
    }
}

/// Plane fds named in an attribute list
fn plane_fds(attribs: &[i64]) -> Vec<RawFd> {
    attribs
        .chunks_exact(2)
        .filter(|pair| matches!(pair[0], 0x3272 | 0x3275 | 0x3278))
        .map(|pair| pair[1] as RawFd)
        .collect()
}

impl GpuDriver for FakeGpu {
    fn create_image(&mut self, attribs: &[i64]) -> Result<GpuImage, DriverError> {
        let mut st = self.state.borrow_mut();
        st.calls.push("create_image");
        st.attribs.push(attribs.to_vec());
        if let Some(code) = st.fail_image {
            return Err(DriverError(code));
        }
        let handle = st.name() as usize;
        let fds = plane_fds(attribs)
            .into_iter()
            .map(|fd| (fd, inode_of(fd).unwrap_or_default()))
            .collect();
        st.live_images.insert(handle, fds);
        st.images_created += 1;
        Ok(GpuImage(handle))
    }

    fn destroy_image(&mut self, image: GpuImage) {
        let mut st = self.state.borrow_mut();
        st.calls.push("destroy_image");
        if let Some(fds) = st.live_images.remove(&image.0) {
            if fds.iter().any(|&(fd, inode)| !still_open(fd, inode)) {
                st.destroyed_after_close += 1;
            }
            st.images_destroyed += 1;
        }
    }

    fn create_renderbuffer(&mut self) -> Result<GpuRenderbuffer, DriverError> {
        let mut st = self.state.borrow_mut();
        st.calls.push("create_renderbuffer");
        let name = st.name();
        st.live_renderbuffers.insert(name);
        Ok(GpuRenderbuffer(name))
    }

    fn renderbuffer_storage_from_image(
        &mut self,
        _renderbuffer: GpuRenderbuffer,
        image: GpuImage,
    ) -> Result<(), DriverError> {
        let mut st = self.state.borrow_mut();
        st.calls.push("renderbuffer_storage_from_image");
        if let Some(code) = st.fail_storage {
            return Err(DriverError(code));
        }
        if !st.live_images.contains_key(&image.0) {
            return Err(DriverError(0x0501));
        }
        Ok(())
    }

    fn delete_renderbuffer(&mut self, renderbuffer: GpuRenderbuffer) {
        let mut st = self.state.borrow_mut();
        st.calls.push("delete_renderbuffer");
        st.live_renderbuffers.remove(&renderbuffer.0);
    }

    fn create_framebuffer(&mut self) -> Result<GpuFramebuffer, DriverError> {
        let mut st = self.state.borrow_mut();
        st.calls.push("create_framebuffer");
        let name = st.name();
        st.live_framebuffers.insert(name);
        Ok(GpuFramebuffer(name))
    }

    fn attach_color(
        &mut self,
        _framebuffer: GpuFramebuffer,
        _renderbuffer: GpuRenderbuffer,
    ) -> Result<(), DriverError> {
        let mut st = self.state.borrow_mut();
        st.calls.push("attach_color");
        match st.fail_attach {
            Some(code) => Err(DriverError(code)),
            None => Ok(()),
        }
    }

    fn framebuffer_status(&mut self, _framebuffer: GpuFramebuffer) -> u32 {
        let mut st = self.state.borrow_mut();
        st.calls.push("framebuffer_status");
        st.status
    }

    fn delete_framebuffer(&mut self, framebuffer: GpuFramebuffer) {
        let mut st = self.state.borrow_mut();
        st.calls.push("delete_framebuffer");
        st.live_framebuffers.remove(&framebuffer.0);
    }

    fn create_texture(&mut self) -> Result<GpuTexture, DriverError> {
        let mut st = self.state.borrow_mut();
        st.calls.push("create_texture");
        let name = st.name();
        st.live_textures.insert(name);
        Ok(GpuTexture(name))
    }

    fn texture_from_image(&mut self, _texture: GpuTexture, _image: GpuImage) -> Result<(), DriverError> {
        let mut st = self.state.borrow_mut();
        st.calls.push("texture_from_image");
        match st.fail_texture {
            Some(code) => Err(DriverError(code)),
            None => Ok(()),
        }
    }

    fn delete_texture(&mut self, texture: GpuTexture) {
        let mut st = self.state.borrow_mut();
        st.calls.push("delete_texture");
        st.live_textures.remove(&texture.0);
    }

    fn finish(&mut self) {
        self.state.borrow_mut().calls.push("finish");
    }
}
