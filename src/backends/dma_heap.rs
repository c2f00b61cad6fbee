// SPDX-License-Identifier: GPL-3.0-only

//! dma-heap allocator and dma-buf handles
//!
//! Buffers come from a kernel dma-heap and are passed by file descriptor to
//! both the capture driver and the GPU driver. A [`BufferPool`] owns the
//! handles independently of either consumer.

use std::ffi::CString;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info, warn};

use crate::errors::{PipelineError, PipelineResult};

/// _IOWR('H', 0, struct dma_heap_allocation_data) - 24 bytes
const DMA_HEAP_IOCTL_ALLOC: libc::c_ulong = 0xc018_4800;
/// _IOW('b', 0, struct dma_buf_sync)
const DMA_BUF_IOCTL_SYNC: libc::c_ulong = 0x4008_6200;
/// _IOW('b', 1, const char *)
const DMA_BUF_SET_NAME: libc::c_ulong = 0x4008_6201;

const DMA_BUF_SYNC_READ: u64 = 1 << 0;
const DMA_BUF_SYNC_WRITE: u64 = 2 << 0;
const DMA_BUF_SYNC_START: u64 = 0 << 2;
const DMA_BUF_SYNC_END: u64 = 1 << 2;

/// Longest name accepted by DMA_BUF_SET_NAME (DMA_BUF_NAME_LEN - 1)
const DMA_BUF_NAME_MAX: usize = 31;

#[repr(C)]
struct DmaHeapAllocationData {
    len: u64,
    fd: u32,
    fd_flags: u32,
    heap_flags: u64,
}

#[repr(C)]
struct DmaBufSync {
    flags: u64,
}

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a buffer handle; fd numbers get reused after
/// close, ids do not
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

impl BufferId {
    pub fn next() -> Self {
        Self(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Direction of a CPU access to a dma-buf
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAccess {
    Read,
    Write,
    ReadWrite,
}

impl SyncAccess {
    fn flags(&self) -> u64 {
        match self {
            SyncAccess::Read => DMA_BUF_SYNC_READ,
            SyncAccess::Write => DMA_BUF_SYNC_WRITE,
            SyncAccess::ReadWrite => DMA_BUF_SYNC_READ | DMA_BUF_SYNC_WRITE,
        }
    }
}

/// An owned shareable memory region. Closed exactly once, on drop.
#[derive(Debug)]
pub struct BufferHandle {
    id: BufferId,
    fd: OwnedFd,
    size: usize,
}

impl BufferHandle {
    pub fn new(fd: OwnedFd, size: usize) -> Self {
        Self {
            id: BufferId::next(),
            fd,
            size,
        }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Lightweight reference for the capture queue and importer
    pub fn buffer_ref(&self) -> BufferRef {
        BufferRef {
            id: self.id,
            fd: self.fd.as_raw_fd(),
            size: self.size,
        }
    }

    /// Best-effort debug name visible in /sys/kernel/debug/dma_buf/bufinfo
    pub fn set_name(&self, name: &str) {
        let truncated: String = name.chars().take(DMA_BUF_NAME_MAX).collect();
        let Ok(c_name) = CString::new(truncated) else {
            return;
        };
        let result = unsafe { libc::ioctl(self.fd.as_raw_fd(), DMA_BUF_SET_NAME as _, c_name.as_ptr()) };
        if result < 0 {
            debug!(
                id = %self.id,
                error = %io::Error::last_os_error(),
                "DMA_BUF_SET_NAME not supported"
            );
        }
    }

    fn sync(&self, access: SyncAccess, phase: u64) -> io::Result<()> {
        let mut sync = DmaBufSync {
            flags: access.flags() | phase,
        };
        loop {
            let result = unsafe {
                libc::ioctl(
                    self.fd.as_raw_fd(),
                    DMA_BUF_IOCTL_SYNC as _,
                    &mut sync as *mut DmaBufSync,
                )
            };
            if result == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
                // Not a dma-buf (e.g. memfd): no cache maintenance to do
                Some(libc::ENOTTY) => return Ok(()),
                _ => return Err(err),
            }
        }
    }

    /// Map the buffer into the process address space
    pub fn map(&self) -> io::Result<MappedBuffer<'_>> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                self.size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;
        Ok(MappedBuffer { handle: self, ptr })
    }
}

impl AsFd for BufferHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Copyable view of a pool buffer, valid while the pool keeps the handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRef {
    pub id: BufferId,
    pub fd: RawFd,
    pub size: usize,
}

/// A CPU mapping of a dma-buf, unmapped on drop
pub struct MappedBuffer<'a> {
    handle: &'a BufferHandle,
    ptr: NonNull<u8>,
}

impl MappedBuffer<'_> {
    /// Start a CPU access window; the matching end sync is issued when the
    /// guard drops
    pub fn begin_access(&self, access: SyncAccess) -> io::Result<CpuAccess<'_>> {
        self.handle.sync(access, DMA_BUF_SYNC_START)?;
        Ok(CpuAccess {
            mapping: self,
            access,
        })
    }
}

impl Drop for MappedBuffer<'_> {
    fn drop(&mut self) {
        let result = unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.handle.size) };
        if result < 0 {
            warn!(id = %self.handle.id, error = %io::Error::last_os_error(), "munmap failed");
        }
    }
}

/// Bracketed CPU access to a mapped dma-buf
pub struct CpuAccess<'a> {
    mapping: &'a MappedBuffer<'a>,
    access: SyncAccess,
}

impl CpuAccess<'_> {
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: the mapping spans `size` bytes and outlives this guard
        unsafe { std::slice::from_raw_parts(self.mapping.ptr.as_ptr(), self.mapping.handle.size) }
    }
}

impl Drop for CpuAccess<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.mapping.handle.sync(self.access, DMA_BUF_SYNC_END) {
            warn!(id = %self.mapping.handle.id, error = %e, "DMA_BUF_IOCTL_SYNC end failed");
        }
    }
}

/// Source of shareable buffers
pub trait Allocator {
    fn allocate(&mut self, size: usize) -> PipelineResult<BufferHandle>;
}

/// An open dma-heap device node
#[derive(Debug)]
pub struct DmaHeap {
    file: File,
    path: PathBuf,
}

impl DmaHeap {
    /// Open the first heap node that can be opened, in order
    pub fn open<P: AsRef<Path>>(candidates: &[P]) -> PipelineResult<Self> {
        for candidate in candidates {
            let path = candidate.as_ref();
            match OpenOptions::new().read(true).write(true).open(path) {
                Ok(file) => {
                    info!(heap = %path.display(), "Opened dma-heap");
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                    });
                }
                Err(e) => debug!(heap = %path.display(), error = %e, "dma-heap not available"),
            }
        }

        Err(PipelineError::HeapUnavailable {
            tried: candidates.iter().map(|p| p.as_ref().to_path_buf()).collect(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Allocator for DmaHeap {
    fn allocate(&mut self, size: usize) -> PipelineResult<BufferHandle> {
        let mut data = DmaHeapAllocationData {
            len: size as u64,
            fd: 0,
            fd_flags: (libc::O_CLOEXEC | libc::O_RDWR) as u32,
            heap_flags: 0,
        };

        let result = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                DMA_HEAP_IOCTL_ALLOC as _,
                &mut data as *mut DmaHeapAllocationData,
            )
        };
        if result < 0 {
            return Err(PipelineError::AllocationFailed {
                size,
                source: io::Error::last_os_error(),
            });
        }

        // SAFETY: the kernel returned a fresh fd that nothing else owns
        let fd = unsafe { OwnedFd::from_raw_fd(data.fd as RawFd) };
        Ok(BufferHandle::new(fd, size))
    }
}

/// A fixed set of buffer handles, released in reverse acquisition order
#[derive(Debug, Default)]
pub struct BufferPool {
    label: &'static str,
    buffers: Vec<BufferHandle>,
}

impl BufferPool {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            buffers: Vec::new(),
        }
    }

    /// Allocate until the pool holds `count` buffers of `size` bytes.
    ///
    /// Stops at the first refusal; buffers acquired before it stay in the
    /// pool so the caller decides when to release them.
    pub fn fill<A: Allocator + ?Sized>(&mut self, allocator: &mut A, count: usize, size: usize) -> PipelineResult<()> {
        while self.buffers.len() < count {
            let index = self.buffers.len();
            let handle = match allocator.allocate(size) {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(pool = self.label, index, size, error = %e, "Buffer allocation failed");
                    return Err(e);
                }
            };
            handle.set_name(&format!("dmacam-{}-{}", self.label, index));
            debug!(pool = self.label, index, id = %handle.id(), size, "Allocated dma-buf");
            self.buffers.push(handle);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&BufferHandle> {
        self.buffers.get(index)
    }

    pub fn refs(&self) -> Vec<BufferRef> {
        self.buffers.iter().map(BufferHandle::buffer_ref).collect()
    }

    /// Release buffers beyond the first `len`
    pub fn truncate(&mut self, len: usize) {
        while self.buffers.len() > len {
            if let Some(handle) = self.buffers.pop() {
                debug!(pool = self.label, id = %handle.id(), "Releasing dma-buf");
            }
        }
    }

    /// Close every handle, newest first
    pub fn release(&mut self) {
        self.truncate(0);
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        self.release();
    }
}
