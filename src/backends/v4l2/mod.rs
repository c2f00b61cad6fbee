// SPDX-License-Identifier: GPL-3.0-only

//! V4L2 capture over DMABUF memory

pub mod device;
pub mod io;
pub mod queue;
pub mod sys;

pub use device::{CaptureDevice, CaptureFormat, FormatRequest};
pub use io::{CaptureIo, CaptureMode, DequeuedBuffer, DeviceCaps, PlaneFormat, PlaneRef, RawFormat, V4l2Fd};
pub use queue::{BufferSlot, CaptureQueue, SlotState};
