// SPDX-License-Identifier: GPL-3.0-only

//! Kernel-facing backends: the V4L2 capture device and the dma-heap allocator

pub mod dma_heap;
pub mod v4l2;
