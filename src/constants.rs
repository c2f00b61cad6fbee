// SPDX-License-Identifier: GPL-3.0-only

//! Application-wide constants

use std::time::Duration;

/// dma-heap nodes probed in order.
///
/// A CMA area configured from a device tree node shows up as `linux,cma`,
/// otherwise the reserved region is exposed as `reserved`.
pub const DMA_HEAP_PATHS: [&str; 2] = ["/dev/dma_heap/linux,cma", "/dev/dma_heap/reserved"];

/// Generic system heap, appended to the default config for hosts without CMA
pub const DMA_HEAP_SYSTEM_PATH: &str = "/dev/dma_heap/system";

/// Default capture device node
pub const DEFAULT_DEVICE: &str = "/dev/video0";

/// Default capture resolution
pub const DEFAULT_WIDTH: u32 = 1920;
pub const DEFAULT_HEIGHT: u32 = 1536;

/// Default capture pixel format (V4L2 fourcc)
pub const DEFAULT_PIXEL_FORMAT: &str = "NV12";

/// Number of capture buffers cycled through the device queue
pub const DEFAULT_BUFFER_COUNT: u32 = 3;

/// Number of GPU render targets in the output pool
pub const DEFAULT_OUTPUT_COUNT: u32 = 2;

/// Default output surface format (DRM fourcc)
pub const DEFAULT_OUTPUT_FORMAT: &str = "RA24";

/// Default output surface size
pub const DEFAULT_OUTPUT_WIDTH: u32 = 640;
pub const DEFAULT_OUTPUT_HEIGHT: u32 = 640;

/// Poll interval while waiting for a filled buffer; the stop flag is checked
/// between polls
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(250);

/// Maximum number of planes in a V4L2 multi-planar buffer
pub const VIDEO_MAX_PLANES: usize = 8;

/// Config directory name under the XDG config dir
pub const CONFIG_DIR_NAME: &str = "dmacam";

/// Config file name inside [`CONFIG_DIR_NAME`]
pub const CONFIG_FILE_NAME: &str = "config.json";
