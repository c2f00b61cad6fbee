// SPDX-License-Identifier: GPL-3.0-only

//! Pipeline configuration
//!
//! Read from `$XDG_CONFIG_HOME/dmacam/config.json` (or an explicit path),
//! with every field optional. Command-line flags override file values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use v4l::FourCC;

use crate::backends::v4l2::FormatRequest;
use crate::constants::{
    CONFIG_DIR_NAME, CONFIG_FILE_NAME, DEFAULT_BUFFER_COUNT, DEFAULT_DEVICE, DEFAULT_HEIGHT, DEFAULT_OUTPUT_COUNT,
    DEFAULT_OUTPUT_FORMAT, DEFAULT_OUTPUT_HEIGHT, DEFAULT_OUTPUT_WIDTH, DEFAULT_PIXEL_FORMAT, DEFAULT_POLL_TIMEOUT,
    DEFAULT_WIDTH, DMA_HEAP_PATHS, DMA_HEAP_SYSTEM_PATH,
};
use crate::errors::{PipelineError, PipelineResult};
use crate::gpu::DrmFourcc;
use crate::pipelines::PipelineOptions;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Capture device node
    pub device: PathBuf,
    /// Requested capture width, 0 keeps the driver's value
    pub width: u32,
    /// Requested capture height, 0 keeps the driver's value
    pub height: u32,
    /// V4L2 fourcc such as "NV12"; empty keeps the driver's format
    pub pixel_format: String,
    /// dma-heap nodes, probed in order
    pub heap_paths: Vec<PathBuf>,
    pub buffer_count: u32,
    pub output_count: u32,
    /// DRM fourcc or format name of the output surfaces
    pub output_format: String,
    pub output_width: u32,
    pub output_height: u32,
    /// Poll timeout before each dequeue; 0 blocks in the driver
    pub poll_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let mut heap_paths: Vec<PathBuf> = DMA_HEAP_PATHS.iter().map(PathBuf::from).collect();
        heap_paths.push(PathBuf::from(DMA_HEAP_SYSTEM_PATH));
        Self {
            device: PathBuf::from(DEFAULT_DEVICE),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            pixel_format: DEFAULT_PIXEL_FORMAT.to_string(),
            heap_paths,
            buffer_count: DEFAULT_BUFFER_COUNT,
            output_count: DEFAULT_OUTPUT_COUNT,
            output_format: DEFAULT_OUTPUT_FORMAT.to_string(),
            output_width: DEFAULT_OUTPUT_WIDTH,
            output_height: DEFAULT_OUTPUT_HEIGHT,
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT.as_millis() as u64,
        }
    }
}

/// Values given on the command line, applied on top of the file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub device: Option<PathBuf>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub pixel_format: Option<String>,
    pub buffer_count: Option<u32>,
    pub output_count: Option<u32>,
    pub output_format: Option<String>,
    pub poll_timeout_ms: Option<u64>,
}

impl PipelineConfig {
    /// `$XDG_CONFIG_HOME/dmacam/config.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Load from `path` if given (it must exist), else from the default
    /// location when present, else defaults
    pub fn load(path: Option<&Path>) -> PipelineResult<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => match Self::default_path().filter(|p| p.is_file()) {
                Some(default) => Self::from_file(&default),
                None => {
                    debug!("No config file, using defaults");
                    Ok(Self::default())
                }
            },
        }
    }

    pub fn from_file(path: &Path) -> PipelineResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::Config(format!("{}: {}", path.display(), e)))?;
        let config = Self::from_json(&text)?;
        info!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    pub fn from_json(text: &str) -> PipelineResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> PipelineResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn apply(&mut self, overrides: &ConfigOverrides) {
        if let Some(device) = &overrides.device {
            self.device = device.clone();
        }
        if let Some(width) = overrides.width {
            self.width = width;
        }
        if let Some(height) = overrides.height {
            self.height = height;
        }
        if let Some(fmt) = &overrides.pixel_format {
            self.pixel_format = fmt.clone();
        }
        if let Some(count) = overrides.buffer_count {
            self.buffer_count = count;
        }
        if let Some(count) = overrides.output_count {
            self.output_count = count;
        }
        if let Some(fmt) = &overrides.output_format {
            self.output_format = fmt.clone();
        }
        if let Some(ms) = overrides.poll_timeout_ms {
            self.poll_timeout_ms = ms;
        }
    }

    pub fn poll_timeout(&self) -> Option<Duration> {
        (self.poll_timeout_ms > 0).then(|| Duration::from_millis(self.poll_timeout_ms))
    }

    pub fn format_request(&self) -> PipelineResult<FormatRequest> {
        Ok(FormatRequest {
            width: self.width,
            height: self.height,
            pixel_format: parse_v4l2_fourcc(&self.pixel_format)?,
        })
    }

    pub fn pipeline_options(&self) -> PipelineResult<PipelineOptions> {
        if self.buffer_count == 0 {
            return Err(PipelineError::Config("buffer_count must be at least 1".into()));
        }
        if self.output_count == 0 {
            return Err(PipelineError::Config("output_count must be at least 1".into()));
        }
        let output_format = DrmFourcc::parse(&self.output_format)
            .ok_or_else(|| PipelineError::Config(format!("invalid output format {:?}", self.output_format)))?;

        Ok(PipelineOptions {
            buffer_count: self.buffer_count,
            output_count: self.output_count as usize,
            output_format,
            output_width: self.output_width,
            output_height: self.output_height,
            poll_timeout: self.poll_timeout(),
        })
    }
}

fn parse_v4l2_fourcc(text: &str) -> PipelineResult<Option<FourCC>> {
    if text.is_empty() {
        return Ok(None);
    }
    let bytes: [u8; 4] = text
        .as_bytes()
        .try_into()
        .map_err(|_| PipelineError::Config(format!("pixel format {:?} is not a fourcc", text)))?;
    Ok(Some(FourCC::new(&bytes)))
}
