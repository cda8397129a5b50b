//! Configuration Module
//!
//! Handles configuration file parsing for the render context and the
//! headless frame loop.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::device::CompletionMode;

/// Render core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Frames the CPU may record ahead of the GPU (ring size)
    #[serde(default = "default_queued_frame_count")]
    pub queued_frame_count: usize,

    /// Descriptors in the CBV/SRV/UAV heap
    #[serde(default = "default_cbv_srv_uav_heap_capacity")]
    pub cbv_srv_uav_heap_capacity: u32,

    /// Descriptors in the render target heap
    #[serde(default = "default_rtv_heap_capacity")]
    pub rtv_heap_capacity: u32,

    /// Descriptors in the depth stencil heap
    #[serde(default = "default_dsv_heap_capacity")]
    pub dsv_heap_capacity: u32,

    /// Fence wait timeout in milliseconds (0 = wait forever)
    #[serde(default = "default_fence_timeout_ms")]
    pub fence_timeout_ms: u64,

    /// Headless GPU timeline: "immediate", "threaded", "manual"
    #[serde(default = "default_completion_mode")]
    pub completion_mode: String,

    /// Simulated GPU latency per queued item in microseconds
    #[serde(default = "default_gpu_latency_us")]
    pub gpu_latency_us: u64,

    /// Frames rendered by the demo loop (0 = until Ctrl+C)
    #[serde(default = "default_frames")]
    pub frames: u64,

    /// Render target width
    #[serde(default = "default_width")]
    pub width: u32,

    /// Render target height
    #[serde(default = "default_height")]
    pub height: u32,

    /// Log filter used when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_queued_frame_count() -> usize {
    3
}

fn default_cbv_srv_uav_heap_capacity() -> u32 {
    4096
}

fn default_rtv_heap_capacity() -> u32 {
    16
}

fn default_dsv_heap_capacity() -> u32 {
    8
}

fn default_fence_timeout_ms() -> u64 {
    5000
}

fn default_completion_mode() -> String {
    "threaded".to_string()
}

fn default_gpu_latency_us() -> u64 {
    500
}

fn default_frames() -> u64 {
    300
}

fn default_width() -> u32 {
    1280
}

fn default_height() -> u32 {
    720
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queued_frame_count: default_queued_frame_count(),
            cbv_srv_uav_heap_capacity: default_cbv_srv_uav_heap_capacity(),
            rtv_heap_capacity: default_rtv_heap_capacity(),
            dsv_heap_capacity: default_dsv_heap_capacity(),
            fence_timeout_ms: default_fence_timeout_ms(),
            completion_mode: default_completion_mode(),
            gpu_latency_us: default_gpu_latency_us(),
            frames: default_frames(),
            width: default_width(),
            height: default_height(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.queued_frame_count == 0 {
            bail!("queued_frame_count must be at least 1");
        }
        if self.cbv_srv_uav_heap_capacity == 0
            || self.rtv_heap_capacity == 0
            || self.dsv_heap_capacity == 0
        {
            bail!("descriptor heap capacities must be positive");
        }
        if self.width == 0 || self.height == 0 {
            bail!("render target size must be non-zero");
        }
        self.completion_mode()?;
        Ok(())
    }

    /// `None` disables the timeout.
    pub fn fence_timeout(&self) -> Option<Duration> {
        match self.fence_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn completion_mode(&self) -> Result<CompletionMode> {
        match self.completion_mode.as_str() {
            "immediate" => Ok(CompletionMode::Immediate),
            "threaded" => Ok(CompletionMode::Threaded {
                latency: Duration::from_micros(self.gpu_latency_us),
            }),
            "manual" => Ok(CompletionMode::Manual),
            other => bail!("unknown completion mode {:?}", other),
        }
    }
}
