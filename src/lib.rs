pub mod cli;
pub mod error;
pub mod feed;
pub mod hotplug;
pub mod instance;
pub mod kms;
pub mod osd;
pub mod pipeline;
pub mod reactor;
pub mod signals;
pub mod utils;

use std::path::{Path, PathBuf};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub use error::{Error, Result};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Smallest OSD refresh period accepted
pub const MIN_OSD_REFRESH_MS: u64 = 16;

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub display: DisplayConfig,
    pub pipeline: PipelineConfig,
    pub osd: OsdConfig,
    pub feed: FeedConfig,
    pub idr: IdrSettings,
    pub pid_file: PathBuf,
    pub gst_log: bool,
    pub verbose: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub card: PathBuf,
    /// `KIND-INDEX` name such as `HDMI-A-1`
    pub connector: Option<String>,
    /// 0 picks automatically
    pub plane_id: u32,
    pub blank_primary: bool,
    pub use_udev: bool,
    pub stay_blue: bool,
    pub blue_hold_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub udp_port: u16,
    pub vid_pt: u8,
    pub aud_pt: u8,
    pub latency_ms: u32,
    pub sync: bool,
    pub qos: bool,
    pub max_lateness_ns: i64,
    pub aud_dev: String,
    pub no_audio: bool,
    pub audio_optional: bool,
    pub restart_limit: u32,
    pub restart_window_ms: u64,
    pub cpu_list: Vec<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OsdConfig {
    pub enable: bool,
    /// 0 picks automatically
    pub plane_id: u32,
    pub refresh_ms: u64,
    pub plot_window_s: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub enable: bool,
    pub bind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdrSettings {
    pub enable: bool,
    pub http_port: u16,
    pub path: String,
    pub timeout_ms: u64,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            card: PathBuf::from("/dev/dri/card0"),
            connector: None,
            plane_id: 0,
            blank_primary: true,
            use_udev: true,
            stay_blue: false,
            blue_hold_ms: 0,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            udp_port: 5600,
            vid_pt: 97,
            aud_pt: 98,
            latency_ms: 8,
            sync: false,
            qos: true,
            max_lateness_ns: 20_000_000,
            aud_dev: "plughw:CARD=rockchiphdmi0,DEV=0".into(),
            no_audio: false,
            audio_optional: true,
            restart_limit: 3,
            restart_window_ms: 2000,
            cpu_list: Vec::new(),
        }
    }
}

impl Default for OsdConfig {
    fn default() -> Self {
        Self {
            enable: false,
            plane_id: 0,
            refresh_ms: 500,
            plot_window_s: 60,
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            enable: false,
            bind: "0.0.0.0:5005".into(),
        }
    }
}

impl Default for IdrSettings {
    fn default() -> Self {
        Self {
            enable: true,
            http_port: 80,
            path: "/request/idr".into(),
            timeout_ms: 200,
        }
    }
}

impl Config {
    /// Defaults, then the optional TOML file, then `PIXELPILOT_*` variables
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let layered = builder
            .add_source(
                config::Environment::with_prefix("PIXELPILOT")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(layered.try_deserialize()?)
    }

    /// Clamp values the daemon cannot work with
    pub fn apply_guardrails(&mut self) {
        if self.osd.refresh_ms < MIN_OSD_REFRESH_MS {
            warn!(
                "OSD refresh {} ms is too fast; clamping to {} ms",
                self.osd.refresh_ms, MIN_OSD_REFRESH_MS
            );
            self.osd.refresh_ms = MIN_OSD_REFRESH_MS;
        }
        if self.osd.plot_window_s == 0 {
            warn!("OSD plot window of 0 s; using 1 s");
            self.osd.plot_window_s = 1;
        }
        if self.pipeline.restart_limit < 1 {
            warn!("Restart limit must be at least 1; clamping");
            self.pipeline.restart_limit = 1;
        }
    }

    pub fn connector(&self) -> Option<&str> {
        self.display.connector.as_deref().filter(|c| !c.is_empty())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            display: DisplayConfig::default(),
            pipeline: PipelineConfig::default(),
            osd: OsdConfig::default(),
            feed: FeedConfig::default(),
            idr: IdrSettings::default(),
            pid_file: PathBuf::from(instance::DEFAULT_PID_FILE),
            gst_log: false,
            verbose: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.pipeline.udp_port, 5600);
        assert_eq!(cfg.pipeline.vid_pt, 97);
        assert_eq!(cfg.pipeline.aud_pt, 98);
        assert_eq!(cfg.pipeline.restart_limit, 3);
        assert_eq!(cfg.osd.refresh_ms, 500);
        assert!(cfg.display.blank_primary);
        assert!(cfg.connector().is_none());
    }

    #[test]
    fn test_guardrails() {
        let mut cfg = Config::default();
        cfg.osd.refresh_ms = 1;
        cfg.pipeline.restart_limit = 0;
        cfg.apply_guardrails();
        assert_eq!(cfg.osd.refresh_ms, MIN_OSD_REFRESH_MS);
        assert_eq!(cfg.pipeline.restart_limit, 1);
    }
}
