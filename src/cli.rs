//! Command-line surface, layered over the file/environment configuration

use std::path::PathBuf;

use clap::Parser;

use crate::error::Result;
use crate::utils::parse_cpu_list;
use crate::Config;

/// RTP/H.265 receiver scanning out on a DRM plane with an optional overlay
#[derive(Parser, Debug, Default)]
#[command(name = "pixelpilot_mini_rk")]
#[command(version)]
#[command(about = "HDMI receiver: atomic KMS, hotplug, GStreamer kmssink and a diagnostic overlay", long_about = None)]
pub struct Args {
    /// TOML configuration file
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// DRM device node
    #[arg(long, value_name = "PATH")]
    pub card: Option<PathBuf>,

    /// Connector name, e.g. HDMI-A-1
    #[arg(long)]
    pub connector: Option<String>,

    /// Video plane id (0 = auto)
    #[arg(long)]
    pub plane_id: Option<u32>,

    /// Detach the primary plane during modeset
    #[arg(long, overrides_with = "no_blank_primary")]
    pub blank_primary: bool,

    #[arg(long)]
    pub no_blank_primary: bool,

    /// Disable the hotplug listener
    #[arg(long)]
    pub no_udev: bool,

    /// Keep the blue filler and never start the pipeline
    #[arg(long)]
    pub stay_blue: bool,

    /// Keep the blue filler up for this long after a modeset
    #[arg(long, value_name = "MS")]
    pub blue_hold_ms: Option<u64>,

    #[arg(long)]
    pub udp_port: Option<u16>,

    /// RTP payload type of the H.265 stream
    #[arg(long)]
    pub vid_pt: Option<u8>,

    /// RTP payload type of the Opus stream
    #[arg(long)]
    pub aud_pt: Option<u8>,

    /// Jitter buffer latency
    #[arg(long, value_name = "MS")]
    pub latency_ms: Option<u32>,

    /// kmssink max-lateness
    #[arg(long, value_name = "NS")]
    pub max_lateness: Option<i64>,

    /// ALSA device for audio
    #[arg(long)]
    pub aud_dev: Option<String>,

    /// Build the pipeline without an audio branch
    #[arg(long)]
    pub no_audio: bool,

    /// Fall back to a fakesink when the audio device keeps failing
    #[arg(long, overrides_with = "audio_required")]
    pub audio_optional: bool,

    #[arg(long)]
    pub audio_required: bool,

    /// Enable the overlay
    #[arg(long)]
    pub osd: bool,

    /// Overlay plane id (0 = auto)
    #[arg(long)]
    pub osd_plane_id: Option<u32>,

    #[arg(long, value_name = "MS")]
    pub osd_refresh_ms: Option<u64>,

    /// Listen for external overlay text/values
    #[arg(long)]
    pub osd_feed: bool,

    #[arg(long, value_name = "ADDR:PORT")]
    pub osd_feed_bind: Option<String>,

    /// Never send HTTP keyframe requests
    #[arg(long)]
    pub no_idr: bool,

    /// CPUs for the receiver thread, e.g. "2,3" or "0-3"
    #[arg(long, value_name = "LIST", value_parser = parse_cpu_arg)]
    pub cpu_list: Option<CpuList>,

    /// Set GST_DEBUG=3
    #[arg(long)]
    pub gst_log: bool,

    /// Debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

/// Parsed `--cpu-list`, kept whole so clap does not treat it as repeated values
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuList(pub Vec<usize>);

fn parse_cpu_arg(s: &str) -> std::result::Result<CpuList, String> {
    parse_cpu_list(s).map(CpuList)
}

impl Args {
    /// Load the layered configuration and put the flags on top
    pub fn resolve(&self) -> Result<Config> {
        let mut cfg = Config::load(self.config.as_deref())?;
        self.apply(&mut cfg);
        cfg.apply_guardrails();
        Ok(cfg)
    }

    /// Flags given on the command line win
    pub fn apply(&self, cfg: &mut Config) {
        let d = &mut cfg.display;
        if let Some(card) = &self.card {
            d.card = card.clone();
        }
        if let Some(connector) = &self.connector {
            d.connector = Some(connector.clone());
        }
        if let Some(id) = self.plane_id {
            d.plane_id = id;
        }
        if self.blank_primary {
            d.blank_primary = true;
        }
        if self.no_blank_primary {
            d.blank_primary = false;
        }
        if self.no_udev {
            d.use_udev = false;
        }
        if self.stay_blue {
            d.stay_blue = true;
        }
        if let Some(ms) = self.blue_hold_ms {
            d.blue_hold_ms = ms;
        }

        let p = &mut cfg.pipeline;
        if let Some(port) = self.udp_port {
            p.udp_port = port;
        }
        if let Some(pt) = self.vid_pt {
            p.vid_pt = pt;
        }
        if let Some(pt) = self.aud_pt {
            p.aud_pt = pt;
        }
        if let Some(ms) = self.latency_ms {
            p.latency_ms = ms;
        }
        if let Some(ns) = self.max_lateness {
            p.max_lateness_ns = ns;
        }
        if let Some(dev) = &self.aud_dev {
            p.aud_dev = dev.clone();
        }
        if self.no_audio {
            p.no_audio = true;
        }
        if self.audio_optional {
            p.audio_optional = true;
        }
        if self.audio_required {
            p.audio_optional = false;
        }
        if let Some(CpuList(cpus)) = &self.cpu_list {
            p.cpu_list = cpus.clone();
        }

        if self.osd {
            cfg.osd.enable = true;
        }
        if let Some(id) = self.osd_plane_id {
            cfg.osd.plane_id = id;
        }
        if let Some(ms) = self.osd_refresh_ms {
            cfg.osd.refresh_ms = ms;
        }
        if self.osd_feed {
            cfg.feed.enable = true;
        }
        if let Some(bind) = &self.osd_feed_bind {
            cfg.feed.bind = bind.clone();
        }
        if self.no_idr {
            cfg.idr.enable = false;
        }
        cfg.gst_log |= self.gst_log;
        cfg.verbose |= self.verbose;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("pixelpilot_mini_rk").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_flags_override_defaults() {
        let mut cfg = Config::default();
        parse(&[
            "--connector",
            "HDMI-A-1",
            "--udp-port",
            "5700",
            "--no-blank-primary",
            "--audio-required",
            "--osd",
            "--osd-refresh-ms",
            "250",
            "--cpu-list",
            "2-3",
            "--no-idr",
        ])
        .apply(&mut cfg);
        assert_eq!(cfg.connector(), Some("HDMI-A-1"));
        assert_eq!(cfg.pipeline.udp_port, 5700);
        assert!(!cfg.display.blank_primary);
        assert!(!cfg.pipeline.audio_optional);
        assert!(cfg.osd.enable);
        assert_eq!(cfg.osd.refresh_ms, 250);
        assert_eq!(cfg.pipeline.cpu_list, vec![2, 3]);
        assert!(!cfg.idr.enable);
    }

    #[test]
    fn test_absent_flags_keep_config() {
        let mut cfg = Config::default();
        cfg.pipeline.udp_port = 6000;
        cfg.osd.enable = true;
        parse(&[]).apply(&mut cfg);
        assert_eq!(cfg.pipeline.udp_port, 6000);
        assert!(cfg.osd.enable);
        assert!(cfg.display.blank_primary);
    }

    #[test]
    fn test_bad_arguments_are_rejected() {
        let err = Args::try_parse_from(["pixelpilot_mini_rk", "--udp-port", "99999"]).unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(Args::try_parse_from(["pixelpilot_mini_rk", "--cpu-list", "x"]).is_err());
    }
}
