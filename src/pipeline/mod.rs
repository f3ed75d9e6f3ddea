//! Media pipeline contract and its supervisor
//!
//! The reactor only talks to a pipeline through [`MediaPipeline`]; the GStreamer
//! implementation lives behind the `gstreamer-pipeline` feature.

pub mod gst;
pub mod idr;
pub mod receiver;
pub mod supervisor;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::kms::ModesetResult;
use crate::Config;

pub use receiver::ReceiverStats;
pub use supervisor::Supervisor;

/// Stop deadline used by the reactor
pub const STOP_DEADLINE: Duration = Duration::from_millis(700);

/// Lifecycle phase of the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PipelineState {
    #[default]
    Stopped,
    Running,
    Stopping,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PipelineState::Stopped => "stopped",
            PipelineState::Running => "running",
            PipelineState::Stopping => "stopping",
        })
    }
}

/// What the audio branch of a started pipeline looks like
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AudioMode {
    /// Decoded to the ALSA device
    #[default]
    Real,
    /// Decoded branch replaced by a fakesink
    Fake,
    /// No audio branch at all
    None,
}

impl AudioMode {
    pub fn select(no_audio: bool, audio_disabled: bool) -> Self {
        if no_audio {
            AudioMode::None
        } else if audio_disabled {
            AudioMode::Fake
        } else {
            AudioMode::Real
        }
    }
}

impl fmt::Display for AudioMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AudioMode::Real => "REAL",
            AudioMode::Fake => "FAKE",
            AudioMode::None => "NONE",
        })
    }
}

/// Opaque decode/scanout pipeline
///
/// All calls come from the reactor thread and are expected to return quickly,
/// except `stop`, which may block up to its deadline.
pub trait MediaPipeline {
    fn start(&mut self, cfg: &Config, modeset: &ModesetResult, audio_disabled: bool) -> Result<()>;

    /// Send end-of-stream and wait up to `deadline`, then force teardown
    fn stop(&mut self, deadline: Duration);

    /// Drain asynchronous completions and report the current phase
    fn poll(&mut self) -> PipelineState;

    /// True once per pending reinit request raised by the pipeline itself
    fn consume_reinit_request(&mut self) -> bool;

    fn receiver_stats(&self) -> Option<ReceiverStats>;

    fn set_stats_enabled(&mut self, enabled: bool);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_mode_selection() {
        assert_eq!(AudioMode::select(true, true), AudioMode::None);
        assert_eq!(AudioMode::select(false, true), AudioMode::Fake);
        assert_eq!(AudioMode::select(false, false), AudioMode::Real);
        assert_eq!(AudioMode::Fake.to_string(), "FAKE");
        assert_eq!(PipelineState::Stopping.to_string(), "stopping");
    }
}
