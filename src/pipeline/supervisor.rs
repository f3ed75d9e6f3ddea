//! Pipeline lifecycle with restart-rate hysteresis and audio fallback

use std::time::{Duration, Instant};

use metrics::counter;
use tracing::{debug, error, info, warn};

use super::{AudioMode, MediaPipeline, PipelineState, ReceiverStats};
use crate::error::{Error, Result};
use crate::kms::ModesetResult;
use crate::Config;

/// Owns one [`MediaPipeline`] and decides when and how it is (re)started
#[derive(Debug)]
pub struct Supervisor<P> {
    pipeline: P,
    phase: PipelineState,
    no_audio: bool,
    audio_optional: bool,
    audio_disabled: bool,
    restart_limit: u32,
    restart_window: Duration,
    window_start: Option<Instant>,
    restarts_in_window: u32,
    total_restarts: u32,
    /// Last value handed to the pipeline's stats switch, `None` if unknown
    stats_enabled: Option<bool>,
}

impl<P: MediaPipeline> Supervisor<P> {
    pub fn new(pipeline: P, cfg: &Config) -> Self {
        Self {
            pipeline,
            phase: PipelineState::Stopped,
            no_audio: cfg.pipeline.no_audio,
            audio_optional: cfg.pipeline.audio_optional,
            audio_disabled: cfg.pipeline.no_audio,
            restart_limit: cfg.pipeline.restart_limit.max(1),
            restart_window: Duration::from_millis(cfg.pipeline.restart_window_ms),
            window_start: None,
            restarts_in_window: 0,
            total_restarts: 0,
            stats_enabled: None,
        }
    }

    pub fn phase(&self) -> PipelineState {
        self.phase
    }

    pub fn is_stopped(&self) -> bool {
        self.phase == PipelineState::Stopped
    }

    pub fn audio_disabled(&self) -> bool {
        self.audio_disabled
    }

    pub fn audio_mode(&self) -> AudioMode {
        AudioMode::select(self.no_audio, self.audio_disabled)
    }

    pub fn restarts_in_window(&self) -> u32 {
        self.restarts_in_window
    }

    pub fn total_restarts(&self) -> u32 {
        self.total_restarts
    }

    pub fn pipeline(&self) -> &P {
        &self.pipeline
    }

    pub fn pipeline_mut(&mut self) -> &mut P {
        &mut self.pipeline
    }

    /// Start with the current audio decision; refused unless stopped
    pub fn start(&mut self, cfg: &Config, ms: &ModesetResult) -> Result<()> {
        if self.phase != PipelineState::Stopped {
            return Err(Error::PipelineBusy(self.phase));
        }
        self.invalidate_stats_cache();
        match self.pipeline.start(cfg, ms, self.audio_disabled) {
            Ok(()) => {
                self.phase = PipelineState::Running;
                counter!("pipeline_starts").increment(1);
                info!(
                    "Pipeline started on {}x{}@{} (audio {})",
                    ms.width,
                    ms.height,
                    ms.refresh_hz,
                    self.audio_mode()
                );
                Ok(())
            }
            Err(e) => {
                counter!("pipeline_start_failures").increment(1);
                Err(e)
            }
        }
    }

    /// Reset the restart-rate window, after a fresh modeset or a requested restart
    pub fn begin_window(&mut self, now: Instant) {
        self.window_start = Some(now);
        self.restarts_in_window = 0;
    }

    /// End-of-stream, bounded wait, forced teardown; no-op when already stopped
    pub fn stop(&mut self, deadline: Duration) {
        if self.phase == PipelineState::Stopped {
            return;
        }
        self.phase = PipelineState::Stopping;
        self.pipeline.stop(deadline);
        self.phase = self.pipeline.poll();
        self.invalidate_stats_cache();
        debug!("Pipeline stop finished ({})", self.phase);
    }

    /// Observe a pipeline that ended on its own
    pub fn poll_health(&mut self) -> PipelineState {
        if self.phase != PipelineState::Stopped && self.pipeline.poll() == PipelineState::Stopped {
            info!("Pipeline ended ({} before)", self.phase);
            self.phase = PipelineState::Stopped;
            self.invalidate_stats_cache();
        }
        self.phase
    }

    /// Stop and start again for an external reason
    pub fn restart_with_reason(
        &mut self,
        cfg: &Config,
        ms: &ModesetResult,
        reason: &str,
        now: Instant,
    ) -> Result<()> {
        warn!("Pipeline restart requested ({})", reason);
        self.stop(super::STOP_DEADLINE);
        if let Err(e) = self.start(cfg, ms) {
            error!("Failed to restart pipeline ({}): {}", reason, e);
            return Err(e);
        }
        self.begin_window(now);
        Ok(())
    }

    /// Count a restart in the current window, apply the audio fallback and start
    pub fn restart_after_exit(&mut self, cfg: &Config, ms: &ModesetResult, now: Instant) -> Result<()> {
        let window_elapsed = match self.window_start {
            Some(start) => now.saturating_duration_since(start) > self.restart_window,
            None => true,
        };
        if window_elapsed {
            self.begin_window(now);
        }
        self.restarts_in_window += 1;
        self.total_restarts += 1;
        counter!("pipeline_restarts").increment(1);

        if !self.no_audio
            && self.audio_optional
            && !self.audio_disabled
            && self.restarts_in_window >= self.restart_limit
        {
            self.audio_disabled = true;
            warn!("Audio device likely busy; switching audio branch to fakesink to avoid restart loop");
        }

        warn!(
            "Pipeline not running; restarting{}",
            if self.audio_disabled && !self.no_audio {
                " (audio=fakesink)"
            } else {
                ""
            }
        );
        self.start(cfg, ms).inspect_err(|e| error!("Restart failed: {}", e))
    }

    pub fn consume_reinit_request(&mut self) -> bool {
        self.pipeline.consume_reinit_request()
    }

    pub fn receiver_stats(&self) -> Option<ReceiverStats> {
        if self.phase == PipelineState::Stopped {
            return None;
        }
        self.pipeline.receiver_stats()
    }

    /// Forward the stats switch only when it changes
    pub fn set_stats_enabled(&mut self, enabled: bool) {
        if self.stats_enabled == Some(enabled) {
            return;
        }
        self.pipeline.set_stats_enabled(enabled);
        self.stats_enabled = Some(enabled);
    }

    pub fn invalidate_stats_cache(&mut self) {
        self.stats_enabled = None;
    }
}
