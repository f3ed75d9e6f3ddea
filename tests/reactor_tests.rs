use std::collections::VecDeque;
use std::io;
use std::time::{Duration, Instant};

use pixelpilot_mini::kms::ModesetResult;
use pixelpilot_mini::osd::Status;
use pixelpilot_mini::pipeline::{MediaPipeline, PipelineState, ReceiverStats};
use pixelpilot_mini::reactor::{Display, HotplugSource, Overlay, Reactor};
use pixelpilot_mini::{Config, Error, Result};

#[derive(Debug, Default)]
struct FakePipeline {
    running: bool,
    starts: Vec<bool>,
    stops: u32,
    reinit: bool,
    /// Starts to refuse before succeeding again
    fail_starts: u32,
}

impl MediaPipeline for FakePipeline {
    fn start(&mut self, _: &Config, _: &ModesetResult, audio_disabled: bool) -> Result<()> {
        if self.fail_starts > 0 {
            self.fail_starts -= 1;
            return Err(Error::PipelineStartFailed("no element \"kmssink\"".into()));
        }
        self.starts.push(audio_disabled);
        self.running = true;
        Ok(())
    }

    fn stop(&mut self, _: Duration) {
        self.stops += 1;
        self.running = false;
    }

    fn poll(&mut self) -> PipelineState {
        if self.running {
            PipelineState::Running
        } else {
            PipelineState::Stopped
        }
    }

    fn consume_reinit_request(&mut self) -> bool {
        std::mem::take(&mut self.reinit)
    }

    fn receiver_stats(&self) -> Option<ReceiverStats> {
        None
    }

    fn set_stats_enabled(&mut self, _: bool) {}
}

#[derive(Debug, Default)]
struct FakeDisplay {
    connected: bool,
    probes: u32,
    modesets: u32,
    /// Failures to hand out before succeeding
    failures: VecDeque<()>,
}

impl Display for FakeDisplay {
    fn is_connected(&self, _: Option<&str>) -> bool {
        self.connected
    }

    fn modeset(&mut self, _: &Config) -> Result<ModesetResult> {
        self.modesets += 1;
        if self.failures.pop_front().is_some() {
            return Err(Error::CommitRejected(io::Error::from_raw_os_error(libc::EBUSY)));
        }
        Ok(mode())
    }
}

#[derive(Debug, Default)]
struct FakeOverlay {
    enabled: bool,
    active: bool,
    setups: u32,
    disables: u32,
    updates: u32,
}

impl Overlay for FakeOverlay {
    fn setup(&mut self, _: &ModesetResult, _: u32) -> Result<()> {
        self.setups += 1;
        self.enabled = true;
        self.active = true;
        Ok(())
    }

    fn enable(&mut self) -> Result<()> {
        self.active = true;
        Ok(())
    }

    fn disable(&mut self) {
        self.disables += 1;
        self.active = false;
    }

    fn teardown(&mut self) {
        self.enabled = false;
        self.active = false;
    }

    fn update(&mut self, _: &Status, _: Option<f64>) -> Result<()> {
        self.updates += 1;
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn is_active(&self) -> bool {
        self.active
    }
}

struct NoHotplug;

impl HotplugSource for NoHotplug {
    fn wait(&mut self, _: Duration) -> bool {
        false
    }
}

type TestReactor = Reactor<FakePipeline, FakeDisplay, FakeOverlay, NoHotplug>;

fn mode() -> ModesetResult {
    ModesetResult {
        connector: drm::control::from_u32(1).unwrap(),
        connector_name: "HDMI-A-1".into(),
        crtc: drm::control::from_u32(2).unwrap(),
        video_plane: drm::control::from_u32(3).unwrap(),
        width: 1920,
        height: 1080,
        refresh_hz: 60,
    }
}

fn reactor(cfg: Config, connected: bool) -> TestReactor {
    let display = FakeDisplay {
        connected,
        ..Default::default()
    };
    Reactor::new(cfg, FakePipeline::default(), display, FakeOverlay::default(), None, None)
}

#[test]
fn no_sink_at_startup_waits_without_pipeline() {
    let mut r = reactor(Config::default(), false);
    let t0 = Instant::now();
    r.startup(t0);
    r.tick(0, 0, 0, t0 + Duration::from_millis(200));
    assert!(!r.is_connected());
    assert!(r.supervisor().pipeline().starts.is_empty());
}

#[test]
fn startup_with_sink_starts_pipeline_and_overlay() {
    let mut cfg = Config::default();
    cfg.osd.enable = true;
    let mut r = reactor(cfg, true);
    let t0 = Instant::now();
    r.startup(t0);
    assert!(r.is_connected());
    assert_eq!(r.supervisor().pipeline().starts, vec![false]);
    assert_eq!(r.overlay().setups, 1);

    r.tick(0, 0, 0, t0);
    assert_eq!(r.overlay().updates, 1);
    // not due yet
    r.tick(0, 0, 0, t0 + Duration::from_millis(100));
    assert_eq!(r.overlay().updates, 1);
    r.tick(0, 0, 0, t0 + Duration::from_millis(500));
    assert_eq!(r.overlay().updates, 2);
}

#[test]
fn hotplug_burst_is_debounced() {
    let mut r = reactor(Config::default(), true);
    let t0 = Instant::now();
    assert!(r.handle_hotplug(t0).is_none());
    assert_eq!(r.supervisor().pipeline().starts.len(), 1);

    r.handle_hotplug(t0 + Duration::from_millis(250));
    assert_eq!(r.supervisor().pipeline().starts.len(), 1);

    r.handle_hotplug(t0 + Duration::from_millis(400));
    assert_eq!(r.supervisor().pipeline().starts.len(), 2);
    assert_eq!(r.supervisor().pipeline().stops, 1);
}

#[test]
fn modeset_failures_back_off() {
    let mut r = reactor(Config::default(), true);
    r.display_mut().failures.extend([(), (), (), (), ()]);
    let t0 = Instant::now();
    let delays: Vec<u128> = (0..5u64)
        .map(|i| {
            r.handle_hotplug(t0 + Duration::from_secs(i))
                .map(|d| d.as_millis())
                .unwrap_or(0)
        })
        .collect();
    assert_eq!(delays, vec![250, 500, 1000, 2000, 2000]);
    assert!(!r.is_connected());

    assert!(r.handle_hotplug(t0 + Duration::from_secs(10)).is_none());
    assert!(r.is_connected());
    assert!(r.backoff().current().is_none());
}

#[test]
fn disconnect_stops_pipeline_and_hides_overlay() {
    let mut cfg = Config::default();
    cfg.osd.enable = true;
    let mut r = reactor(cfg, true);
    let t0 = Instant::now();
    r.startup(t0);

    r.display_mut().connected = false;
    r.handle_hotplug(t0 + Duration::from_secs(1));
    assert!(!r.is_connected());
    assert_eq!(r.supervisor().pipeline().stops, 1);
    assert!(!r.overlay().is_active());

    // nothing restarts while disconnected
    r.tick(0, 0, 0, t0 + Duration::from_secs(2));
    assert_eq!(r.supervisor().pipeline().starts.len(), 1);
}

#[test]
fn exited_pipeline_is_restarted_with_audio_fallback() {
    let mut r = reactor(Config::default(), true);
    let t0 = Instant::now();
    r.startup(t0);
    for i in 1..=3u64 {
        r.supervisor_mut().pipeline_mut().running = false;
        r.tick(0, 0, 0, t0 + Duration::from_millis(300 * i));
    }
    assert_eq!(r.supervisor().pipeline().starts, vec![false, false, false, true]);
}

#[test]
fn failed_auto_restart_is_retried_next_iteration() {
    let mut r = reactor(Config::default(), true);
    let t0 = Instant::now();
    r.startup(t0);
    r.supervisor_mut().pipeline_mut().running = false;
    r.supervisor_mut().pipeline_mut().fail_starts = 1;

    r.tick(0, 0, 0, t0 + Duration::from_millis(300));
    assert!(r.is_connected());
    assert!(r.supervisor().is_stopped());
    assert_eq!(r.supervisor().pipeline().starts.len(), 1);

    r.tick(0, 0, 0, t0 + Duration::from_millis(600));
    assert!(!r.supervisor().is_stopped());
    assert_eq!(r.supervisor().pipeline().starts, vec![false, false]);
    assert_eq!(r.supervisor().total_restarts(), 2);
}

#[test]
fn sighup_restarts_only_when_connected() {
    let mut r = reactor(Config::default(), false);
    let t0 = Instant::now();
    r.startup(t0);
    r.handle_reinit(1, t0);
    assert!(r.supervisor().pipeline().starts.is_empty());

    r.display_mut().connected = true;
    r.handle_hotplug(t0);
    r.handle_reinit(2, t0 + Duration::from_millis(10));
    assert_eq!(r.supervisor().pipeline().starts.len(), 2);
    assert_eq!(r.supervisor().pipeline().stops, 1);
}

#[test]
fn pipeline_reinit_request_is_combined_with_sighup() {
    let mut r = reactor(Config::default(), true);
    let t0 = Instant::now();
    r.startup(t0);
    r.supervisor_mut().pipeline_mut().reinit = true;
    r.tick(1, 0, 0, t0);
    // one restart for both requests
    assert_eq!(r.supervisor().pipeline().starts.len(), 2);
    assert_eq!(r.supervisor().restarts_in_window(), 0);
}

#[test]
fn osd_toggles_are_applied_once_per_signal() {
    let mut cfg = Config::default();
    cfg.osd.enable = true;
    let mut r = reactor(cfg, true);
    let t0 = Instant::now();
    r.startup(t0);
    assert!(r.overlay().is_active());

    r.tick(0, 2, 0, t0);
    assert_eq!(r.osd_toggles_applied(), 2);
    // off then on again
    assert_eq!(r.overlay().disables, 1);
    assert!(r.config().osd.enable);
    assert!(r.overlay().is_active());

    r.tick(0, 1, 0, t0);
    assert_eq!(r.osd_toggles_applied(), 3);
    assert!(!r.config().osd.enable);
    assert!(!r.overlay().is_active());
}

#[test]
fn osd_toggle_without_display_waits_for_modeset() {
    let mut r = reactor(Config::default(), false);
    let t0 = Instant::now();
    r.startup(t0);
    r.apply_osd_toggles(1);
    assert!(r.config().osd.enable);
    assert_eq!(r.overlay().setups, 0);

    r.display_mut().connected = true;
    r.handle_hotplug(t0);
    assert_eq!(r.overlay().setups, 1);
}

#[test]
fn record_toggle_flips_flag() {
    let mut r = reactor(Config::default(), false);
    r.apply_record_toggles(1);
    assert!(r.recording_requested());
    r.apply_record_toggles(2);
    assert!(r.recording_requested());
}

#[test]
fn stay_blue_never_starts_pipeline() {
    let mut cfg = Config::default();
    cfg.display.stay_blue = true;
    let mut r = reactor(cfg, true);
    let t0 = Instant::now();
    r.startup(t0);
    r.tick(1, 0, 0, t0 + Duration::from_secs(1));
    assert!(r.is_connected());
    assert!(r.supervisor().pipeline().starts.is_empty());
}
