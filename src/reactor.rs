//! Single-threaded control loop tying display, overlay and pipeline together
//!
//! Everything with side effects sits behind a small trait so the loop can be
//! driven with fakes and synthetic time.

use std::thread;
use std::time::{Duration, Instant};

use metrics::counter;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::feed::ExternalFeed;
use crate::hotplug::HotplugMonitor;
use crate::kms::{modeset, Card, ModesetOptions, ModesetResult};
use crate::osd::{Osd, Status};
use crate::pipeline::{MediaPipeline, Supervisor, STOP_DEADLINE};
use crate::{signals, Config};

pub const HOTPLUG_DEBOUNCE: Duration = Duration::from_millis(300);
pub const HOTPLUG_POLL: Duration = Duration::from_millis(200);
pub const BACKOFF_START: Duration = Duration::from_millis(250);
pub const BACKOFF_CAP: Duration = Duration::from_millis(2000);

/// Drops events closer than the window to the last accepted one
#[derive(Debug, Clone)]
pub struct Debouncer {
    window: Duration,
    last: Option<Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    pub fn accept(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last {
            if now.saturating_duration_since(last) < self.window {
                return false;
            }
        }
        self.last = Some(now);
        true
    }
}

/// Doubling retry delay with a cap
#[derive(Debug, Clone, Default)]
pub struct Backoff {
    current: Option<Duration>,
}

impl Backoff {
    pub fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            None => BACKOFF_START,
            Some(d) => (d * 2).min(BACKOFF_CAP),
        };
        self.current = Some(next);
        next
    }

    pub fn reset(&mut self) {
        self.current = None;
    }

    pub fn current(&self) -> Option<Duration> {
        self.current
    }
}

/// Sink probing and modesetting
pub trait Display {
    fn is_connected(&self, connector: Option<&str>) -> bool;
    fn modeset(&mut self, cfg: &Config) -> Result<ModesetResult>;
}

/// Overlay plane lifecycle as seen by the loop
pub trait Overlay {
    fn setup(&mut self, ms: &ModesetResult, requested_plane: u32) -> Result<()>;
    fn enable(&mut self) -> Result<()>;
    fn disable(&mut self);
    fn teardown(&mut self);
    fn update(&mut self, status: &Status, bitrate_mbps: Option<f64>) -> Result<()>;
    fn is_enabled(&self) -> bool;
    fn is_active(&self) -> bool;
}

/// Source of "the display topology may have changed" events
pub trait HotplugSource {
    fn wait(&mut self, timeout: Duration) -> bool;
}

/// [`Display`] over the real DRM card
#[derive(Debug)]
pub struct KmsDisplay {
    card: Card,
}

impl KmsDisplay {
    pub fn new(card: Card) -> Self {
        Self { card }
    }
}

impl Display for KmsDisplay {
    fn is_connected(&self, connector: Option<&str>) -> bool {
        modeset::is_any_connected(&self.card, connector)
    }

    fn modeset(&mut self, cfg: &Config) -> Result<ModesetResult> {
        let opts = ModesetOptions {
            video_plane: cfg.display.plane_id,
            blank_primary: cfg.display.blank_primary,
            pre_reserve_osd: cfg.osd.enable,
            osd_plane: cfg.osd.plane_id,
            blue_hold: Duration::from_millis(cfg.display.blue_hold_ms),
        };
        modeset::perform(&self.card, cfg.connector(), &opts)
    }
}

impl Overlay for Osd {
    fn setup(&mut self, ms: &ModesetResult, requested_plane: u32) -> Result<()> {
        Osd::setup(self, ms, requested_plane)
    }

    fn enable(&mut self) -> Result<()> {
        Osd::enable(self)
    }

    fn disable(&mut self) {
        Osd::disable(self)
    }

    fn teardown(&mut self) {
        Osd::teardown(self)
    }

    fn update(&mut self, status: &Status, bitrate_mbps: Option<f64>) -> Result<()> {
        Osd::update(self, status, bitrate_mbps)
    }

    fn is_enabled(&self) -> bool {
        Osd::is_enabled(self)
    }

    fn is_active(&self) -> bool {
        Osd::is_active(self)
    }
}

impl HotplugSource for HotplugMonitor {
    fn wait(&mut self, timeout: Duration) -> bool {
        HotplugMonitor::wait(self, timeout)
    }
}

/// Owns every long-lived resource of the daemon
pub struct Reactor<P, D, O, H> {
    cfg: Config,
    display: D,
    osd: O,
    hotplug: Option<H>,
    feed: Option<ExternalFeed>,
    sup: Supervisor<P>,
    modeset: Option<ModesetResult>,
    connected: bool,
    debounce: Debouncer,
    backoff: Backoff,
    next_osd_refresh: Option<Instant>,
    recording_requested: bool,
    osd_toggles_applied: u64,
}

impl<P, D, O, H> Reactor<P, D, O, H>
where
    P: MediaPipeline,
    D: Display,
    O: Overlay,
    H: HotplugSource,
{
    pub fn new(cfg: Config, pipeline: P, display: D, osd: O, hotplug: Option<H>, feed: Option<ExternalFeed>) -> Self {
        let sup = Supervisor::new(pipeline, &cfg);
        Self {
            cfg,
            display,
            osd,
            hotplug,
            feed,
            sup,
            modeset: None,
            connected: false,
            debounce: Debouncer::new(HOTPLUG_DEBOUNCE),
            backoff: Backoff::default(),
            next_osd_refresh: None,
            recording_requested: false,
            osd_toggles_applied: 0,
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn supervisor(&self) -> &Supervisor<P> {
        &self.sup
    }

    pub fn supervisor_mut(&mut self) -> &mut Supervisor<P> {
        &mut self.sup
    }

    pub fn overlay(&self) -> &O {
        &self.osd
    }

    pub fn display_mut(&mut self) -> &mut D {
        &mut self.display
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn current_mode(&self) -> Option<&ModesetResult> {
        self.modeset.as_ref()
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    pub fn recording_requested(&self) -> bool {
        self.recording_requested
    }

    pub fn osd_toggles_applied(&self) -> u64 {
        self.osd_toggles_applied
    }

    /// Probe once and bring the display and pipeline up if a sink is there
    pub fn startup(&mut self, now: Instant) {
        if !self.display.is_connected(self.cfg.connector()) {
            info!("No monitor connected; waiting for hotplug...");
            return;
        }
        match self.display.modeset(&self.cfg) {
            Ok(ms) => self.on_modeset(ms, now),
            Err(e) => {
                counter!("modeset_failures").increment(1);
                error!("Initial modeset failed ({}); will wait for hotplug events", e);
            }
        }
    }

    /// Overlay, then pipeline, on a freshly committed mode
    fn on_modeset(&mut self, ms: ModesetResult, now: Instant) {
        info!(
            "Display {} up: {}x{}@{} on video plane {}",
            ms.connector_name,
            ms.width,
            ms.height,
            ms.refresh_hz,
            ms.video_plane_id()
        );
        self.connected = true;
        if self.cfg.osd.enable {
            self.osd.teardown();
            if let Err(e) = self.osd.setup(&ms, self.cfg.osd.plane_id) {
                warn!("OSD setup failed: {}", e);
            }
            self.next_osd_refresh = Some(now);
        }
        self.sup.stop(STOP_DEADLINE);
        if self.cfg.display.stay_blue {
            info!("Stay-blue mode: pipeline not started");
        } else if let Err(e) = self.sup.start(&self.cfg, &ms) {
            error!("Failed to start pipeline: {}", e);
        }
        self.sup.begin_window(now);
        self.backoff.reset();
        self.modeset = Some(ms);
    }

    /// Restart for a SIGHUP and/or a pipeline-originated request
    pub fn handle_reinit(&mut self, sighup: u32, now: Instant) {
        let from_pipeline = self.sup.consume_reinit_request();
        let reason = match (from_pipeline, sighup > 0) {
            (false, false) => return,
            (true, true) => {
                warn!("SIGHUP received while a restart is already pending; combining requests");
                "IDR recovery loop"
            }
            (true, false) => "IDR recovery loop",
            (false, true) => "SIGHUP",
        };
        let Some(ms) = self.modeset.as_ref().filter(|_| self.connected) else {
            warn!("Pipeline restart requested ({}) but no display is connected; ignoring.", reason);
            return;
        };
        if self.cfg.display.stay_blue {
            debug!("Stay-blue mode: ignoring restart request ({})", reason);
            return;
        }
        if self.sup.restart_with_reason(&self.cfg, ms, reason, now).is_ok() {
            self.backoff.reset();
        }
    }

    /// React to one hotplug wakeup; returns how long to back off after a failed modeset
    pub fn handle_hotplug(&mut self, now: Instant) -> Option<Duration> {
        if !self.debounce.accept(now) {
            debug!("Hotplug debounced");
            return None;
        }
        counter!("hotplug_events").increment(1);
        let now_connected = self.display.is_connected(self.cfg.connector());
        info!("Hotplug: connected={}", now_connected);

        if !now_connected {
            self.sup.stop(STOP_DEADLINE);
            self.osd.disable();
            self.connected = false;
            return None;
        }
        match self.display.modeset(&self.cfg) {
            Ok(ms) => {
                self.on_modeset(ms, now);
                None
            }
            Err(e) => {
                counter!("modeset_failures").increment(1);
                let delay = self.backoff.next_delay();
                warn!("Modeset failed ({}); retry in {} ms", e, delay.as_millis());
                Some(delay)
            }
        }
    }

    pub fn apply_osd_toggles(&mut self, count: u32) {
        for _ in 0..count {
            self.toggle_osd();
        }
    }

    fn toggle_osd(&mut self) {
        self.osd_toggles_applied += 1;
        self.cfg.osd.enable = !self.cfg.osd.enable;
        if !self.cfg.osd.enable {
            info!("OSD toggle: disabling overlay");
            self.sup.set_stats_enabled(false);
            if self.osd.is_active() {
                self.osd.disable();
            }
            return;
        }

        info!("OSD toggle: enabling overlay");
        if !self.connected {
            info!("OSD toggle requested but no display is connected; will enable when possible.");
            return;
        }
        let Some(ms) = self.modeset.as_ref() else {
            return;
        };
        if !self.osd.is_enabled() {
            self.osd.teardown();
            if let Err(e) = self.osd.setup(ms, self.cfg.osd.plane_id) {
                warn!("OSD toggle: setup failed ({}); overlay remains disabled.", e);
            }
        } else if !self.osd.is_active() {
            if let Err(e) = self.osd.enable() {
                warn!("OSD toggle: enable failed: {}", e);
            }
        }
        self.next_osd_refresh = Some(Instant::now());
    }

    pub fn apply_record_toggles(&mut self, count: u32) {
        for _ in 0..count {
            self.recording_requested = !self.recording_requested;
            info!(
                "Record toggle: recording {} (recording is not built into this receiver)",
                if self.recording_requested { "requested" } else { "released" }
            );
        }
    }

    /// Redraw when the overlay is up and the refresh period has passed
    pub fn refresh_osd(&mut self, now: Instant) {
        let showing = self.cfg.osd.enable && self.connected && self.osd.is_active();
        self.sup.set_stats_enabled(showing);
        if !showing {
            return;
        }
        if let Some(due) = self.next_osd_refresh {
            if now < due {
                return;
            }
        }
        self.next_osd_refresh = Some(now + Duration::from_millis(self.cfg.osd.refresh_ms));

        let status = self.status();
        let bitrate = status.receiver.as_ref().map(|rx| rx.bitrate_mbps);
        if let Err(e) = self.osd.update(&status, bitrate) {
            debug!("OSD update failed: {}", e);
        }
    }

    /// Snapshot for the status box
    pub fn status(&self) -> Status {
        let mut status = Status {
            udp_port: self.cfg.pipeline.udp_port,
            latency_ms: self.cfg.pipeline.latency_ms,
            audio: self.sup.audio_mode(),
            pipeline: self.sup.phase(),
            restarts: self.sup.total_restarts(),
            receiver: self.sup.receiver_stats(),
            feed_text: self.feed.as_ref().map(|f| f.snapshot().lines()).unwrap_or_default(),
            ..Status::default()
        };
        if let Some(ms) = &self.modeset {
            status.width = ms.width;
            status.height = ms.height;
            status.refresh_hz = ms.refresh_hz;
            status.video_plane = ms.video_plane_id();
        }
        status
    }

    /// Restart a pipeline that ended on its own
    pub fn supervise(&mut self, now: Instant) {
        if !self.connected || self.cfg.display.stay_blue || !self.sup.is_stopped() {
            return;
        }
        let Some(ms) = self.modeset.as_ref() else {
            return;
        };
        if let Err(e) = self.sup.restart_after_exit(&self.cfg, ms, now) {
            warn!("Pipeline auto-restart failed: {}", e);
        }
    }

    /// One loop iteration minus the blocking hotplug wait
    pub fn tick(&mut self, sighup: u32, osd_toggles: u32, record_toggles: u32, now: Instant) {
        self.sup.poll_health();
        self.handle_reinit(sighup, now);
        self.apply_osd_toggles(osd_toggles);
        self.apply_record_toggles(record_toggles);
        self.refresh_osd(now);
        self.supervise(now);
    }

    /// Loop until SIGINT/SIGTERM
    pub fn run(&mut self) {
        self.startup(Instant::now());
        while !signals::exit_requested() {
            self.sup.poll_health();
            self.handle_reinit(signals::take_reinit_requests(), Instant::now());

            match self.hotplug.as_mut() {
                Some(hotplug) => {
                    if hotplug.wait(HOTPLUG_POLL) {
                        if let Some(delay) = self.handle_hotplug(Instant::now()) {
                            thread::sleep(delay);
                        }
                    }
                }
                None => thread::sleep(HOTPLUG_POLL),
            }

            self.apply_osd_toggles(signals::take_osd_toggles());
            self.apply_record_toggles(signals::take_record_toggles());
            let now = Instant::now();
            self.refresh_osd(now);
            self.supervise(now);
        }
        info!("Exit requested");
    }

    /// Release everything in dependency order
    pub fn shutdown(mut self) {
        self.sup.stop(STOP_DEADLINE);
        self.osd.disable();
        self.osd.teardown();
        drop(self.hotplug.take());
        if let Some(mut feed) = self.feed.take() {
            feed.stop();
        }
        debug!("Reactor resources released");
    }
}
