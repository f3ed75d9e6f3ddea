//! On-screen diagnostic overlay on a second hardware plane
//!
//! The overlay owns one ARGB dumb framebuffer, drawn in place every refresh.
//! `setup`/`teardown` acquire and release the plane and buffer; `enable`/`disable`
//! only bind and unbind the plane, keeping the buffer around.

pub mod canvas;
pub mod font;
pub mod plot;
pub mod render;

use std::io;
use std::time::{Duration, Instant};

use drm::control::atomic::AtomicModeReq;
use drm::control::{crtc, plane, property, AtomicCommitFlags, Device as ControlDevice};
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::kms::planes;
use crate::kms::props::{PlaneProps, PropertySet};
use crate::kms::{Card, DumbFb, ModesetResult};
use crate::pipeline::{AudioMode, PipelineState, ReceiverStats};

use canvas::Canvas;
use plot::RollingPlot;
use render::{Frame, Layout, Renderer, FILL_CLEAR, FILL_INITIAL};

pub const TITLE: &str = "PIXELPILOT MINI RK";
pub const PLOT_LABEL: &str = "BITRATE";
pub const PLOT_UNIT: &str = "MBPS";

/// Values shown in the status box
#[derive(Debug, Clone, Default)]
pub struct Status {
    pub width: u32,
    pub height: u32,
    pub refresh_hz: u32,
    pub video_plane: u32,
    pub udp_port: u16,
    pub latency_ms: u32,
    pub audio: AudioMode,
    pub pipeline: PipelineState,
    pub restarts: u32,
    pub receiver: Option<ReceiverStats>,
    pub feed_text: Vec<String>,
}

impl Status {
    pub fn lines(&self) -> Vec<String> {
        let mut lines = vec![
            TITLE.to_string(),
            format!(
                "MODE {}x{}@{} PLANE {}",
                self.width, self.height, self.refresh_hz, self.video_plane
            ),
            format!("UDP {} LATENCY {} ms", self.udp_port, self.latency_ms),
            format!("AUDIO {} PIPE {}", self.audio, self.pipeline),
            format!("RESTARTS {}", self.restarts),
        ];
        if let Some(rx) = &self.receiver {
            lines.push(format!(
                "RX {} LOST {} JITTER {:.1} ms",
                rx.video_packets,
                rx.lost,
                rx.jitter_ms()
            ));
        }
        lines.extend(self.feed_text.iter().filter(|t| !t.is_empty()).cloned());
        lines
    }
}

/// Overlay plane state
#[derive(Debug)]
pub struct Osd {
    card: Card,
    refresh: Duration,
    window: Duration,
    /// Plane picked and framebuffer allocated
    enabled: bool,
    /// Plane currently bound to the CRTC
    active: bool,
    plane: Option<plane::Handle>,
    crtc: Option<crtc::Handle>,
    props: Option<PlaneProps>,
    zmax: u64,
    fb: Option<DumbFb>,
    renderer: Option<Renderer>,
    plot: RollingPlot,
}

impl Osd {
    pub fn new(card: Card, refresh: Duration, window: Duration) -> Self {
        Self {
            card,
            refresh,
            window,
            enabled: false,
            active: false,
            plane: None,
            crtc: None,
            props: None,
            zmax: 0,
            fb: None,
            renderer: None,
            plot: RollingPlot::new(window, refresh),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn plane_id(&self) -> Option<u32> {
        self.plane.map(u32::from)
    }

    pub fn layout(&self) -> Option<&Layout> {
        self.renderer.as_ref().map(Renderer::layout)
    }

    pub fn plot(&self) -> &RollingPlot {
        &self.plot
    }

    /// Pick a plane next to the video plane, allocate the canvas and bind it
    pub fn setup(&mut self, ms: &ModesetResult, requested_plane: u32) -> Result<()> {
        if self.enabled {
            self.teardown();
        }

        let (plane, zmax) = match planes::pick_osd_plane(
            &self.card,
            ms.crtc,
            ms.video_plane,
            requested_plane,
            (ms.width, ms.height),
        ) {
            Ok(picked) => picked,
            Err(e) => {
                warn!("OSD disabled: {}", e);
                return Err(e);
            }
        };

        let props = PlaneProps::resolve(&PropertySet::query(&self.card, plane, "plane")?)?;
        let layout = Layout::for_mode(ms.width, ms.height);
        let mut fb = DumbFb::create_argb(&self.card, layout.width, layout.height, FILL_INITIAL)?;
        fb.fill(FILL_CLEAR);

        info!(
            plane = u32::from(plane),
            "OSD canvas {}x{} scale {} on plane {}",
            layout.width,
            layout.height,
            layout.scale,
            u32::from(plane)
        );

        self.plane = Some(plane);
        self.crtc = Some(ms.crtc);
        self.props = Some(props);
        self.zmax = zmax;
        self.fb = Some(fb);
        self.renderer = Some(Renderer::new(layout));
        self.plot = RollingPlot::new(self.window, self.refresh);
        self.enabled = true;

        if let Err(e) = self.enable() {
            warn!("OSD plane {} commit failed: {}", u32::from(plane), e);
            self.teardown();
            return Err(e);
        }
        Ok(())
    }

    /// Bind the plane with the overlay framebuffer on top
    pub fn enable(&mut self) -> Result<()> {
        if !self.enabled {
            return Err(Error::NoSuitablePlane);
        }
        if self.active {
            return Ok(());
        }
        let (Some(plane), Some(crtc), Some(props), Some(fb)) =
            (self.plane, self.crtc, self.props.as_ref(), self.fb.as_ref())
        else {
            return Err(Error::NoSuitablePlane);
        };
        let fb_handle = fb
            .framebuffer()
            .ok_or_else(|| Error::FramebufferCreationFailed(io::Error::other("OSD framebuffer released")))?;
        let size = (fb.width(), fb.height());

        let mut req = AtomicModeReq::new();
        props.attach(&mut req, plane, fb_handle, crtc, size, size);
        props.set_zpos(&mut req, plane, self.zmax);
        if let Some((alpha, _, max)) = props.alpha {
            let opaque = if max == 0 { 0xFFFF } else { max };
            req.add_property(plane, alpha, property::Value::UnsignedRange(opaque));
        }
        if let Some((blend, code)) = props.blend {
            req.add_property(plane, blend, property::Value::Unknown(code));
        }
        self.card
            .atomic_commit(AtomicCommitFlags::empty(), req)
            .map_err(Error::CommitRejected)?;

        self.active = true;
        debug!("OSD plane {} bound at zpos {}", u32::from(plane), self.zmax);
        Ok(())
    }

    /// Unbind the plane, keeping the framebuffer for a later `enable`
    pub fn disable(&mut self) {
        if !self.active {
            return;
        }
        if let (Some(plane), Some(props)) = (self.plane, self.props.as_ref()) {
            let mut req = AtomicModeReq::new();
            props.detach(&mut req, plane);
            if let Err(e) = self.card.atomic_commit(AtomicCommitFlags::empty(), req) {
                warn!("OSD detach of plane {} failed: {}", u32::from(plane), e);
            }
        }
        self.active = false;
        debug!("OSD disabled");
    }

    /// Unbind the plane and release the framebuffer; safe to call repeatedly
    pub fn teardown(&mut self) {
        self.disable();
        if let Some(mut fb) = self.fb.take() {
            fb.destroy();
        }
        self.enabled = false;
        self.plane = None;
        self.crtc = None;
        self.props = None;
        self.renderer = None;
        self.zmax = 0;
    }

    /// Push the latest sample, redraw and nudge the driver to re-sample the buffer
    pub fn update(&mut self, status: &Status, bitrate_mbps: Option<f64>) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        let started = Instant::now();
        if let Some(v) = bitrate_mbps {
            self.plot.push(v);
        }

        let lines = status.lines();
        let frame = Frame {
            lines: &lines,
            label: PLOT_LABEL,
            unit: PLOT_UNIT,
            have_stats: status.receiver.is_some(),
        };
        let (Some(fb), Some(renderer)) = (self.fb.as_mut(), self.renderer.as_mut()) else {
            return Ok(());
        };
        let (w, h, pitch) = (fb.width(), fb.height(), fb.pitch());
        let mut canvas = Canvas::new(fb.pixels_mut(), w, h, pitch);
        renderer.draw(&mut canvas, &frame, &mut self.plot);
        histogram!("osd_render_seconds").record(started.elapsed().as_secs_f64());

        self.touch()
    }

    /// Minimal commit re-stating FB_ID and CRTC_ID
    fn touch(&self) -> Result<()> {
        let (Some(plane), Some(crtc), Some(props), Some(fb)) =
            (self.plane, self.crtc, self.props.as_ref(), self.fb.as_ref())
        else {
            return Ok(());
        };
        let Some(fb_handle) = fb.framebuffer() else {
            return Ok(());
        };
        let mut req = AtomicModeReq::new();
        req.add_property(plane, props.fb_id, property::Value::Framebuffer(Some(fb_handle)));
        req.add_property(plane, props.crtc_id, property::Value::CRTC(Some(crtc)));
        self.card
            .atomic_commit(AtomicCommitFlags::empty(), req)
            .map_err(|e| {
                counter!("osd_commit_failures").increment(1);
                Error::CommitRejected(e)
            })
    }
}

impl Drop for Osd {
    fn drop(&mut self) {
        self.teardown();
    }
}
