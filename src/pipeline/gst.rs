//! GStreamer RTP/H.265 decode pipeline scanning out through `kmssink`
//!
//! The launch description is built as plain text so it can be inspected without
//! GStreamer; the running pipeline needs the `gstreamer-pipeline` feature.

use crate::Config;

/// Hardware decoders first, software last
pub const H265_DECODERS: [&str; 4] = ["mppvideodec", "v4l2slh265dec", "v4l2h265dec", "avdec_h265"];

pub const VIDEO_SRC: &str = "video_src";
pub const AUDIO_SRC: &str = "audio_src";

/// How the audio branch should be built
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioBranch {
    Absent,
    Fake,
    Alsa,
}

impl AudioBranch {
    pub fn select(cfg: &Config, audio_disabled: bool) -> Self {
        if cfg.pipeline.no_audio {
            AudioBranch::Absent
        } else if audio_disabled {
            AudioBranch::Fake
        } else {
            AudioBranch::Alsa
        }
    }
}

/// Scanout target handed to `kmssink`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scanout {
    pub fd: i32,
    pub plane_id: u32,
    pub connector_id: u32,
}

pub fn video_branch(cfg: &Config, decoder: &str, out: &Scanout) -> String {
    let p = &cfg.pipeline;
    format!(
        "appsrc name={VIDEO_SRC} is-live=true format=time do-timestamp=true max-bytes=4194304 \
         caps=\"application/x-rtp,media=video,encoding-name=H265,clock-rate=90000,payload={pt}\" ! \
         rtpjitterbuffer latency={latency} ! rtph265depay ! \
         h265parse config-interval=-1 ! video/x-h265,stream-format=byte-stream,alignment=au ! \
         {decoder} ! \
         kmssink name=video_sink fd={fd} plane-id={plane} connector-id={connector} \
         sync={sync} qos={qos} max-lateness={lateness}",
        pt = p.vid_pt,
        latency = p.latency_ms,
        fd = out.fd,
        plane = out.plane_id,
        connector = out.connector_id,
        sync = p.sync,
        qos = p.qos,
        lateness = p.max_lateness_ns,
    )
}

pub fn audio_branch(cfg: &Config, branch: AudioBranch) -> Option<String> {
    let p = &cfg.pipeline;
    let src = format!(
        "appsrc name={AUDIO_SRC} is-live=true format=time do-timestamp=true max-bytes=1048576 \
         caps=\"application/x-rtp,media=audio,encoding-name=OPUS,clock-rate=48000,payload={}\"",
        p.aud_pt
    );
    match branch {
        AudioBranch::Absent => None,
        AudioBranch::Fake => Some(format!("{src} ! fakesink sync=false")),
        AudioBranch::Alsa => Some(format!(
            "{src} ! rtpjitterbuffer latency={} ! rtpopusdepay ! opusdec ! audioconvert ! \
             audioresample ! queue ! alsasink device=\"{}\" sync=false",
            p.latency_ms, p.aud_dev
        )),
    }
}

/// Full `gst-launch` style description
pub fn launch_description(cfg: &Config, decoder: &str, out: &Scanout, branch: AudioBranch) -> String {
    let video = video_branch(cfg, decoder, out);
    match audio_branch(cfg, branch) {
        Some(audio) => format!("{video}  {audio}"),
        None => video,
    }
}

#[cfg(feature = "gstreamer-pipeline")]
pub use backend::GstPipeline;

#[cfg(feature = "gstreamer-pipeline")]
mod backend {
    use std::os::fd::{AsFd, AsRawFd};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread::{self, JoinHandle};
    use std::time::{Duration, Instant};

    use bytes::Bytes;
    use gstreamer as gst;
    use gstreamer::prelude::*;
    use gstreamer_app as gst_app;
    use tracing::{debug, error, info, trace, warn};

    use super::{launch_description, AudioBranch, Scanout, AUDIO_SRC, H265_DECODERS, VIDEO_SRC};
    use crate::error::{Error, Result};
    use crate::kms::{Card, ModesetResult};
    use crate::pipeline::idr::{IdrConfig, IdrRequester};
    use crate::pipeline::receiver::{PacketSink, ReceiverConfig, Stream, UdpReceiver};
    use crate::pipeline::{MediaPipeline, PipelineState, ReceiverStats};
    use crate::Config;

    #[derive(Debug)]
    enum BusEvent {
        Eos,
        Error(String),
        Warning(String),
    }

    /// Forwards datagrams into the two appsrc elements
    struct AppSrcSink {
        video: gst_app::AppSrc,
        audio: Option<gst_app::AppSrc>,
    }

    impl PacketSink for AppSrcSink {
        fn push(&self, stream: Stream, packet: Bytes) {
            let src = match (stream, &self.audio) {
                (Stream::Video, _) => &self.video,
                (Stream::Audio, Some(audio)) => audio,
                (Stream::Audio, None) => return,
            };
            if let Err(flow) = src.push_buffer(gst::Buffer::from_slice(packet)) {
                trace!("appsrc push returned {:?}", flow);
            }
        }

        fn finish(&self) {
            if let Err(flow) = self.video.end_of_stream() {
                warn!("video appsrc end-of-stream returned {:?}", flow);
            }
            if let Some(audio) = &self.audio {
                if let Err(flow) = audio.end_of_stream() {
                    warn!("audio appsrc end-of-stream returned {:?}", flow);
                }
            }
        }
    }

    /// Best decoder available in the registry
    fn detect_decoder() -> &'static str {
        for name in H265_DECODERS {
            if gst::ElementFactory::find(name).is_some() {
                debug!("Using H.265 decoder {}", name);
                return name;
            }
        }
        warn!("No H.265 decoder found in the registry, trying avdec_h265");
        "avdec_h265"
    }

    fn app_src(pipeline: &gst::Pipeline, name: &str) -> Result<gst_app::AppSrc> {
        pipeline
            .by_name(name)
            .and_then(|e| e.dynamic_cast::<gst_app::AppSrc>().ok())
            .ok_or_else(|| Error::PipelineStartFailed(format!("missing appsrc {}", name)))
    }

    fn bus_loop(bus: gst::Bus, tx: flume::Sender<BusEvent>, stop: Arc<AtomicBool>, idr: Arc<IdrRequester>) {
        use gst::MessageView;

        while !stop.load(Ordering::Acquire) {
            let Some(msg) = bus.timed_pop(gst::ClockTime::from_mseconds(100)) else {
                continue;
            };
            let event = match msg.view() {
                MessageView::Eos(..) => BusEvent::Eos,
                MessageView::Error(err) => BusEvent::Error(format!(
                    "{} from {:?} ({:?})",
                    err.error(),
                    err.src().map(|s| s.path_string()),
                    err.debug()
                )),
                MessageView::Warning(w) => {
                    idr.notify_warning();
                    BusEvent::Warning(format!("{} ({:?})", w.error(), w.debug()))
                }
                _ => continue,
            };
            let terminal = !matches!(event, BusEvent::Warning(_));
            if tx.send(event).is_err() || terminal {
                break;
            }
        }
    }

    struct Running {
        pipeline: gst::Pipeline,
        receiver: UdpReceiver,
        events: flume::Receiver<BusEvent>,
        bus_stop: Arc<AtomicBool>,
        bus_thread: Option<JoinHandle<()>>,
        idr: Arc<IdrRequester>,
    }

    impl Running {
        fn shutdown(mut self) {
            self.receiver.stop();
            if let Err(e) = self.pipeline.set_state(gst::State::Null) {
                warn!("Pipeline to NULL failed: {:?}", e);
            }
            self.bus_stop.store(true, Ordering::Release);
            if let Some(thread) = self.bus_thread.take() {
                if thread.join().is_err() {
                    error!("Pipeline bus thread panicked");
                }
            }
        }
    }

    /// [`MediaPipeline`] backed by GStreamer
    pub struct GstPipeline {
        card: Card,
        running: Option<Running>,
        state: PipelineState,
        stats_enabled: bool,
        reinit_requested: bool,
    }

    impl std::fmt::Debug for GstPipeline {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("GstPipeline")
                .field("state", &self.state)
                .field("stats_enabled", &self.stats_enabled)
                .finish()
        }
    }

    impl GstPipeline {
        pub fn new(card: Card) -> Result<Self> {
            gst::init().map_err(|e| Error::PipelineStartFailed(format!("GStreamer init: {}", e)))?;
            info!("GStreamer {}", gst::version_string());
            Ok(Self {
                card,
                running: None,
                state: PipelineState::Stopped,
                stats_enabled: false,
                reinit_requested: false,
            })
        }

        fn build(&self, cfg: &Config, ms: &ModesetResult, audio_disabled: bool) -> Result<Running> {
            let branch = AudioBranch::select(cfg, audio_disabled);
            let out = Scanout {
                fd: self.card.as_fd().as_raw_fd(),
                plane_id: ms.video_plane_id(),
                connector_id: ms.connector_id(),
            };
            let description = launch_description(cfg, detect_decoder(), &out, branch);
            info!("Pipeline: {}", description);

            let pipeline = gst::parse::launch(&description)
                .map_err(|e| Error::PipelineStartFailed(e.to_string()))?
                .downcast::<gst::Pipeline>()
                .map_err(|_| Error::PipelineStartFailed("launch did not yield a pipeline".into()))?;

            let sink = AppSrcSink {
                video: app_src(&pipeline, VIDEO_SRC)?,
                audio: match branch {
                    AudioBranch::Absent => None,
                    _ => Some(app_src(&pipeline, AUDIO_SRC)?),
                },
            };

            let bus = pipeline
                .bus()
                .ok_or_else(|| Error::PipelineStartFailed("pipeline has no bus".into()))?;
            let idr = IdrRequester::new(IdrConfig {
                enabled: cfg.idr.enable,
                http_port: cfg.idr.http_port,
                path: cfg.idr.path.clone(),
                timeout: Duration::from_millis(cfg.idr.timeout_ms),
            });
            let (tx, events) = flume::unbounded();
            let bus_stop = Arc::new(AtomicBool::new(false));
            let bus_thread = {
                let stop = Arc::clone(&bus_stop);
                let idr = Arc::clone(&idr);
                thread::Builder::new()
                    .name("gst-bus".into())
                    .spawn(move || bus_loop(bus, tx, stop, idr))?
            };

            let receiver = UdpReceiver::start(
                ReceiverConfig {
                    port: cfg.pipeline.udp_port,
                    video_pt: cfg.pipeline.vid_pt,
                    audio_pt: cfg.pipeline.aud_pt,
                    audio: branch != AudioBranch::Absent,
                    cpu: cfg.pipeline.cpu_list.first().copied(),
                },
                sink,
            );
            let receiver = match receiver {
                Ok(r) => r,
                Err(e) => {
                    bus_stop.store(true, Ordering::Release);
                    let _ = bus_thread.join();
                    return Err(e);
                }
            };
            receiver.set_stats_enabled(self.stats_enabled);

            Ok(Running {
                pipeline,
                receiver,
                events,
                bus_stop,
                bus_thread: Some(bus_thread),
                idr,
            })
        }

        fn teardown(&mut self) {
            if let Some(running) = self.running.take() {
                running.shutdown();
            }
            self.state = PipelineState::Stopped;
        }
    }

    impl MediaPipeline for GstPipeline {
        fn start(&mut self, cfg: &Config, ms: &ModesetResult, audio_disabled: bool) -> Result<()> {
            if self.running.is_some() {
                return Err(Error::PipelineBusy(self.state));
            }
            let running = self.build(cfg, ms, audio_disabled)?;
            if let Err(e) = running.pipeline.set_state(gst::State::Playing) {
                running.shutdown();
                return Err(Error::PipelineStartFailed(format!("set PLAYING: {:?}", e)));
            }
            self.reinit_requested = false;
            self.running = Some(running);
            self.state = PipelineState::Running;
            Ok(())
        }

        fn stop(&mut self, deadline: Duration) {
            let Some(running) = self.running.as_mut() else {
                return;
            };
            self.state = PipelineState::Stopping;
            // stopping the receiver sends end-of-stream into the appsrc elements
            running.receiver.stop();
            let until = Instant::now() + deadline;
            let mut clean = false;
            loop {
                let left = until.saturating_duration_since(Instant::now());
                match running.events.recv_timeout(left) {
                    Ok(BusEvent::Eos) => {
                        clean = true;
                        break;
                    }
                    Ok(BusEvent::Error(msg)) => {
                        warn!("Pipeline error while stopping: {}", msg);
                        break;
                    }
                    Ok(BusEvent::Warning(_)) => continue,
                    Err(_) => break,
                }
            }
            if !clean {
                warn!("{}; forcing teardown", Error::PipelineStopTimeout(deadline.as_millis() as u64));
            }
            self.teardown();
        }

        fn poll(&mut self) -> PipelineState {
            let Some(running) = self.running.as_ref() else {
                return self.state;
            };
            if let Some(src) = running.receiver.source() {
                running.idr.set_source(src.ip());
            }
            if running.idr.take_reinit() {
                self.reinit_requested = true;
            }

            let mut ended = false;
            for event in running.events.try_iter() {
                match event {
                    BusEvent::Eos => {
                        info!("Pipeline reached end of stream");
                        ended = true;
                    }
                    BusEvent::Error(msg) => {
                        error!("Pipeline error: {}", msg);
                        ended = true;
                    }
                    BusEvent::Warning(msg) => debug!("Pipeline warning: {}", msg),
                }
            }
            if ended {
                self.teardown();
            }
            self.state
        }

        fn consume_reinit_request(&mut self) -> bool {
            std::mem::take(&mut self.reinit_requested)
        }

        fn receiver_stats(&self) -> Option<ReceiverStats> {
            let running = self.running.as_ref()?;
            self.stats_enabled.then(|| running.receiver.stats())
        }

        fn set_stats_enabled(&mut self, enabled: bool) {
            self.stats_enabled = enabled;
            if let Some(running) = &self.running {
                running.receiver.set_stats_enabled(enabled);
            }
        }
    }

    impl Drop for GstPipeline {
        fn drop(&mut self) {
            self.teardown();
        }
    }
}
