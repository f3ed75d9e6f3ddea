//! PixelPilot Mini RK: HDMI receiver on atomic KMS with a GStreamer kmssink pipeline

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::Result;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pixelpilot_mini::cli::Args;
use pixelpilot_mini::feed::ExternalFeed;
use pixelpilot_mini::hotplug::HotplugMonitor;
use pixelpilot_mini::instance::InstanceLock;
use pixelpilot_mini::kms::Card;
use pixelpilot_mini::osd::Osd;
use pixelpilot_mini::pipeline::gst::GstPipeline;
use pixelpilot_mini::reactor::{KmsDisplay, Reactor};
use pixelpilot_mini::{signals, utils};

fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    let args = Args::parse();

    let default_level = if args.verbose { "pixelpilot_mini=debug" } else { "pixelpilot_mini=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("PixelPilot Mini RK launching...");

    let config = args.resolve()?;
    pixelpilot_mini::CONFIG.store(Arc::new(config.clone()));

    if config.gst_log && std::env::var_os("GST_DEBUG").is_none() {
        std::env::set_var("GST_DEBUG", "3");
    }

    let pid_lock = InstanceLock::acquire(&config.pid_file)?;
    signals::install()?;

    let card_path = utils::resolve_card(&config.display.card)?;
    let card = Card::open(&card_path)?;
    card.enable_atomic();

    let hotplug = if config.display.use_udev {
        match HotplugMonitor::open() {
            Ok(monitor) => Some(monitor),
            Err(e) => {
                warn!("{}; continuing without hotplug", e);
                None
            }
        }
    } else {
        None
    };

    let feed = if config.feed.enable {
        match ExternalFeed::start(&config.feed.bind) {
            Ok(feed) => Some(feed),
            Err(e) => {
                warn!("External OSD feed disabled: {}", e);
                None
            }
        }
    } else {
        None
    };

    let osd = Osd::new(
        card.clone(),
        Duration::from_millis(config.osd.refresh_ms),
        Duration::from_secs(config.osd.plot_window_s),
    );
    let pipeline = GstPipeline::new(card.clone())?;
    let display = KmsDisplay::new(card);

    let mut reactor = Reactor::new(config, pipeline, display, osd, hotplug, feed);
    reactor.run();
    // the last card clone goes with the reactor, before the PID file
    reactor.shutdown();
    drop(pid_lock);

    info!("Bye.");
    Ok(())
}
