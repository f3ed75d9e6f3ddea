use std::path::{Path, PathBuf};
use std::time::Instant;

use drm::control::Device as ControlDevice;
use once_cell::sync::Lazy;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::kms::Card;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Nanoseconds on the process monotonic clock
pub fn monotonic_ns() -> u64 {
    EPOCH.elapsed().as_nanos() as u64
}

pub fn monotonic_ms() -> u64 {
    EPOCH.elapsed().as_millis() as u64
}

/// Auto-detect a DRM card exposing at least one connector
pub fn auto_detect_card() -> Result<PathBuf> {
    info!("Auto-detecting DRM cards...");

    for i in 0..8 {
        let path = PathBuf::from(format!("/dev/dri/card{}", i));
        if !path.exists() {
            continue;
        }
        match Card::open(&path) {
            Ok(card) => match card.resource_handles() {
                Ok(res) if !res.connectors().is_empty() => {
                    info!("Found KMS card: {} ({} connectors)", path.display(), res.connectors().len());
                    return Ok(path);
                }
                Ok(_) => debug!("{} has no connectors", path.display()),
                Err(e) => debug!("{}: no mode resources: {}", path.display(), e),
            },
            Err(e) => warn!("{}", e),
        }
    }

    Err(Error::NoConnectedSink)
}

/// Card to open: the configured one when it exists, otherwise auto-detected
pub fn resolve_card(configured: &Path) -> Result<PathBuf> {
    if configured.exists() {
        return Ok(configured.to_path_buf());
    }
    warn!("{} does not exist; probing other cards", configured.display());
    auto_detect_card()
}

/// Parse `"2,3"` or `"0-3,6"` into CPU indices, keeping the given order
pub fn parse_cpu_list(list: &str) -> std::result::Result<Vec<usize>, String> {
    let mut cpus = Vec::new();
    for part in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: usize = lo.trim().parse().map_err(|_| format!("bad CPU range '{}'", part))?;
                let hi: usize = hi.trim().parse().map_err(|_| format!("bad CPU range '{}'", part))?;
                if lo > hi {
                    return Err(format!("bad CPU range '{}'", part));
                }
                cpus.extend(lo..=hi);
            }
            None => cpus.push(part.parse().map_err(|_| format!("bad CPU index '{}'", part))?),
        }
    }
    Ok(cpus)
}

/// Pin the calling thread; logs and carries on when the CPU does not exist
pub fn pin_current_thread(cpu: usize) -> bool {
    let pinned = core_affinity::set_for_current(core_affinity::CoreId { id: cpu });
    if pinned {
        debug!("Pinned {:?} to CPU {}", std::thread::current().name(), cpu);
    } else {
        warn!("Failed to pin thread to CPU {}", cpu);
    }
    pinned
}
