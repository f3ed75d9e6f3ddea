//! Atomic KMS plumbing: device handle, properties, framebuffers, modeset and planes

pub mod dumb;
pub mod modes;
pub mod modeset;
pub mod planes;
pub mod props;

use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::Arc;

use drm::control::Device as ControlDevice;
use drm::{ClientCapability, Device as _};
use tracing::{info, warn};

use crate::error::{Error, Result};

pub use dumb::DumbFb;
pub use modes::ModeInfo;
pub use modeset::{ModesetOptions, ModesetResult};
pub use props::PropertySet;

/// Process-wide DRM card handle
///
/// Cloning shares the same file descriptor; it is closed when the last clone drops.
#[derive(Debug, Clone)]
pub struct Card(Arc<File>);

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl drm::Device for Card {}
impl ControlDevice for Card {}

impl Card {
    /// Open the DRM node read/write
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(path)
            .map_err(|source| Error::ConfigOpen {
                path: path.to_path_buf(),
                source,
            })?;
        info!("Opened DRM device: {}", path.display());
        Ok(Card(Arc::new(file)))
    }

    /// Request universal planes and atomic modesetting; refusal is logged, not fatal
    pub fn enable_atomic(&self) {
        for (cap, name) in [
            (ClientCapability::UniversalPlanes, "universal planes"),
            (ClientCapability::Atomic, "atomic"),
        ] {
            if let Err(e) = self.set_client_capability(cap, true) {
                warn!("DRM client cap {} refused: {}", name, e);
            }
        }
    }

    pub(crate) fn file(&self) -> &File {
        &self.0
    }
}
