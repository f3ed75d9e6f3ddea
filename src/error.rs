//! Error types for the display/pipeline control core

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::pipeline::PipelineState;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the control core
#[derive(Debug, Error)]
pub enum Error {
    /// The DRM device node could not be opened
    #[error("cannot open DRM device {}: {source}", path.display())]
    ConfigOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// No connector is connected with at least one mode
    #[error("no connected display with usable modes")]
    NoConnectedSink,

    /// The connector has no encoder that can reach a CRTC
    #[error("connector {0} has no admissible CRTC")]
    NoAdmissibleCrtc(u32),

    /// A required KMS property is not exported by the driver
    #[error("{object} {id} is missing required property {name}")]
    MissingProperty {
        object: &'static str,
        id: u32,
        name: String,
    },

    /// The property exists but does not carry a range
    #[error("property {0} is not range-typed")]
    NotRangeProperty(String),

    /// MODE_ID blob could not be created
    #[error("failed to create mode blob: {0}")]
    BlobCreationFailed(#[source] io::Error),

    /// Dumb buffer allocation, mapping or framebuffer registration failed
    #[error("failed to create framebuffer: {0}")]
    FramebufferCreationFailed(#[source] io::Error),

    /// The kernel refused to add a framebuffer in this pixel format
    #[error("driver cannot scan out {0} framebuffers")]
    UnsupportedFormat(&'static str),

    /// The atomic commit was refused by the driver
    #[error("atomic commit rejected: {0}")]
    CommitRejected(#[source] io::Error),

    /// No plane passed the overlay probe
    #[error("no plane can carry the overlay")]
    NoSuitablePlane,

    /// No plane can scan out NV12 video on the CRTC
    #[error("no plane can carry video on CRTC {0}")]
    NoVideoPlane(u32),

    /// The media pipeline failed to come up
    #[error("pipeline start failed: {0}")]
    PipelineStartFailed(String),

    /// The media pipeline had to be torn down forcefully
    #[error("pipeline did not stop within {0} ms")]
    PipelineStopTimeout(u64),

    /// Start was requested while the pipeline was not stopped
    #[error("pipeline is {0}, start refused")]
    PipelineBusy(PipelineState),

    /// Another process holds the pid file
    #[error("another instance is running (pid {0})")]
    InstanceRunning(i32),

    /// Kernel uevent channel failure
    #[error("hotplug monitor: {0}")]
    Hotplug(#[source] io::Error),

    /// Configuration file or environment could not be loaded
    #[error("configuration: {0}")]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether the modeset backoff loop should try again
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::NoConnectedSink
                | Error::NoAdmissibleCrtc(_)
                | Error::BlobCreationFailed(_)
                | Error::FramebufferCreationFailed(_)
                | Error::CommitRejected(_)
        )
    }

    pub(crate) fn missing(object: &'static str, id: u32, name: &str) -> Self {
        Error::MissingProperty {
            object,
            id,
            name: name.to_string(),
        }
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(errno: nix::errno::Errno) -> Self {
        Error::Io(io::Error::from(errno))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        assert!(Error::NoConnectedSink.is_retriable());
        assert!(Error::CommitRejected(io::Error::from_raw_os_error(libc::EINVAL)).is_retriable());
        assert!(!Error::missing("plane", 31, "FB_ID").is_retriable());
        assert!(!Error::NoSuitablePlane.is_retriable());
    }

    #[test]
    fn test_missing_property_message() {
        let err = Error::missing("crtc", 42, "MODE_ID");
        assert_eq!(err.to_string(), "crtc 42 is missing required property MODE_ID");
    }
}
