//! udev monitor filtered to DRM events
//!
//! Debouncing is left to the caller; this only reports "something happened on DRM".

use std::ffi::OsStr;
use std::fmt;
use std::os::fd::{AsFd, BorrowedFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, trace};

use crate::error::{Error, Result};

const DRM_SUBSYSTEM: &str = "drm";

/// The parts of a udev event the reactor cares about
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HotplugEvent {
    pub action: String,
    pub sysname: String,
    pub subsystem: Option<String>,
    /// `HOTPLUG=1` property; drivers set it on connector changes
    pub hotplug: bool,
}

impl HotplugEvent {
    fn from_udev(event: &udev::Event) -> Self {
        let lossy = |s: Option<&OsStr>| s.map(|s| s.to_string_lossy().into_owned());
        Self {
            action: lossy(event.action()).unwrap_or_else(|| "?".into()),
            sysname: event.sysname().to_string_lossy().into_owned(),
            subsystem: lossy(event.subsystem()),
            hotplug: event.property_value("HOTPLUG").is_some_and(|v| v == "1"),
        }
    }

    /// Any DRM action may change the topology; `HOTPLUG` is only logged
    pub fn is_drm(&self) -> bool {
        self.subsystem.as_deref() == Some(DRM_SUBSYSTEM)
    }
}

/// Non-blocking udev monitor socket on the `drm` subsystem
pub struct HotplugMonitor {
    socket: udev::MonitorSocket,
}

impl fmt::Debug for HotplugMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HotplugMonitor").finish_non_exhaustive()
    }
}

impl HotplugMonitor {
    pub fn open() -> Result<Self> {
        let socket = udev::MonitorBuilder::new()
            .and_then(|b| b.match_subsystem(DRM_SUBSYSTEM))
            .and_then(|b| b.listen())
            .map_err(Error::Hotplug)?;
        debug!("Hotplug monitor listening on udev ({})", DRM_SUBSYSTEM);
        Ok(Self { socket })
    }

    /// Wait up to `timeout` for events and drain them; true if any was a DRM event
    pub fn wait(&mut self, timeout: Duration) -> bool {
        let ms = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
        let mut fds = [PollFd::new(self.socket.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(ms)) {
            Ok(n) if n > 0 => {
                let mut drm = false;
                for _ in 0..64 {
                    match self.next_event() {
                        Some(is_drm) => drm |= is_drm,
                        None => break,
                    }
                }
                drm
            }
            Ok(_) | Err(Errno::EINTR) => false,
            Err(e) => {
                debug!("udev poll failed: {}", e);
                false
            }
        }
    }

    /// Drain one pending event; true if it came from the DRM subsystem
    pub fn did_hotplug(&mut self) -> bool {
        self.next_event().unwrap_or(false)
    }

    /// `None` once the socket is drained
    fn next_event(&mut self) -> Option<bool> {
        let event = HotplugEvent::from_udev(&self.socket.iter().next()?);
        trace!(
            "udev: subsys={:?} action={} sys={} hotplug={}",
            event.subsystem,
            event.action,
            event.sysname,
            event.hotplug
        );
        Some(event.is_drm())
    }
}

impl AsFd for HotplugMonitor {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }
}
