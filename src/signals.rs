//! Process signals folded into counters the reactor drains once per iteration
//!
//! The handlers only touch atomics. `SIGINT`/`SIGTERM` request exit, `SIGUSR1`
//! toggles the OSD, `SIGUSR2` toggles recording and `SIGHUP` asks for a
//! pipeline restart. Repeated signals between two drains accumulate.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::debug;

use crate::error::Result;

static EXIT: AtomicBool = AtomicBool::new(false);
static TOGGLE_OSD: AtomicU32 = AtomicU32::new(0);
static TOGGLE_RECORD: AtomicU32 = AtomicU32::new(0);
static REINIT: AtomicU32 = AtomicU32::new(0);

extern "C" fn on_signal(signo: libc::c_int) {
    match Signal::try_from(signo) {
        Ok(Signal::SIGINT) | Ok(Signal::SIGTERM) => EXIT.store(true, Ordering::SeqCst),
        Ok(Signal::SIGUSR1) => {
            TOGGLE_OSD.fetch_add(1, Ordering::SeqCst);
        }
        Ok(Signal::SIGUSR2) => {
            TOGGLE_RECORD.fetch_add(1, Ordering::SeqCst);
        }
        Ok(Signal::SIGHUP) => {
            REINIT.fetch_add(1, Ordering::SeqCst);
        }
        _ => {}
    }
}

/// Install the handlers for the signals above
pub fn install() -> Result<()> {
    let action = SigAction::new(SigHandler::Handler(on_signal), SaFlags::SA_RESTART, SigSet::empty());
    for sig in [
        Signal::SIGINT,
        Signal::SIGTERM,
        Signal::SIGUSR1,
        Signal::SIGUSR2,
        Signal::SIGHUP,
    ] {
        // SAFETY: the handler only performs atomic stores and adds
        unsafe { signal::sigaction(sig, &action) }?;
    }
    debug!("Signal handlers installed");
    Ok(())
}

pub fn exit_requested() -> bool {
    EXIT.load(Ordering::SeqCst)
}

pub fn request_exit() {
    EXIT.store(true, Ordering::SeqCst);
}

/// Pending OSD toggles since the last call
pub fn take_osd_toggles() -> u32 {
    TOGGLE_OSD.swap(0, Ordering::SeqCst)
}

pub fn take_record_toggles() -> u32 {
    TOGGLE_RECORD.swap(0, Ordering::SeqCst)
}

pub fn take_reinit_requests() -> u32 {
    REINIT.swap(0, Ordering::SeqCst)
}

/// Feed a signal through the handler without the kernel, for tests and tooling
pub fn inject(sig: Signal) {
    on_signal(sig as libc::c_int);
}

/// Clear every pending request
pub fn reset() {
    EXIT.store(false, Ordering::SeqCst);
    TOGGLE_OSD.store(0, Ordering::SeqCst);
    TOGGLE_RECORD.store(0, Ordering::SeqCst);
    REINIT.store(0, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    // one test so the shared statics are not raced by the parallel runner
    #[test]
    fn test_counters_accumulate_and_drain() {
        reset();
        inject(Signal::SIGUSR1);
        inject(Signal::SIGUSR1);
        inject(Signal::SIGHUP);
        inject(Signal::SIGUSR2);
        assert_eq!(take_osd_toggles(), 2);
        assert_eq!(take_osd_toggles(), 0);
        assert_eq!(take_reinit_requests(), 1);
        assert_eq!(take_record_toggles(), 1);
        assert!(!exit_requested());

        inject(Signal::SIGTERM);
        assert!(exit_requested());
        reset();
        assert!(!exit_requested());
    }
}
