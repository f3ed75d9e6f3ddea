//! External OSD feed: UDP JSON datagrams into a lock-free snapshot
//!
//! A datagram looks like `{"text":["LINK OK"],"value":[12.5],"ttl_ms":2000}`.
//! Slot `i` of each array updates text/value slot `i`; an empty array clears
//! every slot of that kind. With `ttl_ms` the written slots expire, and until
//! then a message without `ttl_ms` cannot overwrite them.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::utils::monotonic_ms;

pub const MAX_TEXT: usize = 8;
pub const MAX_VALUES: usize = 8;
pub const TEXT_LEN: usize = 64;

const READ_TIMEOUT: Duration = Duration::from_millis(200);

/// What the OSD reads
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedSnapshot {
    pub text: [String; MAX_TEXT],
    pub value: [f64; MAX_VALUES],
    pub last_update_ms: u64,
}

impl FeedSnapshot {
    /// Non-empty text slots in slot order
    pub fn lines(&self) -> Vec<String> {
        self.text.iter().filter(|t| !t.is_empty()).cloned().collect()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct FeedMessage {
    pub text: Option<Vec<String>>,
    pub value: Option<Vec<f64>>,
    pub ttl_ms: Option<i64>,
}

impl FeedMessage {
    pub fn parse(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    text_active: bool,
    value_active: bool,
    /// 0 means no expiry
    text_expiry_ms: u64,
    value_expiry_ms: u64,
}

/// Slot bookkeeping; pure so it can be driven with synthetic time
#[derive(Debug, Default)]
pub struct FeedState {
    slots: [Slot; MAX_TEXT],
    snap: FeedSnapshot,
}

impl FeedState {
    pub fn snapshot(&self) -> &FeedSnapshot {
        &self.snap
    }

    /// Drop expired slots; true when anything changed
    pub fn expire(&mut self, now_ms: u64) -> bool {
        let mut changed = false;
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.text_active && slot.text_expiry_ms > 0 && now_ms >= slot.text_expiry_ms {
                slot.text_active = false;
                slot.text_expiry_ms = 0;
                changed |= !self.snap.text[i].is_empty();
                self.snap.text[i].clear();
            }
            if slot.value_active && slot.value_expiry_ms > 0 && now_ms >= slot.value_expiry_ms {
                slot.value_active = false;
                slot.value_expiry_ms = 0;
                changed |= self.snap.value[i] != 0.0;
                self.snap.value[i] = 0.0;
            }
        }
        if changed {
            self.snap.last_update_ms = now_ms;
        }
        changed
    }

    /// Merge one message; true when the snapshot changed
    pub fn apply(&mut self, msg: &FeedMessage, now_ms: u64) -> bool {
        let mut changed = self.expire(now_ms);
        let has_ttl = msg.ttl_ms.is_some();
        let expiry = match msg.ttl_ms {
            Some(ttl) if ttl > 0 => now_ms.saturating_add(ttl as u64),
            _ => 0,
        };

        let texts = msg.text.as_deref().unwrap_or_default();
        let values = msg.value.as_deref().unwrap_or_default();

        if msg.text.is_some() && texts.is_empty() {
            for (i, slot) in self.slots.iter_mut().enumerate() {
                changed |= slot.text_active || !self.snap.text[i].is_empty();
                slot.text_active = false;
                slot.text_expiry_ms = 0;
                self.snap.text[i].clear();
            }
        }
        if msg.value.is_some() && values.is_empty() {
            for (i, slot) in self.slots.iter_mut().enumerate() {
                changed |= slot.value_active || self.snap.value[i] != 0.0;
                slot.value_active = false;
                slot.value_expiry_ms = 0;
                self.snap.value[i] = 0.0;
            }
        }

        let count = texts.len().max(values.len()).min(MAX_TEXT);
        for i in 0..count {
            let slot = &mut self.slots[i];
            let text = texts.get(i).map(String::as_str).unwrap_or("");
            if !text.is_empty() {
                let guarded = slot.text_active && slot.text_expiry_ms > now_ms && !has_ttl;
                if !guarded {
                    let text = truncate(text);
                    changed |= !slot.text_active || self.snap.text[i] != text;
                    self.snap.text[i] = text;
                    slot.text_active = true;
                    slot.text_expiry_ms = expiry;
                }
            }
            if let Some(&value) = values.get(i).filter(|_| i < MAX_VALUES) {
                let guarded = slot.value_active && slot.value_expiry_ms > now_ms && !has_ttl;
                if !guarded {
                    changed |= !slot.value_active || self.snap.value[i] != value;
                    self.snap.value[i] = value;
                    slot.value_active = true;
                    slot.value_expiry_ms = expiry;
                }
            }
        }
        if changed {
            self.snap.last_update_ms = now_ms;
        }
        changed
    }
}

/// Keep at most `TEXT_LEN - 1` bytes without splitting a character
fn truncate(text: &str) -> String {
    let mut end = text.len().min(TEXT_LEN - 1);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

/// Listener thread publishing [`FeedSnapshot`]s
#[derive(Debug)]
pub struct ExternalFeed {
    snapshot: Arc<ArcSwap<FeedSnapshot>>,
    stop: Arc<AtomicBool>,
    local_addr: SocketAddr,
    thread: Option<JoinHandle<()>>,
}

impl ExternalFeed {
    pub fn start(bind: &str) -> Result<Self> {
        let socket = UdpSocket::bind(bind)?;
        socket.set_read_timeout(Some(READ_TIMEOUT))?;
        let local_addr = socket.local_addr()?;

        let snapshot = Arc::new(ArcSwap::from_pointee(FeedSnapshot::default()));
        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let snapshot = Arc::clone(&snapshot);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("osd-feed".into())
                .spawn(move || feed_loop(socket, snapshot, stop))?
        };
        info!("External OSD feed listening on {}", local_addr);

        Ok(Self {
            snapshot,
            stop,
            local_addr,
            thread: Some(thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn snapshot(&self) -> Arc<FeedSnapshot> {
        self.snapshot.load_full()
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("External feed thread panicked");
            }
            debug!("External OSD feed stopped");
        }
    }
}

impl Drop for ExternalFeed {
    fn drop(&mut self) {
        self.stop();
    }
}

fn feed_loop(socket: UdpSocket, snapshot: Arc<ArcSwap<FeedSnapshot>>, stop: Arc<AtomicBool>) {
    let mut state = FeedState::default();
    let mut buf = [0u8; 2048];
    while !stop.load(Ordering::Acquire) {
        let changed = match socket.recv_from(&mut buf) {
            Ok((len, from)) => match FeedMessage::parse(&buf[..len]) {
                Ok(msg) => state.apply(&msg, monotonic_ms()),
                Err(e) => {
                    warn!("External feed: bad message from {}: {}", from, e);
                    state.expire(monotonic_ms())
                }
            },
            Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {
                state.expire(monotonic_ms())
            }
            Err(e) => {
                error!("External feed: recv failed: {}", e);
                thread::sleep(READ_TIMEOUT);
                false
            }
        };
        if changed {
            snapshot.store(Arc::new(state.snapshot().clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(json: &str) -> FeedMessage {
        FeedMessage::parse(json.as_bytes()).unwrap()
    }

    #[test]
    fn test_text_and_values_fill_slots() {
        let mut s = FeedState::default();
        assert!(s.apply(&msg(r#"{"text":["A","","C"],"value":[1.5,2.0]}"#), 10));
        assert_eq!(s.snapshot().lines(), vec!["A", "C"]);
        assert_eq!(s.snapshot().value[..3], [1.5, 2.0, 0.0]);
        // same content again is not a change
        assert!(!s.apply(&msg(r#"{"text":["A"]}"#), 20));
    }

    #[test]
    fn test_empty_array_clears() {
        let mut s = FeedState::default();
        s.apply(&msg(r#"{"text":["A","B"],"value":[3.0]}"#), 0);
        assert!(s.apply(&msg(r#"{"text":[]}"#), 5));
        assert!(s.snapshot().lines().is_empty());
        assert_eq!(s.snapshot().value[0], 3.0);
        s.apply(&msg(r#"{"value":[]}"#), 6);
        assert_eq!(s.snapshot().value[0], 0.0);
    }

    #[test]
    fn test_ttl_expires_and_guards() {
        let mut s = FeedState::default();
        s.apply(&msg(r#"{"text":["TEMP"],"ttl_ms":100}"#), 1000);
        // no ttl: cannot overwrite a live ttl slot
        s.apply(&msg(r#"{"text":["OTHER"]}"#), 1050);
        assert_eq!(s.snapshot().text[0], "TEMP");
        assert!(!s.expire(1099));
        assert!(s.expire(1100));
        assert_eq!(s.snapshot().text[0], "");
        s.apply(&msg(r#"{"text":["OTHER"]}"#), 1200);
        assert_eq!(s.snapshot().text[0], "OTHER");
    }

    #[test]
    fn test_limits() {
        let mut s = FeedState::default();
        let long = "X".repeat(200);
        let texts: Vec<String> = (0..12).map(|i| format!("\"{}{}\"", long, i)).collect();
        s.apply(&msg(&format!("{{\"text\":[{}]}}", texts.join(","))), 0);
        assert_eq!(s.snapshot().lines().len(), MAX_TEXT);
        assert_eq!(s.snapshot().text[0].len(), TEXT_LEN - 1);
        assert!(FeedMessage::parse(b"not json").is_err());
    }

    #[test]
    fn test_listener_publishes() {
        let mut feed = ExternalFeed::start("127.0.0.1:0").unwrap();
        let tx = UdpSocket::bind("127.0.0.1:0").unwrap();
        tx.send_to(br#"{"text":["HELLO"]}"#, feed.local_addr()).unwrap();
        let mut seen = Vec::new();
        for _ in 0..50 {
            seen = feed.snapshot().lines();
            if !seen.is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(seen, vec!["HELLO"]);
        feed.stop();
    }
}
