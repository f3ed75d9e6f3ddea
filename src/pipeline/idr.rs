//! Keyframe requests to the RTP source over HTTP
//!
//! Decoder warnings usually mean the stream lost its reference frames. Each
//! warning may trigger `GET <path>` on the source host, with growing spacing
//! between attempts; a long unbroken run of attempts escalates to a pipeline
//! reinit instead.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use tracing::{debug, error, info, warn};

use crate::utils::monotonic_ms;

const BURST_INTERVAL_MS: u64 = 50;
const MAX_INTERVAL_MS: u64 = 500;
const QUIET_RESET_MS: u64 = 750;
pub const REINIT_THRESHOLD: u32 = 64;
const USER_AGENT: &str = "pixelpilot-idr/1.0";

/// Decision taken for one decoder warning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdrAction {
    Idle,
    /// Send request number `attempt` of the current run
    Request { attempt: u32 },
    /// Too many attempts; ask for a pipeline reinit
    Reinit,
}

/// Attempt spacing and escalation, driven by warning timestamps
#[derive(Debug, Clone, Default)]
pub struct IdrState {
    active: bool,
    attempts: u32,
    next_interval_ms: u64,
    last_request_ms: Option<u64>,
    last_warning_ms: Option<u64>,
    in_flight: bool,
    reinit_pending: bool,
}

impl IdrState {
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn next_interval_ms(&self) -> u64 {
        self.next_interval_ms
    }

    fn restart_run(&mut self) {
        self.attempts = 0;
        self.next_interval_ms = 0;
        self.last_request_ms = None;
    }

    pub fn on_warning(&mut self, now_ms: u64) -> IdrAction {
        if self.reinit_pending {
            self.last_warning_ms = Some(now_ms);
            return IdrAction::Idle;
        }
        if self.active {
            if let Some(last) = self.last_warning_ms {
                if now_ms.saturating_sub(last) > QUIET_RESET_MS {
                    self.active = false;
                }
            }
        }
        if !self.active {
            self.active = true;
            self.restart_run();
        }
        self.last_warning_ms = Some(now_ms);

        let ready = match self.last_request_ms {
            None => true,
            Some(last) => self.attempts == 0 || now_ms >= last + self.next_interval_ms,
        };
        if !ready || self.in_flight {
            return IdrAction::Idle;
        }

        self.attempts += 1;
        if self.attempts >= REINIT_THRESHOLD {
            self.reinit_pending = true;
            self.active = false;
            self.restart_run();
            return IdrAction::Reinit;
        }
        self.in_flight = true;
        self.last_request_ms = Some(now_ms);
        self.next_interval_ms = (BURST_INTERVAL_MS << self.attempts.min(16)).min(MAX_INTERVAL_MS);
        IdrAction::Request {
            attempt: self.attempts,
        }
    }

    /// The HTTP worker finished; a request that never went out does not count
    pub fn request_done(&mut self, sent: bool) {
        self.in_flight = false;
        if !sent && self.attempts > 0 {
            self.attempts -= 1;
            self.last_request_ms = None;
        }
    }

    /// Forget everything, for a freshly started pipeline
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Clone)]
pub struct IdrConfig {
    pub enabled: bool,
    pub http_port: u16,
    pub path: String,
    pub timeout: Duration,
}

/// Shared between the pipeline bus thread and the reactor
#[derive(Debug)]
pub struct IdrRequester {
    cfg: IdrConfig,
    /// `None` when the HTTP client could not be built; requests are then skipped
    client: Option<Client>,
    state: Mutex<IdrState>,
    source: Mutex<Option<IpAddr>>,
    reinit_requested: AtomicBool,
    total_requests: AtomicU64,
}

impl IdrRequester {
    pub fn new(mut cfg: IdrConfig) -> Arc<Self> {
        if !cfg.path.starts_with('/') {
            cfg.path.insert(0, '/');
        }
        let client = Client::builder()
            .timeout(cfg.timeout)
            .user_agent(USER_AGENT)
            .build()
            .inspect_err(|e| error!("IDR requester: HTTP client unavailable: {}", e))
            .ok();
        Arc::new(Self {
            cfg,
            client,
            state: Mutex::new(IdrState::default()),
            source: Mutex::new(None),
            reinit_requested: AtomicBool::new(false),
            total_requests: AtomicU64::new(0),
        })
    }

    pub fn set_source(&self, ip: IpAddr) {
        let mut source = self.source.lock();
        if *source != Some(ip) {
            info!("IDR requester: tracking source {}", ip);
            *source = Some(ip);
        }
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    /// Returns true once after a reinit was requested
    pub fn take_reinit(&self) -> bool {
        self.reinit_requested.swap(false, Ordering::AcqRel)
    }

    pub fn reset(&self) {
        self.state.lock().reset();
        self.reinit_requested.store(false, Ordering::Release);
    }

    /// Called for every decoder/pipeline warning
    pub fn notify_warning(self: &Arc<Self>) {
        if !self.cfg.enabled {
            return;
        }
        let Some(client) = &self.client else {
            return;
        };
        let Some(ip) = *self.source.lock() else {
            debug!("IDR requester: no source yet");
            return;
        };
        let action = self.state.lock().on_warning(monotonic_ms());
        match action {
            IdrAction::Idle => {}
            IdrAction::Reinit => {
                warn!(
                    "IDR requester: {}:{}{} exceeded {} attempts; requesting pipeline reinitialization",
                    ip, self.cfg.http_port, self.cfg.path, REINIT_THRESHOLD
                );
                self.reinit_requested.store(true, Ordering::Release);
            }
            IdrAction::Request { attempt } => {
                let total = self.total_requests.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    "IDR requester: triggering IDR via http://{}:{}{} (attempt {}, total {})",
                    ip, self.cfg.http_port, self.cfg.path, attempt, total
                );
                counter!("idr_requests").increment(1);
                let this = Arc::clone(self);
                let client = client.clone();
                let url = request_url(ip, self.cfg.http_port, &self.cfg.path);
                let spawned = thread::Builder::new()
                    .name("idr-http".into())
                    .spawn(move || {
                        let sent = match send_request(&client, &url) {
                            Ok(status) if status.is_success() => true,
                            Ok(status) => {
                                warn!("IDR requester: {} answered {}", url, status);
                                false
                            }
                            Err(e) => {
                                warn!("IDR requester: request to {} did not succeed: {}", url, e);
                                false
                            }
                        };
                        this.state.lock().request_done(sent);
                    });
                if let Err(e) = spawned {
                    error!("IDR requester: failed to spawn worker: {}", e);
                    self.state.lock().request_done(false);
                }
            }
        }
    }
}

/// `http://host:port/path`, with IPv6 hosts bracketed
pub fn request_url(ip: IpAddr, port: u16, path: &str) -> String {
    match ip {
        IpAddr::V4(v4) => format!("http://{}:{}{}", v4, port, path),
        IpAddr::V6(v6) => format!("http://[{}]:{}{}", v6, port, path),
    }
}

fn send_request(client: &Client, url: &str) -> reqwest::Result<StatusCode> {
    client.get(url).send().map(|resp| resp.status())
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::{SocketAddr, TcpListener};

    use super::*;

    #[test]
    fn test_first_warning_requests_immediately() {
        let mut s = IdrState::default();
        assert_eq!(s.on_warning(1000), IdrAction::Request { attempt: 1 });
        assert_eq!(s.next_interval_ms(), 100);
        // still in flight
        assert_eq!(s.on_warning(1200), IdrAction::Idle);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut s = IdrState::default();
        let mut now = 0;
        let mut intervals = Vec::new();
        for _ in 0..6 {
            assert!(matches!(s.on_warning(now), IdrAction::Request { .. }));
            s.request_done(true);
            intervals.push(s.next_interval_ms());
            // warnings keep coming every 50 ms so the run never goes quiet
            let target = now + s.next_interval_ms();
            while now < target {
                now += 50;
                if now < target {
                    assert_eq!(s.on_warning(now), IdrAction::Idle);
                }
            }
        }
        assert_eq!(intervals, vec![100, 200, 400, 500, 500, 500]);
    }

    #[test]
    fn test_quiet_period_resets_run() {
        let mut s = IdrState::default();
        s.on_warning(0);
        s.request_done(true);
        s.on_warning(100);
        s.request_done(true);
        assert_eq!(s.attempts(), 2);
        assert_eq!(s.on_warning(1000), IdrAction::Request { attempt: 1 });
    }

    #[test]
    fn test_failed_request_does_not_count() {
        let mut s = IdrState::default();
        s.on_warning(0);
        s.request_done(false);
        assert_eq!(s.attempts(), 0);
        assert_eq!(s.on_warning(10), IdrAction::Request { attempt: 1 });
    }

    #[test]
    fn test_escalates_to_reinit() {
        let mut s = IdrState::default();
        let mut now = 0;
        let mut reinit_at = None;
        for _ in 0..2000 {
            match s.on_warning(now) {
                IdrAction::Request { .. } => s.request_done(true),
                IdrAction::Reinit => {
                    reinit_at = Some(now);
                    break;
                }
                IdrAction::Idle => {}
            }
            now += 100;
        }
        assert!(reinit_at.is_some());
        // nothing more until the pipeline is rebuilt
        assert_eq!(s.on_warning(now + 100), IdrAction::Idle);
        s.reset();
        assert_eq!(s.on_warning(now + 200), IdrAction::Request { attempt: 1 });
    }

    #[test]
    fn test_request_url() {
        let v4: IpAddr = "192.168.1.10".parse().unwrap();
        assert_eq!(request_url(v4, 80, "/request/idr"), "http://192.168.1.10:80/request/idr");
        let v6: IpAddr = "fe80::1".parse().unwrap();
        assert_eq!(request_url(v6, 8080, "/idr"), "http://[fe80::1]:8080/idr");
    }

    /// One-shot HTTP server answering with `status_line`; returns the request head it saw
    fn serve_once(status_line: &'static str) -> (SocketAddr, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            let n = conn.read(&mut buf).unwrap();
            let reply = format!("{}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n", status_line);
            conn.write_all(reply.as_bytes()).unwrap();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });
        (addr, server)
    }

    fn client() -> Client {
        Client::builder()
            .timeout(Duration::from_secs(2))
            .user_agent(USER_AGENT)
            .build()
            .unwrap()
    }

    #[test]
    fn test_send_request_against_local_server() {
        let (addr, server) = serve_once("HTTP/1.1 200 OK");
        let url = request_url(addr.ip(), addr.port(), "/request/idr");
        let status = send_request(&client(), &url).unwrap();
        assert!(status.is_success());
        let seen = server.join().unwrap();
        assert!(seen.starts_with("GET /request/idr HTTP/1.1"));
        assert!(seen.to_ascii_lowercase().contains("user-agent: pixelpilot-idr/1.0"));
    }

    #[test]
    fn test_error_status_is_not_success() {
        let (addr, server) = serve_once("HTTP/1.1 404 Not Found");
        let url = request_url(addr.ip(), addr.port(), "/request/idr");
        let status = send_request(&client(), &url).unwrap();
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(!status.is_success());
        server.join().unwrap();
    }
}
