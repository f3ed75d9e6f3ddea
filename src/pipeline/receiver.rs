//! UDP RTP receiver feeding the decode pipeline
//!
//! A dedicated thread reads datagrams, routes them by payload type to a
//! [`PacketSink`] and, while enabled, keeps per-stream statistics that the
//! overlay samples once per refresh.

use std::net::{SocketAddr, UdpSocket};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use nix::sys::socket::{self, setsockopt, sockopt, AddressFamily, SockFlag, SockType, SockaddrIn};
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;
use tracing::{debug, error, info, trace, warn};

use crate::error::{Error, Result};
use crate::utils::monotonic_ns;

pub const HISTORY_LEN: usize = 512;

pub const SAMPLE_LOSS: u8 = 0x01;
pub const SAMPLE_REORDER: u8 = 0x02;
pub const SAMPLE_DUPLICATE: u8 = 0x04;
pub const SAMPLE_FRAME_END: u8 = 0x08;

const RTP_MIN_HEADER: usize = 12;
const MAX_PACKET: usize = 4096;
const RECV_BUFFER_BYTES: usize = 4 * 1024 * 1024;
const RECV_TIMEOUT: Duration = Duration::from_millis(500);
const BITRATE_WINDOW_NS: u64 = 100_000_000;
const EWMA_ALPHA: f64 = 0.1;
const RTP_CLOCK_HZ: f64 = 90_000.0;

/// Fixed RTP header fields plus where the payload sits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub sequence: u16,
    pub timestamp: u32,
    pub payload_type: u8,
    pub marker: bool,
    pub padding: bool,
    pub extension: bool,
    pub csrc_count: u8,
    pub payload_offset: usize,
    pub payload_size: usize,
}

/// Parse an RTP v2 header; `None` for anything truncated or not version 2
pub fn parse_rtp(data: &[u8]) -> Option<RtpHeader> {
    if data.len() < RTP_MIN_HEADER || data[0] >> 6 != 2 {
        return None;
    }
    let csrc_count = data[0] & 0x0F;
    let padding = data[0] & 0x20 != 0;
    let extension = data[0] & 0x10 != 0;

    let mut offset = RTP_MIN_HEADER + csrc_count as usize * 4;
    if data.len() < offset {
        return None;
    }
    if extension {
        let ext = data.get(offset..offset + 4)?;
        let words = u16::from_be_bytes([ext[2], ext[3]]) as usize;
        offset += 4 + words * 4;
        if data.len() < offset {
            return None;
        }
    }

    let mut payload_size = data.len() - offset;
    if padding {
        let pad = data[data.len() - 1] as usize;
        payload_size = payload_size.saturating_sub(pad);
    }

    Some(RtpHeader {
        sequence: u16::from_be_bytes([data[2], data[3]]),
        timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        payload_type: data[1] & 0x7F,
        marker: data[1] & 0x80 != 0,
        padding,
        extension,
        csrc_count,
        payload_offset: offset,
        payload_size,
    })
}

/// One received packet as kept in the history ring
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketSample {
    pub sequence: u16,
    pub timestamp: u32,
    pub payload_type: u8,
    pub marker: bool,
    pub flags: u8,
    pub size: u32,
    pub arrival_ns: u64,
}

/// Snapshot of the receiver counters
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ReceiverStats {
    pub total_packets: u64,
    pub total_bytes: u64,
    pub video_packets: u64,
    pub video_bytes: u64,
    pub audio_packets: u64,
    pub audio_bytes: u64,
    pub ignored_packets: u64,
    pub lost: u64,
    pub reordered: u64,
    pub duplicate: u64,
    /// Interarrival jitter in 90 kHz units
    pub jitter: f64,
    pub jitter_avg: f64,
    pub bitrate_mbps: f64,
    pub bitrate_avg_mbps: f64,
    pub frame_count: u64,
    pub incomplete_frames: u64,
    pub last_frame_bytes: u64,
    pub frame_size_avg: f64,
    pub expected_sequence: u16,
    pub last_video_timestamp: u32,
    pub last_packet_ns: u64,
}

impl ReceiverStats {
    pub fn jitter_ms(&self) -> f64 {
        self.jitter / RTP_CLOCK_HZ * 1000.0
    }
}

fn ewma(avg: &mut f64, sample: f64) {
    if *avg == 0.0 {
        *avg = sample;
    } else {
        *avg += (sample - *avg) * EWMA_ALPHA;
    }
}

/// Statistics state machine, independent of any socket
pub struct RtpStats {
    video_pt: u8,
    audio_pt: u8,
    stats: ReceiverStats,
    expected_seq: Option<u16>,
    last_seq: Option<u16>,
    /// Timestamp and byte count of the frame being assembled
    frame: Option<(u32, u64)>,
    frame_missing: bool,
    last_transit: Option<f64>,
    bitrate_window: Option<(u64, u64)>,
    history: HeapRb<PacketSample>,
}

impl std::fmt::Debug for RtpStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtpStats")
            .field("video_pt", &self.video_pt)
            .field("audio_pt", &self.audio_pt)
            .field("stats", &self.stats)
            .field("history", &self.history.occupied_len())
            .finish()
    }
}

impl RtpStats {
    pub fn new(video_pt: u8, audio_pt: u8) -> Self {
        Self {
            video_pt,
            audio_pt,
            stats: ReceiverStats::default(),
            expected_seq: None,
            last_seq: None,
            frame: None,
            frame_missing: false,
            last_transit: None,
            bitrate_window: None,
            history: HeapRb::new(HISTORY_LEN),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.video_pt, self.audio_pt);
    }

    pub fn stats(&self) -> ReceiverStats {
        self.stats
    }

    /// History oldest first
    pub fn history(&self) -> Vec<PacketSample> {
        self.history.iter().copied().collect()
    }

    fn finalize_frame(&mut self) {
        let Some((_, bytes)) = self.frame.take() else {
            return;
        };
        self.stats.frame_count += 1;
        self.stats.last_frame_bytes = bytes;
        ewma(&mut self.stats.frame_size_avg, bytes as f64);
        if std::mem::take(&mut self.frame_missing) {
            self.stats.incomplete_frames += 1;
        }
    }

    fn update_bitrate(&mut self, arrival_ns: u64, len: u64) {
        let (start, bytes) = self.bitrate_window.get_or_insert((arrival_ns, 0));
        *bytes += len;
        let elapsed = arrival_ns.saturating_sub(*start);
        if elapsed >= BITRATE_WINDOW_NS {
            let mbps = (*bytes as f64 * 8.0) / (elapsed as f64 / 1e9) / 1e6;
            self.stats.bitrate_mbps = mbps;
            ewma(&mut self.stats.bitrate_avg_mbps, mbps);
            self.bitrate_window = Some((arrival_ns, 0));
        }
    }

    fn track_video(&mut self, rtp: &RtpHeader, len: u64, arrival_ns: u64, sample: &mut PacketSample) {
        self.stats.video_packets += 1;
        self.stats.video_bytes += len;
        self.stats.last_video_timestamp = rtp.timestamp;

        match self.frame.as_mut() {
            Some((ts, bytes)) if *ts == rtp.timestamp => *bytes += len,
            _ => {
                self.finalize_frame();
                self.frame = Some((rtp.timestamp, len));
                self.frame_missing = false;
            }
        }

        let next = rtp.sequence.wrapping_add(1);
        match self.expected_seq {
            None => self.expected_seq = Some(next),
            Some(expected) => {
                let delta = rtp.sequence.wrapping_sub(expected) as i16;
                if delta == 0 {
                    self.expected_seq = Some(next);
                } else if delta > 0 {
                    self.stats.lost += delta as u64;
                    self.expected_seq = Some(next);
                    self.frame_missing = true;
                    sample.flags |= SAMPLE_LOSS;
                } else {
                    self.stats.reordered += 1;
                    sample.flags |= SAMPLE_REORDER;
                }
            }
        }
        self.stats.expected_sequence = self.expected_seq.unwrap_or_default();

        if self.last_seq == Some(rtp.sequence) {
            self.stats.duplicate += 1;
            sample.flags |= SAMPLE_DUPLICATE;
        }
        self.last_seq = Some(rtp.sequence);

        // RFC 3550 interarrival jitter
        let transit = arrival_ns as f64 / 1e9 * RTP_CLOCK_HZ - rtp.timestamp as f64;
        match self.last_transit.replace(transit) {
            None => {
                self.stats.jitter = 0.0;
                self.stats.jitter_avg = 0.0;
            }
            Some(last) => {
                let d = (transit - last).abs();
                self.stats.jitter += (d - self.stats.jitter) / 16.0;
                let jitter = self.stats.jitter;
                ewma(&mut self.stats.jitter_avg, jitter);
            }
        }
    }

    pub fn record(&mut self, rtp: &RtpHeader, len: usize, arrival_ns: u64) {
        let len64 = len as u64;
        let mut sample = PacketSample {
            sequence: rtp.sequence,
            timestamp: rtp.timestamp,
            payload_type: rtp.payload_type,
            marker: rtp.marker,
            flags: 0,
            size: len as u32,
            arrival_ns,
        };

        self.stats.total_packets += 1;
        self.stats.total_bytes += len64;
        self.stats.last_packet_ns = arrival_ns;

        let is_video = rtp.payload_type == self.video_pt;
        if is_video {
            self.track_video(rtp, len64, arrival_ns, &mut sample);
        } else if rtp.payload_type == self.audio_pt {
            self.stats.audio_packets += 1;
            self.stats.audio_bytes += len64;
        } else {
            self.stats.ignored_packets += 1;
        }

        if is_video && rtp.marker {
            sample.flags |= SAMPLE_FRAME_END;
            self.finalize_frame();
        }

        self.update_bitrate(arrival_ns, len64);
        self.history.push_overwrite(sample);
    }
}

/// Which pipeline input a packet belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Video,
    Audio,
}

/// Destination of received packets, usually a pair of GStreamer appsrc elements
pub trait PacketSink: Send + 'static {
    fn push(&self, stream: Stream, packet: Bytes);

    /// Called once when the receiver thread exits
    fn finish(&self);
}

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub port: u16,
    pub video_pt: u8,
    pub audio_pt: u8,
    /// Forward audio packets to the sink
    pub audio: bool,
    /// Pin the receiver thread to this core
    pub cpu: Option<usize>,
}

#[derive(Debug)]
struct Shared {
    stop: AtomicBool,
    stats_enabled: AtomicBool,
    stats: Mutex<RtpStats>,
    source: Mutex<Option<SocketAddr>>,
}

/// Running receiver thread; stopped on drop
#[derive(Debug)]
pub struct UdpReceiver {
    shared: Arc<Shared>,
    socket: UdpSocket,
    local_addr: SocketAddr,
    thread: Option<JoinHandle<()>>,
}

fn bind_socket(port: u16) -> Result<UdpSocket> {
    let fd = socket::socket(
        AddressFamily::Inet,
        SockType::Datagram,
        SockFlag::SOCK_CLOEXEC,
        None,
    )?;
    if let Err(e) = setsockopt(&fd, sockopt::ReuseAddr, &true) {
        warn!("UDP receiver: SO_REUSEADDR failed: {}", e);
    }
    socket::bind(fd.as_raw_fd(), &SockaddrIn::new(0, 0, 0, 0, port))?;
    if let Err(e) = setsockopt(&fd, sockopt::RcvBuf, &RECV_BUFFER_BYTES) {
        warn!("UDP receiver: SO_RCVBUF failed: {}", e);
    }
    let socket = UdpSocket::from(fd);
    socket.set_read_timeout(Some(RECV_TIMEOUT))?;
    Ok(socket)
}

impl UdpReceiver {
    pub fn start(cfg: ReceiverConfig, sink: impl PacketSink) -> Result<Self> {
        let socket = bind_socket(cfg.port)?;
        let local_addr = socket.local_addr()?;
        let shared = Arc::new(Shared {
            stop: AtomicBool::new(false),
            stats_enabled: AtomicBool::new(false),
            stats: Mutex::new(RtpStats::new(cfg.video_pt, cfg.audio_pt)),
            source: Mutex::new(None),
        });

        let thread_socket = socket.try_clone()?;
        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("udp-receiver".into())
            .spawn(move || receive_loop(thread_socket, thread_shared, cfg, sink))
            .map_err(|e| Error::PipelineStartFailed(format!("receiver thread: {}", e)))?;

        info!("UDP receiver listening on {}", local_addr);
        Ok(Self {
            shared,
            socket,
            local_addr,
            thread: Some(thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Sender of the first packet seen
    pub fn source(&self) -> Option<SocketAddr> {
        *self.shared.source.lock()
    }

    pub fn stats(&self) -> ReceiverStats {
        self.shared.stats.lock().stats()
    }

    pub fn history(&self) -> Vec<PacketSample> {
        self.shared.stats.lock().history()
    }

    /// Switch statistics on or off; switching on starts from zero
    pub fn set_stats_enabled(&self, enabled: bool) {
        if self.shared.stats_enabled.load(Ordering::Acquire) == enabled {
            return;
        }
        if enabled {
            self.shared.stats.lock().reset();
        }
        self.shared.stats_enabled.store(enabled, Ordering::Release);
        debug!("UDP receiver stats {}", if enabled { "on" } else { "off" });
    }

    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.shared.stop.store(true, Ordering::Release);
        // wakes a blocked recv even on an unconnected socket
        let _ = socket::shutdown(self.socket.as_raw_fd(), socket::Shutdown::Both);
        if thread.join().is_err() {
            error!("UDP receiver thread panicked");
        }
        debug!("UDP receiver on {} stopped", self.local_addr);
    }
}

impl Drop for UdpReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn receive_loop(socket: UdpSocket, shared: Arc<Shared>, cfg: ReceiverConfig, sink: impl PacketSink) {
    if let Some(id) = cfg.cpu {
        crate::utils::pin_current_thread(id);
    }

    let mut buf = [0u8; MAX_PACKET];
    while !shared.stop.load(Ordering::Acquire) {
        let (len, from) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::Interrupted
                ) =>
            {
                continue
            }
            Err(e) => {
                if !shared.stop.load(Ordering::Acquire) {
                    error!("UDP receiver: recv failed: {}", e);
                }
                break;
            }
        };
        if len == 0 {
            continue;
        }
        let arrival_ns = monotonic_ns();
        let data = &buf[..len];

        {
            let mut source = shared.source.lock();
            if source.is_none() {
                info!("UDP receiver: first packet from {}", from);
                *source = Some(from);
            }
        }

        let Some(rtp) = parse_rtp(data) else {
            trace!("UDP receiver: dropping non-RTP datagram of {} bytes", len);
            continue;
        };
        if shared.stats_enabled.load(Ordering::Acquire) {
            shared.stats.lock().record(&rtp, len, arrival_ns);
        }

        let stream = if rtp.payload_type == cfg.video_pt {
            Stream::Video
        } else if cfg.audio && rtp.payload_type == cfg.audio_pt {
            Stream::Audio
        } else {
            continue;
        };
        sink.push(stream, Bytes::copy_from_slice(data));
    }
    sink.finish();
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: u64 = 1_000_000;

    fn packet(pt: u8, seq: u16, ts: u32, marker: bool, payload: usize) -> Vec<u8> {
        let mut p = vec![0x80, pt | if marker { 0x80 } else { 0 }];
        p.extend_from_slice(&seq.to_be_bytes());
        p.extend_from_slice(&ts.to_be_bytes());
        p.extend_from_slice(&0x1234_5678u32.to_be_bytes());
        p.resize(RTP_MIN_HEADER + payload, 0xAB);
        p
    }

    fn feed(stats: &mut RtpStats, data: &[u8], arrival_ns: u64) {
        let rtp = parse_rtp(data).unwrap();
        stats.record(&rtp, data.len(), arrival_ns);
    }

    #[test]
    fn test_parse_basic_header() {
        let p = packet(97, 513, 90_000, true, 100);
        let rtp = parse_rtp(&p).unwrap();
        assert_eq!(rtp.sequence, 513);
        assert_eq!(rtp.timestamp, 90_000);
        assert_eq!(rtp.payload_type, 97);
        assert!(rtp.marker);
        assert_eq!(rtp.payload_offset, 12);
        assert_eq!(rtp.payload_size, 100);
    }

    #[test]
    fn test_parse_csrc_extension_padding() {
        let mut p = vec![0x80 | 0x20 | 0x10 | 0x02, 97, 0, 1, 0, 0, 0, 1, 0, 0, 0, 1];
        p.extend_from_slice(&[0; 8]); // two CSRCs
        p.extend_from_slice(&[0xBE, 0xDE, 0x00, 0x01, 1, 2, 3, 4]); // one-word extension
        p.extend_from_slice(&[9; 10]);
        p.extend_from_slice(&[0, 0, 3]); // 3 bytes of padding
        let rtp = parse_rtp(&p).unwrap();
        assert_eq!(rtp.csrc_count, 2);
        assert_eq!(rtp.payload_offset, 12 + 8 + 8);
        assert_eq!(rtp.payload_size, 10);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(parse_rtp(&[0x80; 11]).is_none());
        let mut p = packet(97, 1, 1, false, 4);
        p[0] = 0x40;
        assert!(parse_rtp(&p).is_none());
        // extension header claims more than is there
        let p = [0x90, 97, 0, 1, 0, 0, 0, 1, 0, 0, 0, 1, 0, 0, 0, 9];
        assert!(parse_rtp(&p).is_none());
    }

    #[test]
    fn test_loss_reorder_duplicate() {
        let mut s = RtpStats::new(97, 98);
        for (i, seq) in [10u16, 11, 14, 12, 12].into_iter().enumerate() {
            feed(&mut s, &packet(97, seq, 1000, false, 50), i as u64 * MS);
        }
        let st = s.stats();
        assert_eq!(st.video_packets, 5);
        assert_eq!(st.lost, 2);
        assert_eq!(st.reordered, 2);
        assert_eq!(st.duplicate, 1);
        assert_eq!(st.expected_sequence, 15);

        let flags: Vec<u8> = s.history().iter().map(|h| h.flags).collect();
        assert_eq!(
            flags,
            vec![0, 0, SAMPLE_LOSS, SAMPLE_REORDER, SAMPLE_REORDER | SAMPLE_DUPLICATE]
        );
    }

    #[test]
    fn test_sequence_wraparound_is_not_loss() {
        let mut s = RtpStats::new(97, 98);
        for (i, seq) in [65534u16, 65535, 0, 1].into_iter().enumerate() {
            feed(&mut s, &packet(97, seq, 1, false, 10), i as u64 * MS);
        }
        assert_eq!(s.stats().lost, 0);
        assert_eq!(s.stats().reordered, 0);
        assert_eq!(s.stats().expected_sequence, 2);
    }

    #[test]
    fn test_frames_closed_by_marker() {
        let mut s = RtpStats::new(97, 98);
        feed(&mut s, &packet(97, 1, 3000, false, 88), 0);
        feed(&mut s, &packet(97, 2, 3000, true, 88), MS);
        // sequence gap inside the second frame
        feed(&mut s, &packet(97, 4, 6000, false, 38), 2 * MS);
        feed(&mut s, &packet(97, 5, 6000, true, 38), 3 * MS);
        let st = s.stats();
        assert_eq!(st.frame_count, 2);
        assert_eq!(st.last_frame_bytes, 100);
        assert_eq!(st.incomplete_frames, 1);
        // first frame seeds the average, second moves it by 10%
        assert!((st.frame_size_avg - (200.0 + (100.0 - 200.0) * 0.1)).abs() < 1e-9);
        assert_eq!(s.history()[1].flags, SAMPLE_FRAME_END);
    }

    #[test]
    fn test_audio_and_ignored_counters() {
        let mut s = RtpStats::new(97, 98);
        feed(&mut s, &packet(98, 1, 1, false, 20), 0);
        feed(&mut s, &packet(33, 1, 1, false, 20), 0);
        let st = s.stats();
        assert_eq!(st.audio_packets, 1);
        assert_eq!(st.audio_bytes, 32);
        assert_eq!(st.ignored_packets, 1);
        assert_eq!(st.total_packets, 2);
        assert_eq!(st.video_packets, 0);
    }

    #[test]
    fn test_bitrate_window() {
        let mut s = RtpStats::new(97, 98);
        // 1250 bytes every 10 ms is 1 Mbit/s
        for i in 0..=10u16 {
            feed(&mut s, &packet(97, i, 0, false, 1238), i as u64 * 10 * MS);
        }
        let st = s.stats();
        assert!((st.bitrate_mbps - 1.1).abs() < 1e-9, "{}", st.bitrate_mbps);
        assert_eq!(st.bitrate_avg_mbps, st.bitrate_mbps);
    }

    #[test]
    fn test_jitter_tracks_arrival_variation() {
        let mut s = RtpStats::new(97, 98);
        // timestamps advance 3000 ticks (33.3 ms) but arrivals alternate 23 ms / 43 ms
        let mut arrival = 0;
        for i in 0..20u32 {
            feed(&mut s, &packet(97, i as u16, i * 3000, true, 10), arrival);
            arrival += if i % 2 == 0 { 23 * MS } else { 43 * MS };
        }
        let st = s.stats();
        assert!(st.jitter > 0.0);
        assert!(st.jitter_avg > 0.0);
        assert!(st.jitter_ms() < 20.0);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut s = RtpStats::new(97, 98);
        for i in 0..(HISTORY_LEN as u16 + 10) {
            feed(&mut s, &packet(97, i, 0, false, 1), i as u64);
        }
        let history = s.history();
        assert_eq!(history.len(), HISTORY_LEN);
        assert_eq!(history[0].sequence, 10);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut s = RtpStats::new(97, 98);
        feed(&mut s, &packet(97, 1, 0, true, 1), 0);
        s.reset();
        assert_eq!(s.stats(), ReceiverStats::default());
        assert!(s.history().is_empty());
    }
}
