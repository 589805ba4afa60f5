use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tracing::{debug, info, trace};
use webrtc::rtp::codecs::h264::H264Packet;
use webrtc::rtp::codecs::vp8::Vp8Packet;
use webrtc::rtp::packet::Packet;
use webrtc::rtp::packetizer::Depacketizer;
use webrtc::track::track_remote::TrackRemote;

use crate::events::{EventSender, SessionEvent};
use crate::h264;
use crate::health::FrameClock;

/// One depacketised access unit, handed to the renderer.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Annex B for H.264, raw frame for VP8, concatenated payloads otherwise
    pub data: Bytes,
    pub rtp_timestamp: u32,
    pub keyframe: bool,
    pub mime_type: Arc<str>,
    /// Arrival of the frame's first packet
    pub received_at: Instant,
}

impl VideoFrame {
    #[cfg(test)]
    pub(crate) fn for_test(data: &[u8]) -> Self {
        Self {
            data: Bytes::copy_from_slice(data),
            rtp_timestamp: 0,
            keyframe: false,
            mime_type: Arc::from("video/H264"),
            received_at: Instant::now(),
        }
    }
}

/// Sink for decoded-side consumers (UI surface, recorder, OCR).
///
/// Called on the video reader task; implementations must not block for long.
pub trait FrameRenderer: Send + Sync {
    fn render_frame(&self, frame: &VideoFrame);
}

enum Codec {
    H264(H264Packet),
    Vp8(Vp8Packet),
    Passthrough,
}

impl Codec {
    fn for_mime(mime_type: &str) -> Self {
        match mime_type.to_ascii_lowercase().as_str() {
            "video/h264" => Codec::H264(H264Packet::default()),
            "video/vp8" => Codec::Vp8(Vp8Packet::default()),
            _ => Codec::Passthrough,
        }
    }
}

/// Reassembles RTP packets into frames. The marker bit closes a frame; a
/// timestamp change without one means the closing packet was lost, and the
/// partial frame is discarded.
pub struct FrameAssembler {
    codec: Codec,
    mime_type: Arc<str>,
    buf: BytesMut,
    timestamp: Option<u32>,
    first_packet_at: Option<Instant>,
    corrupt: bool,
}

impl FrameAssembler {
    pub fn new(mime_type: &str) -> Self {
        Self {
            codec: Codec::for_mime(mime_type),
            mime_type: Arc::from(mime_type),
            buf: BytesMut::new(),
            timestamp: None,
            first_packet_at: None,
            corrupt: false,
        }
    }

    pub fn push(&mut self, packet: &Packet, now: Instant) -> Option<VideoFrame> {
        if self
            .timestamp
            .is_some_and(|ts| ts != packet.header.timestamp)
        {
            trace!(
                timestamp = ?self.timestamp,
                "Dropping incomplete frame (marker packet lost)"
            );
            self.clear();
        }

        let payload = match &mut self.codec {
            Codec::H264(d) => d.depacketize(&packet.payload),
            Codec::Vp8(d) => d.depacketize(&packet.payload),
            Codec::Passthrough => Ok(packet.payload.clone()),
        };
        match payload {
            Ok(bytes) => self.buf.extend_from_slice(&bytes),
            Err(e) => {
                trace!("Depacketize failed: {e}");
                self.corrupt = true;
            }
        }
        self.timestamp = Some(packet.header.timestamp);
        if self.first_packet_at.is_none() {
            self.first_packet_at = Some(now);
        }

        if !packet.header.marker {
            return None;
        }
        let frame = if self.corrupt || self.buf.is_empty() {
            None
        } else {
            let data = self.buf.split().freeze();
            let keyframe = match self.codec {
                Codec::H264(_) => h264::h264_contains_idr(&data),
                Codec::Vp8(_) => data.first().is_some_and(|b| b & 0x01 == 0),
                Codec::Passthrough => false,
            };
            Some(VideoFrame {
                data,
                rtp_timestamp: packet.header.timestamp,
                keyframe,
                mime_type: Arc::clone(&self.mime_type),
                received_at: self.first_packet_at.unwrap_or(now),
            })
        };
        self.clear();
        frame
    }

    fn clear(&mut self) {
        if self.corrupt || !self.buf.is_empty() {
            self.codec = Codec::for_mime(&self.mime_type);
        }
        self.buf.clear();
        self.timestamp = None;
        self.first_packet_at = None;
        self.corrupt = false;
    }
}

/// Width/height carried in a VP8 key frame header.
pub fn vp8_keyframe_dimensions(frame: &[u8]) -> Option<(u32, u32)> {
    if frame.len() < 10 || frame[0] & 0x01 != 0 || frame[3..6] != [0x9d, 0x01, 0x2a] {
        return None;
    }
    let width = u16::from_le_bytes([frame[6], frame[7]]) & 0x3fff;
    let height = u16::from_le_bytes([frame[8], frame[9]]) & 0x3fff;
    (width > 0 && height > 0).then_some((width as u32, height as u32))
}

pub fn frame_dimensions(frame: &VideoFrame) -> Option<(u32, u32)> {
    if frame.mime_type.eq_ignore_ascii_case("video/h264") {
        h264::access_unit_dimensions(&frame.data)
    } else if frame.mime_type.eq_ignore_ascii_case("video/vp8") && frame.keyframe {
        vp8_keyframe_dimensions(&frame.data)
    } else {
        None
    }
}

/// Frames per second over half-second windows.
#[derive(Default)]
pub struct FpsMeter {
    window_start: Option<Instant>,
    frames: u32,
}

impl FpsMeter {
    pub const WINDOW: Duration = Duration::from_millis(500);

    /// Count one frame; returns a rate each time a window closes.
    pub fn tick(&mut self, now: Instant) -> Option<f64> {
        let start = *self.window_start.get_or_insert(now);
        self.frames += 1;
        let elapsed = now.saturating_duration_since(start);
        if elapsed < Self::WINDOW {
            return None;
        }
        let fps = f64::from(self.frames) / elapsed.as_secs_f64();
        self.window_start = Some(now);
        self.frames = 0;
        Some(fps)
    }
}

/// Receiver-side counters for the inbound video stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReceptionStats {
    pub packets_received: u64,
    /// Cumulative, may go negative with duplicates (RFC 3550 §6.4.1)
    pub packets_lost: i64,
    /// Interarrival jitter in seconds
    pub jitter_secs: f64,
    /// Total time frames waited between first packet and hand-off
    pub jitter_buffer_delay_secs: f64,
    pub jitter_buffer_emitted_count: u64,
    /// Total time spent inside the renderer
    pub total_decode_secs: f64,
    pub frames_decoded: u64,
}

/// RFC 3550 sequence and jitter bookkeeping.
pub struct ReceptionTracker {
    clock_rate: f64,
    epoch: Instant,
    base_seq: Option<u32>,
    max_seq: u16,
    cycles: u64,
    prev_transit: Option<f64>,
    stats: ReceptionStats,
}

impl ReceptionTracker {
    pub fn new(clock_rate: u32, epoch: Instant) -> Self {
        Self {
            clock_rate: f64::from(clock_rate.max(1)),
            epoch,
            base_seq: None,
            max_seq: 0,
            cycles: 0,
            prev_transit: None,
            stats: ReceptionStats::default(),
        }
    }

    pub fn on_packet(&mut self, seq: u16, rtp_timestamp: u32, arrival: Instant) {
        self.stats.packets_received += 1;
        match self.base_seq {
            None => {
                self.base_seq = Some(u32::from(seq));
                self.max_seq = seq;
            }
            Some(_) => {
                let delta = seq.wrapping_sub(self.max_seq);
                if delta != 0 && delta < 0x8000 {
                    if seq < self.max_seq {
                        self.cycles += 1 << 16;
                    }
                    self.max_seq = seq;
                }
            }
        }
        if let Some(base) = self.base_seq {
            let extended = self.cycles + u64::from(self.max_seq);
            let expected = extended as i64 - i64::from(base) + 1;
            self.stats.packets_lost = expected - self.stats.packets_received as i64;
        }

        let arrival_units = arrival.saturating_duration_since(self.epoch).as_secs_f64() * self.clock_rate;
        let transit = arrival_units - f64::from(rtp_timestamp);
        if let Some(prev) = self.prev_transit {
            let mut d = (transit - prev).abs();
            // A 32-bit RTP timestamp wrap shows up as a huge jump.
            if d > f64::from(u32::MAX / 2) {
                d = 0.0;
            }
            let jitter_units = self.stats.jitter_secs * self.clock_rate;
            let jitter_units = jitter_units + (d - jitter_units) / 16.0;
            self.stats.jitter_secs = jitter_units / self.clock_rate;
        }
        self.prev_transit = Some(transit);
    }

    pub fn on_frame(&mut self, received_at: Instant, emitted_at: Instant, render_time: Duration) {
        self.stats.jitter_buffer_delay_secs +=
            emitted_at.saturating_duration_since(received_at).as_secs_f64();
        self.stats.jitter_buffer_emitted_count += 1;
        self.stats.total_decode_secs += render_time.as_secs_f64();
        self.stats.frames_decoded += 1;
    }

    pub fn snapshot(&self) -> ReceptionStats {
        self.stats.clone()
    }
}

const RECEPTION_REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Read loop for the inbound video track. Runs until the track ends.
pub async fn run_remote_video(
    track: Arc<TrackRemote>,
    renderer: Option<Arc<dyn FrameRenderer>>,
    clock: Arc<FrameClock>,
    events: EventSender,
) {
    let codec = track.codec();
    let mime_type = codec.capability.mime_type.clone();
    info!(mime_type, ssrc = track.ssrc(), "Inbound video track started");
    events.send(SessionEvent::VideoTrackStarted {
        mime_type: mime_type.clone(),
    });

    let mut assembler = FrameAssembler::new(&mime_type);
    let mut reception = ReceptionTracker::new(codec.capability.clock_rate, Instant::now());
    let mut fps = FpsMeter::default();
    let mut last_size = None;
    let mut last_report = Instant::now();

    loop {
        let packet = match track.read_rtp().await {
            Ok((packet, _)) => packet,
            Err(e) => {
                debug!("Video track ended: {e}");
                break;
            }
        };
        let now = Instant::now();
        reception.on_packet(packet.header.sequence_number, packet.header.timestamp, now);

        if let Some(frame) = assembler.push(&packet, now) {
            if let Some(size) = frame_dimensions(&frame)
                && last_size != Some(size)
            {
                last_size = Some(size);
                events.send(SessionEvent::VideoSize {
                    width: size.0,
                    height: size.1,
                });
            }

            let render_start = Instant::now();
            if let Some(renderer) = &renderer {
                renderer.render_frame(&frame);
            }
            let rendered_at = Instant::now();
            reception.on_frame(frame.received_at, render_start, rendered_at - render_start);
            clock.record_frame(&frame, rendered_at);

            if let Some(rate) = fps.tick(rendered_at) {
                events.send(SessionEvent::InboundFps(rate));
            }
        }

        if now.saturating_duration_since(last_report) >= RECEPTION_REPORT_INTERVAL {
            last_report = now;
            if !events.send(SessionEvent::Reception(reception.snapshot())) {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::rtp::header::Header;

    fn packet(seq: u16, timestamp: u32, marker: bool, payload: &[u8]) -> Packet {
        Packet {
            header: Header {
                version: 2,
                sequence_number: seq,
                timestamp,
                marker,
                payload_type: 96,
                ..Default::default()
            },
            payload: Bytes::copy_from_slice(payload),
        }
    }

    #[test]
    fn h264_frame_closes_on_marker() {
        let mut a = FrameAssembler::new("video/H264");
        let now = Instant::now();
        assert!(a.push(&packet(1, 3000, false, &[0x67, 0x42, 0xc0, 0x1f]), now).is_none());
        let frame = a
            .push(&packet(2, 3000, true, &[0x65, 0x88, 0x84, 0x00]), now)
            .unwrap();
        let types: Vec<u8> = h264::extract_nals(&frame.data).iter().map(|(t, _)| *t).collect();
        assert_eq!(types, vec![7, 5]);
        assert!(frame.keyframe);
        assert_eq!(frame.rtp_timestamp, 3000);
    }

    #[test]
    fn lost_marker_drops_partial_frame() {
        let mut a = FrameAssembler::new("video/H264");
        let now = Instant::now();
        assert!(a.push(&packet(1, 3000, false, &[0x41, 0x9a, 0x01]), now).is_none());
        // Next timestamp begins without the previous marker.
        let frame = a.push(&packet(3, 6000, true, &[0x41, 0x9a, 0x02]), now).unwrap();
        assert_eq!(frame.rtp_timestamp, 6000);
        assert_eq!(h264::extract_nals(&frame.data).len(), 1);
        assert!(!frame.keyframe);
    }

    #[test]
    fn passthrough_concatenates_payloads() {
        let mut a = FrameAssembler::new("video/AV1");
        let now = Instant::now();
        a.push(&packet(1, 10, false, &[1, 2]), now);
        let frame = a.push(&packet(2, 10, true, &[3]), now).unwrap();
        assert_eq!(frame.data.as_ref(), &[1, 2, 3]);
    }

    #[test]
    fn vp8_keyframe_size() {
        // Payload descriptor (S bit) + key frame tag + start code + 1920x1080
        let payload = [
            0x10, 0x50, 0x2a, 0x01, 0x9d, 0x01, 0x2a, 0x80, 0x07, 0x38, 0x04, 0x00,
        ];
        let mut a = FrameAssembler::new("video/VP8");
        let frame = a.push(&packet(1, 1, true, &payload), Instant::now()).unwrap();
        assert!(frame.keyframe);
        assert_eq!(frame_dimensions(&frame), Some((1920, 1080)));
    }

    #[test]
    fn vp8_interframe_has_no_size() {
        assert_eq!(vp8_keyframe_dimensions(&[0x01, 0, 0, 0x9d, 0x01, 0x2a, 1, 0, 1, 0]), None);
        assert_eq!(vp8_keyframe_dimensions(&[0x00, 0, 0]), None);
    }

    #[test]
    fn fps_over_half_second_window() {
        let mut m = FpsMeter::default();
        let base = Instant::now();
        let mut published = None;
        for i in 0..=15 {
            if let Some(rate) = m.tick(base + Duration::from_millis(i * 1000 / 30)) {
                published = Some(rate);
            }
        }
        let rate = published.unwrap();
        assert!((rate - 32.0).abs() < 1.5, "rate {rate}");
    }

    #[test]
    fn fps_silent_inside_window() {
        let mut m = FpsMeter::default();
        let base = Instant::now();
        assert!(m.tick(base).is_none());
        assert!(m.tick(base + Duration::from_millis(100)).is_none());
    }

    #[test]
    fn reception_counts_losses_across_wrap() {
        let base = Instant::now();
        let mut r = ReceptionTracker::new(90_000, base);
        for seq in [65_533u16, 65_534, 1, 2] {
            r.on_packet(seq, 0, base);
        }
        // 65535 and 0 missing
        assert_eq!(r.snapshot().packets_received, 4);
        assert_eq!(r.snapshot().packets_lost, 2);
    }

    #[test]
    fn extended_sequence_survives_65536_wraps() {
        let base = Instant::now();
        let mut r = ReceptionTracker::new(90_000, base);
        r.on_packet(65_534, 0, base);
        // Fast-forward to the last cycle a 32-bit counter could hold
        r.cycles = 0xFFFF_0000;
        r.stats.packets_received = 0xFFFF_0001;
        r.on_packet(65_535, 0, base);
        assert_eq!(r.snapshot().packets_lost, 0);
        r.on_packet(0, 0, base);
        assert_eq!(r.cycles, 1 << 32);
        assert_eq!(r.snapshot().packets_lost, 0);
    }

    #[test]
    fn reordered_packet_is_not_lost() {
        let base = Instant::now();
        let mut r = ReceptionTracker::new(90_000, base);
        for seq in [10u16, 12, 11, 13] {
            r.on_packet(seq, 0, base);
        }
        assert_eq!(r.snapshot().packets_lost, 0);
    }

    #[test]
    fn steady_stream_has_no_jitter() {
        let base = Instant::now();
        let mut r = ReceptionTracker::new(90_000, base);
        for i in 0..10u32 {
            // One packet every 10 ms, timestamps advance by 900 ticks.
            r.on_packet(i as u16, i * 900, base + Duration::from_millis(u64::from(i) * 10));
        }
        assert!(r.snapshot().jitter_secs < 1e-6);
    }

    #[test]
    fn late_packet_adds_jitter() {
        let base = Instant::now();
        let mut r = ReceptionTracker::new(90_000, base);
        r.on_packet(0, 0, base);
        r.on_packet(1, 900, base + Duration::from_millis(26));
        // |transit diff| = 16 ms, jitter = 16/16 = 1 ms
        let jitter = r.snapshot().jitter_secs;
        assert!((jitter - 0.001).abs() < 1e-4, "jitter {jitter}");
    }

    #[test]
    fn frame_timing_accumulates() {
        let base = Instant::now();
        let mut r = ReceptionTracker::new(90_000, base);
        r.on_frame(base, base + Duration::from_millis(20), Duration::from_millis(4));
        r.on_frame(base, base + Duration::from_millis(40), Duration::from_millis(6));
        let s = r.snapshot();
        assert_eq!(s.jitter_buffer_emitted_count, 2);
        assert!((s.jitter_buffer_delay_secs - 0.060).abs() < 1e-9);
        assert!((s.total_decode_secs - 0.010).abs() < 1e-9);
        assert_eq!(s.frames_decoded, 2);
    }
}
