//! Connection quality snapshot, recomputed once per second.

use std::time::Instant;

use serde::Serialize;
use webrtc::stats::{StatsReport, StatsReportType};

use crate::video::ReceptionStats;

/// Raw counters gathered for one sample. `None` means the source did not
/// report the value this round.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsSample {
    pub bytes_received: Option<u64>,
    pub jitter_secs: Option<f64>,
    pub jitter_buffer_delay_secs: Option<f64>,
    pub jitter_buffer_emitted_count: Option<u64>,
    pub total_decode_secs: Option<f64>,
    pub frames_decoded: Option<u64>,
    pub packets_lost: Option<i64>,
    pub round_trip_secs: Option<f64>,
}

impl StatsSample {
    /// Merge the transport's report (bytes, RTT) with locally tracked
    /// reception counters (jitter, loss, playout, decode).
    pub fn collect(report: &StatsReport, reception: Option<&ReceptionStats>) -> Self {
        let mut sample = Self::default();
        for stat in report.reports.values() {
            match stat {
                StatsReportType::InboundRTP(rtp) if rtp.kind == "video" => {
                    sample.bytes_received = Some(rtp.bytes_received);
                }
                StatsReportType::CandidatePair(pair)
                    if pair.nominated && pair.current_round_trip_time.is_finite() =>
                {
                    sample.round_trip_secs = Some(pair.current_round_trip_time);
                }
                _ => {}
            }
        }
        if let Some(r) = reception {
            sample.jitter_secs = Some(r.jitter_secs);
            sample.jitter_buffer_delay_secs = Some(r.jitter_buffer_delay_secs);
            sample.jitter_buffer_emitted_count = Some(r.jitter_buffer_emitted_count);
            sample.total_decode_secs = Some(r.total_decode_secs);
            sample.frames_decoded = Some(r.frames_decoded);
            sample.packets_lost = Some(r.packets_lost);
        }
        sample
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ConnectionQuality {
    pub inbound_kbps: Option<f64>,
    pub jitter_ms: Option<i64>,
    pub playout_delay_ms: Option<i64>,
    pub decode_ms: Option<i64>,
    pub packets_lost: Option<i64>,
    pub round_trip_ms: Option<i64>,
}

fn millis(secs: f64) -> i64 {
    (secs * 1000.0).round() as i64
}

/// Turns successive samples into a [`ConnectionQuality`]. Bitrate needs the
/// previous sample, so the first one after a reset has no `inbound_kbps`.
#[derive(Default)]
pub struct QualityTracker {
    previous: Option<(u64, Instant)>,
}

impl QualityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, sample: &StatsSample, now: Instant) -> ConnectionQuality {
        let Some(bytes) = sample.bytes_received else {
            // No inbound video yet: nothing is meaningful, start over.
            self.previous = None;
            return ConnectionQuality::default();
        };

        let inbound_kbps = self.previous.and_then(|(prev_bytes, prev_at)| {
            let dt = now.saturating_duration_since(prev_at).as_secs_f64();
            let delta = bytes.checked_sub(prev_bytes)?;
            (dt > 0.0).then(|| (delta as f64 * 8.0 / dt) / 1000.0)
        });
        self.previous = Some((bytes, now));

        let playout_delay_ms = match (sample.jitter_buffer_delay_secs, sample.jitter_buffer_emitted_count) {
            (Some(delay), Some(count)) if count > 0 => Some(millis(delay / count as f64)),
            _ => None,
        };
        let decode_ms = match (sample.total_decode_secs, sample.frames_decoded) {
            (Some(total), Some(frames)) if frames > 0 => Some(millis(total / frames as f64)),
            _ => None,
        };

        ConnectionQuality {
            inbound_kbps,
            jitter_ms: sample.jitter_secs.map(millis),
            playout_delay_ms,
            decode_ms,
            packets_lost: sample.packets_lost,
            round_trip_ms: sample.round_trip_secs.map(millis),
        }
    }

    pub fn reset(&mut self) {
        self.previous = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sample(bytes: u64) -> StatsSample {
        StatsSample {
            bytes_received: Some(bytes),
            ..Default::default()
        }
    }

    #[test]
    fn first_sample_has_no_bitrate() {
        let mut t = QualityTracker::new();
        let q = t.update(&sample(10_000), Instant::now());
        assert_eq!(q.inbound_kbps, None);
    }

    #[test]
    fn bitrate_from_byte_delta() {
        let mut t = QualityTracker::new();
        let base = Instant::now();
        t.update(&sample(0), base);
        let q = t.update(&sample(125_000), base + Duration::from_secs(1));
        // 125 kB in 1 s = 1000 kbit/s
        assert!((q.inbound_kbps.unwrap() - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn counter_going_backwards_yields_no_bitrate() {
        let mut t = QualityTracker::new();
        let base = Instant::now();
        t.update(&sample(50_000), base);
        let q = t.update(&sample(10_000), base + Duration::from_secs(1));
        assert_eq!(q.inbound_kbps, None);
        // The lower counter becomes the new baseline.
        let q = t.update(&sample(22_500), base + Duration::from_secs(2));
        assert!((q.inbound_kbps.unwrap() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn zero_interval_yields_no_bitrate() {
        let mut t = QualityTracker::new();
        let now = Instant::now();
        t.update(&sample(0), now);
        assert_eq!(t.update(&sample(1000), now).inbound_kbps, None);
    }

    #[test]
    fn missing_bytes_clears_everything_and_resets() {
        let mut t = QualityTracker::new();
        let base = Instant::now();
        t.update(&sample(1000), base);
        let q = t.update(
            &StatsSample {
                jitter_secs: Some(0.02),
                round_trip_secs: Some(0.05),
                ..Default::default()
            },
            base + Duration::from_secs(1),
        );
        assert_eq!(q, ConnectionQuality::default());
        // Baseline was dropped, so the next sample starts fresh.
        let q = t.update(&sample(5000), base + Duration::from_secs(2));
        assert_eq!(q.inbound_kbps, None);
    }

    #[test]
    fn derived_millisecond_fields() {
        let mut t = QualityTracker::new();
        let q = t.update(
            &StatsSample {
                bytes_received: Some(1),
                jitter_secs: Some(0.0124),
                jitter_buffer_delay_secs: Some(3.0),
                jitter_buffer_emitted_count: Some(100),
                total_decode_secs: Some(0.6),
                frames_decoded: Some(200),
                packets_lost: Some(3),
                round_trip_secs: Some(0.0416),
            },
            Instant::now(),
        );
        assert_eq!(q.jitter_ms, Some(12));
        assert_eq!(q.playout_delay_ms, Some(30));
        assert_eq!(q.decode_ms, Some(3));
        assert_eq!(q.packets_lost, Some(3));
        assert_eq!(q.round_trip_ms, Some(42));
    }

    #[test]
    fn zero_counts_leave_averages_empty() {
        let mut t = QualityTracker::new();
        let q = t.update(
            &StatsSample {
                bytes_received: Some(1),
                jitter_buffer_delay_secs: Some(0.0),
                jitter_buffer_emitted_count: Some(0),
                total_decode_secs: Some(0.0),
                frames_decoded: Some(0),
                ..Default::default()
            },
            Instant::now(),
        );
        assert_eq!(q.playout_delay_ms, None);
        assert_eq!(q.decode_ms, None);
    }

    #[test]
    fn collect_copies_reception_counters() {
        let reception = ReceptionStats {
            packets_received: 10,
            packets_lost: 2,
            jitter_secs: 0.004,
            jitter_buffer_delay_secs: 0.2,
            jitter_buffer_emitted_count: 4,
            total_decode_secs: 0.01,
            frames_decoded: 4,
        };
        let report = StatsReport {
            reports: std::collections::HashMap::new(),
        };
        let sample = StatsSample::collect(&report, Some(&reception));
        assert_eq!(sample.bytes_received, None);
        assert_eq!(sample.packets_lost, Some(2));
        assert_eq!(sample.frames_decoded, Some(4));
    }
}
