//! Stream liveness.
//!
//! ICE can report "connected" while no video arrives (encoder hung on the
//! device, capture unplugged). The render path stamps every frame into a
//! [`FrameClock`]; the owner's 1 Hz tick runs [`StreamHealthMonitor::check`]
//! against that stamp.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use overlook_protocol::HealthConfig;

use crate::video::VideoFrame;

pub const STALL_REASON: &str = "Video stream stalled";

/// Captured frames are kept at most 12 times per second.
pub const FRAME_CAPTURE_INTERVAL: Duration = Duration::from_nanos(1_000_000_000 / 12);

#[derive(Default)]
struct FrameSlot {
    last_frame_at: Option<Instant>,
    last_capture_at: Option<Instant>,
    captured: Option<VideoFrame>,
}

/// Shared between the video reader task (writer) and the owner (reader).
#[derive(Default)]
pub struct FrameClock {
    slot: Mutex<FrameSlot>,
    capture_enabled: AtomicBool,
}

impl FrameClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called from the render path for every frame handed to the renderer.
    pub fn record_frame(&self, frame: &VideoFrame, now: Instant) {
        let capture = self.capture_enabled.load(Ordering::Relaxed);
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        slot.last_frame_at = Some(now);
        if !capture {
            return;
        }
        let due = slot
            .last_capture_at
            .is_none_or(|at| now.saturating_duration_since(at) >= FRAME_CAPTURE_INTERVAL);
        if due {
            slot.last_capture_at = Some(now);
            slot.captured = Some(frame.clone());
        }
    }

    pub fn last_frame_at(&self) -> Option<Instant> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).last_frame_at
    }

    pub fn set_capture_enabled(&self, enabled: bool) {
        self.capture_enabled.store(enabled, Ordering::Relaxed);
        if !enabled {
            let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
            slot.captured = None;
            slot.last_capture_at = None;
        }
    }

    pub fn capture_enabled(&self) -> bool {
        self.capture_enabled.load(Ordering::Relaxed)
    }

    pub fn captured_frame(&self) -> Option<VideoFrame> {
        self.slot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .captured
            .clone()
    }

    /// Forget everything, including the capture flag.
    pub fn reset(&self) {
        self.capture_enabled.store(false, Ordering::Relaxed);
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = FrameSlot::default();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthThresholds {
    pub stall: Duration,
    pub initial_frame: Duration,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            stall: Duration::from_secs(3),
            initial_frame: Duration::from_secs(5),
        }
    }
}

impl From<&HealthConfig> for HealthThresholds {
    fn from(config: &HealthConfig) -> Self {
        Self {
            stall: Duration::from_millis(config.stall_threshold_ms),
            initial_frame: Duration::from_millis(config.initial_frame_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthVerdict {
    pub stalled: bool,
    pub frame_age: Option<Duration>,
}

impl HealthVerdict {
    /// Frame age in whole seconds, rounded.
    pub fn frame_age_secs(&self) -> Option<u64> {
        self.frame_age.map(|age| age.as_secs_f64().round() as u64)
    }
}

/// Pure stall decision.
///
/// Not connected is never stalled. With a frame on record the stream is
/// stalled once the frame is older than `stall`; before the first frame it
/// is stalled once ICE has been connected longer than `initial_frame`.
pub fn evaluate(
    connected: bool,
    last_frame_at: Option<Instant>,
    ice_connected_at: Option<Instant>,
    now: Instant,
    thresholds: HealthThresholds,
) -> HealthVerdict {
    if !connected {
        return HealthVerdict {
            stalled: false,
            frame_age: None,
        };
    }
    match last_frame_at {
        Some(at) => {
            let age = now.saturating_duration_since(at);
            HealthVerdict {
                stalled: age > thresholds.stall,
                frame_age: Some(age),
            }
        }
        None => HealthVerdict {
            stalled: ice_connected_at
                .is_some_and(|at| now.saturating_duration_since(at) > thresholds.initial_frame),
            frame_age: None,
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallTransition {
    Unchanged,
    Entered,
    Cleared,
}

pub struct StreamHealthMonitor {
    thresholds: HealthThresholds,
    ice_connected_at: Option<Instant>,
    stalled: bool,
}

impl StreamHealthMonitor {
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self {
            thresholds,
            ice_connected_at: None,
            stalled: false,
        }
    }

    pub fn ice_connected(&mut self, at: Instant) {
        self.ice_connected_at = Some(at);
    }

    /// ICE left the connected state: stalled is meaningless until it returns.
    pub fn ice_lost(&mut self) {
        self.stalled = false;
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled
    }

    pub fn check(
        &mut self,
        connected: bool,
        last_frame_at: Option<Instant>,
        now: Instant,
    ) -> (HealthVerdict, StallTransition) {
        let verdict = evaluate(
            connected,
            last_frame_at,
            self.ice_connected_at,
            now,
            self.thresholds,
        );
        let transition = match (self.stalled, verdict.stalled) {
            (false, true) => StallTransition::Entered,
            (true, false) => StallTransition::Cleared,
            _ => StallTransition::Unchanged,
        };
        self.stalled = verdict.stalled;
        (verdict, transition)
    }

    pub fn reset(&mut self) {
        self.ice_connected_at = None;
        self.stalled = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> VideoFrame {
        VideoFrame::for_test(&[0, 0, 0, 1, 0x65, 0x88])
    }

    fn at(base: Instant, millis: u64) -> Instant {
        base + Duration::from_millis(millis)
    }

    #[test]
    fn not_connected_is_never_stalled() {
        let base = Instant::now();
        let v = evaluate(
            false,
            Some(base),
            Some(base),
            at(base, 60_000),
            HealthThresholds::default(),
        );
        assert!(!v.stalled);
        assert_eq!(v.frame_age, None);
    }

    #[test]
    fn stall_threshold_after_last_frame() {
        let base = Instant::now();
        let t = HealthThresholds::default();
        assert!(evaluate(true, Some(base), Some(base), at(base, 3_100), t).stalled);
        assert!(!evaluate(true, Some(base), Some(base), at(base, 2_900), t).stalled);
    }

    #[test]
    fn initial_frame_timeout_without_frames() {
        let base = Instant::now();
        let t = HealthThresholds::default();
        assert!(evaluate(true, None, Some(base), at(base, 5_100), t).stalled);
        assert!(!evaluate(true, None, Some(base), at(base, 4_900), t).stalled);
        // No ICE timestamp yet: nothing to measure against.
        assert!(!evaluate(true, None, None, at(base, 60_000), t).stalled);
    }

    #[test]
    fn frame_age_rounds_to_seconds() {
        let base = Instant::now();
        let v = evaluate(true, Some(base), Some(base), at(base, 1_600), HealthThresholds::default());
        assert_eq!(v.frame_age_secs(), Some(2));
        let v = evaluate(true, Some(base), Some(base), at(base, 400), HealthThresholds::default());
        assert_eq!(v.frame_age_secs(), Some(0));
    }

    #[test]
    fn monitor_reports_transitions_once() {
        let base = Instant::now();
        let mut m = StreamHealthMonitor::new(HealthThresholds::default());
        m.ice_connected(base);

        let (_, t) = m.check(true, Some(base), at(base, 1_000));
        assert_eq!(t, StallTransition::Unchanged);
        let (v, t) = m.check(true, Some(base), at(base, 3_500));
        assert!(v.stalled);
        assert_eq!(t, StallTransition::Entered);
        let (_, t) = m.check(true, Some(base), at(base, 4_500));
        assert_eq!(t, StallTransition::Unchanged);
        let (_, t) = m.check(true, Some(at(base, 4_600)), at(base, 5_000));
        assert_eq!(t, StallTransition::Cleared);
        assert!(!m.is_stalled());
    }

    #[test]
    fn monitor_clears_when_connection_drops() {
        let base = Instant::now();
        let mut m = StreamHealthMonitor::new(HealthThresholds::default());
        m.ice_connected(base);
        m.check(true, None, at(base, 6_000));
        assert!(m.is_stalled());
        let (v, t) = m.check(false, None, at(base, 7_000));
        assert!(!v.stalled);
        assert_eq!(t, StallTransition::Cleared);
    }

    #[test]
    fn thresholds_from_config() {
        let config = HealthConfig {
            stall_threshold_ms: 1500,
            initial_frame_timeout_ms: 2500,
            ..Default::default()
        };
        let t = HealthThresholds::from(&config);
        assert_eq!(t.stall, Duration::from_millis(1500));
        assert_eq!(t.initial_frame, Duration::from_millis(2500));
    }

    #[test]
    fn clock_records_frames_without_capture() {
        let clock = FrameClock::new();
        let now = Instant::now();
        clock.record_frame(&frame(), now);
        assert_eq!(clock.last_frame_at(), Some(now));
        assert!(clock.captured_frame().is_none());
    }

    #[test]
    fn capture_is_throttled_and_cleared_on_disable() {
        let clock = FrameClock::new();
        clock.set_capture_enabled(true);
        let base = Instant::now();

        let first = VideoFrame::for_test(&[1]);
        let second = VideoFrame::for_test(&[2]);
        let third = VideoFrame::for_test(&[3]);

        clock.record_frame(&first, base);
        clock.record_frame(&second, at(base, 40));
        assert_eq!(clock.captured_frame().unwrap().data.as_ref(), &[1]);
        clock.record_frame(&third, at(base, 90));
        assert_eq!(clock.captured_frame().unwrap().data.as_ref(), &[3]);

        clock.set_capture_enabled(false);
        assert!(clock.captured_frame().is_none());
        assert_eq!(clock.last_frame_at(), Some(at(base, 90)));
    }

    #[test]
    fn reset_forgets_frames_and_capture() {
        let clock = FrameClock::new();
        clock.set_capture_enabled(true);
        clock.record_frame(&frame(), Instant::now());
        clock.reset();
        assert!(clock.last_frame_at().is_none());
        assert!(clock.captured_frame().is_none());
        assert!(!clock.capture_enabled());
    }
}
