//! Frame pacing and latency reduction.
//!
//! Latency trackers accumulate per-frame timestamps published by the
//! submission queue and decide how long the application thread should
//! sleep before starting the next frame, aligning the CPU timeline to
//! the GPU. Two implementations exist: a built-in tracker working purely
//! off CPU timestamps, and a tracker forwarding markers to a native
//! low-latency API exposed by the presenter.

pub mod builtin;
pub mod reflex;

mod sleep;

pub use sleep::sleep_until;

use std::time::{Duration, Instant};

use ash::vk;
use once_cell::sync::Lazy;

/// Statistics reported for a completed frame.
#[derive(Clone, Copy, Debug, Default)]
pub struct LatencyStats {
    pub frame_latency: Duration,
    pub sleep_duration: Duration,
}

/// Timestamps of a single tracked frame.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct FrameData {
    pub frame_id: u64,
    pub app_frame_id: u64,
    pub frame_start: Option<Instant>,
    pub cpu_input_sample: Option<Instant>,
    pub cpu_sim_begin: Option<Instant>,
    pub cpu_render_begin: Option<Instant>,
    pub cpu_render_end: Option<Instant>,
    pub cpu_present_begin: Option<Instant>,
    pub cpu_present_end: Option<Instant>,
    pub queue_submit: Option<Instant>,
    pub queue_present: Option<Instant>,
    pub gpu_exec_start: Option<Instant>,
    pub gpu_exec_end: Option<Instant>,
    pub gpu_idle_start: Option<Instant>,
    pub gpu_idle_time: Duration,
    pub gpu_present: Option<Instant>,
    pub sleep_duration: Duration,
    pub present_status: vk::Result,
}

impl FrameData {
    pub fn new(frame_id: u64) -> Self {
        Self {
            frame_id,
            present_status: vk::Result::NOT_READY,
            ..Default::default()
        }
    }
}

/// Per-frame timestamp sink driving latency sleep.
///
/// `notify_*` calls arrive from the application, submission and fence
/// threads; `sleep_and_begin_frame` blocks the application thread.
pub trait LatencyTracker: Send + Sync {
    /// Whether the core must generate markers itself because the
    /// application does not provide any.
    fn needs_auto_markers(&self) -> bool;

    fn notify_cpu_present_begin(&self, frame_id: u64);
    fn notify_cpu_present_end(&self, frame_id: u64);
    fn notify_cs_render_begin(&self, frame_id: u64);
    fn notify_cs_render_end(&self, frame_id: u64);
    fn notify_queue_submit(&self, frame_id: u64);
    fn notify_queue_present_begin(&self, frame_id: u64);
    fn notify_queue_present_end(&self, frame_id: u64, status: vk::Result);
    fn notify_gpu_execution_begin(&self, frame_id: u64);
    fn notify_gpu_execution_end(&self, frame_id: u64);
    fn notify_gpu_present_end(&self, frame_id: u64);

    /// Sleeps until the estimated start time of the given frame, then
    /// marks the frame as started.
    fn sleep_and_begin_frame(&self, frame_id: u64, max_frame_rate: f64);

    /// Discards all timing data, e.g. after a failed present.
    fn discard_timings(&self);

    /// Statistics for the closest complete frame at or below `frame_id`.
    fn statistics(&self, frame_id: u64) -> LatencyStats;
}

/// Latency markers forwarded to a native low-latency API.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LatencyMarker {
    SimulationStart,
    SimulationEnd,
    RenderSubmitStart,
    RenderSubmitEnd,
    PresentStart,
    PresentEnd,
    InputSample,
}

/// Driver-reported frame timing report, in microseconds on the driver's
/// timebase.
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameReport {
    pub frame_id: u64,
    pub input_sample_us: u64,
    pub sim_start_us: u64,
    pub sim_end_us: u64,
    pub render_submit_start_us: u64,
    pub render_submit_end_us: u64,
    pub present_start_us: u64,
    pub present_end_us: u64,
    pub gpu_render_start_us: u64,
    pub gpu_render_end_us: u64,
    pub gpu_active_time_us: u64,
}

/// Native low-latency surface of the presenter. Out of scope for the
/// core; only the contract matters.
pub trait LowLatencyPresenter: Send + Sync {
    fn supports_low_latency(&self) -> bool;

    fn set_latency_sleep_mode(&self, low_latency: bool, boost: bool, min_interval_us: u64);

    /// Blocks until the driver decides the next frame may start.
    fn latency_sleep(&self);

    fn set_latency_marker(&self, frame_id: u64, marker: LatencyMarker);

    fn frame_reports(&self, max_count: u32) -> Vec<FrameReport>;
}

/// Frame rate override from the environment, applied on top of the
/// limiter's max rate.
pub fn frame_rate_override() -> Option<f64> {
    static OVERRIDE: Lazy<Option<f64>> = Lazy::new(|| {
        let value = std::env::var("DXVK_FRAME_RATE").ok()?;
        let rate: f64 = value.parse().ok()?;
        (rate > 0.0 && rate.is_normal()).then_some(rate)
    });

    *OVERRIDE
}

pub(crate) fn interval_from_rate(frame_rate: f64) -> Duration {
    if frame_rate <= 0.0 || !frame_rate.is_normal() {
        return Duration::ZERO;
    }

    Duration::from_nanos((1_000_000_000.0 / frame_rate) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_conversion() {
        assert_eq!(interval_from_rate(0.0), Duration::ZERO);
        assert_eq!(interval_from_rate(-30.0), Duration::ZERO);
        assert_eq!(interval_from_rate(f64::NAN), Duration::ZERO);

        let interval = interval_from_rate(120.0);
        assert!(interval > Duration::from_micros(8300));
        assert!(interval < Duration::from_micros(8400));
    }
}
