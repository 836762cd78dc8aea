//! Built-in latency tracker.
//!
//! Estimates CPU and GPU frame times from the timestamps of the last
//! few frames and delays the start of the next frame so that its first
//! GPU submission lands just as the previous frame's final submission
//! completes. When a frame rate limit applies, presentation timestamps
//! are extrapolated and the later of the two deadlines wins.

use std::time::{Duration, Instant};

use ash::vk;
use parking_lot::{Condvar, Mutex};

use super::{
    frame_rate_override, interval_from_rate, sleep_until, FrameData, LatencyStats, LatencyTracker,
};

const FRAME_COUNT: usize = 8;

struct TrackerState {
    frames: [FrameData; FRAME_COUNT],
    valid_range_begin: u64,
    valid_range_end: u64,
}

impl TrackerState {
    fn find_frame(&self, frame_id: u64) -> Option<&FrameData> {
        (frame_id >= self.valid_range_begin && frame_id <= self.valid_range_end)
            .then(|| &self.frames[(frame_id % FRAME_COUNT as u64) as usize])
    }

    fn find_frame_mut(&mut self, frame_id: u64) -> Option<&mut FrameData> {
        (frame_id >= self.valid_range_begin && frame_id <= self.valid_range_end)
            .then(|| &mut self.frames[(frame_id % FRAME_COUNT as u64) as usize])
    }

    fn init_frame(&mut self, frame_id: u64) -> &mut FrameData {
        if self.valid_range_end + 1 != frame_id {
            self.valid_range_begin = frame_id;
        }

        if self.valid_range_begin + (FRAME_COUNT as u64) <= frame_id {
            self.valid_range_begin = frame_id + 1 - FRAME_COUNT as u64;
        }

        self.valid_range_end = frame_id;

        let frame = &mut self.frames[(frame_id % FRAME_COUNT as u64) as usize];
        *frame = FrameData::new(frame_id);
        frame
    }
}

/// Latency tracker based purely on CPU timestamps from the backend.
pub struct BuiltinLatencyTracker {
    state: Mutex<TrackerState>,
    cond: Condvar,

    tolerance: Duration,
    env_frame_rate: Option<f64>,
}

impl BuiltinLatencyTracker {
    pub fn new(tolerance_us: u32) -> Self {
        log::info!("Latency control enabled, using built-in algorithm");

        Self {
            state: Mutex::new(TrackerState {
                frames: [FrameData::default(); FRAME_COUNT],
                valid_range_begin: 1,
                valid_range_end: 0,
            }),
            cond: Condvar::new(),
            tolerance: Duration::from_micros(tolerance_us as u64),
            env_frame_rate: frame_rate_override(),
        }
    }

    fn frame_interval(&self, max_frame_rate: f64) -> Duration {
        interval_from_rate(self.env_frame_rate.unwrap_or(max_frame_rate))
    }

    fn sleep(&self, frame_id: u64, max_frame_rate: f64) -> Duration {
        let mut state = self.state.lock();

        // Wait for all relevant timings of preceding frames to become
        // available. This should not stall for long if the swap chain
        // enforces a maximum frame latency of one.
        for i in 2..=FRAME_COUNT as u64 {
            let id = frame_id.wrapping_sub(i);

            match state.find_frame(id) {
                Some(frame) if frame.cpu_present_end.is_some() => (),
                _ => return Duration::ZERO,
            }

            while state.find_frame(id).map_or(false, |f| f.gpu_present.is_none()) {
                self.cond.wait(&mut state);
            }

            if state.find_frame(id).is_none() {
                return Duration::ZERO;
            }
        }

        // Wait for the current frame's present call to be processed, or
        // stalled presents from previous frames confuse the estimates.
        let prev_id = frame_id.wrapping_sub(1);

        if state
            .find_frame(prev_id)
            .map_or(false, |f| f.cpu_present_end.is_some())
        {
            while state
                .find_frame(prev_id)
                .map_or(false, |f| f.present_status == vk::Result::NOT_READY)
            {
                self.cond.wait(&mut state);
            }
        }

        let interval = self.frame_interval(max_frame_rate);

        let Some(wake) = compute_wake_time(&state, frame_id, self.tolerance, interval) else {
            return Duration::ZERO;
        };

        let now = Instant::now();

        // Release the lock before sleeping, or the sleep would show up
        // in the timing measurements of other threads.
        drop(state);

        sleep_until(now, wake);
        wake.saturating_duration_since(now)
    }
}

/// Maximum of the medians of each three consecutive samples. Drops
/// one-frame spikes while still tracking the slowest typical frame.
fn estimate_time(frames: &[Duration]) -> Duration {
    let mut result = Duration::ZERO;

    for window in frames.windows(3) {
        let (a, b, c) = (window[0], window[1], window[2]);

        let min = a.min(b).min(c);
        let max = a.max(b).max(c);
        let median = a + b + c - min - max;

        result = result.max(median);
    }

    result
}

/// Computes the wake-up time for `frame_id` from the timings of the
/// preceding frames. Returns `None` if required data is missing.
fn compute_wake_time(
    state: &TrackerState,
    frame_id: u64,
    tolerance: Duration,
    frame_interval: Duration,
) -> Option<Instant> {
    // Timings of the last complete frame.
    let prev = state.find_frame(frame_id.wrapping_sub(2))?;
    let prev_exec_end = prev.gpu_exec_end?;

    // Estimate the CPU time the application needs before GPU work can
    // start as the delay between frame start and first submission plus
    // any GPU idle time during the frame. Forced GPU sync points make
    // this inaccurate, but there is no way around that here.
    let mut cpu_times = [Duration::ZERO; FRAME_COUNT - 1];
    let mut gpu_times = [Duration::ZERO; FRAME_COUNT - 1];

    for i in 0..FRAME_COUNT as u64 - 1 {
        let frame = state.find_frame(frame_id.wrapping_sub(i + 2))?;

        let frame_start = frame.frame_start?;
        let queue_submit = frame.queue_submit?;
        let exec_start = frame.gpu_exec_start?;
        let exec_end = frame.gpu_exec_end?;

        cpu_times[i as usize] =
            queue_submit.saturating_duration_since(frame_start) + frame.gpu_idle_time;
        gpu_times[i as usize] = exec_end
            .saturating_duration_since(exec_start)
            .saturating_sub(frame.gpu_idle_time);
    }

    let next_cpu_time = estimate_time(&cpu_times);
    let next_gpu_time = estimate_time(&gpu_times);

    // Initial deadline from GPU execution times.
    let mut gpu_deadline = prev_exec_end + 2 * next_gpu_time;

    // When rendering faster than the permitted rate, extrapolate the
    // presentation timestamps of previous frames and average, to absorb
    // erratic present delays.
    if !frame_interval.is_zero() {
        let prev_present = prev.gpu_present?;
        let mut present_delta = Duration::ZERO;

        for i in 2..=FRAME_COUNT as u64 {
            let frame = state.find_frame(frame_id.wrapping_sub(i))?;
            let deadline = frame.gpu_present? + frame_interval * i as u32 - tolerance;
            present_delta += deadline.saturating_duration_since(prev_present);
        }

        let wsi_deadline = prev_present + present_delta / (FRAME_COUNT as u32 - 1);
        gpu_deadline = gpu_deadline.max(wsi_deadline);
    }

    // Line up the next frame so that its first GPU submission happens
    // just before the current frame's final submission completes.
    let tolerance = tolerance + next_gpu_time / 16;
    let gpu_start_time = gpu_deadline - next_gpu_time;

    Some(gpu_start_time - next_cpu_time - tolerance)
}

impl LatencyTracker for BuiltinLatencyTracker {
    fn needs_auto_markers(&self) -> bool {
        true
    }

    fn notify_cpu_present_begin(&self, _frame_id: u64) {}

    fn notify_cpu_present_end(&self, frame_id: u64) {
        let mut state = self.state.lock();

        if let Some(frame) = state.find_frame_mut(frame_id) {
            frame.cpu_present_end = Some(Instant::now());
        }
    }

    fn notify_cs_render_begin(&self, _frame_id: u64) {}

    fn notify_cs_render_end(&self, _frame_id: u64) {}

    fn notify_queue_submit(&self, frame_id: u64) {
        let mut state = self.state.lock();

        if let Some(frame) = state.find_frame_mut(frame_id) {
            if frame.queue_submit.is_none() {
                frame.queue_submit = Some(Instant::now());
            }
        }
    }

    fn notify_queue_present_begin(&self, frame_id: u64) {
        let mut state = self.state.lock();

        if let Some(frame) = state.find_frame_mut(frame_id) {
            frame.queue_present = Some(Instant::now());
        }
    }

    fn notify_queue_present_end(&self, frame_id: u64, status: vk::Result) {
        let mut state = self.state.lock();

        if let Some(frame) = state.find_frame_mut(frame_id) {
            frame.present_status = status;
        }

        self.cond.notify_all();
    }

    fn notify_gpu_execution_begin(&self, frame_id: u64) {
        let mut state = self.state.lock();

        if let Some(frame) = state.find_frame_mut(frame_id) {
            let now = Instant::now();

            if frame.gpu_exec_start.is_none() {
                frame.gpu_exec_start = Some(now);
            }

            if let Some(idle_start) = frame.gpu_idle_start.take() {
                frame.gpu_idle_time += now.saturating_duration_since(idle_start);
            }
        }

        self.cond.notify_all();
    }

    fn notify_gpu_execution_end(&self, frame_id: u64) {
        let mut state = self.state.lock();

        if let Some(frame) = state.find_frame_mut(frame_id) {
            let now = Instant::now();
            frame.gpu_exec_end = Some(now);
            frame.gpu_idle_start = Some(now);
        }
    }

    fn notify_gpu_present_end(&self, frame_id: u64) {
        let mut state = self.state.lock();

        if let Some(frame) = state.find_frame_mut(frame_id) {
            frame.gpu_present = Some(Instant::now());
        }

        self.cond.notify_all();
    }

    fn sleep_and_begin_frame(&self, frame_id: u64, max_frame_rate: f64) {
        let duration = self.sleep(frame_id, max_frame_rate);

        let mut state = self.state.lock();
        let frame = state.init_frame(frame_id);
        frame.frame_start = Some(Instant::now());
        frame.sleep_duration = duration;
    }

    fn discard_timings(&self) {
        let mut state = self.state.lock();
        state.valid_range_begin = state.valid_range_end + 1;
    }

    fn statistics(&self, frame_id: u64) -> LatencyStats {
        let state = self.state.lock();

        let mut id = frame_id;

        while id != 0 && id >= state.valid_range_begin {
            if let Some(frame) = state.find_frame(id) {
                if let (Some(present), Some(start)) = (frame.gpu_present, frame.frame_start) {
                    return LatencyStats {
                        frame_latency: present.saturating_duration_since(start),
                        sleep_duration: frame.sleep_duration,
                    };
                }
            }

            id -= 1;
        }

        LatencyStats::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn median_of_three_maximum() {
        let ms = Duration::from_millis;

        // Uniform frames estimate exactly the frame time.
        assert_eq!(estimate_time(&[ms(4); 7]), ms(4));

        // A single spike is dropped by the median.
        let mut times = [ms(4); 7];
        times[3] = ms(40);
        assert_eq!(estimate_time(&times), ms(4));

        // Two adjacent slow frames do show up.
        times[4] = ms(40);
        assert_eq!(estimate_time(&times), ms(40));
    }

    /// Builds eight complete frames with the given CPU and GPU times,
    /// frame `base_id + i` starting `period` apart.
    fn build_state(
        base: Instant,
        base_id: u64,
        cpu: Duration,
        gpu: Duration,
        period: Duration,
    ) -> TrackerState {
        let mut state = TrackerState {
            frames: [FrameData::default(); FRAME_COUNT],
            valid_range_begin: 1,
            valid_range_end: 0,
        };

        for i in 0..FRAME_COUNT as u64 {
            let id = base_id + i;
            let start = base + period * i as u32;

            let frame = state.init_frame(id);
            frame.frame_start = Some(start);
            frame.cpu_present_end = Some(start + cpu);
            frame.queue_submit = Some(start + cpu);
            frame.queue_present = Some(start + cpu);
            frame.gpu_exec_start = Some(start + cpu);
            frame.gpu_exec_end = Some(start + cpu + gpu);
            frame.gpu_present = Some(start + cpu + gpu);
            frame.present_status = vk::Result::SUCCESS;
        }

        state
    }

    #[test]
    fn uncapped_sleep_aligns_to_gpu_deadline() {
        let ms = Duration::from_millis;
        let base = Instant::now();

        let cpu = ms(4);
        let gpu = ms(8);

        // Frames 1..=8 recorded; planning frame 10 (prev complete is 8).
        let state = build_state(base, 1, cpu, gpu, ms(12));
        let tolerance = ms(1);

        let wake = compute_wake_time(&state, 10, tolerance, Duration::ZERO)
            .expect("complete state must produce a wake time");

        let prev_exec_end = base + ms(12) * 7 + cpu + gpu;
        let expected =
            prev_exec_end + 2 * gpu - gpu - cpu - (tolerance + gpu / 16);

        assert_eq!(wake, expected);

        // The invariant from the pacing contract: the frame start is no
        // earlier than prev.gpu_exec_end - next_gpu - tolerance.
        assert!(wake >= prev_exec_end - gpu - (tolerance + gpu / 16));
    }

    #[test]
    fn frame_rate_limit_extends_deadline() {
        let ms = Duration::from_millis;
        let us = Duration::from_micros;
        let base = Instant::now();

        // GPU-bound deadline of 8 ms; a 120 Hz limit extrapolates
        // presents two intervals (16.7 ms) ahead and must win.
        let cpu = ms(4);
        let gpu = ms(4);
        let interval = us(8333);

        // Frames presented exactly at the target rate.
        let state = build_state(base, 1, cpu, gpu, interval);
        let tolerance = ms(1);

        let uncapped = compute_wake_time(&state, 10, tolerance, Duration::ZERO).unwrap();
        let capped = compute_wake_time(&state, 10, tolerance, interval).unwrap();

        // The present-based deadline must not wake earlier than the
        // GPU-based one.
        assert!(capped > uncapped);

        // Every extrapolated deadline lands two intervals past the last
        // recorded present, minus the tolerance.
        let prev_present = base + interval * 7 + cpu + gpu;
        let wsi_deadline = prev_present + 2 * interval - tolerance;
        let expected = wsi_deadline - gpu - cpu - (tolerance + gpu / 16);

        assert_eq!(capped, expected);

        // The implied present of the next frame keeps at least one
        // frame interval of spacing.
        let implied_present = capped + cpu + (tolerance + gpu / 16) + gpu;
        assert!(implied_present.saturating_duration_since(prev_present) >= interval);
    }

    #[test]
    fn missing_frames_disable_sleep() {
        let base = Instant::now();
        let ms = Duration::from_millis;

        let mut state = build_state(base, 1, ms(4), ms(8), ms(12));

        // Invalidate the window, as discard_timings does.
        state.valid_range_begin = state.valid_range_end + 1;

        assert!(compute_wake_time(&state, 10, ms(1), Duration::ZERO).is_none());
    }
}
