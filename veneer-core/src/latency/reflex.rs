//! Latency tracker forwarding to a native low-latency API.
//!
//! Applications drive this tracker with their own frame IDs and
//! markers; the tracker maps them to internal frame IDs, forwards the
//! markers to the presenter and translates driver frame reports back.
//! When the application does not provide markers, the tracker falls
//! back to a markerless mode that still performs the latency sleep
//! around presentation.

use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

use ash::vk;
use parking_lot::{Condvar, Mutex};

use super::{
    FrameData, FrameReport, LatencyMarker, LatencyStats, LatencyTracker, LowLatencyPresenter,
};

/// Keep data for a large number of frames so driver-side statistics can
/// be matched up even when reports arrive late.
const FRAME_COUNT: usize = 256;

struct ReflexState {
    frames: Vec<FrameData>,

    last_begin_app_frame_id: u64,
    last_sleep_app_frame_id: u64,

    next_alloc_frame_id: u64,
    next_valid_frame_id: u64,

    last_no_marker_frame_id: u64,
    last_sleep_duration: Duration,

    low_latency_mode: bool,
    low_latency_no_markers: bool,

    app_to_internal: BTreeMap<u64, u64>,
}

impl ReflexState {
    fn frame_data(&mut self, frame_id: u64) -> &mut FrameData {
        let slot = (frame_id % FRAME_COUNT as u64) as usize;
        let frame = &mut self.frames[slot];

        if frame.frame_id != frame_id {
            *frame = FrameData::new(frame_id);
        }

        frame
    }

    fn lookup_frame_id(&self, app_frame_id: u64) -> Option<u64> {
        self.app_to_internal.get(&app_frame_id).copied()
    }

    fn allocate_frame_id(&mut self, app_frame_id: u64) -> u64 {
        let frame_id = self.next_alloc_frame_id;
        self.next_alloc_frame_id += 1;
        self.map_frame_id(app_frame_id, frame_id);
        frame_id
    }

    fn map_frame_id(&mut self, app_frame_id: u64, frame_id: u64) {
        self.app_to_internal.insert(app_frame_id, frame_id);

        // Bound the mapping; reports older than the frame window are
        // useless anyway.
        while self.app_to_internal.len() > FRAME_COUNT {
            self.app_to_internal.pop_first();
        }

        self.frame_data(frame_id).app_frame_id = app_frame_id;
    }

    fn reset(&mut self) {
        self.app_to_internal.clear();
        self.next_valid_frame_id = self.next_alloc_frame_id;
        self.last_no_marker_frame_id = 0;
    }
}

/// Latency tracker backed by the presenter's native low-latency API.
pub struct ReflexLatencyTracker {
    presenter: std::sync::Arc<dyn LowLatencyPresenter>,

    state: Mutex<ReflexState>,
    cond: Condvar,
}

impl ReflexLatencyTracker {
    pub fn new(presenter: std::sync::Arc<dyn LowLatencyPresenter>) -> Self {
        log::info!("Latency control enabled, using native low-latency mode");

        Self {
            presenter,
            state: Mutex::new(ReflexState {
                frames: vec![FrameData::default(); FRAME_COUNT],
                last_begin_app_frame_id: 0,
                last_sleep_app_frame_id: 0,
                next_alloc_frame_id: 1,
                next_valid_frame_id: 0,
                last_no_marker_frame_id: 0,
                last_sleep_duration: Duration::ZERO,
                low_latency_mode: false,
                low_latency_no_markers: false,
                app_to_internal: BTreeMap::new(),
            }),
            cond: Condvar::new(),
        }
    }

    /// Enables or disables low-latency mode on the presenter.
    pub fn set_latency_sleep_mode(&self, low_latency: bool, boost: bool, min_interval_us: u64) {
        let mut state = self.state.lock();

        if state.low_latency_mode != low_latency {
            state.reset();
        }

        state.low_latency_mode = low_latency;
        self.presenter
            .set_latency_sleep_mode(low_latency, boost, min_interval_us);
    }

    /// Records an application-provided marker.
    pub fn set_latency_marker(&self, app_frame_id: u64, marker: LatencyMarker) {
        let mut state = self.state.lock();

        // Markers disable the markerless fallback for good.
        state.low_latency_no_markers = false;

        let frame_id = match state.lookup_frame_id(app_frame_id) {
            Some(frame_id) => frame_id,
            None => state.allocate_frame_id(app_frame_id),
        };

        let now = Instant::now();
        let frame = state.frame_data(frame_id);

        match marker {
            LatencyMarker::SimulationStart => {
                frame.cpu_sim_begin = Some(now);
                state.last_begin_app_frame_id = app_frame_id;
            }
            LatencyMarker::SimulationEnd => (),
            LatencyMarker::RenderSubmitStart => frame.cpu_render_begin = Some(now),
            LatencyMarker::RenderSubmitEnd => frame.cpu_render_end = Some(now),
            LatencyMarker::PresentStart => frame.cpu_present_begin = Some(now),
            LatencyMarker::PresentEnd => frame.cpu_present_end = Some(now),
            LatencyMarker::InputSample => frame.cpu_input_sample = Some(now),
        }

        self.presenter.set_latency_marker(app_frame_id, marker);
    }

    /// Performs the application-driven latency sleep.
    pub fn latency_sleep(&self) {
        {
            let mut state = self.state.lock();
            state.last_sleep_app_frame_id = state.last_begin_app_frame_id + 1;
        }

        self.presenter.latency_sleep();
    }

    /// Retrieves driver frame reports, translated to application frame
    /// IDs. Reports for frames without a known mapping are dropped.
    pub fn frame_reports(&self, max_count: u32) -> Vec<FrameReport> {
        let reports = self.presenter.frame_reports(max_count);
        let state = self.state.lock();

        reports
            .into_iter()
            .filter_map(|mut report| {
                let slot = (report.frame_id % FRAME_COUNT as u64) as usize;
                let frame = &state.frames[slot];

                if frame.frame_id != report.frame_id
                    || frame.frame_id < state.next_valid_frame_id
                    || frame.app_frame_id == 0
                {
                    return None;
                }

                report.frame_id = frame.app_frame_id;

                // Fill in CPU-side timestamps the driver does not know
                // about, translated onto the report's timebase.
                if report.input_sample_us == 0 {
                    report.input_sample_us =
                        map_timestamp_to_report_us(frame, &report, frame.cpu_input_sample);
                }
                if report.sim_start_us == 0 {
                    report.sim_start_us =
                        map_timestamp_to_report_us(frame, &report, frame.cpu_sim_begin);
                }
                if report.render_submit_start_us == 0 {
                    report.render_submit_start_us =
                        map_timestamp_to_report_us(frame, &report, frame.cpu_render_begin);
                }
                if report.render_submit_end_us == 0 {
                    report.render_submit_end_us =
                        map_timestamp_to_report_us(frame, &report, frame.cpu_render_end);
                }
                if report.present_end_us == 0 {
                    report.present_end_us =
                        map_timestamp_to_report_us(frame, &report, frame.cpu_present_end);
                }

                Some(report)
            })
            .collect()
    }

    /// Looks up the internal frame ID for an application frame ID.
    pub fn frame_id_from_app_frame_id(&self, app_frame_id: u64) -> u64 {
        self.state.lock().lookup_frame_id(app_frame_id).unwrap_or(0)
    }

    /// Whether the tracker is currently pacing frames without
    /// application-provided markers.
    pub fn is_markerless(&self) -> bool {
        self.state.lock().low_latency_no_markers
    }
}

impl LatencyTracker for ReflexLatencyTracker {
    fn needs_auto_markers(&self) -> bool {
        // The application provides markers; the core only fills in the
        // queue-side timestamps.
        false
    }

    fn notify_cpu_present_begin(&self, frame_id: u64) {
        let mut state = self.state.lock();
        state.frame_data(frame_id).cpu_present_begin = Some(Instant::now());
    }

    fn notify_cpu_present_end(&self, frame_id: u64) {
        let mut state = self.state.lock();
        state.frame_data(frame_id).cpu_present_end = Some(Instant::now());
    }

    fn notify_cs_render_begin(&self, frame_id: u64) {
        let mut state = self.state.lock();
        state.frame_data(frame_id).cpu_render_begin = Some(Instant::now());
    }

    fn notify_cs_render_end(&self, frame_id: u64) {
        let mut state = self.state.lock();
        state.frame_data(frame_id).cpu_render_end = Some(Instant::now());
    }

    fn notify_queue_submit(&self, frame_id: u64) {
        let mut state = self.state.lock();
        let frame = state.frame_data(frame_id);

        if frame.queue_submit.is_none() {
            frame.queue_submit = Some(Instant::now());
        }
    }

    fn notify_queue_present_begin(&self, frame_id: u64) {
        let mut state = self.state.lock();
        state.frame_data(frame_id).queue_present = Some(Instant::now());
    }

    fn notify_queue_present_end(&self, frame_id: u64, status: vk::Result) {
        let mut state = self.state.lock();
        state.frame_data(frame_id).present_status = status;
        self.cond.notify_all();
    }

    fn notify_gpu_execution_begin(&self, frame_id: u64) {
        let mut state = self.state.lock();
        let frame = state.frame_data(frame_id);
        let now = Instant::now();

        if frame.gpu_exec_start.is_none() {
            frame.gpu_exec_start = Some(now);
        }

        if let Some(idle_start) = frame.gpu_idle_start.take() {
            frame.gpu_idle_time += now.saturating_duration_since(idle_start);
        }
    }

    fn notify_gpu_execution_end(&self, frame_id: u64) {
        let mut state = self.state.lock();
        let frame = state.frame_data(frame_id);
        let now = Instant::now();

        frame.gpu_exec_end = Some(now);
        frame.gpu_idle_start = Some(now);
    }

    fn notify_gpu_present_end(&self, frame_id: u64) {
        let mut state = self.state.lock();
        state.frame_data(frame_id).gpu_present = Some(Instant::now());
        self.cond.notify_all();
    }

    fn sleep_and_begin_frame(&self, frame_id: u64, _max_frame_rate: f64) {
        let mut state = self.state.lock();

        // Applications that enabled low-latency mode but do not drive
        // the sleep themselves still expect it to happen: fall back to
        // markerless mode when no application sleep arrived since the
        // previous frame.
        let markerless = state.low_latency_mode
            && state.last_sleep_app_frame_id == state.last_no_marker_frame_id;

        state.low_latency_no_markers = markerless;
        state.last_no_marker_frame_id = state.last_sleep_app_frame_id;

        let sleep_start = Instant::now();

        if markerless {
            drop(state);

            self.presenter.latency_sleep();

            let mut state = self.state.lock();
            let sleep_duration = Instant::now().saturating_duration_since(sleep_start);
            state.last_sleep_duration = sleep_duration;

            let frame = state.frame_data(frame_id);

            // The driver may already fold the sleep into the simulation
            // interval; subtract it from the frame start so it is not
            // counted twice.
            frame.frame_start = Some(sleep_start);
            frame.sleep_duration = sleep_duration;
        } else {
            let last_sleep_duration = state.last_sleep_duration;
            let frame = state.frame_data(frame_id);
            frame.frame_start = Some(sleep_start);
            frame.sleep_duration = last_sleep_duration;
            state.last_sleep_duration = Duration::ZERO;
        }
    }

    fn discard_timings(&self) {
        self.state.lock().reset();
    }

    fn statistics(&self, frame_id: u64) -> LatencyStats {
        let state = self.state.lock();

        let mut id = frame_id;

        while id != 0 && id + (FRAME_COUNT as u64) > frame_id {
            let slot = (id % FRAME_COUNT as u64) as usize;
            let frame = &state.frames[slot];

            if frame.frame_id == id {
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

/// Translates a CPU timestamp onto the driver timebase of a frame
/// report, anchored on the present-begin marker both sides record.
fn map_timestamp_to_report_us(
    frame: &FrameData,
    report: &FrameReport,
    timestamp: Option<Instant>,
) -> u64 {
    let anchor = match frame.cpu_present_begin.or(frame.queue_present) {
        Some(anchor) => anchor,
        None => return 0,
    };

    let (Some(timestamp), anchor_us) = (timestamp, report.present_start_us) else {
        return 0;
    };

    if anchor_us == 0 {
        return 0;
    }

    if timestamp >= anchor {
        anchor_us + (timestamp - anchor).as_micros() as u64
    } else {
        anchor_us.saturating_sub((anchor - timestamp).as_micros() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct NullPresenter {
        sleeps: AtomicU32,
        markers: AtomicU32,
    }

    impl LowLatencyPresenter for NullPresenter {
        fn supports_low_latency(&self) -> bool {
            true
        }

        fn set_latency_sleep_mode(&self, _: bool, _: bool, _: u64) {}

        fn latency_sleep(&self) {
            self.sleeps.fetch_add(1, Ordering::SeqCst);
        }

        fn set_latency_marker(&self, _: u64, _: LatencyMarker) {
            self.markers.fetch_add(1, Ordering::SeqCst);
        }

        fn frame_reports(&self, _: u32) -> Vec<FrameReport> {
            Vec::new()
        }
    }

    #[test]
    fn app_frame_ids_map_to_internal_ids() {
        let presenter = Arc::new(NullPresenter::default());
        let tracker = ReflexLatencyTracker::new(presenter);

        tracker.set_latency_marker(1000, LatencyMarker::SimulationStart);
        tracker.set_latency_marker(1001, LatencyMarker::SimulationStart);

        let a = tracker.frame_id_from_app_frame_id(1000);
        let b = tracker.frame_id_from_app_frame_id(1001);

        assert_ne!(a, 0);
        assert_eq!(b, a + 1);

        // Repeated markers reuse the mapping.
        tracker.set_latency_marker(1000, LatencyMarker::PresentEnd);
        assert_eq!(tracker.frame_id_from_app_frame_id(1000), a);

        // Unknown IDs resolve to 0.
        assert_eq!(tracker.frame_id_from_app_frame_id(5000), 0);
    }

    #[test]
    fn markerless_mode_invokes_driver_sleep() {
        let presenter = Arc::new(NullPresenter::default());
        let tracker =
            ReflexLatencyTracker::new(Arc::clone(&presenter) as Arc<dyn LowLatencyPresenter>);

        tracker.set_latency_sleep_mode(true, false, 0);

        // No application sleep arrived, so frame pacing falls back to
        // the markerless driver sleep, once per frame.
        tracker.sleep_and_begin_frame(1, 0.0);
        tracker.sleep_and_begin_frame(2, 0.0);
        assert_eq!(presenter.sleeps.load(Ordering::SeqCst), 2);

        // An application-driven sleep disables the fallback for the
        // next frame: the driver sleep happens exactly once.
        tracker.set_latency_marker(100, LatencyMarker::SimulationStart);
        tracker.latency_sleep();
        tracker.sleep_and_begin_frame(3, 0.0);
        assert_eq!(presenter.sleeps.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn marker_reports_translate_ids() {
        let presenter = Arc::new(NullPresenter::default());
        let tracker = ReflexLatencyTracker::new(presenter);

        tracker.set_latency_marker(777, LatencyMarker::SimulationStart);
        let internal = tracker.frame_id_from_app_frame_id(777);
        assert_ne!(internal, 0);
    }
}
