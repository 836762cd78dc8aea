//! Queue submission.
//!
//! All work reaches the Vulkan queue through one submission thread;
//! application threads enqueue submit and present entries and optionally
//! block on their status. Each submission signals the device timeline
//! semaphore; completion callbacks release the tracked resources of the
//! command list and recycle it.
//!
//! The device queue itself is guarded by a separate lock that can be
//! leased to external code between submissions.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use arrayvec::ArrayVec;
use ash::vk;
use parking_lot::{Condvar, Mutex};

use crate::{
    command::{CommandList, CommandListPool},
    device::DeviceShared,
    fence::Fence,
    latency::LatencyTracker,
};

/// Status of a queued submission, readable from any thread.
pub struct SubmitStatus {
    result: AtomicI32,
}

impl SubmitStatus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            result: AtomicI32::new(vk::Result::NOT_READY.as_raw()),
        })
    }

    pub fn result(&self) -> vk::Result {
        vk::Result::from_raw(self.result.load(Ordering::Acquire))
    }

    fn set(&self, result: vk::Result) {
        self.result.store(result.as_raw(), Ordering::Release);
    }
}

/// Latency tracking info attached to a submission.
#[derive(Clone)]
pub struct LatencyInfo {
    pub tracker: Arc<dyn LatencyTracker>,
    pub frame_id: u64,
}

/// Presentation surface, implemented by the window-system layer.
///
/// The presenter owns swap chain management and present-wait handling;
/// the core only schedules the present on the queue thread and reports
/// the outcome.
pub trait Presenter: Send + Sync {
    fn present(&self, queue: vk::Queue, frame_id: u64) -> vk::Result;
}

enum SubmissionEntry {
    Submit {
        cmd_list: CommandList,
        latency: Option<LatencyInfo>,
        status: Arc<SubmitStatus>,
    },
    Present {
        presenter: Arc<dyn Presenter>,
        frame_id: u64,
        latency: Option<LatencyInfo>,
        status: Arc<SubmitStatus>,
    },
}

/// Tracks submissions that have not completed on the GPU, and wakes
/// threads waiting on resource idleness.
struct FinishTracker {
    lock: Mutex<()>,
    cond: Condvar,
    pending: AtomicU32,
}

impl FinishTracker {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            lock: Mutex::new(()),
            cond: Condvar::new(),
            pending: AtomicU32::new(0),
        })
    }

    fn add(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    fn complete(&self) {
        let _guard = self.lock.lock();
        self.pending.fetch_sub(1, Ordering::AcqRel);
        self.cond.notify_all();
    }

    fn notify(&self) {
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }

    /// Blocks until the predicate holds. The predicate is re-evaluated
    /// whenever a submission completes; a timeout guards against
    /// completions that do not go through the tracker.
    fn wait_until(&self, predicate: impl Fn() -> bool) {
        let mut guard = self.lock.lock();

        while !predicate() {
            self.cond
                .wait_for(&mut guard, Duration::from_millis(1));
        }
    }
}

struct QueueState {
    entries: VecDeque<SubmissionEntry>,
    stop: bool,
}

struct QueueShared {
    device: Arc<DeviceShared>,
    timeline: Arc<Fence>,
    cmd_pool: Arc<CommandListPool>,

    state: Mutex<QueueState>,
    append_cond: Condvar,

    finish: Arc<FinishTracker>,
    submit_counter: AtomicU64,
}

/// Serialized submit and present pipeline over the device queue.
pub struct SubmissionQueue {
    shared: Arc<QueueShared>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl SubmissionQueue {
    pub fn new(
        device: Arc<DeviceShared>,
        timeline: Arc<Fence>,
        cmd_pool: Arc<CommandListPool>,
    ) -> Self {
        let shared = Arc::new(QueueShared {
            device,
            timeline,
            cmd_pool,
            state: Mutex::new(QueueState {
                entries: VecDeque::new(),
                stop: false,
            }),
            append_cond: Condvar::new(),
            finish: FinishTracker::new(),
            submit_counter: AtomicU64::new(0),
        });

        let worker = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("veneer-queue".into())
                .spawn(move || shared.run())
                .expect("failed to spawn submission thread")
        };

        Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Enqueues a command list for submission.
    pub fn submit(
        &self,
        cmd_list: CommandList,
        latency: Option<LatencyInfo>,
        status: Arc<SubmitStatus>,
    ) {
        self.shared.finish.add();

        let mut state = self.shared.state.lock();
        state.entries.push_back(SubmissionEntry::Submit {
            cmd_list,
            latency,
            status,
        });
        self.shared.append_cond.notify_one();
    }

    /// Enqueues a present operation.
    pub fn present(
        &self,
        presenter: Arc<dyn Presenter>,
        frame_id: u64,
        latency: Option<LatencyInfo>,
        status: Arc<SubmitStatus>,
    ) {
        self.shared.finish.add();

        let mut state = self.shared.state.lock();
        state.entries.push_back(SubmissionEntry::Present {
            presenter,
            frame_id,
            latency,
            status,
        });
        self.shared.append_cond.notify_one();
    }

    /// Blocks until the given submission has been processed by the
    /// submission thread.
    pub fn synchronize_submission(&self, status: &SubmitStatus) {
        self.shared
            .finish
            .wait_until(|| status.result() != vk::Result::NOT_READY);
    }

    /// Blocks until the predicate holds, re-evaluating as submissions
    /// complete on the GPU.
    pub fn synchronize_until(&self, predicate: impl Fn() -> bool) {
        self.shared.finish.wait_until(predicate);
    }

    /// Drains all queued and in-flight submissions.
    pub fn wait_for_idle(&self) {
        let finish = &self.shared.finish;
        finish.wait_until(|| finish.pending.load(Ordering::Acquire) == 0);
    }

    /// Locks the device queue, e.g. to lease it to external code
    /// between submissions.
    pub fn lock_device_queue(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.shared.device.queue_lock.lock()
    }

    /// Timeline value of the most recently enqueued submission.
    pub fn last_submission_id(&self) -> u64 {
        self.shared.submit_counter.load(Ordering::Acquire)
    }

    /// Reserves a timeline value for an out-of-band queue operation,
    /// e.g. a sparse bind.
    pub fn allocate_submission_id(&self) -> u64 {
        self.shared.submit_counter.fetch_add(1, Ordering::AcqRel) + 1
    }
}

impl Drop for SubmissionQueue {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.stop = true;
            self.shared.append_cond.notify_one();
        }

        if let Some(worker) = self.worker.get_mut().take() {
            let _ = worker.join();
        }
    }
}

impl QueueShared {
    fn run(self: Arc<Self>) {
        loop {
            let entry = {
                let mut state = self.state.lock();

                while state.entries.is_empty() && !state.stop {
                    self.append_cond.wait(&mut state);
                }

                if state.entries.is_empty() && state.stop {
                    return;
                }

                state.entries.pop_front().unwrap()
            };

            match entry {
                SubmissionEntry::Submit {
                    cmd_list,
                    latency,
                    status,
                } => self.process_submit(cmd_list, latency, status),
                SubmissionEntry::Present {
                    presenter,
                    frame_id,
                    latency,
                    status,
                } => self.process_present(presenter, frame_id, latency, status),
            }
        }
    }

    fn process_submit(
        &self,
        mut cmd_list: CommandList,
        latency: Option<LatencyInfo>,
        status: Arc<SubmitStatus>,
    ) {
        if let Some(latency) = &latency {
            latency.tracker.notify_queue_submit(latency.frame_id);
        }

        let submission_id = self.submit_counter.fetch_add(1, Ordering::AcqRel) + 1;

        let result = {
            profiling::scope!("vkQueueSubmit");

            let _queue_guard = self.device.queue_lock.lock();

            let command_buffers = [cmd_list.handle()];

            // Room for a presenter semaphore next to the timeline.
            let mut signal_semaphores = ArrayVec::<vk::Semaphore, 2>::new();
            let mut signal_values = ArrayVec::<u64, 2>::new();

            signal_semaphores.push(self.timeline.handle());
            signal_values.push(submission_id);

            let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::builder()
                .signal_semaphore_values(&signal_values);

            let submit_info = vk::SubmitInfo::builder()
                .command_buffers(&command_buffers)
                .signal_semaphores(&signal_semaphores)
                .push_next(&mut timeline_info);

            unsafe {
                self.device.raw.queue_submit(
                    self.device.queue,
                    &[*submit_info],
                    vk::Fence::null(),
                )
            }
        };

        match result {
            Ok(()) => {
                status.set(vk::Result::SUCCESS);

                // GPU execution of this submission begins once the
                // previous one has completed.
                if let Some(latency) = latency.clone() {
                    self.timeline.enqueue_wait(
                        submission_id.saturating_sub(1),
                        Box::new(move || {
                            latency.tracker.notify_gpu_execution_begin(latency.frame_id);
                        }),
                    );
                }

                let finish = Arc::clone(&self.finish);
                let cmd_pool = Arc::clone(&self.cmd_pool);

                self.timeline.enqueue_wait(
                    submission_id,
                    Box::new(move || {
                        if let Some(latency) = &latency {
                            latency.tracker.notify_gpu_execution_end(latency.frame_id);
                        }

                        cmd_pool.recycle(cmd_list);
                        finish.complete();
                    }),
                );
            }
            Err(vr) => {
                log::error!("Queue submission failed: {vr:?}");
                status.set(vr);

                // Still release tracked resources; the GPU never saw
                // this submission.
                cmd_list.reset();
                self.finish.complete();
            }
        }
    }

    fn process_present(
        &self,
        presenter: Arc<dyn Presenter>,
        frame_id: u64,
        latency: Option<LatencyInfo>,
        status: Arc<SubmitStatus>,
    ) {
        if let Some(latency) = &latency {
            latency.tracker.notify_queue_present_begin(latency.frame_id);
        }

        let result = {
            profiling::scope!("vkQueuePresentKHR");

            let _queue_guard = self.device.queue_lock.lock();
            presenter.present(self.device.queue, frame_id)
        };

        status.set(result);

        if let Some(latency) = &latency {
            latency
                .tracker
                .notify_queue_present_end(latency.frame_id, result);

            // Present-wait handling lives in the presenter; the last
            // submission completing is the closest signal the core has
            // for the frame's GPU presentation.
            let tracker = Arc::clone(&latency.tracker);
            let latency_frame_id = latency.frame_id;
            let last_submission = self.submit_counter.load(Ordering::Acquire);

            self.timeline.enqueue_wait(
                last_submission,
                Box::new(move || {
                    tracker.notify_gpu_present_end(latency_frame_id);
                }),
            );
        }

        if result.as_raw() < 0 {
            log::error!("Present failed: {result:?}");

            if let Some(latency) = &latency {
                latency.tracker.discard_timings();
            }
        }

        self.finish.complete();
        self.finish.notify();
    }
}
