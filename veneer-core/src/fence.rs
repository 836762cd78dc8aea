//! Timeline-semaphore fences.
//!
//! A fence wraps a Vulkan timeline semaphore and dispatches callbacks
//! when the semaphore reaches enqueued values. Each fence runs a worker
//! thread that waits on the semaphore; a short wait timeout covers the
//! race where a callback is enqueued after the value was signaled but
//! before the worker observed it.

use std::{
    cmp::Reverse,
    collections::BinaryHeap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use ash::vk;
use parking_lot::Mutex;

use crate::{device::DeviceShared, DeviceError};

pub type FenceEvent = Box<dyn FnOnce() + Send>;

/// How a fence interacts with other processes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SharedHandleMode {
    #[default]
    None,
    /// The fence exports an opaque handle for other processes.
    Export,
    /// The fence is created from a handle exported elsewhere.
    Import(i32),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FenceCreateInfo {
    pub initial_value: u64,
    pub shared: SharedHandleMode,
}

struct QueueItem {
    value: u64,
    event: FenceEvent,
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Eq for QueueItem {}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse so the heap pops the smallest value first.
        Reverse(self.value).cmp(&Reverse(other.value))
    }
}

/// Value-ordered callback queue.
struct WaitQueue {
    items: BinaryHeap<QueueItem>,
}

impl WaitQueue {
    fn new() -> Self {
        Self {
            items: BinaryHeap::new(),
        }
    }

    /// Runs the event inline if the value has already been reached,
    /// otherwise enqueues it.
    fn enqueue_or_run(&mut self, value: u64, last_observed: u64, event: FenceEvent) {
        if value <= last_observed {
            event();
        } else {
            self.items.push(QueueItem { value, event });
        }
    }

    /// Runs all events whose value is not greater than `value`, in
    /// ascending value order.
    fn drain(&mut self, value: u64) {
        while let Some(item) = self.items.peek() {
            if item.value > value {
                break;
            }

            let item = self.items.pop().unwrap();
            (item.event)();
        }
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

struct FenceState {
    queue: WaitQueue,
    stop: bool,
}

struct FenceShared {
    device: Arc<DeviceShared>,
    semaphore: vk::Semaphore,
    last_value: AtomicU64,
    state: Mutex<FenceState>,
}

impl FenceShared {
    fn run(&self) {
        loop {
            let mut state = self.state.lock();

            // Query the actual semaphore value and start from there so
            // large increments are skipped in one iteration.
            let value = match unsafe {
                self.device.raw.get_semaphore_counter_value(self.semaphore)
            } {
                Ok(value) => value,
                Err(vr) => {
                    log::error!("Failed to query semaphore value: {vr:?}");
                    return;
                }
            };

            self.last_value.store(value, Ordering::Release);

            state.queue.drain(value);

            if state.stop {
                return;
            }

            drop(state);

            // Wait for the semaphore to advance. The timeout is
            // unfortunate, but a signal-then-enqueue sequence cannot
            // wake the worker otherwise without a sentinel semaphore.
            let next = value + 1;

            let semaphores = [self.semaphore];
            let values = [next];

            let wait_info = vk::SemaphoreWaitInfo::builder()
                .semaphores(&semaphores)
                .values(&values);

            let result = unsafe { self.device.raw.wait_semaphores(&wait_info, 10_000_000) };

            if let Err(vr) = result {
                if vr != vk::Result::TIMEOUT {
                    log::error!("Failed to wait for semaphore: {vr:?}");
                    return;
                }
            }
        }
    }
}

/// Timeline semaphore with per-value callbacks.
pub struct Fence {
    shared: Arc<FenceShared>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Fence {
    pub fn new(device: Arc<DeviceShared>, info: &FenceCreateInfo) -> Result<Self, DeviceError> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(info.initial_value);

        let mut export_info = vk::ExportSemaphoreCreateInfo::builder()
            .handle_types(vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_FD);

        let mut semaphore_info = vk::SemaphoreCreateInfo::builder().push_next(&mut type_info);

        if info.shared == SharedHandleMode::Export {
            semaphore_info = semaphore_info.push_next(&mut export_info);
        }

        let semaphore = unsafe { device.raw.create_semaphore(&semaphore_info, None) }?;

        if let SharedHandleMode::Import(fd) = info.shared {
            let import_info = vk::ImportSemaphoreFdInfoKHR::builder()
                .semaphore(semaphore)
                .handle_type(vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_FD)
                .fd(fd);

            if let Some(ext) = &device.external_semaphore_fd {
                unsafe { ext.import_semaphore_fd(&import_info) }?;
            } else {
                unsafe { device.raw.destroy_semaphore(semaphore, None) };
                return Err(DeviceError::ResourceCreation(
                    "external semaphore import is not supported",
                ));
            }
        }

        let shared = Arc::new(FenceShared {
            device,
            semaphore,
            last_value: AtomicU64::new(info.initial_value),
            state: Mutex::new(FenceState {
                queue: WaitQueue::new(),
                stop: false,
            }),
        });

        let worker = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("veneer-fence".into())
                .spawn(move || shared.run())
                .expect("failed to spawn fence worker")
        };

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn handle(&self) -> vk::Semaphore {
        self.shared.semaphore
    }

    /// Retrieves the current semaphore value.
    pub fn value(&self) -> u64 {
        unsafe {
            self.shared
                .device
                .raw
                .get_semaphore_counter_value(self.shared.semaphore)
        }
        .unwrap_or_else(|vr| {
            log::error!("Failed to query semaphore value: {vr:?}");
            self.shared.last_value.load(Ordering::Acquire)
        })
    }

    /// Signals the given event once the semaphore reaches `value`. Runs
    /// the event on the calling thread if the value has been reached.
    pub fn enqueue_wait(&self, value: u64, event: FenceEvent) {
        let mut state = self.shared.state.lock();
        let last = self.shared.last_value.load(Ordering::Acquire);
        state.queue.enqueue_or_run(value, last, event);
    }

    /// Blocks the calling thread until the semaphore reaches `value`.
    pub fn wait(&self, value: u64) -> Result<(), DeviceError> {
        let semaphores = [self.shared.semaphore];
        let values = [value];

        let wait_info = vk::SemaphoreWaitInfo::builder()
            .semaphores(&semaphores)
            .values(&values);

        unsafe { self.shared.device.raw.wait_semaphores(&wait_info, u64::MAX) }?;
        Ok(())
    }

    /// Signals the semaphore from the host.
    pub fn signal(&self, value: u64) -> Result<(), DeviceError> {
        let signal_info = vk::SemaphoreSignalInfo::builder()
            .semaphore(self.shared.semaphore)
            .value(value);

        unsafe { self.shared.device.raw.signal_semaphore(&signal_info) }?;
        Ok(())
    }

    /// Exports an opaque handle for cross-process sharing.
    pub fn shared_handle(&self) -> Result<i32, DeviceError> {
        let ext = self
            .shared
            .device
            .external_semaphore_fd
            .as_ref()
            .ok_or(DeviceError::ResourceCreation(
                "external semaphore export is not supported",
            ))?;

        let info = vk::SemaphoreGetFdInfoKHR::builder()
            .semaphore(self.shared.semaphore)
            .handle_type(vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_FD);

        Ok(unsafe { ext.get_semaphore_fd(&info) }?)
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.stop = true;

            if !state.queue.is_empty() {
                log::warn!("Fence destroyed with pending callbacks");
            }
        }

        if let Some(worker) = self.worker.get_mut().take() {
            let _ = worker.join();
        }

        unsafe {
            self.shared
                .device
                .raw
                .destroy_semaphore(self.shared.semaphore, None)
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter_event(counter: &Arc<AtomicUsize>, order: &Arc<Mutex<Vec<u64>>>, value: u64) -> FenceEvent {
        let counter = Arc::clone(counter);
        let order = Arc::clone(order);
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            order.lock().push(value);
        })
    }

    #[test]
    fn already_signaled_value_runs_inline() {
        let counter = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut queue = WaitQueue::new();
        queue.enqueue_or_run(5, 10, counter_event(&counter, &order, 5));

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn pending_values_run_in_order_exactly_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut queue = WaitQueue::new();

        for value in [30u64, 20, 25] {
            queue.enqueue_or_run(value, 10, counter_event(&counter, &order, value));
        }

        assert_eq!(counter.load(Ordering::SeqCst), 0);

        // Advancing to 25 runs two callbacks in value order.
        queue.drain(25);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(*order.lock(), vec![20, 25]);

        // Draining again at the same value does nothing.
        queue.drain(25);
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        queue.drain(30);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(*order.lock(), vec![20, 25, 30]);
        assert!(queue.is_empty());
    }

    #[test]
    fn undrained_callbacks_are_dropped_without_running() {
        let counter = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut queue = WaitQueue::new();
        queue.enqueue_or_run(30, 10, counter_event(&counter, &order, 30));

        // Dropping the queue, as fence teardown does, must not run the
        // callback.
        drop(queue);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
