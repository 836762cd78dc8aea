//! Recyclable command lists.
//!
//! A command list owns a Vulkan command pool with one primary command
//! buffer, a set of tracked resources with their access modes, and a
//! stat delta for the submission. Once the submission's fence signals,
//! the list releases its tracked resources and returns to a device-wide
//! recycle pool.

use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::{
    buffer::Buffer,
    device::DeviceShared,
    image::Image,
    memory::ResourceAllocation,
    resource::{Ref, TrackedRef},
    sampler::SamplerRef,
    sparse::SparseMapping,
    Access, DeviceError,
};

/// Per-submission statistics merged into the device counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct StatCounters {
    pub cmd_draw_count: u64,
    pub cmd_dispatch_count: u64,
    pub cmd_render_pass_count: u64,
    pub cmd_barrier_count: u64,
    pub queue_submit_count: u64,
    pub queue_present_count: u64,
    pub gpu_sync_count: u64,
    pub gpu_sync_ticks: u64,
}

impl StatCounters {
    pub fn merge(&mut self, other: &StatCounters) {
        self.cmd_draw_count += other.cmd_draw_count;
        self.cmd_dispatch_count += other.cmd_dispatch_count;
        self.cmd_render_pass_count += other.cmd_render_pass_count;
        self.cmd_barrier_count += other.cmd_barrier_count;
        self.queue_submit_count += other.queue_submit_count;
        self.queue_present_count += other.queue_present_count;
        self.gpu_sync_count += other.gpu_sync_count;
        self.gpu_sync_ticks += other.gpu_sync_ticks;
    }
}

/// A resource kept alive by a command list until its submission has
/// completed on the GPU.
pub enum TrackedObject {
    Buffer(TrackedRef<Buffer>),
    Image(TrackedRef<Image>),
    Allocation(TrackedRef<ResourceAllocation>),
    Sampler(SamplerRef),
    Mapping(SparseMapping),
}

/// A recyclable command buffer.
pub struct CommandList {
    device: Arc<DeviceShared>,

    pool: vk::CommandPool,
    buffer: vk::CommandBuffer,

    stats: StatCounters,
    resources: SmallVec<[TrackedObject; 8]>,
}

impl CommandList {
    pub fn new(device: Arc<DeviceShared>) -> Result<Self, DeviceError> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(device.queue_family_index);

        let pool = unsafe { device.raw.create_command_pool(&pool_info, None) }?;

        let buffer_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffer = match unsafe { device.raw.allocate_command_buffers(&buffer_info) } {
            Ok(buffers) => buffers[0],
            Err(vr) => {
                unsafe { device.raw.destroy_command_pool(pool, None) };
                return Err(vr.into());
            }
        };

        Ok(Self {
            device,
            pool,
            buffer,
            stats: StatCounters::default(),
            resources: SmallVec::new(),
        })
    }

    pub fn handle(&self) -> vk::CommandBuffer {
        self.buffer
    }

    pub fn begin_recording(&mut self) -> Result<(), DeviceError> {
        let info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe { self.device.raw.begin_command_buffer(self.buffer, &info) }?;
        Ok(())
    }

    pub fn end_recording(&mut self) -> Result<(), DeviceError> {
        unsafe { self.device.raw.end_command_buffer(self.buffer) }?;
        Ok(())
    }

    /// Keeps a buffer alive and marks the given access as pending until
    /// the submission completes.
    pub fn track_buffer(&mut self, buffer: &Ref<Buffer>, access: Access) {
        self.resources
            .push(TrackedObject::Buffer(buffer.clone_for_access(access)));
    }

    pub fn track_image(&mut self, image: &Ref<Image>, access: Access) {
        self.resources
            .push(TrackedObject::Image(image.clone_for_access(access)));
    }

    pub fn track_allocation(&mut self, allocation: &Ref<ResourceAllocation>, access: Access) {
        self.resources
            .push(TrackedObject::Allocation(allocation.clone_for_access(access)));
    }

    pub fn track_sampler(&mut self, sampler: &SamplerRef) {
        self.resources.push(TrackedObject::Sampler(sampler.clone()));
    }

    /// Keeps a sparse page mapping alive, e.g. the previous mapping of
    /// an updated page table entry.
    pub fn track_mapping(&mut self, mapping: SparseMapping) {
        self.resources.push(TrackedObject::Mapping(mapping));
    }

    pub fn stats(&self) -> &StatCounters {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut StatCounters {
        &mut self.stats
    }

    /// Releases tracked resources and resets the command pool so the
    /// list can be reused. Must only be called once the submission has
    /// completed on the GPU.
    pub fn reset(&mut self) {
        for resource in self.resources.drain(..) {
            match resource {
                TrackedObject::Buffer(tracked) => tracked.release(),
                TrackedObject::Image(tracked) => tracked.release(),
                TrackedObject::Allocation(tracked) => tracked.release(),
                TrackedObject::Sampler(sampler) => drop(sampler),
                TrackedObject::Mapping(mapping) => drop(mapping),
            }
        }

        self.stats = StatCounters::default();

        unsafe {
            if let Err(vr) = self
                .device
                .raw
                .reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())
            {
                log::error!("Failed to reset command pool: {vr:?}");
            }
        }
    }
}

impl Drop for CommandList {
    fn drop(&mut self) {
        self.reset();
        unsafe { self.device.raw.destroy_command_pool(self.pool, None) };
    }
}

/// Device-wide recycle pool for command lists.
pub struct CommandListPool {
    device: Arc<DeviceShared>,
    lists: Mutex<Vec<CommandList>>,
}

impl CommandListPool {
    pub fn new(device: Arc<DeviceShared>) -> Arc<Self> {
        Arc::new(Self {
            device,
            lists: Mutex::new(Vec::new()),
        })
    }

    /// Retrieves a recycled command list, or creates a new one.
    pub fn create_command_list(&self) -> Result<CommandList, DeviceError> {
        if let Some(list) = self.lists.lock().pop() {
            return Ok(list);
        }

        CommandList::new(Arc::clone(&self.device))
    }

    /// Returns a finished command list to the pool.
    pub fn recycle(&self, mut list: CommandList) {
        list.reset();
        self.lists.lock().push(list);
    }
}
