//! Device frontend of the core.
//!
//! The device owns the memory allocator, sampler pool, command list
//! recycler, the submission timeline and the submission queue, and
//! exposes the resource-creation and synchronization contract consumed
//! by the client-API layer.
//!
//! The Vulkan instance and device handles are created by the embedder
//! and imported here; the core never destroys them.

use std::{
    sync::Arc,
    time::Instant,
};

use ash::{extensions::khr, vk};
use parking_lot::Mutex;

use crate::{
    buffer::{Buffer, BufferCreateInfo, BufferImportInfo},
    command::{CommandList, CommandListPool, StatCounters},
    fence::{Fence, FenceCreateInfo},
    image::{Image, ImageCreateInfo},
    latency::{
        builtin::BuiltinLatencyTracker, reflex::ReflexLatencyTracker, LatencyTracker,
        LowLatencyPresenter,
    },
    memory::{AllocationStats, MemoryAllocator},
    queue::{LatencyInfo, Presenter, SubmissionQueue, SubmitStatus},
    resource::Resource,
    sampler::{SamplerKey, SamplerPool, SamplerRef},
    sparse::SparseBindSubmission,
    Access, DeviceError, MemoryStats,
};

/// Features relevant to the core, as enabled on the imported device.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceFeatures {
    pub sparse_binding: bool,
    pub memory_priority: bool,
    pub transform_feedback: bool,
    pub buffer_device_address: bool,
    pub memory_budget: bool,
    pub sampler_anisotropy: bool,
    pub custom_border_colors: bool,
    pub external_semaphore_fd: bool,
}

/// Handles and properties of the imported Vulkan device.
pub struct DeviceCreateInfo {
    pub instance: ash::Instance,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub queue: vk::Queue,
    pub queue_family_index: u32,
    pub features: DeviceFeatures,
}

/// Device state shared between the core's subsystems and workers.
pub struct DeviceShared {
    pub raw: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub queue: vk::Queue,
    pub queue_family_index: u32,

    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub properties: vk::PhysicalDeviceProperties,
    pub features: DeviceFeatures,

    /// Guards access to the device queue. Independent of the submission
    /// queue's own serialization; can be leased to external code.
    pub queue_lock: Mutex<()>,

    pub external_semaphore_fd: Option<khr::ExternalSemaphoreFd>,
}

/// Latency tracker selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LatencyControl {
    /// Use the native low-latency API when the presenter exposes one.
    #[default]
    Auto,
    /// Always use the built-in tracker.
    Builtin,
    Disabled,
}

/// The core device.
///
/// Field order doubles as teardown order: the submission queue drains
/// and joins before the timeline fence and command pool go away, and
/// the allocator is dropped after everything that allocates from it.
pub struct Device {
    submission_queue: SubmissionQueue,
    timeline: Arc<Fence>,
    cmd_pool: Arc<CommandListPool>,
    sampler_pool: SamplerPool,
    memory: MemoryAllocator,
    shader_cache: Arc<prism::cache::ShaderCache>,

    stats: Mutex<StatCounters>,
    module_detach: std::sync::atomic::AtomicBool,
    shared: Arc<DeviceShared>,
}

impl Device {
    pub fn new(info: DeviceCreateInfo) -> Result<Self, DeviceError> {
        let memory_properties = unsafe {
            info.instance
                .get_physical_device_memory_properties(info.physical_device)
        };
        let properties = unsafe {
            info.instance
                .get_physical_device_properties(info.physical_device)
        };

        let external_semaphore_fd = info
            .features
            .external_semaphore_fd
            .then(|| khr::ExternalSemaphoreFd::new(&info.instance, &info.device));

        let shared = Arc::new(DeviceShared {
            raw: info.device,
            physical_device: info.physical_device,
            queue: info.queue,
            queue_family_index: info.queue_family_index,
            memory_properties,
            properties,
            features: info.features,
            queue_lock: Mutex::new(()),
            external_semaphore_fd,
        });

        let memory = MemoryAllocator::new(Arc::clone(&shared));
        let sampler_pool = SamplerPool::new(Arc::clone(&shared));
        let cmd_pool = CommandListPool::new(Arc::clone(&shared));

        let timeline = Arc::new(Fence::new(
            Arc::clone(&shared),
            &FenceCreateInfo::default(),
        )?);

        let submission_queue = SubmissionQueue::new(
            Arc::clone(&shared),
            Arc::clone(&timeline),
            Arc::clone(&cmd_pool),
        );

        Ok(Self {
            submission_queue,
            timeline,
            cmd_pool,
            sampler_pool,
            memory,
            shader_cache: prism::cache::ShaderCache::instance(),
            stats: Mutex::new(StatCounters::default()),
            module_detach: std::sync::atomic::AtomicBool::new(false),
            shared,
        })
    }

    /// Marks the process as tearing down the module. Worker threads may
    /// already have been killed by the OS at this point, so shutdown
    /// skips queue synchronization and only waits for device idle.
    pub fn notify_module_detach(&self) {
        self.module_detach
            .store(true, std::sync::atomic::Ordering::Release);
    }

    pub fn shared(&self) -> &Arc<DeviceShared> {
        &self.shared
    }

    pub fn allocator(&self) -> &MemoryAllocator {
        &self.memory
    }

    // Resource creation.

    pub fn create_buffer(
        &self,
        info: BufferCreateInfo,
        memory_properties: vk::MemoryPropertyFlags,
    ) -> Result<crate::resource::Ref<Buffer>, DeviceError> {
        Buffer::new(&self.memory, info, memory_properties)
    }

    pub fn import_buffer(
        &self,
        info: BufferCreateInfo,
        import: BufferImportInfo,
    ) -> Result<crate::resource::Ref<Buffer>, DeviceError> {
        Buffer::new_imported(&self.memory, info, import)
    }

    pub fn create_image(
        &self,
        info: ImageCreateInfo,
        memory_properties: vk::MemoryPropertyFlags,
    ) -> Result<crate::resource::Ref<Image>, DeviceError> {
        Image::new(&self.memory, info, memory_properties)
    }

    pub fn import_image(
        &self,
        info: ImageCreateInfo,
        native: vk::Image,
    ) -> Result<crate::resource::Ref<Image>, DeviceError> {
        Image::new_imported(&self.memory, info, native)
    }

    pub fn create_sampler(&self, key: &SamplerKey) -> Option<SamplerRef> {
        self.sampler_pool.create_sampler(key)
    }

    pub fn create_fence(&self, info: &FenceCreateInfo) -> Result<Fence, DeviceError> {
        Fence::new(Arc::clone(&self.shared), info)
    }

    pub fn create_command_list(&self) -> Result<CommandList, DeviceError> {
        self.cmd_pool.create_command_list()
    }

    /// Creates a latency tracker for the given presenter.
    pub fn create_latency_tracker(
        &self,
        presenter: Option<Arc<dyn LowLatencyPresenter>>,
        control: LatencyControl,
        tolerance_us: u32,
    ) -> Option<Arc<dyn LatencyTracker>> {
        match control {
            LatencyControl::Disabled => None,
            LatencyControl::Auto => match presenter {
                Some(presenter) if presenter.supports_low_latency() => {
                    Some(Arc::new(ReflexLatencyTracker::new(presenter)))
                }
                _ => None,
            },
            LatencyControl::Builtin => Some(Arc::new(BuiltinLatencyTracker::new(tolerance_us))),
        }
    }

    // Shader cache.

    pub fn lookup_shader(
        &self,
        name: &str,
        info: &prism::ShaderCreateInfo,
    ) -> Option<Arc<prism::IrShader>> {
        self.shader_cache.lookup(name, info)
    }

    pub fn register_shader(&self, shader: Arc<prism::IrShader>) {
        self.shader_cache.add(shader);
    }

    // Submission.

    pub fn submit_command_list(
        &self,
        cmd_list: CommandList,
        latency: Option<LatencyInfo>,
        status: Arc<SubmitStatus>,
    ) {
        {
            let mut stats = self.stats.lock();
            stats.merge(cmd_list.stats());
            stats.queue_submit_count += 1;
        }

        self.submission_queue.submit(cmd_list, latency, status);
    }

    pub fn present_image(
        &self,
        presenter: Arc<dyn Presenter>,
        latency: Option<LatencyInfo>,
        frame_id: u64,
        status: Arc<SubmitStatus>,
    ) {
        self.stats.lock().queue_present_count += 1;

        self.submission_queue
            .present(presenter, frame_id, latency, status);
    }

    /// Submits accumulated sparse binds, synchronized against the
    /// submission timeline.
    pub fn submit_sparse_binds(
        &self,
        binds: &mut SparseBindSubmission,
    ) -> Result<(), vk::Result> {
        let last = self.submission_queue.last_submission_id();
        let signal = self.submission_queue.allocate_submission_id();

        binds.wait_semaphore(self.timeline.handle(), last);
        binds.signal_semaphore(self.timeline.handle(), signal);

        let _queue_guard = self.submission_queue.lock_device_queue();
        binds.submit(&self.shared, self.shared.queue)
    }

    // Synchronization.

    pub fn wait_for_submission(&self, status: &SubmitStatus) -> vk::Result {
        let result = status.result();

        if result == vk::Result::NOT_READY {
            self.submission_queue.synchronize_submission(status);
            return status.result();
        }

        result
    }

    pub fn wait_for_fence(&self, fence: &Fence, value: u64) -> Result<(), DeviceError> {
        if fence.value() >= value {
            return Ok(());
        }

        let t0 = Instant::now();
        let result = fence.wait(value);

        let mut stats = self.stats.lock();
        stats.gpu_sync_count += 1;
        stats.gpu_sync_ticks += t0.elapsed().as_micros() as u64;

        result
    }

    /// Blocks until no submission uses the resource with the given
    /// access type.
    pub fn wait_for_resource<T: Resource>(&self, resource: &T, access: Access) {
        if !resource.use_count().is_in_use(access) {
            return;
        }

        let t0 = Instant::now();

        self.submission_queue
            .synchronize_until(|| !resource.use_count().is_in_use(access));

        let mut stats = self.stats.lock();
        stats.gpu_sync_count += 1;
        stats.gpu_sync_ticks += t0.elapsed().as_micros() as u64;
    }

    /// Drains the submission queue, then waits for the device to go
    /// idle while holding the queue lock.
    pub fn wait_for_idle(&self) {
        self.submission_queue.wait_for_idle();

        let _queue_guard = self.submission_queue.lock_device_queue();

        if unsafe { self.shared.raw.device_wait_idle() }.is_err() {
            log::error!("wait_for_idle: operation failed");
        }
    }

    // Statistics.

    pub fn memory_stats(&self, heap: u32) -> MemoryStats {
        self.memory.memory_stats(heap)
    }

    pub fn allocation_stats(&self, stats: &mut AllocationStats) {
        self.memory.allocation_stats(stats)
    }

    pub fn stat_counters(&self) -> StatCounters {
        *self.stats.lock()
    }

    // Built-in pipelines for meta operations (clears, resolves, mip
    // generation).

    pub fn create_builtin_compute_pipeline(
        &self,
        layout: vk::PipelineLayout,
        stage: vk::PipelineShaderStageCreateInfo,
    ) -> Result<vk::Pipeline, DeviceError> {
        let info = vk::ComputePipelineCreateInfo::builder()
            .stage(stage)
            .layout(layout)
            .build();

        let result = unsafe {
            self.shared
                .raw
                .create_compute_pipelines(vk::PipelineCache::null(), &[info], None)
        };

        match result {
            Ok(pipelines) => Ok(pipelines[0]),
            Err((_, vr)) => {
                log::error!("Failed to create built-in compute pipeline: {vr:?}");
                Err(vr.into())
            }
        }
    }

    pub fn create_builtin_graphics_pipeline(
        &self,
        layout: vk::PipelineLayout,
        state: &BuiltinGraphicsPipelineState,
    ) -> Result<vk::Pipeline, DeviceError> {
        let mut rendering_info = vk::PipelineRenderingCreateInfo::builder()
            .color_attachment_formats(&state.color_formats)
            .depth_attachment_format(state.depth_format)
            .stencil_attachment_format(state.stencil_format);

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder();

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST);

        let viewport = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization = vk::PipelineRasterizationStateCreateInfo::builder()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(vk::CullModeFlags::NONE)
            .line_width(1.0);

        let multisample = vk::PipelineMultisampleStateCreateInfo::builder()
            .rasterization_samples(state.sample_count);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(state.depth_write)
            .depth_write_enable(state.depth_write)
            .depth_compare_op(vk::CompareOp::ALWAYS);

        let blend_attachments = vec![
            vk::PipelineColorBlendAttachmentState::builder()
                .color_write_mask(vk::ColorComponentFlags::RGBA)
                .build();
            state.color_formats.len()
        ];

        let color_blend =
            vk::PipelineColorBlendStateCreateInfo::builder().attachments(&blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic = vk::PipelineDynamicStateCreateInfo::builder()
            .dynamic_states(&dynamic_states);

        let info = vk::GraphicsPipelineCreateInfo::builder()
            .push_next(&mut rendering_info)
            .stages(&state.stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic)
            .layout(layout);

        let result = unsafe {
            self.shared.raw.create_graphics_pipelines(
                vk::PipelineCache::null(),
                &[*info],
                None,
            )
        };

        match result {
            Ok(pipelines) => Ok(pipelines[0]),
            Err((_, vr)) => {
                log::error!("Failed to create built-in graphics pipeline: {vr:?}");
                Err(vr.into())
            }
        }
    }
}

/// State for built-in graphics pipelines; these always use dynamic
/// rendering with dynamic viewport and scissor.
#[derive(Clone, Debug, Default)]
pub struct BuiltinGraphicsPipelineState {
    pub stages: Vec<vk::PipelineShaderStageCreateInfo>,
    pub color_formats: Vec<vk::Format>,
    pub depth_format: vk::Format,
    pub stencil_format: vk::Format,
    pub sample_count: vk::SampleCountFlags,
    pub depth_write: bool,
}

impl Drop for Device {
    fn drop(&mut self) {
        if self.module_detach.load(std::sync::atomic::Ordering::Acquire) {
            let _ = unsafe { self.shared.raw.device_wait_idle() };
            return;
        }

        // Finish all outstanding GPU work before tearing down workers.
        self.wait_for_idle();
    }
}
