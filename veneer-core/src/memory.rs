//! Device memory allocator.
//!
//! Memory is suballocated from chunks owned by per-memory-type pools.
//! Each memory type has a device pool and a mapped pool so that address
//! space is only consumed for mappings when host access is actually
//! requested. Chunks grow geometrically as the application allocates
//! more memory, and a worker thread trims unused chunks in the
//! background.
//!
//! Memory types that support it carry a *global buffer* covering each
//! chunk; plain buffer resources are then suballocated from that buffer
//! without creating a new Vulkan buffer at all.

use std::{
    mem::MaybeUninit,
    ptr::NonNull,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use ash::vk;
use parking_lot::{Condvar, Mutex};

use crate::{
    alloc::{
        PageAllocator, PoolAllocator, CHUNK_ADDRESS_BITS, CHUNK_ADDRESS_MASK,
        DEDICATED_CHUNK_ADDRESS, MAX_CHUNK_SIZE, PAGE_SIZE, POOL_MAX_SIZE,
    },
    device::DeviceShared,
    resource::{new_cookie, Ref, Resource, UseCount},
    sparse::SparsePageTable,
    FastHashMap, MemoryStats,
};

pub const VK_MAX_MEMORY_TYPES: usize = 32;
pub const VK_MAX_MEMORY_HEAPS: usize = 16;

/// All buffers suballocated from global buffers share this alignment,
/// which satisfies every buffer use case we have.
const GLOBAL_BUFFER_ALIGNMENT: u64 = 256;

const MIN_CHUNK_SIZE: u64 = MAX_CHUNK_SIZE / 64;

/// Time after which an unused chunk is returned to the system.
const UNUSED_CHUNK_TIMEOUT: Duration = Duration::from_secs(20);

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct AllocationFlags: u32 {
        const OWNS_MEMORY = 1 << 0;
        const OWNS_BUFFER = 1 << 1;
        const OWNS_IMAGE = 1 << 2;
        /// Allocation was imported and owns nothing.
        const IMPORTED = 1 << 3;
    }
}

/// One Vulkan memory object, plus the global buffer over it if the
/// memory type supports one.
#[derive(Clone, Copy, Debug)]
pub struct DeviceMemory {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: u64,
    pub map_ptr: *mut u8,
    pub gpu_va: u64,
}

unsafe impl Send for DeviceMemory {}
unsafe impl Sync for DeviceMemory {}

impl Default for DeviceMemory {
    fn default() -> Self {
        Self {
            buffer: vk::Buffer::null(),
            memory: vk::DeviceMemory::null(),
            size: 0,
            map_ptr: std::ptr::null_mut(),
            gpu_va: 0,
        }
    }
}

#[derive(Default)]
struct MemoryChunk {
    memory: DeviceMemory,
    /// Time when the chunk was found unused. Reset when allocating.
    unused_since: Option<Instant>,
}

/// A memory pool over one memory type: a list of chunks plus page and
/// pool allocators covering them.
struct MemoryPool {
    chunks: Vec<MemoryChunk>,
    pages: PageAllocator,
    pool: PoolAllocator,
    /// Desired size of the next chunk. Always a power of two.
    next_chunk_size: u64,
    /// Hard upper limit for chunks in this pool.
    max_chunk_size: u64,
}

impl MemoryPool {
    fn new(max_chunk_size: u64) -> Self {
        Self {
            chunks: Vec::new(),
            pages: PageAllocator::new(),
            pool: PoolAllocator::new(),
            next_chunk_size: MIN_CHUNK_SIZE.min(max_chunk_size),
            max_chunk_size,
        }
    }

    fn alloc(&mut self, size: u64, align: u64) -> Option<u64> {
        if size <= POOL_MAX_SIZE && align <= POOL_MAX_SIZE {
            self.pool.alloc(&mut self.pages, size, align)
        } else {
            self.pages.alloc(size, align)
        }
    }

    /// Returns `true` if the owning chunk became empty.
    fn free(&mut self, address: u64, size: u64, align: u64) -> bool {
        if size <= POOL_MAX_SIZE && align <= POOL_MAX_SIZE {
            self.pool.free(&mut self.pages, address, size, align)
        } else {
            self.pages.free(address, size)
        }
    }
}

struct MemoryHeap {
    index: u32,
    memory_types: u32,
    properties: vk::MemoryHeap,
}

struct MemoryType {
    index: u32,
    properties: vk::MemoryType,
    stats: MemoryStats,
    /// Usage flags for global buffers on this type; empty if global
    /// buffers are unsupported here.
    buffer_usage: vk::BufferUsageFlags,
    device_pool: MemoryPool,
    mapped_pool: MemoryPool,
}

/// Detailed allocation statistics.
#[derive(Clone, Debug, Default)]
pub struct MemoryTypeStats {
    pub properties: vk::MemoryType,
    pub allocated: u64,
    pub used: u64,
    pub chunk_index: usize,
    pub chunk_count: usize,
}

#[derive(Clone, Debug, Default)]
pub struct MemoryChunkStats {
    pub capacity: u64,
    pub used: u64,
    pub page_mask_offset: u32,
    pub page_count: u16,
    pub mapped: bool,
}

#[derive(Clone, Debug, Default)]
pub struct AllocationStats {
    pub memory_types: Vec<MemoryTypeStats>,
    pub chunks: Vec<MemoryChunkStats>,
    pub page_masks: Vec<u32>,
}

/// Extended memory requirements passed into [`MemoryAllocator::alloc`].
#[derive(Clone, Copy, Debug)]
pub struct MemoryRequirementInfo {
    pub tiling: vk::ImageTiling,
    pub prefers_dedicated: bool,
    pub requires_dedicated: bool,
    pub size: u64,
    pub alignment: u64,
    pub memory_type_bits: u32,
}

impl Default for MemoryRequirementInfo {
    fn default() -> Self {
        Self {
            tiling: vk::ImageTiling::LINEAR,
            prefers_dedicated: false,
            requires_dedicated: false,
            size: 0,
            alignment: 1,
            memory_type_bits: !0,
        }
    }
}

/// Dedicated-allocation parameters.
#[derive(Clone, Copy, Debug, Default)]
pub struct DedicatedInfo {
    pub buffer: vk::Buffer,
    pub image: vk::Image,
}

/// Buffer properties of an allocation.
#[derive(Clone, Copy, Debug)]
pub struct ResourceBufferInfo {
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub size: u64,
    pub map_ptr: *mut u8,
    pub gpu_address: u64,
}

/// Image properties of an allocation.
#[derive(Clone, Copy, Debug)]
pub struct ResourceImageInfo {
    pub image: vk::Image,
    pub map_ptr: *mut u8,
}

/// Backing memory of an allocation, used for sparse binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourceMemoryInfo {
    pub memory: vk::DeviceMemory,
    pub offset: u64,
    pub size: u64,
}

/// Buffer view properties.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct BufferViewKey {
    pub format: vk::Format,
    pub usage: vk::BufferUsageFlags,
    pub offset: u64,
    pub size: u64,
}

/// Compressed image view properties.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImageViewKey {
    pub view_type: vk::ImageViewType,
    pub usage: vk::ImageUsageFlags,
    pub format: vk::Format,
    pub aspects: vk::ImageAspectFlags,
    pub mip_index: u8,
    pub mip_count: u8,
    pub layer_index: u16,
    pub layer_count: u16,
    /// Component swizzle, four bits per component.
    pub packed_swizzle: u16,
}

impl ImageViewKey {
    pub fn pack_swizzle(mapping: vk::ComponentMapping) -> u16 {
        (mapping.r.as_raw() as u16)
            | (mapping.g.as_raw() as u16) << 4
            | (mapping.b.as_raw() as u16) << 8
            | (mapping.a.as_raw() as u16) << 12
    }

    fn unpack_swizzle(&self) -> vk::ComponentMapping {
        vk::ComponentMapping {
            r: vk::ComponentSwizzle::from_raw((self.packed_swizzle & 0xf) as i32),
            g: vk::ComponentSwizzle::from_raw((self.packed_swizzle >> 4 & 0xf) as i32),
            b: vk::ComponentSwizzle::from_raw((self.packed_swizzle >> 8 & 0xf) as i32),
            a: vk::ComponentSwizzle::from_raw((self.packed_swizzle >> 12 & 0xf) as i32),
        }
    }
}

/// A memory range with optional exclusively owned buffer or image, the
/// views created from them, and an optional sparse page table.
///
/// Reference counted with split read/write use counts; freed back into
/// the allocator's object pool when the counter reaches zero.
pub struct ResourceAllocation {
    use_count: UseCount,

    cookie: u64,
    flags: AllocationFlags,
    property_flags: vk::MemoryPropertyFlags,

    memory: vk::DeviceMemory,
    address: u64,
    size: u64,
    align: u64,
    map_ptr: *mut u8,

    buffer: vk::Buffer,
    buffer_offset: u64,
    buffer_address: u64,
    buffer_views: Mutex<FastHashMap<BufferViewKey, vk::BufferView>>,

    image: vk::Image,
    image_views: Mutex<FastHashMap<ImageViewKey, vk::ImageView>>,

    sparse_page_table: Option<Mutex<SparsePageTable>>,

    memory_type: u32,
    /// Which pool of the memory type the address belongs to.
    mapped_pool: bool,

    /// The allocator outlives every allocation: the slab holding this
    /// object is owned by it, and the device keeps it alive until all
    /// resources are destroyed.
    allocator: *const AllocatorShared,
}

unsafe impl Send for ResourceAllocation {}
unsafe impl Sync for ResourceAllocation {}

unsafe impl Resource for ResourceAllocation {
    fn use_count(&self) -> &UseCount {
        &self.use_count
    }

    unsafe fn free(this: NonNull<Self>) {
        let allocator = this.as_ref().allocator;
        (*allocator).free_allocation(this);
    }
}

impl ResourceAllocation {
    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn memory_properties(&self) -> vk::MemoryPropertyFlags {
        self.property_flags
    }

    pub fn buffer_info(&self) -> ResourceBufferInfo {
        ResourceBufferInfo {
            buffer: self.buffer,
            offset: self.buffer_offset,
            size: self.size,
            map_ptr: self.map_ptr,
            gpu_address: self.buffer_address,
        }
    }

    pub fn image_info(&self) -> ResourceImageInfo {
        ResourceImageInfo {
            image: self.image,
            map_ptr: self.map_ptr,
        }
    }

    pub fn memory_info(&self) -> ResourceMemoryInfo {
        ResourceMemoryInfo {
            memory: self.memory,
            offset: self.address & CHUNK_ADDRESS_MASK,
            size: self.size,
        }
    }

    pub fn map_ptr(&self, offset: u64) -> *mut u8 {
        if self.map_ptr.is_null() {
            std::ptr::null_mut()
        } else {
            unsafe { self.map_ptr.add(offset as usize) }
        }
    }

    pub fn sparse_page_table(&self) -> Option<&Mutex<SparsePageTable>> {
        self.sparse_page_table.as_ref()
    }

    fn shared(&self) -> &AllocatorShared {
        unsafe { &*self.allocator }
    }

    /// Creates or retrieves a buffer view with the given properties.
    /// Views remain valid for the lifetime of the allocation.
    pub fn create_buffer_view(&self, key: BufferViewKey) -> Result<vk::BufferView, vk::Result> {
        let mut views = self.buffer_views.lock();

        if let Some(&view) = views.get(&key) {
            return Ok(view);
        }

        let info = vk::BufferViewCreateInfo::builder()
            .buffer(self.buffer)
            .format(key.format)
            .offset(key.offset + self.buffer_offset)
            .range(key.size);

        let device = &self.shared().device;
        let view = unsafe { device.raw.create_buffer_view(&info, None) }.map_err(|vr| {
            log::error!(
                "Failed to create Vulkan buffer view: {vr:?}\n  usage: {:?}\n  format: {:?}\n  offset: {}\n  size: {}",
                key.usage,
                key.format,
                key.offset,
                key.size
            );
            vr
        })?;

        views.insert(key, view);
        Ok(view)
    }

    /// Creates or retrieves an image view with the given properties.
    pub fn create_image_view(&self, key: ImageViewKey) -> Result<vk::ImageView, vk::Result> {
        let mut views = self.image_views.lock();

        if let Some(&view) = views.get(&key) {
            return Ok(view);
        }

        let mut usage = vk::ImageViewUsageCreateInfo::builder().usage(key.usage);

        let info = vk::ImageViewCreateInfo::builder()
            .push_next(&mut usage)
            .image(self.image)
            .view_type(key.view_type)
            .format(key.format)
            .components(key.unpack_swizzle())
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: key.aspects,
                base_mip_level: key.mip_index as u32,
                level_count: key.mip_count as u32,
                base_array_layer: key.layer_index as u32,
                layer_count: key.layer_count as u32,
            });

        let device = &self.shared().device;
        let view = unsafe { device.raw.create_image_view(&info, None) }.map_err(|vr| {
            log::error!("Failed to create Vulkan image view: {vr:?}");
            vr
        })?;

        views.insert(key, view);
        Ok(view)
    }

    /// Destroys owned Vulkan objects. Called with the allocator lock
    /// held, right before the object storage is recycled.
    unsafe fn destroy(&mut self, device: &DeviceShared) {
        for (_, view) in self.buffer_views.get_mut().drain() {
            device.raw.destroy_buffer_view(view, None);
        }

        for (_, view) in self.image_views.get_mut().drain() {
            device.raw.destroy_image_view(view, None);
        }

        if self.flags.contains(AllocationFlags::OWNS_BUFFER) {
            device.raw.destroy_buffer(self.buffer, None);
        }

        if self.flags.contains(AllocationFlags::OWNS_IMAGE) {
            device.raw.destroy_image(self.image, None);
        }

        if self.flags.contains(AllocationFlags::OWNS_MEMORY) {
            device.raw.free_memory(self.memory, None);
        }
    }
}

/// Object pool recycling `ResourceAllocation` storage in fixed blocks.
struct AllocationPool {
    blocks: Vec<Box<[MaybeUninit<ResourceAllocation>]>>,
    free: Vec<*mut ResourceAllocation>,
}

const ALLOCATION_POOL_BLOCK: usize = 1023;

impl AllocationPool {
    fn new() -> Self {
        Self {
            blocks: Vec::new(),
            free: Vec::new(),
        }
    }

    fn alloc(&mut self) -> NonNull<ResourceAllocation> {
        if self.free.is_empty() {
            let mut block: Box<[MaybeUninit<ResourceAllocation>]> = (0..ALLOCATION_POOL_BLOCK)
                .map(|_| MaybeUninit::uninit())
                .collect();

            for slot in block.iter_mut() {
                self.free.push(slot.as_mut_ptr());
            }

            self.blocks.push(block);
        }

        NonNull::new(self.free.pop().unwrap()).unwrap()
    }

    fn recycle(&mut self, ptr: NonNull<ResourceAllocation>) {
        self.free.push(ptr.as_ptr());
    }
}

unsafe impl Send for AllocationPool {}

struct AllocatorState {
    types: Vec<MemoryType>,
    heaps: Vec<MemoryHeap>,
    allocation_pool: AllocationPool,
}

pub(crate) struct AllocatorShared {
    device: Arc<DeviceShared>,
    state: Mutex<AllocatorState>,
    worker_cond: Condvar,
    stop_worker: Mutex<bool>,

    /// LUT mapping required property flags to candidate memory types.
    types_by_property_flags: [u32; 16],
    global_buffer_usage: vk::BufferUsageFlags,
    global_buffer_memory_types: u32,
    sparse_memory_types: u32,
}

unsafe impl Sync for AllocatorShared {}

/// Allocates device memory for resources. Chunks are trimmed by a
/// background worker; allocations are freed automatically when their
/// use count reaches zero.
pub struct MemoryAllocator {
    shared: Arc<AllocatorShared>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl MemoryAllocator {
    pub fn new(device: Arc<DeviceShared>) -> Self {
        let mem_info = device.memory_properties;

        let mut heaps = Vec::with_capacity(mem_info.memory_heap_count as usize);

        for i in 0..mem_info.memory_heap_count {
            heaps.push(MemoryHeap {
                index: i,
                memory_types: 0,
                properties: mem_info.memory_heaps[i as usize],
            });
        }

        let mut types = Vec::with_capacity(mem_info.memory_type_count as usize);

        for i in 0..mem_info.memory_type_count {
            let properties = mem_info.memory_types[i as usize];
            let heap = &mut heaps[properties.heap_index as usize];
            heap.memory_types |= 1 << i;

            let heap_size = heap.properties.size;

            types.push(MemoryType {
                index: i,
                properties,
                stats: MemoryStats::default(),
                buffer_usage: vk::BufferUsageFlags::empty(),
                device_pool: MemoryPool::new(determine_max_chunk_size(heap_size, false)),
                mapped_pool: MemoryPool::new(determine_max_chunk_size(heap_size, true)),
            });
        }

        let types_by_property_flags = determine_types_by_property_flags(&types);

        let mut shared = AllocatorShared {
            device,
            state: Mutex::new(AllocatorState {
                types,
                heaps,
                allocation_pool: AllocationPool::new(),
            }),
            worker_cond: Condvar::new(),
            stop_worker: Mutex::new(false),
            types_by_property_flags,
            global_buffer_usage: vk::BufferUsageFlags::empty(),
            global_buffer_memory_types: 0,
            sparse_memory_types: 0,
        };

        shared.determine_buffer_usage_per_type();

        if shared.device.features.sparse_binding {
            shared.sparse_memory_types = shared.determine_sparse_memory_types();
        }

        let shared = Arc::new(shared);

        let worker = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("veneer-memory".into())
                .spawn(move || shared.run_worker())
                .expect("failed to spawn memory worker")
        };

        Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<AllocatorShared> {
        &self.shared
    }

    /// Memory type mask for sparse resources.
    pub fn sparse_memory_types(&self) -> u32 {
        self.shared.sparse_memory_types
    }

    /// Allocates memory for a regular resource, with dedicated-allocation
    /// handling and a device-local fallback. Logs a memory report on
    /// definitive failure.
    pub fn alloc(
        &self,
        mut req: MemoryRequirementInfo,
        properties: vk::MemoryPropertyFlags,
        dedicated: DedicatedInfo,
    ) -> Option<Ref<ResourceAllocation>> {
        // Keep tiled images out of buffer pages.
        if req.tiling == vk::ImageTiling::OPTIMAL {
            req.alignment = req
                .alignment
                .max(self.shared.device.properties.limits.buffer_image_granularity);
        }

        if dedicated.buffer != vk::Buffer::null() || dedicated.image != vk::Image::null() {
            if let Some(allocation) = self.shared.alloc_dedicated(&req, properties, dedicated) {
                return Some(allocation);
            }

            if req.requires_dedicated {
                let fallback = properties & !vk::MemoryPropertyFlags::DEVICE_LOCAL;

                let allocation = (fallback != properties)
                    .then(|| self.shared.alloc_dedicated(&req, fallback, dedicated))
                    .flatten();

                if allocation.is_none() {
                    self.shared.log_memory_error(&req);
                    self.shared.log_memory_stats();
                }

                return allocation;
            }
        }

        let allocation = self.shared.alloc_memory(&req, properties).or_else(|| {
            let fallback = properties & !vk::MemoryPropertyFlags::DEVICE_LOCAL;
            (fallback != properties)
                .then(|| self.shared.alloc_memory(&req, fallback))
                .flatten()
        });

        if allocation.is_none() {
            self.shared.log_memory_error(&req);
            self.shared.log_memory_stats();
        }

        allocation
    }

    /// Suballocates from an existing chunk, growing the pool if needed.
    pub fn alloc_memory(
        &self,
        req: &MemoryRequirementInfo,
        properties: vk::MemoryPropertyFlags,
    ) -> Option<Ref<ResourceAllocation>> {
        self.shared.alloc_memory(req, properties)
    }

    /// Creates one device-memory object, without suballocation.
    pub fn alloc_dedicated(
        &self,
        req: &MemoryRequirementInfo,
        properties: vk::MemoryPropertyFlags,
        dedicated: DedicatedInfo,
    ) -> Option<Ref<ResourceAllocation>> {
        self.shared.alloc_dedicated(req, properties, dedicated)
    }

    /// Creates a buffer resource, preferring suballocation from a
    /// global buffer over creating a new Vulkan buffer.
    pub fn create_buffer_resource(
        &self,
        create_info: &vk::BufferCreateInfo,
        properties: vk::MemoryPropertyFlags,
    ) -> Option<Ref<ResourceAllocation>> {
        self.shared.create_buffer_resource(create_info, properties)
    }

    /// Creates an image resource, honoring dedicated-allocation
    /// preferences reported by the driver.
    pub fn create_image_resource(
        &self,
        create_info: &vk::ImageCreateInfo,
        properties: vk::MemoryPropertyFlags,
    ) -> Option<Ref<ResourceAllocation>> {
        self.shared.create_image_resource(create_info, properties)
    }

    /// Wraps an externally created buffer in an allocation that owns
    /// nothing; used for resource imports.
    pub fn import_buffer_resource(
        &self,
        buffer: vk::Buffer,
        offset: u64,
        size: u64,
        map_ptr: *mut u8,
    ) -> Option<Ref<ResourceAllocation>> {
        let allocation = self.shared.create_placeholder_allocation()?;

        unsafe {
            let ptr = allocation.as_ptr() as *mut ResourceAllocation;
            (*ptr).flags |= AllocationFlags::IMPORTED;
            (*ptr).buffer = buffer;
            (*ptr).buffer_offset = offset;
            (*ptr).size = size;
            (*ptr).map_ptr = map_ptr;
        }

        Some(allocation)
    }

    /// Wraps an externally created image, e.g. a swap chain image.
    pub fn import_image_resource(&self, image: vk::Image) -> Option<Ref<ResourceAllocation>> {
        let allocation = self.shared.create_placeholder_allocation()?;

        unsafe {
            let ptr = allocation.as_ptr() as *mut ResourceAllocation;
            (*ptr).flags |= AllocationFlags::IMPORTED;
            (*ptr).image = image;
        }

        Some(allocation)
    }

    /// Allocates one 64k page for sparse binding.
    pub fn create_sparse_page(&self) -> Option<Ref<ResourceAllocation>> {
        let req = MemoryRequirementInfo {
            size: PAGE_SIZE,
            alignment: PAGE_SIZE,
            memory_type_bits: self.shared.sparse_memory_types,
            ..Default::default()
        };

        self.shared
            .alloc_memory(&req, vk::MemoryPropertyFlags::DEVICE_LOCAL)
    }

    /// Total allocated and used memory for a heap.
    pub fn memory_stats(&self, heap: u32) -> MemoryStats {
        let state = self.shared.state.lock();
        AllocatorShared::heap_stats(&state, heap)
    }

    /// Detailed statistics for each memory type and chunk.
    pub fn allocation_stats(&self, stats: &mut AllocationStats) {
        self.shared.allocation_stats(stats)
    }

    /// Queries memory requirements for a buffer create info without
    /// keeping a buffer object around.
    pub fn buffer_memory_requirements(
        &self,
        create_info: &vk::BufferCreateInfo,
    ) -> Option<vk::MemoryRequirements> {
        self.shared.probe_buffer_requirements(create_info)
    }

    /// Queries memory requirements for an image create info.
    pub fn image_memory_requirements(
        &self,
        create_info: &vk::ImageCreateInfo,
    ) -> Option<vk::MemoryRequirements> {
        self.shared.probe_image_requirements(create_info)
    }
}

impl Drop for MemoryAllocator {
    fn drop(&mut self) {
        {
            let mut stop = self.shared.stop_worker.lock();
            *stop = true;
            self.shared.worker_cond.notify_one();
        }

        if let Some(worker) = self.worker.get_mut().take() {
            let _ = worker.join();
        }

        // Drain all remaining chunks.
        let mut state = self.shared.state.lock();
        let heap_count = state.heaps.len() as u32;

        for heap in 0..heap_count {
            self.shared
                .free_empty_chunks_in_heap(&mut state, heap, u64::MAX, None);
        }
    }
}

impl AllocatorShared {
    fn memory_type_mask(&self, properties: vk::MemoryPropertyFlags) -> u32 {
        self.types_by_property_flags[properties.as_raw() as usize % 16]
    }

    fn alloc_memory(
        &self,
        req: &MemoryRequirementInfo,
        properties: vk::MemoryPropertyFlags,
    ) -> Option<Ref<ResourceAllocation>> {
        profiling::scope!("alloc_memory");

        let mut state = self.state.lock();
        let state = &mut *state;

        // Ensure the allocation size is also aligned.
        let align = req.alignment.max(GLOBAL_BUFFER_ALIGNMENT);
        let size = crate::align_u64(req.size.max(1), align);

        let mut type_mask = req.memory_type_bits & self.memory_type_mask(properties);

        while type_mask != 0 {
            let type_index = type_mask.trailing_zeros();
            type_mask &= type_mask - 1;

            let mapped = properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE);

            // Always try to suballocate first, even if the allocation is
            // very large. We will decide what to do if this fails.
            let ty = &mut state.types[type_index as usize];
            let pool = if mapped {
                &mut ty.mapped_pool
            } else {
                &mut ty.device_pool
            };

            if let Some(address) = pool.alloc(size, align) {
                return Some(self.create_allocation(state, type_index, mapped, address, size, align));
            }

            // If the memory type is host-visible, try to move an empty
            // chunk over from the opposite pool of the same type.
            if ty
                .properties
                .property_flags
                .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
                && self.move_empty_chunk(ty, mapped, size, properties)
            {
                let pool = if mapped {
                    &mut ty.mapped_pool
                } else {
                    &mut ty.device_pool
                };

                if let Some(address) = pool.alloc(size, align) {
                    return Some(
                        self.create_allocation(state, type_index, mapped, address, size, align),
                    );
                }
            }

            // Large allocations get a dedicated memory object rather than
            // a new chunk, to keep fragmentation in check.
            let ty = &mut state.types[type_index as usize];
            let pool_max = if mapped {
                ty.mapped_pool.max_chunk_size
            } else {
                ty.device_pool.max_chunk_size
            };

            let mut min_resources_per_chunk = if mapped { 1 } else { 4u64 };

            if min_resources_per_chunk == 1
                && size > pool_max / 2
                && ty.stats.allocated - ty.stats.used + pool_max - size >= pool_max
            {
                min_resources_per_chunk = 2;
            }

            if size * min_resources_per_chunk > pool_max {
                if let Some(mut memory) =
                    self.allocate_device_memory(state, type_index, size, false)
                {
                    self.map_device_memory(&mut memory, properties);
                    return Some(self.create_dedicated_allocation(state, type_index, memory));
                }
                continue;
            }

            // Grow the pool by a chunk large enough for several resources
            // of the size we are allocating.
            let desired = desired_chunk_size(
                state.types[type_index as usize].chunk_size(mapped),
                size,
                min_resources_per_chunk,
            );

            if self.allocate_chunk_in_pool(state, type_index, mapped, properties, size, desired) {
                let ty = &mut state.types[type_index as usize];
                let pool = if mapped {
                    &mut ty.mapped_pool
                } else {
                    &mut ty.device_pool
                };

                let address = pool.alloc(size, align).expect("fresh chunk has no room");
                return Some(self.create_allocation(state, type_index, mapped, address, size, align));
            }
        }

        None
    }

    fn alloc_dedicated(
        &self,
        req: &MemoryRequirementInfo,
        properties: vk::MemoryPropertyFlags,
        dedicated: DedicatedInfo,
    ) -> Option<Ref<ResourceAllocation>> {
        let mut state = self.state.lock();
        let state = &mut *state;

        let mut type_mask = req.memory_type_bits & self.memory_type_mask(properties);

        while type_mask != 0 {
            let type_index = type_mask.trailing_zeros();
            type_mask &= type_mask - 1;

            if let Some(mut memory) =
                self.allocate_dedicated_device_memory(state, type_index, req.size, dedicated)
            {
                self.map_device_memory(&mut memory, properties);
                return Some(self.create_dedicated_allocation(state, type_index, memory));
            }
        }

        None
    }

    fn create_buffer_resource(
        &self,
        create_info: &vk::BufferCreateInfo,
        properties: vk::MemoryPropertyFlags,
    ) -> Option<Ref<ResourceAllocation>> {
        let vk_device = &self.device.raw;

        let sparse = create_info
            .flags
            .intersects(vk::BufferCreateFlags::SPARSE_BINDING);

        let mut allocation = None;

        if create_info.flags == vk::BufferCreateFlags::empty()
            && create_info.sharing_mode == vk::SharingMode::EXCLUSIVE
        {
            let mut memory_type_bits = self.global_buffer_memory_types;

            if !self.global_buffer_usage.contains(create_info.usage) {
                memory_type_bits = self.find_global_buffer_memory_type_mask(create_info.usage);
            }

            // If at least one memory type supports the usage flags and
            // requested properties, suballocate from a global buffer.
            if memory_type_bits != 0 {
                let req = MemoryRequirementInfo {
                    size: create_info.size,
                    alignment: GLOBAL_BUFFER_ALIGNMENT,
                    memory_type_bits,
                    ..Default::default()
                };

                allocation = self.alloc_memory(&req, properties).or_else(|| {
                    let fallback = properties & !vk::MemoryPropertyFlags::DEVICE_LOCAL;
                    (fallback != properties)
                        .then(|| self.alloc_memory(&req, fallback))
                        .flatten()
                });

                let has_global_buffer = allocation
                    .as_ref()
                    .map_or(false, |a| a.buffer != vk::Buffer::null());

                if has_global_buffer {
                    return allocation;
                }

                if let Some(a) = allocation.as_ref() {
                    // Keep the allocation around, the slow path below
                    // may still be able to bind it.
                    log::error!(
                        "Got allocation from memory type {} without global buffer",
                        a.memory_type
                    );
                }
            }
        }

        // Slow path: create a dedicated buffer object and bind memory.
        let buffer = unsafe { vk_device.create_buffer(create_info, None) }
            .map_err(|vr| {
                log::error!(
                    "Failed to create buffer: {vr:?}\n  size: {}\n  usage: {:?}\n  flags: {:?}",
                    create_info.size,
                    create_info.usage,
                    create_info.flags
                );
            })
            .ok()?;

        if !sparse {
            let requirements = unsafe { vk_device.get_buffer_memory_requirements(buffer) };

            // An allocation from the fast path may be unsuitable for the
            // actual buffer requirements.
            let suitable = allocation.as_ref().map_or(false, |a: &Ref<ResourceAllocation>| {
                requirements.memory_type_bits & (1 << a.memory_type) != 0
                    && a.size >= requirements.size
                    && (a.address & CHUNK_ADDRESS_MASK) % requirements.alignment.max(1) == 0
            });

            if !suitable {
                let req = MemoryRequirementInfo {
                    size: requirements.size,
                    alignment: requirements.alignment,
                    memory_type_bits: requirements.memory_type_bits,
                    ..Default::default()
                };

                allocation = self.alloc_memory(&req, properties).or_else(|| {
                    let fallback = properties & !vk::MemoryPropertyFlags::DEVICE_LOCAL;
                    (fallback != properties)
                        .then(|| self.alloc_memory(&req, fallback))
                        .flatten()
                });

                if allocation.is_none() {
                    self.log_memory_error(&req);
                    self.log_memory_stats();
                }
            }
        }

        if allocation.is_none() && sparse {
            allocation = self.create_placeholder_allocation();
        }

        let Some(allocation) = allocation else {
            unsafe { vk_device.destroy_buffer(buffer, None) };
            return None;
        };

        // Transfer ownership of the Vulkan buffer to the allocation and
        // set up the remaining properties. The allocation was just
        // created and has no other owner yet.
        unsafe {
            let ptr = allocation.as_ptr() as *mut ResourceAllocation;
            (*ptr).flags |= AllocationFlags::OWNS_BUFFER;
            (*ptr).buffer = buffer;
            (*ptr).buffer_offset = 0;
            (*ptr).buffer_address = 0;

            if sparse {
                let mut table = SparsePageTable::for_buffer(create_info.size);
                table.set_buffer_handle(buffer);
                (*ptr).sparse_page_table = Some(Mutex::new(table));
            }

            if (*ptr).memory != vk::DeviceMemory::null() {
                let offset = (*ptr).address & CHUNK_ADDRESS_MASK;

                if let Err(vr) = vk_device.bind_buffer_memory(buffer, (*ptr).memory, offset) {
                    log::error!("Failed to bind buffer memory: {vr:?}");
                    return None;
                }
            }

            // The device address is only valid after binding memory.
            if create_info
                .usage
                .contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
            {
                let info = vk::BufferDeviceAddressInfo::builder().buffer(buffer);
                (*ptr).buffer_address = vk_device.get_buffer_device_address(&info);
            }
        }

        Some(allocation)
    }

    /// Placeholder allocation object for sparse resources: it owns
    /// neither memory nor a fixed address; pages are bound separately.
    fn create_placeholder_allocation(&self) -> Option<Ref<ResourceAllocation>> {
        let mut state = self.state.lock();

        let ptr = state.allocation_pool.alloc();

        unsafe {
            ptr.as_ptr().write(ResourceAllocation {
                use_count: UseCount::new(),
                cookie: new_cookie(),
                flags: AllocationFlags::empty(),
                property_flags: vk::MemoryPropertyFlags::empty(),
                memory: vk::DeviceMemory::null(),
                address: DEDICATED_CHUNK_ADDRESS,
                size: 0,
                align: 0,
                map_ptr: std::ptr::null_mut(),
                buffer: vk::Buffer::null(),
                buffer_offset: 0,
                buffer_address: 0,
                buffer_views: Mutex::new(FastHashMap::default()),
                image: vk::Image::null(),
                image_views: Mutex::new(FastHashMap::default()),
                sparse_page_table: None,
                memory_type: u32::MAX,
                mapped_pool: false,
                allocator: self,
            });

            Some(Ref::from_raw(ptr))
        }
    }

    fn create_image_resource(
        &self,
        create_info: &vk::ImageCreateInfo,
        properties: vk::MemoryPropertyFlags,
    ) -> Option<Ref<ResourceAllocation>> {
        let vk_device = &self.device.raw;

        let image = unsafe { vk_device.create_image(create_info, None) }
            .map_err(|vr| {
                log::error!(
                    "Failed to create image: {vr:?}\n  format: {:?}\n  extent: {}x{}x{}\n  layers: {}\n  mips: {}",
                    create_info.format,
                    create_info.extent.width,
                    create_info.extent.height,
                    create_info.extent.depth,
                    create_info.array_layers,
                    create_info.mip_levels
                );
            })
            .ok()?;

        // Sparse images bind pages through the sparse binding queue and
        // get a placeholder allocation with a page table instead.
        if create_info
            .flags
            .intersects(vk::ImageCreateFlags::SPARSE_BINDING)
        {
            let Some(allocation) = self.create_placeholder_allocation() else {
                unsafe { vk_device.destroy_image(image, None) };
                return None;
            };

            let table = SparsePageTable::for_image(&self.device, create_info, image);

            unsafe {
                let ptr = allocation.as_ptr() as *mut ResourceAllocation;
                (*ptr).flags |= AllocationFlags::OWNS_IMAGE;
                (*ptr).image = image;
                (*ptr).sparse_page_table = Some(Mutex::new(table));
            }

            return Some(allocation);
        }

        let mut dedicated_req = vk::MemoryDedicatedRequirements::default();
        let mut requirements =
            vk::MemoryRequirements2::builder().push_next(&mut dedicated_req);

        unsafe {
            let info = vk::ImageMemoryRequirementsInfo2::builder().image(image);
            vk_device.get_image_memory_requirements2(&info, &mut requirements);
        }

        let core = requirements.memory_requirements;
        let prefers_dedicated = dedicated_req.prefers_dedicated_allocation != 0;
        let requires_dedicated = dedicated_req.requires_dedicated_allocation != 0;

        let mut req = MemoryRequirementInfo {
            tiling: create_info.tiling,
            prefers_dedicated,
            requires_dedicated,
            size: core.size,
            alignment: core.alignment,
            memory_type_bits: core.memory_type_bits,
        };

        let dedicated = DedicatedInfo {
            image,
            ..Default::default()
        };

        let mut allocation = None;

        if prefers_dedicated {
            allocation = self.alloc_dedicated(&req, properties, dedicated);

            // Only retry with a dedicated sysmem allocation if a dedicated
            // allocation is required; otherwise prefer suballocation.
            if allocation.is_none() && requires_dedicated {
                let fallback = properties & !vk::MemoryPropertyFlags::DEVICE_LOCAL;

                if fallback != properties {
                    allocation = self.alloc_dedicated(&req, fallback, dedicated);
                }
            }
        }

        if allocation.is_none() && !requires_dedicated {
            // Pad alignment so tiled images never share a page with
            // linear resources.
            if create_info.tiling == vk::ImageTiling::OPTIMAL {
                req.alignment = req
                    .alignment
                    .max(self.device.properties.limits.buffer_image_granularity);
            }

            allocation = self.alloc_memory(&req, properties).or_else(|| {
                let fallback = properties & !vk::MemoryPropertyFlags::DEVICE_LOCAL;
                (fallback != properties)
                    .then(|| self.alloc_memory(&req, fallback))
                    .flatten()
            });
        }

        let Some(allocation) = allocation else {
            unsafe { vk_device.destroy_image(image, None) };
            self.log_memory_error(&req);
            self.log_memory_stats();
            return None;
        };

        unsafe {
            let ptr = allocation.as_ptr() as *mut ResourceAllocation;
            (*ptr).flags |= AllocationFlags::OWNS_IMAGE;
            (*ptr).image = image;

            if (*ptr).memory != vk::DeviceMemory::null() {
                let offset = (*ptr).address & CHUNK_ADDRESS_MASK;

                if let Err(vr) = vk_device.bind_image_memory(image, (*ptr).memory, offset) {
                    log::error!("Failed to bind image memory: {vr:?}");
                    return None;
                }
            }
        }

        Some(allocation)
    }

    fn create_allocation(
        &self,
        state: &mut AllocatorState,
        type_index: u32,
        mapped: bool,
        address: u64,
        size: u64,
        align: u64,
    ) -> Ref<ResourceAllocation> {
        let ty = &mut state.types[type_index as usize];
        ty.stats.used += size;

        let property_flags = ty.properties.property_flags;

        let pool = if mapped {
            &mut ty.mapped_pool
        } else {
            &mut ty.device_pool
        };

        let chunk_index = (address >> CHUNK_ADDRESS_BITS) as usize;
        let chunk = &mut pool.chunks[chunk_index];
        chunk.unused_since = None;

        let offset = address & CHUNK_ADDRESS_MASK;

        let map_ptr = if chunk.memory.map_ptr.is_null() {
            std::ptr::null_mut()
        } else {
            unsafe { chunk.memory.map_ptr.add(offset as usize) }
        };

        let (buffer, buffer_offset, buffer_address) = if chunk.memory.buffer != vk::Buffer::null()
        {
            let gpu_va = if chunk.memory.gpu_va != 0 {
                chunk.memory.gpu_va + offset
            } else {
                0
            };
            (chunk.memory.buffer, offset, gpu_va)
        } else {
            (vk::Buffer::null(), 0, 0)
        };

        let memory = chunk.memory.memory;

        let ptr = state.allocation_pool.alloc();

        unsafe {
            ptr.as_ptr().write(ResourceAllocation {
                use_count: UseCount::new(),
                cookie: new_cookie(),
                flags: AllocationFlags::empty(),
                property_flags,
                memory,
                address,
                size,
                align,
                map_ptr,
                buffer,
                buffer_offset,
                buffer_address,
                buffer_views: Mutex::new(FastHashMap::default()),
                image: vk::Image::null(),
                image_views: Mutex::new(FastHashMap::default()),
                sparse_page_table: None,
                memory_type: type_index,
                mapped_pool: mapped,
                allocator: self,
            });

            Ref::from_raw(ptr)
        }
    }

    fn create_dedicated_allocation(
        &self,
        state: &mut AllocatorState,
        type_index: u32,
        memory: DeviceMemory,
    ) -> Ref<ResourceAllocation> {
        let ty = &mut state.types[type_index as usize];
        ty.stats.used += memory.size;

        let mut flags = AllocationFlags::OWNS_MEMORY;

        if memory.buffer != vk::Buffer::null() {
            flags |= AllocationFlags::OWNS_BUFFER;
        }

        let ptr = state.allocation_pool.alloc();

        unsafe {
            ptr.as_ptr().write(ResourceAllocation {
                use_count: UseCount::new(),
                cookie: new_cookie(),
                flags,
                property_flags: ty.properties.property_flags,
                memory: memory.memory,
                address: DEDICATED_CHUNK_ADDRESS,
                size: memory.size,
                align: 0,
                map_ptr: memory.map_ptr,
                buffer: memory.buffer,
                buffer_offset: 0,
                buffer_address: memory.gpu_va,
                buffer_views: Mutex::new(FastHashMap::default()),
                image: vk::Image::null(),
                image_views: Mutex::new(FastHashMap::default()),
                sparse_page_table: None,
                memory_type: type_index,
                mapped_pool: false,
                allocator: self,
            });

            Ref::from_raw(ptr)
        }
    }

    pub(crate) unsafe fn free_allocation(&self, ptr: NonNull<ResourceAllocation>) {
        let mut state = self.state.lock();

        {
            let allocation = ptr.as_ref();

            if allocation.memory_type != u32::MAX {
                let type_index = allocation.memory_type as usize;
                state.types[type_index].stats.used -= allocation.size;

                if allocation.flags.contains(AllocationFlags::OWNS_MEMORY) {
                    // The memory object itself is freed in destroy();
                    // only update the statistics here.
                    state.types[type_index].stats.allocated -= allocation.size;
                } else {
                    let ty = &mut state.types[type_index];
                    let pool = if allocation.mapped_pool {
                        &mut ty.mapped_pool
                    } else {
                        &mut ty.device_pool
                    };

                    if pool.free(allocation.address, allocation.size, allocation.align) {
                        let heap = self.device.memory_properties.memory_types[type_index]
                            .heap_index;
                        self.free_empty_chunks_in_heap(&mut state, heap, 0, Some(Instant::now()));
                    }
                }
            }
        }

        let mut_ptr = ptr.as_ptr();
        (*mut_ptr).destroy(&self.device);
        std::ptr::drop_in_place(mut_ptr);
        state.allocation_pool.recycle(ptr);
    }

    fn allocate_device_memory(
        &self,
        state: &mut AllocatorState,
        type_index: u32,
        mut size: u64,
        dedicated: bool,
    ) -> Option<DeviceMemory> {
        profiling::scope!("vkAllocateMemory");

        let vk_device = &self.device.raw;
        let ty = &state.types[type_index as usize];
        let buffer_usage = ty.buffer_usage;
        let type_properties = ty.properties.property_flags;
        let heap_index = ty.properties.heap_index;

        // Global buffers require the allocation size to be aligned.
        if !buffer_usage.is_empty() && !dedicated {
            size = crate::align_u64(size, GLOBAL_BUFFER_ALIGNMENT);
        }

        // Preemptively free some unused chunks to reduce memory waste.
        self.free_empty_chunks_in_heap(state, heap_index, size, Some(Instant::now()));

        let mut info = vk::MemoryAllocateInfo::builder()
            .allocation_size(size)
            .memory_type_index(type_index);

        let mut priority_info = vk::MemoryPriorityAllocateInfoEXT::builder().priority(
            if type_properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
                0.0
            } else if dedicated {
                1.0
            } else {
                0.5
            },
        );

        if type_properties.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL)
            && self.device.features.memory_priority
        {
            info = info.push_next(&mut priority_info);
        }

        let mut flags_info = vk::MemoryAllocateFlagsInfo::builder()
            .flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);

        if buffer_usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            info = info.push_next(&mut flags_info);
        }

        // On failure, trim every heap and try once more.
        let memory = match unsafe { vk_device.allocate_memory(&info, None) } {
            Ok(memory) => memory,
            Err(_) => {
                self.free_empty_chunks_in_heap(state, heap_index, u64::MAX, None);
                unsafe { vk_device.allocate_memory(&info, None) }.ok()?
            }
        };

        let mut result = DeviceMemory {
            memory,
            size,
            ..Default::default()
        };

        // Create the global buffer covering the allocation.
        if !buffer_usage.is_empty() && !dedicated {
            let buffer_info = vk::BufferCreateInfo::builder()
                .size(size)
                .usage(buffer_usage)
                .sharing_mode(vk::SharingMode::EXCLUSIVE);

            if let Ok(buffer) = unsafe { vk_device.create_buffer(&buffer_info, None) } {
                let requirements = unsafe { vk_device.get_buffer_memory_requirements(buffer) };

                let compatible = requirements.size == size
                    && requirements.memory_type_bits & (1 << type_index) != 0;

                let bound = compatible
                    && unsafe { vk_device.bind_buffer_memory(buffer, memory, 0) }.is_ok();

                if bound {
                    result.buffer = buffer;

                    if buffer_usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
                        let info = vk::BufferDeviceAddressInfo::builder().buffer(buffer);
                        result.gpu_va = unsafe { vk_device.get_buffer_device_address(&info) };
                    }
                } else {
                    unsafe { vk_device.destroy_buffer(buffer, None) };
                }
            }

            if result.buffer == vk::Buffer::null() {
                log::warn!(
                    "Failed to create global buffer:\n  size: {size}\n  usage: {buffer_usage:?}\n  type: {type_index}"
                );
            }
        }

        state.types[type_index as usize].stats.allocated += size;
        Some(result)
    }

    fn allocate_dedicated_device_memory(
        &self,
        state: &mut AllocatorState,
        type_index: u32,
        size: u64,
        dedicated: DedicatedInfo,
    ) -> Option<DeviceMemory> {
        let vk_device = &self.device.raw;
        let heap_index = state.types[type_index as usize].properties.heap_index;

        self.free_empty_chunks_in_heap(state, heap_index, size, Some(Instant::now()));

        let mut dedicated_info = vk::MemoryDedicatedAllocateInfo::builder()
            .buffer(dedicated.buffer)
            .image(dedicated.image);

        let mut priority_info = vk::MemoryPriorityAllocateInfoEXT::builder().priority(1.0);

        let mut info = vk::MemoryAllocateInfo::builder()
            .allocation_size(size)
            .memory_type_index(type_index)
            .push_next(&mut dedicated_info);

        if self.device.features.memory_priority {
            info = info.push_next(&mut priority_info);
        }

        let memory = match unsafe { vk_device.allocate_memory(&info, None) } {
            Ok(memory) => memory,
            Err(_) => {
                self.free_empty_chunks_in_heap(state, heap_index, u64::MAX, None);
                unsafe { vk_device.allocate_memory(&info, None) }.ok()?
            }
        };

        state.types[type_index as usize].stats.allocated += size;

        Some(DeviceMemory {
            memory,
            size,
            ..Default::default()
        })
    }

    fn allocate_chunk_in_pool(
        &self,
        state: &mut AllocatorState,
        type_index: u32,
        mapped: bool,
        properties: vk::MemoryPropertyFlags,
        required_size: u64,
        desired_size: u64,
    ) -> bool {
        // Retry with a smaller chunk on failure until we cannot service
        // the allocation at all.
        let mut chunk = None;
        let mut desired = desired_size;

        while chunk.is_none() && desired >= required_size.max(MIN_CHUNK_SIZE) {
            chunk = self.allocate_device_memory(state, type_index, desired, false);
            desired /= 2;
        }

        let Some(mut chunk) = chunk else {
            return false;
        };

        self.map_device_memory(&mut chunk, properties);

        let ty = &mut state.types[type_index as usize];

        // If the application is expected to need more memory, raise the
        // chunk size for subsequent allocations.
        let pool = if mapped {
            &mut ty.mapped_pool
        } else {
            &mut ty.device_pool
        };

        if pool.next_chunk_size < pool.max_chunk_size
            && pool.next_chunk_size <= ty.stats.allocated / 2
        {
            pool.next_chunk_size *= 2;
        }

        let chunk_index = pool.pages.add_chunk(chunk.size) as usize;

        if pool.chunks.len() <= chunk_index {
            pool.chunks.resize_with(chunk_index + 1, MemoryChunk::default);
        }

        pool.chunks[chunk_index] = MemoryChunk {
            memory: chunk,
            unused_since: None,
        };

        true
    }

    /// Moves an empty chunk from the opposite pool of a host-visible
    /// memory type into the requested pool, remapping as needed.
    fn move_empty_chunk(
        &self,
        ty: &mut MemoryType,
        to_mapped: bool,
        min_size: u64,
        properties: vk::MemoryPropertyFlags,
    ) -> bool {
        let (dst_max, src_pool) = if to_mapped {
            (ty.mapped_pool.max_chunk_size, &mut ty.device_pool)
        } else {
            (ty.device_pool.max_chunk_size, &mut ty.mapped_pool)
        };

        let mut candidate = None;

        for index in 0..src_pool.chunks.len() {
            let chunk = &src_pool.chunks[index];

            if chunk.memory.memory != vk::DeviceMemory::null()
                && chunk.memory.size >= min_size
                && chunk.memory.size <= dst_max
                && src_pool.pages.pages_used(index as u32) == 0
            {
                candidate = Some(index);
                break;
            }
        }

        let Some(src_index) = candidate else {
            return false;
        };

        let mut memory = std::mem::take(&mut src_pool.chunks[src_index]).memory;
        src_pool.pages.remove_chunk(src_index as u32);

        self.map_device_memory(&mut memory, properties);

        let dst_pool = if to_mapped {
            &mut ty.mapped_pool
        } else {
            &mut ty.device_pool
        };

        let chunk_index = dst_pool.pages.add_chunk(memory.size) as usize;

        if dst_pool.chunks.len() <= chunk_index {
            dst_pool
                .chunks
                .resize_with(chunk_index + 1, MemoryChunk::default);
        }

        dst_pool.chunks[chunk_index] = MemoryChunk {
            memory,
            unused_since: None,
        };

        true
    }

    fn map_device_memory(&self, memory: &mut DeviceMemory, properties: vk::MemoryPropertyFlags) {
        let vk_device = &self.device.raw;

        if properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            if !memory.map_ptr.is_null() {
                return;
            }

            match unsafe {
                vk_device.map_memory(memory.memory, 0, memory.size, vk::MemoryMapFlags::empty())
            } {
                Ok(ptr) => {
                    memory.map_ptr = ptr as *mut u8;
                    log::debug!(
                        "Mapped memory region {:p} - {:p}",
                        memory.map_ptr,
                        unsafe { memory.map_ptr.add(memory.size as usize - 1) }
                    );
                }
                Err(vr) => {
                    log::error!("Failed to map Vulkan memory: {vr:?}, size: {}", memory.size);
                }
            }
        } else if !memory.map_ptr.is_null() {
            unsafe { vk_device.unmap_memory(memory.memory) };
            log::debug!("Unmapped memory region {:p}", memory.map_ptr);
            memory.map_ptr = std::ptr::null_mut();
        }
    }

    fn free_empty_chunks_in_heap(
        &self,
        state: &mut AllocatorState,
        heap: u32,
        allocation_size: u64,
        time: Option<Instant>,
    ) {
        let type_mask = state.heaps[heap as usize].memory_types;
        let heap_budget = state.heaps[heap as usize].properties.size / 5 * 4;
        let heap_allocated = Self::heap_stats(state, heap).allocated;

        let mut mask = type_mask;

        while mask != 0 {
            let type_index = mask.trailing_zeros() as usize;
            mask &= mask - 1;

            for mapped in [false, true] {
                Self::free_empty_chunks_in_pool(
                    &self.device,
                    &mut state.types[type_index],
                    mapped,
                    allocation_size,
                    heap_budget,
                    heap_allocated,
                    time,
                );
            }
        }
    }

    fn free_empty_chunks_in_pool(
        device: &DeviceShared,
        ty: &mut MemoryType,
        mapped: bool,
        allocation_size: u64,
        heap_budget: u64,
        mut heap_allocated: u64,
        time: Option<Instant>,
    ) {
        // Allow one unused max-size chunk on device pools; mapped pools
        // get more slack since applications frequently recreate staging
        // buffers and dynamic resources.
        let (pool, max_unused_factor) = if mapped {
            (&mut ty.mapped_pool, 4)
        } else {
            (&mut ty.device_pool, 1)
        };

        let max_unused_memory = pool.max_chunk_size * max_unused_factor;

        let mut unused_memory = 0u64;
        let mut chunk_freed = false;

        for index in 0..pool.chunks.len() {
            if pool.chunks[index].memory.memory == vk::DeviceMemory::null()
                || pool.pages.pages_used(index as u32) != 0
            {
                continue;
            }

            let chunk_size = pool.chunks[index].memory.size;

            // Free chunks that are too small to be useful for future
            // allocations, or when the pending allocation would exceed
            // the heap budget.
            let mut should_free = chunk_size < pool.next_chunk_size
                || allocation_size.saturating_add(heap_allocated) > heap_budget
                || allocation_size > heap_budget;

            if !should_free {
                unused_memory += chunk_size;
                should_free = unused_memory > max_unused_memory;
            }

            // Also free chunks that have been unused for a while, but
            // only one per pass.
            if !should_free {
                if let Some(now) = time {
                    match pool.chunks[index].unused_since {
                        Some(since) if !chunk_freed => {
                            should_free = now.duration_since(since) >= UNUSED_CHUNK_TIMEOUT;
                        }
                        _ => pool.chunks[index].unused_since = Some(now),
                    }
                }
            }

            if should_free {
                let memory = std::mem::take(&mut pool.chunks[index]).memory;
                pool.pages.remove_chunk(index as u32);

                heap_allocated = heap_allocated.saturating_sub(memory.size);

                unsafe {
                    if memory.buffer != vk::Buffer::null() {
                        device.raw.destroy_buffer(memory.buffer, None);
                    }
                    device.raw.free_memory(memory.memory, None);
                }
                ty.stats.allocated -= memory.size;

                chunk_freed = true;
            }
        }
    }

    fn heap_stats(state: &AllocatorState, heap: u32) -> MemoryStats {
        let mut result = MemoryStats::default();
        let mut mask = state.heaps[heap as usize].memory_types;

        while mask != 0 {
            let ty = &state.types[mask.trailing_zeros() as usize];
            mask &= mask - 1;

            result.allocated += ty.stats.allocated;
            result.used += ty.stats.used;
        }

        result
    }

    fn allocation_stats(&self, stats: &mut AllocationStats) {
        let state = self.state.lock();

        stats.memory_types.clear();
        stats.chunks.clear();
        stats.page_masks.clear();

        for ty in &state.types {
            let chunk_index = stats.chunks.len();

            for (pool, mapped) in [(&ty.device_pool, false), (&ty.mapped_pool, true)] {
                for (index, chunk) in pool.chunks.iter().enumerate() {
                    if chunk.memory.memory == vk::DeviceMemory::null() {
                        continue;
                    }

                    let page_count = pool.pages.page_count(index as u32);
                    let mask_offset = stats.page_masks.len() as u32;
                    let mask_count = (page_count as usize + 31) / 32;

                    stats.page_masks.resize(mask_offset as usize + mask_count, 0);
                    pool.pages.page_allocation_mask(
                        index as u32,
                        &mut stats.page_masks[mask_offset as usize..],
                    );

                    stats.chunks.push(MemoryChunkStats {
                        capacity: chunk.memory.size,
                        used: pool.pages.pages_used(index as u32) as u64 * PAGE_SIZE,
                        page_mask_offset: mask_offset,
                        page_count: page_count as u16,
                        mapped,
                    });
                }
            }

            stats.memory_types.push(MemoryTypeStats {
                properties: ty.properties,
                allocated: ty.stats.allocated,
                used: ty.stats.used,
                chunk_index,
                chunk_count: stats.chunks.len() - chunk_index,
            });
        }
    }

    fn probe_buffer_requirements(
        &self,
        create_info: &vk::BufferCreateInfo,
    ) -> Option<vk::MemoryRequirements> {
        let vk_device = &self.device.raw;

        unsafe {
            let buffer = vk_device.create_buffer(create_info, None).ok()?;
            let requirements = vk_device.get_buffer_memory_requirements(buffer);
            vk_device.destroy_buffer(buffer, None);
            Some(requirements)
        }
    }

    fn probe_image_requirements(
        &self,
        create_info: &vk::ImageCreateInfo,
    ) -> Option<vk::MemoryRequirements> {
        let vk_device = &self.device.raw;

        unsafe {
            let image = vk_device.create_image(create_info, None).ok()?;
            let requirements = vk_device.get_image_memory_requirements(image);
            vk_device.destroy_image(image, None);
            Some(requirements)
        }
    }

    fn determine_buffer_usage_per_type(&mut self) {
        let mut flags = vk::BufferUsageFlags::INDIRECT_BUFFER
            | vk::BufferUsageFlags::VERTEX_BUFFER
            | vk::BufferUsageFlags::INDEX_BUFFER
            | vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::UNIFORM_BUFFER
            | vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER
            | vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER;

        if self.device.features.transform_feedback {
            flags |= vk::BufferUsageFlags::TRANSFORM_FEEDBACK_BUFFER_EXT
                | vk::BufferUsageFlags::TRANSFORM_FEEDBACK_COUNTER_BUFFER_EXT;
        }

        if self.device.features.buffer_device_address {
            flags |= vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
        }

        // Check which individual flags are supported on each memory type.
        // This is a bit dodgy since Vulkan does not require flag
        // combinations to be supported, but we need to be robust around
        // buffer creation anyway.
        let type_count = {
            let state = self.state.get_mut();
            state.types.len()
        };

        let mut per_type_usage = vec![vk::BufferUsageFlags::empty(); type_count];

        let mut remaining = flags.as_raw();

        while remaining != 0 {
            let flag = vk::BufferUsageFlags::from_raw(remaining & remaining.wrapping_neg());
            remaining &= remaining - 1;

            let usage =
                flag | vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::TRANSFER_SRC;

            let info = vk::BufferCreateInfo::builder()
                .size(65536)
                .usage(usage)
                .sharing_mode(vk::SharingMode::EXCLUSIVE);

            if let Some(requirements) = self.probe_buffer_requirements(&info) {
                let mut mask = requirements.memory_type_bits;

                while mask != 0 {
                    let ty = mask.trailing_zeros() as usize;
                    mask &= mask - 1;

                    if ty < type_count {
                        per_type_usage[ty] |= usage;
                    }
                }
            }
        }

        // Restrict types to a minimal subset if the combined flags fail.
        let mut global_usage = vk::BufferUsageFlags::from_raw(!0);
        let mut global_types = 0u32;

        for (index, usage) in per_type_usage.iter_mut().enumerate() {
            if !usage.is_empty() {
                let info = vk::BufferCreateInfo::builder()
                    .size(65536)
                    .usage(*usage)
                    .sharing_mode(vk::SharingMode::EXCLUSIVE);

                let supported = self
                    .probe_buffer_requirements(&info)
                    .map_or(false, |req| req.memory_type_bits & (1 << index) != 0);

                if !supported {
                    *usage &= vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                        | vk::BufferUsageFlags::TRANSFER_DST
                        | vk::BufferUsageFlags::TRANSFER_SRC;
                }
            }

            if !usage.is_empty() {
                global_usage &= *usage;
                global_types |= 1 << index;
            }
        }

        if global_types == 0 {
            global_usage = vk::BufferUsageFlags::empty();
        }

        {
            let state = self.state.get_mut();
            for (ty, usage) in state.types.iter_mut().zip(per_type_usage) {
                ty.buffer_usage = usage;
            }
        }

        self.global_buffer_usage = global_usage;
        self.global_buffer_memory_types = global_types;

        log::info!(
            "Memory type mask for buffer resources: {global_types:#x}, usage: {global_usage:?}"
        );
    }

    fn find_global_buffer_memory_type_mask(&self, usage: vk::BufferUsageFlags) -> u32 {
        let state = self.state.lock();
        let mut mask = self.global_buffer_memory_types;

        for (index, ty) in state.types.iter().enumerate() {
            if mask & (1 << index) != 0 && !ty.buffer_usage.contains(usage) {
                mask ^= 1 << index;
            }
        }

        mask
    }

    fn determine_sparse_memory_types(&self) -> u32 {
        let mut type_mask = !0u32;

        let buffer_info = vk::BufferCreateInfo::builder()
            .flags(
                vk::BufferCreateFlags::SPARSE_BINDING
                    | vk::BufferCreateFlags::SPARSE_ALIASED
                    | vk::BufferCreateFlags::SPARSE_RESIDENCY,
            )
            .size(65536)
            .usage(
                vk::BufferUsageFlags::TRANSFER_SRC
                    | vk::BufferUsageFlags::TRANSFER_DST
                    | vk::BufferUsageFlags::VERTEX_BUFFER
                    | vk::BufferUsageFlags::INDEX_BUFFER
                    | vk::BufferUsageFlags::INDIRECT_BUFFER
                    | vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER
                    | vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER,
            )
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        if let Some(requirements) = self.probe_buffer_requirements(&buffer_info) {
            type_mask &= requirements.memory_type_bits;
        }

        let image_info = vk::ImageCreateInfo::builder()
            .flags(
                vk::ImageCreateFlags::SPARSE_BINDING
                    | vk::ImageCreateFlags::SPARSE_ALIASED
                    | vk::ImageCreateFlags::SPARSE_RESIDENCY,
            )
            .image_type(vk::ImageType::TYPE_2D)
            .format(vk::Format::R8G8B8A8_UNORM)
            .extent(vk::Extent3D {
                width: 256,
                height: 256,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(
                vk::ImageUsageFlags::COLOR_ATTACHMENT
                    | vk::ImageUsageFlags::SAMPLED
                    | vk::ImageUsageFlags::STORAGE
                    | vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST,
            )
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        if let Some(requirements) = self.probe_image_requirements(&image_info) {
            type_mask &= requirements.memory_type_bits;
        }

        if type_mask != 0 {
            log::info!("Memory type mask for sparse resources: {type_mask:#x}");
        } else {
            log::error!("No memory types support sparse resources");
        }

        type_mask
    }

    fn log_memory_error(&self, req: &MemoryRequirementInfo) {
        log::error!(
            "Memory allocation failed\n  Size: {}\n  Alignment: {}\n  Mem types: {:#x}",
            req.size,
            req.alignment,
            req.memory_type_bits
        );
    }

    fn log_memory_stats(&self) {
        let state = self.state.lock();

        let mut report = String::from("Heap  Size (MiB)  Allocated   Used\n");

        for heap in &state.heaps {
            let stats = Self::heap_stats(&state, heap.index);

            report.push_str(&format!(
                "{:2}:   {:6}      {:6}      {:6}\n",
                heap.index,
                heap.properties.size >> 20,
                stats.allocated >> 20,
                stats.used >> 20
            ));
        }

        log::error!("{report}");
    }

    fn run_worker(self: Arc<Self>) {
        loop {
            {
                let mut stop = self.stop_worker.lock();

                if !*stop {
                    self.worker_cond
                        .wait_for(&mut stop, Duration::from_secs(1));
                }

                if *stop {
                    return;
                }
            }

            // Periodically free unused chunks.
            let now = Instant::now();
            let mut state = self.state.lock();
            let heap_count = state.heaps.len() as u32;

            for heap in 0..heap_count {
                self.free_empty_chunks_in_heap(&mut state, heap, 0, Some(now));
            }
        }
    }
}

impl MemoryType {
    fn chunk_size(&self, mapped: bool) -> u64 {
        if mapped {
            self.mapped_pool.next_chunk_size
        } else {
            self.device_pool.next_chunk_size
        }
    }
}

/// Picks the chunk size for a pool growth: the pool's next chunk size,
/// doubled until several resources of the requested size fit.
fn desired_chunk_size(next_chunk_size: u64, size: u64, min_resources_per_chunk: u64) -> u64 {
    let mut desired = next_chunk_size;

    while desired < size.saturating_mul(min_resources_per_chunk) {
        desired *= 2;
    }

    desired
}

/// Upper chunk size limit per memory type. Mapped pools use smaller
/// chunks to conserve address space; small heaps are limited so that at
/// least 15 chunks fit.
fn determine_max_chunk_size(heap_size: u64, mapped: bool) -> u64 {
    let mut size = MAX_CHUNK_SIZE;

    if mapped {
        size /= if cfg!(target_pointer_width = "32") {
            16
        } else {
            4
        };
    }

    while 15 * size > heap_size && size > MIN_CHUNK_SIZE {
        size /= 2;
    }

    size.max(MIN_CHUNK_SIZE)
}

/// Builds the 16-entry LUT mapping required property flags to candidate
/// memory types. Device-local types are hidden when a non-device-local
/// type satisfies the same required flags, unless device-local is itself
/// requested. If no cached coherent type exists, the entry aliases the
/// uncached coherent one.
fn determine_types_by_property_flags(types: &[MemoryType]) -> [u32; 16] {
    let mut lut = [0u32; 16];

    for (flag_bits, entry) in lut.iter_mut().enumerate() {
        let flags = vk::MemoryPropertyFlags::from_raw(flag_bits as u32);

        let has_non_device_local = types.iter().any(|ty| {
            ty.properties.property_flags.contains(flags)
                && !ty
                    .properties
                    .property_flags
                    .contains(vk::MemoryPropertyFlags::DEVICE_LOCAL)
        });

        let mut mask = 0u32;

        for (index, ty) in types.iter().enumerate() {
            let type_flags = ty.properties.property_flags;

            if !type_flags.contains(flags) {
                continue;
            }

            if has_non_device_local
                && !flags.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL)
                && type_flags.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL)
            {
                continue;
            }

            mask |= 1 << index;
        }

        *entry = mask;
    }

    let host_cached = (vk::MemoryPropertyFlags::HOST_VISIBLE
        | vk::MemoryPropertyFlags::HOST_COHERENT
        | vk::MemoryPropertyFlags::HOST_CACHED)
        .as_raw() as usize;

    let host_coherent = (vk::MemoryPropertyFlags::HOST_VISIBLE
        | vk::MemoryPropertyFlags::HOST_COHERENT)
        .as_raw() as usize;

    if lut[host_cached] == 0 {
        lut[host_cached] = lut[host_coherent];
    }

    lut
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_type(flags: vk::MemoryPropertyFlags) -> MemoryType {
        MemoryType {
            index: 0,
            properties: vk::MemoryType {
                property_flags: flags,
                heap_index: 0,
            },
            stats: MemoryStats::default(),
            buffer_usage: vk::BufferUsageFlags::empty(),
            device_pool: MemoryPool::new(MAX_CHUNK_SIZE),
            mapped_pool: MemoryPool::new(MAX_CHUNK_SIZE / 4),
        }
    }

    #[test]
    fn chunk_size_growth_points() {
        const MIB: u64 = 1 << 20;
        const KIB: u64 = 1 << 10;

        // First allocation of 256 KiB grows the pool by the minimum
        // chunk of 4 MiB; once that chunk is full, the next chunk is
        // doubled if the type has enough allocated memory.
        assert_eq!(desired_chunk_size(4 * MIB, 256 * KIB, 4), 4 * MIB);
        assert_eq!(desired_chunk_size(4 * MIB, 2 * MIB, 4), 8 * MIB);
        assert_eq!(desired_chunk_size(8 * MIB, 256 * KIB, 1), 8 * MIB);
    }

    #[test]
    fn max_chunk_size_limits() {
        const GIB: u64 = 1 << 30;

        assert_eq!(determine_max_chunk_size(8 * GIB, false), MAX_CHUNK_SIZE);
        assert_eq!(determine_max_chunk_size(8 * GIB, true), MAX_CHUNK_SIZE / 4);

        // A 256 MiB heap must fit 15 chunks.
        let small = determine_max_chunk_size(256 << 20, false);
        assert!(15 * small <= 256 << 20 || small == MIN_CHUNK_SIZE);
    }

    #[test]
    fn property_lut_prefers_non_device_local() {
        let types = vec![
            memory_type(vk::MemoryPropertyFlags::DEVICE_LOCAL),
            memory_type(
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            ),
            memory_type(
                vk::MemoryPropertyFlags::DEVICE_LOCAL
                    | vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT,
            ),
        ];

        let lut = determine_types_by_property_flags(&types);

        // Plain host-visible requests avoid the device-local BAR type.
        let host_visible = vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() as usize;
        assert_eq!(lut[host_visible], 0x2);

        // Device-local requests see only device-local types.
        let device_local = vk::MemoryPropertyFlags::DEVICE_LOCAL.as_raw() as usize;
        assert_eq!(lut[device_local], 0x5);

        // No flags at all: every type qualifies except hidden BAR types.
        assert_eq!(lut[0], 0x2);
    }

    #[test]
    fn property_lut_aliases_cached_to_coherent() {
        let types = vec![memory_type(
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )];

        let lut = determine_types_by_property_flags(&types);

        let cached = (vk::MemoryPropertyFlags::HOST_VISIBLE
            | vk::MemoryPropertyFlags::HOST_COHERENT
            | vk::MemoryPropertyFlags::HOST_CACHED)
            .as_raw() as usize;

        assert_eq!(lut[cached], 0x1);
    }

    #[test]
    fn pool_dispatches_by_size() {
        let mut pool = MemoryPool::new(MAX_CHUNK_SIZE);
        pool.pages.add_chunk(4 << 20);

        let small = pool.alloc(512, 256).unwrap();
        let large = pool.alloc(128 << 10, 4 << 10).unwrap();

        assert!(!pool.free(small, 512, 256));
        assert!(pool.free(large, 128 << 10, 4 << 10));
    }
}
