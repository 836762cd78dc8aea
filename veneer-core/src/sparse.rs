//! Sparse resources: page tables, the shared page allocator and the
//! sparse binding submission.
//!
//! Sparse buffers map to a linear array of 64k pages; sparse images get
//! per-subresource page grids plus a linear mip tail. Pages are bound to
//! memory from a [`SparsePageAllocator`] whose pages are use-counted so
//! that shrinking the allocator never pulls memory from under a live
//! binding.

use std::{cmp::Ordering as CmpOrdering, collections::BTreeMap, sync::Arc};

use ash::vk;
use parking_lot::Mutex;

use crate::{
    device::DeviceShared,
    memory::{MemoryAllocator, ResourceAllocation, ResourceMemoryInfo},
    resource::Ref,
};

pub const SPARSE_PAGE_SIZE: u64 = 1 << 16;

/// Resource region backed by one page.
#[derive(Clone, Copy, Debug)]
pub enum SparsePageInfo {
    None,
    Buffer {
        offset: u64,
        length: u64,
    },
    Image {
        subresource: vk::ImageSubresource,
        offset: vk::Offset3D,
        extent: vk::Extent3D,
    },
    MipTail {
        resource_offset: u64,
        resource_length: u64,
    },
}

/// `vk::ImageSubresource` does not implement `PartialEq` upstream.
fn image_subresource_eq(a: &vk::ImageSubresource, b: &vk::ImageSubresource) -> bool {
    a.aspect_mask == b.aspect_mask && a.mip_level == b.mip_level && a.array_layer == b.array_layer
}

impl PartialEq for SparsePageInfo {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) => true,
            (
                Self::Buffer { offset, length },
                Self::Buffer {
                    offset: other_offset,
                    length: other_length,
                },
            ) => offset == other_offset && length == other_length,
            (
                Self::Image {
                    subresource,
                    offset,
                    extent,
                },
                Self::Image {
                    subresource: other_subresource,
                    offset: other_offset,
                    extent: other_extent,
                },
            ) => {
                image_subresource_eq(subresource, other_subresource)
                    && offset == other_offset
                    && extent == other_extent
            }
            (
                Self::MipTail {
                    resource_offset,
                    resource_length,
                },
                Self::MipTail {
                    resource_offset: other_resource_offset,
                    resource_length: other_resource_length,
                },
            ) => resource_offset == other_resource_offset && resource_length == other_resource_length,
            _ => false,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SparseImageProperties {
    pub flags: vk::SparseImageFormatFlags,
    pub page_region_extent: vk::Extent3D,
    pub paged_mip_count: u32,
    pub mip_tail_page_index: u32,
    pub mip_tail_offset: u64,
    pub mip_tail_size: u64,
    pub mip_tail_stride: u64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SparseImageSubresourceProperties {
    pub is_mip_tail: bool,
    pub page_count: vk::Extent3D,
    pub page_index: u32,
}

/// Tracks which allocator page backs each resource page.
pub struct SparsePageTable {
    buffer: vk::Buffer,
    image: vk::Image,

    properties: SparseImageProperties,
    subresources: Vec<SparseImageSubresourceProperties>,
    metadata: Vec<SparsePageInfo>,
    mappings: Vec<SparseMapping>,
}

impl SparsePageTable {
    /// Page table for a sparse buffer: consecutive 64k pages.
    pub fn for_buffer(size: u64) -> Self {
        let page_count = (crate::align_u64(size, SPARSE_PAGE_SIZE) / SPARSE_PAGE_SIZE) as usize;

        let metadata = (0..page_count)
            .map(|i| {
                let offset = i as u64 * SPARSE_PAGE_SIZE;
                SparsePageInfo::Buffer {
                    offset,
                    length: SPARSE_PAGE_SIZE.min(size - offset),
                }
            })
            .collect();

        Self {
            buffer: vk::Buffer::null(),
            image: vk::Image::null(),
            properties: SparseImageProperties::default(),
            subresources: vec![SparseImageSubresourceProperties {
                is_mip_tail: false,
                page_count: vk::Extent3D {
                    width: page_count as u32,
                    height: 1,
                    depth: 1,
                },
                page_index: 0,
            }],
            mappings: std::iter::repeat_with(SparseMapping::default)
                .take(page_count)
                .collect(),
            metadata,
        }
    }

    /// Page table for a sparse image, built from the driver's sparse
    /// memory requirements.
    pub fn for_image(
        device: &DeviceShared,
        create_info: &vk::ImageCreateInfo,
        image: vk::Image,
    ) -> Self {
        let requirements = unsafe { device.raw.get_image_sparse_memory_requirements(image) };

        let Some(req) = requirements.first() else {
            log::warn!("Sparse image has no memory requirements, using empty page table");
            return Self {
                buffer: vk::Buffer::null(),
                image,
                properties: SparseImageProperties::default(),
                subresources: Vec::new(),
                metadata: Vec::new(),
                mappings: Vec::new(),
            };
        };

        let mut table = Self::build_image_table(
            create_info.extent,
            create_info.mip_levels,
            create_info.array_layers,
            req.format_properties.aspect_mask,
            req.format_properties.image_granularity,
            req.format_properties.flags,
            req.image_mip_tail_first_lod,
            req.image_mip_tail_offset,
            req.image_mip_tail_size,
            req.image_mip_tail_stride,
        );

        table.image = image;
        table
    }

    fn build_image_table(
        extent: vk::Extent3D,
        mip_levels: u32,
        array_layers: u32,
        aspect_mask: vk::ImageAspectFlags,
        granularity: vk::Extent3D,
        flags: vk::SparseImageFormatFlags,
        mip_tail_first_lod: u32,
        mip_tail_offset: u64,
        mip_tail_size: u64,
        mip_tail_stride: u64,
    ) -> Self {
        let paged_mip_count = mip_tail_first_lod.min(mip_levels);

        let mut subresources =
            vec![SparseImageSubresourceProperties::default(); (mip_levels * array_layers) as usize];
        let mut metadata = Vec::new();

        for layer in 0..array_layers {
            for mip in 0..mip_levels {
                let index = (layer * mip_levels + mip) as usize;

                if mip >= mip_tail_first_lod {
                    subresources[index] = SparseImageSubresourceProperties {
                        is_mip_tail: true,
                        page_count: vk::Extent3D::default(),
                        page_index: 0,
                    };
                    continue;
                }

                let mip_extent = vk::Extent3D {
                    width: (extent.width >> mip).max(1),
                    height: (extent.height >> mip).max(1),
                    depth: (extent.depth >> mip).max(1),
                };

                let page_count = vk::Extent3D {
                    width: (mip_extent.width + granularity.width - 1) / granularity.width,
                    height: (mip_extent.height + granularity.height - 1) / granularity.height,
                    depth: (mip_extent.depth + granularity.depth - 1) / granularity.depth,
                };

                subresources[index] = SparseImageSubresourceProperties {
                    is_mip_tail: false,
                    page_count,
                    page_index: metadata.len() as u32,
                };

                let subresource = vk::ImageSubresource {
                    aspect_mask,
                    mip_level: mip,
                    array_layer: layer,
                };

                for z in 0..page_count.depth {
                    for y in 0..page_count.height {
                        for x in 0..page_count.width {
                            let offset = vk::Offset3D {
                                x: (x * granularity.width) as i32,
                                y: (y * granularity.height) as i32,
                                z: (z * granularity.depth) as i32,
                            };

                            let page_extent = vk::Extent3D {
                                width: granularity.width.min(mip_extent.width - offset.x as u32),
                                height: granularity
                                    .height
                                    .min(mip_extent.height - offset.y as u32),
                                depth: granularity.depth.min(mip_extent.depth - offset.z as u32),
                            };

                            metadata.push(SparsePageInfo::Image {
                                subresource,
                                offset,
                                extent: page_extent,
                            });
                        }
                    }
                }
            }
        }

        let mip_tail_page_index = metadata.len() as u32;

        // The mip tail is either shared across layers or strided per layer.
        if mip_tail_size != 0 {
            let single = flags.contains(vk::SparseImageFormatFlags::SINGLE_MIPTAIL);
            let tail_layers = if single { 1 } else { array_layers };

            for layer in 0..tail_layers {
                let layer_offset = mip_tail_offset + layer as u64 * mip_tail_stride;
                let page_count = crate::align_u64(mip_tail_size, SPARSE_PAGE_SIZE) / SPARSE_PAGE_SIZE;

                for page in 0..page_count {
                    let resource_offset = layer_offset + page * SPARSE_PAGE_SIZE;
                    metadata.push(SparsePageInfo::MipTail {
                        resource_offset,
                        resource_length: SPARSE_PAGE_SIZE
                            .min(layer_offset + mip_tail_size - resource_offset),
                    });
                }
            }
        }

        let page_count = metadata.len();

        Self {
            buffer: vk::Buffer::null(),
            image: vk::Image::null(),
            properties: SparseImageProperties {
                flags,
                page_region_extent: granularity,
                paged_mip_count,
                mip_tail_page_index,
                mip_tail_offset,
                mip_tail_size,
                mip_tail_stride,
            },
            subresources,
            metadata,
            mappings: std::iter::repeat_with(SparseMapping::default)
                .take(page_count)
                .collect(),
        }
    }

    pub fn buffer_handle(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn image_handle(&self) -> vk::Image {
        self.image
    }

    pub(crate) fn set_buffer_handle(&mut self, buffer: vk::Buffer) {
        self.buffer = buffer;
    }

    /// Total number of pages, including the mip tail.
    pub fn page_count(&self) -> u32 {
        self.metadata.len() as u32
    }

    pub fn subresource_count(&self) -> u32 {
        self.subresources.len() as u32
    }

    pub fn properties(&self) -> SparseImageProperties {
        self.properties
    }

    pub fn subresource_properties(&self, subresource: u32) -> SparseImageSubresourceProperties {
        self.subresources
            .get(subresource as usize)
            .copied()
            .unwrap_or_default()
    }

    pub fn page_info(&self, page: u32) -> SparsePageInfo {
        self.metadata
            .get(page as usize)
            .copied()
            .unwrap_or(SparsePageInfo::None)
    }

    /// Computes the page index within a given image region.
    ///
    /// Mip tail subresources map linearly from the mip tail base; other
    /// regions translate `page_index` into a 3D offset within
    /// `region_extent` unless the region is declared linear.
    pub fn compute_page_index(
        &self,
        subresource: u32,
        region_offset: vk::Offset3D,
        region_extent: vk::Extent3D,
        region_is_linear: bool,
        page_index: u32,
    ) -> u32 {
        let info = self.subresource_properties(subresource);

        if info.is_mip_tail {
            return self.properties.mip_tail_page_index + page_index;
        }

        let mut page_offset = region_offset;
        let mut page_index = page_index;

        if !region_is_linear {
            page_offset.x += (page_index % region_extent.width) as i32;
            page_offset.y += ((page_index / region_extent.width) % region_extent.height) as i32;
            page_offset.z += ((page_index / region_extent.width) / region_extent.height) as i32;
            page_index = 0;
        }

        let result = info.page_index
            + page_offset.x as u32
            + info.page_count.width * (page_offset.y as u32 + info.page_count.height * page_offset.z as u32);

        result + page_index
    }

    pub fn mapping(&self, page: u32) -> SparseMapping {
        self.mappings
            .get(page as usize)
            .cloned()
            .unwrap_or_default()
    }

    /// Replaces a page mapping. Returns the previous mapping so the
    /// caller can keep it alive until the bind operation completes.
    pub fn update_mapping(&mut self, page: u32, mapping: SparseMapping) -> Option<SparseMapping> {
        let slot = &mut self.mappings[page as usize];

        if *slot == mapping {
            return None;
        }

        Some(std::mem::replace(slot, mapping))
    }
}

struct SparsePageAllocatorInner {
    page_count: u32,
    use_count: u64,
    pages: Vec<Ref<ResourceAllocation>>,
}

/// Allocator for sparse memory pages with variable capacity.
///
/// Pages are use-counted through [`SparseMapping`]; shrinking the
/// capacity only releases pages physically once no mapping is live.
pub struct SparsePageAllocator {
    inner: Mutex<SparsePageAllocatorInner>,
}

impl SparsePageAllocator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(SparsePageAllocatorInner {
                page_count: 0,
                use_count: 0,
                pages: Vec::new(),
            }),
        })
    }

    /// Acquires the page at the given index, incrementing the
    /// allocator's use count.
    pub fn acquire_page(self: &Arc<Self>, page: u32) -> SparseMapping {
        let mut inner = self.inner.lock();

        if page >= inner.page_count {
            return SparseMapping::default();
        }

        inner.use_count += 1;

        SparseMapping {
            pool: Some(Arc::clone(self)),
            page: Some(inner.pages[page as usize].clone()),
        }
    }

    /// Changes the allocator's capacity. Growing allocates new pages;
    /// shrinking only drops pages once no mapping is in flight.
    pub fn set_capacity(self: &Arc<Self>, memory: &MemoryAllocator, page_count: u32) {
        let mut inner = self.inner.lock();

        match page_count.cmp(&inner.page_count) {
            CmpOrdering::Less => {
                if inner.use_count == 0 {
                    inner.pages.truncate(page_count as usize);
                }
            }
            CmpOrdering::Greater => {
                let mut new_pages = Vec::with_capacity((page_count - inner.page_count) as usize);

                for _ in inner.page_count..page_count {
                    match memory.create_sparse_page() {
                        Some(page) => new_pages.push(page),
                        None => {
                            log::error!("Failed to allocate sparse page");
                            break;
                        }
                    }
                }

                // Sort pages by memory object and offset to enable more
                // batching during page table updates.
                new_pages.sort_by(|a, b| {
                    let a = a.memory_info();
                    let b = b.memory_info();
                    (a.memory, a.offset).cmp(&(b.memory, b.offset))
                });

                inner.pages.append(&mut new_pages);
            }
            CmpOrdering::Equal => (),
        }

        inner.page_count = page_count.min(inner.pages.len() as u32);
    }

    #[cfg(test)]
    fn use_count(&self) -> u64 {
        self.inner.lock().use_count
    }

    fn release_use(&self) {
        let mut inner = self.inner.lock();
        inner.use_count -= 1;

        if inner.use_count == 0 {
            let count = inner.page_count as usize;
            inner.pages.truncate(count);
        }
    }

    fn acquire_use(&self) {
        self.inner.lock().use_count += 1;
    }
}

/// Reference to a page of a [`SparsePageAllocator`], maintaining the
/// allocator's use count across copies and moves.
#[derive(Default)]
pub struct SparseMapping {
    pool: Option<Arc<SparsePageAllocator>>,
    page: Option<Ref<ResourceAllocation>>,
}

impl SparseMapping {
    pub fn memory_info(&self) -> ResourceMemoryInfo {
        match &self.page {
            Some(page) => page.memory_info(),
            None => ResourceMemoryInfo {
                memory: vk::DeviceMemory::null(),
                offset: 0,
                size: 0,
            },
        }
    }

    pub fn is_bound(&self) -> bool {
        self.page.is_some()
    }

    pub(crate) fn page(&self) -> Option<&Ref<ResourceAllocation>> {
        self.page.as_ref()
    }
}

impl Clone for SparseMapping {
    fn clone(&self) -> Self {
        if let Some(pool) = &self.pool {
            pool.acquire_use();
        }

        Self {
            pool: self.pool.clone(),
            page: self.page.clone(),
        }
    }
}

impl PartialEq for SparseMapping {
    fn eq(&self, other: &Self) -> bool {
        // The pool is a function of the page.
        match (&self.page, &other.page) {
            (Some(a), Some(b)) => a.as_ptr() == b.as_ptr(),
            (None, None) => true,
            _ => false,
        }
    }
}

impl Drop for SparseMapping {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.release_use();
        }
    }
}

// Sparse bind keys provide a strong ordering by resource, offset and
// size (images: subresource, then z/y/x offset, then extent), which
// makes merging adjacent ranges a single linear pass.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SparseBufferBindKey {
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub size: u64,
}

impl Ord for SparseBufferBindKey {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.buffer, self.offset, self.size).cmp(&(other.buffer, other.offset, other.size))
    }
}

impl PartialOrd for SparseBufferBindKey {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SparseImageBindKey {
    pub image: vk::Image,
    pub subresource: vk::ImageSubresource,
    pub offset: vk::Offset3D,
    pub extent: vk::Extent3D,
}

impl PartialEq for SparseImageBindKey {
    fn eq(&self, other: &Self) -> bool {
        self.image == other.image
            && image_subresource_eq(&self.subresource, &other.subresource)
            && self.offset == other.offset
            && self.extent == other.extent
    }
}

impl Eq for SparseImageBindKey {}

impl SparseImageBindKey {
    fn encode_subresource(&self) -> u64 {
        (self.subresource.aspect_mask.as_raw() as u64) << 48
            | (self.subresource.array_layer as u64) << 24
            | self.subresource.mip_level as u64
    }

    fn encode_offset(&self) -> u64 {
        (self.offset.z as u64) << 48 | (self.offset.y as u64) << 24 | self.offset.x as u64
    }

    fn encode_extent(&self) -> u64 {
        (self.extent.depth as u64) << 48
            | (self.extent.height as u64) << 24
            | self.extent.width as u64
    }
}

impl Ord for SparseImageBindKey {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (
            self.image,
            self.encode_subresource(),
            self.encode_offset(),
            self.encode_extent(),
        )
            .cmp(&(
                other.image,
                other.encode_subresource(),
                other.encode_offset(),
                other.encode_extent(),
            ))
    }
}

impl PartialOrd for SparseImageBindKey {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SparseImageOpaqueBindKey {
    pub image: vk::Image,
    pub offset: u64,
    pub size: u64,
    pub flags: vk::SparseMemoryBindFlags,
}

impl Ord for SparseImageOpaqueBindKey {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.image, self.offset, self.size).cmp(&(other.image, other.offset, other.size))
    }
}

impl PartialOrd for SparseImageOpaqueBindKey {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Accumulates sparse binding operations for one queue submission.
///
/// Binding ranges must either exactly match an existing range (in which
/// case the old binding is replaced) or be disjoint from all existing
/// ranges. This holds trivially when binding one page at a time.
pub struct SparseBindSubmission {
    wait_semaphores: Vec<vk::Semaphore>,
    wait_semaphore_values: Vec<u64>,
    signal_semaphores: Vec<vk::Semaphore>,
    signal_semaphore_values: Vec<u64>,

    buffer_binds: BTreeMap<SparseBufferBindKey, ResourceMemoryInfo>,
    image_binds: BTreeMap<SparseImageBindKey, ResourceMemoryInfo>,
    image_opaque_binds: BTreeMap<SparseImageOpaqueBindKey, ResourceMemoryInfo>,
}

impl SparseBindSubmission {
    pub fn new() -> Self {
        Self {
            wait_semaphores: Vec::new(),
            wait_semaphore_values: Vec::new(),
            signal_semaphores: Vec::new(),
            signal_semaphore_values: Vec::new(),
            buffer_binds: BTreeMap::new(),
            image_binds: BTreeMap::new(),
            image_opaque_binds: BTreeMap::new(),
        }
    }

    pub fn wait_semaphore(&mut self, semaphore: vk::Semaphore, value: u64) {
        self.wait_semaphores.push(semaphore);
        self.wait_semaphore_values.push(value);
    }

    pub fn signal_semaphore(&mut self, semaphore: vk::Semaphore, value: u64) {
        self.signal_semaphores.push(semaphore);
        self.signal_semaphore_values.push(value);
    }

    pub fn bind_buffer_memory(&mut self, key: SparseBufferBindKey, memory: ResourceMemoryInfo) {
        self.buffer_binds.insert(key, memory);
    }

    pub fn bind_image_memory(&mut self, key: SparseImageBindKey, memory: ResourceMemoryInfo) {
        self.image_binds.insert(key, memory);
    }

    pub fn bind_image_opaque_memory(
        &mut self,
        key: SparseImageOpaqueBindKey,
        memory: ResourceMemoryInfo,
    ) {
        self.image_opaque_binds.insert(key, memory);
    }

    pub fn is_empty(&self) -> bool {
        self.buffer_binds.is_empty()
            && self.image_binds.is_empty()
            && self.image_opaque_binds.is_empty()
    }

    /// Builds the bind info, merging adjacent ranges, and submits it to
    /// the given queue. Resets the object afterwards.
    pub fn submit(&mut self, device: &DeviceShared, queue: vk::Queue) -> Result<(), vk::Result> {
        profiling::scope!("vkQueueBindSparse");

        let (buffer_binds, buffer_infos) = self.process_buffer_binds();
        let (image_binds, image_infos) = self.process_image_binds();
        let (opaque_binds, opaque_infos) = self.process_opaque_binds();

        // The sparse binding API was never updated to the newer semaphore
        // submit info structs.
        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::builder()
            .wait_semaphore_values(&self.wait_semaphore_values)
            .signal_semaphore_values(&self.signal_semaphore_values);

        let mut bind_info = vk::BindSparseInfo::builder()
            .wait_semaphores(&self.wait_semaphores)
            .buffer_binds(&buffer_infos)
            .image_opaque_binds(&opaque_infos)
            .image_binds(&image_infos)
            .signal_semaphores(&self.signal_semaphores);

        if !self.wait_semaphores.is_empty() || !self.signal_semaphores.is_empty() {
            bind_info = bind_info.push_next(&mut timeline_info);
        }

        let result = unsafe { device.raw.queue_bind_sparse(queue, &[*bind_info], vk::Fence::null()) };

        if let Err(vr) = result {
            log::error!("Sparse binding failed: {vr:?}");
            self.log_bind_info(&buffer_infos, &opaque_infos, &image_infos);
        }

        drop((buffer_binds, image_binds, opaque_binds));

        self.reset();
        result
    }

    pub fn reset(&mut self) {
        self.wait_semaphores.clear();
        self.wait_semaphore_values.clear();
        self.signal_semaphores.clear();
        self.signal_semaphore_values.clear();

        self.buffer_binds.clear();
        self.image_binds.clear();
        self.image_opaque_binds.clear();
    }

    fn process_buffer_binds(
        &self,
    ) -> (Vec<vk::SparseMemoryBind>, Vec<vk::SparseBufferMemoryBindInfo>) {
        let mut ranges: Vec<(vk::Buffer, vk::SparseMemoryBind)> =
            Vec::with_capacity(self.buffer_binds.len());

        for (key, memory) in &self.buffer_binds {
            let bind = vk::SparseMemoryBind {
                resource_offset: key.offset,
                size: key.size,
                memory: memory.memory,
                memory_offset: memory.offset,
                flags: vk::SparseMemoryBindFlags::empty(),
            };

            let merged = match ranges.last_mut() {
                Some((buffer, last)) if *buffer == key.buffer => {
                    try_merge_memory_bind(last, &bind)
                }
                _ => false,
            };

            if !merged {
                ranges.push((key.buffer, bind));
            }
        }

        populate_bind_arrays(ranges, |buffer, binds| {
            vk::SparseBufferMemoryBindInfo {
                buffer,
                bind_count: binds.len() as u32,
                p_binds: binds.as_ptr(),
            }
        })
    }

    fn process_image_binds(
        &self,
    ) -> (
        Vec<vk::SparseImageMemoryBind>,
        Vec<vk::SparseImageMemoryBindInfo>,
    ) {
        // Merge along one axis at a time; the key ordering guarantees
        // that mergeable regions are adjacent in the iteration.
        let mut binds: Vec<(SparseImageBindKey, ResourceMemoryInfo)> =
            Vec::with_capacity(self.image_binds.len());

        for (key, memory) in &self.image_binds {
            let mut new_bind = (*key, *memory);

            while let Some(old_bind) = binds.last().copied() {
                let Some(merged) = try_merge_image_bind(&old_bind, &new_bind) else {
                    break;
                };

                new_bind = merged;
                binds.pop();
            }

            binds.push(new_bind);
        }

        let ranges: Vec<(vk::Image, vk::SparseImageMemoryBind)> = binds
            .into_iter()
            .map(|(key, memory)| {
                (
                    key.image,
                    vk::SparseImageMemoryBind {
                        subresource: key.subresource,
                        offset: key.offset,
                        extent: key.extent,
                        memory: memory.memory,
                        memory_offset: memory.offset,
                        flags: vk::SparseMemoryBindFlags::empty(),
                    },
                )
            })
            .collect();

        populate_bind_arrays(ranges, |image, binds| vk::SparseImageMemoryBindInfo {
            image,
            bind_count: binds.len() as u32,
            p_binds: binds.as_ptr(),
        })
    }

    fn process_opaque_binds(
        &self,
    ) -> (
        Vec<vk::SparseMemoryBind>,
        Vec<vk::SparseImageOpaqueMemoryBindInfo>,
    ) {
        let mut ranges: Vec<(vk::Image, vk::SparseMemoryBind)> =
            Vec::with_capacity(self.image_opaque_binds.len());

        for (key, memory) in &self.image_opaque_binds {
            let bind = vk::SparseMemoryBind {
                resource_offset: key.offset,
                size: key.size,
                memory: memory.memory,
                memory_offset: memory.offset,
                flags: key.flags,
            };

            let merged = match ranges.last_mut() {
                Some((image, last)) if *image == key.image => try_merge_memory_bind(last, &bind),
                _ => false,
            };

            if !merged {
                ranges.push((key.image, bind));
            }
        }

        populate_bind_arrays(ranges, |image, binds| vk::SparseImageOpaqueMemoryBindInfo {
            image,
            bind_count: binds.len() as u32,
            p_binds: binds.as_ptr(),
        })
    }

    fn log_bind_info(
        &self,
        buffer_infos: &[vk::SparseBufferMemoryBindInfo],
        opaque_infos: &[vk::SparseImageOpaqueMemoryBindInfo],
        image_infos: &[vk::SparseImageMemoryBindInfo],
    ) {
        let mut report = String::from("BindSparseInfo:\n");

        if !self.wait_semaphores.is_empty() {
            report.push_str(&format!(
                "  Wait semaphores ({}):\n",
                self.wait_semaphores.len()
            ));
            for (sem, value) in self.wait_semaphores.iter().zip(&self.wait_semaphore_values) {
                report.push_str(&format!("    {sem:?} ({value})\n"));
            }
        }

        for info in buffer_infos {
            report.push_str(&format!(
                "  Buffer {:?} ({} binds)\n",
                info.buffer, info.bind_count
            ));

            for i in 0..info.bind_count as usize {
                let bind = unsafe { &*info.p_binds.add(i) };
                report.push_str(&format!(
                    "    {:#x}..{:#x} -> {:?}:{:#x}\n",
                    bind.resource_offset,
                    bind.resource_offset + bind.size,
                    bind.memory,
                    bind.memory_offset
                ));
            }
        }

        for info in opaque_infos {
            report.push_str(&format!(
                "  Image (opaque) {:?} ({} binds)\n",
                info.image, info.bind_count
            ));
        }

        for info in image_infos {
            report.push_str(&format!(
                "  Image {:?} ({} binds)\n",
                info.image, info.bind_count
            ));
        }

        if !self.signal_semaphores.is_empty() {
            report.push_str(&format!(
                "  Signal semaphores ({}):\n",
                self.signal_semaphores.len()
            ));
            for (sem, value) in self
                .signal_semaphores
                .iter()
                .zip(&self.signal_semaphore_values)
            {
                report.push_str(&format!("    {sem:?} ({value})\n"));
            }
        }

        log::error!("{report}");
    }
}

/// Groups per-resource binds into bind info structs. The bind array is
/// fully sized up front so the info structs can point into it.
fn populate_bind_arrays<H: Copy + PartialEq, B: Copy, I>(
    input: Vec<(H, B)>,
    make_info: impl Fn(H, &[B]) -> I,
) -> (Vec<B>, Vec<I>) {
    let binds: Vec<B> = input.iter().map(|(_, bind)| *bind).collect();
    let mut infos = Vec::new();

    let mut start = 0usize;

    while start < input.len() {
        let handle = input[start].0;
        let mut end = start + 1;

        while end < input.len() && input[end].0 == handle {
            end += 1;
        }

        infos.push(make_info(handle, &binds[start..end]));
        start = end;
    }

    (binds, infos)
}

/// Merges `new_bind` into `old_bind` if the resource and memory ranges
/// are contiguous.
fn try_merge_memory_bind(old_bind: &mut vk::SparseMemoryBind, new_bind: &vk::SparseMemoryBind) -> bool {
    if new_bind.memory != old_bind.memory || new_bind.flags != old_bind.flags {
        return false;
    }

    // The resource range must be consistent.
    if new_bind.resource_offset != old_bind.resource_offset + old_bind.size {
        return false;
    }

    // If memory is not null, the memory range must also be consistent.
    if old_bind.memory != vk::DeviceMemory::null()
        && new_bind.memory_offset != old_bind.memory_offset + old_bind.size
    {
        return false;
    }

    old_bind.size += new_bind.size;
    true
}

/// Merges two image binds along a single axis if the orthogonal extents
/// match. Axes are tried in x/y/z order.
fn try_merge_image_bind(
    old_bind: &(SparseImageBindKey, ResourceMemoryInfo),
    new_bind: &(SparseImageBindKey, ResourceMemoryInfo),
) -> Option<(SparseImageBindKey, ResourceMemoryInfo)> {
    let (old_key, old_memory) = old_bind;
    let (new_key, new_memory) = new_bind;

    if old_key.image != new_key.image || !image_subresource_eq(&old_key.subresource, &new_key.subresource) {
        return None;
    }

    if old_memory.memory != new_memory.memory {
        return None;
    }

    if old_memory.memory != vk::DeviceMemory::null()
        && old_memory.offset + old_memory.size != new_memory.offset
    {
        return None;
    }

    let old_offset = old_key.offset;
    let old_extent = old_key.extent;
    let new_offset = new_key.offset;
    let new_extent = new_key.extent;

    let mut delta = vk::Extent3D::default();
    let can_merge;

    if old_offset.x as u32 + old_extent.width == new_offset.x as u32 {
        can_merge = old_offset.y == new_offset.y
            && old_extent.height == new_extent.height
            && old_offset.z == new_offset.z
            && old_extent.depth == new_extent.depth;
        delta.width = new_extent.width;
    } else if old_offset.y as u32 + old_extent.height == new_offset.y as u32 {
        can_merge = old_offset.x == new_offset.x
            && old_extent.width == new_extent.width
            && old_offset.z == new_offset.z
            && old_extent.depth == new_extent.depth;
        delta.height = new_extent.height;
    } else if old_offset.z as u32 + old_extent.depth == new_offset.z as u32 {
        can_merge = old_offset.x == new_offset.x
            && old_extent.width == new_extent.width
            && old_offset.y == new_offset.y
            && old_extent.height == new_extent.height;
        delta.depth = new_extent.depth;
    } else {
        return None;
    }

    if !can_merge {
        return None;
    }

    let mut merged_key = *old_key;
    merged_key.extent.width += delta.width;
    merged_key.extent.height += delta.height;
    merged_key.extent.depth += delta.depth;

    let mut merged_memory = *old_memory;

    if merged_memory.memory != vk::DeviceMemory::null() {
        merged_memory.size += new_memory.size;
    }

    Some((merged_key, merged_memory))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_page_table_layout() {
        let table = SparsePageTable::for_buffer(3 * SPARSE_PAGE_SIZE / 2);

        assert_eq!(table.page_count(), 2);
        assert_eq!(
            table.page_info(0),
            SparsePageInfo::Buffer {
                offset: 0,
                length: SPARSE_PAGE_SIZE
            }
        );
        assert_eq!(
            table.page_info(1),
            SparsePageInfo::Buffer {
                offset: SPARSE_PAGE_SIZE,
                length: SPARSE_PAGE_SIZE / 2
            }
        );
    }

    fn image_table() -> SparsePageTable {
        // 512x256, 3 mips, 2 layers, 128x128 granularity, tail from mip 2.
        SparsePageTable::build_image_table(
            vk::Extent3D {
                width: 512,
                height: 256,
                depth: 1,
            },
            3,
            2,
            vk::ImageAspectFlags::COLOR,
            vk::Extent3D {
                width: 128,
                height: 128,
                depth: 1,
            },
            vk::SparseImageFormatFlags::empty(),
            2,
            0x40000,
            2 * SPARSE_PAGE_SIZE,
            2 * SPARSE_PAGE_SIZE,
        )
    }

    #[test]
    fn image_page_table_layout() {
        let table = image_table();

        // Mip 0: 4x2 pages, mip 1: 2x1 pages, per layer.
        let mip0 = table.subresource_properties(0);
        assert!(!mip0.is_mip_tail);
        assert_eq!(mip0.page_count.width, 4);
        assert_eq!(mip0.page_count.height, 2);
        assert_eq!(mip0.page_index, 0);

        let mip1 = table.subresource_properties(1);
        assert_eq!(mip1.page_count.width, 2);
        assert_eq!(mip1.page_index, 8);

        let mip2 = table.subresource_properties(2);
        assert!(mip2.is_mip_tail);

        // Layer 1 starts after layer 0's 10 pages.
        let l1_mip0 = table.subresource_properties(3);
        assert_eq!(l1_mip0.page_index, 10);

        // 20 regular pages, then 2 tail pages per layer.
        assert_eq!(table.properties().mip_tail_page_index, 20);
        assert_eq!(table.page_count(), 24);
    }

    #[test]
    fn page_index_for_regions() {
        let table = image_table();

        // Mip tail pages map linearly.
        assert_eq!(
            table.compute_page_index(
                2,
                vk::Offset3D::default(),
                vk::Extent3D::default(),
                true,
                1
            ),
            21
        );

        // Non-linear region: page index walks x, then y.
        let region_offset = vk::Offset3D { x: 1, y: 0, z: 0 };
        let region_extent = vk::Extent3D {
            width: 2,
            height: 2,
            depth: 1,
        };

        // Third page of the region is (x=0, y=1) within the region, so
        // (x=1, y=1) in the subresource: index = 1 + 4 * 1 = 5.
        assert_eq!(
            table.compute_page_index(0, region_offset, region_extent, false, 2),
            5
        );

        // Linear region within a subresource just adds the page index.
        assert_eq!(
            table.compute_page_index(1, vk::Offset3D::default(), region_extent, true, 1),
            9
        );
    }

    #[test]
    fn memory_bind_merging() {
        let mut old = vk::SparseMemoryBind {
            resource_offset: 0,
            size: SPARSE_PAGE_SIZE,
            memory: vk::DeviceMemory::null(),
            memory_offset: 0,
            flags: vk::SparseMemoryBindFlags::empty(),
        };

        // Null memory merges on contiguous resource ranges alone.
        let next = vk::SparseMemoryBind {
            resource_offset: SPARSE_PAGE_SIZE,
            size: SPARSE_PAGE_SIZE,
            ..old
        };
        assert!(try_merge_memory_bind(&mut old, &next));
        assert_eq!(old.size, 2 * SPARSE_PAGE_SIZE);

        // A gap prevents merging.
        let gapped = vk::SparseMemoryBind {
            resource_offset: 4 * SPARSE_PAGE_SIZE,
            size: SPARSE_PAGE_SIZE,
            ..old
        };
        assert!(!try_merge_memory_bind(&mut old, &gapped));
    }

    #[test]
    fn image_bind_merging_along_x() {
        let image = vk::Image::null();
        let subresource = vk::ImageSubresource {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            array_layer: 0,
        };

        let memory = ResourceMemoryInfo {
            memory: vk::DeviceMemory::null(),
            offset: 0,
            size: 0,
        };

        let a = (
            SparseImageBindKey {
                image,
                subresource,
                offset: vk::Offset3D { x: 0, y: 0, z: 0 },
                extent: vk::Extent3D {
                    width: 128,
                    height: 128,
                    depth: 1,
                },
            },
            memory,
        );

        let b = (
            SparseImageBindKey {
                image,
                subresource,
                offset: vk::Offset3D { x: 128, y: 0, z: 0 },
                extent: vk::Extent3D {
                    width: 128,
                    height: 128,
                    depth: 1,
                },
            },
            memory,
        );

        let merged = try_merge_image_bind(&a, &b).expect("x-adjacent regions must merge");
        assert_eq!(merged.0.extent.width, 256);

        // Mismatched orthogonal extent blocks the merge.
        let mut c = b;
        c.0.extent.height = 64;
        assert!(try_merge_image_bind(&a, &c).is_none());
    }

    #[test]
    fn mapping_use_count_round_trip() {
        let pool = SparsePageAllocator::new();

        // Empty allocator yields unbound mappings and no use count.
        let mapping = pool.acquire_page(0);
        assert!(!mapping.is_bound());
        assert_eq!(pool.use_count(), 0);
        drop(mapping);
        assert_eq!(pool.use_count(), 0);
    }
}
