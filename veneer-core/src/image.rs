//! Logical images.
//!
//! Lifecycle mirrors buffers: one re-assignable storage allocation, a
//! version counter, and lazily created views cached on the allocation.

use std::{
    ptr::NonNull,
    sync::atomic::{AtomicU32, Ordering},
};

use ash::vk;
use parking_lot::Mutex;

use crate::{
    memory::{ImageViewKey, MemoryAllocator, ResourceAllocation, ResourceImageInfo},
    resource::{new_cookie, Ref, Resource, UseCount},
    DeviceError, FastHashMap,
};

/// Properties of an image passed to image creation.
#[derive(Clone, Debug)]
pub struct ImageCreateInfo {
    pub image_type: vk::ImageType,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub samples: vk::SampleCountFlags,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,
    /// Pipeline stages that can access the image.
    pub stages: vk::PipelineStageFlags2,
    /// Allowed access patterns.
    pub access: vk::AccessFlags2,
    pub flags: vk::ImageCreateFlags,
    pub initial_layout: vk::ImageLayout,
    pub debug_name: Option<String>,
}

impl Default for ImageCreateInfo {
    fn default() -> Self {
        Self {
            image_type: vk::ImageType::TYPE_2D,
            format: vk::Format::UNDEFINED,
            extent: vk::Extent3D {
                width: 1,
                height: 1,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: vk::ImageUsageFlags::empty(),
            stages: vk::PipelineStageFlags2::empty(),
            access: vk::AccessFlags2::empty(),
            flags: vk::ImageCreateFlags::empty(),
            initial_layout: vk::ImageLayout::UNDEFINED,
            debug_name: None,
        }
    }
}

impl ImageCreateInfo {
    fn to_vk(&self) -> vk::ImageCreateInfo {
        vk::ImageCreateInfo::builder()
            .flags(self.flags)
            .image_type(self.image_type)
            .format(self.format)
            .extent(self.extent)
            .mip_levels(self.mip_levels)
            .array_layers(self.array_layers)
            .samples(self.samples)
            .tiling(self.tiling)
            .usage(self.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(self.initial_layout)
            .build()
    }
}

struct ImageStorage {
    allocation: Ref<ResourceAllocation>,
    info: ResourceImageInfo,
}

/// An image resource.
pub struct Image {
    use_count: UseCount,
    cookie: u64,

    info: ImageCreateInfo,
    properties: vk::MemoryPropertyFlags,

    storage: Mutex<ImageStorage>,
    version: AtomicU32,

    views: Mutex<FastHashMap<ImageViewKey, Box<ImageView>>>,
}

unsafe impl Send for Image {}
unsafe impl Sync for Image {}

unsafe impl Resource for Image {
    fn use_count(&self) -> &UseCount {
        &self.use_count
    }

    unsafe fn free(this: NonNull<Self>) {
        drop(Box::from_raw(this.as_ptr()));
    }
}

impl Image {
    pub fn new(
        allocator: &MemoryAllocator,
        info: ImageCreateInfo,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<Ref<Image>, DeviceError> {
        let allocation = allocator
            .create_image_resource(&info.to_vk(), properties)
            .ok_or(DeviceError::OutOfMemory)?;

        let image_info = allocation.image_info();

        Ok(Ref::new(Image {
            use_count: UseCount::new(),
            cookie: new_cookie(),
            info,
            properties,
            storage: Mutex::new(ImageStorage {
                allocation,
                info: image_info,
            }),
            version: AtomicU32::new(0),
            views: Mutex::new(FastHashMap::default()),
        }))
    }

    /// Wraps an externally created image, e.g. a swap chain image. The
    /// allocation owns nothing.
    pub fn new_imported(
        allocator: &MemoryAllocator,
        info: ImageCreateInfo,
        native: vk::Image,
    ) -> Result<Ref<Image>, DeviceError> {
        let allocation = allocator
            .import_image_resource(native)
            .ok_or(DeviceError::OutOfMemory)?;

        let image_info = allocation.image_info();

        Ok(Ref::new(Image {
            use_count: UseCount::new(),
            cookie: new_cookie(),
            info,
            properties: vk::MemoryPropertyFlags::empty(),
            storage: Mutex::new(ImageStorage {
                allocation,
                info: image_info,
            }),
            version: AtomicU32::new(0),
            views: Mutex::new(FastHashMap::default()),
        }))
    }

    pub fn info(&self) -> &ImageCreateInfo {
        &self.info
    }

    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    pub fn memory_flags(&self) -> vk::MemoryPropertyFlags {
        self.properties
    }

    pub fn handle(&self) -> vk::Image {
        self.storage.lock().info.image
    }

    pub fn map_ptr(&self, offset: u64) -> *mut u8 {
        let storage = self.storage.lock();

        if storage.info.map_ptr.is_null() {
            std::ptr::null_mut()
        } else {
            unsafe { storage.info.map_ptr.add(offset as usize) }
        }
    }

    /// Number of subresources: one per mip level and array layer.
    pub fn subresource_count(&self) -> u32 {
        self.info.mip_levels * self.info.array_layers
    }

    /// Flat subresource index for barrier range encoding.
    pub fn subresource_index(&self, mip: u32, layer: u32) -> u32 {
        layer * self.info.mip_levels + mip
    }

    /// First and last subresource index covered by a subresource range,
    /// for barrier tracking.
    pub fn subresource_range_span(&self, range: &vk::ImageSubresourceRange) -> (u64, u64) {
        let layer_count = if range.layer_count == vk::REMAINING_ARRAY_LAYERS {
            self.info.array_layers - range.base_array_layer
        } else {
            range.layer_count
        };

        let level_count = if range.level_count == vk::REMAINING_MIP_LEVELS {
            self.info.mip_levels - range.base_mip_level
        } else {
            range.level_count
        };

        let first = self.subresource_index(range.base_mip_level, range.base_array_layer);
        let last = self.subresource_index(
            range.base_mip_level + level_count - 1,
            range.base_array_layer + layer_count - 1,
        );

        (first as u64, last as u64)
    }

    /// Allocates a new backing storage suitable for this image.
    pub fn allocate_storage(
        &self,
        allocator: &MemoryAllocator,
    ) -> Result<Ref<ResourceAllocation>, DeviceError> {
        allocator
            .create_image_resource(&self.info.to_vk(), self.properties)
            .ok_or(DeviceError::OutOfMemory)
    }

    /// Replaces the backing storage, invalidating cached views.
    pub fn assign_storage(&self, allocation: Ref<ResourceAllocation>) -> Ref<ResourceAllocation> {
        let mut storage = self.storage.lock();

        let info = allocation.image_info();
        let old = std::mem::replace(&mut *storage, ImageStorage { allocation, info });

        self.version.fetch_add(1, Ordering::Release);
        old.allocation
    }

    pub fn storage(&self) -> Ref<ResourceAllocation> {
        self.storage.lock().allocation.clone()
    }

    /// 48-bit identifier for barrier tracking.
    pub fn resource_id(&self) -> u64 {
        let storage = self.storage.lock();
        let ptr = storage.allocation.as_ptr() as usize as u64;
        (ptr / std::mem::align_of::<ResourceAllocation>() as u64) & ((1 << 48) - 1)
    }

    fn version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }

}

impl Ref<Image> {
    /// Creates or retrieves a view with the given properties.
    pub fn create_view(&self, key: ImageViewKey) -> ImageViewRef {
        let mut views = self.views.lock();

        let view = views.entry(key).or_insert_with(|| {
            Box::new(ImageView {
                image: NonNull::from(&**self),
                key,
                state: Mutex::new(ViewState {
                    version: u32::MAX,
                    handle: vk::ImageView::null(),
                }),
            })
        });

        ImageViewRef {
            view: NonNull::from(&**view),
            image: self.clone(),
        }
    }
}

struct ViewState {
    version: u32,
    handle: vk::ImageView,
}

/// An image view. Owned by its parent image; the back-reference is
/// non-owning, handles keep the parent alive instead.
pub struct ImageView {
    image: NonNull<Image>,
    key: ImageViewKey,
    state: Mutex<ViewState>,
}

unsafe impl Send for ImageView {}
unsafe impl Sync for ImageView {}

impl ImageView {
    fn image(&self) -> &Image {
        unsafe { self.image.as_ref() }
    }

    pub fn info(&self) -> ImageViewKey {
        self.key
    }

    /// Subresource range covered by this view.
    pub fn subresource_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.key.aspects,
            base_mip_level: self.key.mip_index as u32,
            level_count: self.key.mip_count as u32,
            base_array_layer: self.key.layer_index as u32,
            layer_count: self.key.layer_count as u32,
        }
    }

    /// Retrieves the Vulkan view handle, re-creating the view if the
    /// image storage has been replaced since the last call.
    pub fn handle(&self) -> Result<vk::ImageView, DeviceError> {
        let image = self.image();
        let version = image.version();

        let mut state = self.state.lock();

        if state.version != version {
            let storage = image.storage.lock();
            state.handle = storage
                .allocation
                .create_image_view(self.key)
                .map_err(DeviceError::from)?;
            state.version = version;
        }

        Ok(state.handle)
    }
}

/// Handle to an image view; keeps the parent image alive.
pub struct ImageViewRef {
    view: NonNull<ImageView>,
    image: Ref<Image>,
}

unsafe impl Send for ImageViewRef {}
unsafe impl Sync for ImageViewRef {}

impl ImageViewRef {
    pub fn image(&self) -> &Ref<Image> {
        &self.image
    }
}

impl Clone for ImageViewRef {
    fn clone(&self) -> Self {
        Self {
            view: self.view,
            image: self.image.clone(),
        }
    }
}

impl std::ops::Deref for ImageViewRef {
    type Target = ImageView;

    fn deref(&self) -> &ImageView {
        unsafe { self.view.as_ref() }
    }
}
