//! Logical buffers.
//!
//! A buffer wraps one re-assignable storage allocation. Replacing the
//! storage bumps the buffer's version, which implicitly invalidates all
//! cached view handles: views re-create their Vulkan object on the next
//! access when their recorded version no longer matches.

use std::{
    ptr::NonNull,
    sync::atomic::{AtomicBool, AtomicU32, Ordering},
};

use ash::vk;
use parking_lot::Mutex;

use crate::{
    memory::{BufferViewKey, MemoryAllocator, ResourceAllocation, ResourceBufferInfo},
    resource::{new_cookie, Ref, Resource, UseCount},
    DeviceError, FastHashMap,
};

/// Properties of a buffer passed to buffer creation.
#[derive(Clone, Debug, Default)]
pub struct BufferCreateInfo {
    /// Size of the buffer, in bytes.
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    /// Pipeline stages that can access the contents of the buffer.
    pub stages: vk::PipelineStageFlags2,
    /// Allowed access patterns.
    pub access: vk::AccessFlags2,
    pub flags: vk::BufferCreateFlags,
    pub debug_name: Option<String>,
}

impl BufferCreateInfo {
    fn to_vk(&self) -> vk::BufferCreateInfo {
        vk::BufferCreateInfo::builder()
            .flags(self.flags)
            .size(self.size)
            .usage(self.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .build()
    }
}

/// Info for importing an externally created buffer.
#[derive(Clone, Copy, Debug)]
pub struct BufferImportInfo {
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub map_ptr: *mut u8,
}

/// Buffer range handle with the mapped pointer.
#[derive(Clone, Copy, Debug)]
pub struct BufferSliceInfo {
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub size: u64,
    pub map_ptr: *mut u8,
    pub gpu_address: u64,
}

struct BufferStorage {
    allocation: Ref<ResourceAllocation>,
    info: ResourceBufferInfo,
}

/// A buffer resource.
pub struct Buffer {
    use_count: UseCount,
    cookie: u64,

    info: BufferCreateInfo,
    properties: vk::MemoryPropertyFlags,

    storage: Mutex<BufferStorage>,
    /// Bumped on storage reassignment; view handles keyed by this.
    version: AtomicU32,

    xfb_stride: AtomicU32,
    stable_address: AtomicBool,

    views: Mutex<FastHashMap<BufferViewKey, Box<BufferView>>>,
}

unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

unsafe impl Resource for Buffer {
    fn use_count(&self) -> &UseCount {
        &self.use_count
    }

    unsafe fn free(this: NonNull<Self>) {
        drop(Box::from_raw(this.as_ptr()));
    }
}

impl Buffer {
    pub fn new(
        allocator: &MemoryAllocator,
        info: BufferCreateInfo,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<Ref<Buffer>, DeviceError> {
        let allocation = allocator
            .create_buffer_resource(&info.to_vk(), properties)
            .ok_or(DeviceError::OutOfMemory)?;

        let buffer_info = allocation.buffer_info();

        Ok(Ref::new(Buffer {
            use_count: UseCount::new(),
            cookie: new_cookie(),
            info,
            properties,
            storage: Mutex::new(BufferStorage {
                allocation,
                info: buffer_info,
            }),
            version: AtomicU32::new(0),
            xfb_stride: AtomicU32::new(0),
            stable_address: AtomicBool::new(false),
            views: Mutex::new(FastHashMap::default()),
        }))
    }

    /// Wraps an externally created buffer. The allocation owns nothing.
    pub fn new_imported(
        allocator: &MemoryAllocator,
        info: BufferCreateInfo,
        import: BufferImportInfo,
    ) -> Result<Ref<Buffer>, DeviceError> {
        let allocation = allocator
            .import_buffer_resource(import.buffer, import.offset, info.size, import.map_ptr)
            .ok_or(DeviceError::OutOfMemory)?;

        let buffer_info = allocation.buffer_info();

        Ok(Ref::new(Buffer {
            use_count: UseCount::new(),
            cookie: new_cookie(),
            info,
            properties: vk::MemoryPropertyFlags::empty(),
            storage: Mutex::new(BufferStorage {
                allocation,
                info: buffer_info,
            }),
            version: AtomicU32::new(0),
            xfb_stride: AtomicU32::new(0),
            stable_address: AtomicBool::new(true),
            views: Mutex::new(FastHashMap::default()),
        }))
    }

    pub fn info(&self) -> &BufferCreateInfo {
        &self.info
    }

    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    /// Memory property flags; tells whether the buffer is host-visible.
    pub fn memory_flags(&self) -> vk::MemoryPropertyFlags {
        self.properties
    }

    pub fn map_ptr(&self, offset: u64) -> *mut u8 {
        let storage = self.storage.lock();

        if storage.info.map_ptr.is_null() {
            std::ptr::null_mut()
        } else {
            unsafe { storage.info.map_ptr.add(offset as usize) }
        }
    }

    /// GPU address; zero unless the device-address usage flag is set.
    pub fn gpu_address(&self) -> u64 {
        self.storage.lock().info.gpu_address
    }

    pub fn slice_info(&self) -> BufferSliceInfo {
        self.subslice_info(0, self.info.size)
    }

    pub fn subslice_info(&self, offset: u64, size: u64) -> BufferSliceInfo {
        let storage = self.storage.lock();

        BufferSliceInfo {
            buffer: storage.info.buffer,
            offset: storage.info.offset + offset,
            size,
            map_ptr: if storage.info.map_ptr.is_null() {
                std::ptr::null_mut()
            } else {
                unsafe { storage.info.map_ptr.add(offset as usize) }
            },
            gpu_address: if storage.info.gpu_address != 0 {
                storage.info.gpu_address + offset
            } else {
                0
            },
        }
    }

    /// Vertex stride used when drawing after transform feedback.
    pub fn xfb_vertex_stride(&self) -> u32 {
        self.xfb_stride.load(Ordering::Relaxed)
    }

    pub fn set_xfb_vertex_stride(&self, stride: u32) {
        self.xfb_stride.store(stride, Ordering::Relaxed);
    }

    /// Allocates a new backing storage suitable for this buffer.
    pub fn allocate_storage(
        &self,
        allocator: &MemoryAllocator,
    ) -> Result<Ref<ResourceAllocation>, DeviceError> {
        allocator
            .create_buffer_resource(&self.info.to_vk(), self.properties)
            .ok_or(DeviceError::OutOfMemory)
    }

    /// Replaces the backing storage and implicitly invalidates cached
    /// views. Returns the previous storage.
    pub fn assign_storage(&self, allocation: Ref<ResourceAllocation>) -> Ref<ResourceAllocation> {
        let mut storage = self.storage.lock();

        let info = allocation.buffer_info();
        let old = std::mem::replace(
            &mut *storage,
            BufferStorage {
                allocation,
                info,
            },
        );

        self.version.fetch_add(1, Ordering::Release);
        old.allocation
    }

    pub fn storage(&self) -> Ref<ResourceAllocation> {
        self.storage.lock().allocation.clone()
    }

    /// 48-bit identifier for barrier tracking, derived from the storage
    /// allocation. Stable across view invalidations, changes on storage
    /// reassignment.
    pub fn resource_id(&self) -> u64 {
        let storage = self.storage.lock();
        let ptr = storage.allocation.as_ptr() as usize as u64;
        (ptr / std::mem::align_of::<ResourceAllocation>() as u64) & ((1 << 48) - 1)
    }

    /// Whether the backend may replace the backing storage. Buffers
    /// with a stable GPU or CPU address cannot be moved.
    pub fn can_relocate(&self) -> bool {
        !self.stable_address.load(Ordering::Relaxed)
            && !self
                .info
                .flags
                .intersects(vk::BufferCreateFlags::SPARSE_BINDING)
    }

    pub fn enable_stable_address(&self) {
        self.stable_address.store(true, Ordering::Relaxed);
    }

    fn version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }

}

impl Ref<Buffer> {
    /// Creates or retrieves a view with the given properties.
    pub fn create_view(&self, key: BufferViewKey) -> BufferViewRef {
        let mut views = self.views.lock();

        let view = views.entry(key).or_insert_with(|| {
            Box::new(BufferView {
                buffer: NonNull::from(&**self),
                key,
                state: Mutex::new(ViewState {
                    version: u32::MAX,
                    handle: vk::BufferView::null(),
                }),
            })
        });

        BufferViewRef {
            view: NonNull::from(&**view),
            buffer: self.clone(),
        }
    }
}

struct ViewState {
    version: u32,
    handle: vk::BufferView,
}

/// A buffer view. Owned by its parent buffer; the back-reference is
/// non-owning, handles keep the parent alive instead.
pub struct BufferView {
    buffer: NonNull<Buffer>,
    key: BufferViewKey,
    state: Mutex<ViewState>,
}

unsafe impl Send for BufferView {}
unsafe impl Sync for BufferView {}

impl BufferView {
    fn buffer(&self) -> &Buffer {
        unsafe { self.buffer.as_ref() }
    }

    pub fn info(&self) -> BufferViewKey {
        self.key
    }

    /// Number of typed elements in the view.
    pub fn element_count(&self, element_size: u64) -> u64 {
        self.key.size / element_size.max(1)
    }

    /// Retrieves the Vulkan view handle, re-creating the view if the
    /// buffer has been invalidated since the last call.
    pub fn handle(&self) -> Result<vk::BufferView, DeviceError> {
        let buffer = self.buffer();
        let version = buffer.version();

        let mut state = self.state.lock();

        if state.version != version {
            let storage = buffer.storage.lock();
            state.handle = storage
                .allocation
                .create_buffer_view(self.key)
                .map_err(DeviceError::from)?;
            state.version = version;
        }

        Ok(state.handle)
    }

    pub fn slice_info(&self) -> BufferSliceInfo {
        self.buffer().subslice_info(self.key.offset, self.key.size)
    }
}

/// Handle to a buffer view; keeps the parent buffer alive.
pub struct BufferViewRef {
    view: NonNull<BufferView>,
    buffer: Ref<Buffer>,
}

unsafe impl Send for BufferViewRef {}
unsafe impl Sync for BufferViewRef {}

impl BufferViewRef {
    pub fn buffer(&self) -> &Ref<Buffer> {
        &self.buffer
    }
}

impl Clone for BufferViewRef {
    fn clone(&self) -> Self {
        Self {
            view: self.view,
            buffer: self.buffer.clone(),
        }
    }
}

impl std::ops::Deref for BufferViewRef {
    type Target = BufferView;

    fn deref(&self) -> &BufferView {
        unsafe { self.view.as_ref() }
    }
}
