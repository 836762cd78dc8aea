//! Bounded sampler pool.
//!
//! Vulkan implementations only guarantee a small number of sampler
//! objects, so samplers are deduplicated by a packed key and recycled
//! through an LRU list of currently-unreferenced samplers. Acquiring a
//! sampler removes it from the LRU list; releasing the last reference
//! appends it, keeping the object and its look-up entry intact in case
//! the same key is requested again.

use std::sync::{
    atomic::{AtomicU32, AtomicU64, Ordering},
    Arc,
};

use ash::vk;
use parking_lot::Mutex;

use crate::{device::DeviceShared, FastHashMap};

/// Hard limit for sampler objects in Vulkan implementations.
pub const MAX_SAMPLER_COUNT: u32 = 4000;

fn encode_fixed(value: f32, signed: bool, int_bits: u32, frac_bits: u32) -> u32 {
    let scale = (1u32 << frac_bits) as f32;
    let bits = int_bits + frac_bits;

    if signed {
        let limit = (1i64 << (bits - 1)) - 1;
        let raw = ((value * scale) as i64).clamp(-limit - 1, limit);
        (raw as u32) & ((1u32 << bits) - 1)
    } else {
        let limit = (1i64 << bits) - 1;
        ((value * scale) as i64).clamp(0, limit) as u32
    }
}

fn decode_fixed(raw: u32, signed: bool, int_bits: u32, frac_bits: u32) -> f32 {
    let scale = (1u32 << frac_bits) as f32;
    let bits = int_bits + frac_bits;

    if signed {
        let shift = 32 - bits;
        ((raw << shift) as i32 >> shift) as f32 / scale
    } else {
        raw as f32 / scale
    }
}

/// Packed sampler properties.
///
/// Two dwords of bit fields plus the border color; cheap to hash and
/// compare, which the pool relies on.
#[derive(Clone, Copy, Debug, Default)]
pub struct SamplerKey {
    properties: [u32; 2],
    border_color: [u32; 4],
}

impl SamplerKey {
    // Word 0.
    const MIN_FILTER_BIT: u32 = 0;
    const MAG_FILTER_BIT: u32 = 1;
    const MIP_MODE_BIT: u32 = 2;
    const ANISOTROPY_SHIFT: u32 = 3; // 5 bits
    const ADDRESS_U_SHIFT: u32 = 8; // 3 bits
    const ADDRESS_V_SHIFT: u32 = 11;
    const ADDRESS_W_SHIFT: u32 = 14;
    const HAS_BORDER_BIT: u32 = 17;
    const LOD_BIAS_SHIFT: u32 = 18; // 14 bits, s6.8

    // Word 1.
    const MIN_LOD_SHIFT: u32 = 0; // 12 bits, u4.8
    const MAX_LOD_SHIFT: u32 = 12;
    const COMPARE_ENABLE_BIT: u32 = 24;
    const COMPARE_OP_SHIFT: u32 = 25; // 3 bits
    const REDUCTION_SHIFT: u32 = 28; // 2 bits
    const PIXEL_COORD_BIT: u32 = 30;
    const LEGACY_CUBE_BIT: u32 = 31;

    fn set_bits(&mut self, word: usize, shift: u32, width: u32, value: u32) {
        let mask = ((1u32 << width) - 1) << shift;
        self.properties[word] = (self.properties[word] & !mask) | ((value << shift) & mask);
    }

    fn bits(&self, word: usize, shift: u32, width: u32) -> u32 {
        (self.properties[word] >> shift) & ((1 << width) - 1)
    }

    pub fn set_filter(&mut self, min: vk::Filter, mag: vk::Filter, mip: vk::SamplerMipmapMode) {
        self.set_bits(0, Self::MIN_FILTER_BIT, 1, min.as_raw() as u32);
        self.set_bits(0, Self::MAG_FILTER_BIT, 1, mag.as_raw() as u32);
        self.set_bits(0, Self::MIP_MODE_BIT, 1, mip.as_raw() as u32);
    }

    pub fn set_anisotropy(&mut self, anisotropy: u32) {
        self.set_bits(0, Self::ANISOTROPY_SHIFT, 5, anisotropy.min(16));
    }

    pub fn set_address_modes(
        &mut self,
        u: vk::SamplerAddressMode,
        v: vk::SamplerAddressMode,
        w: vk::SamplerAddressMode,
    ) {
        self.set_bits(0, Self::ADDRESS_U_SHIFT, 3, u.as_raw() as u32);
        self.set_bits(0, Self::ADDRESS_V_SHIFT, 3, v.as_raw() as u32);
        self.set_bits(0, Self::ADDRESS_W_SHIFT, 3, w.as_raw() as u32);

        let has_border = [u, v, w]
            .iter()
            .any(|&mode| mode == vk::SamplerAddressMode::CLAMP_TO_BORDER);
        self.set_bits(0, Self::HAS_BORDER_BIT, 1, has_border as u32);
    }

    pub fn set_lod_range(&mut self, min: f32, max: f32, bias: f32) {
        self.set_bits(1, Self::MIN_LOD_SHIFT, 12, encode_fixed(min, false, 4, 8));
        self.set_bits(
            1,
            Self::MAX_LOD_SHIFT,
            12,
            encode_fixed(max.max(min), false, 4, 8),
        );
        self.set_bits(0, Self::LOD_BIAS_SHIFT, 14, encode_fixed(bias, true, 6, 8));
    }

    pub fn set_depth_compare(&mut self, enable: bool, op: vk::CompareOp) {
        self.set_bits(1, Self::COMPARE_ENABLE_BIT, 1, enable as u32);
        self.set_bits(
            1,
            Self::COMPARE_OP_SHIFT,
            3,
            if enable { op.as_raw() as u32 } else { 0 },
        );
    }

    pub fn set_reduction(&mut self, reduction: vk::SamplerReductionMode) {
        self.set_bits(1, Self::REDUCTION_SHIFT, 2, reduction.as_raw() as u32);
    }

    pub fn set_pixel_coordinates(&mut self, enable: bool) {
        self.set_bits(1, Self::PIXEL_COORD_BIT, 1, enable as u32);
    }

    pub fn set_legacy_cube_filter(&mut self, enable: bool) {
        self.set_bits(1, Self::LEGACY_CUBE_BIT, 1, enable as u32);
    }

    pub fn set_border_color(&mut self, color: [f32; 4]) {
        self.border_color = color.map(f32::to_bits);
    }

    fn has_border(&self) -> bool {
        self.bits(0, Self::HAS_BORDER_BIT, 1) != 0
    }

    fn border_color_f32(&self) -> [f32; 4] {
        self.border_color.map(f32::from_bits)
    }

    fn compare_enable(&self) -> bool {
        self.bits(1, Self::COMPARE_ENABLE_BIT, 1) != 0
    }

    fn build_create_info(&self) -> vk::SamplerCreateInfo {
        // VK_SAMPLER_CREATE_NON_SEAMLESS_CUBE_MAP_BIT_EXT
        const NON_SEAMLESS_CUBE_MAP: vk::SamplerCreateFlags =
            vk::SamplerCreateFlags::from_raw(0x4);

        let mut flags = vk::SamplerCreateFlags::empty();

        if self.bits(1, Self::LEGACY_CUBE_BIT, 1) != 0 {
            flags |= NON_SEAMLESS_CUBE_MAP;
        }

        let anisotropy = self.bits(0, Self::ANISOTROPY_SHIFT, 5);

        vk::SamplerCreateInfo::builder()
            .flags(flags)
            .mag_filter(vk::Filter::from_raw(
                self.bits(0, Self::MAG_FILTER_BIT, 1) as i32
            ))
            .min_filter(vk::Filter::from_raw(
                self.bits(0, Self::MIN_FILTER_BIT, 1) as i32
            ))
            .mipmap_mode(vk::SamplerMipmapMode::from_raw(
                self.bits(0, Self::MIP_MODE_BIT, 1) as i32,
            ))
            .address_mode_u(vk::SamplerAddressMode::from_raw(
                self.bits(0, Self::ADDRESS_U_SHIFT, 3) as i32,
            ))
            .address_mode_v(vk::SamplerAddressMode::from_raw(
                self.bits(0, Self::ADDRESS_V_SHIFT, 3) as i32,
            ))
            .address_mode_w(vk::SamplerAddressMode::from_raw(
                self.bits(0, Self::ADDRESS_W_SHIFT, 3) as i32,
            ))
            .mip_lod_bias(decode_fixed(
                self.bits(0, Self::LOD_BIAS_SHIFT, 14),
                true,
                6,
                8,
            ))
            .anisotropy_enable(anisotropy > 0)
            .max_anisotropy(anisotropy as f32)
            .compare_enable(self.compare_enable())
            .compare_op(vk::CompareOp::from_raw(
                self.bits(1, Self::COMPARE_OP_SHIFT, 3) as i32,
            ))
            .min_lod(decode_fixed(
                self.bits(1, Self::MIN_LOD_SHIFT, 12),
                false,
                4,
                8,
            ))
            .max_lod(decode_fixed(
                self.bits(1, Self::MAX_LOD_SHIFT, 12),
                false,
                4,
                8,
            ))
            .unnormalized_coordinates(self.bits(1, Self::PIXEL_COORD_BIT, 1) != 0)
            .build()
    }

    /// Finds the closest standard border color for this key.
    fn border_color_type(&self, supports_custom: bool) -> (vk::BorderColor, [f32; 4]) {
        const STANDARD: [([f32; 4], vk::BorderColor); 3] = [
            ([0.0, 0.0, 0.0, 0.0], vk::BorderColor::FLOAT_TRANSPARENT_BLACK),
            ([0.0, 0.0, 0.0, 1.0], vk::BorderColor::FLOAT_OPAQUE_BLACK),
            ([1.0, 1.0, 1.0, 1.0], vk::BorderColor::FLOAT_OPAQUE_WHITE),
        ];

        let color = self.border_color_f32();

        // Depth-compare samplers only use the first component.
        let component_count = if self.compare_enable() { 1 } else { 4 };

        for (reference, border) in STANDARD {
            if color[..component_count] == reference[..component_count] {
                return (border, color);
            }
        }

        if supports_custom {
            return (vk::BorderColor::FLOAT_CUSTOM_EXT, color);
        }

        // Fall back to the closest standard color by sum of absolute
        // differences; some legacy content relies on this.
        log::warn!("Custom border colors not supported");

        let mut best = vk::BorderColor::FLOAT_TRANSPARENT_BLACK;
        let mut best_sad = f32::MAX;

        for (reference, border) in STANDARD {
            let sad: f32 = color[..component_count]
                .iter()
                .zip(&reference[..component_count])
                .map(|(a, b)| (a - b).abs())
                .sum();

            if sad < best_sad {
                best_sad = sad;
                best = border;
            }
        }

        (best, color)
    }
}

impl PartialEq for SamplerKey {
    fn eq(&self, other: &Self) -> bool {
        self.properties == other.properties
            && (!self.has_border() || self.border_color == other.border_color)
    }
}

impl Eq for SamplerKey {}

impl std::hash::Hash for SamplerKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.properties.hash(state);

        if self.has_border() {
            self.border_color.hash(state);
        }
    }
}

/// Sampler statistics; may be out of date immediately.
#[derive(Clone, Copy, Debug, Default)]
pub struct SamplerStats {
    pub total_count: u32,
    pub live_count: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct LruLink {
    prev: i32,
    next: i32,
}

impl Default for LruLink {
    fn default() -> Self {
        Self { prev: -1, next: -1 }
    }
}

/// Doubly-linked LRU list threaded through a fixed slot array by index.
/// Signed indices avoid ABA issues; -1 is the list end.
#[derive(Clone, Copy, Debug)]
struct LruList {
    head: i32,
    tail: i32,
}

impl LruList {
    fn new() -> Self {
        Self { head: -1, tail: -1 }
    }

    fn append(&mut self, links: &mut [LruLink], index: i32) {
        links[index as usize] = LruLink {
            prev: self.tail,
            next: -1,
        };

        if self.tail >= 0 {
            links[self.tail as usize].next = index;
        } else {
            self.head = index;
        }

        self.tail = index;
    }

    fn remove(&mut self, links: &mut [LruLink], index: i32) {
        let link = links[index as usize];

        if link.prev >= 0 {
            links[link.prev as usize].next = link.next;
        } else if self.head == index {
            self.head = link.next;
        }

        if link.next >= 0 {
            links[link.next as usize].prev = link.prev;
        } else if self.tail == index {
            self.tail = link.prev;
        }

        links[index as usize] = LruLink::default();
    }

    fn contains(&self, links: &[LruLink], index: i32) -> bool {
        links[index as usize].prev >= 0 || self.head == index
    }
}

struct SamplerObject {
    key: SamplerKey,
    handle: vk::Sampler,
}

struct PoolInner {
    objects: Vec<Option<SamplerObject>>,
    links: Vec<LruLink>,
    lru: LruList,
    lut: FastHashMap<SamplerKey, i32>,
}

struct SamplerPoolShared {
    device: Arc<DeviceShared>,
    inner: Mutex<PoolInner>,
    /// Per-slot reference counts; modified lock-free, transitions to and
    /// from zero are validated under the pool lock.
    ref_counts: Box<[AtomicU32]>,
    tracking_ids: Box<[AtomicU64]>,

    samplers_live: AtomicU32,
    samplers_total: AtomicU32,
}

impl Drop for SamplerPoolShared {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();

        for object in inner.objects.iter().flatten() {
            unsafe { self.device.raw.destroy_sampler(object.handle, None) };
        }
    }
}

/// Reference to a pooled sampler.
pub struct SamplerRef {
    shared: Arc<SamplerPoolShared>,
    index: i32,
    handle: vk::Sampler,
}

impl SamplerRef {
    pub fn handle(&self) -> vk::Sampler {
        self.handle
    }

    /// Updates the submission tracking ID. Returns `false` if the
    /// sampler was already tracked with this ID.
    pub fn track_id(&self, tracking_id: u64) -> bool {
        self.shared.tracking_ids[self.index as usize].fetch_max(tracking_id, Ordering::Relaxed)
            < tracking_id
    }
}

impl Clone for SamplerRef {
    fn clone(&self) -> Self {
        self.shared.ref_counts[self.index as usize].fetch_add(1, Ordering::Acquire);
        Self {
            shared: Arc::clone(&self.shared),
            index: self.index,
            handle: self.handle,
        }
    }
}

impl Drop for SamplerRef {
    fn drop(&mut self) {
        let count = &self.shared.ref_counts[self.index as usize];

        if count.fetch_sub(1, Ordering::Release) == 1 {
            self.shared.release_sampler(self.index);
        }
    }
}

impl SamplerPoolShared {
    fn release_sampler(&self, index: i32) {
        let mut inner = self.inner.lock();

        // The live counter is re-incremented when the sampler is
        // reacquired.
        self.samplers_live.fetch_sub(1, Ordering::Relaxed);

        // Back off if another thread has reacquired the sampler; the
        // count can only leave zero while the pool is locked.
        if self.ref_counts[index as usize].load(Ordering::Relaxed) != 0 {
            return;
        }

        // Two releasing threads can both observe zero; only add the
        // sampler to the LRU list once.
        let inner = &mut *inner;

        if inner.lru.contains(&inner.links, index) {
            return;
        }

        inner.lru.append(&mut inner.links, index);
    }
}

/// Manages unique samplers within a device.
pub struct SamplerPool {
    shared: Arc<SamplerPoolShared>,
    /// Persistent reference that keeps the default sampler from being
    /// recycled.
    default_sampler: Option<SamplerRef>,
}

impl SamplerPool {
    pub fn new(device: Arc<DeviceShared>) -> Self {
        let count = MAX_SAMPLER_COUNT as usize;

        let mut inner = PoolInner {
            objects: Vec::with_capacity(count),
            links: vec![LruLink::default(); count],
            lru: LruList::new(),
            lut: FastHashMap::default(),
        };

        inner.objects.resize_with(count, || None);

        // The LRU list doubles as the free list for fresh slots.
        for index in 0..count as i32 {
            inner.lru.append(&mut inner.links, index);
        }

        let shared = Arc::new(SamplerPoolShared {
            device,
            inner: Mutex::new(inner),
            ref_counts: (0..count).map(|_| AtomicU32::new(0)).collect(),
            tracking_ids: (0..count).map(|_| AtomicU64::new(0)).collect(),
            samplers_live: AtomicU32::new(0),
            samplers_total: AtomicU32::new(0),
        });

        let mut pool = Self {
            shared,
            default_sampler: None,
        };

        // Default sampler, used for null descriptors and as a fallback
        // when sampler creation fails.
        let mut default_key = SamplerKey::default();
        default_key.set_filter(
            vk::Filter::LINEAR,
            vk::Filter::LINEAR,
            vk::SamplerMipmapMode::LINEAR,
        );
        default_key.set_lod_range(-256.0, 256.0, 0.0);
        default_key.set_address_modes(
            vk::SamplerAddressMode::CLAMP_TO_EDGE,
            vk::SamplerAddressMode::CLAMP_TO_EDGE,
            vk::SamplerAddressMode::CLAMP_TO_EDGE,
        );
        default_key.set_reduction(vk::SamplerReductionMode::WEIGHTED_AVERAGE);

        pool.default_sampler = pool.create_sampler(&default_key);
        pool
    }

    /// Creates or retrieves the sampler for the given key.
    ///
    /// Returns the default sampler if every pooled sampler is currently
    /// referenced.
    pub fn create_sampler(&self, key: &SamplerKey) -> Option<SamplerRef> {
        let shared = &self.shared;
        let mut inner = shared.inner.lock();
        let inner = &mut *inner;

        if let Some(&index) = inner.lut.get(key) {
            // Remove the sampler from the LRU list if it is in there. A
            // releasing thread may not have appended it yet, in which
            // case there is nothing to remove.
            if shared.ref_counts[index as usize].fetch_add(1, Ordering::Acquire) == 0 {
                if inner.lru.contains(&inner.links, index) {
                    inner.lru.remove(&mut inner.links, index);
                }

                shared.samplers_live.fetch_add(1, Ordering::Relaxed);
            }

            let handle = inner.objects[index as usize].as_ref().unwrap().handle;

            return Some(SamplerRef {
                shared: Arc::clone(shared),
                index,
                handle,
            });
        }

        // All samplers are referenced; fall back to the default one.
        if inner.lru.head < 0 {
            log::error!("Failed to allocate sampler, using default one.");
            return self.default_sampler.clone();
        }

        // Use the least recently used slot; destroy the sampler that
        // previously lived there.
        let index = inner.lru.head;

        if let Some(object) = inner.objects[index as usize].take() {
            inner.lut.remove(&object.key);
            unsafe { shared.device.raw.destroy_sampler(object.handle, None) };
            shared.samplers_total.fetch_sub(1, Ordering::Relaxed);
        }

        inner.lru.remove(&mut inner.links, index);

        let handle = match self.create_vk_sampler(key) {
            Some(handle) => handle,
            None => {
                // Keep the slot reusable.
                inner.lru.append(&mut inner.links, index);
                return self.default_sampler.clone();
            }
        };

        inner.objects[index as usize] = Some(SamplerObject { key: *key, handle });
        inner.lut.insert(*key, index);

        shared.ref_counts[index as usize].store(1, Ordering::Release);
        shared.tracking_ids[index as usize].store(0, Ordering::Relaxed);
        shared.samplers_live.fetch_add(1, Ordering::Relaxed);
        shared.samplers_total.fetch_add(1, Ordering::Relaxed);

        Some(SamplerRef {
            shared: Arc::clone(shared),
            index,
            handle,
        })
    }

    pub fn stats(&self) -> SamplerStats {
        SamplerStats {
            total_count: self.shared.samplers_total.load(Ordering::Relaxed),
            live_count: self.shared.samplers_live.load(Ordering::Relaxed),
        }
    }

    fn create_vk_sampler(&self, key: &SamplerKey) -> Option<vk::Sampler> {
        let device = &self.shared.device;

        let mut info = key.build_create_info();

        if !device.features.sampler_anisotropy {
            info.anisotropy_enable = vk::FALSE;
        }

        let mut border_color_info = vk::SamplerCustomBorderColorCreateInfoEXT::default();

        if key.has_border() {
            let (border, color) = key.border_color_type(device.features.custom_border_colors);
            info.border_color = border;

            if border == vk::BorderColor::FLOAT_CUSTOM_EXT {
                border_color_info.custom_border_color = vk::ClearColorValue { float32: color };
                border_color_info.p_next = std::mem::replace(
                    &mut info.p_next,
                    &mut border_color_info as *mut _ as *const std::ffi::c_void,
                );
            }
        }

        let mut reduction_info = vk::SamplerReductionModeCreateInfo::builder()
            .reduction_mode(vk::SamplerReductionMode::from_raw(
                key.bits(1, SamplerKey::REDUCTION_SHIFT, 2) as i32,
            ))
            .build();

        if reduction_info.reduction_mode != vk::SamplerReductionMode::WEIGHTED_AVERAGE {
            reduction_info.p_next = std::mem::replace(
                &mut info.p_next,
                &mut reduction_info as *mut _ as *const std::ffi::c_void,
            );
        }

        match unsafe { device.raw.create_sampler(&info, None) } {
            Ok(handle) => Some(handle),
            Err(vr) => {
                log::error!("Failed to create sampler object: {vr:?}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_packing_round_trip() {
        let mut key = SamplerKey::default();
        key.set_filter(
            vk::Filter::NEAREST,
            vk::Filter::LINEAR,
            vk::SamplerMipmapMode::LINEAR,
        );
        key.set_anisotropy(16);
        key.set_address_modes(
            vk::SamplerAddressMode::REPEAT,
            vk::SamplerAddressMode::CLAMP_TO_EDGE,
            vk::SamplerAddressMode::MIRRORED_REPEAT,
        );
        key.set_lod_range(0.25, 12.0, -1.5);
        key.set_depth_compare(true, vk::CompareOp::LESS_OR_EQUAL);

        let info = key.build_create_info();

        assert_eq!(info.min_filter, vk::Filter::NEAREST);
        assert_eq!(info.mag_filter, vk::Filter::LINEAR);
        assert_eq!(info.mipmap_mode, vk::SamplerMipmapMode::LINEAR);
        assert_eq!(info.max_anisotropy, 16.0);
        assert_eq!(info.address_mode_u, vk::SamplerAddressMode::REPEAT);
        assert_eq!(info.address_mode_v, vk::SamplerAddressMode::CLAMP_TO_EDGE);
        assert_eq!(info.address_mode_w, vk::SamplerAddressMode::MIRRORED_REPEAT);
        assert_eq!(info.min_lod, 0.25);
        assert_eq!(info.max_lod, 12.0);
        assert_eq!(info.mip_lod_bias, -1.5);
        assert_eq!(info.compare_enable, vk::TRUE);
        assert_eq!(info.compare_op, vk::CompareOp::LESS_OR_EQUAL);
    }

    #[test]
    fn border_color_only_matters_with_border_modes() {
        let mut a = SamplerKey::default();
        a.set_address_modes(
            vk::SamplerAddressMode::REPEAT,
            vk::SamplerAddressMode::REPEAT,
            vk::SamplerAddressMode::REPEAT,
        );
        let mut b = a;

        a.set_border_color([1.0, 0.0, 0.0, 1.0]);
        assert_eq!(a, b);

        a.set_address_modes(
            vk::SamplerAddressMode::CLAMP_TO_BORDER,
            vk::SamplerAddressMode::REPEAT,
            vk::SamplerAddressMode::REPEAT,
        );
        b.set_address_modes(
            vk::SamplerAddressMode::CLAMP_TO_BORDER,
            vk::SamplerAddressMode::REPEAT,
            vk::SamplerAddressMode::REPEAT,
        );
        assert_ne!(a, b);

        b.set_border_color([1.0, 0.0, 0.0, 1.0]);
        assert_eq!(a, b);
    }

    #[test]
    fn standard_border_colors_are_recognized() {
        let mut key = SamplerKey::default();
        key.set_address_modes(
            vk::SamplerAddressMode::CLAMP_TO_BORDER,
            vk::SamplerAddressMode::CLAMP_TO_BORDER,
            vk::SamplerAddressMode::CLAMP_TO_BORDER,
        );

        key.set_border_color([0.0, 0.0, 0.0, 1.0]);
        assert_eq!(
            key.border_color_type(true).0,
            vk::BorderColor::FLOAT_OPAQUE_BLACK
        );

        key.set_border_color([0.5, 0.5, 0.5, 1.0]);
        assert_eq!(
            key.border_color_type(true).0,
            vk::BorderColor::FLOAT_CUSTOM_EXT
        );

        // Without custom border colors, the closest standard color wins.
        key.set_border_color([0.9, 0.9, 0.9, 1.0]);
        assert_eq!(
            key.border_color_type(false).0,
            vk::BorderColor::FLOAT_OPAQUE_WHITE
        );
    }

    // LRU behavior for the eviction scenario: with capacity 4, samplers
    // A..D acquired, D and A released in that order, the next eviction
    // must pick D, and A must remain reachable.
    #[test]
    fn lru_eviction_order() {
        let mut links = vec![LruLink::default(); 4];
        let mut lru = LruList::new();

        // Fresh pool: all slots unreferenced.
        for i in 0..4 {
            lru.append(&mut links, i);
        }

        // A..D acquired.
        for i in 0..4 {
            lru.remove(&mut links, i);
        }
        assert_eq!(lru.head, -1);

        // Release D, then A.
        lru.append(&mut links, 3);
        lru.append(&mut links, 0);

        // Creating E evicts the LRU head, which must be D.
        assert_eq!(lru.head, 3);
        lru.remove(&mut links, 3);

        // A is still present and would be reacquired, not evicted.
        assert!(lru.contains(&links, 0));
        assert_eq!(lru.head, 0);
    }

    #[test]
    fn lru_removal_from_middle() {
        let mut links = vec![LruLink::default(); 3];
        let mut lru = LruList::new();

        for i in 0..3 {
            lru.append(&mut links, i);
        }

        lru.remove(&mut links, 1);
        assert_eq!(lru.head, 0);
        assert_eq!(links[0].next, 2);
        assert_eq!(links[2].prev, 0);

        lru.remove(&mut links, 0);
        assert_eq!(lru.head, 2);
        lru.remove(&mut links, 2);
        assert_eq!(lru.head, -1);
        assert_eq!(lru.tail, -1);
    }

    #[test]
    fn fixed_point_round_trip() {
        for value in [0.0f32, 0.25, 1.0, 12.5, 15.996] {
            let encoded = encode_fixed(value, false, 4, 8);
            assert!((decode_fixed(encoded, false, 4, 8) - value).abs() < 1.0 / 256.0);
        }

        for value in [-31.5f32, -1.0, 0.0, 1.5, 31.0] {
            let encoded = encode_fixed(value, true, 6, 8);
            assert!((decode_fixed(encoded, true, 6, 8) - value).abs() < 1.0 / 256.0);
        }
    }
}
