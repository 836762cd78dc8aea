/*!
# GPU resource and submission core.

Implements command-buffer-oriented, implicitly synchronized resource
semantics on top of explicit Vulkan: memory suballocation with global
buffers, reference-counted resources with lazy view caches, hazard
tracking with batched pipeline barriers, sparse binding, a bounded
sampler pool, timeline-semaphore fences, a serialized submission queue
and latency-based frame pacing.

## Threading

Application threads record work and create resources freely. One
submission thread owns the device queue; a memory-allocator worker trims
unused chunks; each fence runs a worker that dispatches value callbacks.
The frame pacer blocks the application thread on timing data published
by the submission thread.
*/

#![allow(
    // We don't use syntax sugar where it's not necessary.
    clippy::match_like_matches_macro,
    // Explicit lifetimes are often easier to reason about.
    clippy::needless_lifetimes,
    // No need for defaults in the internal types.
    clippy::new_without_default,
    // Need many arguments for some core functions to be able to re-use code in many situations.
    clippy::too_many_arguments,
)]

mod alloc;
pub mod barrier;
pub mod buffer;
pub mod command;
pub mod device;
pub mod fence;
pub mod image;
pub mod latency;
pub mod memory;
pub mod queue;
pub mod resource;
pub mod sampler;
pub mod sparse;

use ash::vk;

/// Resource access kind used for hazard and lifetime tracking.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum Access {
    #[default]
    None = 0,
    Read = 1,
    Write = 2,
}

/// Amount of device memory allocated and used on a heap.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub allocated: u64,
    pub used: u64,
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum DeviceError {
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Device is lost")]
    Lost,
    #[error("Resource creation failed: {0}")]
    ResourceCreation(&'static str),
    #[error("Shader compilation failed")]
    ShaderCompilation,
}

impl From<vk::Result> for DeviceError {
    fn from(result: vk::Result) -> Self {
        #![allow(unreachable_code)]
        match result {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
                #[cfg(feature = "oom_panic")]
                panic!("Out of memory ({result:?})");

                Self::OutOfMemory
            }
            vk::Result::ERROR_DEVICE_LOST => {
                #[cfg(feature = "device_lost_panic")]
                panic!("Device lost");

                Self::Lost
            }
            _ => {
                log::warn!("Unrecognized device error {result:?}");
                Self::Lost
            }
        }
    }
}

impl From<prism::ShaderError> for DeviceError {
    fn from(error: prism::ShaderError) -> Self {
        log::error!("{error}");
        Self::ShaderCompilation
    }
}

/// Fast hash map used internally.
type FastHashMap<K, V> = rustc_hash::FxHashMap<K, V>;

pub(crate) fn align_u64(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

#[test]
fn test_align() {
    assert_eq!(align_u64(0, 256), 0);
    assert_eq!(align_u64(1, 256), 256);
    assert_eq!(align_u64(256, 256), 256);
    assert_eq!(align_u64(257, 256), 512);
}
