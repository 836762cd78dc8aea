/*! Shader compiler for the veneer translation layer.

Shaders arrive from the client API as an opaque converter object that knows
how to populate an IR [`ir::Builder`]. The first time metadata, layout or
code is requested, the IR is built, the source binding model is lowered onto
the Vulkan-facing model (sampler heap, push-data counters, fixed descriptor
set indices), and the result is serialized into an opaque blob that the
on-disk [`cache`] can persist.

Code generation happens per pipeline: [`IrShader::get_code`] deserializes
the blob, applies link-time fix-ups and emits SPIR-V.
*/

mod arena;

pub mod cache;
pub mod ir;
pub mod lower;
pub mod spv;

pub use arena::{Arena, Handle};

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use parking_lot::Mutex;
use smallvec::SmallVec;

/// Limits of the push-data layout shared between all shader stages.
pub mod limits {
    /// Size of the push-data block shared by all stages, in bytes.
    pub const MAX_SHARED_PUSH_DATA_SIZE: u32 = 64;
    /// Size of the per-stage push-data block, in bytes.
    pub const MAX_PER_STAGE_PUSH_DATA_SIZE: u32 = 64;
    /// Descriptor set index for each resource kind.
    pub const SET_SAMPLER: u8 = 0;
    pub const SET_CBV: u8 = 1;
    pub const SET_SRV: u8 = 2;
    pub const SET_UAV: u8 = 3;
    pub const SET_UAV_COUNTER: u8 = 4;
}

#[derive(Debug, thiserror::Error)]
pub enum ShaderError {
    #[error("shader conversion failed: {0}")]
    Conversion(String),
    #[error("binding model lowering failed: {0}")]
    Lowering(String),
    #[error("SPIR-V emission failed: {0}")]
    Backend(String),
    #[error("failed to deserialize shader IR: {0}")]
    Deserialize(String),
}

/// Shader stage. Discriminants match `VkShaderStageFlagBits` so that the
/// conversion in the core crate is a plain cast.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum ShaderStage {
    #[default]
    Vertex = 0x01,
    TessControl = 0x02,
    TessEval = 0x04,
    Geometry = 0x08,
    Fragment = 0x10,
    Compute = 0x20,
}

impl ShaderStage {
    pub fn from_bits(bits: u32) -> Option<Self> {
        Some(match bits {
            0x01 => Self::Vertex,
            0x02 => Self::TessControl,
            0x04 => Self::TessEval,
            0x08 => Self::Geometry,
            0x10 => Self::Fragment,
            0x20 => Self::Compute,
            _ => return None,
        })
    }

    /// Index of the stage's per-stage push data block.
    pub fn index(self) -> u32 {
        (self as u32).trailing_zeros()
    }
}

bitflags::bitflags! {
    /// Mask of shader stages, bit-compatible with `VkShaderStageFlags`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct StageMask: u32 {
        const VERTEX = 0x01;
        const TESS_CONTROL = 0x02;
        const TESS_EVAL = 0x04;
        const GEOMETRY = 0x08;
        const FRAGMENT = 0x10;
        const COMPUTE = 0x20;
    }
}

impl From<ShaderStage> for StageMask {
    fn from(stage: ShaderStage) -> Self {
        StageMask::from_bits_truncate(stage as u32)
    }
}

bitflags::bitflags! {
    /// Compile options that affect IR legalization and lowering.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct CompileFlags: u32 {
        const LOWER_SIN_COS = 1 << 0;
        const LOWER_F32_TO_F16 = 1 << 1;
        const DISABLE_MSAA = 1 << 2;
        const SUPPORTS_16BIT_PUSH_DATA = 1 << 3;
        const ENABLE_SAMPLE_RATE_SHADING = 1 << 4;
        const INSERT_RESOURCE_BARRIERS = 1 << 5;
        const INSERT_SHARED_MEMORY_BARRIERS = 1 << 6;
        const TYPED_R32_LOAD_REQUIRES_FORMAT = 1 << 7;
    }
}

bitflags::bitflags! {
    /// Float control features supported by the device, per float width.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct FloatControlFlags: u32 {
        const INDEPENDENT_DENORM_MODE = 1 << 0;
        const RTE_16 = 1 << 1;
        const RTE_32 = 1 << 2;
        const RTE_64 = 1 << 3;
        const RTZ_16 = 1 << 4;
        const RTZ_32 = 1 << 5;
        const RTZ_64 = 1 << 6;
        const DENORM_FLUSH_16 = 1 << 7;
        const DENORM_FLUSH_32 = 1 << 8;
        const DENORM_FLUSH_64 = 1 << 9;
        const DENORM_PRESERVE_16 = 1 << 10;
        const DENORM_PRESERVE_32 = 1 << 11;
        const DENORM_PRESERVE_64 = 1 << 12;
        const SZ_INF_NAN_PRESERVE_16 = 1 << 13;
        const SZ_INF_NAN_PRESERVE_32 = 1 << 14;
        const SZ_INF_NAN_PRESERVE_64 = 1 << 15;
    }
}

/// Fixed-size compile-options record. Written verbatim into the cache
/// look-up table, so the field set and order are part of the file format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct ShaderOptions {
    pub flags: CompileFlags,
    pub float_controls: FloatControlFlags,
    pub max_uniform_buffer_size: u32,
    pub min_storage_buffer_alignment: u32,
    /// Offset of the device-wide sample count dword in the shared
    /// push-data block.
    pub sample_count_push_data_offset: u16,
    pub reserved: u16,
}

/// Transform feedback capture entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct XfbEntry {
    pub semantic_name: String,
    pub semantic_index: u32,
    pub component_mask: u32,
    pub stream: u32,
    pub buffer: u32,
    pub offset: u32,
    pub stride: u32,
}

/// Properties that select a unique compiled variant of a shader.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct ShaderCreateInfo {
    pub options: ShaderOptions,
    /// Mask of user input locations to enable flat shading for.
    pub flat_shading_inputs: u32,
    /// Rasterized geometry stream.
    pub rasterized_stream: i32,
    pub xfb_entries: Vec<XfbEntry>,
}

/// Built-in shader inputs and outputs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BuiltIn {
    Position = 1,
    VertexId,
    InstanceId,
    PrimitiveId,
    FragCoord,
    FragDepth,
    SampleId,
    SampleMask,
    SampleCount,
    FragCoverage,
    Layer,
    ViewportIndex,
    TessCoord,
    ClipDistance,
    CullDistance,
    WorkgroupId,
    LocalInvocationId,
    GlobalInvocationId,
    StencilRef,
}

impl BuiltIn {
    pub fn from_u8(raw: u8) -> Option<Self> {
        (raw >= Self::Position as u8 && raw <= Self::StencilRef as u8)
            .then(|| unsafe { std::mem::transmute(raw) })
    }
}

/// One input or output variable of a shader.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct IoVar {
    pub builtin: Option<BuiltIn>,
    pub location: u8,
    pub component_index: u8,
    pub component_count: u8,
    pub patch_constant: bool,
    pub semantic_index: u32,
    pub semantic_name: String,
}

/// Ordered set of I/O variables for one interface of a shader.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct IoMap {
    vars: SmallVec<[IoVar; 8]>,
}

impl IoMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, var: IoVar) {
        self.vars.push(var);
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn vars(&self) -> &[IoVar] {
        &self.vars
    }

    /// Bit mask of user locations used by this interface.
    pub fn location_mask(&self) -> u32 {
        self.vars
            .iter()
            .filter(|v| v.builtin.is_none())
            .fold(0u32, |mask, v| mask | (1 << v.location))
    }

    /// Checks whether `inputs` of `stage` can consume `outputs` of
    /// `prev_stage` without remapping.
    pub fn check_stage_compatibility(
        stage: ShaderStage,
        inputs: &IoMap,
        prev_stage: ShaderStage,
        outputs: &IoMap,
    ) -> bool {
        let _ = (stage, prev_stage);
        let produced = outputs.location_mask();
        inputs.location_mask() & !produced == 0
    }
}

/// Input and output primitive topologies for geometry-ish stages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum PrimitiveTopology {
    #[default]
    Undefined = 0,
    PointList,
    LineList,
    LineStrip,
    TriangleList,
    TriangleStrip,
    LineListAdjacent,
    TriangleListAdjacent,
    PatchList,
}

impl PrimitiveTopology {
    pub fn from_u8(raw: u8) -> Option<Self> {
        (raw <= Self::PatchList as u8).then(|| unsafe { std::mem::transmute(raw) })
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct MetadataFlags: u32 {
        const HAS_SAMPLE_RATE_SHADING = 1 << 0;
        const EXPORTS_STENCIL_REF = 1 << 1;
        const EXPORTS_VIEWPORT_INDEX = 1 << 2;
        const USES_SPARSE_FEEDBACK = 1 << 3;
        const USES_SAMPLER_HEAP = 1 << 4;
    }
}

/// Shader metadata required by pipeline construction, independent of the
/// serialized IR.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ShaderMetadata {
    pub stage: ShaderStage,
    pub flags: MetadataFlags,
    pub spec_constant_mask: u32,
    pub inputs: IoMap,
    pub outputs: IoMap,
    pub input_topology: PrimitiveTopology,
    pub output_topology: PrimitiveTopology,
    pub flat_shading_inputs: u32,
    pub rasterized_stream: i32,
    pub patch_vertex_count: u32,
    pub xfb_strides: [u32; 4],
}

/// Descriptor kinds exposed by the binding model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DescriptorType {
    Sampler = 0,
    UniformBuffer,
    StorageBuffer,
    SampledImage,
    StorageImage,
    UniformTexelBuffer,
    StorageTexelBuffer,
}

impl DescriptorType {
    pub fn from_u8(raw: u8) -> Option<Self> {
        (raw <= Self::StorageTexelBuffer as u8).then(|| unsafe { std::mem::transmute(raw) })
    }
}

/// One descriptor binding of the pipeline layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BindingInfo {
    pub stages: StageMask,
    pub descriptor_type: DescriptorType,
    pub set: u8,
    pub binding: u32,
    pub count: u32,
    /// Client-API resource index the binding was derived from.
    pub resource_index: u32,
}

/// One push-data block of the pipeline layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct PushDataBlock {
    pub stages: StageMask,
    pub offset: u32,
    pub size: u32,
    pub alignment: u32,
    /// Bit per dword that holds a resource reference rather than raw data.
    pub resource_dword_mask: u32,
}

/// Sampler-heap binding reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SamplerHeapBinding {
    pub stages: StageMask,
    pub set: u8,
    pub binding: u32,
}

/// Accumulates the pipeline-layout inputs of one shader: push-data blocks,
/// descriptor bindings and sampler-heap references. Layout builders from
/// multiple stages are merged by the pipeline manager.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PipelineLayoutBuilder {
    stage_mask: StageMask,
    push_data_mask: u32,
    push_data: SmallVec<[PushDataBlock; 2]>,
    bindings: Vec<BindingInfo>,
    sampler_heaps: SmallVec<[SamplerHeapBinding; 1]>,
}

impl PipelineLayoutBuilder {
    /// Push-data block index shared between all stages.
    pub const SHARED_PUSH_DATA_BLOCK: u32 = 0;

    pub fn new(stage_mask: StageMask) -> Self {
        Self {
            stage_mask,
            ..Default::default()
        }
    }

    pub fn stage_mask(&self) -> StageMask {
        self.stage_mask
    }

    pub fn push_data_mask(&self) -> u32 {
        self.push_data_mask
    }

    /// Block index for the per-stage push data of `stage`.
    pub fn per_stage_push_data_block(stage: ShaderStage) -> u32 {
        1 + stage.index()
    }

    /// Registers a push-data block at the given block index.
    pub fn add_push_data(&mut self, block_index: u32, block: PushDataBlock) {
        let bit = 1u32 << block_index;
        debug_assert_eq!(self.push_data_mask & bit, 0);

        let pos = (self.push_data_mask & (bit - 1)).count_ones() as usize;
        self.push_data.insert(pos, block);
        self.push_data_mask |= bit;
    }

    /// Retrieves the push-data block at a given block index, if present.
    pub fn push_data_block(&self, block_index: u32) -> Option<&PushDataBlock> {
        let bit = 1u32 << block_index;

        if self.push_data_mask & bit == 0 {
            return None;
        }

        let pos = (self.push_data_mask & (bit - 1)).count_ones() as usize;
        Some(&self.push_data[pos])
    }

    pub fn push_data_blocks(&self) -> impl Iterator<Item = (u32, &PushDataBlock)> {
        let mask = self.push_data_mask;
        self.push_data.iter().scan(mask, |mask, block| {
            let index = mask.trailing_zeros();
            *mask &= *mask - 1;
            Some((index, block))
        })
    }

    /// Adds descriptor bindings, merging duplicates. Aliased bindings
    /// (same set and binding index) only contribute their stage mask.
    pub fn add_bindings(&mut self, bindings: &[BindingInfo]) {
        for binding in bindings {
            if let Some(existing) = self
                .bindings
                .iter_mut()
                .find(|b| b.set == binding.set && b.binding == binding.binding)
            {
                existing.stages |= binding.stages;
                continue;
            }

            let pos = self
                .bindings
                .partition_point(|b| (b.set, b.binding) < (binding.set, binding.binding));
            self.bindings.insert(pos, *binding);
        }
    }

    pub fn bindings(&self) -> &[BindingInfo] {
        &self.bindings
    }

    pub fn add_sampler_heap(&mut self, binding: SamplerHeapBinding) {
        self.sampler_heaps.push(binding);
    }

    pub fn sampler_heap_bindings(&self) -> &[SamplerHeapBinding] {
        &self.sampler_heaps
    }
}

/// Maps the canonical (set, binding) pairs produced by the lowering pass
/// to the final pipeline layout, and relocates per-stage push data.
#[derive(Clone, Debug, Default)]
pub struct BindingMap {
    entries: rustc_hash::FxHashMap<(u8, u32), (u32, u32)>,
    push_data_offsets: [u32; 8],
}

impl BindingMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map(&mut self, from: (u8, u32), to: (u32, u32)) {
        self.entries.insert(from, to);
    }

    pub fn resolve(&self, set: u8, binding: u32) -> (u32, u32) {
        self.entries
            .get(&(set, binding))
            .copied()
            .unwrap_or((set as u32, binding))
    }

    pub fn set_push_data_offset(&mut self, block_index: u32, offset: u32) {
        self.push_data_offsets[block_index as usize] = offset;
    }

    pub fn push_data_offset(&self, block_index: u32) -> u32 {
        self.push_data_offsets[block_index as usize]
    }
}

/// Link-time state that affects code generation but not the cached IR.
#[derive(Clone, Debug, Default)]
pub struct ShaderLinkage {
    pub prev_stage: Option<ShaderStage>,
    pub prev_stage_outputs: IoMap,
    /// Geometry input topology of the pipeline.
    pub input_topology: PrimitiveTopology,
    pub fs_flat_shading: bool,
    pub fs_dual_src_blend: bool,
    /// Per render target component swizzle.
    pub rt_swizzles: [spv::OutputSwizzle; 8],
}

/// Client-API shader front-end.
///
/// The converter owns the source bytecode and produces IR on demand; it is
/// discarded once the IR has been built and serialized.
pub trait ShaderConverter: Send + Sync {
    /// Performs the initial conversion into the IR builder.
    fn convert_shader(&self, builder: &mut ir::Builder) -> Result<(), ShaderError>;

    /// Maps a source register to the internal resource index used as the
    /// descriptor binding within its set.
    fn determine_resource_index(
        &self,
        stage: ShaderStage,
        kind: ir::ResourceKind,
        register_space: u32,
        register_index: u32,
    ) -> u32;

    /// Queries the shader debug name.
    fn debug_name(&self) -> String;
}

struct IrShaderState {
    converter: Option<Arc<dyn ShaderConverter>>,
    ir: Vec<u8>,
    metadata: ShaderMetadata,
    layout: PipelineLayoutBuilder,
}

/// A shader in converted IR form.
///
/// Conversion from the source bytecode runs lazily on first access and is
/// skipped entirely for shaders restored from the on-disk cache.
pub struct IrShader {
    name: String,
    info: ShaderCreateInfo,
    converted: AtomicBool,
    state: Mutex<IrShaderState>,
}

impl IrShader {
    pub fn new(info: ShaderCreateInfo, converter: Arc<dyn ShaderConverter>) -> Self {
        Self {
            name: converter.debug_name(),
            info,
            converted: AtomicBool::new(false),
            state: Mutex::new(IrShaderState {
                converter: Some(converter),
                ir: Vec::new(),
                metadata: ShaderMetadata::default(),
                layout: PipelineLayoutBuilder::default(),
            }),
        }
    }

    /// Recreates a shader from cached state, skipping conversion.
    pub fn from_cached(
        name: String,
        info: ShaderCreateInfo,
        metadata: ShaderMetadata,
        layout: PipelineLayoutBuilder,
        ir: Vec<u8>,
    ) -> Self {
        Self {
            name,
            info,
            converted: AtomicBool::new(true),
            state: Mutex::new(IrShaderState {
                converter: None,
                ir,
                metadata,
                layout,
            }),
        }
    }

    pub fn debug_name(&self) -> &str {
        &self.name
    }

    pub fn create_info(&self) -> &ShaderCreateInfo {
        &self.info
    }

    pub fn metadata(&self) -> Result<ShaderMetadata, ShaderError> {
        self.convert_ir(Some("metadata()"))?;
        Ok(self.state.lock().metadata.clone())
    }

    pub fn layout(&self) -> Result<PipelineLayoutBuilder, ShaderError> {
        self.convert_ir(Some("layout()"))?;
        Ok(self.state.lock().layout.clone())
    }

    /// Forces conversion, e.g. for background compilation.
    pub fn compile(&self) -> Result<(), ShaderError> {
        self.convert_ir(None)
    }

    pub fn serialized_ir(&self) -> Result<Vec<u8>, ShaderError> {
        self.convert_ir(Some("serialized_ir()"))?;
        Ok(self.state.lock().ir.clone())
    }

    /// Produces the final SPIR-V binary for the given pipeline state.
    pub fn get_code(
        &self,
        bindings: Option<&BindingMap>,
        linkage: Option<&ShaderLinkage>,
    ) -> Result<Vec<u32>, ShaderError> {
        self.convert_ir(Some("get_code()"))?;

        let state = self.state.lock();

        let mut builder = ir::Builder::new();
        ir::deserialize(&state.ir, &mut builder)?;

        if let Some(linkage) = linkage {
            lower::apply_linkage(&mut builder, &state.metadata, &self.info, linkage);
        }

        let options = spv::Options::from_create_info(&self.info, linkage);
        let code = spv::emit(&builder, &state.metadata, bindings, &options)?;

        if let Some(path) = dump_path() {
            dump_spv(&path, &self.name, &code);
        }

        Ok(code)
    }

    fn convert_ir(&self, reason: Option<&str>) -> Result<(), ShaderError> {
        if self.converted.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut state = self.state.lock();

        if self.converted.load(Ordering::Relaxed) {
            return Ok(());
        }

        if let Some(reason) = reason {
            log::debug!("{}: early compile: {}", self.name, reason);
        }

        let converter = state
            .converter
            .take()
            .expect("unconverted shader without converter");

        let mut builder = ir::Builder::new();
        converter.convert_shader(&mut builder)?;

        let mut pass = lower::LowerBindingModel::new(&self.info, converter.as_ref());
        pass.run(&mut builder)?;

        state.metadata = pass.take_metadata();
        state.layout = pass.take_layout();
        state.ir = ir::serialize(&builder);

        self.converted.store(true, Ordering::Release);
        Ok(())
    }
}

fn dump_path() -> Option<String> {
    match std::env::var("DXVK_SHADER_DUMP_PATH") {
        Ok(path) if !path.is_empty() => Some(path),
        _ => None,
    }
}

fn dump_spv(dir: &str, name: &str, code: &[u32]) {
    let path = std::path::Path::new(dir).join(format!("{name}.spv"));

    let mut bytes = Vec::with_capacity(code.len() * 4);
    for word in code {
        bytes.extend_from_slice(&word.to_le_bytes());
    }

    if let Err(e) = std::fs::write(&path, bytes) {
        log::warn!("Failed to dump shader {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_data_block_ordering() {
        let mut layout = PipelineLayoutBuilder::new(StageMask::FRAGMENT);
        let stage_block = PushDataBlock {
            stages: StageMask::FRAGMENT,
            offset: limits::MAX_SHARED_PUSH_DATA_SIZE,
            size: 16,
            alignment: 4,
            resource_dword_mask: 0xf,
        };
        let shared_block = PushDataBlock {
            stages: StageMask::all(),
            offset: 0,
            size: 8,
            alignment: 4,
            resource_dword_mask: 0,
        };

        let fs_index = PipelineLayoutBuilder::per_stage_push_data_block(ShaderStage::Fragment);
        layout.add_push_data(fs_index, stage_block);
        layout.add_push_data(PipelineLayoutBuilder::SHARED_PUSH_DATA_BLOCK, shared_block);

        assert_eq!(layout.push_data_mask(), (1 << fs_index) | 1);
        assert_eq!(layout.push_data_block(0), Some(&shared_block));
        assert_eq!(layout.push_data_block(fs_index), Some(&stage_block));

        let collected: Vec<_> = layout.push_data_blocks().map(|(i, _)| i).collect();
        assert_eq!(collected, vec![0, fs_index]);
    }

    #[test]
    fn binding_dedup_merges_stages() {
        let mut layout = PipelineLayoutBuilder::new(StageMask::VERTEX | StageMask::FRAGMENT);

        let binding = BindingInfo {
            stages: StageMask::VERTEX,
            descriptor_type: DescriptorType::StorageBuffer,
            set: limits::SET_UAV,
            binding: 3,
            count: 1,
            resource_index: 3,
        };

        let mut aliased = binding;
        aliased.stages = StageMask::FRAGMENT;
        aliased.descriptor_type = DescriptorType::StorageBuffer;

        layout.add_bindings(&[binding]);
        layout.add_bindings(&[aliased]);

        assert_eq!(layout.bindings().len(), 1);
        assert_eq!(
            layout.bindings()[0].stages,
            StageMask::VERTEX | StageMask::FRAGMENT
        );
    }
}
