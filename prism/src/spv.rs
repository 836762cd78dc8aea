//! SPIR-V backend.
//!
//! Emits a SPIR-V 1.6 module from the lowered IR. Link-time state that
//! does not change the IR itself (flat shading, output swizzles,
//! dual-source blending, float controls) is applied here through
//! [`Options`].

use rustc_hash::FxHashMap;

use crate::{
    ir::{self, BinaryOp, Op, PushDataScope, ResourceDim, ResourceKind, ScalarKind, VecType},
    limits, BindingMap, BuiltIn, FloatControlFlags, Handle, PipelineLayoutBuilder, ShaderCreateInfo,
    ShaderError, ShaderLinkage, ShaderMetadata, ShaderStage, XfbEntry,
};

const MAGIC: u32 = 0x0723_0203;
const VERSION: u32 = 0x0001_0600;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum OutputComponent {
    #[default]
    Identity = 0,
    R,
    G,
    B,
    A,
    Zero,
    One,
}

/// Per-render-target component swizzle applied to fragment outputs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct OutputSwizzle {
    pub r: OutputComponent,
    pub g: OutputComponent,
    pub b: OutputComponent,
    pub a: OutputComponent,
}

impl OutputSwizzle {
    pub fn is_identity(&self) -> bool {
        *self == Self::default()
    }

    fn components(&self) -> [OutputComponent; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

/// Code generation options derived from compile options and linkage.
#[derive(Clone, Debug, Default)]
pub struct Options {
    pub flat_shading_inputs: u32,
    pub dual_src_blend: bool,
    pub sample_rate_shading: bool,
    pub rt_swizzles: [OutputSwizzle; 8],
    pub float_controls: FloatControlFlags,
    pub include_debug_names: bool,
    pub xfb_entries: Vec<XfbEntry>,
}

impl Options {
    pub fn from_create_info(info: &ShaderCreateInfo, linkage: Option<&ShaderLinkage>) -> Self {
        let mut options = Self {
            float_controls: info.options.float_controls,
            sample_rate_shading: info
                .options
                .flags
                .contains(crate::CompileFlags::ENABLE_SAMPLE_RATE_SHADING),
            include_debug_names: true,
            xfb_entries: info.xfb_entries.clone(),
            ..Default::default()
        };

        if let Some(linkage) = linkage {
            if linkage.fs_flat_shading {
                options.flat_shading_inputs = info.flat_shading_inputs;
            }

            options.dual_src_blend = linkage.fs_dual_src_blend;
            options.rt_swizzles = linkage.rt_swizzles;
        }

        options
    }
}

mod spirv {
    pub const OP_EXT_INST_IMPORT: u16 = 11;
    pub const OP_EXT_INST: u16 = 12;
    pub const OP_MEMORY_MODEL: u16 = 14;
    pub const OP_ENTRY_POINT: u16 = 15;
    pub const OP_EXECUTION_MODE: u16 = 16;
    pub const OP_CAPABILITY: u16 = 17;
    pub const OP_TYPE_VOID: u16 = 19;
    pub const OP_TYPE_INT: u16 = 21;
    pub const OP_TYPE_FLOAT: u16 = 22;
    pub const OP_TYPE_VECTOR: u16 = 23;
    pub const OP_TYPE_IMAGE: u16 = 25;
    pub const OP_TYPE_SAMPLER: u16 = 26;
    pub const OP_TYPE_SAMPLED_IMAGE: u16 = 27;
    pub const OP_TYPE_RUNTIME_ARRAY: u16 = 29;
    pub const OP_TYPE_STRUCT: u16 = 30;
    pub const OP_TYPE_POINTER: u16 = 32;
    pub const OP_TYPE_FUNCTION: u16 = 33;
    pub const OP_CONSTANT: u16 = 43;
    pub const OP_SPEC_CONSTANT: u16 = 50;
    pub const OP_FUNCTION: u16 = 54;
    pub const OP_FUNCTION_END: u16 = 56;
    pub const OP_VARIABLE: u16 = 59;
    pub const OP_LOAD: u16 = 61;
    pub const OP_STORE: u16 = 62;
    pub const OP_ACCESS_CHAIN: u16 = 65;
    pub const OP_DECORATE: u16 = 71;
    pub const OP_MEMBER_DECORATE: u16 = 72;
    pub const OP_COMPOSITE_CONSTRUCT: u16 = 80;
    pub const OP_COMPOSITE_EXTRACT: u16 = 81;
    pub const OP_SAMPLED_IMAGE: u16 = 86;
    pub const OP_IMAGE_SAMPLE_IMPLICIT_LOD: u16 = 87;
    pub const OP_IMAGE_FETCH: u16 = 95;
    pub const OP_IMAGE_READ: u16 = 98;
    pub const OP_IMAGE_WRITE: u16 = 99;
    pub const OP_CONVERT_U_TO_PTR: u16 = 120;
    pub const OP_BITCAST: u16 = 124;
    pub const OP_I_ADD: u16 = 128;
    pub const OP_F_ADD: u16 = 129;
    pub const OP_I_SUB: u16 = 130;
    pub const OP_F_SUB: u16 = 131;
    pub const OP_I_MUL: u16 = 132;
    pub const OP_F_MUL: u16 = 133;
    pub const OP_U_DIV: u16 = 134;
    pub const OP_S_DIV: u16 = 135;
    pub const OP_F_DIV: u16 = 136;
    pub const OP_SHIFT_RIGHT_LOGICAL: u16 = 194;
    pub const OP_BITWISE_OR: u16 = 197;
    pub const OP_BITWISE_XOR: u16 = 198;
    pub const OP_BITWISE_AND: u16 = 199;
    pub const OP_ATOMIC_I_INCREMENT: u16 = 232;
    pub const OP_ATOMIC_I_DECREMENT: u16 = 233;
    pub const OP_LABEL: u16 = 248;
    pub const OP_RETURN: u16 = 253;
    pub const OP_NAME: u16 = 5;

    pub const CAP_SHADER: u32 = 1;
    pub const CAP_GEOMETRY: u32 = 2;
    pub const CAP_TESSELLATION: u32 = 3;
    pub const CAP_INT64: u32 = 11;
    pub const CAP_SAMPLE_RATE_SHADING: u32 = 35;
    pub const CAP_SAMPLED_BUFFER: u32 = 46;
    pub const CAP_STORAGE_IMAGE_READ_WITHOUT_FORMAT: u32 = 55;
    pub const CAP_STORAGE_IMAGE_WRITE_WITHOUT_FORMAT: u32 = 56;
    pub const CAP_TRANSFORM_FEEDBACK: u32 = 53;
    pub const CAP_GEOMETRY_STREAMS: u32 = 54;
    pub const CAP_DENORM_PRESERVE: u32 = 4464;
    pub const CAP_DENORM_FLUSH_TO_ZERO: u32 = 4465;
    pub const CAP_SZ_INF_NAN_PRESERVE: u32 = 4466;
    pub const CAP_ROUNDING_MODE_RTE: u32 = 4467;
    pub const CAP_ROUNDING_MODE_RTZ: u32 = 4468;
    pub const CAP_RUNTIME_DESCRIPTOR_ARRAY: u32 = 5302;
    pub const CAP_PHYSICAL_STORAGE_BUFFER_ADDRESSES: u32 = 5347;

    pub const ADDRESSING_LOGICAL: u32 = 0;
    pub const ADDRESSING_PHYSICAL_STORAGE_BUFFER64: u32 = 5348;
    pub const MEMORY_MODEL_GLSL450: u32 = 1;

    pub const EXEC_MODEL_VERTEX: u32 = 0;
    pub const EXEC_MODEL_TESS_CONTROL: u32 = 1;
    pub const EXEC_MODEL_TESS_EVAL: u32 = 2;
    pub const EXEC_MODEL_GEOMETRY: u32 = 3;
    pub const EXEC_MODEL_FRAGMENT: u32 = 4;
    pub const EXEC_MODEL_COMPUTE: u32 = 5;

    pub const MODE_ORIGIN_UPPER_LEFT: u32 = 7;
    pub const MODE_XFB: u32 = 11;
    pub const MODE_LOCAL_SIZE: u32 = 17;
    pub const MODE_INPUT_POINTS: u32 = 19;
    pub const MODE_INPUT_LINES: u32 = 20;
    pub const MODE_INPUT_LINES_ADJACENCY: u32 = 21;
    pub const MODE_TRIANGLES: u32 = 22;
    pub const MODE_INPUT_TRIANGLES_ADJACENCY: u32 = 23;
    pub const MODE_OUTPUT_VERTICES: u32 = 26;
    pub const MODE_OUTPUT_POINTS: u32 = 27;
    pub const MODE_OUTPUT_LINE_STRIP: u32 = 28;
    pub const MODE_OUTPUT_TRIANGLE_STRIP: u32 = 29;
    pub const MODE_DENORM_PRESERVE: u32 = 4459;
    pub const MODE_DENORM_FLUSH_TO_ZERO: u32 = 4460;
    pub const MODE_SZ_INF_NAN_PRESERVE: u32 = 4461;
    pub const MODE_ROUNDING_MODE_RTE: u32 = 4462;
    pub const MODE_ROUNDING_MODE_RTZ: u32 = 4463;

    pub const DEC_BLOCK: u32 = 2;
    pub const DEC_ARRAY_STRIDE: u32 = 6;
    pub const DEC_BUILT_IN: u32 = 11;
    pub const DEC_FLAT: u32 = 14;
    pub const DEC_PATCH: u32 = 15;
    pub const DEC_STREAM: u32 = 29;
    pub const DEC_LOCATION: u32 = 30;
    pub const DEC_INDEX: u32 = 32;
    pub const DEC_BINDING: u32 = 33;
    pub const DEC_DESCRIPTOR_SET: u32 = 34;
    pub const DEC_OFFSET: u32 = 35;
    pub const DEC_XFB_BUFFER: u32 = 36;
    pub const DEC_XFB_STRIDE: u32 = 37;

    pub const STORAGE_UNIFORM_CONSTANT: u32 = 0;
    pub const STORAGE_INPUT: u32 = 1;
    pub const STORAGE_UNIFORM: u32 = 2;
    pub const STORAGE_OUTPUT: u32 = 3;
    pub const STORAGE_PUSH_CONSTANT: u32 = 9;
    pub const STORAGE_STORAGE_BUFFER: u32 = 12;
    pub const STORAGE_PHYSICAL_STORAGE_BUFFER: u32 = 5349;

    pub const DIM_2D: u32 = 1;
    pub const DIM_3D: u32 = 2;
    pub const DIM_BUFFER: u32 = 5;

    pub const SCOPE_DEVICE: u32 = 1;

    pub const GLSL_F_MIN: u32 = 37;
    pub const GLSL_U_MIN: u32 = 38;
    pub const GLSL_S_MIN: u32 = 39;
    pub const GLSL_F_MAX: u32 = 40;
    pub const GLSL_U_MAX: u32 = 41;
    pub const GLSL_S_MAX: u32 = 42;

    pub const BUILTIN_POSITION: u32 = 0;
    pub const BUILTIN_CLIP_DISTANCE: u32 = 3;
    pub const BUILTIN_CULL_DISTANCE: u32 = 4;
    pub const BUILTIN_PRIMITIVE_ID: u32 = 7;
    pub const BUILTIN_LAYER: u32 = 9;
    pub const BUILTIN_VIEWPORT_INDEX: u32 = 10;
    pub const BUILTIN_TESS_COORD: u32 = 13;
    pub const BUILTIN_FRAG_COORD: u32 = 15;
    pub const BUILTIN_SAMPLE_ID: u32 = 18;
    pub const BUILTIN_SAMPLE_MASK: u32 = 20;
    pub const BUILTIN_FRAG_DEPTH: u32 = 22;
    pub const BUILTIN_WORKGROUP_ID: u32 = 26;
    pub const BUILTIN_LOCAL_INVOCATION_ID: u32 = 27;
    pub const BUILTIN_GLOBAL_INVOCATION_ID: u32 = 28;
    pub const BUILTIN_VERTEX_INDEX: u32 = 42;
    pub const BUILTIN_INSTANCE_INDEX: u32 = 43;
    pub const BUILTIN_FRAG_STENCIL_REF: u32 = 5014;
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum TypeKey {
    Void,
    Scalar(ScalarKind),
    Uint64,
    Vector(ScalarKind, u8),
    Pointer(u32, u32),
    Sampler,
    Image(ResourceDim, bool),
    SampledImage(u32),
}

struct Module {
    next_id: u32,
    capabilities: Vec<u32>,
    ext_inst_glsl: u32,
    entry: Vec<u32>,
    exec_modes: Vec<u32>,
    names: Vec<u32>,
    decorations: Vec<u32>,
    globals: Vec<u32>,
    code: Vec<u32>,
    types: FxHashMap<TypeKey, u32>,
    constants: FxHashMap<(u32, u32), u32>,
}

impl Module {
    fn new() -> Self {
        Self {
            next_id: 1,
            capabilities: Vec::new(),
            ext_inst_glsl: 0,
            entry: Vec::new(),
            exec_modes: Vec::new(),
            names: Vec::new(),
            decorations: Vec::new(),
            globals: Vec::new(),
            code: Vec::new(),
            types: FxHashMap::default(),
            constants: FxHashMap::default(),
        }
    }

    fn id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn capability(&mut self, cap: u32) {
        let instr = [(2u32 << 16) | spirv::OP_CAPABILITY as u32, cap];
        // Capabilities are emitted once.
        if !self.capabilities.chunks(2).any(|c| c[1] == cap) {
            self.capabilities.extend_from_slice(&instr);
        }
    }

    fn decorate(&mut self, target: u32, decoration: u32, operands: &[u32]) {
        let count = 3 + operands.len() as u32;
        self.decorations
            .push((count << 16) | spirv::OP_DECORATE as u32);
        self.decorations.push(target);
        self.decorations.push(decoration);
        self.decorations.extend_from_slice(operands);
    }

    fn member_decorate(&mut self, target: u32, member: u32, decoration: u32, operands: &[u32]) {
        let count = 4 + operands.len() as u32;
        self.decorations
            .push((count << 16) | spirv::OP_MEMBER_DECORATE as u32);
        self.decorations.push(target);
        self.decorations.push(member);
        self.decorations.push(decoration);
        self.decorations.extend_from_slice(operands);
    }

    fn name(&mut self, target: u32, name: &str) {
        let words = string_words(name);
        self.names
            .push(((2 + words.len() as u32) << 16) | spirv::OP_NAME as u32);
        self.names.push(target);
        self.names.extend_from_slice(&words);
    }

    fn global(&mut self, opcode: u16, operands: &[u32]) {
        let count = 1 + operands.len() as u32;
        self.globals.push((count << 16) | opcode as u32);
        self.globals.extend_from_slice(operands);
    }

    fn instr(&mut self, opcode: u16, operands: &[u32]) {
        let count = 1 + operands.len() as u32;
        self.code.push((count << 16) | opcode as u32);
        self.code.extend_from_slice(operands);
    }

    fn type_id(&mut self, key: TypeKey) -> u32 {
        if let Some(&id) = self.types.get(&key) {
            return id;
        }

        let id = self.id();

        match key {
            TypeKey::Void => {
                self.global(spirv::OP_TYPE_VOID, &[id]);
            }
            TypeKey::Scalar(ScalarKind::F32) => {
                self.global(spirv::OP_TYPE_FLOAT, &[id, 32]);
            }
            TypeKey::Scalar(ScalarKind::U32) => {
                self.global(spirv::OP_TYPE_INT, &[id, 32, 0]);
            }
            TypeKey::Scalar(ScalarKind::I32) => {
                self.global(spirv::OP_TYPE_INT, &[id, 32, 1]);
            }
            TypeKey::Uint64 => {
                self.capability(spirv::CAP_INT64);
                self.global(spirv::OP_TYPE_INT, &[id, 64, 0]);
            }
            TypeKey::Vector(kind, count) => {
                let scalar = self.type_id(TypeKey::Scalar(kind));
                self.global(spirv::OP_TYPE_VECTOR, &[id, scalar, count as u32]);
            }
            TypeKey::Pointer(storage, pointee) => {
                self.global(spirv::OP_TYPE_POINTER, &[id, storage, pointee]);
            }
            TypeKey::Sampler => {
                self.global(spirv::OP_TYPE_SAMPLER, &[id]);
            }
            TypeKey::Image(dim, storage) => {
                let sampled_type = self.type_id(TypeKey::Scalar(ScalarKind::F32));
                let dim = match dim {
                    ResourceDim::Buffer => spirv::DIM_BUFFER,
                    ResourceDim::Tex2d => spirv::DIM_2D,
                    ResourceDim::Tex3d => spirv::DIM_3D,
                };
                let sampled = if storage { 2 } else { 1 };
                self.global(
                    spirv::OP_TYPE_IMAGE,
                    &[id, sampled_type, dim, 0, 0, 0, sampled, 0],
                );
            }
            TypeKey::SampledImage(image) => {
                self.global(spirv::OP_TYPE_SAMPLED_IMAGE, &[id, image]);
            }
        }

        // Recursive type_id calls above may have inserted entries; the id we
        // return was reserved first so the map stays consistent.
        self.types.insert(key, id);
        id
    }

    fn vec_type_id(&mut self, ty: VecType) -> u32 {
        if ty.count <= 1 {
            self.type_id(TypeKey::Scalar(ty.kind))
        } else {
            self.type_id(TypeKey::Vector(ty.kind, ty.count))
        }
    }

    fn const_u32(&mut self, value: u32) -> u32 {
        let ty = self.type_id(TypeKey::Scalar(ScalarKind::U32));
        self.typed_const(ty, value)
    }

    fn const_f32(&mut self, bits: u32) -> u32 {
        let ty = self.type_id(TypeKey::Scalar(ScalarKind::F32));
        self.typed_const(ty, bits)
    }

    fn typed_const(&mut self, ty: u32, value: u32) -> u32 {
        if let Some(&id) = self.constants.get(&(ty, value)) {
            return id;
        }

        let id = self.id();
        self.global(spirv::OP_CONSTANT, &[ty, id, value]);
        self.constants.insert((ty, value), id);
        id
    }
}

fn string_words(s: &str) -> Vec<u32> {
    let mut bytes = s.as_bytes().to_vec();
    bytes.push(0);
    bytes.resize((bytes.len() + 3) & !3, 0);
    bytes
        .chunks(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

struct PushConstantLayout {
    variable: u32,
    /// Final byte offset -> (member index, 64-bit flag).
    members: FxHashMap<u32, (u32, bool)>,
}

/// Emits a SPIR-V binary for the lowered IR in `builder`.
pub fn emit(
    builder: &ir::Builder,
    metadata: &ShaderMetadata,
    bindings: Option<&BindingMap>,
    options: &Options,
) -> Result<Vec<u32>, ShaderError> {
    let mut m = Module::new();
    m.capability(spirv::CAP_SHADER);

    let uses_bda = builder
        .ops()
        .any(|(_, op)| matches!(op, Op::CounterAddress { .. }));

    if uses_bda {
        m.capability(spirv::CAP_PHYSICAL_STORAGE_BUFFER_ADDRESSES);
    }

    match metadata.stage {
        ShaderStage::Geometry => m.capability(spirv::CAP_GEOMETRY),
        ShaderStage::TessControl | ShaderStage::TessEval => {
            m.capability(spirv::CAP_TESSELLATION)
        }
        _ => (),
    }

    emit_float_controls(&mut m, options);

    m.ext_inst_glsl = m.id();

    let push_constants = emit_push_constant_block(&mut m, builder, metadata.stage, bindings);

    let mut ctx = EmitContext {
        m,
        builder,
        metadata,
        bindings,
        options,
        push_constants,
        values: FxHashMap::default(),
        interface: Vec::new(),
        builtin_inputs: FxHashMap::default(),
    };

    ctx.emit_globals()?;
    ctx.emit_body()?;

    let EmitContext {
        mut m, interface, ..
    } = ctx;

    emit_entry_point(&mut m, metadata, builder, options, &interface);

    // Assemble the final module.
    let mut words = vec![MAGIC, VERSION, 0, m.next_id, 0];
    words.extend_from_slice(&m.capabilities);

    let glsl = string_words("GLSL.std.450");
    words.push(((2 + glsl.len() as u32) << 16) | spirv::OP_EXT_INST_IMPORT as u32);
    words.push(m.ext_inst_glsl);
    words.extend_from_slice(&glsl);

    let addressing = if uses_bda {
        spirv::ADDRESSING_PHYSICAL_STORAGE_BUFFER64
    } else {
        spirv::ADDRESSING_LOGICAL
    };
    words.push((3 << 16) | spirv::OP_MEMORY_MODEL as u32);
    words.push(addressing);
    words.push(spirv::MEMORY_MODEL_GLSL450);

    words.extend_from_slice(&m.entry);
    words.extend_from_slice(&m.exec_modes);
    if options.include_debug_names {
        words.extend_from_slice(&m.names);
    }
    words.extend_from_slice(&m.decorations);
    words.extend_from_slice(&m.globals);
    words.extend_from_slice(&m.code);

    Ok(words)
}

fn emit_float_controls(m: &mut Module, options: &Options) {
    use FloatControlFlags as F;

    let fc = options.float_controls;

    let widths = [
        (16u32, F::RTE_16, F::RTZ_16, F::DENORM_FLUSH_16, F::DENORM_PRESERVE_16, F::SZ_INF_NAN_PRESERVE_16),
        (32u32, F::RTE_32, F::RTZ_32, F::DENORM_FLUSH_32, F::DENORM_PRESERVE_32, F::SZ_INF_NAN_PRESERVE_32),
        (64u32, F::RTE_64, F::RTZ_64, F::DENORM_FLUSH_64, F::DENORM_PRESERVE_64, F::SZ_INF_NAN_PRESERVE_64),
    ];

    // Only enable float controls when the device exposes an independent
    // denorm mode together with the baseline 32-bit features.
    if !fc.contains(F::INDEPENDENT_DENORM_MODE | F::RTE_32 | F::DENORM_FLUSH_32) {
        return;
    }

    for (width, rte, rtz, flush, preserve, sz) in widths {
        if fc.contains(rte) {
            m.capability(spirv::CAP_ROUNDING_MODE_RTE);
            push_mode(m, spirv::MODE_ROUNDING_MODE_RTE, width);
        }
        if fc.contains(rtz) {
            m.capability(spirv::CAP_ROUNDING_MODE_RTZ);
            push_mode(m, spirv::MODE_ROUNDING_MODE_RTZ, width);
        }
        if fc.contains(flush) {
            m.capability(spirv::CAP_DENORM_FLUSH_TO_ZERO);
            push_mode(m, spirv::MODE_DENORM_FLUSH_TO_ZERO, width);
        }
        if fc.contains(preserve) {
            m.capability(spirv::CAP_DENORM_PRESERVE);
            push_mode(m, spirv::MODE_DENORM_PRESERVE, width);
        }
        if fc.contains(sz) {
            m.capability(spirv::CAP_SZ_INF_NAN_PRESERVE);
            push_mode(m, spirv::MODE_SZ_INF_NAN_PRESERVE, width);
        }
    }
}

// Execution modes reference the entry point id, which is not known yet when
// float controls are emitted. Entry id is patched in emit_entry_point; use a
// placeholder slot layout of [header, entry, mode, operand].
fn push_mode(m: &mut Module, mode: u32, operand: u32) {
    m.exec_modes
        .push((4 << 16) | spirv::OP_EXECUTION_MODE as u32);
    m.exec_modes.push(0);
    m.exec_modes.push(mode);
    m.exec_modes.push(operand);
}

fn push_mode_nullary(m: &mut Module, mode: u32) {
    m.exec_modes
        .push((3 << 16) | spirv::OP_EXECUTION_MODE as u32);
    m.exec_modes.push(0);
    m.exec_modes.push(mode);
}

fn emit_push_constant_block(
    m: &mut Module,
    builder: &ir::Builder,
    stage: ShaderStage,
    bindings: Option<&BindingMap>,
) -> Option<PushConstantLayout> {
    let per_stage_block = PipelineLayoutBuilder::per_stage_push_data_block(stage);

    let per_stage_base = bindings
        .map(|b| b.push_data_offset(per_stage_block))
        .filter(|&o| o != 0)
        .unwrap_or(limits::MAX_SHARED_PUSH_DATA_SIZE);

    let shared_base = bindings
        .map(|b| b.push_data_offset(PipelineLayoutBuilder::SHARED_PUSH_DATA_BLOCK))
        .unwrap_or(0);

    let resolve = |scope: PushDataScope, offset: u32| match scope {
        PushDataScope::Shared => shared_base + offset,
        PushDataScope::PerStage => per_stage_base + offset,
    };

    // Collect the distinct push-data words the code actually reads.
    let mut members: Vec<(u32, bool)> = Vec::new();

    let mut add = |offset: u32, wide64: bool| {
        if !members.iter().any(|&(o, _)| o == offset) {
            members.push((offset, wide64));
        }
    };

    for (_, op) in builder.ops() {
        match *op {
            Op::LoadPushData { scope, offset, .. } => add(resolve(scope, offset) & !3, false),
            Op::SamplerHeapRef { push_offset, .. } => {
                add(resolve(PushDataScope::PerStage, push_offset) & !3, false)
            }
            Op::CounterAddress { push_offset } => {
                add(resolve(PushDataScope::PerStage, push_offset), true)
            }
            _ => (),
        }
    }

    if members.is_empty() {
        return None;
    }

    members.sort_unstable();

    let u32_ty = m.type_id(TypeKey::Scalar(ScalarKind::U32));

    let mut member_types = Vec::new();
    let mut member_map = FxHashMap::default();

    for (index, &(offset, wide64)) in members.iter().enumerate() {
        let ty = if wide64 {
            m.type_id(TypeKey::Uint64)
        } else {
            u32_ty
        };
        member_types.push(ty);
        member_map.insert(offset, (index as u32, wide64));
    }

    let struct_id = m.id();
    let mut operands = vec![struct_id];
    operands.extend_from_slice(&member_types);
    m.global(spirv::OP_TYPE_STRUCT, &operands);
    m.decorate(struct_id, spirv::DEC_BLOCK, &[]);

    for (index, &(offset, _)) in members.iter().enumerate() {
        m.member_decorate(struct_id, index as u32, spirv::DEC_OFFSET, &[offset]);
    }

    let ptr = m.type_id(TypeKey::Pointer(spirv::STORAGE_PUSH_CONSTANT, struct_id));
    let variable = m.id();
    m.global(
        spirv::OP_VARIABLE,
        &[ptr, variable, spirv::STORAGE_PUSH_CONSTANT],
    );
    m.name(variable, "push_data");

    Some(PushConstantLayout {
        variable,
        members: member_map,
    })
}

fn emit_entry_point(
    m: &mut Module,
    metadata: &ShaderMetadata,
    builder: &ir::Builder,
    options: &Options,
    interface: &[u32],
) {
    use crate::PrimitiveTopology as T;

    let entry_id = m.id();

    let model = match metadata.stage {
        ShaderStage::Vertex => spirv::EXEC_MODEL_VERTEX,
        ShaderStage::TessControl => spirv::EXEC_MODEL_TESS_CONTROL,
        ShaderStage::TessEval => spirv::EXEC_MODEL_TESS_EVAL,
        ShaderStage::Geometry => spirv::EXEC_MODEL_GEOMETRY,
        ShaderStage::Fragment => spirv::EXEC_MODEL_FRAGMENT,
        ShaderStage::Compute => spirv::EXEC_MODEL_COMPUTE,
    };

    let name = string_words("main");
    let count = 3 + name.len() as u32 + interface.len() as u32;
    m.entry.push((count << 16) | spirv::OP_ENTRY_POINT as u32);
    m.entry.push(model);
    m.entry.push(entry_id);
    m.entry.extend_from_slice(&name);
    m.entry.extend_from_slice(interface);

    match metadata.stage {
        ShaderStage::Fragment => {
            push_mode_nullary(m, spirv::MODE_ORIGIN_UPPER_LEFT);
        }
        ShaderStage::Compute => {
            m.exec_modes
                .push((6 << 16) | spirv::OP_EXECUTION_MODE as u32);
            m.exec_modes.push(0);
            m.exec_modes.push(spirv::MODE_LOCAL_SIZE);
            m.exec_modes.extend_from_slice(&[1, 1, 1]);
        }
        ShaderStage::Geometry => {
            let input_mode = match builder.input_topology {
                T::PointList => spirv::MODE_INPUT_POINTS,
                T::LineList | T::LineStrip => spirv::MODE_INPUT_LINES,
                T::LineListAdjacent => spirv::MODE_INPUT_LINES_ADJACENCY,
                T::TriangleListAdjacent => spirv::MODE_INPUT_TRIANGLES_ADJACENCY,
                _ => spirv::MODE_TRIANGLES,
            };
            push_mode_nullary(m, input_mode);

            let output_mode = match builder.output_topology {
                T::PointList => spirv::MODE_OUTPUT_POINTS,
                T::LineStrip | T::LineList => spirv::MODE_OUTPUT_LINE_STRIP,
                _ => spirv::MODE_OUTPUT_TRIANGLE_STRIP,
            };
            push_mode_nullary(m, output_mode);
            push_mode(m, spirv::MODE_OUTPUT_VERTICES, 256);
        }
        ShaderStage::TessControl => {
            push_mode(
                m,
                spirv::MODE_OUTPUT_VERTICES,
                metadata.patch_vertex_count.max(1),
            );
        }
        _ => (),
    }

    if !options.xfb_entries.is_empty()
        && matches!(
            metadata.stage,
            ShaderStage::Vertex | ShaderStage::TessEval | ShaderStage::Geometry
        )
    {
        m.capability(spirv::CAP_TRANSFORM_FEEDBACK);
        push_mode_nullary(m, spirv::MODE_XFB);
    }

    if options.sample_rate_shading && metadata.stage == ShaderStage::Fragment {
        m.capability(spirv::CAP_SAMPLE_RATE_SHADING);
    }

    // Patch the entry id into all execution modes recorded earlier.
    let mut i = 0;
    while i < m.exec_modes.len() {
        let count = (m.exec_modes[i] >> 16) as usize;
        m.exec_modes[i + 1] = entry_id;
        i += count;
    }

    // The function itself.
    let void = m.type_id(TypeKey::Void);
    let fn_ty = m.id();
    m.global(spirv::OP_TYPE_FUNCTION, &[fn_ty, void]);

    let label = m.id();

    let mut prologue = vec![
        (5u32 << 16) | spirv::OP_FUNCTION as u32,
        void,
        entry_id,
        0,
        fn_ty,
        (2 << 16) | spirv::OP_LABEL as u32,
        label,
    ];

    prologue.append(&mut m.code);
    m.code = prologue;
    m.code.push((1 << 16) | spirv::OP_FUNCTION_END as u32);
}

struct EmitContext<'a> {
    m: Module,
    builder: &'a ir::Builder,
    metadata: &'a ShaderMetadata,
    bindings: Option<&'a BindingMap>,
    options: &'a Options,
    push_constants: Option<PushConstantLayout>,
    /// IR handle -> (result id, value type).
    values: FxHashMap<Handle<Op>, (u32, VecType)>,
    interface: Vec<u32>,
    builtin_inputs: FxHashMap<BuiltIn, (u32, VecType)>,
}

struct GlobalVar {
    variable: u32,
    value_ty: VecType,
}

impl<'a> EmitContext<'a> {
    fn backend_err(msg: impl Into<String>) -> ShaderError {
        ShaderError::Backend(msg.into())
    }

    fn resolve_binding(&self, set: u8, binding: u32) -> (u32, u32) {
        match self.bindings {
            Some(map) => map.resolve(set, binding),
            None => (set as u32, binding),
        }
    }

    fn emit_globals(&mut self) -> Result<(), ShaderError> {
        let stage = self.metadata.stage;

        let globals: Vec<(Handle<Op>, Op)> = self
            .builder
            .ops()
            .filter(|(_, op)| {
                matches!(
                    op,
                    Op::DclInput { .. }
                        | Op::DclOutput { .. }
                        | Op::DclBinding { .. }
                        | Op::DclSamplerHeap
                        | Op::CounterBinding { .. }
                        | Op::DclSpecConstant { .. }
                )
            })
            .map(|(h, op)| (h, op.clone()))
            .collect();

        for (handle, op) in globals {
            match op {
                Op::DclInput { ref var, ty } => {
                    let id = self.emit_io_variable(var, ty, spirv::STORAGE_INPUT, stage)?;
                    self.values.insert(handle, (id.variable, id.value_ty));
                }
                Op::DclOutput { ref var, ty } => {
                    let id = self.emit_io_variable(var, ty, spirv::STORAGE_OUTPUT, stage)?;
                    self.emit_xfb_decorations(var, id.variable);
                    self.values.insert(handle, (id.variable, id.value_ty));
                }
                Op::DclBinding {
                    kind,
                    dim,
                    set,
                    binding,
                } => {
                    let id = self.emit_binding_variable(kind, dim, set, binding)?;
                    self.values.insert(handle, (id, VecType::VEC4F));
                }
                Op::DclSamplerHeap => {
                    let id = self.emit_sampler_heap();
                    self.values.insert(handle, (id, VecType::U32));
                }
                Op::CounterBinding { binding } => {
                    let id = self.emit_counter_binding(binding);
                    self.values.insert(handle, (id, VecType::U32));
                }
                Op::DclSpecConstant { id, default } => {
                    let ty = self.m.type_id(TypeKey::Scalar(ScalarKind::U32));
                    let result = self.m.id();
                    self.m
                        .global(spirv::OP_SPEC_CONSTANT, &[ty, result, default]);
                    self.m.decorate(result, 1 /* SpecId */, &[id]);
                    self.values.insert(handle, (result, VecType::U32));
                }
                _ => unreachable!(),
            }
        }

        if let Some(pc) = &self.push_constants {
            self.interface.push(pc.variable);
        }

        Ok(())
    }

    fn emit_io_variable(
        &mut self,
        var: &crate::IoVar,
        ty: VecType,
        storage: u32,
        stage: ShaderStage,
    ) -> Result<GlobalVar, ShaderError> {
        let value_ty = ty;
        let ty_id = self.m.vec_type_id(value_ty);
        let ptr = self.m.type_id(TypeKey::Pointer(storage, ty_id));

        let variable = self.m.id();
        self.m.global(spirv::OP_VARIABLE, &[ptr, variable, storage]);

        if !var.semantic_name.is_empty() {
            let name = format!("{}{}", var.semantic_name.to_lowercase(), var.semantic_index);
            self.m.name(variable, &name);
        }

        if let Some(builtin) = var.builtin {
            let spv_builtin = map_builtin(builtin, stage, storage)
                .ok_or_else(|| Self::backend_err(format!("unmapped built-in {builtin:?}")))?;
            self.m
                .decorate(variable, spirv::DEC_BUILT_IN, &[spv_builtin]);
        } else {
            // Dual-source blending maps outputs 0 and 1 onto location 0
            // with distinct indices.
            let dual_src = storage == spirv::STORAGE_OUTPUT
                && stage == ShaderStage::Fragment
                && self.options.dual_src_blend
                && var.location < 2;

            if dual_src {
                self.m
                    .decorate(variable, spirv::DEC_INDEX, &[var.location as u32]);
                self.m.decorate(variable, spirv::DEC_LOCATION, &[0]);
            } else {
                self.m
                    .decorate(variable, spirv::DEC_LOCATION, &[var.location as u32]);
            }

            if var.patch_constant {
                self.m.decorate(variable, spirv::DEC_PATCH, &[]);
            }

            if storage == spirv::STORAGE_INPUT && stage == ShaderStage::Fragment {
                let flat_by_mask = self.options.flat_shading_inputs & (1 << var.location) != 0;
                let flat_by_type = value_ty.kind != ScalarKind::F32;

                if flat_by_mask || flat_by_type {
                    self.m.decorate(variable, spirv::DEC_FLAT, &[]);
                }
            }
        }

        self.interface.push(variable);
        Ok(GlobalVar { variable, value_ty })
    }

    fn emit_xfb_decorations(&mut self, var: &crate::IoVar, variable: u32) {
        for entry in &self.options.xfb_entries {
            if entry.semantic_name.eq_ignore_ascii_case(&var.semantic_name)
                && entry.semantic_index == var.semantic_index
            {
                self.m
                    .decorate(variable, spirv::DEC_XFB_BUFFER, &[entry.buffer]);
                self.m
                    .decorate(variable, spirv::DEC_XFB_STRIDE, &[entry.stride]);
                self.m.decorate(variable, spirv::DEC_OFFSET, &[entry.offset]);

                if entry.stream != 0 {
                    self.m.capability(spirv::CAP_GEOMETRY_STREAMS);
                    self.m
                        .decorate(variable, spirv::DEC_STREAM, &[entry.stream]);
                }
            }
        }
    }

    fn emit_binding_variable(
        &mut self,
        kind: ResourceKind,
        dim: ResourceDim,
        set: u8,
        binding: u32,
    ) -> Result<u32, ShaderError> {
        let (vk_set, vk_binding) = self.resolve_binding(set, binding);

        let (ty, storage) = match (kind, dim) {
            (ResourceKind::Cbv, _) => {
                // Uniform buffer: struct { vec4 data[]; }
                let vec4 = self.m.vec_type_id(VecType::VEC4F);
                let array = self.m.id();
                self.m.global(spirv::OP_TYPE_RUNTIME_ARRAY, &[array, vec4]);
                self.m.decorate(array, spirv::DEC_ARRAY_STRIDE, &[16]);

                let block = self.m.id();
                self.m.global(spirv::OP_TYPE_STRUCT, &[block, array]);
                self.m.decorate(block, spirv::DEC_BLOCK, &[]);
                self.m.member_decorate(block, 0, spirv::DEC_OFFSET, &[0]);
                (block, spirv::STORAGE_UNIFORM)
            }
            (ResourceKind::Srv, ResourceDim::Buffer) => {
                self.m.capability(spirv::CAP_SAMPLED_BUFFER);
                let ty = self.m.type_id(TypeKey::Image(ResourceDim::Buffer, false));
                (ty, spirv::STORAGE_UNIFORM_CONSTANT)
            }
            (ResourceKind::Srv, d) => {
                let ty = self.m.type_id(TypeKey::Image(d, false));
                (ty, spirv::STORAGE_UNIFORM_CONSTANT)
            }
            (_, ResourceDim::Buffer) => {
                // Storage buffer: struct { uint data[]; }
                let u32_ty = self.m.type_id(TypeKey::Scalar(ScalarKind::U32));
                let array = self.m.id();
                self.m
                    .global(spirv::OP_TYPE_RUNTIME_ARRAY, &[array, u32_ty]);
                self.m.decorate(array, spirv::DEC_ARRAY_STRIDE, &[4]);

                let block = self.m.id();
                self.m.global(spirv::OP_TYPE_STRUCT, &[block, array]);
                self.m.decorate(block, spirv::DEC_BLOCK, &[]);
                self.m.member_decorate(block, 0, spirv::DEC_OFFSET, &[0]);
                (block, spirv::STORAGE_STORAGE_BUFFER)
            }
            (_, d) => {
                self.m
                    .capability(spirv::CAP_STORAGE_IMAGE_READ_WITHOUT_FORMAT);
                self.m
                    .capability(spirv::CAP_STORAGE_IMAGE_WRITE_WITHOUT_FORMAT);
                let ty = self.m.type_id(TypeKey::Image(d, true));
                (ty, spirv::STORAGE_UNIFORM_CONSTANT)
            }
        };

        let ptr = self.m.type_id(TypeKey::Pointer(storage, ty));
        let variable = self.m.id();
        self.m.global(spirv::OP_VARIABLE, &[ptr, variable, storage]);
        self.m
            .decorate(variable, spirv::DEC_DESCRIPTOR_SET, &[vk_set]);
        self.m.decorate(variable, spirv::DEC_BINDING, &[vk_binding]);

        self.interface.push(variable);
        Ok(variable)
    }

    fn emit_sampler_heap(&mut self) -> u32 {
        self.m.capability(spirv::CAP_RUNTIME_DESCRIPTOR_ARRAY);

        let sampler = self.m.type_id(TypeKey::Sampler);
        let array = self.m.id();
        self.m
            .global(spirv::OP_TYPE_RUNTIME_ARRAY, &[array, sampler]);

        let ptr = self
            .m
            .type_id(TypeKey::Pointer(spirv::STORAGE_UNIFORM_CONSTANT, array));
        let variable = self.m.id();
        self.m.global(
            spirv::OP_VARIABLE,
            &[ptr, variable, spirv::STORAGE_UNIFORM_CONSTANT],
        );

        let (set, binding) = self.resolve_binding(limits::SET_SAMPLER, 0);
        self.m.decorate(variable, spirv::DEC_DESCRIPTOR_SET, &[set]);
        self.m.decorate(variable, spirv::DEC_BINDING, &[binding]);
        self.m.name(variable, "sampler_heap");

        self.interface.push(variable);
        variable
    }

    fn emit_counter_binding(&mut self, binding: u32) -> u32 {
        let (set, binding) = self.resolve_binding(limits::SET_UAV_COUNTER, binding);

        let u32_ty = self.m.type_id(TypeKey::Scalar(ScalarKind::U32));
        let block = self.m.id();
        self.m.global(spirv::OP_TYPE_STRUCT, &[block, u32_ty]);
        self.m.decorate(block, spirv::DEC_BLOCK, &[]);
        self.m.member_decorate(block, 0, spirv::DEC_OFFSET, &[0]);

        let ptr = self
            .m
            .type_id(TypeKey::Pointer(spirv::STORAGE_STORAGE_BUFFER, block));
        let variable = self.m.id();
        self.m.global(
            spirv::OP_VARIABLE,
            &[ptr, variable, spirv::STORAGE_STORAGE_BUFFER],
        );
        self.m.decorate(variable, spirv::DEC_DESCRIPTOR_SET, &[set]);
        self.m.decorate(variable, spirv::DEC_BINDING, &[binding]);

        self.interface.push(variable);
        variable
    }

    /// Loads a push-data word. Returns the resulting u32 id.
    fn load_push_word(&mut self, final_offset: u32) -> Result<u32, ShaderError> {
        let pc = self
            .push_constants
            .as_ref()
            .ok_or_else(|| Self::backend_err("push data referenced but no block emitted"))?;
        let variable = pc.variable;

        let &(member, wide64) = pc
            .members
            .get(&final_offset)
            .ok_or_else(|| Self::backend_err("push data member not declared"))?;

        let scalar = if wide64 {
            self.m.type_id(TypeKey::Uint64)
        } else {
            self.m.type_id(TypeKey::Scalar(ScalarKind::U32))
        };

        let ptr_ty = self
            .m
            .type_id(TypeKey::Pointer(spirv::STORAGE_PUSH_CONSTANT, scalar));
        let index = self.m.const_u32(member);

        let chain = self.m.id();
        self.m
            .instr(spirv::OP_ACCESS_CHAIN, &[ptr_ty, chain, variable, index]);

        let value = self.m.id();
        self.m.instr(spirv::OP_LOAD, &[scalar, value, chain]);
        Ok(value)
    }

    fn resolve_per_stage_offset(&self, offset: u32) -> u32 {
        let block = PipelineLayoutBuilder::per_stage_push_data_block(self.metadata.stage);
        self.bindings
            .map(|b| b.push_data_offset(block))
            .filter(|&o| o != 0)
            .unwrap_or(limits::MAX_SHARED_PUSH_DATA_SIZE)
            + offset
    }

    fn resolve_shared_offset(&self, offset: u32) -> u32 {
        self.bindings
            .map(|b| b.push_data_offset(PipelineLayoutBuilder::SHARED_PUSH_DATA_BLOCK))
            .unwrap_or(0)
            + offset
    }

    fn value(&self, handle: Handle<Op>) -> Result<(u32, VecType), ShaderError> {
        self.values
            .get(&handle)
            .copied()
            .ok_or_else(|| Self::backend_err("instruction operand has no value"))
    }

    fn emit_body(&mut self) -> Result<(), ShaderError> {
        let ops: Vec<(Handle<Op>, Op)> =
            self.builder.ops().map(|(h, op)| (h, op.clone())).collect();

        let mut returned = false;

        for (handle, op) in ops {
            match op {
                Op::ConstF32(bits) => {
                    let id = self.m.const_f32(bits);
                    self.values.insert(handle, (id, VecType::F32));
                }
                Op::ConstU32(value) => {
                    let id = self.m.const_u32(value);
                    self.values.insert(handle, (id, VecType::U32));
                }
                Op::LoadInput(input) => {
                    let (variable, ty) = self.value(input)?;
                    let ty_id = self.m.vec_type_id(ty);
                    let id = self.m.id();
                    self.m.instr(spirv::OP_LOAD, &[ty_id, id, variable]);
                    self.values.insert(handle, (id, ty));
                }
                Op::LoadBuiltIn(builtin) => {
                    let (id, ty) = self.load_builtin(builtin)?;
                    self.values.insert(handle, (id, ty));
                }
                Op::StoreOutput { output, value } => {
                    let (variable, out_ty) = self.value(output)?;
                    let (mut value_id, value_ty) = self.value(value)?;

                    if let Op::DclOutput { var, .. } = self.builder.op(output) {
                        value_id = self.apply_output_swizzle(var, value_id, value_ty)?;
                    }

                    let _ = out_ty;
                    self.m.instr(spirv::OP_STORE, &[variable, value_id]);
                }
                Op::LoadPushData { scope, offset, ty } => {
                    let final_offset = match scope {
                        PushDataScope::Shared => self.resolve_shared_offset(offset),
                        PushDataScope::PerStage => self.resolve_per_stage_offset(offset),
                    };
                    let id = self.load_push_word(final_offset & !3)?;
                    self.values.insert(handle, (id, ty));
                }
                Op::Binary { op, ty, lhs, rhs } => {
                    let id = self.emit_binary(op, ty, lhs, rhs)?;
                    self.values.insert(handle, (id, ty));
                }
                Op::Sample {
                    image,
                    sampler,
                    coord,
                } => {
                    let id = self.emit_sample(image, sampler, coord)?;
                    self.values.insert(handle, (id, VecType::VEC4F));
                }
                Op::BufferLoad {
                    resource,
                    address,
                    ty,
                } => {
                    let id = self.emit_buffer_load(resource, address, ty)?;
                    self.values.insert(handle, (id, ty));
                }
                Op::BufferStore {
                    resource,
                    address,
                    value,
                } => {
                    self.emit_buffer_store(resource, address, value)?;
                }
                Op::AtomicIncrement { counter } => {
                    let id = self.emit_counter_atomic(counter, spirv::OP_ATOMIC_I_INCREMENT)?;
                    self.values.insert(handle, (id, VecType::U32));
                }
                Op::AtomicDecrement { counter } => {
                    let id = self.emit_counter_atomic(counter, spirv::OP_ATOMIC_I_DECREMENT)?;
                    self.values.insert(handle, (id, VecType::U32));
                }
                Op::Return => {
                    self.m.instr(spirv::OP_RETURN, &[]);
                    returned = true;
                }
                // Declarations were handled in emit_globals; source-level
                // declarations must not survive lowering.
                Op::DclSampler { .. }
                | Op::DclCbv { .. }
                | Op::DclSrv { .. }
                | Op::DclUav { .. }
                | Op::DclUavCounter { .. } => {
                    return Err(Self::backend_err(
                        "unlowered resource declaration in IR stream",
                    ));
                }
                _ => (),
            }
        }

        if !returned {
            self.m.instr(spirv::OP_RETURN, &[]);
        }

        Ok(())
    }

    fn load_builtin(&mut self, builtin: BuiltIn) -> Result<(u32, VecType), ShaderError> {
        if let Some(&(variable, ty)) = self.builtin_inputs.get(&builtin) {
            let ty_id = self.m.vec_type_id(ty);
            let id = self.m.id();
            self.m.instr(spirv::OP_LOAD, &[ty_id, id, variable]);
            return Ok((id, ty));
        }

        let spv_builtin = map_builtin(builtin, self.metadata.stage, spirv::STORAGE_INPUT)
            .ok_or_else(|| Self::backend_err(format!("built-in {builtin:?} must be lowered")))?;

        let ty = builtin_type(builtin);
        let ty_id = self.m.vec_type_id(ty);
        let ptr = self.m.type_id(TypeKey::Pointer(spirv::STORAGE_INPUT, ty_id));

        let variable = self.m.id();
        self.m
            .global(spirv::OP_VARIABLE, &[ptr, variable, spirv::STORAGE_INPUT]);
        self.m
            .decorate(variable, spirv::DEC_BUILT_IN, &[spv_builtin]);

        self.interface.push(variable);
        self.builtin_inputs.insert(builtin, (variable, ty));

        let id = self.m.id();
        self.m.instr(spirv::OP_LOAD, &[ty_id, id, variable]);
        Ok((id, ty))
    }

    fn emit_binary(
        &mut self,
        op: BinaryOp,
        ty: VecType,
        lhs: Handle<Op>,
        rhs: Handle<Op>,
    ) -> Result<u32, ShaderError> {
        let (lhs, _) = self.value(lhs)?;
        let (rhs, _) = self.value(rhs)?;
        let ty_id = self.m.vec_type_id(ty);
        let id = self.m.id();

        let float = ty.kind == ScalarKind::F32;
        let signed = ty.kind == ScalarKind::I32;

        let opcode = match op {
            BinaryOp::Add => {
                if float {
                    spirv::OP_F_ADD
                } else {
                    spirv::OP_I_ADD
                }
            }
            BinaryOp::Sub => {
                if float {
                    spirv::OP_F_SUB
                } else {
                    spirv::OP_I_SUB
                }
            }
            BinaryOp::Mul => {
                if float {
                    spirv::OP_F_MUL
                } else {
                    spirv::OP_I_MUL
                }
            }
            BinaryOp::Div => {
                if float {
                    spirv::OP_F_DIV
                } else if signed {
                    spirv::OP_S_DIV
                } else {
                    spirv::OP_U_DIV
                }
            }
            BinaryOp::And => spirv::OP_BITWISE_AND,
            BinaryOp::Or => spirv::OP_BITWISE_OR,
            BinaryOp::Xor => spirv::OP_BITWISE_XOR,
            BinaryOp::Min | BinaryOp::Max => {
                let inst = match (op, float, signed) {
                    (BinaryOp::Min, true, _) => spirv::GLSL_F_MIN,
                    (BinaryOp::Min, false, true) => spirv::GLSL_S_MIN,
                    (BinaryOp::Min, false, false) => spirv::GLSL_U_MIN,
                    (_, true, _) => spirv::GLSL_F_MAX,
                    (_, false, true) => spirv::GLSL_S_MAX,
                    (_, false, false) => spirv::GLSL_U_MAX,
                };
                let glsl = self.m.ext_inst_glsl;
                self.m
                    .instr(spirv::OP_EXT_INST, &[ty_id, id, glsl, inst, lhs, rhs]);
                return Ok(id);
            }
        };

        self.m.instr(opcode, &[ty_id, id, lhs, rhs]);
        Ok(id)
    }

    fn emit_sample(
        &mut self,
        image: Handle<Op>,
        sampler: Handle<Op>,
        coord: Handle<Op>,
    ) -> Result<u32, ShaderError> {
        let (image_var, _) = self.value(image)?;
        let (coord_id, _) = self.value(coord)?;

        let dim = match self.builder.op(image) {
            Op::DclBinding { dim, .. } => *dim,
            _ => return Err(Self::backend_err("sample source is not an image binding")),
        };

        let sampler_id = self.load_heap_sampler(sampler)?;

        let image_ty = self.m.type_id(TypeKey::Image(dim, false));
        let image_id = self.m.id();
        self.m.instr(spirv::OP_LOAD, &[image_ty, image_id, image_var]);

        let sampled_ty = self.m.type_id(TypeKey::SampledImage(image_ty));
        let combined = self.m.id();
        self.m.instr(
            spirv::OP_SAMPLED_IMAGE,
            &[sampled_ty, combined, image_id, sampler_id],
        );

        let result_ty = self.m.vec_type_id(VecType::VEC4F);
        let result = self.m.id();
        self.m.instr(
            spirv::OP_IMAGE_SAMPLE_IMPLICIT_LOD,
            &[result_ty, result, combined, coord_id],
        );

        Ok(result)
    }

    fn load_heap_sampler(&mut self, sampler: Handle<Op>) -> Result<u32, ShaderError> {
        let (heap, push_offset, wide) = match *self.builder.op(sampler) {
            Op::SamplerHeapRef {
                heap,
                push_offset,
                wide,
            } => (heap, push_offset, wide),
            _ => return Err(Self::backend_err("sampler reference is not heap-lowered")),
        };

        let (heap_var, _) = self.value(heap)?;

        let final_offset = self.resolve_per_stage_offset(push_offset);
        let word = self.load_push_word(final_offset & !3)?;

        let u32_ty = self.m.type_id(TypeKey::Scalar(ScalarKind::U32));

        // 16-bit indices are packed two to a dword.
        let index = if wide {
            word
        } else {
            let shift = (final_offset & 2) * 8;
            let shifted = if shift != 0 {
                let shift_id = self.m.const_u32(shift);
                let id = self.m.id();
                self.m
                    .instr(spirv::OP_SHIFT_RIGHT_LOGICAL, &[u32_ty, id, word, shift_id]);
                id
            } else {
                word
            };

            let mask = self.m.const_u32(0xffff);
            let id = self.m.id();
            self.m
                .instr(spirv::OP_BITWISE_AND, &[u32_ty, id, shifted, mask]);
            id
        };

        let sampler_ty = self.m.type_id(TypeKey::Sampler);
        let ptr = self.m.type_id(TypeKey::Pointer(
            spirv::STORAGE_UNIFORM_CONSTANT,
            sampler_ty,
        ));

        let chain = self.m.id();
        self.m
            .instr(spirv::OP_ACCESS_CHAIN, &[ptr, chain, heap_var, index]);

        let id = self.m.id();
        self.m.instr(spirv::OP_LOAD, &[sampler_ty, id, chain]);
        Ok(id)
    }

    fn emit_buffer_load(
        &mut self,
        resource: Handle<Op>,
        address: Handle<Op>,
        ty: VecType,
    ) -> Result<u32, ShaderError> {
        let (variable, _) = self.value(resource)?;
        let (address_id, _) = self.value(address)?;

        let (kind, dim) = match *self.builder.op(resource) {
            Op::DclBinding { kind, dim, .. } => (kind, dim),
            _ => return Err(Self::backend_err("buffer load source is not a binding")),
        };

        match (kind, dim) {
            (ResourceKind::Srv, ResourceDim::Buffer) => {
                let image_ty = self.m.type_id(TypeKey::Image(ResourceDim::Buffer, false));
                let image = self.m.id();
                self.m.instr(spirv::OP_LOAD, &[image_ty, image, variable]);

                let result_ty = self.m.vec_type_id(VecType::VEC4F);
                let id = self.m.id();
                self.m
                    .instr(spirv::OP_IMAGE_FETCH, &[result_ty, id, image, address_id]);
                Ok(id)
            }
            (ResourceKind::Uav, ResourceDim::Buffer) | (ResourceKind::Cbv, _) => {
                let member = self.m.const_u32(0);

                let (elem_ty, storage) = if kind == ResourceKind::Cbv {
                    (self.m.vec_type_id(VecType::VEC4F), spirv::STORAGE_UNIFORM)
                } else {
                    (
                        self.m.type_id(TypeKey::Scalar(ScalarKind::U32)),
                        spirv::STORAGE_STORAGE_BUFFER,
                    )
                };

                let ptr = self.m.type_id(TypeKey::Pointer(storage, elem_ty));
                let chain = self.m.id();
                self.m.instr(
                    spirv::OP_ACCESS_CHAIN,
                    &[ptr, chain, variable, member, address_id],
                );

                let mut id = self.m.id();
                self.m.instr(spirv::OP_LOAD, &[elem_ty, id, chain]);

                if kind == ResourceKind::Uav && ty.kind == ScalarKind::F32 {
                    let f32_ty = self.m.vec_type_id(VecType::F32);
                    let cast = self.m.id();
                    self.m.instr(spirv::OP_BITCAST, &[f32_ty, cast, id]);
                    id = cast;
                }

                Ok(id)
            }
            (_, d) => {
                let image_ty = self.m.type_id(TypeKey::Image(d, true));
                let image = self.m.id();
                self.m.instr(spirv::OP_LOAD, &[image_ty, image, variable]);

                let result_ty = self.m.vec_type_id(VecType::VEC4F);
                let id = self.m.id();
                self.m
                    .instr(spirv::OP_IMAGE_READ, &[result_ty, id, image, address_id]);
                Ok(id)
            }
        }
    }

    fn emit_buffer_store(
        &mut self,
        resource: Handle<Op>,
        address: Handle<Op>,
        value: Handle<Op>,
    ) -> Result<(), ShaderError> {
        let (variable, _) = self.value(resource)?;
        let (address_id, _) = self.value(address)?;
        let (mut value_id, value_ty) = self.value(value)?;

        let (kind, dim) = match *self.builder.op(resource) {
            Op::DclBinding { kind, dim, .. } => (kind, dim),
            _ => return Err(Self::backend_err("buffer store target is not a binding")),
        };

        if kind != ResourceKind::Uav {
            return Err(Self::backend_err("buffer store target is not writable"));
        }

        if dim == ResourceDim::Buffer {
            let u32_ty = self.m.type_id(TypeKey::Scalar(ScalarKind::U32));

            if value_ty.kind == ScalarKind::F32 {
                let cast = self.m.id();
                self.m.instr(spirv::OP_BITCAST, &[u32_ty, cast, value_id]);
                value_id = cast;
            }

            let member = self.m.const_u32(0);
            let ptr = self
                .m
                .type_id(TypeKey::Pointer(spirv::STORAGE_STORAGE_BUFFER, u32_ty));
            let chain = self.m.id();
            self.m.instr(
                spirv::OP_ACCESS_CHAIN,
                &[ptr, chain, variable, member, address_id],
            );
            self.m.instr(spirv::OP_STORE, &[chain, value_id]);
        } else {
            let image_ty = self.m.type_id(TypeKey::Image(dim, true));
            let image = self.m.id();
            self.m.instr(spirv::OP_LOAD, &[image_ty, image, variable]);
            self.m
                .instr(spirv::OP_IMAGE_WRITE, &[image, address_id, value_id]);
        }

        Ok(())
    }

    fn emit_counter_atomic(
        &mut self,
        counter: Handle<Op>,
        opcode: u16,
    ) -> Result<u32, ShaderError> {
        let u32_ty = self.m.type_id(TypeKey::Scalar(ScalarKind::U32));

        let pointer = match *self.builder.op(counter) {
            Op::CounterAddress { push_offset } => {
                let final_offset = self.resolve_per_stage_offset(push_offset);
                let address = self.load_push_word(final_offset)?;

                let ptr = self.m.type_id(TypeKey::Pointer(
                    spirv::STORAGE_PHYSICAL_STORAGE_BUFFER,
                    u32_ty,
                ));

                let id = self.m.id();
                self.m.instr(spirv::OP_CONVERT_U_TO_PTR, &[ptr, id, address]);
                id
            }
            Op::CounterBinding { .. } => {
                let (variable, _) = self.value(counter)?;
                let member = self.m.const_u32(0);
                let ptr = self
                    .m
                    .type_id(TypeKey::Pointer(spirv::STORAGE_STORAGE_BUFFER, u32_ty));
                let id = self.m.id();
                self.m
                    .instr(spirv::OP_ACCESS_CHAIN, &[ptr, id, variable, member]);
                id
            }
            _ => return Err(Self::backend_err("counter reference is not lowered")),
        };

        let scope = self.m.const_u32(spirv::SCOPE_DEVICE);
        let semantics = self.m.const_u32(0);

        let id = self.m.id();
        self.m
            .instr(opcode, &[u32_ty, id, pointer, scope, semantics]);
        Ok(id)
    }

    fn apply_output_swizzle(
        &mut self,
        var: &crate::IoVar,
        value: u32,
        ty: VecType,
    ) -> Result<u32, ShaderError> {
        if self.metadata.stage != ShaderStage::Fragment
            || var.builtin.is_some()
            || ty.count != 4
            || var.location as usize >= self.options.rt_swizzles.len()
        {
            return Ok(value);
        }

        let swizzle = self.options.rt_swizzles[var.location as usize];

        if swizzle.is_identity() {
            return Ok(value);
        }

        let scalar = self.m.type_id(TypeKey::Scalar(ty.kind));
        let zero = match ty.kind {
            ScalarKind::F32 => self.m.const_f32(0),
            _ => self.m.const_u32(0),
        };
        let one = match ty.kind {
            ScalarKind::F32 => self.m.const_f32(1.0f32.to_bits()),
            _ => self.m.const_u32(1),
        };

        let mut components = [0u32; 4];

        for (i, component) in swizzle.components().into_iter().enumerate() {
            let source = match component {
                OutputComponent::Identity => Some(i as u32),
                OutputComponent::R => Some(0),
                OutputComponent::G => Some(1),
                OutputComponent::B => Some(2),
                OutputComponent::A => Some(3),
                OutputComponent::Zero => None,
                OutputComponent::One => {
                    components[i] = one;
                    continue;
                }
            };

            components[i] = match source {
                Some(index) => {
                    let id = self.m.id();
                    self.m
                        .instr(spirv::OP_COMPOSITE_EXTRACT, &[scalar, id, value, index]);
                    id
                }
                None => zero,
            };
        }

        let vec_ty = self.m.vec_type_id(ty);
        let id = self.m.id();
        let operands = [
            vec_ty,
            id,
            components[0],
            components[1],
            components[2],
            components[3],
        ];
        self.m.instr(spirv::OP_COMPOSITE_CONSTRUCT, &operands);
        Ok(id)
    }
}

fn map_builtin(builtin: BuiltIn, stage: ShaderStage, storage: u32) -> Option<u32> {
    Some(match builtin {
        BuiltIn::Position => spirv::BUILTIN_POSITION,
        BuiltIn::VertexId => spirv::BUILTIN_VERTEX_INDEX,
        BuiltIn::InstanceId => spirv::BUILTIN_INSTANCE_INDEX,
        BuiltIn::PrimitiveId => spirv::BUILTIN_PRIMITIVE_ID,
        BuiltIn::FragCoord => spirv::BUILTIN_FRAG_COORD,
        BuiltIn::FragDepth => spirv::BUILTIN_FRAG_DEPTH,
        BuiltIn::SampleId => spirv::BUILTIN_SAMPLE_ID,
        BuiltIn::SampleMask => spirv::BUILTIN_SAMPLE_MASK,
        BuiltIn::Layer => spirv::BUILTIN_LAYER,
        BuiltIn::ViewportIndex => spirv::BUILTIN_VIEWPORT_INDEX,
        BuiltIn::TessCoord => spirv::BUILTIN_TESS_COORD,
        BuiltIn::ClipDistance => spirv::BUILTIN_CLIP_DISTANCE,
        BuiltIn::CullDistance => spirv::BUILTIN_CULL_DISTANCE,
        BuiltIn::WorkgroupId => spirv::BUILTIN_WORKGROUP_ID,
        BuiltIn::LocalInvocationId => spirv::BUILTIN_LOCAL_INVOCATION_ID,
        BuiltIn::GlobalInvocationId => spirv::BUILTIN_GLOBAL_INVOCATION_ID,
        BuiltIn::StencilRef => {
            if storage != spirv::STORAGE_OUTPUT || stage != ShaderStage::Fragment {
                return None;
            }
            spirv::BUILTIN_FRAG_STENCIL_REF
        }
        // Rewritten to push-data loads by the lowering pass.
        BuiltIn::SampleCount | BuiltIn::FragCoverage => return None,
    })
}

fn builtin_type(builtin: BuiltIn) -> VecType {
    match builtin {
        BuiltIn::Position | BuiltIn::FragCoord => VecType::VEC4F,
        BuiltIn::TessCoord => VecType::vector(ScalarKind::F32, 3),
        BuiltIn::WorkgroupId | BuiltIn::LocalInvocationId | BuiltIn::GlobalInvocationId => {
            VecType::vector(ScalarKind::U32, 3)
        }
        BuiltIn::FragDepth | BuiltIn::ClipDistance | BuiltIn::CullDistance => VecType::F32,
        _ => VecType::U32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Builder, Op};
    use crate::{IoVar, ShaderOptions};

    fn emit_simple(stage: ShaderStage) -> Vec<u32> {
        let mut builder = Builder::new();
        builder.stage = stage;

        let input = builder.add(Op::DclInput {
            var: IoVar {
                location: 0,
                component_count: 4,
                semantic_name: "COLOR".into(),
                ..Default::default()
            },
            ty: VecType::VEC4F,
        });
        let output = builder.add(Op::DclOutput {
            var: IoVar {
                location: 0,
                component_count: 4,
                semantic_name: "SV_TARGET".into(),
                ..Default::default()
            },
            ty: VecType::VEC4F,
        });
        let value = builder.add(Op::LoadInput(input));
        builder.add(Op::StoreOutput { output, value });
        builder.add(Op::Return);

        let mut metadata = ShaderMetadata::default();
        metadata.stage = stage;

        let info = ShaderCreateInfo {
            options: ShaderOptions::default(),
            ..Default::default()
        };
        let options = Options::from_create_info(&info, None);

        emit(&builder, &metadata, None, &options).unwrap()
    }

    #[test]
    fn module_header_is_valid() {
        let code = emit_simple(ShaderStage::Fragment);

        assert_eq!(code[0], MAGIC);
        assert_eq!(code[1], VERSION);
        // Id bound is larger than any id used.
        assert!(code[3] > 1);
        assert_eq!(code[4], 0);
    }

    #[test]
    fn instruction_stream_is_well_formed() {
        let code = emit_simple(ShaderStage::Vertex);

        // Walk the instruction stream by word counts; it must cover the
        // module exactly.
        let mut offset = 5;
        let mut saw_entry_point = false;
        let mut saw_function_end = false;

        while offset < code.len() {
            let count = (code[offset] >> 16) as usize;
            let opcode = (code[offset] & 0xffff) as u16;
            assert!(count > 0, "zero-length instruction at {offset}");

            if opcode == spirv::OP_ENTRY_POINT {
                saw_entry_point = true;
            }
            if opcode == spirv::OP_FUNCTION_END {
                saw_function_end = true;
            }

            offset += count;
        }

        assert_eq!(offset, code.len());
        assert!(saw_entry_point);
        assert!(saw_function_end);
    }

    #[test]
    fn float_controls_emit_execution_modes() {
        let mut builder = Builder::new();
        builder.stage = ShaderStage::Compute;
        builder.add(Op::Return);

        let metadata = ShaderMetadata {
            stage: ShaderStage::Compute,
            ..Default::default()
        };

        let info = ShaderCreateInfo {
            options: ShaderOptions {
                float_controls: FloatControlFlags::INDEPENDENT_DENORM_MODE
                    | FloatControlFlags::RTE_32
                    | FloatControlFlags::DENORM_FLUSH_32,
                ..Default::default()
            },
            ..Default::default()
        };

        let options = Options::from_create_info(&info, None);
        let code = emit(&builder, &metadata, None, &options).unwrap();

        let mut found_rte = false;
        let mut offset = 5;
        while offset < code.len() {
            let count = (code[offset] >> 16) as usize;
            let opcode = (code[offset] & 0xffff) as u16;

            if opcode == spirv::OP_EXECUTION_MODE && code[offset + 2] == spirv::MODE_ROUNDING_MODE_RTE
            {
                assert_eq!(code[offset + 3], 32);
                found_rte = true;
            }

            offset += count;
        }

        assert!(found_rte);
    }
}
