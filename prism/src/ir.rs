//! Internal shader IR.
//!
//! The IR is a flat, append-only instruction stream over an [`Arena`].
//! Front-end converters emit source-level declarations (`Dcl*`); the
//! lowering pass rewrites those into their Vulkan-facing forms
//! (`DclSamplerHeap`, `DclBinding`, `CounterAddress`, ...) before the
//! stream is serialized. Body instructions reference earlier instructions
//! by handle, so the stream doubles as an SSA value list.

use crate::{Arena, BuiltIn, Handle, IoVar, PrimitiveTopology, ShaderError, ShaderStage};

/// Resource kinds as seen by the source binding model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResourceKind {
    Sampler = 0,
    Cbv,
    Srv,
    Uav,
    UavCounter,
}

/// Dimensionality of a shader resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResourceDim {
    Buffer = 0,
    Tex2d,
    Tex3d,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ScalarKind {
    F32 = 0,
    U32,
    I32,
}

/// A scalar or small vector type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VecType {
    pub kind: ScalarKind,
    pub count: u8,
}

impl VecType {
    pub const F32: Self = Self::scalar(ScalarKind::F32);
    pub const U32: Self = Self::scalar(ScalarKind::U32);
    pub const VEC4F: Self = Self::vector(ScalarKind::F32, 4);

    pub const fn scalar(kind: ScalarKind) -> Self {
        Self { kind, count: 1 }
    }

    pub const fn vector(kind: ScalarKind, count: u8) -> Self {
        Self { kind, count }
    }
}

/// Push-data block a load refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PushDataScope {
    Shared = 0,
    PerStage,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BinaryOp {
    Add = 0,
    Sub,
    Mul,
    Div,
    And,
    Or,
    Xor,
    Min,
    Max,
}

/// One IR instruction. Declarations precede body instructions.
#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    // Source-level declarations, produced by the front-end converter.
    DclSampler {
        register_space: u32,
        register_index: u32,
    },
    DclCbv {
        register_space: u32,
        register_index: u32,
        size: u32,
    },
    DclSrv {
        register_space: u32,
        register_index: u32,
        dim: ResourceDim,
    },
    DclUav {
        register_space: u32,
        register_index: u32,
        dim: ResourceDim,
    },
    DclUavCounter {
        uav: Handle<Op>,
    },
    DclPushData {
        scope: PushDataScope,
        offset: u32,
        size: u32,
    },
    DclInput {
        var: IoVar,
        ty: VecType,
    },
    DclOutput {
        var: IoVar,
        ty: VecType,
    },
    DclSpecConstant {
        id: u32,
        default: u32,
    },

    // Lowered declaration forms.
    /// Unbounded sampler array on the global sampler heap.
    DclSamplerHeap,
    /// Replaces `DclSampler`: the heap index is read from per-stage push
    /// data at the given byte offset.
    SamplerHeapRef {
        heap: Handle<Op>,
        push_offset: u32,
        wide: bool,
    },
    /// Replaces `DclCbv`/`DclSrv`/`DclUav`: a plain descriptor binding.
    DclBinding {
        kind: ResourceKind,
        dim: ResourceDim,
        set: u8,
        binding: u32,
    },
    /// Replaces `DclUavCounter`: counter address read from push data.
    CounterAddress {
        push_offset: u32,
    },
    /// Replaces `DclUavCounter`: fallback storage-buffer descriptor.
    CounterBinding {
        binding: u32,
    },

    // Body instructions.
    ConstF32(u32),
    ConstU32(u32),
    LoadInput(Handle<Op>),
    StoreOutput {
        output: Handle<Op>,
        value: Handle<Op>,
    },
    LoadPushData {
        scope: PushDataScope,
        offset: u32,
        ty: VecType,
    },
    LoadBuiltIn(BuiltIn),
    Binary {
        op: BinaryOp,
        ty: VecType,
        lhs: Handle<Op>,
        rhs: Handle<Op>,
    },
    Sample {
        image: Handle<Op>,
        sampler: Handle<Op>,
        coord: Handle<Op>,
    },
    BufferLoad {
        resource: Handle<Op>,
        address: Handle<Op>,
        ty: VecType,
    },
    BufferStore {
        resource: Handle<Op>,
        address: Handle<Op>,
        value: Handle<Op>,
    },
    AtomicIncrement {
        counter: Handle<Op>,
    },
    AtomicDecrement {
        counter: Handle<Op>,
    },
    Return,
}

/// IR builder populated by a front-end converter.
#[derive(Clone, Debug, Default)]
pub struct Builder {
    pub stage: ShaderStage,
    pub input_topology: PrimitiveTopology,
    pub output_topology: PrimitiveTopology,
    pub patch_vertex_count: u32,
    ops: Arena<Op>,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, op: Op) -> Handle<Op> {
        self.ops.append(op)
    }

    pub fn ops(&self) -> impl Iterator<Item = (Handle<Op>, &Op)> {
        self.ops.iter()
    }

    pub fn ops_mut(&mut self) -> impl Iterator<Item = (Handle<Op>, &mut Op)> {
        self.ops.iter_mut()
    }

    pub fn op(&self, handle: Handle<Op>) -> &Op {
        &self.ops[handle]
    }

    pub fn rewrite(&mut self, handle: Handle<Op>, op: Op) {
        self.ops[handle] = op;
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

// Serialized IR format: little-endian, no framing. The blob is treated as
// opaque by the cache; the version handshake happens at the cache level.

struct Writer {
    data: Vec<u8>,
}

impl Writer {
    fn u8(&mut self, v: u8) {
        self.data.push(v);
    }

    fn u32(&mut self, v: u32) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    fn handle(&mut self, h: Handle<Op>) {
        self.u32(h.index() as u32);
    }

    fn string(&mut self, s: &str) {
        let len = u16::try_from(s.len()).unwrap_or(u16::MAX);
        self.data.extend_from_slice(&len.to_le_bytes());
        self.data.extend_from_slice(&s.as_bytes()[..len as usize]);
    }

    fn io_var(&mut self, var: &IoVar) {
        self.u8(var.builtin.map_or(0, |b| b as u8));
        self.u8(var.location);
        self.u8(var.component_index);
        self.u8(var.component_count);
        self.u8(var.patch_constant as u8);
        self.u32(var.semantic_index);
        self.string(&var.semantic_name);
    }

    fn ty(&mut self, ty: VecType) {
        self.u8(ty.kind as u8);
        self.u8(ty.count);
    }
}

struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn err() -> ShaderError {
        ShaderError::Deserialize("unexpected end of IR blob".into())
    }

    fn u8(&mut self) -> Result<u8, ShaderError> {
        let v = *self.data.get(self.offset).ok_or_else(Self::err)?;
        self.offset += 1;
        Ok(v)
    }

    fn u16(&mut self) -> Result<u16, ShaderError> {
        let bytes = self
            .data
            .get(self.offset..self.offset + 2)
            .ok_or_else(Self::err)?;
        self.offset += 2;
        Ok(u16::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, ShaderError> {
        let bytes = self
            .data
            .get(self.offset..self.offset + 4)
            .ok_or_else(Self::err)?;
        self.offset += 4;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn handle(&mut self, limit: usize) -> Result<Handle<Op>, ShaderError> {
        let index = self.u32()? as usize;

        if index >= limit {
            return Err(ShaderError::Deserialize(format!(
                "instruction reference {index} out of bounds"
            )));
        }

        Ok(Handle::from_index(index))
    }

    fn string(&mut self) -> Result<String, ShaderError> {
        let len = self.u16()? as usize;
        let bytes = self
            .data
            .get(self.offset..self.offset + len)
            .ok_or_else(Self::err)?;
        self.offset += len;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| ShaderError::Deserialize("malformed string in IR blob".into()))
    }

    fn io_var(&mut self) -> Result<IoVar, ShaderError> {
        Ok(IoVar {
            builtin: BuiltIn::from_u8(self.u8()?),
            location: self.u8()?,
            component_index: self.u8()?,
            component_count: self.u8()?,
            patch_constant: self.u8()? != 0,
            semantic_index: self.u32()?,
            semantic_name: self.string()?,
        })
    }

    fn ty(&mut self) -> Result<VecType, ShaderError> {
        let kind = match self.u8()? {
            0 => ScalarKind::F32,
            1 => ScalarKind::U32,
            2 => ScalarKind::I32,
            k => {
                return Err(ShaderError::Deserialize(format!(
                    "invalid scalar kind {k}"
                )))
            }
        };

        Ok(VecType {
            kind,
            count: self.u8()?,
        })
    }
}

const TAG_DCL_SAMPLER: u8 = 0;
const TAG_DCL_CBV: u8 = 1;
const TAG_DCL_SRV: u8 = 2;
const TAG_DCL_UAV: u8 = 3;
const TAG_DCL_UAV_COUNTER: u8 = 4;
const TAG_DCL_PUSH_DATA: u8 = 5;
const TAG_DCL_INPUT: u8 = 6;
const TAG_DCL_OUTPUT: u8 = 7;
const TAG_DCL_SPEC_CONSTANT: u8 = 8;
const TAG_DCL_SAMPLER_HEAP: u8 = 9;
const TAG_SAMPLER_HEAP_REF: u8 = 10;
const TAG_DCL_BINDING: u8 = 11;
const TAG_COUNTER_ADDRESS: u8 = 12;
const TAG_COUNTER_BINDING: u8 = 13;
const TAG_CONST_F32: u8 = 14;
const TAG_CONST_U32: u8 = 15;
const TAG_LOAD_INPUT: u8 = 16;
const TAG_STORE_OUTPUT: u8 = 17;
const TAG_LOAD_PUSH_DATA: u8 = 18;
const TAG_LOAD_BUILTIN: u8 = 19;
const TAG_BINARY: u8 = 20;
const TAG_SAMPLE: u8 = 21;
const TAG_BUFFER_LOAD: u8 = 22;
const TAG_BUFFER_STORE: u8 = 23;
const TAG_ATOMIC_INCREMENT: u8 = 24;
const TAG_ATOMIC_DECREMENT: u8 = 25;
const TAG_RETURN: u8 = 26;

/// Serializes a builder into an opaque byte blob.
pub fn serialize(builder: &Builder) -> Vec<u8> {
    let mut w = Writer { data: Vec::new() };

    w.u32(builder.stage as u32);
    w.u8(builder.input_topology as u8);
    w.u8(builder.output_topology as u8);
    w.u32(builder.patch_vertex_count);
    w.u32(builder.ops.len() as u32);

    for (_, op) in builder.ops() {
        match *op {
            Op::DclSampler {
                register_space,
                register_index,
            } => {
                w.u8(TAG_DCL_SAMPLER);
                w.u32(register_space);
                w.u32(register_index);
            }
            Op::DclCbv {
                register_space,
                register_index,
                size,
            } => {
                w.u8(TAG_DCL_CBV);
                w.u32(register_space);
                w.u32(register_index);
                w.u32(size);
            }
            Op::DclSrv {
                register_space,
                register_index,
                dim,
            } => {
                w.u8(TAG_DCL_SRV);
                w.u32(register_space);
                w.u32(register_index);
                w.u8(dim as u8);
            }
            Op::DclUav {
                register_space,
                register_index,
                dim,
            } => {
                w.u8(TAG_DCL_UAV);
                w.u32(register_space);
                w.u32(register_index);
                w.u8(dim as u8);
            }
            Op::DclUavCounter { uav } => {
                w.u8(TAG_DCL_UAV_COUNTER);
                w.handle(uav);
            }
            Op::DclPushData {
                scope,
                offset,
                size,
            } => {
                w.u8(TAG_DCL_PUSH_DATA);
                w.u8(scope as u8);
                w.u32(offset);
                w.u32(size);
            }
            Op::DclInput { ref var, ty } => {
                w.u8(TAG_DCL_INPUT);
                w.io_var(var);
                w.ty(ty);
            }
            Op::DclOutput { ref var, ty } => {
                w.u8(TAG_DCL_OUTPUT);
                w.io_var(var);
                w.ty(ty);
            }
            Op::DclSpecConstant { id, default } => {
                w.u8(TAG_DCL_SPEC_CONSTANT);
                w.u32(id);
                w.u32(default);
            }
            Op::DclSamplerHeap => w.u8(TAG_DCL_SAMPLER_HEAP),
            Op::SamplerHeapRef {
                heap,
                push_offset,
                wide,
            } => {
                w.u8(TAG_SAMPLER_HEAP_REF);
                w.handle(heap);
                w.u32(push_offset);
                w.u8(wide as u8);
            }
            Op::DclBinding {
                kind,
                dim,
                set,
                binding,
            } => {
                w.u8(TAG_DCL_BINDING);
                w.u8(kind as u8);
                w.u8(dim as u8);
                w.u8(set);
                w.u32(binding);
            }
            Op::CounterAddress { push_offset } => {
                w.u8(TAG_COUNTER_ADDRESS);
                w.u32(push_offset);
            }
            Op::CounterBinding { binding } => {
                w.u8(TAG_COUNTER_BINDING);
                w.u32(binding);
            }
            Op::ConstF32(bits) => {
                w.u8(TAG_CONST_F32);
                w.u32(bits);
            }
            Op::ConstU32(value) => {
                w.u8(TAG_CONST_U32);
                w.u32(value);
            }
            Op::LoadInput(input) => {
                w.u8(TAG_LOAD_INPUT);
                w.handle(input);
            }
            Op::StoreOutput { output, value } => {
                w.u8(TAG_STORE_OUTPUT);
                w.handle(output);
                w.handle(value);
            }
            Op::LoadPushData { scope, offset, ty } => {
                w.u8(TAG_LOAD_PUSH_DATA);
                w.u8(scope as u8);
                w.u32(offset);
                w.ty(ty);
            }
            Op::LoadBuiltIn(builtin) => {
                w.u8(TAG_LOAD_BUILTIN);
                w.u8(builtin as u8);
            }
            Op::Binary { op, ty, lhs, rhs } => {
                w.u8(TAG_BINARY);
                w.u8(op as u8);
                w.ty(ty);
                w.handle(lhs);
                w.handle(rhs);
            }
            Op::Sample {
                image,
                sampler,
                coord,
            } => {
                w.u8(TAG_SAMPLE);
                w.handle(image);
                w.handle(sampler);
                w.handle(coord);
            }
            Op::BufferLoad {
                resource,
                address,
                ty,
            } => {
                w.u8(TAG_BUFFER_LOAD);
                w.handle(resource);
                w.handle(address);
                w.ty(ty);
            }
            Op::BufferStore {
                resource,
                address,
                value,
            } => {
                w.u8(TAG_BUFFER_STORE);
                w.handle(resource);
                w.handle(address);
                w.handle(value);
            }
            Op::AtomicIncrement { counter } => {
                w.u8(TAG_ATOMIC_INCREMENT);
                w.handle(counter);
            }
            Op::AtomicDecrement { counter } => {
                w.u8(TAG_ATOMIC_DECREMENT);
                w.handle(counter);
            }
            Op::Return => w.u8(TAG_RETURN),
        }
    }

    w.data
}

/// Deserializes a blob produced by [`serialize`] into `builder`.
pub fn deserialize(data: &[u8], builder: &mut Builder) -> Result<(), ShaderError> {
    let mut r = Reader { data, offset: 0 };

    builder.stage = ShaderStage::from_bits(r.u32()?)
        .ok_or_else(|| ShaderError::Deserialize("invalid shader stage".into()))?;
    builder.input_topology = PrimitiveTopology::from_u8(r.u8()?)
        .ok_or_else(|| ShaderError::Deserialize("invalid input topology".into()))?;
    builder.output_topology = PrimitiveTopology::from_u8(r.u8()?)
        .ok_or_else(|| ShaderError::Deserialize("invalid output topology".into()))?;
    builder.patch_vertex_count = r.u32()?;

    let op_count = r.u32()? as usize;

    for index in 0..op_count {
        // Instructions may only reference earlier instructions.
        let limit = index;

        let op = match r.u8()? {
            TAG_DCL_SAMPLER => Op::DclSampler {
                register_space: r.u32()?,
                register_index: r.u32()?,
            },
            TAG_DCL_CBV => Op::DclCbv {
                register_space: r.u32()?,
                register_index: r.u32()?,
                size: r.u32()?,
            },
            TAG_DCL_SRV => Op::DclSrv {
                register_space: r.u32()?,
                register_index: r.u32()?,
                dim: read_dim(&mut r)?,
            },
            TAG_DCL_UAV => Op::DclUav {
                register_space: r.u32()?,
                register_index: r.u32()?,
                dim: read_dim(&mut r)?,
            },
            TAG_DCL_UAV_COUNTER => Op::DclUavCounter {
                uav: r.handle(limit)?,
            },
            TAG_DCL_PUSH_DATA => Op::DclPushData {
                scope: read_scope(&mut r)?,
                offset: r.u32()?,
                size: r.u32()?,
            },
            TAG_DCL_INPUT => Op::DclInput {
                var: r.io_var()?,
                ty: r.ty()?,
            },
            TAG_DCL_OUTPUT => Op::DclOutput {
                var: r.io_var()?,
                ty: r.ty()?,
            },
            TAG_DCL_SPEC_CONSTANT => Op::DclSpecConstant {
                id: r.u32()?,
                default: r.u32()?,
            },
            TAG_DCL_SAMPLER_HEAP => Op::DclSamplerHeap,
            TAG_SAMPLER_HEAP_REF => Op::SamplerHeapRef {
                heap: r.handle(limit)?,
                push_offset: r.u32()?,
                wide: r.u8()? != 0,
            },
            TAG_DCL_BINDING => Op::DclBinding {
                kind: read_kind(&mut r)?,
                dim: read_dim(&mut r)?,
                set: r.u8()?,
                binding: r.u32()?,
            },
            TAG_COUNTER_ADDRESS => Op::CounterAddress {
                push_offset: r.u32()?,
            },
            TAG_COUNTER_BINDING => Op::CounterBinding { binding: r.u32()? },
            TAG_CONST_F32 => Op::ConstF32(r.u32()?),
            TAG_CONST_U32 => Op::ConstU32(r.u32()?),
            TAG_LOAD_INPUT => Op::LoadInput(r.handle(limit)?),
            TAG_STORE_OUTPUT => Op::StoreOutput {
                output: r.handle(limit)?,
                value: r.handle(limit)?,
            },
            TAG_LOAD_PUSH_DATA => Op::LoadPushData {
                scope: read_scope(&mut r)?,
                offset: r.u32()?,
                ty: r.ty()?,
            },
            TAG_LOAD_BUILTIN => {
                let raw = r.u8()?;
                Op::LoadBuiltIn(BuiltIn::from_u8(raw).ok_or_else(|| {
                    ShaderError::Deserialize(format!("invalid built-in {raw}"))
                })?)
            }
            TAG_BINARY => Op::Binary {
                op: read_binary_op(&mut r)?,
                ty: r.ty()?,
                lhs: r.handle(limit)?,
                rhs: r.handle(limit)?,
            },
            TAG_SAMPLE => Op::Sample {
                image: r.handle(limit)?,
                sampler: r.handle(limit)?,
                coord: r.handle(limit)?,
            },
            TAG_BUFFER_LOAD => Op::BufferLoad {
                resource: r.handle(limit)?,
                address: r.handle(limit)?,
                ty: r.ty()?,
            },
            TAG_BUFFER_STORE => Op::BufferStore {
                resource: r.handle(limit)?,
                address: r.handle(limit)?,
                value: r.handle(limit)?,
            },
            TAG_ATOMIC_INCREMENT => Op::AtomicIncrement {
                counter: r.handle(limit)?,
            },
            TAG_ATOMIC_DECREMENT => Op::AtomicDecrement {
                counter: r.handle(limit)?,
            },
            TAG_RETURN => Op::Return,
            tag => {
                return Err(ShaderError::Deserialize(format!(
                    "invalid instruction tag {tag}"
                )))
            }
        };

        builder.add(op);
    }

    Ok(())
}

fn read_kind(r: &mut Reader) -> Result<ResourceKind, ShaderError> {
    match r.u8()? {
        0 => Ok(ResourceKind::Sampler),
        1 => Ok(ResourceKind::Cbv),
        2 => Ok(ResourceKind::Srv),
        3 => Ok(ResourceKind::Uav),
        4 => Ok(ResourceKind::UavCounter),
        k => Err(ShaderError::Deserialize(format!(
            "invalid resource kind {k}"
        ))),
    }
}

fn read_dim(r: &mut Reader) -> Result<ResourceDim, ShaderError> {
    match r.u8()? {
        0 => Ok(ResourceDim::Buffer),
        1 => Ok(ResourceDim::Tex2d),
        2 => Ok(ResourceDim::Tex3d),
        d => Err(ShaderError::Deserialize(format!(
            "invalid resource dimension {d}"
        ))),
    }
}

fn read_scope(r: &mut Reader) -> Result<PushDataScope, ShaderError> {
    match r.u8()? {
        0 => Ok(PushDataScope::Shared),
        1 => Ok(PushDataScope::PerStage),
        s => Err(ShaderError::Deserialize(format!(
            "invalid push data scope {s}"
        ))),
    }
}

fn read_binary_op(r: &mut Reader) -> Result<BinaryOp, ShaderError> {
    let raw = r.u8()?;

    if raw > BinaryOp::Max as u8 {
        return Err(ShaderError::Deserialize(format!(
            "invalid binary op {raw}"
        )));
    }

    Ok(unsafe { std::mem::transmute(raw) })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_builder() -> Builder {
        let mut b = Builder::new();
        b.stage = ShaderStage::Fragment;
        b.input_topology = PrimitiveTopology::TriangleList;

        let sampler = b.add(Op::DclSampler {
            register_space: 0,
            register_index: 2,
        });
        let srv = b.add(Op::DclSrv {
            register_space: 0,
            register_index: 0,
            dim: ResourceDim::Tex2d,
        });
        let input = b.add(Op::DclInput {
            var: IoVar {
                location: 0,
                component_count: 4,
                semantic_name: "TEXCOORD".into(),
                ..Default::default()
            },
            ty: VecType::VEC4F,
        });
        let output = b.add(Op::DclOutput {
            var: IoVar {
                location: 0,
                component_count: 4,
                semantic_name: "SV_TARGET".into(),
                ..Default::default()
            },
            ty: VecType::VEC4F,
        });

        let coord = b.add(Op::LoadInput(input));
        let color = b.add(Op::Sample {
            image: srv,
            sampler,
            coord,
        });
        b.add(Op::StoreOutput {
            output,
            value: color,
        });
        b.add(Op::Return);
        b
    }

    #[test]
    fn serialization_round_trip() {
        let builder = sample_builder();
        let blob = serialize(&builder);

        let mut restored = Builder::new();
        deserialize(&blob, &mut restored).unwrap();

        assert_eq!(restored.stage, builder.stage);
        assert_eq!(restored.input_topology, builder.input_topology);
        assert_eq!(restored.len(), builder.len());

        for ((_, a), (_, b)) in restored.ops().zip(builder.ops()) {
            assert_eq!(a, b);
        }
    }

    #[test]
    fn rejects_forward_references() {
        let mut builder = sample_builder();
        // A store that references the instruction after it.
        let bogus = Handle::from_index(builder.len() + 4);
        builder.add(Op::LoadInput(bogus));

        let blob = serialize(&builder);
        let mut restored = Builder::new();
        assert!(deserialize(&blob, &mut restored).is_err());
    }

    #[test]
    fn rejects_truncated_blob() {
        let blob = serialize(&sample_builder());
        let mut restored = Builder::new();
        assert!(deserialize(&blob[..blob.len() - 3], &mut restored).is_err());
    }
}
