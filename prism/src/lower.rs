//! Binding-model lowering.
//!
//! Translates the source-API binding model into the Vulkan-facing one:
//!
//! - Sampler declarations collapse into one global sampler-heap descriptor
//!   (unbounded array on set 0) plus a packed per-stage push-data block of
//!   16- or 32-bit heap indices, one per sampler.
//! - UAV counters become a buffer-device-address pointer read from push
//!   data when the per-stage budget allows it, or a storage-buffer
//!   descriptor on the counter set otherwise.
//! - Cbv/srv/uav declarations become descriptor bindings with fixed set
//!   indices per kind; aliased srv/uav pairs resolve to one binding.
//! - Sample-count and coverage built-ins become shared push-data loads at
//!   a device-wide fixed offset.

use crate::{
    ir::{self, Op, PushDataScope, ResourceDim, ResourceKind, ScalarKind, VecType},
    limits, BindingInfo, BuiltIn, DescriptorType, Handle, IoMap, MetadataFlags,
    PipelineLayoutBuilder, PushDataBlock, SamplerHeapBinding, ShaderConverter, ShaderCreateInfo,
    ShaderError, ShaderLinkage, ShaderMetadata, ShaderStage, StageMask,
};

fn align(value: u32, alignment: u32) -> u32 {
    (value + alignment - 1) & !(alignment - 1)
}

/// Lowering pass over a converted IR builder. Produces the shader
/// metadata and the pipeline-layout builder as side products.
pub struct LowerBindingModel<'a> {
    info: &'a ShaderCreateInfo,
    converter: &'a dyn ShaderConverter,

    metadata: ShaderMetadata,
    layout: PipelineLayoutBuilder,

    local_push_offset: u32,
    local_push_align: u32,
    local_resource_mask: u32,
    shared_push_offset: u32,

    counter_binding_count: u32,
}

impl<'a> LowerBindingModel<'a> {
    pub fn new(info: &'a ShaderCreateInfo, converter: &'a dyn ShaderConverter) -> Self {
        Self {
            info,
            converter,
            metadata: ShaderMetadata::default(),
            layout: PipelineLayoutBuilder::default(),
            local_push_offset: 0,
            local_push_align: 4,
            local_resource_mask: 0,
            shared_push_offset: 0,
            counter_binding_count: 0,
        }
    }

    pub fn run(&mut self, builder: &mut ir::Builder) -> Result<(), ShaderError> {
        let stage = builder.stage;
        let stage_mask = StageMask::from(stage);

        self.metadata.stage = stage;
        self.metadata.input_topology = builder.input_topology;
        self.metadata.output_topology = builder.output_topology;
        self.metadata.patch_vertex_count = builder.patch_vertex_count;
        self.metadata.flat_shading_inputs = self.info.flat_shading_inputs;
        self.metadata.rasterized_stream = self.info.rasterized_stream;

        for entry in &self.info.xfb_entries {
            let buffer = entry.buffer as usize;

            if buffer >= self.metadata.xfb_strides.len() {
                return Err(ShaderError::Lowering(format!(
                    "xfb buffer index {buffer} out of range"
                )));
            }

            self.metadata.xfb_strides[buffer] = entry.stride;
        }

        self.layout = PipelineLayoutBuilder::new(stage_mask);

        self.collect_io(builder);
        self.lower_samplers(builder, stage)?;
        self.lower_resources(builder, stage);
        self.lower_counters(builder, stage)?;
        self.lower_builtins(builder);
        self.finalize_push_data(stage);

        if self
            .info
            .options
            .flags
            .contains(crate::CompileFlags::ENABLE_SAMPLE_RATE_SHADING)
            && stage == ShaderStage::Fragment
        {
            self.metadata.flags |= MetadataFlags::HAS_SAMPLE_RATE_SHADING;
        }

        Ok(())
    }

    pub fn take_metadata(&mut self) -> ShaderMetadata {
        std::mem::take(&mut self.metadata)
    }

    pub fn take_layout(&mut self) -> PipelineLayoutBuilder {
        std::mem::take(&mut self.layout)
    }

    fn collect_io(&mut self, builder: &ir::Builder) {
        let mut inputs = IoMap::new();
        let mut outputs = IoMap::new();
        let mut spec_mask = 0u32;

        for (_, op) in builder.ops() {
            match *op {
                Op::DclInput { ref var, .. } => inputs.add(var.clone()),
                Op::DclOutput { ref var, .. } => {
                    if var.builtin == Some(BuiltIn::StencilRef) {
                        self.metadata.flags |= MetadataFlags::EXPORTS_STENCIL_REF;
                    }
                    if var.builtin == Some(BuiltIn::ViewportIndex) {
                        self.metadata.flags |= MetadataFlags::EXPORTS_VIEWPORT_INDEX;
                    }
                    outputs.add(var.clone());
                }
                Op::DclSpecConstant { id, .. } => spec_mask |= 1 << id,
                _ => (),
            }
        }

        self.metadata.inputs = inputs;
        self.metadata.outputs = outputs;
        self.metadata.spec_constant_mask = spec_mask;
    }

    fn lower_samplers(
        &mut self,
        builder: &mut ir::Builder,
        stage: ShaderStage,
    ) -> Result<(), ShaderError> {
        let samplers: Vec<Handle<Op>> = builder
            .ops()
            .filter_map(|(handle, op)| matches!(op, Op::DclSampler { .. }).then_some(handle))
            .collect();

        if samplers.is_empty() {
            return Ok(());
        }

        let wide = !self
            .info
            .options
            .flags
            .contains(crate::CompileFlags::SUPPORTS_16BIT_PUSH_DATA);
        let index_size: u32 = if wide { 4 } else { 2 };

        // The index block is packed, but starts on a dword boundary so the
        // resource mask below stays meaningful.
        self.local_push_offset = align(self.local_push_offset, 4);
        let block_offset = self.local_push_offset;
        let block_size = align(index_size * samplers.len() as u32, 4);

        if block_offset + block_size > limits::MAX_PER_STAGE_PUSH_DATA_SIZE {
            return Err(ShaderError::Lowering(format!(
                "sampler index block of {block_size} bytes exceeds per-stage push data budget"
            )));
        }

        let heap = builder.add(Op::DclSamplerHeap);

        for (i, handle) in samplers.iter().enumerate() {
            builder.rewrite(
                *handle,
                Op::SamplerHeapRef {
                    heap,
                    push_offset: block_offset + index_size * i as u32,
                    wide,
                },
            );
        }

        let dword_count = block_size / 4;
        self.local_resource_mask |=
            ((1u32 << dword_count) - 1) << (block_offset / 4);
        self.local_push_offset = block_offset + block_size;

        self.layout.add_sampler_heap(SamplerHeapBinding {
            stages: stage.into(),
            set: limits::SET_SAMPLER,
            binding: 0,
        });

        self.metadata.flags |= MetadataFlags::USES_SAMPLER_HEAP;
        Ok(())
    }

    fn lower_resources(&mut self, builder: &mut ir::Builder, stage: ShaderStage) {
        let mut rewrites = Vec::new();

        for (handle, op) in builder.ops() {
            let (kind, dim, space, index) = match *op {
                Op::DclCbv {
                    register_space,
                    register_index,
                    ..
                } => (
                    ResourceKind::Cbv,
                    ResourceDim::Buffer,
                    register_space,
                    register_index,
                ),
                Op::DclSrv {
                    register_space,
                    register_index,
                    dim,
                } => (ResourceKind::Srv, dim, register_space, register_index),
                Op::DclUav {
                    register_space,
                    register_index,
                    dim,
                } => (ResourceKind::Uav, dim, register_space, register_index),
                _ => continue,
            };

            let set = match kind {
                ResourceKind::Cbv => limits::SET_CBV,
                ResourceKind::Srv => limits::SET_SRV,
                _ => limits::SET_UAV,
            };

            let binding = self
                .converter
                .determine_resource_index(stage, kind, space, index);

            let descriptor_type = match (kind, dim) {
                (ResourceKind::Cbv, _) => DescriptorType::UniformBuffer,
                (ResourceKind::Srv, ResourceDim::Buffer) => DescriptorType::UniformTexelBuffer,
                (ResourceKind::Srv, _) => DescriptorType::SampledImage,
                (_, ResourceDim::Buffer) => DescriptorType::StorageBuffer,
                (_, _) => DescriptorType::StorageImage,
            };

            self.layout.add_bindings(&[BindingInfo {
                stages: stage.into(),
                descriptor_type,
                set,
                binding,
                count: 1,
                resource_index: index,
            }]);

            rewrites.push((
                handle,
                Op::DclBinding {
                    kind,
                    dim,
                    set,
                    binding,
                },
            ));
        }

        for (handle, op) in rewrites {
            builder.rewrite(handle, op);
        }
    }

    fn lower_counters(
        &mut self,
        builder: &mut ir::Builder,
        stage: ShaderStage,
    ) -> Result<(), ShaderError> {
        let counters: Vec<Handle<Op>> = builder
            .ops()
            .filter_map(|(handle, op)| matches!(op, Op::DclUavCounter { .. }).then_some(handle))
            .collect();

        for handle in counters {
            let bda_offset = align(self.local_push_offset, 8);
            let fits_push_data = bda_offset + 8 <= limits::MAX_PER_STAGE_PUSH_DATA_SIZE;

            if fits_push_data {
                builder.rewrite(
                    handle,
                    Op::CounterAddress {
                        push_offset: bda_offset,
                    },
                );

                self.local_push_align = self.local_push_align.max(8);
                self.local_resource_mask |= 0x3 << (bda_offset / 4);
                self.local_push_offset = bda_offset + 8;
            } else {
                let binding = self.counter_binding_count;
                self.counter_binding_count += 1;

                builder.rewrite(handle, Op::CounterBinding { binding });

                self.layout.add_bindings(&[BindingInfo {
                    stages: stage.into(),
                    descriptor_type: DescriptorType::StorageBuffer,
                    set: limits::SET_UAV_COUNTER,
                    binding,
                    count: 1,
                    resource_index: binding,
                }]);
            }
        }

        Ok(())
    }

    fn lower_builtins(&mut self, builder: &mut ir::Builder) {
        let sample_count_offset = self.info.options.sample_count_push_data_offset as u32;

        let mut rewrites = Vec::new();

        for (handle, op) in builder.ops() {
            match *op {
                Op::LoadBuiltIn(BuiltIn::SampleCount) => {
                    rewrites.push((handle, sample_count_offset));
                }
                Op::LoadBuiltIn(BuiltIn::FragCoverage) => {
                    rewrites.push((handle, sample_count_offset + 4));
                }
                Op::DclPushData {
                    scope,
                    offset,
                    size,
                } => match scope {
                    PushDataScope::Shared => {
                        self.shared_push_offset = self.shared_push_offset.max(offset + size);
                    }
                    PushDataScope::PerStage => {
                        self.local_push_offset = self.local_push_offset.max(offset + size);
                    }
                },
                _ => (),
            }
        }

        for (handle, offset) in rewrites {
            builder.rewrite(
                handle,
                Op::LoadPushData {
                    scope: PushDataScope::Shared,
                    offset,
                    ty: VecType::scalar(ScalarKind::U32),
                },
            );
            self.shared_push_offset = self.shared_push_offset.max(offset + 4);
        }
    }

    fn finalize_push_data(&mut self, stage: ShaderStage) {
        if self.shared_push_offset != 0 {
            self.layout.add_push_data(
                PipelineLayoutBuilder::SHARED_PUSH_DATA_BLOCK,
                PushDataBlock {
                    stages: StageMask::all(),
                    offset: 0,
                    size: align(self.shared_push_offset, 4),
                    alignment: 4,
                    resource_dword_mask: 0,
                },
            );
        }

        if self.local_push_offset != 0 {
            self.layout.add_push_data(
                PipelineLayoutBuilder::per_stage_push_data_block(stage),
                PushDataBlock {
                    stages: stage.into(),
                    offset: limits::MAX_SHARED_PUSH_DATA_SIZE,
                    size: align(self.local_push_offset, 4),
                    alignment: self.local_push_align,
                    resource_dword_mask: self.local_resource_mask,
                },
            );
        }
    }
}

/// Applies link-time IR fix-ups that depend on the adjacent pipeline
/// stages rather than on the shader itself.
pub fn apply_linkage(
    builder: &mut ir::Builder,
    metadata: &ShaderMetadata,
    info: &ShaderCreateInfo,
    linkage: &ShaderLinkage,
) {
    let _ = info;

    // Geometry shaders may be re-linked against a different input topology
    // than they were declared with.
    if metadata.stage == ShaderStage::Geometry
        && linkage.input_topology != crate::PrimitiveTopology::Undefined
        && linkage.input_topology != metadata.input_topology
    {
        builder.input_topology = linkage.input_topology;
    }

    // Null out loads of inputs the previous stage does not produce.
    if let Some(prev_stage) = linkage.prev_stage {
        if metadata.stage != ShaderStage::Compute
            && !IoMap::check_stage_compatibility(
                metadata.stage,
                &metadata.inputs,
                prev_stage,
                &linkage.prev_stage_outputs,
            )
        {
            resolve_mismatched_io(builder, &linkage.prev_stage_outputs);
        }
    }

    // Tessellation stages agree on patch-constant locations by renumbering
    // them in declaration order past the per-vertex locations.
    if matches!(
        metadata.stage,
        ShaderStage::TessControl | ShaderStage::TessEval
    ) {
        resolve_patch_constant_locations(builder);
    }
}

fn resolve_mismatched_io(builder: &mut ir::Builder, prev_outputs: &IoMap) {
    let produced = prev_outputs.location_mask();

    let dead_inputs: Vec<Handle<Op>> = builder
        .ops()
        .filter_map(|(handle, op)| match op {
            Op::DclInput { var, .. } => {
                (var.builtin.is_none() && produced & (1 << var.location) == 0).then_some(handle)
            }
            _ => None,
        })
        .collect();

    if dead_inputs.is_empty() {
        return;
    }

    let rewrites: Vec<(Handle<Op>, Op)> = builder
        .ops()
        .filter_map(|(handle, op)| match *op {
            Op::LoadInput(input) if dead_inputs.contains(&input) => {
                Some((handle, Op::ConstU32(0)))
            }
            _ => None,
        })
        .collect();

    for (handle, op) in rewrites {
        builder.rewrite(handle, op);
    }
}

fn resolve_patch_constant_locations(builder: &mut ir::Builder) {
    let per_vertex_max = builder
        .ops()
        .filter_map(|(_, op)| match op {
            Op::DclInput { var, .. } | Op::DclOutput { var, .. }
                if !var.patch_constant && var.builtin.is_none() =>
            {
                Some(var.location)
            }
            _ => None,
        })
        .max()
        .map_or(0, |l| l + 1);

    let mut next = per_vertex_max;

    for (_, op) in builder.ops_mut() {
        if let Op::DclInput { var, .. } | Op::DclOutput { var, .. } = op {
            if var.patch_constant && var.builtin.is_none() {
                var.location = next;
                next += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CompileFlags, ShaderOptions};

    struct TestConverter;

    impl ShaderConverter for TestConverter {
        fn convert_shader(&self, _builder: &mut ir::Builder) -> Result<(), ShaderError> {
            Ok(())
        }

        fn determine_resource_index(
            &self,
            _stage: ShaderStage,
            _kind: ResourceKind,
            register_space: u32,
            register_index: u32,
        ) -> u32 {
            register_space * 64 + register_index
        }

        fn debug_name(&self) -> String {
            "test".into()
        }
    }

    fn build_shader(flags: CompileFlags) -> (ir::Builder, ShaderMetadata, PipelineLayoutBuilder) {
        let mut builder = ir::Builder::new();
        builder.stage = ShaderStage::Compute;

        builder.add(Op::DclSampler {
            register_space: 0,
            register_index: 0,
        });
        builder.add(Op::DclSampler {
            register_space: 0,
            register_index: 5,
        });
        let uav = builder.add(Op::DclUav {
            register_space: 0,
            register_index: 1,
            dim: ResourceDim::Buffer,
        });
        builder.add(Op::DclUavCounter { uav });
        builder.add(Op::Return);

        let info = ShaderCreateInfo {
            options: ShaderOptions {
                flags,
                ..Default::default()
            },
            ..Default::default()
        };

        let converter = TestConverter;
        let mut pass = LowerBindingModel::new(&info, &converter);
        pass.run(&mut builder).unwrap();

        (builder, pass.take_metadata(), pass.take_layout())
    }

    #[test]
    fn samplers_collapse_into_heap_indices() {
        let (builder, metadata, layout) = build_shader(CompileFlags::SUPPORTS_16BIT_PUSH_DATA);

        let refs: Vec<_> = builder
            .ops()
            .filter_map(|(_, op)| match *op {
                Op::SamplerHeapRef {
                    push_offset, wide, ..
                } => Some((push_offset, wide)),
                _ => None,
            })
            .collect();

        // Two 16-bit indices packed into one dword.
        assert_eq!(refs, vec![(0, false), (2, false)]);
        assert!(metadata.flags.contains(MetadataFlags::USES_SAMPLER_HEAP));
        assert_eq!(layout.sampler_heap_bindings().len(), 1);
        assert_eq!(layout.sampler_heap_bindings()[0].set, limits::SET_SAMPLER);
        assert!(builder
            .ops()
            .any(|(_, op)| matches!(op, Op::DclSamplerHeap)));
    }

    #[test]
    fn compute_counter_uses_push_data_address() {
        let (builder, _, layout) = build_shader(CompileFlags::empty());

        let counter = builder
            .ops()
            .find_map(|(_, op)| match *op {
                Op::CounterAddress { push_offset } => Some(push_offset),
                _ => None,
            })
            .expect("counter not lowered to BDA");

        // Two 32-bit sampler indices occupy bytes 0..8, the counter address
        // lands on the next 8-byte boundary.
        assert_eq!(counter, 8);

        let stage_block = layout
            .push_data_block(PipelineLayoutBuilder::per_stage_push_data_block(
                ShaderStage::Compute,
            ))
            .expect("missing per-stage push data block");

        assert_eq!(stage_block.alignment, 8);
        assert_eq!(stage_block.size, 16);
        // Sampler dwords 0 and 1, counter dwords 2 and 3.
        assert_eq!(stage_block.resource_dword_mask, 0xf);
    }

    #[test]
    fn uav_binding_set_and_index() {
        let (builder, _, layout) = build_shader(CompileFlags::empty());

        let binding = builder
            .ops()
            .find_map(|(_, op)| match *op {
                Op::DclBinding { set, binding, .. } => Some((set, binding)),
                _ => None,
            })
            .unwrap();

        assert_eq!(binding, (limits::SET_UAV, 1));
        assert!(layout
            .bindings()
            .iter()
            .any(|b| b.set == limits::SET_UAV && b.binding == 1));
    }
}
