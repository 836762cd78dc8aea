//! End-to-end cache behavior over real files.

use std::path::PathBuf;
use std::sync::Arc;

use prism::cache::{FilePaths, ShaderCache};
use prism::ir::{self, Op, ResourceDim, ResourceKind, VecType};
use prism::{
    IoVar, IrShader, ShaderConverter, ShaderCreateInfo, ShaderError, ShaderStage,
};

struct PassthroughConverter {
    name: String,
    stage: ShaderStage,
}

impl ShaderConverter for PassthroughConverter {
    fn convert_shader(&self, builder: &mut ir::Builder) -> Result<(), ShaderError> {
        builder.stage = self.stage;

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
        builder.add(Op::DclSrv {
            register_space: 0,
            register_index: 0,
            dim: ResourceDim::Tex2d,
        });

        let value = builder.add(Op::LoadInput(input));
        builder.add(Op::StoreOutput { output, value });
        builder.add(Op::Return);
        Ok(())
    }

    fn determine_resource_index(
        &self,
        _stage: ShaderStage,
        _kind: ResourceKind,
        _register_space: u32,
        register_index: u32,
    ) -> u32 {
        register_index
    }

    fn debug_name(&self) -> String {
        self.name.clone()
    }
}

fn test_paths(tag: &str) -> FilePaths {
    let directory: PathBuf = std::env::temp_dir().join(format!(
        "prism-cache-test-{}-{tag}",
        std::process::id()
    ));

    FilePaths {
        directory,
        lut_file: "0123456789abcdef.dxvk.lut".into(),
        bin_file: "0123456789abcdef.dxvk.bin".into(),
    }
}

fn make_shader(name: &str, info: &ShaderCreateInfo) -> Arc<IrShader> {
    Arc::new(IrShader::new(
        info.clone(),
        Arc::new(PassthroughConverter {
            name: name.into(),
            stage: ShaderStage::Fragment,
        }),
    ))
}

#[test]
fn miss_then_hit_across_instances() {
    let paths = test_paths("roundtrip");
    let _ = std::fs::remove_dir_all(&paths.directory);

    let info = ShaderCreateInfo {
        flat_shading_inputs: 0x3,
        ..Default::default()
    };

    {
        let cache = ShaderCache::with_paths(paths.clone());
        assert!(cache.lookup("s1", &info).is_none());

        cache.add(make_shader("s1", &info));
        // Dropping the cache drains the writer queue and flushes the files.
    }

    // A fresh instance plays the role of a second process reading the
    // same files.
    let cache = ShaderCache::with_paths(paths.clone());
    let shader = cache
        .lookup("s1", &info)
        .expect("cached shader not found after reopen");

    let metadata = shader.metadata().unwrap();
    assert_eq!(metadata.stage, ShaderStage::Fragment);
    assert_eq!(metadata.inputs.len(), 1);
    assert_eq!(metadata.outputs.len(), 1);

    // Different options must not alias the cached entry.
    let other = ShaderCreateInfo::default();
    assert!(cache.lookup("s1", &other).is_none());

    // The restored shader compiles without its converter.
    let code = shader.get_code(None, None).unwrap();
    assert_eq!(code[0], 0x0723_0203);

    let _ = std::fs::remove_dir_all(&paths.directory);
}

#[test]
fn cached_code_matches_original() {
    let paths = test_paths("bitexact");
    let _ = std::fs::remove_dir_all(&paths.directory);

    let info = ShaderCreateInfo::default();
    let original = make_shader("s2", &info);

    let original_meta = original.metadata().unwrap();
    let original_layout = original.layout().unwrap();
    let original_code = original.get_code(None, None).unwrap();

    {
        let cache = ShaderCache::with_paths(paths.clone());
        cache.add(Arc::clone(&original));
    }

    let cache = ShaderCache::with_paths(paths.clone());
    let restored = cache.lookup("s2", &info).unwrap();

    assert_eq!(restored.metadata().unwrap(), original_meta);
    assert_eq!(restored.layout().unwrap(), original_layout);
    assert_eq!(restored.get_code(None, None).unwrap(), original_code);

    let _ = std::fs::remove_dir_all(&paths.directory);
}

#[test]
fn corrupt_lut_is_discarded() {
    let paths = test_paths("corrupt");
    let _ = std::fs::remove_dir_all(&paths.directory);

    let info = ShaderCreateInfo::default();

    {
        let cache = ShaderCache::with_paths(paths.clone());
        cache.add(make_shader("s3", &info));
    }

    // Damage the LUT header magic.
    let lut_path = paths.directory.join(&paths.lut_file);
    let mut data = std::fs::read(&lut_path).unwrap();
    data[0] ^= 0xff;
    std::fs::write(&lut_path, data).unwrap();

    // The cache silently recreates itself and reports a miss.
    let cache = ShaderCache::with_paths(paths.clone());
    assert!(cache.lookup("s3", &info).is_none());

    // The files were truncated back to an empty cache.
    let lut_len = std::fs::metadata(&lut_path).unwrap().len();
    assert!(lut_len > 0);

    let bin_len = std::fs::metadata(paths.directory.join(&paths.bin_file))
        .unwrap()
        .len();
    assert_eq!(bin_len, 0);

    let _ = std::fs::remove_dir_all(&paths.directory);
}
