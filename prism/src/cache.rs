//! On-disk shader cache.
//!
//! The cache consists of two append-only files: a look-up table and a
//! binary blob file. The LUT carries a magic/version header and one record
//! per shader keyed by `{name, create-info}`; the binary file is a plain
//! concatenation of `[ir | metadata | layout]` records addressed by
//! offsets from the LUT. Growing the cache never rewrites existing data,
//! so multiple processes can share the files.
//!
//! Writes are queued to a background writer thread and flushed in batches.
//! Any write failure disables the cache for the rest of the process.

use std::{
    collections::VecDeque,
    fs,
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Weak,
    },
    thread,
};

use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;

use crate::{
    BindingInfo, BuiltIn, CompileFlags, DescriptorType, FloatControlFlags, IoMap, IoVar, IrShader,
    MetadataFlags, PipelineLayoutBuilder, PrimitiveTopology, PushDataBlock, SamplerHeapBinding,
    ShaderCreateInfo, ShaderMetadata, ShaderOptions, ShaderStage, StageMask, XfbEntry,
};

const LUT_MAGIC: [u8; 4] = *b"DXVK";
const WRITE_BATCH_SIZE: usize = 128;

pub(crate) const FNV1A_INIT: u64 = 0xcbf2_9ce4_8422_2325;
const FNV1A_PRIME: u64 = 0x0000_0100_0000_01b3;

pub(crate) fn fnv1a(init: u64, data: &[u8]) -> u64 {
    data.iter()
        .fold(init, |hash, &byte| (hash ^ byte as u64).wrapping_mul(FNV1A_PRIME))
}

/// Locations of the cache files.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FilePaths {
    pub directory: PathBuf,
    pub lut_file: String,
    pub bin_file: String,
}

impl FilePaths {
    fn is_empty(&self) -> bool {
        self.directory.as_os_str().is_empty()
            || self.lut_file.is_empty()
            || self.bin_file.is_empty()
    }

    fn lut_path(&self) -> PathBuf {
        self.directory.join(&self.lut_file)
    }

    fn bin_path(&self) -> PathBuf {
        self.directory.join(&self.bin_file)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct LutKey {
    name: String,
    info: ShaderCreateInfo,
}

#[derive(Clone, Copy, Debug, Default)]
struct LutEntry {
    offset: u64,
    binary_size: u32,
    metadata_size: u32,
    checksum: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
enum Status {
    Uninitialized = 0,
    Disabled = 1,
    WriteOnly = 2,
    ReadWrite = 3,
}

impl Status {
    fn from_u32(raw: u32) -> Self {
        match raw {
            1 => Self::Disabled,
            2 => Self::WriteOnly,
            3 => Self::ReadWrite,
            _ => Self::Uninitialized,
        }
    }
}

struct Files {
    lut: Option<fs::File>,
    bin: Option<fs::File>,
    lut_len: u64,
    bin_len: u64,
}

impl Files {
    fn append(file: &mut fs::File, len: &mut u64, data: &[u8]) -> bool {
        if file.seek(SeekFrom::Start(*len)).is_err() {
            return false;
        }

        if file.write_all(data).is_err() {
            return false;
        }

        *len += data.len() as u64;
        true
    }

    fn read_at(file: &mut fs::File, offset: u64, len: usize) -> Option<Vec<u8>> {
        file.seek(SeekFrom::Start(offset)).ok()?;

        let mut data = vec![0u8; len];
        file.read_exact(&mut data).ok()?;
        Some(data)
    }
}

struct CacheState {
    paths: FilePaths,
    status: AtomicU32,

    files: Mutex<Files>,
    lut: Mutex<FxHashMap<LutKey, LutEntry>>,

    write_queue: Mutex<VecDeque<Option<Arc<IrShader>>>>,
    write_cond: Condvar,
}

/// Shader cache instance.
///
/// Initialization is lazy; the first lookup or add opens or creates the
/// cache files. The process-wide instance is managed through
/// [`ShaderCache::instance`] and recreated on demand.
pub struct ShaderCache {
    state: Arc<CacheState>,
    writer: Mutex<Option<thread::JoinHandle<()>>>,
}

static INSTANCE: Lazy<Mutex<Weak<ShaderCache>>> = Lazy::new(|| Mutex::new(Weak::new()));

impl ShaderCache {
    /// Retrieves or creates the process-wide cache instance.
    pub fn instance() -> Arc<ShaderCache> {
        let mut slot = INSTANCE.lock();

        if let Some(cache) = slot.upgrade() {
            return cache;
        }

        let cache = Arc::new(ShaderCache::with_paths(Self::default_file_paths()));
        *slot = Arc::downgrade(&cache);
        cache
    }

    /// Creates a cache over explicit file paths.
    pub fn with_paths(paths: FilePaths) -> Self {
        Self {
            state: Arc::new(CacheState {
                paths,
                status: AtomicU32::new(Status::Uninitialized as u32),
                files: Mutex::new(Files {
                    lut: None,
                    bin: None,
                    lut_len: 0,
                    bin_len: 0,
                }),
                lut: Mutex::new(FxHashMap::default()),
                write_queue: Mutex::new(VecDeque::new()),
                write_cond: Condvar::new(),
            }),
            writer: Mutex::new(None),
        }
    }

    /// Determines cache file paths from the environment and the current
    /// executable. Returns empty paths if the cache is disabled.
    pub fn default_file_paths() -> FilePaths {
        if matches!(std::env::var("DXVK_SHADER_CACHE"), Ok(v) if v == "0") {
            return FilePaths::default();
        }

        let mut directory = match std::env::var("DXVK_SHADER_CACHE_PATH") {
            Ok(path) if !path.is_empty() => PathBuf::from(path),
            _ => {
                let base = std::env::var("LOCALAPPDATA")
                    .or_else(|_| std::env::var("XDG_CACHE_HOME"))
                    .map(PathBuf::from)
                    .or_else(|_| {
                        std::env::var("HOME").map(|home| PathBuf::from(home).join(".cache"))
                    });

                match base {
                    Ok(base) => base,
                    Err(_) => return FilePaths::default(),
                }
            }
        };

        if std::env::var("DXVK_SHADER_CACHE_PATH").is_err() {
            directory = directory.join("veneer");
        }

        let exe = match std::env::current_exe() {
            Ok(exe) => exe,
            Err(_) => return FilePaths::default(),
        };

        // Hash the last two path components so identically named binaries
        // in different install locations get separate caches.
        let mut hash = FNV1A_INIT;

        let components: Vec<_> = exe
            .components()
            .rev()
            .take(2)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();

        for (i, component) in components.iter().enumerate() {
            if i != 0 {
                hash = fnv1a(hash, std::path::MAIN_SEPARATOR_STR.as_bytes());
            }
            hash = fnv1a(hash, component.as_os_str().to_string_lossy().as_bytes());
        }

        let base_name = format!("{hash:016x}");

        FilePaths {
            directory,
            lut_file: format!("{base_name}.dxvk.lut"),
            bin_file: format!("{base_name}.dxvk.bin"),
        }
    }

    /// Looks up a shader with matching name and create info.
    pub fn lookup(&self, name: &str, info: &ShaderCreateInfo) -> Option<Arc<IrShader>> {
        self.state.lookup(name, info)
    }

    /// Queues a shader for writing. Returns immediately; the write happens
    /// on the cache writer thread.
    pub fn add(&self, shader: Arc<IrShader>) {
        if !self.state.ensure_status(Status::ReadWrite) {
            return;
        }

        let key = LutKey {
            name: shader.debug_name().into(),
            info: shader.create_info().clone(),
        };

        if self.state.lut.lock().contains_key(&key) {
            return;
        }

        let mut queue = self.state.write_queue.lock();
        queue.push_back(Some(shader));
        self.state.write_cond.notify_one();
        drop(queue);

        let mut writer = self.writer.lock();

        if writer.is_none() {
            let state = Arc::clone(&self.state);
            *writer = Some(
                thread::Builder::new()
                    .name("veneer-cache".into())
                    .spawn(move || state.run_writer())
                    .expect("failed to spawn cache writer"),
            );
        }
    }
}

impl Drop for ShaderCache {
    fn drop(&mut self) {
        let handle = self.writer.get_mut().take();

        if let Some(handle) = handle {
            self.state.write_queue.lock().push_back(None);
            self.state.write_cond.notify_one();
            let _ = handle.join();
        }
    }
}

impl CacheState {
    fn lookup(&self, name: &str, info: &ShaderCreateInfo) -> Option<Arc<IrShader>> {
        if !self.ensure_status(Status::ReadWrite) {
            return None;
        }

        let key = LutKey {
            name: name.into(),
            info: info.clone(),
        };

        let entry = match self.lut.lock().get(&key) {
            Some(entry) => *entry,
            None => {
                log::debug!("Shader cache miss: {name}");
                return None;
            }
        };

        log::debug!(
            "Shader cache hit: {name} (offset: {}, size: {}, metadata: {})",
            entry.offset,
            entry.binary_size,
            entry.metadata_size
        );

        let mut files = self.files.lock();
        let shader = self.load_cached_shader_locked(&mut files, &key, &entry);

        if shader.is_none() {
            log::warn!("Failed to load cached shader {name}");

            // The files are in an unknown state; truncate and start over.
            if !self.open_write_only_locked(&mut files) {
                log::warn!("Failed to re-initialize shader cache");
            }

            self.status
                .store(Status::WriteOnly as u32, Ordering::Release);
        }

        shader
    }

    fn ensure_status(&self, wanted: Status) -> bool {
        let mut status = Status::from_u32(self.status.load(Ordering::Acquire));

        if status == Status::Uninitialized {
            status = self.initialize();
        }

        status >= wanted
    }

    fn initialize(&self) -> Status {
        let mut files = self.files.lock();
        let status = Status::from_u32(self.status.load(Ordering::Relaxed));

        if status != Status::Uninitialized {
            return status;
        }

        let status = self.try_initialize_locked(&mut files);
        self.status.store(status as u32, Ordering::Release);
        status
    }

    fn try_initialize_locked(&self, files: &mut Files) -> Status {
        if self.paths.is_empty() {
            log::warn!("No path found for shader cache, consider setting DXVK_SHADER_CACHE_PATH.");
            return Status::Disabled;
        }

        if self.open_read_write_locked(files) {
            match self.parse_lut_locked(files) {
                Some(lut) => {
                    *self.lut.lock() = lut;
                    return Status::ReadWrite;
                }
                None => log::warn!("Failed to parse cache look-up table."),
            }
        }

        if self.open_write_only_locked(files) {
            return Status::ReadWrite;
        }

        Status::Disabled
    }

    fn open_read_write_locked(&self, files: &mut Files) -> bool {
        let open = |path: &Path| fs::OpenOptions::new().read(true).write(true).open(path).ok();

        files.bin = open(&self.paths.bin_path());
        files.lut = open(&self.paths.lut_path());

        if files.bin.is_none() || files.lut.is_none() {
            return false;
        }

        let file_len = |file: &Option<fs::File>| {
            file.as_ref()
                .and_then(|f| f.metadata().ok())
                .map(|m| m.len())
                .unwrap_or(0)
        };

        files.bin_len = file_len(&files.bin);
        files.lut_len = file_len(&files.lut);

        log::info!("Found cache file: {}", self.paths.bin_path().display());
        true
    }

    fn open_write_only_locked(&self, files: &mut Files) -> bool {
        // Didn't have a lot of success so far, nuke the files and retry.
        let open = |path: &Path| {
            fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)
                .ok()
        };

        files.bin = open(&self.paths.bin_path());
        files.lut = open(&self.paths.lut_path());

        if files.bin.is_none() || files.lut.is_none() {
            if fs::create_dir_all(&self.paths.directory).is_err() {
                log::warn!(
                    "Failed to create directory: {}",
                    self.paths.directory.display()
                );
                return false;
            }

            files.bin = open(&self.paths.bin_path());
            files.lut = open(&self.paths.lut_path());
        }

        if files.bin.is_none() || files.lut.is_none() {
            log::warn!(
                "Failed to create {}, disabling cache",
                self.paths.bin_path().display()
            );
            return false;
        }

        files.bin_len = 0;
        files.lut_len = 0;
        self.lut.lock().clear();

        log::info!("Created cache file: {}", self.paths.bin_path().display());

        let mut header = Vec::new();
        header.extend_from_slice(&LUT_MAGIC);
        write_string(&mut header, env!("CARGO_PKG_VERSION"));

        let lut = files.lut.as_mut().unwrap();
        Files::append(lut, &mut files.lut_len, &header)
    }

    fn parse_lut_locked(&self, files: &mut Files) -> Option<FxHashMap<LutKey, LutEntry>> {
        let len = files.lut_len as usize;
        let lut_file = files.lut.as_mut()?;
        let data = Files::read_at(lut_file, 0, len)?;

        let mut r = ByteReader { data: &data, offset: 0 };

        if r.bytes(4)? != LUT_MAGIC {
            log::warn!("Failed to parse cache file header.");
            return None;
        }

        let version = r.string()?;

        if version != env!("CARGO_PKG_VERSION") {
            log::warn!(
                "Cache was created with version {version}, but current version is {}. Discarding old cache.",
                env!("CARGO_PKG_VERSION")
            );
            return None;
        }

        let mut lut = FxHashMap::default();

        while r.offset < data.len() {
            let (key, entry) = read_lut_record(&mut r)?;
            lut.insert(key, entry);
        }

        Some(lut)
    }

    fn load_cached_shader_locked(
        &self,
        files: &mut Files,
        key: &LutKey,
        entry: &LutEntry,
    ) -> Option<Arc<IrShader>> {
        let bin = files.bin.as_mut()?;

        let total = entry.binary_size as usize + entry.metadata_size as usize;
        let data = Files::read_at(bin, entry.offset, total)?;

        let ir = &data[..entry.binary_size as usize];

        if entry.checksum != fnv1a(FNV1A_INIT, ir) {
            log::warn!("Checksum mismatch for cached shader");
            return None;
        }

        let mut r = ByteReader {
            data: &data[entry.binary_size as usize..],
            offset: 0,
        };

        let metadata = read_metadata(&mut r)?;
        let layout = read_layout(&mut r)?;

        Some(Arc::new(IrShader::from_cached(
            key.name.clone(),
            key.info.clone(),
            metadata,
            layout,
            ir.to_vec(),
        )))
    }

    fn run_writer(self: Arc<Self>) {
        let mut local_queue: Vec<Arc<IrShader>> = Vec::with_capacity(WRITE_BATCH_SIZE);

        let mut stop = false;

        while !stop {
            let mut queue = self.write_queue.lock();

            while queue.is_empty() {
                self.write_cond.wait(&mut queue);
            }

            let entry = queue.pop_front().unwrap();
            drop(queue);

            stop = entry.is_none();
            let mut drain = stop;

            if let Some(shader) = entry {
                local_queue.push(shader);
                drain = local_queue.len() == WRITE_BATCH_SIZE;
            }

            if drain {
                let mut files = self.files.lock();

                for shader in local_queue.drain(..) {
                    if !self.write_shader_locked(&mut files, &shader) {
                        log::error!("Failed to write cache file.");
                        self.status
                            .store(Status::Disabled as u32, Ordering::Release);
                        return;
                    }
                }

                if let Some(bin) = files.bin.as_mut() {
                    let _ = bin.sync_data();
                }
                if let Some(lut) = files.lut.as_mut() {
                    let _ = lut.sync_data();
                }
            }
        }
    }

    fn write_shader_locked(&self, files: &mut Files, shader: &IrShader) -> bool {
        let Ok(ir) = shader.serialized_ir() else {
            return false;
        };
        let Ok(metadata) = shader.metadata() else {
            return false;
        };
        let Ok(layout) = shader.layout() else {
            return false;
        };

        let mut entry = LutEntry {
            offset: files.bin_len,
            binary_size: ir.len() as u32,
            metadata_size: 0,
            checksum: fnv1a(FNV1A_INIT, &ir),
        };

        let mut blob = ir;
        write_metadata(&mut blob, &metadata);
        write_layout(&mut blob, &layout);

        entry.metadata_size = blob.len() as u32 - entry.binary_size;

        let Some(bin) = files.bin.as_mut() else {
            return false;
        };

        if !Files::append(bin, &mut files.bin_len, &blob) {
            return false;
        }

        let mut record = Vec::new();
        write_string(&mut record, shader.debug_name());
        write_create_info(&mut record, shader.create_info());
        record.extend_from_slice(&entry.offset.to_le_bytes());
        record.extend_from_slice(&entry.binary_size.to_le_bytes());
        record.extend_from_slice(&entry.metadata_size.to_le_bytes());
        record.extend_from_slice(&entry.checksum.to_le_bytes());

        let Some(lut) = files.lut.as_mut() else {
            return false;
        };

        Files::append(lut, &mut files.lut_len, &record)
    }
}

// Byte-level serialization helpers. All integers are little-endian;
// strings are a u16 length followed by UTF-8 bytes.

fn write_string(out: &mut Vec<u8>, s: &str) {
    let len = s.len().min(u16::MAX as usize) as u16;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&s.as_bytes()[..len as usize]);
}

fn write_create_info(out: &mut Vec<u8>, info: &ShaderCreateInfo) {
    out.extend_from_slice(&info.options.flags.bits().to_le_bytes());
    out.extend_from_slice(&info.options.float_controls.bits().to_le_bytes());
    out.extend_from_slice(&info.options.max_uniform_buffer_size.to_le_bytes());
    out.extend_from_slice(&info.options.min_storage_buffer_alignment.to_le_bytes());
    out.extend_from_slice(&info.options.sample_count_push_data_offset.to_le_bytes());
    out.extend_from_slice(&info.options.reserved.to_le_bytes());

    out.extend_from_slice(&info.flat_shading_inputs.to_le_bytes());
    out.extend_from_slice(&info.rasterized_stream.to_le_bytes());

    out.extend_from_slice(&(info.xfb_entries.len() as u32).to_le_bytes());

    for xfb in &info.xfb_entries {
        write_string(out, &xfb.semantic_name);
        out.extend_from_slice(&xfb.semantic_index.to_le_bytes());
        out.extend_from_slice(&xfb.component_mask.to_le_bytes());
        out.extend_from_slice(&xfb.stream.to_le_bytes());
        out.extend_from_slice(&xfb.buffer.to_le_bytes());
        out.extend_from_slice(&xfb.offset.to_le_bytes());
        out.extend_from_slice(&xfb.stride.to_le_bytes());
    }
}

fn write_io_map(out: &mut Vec<u8>, io: &IoMap) {
    out.push(io.len() as u8);

    for var in io.vars() {
        out.push(var.builtin.map_or(0, |b| b as u8));
        out.push(var.location);
        out.push(var.component_index);
        out.push(var.component_count);
        out.push(var.patch_constant as u8);
        out.extend_from_slice(&var.semantic_index.to_le_bytes());
        write_string(out, &var.semantic_name);
    }
}

fn write_metadata(out: &mut Vec<u8>, metadata: &ShaderMetadata) {
    out.extend_from_slice(&(metadata.stage as u32).to_le_bytes());
    out.extend_from_slice(&metadata.flags.bits().to_le_bytes());
    out.extend_from_slice(&metadata.spec_constant_mask.to_le_bytes());

    write_io_map(out, &metadata.inputs);
    write_io_map(out, &metadata.outputs);

    out.push(metadata.input_topology as u8);
    out.push(metadata.output_topology as u8);
    out.extend_from_slice(&metadata.flat_shading_inputs.to_le_bytes());
    out.extend_from_slice(&metadata.rasterized_stream.to_le_bytes());
    out.extend_from_slice(&metadata.patch_vertex_count.to_le_bytes());

    for stride in metadata.xfb_strides {
        out.extend_from_slice(&stride.to_le_bytes());
    }
}

fn write_layout(out: &mut Vec<u8>, layout: &PipelineLayoutBuilder) {
    out.extend_from_slice(&layout.stage_mask().bits().to_le_bytes());
    out.extend_from_slice(&layout.push_data_mask().to_le_bytes());

    for (_, block) in layout.push_data_blocks() {
        out.extend_from_slice(&block.stages.bits().to_le_bytes());
        out.extend_from_slice(&block.offset.to_le_bytes());
        out.extend_from_slice(&block.size.to_le_bytes());
        out.extend_from_slice(&block.alignment.to_le_bytes());
        out.extend_from_slice(&block.resource_dword_mask.to_le_bytes());
    }

    out.extend_from_slice(&(layout.bindings().len() as u32).to_le_bytes());

    for binding in layout.bindings() {
        out.extend_from_slice(&binding.stages.bits().to_le_bytes());
        out.push(binding.descriptor_type as u8);
        out.push(binding.set);
        out.extend_from_slice(&binding.binding.to_le_bytes());
        out.extend_from_slice(&binding.count.to_le_bytes());
        out.extend_from_slice(&binding.resource_index.to_le_bytes());
    }

    let heaps = layout.sampler_heap_bindings();
    out.extend_from_slice(&(heaps.len() as u32).to_le_bytes());

    for heap in heaps {
        out.extend_from_slice(&heap.stages.bits().to_le_bytes());
        out.push(heap.set);
        out.extend_from_slice(&heap.binding.to_le_bytes());
    }
}

struct ByteReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> ByteReader<'a> {
    fn bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let bytes = self.data.get(self.offset..self.offset + len)?;
        self.offset += len;
        Some(bytes)
    }

    fn u8(&mut self) -> Option<u8> {
        let v = *self.data.get(self.offset)?;
        self.offset += 1;
        Some(v)
    }

    fn u16(&mut self) -> Option<u16> {
        Some(u16::from_le_bytes(self.bytes(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Option<u32> {
        Some(u32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> Option<i32> {
        Some(i32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Option<u64> {
        Some(u64::from_le_bytes(self.bytes(8)?.try_into().unwrap()))
    }

    fn string(&mut self) -> Option<String> {
        let len = self.u16()? as usize;
        String::from_utf8(self.bytes(len)?.to_vec()).ok()
    }
}

fn read_create_info(r: &mut ByteReader) -> Option<ShaderCreateInfo> {
    let options = ShaderOptions {
        flags: CompileFlags::from_bits_truncate(r.u32()?),
        float_controls: FloatControlFlags::from_bits_truncate(r.u32()?),
        max_uniform_buffer_size: r.u32()?,
        min_storage_buffer_alignment: r.u32()?,
        sample_count_push_data_offset: r.u16()?,
        reserved: r.u16()?,
    };

    let flat_shading_inputs = r.u32()?;
    let rasterized_stream = r.i32()?;
    let xfb_count = r.u32()?;

    let mut xfb_entries = Vec::with_capacity(xfb_count.min(64) as usize);

    for _ in 0..xfb_count {
        xfb_entries.push(XfbEntry {
            semantic_name: r.string()?,
            semantic_index: r.u32()?,
            component_mask: r.u32()?,
            stream: r.u32()?,
            buffer: r.u32()?,
            offset: r.u32()?,
            stride: r.u32()?,
        });
    }

    Some(ShaderCreateInfo {
        options,
        flat_shading_inputs,
        rasterized_stream,
        xfb_entries,
    })
}

fn read_lut_record(r: &mut ByteReader) -> Option<(LutKey, LutEntry)> {
    let name = r.string()?;
    let info = read_create_info(r)?;

    let entry = LutEntry {
        offset: r.u64()?,
        binary_size: r.u32()?,
        metadata_size: r.u32()?,
        checksum: r.u64()?,
    };

    Some((LutKey { name, info }, entry))
}

fn read_io_map(r: &mut ByteReader) -> Option<IoMap> {
    let count = r.u8()?;
    let mut io = IoMap::new();

    for _ in 0..count {
        io.add(IoVar {
            builtin: BuiltIn::from_u8(r.u8()?),
            location: r.u8()?,
            component_index: r.u8()?,
            component_count: r.u8()?,
            patch_constant: r.u8()? != 0,
            semantic_index: r.u32()?,
            semantic_name: r.string()?,
        });
    }

    Some(io)
}

fn read_metadata(r: &mut ByteReader) -> Option<ShaderMetadata> {
    let stage = ShaderStage::from_bits(r.u32()?)?;
    let flags = MetadataFlags::from_bits_truncate(r.u32()?);
    let spec_constant_mask = r.u32()?;

    let inputs = read_io_map(r)?;
    let outputs = read_io_map(r)?;

    let input_topology = PrimitiveTopology::from_u8(r.u8()?)?;
    let output_topology = PrimitiveTopology::from_u8(r.u8()?)?;
    let flat_shading_inputs = r.u32()?;
    let rasterized_stream = r.i32()?;
    let patch_vertex_count = r.u32()?;

    let mut xfb_strides = [0u32; 4];
    for stride in &mut xfb_strides {
        *stride = r.u32()?;
    }

    Some(ShaderMetadata {
        stage,
        flags,
        spec_constant_mask,
        inputs,
        outputs,
        input_topology,
        output_topology,
        flat_shading_inputs,
        rasterized_stream,
        patch_vertex_count,
        xfb_strides,
    })
}

fn read_layout(r: &mut ByteReader) -> Option<PipelineLayoutBuilder> {
    let stage_mask = StageMask::from_bits_truncate(r.u32()?);
    let mut layout = PipelineLayoutBuilder::new(stage_mask);

    let push_data_mask = r.u32()?;

    let mut mask = push_data_mask;
    while mask != 0 {
        let index = mask.trailing_zeros();
        mask &= mask - 1;

        layout.add_push_data(
            index,
            PushDataBlock {
                stages: StageMask::from_bits_truncate(r.u32()?),
                offset: r.u32()?,
                size: r.u32()?,
                alignment: r.u32()?,
                resource_dword_mask: r.u32()?,
            },
        );
    }

    let binding_count = r.u32()?;

    for _ in 0..binding_count {
        let binding = BindingInfo {
            stages: StageMask::from_bits_truncate(r.u32()?),
            descriptor_type: DescriptorType::from_u8(r.u8()?)?,
            set: r.u8()?,
            binding: r.u32()?,
            count: r.u32()?,
            resource_index: r.u32()?,
        };
        layout.add_bindings(&[binding]);
    }

    let heap_count = r.u32()?;

    for _ in 0..heap_count {
        layout.add_sampler_heap(SamplerHeapBinding {
            stages: StageMask::from_bits_truncate(r.u32()?),
            set: r.u8()?,
            binding: r.u32()?,
        });
    }

    Some(layout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_known_values() {
        // FNV-1a of the empty string is the offset basis.
        assert_eq!(fnv1a(FNV1A_INIT, b""), FNV1A_INIT);
        assert_eq!(fnv1a(FNV1A_INIT, b"a"), 0xaf63dc4c8601ec8c);
    }

    #[test]
    fn metadata_blob_round_trip() {
        let mut metadata = ShaderMetadata {
            stage: ShaderStage::Geometry,
            flags: MetadataFlags::USES_SAMPLER_HEAP,
            spec_constant_mask: 0x5,
            input_topology: PrimitiveTopology::TriangleList,
            output_topology: PrimitiveTopology::TriangleStrip,
            flat_shading_inputs: 0x3,
            rasterized_stream: -1,
            patch_vertex_count: 0,
            xfb_strides: [16, 0, 8, 0],
            ..Default::default()
        };
        metadata.inputs.add(IoVar {
            location: 2,
            component_count: 4,
            semantic_index: 1,
            semantic_name: "TEXCOORD".into(),
            ..Default::default()
        });
        metadata.outputs.add(IoVar {
            builtin: Some(BuiltIn::Position),
            component_count: 4,
            semantic_name: "SV_POSITION".into(),
            ..Default::default()
        });

        let mut blob = Vec::new();
        write_metadata(&mut blob, &metadata);

        let mut r = ByteReader {
            data: &blob,
            offset: 0,
        };
        let restored = read_metadata(&mut r).unwrap();

        assert_eq!(restored, metadata);
        assert_eq!(r.offset, blob.len());
    }

    #[test]
    fn layout_blob_round_trip() {
        let mut layout = PipelineLayoutBuilder::new(StageMask::COMPUTE);
        layout.add_push_data(
            PipelineLayoutBuilder::per_stage_push_data_block(ShaderStage::Compute),
            PushDataBlock {
                stages: StageMask::COMPUTE,
                offset: crate::limits::MAX_SHARED_PUSH_DATA_SIZE,
                size: 16,
                alignment: 8,
                resource_dword_mask: 0xf,
            },
        );
        layout.add_bindings(&[BindingInfo {
            stages: StageMask::COMPUTE,
            descriptor_type: DescriptorType::StorageBuffer,
            set: crate::limits::SET_UAV,
            binding: 4,
            count: 1,
            resource_index: 4,
        }]);
        layout.add_sampler_heap(SamplerHeapBinding {
            stages: StageMask::COMPUTE,
            set: crate::limits::SET_SAMPLER,
            binding: 0,
        });

        let mut blob = Vec::new();
        write_layout(&mut blob, &layout);

        let mut r = ByteReader {
            data: &blob,
            offset: 0,
        };
        let restored = read_layout(&mut r).unwrap();

        assert_eq!(restored, layout);
        assert_eq!(r.offset, blob.len());
    }

    #[test]
    fn lut_record_round_trip() {
        let info = ShaderCreateInfo {
            flat_shading_inputs: 0x3,
            rasterized_stream: 0,
            xfb_entries: vec![XfbEntry {
                semantic_name: "POSITION".into(),
                semantic_index: 0,
                component_mask: 0xf,
                stream: 0,
                buffer: 1,
                offset: 16,
                stride: 32,
            }],
            ..Default::default()
        };

        let entry = LutEntry {
            offset: 0x1234,
            binary_size: 100,
            metadata_size: 64,
            checksum: 0xdead_beef,
        };

        let mut record = Vec::new();
        write_string(&mut record, "vs_main");
        write_create_info(&mut record, &info);
        record.extend_from_slice(&entry.offset.to_le_bytes());
        record.extend_from_slice(&entry.binary_size.to_le_bytes());
        record.extend_from_slice(&entry.metadata_size.to_le_bytes());
        record.extend_from_slice(&entry.checksum.to_le_bytes());

        let mut r = ByteReader {
            data: &record,
            offset: 0,
        };
        let (key, restored) = read_lut_record(&mut r).unwrap();

        assert_eq!(key.name, "vs_main");
        assert_eq!(key.info, info);
        assert_eq!(restored.offset, entry.offset);
        assert_eq!(restored.checksum, entry.checksum);
        assert_eq!(r.offset, record.len());
    }
}
