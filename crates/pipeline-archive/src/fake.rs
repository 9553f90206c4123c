//! In-memory backend for exercising the archive flow without a GPU
//!
//! Entry points are discovered by parsing WGSL with naga, fragment colors are
//! scripted per entry point, and every compile is counted so callers can prove
//! that archive loads never reach the compiler. The probe vertex lands on the
//! pixel at the centre of the target and is rasterized as a square point, 128
//! units wide unless configured, so by default it covers the whole target.

use crate::backend::{Backend, CompiledFunctions, FunctionSource};
use crate::descriptor::{PipelineDescriptor, PixelFormat};
use crate::error::{ArchiveError, Result};
use crate::probe::{PixelBuffer, ProbeScene};
use bytes::{Buf, BufMut, BytesMut};
use std::cell::Cell;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;

/// Tag written into archives harvested by [`FakeBackend`]
pub const FAKE_BACKEND_NAME: &str = "fake";

/// Color emitted by fragment entry points without a scripted color
pub const DEFAULT_FRAGMENT_COLOR: [u8; 4] = [255, 255, 255, 255];

const PAYLOAD_MAGIC: &[u8; 4] = b"FAKE";

/// Point size used when none is configured, in pixels
pub const DEFAULT_POINT_SIZE: u32 = 128;

/// Shader library "compiled" by the fake backend
#[derive(Debug, Clone)]
pub struct FakeLibrary {
    vertex_entry_points: BTreeSet<String>,
    fragment_entry_points: BTreeSet<String>,
}

impl FakeLibrary {
    pub fn vertex_entry_points(&self) -> impl Iterator<Item = &str> {
        self.vertex_entry_points.iter().map(String::as_str)
    }

    pub fn fragment_entry_points(&self) -> impl Iterator<Item = &str> {
        self.fragment_entry_points.iter().map(String::as_str)
    }
}

/// How a [`FakePipeline`] was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOrigin {
    Compiled,
    Archived,
}

/// Pipeline object of the fake backend
#[derive(Debug, Clone)]
pub struct FakePipeline {
    descriptor: PipelineDescriptor,
    color: [u8; 4],
    origin: PipelineOrigin,
}

impl FakePipeline {
    pub fn descriptor(&self) -> &PipelineDescriptor {
        &self.descriptor
    }

    pub fn origin(&self) -> PipelineOrigin {
        self.origin
    }
}

/// Scripted backend used by tests and documentation
#[derive(Debug, Default)]
pub struct FakeBackend {
    fragment_colors: HashMap<String, [u8; 4]>,
    archived_colors: HashMap<String, [u8; 4]>,
    point_size: Option<u32>,
    rejected_formats: HashSet<PixelFormat>,
    failing_renders: bool,
    compile_count: Cell<usize>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the RGBA color emitted by a fragment entry point
    pub fn with_fragment_color(mut self, entry_point: impl Into<String>, rgba: [u8; 4]) -> Self {
        self.fragment_colors.insert(entry_point.into(), rgba);
        self
    }

    /// Makes pipelines rebuilt from an archive draw `rgba` for a fragment entry point
    ///
    /// Models a backend whose archived functions drift from what it compiles live.
    pub fn with_archived_color(mut self, entry_point: impl Into<String>, rgba: [u8; 4]) -> Self {
        self.archived_colors.insert(entry_point.into(), rgba);
        self
    }

    /// Sets the rasterized point size in pixels
    pub fn with_point_size(mut self, pixels: u32) -> Self {
        self.point_size = Some(pixels);
        self
    }

    /// Makes compilation reject pipelines targeting `format`
    pub fn reject_format(mut self, format: PixelFormat) -> Self {
        self.rejected_formats.insert(format);
        self
    }

    /// Makes every render submission fail
    pub fn with_failing_renders(mut self) -> Self {
        self.failing_renders = true;
        self
    }

    /// Number of pipeline compilations performed so far
    pub fn compile_count(&self) -> usize {
        self.compile_count.get()
    }

    fn compile(&self, descriptor: &PipelineDescriptor, library: &FakeLibrary) -> Result<[u8; 4]> {
        if !library.vertex_entry_points.contains(descriptor.vertex_entry_point()) {
            return Err(ArchiveError::compilation(
                descriptor.to_string(),
                format!("vertex entry point '{}' not found in library", descriptor.vertex_entry_point()),
            ));
        }
        if !library.fragment_entry_points.contains(descriptor.fragment_entry_point()) {
            return Err(ArchiveError::compilation(
                descriptor.to_string(),
                format!("fragment entry point '{}' not found in library", descriptor.fragment_entry_point()),
            ));
        }
        if self.rejected_formats.contains(&descriptor.color_attachment_format()) {
            return Err(ArchiveError::compilation(
                descriptor.to_string(),
                format!("fragment output is incompatible with {}", descriptor.color_attachment_format()),
            ));
        }

        self.compile_count.set(self.compile_count.get() + 1);
        Ok(self.fragment_colors.get(descriptor.fragment_entry_point()).copied().unwrap_or(DEFAULT_FRAGMENT_COLOR))
    }
}

fn encode_payload(descriptor: &PipelineDescriptor, color: [u8; 4]) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_slice(PAYLOAD_MAGIC);
    buf.put_u8(descriptor.color_attachment_format().tag());
    buf.put_slice(&color);
    for name in [descriptor.vertex_entry_point(), descriptor.fragment_entry_point()] {
        buf.put_u16_le(name.len() as u16);
        buf.put_slice(name.as_bytes());
    }
    buf
}

/// Returns the descriptor and color baked into a payload, if it is well formed
fn decode_payload(mut payload: &[u8]) -> Option<(PipelineDescriptor, [u8; 4])> {
    if payload.remaining() < PAYLOAD_MAGIC.len() + 5 || &payload[..4] != PAYLOAD_MAGIC {
        return None;
    }
    payload.advance(PAYLOAD_MAGIC.len());
    let format = PixelFormat::from_tag(payload.get_u8())?;
    let mut color = [0u8; 4];
    payload.copy_to_slice(&mut color);

    let mut names = Vec::with_capacity(2);
    for _ in 0..2 {
        if payload.remaining() < 2 {
            return None;
        }
        let len = payload.get_u16_le() as usize;
        if payload.remaining() < len {
            return None;
        }
        names.push(String::from_utf8(payload[..len].to_vec()).ok()?);
        payload.advance(len);
    }
    let fragment = names.pop()?;
    let vertex = names.pop()?;

    Some((PipelineDescriptor::build(vertex, fragment, format).ok()?, color))
}

impl Backend for FakeBackend {
    type Library = FakeLibrary;
    type Pipeline = FakePipeline;

    fn name(&self) -> &str {
        FAKE_BACKEND_NAME
    }

    fn compile_library(&self, source: &str) -> Result<FakeLibrary> {
        let module = naga::front::wgsl::parse_str(source).map_err(|e| ArchiveError::compilation("shader library", e.emit_to_string(source)))?;

        let mut library = FakeLibrary {
            vertex_entry_points: BTreeSet::new(),
            fragment_entry_points: BTreeSet::new(),
        };
        for entry_point in &module.entry_points {
            match entry_point.stage {
                naga::ShaderStage::Vertex => library.vertex_entry_points.insert(entry_point.name.clone()),
                naga::ShaderStage::Fragment => library.fragment_entry_points.insert(entry_point.name.clone()),
                _ => false,
            };
        }
        Ok(library)
    }

    fn open_library(&self, path: &Path) -> Result<FakeLibrary> {
        let source = std::fs::read_to_string(path).map_err(|e| ArchiveError::io(path, e))?;
        self.compile_library(&source)
    }

    fn compile_functions(&self, descriptor: &PipelineDescriptor, library: &FakeLibrary) -> Result<CompiledFunctions> {
        let color = self.compile(descriptor, library)?;
        Ok(CompiledFunctions::new(encode_payload(descriptor, color).freeze()))
    }

    fn build_pipeline(&self, descriptor: &PipelineDescriptor, source: FunctionSource<'_, FakeLibrary>) -> Result<FakePipeline> {
        match source {
            FunctionSource::Library(library) => Ok(FakePipeline {
                descriptor: descriptor.clone(),
                color: self.compile(descriptor, library)?,
                origin: PipelineOrigin::Compiled,
            }),
            FunctionSource::Archived { entry, path } => {
                let miss = || ArchiveError::ArchiveMiss {
                    descriptor: descriptor.to_string(),
                    path: path.to_path_buf(),
                    backend: FAKE_BACKEND_NAME.to_string(),
                };
                let (compiled_for, color) = decode_payload(entry.payload()).ok_or_else(miss)?;
                if compiled_for != *descriptor {
                    return Err(miss());
                }
                let color = self.archived_colors.get(compiled_for.fragment_entry_point()).copied().unwrap_or(color);
                Ok(FakePipeline {
                    descriptor: compiled_for,
                    color,
                    origin: PipelineOrigin::Archived,
                })
            }
        }
    }

    fn submit_render(&self, pipeline: &FakePipeline, scene: &ProbeScene) -> Result<PixelBuffer> {
        if self.failing_renders {
            return Err(ArchiveError::render(pipeline.descriptor.to_string(), "scripted submission failure"));
        }

        let format = pipeline.descriptor.color_attachment_format();
        let [r, g, b, a] = pipeline.color;
        let color = if format.is_bgra() { [b, g, r, a] } else { [r, g, b, a] };
        let clear = clear_bytes(scene.clear_color, format);

        let size = self.point_size.unwrap_or(DEFAULT_POINT_SIZE);
        let (center_x, center_y) = (scene.width / 2, scene.height / 2);
        let mut bytes = Vec::with_capacity(scene.byte_len());
        for y in 0..scene.height {
            for x in 0..scene.width {
                let lit = x.abs_diff(center_x) * 2 < size && y.abs_diff(center_y) * 2 < size;
                bytes.extend_from_slice(if lit { &color } else { &clear });
            }
        }
        PixelBuffer::new(scene.width, scene.height, format, bytes).map_err(|e| ArchiveError::render(pipeline.descriptor.to_string(), e.to_string()))
    }
}

fn clear_bytes(clear_color: [f64; 4], format: PixelFormat) -> [u8; 4] {
    let [r, g, b, a] = clear_color.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8);
    if format.is_bgra() { [b, g, r, a] } else { [r, g, b, a] }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = r#"
@vertex
fn main_vertex() -> @builtin(position) vec4<f32> {
    return vec4<f32>(0.0, 0.0, 0.0, 1.0);
}

@fragment
fn main_fragment() -> @location(0) vec4<f32> {
    return vec4<f32>(1.0, 0.0, 0.0, 1.0);
}
"#;

    #[test]
    fn test_library_discovers_entry_points() {
        let library = FakeBackend::new().compile_library(SOURCE).unwrap();
        assert_eq!(library.vertex_entry_points().collect::<Vec<_>>(), vec!["main_vertex"]);
        assert_eq!(library.fragment_entry_points().collect::<Vec<_>>(), vec!["main_fragment"]);
    }

    #[test]
    fn test_invalid_source_is_a_compilation_error() {
        let err = FakeBackend::new().compile_library("fn broken(").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Compilation);
    }

    #[test]
    fn test_payload_round_trip() {
        let descriptor = PipelineDescriptor::build("main_vertex", "main_fragment", PixelFormat::Bgra8Unorm).unwrap();
        let payload = encode_payload(&descriptor, [1, 2, 3, 4]);
        assert_eq!(decode_payload(&payload), Some((descriptor, [1, 2, 3, 4])));
        assert_eq!(decode_payload(&payload[..payload.len() - 1]), None);
        assert_eq!(decode_payload(b"nope"), None);
    }

    #[test]
    fn test_render_swizzles_for_bgra() {
        let backend = FakeBackend::new().with_fragment_color("main_fragment", [255, 0, 0, 255]);
        let library = backend.compile_library(SOURCE).unwrap();
        let descriptor = PipelineDescriptor::build("main_vertex", "main_fragment", PixelFormat::Bgra8Unorm).unwrap();
        let pipeline = backend.build_pipeline(&descriptor, FunctionSource::Library(&library)).unwrap();

        let pixels = backend.submit_render(&pipeline, &ProbeScene::FIXED).unwrap();
        assert_eq!(pixels.pixel(0, 0), Some([0, 0, 255, 255]));
        assert_eq!(pixels.to_rgba()[..4], [255, 0, 0, 255]);
    }

    #[test]
    fn test_small_point_leaves_clear_color() {
        let backend = FakeBackend::new().with_point_size(1).with_fragment_color("main_fragment", [255, 0, 0, 255]);
        let library = backend.compile_library(SOURCE).unwrap();
        let descriptor = PipelineDescriptor::build("main_vertex", "main_fragment", PixelFormat::Rgba8Unorm).unwrap();
        let pipeline = backend.build_pipeline(&descriptor, FunctionSource::Library(&library)).unwrap();

        let pixels = backend.submit_render(&pipeline, &ProbeScene::FIXED).unwrap();
        assert_eq!(pixels.pixel(2, 2), Some([255, 0, 0, 255]));
        assert_eq!(pixels.pixel(0, 0), Some([0, 0, 0, 0]));
        assert_eq!(pixels.pixels().filter(|pixel| pixel[3] != 0).count(), 1);
    }

    #[test]
    fn test_archived_color_only_affects_archived_pipelines() {
        let backend = FakeBackend::new().with_archived_color("main_fragment", [0, 0, 255, 255]);
        let library = backend.compile_library(SOURCE).unwrap();
        let descriptor = PipelineDescriptor::build("main_vertex", "main_fragment", PixelFormat::Rgba8Unorm).unwrap();

        let mut archive = crate::BinaryArchive::new(FAKE_BACKEND_NAME);
        backend.register_pipeline_in_archive(&mut archive, &descriptor, &library).unwrap();
        let entry = archive.entry(&descriptor).unwrap();

        let live = backend.build_pipeline(&descriptor, FunctionSource::Library(&library)).unwrap();
        let archived = backend.build_pipeline(&descriptor, FunctionSource::Archived { entry, path: Path::new("drift.plar") }).unwrap();
        assert_eq!(backend.submit_render(&live, &ProbeScene::FIXED).unwrap().pixel(0, 0), Some(DEFAULT_FRAGMENT_COLOR));
        assert_eq!(backend.submit_render(&archived, &ProbeScene::FIXED).unwrap().pixel(0, 0), Some([0, 0, 255, 255]));
    }

    #[test]
    fn test_compile_count_tracks_compilations() {
        let backend = FakeBackend::new();
        let library = backend.compile_library(SOURCE).unwrap();
        let descriptor = PipelineDescriptor::build("main_vertex", "main_fragment", PixelFormat::Rgba8Unorm).unwrap();

        backend.compile_functions(&descriptor, &library).unwrap();
        backend.build_pipeline(&descriptor, FunctionSource::Library(&library)).unwrap();
        assert_eq!(backend.compile_count(), 2);
    }
}
