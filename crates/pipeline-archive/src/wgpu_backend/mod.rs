//! wgpu implementation of [`Backend`]
//!
//! Shader libraries are parsed and validated with naga. Harvesting lowers the
//! library to SPIR-V and, where the adapter supports it, captures the driver's
//! pipeline-cache blob for the compiled pipeline. Archived pipelines are built
//! from that SPIR-V alone, so the WGSL front end never runs on the load path.
//!
//! WebGPU rasterizes point primitives at a fixed size of one pixel, so the
//! probe lights exactly the pixel under the emitted position.

mod context;
mod readback;

pub use context::{ContextOptions, GpuContext};
pub use readback::{ReadbackError, padded_bytes_per_row, texture_format};

use crate::backend::{Backend, CompiledFunctions, FunctionSource};
use crate::descriptor::PipelineDescriptor;
use crate::error::{ArchiveError, Result};
use crate::probe::{PixelBuffer, ProbeScene, ProbeTopology};
use bytes::{Buf, BufMut, BytesMut};
use std::borrow::Cow;
use std::path::Path;

/// Tag written into archives harvested by [`WgpuBackend`]
pub const WGPU_BACKEND_NAME: &str = "wgpu-spirv";

/// WGSL source of the built-in probe shader (`main_vertex`, `main_fragment`)
pub const PROBE_SHADER: &str = include_str!("../shaders/probe.wgsl");

const PAYLOAD_MAGIC: &[u8; 4] = b"WGSV";

/// Shader code a library was created from
#[derive(Debug, Clone)]
enum LibrarySource {
    Wgsl(String),
    SpirV(Vec<u32>),
}

/// A parsed and validated shader library
#[derive(Debug)]
pub struct WgpuLibrary {
    label: String,
    module: naga::Module,
    info: naga::valid::ModuleInfo,
    source: LibrarySource,
}

impl WgpuLibrary {
    fn has_entry_point(&self, name: &str, stage: naga::ShaderStage) -> bool {
        self.module.entry_points.iter().any(|ep| ep.name == name && ep.stage == stage)
    }
}

/// A render pipeline ready for the probe
#[derive(Debug)]
pub struct WgpuPipeline {
    descriptor: PipelineDescriptor,
    pipeline: wgpu::RenderPipeline,
}

impl WgpuPipeline {
    pub fn descriptor(&self) -> &PipelineDescriptor {
        &self.descriptor
    }
}

/// Compiled functions as stored in an archive entry
struct WgpuPayload {
    spirv: Vec<u32>,
    cache_key: String,
    cache_data: Vec<u8>,
}

impl WgpuPayload {
    fn encode(&self) -> BytesMut {
        let spirv: &[u8] = bytemuck::cast_slice(&self.spirv);
        let mut buf = BytesMut::with_capacity(spirv.len() + self.cache_data.len() + self.cache_key.len() + 14);
        buf.put_slice(PAYLOAD_MAGIC);
        buf.put_u32_le(spirv.len() as u32);
        buf.put_slice(spirv);
        buf.put_u16_le(self.cache_key.len() as u16);
        buf.put_slice(self.cache_key.as_bytes());
        buf.put_u32_le(self.cache_data.len() as u32);
        buf.put_slice(&self.cache_data);
        buf
    }

    fn decode(mut data: &[u8]) -> Option<Self> {
        if data.remaining() < PAYLOAD_MAGIC.len() + 4 || &data[..4] != PAYLOAD_MAGIC {
            return None;
        }
        data.advance(PAYLOAD_MAGIC.len());

        let spirv_len = data.get_u32_le() as usize;
        if spirv_len % 4 != 0 || data.remaining() < spirv_len + 2 {
            return None;
        }
        let spirv = bytemuck::pod_collect_to_vec::<u8, u32>(&data[..spirv_len]);
        data.advance(spirv_len);

        let key_len = data.get_u16_le() as usize;
        if data.remaining() < key_len + 4 {
            return None;
        }
        let cache_key = String::from_utf8(data[..key_len].to_vec()).ok()?;
        data.advance(key_len);

        let cache_len = data.get_u32_le() as usize;
        if data.remaining() != cache_len {
            return None;
        }
        let cache_data = data.to_vec();

        Some(Self { spirv, cache_key, cache_data })
    }
}

/// Parses SPIR-V the way wgpu ingests it, without adjusting the coordinate space
fn parse_spirv(label: &str, bytes: &[u8]) -> Result<naga::Module> {
    let options = naga::front::spv::Options {
        adjust_coordinate_space: false,
        ..Default::default()
    };
    naga::front::spv::parse_u8_slice(bytes, &options).map_err(|e| ArchiveError::compilation(label, e.to_string()))
}

/// Lowers a validated library to SPIR-V for an archive entry
fn write_spirv(library: &WgpuLibrary) -> std::result::Result<Vec<u32>, naga::back::spv::Error> {
    // wgpu ingests SPIR-V without flipping Y, so emit it unadjusted
    let options = naga::back::spv::Options {
        flags: naga::back::spv::WriterFlags::LABEL_VARYINGS,
        ..Default::default()
    };
    naga::back::spv::write_vec(&library.module, &library.info, &options, None)
}

/// Production backend bound to a wgpu device
#[derive(Debug)]
pub struct WgpuBackend {
    context: GpuContext,
}

impl WgpuBackend {
    /// Acquires a device with the given options
    pub fn new(options: &ContextOptions) -> Result<Self> {
        Ok(Self {
            context: GpuContext::new(options)?,
        })
    }

    pub fn context(&self) -> &GpuContext {
        &self.context
    }

    fn create_module(&self, descriptor: &PipelineDescriptor, label: &str, source: wgpu::ShaderSource<'_>) -> Result<wgpu::ShaderModule> {
        let (module, error) = self.context.validation_scope(|device| device.create_shader_module(wgpu::ShaderModuleDescriptor { label: Some(label), source }));
        match error {
            Some(e) => Err(ArchiveError::compilation(descriptor.to_string(), e.to_string())),
            None => Ok(module),
        }
    }

    fn create_pipeline(&self, descriptor: &PipelineDescriptor, module: &wgpu::ShaderModule, cache: Option<&wgpu::PipelineCache>) -> Result<wgpu::RenderPipeline> {
        let label = descriptor.to_string();
        let (pipeline, error) = self.context.validation_scope(|device| {
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(&label),
                layout: None,
                vertex: wgpu::VertexState {
                    module,
                    entry_point: Some(descriptor.vertex_entry_point()),
                    buffers: &[],
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                },
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::PointList,
                    ..Default::default()
                },
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                fragment: Some(wgpu::FragmentState {
                    module,
                    entry_point: Some(descriptor.fragment_entry_point()),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: texture_format(descriptor.color_attachment_format()),
                        blend: None,
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                }),
                multiview: None,
                cache,
            })
        });
        match error {
            Some(e) => Err(ArchiveError::compilation(label, e.to_string())),
            None => Ok(pipeline),
        }
    }

    fn create_pipeline_cache(&self, data: Option<&[u8]>) -> Option<wgpu::PipelineCache> {
        self.context.pipeline_cache_key()?;
        // SAFETY: `data` is either absent or a blob produced by `PipelineCache::get_data`
        // on an adapter with the same cache key; `fallback` discards blobs the driver rejects.
        let cache = unsafe {
            self.context.device.create_pipeline_cache(&wgpu::PipelineCacheDescriptor {
                label: Some("Pipeline Archive Cache"),
                data,
                fallback: true,
            })
        };
        Some(cache)
    }

    fn resolve_entry_points(descriptor: &PipelineDescriptor, library: &WgpuLibrary) -> Result<()> {
        if !library.has_entry_point(descriptor.vertex_entry_point(), naga::ShaderStage::Vertex) {
            return Err(ArchiveError::compilation(
                descriptor.to_string(),
                format!("vertex entry point '{}' not found in {}", descriptor.vertex_entry_point(), library.label),
            ));
        }
        if !library.has_entry_point(descriptor.fragment_entry_point(), naga::ShaderStage::Fragment) {
            return Err(ArchiveError::compilation(
                descriptor.to_string(),
                format!("fragment entry point '{}' not found in {}", descriptor.fragment_entry_point(), library.label),
            ));
        }
        Ok(())
    }

    fn validate(module: naga::Module, label: String, source: LibrarySource) -> Result<WgpuLibrary> {
        let info = naga::valid::Validator::new(naga::valid::ValidationFlags::all(), naga::valid::Capabilities::all())
            .validate(&module)
            .map_err(|e| ArchiveError::compilation(label.clone(), e.as_inner().to_string()))?;
        Ok(WgpuLibrary { label, module, info, source })
    }
}

impl Backend for WgpuBackend {
    type Library = WgpuLibrary;
    type Pipeline = WgpuPipeline;

    fn name(&self) -> &str {
        WGPU_BACKEND_NAME
    }

    fn compile_library(&self, source: &str) -> Result<WgpuLibrary> {
        let module = naga::front::wgsl::parse_str(source).map_err(|e| ArchiveError::compilation("shader library", e.emit_to_string(source)))?;
        Self::validate(module, "shader library".to_string(), LibrarySource::Wgsl(source.to_string()))
    }

    fn open_library(&self, path: &Path) -> Result<WgpuLibrary> {
        let label = path.display().to_string();
        if path.extension().is_some_and(|ext| ext == "spv") {
            let bytes = std::fs::read(path).map_err(|e| ArchiveError::io(path, e))?;
            if bytes.len() % 4 != 0 {
                return Err(ArchiveError::compilation(label, "SPIR-V binary length is not a multiple of 4"));
            }
            let module = parse_spirv(&label, &bytes)?;
            let words = bytemuck::pod_collect_to_vec::<u8, u32>(&bytes);
            return Self::validate(module, label, LibrarySource::SpirV(words));
        }

        let source = std::fs::read_to_string(path).map_err(|e| ArchiveError::io(path, e))?;
        let module = naga::front::wgsl::parse_str(&source).map_err(|e| ArchiveError::compilation(label.clone(), e.emit_to_string(&source)))?;
        Self::validate(module, label, LibrarySource::Wgsl(source))
    }

    fn compile_functions(&self, descriptor: &PipelineDescriptor, library: &WgpuLibrary) -> Result<CompiledFunctions> {
        Self::resolve_entry_points(descriptor, library)?;

        let spirv = write_spirv(library).map_err(|e| ArchiveError::compilation(descriptor.to_string(), e.to_string()))?;

        // Building once from the SPIR-V checks the descriptor against the device and warms the driver cache
        let module = self.create_module(descriptor, "archived functions", wgpu::ShaderSource::SpirV(Cow::Borrowed(&spirv)))?;
        let cache = self.create_pipeline_cache(None);
        self.create_pipeline(descriptor, &module, cache.as_ref())?;

        let cache_data = cache.and_then(|cache| cache.get_data()).unwrap_or_default();
        let payload = WgpuPayload {
            spirv,
            cache_key: self.context.pipeline_cache_key().unwrap_or_default().to_string(),
            cache_data,
        };
        tracing::debug!(%descriptor, spirv_words = payload.spirv.len(), cache_bytes = payload.cache_data.len(), "compiled pipeline functions");

        Ok(CompiledFunctions::new(payload.encode().freeze()))
    }

    fn build_pipeline(&self, descriptor: &PipelineDescriptor, source: FunctionSource<'_, WgpuLibrary>) -> Result<WgpuPipeline> {
        let pipeline = match source {
            FunctionSource::Library(library) => {
                Self::resolve_entry_points(descriptor, library)?;
                let shader_source = match &library.source {
                    LibrarySource::Wgsl(code) => wgpu::ShaderSource::Wgsl(Cow::Borrowed(code)),
                    LibrarySource::SpirV(words) => wgpu::ShaderSource::SpirV(Cow::Borrowed(words)),
                };
                let module = self.create_module(descriptor, &library.label, shader_source)?;
                self.create_pipeline(descriptor, &module, None)?
            }
            FunctionSource::Archived { entry, path } => {
                let payload = WgpuPayload::decode(entry.payload()).ok_or_else(|| ArchiveError::ArchiveMiss {
                    descriptor: descriptor.to_string(),
                    path: path.to_path_buf(),
                    backend: WGPU_BACKEND_NAME.to_string(),
                })?;

                let cache = match self.context.pipeline_cache_key() {
                    Some(key) if key == payload.cache_key && !payload.cache_data.is_empty() => self.create_pipeline_cache(Some(&payload.cache_data)),
                    _ => {
                        if !payload.cache_data.is_empty() {
                            tracing::warn!(archive_key = %payload.cache_key, "driver cache blob was built for a different adapter; ignoring it");
                        }
                        None
                    }
                };

                let module = self.create_module(descriptor, "archived functions", wgpu::ShaderSource::SpirV(Cow::Borrowed(&payload.spirv)))?;
                self.create_pipeline(descriptor, &module, cache.as_ref())?
            }
        };

        Ok(WgpuPipeline {
            descriptor: descriptor.clone(),
            pipeline,
        })
    }

    fn submit_render(&self, pipeline: &WgpuPipeline, scene: &ProbeScene) -> Result<PixelBuffer> {
        let ProbeTopology::PointList = scene.topology;
        let label = pipeline.descriptor.to_string();
        let format = pipeline.descriptor.color_attachment_format();
        let device = &self.context.device;

        let target = readback::create_render_target(device, scene.width, scene.height, texture_format(format));
        let target_view = target.create_view(&wgpu::TextureViewDescriptor::default());
        let buffer = readback::create_readback_buffer(device, &target);

        let ((), error) = self.context.validation_scope(|device| {
            let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("Render Probe") });
            {
                let [r, g, b, a] = scene.clear_color;
                let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some("Render Probe"),
                    color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                        view: &target_view,
                        resolve_target: None,
                        ops: wgpu::Operations {
                            load: wgpu::LoadOp::Clear(wgpu::Color { r, g, b, a }),
                            store: wgpu::StoreOp::Store,
                        },
                    })],
                    ..Default::default()
                });
                render_pass.set_pipeline(&pipeline.pipeline);
                render_pass.draw(0..scene.vertex_count, 0..1);
            }
            readback::encode_copy_to_buffer(&mut encoder, &target, &buffer);
            self.context.queue.submit(std::iter::once(encoder.finish()));
        });
        if let Some(e) = error {
            return Err(ArchiveError::render(label, e.to_string()));
        }

        let bytes = readback::read_buffer(device, &buffer, scene.width, scene.height).map_err(|e| ArchiveError::render(label.clone(), e.to_string()))?;
        PixelBuffer::new(scene.width, scene.height, format, bytes).map_err(|e| ArchiveError::render(label, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_round_trip() {
        let payload = WgpuPayload {
            spirv: vec![0x0723_0203, 1, 2, 3],
            cache_key: "vulkan_1234".to_string(),
            cache_data: vec![5; 10],
        };
        let decoded = WgpuPayload::decode(&payload.encode()).unwrap();
        assert_eq!(decoded.spirv, payload.spirv);
        assert_eq!(decoded.cache_key, payload.cache_key);
        assert_eq!(decoded.cache_data, payload.cache_data);
    }

    #[test]
    fn test_payload_rejects_foreign_bytes() {
        assert!(WgpuPayload::decode(b"FAKE\x01\x00\x00\x00").is_none());
        let mut truncated = WgpuPayload {
            spirv: vec![1, 2],
            cache_key: String::new(),
            cache_data: Vec::new(),
        }
        .encode();
        truncated.truncate(truncated.len() - 1);
        assert!(WgpuPayload::decode(&truncated).is_none());
    }

    /// Negations in the vertex stage, including functions it calls
    fn vertex_negations(module: &naga::Module) -> usize {
        let entry_points = module.entry_points.iter().filter(|ep| ep.stage == naga::ShaderStage::Vertex).map(|ep| &ep.function);
        entry_points
            .chain(module.functions.iter().map(|(_, function)| function))
            .flat_map(|function| function.expressions.iter())
            .filter(|(_, expr)| matches!(expr, naga::Expression::Unary { op: naga::UnaryOperator::Negate, .. }))
            .count()
    }

    #[test]
    fn test_spirv_library_is_archived_without_a_y_flip() {
        let wgsl = naga::front::wgsl::parse_str(PROBE_SHADER).unwrap();
        let wgsl_library = WgpuBackend::validate(wgsl, "probe.wgsl".to_string(), LibrarySource::Wgsl(PROBE_SHADER.to_string())).unwrap();
        let live_words = write_spirv(&wgsl_library).unwrap();

        // What `open_library` does for a `.spv` file
        let spv_module = parse_spirv("probe.spv", bytemuck::cast_slice(&live_words)).unwrap();
        let spv_library = WgpuBackend::validate(spv_module, "probe.spv".to_string(), LibrarySource::SpirV(live_words.clone())).unwrap();
        let archived_words = write_spirv(&spv_library).unwrap();

        let live = parse_spirv("live", bytemuck::cast_slice(&live_words)).unwrap();
        let archived = parse_spirv("archived", bytemuck::cast_slice(&archived_words)).unwrap();
        assert_eq!(vertex_negations(&archived), vertex_negations(&live));
    }

    #[test]
    fn test_probe_shader_entry_points() {
        let module = naga::front::wgsl::parse_str(PROBE_SHADER).unwrap();
        let names: Vec<_> = module.entry_points.iter().map(|ep| (ep.name.as_str(), ep.stage)).collect();
        assert!(names.contains(&("main_vertex", naga::ShaderStage::Vertex)));
        assert!(names.contains(&("main_fragment", naga::ShaderStage::Fragment)));
    }
}
