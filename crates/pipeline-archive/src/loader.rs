//! Archive-backed pipeline loading
//!
//! Loading reconstructs a pipeline object strictly from archive contents. A
//! missing entry is reported as [`ArchiveError::ArchiveMiss`]; the loader never
//! has a shader library at hand, so it cannot fall back to compiling from source.

use crate::archive::BinaryArchive;
use crate::backend::{Backend, FunctionSource};
use crate::descriptor::PipelineDescriptor;
use crate::error::{ArchiveError, Result};
use std::path::Path;

/// Deserializes the archive at `archive_path` and builds the pipeline for `descriptor`
pub fn load<B: Backend>(descriptor: &PipelineDescriptor, archive_path: &Path, backend: &B) -> Result<B::Pipeline> {
    let archive = BinaryArchive::deserialize_from(archive_path)?;
    load_from_archive(descriptor, &archive, archive_path, backend)
}

/// Builds the pipeline for `descriptor` from an already deserialized archive
///
/// `archive_path` is only used for error context.
pub fn load_from_archive<B: Backend>(descriptor: &PipelineDescriptor, archive: &BinaryArchive, archive_path: &Path, backend: &B) -> Result<B::Pipeline> {
    // Payloads of another backend are meaningless here
    if archive.backend() != backend.name() {
        tracing::debug!(archive_backend = archive.backend(), backend = backend.name(), "archive was harvested by a different backend");
        return Err(ArchiveError::ArchiveMiss {
            descriptor: descriptor.to_string(),
            path: archive_path.to_path_buf(),
            backend: backend.name().to_string(),
        });
    }

    let entry = archive.lookup(descriptor, archive_path)?;
    let pipeline = backend.build_pipeline(descriptor, FunctionSource::Archived { entry, path: archive_path })?;

    tracing::info!(%descriptor, path = %archive_path.display(), payload_bytes = entry.payload().len(), "loaded pipeline from archive");
    Ok(pipeline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use crate::backend::CompiledFunctions;
    use crate::descriptor::PixelFormat;
    use crate::fake::{FakeBackend, PipelineOrigin};

    fn descriptor(format: PixelFormat) -> PipelineDescriptor {
        PipelineDescriptor::build("main_vertex", "main_fragment", format).unwrap()
    }

    #[test]
    fn test_foreign_backend_archive_is_a_miss() {
        let backend = FakeBackend::new();
        let mut archive = BinaryArchive::new("wgpu");
        archive.insert(descriptor(PixelFormat::Rgba8Unorm), CompiledFunctions::new(vec![0u8; 4]));

        let err = load_from_archive(&descriptor(PixelFormat::Rgba8Unorm), &archive, Path::new("foreign.plar"), &backend).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArchiveMiss);
    }

    #[test]
    fn test_unusable_payload_is_a_miss_not_a_compile() {
        let backend = FakeBackend::new();
        let mut archive = BinaryArchive::new(backend.name());
        archive.insert(descriptor(PixelFormat::Rgba8Unorm), CompiledFunctions::new(b"garbage".to_vec()));

        let err = load_from_archive(&descriptor(PixelFormat::Rgba8Unorm), &archive, Path::new("garbage.plar"), &backend).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArchiveMiss);
        assert_eq!(backend.compile_count(), 0);
    }

    #[test]
    fn test_missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(&descriptor(PixelFormat::Rgba8Unorm), &dir.path().join("absent.plar"), &FakeBackend::new()).unwrap_err();
        match err {
            ArchiveError::Io { source, .. } => assert_eq!(source.kind(), std::io::ErrorKind::NotFound),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_loaded_pipeline_is_archived() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive.plar");
        let backend = FakeBackend::new();
        let library = backend.compile_library("@vertex fn main_vertex() -> @builtin(position) vec4<f32> { return vec4<f32>(0.0, 0.0, 0.0, 1.0); } @fragment fn main_fragment() -> @location(0) vec4<f32> { return vec4<f32>(1.0); }").unwrap();
        crate::harvest(&descriptor(PixelFormat::Rgba8Unorm), &library, &backend, &path).unwrap();

        let pipeline = load(&descriptor(PixelFormat::Rgba8Unorm), &path, &backend).unwrap();
        assert_eq!(pipeline.origin(), PipelineOrigin::Archived);
        assert_eq!(backend.compile_count(), 1);
    }
}
