//! Archive harvesting
//!
//! Harvesting compiles a pipeline once and writes its compiled functions into a
//! fresh archive file. Every harvest produces a new artifact: an existing file at
//! the destination is replaced, never merged.

use crate::archive::BinaryArchive;
use crate::backend::Backend;
use crate::descriptor::PipelineDescriptor;
use crate::error::Result;
use std::path::Path;

/// Compiles `descriptor` from `library` and serializes the archive to `destination`
///
/// Nothing is written when compilation fails.
pub fn harvest<B: Backend>(descriptor: &PipelineDescriptor, library: &B::Library, backend: &B, destination: &Path) -> Result<BinaryArchive> {
    harvest_with_label(descriptor, library, backend, destination, &format!("harvested by {}", backend.name()))
}

/// Like [`harvest`], storing `label` in the archive header
pub fn harvest_with_label<B: Backend>(descriptor: &PipelineDescriptor, library: &B::Library, backend: &B, destination: &Path, label: &str) -> Result<BinaryArchive> {
    tracing::debug!(%descriptor, digest = %descriptor.digest_hex(), backend = backend.name(), "harvesting pipeline");

    let mut archive = BinaryArchive::new(backend.name()).with_label(label);
    backend.register_pipeline_in_archive(&mut archive, descriptor, library)?;
    archive.serialize_to(destination)?;

    tracing::info!(%descriptor, path = %destination.display(), "harvested pipeline archive");
    Ok(archive)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use crate::descriptor::PixelFormat;
    use crate::fake::FakeBackend;

    const SOURCE: &str = r#"
@vertex
fn main_vertex() -> @builtin(position) vec4<f32> {
    return vec4<f32>(0.0, 0.0, 0.0, 1.0);
}

@fragment
fn main_fragment() -> @location(0) vec4<f32> {
    return vec4<f32>(0.0, 1.0, 0.0, 1.0);
}
"#;

    #[test]
    fn test_harvest_writes_single_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive.plar");
        let backend = FakeBackend::new();
        let library = backend.compile_library(SOURCE).unwrap();
        let descriptor = PipelineDescriptor::build("main_vertex", "main_fragment", PixelFormat::Rgba8Unorm).unwrap();

        let archive = harvest(&descriptor, &library, &backend, &path).unwrap();
        assert_eq!(archive.len(), 1);
        assert_eq!(archive.label(), "harvested by fake");
        assert!(archive.entry(&descriptor).is_some());
        assert_eq!(BinaryArchive::deserialize_from(&path).unwrap(), archive);
    }

    #[test]
    fn test_rejected_format_is_a_compilation_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive.plar");
        let backend = FakeBackend::new().reject_format(PixelFormat::Rgba8UnormSrgb);
        let library = backend.compile_library(SOURCE).unwrap();
        let descriptor = PipelineDescriptor::build("main_vertex", "main_fragment", PixelFormat::Rgba8UnormSrgb).unwrap();

        let err = harvest(&descriptor, &library, &backend, &path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Compilation);
        assert!(!path.exists());
    }

    #[test]
    fn test_unwritable_destination_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing-dir").join("archive.plar");
        let backend = FakeBackend::new();
        let library = backend.compile_library(SOURCE).unwrap();
        let descriptor = PipelineDescriptor::build("main_vertex", "main_fragment", PixelFormat::Rgba8Unorm).unwrap();

        let err = harvest(&descriptor, &library, &backend, &path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}
