//! Equivalence verification
//!
//! Verification builds the same descriptor twice, once by direct compilation and
//! once through harvest + load, renders both with the probe and requires the
//! pixel buffers to be byte-identical.

use crate::backend::{Backend, FunctionSource};
use crate::compare::MismatchError;
use crate::descriptor::PipelineDescriptor;
use crate::error::Result;
use crate::harvester::harvest_with_label;
use crate::loader::load;
use crate::probe::{self, PixelBuffer};
use std::path::{Path, PathBuf};

/// Outcome of a successful verification
#[derive(Debug, Clone)]
pub struct Verification {
    /// Descriptor that was verified
    pub descriptor: PipelineDescriptor,
    /// Archive harvested during verification
    pub archive_path: PathBuf,
    /// Probe output shared by both pipelines
    pub pixels: PixelBuffer,
}

/// Harvests `descriptor` into `archive_path`, reloads it, and checks both pipelines render identically
pub fn verify<B: Backend>(descriptor: &PipelineDescriptor, library: &B::Library, archive_path: &Path, backend: &B) -> Result<Verification> {
    verify_with_label(descriptor, library, archive_path, backend, &format!("harvested by {}", backend.name()))
}

/// Like [`verify`], storing `label` in the harvested archive
pub fn verify_with_label<B: Backend>(descriptor: &PipelineDescriptor, library: &B::Library, archive_path: &Path, backend: &B, label: &str) -> Result<Verification> {
    let live = backend.build_pipeline(descriptor, FunctionSource::Library(library))?;
    tracing::debug!(%descriptor, "built live pipeline");

    harvest_with_label(descriptor, library, backend, archive_path, label)?;
    let archived = load(descriptor, archive_path, backend)?;

    let expected = probe::render(&live, backend)?;
    let actual = probe::render(&archived, backend)?;
    MismatchError::check(descriptor.to_string(), &expected, &actual)?;

    tracing::info!(%descriptor, path = %archive_path.display(), "archive-loaded pipeline matches live pipeline");
    Ok(Verification {
        descriptor: descriptor.clone(),
        archive_path: archive_path.to_path_buf(),
        pixels: expected,
    })
}

/// Loads `descriptor` from an existing archive and renders the probe scene
///
/// This is the path taken by a later process that reuses a harvested archive.
pub fn load_and_render<B: Backend>(descriptor: &PipelineDescriptor, archive_path: &Path, backend: &B) -> Result<PixelBuffer> {
    let pipeline = load(descriptor, archive_path, backend)?;
    probe::render(&pipeline, backend)
}

/// Like [`load_and_render`], additionally requiring the output to equal `reference`
pub fn load_and_compare<B: Backend>(descriptor: &PipelineDescriptor, archive_path: &Path, backend: &B, reference: &PixelBuffer) -> Result<PixelBuffer> {
    let pixels = load_and_render(descriptor, archive_path, backend)?;
    MismatchError::check(descriptor.to_string(), reference, &pixels)?;
    Ok(pixels)
}
