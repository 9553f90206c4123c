//! Capability interface over a native GPU API
//!
//! The harvester, loader, render probe and verifier only ever talk to a
//! [`Backend`]. Production code binds it to wgpu ([`crate::wgpu_backend`]);
//! tests use the scripted [`crate::fake::FakeBackend`].

use crate::archive::{ArchiveEntry, BinaryArchive};
use crate::descriptor::PipelineDescriptor;
use crate::error::Result;
use crate::probe::{PixelBuffer, ProbeScene};
use bytes::Bytes;
use std::path::Path;

/// Backend-defined compiled pipeline functions, opaque to this crate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledFunctions {
    /// Serialized compiled functions stored verbatim in an archive entry
    pub payload: Bytes,
}

impl CompiledFunctions {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self { payload: payload.into() }
    }
}

/// Where a pipeline's functions come from
///
/// `Archived` deliberately carries no shader library, so a backend asked to
/// build from an archive entry has nothing to recompile from.
#[derive(Debug)]
pub enum FunctionSource<'a, L> {
    /// Compile from a shader library
    Library(&'a L),
    /// Materialize from a previously harvested archive entry
    Archived {
        entry: &'a ArchiveEntry,
        /// Archive file the entry was read from, for error context
        path: &'a Path,
    },
}

/// GPU backend operations consumed by the pipeline archive flow
pub trait Backend {
    /// Handle to compiled shader functions
    type Library;
    /// GPU-executable render pipeline
    type Pipeline;

    /// Tag written into archives produced by this backend
    fn name(&self) -> &str;

    /// Compiles shader source text into a library
    fn compile_library(&self, source: &str) -> Result<Self::Library>;

    /// Opens a shader library from a file
    fn open_library(&self, path: &Path) -> Result<Self::Library>;

    /// Resolves the descriptor's entry points in `library` and compiles them
    ///
    /// Fails with a compilation error if an entry point is missing or the
    /// backend rejects the descriptor.
    fn compile_functions(&self, descriptor: &PipelineDescriptor, library: &Self::Library) -> Result<CompiledFunctions>;

    /// Compiles the descriptor's functions and records them in `archive`
    fn register_pipeline_in_archive(&self, archive: &mut BinaryArchive, descriptor: &PipelineDescriptor, library: &Self::Library) -> Result<()> {
        let functions = self.compile_functions(descriptor, library)?;
        archive.insert(descriptor.clone(), functions);
        Ok(())
    }

    /// Builds a pipeline object for `descriptor` from the given function source
    fn build_pipeline(&self, descriptor: &PipelineDescriptor, source: FunctionSource<'_, Self::Library>) -> Result<Self::Pipeline>;

    /// Encodes the scene through `pipeline`, waits for completion and reads back the target
    fn submit_render(&self, pipeline: &Self::Pipeline, scene: &ProbeScene) -> Result<PixelBuffer>;
}
