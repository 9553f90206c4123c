//! Precompiled render-pipeline archives with correctness verification
//!
//! This crate compiles render pipelines once, stores the compiled functions in
//! an on-disk binary archive, and rebuilds pipelines from that archive without
//! touching the shader compiler. A deterministic render probe checks that a
//! pipeline loaded from an archive draws exactly what the live-compiled one does.
//!
//! The flow is backend-agnostic: [`harvest`], [`load`] and [`verify`] work with
//! any [`Backend`]. [`wgpu_backend::WgpuBackend`] is the GPU implementation and
//! [`fake::FakeBackend`] a scripted one for tests.

mod archive;
mod backend;
pub mod compare;
mod descriptor;
mod error;
pub mod fake;
mod harvester;
mod loader;
mod probe;
mod verifier;
pub mod wgpu_backend;

pub use archive::{ARCHIVE_EXTENSION, ARCHIVE_MAGIC, ARCHIVE_VERSION, ArchiveEntry, ArchiveManifest, BinaryArchive, ManifestEntry, archive_file_name};
pub use backend::{Backend, CompiledFunctions, FunctionSource};
pub use compare::{CompareResult, MismatchError, PixelDifference, compare_pixels};
pub use descriptor::{PipelineDescriptor, PixelFormat};
pub use error::{ArchiveError, ErrorKind, Result};
pub use harvester::{harvest, harvest_with_label};
pub use loader::{load, load_from_archive};
pub use probe::{BufferSizeError, PixelBuffer, ProbeScene, ProbeTopology, render};
pub use verifier::{Verification, load_and_compare, load_and_render, verify, verify_with_label};
