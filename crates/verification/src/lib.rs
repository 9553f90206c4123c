//! Command-line helpers shared by the pipeline archive binaries
//!
//! Each binary parses its own clap arguments, flattens [`PipelineArgs`] for the
//! descriptor and device options, and reports failures through [`exit_code`] so
//! scripts can tell a mismatch from an archive miss without parsing messages.

use clap::Args;
use pipeline_archive::wgpu_backend::{ContextOptions, PROBE_SHADER, WgpuBackend, WgpuLibrary};
use pipeline_archive::{ArchiveError, Backend, ErrorKind, PipelineDescriptor, PixelBuffer, PixelFormat};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Descriptor and device options common to every binary
#[derive(Debug, Clone, Args)]
pub struct PipelineArgs {
    /// Vertex entry point name
    #[arg(long, default_value = "main_vertex")]
    pub vertex: String,

    /// Fragment entry point name
    #[arg(long, default_value = "main_fragment")]
    pub fragment: String,

    /// Color attachment format (rgba8, bgra8, rgba8-srgb, bgra8-srgb)
    #[arg(long, default_value = "rgba8")]
    pub format: PixelFormat,

    /// Request a fallback (software) adapter
    #[arg(long)]
    pub fallback_adapter: bool,
}

impl PipelineArgs {
    pub fn descriptor(&self) -> Result<PipelineDescriptor, ArchiveError> {
        PipelineDescriptor::build(self.vertex.as_str(), self.fragment.as_str(), self.format)
    }

    /// Acquires the GPU backend
    pub fn backend(&self) -> Result<WgpuBackend, ArchiveError> {
        WgpuBackend::new(&ContextOptions {
            force_fallback_adapter: self.fallback_adapter,
        })
    }
}

/// Installs the fmt subscriber on stderr, honoring `RUST_LOG` (default `info`)
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).with_writer(std::io::stderr).init();
}

/// Opens `shader` (WGSL or `.spv`), or compiles the embedded probe shader when absent
pub fn load_library(backend: &WgpuBackend, shader: Option<&Path>) -> Result<WgpuLibrary, ArchiveError> {
    match shader {
        Some(path) => {
            tracing::info!(path = %path.display(), "opening shader library");
            backend.open_library(path)
        }
        None => {
            tracing::info!("using embedded probe shader");
            backend.compile_library(PROBE_SHADER)
        }
    }
}

/// Scratch directory from the command line, `PIPELINE_ARCHIVE_SCRATCH`, or the system temp dir
pub fn scratch_dir(configured: Option<PathBuf>) -> PathBuf {
    configured.unwrap_or_else(std::env::temp_dir)
}

/// Process exit code for an error kind
pub fn exit_code_for_kind(kind: ErrorKind) -> u8 {
    match kind {
        ErrorKind::Mismatch => 1,
        ErrorKind::Compilation => 2,
        ErrorKind::Io => 3,
        ErrorKind::ArchiveMiss => 4,
        ErrorKind::Render => 5,
        ErrorKind::InvalidDescriptor => 6,
    }
}

/// Logs the outcome of a binary's run and converts it into its exit code
pub fn exit_code(result: Result<(), Box<dyn std::error::Error>>) -> ExitCode {
    let Err(error) = result else {
        return ExitCode::SUCCESS;
    };
    tracing::error!("{error}");

    let code = if let Some(error) = error.downcast_ref::<ArchiveError>() {
        exit_code_for_kind(error.kind())
    } else if error.is::<image::ImageError>() || error.is::<std::io::Error>() {
        exit_code_for_kind(ErrorKind::Io)
    } else {
        exit_code_for_kind(ErrorKind::InvalidDescriptor)
    };
    ExitCode::from(code)
}

/// Writes a probe buffer as an RGBA PNG
pub fn save_png(path: &Path, pixels: &PixelBuffer) -> Result<(), image::ImageError> {
    image::save_buffer(path, &pixels.to_rgba(), pixels.width(), pixels.height(), image::ExtendedColorType::Rgba8)
}

/// Reads a PNG written by [`save_png`] back into `format`'s channel order
pub fn load_png(path: &Path, format: PixelFormat) -> Result<PixelBuffer, Box<dyn std::error::Error>> {
    let image = image::open(path)?.to_rgba8();
    let (width, height) = image.dimensions();
    let mut bytes = image.into_raw();
    if format.is_bgra() {
        for pixel in bytes.chunks_exact_mut(4) {
            pixel.swap(0, 2);
        }
    }
    Ok(PixelBuffer::new(width, height, format, bytes)?)
}

/// Dumps the expected and actual buffers of a mismatch into `dir`
pub fn dump_mismatch(dir: &Path, error: &ArchiveError) -> Result<(), image::ImageError> {
    if let ArchiveError::Mismatch(mismatch) = error {
        std::fs::create_dir_all(dir)?;
        save_png(&dir.join("expected.png"), &mismatch.expected)?;
        save_png(&dir.join("actual.png"), &mismatch.actual)?;
        tracing::info!(dir = %dir.display(), "wrote mismatch images");
    }
    Ok(())
}
