//! Harvest, reload and verify a render pipeline archive
//!
//! Compiles the pipeline live, harvests it into a content-addressed archive in
//! the scratch directory, rebuilds it from that archive and renders the probe
//! scene through both. Exits 0 only when the outputs are byte-identical; on a
//! mismatch both probe images are written as PNG.
//!
//! # Usage
//! ```bash
//! verify_archive --shader probe.wgsl --format bgra8 --scratch-dir /tmp/archives
//! ```
//!
//! WebGPU rasterizes points at one pixel, so a passing run with the embedded
//! shader logs `lit_pixels=1`: only pixel (2, 2) of the 4x4 target is drawn.

use clap::Parser;
use pipeline_archive::{Backend, archive_file_name, verify_with_label};
use pipeline_archive_verification::{PipelineArgs, dump_mismatch, exit_code, init_tracing, load_library, save_png, scratch_dir};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(version, about = "Harvest a pipeline archive and verify it renders like the live pipeline")]
struct Args {
    /// Shader library (WGSL or .spv); the embedded probe shader is used when omitted
    #[arg(long)]
    shader: Option<PathBuf>,

    /// Directory receiving the harvested archive
    #[arg(long, env = "PIPELINE_ARCHIVE_SCRATCH")]
    scratch_dir: Option<PathBuf>,

    /// Free-form label stored in the archive header
    #[arg(long)]
    label: Option<String>,

    /// Write probe images here (always on mismatch, and on success when given)
    #[arg(long)]
    dump_dir: Option<PathBuf>,

    #[command(flatten)]
    pipeline: PipelineArgs,
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let descriptor = args.pipeline.descriptor()?;
    let backend = args.pipeline.backend()?;
    let library = load_library(&backend, args.shader.as_deref())?;

    let dir = scratch_dir(args.scratch_dir.clone());
    std::fs::create_dir_all(&dir)?;
    let archive_path = dir.join(archive_file_name(&descriptor));
    let label = args.label.clone().unwrap_or_else(|| format!("harvested by {}", backend.name()));

    let verification = match verify_with_label(&descriptor, &library, &archive_path, &backend, &label) {
        Ok(verification) => verification,
        Err(e) => {
            let dump_dir = args.dump_dir.clone().unwrap_or_else(|| dir.join(format!("mismatch-{}", descriptor.digest_hex())));
            dump_mismatch(&dump_dir, &e)?;
            return Err(e.into());
        }
    };

    if let Some(dump_dir) = &args.dump_dir {
        std::fs::create_dir_all(dump_dir)?;
        save_png(&dump_dir.join("probe.png"), &verification.pixels)?;
    }

    let lit = verification.pixels.pixels().filter(|pixel| pixel[3] != 0).count();
    tracing::info!(%descriptor, lit_pixels = lit, "verification passed");
    println!("{}", verification.archive_path.display());
    Ok(())
}

fn main() -> ExitCode {
    init_tracing();
    let args = Args::parse();
    exit_code(run(&args))
}
