//! Rebuild a pipeline from an existing archive and render the probe scene
//!
//! This is the later-process half of the cache: no shader source is read, so an
//! archive without a matching entry fails with exit code 4 instead of compiling.
//! With `--reference`, the output must equal a PNG written by an earlier run.

use clap::Parser;
use pipeline_archive::{archive_file_name, load_and_compare, load_and_render};
use pipeline_archive_verification::{PipelineArgs, dump_mismatch, exit_code, init_tracing, load_png, save_png, scratch_dir};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(version, about = "Load a harvested pipeline archive and render the probe scene")]
struct Args {
    /// Archive to load; defaults to the content-addressed archive in the scratch directory
    #[arg(long)]
    archive: Option<PathBuf>,

    /// Directory searched for the content-addressed archive
    #[arg(long, env = "PIPELINE_ARCHIVE_SCRATCH")]
    scratch_dir: Option<PathBuf>,

    /// PNG the probe output must match exactly
    #[arg(long)]
    reference: Option<PathBuf>,

    /// Write the probe image here (and both images on mismatch)
    #[arg(long)]
    dump_dir: Option<PathBuf>,

    #[command(flatten)]
    pipeline: PipelineArgs,
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let descriptor = args.pipeline.descriptor()?;
    let archive_path = match &args.archive {
        Some(path) => path.clone(),
        None => scratch_dir(args.scratch_dir.clone()).join(archive_file_name(&descriptor)),
    };
    let backend = args.pipeline.backend()?;

    let result = match &args.reference {
        Some(reference) => {
            let reference = load_png(reference, descriptor.color_attachment_format())?;
            load_and_compare(&descriptor, &archive_path, &backend, &reference)
        }
        None => load_and_render(&descriptor, &archive_path, &backend),
    };

    let pixels = match result {
        Ok(pixels) => pixels,
        Err(e) => {
            if let Some(dump_dir) = &args.dump_dir {
                dump_mismatch(dump_dir, &e)?;
            }
            return Err(e.into());
        }
    };

    if let Some(dump_dir) = &args.dump_dir {
        std::fs::create_dir_all(dump_dir)?;
        save_png(&dump_dir.join("probe.png"), &pixels)?;
    }

    tracing::info!(%descriptor, archive = %archive_path.display(), matched_reference = args.reference.is_some(), "rendered pipeline from archive");
    Ok(())
}

fn main() -> ExitCode {
    init_tracing();
    let args = Args::parse();
    exit_code(run(&args))
}
