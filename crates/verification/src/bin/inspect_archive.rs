//! Print the manifest of a pipeline archive as JSON
//!
//! Decoding validates the whole container, including every payload checksum,
//! so a corrupt archive exits with code 3.

use clap::Parser;
use pipeline_archive::BinaryArchive;
use pipeline_archive_verification::{exit_code, init_tracing};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(version, about = "Describe the entries of a pipeline archive")]
struct Args {
    /// Archive file to inspect
    archive: PathBuf,
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let archive = BinaryArchive::deserialize_from(&args.archive)?;
    println!("{}", serde_json::to_string_pretty(&archive.manifest())?);
    Ok(())
}

fn main() -> ExitCode {
    init_tracing();
    let args = Args::parse();
    exit_code(run(&args))
}
