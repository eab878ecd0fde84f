use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use t1w_ihmt::cli::{exit_code, init_logging, parse_args};
use t1w_ihmt::PipelineParams;
use tracing::info;

#[derive(Debug, Parser)]
struct Args {
    /// path to the parameter file to write
    parameter_file: PathBuf,
}

fn main() -> ExitCode {
    let args: Args = parse_args();
    init_logging(false);
    exit_code(PipelineParams::default().to_file(&args.parameter_file).map(|filename| {
        info!("wrote default parameter file to {}", filename.display());
    }))
}
