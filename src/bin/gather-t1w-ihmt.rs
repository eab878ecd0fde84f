use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use t1w_ihmt::cli::{exit_code, init_logging, parse_args};
use t1w_ihmt::{read_worklist, Gatherer, Result};
use tracing::info;

/// Gather T1w and ihMT images for registration.
///
/// For each participant and session of the list, the best preprocessed T1w is selected, and
/// copied with its brain mask to the output dataset together with the first volume of the ihMTR
/// series and the ihMT brain mask. Sessions with existing output are skipped.
#[derive(Debug, Parser)]
#[command(version)]
struct Args {
    /// BIDS dataset containing the source T1w images and antsnetct derivatives
    #[arg(long)]
    antsnetct_dataset: PathBuf,
    /// CSV file of participant,session rows without a header
    #[arg(long)]
    session_list: PathBuf,
    /// ihMT processing directory with a sub-<participant>/ses-<session>/output layout
    #[arg(long)]
    ihmt_dir: PathBuf,
    /// output BIDS dataset
    #[arg(long)]
    output_dataset: PathBuf,
    /// debug logging
    #[arg(long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args: Args = parse_args();
    init_logging(args.verbose);
    info!("parsed args: {args:?}");

    exit_code(run(&args))
}

fn run(args: &Args) -> Result<()> {
    let sessions = read_worklist(&args.session_list)?;
    let gatherer = Gatherer::new(&args.antsnetct_dataset, &args.ihmt_dir, &args.output_dataset);
    gatherer.run(&sessions)?;
    Ok(())
}
