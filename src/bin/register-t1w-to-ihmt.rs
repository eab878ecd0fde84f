use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use t1w_ihmt::cli::{exit_code, init_logging, parse_args};
use t1w_ihmt::session::session_span;
use t1w_ihmt::{read_worklist, AntsTools, Driver, MaskStrategy, PipelineError, PipelineParams, Result, SessionKey};
use tracing::info;

/// Rigid registration of T1w images to intra-session ihMT.
///
/// The gathered T1w is registered to the ihMT reference with antsRegistration after N4 bias
/// correction and masking. The antsnetct DKT31 and HOA segmentations are then resampled into
/// ihMT space. Inputs are prepared by gather-t1w-ihmt.
#[derive(Debug, Parser)]
#[command(version)]
struct Args {
    /// BIDS dataset written by gather-t1w-ihmt
    #[arg(long)]
    input_dataset: PathBuf,
    /// BIDS dataset containing the antsnetct derivatives
    #[arg(long)]
    antsnetct_dataset: PathBuf,
    /// output BIDS dataset
    #[arg(long)]
    output_dataset: PathBuf,
    /// participant to process
    #[arg(long, alias = "subject", required_unless_present = "session_list", requires = "session")]
    participant: Option<String>,
    /// session to process
    #[arg(long, requires = "participant")]
    session: Option<String>,
    /// CSV file of participant,session rows to process instead of a single session
    #[arg(long, conflicts_with_all = ["participant", "session"])]
    session_list: Option<PathBuf>,
    /// one of synthstrip, synthstrip_no_csf or no_synthstrip
    #[arg(long, default_value = "synthstrip")]
    registration_mask_strategy: String,
    /// parameter file written by t1w-ihmt-params, defaults are used when absent
    #[arg(long)]
    params: Option<PathBuf>,
    /// debug logging and tool output
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
    let strategy: MaskStrategy = args.registration_mask_strategy.parse()?;
    let params = match &args.params {
        Some(file) => PipelineParams::from_file(file)?,
        None => PipelineParams::default(),
    };

    let tools = AntsTools::new(&params, args.verbose);
    let driver = Driver::new(&args.input_dataset, &args.antsnetct_dataset, &args.output_dataset, strategy, tools);

    if let Some(list) = &args.session_list {
        driver.run(&read_worklist(list)?)?;
        return Ok(());
    }

    let (Some(participant), Some(session)) = (&args.participant, &args.session) else {
        return Err(PipelineError::invalid_configuration("either --session-list or --participant and --session are required"));
    };
    let key = SessionKey::new(participant, session);
    driver.prepare()?;
    let _span = session_span(&key).entered();
    let outcome = driver.register_session(&key)?;
    info!("session finished: {outcome:?}");
    Ok(())
}
