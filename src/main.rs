mod analyser;
mod error;
mod ui;

use analyser::core::{AnalyseOptions, SOURCE_REJECT_THRESHOLD};
use analyser::metadata::RunMetadata;
use clap::{ArgAction, Parser};
use error::{AnalysisError, Result};
use log::LevelFilter;
use simple_logger::SimpleLogger;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::process;
use ui::output;

/// ecnsniff turns decoded QoF flow records into ECN path observations
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Decoded flow records, one JSON object per line; stdin when absent
    #[arg(short = 'f', long, value_parser)]
    file: Option<String>,

    /// Metadata file for the raw capture
    #[arg(short = 'm', long, value_parser)]
    metadata: String,

    /// Campaign metadata consulted for keys the capture metadata lacks
    #[arg(long, value_parser)]
    campaign_metadata: Option<String>,

    /// Where to write observations; stdout when absent
    #[arg(short = 'o', long, value_parser)]
    output: Option<String>,

    /// Reversed-flow heuristic threshold, default is 100
    #[arg(short = 't', long, default_value_t = SOURCE_REJECT_THRESHOLD, value_parser)]
    reject_threshold: usize,

    /// Keep flows whose start was not observed
    #[arg(long, action = ArgAction::SetTrue)]
    include_midstream: bool,

    /// Write flows still pending at end of run to this file
    #[arg(long, value_parser)]
    pending_out: Option<String>,

    /// Do not print the run summary
    #[arg(short = 'q', long, action = ArgAction::SetTrue)]
    quiet: bool,
}

fn open_metadata(path: &str) -> Result<RunMetadata> {
    let file = File::open(path).map_err(|e| AnalysisError::MetadataRead(format!("{path}: {e}")))?;
    RunMetadata::from_reader(BufReader::new(file))
}

fn load_metadata(args: &Args) -> Result<RunMetadata> {
    let metadata = open_metadata(&args.metadata)?;
    match args.campaign_metadata.as_deref() {
        Some(path) => {
            log::info!("Inheriting metadata from {path}");
            let campaign = open_metadata(path)?;
            Ok(metadata.with_parent(campaign))
        }
        None => Ok(metadata),
    }
}

fn run(args: &Args) -> Result<()> {
    let metadata = load_metadata(args)?;

    let input: Box<dyn io::BufRead> = match args.file.as_deref() {
        Some(path) => {
            log::info!("Reading from {path}");
            Box::new(BufReader::new(File::open(path)?))
        }
        None => Box::new(io::stdin().lock()),
    };

    let out: Box<dyn Write> = match args.output.as_deref() {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(BufWriter::new(io::stdout().lock())),
    };

    let options = AnalyseOptions {
        require_syn: !args.include_midstream,
        source_reject_threshold: args.reject_threshold,
    };

    let (stats, correlator) = analyser::core::analyse(input, &metadata, &options, out)?;

    if let Some(path) = args.pending_out.as_deref() {
        log::info!("Writing pending flows to {path}");
        let (tcp, ecn) = correlator.into_pending();
        output::write_pending(BufWriter::new(File::create(path)?), &tcp, &ecn)?;
    }

    if !args.quiet {
        output::print_results(&stats);
    }

    Ok(())
}

fn main() {
    SimpleLogger::new().with_level(LevelFilter::Info).env().init().unwrap();

    let args = Args::parse();

    if let Err(err) = run(&args) {
        log::error!("{err}");
        process::exit(1);
    }
}
