//! treesync - local tools around the sync engine
//!
//! `hash` fingerprints a file or stdin, `tree` prints a snapshot, and `copy`
//! replicates a tree on this machine with a bounded worker pool.

use anyhow::{Context, Result};
use clap::Parser;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use std::process::ExitCode;

use treesync::cli::{init_tracing, ToolCommand, ToolOpts};
use treesync::fingerprint::Fingerprint;
use treesync::logger;
use treesync::replicate::{replicate, ReplicateOptions};
use treesync::tree;

fn main() -> ExitCode {
    let opts = ToolOpts::parse();
    init_tracing(opts.verbose);

    match run(opts.command) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("treesync: {e:#}");
            ExitCode::from(1)
        }
    }
}

/// Returns whether the command fully succeeded
fn run(command: ToolCommand) -> Result<bool> {
    match command {
        ToolCommand::Hash {
            block_size,
            comparison,
            file,
        } => {
            let reader: Box<dyn Read> = match &file {
                Some(path) => Box::new(BufReader::new(
                    File::open(path).with_context(|| format!("open {}", path.display()))?,
                )),
                None => Box::new(io::stdin().lock()),
            };
            hash(reader, block_size, comparison.as_deref())
        }
        ToolCommand::Tree { path } => {
            let node = tree::build(&path)?;
            print!("{}", tree::render(&node));
            Ok(true)
        }
        ToolCommand::Copy {
            source,
            destination,
            threads,
            log_file,
        } => copy(&source, &destination, threads, log_file.as_deref()),
    }
}

fn hash(reader: impl Read, block_size: usize, comparison: Option<&str>) -> Result<bool> {
    // Validate the comparison before reading possibly large input
    let expected = comparison
        .map(|hex| Fingerprint::from_hex(hex, block_size))
        .transpose()?;
    let fingerprint = Fingerprint::compute(reader, block_size).context("read input")?;
    println!("{}", fingerprint.to_spaced_hex());

    let Some(expected) = expected else {
        return Ok(true);
    };
    match fingerprint.first_difference(&expected) {
        None => {
            println!("match");
            Ok(true)
        }
        Some(index) => {
            println!("differs at index {index}");
            Ok(false)
        }
    }
}

fn copy(source: &Path, destination: &Path, threads: usize, log_file: Option<&Path>) -> Result<bool> {
    let logger = logger::select(log_file);
    let outcome = replicate(source, destination, &ReplicateOptions { threads }, &*logger);

    println!(
        "{} copied, {} up to date, {} directories created, {} bytes",
        outcome.files_copied, outcome.files_skipped, outcome.dirs_created, outcome.bytes_copied
    );
    for error in &outcome.errors {
        eprintln!("error: {error}");
    }
    if let Err(e) = outcome.into_result(source) {
        eprintln!("treesync: {e}");
        return Ok(false);
    }
    Ok(true)
}
