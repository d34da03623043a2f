use anyhow::{Context, Result};
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;

use treesync::cli::{init_tracing, ClientOpts};
use treesync::logger;
use treesync::net_async::client::{sync_tree, ClientOptions, SyncReport};
use treesync::url::parse_host;

fn main() -> ExitCode {
    let opts = ClientOpts::parse();
    init_tracing(opts.verbose);

    match run(&opts) {
        Ok(report) => {
            if report.succeeded() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            }
        }
        Err(e) => {
            eprintln!("sync_client: {e:#}");
            ExitCode::from(1)
        }
    }
}

fn run(opts: &ClientOpts) -> Result<SyncReport> {
    let (host, port) = parse_host(&opts.server, opts.port)?;
    let logger: Arc<dyn logger::Logger> = Arc::from(logger::select(opts.log_file.as_deref()));
    let options = ClientOptions {
        max_transfers: opts.max_transfers,
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    let report = rt.block_on(sync_tree(&opts.source, &host, port, &options, logger))?;

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "{} directories, {} files ({} transferred, {} up to date), {} bytes, {} failed",
            report.dirs_sent,
            report.files_sent,
            report.files_transferred,
            report.files_skipped,
            report.bytes_transferred,
            report.failed_units
        );
        for error in &report.errors {
            eprintln!("error: {error}");
        }
    }
    Ok(report)
}
