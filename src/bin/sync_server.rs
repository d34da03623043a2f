use anyhow::{Context, Result};
use clap::Parser;

use treesync::cli::{init_tracing, ServerOpts};
use treesync::net_async::server;

fn main() -> Result<()> {
    let opts = ServerOpts::parse();
    init_tracing(opts.verbose);

    if opts.prefix.exists() && !opts.prefix.is_dir() {
        anyhow::bail!("prefix is not a directory: {}", opts.prefix.display());
    }

    // One thread: every connection is multiplexed on the same event loop
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(server::serve_prefix(&opts.bind_addr(), &opts.prefix))
}
