use anyhow::Result;
use clap::Parser;
use libkeel::repo::{KeelRepo, RepoOpts};
use libkeel::upload_pack::{UploadPack, UploadPackOpts};
use std::path::PathBuf;
use std::time::Duration;

/// serve the upload side of a fetch over stdin/stdout
#[derive(Parser, Debug)]
struct Opts {
    /// refuse repositories with identity mismatches
    #[arg(long)]
    strict: bool,
    /// seconds each framing read may block (0 waits forever)
    #[arg(long, default_value_t = 0)]
    timeout: u64,
    path: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let opts = Opts::parse();

    let repo = KeelRepo::find_opts(
        &opts.path,
        RepoOpts { strict: opts.strict, track_refs: false },
    )?;
    let timeout = (opts.timeout > 0).then(|| Duration::from_secs(opts.timeout));

    let upload_pack = UploadPack::new(
        repo,
        tokio::io::stdin(),
        tokio::io::stdout(),
        UploadPackOpts { timeout },
    );
    upload_pack.run().await
}
