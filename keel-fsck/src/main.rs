use anyhow::Result;
use clap::Parser;
use libkeel::fsck::FsckOpts;
use libkeel::repo::{KeelRepo, RepoOpts};
use std::path::PathBuf;
use std::process::ExitCode;

/// validate every object in the store and report connectivity problems;
/// exits nonzero on any error finding
#[derive(Parser, Debug)]
struct Opts {
    /// report objects not reachable from the refs
    #[arg(long)]
    unreachable: bool,
    /// escalate tolerated oddities to errors
    #[arg(long)]
    strict: bool,
    /// do not excuse missing referents that alternates might provide
    #[arg(long)]
    standalone: bool,
    /// report root commits
    #[arg(long)]
    root: bool,
    /// report tagged objects
    #[arg(long)]
    tags: bool,
    path: Option<PathBuf>,
}

fn main() -> Result<ExitCode> {
    env_logger::init();
    let opts = Opts::parse();
    let path = opts.path.clone().unwrap_or_else(|| PathBuf::from("."));

    let repo = KeelRepo::find_opts(path, RepoOpts { strict: opts.strict, track_refs: true })?;
    let summary = repo.fsck(FsckOpts {
        unreachable: opts.unreachable,
        strict: opts.strict,
        standalone: opts.standalone,
        root: opts.root,
        tags: opts.tags,
    })?;

    for finding in &summary.findings {
        eprintln!("{}", finding);
    }

    Ok(if summary.is_clean() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
