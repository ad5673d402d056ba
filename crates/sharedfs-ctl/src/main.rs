// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

mod session;

use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use sharedfs_core::{Credentials, FaultPolicy, FsError, MountConfig};
use sharedfs_logging::CliLoggingArgs;

use crate::session::{read_input, Command, Session};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Run shared folder operations through the guest node cache against a host directory"
)]
struct Cli {
    /// Host directory to share
    #[arg(long, env = "SHAREDFS_ROOT")]
    root: PathBuf,

    /// Mount configuration (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the uid reported as owner of every node
    #[arg(long)]
    uid: Option<u32>,

    /// Override the gid reported as owner of every node
    #[arg(long)]
    gid: Option<u32>,

    /// Caller uid for permission checks (default: the share owner)
    #[arg(long)]
    as_uid: Option<u32>,

    /// Caller gid for permission checks (default: the share owner)
    #[arg(long)]
    as_gid: Option<u32>,

    /// Fault-injection policy applied to host calls, as JSON (use '-' for stdin)
    #[arg(long)]
    fault_policy: Option<PathBuf>,

    /// Print the node cache after the command finishes
    #[arg(long)]
    dump: bool,

    #[command(flatten)]
    logging: CliLoggingArgs,

    #[command(subcommand)]
    command: Command,
}

fn load_config(cli: &Cli) -> Result<MountConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            MountConfig::from_toml_str(&text)
                .with_context(|| format!("invalid mount config {}", path.display()))?
        }
        None => MountConfig::new(share_name(&cli.root)),
    };
    if let Some(uid) = cli.uid {
        config.owner.uid = uid;
    }
    if let Some(gid) = cli.gid {
        config.owner.gid = gid;
    }
    Ok(config)
}

fn share_name(root: &std::path::Path) -> String {
    root.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "share".to_string())
}

fn load_fault_policy(cli: &Cli) -> Result<Option<FaultPolicy>> {
    let Some(path) = &cli.fault_policy else {
        return Ok(None);
    };
    let bytes = read_input(path)?;
    let policy = FaultPolicy::from_json_bytes(&bytes).context("invalid fault policy JSON")?;
    Ok(Some(policy))
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    let creds = Credentials::new(
        cli.as_uid.unwrap_or(config.owner.uid),
        cli.as_gid.unwrap_or(config.owner.gid),
    );
    let fault_policy = load_fault_policy(&cli)?;
    let session = Session::mount(&cli.root, config, fault_policy, creds)?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let result = session.run(&cli.command, &mut out);
    if cli.dump {
        session.dump(&mut out)?;
    }
    out.flush()?;
    result?;
    session.unmount()
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = cli.logging.clone().init("sharedfs-ctl") {
        eprintln!("sharedfs-ctl: failed to initialize logging: {err:#}");
    }
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("sharedfs-ctl: {err:#}");
            let code = err.downcast_ref::<FsError>().map(FsError::errno).unwrap_or(1);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}
