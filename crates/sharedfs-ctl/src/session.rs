// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! One mounted share and the commands that run against it

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use sharedfs_core::{
    Cache, CreateOptions, Credentials, FaultPolicy, FaultyProvider, FsResult, HostFsProvider,
    InstanceId, MountConfig, NodeKind, NodeRef, NodeState, Provider, ACCESS_EXEC, ACCESS_READ,
    ACCESS_WRITE,
};
use tracing::{info, warn};

const LS_PAGE: usize = 64;
const CAT_BUFFER: usize = 64 * 1024;

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// List a directory (default: the share root)
    Ls {
        #[arg(default_value = "")]
        path: String,
    },
    /// Show the attributes of a file or directory
    Stat { path: String },
    /// Print a file
    Cat { path: String },
    /// Write to a file, creating it if needed
    Write {
        path: String,
        /// Data to write; read from stdin when omitted
        #[arg(long)]
        data: Option<String>,
        /// Append instead of truncating
        #[arg(long)]
        append: bool,
        /// Fail if the file already exists
        #[arg(long)]
        exclusive: bool,
    },
    /// Create a directory
    Mkdir { path: String },
    /// Remove a file
    Rm { path: String },
    /// Remove an empty directory
    Rmdir { path: String },
    /// Rename a file or directory
    Mv { from: String, to: String },
    /// Check whether the caller may access PATH; MODE is any of r, w, x
    Access { path: String, mode: String },
    /// Run commands from FILE ('-' for stdin), one per line, against one warm cache
    Script { file: PathBuf },
}

/// A single script line, parsed with the same grammar as the command line.
#[derive(Parser, Debug)]
#[command(no_binary_name = true)]
struct ScriptLine {
    #[command(subcommand)]
    command: Command,
}

pub struct Session {
    cache: Cache,
    instance: InstanceId,
    root: NodeRef,
    creds: Credentials,
}

impl Session {
    pub fn mount(
        root_dir: &Path,
        config: MountConfig,
        fault_policy: Option<FaultPolicy>,
        creds: Credentials,
    ) -> Result<Self> {
        let host = HostFsProvider::new(root_dir.to_path_buf())
            .with_context(|| format!("cannot share {}", root_dir.display()))?;
        let provider: Arc<dyn Provider> = match fault_policy {
            Some(policy) if policy.is_active() => {
                info!(rules = policy.rules.len(), "fault injection enabled");
                Arc::new(FaultyProvider::new(host, policy))
            }
            _ => Arc::new(host),
        };
        let cache = Cache::new();
        let (instance, root) = cache.mount(config, provider)?;
        Ok(Self {
            cache,
            instance,
            root,
            creds,
        })
    }

    pub fn unmount(self) -> Result<()> {
        self.cache.unmount(self.instance)?;
        Ok(())
    }

    pub fn run(&self, command: &Command, out: &mut dyn Write) -> Result<()> {
        match command {
            Command::Ls { path } => self.ls(path, out),
            Command::Stat { path } => self.stat(path, out),
            Command::Cat { path } => self.cat(path, out),
            Command::Write {
                path,
                data,
                append,
                exclusive,
            } => {
                let data = match data {
                    Some(data) => data.clone().into_bytes(),
                    None => read_input(Path::new("-"))?,
                };
                self.write(path, &data, *append, *exclusive, out)
            }
            Command::Mkdir { path } => {
                let (dir, name) = self.parent_and_name(path)?;
                let node = self.cache.mkdir(dir, &name, &self.creds).with_context(|| format!("mkdir {path}"))?;
                self.cache.release_external_handle(node)?;
                Ok(())
            }
            Command::Rm { path } => {
                let (dir, name) = self.parent_and_name(path)?;
                self.cache.remove(dir, &name, &self.creds).with_context(|| format!("rm {path}"))?;
                Ok(())
            }
            Command::Rmdir { path } => {
                let (dir, name) = self.parent_and_name(path)?;
                self.cache.rmdir(dir, &name, &self.creds).with_context(|| format!("rmdir {path}"))?;
                Ok(())
            }
            Command::Mv { from, to } => {
                let (from_dir, from_name) = self.parent_and_name(from)?;
                let (to_dir, to_name) = self.parent_and_name(to)?;
                self.cache
                    .rename(from_dir, &from_name, to_dir, &to_name, &self.creds)
                    .with_context(|| format!("mv {from} {to}"))?;
                Ok(())
            }
            Command::Access { path, mode } => {
                let bits = parse_access(mode)?;
                let node = self.resolve(path)?;
                self.cache
                    .check_access(node, bits, &self.creds)
                    .with_context(|| format!("access {path} {mode}"))?;
                writeln!(out, "{path}: {mode} granted")?;
                Ok(())
            }
            Command::Script { file } => self.script(file, out),
        }
    }

    fn resolve(&self, path: &str) -> Result<NodeRef> {
        self.cache
            .resolve_path(self.root, path)
            .with_context(|| format!("{path}: cannot resolve"))
    }

    /// Directory node and final name of a share-relative path.
    fn parent_and_name(&self, path: &str) -> Result<(NodeRef, String)> {
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() {
            bail!("{path:?}: the share root has no name");
        }
        match trimmed.rsplit_once('/') {
            Some((dir, name)) => Ok((self.resolve(dir)?, name.to_string())),
            None => Ok((self.root, trimmed.to_string())),
        }
    }

    /// Run `f` on the node at `path` while holding an external handle on it.
    fn with_open<T>(&self, path: &str, f: impl FnOnce(NodeRef) -> Result<T>) -> Result<T> {
        let (dir, name) = self.parent_and_name(path)?;
        let node = self
            .cache
            .lookup(dir, &name, &self.creds)
            .with_context(|| format!("open {path}"))?;
        let result = f(node);
        self.cache.release_external_handle(node)?;
        result
    }

    fn ls(&self, path: &str, out: &mut dyn Write) -> Result<()> {
        let dir = self.resolve(path)?;
        self.cache
            .check_access(dir, ACCESS_READ | ACCESS_EXEC, &self.creds)
            .with_context(|| format!("ls {path}"))?;
        let mut start = 0;
        loop {
            let page = self.cache.list_directory(dir, start, LS_PAGE)?;
            for entry in &page.entries {
                writeln!(out, "{:>8} {:<9} {}", entry.ino, kind_label(entry.kind), entry.name)?;
            }
            if page.eof || page.next_index == start {
                return Ok(());
            }
            start = page.next_index;
        }
    }

    fn stat(&self, path: &str, out: &mut dyn Write) -> Result<()> {
        let node = self.resolve(path)?;
        let attrs = self
            .cache
            .get_attributes(node)
            .with_context(|| format!("stat {path}"))?;
        writeln!(out, "path:   /{}", path.trim_matches('/'))?;
        writeln!(out, "ino:    {}", attrs.ino)?;
        writeln!(out, "kind:   {}", kind_label(attrs.kind))?;
        writeln!(out, "mode:   {:04o}", attrs.mode)?;
        writeln!(out, "owner:  {}:{}", attrs.uid, attrs.gid)?;
        writeln!(out, "size:   {} ({} blocks of {})", attrs.size, attrs.blocks, attrs.blksize)?;
        writeln!(out, "mtime:  {}.{:09}", attrs.mtime.sec, attrs.mtime.nsec)?;
        Ok(())
    }

    fn cat(&self, path: &str, out: &mut dyn Write) -> Result<()> {
        self.with_open(path, |node| {
            self.cache.check_access(node, ACCESS_READ, &self.creds)?;
            let mut buf = vec![0u8; CAT_BUFFER];
            let mut offset = 0u64;
            loop {
                let n = self.cache.read(node, offset, &mut buf)?;
                if n == 0 {
                    return Ok(());
                }
                out.write_all(&buf[..n])?;
                offset += n as u64;
            }
        })
    }

    fn write(
        &self,
        path: &str,
        data: &[u8],
        append: bool,
        exclusive: bool,
        out: &mut dyn Write,
    ) -> Result<()> {
        let (dir, name) = self.parent_and_name(path)?;
        let options = CreateOptions {
            exclusive,
            truncate: !append,
            access: ACCESS_WRITE,
        };
        let node = self
            .cache
            .create(dir, &name, options, &self.creds)
            .with_context(|| format!("open {path} for writing"))?;
        let written = write_all(&self.cache, node, data, append);
        self.cache.release_external_handle(node)?;
        let written = written.with_context(|| format!("write {path}"))?;
        writeln!(out, "{path}: wrote {written} bytes")?;
        Ok(())
    }

    fn script(&self, file: &Path, out: &mut dyn Write) -> Result<()> {
        let text = String::from_utf8(read_input(file)?).context("script is not UTF-8")?;
        let mut failures = 0usize;
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            writeln!(out, "$ {line}")?;
            let outcome = ScriptLine::try_parse_from(line.split_whitespace())
                .map_err(anyhow::Error::from)
                .and_then(|parsed| match parsed.command {
                    Command::Script { .. } => bail!("scripts cannot nest"),
                    command => self.run(&command, out),
                });
            if let Err(err) = outcome {
                failures += 1;
                warn!(line = lineno + 1, error = %err, "script command failed");
                writeln!(out, "error: {err:#}")?;
            }
        }
        if failures > 0 {
            bail!("{failures} script command(s) failed");
        }
        Ok(())
    }

    /// Print every cached node of the share.
    pub fn dump(&self, out: &mut dyn Write) -> Result<()> {
        let stats = self.cache.stats();
        writeln!(
            out,
            "# live={} stale={} external={} host={}",
            stats.live_nodes, stats.stale_nodes, stats.external_handles, stats.host_handles
        )?;
        for (_, node) in self.cache.nodes(self.instance) {
            let state = match node.state {
                NodeState::Live => "live",
                NodeState::Stale => "stale",
            };
            writeln!(
                out,
                "{:>6} {:<5} {:<9} ext={} host={} children={} /{}",
                node.ino,
                state,
                kind_label(node.kind),
                node.external_holds,
                u8::from(node.has_host_handle),
                node.child_count,
                node.path.trim_start_matches('/'),
            )?;
        }
        self.cache.verify_invariants()?;
        Ok(())
    }
}

fn write_all(cache: &Cache, node: NodeRef, data: &[u8], append: bool) -> FsResult<usize> {
    let mut done = 0;
    while done < data.len() {
        let n = cache.write(node, done as u64, &data[done..], append)?;
        if n == 0 {
            break;
        }
        done += n;
    }
    Ok(done)
}

fn kind_label(kind: NodeKind) -> &'static str {
    match kind {
        NodeKind::File => "file",
        NodeKind::Directory => "directory",
        NodeKind::Unknown => "other",
    }
}

fn parse_access(mode: &str) -> Result<u32> {
    mode.chars().try_fold(0, |bits, c| {
        Ok(bits
            | match c {
                'r' => ACCESS_READ,
                'w' => ACCESS_WRITE,
                'x' => ACCESS_EXEC,
                other => bail!("unknown access letter {other:?}; use r, w or x"),
            })
    })
}

/// Read a whole file, or stdin for `-`.
pub fn read_input(path: &Path) -> Result<Vec<u8>> {
    if path == Path::new("-") {
        let mut buf = Vec::new();
        io::stdin().read_to_end(&mut buf)?;
        Ok(buf)
    } else {
        fs::read(path).with_context(|| format!("failed to read {}", path.display()))
    }
}
