// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Restore a missing set from a definition file on disk.
//!
//! Each directory named by `INITSETDIR` (default `/etc/ipsets`) is
//! searched in order for `<name>` and then `<name>.set`. Each regular
//! file found is fed to `ipset restore` on stdin until one restore
//! succeeds. Provisioning is best effort: it never fails by itself,
//! resolution afterwards decides whether the set exists. Only names
//! that are a single path component are looked for, so a candidate
//! never leaves its directory.

use crate::registry::RegistryError;
use crate::registry::Resolver;
use crate::registry::SetRef;
use crate::registry::SetRegistry;
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use slog::Logger;
use slog::debug;
use slog::info;
use slog::warn;
use std::ffi::OsStr;
use std::ffi::OsString;
use std::fmt;
use std::fs::File;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;
use std::process::Stdio;
use thiserror::Error;

/// The environment variable holding the colon separated list of set
/// definition directories.
pub const INITSETDIR: &str = "INITSETDIR";

pub const DEFAULT_SET_DIR: &str = "/etc/ipsets";

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProvisionCfg {
    /// Directories searched, in order.
    pub set_dirs: Vec<PathBuf>,
    /// The set management tool.
    pub tool: PathBuf,
    /// The arguments given to `tool`.
    pub tool_args: Vec<OsString>,
    /// The extension tried after the bare set name.
    pub extension: String,
}

impl ProvisionCfg {
    /// Read the directory list from `INITSETDIR`.
    pub fn from_env() -> Self {
        Self::from_dir_list(std::env::var_os(INITSETDIR).as_deref())
    }

    /// Build a config from a colon separated directory list. `None`
    /// means the default directory; empty components are skipped.
    pub fn from_dir_list(list: Option<&OsStr>) -> Self {
        let list = list.unwrap_or(OsStr::new(DEFAULT_SET_DIR));
        let set_dirs = list
            .as_bytes()
            .split(|b| *b == b':')
            .filter(|d| !d.is_empty())
            .map(|d| PathBuf::from(OsStr::from_bytes(d)))
            .collect();

        Self {
            set_dirs,
            tool: PathBuf::from("ipset"),
            tool_args: vec![OsString::from("restore")],
            extension: ".set".to_string(),
        }
    }

    /// The candidate files for `name` within `dir`, in the order they
    /// are tried. `None` when `name` is not a plain file name.
    pub fn candidates(&self, dir: &Path, name: &str) -> Option<[PathBuf; 2]> {
        if !is_file_name(name) {
            return None;
        }

        Some([dir.join(name), dir.join(format!("{name}{}", self.extension))])
    }
}

fn is_file_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/')
}

impl Default for ProvisionCfg {
    fn default() -> Self {
        Self::from_dir_list(None)
    }
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("cannot open {}: {err}", path.display())]
    Open { path: PathBuf, err: std::io::Error },

    #[error("cannot run {}: {err}", tool.display())]
    Spawn { tool: PathBuf, err: std::io::Error },

    #[error("waiting for pid {pid} failed: {errno}")]
    Wait { pid: Pid, errno: Errno },

    #[error("restore exited with status {0}")]
    Exited(i32),

    #[error("restore was killed by {0}")]
    Signaled(Signal),

    #[error("restore ended with unexpected wait status {0:?}")]
    Status(WaitStatus),
}

/// Loads one set definition file into the registry.
pub trait Restore {
    fn restore(&self, path: &Path) -> Result<(), ProvisionError>;
}

/// Restore by running the set management tool with the definition
/// file as its stdin.
#[derive(Clone, Debug)]
pub struct ToolRestore {
    tool: PathBuf,
    args: Vec<OsString>,
}

impl ToolRestore {
    pub fn new(cfg: &ProvisionCfg) -> Self {
        Self { tool: cfg.tool.clone(), args: cfg.tool_args.clone() }
    }
}

impl Restore for ToolRestore {
    fn restore(&self, path: &Path) -> Result<(), ProvisionError> {
        let input = File::open(path).map_err(|err| ProvisionError::Open {
            path: path.to_path_buf(),
            err,
        })?;

        let child = Command::new(&self.tool)
            .args(&self.args)
            .stdin(Stdio::from(input))
            .spawn()
            .map_err(|err| ProvisionError::Spawn {
                tool: self.tool.clone(),
                err,
            })?;

        // Wait for this exact child. An interrupted wait says nothing
        // about the child, so try again.
        let pid = Pid::from_raw(child.id() as i32);
        let status = loop {
            match waitpid(pid, None) {
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(ProvisionError::Wait { pid, errno }),
                Ok(status) => break status,
            }
        };

        match status {
            WaitStatus::Exited(_, 0) => Ok(()),
            WaitStatus::Exited(_, code) => Err(ProvisionError::Exited(code)),
            WaitStatus::Signaled(_, sig, _) => Err(ProvisionError::Signaled(sig)),
            status => Err(ProvisionError::Status(status)),
        }
    }
}

/// How [`Provisioner::ensure`] found a set.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Provisioned {
    /// The set was there before any restore was tried.
    Present,
    /// A definition file was restored.
    Restored,
    /// No definition file restored, yet the set exists now.
    Appeared,
}

impl fmt::Display for Provisioned {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Present => "already present",
            Self::Restored => "restored",
            Self::Appeared => "present, no file restored",
        };
        write!(f, "{s}")
    }
}

pub struct Provisioner<T = ToolRestore> {
    cfg: ProvisionCfg,
    restore: T,
    log: Logger,
}

impl Provisioner<ToolRestore> {
    pub fn new(cfg: ProvisionCfg, log: Logger) -> Self {
        let restore = ToolRestore::new(&cfg);
        Self { cfg, restore, log }
    }
}

impl<T: Restore> Provisioner<T> {
    pub fn with_restore(cfg: ProvisionCfg, restore: T, log: Logger) -> Self {
        Self { cfg, restore, log }
    }

    pub fn cfg(&self) -> &ProvisionCfg {
        &self.cfg
    }

    /// Try to restore the set `name`. Returns `true` once a candidate
    /// file restores successfully.
    pub fn provision(&self, name: &str) -> bool {
        if !is_file_name(name) {
            warn!(self.log, "set name is not a file name, not provisioning";
                "set" => name);
            return false;
        }

        for dir in &self.cfg.set_dirs {
            if !dir.is_dir() {
                debug!(self.log, "skipping set directory";
                    "dir" => %dir.display());
                continue;
            }

            let Some(paths) = self.cfg.candidates(dir, name) else {
                return false;
            };

            for path in paths {
                if !path.is_file() {
                    continue;
                }

                debug!(self.log, "restoring set"; "set" => name,
                    "file" => %path.display());
                match self.restore.restore(&path) {
                    Ok(()) => {
                        info!(self.log, "provisioned set"; "set" => name,
                            "file" => %path.display());
                        return true;
                    }

                    Err(e) => {
                        warn!(self.log, "set restore failed"; "set" => name,
                            "file" => %path.display(), "error" => %e);
                    }
                }
            }
        }

        false
    }

    /// Resolve `name`, restoring it from disk first if it does not
    /// exist.
    pub fn ensure<R: SetRegistry>(
        &self,
        resolver: &Resolver<R>,
        name: &str,
    ) -> Result<(SetRef, Provisioned), RegistryError> {
        if resolver.probe(name) {
            return Ok((resolver.resolve(name)?, Provisioned::Present));
        }

        let how = if self.provision(name) {
            Provisioned::Restored
        } else {
            warn!(self.log, "no set definition file restored"; "set" => name,
                "dirs" => ?self.cfg.set_dirs);
            Provisioned::Appeared
        };

        // Whether or not a restore worked, resolution has the final say.
        Ok((resolver.resolve(name)?, how))
    }
}
