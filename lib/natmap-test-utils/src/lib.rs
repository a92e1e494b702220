// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Common routines for integration tests.

// This type of pedantry is more trouble than it's worth here.
#![allow(dead_code)]

pub mod conntrack;
pub mod ipset;

pub use conntrack::MockConntrack;
pub use conntrack::Setup;
pub use ipset::Entry;
pub use ipset::MockIpSet;
pub use natmap::api::*;
pub use natmap::engine::Decision;
pub use natmap::engine::NatManip;
pub use natmap::engine::NatRange;
pub use natmap::engine::RangeFlags;
pub use natmap::engine::Verdict;
pub use natmap::engine::table::RuleTable;
pub use natmap::provider::LogLevel;
pub use natmap::provider::LogProvider;
pub use natmap_ctl::CmdDev;
pub use natmap_ctl::NatmapHdl;
pub use natmap_ctl::provision::ProvisionCfg;
pub use natmap_ctl::provision::Provisioner;
pub use natmap_ctl::registry::Resolver;
pub use std::net::Ipv4Addr;
pub use std::sync::Arc;

use rand::Rng;
use slog::Logger;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

/// The packet fields a NATMAP rule looks at.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TestPacket {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub sport: u16,
    pub dport: u16,
}

impl TestPacket {
    pub fn new(src: Ipv4Addr, dst: Ipv4Addr) -> Self {
        Self { src, dst, sport: 40000, dport: 443 }
    }
}

/// A logger that drops everything.
pub fn test_logger() -> Logger {
    Logger::root(slog::Discard, slog::o!())
}

/// A log provider that keeps every message.
#[derive(Clone, Debug, Default)]
pub struct CaptureLog {
    msgs: Arc<Mutex<Vec<(LogLevel, String)>>>,
}

impl CaptureLog {
    pub fn msgs(&self) -> Vec<(LogLevel, String)> {
        self.msgs.lock().unwrap().clone()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.msgs()
            .into_iter()
            .filter(|(level, _)| *level == LogLevel::Warn)
            .map(|(_, msg)| msg)
            .collect()
    }
}

impl LogProvider for CaptureLog {
    fn log(&self, level: LogLevel, msg: &str) {
        self.msgs.lock().unwrap().push((level, msg.to_string()));
    }
}

pub type MockTable = RuleTable<MockIpSet, MockConntrack>;

/// A command device that hands commands straight to a rule table's
/// dispatcher.
pub struct Loopback {
    table: MockTable,
}

impl Loopback {
    pub fn new(sets: MockIpSet, nat: MockConntrack, log: CaptureLog) -> Self {
        Self { table: RuleTable::new(sets, nat, Box::new(log)) }
    }

    pub fn table(&self) -> &MockTable {
        &self.table
    }
}

impl CmdDev for Loopback {
    fn cmd_ioctl(&self, ioctl: &mut NatmapCmdIoctl) -> Result<(), libc::c_int> {
        // Safety: the command client hands us buffers that are valid
        // for their stated lengths.
        match unsafe { natmap::engine::ioctl::dispatch(&self.table, ioctl) } {
            0 => Ok(()),
            errno => Err(errno),
        }
    }
}

/// A scratch directory, removed on drop.
#[derive(Debug)]
pub struct TestDir {
    path: PathBuf,
}

impl TestDir {
    pub fn new(tag: &str) -> Self {
        let suffix: u64 = rand::rng().random();
        let path = std::env::temp_dir().join(format!(
            "natmap-{tag}-{}-{suffix:016x}",
            std::process::id()
        ));
        std::fs::create_dir_all(&path).unwrap();
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create a subdirectory.
    pub fn mkdir(&self, rel: &str) -> PathBuf {
        let dir = self.path.join(rel);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Write a file, creating its parent directories.
    pub fn write(&self, rel: &str, contents: &str) -> PathBuf {
        let file = self.path.join(rel);
        if let Some(parent) = file.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&file, contents).unwrap();
        file
    }
}

impl Drop for TestDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

/// The `ipset save` text for a one-entry IPv4 set.
pub fn set_file(name: &str, member: Ipv4Addr, nat: Ipv4Addr, port: u16) -> String {
    format!(
        "create {name} hash:ip family inet\n\
         add {name} {member} skbmark {:#010x}/{:#x}\n",
        u32::from(nat),
        port,
    )
}
