// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! An in-memory set registry.
//!
//! [`MockIpSet`] answers the `SO_IP_SET` byte protocol the way the
//! kernel does, serves the data-plane [`IpSetOps`] API with reference
//! counts, and can "restore" sets from `ipset save` style files.

use crate::TestPacket;
use natmap::api::IP_SET_OP_GET_BYINDEX;
use natmap::api::IP_SET_OP_GET_BYNAME;
use natmap::api::IP_SET_OP_GET_FNAME;
use natmap::api::IP_SET_OP_VERSION;
use natmap::api::IPSET_INVALID_ID;
use natmap::api::IPSET_PROTOCOL_MIN;
use natmap::api::IpSetReqGetSet;
use natmap::api::IpSetReqGetSetFamily;
use natmap::api::IpSetReqVersion;
use natmap::api::NfProto;
use natmap::api::SetId;
use natmap::api::SetName;
use natmap::engine::AdtOpt;
use natmap::engine::IpSetOps;
use natmap_ctl::provision::ProvisionError;
use natmap_ctl::provision::Restore;
use natmap_ctl::registry::SetRegistry;
use std::net::Ipv4Addr;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

/// The protocol version the mock registry reports.
pub const MOCK_PROTOCOL: u32 = 7;

/// One member of a set, with the translation target it carries.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Entry {
    pub addr: Ipv4Addr,
    pub skbmark: u32,
    pub skbmarkmask: u32,
}

impl Entry {
    /// A member whose matches translate to `nat_addr:nat_port`.
    pub fn nat(addr: Ipv4Addr, nat_addr: Ipv4Addr, nat_port: u16) -> Self {
        Self {
            addr,
            skbmark: u32::from(nat_addr),
            skbmarkmask: u32::from(nat_port),
        }
    }
}

#[derive(Clone, Debug)]
pub struct MockSet {
    pub name: String,
    pub family: NfProto,
    pub entries: Vec<Entry>,
    pub refcnt: u32,
}

#[derive(Debug)]
struct State {
    // The set at index `i` lives in `sets[i]`.
    sets: Vec<Option<MockSet>>,
    loaded: bool,
    legacy: bool,
    ops: Vec<u32>,
    restored: Vec<PathBuf>,
    puts: Vec<SetId>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            sets: Vec::new(),
            loaded: true,
            legacy: false,
            ops: Vec::new(),
            restored: Vec::new(),
            puts: Vec::new(),
        }
    }
}

impl State {
    fn find(&self, name: &str) -> Option<usize> {
        self.sets
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| s.name == name))
    }

    fn set(&self, id: SetId) -> Option<&MockSet> {
        self.sets.get(usize::from(id.get())).and_then(|s| s.as_ref())
    }

    fn set_mut(&mut self, id: SetId) -> Option<&mut MockSet> {
        self.sets.get_mut(usize::from(id.get())).and_then(|s| s.as_mut())
    }

    fn create(&mut self, name: &str, family: NfProto) -> Option<SetId> {
        if self.find(name).is_some() {
            return None;
        }

        let set = MockSet {
            name: name.to_string(),
            family,
            entries: Vec::new(),
            refcnt: 0,
        };

        // Reuse the first free index, as the kernel does.
        let idx = match self.sets.iter().position(|s| s.is_none()) {
            Some(idx) => {
                self.sets[idx] = Some(set);
                idx
            }
            None => {
                self.sets.push(set.into());
                self.sets.len() - 1
            }
        };
        SetId::new(idx as u16)
    }

    fn add(&mut self, name: &str, entry: Entry) -> bool {
        let Some(idx) = self.find(name) else {
            return false;
        };
        if let Some(set) = self.sets[idx].as_mut() {
            set.entries.push(entry);
        }
        true
    }
}

/// A shared handle on an in-memory registry. Clones see the same
/// sets.
#[derive(Clone, Debug, Default)]
pub struct MockIpSet {
    state: Arc<Mutex<State>>,
}

impl MockIpSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Create an empty set, returning its index.
    pub fn create(&self, name: &str, family: NfProto) -> SetId {
        self.lock().create(name, family).expect("set already exists")
    }

    pub fn add(&self, name: &str, entry: Entry) {
        assert!(self.lock().add(name, entry), "no set {name}");
    }

    /// Destroy a set. Fails while the set is referenced.
    pub fn destroy(&self, name: &str) -> bool {
        let mut state = self.lock();
        let Some(idx) = state.find(name) else {
            return false;
        };
        if state.sets[idx].as_ref().is_some_and(|s| s.refcnt > 0) {
            return false;
        }
        state.sets[idx] = None;
        true
    }

    pub fn index_of(&self, name: &str) -> Option<SetId> {
        self.lock().find(name).and_then(|idx| SetId::new(idx as u16))
    }

    pub fn refcnt(&self, id: SetId) -> u32 {
        self.lock().set(id).map(|s| s.refcnt).unwrap_or(0)
    }

    /// Every set index released, in order.
    pub fn puts(&self) -> Vec<SetId> {
        self.lock().puts.clone()
    }

    /// Pretend the `xt_set` module is not loaded.
    pub fn set_loaded(&self, loaded: bool) {
        self.lock().loaded = loaded;
    }

    /// Behave like a registry that predates `IP_SET_OP_GET_FNAME`.
    pub fn set_legacy(&self, legacy: bool) {
        self.lock().legacy = legacy;
    }

    /// The op codes of every control request seen, in order.
    pub fn ops(&self) -> Vec<u32> {
        self.lock().ops.clone()
    }

    /// The files restored, in order.
    pub fn restored(&self) -> Vec<PathBuf> {
        self.lock().restored.clone()
    }
}

fn version_ok(version: u32) -> Result<(), libc::c_int> {
    if version < IPSET_PROTOCOL_MIN {
        return Err(libc::EPROTO);
    }
    Ok(())
}

impl SetRegistry for MockIpSet {
    fn getsockopt(&self, buf: &mut [u8]) -> Result<usize, libc::c_int> {
        let mut state = self.lock();
        if !state.loaded {
            return Err(libc::ENOPROTOOPT);
        }

        if buf.len() < 4 {
            return Err(libc::EINVAL);
        }
        let op = u32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]);
        state.ops.push(op);

        match op {
            IP_SET_OP_VERSION => {
                let mut req = IpSetReqVersion::read_from_bytes(buf)
                    .map_err(|_| libc::EINVAL)?;
                req.version = MOCK_PROTOCOL;
                buf.copy_from_slice(req.as_bytes());
                Ok(buf.len())
            }

            IP_SET_OP_GET_FNAME if state.legacy => Err(libc::EBADMSG),

            IP_SET_OP_GET_FNAME => {
                let mut req = IpSetReqGetSetFamily::read_from_bytes(buf)
                    .map_err(|_| libc::EINVAL)?;
                version_ok(req.version)?;

                let found = SetName::from_wire(req.set.name_bytes())
                    .ok()
                    .and_then(|name| state.find(name.as_str()));
                match found {
                    Some(idx) => {
                        req.set.set_index(idx as u16);
                        req.family = state.sets[idx]
                            .as_ref()
                            .map(|s| u32::from(s.family))
                            .unwrap_or_default();
                    }
                    None => req.set.set_index(IPSET_INVALID_ID),
                }

                buf.copy_from_slice(req.as_bytes());
                Ok(buf.len())
            }

            IP_SET_OP_GET_BYNAME => {
                let mut req = IpSetReqGetSet::read_from_bytes(buf)
                    .map_err(|_| libc::EINVAL)?;
                version_ok(req.version)?;

                let found = SetName::from_wire(req.set.name_bytes())
                    .ok()
                    .and_then(|name| state.find(name.as_str()));
                req.set.set_index(
                    found.map(|idx| idx as u16).unwrap_or(IPSET_INVALID_ID),
                );

                buf.copy_from_slice(req.as_bytes());
                Ok(buf.len())
            }

            IP_SET_OP_GET_BYINDEX => {
                let mut req = IpSetReqGetSet::read_from_bytes(buf)
                    .map_err(|_| libc::EINVAL)?;
                version_ok(req.version)?;

                let name = SetId::new(req.set.index())
                    .and_then(|id| state.set(id))
                    .and_then(|s| SetName::new(&s.name).ok());
                req.set.set_name(name.as_ref());

                buf.copy_from_slice(req.as_bytes());
                Ok(buf.len())
            }

            _ => Err(libc::EBADMSG),
        }
    }
}

impl IpSetOps for MockIpSet {
    type Packet = TestPacket;

    fn get_byindex(&self, id: SetId) -> Option<SetId> {
        let mut state = self.lock();
        let set = state.set_mut(id)?;
        set.refcnt += 1;
        Some(id)
    }

    fn put(&self, id: SetId) {
        let mut state = self.lock();
        state.puts.push(id);
        if let Some(set) = state.set_mut(id) {
            set.refcnt = set.refcnt.saturating_sub(1);
        }
    }

    fn test(&self, id: SetId, pkt: &TestPacket, opt: &mut AdtOpt) -> bool {
        let state = self.lock();
        let Some(set) = state.set(id) else {
            return false;
        };

        if !set.family.applies_to(opt.family) || opt.dim == 0 {
            return false;
        }

        // Single dimension sets: the descriptor says which address.
        let addr = if opt.desc().is_src(1) { pkt.src } else { pkt.dst };
        match set.entries.iter().find(|e| e.addr == addr) {
            Some(e) => {
                opt.ext.skbmark = e.skbmark;
                opt.ext.skbmarkmask = e.skbmarkmask;
                true
            }
            None => false,
        }
    }
}

fn parse_num(s: &str) -> Option<u32> {
    match s.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

// Parse one `add NAME ADDR [skbmark MARK[/MASK]]` line.
fn parse_add(tokens: &[&str]) -> Option<(String, Entry)> {
    let (name, addr, rest) = match tokens {
        [name, addr, rest @ ..] => (*name, addr.parse().ok()?, rest),
        _ => return None,
    };

    let mut entry = Entry { addr, skbmark: 0, skbmarkmask: 0 };
    match rest {
        [] => {}
        ["skbmark", val] => {
            let (mark, mask) = val.split_once('/').unwrap_or((*val, "0"));
            entry.skbmark = parse_num(mark)?;
            entry.skbmarkmask = parse_num(mask)?;
        }
        _ => return None,
    }

    Some((name.to_string(), entry))
}

impl Restore for MockIpSet {
    /// Restore `ipset save` style input:
    ///
    /// ```text
    /// create NAME hash:ip [family inet|inet6]
    /// add NAME ADDR [skbmark MARK/MASK]
    /// ```
    ///
    /// Any line it does not understand fails the whole restore, like
    /// `ipset restore` exiting with status 1.
    fn restore(&self, path: &Path) -> Result<(), ProvisionError> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            ProvisionError::Open { path: path.to_path_buf(), err }
        })?;

        let mut state = self.lock();
        state.restored.push(path.to_path_buf());

        for line in text.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let tokens: Vec<&str> = line.split_whitespace().collect();
            let ok = match tokens.as_slice() {
                ["create", name, _kind] => {
                    state.create(name, NfProto::Ipv4).is_some()
                }
                ["create", name, _kind, "family", fam] => {
                    match fam.parse::<NfProto>() {
                        Ok(family) => state.create(name, family).is_some(),
                        Err(_) => false,
                    }
                }
                ["add", rest @ ..] => match parse_add(rest) {
                    Some((name, entry)) => state.add(&name, entry),
                    None => false,
                },
                _ => false,
            };

            if !ok {
                return Err(ProvisionError::Exited(1));
            }
        }

        Ok(())
    }
}
