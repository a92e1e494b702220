// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The NATMAP rule record.
//!
//! A rule carries two role slots: `add` (rewrite the source, used by
//! `SNATMAP`) and `del` (rewrite the destination, used by `DNATMAP`).
//! In Rust each slot is an `Option<SetSlot>`. On the wire the record
//! is the xtables `struct xt_set_info_target_v0`, where an absent slot
//! is spelled with the [`IPSET_INVALID_ID`] index.

use super::NfProto;
use super::ipset::IPSET_INVALID_ID;
use super::ipset::SetId;
use alloc::string::String;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::fmt;
use core::fmt::Display;
use core::mem::size_of;
use serde::Deserialize;
use serde::Serialize;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// The number of dimension slots in the wire flag array.
pub const IPSET_DIM_MAX: usize = 6;

/// The maximum number of direction flags a slot may carry. The last
/// wire entry is reserved and must stay zero.
pub const MAX_DIRS: usize = IPSET_DIM_MAX - 1;

/// Descriptor bit: the match is inverted.
pub const IPSET_INV_MATCH: u8 = 1 << 0;

bitflags! {
    /// One entry of the direction flag array.
    #[derive(
        Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq,
        Serialize,
    )]
    pub struct DirFlags: u32 {
        const SRC = 0x01;
        const DST = 0x02;
        const MATCH_INV = 0x04;
    }
}

impl DirFlags {
    /// The token used when rendering this entry.
    pub fn token(&self) -> &'static str {
        if self.contains(Self::SRC) { "src" } else { "dst" }
    }
}

/// The wire flag array has a non-zero entry in its reserved last slot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DimOverflow;

/// An ordered, densely packed list of direction flags.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DirFlagArray(heapless::Vec<DirFlags, MAX_DIRS>);

impl DirFlagArray {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a flag, handing it back if the array is full.
    pub fn push(&mut self, flag: DirFlags) -> Result<(), DirFlags> {
        self.0.push(flag)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.0.is_full()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DirFlags> {
        self.0.iter()
    }

    pub fn first(&self) -> Option<DirFlags> {
        self.0.first().copied()
    }

    /// Read the meaningful prefix of a wire flag array.
    pub fn from_wire(raw: &[u32; IPSET_DIM_MAX]) -> Result<Self, DimOverflow> {
        if raw[IPSET_DIM_MAX - 1] != 0 {
            return Err(DimOverflow);
        }

        let mut dirs = Self::new();
        for flag in raw[..MAX_DIRS].iter().take_while(|f| **f != 0) {
            // There is always room: we take at most MAX_DIRS entries.
            let _ = dirs.push(DirFlags::from_bits_retain(*flag));
        }
        Ok(dirs)
    }

    pub fn to_wire(&self) -> [u32; IPSET_DIM_MAX] {
        let mut raw = [0u32; IPSET_DIM_MAX];
        for (slot, flag) in raw.iter_mut().zip(self.iter()) {
            *slot = flag.bits();
        }
        raw
    }
}

impl Display for DirFlagArray {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, flag) in self.iter().enumerate() {
            let sep = if i == 0 { "" } else { "," };
            write!(f, "{sep}{}", flag.token())?;
        }
        Ok(())
    }
}

/// The legacy compatibility descriptor: the dimension count plus a
/// bitfield with [`IPSET_INV_MATCH`] in bit 0 and, for every
/// dimension `n` that matches on the source, bit `n` set.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub struct CompatDesc {
    pub dim: u8,
    pub flags: u8,
}

impl CompatDesc {
    /// Compile the descriptor for `dirs`.
    pub fn compile(dirs: &DirFlagArray) -> Self {
        let mut desc = Self::default();

        if dirs.first().is_some_and(|f| f.contains(DirFlags::MATCH_INV)) {
            desc.flags |= IPSET_INV_MATCH;
        }

        for flag in dirs.iter().take(MAX_DIRS).take_while(|f| !f.is_empty()) {
            desc.dim += 1;
            if flag.contains(DirFlags::SRC) {
                desc.flags |= 1 << desc.dim;
            }
        }

        desc
    }

    /// Does dimension `dim` (1-based) match on the source?
    pub fn is_src(&self, dim: u8) -> bool {
        dim >= 1 && usize::from(dim) <= MAX_DIRS && self.flags & (1 << dim) != 0
    }

    pub fn is_inverted(&self) -> bool {
        self.flags & IPSET_INV_MATCH != 0
    }
}

/// A populated role slot.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SetSlot {
    pub id: SetId,
    pub dirs: DirFlagArray,
    pub compat: CompatDesc,
}

impl SetSlot {
    pub fn new(id: SetId, dirs: DirFlagArray) -> Self {
        let compat = CompatDesc::compile(&dirs);
        Self { id, dirs, compat }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum SlotRole {
    /// Rewrite the source.
    Add,
    /// Rewrite the destination.
    Del,
}

impl Display for SlotRole {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Add => write!(f, "add"),
            Self::Del => write!(f, "del"),
        }
    }
}

/// A rule record with both role slots.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TargetRecord {
    pub add: Option<SetSlot>,
    pub del: Option<SetSlot>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RecordError {
    BadSize { want: usize, got: usize },
    DimOverflow(SlotRole),
}

impl Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::BadSize { want, got } => {
                write!(f, "rule record is {got} bytes, want {want}")
            }
            Self::DimOverflow(role) => {
                write!(f, "{role} slot dimension is over the limit")
            }
        }
    }
}

impl TargetRecord {
    pub fn slot(&self, role: SlotRole) -> Option<&SetSlot> {
        match role {
            SlotRole::Add => self.add.as_ref(),
            SlotRole::Del => self.del.as_ref(),
        }
    }

    pub fn slot_mut(&mut self, role: SlotRole) -> &mut Option<SetSlot> {
        match role {
            SlotRole::Add => &mut self.add,
            SlotRole::Del => &mut self.del,
        }
    }

    /// Iterate the populated slots, `add` first.
    pub fn slots(&self) -> impl Iterator<Item = (SlotRole, &SetSlot)> {
        [(SlotRole::Add, &self.add), (SlotRole::Del, &self.del)]
            .into_iter()
            .filter_map(|(role, slot)| slot.as_ref().map(|s| (role, s)))
    }

    pub fn to_wire(&self) -> TargetInfoV0 {
        TargetInfoV0 {
            add_set: XtSetInfoV0::from_slot(self.add.as_ref()),
            del_set: XtSetInfoV0::from_slot(self.del.as_ref()),
        }
    }

    /// Decode a wire record, keeping the descriptor it carries.
    pub fn from_wire(raw: &TargetInfoV0) -> Result<Self, RecordError> {
        let slot = |role, info: &XtSetInfoV0| -> Result<_, RecordError> {
            let Some(id) = info.id() else {
                return Ok(None);
            };
            let dirs =
                info.dirs().map_err(|_| RecordError::DimOverflow(role))?;
            Ok(Some(SetSlot { id, dirs, compat: info.compat() }))
        };

        Ok(Self {
            add: slot(SlotRole::Add, &raw.add_set)?,
            del: slot(SlotRole::Del, &raw.del_set)?,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_wire().as_bytes().to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RecordError> {
        Self::from_wire(&TargetInfoV0::read(bytes)?)
    }
}

/// `struct xt_set_info_v0`.
///
/// In C the flag array is a union of `__u32 flags[IPSET_DIM_MAX + 1]`
/// and `{ __u32 __flags[IPSET_DIM_MAX]; __u8 dim; __u8 flags; }`.
/// The descriptor therefore lives where `flags[IPSET_DIM_MAX]` would.
#[derive(
    Clone, Copy, Debug, Eq, FromBytes, Immutable, IntoBytes, KnownLayout,
    PartialEq,
)]
#[repr(C)]
pub struct XtSetInfoV0 {
    pub index: u16,
    _pad0: [u8; 2],
    pub flags: [u32; IPSET_DIM_MAX],
    pub compat_dim: u8,
    pub compat_flags: u8,
    _pad1: [u8; 2],
}

impl XtSetInfoV0 {
    /// A slot with no set, as the target's init hook leaves it.
    pub fn absent() -> Self {
        Self {
            index: IPSET_INVALID_ID,
            _pad0: [0; 2],
            flags: [0; IPSET_DIM_MAX],
            compat_dim: 0,
            compat_flags: 0,
            _pad1: [0; 2],
        }
    }

    pub fn from_slot(slot: Option<&SetSlot>) -> Self {
        let mut info = Self::absent();
        if let Some(slot) = slot {
            info.index = slot.id.get();
            info.flags = slot.dirs.to_wire();
            info.set_compat(slot.compat);
        }
        info
    }

    pub fn id(&self) -> Option<SetId> {
        SetId::from_wire(self.index)
    }

    pub fn dirs(&self) -> Result<DirFlagArray, DimOverflow> {
        DirFlagArray::from_wire(&self.flags)
    }

    pub fn compat(&self) -> CompatDesc {
        CompatDesc { dim: self.compat_dim, flags: self.compat_flags }
    }

    pub fn set_compat(&mut self, desc: CompatDesc) {
        self.compat_dim = desc.dim;
        self.compat_flags = desc.flags;
    }
}

impl Default for XtSetInfoV0 {
    fn default() -> Self {
        Self::absent()
    }
}

/// `struct xt_set_info_target_v0`.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Eq,
    FromBytes,
    Immutable,
    IntoBytes,
    KnownLayout,
    PartialEq,
)]
#[repr(C)]
pub struct TargetInfoV0 {
    pub add_set: XtSetInfoV0,
    pub del_set: XtSetInfoV0,
}

impl TargetInfoV0 {
    pub const SIZE: usize = size_of::<Self>();

    pub fn read(bytes: &[u8]) -> Result<Self, RecordError> {
        Self::read_from_bytes(bytes).map_err(|_| RecordError::BadSize {
            want: Self::SIZE,
            got: bytes.len(),
        })
    }

    pub fn slot(&self, role: SlotRole) -> &XtSetInfoV0 {
        match role {
            SlotRole::Add => &self.add_set,
            SlotRole::Del => &self.del_set,
        }
    }

    pub fn slot_mut(&mut self, role: SlotRole) -> &mut XtSetInfoV0 {
        match role {
            SlotRole::Add => &mut self.add_set,
            SlotRole::Del => &mut self.del_set,
        }
    }
}

const _: () = assert!(size_of::<XtSetInfoV0>() == 32);
const _: () = assert!(size_of::<TargetInfoV0>() == 64);

bitflags! {
    /// Netfilter hook mask (`1 << NF_INET_*`).
    #[derive(
        Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq,
        Serialize,
    )]
    pub struct Hooks: u32 {
        const PRE_ROUTING = 1 << 0;
        const LOCAL_IN = 1 << 1;
        const FORWARD = 1 << 2;
        const LOCAL_OUT = 1 << 3;
        const POST_ROUTING = 1 << 4;
    }
}

impl core::str::FromStr for Hooks {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "PREROUTING" | "PRE_ROUTING" => Ok(Self::PRE_ROUTING),
            "INPUT" | "LOCAL_IN" => Ok(Self::LOCAL_IN),
            "FORWARD" => Ok(Self::FORWARD),
            "OUTPUT" | "LOCAL_OUT" => Ok(Self::LOCAL_OUT),
            "POSTROUTING" | "POST_ROUTING" => Ok(Self::POST_ROUTING),
            _ => Err(format!("invalid hook: {s}")),
        }
    }
}

/// The two targets that consume a NATMAP rule record.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum TargetKind {
    Snat,
    Dnat,
}

impl TargetKind {
    pub const TABLE: &'static str = "nat";
    pub const REVISION: u8 = 0;
    pub const FAMILY: NfProto = NfProto::Ipv4;

    pub fn name(&self) -> &'static str {
        match self {
            Self::Snat => "SNATMAP",
            Self::Dnat => "DNATMAP",
        }
    }

    /// The slot this target populates and checks.
    pub fn role(&self) -> SlotRole {
        match self {
            Self::Snat => SlotRole::Add,
            Self::Dnat => SlotRole::Del,
        }
    }

    /// The hooks this target may be attached to.
    pub fn hooks(&self) -> Hooks {
        match self {
            Self::Snat => Hooks::POST_ROUTING | Hooks::LOCAL_IN,
            Self::Dnat => Hooks::PRE_ROUTING | Hooks::LOCAL_OUT,
        }
    }
}

impl core::str::FromStr for TargetKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SNATMAP" | "SNAT" => Ok(Self::Snat),
            "DNATMAP" | "DNAT" => Ok(Self::Dnat),
            _ => Err(format!("invalid target: {s}")),
        }
    }
}

impl Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
