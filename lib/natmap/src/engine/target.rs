// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The NATMAP target: rule activation, the per-packet decision, and
//! rule removal.
//!
//! A target moves through `Activating -> Active -> Removed`. In Rust
//! the transient states are not values: [`NatMapTarget::activate`]
//! either hands back an active target or an error after releasing
//! everything it acquired, and [`NatMapTarget::destroy`] consumes the
//! target.

use super::ipset::AdtOpt;
use super::ipset::IpSetOps;
use super::nat::ConntrackNat;
use super::nat::NatManip;
use super::nat::NatRange;
use super::nat::Verdict;
use crate::api::DimOverflow;
use crate::api::Hooks;
use crate::api::NatmapError;
use crate::api::NfProto;
use crate::api::SetSlot;
use crate::api::SlotRole;
use crate::api::TargetInfoV0;
use crate::api::TargetKind;
use crate::api::TargetRecord;
use crate::api::XtSetInfoV0;
use crate::provider::LogLevel;
use crate::provider::LogProvider;
use core::fmt;
use core::fmt::Display;
use core::net::Ipv4Addr;

cfg_if! {
    if #[cfg(all(not(feature = "std"), not(test)))] {
        use alloc::string::ToString;
    } else {
        use std::string::ToString;
    }
}

/// Where a rule is being attached.
#[derive(Clone, Copy, Debug)]
pub struct RuleSpec<'a> {
    pub kind: TargetKind,
    pub table: &'a str,
    pub hooks: Hooks,
    pub family: NfProto,
}

impl RuleSpec<'_> {
    /// Check the table, hooks, and family against what `kind`
    /// registers for.
    pub fn validate(&self) -> Result<(), NatmapError> {
        if self.table != TargetKind::TABLE {
            return Err(NatmapError::BadTable(self.table.to_string()));
        }

        if self.hooks.is_empty() || !self.kind.hooks().contains(self.hooks) {
            return Err(NatmapError::BadHook {
                target: self.kind,
                hooks: self.hooks,
            });
        }

        if self.family != TargetKind::FAMILY {
            return Err(NatmapError::BadFamily(self.family));
        }

        Ok(())
    }
}

/// The outcome of the per-packet decision.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Decision {
    /// Leave the packet alone and let the next rule see it.
    Continue,
    /// Ask conntrack to translate the packet's connection.
    Translate(NatRange, NatManip),
}

impl Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Continue => write!(f, "continue"),
            Self::Translate(range, manip) => write!(f, "{manip} {range}"),
        }
    }
}

/// An active NATMAP target.
///
/// Holds one set reference and one conntrack namespace reference for
/// every populated slot. Immutable once activated.
#[derive(Debug)]
pub struct NatMapTarget {
    kind: TargetKind,
    hooks: Hooks,
    family: NfProto,
    record: TargetRecord,
}

impl NatMapTarget {
    /// Validate `info` and take the references the rule needs.
    ///
    /// Slots are processed `add` first. For each populated slot the
    /// set reference is taken, the flag array checked, the legacy
    /// descriptor compiled, and a conntrack namespace reference taken.
    /// On any failure everything acquired so far is released before
    /// the error is returned.
    pub fn activate<S, C>(
        spec: &RuleSpec,
        info: &TargetInfoV0,
        sets: &S,
        nat: &C,
        log: &dyn LogProvider,
    ) -> Result<Self, NatmapError>
    where
        S: IpSetOps,
        C: ConntrackNat,
    {
        spec.validate()?;

        let mut record = TargetRecord::default();
        for role in [SlotRole::Add, SlotRole::Del] {
            let raw = info.slot(role);
            match activate_slot(role, raw, spec.family, sets, nat, log) {
                Ok(slot) => *record.slot_mut(role) = slot,
                Err(e) => {
                    release(&record, spec.family, sets, nat);
                    return Err(e);
                }
            }
        }

        Ok(Self {
            kind: spec.kind,
            hooks: spec.hooks,
            family: spec.family,
            record,
        })
    }

    /// Release every reference taken by [`Self::activate`].
    pub fn destroy<S, C>(self, sets: &S, nat: &C)
    where
        S: IpSetOps,
        C: ConntrackNat,
    {
        release(&self.record, self.family, sets, nat);
    }

    pub fn kind(&self) -> TargetKind {
        self.kind
    }

    pub fn hooks(&self) -> Hooks {
        self.hooks
    }

    pub fn family(&self) -> NfProto {
        self.family
    }

    pub fn record(&self) -> &TargetRecord {
        &self.record
    }

    /// Decide what to do with `pkt`.
    ///
    /// The `add` slot wins when populated; its match rewrites the
    /// source. Otherwise the `del` slot, whose match rewrites the
    /// destination. The matching entry's metadata is the translation
    /// target.
    pub fn decide<S: IpSetOps>(&self, sets: &S, pkt: &S::Packet) -> Decision {
        let (slot, manip) = match (&self.record.add, &self.record.del) {
            (Some(slot), _) => (slot, NatManip::Src),
            (None, Some(slot)) => (slot, NatManip::Dst),
            (None, None) => return Decision::Continue,
        };

        let mut opt = AdtOpt::new(self.family, slot.compat);
        if !sets.test(slot.id, pkt, &mut opt) {
            return Decision::Continue;
        }

        let addr = Ipv4Addr::from(opt.ext.skbmark);
        let port = (opt.ext.skbmarkmask & 0xffff) as u16;
        Decision::Translate(NatRange::single(addr, port), manip)
    }

    /// Run the target against `pkt`, returning its verdict.
    pub fn target<S, C>(&self, sets: &S, nat: &C, pkt: &S::Packet) -> Verdict
    where
        S: IpSetOps,
        C: ConntrackNat<Packet = S::Packet>,
    {
        apply(nat, pkt, self.decide(sets, pkt))
    }
}

/// Hand a decision to conntrack. A translation is attempted exactly
/// once and its verdict is returned as is.
pub fn apply<C: ConntrackNat>(
    nat: &C,
    pkt: &C::Packet,
    decision: Decision,
) -> Verdict {
    match decision {
        Decision::Continue => Verdict::Continue,
        Decision::Translate(range, manip) => nat.setup_info(pkt, &range, manip),
    }
}

fn activate_slot<S, C>(
    role: SlotRole,
    raw: &XtSetInfoV0,
    family: NfProto,
    sets: &S,
    nat: &C,
    log: &dyn LogProvider,
) -> Result<Option<SetSlot>, NatmapError>
where
    S: IpSetOps,
    C: ConntrackNat,
{
    let Some(id) = raw.id() else {
        return Ok(None);
    };

    let Some(id) = sets.get_byindex(id) else {
        log.log(
            LogLevel::Warn,
            &format!("Cannot find nat_set index {id} as target"),
        );
        return Err(NatmapError::SetNotFound(id.get()));
    };

    let dirs = match raw.dirs() {
        Ok(dirs) => dirs,
        Err(DimOverflow) => {
            log.log(LogLevel::Warn, "nat_set dimension is over the limit!");
            sets.put(id);
            return Err(NatmapError::DimensionOverLimit(role));
        }
    };

    let slot = SetSlot::new(id, dirs);

    if let Err(errno) = nat.netns_get(family) {
        log.log(
            LogLevel::Warn,
            &format!("cannot load conntrack support for proto={family}"),
        );
        sets.put(id);
        return Err(NatmapError::System {
            errno,
            msg: format!("conntrack namespace reference for {family}"),
        });
    }

    Ok(Some(slot))
}

fn release<S, C>(record: &TargetRecord, family: NfProto, sets: &S, nat: &C)
where
    S: IpSetOps,
    C: ConntrackNat,
{
    for (_, slot) in record.slots() {
        sets.put(slot.id);
        nat.netns_put(family);
    }
}
