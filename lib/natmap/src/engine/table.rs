// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The rule table: the installed NATMAP rules of one data plane.
//!
//! Packets are processed under the read lock and rules are added or
//! removed under the write lock, so a rule is never torn down while a
//! packet is still using it.

use super::ipset::IpSetOps;
use super::nat::ConntrackNat;
use super::nat::Verdict;
use super::target::Decision;
use super::target::NatMapTarget;
use super::target::RuleSpec;
use super::target::apply;
use crate::api::AddRuleReq;
use crate::api::Hooks;
use crate::api::NatmapError;
use crate::api::RuleDump;
use crate::api::RuleId;
use crate::api::TargetInfoV0;
use crate::provider::LogLevel;
use crate::provider::LogProvider;
use std::boxed::Box;
use std::collections::BTreeMap;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::vec::Vec;
use zerocopy::IntoBytes;

#[derive(Debug)]
struct InstalledRule {
    target: NatMapTarget,
    hits: AtomicU64,
}

pub struct RuleTable<S, C> {
    sets: S,
    nat: C,
    log: Box<dyn LogProvider>,
    rules: RwLock<BTreeMap<RuleId, InstalledRule>>,
    next_id: AtomicU64,
}

impl<S, C> RuleTable<S, C>
where
    S: IpSetOps,
    C: ConntrackNat<Packet = S::Packet>,
{
    pub fn new(sets: S, nat: C, log: Box<dyn LogProvider>) -> Self {
        Self {
            sets,
            nat,
            log,
            rules: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn sets(&self) -> &S {
        &self.sets
    }

    pub fn nat(&self) -> &C {
        &self.nat
    }

    /// Activate and install the rule described by `req`.
    pub fn add_rule(&self, req: &AddRuleReq) -> Result<RuleId, NatmapError> {
        let info = TargetInfoV0::read(&req.record)
            .map_err(|e| NatmapError::BadRecord(e.to_string()))?;
        let spec = RuleSpec {
            kind: req.kind,
            table: &req.table,
            hooks: req.hooks,
            family: req.family,
        };

        let target = NatMapTarget::activate(
            &spec,
            &info,
            &self.sets,
            &self.nat,
            &*self.log,
        )?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        rules.insert(id, InstalledRule { target, hits: AtomicU64::new(0) });
        self.log.log(
            LogLevel::Note,
            &format!("installed {} rule {id}", req.kind),
        );
        Ok(id)
    }

    /// Uninstall rule `id` and release its references.
    pub fn del_rule(&self, id: RuleId) -> Result<(), NatmapError> {
        let rule = self
            .rules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .ok_or(NatmapError::RuleNotFound(id))?;

        rule.target.destroy(&self.sets, &self.nat);
        Ok(())
    }

    pub fn list_rules(&self) -> Vec<RuleDump> {
        let rules = self.rules.read().unwrap_or_else(PoisonError::into_inner);
        rules
            .iter()
            .map(|(id, rule)| RuleDump {
                id: *id,
                kind: rule.target.kind(),
                hooks: rule.target.hooks(),
                family: rule.target.family(),
                hits: rule.hits.load(Ordering::Relaxed),
                record: rule.target.record().to_wire().as_bytes().to_vec(),
            })
            .collect()
    }

    /// Run `pkt` through rule `id`.
    pub fn process(
        &self,
        id: RuleId,
        pkt: &S::Packet,
    ) -> Result<Verdict, NatmapError> {
        let rules = self.rules.read().unwrap_or_else(PoisonError::into_inner);
        let rule = rules.get(&id).ok_or(NatmapError::RuleNotFound(id))?;

        let decision = rule.target.decide(&self.sets, pkt);
        if let Decision::Translate(..) = decision {
            rule.hits.fetch_add(1, Ordering::Relaxed);
        }
        Ok(apply(&self.nat, pkt, decision))
    }

    /// Run `pkt` through every rule attached to `hook`, in rule order,
    /// stopping at the first verdict other than `Continue`.
    pub fn process_hook(&self, hook: Hooks, pkt: &S::Packet) -> Verdict {
        let rules = self.rules.read().unwrap_or_else(PoisonError::into_inner);
        for rule in rules.values() {
            if !rule.target.hooks().contains(hook) {
                continue;
            }

            let decision = rule.target.decide(&self.sets, pkt);
            if let Decision::Translate(..) = decision {
                rule.hits.fetch_add(1, Ordering::Relaxed);
            }

            match apply(&self.nat, pkt, decision) {
                Verdict::Continue => continue,
                verdict => return verdict,
            }
        }

        Verdict::Continue
    }

    /// Remove every rule, releasing their references.
    pub fn clear(&self) {
        let rules = core::mem::take(
            &mut *self.rules.write().unwrap_or_else(PoisonError::into_inner),
        );
        for (_, rule) in rules {
            rule.target.destroy(&self.sets, &self.nat);
        }
    }

    #[cfg(any(feature = "test-help", test))]
    pub fn num_rules(&self) -> usize {
        self.rules.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl<S, C> Drop for RuleTable<S, C> {
    fn drop(&mut self) {
        let rules = self.rules.get_mut().unwrap_or_else(PoisonError::into_inner);
        if !rules.is_empty() {
            self.log.log(
                LogLevel::Warn,
                &format!("rule table dropped with {} rules", rules.len()),
            );
        }
    }
}
