// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Rule table tests.
//!
//! These drive installed NATMAP rules against the in-memory set
//! registry and conntrack from `natmap-test-utils`, checking both the
//! translations handed to conntrack and the references each rule
//! holds while installed.

use common::*;
use natmap::api::AddRuleReq;
use natmap::api::DirFlagArray;
use natmap::api::DirFlags;
use natmap::api::Hooks;
use natmap::api::IPSET_DIM_MAX;
use natmap::api::NatmapError;
use natmap::api::SetId;
use natmap::api::SetSlot;
use natmap::api::SlotRole;
use natmap::api::TargetInfoV0;
use natmap::api::TargetKind;
use natmap::api::TargetRecord;
use natmap_test_utils as common;
use zerocopy::IntoBytes;

const INSIDE: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);
const OUTSIDE: Ipv4Addr = Ipv4Addr::new(198, 51, 100, 7);
const PUBLIC: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);
const SERVER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 80);

struct Harness {
    sets: MockIpSet,
    nat: MockConntrack,
    log: CaptureLog,
    table: MockTable,
}

impl Harness {
    fn new() -> Self {
        let sets = MockIpSet::new();
        let nat = MockConntrack::new();
        let log = CaptureLog::default();
        let table =
            RuleTable::new(sets.clone(), nat.clone(), Box::new(log.clone()));
        Self { sets, nat, log, table }
    }
}

fn dirs(flags: &[DirFlags]) -> DirFlagArray {
    let mut dirs = DirFlagArray::new();
    for flag in flags {
        dirs.push(*flag).unwrap();
    }
    dirs
}

fn req(kind: TargetKind, record: &TargetRecord) -> AddRuleReq {
    AddRuleReq {
        kind,
        table: TargetKind::TABLE.to_string(),
        hooks: kind.hooks(),
        family: NfProto::Ipv4,
        record: record.to_bytes(),
    }
}

fn snat_record(id: SetId) -> TargetRecord {
    let mut record = TargetRecord::default();
    *record.slot_mut(SlotRole::Add) =
        Some(SetSlot::new(id, dirs(&[DirFlags::SRC])));
    record
}

fn dnat_record(id: SetId) -> TargetRecord {
    let mut record = TargetRecord::default();
    *record.slot_mut(SlotRole::Del) =
        Some(SetSlot::new(id, dirs(&[DirFlags::DST])));
    record
}

#[test]
fn snat_member_is_translated() {
    let h = Harness::new();
    let id = h.sets.create("nat-inside", NfProto::Ipv4);
    h.sets.add("nat-inside", Entry::nat(INSIDE, PUBLIC, 0));

    let rule = h.table.add_rule(&req(TargetKind::Snat, &snat_record(id))).unwrap();
    assert_eq!(h.sets.refcnt(id), 1);
    assert_eq!(h.nat.netns_refs(), 1);

    let pkt = TestPacket::new(INSIDE, OUTSIDE);
    assert_eq!(h.table.process(rule, &pkt).unwrap(), Verdict::Accept);

    let setups = h.nat.setups();
    assert_eq!(setups.len(), 1);
    assert_eq!(setups[0].pkt, pkt);
    assert_eq!(setups[0].manip, NatManip::Src);
    assert_eq!(setups[0].range, NatRange::single(PUBLIC, 0));
    assert!(!setups[0].range.port_specified());

    let dump = h.table.list_rules();
    assert_eq!(dump.len(), 1);
    assert_eq!(dump[0].id, rule);
    assert_eq!(dump[0].hits, 1);

    h.table.clear();
}

#[test]
fn non_member_continues() {
    let h = Harness::new();
    let id = h.sets.create("nat-inside", NfProto::Ipv4);
    h.sets.add("nat-inside", Entry::nat(INSIDE, PUBLIC, 0));

    let rule = h.table.add_rule(&req(TargetKind::Snat, &snat_record(id))).unwrap();

    // The set is keyed on the source address.
    let pkt = TestPacket::new(OUTSIDE, INSIDE);
    assert_eq!(h.table.process(rule, &pkt).unwrap(), Verdict::Continue);
    assert!(h.nat.setups().is_empty());
    assert_eq!(h.table.list_rules()[0].hits, 0);

    h.table.clear();
}

#[test]
fn dnat_rewrites_destination_with_port() {
    let h = Harness::new();
    let id = h.sets.create("nat-servers", NfProto::Ipv4);
    h.sets.add("nat-servers", Entry::nat(PUBLIC, SERVER, 8080));

    let rule = h.table.add_rule(&req(TargetKind::Dnat, &dnat_record(id))).unwrap();

    let pkt = TestPacket::new(OUTSIDE, PUBLIC);
    assert_eq!(h.table.process(rule, &pkt).unwrap(), Verdict::Accept);

    let setups = h.nat.setups();
    assert_eq!(setups.len(), 1);
    assert_eq!(setups[0].manip, NatManip::Dst);
    assert_eq!(setups[0].range, NatRange::single(SERVER, 8080));
    assert!(setups[0].range.port_specified());

    h.table.clear();
}

#[test]
fn conntrack_verdict_is_returned_as_is() {
    let h = Harness::new();
    let id = h.sets.create("nat-inside", NfProto::Ipv4);
    h.sets.add("nat-inside", Entry::nat(INSIDE, PUBLIC, 0));
    h.nat.set_verdict(Verdict::Drop);

    let rule = h.table.add_rule(&req(TargetKind::Snat, &snat_record(id))).unwrap();
    let pkt = TestPacket::new(INSIDE, OUTSIDE);
    assert_eq!(h.table.process(rule, &pkt).unwrap(), Verdict::Drop);
    assert_eq!(h.nat.setups().len(), 1);

    h.table.clear();
}

#[test]
fn del_rule_releases_references() {
    let h = Harness::new();
    let id = h.sets.create("nat-inside", NfProto::Ipv4);

    let rule = h.table.add_rule(&req(TargetKind::Snat, &snat_record(id))).unwrap();

    // A referenced set cannot be destroyed.
    assert!(!h.sets.destroy("nat-inside"));

    h.table.del_rule(rule).unwrap();
    assert_eq!(h.sets.refcnt(id), 0);
    assert_eq!(h.nat.netns_refs(), 0);
    assert_eq!(h.sets.puts(), vec![id]);
    assert!(h.sets.destroy("nat-inside"));

    assert_eq!(h.table.del_rule(rule), Err(NatmapError::RuleNotFound(rule)));
    assert_eq!(
        h.table.process(rule, &TestPacket::new(INSIDE, OUTSIDE)),
        Err(NatmapError::RuleNotFound(rule))
    );
}

#[test]
fn missing_set_is_rejected() {
    let h = Harness::new();
    let id = SetId::new(9).unwrap();

    let err = h
        .table
        .add_rule(&req(TargetKind::Snat, &snat_record(id)))
        .unwrap_err();
    assert_eq!(err, NatmapError::SetNotFound(9));
    assert_eq!(h.table.num_rules(), 0);
    assert_eq!(h.nat.netns_refs(), 0);
    assert_eq!(
        h.log.warnings(),
        vec!["Cannot find nat_set index 9 as target".to_string()]
    );
}

#[test]
fn failed_del_slot_unwinds_add_slot() {
    let h = Harness::new();
    let add = h.sets.create("nat-inside", NfProto::Ipv4);
    let del = h.sets.create("nat-servers", NfProto::Ipv4);

    // Fill every flag entry of the del slot, including the reserved
    // last one.
    let mut info = snat_record(add).to_wire();
    let mut raw = TargetRecord::default();
    *raw.slot_mut(SlotRole::Del) =
        Some(SetSlot::new(del, dirs(&[DirFlags::DST])));
    *info.slot_mut(SlotRole::Del) = raw.to_wire().del_set;
    info.slot_mut(SlotRole::Del).flags = [DirFlags::SRC.bits(); IPSET_DIM_MAX];

    let mut bad = req(TargetKind::Snat, &TargetRecord::default());
    bad.record = info.as_bytes().to_vec();

    let err = h.table.add_rule(&bad).unwrap_err();
    assert_eq!(err, NatmapError::DimensionOverLimit(SlotRole::Del));
    assert_eq!(h.sets.refcnt(add), 0);
    assert_eq!(h.sets.refcnt(del), 0);
    assert_eq!(h.nat.netns_refs(), 0);
    assert_eq!(h.sets.puts(), vec![del, add]);
    assert_eq!(
        h.log.warnings(),
        vec!["nat_set dimension is over the limit!".to_string()]
    );
}

#[test]
fn netns_failure_releases_set() {
    let h = Harness::new();
    let id = h.sets.create("nat-inside", NfProto::Ipv4);
    h.nat.fail_netns(Some(libc::ENOMEM));

    let err = h
        .table
        .add_rule(&req(TargetKind::Snat, &snat_record(id)))
        .unwrap_err();
    assert!(matches!(
        err,
        NatmapError::System { errno, .. } if errno == libc::ENOMEM
    ));
    assert_eq!(h.sets.refcnt(id), 0);
    assert_eq!(h.nat.netns_refs(), 0);
}

#[test]
fn attachment_is_checked() {
    let h = Harness::new();
    let id = h.sets.create("nat-inside", NfProto::Ipv4);

    let mut bad = req(TargetKind::Snat, &snat_record(id));
    bad.table = "filter".to_string();
    assert_eq!(
        h.table.add_rule(&bad),
        Err(NatmapError::BadTable("filter".to_string()))
    );

    let mut bad = req(TargetKind::Snat, &snat_record(id));
    bad.hooks = Hooks::PRE_ROUTING;
    assert!(matches!(
        h.table.add_rule(&bad),
        Err(NatmapError::BadHook { target: TargetKind::Snat, .. })
    ));

    let mut bad = req(TargetKind::Snat, &snat_record(id));
    bad.family = NfProto::Ipv6;
    assert_eq!(
        h.table.add_rule(&bad),
        Err(NatmapError::BadFamily(NfProto::Ipv6))
    );

    let mut bad = req(TargetKind::Snat, &snat_record(id));
    bad.record.truncate(TargetInfoV0::SIZE - 1);
    assert!(matches!(h.table.add_rule(&bad), Err(NatmapError::BadRecord(_))));

    // Nothing was referenced along the way.
    assert_eq!(h.sets.refcnt(id), 0);
    assert_eq!(h.nat.netns_refs(), 0);
}

#[test]
fn process_hook_stops_at_first_translation() {
    let h = Harness::new();
    let first = h.sets.create("nat-first", NfProto::Ipv4);
    let second = h.sets.create("nat-second", NfProto::Ipv4);
    h.sets.add("nat-first", Entry::nat(INSIDE, PUBLIC, 0));
    h.sets.add("nat-second", Entry::nat(INSIDE, SERVER, 0));
    h.sets.add("nat-second", Entry::nat(SERVER, PUBLIC, 0));

    let r1 = h.table.add_rule(&req(TargetKind::Snat, &snat_record(first))).unwrap();
    let r2 = h.table.add_rule(&req(TargetKind::Snat, &snat_record(second))).unwrap();
    assert!(r1 < r2);

    // Both rules match; the first installed wins.
    let pkt = TestPacket::new(INSIDE, OUTSIDE);
    assert_eq!(h.table.process_hook(Hooks::POST_ROUTING, &pkt), Verdict::Accept);
    assert_eq!(h.nat.setups()[0].range, NatRange::single(PUBLIC, 0));

    // Only the second rule matches.
    let pkt = TestPacket::new(SERVER, OUTSIDE);
    assert_eq!(h.table.process_hook(Hooks::POST_ROUTING, &pkt), Verdict::Accept);
    assert_eq!(h.nat.setups()[1].range, NatRange::single(PUBLIC, 0));

    // No rule is attached here.
    assert_eq!(
        h.table.process_hook(Hooks::PRE_ROUTING, &pkt),
        Verdict::Continue
    );

    let hits: Vec<u64> = h.table.list_rules().iter().map(|r| r.hits).collect();
    assert_eq!(hits, vec![1, 1]);

    h.table.clear();
    assert_eq!(h.table.num_rules(), 0);
    assert_eq!(h.sets.refcnt(first), 0);
    assert_eq!(h.sets.refcnt(second), 0);
    assert_eq!(h.nat.netns_refs(), 0);
}

#[test]
fn listed_record_carries_descriptor() {
    let h = Harness::new();
    let id = h.sets.create("nat-inside", NfProto::Ipv4);

    // Zero the descriptor in the request; activation compiles it.
    let mut info = snat_record(id).to_wire();
    info.add_set.compat_dim = 0;
    info.add_set.compat_flags = 0;
    let mut r = req(TargetKind::Snat, &TargetRecord::default());
    r.record = info.as_bytes().to_vec();

    h.table.add_rule(&r).unwrap();
    let dump = h.table.list_rules();
    let listed = TargetInfoV0::read(&dump[0].record).unwrap();
    assert_eq!(listed.add_set.compat_dim, 1);
    assert_eq!(listed.add_set.compat_flags, 1 << 1);
    assert_eq!(listed.del_set.id(), None);

    h.table.clear();
}
