// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Set name resolution and auto-provisioning.

use common::*;
use natmap::api::IP_SET_OP_GET_BYINDEX;
use natmap::api::IP_SET_OP_GET_BYNAME;
use natmap::api::IP_SET_OP_GET_FNAME;
use natmap::api::IP_SET_OP_VERSION;
use natmap::api::SetId;
use natmap_ctl::ErrorClass;
use natmap_ctl::provision::ProvisionError;
use natmap_ctl::provision::Provisioned;
use natmap_ctl::provision::Restore;
use natmap_ctl::provision::ToolRestore;
use natmap_ctl::registry::RegistryError;
use natmap_test_utils as common;
use nix::sys::signal::Signal;
use std::ffi::OsString;
use std::path::PathBuf;

const MEMBER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);
const PUBLIC: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);

#[test]
fn resolve_by_name_and_family() {
    let sets = MockIpSet::new();
    sets.create("other", NfProto::Ipv4);
    let id = sets.create("nat-inside", NfProto::Ipv4);
    let resolver = Resolver::new(sets.clone(), test_logger());

    assert_eq!(resolver.version().unwrap(), ipset::MOCK_PROTOCOL);

    let set = resolver.resolve("nat-inside").unwrap();
    assert_eq!(set.id, id);
    assert_eq!(set.name.as_str(), "nat-inside");
    assert_eq!(set.family, NfProto::Ipv4);
    assert_eq!(
        sets.ops(),
        vec![
            IP_SET_OP_VERSION,
            IP_SET_OP_VERSION,
            IP_SET_OP_GET_FNAME,
        ]
    );
}

#[test]
fn unspec_family_applies() {
    let sets = MockIpSet::new();
    sets.create("any-family", NfProto::Unspec);
    let resolver = Resolver::new(sets.clone(), test_logger());

    let set = resolver.resolve("any-family").unwrap();
    assert_eq!(set.family, NfProto::Unspec);
}

#[test]
fn legacy_registry_falls_back_to_name_lookup() {
    let sets = MockIpSet::new();
    let id = sets.create("nat-inside", NfProto::Ipv4);
    sets.set_legacy(true);
    let resolver = Resolver::new(sets.clone(), test_logger());

    let set = resolver.resolve("nat-inside").unwrap();
    assert_eq!(set.id, id);
    // The old protocol carries no family.
    assert_eq!(set.family, NfProto::Unspec);
    assert_eq!(
        sets.ops(),
        vec![IP_SET_OP_VERSION, IP_SET_OP_GET_FNAME, IP_SET_OP_GET_BYNAME]
    );

    let err = resolver.resolve("missing").unwrap_err();
    assert!(matches!(err, RegistryError::NotFound(ref n) if n == "missing"));
}

#[test]
fn wrong_family_is_rejected() {
    let sets = MockIpSet::new();
    sets.create("v6-only", NfProto::Ipv6);
    let resolver = Resolver::new(sets.clone(), test_logger());

    let err = resolver.resolve("v6-only").unwrap_err();
    assert!(matches!(
        err,
        RegistryError::FamilyMismatch { family: NfProto::Ipv6, .. }
    ));
    assert_eq!(err.class(), ErrorClass::Validation);
    assert_eq!(
        err.to_string(),
        "the protocol family of set v6-only is IPv6, which is not applicable"
    );

    // The same set is fine for an IPv6 resolver.
    let resolver = Resolver::new(sets, test_logger()).with_family(NfProto::Ipv6);
    assert!(resolver.resolve("v6-only").is_ok());
}

#[test]
fn missing_set() {
    let sets = MockIpSet::new();
    let resolver = Resolver::new(sets.clone(), test_logger());

    let err = resolver.resolve("missing").unwrap_err();
    assert!(matches!(err, RegistryError::NotFound(_)));
    assert_eq!(err.class(), ErrorClass::NotFound);
    assert_eq!(err.to_string(), "set missing doesn't exist");
    assert!(!resolver.probe("missing"));
}

#[test]
fn unloaded_module() {
    let sets = MockIpSet::new();
    sets.create("nat-inside", NfProto::Ipv4);
    sets.set_loaded(false);
    let resolver = Resolver::new(sets.clone(), test_logger());

    let err = resolver.resolve("nat-inside").unwrap_err();
    assert!(matches!(err, RegistryError::NotLoaded(libc::ENOPROTOOPT)));
    assert_eq!(err.class(), ErrorClass::Backend);
    assert!(!resolver.probe("nat-inside"));
}

#[test]
fn reverse_lookup() {
    let sets = MockIpSet::new();
    let id = sets.create("nat-inside", NfProto::Ipv4);
    let resolver = Resolver::new(sets.clone(), test_logger());

    assert_eq!(resolver.name_by_id(id).unwrap().as_str(), "nat-inside");
    assert_eq!(sets.ops().last(), Some(&IP_SET_OP_GET_BYINDEX));

    let missing = SetId::new(7).unwrap();
    assert!(matches!(
        resolver.name_by_id(missing),
        Err(RegistryError::NoSuchIndex(id)) if id == missing
    ));
}

fn provisioner(
    sets: &MockIpSet,
    dirs: &[PathBuf],
) -> Provisioner<MockIpSet> {
    let cfg = ProvisionCfg { set_dirs: dirs.to_vec(), ..Default::default() };
    Provisioner::with_restore(cfg, sets.clone(), test_logger())
}

#[test]
fn provision_search_order() {
    let dir = TestDir::new("order");
    let first = dir.mkdir("first");
    let second = dir.mkdir("second");
    let missing = dir.path().join("missing");

    // The bare name fails to restore, the `.set` file works, and the
    // second directory is never reached.
    let bad = dir.write("first/blk", "this is not a set file\n");
    let good = dir.write("first/blk.set", &set_file("blk", MEMBER, PUBLIC, 0));
    dir.write("second/blk", &set_file("blk", MEMBER, PUBLIC, 0));

    let sets = MockIpSet::new();
    let prov = provisioner(&sets, &[missing, first, second]);
    assert!(prov.provision("blk"));
    assert_eq!(sets.restored(), vec![bad, good]);
    assert!(sets.index_of("blk").is_some());
}

#[test]
fn provision_stops_at_first_success() {
    let dir = TestDir::new("first");
    let d = dir.mkdir("sets");
    let exact = dir.write("sets/blk", &set_file("blk", MEMBER, PUBLIC, 0));
    dir.write("sets/blk.set", &set_file("blk", MEMBER, PUBLIC, 0));

    let sets = MockIpSet::new();
    let prov = provisioner(&sets, &[d]);
    assert!(prov.provision("blk"));
    assert_eq!(sets.restored(), vec![exact]);
}

#[test]
fn provision_skips_non_files() {
    let dir = TestDir::new("nonfile");
    let d = dir.mkdir("sets");
    // A directory named after the set is not a candidate.
    dir.mkdir("sets/blk");
    dir.write("not-a-dir", "");

    let sets = MockIpSet::new();
    let prov = provisioner(&sets, &[dir.path().join("not-a-dir"), d]);
    assert!(!prov.provision("blk"));
    assert!(sets.restored().is_empty());
}

#[test]
fn provision_with_no_dirs() {
    let sets = MockIpSet::new();
    let prov = provisioner(&sets, &[]);
    assert!(!prov.provision("blk"));
    assert!(sets.restored().is_empty());
}

#[test]
fn provision_stays_in_set_dirs() {
    let dir = TestDir::new("escape");
    let d = dir.mkdir("sets");
    let outside = dir.write("evil", &set_file("evil", MEMBER, PUBLIC, 0));
    dir.write("evil.set", &set_file("evil", MEMBER, PUBLIC, 0));

    let sets = MockIpSet::new();
    let prov = provisioner(&sets, &[d]);

    let absolute = outside.to_str().unwrap();
    for name in [absolute, "../evil", "sets/../evil"] {
        assert!(!prov.provision(name), "{name}");
    }
    assert!(sets.restored().is_empty());
    assert!(sets.index_of("evil").is_none());
}

#[test]
fn ensure_reports_how_the_set_was_found() {
    let dir = TestDir::new("ensure");
    let d = dir.mkdir("sets");
    dir.write("sets/blk", &set_file("blk", MEMBER, PUBLIC, 0));

    let sets = MockIpSet::new();
    sets.create("nat-inside", NfProto::Ipv4);
    let resolver = Resolver::new(sets.clone(), test_logger());
    let prov = provisioner(&sets, &[d]);

    let (set, how) = prov.ensure(&resolver, "nat-inside").unwrap();
    assert_eq!(set.name.as_str(), "nat-inside");
    assert_eq!(how, Provisioned::Present);
    assert!(sets.restored().is_empty());

    let (set, how) = prov.ensure(&resolver, "blk").unwrap();
    assert_eq!(set.name.as_str(), "blk");
    assert_eq!(how, Provisioned::Restored);
    assert_eq!(how.to_string(), "restored");
    assert_eq!(sets.restored().len(), 1);

    let err = prov.ensure(&resolver, "missing").unwrap_err();
    assert!(matches!(err, RegistryError::NotFound(ref n) if n == "missing"));
    assert_eq!(err.class(), ErrorClass::NotFound);
}

fn shell(script: &str) -> ToolRestore {
    let cfg = ProvisionCfg {
        tool: PathBuf::from("/bin/sh"),
        tool_args: vec![OsString::from("-c"), OsString::from(script)],
        ..Default::default()
    };
    ToolRestore::new(&cfg)
}

#[test]
fn tool_restore_statuses() {
    let dir = TestDir::new("tool");
    let input = dir.write("blk", "create blk hash:ip\n");

    // The file arrives on stdin.
    shell("grep -q '^create blk' -").restore(&input).unwrap();

    assert!(matches!(
        shell("exit 3").restore(&input),
        Err(ProvisionError::Exited(3))
    ));
    assert!(matches!(
        shell("kill -9 $$").restore(&input),
        Err(ProvisionError::Signaled(Signal::SIGKILL))
    ));
    assert!(matches!(
        shell("true").restore(&dir.path().join("nope")),
        Err(ProvisionError::Open { .. })
    ));

    let cfg = ProvisionCfg {
        tool: dir.path().join("no-such-tool"),
        ..Default::default()
    };
    assert!(matches!(
        ToolRestore::new(&cfg).restore(&input),
        Err(ProvisionError::Spawn { .. })
    ));
}

#[test]
fn tool_provisioner_reports_failure() {
    let dir = TestDir::new("toolprov");
    let d = dir.mkdir("sets");
    dir.write("sets/blk", "create blk hash:ip\n");
    dir.write("sets/blk.set", "create blk hash:ip\n");

    let mut cfg = ProvisionCfg { set_dirs: vec![d], ..Default::default() };
    cfg.tool = PathBuf::from("/bin/sh");
    cfg.tool_args = vec![OsString::from("-c"), OsString::from("exit 1")];
    let prov = Provisioner::new(cfg.clone(), test_logger());
    assert!(!prov.provision("blk"));

    cfg.tool_args = vec![OsString::from("-c"), OsString::from("cat >/dev/null")];
    let prov = Provisioner::new(cfg, test_logger());
    assert!(prov.provision("blk"));
}
