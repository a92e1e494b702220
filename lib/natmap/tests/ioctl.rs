// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Command dispatch tests, driving `dispatch` with hand-built ioctl
//! arguments.

use common::*;
use natmap::api::API_VERSION;
use natmap::api::AddRuleReq;
use natmap::api::AddRuleResp;
use natmap::api::DirFlagArray;
use natmap::api::DirFlags;
use natmap::api::ListRulesResp;
use natmap::api::NATMAP_CMD_RESP_COPY_OUT;
use natmap::api::NatmapCmd;
use natmap::api::NatmapCmdIoctl;
use natmap::api::NatmapError;
use natmap::api::SetSlot;
use natmap::api::SlotRole;
use natmap::api::TargetKind;
use natmap::api::TargetRecord;
use natmap::engine::ioctl::dispatch;
use natmap_test_utils as common;

struct Call {
    errno: libc::c_int,
    ioctl: NatmapCmdIoctl,
    resp: Vec<u8>,
}

impl Call {
    fn copied_out(&self) -> bool {
        self.ioctl.flags & NATMAP_CMD_RESP_COPY_OUT != 0
    }

    fn resp<T: serde::de::DeserializeOwned>(&self) -> T {
        postcard::from_bytes(&self.resp[..self.ioctl.resp_len_actual]).unwrap()
    }
}

fn call(
    table: &MockTable,
    api_version: u64,
    cmd: NatmapCmd,
    req: Option<&[u8]>,
    resp_len: usize,
) -> Call {
    let mut resp = vec![0u8; resp_len];
    let (req_bytes, req_len) = match req {
        Some(req) => (req.as_ptr(), req.len()),
        None => (core::ptr::null(), 0),
    };

    let mut ioctl = NatmapCmdIoctl {
        api_version,
        cmd,
        flags: 0,
        reserved1: 0,
        req_bytes,
        req_len,
        resp_bytes: resp.as_mut_ptr(),
        resp_len: resp.len(),
        resp_len_actual: 0,
    };

    let errno = unsafe { dispatch(table, &mut ioctl) };
    Call { errno, ioctl, resp }
}

fn table() -> (MockIpSet, MockTable) {
    let sets = MockIpSet::new();
    let table = RuleTable::new(
        sets.clone(),
        MockConntrack::new(),
        Box::new(CaptureLog::default()),
    );
    (sets, table)
}

fn add_req(sets: &MockIpSet) -> Vec<u8> {
    let id = sets.create("nat-inside", NfProto::Ipv4);
    let mut dirs = DirFlagArray::new();
    dirs.push(DirFlags::SRC).unwrap();

    let mut record = TargetRecord::default();
    *record.slot_mut(SlotRole::Add) = Some(SetSlot::new(id, dirs));

    let req = AddRuleReq {
        kind: TargetKind::Snat,
        table: TargetKind::TABLE.to_string(),
        hooks: TargetKind::Snat.hooks(),
        family: NfProto::Ipv4,
        record: record.to_bytes(),
    };
    postcard::to_allocvec(&req).unwrap()
}

#[test]
fn version_mismatch_is_refused() {
    let (sets, table) = table();
    let req = add_req(&sets);

    let res = call(&table, API_VERSION + 1, NatmapCmd::AddRule, Some(&req), 1024);
    assert_eq!(res.errno, libc::EPROTO);
    assert!(res.copied_out());
    assert_eq!(
        res.ioctl.cmd_err_resp(),
        Some(NatmapError::BadApiVersion { user: API_VERSION + 1, kernel: API_VERSION })
    );
    assert_eq!(table.num_rules(), 0);
}

#[test]
fn add_then_list() {
    let (sets, table) = table();
    let req = add_req(&sets);

    let res = call(&table, API_VERSION, NatmapCmd::AddRule, Some(&req), 1024);
    assert_eq!(res.errno, 0);
    assert!(res.copied_out());
    let id = res.resp::<AddRuleResp>().id;

    let res = call(&table, API_VERSION, NatmapCmd::ListRules, None, 1024);
    assert_eq!(res.errno, 0);
    let list: ListRulesResp = res.resp();
    assert_eq!(list.rules.len(), 1);
    assert_eq!(list.rules[0].id, id);
    assert_eq!(list.rules[0].kind, TargetKind::Snat);

    table.clear();
}

#[test]
fn small_response_buffer() {
    let (sets, table) = table();
    let req = add_req(&sets);
    let res = call(&table, API_VERSION, NatmapCmd::AddRule, Some(&req), 1024);
    assert_eq!(res.errno, 0);

    let res = call(&table, API_VERSION, NatmapCmd::ListRules, None, 4);
    assert_eq!(res.errno, libc::ENOBUFS);
    assert!(!res.copied_out());
    assert!(res.ioctl.resp_len_actual > 4);

    table.clear();
}

#[test]
fn add_without_room_for_the_id_is_undone() {
    let (sets, table) = table();
    let req = add_req(&sets);
    let id = sets.index_of("nat-inside").unwrap();

    let res = call(&table, API_VERSION, NatmapCmd::AddRule, Some(&req), 0);
    assert_eq!(res.errno, libc::ENOBUFS);
    assert!(!res.copied_out());
    assert_eq!(table.num_rules(), 0);
    assert_eq!(sets.refcnt(id), 0);
    assert_eq!(table.nat().netns_refs(), 0);

    // Resending with a larger buffer leaves exactly one rule.
    let len = res.ioctl.resp_len_actual;
    let res = call(&table, API_VERSION, NatmapCmd::AddRule, Some(&req), len);
    assert_eq!(res.errno, 0);
    assert_eq!(table.num_rules(), 1);
    assert_eq!(sets.refcnt(id), 1);

    table.clear();
}

#[test]
fn request_body_required() {
    let (_sets, table) = table();

    let res = call(&table, API_VERSION, NatmapCmd::DelRule, None, 1024);
    assert_eq!(res.errno, libc::EINVAL);
    assert_eq!(res.ioctl.cmd_err_resp(), Some(NatmapError::NoRequestBody));
}

#[test]
fn garbage_request() {
    let (_sets, table) = table();

    let res = call(&table, API_VERSION, NatmapCmd::AddRule, Some(&[0xff]), 1024);
    assert_eq!(res.errno, libc::ENOMSG);
    assert!(matches!(
        res.ioctl.cmd_err_resp(),
        Some(NatmapError::DeserCmdReq(_))
    ));
}

#[test]
fn command_errors_carry_errno() {
    let (_sets, table) = table();
    let req = postcard::to_allocvec(&natmap::api::DelRuleReq { id: 42 }).unwrap();

    let res = call(&table, API_VERSION, NatmapCmd::DelRule, Some(&req), 1024);
    assert_eq!(res.errno, libc::ENOENT);
    assert_eq!(res.ioctl.cmd_err_resp(), Some(NatmapError::RuleNotFound(42)));
}
