// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

use super::API_VERSION;
use super::NfProto;
use super::xt::Hooks;
use super::xt::SlotRole;
use super::xt::TargetKind;
use alloc::string::String;
use alloc::string::ToString;
use alloc::vec::Vec;
use core::fmt::Debug;
use libc::c_int;
use libc::size_t;
use serde::Deserialize;
use serde::Serialize;

pub const NATMAP_IOC: u32 = 0x6e6d_0000;
pub const NATMAP_IOC_CMD: i32 = NATMAP_IOC as i32 | 0x01;

/// A rule's identity within the data plane's rule table.
pub type RuleId = u64;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(C)]
pub enum NatmapCmd {
    AddRule = 1,   // validate and install a rule record
    DelRule = 2,   // tear down a rule, releasing its set references
    ListRules = 3, // dump the installed rules
}

/// Indicates that a command response has been written to the response
/// buffer (`resp_bytes`).
pub const NATMAP_CMD_RESP_COPY_OUT: u64 = 0x1;

/// The `ioctl(2)` argument passed when sending a `NatmapCmd`.
///
/// The command's actual request/response data is serialized by
/// postcard into the caller supplied `req_bytes`/`resp_bytes`.
#[derive(Debug)]
#[repr(C)]
pub struct NatmapCmdIoctl {
    pub api_version: u64,
    pub cmd: NatmapCmd,
    pub flags: u64,
    pub reserved1: u64,
    pub req_bytes: *const u8,
    pub req_len: size_t,
    pub resp_bytes: *mut u8,
    pub resp_len: size_t,
    pub resp_len_actual: size_t,
}

impl NatmapCmdIoctl {
    pub fn cmd_err_resp(&self) -> Option<NatmapError> {
        if self.has_cmd_resp() {
            // Safety: We know the resp_bytes point to a Vec and that
            // resp_len_actual is within range.
            let resp = unsafe {
                core::slice::from_raw_parts(
                    self.resp_bytes,
                    self.resp_len_actual,
                )
            };

            match postcard::from_bytes(resp) {
                Ok(cmd_err) => Some(cmd_err),
                Err(deser_err) => {
                    Some(NatmapError::DeserCmdErr(deser_err.to_string()))
                }
            }
        } else {
            None
        }
    }

    fn has_cmd_resp(&self) -> bool {
        (self.flags & NATMAP_CMD_RESP_COPY_OUT) != 0
    }

    /// Is this the expected API version?
    ///
    /// NOTE: This function is compiled into both the control plane
    /// and the data plane, so it returns `false` whenever the two
    /// disagree on `API_VERSION`.
    pub fn check_version(&self) -> bool {
        self.api_version == API_VERSION
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum NatmapError {
    BadApiVersion {
        user: u64,
        kernel: u64,
    },
    BadFamily(NfProto),
    BadHook {
        target: TargetKind,
        hooks: Hooks,
    },
    BadRecord(String),
    BadTable(String),
    CopyinReq,
    DeserCmdErr(String),
    DeserCmdReq(String),

    /// A slot's direction flag array uses its reserved last entry.
    DimensionOverLimit(SlotRole),

    /// The `NatmapCmdIoctl` has `req_len == 0` but the specified `cmd`
    /// expects a request body.
    NoRequestBody,

    RuleNotFound(RuleId),
    SerCmdErr(String),
    SerCmdResp(String),

    /// The set index named by a slot is not registered.
    SetNotFound(u16),

    System {
        errno: c_int,
        msg: String,
    },
}

impl NatmapError {
    /// Convert to an errno value.
    ///
    /// NOTE: `ENOBUFS` is reserved for a response that does not fit
    /// the caller's buffer, which `run_cmd_ioctl()` answers by
    /// retrying with a larger one. No command error may use it.
    pub fn to_errno(&self) -> c_int {
        use libc::*;

        match self {
            Self::BadApiVersion { .. } => EPROTO,
            Self::BadFamily(_) => EINVAL,
            Self::BadHook { .. } => EINVAL,
            Self::BadRecord(_) => EINVAL,
            Self::BadTable(_) => EINVAL,
            Self::CopyinReq => EFAULT,
            Self::DeserCmdErr(_) => ENOMSG,
            Self::DeserCmdReq(_) => ENOMSG,
            Self::DimensionOverLimit(_) => ERANGE,
            Self::NoRequestBody => EINVAL,
            Self::RuleNotFound(_) => ENOENT,
            Self::SerCmdErr(_) => ENOMSG,
            Self::SerCmdResp(_) => ENOMSG,
            Self::SetNotFound(_) => ENOENT,
            Self::System { errno, .. } => *errno,
        }
    }
}

/// A marker trait indicating a success response type that is returned
/// from a command and may be passed across the ioctl/API boundary.
pub trait CmdOk: Debug + Serialize {}

impl CmdOk for () {}

/// Indicates no meaningful response value on success.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct NoResp {
    pub unused: u64,
}

impl CmdOk for NoResp {}

/// Install a rule built around an encoded rule record.
#[derive(Debug, Deserialize, Serialize)]
pub struct AddRuleReq {
    pub kind: TargetKind,
    /// The table the rule is attached to. Must be `nat`.
    pub table: String,
    /// The hooks the rule is attached to.
    pub hooks: Hooks,
    pub family: NfProto,
    /// The 64-byte `xt_set_info_target_v0` record.
    pub record: Vec<u8>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AddRuleResp {
    pub id: RuleId,
}

impl CmdOk for AddRuleResp {}

#[derive(Debug, Deserialize, Serialize)]
pub struct DelRuleReq {
    pub id: RuleId,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RuleDump {
    pub id: RuleId,
    pub kind: TargetKind,
    pub hooks: Hooks,
    pub family: NfProto,
    /// The number of packets this rule has translated.
    pub hits: u64,
    /// The record as activated, including the compiled descriptors.
    pub record: Vec<u8>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ListRulesResp {
    pub rules: Vec<RuleDump>,
}

impl CmdOk for ListRulesResp {}
