// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The command interface.
//!
//! The data-plane half of `NatmapCmdIoctl`: check the API version,
//! deserialize the request, run the command against a [`RuleTable`],
//! and serialize the response back into the caller's buffer.

use super::ipset::IpSetOps;
use super::nat::ConntrackNat;
use super::table::RuleTable;
use crate::api::API_VERSION;
use crate::api::AddRuleReq;
use crate::api::AddRuleResp;
use crate::api::CmdOk;
use crate::api::DelRuleReq;
use crate::api::ListRulesResp;
use crate::api::NATMAP_CMD_RESP_COPY_OUT;
use crate::api::NatmapCmd;
use crate::api::NatmapCmdIoctl;
use crate::api::NatmapError;
use crate::api::NoResp;
use core::fmt::Debug;
use libc::c_int;
use serde::de::DeserializeOwned;

/// An envelope for dealing with a `NatmapCmdIoctl`. It contains all
/// information needed to deserialize the caller's request and
/// serialize the response.
#[derive(Debug)]
pub struct IoctlEnvelope<'a> {
    ioctl: &'a mut NatmapCmdIoctl,
}

impl<'a> IoctlEnvelope<'a> {
    pub fn ioctl_cmd(&self) -> NatmapCmd {
        self.ioctl.cmd
    }

    /// Wrap `ioctl`, rejecting it if the caller was built against a
    /// different API version.
    ///
    /// # Safety
    ///
    /// The request and response pointers in `ioctl` must be valid for
    /// their stated lengths.
    pub unsafe fn wrap(ioctl: &'a mut NatmapCmdIoctl) -> Result<Self, c_int> {
        if !ioctl.check_version() {
            let badver = NatmapError::BadApiVersion {
                user: ioctl.api_version,
                kernel: API_VERSION,
            };

            let _ = Self::copy_out_resp_i::<()>(ioctl, &Err(badver));
            return Err(libc::EPROTO);
        }

        Ok(Self { ioctl })
    }

    /// Given `self`, return the deserialized request.
    pub fn copy_in_req<T: DeserializeOwned>(
        &mut self,
    ) -> Result<T, NatmapError> {
        if self.ioctl.req_len == 0 {
            return Err(NatmapError::NoRequestBody);
        }

        if self.ioctl.req_bytes.is_null() {
            let _ = self.copy_out_resp::<()>(&Err(NatmapError::CopyinReq));
            return Err(NatmapError::CopyinReq);
        }

        // Safety: `wrap` requires `req_bytes` to be valid for
        // `req_len` bytes.
        let bytes = unsafe {
            core::slice::from_raw_parts(self.ioctl.req_bytes, self.ioctl.req_len)
        };

        postcard::from_bytes(bytes)
            .map_err(|e| NatmapError::DeserCmdReq(e.to_string()))
    }

    fn copy_out_resp_i<T>(
        ioctl: &mut NatmapCmdIoctl,
        resp: &Result<T, NatmapError>,
    ) -> c_int
    where
        T: CmdOk,
    {
        let ser_result = match resp {
            Ok(v) => postcard::to_allocvec(v)
                .map_err(|e| NatmapError::SerCmdResp(e.to_string())),

            Err(e) => postcard::to_allocvec(e)
                .map_err(|e| NatmapError::SerCmdErr(e.to_string())),
        };

        // We failed to serialize the response, communicate this with
        // ENOMSG.
        let Ok(vec) = ser_result else {
            return libc::ENOMSG;
        };

        ioctl.resp_len_actual = vec.len();
        if vec.len() > ioctl.resp_len {
            return libc::ENOBUFS;
        }

        if ioctl.resp_bytes.is_null() {
            return libc::EFAULT;
        }

        // Safety: `wrap` requires `resp_bytes` to be valid for
        // `resp_len` bytes, and we just checked that `vec` fits.
        unsafe {
            core::ptr::copy_nonoverlapping(
                vec.as_ptr(),
                ioctl.resp_bytes,
                vec.len(),
            );
        }

        // We successfully copied out a response. If the response is a
        // command error, set the errno based on the type of error.
        ioctl.flags |= NATMAP_CMD_RESP_COPY_OUT;
        match resp {
            Ok(_) => 0,
            Err(err) => err.to_errno(),
        }
    }

    /// Serialize `val` into the caller's response buffer, returning
    /// the errno for the ioctl.
    pub fn copy_out_resp<T>(&mut self, val: &Result<T, NatmapError>) -> c_int
    where
        T: CmdOk,
    {
        Self::copy_out_resp_i(self.ioctl, val)
    }
}

fn hdlr_resp<T>(env: &mut IoctlEnvelope, resp: Result<T, NatmapError>) -> c_int
where
    T: CmdOk + Debug,
{
    env.copy_out_resp(&resp)
}

fn add_rule_hdlr<S, C>(
    env: &mut IoctlEnvelope,
    table: &RuleTable<S, C>,
) -> Result<AddRuleResp, NatmapError>
where
    S: IpSetOps,
    C: ConntrackNat<Packet = S::Packet>,
{
    let req: AddRuleReq = env.copy_in_req()?;
    let id = table.add_rule(&req)?;
    Ok(AddRuleResp { id })
}

fn del_rule_hdlr<S, C>(
    env: &mut IoctlEnvelope,
    table: &RuleTable<S, C>,
) -> Result<NoResp, NatmapError>
where
    S: IpSetOps,
    C: ConntrackNat<Packet = S::Packet>,
{
    let req: DelRuleReq = env.copy_in_req()?;
    table.del_rule(req.id)?;
    Ok(NoResp::default())
}

fn list_rules_hdlr<S, C>(
    table: &RuleTable<S, C>,
) -> Result<ListRulesResp, NatmapError>
where
    S: IpSetOps,
    C: ConntrackNat<Packet = S::Packet>,
{
    Ok(ListRulesResp { rules: table.list_rules() })
}

/// This is the entry point for all NATMAP commands. It verifies the
/// API version and then multiplexes the command to its handler.
///
/// # Safety
///
/// See [`IoctlEnvelope::wrap`].
pub unsafe fn dispatch<S, C>(
    table: &RuleTable<S, C>,
    ioctl: &mut NatmapCmdIoctl,
) -> c_int
where
    S: IpSetOps,
    C: ConntrackNat<Packet = S::Packet>,
{
    let mut env = match unsafe { IoctlEnvelope::wrap(ioctl) } {
        Ok(v) => v,
        Err(errno) => return errno,
    };

    match env.ioctl_cmd() {
        NatmapCmd::AddRule => {
            let resp = add_rule_hdlr(&mut env, table);
            let id = resp.as_ref().ok().map(|r| r.id);
            let ret = hdlr_resp(&mut env, resp);

            // A rule whose id was not copied out is removed; the
            // caller resends the request.
            if ret != 0
                && let Some(id) = id
            {
                let _ = table.del_rule(id);
            }
            ret
        }

        NatmapCmd::DelRule => {
            let resp = del_rule_hdlr(&mut env, table);
            hdlr_resp(&mut env, resp)
        }

        NatmapCmd::ListRules => {
            let resp = list_rules_hdlr(table);
            hdlr_resp(&mut env, resp)
        }
    }
}
