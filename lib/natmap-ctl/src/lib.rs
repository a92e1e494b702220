// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The NATMAP control plane.
//!
//! Turning `--nat-set NAME FLAGS` into an installed rule takes three
//! steps: resolve the set name to an index ([`registry`]), restoring
//! the set from disk first if it does not exist yet ([`provision`]);
//! pack the index and direction flags into a rule record
//! ([`encode`]); and hand the record to the data plane over the
//! command channel ([`NatmapHdl`]).

use natmap::api::API_VERSION;
use natmap::api::AddRuleReq;
use natmap::api::AddRuleResp;
use natmap::api::CmdOk;
use natmap::api::DelRuleReq;
use natmap::api::Hooks;
use natmap::api::ListRulesResp;
use natmap::api::NATMAP_IOC_CMD;
use natmap::api::NatmapCmd;
use natmap::api::NatmapCmdIoctl;
pub use natmap::api::NatmapError;
use natmap::api::NfProto;
use natmap::api::NoResp;
use natmap::api::RuleId;
use natmap::api::TargetKind;
use natmap::api::TargetRecord;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::File;
use std::fs::OpenOptions;
use std::os::unix::io::AsRawFd;
use thiserror::Error;

pub mod encode;
pub mod print;
pub mod provision;
pub mod registry;

/// How an error should be reported to an administrator.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorClass {
    /// Bad input: a missing argument, a malformed token, a set of the
    /// wrong family.
    Validation,
    /// A named set or index does not exist.
    NotFound,
    /// The registry or the data plane could not be reached, or broke
    /// protocol.
    Backend,
}

/// Errors related to administering the NATMAP data plane.
#[derive(Debug, Error)]
pub enum Error {
    #[error("NATMAP data plane is not attached")]
    DriverNotAttached,

    #[error("error interacting with device: {0}")]
    Io(std::io::Error),

    /// Something in the command handler failed.
    #[error("ioctl {0:?} failed: {1}")]
    IoctlFailed(NatmapCmd, String),

    #[error("request serialization failed for command {0:?}: {1}")]
    ReqSer(NatmapCmd, postcard::Error),

    #[error("response deserialization failed for command {0:?}: {1}")]
    RespDeser(NatmapCmd, postcard::Error),

    #[error("failed to get response for command {0:?} in {1} attempts")]
    MaxAttempts(NatmapCmd, u8),

    #[error("command {0:?} failed: {1:?}")]
    CommandError(NatmapCmd, NatmapError),
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::CommandError(_, err) => match err {
                NatmapError::SetNotFound(_) | NatmapError::RuleNotFound(_) => {
                    ErrorClass::NotFound
                }
                NatmapError::BadFamily(_)
                | NatmapError::BadHook { .. }
                | NatmapError::BadRecord(_)
                | NatmapError::BadTable(_)
                | NatmapError::DimensionOverLimit(_) => ErrorClass::Validation,
                _ => ErrorClass::Backend,
            },
            _ => ErrorClass::Backend,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Error::DriverNotAttached,
            _ => Error::Io(e),
        }
    }
}

/// A device that accepts `NatmapCmdIoctl` commands.
pub trait CmdDev {
    /// Issue one command. On failure the errno is returned; the
    /// response buffer may still hold a serialized `NatmapError`.
    fn cmd_ioctl(&self, ioctl: &mut NatmapCmdIoctl) -> Result<(), libc::c_int>;
}

impl CmdDev for File {
    fn cmd_ioctl(&self, ioctl: &mut NatmapCmdIoctl) -> Result<(), libc::c_int> {
        let ret = unsafe { ioctl_raw(self.as_raw_fd(), NATMAP_IOC_CMD, ioctl) };
        if ret == -1 {
            let err = std::io::Error::last_os_error();
            return Err(err.raw_os_error().unwrap_or(libc::EIO));
        }
        Ok(())
    }
}

/// The handle used to send administration commands to the NATMAP
/// data plane.
#[derive(Debug)]
pub struct NatmapHdl<D = File> {
    device: D,
}

impl NatmapHdl<File> {
    pub const NATMAP_CTL: &'static str = "/dev/natmap";

    /// Open the default control device.
    pub fn open() -> Result<Self, Error> {
        Self::open_path(Self::NATMAP_CTL)
    }

    pub fn open_path(path: &str) -> Result<Self, Error> {
        let device = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { device })
    }
}

impl<D: CmdDev> NatmapHdl<D> {
    /// Wrap an already open command device.
    pub fn open_on(device: D) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// Install a rule around `record`.
    pub fn add_rule(
        &self,
        kind: TargetKind,
        hooks: Hooks,
        record: &TargetRecord,
    ) -> Result<RuleId, Error> {
        let cmd = NatmapCmd::AddRule;
        let req = AddRuleReq {
            kind,
            table: TargetKind::TABLE.to_string(),
            hooks,
            family: NfProto::Ipv4,
            record: record.to_bytes(),
        };
        let resp: AddRuleResp = run_cmd_ioctl(&self.device, cmd, Some(&req))?;
        Ok(resp.id)
    }

    /// Remove rule `id`.
    pub fn del_rule(&self, id: RuleId) -> Result<NoResp, Error> {
        let cmd = NatmapCmd::DelRule;
        run_cmd_ioctl(&self.device, cmd, Some(&DelRuleReq { id }))
    }

    /// List the installed rules.
    pub fn list_rules(&self) -> Result<ListRulesResp, Error> {
        let cmd = NatmapCmd::ListRules;
        run_cmd_ioctl::<ListRulesResp, ()>(&self.device, cmd, None)
    }
}

pub fn run_cmd_ioctl<T, R>(
    dev: &impl CmdDev,
    cmd: NatmapCmd,
    req: Option<&R>,
) -> Result<T, Error>
where
    T: CmdOk + DeserializeOwned,
    R: Serialize,
{
    let req_bytes = match req {
        Some(req) => {
            let bytes =
                postcard::to_allocvec(req).map_err(|e| Error::ReqSer(cmd, e))?;
            // A zero-length request would look like no request at all.
            assert!(!bytes.is_empty(), "cannot use ZST for request type");
            Some(bytes)
        }

        None => None,
    };

    let (req_bytes_ptr, req_len) = match &req_bytes {
        Some(bytes) => (bytes.as_ptr(), bytes.len()),
        None => (core::ptr::null(), 0),
    };

    // It would be a shame if the command failed and we didn't have
    // enough bytes to serialize the error response, so we set this to
    // default to 16 KiB.
    const BASE_CAPACITY: usize = 16 * 1024;
    let mut resp_buf: Vec<u8> = Vec::with_capacity(BASE_CAPACITY);
    let mut rioctl = NatmapCmdIoctl {
        api_version: API_VERSION,
        cmd,
        flags: 0,
        reserved1: 0,
        req_bytes: req_bytes_ptr,
        req_len,
        resp_bytes: resp_buf.as_mut_ptr(),
        resp_len: resp_buf.capacity(),
        resp_len_actual: 0,
    };

    const MAX_ITERATIONS: u8 = 3;
    for _ in 0..MAX_ITERATIONS {
        if let Err(raw_err) = dev.cmd_ioctl(&mut rioctl) {
            // The command ran successfully, but there is not enough
            // space to copy out the response. In this case bump up the
            // size of the response buffer and retry.
            if raw_err == libc::ENOBUFS {
                // Keep some headroom: every retry reruns the command,
                // and the next response may be a different size.
                let wanted_capacity =
                    BASE_CAPACITY / 4 + rioctl.resp_len_actual;
                resp_buf.reserve(wanted_capacity.saturating_sub(resp_buf.len()));
                rioctl.resp_bytes = resp_buf.as_mut_ptr();
                rioctl.resp_len = resp_buf.capacity();
                rioctl.resp_len_actual = 0;
                continue;
            }

            // Anytime a response is present it will have more context
            // for the error. Otherwise, we have to approximate the
            // error via errno.
            if let Some(cmd_err) = rioctl.cmd_err_resp() {
                return Err(Error::CommandError(cmd, cmd_err));
            }

            let msg = match raw_err {
                libc::EPROTO => "API version mismatch".to_string(),

                libc::EFAULT => "failed to copyin/copyout req/resp".to_string(),

                libc::ENOMSG => {
                    "data plane failed to deser/ser req/resp".to_string()
                }

                libc::EPERM => "permission denied".to_string(),

                errno => format!("unexpected errno: {errno}"),
            };

            return Err(Error::IoctlFailed(cmd, msg));
        }

        // The device has promised that it has populated
        // `resp_len_actual` bytes in the buffer we provided to it.
        if rioctl.resp_len_actual > resp_buf.capacity() {
            return Err(Error::IoctlFailed(
                cmd,
                format!(
                    "response length {} exceeds buffer {}",
                    rioctl.resp_len_actual,
                    resp_buf.capacity()
                ),
            ));
        }

        // Safety: checked against the capacity above, and the device
        // wrote that many bytes.
        unsafe {
            resp_buf.set_len(rioctl.resp_len_actual);
        }
        return postcard::from_bytes(&resp_buf)
            .map_err(|e| Error::RespDeser(cmd, e));
    }

    Err(Error::MaxAttempts(cmd, MAX_ITERATIONS))
}

unsafe fn ioctl_raw<T>(
    fd: libc::c_int,
    req: libc::c_int,
    arg: *mut T,
) -> libc::c_int {
    // Most other OSes define the request argument to be ulong_t rather
    // than int. Cast that away here so that it compiles in both places.
    #[cfg(not(target_os = "illumos"))]
    let req = req as libc::c_ulong;

    unsafe { libc::ioctl(fd, req, arg) }
}
