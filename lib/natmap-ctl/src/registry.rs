// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Resolve set names to set indexes.
//!
//! The registry is reached through [`SetRegistry`], a single
//! request/response exchange in the shape of `getsockopt(2)`.
//! [`SockoptRegistry`] is the real thing: a raw IPv4 socket and
//! `SO_IP_SET`.

use crate::ErrorClass;
use natmap::api::IP_SET_OP_GET_BYINDEX;
use natmap::api::IP_SET_OP_GET_BYNAME;
use natmap::api::IP_SET_OP_GET_FNAME;
use natmap::api::IpSetNameIndex;
use natmap::api::IpSetReqGetSet;
use natmap::api::IpSetReqGetSetFamily;
use natmap::api::IpSetReqVersion;
use natmap::api::NfProto;
use natmap::api::SO_IP_SET;
use natmap::api::SOL_IP;
use natmap::api::SetId;
use natmap::api::SetName;
use natmap::api::SetNameError;
use slog::Logger;
use slog::debug;
use std::fmt;
use std::mem::size_of;
use std::os::fd::AsRawFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("setname `{0}' too long, max {max} characters", max = SetName::MAX_LEN)]
    NameTooLong(String),

    #[error("invalid set name `{name}': {reason}")]
    BadName { name: String, reason: String },

    #[error("set {0} doesn't exist")]
    NotFound(String),

    #[error("set with index {0} doesn't exist")]
    NoSuchIndex(SetId),

    #[error(
        "the protocol family of set {name} is {family}, which is not applicable"
    )]
    FamilyMismatch { name: String, family: NfProto },

    #[error("can't open socket to ipset: {0}")]
    Socket(std::io::Error),

    #[error("kernel module xt_set is not loaded in (errno {0})")]
    NotLoaded(libc::c_int),

    #[error("problem when communicating with ipset, op={op:#x}, errno={errno}")]
    Sockopt { op: u32, errno: libc::c_int },

    #[error(
        "incorrect return size from kernel during ipset lookup, \
         (want {want}, got {got})"
    )]
    BadRespSize { want: usize, got: usize },

    #[error("ipset reported unknown protocol family {0}")]
    UnknownFamily(u32),
}

impl RegistryError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NameTooLong(_)
            | Self::BadName { .. }
            | Self::FamilyMismatch { .. } => ErrorClass::Validation,
            Self::NotFound(_) | Self::NoSuchIndex(_) => ErrorClass::NotFound,
            Self::Socket(_)
            | Self::NotLoaded(_)
            | Self::Sockopt { .. }
            | Self::BadRespSize { .. }
            | Self::UnknownFamily(_) => ErrorClass::Backend,
        }
    }
}

/// The set registry's control protocol.
pub trait SetRegistry {
    /// Exchange one request. `buf` holds the request on the way in
    /// and the response on the way out. Returns the response length
    /// or an errno.
    fn getsockopt(&self, buf: &mut [u8]) -> Result<usize, libc::c_int>;
}

impl<R: SetRegistry + ?Sized> SetRegistry for &R {
    fn getsockopt(&self, buf: &mut [u8]) -> Result<usize, libc::c_int> {
        (**self).getsockopt(buf)
    }
}

/// The kernel's set registry, reached through `SO_IP_SET`.
#[derive(Debug)]
pub struct SockoptRegistry {
    fd: OwnedFd,
}

impl SockoptRegistry {
    pub fn open() -> Result<Self, RegistryError> {
        let fd = unsafe {
            libc::socket(
                libc::AF_INET,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::IPPROTO_RAW,
            )
        };

        if fd < 0 {
            return Err(RegistryError::Socket(std::io::Error::last_os_error()));
        }

        // Safety: `socket(2)` just handed us this descriptor.
        Ok(Self { fd: unsafe { OwnedFd::from_raw_fd(fd) } })
    }
}

impl SetRegistry for SockoptRegistry {
    fn getsockopt(&self, buf: &mut [u8]) -> Result<usize, libc::c_int> {
        let mut size = buf.len() as libc::socklen_t;
        let res = unsafe {
            libc::getsockopt(
                self.fd.as_raw_fd(),
                SOL_IP,
                SO_IP_SET,
                buf.as_mut_ptr() as *mut libc::c_void,
                &mut size,
            )
        };

        if res != 0 {
            let err = std::io::Error::last_os_error();
            return Err(err.raw_os_error().unwrap_or(libc::EIO));
        }

        Ok(size as usize)
    }
}

/// A resolved set.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SetRef {
    pub name: SetName,
    pub id: SetId,
    pub family: NfProto,
}

impl fmt::Display for SetRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} (index {}, family {})", self.name, self.id, self.family)
    }
}

/// Resolves set names for rules of one protocol family.
pub struct Resolver<R> {
    registry: R,
    family: NfProto,
    log: Logger,
}

impl<R: SetRegistry> Resolver<R> {
    /// A resolver for IPv4 rules, the only family the NATMAP targets
    /// register for.
    pub fn new(registry: R, log: Logger) -> Self {
        Self { registry, family: NfProto::Ipv4, log }
    }

    pub fn with_family(mut self, family: NfProto) -> Self {
        self.family = family;
        self
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    pub fn family(&self) -> NfProto {
        self.family
    }

    fn exchange<T>(&self, req: &mut T) -> Result<usize, libc::c_int>
    where
        T: FromBytes + IntoBytes + Immutable,
    {
        self.registry.getsockopt(req.as_mut_bytes())
    }

    /// Ask the registry for its protocol version.
    pub fn version(&self) -> Result<u32, RegistryError> {
        let mut req = IpSetReqVersion::new();
        self.exchange(&mut req).map_err(RegistryError::NotLoaded)?;
        Ok(req.version)
    }

    /// Resolve `name`, checking that the set is usable by rules of
    /// this resolver's family.
    pub fn resolve(&self, name: &str) -> Result<SetRef, RegistryError> {
        let set_name = parse_name(name)?;
        let (id, family) = self
            .lookup(&set_name)?
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

        if !family.applies_to(self.family) {
            return Err(RegistryError::FamilyMismatch {
                name: name.to_string(),
                family,
            });
        }

        Ok(SetRef { name: set_name, id, family })
    }

    /// Does `name` exist? Any failure to find out counts as "no".
    pub fn probe(&self, name: &str) -> bool {
        let Ok(set_name) = parse_name(name) else {
            return false;
        };

        match self.lookup(&set_name) {
            Ok(found) => found.is_some(),
            Err(e) => {
                debug!(self.log, "probe failed"; "set" => name, "error" => %e);
                false
            }
        }
    }

    /// Reverse lookup of a set index.
    pub fn name_by_id(&self, id: SetId) -> Result<SetName, RegistryError> {
        let version = self.version()?;
        let mut req = IpSetReqGetSet {
            op: IP_SET_OP_GET_BYINDEX,
            version,
            set: IpSetNameIndex::from_index(id.get()),
        };

        let got = self.exchange(&mut req).map_err(|errno| {
            RegistryError::Sockopt { op: IP_SET_OP_GET_BYINDEX, errno }
        })?;
        check_size::<IpSetReqGetSet>(got)?;

        SetName::from_wire(req.set.name_bytes())
            .map_err(|_| RegistryError::NoSuchIndex(id))
    }

    fn lookup(
        &self,
        name: &SetName,
    ) -> Result<Option<(SetId, NfProto)>, RegistryError> {
        let version = self.version()?;
        let mut req = IpSetReqGetSetFamily {
            op: IP_SET_OP_GET_FNAME,
            version,
            family: self.family.into(),
            set: IpSetNameIndex::from_name(name),
        };

        let got = match self.exchange(&mut req) {
            Ok(got) => got,
            Err(libc::EBADMSG) => {
                debug!(
                    self.log,
                    "registry predates family lookups, using name lookup";
                    "set" => %name,
                    "version" => version,
                );
                return self.lookup_legacy(name, version);
            }
            Err(errno) => {
                return Err(RegistryError::Sockopt {
                    op: IP_SET_OP_GET_FNAME,
                    errno,
                });
            }
        };
        check_size::<IpSetReqGetSetFamily>(got)?;

        let Some(id) = SetId::from_wire(req.set.index()) else {
            return Ok(None);
        };

        let family = NfProto::try_from(req.family)
            .map_err(|_| RegistryError::UnknownFamily(req.family))?;
        Ok(Some((id, family)))
    }

    // Old registries only know `GET_BYNAME`, which carries no family.
    fn lookup_legacy(
        &self,
        name: &SetName,
        version: u32,
    ) -> Result<Option<(SetId, NfProto)>, RegistryError> {
        let mut req = IpSetReqGetSet {
            op: IP_SET_OP_GET_BYNAME,
            version,
            set: IpSetNameIndex::from_name(name),
        };

        let got = self.exchange(&mut req).map_err(|errno| {
            RegistryError::Sockopt { op: IP_SET_OP_GET_BYNAME, errno }
        })?;
        check_size::<IpSetReqGetSet>(got)?;

        Ok(SetId::from_wire(req.set.index()).map(|id| (id, NfProto::Unspec)))
    }
}

fn parse_name(name: &str) -> Result<SetName, RegistryError> {
    SetName::new(name).map_err(|e| match e {
        SetNameError::TooLong(_) => RegistryError::NameTooLong(name.to_string()),
        reason => RegistryError::BadName {
            name: name.to_string(),
            reason: reason.to_string(),
        },
    })
}

fn check_size<T>(got: usize) -> Result<(), RegistryError> {
    let want = size_of::<T>();
    if got != want {
        return Err(RegistryError::BadRespSize { want, got });
    }
    Ok(())
}
