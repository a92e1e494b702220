// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The set registry's getsockopt(2) protocol.
//!
//! The registry (ipset) answers requests issued as `getsockopt(fd,
//! SOL_IP, SO_IP_SET, buf, &len)` on a raw IPv4 socket. The request
//! buffer doubles as the response buffer; the kernel writes the
//! answer in place and updates `len`. These layouts must match the
//! kernel's byte for byte.

use core::fmt;
use core::fmt::Debug;
use core::fmt::Display;
use core::mem::size_of;
use libc::c_int;
use serde::Deserialize;
use serde::Serialize;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// The size of a set name buffer, including the terminating NUL.
pub const IPSET_MAXNAMELEN: usize = 32;

/// The index value meaning "no set".
pub const IPSET_INVALID_ID: u16 = 65535;

pub const SOL_IP: c_int = 0;
pub const SO_IP_SET: c_int = 83;

pub const IP_SET_OP_GET_BYNAME: u32 = 0x0000_0006;
pub const IP_SET_OP_GET_BYINDEX: u32 = 0x0000_0007;
pub const IP_SET_OP_GET_FNAME: u32 = 0x0000_0008;
pub const IP_SET_OP_VERSION: u32 = 0x0000_0100;

/// The oldest protocol version the registry accepts for lookups.
pub const IPSET_PROTOCOL_MIN: u32 = 6;

/// The index of a set within the registry.
///
/// A `SetId` is always valid; the [`IPSET_INVALID_ID`] sentinel only
/// appears at the wire boundary, where `Option<SetId>` is converted
/// with [`SetId::from_wire`] and [`SetId::to_wire`].
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct SetId(u16);

impl SetId {
    pub const fn new(raw: u16) -> Option<Self> {
        if raw == IPSET_INVALID_ID { None } else { Some(Self(raw)) }
    }

    pub const fn get(self) -> u16 {
        self.0
    }

    pub const fn from_wire(raw: u16) -> Option<Self> {
        Self::new(raw)
    }

    pub const fn to_wire(id: Option<Self>) -> u16 {
        match id {
            Some(id) => id.0,
            None => IPSET_INVALID_ID,
        }
    }
}

impl Display for SetId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SetNameError {
    Empty,
    TooLong(usize),
    Nul,
    Utf8,
}

impl Display for SetNameError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "set name is empty"),
            Self::TooLong(len) => write!(
                f,
                "set name is {len} bytes, max {} characters",
                SetName::MAX_LEN
            ),
            Self::Nul => write!(f, "set name contains a NUL byte"),
            Self::Utf8 => write!(f, "set name is not valid UTF-8"),
        }
    }
}

/// A set name, at most [`SetName::MAX_LEN`] bytes.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct SetName {
    buf: [u8; IPSET_MAXNAMELEN],
    len: u8,
}

impl SetName {
    pub const MAX_LEN: usize = IPSET_MAXNAMELEN - 1;

    pub fn new(name: &str) -> Result<Self, SetNameError> {
        let bytes = name.as_bytes();
        if bytes.is_empty() {
            return Err(SetNameError::Empty);
        }

        if bytes.len() > Self::MAX_LEN {
            return Err(SetNameError::TooLong(bytes.len()));
        }

        if bytes.contains(&0) {
            return Err(SetNameError::Nul);
        }

        let mut buf = [0u8; IPSET_MAXNAMELEN];
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(Self { buf, len: bytes.len() as u8 })
    }

    /// Read a NUL-terminated name from a wire buffer. An empty name
    /// is how the registry says "no such set".
    pub fn from_wire(raw: &[u8; IPSET_MAXNAMELEN]) -> Result<Self, SetNameError> {
        // The last byte is always treated as the terminator.
        let len = raw[..Self::MAX_LEN]
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(Self::MAX_LEN);
        let name =
            core::str::from_utf8(&raw[..len]).map_err(|_| SetNameError::Utf8)?;
        Self::new(name)
    }

    pub fn as_str(&self) -> &str {
        // Only ever constructed from a `&str`.
        core::str::from_utf8(&self.buf[..usize::from(self.len)])
            .unwrap_or_default()
    }

    pub fn to_wire(&self) -> [u8; IPSET_MAXNAMELEN] {
        self.buf
    }
}

impl core::str::FromStr for SetName {
    type Err = SetNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl Debug for SetName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl Display for SetName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for SetName {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for SetName {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = <&str>::deserialize(d)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

/// `struct ip_set_req_version`
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct IpSetReqVersion {
    pub op: u32,
    pub version: u32,
}

impl IpSetReqVersion {
    pub fn new() -> Self {
        Self { op: IP_SET_OP_VERSION, version: 0 }
    }
}

impl Default for IpSetReqVersion {
    fn default() -> Self {
        Self::new()
    }
}

/// `union ip_set_name_index`: either a set name or, in its first
/// two bytes, a set index.
#[derive(Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct IpSetNameIndex {
    bytes: [u8; IPSET_MAXNAMELEN],
}

impl IpSetNameIndex {
    pub fn from_name(name: &SetName) -> Self {
        Self { bytes: name.to_wire() }
    }

    pub fn from_index(index: u16) -> Self {
        let mut bytes = [0u8; IPSET_MAXNAMELEN];
        bytes[..2].copy_from_slice(&index.to_ne_bytes());
        Self { bytes }
    }

    pub fn index(&self) -> u16 {
        u16::from_ne_bytes([self.bytes[0], self.bytes[1]])
    }

    pub fn set_index(&mut self, index: u16) {
        self.bytes[..2].copy_from_slice(&index.to_ne_bytes());
    }

    pub fn name_bytes(&self) -> &[u8; IPSET_MAXNAMELEN] {
        &self.bytes
    }

    pub fn set_name(&mut self, name: Option<&SetName>) {
        self.bytes = match name {
            Some(name) => name.to_wire(),
            None => [0u8; IPSET_MAXNAMELEN],
        };
    }
}

impl Debug for IpSetNameIndex {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("IpSetNameIndex")
            .field("index", &self.index())
            .field("name", &SetName::from_wire(&self.bytes).ok())
            .finish()
    }
}

/// `struct ip_set_req_get_set`, used by `IP_SET_OP_GET_BYNAME` and
/// `IP_SET_OP_GET_BYINDEX`.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct IpSetReqGetSet {
    pub op: u32,
    pub version: u32,
    pub set: IpSetNameIndex,
}

/// `struct ip_set_req_get_set_family`, used by `IP_SET_OP_GET_FNAME`.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct IpSetReqGetSetFamily {
    pub op: u32,
    pub version: u32,
    pub family: u32,
    pub set: IpSetNameIndex,
}

const _: () = assert!(size_of::<IpSetReqVersion>() == 8);
const _: () = assert!(size_of::<IpSetReqGetSet>() == 40);
const _: () = assert!(size_of::<IpSetReqGetSetFamily>() == 44);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn set_id_sentinel() {
        assert_eq!(SetId::new(IPSET_INVALID_ID), None);
        assert_eq!(SetId::to_wire(None), IPSET_INVALID_ID);
        let id = SetId::new(3).unwrap();
        assert_eq!(SetId::to_wire(Some(id)), 3);
        assert_eq!(SetId::from_wire(3), Some(id));
    }

    #[test]
    fn set_name_limits() {
        let max = "a".repeat(SetName::MAX_LEN);
        assert_eq!(SetName::new(&max).unwrap().as_str(), max);

        let over = "a".repeat(SetName::MAX_LEN + 1);
        assert_eq!(
            SetName::new(&over),
            Err(SetNameError::TooLong(SetName::MAX_LEN + 1))
        );
        assert_eq!(SetName::new(""), Err(SetNameError::Empty));
        assert_eq!(SetName::new("a\0b"), Err(SetNameError::Nul));
    }

    #[test]
    fn name_index_union() {
        let name: SetName = "natmap4".parse().unwrap();
        let mut ni = IpSetNameIndex::from_name(&name);
        assert_eq!(SetName::from_wire(ni.name_bytes()).unwrap(), name);

        ni.set_index(42);
        assert_eq!(ni.index(), 42);

        ni.set_name(None);
        assert_eq!(SetName::from_wire(ni.name_bytes()), Err(SetNameError::Empty));
    }

    #[test]
    fn request_bytes() {
        let name: SetName = "blk".parse().unwrap();
        let req = IpSetReqGetSetFamily {
            op: IP_SET_OP_GET_FNAME,
            version: 7,
            family: 2,
            set: IpSetNameIndex::from_name(&name),
        };
        let bytes = req.as_bytes();
        assert_eq!(bytes.len(), 44);
        assert_eq!(&bytes[0..4], &IP_SET_OP_GET_FNAME.to_ne_bytes());
        assert_eq!(&bytes[8..12], &2u32.to_ne_bytes());
        assert_eq!(&bytes[12..15], b"blk");
        assert_eq!(bytes[15], 0);
    }
}
