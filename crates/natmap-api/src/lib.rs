// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Types shared by the NATMAP control plane and data plane.
//!
//! Everything in this crate describes a boundary: the rule record
//! handed from the administrative tooling to the data plane, the
//! set registry's request/response protocol, and the command envelope
//! used to install and remove rules.

#![no_std]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

#[cfg(any(feature = "std", test))]
#[macro_use]
extern crate std;

#[macro_use]
extern crate alloc;

use alloc::string::String;
use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

pub mod cmd;
pub mod ipset;
pub mod xt;

pub use cmd::*;
pub use ipset::*;
pub use xt::*;

/// The overall version of the API. Anytime an API is added, removed,
/// or modified, this number should increment. Currently we attach no
/// semantic meaning to the number other than as a means to verify
/// that the control plane and data plane are compiled for the same
/// API.
pub const API_VERSION: u64 = 1;

/// Major version of the NATMAP package.
pub const MAJOR_VERSION: u64 = 0;

/// A netfilter protocol family (`NFPROTO_*`).
///
/// Sets carry a family; a set whose family is [`NfProto::Unspec`]
/// may be used with any family.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
#[repr(u8)]
pub enum NfProto {
    #[default]
    Unspec = 0,
    Ipv4 = 2,
    Ipv6 = 10,
}

impl NfProto {
    /// Is a set of family `self` usable by a rule of family `rule`?
    pub fn applies_to(self, rule: NfProto) -> bool {
        self == rule || self == NfProto::Unspec
    }
}

impl TryFrom<u32> for NfProto {
    type Error = String;

    fn try_from(val: u32) -> Result<Self, Self::Error> {
        match val {
            0 => Ok(Self::Unspec),
            2 => Ok(Self::Ipv4),
            10 => Ok(Self::Ipv6),
            _ => Err(format!("unknown protocol family: {val}")),
        }
    }
}

impl From<NfProto> for u32 {
    fn from(family: NfProto) -> Self {
        family as u32
    }
}

impl core::str::FromStr for NfProto {
    type Err = String;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "any" | "unspec" => Ok(Self::Unspec),
            "ipv4" | "inet" => Ok(Self::Ipv4),
            "ipv6" | "inet6" => Ok(Self::Ipv6),
            _ => Err(format!("invalid family: {s}")),
        }
    }
}

impl Display for NfProto {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Unspec => "any",
            Self::Ipv4 => "IPv4",
            Self::Ipv6 => "IPv6",
        };
        write!(f, "{s}")
    }
}
