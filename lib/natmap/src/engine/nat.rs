// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The connection tracking NAT boundary.

use crate::api::NfProto;
use bitflags::bitflags;
use core::fmt;
use core::fmt::Display;
use core::net::Ipv4Addr;
use libc::c_int;

bitflags! {
    /// `NF_NAT_RANGE_*`
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct RangeFlags: u32 {
        const MAP_IPS = 1 << 0;
        const PROTO_SPECIFIED = 1 << 1;
    }
}

/// Which side of the connection a translation rewrites.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NatManip {
    /// `NF_NAT_MANIP_SRC`
    Src,
    /// `NF_NAT_MANIP_DST`
    Dst,
}

impl Display for NatManip {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Src => write!(f, "SNAT"),
            Self::Dst => write!(f, "DNAT"),
        }
    }
}

/// A single-address translation range.
///
/// NATMAP never produces a range wider than one address and one
/// port: `min == max` for both.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NatRange {
    pub flags: RangeFlags,
    pub min_addr: Ipv4Addr,
    pub max_addr: Ipv4Addr,
    pub min_port: u16,
    pub max_port: u16,
}

impl NatRange {
    /// Build the range for a translation to `addr`, and to `port`
    /// when it is non-zero.
    pub fn single(addr: Ipv4Addr, port: u16) -> Self {
        let mut flags = RangeFlags::MAP_IPS;
        if port != 0 {
            flags |= RangeFlags::PROTO_SPECIFIED;
        }

        Self {
            flags,
            min_addr: addr,
            max_addr: addr,
            min_port: port,
            max_port: port,
        }
    }

    pub fn port_specified(&self) -> bool {
        self.flags.contains(RangeFlags::PROTO_SPECIFIED)
    }
}

impl Display for NatRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.port_specified() {
            write!(f, "{}:{}", self.min_addr, self.min_port)
        } else {
            write!(f, "{}", self.min_addr)
        }
    }
}

/// A netfilter verdict.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Verdict {
    Drop,
    Accept,
    Stolen,
    Queue,
    Repeat,
    Stop,
    /// `XT_CONTINUE`: let the next rule see the packet.
    Continue,
}

impl Verdict {
    pub const XT_CONTINUE: u32 = 0xFFFF_FFFF;

    pub fn as_raw(&self) -> u32 {
        match self {
            Self::Drop => 0,
            Self::Accept => 1,
            Self::Stolen => 2,
            Self::Queue => 3,
            Self::Repeat => 4,
            Self::Stop => 5,
            Self::Continue => Self::XT_CONTINUE,
        }
    }
}

impl Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Drop => "DROP",
            Self::Accept => "ACCEPT",
            Self::Stolen => "STOLEN",
            Self::Queue => "QUEUE",
            Self::Repeat => "REPEAT",
            Self::Stop => "STOP",
            Self::Continue => "CONTINUE",
        };
        write!(f, "{s}")
    }
}

/// The connection tracking NAT subsystem.
pub trait ConntrackNat {
    type Packet;

    /// Take a reference on the conntrack state of the rule's network
    /// namespace for `family`. Fails with an errno.
    fn netns_get(&self, family: NfProto) -> Result<(), c_int>;

    /// Drop a reference taken by `netns_get`.
    fn netns_put(&self, family: NfProto);

    /// Commit `range` as the `manip` side mapping of the connection
    /// `pkt` belongs to. The returned verdict is the packet's verdict.
    fn setup_info(
        &self,
        pkt: &Self::Packet,
        range: &NatRange,
        manip: NatManip,
    ) -> Verdict;
}
