// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The data-plane face of the set registry.

use crate::api::CompatDesc;
use crate::api::NfProto;
use crate::api::SetId;

/// A timeout value meaning "use the set's own timeout".
pub const IPSET_NO_TIMEOUT: u32 = u32::MAX;

/// Extension data a membership test reports back about the matching
/// entry. For NATMAP the skb mark fields carry the translation
/// target: `skbmark` is the address in host order and the low 16 bits
/// of `skbmarkmask` are the port.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SetExt {
    pub timeout: u32,
    pub skbmark: u32,
    pub skbmarkmask: u32,
}

/// `struct ip_set_adt_opt`: the parameters of one membership test.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AdtOpt {
    pub family: NfProto,
    pub dim: u8,
    pub flags: u8,
    pub cmdflags: u32,
    pub ext: SetExt,
}

impl AdtOpt {
    pub fn new(family: NfProto, desc: CompatDesc) -> Self {
        Self {
            family,
            dim: desc.dim,
            flags: desc.flags,
            cmdflags: 0,
            ext: SetExt { timeout: IPSET_NO_TIMEOUT, ..Default::default() },
        }
    }

    /// The descriptor this test was built from.
    pub fn desc(&self) -> CompatDesc {
        CompatDesc { dim: self.dim, flags: self.flags }
    }
}

/// The set registry as seen from the packet path.
///
/// Reference counting is the registry's business; callers only
/// promise that every successful [`IpSetOps::get_byindex`] is matched
/// by exactly one [`IpSetOps::put`].
pub trait IpSetOps {
    type Packet;

    /// Take a reference on the set at `id`. Returns `None` if there is
    /// no set at that index.
    fn get_byindex(&self, id: SetId) -> Option<SetId>;

    /// Drop a reference taken by `get_byindex`.
    fn put(&self, id: SetId);

    /// Test `pkt` for membership in the set at `id`. On a match the
    /// registry fills in `opt.ext` from the matching entry.
    fn test(&self, id: SetId, pkt: &Self::Packet, opt: &mut AdtOpt) -> bool;
}
