// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The engine in NATMAP.
//!
//! All code under this namespace is guarded by the `engine` feature flag.
pub mod ipset;
pub mod nat;
pub mod target;

cfg_if! {
    if #[cfg(any(feature = "std", test))] {
        pub mod ioctl;
        pub mod table;
    }
}

pub use ipset::AdtOpt;
pub use ipset::IpSetOps;
pub use ipset::SetExt;
pub use nat::ConntrackNat;
pub use nat::NatManip;
pub use nat::NatRange;
pub use nat::RangeFlags;
pub use nat::Verdict;
pub use target::Decision;
pub use target::NatMapTarget;
pub use target::RuleSpec;
