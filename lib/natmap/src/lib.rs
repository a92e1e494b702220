// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The NATMAP data plane.
//!
//! A NATMAP rule looks a packet up in an ipset and, when the packet
//! is a member, rewrites its source (`SNATMAP`) or destination
//! (`DNATMAP`) to the address and port encoded in the matching
//! entry's metadata. The set registry and the connection tracking NAT
//! subsystem are collaborators reached through the traits in
//! [`engine::ipset`] and [`engine::nat`].

#![cfg_attr(not(feature = "std"), no_std)]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

#[cfg_attr(feature = "engine", macro_use)]
extern crate alloc;

#[cfg(any(feature = "engine", test))]
#[macro_use]
extern crate cfg_if;

#[cfg(any(feature = "api", test))]
pub mod api;
#[cfg(any(feature = "engine", test))]
pub mod engine;
#[cfg(any(feature = "engine", test))]
pub mod provider;
