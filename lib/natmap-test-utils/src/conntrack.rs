// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! An in-memory conntrack NAT subsystem that records what it is asked
//! to do.

use crate::TestPacket;
use natmap::api::NfProto;
use natmap::engine::ConntrackNat;
use natmap::engine::NatManip;
use natmap::engine::NatRange;
use natmap::engine::Verdict;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Setup {
    pub pkt: TestPacket,
    pub range: NatRange,
    pub manip: NatManip,
}

#[derive(Debug)]
struct State {
    netns_refs: i64,
    fail_netns: Option<libc::c_int>,
    verdict: Verdict,
    setups: Vec<Setup>,
}

#[derive(Clone, Debug)]
pub struct MockConntrack {
    state: Arc<Mutex<State>>,
}

impl Default for MockConntrack {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                netns_refs: 0,
                fail_netns: None,
                verdict: Verdict::Accept,
                setups: Vec::new(),
            })),
        }
    }
}

impl MockConntrack {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// The verdict returned for every translation.
    pub fn set_verdict(&self, verdict: Verdict) {
        self.lock().verdict = verdict;
    }

    /// Make namespace references fail with `errno`.
    pub fn fail_netns(&self, errno: Option<libc::c_int>) {
        self.lock().fail_netns = errno;
    }

    /// Outstanding namespace references.
    pub fn netns_refs(&self) -> i64 {
        self.lock().netns_refs
    }

    pub fn setups(&self) -> Vec<Setup> {
        self.lock().setups.clone()
    }
}

impl ConntrackNat for MockConntrack {
    type Packet = TestPacket;

    fn netns_get(&self, _family: NfProto) -> Result<(), libc::c_int> {
        let mut state = self.lock();
        if let Some(errno) = state.fail_netns {
            return Err(errno);
        }
        state.netns_refs += 1;
        Ok(())
    }

    fn netns_put(&self, _family: NfProto) {
        self.lock().netns_refs -= 1;
    }

    fn setup_info(
        &self,
        pkt: &TestPacket,
        range: &NatRange,
        manip: NatManip,
    ) -> Verdict {
        let mut state = self.lock();
        state.setups.push(Setup { pkt: *pkt, range: *range, manip });
        state.verdict
    }
}
