// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! NATMAP administration library

use natmap::api::API_VERSION;
use natmap::api::MAJOR_VERSION;
use natmap_ctl::Error;
use natmap_ctl::ErrorClass;
use natmap_ctl::NatmapHdl;
use natmap_ctl::encode::EncodeError;
use natmap_ctl::registry::RegistryError;
use slog::Drain;
use slog::Logger;
use std::ops::Deref;

/// The handle used to send administration commands to the NATMAP
/// control device.
#[derive(Debug)]
pub struct NatmapAdm(NatmapHdl);

impl Deref for NatmapAdm {
    type Target = NatmapHdl;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl NatmapAdm {
    /// Open the control device at `path`.
    pub fn open(path: &str) -> Result<Self, Error> {
        NatmapHdl::open_path(path).map(Self)
    }
}

pub fn pkg_version() -> String {
    format!("{MAJOR_VERSION}.{API_VERSION}")
}

/// A terminal logger on stderr, filtered by `RUST_LOG`.
pub fn logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_envlogger::new(drain).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, slog::o!("component" => "natmapadm"))
}

fn class_of(err: &anyhow::Error) -> ErrorClass {
    if let Some(e) = err.downcast_ref::<EncodeError>() {
        return e.class();
    }
    if let Some(e) = err.downcast_ref::<RegistryError>() {
        return e.class();
    }
    if let Some(e) = err.downcast_ref::<Error>() {
        return e.class();
    }
    ErrorClass::Backend
}

/// The process exit status for a failed command: 2 for bad input or
/// a missing set or rule, 1 for everything else.
pub fn exit_status(err: &anyhow::Error) -> u8 {
    match class_of(err) {
        ErrorClass::Validation | ErrorClass::NotFound => 2,
        ErrorClass::Backend => 1,
    }
}
