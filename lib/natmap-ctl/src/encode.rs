// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Build a rule record from `--nat-set NAME FLAGS`.

use crate::ErrorClass;
use crate::provision::Provisioner;
use crate::provision::Restore;
use crate::registry::RegistryError;
use crate::registry::Resolver;
use crate::registry::SetRef;
use crate::registry::SetRegistry;
use natmap::api::DirFlagArray;
use natmap::api::DirFlags;
use natmap::api::MAX_DIRS;
use natmap::api::SetName;
use natmap::api::SetSlot;
use natmap::api::TargetKind;
use natmap::api::TargetRecord;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("--nat-set can be specified only once")]
    AlreadySet,

    #[error("--nat-set requires two args")]
    MissingArgument,

    #[error("setname `{0}' too long, max {max} characters", max = SetName::MAX_LEN)]
    NameTooLong(String),

    #[error(
        "you must specify (the comma separated list of) 'src' or 'dst', \
         not `{0}'"
    )]
    BadDirectionToken(String),

    #[error("can't be more src/dst options than {max}", max = MAX_DIRS)]
    TooManyDirections,

    #[error("{0}: you must specify `--nat-set'")]
    NoTargetOption(TargetKind),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl EncodeError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Registry(e) => e.class(),
            _ => ErrorClass::Validation,
        }
    }
}

/// Parse a comma separated direction list such as `src,dst`.
///
/// A token only has to begin with `src` or `dst`, so `source` is read
/// as `src`.
pub fn parse_dirs(arg: &str) -> Result<DirFlagArray, EncodeError> {
    let mut dirs = DirFlagArray::new();
    let mut tokens = arg.split(',');

    for token in tokens.by_ref().take(MAX_DIRS) {
        let flag = if token.starts_with("src") {
            DirFlags::SRC
        } else if token.starts_with("dst") {
            DirFlags::DST
        } else {
            return Err(EncodeError::BadDirectionToken(token.to_string()));
        };

        // `take(MAX_DIRS)` keeps us within capacity.
        let _ = dirs.push(flag);
    }

    if tokens.next().is_some() {
        return Err(EncodeError::TooManyDirections);
    }

    Ok(dirs)
}

/// Encodes the rule record for one `SNATMAP` or `DNATMAP` rule.
pub struct RuleEncoder<'a, R, T> {
    kind: TargetKind,
    record: TargetRecord,
    set: Option<SetRef>,
    resolver: &'a Resolver<R>,
    provisioner: &'a Provisioner<T>,
}

impl<'a, R, T> RuleEncoder<'a, R, T>
where
    R: SetRegistry,
    T: Restore,
{
    pub fn new(
        kind: TargetKind,
        resolver: &'a Resolver<R>,
        provisioner: &'a Provisioner<T>,
    ) -> Self {
        Self {
            kind,
            record: TargetRecord::default(),
            set: None,
            resolver,
            provisioner,
        }
    }

    /// Handle `--nat-set NAME FLAGS`. `flags` is the argument that
    /// followed the name on the command line, if any.
    pub fn parse_nat_set(
        &mut self,
        name: &str,
        flags: Option<&str>,
    ) -> Result<(), EncodeError> {
        let role = self.kind.role();
        if self.record.slot(role).is_some() {
            return Err(EncodeError::AlreadySet);
        }

        let Some(flags) = flags.filter(|f| !f.starts_with(['-', '!'])) else {
            return Err(EncodeError::MissingArgument);
        };

        if name.len() > SetName::MAX_LEN {
            return Err(EncodeError::NameTooLong(name.to_string()));
        }

        let (set, _) = self.provisioner.ensure(self.resolver, name)?;
        let dirs = parse_dirs(flags)?;

        *self.record.slot_mut(role) = Some(SetSlot::new(set.id, dirs));
        self.set = Some(set);
        Ok(())
    }

    /// Check that the rule got its `--nat-set`.
    pub fn final_check(&self) -> Result<(), EncodeError> {
        match self.record.slot(self.kind.role()) {
            Some(_) => Ok(()),
            None => Err(EncodeError::NoTargetOption(self.kind)),
        }
    }

    pub fn kind(&self) -> TargetKind {
        self.kind
    }

    pub fn record(&self) -> &TargetRecord {
        &self.record
    }

    /// The set named by `--nat-set`, once parsed.
    pub fn set(&self) -> Option<&SetRef> {
        self.set.as_ref()
    }

    pub fn finish(self) -> Result<TargetRecord, EncodeError> {
        self.final_check()?;
        Ok(self.record)
    }
}
