// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Print rules in human-friendly manner.
//!
//! This is mostly just a place to hang printing routines so that they
//! can be used by both natmapadm and integration tests.

use crate::registry::RegistryError;
use crate::registry::Resolver;
use crate::registry::SetRegistry;
use itertools::Itertools;
use natmap::api::Hooks;
use natmap::api::ListRulesResp;
use natmap::api::RuleDump;
use natmap::api::SetSlot;
use natmap::api::TargetKind;
use natmap::api::TargetRecord;
use std::io::Write;
use tabwriter::TabWriter;

/// How a rule's options are rendered.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Form {
    /// As shown in a listing: ` nat-set NAME src,dst`.
    Display,
    /// As given on a command line: ` --nat-set NAME src,dst`.
    Save,
}

impl Form {
    fn prefix(&self) -> &'static str {
        match self {
            Self::Display => "nat-set",
            Self::Save => "--nat-set",
        }
    }
}

fn render_slot<R: SetRegistry>(
    resolver: &Resolver<R>,
    slot: &SetSlot,
    form: Form,
) -> Result<String, RegistryError> {
    let name = resolver.name_by_id(slot.id)?;
    let mut out = format!(" {} {name}", form.prefix());
    if !slot.dirs.is_empty() {
        out.push(' ');
        out.push_str(&slot.dirs.iter().map(|f| f.token()).join(","));
    }
    Ok(out)
}

/// Render the options of a `kind` rule. Only the slot `kind` uses is
/// rendered, and nothing at all if it is empty.
pub fn render_rule<R: SetRegistry>(
    resolver: &Resolver<R>,
    kind: TargetKind,
    record: &TargetRecord,
    form: Form,
) -> Result<String, RegistryError> {
    match record.slot(kind.role()) {
        Some(slot) => render_slot(resolver, slot, form),
        None => Ok(String::new()),
    }
}

fn hook_names(hooks: Hooks) -> impl Iterator<Item = &'static str> {
    hooks.iter_names().map(|(name, _)| name)
}

fn render_dump<R: SetRegistry>(
    resolver: &Resolver<R>,
    dump: &RuleDump,
    form: Form,
) -> String {
    let rendered = TargetRecord::from_bytes(&dump.record)
        .map_err(|e| e.to_string())
        .and_then(|rec| {
            render_rule(resolver, dump.kind, &rec, form)
                .map_err(|e| e.to_string())
        });

    match rendered {
        Ok(s) => s,
        Err(e) => format!(" <{e}>"),
    }
}

/// Print a [`ListRulesResp`].
pub fn print_rules<R: SetRegistry>(
    resolver: &Resolver<R>,
    resp: &ListRulesResp,
) -> std::io::Result<()> {
    print_rules_into(&mut std::io::stdout(), resolver, resp)
}

/// Print a [`ListRulesResp`] into a given writer.
pub fn print_rules_into<R: SetRegistry>(
    writer: &mut impl Write,
    resolver: &Resolver<R>,
    resp: &ListRulesResp,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    writeln!(t, "ID\tTARGET\tHOOKS\tFAMILY\tHITS\tOPTIONS")?;

    for dump in &resp.rules {
        writeln!(
            t,
            "{}\t{}\t{}\t{}\t{}\t{}",
            dump.id,
            dump.kind,
            hook_names(dump.hooks).join(","),
            dump.family,
            dump.hits,
            render_dump(resolver, dump, Form::Display).trim_start(),
        )?;
    }
    t.flush()
}

/// Print the installed rules as `natmapadm` command lines.
pub fn save_rules_into<R: SetRegistry>(
    writer: &mut impl Write,
    resolver: &Resolver<R>,
    resp: &ListRulesResp,
) -> std::io::Result<()> {
    for dump in &resp.rules {
        let cmd = match dump.kind {
            TargetKind::Snat => "add-snat",
            TargetKind::Dnat => "add-dnat",
        };
        let hooks =
            hook_names(dump.hooks).map(|h| format!(" --hook {h}")).join("");
        writeln!(
            writer,
            "{cmd}{hooks}{}",
            render_dump(resolver, dump, Form::Save)
        )?;
    }
    writer.flush()
}
