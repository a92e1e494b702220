// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

use std::io;
use std::process::ExitCode;

use clap::ArgMatches;
use clap::Args;
use clap::CommandFactory;
use clap::FromArgMatches;
use clap::Parser;
use clap::Subcommand;
use slog::Logger;
use slog::debug;

use natmap::api::Hooks;
use natmap::api::RuleId;
use natmap::api::TargetKind;
use natmap_ctl::NatmapHdl;
use natmap_ctl::encode::RuleEncoder;
use natmap_ctl::print::print_rules;
use natmap_ctl::print::save_rules_into;
use natmap_ctl::provision::ProvisionCfg;
use natmap_ctl::provision::Provisioner;
use natmap_ctl::registry::Resolver;
use natmap_ctl::registry::SockoptRegistry;
use natmapadm::NatmapAdm;

/// Administer NATMAP conditional NAT rules
#[derive(Debug, Parser)]
#[command(version = natmapadm::pkg_version())]
struct Cli {
    /// The NATMAP control device.
    #[arg(long, default_value = <NatmapHdl>::NATMAP_CTL)]
    device: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Install a SNATMAP rule, rewriting the source of matching
    /// packets.
    AddSnat(RuleArgs),

    /// Install a DNATMAP rule, rewriting the destination of matching
    /// packets.
    AddDnat(RuleArgs),

    /// Remove an installed rule.
    RmRule { id: RuleId },

    /// List the installed rules.
    ListRules,

    /// Print the installed rules as natmapadm command lines.
    Save,

    /// Resolve a set name to its index and family.
    Resolve { name: String },

    /// Restore a set from its definition file, if it does not exist.
    Provision { name: String },
}

#[derive(Args, Debug)]
struct RuleArgs {
    /// A hook to attach the rule to. Defaults to POST_ROUTING for
    /// SNATMAP and PRE_ROUTING for DNATMAP.
    #[arg(long = "hook")]
    hooks: Vec<Hooks>,

    /// The set to look packets up in, and which packet addresses form
    /// the lookup key, e.g. `--nat-set blk src`.
    #[arg(
        long = "nat-set",
        value_names = ["NAME", "FLAGS"],
        num_args = 1..=2,
        allow_hyphen_values = true,
    )]
    nat_set: Vec<String>,
}

fn default_hook(kind: TargetKind) -> Hooks {
    match kind {
        TargetKind::Snat => Hooks::POST_ROUTING,
        TargetKind::Dnat => Hooks::PRE_ROUTING,
    }
}

// Each `--nat-set` occurrence, with its values grouped.
fn nat_set_occurrences(matches: &ArgMatches) -> Vec<Vec<String>> {
    let Some((_, sub)) = matches.subcommand() else {
        return Vec::new();
    };

    match sub.get_occurrences::<String>("nat_set") {
        Some(occs) => occs.map(|vals| vals.cloned().collect()).collect(),
        None => Vec::new(),
    }
}

fn resolver(log: &Logger) -> anyhow::Result<Resolver<SockoptRegistry>> {
    Ok(Resolver::new(SockoptRegistry::open()?, log.clone()))
}

fn add_rule(
    device: &str,
    kind: TargetKind,
    args: RuleArgs,
    nat_sets: Vec<Vec<String>>,
    log: &Logger,
) -> anyhow::Result<()> {
    let resolver = resolver(log)?;
    let prov = Provisioner::new(ProvisionCfg::from_env(), log.clone());

    debug!(log, "encoding rule"; "target" => %kind,
        "nat_set" => ?args.nat_set);
    let mut enc = RuleEncoder::new(kind, &resolver, &prov);
    for occ in &nat_sets {
        let name = occ.first().map(String::as_str).unwrap_or_default();
        enc.parse_nat_set(name, occ.get(1).map(String::as_str))?;
    }
    let record = enc.finish()?;

    let hooks = if args.hooks.is_empty() {
        default_hook(kind)
    } else {
        args.hooks.iter().fold(Hooks::empty(), |acc, h| acc | *h)
    };

    let hdl = NatmapAdm::open(device)?;
    let id = hdl.add_rule(kind, hooks, &record)?;
    println!("{id}");
    Ok(())
}

fn run(cli: Cli, matches: &ArgMatches, log: &Logger) -> anyhow::Result<()> {
    match cli.cmd {
        Command::AddSnat(args) => {
            let occs = nat_set_occurrences(matches);
            add_rule(&cli.device, TargetKind::Snat, args, occs, log)?;
        }

        Command::AddDnat(args) => {
            let occs = nat_set_occurrences(matches);
            add_rule(&cli.device, TargetKind::Dnat, args, occs, log)?;
        }

        Command::RmRule { id } => {
            let hdl = NatmapAdm::open(&cli.device)?;
            hdl.del_rule(id)?;
        }

        Command::ListRules => {
            let hdl = NatmapAdm::open(&cli.device)?;
            print_rules(&resolver(log)?, &hdl.list_rules()?)?;
        }

        Command::Save => {
            let hdl = NatmapAdm::open(&cli.device)?;
            let resp = hdl.list_rules()?;
            save_rules_into(&mut io::stdout(), &resolver(log)?, &resp)?;
        }

        Command::Resolve { name } => {
            println!("{}", resolver(log)?.resolve(&name)?);
        }

        Command::Provision { name } => {
            let prov = Provisioner::new(ProvisionCfg::from_env(), log.clone());
            let (set, how) = prov.ensure(&resolver(log)?, &name)?;
            println!("{set}: {how}");
        }
    }

    Ok(())
}

fn main() -> ExitCode {
    let matches = Cli::command().get_matches();
    let cli = match Cli::from_arg_matches(&matches) {
        Ok(cli) => cli,
        Err(e) => e.exit(),
    };

    let log = natmapadm::logger();
    let res = run(cli, &matches, &log);
    drop(log);

    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("natmapadm: {e:#}");
            ExitCode::from(natmapadm::exit_status(&e))
        }
    }
}
