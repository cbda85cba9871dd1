mod commands;
mod logging;
mod progress;

use std::io;
use std::process;
use std::sync::Arc;

use clap::{CommandFactory, Parser};
use colored::*;
use commands::{Cli, Commands};
use dotenv::dotenv;
use mediavault_core::analysis::{RemovalPlan, RemovalStatus};
use mediavault_core::config::{self, AppConfig};
use mediavault_core::migration::SystemClock;
use mediavault_core::storage::models::{DuplicateGroup, LocationKind, LocationSpec, MatchKind};
use mediavault_core::sync::Resolution;
use mediavault_core::{
    ContentHash, Error, KeepStrategy, ResolutionStrategy, Result, Rule, RunSummary, Vault,
};
use progress::CliReporter;
use serde::Serialize;
use tracing::{error, info};

/// Exit codes: 0 success, 1 some items failed, 2 configuration error.
fn main() {
    dotenv().ok();
    let code = {
        let _guard = logging::init_logger();
        let args = Cli::parse();
        match run(&args) {
            Ok(code) => code,
            Err(err) if err.is_configuration() => {
                error!("Configuration error: {}", err);
                2
            }
            Err(err) => {
                error!("Error: {}", err);
                1
            }
        }
    };
    process::exit(code);
}

fn run(args: &Cli) -> Result<i32> {
    let Some(command) = &args.command else {
        Cli::command().print_long_help()?;
        return Ok(0);
    };

    let config = match &args.config {
        Some(path) => config::load_from(path)?,
        None => config::load_configuration()?,
    };
    let json = args.json;
    let open = || open_vault(&config);

    match command {
        Commands::RegisterLocation {
            name,
            root,
            kind,
            priority,
            default,
            rules,
        } => {
            let vault = open()?;
            let spec = LocationSpec {
                name: name.clone(),
                kind: kind.parse::<LocationKind>()?,
                root: root.clone(),
                priority: *priority,
                rules: parse_rules(rules)?,
                default: *default,
            };
            let location = vault.register_location(&spec)?;
            if json {
                print_json(&location)?;
            } else {
                println!(
                    "Registered {} ({} at {}, priority {})",
                    location.name.green(),
                    location.kind,
                    location.root,
                    location.priority
                );
            }
            Ok(0)
        }
        Commands::Scan { location } => {
            let vault = open()?;
            let summary = match location.as_deref() {
                None | Some("all") => vault.scan_all()?,
                Some(name) => vault.scan(name)?,
            };
            report(&summary, json)
        }
        Commands::Migrate { dry_run } => {
            let vault = open()?;
            let (plan, summary) = vault.migrate(*dry_run)?;
            if *dry_run && !json {
                for action in &plan.actions {
                    println!("  {} {}", "plan".cyan(), action);
                }
            }
            report(&summary, json)
        }
        Commands::Schedule => run_scheduler(&open()?),
        Commands::SyncStatus => {
            let vault = open()?;
            let status = vault.sync_status()?;
            if json {
                print_json(&status)?;
                return Ok(0);
            }
            let stats = &status.stats;
            println!(
                "{} locations, {} assets, {} live copies, {} missing",
                stats.locations, stats.assets, stats.live_observations, stats.missing_observations
            );
            println!(
                "{} open conflicts, {} resolved",
                format!("{}", stats.open_conflicts).red(),
                stats.resolved_conflicts
            );
            for conflict in &status.open_conflicts {
                println!(
                    "  {} {} {} ({} copies)",
                    format!("#{}", conflict.id).yellow(),
                    conflict.content_hash,
                    conflict.reason.as_str(),
                    conflict.observations.len()
                );
            }
            Ok(0)
        }
        Commands::ResolveConflict { hash, strategy } => {
            let vault = open()?;
            let hash = ContentHash::parse(hash)?;
            let strategy = strategy
                .as_deref()
                .map(str::parse::<ResolutionStrategy>)
                .transpose()?;
            let resolutions = vault.resolve_conflict(&hash, strategy)?;
            if json {
                print_json(&resolutions)?;
                return Ok(0);
            }
            for resolution in &resolutions {
                match resolution {
                    Resolution::Resolved { winner, removed } => {
                        println!(
                            "{} {}:{} is canonical",
                            "resolved".green(),
                            winner.location,
                            winner.path
                        );
                        for loser in removed {
                            println!("  {} {}:{}", "deleted".red(), loser.location, loser.path);
                        }
                    }
                    Resolution::Deferred => {
                        println!("{} left open for manual resolution", "deferred".yellow())
                    }
                }
            }
            Ok(0)
        }
        Commands::Verify { hash } => {
            let vault = open()?;
            let hash = hash.as_deref().map(ContentHash::parse).transpose()?;
            let summary = vault.verify(hash.as_ref())?;
            report(&summary, json)
        }
        Commands::DedupReport { threshold } => {
            let vault = open()?;
            let groups = vault.dedup_report(*threshold)?;
            if json {
                print_json(&groups)?;
            } else {
                print_groups(&groups);
            }
            Ok(0)
        }
        Commands::DedupRemove { strategy, dry_run } => {
            let vault = open()?;
            let strategy: KeepStrategy = strategy.parse()?;
            let (plans, summary) = vault.dedup_remove(strategy, *dry_run)?;
            if json {
                print_json(&serde_json::json!({ "plans": plans, "summary": summary }))?;
                return Ok(summary.exit_code());
            }
            print_plans(&plans);
            report(&summary, json)
        }
        Commands::PurgeMissing => {
            let vault = open()?;
            let purged = vault.purge_missing()?;
            if json {
                print_json(&serde_json::json!({ "purged": purged }))?;
            } else {
                println!("{} missing copies purged", purged);
            }
            Ok(0)
        }
        Commands::PrintConfig => print_config(&config, json),
    }
}

/// Open the registry and bring its locations in line with the config.
fn open_vault(config: &AppConfig) -> Result<Vault> {
    let vault = Vault::open(config.clone())?.with_reporter(Arc::new(CliReporter::new()));
    vault.apply_locations()?;
    Ok(vault)
}

fn parse_rules(rules: &[String]) -> Result<Vec<Rule>> {
    rules
        .iter()
        .map(|raw| {
            serde_json::from_str::<Rule>(raw)
                .map_err(|e| Error::InvalidConfig(format!("bad rule '{}': {}", raw, e)))
        })
        .collect()
}

fn run_scheduler(vault: &Vault) -> Result<i32> {
    let handle = vault
        .migration_scheduler(Arc::new(SystemClock))
        .spawn();
    info!(
        "Migrating every {}s; press Enter to stop",
        vault.config().migration.interval_secs
    );
    let mut line = String::new();
    let stdin = io::stdin().read_line(&mut line);
    vault.cancel();
    handle.shutdown();
    stdin?;
    Ok(0)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_config(config: &AppConfig, json: bool) -> Result<i32> {
    if json {
        print_json(config)?;
    } else {
        println!("Configuration: {:#?}", config);
    }
    Ok(0)
}

/// Print a run summary and turn it into an exit code.
fn report(summary: &RunSummary, json: bool) -> Result<i32> {
    if json {
        print_json(summary)?;
        return Ok(summary.exit_code());
    }
    println!();
    info!(
        "{}: {} succeeded, {} skipped, {} failed in {}{}",
        summary.operation,
        format!("{}", summary.succeeded).green(),
        format!("{}", summary.skipped).yellow(),
        format!("{}", summary.failed).red(),
        format!("{:.2}s", summary.duration_secs).green(),
        if summary.cancelled { " (cancelled)" } else { "" }
    );
    for (name, value) in &summary.counters {
        println!("  {:<20} {}", name, value);
    }
    for issue in &summary.issues {
        println!("  {:?} {}: {}", issue.kind, issue.subject.bold(), issue.reason);
    }
    Ok(summary.exit_code())
}

fn print_groups(groups: &[DuplicateGroup]) {
    let wasted: u64 = groups.iter().map(DuplicateGroup::wasted_bytes).sum();
    info!(
        "{} duplicate groups, {} bytes reclaimable",
        format!("{}", groups.len()).red(),
        format!("{}", wasted).red(),
    );
    for group in groups {
        let label = match group.kind {
            MatchKind::Exact => "exact".red(),
            MatchKind::Similar => "similar".yellow(),
        };
        println!("{} group {} ({} copies)", label, group.id, group.members.len());
        for (i, member) in group.members.iter().enumerate() {
            let marker = if i == group.representative { "*" } else { " " };
            println!(
                "  {} {}:{} {} bytes, distance {}",
                marker, member.location, member.path, member.size, member.distance
            );
        }
    }
}

fn print_plans(plans: &[RemovalPlan]) {
    for plan in plans {
        println!(
            "group {}: keep {}:{}",
            plan.group_id,
            plan.keep.location.green(),
            plan.keep.path
        );
        for item in &plan.items {
            let status = match &item.status {
                RemovalStatus::Planned => "would remove".cyan(),
                RemovalStatus::Removed => "removed".red(),
                RemovalStatus::Skipped(_) => "skipped".yellow(),
                RemovalStatus::Failed(_) => "failed".red().bold(),
            };
            let reason = match &item.status {
                RemovalStatus::Skipped(reason) | RemovalStatus::Failed(reason) => {
                    format!(" ({})", reason)
                }
                _ => String::new(),
            };
            println!(
                "  {} {}:{}{}",
                status, item.member.location, item.member.path, reason
            );
        }
    }
}
