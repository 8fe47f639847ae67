// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 labhub contributors

//! labhub-recover - diagnose and repair DataBlock regions
//!
//! Exit codes mirror the recovery outcome taxonomy:
//! 0 SUCCESS, 1 FAILED, 2 UNSAFE, 3 NOT_STUCK, 4 INVALID_SLOT,
//! 5 usage error.

use clap::{Parser, Subcommand};
use colored::Colorize;
use labhub::{Recovery, RecoveryOutcome, SlotDiagnostic};
use std::time::Duration;

const EXIT_USAGE: i32 = 5;

/// Diagnose and repair labhub DataBlock regions
#[derive(Parser, Debug)]
#[command(name = "labhub-recover")]
#[command(version)]
#[command(about = "Diagnose and repair labhub shared-memory regions")]
struct Args {
    /// Stuck threshold in milliseconds for diagnosis
    #[arg(long, default_value_t = 5000)]
    stuck_ms: u64,

    /// Stale threshold in milliseconds for consumer classification
    #[arg(long, default_value_t = 5000)]
    stale_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show per-slot and per-consumer state of a region
    Diagnose {
        /// Region name
        name: String,
    },
    /// Move one slot back to FREE
    ResetSlot {
        name: String,
        /// Slot index
        index: u32,
        /// Override the live-writer safety check
        #[arg(long)]
        force: bool,
    },
    /// Move every slot back to FREE
    ResetAll {
        name: String,
        #[arg(long)]
        force: bool,
    },
    /// Reconcile a slot's reader count with the heartbeat table
    ReleaseReaders {
        name: String,
        index: u32,
        /// Evict live readers as well
        #[arg(long)]
        force: bool,
    },
    /// Free a slot held by a dead writer
    ReleaseWriter {
        name: String,
        index: u32,
    },
    /// Sweep dead consumers out of the heartbeat table
    CleanupConsumers {
        name: String,
    },
    /// Verify region integrity
    Validate {
        name: String,
        /// Repair what can be repaired without touching live writers
        #[arg(long)]
        repair: bool,
    },
}

fn main() {
    env_logger::init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // Help/version are not usage errors.
            if e.use_stderr() {
                eprintln!("{e}");
                std::process::exit(EXIT_USAGE);
            }
            println!("{e}");
            std::process::exit(0);
        }
    };

    std::process::exit(run(&args));
}

fn open_region(args: &Args, name: &str) -> Result<Recovery, i32> {
    match Recovery::open(name) {
        Ok(recovery) => Ok(recovery
            .stuck_threshold(Duration::from_millis(args.stuck_ms))
            .stale_threshold(Duration::from_millis(args.stale_ms))),
        Err(e) => {
            eprintln!("{}: {e}", "error".red().bold());
            Err(RecoveryOutcome::Failed.exit_code())
        }
    }
}

fn run(args: &Args) -> i32 {
    let name = match &args.command {
        Command::Diagnose { name }
        | Command::ResetSlot { name, .. }
        | Command::ResetAll { name, .. }
        | Command::ReleaseReaders { name, .. }
        | Command::ReleaseWriter { name, .. }
        | Command::CleanupConsumers { name }
        | Command::Validate { name, .. } => name.clone(),
    };

    let recovery = match open_region(args, &name) {
        Ok(recovery) => recovery,
        Err(code) => return code,
    };

    match &args.command {
        Command::Diagnose { .. } => {
            print_diagnosis(&recovery);
            0
        }
        Command::ResetSlot { index, force, .. } => {
            finish(recovery.force_reset_slot(*index, *force))
        }
        Command::ResetAll { force, .. } => finish(recovery.force_reset_all_slots(*force)),
        Command::ReleaseReaders { index, force, .. } => {
            finish(recovery.release_zombie_readers(*index, *force))
        }
        Command::ReleaseWriter { index, .. } => finish(recovery.release_zombie_writer(*index)),
        Command::CleanupConsumers { .. } => {
            let swept = recovery.cleanup_dead_consumers();
            println!("swept {} dead consumer(s)", swept.to_string().yellow());
            finish(RecoveryOutcome::Success)
        }
        Command::Validate { repair, .. } => finish(recovery.validate_integrity(*repair)),
    }
}

fn finish(outcome: RecoveryOutcome) -> i32 {
    let badge = match outcome {
        RecoveryOutcome::Success => outcome.to_string().green(),
        RecoveryOutcome::NotStuck => outcome.to_string().cyan(),
        RecoveryOutcome::Unsafe => outcome.to_string().yellow(),
        RecoveryOutcome::Failed | RecoveryOutcome::InvalidSlot => outcome.to_string().red(),
    };
    println!("{badge}");
    if outcome == RecoveryOutcome::Unsafe {
        println!(
            "{}",
            "the writer PID is alive (or recycled); verify the process before re-running with --force"
                .dimmed()
        );
    }
    outcome.exit_code()
}

fn state_name(raw: u8) -> &'static str {
    match raw {
        0 => "FREE",
        1 => "WRITING",
        2 => "COMMITTED",
        3 => "DRAINING",
        _ => "CORRUPT",
    }
}

fn print_slot(diag: &SlotDiagnostic) {
    let state = match diag.slot_state {
        0 => state_name(0).dimmed(),
        1 => state_name(1).yellow(),
        2 => state_name(2).green(),
        3 => state_name(3).yellow(),
        _ => "CORRUPT".red().bold(),
    };

    let mut line = format!(
        "  slot {:>3}  {:<9}  gen={:<8}  readers={:<3}  lock={}",
        diag.slot_index, state, diag.write_generation, diag.reader_count, diag.write_lock
    );
    if diag.writer_waiting {
        line.push_str("  writer-waiting");
    }
    if diag.is_stuck {
        line.push_str(&format!(
            "  {} ({} ms)",
            "STUCK".red().bold(),
            diag.stuck_duration_ms
        ));
    }
    println!("{line}");
}

fn print_diagnosis(recovery: &Recovery) {
    println!();
    println!("{}", format!("=== region '{}' ===", recovery.name()).bold());

    let producer = recovery.producer_pid();
    let producer_badge = if producer == 0 {
        "none".dimmed()
    } else if recovery.producer_alive() {
        format!("{producer} (alive)").green()
    } else {
        format!("{producer} (dead)").red()
    };
    println!("  producer: {producer_badge}");
    println!();

    for diag in recovery.diagnose_all_slots() {
        print_slot(&diag);
    }

    let consumers = recovery.diagnose_consumers();
    println!();
    if consumers.is_empty() {
        println!("  {}", "no consumers attached".dimmed());
    } else {
        for c in consumers {
            let liveness = if c.alive {
                "alive".green()
            } else {
                "dead".red()
            };
            let staleness = if c.stale { " stale".yellow() } else { "".normal() };
            let reading = c
                .reading_slot
                .map_or(String::new(), |s| format!("  reading slot {s}"));
            println!(
                "  consumer {:016x}{:016x}  pid={} ({liveness}{staleness}){reading}",
                c.uid.0, c.uid.1, c.pid
            );
        }
    }
    println!();
}
