//! Oxidized-Cell atomic commit stress harness
//!
//! Runs a concurrent transfer workload over shared cells and checks that
//! the total is conserved.

use anyhow::{bail, Context};
use oc_atomic::{transaction, AtomicCell, MAX_PARTICIPANTS};
use oc_core::config::{Config, StressConfig};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Instant;

const INITIAL_BALANCE: u64 = 1_000_000;

fn main() -> anyhow::Result<()> {
    let path = std::env::args_os().nth(1).map(PathBuf::from);
    let writes_default = path.is_none() && !Config::config_path().exists();
    let config = load_config(path.as_deref()).context("loading config")?;

    oc_core::logging::init(&config.debug);
    tracing::info!("Starting Oxidized-Cell atomic commit stress run");
    if writes_default {
        tracing::info!("Wrote default config to {}", Config::config_path().display());
    }

    let caps = oc_atomic::init(&config.atomic)?;
    tracing::info!(
        "htm: supported={} enabled={}, dcas lock-free={}",
        caps.htm_supported,
        caps.htm_enabled,
        caps.dcas_lock_free
    );

    let stress = &config.stress;
    if stress.cells_per_transfer as usize > MAX_PARTICIPANTS {
        bail!(
            "cells_per_transfer {} exceeds the transaction capacity of {}",
            stress.cells_per_transfer,
            MAX_PARTICIPANTS
        );
    }

    let cells: Vec<AtomicCell> = (0..stress.cells)
        .map(|_| AtomicCell::new(INITIAL_BALANCE))
        .collect();

    oc_atomic::reset_stats();
    let start = Instant::now();
    run_transfers(&cells, stress);
    let elapsed = start.elapsed();

    let expected = INITIAL_BALANCE * stress.cells as u64;
    let total: u64 = cells.iter().map(AtomicCell::load).sum();
    let stats = oc_atomic::stats();
    tracing::info!("{:?}", stats);

    let transfers = stress.threads as u64 * stress.transfers_per_thread as u64;
    tracing::info!(
        "{} transfers in {:.3}s ({:.0}/s)",
        transfers,
        elapsed.as_secs_f64(),
        transfers as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );

    if total != expected {
        bail!("total drifted: expected {}, found {}", expected, total);
    }
    if let Some(index) = cells.iter().position(AtomicCell::is_claimed) {
        bail!("cell {} still claimed after all transfers finished", index);
    }

    tracing::info!("total conserved at {}", total);
    Ok(())
}

/// Read the given config file, or the default one
fn load_config(path: Option<&Path>) -> oc_core::Result<Config> {
    let config = match path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    config.validate()?;
    Ok(config)
}

fn run_transfers(cells: &[AtomicCell], stress: &StressConfig) {
    let width = stress.cells_per_transfer as usize;

    thread::scope(|scope| {
        for t in 0..stress.threads {
            scope.spawn(move || {
                let mut rng = 0x9e37_79b9_7f4a_7c15u64 ^ (t as u64 + 1);
                let mut picks = Vec::with_capacity(width);

                for _ in 0..stress.transfers_per_thread {
                    pick_distinct(&mut rng, cells.len(), width, &mut picks);

                    transaction(|tx| {
                        let source = tx.load(&cells[picks[0]]);
                        let balance = source.old();
                        let share = (balance / (4 * width as u64)).min(100);
                        source.set(balance - share * (width as u64 - 1));

                        for &index in &picks[1..] {
                            let target = tx.load(&cells[index]);
                            let value = target.old();
                            target.set(value + share);
                        }
                    });
                }
            });
        }
    });
}

fn pick_distinct(rng: &mut u64, len: usize, count: usize, out: &mut Vec<usize>) {
    out.clear();
    while out.len() < count {
        *rng ^= *rng << 13;
        *rng ^= *rng >> 7;
        *rng ^= *rng << 17;
        let index = (*rng % len as u64) as usize;
        if !out.contains(&index) {
            out.push(index);
        }
    }
}
