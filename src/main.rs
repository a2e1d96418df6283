use std::sync::Arc;

use anyhow::{Context, Result};

use auction_engine::payouts::{recover_pending_payouts, AckPayoutProvider};
use auction_engine::store::{load_snapshot_file, save_snapshot_file};
use auction_engine::tasks::start_background_tasks;
use auction_engine::{build_state, load_config};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = load_config().context("load config")?;
    let snapshot_path = cfg.engine.snapshot_path.clone();
    let (state, payout_rx, event_rx) = build_state(cfg);

    let mut restored = false;
    if let Some(path) = &snapshot_path {
        match load_snapshot_file(&state, path) {
            Ok(true) => {
                eprintln!("[main] snapshot_restored path={path}");
                restored = true;
            }
            Ok(false) => eprintln!("[main] no_snapshot path={path}"),
            // A corrupt snapshot is not fatal; the engine starts empty.
            Err(e) => eprintln!("[main] snapshot_restore_failed path={path} err={e:#}"),
        }
    }

    start_background_tasks(
        Arc::clone(&state),
        payout_rx,
        event_rx,
        AckPayoutProvider,
    );
    if restored {
        let recovered = recover_pending_payouts(&state).await;
        eprintln!("[main] payouts_requeued count={recovered}");
    }
    eprintln!(
        "[main] engine_started lock_shards={} sweep_interval_ms={}",
        state.cfg.engine.lock_shards, state.cfg.engine.sweep_interval_ms
    );

    tokio::signal::ctrl_c().await.context("ctrl_c")?;

    if let Some(path) = &snapshot_path {
        match save_snapshot_file(&state, path) {
            Ok(()) => eprintln!("[main] shutdown_snapshot_saved path={path}"),
            Err(e) => eprintln!("[main] shutdown_snapshot_failed path={path} err={e:#}"),
        }
    }
    eprintln!("[main] shutdown");
    Ok(())
}
