use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::events::AuctionEvent;
use crate::options::sweep_expired_options;
use crate::payouts::{run_dispatcher, PayoutJob, PayoutProvider};
use crate::selection::sweep_due_auctions;
use crate::state::AppState;
use crate::store::save_snapshot_file;

const OPTION_SWEEP_INTERVAL_MS: u64 = 1_000;
const PERF_REPORT_INTERVAL_SECS: u64 = 30;

/// Spawns the long-running workers: the auction end-time sweeper, the option
/// expiry sweeper, the payout dispatcher, the event drain and the snapshot
/// writer. All of them run until the process exits.
pub fn start_background_tasks<P: PayoutProvider>(
    state: Arc<AppState>,
    payout_rx: mpsc::Receiver<PayoutJob>,
    event_rx: mpsc::Receiver<AuctionEvent>,
    provider: P,
) {
    {
        let state = Arc::clone(&state);
        let interval = state.cfg.engine.sweep_interval_ms;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval.max(1)));
            loop {
                ticker.tick().await;
                sweep_due_auctions(&state).await;
            }
        });
    }

    {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(OPTION_SWEEP_INTERVAL_MS));
            loop {
                ticker.tick().await;
                sweep_expired_options(&state).await;
            }
        });
    }

    tokio::spawn(run_dispatcher(Arc::clone(&state), payout_rx, provider));
    tokio::spawn(drain_events(event_rx));

    if let Some(path) = state.cfg.engine.snapshot_path.clone() {
        let state = Arc::clone(&state);
        let interval = state.cfg.engine.snapshot_interval_secs.max(1) as u64;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval));
            ticker.tick().await; // skip the immediate first tick
            loop {
                ticker.tick().await;
                if let Err(e) = save_snapshot_file(&state, &path) {
                    eprintln!("[snapshot] save_failed path={path} err={e:#}");
                }
            }
        });
    }

    {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(PERF_REPORT_INTERVAL_SECS));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                eprintln!("[perf] {}", state.perf.snapshot_json());
            }
        });
    }
}

/// Consumes the history event queue and writes each event to stderr as one
/// JSON line. Consumers that need durable history tail this stream.
async fn drain_events(mut rx: mpsc::Receiver<AuctionEvent>) {
    while let Some(event) = rx.recv().await {
        match serde_json::to_string(&event) {
            Ok(json) => eprintln!("[events] {json}"),
            Err(e) => eprintln!("[events] serialize_failed err={e}"),
        }
    }
}
