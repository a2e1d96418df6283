use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::AppConfig;
use crate::events::AuctionEvent;
use crate::payouts::PayoutJob;
use crate::store::{
    AuctionStore, LedgerStore, ListingOptionIndex, OptionStore, TransactionStore,
};

/// Monotonic id sources for the records that use integer ids. Restored from
/// the snapshot on startup so ids never repeat across restarts.
pub struct IdGen {
    next_auction: AtomicI64,
    next_bid: AtomicI64,
    next_option: AtomicI64,
    next_option_bid: AtomicI64,
}

impl IdGen {
    fn new() -> Self {
        Self {
            next_auction: AtomicI64::new(1),
            next_bid: AtomicI64::new(1),
            next_option: AtomicI64::new(1),
            next_option_bid: AtomicI64::new(1),
        }
    }

    pub(crate) fn next_auction_id(&self) -> i64 {
        self.next_auction.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_bid_id(&self) -> i64 {
        self.next_bid.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_option_id(&self) -> i64 {
        self.next_option.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_option_bid_id(&self) -> i64 {
        self.next_option_bid.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn peek_auction(&self) -> i64 {
        self.next_auction.load(Ordering::Relaxed)
    }

    pub(crate) fn peek_bid(&self) -> i64 {
        self.next_bid.load(Ordering::Relaxed)
    }

    pub(crate) fn peek_option(&self) -> i64 {
        self.next_option.load(Ordering::Relaxed)
    }

    pub(crate) fn peek_option_bid(&self) -> i64 {
        self.next_option_bid.load(Ordering::Relaxed)
    }

    pub(crate) fn restore(&self, auction: i64, bid: i64, option: i64, option_bid: i64) {
        self.next_auction.store(auction.max(1), Ordering::Relaxed);
        self.next_bid.store(bid.max(1), Ordering::Relaxed);
        self.next_option.store(option.max(1), Ordering::Relaxed);
        self.next_option_bid
            .store(option_bid.max(1), Ordering::Relaxed);
    }
}

#[derive(Default)]
pub struct PerfCounters {
    pub bids_received: AtomicU64,
    pub bids_admitted: AtomicU64,
    pub bids_rejected: AtomicU64,
    pub bid_retractions: AtomicU64,
    pub auctions_closed: AtomicU64,
    pub settlements_posted: AtomicU64,
    pub settlement_failures: AtomicU64,
    pub payouts_enqueued: AtomicU64,
    pub payouts_confirmed: AtomicU64,
    pub payouts_failed: AtomicU64,
    pub payout_retries: AtomicU64,
    pub events_emitted: AtomicU64,
    pub events_dropped: AtomicU64,
}

impl PerfCounters {
    pub fn snapshot_json(&self) -> serde_json::Value {
        serde_json::json!({
            "bids_received": self.bids_received.load(Ordering::Relaxed),
            "bids_admitted": self.bids_admitted.load(Ordering::Relaxed),
            "bids_rejected": self.bids_rejected.load(Ordering::Relaxed),
            "bid_retractions": self.bid_retractions.load(Ordering::Relaxed),
            "auctions_closed": self.auctions_closed.load(Ordering::Relaxed),
            "settlements_posted": self.settlements_posted.load(Ordering::Relaxed),
            "settlement_failures": self.settlement_failures.load(Ordering::Relaxed),
            "payouts_enqueued": self.payouts_enqueued.load(Ordering::Relaxed),
            "payouts_confirmed": self.payouts_confirmed.load(Ordering::Relaxed),
            "payouts_failed": self.payouts_failed.load(Ordering::Relaxed),
            "payout_retries": self.payout_retries.load(Ordering::Relaxed),
            "events_emitted": self.events_emitted.load(Ordering::Relaxed),
            "events_dropped": self.events_dropped.load(Ordering::Relaxed),
        })
    }
}

pub struct AppState {
    pub cfg: AppConfig,
    pub auctions: AuctionStore,
    pub options: OptionStore,
    pub ledger: LedgerStore,
    pub transactions: TransactionStore,
    pub listing_options: ListingOptionIndex,
    pub ids: IdGen,
    pub perf: PerfCounters,
    pub(crate) payout_tx: mpsc::Sender<PayoutJob>,
    pub(crate) event_tx: mpsc::Sender<AuctionEvent>,
}

/// Builds the shared state plus the receive ends of the payout and event
/// queues. The caller hands those to the background tasks.
pub fn build_state(
    cfg: AppConfig,
) -> (
    Arc<AppState>,
    mpsc::Receiver<PayoutJob>,
    mpsc::Receiver<AuctionEvent>,
) {
    let (payout_tx, payout_rx) = mpsc::channel(cfg.payouts.queue_capacity);
    let (event_tx, event_rx) = mpsc::channel(4096);
    let state = Arc::new(AppState {
        auctions: AuctionStore::new(cfg.engine.lock_shards),
        options: OptionStore::new(cfg.engine.lock_shards),
        ledger: LedgerStore::new(),
        transactions: TransactionStore::new(),
        listing_options: ListingOptionIndex::new(),
        ids: IdGen::new(),
        perf: PerfCounters::default(),
        payout_tx,
        event_tx,
        cfg,
    });
    (state, payout_rx, event_rx)
}
