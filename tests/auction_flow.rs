use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use auction_engine::admission::admit_bid;
use auction_engine::config::{
    AppConfig, CommissionTier, EngineConfig, FeesConfig, PayoutConfig,
};
use auction_engine::error::EngineError;
use auction_engine::model::{
    AuctionStatus, BidKind, EntryType, PayoutStatus, TransactionStatus, ACCOUNT_ESCROW,
    ACCOUNT_PLATFORM_REVENUE, ACCOUNT_SELLER_PAYABLE,
};
use auction_engine::payouts::{recover_pending_payouts, run_dispatcher, AckPayoutProvider};
use auction_engine::selection::{
    activate_auction, close_auction, create_sale_auction, CloseOutcome,
};
use auction_engine::state::AppState;
use auction_engine::store::{load_snapshot_file, save_snapshot_file};
use auction_engine::build_state;

fn config() -> AppConfig {
    AppConfig {
        engine: EngineConfig {
            lock_shards: 16,
            sweep_interval_ms: 50,
            snapshot_path: None,
            snapshot_interval_secs: 3600,
        },
        fees: FeesConfig {
            commission_tiers: vec![CommissionTier {
                min_sale_cents: 0,
                rate_ppm: 50_000,
            }],
        },
        payouts: PayoutConfig {
            queue_capacity: 64,
            max_attempts: 3,
            retry_base_ms: 1,
            retry_max_ms: 4,
        },
    }
}

async fn active_sale(state: &AppState, reserve_cents: i64) -> i64 {
    let auction = create_sale_auction(state, 1, 10, reserve_cents, false)
        .await
        .unwrap();
    activate_auction(
        state,
        auction.auction_id,
        10,
        Some(Utc::now() + chrono::Duration::hours(1)),
    )
    .await
    .unwrap();
    auction.auction_id
}

#[tokio::test]
async fn identical_concurrent_bids_admit_exactly_one() {
    let (state, _prx, _erx) = build_state(config());
    let id = active_sale(&state, 100_000).await;

    let mut handles = Vec::new();
    for i in 0..16i64 {
        let state = Arc::clone(&state);
        handles.push(tokio::spawn(async move {
            admit_bid(&state, id, 100 + i, BidKind::SalePrice, 150_000, None).await
        }));
    }
    let mut admitted = 0;
    let mut too_low = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => admitted += 1,
            Err(EngineError::BidTooLow { .. }) => too_low += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(admitted, 1);
    assert_eq!(too_low, 15);

    match close_auction(&state, id).await.unwrap() {
        CloseOutcome::Settled(tx) => assert_eq!(tx.total_sale_cents, 150_000),
        other => panic!("expected settlement, got {other:?}"),
    }
}

#[tokio::test]
async fn full_sale_lifecycle_settles_ledger_and_payout() {
    let (state, prx, _erx) = build_state(config());
    tokio::spawn(run_dispatcher(Arc::clone(&state), prx, AckPayoutProvider));

    // Reserve $1000; bids of $1200 and $1500, with an $1100 attempt in
    // between that fails to beat the floor.
    let id = active_sale(&state, 100_000).await;
    admit_bid(&state, id, 20, BidKind::SalePrice, 120_000, None)
        .await
        .unwrap();
    let err = admit_bid(&state, id, 21, BidKind::SalePrice, 110_000, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::BidTooLow {
            floor_cents: 120_000,
            ..
        }
    ));
    admit_bid(&state, id, 22, BidKind::SalePrice, 150_000, None)
        .await
        .unwrap();

    let tx = match close_auction(&state, id).await.unwrap() {
        CloseOutcome::Settled(tx) => tx,
        other => panic!("expected settlement, got {other:?}"),
    };

    // 5% commission on $1500 is $75; the seller nets $1425.
    assert_eq!(tx.commission_cents, 7_500);
    assert_eq!(tx.payouts.len(), 1);
    assert_eq!(tx.payouts[0].payee_id, 10);
    assert_eq!(tx.payouts[0].amount_cents, 142_500);

    let entries = state.ledger.entries_for(tx.transaction_id);
    let debit: i64 = entries
        .iter()
        .filter(|e| e.entry_type == EntryType::Debit)
        .map(|e| e.amount_cents)
        .sum();
    let credit: i64 = entries
        .iter()
        .filter(|e| e.entry_type == EntryType::Credit)
        .map(|e| e.amount_cents)
        .sum();
    assert_eq!(debit, credit);
    assert!(entries
        .iter()
        .any(|e| e.account == ACCOUNT_ESCROW && e.amount_cents == 150_000));
    assert!(entries
        .iter()
        .any(|e| e.account == ACCOUNT_SELLER_PAYABLE && e.amount_cents == 142_500));
    assert!(entries
        .iter()
        .any(|e| e.account == ACCOUNT_PLATFORM_REVENUE && e.amount_cents == 7_500));

    // The dispatcher confirms the payout and the transaction settles.
    let mut settled = None;
    for _ in 0..200 {
        let current = state.transactions.get(tx.transaction_id).unwrap();
        if current.status == TransactionStatus::Settled {
            settled = Some(current);
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let settled = settled.expect("transaction never settled");
    assert_eq!(settled.payouts[0].status, PayoutStatus::Confirmed);
    assert!(settled.payouts[0].external_payout_id.is_some());

    let agg = state.auctions.get(id).unwrap();
    assert_eq!(agg.auction.status, AuctionStatus::Closed);
    assert_eq!(agg.auction.winning_bids.len(), 1);
}

#[tokio::test]
async fn concurrent_closes_settle_exactly_once() {
    let (state, _prx, _erx) = build_state(config());
    let id = active_sale(&state, 1_000).await;
    admit_bid(&state, id, 20, BidKind::SalePrice, 5_000, None)
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let state = Arc::clone(&state);
        handles.push(tokio::spawn(async move { close_auction(&state, id).await }));
    }
    let mut settlements = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(CloseOutcome::Settled(_)) => settlements += 1,
            Ok(other) => panic!("unexpected outcome: {other:?}"),
            Err(EngineError::InvalidTransition { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(settlements, 1);

    let tx = state.transactions.get_by_auction(id).unwrap();
    assert_eq!(state.ledger.entries_for(tx.transaction_id).len(), 3);
    assert_eq!(
        state
            .perf
            .settlements_posted
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );
}

#[tokio::test]
async fn snapshot_round_trips_engine_state() {
    let (state, _prx, _erx) = build_state(config());
    let id = active_sale(&state, 1_000).await;
    admit_bid(&state, id, 20, BidKind::SalePrice, 5_000, None)
        .await
        .unwrap();
    close_auction(&state, id).await.unwrap();

    let path = std::env::temp_dir().join(format!("auction-engine-test-{}.snap", std::process::id()));
    let path = path.to_string_lossy().into_owned();
    save_snapshot_file(&state, &path).unwrap();

    let (restored, _prx2, _erx2) = build_state(config());
    assert!(load_snapshot_file(&restored, &path).unwrap());
    std::fs::remove_file(&path).ok();

    let agg = restored.auctions.get(id).unwrap();
    assert_eq!(agg.auction.status, AuctionStatus::Closed);
    assert_eq!(agg.bids.len(), 1);
    let tx = restored.transactions.get_by_auction(id).unwrap();
    assert_eq!(tx.total_sale_cents, 5_000);
    assert!(!restored.ledger.entries_for(tx.transaction_id).is_empty());

    // Fresh ids continue after the restored counters.
    let next = create_sale_auction(&restored, 9, 10, 1_000, false)
        .await
        .unwrap();
    assert!(next.auction_id > id);
}

#[tokio::test]
async fn restart_requeues_unconfirmed_payouts_until_settled() {
    // No dispatcher runs in the first life, so the transaction is snapshotted
    // with its payout still pending.
    let (state, _prx, _erx) = build_state(config());
    let id = active_sale(&state, 1_000).await;
    admit_bid(&state, id, 20, BidKind::SalePrice, 5_000, None)
        .await
        .unwrap();
    let tx = match close_auction(&state, id).await.unwrap() {
        CloseOutcome::Settled(tx) => tx,
        other => panic!("expected settlement, got {other:?}"),
    };
    assert_eq!(tx.status, TransactionStatus::PendingSettlement);
    assert_eq!(tx.payouts[0].status, PayoutStatus::Pending);

    let path = std::env::temp_dir().join(format!(
        "auction-engine-recover-{}.snap",
        std::process::id()
    ));
    let path = path.to_string_lossy().into_owned();
    save_snapshot_file(&state, &path).unwrap();

    let (restored, prx2, _erx2) = build_state(config());
    assert!(load_snapshot_file(&restored, &path).unwrap());
    std::fs::remove_file(&path).ok();

    tokio::spawn(run_dispatcher(Arc::clone(&restored), prx2, AckPayoutProvider));
    assert_eq!(recover_pending_payouts(&restored).await, 1);

    let mut settled = None;
    for _ in 0..200 {
        let current = restored.transactions.get(tx.transaction_id).unwrap();
        if current.status == TransactionStatus::Settled {
            settled = Some(current);
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let settled = settled.expect("restored transaction never settled");
    assert_eq!(settled.payouts[0].status, PayoutStatus::Confirmed);
    assert!(settled.payouts[0].external_payout_id.is_some());
}
