use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::Ordering;

use chrono::{DateTime, Utc};

use crate::error::EngineError;
use crate::events::{emit, AuctionEvent};
use crate::model::{
    Auction, AuctionAggregate, AuctionId, AuctionKind, AuctionStatus, BidId, BidKind, BidStatus,
    ListingId, ServiceCategory, Transaction, UserId,
};
use crate::payouts::enqueue_payouts;
use crate::settlement::settle;
use crate::state::AppState;
use crate::SWEEP_SLOW_WARN_MS;

/// What closing an auction produced.
#[derive(Debug)]
pub enum CloseOutcome {
    /// A winner was selected and the settlement posted.
    Settled(Transaction),
    /// No admissible bids; the auction closed without a transaction.
    ClosedNoSale,
    /// Services auction parked in EVALUATING until the owner picks winners.
    AwaitingWinnerSelection,
}

pub async fn create_sale_auction(
    state: &AppState,
    listing_id: ListingId,
    owner_id: UserId,
    reserve_cents: i64,
    is_anonymous: bool,
) -> Result<Auction, EngineError> {
    if reserve_cents < 0 {
        return Err(EngineError::InvalidAmount(reserve_cents));
    }
    Ok(insert_draft(
        state,
        listing_id,
        owner_id,
        AuctionKind::Sale { reserve_cents },
        is_anonymous,
    ))
}

pub async fn create_services_auction(
    state: &AppState,
    listing_id: ListingId,
    owner_id: UserId,
    required: BTreeSet<ServiceCategory>,
    is_anonymous: bool,
) -> Result<Auction, EngineError> {
    if required.is_empty() {
        return Err(EngineError::NoServicesRequested);
    }
    Ok(insert_draft(
        state,
        listing_id,
        owner_id,
        AuctionKind::Services { required },
        is_anonymous,
    ))
}

fn insert_draft(
    state: &AppState,
    listing_id: ListingId,
    owner_id: UserId,
    kind: AuctionKind,
    is_anonymous: bool,
) -> Auction {
    let auction = Auction {
        auction_id: state.ids.next_auction_id(),
        listing_id,
        owner_id,
        kind,
        status: AuctionStatus::Draft,
        is_anonymous,
        start_time: None,
        end_time: None,
        winning_bids: Vec::new(),
        created_at: Utc::now(),
    };
    state.auctions.insert(AuctionAggregate::new(auction.clone()));
    auction
}

/// DRAFT -> ACTIVE. Stamps the start time and the optional end time; the
/// end time is fixed here and never moves afterwards.
pub async fn activate_auction(
    state: &AppState,
    auction_id: AuctionId,
    caller_id: UserId,
    end_time: Option<DateTime<Utc>>,
) -> Result<Auction, EngineError> {
    let auction = state
        .auctions
        .mutate(auction_id, "selection.activate", |agg| {
            if agg.auction.owner_id != caller_id {
                return Err(EngineError::NotAuctionOwner(auction_id));
            }
            if agg.auction.status != AuctionStatus::Draft {
                return Err(EngineError::InvalidTransition {
                    auction_id,
                    from: agg.auction.status,
                    to: AuctionStatus::Active,
                });
            }
            let now = Utc::now();
            if let Some(end) = end_time {
                if end <= now {
                    return Err(EngineError::InvalidTransition {
                        auction_id,
                        from: AuctionStatus::Draft,
                        to: AuctionStatus::Active,
                    });
                }
            }
            let mut next = agg.clone();
            next.auction.status = AuctionStatus::Active;
            next.auction.start_time = Some(now);
            next.auction.end_time = end_time;
            Ok((next.clone(), next.auction))
        })
        .await?;
    emit(state, AuctionEvent::AuctionActivated { auction_id });
    Ok(auction)
}

/// DRAFT/ACTIVE -> CANCELLED. Refused once any bid has been accepted.
/// Outstanding submitted bids are rejected so bidders see a terminal status.
pub async fn cancel_auction(
    state: &AppState,
    auction_id: AuctionId,
    caller_id: UserId,
) -> Result<Auction, EngineError> {
    let auction = state
        .auctions
        .mutate(auction_id, "selection.cancel", |agg| {
            if agg.auction.owner_id != caller_id {
                return Err(EngineError::NotAuctionOwner(auction_id));
            }
            if !matches!(
                agg.auction.status,
                AuctionStatus::Draft | AuctionStatus::Active
            ) {
                return Err(EngineError::InvalidTransition {
                    auction_id,
                    from: agg.auction.status,
                    to: AuctionStatus::Cancelled,
                });
            }
            if agg.has_accepted_bids() {
                return Err(EngineError::AcceptedBidsExist(auction_id));
            }
            let mut next = agg.clone();
            next.auction.status = AuctionStatus::Cancelled;
            for bid in next.bids.values_mut() {
                if bid.status == BidStatus::Submitted {
                    bid.status = BidStatus::Rejected;
                }
            }
            Ok((next.clone(), next.auction))
        })
        .await?;
    emit(state, AuctionEvent::AuctionCancelled { auction_id });
    Ok(auction)
}

/// Takes an ACTIVE auction out of bidding. A sale auction resolves in the
/// same call: highest submitted bid wins, settlement posts, the auction
/// closes. A services auction parks in EVALUATING for the owner.
pub async fn close_auction(
    state: &AppState,
    auction_id: AuctionId,
) -> Result<CloseOutcome, EngineError> {
    enum Prepared {
        Sale(Option<BidId>),
        Services,
    }

    let prepared = state
        .auctions
        .mutate(auction_id, "selection.close.evaluate", |agg| {
            if agg.auction.status != AuctionStatus::Active {
                return Err(EngineError::InvalidTransition {
                    auction_id,
                    from: agg.auction.status,
                    to: AuctionStatus::Evaluating,
                });
            }
            let mut next = agg.clone();
            next.auction.status = AuctionStatus::Evaluating;
            match &agg.auction.kind {
                AuctionKind::Sale { .. } => {
                    let winner = agg.highest_submitted_sale_bid().map(|b| b.bid_id);
                    for bid in next.bids.values_mut() {
                        if bid.status != BidStatus::Submitted {
                            continue;
                        }
                        bid.status = if Some(bid.bid_id) == winner {
                            BidStatus::Accepted
                        } else {
                            BidStatus::Rejected
                        };
                    }
                    Ok((next, Prepared::Sale(winner)))
                }
                AuctionKind::Services { .. } => Ok((next, Prepared::Services)),
            }
        })
        .await?;

    match prepared {
        Prepared::Services => Ok(CloseOutcome::AwaitingWinnerSelection),
        Prepared::Sale(None) => {
            finalize_closed(state, auction_id, Vec::new()).await?;
            Ok(CloseOutcome::ClosedNoSale)
        }
        Prepared::Sale(Some(winner)) => {
            // A settlement failure here leaves the auction in EVALUATING for
            // the operator; the winner marking is already durable.
            let tx = settle(state, auction_id, &[winner]).await?;
            finalize_closed(state, auction_id, vec![winner]).await?;
            enqueue_payouts(state, &tx).await;
            Ok(CloseOutcome::Settled(tx))
        }
    }
}

/// Owner-selected winners for a services auction in EVALUATING. At most one
/// winner per category; an empty set closes the auction with no transaction.
pub async fn select_service_winners(
    state: &AppState,
    auction_id: AuctionId,
    caller_id: UserId,
    winner_ids: &[BidId],
) -> Result<CloseOutcome, EngineError> {
    state
        .auctions
        .mutate(auction_id, "selection.select_winners", |agg| {
            if agg.auction.owner_id != caller_id {
                return Err(EngineError::NotAuctionOwner(auction_id));
            }
            if agg.auction.status != AuctionStatus::Evaluating {
                return Err(EngineError::InvalidTransition {
                    auction_id,
                    from: agg.auction.status,
                    to: AuctionStatus::Closed,
                });
            }
            let required = match &agg.auction.kind {
                AuctionKind::Services { required } => required.clone(),
                AuctionKind::Sale { .. } => {
                    return Err(EngineError::InvalidWinnerSet(
                        "sale auctions select winners automatically".to_string(),
                    ))
                }
            };

            let mut per_category: BTreeMap<ServiceCategory, BidId> = BTreeMap::new();
            for bid_id in winner_ids {
                let bid = agg
                    .bids
                    .get(bid_id)
                    .ok_or(EngineError::BidNotFound(*bid_id))?;
                if bid.status != BidStatus::Submitted {
                    return Err(EngineError::InvalidWinnerSet(format!(
                        "bid {bid_id} is not open"
                    )));
                }
                let category = match bid.kind {
                    BidKind::ServiceOffer { category } => category,
                    BidKind::SalePrice => {
                        return Err(EngineError::InvalidWinnerSet(format!(
                            "bid {bid_id} is not a service offer"
                        )))
                    }
                };
                if !required.contains(&category) {
                    return Err(EngineError::ServiceNotRequested(category));
                }
                if per_category.insert(category, *bid_id).is_some() {
                    return Err(EngineError::InvalidWinnerSet(format!(
                        "two winners for category {}",
                        category.as_str()
                    )));
                }
            }

            let winner_set: BTreeSet<BidId> = winner_ids.iter().copied().collect();
            let mut next = agg.clone();
            for bid in next.bids.values_mut() {
                if bid.status != BidStatus::Submitted {
                    continue;
                }
                bid.status = if winner_set.contains(&bid.bid_id) {
                    BidStatus::Accepted
                } else {
                    BidStatus::Rejected
                };
            }
            Ok((next, ()))
        })
        .await?;

    if winner_ids.is_empty() {
        finalize_closed(state, auction_id, Vec::new()).await?;
        return Ok(CloseOutcome::ClosedNoSale);
    }

    let tx = settle(state, auction_id, winner_ids).await?;
    finalize_closed(state, auction_id, winner_ids.to_vec()).await?;
    enqueue_payouts(state, &tx).await;
    Ok(CloseOutcome::Settled(tx))
}

/// EVALUATING -> CLOSED, recording the winning bid ids on the auction.
async fn finalize_closed(
    state: &AppState,
    auction_id: AuctionId,
    winning_bids: Vec<BidId>,
) -> Result<(), EngineError> {
    let winners = state
        .auctions
        .mutate(auction_id, "selection.close.finalize", |agg| {
            if agg.auction.status != AuctionStatus::Evaluating {
                return Err(EngineError::InvalidTransition {
                    auction_id,
                    from: agg.auction.status,
                    to: AuctionStatus::Closed,
                });
            }
            let mut next = agg.clone();
            next.auction.status = AuctionStatus::Closed;
            next.auction.winning_bids = winning_bids.clone();
            Ok((next, winning_bids.clone()))
        })
        .await?;
    state.perf.auctions_closed.fetch_add(1, Ordering::Relaxed);
    emit(
        state,
        AuctionEvent::AuctionClosed {
            auction_id,
            winning_bids: winners,
        },
    );
    Ok(())
}

/// Closes every ACTIVE auction whose end time has passed. Called on a timer;
/// failures on individual auctions are logged and skipped.
pub async fn sweep_due_auctions(state: &AppState) -> usize {
    let started = std::time::Instant::now();
    let now = Utc::now();
    let mut closed = 0usize;
    for id in state.auctions.ids() {
        let Ok(agg) = state.auctions.get(id) else {
            continue;
        };
        if agg.auction.status != AuctionStatus::Active {
            continue;
        }
        let Some(end) = agg.auction.end_time else {
            continue;
        };
        if end > now {
            continue;
        }
        match close_auction(state, id).await {
            Ok(_) => closed += 1,
            // Lost a race with a manual close, or the auction needs an
            // operator; either way the sweep moves on.
            Err(e) => eprintln!(
                "[sweeper] close_failed auction_id={id} class={} err={e}",
                e.class().as_str()
            ),
        }
    }
    let elapsed_ms = started.elapsed().as_millis();
    if elapsed_ms >= SWEEP_SLOW_WARN_MS {
        eprintln!("[sweeper] slow_sweep closed={closed} elapsed_ms={elapsed_ms}");
    }
    closed
}
