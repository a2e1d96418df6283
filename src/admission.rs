use std::sync::atomic::Ordering;

use chrono::Utc;

use crate::error::EngineError;
use crate::events::{emit, AuctionEvent};
use crate::model::{
    AuctionId, AuctionKind, AuctionStatus, Bid, BidId, BidKind, BidStatus, UserId,
};
use crate::state::AppState;

/// Validates and records a bid inside the auction's exclusive section.
/// Either the bid is fully admitted or the aggregate is unchanged.
pub async fn admit_bid(
    state: &AppState,
    auction_id: AuctionId,
    bidder_id: UserId,
    kind: BidKind,
    amount_cents: i64,
    terms: Option<String>,
) -> Result<Bid, EngineError> {
    state.perf.bids_received.fetch_add(1, Ordering::Relaxed);
    let ids = &state.ids;

    let result = state
        .auctions
        .mutate(auction_id, "admission.admit_bid", |agg| {
            let auction = &agg.auction;
            if auction.status != AuctionStatus::Active {
                return Err(EngineError::AuctionNotActive {
                    auction_id,
                    status: auction.status,
                });
            }
            // The sweeper closes past-due auctions lazily; a bid that arrives
            // first is still rejected.
            if let Some(end) = auction.end_time {
                if end <= Utc::now() {
                    return Err(EngineError::AuctionNotActive {
                        auction_id,
                        status: auction.status,
                    });
                }
            }
            if bidder_id == auction.owner_id {
                return Err(EngineError::SelfBid);
            }
            if amount_cents <= 0 {
                return Err(EngineError::InvalidAmount(amount_cents));
            }

            match (&auction.kind, &kind) {
                (AuctionKind::Sale { reserve_cents }, BidKind::SalePrice) => {
                    match agg.highest_submitted_sale_bid() {
                        // First bid clears at the reserve; later bids must
                        // strictly beat the current highest.
                        None => {
                            if amount_cents < *reserve_cents {
                                return Err(EngineError::BidTooLow {
                                    amount_cents,
                                    floor_cents: *reserve_cents,
                                });
                            }
                        }
                        Some(highest) => {
                            if amount_cents <= highest.amount_cents {
                                return Err(EngineError::BidTooLow {
                                    amount_cents,
                                    floor_cents: highest.amount_cents,
                                });
                            }
                        }
                    }
                }
                (AuctionKind::Services { required }, BidKind::ServiceOffer { category }) => {
                    if !required.contains(category) {
                        return Err(EngineError::ServiceNotRequested(*category));
                    }
                }
                _ => return Err(EngineError::WrongBidKind),
            }

            let bid = Bid {
                bid_id: ids.next_bid_id(),
                auction_id,
                bidder_id,
                kind,
                amount_cents,
                terms: terms.clone(),
                status: BidStatus::Submitted,
                created_at: Utc::now(),
            };
            let mut next = agg.clone();
            next.bids.insert(bid.bid_id, bid.clone());
            Ok((next, bid))
        })
        .await;

    match result {
        Ok(bid) => {
            state.perf.bids_admitted.fetch_add(1, Ordering::Relaxed);
            emit(
                state,
                AuctionEvent::BidPlaced {
                    auction_id,
                    bid_id: bid.bid_id,
                    bidder_id,
                    amount_cents,
                },
            );
            Ok(bid)
        }
        Err(e) => {
            state.perf.bids_rejected.fetch_add(1, Ordering::Relaxed);
            Err(e)
        }
    }
}

/// Withdraws a submitted bid. Only the bidder may retract, and only while
/// the auction is still taking bids.
pub async fn retract_bid(
    state: &AppState,
    auction_id: AuctionId,
    bid_id: BidId,
    caller_id: UserId,
) -> Result<Bid, EngineError> {
    let bid = state
        .auctions
        .mutate(auction_id, "admission.retract_bid", |agg| {
            if agg.auction.status != AuctionStatus::Active {
                return Err(EngineError::BidNotRetractable(bid_id));
            }
            let bid = agg.bids.get(&bid_id).ok_or(EngineError::BidNotFound(bid_id))?;
            if bid.bidder_id != caller_id {
                return Err(EngineError::NotBidOwner(bid_id));
            }
            if bid.status != BidStatus::Submitted {
                return Err(EngineError::BidNotRetractable(bid_id));
            }
            let mut next = agg.clone();
            let b = next
                .bids
                .get_mut(&bid_id)
                .ok_or(EngineError::BidNotFound(bid_id))?;
            b.status = BidStatus::Retracted;
            let retracted = b.clone();
            Ok((next, retracted))
        })
        .await?;

    state.perf.bid_retractions.fetch_add(1, Ordering::Relaxed);
    emit(state, AuctionEvent::BidRetracted { auction_id, bid_id });
    Ok(bid)
}
