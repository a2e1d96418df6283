use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::model::{AuctionId, BidId, OptionBidId, OptionId, UserId};
use crate::state::AppState;

/// History events published on the internal bus. Delivery is best effort:
/// a full queue drops the event and bumps a counter, it never blocks or
/// fails the operation that produced it.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuctionEvent {
    BidPlaced {
        auction_id: AuctionId,
        bid_id: BidId,
        bidder_id: UserId,
        amount_cents: i64,
    },
    BidRetracted {
        auction_id: AuctionId,
        bid_id: BidId,
    },
    AuctionActivated {
        auction_id: AuctionId,
    },
    AuctionClosed {
        auction_id: AuctionId,
        winning_bids: Vec<BidId>,
    },
    AuctionCancelled {
        auction_id: AuctionId,
    },
    SettlementPosted {
        auction_id: AuctionId,
        transaction_id: Uuid,
        gross_cents: i64,
        commission_cents: i64,
    },
    TransactionSettled {
        transaction_id: Uuid,
    },
    TransactionFailed {
        transaction_id: Uuid,
        reason: String,
    },
    OptionActivated {
        option_id: OptionId,
        winning_bid: OptionBidId,
        holder_id: UserId,
        price_cents: i64,
        expires_at: DateTime<Utc>,
    },
    OptionExercised {
        option_id: OptionId,
    },
    OptionExpired {
        option_id: OptionId,
    },
}

pub(crate) fn emit(state: &AppState, event: AuctionEvent) {
    match state.event_tx.try_send(event) {
        Ok(()) => {
            state
                .perf
                .events_emitted
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        Err(_) => {
            state
                .perf
                .events_dropped
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }
}
