use std::sync::atomic::Ordering;

use crate::error::EngineError;
use crate::events::{emit, AuctionEvent};
use crate::model::{
    AuctionId, BidId, BidKind, BidStatus, EntryType, LedgerEntry, Payout, Transaction,
    TransactionStatus, ACCOUNT_ESCROW, ACCOUNT_PLATFORM_REVENUE, ACCOUNT_PROVIDER_PAYABLE,
    ACCOUNT_SELLER_PAYABLE,
};
use crate::state::AppState;
use crate::PPM_DENOMINATOR;

/// Commission owed on the sale portion, rounded down. Service amounts pass
/// through to providers untouched.
pub(crate) fn commission_on_sale(rate_ppm: i64, sale_cents: i64) -> Result<i64, EngineError> {
    let wide = (sale_cents as u128)
        .checked_mul(rate_ppm as u128)
        .ok_or_else(|| EngineError::Storage("commission overflow".to_string()))?;
    let cents = wide / PPM_DENOMINATOR as u128;
    i64::try_from(cents).map_err(|_| EngineError::Storage("commission overflow".to_string()))
}

/// Posts the financial outcome of a closed auction: one Transaction and one
/// balanced ledger batch. Idempotent per auction; a repeat call (or a racing
/// one) returns the transaction that already exists.
pub async fn settle(
    state: &AppState,
    auction_id: AuctionId,
    winning_bid_ids: &[BidId],
) -> Result<Transaction, EngineError> {
    if let Some(existing) = state.transactions.get_by_auction(auction_id) {
        return Ok(existing);
    }

    let agg = state.auctions.get(auction_id)?;
    let mut total_sale = 0i64;
    let mut total_service = 0i64;
    let mut seller_payable = 0i64;
    let mut provider_credits: Vec<(i64, i64, String)> = Vec::new();
    let mut payouts: Vec<Payout> = Vec::new();

    for bid_id in winning_bid_ids {
        let bid = agg
            .bids
            .get(bid_id)
            .ok_or(EngineError::BidNotFound(*bid_id))?;
        if bid.status != BidStatus::Accepted {
            return Err(EngineError::InvalidWinnerSet(format!(
                "bid {bid_id} is not accepted"
            )));
        }
        match bid.kind {
            BidKind::SalePrice => {
                if total_sale > 0 {
                    return Err(EngineError::InvalidWinnerSet(
                        "more than one sale-price winner".to_string(),
                    ));
                }
                total_sale = bid.amount_cents;
            }
            BidKind::ServiceOffer { category } => {
                total_service = total_service
                    .checked_add(bid.amount_cents)
                    .ok_or_else(|| EngineError::Storage("service total overflow".to_string()))?;
                provider_credits.push((
                    bid.bidder_id,
                    bid.amount_cents,
                    category.as_str().to_string(),
                ));
                payouts.push(Payout::pending(bid.bidder_id, bid.amount_cents));
            }
        }
    }

    let rate_ppm = state.cfg.fees.commission_rate_ppm(total_sale);
    let commission = if total_sale > 0 {
        commission_on_sale(rate_ppm, total_sale)?
    } else {
        0
    };
    if total_sale > 0 {
        seller_payable = total_sale - commission;
        // A 100% commission tier leaves the seller nothing; no zero-amount
        // payout is dispatched, matching the skipped zero ledger credit.
        if seller_payable > 0 {
            payouts.insert(0, Payout::pending(agg.auction.owner_id, seller_payable));
        }
    }

    let gross = total_sale
        .checked_add(total_service)
        .ok_or_else(|| EngineError::Storage("gross overflow".to_string()))?;
    let distributed: i64 = commission + seller_payable + total_service;
    if distributed != gross {
        state
            .perf
            .settlement_failures
            .fetch_add(1, Ordering::Relaxed);
        eprintln!(
            "[settlement] IMBALANCE auction_id={auction_id} class=invariant gross={gross} commission={commission} seller={seller_payable} services={total_service}"
        );
        return Err(EngineError::LedgerImbalance {
            debit_cents: gross,
            credit_cents: distributed,
        });
    }

    let tx = Transaction::new_pending(auction_id, total_sale, total_service, commission, payouts);
    if let Err(existing_id) = state.transactions.claim_for_auction(tx.clone()) {
        // Lost the race with a concurrent settlement of the same auction.
        return state
            .transactions
            .get(existing_id)
            .ok_or(EngineError::DuplicateSettlement(auction_id));
    }

    let mut batch = Vec::with_capacity(3 + provider_credits.len());
    batch.push(LedgerEntry::new(
        tx.transaction_id,
        EntryType::Debit,
        ACCOUNT_ESCROW,
        gross,
        Some(format!("auction {auction_id} gross")),
    ));
    if seller_payable > 0 {
        batch.push(LedgerEntry::new(
            tx.transaction_id,
            EntryType::Credit,
            ACCOUNT_SELLER_PAYABLE,
            seller_payable,
            Some(format!("auction {auction_id} seller net")),
        ));
    }
    for (provider_id, amount, category) in &provider_credits {
        batch.push(LedgerEntry::new(
            tx.transaction_id,
            EntryType::Credit,
            ACCOUNT_PROVIDER_PAYABLE,
            *amount,
            Some(format!("provider {provider_id} {category}")),
        ));
    }
    if commission > 0 {
        batch.push(LedgerEntry::new(
            tx.transaction_id,
            EntryType::Credit,
            ACCOUNT_PLATFORM_REVENUE,
            commission,
            Some(format!("auction {auction_id} commission")),
        ));
    }

    if let Err(e) = state.ledger.post(tx.transaction_id, batch) {
        state
            .perf
            .settlement_failures
            .fetch_add(1, Ordering::Relaxed);
        eprintln!(
            "[settlement] IMBALANCE auction_id={auction_id} transaction_id={} class={} err={e}",
            tx.transaction_id,
            e.class().as_str()
        );
        return Err(e);
    }

    state
        .perf
        .settlements_posted
        .fetch_add(1, Ordering::Relaxed);
    emit(
        state,
        AuctionEvent::SettlementPosted {
            auction_id,
            transaction_id: tx.transaction_id,
            gross_cents: gross,
            commission_cents: commission,
        },
    );

    // Nothing left to dispatch means nothing left to confirm.
    if tx.payouts.is_empty() {
        let settled = state
            .transactions
            .update(tx.transaction_id, |t| t.status = TransactionStatus::Settled)?;
        emit(
            state,
            AuctionEvent::TransactionSettled {
                transaction_id: tx.transaction_id,
            },
        );
        return Ok(settled);
    }
    Ok(tx)
}
