use chrono::{Duration, Utc};

use crate::error::EngineError;
use crate::events::{emit, AuctionEvent};
use crate::model::{
    ListingId, OptionAggregate, OptionBid, OptionBidId, OptionBidStatus, OptionId, OptionStatus,
    PurchaseOption, UserId,
};
use crate::state::AppState;

/// Opens a purchase option over a listing. At most one open option may exist
/// per listing at a time.
pub async fn create_option(
    state: &AppState,
    listing_id: ListingId,
    seller_id: UserId,
) -> Result<PurchaseOption, EngineError> {
    let option_id = state.ids.next_option_id();
    state.listing_options.claim(listing_id, option_id)?;
    let option = PurchaseOption {
        option_id,
        listing_id,
        seller_id,
        status: OptionStatus::Bidding,
        holder_id: None,
        price_cents: None,
        expires_at: None,
        winning_bid: None,
        created_at: Utc::now(),
    };
    state.options.insert(OptionAggregate::new(option.clone()));
    Ok(option)
}

pub async fn place_option_bid(
    state: &AppState,
    option_id: OptionId,
    bidder_id: UserId,
    downpayment_cents: i64,
    hold_days: i64,
) -> Result<OptionBid, EngineError> {
    if downpayment_cents <= 0 {
        return Err(EngineError::InvalidAmount(downpayment_cents));
    }
    if hold_days <= 0 {
        return Err(EngineError::InvalidAmount(hold_days));
    }
    let ids = &state.ids;
    state
        .options
        .mutate(option_id, "options.place_bid", |agg| {
            if agg.option.status != OptionStatus::Bidding {
                return Err(EngineError::OptionNotOpen {
                    option_id,
                    status: agg.option.status,
                });
            }
            if bidder_id == agg.option.seller_id {
                return Err(EngineError::SelfBid);
            }
            let bid = OptionBid {
                option_bid_id: ids.next_option_bid_id(),
                option_id,
                bidder_id,
                downpayment_cents,
                hold_days,
                status: OptionBidStatus::Active,
                created_at: Utc::now(),
            };
            let mut next = agg.clone();
            next.bids.insert(bid.option_bid_id, bid.clone());
            Ok((next, bid))
        })
        .await
}

pub async fn retract_option_bid(
    state: &AppState,
    option_id: OptionId,
    option_bid_id: OptionBidId,
    caller_id: UserId,
) -> Result<OptionBid, EngineError> {
    state
        .options
        .mutate(option_id, "options.retract_bid", |agg| {
            let bid = agg
                .bids
                .get(&option_bid_id)
                .ok_or(EngineError::OptionBidNotFound(option_bid_id))?;
            if bid.bidder_id != caller_id {
                return Err(EngineError::NotBidOwner(option_bid_id));
            }
            if bid.status != OptionBidStatus::Active
                || agg.option.status != OptionStatus::Bidding
            {
                return Err(EngineError::BidNotRetractable(option_bid_id));
            }
            let mut next = agg.clone();
            let b = next
                .bids
                .get_mut(&option_bid_id)
                .ok_or(EngineError::OptionBidNotFound(option_bid_id))?;
            b.status = OptionBidStatus::Retracted;
            let retracted = b.clone();
            Ok((next, retracted))
        })
        .await
}

/// Seller accepts one bid: the option activates for the bidder, every other
/// active bid is rejected, and the hold window starts now.
pub async fn accept_option_bid(
    state: &AppState,
    option_id: OptionId,
    option_bid_id: OptionBidId,
    caller_id: UserId,
) -> Result<PurchaseOption, EngineError> {
    let option = state
        .options
        .mutate(option_id, "options.accept_bid", |agg| {
            if agg.option.seller_id != caller_id {
                return Err(EngineError::NotOptionSeller(option_id));
            }
            if agg.option.status != OptionStatus::Bidding {
                return Err(EngineError::OptionNotOpen {
                    option_id,
                    status: agg.option.status,
                });
            }
            let winner = agg
                .bids
                .get(&option_bid_id)
                .ok_or(EngineError::OptionBidNotFound(option_bid_id))?;
            if winner.status != OptionBidStatus::Active {
                return Err(EngineError::InvalidWinnerSet(format!(
                    "option bid {option_bid_id} is not active"
                )));
            }

            let mut next = agg.clone();
            for bid in next.bids.values_mut() {
                if bid.status != OptionBidStatus::Active {
                    continue;
                }
                bid.status = if bid.option_bid_id == option_bid_id {
                    OptionBidStatus::Accepted
                } else {
                    OptionBidStatus::Rejected
                };
            }
            next.option.status = OptionStatus::Active;
            next.option.holder_id = Some(winner.bidder_id);
            next.option.price_cents = Some(winner.downpayment_cents);
            next.option.expires_at = Some(Utc::now() + Duration::days(winner.hold_days));
            next.option.winning_bid = Some(option_bid_id);
            Ok((next.clone(), next.option))
        })
        .await?;

    emit(
        state,
        AuctionEvent::OptionActivated {
            option_id,
            winning_bid: option.winning_bid.unwrap_or(option_bid_id),
            holder_id: option.holder_id.unwrap_or_default(),
            price_cents: option.price_cents.unwrap_or_default(),
            expires_at: option.expires_at.unwrap_or_else(Utc::now),
        },
    );
    Ok(option)
}

/// Holder converts the active option into a purchase before it expires.
pub async fn exercise_option(
    state: &AppState,
    option_id: OptionId,
    caller_id: UserId,
) -> Result<PurchaseOption, EngineError> {
    let option = state
        .options
        .mutate(option_id, "options.exercise", |agg| {
            if agg.option.status != OptionStatus::Active {
                return Err(EngineError::OptionNotOpen {
                    option_id,
                    status: agg.option.status,
                });
            }
            if agg.option.holder_id != Some(caller_id) {
                return Err(EngineError::NotOptionHolder(option_id));
            }
            if let Some(expires) = agg.option.expires_at {
                if expires <= Utc::now() {
                    return Err(EngineError::OptionNotOpen {
                        option_id,
                        status: OptionStatus::Expired,
                    });
                }
            }
            let mut next = agg.clone();
            next.option.status = OptionStatus::Exercised;
            Ok((next.clone(), next.option))
        })
        .await?;

    state.listing_options.release(option.listing_id);
    emit(state, AuctionEvent::OptionExercised { option_id });
    Ok(option)
}

/// Seller withdraws the option. Allowed while bidding or while held, but a
/// hold that has already been exercised stays exercised.
pub async fn cancel_option(
    state: &AppState,
    option_id: OptionId,
    caller_id: UserId,
) -> Result<PurchaseOption, EngineError> {
    let option = state
        .options
        .mutate(option_id, "options.cancel", |agg| {
            if agg.option.seller_id != caller_id {
                return Err(EngineError::NotOptionSeller(option_id));
            }
            if !matches!(
                agg.option.status,
                OptionStatus::Bidding | OptionStatus::Active
            ) {
                return Err(EngineError::OptionNotOpen {
                    option_id,
                    status: agg.option.status,
                });
            }
            let mut next = agg.clone();
            next.option.status = OptionStatus::Cancelled;
            for bid in next.bids.values_mut() {
                if bid.status == OptionBidStatus::Active {
                    bid.status = OptionBidStatus::Rejected;
                }
            }
            Ok((next.clone(), next.option))
        })
        .await?;

    state.listing_options.release(option.listing_id);
    Ok(option)
}

/// Expires ACTIVE options whose hold window has lapsed without an exercise,
/// freeing their listings for a new option.
pub async fn sweep_expired_options(state: &AppState) -> usize {
    let now = Utc::now();
    let mut expired = 0usize;
    for id in state.options.ids() {
        let Ok(agg) = state.options.get(id) else {
            continue;
        };
        if agg.option.status != OptionStatus::Active {
            continue;
        }
        let Some(expires) = agg.option.expires_at else {
            continue;
        };
        if expires > now {
            continue;
        }
        let result = state
            .options
            .mutate(id, "options.sweep_expire", |agg| {
                if agg.option.status != OptionStatus::Active {
                    return Err(EngineError::OptionNotOpen {
                        option_id: id,
                        status: agg.option.status,
                    });
                }
                let mut next = agg.clone();
                next.option.status = OptionStatus::Expired;
                Ok((next.clone(), next.option))
            })
            .await;
        if let Ok(option) = result {
            state.listing_options.release(option.listing_id);
            emit(state, AuctionEvent::OptionExpired { option_id: id });
            expired += 1;
        }
    }
    expired
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::test_state;

    #[tokio::test]
    async fn one_open_option_per_listing() {
        let (state, _prx, _erx) = test_state();
        create_option(&state, 5, 10).await.unwrap();
        let err = create_option(&state, 5, 11).await.unwrap_err();
        assert!(matches!(err, EngineError::OptionExists { listing_id: 5 }));
    }

    #[tokio::test]
    async fn accepting_a_bid_activates_the_hold_and_rejects_the_rest() {
        let (state, _prx, _erx) = test_state();
        let option = create_option(&state, 5, 10).await.unwrap();
        let winner = place_option_bid(&state, option.option_id, 20, 50_000, 30)
            .await
            .unwrap();
        let loser = place_option_bid(&state, option.option_id, 21, 40_000, 14)
            .await
            .unwrap();

        let active = accept_option_bid(&state, option.option_id, winner.option_bid_id, 10)
            .await
            .unwrap();
        assert_eq!(active.status, OptionStatus::Active);
        assert_eq!(active.holder_id, Some(20));
        assert_eq!(active.price_cents, Some(50_000));
        assert_eq!(active.winning_bid, Some(winner.option_bid_id));
        let expires = active.expires_at.unwrap();
        assert!(expires > Utc::now() + Duration::days(29));
        assert!(expires <= Utc::now() + Duration::days(30));

        let agg = state.options.get(option.option_id).unwrap();
        assert_eq!(
            agg.bids.get(&loser.option_bid_id).unwrap().status,
            OptionBidStatus::Rejected
        );

        // No further bids once the option is held.
        let err = place_option_bid(&state, option.option_id, 22, 60_000, 7)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::OptionNotOpen { .. }));
    }

    #[tokio::test]
    async fn only_the_seller_accepts() {
        let (state, _prx, _erx) = test_state();
        let option = create_option(&state, 5, 10).await.unwrap();
        let bid = place_option_bid(&state, option.option_id, 20, 50_000, 30)
            .await
            .unwrap();
        let err = accept_option_bid(&state, option.option_id, bid.option_bid_id, 20)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotOptionSeller(_)));
    }

    #[tokio::test]
    async fn only_the_holder_exercises() {
        let (state, _prx, _erx) = test_state();
        let option = create_option(&state, 5, 10).await.unwrap();
        let bid = place_option_bid(&state, option.option_id, 20, 50_000, 30)
            .await
            .unwrap();
        accept_option_bid(&state, option.option_id, bid.option_bid_id, 10)
            .await
            .unwrap();

        let err = exercise_option(&state, option.option_id, 21).await.unwrap_err();
        assert!(matches!(err, EngineError::NotOptionHolder(_)));

        let exercised = exercise_option(&state, option.option_id, 20).await.unwrap();
        assert_eq!(exercised.status, OptionStatus::Exercised);

        // The listing is free for a new option afterwards.
        create_option(&state, 5, 10).await.unwrap();
    }

    #[tokio::test]
    async fn retract_only_while_bidding_and_by_the_bidder() {
        let (state, _prx, _erx) = test_state();
        let option = create_option(&state, 5, 10).await.unwrap();
        let bid = place_option_bid(&state, option.option_id, 20, 50_000, 30)
            .await
            .unwrap();

        let err = retract_option_bid(&state, option.option_id, bid.option_bid_id, 21)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotBidOwner(_)));

        let retracted = retract_option_bid(&state, option.option_id, bid.option_bid_id, 20)
            .await
            .unwrap();
        assert_eq!(retracted.status, OptionBidStatus::Retracted);

        // A retracted bid cannot be accepted.
        let err = accept_option_bid(&state, option.option_id, bid.option_bid_id, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidWinnerSet(_)));
    }

    #[tokio::test]
    async fn expired_holds_are_swept_and_release_the_listing() {
        let (state, _prx, _erx) = test_state();
        let option = create_option(&state, 5, 10).await.unwrap();
        let bid = place_option_bid(&state, option.option_id, 20, 50_000, 30)
            .await
            .unwrap();
        accept_option_bid(&state, option.option_id, bid.option_bid_id, 10)
            .await
            .unwrap();
        // Backdate the expiry.
        state
            .options
            .mutate(option.option_id, "test.backdate", |agg| {
                let mut next = agg.clone();
                next.option.expires_at = Some(Utc::now() - Duration::seconds(1));
                Ok((next, ()))
            })
            .await
            .unwrap();

        assert_eq!(sweep_expired_options(&state).await, 1);
        let agg = state.options.get(option.option_id).unwrap();
        assert_eq!(agg.option.status, OptionStatus::Expired);

        let err = exercise_option(&state, option.option_id, 20).await.unwrap_err();
        assert!(matches!(err, EngineError::OptionNotOpen { .. }));
        create_option(&state, 5, 10).await.unwrap();
        assert_eq!(sweep_expired_options(&state).await, 0);
    }

    #[tokio::test]
    async fn cancel_rejects_open_bids_and_frees_the_listing() {
        let (state, _prx, _erx) = test_state();
        let option = create_option(&state, 5, 10).await.unwrap();
        place_option_bid(&state, option.option_id, 20, 50_000, 30)
            .await
            .unwrap();

        let cancelled = cancel_option(&state, option.option_id, 10).await.unwrap();
        assert_eq!(cancelled.status, OptionStatus::Cancelled);
        let agg = state.options.get(option.option_id).unwrap();
        assert!(agg
            .bids
            .values()
            .all(|b| b.status == OptionBidStatus::Rejected));
        create_option(&state, 5, 11).await.unwrap();
    }
}
