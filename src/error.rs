use std::fmt;

use crate::model::{AuctionId, AuctionStatus, BidId, OptionStatus, ServiceCategory};

/// How the caller should treat a failure: validation errors surface verbatim
/// and are never retried; invariant violations need operator intervention;
/// transient errors may be retried with backoff (PayoutDispatcher only).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Validation,
    Invariant,
    Transient,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Validation => "validation",
            ErrorClass::Invariant => "invariant",
            ErrorClass::Transient => "transient",
        }
    }
}

#[derive(Debug)]
pub enum EngineError {
    AuctionNotFound(AuctionId),
    AuctionNotActive {
        auction_id: AuctionId,
        status: AuctionStatus,
    },
    BidTooLow {
        amount_cents: i64,
        floor_cents: i64,
    },
    SelfBid,
    InvalidAmount(i64),
    BidNotFound(BidId),
    BidNotRetractable(BidId),
    NotBidOwner(BidId),
    WrongBidKind,
    ServiceNotRequested(ServiceCategory),
    NoServicesRequested,
    InvalidTransition {
        auction_id: AuctionId,
        from: AuctionStatus,
        to: AuctionStatus,
    },
    AcceptedBidsExist(AuctionId),
    NotAuctionOwner(AuctionId),
    InvalidWinnerSet(String),
    LedgerImbalance {
        debit_cents: i64,
        credit_cents: i64,
    },
    DuplicateSettlement(AuctionId),
    DuplicateLedgerPost(uuid::Uuid),
    OptionNotFound(i64),
    OptionNotOpen {
        option_id: i64,
        status: OptionStatus,
    },
    OptionBidNotFound(i64),
    OptionExists {
        listing_id: i64,
    },
    NotOptionSeller(i64),
    NotOptionHolder(i64),
    Storage(String),
}

impl EngineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::LedgerImbalance { .. }
            | EngineError::DuplicateSettlement(_)
            | EngineError::DuplicateLedgerPost(_) => ErrorClass::Invariant,
            EngineError::Storage(_) => ErrorClass::Transient,
            _ => ErrorClass::Validation,
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::AuctionNotFound(id) => write!(f, "auction {id} not found"),
            EngineError::AuctionNotActive { auction_id, status } => {
                write!(f, "auction {auction_id} is not active (status={})", status.as_str())
            }
            EngineError::BidTooLow {
                amount_cents,
                floor_cents,
            } => write!(
                f,
                "bid of {amount_cents} cents does not beat the current floor of {floor_cents} cents"
            ),
            EngineError::SelfBid => write!(f, "auction owners may not bid on their own auction"),
            EngineError::InvalidAmount(v) => write!(f, "bid amount must be positive, got {v}"),
            EngineError::BidNotFound(id) => write!(f, "bid {id} not found"),
            EngineError::BidNotRetractable(id) => {
                write!(f, "bid {id} can no longer be retracted")
            }
            EngineError::NotBidOwner(id) => {
                write!(f, "caller did not place bid {id}")
            }
            EngineError::WrongBidKind => write!(f, "bid kind does not match the auction type"),
            EngineError::ServiceNotRequested(cat) => {
                write!(f, "service category {} is not requested by this auction", cat.as_str())
            }
            EngineError::NoServicesRequested => {
                write!(f, "a services auction needs at least one requested category")
            }
            EngineError::InvalidTransition { auction_id, from, to } => write!(
                f,
                "auction {auction_id}: illegal transition {} -> {}",
                from.as_str(),
                to.as_str()
            ),
            EngineError::AcceptedBidsExist(id) => {
                write!(f, "auction {id} has accepted bids and cannot be cancelled")
            }
            EngineError::NotAuctionOwner(id) => {
                write!(f, "caller does not own auction {id}")
            }
            EngineError::InvalidWinnerSet(msg) => write!(f, "invalid winner set: {msg}"),
            EngineError::LedgerImbalance {
                debit_cents,
                credit_cents,
            } => write!(
                f,
                "ledger imbalance: debits={debit_cents} credits={credit_cents}"
            ),
            EngineError::DuplicateSettlement(id) => {
                write!(f, "auction {id} already has a settled transaction")
            }
            EngineError::DuplicateLedgerPost(tx) => {
                write!(f, "ledger entries already posted for transaction {tx}")
            }
            EngineError::OptionNotFound(id) => write!(f, "option {id} not found"),
            EngineError::OptionNotOpen { option_id, status } => {
                write!(f, "option {option_id} does not allow this in status {}", status.as_str())
            }
            EngineError::OptionBidNotFound(id) => write!(f, "option bid {id} not found"),
            EngineError::OptionExists { listing_id } => {
                write!(f, "an option already exists for listing {listing_id}")
            }
            EngineError::NotOptionSeller(id) => {
                write!(f, "caller is not the seller of option {id}")
            }
            EngineError::NotOptionHolder(id) => {
                write!(f, "caller does not hold option {id}")
            }
            EngineError::Storage(msg) => write!(f, "storage error: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<anyhow::Error> for EngineError {
    fn from(value: anyhow::Error) -> Self {
        EngineError::Storage(value.to_string())
    }
}
