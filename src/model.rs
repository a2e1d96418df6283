use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type AuctionId = i64;
pub type BidId = i64;
pub type UserId = i64;
pub type ListingId = i64;
pub type OptionId = i64;
pub type OptionBidId = i64;

// Ledger account names. Corrections never rewrite rows against these
// accounts; they post reversing entries instead.
pub const ACCOUNT_ESCROW: &str = "ESCROW";
pub const ACCOUNT_SELLER_PAYABLE: &str = "SELLER_PAYABLE";
pub const ACCOUNT_PROVIDER_PAYABLE: &str = "PROVIDER_PAYABLE";
pub const ACCOUNT_PLATFORM_REVENUE: &str = "PLATFORM_REVENUE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceCategory {
    Financing,
    Transport,
    Insurance,
    Escrow,
    Mechanic,
    Storage,
}

impl ServiceCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceCategory::Financing => "FINANCING",
            ServiceCategory::Transport => "TRANSPORT",
            ServiceCategory::Insurance => "INSURANCE",
            ServiceCategory::Escrow => "ESCROW",
            ServiceCategory::Mechanic => "MECHANIC",
            ServiceCategory::Storage => "STORAGE",
        }
    }
}

/// The two auction flows share one lifecycle but admit different bid kinds
/// and select winners differently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuctionKind {
    Sale {
        reserve_cents: i64,
    },
    Services {
        required: BTreeSet<ServiceCategory>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuctionStatus {
    Draft,
    Active,
    Evaluating,
    Closed,
    Cancelled,
}

impl AuctionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AuctionStatus::Closed | AuctionStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AuctionStatus::Draft => "DRAFT",
            AuctionStatus::Active => "ACTIVE",
            AuctionStatus::Evaluating => "EVALUATING",
            AuctionStatus::Closed => "CLOSED",
            AuctionStatus::Cancelled => "CANCELLED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Auction {
    pub auction_id: AuctionId,
    pub listing_id: ListingId,
    pub owner_id: UserId,
    pub kind: AuctionKind,
    pub status: AuctionStatus,
    pub is_anonymous: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub winning_bids: Vec<BidId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BidKind {
    SalePrice,
    ServiceOffer { category: ServiceCategory },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BidStatus {
    Submitted,
    Retracted,
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bid {
    pub bid_id: BidId,
    pub auction_id: AuctionId,
    pub bidder_id: UserId,
    pub kind: BidKind,
    pub amount_cents: i64,
    pub terms: Option<String>,
    pub status: BidStatus,
    pub created_at: DateTime<Utc>,
}

/// The unit of exclusive access: an auction together with every bid placed
/// against it. All mutations of the pair go through `AuctionStore::mutate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuctionAggregate {
    pub auction: Auction,
    pub bids: BTreeMap<BidId, Bid>,
}

impl AuctionAggregate {
    pub fn new(auction: Auction) -> Self {
        Self {
            auction,
            bids: BTreeMap::new(),
        }
    }

    pub fn submitted_bids(&self) -> impl Iterator<Item = &Bid> {
        self.bids
            .values()
            .filter(|b| b.status == BidStatus::Submitted)
    }

    /// Highest submitted SALE_PRICE bid; ties resolved by earlier submission,
    /// then lower bid id, so the result is deterministic.
    pub fn highest_submitted_sale_bid(&self) -> Option<&Bid> {
        self.submitted_bids()
            .filter(|b| b.kind == BidKind::SalePrice)
            .max_by(|a, b| {
                a.amount_cents
                    .cmp(&b.amount_cents)
                    .then(b.created_at.cmp(&a.created_at))
                    .then(b.bid_id.cmp(&a.bid_id))
            })
    }

    pub fn has_accepted_bids(&self) -> bool {
        self.bids.values().any(|b| b.status == BidStatus::Accepted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OptionStatus {
    Bidding,
    Active,
    Exercised,
    Expired,
    Cancelled,
}

impl OptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptionStatus::Bidding => "BIDDING",
            OptionStatus::Active => "ACTIVE",
            OptionStatus::Exercised => "EXERCISED",
            OptionStatus::Expired => "EXPIRED",
            OptionStatus::Cancelled => "CANCELLED",
        }
    }
}

/// Competitive option-to-purchase layered on a listing. Holder, price and
/// expiry are populated once, when a bid is accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurchaseOption {
    pub option_id: OptionId,
    pub listing_id: ListingId,
    pub seller_id: UserId,
    pub status: OptionStatus,
    pub holder_id: Option<UserId>,
    pub price_cents: Option<i64>,
    pub expires_at: Option<DateTime<Utc>>,
    pub winning_bid: Option<OptionBidId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OptionBidStatus {
    Active,
    Retracted,
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionBid {
    pub option_bid_id: OptionBidId,
    pub option_id: OptionId,
    pub bidder_id: UserId,
    pub downpayment_cents: i64,
    pub hold_days: i64,
    pub status: OptionBidStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionAggregate {
    pub option: PurchaseOption,
    pub bids: BTreeMap<OptionBidId, OptionBid>,
}

impl OptionAggregate {
    pub fn new(option: PurchaseOption) -> Self {
        Self {
            option,
            bids: BTreeMap::new(),
        }
    }

    pub fn accepted_bid_count(&self) -> usize {
        self.bids
            .values()
            .filter(|b| b.status == OptionBidStatus::Accepted)
            .count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    PendingSettlement,
    Settled,
    Failed,
    Refunded,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::PendingSettlement => "PENDING_SETTLEMENT",
            TransactionStatus::Settled => "SETTLED",
            TransactionStatus::Failed => "FAILED",
            TransactionStatus::Refunded => "REFUNDED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayoutStatus {
    Pending,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payout {
    pub payout_id: Uuid,
    pub payee_id: UserId,
    pub amount_cents: i64,
    pub status: PayoutStatus,
    pub external_payout_id: Option<String>,
    pub failure_reason: Option<String>,
}

impl Payout {
    pub fn pending(payee_id: UserId, amount_cents: i64) -> Self {
        Self {
            payout_id: Uuid::new_v4(),
            payee_id,
            amount_cents,
            status: PayoutStatus::Pending,
            external_payout_id: None,
            failure_reason: None,
        }
    }
}

/// Financial summary of one closed auction. Exactly one per auction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub transaction_id: Uuid,
    pub auction_id: AuctionId,
    pub status: TransactionStatus,
    pub total_sale_cents: i64,
    pub total_service_cents: i64,
    pub commission_cents: i64,
    pub payouts: Vec<Payout>,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    pub fn new_pending(
        auction_id: AuctionId,
        total_sale_cents: i64,
        total_service_cents: i64,
        commission_cents: i64,
        payouts: Vec<Payout>,
    ) -> Self {
        Self {
            transaction_id: Uuid::new_v4(),
            auction_id,
            status: TransactionStatus::PendingSettlement,
            total_sale_cents,
            total_service_cents,
            commission_cents,
            payouts,
            created_at: Utc::now(),
        }
    }

    pub fn gross_cents(&self) -> i64 {
        self.total_sale_cents + self.total_service_cents
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryType {
    Debit,
    Credit,
}

/// One immutable double-entry row. Never updated or deleted; corrections are
/// new reversing entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub entry_id: Uuid,
    pub transaction_id: Uuid,
    pub entry_type: EntryType,
    pub account: String,
    pub amount_cents: i64,
    pub memo: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(
        transaction_id: Uuid,
        entry_type: EntryType,
        account: &str,
        amount_cents: i64,
        memo: Option<String>,
    ) -> Self {
        Self {
            entry_id: Uuid::new_v4(),
            transaction_id,
            entry_type,
            account: account.to_string(),
            amount_cents,
            memo,
            created_at: Utc::now(),
        }
    }
}
