use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::EngineError;
use crate::model::{
    AuctionAggregate, AuctionId, EntryType, LedgerEntry, ListingId, OptionAggregate, Transaction,
    TransactionStatus,
};

const LOCK_WAIT_WARN_MS: u128 = 100;
const LOCK_HOLD_WARN_MS: u128 = 100;

/// Records that live in a [`ShardedStore`] and are mutated under a per-key lock.
pub trait Keyed: Clone + Send + Sync + 'static {
    fn key(&self) -> i64;
    fn missing(id: i64) -> EngineError;
}

impl Keyed for AuctionAggregate {
    fn key(&self) -> i64 {
        self.auction.auction_id
    }
    fn missing(id: i64) -> EngineError {
        EngineError::AuctionNotFound(id)
    }
}

impl Keyed for OptionAggregate {
    fn key(&self) -> i64 {
        self.option.option_id
    }
    fn missing(id: i64) -> EngineError {
        EngineError::OptionNotFound(id)
    }
}

/// Copy-on-write store: `mutate` serializes writers per key through a sharded
/// lock table and publishes the replacement record only after the closure
/// succeeds. Readers clone the committed record without touching the locks.
pub struct ShardedStore<T: Keyed> {
    records: DashMap<i64, T>,
    shards: Vec<Arc<Mutex<()>>>,
}

impl<T: Keyed> ShardedStore<T> {
    pub(crate) fn new(shard_count: usize) -> Self {
        let shards = (0..shard_count.max(1))
            .map(|_| Arc::new(Mutex::new(())))
            .collect();
        Self {
            records: DashMap::new(),
            shards,
        }
    }

    fn shard_for(&self, id: i64) -> Arc<Mutex<()>> {
        let idx = (id.unsigned_abs() as usize) % self.shards.len();
        Arc::clone(&self.shards[idx])
    }

    pub(crate) fn insert(&self, record: T) {
        self.records.insert(record.key(), record);
    }

    /// Unsynchronized read of the committed record.
    pub fn get(&self, id: i64) -> Result<T, EngineError> {
        self.records
            .get(&id)
            .map(|r| r.clone())
            .ok_or_else(|| T::missing(id))
    }

    pub(crate) fn ids(&self) -> Vec<i64> {
        self.records.iter().map(|r| *r.key()).collect()
    }

    /// Runs `f` against the committed record inside the key's exclusive
    /// section. The closure builds a replacement; an Err leaves the committed
    /// record untouched.
    pub(crate) async fn mutate<R>(
        &self,
        id: i64,
        label: &str,
        f: impl FnOnce(&T) -> Result<(T, R), EngineError>,
    ) -> Result<R, EngineError> {
        let shard = self.shard_for(id);
        let wait_started = std::time::Instant::now();
        let _guard = shard.lock().await;
        let wait_ms = wait_started.elapsed().as_millis();
        if wait_ms >= LOCK_WAIT_WARN_MS {
            eprintln!("[store] slow_lock_wait label={label} id={id} wait_ms={wait_ms}");
        }

        let hold_started = std::time::Instant::now();
        let current = self
            .records
            .get(&id)
            .map(|r| r.clone())
            .ok_or_else(|| T::missing(id))?;
        let out = match f(&current) {
            Ok((next, ret)) => {
                self.records.insert(id, next);
                Ok(ret)
            }
            Err(e) => Err(e),
        };
        let hold_ms = hold_started.elapsed().as_millis();
        if hold_ms >= LOCK_HOLD_WARN_MS {
            eprintln!("[store] slow_lock_hold label={label} id={id} hold_ms={hold_ms}");
        }
        out
    }

    fn export(&self) -> Vec<T> {
        self.records.iter().map(|r| r.clone()).collect()
    }

    fn import(&self, records: Vec<T>) {
        for r in records {
            self.records.insert(r.key(), r);
        }
    }
}

pub type AuctionStore = ShardedStore<AuctionAggregate>;
pub type OptionStore = ShardedStore<OptionAggregate>;

/// Append-only double-entry ledger. Entries for a transaction are posted
/// exactly once, as a batch whose debits and credits must balance.
pub struct LedgerStore {
    entries: DashMap<Uuid, Vec<LedgerEntry>>,
}

impl LedgerStore {
    pub(crate) fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Posts a balanced batch under its transaction id. Rejects an unbalanced
    /// batch and a second post for the same transaction.
    pub(crate) fn post(
        &self,
        transaction_id: Uuid,
        batch: Vec<LedgerEntry>,
    ) -> Result<(), EngineError> {
        let debit: i64 = batch
            .iter()
            .filter(|e| e.entry_type == EntryType::Debit)
            .map(|e| e.amount_cents)
            .sum();
        let credit: i64 = batch
            .iter()
            .filter(|e| e.entry_type == EntryType::Credit)
            .map(|e| e.amount_cents)
            .sum();
        if debit != credit {
            return Err(EngineError::LedgerImbalance {
                debit_cents: debit,
                credit_cents: credit,
            });
        }
        match self.entries.entry(transaction_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(EngineError::DuplicateLedgerPost(transaction_id))
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(batch);
                Ok(())
            }
        }
    }

    pub fn entries_for(&self, transaction_id: Uuid) -> Vec<LedgerEntry> {
        self.entries
            .get(&transaction_id)
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    fn export(&self) -> Vec<(Uuid, Vec<LedgerEntry>)> {
        self.entries
            .iter()
            .map(|r| (*r.key(), r.value().clone()))
            .collect()
    }

    fn import(&self, rows: Vec<(Uuid, Vec<LedgerEntry>)>) {
        for (id, batch) in rows {
            self.entries.insert(id, batch);
        }
    }
}

/// Transactions indexed by id and by auction. The auction index doubles as
/// the settlement idempotency guard: the first writer for an auction wins.
pub struct TransactionStore {
    by_id: DashMap<Uuid, Transaction>,
    by_auction: DashMap<AuctionId, Uuid>,
}

impl TransactionStore {
    pub(crate) fn new() -> Self {
        Self {
            by_id: DashMap::new(),
            by_auction: DashMap::new(),
        }
    }

    /// Claims the auction slot for this transaction. Returns the already
    /// claimed transaction id when another settlement got there first.
    pub(crate) fn claim_for_auction(&self, tx: Transaction) -> Result<(), Uuid> {
        match self.by_auction.entry(tx.auction_id) {
            dashmap::mapref::entry::Entry::Occupied(o) => Err(*o.get()),
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(tx.transaction_id);
                self.by_id.insert(tx.transaction_id, tx);
                Ok(())
            }
        }
    }

    pub fn get(&self, transaction_id: Uuid) -> Option<Transaction> {
        self.by_id.get(&transaction_id).map(|t| t.clone())
    }

    pub fn get_by_auction(&self, auction_id: AuctionId) -> Option<Transaction> {
        let tx_id = *self.by_auction.get(&auction_id)?;
        self.get(tx_id)
    }

    /// Transactions still waiting on payout confirmations.
    pub(crate) fn pending_settlements(&self) -> Vec<Transaction> {
        self.by_id
            .iter()
            .filter(|e| e.value().status == TransactionStatus::PendingSettlement)
            .map(|e| e.value().clone())
            .collect()
    }

    pub(crate) fn update(
        &self,
        transaction_id: Uuid,
        f: impl FnOnce(&mut Transaction),
    ) -> Result<Transaction, EngineError> {
        let mut entry = self.by_id.get_mut(&transaction_id).ok_or_else(|| {
            EngineError::Storage(format!("transaction {transaction_id} missing"))
        })?;
        f(entry.value_mut());
        Ok(entry.value().clone())
    }

    fn export(&self) -> Vec<Transaction> {
        self.by_id.iter().map(|t| t.clone()).collect()
    }

    fn import(&self, txs: Vec<Transaction>) {
        for tx in txs {
            self.by_auction.insert(tx.auction_id, tx.transaction_id);
            self.by_id.insert(tx.transaction_id, tx);
        }
    }
}

/// Index of open purchase options, one per listing.
pub struct ListingOptionIndex {
    by_listing: DashMap<ListingId, i64>,
}

impl ListingOptionIndex {
    pub(crate) fn new() -> Self {
        Self {
            by_listing: DashMap::new(),
        }
    }

    pub(crate) fn claim(&self, listing_id: ListingId, option_id: i64) -> Result<(), EngineError> {
        match self.by_listing.entry(listing_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(EngineError::OptionExists { listing_id })
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(option_id);
                Ok(())
            }
        }
    }

    pub(crate) fn release(&self, listing_id: ListingId) {
        self.by_listing.remove(&listing_id);
    }

    fn export(&self) -> Vec<(ListingId, i64)> {
        self.by_listing
            .iter()
            .map(|r| (*r.key(), *r.value()))
            .collect()
    }

    fn import(&self, rows: Vec<(ListingId, i64)>) {
        for (listing, option) in rows {
            self.by_listing.insert(listing, option);
        }
    }
}

#[derive(Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub auctions: Vec<AuctionAggregate>,
    pub options: Vec<OptionAggregate>,
    pub ledger: Vec<(Uuid, Vec<LedgerEntry>)>,
    pub transactions: Vec<Transaction>,
    pub listing_options: Vec<(ListingId, i64)>,
    pub next_auction_id: i64,
    pub next_bid_id: i64,
    pub next_option_id: i64,
    pub next_option_bid_id: i64,
}

pub(crate) fn encode_snapshot(snap: &EngineSnapshot) -> Result<Vec<u8>> {
    let raw = bincode::serialize(snap).context("snapshot serialize")?;
    zstd::encode_all(raw.as_slice(), 3).context("snapshot compress")
}

pub(crate) fn decode_snapshot(blob: &[u8]) -> Result<EngineSnapshot> {
    let raw = zstd::decode_all(blob).context("snapshot decompress")?;
    bincode::deserialize(&raw).context("snapshot deserialize")
}

pub(crate) fn take_snapshot(state: &crate::state::AppState) -> EngineSnapshot {
    EngineSnapshot {
        auctions: state.auctions.export(),
        options: state.options.export(),
        ledger: state.ledger.export(),
        transactions: state.transactions.export(),
        listing_options: state.listing_options.export(),
        next_auction_id: state.ids.peek_auction(),
        next_bid_id: state.ids.peek_bid(),
        next_option_id: state.ids.peek_option(),
        next_option_bid_id: state.ids.peek_option_bid(),
    }
}

pub(crate) fn restore_snapshot(state: &crate::state::AppState, snap: EngineSnapshot) {
    state.auctions.import(snap.auctions);
    state.options.import(snap.options);
    state.ledger.import(snap.ledger);
    state.transactions.import(snap.transactions);
    state.listing_options.import(snap.listing_options);
    state.ids.restore(
        snap.next_auction_id,
        snap.next_bid_id,
        snap.next_option_id,
        snap.next_option_bid_id,
    );
}

pub fn save_snapshot_file(state: &crate::state::AppState, path: &str) -> Result<()> {
    let blob = encode_snapshot(&take_snapshot(state))?;
    let tmp = format!("{path}.tmp");
    std::fs::write(&tmp, &blob).with_context(|| format!("write {tmp}"))?;
    std::fs::rename(&tmp, path).with_context(|| format!("rename {tmp} -> {path}"))?;
    Ok(())
}

pub fn load_snapshot_file(state: &crate::state::AppState, path: &str) -> Result<bool> {
    let blob = match std::fs::read(path) {
        Ok(v) => v,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e).with_context(|| format!("read {path}")),
    };
    restore_snapshot(state, decode_snapshot(&blob)?);
    Ok(true)
}
