use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::events::{emit, AuctionEvent};
use crate::model::{PayoutStatus, Transaction, TransactionStatus, UserId};
use crate::state::AppState;

/// One payout to execute against the external money-movement provider.
#[derive(Debug, Clone)]
pub struct PayoutJob {
    pub transaction_id: Uuid,
    pub payout_id: Uuid,
    pub payee_id: UserId,
    pub amount_cents: i64,
}

impl PayoutJob {
    /// Key the provider uses to dedupe redelivery after a crash between the
    /// provider call and the confirmation write.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.transaction_id, self.payout_id)
    }
}

#[derive(Debug, Clone)]
pub struct PayoutError {
    pub reason: String,
    pub retryable: bool,
}

impl PayoutError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retryable: true,
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retryable: false,
        }
    }
}

/// External payment rail. Returns the provider's payout reference on success.
pub trait PayoutProvider: Send + Sync + 'static {
    fn send_payout(
        &self,
        job: &PayoutJob,
        idempotency_key: &str,
    ) -> impl Future<Output = Result<String, PayoutError>> + Send;
}

/// Stand-in payment rail for deployments without a real provider wired in:
/// acknowledges every payout and echoes the idempotency key back as the
/// external reference.
pub struct AckPayoutProvider;

impl PayoutProvider for AckPayoutProvider {
    async fn send_payout(
        &self,
        job: &PayoutJob,
        idempotency_key: &str,
    ) -> Result<String, PayoutError> {
        eprintln!(
            "[payouts] ack payee_id={} amount_cents={} key={idempotency_key}",
            job.payee_id, job.amount_cents
        );
        Ok(format!("ack-{idempotency_key}"))
    }
}

/// Queues every pending payout of a freshly settled transaction.
pub(crate) async fn enqueue_payouts(state: &AppState, tx: &Transaction) {
    for payout in &tx.payouts {
        if payout.status != PayoutStatus::Pending {
            continue;
        }
        let job = PayoutJob {
            transaction_id: tx.transaction_id,
            payout_id: payout.payout_id,
            payee_id: payout.payee_id,
            amount_cents: payout.amount_cents,
        };
        match state.payout_tx.send(job).await {
            Ok(()) => {
                state.perf.payouts_enqueued.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                // Dispatcher gone during shutdown; recover_pending_payouts
                // re-queues the line item on the next start.
                eprintln!(
                    "[payouts] enqueue_dropped transaction_id={} payout_id={}",
                    tx.transaction_id, payout.payout_id
                );
            }
        }
    }
}

/// Re-queues every payout still pending after a restart, so a transaction
/// restored in PENDING_SETTLEMENT can still reach SETTLED. The provider
/// dedupes redelivery through the idempotency key. Returns the number of
/// payouts handed back to the dispatcher.
pub async fn recover_pending_payouts(state: &AppState) -> usize {
    let mut recovered = 0;
    for tx in state.transactions.pending_settlements() {
        for payout in &tx.payouts {
            if payout.status == PayoutStatus::Pending {
                recovered += 1;
            }
        }
        enqueue_payouts(state, &tx).await;
    }
    if recovered > 0 {
        eprintln!("[payouts] recovered_pending count={recovered}");
    }
    recovered
}

/// Drains the payout queue until the send side closes. Each job is retried
/// with exponential backoff; a permanent provider error or exhausted retries
/// fails the payout and its transaction.
pub async fn run_dispatcher<P: PayoutProvider>(
    state: Arc<AppState>,
    mut rx: mpsc::Receiver<PayoutJob>,
    provider: P,
) {
    while let Some(job) = rx.recv().await {
        process_job(&state, &provider, job).await;
    }
    eprintln!("[payouts] dispatcher_stopped");
}

async fn process_job<P: PayoutProvider>(state: &AppState, provider: &P, job: PayoutJob) {
    let key = job.idempotency_key();
    let max_attempts = state.cfg.payouts.max_attempts.max(1);
    let mut attempt = 1u32;
    loop {
        match provider.send_payout(&job, &key).await {
            Ok(external_id) => {
                confirm_payout(state, &job, external_id);
                return;
            }
            Err(e) if e.retryable && attempt < max_attempts => {
                state.perf.payout_retries.fetch_add(1, Ordering::Relaxed);
                let backoff = backoff_ms(
                    state.cfg.payouts.retry_base_ms,
                    state.cfg.payouts.retry_max_ms,
                    attempt,
                );
                eprintln!(
                    "[payouts] retry transaction_id={} payout_id={} attempt={attempt} backoff_ms={backoff} reason={}",
                    job.transaction_id, job.payout_id, e.reason
                );
                tokio::time::sleep(Duration::from_millis(backoff)).await;
                attempt += 1;
            }
            Err(e) => {
                fail_payout(state, &job, e.reason);
                return;
            }
        }
    }
}

fn backoff_ms(base_ms: u64, max_ms: u64, attempt: u32) -> u64 {
    base_ms
        .saturating_mul(1u64 << (attempt - 1).min(20))
        .min(max_ms)
}

fn confirm_payout(state: &AppState, job: &PayoutJob, external_id: String) {
    let updated = state.transactions.update(job.transaction_id, |tx| {
        if let Some(p) = tx.payouts.iter_mut().find(|p| p.payout_id == job.payout_id) {
            p.status = PayoutStatus::Confirmed;
            p.external_payout_id = Some(external_id.clone());
        }
        if tx
            .payouts
            .iter()
            .all(|p| p.status == PayoutStatus::Confirmed)
        {
            tx.status = TransactionStatus::Settled;
        }
    });
    state.perf.payouts_confirmed.fetch_add(1, Ordering::Relaxed);
    if let Ok(tx) = updated {
        if tx.status == TransactionStatus::Settled {
            emit(
                state,
                AuctionEvent::TransactionSettled {
                    transaction_id: tx.transaction_id,
                },
            );
        }
    }
}

fn fail_payout(state: &AppState, job: &PayoutJob, reason: String) {
    eprintln!(
        "[payouts] failed transaction_id={} payout_id={} reason={reason}",
        job.transaction_id, job.payout_id
    );
    let updated = state.transactions.update(job.transaction_id, |tx| {
        if let Some(p) = tx.payouts.iter_mut().find(|p| p.payout_id == job.payout_id) {
            p.status = PayoutStatus::Failed;
            p.failure_reason = Some(reason.clone());
        }
        tx.status = TransactionStatus::Failed;
    });
    state.perf.payouts_failed.fetch_add(1, Ordering::Relaxed);
    if let Ok(tx) = updated {
        emit(
            state,
            AuctionEvent::TransactionFailed {
                transaction_id: tx.transaction_id,
                reason,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Payout;
    use crate::state::test_support::test_state;
    use dashmap::DashMap;
    use std::sync::atomic::AtomicU32;

    struct MockProvider {
        // Failures to inject per idempotency key before succeeding.
        fail_first: u32,
        permanent: bool,
        calls: DashMap<String, u32>,
        total_calls: AtomicU32,
    }

    impl MockProvider {
        fn succeeding() -> Self {
            Self {
                fail_first: 0,
                permanent: false,
                calls: DashMap::new(),
                total_calls: AtomicU32::new(0),
            }
        }

        fn flaky(fail_first: u32) -> Self {
            Self {
                fail_first,
                permanent: false,
                calls: DashMap::new(),
                total_calls: AtomicU32::new(0),
            }
        }

        fn rejecting() -> Self {
            Self {
                fail_first: 0,
                permanent: true,
                calls: DashMap::new(),
                total_calls: AtomicU32::new(0),
            }
        }
    }

    impl PayoutProvider for Arc<MockProvider> {
        async fn send_payout(
            &self,
            _job: &PayoutJob,
            idempotency_key: &str,
        ) -> Result<String, PayoutError> {
            self.total_calls.fetch_add(1, Ordering::Relaxed);
            let mut seen = self.calls.entry(idempotency_key.to_string()).or_insert(0);
            *seen += 1;
            if self.permanent {
                return Err(PayoutError::permanent("account closed"));
            }
            if *seen <= self.fail_first {
                return Err(PayoutError::transient("rail timeout"));
            }
            Ok(format!("ext-{idempotency_key}"))
        }
    }

    fn seeded_transaction(state: &AppState, payees: &[(UserId, i64)]) -> Transaction {
        let payouts = payees
            .iter()
            .map(|(payee, amount)| Payout::pending(*payee, *amount))
            .collect();
        let tx = Transaction::new_pending(777, 10_000, 0, 500, payouts);
        state.transactions.claim_for_auction(tx.clone()).unwrap();
        tx
    }

    async fn wait_for_status(state: &AppState, tx_id: Uuid, want: TransactionStatus) {
        for _ in 0..200 {
            if state.transactions.get(tx_id).unwrap().status == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "transaction never reached {:?}, got {:?}",
            want,
            state.transactions.get(tx_id).unwrap().status
        );
    }

    #[tokio::test]
    async fn all_confirmed_payouts_settle_the_transaction() {
        let (state, prx, _erx) = test_state();
        let provider = Arc::new(MockProvider::succeeding());
        tokio::spawn(run_dispatcher(
            Arc::clone(&state),
            prx,
            Arc::clone(&provider),
        ));

        let tx = seeded_transaction(&state, &[(10, 9_500), (30, 2_000)]);
        enqueue_payouts(&state, &tx).await;

        wait_for_status(&state, tx.transaction_id, TransactionStatus::Settled).await;
        let settled = state.transactions.get(tx.transaction_id).unwrap();
        assert!(settled
            .payouts
            .iter()
            .all(|p| p.status == PayoutStatus::Confirmed && p.external_payout_id.is_some()));
    }

    #[tokio::test]
    async fn transient_failures_are_retried_with_backoff() {
        let (state, prx, _erx) = test_state();
        // Fails twice, succeeds on the third attempt; max_attempts is 3.
        let provider = Arc::new(MockProvider::flaky(2));
        tokio::spawn(run_dispatcher(
            Arc::clone(&state),
            prx,
            Arc::clone(&provider),
        ));

        let tx = seeded_transaction(&state, &[(10, 9_500)]);
        enqueue_payouts(&state, &tx).await;

        wait_for_status(&state, tx.transaction_id, TransactionStatus::Settled).await;
        assert_eq!(provider.total_calls.load(Ordering::Relaxed), 3);
        assert_eq!(state.perf.payout_retries.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_transaction() {
        let (state, prx, _erx) = test_state();
        // Always transient, never succeeds; max_attempts 3 in test config.
        let provider = Arc::new(MockProvider::flaky(u32::MAX));
        tokio::spawn(run_dispatcher(
            Arc::clone(&state),
            prx,
            Arc::clone(&provider),
        ));

        let tx = seeded_transaction(&state, &[(10, 9_500)]);
        enqueue_payouts(&state, &tx).await;

        wait_for_status(&state, tx.transaction_id, TransactionStatus::Failed).await;
        let failed = state.transactions.get(tx.transaction_id).unwrap();
        assert_eq!(failed.payouts[0].status, PayoutStatus::Failed);
        assert!(failed.payouts[0].failure_reason.is_some());
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let (state, prx, _erx) = test_state();
        let provider = Arc::new(MockProvider::rejecting());
        tokio::spawn(run_dispatcher(
            Arc::clone(&state),
            prx,
            Arc::clone(&provider),
        ));

        let tx = seeded_transaction(&state, &[(10, 9_500)]);
        enqueue_payouts(&state, &tx).await;

        wait_for_status(&state, tx.transaction_id, TransactionStatus::Failed).await;
        assert_eq!(provider.total_calls.load(Ordering::Relaxed), 1);
        assert_eq!(state.perf.payout_retries.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn idempotency_key_is_stable_across_attempts() {
        let (state, prx, _erx) = test_state();
        let provider = Arc::new(MockProvider::flaky(1));
        tokio::spawn(run_dispatcher(
            Arc::clone(&state),
            prx,
            Arc::clone(&provider),
        ));

        let tx = seeded_transaction(&state, &[(10, 9_500)]);
        enqueue_payouts(&state, &tx).await;
        wait_for_status(&state, tx.transaction_id, TransactionStatus::Settled).await;

        // Both attempts hit the provider under one key.
        assert_eq!(provider.calls.len(), 1);
        let key = format!("{}:{}", tx.transaction_id, tx.payouts[0].payout_id);
        assert_eq!(*provider.calls.get(&key).unwrap(), 2);
    }
}
