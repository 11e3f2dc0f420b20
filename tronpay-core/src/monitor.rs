//! Payment reconciler.
//!
//! One background task polls the explorer for transfers to the merchant
//! wallet and matches them against the active form set. Per cycle it:
//! - Sweeps overdue forms to `expired` and loads the active set
//! - Fetches transfers since the watermark (never more than 2 h back)
//! - Deduplicates the batch against a bounded seen-set
//! - Fans the batch across active forms through a bounded worker pool
//! - Settles the first matching transfer per form atomically
//! - Invokes the registered callback for a settled form, at most once
//!
//! Shutdown is cooperative: a watch-channel flag checked between every
//! transfer and every form.

use crate::config::PaymentConfig;
use crate::entities::Currency;
use crate::entities::payment_form::PaymentForm;
use crate::entities::transaction::{GetTransactionById, SettleAtomic, SettleOutcome};
use crate::error::PaymentError;
use crate::explorer::TransferSource;
use crate::explorer::types::{self, ParsedTransfer, TransferEnvelope};
use crate::forms::FormManager;
use crate::framework::DatabaseProcessor;
use crate::utils::{mask_address, mask_amount, now_ms, now_secs};
use crate::validation;
use kanau::processor::Processor;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Default pause between reconciliation cycles.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(3);

const MAX_WORKERS: usize = 10;
const CYCLE_DEADLINE: Duration = Duration::from_secs(30);
const RESULT_DEADLINE: Duration = Duration::from_secs(5);
const LOOKBACK: Duration = Duration::from_secs(2 * 3600);
const MAX_CONSECUTIVE_ERRORS: u32 = 5;
const MAX_ERROR_PAUSE: Duration = Duration::from_secs(300);

const MAX_SEEN_TRANSACTIONS: usize = 10_000;
const SEEN_TRIM: usize = 5_000;

/// Invoked after a form settles. Errors are logged and never propagate.
pub type SettlementCallback = Box<
    dyn Fn(&ParsedTransfer, &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
        + Send
        + Sync,
>;

/// Bounded insertion-ordered set of transaction hashes the reconciler has
/// already considered.
struct SeenTransactions {
    set: HashSet<String>,
    order: VecDeque<String>,
}

impl SeenTransactions {
    fn new() -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns true when the hash was not seen before.
    fn insert(&mut self, hash: &str) -> bool {
        if !self.set.insert(hash.to_string()) {
            return false;
        }
        self.order.push_back(hash.to_string());
        if self.set.len() > MAX_SEEN_TRANSACTIONS {
            for _ in 0..SEEN_TRIM {
                match self.order.pop_front() {
                    Some(old) => {
                        self.set.remove(&old);
                    }
                    None => break,
                }
            }
        }
        true
    }
}

/// Claims a transaction id for settlement; the claim is released on drop,
/// whatever path the settlement takes.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    transaction_id: String,
}

impl<'a> InFlightGuard<'a> {
    fn claim(set: &'a Mutex<HashSet<String>>, transaction_id: &str) -> Option<Self> {
        if !lock(set).insert(transaction_id.to_string()) {
            return None;
        }
        Some(Self {
            set,
            transaction_id: transaction_id.to_string(),
        })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        lock(self.set).remove(&self.transaction_id);
    }
}

struct MonitorInner<S: TransferSource> {
    db: Arc<DatabaseProcessor>,
    source: Arc<S>,
    forms: Arc<FormManager<S>>,
    config: Arc<PaymentConfig>,
    seen: Mutex<SeenTransactions>,
    in_flight: Mutex<HashSet<String>>,
    /// Highest transfer timestamp already considered, milliseconds.
    watermark: AtomicI64,
    callbacks: Mutex<HashMap<String, SettlementCallback>>,
}

struct MonitorHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct PaymentMonitor<S: TransferSource + 'static> {
    inner: Arc<MonitorInner<S>>,
    handle: Mutex<Option<MonitorHandle>>,
}

impl<S: TransferSource + 'static> PaymentMonitor<S> {
    pub fn new(
        db: Arc<DatabaseProcessor>,
        source: Arc<S>,
        forms: Arc<FormManager<S>>,
        config: Arc<PaymentConfig>,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                db,
                source,
                forms,
                config,
                seen: Mutex::new(SeenTransactions::new()),
                in_flight: Mutex::new(HashSet::new()),
                watermark: AtomicI64::new(0),
                callbacks: Mutex::new(HashMap::new()),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Register a callback invoked when `form_id` settles. A callback fires
    /// at most once per settled transaction.
    pub fn register_callback(&self, form_id: &str, callback: SettlementCallback) {
        lock(&self.inner.callbacks).insert(form_id.to_string(), callback);
    }

    pub fn unregister_callback(&self, form_id: &str) {
        lock(&self.inner.callbacks).remove(form_id);
    }

    /// Spawn the background reconciliation loop. A no-op while one is
    /// already running.
    pub fn start_monitoring(&self, interval: Duration) {
        let mut handle = lock(&self.handle);
        if handle.as_ref().is_some_and(|h| !h.task.is_finished()) {
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            run_loop(inner, shutdown_rx, interval).await;
        });
        *handle = Some(MonitorHandle { shutdown_tx, task });
        info!("payment monitoring started");
    }

    /// Cooperatively stop the loop and join it.
    pub async fn stop_monitoring(&self) {
        let handle = lock(&self.handle).take();
        if let Some(handle) = handle {
            let _ = handle.shutdown_tx.send(true);
            if let Err(e) = handle.task.await {
                warn!(error = %e, "monitor task ended abnormally");
            }
            info!("payment monitoring stopped");
        }
    }

    pub fn is_monitoring(&self) -> bool {
        lock(&self.handle)
            .as_ref()
            .is_some_and(|h| !h.task.is_finished())
    }

    /// Run a single reconciliation pass.
    pub async fn run_cycle(&self) -> Result<(), PaymentError> {
        let (_tx, shutdown_rx) = watch::channel(false);
        self.inner.run_cycle(&shutdown_rx).await
    }

    /// Highest transfer timestamp considered so far, milliseconds.
    pub fn last_seen_block_timestamp(&self) -> i64 {
        self.inner.watermark.load(Ordering::Acquire)
    }
}

async fn run_loop<S: TransferSource + 'static>(
    inner: Arc<MonitorInner<S>>,
    mut shutdown_rx: watch::Receiver<bool>,
    interval: Duration,
) {
    let mut consecutive_errors: u32 = 0;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let pause = match inner.run_cycle(&shutdown_rx).await {
            Ok(()) => {
                consecutive_errors = 0;
                interval
            }
            Err(e) => {
                consecutive_errors += 1;
                error!(
                    error = %e,
                    consecutive_errors,
                    "reconciliation cycle failed"
                );
                if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    error!(
                        limit = MAX_CONSECUTIVE_ERRORS,
                        "too many consecutive failures, stopping the monitor"
                    );
                    break;
                }
                (interval * consecutive_errors).min(MAX_ERROR_PAUSE)
            }
        };

        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }

            _ = tokio::time::sleep(pause) => {}
        }
    }

    info!("reconciliation loop finished");
}

impl<S: TransferSource + 'static> MonitorInner<S> {
    async fn run_cycle(
        self: &Arc<Self>,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<(), PaymentError> {
        let forms = self.forms.active_forms().await?;
        if forms.is_empty() {
            debug!("no active payment forms to reconcile");
            return Ok(());
        }
        info!(forms = forms.len(), "reconciliation cycle started");

        let since = self
            .watermark
            .load(Ordering::Acquire)
            .max(now_ms() - LOOKBACK.as_millis() as i64);
        let transfers = self
            .source
            .recent_transfers(&self.config.wallet_address, since)
            .await?;

        let batch = self.filter_new(transfers);
        info!(new = batch.len(), "transfer batch ready");
        if batch.is_empty() {
            self.forms.prune_cache();
            return Ok(());
        }
        self.advance_watermark(&batch);

        let worker_cap = forms.len().min(MAX_WORKERS);
        let semaphore = Arc::new(Semaphore::new(worker_cap));
        let batch = Arc::new(batch);

        let mut scans = Vec::with_capacity(forms.len());
        for form in forms {
            let inner = Arc::clone(self);
            let batch = Arc::clone(&batch);
            let semaphore = Arc::clone(&semaphore);
            let shutdown = shutdown.clone();
            let form_id = form.form_id.clone();
            let task = tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return Ok(false);
                };
                inner.scan_form(&form, &batch, &shutdown).await
            });
            scans.push((form_id, task));
        }

        // Bounded drain: slow scans are left running past the deadline, the
        // cycle just stops waiting on them.
        let deadline = Instant::now() + CYCLE_DEADLINE;
        for (form_id, task) in scans {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("cycle deadline exceeded, leaving remaining scans to finish");
                break;
            }
            match tokio::time::timeout(remaining.min(RESULT_DEADLINE), task).await {
                Ok(Ok(Ok(settled))) => {
                    if settled {
                        debug!(form_id = %form_id, "form settled this cycle");
                    }
                }
                Ok(Ok(Err(e))) => error!(form_id = %form_id, error = %e, "form scan failed"),
                Ok(Err(e)) => error!(form_id = %form_id, error = %e, "form scan panicked"),
                Err(_) => warn!(form_id = %form_id, "form scan missed its result deadline"),
            }
        }

        self.forms.prune_cache();
        Ok(())
    }

    /// Keep only batch entries the reconciler has not considered before.
    fn filter_new(&self, transfers: Vec<TransferEnvelope>) -> Vec<TransferEnvelope> {
        let mut seen = lock(&self.seen);
        transfers
            .into_iter()
            .filter(|envelope| seen.insert(&envelope.hash))
            .collect()
    }

    fn advance_watermark(&self, batch: &[TransferEnvelope]) {
        if let Some(max_ts) = batch.iter().map(|envelope| envelope.timestamp).max() {
            self.watermark.fetch_max(max_ts, Ordering::AcqRel);
        }
    }

    /// Scan the batch for the first transfer settling this form.
    async fn scan_form(
        &self,
        form: &PaymentForm,
        batch: &[TransferEnvelope],
        shutdown: &watch::Receiver<bool>,
    ) -> Result<bool, PaymentError> {
        let wallet_lower = self.config.wallet_address.to_lowercase();

        for envelope in batch {
            if *shutdown.borrow() {
                return Ok(false);
            }

            if self
                .db
                .process(GetTransactionById {
                    transaction_id: envelope.hash.clone(),
                })
                .await?
                .is_some()
            {
                continue;
            }

            let Some(parsed) = types::parse_fast(envelope) else {
                continue;
            };

            if (parsed.amount - form.amount).abs() >= crate::amount::AMOUNT_TOLERANCE {
                continue;
            }
            if parsed.currency != form.currency {
                continue;
            }
            if parsed.to_address.to_lowercase() != wallet_lower {
                continue;
            }
            if !self.transfer_confirmed(&parsed).await {
                continue;
            }
            if !self.transfer_acceptable(&parsed) {
                continue;
            }

            info!(
                form_id = %form.form_id,
                from = %mask_address(&parsed.from_address),
                "matching transfer found for form"
            );
            if self.settle(&parsed, form).await? {
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Confirmation gate: a list envelope asserting `confirmed` passes;
    /// anything else requires a detail lookup with enough confirmations
    /// (and, for USDT, the official contract throughout).
    async fn transfer_confirmed(&self, parsed: &ParsedTransfer) -> bool {
        if parsed.confirmed {
            return true;
        }
        let required = self.config.min_confirmations(parsed.currency);
        match self.source.transaction_details(&parsed.transaction_id).await {
            Ok(Some(details)) => {
                if parsed.currency == Currency::Usdt
                    && !validation::details_carry_official_usdt(&details)
                {
                    warn!("transfer details name a counterfeit USDT contract");
                    return false;
                }
                if !validation::has_enough_confirmations(&details, required) {
                    info!(
                        confirmations = details.confirmations,
                        required, "transfer not confirmed deeply enough"
                    );
                    return false;
                }
                true
            }
            Ok(None) => {
                warn!("no details available for unconfirmed transfer");
                false
            }
            Err(e) => {
                warn!(error = %e, "could not fetch details for unconfirmed transfer");
                false
            }
        }
    }

    /// The pure validator pipeline: sender, freshness, contract identity.
    fn transfer_acceptable(&self, parsed: &ParsedTransfer) -> bool {
        if !validation::is_valid_sender(
            &parsed.from_address,
            &self.config.wallet_address,
            &self.config.blacklisted_addresses,
        ) {
            debug!(
                from = %mask_address(&parsed.from_address),
                "transfer sender rejected"
            );
            return false;
        }
        if !validation::is_fresh(
            parsed.timestamp,
            now_ms(),
            self.config.max_transaction_age,
            self.config.future_tolerance,
        ) {
            debug!("transfer rejected as stale or future-dated");
            return false;
        }
        if !validation::is_official_usdt(parsed) {
            warn!("transfer names a counterfeit USDT contract");
            return false;
        }
        true
    }

    /// Claim the transaction, run the atomic settlement, fire the callback.
    async fn settle(
        &self,
        parsed: &ParsedTransfer,
        form: &PaymentForm,
    ) -> Result<bool, PaymentError> {
        let Some(_guard) = InFlightGuard::claim(&self.in_flight, &parsed.transaction_id) else {
            debug!("transaction already being settled by another worker");
            return Ok(false);
        };

        let outcome = self
            .db
            .process(SettleAtomic {
                transaction_id: parsed.transaction_id.clone(),
                from_address: parsed.from_address.clone(),
                to_address: parsed.to_address.clone(),
                amount: parsed.amount,
                currency: parsed.currency,
                form_id: form.form_id.clone(),
                now: now_secs(),
            })
            .await?;

        match outcome {
            SettleOutcome::Settled => {
                info!(
                    form_id = %form.form_id,
                    amount = mask_amount(parsed.amount),
                    currency = %parsed.currency,
                    "payment settled"
                );
                let callback = lock(&self.callbacks).remove(&form.form_id);
                if let Some(callback) = callback {
                    if let Err(e) = callback(parsed, &form.form_id) {
                        error!(form_id = %form.form_id, error = %e, "settlement callback failed");
                    }
                }
                Ok(true)
            }
            other => {
                warn!(form_id = %form.form_id, outcome = ?other, "settlement rejected");
                Ok(false)
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
