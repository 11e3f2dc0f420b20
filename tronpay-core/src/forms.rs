//! Form manager.
//!
//! Owns the creation pipeline (rate limits, validation, amount perturbation,
//! persistence), the short-TTL read cache, and the host-facing projections:
//! payment URLs, status checks, and transaction history.

use crate::amount;
use crate::config::PaymentConfig;
use crate::entities::payment_form::{
    CountActiveForms, CreatePaymentForm, GetActivePaymentForms, GetPaymentForm, PaymentForm,
};
use crate::entities::transaction::{
    GetPendingTransactions, GetTransactionsByForm, TransactionRecord,
};
use crate::entities::{Currency, FormStatus, TransactionStatus};
use crate::error::PaymentError;
use crate::explorer::TransferSource;
use crate::framework::DatabaseProcessor;
use crate::utils::{mask_amount, now_ms, now_secs};
use crate::validation::{self, OFFICIAL_USDT_CONTRACT};
use kanau::processor::Processor;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Two amounts closer than this are considered indistinguishable to a payer.
const SIMILARITY_MARGIN: f64 = 0.01;

/// TTL of the cached active-form list used by the reconciler.
const ACTIVE_FORMS_TTL: Duration = Duration::from_secs(10);

/// How many on-chain and local amounts feed the collision set, each.
const COLLISION_SET_LIMIT: usize = 20;

/// A request to mint a payment form.
#[derive(Debug, Clone)]
pub struct CreateFormRequest {
    pub amount: f64,
    pub currency: Currency,
    pub description: String,
    /// Defaults to `DEFAULT_FORM_EXPIRES_HOURS`; must stay within 1..=168.
    pub expires_hours: Option<i64>,
    pub client_ip: Option<IpAddr>,
    pub user_id: Option<String>,
}

/// The projection returned to the host after creation. Carries both the
/// requested amount and the perturbed amount the payer must send.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct CreatedForm {
    pub form_id: String,
    pub amount: f64,
    pub original_amount: f64,
    pub currency: Currency,
    pub description: String,
    pub wallet_address: String,
    pub status: FormStatus,
    /// Absolute deadline, seconds since the Unix epoch.
    pub expires_at: i64,
}

/// Host-facing status projection of a form.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PaymentStatus {
    NotFound,
    Expired,
    Paid {
        transaction_id: String,
        amount: f64,
        currency: Currency,
    },
    Pending {
        transaction_id: String,
    },
    Waiting,
}

struct UserActivity {
    last_at: Instant,
    recent: VecDeque<Instant>,
}

struct FormCache {
    ttl: Duration,
    max_entries: usize,
    entries: Mutex<HashMap<String, (PaymentForm, Instant)>>,
}

impl FormCache {
    fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn get(&self, form_id: &str) -> Option<PaymentForm> {
        let mut entries = lock(&self.entries);
        if let Some((form, cached_at)) = entries.get(form_id) {
            if cached_at.elapsed() < self.ttl {
                return Some(form.clone());
            }
        } else {
            return None;
        }
        entries.remove(form_id);
        None
    }

    fn put(&self, form_id: String, form: PaymentForm) {
        lock(&self.entries).insert(form_id, (form, Instant::now()));
    }

    /// Drop expired entries, then enforce the size bound by evicting the
    /// oldest entries with some headroom.
    fn prune(&self) {
        let mut entries = lock(&self.entries);
        entries.retain(|_, (_, cached_at)| cached_at.elapsed() < self.ttl);

        if entries.len() > self.max_entries {
            let mut by_age: Vec<(String, Instant)> = entries
                .iter()
                .map(|(key, (_, cached_at))| (key.clone(), *cached_at))
                .collect();
            by_age.sort_by_key(|(_, cached_at)| *cached_at);
            let excess = entries.len() - self.max_entries + 100;
            for (key, _) in by_age.into_iter().take(excess) {
                entries.remove(&key);
            }
        }
    }
}

pub struct FormManager<S: TransferSource> {
    db: Arc<DatabaseProcessor>,
    source: Arc<S>,
    config: Arc<PaymentConfig>,
    last_creation: Mutex<Option<Instant>>,
    users: Mutex<HashMap<String, UserActivity>>,
    cache: FormCache,
    active_cache: Mutex<Option<(Vec<PaymentForm>, Instant)>>,
}

impl<S: TransferSource> FormManager<S> {
    pub fn new(db: Arc<DatabaseProcessor>, source: Arc<S>, config: Arc<PaymentConfig>) -> Self {
        let cache = FormCache::new(config.cache_expiry, config.max_form_cache_size);
        Self {
            db,
            source,
            config,
            last_creation: Mutex::new(None),
            users: Mutex::new(HashMap::new()),
            cache,
            active_cache: Mutex::new(None),
        }
    }

    /// Mint a new payment form with a perturbed amount.
    pub async fn create_form(
        &self,
        request: CreateFormRequest,
    ) -> Result<CreatedForm, PaymentError> {
        let expires_hours = request
            .expires_hours
            .unwrap_or(self.config.default_form_expires_hours);

        self.check_creation_limits(request.user_id.as_deref(), request.client_ip)
            .await?;

        let limits = self.config.amount_limits(request.currency);
        if !validation::is_valid_amount(request.amount, &limits, self.config.max_amount_limit) {
            return Err(PaymentError::InvalidArgument(format!(
                "amount {} {} is outside the accepted range or precision",
                request.amount, request.currency
            )));
        }
        if !validation::is_valid_description(
            &request.description,
            self.config.max_description_length,
        ) {
            return Err(PaymentError::InvalidArgument(
                "description contains disallowed content".to_string(),
            ));
        }
        if !validation::is_valid_tron_address(&self.config.wallet_address) {
            return Err(PaymentError::InvalidWallet);
        }
        if !(1..=168).contains(&expires_hours) {
            return Err(PaymentError::InvalidArgument(format!(
                "expires_hours {expires_hours} is outside 1..=168"
            )));
        }

        let collision_amounts = self.collect_collision_amounts(request.currency).await;
        if collision_amounts
            .iter()
            .any(|taken| (request.amount - taken).abs() < SIMILARITY_MARGIN)
        {
            return Err(PaymentError::SimilarToRecent);
        }

        let final_amount = amount::generate_unique_amount(request.amount, &collision_amounts);
        let now = now_secs();

        let mut form_id = Uuid::new_v4().to_string();
        let mut created = self
            .db
            .process(self.create_command(&form_id, final_amount, &request, expires_hours, now))
            .await?;
        if !created {
            // a colliding v4 UUID; one fresh draw is beyond generous
            form_id = Uuid::new_v4().to_string();
            created = self
                .db
                .process(self.create_command(&form_id, final_amount, &request, expires_hours, now))
                .await?;
        }
        if !created {
            return Err(PaymentError::FormPersistFailed);
        }

        info!(
            form_id = %form_id,
            amount = mask_amount(final_amount),
            currency = %request.currency,
            "created payment form"
        );

        Ok(CreatedForm {
            form_id,
            amount: final_amount,
            original_amount: request.amount,
            currency: request.currency,
            description: request.description,
            wallet_address: self.config.wallet_address.clone(),
            status: FormStatus::Pending,
            expires_at: now + expires_hours * 3600,
        })
    }

    fn create_command(
        &self,
        form_id: &str,
        amount: f64,
        request: &CreateFormRequest,
        expires_hours: i64,
        now: i64,
    ) -> CreatePaymentForm {
        CreatePaymentForm {
            form_id: form_id.to_string(),
            amount,
            currency: request.currency,
            description: request.description.clone(),
            wallet_address: self.config.wallet_address.clone(),
            now,
            expires_hours,
        }
    }

    /// Look up a form, serving repeated reads from the short-TTL cache.
    pub async fn get_form(&self, form_id: &str) -> Result<Option<PaymentForm>, PaymentError> {
        if !validation::is_canonical_form_id(form_id) {
            return Ok(None);
        }
        if let Some(hit) = self.cache.get(form_id) {
            return Ok(Some(hit));
        }
        let form = self
            .db
            .process(GetPaymentForm {
                form_id: form_id.to_string(),
            })
            .await?;
        if let Some(form) = &form {
            self.cache.put(form_id.to_string(), form.clone());
        }
        Ok(form)
    }

    /// The active form set for reconciliation: sweeps overdue forms to
    /// `expired` first, then serves a 10-second-TTL snapshot.
    pub async fn active_forms(&self) -> Result<Vec<PaymentForm>, PaymentError> {
        if let Some((forms, cached_at)) = lock(&self.active_cache).as_ref() {
            if cached_at.elapsed() < ACTIVE_FORMS_TTL {
                return Ok(forms.clone());
            }
        }

        let now = now_secs();
        let expired = self
            .db
            .process(crate::entities::payment_form::ExpireOldForms { now })
            .await?;
        if expired > 0 {
            info!(expired, "expired stale payment forms");
        }

        let forms = self.db.process(GetActivePaymentForms { now }).await?;
        *lock(&self.active_cache) = Some((forms.clone(), Instant::now()));
        Ok(forms)
    }

    /// Deep-link for wallet apps.
    pub fn payment_url(&self, form: &PaymentForm) -> String {
        let address = urlencoding::encode(&form.wallet_address);
        let amount = form.amount;
        match form.currency {
            Currency::Trx => format!("tronlink://send?address={address}&amount={amount}"),
            Currency::Usdt => format!(
                "tronlink://send?address={address}&amount={amount}&token={OFFICIAL_USDT_CONTRACT}"
            ),
        }
    }

    /// URI-scheme payload, typically rendered as a QR code by the host.
    pub fn payment_qr_data(&self, form: &PaymentForm) -> String {
        let address = urlencoding::encode(&form.wallet_address);
        let amount = form.amount;
        match form.currency {
            Currency::Trx => format!("tron:{address}?amount={amount}"),
            Currency::Usdt => {
                format!("tron:{address}?amount={amount}&token={OFFICIAL_USDT_CONTRACT}")
            }
        }
    }

    /// Status projection for host polling.
    pub async fn check_payment_status(
        &self,
        form_id: &str,
    ) -> Result<PaymentStatus, PaymentError> {
        let Some(form) = self.get_form(form_id).await? else {
            return Ok(PaymentStatus::NotFound);
        };
        if now_secs() > form.expires_at && form.status != FormStatus::Paid {
            return Ok(PaymentStatus::Expired);
        }

        let transactions = self
            .db
            .process(GetTransactionsByForm {
                form_id: form_id.to_string(),
            })
            .await?;
        match transactions.first() {
            Some(latest) if latest.status == TransactionStatus::Confirmed => {
                Ok(PaymentStatus::Paid {
                    transaction_id: latest.transaction_id.clone(),
                    amount: latest.amount,
                    currency: latest.currency,
                })
            }
            Some(latest) => Ok(PaymentStatus::Pending {
                transaction_id: latest.transaction_id.clone(),
            }),
            None => Ok(PaymentStatus::Waiting),
        }
    }

    /// Stored transactions: those recorded against a form, or all pending.
    pub async fn transaction_history(
        &self,
        form_id: Option<&str>,
    ) -> Result<Vec<TransactionRecord>, PaymentError> {
        let records = match form_id {
            Some(form_id) => {
                self.db
                    .process(GetTransactionsByForm {
                        form_id: form_id.to_string(),
                    })
                    .await?
            }
            None => self.db.process(GetPendingTransactions).await?,
        };
        Ok(records)
    }

    /// Drop stale read-cache entries and enforce its size bound.
    pub fn prune_cache(&self) {
        self.cache.prune();
    }

    async fn check_creation_limits(
        &self,
        user_id: Option<&str>,
        client_ip: Option<IpAddr>,
    ) -> Result<(), PaymentError> {
        let active = self.db.process(CountActiveForms { now: now_secs() }).await?;
        if active >= self.config.max_total_forms {
            return Err(PaymentError::FormCapExceeded {
                active,
                max: self.config.max_total_forms,
            });
        }

        let now = Instant::now();
        {
            let mut last_creation = lock(&self.last_creation);
            if let Some(previous) = *last_creation {
                let since = now.saturating_duration_since(previous);
                if since < self.config.min_form_creation_interval {
                    let wait = self.config.min_form_creation_interval - since;
                    return Err(PaymentError::RateLimited(format!(
                        "form creation too frequent, wait {:.1} s",
                        wait.as_secs_f64()
                    )));
                }
            }
            *last_creation = Some(now);
        }

        if let Some(user_id) = user_id {
            self.check_user_limits(user_id, now)?;
            info!(user_id, "creating form for user");
        }
        if let Some(client_ip) = client_ip {
            info!(client_ip = %client_ip, "creating form for client");
        }
        Ok(())
    }

    fn check_user_limits(&self, user_id: &str, now: Instant) -> Result<(), PaymentError> {
        if !validation::is_valid_user_id(user_id) {
            return Err(PaymentError::InvalidArgument(
                "user_id must be a positive decimal string".to_string(),
            ));
        }

        let hour = Duration::from_secs(3600);
        let mut users = lock(&self.users);

        if let Some(activity) = users.get(user_id) {
            let since = now.saturating_duration_since(activity.last_at);
            if since < self.config.min_user_form_interval {
                let wait = self.config.min_user_form_interval - since;
                return Err(PaymentError::RateLimited(format!(
                    "per-user creation too frequent, wait {:.1} s",
                    wait.as_secs_f64()
                )));
            }
            let in_window = activity
                .recent
                .iter()
                .filter(|at| now.saturating_duration_since(**at) < hour)
                .count();
            if in_window >= self.config.max_user_forms_per_hour as usize {
                return Err(PaymentError::RateLimited(format!(
                    "per-user hourly quota reached ({in_window}/{})",
                    self.config.max_user_forms_per_hour
                )));
            }
        }

        let activity = users
            .entry(user_id.to_string())
            .or_insert_with(|| UserActivity {
                last_at: now,
                recent: VecDeque::new(),
            });
        activity.last_at = now;
        activity.recent.push_back(now);
        while activity
            .recent
            .front()
            .is_some_and(|at| now.saturating_duration_since(*at) >= hour)
        {
            activity.recent.pop_front();
        }

        Self::cleanup_user_counters(
            &mut users,
            now,
            self.config.max_user_counters,
            self.config.user_counters_cleanup,
        );
        Ok(())
    }

    /// Keep the per-user map bounded: stale entries go first, then the
    /// oldest entries until 1000 slots are free.
    fn cleanup_user_counters(
        users: &mut HashMap<String, UserActivity>,
        now: Instant,
        max_users: usize,
        cleanup_after: Duration,
    ) {
        if users.len() <= max_users {
            return;
        }

        let before = users.len();
        users.retain(|_, activity| now.saturating_duration_since(activity.last_at) < cleanup_after);
        if before > users.len() {
            debug!(evicted = before - users.len(), "dropped stale user counters");
        }

        if users.len() > max_users {
            let mut by_age: Vec<(String, Instant)> = users
                .iter()
                .map(|(user, activity)| (user.clone(), activity.last_at))
                .collect();
            by_age.sort_by_key(|(_, last_at)| *last_at);
            let excess = users.len() - max_users + 1000;
            for (user, _) in by_age.into_iter().take(excess) {
                users.remove(&user);
            }
            warn!(evicted = excess, "forced eviction of user counters");
        }
    }

    /// The collision set: active form amounts, locally pending transaction
    /// amounts, and recent on-chain transfer amounts, same currency.
    pub(crate) async fn collect_collision_amounts(&self, currency: Currency) -> Vec<f64> {
        let mut amounts = Vec::new();

        match self.db.process(GetActivePaymentForms { now: now_secs() }).await {
            Ok(forms) => amounts.extend(
                forms
                    .iter()
                    .filter(|form| form.currency == currency)
                    .map(|form| form.amount),
            ),
            Err(e) => warn!(error = %e, "could not load active form amounts"),
        }

        match self.db.process(GetPendingTransactions).await {
            Ok(transactions) => amounts.extend(
                transactions
                    .iter()
                    .filter(|tx| tx.currency == currency)
                    .map(|tx| tx.amount)
                    .take(COLLISION_SET_LIMIT),
            ),
            Err(e) => warn!(error = %e, "could not load pending transaction amounts"),
        }

        let since = now_ms() - 3_600_000;
        match self
            .source
            .recent_transfers(&self.config.wallet_address, since)
            .await
        {
            Ok(envelopes) => {
                let wallet = self.config.wallet_address.to_lowercase();
                let mut taken = 0usize;
                for envelope in &envelopes {
                    if taken >= COLLISION_SET_LIMIT {
                        break;
                    }
                    match self.source.parse_transfer(envelope).await {
                        Ok(Some(parsed))
                            if parsed.currency == currency
                                && parsed.to_address.to_lowercase() == wallet =>
                        {
                            amounts.push(parsed.amount);
                            taken += 1;
                        }
                        Ok(_) => {}
                        Err(e) => debug!(error = %e, "skipping unparsable transfer"),
                    }
                }
            }
            Err(e) => warn!(error = %e, "could not load on-chain amounts"),
        }

        amounts
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::explorer::ExplorerError;
    use crate::explorer::types::TransferEnvelope;
    use async_trait::async_trait;
    use tempfile::TempDir;

    const TEST_WALLET: &str = "TN9RRaXkCFtTXRso2GdTZxSxxwufzxLQPP";

    /// A source with no chain activity.
    struct NullSource;

    #[async_trait]
    impl TransferSource for NullSource {
        async fn recent_transfers(
            &self,
            _address: &str,
            _since_ms: i64,
        ) -> Result<Vec<TransferEnvelope>, ExplorerError> {
            Ok(Vec::new())
        }

        async fn transaction_details(
            &self,
            _transaction_id: &str,
        ) -> Result<Option<crate::explorer::types::TransactionDetails>, ExplorerError> {
            Ok(None)
        }
    }

    fn test_config(dir: &TempDir) -> PaymentConfig {
        PaymentConfig {
            wallet_address: TEST_WALLET.to_string(),
            database_path: dir.path().join("forms.db"),
            min_form_creation_interval: Duration::ZERO,
            min_user_form_interval: Duration::ZERO,
            ..PaymentConfig::default()
        }
    }

    async fn manager_with(config: PaymentConfig) -> FormManager<NullSource> {
        let db = Arc::new(
            DatabaseProcessor::connect(&config)
                .await
                .expect("database connects"),
        );
        FormManager::new(db, Arc::new(NullSource), Arc::new(config))
    }

    fn usdt_request(amount: f64) -> CreateFormRequest {
        CreateFormRequest {
            amount,
            currency: Currency::Usdt,
            description: String::new(),
            expires_hours: None,
            client_ip: None,
            user_id: None,
        }
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with(test_config(&dir)).await;

        let created = manager.create_form(usdt_request(5.0)).await.unwrap();
        assert!(created.amount > 5.0 && created.amount < 6.0);
        assert_eq!(created.amount, crate::utils::round4(created.amount));
        assert_eq!(created.original_amount, 5.0);
        assert_eq!(created.status, FormStatus::Pending);

        let form = manager.get_form(&created.form_id).await.unwrap().unwrap();
        assert_eq!(form.form_id, created.form_id);
        assert_eq!(form.amount, created.amount);
        assert_eq!(form.currency, Currency::Usdt);
        assert_eq!(form.status, FormStatus::Pending);
        assert_eq!(form.wallet_address, TEST_WALLET);

        // second read is served from cache and identical
        let cached = manager.get_form(&created.form_id).await.unwrap().unwrap();
        assert_eq!(cached, form);
    }

    #[tokio::test]
    async fn malformed_form_id_reads_as_absent() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with(test_config(&dir)).await;
        assert!(manager.get_form("not-a-uuid").await.unwrap().is_none());
        assert!(
            manager
                .get_form("550e8400e29b41d4a716446655440000")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn rejects_bad_arguments() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with(test_config(&dir)).await;

        let err = manager.create_form(usdt_request(0.0)).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");

        let err = manager
            .create_form(usdt_request(5.12345))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");

        let mut request = usdt_request(5.0);
        request.description = "<script>".to_string();
        let err = manager.create_form(request).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");

        let mut request = usdt_request(5.0);
        request.expires_hours = Some(0);
        let err = manager.create_form(request).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");

        let mut request = usdt_request(5.0);
        request.expires_hours = Some(169);
        let err = manager.create_form(request).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");

        let mut request = usdt_request(5.0);
        request.user_id = Some("not-digits".to_string());
        let err = manager.create_form(request).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");
    }

    #[tokio::test]
    async fn global_interval_limits_creation() {
        let dir = TempDir::new().unwrap();
        let config = PaymentConfig {
            min_form_creation_interval: Duration::from_secs(60),
            ..test_config(&dir)
        };
        let manager = manager_with(config).await;

        manager.create_form(usdt_request(5.0)).await.unwrap();
        let err = manager.create_form(usdt_request(50.0)).await.unwrap_err();
        assert_eq!(err.kind(), "rate_limited");
    }

    #[tokio::test]
    async fn per_user_hourly_quota() {
        let dir = TempDir::new().unwrap();
        let config = PaymentConfig {
            max_user_forms_per_hour: 2,
            ..test_config(&dir)
        };
        let manager = manager_with(config).await;

        for base in [5.0, 25.0] {
            let mut request = usdt_request(base);
            request.user_id = Some("42".to_string());
            manager.create_form(request).await.unwrap();
        }

        let mut request = usdt_request(95.0);
        request.user_id = Some("42".to_string());
        let err = manager.create_form(request).await.unwrap_err();
        assert_eq!(err.kind(), "rate_limited");

        // a different user is unaffected
        let mut request = usdt_request(95.0);
        request.user_id = Some("43".to_string());
        manager.create_form(request).await.unwrap();
    }

    #[tokio::test]
    async fn global_cap_on_active_forms() {
        let dir = TempDir::new().unwrap();
        let config = PaymentConfig {
            max_total_forms: 1,
            ..test_config(&dir)
        };
        let manager = manager_with(config).await;

        manager.create_form(usdt_request(5.0)).await.unwrap();
        let err = manager.create_form(usdt_request(50.0)).await.unwrap_err();
        assert_eq!(err.kind(), "form_cap_exceeded");
    }

    #[tokio::test]
    async fn similar_amount_is_rejected() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with(test_config(&dir)).await;

        let created = manager.create_form(usdt_request(5.0)).await.unwrap();
        // a base equal to the active form's amount is within the 0.01 margin
        let err = manager
            .create_form(usdt_request(created.amount))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "similar_to_recent");
    }

    #[tokio::test]
    async fn perturbed_amounts_avoid_each_other() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with(test_config(&dir)).await;

        let mut amounts = Vec::new();
        for base in [5.0, 7.0, 9.0, 11.0, 13.0] {
            amounts.push(manager.create_form(usdt_request(base)).await.unwrap().amount);
        }
        for (i, a) in amounts.iter().enumerate() {
            for b in amounts.iter().skip(i + 1) {
                assert!((a - b).abs() >= 1e-4, "{a} and {b} collide");
            }
        }
    }

    #[tokio::test]
    async fn payment_urls_match_wallet_formats() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with(test_config(&dir)).await;

        let created = manager.create_form(usdt_request(5.0)).await.unwrap();
        let form = manager.get_form(&created.form_id).await.unwrap().unwrap();

        let url = manager.payment_url(&form);
        assert!(url.starts_with(&format!("tronlink://send?address={TEST_WALLET}&amount=")));
        assert!(url.ends_with(&format!("&token={OFFICIAL_USDT_CONTRACT}")));

        let qr = manager.payment_qr_data(&form);
        assert!(qr.starts_with(&format!("tron:{TEST_WALLET}?amount=")));
        assert!(qr.contains(&format!("&token={OFFICIAL_USDT_CONTRACT}")));

        let mut trx_request = usdt_request(5.0);
        trx_request.currency = Currency::Trx;
        let created = manager.create_form(trx_request).await.unwrap();
        let form = manager.get_form(&created.form_id).await.unwrap().unwrap();
        let url = manager.payment_url(&form);
        assert!(!url.contains("token="));
    }

    #[tokio::test]
    async fn status_projection_waits_until_paid() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with(test_config(&dir)).await;

        let created = manager.create_form(usdt_request(5.0)).await.unwrap();
        assert_eq!(
            manager.check_payment_status(&created.form_id).await.unwrap(),
            PaymentStatus::Waiting
        );
        assert_eq!(
            manager.check_payment_status("not-a-uuid").await.unwrap(),
            PaymentStatus::NotFound
        );
    }
}
