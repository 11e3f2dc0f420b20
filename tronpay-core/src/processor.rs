//! The host-facing entry point.
//!
//! `PaymentProcessor` wires configuration, store, explorer client, form
//! manager, and reconciler together and exposes the whole engine surface
//! behind one handle. Hosts that want finer control (or a different
//! [`TransferSource`]) can assemble the pieces themselves.

use crate::config::PaymentConfig;
use crate::entities::payment_form::PaymentForm;
use crate::entities::transaction::TransactionRecord;
use crate::error::PaymentError;
use crate::explorer::ExplorerClient;
use crate::forms::{CreateFormRequest, CreatedForm, FormManager, PaymentStatus};
use crate::monitor::{DEFAULT_CHECK_INTERVAL, PaymentMonitor, SettlementCallback};
use crate::utils::mask_address;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub struct PaymentProcessor {
    config: Arc<PaymentConfig>,
    db: Arc<crate::framework::DatabaseProcessor>,
    forms: Arc<FormManager<ExplorerClient>>,
    monitor: PaymentMonitor<ExplorerClient>,
}

impl PaymentProcessor {
    /// Build the engine from a validated configuration: open the database,
    /// construct the explorer client, and assemble the components.
    pub async fn new(config: PaymentConfig) -> Result<Self, PaymentError> {
        config
            .validate()
            .map_err(|e| PaymentError::InvalidArgument(e.to_string()))?;

        let db = Arc::new(crate::framework::DatabaseProcessor::connect(&config).await?);
        let explorer = Arc::new(ExplorerClient::new(
            &config.api_url,
            config.requests_per_minute,
            config.api_cache_ttl,
        )?);
        let config = Arc::new(config);

        let forms = Arc::new(FormManager::new(
            Arc::clone(&db),
            Arc::clone(&explorer),
            Arc::clone(&config),
        ));
        let monitor = PaymentMonitor::new(
            Arc::clone(&db),
            explorer,
            Arc::clone(&forms),
            Arc::clone(&config),
        );

        info!(
            wallet = %mask_address(&config.wallet_address),
            "payment processor initialized"
        );

        Ok(Self {
            config,
            db,
            forms,
            monitor,
        })
    }

    pub fn config(&self) -> &PaymentConfig {
        &self.config
    }

    /// Mint a payment form with a perturbed amount.
    pub async fn create_payment_form(
        &self,
        request: CreateFormRequest,
    ) -> Result<CreatedForm, PaymentError> {
        self.forms.create_form(request).await
    }

    /// Look up a form by its canonical identifier.
    pub async fn get_payment_form(
        &self,
        form_id: &str,
    ) -> Result<Option<PaymentForm>, PaymentError> {
        self.forms.get_form(form_id).await
    }

    /// Wallet deep-link for a form.
    pub async fn generate_payment_url(&self, form_id: &str) -> Result<String, PaymentError> {
        let form = self
            .forms
            .get_form(form_id)
            .await?
            .ok_or(PaymentError::FormNotFound)?;
        Ok(self.forms.payment_url(&form))
    }

    /// URI-scheme payload for a form, typically rendered as a QR code.
    pub async fn generate_payment_qr_data(&self, form_id: &str) -> Result<String, PaymentError> {
        let form = self
            .forms
            .get_form(form_id)
            .await?
            .ok_or(PaymentError::FormNotFound)?;
        Ok(self.forms.payment_qr_data(&form))
    }

    /// Current settlement state of a form.
    pub async fn check_payment_status(
        &self,
        form_id: &str,
    ) -> Result<PaymentStatus, PaymentError> {
        self.forms.check_payment_status(form_id).await
    }

    /// Stored transactions for a form, or all pending ones.
    pub async fn transaction_history(
        &self,
        form_id: Option<&str>,
    ) -> Result<Vec<TransactionRecord>, PaymentError> {
        self.forms.transaction_history(form_id).await
    }

    /// Register a settlement callback for a form. It fires at most once.
    pub fn register_payment_callback(&self, form_id: &str, callback: SettlementCallback) {
        self.monitor.register_callback(form_id, callback);
    }

    pub fn unregister_payment_callback(&self, form_id: &str) {
        self.monitor.unregister_callback(form_id);
    }

    /// Start the background reconciliation loop.
    pub fn start_monitoring(&self, interval: Option<Duration>) {
        self.monitor
            .start_monitoring(interval.unwrap_or(DEFAULT_CHECK_INTERVAL));
    }

    /// Cooperatively stop the reconciliation loop.
    pub async fn stop_monitoring(&self) {
        self.monitor.stop_monitoring().await;
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.is_monitoring()
    }

    /// Run a single reconciliation pass without the background loop.
    pub async fn run_reconciliation_cycle(&self) -> Result<(), PaymentError> {
        self.monitor.run_cycle().await
    }

    /// Close the database pool.
    pub async fn close(&self) {
        self.db.close().await;
    }
}
