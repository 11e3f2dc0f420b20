use crate::amount::AMOUNT_TOLERANCE;
use crate::entities::{Currency, TransactionStatus};
use crate::error::PaymentError;
use crate::framework::{DatabaseProcessor, is_busy_error};
use kanau::processor::Processor;
use sqlx::sqlite::SqliteConnection;
use std::time::Duration;
use tracing::warn;

const TX_COLUMNS: &str = "id, transaction_id, from_address, to_address, amount, currency, \
     status, created_at, updated_at, payment_form_id, description";

const MAX_BUSY_RETRIES: u32 = 3;

/// A persisted transaction row.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct TransactionRecord {
    pub id: i64,
    pub transaction_id: String,
    pub from_address: String,
    pub to_address: String,
    pub amount: f64,
    pub currency: Currency,
    pub status: TransactionStatus,
    pub created_at: time::PrimitiveDateTime,
    pub updated_at: time::PrimitiveDateTime,
    pub payment_form_id: Option<String>,
    pub description: Option<String>,
}

/// Result of the settlement critical section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleOutcome {
    /// The form moved to `paid` and the confirmed transaction was inserted.
    Settled,
    /// A transaction with this id already exists.
    AlreadyProcessed,
    /// No pending form with this id.
    FormNotPending,
    /// The form deadline passed before settlement.
    Expired,
    /// Amount or currency does not match the form.
    Mismatch,
    /// The guarded status update affected zero rows.
    RaceLost,
}

impl SettleOutcome {
    /// Collapse into the host-facing error space.
    pub fn into_result(self) -> Result<(), PaymentError> {
        match self {
            SettleOutcome::Settled => Ok(()),
            SettleOutcome::AlreadyProcessed => Err(PaymentError::AlreadyProcessed),
            SettleOutcome::FormNotPending => Err(PaymentError::FormNotPending),
            SettleOutcome::Expired => Err(PaymentError::Expired),
            SettleOutcome::Mismatch => Err(PaymentError::Mismatch),
            SettleOutcome::RaceLost => Err(PaymentError::RaceLost),
        }
    }
}

#[derive(Debug, Clone)]
/// Fetch a transaction by its chain hash.
pub struct GetTransactionById {
    pub transaction_id: String,
}

impl Processor<GetTransactionById> for DatabaseProcessor {
    type Output = Option<TransactionRecord>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetTransactionById")]
    async fn process(
        &self,
        query: GetTransactionById,
    ) -> Result<Option<TransactionRecord>, sqlx::Error> {
        let mut conn = self.acquire().await?;
        sqlx::query_as::<_, TransactionRecord>(&format!(
            "SELECT {TX_COLUMNS} FROM transactions WHERE transaction_id = ? LIMIT 1"
        ))
        .bind(&query.transaction_id)
        .fetch_optional(conn.executor())
        .await
    }
}

#[derive(Debug, Clone)]
/// Fetch all transactions recorded against a form, newest first.
pub struct GetTransactionsByForm {
    pub form_id: String,
}

impl Processor<GetTransactionsByForm> for DatabaseProcessor {
    type Output = Vec<TransactionRecord>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetTransactionsByForm")]
    async fn process(
        &self,
        query: GetTransactionsByForm,
    ) -> Result<Vec<TransactionRecord>, sqlx::Error> {
        let mut conn = self.acquire().await?;
        sqlx::query_as::<_, TransactionRecord>(&format!(
            "SELECT {TX_COLUMNS} FROM transactions \
             WHERE payment_form_id = ? ORDER BY created_at DESC"
        ))
        .bind(&query.form_id)
        .fetch_all(conn.executor())
        .await
    }
}

#[derive(Debug, Clone)]
/// Fetch all transactions still in `pending`, newest first.
pub struct GetPendingTransactions;

impl Processor<GetPendingTransactions> for DatabaseProcessor {
    type Output = Vec<TransactionRecord>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetPendingTransactions")]
    async fn process(
        &self,
        _query: GetPendingTransactions,
    ) -> Result<Vec<TransactionRecord>, sqlx::Error> {
        let mut conn = self.acquire().await?;
        sqlx::query_as::<_, TransactionRecord>(&format!(
            "SELECT {TX_COLUMNS} FROM transactions \
             WHERE status = 'pending' ORDER BY created_at DESC"
        ))
        .fetch_all(conn.executor())
        .await
    }
}

#[derive(Debug, Clone)]
/// Record a transaction outside the settlement path (host bookkeeping).
/// Returns false when the transaction id already exists.
pub struct AddTransaction {
    pub transaction_id: String,
    pub from_address: String,
    pub to_address: String,
    pub amount: f64,
    pub currency: Currency,
    pub status: TransactionStatus,
    pub payment_form_id: Option<String>,
    pub description: Option<String>,
}

impl Processor<AddTransaction> for DatabaseProcessor {
    type Output = bool;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:AddTransaction")]
    async fn process(&self, cmd: AddTransaction) -> Result<bool, sqlx::Error> {
        let mut conn = self.acquire().await?;
        let result = sqlx::query(
            r#"
            INSERT INTO transactions
            (transaction_id, from_address, to_address, amount, currency, status,
             payment_form_id, description)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&cmd.transaction_id)
        .bind(&cmd.from_address)
        .bind(&cmd.to_address)
        .bind(cmd.amount)
        .bind(cmd.currency)
        .bind(cmd.status)
        .bind(&cmd.payment_form_id)
        .bind(&cmd.description)
        .execute(conn.executor())
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, Clone)]
/// The settlement critical section: pair a confirmed transaction with a
/// pending form and flip the form to `paid`, atomically.
pub struct SettleAtomic {
    pub transaction_id: String,
    pub from_address: String,
    pub to_address: String,
    pub amount: f64,
    pub currency: Currency,
    pub form_id: String,
    /// Current time, seconds since the Unix epoch.
    pub now: i64,
}

impl Processor<SettleAtomic> for DatabaseProcessor {
    type Output = SettleOutcome;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:SettleAtomic")]
    async fn process(&self, cmd: SettleAtomic) -> Result<SettleOutcome, sqlx::Error> {
        let _serial = self.settle_lock().lock().await;

        let mut attempt: u32 = 0;
        let mut delay = Duration::from_millis(100);
        loop {
            match settle_once(self, &cmd).await {
                Err(e) if is_busy_error(&e) && attempt < MAX_BUSY_RETRIES => {
                    attempt += 1;
                    warn!(attempt, "settlement hit a busy database, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                other => return other,
            }
        }
    }
}

async fn settle_once(
    db: &DatabaseProcessor,
    cmd: &SettleAtomic,
) -> Result<SettleOutcome, sqlx::Error> {
    let mut conn = db.acquire().await?;
    let conn = conn.executor();

    // Takes the reserved lock up front so the read-check-write sequence
    // below is serializable against other writers.
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

    let outcome = settle_in_tx(conn, cmd).await;
    match &outcome {
        Ok(SettleOutcome::Settled) => {
            sqlx::query("COMMIT").execute(&mut *conn).await?;
        }
        _ => {
            let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
        }
    }
    outcome
}

async fn settle_in_tx(
    conn: &mut SqliteConnection,
    cmd: &SettleAtomic,
) -> Result<SettleOutcome, sqlx::Error> {
    let existing: Option<i64> =
        sqlx::query_scalar("SELECT id FROM transactions WHERE transaction_id = ?")
            .bind(&cmd.transaction_id)
            .fetch_optional(&mut *conn)
            .await?;
    if existing.is_some() {
        return Ok(SettleOutcome::AlreadyProcessed);
    }

    let form: Option<(i64, f64, Currency)> = sqlx::query_as(
        "SELECT expires_at, amount, currency FROM payment_forms \
         WHERE form_id = ? AND status = 'pending'",
    )
    .bind(&cmd.form_id)
    .fetch_optional(&mut *conn)
    .await?;
    let Some((expires_at, expected_amount, expected_currency)) = form else {
        return Ok(SettleOutcome::FormNotPending);
    };

    if cmd.now > expires_at {
        return Ok(SettleOutcome::Expired);
    }
    if (cmd.amount - expected_amount).abs() > AMOUNT_TOLERANCE
        || cmd.currency != expected_currency
    {
        return Ok(SettleOutcome::Mismatch);
    }

    sqlx::query(
        r#"
        INSERT INTO transactions
        (transaction_id, from_address, to_address, amount, currency, status, payment_form_id)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&cmd.transaction_id)
    .bind(&cmd.from_address)
    .bind(&cmd.to_address)
    .bind(cmd.amount)
    .bind(cmd.currency)
    .bind(TransactionStatus::Confirmed)
    .bind(&cmd.form_id)
    .execute(&mut *conn)
    .await?;

    let updated = sqlx::query(
        "UPDATE payment_forms SET status = 'paid', updated_at = CURRENT_TIMESTAMP \
         WHERE form_id = ? AND status = 'pending'",
    )
    .bind(&cmd.form_id)
    .execute(&mut *conn)
    .await?;
    if updated.rows_affected() == 0 {
        return Ok(SettleOutcome::RaceLost);
    }

    Ok(SettleOutcome::Settled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PaymentConfig;
    use crate::entities::FormStatus;
    use crate::entities::payment_form::{CreatePaymentForm, GetPaymentForm};
    use std::sync::Arc;
    use tempfile::TempDir;

    const TEST_WALLET: &str = "TN9RRaXkCFtTXRso2GdTZxSxxwufzxLQPP";
    const SENDER: &str = "TLyqzVGLV1srkB7dToTAEqgDSfPtXRJZYH";
    const NOW: i64 = 1_700_000_000;

    async fn store(dir: &TempDir) -> DatabaseProcessor {
        let config = PaymentConfig {
            database_path: dir.path().join("settle.db"),
            ..PaymentConfig::default()
        };
        DatabaseProcessor::connect(&config).await.unwrap()
    }

    async fn seed_form(db: &DatabaseProcessor, form_id: &str, amount: f64) {
        let created = db
            .process(CreatePaymentForm {
                form_id: form_id.to_string(),
                amount,
                currency: Currency::Usdt,
                description: String::new(),
                wallet_address: TEST_WALLET.to_string(),
                now: NOW,
                expires_hours: 24,
            })
            .await
            .unwrap();
        assert!(created);
    }

    fn settle(tx_id: &str, amount: f64, form_id: &str, now: i64) -> SettleAtomic {
        SettleAtomic {
            transaction_id: tx_id.to_string(),
            from_address: SENDER.to_string(),
            to_address: TEST_WALLET.to_string(),
            amount,
            currency: Currency::Usdt,
            form_id: form_id.to_string(),
            now,
        }
    }

    #[tokio::test]
    async fn settle_pairs_form_and_transaction() {
        let dir = TempDir::new().unwrap();
        let db = store(&dir).await;
        seed_form(&db, "form-1", 5.1234).await;

        let outcome = db
            .process(settle(&"a".repeat(64), 5.1234, "form-1", NOW + 60))
            .await
            .unwrap();
        assert_eq!(outcome, SettleOutcome::Settled);

        let form = db
            .process(GetPaymentForm {
                form_id: "form-1".to_string(),
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(form.status, FormStatus::Paid);

        let row = db
            .process(GetTransactionById {
                transaction_id: "a".repeat(64),
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, TransactionStatus::Confirmed);
        assert_eq!(row.payment_form_id.as_deref(), Some("form-1"));
        assert_eq!(row.amount, 5.1234);
    }

    #[tokio::test]
    async fn settle_is_idempotent_on_transaction_id() {
        let dir = TempDir::new().unwrap();
        let db = store(&dir).await;
        seed_form(&db, "form-1", 5.1234).await;
        seed_form(&db, "form-2", 6.4321).await;

        let tx = "b".repeat(64);
        assert_eq!(
            db.process(settle(&tx, 5.1234, "form-1", NOW + 60))
                .await
                .unwrap(),
            SettleOutcome::Settled
        );
        // same hash again, even against another form
        assert_eq!(
            db.process(settle(&tx, 6.4321, "form-2", NOW + 60))
                .await
                .unwrap(),
            SettleOutcome::AlreadyProcessed
        );

        let form = db
            .process(GetPaymentForm {
                form_id: "form-2".to_string(),
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(form.status, FormStatus::Pending, "form-2 is untouched");
    }

    #[tokio::test]
    async fn settle_rejects_mismatch_and_unknown_form() {
        let dir = TempDir::new().unwrap();
        let db = store(&dir).await;
        seed_form(&db, "form-1", 5.1234).await;

        assert_eq!(
            db.process(settle(&"c".repeat(64), 5.2234, "form-1", NOW + 60))
                .await
                .unwrap(),
            SettleOutcome::Mismatch
        );

        let mut wrong_currency = settle(&"d".repeat(64), 5.1234, "form-1", NOW + 60);
        wrong_currency.currency = Currency::Trx;
        assert_eq!(
            db.process(wrong_currency).await.unwrap(),
            SettleOutcome::Mismatch
        );

        let outcome = db
            .process(settle(&"e".repeat(64), 5.1234, "missing", NOW + 60))
            .await
            .unwrap();
        assert_eq!(outcome, SettleOutcome::FormNotPending);
        assert_eq!(
            outcome.into_result().unwrap_err().kind(),
            "form_not_pending"
        );

        // a tolerance-sized difference still matches
        assert_eq!(
            db.process(settle(&"f".repeat(64), 5.12345, "form-1", NOW + 60))
                .await
                .unwrap(),
            SettleOutcome::Settled
        );
    }

    #[tokio::test]
    async fn settle_refuses_expired_forms() {
        let dir = TempDir::new().unwrap();
        let db = store(&dir).await;
        seed_form(&db, "form-1", 5.1234).await;

        let after_deadline = NOW + 25 * 3600;
        assert_eq!(
            db.process(settle(&"1".repeat(64), 5.1234, "form-1", after_deadline))
                .await
                .unwrap(),
            SettleOutcome::Expired
        );

        let form = db
            .process(GetPaymentForm {
                form_id: "form-1".to_string(),
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(form.status, FormStatus::Pending, "expiry is the sweep's job");
    }

    #[tokio::test]
    async fn concurrent_settles_with_same_hash_yield_one_success() {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(store(&dir).await);
        seed_form(&db, "form-1", 5.1234).await;
        seed_form(&db, "form-2", 5.1234).await;

        let tx = "2".repeat(64);
        let left = {
            let db = Arc::clone(&db);
            let tx = tx.clone();
            tokio::spawn(async move { db.process(settle(&tx, 5.1234, "form-1", NOW + 60)).await })
        };
        let right = {
            let db = Arc::clone(&db);
            let tx = tx.clone();
            tokio::spawn(async move { db.process(settle(&tx, 5.1234, "form-2", NOW + 60)).await })
        };

        let outcomes = [
            left.await.unwrap().unwrap(),
            right.await.unwrap().unwrap(),
        ];
        let settled = outcomes
            .iter()
            .filter(|o| **o == SettleOutcome::Settled)
            .count();
        let duplicates = outcomes
            .iter()
            .filter(|o| **o == SettleOutcome::AlreadyProcessed)
            .count();
        assert_eq!(settled, 1);
        assert_eq!(duplicates, 1);
    }

    #[tokio::test]
    async fn concurrent_settles_on_same_form_yield_one_success() {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(store(&dir).await);
        seed_form(&db, "form-1", 5.1234).await;

        let left = {
            let db = Arc::clone(&db);
            tokio::spawn(
                async move { db.process(settle(&"3".repeat(64), 5.1234, "form-1", NOW + 60)).await },
            )
        };
        let right = {
            let db = Arc::clone(&db);
            tokio::spawn(
                async move { db.process(settle(&"4".repeat(64), 5.1234, "form-1", NOW + 60)).await },
            )
        };

        let outcomes = [
            left.await.unwrap().unwrap(),
            right.await.unwrap().unwrap(),
        ];
        let settled = outcomes
            .iter()
            .filter(|o| **o == SettleOutcome::Settled)
            .count();
        let losers = outcomes
            .iter()
            .filter(|o| {
                matches!(
                    o,
                    SettleOutcome::FormNotPending | SettleOutcome::RaceLost
                )
            })
            .count();
        assert_eq!(settled, 1);
        assert_eq!(losers, 1);

        // exactly one confirmed row exists for the form
        let rows = db
            .process(GetTransactionsByForm {
                form_id: "form-1".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, TransactionStatus::Confirmed);
    }

    #[tokio::test]
    async fn add_transaction_reports_duplicates() {
        let dir = TempDir::new().unwrap();
        let db = store(&dir).await;

        let add = AddTransaction {
            transaction_id: "5".repeat(64),
            from_address: SENDER.to_string(),
            to_address: TEST_WALLET.to_string(),
            amount: 9.5,
            currency: Currency::Trx,
            status: TransactionStatus::Pending,
            payment_form_id: None,
            description: Some("manual entry".to_string()),
        };
        assert!(db.process(add.clone()).await.unwrap());
        assert!(!db.process(add).await.unwrap());

        let pending = db.process(GetPendingTransactions).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].amount, 9.5);
    }
}
