use crate::entities::{Currency, FormStatus};
use crate::framework::DatabaseProcessor;
use kanau::processor::Processor;

const FORM_COLUMNS: &str = "id, form_id, amount, currency, description, status, \
     created_at, updated_at, expires_at, wallet_address";

/// A persisted payment form row.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct PaymentForm {
    pub id: i64,
    pub form_id: String,
    pub amount: f64,
    pub currency: Currency,
    pub description: Option<String>,
    pub status: FormStatus,
    pub created_at: time::PrimitiveDateTime,
    pub updated_at: time::PrimitiveDateTime,
    /// Absolute deadline, seconds since the Unix epoch.
    pub expires_at: i64,
    pub wallet_address: String,
}

#[derive(Debug, Clone)]
/// Insert a new form in `pending`. Returns false when the form id is taken.
pub struct CreatePaymentForm {
    pub form_id: String,
    pub amount: f64,
    pub currency: Currency,
    pub description: String,
    pub wallet_address: String,
    /// Current time, seconds since the Unix epoch.
    pub now: i64,
    pub expires_hours: i64,
}

impl Processor<CreatePaymentForm> for DatabaseProcessor {
    type Output = bool;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:CreatePaymentForm")]
    async fn process(&self, cmd: CreatePaymentForm) -> Result<bool, sqlx::Error> {
        let expires_at = cmd.now + cmd.expires_hours * 3600;
        let mut conn = self.acquire().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO payment_forms
            (form_id, amount, currency, description, status, expires_at, wallet_address)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&cmd.form_id)
        .bind(cmd.amount)
        .bind(cmd.currency)
        .bind(&cmd.description)
        .bind(FormStatus::Pending)
        .bind(expires_at)
        .bind(&cmd.wallet_address)
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
/// Fetch a form by its identifier.
pub struct GetPaymentForm {
    pub form_id: String,
}

impl Processor<GetPaymentForm> for DatabaseProcessor {
    type Output = Option<PaymentForm>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetPaymentForm")]
    async fn process(&self, query: GetPaymentForm) -> Result<Option<PaymentForm>, sqlx::Error> {
        let mut conn = self.acquire().await?;
        sqlx::query_as::<_, PaymentForm>(&format!(
            "SELECT {FORM_COLUMNS} FROM payment_forms WHERE form_id = ?"
        ))
        .bind(&query.form_id)
        .fetch_optional(conn.executor())
        .await
    }
}

#[derive(Debug, Clone)]
/// Count forms that are pending and not yet past their deadline.
pub struct CountActiveForms {
    /// Current time, seconds since the Unix epoch.
    pub now: i64,
}

impl Processor<CountActiveForms> for DatabaseProcessor {
    type Output = i64;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:CountActiveForms")]
    async fn process(&self, query: CountActiveForms) -> Result<i64, sqlx::Error> {
        let mut conn = self.acquire().await?;
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM payment_forms WHERE status = 'pending' AND expires_at > ?",
        )
        .bind(query.now)
        .fetch_one(conn.executor())
        .await
    }
}

#[derive(Debug, Clone)]
/// Fetch all active forms, newest first.
pub struct GetActivePaymentForms {
    /// Current time, seconds since the Unix epoch.
    pub now: i64,
}

impl Processor<GetActivePaymentForms> for DatabaseProcessor {
    type Output = Vec<PaymentForm>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetActivePaymentForms")]
    async fn process(
        &self,
        query: GetActivePaymentForms,
    ) -> Result<Vec<PaymentForm>, sqlx::Error> {
        let mut conn = self.acquire().await?;
        sqlx::query_as::<_, PaymentForm>(&format!(
            "SELECT {FORM_COLUMNS} FROM payment_forms \
             WHERE status = 'pending' AND expires_at > ? \
             ORDER BY created_at DESC"
        ))
        .bind(query.now)
        .fetch_all(conn.executor())
        .await
    }
}

#[derive(Debug, Clone)]
/// Flip every overdue pending form to `expired` in one statement.
/// Returns the number of rows affected.
pub struct ExpireOldForms {
    /// Current time, seconds since the Unix epoch.
    pub now: i64,
}

impl Processor<ExpireOldForms> for DatabaseProcessor {
    type Output = u64;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:ExpireOldForms")]
    async fn process(&self, cmd: ExpireOldForms) -> Result<u64, sqlx::Error> {
        let mut conn = self.acquire().await?;
        let result = sqlx::query(
            r#"
            UPDATE payment_forms
            SET status = 'expired', updated_at = CURRENT_TIMESTAMP
            WHERE status = 'pending' AND expires_at <= ?
            "#,
        )
        .bind(cmd.now)
        .execute(conn.executor())
        .await?;
        Ok(result.rows_affected())
    }
}
