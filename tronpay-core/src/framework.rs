//! Database access layer.
//!
//! `DatabaseProcessor` owns the sqlite connection pool and the process-wide
//! settlement mutex. Store operations are command structs in `entities/`
//! processed against it; they acquire a connection through [`DatabaseProcessor::acquire`],
//! which probes liveness on checkout and falls back to a temporary
//! connection when the pool is exhausted past its bounded wait.

use crate::config::PaymentConfig;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions,
    SqliteSynchronous,
};
use sqlx::pool::PoolConnection;
use sqlx::{ConnectOptions, SqlitePool};
use tokio::sync::Mutex;
use tracing::{info, warn};

const CREATE_TRANSACTIONS: &str = r#"
CREATE TABLE IF NOT EXISTS transactions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    transaction_id TEXT UNIQUE NOT NULL,
    from_address TEXT NOT NULL,
    to_address TEXT NOT NULL,
    amount REAL NOT NULL,
    currency TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    payment_form_id TEXT,
    description TEXT
)
"#;

const CREATE_PAYMENT_FORMS: &str = r#"
CREATE TABLE IF NOT EXISTS payment_forms (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    form_id TEXT UNIQUE NOT NULL,
    amount REAL NOT NULL,
    currency TEXT NOT NULL,
    description TEXT,
    status TEXT NOT NULL,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    expires_at TIMESTAMP,
    wallet_address TEXT NOT NULL
)
"#;

const INDICES: [&str; 11] = [
    "CREATE INDEX IF NOT EXISTS idx_transaction_id ON transactions(transaction_id)",
    "CREATE INDEX IF NOT EXISTS idx_payment_form_id ON transactions(payment_form_id)",
    "CREATE INDEX IF NOT EXISTS idx_status ON transactions(status)",
    "CREATE INDEX IF NOT EXISTS idx_transactions_created_at ON transactions(created_at)",
    "CREATE INDEX IF NOT EXISTS idx_transactions_status_created ON transactions(status, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_form_id ON payment_forms(form_id)",
    "CREATE INDEX IF NOT EXISTS idx_form_status ON payment_forms(status)",
    "CREATE INDEX IF NOT EXISTS idx_form_expires ON payment_forms(expires_at)",
    "CREATE INDEX IF NOT EXISTS idx_form_status_expires ON payment_forms(status, expires_at)",
    "CREATE INDEX IF NOT EXISTS idx_form_created_at ON payment_forms(created_at)",
    "CREATE INDEX IF NOT EXISTS idx_form_status_created ON payment_forms(status, created_at)",
];

/// Current schema version tracked through `PRAGMA user_version`.
const SCHEMA_VERSION: i64 = 1;

/// A checked-out store connection. Pooled connections return to the pool on
/// drop; temporary ones are closed on drop.
pub(crate) enum StoreConn {
    Pooled(PoolConnection<sqlx::Sqlite>),
    Temporary(SqliteConnection),
}

impl StoreConn {
    pub(crate) fn executor(&mut self) -> &mut SqliteConnection {
        match self {
            StoreConn::Pooled(conn) => conn,
            StoreConn::Temporary(conn) => conn,
        }
    }
}

/// Owner of the sqlite pool; every store command runs against it.
pub struct DatabaseProcessor {
    pub pool: SqlitePool,
    connect_options: SqliteConnectOptions,
    settle_lock: Mutex<()>,
}

impl DatabaseProcessor {
    /// Open (creating if missing) the database file, configure the pool, and
    /// bring the schema up to date.
    pub async fn connect(config: &PaymentConfig) -> Result<Self, sqlx::Error> {
        let connect_options = SqliteConnectOptions::new()
            .filename(&config.database_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(config.db_connection_timeout)
            .pragma("cache_size", config.db_cache_size.to_string())
            .pragma("mmap_size", config.db_mmap_size.to_string())
            .pragma("temp_store", "MEMORY");

        let pool = SqlitePoolOptions::new()
            .max_connections(config.db_pool_size)
            .min_connections(config.db_pool_size)
            .acquire_timeout(config.db_pool_timeout)
            .test_before_acquire(true)
            .connect_with(connect_options.clone())
            .await?;

        let processor = Self {
            pool,
            connect_options,
            settle_lock: Mutex::new(()),
        };
        processor.init_schema().await?;
        info!(
            path = %config.database_path.display(),
            pool_size = config.db_pool_size,
            "database ready"
        );
        Ok(processor)
    }

    /// Check a connection out of the pool. When the pool stays exhausted past
    /// its bounded wait, a temporary connection is opened instead; it is
    /// closed on drop rather than returned.
    pub(crate) async fn acquire(&self) -> Result<StoreConn, sqlx::Error> {
        match self.pool.acquire().await {
            Ok(conn) => Ok(StoreConn::Pooled(conn)),
            Err(sqlx::Error::PoolTimedOut) => {
                warn!("connection pool exhausted, opening temporary connection");
                let conn = self.connect_options.connect().await?;
                Ok(StoreConn::Temporary(conn))
            }
            Err(e) => Err(e),
        }
    }

    /// Serializes `SettleAtomic` so in-process callers never contend on the
    /// database reserved lock. One mutex per database file.
    pub(crate) fn settle_lock(&self) -> &Mutex<()> {
        &self.settle_lock
    }

    /// Create tables and indices and advance the `user_version` counter.
    async fn init_schema(&self) -> Result<(), sqlx::Error> {
        let mut conn = self.acquire().await?;
        let conn = conn.executor();

        sqlx::query(CREATE_TRANSACTIONS).execute(&mut *conn).await?;
        sqlx::query(CREATE_PAYMENT_FORMS).execute(&mut *conn).await?;
        for statement in INDICES {
            sqlx::query(statement).execute(&mut *conn).await?;
        }

        let version: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&mut *conn)
            .await?;

        if version < SCHEMA_VERSION {
            // v1: payment_forms gained updated_at. Fresh databases already
            // have the column, so a failure here means it exists.
            let _ = sqlx::query(
                "ALTER TABLE payment_forms ADD COLUMN updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP",
            )
            .execute(&mut *conn)
            .await;
            sqlx::query("PRAGMA user_version = 1")
                .execute(&mut *conn)
                .await?;
            info!(from = version, to = SCHEMA_VERSION, "migrated database schema");
        }

        Ok(())
    }

    /// Close the pool, draining all pooled connections.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Whether an error is sqlite reporting a lock-busy condition.
pub(crate) fn is_busy_error(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => {
            let code = db.code();
            let code = code.as_deref();
            code == Some("5")
                || code == Some("6")
                || code == Some("517")
                || db.message().to_ascii_lowercase().contains("locked")
        }
        _ => false,
    }
}
