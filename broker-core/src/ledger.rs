use crate::errors::LedgerError;
use crate::health_monitor::ProcessorHealth;
use crate::payment::Payment;
use crate::processor_type::ProcessorType;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use rust_decimal::Decimal;
use std::collections::HashMap;
use time::OffsetDateTime;
use tokio_postgres::NoTls;
use uuid::Uuid;

/// Durable, ordered record of accepted payments plus a small health
/// mirror table. Schema:
///
/// ```sql
/// transactions(correlation_id UUID UNIQUE, amount NUMERIC(10,2),
///              processor VARCHAR(20), processed_at TIMESTAMP)
///   indexes: (processed_at), (processor), (processor, processed_at)
/// processor_health(processor_name PK, is_failing, min_response_time, last_checked_at)
/// ```
pub struct Ledger {
    pool: Pool,
}

pub struct ProcessorAggregate {
    pub processor: ProcessorType,
    pub total_requests: i64,
    pub total_amount: Decimal,
}

impl Ledger {
    pub fn new(postgres_url: &str, max_size: usize) -> Self {
        let pg_config = postgres_url
            .parse::<tokio_postgres::Config>()
            .expect("invalid POSTGRES_URL");

        let mgr = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig { recycling_method: RecyclingMethod::Fast },
        );

        let pool = Pool::builder(mgr)
            .max_size(max_size)
            .runtime(deadpool_postgres::Runtime::Tokio1)
            .build()
            .expect("failed to build postgres pool");

        Self { pool }
    }

    /// Idempotent single-row insert, used by the intake path. Returns
    /// whether the row was newly inserted (false on a duplicate
    /// `correlation_id` — at most one row ever exists per id).
    pub async fn insert_one(&self, payment: &Payment) -> Result<bool, LedgerError> {
        let client = self.pool.get().await.map_err(|e| LedgerError::Unavailable(e.to_string()))?;

        let stmt = client
            .prepare_cached(
                "INSERT INTO transactions (correlation_id, amount, processor, processed_at) \
                 VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (correlation_id) DO NOTHING",
            )
            .await
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;

        let rows = client
            .execute(
                &stmt,
                &[
                    &payment.correlation_id,
                    &payment.amount,
                    &payment.processor.as_str(),
                    &payment.processed_at,
                ],
            )
            .await
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;

        Ok(rows == 1)
    }

    /// Batch insert with `ON CONFLICT DO NOTHING`, used by the drain loop.
    /// Returns the `correlation_id`s that were actually newly inserted —
    /// the drain loop increments summary counters only for these.
    pub async fn insert_many(&self, payments: &[Payment]) -> Result<Vec<Uuid>, LedgerError> {
        if payments.is_empty() {
            return Ok(Vec::new());
        }

        let client = self.pool.get().await.map_err(|e| LedgerError::Unavailable(e.to_string()))?;

        let ids: Vec<Uuid> = payments.iter().map(|p| p.correlation_id).collect();
        let amounts: Vec<Decimal> = payments.iter().map(|p| p.amount).collect();
        let processors: Vec<&str> = payments.iter().map(|p| p.processor.as_str()).collect();
        let processed_ats: Vec<OffsetDateTime> = payments.iter().map(|p| p.processed_at).collect();

        let stmt = client
            .prepare_cached(
                "INSERT INTO transactions (correlation_id, amount, processor, processed_at) \
                 SELECT * FROM UNNEST($1::uuid[], $2::numeric[], $3::varchar[], $4::timestamptz[]) \
                 ON CONFLICT (correlation_id) DO NOTHING \
                 RETURNING correlation_id",
            )
            .await
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;

        let rows = client
            .query(&stmt, &[&ids, &amounts, &processors, &processed_ats])
            .await
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;

        Ok(rows.iter().map(|r| r.get::<_, Uuid>(0)).collect())
    }

    pub async fn has_row(&self, correlation_id: Uuid) -> Result<bool, LedgerError> {
        let client = self.pool.get().await.map_err(|e| LedgerError::Unavailable(e.to_string()))?;

        let stmt = client
            .prepare_cached("SELECT 1 FROM transactions WHERE correlation_id = $1")
            .await
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;

        let rows = client
            .query(&stmt, &[&correlation_id])
            .await
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;

        Ok(!rows.is_empty())
    }

    /// Slow-path aggregate for summary rebuild: `GROUP BY processor` over
    /// the full ledger (or the `[from, to]` window when given).
    pub async fn aggregate(
        &self,
        from: Option<OffsetDateTime>,
        to: Option<OffsetDateTime>,
    ) -> Result<Vec<ProcessorAggregate>, LedgerError> {
        let client = self.pool.get().await.map_err(|e| LedgerError::Unavailable(e.to_string()))?;

        let stmt = client
            .prepare_cached(
                "SELECT processor, COUNT(*) AS total_requests, COALESCE(SUM(amount), 0) AS total_amount \
                 FROM transactions \
                 WHERE ($1::timestamptz IS NULL OR processed_at >= $1::timestamptz) \
                   AND ($2::timestamptz IS NULL OR processed_at <= $2::timestamptz) \
                 GROUP BY processor",
            )
            .await
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;

        let rows = client
            .query(&stmt, &[&from, &to])
            .await
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                let processor: &str = row.get("processor");
                ProcessorType::from_str(processor).map(|processor| ProcessorAggregate {
                    processor,
                    total_requests: row.get("total_requests"),
                    total_amount: row.get("total_amount"),
                })
            })
            .collect())
    }

    pub async fn purge(&self) -> Result<(), LedgerError> {
        let client = self.pool.get().await.map_err(|e| LedgerError::Unavailable(e.to_string()))?;
        client
            .batch_execute("TRUNCATE TABLE transactions")
            .await
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;
        Ok(())
    }

    /// Best-effort mirror of the health verdict into L for observability.
    /// Errors are logged, never surfaced — C is the source of truth for H.
    pub async fn mirror_health(&self, verdict: &HashMap<ProcessorType, ProcessorHealth>) {
        let client = match self.pool.get().await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "failed to get postgres client to mirror health");
                return;
            }
        };

        for (processor, health) in verdict {
            let now = OffsetDateTime::now_utc();
            let result = client
                .execute(
                    "INSERT INTO processor_health (processor_name, is_failing, min_response_time, last_checked_at) \
                     VALUES ($1, $2, $3, $4) \
                     ON CONFLICT (processor_name) DO UPDATE SET \
                       is_failing = EXCLUDED.is_failing, \
                       min_response_time = EXCLUDED.min_response_time, \
                       last_checked_at = EXCLUDED.last_checked_at",
                    &[&processor.as_str(), &health.is_failing, &(health.min_response_time as i32), &now],
                )
                .await;

            if let Err(e) = result {
                tracing::warn!(error = %e, "failed to mirror processor health into ledger");
            }
        }
    }
}
