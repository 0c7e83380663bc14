use crate::ledger::Ledger;
use crate::processor_type::ProcessorType;
use redis::AsyncCommands;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

const FAST_PATH_DEADLINE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct ProcessorSummary {
    #[serde(rename = "totalRequests")]
    pub total_requests: i64,
    #[serde(rename = "totalAmount")]
    pub total_amount: Decimal,
}

impl ProcessorSummary {
    fn zero() -> Self {
        Self { total_requests: 0, total_amount: Decimal::ZERO }
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct Summary {
    pub default: ProcessorSummary,
    pub fallback: ProcessorSummary,
}

fn counter_key(processor: ProcessorType) -> String {
    format!("summary:processor:{}", processor)
}

/// Counters kept in the coordination store as an authoritative fast-path
/// mirror of the ledger, rebuildable on demand. Counter increments happen
/// only for newly-inserted ledger rows — duplicate inserts from
/// `ON CONFLICT DO NOTHING` must not increment.
pub struct SummaryService {
    redis: redis::aio::ConnectionManager,
    ledger: Arc<Ledger>,
}

impl SummaryService {
    pub fn new(redis: redis::aio::ConnectionManager, ledger: Arc<Ledger>) -> Self {
        Self { redis, ledger }
    }

    pub async fn increment(&self, processor: ProcessorType, amount: Decimal) {
        let mut conn = self.redis.clone();
        let key = counter_key(processor);
        let result: redis::RedisResult<()> = redis::pipe()
            .atomic()
            .cmd("HINCRBY").arg(&key).arg("total_requests").arg(1).ignore()
            .cmd("HINCRBYFLOAT").arg(&key).arg("total_amount").arg(amount.to_string()).ignore()
            .query_async(&mut conn)
            .await;

        if let Err(e) = result {
            tracing::warn!(error = %e, ?processor, "failed to increment summary counters");
        }
    }

    /// Fast path: read the hash counters in one round-trip per processor.
    /// Date filters are advisory only on this path (see DESIGN.md); on
    /// timeout or store error, returns zero-filled counters for both
    /// processors rather than blocking on the ledger.
    pub async fn get_summary(&self, _from: Option<OffsetDateTime>, _to: Option<OffsetDateTime>) -> Summary {
        match tokio::time::timeout(FAST_PATH_DEADLINE, self.read_counters()).await {
            Ok(Ok(summary)) => summary,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "summary fast path failed, returning zeros");
                Summary { default: ProcessorSummary::zero(), fallback: ProcessorSummary::zero() }
            }
            Err(_) => {
                tracing::warn!("summary fast path timed out, returning zeros");
                Summary { default: ProcessorSummary::zero(), fallback: ProcessorSummary::zero() }
            }
        }
    }

    async fn read_counters(&self) -> Result<Summary, redis::RedisError> {
        let mut conn = self.redis.clone();
        let default = self.read_one(&mut conn, ProcessorType::Default).await?;
        let fallback = self.read_one(&mut conn, ProcessorType::Fallback).await?;
        Ok(Summary { default, fallback })
    }

    async fn read_one(
        &self,
        conn: &mut redis::aio::ConnectionManager,
        processor: ProcessorType,
    ) -> Result<ProcessorSummary, redis::RedisError> {
        let fields: HashMap<String, String> = conn.hgetall(counter_key(processor)).await?;

        let total_requests = fields
            .get("total_requests")
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        let total_amount = fields
            .get("total_amount")
            .and_then(|v| v.parse::<Decimal>().ok())
            .unwrap_or(Decimal::ZERO);

        Ok(ProcessorSummary { total_requests, total_amount })
    }

    /// Slow path: clears the coordination-store counters and rebuilds them
    /// from a full `GROUP BY` over the ledger. An explicit administrative
    /// operation — used after `purge_all` or to recover from counter
    /// drift.
    pub async fn rebuild(&self) -> Result<(), crate::errors::SummaryError> {
        let aggregates = self
            .ledger
            .aggregate(None, None)
            .await
            .map_err(|e| crate::errors::SummaryError::Unavailable(e.to_string()))?;

        let mut conn = self.redis.clone();

        for processor in ProcessorType::ALL {
            let key = counter_key(processor);
            let _: redis::RedisResult<()> = conn.del(&key).await;
        }

        for agg in aggregates {
            let key = counter_key(agg.processor);
            let result: redis::RedisResult<()> = redis::pipe()
                .atomic()
                .cmd("HSET").arg(&key).arg("total_requests").arg(agg.total_requests).ignore()
                .cmd("HSET").arg(&key).arg("total_amount").arg(agg.total_amount.to_string()).ignore()
                .query_async(&mut conn)
                .await;

            if let Err(e) = result {
                return Err(crate::errors::SummaryError::Unavailable(e.to_string()));
            }
        }

        Ok(())
    }
}
