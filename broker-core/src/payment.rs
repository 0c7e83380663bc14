use crate::processor_type::ProcessorType;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Inbound payload for `POST /payments`.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentRequest {
    #[serde(rename = "correlationId")]
    pub correlation_id: Uuid,
    pub amount: Decimal,
}

/// A queue item as it lives in the main queue, the retry queue, or the
/// processing set. `retry_count` is monotone non-decreasing per
/// `correlation_id`; `next_retry_at` is epoch-millis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    #[serde(rename = "correlationId")]
    pub correlation_id: Uuid,
    pub amount: Decimal,
    #[serde(rename = "retryCount", default)]
    pub retry_count: u32,
    #[serde(rename = "nextRetryAt", default)]
    pub next_retry_at: i64,
}

impl QueueItem {
    pub fn new(correlation_id: Uuid, amount: Decimal) -> Self {
        Self {
            correlation_id,
            amount,
            retry_count: 0,
            next_retry_at: 0,
        }
    }
}

/// A committed, immutable ledger row.
#[derive(Debug, Clone)]
pub struct Payment {
    pub correlation_id: Uuid,
    pub amount: Decimal,
    pub processor: ProcessorType,
    pub processed_at: OffsetDateTime,
}

impl Payment {
    pub fn new(correlation_id: Uuid, amount: Decimal, processor: ProcessorType) -> Self {
        Self {
            correlation_id,
            amount,
            processor,
            processed_at: OffsetDateTime::now_utc(),
        }
    }
}
