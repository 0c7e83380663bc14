use crate::errors::QueueError;
use crate::payment::QueueItem;
use redis::{AsyncCommands, Script};
use rust_decimal::Decimal;
use uuid::Uuid;

const MAIN_QUEUE_KEY: &str = "payment_queue";
const RETRY_QUEUE_KEY: &str = "payment_retry_queue";
const PROCESSING_KEY: &str = "payment_processing";
const QUEUE_ITEM_TTL_MS: i64 = 3_600_000;
const FAILED_MARKER_TTL_MS: i64 = 86_400_000;
const MAX_RETRIES: u32 = 10;

/// `min(300, 2^r * 5)` seconds. Applied using the retry count *before* the
/// increment that follows a given failure, so the delay between an item's
/// `r`-th failure and its next attempt grows exponentially up to a 300s
/// ceiling.
pub fn backoff_seconds(retry_count_before_increment: u32) -> u64 {
    let exp = 2u64.saturating_pow(retry_count_before_increment.min(32));
    (exp.saturating_mul(5)).min(300)
}

/// An item taken out of the main queue or the retry queue into the
/// processing set. `raw` is the exact serialized form stored in the
/// processing list — `finalize_success`/`reschedule` must echo it back
/// unchanged so the atomic scripts can remove the right occurrence.
#[derive(Debug, Clone)]
pub struct TakenItem {
    pub raw: String,
    pub item: QueueItem,
}

fn queue_item_marker(id: Uuid) -> String {
    format!("queue_item:{}", id)
}

fn processed_marker(id: Uuid) -> String {
    format!("payment_processed:{}", id)
}

fn failed_marker(id: Uuid) -> String {
    format!("payment_failed:{}", id)
}

/// Authoritative FIFO + deferred reschedule + in-flight tracking, built on
/// the shared coordination store. `take_due` and the retry-queue move are
/// single atomic Lua scripts — the teacher's non-atomic pop-then-push
/// pipeline is the latent double-delivery bug this design explicitly
/// avoids (see DESIGN.md).
pub struct Queue {
    redis: redis::aio::ConnectionManager,
    enqueue_script: Script,
    take_batch_script: Script,
    take_due_script: Script,
    finalize_script: Script,
    reschedule_script: Script,
    purge_script: Script,
    reconcile_script: Script,
}

impl Queue {
    pub fn new(redis: redis::aio::ConnectionManager) -> Self {
        Self {
            redis,
            enqueue_script: Script::new(ENQUEUE_SCRIPT),
            take_batch_script: Script::new(TAKE_BATCH_SCRIPT),
            take_due_script: Script::new(TAKE_DUE_SCRIPT),
            finalize_script: Script::new(FINALIZE_SCRIPT),
            reschedule_script: Script::new(RESCHEDULE_SCRIPT),
            purge_script: Script::new(PURGE_SCRIPT),
            reconcile_script: Script::new(RECONCILE_SCRIPT),
        }
    }

    /// Idempotent insert into the main queue. Returns whether insertion
    /// actually occurred (a queue-item marker already present means a
    /// duplicate `enqueue` for the same `correlation_id` within the 1h
    /// marker TTL — a no-op).
    pub async fn enqueue(&self, correlation_id: Uuid, amount: Decimal) -> Result<bool, QueueError> {
        let item = QueueItem::new(correlation_id, amount);
        let raw = serde_json::to_string(&item)?;

        let mut conn = self.redis.clone();
        let inserted: i64 = self
            .enqueue_script
            .key(queue_item_marker(correlation_id))
            .key(MAIN_QUEUE_KEY)
            .arg(raw)
            .arg(QUEUE_ITEM_TTL_MS)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;

        Ok(inserted == 1)
    }

    /// Moves up to `limit` items from the tail of the main queue into the
    /// processing set. Never blocks beyond the coordination-store
    /// round-trip; on a store error returns an empty batch so the caller
    /// retries on the next drain tick.
    pub async fn take_batch(&self, limit: usize, now_ms: i64) -> Vec<TakenItem> {
        let mut conn = self.redis.clone();
        let raws: Vec<String> = match self
            .take_batch_script
            .key(MAIN_QUEUE_KEY)
            .key(PROCESSING_KEY)
            .arg(limit)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await
        {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "take_batch failed, returning empty batch");
                return Vec::new();
            }
        };

        parse_taken(raws)
    }

    /// Atomically reads all retry-queue entries due by `now_ms`, removes
    /// them, and moves them into the processing set — a single scripted
    /// unit, since a partial read-then-remove would risk the same item
    /// being picked up twice by two workers.
    pub async fn take_due(&self, now_ms: i64) -> Vec<TakenItem> {
        let mut conn = self.redis.clone();
        let raws: Vec<String> = match self
            .take_due_script
            .key(RETRY_QUEUE_KEY)
            .key(PROCESSING_KEY)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await
        {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "take_due failed, returning empty batch");
                return Vec::new();
            }
        };

        parse_taken(raws)
    }

    /// For each successfully-delivered item: remove one occurrence from
    /// the processing set, delete the queue-item marker, and set a
    /// processed-marker. Store errors here are logged but not surfaced —
    /// the ledger write already committed and is the source of truth.
    pub async fn finalize_success(&self, raws: &[String]) {
        if raws.is_empty() {
            return;
        }
        let mut conn = self.redis.clone();
        let mut invocation = self.finalize_script.key(PROCESSING_KEY);
        invocation.arg(QUEUE_ITEM_TTL_MS);
        for raw in raws {
            invocation.arg(raw);
        }

        if let Err(e) = invocation.invoke_async::<i64>(&mut conn).await {
            tracing::warn!(error = %e, "finalize_success best-effort cleanup failed");
        }
    }

    /// For each failed item: remove one occurrence from the processing
    /// set; if `retry_count < 10`, increment and insert into the retry
    /// queue with the scheduled backoff; else delete the marker and set a
    /// terminal failed-marker.
    pub async fn reschedule(&self, raws: &[String], now_ms: i64) {
        if raws.is_empty() {
            return;
        }
        let mut conn = self.redis.clone();
        let mut invocation = self.reschedule_script.key(PROCESSING_KEY).key(RETRY_QUEUE_KEY);
        invocation.arg(now_ms).arg(MAX_RETRIES).arg(FAILED_MARKER_TTL_MS);
        for raw in raws {
            invocation.arg(raw);
        }

        if let Err(e) = invocation.invoke_async::<i64>(&mut conn).await {
            tracing::warn!(error = %e, "reschedule failed");
        }
    }

    /// Fail-open duplicate check against the post-commit processed-marker
    /// (duplicate suppression consults either this marker or a ledger row).
    /// A store error here is the caller's to interpret as fail-open.
    pub async fn is_processed(&self, correlation_id: Uuid) -> Result<bool, QueueError> {
        let mut conn = self.redis.clone();
        let exists: bool = conn
            .exists(processed_marker(correlation_id))
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        Ok(exists)
    }

    /// Sets the post-commit processed-marker directly, for callers that
    /// commit outside the batch `finalize_success` path — namely the
    /// intake path's own synchronous ledger insert. Best effort: the
    /// ledger row is already the source of truth.
    pub async fn mark_processed(&self, correlation_id: Uuid) {
        let mut conn = self.redis.clone();
        let result: redis::RedisResult<()> = conn
            .set_ex(processed_marker(correlation_id), "1", (QUEUE_ITEM_TTL_MS / 1000) as u64)
            .await;

        if let Err(e) = result {
            tracing::warn!(error = %e, %correlation_id, "failed to set processed-marker after intake commit");
        }
    }

    /// Administrative: clears the main queue, retry queue, processing set,
    /// and every per-`correlation_id` marker.
    pub async fn purge_all(&self) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        self.purge_script
            .key(MAIN_QUEUE_KEY)
            .key(RETRY_QUEUE_KEY)
            .key(PROCESSING_KEY)
            .invoke_async::<()>(&mut conn)
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))
    }

    /// Moves processing-set items older than `max_age_ms` back into the
    /// retry queue with `retry_count` preserved, recovering items orphaned
    /// by a worker that crashed mid-batch. Not exposed over HTTP — an
    /// operator-triggered or periodic internal job only.
    pub async fn reconcile_orphans(&self, max_age_ms: i64, now_ms: i64) -> Result<u64, QueueError> {
        let mut conn = self.redis.clone();
        self.reconcile_script
            .key(PROCESSING_KEY)
            .key(RETRY_QUEUE_KEY)
            .arg(now_ms)
            .arg(max_age_ms)
            .invoke_async::<u64>(&mut conn)
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))
    }
}

fn parse_taken(raws: Vec<String>) -> Vec<TakenItem> {
    raws.into_iter()
        .filter_map(|raw| match serde_json::from_str::<QueueItem>(&raw) {
            Ok(item) => Some(TakenItem { raw, item }),
            Err(e) => {
                tracing::warn!(error = %e, "dropping unparsable queue item");
                None
            }
        })
        .collect()
}

const ENQUEUE_SCRIPT: &str = r#"
local marker_key = KEYS[1]
local queue_key = KEYS[2]
local raw = ARGV[1]
local ttl_ms = ARGV[2]
if redis.call('EXISTS', marker_key) == 1 then
  return 0
end
redis.call('SET', marker_key, '1', 'PX', ttl_ms)
redis.call('LPUSH', queue_key, raw)
return 1
"#;

const TAKE_BATCH_SCRIPT: &str = r#"
local main_key = KEYS[1]
local processing_key = KEYS[2]
local limit = tonumber(ARGV[1])
local now = ARGV[2]
local taken = {}
for i = 1, limit do
  local raw = redis.call('RPOP', main_key)
  if not raw then break end
  local item = cjson.decode(raw)
  item.takenAt = tonumber(now)
  local stamped = cjson.encode(item)
  redis.call('LPUSH', processing_key, stamped)
  table.insert(taken, stamped)
end
return taken
"#;

const TAKE_DUE_SCRIPT: &str = r#"
local retry_key = KEYS[1]
local processing_key = KEYS[2]
local now = ARGV[1]
local due = redis.call('ZRANGEBYSCORE', retry_key, '-inf', now)
local taken = {}
if #due > 0 then
  redis.call('ZREM', retry_key, unpack(due))
  for _, raw in ipairs(due) do
    local item = cjson.decode(raw)
    item.takenAt = tonumber(now)
    local stamped = cjson.encode(item)
    redis.call('LPUSH', processing_key, stamped)
    table.insert(taken, stamped)
  end
end
return taken
"#;

const FINALIZE_SCRIPT: &str = r#"
local processing_key = KEYS[1]
local processed_ttl_ms = ARGV[1]
for i = 2, #ARGV do
  local raw = ARGV[i]
  redis.call('LREM', processing_key, 1, raw)
  local item = cjson.decode(raw)
  redis.call('DEL', 'queue_item:' .. item.correlationId)
  redis.call('SET', 'payment_processed:' .. item.correlationId, '1', 'PX', processed_ttl_ms)
end
return 1
"#;

const RESCHEDULE_SCRIPT: &str = r#"
local processing_key = KEYS[1]
local retry_key = KEYS[2]
local now = tonumber(ARGV[1])
local max_retries = tonumber(ARGV[2])
local failed_ttl_ms = ARGV[3]
for i = 4, #ARGV do
  local raw = ARGV[i]
  redis.call('LREM', processing_key, 1, raw)
  local item = cjson.decode(raw)
  item.takenAt = nil
  if item.retryCount < max_retries then
    local backoff_s = math.min(300, math.pow(2, item.retryCount) * 5)
    item.retryCount = item.retryCount + 1
    item.nextRetryAt = now + (backoff_s * 1000)
    local new_raw = cjson.encode(item)
    redis.call('ZADD', retry_key, item.nextRetryAt, new_raw)
  else
    redis.call('DEL', 'queue_item:' .. item.correlationId)
    redis.call('SET', 'payment_failed:' .. item.correlationId, '1', 'PX', failed_ttl_ms)
  end
end
return 1
"#;

const PURGE_SCRIPT: &str = r#"
local main_key = KEYS[1]
local retry_key = KEYS[2]
local processing_key = KEYS[3]
redis.call('DEL', main_key, retry_key, processing_key)
for _, pattern in ipairs({'queue_item:*', 'payment_processed:*', 'payment_failed:*'}) do
  local cursor = '0'
  repeat
    local result = redis.call('SCAN', cursor, 'MATCH', pattern, 'COUNT', 1000)
    cursor = result[1]
    local keys = result[2]
    if #keys > 0 then
      redis.call('DEL', unpack(keys))
    end
  until cursor == '0'
end
return 1
"#;

const RECONCILE_SCRIPT: &str = r#"
local processing_key = KEYS[1]
local retry_key = KEYS[2]
local now = tonumber(ARGV[1])
local max_age_ms = tonumber(ARGV[2])
local all = redis.call('LRANGE', processing_key, 0, -1)
local moved = 0
for _, raw in ipairs(all) do
  local item = cjson.decode(raw)
  local taken_at = item.takenAt or 0
  if (now - taken_at) > max_age_ms then
    redis.call('LREM', processing_key, 1, raw)
    item.takenAt = nil
    local restored = cjson.encode(item)
    redis.call('ZADD', retry_key, item.nextRetryAt > 0 and item.nextRetryAt or now, restored)
    moved = moved + 1
  end
end
return moved
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_matches_formula() {
        assert_eq!(backoff_seconds(0), 5);
        assert_eq!(backoff_seconds(1), 10);
        assert_eq!(backoff_seconds(2), 20);
        assert_eq!(backoff_seconds(3), 40);
        assert_eq!(backoff_seconds(4), 80);
        assert_eq!(backoff_seconds(5), 160);
        assert_eq!(backoff_seconds(6), 300);
        assert_eq!(backoff_seconds(7), 300);
        assert_eq!(backoff_seconds(10), 300);
    }

    #[test]
    fn queue_item_round_trips_through_json() {
        let id = Uuid::new_v4();
        let item = QueueItem::new(id, Decimal::new(1050, 2));
        let raw = serde_json::to_string(&item).unwrap();
        let parsed: QueueItem = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.correlation_id, id);
        assert_eq!(parsed.retry_count, 0);
    }
}
