pub mod config;
pub mod dispatch;
pub mod errors;
pub mod health_monitor;
pub mod ledger;
pub mod payment;
pub mod payment_processor;
pub mod processor_type;
pub mod queue;
pub mod summary;

use config::BrokerConfig;
use dispatch::Dispatch;
use health_monitor::HealthMonitor;
use ledger::Ledger;
use payment_processor::PaymentProcessor;
use queue::Queue;
use std::sync::Arc;
use summary::SummaryService;

/// Every long-lived dependency a broker replica needs, wired up once at
/// startup and handed to the HTTP layer. Lifecycle: open L, open C, start
/// H's ticker, start the drain loop, then start accepting HTTP.
pub struct BrokerState {
    pub dispatch: Arc<Dispatch>,
    pub health: Arc<HealthMonitor>,
    pub queue: Arc<Queue>,
    pub ledger: Arc<Ledger>,
    pub summary: Arc<SummaryService>,
}

impl BrokerState {
    pub async fn build(config: &BrokerConfig) -> Self {
        let ledger = Arc::new(Ledger::new(&config.postgres_url, config.num_db_connections));

        let redis_client = redis::Client::open(config.redis_url.clone())
            .expect("invalid REDIS_URL");
        let redis_conn = redis::aio::ConnectionManager::new(redis_client)
            .await
            .expect("failed to connect to redis");

        let queue = Arc::new(Queue::new(redis_conn.clone()));
        let summary = Arc::new(SummaryService::new(redis_conn.clone(), Arc::clone(&ledger)));

        let health = Arc::new(HealthMonitor::new(
            config.default_processor_url.clone(),
            config.fallback_processor_url.clone(),
            redis_conn,
            Arc::clone(&ledger),
        ));

        let default_processor = Arc::new(PaymentProcessor::new(config.default_processor_url.clone()));
        let fallback_processor = Arc::new(PaymentProcessor::new(config.fallback_processor_url.clone()));

        let dispatch = Arc::new(Dispatch::new(
            Arc::clone(&health),
            Arc::clone(&queue),
            Arc::clone(&ledger),
            Arc::clone(&summary),
            default_processor,
            fallback_processor,
            config.drain_batch_size,
        ));

        Self { dispatch, health, queue, ledger, summary }
    }

    /// Starts the health ticker and the drain loop as background tasks.
    /// Idempotent only in the sense that calling it twice spawns two
    /// drain loops — callers should call this exactly once per replica.
    pub fn start_background_tasks(&self) {
        self.health.start();
        tokio::spawn(Arc::clone(&self.dispatch).run_drain_loop());
    }
}
