use std::env;

/// Configuration for a broker replica, read once at startup. Mirrors the
/// teacher's `*Config::from_env()` shape: required settings panic on a
/// missing variable, optional ones fall back to a documented default.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub listen_addr: String,
    pub postgres_url: String,
    pub redis_url: String,
    pub default_processor_url: String,
    pub fallback_processor_url: String,
    pub num_db_connections: usize,
    pub drain_batch_size: usize,
    pub instance_id: String,
}

impl BrokerConfig {
    pub fn from_env() -> Self {
        Self {
            listen_addr: env::var("BROKER_LISTEN_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            postgres_url: env::var("POSTGRES_URL").expect("POSTGRES_URL must be set"),
            redis_url: env::var("REDIS_URL").expect("REDIS_URL must be set"),
            default_processor_url: env::var("DEFAULT_PROCESSOR_URL")
                .expect("DEFAULT_PROCESSOR_URL must be set"),
            fallback_processor_url: env::var("FALLBACK_PROCESSOR_URL")
                .expect("FALLBACK_PROCESSOR_URL must be set"),
            num_db_connections: env::var("NUM_DB_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(16),
            drain_batch_size: env::var("DRAIN_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            instance_id: env::var("INSTANCE_ID").unwrap_or_else(|_| "broker".to_string()),
        }
    }
}
