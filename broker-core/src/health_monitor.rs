use crate::errors::HealthError;
use crate::ledger::Ledger;
use crate::processor_type::ProcessorType;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::{Method, Request};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::interval;

const TICK_INTERVAL: Duration = Duration::from_secs(3);
const PROBE_DEADLINE: Duration = Duration::from_secs(4);
const LEASE_TTL_MS: u64 = 4_000;
const CACHE_TTL_MS: u64 = 15_000;
const LEASE_KEY: &str = "health_check_lock";
const CACHE_KEY: &str = "health_status";

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProcessorHealth {
    #[serde(rename = "isFailing")]
    pub is_failing: bool,
    #[serde(rename = "minResponseTime")]
    pub min_response_time: u32,
}

impl ProcessorHealth {
    fn both_failing() -> HashMap<ProcessorType, ProcessorHealth> {
        let mut m = HashMap::with_capacity(2);
        for p in ProcessorType::ALL {
            m.insert(p, ProcessorHealth { is_failing: true, min_response_time: 0 });
        }
        m
    }
}

#[derive(Debug, Deserialize)]
struct ProbeResponse {
    failing: bool,
    #[serde(rename = "minResponseTime")]
    min_response_time: u32,
}

/// Cluster-shared processor health. A single elected prober (via a TTL
/// lease in the coordination store) polls both processors; every replica
/// reads a cached verdict and mirrors it into a local, I/O-free snapshot.
/// Initial state is both-failing: a replica with no verdict yet queues
/// work rather than blindly calling a processor of unknown health.
pub struct HealthMonitor {
    urls: HashMap<ProcessorType, String>,
    local: Arc<RwLock<HashMap<ProcessorType, ProcessorHealth>>>,
    redis: redis::aio::ConnectionManager,
    http: Client<HttpConnector, Empty<Bytes>>,
    ledger: Arc<Ledger>,
}

impl HealthMonitor {
    pub fn new(
        default_url: String,
        fallback_url: String,
        redis: redis::aio::ConnectionManager,
        ledger: Arc<Ledger>,
    ) -> Self {
        let mut urls = HashMap::with_capacity(2);
        urls.insert(ProcessorType::Default, default_url);
        urls.insert(ProcessorType::Fallback, fallback_url);

        Self {
            urls,
            local: Arc::new(RwLock::new(ProcessorHealth::both_failing())),
            redis,
            http: Client::builder(hyper_util::rt::TokioExecutor::new()).build(HttpConnector::new()),
            ledger,
        }
    }

    /// Spawns the background ticker. Returns immediately.
    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(TICK_INTERVAL);
            loop {
                ticker.tick().await;
                if let Err(e) = this.tick().await {
                    tracing::warn!(error = %e, "health tick failed");
                }
            }
        });
    }

    async fn tick(&self) -> Result<(), HealthError> {
        let mut conn = self.redis.clone();

        match conn.get::<_, Option<String>>(CACHE_KEY).await {
            Ok(Some(cached)) => {
                if let Ok(verdict) = serde_json::from_str::<HashMap<ProcessorType, ProcessorHealth>>(&cached) {
                    *self.local.write().await = verdict;
                    return Ok(());
                }
            }
            Ok(None) => {}
            Err(e) => return Err(HealthError::Unavailable(e.to_string())),
        }

        let acquired: bool = redis::cmd("SET")
            .arg(LEASE_KEY)
            .arg(1)
            .arg("NX")
            .arg("PX")
            .arg(LEASE_TTL_MS)
            .query_async::<Option<String>>(&mut conn)
            .await
            .map(|r| r.is_some())
            .map_err(|e| HealthError::Unavailable(e.to_string()))?;

        if !acquired {
            return Ok(());
        }

        let (default_health, fallback_health) = tokio::join!(
            self.probe(ProcessorType::Default),
            self.probe(ProcessorType::Fallback),
        );

        let mut verdict = HashMap::with_capacity(2);
        verdict.insert(ProcessorType::Default, default_health);
        verdict.insert(ProcessorType::Fallback, fallback_health);

        *self.local.write().await = verdict.clone();

        if let Ok(json) = serde_json::to_string(&verdict) {
            let _: Result<(), _> = conn.set_ex(CACHE_KEY, json, CACHE_TTL_MS / 1000).await;
        }

        self.ledger.mirror_health(&verdict).await;

        Ok(())
    }

    async fn probe(&self, processor: ProcessorType) -> ProcessorHealth {
        let url = self.urls.get(&processor).expect("all processor urls configured");
        match self.probe_inner(url).await {
            Ok(h) => ProcessorHealth {
                is_failing: h.failing,
                min_response_time: h.min_response_time,
            },
            Err(e) => {
                tracing::debug!(?processor, error = %e, "health probe failed");
                ProcessorHealth { is_failing: true, min_response_time: 0 }
            }
        }
    }

    async fn probe_inner(&self, url: &str) -> Result<ProbeResponse, Box<dyn std::error::Error + Send + Sync>> {
        let uri = format!("{}/payments/service-health", url).parse::<hyper::Uri>()?;

        let req = Request::builder()
            .uri(uri)
            .method(Method::GET)
            .header("connection", "close")
            .body(Empty::<Bytes>::new())?;

        let res = tokio::time::timeout(PROBE_DEADLINE, self.http.request(req)).await??;

        if !res.status().is_success() {
            return Err(format!("non-2xx status: {}", res.status()).into());
        }

        let body = res.into_body().collect().await?.to_bytes();
        Ok(serde_json::from_slice(&body)?)
    }

    /// Non-blocking read of the current locally-cached snapshot.
    pub async fn snapshot(&self) -> HashMap<ProcessorType, ProcessorHealth> {
        self.local.read().await.clone()
    }

    /// `[default if healthy, fallback if healthy]`, preferring the cheaper
    /// default whenever it is not known to be failing.
    pub async fn try_order(&self) -> Vec<ProcessorType> {
        let snapshot = self.snapshot().await;
        let mut order = Vec::with_capacity(2);
        if !snapshot.get(&ProcessorType::Default).is_some_and(|h| h.is_failing) {
            order.push(ProcessorType::Default);
        }
        if !snapshot.get(&ProcessorType::Fallback).is_some_and(|h| h.is_failing) {
            order.push(ProcessorType::Fallback);
        }
        order
    }
}
