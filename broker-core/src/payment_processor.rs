use crate::errors::ProcessorError;
use crate::payment::Payment;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use rust_decimal::Decimal;
use serde::Serialize;
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Serialize)]
struct PaymentSubmission {
    #[serde(rename = "correlationId")]
    correlation_id: Uuid,
    amount: Decimal,
    #[serde(rename = "requestedAt", with = "time::serde::rfc3339")]
    requested_at: OffsetDateTime,
}

/// HTTP client for a single external payment processor. One instance per
/// processor (default, fallback); the caller supplies the abort deadline
/// since intake (500ms) and the drain loop (8s, batch-wide) use different
/// budgets for the same client.
pub struct PaymentProcessor {
    payments_url: String,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl PaymentProcessor {
    pub fn new(base_url: String) -> Self {
        let client =
            Client::builder(hyper_util::rt::TokioExecutor::new()).build(HttpConnector::new());

        Self {
            payments_url: format!("{}/payments", base_url),
            client,
        }
    }

    pub async fn process(&self, payment: &Payment, deadline: Duration) -> Result<(), ProcessorError> {
        let body = PaymentSubmission {
            correlation_id: payment.correlation_id,
            amount: payment.amount,
            requested_at: payment.processed_at,
        };

        let json_bytes = serde_json::to_vec(&body).map_err(|_| ProcessorError::InvalidPayment)?;

        let req = Request::builder()
            .method(Method::POST)
            .uri(&self.payments_url)
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(json_bytes)))
            .map_err(|_| ProcessorError::InvalidPayment)?;

        let response = tokio::time::timeout(deadline, self.client.request(req))
            .await
            .map_err(|_| ProcessorError::Timeout)?
            .map_err(|_| ProcessorError::Unavailable)?;

        let status = response.status();

        if status == StatusCode::UNPROCESSABLE_ENTITY {
            return Err(ProcessorError::InvalidPayment);
        }

        if !status.is_success() {
            return Err(ProcessorError::Unavailable);
        }

        Ok(())
    }
}
