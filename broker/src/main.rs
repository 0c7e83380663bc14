use broker_core::config::BrokerConfig;
use broker_core::dispatch::IntakeOutcome;
use broker_core::payment::PaymentRequest;
use broker_core::BrokerState;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;

const MAX_CONCURRENT_CONNECTIONS: usize = 512;

fn empty() -> BoxBody<Bytes, hyper::Error> {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

fn full<T: Into<Bytes>>(chunk: T) -> BoxBody<Bytes, hyper::Error> {
    Full::new(chunk.into()).map_err(|never| match never {}).boxed()
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<BoxBody<Bytes, hyper::Error>> {
    let payload = serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string());
    let mut res = Response::new(full(payload));
    *res.status_mut() = status;
    res.headers_mut()
        .insert(hyper::header::CONTENT_TYPE, "application/json".parse().unwrap());
    res
}

fn status_only(status: StatusCode) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut res = Response::new(empty());
    *res.status_mut() = status;
    res
}

#[derive(Serialize)]
struct MessageBody {
    message: String,
}

fn message(status: StatusCode, text: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    json_response(status, &MessageBody { message: text.to_string() })
}

fn parse_query_params(req: &Request<Incoming>) -> HashMap<String, String> {
    let query = req.uri().query().unwrap_or("");
    form_urlencoded::parse(query.as_bytes()).into_owned().collect()
}

async fn handle(
    req: Request<Incoming>,
    state: Arc<BrokerState>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/health") => Ok(Response::new(full("OK"))),

        (&Method::POST, "/payments") => {
            let body_bytes = req.into_body().collect().await?.to_bytes();

            let request = match serde_json::from_slice::<PaymentRequest>(&body_bytes) {
                Ok(r) => r,
                Err(_) => return Ok(message(StatusCode::BAD_REQUEST, "invalid payload")),
            };

            match state.dispatch.intake(request).await {
                Ok(IntakeOutcome::Accepted) => Ok(status_only(StatusCode::OK)),
                Ok(IntakeOutcome::Queued) => Ok(status_only(StatusCode::ACCEPTED)),
                Ok(IntakeOutcome::Duplicate) => Ok(status_only(StatusCode::OK)),
                Ok(IntakeOutcome::Invalid) => Ok(message(StatusCode::BAD_REQUEST, "invalid payload")),
                Err(e) => {
                    tracing::error!(error = %e, "intake failed");
                    Ok(message(StatusCode::INTERNAL_SERVER_ERROR, "failed to accept payment"))
                }
            }
        }

        (&Method::GET, "/payments-summary") => {
            let params = parse_query_params(&req);
            let from = params.get("from").and_then(|s| OffsetDateTime::parse(s, &Rfc3339).ok());
            let to = params.get("to").and_then(|s| OffsetDateTime::parse(s, &Rfc3339).ok());

            let summary = state.summary.get_summary(from, to).await;
            Ok(json_response(StatusCode::OK, &summary))
        }

        (&Method::POST, "/purge-payments") => {
            if let Err(e) = state.queue.purge_all().await {
                tracing::error!(error = %e, "purge_all failed");
                return Ok(message(StatusCode::INTERNAL_SERVER_ERROR, "purge failed"));
            }
            if let Err(e) = state.ledger.purge().await {
                tracing::error!(error = %e, "ledger purge failed");
                return Ok(message(StatusCode::INTERNAL_SERVER_ERROR, "purge failed"));
            }
            Ok(message(StatusCode::OK, "purged"))
        }

        (&Method::POST, "/rebuild-summary-cache") => match state.summary.rebuild().await {
            Ok(()) => Ok(message(StatusCode::OK, "summary cache rebuilt")),
            Err(e) => {
                tracing::error!(error = %e, "rebuild_summary_cache failed");
                Ok(message(StatusCode::INTERNAL_SERVER_ERROR, "rebuild failed"))
            }
        },

        _ => Ok(status_only(StatusCode::NOT_FOUND)),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    {
        use tracing_subscriber::{fmt, EnvFilter};
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = fmt().with_env_filter(env_filter).try_init();
    }

    let config = BrokerConfig::from_env();
    tracing::info!(instance_id = %config.instance_id, listen_addr = %config.listen_addr, "starting broker replica");

    let state = Arc::new(BrokerState::build(&config).await);
    state.start_background_tasks();

    let listener = TcpListener::bind(&config.listen_addr).await?;
    let conn_sem = Arc::new(Semaphore::new(MAX_CONCURRENT_CONNECTIONS));

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let state = Arc::clone(&state);
        let sem = Arc::clone(&conn_sem);

        tokio::task::spawn(async move {
            let Ok(_permit) = sem.acquire().await else { return };

            if let Err(err) = http1::Builder::new()
                .keep_alive(true)
                .serve_connection(io, service_fn(move |req| handle(req, Arc::clone(&state))))
                .await
            {
                tracing::debug!(error = %err, "connection error");
            }
        });
    }
}
