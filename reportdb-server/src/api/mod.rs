//! HTTP API endpoints

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use reportdb_core::cache::CacheMetrics;
use reportdb_core::storage::PoolStats;
use reportdb_core::{Event, QueryReceive, ReportDb, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::debug;

/// Application state
pub type AppState = Arc<ReportDb>;

const MSGPACK: &str = "application/msgpack";

/// Create the API router
pub fn create_router(db: Arc<ReportDb>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(health))
        .route("/ping", get(ping))

        // Ingestion
        .route("/events", post(events))

        // Query
        .route("/query", post(query))

        // Stats
        .route("/stats", get(stats))
        .route("/metrics", get(metrics))

        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(db)
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub accepted: usize,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub events_written: u64,
    pub pending_queries: usize,
    pub cache: CacheMetrics,
    pub engines: PoolStats,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl ToString) -> ApiError {
    (status, Json(ErrorResponse { error: error.to_string() }))
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: reportdb_core::VERSION.to_string(),
    })
}

async fn ping() -> &'static str {
    "pong"
}

async fn events(
    State(db): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<IngestResponse>), ApiError> {
    let batch = decode_events(content_type(&headers), &body).map_err(|e| api_error(StatusCode::BAD_REQUEST, e))?;
    let accepted = batch.len();
    debug!(accepted, "event batch received");

    db.ingest(batch)
        .await
        .map_err(|e| api_error(StatusCode::SERVICE_UNAVAILABLE, e))?;

    Ok((StatusCode::ACCEPTED, Json(IngestResponse { accepted })))
}

/// Answers in the request's encoding
async fn query(
    State(db): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<axum::response::Response, ApiError> {
    let content_type = content_type(&headers);
    let request = decode_query(content_type, &body).map_err(|e| api_error(StatusCode::BAD_REQUEST, e))?;
    let response = db.query(request).await;

    if !is_msgpack(content_type) {
        return Ok(Json(response).into_response());
    }
    let bytes = encode_response(&response).map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))?;
    Ok(([(header::CONTENT_TYPE, MSGPACK)], bytes).into_response())
}

async fn stats(State(db): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        events_written: db.events_written(),
        pending_queries: db.pending_queries(),
        cache: db.cache_metrics(),
        engines: db.pool_stats(),
    })
}

async fn metrics(State(db): State<AppState>) -> String {
    let cache = db.cache_metrics();
    let engines = db.pool_stats();

    // Prometheus format
    let mut output = String::new();
    output.push_str("# HELP reportdb_events_written_total Events appended to storage\n");
    output.push_str("# TYPE reportdb_events_written_total counter\n");
    output.push_str(&format!("reportdb_events_written_total {}\n", db.events_written()));

    output.push_str("# HELP reportdb_engines_open Open shard engines\n");
    output.push_str("# TYPE reportdb_engines_open gauge\n");
    output.push_str(&format!("reportdb_engines_open {}\n", engines.engines));
    output.push_str(&format!("reportdb_engines_dirty {}\n", engines.dirty));

    output.push_str("# HELP reportdb_cache_requests_total Series cache lookups\n");
    output.push_str("# TYPE reportdb_cache_requests_total counter\n");
    output.push_str(&format!("reportdb_cache_requests_total{{result=\"hit\"}} {}\n", cache.hits));
    output.push_str(&format!("reportdb_cache_requests_total{{result=\"miss\"}} {}\n", cache.misses));

    output.push_str("# HELP reportdb_queries_pending Queries awaiting a response\n");
    output.push_str("# TYPE reportdb_queries_pending gauge\n");
    output.push_str(&format!("reportdb_queries_pending {}\n", db.pending_queries()));

    output
}

// ============================================================================
// Body encoding
// ============================================================================

fn content_type(headers: &HeaderMap) -> &str {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
}

fn is_msgpack(content_type: &str) -> bool {
    content_type.starts_with(MSGPACK)
}

/// msgpack when the content type says so, JSON otherwise
fn decode_body<T: DeserializeOwned>(content_type: &str, body: &[u8], what: &str) -> Result<T, String> {
    if is_msgpack(content_type) {
        rmp_serde::from_slice(body).map_err(|e| format!("Invalid msgpack {}: {}", what, e))
    } else {
        serde_json::from_slice(body).map_err(|e| format!("Invalid JSON {}: {}", what, e))
    }
}

fn decode_events(content_type: &str, body: &[u8]) -> Result<Vec<Event>, String> {
    decode_body(content_type, body, "batch")
}

fn decode_query(content_type: &str, body: &[u8]) -> Result<QueryReceive, String> {
    decode_body(content_type, body, "query")
}

/// Field names kept, so clients decode the same map the JSON endpoint returns
fn encode_response(response: &Response) -> Result<Vec<u8>, rmp_serde::encode::Error> {
    rmp_serde::to_vec_named(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use reportdb_core::{CounterConfig, DataType, ReportConfig, Value};
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    #[test]
    fn test_decode_json_batch() {
        let body = br#"[{"objectId":1,"counterId":2,"timestamp":100,"value":3},
                        {"objectId":1,"counterId":3,"timestamp":100,"value":"up"}]"#;
        let batch = decode_events("application/json", body).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].value, Value::U64(3));
        assert_eq!(batch[1].value, Value::Str("up".into()));
    }

    #[test]
    fn test_decode_msgpack_batch() {
        let sent = vec![Event::new(4, 1, 200, 1.5), Event::new(5, 1, 201, 7u64)];
        let body = rmp_serde::to_vec_named(&sent).unwrap();
        let batch = decode_events("application/msgpack", &body).unwrap();
        assert_eq!(batch, sent);
    }

    #[test]
    fn test_decode_msgpack_query() {
        let sent = QueryReceive {
            request_id: 12,
            query: reportdb_core::Query::new(3, 100, 200)
                .with_aggregation("MAX")
                .with_interval(10),
        };
        let body = rmp_serde::to_vec_named(&sent).unwrap();
        assert_eq!(decode_query("application/msgpack", &body).unwrap(), sent);

        let json = br#"{"request_id":12,"query_request":{"counter_id":3,"from":100,"to":200}}"#;
        assert_eq!(decode_query("application/json", json).unwrap().query.counter_id, 3);
        assert!(decode_query("application/msgpack", json).is_err());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_events("application/json", b"{not json").is_err());
        assert!(decode_events("application/msgpack", &[0xc1]).is_err());
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_ingest_then_query() {
        let dir = TempDir::new().unwrap();
        let config = ReportConfig::default()
            .with_base_dir(dir.path())
            .with_counter(1, CounterConfig::new("cpu", DataType::Float64));
        let db = Arc::new(ReportDb::start(config).unwrap());
        let app = create_router(db.clone());

        let events = r#"[{"objectId":1,"counterId":1,"timestamp":1000,"value":2.0},
                         {"objectId":2,"counterId":1,"timestamp":1001,"value":4.0}]"#;
        let response = app
            .clone()
            .oneshot(
                Request::post("/events")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(events))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(response).await["accepted"], 2);

        for _ in 0..200 {
            if db.events_written() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let query = r#"{"request_id":5,"query_request":
            {"counter_id":1,"from":0,"to":2000,"aggregation":"AVG"}}"#;
        let response = app
            .clone()
            .oneshot(
                Request::post("/query")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(query))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["request_id"], 5);
        assert_eq!(json["data"], 3.0);

        let query = rmp_serde::to_vec_named(&QueryReceive {
            request_id: 6,
            query: reportdb_core::Query::new(1, 0, 2000).with_aggregation("MAX"),
        })
        .unwrap();
        let response = app
            .clone()
            .oneshot(
                Request::post("/query")
                    .header(header::CONTENT_TYPE, MSGPACK)
                    .body(Body::from(query))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], MSGPACK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let decoded: serde_json::Value = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(decoded["request_id"], 6);
        assert_eq!(decoded["data"], 4.0);

        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        db.shutdown().await;
    }
}
