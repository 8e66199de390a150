use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Result};
use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use serde::Serialize;
use temperature_series_api::{ApiError, ReadingsQuery, TemperatureApi};
use temperature_series_core::{
    ResponseEnvelope, RetrievalConfig, DEFAULT_MAX_DATA_POINTS, DEFAULT_PAGE_SIZE,
    DEFAULT_RANGE_HOURS, MAX_RANGE_HOURS,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");
const FETCH_FAILED_MESSAGE: &str = "Error fetching data";
const INVALID_QUERY_MESSAGE: &str = "Invalid time range parameters";

#[derive(Debug, Clone)]
struct ServiceState {
    api: TemperatureApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    error: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "temperature-series-service")]
#[command(about = "HTTP service for bounded device temperature series")]
struct Args {
    #[arg(long, env = "TEMPERATURE_DB", default_value = "./temperature_series.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "TEMPERATURE_BIND", default_value = "127.0.0.1:3000")]
    bind: SocketAddr,
    #[arg(
        long,
        env = "TEMPERATURE_MAX_DATA_POINTS",
        default_value_t = DEFAULT_MAX_DATA_POINTS,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    max_data_points: u64,
    #[arg(
        long,
        env = "TEMPERATURE_DEFAULT_RANGE_HOURS",
        default_value_t = DEFAULT_RANGE_HOURS,
        value_parser = clap::value_parser!(i64).range(1..)
    )]
    default_range_hours: i64,
    #[arg(
        long,
        env = "TEMPERATURE_MAX_RANGE_HOURS",
        default_value_t = MAX_RANGE_HOURS,
        value_parser = clap::value_parser!(i64).range(1..)
    )]
    max_range_hours: i64,
    #[arg(
        long,
        env = "TEMPERATURE_DEFAULT_PAGE_SIZE",
        default_value_t = DEFAULT_PAGE_SIZE,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    default_page_size: u64,
}

impl Args {
    fn retrieval_config(&self) -> Result<RetrievalConfig> {
        if self.default_range_hours > self.max_range_hours {
            bail!(
                "--default-range-hours ({}) must not exceed --max-range-hours ({})",
                self.default_range_hours,
                self.max_range_hours
            );
        }
        Ok(RetrievalConfig {
            default_range_hours: self.default_range_hours,
            max_range_hours: self.max_range_hours,
            max_data_points: self.max_data_points,
            default_page_size: self.default_page_size,
        })
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl ServiceError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, error: message.into() }
    }

    fn internal() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, FETCH_FAILED_MESSAGE)
    }
}

impl From<ApiError> for ServiceError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::InvalidRange(message) | ApiError::InvalidPagination(message) => {
                Self::new(StatusCode::BAD_REQUEST, message)
            }
            ApiError::DeviceNotFound => Self::new(StatusCode::NOT_FOUND, "Device not found"),
            ApiError::Store(err) => {
                tracing::error!(error = %format!("{err:#}"), "temperature query failed");
                Self::internal()
            }
        }
    }
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any)
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/openapi", get(openapi))
        .route("/api/temperature/:device_id", get(temperature_readings))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer())
        .with_state(state)
}

fn init_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let config = args.retrieval_config()?;

    let api = TemperatureApi::new(args.db.clone(), config);
    let status = api.migrate()?;
    tracing::info!(
        db = %args.db.display(),
        schema_version = status.current_version,
        max_data_points = api.config().max_data_points,
        "reading store ready"
    );

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "temperature series service listening");
    axum::serve(listener, app(ServiceState { api })).await?;
    Ok(())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn temperature_readings(
    State(state): State<ServiceState>,
    Path(device_id): Path<String>,
    query: Result<Query<ReadingsQuery>, QueryRejection>,
) -> Result<Json<ResponseEnvelope>, ServiceError> {
    let Query(query) = query.map_err(|rejection| {
        tracing::debug!(error = %rejection.body_text(), "query string rejected");
        ServiceError::new(StatusCode::BAD_REQUEST, INVALID_QUERY_MESSAGE)
    })?;
    let api = state.api.clone();
    let joined = tokio::task::spawn_blocking(move || api.fetch_readings(&device_id, &query)).await;
    let result = joined.map_err(|err| {
        tracing::error!(error = %err, "temperature query task did not complete");
        ServiceError::internal()
    })?;
    Ok(Json(result?))
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;
    use axum::body::to_bytes;
    use http::Request;
    use temperature_series_core::Reading;
    use temperature_series_store_sqlite::SqliteStore;
    use tower::ServiceExt;

    const DEVICE: &str = "8ae3b638-7b16-4eed-a2c3-fc2056e71b34";

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("temperature-series-service-{}.sqlite3", ulid::Ulid::new()))
    }

    fn now_seconds() -> i64 {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"));
        i64::try_from(elapsed.as_secs()).unwrap_or_else(|err| panic!("clock overflow: {err}"))
    }

    fn cleanup(db_path: &std::path::Path) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{}", db_path.display(), suffix));
        }
    }

    /// Router over a fresh database holding `count` readings from the last hour.
    fn seeded_router(count: i64, config: RetrievalConfig) -> (Router, PathBuf) {
        let db_path = unique_temp_db_path();
        let api = TemperatureApi::new(db_path.clone(), config);
        if let Err(err) = api.migrate() {
            panic!("failed to migrate test database: {err}");
        }

        let now = now_seconds();
        let readings = (0..count)
            .map(|index| Reading {
                device_id: DEVICE.to_string(),
                timestamp: now - 3000 + index,
                temperature: 22.5,
                is_alarm: false,
            })
            .collect::<Vec<_>>();
        let mut store = SqliteStore::open(&db_path)
            .unwrap_or_else(|err| panic!("failed to open test database: {err}"));
        if let Err(err) = store.insert_readings(&readings) {
            panic!("failed to seed readings: {err}");
        }

        (app(ServiceState { api }), db_path)
    }

    async fn get_json(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = match router
            .oneshot(
                Request::builder()
                    .uri(uri)
                    .method("GET")
                    .body(axum::body::Body::empty())
                    .unwrap_or_else(|err| panic!("failed to build request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        let status = response.status();
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => (status, value),
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    // Test IDs: TSVC-001
    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let state = ServiceState {
            api: TemperatureApi::new(unique_temp_db_path(), RetrievalConfig::default()),
        };

        let (status, value) = get_json(app(state), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value, serde_json::json!({ "status": "ok" }));
    }

    // Test IDs: TSVC-002
    #[tokio::test]
    async fn openapi_endpoint_describes_temperature_route() {
        let state = ServiceState {
            api: TemperatureApi::new(unique_temp_db_path(), RetrievalConfig::default()),
        };

        let response = match app(state)
            .oneshot(
                Request::builder()
                    .uri("/openapi")
                    .method("GET")
                    .body(axum::body::Body::empty())
                    .unwrap_or_else(|err| panic!("failed to build request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = String::from_utf8_lossy(&bytes);
        assert!(body.contains("openapi: 3.1.0"));
        assert!(body.contains("/api/temperature/{deviceId}"));
        assert!(body.contains("samplingEnabled"));
    }

    // Test IDs: TSVC-003
    #[tokio::test]
    async fn unknown_device_returns_not_found() {
        let (router, db_path) = seeded_router(5, RetrievalConfig::default());

        let (status, value) =
            get_json(router, "/api/temperature/00000000-0000-0000-0000-000000000000").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(value, serde_json::json!({ "error": "Device not found" }));

        cleanup(&db_path);
    }

    // Test IDs: TSVC-004
    #[tokio::test]
    async fn non_numeric_range_returns_bad_request() {
        let (router, db_path) = seeded_router(5, RetrievalConfig::default());

        let (status, value) =
            get_json(router, &format!("/api/temperature/{DEVICE}?start=invalid&end=invalid"))
                .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(value.get("error").and_then(serde_json::Value::as_str).is_some());

        cleanup(&db_path);
    }

    // Test IDs: TSVC-005
    #[tokio::test]
    async fn default_query_returns_sampled_series() {
        let config = RetrievalConfig { max_data_points: 500, ..RetrievalConfig::default() };
        let (router, db_path) = seeded_router(50, config);

        let (status, value) = get_json(router, &format!("/api/temperature/{DEVICE}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["meta"]["total_count"], serde_json::json!(50));
        assert_eq!(value["meta"]["sampling_rate"], serde_json::json!(1));
        assert_eq!(value["meta"]["sampling_enabled"], serde_json::json!(true));
        assert_eq!(value["meta"]["max_data_points"], serde_json::json!(500));
        assert!(value["meta"].get("pagination").is_none());
        assert_eq!(value["data"].as_array().map(Vec::len), Some(50));

        cleanup(&db_path);
    }

    // Test IDs: TSVC-006
    #[tokio::test]
    async fn paginated_query_returns_second_page() {
        let (router, db_path) = seeded_router(250, RetrievalConfig::default());

        let (status, value) = get_json(
            router,
            &format!("/api/temperature/{DEVICE}?samplingEnabled=false&page=2&pageSize=100"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            value["meta"]["pagination"],
            serde_json::json!({
                "current_page": 2,
                "items_per_page": 100,
                "has_more_pages": true,
                "total_pages": 3
            })
        );
        assert_eq!(value["meta"]["max_data_points"], serde_json::json!("unlimited"));
        assert_eq!(value["data"].as_array().map(Vec::len), Some(100));

        cleanup(&db_path);
    }

    // Test IDs: TSVC-007
    #[tokio::test]
    async fn zero_page_returns_bad_request() {
        let (router, db_path) = seeded_router(5, RetrievalConfig::default());

        let (status, value) = get_json(
            router,
            &format!("/api/temperature/{DEVICE}?samplingEnabled=false&page=0"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(value.get("error").is_some());

        cleanup(&db_path);
    }

    // Test IDs: TSVC-008
    #[tokio::test]
    async fn oversized_range_returns_bad_request_in_both_modes() {
        let (router, db_path) = seeded_router(5, RetrievalConfig::default());
        let now = now_seconds();
        let start = now - MAX_RANGE_HOURS * 3600 - 1;

        for sampling in ["true", "false"] {
            let (status, value) = get_json(
                router.clone(),
                &format!(
                    "/api/temperature/{DEVICE}?start={start}&end={now}&samplingEnabled={sampling}"
                ),
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(
                value.get("error").and_then(serde_json::Value::as_str),
                Some("Time range too large. Maximum range is 168 hours.")
            );
        }

        cleanup(&db_path);
    }

    // Test IDs: TSVC-009
    #[tokio::test]
    async fn store_failure_returns_generic_server_error() {
        let db_path = unique_temp_db_path();
        // no migration: the readings table does not exist
        let state =
            ServiceState { api: TemperatureApi::new(db_path.clone(), RetrievalConfig::default()) };

        let (status, value) = get_json(app(state), &format!("/api/temperature/{DEVICE}")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(value, serde_json::json!({ "error": FETCH_FAILED_MESSAGE }));

        cleanup(&db_path);
    }

    // Test IDs: TSVC-010
    #[tokio::test]
    async fn undecodable_query_string_returns_json_bad_request() {
        let (router, db_path) = seeded_router(5, RetrievalConfig::default());

        let response = match router
            .oneshot(
                Request::builder()
                    .uri(format!("/api/temperature/{DEVICE}?start=1&start=2"))
                    .method("GET")
                    .body(axum::body::Body::empty())
                    .unwrap_or_else(|err| panic!("failed to build request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let content_type = response
            .headers()
            .get(http::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        assert_eq!(content_type.as_deref(), Some("application/json"));

        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let value: serde_json::Value = match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}"),
        };
        assert_eq!(value, serde_json::json!({ "error": INVALID_QUERY_MESSAGE }));

        cleanup(&db_path);
    }

    #[test]
    fn args_reject_default_window_wider_than_maximum() {
        let args = Args::try_parse_from([
            "temperature-series-service",
            "--default-range-hours",
            "200",
            "--max-range-hours",
            "100",
        ])
        .unwrap_or_else(|err| panic!("arguments should parse: {err}"));
        assert!(args.retrieval_config().is_err());

        let defaults = Args::try_parse_from(["temperature-series-service"])
            .unwrap_or_else(|err| panic!("defaults should parse: {err}"));
        assert!(matches!(defaults.retrieval_config(), Ok(config) if config == RetrievalConfig::default()));
    }
}
