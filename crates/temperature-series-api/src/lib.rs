use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use temperature_series_core::{
    assemble_response, plan_retrieval, resolve_time_window, PageRequest, Reading,
    ResponseEnvelope, RetrievalConfig, RetrievalError, RetrievalPlan, TimeWindow,
};
use temperature_series_store_sqlite::{DeviceSpan, SchemaStatus, SqliteStore};
use time::OffsetDateTime;

/// Read capabilities the retrieval flow needs from a reading store.
pub trait ReadingStore {
    /// # Errors
    /// Returns an error when the store cannot be queried.
    fn device_exists(&self, device_id: &str) -> Result<bool>;

    /// # Errors
    /// Returns an error when the store cannot be queried.
    fn count_readings(&self, device_id: &str, window: TimeWindow) -> Result<u64>;

    /// Every `sampling_rate`-th reading in ascending timestamp order.
    ///
    /// # Errors
    /// Returns an error when the store cannot be queried.
    fn sample_readings(
        &self,
        device_id: &str,
        window: TimeWindow,
        sampling_rate: u64,
    ) -> Result<Vec<Reading>>;

    /// Raw readings `[offset, offset + limit)` in ascending timestamp order.
    ///
    /// # Errors
    /// Returns an error when the store cannot be queried.
    fn page_readings(
        &self,
        device_id: &str,
        window: TimeWindow,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Reading>>;
}

impl ReadingStore for SqliteStore {
    fn device_exists(&self, device_id: &str) -> Result<bool> {
        SqliteStore::device_exists(self, device_id)
    }

    fn count_readings(&self, device_id: &str, window: TimeWindow) -> Result<u64> {
        SqliteStore::count_readings(self, device_id, window)
    }

    fn sample_readings(
        &self,
        device_id: &str,
        window: TimeWindow,
        sampling_rate: u64,
    ) -> Result<Vec<Reading>> {
        SqliteStore::sample_readings(self, device_id, window, sampling_rate)
    }

    fn page_readings(
        &self,
        device_id: &str,
        window: TimeWindow,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Reading>> {
        SqliteStore::page_readings(self, device_id, window, offset, limit)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    InvalidRange(String),
    #[error("{0}")]
    InvalidPagination(String),
    #[error("Device not found")]
    DeviceNotFound,
    #[error("store failure: {0:#}")]
    Store(anyhow::Error),
}

impl From<RetrievalError> for ApiError {
    fn from(err: RetrievalError) -> Self {
        match err {
            RetrievalError::InvalidRange(message) => Self::InvalidRange(message),
            RetrievalError::InvalidPagination(message) => Self::InvalidPagination(message),
        }
    }
}

/// Raw query-string values as sent by the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReadingsQuery {
    pub start: Option<String>,
    pub end: Option<String>,
    pub sampling_enabled: Option<String>,
    pub page: Option<String>,
    pub page_size: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RetrievalMode {
    Sampled,
    Paginated(PageRequest),
}

/// A fully validated request, ready for store I/O.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReadingsRequest {
    pub device_id: String,
    pub window: TimeWindow,
    pub mode: RetrievalMode,
}

impl ReadingsRequest {
    /// Validate the raw query against `config`. Pagination values are only read when
    /// sampling is disabled.
    ///
    /// # Errors
    /// Returns [`ApiError::InvalidRange`] or [`ApiError::InvalidPagination`].
    pub fn from_query(
        device_id: &str,
        query: &ReadingsQuery,
        now: i64,
        config: &RetrievalConfig,
    ) -> Result<Self, ApiError> {
        let window =
            resolve_time_window(query.start.as_deref(), query.end.as_deref(), now, config)?;
        let mode = if sampling_enabled(query.sampling_enabled.as_deref()) {
            RetrievalMode::Sampled
        } else {
            RetrievalMode::Paginated(PageRequest::parse(
                query.page.as_deref(),
                query.page_size.as_deref(),
                config.default_page_size,
            )?)
        };

        Ok(Self { device_id: device_id.to_string(), window, mode })
    }
}

/// Sampling stays on unless the caller explicitly sends `false`.
#[must_use]
pub fn sampling_enabled(raw: Option<&str>) -> bool {
    !raw.is_some_and(|value| value.trim().eq_ignore_ascii_case("false"))
}

/// Run the existence check, count and fetch against `store` and assemble the envelope.
///
/// # Errors
/// Returns [`ApiError::DeviceNotFound`] for unknown devices, [`ApiError::Store`] for any
/// store failure, or a pagination error if the plan cannot be built.
pub fn retrieve_readings<S>(
    store: &S,
    request: &ReadingsRequest,
    config: &RetrievalConfig,
) -> Result<ResponseEnvelope, ApiError>
where
    S: ReadingStore + ?Sized,
{
    let device_id = request.device_id.as_str();
    if !store.device_exists(device_id).map_err(ApiError::Store)? {
        return Err(ApiError::DeviceNotFound);
    }

    let total_count = store.count_readings(device_id, request.window).map_err(ApiError::Store)?;

    let plan = match request.mode {
        RetrievalMode::Sampled => {
            plan_retrieval(total_count, true, 1, config.default_page_size, config.max_data_points)?
        }
        RetrievalMode::Paginated(page) => plan_retrieval(
            total_count,
            false,
            page.page,
            page.page_size,
            config.max_data_points,
        )?,
    };
    tracing::debug!(device_id, window = %request.window, total_count, ?plan, "retrieval planned");

    let data = match plan {
        RetrievalPlan::Sampled { sampling_rate } => {
            store.sample_readings(device_id, request.window, sampling_rate)
        }
        RetrievalPlan::Paginated(page) => {
            store.page_readings(device_id, request.window, page.offset, page.limit)
        }
    }
    .map_err(ApiError::Store)?;

    Ok(assemble_response(request.window, total_count, &plan, config.max_data_points, data))
}

#[derive(Debug, Clone)]
pub struct TemperatureApi {
    db_path: PathBuf,
    config: RetrievalConfig,
}

impl TemperatureApi {
    #[must_use]
    pub fn new(db_path: PathBuf, config: RetrievalConfig) -> Self {
        Self { db_path, config }
    }

    #[must_use]
    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    /// Inspect schema status without applying migrations.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Bring the schema up to date and report the resulting status.
    ///
    /// # Errors
    /// Returns an error when migration fails.
    pub fn migrate(&self) -> Result<SchemaStatus> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.schema_status()
    }

    /// Overall extent of a device's readings.
    ///
    /// # Errors
    /// Returns an error when the store cannot be opened or queried.
    pub fn device_span(&self, device_id: &str) -> Result<DeviceSpan> {
        let store = self.open_store()?;
        store.device_span(device_id)
    }

    /// Answer one readings query using the wall clock for default windows.
    ///
    /// # Errors
    /// See [`TemperatureApi::fetch_readings_at`].
    pub fn fetch_readings(
        &self,
        device_id: &str,
        query: &ReadingsQuery,
    ) -> Result<ResponseEnvelope, ApiError> {
        self.fetch_readings_at(device_id, query, OffsetDateTime::now_utc().unix_timestamp())
    }

    /// Answer one readings query as of `now` (epoch seconds).
    ///
    /// # Errors
    /// Returns a validation error before any store I/O, [`ApiError::DeviceNotFound`]
    /// for unknown devices, or [`ApiError::Store`] when the store fails.
    pub fn fetch_readings_at(
        &self,
        device_id: &str,
        query: &ReadingsQuery,
        now: i64,
    ) -> Result<ResponseEnvelope, ApiError> {
        let request = ReadingsRequest::from_query(device_id, query, now, &self.config)?;
        let store = self.open_store().map_err(ApiError::Store)?;
        retrieve_readings(&store, &request, &self.config)
    }
}
