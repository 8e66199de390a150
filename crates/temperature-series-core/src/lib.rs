use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize, Serializer};

pub const DEFAULT_RANGE_HOURS: i64 = 3;
pub const MAX_RANGE_HOURS: i64 = 7 * 24;
pub const DEFAULT_MAX_DATA_POINTS: u64 = 250;
pub const DEFAULT_PAGE_SIZE: u64 = 1000;

const SECONDS_PER_HOUR: i64 = 3600;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RetrievalError {
    #[error("{0}")]
    InvalidRange(String),
    #[error("{0}")]
    InvalidPagination(String),
}

/// Tunables for window resolution and retrieval planning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct RetrievalConfig {
    pub default_range_hours: i64,
    pub max_range_hours: i64,
    pub max_data_points: u64,
    pub default_page_size: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_range_hours: DEFAULT_RANGE_HOURS,
            max_range_hours: MAX_RANGE_HOURS,
            max_data_points: DEFAULT_MAX_DATA_POINTS,
            default_page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl RetrievalConfig {
    #[must_use]
    pub fn max_range_seconds(&self) -> i64 {
        self.max_range_hours.saturating_mul(SECONDS_PER_HOUR)
    }

    #[must_use]
    pub fn default_range_seconds(&self) -> i64 {
        self.default_range_hours.saturating_mul(SECONDS_PER_HOUR)
    }
}

/// One temperature sample as stored for a device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reading {
    pub device_id: String,
    pub timestamp: i64,
    pub temperature: f64,
    pub is_alarm: bool,
}

/// Inclusive `[from, to]` range of epoch seconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct TimeWindow {
    pub from: i64,
    pub to: i64,
}

impl TimeWindow {
    #[must_use]
    pub fn span_seconds(self) -> i128 {
        i128::from(self.to) - i128::from(self.from)
    }
}

impl Display for TimeWindow {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.from, self.to)
    }
}

/// Resolve the caller's raw `start`/`end` values into a bounded window.
///
/// Absent bounds default to the trailing `default_range_hours` ending at `now`.
///
/// # Errors
/// Returns [`RetrievalError::InvalidRange`] when a bound is not an integer, when
/// `from > to`, or when the window is wider than `max_range_hours`.
pub fn resolve_time_window(
    raw_start: Option<&str>,
    raw_end: Option<&str>,
    now: i64,
    config: &RetrievalConfig,
) -> Result<TimeWindow, RetrievalError> {
    let from = match raw_start {
        Some(raw) => parse_timestamp(raw)?,
        None => now.saturating_sub(config.default_range_seconds()),
    };
    let to = match raw_end {
        Some(raw) => parse_timestamp(raw)?,
        None => now,
    };

    let window = TimeWindow { from, to };
    if window.span_seconds() < 0 {
        return Err(RetrievalError::InvalidRange(
            "Invalid time range parameters: start must not be after end".to_string(),
        ));
    }
    if window.span_seconds() > i128::from(config.max_range_seconds()) {
        return Err(RetrievalError::InvalidRange(format!(
            "Time range too large. Maximum range is {} hours.",
            config.max_range_hours
        )));
    }

    Ok(window)
}

fn parse_timestamp(raw: &str) -> Result<i64, RetrievalError> {
    raw.trim()
        .parse::<i64>()
        .map_err(|_| RetrievalError::InvalidRange("Invalid time range parameters".to_string()))
}

/// A validated page selection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct PageRequest {
    pub page: u64,
    pub page_size: u64,
}

impl PageRequest {
    /// # Errors
    /// Returns [`RetrievalError::InvalidPagination`] when either value is zero or the
    /// resulting offset does not fit a signed 64-bit store offset.
    pub fn new(page: u64, page_size: u64) -> Result<Self, RetrievalError> {
        if page < 1 {
            return Err(RetrievalError::InvalidPagination("page must be at least 1".to_string()));
        }
        if page_size < 1 {
            return Err(RetrievalError::InvalidPagination(
                "pageSize must be at least 1".to_string(),
            ));
        }
        let request = Self { page, page_size };
        request.offset()?;
        Ok(request)
    }

    /// Parse raw `page`/`pageSize` query values, applying defaults for absent ones.
    ///
    /// # Errors
    /// Returns [`RetrievalError::InvalidPagination`] for non-numeric or out-of-range values.
    pub fn parse(
        raw_page: Option<&str>,
        raw_page_size: Option<&str>,
        default_page_size: u64,
    ) -> Result<Self, RetrievalError> {
        let page = match raw_page {
            Some(raw) => parse_page_value(raw, "page")?,
            None => 1,
        };
        let page_size = match raw_page_size {
            Some(raw) => parse_page_value(raw, "pageSize")?,
            None => default_page_size,
        };
        Self::new(page, page_size)
    }

    fn offset(self) -> Result<u64, RetrievalError> {
        let offset = (self.page - 1).checked_mul(self.page_size).ok_or_else(|| {
            RetrievalError::InvalidPagination("page offset is out of range".to_string())
        })?;
        if i64::try_from(offset).is_err() || i64::try_from(self.page_size).is_err() {
            return Err(RetrievalError::InvalidPagination("page offset is out of range".to_string()));
        }
        Ok(offset)
    }
}

fn parse_page_value(raw: &str, name: &str) -> Result<u64, RetrievalError> {
    let value = raw
        .trim()
        .parse::<i64>()
        .map_err(|_| RetrievalError::InvalidPagination(format!("{name} must be an integer")))?;
    u64::try_from(value)
        .map_err(|_| RetrievalError::InvalidPagination(format!("{name} must be at least 1")))
}

/// Bounds of one page against a known total.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct PagePlan {
    pub page: u64,
    pub page_size: u64,
    pub offset: u64,
    pub limit: u64,
    pub has_more_pages: bool,
    pub total_pages: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RetrievalPlan {
    Sampled { sampling_rate: u64 },
    Paginated(PagePlan),
}

impl RetrievalPlan {
    /// Stride applied by the store. Paginated plans report 1.
    #[must_use]
    pub fn sampling_rate(&self) -> u64 {
        match self {
            Self::Sampled { sampling_rate } => *sampling_rate,
            Self::Paginated(_) => 1,
        }
    }

    #[must_use]
    pub fn is_sampled(&self) -> bool {
        matches!(self, Self::Sampled { .. })
    }
}

/// Smallest stride that keeps `total_count` readings within `max_points`.
#[must_use]
pub fn sampling_rate(total_count: u64, max_points: u64) -> u64 {
    let max_points = max_points.max(1);
    if total_count <= max_points {
        1
    } else {
        total_count.div_ceil(max_points)
    }
}

fn page_plan(total_count: u64, request: PageRequest) -> PagePlan {
    let PageRequest { page, page_size } = request;
    PagePlan {
        page,
        page_size,
        offset: (page - 1).saturating_mul(page_size),
        limit: page_size,
        has_more_pages: page.checked_mul(page_size).is_some_and(|end| total_count > end),
        total_pages: total_count.div_ceil(page_size),
    }
}

/// Choose between sampled and paginated retrieval for `total_count` matching readings.
///
/// # Errors
/// Returns [`RetrievalError::InvalidPagination`] in paginated mode when `page` or
/// `page_size` is out of range. Sampled mode ignores both.
pub fn plan_retrieval(
    total_count: u64,
    sampling_enabled: bool,
    page: u64,
    page_size: u64,
    max_points: u64,
) -> Result<RetrievalPlan, RetrievalError> {
    if sampling_enabled {
        return Ok(RetrievalPlan::Sampled { sampling_rate: sampling_rate(total_count, max_points) });
    }
    let request = PageRequest::new(page, page_size)?;
    Ok(RetrievalPlan::Paginated(page_plan(total_count, request)))
}

/// Serialized as a number when capped, or the string `"unlimited"`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum MaxDataPoints {
    Limited(u64),
    Unlimited,
}

impl Serialize for MaxDataPoints {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Limited(points) => serializer.serialize_u64(*points),
            Self::Unlimited => serializer.serialize_str("unlimited"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq, Hash)]
pub struct PaginationMeta {
    pub current_page: u64,
    pub items_per_page: u64,
    pub has_more_pages: bool,
    pub total_pages: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq, Hash)]
pub struct ResponseMeta {
    pub total_count: u64,
    pub from_timestamp: i64,
    pub to_timestamp: i64,
    pub sampling_rate: u64,
    pub sampling_enabled: bool,
    pub max_data_points: MaxDataPoints,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagination: Option<PaginationMeta>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ResponseEnvelope {
    pub meta: ResponseMeta,
    pub data: Vec<Reading>,
}

/// Merge plan metadata and fetched readings into the response envelope.
#[must_use]
pub fn assemble_response(
    window: TimeWindow,
    total_count: u64,
    plan: &RetrievalPlan,
    max_points: u64,
    data: Vec<Reading>,
) -> ResponseEnvelope {
    let (max_data_points, pagination) = match plan {
        RetrievalPlan::Sampled { .. } => (MaxDataPoints::Limited(max_points), None),
        RetrievalPlan::Paginated(page) => (
            MaxDataPoints::Unlimited,
            Some(PaginationMeta {
                current_page: page.page,
                items_per_page: page.page_size,
                has_more_pages: page.has_more_pages,
                total_pages: page.total_pages,
            }),
        ),
    };

    ResponseEnvelope {
        meta: ResponseMeta {
            total_count,
            from_timestamp: window.from,
            to_timestamp: window.to,
            sampling_rate: plan.sampling_rate(),
            sampling_enabled: plan.is_sampled(),
            max_data_points,
            pagination,
        },
        data,
    }
}
