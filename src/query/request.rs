//! Aggregation request grammar
//!
//! Requests are built from a closed set of dimensions, filter fields and
//! bucket granularities so that every shape a client can ask for is known
//! to the planner before anything runs.

use crate::{Error, Result};

use chrono::{DateTime, Datelike, Duration, DurationRound, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A grouping dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Country,
    Asn,
    TestName,
    CategoryCode,
    TimeBucket,
}

impl Dimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Country => "country",
            Dimension::Asn => "asn",
            Dimension::TestName => "test_name",
            Dimension::CategoryCode => "category_code",
            Dimension::TimeBucket => "time_bucket",
        }
    }
}

impl FromStr for Dimension {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "country" | "probe_cc" => Ok(Dimension::Country),
            "asn" | "probe_asn" => Ok(Dimension::Asn),
            "test_name" => Ok(Dimension::TestName),
            "category_code" => Ok(Dimension::CategoryCode),
            "time_bucket" | "measurement_start_day" => Ok(Dimension::TimeBucket),
            other => Err(format!(
                "unknown dimension '{}'; expected one of country, asn, test_name, category_code, time_bucket",
                other
            )),
        }
    }
}

/// One element of a group key.
///
/// Each dimension always produces the same variant, so the derived ordering
/// is the natural ordering of that dimension's values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DimensionValue {
    Text(String),
    Number(i64),
    Time(DateTime<Utc>),
}

impl DimensionValue {
    pub fn text(value: impl Into<String>) -> Self {
        DimensionValue::Text(value.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            DimensionValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for DimensionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DimensionValue::Text(s) => write!(f, "{}", s),
            DimensionValue::Number(n) => write!(f, "{}", n),
            DimensionValue::Time(t) => write!(f, "{}", t.to_rfc3339()),
        }
    }
}

/// Width of a time bucket, finest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketGranularity {
    Hour,
    Day,
    Week,
    Month,
}

impl BucketGranularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            BucketGranularity::Hour => "hour",
            BucketGranularity::Day => "day",
            BucketGranularity::Week => "week",
            BucketGranularity::Month => "month",
        }
    }

    /// Next coarser granularity, if any.
    pub fn coarser(&self) -> Option<BucketGranularity> {
        match self {
            BucketGranularity::Hour => Some(BucketGranularity::Day),
            BucketGranularity::Day => Some(BucketGranularity::Week),
            BucketGranularity::Week => Some(BucketGranularity::Month),
            BucketGranularity::Month => None,
        }
    }

    /// Start of the bucket containing `ts`. Weeks start on Monday, as
    /// `date_trunc('week', ..)` does.
    pub fn truncate(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            BucketGranularity::Hour => ts.duration_trunc(Duration::hours(1)).unwrap_or(ts),
            BucketGranularity::Day => ts.duration_trunc(Duration::days(1)).unwrap_or(ts),
            BucketGranularity::Week => {
                let day = ts.duration_trunc(Duration::days(1)).unwrap_or(ts);
                day - Duration::days(day.weekday().num_days_from_monday() as i64)
            }
            BucketGranularity::Month => Utc
                .with_ymd_and_hms(ts.year(), ts.month(), 1, 0, 0, 0)
                .single()
                .unwrap_or(ts),
        }
    }

    /// Number of distinct buckets touched by a half-open range.
    pub fn bucket_count(&self, range: &TimeRange) -> u64 {
        if range.is_empty() {
            return 0;
        }
        let first = self.truncate(range.start);
        let last = self.truncate(range.end - Duration::nanoseconds(1));
        let count = match self {
            BucketGranularity::Hour => (last - first).num_hours(),
            BucketGranularity::Day => (last - first).num_days(),
            BucketGranularity::Week => (last - first).num_weeks(),
            BucketGranularity::Month => {
                (last.year() as i64 - first.year() as i64) * 12 + last.month() as i64
                    - first.month() as i64
            }
        };
        count.max(0) as u64 + 1
    }
}

impl FromStr for BucketGranularity {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "hour" => Ok(BucketGranularity::Hour),
            "day" => Ok(BucketGranularity::Day),
            "week" => Ok(BucketGranularity::Week),
            "month" => Ok(BucketGranularity::Month),
            other => Err(format!(
                "unknown granularity '{}'; expected one of hour, day, week, month",
                other
            )),
        }
    }
}

/// Half-open time range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn span(&self) -> Duration {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp >= self.start && timestamp < self.end
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Columns a filter may constrain.
///
/// `Domain` and `Input` are not indexed and not groupable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterField {
    Dimension(Dimension),
    Domain,
    Input,
}

impl FilterField {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterField::Dimension(d) => d.as_str(),
            FilterField::Domain => "domain",
            FilterField::Input => "input",
        }
    }

    pub fn is_indexed(&self) -> bool {
        matches!(self, FilterField::Dimension(_))
    }
}

/// Constraint on a filter field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterValue {
    /// field = value
    Eq(DimensionValue),
    /// field IN (values)
    In(Vec<DimensionValue>),
    /// start <= field < end
    Range {
        start: DimensionValue,
        end: DimensionValue,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: FilterField,
    pub value: FilterValue,
}

impl Filter {
    pub fn equals(field: FilterField, value: DimensionValue) -> Self {
        Self {
            field,
            value: FilterValue::Eq(value),
        }
    }

    pub fn one_of(field: FilterField, values: Vec<DimensionValue>) -> Self {
        Self {
            field,
            value: FilterValue::In(values),
        }
    }

    pub fn range(field: FilterField, start: DimensionValue, end: DimensionValue) -> Self {
        Self {
            field,
            value: FilterValue::Range { start, end },
        }
    }

    /// Country filter, upper-cased as stored
    pub fn country(cc: &str) -> Self {
        Self::equals(
            FilterField::Dimension(Dimension::Country),
            DimensionValue::text(cc.trim().to_ascii_uppercase()),
        )
    }

    /// ASN filter; accepts `AS30722` and `30722`.
    pub fn asn(raw: &str) -> Result<Self> {
        let asn = parse_asn(raw)?;
        Ok(Self::equals(
            FilterField::Dimension(Dimension::Asn),
            DimensionValue::Number(asn),
        ))
    }

    pub fn test_name(name: &str) -> Self {
        Self::equals(
            FilterField::Dimension(Dimension::TestName),
            DimensionValue::text(name),
        )
    }

    pub fn category_code(code: &str) -> Self {
        Self::equals(
            FilterField::Dimension(Dimension::CategoryCode),
            DimensionValue::text(code),
        )
    }

    pub fn domain(domain: &str) -> Self {
        Self::equals(FilterField::Domain, DimensionValue::text(domain))
    }

    pub fn input(input: &str) -> Self {
        Self::equals(FilterField::Input, DimensionValue::text(input))
    }

    /// Whether a stored value satisfies this filter.
    pub fn matches(&self, value: &DimensionValue) -> bool {
        match &self.value {
            FilterValue::Eq(expected) => value == expected,
            FilterValue::In(values) => values.iter().any(|v| v == value),
            FilterValue::Range { start, end } => value >= start && value < end,
        }
    }

    /// Upper bound on distinct values this filter lets through, if it
    /// pins the field to an explicit list.
    pub fn distinct_bound(&self) -> Option<u64> {
        match &self.value {
            FilterValue::Eq(_) => Some(1),
            FilterValue::In(values) => Some(values.len() as u64),
            FilterValue::Range { .. } => None,
        }
    }

    /// Checks that every value has the type the field stores.
    pub fn validate(&self) -> Result<()> {
        let values: Vec<&DimensionValue> = match &self.value {
            FilterValue::Eq(v) => vec![v],
            FilterValue::In(values) => {
                if values.is_empty() {
                    return Err(Error::InvalidRequest(format!(
                        "filter on {} has an empty value list",
                        self.field.as_str()
                    )));
                }
                values.iter().collect()
            }
            FilterValue::Range { start, end } => {
                if start >= end {
                    return Err(Error::InvalidRequest(format!(
                        "filter range on {} is empty",
                        self.field.as_str()
                    )));
                }
                vec![start, end]
            }
        };

        let type_ok = |v: &DimensionValue| match self.field {
            FilterField::Dimension(Dimension::Asn) => matches!(v, DimensionValue::Number(_)),
            FilterField::Dimension(Dimension::TimeBucket) => matches!(v, DimensionValue::Time(_)),
            _ => matches!(v, DimensionValue::Text(_)),
        };
        if values.into_iter().all(type_ok) {
            Ok(())
        } else {
            Err(Error::InvalidRequest(format!(
                "filter on {} has a value of the wrong type",
                self.field.as_str()
            )))
        }
    }
}

/// Parses `AS30722` or `30722`.
pub fn parse_asn(raw: &str) -> Result<i64> {
    let trimmed = raw.trim();
    let digits = trimmed
        .strip_prefix("AS")
        .or_else(|| trimmed.strip_prefix("as"))
        .unwrap_or(trimmed);
    digits
        .parse::<u32>()
        .map(i64::from)
        .map_err(|_| Error::InvalidRequest(format!("invalid ASN '{}'", raw)))
}

/// Keyset pagination cursor: the last group key of the previous page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageCursor(pub Vec<DimensionValue>);

impl PageCursor {
    /// Opaque token handed to clients.
    pub fn to_token(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.0)?)
    }

    pub fn from_token(token: &str) -> Result<Self> {
        serde_json::from_str(token)
            .map(PageCursor)
            .map_err(|e| Error::InvalidRequest(format!("invalid page cursor: {}", e)))
    }
}

/// Client-supplied aggregation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationRequest {
    /// Ordered grouping dimensions; duplicates are rejected
    pub dimensions: Vec<Dimension>,
    pub filters: Vec<Filter>,
    pub time_range: TimeRange,
    /// Finest time bucket the client wants; the planner may widen it
    pub granularity: Option<BucketGranularity>,
    pub cursor: Option<PageCursor>,
    pub page_size: Option<usize>,
}

impl AggregationRequest {
    pub fn new(dimensions: Vec<Dimension>, time_range: TimeRange) -> Self {
        Self {
            dimensions,
            filters: Vec::new(),
            time_range,
            granularity: None,
            cursor: None,
            page_size: None,
        }
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_granularity(mut self, granularity: BucketGranularity) -> Self {
        self.granularity = Some(granularity);
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn with_cursor(mut self, cursor: PageCursor) -> Self {
        self.cursor = Some(cursor);
        self
    }
}

/// One group of the aggregation output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationRow {
    pub dimension_values: Vec<DimensionValue>,
    pub measurement_count: u64,
    pub anomaly_count: u64,
    pub confirmed_count: u64,
    pub failure_count: u64,
}

impl AggregationRow {
    pub fn new(dimension_values: Vec<DimensionValue>) -> Self {
        Self {
            dimension_values,
            measurement_count: 0,
            anomaly_count: 0,
            confirmed_count: 0,
            failure_count: 0,
        }
    }

    /// Share of measurements flagged as anomalous.
    pub fn anomaly_rate(&self) -> f64 {
        if self.measurement_count == 0 {
            0.0
        } else {
            self.anomaly_count as f64 / self.measurement_count as f64
        }
    }
}
