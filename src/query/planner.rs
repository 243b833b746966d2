//! Cost-bounded planning of aggregation requests
//!
//! The planner is pure: it never touches a store. Everything it rejects is
//! rejected before any I/O happens.

use super::request::{
    AggregationRequest, BucketGranularity, Dimension, DimensionValue, Filter, FilterField,
    PageCursor, TimeRange,
};
use crate::{Error, Result};

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

/// Estimated number of distinct values per groupable column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardinalityEstimates {
    pub country: u64,
    pub asn: u64,
    pub test_name: u64,
    pub category_code: u64,
}

impl CardinalityEstimates {
    pub fn for_dimension(&self, dimension: Dimension) -> u64 {
        match dimension {
            Dimension::Country => self.country,
            Dimension::Asn => self.asn,
            Dimension::TestName => self.test_name,
            Dimension::CategoryCode => self.category_code,
            // Bucket counts depend on the range; see `BucketGranularity::bucket_count`
            Dimension::TimeBucket => 1,
        }
    }
}

impl Default for CardinalityEstimates {
    fn default() -> Self {
        Self {
            country: 250,
            asn: 40_000,
            test_name: 40,
            category_code: 35,
        }
    }
}

/// Limits enforced by the planner
#[derive(Debug, Clone)]
pub struct PlannerLimits {
    /// Longest accepted time range
    pub max_time_span: chrono::Duration,
    /// Maximum number of grouping dimensions
    pub max_dimensions: usize,
    /// Ceiling on estimated output rows
    pub row_ceiling: u64,
    /// Finest granularity used when the request names none
    pub default_granularity: BucketGranularity,
    pub default_page_size: usize,
    pub max_page_size: usize,
    pub estimates: CardinalityEstimates,
}

impl Default for PlannerLimits {
    fn default() -> Self {
        Self {
            max_time_span: chrono::Duration::days(365),
            max_dimensions: 3,
            row_ceiling: 100_000,
            default_granularity: BucketGranularity::Day,
            default_page_size: 1_000,
            max_page_size: 10_000,
            estimates: CardinalityEstimates::default(),
        }
    }
}

/// How the store is expected to find the rows. A latency hint only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessPath {
    /// Every filter hits an indexed column
    IndexScan,
    /// At least one filter needs a scan of the time window
    FullScan,
}

impl AccessPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessPath::IndexScan => "index_scan",
            AccessPath::FullScan => "full_scan",
        }
    }
}

/// Validated, cost-bounded aggregation plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPlan {
    pub dimensions: Vec<Dimension>,
    /// Resolved bucket width; `None` unless grouping by time bucket
    pub granularity: Option<BucketGranularity>,
    /// Whether the planner had to coarsen the requested granularity
    pub widened: bool,
    pub filters: Vec<Filter>,
    pub time_range: TimeRange,
    pub cursor: Option<PageCursor>,
    pub page_size: usize,
    pub row_ceiling: u64,
    pub estimated_rows: u64,
    pub access_path: AccessPath,
}

/// Turns requests into plans or rejections.
#[derive(Debug, Clone)]
pub struct QueryPlanner {
    limits: PlannerLimits,
}

impl QueryPlanner {
    pub fn new(limits: PlannerLimits) -> Self {
        Self { limits }
    }

    pub fn plan(&self, req: &AggregationRequest) -> Result<QueryPlan> {
        if req.time_range.is_empty() {
            return Err(Error::InvalidRequest(
                "time range end must be after its start".to_string(),
            ));
        }

        let span = req.time_range.span();
        if span > self.limits.max_time_span {
            return Err(Error::RangeTooWide {
                requested: span,
                max: self.limits.max_time_span,
            });
        }

        if req.dimensions.len() > self.limits.max_dimensions {
            return Err(Error::TooManyDimensions {
                requested: req.dimensions.clone(),
                max: self.limits.max_dimensions,
            });
        }

        let mut seen = HashSet::new();
        for dimension in &req.dimensions {
            if !seen.insert(*dimension) {
                return Err(Error::InvalidRequest(format!(
                    "dimension {} requested more than once",
                    dimension.as_str()
                )));
            }
        }

        for filter in &req.filters {
            filter.validate()?;
        }

        if let Some(cursor) = &req.cursor {
            self.validate_cursor(cursor, &req.dimensions)?;
        }

        let page_size = req.page_size.unwrap_or(self.limits.default_page_size);
        if page_size == 0 {
            return Err(Error::InvalidRequest("page size must be positive".to_string()));
        }
        let page_size = page_size
            .min(self.limits.max_page_size)
            .min(usize::try_from(self.limits.row_ceiling).unwrap_or(usize::MAX));

        let (granularity, estimated_rows) = self.choose_granularity(req)?;
        let widened = match (req.granularity, granularity) {
            (Some(requested), Some(resolved)) => resolved > requested,
            (None, Some(resolved)) => resolved > self.limits.default_granularity,
            _ => false,
        };

        let access_path = if req.filters.iter().all(|f| f.field.is_indexed()) {
            AccessPath::IndexScan
        } else {
            AccessPath::FullScan
        };

        debug!(
            dimensions = req.dimensions.len(),
            granularity = granularity.map(|g| g.as_str()).unwrap_or("none"),
            widened,
            estimated_rows,
            access_path = access_path.as_str(),
            "Aggregation planned"
        );

        Ok(QueryPlan {
            dimensions: req.dimensions.clone(),
            granularity,
            widened,
            filters: req.filters.clone(),
            time_range: req.time_range,
            cursor: req.cursor.clone(),
            page_size,
            row_ceiling: self.limits.row_ceiling,
            estimated_rows,
            access_path,
        })
    }

    /// Product of the estimated distinct values of every non-time dimension.
    fn base_estimate(&self, req: &AggregationRequest) -> u64 {
        req.dimensions
            .iter()
            .filter(|d| **d != Dimension::TimeBucket)
            .map(|d| {
                let configured = self.limits.estimates.for_dimension(*d).max(1);
                req.filters
                    .iter()
                    .filter(|f| f.field == FilterField::Dimension(*d))
                    .filter_map(Filter::distinct_bound)
                    .fold(configured, u64::min)
            })
            .fold(1u64, u64::saturating_mul)
    }

    fn choose_granularity(
        &self,
        req: &AggregationRequest,
    ) -> Result<(Option<BucketGranularity>, u64)> {
        let base = self.base_estimate(req);
        let ceiling = self.limits.row_ceiling;

        if !req.dimensions.contains(&Dimension::TimeBucket) {
            if base > ceiling {
                return Err(Error::EstimateTooLarge {
                    estimated_rows: base,
                    ceiling,
                    granularity: None,
                });
            }
            return Ok((None, base));
        }

        let mut granularity = req.granularity.unwrap_or(self.limits.default_granularity);
        loop {
            let buckets = granularity.bucket_count(&req.time_range);
            let estimate = base.saturating_mul(buckets);
            if estimate <= ceiling {
                return Ok((Some(granularity), estimate));
            }
            match granularity.coarser() {
                Some(next) => granularity = next,
                None => {
                    return Err(Error::EstimateTooLarge {
                        estimated_rows: estimate,
                        ceiling,
                        granularity: Some(granularity),
                    })
                }
            }
        }
    }

    fn validate_cursor(&self, cursor: &PageCursor, dimensions: &[Dimension]) -> Result<()> {
        if cursor.0.len() != dimensions.len() {
            return Err(Error::InvalidRequest(format!(
                "page cursor has {} values for {} dimensions",
                cursor.0.len(),
                dimensions.len()
            )));
        }
        let consistent = cursor
            .0
            .iter()
            .zip(dimensions)
            .all(|(value, dimension)| match dimension {
                Dimension::Asn => matches!(value, DimensionValue::Number(_)),
                Dimension::TimeBucket => matches!(value, DimensionValue::Time(_)),
                _ => matches!(value, DimensionValue::Text(_)),
            });
        if consistent {
            Ok(())
        } else {
            Err(Error::InvalidRequest(
                "page cursor does not match the requested dimensions".to_string(),
            ))
        }
    }
}
