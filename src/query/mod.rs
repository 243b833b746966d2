//! Aggregation queries
//!
//! The query side is responsible for:
//! - The request grammar (dimensions, filters, bucket granularities)
//! - Cost-bounded planning, which rejects requests before any I/O
//! - Executing plans against the relational tier and paging the output

mod aggregator;
mod planner;
mod request;
pub(crate) mod telemetry;

pub use aggregator::{AggregationPage, Aggregator, DataIssue};
pub use planner::{AccessPath, CardinalityEstimates, PlannerLimits, QueryPlan, QueryPlanner};
pub use request::{
    parse_asn, AggregationRequest, AggregationRow, BucketGranularity, Dimension, DimensionValue,
    Filter, FilterField, FilterValue, PageCursor, TimeRange,
};
