//! SQL generation for grouped-count statements
//!
//! Only identifiers from the closed dimension grammar are spliced into the
//! statement text; every value is a bind parameter.

use super::GroupedQuery;
use crate::query::{BucketGranularity, Dimension, DimensionValue, FilterField, FilterValue};
use crate::{Error, Result};

use chrono::{DateTime, Utc};

/// A bind parameter, in statement order.
#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    Text(String),
    BigInt(i64),
    Timestamp(DateTime<Utc>),
    TextArray(Vec<String>),
    BigIntArray(Vec<i64>),
    TimestampArray(Vec<DateTime<Utc>>),
}

impl From<&DimensionValue> for BindValue {
    fn from(value: &DimensionValue) -> Self {
        match value {
            DimensionValue::Text(s) => BindValue::Text(s.clone()),
            DimensionValue::Number(n) => BindValue::BigInt(*n),
            DimensionValue::Time(t) => BindValue::Timestamp(*t),
        }
    }
}

fn unit(granularity: BucketGranularity) -> &'static str {
    match granularity {
        BucketGranularity::Hour => "hour",
        BucketGranularity::Day => "day",
        BucketGranularity::Week => "week",
        BucketGranularity::Month => "month",
    }
}

/// Column expression a filter field compares against.
fn filter_column(field: FilterField) -> &'static str {
    match field {
        FilterField::Dimension(Dimension::Country) => "probe_cc",
        FilterField::Dimension(Dimension::Asn) => "probe_asn::bigint",
        FilterField::Dimension(Dimension::TestName) => "test_name",
        FilterField::Dimension(Dimension::CategoryCode) => "COALESCE(category_code, '')",
        FilterField::Dimension(Dimension::TimeBucket) => "measurement_start_time",
        FilterField::Domain => "domain",
        FilterField::Input => "input",
    }
}

/// Select expression producing a group key element.
fn group_expression(dimension: Dimension, granularity: BucketGranularity) -> String {
    match dimension {
        Dimension::TimeBucket => format!(
            "date_trunc('{}', measurement_start_time)",
            unit(granularity)
        ),
        other => filter_column(FilterField::Dimension(other)).to_string(),
    }
}

struct Binds(Vec<BindValue>);

impl Binds {
    fn push(&mut self, value: BindValue) -> String {
        self.0.push(value);
        format!("${}", self.0.len())
    }
}

fn array_bind(values: &[DimensionValue]) -> Result<BindValue> {
    match values.first() {
        Some(DimensionValue::Text(_)) => values
            .iter()
            .map(|v| v.as_text().map(str::to_string))
            .collect::<Option<Vec<_>>>()
            .map(BindValue::TextArray),
        Some(DimensionValue::Number(_)) => values
            .iter()
            .map(|v| match v {
                DimensionValue::Number(n) => Some(*n),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()
            .map(BindValue::BigIntArray),
        Some(DimensionValue::Time(_)) => values
            .iter()
            .map(|v| match v {
                DimensionValue::Time(t) => Some(*t),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()
            .map(BindValue::TimestampArray),
        None => None,
    }
    .ok_or_else(|| Error::InvalidRequest("filter value list mixes types".to_string()))
}

/// Builds the grouped-count statement for one keyset page.
///
/// Output columns: `d0..dN` followed by `measurement_count`,
/// `anomaly_count`, `confirmed_count` and `failure_count`.
pub fn build_grouped_query(query: &GroupedQuery) -> Result<(String, Vec<BindValue>)> {
    let mut binds = Binds(Vec::new());
    let granularity = query.bucket_granularity();

    let mut select: Vec<String> = query
        .dimensions
        .iter()
        .enumerate()
        .map(|(i, d)| format!("{} AS d{}", group_expression(*d, granularity), i))
        .collect();
    select.push("COUNT(*) AS measurement_count".to_string());
    select.push("COUNT(*) FILTER (WHERE anomaly) AS anomaly_count".to_string());
    select.push("COUNT(*) FILTER (WHERE confirmed) AS confirmed_count".to_string());
    select.push("COUNT(*) FILTER (WHERE failure) AS failure_count".to_string());

    let start = binds.push(BindValue::Timestamp(query.time_range.start));
    let end = binds.push(BindValue::Timestamp(query.time_range.end));
    let mut conditions = vec![
        format!("measurement_start_time >= {}", start),
        format!("measurement_start_time < {}", end),
    ];

    for filter in &query.filters {
        filter.validate()?;
        let column = filter_column(filter.field);
        let condition = match &filter.value {
            FilterValue::Eq(value) => format!("{} = {}", column, binds.push(value.into())),
            FilterValue::In(values) => {
                format!("{} = ANY({})", column, binds.push(array_bind(values)?))
            }
            FilterValue::Range { start, end } => format!(
                "{} >= {} AND {} < {}",
                column,
                binds.push(start.into()),
                column,
                binds.push(end.into())
            ),
        };
        conditions.push(condition);
    }

    let mut inner = format!(
        "SELECT {} FROM measurements WHERE {}",
        select.join(", "),
        conditions.join(" AND ")
    );

    let keys: Vec<String> = (0..query.dimensions.len()).map(|i| format!("d{}", i)).collect();
    if keys.is_empty() {
        return Ok((inner, binds.0));
    }

    let positions: Vec<String> = (1..=keys.len()).map(|i| i.to_string()).collect();
    inner.push_str(&format!(" GROUP BY {}", positions.join(", ")));

    let mut sql = format!("SELECT * FROM ({}) AS grouped", inner);
    if let Some(after) = &query.after {
        if after.len() != keys.len() {
            return Err(Error::InvalidRequest(format!(
                "page cursor has {} values for {} dimensions",
                after.len(),
                keys.len()
            )));
        }
        let placeholders: Vec<String> = after.iter().map(|v| binds.push(v.into())).collect();
        sql.push_str(&format!(
            " WHERE ({}) > ({})",
            keys.join(", "),
            placeholders.join(", ")
        ));
    }
    let limit = binds.push(BindValue::BigInt(query.limit as i64));
    sql.push_str(&format!(" ORDER BY {} LIMIT {}", keys.join(", "), limit));

    Ok((sql, binds.0))
}
