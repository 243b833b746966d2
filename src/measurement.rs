//! Measurement references and bodies
//!
//! A [`MeasurementRef`] names one measurement: the report it was submitted
//! in, the input it tested (a URL for web tests, nothing for most others)
//! and, when known, when it started. Both storage tiers resolve the same
//! reference to the same body.

use crate::{Error, Result};

use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Country code recorded for legacy reports that never carried one.
pub const UNKNOWN_COUNTRY: &str = "ZZ";

/// Separates report id and input inside an archive index key.
const INDEX_KEY_SEPARATOR: char = '\u{1f}';

/// Which storage tier holds (or produced) a measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageTier {
    Relational,
    Archive,
}

impl StorageTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageTier::Relational => "relational",
            StorageTier::Archive => "archive",
        }
    }
}

/// Data format generation of a stored body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FormatVersion {
    /// `0.2.x` bodies produced by the legacy pipeline
    Legacy,
    /// `0.3.x` and later
    Current,
}

impl FormatVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            FormatVersion::Legacy => "0.2.0",
            FormatVersion::Current => "0.3.0",
        }
    }
}

impl FromStr for FormatVersion {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        let value = value.trim();
        if value.starts_with("0.2") {
            Ok(FormatVersion::Legacy)
        } else if value.starts_with("0.3") || value.starts_with("0.4") {
            Ok(FormatVersion::Current)
        } else {
            Err(format!("unknown data format version '{}'", value))
        }
    }
}

/// Identifies one measurement uniquely.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MeasurementRef {
    pub report_id: String,
    pub input: Option<String>,
    /// Time hint; `None` when the caller only knows the report and input
    pub measurement_start_time: Option<DateTime<Utc>>,
}

impl MeasurementRef {
    pub fn new(report_id: impl Into<String>) -> Self {
        Self {
            report_id: report_id.into(),
            input: None,
            measurement_start_time: None,
        }
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn with_start_time(mut self, start: DateTime<Utc>) -> Self {
        self.measurement_start_time = Some(start);
        self
    }

    /// Input as stored in both tiers, where "no input" is the empty string.
    pub fn input_key(&self) -> &str {
        self.input.as_deref().unwrap_or("")
    }

    /// Key used to deduplicate references that name the same measurement.
    pub fn identity(&self) -> (&str, &str) {
        (self.report_id.as_str(), self.input_key())
    }

    /// Sort key of this measurement inside an archive container.
    pub fn index_key(&self) -> String {
        index_key(&self.report_id, self.input_key())
    }

    pub fn report(&self) -> Result<ReportId> {
        ReportId::parse(&self.report_id)
    }

    pub(crate) fn not_found(&self, tier: StorageTier) -> Error {
        Error::NotFound {
            report_id: self.report_id.clone(),
            input: self.input.clone(),
            tier,
        }
    }
}

impl fmt::Display for MeasurementRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.input {
            Some(input) => write!(f, "{} [{}]", self.report_id, input),
            None => write!(f, "{}", self.report_id),
        }
    }
}

/// Builds the archive index key for a report id / input pair.
pub fn index_key(report_id: &str, input: &str) -> String {
    let mut key = String::with_capacity(report_id.len() + input.len() + 1);
    key.push_str(report_id);
    key.push(INDEX_KEY_SEPARATOR);
    key.push_str(input);
    key
}

/// Fields encoded in a report identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportId {
    pub started_at: DateTime<Utc>,
    pub probe_cc: String,
    pub probe_asn: u32,
    pub test_name: Option<String>,
}

impl ReportId {
    /// Parses both identifier generations:
    ///
    /// - `20210101T000000Z_webconnectivity_IT_30722_n1_<random>`
    /// - `20170707T051545Z_AS44244_<random>` (no country)
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidReference {
            report_id: raw.to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = raw.split('_').collect();
        if parts.len() < 3 {
            return Err(invalid("expected at least three '_' separated fields"));
        }

        let started_at = NaiveDateTime::parse_from_str(parts[0], "%Y%m%dT%H%M%SZ")
            .map_err(|_| invalid("leading field is not a YYYYMMDDTHHMMSSZ timestamp"))?
            .and_utc();

        if let Some(asn) = parts[1].strip_prefix("AS") {
            let probe_asn = asn
                .parse::<u32>()
                .map_err(|_| invalid("legacy ASN field is not numeric"))?;
            return Ok(Self {
                started_at,
                probe_cc: UNKNOWN_COUNTRY.to_string(),
                probe_asn,
                test_name: None,
            });
        }

        if parts.len() < 6 {
            return Err(invalid("expected six '_' separated fields"));
        }
        let probe_cc = parts[2];
        if probe_cc.len() != 2 || !probe_cc.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(invalid("country field is not a two letter code"));
        }
        let probe_asn = parts[3]
            .parse::<u32>()
            .map_err(|_| invalid("ASN field is not numeric"))?;

        Ok(Self {
            started_at,
            probe_cc: probe_cc.to_string(),
            probe_asn,
            test_name: Some(parts[1].to_string()),
        })
    }
}

/// A measurement body as produced by one of the tiers.
///
/// Bytes are passed through undecoded.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementBody {
    pub reference: MeasurementRef,
    pub raw_bytes: Bytes,
    pub format_version: FormatVersion,
    pub tier: StorageTier,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parses_current_report_ids() {
        let report =
            ReportId::parse("20210115T093012Z_webconnectivity_IT_30722_n1_abcdefghij").unwrap();
        assert_eq!(
            report.started_at,
            Utc.with_ymd_and_hms(2021, 1, 15, 9, 30, 12).unwrap()
        );
        assert_eq!(report.probe_cc, "IT");
        assert_eq!(report.probe_asn, 30722);
        assert_eq!(report.test_name.as_deref(), Some("webconnectivity"));
    }

    #[test]
    fn test_parses_legacy_report_ids_without_country() {
        let report = ReportId::parse("20170707T051545Z_AS44244_ujwFYcBJXcL2MjZnHXhBqVEOG2").unwrap();
        assert_eq!(report.probe_cc, UNKNOWN_COUNTRY);
        assert_eq!(report.probe_asn, 44244);
        assert!(report.test_name.is_none());
    }

    #[test]
    fn test_rejects_malformed_report_ids() {
        for raw in [
            "",
            "garbage",
            "2021_webconnectivity_IT_1_n1_x",
            "20210115T093012Z_webconnectivity_italy_30722_n1_x",
            "20210115T093012Z_webconnectivity_IT_notanumber_n1_x",
            "20170707T051545Z_ASxyz_abc",
        ] {
            let err = ReportId::parse(raw).unwrap_err();
            assert!(matches!(err, Error::InvalidReference { .. }), "{raw}");
        }
    }

    #[test]
    fn test_index_keys_order_by_report_then_input() {
        let a = MeasurementRef::new("r1").with_input("https://a.example");
        let b = MeasurementRef::new("r1").with_input("https://b.example");
        let bare = MeasurementRef::new("r1");
        let next = MeasurementRef::new("r10");

        assert!(bare.index_key() < a.index_key());
        assert!(a.index_key() < b.index_key());
        assert!(b.index_key() < next.index_key());
    }

    #[test]
    fn test_format_versions_parse_by_prefix() {
        assert_eq!("0.2.0".parse::<FormatVersion>(), Ok(FormatVersion::Legacy));
        assert_eq!("0.3.1".parse::<FormatVersion>(), Ok(FormatVersion::Current));
        assert!("1.0".parse::<FormatVersion>().is_err());
    }
}
