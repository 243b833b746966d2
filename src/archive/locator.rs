//! Deterministic container addressing

use crate::measurement::MeasurementRef;
use crate::Result;

use serde::{Deserialize, Serialize};

/// Where an archived measurement lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveLocator {
    /// `<prefix>/<YYYY-MM-DD>/<CC>/AS<ASN>.jsonl.zst`
    pub container_path: String,
    /// Byte offset of the zstd frame holding the record, when indexed
    pub offset_hint: Option<u64>,
    pub index_key: String,
}

impl ArchiveLocator {
    /// Derive the locator from the report's start date, country and network.
    pub fn for_ref(reference: &MeasurementRef, prefix: &str) -> Result<Self> {
        let report = reference.report()?;
        let relative = format!(
            "{}/{}/AS{}.jsonl.zst",
            report.started_at.format("%Y-%m-%d"),
            report.probe_cc,
            report.probe_asn
        );
        let prefix = prefix.trim_matches('/');
        let container_path = if prefix.is_empty() {
            relative
        } else {
            format!("{}/{}", prefix, relative)
        };

        Ok(Self {
            container_path,
            offset_hint: None,
            index_key: reference.index_key(),
        })
    }

    pub fn with_offset_hint(mut self, offset: u64) -> Self {
        self.offset_hint = Some(offset);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_same_date_country_and_network_share_a_container() {
        let a = MeasurementRef::new("20190312T101500Z_webconnectivity_IT_30722_n1_aaaaaaaa")
            .with_input("https://a.example/");
        let b = MeasurementRef::new("20190312T235959Z_telegram_IT_30722_n1_bbbbbbbb");

        let la = ArchiveLocator::for_ref(&a, "raw/").unwrap();
        let lb = ArchiveLocator::for_ref(&b, "raw/").unwrap();
        assert_eq!(la.container_path, "raw/2019-03-12/IT/AS30722.jsonl.zst");
        assert_eq!(la.container_path, lb.container_path);
        assert_ne!(la.index_key, lb.index_key);
    }

    #[test]
    fn test_legacy_reports_land_under_unknown_country() {
        let r = MeasurementRef::new("20170707T051545Z_AS44244_ujwFYcBJXcL2MjZnHXhBqVEOG2");
        let locator = ArchiveLocator::for_ref(&r, "").unwrap();
        assert_eq!(locator.container_path, "2017-07-07/ZZ/AS44244.jsonl.zst");
        assert_eq!(locator.offset_hint, None);
    }

    #[test]
    fn test_malformed_reports_are_rejected() {
        let err = ArchiveLocator::for_ref(&MeasurementRef::new("bogus"), "raw").unwrap_err();
        assert!(matches!(err, Error::InvalidReference { .. }));
    }
}
