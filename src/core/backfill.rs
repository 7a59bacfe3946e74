use chrono::NaiveDate;
use tracing::{info, warn};

use crate::core::merge::GapPolicy;
use crate::core::orchestrator::{Extraction, Sources};
use crate::db::{LoadReport, Warehouse};
use crate::error::EtlError;
use crate::models::MergedRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillReport {
    pub start: NaiveDate,
    pub end: NaiveDate,
    /// Records of the input that fell inside `[start, end]`
    pub selected: usize,
    pub load: LoadReport,
}

/// Records whose generation date lies in the closed interval `[start, end]`.
pub fn select_range(records: &[MergedRecord], start: NaiveDate, end: NaiveDate) -> Vec<MergedRecord> {
    records
        .iter()
        .filter(|r| r.generation_date >= start && r.generation_date <= end)
        .cloned()
        .collect()
}

/// Load the in-range subset of already extracted `records`.
///
/// Nothing is re-extracted here. Whether a repeated backfill duplicates rows
/// depends on the warehouse write mode.
pub async fn backfill(
    warehouse: &dyn Warehouse,
    records: &[MergedRecord],
    start: NaiveDate,
    end: NaiveDate,
) -> Result<BackfillReport, EtlError> {
    if start > end {
        warn!(%start, %end, "backfill range is empty (start after end)");
    }

    let subset = select_range(records, start, end);
    let mut report = BackfillReport {
        start,
        end,
        selected: subset.len(),
        load: LoadReport::default(),
    };

    if subset.is_empty() {
        info!(%start, %end, available = records.len(), "no records in backfill range, nothing written");
        return Ok(report);
    }

    report.load = warehouse.load(&subset).await?;
    info!(
        %start,
        %end,
        selected = report.selected,
        inserted = report.load.inserted,
        replaced = report.load.replaced,
        "backfill complete"
    );
    Ok(report)
}

/// Extract from `sources` and backfill `[start, end]`.
///
/// A provider that returns no series at all is an error here, so an operator
/// can tell it apart from a range with no sessions.
pub async fn backfill_from_sources(
    sources: &Sources,
    warehouse: &dyn Warehouse,
    gap_policy: GapPolicy,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<BackfillReport, EtlError> {
    match sources.extract_and_merge(gap_policy).await? {
        Extraction::Merged(records) => backfill(warehouse, &records, start, end).await,
        Extraction::NoStockData => {
            warn!(%start, %end, "stock provider returned no daily series, nothing to backfill");
            Err(EtlError::rejected("stock", "provider returned no daily series"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::DataSource;
    use crate::models::{RawTable, SourceKind};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    struct Empty(SourceKind);

    #[async_trait]
    impl DataSource for Empty {
        fn name(&self) -> &str {
            "empty"
        }

        async fn extract(&self) -> Result<RawTable, EtlError> {
            Ok(RawTable::empty(self.0))
        }
    }

    #[derive(Default)]
    struct RecordingWarehouse {
        loads: Mutex<Vec<Vec<NaiveDate>>>,
    }

    #[async_trait]
    impl Warehouse for RecordingWarehouse {
        async fn load(&self, records: &[MergedRecord]) -> Result<LoadReport, EtlError> {
            self.loads
                .lock()
                .unwrap()
                .push(records.iter().map(|r| r.generation_date).collect());
            Ok(LoadReport { inserted: records.len(), replaced: 0 })
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2023, 1, d).unwrap()
    }

    fn records(days: &[u32]) -> Vec<MergedRecord> {
        days.iter()
            .map(|d| MergedRecord {
                generation_date: day(*d),
                stock_symbol: "AAPL".into(),
                stock_open: None,
                stock_high: None,
                stock_low: None,
                stock_close: 1.0,
                stock_volume: None,
                temperature: None,
                weather_description: None,
                humidity: None,
                stock_return: None,
                comments: None,
                extra: BTreeMap::new(),
            })
            .collect()
    }

    #[test]
    fn test_range_is_inclusive() {
        let input = records(&[1, 5, 10, 15, 20]);
        let selected: Vec<_> = select_range(&input, day(5), day(15))
            .into_iter()
            .map(|r| r.generation_date)
            .collect();
        assert_eq!(selected, vec![day(5), day(10), day(15)]);
    }

    #[tokio::test]
    async fn test_writes_exactly_the_subset() {
        let warehouse = RecordingWarehouse::default();
        let report = backfill(&warehouse, &records(&[1, 5, 10, 20]), day(2), day(10)).await.unwrap();

        assert_eq!(report.selected, 2);
        assert_eq!(report.load.inserted, 2);
        assert_eq!(*warehouse.loads.lock().unwrap(), vec![vec![day(5), day(10)]]);
    }

    #[tokio::test]
    async fn test_empty_input_writes_nothing() {
        let warehouse = RecordingWarehouse::default();
        let report = backfill(&warehouse, &[], day(1), day(31)).await.unwrap();
        assert_eq!(report.selected, 0);
        assert!(warehouse.loads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_match_or_inverted_range_writes_nothing() {
        let warehouse = RecordingWarehouse::default();
        backfill(&warehouse, &records(&[1, 2]), day(10), day(12)).await.unwrap();
        backfill(&warehouse, &records(&[1, 2]), day(2), day(1)).await.unwrap();
        assert!(warehouse.loads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_stock_series_is_an_error() {
        let sources = Sources {
            database: Box::new(Empty(SourceKind::Database)),
            weather: Box::new(Empty(SourceKind::Weather)),
            stock: Box::new(Empty(SourceKind::Stock)),
        };
        let warehouse = RecordingWarehouse::default();

        let result = backfill_from_sources(&sources, &warehouse, GapPolicy::NullFill, day(1), day(31)).await;
        assert!(matches!(
            result,
            Err(EtlError::SourceUnavailable { source_name: "stock", retryable: false, .. })
        ));
        assert!(warehouse.loads.lock().unwrap().is_empty());
    }
}
