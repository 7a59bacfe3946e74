use serde::Serialize;
use sqlx::FromRow;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::BTreeMap;
use std::fmt;

/// Which adapter produced a table.
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Database,
    Weather,
    Stock,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SourceKind::Database => "database",
            SourceKind::Weather => "weather",
            SourceKind::Stock => "stock",
        };
        f.write_str(name)
    }
}

/// A single typed cell of a raw source row.
#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum ColumnValue {
    Null,
    Text(String),
    Float(f64),
    Integer(i64),
    Timestamp(DateTime<Utc>),
}

/// One row from one source, immutable once an adapter returns it.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct RawRecord {
    pub generated_at: DateTime<Utc>,
    pub columns: BTreeMap<String, ColumnValue>,
}

impl RawRecord {
    pub fn new(generated_at: DateTime<Utc>) -> Self {
        Self { generated_at, columns: BTreeMap::new() }
    }

    pub fn with(mut self, name: &str, value: ColumnValue) -> Self {
        self.columns.insert(name.to_string(), value);
        self
    }

    pub fn generation_date(&self) -> NaiveDate {
        self.generated_at.date_naive()
    }

    pub fn get(&self, name: &str) -> Option<&ColumnValue> {
        self.columns.get(name)
    }

    /// Numeric column as f64; integers are widened.
    pub fn float(&self, name: &str) -> Option<f64> {
        match self.columns.get(name)? {
            ColumnValue::Float(v) => Some(*v),
            ColumnValue::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn integer(&self, name: &str) -> Option<i64> {
        match self.columns.get(name)? {
            ColumnValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        match self.columns.get(name)? {
            ColumnValue::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }
}

/// Output of one adapter call. An empty table is a valid, explicit result.
#[derive(Debug, Clone, PartialEq)]
pub struct RawTable {
    pub source: SourceKind,
    pub records: Vec<RawRecord>,
}

impl RawTable {
    pub fn new(source: SourceKind, records: Vec<RawRecord>) -> Self {
        Self { source, records }
    }

    pub fn empty(source: SourceKind) -> Self {
        Self { source, records: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

/// All three sources joined for one generation date.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct MergedRecord {
    pub generation_date: NaiveDate,
    pub stock_symbol: String,
    pub stock_open: Option<f64>,
    pub stock_high: Option<f64>,
    pub stock_low: Option<f64>,
    pub stock_close: f64,
    pub stock_volume: Option<i64>,
    pub temperature: Option<f64>,
    pub weather_description: Option<String>,
    pub humidity: Option<i64>,
    /// Fractional close-to-close change against the previous merged row
    pub stock_return: Option<f64>,
    pub comments: Option<String>,
    /// Database columns without a dedicated warehouse column
    pub extra: BTreeMap<String, ColumnValue>,
}

/// A persisted row of `datos_ingestados`.
#[derive(Debug, Serialize, Clone, FromRow)]
pub struct WarehouseRow {
    pub id: i64,
    pub fecha_extraccion: DateTime<Utc>,
    pub fecha_generacion: NaiveDate,
    pub temperatura: Option<f64>,
    pub stock_symbol: Option<String>,
    pub stock_close: Option<f64>,
    pub stock_volume: Option<i64>,
    pub clima_descripcion: Option<String>,
    pub clima_humedad: Option<i64>,
    pub rendimiento_acciones: Option<f64>,
    pub comentarios: Option<String>,
}

/// Threshold breach raised by the alert evaluator. Never persisted.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct AlertEvent {
    pub limit: f64,
    pub max_temperature: f64,
    pub generation_date: NaiveDate,
    pub delivered: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_raw_record_accessors() {
        let ts = Utc.with_ymd_and_hms(2023, 10, 19, 14, 0, 0).unwrap();
        let rec = RawRecord::new(ts)
            .with("close", ColumnValue::Float(171.5))
            .with("volume", ColumnValue::Integer(1_200))
            .with("symbol", ColumnValue::Text("AAPL".into()));

        assert_eq!(rec.generation_date(), NaiveDate::from_ymd_opt(2023, 10, 19).unwrap());
        assert_eq!(rec.float("close"), Some(171.5));
        assert_eq!(rec.float("volume"), Some(1200.0));
        assert_eq!(rec.integer("close"), None);
        assert_eq!(rec.text("symbol"), Some("AAPL"));
        assert_eq!(rec.text("missing"), None);
    }
}
