use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::{debug, warn};

use crate::error::EtlError;
use crate::fetcher::alpha_vantage::{CLOSE, HIGH, LOW, OPEN, SYMBOL, VOLUME};
use crate::fetcher::weather::{DESCRIPTION, HUMIDITY, TEMPERATURE};
use crate::models::{ColumnValue, MergedRecord, RawRecord, RawTable, SourceKind};

const DB_SYMBOL: &str = "stock_symbol";
const DB_COMMENTS: &str = "comentarios";

/// What to do with a stock date that has no weather or database row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GapPolicy {
    /// Keep the row, leave the missing columns null
    #[default]
    NullFill,
    /// Drop the row
    Skip,
    /// Abort the merge
    Fail,
}

impl FromStr for GapPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "null_fill" | "null-fill" | "nullfill" => Ok(GapPolicy::NullFill),
            "skip" => Ok(GapPolicy::Skip),
            "fail" => Ok(GapPolicy::Fail),
            other => Err(format!("unknown gap policy '{}', expected null_fill, skip or fail", other)),
        }
    }
}

/// Join the three source tables on generation date.
///
/// The stock series is the spine: one output row per distinct stock date, in
/// ascending order. Weather and database rows attach to the stock row of the
/// same date; when several exist for one date the latest one wins. Database
/// rows that name a different `stock_symbol` are ignored.
///
/// `stock_return` is the close-to-close change against the previous output
/// row, null for the first row and when the previous close is zero.
pub fn merge(
    weather: &RawTable,
    stocks: &RawTable,
    db: &RawTable,
    policy: GapPolicy,
) -> Result<Vec<MergedRecord>, EtlError> {
    let stock_by_date = latest_by_date(stocks.records.iter());
    let mut weather_by_date = latest_by_date(weather.records.iter());
    attach_current_observation(&mut weather_by_date, stock_by_date.keys().next_back().copied());

    let symbol = stocks
        .records
        .iter()
        .find_map(|r| r.text(SYMBOL))
        .unwrap_or_default()
        .to_string();

    let db_by_date = latest_by_date(db.records.iter().filter(|r| match r.text(DB_SYMBOL) {
        Some(s) => s.eq_ignore_ascii_case(&symbol),
        None => true,
    }));

    let mut merged = Vec::with_capacity(stock_by_date.len());

    for (date, stock) in stock_by_date {
        let Some(close) = stock.float(CLOSE) else {
            warn!(%date, "stock row has no close price, dropping");
            continue;
        };

        let weather_row = weather_by_date.get(&date).copied();
        let db_row = db_by_date.get(&date).copied();

        let missing = if weather_row.is_none() {
            Some(SourceKind::Weather)
        } else if db_row.is_none() {
            Some(SourceKind::Database)
        } else {
            None
        };

        if let Some(missing) = missing {
            match policy {
                GapPolicy::NullFill => {}
                GapPolicy::Skip => {
                    debug!(%date, %missing, "no matching row, skipping date");
                    continue;
                }
                GapPolicy::Fail => return Err(EtlError::MergeGap { date, missing }),
            }
        }

        let mut extra = db_row.map(|r| r.columns.clone()).unwrap_or_default();
        extra.remove(DB_SYMBOL);
        let comments = match extra.remove(DB_COMMENTS) {
            Some(ColumnValue::Text(text)) => Some(text),
            _ => None,
        };

        merged.push(MergedRecord {
            generation_date: date,
            stock_symbol: stock.text(SYMBOL).unwrap_or(symbol.as_str()).to_string(),
            stock_open: stock.float(OPEN),
            stock_high: stock.float(HIGH),
            stock_low: stock.float(LOW),
            stock_close: close,
            stock_volume: stock.integer(VOLUME),
            temperature: weather_row.and_then(|w| w.float(TEMPERATURE)),
            weather_description: weather_row.and_then(|w| w.text(DESCRIPTION)).map(str::to_string),
            humidity: weather_row.and_then(|w| w.integer(HUMIDITY)),
            stock_return: None,
            comments,
            extra,
        });
    }

    apply_returns(&mut merged);

    debug!(
        stock_rows = stocks.len(),
        weather_rows = weather.len(),
        db_rows = db.len(),
        merged = merged.len(),
        ?policy,
        "merged sources"
    );
    Ok(merged)
}

/// Fill `stock_return` as the fractional change against the previous row.
pub fn apply_returns(records: &mut [MergedRecord]) {
    let mut previous_close: Option<f64> = None;
    for record in records.iter_mut() {
        record.stock_return = match previous_close {
            Some(prev) if prev != 0.0 => Some((record.stock_close - prev) / prev),
            _ => None,
        };
        previous_close = Some(record.stock_close);
    }
}

/// Weather is a current-conditions reading stamped with its observation
/// date, which runs ahead of the newest stock session outside market days.
/// The newest such reading is filed under that session so the live row
/// always carries it.
fn attach_current_observation<'a>(
    weather_by_date: &mut BTreeMap<NaiveDate, &'a RawRecord>,
    latest_session: Option<NaiveDate>,
) {
    let Some(session) = latest_session else {
        return;
    };
    if weather_by_date.contains_key(&session) {
        return;
    }
    if let Some((observed, record)) = weather_by_date.range(session..).next_back().map(|(d, r)| (*d, *r)) {
        debug!(%observed, %session, "attaching current weather to latest stock session");
        weather_by_date.insert(session, record);
    }
}

/// Keep the most recently generated record of each date.
fn latest_by_date<'a>(records: impl Iterator<Item = &'a RawRecord>) -> BTreeMap<NaiveDate, &'a RawRecord> {
    let mut by_date: BTreeMap<NaiveDate, &RawRecord> = BTreeMap::new();
    for record in records {
        let date = record.generation_date();
        match by_date.get(&date) {
            Some(existing) if existing.generated_at > record.generated_at => {}
            _ => {
                by_date.insert(date, record);
            }
        }
    }
    by_date
}
