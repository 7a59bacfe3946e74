use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info};

use super::{http_client, parse_generation_timestamp, status_error, DataSource};
use crate::config::{HttpConfig, WeatherConfig};
use crate::core::retry::{with_retry, RetryPolicy};
use crate::error::EtlError;
use crate::models::{ColumnValue, RawRecord, RawTable, SourceKind};

const SOURCE: &str = "weather";

pub const TEMPERATURE: &str = "temperature";
pub const HUMIDITY: &str = "humidity";
pub const DESCRIPTION: &str = "description";

/// Current conditions for one fixed coordinate from an Open-Meteo style API.
pub struct WeatherFetcher {
    client: Client,
    api_url: String,
    latitude: f64,
    longitude: f64,
    retry: RetryPolicy,
}

#[derive(Deserialize)]
struct ForecastResponse {
    current_weather: Option<CurrentWeather>,
    current: Option<CurrentBlock>,
}

#[derive(Deserialize)]
struct CurrentWeather {
    time: Option<String>,
    temperature: f64,
    windspeed: Option<f64>,
    winddirection: Option<f64>,
    weathercode: Option<i64>,
    is_day: Option<i64>,
}

#[derive(Deserialize)]
struct CurrentBlock {
    relative_humidity_2m: Option<i64>,
}

impl WeatherFetcher {
    pub fn new(config: &WeatherConfig, http: &HttpConfig) -> Result<Self, EtlError> {
        Ok(Self {
            client: http_client(SOURCE, http.timeout)?,
            api_url: config.api_url.clone(),
            latitude: config.latitude,
            longitude: config.longitude,
            retry: http.retry.clone(),
        })
    }

    async fn fetch_once(&self) -> Result<RawTable, EtlError> {
        let params = [
            ("latitude", self.latitude.to_string()),
            ("longitude", self.longitude.to_string()),
            ("current_weather", "true".to_string()),
            ("current", "relative_humidity_2m".to_string()),
        ];

        let resp = self
            .client
            .get(&self.api_url)
            .query(&params)
            .send()
            .await
            .map_err(|e| EtlError::unavailable(SOURCE, e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let error_text = resp.text().await.unwrap_or_default();
            return Err(status_error(SOURCE, status, &error_text));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| EtlError::unavailable(SOURCE, e.to_string()))?;
        Self::parse_response(&body, Utc::now())
    }

    fn parse_response(body: &str, fetched_at: DateTime<Utc>) -> Result<RawTable, EtlError> {
        let parsed: ForecastResponse = serde_json::from_str(body).map_err(|e| {
            EtlError::unavailable(
                SOURCE,
                format!("unparseable response: {} - Body: {}", e, body.chars().take(200).collect::<String>()),
            )
        })?;

        let current = parsed
            .current_weather
            .ok_or_else(|| EtlError::rejected(SOURCE, "response has no current_weather block"))?;

        let observed_at = current
            .time
            .as_deref()
            .and_then(parse_generation_timestamp)
            .unwrap_or(fetched_at);

        let humidity = parsed.current.and_then(|c| c.relative_humidity_2m);

        let mut record = RawRecord::new(observed_at)
            .with(TEMPERATURE, ColumnValue::Float(current.temperature))
            .with(HUMIDITY, humidity.map(ColumnValue::Integer).unwrap_or(ColumnValue::Null))
            .with("windspeed", current.windspeed.map(ColumnValue::Float).unwrap_or(ColumnValue::Null))
            .with("winddirection", current.winddirection.map(ColumnValue::Float).unwrap_or(ColumnValue::Null))
            .with("is_day", current.is_day.map(ColumnValue::Integer).unwrap_or(ColumnValue::Null));

        if let Some(code) = current.weathercode {
            record = record
                .with("weathercode", ColumnValue::Integer(code))
                .with(DESCRIPTION, ColumnValue::Text(describe_weather_code(code).to_string()));
        }

        debug!(temperature = current.temperature, ?humidity, %observed_at, "parsed current weather");
        Ok(RawTable::new(SourceKind::Weather, vec![record]))
    }
}

#[async_trait]
impl DataSource for WeatherFetcher {
    fn name(&self) -> &str {
        SOURCE
    }

    async fn extract(&self) -> Result<RawTable, EtlError> {
        let table = with_retry(&self.retry, SOURCE, || self.fetch_once()).await?;
        info!(lat = self.latitude, lon = self.longitude, "fetched current weather");
        Ok(table)
    }
}

/// WMO weather interpretation codes.
pub fn describe_weather_code(code: i64) -> &'static str {
    match code {
        0 => "Clear sky",
        1 => "Mainly clear",
        2 => "Partly cloudy",
        3 => "Overcast",
        45 | 48 => "Fog",
        51 | 53 | 55 => "Drizzle",
        56 | 57 => "Freezing drizzle",
        61 | 63 | 65 => "Rain",
        66 | 67 => "Freezing rain",
        71 | 73 | 75 => "Snow fall",
        77 => "Snow grains",
        80..=82 => "Rain showers",
        85 | 86 => "Snow showers",
        95 => "Thunderstorm",
        96 | 99 => "Thunderstorm with hail",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use serde_json::json;

    #[test]
    fn test_parse_valid_response() {
        let body = json!({
            "latitude": 35.7,
            "longitude": 139.6875,
            "current_weather": {
                "time": "2023-10-19T14:00",
                "interval": 900,
                "temperature": 21.3,
                "windspeed": 7.2,
                "winddirection": 180,
                "is_day": 1,
                "weathercode": 3
            },
            "current": { "time": "2023-10-19T14:00", "relative_humidity_2m": 63 }
        })
        .to_string();

        let table = WeatherFetcher::parse_response(&body, Utc::now()).unwrap();
        assert_eq!(table.source, SourceKind::Weather);
        assert_eq!(table.len(), 1);

        let rec = &table.records[0];
        assert_eq!(rec.generation_date(), NaiveDate::from_ymd_opt(2023, 10, 19).unwrap());
        assert_eq!(rec.float(TEMPERATURE), Some(21.3));
        assert_eq!(rec.integer(HUMIDITY), Some(63));
        assert_eq!(rec.text(DESCRIPTION), Some("Overcast"));
        assert_eq!(rec.float("winddirection"), Some(180.0));
    }

    #[test]
    fn test_missing_humidity_and_time() {
        let fetched_at = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let body = json!({ "current_weather": { "temperature": -1.5 } }).to_string();

        let table = WeatherFetcher::parse_response(&body, fetched_at).unwrap();
        let rec = &table.records[0];
        assert_eq!(rec.generated_at, fetched_at);
        assert_eq!(rec.get(HUMIDITY), Some(&ColumnValue::Null));
        assert_eq!(rec.text(DESCRIPTION), None);
    }

    #[test]
    fn test_missing_current_weather_is_not_retried() {
        let body = json!({ "error": true, "reason": "Latitude must be in range" }).to_string();
        let err = WeatherFetcher::parse_response(&body, Utc::now()).unwrap_err();
        assert!(matches!(err, EtlError::SourceUnavailable { retryable: false, .. }));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_non_json_is_unavailable() {
        let result = WeatherFetcher::parse_response("<html>Bad Gateway</html>", Utc::now());
        assert!(matches!(result, Err(EtlError::SourceUnavailable { retryable: true, .. })));
    }

    #[test]
    fn test_weather_code_descriptions() {
        assert_eq!(describe_weather_code(0), "Clear sky");
        assert_eq!(describe_weather_code(81), "Rain showers");
        assert_eq!(describe_weather_code(1000), "Unknown");
    }
}
