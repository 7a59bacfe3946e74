use std::str::FromStr;
use std::time::Duration;

use crate::core::merge::GapPolicy;
use crate::core::retry::RetryPolicy;
use crate::db::WriteMode;
use crate::error::ConfigError;

pub const DEFAULT_WEATHER_API_URL: &str = "https://api.open-meteo.com/v1/forecast";
pub const DEFAULT_STOCK_API_URL: &str = "https://www.alphavantage.co/query";
pub const DEFAULT_SOURCE_QUERY: &str = "SELECT * FROM source_records";
pub const DEFAULT_SCHEDULE: &str = "0 0 * * * *";

#[derive(Debug, Clone)]
pub struct SourceDbConfig {
    pub url: String,
    pub query: String,
}

#[derive(Debug, Clone)]
pub struct WarehouseConfig {
    pub url: String,
    pub write_mode: WriteMode,
}

#[derive(Debug, Clone)]
pub struct WeatherConfig {
    pub api_url: String,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone)]
pub struct StockConfig {
    pub api_url: String,
    pub api_key: String,
    pub symbol: String,
}

#[derive(Debug, Clone)]
pub struct AlertConfig {
    pub temperature_limit: f64,
    pub recipient: Option<String>,
}

#[derive(Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
}

// Keep the password out of logs.
impl std::fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("from", &self.from)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

/// How many of the most recent generation dates a live run loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveWindow {
    LatestDays(usize),
    All,
}

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub cron: String,
    pub run_once: bool,
    pub live_window: LiveWindow,
}

/// Immutable process configuration, built once at startup and handed to
/// component constructors.
#[derive(Debug, Clone)]
pub struct Config {
    pub source_db: SourceDbConfig,
    pub warehouse: WarehouseConfig,
    pub weather: WeatherConfig,
    pub stock: StockConfig,
    pub alert: AlertConfig,
    /// Present when `SMTP_USERNAME` is set. Only the live loop sends mail.
    pub smtp: Option<SmtpConfig>,
    pub http: HttpConfig,
    pub schedule: ScheduleConfig,
    pub gap_policy: GapPolicy,
}

impl Config {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Mail settings for the alert channel, required by the live loop.
    pub fn mail(&self) -> Result<(&SmtpConfig, &str), ConfigError> {
        let smtp = self.smtp.as_ref().ok_or(ConfigError::Missing("SMTP_USERNAME"))?;
        let recipient = self
            .alert
            .recipient
            .as_deref()
            .ok_or(ConfigError::Missing("ALERT_EMAIL_TO"))?;
        Ok((smtp, recipient))
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let smtp = match env.optional("SMTP_USERNAME") {
            None => None,
            Some(username) => Some(SmtpConfig {
                host: env.optional("SMTP_HOST").unwrap_or_else(|| "smtp.gmail.com".to_string()),
                port: env.parse_or("SMTP_PORT", 587u16)?,
                password: env.required("SMTP_PASSWORD")?,
                from: env.optional("SMTP_FROM").unwrap_or_else(|| username.clone()),
                username,
            }),
        };

        let retry = RetryPolicy {
            max_attempts: env.parse_or("RETRY_MAX_ATTEMPTS", 3u32)?.max(1),
            base_delay: Duration::from_millis(env.parse_or("RETRY_BASE_DELAY_MS", 500u64)?),
            max_delay: Duration::from_secs(30),
        };

        let live_window = match env.optional("ETL_LIVE_WINDOW_DAYS") {
            None => LiveWindow::LatestDays(1),
            Some(raw) if raw.eq_ignore_ascii_case("all") => LiveWindow::All,
            Some(raw) => match raw.parse::<usize>() {
                Ok(0) | Err(_) => {
                    return Err(ConfigError::Invalid {
                        key: "ETL_LIVE_WINDOW_DAYS",
                        value: raw,
                        reason: "expected a positive day count or \"all\"".to_string(),
                    })
                }
                Ok(days) => LiveWindow::LatestDays(days),
            },
        };

        Ok(Config {
            source_db: SourceDbConfig {
                url: env.required("SOURCE_DATABASE_URL")?,
                query: env
                    .optional("SOURCE_QUERY")
                    .unwrap_or_else(|| DEFAULT_SOURCE_QUERY.to_string()),
            },
            warehouse: WarehouseConfig {
                url: env.required("WAREHOUSE_DATABASE_URL")?,
                write_mode: env.parse_or("WAREHOUSE_WRITE_MODE", WriteMode::Upsert)?,
            },
            weather: WeatherConfig {
                api_url: env
                    .optional("WEATHER_API_URL")
                    .unwrap_or_else(|| DEFAULT_WEATHER_API_URL.to_string()),
                latitude: env.parse_or("WEATHER_LATITUDE", 35.6895)?,
                longitude: env.parse_or("WEATHER_LONGITUDE", 139.6917)?,
            },
            stock: StockConfig {
                api_url: env
                    .optional("STOCK_API_URL")
                    .unwrap_or_else(|| DEFAULT_STOCK_API_URL.to_string()),
                api_key: env.required("STOCK_API_KEY")?,
                symbol: env.optional("STOCK_SYMBOL").unwrap_or_else(|| "AAPL".to_string()),
            },
            alert: AlertConfig {
                temperature_limit: env.parse_or("ALERT_TEMPERATURE_LIMIT", 30.0)?,
                recipient: env.optional("ALERT_EMAIL_TO"),
            },
            smtp,
            http: HttpConfig {
                timeout: Duration::from_secs(env.parse_or("HTTP_TIMEOUT_SECS", 30u64)?),
                retry,
            },
            schedule: ScheduleConfig {
                cron: env
                    .optional("ETL_SCHEDULE")
                    .unwrap_or_else(|| DEFAULT_SCHEDULE.to_string()),
                run_once: env.parse_or("ETL_RUN_ONCE", false)?,
                live_window,
            },
            gap_policy: env.parse_or("MERGE_GAP_POLICY", GapPolicy::NullFill)?,
        })
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Blank values count as unset.
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.optional(key).ok_or(ConfigError::Missing(key))
    }

    fn parse_or<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(key) {
            None => Ok(default),
            Some(raw) => raw.parse::<T>().map_err(|e| ConfigError::Invalid {
                key,
                reason: e.to_string(),
                value: raw,
            }),
        }
    }
}
