use std::sync::Arc;
use tracing::{info, warn};

use crate::models::{AlertEvent, MergedRecord};
use crate::notify::Notifier;

pub const ALERT_SUBJECT: &str = "Temperature alert";
pub const ALERT_MESSAGE: &str = "Temperature alert! The configured limit has been exceeded.";

/// Sends one notification per evaluation whose max temperature exceeds the
/// configured limit. No rate limiting across runs.
pub struct AlertEvaluator {
    limit: f64,
    notifier: Arc<dyn Notifier>,
}

impl AlertEvaluator {
    pub fn new(limit: f64, notifier: Arc<dyn Notifier>) -> Self {
        Self { limit, notifier }
    }

    pub fn limit(&self) -> f64 {
        self.limit
    }

    /// Dispatch failures are logged and reported through
    /// `AlertEvent::delivered`; they never fail the run.
    pub async fn evaluate(&self, records: &[MergedRecord]) -> Option<AlertEvent> {
        let mut event = check_threshold(records, self.limit)?;

        warn!(
            max_temperature = event.max_temperature,
            limit = self.limit,
            date = %event.generation_date,
            "temperature limit exceeded"
        );

        let body = format!(
            "{}\n\nMax temperature: {:.1} (limit {:.1}) on {}",
            ALERT_MESSAGE, event.max_temperature, self.limit, event.generation_date
        );

        match self.notifier.send(ALERT_SUBJECT, &body).await {
            Ok(()) => {
                event.delivered = true;
                info!("temperature alert dispatched");
            }
            Err(e) => warn!(error = %e, "temperature alert could not be delivered"),
        }

        Some(event)
    }
}

/// The breach for `records`, if their max temperature is strictly above
/// `limit`. Records without a temperature are ignored.
pub fn check_threshold(records: &[MergedRecord], limit: f64) -> Option<AlertEvent> {
    let (date, max) = records
        .iter()
        .filter_map(|r| r.temperature.map(|t| (r.generation_date, t)))
        .fold(None, |acc: Option<(chrono::NaiveDate, f64)>, (date, t)| match acc {
            Some((_, best)) if best >= t => acc,
            _ => Some((date, t)),
        })?;

    (max > limit).then_some(AlertEvent {
        limit,
        max_temperature: max,
        generation_date: date,
        delivered: false,
    })
}
