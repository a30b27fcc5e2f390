//! Response-header reading: flattening, numeric parsing and `Retry-After`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::config::{HeaderField, LimiterConfig};

/// Collapse multi-valued headers into single strings by joining with `", "`.
///
/// Useful for callers holding headers in the `name -> [values]` shape; the
/// limiter reads single-valued maps.
#[must_use]
pub fn flatten_headers(multi: &HashMap<String, Vec<String>>) -> HashMap<String, String> {
    multi
        .iter()
        .map(|(name, values)| (name.clone(), values.join(", ")))
        .collect()
}

/// Numeric hints read from one response through the configured mappings.
///
/// Missing, unparseable and non-positive values are all `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct HeaderHints {
    pub limit: Option<f64>,
    pub remaining: Option<f64>,
    pub reset: Option<f64>,
    pub retry_after: Option<f64>,
    pub daily_limit: Option<f64>,
    pub hourly_limit: Option<f64>,
    pub daily_remaining: Option<f64>,
}

impl HeaderHints {
    pub(crate) fn read(headers: &HashMap<String, String>, cfg: &LimiterConfig) -> Self {
        let field = |field: HeaderField| {
            let name = cfg.header_mappings.get(&field)?;
            let raw = headers.get(name)?;
            parse_positive(field, raw)
        };

        Self {
            limit: field(HeaderField::Limit),
            remaining: parse_remaining(headers, cfg),
            reset: field(HeaderField::Reset),
            retry_after: field(HeaderField::RetryAfter),
            daily_limit: field(HeaderField::DailyLimit),
            hourly_limit: field(HeaderField::HourlyLimit),
            daily_remaining: field(HeaderField::DailyRemaining),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// `remaining: 0` is meaningful (the server says we are out of quota), so it
/// is the one field where zero is kept.
fn parse_remaining(headers: &HashMap<String, String>, cfg: &LimiterConfig) -> Option<f64> {
    let name = cfg.header_mappings.get(&HeaderField::Remaining)?;
    let raw = headers.get(name)?;
    match raw.trim().parse::<f64>() {
        Ok(value) if value >= 0.0 && value.is_finite() => Some(value),
        _ => {
            warn!(header = %name, value = %raw, "ignoring malformed remaining header");
            None
        }
    }
}

fn parse_positive(field: HeaderField, raw: &str) -> Option<f64> {
    match raw.trim().parse::<f64>() {
        Ok(value) if value > 0.0 && value.is_finite() => Some(value),
        _ => {
            warn!(field = ?field, value = %raw, "ignoring malformed header value");
            None
        }
    }
}

/// Parse a `Retry-After` value into whole seconds.
///
/// Accepts a non-negative integer number of seconds (floored at 1) or an
/// HTTP date (`max(1, date - now)`). Anything else is 1 second.
#[must_use]
pub fn parse_retry_after(value: &str) -> u64 {
    parse_retry_after_at(value, Utc::now().timestamp())
}

pub(crate) fn parse_retry_after_at(value: &str, now_epoch: i64) -> u64 {
    let value = value.trim();

    if let Ok(secs) = value.parse::<i64>() {
        if secs >= 0 {
            return secs.max(1).unsigned_abs();
        }
        return 1;
    }

    if let Ok(date) = DateTime::parse_from_rfc2822(value) {
        let delta = date.timestamp() - now_epoch;
        return delta.max(1).unsigned_abs();
    }

    1
}
