use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime};
use tracing::warn;

use crate::error::CatalogError;

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

// Gantry sidecars, the environment logger and ISO exports each write their own layout.
const TIMESTAMP_LAYOUTS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%m/%d/%Y %H:%M:%S%.f",
    "%Y.%m.%d-%H:%M:%S%.f",
    "%Y-%m-%d__%H-%M-%S-%3f",
];

/// True when `value` is a canonical `YYYY-MM-DD` calendar date.
pub fn validate_date(value: &str) -> bool {
    match NaiveDate::parse_from_str(value, DATE_FORMAT) {
        Ok(date) => date.format(DATE_FORMAT).to_string() == value,
        Err(_) => false,
    }
}

/// Every calendar day between the two dates, inclusive and ascending, whichever comes first.
pub fn expand_range(first: &str, last: &str) -> Result<Vec<String>, CatalogError> {
    let one = parse_date(first)?;
    let other = parse_date(last)?;
    let (start, end) = if one <= other {
        (one, other)
    } else {
        (other, one)
    };

    let mut dates = Vec::new();
    let mut current = start;
    while current <= end {
        dates.push(current.format(DATE_FORMAT).to_string());
        current += Duration::days(1);
    }
    Ok(dates)
}

/// Parses a comma separated list of dates and `date:date` ranges.
///
/// Every bad component is logged; any bad component fails the whole list.
pub fn parse_date_spec(spec: &str) -> Result<Vec<String>, CatalogError> {
    let mut dates: Vec<String> = Vec::new();
    let mut problems = Vec::new();

    for item in spec.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }

        match item.split_once(':') {
            None => {
                if validate_date(item) {
                    dates.push(item.to_string());
                } else {
                    warn!("Invalid date specified: '{item}'");
                    problems.push(item.to_string());
                }
            }
            Some((start, last)) => {
                let (start, last) = (start.trim(), last.trim());
                if start.is_empty() || last.is_empty() || last.contains(':') {
                    warn!("Invalid date range specified: '{item}'");
                    problems.push(item.to_string());
                    continue;
                }
                if !validate_date(start) || !validate_date(last) {
                    warn!("Invalid dates specified in date range: '{item}'");
                    problems.push(item.to_string());
                    continue;
                }
                dates.extend(expand_range(start, last)?);
            }
        }
    }

    if !problems.is_empty() {
        return Err(CatalogError::InvalidDateSpec(problems.join(", ")));
    }
    if dates.is_empty() {
        return Err(CatalogError::InvalidDateSpec(
            "dates parameter is missing values".to_string(),
        ));
    }

    let mut seen = std::collections::HashSet::new();
    dates.retain(|date| seen.insert(date.clone()));
    Ok(dates)
}

pub fn parse_date(value: &str) -> Result<NaiveDate, CatalogError> {
    NaiveDate::parse_from_str(value.trim(), DATE_FORMAT)
        .map_err(|_| CatalogError::InvalidDate(value.to_string()))
}

/// Parses a capture or weather timestamp in any of the layouts the archive uses.
pub fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.naive_local());
    }
    TIMESTAMP_LAYOUTS
        .iter()
        .find_map(|layout| NaiveDateTime::parse_from_str(value, layout).ok())
}

pub fn format_timestamp(value: &NaiveDateTime) -> String {
    value.format(TIMESTAMP_FORMAT).to_string()
}
