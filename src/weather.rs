use std::cmp::Ordering;
use std::fs;

use chrono::NaiveDateTime;
use serde_json::Value;
use tracing::{debug, warn};

use crate::dates::parse_timestamp;
use crate::domain::{FileRecord, WeatherFileLink, WeatherReading, join_path};
use crate::error::CatalogError;
use crate::storage::{EntryKind, StorageBackend};

pub const READINGS_KEY: &str = "environment_sensor_readings";

/// A weather reading with the id it is persisted under.
pub type NumberedReading = (i64, WeatherReading);

/// Reads every weather file under `<weather_path>/<date>/` for the requested dates.
pub fn load_weather(
    storage: &dyn StorageBackend,
    weather_path: &str,
    dates: &[String],
) -> Result<Vec<WeatherReading>, CatalogError> {
    let mut readings = Vec::new();
    for date in dates {
        let date_path = join_path(weather_path, date);
        let entries = match storage.list(&date_path) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("Skipping weather for date {date}: {err}");
                continue;
            }
        };

        let paths = entries
            .iter()
            .filter(|entry| entry.kind == EntryKind::File && entry.name.ends_with(".json"))
            .map(|entry| join_path(&date_path, &entry.name))
            .collect::<Vec<_>>();
        if paths.is_empty() {
            debug!("No weather files in {date_path}");
            continue;
        }

        let locals = storage.retrieve(&paths)?;
        for (remote, local) in paths.iter().zip(&locals) {
            let content = fs::read_to_string(local).map_err(|err| {
                CatalogError::Filesystem(format!("read {}: {err}", local.display()))
            })?;
            readings.extend(parse_readings(&content, remote)?);
        }
    }
    Ok(readings)
}

pub fn parse_readings(content: &str, path: &str) -> Result<Vec<WeatherReading>, CatalogError> {
    let value: Value = serde_json::from_str(content).map_err(|err| CatalogError::MalformedJson {
        path: path.to_string(),
        message: err.to_string(),
    })?;
    let entries = value
        .get(READINGS_KEY)
        .and_then(Value::as_array)
        .ok_or_else(|| CatalogError::MissingKey {
            key: READINGS_KEY.to_string(),
            context: path.to_string(),
        })?;
    Ok(entries.iter().map(reading_from).collect())
}

fn reading_from(entry: &Value) -> WeatherReading {
    let station = entry.get("weather_station");
    let field = |name: &str| station.and_then(|station| station.get(name)).and_then(numeric);
    WeatherReading {
        timestamp: entry
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(parse_timestamp),
        temperature: field("temperature"),
        illuminance: field("brightness"),
        precipitation: field("precipitation"),
        sun_direction: field("sunDirection"),
        wind_speed: field("windVelocity"),
        wind_direction: field("windDirection"),
        relative_humidity: field("relHumidity"),
    }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        Value::Object(map) => map.get("value").and_then(numeric),
        _ => None,
    }
}

/// Orders readings by time and numbers them from 1, so ascending ids follow ascending timestamps.
pub fn number_readings(readings: Vec<WeatherReading>) -> Vec<NumberedReading> {
    let total = readings.len();
    let mut timed = readings
        .into_iter()
        .filter(|reading| reading.timestamp.is_some())
        .collect::<Vec<_>>();
    if timed.len() < total {
        warn!("Dropped {} weather readings without a timestamp", total - timed.len());
    }
    timed.sort_by_key(|reading| reading.timestamp);
    timed
        .into_iter()
        .enumerate()
        .map(|(idx, reading)| (idx as i64 + 1, reading))
        .collect()
}

/// The time span of a stored file; all that weather linking keeps of it.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureWindow {
    pub file_id: i64,
    pub path: String,
    pub start: NaiveDateTime,
    pub finish: NaiveDateTime,
}

impl CaptureWindow {
    /// A file with one known time spans that instant; an untimed file has no window.
    pub fn of(file_id: i64, file: &FileRecord) -> Option<Self> {
        let (start, finish) = match (file.start_time, file.finish_time) {
            (Some(start), Some(finish)) => (start, finish),
            (Some(instant), None) | (None, Some(instant)) => (instant, instant),
            (None, None) => return None,
        };
        Some(Self {
            file_id,
            path: file.path(),
            start,
            finish,
        })
    }
}

/// Parallel ascending sequences of weather ids and timestamps.
#[derive(Debug, Clone, Default)]
pub struct WeatherIndex {
    ids: Vec<i64>,
    timestamps: Vec<NaiveDateTime>,
}

impl WeatherIndex {
    /// Both sequences are sorted independently; the i-th id is assumed to belong
    /// to the i-th timestamp, which holds for ids from [`number_readings`].
    pub fn new(entries: impl IntoIterator<Item = (i64, NaiveDateTime)>) -> Self {
        let (mut ids, mut timestamps): (Vec<_>, Vec<_>) = entries.into_iter().unzip();
        ids.sort_unstable();
        timestamps.sort_unstable();
        Self { ids, timestamps }
    }

    pub fn from_readings(readings: &[NumberedReading]) -> Self {
        Self::new(
            readings
                .iter()
                .filter_map(|(id, reading)| reading.timestamp.map(|ts| (*id, ts))),
        )
    }

    /// Weather ids nearest to the start and finish of a capture window.
    pub fn link(&self, window: &CaptureWindow) -> Result<WeatherFileLink, CatalogError> {
        let (start, finish) = (window.start, window.finish);

        let (Some(start_lower), Some(start_upper)) = bracket(start, &self.timestamps) else {
            return Err(CatalogError::NoWeatherCoverage(window.path.clone()));
        };
        let (Some(finish_lower), Some(finish_upper)) = bracket(finish, &self.timestamps) else {
            return Err(CatalogError::NoWeatherCoverage(window.path.clone()));
        };
        if start_lower > finish_upper {
            return Err(CatalogError::InvertedBracket {
                file: window.path.clone(),
                start: start_lower,
                finish: finish_upper,
            });
        }

        let first = self.nearest(start, start_lower, start_upper, true);
        let last = self.nearest(finish, finish_lower, finish_upper, false);
        if first > last {
            return Err(CatalogError::InvertedBracket {
                file: window.path.clone(),
                start: first,
                finish: last,
            });
        }

        Ok(WeatherFileLink {
            file_id: window.file_id,
            min_weather_id: self.ids[first],
            max_weather_id: self.ids[last],
        })
    }

    // Equal distances keep `lower` when `prefer_lower`, else `upper`.
    fn nearest(&self, ts: NaiveDateTime, lower: usize, upper: usize, prefer_lower: bool) -> usize {
        let below = ts - self.timestamps[lower];
        let above = self.timestamps[upper] - ts;
        match below.cmp(&above) {
            Ordering::Less => lower,
            Ordering::Greater => upper,
            Ordering::Equal if prefer_lower => lower,
            Ordering::Equal => upper,
        }
    }
}

/// Indices of the closest timestamps at or below and at or above `ts`.
pub fn bracket(ts: NaiveDateTime, ordered: &[NaiveDateTime]) -> (Option<usize>, Option<usize>) {
    let Some(last) = ordered.len().checked_sub(1) else {
        return (None, None);
    };
    if last == 0 {
        return match ts.cmp(&ordered[0]) {
            Ordering::Equal => (Some(0), Some(0)),
            Ordering::Less => (None, Some(0)),
            Ordering::Greater => (Some(0), None),
        };
    }
    if ts == ordered[0] {
        return (Some(0), Some(0));
    }
    if ts == ordered[last] {
        return (Some(last), Some(last));
    }

    let upper = ordered.partition_point(|candidate| *candidate < ts);
    if upper <= last && ordered[upper] == ts {
        return (Some(upper), Some(upper));
    }
    (upper.checked_sub(1), (upper <= last).then_some(upper))
}

/// Links every capture window to its weather bracket.
pub fn link_files(
    index: &WeatherIndex,
    windows: &[CaptureWindow],
) -> Result<Vec<WeatherFileLink>, CatalogError> {
    windows.iter().map(|window| index.link(window)).collect()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chrono::NaiveDate;

    use super::*;

    fn at(hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2018, 5, 1)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    fn window(file_id: i64, start: NaiveDateTime, finish: NaiveDateTime) -> CaptureWindow {
        let mut file = FileRecord::new("/data/2018-05-01/cap", "left.bin", "stereoTop");
        file.start_time = Some(start);
        file.finish_time = Some(finish);
        CaptureWindow::of(file_id, &file).unwrap()
    }

    #[test]
    fn bracket_edges() {
        let ordered = vec![at(9, 58), at(10, 2), at(10, 10)];
        assert_eq!(bracket(at(10, 0), &[]), (None, None));
        assert_eq!(bracket(at(10, 0), &ordered[..1]), (Some(0), None));
        assert_eq!(bracket(at(9, 0), &ordered[..1]), (None, Some(0)));
        assert_eq!(bracket(at(9, 58), &ordered[..1]), (Some(0), Some(0)));
        assert_eq!(bracket(at(9, 58), &ordered), (Some(0), Some(0)));
        assert_eq!(bracket(at(10, 10), &ordered), (Some(2), Some(2)));
        assert_eq!(bracket(at(10, 2), &ordered), (Some(1), Some(1)));
        assert_eq!(bracket(at(10, 5), &ordered), (Some(1), Some(2)));
        assert_eq!(bracket(at(9, 0), &ordered), (None, Some(0)));
        assert_eq!(bracket(at(11, 0), &ordered), (Some(2), None));
    }

    #[test]
    fn nearest_neighbour_bracket() {
        let index = WeatherIndex::new(vec![(2, at(10, 2)), (1, at(9, 58)), (3, at(10, 10))]);
        let link = index.link(&window(7, at(10, 0), at(10, 5))).unwrap();
        assert_eq!(
            link,
            WeatherFileLink {
                file_id: 7,
                min_weather_id: 1,
                max_weather_id: 2
            }
        );
    }

    #[test]
    fn outside_coverage_is_fatal() {
        let index = WeatherIndex::new(vec![(1, at(9, 58)), (2, at(10, 2))]);
        assert_matches!(
            index.link(&window(1, at(10, 0), at(10, 5))),
            Err(CatalogError::NoWeatherCoverage(_))
        );
    }

    #[test]
    fn inverted_window_is_fatal() {
        let index = WeatherIndex::new(vec![(1, at(9, 58)), (2, at(10, 2)), (3, at(10, 10))]);
        assert_matches!(
            index.link(&window(1, at(10, 9), at(10, 0))),
            Err(CatalogError::InvertedBracket { .. })
        );
    }

    #[test]
    fn capture_windows() {
        let mut file = FileRecord::new("/data", "orphan.tif", "rgb_geotiff");
        assert_eq!(CaptureWindow::of(1, &file), None);

        file.finish_time = Some(at(10, 0));
        let window = CaptureWindow::of(4, &file).unwrap();
        assert_eq!((window.start, window.finish), (at(10, 0), at(10, 0)));
        assert_eq!(window.path, "/data/orphan.tif");
    }

    #[test]
    fn parses_station_readings_and_numbers_by_time() {
        let body = r#"{"environment_sensor_readings": [
            {"timestamp": "2018.05.01-10:02:00",
             "weather_station": {"temperature": {"value": 21.5, "unit": "C"},
                                 "brightness": {"value": "1200"},
                                 "relHumidity": 30}},
            {"timestamp": "2018.05.01-09:58:00",
             "weather_station": {"temperature": {"value": 20.0}}},
            {"weather_station": {}}
        ]}"#;
        let readings = parse_readings(body, "/weather/2018-05-01/a.json").unwrap();
        assert_eq!(readings.len(), 3);
        assert_eq!(readings[0].illuminance, Some(1200.0));
        assert_eq!(readings[0].relative_humidity, Some(30.0));

        let numbered = number_readings(readings);
        assert_eq!(numbered.len(), 2);
        assert_eq!(numbered[0].0, 1);
        assert_eq!(numbered[0].1.timestamp, Some(at(9, 58)));
        assert_eq!(numbered[1].1.temperature, Some(21.5));
    }

    #[test]
    fn missing_readings_key() {
        assert_matches!(
            parse_readings("{}", "w.json"),
            Err(CatalogError::MissingKey { .. })
        );
        assert_matches!(
            parse_readings("{", "w.json"),
            Err(CatalogError::MalformedJson { .. })
        );
    }
}
