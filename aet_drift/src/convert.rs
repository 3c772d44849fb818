//! FIT and GPX ingestion for the activity-to-CSV converter.
//!
//! Each input file yields a stream of timestamped records. Multiple
//! files covering the same workout (a watch file plus a footpod file,
//! say) are merged on wall-clock timestamps, keeping only instants
//! present in every file so the merged rows carry complete data.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::AetError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActivityFormat {
    Fit,
    Gpx,
}

impl ActivityFormat {
    /// Detect the format from the file extension, case-insensitively.
    pub fn from_path(path: &Path) -> Result<ActivityFormat, AetError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "fit" => Ok(ActivityFormat::Fit),
            "gpx" => Ok(ActivityFormat::Gpx),
            _ => Err(AetError::UnsupportedFormat(path.display().to_string())),
        }
    }
}

/// One timestamped observation from an activity file.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct ActivityRecord {
    pub timestamp: DateTime<Utc>,
    pub heart_rate: Option<f64>,
    /// Meters per second.
    pub speed: Option<f64>,
    /// Meters above sea level.
    pub elevation: Option<f64>,
}

/// A hole in the merged record stream.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct Gap {
    pub start: DateTime<Utc>,
    pub duration_sec: f64,
}

pub fn parse_activity_records(
    input: &[u8],
    format: ActivityFormat,
) -> Result<Vec<ActivityRecord>, AetError> {
    match format {
        ActivityFormat::Fit => parse_fit_records(input),
        ActivityFormat::Gpx => parse_gpx_records(input),
    }
}

fn parse_fit_records(input: &[u8]) -> Result<Vec<ActivityRecord>, AetError> {
    use fitparser::de::from_bytes;
    use fitparser::profile::MesgNum;

    let messages = from_bytes(input).map_err(|e| AetError::FitParse(e.to_string()))?;
    let mut out = Vec::new();

    for message in messages.into_iter() {
        if message.kind() != MesgNum::Record {
            continue;
        }
        let mut timestamp: Option<DateTime<Utc>> = None;
        let mut heart_rate = None;
        let mut speed = None;
        let mut enhanced_speed = None;
        let mut altitude = None;
        let mut enhanced_altitude = None;
        for field in message.fields() {
            match field.name() {
                "timestamp" => {
                    if let fitparser::Value::Timestamp(ts) = field.value() {
                        timestamp = Some(ts.with_timezone(&Utc));
                    }
                }
                "heart_rate" => {
                    if let Some(val) = fit_value_to_f64(field.value()) {
                        heart_rate = Some(val);
                    }
                }
                "speed" => {
                    if let Some(val) = fit_value_to_f64(field.value()) {
                        speed = Some(val);
                    }
                }
                "enhanced_speed" => {
                    if let Some(val) = fit_value_to_f64(field.value()) {
                        enhanced_speed = Some(val);
                    }
                }
                "altitude" => {
                    if let Some(val) = fit_value_to_f64(field.value()) {
                        altitude = Some(val);
                    }
                }
                "enhanced_altitude" => {
                    if let Some(val) = fit_value_to_f64(field.value()) {
                        enhanced_altitude = Some(val);
                    }
                }
                _ => {}
            }
        }
        let Some(timestamp) = timestamp else {
            continue;
        };
        out.push(ActivityRecord {
            timestamp,
            heart_rate,
            speed: enhanced_speed.or(speed),
            elevation: enhanced_altitude.or(altitude),
        });
    }

    Ok(out)
}

fn fit_value_to_f64(value: &fitparser::Value) -> Option<f64> {
    match value {
        fitparser::Value::Float32(v) => Some(*v as f64),
        fitparser::Value::Float64(v) => Some(*v),
        fitparser::Value::SInt16(v) => Some(*v as f64),
        fitparser::Value::UInt16(v) => Some(*v as f64),
        fitparser::Value::SInt32(v) => Some(*v as f64),
        fitparser::Value::UInt32(v) => Some(*v as f64),
        fitparser::Value::SInt64(v) => Some(*v as f64),
        fitparser::Value::UInt64(v) => Some(*v as f64),
        fitparser::Value::UInt16z(v) => Some(*v as f64),
        fitparser::Value::UInt32z(v) => Some(*v as f64),
        fitparser::Value::UInt64z(v) => Some(*v as f64),
        fitparser::Value::Byte(v) => Some(*v as f64),
        fitparser::Value::UInt8(v) => Some(*v as f64),
        fitparser::Value::UInt8z(v) => Some(*v as f64),
        fitparser::Value::SInt8(v) => Some(*v as f64),
        fitparser::Value::Array(values) => values.iter().find_map(fit_value_to_f64),
        _ => None,
    }
}

fn parse_gpx_records(input: &[u8]) -> Result<Vec<ActivityRecord>, AetError> {
    use std::io::Cursor;

    let mut cursor = Cursor::new(input);
    let gpx = gpx::read(&mut cursor).map_err(|e| AetError::GpxParse(e.to_string()))?;
    let mut out = Vec::new();

    for track in gpx.tracks {
        for segment in track.segments {
            for point in segment.points {
                let Some(time) = point.time else {
                    continue;
                };
                let iso = time.format().map_err(|e| AetError::GpxParse(e.to_string()))?;
                let timestamp = DateTime::parse_from_rfc3339(&iso)
                    .map_err(|e| AetError::GpxParse(e.to_string()))?
                    .with_timezone(&Utc);
                out.push(ActivityRecord {
                    timestamp,
                    heart_rate: None,
                    speed: None,
                    elevation: point.elevation,
                });
            }
        }
    }
    Ok(out)
}

/// Merge per-file record streams on wall-clock timestamps.
///
/// A timestamp survives only when every input file has a record for
/// it; surviving records take each column from the first file that
/// provides it. Duplicate timestamps within one file count once.
pub fn merge_records(files: Vec<Vec<ActivityRecord>>) -> Vec<ActivityRecord> {
    let file_count = files.len();
    let mut merged: BTreeMap<DateTime<Utc>, (usize, ActivityRecord)> = BTreeMap::new();

    for mut records in files {
        records.sort_by_key(|r| r.timestamp);
        records.dedup_by_key(|r| r.timestamp);
        for record in records {
            merged
                .entry(record.timestamp)
                .and_modify(|(count, existing)| {
                    *count += 1;
                    existing.heart_rate = existing.heart_rate.or(record.heart_rate);
                    existing.speed = existing.speed.or(record.speed);
                    existing.elevation = existing.elevation.or(record.elevation);
                })
                .or_insert((1, record));
        }
    }

    merged
        .into_values()
        .filter(|(count, _)| *count == file_count)
        .map(|(_, record)| record)
        .collect()
}

/// Report every jump between consecutive records larger than the
/// threshold. Records must already be sorted by timestamp.
pub fn detect_gaps(records: &[ActivityRecord], threshold_sec: f64) -> Vec<Gap> {
    records
        .windows(2)
        .filter_map(|pair| {
            let dt = (pair[1].timestamp - pair[0].timestamp).num_milliseconds() as f64 / 1000.0;
            (dt > threshold_sec).then(|| Gap {
                start: pair[0].timestamp,
                duration_sec: dt,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::path::PathBuf;

    fn ts(sec: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 6, 0, 0).unwrap() + Duration::seconds(sec)
    }

    fn record(
        sec: i64,
        heart_rate: Option<f64>,
        speed: Option<f64>,
        elevation: Option<f64>,
    ) -> ActivityRecord {
        ActivityRecord {
            timestamp: ts(sec),
            heart_rate,
            speed,
            elevation,
        }
    }

    #[test]
    fn format_detection_is_case_insensitive() {
        assert_eq!(
            ActivityFormat::from_path(&PathBuf::from("ride.fit")).unwrap(),
            ActivityFormat::Fit
        );
        assert_eq!(
            ActivityFormat::from_path(&PathBuf::from("RIDE.FIT")).unwrap(),
            ActivityFormat::Fit
        );
        assert_eq!(
            ActivityFormat::from_path(&PathBuf::from("run.gpx")).unwrap(),
            ActivityFormat::Gpx
        );
    }

    #[test]
    fn unknown_extensions_are_rejected() {
        for name in ["export.zip", "notes.txt", "noext"] {
            let err = ActivityFormat::from_path(&PathBuf::from(name)).unwrap_err();
            assert!(matches!(err, AetError::UnsupportedFormat(_)), "{name}");
        }
    }

    #[test]
    fn parses_gpx_track_points() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<gpx version="1.1" creator="unit test" xmlns="http://www.topografix.com/GPX/1/1">
  <trk>
    <trkseg>
      <trkpt lat="47.6062" lon="-122.3321">
        <ele>100.0</ele>
        <time>2024-05-01T06:00:00Z</time>
      </trkpt>
      <trkpt lat="47.6063" lon="-122.3321">
        <ele>101.5</ele>
        <time>2024-05-01T06:00:01Z</time>
      </trkpt>
    </trkseg>
  </trk>
</gpx>"#;
        let records = parse_activity_records(xml.as_bytes(), ActivityFormat::Gpx).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].timestamp, ts(0));
        assert_eq!(records[1].timestamp, ts(1));
        assert_eq!(records[0].elevation, Some(100.0));
        assert_eq!(records[1].elevation, Some(101.5));
        assert!(records[0].heart_rate.is_none());
        assert!(records[0].speed.is_none());
    }

    #[test]
    fn merge_keeps_only_shared_timestamps() {
        let watch = vec![
            record(0, Some(120.0), None, None),
            record(1, Some(121.0), None, None),
            record(2, Some(122.0), None, None),
        ];
        let pod = vec![record(1, None, Some(3.0), None), record(3, None, Some(3.1), None)];
        let merged = merge_records(vec![watch, pod]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].timestamp, ts(1));
    }

    #[test]
    fn merge_combines_columns_across_files() {
        let watch = vec![record(0, Some(120.0), None, Some(100.0))];
        let pod = vec![record(0, None, Some(3.0), None)];
        let merged = merge_records(vec![watch, pod]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].heart_rate, Some(120.0));
        assert_eq!(merged[0].speed, Some(3.0));
        assert_eq!(merged[0].elevation, Some(100.0));
    }

    #[test]
    fn single_file_merge_keeps_all_rows_sorted() {
        let records = vec![
            record(2, Some(122.0), None, None),
            record(0, Some(120.0), None, None),
            record(1, Some(121.0), None, None),
        ];
        let merged = merge_records(vec![records]);
        assert_eq!(merged.len(), 3);
        assert!(merged.windows(2).all(|p| p[0].timestamp < p[1].timestamp));
    }

    #[test]
    fn duplicate_timestamps_within_a_file_count_once() {
        let watch = vec![
            record(0, Some(120.0), None, None),
            record(0, Some(999.0), None, None),
        ];
        let pod = vec![record(0, None, Some(3.0), None)];
        let merged = merge_records(vec![watch, pod]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].heart_rate, Some(120.0));
    }

    #[test]
    fn gaps_above_threshold_are_reported() {
        let records = vec![
            record(0, Some(120.0), None, None),
            record(1, Some(121.0), None, None),
            record(5, Some(122.0), None, None),
        ];
        let gaps = detect_gaps(&records, 1.0);
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].start, ts(1));
        assert!((gaps[0].duration_sec - 4.0).abs() < 1e-9);
    }

    #[test]
    fn contiguous_records_report_no_gaps() {
        let records: Vec<ActivityRecord> =
            (0..5).map(|i| record(i, Some(120.0), None, None)).collect();
        assert!(detect_gaps(&records, 1.0).is_empty());
    }
}
