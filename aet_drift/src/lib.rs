//! Core rolling-window aerobic threshold (AeT) drift analysis library.

use ndarray::{s, Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod convert;
pub mod metric;
pub mod summary;

pub use convert::{
    detect_gaps, merge_records, parse_activity_records, ActivityFormat, ActivityRecord, Gap,
};
pub use metric::{active_specs, Column, MetricSpec};
pub use summary::{summarize, AnalysisSummary, MetricSummary};

#[derive(Error, Debug)]
pub enum AetError {
    #[error("missing required data: {0}")]
    Validation(String),
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("insufficient data: {0}")]
    InsufficientData(String),
    #[error("unsupported file format: {0}")]
    UnsupportedFormat(String),
    #[error("failed to parse FIT file: {0}")]
    FitParse(String),
    #[error("failed to parse GPX file: {0}")]
    GpxParse(String),
    #[error("failed to parse CSV file: {0}")]
    CsvParse(String),
}

/// Meters/second to miles/hour.
const MPS_TO_MPH: f64 = 3600.0 / 1609.34;
/// Meters/second to feet/hour.
const MPS_TO_FT_PER_HOUR: f64 = 3.28084 * 3600.0;
/// Keeps pace-ratio divisions finite when the pace signal is zero.
const PACE_EPSILON: f64 = 1e-32;
/// Sample count for the outlier-filter rolling mean (5 s at 1 Hz recording).
const ROLLING_WINDOW: usize = 5;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Params {
    /// Analysis range start, seconds from activity start (inclusive).
    pub start_sec: f64,
    /// Analysis range end, seconds from activity start (exclusive).
    pub end_sec: f64,
    /// Minutes per window half; 0 requests the largest window the data allows.
    pub window_min: u32,
    /// Step between successive window starts, in seconds.
    pub frequency_sec: u32,
    /// Rolling-speed ceiling in mph; rows above it are dropped.
    pub max_speed_mph: Option<f64>,
    /// Rolling climb-rate ceiling in feet/hour; rows above it are dropped.
    pub max_elev_ft_hr: Option<f64>,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            start_sec: 0.0,
            end_sec: f64::INFINITY,
            window_min: 30,
            frequency_sec: 1,
            max_speed_mph: None,
            max_elev_ft_hr: None,
        }
    }
}

/// One row of a workout timeseries.
///
/// `speed` and `elevation` presence is uniform across a loaded file: the
/// loader fills them for every row when the column exists and for none
/// otherwise. An empty cell in a present column reads as NaN.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Sample {
    /// Seconds since activity start.
    pub t: f64,
    /// Beats per minute.
    pub heart_rate: f64,
    /// Meters/second.
    pub speed: Option<f64>,
    /// Meters.
    pub elevation: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct CsvRow {
    activity: String,
    #[serde(default)]
    heart_rate: Option<f64>,
    #[serde(default)]
    speed: Option<f64>,
    #[serde(default)]
    enhanced_speed: Option<f64>,
    #[serde(default)]
    elevation: Option<f64>,
}

/// Load workout samples from CSV bytes.
///
/// Requires `activity` (H:M:S elapsed offset) and `heart_rate` columns.
/// `speed`/`enhanced_speed` and `elevation` are optional and activate the
/// derived metric variants when present; other columns are ignored.
pub fn load_csv_samples(input: &[u8]) -> Result<Vec<Sample>, AetError> {
    let mut reader = csv::Reader::from_reader(input);
    let headers = reader
        .headers()
        .map_err(|e| AetError::CsvParse(e.to_string()))?
        .clone();

    let missing: Vec<&str> = ["activity", "heart_rate"]
        .into_iter()
        .filter(|required| !headers.iter().any(|h| h == *required))
        .collect();
    if !missing.is_empty() {
        return Err(AetError::Validation(format!(
            "missing required column(s): {}",
            missing.join(", ")
        )));
    }

    let has_speed = headers.iter().any(|h| h == "speed" || h == "enhanced_speed");
    let has_elevation = headers.iter().any(|h| h == "elevation");

    let mut samples = Vec::new();
    for row in reader.deserialize::<CsvRow>() {
        let row = row.map_err(|e| AetError::CsvParse(e.to_string()))?;
        let t = parse_offset(&row.activity)?;
        samples.push(Sample {
            t,
            heart_rate: row.heart_rate.unwrap_or(f64::NAN),
            speed: has_speed.then(|| row.speed.or(row.enhanced_speed).unwrap_or(f64::NAN)),
            elevation: has_elevation.then(|| row.elevation.unwrap_or(f64::NAN)),
        });
    }
    Ok(samples)
}

fn parse_offset(text: &str) -> Result<f64, AetError> {
    let invalid =
        || AetError::CsvParse(format!("invalid activity offset '{text}': expected H:M:S"));
    let parts: Vec<&str> = text.trim().split(':').collect();
    if parts.len() != 3 {
        return Err(invalid());
    }
    let hours: u32 = parts[0].parse().map_err(|_| invalid())?;
    let minutes: u32 = parts[1].parse().map_err(|_| invalid())?;
    let seconds: f64 = parts[2].parse().map_err(|_| invalid())?;
    if minutes >= 60 || !(0.0..60.0).contains(&seconds) {
        return Err(invalid());
    }
    Ok(f64::from(hours) * 3600.0 + f64::from(minutes) * 60.0 + seconds)
}

/// Parse an `H:M:S` or `H:M` wall-clock-style offset argument into seconds.
///
/// The variant is auto-detected from the colon count; anything else is a
/// configuration error, raised before any file I/O.
pub fn parse_clock(text: &str) -> Result<f64, AetError> {
    let invalid =
        || AetError::Configuration(format!("invalid time '{text}': expected H:M:S or H:M"));
    let parts: Vec<&str> = text.trim().split(':').collect();
    let (h, m, s) = match parts.as_slice() {
        [h, m, s] => (*h, *m, *s),
        [h, m] => (*h, *m, "0"),
        _ => return Err(invalid()),
    };
    let hours: u32 = h.parse().map_err(|_| invalid())?;
    let minutes: u32 = m.parse().map_err(|_| invalid())?;
    let seconds: u32 = s.parse().map_err(|_| invalid())?;
    if hours >= 24 || minutes >= 60 || seconds >= 60 {
        return Err(invalid());
    }
    Ok(f64::from(hours * 3600 + minutes * 60 + seconds))
}

/// Columnar workout timeseries with derived metric columns.
///
/// Derived columns exist only when their source column was present in the
/// input; which metric variants run is decided from that (see
/// [`metric::active_specs`]).
#[derive(Clone, Debug)]
pub struct Timeseries {
    t: Array1<f64>,
    heart_rate: Array1<f64>,
    mph: Option<Array1<f64>>,
    hr_pace: Option<Array1<f64>>,
    ft_hour: Option<Array1<f64>>,
    hr_elev: Option<Array1<f64>>,
}

impl Timeseries {
    pub fn len(&self) -> usize {
        self.t.len()
    }

    pub fn is_empty(&self) -> bool {
        self.t.is_empty()
    }

    pub fn has_column(&self, column: Column) -> bool {
        self.column(column).is_some()
    }

    pub(crate) fn column(&self, column: Column) -> Option<&Array1<f64>> {
        match column {
            Column::HeartRate => Some(&self.heart_rate),
            Column::Mph => self.mph.as_ref(),
            Column::HrPace => self.hr_pace.as_ref(),
            Column::FtHour => self.ft_hour.as_ref(),
            Column::HrElev => self.hr_elev.as_ref(),
        }
    }
}

/// Build the columnar timeseries from loaded samples.
///
/// Rows are sorted by offset and duplicate offsets dropped, then the derived
/// columns are computed: `mph` and `hr_pace` when speed is present, `ft_hour`
/// (first-difference climb rate, NaN for the first row) and `hr_elev` when
/// elevation is present.
pub fn build_timeseries(samples: &[Sample]) -> Result<Timeseries, AetError> {
    if samples.is_empty() {
        return Err(AetError::Validation("no samples in input".into()));
    }

    let mut rows: Vec<Sample> = samples.to_vec();
    rows.sort_by(|a, b| a.t.partial_cmp(&b.t).unwrap_or(std::cmp::Ordering::Equal));
    rows.dedup_by(|a, b| (a.t - b.t).abs() < 1e-6);

    let n = rows.len();
    let t = Array1::from_iter(rows.iter().map(|r| r.t));
    let heart_rate = Array1::from_iter(rows.iter().map(|r| r.heart_rate));

    let (mph, hr_pace) = if rows.iter().all(|r| r.speed.is_some()) {
        let mph: Array1<f64> =
            Array1::from_iter(rows.iter().map(|r| r.speed.unwrap_or(f64::NAN) * MPS_TO_MPH));
        let hr_pace = Array1::from_iter(
            heart_rate
                .iter()
                .zip(mph.iter())
                .map(|(&hr, &pace)| hr / (pace + PACE_EPSILON)),
        );
        (Some(mph), Some(hr_pace))
    } else {
        (None, None)
    };

    let (ft_hour, hr_elev) = if rows.iter().all(|r| r.elevation.is_some()) {
        let elevation: Vec<f64> = rows
            .iter()
            .map(|r| r.elevation.unwrap_or(f64::NAN))
            .collect();
        let mut rate = Vec::with_capacity(n);
        rate.push(f64::NAN);
        for i in 1..n {
            let dt = t[i] - t[i - 1];
            if dt > 0.0 {
                rate.push((elevation[i] - elevation[i - 1]) / dt * MPS_TO_FT_PER_HOUR);
            } else {
                rate.push(f64::NAN);
            }
        }
        let ft_hour = Array1::from_vec(rate);
        let hr_elev = Array1::from_iter(
            heart_rate
                .iter()
                .zip(ft_hour.iter())
                .map(|(&hr, &rate)| hr / (rate + PACE_EPSILON)),
        );
        (Some(ft_hour), Some(hr_elev))
    } else {
        (None, None)
    };

    Ok(Timeseries {
        t,
        heart_rate,
        mph,
        hr_pace,
        ft_hour,
        hr_elev,
    })
}

/// Restrict the timeseries to offsets in `[start_sec, end_sec)`.
pub fn select_range(
    ts: &Timeseries,
    start_sec: f64,
    end_sec: f64,
) -> Result<Timeseries, AetError> {
    let mask: Vec<bool> = ts
        .t
        .iter()
        .map(|&offset| offset >= start_sec && offset < end_sec)
        .collect();
    let selected = apply_mask(ts, &mask);
    if selected.is_empty() {
        return Err(AetError::Validation(format!(
            "time range [{start_sec}s, {end_sec}s) selects zero rows"
        )));
    }
    Ok(selected)
}

fn apply_mask(ts: &Timeseries, mask: &[bool]) -> Timeseries {
    let keep: Vec<usize> = mask
        .iter()
        .enumerate()
        .filter_map(|(i, &kept)| kept.then_some(i))
        .collect();
    let take = |col: &Array1<f64>| Array1::from_iter(keep.iter().map(|&i| col[i]));
    Timeseries {
        t: take(&ts.t),
        heart_rate: take(&ts.heart_rate),
        mph: ts.mph.as_ref().map(&take),
        hr_pace: ts.hr_pace.as_ref().map(&take),
        ft_hour: ts.ft_hour.as_ref().map(&take),
        hr_elev: ts.hr_elev.as_ref().map(&take),
    }
}

/// Trailing rolling mean; NaN until the window is full, NaN whenever the
/// window contains NaN.
fn rolling_mean(values: &Array1<f64>, window: usize) -> Array1<f64> {
    let n = values.len();
    let mut out = Array1::from_elem(n, f64::NAN);
    if window == 0 || n < window {
        return out;
    }
    for i in (window - 1)..n {
        let slice = values.slice(s![i + 1 - window..i + 1]);
        out[i] = slice.sum() / window as f64;
    }
    out
}

/// Row counts removed by each outlier filter pass.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct FilterSummary {
    pub removed_speed_rows: usize,
    pub removed_elev_rows: usize,
}

/// Drop rows whose rolling speed or climb rate exceeds the given ceilings.
///
/// Each requested filter needs its derived column. The filters compose
/// sequentially, speed first, each pass working on an independent copy; rows
/// where the rolling window is not yet full never pass a threshold.
pub fn filter_outliers(
    ts: &Timeseries,
    max_speed_mph: Option<f64>,
    max_elev_ft_hr: Option<f64>,
) -> Result<(Timeseries, FilterSummary), AetError> {
    let mut out = ts.clone();
    let mut summary = FilterSummary::default();

    if let Some(ceiling) = max_speed_mph {
        let mph = out.mph.as_ref().ok_or_else(|| {
            AetError::Configuration("derived pace column required to filter by max speed".into())
        })?;
        let rolling = rolling_mean(mph, ROLLING_WINDOW);
        let mask: Vec<bool> = rolling.iter().map(|&v| v < ceiling).collect();
        let before = out.len();
        out = apply_mask(&out, &mask);
        summary.removed_speed_rows = before - out.len();
    }

    if let Some(ceiling) = max_elev_ft_hr {
        let ft_hour = out.ft_hour.as_ref().ok_or_else(|| {
            AetError::Configuration(
                "derived climb rate column required to filter by max elevation".into(),
            )
        })?;
        let rolling = rolling_mean(ft_hour, ROLLING_WINDOW);
        let mask: Vec<bool> = rolling.iter().map(|&v| v < ceiling).collect();
        let before = out.len();
        out = apply_mask(&out, &mask);
        summary.removed_elev_rows = before - out.len();
    }

    Ok((out, summary))
}

/// One emitted drift window.
#[derive(Clone, Debug, Serialize)]
pub struct DriftWindow {
    /// First-half mean heart rate, bpm.
    pub aet_start: f64,
    /// Percent drift of the variant's drift column between halves.
    pub aet_drift: f64,
    /// First-half mean of the pace column, when the variant has one.
    pub pace_start: Option<f64>,
    /// Percent drift of the pace column, when the variant has one.
    pub pace_drift: Option<f64>,
}

/// All windows produced for one metric variant.
#[derive(Clone, Debug, Serialize)]
pub struct MetricWindows {
    pub spec: MetricSpec,
    pub windows: Vec<DriftWindow>,
}

fn effective_half_window(window_min: u32, len: usize) -> usize {
    // Cap so two consecutive halves always fit; a requested window of zero
    // means the largest feasible half.
    let cap = (len / 2).saturating_sub(1);
    let requested = window_min as usize * 60;
    if requested == 0 {
        cap
    } else {
        requested.min(cap)
    }
}

fn nan_mean(values: ArrayView1<f64>) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for &v in values.iter() {
        if !v.is_nan() {
            sum += v;
            count += 1;
        }
    }
    if count == 0 {
        f64::NAN
    } else {
        sum / count as f64
    }
}

fn drift_percent(
    values: &Array1<f64>,
    first: std::ops::Range<usize>,
    second: std::ops::Range<usize>,
) -> f64 {
    let first_mean = nan_mean(values.slice(s![first]));
    let second_mean = nan_mean(values.slice(s![second]));
    (second_mean - first_mean) / first_mean * 100.0
}

/// Slide two-half windows across the series for one metric variant.
///
/// A window covers samples `[i, i+W)` and `[i+W, i+2W)`; `i` starts at 0 and
/// advances by `frequency_sec` until the next full window would run past the
/// data. Zero eligible windows is a valid empty result.
pub fn slide_windows(
    ts: &Timeseries,
    spec: MetricSpec,
    window_min: u32,
    frequency_sec: u32,
) -> Vec<DriftWindow> {
    let n = ts.len();
    let half = effective_half_window(window_min, n);
    if half == 0 {
        return Vec::new();
    }
    let Some(drift_col) = ts.column(spec.drift_column()) else {
        return Vec::new();
    };
    let pace_col = spec.pace_column().and_then(|column| ts.column(column));
    let step = (frequency_sec as usize).max(1);

    let mut out = Vec::new();
    let mut start = 0usize;
    while start + 2 * half <= n {
        let mid = start + half;
        let end = start + 2 * half;
        let aet_start = nan_mean(ts.heart_rate.slice(s![start..mid]));
        let aet_drift = drift_percent(drift_col, start..mid, mid..end);
        let (pace_start, pace_drift) = match pace_col {
            Some(col) => (
                Some(nan_mean(col.slice(s![start..mid]))),
                Some(drift_percent(col, start..mid, mid..end)),
            ),
            None => (None, None),
        };
        out.push(DriftWindow {
            aet_start,
            aet_drift,
            pace_start,
            pace_drift,
        });
        start += step;
    }
    out
}

/// Run the window slider for every active metric variant, in declared order.
pub fn aggregate_metrics(
    ts: &Timeseries,
    window_min: u32,
    frequency_sec: u32,
) -> Vec<MetricWindows> {
    active_specs(ts)
        .into_iter()
        .map(|spec| MetricWindows {
            spec,
            windows: slide_windows(ts, spec, window_min, frequency_sec),
        })
        .collect()
}

/// Per-run analysis output: one window list per active metric variant.
#[derive(Clone, Debug, Serialize)]
pub struct AnalysisOutput {
    pub metrics: Vec<MetricWindows>,
    pub filter: FilterSummary,
    pub rows_analyzed: usize,
}

/// Run the full drift pipeline: build and derive, select the requested
/// range, filter outliers, then slide windows per active metric.
pub fn analyze(samples: &[Sample], params: &Params) -> Result<AnalysisOutput, AetError> {
    let ts = build_timeseries(samples)?;
    let ranged = select_range(&ts, params.start_sec, params.end_sec)?;
    let (filtered, filter) = filter_outliers(&ranged, params.max_speed_mph, params.max_elev_ft_hr)?;
    let metrics = aggregate_metrics(&filtered, params.window_min, params.frequency_sec);
    Ok(AnalysisOutput {
        metrics,
        filter,
        rows_analyzed: filtered.len(),
    })
}
