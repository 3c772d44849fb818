//! Aggregate statistics over drift windows.
//!
//! Reduces the per-window output of an analysis to per-metric means
//! and sample standard deviations, and judges each metric against the
//! aerobic threshold acceptance bands.

use serde::Serialize;

use super::{AetError, AnalysisOutput};
use crate::metric::MetricSpec;

/// Upper bound (exclusive) on mean heart-rate drift for a passing test.
pub const AET_DRIFT_MAX_PCT: f64 = 5.0;
/// Symmetric bound (exclusive) on mean pace drift for a passing test.
pub const PACE_DRIFT_MAX_PCT: f64 = 5.0;

#[derive(Clone, Debug, Serialize)]
pub struct MetricSummary {
    pub spec: MetricSpec,
    pub aet_drift_mean: f64,
    pub aet_drift_stdev: f64,
    pub pace_drift_mean: Option<f64>,
    pub pace_drift_stdev: Option<f64>,
    pub pace_start_mean: Option<f64>,
    pub pace_start_stdev: Option<f64>,
    pub successful: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct AnalysisSummary {
    pub window_count: usize,
    /// Mean first-half heart rate across windows, the AeT estimate.
    pub aet_start_mean: f64,
    pub aet_start_stdev: f64,
    pub metrics: Vec<MetricSummary>,
}

/// A metric passes when heart-rate drift is positive but below the
/// acceptance band and pace drift stays inside its symmetric band.
/// Metrics without a pace series judge on heart-rate drift alone.
pub fn judge(aet_drift_mean: f64, pace_drift_mean: Option<f64>) -> bool {
    let pace = pace_drift_mean.unwrap_or(0.0);
    0.0 < aet_drift_mean
        && aet_drift_mean < AET_DRIFT_MAX_PCT
        && -PACE_DRIFT_MAX_PCT < pace
        && pace < PACE_DRIFT_MAX_PCT
}

pub fn summarize(output: &AnalysisOutput) -> Result<AnalysisSummary, AetError> {
    let first = output
        .metrics
        .first()
        .ok_or_else(|| AetError::InsufficientData("no drift metrics produced".into()))?;

    for metric in &output.metrics {
        if metric.windows.len() < 2 {
            return Err(AetError::InsufficientData(format!(
                "{} windows for method {}; at least 2 required",
                metric.windows.len(),
                metric.spec.name()
            )));
        }
    }

    let starts: Vec<f64> = first.windows.iter().map(|w| w.aet_start).collect();
    let (aet_start_mean, aet_start_stdev) = mean_stdev(&starts);

    let mut metrics = Vec::with_capacity(output.metrics.len());
    for metric in &output.metrics {
        let drifts: Vec<f64> = metric.windows.iter().map(|w| w.aet_drift).collect();
        let (aet_drift_mean, aet_drift_stdev) = mean_stdev(&drifts);

        let mut pace_drift_mean = None;
        let mut pace_drift_stdev = None;
        let mut pace_start_mean = None;
        let mut pace_start_stdev = None;
        if metric.spec.pace_column().is_some() {
            let pace_drifts: Vec<f64> =
                metric.windows.iter().filter_map(|w| w.pace_drift).collect();
            let (mean, stdev) = mean_stdev(&pace_drifts);
            pace_drift_mean = Some(mean);
            pace_drift_stdev = Some(stdev);

            let pace_starts: Vec<f64> =
                metric.windows.iter().filter_map(|w| w.pace_start).collect();
            let (mean, stdev) = mean_stdev(&pace_starts);
            pace_start_mean = Some(mean);
            pace_start_stdev = Some(stdev);
        }

        metrics.push(MetricSummary {
            spec: metric.spec,
            aet_drift_mean,
            aet_drift_stdev,
            pace_drift_mean,
            pace_drift_stdev,
            pace_start_mean,
            pace_start_stdev,
            successful: judge(aet_drift_mean, pace_drift_mean),
        });
    }

    Ok(AnalysisSummary {
        window_count: first.windows.len(),
        aet_start_mean,
        aet_start_stdev,
        metrics,
    })
}

/// Mean and sample standard deviation (n - 1 denominator).
fn mean_stdev(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (f64::NAN, f64::NAN);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    if values.len() < 2 {
        return (mean, 0.0);
    }
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean, var.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DriftWindow, FilterSummary, MetricWindows};

    fn window(aet_start: f64, aet_drift: f64, pace: Option<(f64, f64)>) -> DriftWindow {
        DriftWindow {
            aet_start,
            aet_drift,
            pace_start: pace.map(|(start, _)| start),
            pace_drift: pace.map(|(_, drift)| drift),
        }
    }

    fn output(metrics: Vec<MetricWindows>) -> AnalysisOutput {
        AnalysisOutput {
            metrics,
            filter: FilterSummary {
                removed_speed_rows: 0,
                removed_elev_rows: 0,
            },
            rows_analyzed: 0,
        }
    }

    #[test]
    fn single_window_is_insufficient() {
        let out = output(vec![MetricWindows {
            spec: MetricSpec::Raw,
            windows: vec![window(140.0, 1.0, None)],
        }]);
        let err = summarize(&out).unwrap_err();
        assert!(matches!(err, AetError::InsufficientData(_)));
        assert!(err.to_string().contains("raw"));
    }

    #[test]
    fn judge_bands_are_exclusive() {
        assert!(!judge(0.0, None));
        assert!(!judge(5.0, None));
        assert!(!judge(-1.0, None));
        assert!(judge(2.0, None));
        assert!(judge(4.99, Some(4.99)));
        assert!(judge(2.0, Some(-4.99)));
        assert!(!judge(2.0, Some(5.0)));
        assert!(!judge(2.0, Some(-6.0)));
    }

    #[test]
    fn mean_stdev_uses_sample_denominator() {
        let (mean, stdev) = mean_stdev(&[1.0, 2.0, 3.0, 4.0]);
        assert!((mean - 2.5).abs() < 1e-12);
        assert!((stdev - (5.0f64 / 3.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn summarize_reports_title_stats_from_first_metric() {
        let out = output(vec![
            MetricWindows {
                spec: MetricSpec::Raw,
                windows: vec![
                    window(140.0, 2.0, None),
                    window(142.0, 3.0, None),
                    window(144.0, 4.0, None),
                ],
            },
            MetricWindows {
                spec: MetricSpec::Speed,
                windows: vec![
                    window(139.0, 2.0, Some((6.5, 1.0))),
                    window(141.0, 3.0, Some((6.6, -1.0))),
                    window(143.0, 4.0, Some((6.7, 0.5))),
                ],
            },
        ]);
        let summary = summarize(&out).unwrap();
        assert_eq!(summary.window_count, 3);
        assert!((summary.aet_start_mean - 142.0).abs() < 1e-12);
        assert!(summary.aet_start_stdev > 0.0);

        let raw = &summary.metrics[0];
        assert_eq!(raw.spec, MetricSpec::Raw);
        assert!(raw.pace_drift_mean.is_none());
        assert!(raw.successful);

        let speed = &summary.metrics[1];
        assert_eq!(speed.spec, MetricSpec::Speed);
        let pace_mean = speed.pace_drift_mean.unwrap();
        assert!((pace_mean - 0.5 / 3.0).abs() < 1e-12);
        assert!(speed.successful);
    }

    #[test]
    fn summarize_is_deterministic() {
        let out = output(vec![MetricWindows {
            spec: MetricSpec::Raw,
            windows: vec![window(140.0, 2.0, None), window(141.0, 3.0, None)],
        }]);
        let first = summarize(&out).unwrap();
        let second = summarize(&out).unwrap();
        assert_eq!(first.window_count, second.window_count);
        assert_eq!(first.aet_start_mean, second.aet_start_mean);
        assert_eq!(
            first.metrics[0].successful,
            second.metrics[0].successful
        );
    }

    #[test]
    fn drifting_pace_fails_the_metric() {
        let out = output(vec![MetricWindows {
            spec: MetricSpec::Speed,
            windows: vec![
                window(140.0, 2.0, Some((6.5, 8.0))),
                window(141.0, 2.5, Some((6.4, 9.0))),
            ],
        }]);
        let summary = summarize(&out).unwrap();
        assert!(!summary.metrics[0].successful);
        assert!(summary.metrics[0].aet_drift_mean > 0.0);
    }
}
