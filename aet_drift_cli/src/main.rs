use std::fs;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

use aet_drift::{
    analyze, detect_gaps, load_csv_samples, merge_records, parse_activity_records, parse_clock,
    summarize, ActivityFormat, ActivityRecord, AnalysisSummary, Params,
};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::{ArgAction, Parser, Subcommand, ValueHint};
use rayon::prelude::*;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Consecutive merged records further apart than this are a gap.
const GAP_THRESHOLD_SEC: f64 = 1.0;

#[derive(Parser, Debug)]
#[command(author, version, about = "Rolling-window aerobic threshold drift analysis", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the drift analysis over a workout CSV
    Analyze(AnalyzeArgs),
    /// Convert FIT/GPX activity files into the workout CSV layout
    Convert(ConvertArgs),
}

#[derive(Parser, Debug)]
struct AnalyzeArgs {
    /// Workout CSV to analyze
    #[arg(value_hint = ValueHint::FilePath)]
    csv_path: PathBuf,

    /// Analysis start offset as H:M:S or H:M
    #[arg(short = 's', long = "start_time")]
    start_time: String,

    /// Analysis end offset as H:M:S or H:M
    #[arg(short = 'e', long = "end_time")]
    end_time: String,

    /// Half-window length in minutes (0 uses the widest window that fits)
    #[arg(short = 'w', long, default_value_t = 30)]
    window: u32,

    /// Seconds to advance between windows
    #[arg(short = 'f', long, default_value_t = 1)]
    frequency: u32,

    /// Drop rows whose rolling speed exceeds this (mph)
    #[arg(long = "max_speed")]
    max_speed: Option<f64>,

    /// Drop rows whose rolling climb rate exceeds this (ft/hour)
    #[arg(long = "max_elev")]
    max_elev: Option<f64>,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,

    /// Profile major stages with timings
    #[arg(long, action = ArgAction::SetTrue)]
    profile: bool,
}

#[derive(Parser, Debug)]
struct ConvertArgs {
    /// FIT/GPX files to merge
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    /// Label appended to the date-derived output file name
    #[arg(short = 'n', long)]
    name: Option<String>,

    /// Output CSV path (overrides the date-derived default)
    #[arg(short = 'o', long, value_hint = ValueHint::FilePath)]
    out: Option<PathBuf>,

    /// Warn about holes in the merged record stream
    #[arg(long = "detect_gaps", action = ArgAction::SetTrue)]
    detect_gaps: bool,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_level = match &cli.command {
        Command::Analyze(args) => {
            if args.verbose {
                "debug"
            } else {
                "info"
            }
        }
        Command::Convert(args) => {
            if args.verbose {
                "debug"
            } else {
                "info"
            }
        }
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Analyze(args) => handle_analyze(args),
        Command::Convert(args) => handle_convert(args),
    }
}

fn handle_analyze(args: AnalyzeArgs) -> Result<()> {
    let start_sec = parse_clock(&args.start_time)?;
    let end_sec = parse_clock(&args.end_time)?;

    let mut params = Params::default();
    params.start_sec = start_sec;
    params.end_sec = end_sec;
    params.window_min = args.window;
    params.frequency_sec = args.frequency.max(1);
    params.max_speed_mph = args.max_speed;
    params.max_elev_ft_hr = args.max_elev;

    let t_load = Instant::now();
    let data = fs::read(&args.csv_path)
        .with_context(|| format!("failed to read {}", args.csv_path.display()))?;
    let samples = load_csv_samples(&data)
        .with_context(|| format!("failed to parse {}", args.csv_path.display()))?;
    if args.profile || args.verbose {
        info!(
            "Load stage: {:.1} ms ({} rows)",
            t_load.elapsed().as_secs_f64() * 1000.0,
            samples.len()
        );
    }

    let t_analysis = Instant::now();
    let output = analyze(&samples, &params)?;
    if args.profile || args.verbose {
        info!(
            "Analysis stage: {:.1} ms ({} rows analyzed)",
            t_analysis.elapsed().as_secs_f64() * 1000.0,
            output.rows_analyzed
        );
    }

    if let Some(ceiling) = params.max_speed_mph {
        info!(
            "Removed {} rows with rolling speed above {} mph",
            output.filter.removed_speed_rows, ceiling
        );
    }
    if let Some(ceiling) = params.max_elev_ft_hr {
        info!(
            "Removed {} rows with rolling climb rate above {} ft/hour",
            output.filter.removed_elev_rows, ceiling
        );
    }

    let summary = summarize(&output)?;
    print!("{}", render_summary(&summary));
    Ok(())
}

fn render_summary(summary: &AnalysisSummary) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "Results from {} windows: AeT {:.2} +/- {:.2} bpm\n",
        summary.window_count, summary.aet_start_mean, summary.aet_start_stdev
    ));

    let header = [
        "Method",
        "AeT Drift (%)",
        "Pace Drift (%)",
        "Pace @ AeT",
        "Successful",
    ];
    let mut rows: Vec<[String; 5]> = Vec::with_capacity(summary.metrics.len());
    for metric in &summary.metrics {
        let pace_drift = match (metric.pace_drift_mean, metric.pace_drift_stdev) {
            (Some(mean), Some(stdev)) => format!("{:.2} +/- {:.2}", mean, stdev),
            _ => "NA".to_string(),
        };
        let pace_start = match (
            metric.pace_start_mean,
            metric.pace_start_stdev,
            metric.spec.units(),
        ) {
            (Some(mean), Some(stdev), Some(units)) => {
                format!("{:.2} +/- {:.2} {}", mean, stdev, units)
            }
            _ => "NA".to_string(),
        };
        rows.push([
            metric.spec.name().to_string(),
            format!("{:.2} +/- {:.2}", metric.aet_drift_mean, metric.aet_drift_stdev),
            pace_drift,
            pace_start,
            metric.successful.to_string(),
        ]);
    }

    let mut widths = header.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row.iter()) {
            *width = (*width).max(cell.len());
        }
    }

    let mut rule = String::from("+");
    for width in widths {
        rule.push_str(&"-".repeat(width + 2));
        rule.push('+');
    }
    rule.push('\n');

    out.push_str(&rule);
    out.push_str(&render_row(&header.map(String::from), &widths));
    out.push_str(&rule);
    for row in &rows {
        out.push_str(&render_row(row, &widths));
    }
    out.push_str(&rule);
    out
}

fn render_row(cells: &[String; 5], widths: &[usize; 5]) -> String {
    let mut line = String::from("|");
    for (cell, width) in cells.iter().zip(widths.iter()) {
        line.push_str(&format!(" {:<width$} |", cell, width = width));
    }
    line.push('\n');
    line
}

fn handle_convert(args: ConvertArgs) -> Result<()> {
    let t_parse = Instant::now();
    let inputs: Vec<(usize, PathBuf)> = args.inputs.iter().cloned().enumerate().collect();

    let mut parsed: Vec<(usize, Vec<ActivityRecord>)> = inputs
        .par_iter()
        .map(|(file_id, path)| -> Result<(usize, Vec<ActivityRecord>)> {
            let format = ActivityFormat::from_path(path)?;
            let data =
                fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
            let records = parse_activity_records(&data, format)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            info!("Parsed {} records from {}", records.len(), path.display());
            Ok((*file_id, records))
        })
        .collect::<Result<Vec<_>>>()?;

    // Restore original ordering by input position
    parsed.sort_by_key(|(id, _)| *id);
    let files: Vec<Vec<ActivityRecord>> = parsed.into_iter().map(|(_, r)| r).collect();
    if args.verbose {
        info!(
            "Parse stage: {:.1} ms",
            t_parse.elapsed().as_secs_f64() * 1000.0
        );
    }

    let merged = merge_records(files);
    if merged.is_empty() {
        return Err(anyhow!("no overlapping records found in input files"));
    }
    info!("Merged stream has {} records", merged.len());

    if args.detect_gaps {
        let gaps = detect_gaps(&merged, GAP_THRESHOLD_SEC);
        for gap in &gaps {
            warn!(
                "Gap of {:.1} s starting at {}",
                gap.duration_sec,
                gap.start.to_rfc3339()
            );
        }
        info!(
            "Found {} gaps longer than {} s",
            gaps.len(),
            GAP_THRESHOLD_SEC
        );
    }

    let output = match args.out {
        Some(path) => path,
        None => default_output_path(merged[0].timestamp, args.name.as_deref()),
    };
    write_activity_csv(&merged, &output)?;
    info!("Wrote {} rows to {}", merged.len(), output.display());
    Ok(())
}

fn default_output_path(first: DateTime<Utc>, name: Option<&str>) -> PathBuf {
    let date = first.format("%Y%m%d");
    match name {
        Some(name) => PathBuf::from(format!("{}-{}.csv", date, name)),
        None => PathBuf::from(format!("{}.csv", date)),
    }
}

fn write_activity_csv(records: &[ActivityRecord], path: &Path) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = csv::Writer::from_writer(file);
    writer.write_record(["activity", "timestamp", "heart_rate", "speed", "elevation"])?;

    let Some(first) = records.first().map(|r| r.timestamp) else {
        writer.flush()?;
        return Ok(());
    };
    for record in records {
        let offset = (record.timestamp - first).num_seconds().max(0) as u64;
        writer.write_record([
            format_offset(offset),
            record.timestamp.to_rfc3339(),
            record.heart_rate.map(|v| v.to_string()).unwrap_or_default(),
            record.speed.map(|v| v.to_string()).unwrap_or_default(),
            record.elevation.map(|v| v.to_string()).unwrap_or_default(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn format_offset(total_sec: u64) -> String {
    let hours = total_sec / 3600;
    let minutes = (total_sec % 3600) / 60;
    let seconds = total_sec % 60;
    format!("{}:{:02}:{:02}", hours, minutes, seconds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aet_drift::{MetricSpec, MetricSummary};
    use chrono::{Duration, TimeZone};

    fn metric(
        spec: MetricSpec,
        pace: Option<(f64, f64, f64, f64)>,
        successful: bool,
    ) -> MetricSummary {
        MetricSummary {
            spec,
            aet_drift_mean: 2.0,
            aet_drift_stdev: 0.5,
            pace_drift_mean: pace.map(|p| p.0),
            pace_drift_stdev: pace.map(|p| p.1),
            pace_start_mean: pace.map(|p| p.2),
            pace_start_stdev: pace.map(|p| p.3),
            successful,
        }
    }

    #[test]
    fn summary_table_renders_na_for_missing_pace() {
        let summary = AnalysisSummary {
            window_count: 3,
            aet_start_mean: 141.5,
            aet_start_stdev: 1.25,
            metrics: vec![
                metric(MetricSpec::Raw, None, true),
                metric(MetricSpec::Speed, Some((1.0, 0.3, 6.5, 0.2)), false),
            ],
        };
        let rendered = render_summary(&summary);
        assert!(rendered.starts_with("Results from 3 windows: AeT 141.50 +/- 1.25 bpm\n"));
        assert!(rendered.contains("| raw"));
        assert!(rendered.contains("| hr/speed"));
        assert!(rendered.contains("NA"));
        assert!(rendered.contains("6.50 +/- 0.20 mph"));
        assert!(rendered.contains("false"));
    }

    #[test]
    fn offsets_render_as_clock_times() {
        assert_eq!(format_offset(0), "0:00:00");
        assert_eq!(format_offset(3661), "1:01:01");
        assert_eq!(format_offset(7325), "2:02:05");
    }

    #[test]
    fn default_output_name_includes_date_and_label() {
        let first = Utc.with_ymd_and_hms(2024, 5, 1, 6, 0, 0).unwrap();
        assert_eq!(
            default_output_path(first, None),
            PathBuf::from("20240501.csv")
        );
        assert_eq!(
            default_output_path(first, Some("tempo")),
            PathBuf::from("20240501-tempo.csv")
        );
    }

    #[test]
    fn activity_csv_round_trips_through_the_loader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let first = Utc.with_ymd_and_hms(2024, 5, 1, 6, 0, 0).unwrap();
        let records: Vec<ActivityRecord> = (0..3)
            .map(|i| ActivityRecord {
                timestamp: first + Duration::seconds(i),
                heart_rate: Some(120.0 + i as f64),
                speed: Some(3.0),
                elevation: (i != 1).then(|| 100.0),
            })
            .collect();
        write_activity_csv(&records, &path).unwrap();

        let data = fs::read(&path).unwrap();
        let samples = load_csv_samples(&data).unwrap();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0].t, 0.0);
        assert_eq!(samples[2].t, 2.0);
        assert_eq!(samples[0].heart_rate, 120.0);
        assert!(samples[1].elevation.is_some_and(f64::is_nan));
        assert_eq!(samples[2].elevation, Some(100.0));
    }
}
