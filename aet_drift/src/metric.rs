//! Closed set of drift metric variants.
//!
//! Each variant names the drift series it slides over and, where one
//! exists, the companion pace series reported alongside it. A variant
//! is active for a given timeseries when every column it requires was
//! derivable from the input.

use serde::{Deserialize, Serialize};

use super::Timeseries;

/// Derived column identifiers within a [`Timeseries`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Column {
    HeartRate,
    Mph,
    HrPace,
    FtHour,
    HrElev,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricSpec {
    Raw,
    Speed,
    Elevation,
}

impl MetricSpec {
    /// Every variant, in fixed reporting order.
    pub const ALL: [MetricSpec; 3] = [MetricSpec::Raw, MetricSpec::Speed, MetricSpec::Elevation];

    pub fn name(&self) -> &'static str {
        match self {
            MetricSpec::Raw => "raw",
            MetricSpec::Speed => "hr/speed",
            MetricSpec::Elevation => "hr/elevation",
        }
    }

    /// Column whose two-half drift this variant measures.
    pub fn drift_column(&self) -> Column {
        match self {
            MetricSpec::Raw => Column::HeartRate,
            MetricSpec::Speed => Column::HrPace,
            MetricSpec::Elevation => Column::HrElev,
        }
    }

    /// Companion pace column, where the variant has one.
    pub fn pace_column(&self) -> Option<Column> {
        match self {
            MetricSpec::Raw => None,
            MetricSpec::Speed => Some(Column::Mph),
            MetricSpec::Elevation => Some(Column::FtHour),
        }
    }

    /// Display units for the pace column.
    pub fn units(&self) -> Option<&'static str> {
        match self {
            MetricSpec::Raw => None,
            MetricSpec::Speed => Some("mph"),
            MetricSpec::Elevation => Some("ft/hour"),
        }
    }

    pub fn required_columns(&self) -> &'static [Column] {
        match self {
            MetricSpec::Raw => &[Column::HeartRate],
            MetricSpec::Speed => &[Column::HrPace, Column::Mph],
            MetricSpec::Elevation => &[Column::HrElev, Column::FtHour],
        }
    }

    pub fn is_active(&self, ts: &Timeseries) -> bool {
        self.required_columns()
            .iter()
            .all(|col| ts.has_column(*col))
    }
}

/// Variants whose required columns are all present, in reporting order.
pub fn active_specs(ts: &Timeseries) -> Vec<MetricSpec> {
    MetricSpec::ALL
        .iter()
        .copied()
        .filter(|spec| spec.is_active(ts))
        .collect()
}
