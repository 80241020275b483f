//! Counterfactual baselines: the account's Winsorized median ROAS and a
//! target's trailing sales-per-click.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use time::{Date, Duration};

use crate::metrics::MetricTotals;
use crate::{ImpactError, ImpactRuleset, PerformanceRow};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SpcSource {
    Rolling30d,
    WindowLocal,
    Unavailable,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Baseline {
    pub universal_median_roas: Option<f64>,
    pub rolling_30d_spc: Option<f64>,
    /// SPC used for the counterfactual: rolling when available, else the
    /// before window's own SPC.
    pub spc: Option<f64>,
    pub spc_source: SpcSource,
    /// `spc` was lowered to the account's low-sample cap.
    #[serde(default)]
    pub spc_capped: bool,
}

impl Baseline {
    /// Target-level baseline given an already computed account ROAS.
    #[must_use]
    pub fn for_target(
        universal_median_roas: Option<f64>,
        target_history: &[&PerformanceRow],
        measurement_date: Date,
        window_local_spc: Option<f64>,
        ruleset: &ImpactRuleset,
    ) -> Self {
        let rolling_30d_spc = match rolling_spc(target_history, measurement_date, ruleset) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::debug!(%measurement_date, error = %err, "rolling spc unavailable");
                None
            }
        };

        let (spc, spc_source) = match (rolling_30d_spc, window_local_spc) {
            (Some(value), _) => (Some(value), SpcSource::Rolling30d),
            (None, Some(value)) => (Some(value), SpcSource::WindowLocal),
            (None, None) => (None, SpcSource::Unavailable),
        };

        Self {
            universal_median_roas,
            rolling_30d_spc,
            spc,
            spc_source,
            spc_capped: false,
        }
    }

    /// Caps `spc` at `cap` when the before window saw fewer than
    /// `min_clicks_for_impact` clicks.
    #[must_use]
    pub fn with_low_sample_cap(mut self, before_clicks: f64, cap: f64, ruleset: &ImpactRuleset) -> Self {
        if before_clicks >= ruleset.min_clicks_for_impact {
            return self;
        }
        if let Some(spc) = self.spc.filter(|spc| *spc > cap) {
            tracing::debug!(spc, cap, before_clicks, "capping low-sample spc");
            self.spc = Some(cap);
            self.spc_capped = true;
        }
        self
    }

    /// A null baseline cannot support a counterfactual.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.spc.is_none()
    }
}

/// Computes the full baseline for one target.
#[must_use]
pub fn compute_baseline(
    account_history: &[PerformanceRow],
    target_history: &[&PerformanceRow],
    measurement_date: Date,
    window_local_spc: Option<f64>,
    ruleset: &ImpactRuleset,
) -> Baseline {
    let universal = universal_median_roas(account_history, ruleset).ok();
    Baseline::for_target(
        universal,
        target_history,
        measurement_date,
        window_local_spc,
        ruleset,
    )
}

/// Ceiling for SPCs measured on too few clicks: median plus
/// `spc_outlier_sigma` sample standard deviations of the per-target SPCs of
/// targets with at least `min_clicks_for_impact` clicks. Falls back to
/// `low_sample_spc_cap` with fewer than `spc_cap_min_targets` such targets.
#[must_use]
pub fn low_sample_spc_cap<'a>(
    account_history: impl IntoIterator<Item = &'a PerformanceRow>,
    ruleset: &ImpactRuleset,
) -> f64 {
    let mut by_target: BTreeMap<_, Vec<&PerformanceRow>> = BTreeMap::new();
    for row in account_history {
        by_target.entry(row.target_key()).or_default().push(row);
    }

    let reliable = by_target
        .into_values()
        .map(MetricTotals::sum)
        .filter(|totals| totals.clicks >= ruleset.min_clicks_for_impact)
        .filter_map(|totals| totals.spc())
        .collect::<Vec<_>>();

    if reliable.len() < ruleset.spc_cap_min_targets.max(2) {
        return ruleset.low_sample_spc_cap;
    }

    match (median(&reliable), sample_std_dev(&reliable)) {
        (Some(center), Some(spread)) => center + ruleset.spc_outlier_sigma * spread,
        _ => ruleset.low_sample_spc_cap,
    }
}

/// Median ROAS over rows above the spend noise floor, with values above the
/// configured percentile clipped down to the percentile value.
///
/// # Errors
/// Returns [`ImpactError::InsufficientHistory`] when no row clears the noise
/// floor.
pub fn universal_median_roas<'a>(
    account_history: impl IntoIterator<Item = &'a PerformanceRow>,
    ruleset: &ImpactRuleset,
) -> Result<f64, ImpactError> {
    let values = account_history
        .into_iter()
        .filter(|row| row.spend >= ruleset.noise_floor_spend)
        .map(|row| MetricTotals::from_row(row).roas())
        .collect::<Vec<_>>();

    if values.is_empty() {
        return Err(ImpactError::InsufficientHistory(format!(
            "no rows with spend >= {} to estimate account ROAS",
            ruleset.noise_floor_spend
        )));
    }

    // Too few rows for a percentile to mean anything.
    if values.len() < ruleset.min_roas_sample {
        return median(&values).ok_or_else(|| {
            ImpactError::InsufficientHistory("empty ROAS sample".to_string())
        });
    }

    let clipped = winsorize_upper(&values, ruleset.winsor_percentile);
    median(&clipped)
        .ok_or_else(|| ImpactError::InsufficientHistory("empty ROAS sample".to_string()))
}

/// Σsales / Σclicks over `[measurement_date - rolling_spc_days, measurement_date)`.
///
/// # Errors
/// Returns [`ImpactError::InsufficientHistory`] when fewer than
/// `min_spc_click_days` distinct report dates carry clicks.
pub fn rolling_spc(
    target_history: &[&PerformanceRow],
    measurement_date: Date,
    ruleset: &ImpactRuleset,
) -> Result<f64, ImpactError> {
    let start = measurement_date
        .checked_sub(Duration::days(i64::from(ruleset.rolling_spc_days)))
        .ok_or_else(|| {
            ImpactError::InsufficientHistory(format!(
                "rolling window before {measurement_date} is outside the calendar"
            ))
        })?;

    let in_window = target_history
        .iter()
        .filter(|row| row.report_date >= start && row.report_date < measurement_date)
        .copied()
        .collect::<Vec<_>>();

    let click_days = in_window
        .iter()
        .filter(|row| row.clicks > 0)
        .map(|row| row.report_date)
        .collect::<BTreeSet<_>>();

    if click_days.len() < ruleset.min_spc_click_days.max(1) {
        return Err(ImpactError::InsufficientHistory(format!(
            "{} click-bearing days in trailing {} days, need {}",
            click_days.len(),
            ruleset.rolling_spc_days,
            ruleset.min_spc_click_days
        )));
    }

    let totals = MetricTotals::sum(in_window);
    totals.spc().ok_or_else(|| {
        ImpactError::InsufficientHistory("no clicks in trailing window".to_string())
    })
}

/// Percentile with linear interpolation between closest ranks.
#[must_use]
pub fn percentile_linear(values: &[f64], rank: f64) -> Option<f64> {
    let sorted = sorted_copy(values);
    percentile_of_sorted(&sorted, rank)
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn percentile_of_sorted(sorted: &[f64], rank: f64) -> Option<f64> {
    let last = sorted.len().checked_sub(1)?;
    let position = rank.clamp(0.0, 1.0) * last as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let fraction = position - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * fraction)
}

pub(crate) fn winsorize_upper(values: &[f64], rank: f64) -> Vec<f64> {
    let sorted = sorted_copy(values);
    let Some(cap) = percentile_of_sorted(&sorted, rank) else {
        return Vec::new();
    };
    values.iter().map(|value| value.min(cap)).collect()
}

pub(crate) fn median(values: &[f64]) -> Option<f64> {
    let sorted = sorted_copy(values);
    let mid = sorted.len() / 2;
    match sorted.len() {
        0 => None,
        len if len % 2 == 1 => Some(sorted[mid]),
        _ => Some((sorted[mid - 1] + sorted[mid]) / 2.0),
    }
}

#[allow(clippy::cast_precision_loss)]
fn sample_std_dev(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let count = values.len() as f64;
    let mean = values.iter().sum::<f64>() / count;
    let variance = values
        .iter()
        .map(|value| (value - mean).powi(2))
        .sum::<f64>()
        / (count - 1.0);
    Some(variance.sqrt())
}

fn sorted_copy(values: &[f64]) -> Vec<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(|lhs, rhs| lhs.partial_cmp(rhs).unwrap_or(Ordering::Equal));
    sorted
}
