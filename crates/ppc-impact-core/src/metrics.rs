//! Efficiency ratios computed from raw counts with guarded denominators.

use serde::{Deserialize, Serialize};

use crate::{ImpactError, PerformanceRow};

/// Summed raw counts for a window. Counts are `f64` because window-length
/// normalization scales them.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricTotals {
    pub impressions: f64,
    pub clicks: f64,
    pub spend: f64,
    pub sales: f64,
    pub orders: f64,
}

impl MetricTotals {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_row(row: &PerformanceRow) -> Self {
        Self {
            impressions: row.impressions as f64,
            clicks: row.clicks as f64,
            spend: row.spend,
            sales: row.sales,
            orders: row.orders as f64,
        }
    }

    #[must_use]
    pub fn sum<'a>(rows: impl IntoIterator<Item = &'a PerformanceRow>) -> Self {
        rows.into_iter().fold(Self::default(), |mut acc, row| {
            acc.add(&Self::from_row(row));
            acc
        })
    }

    pub fn add(&mut self, other: &Self) {
        self.impressions += other.impressions;
        self.clicks += other.clicks;
        self.spend += other.spend;
        self.sales += other.sales;
        self.orders += other.orders;
    }

    #[must_use]
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            impressions: self.impressions * factor,
            clicks: self.clicks * factor,
            spend: self.spend * factor,
            sales: self.sales * factor,
            orders: self.orders * factor,
        }
    }

    #[must_use]
    pub fn has_activity(&self) -> bool {
        self.spend > 0.0 || self.clicks > 0.0 || self.sales > 0.0
    }

    #[must_use]
    pub fn roas(&self) -> f64 {
        ratio_or_zero(self.sales, self.spend)
    }

    /// Cost per click; `None` without clicks.
    #[must_use]
    pub fn cpc(&self) -> Option<f64> {
        (self.clicks > 0.0).then(|| self.spend / self.clicks)
    }

    /// Sales per click; `None` without clicks.
    #[must_use]
    pub fn spc(&self) -> Option<f64> {
        (self.clicks > 0.0).then(|| self.sales / self.clicks)
    }

    /// # Errors
    /// Returns [`ImpactError::InvalidMetricInput`] for negative or non-finite
    /// totals.
    pub fn normalized(&self) -> Result<NormalizedMetrics, ImpactError> {
        normalize(
            self.spend,
            self.sales,
            self.clicks,
            self.impressions,
            self.orders,
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct NormalizedMetrics {
    pub roas: f64,
    /// `None` when there were no sales; zero ACOS would claim free revenue.
    pub acos: Option<f64>,
    pub ctr: f64,
    pub cvr: f64,
    pub cpc: f64,
    pub spc: f64,
}

/// Computes ROAS, ACOS, CTR, CVR, CPC and SPC from raw counts.
///
/// # Errors
/// Returns [`ImpactError::InvalidMetricInput`] when any input is negative or
/// not finite. Zero activity is valid and yields zero ratios.
pub fn normalize(
    spend: f64,
    sales: f64,
    clicks: f64,
    impressions: f64,
    orders: f64,
) -> Result<NormalizedMetrics, ImpactError> {
    for (name, value) in [
        ("spend", spend),
        ("sales", sales),
        ("clicks", clicks),
        ("impressions", impressions),
        ("orders", orders),
    ] {
        if !value.is_finite() || value < 0.0 {
            return Err(ImpactError::InvalidMetricInput(format!(
                "{name} MUST be a finite value >= 0, got {value}"
            )));
        }
    }

    Ok(NormalizedMetrics {
        roas: ratio_or_zero(sales, spend),
        acos: (sales > 0.0).then(|| spend / sales * 100.0),
        ctr: ratio_or_zero(clicks, impressions),
        cvr: ratio_or_zero(orders, clicks),
        cpc: ratio_or_zero(spend, clicks),
        spc: ratio_or_zero(sales, clicks),
    })
}

fn ratio_or_zero(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]

    use super::*;
    use crate::fixtures::{fixture_row, must_ok, ACTION_DATE};

    #[test]
    fn zero_spend_yields_zero_roas_not_error() {
        let metrics = must_ok(normalize(0.0, 25.0, 0.0, 0.0, 0.0));
        assert_eq!(metrics.roas, 0.0);
        assert_eq!(metrics.cpc, 0.0);
        assert_eq!(metrics.acos, Some(0.0));
    }

    #[test]
    fn acos_is_absent_without_sales() {
        let metrics = must_ok(normalize(40.0, 0.0, 20.0, 1_000.0, 0.0));
        assert_eq!(metrics.acos, None);
        assert_eq!(metrics.roas, 0.0);
        assert_eq!(metrics.ctr, 0.02);
        assert_eq!(metrics.cpc, 2.0);
    }

    #[test]
    fn ratios_match_definitions() {
        let metrics = must_ok(normalize(50.0, 200.0, 25.0, 500.0, 5.0));
        assert_eq!(metrics.roas, 4.0);
        assert_eq!(metrics.acos, Some(25.0));
        assert_eq!(metrics.ctr, 0.05);
        assert_eq!(metrics.cvr, 0.2);
        assert_eq!(metrics.cpc, 2.0);
        assert_eq!(metrics.spc, 8.0);
    }

    #[test]
    fn negative_inputs_are_rejected_not_clamped() {
        assert!(matches!(
            normalize(10.0, 5.0, -1.0, 100.0, 0.0),
            Err(ImpactError::InvalidMetricInput(_))
        ));
        assert!(matches!(
            normalize(f64::NAN, 5.0, 1.0, 100.0, 0.0),
            Err(ImpactError::InvalidMetricInput(_))
        ));
    }

    #[test]
    fn totals_sum_and_scale_rows() {
        let rows = [
            fixture_row(ACTION_DATE, 10, 20.0, 60.0),
            fixture_row(ACTION_DATE, 30, 40.0, 100.0),
        ];
        let totals = MetricTotals::sum(&rows);
        assert_eq!(totals.clicks, 40.0);
        assert_eq!(totals.spend, 60.0);
        assert_eq!(totals.cpc(), Some(1.5));
        assert_eq!(totals.spc(), Some(4.0));

        let doubled = totals.scaled(2.0);
        assert_eq!(doubled.spend, 120.0);
        assert_eq!(doubled.roas(), totals.roas());
        assert!(!MetricTotals::default().has_activity());
        assert_eq!(MetricTotals::default().cpc(), None);
    }
}
