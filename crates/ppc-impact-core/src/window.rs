//! Before/after measurement windows and horizon maturity.

use serde::{Deserialize, Serialize};
use time::{Date, Duration};

use crate::{Horizon, ImpactError, ImpactRuleset};

/// Half-open windows: `[before_start, before_end)` and `[after_start, after_end)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct MeasurementWindow {
    pub horizon: Horizon,
    pub before_start: Date,
    pub before_end: Date,
    pub after_start: Date,
    pub after_end: Date,
}

impl MeasurementWindow {
    #[must_use]
    pub fn contains_before(&self, date: Date) -> bool {
        date >= self.before_start && date < self.before_end
    }

    #[must_use]
    pub fn contains_after(&self, date: Date) -> bool {
        date >= self.after_start && date < self.after_end
    }

    /// First data date on which the horizon counts as mature.
    #[must_use]
    pub fn mature_on(&self, ruleset: &ImpactRuleset) -> Option<Date> {
        self.after_end
            .checked_add(Duration::days(i64::from(ruleset.maturity_buffer_days)))
    }
}

/// Builds the fixed-length before window and horizon-length after window.
///
/// # Errors
/// Returns [`ImpactError::Validation`] when the window falls outside the
/// representable calendar.
pub fn window_for(
    action_date: Date,
    horizon: Horizon,
    ruleset: &ImpactRuleset,
) -> Result<MeasurementWindow, ImpactError> {
    let before_start = action_date
        .checked_sub(Duration::days(i64::from(ruleset.before_window_days)))
        .ok_or_else(|| out_of_range(action_date))?;
    let after_end = action_date
        .checked_add(Duration::days(horizon.days()))
        .ok_or_else(|| out_of_range(action_date))?;

    Ok(MeasurementWindow {
        horizon,
        before_start,
        before_end: action_date,
        after_start: action_date,
        after_end,
    })
}

fn out_of_range(action_date: Date) -> ImpactError {
    ImpactError::Validation(format!(
        "measurement window for {action_date} is outside the supported calendar"
    ))
}

/// `latest_data_date >= action_date + horizon + buffer`.
#[must_use]
pub fn is_mature(
    action_date: Date,
    horizon: Horizon,
    latest_data_date: Date,
    ruleset: &ImpactRuleset,
) -> bool {
    let settle_days = horizon.days() + i64::from(ruleset.maturity_buffer_days);
    action_date
        .checked_add(Duration::days(settle_days))
        .is_some_and(|mature_on| latest_data_date >= mature_on)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MaturityStatus {
    Measured,
    /// After window has closed; waiting out the attribution buffer.
    Pending { days_until_mature: i64 },
    InWindow { days_elapsed: i64, horizon_days: i64 },
    /// No performance data exists for the account yet.
    NoData,
}

impl MaturityStatus {
    #[must_use]
    pub fn is_measured(self) -> bool {
        matches!(self, Self::Measured)
    }

    #[must_use]
    pub fn label(self) -> String {
        match self {
            Self::Measured => "Measured".to_string(),
            Self::Pending { days_until_mature } => format!("Pending ({days_until_mature}d)"),
            Self::InWindow {
                days_elapsed,
                horizon_days,
            } => format!("In Window ({days_elapsed}/{horizon_days}d)"),
            Self::NoData => "No Data".to_string(),
        }
    }
}

#[must_use]
pub fn maturity_status(
    window: &MeasurementWindow,
    latest_data_date: Option<Date>,
    ruleset: &ImpactRuleset,
) -> MaturityStatus {
    let Some(latest) = latest_data_date else {
        return MaturityStatus::NoData;
    };

    if is_mature(window.after_start, window.horizon, latest, ruleset) {
        return MaturityStatus::Measured;
    }

    if latest >= window.after_end {
        let days_until_mature = window
            .mature_on(ruleset)
            .map_or(0, |mature_on| (mature_on - latest).whole_days());
        return MaturityStatus::Pending { days_until_mature };
    }

    let horizon_days = window.horizon.days();
    let days_elapsed = if latest < window.after_start {
        0
    } else {
        ((latest - window.after_start).whole_days() + 1).min(horizon_days)
    };

    MaturityStatus::InWindow {
        days_elapsed,
        horizon_days,
    }
}

/// Factor applied to before-window totals so they cover as many days as the
/// after window.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn before_scale_factor(horizon: Horizon, ruleset: &ImpactRuleset) -> f64 {
    if !ruleset.normalize_window_lengths {
        return 1.0;
    }
    horizon.days() as f64 / f64::from(ruleset.before_window_days)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]

    use super::*;
    use crate::fixtures::{must_ok, ACTION_DATE};
    use time::macros::date;

    #[test]
    fn windows_are_fixed_before_and_horizon_after() {
        let ruleset = ImpactRuleset::v1();
        let window = must_ok(window_for(ACTION_DATE, Horizon::D30, &ruleset));

        assert_eq!(window.before_start, date!(2026 - 02 - 16));
        assert_eq!(window.before_end, ACTION_DATE);
        assert_eq!(window.after_start, ACTION_DATE);
        assert_eq!(window.after_end, date!(2026 - 04 - 01));

        assert!(window.contains_before(date!(2026 - 02 - 16)));
        assert!(!window.contains_before(ACTION_DATE));
        assert!(window.contains_after(ACTION_DATE));
        assert!(!window.contains_after(date!(2026 - 04 - 01)));
    }

    #[test]
    fn maturity_boundary_is_exactly_three_days_after_horizon() {
        let ruleset = ImpactRuleset::v1();
        let day_16 = ACTION_DATE + Duration::days(16);
        let day_17 = ACTION_DATE + Duration::days(17);

        assert!(!is_mature(ACTION_DATE, Horizon::D14, day_16, &ruleset));
        assert!(is_mature(ACTION_DATE, Horizon::D14, day_17, &ruleset));
    }

    #[test]
    fn maturity_status_distinguishes_in_window_pending_and_measured() {
        let ruleset = ImpactRuleset::v1();
        let window = must_ok(window_for(ACTION_DATE, Horizon::D14, &ruleset));

        assert_eq!(
            maturity_status(&window, None, &ruleset),
            MaturityStatus::NoData
        );
        assert_eq!(
            maturity_status(&window, Some(ACTION_DATE + Duration::days(4)), &ruleset),
            MaturityStatus::InWindow {
                days_elapsed: 5,
                horizon_days: 14
            }
        );
        assert_eq!(
            maturity_status(&window, Some(ACTION_DATE + Duration::days(15)), &ruleset),
            MaturityStatus::Pending {
                days_until_mature: 2
            }
        );
        assert_eq!(
            maturity_status(&window, Some(ACTION_DATE + Duration::days(17)), &ruleset),
            MaturityStatus::Measured
        );
        assert_eq!(
            maturity_status(&window, Some(ACTION_DATE - Duration::days(3)), &ruleset),
            MaturityStatus::InWindow {
                days_elapsed: 0,
                horizon_days: 14
            }
        );
    }

    #[test]
    fn scale_factor_matches_window_lengths() {
        let mut ruleset = ImpactRuleset::v1();
        assert_eq!(before_scale_factor(Horizon::D14, &ruleset), 1.0);
        assert_eq!(before_scale_factor(Horizon::D60, &ruleset), 60.0 / 14.0);

        ruleset.normalize_window_lengths = false;
        assert_eq!(before_scale_factor(Horizon::D60, &ruleset), 1.0);
    }

    #[test]
    fn pending_label_reports_remaining_days() {
        assert_eq!(
            MaturityStatus::Pending {
                days_until_mature: 2
            }
            .label(),
            "Pending (2d)"
        );
    }
}
