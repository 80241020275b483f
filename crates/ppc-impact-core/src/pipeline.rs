//! Evaluates every ledger action of one account for one horizon.
//!
//! Actions are independent of one another, so they are evaluated in parallel
//! when the `rayon` feature is enabled. Output order is ledger order either
//! way.

use std::collections::BTreeMap;

#[cfg(feature = "rayon")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use time::Date;

use crate::baseline::{low_sample_spc_cap, universal_median_roas, Baseline};
use crate::impact::{compute_impact, mark_duplicates, ImpactRecord};
use crate::metrics::MetricTotals;
use crate::report::{build_summary, ImpactSummary};
use crate::validation::{
    linked_harvest, validate, AccountBaseline, ObservedWindows, ValidationResult,
};
use crate::window::{before_scale_factor, maturity_status, window_for, MeasurementWindow};
use crate::{Action, ActionId, Horizon, ImpactError, ImpactRuleset, PerformanceRow, TargetKey};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionEvaluation {
    pub action_id: ActionId,
    pub action_seq: i64,
    pub window: MeasurementWindow,
    pub baseline: Baseline,
    pub validation: ValidationResult,
    pub impact: ImpactRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccountEvaluation {
    pub account_id: String,
    pub horizon: Horizon,
    pub ruleset_version: u32,
    pub latest_data_date: Option<Date>,
    pub universal_median_roas: Option<f64>,
    pub evaluations: Vec<ActionEvaluation>,
    pub summary: ImpactSummary,
}

struct AccountIndex<'a> {
    account_rows: Vec<&'a PerformanceRow>,
    by_target: BTreeMap<TargetKey, Vec<&'a PerformanceRow>>,
    latest_data_date: Option<Date>,
    universal_median_roas: Option<f64>,
    /// Ceiling for SPCs of targets with too few before clicks.
    spc_cap: f64,
}

impl<'a> AccountIndex<'a> {
    fn build(account_id: &str, rows: &'a [PerformanceRow], ruleset: &ImpactRuleset) -> Self {
        let account_rows = rows
            .iter()
            .filter(|row| row.account_id == account_id)
            .collect::<Vec<_>>();

        let mut by_target: BTreeMap<TargetKey, Vec<&'a PerformanceRow>> = BTreeMap::new();
        for row in &account_rows {
            by_target.entry(row.target_key()).or_default().push(*row);
        }

        let universal_median_roas =
            match universal_median_roas(account_rows.iter().copied(), ruleset) {
                Ok(value) => Some(value),
                Err(err) => {
                    tracing::debug!(account_id, error = %err, "universal median ROAS unavailable");
                    None
                }
            };

        let spc_cap = low_sample_spc_cap(account_rows.iter().copied(), ruleset);

        Self {
            latest_data_date: account_rows.iter().map(|row| row.report_date).max(),
            spc_cap,
            account_rows,
            by_target,
            universal_median_roas,
        }
    }

    fn totals_between(rows: &[&PerformanceRow], start: Date, end: Date) -> MetricTotals {
        MetricTotals::sum(
            rows.iter()
                .copied()
                .filter(|row| row.report_date >= start && row.report_date < end),
        )
    }
}

/// Evaluates all of an account's actions for one horizon.
///
/// Rows and actions belonging to other accounts are ignored. A single
/// unusable action is reported as an inconclusive evaluation rather than
/// failing the batch.
///
/// # Errors
/// Returns [`ImpactError::Configuration`] when the ruleset is invalid.
pub fn evaluate_account(
    account_id: &str,
    horizon: Horizon,
    rows: &[PerformanceRow],
    actions: &[Action],
    ruleset: &ImpactRuleset,
) -> Result<AccountEvaluation, ImpactError> {
    ruleset.validate()?;

    let mut account_actions = actions
        .iter()
        .filter(|action| action.account_id == account_id)
        .collect::<Vec<_>>();
    account_actions.sort_by_key(|action| action.action_seq);

    let index = AccountIndex::build(account_id, rows, ruleset);

    tracing::info!(
        phase = "start",
        account_id,
        %horizon,
        actions = account_actions.len(),
        rows = index.account_rows.len(),
        "evaluating account"
    );

    #[cfg(feature = "rayon")]
    let mut evaluations = account_actions
        .par_iter()
        .map(|action| evaluate_action(action, &account_actions, horizon, &index, ruleset))
        .collect::<Vec<_>>();
    #[cfg(not(feature = "rayon"))]
    let mut evaluations = account_actions
        .iter()
        .map(|action| evaluate_action(action, &account_actions, horizon, &index, ruleset))
        .collect::<Vec<_>>();

    mark_duplicates(evaluations.iter_mut().map(|evaluation| &mut evaluation.impact));

    let records = evaluations
        .iter()
        .map(|evaluation| evaluation.impact.clone())
        .collect::<Vec<_>>();
    let summary = build_summary(
        account_id,
        horizon,
        index.latest_data_date,
        index.universal_median_roas,
        &records,
        ruleset,
    );

    tracing::info!(
        phase = "finish",
        account_id,
        %horizon,
        evaluations = evaluations.len(),
        pending = summary.pending_count,
        "account evaluated"
    );

    Ok(AccountEvaluation {
        account_id: account_id.to_string(),
        horizon,
        ruleset_version: ruleset.ruleset_version,
        latest_data_date: index.latest_data_date,
        universal_median_roas: index.universal_median_roas,
        evaluations,
        summary,
    })
}

fn evaluate_action(
    action: &Action,
    account_actions: &[&Action],
    horizon: Horizon,
    index: &AccountIndex<'_>,
    ruleset: &ImpactRuleset,
) -> ActionEvaluation {
    let window = match window_for(action.action_date, horizon, ruleset) {
        Ok(window) => window,
        Err(err) => {
            tracing::warn!(action_id = %action.action_id, error = %err, "no measurement window");
            collapsed_window(action.action_date, horizon)
        }
    };

    let target_rows = index
        .by_target
        .get(&action.target_key())
        .map_or(&[][..], Vec::as_slice);
    let observed = observe_target(action, target_rows, &window, ruleset);
    if let Err(err) = &observed {
        tracing::debug!(action_id = %action.action_id, error = %err, "target not observed");
    }
    let observed = observed.ok();

    let scale = before_scale_factor(horizon, ruleset);
    let account = AccountBaseline {
        before: AccountIndex::totals_between(
            &index.account_rows,
            window.before_start,
            window.before_end,
        )
        .scaled(scale),
        after: AccountIndex::totals_between(
            &index.account_rows,
            window.after_start,
            window.after_end,
        ),
    };

    let window_local_spc =
        AccountIndex::totals_between(target_rows, window.before_start, window.before_end).spc();
    let baseline = Baseline::for_target(
        index.universal_median_roas,
        target_rows,
        window.after_end,
        window_local_spc,
        ruleset,
    )
    .with_low_sample_cap(
        observed
            .as_ref()
            .map_or(0.0, |observed| observed.before_clicks_observed),
        index.spc_cap,
        ruleset,
    );

    let maturity = maturity_status(&window, index.latest_data_date, ruleset);
    let validation = validate(
        action,
        horizon,
        observed.as_ref(),
        &baseline,
        &account,
        ruleset,
        linked_harvest(action, account_actions),
    );
    let impact = compute_impact(
        action,
        observed.as_ref(),
        &baseline,
        &validation,
        maturity,
        ruleset,
    );

    ActionEvaluation {
        action_id: action.action_id,
        action_seq: action.action_seq,
        window,
        baseline,
        validation,
        impact,
    }
}

fn observe_target(
    action: &Action,
    target_rows: &[&PerformanceRow],
    window: &MeasurementWindow,
    ruleset: &ImpactRuleset,
) -> Result<ObservedWindows, ImpactError> {
    if target_rows.is_empty() {
        return Err(ImpactError::MissingTargetData(format!(
            "no performance rows for campaign {:?} target {:?}",
            action.campaign_name, action.target_text
        )));
    }

    let raw_before =
        AccountIndex::totals_between(target_rows, window.before_start, window.before_end);
    let after = AccountIndex::totals_between(target_rows, window.after_start, window.after_end);
    Ok(ObservedWindows::with_scaled_before(
        raw_before,
        after,
        before_scale_factor(window.horizon, ruleset),
    ))
}

/// Zero-length window for an action whose dates cannot be represented.
fn collapsed_window(action_date: Date, horizon: Horizon) -> MeasurementWindow {
    MeasurementWindow {
        horizon,
        before_start: action_date,
        before_end: action_date,
        after_start: action_date,
        after_end: action_date,
    }
}
