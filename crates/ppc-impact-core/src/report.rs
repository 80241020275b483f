//! Account-level impact summary for the reporting surface.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::Date;

use crate::confidence::{
    aggregate_confidence, aggregate_spend_avoided_confidence, ConfidenceAssessment,
    ConfidenceLabel, SpendAvoidedConfidence,
};
use crate::impact::{ImpactRecord, ImpactTier, Quadrant};
use crate::validation::ValidationOutcome;
use crate::{ActionType, Horizon, ImpactRuleset};

pub const IMPACT_SUMMARY_CONTRACT_VERSION: &str = "impact_summary.v1";

/// Whether a record contributes to aggregate totals: mature, confirmed, with
/// enough before clicks, and not a duplicate. MarketDrag is filtered
/// separately so it stays visible in counts.
#[must_use]
pub fn is_counted(record: &ImpactRecord) -> bool {
    record.is_mature
        && record.outcome == ValidationOutcome::Confirmed
        && record.tier != ImpactTier::Excluded
        && record.duplicate_of.is_none()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionTypeBreakdown {
    pub action_type: ActionType,
    pub total: usize,
    pub confirmed: usize,
    pub counted: usize,
    pub attributed_impact: f64,
    pub capital_protected: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImpactSummary {
    pub contract_version: String,
    pub account_id: String,
    pub horizon: Horizon,
    pub ruleset_version: u32,
    pub latest_data_date: Option<Date>,
    pub decision_attributed_impact: f64,
    /// Wins over counted non-drag decisions, in percent.
    pub win_rate: f64,
    pub capital_protected: f64,
    pub confidence_label: ConfidenceLabel,
    pub pending_count: usize,
    pub total_actions: usize,
    pub confirmed_count: usize,
    pub not_validated_count: usize,
    pub inconclusive_count: usize,
    pub counted_count: usize,
    pub offensive_win_count: usize,
    pub defensive_win_count: usize,
    pub decision_gap_count: usize,
    pub market_drag_count: usize,
    /// Recorded for audit; never part of `decision_attributed_impact`.
    pub market_drag_excluded_impact: f64,
    pub duplicate_count: usize,
    pub implementation_rate: f64,
    pub incremental_revenue_pct: f64,
    pub universal_median_roas: Option<f64>,
    pub confidence: ConfidenceAssessment,
    pub spend_avoided: SpendAvoidedConfidence,
    pub by_action_type: Vec<ActionTypeBreakdown>,
    /// Built from cached records that predate the latest ledger entry or
    /// row import for the account.
    #[serde(default)]
    pub stale: bool,
}

/// Builds the summary for one account and horizon from evaluated records.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn build_summary(
    account_id: &str,
    horizon: Horizon,
    latest_data_date: Option<Date>,
    universal_median_roas: Option<f64>,
    records: &[ImpactRecord],
    ruleset: &ImpactRuleset,
) -> ImpactSummary {
    let mut confirmed_count = 0;
    let mut not_validated_count = 0;
    let mut inconclusive_count = 0;
    let mut pending_count = 0;
    let mut duplicate_count = 0;
    let mut capital_protected = 0.0;

    let mut counted_count = 0;
    let mut quadrant_counts: BTreeMap<Quadrant, usize> = BTreeMap::new();
    let mut decision_attributed_impact = 0.0;
    let mut market_drag_excluded_impact = 0.0;
    let mut counted_revenue_base = 0.0;

    let mut mature_confirmed = 0;
    let mut mature_decided = 0;

    let mut by_type: BTreeMap<ActionType, ActionTypeBreakdown> = BTreeMap::new();

    for record in records {
        let breakdown = by_type
            .entry(record.action_type)
            .or_insert_with(|| ActionTypeBreakdown {
                action_type: record.action_type,
                total: 0,
                confirmed: 0,
                counted: 0,
                attributed_impact: 0.0,
                capital_protected: 0.0,
            });
        breakdown.total += 1;

        if !record.is_mature {
            pending_count += 1;
            continue;
        }

        match record.outcome {
            ValidationOutcome::Confirmed => {
                confirmed_count += 1;
                breakdown.confirmed += 1;
            }
            ValidationOutcome::NotValidated => not_validated_count += 1,
            ValidationOutcome::Inconclusive => inconclusive_count += 1,
        }
        if record.outcome != ValidationOutcome::Inconclusive {
            mature_decided += 1;
            if record.outcome == ValidationOutcome::Confirmed {
                mature_confirmed += 1;
            }
        }

        if record.duplicate_of.is_some() {
            duplicate_count += 1;
            continue;
        }

        capital_protected += record.capital_protected;
        breakdown.capital_protected += record.capital_protected;

        if !is_counted(record) {
            continue;
        }
        counted_count += 1;
        breakdown.counted += 1;

        let Some(quadrant) = record.quadrant else {
            continue;
        };
        *quadrant_counts.entry(quadrant).or_insert(0) += 1;

        if quadrant == Quadrant::MarketDrag {
            market_drag_excluded_impact += record.final_decision_impact;
        } else {
            decision_attributed_impact += record.final_decision_impact;
            breakdown.attributed_impact += record.final_decision_impact;
            counted_revenue_base += record.before_sales + record.after_sales;
        }
    }

    let quadrant_count = |quadrant: Quadrant| quadrant_counts.get(&quadrant).copied().unwrap_or(0);
    let offensive_win_count = quadrant_count(Quadrant::OffensiveWin);
    let defensive_win_count = quadrant_count(Quadrant::DefensiveWin);
    let decision_gap_count = quadrant_count(Quadrant::DecisionGap);
    let market_drag_count = quadrant_count(Quadrant::MarketDrag);

    let decided = offensive_win_count + defensive_win_count + decision_gap_count;
    let win_rate = percent(
        (offensive_win_count + defensive_win_count) as f64,
        decided as f64,
    );
    let implementation_rate = percent(mature_confirmed as f64, mature_decided as f64);
    let incremental_revenue_pct = percent(decision_attributed_impact, counted_revenue_base);

    let confidence = aggregate_confidence(records, ruleset);
    let spend_avoided = aggregate_spend_avoided_confidence(records, ruleset);

    tracing::info!(
        account_id,
        %horizon,
        actions = records.len(),
        counted = counted_count,
        pending = pending_count,
        decision_attributed_impact,
        "impact summary built"
    );

    ImpactSummary {
        contract_version: IMPACT_SUMMARY_CONTRACT_VERSION.to_string(),
        account_id: account_id.to_string(),
        horizon,
        ruleset_version: ruleset.ruleset_version,
        latest_data_date,
        decision_attributed_impact,
        win_rate,
        capital_protected,
        confidence_label: confidence.label,
        pending_count,
        total_actions: records.len(),
        confirmed_count,
        not_validated_count,
        inconclusive_count,
        counted_count,
        offensive_win_count,
        defensive_win_count,
        decision_gap_count,
        market_drag_count,
        market_drag_excluded_impact,
        duplicate_count,
        implementation_rate,
        incremental_revenue_pct,
        universal_median_roas,
        confidence,
        spend_avoided,
        by_action_type: by_type.into_values().collect(),
        stale: false,
    }
}

fn percent(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator * 100.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]

    use super::*;
    use crate::fixtures::fixture_record;
    use crate::validation::ValidationStatus;
    use crate::window::MaturityStatus;
    use crate::ActionId;
    use proptest::prelude::*;

    fn summarize(records: &[ImpactRecord]) -> ImpactSummary {
        build_summary(
            "acct-1",
            Horizon::D14,
            None,
            Some(3.0),
            records,
            &ImpactRuleset::v1(),
        )
    }

    fn quadrant_from_code(code: u8) -> Quadrant {
        Quadrant::ALL[usize::from(code % 4)]
    }

    #[test]
    fn market_drag_is_reported_but_not_summed() {
        let records = vec![
            fixture_record(100.0, 1.0, Quadrant::OffensiveWin),
            fixture_record(40.0, 0.5, Quadrant::DefensiveWin),
            fixture_record(-30.0, 1.0, Quadrant::DecisionGap),
            fixture_record(-500.0, 1.0, Quadrant::MarketDrag),
        ];
        let summary = summarize(&records);

        assert_eq!(summary.decision_attributed_impact, 100.0 + 20.0 - 30.0);
        assert_eq!(summary.market_drag_excluded_impact, -500.0);
        assert_eq!(summary.market_drag_count, 1);
        assert_eq!(summary.counted_count, 4);
        assert!((summary.win_rate - 200.0 / 3.0).abs() < 1e-9);
        assert_eq!(summary.contract_version, "impact_summary.v1");
    }

    #[test]
    fn pending_actions_are_counted_separately_and_excluded() {
        let mut pending = fixture_record(1_000.0, 1.0, Quadrant::OffensiveWin);
        pending.is_mature = false;
        pending.maturity = MaturityStatus::Pending {
            days_until_mature: 2,
        };
        let records = vec![pending, fixture_record(10.0, 1.0, Quadrant::OffensiveWin)];
        let summary = summarize(&records);

        assert_eq!(summary.pending_count, 1);
        assert_eq!(summary.decision_attributed_impact, 10.0);
        assert_eq!(summary.total_actions, 2);
    }

    #[test]
    fn inconclusive_and_duplicate_records_stay_out_of_totals() {
        let mut dormant = fixture_record(0.0, 0.0, Quadrant::OffensiveWin);
        dormant.status = ValidationStatus::DormantTarget;
        dormant.outcome = ValidationOutcome::Inconclusive;
        dormant.tier = ImpactTier::Excluded;
        dormant.quadrant = None;

        let original = fixture_record(50.0, 1.0, Quadrant::OffensiveWin);
        let mut duplicate = original.clone();
        duplicate.action_id = ActionId::new();
        duplicate.duplicate_of = Some(original.action_id);

        let summary = summarize(&[dormant, original, duplicate]);
        assert_eq!(summary.inconclusive_count, 1);
        assert_eq!(summary.duplicate_count, 1);
        assert_eq!(summary.decision_attributed_impact, 50.0);
        assert_eq!(summary.counted_count, 1);
    }

    #[test]
    fn capital_protected_and_breakdown_follow_action_type() {
        let mut negative = fixture_record(0.0, 1.0, Quadrant::DefensiveWin);
        negative.action_type = ActionType::NegativePerformance;
        negative.status = ValidationStatus::SpendEliminated;
        negative.capital_protected = 200.0;

        let mut not_validated = fixture_record(80.0, 1.0, Quadrant::OffensiveWin);
        not_validated.status = ValidationStatus::NotValidated;
        not_validated.outcome = ValidationOutcome::NotValidated;

        let summary = summarize(&[negative, not_validated]);
        assert_eq!(summary.capital_protected, 200.0);
        assert_eq!(summary.implementation_rate, 50.0);
        assert_eq!(summary.by_action_type.len(), 2);

        let negatives = summary
            .by_action_type
            .iter()
            .find(|entry| entry.action_type == ActionType::NegativePerformance);
        assert!(negatives.is_some_and(|entry| entry.capital_protected == 200.0));
    }

    #[test]
    fn empty_account_summarizes_to_zero() {
        let summary = summarize(&[]);
        assert_eq!(summary.decision_attributed_impact, 0.0);
        assert_eq!(summary.win_rate, 0.0);
        assert_eq!(summary.confidence_label, ConfidenceLabel::Low);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_attributed_impact_excludes_market_drag(
            entries in prop::collection::vec((0u8..4, -1_000.0f64..1_000.0, 0.34f64..1.0), 1..40),
        ) {
            let records = entries
                .iter()
                .map(|(code, impact, weight)| fixture_record(*impact, *weight, quadrant_from_code(*code)))
                .collect::<Vec<_>>();
            let summary = summarize(&records);

            let expected = records
                .iter()
                .filter(|record| is_counted(record) && !record.is_market_drag())
                .map(|record| record.final_decision_impact)
                .fold(0.0, |acc, value| acc + value);
            prop_assert_eq!(summary.decision_attributed_impact, expected);

            let with_drag = records
                .iter()
                .filter(|record| is_counted(record))
                .map(|record| record.final_decision_impact)
                .fold(0.0, |acc, value| acc + value);
            if summary.market_drag_excluded_impact.abs() > 1e-6 {
                prop_assert!((with_drag - summary.decision_attributed_impact).abs() > 1e-9);
            }
        }
    }
}
