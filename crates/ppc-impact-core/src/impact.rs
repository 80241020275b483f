//! Counterfactual decision impact per action, the 2x2 decision-outcome
//! quadrant, and duplicate attribution detection.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::baseline::{Baseline, SpcSource};
use crate::validation::{
    MarketTag, ObservedWindows, ValidationOutcome, ValidationResult, ValidationStatus,
};
use crate::window::MaturityStatus;
use crate::{Action, ActionId, ActionType, Horizon, ImpactRuleset};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ImpactTier {
    /// Too few before clicks, or no counterfactual at all.
    Excluded,
    Directional,
    Validated,
}

impl ImpactTier {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Excluded => "excluded",
            Self::Directional => "directional",
            Self::Validated => "validated",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "excluded" => Some(Self::Excluded),
            "directional" => Some(Self::Directional),
            "validated" => Some(Self::Validated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Quadrant {
    OffensiveWin,
    DefensiveWin,
    DecisionGap,
    MarketDrag,
}

impl Quadrant {
    pub const ALL: [Self; 4] = [
        Self::OffensiveWin,
        Self::DefensiveWin,
        Self::DecisionGap,
        Self::MarketDrag,
    ];

    /// `expected_trend_pct` is the market context, `vs_expectation_pct` the
    /// decision's result relative to it.
    #[must_use]
    pub fn classify(expected_trend_pct: f64, vs_expectation_pct: f64) -> Self {
        match (expected_trend_pct >= 0.0, vs_expectation_pct >= 0.0) {
            (true, true) => Self::OffensiveWin,
            (false, true) => Self::DefensiveWin,
            (true, false) => Self::DecisionGap,
            (false, false) => Self::MarketDrag,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OffensiveWin => "offensive_win",
            Self::DefensiveWin => "defensive_win",
            Self::DecisionGap => "decision_gap",
            Self::MarketDrag => "market_drag",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|quadrant| quadrant.as_str() == value)
    }

    #[must_use]
    pub fn is_win(self) -> bool {
        matches!(self, Self::OffensiveWin | Self::DefensiveWin)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImpactRecord {
    pub action_id: ActionId,
    pub horizon: Horizon,
    pub action_type: ActionType,
    pub campaign_name: String,
    pub status: ValidationStatus,
    pub outcome: ValidationOutcome,
    pub market_tag: MarketTag,
    pub maturity: MaturityStatus,
    pub is_mature: bool,
    pub before_clicks: f64,
    pub before_spend: f64,
    pub before_sales: f64,
    pub after_clicks: f64,
    pub after_spend: f64,
    pub after_sales: f64,
    pub expected_clicks: Option<f64>,
    pub expected_sales: Option<f64>,
    pub decision_impact: f64,
    pub confidence_weight: f64,
    pub final_decision_impact: f64,
    pub tier: ImpactTier,
    pub expected_trend_pct: Option<f64>,
    pub actual_change_pct: Option<f64>,
    pub vs_expectation_pct: Option<f64>,
    /// `None` when no counterfactual could be built.
    pub quadrant: Option<Quadrant>,
    pub capital_protected: f64,
    pub spc_source: SpcSource,
    /// Earlier ledger entry this record repeats; duplicates are never counted.
    pub duplicate_of: Option<ActionId>,
}

impl ImpactRecord {
    #[must_use]
    pub fn is_market_drag(&self) -> bool {
        self.quadrant == Some(Quadrant::MarketDrag)
    }

    #[must_use]
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey::new(
            &self.campaign_name,
            self.action_type,
            self.before_spend,
            self.before_sales,
        )
    }
}

/// `min(1, before_clicks / divisor)`.
#[must_use]
pub fn confidence_weight(before_clicks: f64, ruleset: &ImpactRuleset) -> f64 {
    (before_clicks.max(0.0) / ruleset.confidence_click_divisor).min(1.0)
}

#[must_use]
pub fn impact_tier(before_clicks: f64, ruleset: &ImpactRuleset) -> ImpactTier {
    if before_clicks < ruleset.min_clicks_for_impact {
        ImpactTier::Excluded
    } else if before_clicks < ruleset.confidence_click_divisor {
        ImpactTier::Directional
    } else {
        ImpactTier::Validated
    }
}

struct Counterfactual {
    expected_clicks: f64,
    expected_sales: f64,
}

fn counterfactual(observed: &ObservedWindows, baseline: &Baseline) -> Option<Counterfactual> {
    if observed.before.spend <= 0.0 {
        return None;
    }
    let before_cpc = observed.before.cpc().filter(|cpc| *cpc > 0.0)?;
    let spc = baseline.spc?;
    let expected_clicks = observed.after.spend / before_cpc;
    Some(Counterfactual {
        expected_clicks,
        expected_sales: expected_clicks * spc,
    })
}

fn pct_change(from: f64, to: f64) -> f64 {
    if from > 0.0 {
        (to - from) / from * 100.0
    } else {
        0.0
    }
}

/// Computes the counterfactual-adjusted impact of one action for one horizon.
///
/// The counterfactual keeps the before-window CPC and the baseline SPC at the
/// new spend level. Actions without one (no before clicks or spend, or a null
/// baseline) get zero impact, tier `Excluded` and no quadrant. So do actions
/// whose status defers attribution to another action.
#[must_use]
pub fn compute_impact(
    action: &Action,
    observed: Option<&ObservedWindows>,
    baseline: &Baseline,
    validation: &ValidationResult,
    maturity: MaturityStatus,
    ruleset: &ImpactRuleset,
) -> ImpactRecord {
    let observed = observed.copied().unwrap_or_default();
    let before = observed.before;
    let after = observed.after;

    let scenario = if validation.status.defers_attribution() {
        None
    } else {
        counterfactual(&observed, baseline)
    };
    let (expected_clicks, expected_sales, decision_impact, tier) =
        match scenario {
            Some(cf) => (
                Some(cf.expected_clicks),
                Some(cf.expected_sales),
                after.sales - cf.expected_sales,
                impact_tier(observed.before_clicks_observed, ruleset),
            ),
            None => (None, None, 0.0, ImpactTier::Excluded),
        };

    let confidence_weight = confidence_weight(observed.before_clicks_observed, ruleset);
    let final_decision_impact = decision_impact * confidence_weight;

    let (expected_trend_pct, actual_change_pct, vs_expectation_pct, quadrant) =
        match expected_sales {
            Some(expected) => {
                let trend = pct_change(before.sales, expected);
                let actual = pct_change(before.sales, after.sales);
                let vs = actual - trend;
                (
                    Some(trend),
                    Some(actual),
                    Some(vs),
                    Some(Quadrant::classify(trend, vs)),
                )
            }
            None => (None, None, None, None),
        };

    let capital_protected = if action.action_type.is_negative()
        && after.spend <= 0.0
        && validation.status == ValidationStatus::SpendEliminated
    {
        before.spend
    } else {
        0.0
    };

    ImpactRecord {
        action_id: action.action_id,
        horizon: validation.horizon,
        action_type: action.action_type,
        campaign_name: action.campaign_name.clone(),
        status: validation.status,
        outcome: validation.outcome,
        market_tag: validation.market_tag,
        maturity,
        is_mature: maturity.is_measured(),
        before_clicks: observed.before_clicks_observed,
        before_spend: before.spend,
        before_sales: before.sales,
        after_clicks: after.clicks,
        after_spend: after.spend,
        after_sales: after.sales,
        expected_clicks,
        expected_sales,
        decision_impact,
        confidence_weight,
        final_decision_impact,
        tier,
        expected_trend_pct,
        actual_change_pct,
        vs_expectation_pct,
        quadrant,
        capital_protected,
        spc_source: baseline.spc_source,
        duplicate_of: None,
    }
}

/// Identity of the underlying effect an action claims, with money rounded to
/// cents.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct DedupKey {
    pub campaign: String,
    pub action_type: ActionType,
    pub before_spend_cents: i64,
    pub before_sales_cents: i64,
}

impl DedupKey {
    #[must_use]
    pub fn new(campaign: &str, action_type: ActionType, before_spend: f64, before_sales: f64) -> Self {
        Self {
            campaign: campaign.trim().to_lowercase(),
            action_type,
            before_spend_cents: to_cents(before_spend),
            before_sales_cents: to_cents(before_sales),
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn to_cents(value: f64) -> i64 {
    (value * 100.0).round() as i64
}

/// Flags later ledger entries that repeat an earlier entry's effect.
///
/// `records` MUST be in ledger order; the first record per key is kept.
/// Records with no before spend carry no attributable effect and are skipped.
/// Returns the number of records marked.
pub fn mark_duplicates<'a>(records: impl IntoIterator<Item = &'a mut ImpactRecord>) -> usize {
    let mut first_seen: HashMap<DedupKey, ActionId> = HashMap::new();
    let mut marked = 0;

    for record in records {
        record.duplicate_of = None;
        if record.before_spend <= 0.0 {
            continue;
        }
        match first_seen.get(&record.dedup_key()) {
            Some(original) => {
                record.duplicate_of = Some(*original);
                marked += 1;
            }
            None => {
                first_seen.insert(record.dedup_key(), record.action_id);
            }
        }
    }

    if marked > 0 {
        tracing::debug!(duplicates = marked, "marked duplicate attributions");
    }
    marked
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]

    use super::*;
    use crate::fixtures::fixture_action;
    use crate::metrics::MetricTotals;
    use crate::validation::validate;
    use crate::validation::AccountBaseline;
    use proptest::prelude::*;

    fn totals(clicks: f64, spend: f64, sales: f64) -> MetricTotals {
        MetricTotals {
            impressions: clicks * 40.0,
            clicks,
            spend,
            sales,
            orders: clicks / 10.0,
        }
    }

    fn baseline_with_spc(spc: Option<f64>) -> Baseline {
        Baseline {
            universal_median_roas: Some(3.0),
            rolling_30d_spc: spc,
            spc,
            spc_source: if spc.is_some() {
                SpcSource::Rolling30d
            } else {
                SpcSource::Unavailable
            },
            spc_capped: false,
        }
    }

    fn flat_account() -> AccountBaseline {
        AccountBaseline {
            before: totals(1_000.0, 2_000.0, 6_000.0),
            after: totals(1_000.0, 2_000.0, 6_000.0),
        }
    }

    fn evaluate(
        action_type: ActionType,
        observed: &ObservedWindows,
        baseline: &Baseline,
    ) -> ImpactRecord {
        let action = fixture_action(action_type);
        let ruleset = ImpactRuleset::v1();
        let validation = validate(
            &action,
            Horizon::D14,
            Some(observed),
            baseline,
            &flat_account(),
            &ruleset,
            None,
        );
        compute_impact(
            &action,
            Some(observed),
            baseline,
            &validation,
            MaturityStatus::Measured,
            &ruleset,
        )
    }

    #[test]
    fn sales_below_expectation_in_a_rising_market_is_a_decision_gap() {
        // Spend +20 % at constant CPC predicts +15 % sales; actual is +5 %.
        let observed =
            ObservedWindows::new(totals(250.0, 500.0, 1_000.0), totals(300.0, 600.0, 1_050.0));
        let record = evaluate(
            ActionType::BidIncrease,
            &observed,
            &baseline_with_spc(Some(1_150.0 / 300.0)),
        );

        let trend = record.expected_trend_pct.unwrap_or(f64::NAN);
        let vs = record.vs_expectation_pct.unwrap_or(f64::NAN);
        assert!((trend - 15.0).abs() < 1e-9);
        assert!((vs + 10.0).abs() < 1e-9);
        assert_eq!(record.quadrant, Some(Quadrant::DecisionGap));
        assert!((record.decision_impact + 100.0).abs() < 1e-9);
        assert_eq!(record.confidence_weight, 1.0);
        assert_eq!(record.tier, ImpactTier::Validated);
    }

    #[test]
    fn confirmed_negative_protects_its_before_spend() {
        let observed = ObservedWindows::new(totals(100.0, 200.0, 150.0), MetricTotals::default());
        let record = evaluate(
            ActionType::NegativePerformance,
            &observed,
            &baseline_with_spc(Some(1.5)),
        );

        assert_eq!(record.status, ValidationStatus::SpendEliminated);
        assert_eq!(record.capital_protected, 200.0);
        assert_eq!(record.expected_sales, Some(0.0));
        assert_eq!(record.decision_impact, 0.0);
        assert_eq!(record.quadrant, Some(Quadrant::DefensiveWin));
    }

    #[test]
    fn bid_increases_never_count_as_capital_protected() {
        let observed =
            ObservedWindows::new(totals(100.0, 100.0, 400.0), totals(100.0, 130.0, 450.0));
        let record = evaluate(ActionType::BidIncrease, &observed, &baseline_with_spc(Some(4.0)));
        assert_eq!(record.capital_protected, 0.0);
    }

    #[test]
    fn harvest_consolidation_negative_claims_no_impact() {
        let action = fixture_action(ActionType::NegativeIsolation);
        let mut harvest = fixture_action(ActionType::HarvestNew);
        harvest.action_id = ActionId::new();
        let ruleset = ImpactRuleset::v1();
        let observed = ObservedWindows::new(totals(100.0, 200.0, 300.0), MetricTotals::default());
        let baseline = baseline_with_spc(Some(3.0));
        let validation = validate(
            &action,
            Horizon::D14,
            Some(&observed),
            &baseline,
            &flat_account(),
            &ruleset,
            Some(&harvest),
        );
        let record = compute_impact(
            &action,
            Some(&observed),
            &baseline,
            &validation,
            MaturityStatus::Measured,
            &ruleset,
        );

        assert_eq!(record.status, ValidationStatus::HarvestConsolidation);
        assert_eq!(record.capital_protected, 0.0);
        assert_eq!(record.final_decision_impact, 0.0);
        assert_eq!(record.tier, ImpactTier::Excluded);
        assert_eq!(record.quadrant, None);
    }

    #[test]
    fn dormant_target_has_no_counterfactual() {
        let observed = ObservedWindows::default();
        let record = evaluate(ActionType::Pause, &observed, &baseline_with_spc(None));

        assert_eq!(record.status, ValidationStatus::DormantTarget);
        assert_eq!(record.tier, ImpactTier::Excluded);
        assert_eq!(record.quadrant, None);
        assert_eq!(record.final_decision_impact, 0.0);
    }

    #[test]
    fn tiers_follow_before_clicks() {
        let ruleset = ImpactRuleset::v1();
        assert_eq!(impact_tier(4.0, &ruleset), ImpactTier::Excluded);
        assert_eq!(impact_tier(5.0, &ruleset), ImpactTier::Directional);
        assert_eq!(impact_tier(14.0, &ruleset), ImpactTier::Directional);
        assert_eq!(impact_tier(15.0, &ruleset), ImpactTier::Validated);
        assert_eq!(confidence_weight(6.0, &ruleset), 0.4);
    }

    #[test]
    fn scaled_before_window_keeps_observed_click_weight() {
        let observed = ObservedWindows::with_scaled_before(
            totals(6.0, 12.0, 24.0),
            totals(30.0, 60.0, 120.0),
            60.0 / 14.0,
        );
        let record = evaluate(ActionType::BidIncrease, &observed, &baseline_with_spc(Some(4.0)));
        assert_eq!(record.before_clicks, 6.0);
        assert_eq!(record.confidence_weight, 0.4);
        assert_eq!(record.tier, ImpactTier::Directional);
    }

    #[test]
    fn quadrants_cover_all_sign_combinations() {
        assert_eq!(Quadrant::classify(0.0, 0.0), Quadrant::OffensiveWin);
        assert_eq!(Quadrant::classify(-1.0, 2.0), Quadrant::DefensiveWin);
        assert_eq!(Quadrant::classify(3.0, -0.5), Quadrant::DecisionGap);
        assert_eq!(Quadrant::classify(-3.0, -0.5), Quadrant::MarketDrag);
    }

    #[test]
    fn later_ledger_entry_with_same_effect_is_marked_duplicate() {
        let observed =
            ObservedWindows::new(totals(100.0, 200.004, 150.0), MetricTotals::default());
        let first = evaluate(
            ActionType::NegativeIsolation,
            &observed,
            &baseline_with_spc(Some(1.5)),
        );
        let mut second = first.clone();
        second.action_id = ActionId::new();
        second.campaign_name = "BRAND - EXACT".to_string();
        second.before_spend = 199.996;
        let mut third = first.clone();
        third.action_id = ActionId::new();
        third.action_type = ActionType::NegativePerformance;

        let mut records = vec![first.clone(), second, third];
        assert_eq!(mark_duplicates(&mut records), 1);
        assert_eq!(records[0].duplicate_of, None);
        assert_eq!(records[1].duplicate_of, Some(first.action_id));
        assert_eq!(records[2].duplicate_of, None);

        // Re-marking is stable.
        assert_eq!(mark_duplicates(&mut records), 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_confidence_weight_is_monotonic_and_capped(lhs in 0.0f64..200.0, rhs in 0.0f64..200.0) {
            let ruleset = ImpactRuleset::v1();
            let (low, high) = if lhs <= rhs { (lhs, rhs) } else { (rhs, lhs) };
            prop_assert!(confidence_weight(low, &ruleset) <= confidence_weight(high, &ruleset));
            prop_assert!(confidence_weight(high, &ruleset) <= 1.0);
            if high >= 15.0 {
                prop_assert_eq!(confidence_weight(high, &ruleset), 1.0);
            }
        }

        #[test]
        fn prop_impact_is_idempotent(
            before_clicks in 0u32..400,
            before_spend in 0.0f64..2_000.0,
            before_sales in 0.0f64..6_000.0,
            after_clicks in 0u32..400,
            after_spend in 0.0f64..2_000.0,
            after_sales in 0.0f64..6_000.0,
            spc in prop::option::of(0.1f64..20.0),
        ) {
            let observed = ObservedWindows::new(
                totals(f64::from(before_clicks), before_spend, before_sales),
                totals(f64::from(after_clicks), after_spend, after_sales),
            );
            let baseline = baseline_with_spc(spc);
            let first = evaluate(ActionType::BidDecrease, &observed, &baseline);
            let second = evaluate(ActionType::BidDecrease, &observed, &baseline);

            let first_json = serde_json::to_string(&first).unwrap_or_default();
            let second_json = serde_json::to_string(&second).unwrap_or_default();
            prop_assert_eq!(first_json, second_json);
            prop_assert!(
                (first.final_decision_impact - first.decision_impact * first.confidence_weight).abs()
                    < 1e-9
            );
        }
    }
}
