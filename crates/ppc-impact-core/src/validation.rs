//! Classifies whether an action was actually implemented, using ordered
//! rule tables evaluated until the first match.

use serde::{Deserialize, Serialize};

use crate::baseline::Baseline;
use crate::metrics::MetricTotals;
use crate::{Action, ActionId, ActionType, Horizon, ImpactRuleset};

/// Slack for inclusive threshold comparisons on ratios.
const THRESHOLD_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ValidationOutcome {
    Confirmed,
    NotValidated,
    Inconclusive,
}

impl ValidationOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Confirmed => "confirmed",
            Self::NotValidated => "not_validated",
            Self::Inconclusive => "inconclusive",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "confirmed" => Some(Self::Confirmed),
            "not_validated" => Some(Self::NotValidated),
            "inconclusive" => Some(Self::Inconclusive),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    SpendEliminated,
    NormalizedMatch,
    HarvestComplete,
    HarvestNearComplete,
    HarvestMigrated,
    HarvestPartial,
    CpcMatch,
    DirectionalMatch,
    VolumeMatch,
    CombinedMatch,
    HarvestConsolidation,
    SpendNotEliminated,
    SourceStillActive,
    NotValidated,
    NoTargetData,
    LowBaseline,
    DormantTarget,
    NoAfterData,
    PreventativeNegative,
    InvalidInput,
}

impl ValidationStatus {
    pub const ALL: [Self; 20] = [
        Self::SpendEliminated,
        Self::NormalizedMatch,
        Self::HarvestComplete,
        Self::HarvestNearComplete,
        Self::HarvestMigrated,
        Self::HarvestPartial,
        Self::CpcMatch,
        Self::DirectionalMatch,
        Self::VolumeMatch,
        Self::CombinedMatch,
        Self::HarvestConsolidation,
        Self::SpendNotEliminated,
        Self::SourceStillActive,
        Self::NotValidated,
        Self::NoTargetData,
        Self::LowBaseline,
        Self::DormantTarget,
        Self::NoAfterData,
        Self::PreventativeNegative,
        Self::InvalidInput,
    ];

    #[must_use]
    pub fn outcome(self) -> ValidationOutcome {
        match self {
            Self::SpendEliminated
            | Self::NormalizedMatch
            | Self::HarvestComplete
            | Self::HarvestNearComplete
            | Self::HarvestMigrated
            | Self::HarvestPartial
            | Self::CpcMatch
            | Self::DirectionalMatch
            | Self::VolumeMatch
            | Self::CombinedMatch
            | Self::HarvestConsolidation => ValidationOutcome::Confirmed,
            Self::SpendNotEliminated | Self::SourceStillActive | Self::NotValidated => {
                ValidationOutcome::NotValidated
            }
            Self::NoTargetData
            | Self::LowBaseline
            | Self::DormantTarget
            | Self::NoAfterData
            | Self::PreventativeNegative
            | Self::InvalidInput => ValidationOutcome::Inconclusive,
        }
    }

    #[must_use]
    pub fn is_confirmed(self) -> bool {
        self.outcome() == ValidationOutcome::Confirmed
    }

    /// Statuses whose action claims no impact of its own: a negative with
    /// no spend to save, or one whose value is attributed to its harvest.
    #[must_use]
    pub fn defers_attribution(self) -> bool {
        matches!(self, Self::HarvestConsolidation | Self::PreventativeNegative)
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::SpendEliminated => "Confirmed: Spend Eliminated",
            Self::NormalizedMatch => "Confirmed: Normalized match",
            Self::HarvestComplete => "Confirmed: Harvest complete",
            Self::HarvestNearComplete => "Confirmed: 90%+ blocked",
            Self::HarvestMigrated => "Confirmed: Migrated",
            Self::HarvestPartial => "Confirmed: Partial migration",
            Self::CpcMatch => "Confirmed: CPC match",
            Self::DirectionalMatch => "Confirmed: Directional match",
            Self::VolumeMatch => "Confirmed: Volume match",
            Self::CombinedMatch => "Confirmed: Directional + Volume",
            Self::HarvestConsolidation => "Confirmed: Part of harvest consolidation",
            Self::SpendNotEliminated => "Not validated: Spend not eliminated",
            Self::SourceStillActive => "Not validated: Source still active",
            Self::NotValidated => "Not validated",
            Self::NoTargetData => "Inconclusive: Unverified (no target data)",
            Self::LowBaseline => "Inconclusive: Unverified (low baseline)",
            Self::DormantTarget => "Inconclusive: Dormant target",
            Self::NoAfterData => "Inconclusive: No after data",
            Self::PreventativeNegative => "Inconclusive: Preventative - no spend to save",
            Self::InvalidInput => "Inconclusive: Invalid input",
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SpendEliminated => "spend_eliminated",
            Self::NormalizedMatch => "normalized_match",
            Self::HarvestComplete => "harvest_complete",
            Self::HarvestNearComplete => "harvest_near_complete",
            Self::HarvestMigrated => "harvest_migrated",
            Self::HarvestPartial => "harvest_partial",
            Self::CpcMatch => "cpc_match",
            Self::DirectionalMatch => "directional_match",
            Self::VolumeMatch => "volume_match",
            Self::CombinedMatch => "combined_match",
            Self::HarvestConsolidation => "harvest_consolidation",
            Self::SpendNotEliminated => "spend_not_eliminated",
            Self::SourceStillActive => "source_still_active",
            Self::NotValidated => "not_validated",
            Self::NoTargetData => "no_target_data",
            Self::LowBaseline => "low_baseline",
            Self::DormantTarget => "dormant_target",
            Self::NoAfterData => "no_after_data",
            Self::PreventativeNegative => "preventative_negative",
            Self::InvalidInput => "invalid_input",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == value)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MarketTag {
    Normal,
    MarketDownshift,
    LowData,
}

impl MarketTag {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::MarketDownshift => "market_downshift",
            Self::LowData => "low_data",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "normal" => Some(Self::Normal),
            "market_downshift" => Some(Self::MarketDownshift),
            "low_data" => Some(Self::LowData),
            _ => None,
        }
    }
}

/// Target totals for the before (already length-normalized) and after windows.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ObservedWindows {
    pub before: MetricTotals,
    pub after: MetricTotals,
    /// Clicks actually observed in the before window, before any scaling.
    pub before_clicks_observed: f64,
}

impl ObservedWindows {
    #[must_use]
    pub fn new(before: MetricTotals, after: MetricTotals) -> Self {
        Self {
            before,
            after,
            before_clicks_observed: before.clicks,
        }
    }

    /// Scales raw before totals by `factor` so both windows cover the same
    /// number of days.
    #[must_use]
    pub fn with_scaled_before(raw_before: MetricTotals, after: MetricTotals, factor: f64) -> Self {
        Self {
            before: raw_before.scaled(factor),
            after,
            before_clicks_observed: raw_before.clicks,
        }
    }
}

/// Account-wide totals over the same before/after windows as the action.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct AccountBaseline {
    pub before: MetricTotals,
    pub after: MetricTotals,
}

impl AccountBaseline {
    /// after/before spend; 1.0 when the account had no before spend.
    #[must_use]
    pub fn spend_ratio(&self) -> f64 {
        if self.before.spend > 0.0 {
            self.after.spend / self.before.spend
        } else {
            1.0
        }
    }

    #[must_use]
    pub fn roas_change(&self) -> Option<f64> {
        relative_change(self.before.roas(), self.after.roas())
    }

    #[must_use]
    pub fn is_downshift(&self, ruleset: &ImpactRuleset) -> bool {
        let decline = ruleset.market_downshift_decline;
        let spend_down = self.spend_ratio() - 1.0 <= -decline + THRESHOLD_EPSILON;
        let roas_down = self
            .roas_change()
            .is_some_and(|change| change <= -decline + THRESHOLD_EPSILON);
        spend_down || roas_down
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationResult {
    pub action_id: ActionId,
    pub horizon: Horizon,
    pub status: ValidationStatus,
    pub outcome: ValidationOutcome,
    pub market_tag: MarketTag,
    /// Target ROAS change beat the account's. Corroboration only.
    pub baseline_beat: bool,
    pub reason_codes: Vec<String>,
}

type Predicate = fn(&RuleContext<'_>) -> bool;

struct Rule {
    when: Predicate,
    status: ValidationStatus,
    reason: &'static str,
}

struct RuleContext<'a> {
    action: &'a Action,
    before: &'a MetricTotals,
    after: &'a MetricTotals,
    baseline: &'a Baseline,
    account: &'a AccountBaseline,
    ruleset: &'a ImpactRuleset,
    linked_harvest: Option<&'a Action>,
}

const GUARD_RULES: &[Rule] = &[
    Rule {
        when: is_preventative_negative,
        status: ValidationStatus::PreventativeNegative,
        reason: "inconclusive.negative.preventative",
    },
    Rule {
        when: is_dormant,
        status: ValidationStatus::DormantTarget,
        reason: "inconclusive.dormant_target",
    },
    Rule {
        when: is_low_baseline,
        status: ValidationStatus::LowBaseline,
        reason: "inconclusive.low_baseline",
    },
];

const NEGATIVE_RULES: &[Rule] = &[
    Rule {
        when: spend_eliminated,
        status: ValidationStatus::SpendEliminated,
        reason: "confirmed.negative.spend_eliminated",
    },
    Rule {
        when: normalized_match,
        status: ValidationStatus::NormalizedMatch,
        reason: "confirmed.negative.normalized_match",
    },
    Rule {
        when: always,
        status: ValidationStatus::SpendNotEliminated,
        reason: "not_validated.negative.spend_remaining",
    },
];

/// Isolation negative logged alongside a harvest of the same source: it is
/// implemented once the source has migrated as far as a partial harvest.
const CONSOLIDATION_RULES: &[Rule] = &[
    Rule {
        when: source_partial,
        status: ValidationStatus::HarvestConsolidation,
        reason: "confirmed.negative.harvest_consolidation",
    },
    Rule {
        when: always,
        status: ValidationStatus::SourceStillActive,
        reason: "not_validated.negative.harvest_source_active",
    },
];

const PAUSE_RULES: &[Rule] = &[
    Rule {
        when: spend_eliminated,
        status: ValidationStatus::SpendEliminated,
        reason: "confirmed.pause.spend_eliminated",
    },
    Rule {
        when: always,
        status: ValidationStatus::SpendNotEliminated,
        reason: "not_validated.pause.spend_remaining",
    },
];

const HARVEST_RULES: &[Rule] = &[
    Rule {
        when: spend_eliminated,
        status: ValidationStatus::HarvestComplete,
        reason: "confirmed.harvest.complete",
    },
    Rule {
        when: source_near_complete,
        status: ValidationStatus::HarvestNearComplete,
        reason: "confirmed.harvest.near_complete",
    },
    Rule {
        when: source_migrated,
        status: ValidationStatus::HarvestMigrated,
        reason: "confirmed.harvest.migrated",
    },
    Rule {
        when: source_partial,
        status: ValidationStatus::HarvestPartial,
        reason: "confirmed.harvest.partial",
    },
    Rule {
        when: always,
        status: ValidationStatus::SourceStillActive,
        reason: "not_validated.harvest.source_active",
    },
];

const BID_RULES: &[Rule] = &[
    Rule {
        when: bid_down_eliminated_spend,
        status: ValidationStatus::SpendEliminated,
        reason: "confirmed.bid.spend_eliminated",
    },
    Rule {
        when: spend_eliminated,
        status: ValidationStatus::NoAfterData,
        reason: "inconclusive.bid.no_after_data",
    },
    Rule {
        when: cpc_match,
        status: ValidationStatus::CpcMatch,
        reason: "confirmed.bid.cpc_match",
    },
    Rule {
        when: directional_match,
        status: ValidationStatus::DirectionalMatch,
        reason: "confirmed.bid.directional_match",
    },
    Rule {
        when: volume_match,
        status: ValidationStatus::VolumeMatch,
        reason: "confirmed.bid.volume_match",
    },
    Rule {
        when: combined_match,
        status: ValidationStatus::CombinedMatch,
        reason: "confirmed.bid.combined_match",
    },
    Rule {
        when: always,
        status: ValidationStatus::NotValidated,
        reason: "not_validated.bid.no_layer_matched",
    },
];

fn rules_for(context: &RuleContext<'_>) -> &'static [Rule] {
    match context.action.action_type {
        ActionType::NegativeIsolation if context.linked_harvest.is_some() => CONSOLIDATION_RULES,
        ActionType::NegativeIsolation | ActionType::NegativePerformance => NEGATIVE_RULES,
        ActionType::Pause => PAUSE_RULES,
        ActionType::HarvestNew => HARVEST_RULES,
        ActionType::BidIncrease | ActionType::BidDecrease | ActionType::VisibilityBoost => {
            BID_RULES
        }
    }
}

/// Harvest an isolation negative belongs to: a `HARVEST_NEW` in the same
/// account and campaign logged on the same date. A harvest of the same
/// target wins over other harvests in the campaign.
#[must_use]
pub fn linked_harvest<'a>(action: &Action, candidates: &[&'a Action]) -> Option<&'a Action> {
    if action.action_type != ActionType::NegativeIsolation {
        return None;
    }
    let key = action.target_key();
    let mut same_campaign = candidates.iter().copied().filter(|candidate| {
        candidate.action_type == ActionType::HarvestNew
            && candidate.account_id == action.account_id
            && candidate.action_date == action.action_date
            && candidate.target_key().campaign == key.campaign
    });
    let first = same_campaign.next()?;
    if first.target_key() == key {
        return Some(first);
    }
    Some(
        same_campaign
            .find(|candidate| candidate.target_key() == key)
            .unwrap_or(first),
    )
}

/// Classifies one action for one horizon.
///
/// `observed` is `None` when no performance row matched the action's
/// target. `linked_harvest` is the harvest an isolation negative was logged
/// with, if any (see [`linked_harvest`]). Failures are reported as
/// inconclusive statuses, never errors, so one bad action cannot abort a
/// batch.
#[must_use]
pub fn validate(
    action: &Action,
    horizon: Horizon,
    observed: Option<&ObservedWindows>,
    baseline: &Baseline,
    account: &AccountBaseline,
    ruleset: &ImpactRuleset,
    linked_harvest: Option<&Action>,
) -> ValidationResult {
    let mut reason_codes = Vec::new();

    if let Err(err) = action.validate() {
        tracing::warn!(action_id = %action.action_id, error = %err, "action failed validation");
        reason_codes.push("inconclusive.invalid_action".to_string());
        return finish(
            action,
            horizon,
            ValidationStatus::InvalidInput,
            MarketTag::LowData,
            false,
            reason_codes,
        );
    }

    let Some(observed) = observed else {
        reason_codes.push("inconclusive.no_target_data".to_string());
        return finish(
            action,
            horizon,
            ValidationStatus::NoTargetData,
            MarketTag::LowData,
            false,
            reason_codes,
        );
    };

    if let Err(err) = observed
        .before
        .normalized()
        .and_then(|_| observed.after.normalized())
    {
        tracing::warn!(action_id = %action.action_id, error = %err, "invalid target metrics");
        reason_codes.push("inconclusive.invalid_metrics".to_string());
        return finish(
            action,
            horizon,
            ValidationStatus::InvalidInput,
            MarketTag::LowData,
            false,
            reason_codes,
        );
    }

    let context = RuleContext {
        action,
        before: &observed.before,
        after: &observed.after,
        baseline,
        account,
        ruleset,
        linked_harvest,
    };

    let (status, reason) = first_match(GUARD_RULES, &context)
        .or_else(|| first_match(rules_for(&context), &context))
        .unwrap_or((ValidationStatus::NotValidated, "not_validated.no_rule_matched"));
    reason_codes.push(reason.to_string());
    if let Some(harvest) = linked_harvest {
        reason_codes.push(format!("harvest_link.{}", harvest.action_id));
    }

    let baseline_beat = action.action_type.is_bid_change() && baseline_beat(&context);
    if baseline_beat {
        reason_codes.push("corroborated.baseline_beat".to_string());
    }

    let market_tag = market_tag(&observed.before, account, ruleset);
    reason_codes.push(format!("market.{}", market_tag.as_str()));

    tracing::debug!(
        action_id = %action.action_id,
        action_type = %action.action_type,
        %horizon,
        status = status.as_str(),
        market_tag = market_tag.as_str(),
        "action validated"
    );

    finish(
        action,
        horizon,
        status,
        market_tag,
        baseline_beat,
        reason_codes,
    )
}

fn first_match(rules: &[Rule], context: &RuleContext<'_>) -> Option<(ValidationStatus, &'static str)> {
    rules
        .iter()
        .find(|rule| (rule.when)(context))
        .map(|rule| (rule.status, rule.reason))
}

fn finish(
    action: &Action,
    horizon: Horizon,
    status: ValidationStatus,
    market_tag: MarketTag,
    baseline_beat: bool,
    reason_codes: Vec<String>,
) -> ValidationResult {
    ValidationResult {
        action_id: action.action_id,
        horizon,
        status,
        outcome: status.outcome(),
        market_tag,
        baseline_beat,
        reason_codes,
    }
}

/// `LowData` wins over every other tag.
#[must_use]
pub fn market_tag(
    before: &MetricTotals,
    account: &AccountBaseline,
    ruleset: &ImpactRuleset,
) -> MarketTag {
    if before.clicks <= 0.0 {
        MarketTag::LowData
    } else if account.is_downshift(ruleset) {
        MarketTag::MarketDownshift
    } else {
        MarketTag::Normal
    }
}

fn always(_: &RuleContext<'_>) -> bool {
    true
}

/// A negative on a target that drew clicks but no spend before the action.
fn is_preventative_negative(ctx: &RuleContext<'_>) -> bool {
    ctx.action.action_type.is_negative() && ctx.before.spend <= 0.0 && ctx.before.clicks > 0.0
}

fn is_dormant(ctx: &RuleContext<'_>) -> bool {
    !ctx.before.has_activity() && !ctx.after.has_activity()
}

fn is_low_baseline(ctx: &RuleContext<'_>) -> bool {
    ctx.before.spend < ctx.ruleset.min_baseline_spend || ctx.baseline.is_null()
}

fn spend_eliminated(ctx: &RuleContext<'_>) -> bool {
    ctx.after.spend <= 0.0
}

fn normalized_match(ctx: &RuleContext<'_>) -> bool {
    let target_ratio = ctx.after.spend / ctx.before.spend;
    let threshold = ctx.account.spend_ratio() - ctx.ruleset.normalized_match_margin;
    target_ratio <= threshold + THRESHOLD_EPSILON
}

fn source_share(ctx: &RuleContext<'_>) -> f64 {
    ctx.after.spend / ctx.before.spend
}

fn source_near_complete(ctx: &RuleContext<'_>) -> bool {
    source_share(ctx) <= ctx.ruleset.harvest_near_complete_share + THRESHOLD_EPSILON
}

fn source_migrated(ctx: &RuleContext<'_>) -> bool {
    source_share(ctx) <= ctx.ruleset.harvest_migrated_share + THRESHOLD_EPSILON
}

fn source_partial(ctx: &RuleContext<'_>) -> bool {
    source_share(ctx) <= ctx.ruleset.harvest_partial_share + THRESHOLD_EPSILON
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum BidDirection {
    Up,
    Down,
}

fn bid_direction(action_type: ActionType) -> BidDirection {
    if action_type == ActionType::BidDecrease {
        BidDirection::Down
    } else {
        BidDirection::Up
    }
}

fn bid_down_eliminated_spend(ctx: &RuleContext<'_>) -> bool {
    bid_direction(ctx.action.action_type) == BidDirection::Down && spend_eliminated(ctx)
}

fn cpc_match(ctx: &RuleContext<'_>) -> bool {
    let (Some(after_cpc), Some(suggested)) = (ctx.after.cpc(), ctx.action.new_value) else {
        return false;
    };
    if suggested <= 0.0 {
        return false;
    }
    (after_cpc - suggested).abs() / suggested <= ctx.ruleset.cpc_match_tolerance + THRESHOLD_EPSILON
}

fn directional_match(ctx: &RuleContext<'_>) -> bool {
    let (Some(before_cpc), Some(after_cpc)) = (ctx.before.cpc(), ctx.after.cpc()) else {
        return false;
    };
    let Some(change) = relative_change(before_cpc, after_cpc) else {
        return false;
    };
    let threshold = ctx.ruleset.cpc_directional_threshold;
    match bid_direction(ctx.action.action_type) {
        BidDirection::Up => change > threshold,
        BidDirection::Down => change < -threshold,
    }
}

fn volume_match(ctx: &RuleContext<'_>) -> bool {
    let Some(change) = relative_change(ctx.before.clicks, ctx.after.clicks) else {
        return false;
    };
    match bid_direction(ctx.action.action_type) {
        BidDirection::Up => change >= ctx.ruleset.volume_increase_threshold - THRESHOLD_EPSILON,
        BidDirection::Down => change <= -ctx.ruleset.volume_decrease_threshold + THRESHOLD_EPSILON,
    }
}

/// Both weaker signals agree with the bid direction, each past
/// `combined_signal_fraction` of its own threshold.
fn combined_match(ctx: &RuleContext<'_>) -> bool {
    let (Some(before_cpc), Some(after_cpc)) = (ctx.before.cpc(), ctx.after.cpc()) else {
        return false;
    };
    let (Some(cpc_change), Some(click_change)) = (
        relative_change(before_cpc, after_cpc),
        relative_change(ctx.before.clicks, ctx.after.clicks),
    ) else {
        return false;
    };
    let fraction = ctx.ruleset.combined_signal_fraction;
    let cpc_threshold = ctx.ruleset.cpc_directional_threshold * fraction;
    match bid_direction(ctx.action.action_type) {
        BidDirection::Up => {
            cpc_change > cpc_threshold
                && click_change >= ctx.ruleset.volume_increase_threshold * fraction - THRESHOLD_EPSILON
        }
        BidDirection::Down => {
            cpc_change < -cpc_threshold
                && click_change <= -ctx.ruleset.volume_decrease_threshold * fraction + THRESHOLD_EPSILON
        }
    }
}

fn baseline_beat(ctx: &RuleContext<'_>) -> bool {
    let target = relative_change(ctx.before.roas(), ctx.after.roas());
    match (target, ctx.account.roas_change()) {
        (Some(target), Some(account)) => target > account,
        _ => false,
    }
}

fn relative_change(before: f64, after: f64) -> Option<f64> {
    (before > 0.0).then(|| after / before - 1.0)
}
