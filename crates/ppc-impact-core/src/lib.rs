//! Counterfactual decision-impact attribution for sponsored-ads optimization
//! actions.
//!
//! Everything in this crate is a pure function of performance rows, ledger
//! actions and an [`ImpactRuleset`]. Persistence lives in
//! `ppc-impact-store-sqlite`; this crate never performs I/O.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::macros::format_description;
use time::{Date, OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub mod baseline;
pub mod confidence;
pub mod impact;
pub mod metrics;
pub mod pipeline;
pub mod report;
pub mod validation;
pub mod window;

pub use baseline::{
    compute_baseline, low_sample_spc_cap, rolling_spc, universal_median_roas, Baseline, SpcSource,
};
pub use confidence::{
    aggregate_confidence, aggregate_spend_avoided_confidence, z_score_confidence,
    ConfidenceAssessment, ConfidenceLabel, SpendAvoidedConfidence, ZConfidence, ZConfidenceLabel,
};
pub use impact::{compute_impact, mark_duplicates, DedupKey, ImpactRecord, ImpactTier, Quadrant};
pub use metrics::{normalize, MetricTotals, NormalizedMetrics};
pub use pipeline::{evaluate_account, AccountEvaluation, ActionEvaluation};
pub use report::{build_summary, is_counted, ActionTypeBreakdown, ImpactSummary};
pub use validation::{
    linked_harvest, validate, AccountBaseline, MarketTag, ObservedWindows, ValidationOutcome,
    ValidationResult, ValidationStatus,
};
pub use window::{is_mature, maturity_status, window_for, MaturityStatus, MeasurementWindow};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ImpactError {
    #[error("invalid metric input: {0}")]
    InvalidMetricInput(String),
    #[error("insufficient history: {0}")]
    InsufficientHistory(String),
    #[error("missing target data: {0}")]
    MissingTargetData(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    BidIncrease,
    BidDecrease,
    VisibilityBoost,
    NegativeIsolation,
    NegativePerformance,
    HarvestNew,
    Pause,
}

impl ActionType {
    pub const ALL: [Self; 7] = [
        Self::BidIncrease,
        Self::BidDecrease,
        Self::VisibilityBoost,
        Self::NegativeIsolation,
        Self::NegativePerformance,
        Self::HarvestNew,
        Self::Pause,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BidIncrease => "BID_INCREASE",
            Self::BidDecrease => "BID_DECREASE",
            Self::VisibilityBoost => "VISIBILITY_BOOST",
            Self::NegativeIsolation => "NEGATIVE_ISOLATION",
            Self::NegativePerformance => "NEGATIVE_PERFORMANCE",
            Self::HarvestNew => "HARVEST_NEW",
            Self::Pause => "PAUSE",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "BID_INCREASE" => Some(Self::BidIncrease),
            "BID_DECREASE" => Some(Self::BidDecrease),
            "VISIBILITY_BOOST" => Some(Self::VisibilityBoost),
            "NEGATIVE_ISOLATION" => Some(Self::NegativeIsolation),
            "NEGATIVE_PERFORMANCE" => Some(Self::NegativePerformance),
            "HARVEST_NEW" => Some(Self::HarvestNew),
            "PAUSE" => Some(Self::Pause),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_negative(self) -> bool {
        matches!(self, Self::NegativeIsolation | Self::NegativePerformance)
    }

    #[must_use]
    pub fn is_bid_change(self) -> bool {
        matches!(
            self,
            Self::BidIncrease | Self::BidDecrease | Self::VisibilityBoost
        )
    }
}

impl Display for ActionType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Measurement horizon: the length of the after window in days.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Horizon {
    #[serde(rename = "14D")]
    D14,
    #[serde(rename = "30D")]
    D30,
    #[serde(rename = "60D")]
    D60,
}

impl Horizon {
    pub const ALL: [Self; 3] = [Self::D14, Self::D30, Self::D60];

    #[must_use]
    pub fn days(self) -> i64 {
        match self {
            Self::D14 => 14,
            Self::D30 => 30,
            Self::D60 => 60,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::D14 => "14D",
            Self::D30 => "30D",
            Self::D60 => "60D",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "14D" | "14" => Some(Self::D14),
            "30D" | "30" => Some(Self::D30),
            "60D" | "60" => Some(Self::D60),
            _ => None,
        }
    }
}

impl Display for Horizon {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ActionId(pub Ulid);

impl ActionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parses a ULID action identifier.
    ///
    /// # Errors
    /// Returns [`ImpactError::Validation`] when the value is not a valid ULID.
    pub fn parse(value: &str) -> Result<Self, ImpactError> {
        Ulid::from_string(value)
            .map(Self)
            .map_err(|err| ImpactError::Validation(format!("invalid action_id ULID {value}: {err}")))
    }
}

impl Default for ActionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ActionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One weekly performance fact for a (campaign, ad group, target).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerformanceRow {
    pub account_id: String,
    pub campaign_name: String,
    pub ad_group_name: String,
    pub target_text: String,
    pub match_type: String,
    pub report_date: Date,
    pub impressions: u64,
    pub clicks: u64,
    pub spend: f64,
    pub sales: f64,
    pub orders: u64,
}

impl PerformanceRow {
    /// Validates an ingested row before it is stored.
    ///
    /// # Errors
    /// Returns [`ImpactError::Validation`] for blank keys and
    /// [`ImpactError::InvalidMetricInput`] for negative or non-finite money
    /// columns.
    pub fn validate(&self) -> Result<(), ImpactError> {
        for (name, value) in [
            ("account_id", &self.account_id),
            ("campaign_name", &self.campaign_name),
            ("target_text", &self.target_text),
        ] {
            if value.trim().is_empty() {
                return Err(ImpactError::Validation(format!(
                    "{name} MUST be provided for every performance row"
                )));
            }
        }

        for (name, value) in [("spend", self.spend), ("sales", self.sales)] {
            if !value.is_finite() || value < 0.0 {
                return Err(ImpactError::InvalidMetricInput(format!(
                    "{name} MUST be a finite value >= 0, got {value}"
                )));
            }
        }

        Ok(())
    }

    #[must_use]
    pub fn target_key(&self) -> TargetKey {
        TargetKey::new(&self.campaign_name, &self.target_text)
    }
}

/// Case- and whitespace-insensitive join key between actions and rows.
///
/// The key is campaign plus target text only. Rows for the same target in
/// different ad groups of one campaign aggregate into a single observation,
/// since actions are logged per campaign and target.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TargetKey {
    pub campaign: String,
    pub target: String,
}

impl TargetKey {
    #[must_use]
    pub fn new(campaign_name: &str, target_text: &str) -> Self {
        Self {
            campaign: normalize_key_text(campaign_name),
            target: normalize_key_text(target_text),
        }
    }
}

fn normalize_key_text(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionInput {
    pub action_id: Option<ActionId>,
    pub account_id: String,
    pub action_type: ActionType,
    pub campaign_name: String,
    pub ad_group_name: String,
    pub target_text: String,
    pub match_type: String,
    pub old_value: Option<f64>,
    pub new_value: Option<f64>,
    pub action_date: Date,
    pub reason: String,
}

impl ActionInput {
    /// Validates an optimizer decision before it is appended to the ledger.
    ///
    /// # Errors
    /// Returns [`ImpactError::Validation`] when required fields are missing
    /// or values violate ledger constraints.
    pub fn validate(&self) -> Result<(), ImpactError> {
        validate_action_fields(
            &self.account_id,
            self.action_type,
            &self.campaign_name,
            &self.target_text,
            self.old_value,
            self.new_value,
        )
    }
}

/// A logged optimization decision. Never mutated once appended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Action {
    pub action_seq: i64,
    pub action_id: ActionId,
    pub account_id: String,
    pub action_type: ActionType,
    pub campaign_name: String,
    pub ad_group_name: String,
    pub target_text: String,
    pub match_type: String,
    pub old_value: Option<f64>,
    pub new_value: Option<f64>,
    pub action_date: Date,
    pub reason: String,
    pub recorded_at: OffsetDateTime,
}

impl Action {
    /// Re-checks ledger constraints on an action read back for evaluation.
    ///
    /// # Errors
    /// Returns [`ImpactError::Validation`] when the stored action is unusable.
    pub fn validate(&self) -> Result<(), ImpactError> {
        validate_action_fields(
            &self.account_id,
            self.action_type,
            &self.campaign_name,
            &self.target_text,
            self.old_value,
            self.new_value,
        )
    }

    #[must_use]
    pub fn target_key(&self) -> TargetKey {
        TargetKey::new(&self.campaign_name, &self.target_text)
    }
}

fn validate_action_fields(
    account_id: &str,
    action_type: ActionType,
    campaign_name: &str,
    target_text: &str,
    old_value: Option<f64>,
    new_value: Option<f64>,
) -> Result<(), ImpactError> {
    if account_id.trim().is_empty() {
        return Err(ImpactError::Validation(
            "account_id MUST be provided for every action".to_string(),
        ));
    }

    if campaign_name.trim().is_empty() {
        return Err(ImpactError::Validation(
            "campaign_name MUST be provided for every action".to_string(),
        ));
    }

    if target_text.trim().is_empty() {
        return Err(ImpactError::Validation(
            "target_text MUST be provided for every action".to_string(),
        ));
    }

    for (name, value) in [("old_value", old_value), ("new_value", new_value)] {
        if let Some(raw) = value {
            if !raw.is_finite() || raw < 0.0 {
                return Err(ImpactError::Validation(format!(
                    "{name} MUST be a finite value >= 0"
                )));
            }
        }
    }

    if action_type.is_bid_change() && !new_value.is_some_and(|bid| bid > 0.0) {
        return Err(ImpactError::Validation(format!(
            "{action_type} requires new_value > 0 (the suggested bid)"
        )));
    }

    Ok(())
}

/// Thresholds for every stage of the engine. Passed explicitly into each
/// computation; persisted per `ruleset_version`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImpactRuleset {
    pub ruleset_version: u32,
    pub before_window_days: u32,
    pub maturity_buffer_days: u32,
    pub noise_floor_spend: f64,
    pub winsor_percentile: f64,
    pub min_roas_sample: usize,
    pub rolling_spc_days: u32,
    pub min_spc_click_days: usize,
    pub min_baseline_spend: f64,
    pub normalized_match_margin: f64,
    pub harvest_near_complete_share: f64,
    pub harvest_migrated_share: f64,
    pub harvest_partial_share: f64,
    pub cpc_match_tolerance: f64,
    pub cpc_directional_threshold: f64,
    pub volume_increase_threshold: f64,
    pub volume_decrease_threshold: f64,
    pub confidence_click_divisor: f64,
    pub min_clicks_for_impact: f64,
    pub market_downshift_decline: f64,
    pub downshift_sigma_multiplier: f64,
    pub high_signal_ratio: f64,
    pub medium_signal_ratio: f64,
    pub min_validated_for_high: usize,
    pub downshift_downgrade_share: f64,
    pub z_confidence_cap_pct: f64,
    pub normalize_window_lengths: bool,
    pub spend_avoided_variance: f64,
    pub spend_avoided_variance_downshift: f64,
    pub spend_avoided_high_ratio: f64,
    pub spend_avoided_medium_ratio: f64,
    pub spend_avoided_min_high: usize,
    pub spend_avoided_downgrade_share: f64,
    #[serde(default = "default_combined_signal_fraction")]
    pub combined_signal_fraction: f64,
    #[serde(default = "default_spc_outlier_sigma")]
    pub spc_outlier_sigma: f64,
    #[serde(default = "default_spc_cap_min_targets")]
    pub spc_cap_min_targets: usize,
    #[serde(default = "default_low_sample_spc_cap")]
    pub low_sample_spc_cap: f64,
}

// Fields added after ruleset v1 was first persisted; stored payloads
// without them decode to the v1 values.
fn default_combined_signal_fraction() -> f64 {
    0.5
}

fn default_spc_outlier_sigma() -> f64 {
    2.0
}

fn default_spc_cap_min_targets() -> usize {
    4
}

fn default_low_sample_spc_cap() -> f64 {
    10.0
}

impl ImpactRuleset {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            ruleset_version: 1,
            before_window_days: 14,
            maturity_buffer_days: 3,
            noise_floor_spend: 5.0,
            winsor_percentile: 0.99,
            min_roas_sample: 10,
            rolling_spc_days: 30,
            min_spc_click_days: 2,
            min_baseline_spend: 5.0,
            normalized_match_margin: 0.50,
            harvest_near_complete_share: 0.10,
            harvest_migrated_share: 0.25,
            harvest_partial_share: 0.50,
            cpc_match_tolerance: 0.20,
            cpc_directional_threshold: 0.05,
            volume_increase_threshold: 0.20,
            volume_decrease_threshold: 0.15,
            confidence_click_divisor: 15.0,
            min_clicks_for_impact: 5.0,
            market_downshift_decline: 0.25,
            downshift_sigma_multiplier: 1.3,
            high_signal_ratio: 1.5,
            medium_signal_ratio: 0.8,
            min_validated_for_high: 30,
            downshift_downgrade_share: 0.40,
            z_confidence_cap_pct: 99.0,
            normalize_window_lengths: true,
            spend_avoided_variance: 0.15,
            spend_avoided_variance_downshift: 0.25,
            spend_avoided_high_ratio: 2.0,
            spend_avoided_medium_ratio: 1.0,
            spend_avoided_min_high: 10,
            spend_avoided_downgrade_share: 0.30,
            combined_signal_fraction: default_combined_signal_fraction(),
            spc_outlier_sigma: default_spc_outlier_sigma(),
            spc_cap_min_targets: default_spc_cap_min_targets(),
            low_sample_spc_cap: default_low_sample_spc_cap(),
        }
    }

    /// Validates ruleset numeric bounds and threshold ordering.
    ///
    /// # Errors
    /// Returns [`ImpactError::Configuration`] when one or more
    /// ruleset fields are outside allowed bounds.
    pub fn validate(&self) -> Result<(), ImpactError> {
        if self.ruleset_version == 0 {
            return Err(ImpactError::Configuration(
                "ruleset_version MUST be >= 1".to_string(),
            ));
        }

        if self.before_window_days == 0 || self.rolling_spc_days == 0 {
            return Err(ImpactError::Configuration(
                "window lengths MUST be >= 1 day".to_string(),
            ));
        }

        for (name, value) in [
            ("normalized_match_margin", self.normalized_match_margin),
            (
                "harvest_near_complete_share",
                self.harvest_near_complete_share,
            ),
            ("harvest_migrated_share", self.harvest_migrated_share),
            ("harvest_partial_share", self.harvest_partial_share),
            ("cpc_match_tolerance", self.cpc_match_tolerance),
            ("cpc_directional_threshold", self.cpc_directional_threshold),
            ("volume_increase_threshold", self.volume_increase_threshold),
            ("volume_decrease_threshold", self.volume_decrease_threshold),
            ("market_downshift_decline", self.market_downshift_decline),
            ("downshift_downgrade_share", self.downshift_downgrade_share),
            ("spend_avoided_variance", self.spend_avoided_variance),
            (
                "spend_avoided_variance_downshift",
                self.spend_avoided_variance_downshift,
            ),
            (
                "spend_avoided_downgrade_share",
                self.spend_avoided_downgrade_share,
            ),
            ("combined_signal_fraction", self.combined_signal_fraction),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ImpactError::Configuration(format!(
                    "{name} MUST be in [0.0, 1.0]"
                )));
            }
        }

        if !(self.winsor_percentile > 0.0 && self.winsor_percentile <= 1.0) {
            return Err(ImpactError::Configuration(
                "winsor_percentile MUST be in (0.0, 1.0]".to_string(),
            ));
        }

        for (name, value) in [
            ("noise_floor_spend", self.noise_floor_spend),
            ("min_baseline_spend", self.min_baseline_spend),
            ("min_clicks_for_impact", self.min_clicks_for_impact),
            ("medium_signal_ratio", self.medium_signal_ratio),
            ("spend_avoided_medium_ratio", self.spend_avoided_medium_ratio),
            ("spc_outlier_sigma", self.spc_outlier_sigma),
            ("low_sample_spc_cap", self.low_sample_spc_cap),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ImpactError::Configuration(format!(
                    "{name} MUST be a finite value >= 0"
                )));
            }
        }

        if !(self.confidence_click_divisor.is_finite() && self.confidence_click_divisor > 0.0) {
            return Err(ImpactError::Configuration(
                "confidence_click_divisor MUST be > 0".to_string(),
            ));
        }

        if !(self.downshift_sigma_multiplier.is_finite() && self.downshift_sigma_multiplier >= 1.0)
        {
            return Err(ImpactError::Configuration(
                "downshift_sigma_multiplier MUST be >= 1.0".to_string(),
            ));
        }

        if !(0.0..=100.0).contains(&self.z_confidence_cap_pct) {
            return Err(ImpactError::Configuration(
                "z_confidence_cap_pct MUST be in [0.0, 100.0]".to_string(),
            ));
        }

        if self.harvest_near_complete_share > self.harvest_migrated_share
            || self.harvest_migrated_share > self.harvest_partial_share
        {
            return Err(ImpactError::Configuration(
                "harvest shares MUST be ordered near_complete <= migrated <= partial".to_string(),
            ));
        }

        if self.medium_signal_ratio > self.high_signal_ratio
            || self.spend_avoided_medium_ratio > self.spend_avoided_high_ratio
        {
            return Err(ImpactError::Configuration(
                "medium signal ratio cannot exceed high signal ratio".to_string(),
            ));
        }

        if self.min_clicks_for_impact > self.confidence_click_divisor {
            return Err(ImpactError::Configuration(
                "min_clicks_for_impact MUST be <= confidence_click_divisor".to_string(),
            ));
        }

        Ok(())
    }

    /// Decodes and validates a ruleset from JSON.
    ///
    /// # Errors
    /// Returns [`ImpactError::Configuration`] when JSON decoding fails
    /// or decoded values violate ruleset constraints.
    pub fn from_json(value: &Value) -> Result<Self, ImpactError> {
        let ruleset: Self = serde_json::from_value(value.clone()).map_err(|err| {
            ImpactError::Configuration(format!("invalid ruleset JSON payload: {err}"))
        })?;
        ruleset.validate()?;
        Ok(ruleset)
    }
}

impl Default for ImpactRuleset {
    fn default() -> Self {
        Self::v1()
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`ImpactError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, ImpactError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| ImpactError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(ImpactError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`ImpactError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, ImpactError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            ImpactError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

/// Parses a `YYYY-MM-DD` calendar date.
///
/// # Errors
/// Returns [`ImpactError::Validation`] when the value is not a valid date.
pub fn parse_date(value: &str) -> Result<Date, ImpactError> {
    Date::parse(value.trim(), format_description!("[year]-[month]-[day]"))
        .map_err(|err| ImpactError::Validation(format!("invalid date {value}: {err}")))
}

/// Formats a calendar date as `YYYY-MM-DD`.
///
/// # Errors
/// Returns [`ImpactError::Validation`] when formatting fails.
pub fn format_date(value: Date) -> Result<String, ImpactError> {
    value
        .format(format_description!("[year]-[month]-[day]"))
        .map_err(|err| ImpactError::Validation(format!("failed to format date: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use serde_json::json;

    #[test]
    fn action_type_round_trips_wire_names() {
        for action_type in ActionType::ALL {
            assert_eq!(ActionType::parse(action_type.as_str()), Some(action_type));
        }
        assert_eq!(ActionType::parse("bid_increase"), None);
    }

    #[test]
    fn horizon_parse_accepts_loose_forms() {
        assert_eq!(Horizon::parse("14d"), Some(Horizon::D14));
        assert_eq!(Horizon::parse("30"), Some(Horizon::D30));
        assert_eq!(Horizon::parse(" 60D "), Some(Horizon::D60));
        assert_eq!(Horizon::parse("7D"), None);
    }

    #[test]
    fn bid_change_requires_suggested_bid() {
        let mut action = fixture_action(ActionType::BidIncrease);
        action.new_value = None;
        assert!(matches!(action.validate(), Err(ImpactError::Validation(_))));

        let negative = fixture_action(ActionType::NegativePerformance);
        assert!(negative.validate().is_ok());
    }

    #[test]
    fn performance_row_rejects_negative_spend() {
        let mut row = fixture_row(ACTION_DATE, 10, 5.0, 10.0);
        row.spend = -1.0;
        assert!(matches!(
            row.validate(),
            Err(ImpactError::InvalidMetricInput(_))
        ));
    }

    #[test]
    fn target_key_ignores_case_and_spacing() {
        let lhs = TargetKey::new("Brand  - Exact", " Trail Running Shoes");
        let rhs = TargetKey::new("brand - exact", "trail running shoes");
        assert_eq!(lhs, rhs);
    }

    #[test]
    fn target_key_merges_ad_groups_within_a_campaign() {
        let core = fixture_row(ACTION_DATE, 10, 5.0, 10.0);
        let mut overflow = core.clone();
        overflow.ad_group_name = "Overflow".to_string();
        assert_eq!(core.target_key(), overflow.target_key());

        let mut other_campaign = core.clone();
        other_campaign.campaign_name = "Brand - Broad".to_string();
        assert_ne!(core.target_key(), other_campaign.target_key());
    }

    #[test]
    fn ruleset_payload_without_late_fields_decodes_to_v1_values() {
        let mut value = must_ok(serde_json::to_value(ImpactRuleset::v1()));
        let Some(object) = value.as_object_mut() else {
            panic!("ruleset must serialize as an object");
        };
        for field in [
            "combined_signal_fraction",
            "spc_outlier_sigma",
            "spc_cap_min_targets",
            "low_sample_spc_cap",
        ] {
            object.remove(field);
        }
        assert_eq!(must_ok(ImpactRuleset::from_json(&value)), ImpactRuleset::v1());
    }

    #[test]
    fn ruleset_v1_is_valid_and_round_trips_json() {
        let ruleset = ImpactRuleset::v1();
        must_ok(ruleset.validate());
        let value = must_ok(serde_json::to_value(&ruleset));
        assert_eq!(must_ok(ImpactRuleset::from_json(&value)), ruleset);
    }

    #[test]
    fn ruleset_rejects_out_of_range_tolerance() {
        let mut value = must_ok(serde_json::to_value(ImpactRuleset::v1()));
        value["cpc_match_tolerance"] = json!(1.5);
        let err = ImpactRuleset::from_json(&value);
        assert!(matches!(err, Err(ImpactError::Configuration(_))));
    }

    #[test]
    fn ruleset_rejects_unordered_harvest_shares() {
        let mut ruleset = ImpactRuleset::v1();
        ruleset.harvest_migrated_share = 0.05;
        assert!(ruleset.validate().is_err());
    }

    #[test]
    fn date_helpers_use_iso_calendar_format() {
        let parsed = must_ok(parse_date("2026-03-02"));
        assert_eq!(parsed, ACTION_DATE);
        assert_eq!(must_ok(format_date(parsed)), "2026-03-02");
        assert!(parse_date("03/02/2026").is_err());
        assert!(parse_rfc3339_utc("2026-03-02T12:00:00+02:00").is_err());
    }

    #[test]
    fn action_id_serializes_as_plain_ulid() {
        let value = must_ok(serde_json::to_value(fixture_action_id()));
        assert_eq!(value, json!("01J0SQQP7M70P6Y3R4T8D8G8M2"));
        assert_eq!(
            must_ok(ActionId::parse("01J0SQQP7M70P6Y3R4T8D8G8M2")),
            fixture_action_id()
        );
    }
}
