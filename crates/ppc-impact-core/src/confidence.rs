//! Account-level confidence in aggregated decision impact.
//!
//! Classification never alters impact values. The signal-to-noise label
//! gates nothing either; the z-score view is display-only.

use serde::{Deserialize, Serialize};

use crate::impact::ImpactRecord;
use crate::report::is_counted;
use crate::validation::{MarketTag, ValidationOutcome};
use crate::ImpactRuleset;

/// Two-sided 90 % critical value.
const Z_90: f64 = 1.645;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ConfidenceLabel {
    Low,
    Medium,
    High,
}

impl ConfidenceLabel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "Low",
            Self::Medium => "Medium",
            Self::High => "High",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Low" => Some(Self::Low),
            "Medium" => Some(Self::Medium),
            "High" => Some(Self::High),
            _ => None,
        }
    }

    #[must_use]
    pub fn downgrade(self) -> Self {
        match self {
            Self::High => Self::Medium,
            Self::Medium | Self::Low => Self::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ZConfidenceLabel {
    InsufficientData,
    Directional,
    Moderate,
    High,
    VeryHigh,
}

impl ZConfidenceLabel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InsufficientData => "Insufficient Data",
            Self::Directional => "Directional",
            Self::Moderate => "Moderate",
            Self::High => "High",
            Self::VeryHigh => "Very High",
        }
    }

    fn from_abs_z(abs_z: f64) -> Self {
        if abs_z >= 2.58 {
            Self::VeryHigh
        } else if abs_z >= 1.96 {
            Self::High
        } else if abs_z >= Z_90 {
            Self::Moderate
        } else {
            Self::Directional
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ZConfidence {
    pub label: ZConfidenceLabel,
    pub sample_size: usize,
    pub mean: f64,
    pub standard_error: f64,
    pub z_score: f64,
    pub confidence_pct: f64,
    pub ci90_lower: f64,
    pub ci90_upper: f64,
}

impl ZConfidence {
    fn insufficient(sample_size: usize) -> Self {
        Self {
            label: ZConfidenceLabel::InsufficientData,
            sample_size,
            mean: 0.0,
            standard_error: 0.0,
            z_score: 0.0,
            confidence_pct: 0.0,
            ci90_lower: 0.0,
            ci90_upper: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ConfidenceAssessment {
    pub label: ConfidenceLabel,
    /// `None` when the aggregate has impact but zero variance.
    pub signal_ratio: Option<f64>,
    pub total_sigma: f64,
    pub total_final_impact: f64,
    pub validated_count: usize,
    pub downshift_share: f64,
    pub z: ZConfidence,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SpendAvoidedConfidence {
    pub label: ConfidenceLabel,
    pub signal_ratio: Option<f64>,
    pub total_sigma: f64,
    pub total_spend_avoided: f64,
    pub action_count: usize,
    pub downshift_share: f64,
}

/// Standard normal CDF.
#[must_use]
pub fn normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + libm::erf(x / std::f64::consts::SQRT_2))
}

/// Signal-to-noise confidence over counted, non-MarketDrag records.
///
/// `sigma_i = |decision_impact_i| * (1 - weight_i)`, inflated for
/// `MarketDownshift` records. One level is dropped when downshift-tagged
/// records carry more than the configured share of the total absolute
/// impact.
#[must_use]
pub fn aggregate_confidence(records: &[ImpactRecord], ruleset: &ImpactRuleset) -> ConfidenceAssessment {
    let counted = records
        .iter()
        .filter(|record| is_counted(record) && !record.is_market_drag())
        .collect::<Vec<_>>();

    let mut total_final_impact = 0.0;
    let mut variance_sum = 0.0;
    let mut downshift_impact = 0.0;
    let mut absolute_impact = 0.0;

    for record in &counted {
        total_final_impact += record.final_decision_impact;
        absolute_impact += record.final_decision_impact.abs();
        let mut sigma = record.decision_impact.abs() * (1.0 - record.confidence_weight);
        if record.market_tag == MarketTag::MarketDownshift {
            sigma *= ruleset.downshift_sigma_multiplier;
            downshift_impact += record.final_decision_impact.abs();
        }
        variance_sum += sigma * sigma;
    }

    let total_sigma = variance_sum.sqrt();
    let signal_ratio = signal_ratio(total_final_impact.abs(), total_sigma);

    let mut label = classify(
        signal_ratio,
        counted.len(),
        ruleset.high_signal_ratio,
        ruleset.medium_signal_ratio,
        ruleset.min_validated_for_high,
    );

    let downshift_share = if absolute_impact > 0.0 {
        downshift_impact / absolute_impact
    } else {
        0.0
    };
    if downshift_share > ruleset.downshift_downgrade_share {
        label = label.downgrade();
    }

    let values = counted
        .iter()
        .map(|record| record.final_decision_impact)
        .collect::<Vec<_>>();

    ConfidenceAssessment {
        label,
        signal_ratio,
        total_sigma,
        total_final_impact,
        validated_count: counted.len(),
        downshift_share,
        z: z_score_confidence(&values, ruleset),
    }
}

/// Display-only z-score: sample mean over its standard error.
/// `confidence_pct` is two-sided, `2Φ(|z|) - 1`, so no signal reads as 0 %.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn z_score_confidence(values: &[f64], ruleset: &ImpactRuleset) -> ZConfidence {
    let n = values.len();
    if n < 2 {
        return ZConfidence::insufficient(n);
    }

    let count = n as f64;
    let mean = values.iter().sum::<f64>() / count;
    let variance = values
        .iter()
        .map(|value| (value - mean).powi(2))
        .sum::<f64>()
        / (count - 1.0);
    let standard_error = variance.sqrt() / count.sqrt();
    let z_score = if standard_error > 0.0 {
        mean / standard_error
    } else {
        0.0
    };

    ZConfidence {
        label: ZConfidenceLabel::from_abs_z(z_score.abs()),
        sample_size: n,
        mean,
        standard_error,
        z_score,
        confidence_pct: ((2.0 * normal_cdf(z_score.abs()) - 1.0) * 100.0)
            .min(ruleset.z_confidence_cap_pct),
        ci90_lower: mean - Z_90 * standard_error,
        ci90_upper: mean + Z_90 * standard_error,
    }
}

/// Confidence in the spend-avoided figure, using auction variance factors
/// instead of click weights.
#[must_use]
pub fn aggregate_spend_avoided_confidence(
    records: &[ImpactRecord],
    ruleset: &ImpactRuleset,
) -> SpendAvoidedConfidence {
    let mut total_spend_avoided = 0.0;
    let mut downshift_spend_avoided = 0.0;
    let mut variance_sum = 0.0;
    let mut action_count = 0;

    for record in records.iter().filter(|record| {
        record.is_mature && record.outcome == ValidationOutcome::Confirmed && record.duplicate_of.is_none()
    }) {
        let avoided = (record.before_spend - record.after_spend).max(0.0);
        if avoided <= 0.0 {
            continue;
        }
        total_spend_avoided += avoided;
        action_count += 1;

        let factor = if record.market_tag == MarketTag::MarketDownshift {
            downshift_spend_avoided += avoided;
            ruleset.spend_avoided_variance_downshift
        } else {
            ruleset.spend_avoided_variance
        };
        let sigma = avoided * factor;
        variance_sum += sigma * sigma;
    }

    let total_sigma = variance_sum.sqrt();
    let signal_ratio = signal_ratio(total_spend_avoided, total_sigma);
    let mut label = classify(
        signal_ratio,
        action_count,
        ruleset.spend_avoided_high_ratio,
        ruleset.spend_avoided_medium_ratio,
        ruleset.spend_avoided_min_high,
    );

    let downshift_share = if total_spend_avoided > 0.0 {
        downshift_spend_avoided / total_spend_avoided
    } else {
        0.0
    };
    if downshift_share > ruleset.spend_avoided_downgrade_share {
        label = label.downgrade();
    }

    SpendAvoidedConfidence {
        label,
        signal_ratio,
        total_sigma,
        total_spend_avoided,
        action_count,
        downshift_share,
    }
}

fn signal_ratio(signal: f64, total_sigma: f64) -> Option<f64> {
    if total_sigma > 0.0 {
        Some(signal / total_sigma)
    } else if signal > 0.0 {
        None
    } else {
        Some(0.0)
    }
}

fn classify(
    signal_ratio: Option<f64>,
    count: usize,
    high_ratio: f64,
    medium_ratio: f64,
    min_for_high: usize,
) -> ConfidenceLabel {
    // None means noise-free signal, which clears every ratio threshold.
    let clears = |threshold: f64| !matches!(signal_ratio, Some(ratio) if ratio < threshold);
    if clears(high_ratio) && count >= min_for_high {
        ConfidenceLabel::High
    } else if clears(medium_ratio) {
        ConfidenceLabel::Medium
    } else {
        ConfidenceLabel::Low
    }
}
