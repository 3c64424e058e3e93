//! Deterministic confidence rubric (0-10 scale, clamped to [1, 10])

use crate::domain::entities::plan::ConfidenceInputs;

pub const MIN_SCORE: i64 = 1;
pub const MAX_SCORE: i64 = 10;

/// Plans scoring below this are rejected
pub const DEFAULT_MIN_CONFIDENCE: i64 = 6;

pub const RSI_SWEET_ZONE: (f64, f64) = (45.0, 65.0);
pub const VOLUME_CONFIRMATION_RATIO: f64 = 1.3;
pub const MIN_REWARD_RISK: f64 = 1.5;

/// Additive score:
/// +2 bullish higher-timeframe trend, +2 favorable location,
/// +1 RSI inside the sweet zone, +2 volume >= 1.3x average, +1 RR >= 1.5.
pub fn score(inputs: &ConfidenceInputs, risk_reward: f64) -> i64 {
    let mut total = 0;

    if inputs.htf_trend_bullish {
        total += 2;
    }
    if inputs.favorable_location {
        total += 2;
    }
    if let Some(rsi) = inputs.rsi {
        if rsi >= RSI_SWEET_ZONE.0 && rsi <= RSI_SWEET_ZONE.1 {
            total += 1;
        }
    }
    if inputs
        .volume_ratio
        .is_some_and(|ratio| ratio >= VOLUME_CONFIRMATION_RATIO)
    {
        total += 2;
    }
    if risk_reward >= MIN_REWARD_RISK {
        total += 1;
    }

    total.clamp(MIN_SCORE, MAX_SCORE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_house_scores_eight() {
        let inputs = ConfidenceInputs {
            htf_trend_bullish: true,
            favorable_location: true,
            rsi: Some(55.0),
            volume_ratio: Some(1.8),
        };
        assert_eq!(score(&inputs, 2.0), 8);
    }

    #[test]
    fn test_empty_inputs_clamp_to_minimum() {
        assert_eq!(score(&ConfidenceInputs::default(), 1.0), MIN_SCORE);
    }

    #[test]
    fn test_boundaries_are_inclusive() {
        let inputs = ConfidenceInputs {
            htf_trend_bullish: false,
            favorable_location: false,
            rsi: Some(65.0),
            volume_ratio: Some(1.3),
        };
        assert_eq!(score(&inputs, 1.5), 4);

        let outside = ConfidenceInputs {
            rsi: Some(70.0),
            volume_ratio: Some(1.29),
            ..inputs
        };
        assert_eq!(score(&outside, 1.49), MIN_SCORE);
    }

    #[test]
    fn test_threshold_sits_between_partial_and_full_setups() {
        let trend_and_volume = ConfidenceInputs {
            htf_trend_bullish: true,
            favorable_location: false,
            rsi: None,
            volume_ratio: Some(2.0),
        };
        assert_eq!(score(&trend_and_volume, 2.0), 5);
        assert!(score(&trend_and_volume, 2.0) < DEFAULT_MIN_CONFIDENCE);
    }
}
