//! The SRM adaptive timer parameters, as pure functions of the observed history.
//!
//! Request timers fire after `2^i * (C1 + U*C2) * distance`, repair timers after
//!  `(D1 + U*D2) * distance`, with `U` uniformly distributed in `[0, 1)`. While the distance to
//!  a payload's source is unknown, both fire after the fixed backoff floor. C1 and C2 are adjusted
//!  after every REQUEST a node sends, based on the moving averages of duplicate REQUESTs per
//!  round and of the delay until a loss is recovered.

use std::time::Duration;
use crate::config::SrmConfig;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AdaptiveParams {
    pub c1: f64,
    pub c2: f64,
    /// moving average of the REQUESTs from other members per local request round
    pub avg_duplicates: Option<f64>,
    /// moving average of the time between loss detection and recovery, in units of the distance
    ///  to the payload's source
    pub avg_delay: Option<f64>,
}

impl AdaptiveParams {
    pub fn new(config: &SrmConfig) -> AdaptiveParams {
        AdaptiveParams {
            c1: config.initial_c1,
            c2: config.initial_c2,
            avg_duplicates: None,
            avg_delay: None,
        }
    }

    /// Folds a request round's duplicate count into the moving average and adjusts C1 / C2.
    ///  `distance_improved` is whether the current distance estimate to the payload's source is
    ///  lower than any estimate seen in earlier rounds of the same request timer.
    pub fn on_request_sent(&self, round_duplicates: u32, distance_improved: bool, config: &SrmConfig) -> AdaptiveParams {
        let avg_duplicates = ewma(self.avg_duplicates, round_duplicates as f64, config.ewma_alpha);

        let mut c1 = self.c1 - 0.1;
        let mut c2 = self.c2;

        if distance_improved {
            c2 -= 0.1;
        }
        else if avg_duplicates >= config.target_avg_duplicates {
            c1 += 0.1;
            c2 += 0.5;
        }
        else if avg_duplicates < config.target_avg_duplicates - config.duplicates_epsilon {
            if self.avg_delay.map(|d| d > config.target_avg_delay).unwrap_or(false) {
                c2 -= 0.1;
            }
            if avg_duplicates < config.low_duplicates_threshold {
                c1 -= 0.05;
            }
        }
        else {
            c1 += 0.05;
        }

        AdaptiveParams {
            c1,
            c2,
            avg_duplicates: Some(avg_duplicates),
            avg_delay: self.avg_delay,
        }
    }

    /// Folds the delay of a recovered loss into the moving average
    pub fn on_request_done(&self, delay: f64, config: &SrmConfig) -> AdaptiveParams {
        AdaptiveParams {
            avg_delay: Some(ewma(self.avg_delay, delay, config.ewma_alpha)),
            ..*self
        }
    }
}

fn ewma(prev: Option<f64>, sample: f64, new_weight: f64) -> f64 {
    match prev {
        None => sample,
        Some(prev) => (1.0 - new_weight) * prev + new_weight * sample,
    }
}

pub fn request_expiry(iteration: u32, params: &AdaptiveParams, uniform: f64, distance: Option<Duration>, config: &SrmConfig) -> Duration {
    let distance = match distance {
        Some(d) => d,
        None => return config.backoff_floor,
    };
    // anything beyond this is capped anyway
    let exponent = iteration.min(64) as i32;
    let factor = 2f64.powi(exponent) * (params.c1 + uniform * params.c2);
    clamp_backoff(factor * distance.as_secs_f64(), config)
}

/// `D1 = D2 = ln(view size)`
pub fn repair_spread(view_size: usize) -> f64 {
    (view_size.max(1) as f64).ln()
}

pub fn repair_expiry(spread: f64, uniform: f64, distance: Option<Duration>, config: &SrmConfig) -> Duration {
    match distance {
        Some(d) => clamp_backoff((spread + uniform * spread) * d.as_secs_f64(), config),
        None => config.backoff_floor,
    }
}

/// C1 and C2 are not bounded, so the raw value can be anything including negative or NaN
fn clamp_backoff(seconds: f64, config: &SrmConfig) -> Duration {
    if seconds.is_nan() || seconds <= config.backoff_floor.as_secs_f64() {
        return config.backoff_floor;
    }
    if seconds >= config.max_backoff.as_secs_f64() {
        return config.max_backoff;
    }
    Duration::from_secs_f64(seconds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn params(c1: f64, c2: f64, avg_duplicates: Option<f64>, avg_delay: Option<f64>) -> AdaptiveParams {
        AdaptiveParams { c1, c2, avg_duplicates, avg_delay }
    }

    fn assert_approx(actual: f64, expected: f64) {
        assert!((actual - expected).abs() < 1e-9, "expected {}, was {}", expected, actual);
    }

    #[test]
    fn test_initial_params() {
        assert_eq!(AdaptiveParams::new(&SrmConfig::default()), params(2.0, 2.0, None, None));
    }

    #[rstest]
    #[case::distance_improved(params(2.0, 2.0, Some(5.0), Some(5.0)), 3, true, 1.9, 1.9, 4.5)]
    #[case::first_round_without_duplicates(params(2.0, 2.0, None, None), 0, false, 1.85, 2.0, 0.0)]
    #[case::first_round_with_duplicate(params(2.0, 2.0, None, None), 1, false, 2.0, 2.5, 1.0)]
    #[case::many_duplicates(params(2.0, 2.0, Some(1.0), None), 1, false, 2.0, 2.5, 1.0)]
    #[case::few_duplicates_slow(params(2.0, 2.0, Some(0.8), Some(1.5)), 0, false, 1.9, 1.9, 0.6)]
    #[case::few_duplicates_fast(params(2.0, 2.0, Some(0.8), Some(0.5)), 0, false, 1.9, 2.0, 0.6)]
    #[case::very_few_duplicates_slow(params(2.0, 2.0, Some(0.2), Some(1.5)), 0, false, 1.85, 1.9, 0.15)]
    #[case::near_target(params(2.0, 2.0, Some(0.92), None), 1, false, 1.95, 2.0, 0.94)]
    fn test_on_request_sent(
        #[case] before: AdaptiveParams,
        #[case] round_duplicates: u32,
        #[case] distance_improved: bool,
        #[case] expected_c1: f64,
        #[case] expected_c2: f64,
        #[case] expected_avg_duplicates: f64,
    ) {
        let after = before.on_request_sent(round_duplicates, distance_improved, &SrmConfig::default());
        assert_approx(after.c1, expected_c1);
        assert_approx(after.c2, expected_c2);
        assert_approx(after.avg_duplicates.unwrap(), expected_avg_duplicates);
        assert_eq!(after.avg_delay, before.avg_delay);
    }

    #[test]
    fn test_on_request_done() {
        let config = SrmConfig::default();
        let p = params(2.0, 2.0, Some(1.0), None).on_request_done(2.0, &config);
        assert_eq!(p.avg_delay, Some(2.0));
        let p = p.on_request_done(4.0, &config);
        assert_approx(p.avg_delay.unwrap(), 2.5);
        assert_eq!((p.c1, p.c2, p.avg_duplicates), (2.0, 2.0, Some(1.0)));
    }

    #[rstest]
    #[case::first_round(0, 2.0, 2.0, 0.5, Some(1000), 3000)]
    #[case::doubled(1, 2.0, 2.0, 0.5, Some(1000), 6000)]
    #[case::short_distance(3, 2.0, 2.0, 0.0, Some(10), 1000)]
    #[case::floor(0, 0.1, 0.1, 0.5, Some(100), 1000)]
    #[case::negative(2, -5.0, 1.0, 0.5, Some(500), 1000)]
    #[case::nan(0, f64::NAN, 1.0, 0.5, Some(500), 1000)]
    #[case::capped(40, 2.0, 2.0, 0.5, Some(1000), 3_600_000)]
    #[case::huge_iteration(u32::MAX, 2.0, 2.0, 0.5, Some(1000), 3_600_000)]
    #[case::infinite(0, f64::INFINITY, 1.0, 0.5, Some(1000), 3_600_000)]
    #[case::unknown_distance(0, 2.0, 2.0, 0.5, None, 1000)]
    #[case::unknown_distance_no_doubling(5, 2.0, 2.0, 0.9, None, 1000)]
    fn test_request_expiry(#[case] iteration: u32, #[case] c1: f64, #[case] c2: f64, #[case] uniform: f64, #[case] distance_millis: Option<u64>, #[case] expected_millis: u128) {
        let expiry = request_expiry(iteration, &params(c1, c2, None, None), uniform, distance_millis.map(Duration::from_millis), &SrmConfig::default());
        assert_eq!(expiry.as_millis(), expected_millis);
    }

    #[rstest]
    #[case::single_member(1, 0.5, Some(1000), 1000)]
    #[case::empty_view(0, 0.5, Some(1000), 1000)]
    #[case::ten_members(10, 0.5, Some(1000), 3453)]
    #[case::ten_members_min(10, 0.0, Some(1000), 2302)]
    #[case::short_distance(10, 0.5, Some(100), 1000)]
    #[case::unknown_distance(10, 0.5, None, 1000)]
    fn test_repair_expiry(#[case] view_size: usize, #[case] uniform: f64, #[case] distance_millis: Option<u64>, #[case] expected_millis: u128) {
        let expiry = repair_expiry(repair_spread(view_size), uniform, distance_millis.map(Duration::from_millis), &SrmConfig::default());
        assert_eq!(expiry.as_millis(), expected_millis);
    }
}
