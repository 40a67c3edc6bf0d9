//! Adaptive batch sizing.
//!
//! A batch's time efficiency is its duration divided by the migration
//! interval. The optimizer keeps the smoothed efficiency inside a target band
//! by growing or shrinking the batch size, bounded on both sides.

use crate::config::BatchOptimizerConfig;

/// Exponentially weighted mean of `efficiencies`, most recent first.
///
/// Returns `None` when there are fewer than `min_samples` values.
pub fn smoothed_efficiency(efficiencies: &[f64], config: &BatchOptimizerConfig) -> Option<f64> {
    let samples: Vec<f64> = efficiencies
        .iter()
        .copied()
        .filter(|value| value.is_finite() && *value >= 0.0)
        .take(config.window)
        .collect();

    if samples.is_empty() || samples.len() < config.min_samples {
        return None;
    }

    let decay = 1.0 - config.smoothing_factor;
    let (weighted, weights) = samples
        .iter()
        .enumerate()
        .fold((0.0, 0.0), |(sum, total), (age, value)| {
            let weight = decay.powi(age as i32);
            (sum + value * weight, total + weight)
        });

    Some(weighted / weights)
}

/// Next batch size given the current one and recent efficiencies.
///
/// Stays unchanged inside the target band or without enough samples; the
/// result is always within `[min_size, max_size]`.
pub fn optimized_batch_size(
    current: i64,
    efficiencies: &[f64],
    min_size: i64,
    max_size: i64,
    config: &BatchOptimizerConfig,
) -> i64 {
    let lower = min_size.max(1);
    let upper = max_size.max(lower);
    let current = current.clamp(lower, upper);

    if !config.enabled {
        return current;
    }
    let Some(efficiency) = smoothed_efficiency(efficiencies, config) else {
        return current;
    };

    if efficiency >= config.target_efficiency_min && efficiency <= config.target_efficiency_max {
        return current;
    }

    let target = (config.target_efficiency_min + config.target_efficiency_max) / 2.0;
    let multiplier = if efficiency <= f64::EPSILON {
        config.max_growth_factor
    } else {
        (target / efficiency).clamp(config.min_shrink_factor, config.max_growth_factor)
    };

    let next = (current as f64 * multiplier).round() as i64;
    next.clamp(lower, upper)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BatchOptimizerConfig {
        BatchOptimizerConfig {
            min_samples: 1,
            ..BatchOptimizerConfig::default()
        }
    }

    #[test]
    fn fast_batches_grow_by_at_most_the_growth_factor() {
        let next = optimized_batch_size(1000, &[0.1, 0.1, 0.1], 100, 100_000, &config());
        assert_eq!(next, 1200);
    }

    #[test]
    fn slow_batches_shrink() {
        let next = optimized_batch_size(1000, &[1.85], 100, 100_000, &config());
        assert_eq!(next, 500);

        let next = optimized_batch_size(1000, &[1.0], 100, 100_000, &config());
        assert_eq!(next, 925);
    }

    #[test]
    fn efficiency_inside_band_keeps_size() {
        assert_eq!(
            optimized_batch_size(1000, &[0.92, 0.93], 100, 100_000, &config()),
            1000
        );
    }

    #[test]
    fn size_is_bounded_by_sub_batch_and_max_batch() {
        assert_eq!(optimized_batch_size(1900, &[0.0], 100, 2000, &config()), 2000);
        assert_eq!(optimized_batch_size(120, &[5.0], 100, 2000, &config()), 100);
    }

    #[test]
    fn not_enough_samples_keeps_size() {
        let config = BatchOptimizerConfig {
            min_samples: 3,
            ..BatchOptimizerConfig::default()
        };
        assert_eq!(optimized_batch_size(1000, &[0.1, 0.1], 100, 5000, &config), 1000);
    }

    #[test]
    fn recent_samples_weigh_more() {
        let config = config();
        let recent_slow = smoothed_efficiency(&[2.0, 0.5, 0.5], &config).unwrap();
        let recent_fast = smoothed_efficiency(&[0.5, 0.5, 2.0], &config).unwrap();
        assert!(recent_slow > recent_fast);
    }

    #[test]
    fn disabled_optimizer_keeps_size() {
        let config = BatchOptimizerConfig {
            enabled: false,
            ..config()
        };
        assert_eq!(optimized_batch_size(1000, &[0.1], 100, 5000, &config), 1000);
    }
}
