//! Rolling/window primitives over `&[f64]` slices with NaN as the
//! missing-value marker.
//!
//! Every aggregation here skips NaN entries: the statistic is computed
//! over the non-NaN values inside the trailing window, and the result
//! is NaN when fewer than `min_periods` of them are present. Callers
//! are expected to slice per asset group before applying any of these,
//! so no function in this module ever crosses a group boundary.

/// Shift values forward by `periods`, filling the head with NaN.
pub fn shift(values: &[f64], periods: usize) -> Vec<f64> {
    let len = values.len();
    let mut out = vec![f64::NAN; len];
    if periods < len {
        out[periods..].copy_from_slice(&values[..len - periods]);
    }
    out
}

/// First difference within the slice. The first element is NaN.
pub fn diff1(values: &[f64]) -> Vec<f64> {
    values
        .iter()
        .enumerate()
        .map(|(i, &v)| if i == 0 { f64::NAN } else { v - values[i - 1] })
        .collect()
}

/// Trailing-window mean with a minimum count of non-NaN observations.
pub fn rolling_mean(values: &[f64], window: usize, min_periods: usize) -> Vec<f64> {
    values
        .iter()
        .enumerate()
        .map(|(i, _)| {
            let start = (i + 1).saturating_sub(window);
            let mut sum = 0.0;
            let mut count = 0usize;
            for &v in &values[start..=i] {
                if v.is_finite() {
                    sum += v;
                    count += 1;
                }
            }
            if count >= min_periods.max(1) {
                sum / count as f64
            } else {
                f64::NAN
            }
        })
        .collect()
}

/// Trailing-window sample standard deviation (ddof = 1).
///
/// A standard deviation needs at least two observations, so the
/// effective minimum count is `max(min_periods, 2)`.
pub fn rolling_std(values: &[f64], window: usize, min_periods: usize) -> Vec<f64> {
    values
        .iter()
        .enumerate()
        .map(|(i, _)| {
            let start = (i + 1).saturating_sub(window);
            let obs: Vec<f64> = values[start..=i]
                .iter()
                .copied()
                .filter(|v| v.is_finite())
                .collect();
            let count = obs.len();
            if count < min_periods.max(2) {
                return f64::NAN;
            }
            let mean = obs.iter().sum::<f64>() / count as f64;
            let sum_sq = obs.iter().map(|v| (v - mean).powi(2)).sum::<f64>();
            (sum_sq / (count - 1) as f64).sqrt()
        })
        .collect()
}

/// Trailing-window quantile with linear interpolation between order
/// statistics (the estimator pandas/numpy use by default). Fixing the
/// interpolation method here is what makes IQR values reproducible
/// across runs and across numeric libraries.
pub fn rolling_quantile(values: &[f64], window: usize, q: f64, min_periods: usize) -> Vec<f64> {
    values
        .iter()
        .enumerate()
        .map(|(i, _)| {
            let start = (i + 1).saturating_sub(window);
            let mut obs: Vec<f64> = values[start..=i]
                .iter()
                .copied()
                .filter(|v| v.is_finite())
                .collect();
            if obs.len() < min_periods.max(1) {
                return f64::NAN;
            }
            obs.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            interpolated_quantile(&obs, q)
        })
        .collect()
}

/// Trailing-window median, a fixed-quantile special case.
pub fn rolling_median(values: &[f64], window: usize, min_periods: usize) -> Vec<f64> {
    rolling_quantile(values, window, 0.5, min_periods)
}

/// Running sum where NaN cells yield NaN in place but contribute zero
/// to the accumulator, which keeps accumulating afterwards.
pub fn cumsum(values: &[f64]) -> Vec<f64> {
    let mut running = 0.0;
    values
        .iter()
        .map(|&v| {
            if v.is_finite() {
                running += v;
                running
            } else {
                f64::NAN
            }
        })
        .collect()
}

/// Running maximum. NaN cells yield NaN in place and are ignored by
/// the running state; the maximum never decreases within a slice.
pub fn cummax(values: &[f64]) -> Vec<f64> {
    let mut running = f64::NAN;
    values
        .iter()
        .map(|&v| {
            if v.is_finite() {
                running = if running.is_nan() { v } else { running.max(v) };
                running
            } else {
                f64::NAN
            }
        })
        .collect()
}

/// Period-over-period percent change. NaN when the prior value is
/// missing or zero (a zero base has no defined relative change).
pub fn pct_change(values: &[f64]) -> Vec<f64> {
    values
        .iter()
        .enumerate()
        .map(|(i, &v)| {
            if i == 0 {
                return f64::NAN;
            }
            let prev = values[i - 1];
            if !prev.is_finite() || prev == 0.0 {
                f64::NAN
            } else {
                (v - prev) / prev
            }
        })
        .collect()
}

fn interpolated_quantile(sorted: &[f64], q: f64) -> f64 {
    let clamped = q.clamp(0.0, 1.0);
    let pos = clamped * (sorted.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    if lower == upper {
        sorted[lower]
    } else {
        sorted[lower] + (sorted[upper] - sorted[lower]) * (pos - lower as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-12,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn shift_fills_head_with_nan() {
        let shifted = shift(&[1.0, 2.0, 3.0], 1);
        assert!(shifted[0].is_nan());
        assert_close(shifted[1], 1.0);
        assert_close(shifted[2], 2.0);
    }

    #[test]
    fn rolling_mean_grows_from_first_observation() {
        let out = rolling_mean(&[2.0, 4.0, 6.0], 5, 1);
        assert_close(out[0], 2.0);
        assert_close(out[1], 3.0);
        assert_close(out[2], 4.0);
    }

    #[test]
    fn rolling_mean_skips_nan_and_honors_min_periods() {
        let values = [f64::NAN, 4.0, f64::NAN, 8.0];
        let out = rolling_mean(&values, 3, 2);
        assert!(out[0].is_nan());
        assert!(out[1].is_nan(), "only one valid observation in window");
        assert!(out[2].is_nan());
        assert_close(out[3], 6.0);
    }

    #[test]
    fn rolling_std_requires_two_observations() {
        let out = rolling_std(&[100.0, 110.0, 90.0], 5, 2);
        assert!(out[0].is_nan());
        assert_close(out[1], 50.0_f64.sqrt());
        assert_close(out[2], 100.0_f64.sqrt());
    }

    #[test]
    fn rolling_quantile_interpolates_linearly() {
        let out = rolling_quantile(&[1.0, 2.0, 3.0, 4.0], 4, 0.75, 1);
        // sorted [1,2,3,4], pos = 0.75 * 3 = 2.25 -> 3 + 0.25 * (4 - 3)
        assert_close(out[3], 3.25);
    }

    #[test]
    fn rolling_median_of_three() {
        let out = rolling_median(&[100.0, 110.0, 90.0], 20, 3);
        assert!(out[0].is_nan());
        assert!(out[1].is_nan());
        assert_close(out[2], 100.0);
    }

    #[test]
    fn cumsum_skips_nan_but_marks_the_cell() {
        let out = cumsum(&[f64::NAN, 0.10, -0.2]);
        assert!(out[0].is_nan());
        assert_close(out[1], 0.10);
        assert_close(out[2], -0.1);
    }

    #[test]
    fn cummax_never_decreases() {
        let out = cummax(&[100.0, 110.0, 90.0]);
        assert_close(out[0], 100.0);
        assert_close(out[1], 110.0);
        assert_close(out[2], 110.0);
    }

    #[test]
    fn pct_change_guards_zero_and_missing_base() {
        let out = pct_change(&[0.0, 5.0, 10.0, f64::NAN, 3.0]);
        assert!(out[0].is_nan());
        assert!(out[1].is_nan(), "zero base must not produce infinity");
        assert_close(out[2], 1.0);
        assert!(out[4].is_nan(), "missing base propagates");
    }
}
