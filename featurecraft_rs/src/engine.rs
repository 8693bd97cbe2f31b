//! The feature derivation engine.
//!
//! Six ordered stages over one in-memory panel frame, each adding
//! columns and never adding or removing rows. Every windowed or lagged
//! computation is partitioned by asset: group slices are fanned out
//! over the rayon pool and stitched back in canonical order, so the
//! output is a deterministic function of the normalized input.

use std::ops::Range;

use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate};
use polars::prelude::*;
use rayon::prelude::*;
use tracing::debug;

use crate::panel::{EPOCH_DAYS_FROM_CE, PanelData};
use crate::rolling::{
    cummax, cumsum, diff1, pct_change, rolling_mean, rolling_median, rolling_quantile, rolling_std,
    shift,
};

/// Numerical-stability epsilon shared by the log-return and Parkinson
/// formulas.
pub const EPS: f64 = 1e-9;

/// Parkinson range-estimator constant, 1 / (4 ln 2).
const PARKINSON_K: f64 = 1.0 / (4.0 * std::f64::consts::LN_2);

/// Rescales MAD to be consistent with the standard deviation under a
/// normal distribution.
const MAD_SCALE: f64 = 1.4826;

/// Sentinel for categorical cells that cannot be classified because an
/// input is null.
pub const UNKNOWN_CATEGORY: &str = "unknown";

pub struct FeatureEngine {
    frame: DataFrame,
    groups: Vec<Range<usize>>,
}

impl FeatureEngine {
    pub fn from_panel(panel: PanelData) -> Result<Self> {
        let frame = panel.into_frame();
        let groups = PanelData::group_ranges(&frame)?;
        Ok(Self { frame, groups })
    }

    pub fn frame(&self) -> &DataFrame {
        &self.frame
    }

    pub fn frame_mut(&mut self) -> &mut DataFrame {
        &mut self.frame
    }

    pub fn into_frame(self) -> DataFrame {
        self.frame
    }

    /// Run all stages in order, then the mandatory non-finite cleanup
    /// pass. Row count is invariant across every stage.
    pub fn compute_features(&mut self) -> Result<()> {
        let rows = self.frame.height();
        self.compute_lags()?;
        self.compute_returns_and_trend()?;
        self.compute_robust_stats()?;
        self.compute_range_volatility()?;
        self.compute_candle_volume_temporal()?;
        self.replace_non_finite_with_null()?;
        debug_assert_eq!(self.frame.height(), rows);
        debug!(
            rows,
            columns = self.frame.width(),
            groups = self.groups.len(),
            "feature table materialized"
        );
        Ok(())
    }

    /// Stage 2: 1-step lags of close, open and volume, per asset. The
    /// first row of each group has no prior observation and stays null.
    fn compute_lags(&mut self) -> Result<()> {
        let close = self.float_column("close")?;
        let open = self.float_column("open")?;
        let volume = self.float_column("volume_from")?;

        let close_prev = self.per_group(&close, |g| shift(g, 1));
        let open_prev = self.per_group(&open, |g| shift(g, 1));
        let volume_prev = self.per_group(&volume, |g| shift(g, 1));

        self.insert_float("close_prev", close_prev)?;
        self.insert_float("open_prev", open_prev)?;
        self.insert_float("volume_prev", volume_prev)
    }

    /// Stage 3: returns, cumulative return, moving averages and the
    /// short close-to-close volatility.
    fn compute_returns_and_trend(&mut self) -> Result<()> {
        let close = self.float_column("close")?;
        let open = self.float_column("open")?;
        let volume = self.float_column("volume_from")?;
        let close_prev = self.float_column("close_prev")?;

        let daily_return: Vec<f64> = close
            .iter()
            .zip(close_prev.iter())
            .map(|(&c, &p)| {
                if !p.is_finite() || p == 0.0 {
                    f64::NAN
                } else {
                    (c - p) / p
                }
            })
            .collect();

        // Log prices are only defined for strictly positive closes; the
        // epsilon keeps the logarithm stable near zero.
        let log_close: Vec<f64> = close
            .iter()
            .map(|&c| if c > 0.0 { (c + EPS).ln() } else { f64::NAN })
            .collect();
        let log_return = self.per_group(&log_close, diff1);

        // Nulls contribute zero to the running sum but keep their own
        // cell null. This diverges from strict null propagation and is
        // preserved from the source system on purpose.
        let cum_return = self.per_group(&daily_return, cumsum);

        self.insert_float("daily_return", daily_return)?;
        self.insert_float("log_return", log_return)?;
        self.insert_float("cum_return", cum_return)?;

        for (name, values, window) in [
            ("close_sma_5", &close, 5usize),
            ("close_sma_20", &close, 20),
            ("open_sma_5", &open, 5),
            ("open_sma_20", &open, 20),
            ("volume_sma_5", &volume, 5),
            ("volume_sma_20", &volume, 20),
        ] {
            let sma = self.per_group(values, |g| rolling_mean(g, window, 1));
            self.insert_float(name, sma)?;
        }

        let volatility_5 = self.per_group(&close, |g| rolling_std(g, 5, 2));
        self.insert_float("volatility_5", volatility_5)
    }

    /// Stage 4: rolling median/MAD/IQR over close(20) and the robust
    /// z-score built from them.
    fn compute_robust_stats(&mut self) -> Result<()> {
        let close = self.float_column("close")?;

        let median_20 = self.per_group(&close, |g| rolling_median(g, 20, 3));
        let abs_dev: Vec<f64> = close
            .iter()
            .zip(median_20.iter())
            .map(|(&c, &m)| (c - m).abs())
            .collect();
        let mad_20 = self.per_group(&abs_dev, |g| rolling_median(g, 20, 3));

        let q75 = self.per_group(&close, |g| rolling_quantile(g, 20, 0.75, 5));
        let q25 = self.per_group(&close, |g| rolling_quantile(g, 20, 0.25, 5));
        let iqr_20: Vec<f64> = q75.iter().zip(q25.iter()).map(|(&hi, &lo)| hi - lo).collect();

        let robust_z_20 = robust_z(&close, &median_20, &mad_20);

        self.insert_float("median_20", median_20)?;
        self.insert_float("mad_20", mad_20)?;
        self.insert_float("iqr_20", iqr_20)?;
        self.insert_float("robust_z_20", robust_z_20)
    }

    /// Stage 5: Parkinson range volatility and ATR. Non-positive highs
    /// and lows are nonsense for a price range and would feed a
    /// logarithm, so they are nulled first, and that replacement
    /// persists into the output high/low columns.
    fn compute_range_volatility(&mut self) -> Result<()> {
        let high: Vec<f64> = self
            .float_column("high")?
            .into_iter()
            .map(|v| if v <= 0.0 { f64::NAN } else { v })
            .collect();
        let low: Vec<f64> = self
            .float_column("low")?
            .into_iter()
            .map(|v| if v <= 0.0 { f64::NAN } else { v })
            .collect();
        let close_prev = self.float_column("close_prev")?;

        let hl_log2: Vec<f64> = high
            .iter()
            .zip(low.iter())
            .map(|(&h, &l)| ((h + EPS) / (l + EPS)).ln().powi(2))
            .collect();

        let parkinson_10: Vec<f64> = self
            .per_group(&hl_log2, |g| {
                let scaled: Vec<f64> = g.iter().map(|&v| PARKINSON_K * v).collect();
                rolling_mean(&scaled, 10, 5)
            })
            .into_iter()
            .map(f64::sqrt)
            .collect();

        // True Range takes the greatest of the three range definitions,
        // skipping the terms a missing prior close makes undefined.
        let true_range: Vec<f64> = (0..high.len())
            .map(|i| {
                nan_max3(
                    (high[i] - low[i]).abs(),
                    (high[i] - close_prev[i]).abs(),
                    (low[i] - close_prev[i]).abs(),
                )
            })
            .collect();
        let atr_14 = self.per_group(&true_range, |g| rolling_mean(g, 14, 3));

        self.insert_float("high", high)?;
        self.insert_float("low", low)?;
        self.insert_float("hl_log2", hl_log2)?;
        self.insert_float("parkinson_10", parkinson_10)?;
        self.insert_float("atr_14", atr_14)
    }

    /// Stage 6: candle geometry, volume surprise, drawdown, calendar
    /// features and categorical comparisons.
    fn compute_candle_volume_temporal(&mut self) -> Result<()> {
        let open = self.float_column("open")?;
        let close = self.float_column("close")?;
        let high = self.float_column("high")?;
        let low = self.float_column("low")?;
        let volume = self.float_column("volume_from")?;
        let volume_to = self.float_column("volume_to")?;
        let close_prev = self.float_column("close_prev")?;
        let volume_prev = self.float_column("volume_prev")?;

        let len = close.len();

        let mut pos_no_range = vec![f64::NAN; len];
        let mut upper_shadow = vec![f64::NAN; len];
        let mut lower_shadow = vec![f64::NAN; len];
        let mut candle_body = vec![f64::NAN; len];
        let mut candle_direction = Vec::with_capacity(len);
        for i in 0..len {
            let range = high[i] - low[i];
            if range.is_finite() && range != 0.0 {
                pos_no_range[i] = (close[i] - low[i]) / range;
            }
            // f64::max/min ignore a NaN operand, which matches the
            // skip-null body extremum the shadow formulas need.
            upper_shadow[i] = high[i] - open[i].max(close[i]);
            lower_shadow[i] = open[i].min(close[i]) - low[i];
            candle_body[i] = (close[i] - open[i]).abs();
            candle_direction.push(classify_sign(
                close[i] - open[i],
                "bull",
                "bear",
                "doji",
            ));
        }

        let volume_pct_change = self.per_group(&volume, pct_change);

        let volume_median_20 = self.per_group(&volume, |g| rolling_median(g, 20, 3));
        let volume_abs_dev: Vec<f64> = volume
            .iter()
            .zip(volume_median_20.iter())
            .map(|(&v, &m)| (v - m).abs())
            .collect();
        let volume_mad_20 = self.per_group(&volume_abs_dev, |g| rolling_median(g, 20, 3));
        let volume_robust_z_20 = robust_z(&volume, &volume_median_20, &volume_mad_20);

        let avg_trade_price: Vec<f64> = volume_to
            .iter()
            .zip(volume.iter())
            .map(|(&to, &from)| if from == 0.0 { f64::NAN } else { to / from })
            .collect();

        let cum_max = self.per_group(&close, cummax);
        let drawdown: Vec<f64> = close
            .iter()
            .zip(cum_max.iter())
            .map(|(&c, &m)| c / m - 1.0)
            .collect();

        let dates = self.date_column()?;
        let day_of_week: Vec<Option<i32>> = dates
            .iter()
            .map(|d| d.map(|d| d.weekday().num_days_from_monday() as i32))
            .collect();
        let month: Vec<Option<i32>> = dates.iter().map(|d| d.map(|d| d.month() as i32)).collect();

        let close_vs_prev: Vec<&str> = close
            .iter()
            .zip(close_prev.iter())
            .map(|(&c, &p)| classify_sign(c - p, "above", "below", "equal"))
            .collect();
        let volume_vs_prev: Vec<&str> = volume
            .iter()
            .zip(volume_prev.iter())
            .map(|(&v, &p)| classify_sign(v - p, "above", "below", "equal"))
            .collect();

        self.insert_float("pos_no_range", pos_no_range)?;
        self.insert_float("upper_shadow", upper_shadow)?;
        self.insert_float("lower_shadow", lower_shadow)?;
        self.insert_float("candle_body", candle_body)?;
        self.insert_str("candle_direction", candle_direction)?;
        self.insert_float("volume_pct_change", volume_pct_change)?;
        self.insert_float("volume_robust_z_20", volume_robust_z_20)?;
        self.insert_float("avg_trade_price", avg_trade_price)?;
        self.insert_float("cum_max", cum_max)?;
        self.insert_float("drawdown", drawdown)?;
        self.insert_opt_i32("day_of_week", day_of_week)?;
        self.insert_opt_i32("month", month)?;
        self.insert_str("close_vs_prev", close_vs_prev)?;
        self.insert_str("volume_vs_prev", volume_vs_prev)
    }

    /// Mandatory post-pass: every non-finite float cell in the table
    /// becomes a null. This covers the NaNs the stages use as their
    /// working missing marker plus any infinity a division produced.
    fn replace_non_finite_with_null(&mut self) -> Result<()> {
        let names: Vec<String> = self
            .frame
            .get_column_names()
            .iter()
            .map(|s| s.to_string())
            .collect();
        for name in names {
            let series = self
                .frame
                .column(&name)
                .with_context(|| format!("Missing column '{name}' during cleanup"))?;
            if !matches!(series.dtype(), DataType::Float64) {
                continue;
            }
            let ca = series
                .f64()
                .with_context(|| format!("Failed to interpret '{name}' as float"))?;
            let cleaned = Float64Chunked::from_iter_options(
                &name,
                ca.into_iter().map(|opt| opt.filter(|v| v.is_finite())),
            )
            .into_series();
            self.frame
                .with_column(cleaned)
                .with_context(|| format!("Failed to clean column '{name}'"))?;
        }
        Ok(())
    }

    /// Apply `f` to each asset group slice of `values` and stitch the
    /// results back in canonical row order. Groups are independent, so
    /// they are evaluated on the rayon pool; the stitch preserves
    /// determinism.
    fn per_group<F>(&self, values: &[f64], f: F) -> Vec<f64>
    where
        F: Fn(&[f64]) -> Vec<f64> + Sync,
    {
        let mut out = vec![f64::NAN; values.len()];
        let parts: Vec<(Range<usize>, Vec<f64>)> = self
            .groups
            .par_iter()
            .map(|range| (range.clone(), f(&values[range.clone()])))
            .collect();
        for (range, part) in parts {
            out[range].copy_from_slice(&part);
        }
        out
    }

    /// Column as a dense f64 vector with NaN standing in for null.
    fn float_column(&self, name: &str) -> Result<Vec<f64>> {
        Ok(self
            .frame
            .column(name)
            .with_context(|| format!("Missing column '{name}'"))?
            .f64()
            .with_context(|| format!("Failed to interpret '{name}' as float"))?
            .into_iter()
            .map(|v| v.unwrap_or(f64::NAN))
            .collect())
    }

    fn date_column(&self) -> Result<Vec<Option<NaiveDate>>> {
        let ca = self
            .frame
            .column("date")
            .context("Missing 'date' column")?
            .date()
            .context("Failed to interpret 'date' column as dates")?;
        Ok(ca
            .into_iter()
            .map(|opt| {
                opt.and_then(|days| NaiveDate::from_num_days_from_ce_opt(days + EPOCH_DAYS_FROM_CE))
            })
            .collect())
    }

    fn insert_float(&mut self, name: &str, values: Vec<f64>) -> Result<()> {
        let series = Series::new(name, values);
        self.frame
            .with_column(series)
            .with_context(|| format!("Failed to insert column '{name}'"))?;
        Ok(())
    }

    fn insert_str(&mut self, name: &str, values: Vec<&str>) -> Result<()> {
        let series = Series::new(name, values);
        self.frame
            .with_column(series)
            .with_context(|| format!("Failed to insert column '{name}'"))?;
        Ok(())
    }

    fn insert_opt_i32(&mut self, name: &str, values: Vec<Option<i32>>) -> Result<()> {
        let series = Int32Chunked::from_iter_options(name, values.into_iter()).into_series();
        self.frame
            .with_column(series)
            .with_context(|| format!("Failed to insert column '{name}'"))?;
        Ok(())
    }
}

/// Robust z-score: (x - median) / (1.4826 * MAD), null when MAD is
/// zero or missing.
fn robust_z(values: &[f64], median: &[f64], mad: &[f64]) -> Vec<f64> {
    values
        .iter()
        .zip(median.iter().zip(mad.iter()))
        .map(|(&v, (&med, &mad))| {
            if !mad.is_finite() || mad == 0.0 {
                f64::NAN
            } else {
                (v - med) / (MAD_SCALE * mad)
            }
        })
        .collect()
}

/// Greatest of three candidates, skipping NaN terms. NaN only when all
/// three are NaN.
fn nan_max3(a: f64, b: f64, c: f64) -> f64 {
    let mut best = f64::NAN;
    for v in [a, b, c] {
        if v.is_finite() {
            best = if best.is_nan() { v } else { best.max(v) };
        }
    }
    best
}

fn classify_sign(
    delta: f64,
    positive: &'static str,
    negative: &'static str,
    zero: &'static str,
) -> &'static str {
    if delta.is_nan() {
        UNKNOWN_CATEGORY
    } else if delta > 0.0 {
        positive
    } else if delta < 0.0 {
        negative
    } else {
        zero
    }
}
