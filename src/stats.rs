//! Descriptive statistics over agreement scores.

use serde::Serialize;

/// Arithmetic mean, `None` for an empty slice.
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Population standard deviation, `None` for an empty slice.
pub fn std_dev(values: &[f64]) -> Option<f64> {
    let m = mean(values)?;
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    Some(var.sqrt())
}

/// Linear-interpolated percentile (`q` in [0, 100]) of unsorted values.
pub fn percentile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let rank = (q.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

pub fn median(values: &[f64]) -> Option<f64> {
    percentile(values, 50.0)
}

/// Spread below this counts as none; absorbs rounding in identical values.
const MIN_SPREAD: f64 = 1e-12;

/// Standard score of `value` against a cohort mean and standard deviation.
///
/// Undefined when the cohort has no spread.
pub fn z_score(value: f64, cohort_mean: f64, cohort_std: f64) -> Option<f64> {
    if !cohort_std.is_finite() || cohort_std <= MIN_SPREAD {
        return None;
    }
    Some((value - cohort_mean) / cohort_std)
}

/// Summary of a set of agreement observations.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Distribution {
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub p10: f64,
    pub p90: f64,
}

impl Distribution {
    /// Summarize the values, `None` when there is nothing to summarize.
    pub fn from_values(values: &[f64]) -> Option<Self> {
        let mean = mean(values)?;
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Some(Self {
            count: values.len(),
            mean,
            median: median(values)?,
            std_dev: std_dev(values)?,
            min,
            max,
            p10: percentile(values, 10.0)?,
            p90: percentile(values, 90.0)?,
        })
    }
}
