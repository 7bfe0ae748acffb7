//! Statistical helpers used for per-task aggregates and group folding.

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Seed used for every bootstrap resampling, so standard errors are reproducible.
pub const BOOTSTRAP_SEED: u64 = 1234;

/// Computes the mean of a slice of data.
pub fn mean(data: &[f64]) -> Option<f64> {
    if data.is_empty() {
        return None;
    }
    Some(data.iter().sum::<f64>() / data.len() as f64)
}

/// Computes the median of a slice of data, averaging the two middle values for even lengths.
pub fn median(data: &[f64]) -> Option<f64> {
    if data.is_empty() {
        return None;
    }
    let mut sorted = data.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Standard deviation with Bessel's correction. Needs at least two values.
pub fn sample_std_deviation(data: &[f64]) -> Option<f64> {
    if data.len() < 2 {
        return None;
    }
    let data_mean = mean(data)?;
    let variance = data
        .iter()
        .map(|value| {
            let diff = data_mean - value;
            diff * diff
        })
        .sum::<f64>()
        / (data.len() - 1) as f64;
    Some(variance.sqrt())
}

/// Closed-form standard error of the mean.
pub fn mean_stderr(data: &[f64]) -> Option<f64> {
    sample_std_deviation(data).map(|std_dev| std_dev / (data.len() as f64).sqrt())
}

/// Estimates the standard error of `statistic` by resampling `items` with replacement
/// `iterations` times.
pub fn bootstrap_stderr<T: Clone>(
    items: &[T],
    iterations: usize,
    statistic: impl Fn(&[T]) -> Result<f64>,
) -> Result<Option<f64>> {
    if items.len() < 2 || iterations == 0 {
        return Ok(None);
    }
    let mut rng = StdRng::seed_from_u64(BOOTSTRAP_SEED);
    let mut resample = Vec::with_capacity(items.len());
    let mut estimates = Vec::with_capacity(iterations);
    for _ in 0..iterations {
        resample.clear();
        for _ in 0..items.len() {
            resample.push(items[rng.random_range(0..items.len())].clone());
        }
        estimates.push(statistic(&resample)?);
    }
    Ok(sample_std_deviation(&estimates))
}

/// Pools per-subtask standard errors into one group standard error.
///
/// Each subtask contributes `(size - 1) * stderr^2 * size` to the pooled variance, which is
/// normalized by `sum(sizes) - n` and then by `sum(sizes)`.
pub fn pooled_sample_stderr(stderrs: &[f64], sizes: &[usize]) -> Option<f64> {
    if stderrs.len() != sizes.len() || stderrs.is_empty() {
        return None;
    }
    let total: usize = sizes.iter().sum();
    if total <= sizes.len() {
        return None;
    }
    let pooled_variance = stderrs
        .iter()
        .zip(sizes)
        .map(|(stderr, size)| {
            let size = *size as f64;
            (size - 1.0) * stderr * stderr * size
        })
        .sum::<f64>()
        / (total - sizes.len()) as f64;
    Some((pooled_variance / total as f64).sqrt())
}

/// Mean of subtask metrics, weighted by subtask size when `weight_by_size` is set.
pub fn aggregate_subtask_metrics(
    metrics: &[f64],
    sizes: &[usize],
    weight_by_size: bool,
) -> Option<f64> {
    if metrics.len() != sizes.len() || metrics.is_empty() {
        return None;
    }
    let weights: Vec<f64> = if weight_by_size {
        sizes.iter().map(|size| *size as f64).collect()
    } else {
        vec![1.0; sizes.len()]
    };
    let total_weight: f64 = weights.iter().sum();
    if total_weight == 0.0 {
        return None;
    }
    Some(
        metrics
            .iter()
            .zip(&weights)
            .map(|(metric, weight)| metric * weight)
            .sum::<f64>()
            / total_weight,
    )
}

/// One aggregated metric, as reported in logs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricSummary {
    pub value: f64,
    pub stderr: Option<f64>,
    pub count: usize,
}

impl std::fmt::Display for MetricSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.stderr {
            Some(stderr) => write!(f, "{:.4} ± {:.4} (n={})", self.value, stderr, self.count),
            None => write!(f, "{:.4} (n={})", self.value, self.count),
        }
    }
}
