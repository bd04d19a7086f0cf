//! Statistics over latency and rate sample sequences.
//!
//! Latency probers report nanosecond RTT vectors; the helpers here reduce
//! them with the population formula the reference methodology prescribes.
//! The two filters operate on raw per-tick byte deltas collected by the
//! rate-capture loop and are diagnostic only: the reported rate always comes
//! from the EWMA path.

/// Summary of a latency sample vector, all values in the input's unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencyStats {
    pub mean: i64,
    pub variance: i64,
    pub std_dev: i64,
    pub min: i64,
    pub max: i64,
}

/// Computes mean, population variance, standard deviation, min and max of a
/// sample vector. Returns the zero summary for an empty input.
pub fn standard_deviation(vector: &[i64]) -> LatencyStats {
    if vector.is_empty() {
        return LatencyStats::default();
    }

    let mut sum: i64 = 0;
    let mut min = i64::MAX;
    let mut max = i64::MIN;

    for &value in vector {
        sum += value;
        min = min.min(value);
        max = max.max(value);
    }

    let mean = sum / vector.len() as i64;

    let accumulate: i64 =
        vector.iter().map(|&v| (v - mean) * (v - mean)).sum();
    let variance = accumulate / vector.len() as i64;
    let std_dev = (variance as f64).sqrt() as i64;

    LatencyStats { mean, variance, std_dev, min, max }
}

/// Median-averaging filter: sorts ascending, drops the two extreme values
/// and returns the arithmetic mean of the remainder.
///
/// Inputs with fewer than three samples reduce to 0, matching the exclusion
/// count.
pub fn calc_ma_filter(list: &[i64]) -> f64 {
    const EXCLUSION_COUNT: usize = 2;

    if list.len() <= EXCLUSION_COUNT {
        return 0.0;
    }

    let mut sorted = list.to_vec();
    sorted.sort_unstable();

    let sum: i64 = sorted[1..sorted.len() - 1].iter().sum();

    sum as f64 / (list.len() - EXCLUSION_COUNT) as f64
}

/// Pauta (3-sigma) filter: keeps only the samples within three standard
/// deviations of the mean.
pub fn pauta_filter(vector: &[i64]) -> Vec<i64> {
    const OUTLIER_THRESHOLD_FACTOR: i64 = 3;

    if vector.is_empty() {
        return Vec::new();
    }

    let (mean, std_dev) = sample_variance(vector);

    vector
        .iter()
        .copied()
        .filter(|&value| {
            (value - mean).abs() < OUTLIER_THRESHOLD_FACTOR * std_dev
        })
        .collect()
}

/// Sample mean and standard deviation with Bessel's correction.
///
/// Returns `(mean, 0)` for inputs too small to carry a variance.
pub fn sample_variance(vector: &[i64]) -> (i64, i64) {
    if vector.is_empty() {
        return (0, 0);
    }

    let sum: i64 = vector.iter().sum();
    let mean = sum / vector.len() as i64;

    if vector.len() < 2 {
        return (mean, 0);
    }

    let accumulate: i64 =
        vector.iter().map(|&v| (v - mean) * (v - mean)).sum();
    let variance = accumulate / (vector.len() as i64 - 1);

    (mean, (variance as f64).sqrt() as i64)
}
