//! Online standard deviation with a moving window.
//!
//! Welford, B. P. (1962). Note on a Method for Calculating Corrected Sums of
//! Squares and Products. Technometrics, 4(3), 419-420.
//!
//! The rate-capture loop feeds one sample per tick into a [`Welford`]
//! instance; the window holds the last `cycle / frequency` samples and the
//! stability predicate decides when a transfer has settled enough to stop
//! early.

use std::time::Duration;

const MIN_SAMPLES_FOR_VARIANCE: usize = 2;
const STABILITY_THRESHOLD_DIVISOR: usize = 3;
const EWMA_BETA_NUMERATOR: f64 = 2.0;

/// Tunables for the early-termination predicate.
///
/// The defaults are the empirically chosen values the reference
/// implementation uses: a coefficient of variation under 3%, sustained for a
/// third of the window, after at least two full windows of samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StabilityCriteria {
    /// Coefficient-of-variation bound under which a sample counts as stable.
    pub cv_threshold: f64,
    /// Consecutive stable samples required before termination is signalled.
    pub stable_iterations: usize,
    /// Minimum number of updates before termination may be signalled.
    pub min_steps: usize,
}

impl StabilityCriteria {
    /// Default criteria for a window of `window_size` samples.
    pub fn for_window(window_size: usize) -> Self {
        StabilityCriteria {
            cv_threshold: 0.03,
            stable_iterations: window_size / STABILITY_THRESHOLD_DIVISOR,
            min_steps: window_size * 2,
        }
    }
}

/// Fast standard deviation calculation with a moving window, combined with
/// an exponentially weighted moving average of the per-tick values.
#[derive(Debug, Clone)]
pub struct Welford {
    n: usize,
    cap: usize,
    vector: Vec<f64>,
    mean: f64,
    sum: f64,
    erase_index: usize,
    current_std_dev: f64,
    consecutive_stable: usize,
    cv: f64,
    ewma_mean: f64,
    steps: usize,
    beta: f64,
    scale: f64,
    moving_vector: Vec<f64>,
    moving_avg: f64,
    criteria: StabilityCriteria,
}

impl Welford {
    /// Creates a window sized `cycle / frequency` with default stability
    /// criteria.
    ///
    /// `frequency` is the sampling period; `scale` lifts a per-tick byte
    /// delta to a per-second rate.
    pub fn new(cycle: Duration, frequency: Duration) -> Self {
        let window_size = Self::window_size(cycle, frequency);
        Self::with_criteria(
            cycle,
            frequency,
            StabilityCriteria::for_window(window_size),
        )
    }

    /// Creates a window with caller-supplied stability criteria.
    pub fn with_criteria(
        cycle: Duration,
        frequency: Duration,
        criteria: StabilityCriteria,
    ) -> Self {
        let window_size = Self::window_size(cycle, frequency);

        Welford {
            n: 0,
            cap: window_size,
            vector: vec![0.0; window_size],
            mean: 0.0,
            sum: 0.0,
            erase_index: 0,
            current_std_dev: 0.0,
            consecutive_stable: 0,
            cv: 0.0,
            ewma_mean: 0.0,
            steps: 0,
            beta: EWMA_BETA_NUMERATOR / (window_size as f64 + 1.0),
            scale: frequency.as_secs_f64().recip(),
            moving_vector: vec![0.0; window_size],
            moving_avg: 0.0,
            criteria,
        }
    }

    fn window_size(cycle: Duration, frequency: Duration) -> usize {
        let size = (cycle.as_nanos() / frequency.as_nanos().max(1)) as usize;
        size.max(1)
    }

    /// Enters one sample into the measuring system.
    ///
    /// `global_avg` is the running whole-test average rate and feeds the
    /// variance window; `value` is the instantaneous per-tick delta and
    /// feeds the EWMA after being scaled to a per-second rate.
    ///
    /// Returns `true` when the stability predicate holds and the caller
    /// should terminate the transfer early.
    pub fn update(&mut self, global_avg: f64, value: f64) -> bool {
        let value = value * self.scale;

        if self.n == self.cap {
            // Reverse Welford step: retire the oldest sample before the
            // slot is overwritten.
            let delta = self.vector[self.erase_index] - self.mean;
            self.mean -= delta / (self.n as f64 - 1.0);
            self.sum -= delta * (self.vector[self.erase_index] - self.mean);
            // the calc error is approximated to zero
            if self.sum < 0.0 {
                self.sum = 0.0;
            }

            self.vector[self.erase_index] = global_avg;
            self.moving_avg -= self.moving_vector[self.erase_index];
            self.moving_vector[self.erase_index] = value;
            self.moving_avg += value;

            self.erase_index += 1;
            if self.erase_index == self.cap {
                self.erase_index = 0;
            }
        } else {
            self.vector[self.n] = global_avg;
            self.moving_vector[self.n] = value;
            self.moving_avg += value;
            self.n += 1;
        }

        let delta = global_avg - self.mean;
        self.mean += delta / self.n as f64;
        self.sum += delta * (global_avg - self.mean);
        self.current_std_dev = self.variance().sqrt();
        if self.mean != 0.0 {
            self.cv = self.current_std_dev / self.mean;
        }

        self.ewma_mean =
            value * self.beta + self.ewma_mean * (1.0 - self.beta);

        if self.n == self.cap && self.cv < self.criteria.cv_threshold {
            self.consecutive_stable += 1;
        } else if self.consecutive_stable > 0 {
            self.consecutive_stable -= 1;
        }

        self.steps += 1;

        self.consecutive_stable >= self.criteria.stable_iterations
            && self.steps > self.criteria.min_steps
    }

    /// Current mean of the windowed global averages.
    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Coefficient of variation of the window.
    pub fn cv(&self) -> f64 {
        self.cv
    }

    /// Sample variance over the window; 0 until two samples are present.
    pub fn variance(&self) -> f64 {
        if self.n < MIN_SAMPLES_FOR_VARIANCE {
            return 0.0;
        }

        self.sum / (self.n as f64 - 1.0)
    }

    /// Current standard deviation of the window.
    pub fn standard_deviation(&self) -> f64 {
        self.current_std_dev
    }

    /// Reported rate: the EWMA blended half-and-half with the plain window
    /// mean, deliberately less reactive than the EWMA alone.
    pub fn ewma(&self) -> f64 {
        if self.n == 0 {
            return 0.0;
        }

        self.ewma_mean * 0.5 + self.moving_avg / self.n as f64 * 0.5
    }
}

impl std::fmt::Display for Welford {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Mean: {:.2}, Standard Deviation: {:.2}, C.V: {:.2}, EWMA: {:.2}",
            self.mean(),
            self.standard_deviation(),
            self.cv(),
            self.ewma()
        )
    }
}
