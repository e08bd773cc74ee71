//! Running estimate of how many bytes a store holds.
//!
//! Writes and removals adjust the guess by their estimated size and widen an
//! error bar to reflect the uncertainty of each adjustment. Full scans yield
//! the real total, which replaces the guess and resets the error bar; the
//! difference is kept as a mistake sample so estimation drift can be
//! observed.

/// Drift between the guess and the real size, sampled at every full scan.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MistakeStats {
    /// Sum of absolute mistakes.
    pub total: f64,
    /// Number of samples.
    pub count: u64,
    /// Largest absolute mistake seen.
    pub max: f64,
    /// Samples whose mistake exceeded the error bar in effect at the time.
    pub outside_error_bar: u64,
}

impl MistakeStats {
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total / self.count as f64
        }
    }

    fn record(&mut self, mistake: f64, error_bar: f64) {
        self.total += mistake;
        self.count += 1;
        self.max = self.max.max(mistake);
        if mistake > error_bar {
            self.outside_error_bar += 1;
        }
    }
}

/// Point-in-time copy of the estimator, for reporting.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SizeStats {
    pub guess: f64,
    pub error_bar: f64,
    /// Updates since the last reconciliation.
    pub age: u32,
    pub last_real_size: f64,
    pub avg_entry_size: f64,
    pub mistakes: MistakeStats,
}

#[derive(Clone, Debug)]
pub struct SizeEstimator {
    guess: f64,
    error_bar: f64,
    age: u32,
    last_real_size: f64,
    avg_entry_size: f64,
    mistakes: MistakeStats,
    freshness_threshold: u32,
}

impl SizeEstimator {
    /// An estimator for an empty store that trusts its guess for
    /// `freshness_threshold` updates.
    pub fn new(freshness_threshold: u32) -> Self {
        Self {
            guess: 0.0,
            error_bar: 0.0,
            age: 0,
            last_real_size: 0.0,
            avg_entry_size: 0.0,
            mistakes: MistakeStats::default(),
            freshness_threshold,
        }
    }

    /// Apply an incremental change.
    pub fn update_size(&mut self, delta: f64, error_delta: f64) {
        self.guess += delta;
        self.error_bar += error_delta;
        self.age = self.age.saturating_add(1);
    }

    /// Replace the guess with the result of a full scan, sampling the mistake
    /// first.
    pub fn reconcile(&mut self, real_size: f64, count: u64) {
        let mistake = (self.guess - real_size).abs();
        self.mistakes.record(mistake, self.error_bar);
        self.set_size(real_size, count);
    }

    /// Set the guess to a known size without sampling.
    pub fn set_size(&mut self, real_size: f64, count: u64) {
        self.guess = real_size;
        self.last_real_size = real_size;
        self.error_bar = 0.0;
        self.age = 0;
        if count > 0 {
            self.avg_entry_size = real_size / count as f64;
        }
    }

    /// Whether the guess is recent enough to answer `get_size` without a
    /// scan.
    pub fn is_fresh(&self) -> bool {
        self.age < self.freshness_threshold
    }

    pub fn guess(&self) -> f64 {
        self.guess
    }

    pub fn error_bar(&self) -> f64 {
        self.error_bar
    }

    pub fn avg_entry_size(&self) -> f64 {
        self.avg_entry_size
    }

    pub fn stats(&self) -> SizeStats {
        SizeStats {
            guess: self.guess,
            error_bar: self.error_bar,
            age: self.age,
            last_real_size: self.last_real_size,
            avg_entry_size: self.avg_entry_size,
            mistakes: self.mistakes,
        }
    }
}
