//! Progress reporting in units of locations processed.
//!
//! Assembly cost is dominated by the location-chunk count, not by the
//! number of input files, so progress counts locations.

use std::time::Instant;

use tracing::info;

pub struct ProgressTracker {
    label: String,
    total: usize,
    done: usize,
    last_percent: u32,
    started: Instant,
}

impl ProgressTracker {
    pub fn new(label: impl Into<String>, total: usize) -> Self {
        Self {
            label: label.into(),
            total: total.max(1),
            done: 0,
            last_percent: 0,
            started: Instant::now(),
        }
    }

    /// Record `n` more locations; logs on whole-percent boundaries.
    pub fn add(&mut self, n: usize) {
        self.done += n;
        let percent = (self.done as f64 / self.total as f64 * 100.0) as u32;
        if percent != self.last_percent {
            info!(label = %self.label, percent, "progress");
            self.last_percent = percent;
        }
    }

    pub fn finish(self) {
        info!(
            label = %self.label,
            locations = self.done,
            elapsed_s = self.started.elapsed().as_secs(),
            "done"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_to_completion() {
        let mut progress = ProgressTracker::new("convert temperature_2m", 1000);
        for _ in 0..10 {
            progress.add(100);
        }
        assert_eq!(progress.done, 1000);
        progress.finish();
    }
}
