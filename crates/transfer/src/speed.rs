use std::collections::VecDeque;
use std::time::{Duration, Instant};

const DEFAULT_WINDOW: Duration = Duration::from_secs(5);
const DEFAULT_MAX_SAMPLES: usize = 100;

/// Sliding-window throughput estimate for one upload.
///
/// Not synchronized; the owner serializes access.
#[derive(Debug)]
pub struct ThroughputWindow {
    samples: VecDeque<(Instant, u64)>,
    window: Duration,
    max_samples: usize,
}

impl Default for ThroughputWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, DEFAULT_MAX_SAMPLES)
    }
}

impl ThroughputWindow {
    pub fn new(window: Duration, max_samples: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            window,
            max_samples: max_samples.max(2),
        }
    }

    /// Records `bytes` completed now.
    pub fn record(&mut self, bytes: u64) {
        self.record_at(bytes, Instant::now());
    }

    /// Records `bytes` completed at `at`. Samples older than the window
    /// (relative to `at`) are dropped.
    pub fn record_at(&mut self, bytes: u64, at: Instant) {
        self.samples.push_back((at, bytes));
        while let Some(&(ts, _)) = self.samples.front() {
            if at.saturating_duration_since(ts) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        while self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
    }

    /// Average bytes/second across the retained samples.
    ///
    /// The first sample only marks the start of the window, so fewer than two
    /// samples, or samples with no elapsed time between them, give 0.
    pub fn bytes_per_second(&self) -> f64 {
        let (Some(&(first, _)), Some(&(last, _))) = (self.samples.front(), self.samples.back())
        else {
            return 0.0;
        };
        let elapsed = last.saturating_duration_since(first);
        if self.samples.len() < 2 || elapsed.is_zero() {
            return 0.0;
        }
        let bytes: u64 = self.samples.iter().skip(1).map(|&(_, b)| b).sum();
        bytes as f64 / elapsed.as_secs_f64()
    }

    /// Estimated time to send `remaining` more bytes, if the rate is known.
    pub fn eta(&self, remaining: u64) -> Option<Duration> {
        let speed = self.bytes_per_second();
        if speed <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining as f64 / speed))
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }
}
