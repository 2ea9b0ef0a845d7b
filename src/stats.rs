// =============================================================================
// Rolling statistics helpers
// =============================================================================
//
// Small building blocks shared by the processors: an event-time EWMA with a
// configurable half-life, and a bounded rolling window with mean / std /
// zscore. All of them are driven purely by payload timestamps.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

/// Clamp into the unit interval.
pub fn clamp01(x: f64) -> f64 {
    x.clamp(0.0, 1.0)
}

// =============================================================================
// Event-time EWMA
// =============================================================================

/// Exponentially weighted moving average where the decay is a function of
/// event-time elapsed between samples, parameterised by half-life.
#[derive(Debug, Clone)]
pub struct Ewma {
    half_life_secs: f64,
    value: Option<f64>,
    last_ts: Option<DateTime<Utc>>,
}

impl Ewma {
    pub fn new(half_life_secs: f64) -> Self {
        Self {
            half_life_secs,
            value: None,
            last_ts: None,
        }
    }

    /// Fold one sample at event time `ts`. Out-of-order samples (ts earlier
    /// than the last one) decay nothing and fold with full weight of a
    /// zero-gap sample.
    pub fn update(&mut self, ts: DateTime<Utc>, sample: f64) -> f64 {
        let next = match (self.value, self.last_ts) {
            (Some(prev), Some(last)) => {
                let dt = (ts - last).num_milliseconds().max(0) as f64 / 1000.0;
                let alpha = 1.0 - 0.5_f64.powf(dt / self.half_life_secs);
                prev + alpha * (sample - prev)
            }
            _ => sample,
        };
        self.value = Some(next);
        self.last_ts = Some(ts.max(self.last_ts.unwrap_or(ts)));
        next
    }
}

// =============================================================================
// Rolling window
// =============================================================================

/// Fixed-capacity window of f64 samples with mean / std / zscore.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, sample: f64) {
        self.samples.push_back(sample);
        if self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Ratio of the window that is filled, in [0, 1].
    pub fn fill_ratio(&self) -> f64 {
        if self.capacity == 0 {
            return 1.0;
        }
        self.samples.len() as f64 / self.capacity as f64
    }

    pub fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }

    /// Population standard deviation over the window.
    pub fn std(&self) -> Option<f64> {
        let mean = self.mean()?;
        let n = self.samples.len() as f64;
        let var = self.samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        Some(var.sqrt())
    }

    /// Z-score of `x` against the window. `None` until the window has at
    /// least `min_samples` entries or while variance is degenerate.
    pub fn zscore(&self, x: f64, min_samples: usize) -> Option<f64> {
        if self.samples.len() < min_samples {
            return None;
        }
        let mean = self.mean()?;
        let std = self.std()?;
        if std < f64::EPSILON {
            return None;
        }
        Some((x - mean) / std)
    }
}

// =============================================================================
// Timestamped window
// =============================================================================

/// Window of (ts, value) samples pruned by event-time age. Used for
/// short-horizon deltas (price change over N seconds, rates per minute).
#[derive(Debug, Clone)]
pub struct TimedWindow {
    samples: VecDeque<(DateTime<Utc>, f64)>,
    horizon_secs: i64,
}

impl TimedWindow {
    pub fn new(horizon_secs: i64) -> Self {
        Self {
            samples: VecDeque::new(),
            horizon_secs,
        }
    }

    pub fn push(&mut self, ts: DateTime<Utc>, value: f64) {
        self.samples.push_back((ts, value));
        self.prune(ts);
    }

    /// Drop samples older than the horizon relative to `now`.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - chrono::Duration::seconds(self.horizon_secs);
        while let Some((ts, _)) = self.samples.front() {
            if *ts < cutoff {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Events per minute over the configured horizon.
    pub fn rate_per_min(&self, now: DateTime<Utc>) -> f64 {
        let cutoff = now - chrono::Duration::seconds(self.horizon_secs);
        let n = self.samples.iter().filter(|(ts, _)| *ts >= cutoff).count();
        n as f64 * 60.0 / self.horizon_secs as f64
    }

    /// Sum of the surviving values.
    pub fn sum(&self) -> f64 {
        self.samples.iter().map(|(_, v)| v).sum()
    }

    /// Newest value minus oldest surviving value.
    pub fn delta(&self) -> Option<f64> {
        let first = self.samples.front()?.1;
        let last = self.samples.back()?.1;
        Some(last - first)
    }
}
