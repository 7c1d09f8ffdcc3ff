use std::time::Duration;

use anyhow::{bail, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

/// Closed interval of pause lengths, sampled uniformly.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Window {
    min: Duration,
    max: Duration,
}

impl Window {
    pub fn new(min: Duration, max: Duration) -> Result<Self> {
        if min > max {
            bail!("pause window min {:?} exceeds max {:?}", min, max);
        }
        Ok(Self { min, max })
    }

    pub fn from_secs(min: f64, max: f64) -> Result<Self> {
        if !(min.is_finite() && max.is_finite()) || min < 0.0 {
            bail!("invalid pause window [{}, {}]", min, max);
        }
        Self::new(Duration::from_secs_f64(min), Duration::from_secs_f64(max))
    }

    pub fn sample(&self, rng: &mut impl Rng) -> Duration {
        let secs = rng.gen_range(self.min.as_secs_f64()..=self.max.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    #[cfg(test)]
    pub fn contains(&self, d: Duration) -> bool {
        // f64 round trip can land a nanosecond outside either bound
        let slack = Duration::from_nanos(1);
        d + slack >= self.min && d <= self.max + slack
    }
}

/// How often a row may be tried and how long to wait between calls.
///
/// A failed row is not retried in the same run; it stays pending for the next one.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts_per_run: u32,
    pub row_pause: Window,
    pub session_pause: Window,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts_per_run: 1,
            row_pause: Window {
                min: Duration::from_secs(5),
                max: Duration::from_secs(9),
            },
            session_pause: Window {
                min: Duration::from_secs(1),
                max: Duration::from_secs(2),
            },
        }
    }
}

/// Spaces out consecutive external calls: N calls incur N-1 pauses.
pub struct Pacer {
    label: &'static str,
    window: Window,
    rng: StdRng,
    calls: u64,
    pauses: Vec<Duration>,
}

impl Pacer {
    pub fn new(label: &'static str, window: Window) -> Self {
        Self::with_rng(label, window, StdRng::from_entropy())
    }

    pub fn with_rng(label: &'static str, window: Window, rng: StdRng) -> Self {
        Self {
            label,
            window,
            rng,
            calls: 0,
            pauses: Vec::new(),
        }
    }

    /// Wait before the next call. The first call goes out immediately.
    pub async fn before_call(&mut self) {
        if self.calls > 0 {
            let pause = self.window.sample(&mut self.rng);
            debug!(
                pacer = self.label,
                "Halting for {:.2}s to protect the catalog service",
                pause.as_secs_f64()
            );
            tokio::time::sleep(pause).await;
            self.pauses.push(pause);
        }
        self.calls += 1;
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }

    pub fn pauses(&self) -> &[Duration] {
        &self.pauses
    }
}
