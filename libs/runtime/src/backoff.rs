//! Exponential backoff for requeued reconcile keys and reconnects.

use std::time::Duration;

/// Exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Delay for the first retry.
    pub initial: Duration,

    /// Delay cap.
    pub cap: Duration,

    /// Jitter factor applied symmetrically (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            cap: Duration::from_secs(60),
            jitter: 0.2,
        }
    }
}

impl Backoff {
    /// Delay for the given attempt number (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31) as i32;
        let delay = self.initial.as_millis() as f64 * 2.0_f64.powi(exponent);
        let delay = delay.min(self.cap.as_millis() as f64);

        let spread = delay * self.jitter;
        let jittered = (delay + rand_jitter(spread)).max(0.0);

        Duration::from_millis(jittered as u64)
    }
}

/// Basic LCG jitter in `[-range, range]`, seeded from the clock; avoids an
/// RNG dependency for a non-cryptographic use.
fn rand_jitter(range: f64) -> f64 {
    use std::time::SystemTime;

    let seed = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let random = seed.wrapping_mul(6364136223846793005).wrapping_add(1) as f64;
    let normalized = (random / u64::MAX as f64) * 2.0 - 1.0;

    normalized * range
}
