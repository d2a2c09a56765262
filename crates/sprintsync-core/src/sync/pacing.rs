//! Per-worker minimum spacing between remote calls.

use std::time::Duration;

use tokio::time::Instant;

/// Enforces a minimum gap between consecutive calls made by one worker.
///
/// Each worker owns its own pacer; there is no global rate budget.
#[derive(Debug)]
pub struct Pacer {
    spacing: Duration,
    last: Option<Instant>,
}

impl Pacer {
    pub fn new(spacing: Duration) -> Self {
        Self {
            spacing,
            last: None,
        }
    }

    /// Wait until at least `spacing` has passed since the previous call,
    /// then mark a new call as started.
    pub async fn ready(&mut self) {
        if let Some(last) = self.last {
            let next = last + self.spacing;
            if next > Instant::now() {
                tokio::time::sleep_until(next).await;
            }
        }
        self.last = Some(Instant::now());
    }

    pub fn spacing(&self) -> Duration {
        self.spacing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_call_is_immediate() {
        let mut pacer = Pacer::new(Duration::from_secs(60));
        let start = Instant::now();
        pacer.ready().await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn consecutive_calls_are_spaced() {
        let mut pacer = Pacer::new(Duration::from_millis(40));
        let start = Instant::now();
        for _ in 0..3 {
            pacer.ready().await;
        }
        assert!(start.elapsed() >= Duration::from_millis(80));
    }
}
