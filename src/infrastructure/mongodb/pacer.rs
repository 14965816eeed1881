use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

const INITIAL_UNITS_PER_DOCUMENT: f64 = 10.0;
const MIN_WAIT: Duration = Duration::from_millis(1);

// Token bucket over request units. Overspend stays on the bucket as debt.
#[derive(Debug)]
pub struct ThroughputPacer {
    budget: f64,
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    available: f64,
    last_refill: Instant,
    units_per_document: f64,
}

impl Bucket {
    fn refill(&mut self, budget: f64, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.available = (self.available + budget * elapsed).min(budget);
        self.last_refill = now;
    }
}

impl ThroughputPacer {
    pub fn new(budget_per_second: u32) -> Self {
        let budget = f64::from(budget_per_second);
        Self {
            budget,
            bucket: Mutex::new(Bucket {
                available: budget,
                last_refill: Instant::now(),
                units_per_document: INITIAL_UNITS_PER_DOCUMENT,
            }),
        }
    }

    pub async fn acquire(&self, documents: usize) -> f64 {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
                bucket.refill(self.budget, Instant::now());
                if bucket.available >= 0.0 {
                    let reserved = bucket.units_per_document * documents as f64;
                    bucket.available -= reserved;
                    return reserved;
                }
                Duration::from_secs_f64(-bucket.available / self.budget).max(MIN_WAIT)
            };
            debug!("Throughput budget in debt, waiting {:?}", wait);
            tokio::time::sleep(wait).await;
        }
    }

    pub fn settle(&self, documents: usize, reserved: f64, actual: f64) {
        let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
        bucket.refill(self.budget, Instant::now());
        bucket.available += reserved - actual;
        if actual > 0.0 && documents > 0 {
            bucket.units_per_document = actual / documents as f64;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn under_budget_does_not_wait() {
        let pacer = ThroughputPacer::new(4000);
        let reserved = pacer.acquire(10).await;
        pacer.settle(10, reserved, 1000.0);

        let start = Instant::now();
        pacer.acquire(10).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn overspend_is_carried_across_seconds() {
        let pacer = ThroughputPacer::new(4000);

        let start = Instant::now();
        for _ in 0..5 {
            let reserved = pacer.acquire(1).await;
            pacer.settle(1, reserved, 12000.0);
        }

        // 60000 RU at 4000 RU/s with a full bucket to start from.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(11), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn reservations_hold_back_concurrent_batches() {
        let pacer = ThroughputPacer::new(1000);
        assert_eq!(pacer.acquire(50).await, 500.0);
        assert_eq!(pacer.acquire(100).await, 1000.0);

        let start = Instant::now();
        pacer.acquire(1).await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(500), "waited {waited:?}");
        assert!(waited < Duration::from_millis(600), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn unreported_charge_releases_the_reservation() {
        let pacer = ThroughputPacer::new(100);
        let reserved = pacer.acquire(20).await;
        pacer.settle(20, reserved, 0.0);

        let start = Instant::now();
        pacer.acquire(1).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
