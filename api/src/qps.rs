use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Requests-per-second counter. `rotate` closes the current one-second
/// window; `current` reports the last closed window and `max` the busiest.
#[derive(Debug, Default)]
pub struct Qps {
    counter: AtomicU64,
    current: AtomicU64,
    max: AtomicU64,
}

impl Qps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self) {
        self.counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rotate(&self) {
        let count = self.counter.swap(0, Ordering::Relaxed);
        self.current.store(count, Ordering::Relaxed);
        self.max.fetch_max(count, Ordering::Relaxed);
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn max(&self) -> u64 {
        self.max.load(Ordering::Relaxed)
    }

    /// Rotates once a second, forever.
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;
        loop {
            interval.tick().await;
            self.rotate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_tracks_current_and_max() {
        let qps = Qps::new();
        for _ in 0..5 {
            qps.increment();
        }
        qps.rotate();
        assert_eq!((qps.current(), qps.max()), (5, 5));

        qps.increment();
        qps.rotate();
        assert_eq!((qps.current(), qps.max()), (1, 5));

        qps.rotate();
        assert_eq!((qps.current(), qps.max()), (0, 5));
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_rotates_every_second() {
        let qps = std::sync::Arc::new(Qps::new());
        let ticker = {
            let qps = qps.clone();
            tokio::spawn(async move { qps.run().await })
        };
        tokio::task::yield_now().await;

        qps.increment();
        qps.increment();
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(qps.current(), 2);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(qps.current(), 0);
        assert_eq!(qps.max(), 2);
        ticker.abort();
    }
}
