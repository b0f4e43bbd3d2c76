use filecomp_common::ProgressEvent;
use std::time::{Duration, Instant};

/// Receiver of progress events
pub trait ProgressSink {
    fn report(&mut self, event: ProgressEvent);
}

impl<F: FnMut(ProgressEvent)> ProgressSink for F {
    fn report(&mut self, event: ProgressEvent) {
        self(event)
    }
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&mut self, _event: ProgressEvent) {}
}

/// Time gate keeping progress events at least `interval` apart
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    last: Instant,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Instant::now(),
        }
    }

    /// Forward an event built by `event` if the interval has elapsed
    pub fn update<F>(&mut self, sink: &mut dyn ProgressSink, event: F)
    where
        F: FnOnce() -> ProgressEvent,
    {
        let now = Instant::now();
        if now.duration_since(self.last) >= self.interval {
            self.last = now;
            sink.report(event());
        }
    }
}

/// Percentage of `done` out of `total`, 100 for an empty total
pub fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((u128::from(done.min(total)) * 100) / u128::from(total)) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent() {
        assert_eq!(percent(0, 0), 100);
        assert_eq!(percent(1, 4), 25);
        assert_eq!(percent(10, 4), 100);
        assert_eq!(percent(u64::MAX / 2, u64::MAX), 49);
    }

    #[test]
    fn test_throttle_gates_events() {
        let mut events = Vec::new();
        let mut sink = |event: ProgressEvent| events.push(event);

        let mut throttle = ProgressThrottle::new(Duration::from_secs(3600));
        throttle.update(&mut sink, || ProgressEvent { percent: 1, changes: 0 });

        let mut eager = ProgressThrottle::new(Duration::ZERO);
        eager.update(&mut sink, || ProgressEvent { percent: 2, changes: 0 });

        assert_eq!(events, vec![ProgressEvent { percent: 2, changes: 0 }]);
    }
}
