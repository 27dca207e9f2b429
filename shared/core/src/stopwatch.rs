use std::time::{Duration, Instant};

/// Measures elapsed wall time across any number of start/stop intervals.
#[derive(Debug, Default, Clone)]
pub struct Stopwatch {
    started_at: Option<Instant>,
    accumulated: Duration,
}

impl Stopwatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn started() -> Self {
        let mut stopwatch = Self::new();
        stopwatch.start();
        stopwatch
    }

    /// No-op if already running.
    pub fn start(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(Instant::now());
        }
    }

    pub fn stop(&mut self) {
        if let Some(started_at) = self.started_at.take() {
            self.accumulated += started_at.elapsed();
        }
    }

    pub fn reset(&mut self) {
        self.accumulated = Duration::ZERO;
        if self.started_at.is_some() {
            self.started_at = Some(Instant::now());
        }
    }

    pub fn is_running(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn elapsed(&self) -> Duration {
        self.accumulated
            + self
                .started_at
                .map(|started_at| started_at.elapsed())
                .unwrap_or_default()
    }

    /// Runs `f`, counting only the time spent inside it.
    pub fn time<T>(&mut self, f: impl FnOnce() -> T) -> T {
        self.start();
        let out = f();
        self.stop();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stopped_watch_does_not_advance() {
        let mut watch = Stopwatch::started();
        std::thread::sleep(Duration::from_millis(5));
        watch.stop();
        let frozen = watch.elapsed();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(watch.elapsed(), frozen);
        assert!(frozen >= Duration::from_millis(5));
    }

    #[test]
    fn reset_clears_accumulated_time() {
        let mut watch = Stopwatch::new();
        watch.time(|| std::thread::sleep(Duration::from_millis(2)));
        assert!(watch.elapsed() > Duration::ZERO);
        watch.reset();
        assert_eq!(watch.elapsed(), Duration::ZERO);
        assert!(!watch.is_running());
    }
}
