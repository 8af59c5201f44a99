use std::time::Duration;
use tokio::time::Instant;

/// Coalesces bursts of fragment updates into at most one publish per interval.
///
/// A skipped update is remembered so the caller can flush it at
/// [`RenderThrottle::deadline`] even if no further fragment arrives.
#[derive(Debug)]
pub struct RenderThrottle {
    interval: Duration,
    last: Option<Instant>,
    pending: bool,
}

impl RenderThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
            pending: false,
        }
    }

    /// Records an update and reports whether it should be published now.
    pub fn ready(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => {
                self.pending = true;
                false
            }
            _ => {
                self.mark_published(now);
                true
            }
        }
    }

    /// When a held-back update is due, if there is one.
    pub fn deadline(&self) -> Option<Instant> {
        if !self.pending {
            return None;
        }
        Some(self.last.map_or_else(Instant::now, |last| last + self.interval))
    }

    pub fn mark_published(&mut self, now: Instant) {
        self.last = Some(now);
        self.pending = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bursts_within_interval_are_held_back() {
        let start = Instant::now();
        let mut throttle = RenderThrottle::new(Duration::from_millis(50));

        assert!(throttle.ready(start));
        assert!(!throttle.ready(start + Duration::from_millis(10)));
        assert!(!throttle.ready(start + Duration::from_millis(30)));
        assert_eq!(throttle.deadline(), Some(start + Duration::from_millis(50)));

        assert!(throttle.ready(start + Duration::from_millis(60)));
        assert_eq!(throttle.deadline(), None);
    }

    #[test]
    fn flush_clears_pending_update() {
        let start = Instant::now();
        let mut throttle = RenderThrottle::new(Duration::from_millis(50));
        throttle.ready(start);
        throttle.ready(start + Duration::from_millis(5));

        throttle.mark_published(start + Duration::from_millis(50));
        assert_eq!(throttle.deadline(), None);
        assert!(!throttle.ready(start + Duration::from_millis(70)));
    }
}
