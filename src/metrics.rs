use std::sync::atomic::{AtomicU64, Ordering};

/// Operation counters for a channel.
///
/// Uses atomic counters with `Relaxed` ordering since these are purely
/// statistical - no control flow depends on exact values, and eventual
/// visibility is acceptable for observability. Each park is counted exactly
/// once, on entry to the futex wait.
#[derive(Debug, Default)]
pub struct Metrics {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    batches_sent: AtomicU64,
    batches_received: AtomicU64,
    producer_parks: AtomicU64,
    consumer_parks: AtomicU64,
}

impl Metrics {
    pub(crate) const fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            batches_sent: AtomicU64::new(0),
            batches_received: AtomicU64::new(0),
            producer_parks: AtomicU64::new(0),
            consumer_parks: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn on_send(&self, n: u64) {
        self.messages_sent.fetch_add(n, Ordering::Relaxed);
        self.batches_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn on_receive(&self, n: u64) {
        self.messages_received.fetch_add(n, Ordering::Relaxed);
        self.batches_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn on_producer_park(&self) {
        self.producer_parks.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn on_consumer_park(&self) {
        self.consumer_parks.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a snapshot of current counter values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            batches_received: self.batches_received.load(Ordering::Relaxed),
            producer_parks: self.producer_parks.load(Ordering::Relaxed),
            consumer_parks: self.consumer_parks.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of channel counters.
///
/// Plain data (`Copy`) for easy aggregation and display.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Items published by producers.
    pub messages_sent: u64,
    /// Items handed to consumers.
    pub messages_received: u64,
    /// Publish operations (a batch of any size counts once).
    pub batches_sent: u64,
    /// Dequeue operations (a batch of any size counts once).
    pub batches_received: u64,
    /// Futex parks taken by blocked producers.
    pub producer_parks: u64,
    /// Futex parks taken by blocked consumers.
    pub consumer_parks: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counts() {
        let m = Metrics::new();
        m.on_send(3);
        m.on_send(1);
        m.on_receive(4);
        m.on_producer_park();

        let s = m.snapshot();
        assert_eq!(s.messages_sent, 4);
        assert_eq!(s.batches_sent, 2);
        assert_eq!(s.messages_received, 4);
        assert_eq!(s.batches_received, 1);
        assert_eq!(s.producer_parks, 1);
        assert_eq!(s.consumer_parks, 0);
    }
}
