//! Single-producer single-consumer channel.
//!
//! The cheapest topology: one shared tail, one head, no CAS anywhere. Both
//! handles are unique and cache the opposing index locally, so the hot path
//! of each side touches the other side's cache line only when its local view
//! runs out.

use crate::sender::SpShared;
use crate::{Backoff, ChannelError, MetricsSnapshot};
use std::ptr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

pub use crate::sender::Sender;

/// Creates a bounded SPSC channel with at least `capacity` slots (rounded up
/// to a power of two).
pub fn channel<T: Send>(capacity: usize) -> Result<(Sender<T>, Receiver<T>), ChannelError> {
    let shared = Arc::new(SpShared::new(capacity)?);
    Ok((
        Sender::new(Arc::clone(&shared)),
        Receiver {
            shared,
            cached_tail: 0,
        },
    ))
}

/// Consuming half of an SPSC channel. Unique; all operations take
/// `&mut self`.
pub struct Receiver<T> {
    shared: Arc<SpShared<T>>,
    /// Local view of the producer tail; refreshed from the shared tail only
    /// when exhausted.
    cached_tail: u64,
}

unsafe impl<T: Send> Send for Receiver<T> {}

impl<T> Receiver<T> {
    /// Published items past `head`, refreshing the cached tail when the
    /// cached view cannot cover `want`.
    #[inline]
    fn available(&mut self, head: u64, want: usize) -> usize {
        let avail = self.cached_tail.wrapping_sub(head) as usize;
        if avail >= want {
            return avail;
        }
        self.cached_tail = self.shared.tail.load(Ordering::Acquire);
        self.cached_tail.wrapping_sub(head) as usize
    }

    /// Removes one item without blocking. `None` means empty.
    pub fn try_recv(&mut self) -> Option<T> {
        let head = self.shared.head.load(Ordering::Relaxed);
        if self.available(head, 1) == 0 {
            return None;
        }
        // SAFETY: `head` is below the acquired tail, so the slot was
        // published; we are the only consumer.
        let value = unsafe { ptr::read(self.shared.ring.slot(head)) };
        self.shared.head.store(head.wrapping_add(1), Ordering::Release);
        self.shared.metrics.on_receive(1);
        self.shared.producer_waiters.wake_all();
        Some(value)
    }

    /// Removes one item, blocking while the channel is empty.
    ///
    /// `None` is terminal: the channel was closed and every published item
    /// has been drained.
    pub fn recv(&mut self) -> Option<T> {
        let shared = Arc::clone(&self.shared);
        recv_blocking(&shared, || self.try_recv())
    }

    /// Drains up to `out.len()` items in order with a single head advance.
    /// Returns the count drained (possibly 0).
    pub fn try_recv_batch(&mut self, out: &mut [T]) -> usize
    where
        T: Copy,
    {
        if out.is_empty() {
            return 0;
        }
        let head = self.shared.head.load(Ordering::Relaxed);
        let n = self.available(head, out.len()).min(out.len());
        if n == 0 {
            return 0;
        }
        let ((p0, n0), (p1, n1)) = self.shared.ring.wrap_split(head, n);
        // SAFETY: the n slots past `head` are published and stable until we
        // advance the head.
        unsafe {
            ptr::copy_nonoverlapping(p0, out.as_mut_ptr(), n0);
            ptr::copy_nonoverlapping(p1, out.as_mut_ptr().add(n0), n1);
        }
        self.shared.head.store(head.wrapping_add(n as u64), Ordering::Release);
        self.shared.metrics.on_receive(n as u64);
        self.shared.producer_waiters.wake_all();
        n
    }

    /// Blocking batch drain: parks while empty, returns after the first
    /// nonzero batch. 0 is terminal (closed and drained).
    pub fn recv_batch(&mut self, out: &mut [T]) -> usize
    where
        T: Copy,
    {
        if out.is_empty() {
            return 0;
        }
        let shared = Arc::clone(&self.shared);
        recv_blocking(&shared, || {
            let n = self.try_recv_batch(out);
            (n > 0).then_some(n)
        })
        .unwrap_or(0)
    }

    /// Capacity of the ring (slots).
    #[inline]
    pub fn capacity(&self) -> usize {
        self.shared.ring.capacity()
    }

    /// Number of published, unconsumed items.
    #[inline]
    pub fn len(&self) -> usize {
        self.shared.len()
    }

    /// True when no items are buffered.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes the channel and wakes blocked parties on both sides.
    pub fn close(&self) {
        self.shared.close();
    }

    /// True once the channel has been closed.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Snapshot of the channel's operation counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        // The consuming side is gone; fail further sends and wake blocked
        // producers.
        self.shared.close();
    }
}

/// Shared blocking loop for the single-tail consumers: retry with backoff,
/// park on the consumer futex word past the threshold, and treat
/// closed-and-drained as terminal.
pub(crate) fn recv_blocking<T, R>(
    shared: &SpShared<T>,
    mut attempt: impl FnMut() -> Option<R>,
) -> Option<R> {
    let mut backoff = Backoff::new();
    loop {
        if let Some(v) = attempt() {
            return Some(v);
        }
        if shared.is_closed() {
            // One final drain: items may have been published between the
            // failed attempt and the close.
            return attempt();
        }
        if backoff.should_park() {
            let expected = shared.consumer_waiters.announce();
            if let Some(v) = attempt() {
                shared.consumer_waiters.retract();
                return Some(v);
            }
            if shared.is_closed() {
                shared.consumer_waiters.retract();
                return attempt();
            }
            shared.metrics.on_consumer_park();
            shared.consumer_waiters.park(expected);
            shared.consumer_waiters.retract();
            backoff.reset();
        } else {
            backoff.spin();
        }
    }
}
