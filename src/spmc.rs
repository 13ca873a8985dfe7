//! Single-producer multi-consumer channel.
//!
//! The producer side is identical to SPSC (one shared tail, release
//! publishes). Consumers compete for the head with a weak CAS; only the
//! winner of a position reads its slot. The try path bounds its CAS retries
//! so it stays non-blocking under contention — a `None` from `try_recv` can
//! mean "empty" or "lost the race a few times"; callers poll or use the
//! blocking variant.

use crate::sender::SpShared;
use crate::{Backoff, ChannelError, MetricsSnapshot};
use std::hint;
use std::ptr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

pub use crate::sender::Sender;

/// CAS attempts per try-operation before yielding back to the caller.
const CAS_ATTEMPTS: usize = 8;

/// Creates a bounded SPMC channel with at least `capacity` slots (rounded up
/// to a power of two). Clone the receiver for every additional consumer.
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

/// Consuming half of an SPMC channel.
///
/// Cloneable; each clone may live on its own thread. Consumers race on the
/// head, so which consumer obtains which item is unspecified — global
/// insertion order is preserved across the union of all consumers.
pub struct Receiver<T> {
    shared: Arc<SpShared<T>>,
    /// Local view of the producer tail; purely an optimization, refreshed
    /// whenever it cannot justify a dequeue.
    cached_tail: u64,
}

unsafe impl<T: Send> Send for Receiver<T> {}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        self.shared.receivers.fetch_add(1, Ordering::AcqRel);
        Self {
            shared: Arc::clone(&self.shared),
            cached_tail: self.cached_tail,
        }
    }
}

impl<T> Receiver<T> {
    /// Removes one item without blocking.
    ///
    /// `None` when the channel is empty, or occasionally under heavy
    /// consumer contention (bounded CAS retries).
    pub fn try_recv(&mut self) -> Option<T> {
        for _ in 0..CAS_ATTEMPTS {
            let head = self.shared.head.load(Ordering::Relaxed);
            if self.cached_tail.wrapping_sub(head) as i64 <= 0 {
                self.cached_tail = self.shared.tail.load(Ordering::Acquire);
                if self.cached_tail == head {
                    return None;
                }
            }
            match self.shared.head.compare_exchange_weak(
                head,
                head.wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    // SAFETY: we won position `head`; it was published
                    // (below the acquired tail). The producer cannot reuse
                    // the slot until the head has moved a full capacity past
                    // it, which cannot happen while we hold this position's
                    // claim window.
                    let value = unsafe { ptr::read(self.shared.ring.slot(head)) };
                    self.shared.metrics.on_receive(1);
                    self.shared.producer_waiters.wake_all();
                    return Some(value);
                }
                Err(_) => hint::spin_loop(),
            }
        }
        None
    }

    /// Removes one item, blocking while the channel is empty.
    ///
    /// `None` is terminal: the channel was closed and drained.
    pub fn recv(&mut self) -> Option<T> {
        let mut backoff = Backoff::new();
        loop {
            if let Some(v) = self.try_recv() {
                return Some(v);
            }
            if self.shared.is_closed() && self.drained() {
                return self.try_recv();
            }
            if backoff.should_park() {
                let expected = self.shared.consumer_waiters.announce();
                if let Some(v) = self.try_recv() {
                    self.shared.consumer_waiters.retract();
                    return Some(v);
                }
                if self.shared.is_closed() && self.drained() {
                    self.shared.consumer_waiters.retract();
                    return self.try_recv();
                }
                if !self.drained() {
                    // The miss was CAS contention, not emptiness; other
                    // consumers are making progress, so parking could sleep
                    // through the last items. Keep polling instead.
                    self.shared.consumer_waiters.retract();
                    backoff.reset();
                    continue;
                }
                self.shared.metrics.on_consumer_park();
                self.shared.consumer_waiters.park(expected);
                self.shared.consumer_waiters.retract();
                backoff.reset();
            } else {
                backoff.spin();
            }
        }
    }

    /// Claims and drains up to `out.len()` consecutive items with one CAS.
    ///
    /// The copy happens before the claim; a lost race discards the copy and
    /// retries with a fresh head, so winners never hand out torn values.
    pub fn try_recv_batch(&mut self, out: &mut [T]) -> usize
    where
        T: Copy,
    {
        if out.is_empty() {
            return 0;
        }
        for _ in 0..CAS_ATTEMPTS {
            let head = self.shared.head.load(Ordering::Relaxed);
            let mut avail = self.cached_tail.wrapping_sub(head) as i64;
            if avail <= 0 || (avail as usize) < out.len() {
                self.cached_tail = self.shared.tail.load(Ordering::Acquire);
                avail = self.cached_tail.wrapping_sub(head) as i64;
                if avail <= 0 {
                    return 0;
                }
            }
            let n = (avail as usize).min(out.len());
            let ((p0, n0), (p1, n1)) = self.shared.ring.wrap_split(head, n);
            // SAFETY: a racing consumer may advance the head and let the
            // producer overwrite these slots mid-copy; the CAS below fails
            // in exactly that case and the copied bytes are discarded.
            // T: Copy, so a torn discarded copy carries no obligations.
            unsafe {
                ptr::copy_nonoverlapping(p0, out.as_mut_ptr(), n0);
                ptr::copy_nonoverlapping(p1, out.as_mut_ptr().add(n0), n1);
            }
            match self.shared.head.compare_exchange_weak(
                head,
                head.wrapping_add(n as u64),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.shared.metrics.on_receive(n as u64);
                    self.shared.producer_waiters.wake_all();
                    return n;
                }
                Err(_) => hint::spin_loop(),
            }
        }
        0
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
        let mut backoff = Backoff::new();
        loop {
            let n = self.try_recv_batch(out);
            if n > 0 {
                return n;
            }
            if self.shared.is_closed() && self.drained() {
                return self.try_recv_batch(out);
            }
            if backoff.should_park() {
                let expected = self.shared.consumer_waiters.announce();
                let n = self.try_recv_batch(out);
                if n > 0 {
                    self.shared.consumer_waiters.retract();
                    return n;
                }
                if self.shared.is_closed() && self.drained() {
                    self.shared.consumer_waiters.retract();
                    return self.try_recv_batch(out);
                }
                if !self.drained() {
                    // Contention, not emptiness; see `recv`.
                    self.shared.consumer_waiters.retract();
                    backoff.reset();
                    continue;
                }
                self.shared.metrics.on_consumer_park();
                self.shared.consumer_waiters.park(expected);
                self.shared.consumer_waiters.retract();
                backoff.reset();
            } else {
                backoff.spin();
            }
        }
    }

    /// True when every published item has been claimed (fresh loads, not the
    /// local cache).
    fn drained(&self) -> bool {
        let tail = self.shared.tail.load(Ordering::Acquire);
        let head = self.shared.head.load(Ordering::Acquire);
        tail == head
    }

    /// Capacity of the ring (slots).
    #[inline]
    pub fn capacity(&self) -> usize {
        self.shared.ring.capacity()
    }

    /// Number of published, unclaimed items (approximate under concurrency).
    #[inline]
    pub fn len(&self) -> usize {
        self.shared.len()
    }

    /// True when no items are buffered (approximate under concurrency).
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
        if self.shared.receivers.fetch_sub(1, Ordering::AcqRel) == 1 {
            // Last consumer gone; fail further sends and wake the producer.
            self.shared.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn single_consumer_behaves_like_spsc() {
        let (mut tx, mut rx) = channel::<u64>(16).unwrap();
        assert!(tx.try_send(42));
        assert_eq!(rx.try_recv(), Some(42));
        assert_eq!(rx.try_recv(), None);
    }

    #[test]
    fn consumers_partition_the_stream() {
        const N: u64 = 20_000;
        const CONSUMERS: usize = 4;

        let (mut tx, rx) = channel::<u64>(1024).unwrap();
        let mut handles = Vec::new();
        for _ in 0..CONSUMERS {
            let mut rx = rx.clone();
            handles.push(thread::spawn(move || {
                let mut got = Vec::new();
                loop {
                    match rx.recv() {
                        Some(v) => got.push(v),
                        None => break,
                    }
                }
                got
            }));
        }
        drop(rx);

        for i in 0..N {
            tx.send(i).unwrap();
        }
        tx.close();

        let mut all = HashSet::new();
        let mut total = 0;
        for h in handles {
            let got = h.join().unwrap();
            // Per-consumer view preserves global insertion order.
            for pair in got.windows(2) {
                assert!(pair[0] < pair[1]);
            }
            total += got.len();
            all.extend(got);
        }
        assert_eq!(total as u64, N, "items delivered more than once");
        assert_eq!(all.len() as u64, N, "items lost");
    }

    #[test]
    fn last_receiver_drop_closes() {
        let (mut tx, rx) = channel::<u64>(8).unwrap();
        let rx2 = rx.clone();
        drop(rx);
        assert!(!tx.is_closed());
        drop(rx2);
        assert!(tx.is_closed());
        assert!(!tx.try_send(1));
    }

    #[test]
    fn batch_recv_respects_order() {
        let (mut tx, mut rx) = channel::<u64>(64).unwrap();
        let items: Vec<u64> = (0..40).collect();
        assert_eq!(tx.send_batch(&items), 40);

        let mut out = [0u64; 7];
        let mut seen = Vec::new();
        loop {
            let n = rx.try_recv_batch(&mut out);
            if n == 0 {
                break;
            }
            seen.extend_from_slice(&out[..n]);
        }
        assert_eq!(seen, items);
    }
}
