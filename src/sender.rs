use crate::invariants::{debug_assert_fill_bounded, debug_assert_monotonic};
use crate::park::Waiters;
use crate::ring::{CachePadded, RingBuf};
use crate::{Backoff, ChannelError, Metrics, Reservation};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

// Shared state for the single-tail topologies (SPSC and SPMC): one producer
// owns `tail`, one or many consumers advance `head`.
//
// Producer protocol: load own tail (Relaxed), check the fill against a
// handle-cached head, refreshing the cache from `head` (Acquire) only when
// the cached view says full; write the slot; store `tail` (Release). The
// Release publishes the slot contents to any consumer that acquires the new
// tail.
pub(crate) struct SpShared<T> {
    pub(crate) ring: RingBuf<T>,
    /// Producer's next-write position.
    pub(crate) tail: CachePadded<AtomicU64>,
    /// Consumer's next-read position.
    pub(crate) head: CachePadded<AtomicU64>,
    /// Futex word counting producers blocked on a full ring.
    pub(crate) producer_waiters: CachePadded<Waiters>,
    /// Futex word counting consumers blocked on an empty ring.
    pub(crate) consumer_waiters: CachePadded<Waiters>,
    pub(crate) closed: AtomicBool,
    /// Live receiver handles; the last one to drop closes the channel.
    pub(crate) receivers: AtomicU32,
    pub(crate) metrics: Metrics,
}

unsafe impl<T: Send> Send for SpShared<T> {}
unsafe impl<T: Send> Sync for SpShared<T> {}

impl<T> SpShared<T> {
    pub(crate) fn new(capacity: usize) -> Result<Self, ChannelError> {
        Ok(Self {
            ring: RingBuf::new(capacity)?,
            tail: CachePadded::new(AtomicU64::new(0)),
            head: CachePadded::new(AtomicU64::new(0)),
            producer_waiters: CachePadded::new(Waiters::new()),
            consumer_waiters: CachePadded::new(Waiters::new()),
            closed: AtomicBool::new(false),
            receivers: AtomicU32::new(1),
            metrics: Metrics::new(),
        })
    }

    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.producer_waiters.wake_all();
        self.consumer_waiters.wake_all();
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Relaxed);
        tail.wrapping_sub(head) as usize
    }

    /// Publishes `[.., new_tail)` and pokes any parked consumer.
    pub(crate) fn publish(&self, new_tail: u64, n: usize) {
        let old = self.tail.load(Ordering::Relaxed);
        debug_assert_monotonic!("tail", old, new_tail);
        debug_assert_fill_bounded!(
            new_tail.wrapping_sub(self.head.load(Ordering::Relaxed)),
            self.ring.capacity()
        );
        self.tail.store(new_tail, Ordering::Release);
        self.metrics.on_send(n as u64);
        self.consumer_waiters.wake_all();
    }
}

impl<T> Drop for SpShared<T> {
    fn drop(&mut self) {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        // SAFETY: sole owner at drop time; `[head, tail)` holds the
        // published, unconsumed values.
        unsafe { self.ring.drop_range(head, tail) };
    }
}

/// Producing half of an SPSC or SPMC channel.
///
/// The handle is unique (no `Clone`) and all operations take `&mut self`:
/// the single-producer contract and the reserve-before-commit discipline are
/// both enforced at compile time.
pub struct Sender<T> {
    shared: Arc<SpShared<T>>,
    /// Local view of the consumer head; refreshed only when it claims the
    /// ring is full, so the common case does no cross-core load.
    cached_head: u64,
}

unsafe impl<T: Send> Send for Sender<T> {}

impl<T> Sender<T> {
    pub(crate) fn new(shared: Arc<SpShared<T>>) -> Self {
        Self {
            shared,
            cached_head: 0,
        }
    }

    /// Free slots for a write starting at `tail`, refreshing the cached head
    /// when the cached view is insufficient for `want`.
    #[inline]
    fn free_slots(&mut self, tail: u64, want: usize) -> usize {
        let capacity = self.shared.ring.capacity();
        let free = capacity.saturating_sub(tail.wrapping_sub(self.cached_head) as usize);
        if free >= want {
            return free;
        }
        self.cached_head = self.shared.head.load(Ordering::Acquire);
        capacity.saturating_sub(tail.wrapping_sub(self.cached_head) as usize)
    }

    pub(crate) fn try_send_inner(&mut self, value: T) -> Result<(), T> {
        if self.shared.is_closed() {
            return Err(value);
        }
        let tail = self.shared.tail.load(Ordering::Relaxed);
        if self.free_slots(tail, 1) == 0 {
            return Err(value);
        }
        // SAFETY: the slot at `tail` is outside `[head, tail)` and this is
        // the only producer, so nobody else can touch it.
        unsafe { self.shared.ring.slot(tail).write(value) };
        self.shared.publish(tail.wrapping_add(1), 1);
        Ok(())
    }

    /// Attempts to enqueue one value without blocking.
    ///
    /// Returns `false` (dropping the value) if the channel is closed or the
    /// ring is full.
    #[inline]
    pub fn try_send(&mut self, value: T) -> bool {
        self.try_send_inner(value).is_ok()
    }

    /// Enqueues one value, blocking while the ring is full.
    ///
    /// Spins with exponential backoff first, then parks on the producer
    /// futex word until a consumer frees a slot. Returns
    /// `Err(ChannelError::Closed)` if the channel closes before the value is
    /// accepted; the value is dropped in that case.
    pub fn send(&mut self, value: T) -> Result<(), ChannelError> {
        let mut value = value;
        let mut backoff = Backoff::new();
        loop {
            value = match self.try_send_inner(value) {
                Ok(()) => return Ok(()),
                Err(v) => v,
            };
            if self.shared.is_closed() {
                return Err(ChannelError::Closed);
            }
            if backoff.should_park() {
                let expected = self.shared.producer_waiters.announce();
                value = match self.try_send_inner(value) {
                    Ok(()) => {
                        self.shared.producer_waiters.retract();
                        return Ok(());
                    }
                    Err(v) => v,
                };
                if self.shared.is_closed() {
                    self.shared.producer_waiters.retract();
                    return Err(ChannelError::Closed);
                }
                self.shared.metrics.on_producer_park();
                self.shared.producer_waiters.park(expected);
                self.shared.producer_waiters.retract();
                backoff.reset();
            } else {
                backoff.spin();
            }
        }
    }

    /// Enqueues as many leading items as currently fit and publishes them
    /// with a single tail release. Returns the count accepted (possibly 0).
    pub fn try_send_batch(&mut self, items: &[T]) -> usize
    where
        T: Copy,
    {
        if items.is_empty() || self.shared.is_closed() {
            return 0;
        }
        let tail = self.shared.tail.load(Ordering::Relaxed);
        let n = self.free_slots(tail, items.len()).min(items.len());
        if n == 0 {
            return 0;
        }
        let ((p0, n0), (p1, n1)) = self.shared.ring.wrap_split(tail, n);
        // SAFETY: the n slots past `tail` are unpublished and exclusively
        // ours; the two runs cover them without overlap.
        unsafe {
            std::ptr::copy_nonoverlapping(items.as_ptr(), p0, n0);
            std::ptr::copy_nonoverlapping(items.as_ptr().add(n0), p1, n1);
        }
        self.shared.publish(tail.wrapping_add(n as u64), n);
        n
    }

    /// Enqueues the whole slice, blocking for space as needed. Returns the
    /// number sent, which is short of `items.len()` only if the channel
    /// closes mid-stream.
    pub fn send_batch(&mut self, items: &[T]) -> usize
    where
        T: Copy,
    {
        let mut sent = 0;
        let mut backoff = Backoff::new();
        while sent < items.len() {
            let n = self.try_send_batch(&items[sent..]);
            if n > 0 {
                sent += n;
                backoff.reset();
                continue;
            }
            if self.shared.is_closed() {
                break;
            }
            if backoff.should_park() {
                let expected = self.shared.producer_waiters.announce();
                let n = self.try_send_batch(&items[sent..]);
                if n > 0 {
                    self.shared.producer_waiters.retract();
                    sent += n;
                    backoff.reset();
                    continue;
                }
                if self.shared.is_closed() {
                    self.shared.producer_waiters.retract();
                    break;
                }
                self.shared.metrics.on_producer_park();
                self.shared.producer_waiters.park(expected);
                self.shared.producer_waiters.retract();
                backoff.reset();
            } else {
                backoff.spin();
            }
        }
        sent
    }

    /// Reserves up to `n` slots for zero-copy writing.
    ///
    /// Returns `None` when the channel is closed, `n` is zero, or the ring
    /// is full. The reservation may be shorter than requested; check
    /// [`Reservation::len`]. No tail moves until
    /// [`commit`](Reservation::commit); dropping the reservation abandons
    /// the slots.
    pub fn reserve(&mut self, n: usize) -> Option<Reservation<'_, T>> {
        if n == 0 || self.shared.is_closed() {
            return None;
        }
        let tail = self.shared.tail.load(Ordering::Relaxed);
        let m = self.free_slots(tail, n).min(n);
        if m == 0 {
            return None;
        }
        // SAFETY: the m slots past `tail` are unpublished and exclusively
        // ours for the lifetime of the reservation (`&mut self` borrow).
        Some(unsafe { Reservation::single(&self.shared, tail, m) })
    }

    /// Capacity of the ring (slots).
    #[inline]
    pub fn capacity(&self) -> usize {
        self.shared.ring.capacity()
    }

    /// Number of items currently buffered (approximate under concurrency).
    #[inline]
    pub fn len(&self) -> usize {
        self.shared.len()
    }

    /// True if no items are buffered (approximate under concurrency).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes the channel: subsequent sends fail and blocked parties on
    /// either side are woken.
    pub fn close(&self) {
        self.shared.close();
    }

    /// True once the channel has been closed.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        // The producing side is gone; release blocked consumers.
        self.shared.close();
    }
}
