//! Multi-producer single-consumer channel.
//!
//! Producers share one ring. A producer claims a disjoint range of slots by
//! advancing the shared claim cursor with a CAS, writes the slots it owns,
//! then publishes by release-storing its *own* tail in a fixed per-producer
//! table and bumping its generation counter. A producer's tail certifies
//! that every slot of every claim of that producer below it is published, so
//! the minimum tail over the active producers is a safe consumer horizon.
//!
//! The consumer keeps a private copy of each producer's last observed tail,
//! revalidated by the generation counter, so the common dequeue does one
//! acquire load per active producer and skips the tail line entirely when
//! nothing changed. When the scan finds nothing and no producer remains
//! active, an authoritative pass against the claim cursor decides real
//! emptiness — that is what lets a blocked consumer terminate after the last
//! producer retires with items still in flight.

use crate::invariants::{debug_assert_fill_bounded, debug_assert_monotonic, debug_assert_published};
use crate::park::Waiters;
use crate::ring::{CachePadded, RingBuf};
use crate::{Backoff, ChannelError, Metrics, MetricsSnapshot, Reservation, MAX_PRODUCER_LIMIT};
use std::cell::UnsafeCell;
use std::hint;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// A claimed, not yet published slot range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Claim {
    pub(crate) start: u64,
    pub(crate) end: u64,
}

/// Producer-written half of a table entry.
#[derive(Debug)]
pub(crate) struct SlotShared {
    /// End of the producer's lowest published claim prefix.
    pub(crate) tail: AtomicU64,
    /// Bumped on every tail advance, on register and on retire; the
    /// consumer's cache is valid only while this matches.
    pub(crate) gen: AtomicU64,
    pub(crate) active: AtomicBool,
}

/// Consumer-private half of a table entry. Plain cells: there is exactly one
/// consumer and nobody else ever touches this line.
#[derive(Debug)]
pub(crate) struct SlotCache {
    pub(crate) tail: UnsafeCell<u64>,
    pub(crate) gen: UnsafeCell<u64>,
}

/// One producer table entry, split over two cache lines so a publishing
/// producer and the scanning consumer never dirty each other's line.
#[derive(Debug)]
pub(crate) struct ProducerSlot {
    pub(crate) shared: CachePadded<SlotShared>,
    pub(crate) cache: CachePadded<SlotCache>,
}

impl ProducerSlot {
    fn new() -> Self {
        Self {
            shared: CachePadded::new(SlotShared {
                tail: AtomicU64::new(0),
                gen: AtomicU64::new(0),
                active: AtomicBool::new(false),
            }),
            cache: CachePadded::new(SlotCache {
                tail: UnsafeCell::new(0),
                gen: UnsafeCell::new(0),
            }),
        }
    }
}

pub(crate) struct MpscShared<T> {
    pub(crate) ring: RingBuf<T>,
    /// Consumer's next-read position.
    pub(crate) head: CachePadded<AtomicU64>,
    /// Shared slot-claim cursor: the highest position any producer has
    /// claimed (the maximum tail any producer could publish). CASed by
    /// producers; claims are therefore disjoint.
    pub(crate) claim: CachePadded<AtomicU64>,
    /// Consumer-published lower bound of the min tail; a hint, never
    /// load-bearing.
    pub(crate) cached_min_tail: CachePadded<AtomicU64>,
    pub(crate) producer_waiters: CachePadded<Waiters>,
    pub(crate) consumer_waiters: CachePadded<Waiters>,
    pub(crate) closed: AtomicBool,
    /// Registered and not yet retired producers.
    pub(crate) active_producers: AtomicU32,
    /// Monotonic slot allocator; slots are never reused.
    pub(crate) registered: AtomicU32,
    pub(crate) slots: Box<[ProducerSlot]>,
    pub(crate) metrics: Metrics,
}

unsafe impl<T: Send> Send for MpscShared<T> {}
unsafe impl<T: Send> Sync for MpscShared<T> {}

impl<T> MpscShared<T> {
    #[inline]
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.producer_waiters.wake_all();
        self.consumer_waiters.wake_all();
    }

    /// Allocated prefix of the producer table.
    #[inline]
    fn table(&self) -> &[ProducerSlot] {
        let n = (self.registered.load(Ordering::Acquire) as usize).min(self.slots.len());
        &self.slots[..n]
    }

    /// Publishes producer `slot`'s claims up to `new_tail` and pokes any
    /// parked consumer.
    pub(crate) fn publish_from(&self, slot: usize, new_tail: u64, n: usize) {
        let entry = &self.slots[slot];
        let old = entry.shared.tail.load(Ordering::Relaxed);
        debug_assert_monotonic!("producer tail", old, new_tail);
        debug_assert_fill_bounded!(
            new_tail.wrapping_sub(self.head.load(Ordering::Relaxed)),
            self.ring.capacity()
        );
        entry.shared.tail.store(new_tail, Ordering::Release);
        entry.shared.gen.fetch_add(1, Ordering::Release);
        self.metrics.on_send(n as u64);
        self.consumer_waiters.wake_all();
    }
}

impl<T> Drop for MpscShared<T> {
    fn drop(&mut self) {
        let head = self.head.load(Ordering::Relaxed);
        // An entry left active at teardown still owns an unpublished claim;
        // stop in front of its tail rather than walking into uninitialized
        // slots.
        let mut horizon = self.claim.load(Ordering::Relaxed);
        let n = (self.registered.load(Ordering::Relaxed) as usize).min(self.slots.len());
        for entry in &self.slots[..n] {
            if entry.shared.active.load(Ordering::Relaxed) {
                horizon = horizon.min(entry.shared.tail.load(Ordering::Relaxed));
            }
        }
        // SAFETY: sole owner at drop time; `[head, horizon)` is published.
        unsafe { self.ring.drop_range(head, horizon.max(head)) };
    }
}

/// Creates a bounded MPSC channel with at least `capacity` slots (rounded up
/// to a power of two) and a fixed producer table of `max_producers` entries.
///
/// The [`Channel`] half is a cloneable registry handing out producer handles
/// via [`register`](Channel::register); the [`Receiver`] is the unique
/// consumer.
pub fn channel<T: Send>(
    capacity: usize,
    max_producers: usize,
) -> Result<(Channel<T>, Receiver<T>), ChannelError> {
    if max_producers == 0 || max_producers > MAX_PRODUCER_LIMIT {
        return Err(ChannelError::InvalidProducerLimit {
            requested: max_producers,
        });
    }
    let slots: Box<[ProducerSlot]> = (0..max_producers).map(|_| ProducerSlot::new()).collect();
    let shared = Arc::new(MpscShared {
        ring: RingBuf::new(capacity)?,
        head: CachePadded::new(AtomicU64::new(0)),
        claim: CachePadded::new(AtomicU64::new(0)),
        cached_min_tail: CachePadded::new(AtomicU64::new(0)),
        producer_waiters: CachePadded::new(Waiters::new()),
        consumer_waiters: CachePadded::new(Waiters::new()),
        closed: AtomicBool::new(false),
        active_producers: AtomicU32::new(0),
        registered: AtomicU32::new(0),
        slots,
        metrics: Metrics::new(),
    });
    Ok((
        Channel {
            shared: Arc::clone(&shared),
        },
        Receiver { shared },
    ))
}

/// Registry half of an MPSC channel: registers producers and exposes
/// channel-wide controls. Cloneable and shareable across threads.
pub struct Channel<T> {
    shared: Arc<MpscShared<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send> Channel<T> {
    /// Registers a new producer, assigning the next free table slot.
    ///
    /// Slot indices are monotonic and never reused; once `max_producers`
    /// registrations have happened the channel accepts no more, even after
    /// retires.
    pub fn register(&self) -> Result<Producer<T>, ChannelError> {
        if self.shared.is_closed() {
            return Err(ChannelError::Closed);
        }
        let id = self.shared.registered.fetch_add(1, Ordering::AcqRel) as usize;
        if id >= self.shared.slots.len() {
            self.shared.registered.fetch_sub(1, Ordering::AcqRel);
            return Err(ChannelError::TooManyProducers {
                max: self.shared.slots.len(),
            });
        }

        // Count the producer live before its entry activates: a consumer
        // deciding termination must never observe "slots allocated, nobody
        // active" while a registration is mid-flight.
        self.shared.active_producers.fetch_add(1, Ordering::AcqRel);

        let entry = &self.shared.slots[id];
        // Baseline the tail at the current cursor so the new entry can never
        // drag the horizon below positions the consumer already passed; the
        // consumer additionally clamps, closing the race with claims made
        // between this load and the activation below.
        let baseline = self.shared.claim.load(Ordering::Acquire);
        entry.shared.tail.store(baseline, Ordering::Relaxed);
        entry.shared.gen.fetch_add(1, Ordering::Release);
        entry.shared.active.store(true, Ordering::Release);

        Ok(Producer {
            shared: Arc::clone(&self.shared),
            slot: id,
            hole: None,
        })
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

    /// Producers registered and not yet retired.
    #[inline]
    pub fn producer_count(&self) -> usize {
        self.shared.active_producers.load(Ordering::Acquire) as usize
    }

    /// Capacity of the ring (slots).
    #[inline]
    pub fn capacity(&self) -> usize {
        self.shared.ring.capacity()
    }

    /// Claimed-but-unconsumed slots, published or not (approximate).
    #[inline]
    pub fn len(&self) -> usize {
        let claim = self.shared.claim.load(Ordering::Relaxed);
        let head = self.shared.head.load(Ordering::Relaxed);
        claim.wrapping_sub(head) as usize
    }

    /// True when nothing is claimed or buffered (approximate).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the channel's operation counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }
}

/// Producing handle of an MPSC channel, bound to one table slot.
///
/// Unique per registration (no `Clone` — a second thread writing through the
/// same slot would break the single-writer tail protocol). Operations take
/// `&mut self`; an open [`Reservation`] borrows the handle until committed
/// or dropped. Dropping the handle retires the producer.
pub struct Producer<T> {
    shared: Arc<MpscShared<T>>,
    slot: usize,
    /// Claimed range abandoned or partially used earlier; always this
    /// producer's lowest unpublished claim, consumed before any fresh claim
    /// so publication stays in position order.
    hole: Option<Claim>,
}

unsafe impl<T: Send> Send for Producer<T> {}

impl<T: Send> Producer<T> {
    /// This producer's table slot index.
    #[inline]
    pub fn id(&self) -> usize {
        self.slot
    }

    /// Claims up to `want` slots: the retained range first, else a CAS on
    /// the shared cursor gated by the free window. Returns
    /// `(start, len, claim_end, from_hole)`.
    fn claim_range(&mut self, want: usize) -> Option<(u64, usize, u64, bool)> {
        debug_assert!(want > 0);
        if let Some(h) = self.hole.take() {
            let len = want.min((h.end - h.start) as usize);
            return Some((h.start, len, h.end, true));
        }
        let shared = &*self.shared;
        let capacity = shared.ring.capacity() as u64;
        let mut cursor = shared.claim.load(Ordering::Relaxed);
        loop {
            // The head is a lower bound: a stale read only makes the window
            // smaller, never lets the claim overrun the consumer.
            let head = shared.head.load(Ordering::Acquire);
            let free = capacity.saturating_sub(cursor.wrapping_sub(head));
            if free == 0 {
                return None;
            }
            let len = (want as u64).min(free);
            match shared.claim.compare_exchange_weak(
                cursor,
                cursor + len,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some((cursor, len as usize, cursor + len, false)),
                Err(actual) => {
                    cursor = actual;
                    hint::spin_loop();
                }
            }
        }
    }

    /// Publishes `[start, start + len)` and retains any unused remainder of
    /// the claim.
    fn finish_publish(&mut self, start: u64, len: usize, claim_end: u64) {
        let new_tail = start + len as u64;
        if new_tail < claim_end {
            self.hole = Some(Claim {
                start: new_tail,
                end: claim_end,
            });
        }
        self.shared.publish_from(self.slot, new_tail, len);
    }

    fn try_send_inner(&mut self, value: T) -> Result<(), T> {
        if self.shared.is_closed() {
            return Err(value);
        }
        let Some((start, len, claim_end, _)) = self.claim_range(1) else {
            return Err(value);
        };
        debug_assert_eq!(len, 1);
        // SAFETY: `[start, start + 1)` was claimed above and is exclusively
        // ours until published.
        unsafe { self.shared.ring.slot(start).write(value) };
        self.finish_publish(start, 1, claim_end);
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
    /// Returns `Err(ChannelError::Closed)` if the channel closes before the
    /// value is accepted; the value is dropped in that case.
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

    /// Enqueues as many leading items as fit in one claim and publishes them
    /// with a single tail release. Returns the count accepted (possibly 0).
    pub fn try_send_batch(&mut self, items: &[T]) -> usize
    where
        T: Copy,
    {
        if items.is_empty() || self.shared.is_closed() {
            return 0;
        }
        let Some((start, len, claim_end, _)) = self.claim_range(items.len()) else {
            return 0;
        };
        let ((p0, n0), (p1, n1)) = self.shared.ring.wrap_split(start, len);
        // SAFETY: `[start, start + len)` is our claim; the runs cover it
        // without overlap.
        unsafe {
            ptr::copy_nonoverlapping(items.as_ptr(), p0, n0);
            ptr::copy_nonoverlapping(items.as_ptr().add(n0), p1, n1);
        }
        self.finish_publish(start, len, claim_end);
        len
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
    /// is full. The reservation may be shorter than requested. No tail moves
    /// until [`Reservation::commit`]; dropping the reservation abandons the
    /// claim (rolled back, or retained and reused by this handle's next
    /// send).
    pub fn reserve(&mut self, n: usize) -> Option<Reservation<'_, T>> {
        if n == 0 || self.shared.is_closed() {
            return None;
        }
        let (start, len, claim_end, from_hole) = self.claim_range(n)?;
        let slot = self.slot;
        let shared = &*self.shared;
        // SAFETY: `[start, start + len)` is our claim for the lifetime of
        // the reservation (`&mut self` borrow).
        Some(unsafe {
            Reservation::registered(shared, slot, start, len, claim_end, from_hole, &mut self.hole)
        })
    }

    /// True once the channel has been closed.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Retires this producer: its slot deactivates and the consumer stops
    /// waiting on it. Equivalent to dropping the handle.
    pub fn unregister(self) {}
}

impl<T> Drop for Producer<T> {
    fn drop(&mut self) {
        debug_assert!(
            self.hole.is_none(),
            "producer retired while holding an uncommitted claim"
        );
        if self.hole.is_some() {
            // The unpublished range must stay fenced off: leave the entry
            // active so the consumer horizon never crosses it.
            return;
        }
        let entry = &self.shared.slots[self.slot];
        let tail = entry.shared.tail.load(Ordering::Relaxed);
        entry.shared.active.store(false, Ordering::Release);
        entry.shared.gen.fetch_add(1, Ordering::Release);
        let prev = self.shared.active_producers.fetch_sub(1, Ordering::AcqRel);
        let head = self.shared.head.load(Ordering::Acquire);
        // Wake a blocked consumer if this retire could unblock it: either no
        // producer remains (authoritative emptiness can now be decided) or
        // this tail was potentially the horizon gate.
        if prev == 1 || tail == head {
            self.shared.consumer_waiters.wake_all();
        }
    }
}

/// Consuming half of an MPSC channel. Unique; all operations take
/// `&mut self`.
pub struct Receiver<T> {
    shared: Arc<MpscShared<T>>,
}

unsafe impl<T: Send> Send for Receiver<T> {}

impl<T: Send> Receiver<T> {
    /// Fast-path horizon: minimum published tail over the active producers,
    /// using the generation-validated cache, clamped to `head`. Returns
    /// `head` when no entry is active (the caller decides emptiness
    /// authoritatively).
    fn scan_horizon(&self, head: u64) -> u64 {
        let shared = &*self.shared;
        let capacity = shared.ring.capacity() as u64;
        let mut min_tail = head + capacity;
        let mut saw_active = false;
        for entry in shared.table() {
            if !entry.shared.active.load(Ordering::Acquire) {
                continue;
            }
            saw_active = true;
            let gen = entry.shared.gen.load(Ordering::Acquire);
            // SAFETY: the cache line is owned by the single consumer; no
            // other thread reads or writes it.
            let tail = unsafe {
                if gen == *entry.cache.gen.get() {
                    *entry.cache.tail.get()
                } else {
                    let fresh = entry.shared.tail.load(Ordering::Acquire);
                    *entry.cache.tail.get() = fresh;
                    *entry.cache.gen.get() = gen;
                    fresh
                }
            };
            min_tail = min_tail.min(tail);
        }
        let horizon = if saw_active { min_tail.max(head) } else { head };
        shared.cached_min_tail.store(horizon, Ordering::Release);
        horizon
    }

    /// Authoritative emptiness decision once no producer is active: every
    /// claim is then published, so the claim cursor itself is the horizon.
    fn authoritative_horizon(&self, head: u64) -> Option<u64> {
        let shared = &*self.shared;
        let cursor = shared.claim.load(Ordering::Acquire);
        // Re-check after the cursor load: a claim observed above belongs to
        // a producer that was registered when it claimed; if it has not
        // retired the counter is nonzero and we defer to the fast path, and
        // if it has retired its claim is published.
        if shared.active_producers.load(Ordering::Acquire) != 0 {
            return None;
        }
        if cursor == head {
            return None;
        }
        shared.cached_min_tail.store(cursor, Ordering::Release);
        Some(cursor)
    }

    fn horizon(&self, head: u64) -> Option<u64> {
        let horizon = self.scan_horizon(head);
        if horizon != head {
            return Some(horizon);
        }
        if self.shared.active_producers.load(Ordering::Acquire) != 0 {
            return None;
        }
        self.authoritative_horizon(head)
    }

    /// Removes one item without blocking. `None` means no published item is
    /// below the current horizon.
    pub fn try_recv(&mut self) -> Option<T> {
        let head = self.shared.head.load(Ordering::Relaxed);
        let horizon = self.horizon(head)?;
        debug_assert_published!(head, head, horizon);
        // SAFETY: `head` is below the horizon, hence inside a published
        // claim; we are the only consumer.
        let value = unsafe { ptr::read(self.shared.ring.slot(head)) };
        self.shared.head.store(head.wrapping_add(1), Ordering::Release);
        self.shared.metrics.on_receive(1);
        self.shared.producer_waiters.wake_all();
        Some(value)
    }

    /// Removes one item, blocking while nothing is deliverable.
    ///
    /// `None` is terminal: the channel was closed and drained, or producers
    /// have registered, all of them have retired, and nothing remains.
    pub fn recv(&mut self) -> Option<T> {
        let mut backoff = Backoff::new();
        loop {
            if let Some(v) = self.try_recv() {
                return Some(v);
            }
            if self.finished() {
                return self.try_recv();
            }
            if backoff.should_park() {
                let expected = self.shared.consumer_waiters.announce();
                if let Some(v) = self.try_recv() {
                    self.shared.consumer_waiters.retract();
                    return Some(v);
                }
                if self.finished() {
                    self.shared.consumer_waiters.retract();
                    return self.try_recv();
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

    /// No more items can ever arrive without further registrations.
    fn finished(&self) -> bool {
        let shared = &*self.shared;
        shared.is_closed()
            || (shared.registered.load(Ordering::Acquire) > 0
                && shared.active_producers.load(Ordering::Acquire) == 0)
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
        let Some(horizon) = self.horizon(head) else {
            return 0;
        };
        let n = (horizon.wrapping_sub(head) as usize).min(out.len());
        let ((p0, n0), (p1, n1)) = self.shared.ring.wrap_split(head, n);
        // SAFETY: the n slots past `head` are below the horizon and stable
        // until we advance the head.
        unsafe {
            ptr::copy_nonoverlapping(p0, out.as_mut_ptr(), n0);
            ptr::copy_nonoverlapping(p1, out.as_mut_ptr().add(n0), n1);
        }
        self.shared.head.store(head.wrapping_add(n as u64), Ordering::Release);
        self.shared.metrics.on_receive(n as u64);
        self.shared.producer_waiters.wake_all();
        n
    }

    /// Blocking batch drain: parks while nothing is deliverable, returns
    /// after the first nonzero batch. 0 is terminal (see [`recv`](Self::recv)).
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
            if self.finished() {
                return self.try_recv_batch(out);
            }
            if backoff.should_park() {
                let expected = self.shared.consumer_waiters.announce();
                let n = self.try_recv_batch(out);
                if n > 0 {
                    self.shared.consumer_waiters.retract();
                    return n;
                }
                if self.finished() {
                    self.shared.consumer_waiters.retract();
                    return self.try_recv_batch(out);
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

    /// Processes every currently deliverable item with a single head
    /// advance. Returns the number handled.
    pub fn drain_with<F>(&mut self, mut handler: F) -> usize
    where
        T: Copy,
        F: FnMut(&T),
    {
        let head = self.shared.head.load(Ordering::Relaxed);
        let Some(horizon) = self.horizon(head) else {
            return 0;
        };
        let mut pos = head;
        while pos != horizon {
            // SAFETY: every position below the horizon is published.
            unsafe { handler(&*self.shared.ring.slot(pos)) };
            pos = pos.wrapping_add(1);
        }
        let count = horizon.wrapping_sub(head) as usize;
        self.shared.head.store(horizon, Ordering::Release);
        self.shared.metrics.on_receive(count as u64);
        self.shared.producer_waiters.wake_all();
        count
    }

    /// Capacity of the ring (slots).
    #[inline]
    pub fn capacity(&self) -> usize {
        self.shared.ring.capacity()
    }

    /// Deliverable items as of the last horizon scan (a hint).
    #[inline]
    pub fn len(&self) -> usize {
        let hint = self.shared.cached_min_tail.load(Ordering::Relaxed);
        let head = self.shared.head.load(Ordering::Relaxed);
        hint.saturating_sub(head) as usize
    }

    /// True when the last scan saw nothing deliverable (a hint).
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_producer_fifo() {
        let (ch, mut rx) = channel::<u64>(64, 1).unwrap();
        let mut tx = ch.register().unwrap();
        assert!(tx.try_send(100));
        assert!(tx.try_send(200));
        assert!(tx.try_send(300));

        let mut sum = 0;
        let mut seen = Vec::new();
        let n = rx.drain_with(|v| {
            sum += *v;
            seen.push(*v);
        });
        assert_eq!(n, 3);
        assert_eq!(sum, 600);
        assert_eq!(seen, [100, 200, 300]);
    }

    #[test]
    fn zero_copy_reserve_commit() {
        let (ch, mut rx) = channel::<u64>(64, 1).unwrap();
        let mut tx = ch.register().unwrap();

        let mut r = tx.reserve(10).unwrap();
        let n = r.len();
        assert!(n >= 1);
        let (first, second) = r.as_mut_slices();
        for (i, slot) in first.iter_mut().chain(second.iter_mut()).enumerate() {
            slot.write(i as u64 * 10);
        }
        r.commit();

        let mut out = [0u64; 10];
        let got = rx.try_recv_batch(&mut out);
        assert_eq!(got, n);
        for (i, v) in out[..got].iter().enumerate() {
            assert_eq!(*v, i as u64 * 10);
        }
    }

    #[test]
    fn abandoned_claim_rolls_back() {
        let (ch, mut rx) = channel::<u64>(16, 1).unwrap();
        let mut tx = ch.register().unwrap();

        drop(tx.reserve(4).unwrap());
        assert_eq!(rx.try_recv(), None);

        // The cursor was rolled back; the slots carry the next sends.
        assert!(tx.try_send(7));
        assert_eq!(rx.try_recv(), Some(7));
        assert_eq!(rx.try_recv(), None);
    }

    #[test]
    fn contended_abandon_retains_and_reuses_the_claim() {
        let (ch, mut rx) = channel::<u64>(16, 2).unwrap();
        let mut a = ch.register().unwrap();
        let mut b = ch.register().unwrap();

        // a claims [0, 2); b claims and publishes [2, 3), so a's abandon
        // cannot roll the cursor back and the range stays with the handle.
        let r = a.reserve(2).unwrap();
        assert_eq!(r.len(), 2);
        assert!(b.try_send(50));
        drop(r);
        assert_eq!(rx.try_recv(), None);

        // a's next sends flow through the retained range, in order.
        assert!(a.try_send(7));
        assert_eq!(rx.try_recv(), Some(7));
        assert_eq!(rx.try_recv(), None);
        assert!(a.try_send(8));
        assert_eq!(rx.try_recv(), Some(8));
        // b's item sits behind a's tail until a retires.
        assert_eq!(rx.try_recv(), None);
        drop(a);
        assert_eq!(rx.try_recv(), Some(50));
        drop(b);
        assert_eq!(rx.try_recv(), None);
    }

    #[test]
    fn registration_limit_is_permanent() {
        let (ch, _rx) = channel::<u64>(16, 2).unwrap();
        let a = ch.register().unwrap();
        let b = ch.register().unwrap();
        assert_eq!((a.id(), b.id()), (0, 1));
        assert!(matches!(
            ch.register(),
            Err(ChannelError::TooManyProducers { max: 2 })
        ));
        // Slots are not reused after retirement.
        drop(a);
        assert!(matches!(
            ch.register(),
            Err(ChannelError::TooManyProducers { max: 2 })
        ));
    }

    #[test]
    fn register_after_close_fails() {
        let (ch, _rx) = channel::<u64>(16, 2).unwrap();
        ch.close();
        assert!(matches!(ch.register(), Err(ChannelError::Closed)));
    }

    #[test]
    fn invalid_producer_limit() {
        assert!(matches!(
            channel::<u64>(16, 0),
            Err(ChannelError::InvalidProducerLimit { requested: 0 })
        ));
        assert!(matches!(
            channel::<u64>(16, MAX_PRODUCER_LIMIT + 1),
            Err(ChannelError::InvalidProducerLimit { .. })
        ));
    }

    #[test]
    fn retire_makes_remaining_items_deliverable() {
        let (ch, mut rx) = channel::<u64>(16, 2).unwrap();
        let mut a = ch.register().unwrap();
        let _idle = ch.register().unwrap();

        assert!(a.try_send(1));
        assert!(a.try_send(2));
        // The idle producer gates the horizon.
        assert_eq!(rx.try_recv(), None);

        drop(_idle);
        assert_eq!(rx.try_recv(), Some(1));
        assert_eq!(rx.try_recv(), Some(2));
        assert_eq!(rx.try_recv(), None);
    }

    #[test]
    fn recv_terminates_after_all_retire() {
        let (ch, mut rx) = channel::<u64>(16, 1).unwrap();
        let mut tx = ch.register().unwrap();
        assert!(tx.try_send(5));
        drop(tx);

        assert_eq!(rx.recv(), Some(5));
        assert_eq!(rx.recv(), None);
    }

    #[test]
    fn full_window_bounds_claims() {
        let (ch, mut rx) = channel::<u64>(4, 1).unwrap();
        let mut tx = ch.register().unwrap();
        for i in 0..4 {
            assert!(tx.try_send(i));
        }
        assert!(!tx.try_send(999));
        assert_eq!(rx.try_recv(), Some(0));
        assert!(tx.try_send(999));
    }

    #[test]
    fn late_registrant_starts_at_cursor() {
        let (ch, mut rx) = channel::<u64>(16, 2).unwrap();
        let mut a = ch.register().unwrap();
        for i in 0..5 {
            assert!(a.try_send(i));
        }
        assert_eq!(rx.try_recv(), Some(0));

        // Registers with a baseline past the consumed prefix; the already
        // published items stay deliverable.
        let mut b = ch.register().unwrap();
        assert!(b.try_send(100));
        for expected in [1u64, 2, 3, 4] {
            assert_eq!(rx.try_recv(), Some(expected));
        }
        // Producer a sits at the horizon now; b's item waits behind it.
        assert_eq!(rx.try_recv(), None);
        drop(a);
        assert_eq!(rx.try_recv(), Some(100));
    }
}
