use crate::mpsc::{Claim, MpscShared};
use crate::sender::SpShared;
use std::mem::MaybeUninit;
use std::sync::atomic::Ordering;

/// Zero-copy reservation: write directly into the ring, then commit.
///
/// Obtained from [`Sender::reserve`](crate::Sender::reserve) or
/// [`mpsc::Producer::reserve`](crate::mpsc::Producer::reserve). The reserved
/// positions are exposed as two mutable runs because a reservation may wrap
/// the end of the buffer; the second run is usually empty.
///
/// A reservation may hold **fewer slots than requested** — check
/// [`len`](Self::len). Until [`commit`](Self::commit) no tail moves and no
/// consumer can observe the slots. Dropping without committing abandons the
/// reservation; the slots return to the pool unpublished.
///
/// The reservation mutably borrows its producer handle, so the handle cannot
/// send or reserve again until this one is committed or dropped.
pub struct Reservation<'a, T> {
    first: &'a mut [MaybeUninit<T>],
    second: &'a mut [MaybeUninit<T>],
    start: u64,
    committer: Committer<'a, T>,
    done: bool,
}

enum Committer<'a, T> {
    /// Single shared tail (SPSC/SPMC); nothing was claimed, commit stores
    /// the new tail.
    Single { shared: &'a SpShared<T> },
    /// MPSC handle: the range was claimed from the shared cursor (or taken
    /// from the handle's retained range); commit publishes the producer's
    /// tail, abandonment rolls the cursor back or retains the range.
    Registered {
        shared: &'a MpscShared<T>,
        slot: usize,
        claim_end: u64,
        from_hole: bool,
        hole: &'a mut Option<Claim>,
    },
}

impl<'a, T> Reservation<'a, T> {
    /// # Safety
    ///
    /// `[start, start + len)` must be unpublished slots exclusively owned by
    /// the calling producer for `'a`.
    pub(crate) unsafe fn single(shared: &'a SpShared<T>, start: u64, len: usize) -> Self {
        let (first, second) = Self::runs(&shared.ring, start, len);
        Self {
            first,
            second,
            start,
            committer: Committer::Single { shared },
            done: false,
        }
    }

    /// # Safety
    ///
    /// `[start, start + len)` must be a claim (or retained-range prefix)
    /// exclusively owned by producer `slot`, with `claim_end` its full
    /// claimed extent, for `'a`.
    pub(crate) unsafe fn registered(
        shared: &'a MpscShared<T>,
        slot: usize,
        start: u64,
        len: usize,
        claim_end: u64,
        from_hole: bool,
        hole: &'a mut Option<Claim>,
    ) -> Self {
        let (first, second) = Self::runs(&shared.ring, start, len);
        Self {
            first,
            second,
            start,
            committer: Committer::Registered {
                shared,
                slot,
                claim_end,
                from_hole,
                hole,
            },
            done: false,
        }
    }

    unsafe fn runs(
        ring: &crate::ring::RingBuf<T>,
        start: u64,
        len: usize,
    ) -> (&'a mut [MaybeUninit<T>], &'a mut [MaybeUninit<T>]) {
        let ((p0, n0), (p1, n1)) = ring.wrap_split(start, len);
        (
            std::slice::from_raw_parts_mut(p0.cast::<MaybeUninit<T>>(), n0),
            std::slice::from_raw_parts_mut(p1.cast::<MaybeUninit<T>>(), n1),
        )
    }

    /// The reserved slots as two contiguous runs, in ring order.
    #[inline]
    pub fn as_mut_slices(&mut self) -> (&mut [MaybeUninit<T>], &mut [MaybeUninit<T>]) {
        (&mut *self.first, &mut *self.second)
    }

    /// Number of reserved slots.
    #[inline]
    pub fn len(&self) -> usize {
        self.first.len() + self.second.len()
    }

    /// True when nothing was reserved (never produced by `reserve`).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Publishes every reserved slot with a single tail release.
    ///
    /// Every slot must have been written; committing an unwritten slot makes
    /// the consumer read uninitialized memory.
    pub fn commit(mut self) {
        let n = self.len();
        let new_tail = self.start.wrapping_add(n as u64);
        self.done = true;
        match &mut self.committer {
            Committer::Single { shared } => shared.publish(new_tail, n),
            Committer::Registered {
                shared,
                slot,
                claim_end,
                hole,
                ..
            } => {
                if new_tail < *claim_end {
                    // Partial use of a retained range: the remainder stays
                    // with the handle and is reused by its next claim.
                    **hole = Some(Claim {
                        start: new_tail,
                        end: *claim_end,
                    });
                }
                shared.publish_from(*slot, new_tail, n);
            }
        }
    }
}

impl<T> Drop for Reservation<'_, T> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        // Abandoned: no tail was advanced, so nothing is visible. For the
        // claimed MPSC range, un-claim it if still the newest claim, else
        // retain it for the handle's next send.
        if let Committer::Registered {
            shared,
            claim_end,
            from_hole,
            hole,
            ..
        } = &mut self.committer
        {
            let rolled_back = !*from_hole
                && shared
                    .claim
                    .compare_exchange(*claim_end, self.start, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok();
            if !rolled_back {
                **hole = Some(Claim {
                    start: self.start,
                    end: *claim_end,
                });
            }
        }
    }
}
