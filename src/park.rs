use std::sync::atomic::{fence, AtomicU32, Ordering};

/// Futex-word waiter counter for one side of a channel.
///
/// The word counts parties that are parking or parked. Parking follows a
/// three-step protocol that cannot lose a wake:
///
/// 1. `announce` increments the word and returns the observed value,
/// 2. the caller re-attempts its operation (a waker that ran in between has
///    either changed the word or left work visible),
/// 3. `park` suspends only while the word still holds the announced value.
///
/// Wakers swap the word to zero *before* the wake syscall, so a parker that
/// raced past step 2 finds a changed word and returns immediately. After
/// returning from `park`, the parker calls `retract`; the decrement is
/// skipped when a waker already reset the word.
#[derive(Debug, Default)]
pub(crate) struct Waiters {
    word: AtomicU32,
}

impl Waiters {
    pub(crate) const fn new() -> Self {
        Self {
            word: AtomicU32::new(0),
        }
    }

    /// Registers this thread as a prospective parker and returns the value
    /// to hand to [`park`](Self::park).
    ///
    /// The fence orders the increment before the caller's re-check of the
    /// channel state. Together with the fence in [`wake_all`](Self::wake_all)
    /// it closes the store-buffering window where the re-check reads a stale
    /// channel state while the waker reads a stale (zero) word - both sides
    /// skipping, one of them asleep.
    #[inline]
    pub(crate) fn announce(&self) -> u32 {
        let v = self.word.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        fence(Ordering::SeqCst);
        v
    }

    /// Undoes an `announce` that did not lead to a park, or rebalances the
    /// word after a wake. No-op once a waker has swapped the word to zero.
    #[inline]
    pub(crate) fn retract(&self) {
        let _ = self
            .word
            .fetch_update(Ordering::Release, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    /// Parks until the word no longer holds `expected` (or spuriously).
    #[inline]
    pub(crate) fn park(&self, expected: u32) {
        atomic_wait::wait(&self.word, expected);
    }

    /// Resets the word and wakes every parked thread. The reset happens
    /// before the syscall so concurrent parkers cannot sleep through it.
    ///
    /// Callers invoke this right after publishing progress (a tail or head
    /// release); the fence orders that publish before the word check so a
    /// concurrent announcer cannot be missed (see [`announce`](Self::announce)).
    pub(crate) fn wake_all(&self) {
        fence(Ordering::SeqCst);
        if self.word.load(Ordering::Relaxed) != 0 && self.word.swap(0, Ordering::AcqRel) != 0 {
            atomic_wait::wake_all(&self.word);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn announce_and_retract_balance() {
        let w = Waiters::new();
        let v = w.announce();
        assert_eq!(v, 1);
        w.retract();
        // Balanced word: a second announce observes 1 again.
        assert_eq!(w.announce(), 1);
        w.retract();
    }

    #[test]
    fn retract_after_wake_reset_is_a_noop() {
        let w = Waiters::new();
        w.announce();
        w.wake_all();
        w.retract();
        // Still zero: the retract must not underflow past the reset.
        assert_eq!(w.announce(), 1);
        w.retract();
    }

    #[test]
    fn stale_expectation_does_not_park() {
        let w = Waiters::new();
        let v = w.announce();
        w.wake_all();
        // Word changed since the announce; this must return immediately.
        w.park(v);
    }

    #[test]
    fn wake_all_releases_a_parked_thread() {
        let w = Arc::new(Waiters::new());
        let w2 = Arc::clone(&w);
        let parked = thread::spawn(move || {
            let v = w2.announce();
            w2.park(v);
            w2.retract();
        });
        // Give the parker a moment to reach the futex.
        thread::sleep(Duration::from_millis(50));
        w.wake_all();
        parked.join().unwrap();
    }
}
