//! Property-based checks of the channel invariants: bounded fill, ordering,
//! exactly-once accounting, and partial reservation bounds.

use proptest::prelude::*;
use ringchan::{mpsc, spsc};

proptest! {
    /// The fill never exceeds capacity for any interleaving of sends and
    /// receives, and every accepted item is eventually delivered in order.
    #[test]
    fn spsc_fill_bounded_and_fifo(
        capacity in 1usize..64,
        ops in prop::collection::vec(any::<bool>(), 1..200),
    ) {
        let (mut tx, mut rx) = spsc::channel::<u64>(capacity).unwrap();
        let rounded = rx.capacity();

        let mut next = 0u64;
        let mut expected = 0u64;
        for send_op in ops {
            if send_op {
                let full_before = (next - expected) as usize == rounded;
                let accepted = tx.try_send(next);
                prop_assert_eq!(accepted, !full_before, "accept iff not full");
                if accepted {
                    next += 1;
                }
            } else if let Some(v) = rx.try_recv() {
                prop_assert_eq!(v, expected);
                expected += 1;
            }
            prop_assert!(rx.len() <= rounded, "fill {} over capacity {}", rx.len(), rounded);
            prop_assert!(expected <= next);
        }

        // Drain: everything accepted arrives, in order, exactly once.
        while let Some(v) = rx.try_recv() {
            prop_assert_eq!(v, expected);
            expected += 1;
        }
        prop_assert_eq!(expected, next);
    }

    /// A batch send accepts exactly min(len, free slots) items, and they
    /// come back in order.
    #[test]
    fn spsc_batch_clipping(
        capacity in 1usize..32,
        prefill in 0usize..16,
        batch_len in 0usize..48,
    ) {
        let (mut tx, mut rx) = spsc::channel::<u64>(capacity).unwrap();
        let rounded = rx.capacity();

        let prefill = prefill.min(rounded);
        for i in 0..prefill {
            prop_assert!(tx.try_send(i as u64));
        }

        let batch: Vec<u64> = (1000..1000 + batch_len as u64).collect();
        let accepted = tx.try_send_batch(&batch);
        prop_assert_eq!(accepted, batch_len.min(rounded - prefill));

        let mut out = vec![0u64; rounded + 8];
        let drained = rx.try_recv_batch(&mut out);
        prop_assert_eq!(drained, prefill + accepted);
        for (i, v) in out[..prefill].iter().enumerate() {
            prop_assert_eq!(*v, i as u64);
        }
        for (i, v) in out[prefill..drained].iter().enumerate() {
            prop_assert_eq!(*v, 1000 + i as u64);
        }
    }

    /// A reservation is never longer than the request or the free window,
    /// and abandoning it publishes nothing.
    #[test]
    fn spsc_partial_reservation(
        capacity in 1usize..32,
        prefill in 0usize..16,
        request in 1usize..48,
    ) {
        let (mut tx, mut rx) = spsc::channel::<u64>(capacity).unwrap();
        let rounded = rx.capacity();

        let prefill = prefill.min(rounded);
        for i in 0..prefill {
            prop_assert!(tx.try_send(i as u64));
        }
        let free = rounded - prefill;

        match tx.reserve(request) {
            Some(r) => {
                prop_assert!(r.len() <= request);
                prop_assert!(r.len() <= free);
                prop_assert!(r.len() > 0);
                drop(r); // abandon
            }
            None => prop_assert_eq!(free, 0),
        }

        // Nothing beyond the prefill is visible.
        let mut out = vec![0u64; rounded + 8];
        prop_assert_eq!(rx.try_recv_batch(&mut out), prefill);
    }

    /// Two producers interleaved deterministically: the delivered multiset
    /// equals the sent multiset and each producer's stream stays ordered.
    #[test]
    fn mpsc_exactly_once_two_producers(
        capacity in 2usize..64,
        plan in prop::collection::vec(any::<bool>(), 1..120),
    ) {
        let (channel, mut rx) = mpsc::channel::<(usize, u64)>(capacity, 2).unwrap();
        let mut producers = [channel.register().unwrap(), channel.register().unwrap()];

        let mut sent = [0u64; 2];
        for pick in plan {
            let who = usize::from(pick);
            if producers[who].try_send((who, sent[who])) {
                sent[who] += 1;
            }
        }
        let [a, b] = producers;
        a.unregister();
        b.unregister();

        let mut seen = [0u64; 2];
        while let Some((who, seq)) = rx.try_recv() {
            prop_assert_eq!(seq, seen[who], "producer {} out of order", who);
            seen[who] += 1;
        }
        prop_assert_eq!(seen, sent);
    }

    /// Single-producer MPSC round trip: output equals input.
    #[test]
    fn mpsc_single_producer_round_trip(
        capacity in 1usize..64,
        xs in prop::collection::vec(any::<u64>(), 0..200),
    ) {
        let (channel, mut rx) = mpsc::channel::<u64>(capacity, 1).unwrap();
        let mut tx = channel.register().unwrap();

        let mut ys = Vec::with_capacity(xs.len());
        for &x in &xs {
            while !tx.try_send(x) {
                if let Some(v) = rx.try_recv() {
                    ys.push(v);
                }
            }
        }
        drop(tx);
        while let Some(v) = rx.recv() {
            ys.push(v);
        }
        prop_assert_eq!(ys, xs);
    }

    /// Capacity rounding: accepted burst size equals the next power of two.
    #[test]
    fn capacity_rounds_to_next_power_of_two(capacity in 1usize..1000) {
        let (mut tx, rx) = spsc::channel::<u8>(capacity).unwrap();
        prop_assert_eq!(rx.capacity(), capacity.next_power_of_two());
        let mut accepted = 0usize;
        while tx.try_send(0) {
            accepted += 1;
        }
        prop_assert_eq!(accepted, rx.capacity());
    }
}
