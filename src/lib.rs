//! ringchan - Bounded Lock-Free Ring Channels
//!
//! In-process message passing over a fixed, power-of-two ring buffer, in
//! three topologies:
//!
//! - [`spsc`] - one producer, one consumer; plain load/store protocol
//! - [`mpsc`] - registered producers over one shared ring, single consumer
//!   with a generation-cached min-tail scan
//! - [`spmc`] - one producer, consumers competing by CAS on the head
//!
//! # Key Features
//!
//! - 128-byte padding on every hand-off atomic (prefetcher false sharing
//!   elimination)
//! - Zero-copy reserve/commit batch API ([`Reservation`])
//! - Batch send/receive with a single atomic publish per batch
//! - Blocking paths: exponential backoff, then futex park/wake keyed on
//!   32-bit waiter words
//! - Guaranteed consumer termination once every producer retires
//!
//! # Example
//!
//! ```
//! let (channel, mut rx) = ringchan::mpsc::channel::<u64>(1024, 4).unwrap();
//!
//! let mut tx = channel.register().unwrap();
//! tx.send(42).unwrap();
//!
//! // Zero-copy: write in place, publish with one tail release.
//! if let Some(mut reservation) = tx.reserve(2) {
//!     let (first, _) = reservation.as_mut_slices();
//!     for (i, slot) in first.iter_mut().enumerate() {
//!         slot.write(i as u64);
//!     }
//!     reservation.commit();
//! }
//!
//! drop(tx); // retire: the receiver can now drain and terminate
//! let mut got = Vec::new();
//! while let Some(v) = rx.recv() {
//!     got.push(v);
//! }
//! assert_eq!(got, [42, 0, 1]);
//! ```

mod backoff;
mod error;
mod invariants;
mod metrics;
mod park;
mod reservation;
mod ring;
mod sender;

pub mod mpsc;
pub mod spmc;
pub mod spsc;

pub use backoff::Backoff;
pub use error::{ChannelError, MAX_PRODUCER_LIMIT};
pub use metrics::{Metrics, MetricsSnapshot};
pub use reservation::Reservation;
pub use sender::Sender;
