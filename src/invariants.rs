//! Debug assertion macros for ring protocol invariants.
//!
//! Active only in debug builds; release builds pay nothing. Shared by the
//! single-tail core and the MPSC producer table.

/// Assert that the fill never exceeds capacity.
///
/// Holds for any snapshot: `0 <= tail - head <= capacity`.
macro_rules! debug_assert_fill_bounded {
    ($fill:expr, $capacity:expr) => {
        debug_assert!(
            $fill <= $capacity as u64,
            "ring overfilled: {} items in {} slots",
            $fill,
            $capacity,
        )
    };
}

/// Assert that a position counter only moves forward.
macro_rules! debug_assert_monotonic {
    ($name:literal, $old:expr, $new:expr) => {
        debug_assert!(
            $new >= $old,
            "{} moved backwards: {} -> {}",
            $name,
            $old,
            $new,
        )
    };
}

/// Assert that a consumer read stays inside the published window.
macro_rules! debug_assert_published {
    ($pos:expr, $head:expr, $horizon:expr) => {
        debug_assert!(
            $pos >= $head && $pos < $horizon,
            "reading position {} outside published window [{}, {})",
            $pos,
            $head,
            $horizon,
        )
    };
}

pub(crate) use debug_assert_fill_bounded;
pub(crate) use debug_assert_monotonic;
pub(crate) use debug_assert_published;
