//! Work partitioning and multi-dimensional index iteration.
//!
//! `split_work` is the sole load-distribution mechanism in this crate:
//! every thread evaluates it independently from `(total, nthr, ithr)` and
//! arrives at the same disjoint cover of `[0, total)` without any
//! communication. The nd-iterator maps a linear work index to a coordinate
//! tuple under a caller-chosen nesting order and advances it one unit at a
//! time with carry.

use std::ops::Range;

/// Contiguous `[start, end)` slice of `total` work items for thread `ithr`
/// of `nthr`. Range sizes differ by at most one item; the remainder goes
/// to the lowest-ranked threads.
#[inline]
pub fn split_work(total: usize, nthr: usize, ithr: usize) -> Range<usize> {
    assert!(nthr >= 1 && ithr < nthr);
    let base = total / nthr;
    let rem = total % nthr;
    let start = ithr * base + ithr.min(rem);
    let end = start + base + usize::from(ithr < rem);
    start..end
}

/// Decompose `linear` into coordinates under `dims`. Row-major: the last
/// dimension varies fastest.
#[inline]
pub fn nd_iterator_init<const N: usize>(mut linear: usize, dims: [usize; N]) -> [usize; N] {
    let mut coords = [0usize; N];
    for i in (0..N).rev() {
        coords[i] = linear % dims[i];
        linear /= dims[i];
    }
    debug_assert_eq!(linear, 0, "linear index out of range for dims");
    coords
}

/// Advance `coords` by one linear unit, carrying from the innermost
/// dimension outward. Returns `false` when the tuple wraps back to zero.
#[inline]
pub fn nd_iterator_step<const N: usize>(coords: &mut [usize; N], dims: [usize; N]) -> bool {
    for i in (0..N).rev() {
        coords[i] += 1;
        if coords[i] < dims[i] {
            return true;
        }
        coords[i] = 0;
    }
    false
}

/// Recompose coordinates into a linear index; inverse of
/// [`nd_iterator_init`].
#[inline]
pub fn nd_index<const N: usize>(coords: [usize; N], dims: [usize; N]) -> usize {
    let mut linear = 0usize;
    for i in 0..N {
        debug_assert!(coords[i] < dims[i]);
        linear = linear * dims[i] + coords[i];
    }
    linear
}
