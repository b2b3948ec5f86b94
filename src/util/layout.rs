//! Layout utilities for pitches and staging sizes.

/// Align a size up to the given power-of-two alignment. `None` on overflow.
#[inline]
pub const fn align_up(size: usize, align: usize) -> Option<usize> {
    match size.checked_add(align - 1) {
        Some(padded) => Some(padded & !(align - 1)),
        None => None,
    }
}

/// Round a size up to a multiple of `granularity` (any non-zero value).
#[inline]
pub const fn round_up(size: usize, granularity: usize) -> Option<usize> {
    match size.checked_add(granularity - 1) {
        Some(padded) => (padded / granularity).checked_mul(granularity),
        None => None,
    }
}

/// Bytes spanned by a `width x rows x slices` block laid out with the given
/// pitches: everything up to the end of the last row, not a full trailing slice.
/// `None` when the span does not fit in `usize`.
#[inline]
pub fn pitched_span(
    row_bytes: usize,
    rows: usize,
    slices: usize,
    row_pitch: usize,
    slice_pitch: usize,
) -> Option<usize> {
    if row_bytes == 0 || rows == 0 || slices == 0 {
        return Some(0);
    }
    (slices - 1)
        .checked_mul(slice_pitch)?
        .checked_add((rows - 1).checked_mul(row_pitch)?)?
        .checked_add(row_bytes)
}
