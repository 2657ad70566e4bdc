/// Rounds `size` up to the next multiple of `n`.
#[inline]
pub(crate) fn round_up(size: usize, n: usize) -> usize {
    n * ((size + n - 1) / n)
}

/// Rounds `size` up to the next multiple of `n`, or `None` when the result
/// would not fit in a `usize`. The multiplication back cannot overflow once
/// the addition has been checked.
#[inline]
pub(crate) fn checked_round_up(size: usize, n: usize) -> Option<usize> {
    Some(n * (size.checked_add(n - 1)? / n))
}
