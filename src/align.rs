/// Round `ix` up to the next multiple of `alignment`.
pub(crate) fn align(ix: usize, alignment: usize) -> usize {
    debug_assert!(
        alignment.is_power_of_two(),
        "{} is not power of 2, cannot be used as alignment",
        alignment
    );
    (ix + alignment - 1) & !(alignment - 1)
}

/// Number of padding bytes needed at `ix` to reach `alignment`.
pub(crate) fn padding(ix: usize, alignment: usize) -> usize {
    align(ix, alignment) - ix
}
