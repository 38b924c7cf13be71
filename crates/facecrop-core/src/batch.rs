/// Split `items` into consecutive groups of at most `size`, preserving order.
///
/// A `size` of zero is treated as one.
pub fn chunks_of<T>(items: &[T], size: usize) -> Vec<&[T]> {
    items.chunks(size.max(1)).collect()
}
