/// The ordered Byte-Sizes the Pool segregates requests into, everything
/// above the largest Class goes straight to the System-Allocator
pub(super) const SIZE_CLASSES: [usize; 16] = [
    8, 16, 24, 32, 48, 64, 96, 128, 192, 256, 384, 512, 768, 1024, 1536, 2048,
];

pub(super) const fn class_count() -> usize {
    SIZE_CLASSES.len()
}

/// Maps the given Size to the smallest Class that still fits it using a
/// binary search over the Class-Table, returns None for oversized requests
pub(super) fn class_index(size: usize) -> Option<usize> {
    let index = SIZE_CLASSES.partition_point(|&class| class < size);

    if index < SIZE_CLASSES.len() {
        Some(index)
    } else {
        None
    }
}

pub(super) fn block_size(index: usize) -> usize {
    SIZE_CLASSES[index]
}
