//! Size classes for small objects.
//!
//! Requests up to [`MAX_SMALL_SIZE`] bytes are rounded up to one of
//! [`NUM_SIZE_CLASSES`] - 1 object sizes. Each class also fixes how many pages
//! a span of that class spans, picked so that chopping the span into equal
//! slots wastes at most 1/8 of it. Together with the rounding waste (at most
//! 1/8 of the request, from the alignment steps below) the worst case stays
//! around 26.6%.
//!
//! Alignment starts at 8 bytes and is bumped at power-of-two sizes: 16 bytes
//! from 16, `size / 8` from 128 and 256 bytes from 2048. Consecutive
//! candidates that would produce the same span shape are merged, keeping the
//! larger size.
//!
//! Class 0 is reserved for the large-object path.

use std::sync::LazyLock;

use crate::error::AllocError;

/// Page shift of the heap's page granularity.
pub const PAGE_SHIFT: usize = 13;

/// Heap page size (8 KiB).
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Number of size classes, including the reserved class 0.
pub const NUM_SIZE_CLASSES: usize = 67;

/// Largest request served from a size class.
pub const MAX_SMALL_SIZE: usize = 32 << 10;

/// Pointer-free requests below this size are packed by the tiny allocator.
pub const TINY_SIZE: usize = 16;

/// The size class backing tiny blocks.
pub const TINY_SIZE_CLASS: usize = 2;

/// Most slots a span of any class is carved into.
pub(crate) const MAX_SPAN_OBJECTS: usize = PAGE_SIZE / 8;

const SMALL_SIZE_DIV: usize = 8;
const SMALL_SIZE_MAX: usize = 1024;
const LARGE_SIZE_DIV: usize = 128;

const CLASS8_LEN: usize = SMALL_SIZE_MAX / SMALL_SIZE_DIV + 1;
const CLASS128_LEN: usize = (MAX_SMALL_SIZE - SMALL_SIZE_MAX) / LARGE_SIZE_DIV + 1;

/// Multiply-shift constants turning "byte offset in span" into "slot index"
/// without a division.
///
/// For an object size `d = 2^shift * odd`, the index of offset `n` is
/// `((n >> shift) * mul) >> shift2`. This is exact for every offset that is
/// a multiple of 8 inside a span of the class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DivMagic {
    shift: u32,
    mul: u32,
    shift2: u32,
    base_mask: usize,
}

impl DivMagic {
    const fn compute(size: usize) -> Self {
        if size == 0 {
            return Self {
                shift: 0,
                mul: 0,
                shift2: 0,
                base_mask: 0,
            };
        }
        let shift = size.trailing_zeros();
        let d = (size >> shift) as u64;
        let mut k = 63;
        while ((1u64 << k) + d - 1) / d >= 1 << 32 {
            k -= 1;
        }
        #[allow(clippy::cast_possible_truncation)]
        let mul = (((1u64 << k) + d - 1) / d) as u32;
        let base_mask = if size.is_power_of_two() { !(size - 1) } else { 0 };
        Self {
            shift,
            mul,
            shift2: k,
            base_mask,
        }
    }

    /// Returns the slot index containing byte `offset`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn slot_index(self, offset: usize) -> usize {
        (((offset >> self.shift) as u64 * self.mul as u64) >> self.shift2) as usize
    }

    /// Mask rounding an offset down to its slot start, or 0 when the object
    /// size is not a power of two.
    #[inline]
    #[must_use]
    pub const fn base_mask(self) -> usize {
        self.base_mask
    }
}

/// One size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeClass {
    /// Class id; 0 is the large-object sentinel.
    pub id: usize,
    /// Object (slot) size in bytes.
    pub size: usize,
    /// Pages per span of this class.
    pub pages: usize,
    /// Slots carved from one span.
    pub objects: usize,
    /// Division constants for `size`.
    pub magic: DivMagic,
}

impl SizeClass {
    const LARGE: Self = Self {
        id: 0,
        size: 0,
        pages: 0,
        objects: 0,
        magic: DivMagic::compute(0),
    };

    /// Bytes in one span of this class.
    #[must_use]
    pub const fn span_bytes(&self) -> usize {
        self.pages << PAGE_SHIFT
    }
}

/// The computed size-class table plus its O(1) lookup arrays.
#[derive(Debug, Clone)]
pub struct SizeClasses {
    classes: Vec<SizeClass>,
    class8: [u8; CLASS8_LEN],
    class128: [u8; CLASS128_LEN],
}

static SIZE_CLASSES: LazyLock<SizeClasses> = LazyLock::new(|| match SizeClasses::compute() {
    Ok(table) => table,
    Err(err) => panic!("size class table is inconsistent: {err}"),
});

/// Returns the process-wide size-class table, computing it on first use.
///
/// # Panics
///
/// Panics if the computed table fails its consistency checks. Nothing can
/// be allocated with a broken table.
#[must_use]
pub fn size_classes() -> &'static SizeClasses {
    &SIZE_CLASSES
}

impl SizeClasses {
    /// Computes the table and checks it against [`NUM_SIZE_CLASSES`].
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::ClassCount`] or [`AllocError::Configuration`] if
    /// the table is inconsistent.
    pub fn compute() -> Result<Self, AllocError> {
        Self::build(NUM_SIZE_CLASSES)
    }

    fn build(expected: usize) -> Result<Self, AllocError> {
        let mut classes = vec![SizeClass::LARGE];
        let mut align = 8;
        let mut size = align;
        while size <= MAX_SMALL_SIZE {
            if size.is_power_of_two() {
                if size >= 2048 {
                    align = 256;
                } else if size >= 128 {
                    align = size / 8;
                } else if size >= 16 {
                    align = 16;
                }
            }
            if !align.is_power_of_two() {
                return Err(AllocError::Configuration("size class alignment is not a power of two"));
            }

            let mut span_bytes = PAGE_SIZE;
            while span_bytes % size > span_bytes / 8 {
                span_bytes += PAGE_SIZE;
            }
            let pages = span_bytes >> PAGE_SHIFT;

            let last = classes.len() - 1;
            if last >= 1 {
                let prev = &mut classes[last];
                if prev.pages == pages && span_bytes / prev.size == span_bytes / size {
                    prev.size = size;
                    size += align;
                    continue;
                }
            }

            classes.push(SizeClass {
                id: classes.len(),
                size,
                pages,
                objects: 0,
                magic: DivMagic::default(),
            });
            size += align;
        }

        if classes.len() != expected {
            return Err(AllocError::ClassCount {
                expected,
                computed: classes.len(),
            });
        }

        for class in &mut classes[1..] {
            class.objects = class.span_bytes() / class.size;
            class.magic = DivMagic::compute(class.size);
        }

        let mut table = Self {
            classes,
            class8: [0; CLASS8_LEN],
            class128: [0; CLASS128_LEN],
        };
        table.fill_lookup();
        table.check()?;
        Ok(table)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn fill_lookup(&mut self) {
        let mut next = 0;
        for class in &self.classes[1..] {
            while next < SMALL_SIZE_MAX && next <= class.size {
                self.class8[next / SMALL_SIZE_DIV] = class.id as u8;
                next += SMALL_SIZE_DIV;
            }
            if next >= SMALL_SIZE_MAX {
                while next <= class.size {
                    self.class128[(next - SMALL_SIZE_MAX) / LARGE_SIZE_DIV] = class.id as u8;
                    next += LARGE_SIZE_DIV;
                }
            }
        }
    }

    fn check(&self) -> Result<(), AllocError> {
        if self.classes[TINY_SIZE_CLASS].size != TINY_SIZE {
            return Err(AllocError::Configuration("tiny size class is not 16 bytes"));
        }
        if self.classes.last().map(|c| c.size) != Some(MAX_SMALL_SIZE) {
            return Err(AllocError::Configuration("largest size class does not cover the small limit"));
        }
        for pair in self.classes[1..].windows(2) {
            if pair[0].size >= pair[1].size {
                return Err(AllocError::Configuration("size classes are not increasing"));
            }
        }
        for class in &self.classes[1..] {
            if class.objects > MAX_SPAN_OBJECTS {
                return Err(AllocError::Configuration("size class has more slots than a span can track"));
            }
            if self.classify(class.size) != class.id {
                return Err(AllocError::Configuration("size class lookup is not idempotent"));
            }
        }
        Ok(())
    }

    /// Number of classes, including class 0.
    #[must_use]
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// Always `false`: a computed table has at least the reserved class.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Maps a request size to its class id.
    ///
    /// # Panics
    ///
    /// Panics if `size` exceeds [`MAX_SMALL_SIZE`]; such requests belong on
    /// the large-object path.
    #[inline]
    #[must_use]
    pub fn classify(&self, size: usize) -> usize {
        assert!(
            size <= MAX_SMALL_SIZE,
            "classify: {size} bytes is not a small size"
        );
        if size <= SMALL_SIZE_MAX - SMALL_SIZE_DIV {
            usize::from(self.class8[(size + SMALL_SIZE_DIV - 1) / SMALL_SIZE_DIV])
        } else {
            usize::from(self.class128[(size + LARGE_SIZE_DIV - 1 - SMALL_SIZE_MAX) / LARGE_SIZE_DIV])
        }
    }

    /// Returns the class record for `id`.
    #[inline]
    #[must_use]
    pub fn class(&self, id: usize) -> &SizeClass {
        &self.classes[id]
    }

    /// Object size of class `id`.
    #[inline]
    #[must_use]
    pub fn class_size(&self, id: usize) -> usize {
        self.classes[id].size
    }

    /// Number of bytes actually handed out for a request of `size` bytes.
    ///
    /// Small sizes round to their class; larger sizes round to whole pages.
    /// Returns `None` if rounding overflows.
    #[must_use]
    pub fn round_up(&self, size: usize) -> Option<usize> {
        if size <= MAX_SMALL_SIZE {
            return Some(self.class_size(self.classify(size)));
        }
        size.checked_add(PAGE_SIZE - 1).map(|s| s & !(PAGE_SIZE - 1))
    }

    /// Iterates over the real classes (1..).
    pub fn iter(&self) -> impl Iterator<Item = &SizeClass> {
        self.classes[1..].iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Alignment the class table uses for a request of `size` bytes.
    fn alignment_for(size: usize) -> usize {
        let floor = 1usize << (usize::BITS - 1 - size.leading_zeros());
        if floor >= 2048 {
            256
        } else if floor >= 128 {
            floor / 8
        } else if floor >= 16 {
            16
        } else {
            8
        }
    }

    #[test]
    fn test_class_count_and_tiny_class() {
        let table = SizeClasses::compute().unwrap();
        assert_eq!(table.len(), NUM_SIZE_CLASSES);
        assert_eq!(table.class_size(TINY_SIZE_CLASS), TINY_SIZE);
        assert_eq!(table.class_size(1), 8);
        assert_eq!(table.class_size(NUM_SIZE_CLASSES - 1), MAX_SMALL_SIZE);
    }

    #[test]
    fn test_wrong_expected_count_is_rejected() {
        let err = SizeClasses::build(NUM_SIZE_CLASSES + 1).unwrap_err();
        assert!(matches!(
            err,
            AllocError::ClassCount {
                expected: 68,
                computed: 67
            }
        ));
    }

    #[test]
    fn test_known_class_shapes() {
        let t = size_classes();
        let shapes: Vec<(usize, usize)> = t.iter().map(|c| (c.size, c.pages)).collect();
        assert_eq!(shapes[..5], [(8, 1), (16, 1), (32, 1), (48, 1), (64, 1)]);
        assert!(shapes.contains(&(1152, 1)));
        assert!(shapes.contains(&(1408, 2)));
        assert!(shapes.contains(&(5376, 2)));
        assert!(shapes.contains(&(6400, 4)));
        assert!(shapes.contains(&(8192, 1)));
        assert!(shapes.contains(&(28416, 7)));
        assert_eq!(shapes.last(), Some(&(32768, 4)));
    }

    #[test]
    fn test_classify_covers_request() {
        let t = size_classes();
        for size in 1..=MAX_SMALL_SIZE {
            let class = t.classify(size);
            assert!(class > 0);
            assert!(t.class_size(class) >= size, "size {size}");
            if class > 1 {
                assert!(t.class_size(class - 1) < size, "size {size} skipped a class");
            }
        }
    }

    #[test]
    fn test_classify_idempotent_on_class_sizes() {
        let t = size_classes();
        for class in t.iter() {
            assert_eq!(t.classify(class.size), class.id);
        }
    }

    #[test]
    fn test_rounding_waste_below_1k() {
        // Up to 1 KiB no classes are merged, so rounding stays within 1/8
        // of the request at the table's alignment.
        let t = size_classes();
        for size in 1..=1024 {
            let align = alignment_for(size);
            let bound = (size * 9).div_ceil(8).next_multiple_of(align);
            assert!(t.class_size(t.classify(size)) <= bound, "size {size}");
        }
    }

    #[test]
    fn test_combined_waste_bound() {
        // Merged classes above 1 KiB trade rounding waste for span waste;
        // the combined footprint never exceeds 1.125 * 1.125. Below the
        // first size whose alignment is at most 1/8 of it, the alignment
        // alone dominates (a 1-byte request takes 8).
        let t = size_classes();
        for size in 1..=MAX_SMALL_SIZE {
            if alignment_for(size) * 8 > size {
                continue;
            }
            let class = t.class(t.classify(size));
            let used = class.objects * size;
            assert!(class.span_bytes() * 64 <= used * 81, "size {size}");
        }
    }

    #[test]
    fn test_span_tail_waste() {
        for class in size_classes().iter() {
            let tail = class.span_bytes() - class.objects * class.size;
            assert!(tail <= class.span_bytes() / 8, "class {}", class.id);
        }
    }

    #[test]
    fn test_scenario_sizes() {
        let t = size_classes();
        assert_eq!(t.class_size(t.classify(1)), 8);
        assert_eq!(t.class_size(t.classify(24)), 32);
        let c = t.classify(5000);
        assert_eq!(t.class_size(c), 5376);
        assert!(t.class_size(c) <= 5625);
    }

    #[test]
    #[should_panic(expected = "not a small size")]
    fn test_classify_rejects_large() {
        let _ = size_classes().classify(MAX_SMALL_SIZE + 1);
    }

    #[test]
    fn test_div_magic_exact() {
        for class in size_classes().iter() {
            let magic = class.magic;
            for offset in (0..class.span_bytes()).step_by(8) {
                assert_eq!(
                    magic.slot_index(offset),
                    offset / class.size,
                    "class {} offset {offset}",
                    class.id
                );
            }
            if class.size.is_power_of_two() {
                assert_eq!(magic.base_mask(), !(class.size - 1));
            } else {
                assert_eq!(magic.base_mask(), 0);
            }
        }
    }

    #[test]
    fn test_round_up() {
        let t = size_classes();
        assert_eq!(t.round_up(0), Some(8));
        assert_eq!(t.round_up(17), Some(32));
        assert_eq!(t.round_up(MAX_SMALL_SIZE + 1), Some(MAX_SMALL_SIZE + PAGE_SIZE));
        assert_eq!(t.round_up(usize::MAX), None);
    }
}
