//! Bump-pointer allocation region.
//!
//! A region is the single-owner record of a space's allocation state: a
//! mutable `top` and a fixed `limit`. It is passed by reference into every
//! allocation call; there is no hidden global top.

use crate::page::POINTER_SIZE;
use tagged_values::{HEAP_OBJECT_TAG, TAG_MASK};

/// The three request shapes the allocator accepts.
#[derive(Debug, Clone, Copy)]
pub enum AllocationSize {
    /// A fixed byte size known at code-generation time.
    Fixed(usize),
    /// `header + count * element_size`, for variable-length arrays.
    HeaderAndElements {
        /// Byte size of the object header.
        header: usize,
        /// Number of elements.
        count: usize,
        /// Byte size of each element.
        element_size: usize,
    },
    /// A fully runtime-computed byte size.
    Runtime(usize),
}

impl AllocationSize {
    /// Total request size in bytes.
    pub fn bytes(self) -> usize {
        match self {
            AllocationSize::Fixed(size) => size,
            AllocationSize::HeaderAndElements {
                header,
                count,
                element_size,
            } => header + count * element_size,
            AllocationSize::Runtime(size) => size,
        }
    }
}

/// Modifiers for an allocation request.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocationFlags {
    /// The caller already holds the region's top and passes it instead of
    /// reloading it. Checked against the real top in debug builds.
    pub known_top: Option<usize>,
    /// Add the heap-object tag to the returned base address.
    pub tag_result: bool,
}

impl AllocationFlags {
    /// No modifiers: reload top, return an untagged base.
    pub const NONE: AllocationFlags = AllocationFlags {
        known_top: None,
        tag_result: false,
    };

    /// Return a tagged base address.
    pub fn tagged() -> AllocationFlags {
        AllocationFlags {
            known_top: None,
            tag_result: true,
        }
    }

    /// The caller already holds the region's top.
    pub fn with_known_top(top: usize) -> AllocationFlags {
        AllocationFlags {
            known_top: Some(top),
            tag_result: false,
        }
    }
}

/// Outcome of an allocation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation {
    /// The span `[base, end)` was carved out of the region. `base` carries
    /// the heap-object tag when the request asked for it.
    Success {
        /// Base address of the new object (tagged iff requested).
        base: usize,
        /// One past the last byte; the region's new top.
        end: usize,
    },
    /// The request would overrun the limit. The region is unchanged; the
    /// caller must take its GC-required path.
    GcRequired,
}

impl Allocation {
    /// The base address on success.
    pub fn base(self) -> Option<usize> {
        match self {
            Allocation::Success { base, .. } => Some(base),
            Allocation::GcRequired => None,
        }
    }

    /// Returns whether the request was refused.
    pub fn is_gc_required(self) -> bool {
        self == Allocation::GcRequired
    }
}

/// A contiguous bump-pointer region with mutable `top` and fixed `limit`.
#[derive(Debug)]
pub struct AllocationRegion {
    top: usize,
    limit: usize,
    start: usize,
}

impl AllocationRegion {
    /// Creates a region spanning `[start, limit)`.
    pub fn new(start: usize, limit: usize) -> AllocationRegion {
        debug_assert!(start <= limit);
        AllocationRegion {
            top: start,
            limit,
            start,
        }
    }

    /// Current allocation top.
    pub fn top(&self) -> usize {
        self.top
    }

    /// Fixed allocation limit.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Bytes still available.
    pub fn remaining(&self) -> usize {
        self.limit - self.top
    }

    /// Returns whether `address` lies within the region's span.
    pub fn contains(&self, address: usize) -> bool {
        address >= self.start && address < self.limit
    }

    /// Attempts to carve `size` bytes off the region.
    ///
    /// On success the region's top advances to the end of the span. On
    /// refusal the top is left untouched and the caller routes to its
    /// GC-required path.
    pub fn allocate(&mut self, size: AllocationSize, flags: AllocationFlags) -> Allocation {
        let top = match flags.known_top {
            Some(known) => {
                debug_assert_eq!(known, self.top, "unexpected allocation top");
                known
            }
            None => self.top,
        };
        let bytes = size.bytes();
        debug_assert_eq!(bytes % POINTER_SIZE, 0, "unaligned allocation request");

        let candidate_end = top + bytes;
        if candidate_end > self.limit {
            return Allocation::GcRequired;
        }
        self.top = candidate_end;

        let base = if flags.tag_result {
            top | HEAP_OBJECT_TAG as usize
        } else {
            top
        };
        Allocation::Success {
            base,
            end: candidate_end,
        }
    }

    /// Retracts the most recent allocation.
    ///
    /// `object` may still carry the heap-object tag. Only legal for the most
    /// recently allocated object: a multi-step allocation sequence that fails
    /// partway uses this to avoid leaving a half-initialized object
    /// reachable.
    pub fn undo(&mut self, object: usize) {
        let untagged = object & !(TAG_MASK as usize);
        debug_assert!(
            untagged >= self.start && untagged < self.top,
            "undo of non-allocated memory"
        );
        self.top = untagged;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(size: usize) -> AllocationRegion {
        // A synthetic address range; the region never dereferences it.
        AllocationRegion::new(0x10000, 0x10000 + size)
    }

    #[test]
    fn test_allocation_size_shapes() {
        assert_eq!(AllocationSize::Fixed(64).bytes(), 64);
        assert_eq!(
            AllocationSize::HeaderAndElements {
                header: 16,
                count: 3,
                element_size: 8
            }
            .bytes(),
            40
        );
        assert_eq!(AllocationSize::Runtime(24).bytes(), 24);
    }

    #[test]
    fn test_exact_fit_succeeds() {
        let mut region = region(64);
        let outcome = region.allocate(AllocationSize::Fixed(64), AllocationFlags::NONE);
        assert_eq!(
            outcome,
            Allocation::Success {
                base: 0x10000,
                end: 0x10040
            }
        );
        assert_eq!(region.top(), region.limit());
    }

    #[test]
    fn test_overrun_leaves_top_unchanged() {
        let mut region = region(64);
        let top_before = region.top();
        let outcome = region.allocate(AllocationSize::Fixed(72), AllocationFlags::NONE);
        assert!(outcome.is_gc_required());
        assert_eq!(region.top(), top_before);

        // The region still services a fitting request afterwards.
        let outcome = region.allocate(AllocationSize::Fixed(64), AllocationFlags::NONE);
        assert!(!outcome.is_gc_required());
    }

    #[test]
    fn test_sequential_spans_do_not_overlap() {
        let mut region = region(128);
        let first = region
            .allocate(AllocationSize::Fixed(48), AllocationFlags::NONE)
            .base()
            .unwrap();
        let second = region
            .allocate(AllocationSize::Fixed(48), AllocationFlags::NONE)
            .base()
            .unwrap();
        assert_eq!(second, first + 48);
    }

    #[test]
    fn test_tagged_result() {
        let mut region = region(64);
        let base = region
            .allocate(AllocationSize::Fixed(32), AllocationFlags::tagged())
            .base()
            .unwrap();
        assert_eq!(base & HEAP_OBJECT_TAG as usize, HEAP_OBJECT_TAG as usize);
        assert_eq!(base & !(TAG_MASK as usize), 0x10000);
    }

    #[test]
    fn test_known_top_skips_reload() {
        let mut region = region(64);
        let top = region.top();
        let outcome = region.allocate(
            AllocationSize::Fixed(32),
            AllocationFlags::with_known_top(top),
        );
        assert_eq!(outcome.base(), Some(top));
    }

    #[test]
    fn test_undo_resets_top() {
        let mut region = region(128);
        let first = region
            .allocate(AllocationSize::Fixed(48), AllocationFlags::NONE)
            .base()
            .unwrap();
        region
            .allocate(AllocationSize::Fixed(48), AllocationFlags::NONE)
            .base()
            .unwrap();

        // Undo the second allocation; top returns to the first object's end.
        region.undo(first + 48);
        assert_eq!(region.top(), first + 48);

        // Undo the first as well, through its tagged form.
        region.undo(first | HEAP_OBJECT_TAG as usize);
        assert_eq!(region.top(), first);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "undo of non-allocated memory")]
    fn test_undo_of_non_allocated_memory_panics() {
        let mut region = region(64);
        region.allocate(AllocationSize::Fixed(32), AllocationFlags::NONE);
        region.undo(region.top() + 32);
    }
}
