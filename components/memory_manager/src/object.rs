//! Heap object layouts and raw field access.
//!
//! Every heap object's first word is its map reference. The byte offsets in
//! the layout modules below are part of the fixed binary contract between
//! generated code, the collector's stack walker and the runtime; changing
//! them breaks collaborators that hard-code them.
//!
//! The accessors here perform plain loads and stores. A store of a heap
//! reference into an old object must be paired with a write-barrier record;
//! that pairing is the storing code's responsibility.

use crate::map::MapRef;
use crate::page::POINTER_SIZE;
use tagged_values::{Smi, TaggedValue};

/// Reads the raw word at `base + offset` (untagged base address).
///
/// # Safety
///
/// `base` must be the untagged base of a live heap object and
/// `base + offset` a word-aligned address within it.
pub unsafe fn read_word_raw(base: usize, offset: usize) -> u64 {
    *((base + offset) as *const u64)
}

/// Writes the raw word at `base + offset` (untagged base address).
///
/// # Safety
///
/// Same requirements as [`read_word_raw`].
pub unsafe fn write_word_raw(base: usize, offset: usize, word: u64) {
    *((base + offset) as *mut u64) = word;
}

/// Reads a tagged field of a live object.
///
/// # Safety
///
/// `object` must reference a live heap object with a field at `offset`.
pub unsafe fn read_field(object: TaggedValue, offset: usize) -> TaggedValue {
    TaggedValue::from_raw_word(read_word_raw(object.heap_address(), offset))
}

/// Writes a tagged field of a live object. No write barrier: callers storing
/// heap references into old-space objects must record the write separately.
///
/// # Safety
///
/// Same requirements as [`read_field`].
pub unsafe fn write_field(object: TaggedValue, offset: usize, value: TaggedValue) {
    write_word_raw(object.heap_address(), offset, value.raw_word());
}

/// The map of a live object.
///
/// # Safety
///
/// `object` must reference a live heap object.
pub unsafe fn map_of(object: TaggedValue) -> MapRef {
    MapRef::from_tagged(read_field(object, heap_object::MAP_OFFSET))
}

/// The instance type of a live object, read through its map.
///
/// # Safety
///
/// `object` must reference a live heap object.
pub unsafe fn instance_type_of(object: TaggedValue) -> u8 {
    map_of(object).instance_type()
}

/// Layout common to every heap object.
pub mod heap_object {
    /// The map reference is always the first word.
    pub const MAP_OFFSET: usize = 0;
}

/// Layout of ordinary objects.
pub mod js_object {
    use super::POINTER_SIZE;

    /// Tagged reference to the properties store.
    pub const PROPERTIES_OFFSET: usize = POINTER_SIZE;
    /// Tagged reference to the elements store.
    pub const ELEMENTS_OFFSET: usize = 2 * POINTER_SIZE;
    /// First in-object property slot.
    pub const HEADER_SIZE: usize = 3 * POINTER_SIZE;
}

/// Layout of arrays: an ordinary object plus a smi length.
pub mod js_array {
    use super::{js_object, POINTER_SIZE};

    /// Smi-tagged visible length.
    pub const LENGTH_OFFSET: usize = js_object::HEADER_SIZE;
    /// Byte size of an array instance.
    pub const SIZE: usize = js_object::HEADER_SIZE + POINTER_SIZE;
}

/// Layout of fixed arrays: map, untagged length, then tagged element words.
pub mod fixed_array {
    use super::POINTER_SIZE;

    /// Untagged element count.
    pub const LENGTH_OFFSET: usize = POINTER_SIZE;
    /// First element word.
    pub const HEADER_SIZE: usize = 2 * POINTER_SIZE;

    /// Byte size of a fixed array with `count` elements.
    pub const fn size_for(count: usize) -> usize {
        HEADER_SIZE + count * POINTER_SIZE
    }

    /// Byte offset of element `index`.
    pub const fn element_offset(index: usize) -> usize {
        HEADER_SIZE + index * POINTER_SIZE
    }
}

/// Layout of oddballs (undefined, null, booleans, the hole).
pub mod oddball {
    use super::POINTER_SIZE;

    /// Smi-tagged kind, see [`OddballKind`](super::OddballKind).
    pub const KIND_OFFSET: usize = POINTER_SIZE;
    /// Byte size of an oddball.
    pub const SIZE: usize = 2 * POINTER_SIZE;
}

/// Layout of functions.
pub mod js_function {
    use super::{js_object, POINTER_SIZE};

    /// Tagged reference to the shared function info.
    pub const SHARED_INFO_OFFSET: usize = js_object::HEADER_SIZE;
    /// Tagged reference to the function's execution context.
    pub const CONTEXT_OFFSET: usize = js_object::HEADER_SIZE + POINTER_SIZE;
    /// Tagged prototype, or the initial map when one has been installed.
    pub const PROTOTYPE_OR_INITIAL_MAP_OFFSET: usize = js_object::HEADER_SIZE + 2 * POINTER_SIZE;
    /// Byte size of a function instance.
    pub const SIZE: usize = js_object::HEADER_SIZE + 3 * POINTER_SIZE;
}

/// Layout of shared function info (compiler-produced metadata).
pub mod shared_function_info {
    use super::POINTER_SIZE;

    /// Smi-tagged declared formal parameter count, or the don't-adapt
    /// sentinel.
    pub const FORMAL_PARAMETER_COUNT_OFFSET: usize = POINTER_SIZE;
    /// Untagged code id of the function body.
    pub const CODE_OFFSET: usize = 2 * POINTER_SIZE;
    /// Untagged code id of the function's construct stub.
    pub const CONSTRUCT_STUB_OFFSET: usize = 3 * POINTER_SIZE;
    /// Byte size of a shared function info.
    pub const SIZE: usize = 4 * POINTER_SIZE;
}

/// Layout of execution contexts: a fixed array whose first slots have fixed
/// meanings.
pub mod context {
    use super::fixed_array;

    /// Slot index of the realm's global object.
    pub const GLOBAL_INDEX: usize = 0;
    /// Slot index of the realm's security token.
    pub const SECURITY_TOKEN_INDEX: usize = 1;
    /// Slot index of the realm's array constructor function.
    pub const ARRAY_FUNCTION_INDEX: usize = 2;
    /// Number of fixed slots.
    pub const SLOT_COUNT: usize = 3;

    /// Byte offset of context slot `index`.
    pub const fn slot_offset(index: usize) -> usize {
        fixed_array::element_offset(index)
    }

    /// Byte size of a context.
    pub const SIZE: usize = fixed_array::size_for(SLOT_COUNT);
}

/// Layout of global objects.
pub mod global_object {
    use super::{js_object, POINTER_SIZE};

    /// Tagged reference back to the realm's (global) context.
    pub const GLOBAL_CONTEXT_OFFSET: usize = js_object::HEADER_SIZE;
    /// Tagged reference to the object used as the default receiver.
    pub const GLOBAL_RECEIVER_OFFSET: usize = js_object::HEADER_SIZE + POINTER_SIZE;
    /// Byte size of a global object.
    pub const SIZE: usize = js_object::HEADER_SIZE + 2 * POINTER_SIZE;
}

/// Layout of global proxies, the cross-realm stand-ins for global objects.
pub mod global_proxy {
    use super::{js_object, POINTER_SIZE};

    /// Tagged reference to the realm context the proxy belongs to.
    pub const CONTEXT_OFFSET: usize = js_object::HEADER_SIZE;
    /// Byte size of a global proxy.
    pub const SIZE: usize = js_object::HEADER_SIZE + POINTER_SIZE;
}

/// Discriminates the oddball values, stored smi-tagged in the kind slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum OddballKind {
    /// The undefined value.
    Undefined = 0,
    /// The null value.
    Null = 1,
    /// The true value.
    True = 2,
    /// The false value.
    False = 3,
    /// The hole marking an unassigned array index.
    TheHole = 4,
}

impl OddballKind {
    /// The kind as a smi for storage in the kind slot.
    pub fn to_smi(self) -> Smi {
        Smi::new(self as i32).expect("oddball kinds are tiny")
    }
}

/// Reads the untagged length of a fixed array.
///
/// # Safety
///
/// `array` must reference a live fixed array.
pub unsafe fn fixed_array_length(array: TaggedValue) -> usize {
    read_word_raw(array.heap_address(), fixed_array::LENGTH_OFFSET) as usize
}

/// Reads element `index` of a fixed array.
///
/// # Safety
///
/// `array` must reference a live fixed array with more than `index` elements.
pub unsafe fn fixed_array_get(array: TaggedValue, index: usize) -> TaggedValue {
    debug_assert!(index < fixed_array_length(array));
    read_field(array, fixed_array::element_offset(index))
}

/// Writes element `index` of a fixed array. No write barrier.
///
/// # Safety
///
/// Same requirements as [`fixed_array_get`].
pub unsafe fn fixed_array_set(array: TaggedValue, index: usize, value: TaggedValue) {
    debug_assert!(index < fixed_array_length(array));
    write_field(array, fixed_array::element_offset(index), value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_is_first_word() {
        assert_eq!(heap_object::MAP_OFFSET, 0);
    }

    #[test]
    fn test_js_object_layout() {
        assert_eq!(js_object::PROPERTIES_OFFSET, 8);
        assert_eq!(js_object::ELEMENTS_OFFSET, 16);
        assert_eq!(js_object::HEADER_SIZE, 24);
        assert_eq!(js_array::LENGTH_OFFSET, 24);
        assert_eq!(js_array::SIZE, 32);
    }

    #[test]
    fn test_fixed_array_layout() {
        assert_eq!(fixed_array::size_for(0), fixed_array::HEADER_SIZE);
        assert_eq!(fixed_array::size_for(3), 40);
        assert_eq!(fixed_array::element_offset(0), fixed_array::HEADER_SIZE);
        assert_eq!(fixed_array::element_offset(2), 32);
    }

    #[test]
    fn test_context_layout() {
        assert_eq!(
            context::slot_offset(context::GLOBAL_INDEX),
            fixed_array::HEADER_SIZE
        );
        assert!(context::slot_offset(context::SECURITY_TOKEN_INDEX) < context::SIZE);
    }
}
