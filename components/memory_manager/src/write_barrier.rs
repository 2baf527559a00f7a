//! Write barrier maintaining the remembered sets.
//!
//! Whenever a pointer store can create an old-to-young reference, the storing
//! code must record the written slot so the scavenger treats it as a root.
//! Stores into young objects never need a record (young-to-young and
//! young-to-old references are found by scanning the young generation
//! itself), and smi stores never do. Over-recording is safe; under-recording
//! loses objects.
//!
//! The record for a slot is a bit in the slot's page: bit index
//! `(slot_address - page_base) / POINTER_SIZE` in the page's reserved bit
//! vector. A large object's slots overflow the in-page capacity; its bits
//! live in the extra table appended after the object's content, located
//! through the object's stored length field.

use crate::heap::Heap;
use crate::object::{self, fixed_array};
use crate::page::{
    self, page_base_of, Page, MAX_HEAP_OBJECT_SIZE, OBJECT_START_OFFSET, POINTER_SIZE,
    POINTER_SIZE_LOG2, RSET_BITS_PER_PAGE, RSET_SIZE,
};
use tagged_values::TaggedValue;

/// Shared out-of-line record: sets the remembered-set bit for `slot_address`
/// within `object`'s page. Bounds the code size of the generic store paths;
/// the statically-known-offset variant inlines the in-page case instead.
///
/// # Safety
///
/// `object_base` must be the untagged base of a live old-space or
/// large-object-space object and `slot_address` a word-aligned slot inside
/// it.
unsafe fn record_write_helper(object_base: usize, slot_address: usize) {
    let page_base = page_base_of(object_base);
    let slot_index = (slot_address - page_base) >> POINTER_SIZE_LOG2;

    if slot_index < RSET_BITS_PER_PAGE {
        page::set_bit(page_base, slot_index);
        return;
    }

    // The slot is past the in-page capacity, so the object is a large
    // FixedArray. Its extra table sits right after the content; the content
    // size comes from the stored length.
    let array = TaggedValue::from_heap_address(page_base + OBJECT_START_OFFSET);
    let length = object::fixed_array_length(array);
    let extra_base = page_base + OBJECT_START_OFFSET + fixed_array::size_for(length);
    page::set_bit(extra_base, slot_index - RSET_BITS_PER_PAGE);
}

/// Mirror of [`record_write_helper`]'s addressing, for the scavenger and for
/// tests.
///
/// # Safety
///
/// Same requirements as [`record_write_helper`].
unsafe fn slot_bit_is_set(object_base: usize, slot_address: usize) -> bool {
    let page_base = page_base_of(object_base);
    let slot_index = (slot_address - page_base) >> POINTER_SIZE_LOG2;

    if slot_index < RSET_BITS_PER_PAGE {
        return page::test_bit(page_base, slot_index);
    }
    let array = TaggedValue::from_heap_address(page_base + OBJECT_START_OFFSET);
    let length = object::fixed_array_length(array);
    let extra_base = page_base + OBJECT_START_OFFSET + fixed_array::size_for(length);
    page::test_bit(extra_base, slot_index - RSET_BITS_PER_PAGE)
}

impl Heap {
    /// Records the store of `value` into the field at `offset` of `object`.
    ///
    /// The statically-known-offset variant: small positive field offsets take
    /// the inlined in-page path; anything else goes through the shared
    /// helper. Exits without a record when the store cannot create an
    /// old-to-young reference.
    pub fn record_write_field(&mut self, object: TaggedValue, offset: usize, value: TaggedValue) {
        // Smi stores never create references.
        if value.is_smi() {
            return;
        }
        let object_base = object.heap_address();
        // Stores into the young generation need no remembered-set bits.
        if self.is_in_new_space(object_base) {
            return;
        }

        if offset > 0 && offset < MAX_HEAP_OBJECT_SIZE {
            let page_base = page_base_of(object_base);
            let slot_index = (object_base + offset - page_base) >> POINTER_SIZE_LOG2;
            debug_assert!(slot_index < RSET_BITS_PER_PAGE);
            // SAFETY: `object` is a live heap object on a page with a
            // reserved bit vector; the index was bounds-checked above.
            unsafe {
                page::set_bit(page_base, slot_index);
            }
        } else {
            // SAFETY: as above; the helper handles large-object overflow.
            unsafe {
                record_write_helper(object_base, object_base + offset);
            }
        }
    }

    /// Records the store of `value` into element `index` of the fixed array
    /// `array`. The dynamic-offset variant used by keyed stores; always calls
    /// the shared out-of-line helper.
    pub fn record_write_element(&mut self, array: TaggedValue, index: usize, value: TaggedValue) {
        if value.is_smi() {
            return;
        }
        let array_base = array.heap_address();
        if self.is_in_new_space(array_base) {
            return;
        }
        let slot_address = array_base + fixed_array::element_offset(index);
        // SAFETY: `array` is a live fixed array with more than `index`
        // elements; its page carries the (possibly extended) bit vector.
        unsafe {
            record_write_helper(array_base, slot_address);
        }
    }

    /// Returns whether the slot at `offset` of `object` has a recorded
    /// write. Scavenger/test protocol.
    pub fn slot_is_recorded(&self, object: TaggedValue, offset: usize) -> bool {
        let object_base = object.heap_address();
        if self.is_in_new_space(object_base) {
            return false;
        }
        // SAFETY: as in record_write_field.
        unsafe { slot_bit_is_set(object_base, object_base + offset) }
    }

    /// Returns whether element `index` of `array` has a recorded write.
    pub fn element_is_recorded(&self, array: TaggedValue, index: usize) -> bool {
        self.slot_is_recorded(array, fixed_array::element_offset(index))
    }
}

/// Byte offsets (from the page's object start) of every slot with a recorded
/// write on `page`. The scavenger reads this during a minor collection.
///
/// For a large-object page the appended extra table is walked as well, using
/// the object's stored length, exactly as the barrier wrote it.
pub fn remembered_slot_offsets(page: &Page) -> Vec<usize> {
    let mut offsets = Vec::new();
    let page_base = page.base();
    let in_page_bits = RSET_BITS_PER_PAGE.min(page.size() >> POINTER_SIZE_LOG2);
    for slot_index in OBJECT_START_OFFSET >> POINTER_SIZE_LOG2..in_page_bits {
        // SAFETY: the in-page bit vector spans RSET_SIZE bytes at the base.
        if unsafe { page::test_bit(page_base, slot_index) } {
            offsets.push((slot_index << POINTER_SIZE_LOG2) - OBJECT_START_OFFSET);
        }
    }

    if page.size() > RSET_BITS_PER_PAGE << POINTER_SIZE_LOG2 {
        // Large-object page: walk the extra table.
        let array = TaggedValue::from_heap_address(page_base + OBJECT_START_OFFSET);
        // SAFETY: large-object pages hold a single live fixed array.
        let length = unsafe { object::fixed_array_length(array) };
        let extra_base = page_base + OBJECT_START_OFFSET + fixed_array::size_for(length);
        let total_slots = (OBJECT_START_OFFSET + fixed_array::size_for(length)) / POINTER_SIZE;
        for slot_index in RSET_BITS_PER_PAGE..total_slots {
            // SAFETY: the extra table covers every slot past the in-page
            // capacity (sized at page allocation).
            if unsafe { page::test_bit(extra_base, slot_index - RSET_BITS_PER_PAGE) } {
                offsets.push((slot_index << POINTER_SIZE_LOG2) - OBJECT_START_OFFSET);
            }
        }
    }
    offsets
}

/// Clears every remembered-set bit of `page` (in-page and extra). Called by
/// the scavenger after a minor collection has rescanned the page.
pub fn clear_remembered_set(page: &mut Page) {
    let page_base = page.base();
    for byte in 0..RSET_SIZE {
        // SAFETY: the reserved bit vector spans RSET_SIZE bytes at the base.
        unsafe {
            *((page_base + byte) as *mut u8) = 0;
        }
    }
    if page.size() > RSET_BITS_PER_PAGE << POINTER_SIZE_LOG2 {
        let array = TaggedValue::from_heap_address(page_base + OBJECT_START_OFFSET);
        // SAFETY: large-object pages hold a single live fixed array.
        let length = unsafe { object::fixed_array_length(array) };
        let extra_base = page_base + OBJECT_START_OFFSET + fixed_array::size_for(length);
        let extra_end = page_base + page.size();
        for address in extra_base..extra_end {
            // SAFETY: the appended table runs to the end of the page.
            unsafe {
                *(address as *mut u8) = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::{AllocationFlags, AllocationSize};

    /// A young object to use as the stored value.
    fn young_value(heap: &mut Heap) -> TaggedValue {
        let base = heap
            .allocate_in_new_space(AllocationSize::Fixed(16), AllocationFlags::NONE)
            .base()
            .unwrap();
        // An uninitialized span is fine: the barrier never dereferences the
        // stored value.
        TaggedValue::from_heap_address(base)
    }

    #[test]
    fn test_old_to_young_store_sets_exactly_one_bit() {
        let mut heap = Heap::new();
        let undefined = heap.roots().undefined_value;
        let array = heap.new_fixed_array(8, undefined);
        let value = young_value(&mut heap);

        let offset = fixed_array::element_offset(3);
        // SAFETY: element 3 exists.
        unsafe { object::write_field(array, offset, value) };
        heap.record_write_field(array, offset, value);

        for index in 0..8 {
            assert_eq!(heap.element_is_recorded(array, index), index == 3);
        }
    }

    #[test]
    fn test_store_into_young_object_sets_no_bit() {
        let mut heap = Heap::new();
        let base = heap
            .allocate_in_new_space(AllocationSize::Fixed(32), AllocationFlags::NONE)
            .base()
            .unwrap();
        let young = TaggedValue::from_heap_address(base);
        let value = young_value(&mut heap);

        heap.record_write_field(young, 8, value);
        assert!(!heap.slot_is_recorded(young, 8));
    }

    #[test]
    fn test_smi_store_sets_no_bit() {
        let mut heap = Heap::new();
        let undefined = heap.roots().undefined_value;
        let array = heap.new_fixed_array(4, undefined);

        let smi = tagged_values::Smi::new(7).unwrap().encode();
        heap.record_write_element(array, 1, smi);
        assert!(!heap.element_is_recorded(array, 1));
    }

    #[test]
    fn test_dynamic_index_store_sets_bit() {
        let mut heap = Heap::new();
        let undefined = heap.roots().undefined_value;
        let array = heap.new_fixed_array(16, undefined);
        let value = young_value(&mut heap);

        heap.record_write_element(array, 11, value);
        assert!(heap.element_is_recorded(array, 11));
        assert!(!heap.element_is_recorded(array, 10));
        assert!(!heap.element_is_recorded(array, 12));
    }

    #[test]
    fn test_large_object_store_uses_extra_table() {
        let mut heap = Heap::new();
        let undefined = heap.roots().undefined_value;
        // Well past the in-page remembered-set capacity.
        let count = 4 * RSET_BITS_PER_PAGE;
        let array = heap.new_fixed_array(count, undefined);
        let value = young_value(&mut heap);

        let early = 5;
        let late = count - 5;
        heap.record_write_element(array, early, value);
        heap.record_write_element(array, late, value);

        assert!(heap.element_is_recorded(array, early));
        assert!(heap.element_is_recorded(array, late));
        assert!(!heap.element_is_recorded(array, late - 1));
    }

    #[test]
    fn test_scavenger_reads_recorded_offsets() {
        let mut heap = Heap::new();
        let undefined = heap.roots().undefined_value;
        let array = heap.new_fixed_array(8, undefined);
        let value = young_value(&mut heap);

        heap.record_write_element(array, 2, value);

        let array_base = array.heap_address();
        let expected_offset =
            array_base + fixed_array::element_offset(2) - page_base_of(array_base) - OBJECT_START_OFFSET;
        assert_eq!(expected_offset % POINTER_SIZE, 0);

        let page = heap
            .old_pages()
            .iter()
            .find(|page| page.contains(array_base))
            .expect("array page");
        assert_eq!(remembered_slot_offsets(page), vec![expected_offset]);
    }

    #[test]
    fn test_scavenger_reads_extra_table_offsets() {
        let mut heap = Heap::new();
        let undefined = heap.roots().undefined_value;
        let count = 4 * RSET_BITS_PER_PAGE;
        let array = heap.new_fixed_array(count, undefined);
        let value = young_value(&mut heap);

        let late = count - 1;
        heap.record_write_element(array, late, value);

        let page = &heap.large_pages()[0];
        let expected_offset = fixed_array::element_offset(late);
        assert_eq!(remembered_slot_offsets(page), vec![expected_offset]);

        // The scavenger clears the extra table along with the in-page bits.
        let page = &mut heap.large_pages_mut()[0];
        clear_remembered_set(page);
        assert!(remembered_slot_offsets(page).is_empty());
    }

    #[test]
    fn test_clear_remembered_set() {
        let mut heap = Heap::new();
        let undefined = heap.roots().undefined_value;
        let array = heap.new_fixed_array(8, undefined);
        let value = young_value(&mut heap);

        heap.record_write_element(array, 1, value);
        heap.record_write_element(array, 5, value);
        let array_base = array.heap_address();

        let page = heap
            .old_pages_mut()
            .iter_mut()
            .find(|page| page.contains(array_base))
            .expect("array page");
        assert_eq!(remembered_slot_offsets(page).len(), 2);

        clear_remembered_set(page);
        assert!(remembered_slot_offsets(page).is_empty());
        assert!(!heap.element_is_recorded(array, 1));
    }
}
