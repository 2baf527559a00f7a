//! Memory manager: heap spaces, bump allocation and the generational write
//! barrier.
//!
//! This component provides:
//! - Page-aligned spaces with reserved remembered-set bit vectors
//! - The new-space bump allocator with its explicit GC-required outcome
//! - The write barrier recording old-to-young pointer stores
//! - Maps (shape descriptors) and the fixed object layouts generated code
//!   and the collector both depend on
//! - The object factory used by the general (runtime) allocation paths

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod heap;
pub mod map;
pub mod object;
pub mod page;
pub mod region;
pub mod write_barrier;

// Re-export main types at crate root
pub use heap::{Heap, Realm, Roots, NEW_SPACE_SIZE};
pub use map::{
    is_js_receiver_type, InstanceType, MapDescriptor, MapRef, FIRST_JS_RECEIVER_TYPE,
    HAS_NON_INSTANCE_PROTOTYPE, LAST_JS_RECEIVER_TYPE, MAP_SIZE,
};
pub use object::OddballKind;
pub use page::{
    page_base_of, Page, MAX_HEAP_OBJECT_SIZE, OBJECT_START_OFFSET, PAGE_SIZE, POINTER_SIZE,
    POINTER_SIZE_LOG2, RSET_BITS_PER_PAGE, RSET_SIZE,
};
pub use region::{Allocation, AllocationFlags, AllocationRegion, AllocationSize};
pub use write_barrier::{clear_remembered_set, remembered_slot_offsets};
