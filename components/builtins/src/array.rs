//! Array constructor fast paths.
//!
//! Three shapes are handled natively: `Array()` builds an empty array with a
//! small pre-sized backing store, `Array(n)` builds a hole-filled store of
//! `n` slots, and `Array(a, b, ...)` copies the arguments into an exactly
//! sized store. Anything else (negative or oversized lengths, non-smi
//! sizes, allocation exhaustion) bails to the general runtime constructor,
//! with the argument count and the constructor preserved.

use log::trace;

use memory_manager::map::{InstanceType, MapRef};
use memory_manager::object::{self, fixed_array, heap_object, js_array, js_object};
use memory_manager::{Allocation, AllocationFlags, AllocationSize, Heap, POINTER_SIZE};
use tagged_values::{Smi, TaggedValue};

use execution_core::runtime::{Registries, RuntimeId, VmError};
use execution_core::{Machine, Register};

/// Number of backing-store slots given to an array created empty, so the
/// first few element stores need no growth.
pub const PREALLOCATED_ARRAY_ELEMENTS: usize = 4;

/// Hole fills at or below this count are emitted straight-line; larger
/// stores use the pointer-walking loop. A policy constant; reconsider it if
/// [`PREALLOCATED_ARRAY_ELEMENTS`] changes.
pub const LOOP_UNFOLD_LIMIT: usize = 4;

/// Largest `Array(n)` the fast path will build.
pub const INITIAL_MAX_FAST_ELEMENT_ARRAY: i32 = 100_000;

/// Fills `count` hole slots starting at `first_slot`, selecting the
/// straight-line or looped form by a single comparison.
///
/// # Safety
///
/// `first_slot` must be the first of `count` writable element words.
unsafe fn fill_with_holes(hole: TaggedValue, first_slot: usize, count: usize) {
    if count <= LOOP_UNFOLD_LIMIT {
        for index in 0..count {
            *((first_slot + index * POINTER_SIZE) as *mut u64) = hole.raw_word();
        }
    } else {
        let mut cursor = first_slot;
        let end = first_slot + count * POINTER_SIZE;
        while cursor < end {
            *(cursor as *mut u64) = hole.raw_word();
            cursor += POINTER_SIZE;
        }
    }
}

/// Allocates an array and its backing store in one new-space span.
///
/// `length` becomes the visible smi length; a zero `capacity` still gets
/// [`PREALLOCATED_ARRAY_ELEMENTS`] slots so the store never starts empty.
/// Returns `None` when new space is exhausted (the caller bails to the
/// runtime).
fn allocate_array(
    heap: &mut Heap,
    initial_map: MapRef,
    length: i32,
    capacity: usize,
    fill_with_hole: bool,
) -> Option<TaggedValue> {
    let capacity = if capacity == 0 {
        PREALLOCATED_ARRAY_ELEMENTS
    } else {
        capacity
    };
    let allocation = heap.allocate_in_new_space(
        AllocationSize::HeaderAndElements {
            header: js_array::SIZE + fixed_array::HEADER_SIZE,
            count: capacity,
            element_size: POINTER_SIZE,
        },
        AllocationFlags::NONE,
    );
    let base = match allocation {
        Allocation::Success { base, .. } => base,
        Allocation::GcRequired => return None,
    };

    let roots = *heap.roots();
    let elements_base = base + js_array::SIZE;
    // SAFETY: one freshly carved span holding the array followed by its
    // elements store.
    unsafe {
        object::write_word_raw(
            base,
            heap_object::MAP_OFFSET,
            initial_map.to_tagged().raw_word(),
        );
        object::write_word_raw(
            base,
            js_object::PROPERTIES_OFFSET,
            roots.empty_fixed_array.raw_word(),
        );
        object::write_word_raw(
            base,
            js_object::ELEMENTS_OFFSET,
            TaggedValue::from_heap_address(elements_base).raw_word(),
        );
        object::write_word_raw(
            base,
            js_array::LENGTH_OFFSET,
            Smi::new(length)
                .expect("fast array lengths are smis")
                .encode()
                .raw_word(),
        );
        object::write_word_raw(
            elements_base,
            heap_object::MAP_OFFSET,
            roots.fixed_array_map.to_tagged().raw_word(),
        );
        object::write_word_raw(elements_base, fixed_array::LENGTH_OFFSET, capacity as u64);
        if fill_with_hole {
            fill_with_holes(
                roots.the_hole_value,
                elements_base + fixed_array::HEADER_SIZE,
                capacity,
            );
        }
    }
    Some(TaggedValue::from_heap_address(base))
}

/// The native core shared by the plain-call and construct entries.
///
/// Returns `Ok(true)` when a fast path completed (the caller's slots are
/// already popped), `Ok(false)` to bail to the generic constructor with the
/// stack untouched.
fn array_native_code(
    machine: &mut Machine,
    heap: &mut Heap,
    constructor: TaggedValue,
) -> Result<bool, VmError> {
    // SAFETY: the entries confirmed the constructor is the array function.
    let initial = unsafe {
        object::read_field(
            constructor,
            object::js_function::PROTOTYPE_OR_INITIAL_MAP_OFFSET,
        )
    };
    if initial.is_smi() || heap.instance_type_of(initial) != InstanceType::Map as u8 {
        return Ok(false);
    }
    // SAFETY: confirmed to be a map.
    let initial_map = unsafe { MapRef::from_tagged(initial) };

    let arg_count = machine.get(Register::ArgCount) as u32;
    match arg_count {
        0 => {
            let Some(array) = allocate_array(heap, initial_map, 0, 0, true) else {
                return Ok(false);
            };
            machine.set_value(Register::ReturnValue, array);
            machine.return_to_caller(1);
            Ok(true)
        }
        1 => {
            let size = machine.argument(1, 1);
            if !size.is_smi() || size.to_smi().value() < 0 {
                return Ok(false);
            }
            let length = size.to_smi().value();
            if length >= INITIAL_MAX_FAST_ELEMENT_ARRAY {
                return Ok(false);
            }
            let Some(array) = allocate_array(heap, initial_map, length, length as usize, true)
            else {
                return Ok(false);
            };
            machine.set_value(Register::ReturnValue, array);
            machine.return_to_caller(2);
            Ok(true)
        }
        _ => {
            let Some(array) = allocate_array(
                heap,
                initial_map,
                arg_count as i32,
                arg_count as usize,
                false,
            ) else {
                return Ok(false);
            };
            // Copy the arguments into the backing store, no holes.
            // SAFETY: the store was sized for exactly arg_count elements.
            unsafe {
                let elements = object::read_field(array, js_object::ELEMENTS_OFFSET);
                for index in 1..=arg_count {
                    object::fixed_array_set(
                        elements,
                        (index - 1) as usize,
                        machine.argument(arg_count, index),
                    );
                }
            }
            machine.set_value(Register::ReturnValue, array);
            machine.return_to_caller(arg_count as usize + 1);
            Ok(true)
        }
    }
}

/// Bails to the general runtime constructor: the constructor and the
/// arguments are handed over and the caller's slots popped on return.
fn generic_array_code(
    machine: &mut Machine,
    heap: &mut Heap,
    registries: &Registries,
    constructor: TaggedValue,
) -> Result<(), VmError> {
    trace!("array construction taking the generic path");
    let arg_count = machine.get(Register::ArgCount) as u32;
    let arguments: Vec<TaggedValue> = (1..=arg_count)
        .map(|index| machine.argument(arg_count, index))
        .collect();

    machine.push_value(constructor);
    for argument in &arguments {
        machine.push_value(*argument);
    }
    registries.call_runtime(
        RuntimeId::NewArrayGeneric,
        arg_count as usize + 1,
        machine,
        heap,
    )?;
    machine.return_to_caller(arg_count as usize + 1);
    Ok(())
}

/// Loads the realm's array function from the current context.
fn load_array_function(machine: &Machine, heap: &Heap) -> TaggedValue {
    let ctx = machine.get_value(Register::Context);
    heap.context_slot(ctx, object::context::ARRAY_FUNCTION_INDEX)
}

#[cfg(debug_assertions)]
fn assert_array_constructor(heap: &Heap, constructor: TaggedValue) {
    assert!(
        constructor.is_heap_reference()
            && heap.instance_type_of(constructor) == InstanceType::JsFunction as u8,
        "unexpected array function"
    );
    // SAFETY: just confirmed to be a function.
    let initial = unsafe {
        object::read_field(
            constructor,
            object::js_function::PROTOTYPE_OR_INITIAL_MAP_OFFSET,
        )
    };
    assert!(
        !initial.is_smi() && heap.instance_type_of(initial) == InstanceType::Map as u8,
        "unexpected initial map for array function"
    );
}

/// The array builtin for plain calls: the constructor is the realm's array
/// function, loaded from the current context.
pub fn generate_array_code(
    machine: &mut Machine,
    heap: &mut Heap,
    registries: &Registries,
) -> Result<(), VmError> {
    let constructor = load_array_function(machine, heap);
    #[cfg(debug_assertions)]
    assert_array_constructor(heap, constructor);
    machine.set_value(Register::Callee, constructor);

    if array_native_code(machine, heap, constructor)? {
        return Ok(());
    }
    generic_array_code(machine, heap, registries, constructor)
}

/// The array builtin for construct calls: the constructor arrives in the
/// callee register and is preserved for the generic path.
pub fn generate_array_construct_code(
    machine: &mut Machine,
    heap: &mut Heap,
    registries: &Registries,
) -> Result<(), VmError> {
    let constructor = machine.get_value(Register::Callee);
    #[cfg(debug_assertions)]
    {
        assert_array_constructor(heap, constructor);
        assert_eq!(
            load_array_function(machine, heap),
            constructor,
            "unexpected array function"
        );
    }

    if array_native_code(machine, heap, constructor)? {
        return Ok(());
    }
    generic_array_code(machine, heap, registries, constructor)
}
