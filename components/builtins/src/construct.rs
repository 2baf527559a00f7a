//! The generic construct stub.
//!
//! Allocates the receiver for a `new` expression on the inline fast path
//! when the constructor's initial map allows it, invokes the constructor,
//! and applies the constructor-return rule: a primitive return value is
//! replaced by the freshly allocated receiver.
//!
//! The fast path never leaves the heap inconsistent: if the follow-up
//! properties allocation fails, the object allocation is retracted through
//! the allocator's undo operation before falling back to the runtime.

use log::trace;

use memory_manager::map::{InstanceType, MapRef};
use memory_manager::object::{
    self, fixed_array, heap_object, js_function, js_object, shared_function_info,
};
use memory_manager::{AllocationFlags, AllocationSize, Heap, POINTER_SIZE};
use tagged_values::TaggedValue;

use execution_core::calling_convention::{invoke_function, InvokeFlag, ParameterCount};
use execution_core::frames::{construct_frame, standard_frame};
use execution_core::runtime::{CodeId, Registries, RuntimeId, VmError};
use execution_core::{FrameKind, Machine, Register};

use crate::function_call::is_ecma_object;

/// Dispatches a `new` expression: functions go to their construct stub,
/// anything else raises the TypeError through the non-function builtin.
pub fn generate_construct_call(
    machine: &mut Machine,
    heap: &mut Heap,
    registries: &Registries,
) -> Result<(), VmError> {
    let callee = machine.get_value(Register::Callee);
    if callee.is_heap_reference()
        && heap.instance_type_of(callee) == InstanceType::JsFunction as u8
    {
        // SAFETY: callee was just confirmed to be a function.
        let stub = unsafe {
            let shared = object::read_field(callee, js_function::SHARED_INFO_OFFSET);
            object::read_word_raw(
                shared.heap_address(),
                shared_function_info::CONSTRUCT_STUB_OFFSET,
            ) as u32
        };
        return registries.call_code(CodeId(stub), machine, heap);
    }
    Err(VmError::TypeError(
        "object is not a constructor".to_string(),
    ))
}

/// Attempts the inline allocation of the new receiver. `None` routes to the
/// general runtime path; every failure leaves the allocation top consistent.
fn try_allocate_receiver(machine: &Machine, heap: &mut Heap) -> Option<TaggedValue> {
    // A pending debugger step-into must reach the runtime, which knows how
    // to honor it.
    if machine.debug_step_in_pending {
        return None;
    }

    let constructor = machine.get_value(Register::Callee);
    // SAFETY: the construct stub is only entered with a function callee.
    let initial = unsafe {
        object::read_field(constructor, js_function::PROTOTYPE_OR_INITIAL_MAP_OFFSET)
    };
    // No initial map yet, or a non-map in the slot.
    if initial.is_smi() {
        return None;
    }
    if heap.instance_type_of(initial) != InstanceType::Map as u8 {
        return None;
    }
    // SAFETY: confirmed to be a map.
    let map = unsafe { MapRef::from_tagged(initial) };
    // A function-shaped instance cannot be built by the plain-object path.
    if map.instance_type() == InstanceType::JsFunction as u8 {
        return None;
    }

    let size = map.instance_size();
    let allocation = heap.allocate_in_new_space(AllocationSize::Fixed(size), AllocationFlags::NONE);
    let (base, end) = match allocation {
        memory_manager::Allocation::Success { base, end } => (base, end),
        memory_manager::Allocation::GcRequired => return None,
    };

    let roots = *heap.roots();
    // SAFETY: a freshly carved span of `size` bytes; the object is not yet
    // reachable, so raw initialization is fine.
    unsafe {
        object::write_word_raw(base, heap_object::MAP_OFFSET, initial.raw_word());
        object::write_word_raw(
            base,
            js_object::PROPERTIES_OFFSET,
            roots.empty_fixed_array.raw_word(),
        );
        object::write_word_raw(
            base,
            js_object::ELEMENTS_OFFSET,
            roots.empty_fixed_array.raw_word(),
        );
        let mut offset = js_object::HEADER_SIZE;
        while offset < size {
            object::write_word_raw(base, offset, roots.undefined_value.raw_word());
            offset += POINTER_SIZE;
        }
    }
    // Tag the object so the continuation code can use it; any failure from
    // here on must undo the allocation to keep the heap verifiable.
    let receiver = TaggedValue::from_heap_address(base);

    let extra_properties = map.unused_property_fields() as isize
        + map.pre_allocated_property_fields() as isize
        - map.inobject_properties() as isize;
    debug_assert!(extra_properties >= 0, "property allocation count failed");
    if extra_properties > 0 {
        // The properties array continues at the known allocation top.
        let allocation = heap.allocate_in_new_space(
            AllocationSize::HeaderAndElements {
                header: fixed_array::HEADER_SIZE,
                count: extra_properties as usize,
                element_size: POINTER_SIZE,
            },
            AllocationFlags::with_known_top(end),
        );
        let properties_base = match allocation {
            memory_manager::Allocation::Success { base, .. } => base,
            memory_manager::Allocation::GcRequired => {
                heap.undo_allocation_in_new_space(base);
                return None;
            }
        };
        // SAFETY: a freshly carved span sized for the element count.
        unsafe {
            object::write_word_raw(
                properties_base,
                heap_object::MAP_OFFSET,
                roots.fixed_array_map.to_tagged().raw_word(),
            );
            object::write_word_raw(
                properties_base,
                fixed_array::LENGTH_OFFSET,
                extra_properties as u64,
            );
            for index in 0..extra_properties as usize {
                object::write_word_raw(
                    properties_base,
                    fixed_array::element_offset(index),
                    roots.undefined_value.raw_word(),
                );
            }
            object::write_field(
                receiver,
                js_object::PROPERTIES_OFFSET,
                TaggedValue::from_heap_address(properties_base),
            );
        }
    }

    Some(receiver)
}

/// The generic construct stub.
///
/// Entry state: argument count in the count register, the constructor in
/// the callee register, the caller's slots (receiver placeholder and
/// arguments) under the return address.
pub fn generate_construct_stub(
    machine: &mut Machine,
    heap: &mut Heap,
    registries: &Registries,
) -> Result<(), VmError> {
    machine.enter_frame(FrameKind::Construct);

    // Preserve the smi-tagged argument count and the constructor.
    let arg_count = machine.get(Register::ArgCount) as i32;
    machine.push_value(
        tagged_values::Smi::new(arg_count)
            .expect("argument counts are smis")
            .encode(),
    );
    machine.push(machine.get(Register::Callee));
    debug_assert_eq!(
        machine.fp() as isize + construct_frame::FUNCTION_SLOT,
        machine.sp() as isize
    );

    // Try to allocate the object without transitioning into runtime code.
    let receiver = match try_allocate_receiver(machine, heap) {
        Some(receiver) => receiver,
        None => {
            trace!("construct stub taking the runtime allocation path");
            // Restore the constructor from the frame before calling out.
            let constructor = machine.slot_value(machine.sp());
            machine.push_value(constructor);
            registries.call_runtime(RuntimeId::NewObject, 1, machine, heap)?;
            machine.get_value(Register::ReturnValue)
        }
    };

    // Retrieve the constructor and the argument count from the frame.
    let constructor = machine.pop_value();
    machine.set_value(Register::Callee, constructor);
    let arg_count = machine.slot_value(machine.sp()).to_smi().value();

    // Two copies of the receiver: the called function pops one as its
    // receiver, and the other may have to be returned in its place.
    machine.push_value(receiver);
    machine.push_value(receiver);

    // Copy the caller's arguments to the expression stack, first one
    // deepest so their order is preserved.
    for index in 1..=arg_count {
        let source = machine.fp() as isize + standard_frame::CALLER_SP_SLOT
            + (arg_count - index) as isize;
        machine.push(machine.slot(source as usize));
    }

    machine.set(Register::ArgCount, arg_count as u64);
    invoke_function(
        machine,
        heap,
        registries,
        ParameterCount::InRegister,
        InvokeFlag::Call,
    )?;

    // Restore the context from the frame.
    machine.set(
        Register::Context,
        machine.frame_slot(standard_frame::CONTEXT_SLOT),
    );

    // If the result is an object in the ECMA sense, use it; otherwise throw
    // the constructor's return value away and answer the receiver.
    let result = machine.get_value(Register::ReturnValue);
    let result = if is_ecma_object(heap, result) {
        result
    } else {
        machine.slot_value(machine.sp())
    };

    let arg_count = machine
        .slot_value((machine.fp() as isize + construct_frame::ARG_COUNT_SLOT) as usize)
        .to_smi()
        .value();
    machine.leave_frame(FrameKind::Construct);

    // Remove the caller's slots, preserving the return address.
    let return_address = machine.pop();
    machine.set_sp(machine.sp() + arg_count as usize + 1);
    machine.push(return_address);

    machine.set_value(Register::ReturnValue, result);
    machine.return_to_caller(0);
    Ok(())
}
