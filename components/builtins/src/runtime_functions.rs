//! Default runtime routines behind the fast-path bails.
//!
//! These are the general paths: fully checked, allocation in old space
//! (which only grows), no layout assumptions. A fast path that transfers
//! here may trigger a collection, so callers must re-derive any raw
//! addresses afterwards.

use memory_manager::map::{InstanceType, MapRef};
use memory_manager::object::{self, js_array, js_function, js_object};
use memory_manager::Heap;
use tagged_values::{Smi, TaggedValue};

use execution_core::runtime::{Registries, RuntimeId, VmError};
use execution_core::Machine;

use crate::function_call::is_ecma_object;
use crate::keyed_load;

/// Installs the default handlers for every runtime id the trampolines use.
pub fn install(registries: &mut Registries) {
    registries.register_runtime(RuntimeId::NewObject, new_object);
    registries.register_runtime(RuntimeId::ToObject, to_object);
    registries.register_runtime(RuntimeId::StackGuard, stack_guard);
    registries.register_runtime(RuntimeId::ApplyPrepare, apply_prepare);
    registries.register_runtime(RuntimeId::ApplyOverflow, apply_overflow);
    registries.register_runtime(RuntimeId::NewArrayGeneric, new_array_generic);
    registries.register_runtime(RuntimeId::KeyedLoadGeneric, keyed_load::keyed_load_generic);
}

fn is_function(heap: &Heap, value: TaggedValue) -> bool {
    value.is_heap_reference() && heap.instance_type_of(value) == InstanceType::JsFunction as u8
}

/// The general receiver allocation behind the construct stub.
fn new_object(
    _machine: &mut Machine,
    heap: &mut Heap,
    arguments: &[TaggedValue],
) -> Result<TaggedValue, VmError> {
    let constructor = arguments[0];
    if !is_function(heap, constructor) {
        return Err(VmError::TypeError(
            "object is not a constructor".to_string(),
        ));
    }
    // SAFETY: confirmed to be a function.
    let initial = unsafe {
        object::read_field(
            constructor,
            js_function::PROTOTYPE_OR_INITIAL_MAP_OFFSET,
        )
    };
    let map = if !initial.is_smi() && heap.instance_type_of(initial) == InstanceType::Map as u8 {
        // SAFETY: confirmed to be a map.
        unsafe { MapRef::from_tagged(initial) }
    } else {
        heap.roots().object_map
    };
    Ok(heap.new_js_object(map))
}

/// Converts a primitive to its wrapper object. Receivers that are already
/// objects pass through.
fn to_object(
    _machine: &mut Machine,
    heap: &mut Heap,
    arguments: &[TaggedValue],
) -> Result<TaggedValue, VmError> {
    let value = arguments[0];
    if is_ecma_object(heap, value) {
        return Ok(value);
    }
    if value == heap.roots().null_value || value == heap.roots().undefined_value {
        return Err(VmError::TypeError(
            "cannot convert null or undefined to object".to_string(),
        ));
    }
    // A stand-in wrapper: the property machinery of real wrappers lives
    // outside this core.
    let wrapper_map = heap.roots().object_map;
    Ok(heap.new_js_object(wrapper_map))
}

/// The cooperative stack-guard callout: services pending work, then lets
/// the caller retry its check.
fn stack_guard(
    machine: &mut Machine,
    heap: &mut Heap,
    _arguments: &[TaggedValue],
) -> Result<TaggedValue, VmError> {
    machine.stack_guard.pending_interrupt = false;
    machine.stack_guard.interrupts_serviced += 1;
    Ok(heap.roots().undefined_value)
}

/// Validates the target and arguments of an apply and answers the unrolled
/// argument count.
fn apply_prepare(
    _machine: &mut Machine,
    heap: &mut Heap,
    arguments: &[TaggedValue],
) -> Result<TaggedValue, VmError> {
    let function = arguments[0];
    let argument_list = arguments[1];
    if !is_function(heap, function) {
        return Err(VmError::TypeError(
            "Function.prototype.apply was called on a non-function".to_string(),
        ));
    }
    if argument_list == heap.roots().null_value || argument_list == heap.roots().undefined_value {
        return Ok(Smi::zero().encode());
    }
    if !argument_list.is_heap_reference()
        || heap.instance_type_of(argument_list) != InstanceType::JsArray as u8
    {
        return Err(VmError::TypeError(
            "Function.prototype.apply: arguments list has wrong type".to_string(),
        ));
    }
    // SAFETY: confirmed to be an array.
    let length = unsafe { object::read_field(argument_list, js_array::LENGTH_OFFSET) };
    Ok(length)
}

/// The apply-time stack exhaustion error.
fn apply_overflow(
    _machine: &mut Machine,
    _heap: &mut Heap,
    _arguments: &[TaggedValue],
) -> Result<TaggedValue, VmError> {
    Err(VmError::RangeError(
        "maximum call stack size exceeded".to_string(),
    ))
}

/// The fully general array constructor.
fn new_array_generic(
    _machine: &mut Machine,
    heap: &mut Heap,
    arguments: &[TaggedValue],
) -> Result<TaggedValue, VmError> {
    let constructor = arguments[0];
    let call_arguments = &arguments[1..];

    // SAFETY: the array builtins only bail here with the array function.
    let initial = unsafe {
        object::read_field(
            constructor,
            js_function::PROTOTYPE_OR_INITIAL_MAP_OFFSET,
        )
    };
    let map = if !initial.is_smi() && heap.instance_type_of(initial) == InstanceType::Map as u8 {
        // SAFETY: confirmed to be a map.
        unsafe { MapRef::from_tagged(initial) }
    } else {
        return Err(VmError::Internal(
            "array constructor without initial map".to_string(),
        ));
    };

    match call_arguments {
        [] => Ok(heap.new_js_array(map, 0, 0)),
        [size] if size.is_smi() => {
            let length = size.to_smi().value();
            if length < 0 {
                return Err(VmError::RangeError("invalid array length".to_string()));
            }
            Ok(heap.new_js_array(map, length, length as usize))
        }
        values => {
            let array = heap.new_js_array(map, values.len() as i32, values.len());
            // SAFETY: the elements store was sized for the values; element
            // stores into an old-space array are recorded for the
            // collector.
            unsafe {
                let elements = object::read_field(array, js_object::ELEMENTS_OFFSET);
                for (index, value) in values.iter().enumerate() {
                    object::fixed_array_set(elements, index, *value);
                    heap.record_write_element(elements, index, *value);
                }
            }
            Ok(array)
        }
    }
}
