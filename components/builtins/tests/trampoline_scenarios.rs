//! End-to-end trampoline scenarios.
//!
//! Each test drives a builtin the way compiled code would: arguments pushed
//! under a return address, counts in the role registers, and the trampoline
//! entered through the code registry.

use std::cell::RefCell;
use std::rc::Rc;

use builtins::{install, install_array_function, Builtins};
use execution_core::runtime::{CodeId, Registries, VmError};
use execution_core::{Machine, Register};
use memory_manager::map::InstanceType;
use memory_manager::object::{self, js_array, js_object};
use memory_manager::{Heap, MapDescriptor, Realm};
use tagged_values::{Smi, TaggedValue};

struct World {
    machine: Machine,
    heap: Heap,
    registries: Registries,
    builtins: Builtins,
    realm: Realm,
    array_function: TaggedValue,
}

fn world() -> World {
    world_with(Machine::new(), Heap::new())
}

fn world_with(mut machine: Machine, mut heap: Heap) -> World {
    let mut registries = Registries::new();
    let builtins = install(&mut registries);
    let realm = heap.new_realm();
    let array_function = install_array_function(&mut heap, &builtins, &realm);
    machine.set_value(Register::Context, realm.context);
    World {
        machine,
        heap,
        registries,
        builtins,
        realm,
        array_function,
    }
}

/// What a recording callee observed: receiver, arguments, count register.
#[derive(Debug, Clone, Default)]
struct CallRecord {
    receiver: Option<TaggedValue>,
    arguments: Vec<TaggedValue>,
    count: u32,
}

/// Registers a function body that records its receiver and arguments, puts
/// `result` into the return-value register (receiver when `None`), and
/// returns per the convention.
fn recording_function(
    world: &mut World,
    formal_count: i32,
    result: Option<TaggedValue>,
    record: Rc<RefCell<CallRecord>>,
) -> TaggedValue {
    let code = world
        .registries
        .register_code(move |machine, _heap, _registries| {
            let count = machine.get(Register::ArgCount) as u32;
            let mut record = record.borrow_mut();
            record.count = count;
            record.receiver = Some(machine.argument(count, 0));
            record.arguments = (1..=count).map(|i| machine.argument(count, i)).collect();
            let produced = result.unwrap_or_else(|| machine.argument(count, 0));
            machine.set_value(Register::ReturnValue, produced);
            machine.return_to_caller(count as usize + 1);
            Ok(())
        });
    world
        .heap
        .new_function(world.realm.context, formal_count, code.0, 0)
}

fn smi(value: i32) -> TaggedValue {
    Smi::new(value).unwrap().encode()
}

fn call_builtin(id: CodeId, world: &mut World) -> Result<(), VmError> {
    world.machine.push_return_address();
    world
        .registries
        .call_code(id, &mut world.machine, &mut world.heap)
}

fn array_length(array: TaggedValue) -> i32 {
    // SAFETY: test arrays are live.
    unsafe { object::read_field(array, js_array::LENGTH_OFFSET).to_smi().value() }
}

fn array_elements(array: TaggedValue) -> TaggedValue {
    // SAFETY: test arrays are live.
    unsafe { object::read_field(array, js_object::ELEMENTS_OFFSET) }
}

fn array_of(world: &mut World, values: &[i32]) -> TaggedValue {
    let map = world.heap.allocate_map(
        MapDescriptor::plain(InstanceType::JsArray, (js_array::SIZE / 8) as u8),
        world.heap.roots().null_value,
    );
    let array = world.heap.new_js_array(map, values.len() as i32, values.len());
    let elements = array_elements(array);
    for (index, value) in values.iter().enumerate() {
        // SAFETY: the elements store was sized for the values.
        unsafe { object::fixed_array_set(elements, index, smi(*value)) };
    }
    array
}

// --- Function.prototype.call ---

#[test]
fn call_forwards_receiver_and_arguments() {
    let mut world = world();
    let record = Rc::new(RefCell::new(CallRecord::default()));
    let function = recording_function(&mut world, 1, None, record.clone());
    let this_arg = world.heap.new_js_object(world.heap.roots().object_map);

    // f.call(thisArg, 5)
    world.machine.push_value(function); // receiver of the call builtin
    world.machine.push_value(this_arg);
    world.machine.push_value(smi(5));
    world.machine.set(Register::ArgCount, 2);
    call_builtin(world.builtins.function_call, &mut world).unwrap();

    let record = record.borrow();
    assert_eq!(record.receiver, Some(this_arg));
    assert_eq!(record.arguments, vec![smi(5)]);
    assert_eq!(record.count, 1);
    assert_eq!(world.machine.used_slots(), 0);
}

#[test]
fn call_with_no_receiver_substitutes_global() {
    let mut world = world();
    let record = Rc::new(RefCell::new(CallRecord::default()));
    let function = recording_function(&mut world, 0, None, record.clone());

    // f.call() — no receiver supplied at all.
    world.machine.push_value(function);
    world.machine.set(Register::ArgCount, 0);
    call_builtin(world.builtins.function_call, &mut world).unwrap();

    // The missing receiver was normalized to undefined, then to the callee
    // realm's global receiver.
    assert_eq!(
        record.borrow().receiver,
        Some(world.realm.global_proxy)
    );
    assert_eq!(world.machine.used_slots(), 0);
}

#[test]
fn call_uses_callee_realm_for_null_receiver() {
    let mut world = world();
    let foreign_realm = world.heap.new_realm();
    let record = Rc::new(RefCell::new(CallRecord::default()));
    let function = recording_function(&mut world, 0, None, record.clone());
    // Rebind the function to the foreign realm.
    // SAFETY: function is live.
    unsafe {
        object::write_field(
            function,
            object::js_function::CONTEXT_OFFSET,
            foreign_realm.context,
        );
    }

    world.machine.push_value(function);
    world.machine.push_value(world.heap.roots().null_value);
    world.machine.set(Register::ArgCount, 1);
    call_builtin(world.builtins.function_call, &mut world).unwrap();

    // The callee's own context chose the realm, not the caller's.
    assert_eq!(
        record.borrow().receiver,
        Some(foreign_realm.global_proxy)
    );
}

#[test]
fn call_wraps_primitive_receiver() {
    let mut world = world();
    let record = Rc::new(RefCell::new(CallRecord::default()));
    let function = recording_function(&mut world, 0, None, record.clone());

    world.machine.push_value(function);
    world.machine.push_value(smi(7));
    world.machine.set(Register::ArgCount, 1);
    call_builtin(world.builtins.function_call, &mut world).unwrap();

    let receiver = record.borrow().receiver.unwrap();
    assert!(receiver.is_heap_reference());
    assert_eq!(
        world.heap.instance_type_of(receiver),
        InstanceType::JsObject as u8
    );
}

#[test]
fn call_routes_mismatched_count_through_adaptor() {
    let mut world = world();
    let record = Rc::new(RefCell::new(CallRecord::default()));
    let function = recording_function(&mut world, 3, None, record.clone());
    let this_arg = world.heap.new_js_object(world.heap.roots().object_map);

    // f.call(thisArg, 5): one actual argument, three declared.
    world.machine.push_value(function);
    world.machine.push_value(this_arg);
    world.machine.push_value(smi(5));
    world.machine.set(Register::ArgCount, 2);
    call_builtin(world.builtins.function_call, &mut world).unwrap();

    let undefined = world.heap.roots().undefined_value;
    let record = record.borrow();
    assert_eq!(record.count, 3);
    assert_eq!(record.arguments, vec![smi(5), undefined, undefined]);
    assert_eq!(world.machine.used_slots(), 0);
}

#[test]
fn call_of_non_callable_raises_type_error() {
    let mut world = world();

    // (7).call(...) — the target slot holds a smi.
    world.machine.push_value(smi(7));
    world.machine.push_value(smi(1));
    world.machine.set(Register::ArgCount, 1);
    let outcome = call_builtin(world.builtins.function_call, &mut world);
    assert!(matches!(outcome, Err(VmError::TypeError(_))));
}

// --- Function.prototype.apply ---

#[test]
fn apply_unrolls_array_in_order() {
    let mut world = world();
    let record = Rc::new(RefCell::new(CallRecord::default()));
    let function = recording_function(&mut world, 3, None, record.clone());
    let this_arg = world.heap.new_js_object(world.heap.roots().object_map);
    let arguments = array_of(&mut world, &[1, 2, 3]);

    // f.apply(obj, [1, 2, 3])
    world.machine.push_value(function);
    world.machine.push_value(this_arg);
    world.machine.push_value(arguments);
    world.machine.set(Register::ArgCount, 2);
    call_builtin(world.builtins.function_apply, &mut world).unwrap();

    let record = record.borrow();
    assert_eq!(record.receiver, Some(this_arg));
    assert_eq!(record.count, 3);
    assert_eq!(record.arguments, vec![smi(1), smi(2), smi(3)]);
    assert_eq!(world.machine.used_slots(), 0);
}

#[test]
fn apply_with_null_arguments_invokes_with_none() {
    let mut world = world();
    let record = Rc::new(RefCell::new(CallRecord::default()));
    let function = recording_function(&mut world, 0, None, record.clone());
    let this_arg = world.heap.new_js_object(world.heap.roots().object_map);

    world.machine.push_value(function);
    world.machine.push_value(this_arg);
    world.machine.push_value(world.heap.roots().null_value);
    world.machine.set(Register::ArgCount, 2);
    call_builtin(world.builtins.function_apply, &mut world).unwrap();

    let record = record.borrow();
    assert_eq!(record.count, 0);
    assert!(record.arguments.is_empty());
}

#[test]
fn apply_services_pending_preemption_before_unrolling() {
    let mut world = world();
    let record = Rc::new(RefCell::new(CallRecord::default()));
    let function = recording_function(&mut world, 1, None, record.clone());
    let this_arg = world.heap.new_js_object(world.heap.roots().object_map);
    let arguments = array_of(&mut world, &[9]);

    world.machine.stack_guard.pending_interrupt = true;
    world.machine.push_value(function);
    world.machine.push_value(this_arg);
    world.machine.push_value(arguments);
    world.machine.set(Register::ArgCount, 2);
    call_builtin(world.builtins.function_apply, &mut world).unwrap();

    assert_eq!(world.machine.stack_guard.interrupts_serviced, 1);
    assert!(!world.machine.stack_guard.pending_interrupt);
    assert_eq!(record.borrow().arguments, vec![smi(9)]);
}

#[test]
fn apply_overflow_is_a_range_error() {
    // A stack too small for the unrolled arguments.
    let machine = Machine::with_stack_slots(128);
    let mut world = world_with(machine, Heap::new());
    let record = Rc::new(RefCell::new(CallRecord::default()));
    let function = recording_function(&mut world, 0, None, record);
    let this_arg = world.heap.new_js_object(world.heap.roots().object_map);
    let values: Vec<i32> = (0..200).collect();
    let arguments = array_of(&mut world, &values);

    world.machine.push_value(function);
    world.machine.push_value(this_arg);
    world.machine.push_value(arguments);
    world.machine.set(Register::ArgCount, 2);
    let outcome = call_builtin(world.builtins.function_apply, &mut world);
    assert!(matches!(outcome, Err(VmError::RangeError(_))));
}

#[test]
fn apply_on_non_array_arguments_raises_type_error() {
    let mut world = world();
    let record = Rc::new(RefCell::new(CallRecord::default()));
    let function = recording_function(&mut world, 0, None, record);
    let this_arg = world.heap.new_js_object(world.heap.roots().object_map);

    world.machine.push_value(function);
    world.machine.push_value(this_arg);
    world.machine.push_value(smi(3)); // not an array
    world.machine.set(Register::ArgCount, 2);
    let outcome = call_builtin(world.builtins.function_apply, &mut world);
    assert!(matches!(outcome, Err(VmError::TypeError(_))));
}

// --- the construct stub ---

/// Drives `new constructor(...arguments)` through the construct-call
/// dispatcher.
fn construct(
    world: &mut World,
    constructor: TaggedValue,
    arguments: &[TaggedValue],
) -> Result<TaggedValue, VmError> {
    let undefined = world.heap.roots().undefined_value;
    world.machine.push_value(undefined); // receiver placeholder
    for argument in arguments {
        world.machine.push_value(*argument);
    }
    world.machine.set(Register::ArgCount, arguments.len() as u64);
    world.machine.set_value(Register::Callee, constructor);
    call_builtin(world.builtins.construct_call, world)?;
    Ok(world.machine.get_value(Register::ReturnValue))
}

fn constructor_map(world: &mut World) -> memory_manager::MapRef {
    world.heap.allocate_map(
        MapDescriptor {
            instance_type: InstanceType::JsObject,
            instance_size_words: 5, // header plus two in-object slots
            inobject_properties: 2,
            pre_allocated_property_fields: 2,
            unused_property_fields: 0,
            has_non_instance_prototype: false,
        },
        world.heap.roots().null_value,
    )
}

#[test]
fn construct_returns_receiver_when_body_returns_primitive() {
    let mut world = world();
    let record = Rc::new(RefCell::new(CallRecord::default()));
    let constructor_code = world.builtins.construct_stub_generic;
    let function = {
        let record = record.clone();
        let code = world
            .registries
            .register_code(move |machine, _heap, _registries| {
                let count = machine.get(Register::ArgCount) as u32;
                record.borrow_mut().receiver = Some(machine.argument(count, 0));
                // The body returns a primitive.
                machine.set_value(Register::ReturnValue, smi(42));
                machine.return_to_caller(count as usize + 1);
                Ok(())
            });
        world
            .heap
            .new_function(world.realm.context, 0, code.0, constructor_code.0)
    };
    let map = constructor_map(&mut world);
    world.heap.set_initial_map(function, map);

    let result = construct(&mut world, function, &[]).unwrap();

    // The allocated receiver came back, not 42.
    assert!(result.is_heap_reference());
    assert_eq!(record.borrow().receiver, Some(result));
    assert_eq!(
        world.heap.instance_type_of(result),
        InstanceType::JsObject as u8
    );
    assert_eq!(world.machine.used_slots(), 0);
}

#[test]
fn construct_returns_object_when_body_returns_object() {
    let mut world = world();
    let explicit = world.heap.new_js_object(world.heap.roots().object_map);
    let constructor_code = world.builtins.construct_stub_generic;
    let function = {
        let code = world
            .registries
            .register_code(move |machine, _heap, _registries| {
                let count = machine.get(Register::ArgCount) as u32;
                machine.set_value(Register::ReturnValue, explicit);
                machine.return_to_caller(count as usize + 1);
                Ok(())
            });
        world
            .heap
            .new_function(world.realm.context, 0, code.0, constructor_code.0)
    };
    let map = constructor_map(&mut world);
    world.heap.set_initial_map(function, map);

    let result = construct(&mut world, function, &[]).unwrap();
    assert_eq!(result, explicit);
}

#[test]
fn construct_fast_path_allocates_in_new_space() {
    let mut world = world();
    let record = Rc::new(RefCell::new(CallRecord::default()));
    let function = {
        let record = record.clone();
        let stub = world.builtins.construct_stub_generic;
        let code = world
            .registries
            .register_code(move |machine, _heap, _registries| {
                let count = machine.get(Register::ArgCount) as u32;
                record.borrow_mut().receiver = Some(machine.argument(count, 0));
                machine.set_value(Register::ReturnValue, smi(0));
                machine.return_to_caller(count as usize + 1);
                Ok(())
            });
        world.heap.new_function(world.realm.context, 0, code.0, stub.0)
    };
    let map = constructor_map(&mut world);
    world.heap.set_initial_map(function, map);

    let top_before = world.heap.new_space_region().top();
    let result = construct(&mut world, function, &[]).unwrap();
    assert!(world.heap.value_in_new_space(result));
    assert!(world.heap.new_space_region().top() > top_before);

    // In-object fields were cleared to undefined.
    let undefined = world.heap.roots().undefined_value;
    // SAFETY: result is live with two in-object slots.
    unsafe {
        assert_eq!(object::read_field(result, js_object::HEADER_SIZE), undefined);
    }
}

#[test]
fn construct_without_initial_map_uses_runtime_path() {
    let mut world = world();
    let stub = world.builtins.construct_stub_generic;
    let code = world
        .registries
        .register_code(move |machine, _heap, _registries| {
            let count = machine.get(Register::ArgCount) as u32;
            machine.set_value(Register::ReturnValue, smi(0));
            machine.return_to_caller(count as usize + 1);
            Ok(())
        });
    let function = world.heap.new_function(world.realm.context, 0, code.0, stub.0);
    // No initial map installed: the hole sits in the slot.

    let top_before = world.heap.new_space_region().top();
    let result = construct(&mut world, function, &[]).unwrap();
    assert!(result.is_heap_reference());
    assert!(!world.heap.value_in_new_space(result));
    assert_eq!(world.heap.new_space_region().top(), top_before);
}

#[test]
fn construct_rolls_back_object_when_properties_allocation_fails() {
    // New space fits the object (40 bytes) but not the properties array.
    let heap = Heap::with_new_space_size(40);
    let mut world = world_with(Machine::new(), heap);
    let stub = world.builtins.construct_stub_generic;
    let code = world
        .registries
        .register_code(move |machine, _heap, _registries| {
            let count = machine.get(Register::ArgCount) as u32;
            machine.set_value(Register::ReturnValue, smi(0));
            machine.return_to_caller(count as usize + 1);
            Ok(())
        });
    let function = world.heap.new_function(world.realm.context, 0, code.0, stub.0);
    let map = world.heap.allocate_map(
        MapDescriptor {
            instance_type: InstanceType::JsObject,
            instance_size_words: 5,
            inobject_properties: 0,
            pre_allocated_property_fields: 2,
            unused_property_fields: 2,
            has_non_instance_prototype: false,
        },
        world.heap.roots().null_value,
    );
    world.heap.set_initial_map(function, map);

    let top_before = world.heap.new_space_region().top();
    let result = construct(&mut world, function, &[]).unwrap();

    // The partial object allocation was undone and the runtime path used.
    assert_eq!(world.heap.new_space_region().top(), top_before);
    assert!(!world.heap.value_in_new_space(result));
    // The runtime-built object still carries the four extra property slots.
    // SAFETY: result is live.
    let properties = unsafe { object::read_field(result, js_object::PROPERTIES_OFFSET) };
    // SAFETY: properties is a live fixed array.
    assert_eq!(unsafe { object::fixed_array_length(properties) }, 4);
}

#[test]
fn construct_honors_pending_debugger_step_in() {
    let mut world = world();
    let stub = world.builtins.construct_stub_generic;
    let code = world
        .registries
        .register_code(move |machine, _heap, _registries| {
            let count = machine.get(Register::ArgCount) as u32;
            machine.set_value(Register::ReturnValue, smi(0));
            machine.return_to_caller(count as usize + 1);
            Ok(())
        });
    let function = world.heap.new_function(world.realm.context, 0, code.0, stub.0);
    let map = constructor_map(&mut world);
    world.heap.set_initial_map(function, map);

    world.machine.debug_step_in_pending = true;
    let top_before = world.heap.new_space_region().top();
    let result = construct(&mut world, function, &[]).unwrap();
    // The inline path was skipped entirely.
    assert_eq!(world.heap.new_space_region().top(), top_before);
    assert!(!world.heap.value_in_new_space(result));
}

#[test]
fn construct_passes_arguments_through() {
    let mut world = world();
    let record = Rc::new(RefCell::new(CallRecord::default()));
    let stub = world.builtins.construct_stub_generic;
    let function = {
        let record = record.clone();
        let code = world
            .registries
            .register_code(move |machine, _heap, _registries| {
                let count = machine.get(Register::ArgCount) as u32;
                let mut record = record.borrow_mut();
                record.count = count;
                record.arguments = (1..=count).map(|i| machine.argument(count, i)).collect();
                machine.set_value(Register::ReturnValue, smi(0));
                machine.return_to_caller(count as usize + 1);
                Ok(())
            });
        world.heap.new_function(world.realm.context, 2, code.0, stub.0)
    };
    let map = constructor_map(&mut world);
    world.heap.set_initial_map(function, map);

    construct(&mut world, function, &[smi(8), smi(9)]).unwrap();
    let record = record.borrow();
    assert_eq!(record.count, 2);
    assert_eq!(record.arguments, vec![smi(8), smi(9)]);
}

#[test]
fn construct_of_non_function_raises_type_error() {
    let mut world = world();
    let outcome = construct(&mut world, smi(3), &[]);
    assert!(matches!(outcome, Err(VmError::TypeError(_))));
}

// --- the array constructor ---

#[test]
fn new_array_empty_presizes_backing_store() {
    let mut world = world();
    let array_function = world.array_function;
    let result = construct(&mut world, array_function, &[]).unwrap();

    assert_eq!(array_length(result), 0);
    let elements = array_elements(result);
    // SAFETY: elements is a live fixed array.
    unsafe {
        assert_eq!(
            object::fixed_array_length(elements),
            builtins::array::PREALLOCATED_ARRAY_ELEMENTS
        );
        for index in 0..builtins::array::PREALLOCATED_ARRAY_ELEMENTS {
            assert_eq!(
                object::fixed_array_get(elements, index),
                world.heap.roots().the_hole_value
            );
        }
    }
    assert!(world.heap.value_in_new_space(result));
    assert_eq!(world.machine.used_slots(), 0);
}

#[test]
fn new_array_with_size_fills_holes() {
    let mut world = world();
    let array_function = world.array_function;
    let result = construct(&mut world, array_function, &[smi(5)]).unwrap();

    assert_eq!(array_length(result), 5);
    let elements = array_elements(result);
    // SAFETY: elements is a live fixed array.
    unsafe {
        assert_eq!(object::fixed_array_length(elements), 5);
        for index in 0..5 {
            assert_eq!(
                object::fixed_array_get(elements, index),
                world.heap.roots().the_hole_value
            );
        }
    }
}

#[test]
fn new_array_from_arguments_copies_without_holes() {
    let mut world = world();
    let array_function = world.array_function;
    let result = construct(&mut world, array_function, &[smi(1), smi(2), smi(3)]).unwrap();

    assert_eq!(array_length(result), 3);
    let elements = array_elements(result);
    // SAFETY: elements is a live fixed array.
    unsafe {
        assert_eq!(object::fixed_array_length(elements), 3);
        for (index, expected) in [1, 2, 3].iter().enumerate() {
            assert_eq!(
                object::fixed_array_get(elements, index).to_smi().value(),
                *expected
            );
        }
    }
}

#[test]
fn new_array_with_negative_size_raises_range_error() {
    let mut world = world();
    let array_function = world.array_function;
    let outcome = construct(&mut world, array_function, &[smi(-1)]);
    assert!(matches!(outcome, Err(VmError::RangeError(_))));
}

#[test]
fn new_array_over_fast_bound_uses_generic_path() {
    let mut world = world();
    let array_function = world.array_function;
    let size = builtins::array::INITIAL_MAX_FAST_ELEMENT_ARRAY;
    let result = construct(&mut world, array_function, &[smi(size)]).unwrap();
    assert_eq!(array_length(result), size);
    // Far too big for new space: the generic path built it.
    assert!(!world.heap.value_in_new_space(result));
}

#[test]
fn plain_array_call_uses_context_array_function() {
    let mut world = world();
    let undefined = world.heap.roots().undefined_value;

    // Array(2, 4): a plain call, not a construct.
    world.machine.push_value(undefined); // receiver
    world.machine.push_value(smi(2));
    world.machine.push_value(smi(4));
    world.machine.set(Register::ArgCount, 2);
    call_builtin(world.builtins.array_code, &mut world).unwrap();

    let result = world.machine.get_value(Register::ReturnValue);
    assert_eq!(array_length(result), 2);
    let elements = array_elements(result);
    // SAFETY: elements is a live fixed array.
    unsafe {
        assert_eq!(object::fixed_array_get(elements, 0), smi(2));
        assert_eq!(object::fixed_array_get(elements, 1), smi(4));
    }
    assert_eq!(world.machine.used_slots(), 0);
}
