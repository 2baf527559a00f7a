//! The calling-convention adapter.
//!
//! Reconciles a caller's actual argument count with a callee's expected
//! count. Counts match (or the callee opted out of adaptation) — invoke
//! directly, no frame built. Otherwise the arguments-adaptor trampoline
//! builds a synthetic frame, copies the receiver and the surviving
//! arguments, pads missing ones with undefined, invokes, and finally unwinds
//! exactly the caller's actual slots — the inverse of what the caller
//! pushed, which is why the teardown must use the actual count and not the
//! expected one.

use log::trace;

use memory_manager::object::{self, js_function, shared_function_info};
use memory_manager::Heap;
use tagged_values::Smi;

use crate::frames::{adaptor_frame, standard_frame, FrameKind};
use crate::machine::Machine;
use crate::registers::Register;
use crate::runtime::{CodeId, Registries, VmError};

/// Expected-count value that disables adaptation entirely: the callee's
/// generated code tolerates any argument count.
pub const DONT_ADAPT_ARGUMENTS_SENTINEL: i32 = -1;

/// An argument count that is either a compile-time constant or the runtime
/// value held in the designated count register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterCount {
    /// A count known at code-generation time.
    Immediate(i32),
    /// The count lives in the role register (actual: the argument-count
    /// register; expected: the expected-count register).
    InRegister,
}

/// Whether an invocation returns here or replaces the current activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeFlag {
    /// Push a return address and come back.
    Call,
    /// Tail call: the target consumes the current return address.
    TailCall,
}

fn resolve(machine: &Machine, count: ParameterCount, register: Register) -> i32 {
    match count {
        ParameterCount::Immediate(count) => count,
        ParameterCount::InRegister => machine.get(register) as i32,
    }
}

fn dispatch(
    machine: &mut Machine,
    heap: &mut Heap,
    registries: &Registries,
    target: CodeId,
    flag: InvokeFlag,
) -> Result<(), VmError> {
    if flag == InvokeFlag::Call {
        machine.push_return_address();
    }
    registries.call_code(target, machine, heap)
}

/// Invokes `target` with the three-way count reconciliation.
///
/// The actual count always lands in the argument-count register for the
/// callee. Mismatched counts route through the adaptor trampoline with the
/// expected count and target staged in their role registers.
pub fn invoke_code(
    machine: &mut Machine,
    heap: &mut Heap,
    registries: &Registries,
    target: CodeId,
    expected: ParameterCount,
    actual: ParameterCount,
    flag: InvokeFlag,
) -> Result<(), VmError> {
    let actual_count = resolve(machine, actual, Register::ArgCount);
    machine.set(Register::ArgCount, actual_count as u64);
    let expected_count = resolve(machine, expected, Register::ExpectedCount);

    if expected_count == actual_count || expected_count == DONT_ADAPT_ARGUMENTS_SENTINEL {
        return dispatch(machine, heap, registries, target, flag);
    }

    machine.set(Register::ExpectedCount, expected_count as u64);
    machine.set(Register::Target, target.0 as u64);
    dispatch(
        machine,
        heap,
        registries,
        Registries::adaptor_code_id(),
        flag,
    )
}

/// Invokes the function in the callee register: loads its declared formal
/// parameter count and code from the shared function info, switches to its
/// context, then goes through [`invoke_code`].
pub fn invoke_function(
    machine: &mut Machine,
    heap: &mut Heap,
    registries: &Registries,
    actual: ParameterCount,
    flag: InvokeFlag,
) -> Result<(), VmError> {
    let function = machine.get_value(Register::Callee);
    // SAFETY: the callee register holds a live function reference under the
    // calling convention.
    let (expected, code) = unsafe {
        let shared = object::read_field(function, js_function::SHARED_INFO_OFFSET);
        let expected =
            object::read_field(shared, shared_function_info::FORMAL_PARAMETER_COUNT_OFFSET)
                .to_smi()
                .value();
        let code =
            object::read_word_raw(shared.heap_address(), shared_function_info::CODE_OFFSET) as u32;
        machine.set_value(
            Register::Context,
            object::read_field(function, js_function::CONTEXT_OFFSET),
        );
        (expected, code)
    };
    invoke_code(
        machine,
        heap,
        registries,
        CodeId(code),
        ParameterCount::Immediate(expected),
        actual,
        flag,
    )
}

fn enter_adaptor_frame(machine: &mut Machine, actual: i32) {
    machine.push(machine.fp() as u64);
    machine.set_fp(machine.sp());
    // The adaptor marker sits in the context slot position.
    machine.push(FrameKind::ArgumentsAdaptor.marker().raw_word());
    machine.push(machine.get(Register::Callee));
    machine.push_value(Smi::new(actual).expect("argument counts are smis").encode());
}

fn leave_adaptor_frame(machine: &mut Machine) {
    // The caller's actual count, preserved in the frame; teardown must use
    // it rather than the expected count.
    let actual = machine
        .slot_value((machine.fp() as isize + adaptor_frame::LENGTH_SLOT) as usize)
        .to_smi()
        .value();
    let marker = machine.frame_slot(adaptor_frame::MARKER_SLOT);
    assert!(
        marker == FrameKind::ArgumentsAdaptor.marker().raw_word(),
        "stack frame types must match"
    );

    machine.set_sp(machine.fp());
    let caller_fp = machine.pop();
    machine.set_fp(caller_fp as usize);

    // Remove the caller-pushed arguments and receiver, keeping the return
    // address on top.
    let return_address = machine.pop();
    machine.set_sp(machine.sp() + actual as usize + 1);
    machine.push(return_address);
}

/// The arguments-adaptor trampoline.
///
/// Entry state: actual count in the argument-count register, expected count
/// in the expected-count register, target code id in the target register,
/// the caller's slots (receiver and arguments) under the return address.
pub fn arguments_adaptor_trampoline(
    machine: &mut Machine,
    heap: &mut Heap,
    registries: &Registries,
) -> Result<(), VmError> {
    let actual = machine.get(Register::ArgCount) as i32;
    let expected = machine.get(Register::ExpectedCount) as i32;
    let target = CodeId(machine.get(Register::Target) as u32);

    if expected == DONT_ADAPT_ARGUMENTS_SENTINEL {
        // The callee copes with any count; skip adaptation and let it
        // consume the caller's slots itself.
        return registries.call_code(target, machine, heap);
    }

    trace!("adapting arguments: {} actual, {} expected", actual, expected);
    enter_adaptor_frame(machine, actual);

    // Copy the receiver and the surviving arguments from the caller's
    // argument area, deepest slot first so their order is preserved.
    let copied = actual.min(expected);
    for index in 0..=copied {
        let source = machine.fp() as isize + standard_frame::CALLER_SP_SLOT + (actual - index) as isize;
        machine.push(machine.slot(source as usize));
    }
    // Fill remaining expected arguments with undefined values.
    for _ in copied..expected {
        machine.push_value(heap.roots().undefined_value);
    }

    machine.set(Register::ArgCount, expected as u64);
    machine.push_return_address();
    registries.call_code(target, machine, heap)?;

    leave_adaptor_frame(machine);
    machine.return_to_caller(0);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use tagged_values::TaggedValue;

    /// Registers a callee that records the receiver, its arguments and the
    /// count register, then returns following the convention (popping its
    /// count-plus-receiver slots).
    fn recording_callee(
        registries: &mut Registries,
        seen: Rc<RefCell<Vec<TaggedValue>>>,
        counts: Rc<RefCell<Vec<u32>>>,
    ) -> CodeId {
        registries.register_code(move |machine, heap, _registries| {
            let argc = machine.get(Register::ArgCount) as u32;
            counts.borrow_mut().push(argc);
            for index in 0..=argc {
                seen.borrow_mut().push(machine.argument(argc, index));
            }
            machine.set_value(Register::ReturnValue, heap.roots().undefined_value);
            machine.return_to_caller(argc as usize + 1);
            Ok(())
        })
    }

    fn smi(value: i32) -> TaggedValue {
        Smi::new(value).unwrap().encode()
    }

    #[test]
    fn test_matching_counts_invoke_directly() {
        let mut registries = Registries::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let counts = Rc::new(RefCell::new(Vec::new()));
        let callee = recording_callee(&mut registries, seen.clone(), counts.clone());

        let mut machine = Machine::new();
        let mut heap = Heap::new();

        machine.push_value(smi(100)); // receiver
        machine.push_value(smi(1));
        machine.push_value(smi(2));
        invoke_code(
            &mut machine,
            &mut heap,
            &registries,
            callee,
            ParameterCount::Immediate(2),
            ParameterCount::Immediate(2),
            InvokeFlag::Call,
        )
        .unwrap();

        assert_eq!(machine.used_slots(), 0);
        assert_eq!(*counts.borrow(), vec![2]);
        assert_eq!(*seen.borrow(), vec![smi(100), smi(1), smi(2)]);
    }

    #[test]
    fn test_too_few_arguments_are_padded_with_undefined() {
        let mut registries = Registries::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let counts = Rc::new(RefCell::new(Vec::new()));
        let callee = recording_callee(&mut registries, seen.clone(), counts.clone());

        let mut machine = Machine::new();
        let mut heap = Heap::new();
        let undefined = heap.roots().undefined_value;

        // One actual argument (5) plus receiver; callee declares three.
        machine.push_value(smi(100)); // receiver
        machine.push_value(smi(5));
        let depth_before = machine.used_slots();
        invoke_code(
            &mut machine,
            &mut heap,
            &registries,
            callee,
            ParameterCount::Immediate(3),
            ParameterCount::Immediate(1),
            InvokeFlag::Call,
        )
        .unwrap();

        // The callee saw receiver, 5, undefined, undefined and count 3.
        assert_eq!(*counts.borrow(), vec![3]);
        assert_eq!(
            *seen.borrow(),
            vec![smi(100), smi(5), undefined, undefined]
        );
        // The caller's stack lost exactly the actual argument and receiver,
        // not the expected three.
        assert_eq!(machine.used_slots(), depth_before - 2);
    }

    #[test]
    fn test_too_many_arguments_are_truncated() {
        let mut registries = Registries::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let counts = Rc::new(RefCell::new(Vec::new()));
        let callee = recording_callee(&mut registries, seen.clone(), counts.clone());

        let mut machine = Machine::new();
        let mut heap = Heap::new();

        machine.push_value(smi(100)); // receiver
        machine.push_value(smi(1));
        machine.push_value(smi(2));
        machine.push_value(smi(3));
        invoke_code(
            &mut machine,
            &mut heap,
            &registries,
            callee,
            ParameterCount::Immediate(2),
            ParameterCount::Immediate(3),
            InvokeFlag::Call,
        )
        .unwrap();

        // The callee saw only the first two arguments.
        assert_eq!(*counts.borrow(), vec![2]);
        assert_eq!(*seen.borrow(), vec![smi(100), smi(1), smi(2)]);
        // All three caller arguments were removed.
        assert_eq!(machine.used_slots(), 0);
    }

    #[test]
    fn test_dont_adapt_sentinel_disables_adaptation() {
        let mut registries = Registries::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let counts = Rc::new(RefCell::new(Vec::new()));
        let callee = recording_callee(&mut registries, seen.clone(), counts.clone());

        let mut machine = Machine::new();
        let mut heap = Heap::new();

        machine.push_value(smi(100)); // receiver
        machine.push_value(smi(7));
        invoke_code(
            &mut machine,
            &mut heap,
            &registries,
            callee,
            ParameterCount::Immediate(DONT_ADAPT_ARGUMENTS_SENTINEL),
            ParameterCount::Immediate(1),
            InvokeFlag::Call,
        )
        .unwrap();

        // No adaptation: the callee saw the caller's own count.
        assert_eq!(*counts.borrow(), vec![1]);
        assert_eq!(*seen.borrow(), vec![smi(100), smi(7)]);
        assert_eq!(machine.used_slots(), 0);
    }

    #[test]
    fn test_counts_in_registers() {
        let mut registries = Registries::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let counts = Rc::new(RefCell::new(Vec::new()));
        let callee = recording_callee(&mut registries, seen.clone(), counts.clone());

        let mut machine = Machine::new();
        let mut heap = Heap::new();

        machine.push_value(smi(100)); // receiver
        machine.push_value(smi(9));
        machine.set(Register::ArgCount, 1);
        machine.set(Register::ExpectedCount, 2);
        invoke_code(
            &mut machine,
            &mut heap,
            &registries,
            callee,
            ParameterCount::InRegister,
            ParameterCount::InRegister,
            InvokeFlag::Call,
        )
        .unwrap();

        assert_eq!(*counts.borrow(), vec![2]);
        assert_eq!(
            *seen.borrow(),
            vec![smi(100), smi(9), heap.roots().undefined_value]
        );
    }

    #[test]
    fn test_invoke_function_switches_context_and_adapts() {
        let mut registries = Registries::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let counts = Rc::new(RefCell::new(Vec::new()));
        let callee_code = recording_callee(&mut registries, seen.clone(), counts.clone());

        let mut machine = Machine::new();
        let mut heap = Heap::new();
        let realm = heap.new_realm();
        let function = heap.new_function(realm.context, 2, callee_code.0, 0);

        machine.set_value(Register::Callee, function);
        machine.push_value(smi(100)); // receiver
        machine.push_value(smi(4));
        invoke_function(
            &mut machine,
            &mut heap,
            &registries,
            ParameterCount::Immediate(1),
            InvokeFlag::Call,
        )
        .unwrap();

        assert_eq!(machine.get_value(Register::Context), realm.context);
        assert_eq!(*counts.borrow(), vec![2]);
        assert_eq!(
            *seen.borrow(),
            vec![smi(100), smi(4), heap.roots().undefined_value]
        );
    }

    #[test]
    fn test_return_address_preserved_across_adaptation() {
        let mut registries = Registries::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let counts = Rc::new(RefCell::new(Vec::new()));
        let callee = recording_callee(&mut registries, seen, counts);

        let mut machine = Machine::new();
        let mut heap = Heap::new();

        // A word already on the stack below the call area must survive.
        machine.push(0xFEED);
        machine.push_value(smi(1)); // receiver
        invoke_code(
            &mut machine,
            &mut heap,
            &registries,
            callee,
            ParameterCount::Immediate(2),
            ParameterCount::Immediate(0),
            InvokeFlag::Call,
        )
        .unwrap();

        assert_eq!(machine.pop(), 0xFEED);
        assert_eq!(machine.used_slots(), 0);
    }
}
