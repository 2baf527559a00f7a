//! The Function.prototype.call trampoline.
//!
//! Entry state: the callee register is unused; the target function is the
//! trampoline's own receiver (deepest caller slot) and the arguments are the
//! receiver-to-be followed by the forwarded arguments. The trampoline
//! normalizes the receiver, drops the target-function slot, and
//! tail-invokes, routing through the arguments adaptor only when the
//! declared formal parameter count disagrees with the actual count.

use memory_manager::map::{is_js_receiver_type, InstanceType};
use memory_manager::object::{self, global_object, js_function, shared_function_info};
use memory_manager::{Heap, POINTER_SIZE};
use tagged_values::{Smi, TaggedValue};

use execution_core::calling_convention::{invoke_code, InvokeFlag, ParameterCount};
use execution_core::runtime::{CodeId, Registries, RuntimeId, VmError};
use execution_core::{FrameKind, Machine, Register};

// Raw null in the callee register marks a non-callable target; the adaptor
// then routes into the non-function builtin, which raises the TypeError.
const NON_CALLABLE_SENTINEL: u64 = 0;

/// The default receiver of the callee's realm (its global proxy).
pub(crate) fn global_receiver(heap: &Heap, ctx: TaggedValue) -> TaggedValue {
    let global = heap.context_slot(ctx, object::context::GLOBAL_INDEX);
    // SAFETY: realm globals are live objects of this heap.
    unsafe { object::read_field(global, global_object::GLOBAL_RECEIVER_OFFSET) }
}

/// Returns whether `value` is an object in the ECMA sense (needs no
/// wrapping when used as a receiver).
pub(crate) fn is_ecma_object(heap: &Heap, value: TaggedValue) -> bool {
    value.is_heap_reference() && is_js_receiver_type(heap.instance_type_of(value))
}

/// The Function.prototype.call fast path.
pub fn generate_function_call(
    machine: &mut Machine,
    heap: &mut Heap,
    registries: &Registries,
    call_non_function: CodeId,
) -> Result<(), VmError> {
    let mut arg_count = machine.get(Register::ArgCount) as u32;

    // 1. Make sure there is at least one argument: it becomes the callee's
    // receiver, so a missing one is normalized to undefined.
    if arg_count == 0 {
        let return_address = machine.pop();
        machine.push_value(heap.roots().undefined_value);
        machine.push(return_address);
        arg_count = 1;
    }

    // 2. Resolve the function to call from its slot. A non-callable target
    // is replaced by the sentinel, forcing the exception later; a callable
    // one switches the context eagerly so the right realm's global object
    // is used below.
    let target_slot = machine.sp() + 1 + arg_count as usize;
    let target = machine.slot_value(target_slot);
    let callable =
        target.is_heap_reference() && heap.instance_type_of(target) == InstanceType::JsFunction as u8;
    if callable {
        machine.set_value(Register::Callee, target);
        // SAFETY: target was just confirmed to be a function.
        let ctx = unsafe { object::read_field(target, js_function::CONTEXT_OFFSET) };
        machine.set_value(Register::Context, ctx);
    } else {
        machine.set(Register::Callee, NON_CALLABLE_SENTINEL);
    }

    // 3. Make sure the first argument is an object; convert if necessary.
    let receiver_slot = machine.sp() + arg_count as usize;
    let receiver = machine.slot_value(receiver_slot);
    if !is_ecma_object(heap, receiver) {
        let normalized = if receiver == heap.roots().null_value
            || receiver == heap.roots().undefined_value
        {
            global_receiver(heap, machine.get_value(Register::Context))
        } else {
            // Convert through the runtime inside an internal frame,
            // preserving the count and callee across the call.
            machine.enter_frame(FrameKind::Internal);
            machine.push_value(Smi::new(arg_count as i32).expect("counts are smis").encode());
            machine.push(machine.get(Register::Callee));

            machine.push_value(receiver);
            registries.call_runtime(RuntimeId::ToObject, 1, machine, heap)?;
            let converted = machine.get_value(Register::ReturnValue);

            let callee = machine.pop();
            machine.set(Register::Callee, callee);
            let count = machine.pop_value().to_smi().value();
            debug_assert_eq!(count as u32, arg_count);
            machine.leave_frame(FrameKind::Internal);
            converted
        };
        machine.set_slot(receiver_slot, normalized.raw_word());
    }

    // 4. Shift everything one slot down the stack to drop the
    // target-function slot, and account for it in the count.
    for index in (machine.sp()..=machine.sp() + arg_count as usize).rev() {
        let word = machine.slot(index);
        machine.set_slot(index + 1, word);
    }
    machine.set_sp(machine.sp() + 1);
    let actual = arg_count - 1;

    // 5. Tail-invoke. A sentinel callee gets expected count zero and the
    // non-function builtin; a real one is checked against its declared
    // formal parameter count, with the adaptor picking up any mismatch.
    if machine.get(Register::Callee) == NON_CALLABLE_SENTINEL {
        return invoke_code(
            machine,
            heap,
            registries,
            call_non_function,
            ParameterCount::Immediate(0),
            ParameterCount::Immediate(actual as i32),
            InvokeFlag::TailCall,
        );
    }

    let function = machine.get_value(Register::Callee);
    // SAFETY: the callee register holds a confirmed function.
    let (expected, code) = unsafe {
        let shared = object::read_field(function, js_function::SHARED_INFO_OFFSET);
        let expected =
            object::read_field(shared, shared_function_info::FORMAL_PARAMETER_COUNT_OFFSET)
                .to_smi()
                .value();
        let code =
            object::read_word_raw(shared.heap_address(), shared_function_info::CODE_OFFSET) as u32;
        (expected, code)
    };
    invoke_code(
        machine,
        heap,
        registries,
        CodeId(code),
        ParameterCount::Immediate(expected),
        ParameterCount::Immediate(actual as i32),
        InvokeFlag::TailCall,
    )
}

/// The builtin behind calls to non-callable values: detects the condition
/// and forces entry into the standard exception mechanism.
pub fn generate_call_non_function(
    _machine: &mut Machine,
    _heap: &mut Heap,
    _registries: &Registries,
) -> Result<(), VmError> {
    Err(VmError::TypeError("object is not a function".to_string()))
}

// The shift in step 4 moves one word per slot; keep the slot width in sync
// with the heap's word size.
const _: () = assert!(POINTER_SIZE == std::mem::size_of::<u64>());
