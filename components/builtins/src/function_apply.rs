//! The Function.prototype.apply trampoline.
//!
//! Unrolls an argument array onto the stack and invokes the target with the
//! resulting runtime argument count. Unrolling can itself overflow the
//! stack, so the trampoline re-entrantly services pending preemptions and
//! checks the room left before pushing anything; running out routes to the
//! overflow runtime rather than leaving a half-built frame.

use memory_manager::object::{self, js_function};
use memory_manager::Heap;
use tagged_values::{arithmetic, ArithOutcome, Smi};

use execution_core::calling_convention::{invoke_function, InvokeFlag, ParameterCount};
use execution_core::frames::standard_frame;
use execution_core::runtime::{Registries, RuntimeId, VmError};
use execution_core::{FrameKind, Machine, Register};

use crate::function_call::{global_receiver, is_ecma_object};
use crate::keyed_load::KeyedLoadCache;

// Fixed fp-relative offsets of the trampoline's own state. The caller-side
// slots follow the entry layout (apply declares two parameters).
const ARGUMENTS_SLOT: isize = standard_frame::CALLER_SP_SLOT; // fp + 2
const RECEIVER_SLOT: isize = standard_frame::CALLER_SP_SLOT + 1; // fp + 3
const FUNCTION_SLOT: isize = standard_frame::CALLER_SP_SLOT + 2; // fp + 4
const LIMIT_SLOT: isize = standard_frame::CODE_OBJECT_SLOT - 1; // fp - 4
const INDEX_SLOT: isize = standard_frame::CODE_OBJECT_SLOT - 2; // fp - 5

/// The Function.prototype.apply trampoline.
pub fn generate_function_apply(
    machine: &mut Machine,
    heap: &mut Heap,
    registries: &Registries,
) -> Result<(), VmError> {
    machine.enter_frame(FrameKind::Internal);

    // Validate the arguments value and obtain the unrolled length.
    machine.push(machine.frame_slot(FUNCTION_SLOT));
    machine.push(machine.frame_slot(ARGUMENTS_SLOT));
    registries.call_runtime(RuntimeId::ApplyPrepare, 2, machine, heap)?;
    let mut limit = machine.get_value(Register::ReturnValue);

    // Catch preemptions right here: an unlucky one later would show up as a
    // failed apply. The stack-guard runtime may run other pending work
    // before returning, so retry the check afterwards.
    loop {
        if machine.stack_guard.pending_interrupt {
            machine.push_value(limit);
            // Runtime calls always remove their receiver slot, so feed a
            // fake one along with the single argument.
            machine.push_value(Smi::zero().encode());
            registries.call_runtime(RuntimeId::StackGuard, 1, machine, heap)?;
            limit = machine.pop_value();
            continue;
        }
        let needed = limit.to_smi().value() as usize;
        if machine.room() <= needed {
            machine.push(machine.frame_slot(FUNCTION_SLOT));
            machine.push_value(limit);
            registries.call_runtime(RuntimeId::ApplyOverflow, 2, machine, heap)?;
            return Err(VmError::Internal(
                "apply overflow runtime returned normally".to_string(),
            ));
        }
        break;
    }

    // Push the limit and the running index.
    machine.push_value(limit);
    debug_assert_eq!(machine.fp() as isize + LIMIT_SLOT, machine.sp() as isize);
    machine.push_value(Smi::zero().encode());

    // Change context eagerly to get the right global object if necessary.
    let function = machine.slot_value((machine.fp() as isize + FUNCTION_SLOT) as usize);
    machine.set_value(Register::Callee, function);
    // SAFETY: the prepare runtime confirmed the target is a function.
    let ctx = unsafe { object::read_field(function, js_function::CONTEXT_OFFSET) };
    machine.set_value(Register::Context, ctx);

    // Compute the receiver.
    let receiver = machine.slot_value((machine.fp() as isize + RECEIVER_SLOT) as usize);
    let receiver = if is_ecma_object(heap, receiver) {
        receiver
    } else if receiver == heap.roots().null_value || receiver == heap.roots().undefined_value {
        global_receiver(heap, machine.get_value(Register::Context))
    } else {
        machine.push_value(receiver);
        registries.call_runtime(RuntimeId::ToObject, 1, machine, heap)?;
        machine.get_value(Register::ReturnValue)
    };
    machine.push_value(receiver);

    // Copy all arguments from the array to the stack, one inline-cached
    // keyed load per index, falling back to the generic load on a miss.
    let mut cache = KeyedLoadCache::new();
    loop {
        let index = machine.slot_value((machine.fp() as isize + INDEX_SLOT) as usize);
        let limit = machine.slot_value((machine.fp() as isize + LIMIT_SLOT) as usize);
        if index == limit {
            break;
        }
        let arguments = machine.slot_value((machine.fp() as isize + ARGUMENTS_SLOT) as usize);
        let element = cache.load(
            machine,
            heap,
            registries,
            arguments,
            index.to_smi().value(),
        )?;
        machine.push_value(element);

        let next = match arithmetic::add_constant(index.to_smi(), 1) {
            ArithOutcome::Success(next) => next,
            ArithOutcome::Bail => {
                return Err(VmError::Internal("apply index left smi range".to_string()))
            }
        };
        let index_slot = (machine.fp() as isize + INDEX_SLOT) as usize;
        machine.set_slot(index_slot, next.encode().raw_word());
    }

    // Invoke the function with the runtime argument count.
    let actual = machine
        .slot_value((machine.fp() as isize + LIMIT_SLOT) as usize)
        .to_smi()
        .value();
    machine.set(Register::ArgCount, actual as u64);
    invoke_function(
        machine,
        heap,
        registries,
        ParameterCount::InRegister,
        InvokeFlag::Call,
    )?;

    machine.leave_frame(FrameKind::Internal);
    // Remove the function, receiver and arguments slots of the apply call.
    machine.return_to_caller(3);
    Ok(())
}
