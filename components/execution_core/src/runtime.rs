//! The runtime-call layer: code entries, runtime functions, and the errors
//! that cross the native boundary.
//!
//! Generated code transfers to general routines through a uniform protocol:
//! "call the routine with this id, with N arguments already on the stack."
//! The registries below resolve ids to bodies; the caller is responsible for
//! pushing exactly the argument count the routine expects.

use std::collections::HashMap;
use std::rc::Rc;

use memory_manager::Heap;
use tagged_values::{Smi, TaggedValue};
use thiserror::Error;

use crate::machine::Machine;
use crate::registers::Register;

/// A language-level exception detected by this core and routed into the
/// engine's standard propagation mechanism (owned by the handler-chain
/// collaborator).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VmError {
    /// A TypeError, e.g. invoking a non-callable value.
    #[error("TypeError: {0}")]
    TypeError(String),
    /// A RangeError, e.g. an invalid array length or stack exhaustion.
    #[error("RangeError: {0}")]
    RangeError(String),
    /// An engine-internal error; indicates a collaborator-contract bug.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Identifies an installed code entry (a builtin trampoline or a compiled
/// function body).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodeId(pub u32);

impl CodeId {
    /// The marker word pushed into frame code-object slots.
    pub fn marker(self) -> u64 {
        Smi::new(self.0 as i32)
            .expect("code ids stay in smi range")
            .encode()
            .raw_word()
    }
}

/// Ids of the general runtime routines fast paths bail to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeId {
    /// Allocate a constructor's receiver the general way.
    NewObject,
    /// Convert a primitive receiver to its wrapper object.
    ToObject,
    /// Cooperative check: service pending interrupts, then resume.
    StackGuard,
    /// Validate an apply-arguments value and return its length.
    ApplyPrepare,
    /// Signal apply-time stack exhaustion.
    ApplyOverflow,
    /// Construct an array the general way.
    NewArrayGeneric,
    /// Generic keyed load, the fallback behind the inline-cached fast load.
    KeyedLoadGeneric,
}

type CodeBody = dyn Fn(&mut Machine, &mut Heap, &Registries) -> Result<(), VmError>;
type RuntimeBody =
    dyn Fn(&mut Machine, &mut Heap, &[TaggedValue]) -> Result<TaggedValue, VmError>;

/// The id-to-body tables for code entries and runtime routines.
pub struct Registries {
    code: Vec<Rc<CodeBody>>,
    runtime: HashMap<RuntimeId, Rc<RuntimeBody>>,
}

impl Registries {
    /// Empty registries. The arguments-adaptor trampoline is installed
    /// eagerly since the invocation helpers depend on it.
    pub fn new() -> Registries {
        let mut registries = Registries {
            code: Vec::new(),
            runtime: HashMap::new(),
        };
        let adaptor = registries.register_code(crate::calling_convention::arguments_adaptor_trampoline);
        debug_assert_eq!(adaptor, Registries::adaptor_code_id());
        registries
    }

    /// The id the adaptor trampoline is always installed under.
    pub fn adaptor_code_id() -> CodeId {
        CodeId(0)
    }

    /// Installs a code entry and returns its id.
    pub fn register_code(
        &mut self,
        body: impl Fn(&mut Machine, &mut Heap, &Registries) -> Result<(), VmError> + 'static,
    ) -> CodeId {
        let id = CodeId(self.code.len() as u32);
        self.code.push(Rc::new(body));
        id
    }

    /// Installs (or replaces) a runtime routine.
    pub fn register_runtime(
        &mut self,
        id: RuntimeId,
        body: impl Fn(&mut Machine, &mut Heap, &[TaggedValue]) -> Result<TaggedValue, VmError>
            + 'static,
    ) {
        self.runtime.insert(id, Rc::new(body));
    }

    /// Runs the code entry `id` against the current machine state. The
    /// caller has already set up the calling convention (arguments pushed,
    /// count register set, return address pushed unless tail-calling).
    pub fn call_code(
        &self,
        id: CodeId,
        machine: &mut Machine,
        heap: &mut Heap,
    ) -> Result<(), VmError> {
        let body = self
            .code
            .get(id.0 as usize)
            .cloned()
            .ok_or_else(|| VmError::Internal(format!("unknown code id {}", id.0)))?;
        let previous = machine.swap_current_code_object(id.marker());
        let outcome = body(machine, heap, self);
        machine.swap_current_code_object(previous);
        outcome
    }

    /// Calls runtime routine `id` with `arg_count` arguments already on the
    /// stack (pushed first-to-last).
    ///
    /// An exit frame brackets the routine so native code (and the collector,
    /// should the routine allocate) can find the calling frame through the
    /// machine's top slots. On success the arguments are unwound and the
    /// result lands in the return-value register. On a language-level error
    /// the frame is left in place for the exception unwinder.
    pub fn call_runtime(
        &self,
        id: RuntimeId,
        arg_count: usize,
        machine: &mut Machine,
        heap: &mut Heap,
    ) -> Result<(), VmError> {
        let body = self
            .runtime
            .get(&id)
            .cloned()
            .ok_or_else(|| VmError::Internal(format!("unknown runtime function {:?}", id)))?;

        machine.push_return_address();
        let kind = if machine.debug_step_in_pending {
            crate::frames::FrameKind::ExitDebug
        } else {
            crate::frames::FrameKind::Exit
        };
        machine.enter_exit_frame(kind, arg_count as u32);

        // The argv register points at the deepest (first-pushed) argument.
        let argv = machine.get(Register::Argv) as usize;
        let arguments: Vec<TaggedValue> = (0..arg_count)
            .map(|index| machine.slot_value(argv - index))
            .collect();

        let result = body(machine, heap, &arguments)?;
        machine.set_value(Register::ReturnValue, result);
        machine.leave_exit_frame();
        machine.return_to_caller(0);
        Ok(())
    }
}

impl Default for Registries {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_code_registration_and_call() {
        let mut registries = Registries::new();
        let ran = Rc::new(Cell::new(false));
        let ran_in_body = ran.clone();
        let id = registries.register_code(move |_machine, _heap, _registries| {
            ran_in_body.set(true);
            Ok(())
        });

        let mut machine = Machine::new();
        let mut heap = Heap::new();
        registries.call_code(id, &mut machine, &mut heap).unwrap();
        assert!(ran.get());
    }

    #[test]
    fn test_call_code_installs_code_object_marker() {
        let mut registries = Registries::new();
        let seen = Rc::new(Cell::new(0u64));
        let seen_in_body = seen.clone();
        let id = registries.register_code(move |machine, _heap, _registries| {
            seen_in_body.set(machine.current_code_object());
            Ok(())
        });

        let mut machine = Machine::new();
        let mut heap = Heap::new();
        registries.call_code(id, &mut machine, &mut heap).unwrap();
        assert_eq!(seen.get(), id.marker());
        assert_eq!(machine.current_code_object(), 0);
    }

    #[test]
    fn test_runtime_call_pops_arguments_in_order() {
        let mut registries = Registries::new();
        registries.register_runtime(RuntimeId::StackGuard, |_machine, heap, arguments| {
            assert_eq!(arguments.len(), 2);
            assert_eq!(arguments[0].to_smi().value(), 1);
            assert_eq!(arguments[1].to_smi().value(), 2);
            Ok(heap.roots().undefined_value)
        });

        let mut machine = Machine::new();
        let mut heap = Heap::new();
        machine.push_value(Smi::new(1).unwrap().encode());
        machine.push_value(Smi::new(2).unwrap().encode());
        registries
            .call_runtime(RuntimeId::StackGuard, 2, &mut machine, &mut heap)
            .unwrap();
        assert_eq!(machine.used_slots(), 0);
        assert_eq!(
            machine.get_value(Register::ReturnValue),
            heap.roots().undefined_value
        );
    }

    #[test]
    fn test_unknown_runtime_function_is_internal_error() {
        let registries = Registries::new();
        let mut machine = Machine::new();
        let mut heap = Heap::new();
        let outcome = registries.call_runtime(RuntimeId::ToObject, 0, &mut machine, &mut heap);
        assert!(matches!(outcome, Err(VmError::Internal(_))));
    }
}
