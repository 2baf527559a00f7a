//! Builtin trampolines: the hand-generated sequences behind fundamental
//! language operations.
//!
//! This crate provides:
//! - Function.prototype.call / Function.prototype.apply fast paths
//! - The generic construct stub with its inline allocation fast path
//! - Array constructor fast paths (empty, sized, from-arguments)
//! - The inline-cached keyed load used by apply's argument unrolling
//! - The default runtime routines every fast path can bail to
//!
//! [`install`] registers the trampolines and runtime routines into a
//! [`Registries`] and returns their code ids; [`install_array_function`]
//! wires a realm's array constructor to the array builtins.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod array;
pub mod construct;
pub mod function_apply;
pub mod function_call;
pub mod keyed_load;
pub mod runtime_functions;

use execution_core::runtime::{CodeId, Registries};
use execution_core::DONT_ADAPT_ARGUMENTS_SENTINEL;
use memory_manager::map::InstanceType;
use memory_manager::object::{context, js_array};
use memory_manager::{Heap, MapDescriptor, Realm, POINTER_SIZE};
use tagged_values::TaggedValue;

pub use keyed_load::KeyedLoadCache;

/// Code ids of the installed builtin trampolines.
#[derive(Debug, Clone, Copy)]
pub struct Builtins {
    /// The arguments-adaptor trampoline (installed by the execution core).
    pub arguments_adaptor: CodeId,
    /// Raises the TypeError for calls to non-callable values.
    pub call_non_function: CodeId,
    /// Function.prototype.call.
    pub function_call: CodeId,
    /// Function.prototype.apply.
    pub function_apply: CodeId,
    /// Dispatches `new` expressions to the callee's construct stub.
    pub construct_call: CodeId,
    /// The generic construct stub.
    pub construct_stub_generic: CodeId,
    /// The array builtin for plain calls.
    pub array_code: CodeId,
    /// The array builtin for construct calls.
    pub array_construct_code: CodeId,
}

/// Registers every builtin trampoline and the default runtime routines.
pub fn install(registries: &mut Registries) -> Builtins {
    runtime_functions::install(registries);

    let call_non_function = registries.register_code(function_call::generate_call_non_function);
    let function_call_id = registries.register_code(move |machine, heap, registries| {
        function_call::generate_function_call(machine, heap, registries, call_non_function)
    });
    let function_apply_id = registries.register_code(function_apply::generate_function_apply);
    let construct_call = registries.register_code(construct::generate_construct_call);
    let construct_stub_generic = registries.register_code(construct::generate_construct_stub);
    let array_code = registries.register_code(array::generate_array_code);
    let array_construct_code = registries.register_code(array::generate_array_construct_code);

    Builtins {
        arguments_adaptor: Registries::adaptor_code_id(),
        call_non_function,
        function_call: function_call_id,
        function_apply: function_apply_id,
        construct_call,
        construct_stub_generic,
        array_code,
        array_construct_code,
    }
}

/// Creates the realm's array constructor: a function whose code is the
/// array builtin, whose construct stub is the array construct builtin, and
/// whose initial map builds array instances. The function is stored in the
/// realm context so plain calls can find it.
pub fn install_array_function(
    heap: &mut Heap,
    builtins: &Builtins,
    realm: &Realm,
) -> TaggedValue {
    let array_map = heap.allocate_map(
        MapDescriptor::plain(InstanceType::JsArray, (js_array::SIZE / POINTER_SIZE) as u8),
        heap.roots().null_value,
    );
    let function = heap.new_function(
        realm.context,
        DONT_ADAPT_ARGUMENTS_SENTINEL,
        builtins.array_code.0,
        builtins.array_construct_code.0,
    );
    heap.set_initial_map(function, array_map);
    heap.set_context_slot(realm.context, context::ARRAY_FUNCTION_INDEX, function);
    function
}
