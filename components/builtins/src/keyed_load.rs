//! Inline-cached keyed loads.
//!
//! The apply trampoline unrolls an argument array one element at a time; a
//! per-site cache keeps the common case (same array shape every iteration)
//! off the generic path. The cache transitions uninitialized → monomorphic
//! on first use and degrades to megamorphic when it sees a second shape.

use memory_manager::map::InstanceType;
use memory_manager::object::{self, js_array, js_object};
use memory_manager::{Heap, MapRef};
use tagged_values::{Smi, TaggedValue};

use execution_core::runtime::{Registries, RuntimeId, VmError};
use execution_core::{Machine, Register};

/// A call-site keyed-load cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyedLoadCache {
    /// No shape seen yet.
    Uninitialized,
    /// One array shape seen; loads against it skip the generic path.
    Monomorphic {
        /// The cached receiver map.
        receiver_map: MapRef,
    },
    /// Multiple shapes seen; every load takes the generic path.
    Megamorphic,
}

impl KeyedLoadCache {
    /// A fresh cache.
    pub fn new() -> KeyedLoadCache {
        KeyedLoadCache::Uninitialized
    }

    /// Loads `receiver[index]`, fast when the receiver matches the cached
    /// shape and the index is in bounds, otherwise through the generic
    /// runtime path (updating the cache state).
    pub fn load(
        &mut self,
        machine: &mut Machine,
        heap: &mut Heap,
        registries: &Registries,
        receiver: TaggedValue,
        index: i32,
    ) -> Result<TaggedValue, VmError> {
        if receiver.is_heap_reference() {
            // SAFETY: receiver is a live heap value.
            let map = unsafe { object::map_of(receiver) };
            if let KeyedLoadCache::Monomorphic { receiver_map } = self {
                if *receiver_map == map {
                    if let Some(element) = fast_array_load(heap, receiver, index) {
                        return Ok(element);
                    }
                    // In-shape but out of bounds: generic path, state kept.
                    return generic_load(machine, heap, registries, receiver, index);
                }
                // Second shape: degrade.
                *self = KeyedLoadCache::Megamorphic;
                return generic_load(machine, heap, registries, receiver, index);
            }
            if *self == KeyedLoadCache::Uninitialized
                && map.instance_type() == InstanceType::JsArray as u8
            {
                *self = KeyedLoadCache::Monomorphic { receiver_map: map };
                if let Some(element) = fast_array_load(heap, receiver, index) {
                    return Ok(element);
                }
            }
        }
        generic_load(machine, heap, registries, receiver, index)
    }
}

impl Default for KeyedLoadCache {
    fn default() -> Self {
        Self::new()
    }
}

/// In-bounds element read of an array known to be array-shaped. The hole
/// reads back as undefined.
fn fast_array_load(heap: &Heap, receiver: TaggedValue, index: i32) -> Option<TaggedValue> {
    // SAFETY: the caller confirmed the receiver's map is array-shaped.
    unsafe {
        let length = object::read_field(receiver, js_array::LENGTH_OFFSET)
            .to_smi()
            .value();
        if index < 0 || index >= length {
            return None;
        }
        let elements = object::read_field(receiver, js_object::ELEMENTS_OFFSET);
        let element = object::fixed_array_get(elements, index as usize);
        if element == heap.roots().the_hole_value {
            Some(heap.roots().undefined_value)
        } else {
            Some(element)
        }
    }
}

fn generic_load(
    machine: &mut Machine,
    heap: &mut Heap,
    registries: &Registries,
    receiver: TaggedValue,
    index: i32,
) -> Result<TaggedValue, VmError> {
    machine.push_value(receiver);
    machine.push_value(Smi::new(index).expect("keyed index is a smi").encode());
    registries.call_runtime(RuntimeId::KeyedLoadGeneric, 2, machine, heap)?;
    Ok(machine.get_value(Register::ReturnValue))
}

/// The generic keyed load behind the cache, installed as a runtime routine.
pub fn keyed_load_generic(
    _machine: &mut Machine,
    heap: &mut Heap,
    arguments: &[TaggedValue],
) -> Result<TaggedValue, VmError> {
    let receiver = arguments[0];
    let key = arguments[1];
    if !receiver.is_heap_reference() || !key.is_smi() {
        return Ok(heap.roots().undefined_value);
    }
    let index = key.to_smi().value();
    if heap.instance_type_of(receiver) == InstanceType::JsArray as u8 {
        if let Some(element) = fast_array_load(heap, receiver, index) {
            return Ok(element);
        }
    }
    Ok(heap.roots().undefined_value)
}
