//! Shape descriptors (maps).
//!
//! Every heap object's first word references a map describing its layout:
//! instance size, property counts, an instance-type tag and a bit field.
//! Maps live in map space and are shared by all objects of the same shape.
//! The field offsets below are a fixed binary contract with generated code
//! and with the collector; they are not renegotiable at runtime.

use crate::page::POINTER_SIZE;
use tagged_values::TaggedValue;

/// Object categories carried in a map's instance-type byte.
///
/// The discriminants are ordered so that "is a receiver in the ECMA sense"
/// is a single range check (see [`is_js_receiver_type`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum InstanceType {
    /// undefined, null, true, false, the hole.
    Oddball = 1,
    /// A map itself.
    Map = 2,
    /// A fixed-length array of tagged words.
    FixedArray = 3,
    /// An execution context.
    Context = 4,
    /// Compiler-produced function metadata.
    SharedFunctionInfo = 5,
    /// An ordinary object. First receiver type.
    JsObject = 6,
    /// An array with a length and an elements store.
    JsArray = 7,
    /// A realm's global object.
    JsGlobalObject = 8,
    /// The security boundary standing in for a global object.
    JsGlobalProxy = 9,
    /// A callable function. Last receiver type.
    JsFunction = 10,
}

/// First instance type that is an object in the ECMA sense.
pub const FIRST_JS_RECEIVER_TYPE: u8 = InstanceType::JsObject as u8;
/// Last instance type that is an object in the ECMA sense.
pub const LAST_JS_RECEIVER_TYPE: u8 = InstanceType::JsFunction as u8;

/// Returns whether an instance-type byte denotes an ECMA-sense object
/// (a valid receiver that needs no wrapping).
pub fn is_js_receiver_type(instance_type: u8) -> bool {
    (FIRST_JS_RECEIVER_TYPE..=LAST_JS_RECEIVER_TYPE).contains(&instance_type)
}

/// Byte offsets of map fields, relative to the map's base address.
pub mod offsets {
    /// The map's own map word (the meta map).
    pub const MAP: usize = 0;
    /// u8: instance size in words.
    pub const INSTANCE_SIZE: usize = 8;
    /// u8: number of in-object property slots.
    pub const INOBJECT_PROPERTIES: usize = 9;
    /// u8: property slots pre-allocated beyond the in-object ones.
    pub const PRE_ALLOCATED_PROPERTY_FIELDS: usize = 10;
    /// u8: property slots described but not yet used.
    pub const UNUSED_PROPERTY_FIELDS: usize = 11;
    /// u8: flag bits, see [`super::HAS_NON_INSTANCE_PROTOTYPE`].
    pub const BIT_FIELD: usize = 12;
    /// u8: the instance type.
    pub const INSTANCE_TYPE: usize = 13;
    /// Tagged word: the prototype.
    pub const PROTOTYPE: usize = 16;
}

/// Bit in the bit-field byte: the prototype slot does not hold an instance
/// prototype (functions whose `prototype` is overridden non-standardly).
pub const HAS_NON_INSTANCE_PROTOTYPE: u8 = 1 << 0;

/// Byte size of a map in map space.
pub const MAP_SIZE: usize = 3 * POINTER_SIZE;

/// Host-side description of a map about to be installed into map space.
#[derive(Debug, Clone, Copy)]
pub struct MapDescriptor {
    /// The instance type of objects with this map.
    pub instance_type: InstanceType,
    /// Instance size in words.
    pub instance_size_words: u8,
    /// In-object property slot count.
    pub inobject_properties: u8,
    /// Pre-allocated property slot count.
    pub pre_allocated_property_fields: u8,
    /// Unused property slot count.
    pub unused_property_fields: u8,
    /// Whether the prototype slot is non-instance.
    pub has_non_instance_prototype: bool,
}

impl MapDescriptor {
    /// A descriptor for a plain value-like object of `size_words` words with
    /// no property slots.
    pub fn plain(instance_type: InstanceType, size_words: u8) -> MapDescriptor {
        MapDescriptor {
            instance_type,
            instance_size_words: size_words,
            inobject_properties: 0,
            pre_allocated_property_fields: 0,
            unused_property_fields: 0,
            has_non_instance_prototype: false,
        }
    }
}

/// A reference to an installed map.
///
/// Carries the map's untagged base address. Only the heap creates these (at
/// map installation), so holders may assume the address stays valid for the
/// heap's lifetime; the accessors encapsulate the raw reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MapRef(usize);

impl MapRef {
    /// Wraps an untagged map address.
    ///
    /// # Safety
    ///
    /// `address` must be the base of a live, installed map.
    pub unsafe fn from_address(address: usize) -> MapRef {
        MapRef(address)
    }

    /// Recovers a map reference from an object's map word.
    ///
    /// # Safety
    ///
    /// The word must have been written by map installation.
    pub unsafe fn from_tagged(value: TaggedValue) -> MapRef {
        MapRef(value.heap_address())
    }

    /// The untagged base address.
    pub fn address(self) -> usize {
        self.0
    }

    /// The tagged form stored into object map words.
    pub fn to_tagged(self) -> TaggedValue {
        TaggedValue::from_heap_address(self.0)
    }

    fn read_u8(self, offset: usize) -> u8 {
        // SAFETY: the construction contract guarantees a live map; all
        // offsets below are within MAP_SIZE.
        unsafe { *((self.0 + offset) as *const u8) }
    }

    fn write_u8(self, offset: usize, value: u8) {
        // SAFETY: as in read_u8.
        unsafe { *((self.0 + offset) as *mut u8) = value }
    }

    /// Instance size in bytes.
    pub fn instance_size(self) -> usize {
        self.read_u8(offsets::INSTANCE_SIZE) as usize * POINTER_SIZE
    }

    /// Instance size in words.
    pub fn instance_size_words(self) -> usize {
        self.read_u8(offsets::INSTANCE_SIZE) as usize
    }

    /// Number of in-object property slots.
    pub fn inobject_properties(self) -> usize {
        self.read_u8(offsets::INOBJECT_PROPERTIES) as usize
    }

    /// Number of pre-allocated property slots.
    pub fn pre_allocated_property_fields(self) -> usize {
        self.read_u8(offsets::PRE_ALLOCATED_PROPERTY_FIELDS) as usize
    }

    /// Number of unused property slots.
    pub fn unused_property_fields(self) -> usize {
        self.read_u8(offsets::UNUSED_PROPERTY_FIELDS) as usize
    }

    /// The instance-type byte.
    pub fn instance_type(self) -> u8 {
        self.read_u8(offsets::INSTANCE_TYPE)
    }

    /// Whether the prototype slot holds a non-instance prototype.
    pub fn has_non_instance_prototype(self) -> bool {
        self.read_u8(offsets::BIT_FIELD) & HAS_NON_INSTANCE_PROTOTYPE != 0
    }

    /// The prototype word.
    pub fn prototype(self) -> TaggedValue {
        // SAFETY: as in read_u8; PROTOTYPE is word aligned.
        unsafe { TaggedValue::from_raw_word(*((self.0 + offsets::PROTOTYPE) as *const u64)) }
    }

    /// Overwrites the prototype word.
    pub fn set_prototype(self, prototype: TaggedValue) {
        // SAFETY: as in read_u8.
        unsafe { *((self.0 + offsets::PROTOTYPE) as *mut u64) = prototype.raw_word() }
    }

    /// Writes the descriptor's fields into map memory. Called by the heap at
    /// installation time.
    pub(crate) fn install(self, meta_map_word: TaggedValue, descriptor: &MapDescriptor) {
        // SAFETY: the heap passes a freshly carved MAP_SIZE span.
        unsafe {
            *((self.0 + offsets::MAP) as *mut u64) = meta_map_word.raw_word();
        }
        self.write_u8(offsets::INSTANCE_SIZE, descriptor.instance_size_words);
        self.write_u8(offsets::INOBJECT_PROPERTIES, descriptor.inobject_properties);
        self.write_u8(
            offsets::PRE_ALLOCATED_PROPERTY_FIELDS,
            descriptor.pre_allocated_property_fields,
        );
        self.write_u8(
            offsets::UNUSED_PROPERTY_FIELDS,
            descriptor.unused_property_fields,
        );
        let bit_field = if descriptor.has_non_instance_prototype {
            HAS_NON_INSTANCE_PROTOTYPE
        } else {
            0
        };
        self.write_u8(offsets::BIT_FIELD, bit_field);
        self.write_u8(offsets::INSTANCE_TYPE, descriptor.instance_type as u8);
    }
}
