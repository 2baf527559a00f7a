//! The heap: spaces, roots and the object factory.
//!
//! Fast-path allocation happens in new space through [`Heap::allocate_in_new_space`];
//! a refused request routes the caller to its GC-required path without moving
//! the allocation top. The factory methods below are the general allocation
//! paths (and the bootstrap): they build fully initialized objects in old
//! space, where exhaustion only means growing by a page.

use log::trace;

use crate::map::{InstanceType, MapDescriptor, MapRef, MAP_SIZE};
use crate::object::{
    self, context, fixed_array, global_object, global_proxy, heap_object, js_array, js_function,
    js_object, oddball, shared_function_info, OddballKind,
};
use crate::page::{Page, MAX_HEAP_OBJECT_SIZE, POINTER_SIZE};
use crate::region::{Allocation, AllocationFlags, AllocationRegion, AllocationSize};
use tagged_values::{Smi, TaggedValue};

/// Default object-area size of the new-space chunk.
pub const NEW_SPACE_SIZE: usize = 64 * 1024;

/// The bump-allocated nursery. One region is active at a time.
#[derive(Debug)]
struct NewSpace {
    chunk: Page,
    region: AllocationRegion,
}

impl NewSpace {
    fn new(object_area: usize) -> NewSpace {
        let chunk = Page::with_object_area(object_area);
        let region = AllocationRegion::new(chunk.object_start(), chunk.object_area_end());
        NewSpace { chunk, region }
    }
}

/// A grow-by-pages space for long-lived objects (old space and map space).
#[derive(Debug)]
struct PagedSpace {
    pages: Vec<Page>,
    region: AllocationRegion,
}

impl PagedSpace {
    fn new() -> PagedSpace {
        let page = Page::new();
        let region = AllocationRegion::new(page.object_start(), page.object_area_end());
        PagedSpace {
            pages: vec![page],
            region,
        }
    }

    /// Allocates `size` bytes, growing by a page when the current one fills.
    /// Paged spaces never refuse a fitting request.
    fn allocate(&mut self, size: usize) -> usize {
        assert!(
            size <= MAX_HEAP_OBJECT_SIZE,
            "object of {} bytes belongs in large-object space",
            size
        );
        if let Allocation::Success { base, .. } = self
            .region
            .allocate(AllocationSize::Fixed(size), AllocationFlags::NONE)
        {
            return base;
        }
        let page = Page::new();
        self.region = AllocationRegion::new(page.object_start(), page.object_area_end());
        self.pages.push(page);
        match self
            .region
            .allocate(AllocationSize::Fixed(size), AllocationFlags::NONE)
        {
            Allocation::Success { base, .. } => base,
            Allocation::GcRequired => unreachable!("fresh page cannot be full"),
        }
    }

    fn contains(&self, address: usize) -> bool {
        self.pages.iter().any(|page| page.contains(address))
    }
}

/// One dedicated page per object.
#[derive(Debug, Default)]
struct LargeObjectSpace {
    pages: Vec<Page>,
}

impl LargeObjectSpace {
    /// Allocates a page for an object of `size` bytes and returns the
    /// object's base address.
    fn allocate(&mut self, size: usize) -> usize {
        let page = Page::new_large(size);
        let base = page.object_start();
        self.pages.push(page);
        base
    }

    fn contains(&self, address: usize) -> bool {
        self.pages.iter().any(|page| page.contains(address))
    }
}

/// Immortal values and maps installed at bootstrap.
#[derive(Debug, Clone, Copy)]
pub struct Roots {
    /// The map of maps; its own map word points at itself.
    pub meta_map: MapRef,
    /// Map of oddballs.
    pub oddball_map: MapRef,
    /// Map of fixed arrays.
    pub fixed_array_map: MapRef,
    /// Map of execution contexts.
    pub context_map: MapRef,
    /// Map of shared function infos.
    pub shared_function_info_map: MapRef,
    /// Map of functions.
    pub function_map: MapRef,
    /// Map of plain objects (also the wrapper map for converted receivers).
    pub object_map: MapRef,
    /// Map of global objects.
    pub global_object_map: MapRef,
    /// Map of global proxies.
    pub global_proxy_map: MapRef,
    /// The undefined value.
    pub undefined_value: TaggedValue,
    /// The null value.
    pub null_value: TaggedValue,
    /// The true value.
    pub true_value: TaggedValue,
    /// The false value.
    pub false_value: TaggedValue,
    /// The marker for unassigned array indices.
    pub the_hole_value: TaggedValue,
    /// The canonical zero-length fixed array.
    pub empty_fixed_array: TaggedValue,
}

/// A realm created by [`Heap::new_realm`]: a context wired to its global
/// object and global proxy.
#[derive(Debug, Clone, Copy)]
pub struct Realm {
    /// The realm's (global) context.
    pub context: TaggedValue,
    /// The realm's global object.
    pub global_object: TaggedValue,
    /// The security-boundary proxy standing in for the global object.
    pub global_proxy: TaggedValue,
}

/// The heap. A single mutator thread owns it mutably; the collector only
/// touches it during a pause that cannot overlap mutator execution.
#[derive(Debug)]
pub struct Heap {
    new_space: NewSpace,
    old_space: PagedSpace,
    map_space: PagedSpace,
    lo_space: LargeObjectSpace,
    roots: Roots,
}

impl Heap {
    /// Creates a heap with the default new-space size.
    pub fn new() -> Heap {
        Heap::with_new_space_size(NEW_SPACE_SIZE)
    }

    /// Creates a heap whose new space has `object_area` bytes; tests use
    /// small sizes to exercise the GC-required path.
    pub fn with_new_space_size(object_area: usize) -> Heap {
        let new_space = NewSpace::new(object_area);
        let mut map_space = PagedSpace::new();
        let mut old_space = PagedSpace::new();

        // Bootstrap the meta map by hand: its map word is itself.
        let meta_map_address = map_space.allocate(MAP_SIZE);
        // SAFETY: a freshly carved span in map space.
        let meta_map = unsafe { MapRef::from_address(meta_map_address) };
        meta_map.install(
            TaggedValue::from_heap_address(meta_map_address),
            &MapDescriptor::plain(InstanceType::Map, (MAP_SIZE / POINTER_SIZE) as u8),
        );

        let mut install = |descriptor: MapDescriptor| {
            let address = map_space.allocate(MAP_SIZE);
            // SAFETY: a freshly carved span in map space.
            let map = unsafe { MapRef::from_address(address) };
            map.install(meta_map.to_tagged(), &descriptor);
            map
        };

        let oddball_map = install(MapDescriptor::plain(
            InstanceType::Oddball,
            (oddball::SIZE / POINTER_SIZE) as u8,
        ));
        let fixed_array_map = install(MapDescriptor::plain(InstanceType::FixedArray, 2));
        let context_map = install(MapDescriptor::plain(InstanceType::Context, 2));
        let shared_function_info_map = install(MapDescriptor::plain(
            InstanceType::SharedFunctionInfo,
            (shared_function_info::SIZE / POINTER_SIZE) as u8,
        ));
        let function_map = install(MapDescriptor::plain(
            InstanceType::JsFunction,
            (js_function::SIZE / POINTER_SIZE) as u8,
        ));
        let object_map = install(MapDescriptor::plain(
            InstanceType::JsObject,
            (js_object::HEADER_SIZE / POINTER_SIZE) as u8,
        ));
        let global_object_map = install(MapDescriptor::plain(
            InstanceType::JsGlobalObject,
            (global_object::SIZE / POINTER_SIZE) as u8,
        ));
        let global_proxy_map = install(MapDescriptor::plain(
            InstanceType::JsGlobalProxy,
            (global_proxy::SIZE / POINTER_SIZE) as u8,
        ));

        let mut make_oddball = |kind: OddballKind| {
            let base = old_space.allocate(oddball::SIZE);
            // SAFETY: a freshly carved span in old space.
            unsafe {
                object::write_word_raw(
                    base,
                    heap_object::MAP_OFFSET,
                    oddball_map.to_tagged().raw_word(),
                );
                object::write_word_raw(
                    base,
                    oddball::KIND_OFFSET,
                    kind.to_smi().encode().raw_word(),
                );
            }
            TaggedValue::from_heap_address(base)
        };

        let undefined_value = make_oddball(OddballKind::Undefined);
        let null_value = make_oddball(OddballKind::Null);
        let true_value = make_oddball(OddballKind::True);
        let false_value = make_oddball(OddballKind::False);
        let the_hole_value = make_oddball(OddballKind::TheHole);

        let empty_base = old_space.allocate(fixed_array::size_for(0));
        // SAFETY: a freshly carved span in old space.
        unsafe {
            object::write_word_raw(
                empty_base,
                heap_object::MAP_OFFSET,
                fixed_array_map.to_tagged().raw_word(),
            );
            object::write_word_raw(empty_base, fixed_array::LENGTH_OFFSET, 0);
        }
        let empty_fixed_array = TaggedValue::from_heap_address(empty_base);

        Heap {
            new_space,
            old_space,
            map_space,
            lo_space: LargeObjectSpace::default(),
            roots: Roots {
                meta_map,
                oddball_map,
                fixed_array_map,
                context_map,
                shared_function_info_map,
                function_map,
                object_map,
                global_object_map,
                global_proxy_map,
                undefined_value,
                null_value,
                true_value,
                false_value,
                the_hole_value,
                empty_fixed_array,
            },
        }
    }

    /// The immortal roots.
    pub fn roots(&self) -> &Roots {
        &self.roots
    }

    /// The new-space allocation region (top and limit).
    pub fn new_space_region(&self) -> &AllocationRegion {
        &self.new_space.region
    }

    /// Fast-path bump allocation in new space.
    ///
    /// On `GcRequired` the region is untouched and the caller must fall back
    /// to a general allocation path; any raw addresses it holds must be
    /// re-derived afterwards, since a collection may move objects.
    pub fn allocate_in_new_space(
        &mut self,
        size: AllocationSize,
        flags: AllocationFlags,
    ) -> Allocation {
        let outcome = self.new_space.region.allocate(size, flags);
        if outcome.is_gc_required() {
            trace!(
                "new space exhausted: request of {} bytes, {} remaining",
                size.bytes(),
                self.new_space.region.remaining()
            );
        }
        outcome
    }

    /// Retracts the most recent new-space allocation. Only legal while the
    /// object is still the topmost allocation; used when a multi-step
    /// allocation sequence fails partway.
    pub fn undo_allocation_in_new_space(&mut self, object: usize) {
        self.new_space.region.undo(object);
    }

    /// Returns whether `address` lies in the young generation.
    pub fn is_in_new_space(&self, address: usize) -> bool {
        self.new_space.chunk.contains(address)
    }

    /// Returns whether a tagged value references the young generation.
    pub fn value_in_new_space(&self, value: TaggedValue) -> bool {
        value.is_heap_reference() && self.is_in_new_space(value.heap_address())
    }

    /// Returns whether `address` lies in any space of this heap.
    pub fn contains(&self, address: usize) -> bool {
        self.is_in_new_space(address)
            || self.old_space.contains(address)
            || self.map_space.contains(address)
            || self.lo_space.contains(address)
    }

    /// Installs a map with the given prototype.
    pub fn allocate_map(&mut self, descriptor: MapDescriptor, prototype: TaggedValue) -> MapRef {
        let address = self.map_space.allocate(MAP_SIZE);
        // SAFETY: a freshly carved span in map space.
        let map = unsafe { MapRef::from_address(address) };
        map.install(self.roots.meta_map.to_tagged(), &descriptor);
        map.set_prototype(prototype);
        map
    }

    /// Creates a fixed array filled with `fill`. Arrays too big for a paged
    /// space get a dedicated large-object page with its appended
    /// remembered-set table.
    pub fn new_fixed_array(&mut self, count: usize, fill: TaggedValue) -> TaggedValue {
        let size = fixed_array::size_for(count);
        let base = if size > MAX_HEAP_OBJECT_SIZE {
            self.lo_space.allocate(size)
        } else {
            self.old_space.allocate(size)
        };
        // SAFETY: a freshly carved span sized for `count` elements.
        unsafe {
            object::write_word_raw(
                base,
                heap_object::MAP_OFFSET,
                self.roots.fixed_array_map.to_tagged().raw_word(),
            );
            object::write_word_raw(base, fixed_array::LENGTH_OFFSET, count as u64);
            for index in 0..count {
                object::write_word_raw(base, fixed_array::element_offset(index), fill.raw_word());
            }
        }
        TaggedValue::from_heap_address(base)
    }

    /// Creates a plain object from its map: properties and elements empty,
    /// in-object fields undefined, and a properties array when the map
    /// describes slots beyond the in-object ones. This is the general
    /// allocation path behind the construct stub's fast path.
    pub fn new_js_object(&mut self, map: MapRef) -> TaggedValue {
        let extra_properties = (map.unused_property_fields()
            + map.pre_allocated_property_fields())
        .saturating_sub(map.inobject_properties());
        let properties = if extra_properties > 0 {
            self.new_fixed_array(extra_properties, self.roots.undefined_value)
        } else {
            self.roots.empty_fixed_array
        };

        let size = map.instance_size();
        let base = self.old_space.allocate(size);
        // SAFETY: a freshly carved span of `size` bytes.
        unsafe {
            object::write_word_raw(base, heap_object::MAP_OFFSET, map.to_tagged().raw_word());
            object::write_word_raw(base, js_object::PROPERTIES_OFFSET, properties.raw_word());
            object::write_word_raw(
                base,
                js_object::ELEMENTS_OFFSET,
                self.roots.empty_fixed_array.raw_word(),
            );
            let mut offset = js_object::HEADER_SIZE;
            while offset < size {
                object::write_word_raw(base, offset, self.roots.undefined_value.raw_word());
                offset += POINTER_SIZE;
            }
        }
        TaggedValue::from_heap_address(base)
    }

    /// Creates an array with `capacity` backing slots filled with the hole
    /// and a smi length of `length`.
    pub fn new_js_array(&mut self, map: MapRef, length: i32, capacity: usize) -> TaggedValue {
        debug_assert!(length >= 0);
        let elements = if capacity == 0 {
            self.roots.empty_fixed_array
        } else {
            self.new_fixed_array(capacity, self.roots.the_hole_value)
        };
        let base = self.old_space.allocate(js_array::SIZE);
        // SAFETY: a freshly carved span of js_array::SIZE bytes.
        unsafe {
            object::write_word_raw(base, heap_object::MAP_OFFSET, map.to_tagged().raw_word());
            object::write_word_raw(
                base,
                js_object::PROPERTIES_OFFSET,
                self.roots.empty_fixed_array.raw_word(),
            );
            object::write_word_raw(base, js_object::ELEMENTS_OFFSET, elements.raw_word());
            object::write_word_raw(
                base,
                js_array::LENGTH_OFFSET,
                Smi::new(length)
                    .expect("array length is a smi")
                    .encode()
                    .raw_word(),
            );
        }
        TaggedValue::from_heap_address(base)
    }

    /// Creates a function bound to `context`.
    ///
    /// `formal_parameter_count` may be the don't-adapt sentinel. `code` and
    /// `construct_stub` are code ids resolved by the execution core.
    pub fn new_function(
        &mut self,
        ctx: TaggedValue,
        formal_parameter_count: i32,
        code: u32,
        construct_stub: u32,
    ) -> TaggedValue {
        let shared_base = self.old_space.allocate(shared_function_info::SIZE);
        // SAFETY: a freshly carved span for the shared info.
        unsafe {
            object::write_word_raw(
                shared_base,
                heap_object::MAP_OFFSET,
                self.roots.shared_function_info_map.to_tagged().raw_word(),
            );
            object::write_word_raw(
                shared_base,
                shared_function_info::FORMAL_PARAMETER_COUNT_OFFSET,
                Smi::new(formal_parameter_count)
                    .expect("parameter count is a smi")
                    .encode()
                    .raw_word(),
            );
            object::write_word_raw(shared_base, shared_function_info::CODE_OFFSET, code as u64);
            object::write_word_raw(
                shared_base,
                shared_function_info::CONSTRUCT_STUB_OFFSET,
                construct_stub as u64,
            );
        }

        let base = self.old_space.allocate(js_function::SIZE);
        // SAFETY: a freshly carved span for the function.
        unsafe {
            object::write_word_raw(
                base,
                heap_object::MAP_OFFSET,
                self.roots.function_map.to_tagged().raw_word(),
            );
            object::write_word_raw(
                base,
                js_object::PROPERTIES_OFFSET,
                self.roots.empty_fixed_array.raw_word(),
            );
            object::write_word_raw(
                base,
                js_object::ELEMENTS_OFFSET,
                self.roots.empty_fixed_array.raw_word(),
            );
            object::write_word_raw(
                base,
                js_function::SHARED_INFO_OFFSET,
                TaggedValue::from_heap_address(shared_base).raw_word(),
            );
            object::write_word_raw(base, js_function::CONTEXT_OFFSET, ctx.raw_word());
            object::write_word_raw(
                base,
                js_function::PROTOTYPE_OR_INITIAL_MAP_OFFSET,
                self.roots.the_hole_value.raw_word(),
            );
        }
        TaggedValue::from_heap_address(base)
    }

    /// Installs a constructor's initial map, enabling the construct stub's
    /// fast path.
    pub fn set_initial_map(&mut self, function: TaggedValue, map: MapRef) {
        // SAFETY: `function` was produced by new_function.
        unsafe {
            object::write_field(
                function,
                js_function::PROTOTYPE_OR_INITIAL_MAP_OFFSET,
                map.to_tagged(),
            );
        }
    }

    /// Creates a realm: a context wired to a fresh global object and global
    /// proxy. The security token defaults to the global object itself.
    pub fn new_realm(&mut self) -> Realm {
        let context_base = self.old_space.allocate(context::SIZE);
        let context_value = TaggedValue::from_heap_address(context_base);

        let global_base = self.old_space.allocate(global_object::SIZE);
        let global_value = TaggedValue::from_heap_address(global_base);

        let proxy_base = self.old_space.allocate(global_proxy::SIZE);
        let proxy_value = TaggedValue::from_heap_address(proxy_base);

        // SAFETY: three freshly carved spans of the right sizes.
        unsafe {
            object::write_word_raw(
                context_base,
                heap_object::MAP_OFFSET,
                self.roots.context_map.to_tagged().raw_word(),
            );
            object::write_word_raw(
                context_base,
                fixed_array::LENGTH_OFFSET,
                context::SLOT_COUNT as u64,
            );
            object::write_word_raw(
                context_base,
                context::slot_offset(context::GLOBAL_INDEX),
                global_value.raw_word(),
            );
            object::write_word_raw(
                context_base,
                context::slot_offset(context::SECURITY_TOKEN_INDEX),
                global_value.raw_word(),
            );
            object::write_word_raw(
                context_base,
                context::slot_offset(context::ARRAY_FUNCTION_INDEX),
                self.roots.the_hole_value.raw_word(),
            );

            object::write_word_raw(
                global_base,
                heap_object::MAP_OFFSET,
                self.roots.global_object_map.to_tagged().raw_word(),
            );
            object::write_word_raw(
                global_base,
                js_object::PROPERTIES_OFFSET,
                self.roots.empty_fixed_array.raw_word(),
            );
            object::write_word_raw(
                global_base,
                js_object::ELEMENTS_OFFSET,
                self.roots.empty_fixed_array.raw_word(),
            );
            object::write_word_raw(
                global_base,
                global_object::GLOBAL_CONTEXT_OFFSET,
                context_value.raw_word(),
            );
            object::write_word_raw(
                global_base,
                global_object::GLOBAL_RECEIVER_OFFSET,
                proxy_value.raw_word(),
            );

            object::write_word_raw(
                proxy_base,
                heap_object::MAP_OFFSET,
                self.roots.global_proxy_map.to_tagged().raw_word(),
            );
            object::write_word_raw(
                proxy_base,
                js_object::PROPERTIES_OFFSET,
                self.roots.empty_fixed_array.raw_word(),
            );
            object::write_word_raw(
                proxy_base,
                js_object::ELEMENTS_OFFSET,
                self.roots.empty_fixed_array.raw_word(),
            );
            object::write_word_raw(
                proxy_base,
                global_proxy::CONTEXT_OFFSET,
                context_value.raw_word(),
            );
        }

        Realm {
            context: context_value,
            global_object: global_value,
            global_proxy: proxy_value,
        }
    }

    /// Reads a context slot.
    pub fn context_slot(&self, ctx: TaggedValue, index: usize) -> TaggedValue {
        // SAFETY: contexts are produced by new_realm with SLOT_COUNT slots.
        unsafe { object::read_field(ctx, context::slot_offset(index)) }
    }

    /// Writes a context slot, recording the write for the collector.
    pub fn set_context_slot(&mut self, ctx: TaggedValue, index: usize, value: TaggedValue) {
        // SAFETY: as in context_slot.
        unsafe {
            object::write_field(ctx, context::slot_offset(index), value);
        }
        self.record_write_field(ctx, context::slot_offset(index), value);
    }

    /// Old-generation pages, in allocation order. The scavenger walks their
    /// remembered sets during a minor collection.
    pub fn old_pages(&self) -> &[Page] {
        &self.old_space.pages
    }

    /// Mutable view of the old-generation pages, for the scavenger's
    /// clear-after-rescan step.
    pub fn old_pages_mut(&mut self) -> &mut [Page] {
        &mut self.old_space.pages
    }

    /// Large-object pages, one object each.
    pub fn large_pages(&self) -> &[Page] {
        &self.lo_space.pages
    }

    /// Mutable view of the large-object pages.
    pub fn large_pages_mut(&mut self) -> &mut [Page] {
        &mut self.lo_space.pages
    }

    /// The instance type of a heap value produced by this heap.
    pub fn instance_type_of(&self, value: TaggedValue) -> u8 {
        // SAFETY: values produced by this heap carry valid map words.
        unsafe { object::instance_type_of(value) }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}
