//! Prototype-chain validation for inline caches.
//!
//! An inline cache snapshots the maps along the prototype chain from a
//! receiver to the holder of the cached property at code-generation time.
//! Before cached code is reused, the snapshot is replayed against the live
//! objects: any map that changed in the meantime sends control to the miss
//! handler, and the cache owner must regenerate.
//!
//! Global proxies get an additional security check: the token of the proxy's
//! realm is compared against the token of the currently executing context.
//! The check runs strictly after the link's map check (global status is only
//! trustworthy once the map is confirmed) and also covers the final holder,
//! even when the holder is reached with zero intermediate steps.

use arrayvec::ArrayVec;
use log::{debug, trace};

use memory_manager::map::InstanceType;
use memory_manager::object::{self, context, global_proxy};
use memory_manager::{Heap, MapRef};
use tagged_values::TaggedValue;

use crate::machine::Machine;
use crate::registers::Register;

/// Longest chain an inline cache validates before giving up on caching.
pub const MAX_CHAIN_DEPTH: usize = 8;

/// Outcome of replaying a generated chain check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainOutcome {
    /// Every map (and security token) still matches; the cached code may
    /// run.
    Valid,
    /// Some link changed; control transfers to the miss handler and the
    /// cache must be regenerated.
    Miss,
}

#[derive(Debug, Clone, Copy)]
struct ChainLink {
    map: MapRef,
    is_global_proxy: bool,
}

/// A generated prototype-chain check: one snapshotted link per object from
/// the receiver to the holder, inclusive.
#[derive(Debug, Clone)]
pub struct ChainCheck {
    links: ArrayVec<ChainLink, MAX_CHAIN_DEPTH>,
}

impl ChainCheck {
    /// Snapshots the chain from `object` to `holder` at generation time.
    ///
    /// # Panics
    ///
    /// Panics if `holder` is not on `object`'s prototype chain or the chain
    /// is deeper than [`MAX_CHAIN_DEPTH`]; both indicate a code-generation
    /// bug in the cache owner.
    pub fn generate(heap: &Heap, object: TaggedValue, holder: TaggedValue) -> ChainCheck {
        let mut links: ArrayVec<ChainLink, MAX_CHAIN_DEPTH> = ArrayVec::new();
        let mut current = object;
        loop {
            // SAFETY: chain objects are live values of this heap.
            let map = unsafe { object::map_of(current) };
            links
                .try_push(ChainLink {
                    map,
                    is_global_proxy: map.instance_type() == InstanceType::JsGlobalProxy as u8,
                })
                .expect("prototype chain too deep to cache");
            if current == holder {
                break;
            }
            let prototype = map.prototype();
            assert!(
                prototype.is_heap_reference() && prototype != heap.roots().null_value,
                "holder is not on the receiver's prototype chain"
            );
            current = prototype;
        }
        debug!("check-maps depth {}", links.len());
        ChainCheck { links }
    }

    /// Number of objects covered by the check.
    pub fn depth(&self) -> usize {
        self.links.len()
    }

    /// Replays the generated checks against the live chain starting at
    /// `object`, using the machine's current context for security checks.
    pub fn validate(&self, machine: &Machine, heap: &Heap, object: TaggedValue) -> ChainOutcome {
        let mut current = object;
        for (index, link) in self.links.iter().enumerate() {
            // SAFETY: chain objects are live values of this heap.
            let map = unsafe { object::map_of(current) };
            if map != link.map {
                trace!("map check failed at depth {}", index);
                return ChainOutcome::Miss;
            }
            // The security check must come after the map check: only a
            // confirmed map makes the global-proxy status trustworthy.
            if link.is_global_proxy && !security_tokens_match(machine, heap, current) {
                trace!("security check failed at depth {}", index);
                return ChainOutcome::Miss;
            }
            // Follow the prototype recorded in the (confirmed) map.
            current = map.prototype();
        }
        ChainOutcome::Valid
    }
}

/// Compares the security token of the currently executing context with the
/// token of a global proxy's realm.
fn security_tokens_match(machine: &Machine, heap: &Heap, proxy: TaggedValue) -> bool {
    let current_context = machine.get_value(Register::Context);
    debug_assert!(
        current_context.is_heap_reference(),
        "we should not have an empty lexical context"
    );
    let current_token = heap.context_slot(current_context, context::SECURITY_TOKEN_INDEX);

    // SAFETY: the proxy's map was confirmed by the caller's map check.
    let proxy_context = unsafe { object::read_field(proxy, global_proxy::CONTEXT_OFFSET) };
    let proxy_token = heap.context_slot(proxy_context, context::SECURITY_TOKEN_INDEX);

    current_token == proxy_token
}
