//! Tagged value representation shared between the compiler, the runtime and
//! generated code.
//!
//! A value is a single machine word that is either a small integer (smi)
//! carried inline or a tagged reference to a heap object. This crate provides:
//! - The word-level encoding and the sum-type view over it
//! - Checked smi arithmetic with explicit bail-out outcomes
//!
//! All arithmetic helpers are written against the sum-type contract, not the
//! bit trick, so the encoding can be swapped per target architecture.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod arithmetic;
pub mod value;

// Re-export main types at crate root
pub use arithmetic::ArithOutcome;
pub use value::{Smi, TaggedValue, ValueKind, HEAP_OBJECT_TAG, SMI_TAG, SMI_TAG_SIZE, TAG_MASK};
