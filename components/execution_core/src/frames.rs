//! Stack-frame kinds and their fixed slot layouts.
//!
//! Slot offsets are fp-relative (positive toward the caller, negative toward
//! the frame's own slots) and are a fixed contract with the collector's
//! stack walker and the exception unwinder: any change to push order is a
//! breaking change to those collaborators. Each layout is also written down
//! as a fixed-layout struct, with compile-time assertions tying the struct's
//! field order to the slot constants.

use std::mem;

use tagged_values::{Smi, TaggedValue};

/// The frame kinds, pushed smi-tagged into the marker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum FrameKind {
    /// A frame for internal (engine) code.
    Internal = 1,
    /// A frame established by the construct stub.
    Construct = 2,
    /// A synthetic frame reconciling actual and expected argument counts.
    ArgumentsAdaptor = 3,
    /// A frame marking the transition to native/runtime code.
    Exit = 4,
    /// An exit frame carrying debugger state.
    ExitDebug = 5,
}

impl FrameKind {
    /// The marker word stored in the frame's marker slot.
    pub fn marker(self) -> TaggedValue {
        Smi::new(self as i32).expect("frame kinds are tiny").encode()
    }

    /// Whether this kind uses the standard enter/leave sequence.
    pub fn is_standard(self) -> bool {
        matches!(self, FrameKind::Internal | FrameKind::Construct)
    }

    /// Whether this kind marks an exit frame.
    pub fn is_exit(self) -> bool {
        matches!(self, FrameKind::Exit | FrameKind::ExitDebug)
    }
}

/// Slot offsets shared by standard (internal/construct) frames.
pub mod standard_frame {
    /// Saved caller frame pointer.
    pub const CALLER_FP_SLOT: isize = 0;
    /// Return address pushed by the call.
    pub const RETURN_ADDRESS_SLOT: isize = 1;
    /// First caller-pushed slot (the caller's stack top at call time).
    pub const CALLER_SP_SLOT: isize = 2;
    /// The enclosing execution context.
    pub const CONTEXT_SLOT: isize = -1;
    /// The smi-tagged frame kind.
    pub const MARKER_SLOT: isize = -2;
    /// Marker identifying the currently executing code object.
    pub const CODE_OBJECT_SLOT: isize = -3;
}

/// Slot offsets of arguments-adaptor frames. The marker sits where standard
/// frames keep the context: a smi in the context slot is how stack walkers
/// recognize an adaptor frame.
pub mod adaptor_frame {
    /// The smi-tagged frame kind, in the context slot position.
    pub const MARKER_SLOT: isize = -1;
    /// The function being adapted.
    pub const FUNCTION_SLOT: isize = -2;
    /// Smi-tagged actual argument count, used to unwind the caller's slots.
    pub const LENGTH_SLOT: isize = -3;
}

/// Slot offsets of exit frames.
pub mod exit_frame {
    /// Stack pointer recorded after alignment, patched on entry.
    pub const SAVED_SP_SLOT: isize = -1;
    /// The smi-tagged frame kind, doubling as the debug marker.
    pub const MARKER_SLOT: isize = -2;
}

/// Extra slots the construct stub pushes below a standard frame.
pub mod construct_frame {
    /// Smi-tagged argument count.
    pub const ARG_COUNT_SLOT: isize = -4;
    /// The constructor being invoked.
    pub const FUNCTION_SLOT: isize = -5;
}

/// A standard frame written out lowest slot first.
#[repr(C)]
pub struct StandardFrameLayout {
    /// Code-object marker (fp - 3).
    pub code_object: u64,
    /// Frame-kind marker (fp - 2).
    pub marker: u64,
    /// Execution context (fp - 1).
    pub context: u64,
    /// Saved caller frame pointer (fp + 0).
    pub caller_fp: u64,
    /// Return address (fp + 1).
    pub return_address: u64,
}

/// An adaptor frame written out lowest slot first.
#[repr(C)]
pub struct AdaptorFrameLayout {
    /// Smi-tagged actual count (fp - 3).
    pub length: u64,
    /// Adapted function (fp - 2).
    pub function: u64,
    /// Frame-kind marker (fp - 1).
    pub marker: u64,
    /// Saved caller frame pointer (fp + 0).
    pub caller_fp: u64,
    /// Return address (fp + 1).
    pub return_address: u64,
}

/// An exit frame written out lowest slot first.
#[repr(C)]
pub struct ExitFrameLayout {
    /// Frame-kind marker (fp - 2).
    pub marker: u64,
    /// Recorded stack pointer (fp - 1).
    pub saved_sp: u64,
    /// Saved caller frame pointer (fp + 0).
    pub caller_fp: u64,
    /// Return address (fp + 1).
    pub return_address: u64,
}

const WORD: usize = mem::size_of::<u64>();

// Field order must match the slot constants; collaborators hard-code these.
const _: () = {
    let base = (-standard_frame::CODE_OBJECT_SLOT) as usize;
    assert!(mem::offset_of!(StandardFrameLayout, code_object) / WORD == 0);
    assert!(
        mem::offset_of!(StandardFrameLayout, marker) / WORD
            == (standard_frame::MARKER_SLOT + base as isize) as usize
    );
    assert!(
        mem::offset_of!(StandardFrameLayout, context) / WORD
            == (standard_frame::CONTEXT_SLOT + base as isize) as usize
    );
    assert!(
        mem::offset_of!(StandardFrameLayout, caller_fp) / WORD
            == (standard_frame::CALLER_FP_SLOT + base as isize) as usize
    );
    assert!(
        mem::offset_of!(StandardFrameLayout, return_address) / WORD
            == (standard_frame::RETURN_ADDRESS_SLOT + base as isize) as usize
    );
};

const _: () = {
    let base = (-adaptor_frame::LENGTH_SLOT) as usize;
    assert!(mem::offset_of!(AdaptorFrameLayout, length) / WORD == 0);
    assert!(
        mem::offset_of!(AdaptorFrameLayout, function) / WORD
            == (adaptor_frame::FUNCTION_SLOT + base as isize) as usize
    );
    assert!(
        mem::offset_of!(AdaptorFrameLayout, marker) / WORD
            == (adaptor_frame::MARKER_SLOT + base as isize) as usize
    );
    assert!(mem::offset_of!(AdaptorFrameLayout, caller_fp) / WORD == base);
};

const _: () = {
    let base = (-exit_frame::MARKER_SLOT) as usize;
    assert!(mem::offset_of!(ExitFrameLayout, marker) / WORD == 0);
    assert!(
        mem::offset_of!(ExitFrameLayout, saved_sp) / WORD
            == (exit_frame::SAVED_SP_SLOT + base as isize) as usize
    );
    assert!(mem::offset_of!(ExitFrameLayout, caller_fp) / WORD == base);
};
