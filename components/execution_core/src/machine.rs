//! The abstract machine: register file, word stack, frame management.
//!
//! The stack is an array of raw words growing downward (pushing decrements
//! the stack pointer, which is a slot index; lower index means nearer the
//! top). Frame pointers are slot indices, so the fp-relative offsets of
//! [`crate::frames`] apply directly.
//!
//! Calling convention: the caller pushes the receiver first, then the
//! arguments in source order (the last argument ends up adjacent to the
//! return address), sets the argument-count register, and calls. The callee
//! pops the return address and its receiver-plus-argument slots before
//! returning (see [`Machine::return_to_caller`]).

use crate::frames::{exit_frame, standard_frame, FrameKind};
use crate::registers::{Register, RegisterFile};
use tagged_values::TaggedValue;

/// Default stack size in slots.
pub const STACK_SLOTS: usize = 4 * 1024;

/// Slots reserved at the bottom of the stack; running into them is the
/// overflow condition the stack guard watches for.
pub const STACK_GUARD_SLACK: usize = 64;

/// The well-known slots native/runtime code uses to find the calling frame.
/// Fields of the machine rather than process-wide statics, so a host can run
/// several isolated machines.
#[derive(Debug, Clone, Copy, Default)]
pub struct TopSlots {
    /// Frame pointer of the innermost exit frame, zero when none is active.
    pub c_entry_fp: u64,
    /// Context saved by the innermost exit frame.
    pub context: u64,
}

/// The cooperative stack guard: a limit the stack pointer must stay above
/// and a pending-interrupt flag checked at explicit suspension points.
#[derive(Debug, Clone, Copy)]
pub struct StackGuard {
    /// Lowest slot index the stack may grow to.
    pub limit: usize,
    /// Set by the host to request a runtime callout at the next check.
    pub pending_interrupt: bool,
    /// Number of interrupts serviced; the stack-guard runtime bumps this.
    pub interrupts_serviced: u32,
}

/// The machine state every emission helper operates on.
#[derive(Debug)]
pub struct Machine {
    registers: RegisterFile,
    stack: Vec<u64>,
    sp: usize,
    fp: usize,
    current_code_object: u64,
    next_return_cookie: u64,
    /// Exit-frame bookkeeping slots.
    pub top_slots: TopSlots,
    /// The cooperative stack guard.
    pub stack_guard: StackGuard,
    /// Set while the debugger requests step-into; disables allocation fast
    /// paths that would skip the step point.
    pub debug_step_in_pending: bool,
}

/// Base pattern of return-address cookies, chosen so a cookie is never a
/// plausible tagged value in tests.
const RETURN_COOKIE_BASE: u64 = 0x5EED_0000_0000_0000;

impl Machine {
    /// A machine with the default stack size.
    pub fn new() -> Machine {
        Machine::with_stack_slots(STACK_SLOTS)
    }

    /// A machine with `slots` stack slots; tests use small stacks to
    /// exercise the overflow paths.
    pub fn with_stack_slots(slots: usize) -> Machine {
        Machine {
            registers: RegisterFile::new(),
            stack: vec![0; slots],
            sp: slots,
            fp: slots,
            current_code_object: 0,
            next_return_cookie: RETURN_COOKIE_BASE,
            top_slots: TopSlots::default(),
            stack_guard: StackGuard {
                limit: STACK_GUARD_SLACK.min(slots / 4),
                pending_interrupt: false,
                interrupts_serviced: 0,
            },
            debug_step_in_pending: false,
        }
    }

    // --- registers ---

    /// Raw word in `register`.
    pub fn get(&self, register: Register) -> u64 {
        self.registers.get(register)
    }

    /// Stores a raw word into `register`.
    pub fn set(&mut self, register: Register, word: u64) {
        self.registers.set(register, word);
    }

    /// Tagged view of `register`.
    pub fn get_value(&self, register: Register) -> TaggedValue {
        self.registers.get_value(register)
    }

    /// Stores a tagged value into `register`.
    pub fn set_value(&mut self, register: Register, value: TaggedValue) {
        self.registers.set_value(register, value);
    }

    // --- stack ---

    /// Current stack pointer (a slot index; lower is nearer the top).
    pub fn sp(&self) -> usize {
        self.sp
    }

    /// Rewrites the stack pointer. Used by frame teardown.
    pub fn set_sp(&mut self, sp: usize) {
        debug_assert!(sp <= self.stack.len());
        self.sp = sp;
    }

    /// Current frame pointer.
    pub fn fp(&self) -> usize {
        self.fp
    }

    /// Rewrites the frame pointer. Used by frame teardown.
    pub fn set_fp(&mut self, fp: usize) {
        self.fp = fp;
    }

    /// Number of slots currently pushed.
    pub fn used_slots(&self) -> usize {
        self.stack.len() - self.sp
    }

    /// Slots left before the stack is physically exhausted.
    pub fn room(&self) -> usize {
        self.sp.saturating_sub(self.stack_guard.limit)
    }

    /// Pushes a raw word.
    pub fn push(&mut self, word: u64) {
        assert!(self.sp > 0, "machine stack exhausted");
        self.sp -= 1;
        self.stack[self.sp] = word;
    }

    /// Pops a raw word.
    pub fn pop(&mut self) -> u64 {
        assert!(self.sp < self.stack.len(), "pop from empty machine stack");
        let word = self.stack[self.sp];
        self.sp += 1;
        word
    }

    /// Pushes a tagged value.
    pub fn push_value(&mut self, value: TaggedValue) {
        self.push(value.raw_word());
    }

    /// Pops a tagged value.
    pub fn pop_value(&mut self) -> TaggedValue {
        TaggedValue::from_raw_word(self.pop())
    }

    /// Raw word at slot `index`.
    pub fn slot(&self, index: usize) -> u64 {
        self.stack[index]
    }

    /// Overwrites slot `index`.
    pub fn set_slot(&mut self, index: usize, word: u64) {
        self.stack[index] = word;
    }

    /// Tagged view of slot `index`.
    pub fn slot_value(&self, index: usize) -> TaggedValue {
        TaggedValue::from_raw_word(self.slot(index))
    }

    /// Slot at `offset` (in slots) from the frame pointer.
    pub fn frame_slot(&self, offset: isize) -> u64 {
        self.slot((self.fp as isize + offset) as usize)
    }

    /// Overwrites the slot at `offset` from the frame pointer.
    pub fn set_frame_slot(&mut self, offset: isize, word: u64) {
        self.set_slot((self.fp as isize + offset) as usize, word);
    }

    /// Argument `index` of the current call under the entry layout (return
    /// address on top): index 0 is the receiver (the deepest slot), index
    /// `i` the i-th argument.
    pub fn argument(&self, arg_count: u32, index: u32) -> TaggedValue {
        debug_assert!(index <= arg_count);
        self.slot_value(self.sp + 1 + (arg_count - index) as usize)
    }

    // --- calls ---

    /// Pushes a fresh return-address cookie and returns it.
    pub fn push_return_address(&mut self) -> u64 {
        self.next_return_cookie += 1;
        let cookie = self.next_return_cookie;
        self.push(cookie);
        cookie
    }

    /// The callee's return sequence: pops the return address, then
    /// `arg_slots` argument slots (receiver included).
    pub fn return_to_caller(&mut self, arg_slots: usize) {
        self.pop();
        self.set_sp(self.sp + arg_slots);
    }

    /// Marker word of the code object currently executing.
    pub fn current_code_object(&self) -> u64 {
        self.current_code_object
    }

    /// Installs the marker word of the code object about to execute and
    /// returns the previous one.
    pub fn swap_current_code_object(&mut self, marker: u64) -> u64 {
        std::mem::replace(&mut self.current_code_object, marker)
    }

    // --- frames ---

    /// Establishes a standard frame: push caller fp, set fp, push context,
    /// push the kind marker, push the code-object marker.
    pub fn enter_frame(&mut self, kind: FrameKind) {
        debug_assert!(kind.is_standard(), "dedicated entry for {:?} frames", kind);
        self.push(self.fp as u64);
        self.fp = self.sp;
        self.push(self.get(Register::Context));
        self.push(kind.marker().raw_word());
        self.push(self.current_code_object);
    }

    /// Tears down a standard frame. The marker must match the expected
    /// kind; a mismatch is a code-generation bug and is fatal in all builds.
    pub fn leave_frame(&mut self, kind: FrameKind) {
        debug_assert!(kind.is_standard(), "dedicated leave for {:?} frames", kind);
        let marker = self.frame_slot(standard_frame::MARKER_SLOT);
        assert!(
            marker == kind.marker().raw_word(),
            "stack frame types must match"
        );
        self.sp = self.fp;
        let caller_fp = self.pop();
        self.fp = caller_fp as usize;
    }

    /// Establishes an exit frame ahead of a native/runtime call taking
    /// `arg_count` caller-pushed slots: record fp and context in the
    /// machine's top slots, reserve alignment padding, and remember the
    /// pre-call stack pointer so the leave sequence unwinds exactly the
    /// arguments pushed for the call.
    pub fn enter_exit_frame(&mut self, kind: FrameKind, arg_count: u32) {
        debug_assert!(kind.is_exit(), "not an exit frame kind: {:?}", kind);
        self.push(self.fp as u64);
        self.fp = self.sp;
        self.push(0); // saved sp, patched below
        self.push(kind.marker().raw_word());

        self.top_slots.c_entry_fp = self.fp as u64;
        self.top_slots.context = self.get(Register::Context);

        // Base of the caller-pushed arguments, retained across the call.
        let argv = self.fp as u64 + standard_frame::CALLER_SP_SLOT as u64 + arg_count as u64 - 1;
        self.set(Register::Argv, argv);

        // Activation-frame alignment: keep sp on an even slot (16 bytes).
        self.sp &= !1;

        self.set_frame_slot(exit_frame::SAVED_SP_SLOT, self.sp as u64);
    }

    /// Tears down an exit frame: restore fp, drop the frame and the caller
    /// arguments, restore the context from the top slots, clear the top
    /// frame, and put the return address back on top.
    pub fn leave_exit_frame(&mut self) {
        let marker = self.frame_slot(exit_frame::MARKER_SLOT);
        debug_assert!(
            marker == FrameKind::Exit.marker().raw_word()
                || marker == FrameKind::ExitDebug.marker().raw_word(),
            "leaving a non-exit frame"
        );

        let return_address = self.frame_slot(standard_frame::RETURN_ADDRESS_SLOT);
        let caller_fp = self.frame_slot(standard_frame::CALLER_FP_SLOT);

        // Pop everything up to and including the arguments.
        let argv = self.get(Register::Argv) as usize;
        self.set_sp(argv + 1);

        self.set(Register::Context, self.top_slots.context);
        if cfg!(debug_assertions) {
            self.top_slots.context = 0;
        }

        self.push(return_address);
        self.top_slots.c_entry_fp = 0;
        self.fp = caller_fp as usize;
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}
