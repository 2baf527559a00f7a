//! Named-role machine registers.
//!
//! The abstract machine gives each register a defined role in the calling
//! convention instead of a concrete encoding, so the instruction-emission
//! helpers can be retargeted per architecture.

use tagged_values::TaggedValue;

/// The register roles of the calling convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Register {
    /// Actual argument count of the current call (untagged).
    ArgCount = 0,
    /// The callee (a tagged function reference).
    Callee = 1,
    /// The current execution context (tagged).
    Context = 2,
    /// Expected argument count handed to the adaptor (untagged).
    ExpectedCount = 3,
    /// Code id of the invocation target handed to the adaptor.
    Target = 4,
    /// Return value of the most recent call (tagged).
    ReturnValue = 5,
    /// Caller-argument base saved across exit frames.
    Argv = 6,
    /// Scratch.
    Scratch = 7,
}

/// Number of machine registers.
pub const REGISTER_COUNT: usize = 8;

/// The machine's register file: raw words indexed by role.
#[derive(Debug, Clone)]
pub struct RegisterFile {
    words: [u64; REGISTER_COUNT],
}

impl RegisterFile {
    /// A register file with all registers zeroed.
    pub fn new() -> RegisterFile {
        RegisterFile {
            words: [0; REGISTER_COUNT],
        }
    }

    /// Raw word held in `register`.
    pub fn get(&self, register: Register) -> u64 {
        self.words[register as usize]
    }

    /// Stores a raw word into `register`.
    pub fn set(&mut self, register: Register, word: u64) {
        self.words[register as usize] = word;
    }

    /// The tagged-value view of `register`.
    pub fn get_value(&self, register: Register) -> TaggedValue {
        TaggedValue::from_raw_word(self.get(register))
    }

    /// Stores a tagged value into `register`.
    pub fn set_value(&mut self, register: Register, value: TaggedValue) {
        self.set(register, value.raw_word());
    }
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tagged_values::Smi;

    #[test]
    fn test_register_roundtrip() {
        let mut file = RegisterFile::new();
        file.set(Register::ArgCount, 3);
        assert_eq!(file.get(Register::ArgCount), 3);

        let value = Smi::new(42).unwrap().encode();
        file.set_value(Register::ReturnValue, value);
        assert_eq!(file.get_value(Register::ReturnValue), value);
    }

    #[test]
    fn test_registers_are_independent() {
        let mut file = RegisterFile::new();
        file.set(Register::Callee, 1);
        file.set(Register::Context, 2);
        assert_eq!(file.get(Register::Callee), 1);
        assert_eq!(file.get(Register::Context), 2);
        assert_eq!(file.get(Register::Scratch), 0);
    }
}
