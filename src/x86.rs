//! `x86_64` instruction encodings and register accessors used by the engine.

/// Register state of a tracee.
pub type Registers = libc::user_regs_struct;

/// `int3`, which raises `SIGTRAP` and leaves the instruction pointer one byte past it.
pub const TRAP_OPCODE: u8 = 0xcc;

/// `syscall`.
pub const SYSCALL_INSN: [u8; 2] = [0x0f, 0x05];

pub fn instruction_pointer(regs: &Registers) -> u64 {
    regs.rip
}

pub fn set_instruction_pointer(regs: &mut Registers, addr: u64) {
    regs.rip = addr;
}

/// Syscall number of the current syscall-stop.
///
/// `rax` holds the return value at syscall-exit, so the kernel-saved `orig_rax` is used.
pub fn syscall_number(regs: &Registers) -> u64 {
    regs.orig_rax
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zeroed() -> Registers {
        // Plain integer fields, so all-zero is a valid value.
        unsafe { std::mem::zeroed() }
    }

    #[test]
    fn test_instruction_pointer() {
        let mut regs = zeroed();
        set_instruction_pointer(&mut regs, 0x401000);

        assert_eq!(instruction_pointer(&regs), 0x401000);
        assert_eq!(regs.rip, 0x401000);
    }

    #[test]
    fn test_syscall_number_ignores_rax() {
        let mut regs = zeroed();
        regs.orig_rax = 39;
        regs.rax = (-38i64) as u64;

        assert_eq!(syscall_number(&regs), 39);
    }
}
