use std::fmt;

use crate::breakpoint::Breakpoint;
use crate::Signal;

/// Asynchronous notification about the tracee, produced by the control thread.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DebugEvent {
    /// The tracee exited normally.
    Exited(i32),

    /// The tracee was terminated by a signal.
    Terminated { signal: Signal, core_dumped: bool },

    /// The tracee stopped on a signal that is not a breakpoint or syscall trap.
    Stopped(Signal),

    /// The tracee stopped at syscall-entry or syscall-exit.
    SyscallStop(u64),

    /// The tracee executed the trap opcode of an armed breakpoint.
    BreakpointHit(Breakpoint),
}

impl DebugEvent {
    /// Returns `true` if no events will follow this one.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DebugEvent::Exited(_) | DebugEvent::Terminated { .. })
    }
}

impl fmt::Display for DebugEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DebugEvent::Exited(code) => write!(f, "exited with code {code}"),
            DebugEvent::Terminated { signal, core_dumped: true } => {
                write!(f, "terminated by {signal} (core dumped)")
            },
            DebugEvent::Terminated { signal, .. } => write!(f, "terminated by {signal}"),
            DebugEvent::Stopped(signal) => write!(f, "stopped by {signal}"),
            DebugEvent::SyscallStop(nr) => write!(f, "syscall-stop, nr = {nr}"),
            DebugEvent::BreakpointHit(bp) => {
                let kind = if bp.once { "one-shot breakpoint" } else { "breakpoint" };
                write!(f, "{kind} hit at {:#x}", bp.address)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let bp = Breakpoint { address: 0x401000, original: 0x55, once: true };

        assert_eq!(DebugEvent::Exited(7).to_string(), "exited with code 7");
        assert_eq!(DebugEvent::Stopped(Signal::SIGSTOP).to_string(), "stopped by SIGSTOP");
        assert_eq!(DebugEvent::SyscallStop(39).to_string(), "syscall-stop, nr = 39");
        assert_eq!(DebugEvent::BreakpointHit(bp).to_string(), "one-shot breakpoint hit at 0x401000");

        let killed = DebugEvent::Terminated { signal: Signal::SIGSEGV, core_dumped: true };
        assert_eq!(killed.to_string(), "terminated by SIGSEGV (core dumped)");
        assert!(killed.is_terminal());
        assert!(!DebugEvent::Stopped(Signal::SIGSTOP).is_terminal());
    }
}
