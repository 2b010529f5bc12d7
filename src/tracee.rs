//! Raw trace requests on the single traced process.

use std::fs;
use std::marker::PhantomData;
use std::os::unix::fs::FileExt;

use nix::sys::ptrace;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{self, WaitStatus};
use tracing::trace;

use crate::error::{Error, Result, ResultExt};
use crate::x86::{self, Registers};
use crate::Pid;

/// Restart requests, which resume a stopped tracee.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Restart {
    Step,
    Continue,
    Syscall,
}

/// Handle for issuing ptrace requests to a tracee.
///
/// The kernel only accepts ptrace requests from the thread that became the tracer, so this
/// handle is `!Send` and lives on the control thread for its whole life.
#[derive(Debug)]
pub(crate) struct Tracee {
    pid: Pid,

    #[doc(hidden)]
    _not_send: PhantomData<*const ()>,
}

impl Tracee {
    pub fn new(pid: Pid) -> Self {
        Self { pid, _not_send: PhantomData }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn registers(&self) -> Result<Registers> {
        ptrace::getregs(self.pid).died_if_esrch(self.pid)
    }

    pub fn set_registers(&mut self, regs: Registers) -> Result<()> {
        ptrace::setregs(self.pid, regs).died_if_esrch(self.pid)
    }

    pub fn instruction_pointer(&self) -> Result<u64> {
        Ok(x86::instruction_pointer(&self.registers()?))
    }

    pub fn read_memory(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let mut data = vec![0; len];

        if len == 0 {
            return Ok(data);
        }

        let done = self.memory()?.read_at(&mut data, addr)?;

        if done != len {
            return Err(Error::PartialMemOp { done, expected: len });
        }

        Ok(data)
    }

    /// Write `data` at `addr`. Write-protected pages are written through, as for `/proc/<pid>/mem`.
    pub fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let mem = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.proc_mem_path())?;

        let done = mem.write_at(data, addr)?;

        if done != data.len() {
            return Err(Error::PartialMemOp { done, expected: data.len() });
        }

        Ok(())
    }

    pub fn read_byte(&self, addr: u64) -> Result<u8> {
        let data = self.read_memory(addr, 1)?;
        Ok(data[0])
    }

    pub fn write_byte(&mut self, addr: u64, byte: u8) -> Result<()> {
        self.write_memory(addr, &[byte])
    }

    fn proc_mem_path(&self) -> String {
        format!("/proc/{}/mem", self.pid)
    }

    fn memory(&self) -> Result<fs::File> {
        Ok(fs::File::open(self.proc_mem_path())?)
    }

    /// Resume the stopped tracee, delivering `signal` if given.
    pub fn restart(&mut self, restart: Restart, signal: Option<Signal>) -> Result<()> {
        trace!(pid = self.pid.as_raw(), ?restart, ?signal, "restarting tracee");

        let res = match restart {
            Restart::Step => ptrace::step(self.pid, signal),
            Restart::Continue => ptrace::cont(self.pid, signal),
            Restart::Syscall => ptrace::syscall(self.pid, signal),
        };

        res.died_if_esrch(self.pid)
    }

    /// Block until the tracee changes state.
    ///
    /// Only valid while no waiter thread is armed for this tracee.
    pub fn wait(&self) -> Result<WaitStatus> {
        loop {
            match wait::waitpid(self.pid, None) {
                Err(nix::errno::Errno::EINTR) => continue,
                res => return Ok(res?),
            }
        }
    }

    /// Send `signal` to the tracee process.
    pub fn kill(&self, signal: Signal) -> Result<()> {
        signal::kill(self.pid, signal).died_if_esrch(self.pid)
    }
}
