//! Public handle on a debugging session.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use tracing::{debug, warn};

use crate::breakpoint::{Breakpoint, BreakpointTable};
use crate::cmd::Command as Launch;
use crate::control::{Command, Control, ProcessState, Reply};
use crate::error::{Error, Result};
use crate::event::DebugEvent;
use crate::maps::{self, MemoryMap};
use crate::queue::{Consumer, EventQueue, JoinHandle};
use crate::x86::Registers;
use crate::Pid;

/// A request submitted to the control thread, and its eventual reply.
#[must_use = "use `wait()` to get the result, or `detach()` to ignore it"]
pub struct Pending<R> {
    handle: JoinHandle,
    reply: mpsc::Receiver<Result<R>>,
}

impl<R> Pending<R> {
    /// Block until the control thread has processed the request.
    pub fn wait(self) -> Result<R> {
        self.handle.join();
        self.reply.try_recv().unwrap_or(Err(Error::Disconnected))
    }

    /// Stop waiting for the request. It is still processed.
    pub fn detach(self) {
        self.handle.detach();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// A traced process, with the threads that control it.
///
/// All methods take `&self`, and a session may be shared between threads. Requests are
/// processed one at a time, in submission order, by a dedicated control thread. Events are
/// read through [`events()`](Self::events).
///
/// Dropping the session kills the tracee if it is still alive.
pub struct Session {
    pid: Pid,
    commands: EventQueue<Command>,
    events: EventQueue<DebugEvent>,
    breakpoints: Arc<BreakpointTable>,
    control: Option<thread::JoinHandle<()>>,
}

impl Session {
    /// Spawn `cmd` as a tracee, returning once it is stopped at its first instruction.
    pub fn launch(cmd: Launch) -> Result<Self> {
        let commands = EventQueue::new();
        let events = EventQueue::new();
        let breakpoints = Arc::new(BreakpointTable::new());

        let (ready_tx, ready_rx) = mpsc::channel();

        // The spawning thread becomes the tracer, so the control thread must spawn.
        let control = thread::Builder::new().name("tinydbg-control".into()).spawn({
            let commands = commands.clone();
            let events = events.clone();
            let breakpoints = breakpoints.clone();

            move || {
                let tracee = match cmd.spawn() {
                    Ok(tracee) => tracee,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    },
                };

                let _ = ready_tx.send(Ok(tracee.pid()));

                let consumer = commands.consumer();
                Control::new(tracee, commands, events, breakpoints).serve(consumer);
            }
        })?;

        let pid = match ready_rx.recv() {
            Ok(Ok(pid)) => pid,
            Ok(Err(err)) => {
                let _ = control.join();
                return Err(err);
            },
            Err(_) => {
                let _ = control.join();
                return Err(Error::Disconnected);
            },
        };

        debug!(pid = pid.as_raw(), "session started");

        Ok(Self {
            pid,
            commands,
            events,
            breakpoints,
            control: Some(control),
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Register a consumer of debug events.
    pub fn events(&self) -> Consumer<DebugEvent> {
        self.events.consumer()
    }

    /// Snapshot of the armed breakpoints. Does not interrupt the tracee.
    pub fn breakpoints(&self) -> Vec<Breakpoint> {
        self.breakpoints.snapshot()
    }

    /// Memory mappings of the tracee, as listed in `/proc/<pid>/maps`.
    pub fn memory_maps(&self) -> Result<Vec<MemoryMap>> {
        maps::read_maps(self.pid)
    }

    fn request<R>(&self, command: impl FnOnce(Reply<R>) -> Command) -> Pending<R> {
        let (reply, rx) = Reply::channel();
        let handle = self.commands.enqueue_joinable(command(reply));

        Pending { handle, reply: rx }
    }

    /// Stop the tracee. Emits [`DebugEvent::Stopped`] only if it was running.
    pub fn stop(&self) -> Pending<()> {
        self.request(Command::Stop)
    }

    /// Continue the stopped tracee. Does nothing if it is running.
    pub fn cont(&self) -> Pending<()> {
        self.request(Command::Continue)
    }

    /// Enable or disable syscall-stops, then continue.
    pub fn cont_syscalls(&self, enabled: bool) -> Pending<()> {
        self.request(|reply| Command::SetSyscallTracing { enabled, resume: true, reply })
    }

    /// Enable or disable syscall-stops from the next continue on.
    pub fn set_syscall_tracing(&self, enabled: bool) -> Pending<()> {
        self.request(|reply| Command::SetSyscallTracing { enabled, resume: false, reply })
    }

    /// Execute one instruction. The tracee is left stopped.
    pub fn step(&self) -> Pending<()> {
        self.request(Command::Step)
    }

    pub fn registers(&self) -> Pending<Registers> {
        self.request(Command::GetRegisters)
    }

    pub fn set_registers(&self, regs: Registers) -> Pending<()> {
        self.request(|reply| Command::SetRegisters(Box::new(regs), reply))
    }

    pub fn read_memory(&self, addr: u64, len: usize) -> Pending<Vec<u8>> {
        self.request(|reply| Command::ReadMemory { addr, len, reply })
    }

    pub fn write_memory(&self, addr: u64, data: impl Into<Vec<u8>>) -> Pending<()> {
        let data = data.into();
        self.request(|reply| Command::WriteMemory { addr, data, reply })
    }

    /// Arm a breakpoint at `addr`. A `once` breakpoint is removed after its first hit.
    ///
    /// If one is already armed there, only its `once` flag is updated.
    pub fn set_breakpoint(&self, addr: u64, once: bool) -> Pending<Breakpoint> {
        self.request(|reply| Command::SetBreakpoint { addr, once, reply })
    }

    /// Disarm the breakpoint at `addr`, restoring the original byte.
    pub fn unset_breakpoint(&self, addr: u64) -> Pending<Breakpoint> {
        self.request(|reply| Command::UnsetBreakpoint { addr, reply })
    }

    /// Execution state, as of when the request is processed.
    pub fn state(&self) -> Pending<ProcessState> {
        self.request(Command::State)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.commands.enqueue(Command::Shutdown);

        if let Some(control) = self.control.take() {
            if control.join().is_err() {
                warn!(pid = self.pid.as_raw(), "control thread panicked");
            }
        }
    }
}
