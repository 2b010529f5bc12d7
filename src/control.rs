//! The control thread: sole issuer of ptrace requests for a session.
//!
//! Callers and the waiter thread talk to it only through the command queue, which it
//! drains in FIFO order, so every trace operation on the tracee is totally ordered.
//!
//! Operations that need a stopped tracee (registers, memory, breakpoints, stepping) may
//! be requested while it runs. The control thread then cancels the waiter, stops the
//! tracee with `SIGSTOP`, performs the operation, and restarts it as before, unless the
//! request was to stop or step.

use std::sync::mpsc;
use std::sync::Arc;

use nix::sys::wait::WaitStatus;
use tracing::{debug, info, trace, warn};

use crate::breakpoint::{Breakpoint, BreakpointTable};
use crate::error::{internal_error, Error, Result};
use crate::event::DebugEvent;
use crate::queue::{Consumer, EventQueue};
use crate::tracee::{Restart, Tracee};
use crate::waiter::{Cancelled, Wait, Waiter};
use crate::x86::{self, Registers, SYSCALL_INSN, TRAP_OPCODE};
use crate::Signal;

/// Execution state of the tracee, as tracked by the control thread.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProcessState {
    /// Spawned, but the exec-stop has not been seen yet.
    Starting,

    Stopped,
    Running,

    /// Terminal. The tracee has been reaped.
    Exited,
}

/// Reply slot of a request, filled by the control thread.
#[derive(Debug)]
pub(crate) struct Reply<R>(mpsc::SyncSender<Result<R>>);

impl<R> Reply<R> {
    pub fn channel() -> (Self, mpsc::Receiver<Result<R>>) {
        let (tx, rx) = mpsc::sync_channel(1);
        (Self(tx), rx)
    }

    fn send(self, result: Result<R>) {
        // The requester may have detached.
        let _ = self.0.send(result);
    }
}

/// Message processed by the control thread.
#[derive(Debug)]
pub(crate) enum Command {
    Stop(Reply<()>),
    Continue(Reply<()>),
    SetSyscallTracing {
        enabled: bool,
        resume: bool,
        reply: Reply<()>,
    },
    Step(Reply<()>),
    GetRegisters(Reply<Registers>),
    SetRegisters(Box<Registers>, Reply<()>),
    ReadMemory {
        addr: u64,
        len: usize,
        reply: Reply<Vec<u8>>,
    },
    WriteMemory {
        addr: u64,
        data: Vec<u8>,
        reply: Reply<()>,
    },
    SetBreakpoint {
        addr: u64,
        once: bool,
        reply: Reply<Breakpoint>,
    },
    UnsetBreakpoint {
        addr: u64,
        reply: Reply<Breakpoint>,
    },
    State(Reply<ProcessState>),

    /// The waiter thread reaped a wait status.
    Reaped,

    Shutdown,
}

/// How the tracee came to be stopped for an operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Interruption {
    /// It was already stopped.
    None,

    /// It was stopped by our `SIGSTOP`.
    Signalled,

    /// It stopped on its own before it could be interrupted. That stop has been classified.
    Reaped,
}

/// Outcome of a single-step request.
#[derive(Debug)]
enum Stepped {
    /// The instruction ran and the step trap was reported.
    Done,

    /// The tracee reported another status first.
    Interrupted(WaitStatus),
}

pub(crate) struct Control {
    tracee: Tracee,
    state: ProcessState,

    /// Restart with `PTRACE_SYSCALL` instead of `PTRACE_CONT`.
    syscall_tracing: bool,

    /// Signal to deliver on the next continue.
    pending_signal: Option<Signal>,

    /// A `SIGSTOP` sent for an interruption has not been reported yet.
    pending_sigstop: bool,

    /// Persistent breakpoint at the instruction pointer, disarmed until it is stepped over.
    ///
    /// Set when a signal stopped the tracee before the original instruction could run.
    deferred: Option<Breakpoint>,

    breakpoints: Arc<BreakpointTable>,
    commands: EventQueue<Command>,
    events: EventQueue<DebugEvent>,
    waiter: Option<Waiter>,
}

impl Control {
    /// Create the state machine for a tracee in its exec-stop.
    pub fn new(
        tracee: Tracee,
        commands: EventQueue<Command>,
        events: EventQueue<DebugEvent>,
        breakpoints: Arc<BreakpointTable>,
    ) -> Self {
        let mut control = Self {
            tracee,
            state: ProcessState::Starting,
            syscall_tracing: false,
            pending_signal: None,
            pending_sigstop: false,
            deferred: None,
            breakpoints,
            commands,
            events,
            waiter: None,
        };

        control.set_state(ProcessState::Stopped);
        control
    }

    /// Process commands until shutdown, then close both queues.
    pub fn serve(mut self, consumer: Consumer<Command>) {
        info!(pid = self.tracee.pid().as_raw(), "control thread started");

        while let Some(delivery) = consumer.consume() {
            let (command, ack) = delivery.into_parts();
            let shutdown = matches!(command, Command::Shutdown);

            self.handle(command);
            ack.complete();

            if shutdown {
                break;
            }
        }

        self.commands.close();

        // Dropping unprocessed requests completes them with no reply.
        while let Some(delivery) = consumer.try_consume() {
            trace!(command = ?*delivery, "discarding command after shutdown");
        }

        self.events.close();

        info!(pid = self.tracee.pid().as_raw(), "control thread stopped");
    }

    fn handle(&mut self, command: Command) {
        trace!(?command, state = ?self.state, "handling command");

        match command {
            Command::Reaped => match self.waiter.as_ref().and_then(Waiter::take) {
                Some(wait) => self.on_wait(wait),
                None => trace!("status already taken during an interruption"),
            },
            Command::Shutdown => self.shutdown(),
            Command::State(reply) => reply.send(Ok(self.state)),
            Command::Continue(reply) => reply.send(self.cont()),
            Command::SetSyscallTracing { enabled, resume, reply } => {
                reply.send(self.set_syscall_tracing(enabled, resume));
            },
            Command::Stop(reply) => reply.send(self.stop()),
            Command::Step(reply) => {
                reply.send(self.while_stopped(false, |this| this.step()));
            },
            Command::GetRegisters(reply) => {
                reply.send(self.while_stopped(true, |this| this.tracee.registers()));
            },
            Command::SetRegisters(regs, reply) => {
                reply.send(self.while_stopped(true, |this| this.tracee.set_registers(*regs)));
            },
            Command::ReadMemory { addr, len, reply } => {
                reply.send(self.while_stopped(true, |this| this.tracee.read_memory(addr, len)));
            },
            Command::WriteMemory { addr, data, reply } => {
                reply.send(self.while_stopped(true, |this| this.tracee.write_memory(addr, &data)));
            },
            Command::SetBreakpoint { addr, once, reply } => {
                reply.send(self.while_stopped(true, |this| this.set_breakpoint(addr, once)));
            },
            Command::UnsetBreakpoint { addr, reply } => {
                reply.send(self.while_stopped(true, |this| this.unset_breakpoint(addr)));
            },
        }
    }

    fn set_state(&mut self, state: ProcessState) {
        if self.state != state {
            debug!(pid = self.tracee.pid().as_raw(), from = ?self.state, to = ?state, "state change");
            self.state = state;
        }
    }

    fn emit(&self, event: DebugEvent) {
        debug!(pid = self.tracee.pid().as_raw(), %event, "debug event");
        self.events.enqueue(event);
    }

    fn exited(&self) -> Error {
        Error::Exited { pid: self.tracee.pid() }
    }

    /// Run `op` with the tracee stopped, restoring its execution afterwards.
    ///
    /// If `resume` is false and the tracee had to be stopped, it is left stopped.
    fn while_stopped<R>(
        &mut self,
        resume: bool,
        op: impl FnOnce(&mut Self) -> Result<R>,
    ) -> Result<R> {
        let interruption = self.interrupt()?;
        let res = op(self);

        if resume && interruption == Interruption::Signalled && self.state == ProcessState::Stopped {
            if let Err(err) = self.resume() {
                warn!(error = %err, "could not resume tracee after interruption");
            }
        }

        res
    }

    /// Bring the tracee to a stop, if it is running.
    fn interrupt(&mut self) -> Result<Interruption> {
        match self.state {
            ProcessState::Stopped => Ok(Interruption::None),
            ProcessState::Exited => Err(self.exited()),
            ProcessState::Starting => internal_error!("request before exec-stop"),
            ProcessState::Running => {
                let Some(waiter) = self.waiter.take() else {
                    internal_error!("running tracee without waiter");
                };

                let cancelled = waiter.cancel(|| {
                    if let Err(err) = self.tracee.kill(Signal::SIGSTOP) {
                        warn!(error = %err, "could not interrupt tracee");
                    }
                });

                let (wait, interrupted) = match cancelled {
                    Cancelled::Reaped { wait, interrupted } => (wait, interrupted),
                    Cancelled::Idle => internal_error!("running tracee with idle waiter"),
                };

                if interrupted && matches!(wait, Ok(WaitStatus::Stopped(_, Signal::SIGSTOP))) {
                    // Any earlier unreported `SIGSTOP` was merged into this one.
                    self.pending_sigstop = false;
                    self.set_state(ProcessState::Stopped);
                    return Ok(Interruption::Signalled);
                }

                debug!(?wait, interrupted, "tracee stopped before interruption");
                self.pending_sigstop |= interrupted;
                self.on_wait(wait);

                match self.state {
                    ProcessState::Exited => Err(self.exited()),
                    // A stale interruption was suppressed and the tracee resumed.
                    ProcessState::Running => self.interrupt(),
                    _ => Ok(Interruption::Reaped),
                }
            },
        }
    }

    fn stop(&mut self) -> Result<()> {
        match self.interrupt()? {
            Interruption::Signalled => self.emit(DebugEvent::Stopped(Signal::SIGSTOP)),
            interruption => trace!(?interruption, "stop request needed no signal"),
        }

        Ok(())
    }

    fn set_syscall_tracing(&mut self, enabled: bool, resume: bool) -> Result<()> {
        debug!(enabled, "setting syscall tracing");

        // A running tracee must be restarted for the new mode to apply.
        if self.state == ProcessState::Running && self.syscall_tracing != enabled {
            return self.while_stopped(true, |this| {
                this.syscall_tracing = enabled;
                Ok(())
            });
        }

        self.syscall_tracing = enabled;

        if resume {
            self.cont()
        } else {
            Ok(())
        }
    }

    fn cont(&mut self) -> Result<()> {
        match self.state {
            ProcessState::Stopped => self.resume(),
            ProcessState::Running => Ok(()),
            ProcessState::Exited => Err(self.exited()),
            ProcessState::Starting => internal_error!("request before exec-stop"),
        }
    }

    /// Restart the stopped tracee in the current tracing mode and arm the waiter.
    fn resume(&mut self) -> Result<()> {
        let restart = if self.syscall_tracing { Restart::Syscall } else { Restart::Continue };

        if let Some(bp) = self.deferred.take() {
            if !self.step_over_deferred(bp)? {
                return Ok(());
            }
        }

        if self.waiter.is_none() {
            self.waiter = Some(Waiter::spawn(self.tracee.pid(), self.commands.clone())?);
        }

        self.tracee.restart(restart, self.pending_signal)?;
        self.pending_signal = None;
        self.set_state(ProcessState::Running);

        if let Some(waiter) = &self.waiter {
            waiter.arm();
        }

        Ok(())
    }

    /// Single-step the stopped tracee, delivering `signal`, and wait for the step to finish.
    ///
    /// A status other than the step trap is returned unclassified.
    fn step_raw(&mut self, signal: Option<Signal>) -> Result<Stepped> {
        let mut signal = signal;

        loop {
            self.tracee.restart(Restart::Step, signal.take())?;

            match self.tracee.wait()? {
                WaitStatus::Stopped(_, Signal::SIGTRAP) => return Ok(Stepped::Done),
                WaitStatus::Stopped(_, Signal::SIGSTOP) if self.pending_sigstop => {
                    // Our earlier interruption, reported before the step ran.
                    self.pending_sigstop = false;
                },
                status => return Ok(Stepped::Interrupted(status)),
            }
        }
    }

    fn step(&mut self) -> Result<()> {
        let ip = self.tracee.instruction_pointer()?;

        if let Some(bp) = self.deferred.filter(|bp| bp.address == ip) {
            self.deferred = None;
            return self.step_over(bp, None).map(|_| ());
        }

        // Execute the original instruction, not the trap, if stepping off a breakpoint.
        if let Some(bp) = self.breakpoints.find(ip) {
            self.tracee.write_byte(bp.address, bp.original)?;
            return self.step_over(bp, None).map(|_| ());
        }

        match self.step_raw(None)? {
            Stepped::Done => Ok(()),
            Stepped::Interrupted(status) => {
                self.on_wait(Ok(status));
                Ok(())
            },
        }
    }

    /// Step over the disarmed breakpoint `bp` at the instruction pointer, then re-arm it.
    ///
    /// If the step is cut short by a signal, the breakpoint stays deferred and the stop is
    /// classified. Returns `true` if the step completed.
    fn step_over(&mut self, bp: Breakpoint, signal: Option<Signal>) -> Result<bool> {
        let res = self.step_raw(signal);

        match res {
            Ok(Stepped::Done) => {
                self.arm(bp);
                Ok(true)
            },
            Ok(Stepped::Interrupted(status)) => {
                self.defer(bp);
                self.on_wait(Ok(status));
                Ok(false)
            },
            Err(err) => {
                self.defer(bp);
                Err(err)
            },
        }
    }

    /// Step over a deferred breakpoint before resuming, delivering any pending signal.
    ///
    /// Returns `true` if the tracee may be continued.
    fn step_over_deferred(&mut self, bp: Breakpoint) -> Result<bool> {
        if self.tracee.instruction_pointer()? != bp.address {
            self.arm(bp);
            return Ok(true);
        }

        let signal = self.pending_signal.take();
        self.step_over(bp, signal)
    }

    fn set_breakpoint(&mut self, addr: u64, once: bool) -> Result<Breakpoint> {
        if let Some(existing) = self.breakpoints.find(addr) {
            let bp = Breakpoint { once, ..existing };
            self.breakpoints.insert(bp);

            debug!(addr = format_args!("{addr:#x}"), once, "updated breakpoint");
            return Ok(bp);
        }

        let original = self.tracee.read_byte(addr)?;
        let bp = Breakpoint { address: addr, original, once };

        // The trap is written back when it is stepped over.
        if self.deferred.map_or(false, |deferred| deferred.address == addr) {
            self.deferred = Some(bp);

            debug!(addr = format_args!("{addr:#x}"), once, "updated deferred breakpoint");
            return Ok(bp);
        }

        self.tracee.write_byte(addr, TRAP_OPCODE)?;
        self.breakpoints.insert(bp);

        debug!(addr = format_args!("{addr:#x}"), once, original, "set breakpoint");
        Ok(bp)
    }

    fn unset_breakpoint(&mut self, addr: u64) -> Result<Breakpoint> {
        if let Some(bp) = self.deferred.filter(|bp| bp.address == addr) {
            self.deferred = None;

            debug!(addr = format_args!("{addr:#x}"), "unset deferred breakpoint");
            return Ok(bp);
        }

        let bp = self.breakpoints.find(addr).ok_or(Error::NoBreakpoint(addr))?;

        self.tracee.write_byte(addr, bp.original)?;
        self.breakpoints.remove(addr);

        debug!(addr = format_args!("{addr:#x}"), "unset breakpoint");
        Ok(bp)
    }

    /// Install the trap of a breakpoint and list it, unless the write fails.
    fn arm(&mut self, bp: Breakpoint) {
        if self.state == ProcessState::Exited {
            return;
        }

        match self.tracee.write_byte(bp.address, TRAP_OPCODE) {
            Ok(()) => {
                self.breakpoints.insert(bp);
            },
            Err(err) => {
                warn!(error = %err, addr = format_args!("{:#x}", bp.address), "could not re-arm breakpoint");
                self.breakpoints.remove(bp.address);
            },
        }
    }

    /// Unlist a breakpoint whose original byte is in memory, to re-arm it on the next resume.
    fn defer(&mut self, bp: Breakpoint) {
        self.breakpoints.remove(bp.address);

        if self.state != ProcessState::Exited {
            trace!(addr = format_args!("{:#x}", bp.address), "deferring breakpoint re-arm");
            self.deferred = Some(bp);
        }
    }

    /// Classify a reaped wait status and emit the matching event.
    fn on_wait(&mut self, wait: Wait) {
        let status = match wait {
            Ok(status) => status,
            Err(err) => {
                warn!(error = %err, "wait failed, treating tracee as gone");
                self.finish();
                return;
            },
        };

        if self.state == ProcessState::Running {
            self.set_state(ProcessState::Stopped);
        }

        match status {
            WaitStatus::Exited(_, code) => {
                self.emit(DebugEvent::Exited(code));
                self.finish();
            },
            WaitStatus::Signaled(_, signal, core_dumped) => {
                self.emit(DebugEvent::Terminated { signal, core_dumped });
                self.finish();
            },
            WaitStatus::Stopped(_, Signal::SIGTRAP) => self.on_trap(),
            WaitStatus::Stopped(_, Signal::SIGSTOP) if self.pending_sigstop => {
                trace!("suppressing stale interruption");
                self.pending_sigstop = false;

                if let Err(err) = self.resume() {
                    warn!(error = %err, "could not resume tracee after stale interruption");
                }
            },
            WaitStatus::Stopped(_, signal) => {
                self.pending_signal = Some(signal);
                self.emit(DebugEvent::Stopped(signal));
            },
            status => warn!(?status, "unexpected wait status"),
        }
    }

    fn on_trap(&mut self) {
        let regs = match self.tracee.registers() {
            Ok(regs) => regs,
            Err(err) => {
                warn!(error = %err, "could not read registers at trap");
                return;
            },
        };

        let ip = x86::instruction_pointer(&regs);

        // `int3` leaves the instruction pointer just past the trap opcode.
        if let Some(bp) = self.breakpoints.find(ip.wrapping_sub(1)) {
            self.on_breakpoint(bp, regs);
            return;
        }

        if self.syscall_tracing && self.follows_syscall(ip) {
            self.emit(DebugEvent::SyscallStop(x86::syscall_number(&regs)));
            return;
        }

        self.emit(DebugEvent::Stopped(Signal::SIGTRAP));
    }

    fn follows_syscall(&self, ip: u64) -> bool {
        let Some(addr) = ip.checked_sub(SYSCALL_INSN.len() as u64) else {
            return false;
        };

        match self.tracee.read_memory(addr, SYSCALL_INSN.len()) {
            Ok(bytes) => bytes == SYSCALL_INSN,
            Err(err) => {
                trace!(error = %err, "could not read instruction before trap");
                false
            },
        }
    }

    /// Rewind to the breakpoint address and restore the original instruction, then report
    /// the hit. Persistent breakpoints are stepped over and re-armed first.
    ///
    /// If the step over is cut short, the hit is reported before the status that cut it.
    fn on_breakpoint(&mut self, bp: Breakpoint, mut regs: Registers) {
        let addr = bp.address;
        x86::set_instruction_pointer(&mut regs, addr);

        let restored = self
            .tracee
            .set_registers(regs)
            .and_then(|_| self.tracee.write_byte(addr, bp.original));

        if let Err(err) = restored {
            warn!(error = %err, addr = format_args!("{addr:#x}"), "breakpoint restore failed");
            self.emit(DebugEvent::BreakpointHit(bp));
            return;
        }

        if bp.once {
            self.breakpoints.remove(addr);
            debug!(addr = format_args!("{addr:#x}"), "removed one-shot breakpoint");

            self.emit(DebugEvent::BreakpointHit(bp));
            return;
        }

        match self.step_raw(None) {
            Ok(Stepped::Done) => {
                self.arm(bp);
                self.emit(DebugEvent::BreakpointHit(bp));
            },
            Ok(Stepped::Interrupted(status)) => {
                self.defer(bp);
                self.emit(DebugEvent::BreakpointHit(bp));
                self.on_wait(Ok(status));
            },
            Err(err) => {
                warn!(error = %err, addr = format_args!("{addr:#x}"), "could not step over breakpoint");
                self.defer(bp);
                self.emit(DebugEvent::BreakpointHit(bp));
            },
        }
    }

    /// Enter the terminal state.
    fn finish(&mut self) {
        self.set_state(ProcessState::Exited);

        if let Some(waiter) = self.waiter.take() {
            // It parks after reaping the terminal status, so there is nothing to interrupt.
            waiter.cancel(|| {});
        }

        // The tracee's memory is gone with it.
        self.deferred = None;

        for bp in self.breakpoints.snapshot() {
            self.breakpoints.remove(bp.address);
        }
    }

    /// Kill and reap the tracee, if it is still alive.
    fn shutdown(&mut self) {
        if self.state == ProcessState::Exited {
            return;
        }

        info!(pid = self.tracee.pid().as_raw(), "killing tracee");

        let mut reaped = false;

        if let Some(waiter) = self.waiter.take() {
            let cancelled = waiter.cancel(|| {
                let _ = self.tracee.kill(Signal::SIGKILL);
            });

            reaped = matches!(
                cancelled,
                Cancelled::Reaped {
                    wait: Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..)) | Err(_),
                    ..
                }
            );
        }

        if !reaped {
            if let Err(err) = self.tracee.kill(Signal::SIGKILL) {
                debug!(error = %err, "tracee already gone");
            }

            loop {
                match self.tracee.wait() {
                    Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..)) | Err(_) => break,
                    Ok(status) => trace!(?status, "draining wait status before exit"),
                }
            }
        }

        self.finish();
    }
}
