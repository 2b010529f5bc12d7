//! Background thread that reaps wait statuses of the running tracee.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;

use nix::errno::Errno;
use nix::sys::wait::{self, WaitStatus};
use tracing::{trace, warn};

use crate::control::Command;
use crate::queue::EventQueue;
use crate::Pid;

/// Raw result of one `waitpid(2)` call.
pub(crate) type Wait = nix::Result<WaitStatus>;

/// Whether the waiter may block in `waitpid(2)`.
///
/// `Armed` is only set by the control thread after a restart request has succeeded, so a
/// reaped status always belongs to the latest continuation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Gate {
    Parked,
    Armed,
    Cancelled,
}

struct Inner {
    gate: Gate,

    /// Last reaped status, until the control thread takes it.
    reaped: Option<Wait>,
}

struct Shared {
    inner: Mutex<Inner>,
    changed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Outcome of cancelling a [`Waiter`].
#[derive(Debug)]
pub(crate) enum Cancelled {
    /// Nothing was reaped since the last [`Waiter::take()`].
    Idle,

    /// A status was reaped and not yet taken.
    Reaped {
        wait: Wait,

        /// The waiter was blocked in `waitpid(2)` and `interrupt` was called.
        interrupted: bool,
    },
}

/// Handle to the waiter thread.
///
/// Each reaped status is stored for the control thread, and announced with a
/// [`Command::Reaped`] message. The waiter then parks until re-armed.
pub(crate) struct Waiter {
    shared: Arc<Shared>,
    thread: thread::JoinHandle<()>,
}

impl Waiter {
    pub fn spawn(pid: Pid, commands: EventQueue<Command>) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner { gate: Gate::Parked, reaped: None }),
            changed: Condvar::new(),
        });

        let thread = thread::Builder::new().name("tinydbg-waiter".into()).spawn({
            let shared = shared.clone();
            move || wait_loop(pid, &shared, &commands)
        })?;

        Ok(Self { shared, thread })
    }

    /// Let the waiter reap the next status of the tracee, which was just restarted.
    pub fn arm(&self) {
        self.shared.lock().gate = Gate::Armed;
        self.shared.changed.notify_all();
    }

    /// Take the last reaped status, if any.
    pub fn take(&self) -> Option<Wait> {
        self.shared.lock().reaped.take()
    }

    /// Stop and join the waiter thread.
    ///
    /// If it is blocked in `waitpid(2)`, `interrupt` is called to make the tracee change
    /// state, so the call returns. The reaped status is handed back rather than announced.
    pub fn cancel(self, interrupt: impl FnOnce()) -> Cancelled {
        let Waiter { shared, thread } = self;

        let previous = std::mem::replace(&mut shared.lock().gate, Gate::Cancelled);
        shared.changed.notify_all();

        let interrupted = previous == Gate::Armed;
        if interrupted {
            interrupt();
        }

        if thread.join().is_err() {
            warn!("waiter thread panicked");
        }

        let reaped = shared.lock().reaped.take();

        match reaped {
            Some(wait) => Cancelled::Reaped { wait, interrupted },
            None => Cancelled::Idle,
        }
    }
}

fn wait_loop(pid: Pid, shared: &Shared, commands: &EventQueue<Command>) {
    loop {
        {
            let inner = shared.lock();
            let inner = shared
                .changed
                .wait_while(inner, |inner| inner.gate == Gate::Parked)
                .unwrap_or_else(|poisoned| poisoned.into_inner());

            if inner.gate == Gate::Cancelled {
                return;
            }
        }

        let wait = loop {
            match wait::waitpid(pid, None) {
                Err(Errno::EINTR) => continue,
                wait => break wait,
            }
        };

        trace!(pid = pid.as_raw(), ?wait, "reaped wait status");

        {
            let mut inner = shared.lock();
            inner.reaped = Some(wait);

            if inner.gate == Gate::Cancelled {
                return;
            }

            inner.gate = Gate::Parked;
        }

        commands.enqueue(Command::Reaped);
    }
}
