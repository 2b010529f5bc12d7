use std::io;
use std::path::PathBuf;

use nix::errno::Errno;
use nix::sys::wait::WaitStatus;

use crate::Pid;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Could not spawn tracee `{}`", path.display())]
    Spawn {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Unexpected wait status for new tracee: {0:?}")]
    BadChildWait(WaitStatus),

    #[error("Tracee died while making request, pid = {pid}")]
    TraceeDied {
        pid: Pid,
        source: nix::Error,
    },

    #[error("Tracee = {pid} has exited")]
    Exited { pid: Pid },

    #[error("No breakpoint at {0:#x}")]
    NoBreakpoint(u64),

    #[error("Memory read/write {done} bytes instead of {expected}")]
    PartialMemOp { done: usize, expected: usize },

    #[error("Input/output error")]
    IO(#[from] io::Error),

    #[error("OS error")]
    OS(#[from] nix::Error),

    #[error("Debug session is no longer running")]
    Disconnected,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns `true` if the error means the tracee no longer exists.
    pub fn tracee_died(&self) -> bool {
        matches!(self, Error::TraceeDied { .. } | Error::Exited { .. })
    }
}

pub(crate) trait ResultExt<T> {
    /// Map an `ESRCH` from a ptrace request on `pid` to [`Error::TraceeDied`].
    fn died_if_esrch(self, pid: Pid) -> Result<T>;
}

impl<T> ResultExt<T> for std::result::Result<T, nix::Error> {
    fn died_if_esrch(self, pid: Pid) -> Result<T> {
        self.map_err(|source| match source {
            Errno::ESRCH => Error::TraceeDied { pid, source },
            err => Error::OS(err),
        })
    }
}

macro_rules! internal_error {
    ($msg: expr) => {
        return Err($crate::error::Error::Internal($msg.into()))
    };
}

pub(crate) use internal_error;
