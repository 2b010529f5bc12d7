//! A small threaded debugging engine for a single Linux process, built on `ptrace(2)`.
//!
//! [`Session::launch()`] spawns a tracee stopped at its first instruction. Requests on the
//! session (stop, continue, step, registers, memory, breakpoints) are queued to a control
//! thread which owns the tracee, while a waiter thread reports its state changes. Stops
//! and exits are published as [`DebugEvent`]s.
//!
//! ```no_run
//! use tinydbg::{Command, DebugEvent, Session};
//!
//! # fn main() -> tinydbg::Result<()> {
//! let session = Session::launch(Command::new("/bin/true"))?;
//! let events = session.events();
//!
//! session.cont().wait()?;
//!
//! while let Some(event) = events.recv() {
//!     println!("{event}");
//!
//!     if event.is_terminal() {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
compile_error!("tinydbg only supports x86_64 Linux");

pub mod breakpoint;
pub mod cmd;
pub mod error;
pub mod event;
pub mod maps;
pub mod queue;
pub mod session;
pub mod x86;

mod control;
mod tracee;
mod waiter;

pub use breakpoint::{Breakpoint, BreakpointTable};
pub use cmd::{Command, LaunchFlags};
pub use control::ProcessState;
pub use error::{Error, Result};
pub use event::DebugEvent;
pub use maps::{MemoryMap, ParseMapError, Permissions};
pub use queue::{Ack, Consumer, Delivery, EventQueue, JoinHandle};
pub use session::{Pending, Session};
pub use x86::Registers;

pub use nix::sys::signal::Signal;
pub use nix::unistd::Pid;
