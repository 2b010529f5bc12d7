use std::ffi::OsString;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};

use nix::sys::personality::{self, Persona};
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use tracing::debug;

use crate::error::{Error, Result};
use crate::tracee::Tracee;
use crate::Pid;

/// Options applied to the child before it executes the target.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LaunchFlags {
    /// Disable address-space layout randomization for the child.
    pub disable_aslr: bool,
}

/// Command to spawn as a traced child process.
#[derive(Clone, Debug)]
pub struct Command {
    /// Path of the executable.
    program: PathBuf,

    /// Full argument vector, including `argv[0]`. Defaults to `[program]`.
    argv: Option<Vec<OsString>>,

    /// Replacement environment. When unset, the tracer's environment is inherited.
    env: Option<Vec<(OsString, OsString)>>,

    flags: LaunchFlags,
}

impl Command {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            argv: None,
            env: None,
            flags: LaunchFlags::default(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Set the full argument vector, including `argv[0]`.
    pub fn argv<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.argv = Some(argv.into_iter().map(Into::into).collect());
        self
    }

    /// Append one argument after those already set.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        let program = self.program.clone();
        self.argv
            .get_or_insert_with(|| vec![program.into_os_string()])
            .push(arg.into());
        self
    }

    /// Add a variable to the child environment, clearing the inherited one.
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.get_or_insert_with(Vec::new).push((key.into(), value.into()));
        self
    }

    /// Replace the child environment with `KEY=VALUE` entries.
    ///
    /// Entries without `=` are taken as a key with an empty value.
    pub fn envp<I, S>(mut self, envp: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let env = envp
            .into_iter()
            .map(|entry| {
                let entry = entry.as_ref();
                let (key, value) = entry.split_once('=').unwrap_or((entry, ""));
                (OsString::from(key), OsString::from(value))
            })
            .collect();

        self.env = Some(env);
        self
    }

    pub fn flags(mut self, flags: LaunchFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn disable_aslr(mut self, disable_aslr: bool) -> Self {
        self.flags.disable_aslr = disable_aslr;
        self
    }

    /// Fork and exec the target as a tracee of the calling thread, and wait for the
    /// exec-stop.
    ///
    /// The calling thread becomes the tracer, and must issue every later ptrace request.
    pub(crate) fn spawn(&self) -> Result<Tracee> {
        let mut cmd = std::process::Command::new(&self.program);

        if let Some((arg0, args)) = self.argv.as_deref().and_then(<[_]>::split_first) {
            cmd.arg0(arg0);
            cmd.args(args);
        }

        if let Some(env) = &self.env {
            cmd.env_clear();
            cmd.envs(env.iter().map(|(k, v)| (k, v)));
        }

        let disable_aslr = self.flags.disable_aslr;

        // Only async-signal-safe calls may run between `fork()` and `exec()`.
        unsafe {
            cmd.pre_exec(move || {
                if disable_aslr {
                    let persona = personality::get().map_err(errno_to_io)?;
                    personality::set(persona | Persona::ADDR_NO_RANDOMIZE).map_err(errno_to_io)?;
                }

                ptrace::traceme().map_err(errno_to_io)
            })
        };

        let child = cmd.spawn().map_err(|source| Error::Spawn {
            path: self.program.clone(),
            source,
        })?;

        let pid = Pid::from_raw(child.id() as i32);
        debug!(pid = pid.as_raw(), program = %self.program.display(), "spawned tracee");

        let tracee = Tracee::new(pid);
        wait_for_exec_stop(&tracee)?;

        Ok(tracee)
    }
}

fn errno_to_io(err: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(err as i32)
}

// A `TRACEME` child reports a `SIGTRAP` once `execve()` has succeeded.
fn wait_for_exec_stop(tracee: &Tracee) -> Result<()> {
    let status = tracee.wait()?;

    if !matches!(status, WaitStatus::Stopped(_, Signal::SIGTRAP)) {
        return Err(Error::BadChildWait(status));
    }

    // Never leave a tracee running if the tracer dies.
    ptrace::setoptions(tracee.pid(), ptrace::Options::PTRACE_O_EXITKILL)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arg_defaults_argv0_to_program() {
        let cmd = Command::new("/bin/echo").arg("hello").arg("world");

        assert_eq!(
            cmd.argv,
            Some(vec!["/bin/echo".into(), "hello".into(), "world".into()])
        );
    }

    #[test]
    fn test_envp_splits_entries() {
        let cmd = Command::new("/bin/true").envp(["A=1", "B=x=y", "EMPTY"]);

        assert_eq!(
            cmd.env,
            Some(vec![
                ("A".into(), "1".into()),
                ("B".into(), "x=y".into()),
                ("EMPTY".into(), "".into()),
            ])
        );
    }

    #[test]
    fn test_flags() {
        let cmd = Command::new("/bin/true").disable_aslr(true);
        assert_eq!(cmd.flags, LaunchFlags { disable_aslr: true });
        assert_eq!(cmd.program(), Path::new("/bin/true"));
    }
}
