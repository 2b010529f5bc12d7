#![allow(unused)]

use std::time::Duration;

use anyhow::{bail, Result};
use tinydbg::{Command, Consumer, DebugEvent, Session};

/// How long to wait for any single event before failing the test.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Machine code snippets, written at the initial instruction pointer of `/bin/true`.
pub mod code {
    /// Visit a `nop` at offset 5 twice, then `exit_group(3)`.
    pub const NOP_LOOP: &[u8] = &[
        0xb9, 0x02, 0x00, 0x00, 0x00, // mov ecx, 2
        0x90,                         // nop
        0xff, 0xc9,                   // dec ecx
        0x75, 0xfb,                   // jnz -5
        0xb8, 0xe7, 0x00, 0x00, 0x00, // mov eax, 231
        0xbf, 0x03, 0x00, 0x00, 0x00, // mov edi, 3
        0x0f, 0x05,                   // syscall
    ];

    /// Offset of the `nop` in [`NOP_LOOP`].
    pub const NOP_LOOP_SITE: u64 = 5;

    pub const NOP_LOOP_EXIT_CODE: i32 = 3;

    /// `getpid()`, then `exit_group(0)`.
    pub const GETPID: &[u8] = &[
        0xb8, 0x27, 0x00, 0x00, 0x00, // mov eax, 39
        0x0f, 0x05,                   // syscall
        0xb8, 0xe7, 0x00, 0x00, 0x00, // mov eax, 231
        0x31, 0xff,                   // xor edi, edi
        0x0f, 0x05,                   // syscall
    ];

    /// Count down from 2^30, then `exit_group(5)`.
    pub const BUSY_LOOP: &[u8] = &[
        0xb9, 0x00, 0x00, 0x00, 0x40, // mov ecx, 0x40000000
        0xff, 0xc9,                   // dec ecx
        0x75, 0xfc,                   // jnz -4
        0xb8, 0xe7, 0x00, 0x00, 0x00, // mov eax, 231
        0xbf, 0x05, 0x00, 0x00, 0x00, // mov edi, 5
        0x0f, 0x05,                   // syscall
    ];

    pub const BUSY_LOOP_EXIT_CODE: i32 = 5;

    /// Spin forever.
    pub const SPIN: &[u8] = &[
        0xeb, 0xfe, // jmp -2
    ];

    pub const UD2: &[u8] = &[
        0x0f, 0x0b, // ud2
    ];
}

pub fn launch_true() -> Result<Session> {
    Ok(Session::launch(Command::new("/bin/true"))?)
}

/// Current instruction pointer of the stopped tracee.
pub fn entry_ip(session: &Session) -> Result<u64> {
    Ok(session.registers().wait()?.rip)
}

/// Launch `/bin/true` and overwrite the code at its entry with `code`.
///
/// Returns the session, still stopped at the exec-stop, and the address of the code.
pub fn launch_with_code(code: &[u8]) -> Result<(Session, u64)> {
    let session = launch_true()?;
    let ip = entry_ip(&session)?;

    session.write_memory(ip, code).wait()?;

    Ok((session, ip))
}

pub fn next_event(events: &Consumer<DebugEvent>) -> Result<DebugEvent> {
    match events.consume_timeout(EVENT_TIMEOUT) {
        Some(delivery) => {
            let event = delivery.into_inner();
            eprintln!("event: {event}");
            Ok(event)
        },
        None => bail!("no event within {EVENT_TIMEOUT:?}"),
    }
}

/// Assert that no event arrives for a little while.
pub fn assert_no_event(events: &Consumer<DebugEvent>) {
    let event = events.consume_timeout(Duration::from_millis(200)).map(|d| d.into_inner());
    assert_eq!(event, None);
}

/// Continue the tracee after every event, returning all events up to the terminal one.
pub fn run_to_end(session: &Session, events: &Consumer<DebugEvent>) -> Result<Vec<DebugEvent>> {
    let mut trace = vec![];

    session.cont().wait()?;

    loop {
        let event = next_event(events)?;
        trace.push(event);

        if event.is_terminal() {
            return Ok(trace);
        }

        session.cont().wait()?;
    }
}
