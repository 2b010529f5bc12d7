use anyhow::Result;
use ntest::timeout;
use pretty_assertions::assert_eq;
use nix::sys::signal;
use tinydbg::{Breakpoint, DebugEvent, Error, ProcessState, Signal};

mod support;
use support::*;

const TRAP: u8 = tinydbg::x86::TRAP_OPCODE;

#[test]
#[timeout(5000)]
fn test_entry_breakpoint() -> Result<()> {
    let session = launch_true()?;
    let events = session.events();
    let ip = entry_ip(&session)?;

    let bp = session.set_breakpoint(ip, false).wait()?;
    assert_eq!(bp.address, ip);
    assert!(!bp.once);

    let trace = run_to_end(&session, &events)?;

    assert_eq!(trace, [DebugEvent::BreakpointHit(bp), DebugEvent::Exited(0)]);

    Ok(())
}

#[test]
#[timeout(5000)]
fn test_hit_rewinds_to_breakpoint() -> Result<()> {
    let (session, ip) = launch_with_code(code::NOP_LOOP)?;
    let events = session.events();
    let site = ip + code::NOP_LOOP_SITE;

    let bp = session.set_breakpoint(site, true).wait()?;
    session.cont().wait()?;

    assert_eq!(next_event(&events)?, DebugEvent::BreakpointHit(bp));
    assert_eq!(session.state().wait()?, ProcessState::Stopped);

    // Stopped at the breakpoint, with the original instruction back in place.
    assert_eq!(entry_ip(&session)?, site);
    assert_eq!(session.read_memory(site, 1).wait()?, [0x90]);

    Ok(())
}

#[test]
#[timeout(5000)]
fn test_persistent_breakpoint_hit_twice() -> Result<()> {
    let (session, ip) = launch_with_code(code::NOP_LOOP)?;
    let events = session.events();
    let site = ip + code::NOP_LOOP_SITE;

    let bp = session.set_breakpoint(site, false).wait()?;
    assert_eq!(bp.original, 0x90);

    session.cont().wait()?;
    assert_eq!(next_event(&events)?, DebugEvent::BreakpointHit(bp));

    // Re-armed after stepping over the original instruction.
    assert_eq!(session.breakpoints(), [bp]);
    assert_eq!(session.read_memory(site, 1).wait()?, [TRAP]);
    assert_eq!(entry_ip(&session)?, site + 1);

    session.cont().wait()?;
    assert_eq!(next_event(&events)?, DebugEvent::BreakpointHit(bp));
    assert_eq!(session.breakpoints(), [bp]);

    session.cont().wait()?;
    assert_eq!(next_event(&events)?, DebugEvent::Exited(code::NOP_LOOP_EXIT_CODE));

    Ok(())
}

#[test]
#[timeout(5000)]
fn test_once_breakpoint_hit_once() -> Result<()> {
    let (session, ip) = launch_with_code(code::NOP_LOOP)?;
    let events = session.events();
    let site = ip + code::NOP_LOOP_SITE;

    let bp = session.set_breakpoint(site, true).wait()?;

    session.cont().wait()?;
    assert_eq!(next_event(&events)?, DebugEvent::BreakpointHit(bp));

    assert!(session.breakpoints().is_empty());
    assert_eq!(session.read_memory(site, 1).wait()?, [0x90]);

    session.cont().wait()?;
    assert_eq!(next_event(&events)?, DebugEvent::Exited(code::NOP_LOOP_EXIT_CODE));

    Ok(())
}

#[test]
#[timeout(5000)]
fn test_set_and_unset_track_memory() -> Result<()> {
    let session = launch_true()?;
    let ip = entry_ip(&session)?;

    let original = session.read_memory(ip, 16).wait()?;
    let addrs = [ip, ip + 3, ip + 9];

    for (n, &addr) in addrs.iter().enumerate() {
        let bp = session.set_breakpoint(addr, n % 2 == 0).wait()?;
        assert_eq!(bp.original, original[(addr - ip) as usize]);
    }

    let mut expected: Vec<Breakpoint> = addrs
        .iter()
        .enumerate()
        .map(|(n, &address)| Breakpoint {
            address,
            original: original[(address - ip) as usize],
            once: n % 2 == 0,
        })
        .collect();

    assert_eq!(session.breakpoints(), expected);

    for &addr in &addrs {
        assert_eq!(session.read_memory(addr, 1).wait()?, [TRAP]);
    }

    let removed = session.unset_breakpoint(ip + 3).wait()?;
    assert_eq!(removed, expected.remove(1));
    assert_eq!(session.breakpoints(), expected);
    assert_eq!(session.read_memory(ip + 3, 1).wait()?, [original[3]]);

    for bp in expected {
        session.unset_breakpoint(bp.address).wait()?;
    }

    assert!(session.breakpoints().is_empty());
    assert_eq!(session.read_memory(ip, 16).wait()?, original);

    Ok(())
}

#[test]
#[timeout(5000)]
fn test_set_twice_keeps_original() -> Result<()> {
    let session = launch_true()?;
    let ip = entry_ip(&session)?;
    let original = session.read_memory(ip, 1).wait()?[0];

    let first = session.set_breakpoint(ip, false).wait()?;
    let second = session.set_breakpoint(ip, true).wait()?;

    assert_eq!(first.original, original);
    assert_eq!(second, Breakpoint { address: ip, original, once: true });
    assert_eq!(session.breakpoints(), [second]);

    session.unset_breakpoint(ip).wait()?;
    assert_eq!(session.read_memory(ip, 1).wait()?, [original]);

    Ok(())
}

#[test]
#[timeout(5000)]
fn test_unset_missing_breakpoint() -> Result<()> {
    let session = launch_true()?;
    let ip = entry_ip(&session)?;

    let res = session.unset_breakpoint(ip).wait();
    assert!(matches!(res, Err(Error::NoBreakpoint(addr)) if addr == ip));

    Ok(())
}

#[test]
#[timeout(5000)]
fn test_set_breakpoint_bad_address() -> Result<()> {
    let session = launch_true()?;

    assert!(session.set_breakpoint(0, false).wait().is_err());
    assert!(session.breakpoints().is_empty());

    // The session survives the failed request.
    assert_eq!(session.state().wait()?, ProcessState::Stopped);

    Ok(())
}

#[test]
#[timeout(5000)]
fn test_set_breakpoint_while_running() -> Result<()> {
    let (session, ip) = launch_with_code(code::SPIN)?;
    let events = session.events();

    session.cont().wait()?;

    // The spin loop traps as soon as it is resumed.
    let bp = session.set_breakpoint(ip, true).wait()?;

    assert_eq!(next_event(&events)?, DebugEvent::BreakpointHit(bp));
    assert_eq!(session.state().wait()?, ProcessState::Stopped);
    assert!(session.breakpoints().is_empty());
    assert_eq!(entry_ip(&session)?, ip);

    Ok(())
}

#[test]
#[timeout(5000)]
fn test_step_over_breakpoint() -> Result<()> {
    let (session, ip) = launch_with_code(code::NOP_LOOP)?;
    let events = session.events();
    let site = ip + code::NOP_LOOP_SITE;

    let bp = session.set_breakpoint(site, false).wait()?;

    session.step().wait()?;
    assert_eq!(entry_ip(&session)?, site);

    // Executes the `nop` instead of trapping, and stays armed.
    session.step().wait()?;
    assert_eq!(entry_ip(&session)?, site + 1);
    assert_eq!(session.breakpoints(), [bp]);
    assert_eq!(session.read_memory(site, 1).wait()?, [TRAP]);

    assert_no_event(&events);

    Ok(())
}

#[test]
#[timeout(5000)]
fn test_signal_during_step_over_defers_rearm() -> Result<()> {
    let (session, ip) = launch_with_code(code::NOP_LOOP)?;
    let events = session.events();
    let site = ip + code::NOP_LOOP_SITE;

    let bp = session.set_breakpoint(site, false).wait()?;

    session.step().wait()?;
    assert_eq!(entry_ip(&session)?, site);

    // Reported before the `nop` runs, so the step over does not finish.
    signal::kill(session.pid(), Signal::SIGWINCH)?;
    session.step().wait()?;

    assert_eq!(next_event(&events)?, DebugEvent::Stopped(Signal::SIGWINCH));
    assert_eq!(entry_ip(&session)?, site);
    assert_eq!(session.read_memory(site, 1).wait()?, [0x90]);
    assert!(session.breakpoints().is_empty());

    // The `nop` runs before the trap is back, so only the second visit hits.
    let trace = run_to_end(&session, &events)?;
    assert_eq!(trace, [DebugEvent::BreakpointHit(bp), DebugEvent::Exited(code::NOP_LOOP_EXIT_CODE)]);
    assert!(session.breakpoints().is_empty());

    Ok(())
}
