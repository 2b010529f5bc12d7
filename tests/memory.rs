use std::path::Path;

use anyhow::{Context, Result};
use ntest::timeout;
use pretty_assertions::assert_eq;
use tinydbg::{Error, ProcessState};

mod support;
use support::*;

#[test]
#[timeout(5000)]
fn test_stack_round_trip() -> Result<()> {
    let session = launch_true()?;
    let rsp = session.registers().wait()?.rsp;

    for len in [1, 7, 64, 512] {
        let addr = rsp - 1024;
        let data: Vec<u8> = (0..len).map(|n| (n * 31 + len) as u8).collect();

        session.write_memory(addr, data.clone()).wait()?;
        assert_eq!(session.read_memory(addr, len).wait()?, data);
    }

    Ok(())
}

#[test]
#[timeout(5000)]
fn test_write_read_only_text() -> Result<()> {
    let session = launch_true()?;
    let ip = entry_ip(&session)?;

    let map = session
        .memory_maps()?
        .into_iter()
        .find(|map| map.contains(ip))
        .context("no mapping for entry point")?;

    assert!(map.permissions.execute);
    assert!(!map.permissions.write);

    session.write_memory(ip, code::SPIN).wait()?;
    assert_eq!(session.read_memory(ip, code::SPIN.len()).wait()?, code::SPIN);

    Ok(())
}

#[test]
#[timeout(5000)]
fn test_round_trip_while_running() -> Result<()> {
    let (session, ip) = launch_with_code(code::SPIN)?;
    let rsp = session.registers().wait()?.rsp;
    let addr = rsp - 256;

    session.cont().wait()?;

    session.write_memory(addr, *b"tinydbg").wait()?;
    assert_eq!(session.read_memory(addr, 7).wait()?, b"tinydbg");
    assert_eq!(session.read_memory(ip, 2).wait()?, code::SPIN);

    assert_eq!(session.state().wait()?, ProcessState::Running);

    Ok(())
}

#[test]
#[timeout(5000)]
fn test_empty_ops() -> Result<()> {
    let session = launch_true()?;

    assert!(session.read_memory(0, 0).wait()?.is_empty());
    session.write_memory(0, Vec::<u8>::new()).wait()?;

    Ok(())
}

#[test]
#[timeout(5000)]
fn test_unmapped_address() -> Result<()> {
    let session = launch_true()?;

    let err = session.read_memory(0, 8).wait().unwrap_err();
    assert!(matches!(err, Error::IO(_) | Error::PartialMemOp { .. }), "{err:?}");

    assert!(session.write_memory(0, [0u8; 8]).wait().is_err());

    // Failures are local to the request.
    let ip = entry_ip(&session)?;
    assert_eq!(session.read_memory(ip, 4).wait()?.len(), 4);

    Ok(())
}

#[test]
#[timeout(5000)]
fn test_memory_maps() -> Result<()> {
    let session = launch_true()?;
    let maps = session.memory_maps()?;

    for map in &maps {
        eprintln!("{:#x}-{:#x} {} {:?}", map.start, map.end, map.permissions, map.path);
    }

    assert!(maps.iter().any(|m| m.path.as_deref() == Some(Path::new("[stack]"))));

    let rsp = session.registers().wait()?.rsp;
    assert!(maps.iter().any(|m| m.contains(rsp) && m.permissions.write));

    Ok(())
}
