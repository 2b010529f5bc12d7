use anyhow::Result;
use structopt::StructOpt;
use tinydbg::{Command, DebugEvent, Session};
use tracing_subscriber::EnvFilter;

#[derive(StructOpt, Debug)]
struct Opt {
    /// Report syscall-entry and syscall-exit stops.
    #[structopt(short, long)]
    syscalls: bool,

    /// Breakpoint address, in hex. May be repeated.
    #[structopt(short, long, parse(try_from_str = parse_address))]
    breakpoint: Vec<u64>,

    /// Remove breakpoints after their first hit.
    #[structopt(long)]
    once: bool,

    #[structopt(long)]
    no_aslr: bool,

    #[structopt(min_values = 1)]
    argv: Vec<String>,
}

fn parse_address(s: &str) -> Result<u64> {
    let s = s.trim_start_matches("0x");
    Ok(u64::from_str_radix(s, 16)?)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let opt = Opt::from_args();

    let cmd = Command::new(&opt.argv[0])
        .argv(&opt.argv)
        .disable_aslr(opt.no_aslr);

    // Tracee is stopped at its first instruction.
    let session = Session::launch(cmd)?;
    let events = session.events();

    for &addr in &opt.breakpoint {
        let bp = session.set_breakpoint(addr, opt.once).wait()?;
        println!("set breakpoint at {:#x}, original byte = {:#04x}", bp.address, bp.original);
    }

    if opt.syscalls {
        session.cont_syscalls(true).wait()?;
    } else {
        session.cont().wait()?;
    }

    while let Some(event) = events.recv() {
        if event.is_terminal() {
            println!("pid = {}: {}", session.pid(), event);
            break;
        }

        let pc = session.registers().wait()?.rip;
        println!("pid = {}, pc = {:x}: {}", session.pid(), pc, event);

        if let DebugEvent::BreakpointHit(bp) = event {
            let code = session.read_memory(bp.address, 8).wait()?;
            println!("  code = {code:02x?}");
        }

        session.cont().wait()?;
    }

    Ok(())
}
