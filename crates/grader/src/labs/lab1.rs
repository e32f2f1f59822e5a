//! Lab 1: printk, console output, software and timer interrupts.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use grader_core::monitor::{call_on_breakpoint, stop_on_line};
use grader_core::suite::test_body;
use grader_core::{
    assert_equal, CallbackResult, ColorMode, Control, Debugger, FutureExt, GraderError, Result,
    RunOptions, Runner, TestSuite,
};
use tracing::debug;

const INTERRUPT_BIT: u64 = 1 << 63;
const SUPERVISOR_SOFTWARE_INTERRUPT: u64 = INTERRUPT_BIT | 1;
const SUPERVISOR_TIMER_INTERRUPT: u64 = INTERRUPT_BIT | 5;

/// Memory-mapped CLINT `mtime` on the QEMU virt board.
const MTIME_ADDR: u64 = 0x200_bff8;
const MIN_TIMER_INTERVAL: u64 = 5_000_000;

pub fn suite(color: ColorMode) -> TestSuite {
    let mut suite = TestSuite::new("lab1", color);

    suite.test(1, "printk", test_body(|runner| printk(runner).boxed()));
    suite.end_part("Lab 1 Task 1");

    suite.test(1, "hello output", test_body(|runner| hello_output(runner).boxed()));
    suite.end_part("Lab 1 Task 2");

    suite.test(1, "software scause", test_body(|runner| software_scause(runner).boxed()));
    suite.end_part("Lab 1 Task 3");

    suite.test(1, "timer interrupt", test_body(|runner| timer_interrupt(runner).boxed()));
    suite.end_part("Lab 1 Task 4");

    suite
}

async fn printk(runner: &Runner) -> Result<()> {
    let reached = call_on_breakpoint("printk", 1, |_gdb: &mut Debugger| {
        async { Ok::<_, GraderError>(Control::Continue) }.boxed()
    });
    runner
        .run(RunOptions::debugger(Duration::from_secs(5)), vec![reached])
        .await?;
    Ok(())
}

async fn hello_output(runner: &Runner) -> Result<()> {
    runner
        .run(
            RunOptions::console(Duration::from_secs(5)),
            vec![stop_on_line(r"Hello, ZJU OS 2025!")?],
        )
        .await?;
    Ok(())
}

async fn software_scause(runner: &Runner) -> Result<()> {
    const TIMES: u32 = 5;
    let failures = Arc::new(AtomicU32::new(0));

    let check = call_on_breakpoint("trap_handler", TIMES, move |gdb: &mut Debugger| {
        let failures = Arc::clone(&failures);
        async move {
            let verdict = expect_scause(
                gdb,
                SUPERVISOR_SOFTWARE_INTERRUPT,
                "scause should indicate software interrupt!",
            )
            .await
            .map(|()| Control::Stop);
            tolerate(verdict, &failures, TIMES - 1)
        }
        .boxed()
    });

    runner
        .run(RunOptions::debugger(Duration::from_secs(15)), vec![check])
        .await?;
    Ok(())
}

async fn timer_interrupt(runner: &Runner) -> Result<()> {
    const TIMES: u32 = 6;
    let failures = Arc::new(AtomicU32::new(0));
    let first_mtime = Arc::new(Mutex::new(None::<u64>));

    let check = call_on_breakpoint("trap_handler", TIMES, move |gdb: &mut Debugger| {
        let failures = Arc::clone(&failures);
        let first_mtime = Arc::clone(&first_mtime);
        async move {
            let verdict = check_timer_interval(gdb, &first_mtime).await;
            tolerate(verdict, &failures, TIMES - 2)
        }
        .boxed()
    });

    runner
        .run(RunOptions::debugger(Duration::from_secs(15)), vec![check])
        .await?;
    Ok(())
}

async fn expect_scause(gdb: &mut Debugger, expected: u64, message: &str) -> Result<()> {
    let scause = gdb
        .read_register("scause")
        .await?
        .ok_or_else(|| GraderError::assertion("could not read scause"))?;
    assert_equal(scause, expected, message)?;
    Ok(())
}

/// The first timer interrupt records `mtime`; a later one passes when enough time
/// went by since then.
async fn check_timer_interval(
    gdb: &mut Debugger,
    first_mtime: &Mutex<Option<u64>>,
) -> CallbackResult {
    expect_scause(
        gdb,
        SUPERVISOR_TIMER_INTERRUPT,
        "scause should indicate timer interrupt!",
    )
    .await?;

    let bytes = gdb
        .read_memory(MTIME_ADDR, 8)
        .await?
        .ok_or_else(|| GraderError::assertion("could not read mtime"))?;
    let raw: [u8; 8] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| GraderError::assertion(format!("mtime read returned {} bytes", bytes.len())))?;
    let mtime = u64::from_le_bytes(raw);

    let previous = *first_mtime
        .lock()
        .map_err(|_| GraderError::assertion("mtime state poisoned"))?;
    match previous {
        Some(previous) => {
            if mtime.saturating_sub(previous) <= MIN_TIMER_INTERVAL {
                return Err(GraderError::assertion(
                    "`stimecmp` not set correctly, timer interrupt too frequent!",
                ));
            }
            Ok(Control::Stop)
        }
        None => {
            if let Ok(mut slot) = first_mtime.lock() {
                *slot = Some(mtime);
            }
            Ok(Control::Continue)
        }
    }
}

/// Turns the first `allowed` assertion failures into `Continue`, since the first
/// traps after boot may not be the interrupt under test.
fn tolerate(verdict: CallbackResult, failures: &AtomicU32, allowed: u32) -> CallbackResult {
    match verdict {
        Err(GraderError::Assertion(failure)) if failures.load(Ordering::SeqCst) < allowed => {
            let seen = failures.fetch_add(1, Ordering::SeqCst) + 1;
            debug!(seen, "ignoring early trap: {failure}");
            Ok(Control::Continue)
        }
        other => other,
    }
}
