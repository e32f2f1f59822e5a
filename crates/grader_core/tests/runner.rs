mod common;

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{stop_at, Lab, PRINTK, TRAP_HANDLER};
use grader_core::breakpoints::breakpoint_callback;
use grader_core::monitor::{
    call_on_breakpoint, expect_output, monitor, on_breakpoint, save, stop_on_line,
};
use grader_core::{
    assert_equal, CallbackResult, Control, Debugger, FutureExt, GraderError, Hits,
    OutputMatcher, Phase, RunMode, RunOptions, RunSession, Runner,
};

const SOFTWARE_INTERRUPT: u64 = (1 << 63) | 1;
const TIMER_INTERRUPT: &str = "0x8000000000000005";

fn debugger_run(timeout: Duration) -> RunOptions {
    RunOptions {
        mode: RunMode::Debugger,
        run_target: None,
        make_args: Vec::new(),
        timeout,
    }
}

fn console_run(timeout: Duration) -> RunOptions {
    RunOptions {
        mode: RunMode::Console,
        ..debugger_run(timeout)
    }
}

async fn check_software_interrupt(gdb: &mut Debugger, failures: &AtomicU32) -> CallbackResult {
    let scause = gdb.read_register("scause").await?.unwrap_or_default();
    match assert_equal(scause, SOFTWARE_INTERRUPT, "scause should indicate software interrupt!") {
        Ok(()) => Ok(Control::Stop),
        Err(_) if failures.fetch_add(1, Ordering::SeqCst) < 4 => Ok(Control::Continue),
        Err(failure) => Err(failure.into()),
    }
}

fn scause_check(failures: Arc<AtomicU32>) -> grader_core::monitor::Monitor {
    call_on_breakpoint("trap_handler", 5, move |gdb: &mut Debugger| {
        let failures = Arc::clone(&failures);
        async move { check_software_interrupt(gdb, &failures).await }.boxed()
    })
}

async fn explode(_gdb: &mut Debugger) -> CallbackResult {
    panic!("callback exploded")
}

#[tokio::test]
async fn silent_target_times_out() {
    let lab = Lab::new("scenario-a");
    let runner = Runner::new(lab.config(&lab.target("ready\\n"), &[]));

    let err = runner
        .run(debugger_run(Duration::from_secs(1)), vec![on_breakpoint("printk", 1)])
        .await
        .expect_err("nothing ever hits printk");

    assert!(err.is_timeout(), "unexpected error: {err}");
    assert!(err.to_string().starts_with("No termination after timeout!"));
    assert!(lab.events().contains(&format!("-break-insert *{PRINTK:#x}")));
}

#[tokio::test]
async fn breakpoint_budget_ends_debugger_run() {
    let lab = Lab::new("printk");
    let runner = Runner::new(lab.config(&lab.target("ready\\n"), &[&stop_at(PRINTK)]));
    let hits = Arc::new(AtomicU32::new(0));
    let counted = Arc::clone(&hits);

    let report = runner
        .run(
            debugger_run(Duration::from_secs(5)),
            vec![call_on_breakpoint("printk", 2, move |_gdb: &mut Debugger| {
                counted.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, GraderError>(Control::Continue) }.boxed()
            })],
        )
        .await
        .expect("two hits exhaust the budget");

    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert!(report.output.starts_with("ready"));
    assert!(report.teardown_warnings.is_empty());
    assert!(lab.events().contains(&"-break-delete 1".to_string()));
}

#[tokio::test]
async fn scause_passes_once_any_hit_matches() {
    let lab = Lab::new("scenario-b-pass");
    let scause = format!("--scause={TIMER_INTERRUPT},{TIMER_INTERRUPT},0x8000000000000001");
    let config = lab.config(&lab.target("ready\\n"), &[&stop_at(TRAP_HANDLER), &scause]);
    let runner = Runner::new(config);
    let failures = Arc::new(AtomicU32::new(0));

    runner
        .run(debugger_run(Duration::from_secs(10)), vec![scause_check(Arc::clone(&failures))])
        .await
        .expect("third hit reports a software interrupt");

    assert_eq!(failures.load(Ordering::SeqCst), 2);
    let reads = lab
        .events()
        .iter()
        .filter(|e| e.starts_with("-data-list-register-values"))
        .count();
    assert_eq!(reads, 3);
    assert_eq!(
        lab.events()
            .iter()
            .filter(|e| e.as_str() == "-data-list-register-names")
            .count(),
        1
    );
}

#[tokio::test]
async fn scause_fails_when_every_hit_is_wrong() {
    let lab = Lab::new("scenario-b-fail");
    let scause = format!("--scause={TIMER_INTERRUPT}");
    let config = lab.config(&lab.target("ready\\n"), &[&stop_at(TRAP_HANDLER), &scause]);
    let runner = Runner::new(config);

    let err = runner
        .run(
            debugger_run(Duration::from_secs(10)),
            vec![scause_check(Arc::new(AtomicU32::new(0)))],
        )
        .await
        .expect_err("all five hits are timer interrupts");

    assert!(matches!(err, GraderError::Assertion(_)), "unexpected error: {err}");
    let message = err.to_string();
    assert!(message.starts_with("scause should indicate software interrupt!"));
    assert!(message.contains(&format!("got:\n  {}", 0x8000_0000_0000_0005_u64)));
    assert!(lab.events().contains(&"-break-delete 1".to_string()));
    assert!(lab.position("-break-delete 1") < lab.position("-gdb-exit"));
    assert!(lab.position("-gdb-exit") < lab.position("target-term"));
}

#[tokio::test]
async fn unknown_symbol_fails_before_any_breakpoint() {
    let lab = Lab::new("scenario-c");
    let runner = Runner::new(lab.config(&lab.target("ready\\n"), &[]));

    let err = runner
        .run(debugger_run(Duration::from_secs(5)), vec![on_breakpoint("nonexistent_fn", 1)])
        .await
        .expect_err("symbol is missing");

    assert!(matches!(&err, GraderError::SymbolNotFound(name) if name == "nonexistent_fn"));
    assert!(err.is_setup());
    assert!(!err.is_fatal());
    let events = lab.events();
    assert!(!events.iter().any(|e| e.starts_with("-break-insert")));
    assert!(events.contains(&"-gdb-exit".to_string()));
}

#[tokio::test]
async fn forbidden_line_fails_even_when_required_line_appears() {
    let lab = Lab::new("scenario-d");
    let script = format!(
        "trap 'echo target-term >> \"{}\"; exit 0' TERM; printf 'booting\\n'; sleep 0.3; \
         printf 'panic: oops\\nHello, ZJU OS 2025!\\n'; sleep 30",
        lab.log.display()
    );
    let runner = Runner::new(lab.config(&script, &[]));
    let hello = OutputMatcher::new()
        .require_all(["^Hello, ZJU OS 2025!$"])
        .expect("valid pattern")
        .stop_when_satisfied();
    let no_panic = OutputMatcher::new().forbid_any(["panic"]).expect("valid pattern");

    let err = runner
        .run(
            console_run(Duration::from_secs(5)),
            vec![expect_output(hello), expect_output(no_panic)],
        )
        .await
        .expect_err("panic line is forbidden");

    assert_eq!(
        err.to_string(),
        "     booting\nBAD  panic: oops\n     Hello, ZJU OS 2025!\nunexpected lines in output"
    );
    assert!(lab.position("target-term").is_some());
}

#[tokio::test]
async fn console_run_stops_on_line() {
    let lab = Lab::new("hello");
    let script = format!(
        "trap 'echo target-term >> \"{}\"; exit 0' TERM; printf 'OpenSBI\\n'; sleep 0.5; \
         printf 'Hello, ZJU OS 2025!\\n'; sleep 30",
        lab.log.display()
    );
    let runner = Runner::new(lab.config(&script, &[]));

    let report = runner
        .run(
            console_run(Duration::from_secs(5)),
            vec![stop_on_line("Hello, ZJU OS 2025!").expect("valid pattern")],
        )
        .await
        .expect("hello line ends the run");

    assert!(report.output.contains("Hello, ZJU OS 2025!"));
    report.match_lines(&["^OpenSBI"], &["panic"]).expect("clean output");
    assert!(report.elapsed < Duration::from_secs(5));
}

#[tokio::test]
async fn occupied_stub_port_is_fatal() {
    let lab = Lab::new("port-in-use");
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let mut config = lab.config(&lab.target("ready\\n"), &[]);
    config.gdb_port = listener.local_addr().expect("addr").port();
    let runner = Runner::new(config);

    let err = runner
        .run(debugger_run(Duration::from_secs(5)), vec![on_breakpoint("printk", 1)])
        .await
        .expect_err("port is taken");

    assert!(matches!(err, GraderError::PortInUse { .. }));
    assert!(err.is_fatal());
    assert!(lab.events().is_empty());
}

#[tokio::test]
async fn refused_connection_reports_target_output() {
    let lab = Lab::new("attach-refused");
    let runner = Runner::new(lab.config(&lab.target("ready\\n"), &["--connect=fail"]));

    let err = runner
        .run(debugger_run(Duration::from_secs(5)), vec![on_breakpoint("printk", 1)])
        .await
        .expect_err("stub refuses");

    match &err {
        GraderError::Attach { output, .. } => assert!(output.contains("ready")),
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.is_fatal());
    assert!(lab.position("-gdb-exit") < lab.position("target-term"));
}

#[tokio::test]
async fn panicking_callback_still_tears_down() {
    let lab = Lab::new("panic");
    let runner = Runner::new(lab.config(&lab.target("ready\\n"), &[&stop_at(PRINTK)]));

    let outcome = AssertUnwindSafe(runner.run(
        debugger_run(Duration::from_secs(5)),
        vec![call_on_breakpoint("printk", 1, |gdb: &mut Debugger| explode(gdb).boxed())],
    ))
    .catch_unwind()
    .await;

    assert!(outcome.is_err());
    let debugger_closed = lab.position("-gdb-exit").expect("debugger closed");
    let target_closed = lab.position("target-term").expect("target terminated");
    assert!(debugger_closed < target_closed);
}

#[tokio::test]
async fn teardown_is_idempotent() {
    let lab = Lab::new("idempotent");
    let config = lab.config(&lab.target("ready\\n"), &[]);
    let runner = Runner::new(config.clone());
    let symbols = runner.symbols().await.expect("symbols");
    let mut session = RunSession::new(Arc::new(config.clone()));
    session.set_symbols(symbols);

    session
        .launch_target(config.target_command(None, &[]))
        .await
        .expect("launch");
    session.wait_for_console().await.expect("boot");
    session.attach().await.expect("attach");
    assert_eq!(session.phase(), Phase::Attaching);

    assert!(session.teardown().await.is_empty());
    assert_eq!(session.phase(), Phase::TornDown);
    assert!(session.teardown().await.is_empty());

    let drain = Duration::from_secs(1);
    session.debugger_mut().expect("debugger").close(drain).await.expect("second close");
    session.target_mut().expect("target").terminate(drain).await.expect("second terminate");
    assert_eq!(
        lab.events().iter().filter(|e| e.as_str() == "target-term").count(),
        1
    );
}

#[tokio::test]
async fn symbols_built_during_boot_are_picked_up() {
    let lab = Lab::unbuilt("fresh-tree");
    let build = "mkdir -p kernel && printf 'ffffffe000200000 T printk\\n' > kernel/System.map; \
                 printf 'ready\\n'";
    let runner = Runner::new(lab.config(&lab.target_script("", build), &[&stop_at(PRINTK)]));

    assert!(runner.symbols().await.expect("no tables yet").is_empty());
    for _ in 0..2 {
        runner
            .run(debugger_run(Duration::from_secs(5)), vec![on_breakpoint("printk", 1)])
            .await
            .expect("printk resolves once the build wrote System.map");
    }
    assert_eq!(runner.symbols().await.expect("cached").get("printk"), Some(PRINTK));
}

#[tokio::test]
async fn callback_moves_its_breakpoint() {
    let lab = Lab::new("move-breakpoint");
    let stops = format!("--stop={PRINTK:#x},{TRAP_HANDLER:#x}");
    let runner = Runner::new(lab.config(&lab.target("ready\\n"), &[&stops]));
    let hits = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&hits);

    runner
        .run(
            debugger_run(Duration::from_secs(5)),
            vec![call_on_breakpoint("printk", 0, move |gdb: &mut Debugger| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().expect("hits").push("printk");
                    let later = Arc::clone(&seen);
                    let on_trap = breakpoint_callback(move |_gdb: &mut Debugger| {
                        later.lock().expect("hits").push("trap_handler");
                        async { Ok::<_, GraderError>(Control::Continue) }.boxed()
                    });
                    gdb.install("trap_handler", Some(on_trap), Hits::Times(1)).await?;
                    assert!(gdb.remove_breakpoint(PRINTK).await?);
                    Ok::<_, GraderError>(Control::Continue)
                }
                .boxed()
            })],
        )
        .await
        .expect("trap_handler hit empties the registry");

    assert_eq!(*hits.lock().expect("hits"), vec!["printk", "trap_handler"]);
    let events = lab.events();
    assert!(events.contains(&format!("-break-insert *{TRAP_HANDLER:#x}")));
    assert!(events.contains(&"-break-delete 1".to_string()));
    assert!(events.contains(&"-break-delete 2".to_string()));
    assert_eq!(
        events.iter().filter(|e| e.starts_with("-exec-continue")).count(),
        2
    );
}

async fn inspect(gdb: &mut Debugger, seen: &Mutex<Vec<String>>) -> CallbackResult {
    let frames = gdb.stack_frames().await?;
    let value = gdb.evaluate("jiffies").await?;
    let stepped = gdb.step().await?;
    let single = gdb.step_instruction().await?;
    let interrupted = gdb.interrupt().await?;
    let resumed = gdb.resume(true).await?;

    let mut seen = seen.lock().expect("seen");
    seen.push(frames.iter().filter_map(|f| f.func.clone()).collect::<Vec<_>>().join(">"));
    seen.push(value.unwrap_or_default());
    for stop in [stepped, single, interrupted] {
        seen.push(stop.map(|s| s.reason).unwrap_or_default());
    }
    if let Some(stop) = resumed {
        seen.push(format!("{} {:#x}", stop.reason, stop.address.unwrap_or_default()));
    }
    Ok(Control::Stop)
}

#[tokio::test]
async fn callback_drives_the_debugger_directly() {
    let lab = Lab::new("debugger-helpers");
    let runner = Runner::new(lab.config(&lab.target("ready\\n"), &[&stop_at(PRINTK)]));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let shared = Arc::clone(&seen);

    runner
        .run(
            debugger_run(Duration::from_secs(10)),
            vec![call_on_breakpoint("printk", 1, move |gdb: &mut Debugger| {
                let shared = Arc::clone(&shared);
                async move { inspect(gdb, &shared).await }.boxed()
            })],
        )
        .await
        .expect("callback stops the run");

    assert_eq!(
        *seen.lock().expect("seen"),
        vec![
            "printk>start_kernel".to_string(),
            "42".to_string(),
            "end-stepping-range".to_string(),
            "end-stepping-range".to_string(),
            "signal-received".to_string(),
            format!("breakpoint-hit {PRINTK:#x}"),
        ]
    );
    let events = lab.events();
    assert!(events.contains(&"-exec-step".to_string()));
    assert!(events.contains(&"-exec-step-instruction".to_string()));
    assert!(events.contains(&"-exec-interrupt".to_string()));
    assert!(events.contains(&"-data-evaluate-expression \"jiffies\"".to_string()));
}

#[tokio::test]
async fn default_monitors_apply_before_per_run_ones() {
    let lab = Lab::new("default-monitor");
    let runner = Runner::new(lab.config(&lab.target("ready\\n"), &[&stop_at(PRINTK)]))
        .with_default_monitor(|| on_breakpoint("printk", 1));
    let saw_default = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&saw_default);

    runner
        .run(
            debugger_run(Duration::from_secs(5)),
            vec![monitor(move |session: &mut RunSession| {
                async move {
                    let installed = session.debugger_mut()?.breakpoints().contains(PRINTK);
                    flag.store(installed, Ordering::SeqCst);
                    Ok::<_, GraderError>(())
                }
                .boxed()
            })],
        )
        .await
        .expect("default breakpoint is hit");

    assert!(saw_default.load(Ordering::SeqCst));
    assert_eq!(
        lab.events()
            .iter()
            .filter(|e| e.starts_with("-break-insert"))
            .count(),
        1
    );
}

#[tokio::test]
async fn output_printed_while_shutting_down_is_checked() {
    let lab = Lab::new("late-output");
    let script = lab.target_script(
        "printf \"panic: late\\n\";",
        "printf 'ready\\n'; sleep 0.5; printf 'Hello, ZJU OS 2025!\\n'",
    );
    let runner = Runner::new(lab.config(&script, &[]));
    let no_panic = OutputMatcher::new().forbid_any(["panic"]).expect("valid pattern");

    let err = runner
        .run(
            console_run(Duration::from_secs(5)),
            vec![
                stop_on_line("Hello, ZJU OS 2025!").expect("valid pattern"),
                expect_output(no_panic),
            ],
        )
        .await
        .expect_err("panic arrives during teardown");

    let message = err.to_string();
    assert!(message.contains("BAD  panic: late"), "unexpected error: {message}");
    assert!(message.ends_with("unexpected lines in output"));
}

#[tokio::test]
async fn failed_run_keeps_a_per_test_log() {
    let lab = Lab::new("save-log");
    let script = lab.target_script(
        "",
        "printf 'ready\\n'; sleep 0.5; printf 'Hello, ZJU OS 2025!\\n'",
    );
    let runner = Runner::new(lab.config(&script, &[]));
    runner.set_current_test(Some("hello_output".to_string()));
    let saved = lab.dir.join("qemu.out.hello_output");

    let err = runner
        .run(
            console_run(Duration::from_secs(2)),
            vec![save("qemu.out"), stop_on_line("^Goodbye").expect("valid pattern")],
        )
        .await
        .expect_err("goodbye never comes");
    assert!(err.is_timeout());
    let log = std::fs::read_to_string(&saved).expect("failure log");
    assert!(log.contains("Hello, ZJU OS 2025!"));

    runner
        .run(
            console_run(Duration::from_secs(5)),
            vec![save("qemu.out"), stop_on_line("^Hello").expect("valid pattern")],
        )
        .await
        .expect("hello ends the run");
    assert!(!saved.exists());
    assert!(lab.dir.join("qemu.out").exists());
}
