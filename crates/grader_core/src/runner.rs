use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::GraderConfig;
use crate::error::GraderError;
use crate::matcher::assert_lines_match;
use crate::mi::{self, StopEvent};
use crate::monitor::Monitor;
use crate::session::{Event, RunSession};
use crate::symbols::SymbolTable;
use crate::{Control, Result};

/// How a run decides it is finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Keep resuming until every breakpoint has used up its hits.
    Debugger,
    /// Resume once and follow the console until an observer stops the run.
    Console,
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub mode: RunMode,
    /// Make target that boots the kernel under the debug stub.
    pub run_target: Option<String>,
    pub make_args: Vec<String>,
    pub timeout: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            mode: RunMode::Console,
            run_target: Some("debug".to_string()),
            make_args: Vec::new(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl RunOptions {
    pub fn debugger(timeout: Duration) -> Self {
        Self {
            mode: RunMode::Debugger,
            timeout,
            ..Self::default()
        }
    }

    pub fn console(timeout: Duration) -> Self {
        Self {
            mode: RunMode::Console,
            timeout,
            ..Self::default()
        }
    }
}

/// What a successful run leaves behind.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub output: String,
    pub elapsed: Duration,
    pub teardown_warnings: Vec<String>,
}

impl RunReport {
    /// Checks the captured output line by line after the run.
    pub fn match_lines(&self, required: &[&str], forbidden: &[&str]) -> Result<()> {
        assert_lines_match(&self.output, required, forbidden)
    }
}

pub type MonitorFactory = Box<dyn Fn() -> Monitor + Send + Sync>;

enum Flow {
    /// Resume the target and keep waiting.
    Resume,
    /// The target stays halted; keep waiting for output.
    Halted,
    Finished,
}

/// Boots a target, attaches a debugger and drives both for one test at a time.
pub struct Runner {
    config: Arc<GraderConfig>,
    default_monitors: Vec<MonitorFactory>,
    symbols: OnceCell<Arc<SymbolTable>>,
    current_test: Mutex<Option<String>>,
}

impl Runner {
    pub fn new(config: GraderConfig) -> Self {
        Self {
            config: Arc::new(config),
            default_monitors: Vec::new(),
            symbols: OnceCell::new(),
            current_test: Mutex::new(None),
        }
    }

    /// Adds a monitor applied to every run before the per-run ones.
    pub fn with_default_monitor<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Monitor + Send + Sync + 'static,
    {
        self.default_monitors.push(Box::new(factory));
        self
    }

    pub fn config(&self) -> &GraderConfig {
        &self.config
    }

    /// Names the test whose runs follow, for per-test output files.
    pub fn set_current_test(&self, name: Option<String>) {
        if let Ok(mut current) = self.current_test.lock() {
            *current = name;
        }
    }

    pub fn current_test(&self) -> Option<String> {
        self.current_test.lock().ok().and_then(|current| current.clone())
    }

    /// Kernel symbol table.
    ///
    /// The tables are produced by the kernel build, so an empty load is returned but
    /// not kept; the first non-empty one is shared by every later run.
    pub async fn symbols(&self) -> Result<Arc<SymbolTable>> {
        if let Some(symbols) = self.symbols.get() {
            return Ok(Arc::clone(symbols));
        }
        let paths: Vec<_> = self
            .config
            .symbol_files
            .iter()
            .map(|p| self.config.resolve(p))
            .collect();
        let symbols = Arc::new(SymbolTable::load(&paths).await?);
        if symbols.is_empty() {
            debug!("no kernel symbols found yet");
        } else {
            let _ = self.symbols.set(Arc::clone(&symbols));
        }
        Ok(symbols)
    }

    /// Runs one test: boot, attach, apply monitors, monitor until done, tear down.
    ///
    /// Teardown always happens, debugger first, even when monitoring fails or a
    /// callback panics. Teardown problems are logged and returned in the report but
    /// never replace the run's own result. Output matchers are checked last, so they
    /// see everything the target printed on its way down.
    pub async fn run(&self, options: RunOptions, monitors: Vec<Monitor>) -> Result<RunReport> {
        let started = Instant::now();
        let mut session = RunSession::new(Arc::clone(&self.config));
        session.set_test_name(self.current_test());
        info!(mode = ?options.mode, timeout = ?options.timeout, "run starting");

        let outcome = AssertUnwindSafe(self.drive(&mut session, &options, monitors))
            .catch_unwind()
            .await;
        if !matches!(outcome, Ok(Ok(()))) {
            session.mark_failed();
        }

        let teardown_warnings = session.teardown().await;
        for warning in &teardown_warnings {
            warn!("{warning}");
        }
        let outcome = match outcome {
            Ok(Ok(())) => Ok(session.verify_matchers().map_err(GraderError::from)),
            other => other,
        };
        let failed = !matches!(outcome, Ok(Ok(())));
        session.finish(failed).await;

        let elapsed = started.elapsed();
        match outcome {
            Ok(Ok(())) => {
                info!(?elapsed, "run passed");
                Ok(RunReport {
                    output: session.output_text(),
                    elapsed,
                    teardown_warnings,
                })
            }
            Ok(Err(e)) => {
                info!(?elapsed, "run failed: {e}");
                Err(e)
            }
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    async fn drive(
        &self,
        session: &mut RunSession,
        options: &RunOptions,
        monitors: Vec<Monitor>,
    ) -> Result<()> {
        let command = self
            .config
            .target_command(options.run_target.as_deref(), &options.make_args);
        session.launch_target(command).await?;
        session.wait_for_console().await?;
        session.set_symbols(self.symbols().await?);
        session.attach().await?;

        session.start_clock(options.timeout);
        let defaults = self.default_monitors.iter().map(|factory| factory());
        for monitor in defaults.chain(monitors) {
            monitor(session).await?;
        }

        match monitor_loop(session, options).await {
            Ok(()) => {}
            Err(GraderError::Timeout { after, detail }) => {
                let diagnostics = session.matcher_diagnostics();
                let detail = [detail, diagnostics]
                    .into_iter()
                    .filter(|d| !d.is_empty())
                    .collect::<Vec<_>>()
                    .join("\n");
                return Err(GraderError::Timeout { after, detail });
            }
            Err(e) => return Err(e),
        }

        session.drain_output().await
    }
}

async fn monitor_loop(session: &mut RunSession, options: &RunOptions) -> Result<()> {
    let timed_out = || GraderError::Timeout {
        after: options.timeout,
        detail: String::new(),
    };

    'resume: loop {
        if session.is_cancelled() {
            return Ok(());
        }
        if options.mode == RunMode::Debugger && session.debugger_mut()?.breakpoints().is_empty() {
            debug!("all breakpoints exhausted");
            return Ok(());
        }
        if session.is_past_deadline() {
            return Err(timed_out());
        }
        session.debugger_mut()?.resume(false).await?;

        loop {
            match session.next_event().await? {
                Event::Output(chunk) => {
                    if session.handle_output(&chunk)?.is_stop() {
                        return Ok(());
                    }
                }
                Event::Records(records) => {
                    let Some(stop) = mi::find_stop(&records) else {
                        continue;
                    };
                    match handle_stop(session, options.mode, stop).await? {
                        Flow::Resume => continue 'resume,
                        Flow::Halted => continue,
                        Flow::Finished => return Ok(()),
                    }
                }
                Event::Deadline => return Err(timed_out()),
            }
        }
    }
}

async fn handle_stop(session: &mut RunSession, mode: RunMode, stop: StopEvent) -> Result<Flow> {
    if !stop.is_breakpoint_hit() {
        return match mode {
            RunMode::Debugger => Err(GraderError::UnexpectedStop { reason: stop.reason }),
            RunMode::Console => {
                warn!("target stopped ({}) while following the console", stop.reason);
                Ok(Flow::Halted)
            }
        };
    }
    let Some(address) = stop.address else {
        return Err(GraderError::UnexpectedStop {
            reason: "breakpoint-hit without a frame address".to_string(),
        });
    };

    match session.debugger_mut()?.dispatch(address).await? {
        Some(Control::Stop) => {
            session.cancel();
            Ok(Flow::Finished)
        }
        Some(Control::Continue) => Ok(Flow::Resume),
        None if mode == RunMode::Debugger => Ok(Flow::Resume),
        None => {
            debug!("target halted at {address:#x}");
            Ok(Flow::Halted)
        }
    }
}
