use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::time::{sleep, sleep_until, timeout, timeout_at, Instant};
use tracing::{debug, warn};

use crate::config::GraderConfig;
use crate::error::{GraderError, TestFailure};
use crate::gdb::Debugger;
use crate::matcher::OutputMatcher;
use crate::mi::ResponseRecord;
use crate::symbols::SymbolTable;
use crate::target::{Target, TargetCommand};
use crate::{Control, Result};

/// Where a run is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Booting,
    Attaching,
    Monitoring,
    Draining,
    TornDown,
    Failed,
}

/// Something the monitoring loop has to react to.
#[derive(Debug)]
pub enum Event {
    Output(Vec<u8>),
    Records(Vec<ResponseRecord>),
    Deadline,
}

/// Called once after teardown with whether the run failed.
pub type FinishHook = Box<dyn FnOnce(bool) -> BoxFuture<'static, ()> + Send>;

/// One target and at most one debugger, owned for the length of a single run.
pub struct RunSession {
    config: Arc<GraderConfig>,
    symbols: Arc<SymbolTable>,
    test_name: Option<String>,
    phase: Phase,
    target: Option<Target>,
    debugger: Option<Debugger>,
    deadline: Option<Instant>,
    cancelled: bool,
    torn_down: bool,
    matchers: Vec<Arc<Mutex<OutputMatcher>>>,
    finish_hooks: Vec<FinishHook>,
}

impl RunSession {
    pub fn new(config: Arc<GraderConfig>) -> Self {
        Self {
            config,
            symbols: Arc::new(SymbolTable::new()),
            test_name: None,
            phase: Phase::Booting,
            target: None,
            debugger: None,
            deadline: None,
            cancelled: false,
            torn_down: false,
            matchers: Vec::new(),
            finish_hooks: Vec::new(),
        }
    }

    pub fn config(&self) -> &GraderConfig {
        &self.config
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    /// Symbols used by the debugger this session attaches.
    pub fn set_symbols(&mut self, symbols: Arc<SymbolTable>) {
        self.symbols = symbols;
    }

    pub fn test_name(&self) -> Option<&str> {
        self.test_name.as_deref()
    }

    pub fn set_test_name(&mut self, name: Option<String>) {
        self.test_name = name;
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn enter(&mut self, phase: Phase) {
        debug!(from = ?self.phase, to = ?phase, "run phase");
        self.phase = phase;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Records that a callback asked the run to end.
    pub fn cancel(&mut self) {
        if !self.cancelled {
            debug!("run cancelled by callback");
        }
        self.cancelled = true;
    }

    pub fn target(&self) -> Option<&Target> {
        self.target.as_ref()
    }

    pub fn target_mut(&mut self) -> Result<&mut Target> {
        self.target.as_mut().ok_or(GraderError::NotRunning("target"))
    }

    pub fn debugger_mut(&mut self) -> Result<&mut Debugger> {
        self.debugger.as_mut().ok_or(GraderError::NotRunning("debugger"))
    }

    /// Captured target output so far.
    pub fn output_text(&self) -> String {
        self.target
            .as_ref()
            .map(|t| t.output().text())
            .unwrap_or_default()
    }

    pub async fn launch_target(&mut self, command: TargetCommand) -> Result<()> {
        self.enter(Phase::Booting);
        let target = Target::launch(
            command,
            &self.config.test_dir,
            &self.config.gdb_host,
            self.config.gdb_port,
        )
        .await?;
        self.target = Some(target);
        Ok(())
    }

    /// Waits for the first complete console line, which means the emulator and its
    /// debug stub are up. End of output before that means the boot failed.
    pub async fn wait_for_console(&mut self) -> Result<()> {
        let boot_timeout = self.config.boot_timeout;
        let settle = self.config.stub_settle;
        let deadline = Instant::now() + boot_timeout;
        let target = self.target_mut()?;

        loop {
            let chunk = match timeout_at(deadline, target.read_output()).await {
                Ok(chunk) => chunk?,
                Err(_) => {
                    return Err(GraderError::Timeout {
                        after: boot_timeout,
                        detail: "waiting for output from QEMU".to_string(),
                    })
                }
            };
            if chunk.is_empty() {
                return Err(GraderError::TargetExited {
                    output: target.output().text(),
                });
            }
            if chunk.contains(&b'\n') {
                break;
            }
        }

        sleep(settle).await;
        Ok(())
    }

    /// Starts the debugger, attaches it to the stub and loads the kernel image.
    pub async fn attach(&mut self) -> Result<()> {
        self.enter(Phase::Attaching);
        let debugger = Debugger::launch(&self.config, Arc::clone(&self.symbols)).await?;
        self.debugger = Some(debugger);

        let endpoint = self.config.gdb_endpoint();
        let connected = match self.debugger_mut()?.connect(&endpoint).await {
            Ok(connected) => connected,
            Err(e) => {
                debug!("connect failed: {e}");
                false
            }
        };
        if !connected {
            return Err(GraderError::Attach {
                endpoint,
                output: self.output_text(),
            });
        }

        let image = self.config.resolve(&self.config.kernel_image);
        let loaded = match self.debugger_mut()?.load_symbols(&image).await {
            Ok(loaded) => loaded,
            Err(e) => {
                debug!("loading symbols failed: {e}");
                false
            }
        };
        if !loaded {
            return Err(GraderError::LoadSymbols {
                path: image,
                output: self.output_text(),
            });
        }
        Ok(())
    }

    /// Starts the run deadline and enters monitoring.
    pub fn start_clock(&mut self, run_timeout: Duration) {
        let deadline = Instant::now() + run_timeout;
        self.deadline = Some(deadline);
        if let Some(debugger) = self.debugger.as_mut() {
            debugger.set_deadline(Some(deadline));
        }
        self.enter(Phase::Monitoring);
    }

    pub fn is_past_deadline(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Registers a matcher that is checked when the run ends.
    pub fn add_matcher(&mut self, matcher: Arc<Mutex<OutputMatcher>>) {
        self.matchers.push(matcher);
    }

    pub fn on_finish(&mut self, hook: FinishHook) {
        self.finish_hooks.push(hook);
    }

    /// Waits for target output, debugger records or the deadline, whichever comes
    /// first. Output wins ties.
    pub async fn next_event(&mut self) -> Result<Event> {
        let deadline = self
            .deadline
            .ok_or(GraderError::NotRunning("monitoring clock"))?;
        let reading = self.target.as_ref().is_some_and(Target::is_reading);
        let watching = self.debugger.as_ref().is_some_and(|d| !d.is_closed());
        let target = self.target.as_mut();
        let debugger = self.debugger.as_ref();

        tokio::select! {
            biased;
            chunk = async {
                match target {
                    Some(target) => target.read_output().await,
                    None => std::future::pending().await,
                }
            }, if reading => Ok(Event::Output(chunk?)),
            records = async {
                match debugger {
                    Some(debugger) => debugger.wait_for_records(deadline).await,
                    None => std::future::pending().await,
                }
            }, if watching => match records? {
                records if records.is_empty() => Ok(Event::Deadline),
                records => Ok(Event::Records(records)),
            },
            _ = sleep_until(deadline) => Ok(Event::Deadline),
        }
    }

    /// Hands a chunk of target output to every observer.
    pub fn handle_output(&mut self, chunk: &[u8]) -> Result<Control> {
        let target = self.target_mut()?;
        if chunk.is_empty() {
            debug!(status = ?target.exit_status(), "target output ended during monitoring");
            return Ok(Control::Continue);
        }
        let control = target.notify(chunk)?;
        if control.is_stop() {
            self.cancel();
        }
        Ok(control)
    }

    /// Hands output the target is still printing to the observers, until it stays
    /// quiet for a poll interval or the drain timeout passes.
    pub async fn drain_output(&mut self) -> Result<()> {
        self.enter(Phase::Draining);
        let quiet = self.config.poll_interval;
        let deadline = Instant::now() + self.config.drain_timeout;
        while self.target.as_ref().is_some_and(Target::is_reading) {
            let wait = quiet.min(deadline.saturating_duration_since(Instant::now()));
            let chunk = match timeout(wait, self.target_mut()?.read_output()).await {
                Ok(chunk) => chunk?,
                Err(_) => break,
            };
            if chunk.is_empty() {
                break;
            }
            self.handle_output(&chunk)?;
        }
        Ok(())
    }

    pub fn verify_matchers(&self) -> std::result::Result<(), TestFailure> {
        for matcher in &self.matchers {
            let mut matcher = matcher
                .lock()
                .map_err(|_| TestFailure::new("output matcher poisoned"))?;
            matcher.verify()?;
        }
        Ok(())
    }

    /// Diagnostics of every matcher that is not satisfied yet.
    pub fn matcher_diagnostics(&self) -> String {
        self.matchers
            .iter()
            .filter_map(|m| m.lock().ok())
            .filter_map(|mut m| {
                m.finish();
                (!m.is_satisfied()).then(|| m.diagnostic())
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Closes the debugger, then terminates the target. Both are always attempted;
    /// failures come back as warnings. Safe to call more than once.
    pub async fn teardown(&mut self) -> Vec<String> {
        if self.torn_down {
            return Vec::new();
        }
        self.torn_down = true;
        let failed = self.phase == Phase::Failed;
        if self.phase != Phase::Draining {
            self.enter(Phase::Draining);
        }
        let drain = self.config.drain_timeout;
        let mut warnings = Vec::new();

        if let Some(debugger) = self.debugger.as_mut() {
            if let Err(e) = debugger.close(drain).await {
                warnings.push(format!(
                    "Error closing GDB connection: {e}. \
                     You might need to execute 'killall {}' by yourself.",
                    self.config.gdb_program
                ));
            }
        }
        if let Some(target) = self.target.as_mut() {
            if let Err(e) = target.terminate(drain).await {
                warnings.push(format!(
                    "Failed to shutdown QEMU: {e}. \
                     You might need to 'killall qemu-system-riscv64' by yourself."
                ));
            }
        }

        self.enter(if failed { Phase::Failed } else { Phase::TornDown });
        warnings
    }

    pub fn mark_failed(&mut self) {
        self.enter(Phase::Failed);
    }

    /// Runs finish hooks with whether the run failed.
    pub async fn finish(&mut self, failed: bool) {
        if failed && self.phase != Phase::Failed {
            self.mark_failed();
        }
        for hook in std::mem::take(&mut self.finish_hooks) {
            hook(failed).await;
        }
    }
}

impl Drop for RunSession {
    fn drop(&mut self) {
        if self.target.as_ref().is_some_and(Target::is_running) {
            warn!("run session dropped without teardown");
        }
    }
}
