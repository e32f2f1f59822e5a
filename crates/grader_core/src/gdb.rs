use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

use crate::breakpoints::{BreakpointCallback, BreakpointRegistry, Hits, Location};
use crate::config::GraderConfig;
use crate::error::GraderError;
use crate::mi::{self, ResponseRecord, StopEvent};
use crate::symbols::SymbolTable;
use crate::transcript::Transcript;
use crate::{Control, Result};

const MAX_QUEUED_RECORDS: usize = 4096;

type PendingReplies = Arc<Mutex<HashMap<u64, oneshot::Sender<(u64, ResponseRecord)>>>>;
type RecordQueue = Arc<Mutex<VecDeque<(u64, ResponseRecord)>>>;

/// One frame of `-stack-list-frames`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Frame {
    pub level: String,
    pub addr: Option<String>,
    pub func: Option<String>,
    pub file: Option<String>,
    pub line: Option<String>,
}

impl Frame {
    pub fn address(&self) -> Option<u64> {
        self.addr.as_deref().and_then(mi::parse_int)
    }
}

/// A `gdb-multiarch` child speaking GDB/MI on its stdin and stdout.
///
/// A reader task decodes every output line. Replies to tokenized commands go to the
/// waiting caller, everything else lands in a sequence-numbered queue that the
/// monitoring loop polls.
pub struct Debugger {
    child: Child,
    writer: ChildStdin,
    pending: PendingReplies,
    records: RecordQueue,
    last_seq: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
    reader_task: JoinHandle<()>,
    transcript: Option<Arc<Transcript>>,
    next_token: u64,
    endpoint: Option<String>,
    exited: bool,
    register_numbers: Option<HashMap<String, usize>>,
    breakpoints: BreakpointRegistry<Debugger>,
    symbols: Arc<SymbolTable>,
    deadline: Option<Instant>,
    command_timeout: Duration,
    resume_reply_timeout: Duration,
    poll_interval: Duration,
}

impl Debugger {
    pub async fn launch(config: &GraderConfig, symbols: Arc<SymbolTable>) -> Result<Self> {
        let command_line = std::iter::once(config.gdb_program.as_str())
            .chain(config.gdb_args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        debug!(command = %command_line, "starting debugger");

        let mut child = Command::new(&config.gdb_program)
            .args(&config.gdb_args)
            .current_dir(&config.test_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| GraderError::Spawn {
                command: command_line.clone(),
                source,
            })?;

        if let Some(status) = probe_startup(&mut child)? {
            return Err(GraderError::Spawn {
                command: command_line,
                source: std::io::Error::other(format!("exited immediately with {status}")),
            });
        }

        let writer = child.stdin.take().ok_or(GraderError::DebuggerClosed)?;
        let stdout = child.stdout.take().ok_or(GraderError::DebuggerClosed)?;

        let transcript = match &config.transcript_dir {
            Some(dir) => match Transcript::create(dir, child.id().unwrap_or(0)).await {
                Ok(transcript) => {
                    debug!(path = %transcript.path().display(), "writing debugger transcript");
                    Some(Arc::new(transcript))
                }
                Err(e) => {
                    warn!("Failed to open debugger transcript in {}: {e}", dir.display());
                    None
                }
            },
            None => None,
        };

        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
        let records: RecordQueue = Arc::new(Mutex::new(VecDeque::new()));
        let last_seq = Arc::new(AtomicU64::new(0));
        let closed = Arc::new(AtomicBool::new(false));
        let reader_task = tokio::spawn(reader_loop(
            stdout,
            Arc::clone(&pending),
            Arc::clone(&records),
            Arc::clone(&last_seq),
            Arc::clone(&closed),
            transcript.clone(),
        ));

        Ok(Self {
            child,
            writer,
            pending,
            records,
            last_seq,
            closed,
            reader_task,
            transcript,
            next_token: 0,
            endpoint: None,
            exited: false,
            register_numbers: None,
            breakpoints: BreakpointRegistry::new(),
            symbols,
            deadline: None,
            command_timeout: config.command_timeout,
            resume_reply_timeout: config.resume_reply_timeout,
            poll_interval: config.poll_interval,
        })
    }

    /// Bounds every later wait by `deadline`.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    pub fn is_closed(&self) -> bool {
        self.exited || self.closed.load(Ordering::SeqCst)
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn breakpoints(&self) -> &BreakpointRegistry<Debugger> {
        &self.breakpoints
    }

    /// Per-command wait: the command timeout, cut short by the run deadline.
    fn budget(&self) -> Duration {
        match self.deadline {
            Some(deadline) => self
                .command_timeout
                .min(deadline.saturating_duration_since(Instant::now())),
            None => self.command_timeout,
        }
    }

    async fn send_command_begin(
        &mut self,
        command: &str,
    ) -> Result<(u64, u64, oneshot::Receiver<(u64, ResponseRecord)>)> {
        if self.is_closed() {
            return Err(GraderError::DebuggerClosed);
        }

        self.next_token += 1;
        let token = self.next_token;
        debug!(token, command, "gdb <-");
        if let Some(transcript) = &self.transcript {
            let _ = transcript
                .log(
                    "outbound",
                    &json!({"type": "command", "token": token, "command": command}),
                )
                .await;
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(token, tx);
        }
        let before = self.last_seq.load(Ordering::SeqCst);

        let line = format!("{token}{command}\n");
        let written = match self.writer.write_all(line.as_bytes()).await {
            Ok(()) => self.writer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            debug!("failed to write '{command}' to debugger stdin: {e}");
            let mut pending = self.pending.lock().await;
            pending.remove(&token);
            return Err(GraderError::DebuggerClosed);
        }

        Ok((token, before, rx))
    }

    async fn await_result(
        &self,
        command: &str,
        token: u64,
        before: u64,
        rx: oneshot::Receiver<(u64, ResponseRecord)>,
        wait_timeout: Duration,
    ) -> Result<Vec<ResponseRecord>> {
        let (reply_seq, reply) = match timeout(wait_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(GraderError::DebuggerClosed),
            Err(_) => {
                let mut pending = self.pending.lock().await;
                pending.remove(&token);
                return Err(GraderError::CommandTimeout {
                    command: command.to_string(),
                });
            }
        };

        let mut records: Vec<ResponseRecord> = {
            let queue = self.records.lock().await;
            queue
                .iter()
                .filter(|(seq, _)| *seq > before && *seq < reply_seq)
                .map(|(_, record)| record.clone())
                .collect()
        };
        records.push(reply);
        Ok(records)
    }

    /// Sends one MI command and returns the records that arrived up to and including
    /// its reply. Asynchronous records stay queued for the monitoring loop.
    pub async fn send_command(&mut self, command: &str) -> Result<Vec<ResponseRecord>> {
        let wait = self.budget();
        self.send_command_with_timeout(command, wait).await
    }

    pub async fn send_command_with_timeout(
        &mut self,
        command: &str,
        wait_timeout: Duration,
    ) -> Result<Vec<ResponseRecord>> {
        let (token, before, rx) = self.send_command_begin(command).await?;
        self.await_result(command, token, before, rx, wait_timeout).await
    }

    pub async fn connect(&mut self, endpoint: &str) -> Result<bool> {
        debug!(endpoint, "connecting debugger to remote stub");
        let records = self
            .send_command(&format!("-target-select remote {endpoint}"))
            .await?;
        let connected = mi::check_records(&records, "connected");
        if connected {
            self.endpoint = Some(endpoint.to_string());
        }
        Ok(connected)
    }

    pub async fn load_symbols(&mut self, path: &Path) -> Result<bool> {
        debug!(path = %path.display(), "loading executable and symbols");
        let records = self
            .send_command(&format!(
                "-file-exec-and-symbols {}",
                mi::mi_quote(&path.to_string_lossy())
            ))
            .await?;
        Ok(mi::check_records(&records, "done"))
    }

    /// Sends `-exec-continue`.
    ///
    /// Queued records from before the resume are discarded so a stale stop cannot be
    /// mistaken for the next one. A non-blocking resume does not fail when the reply
    /// is slow; it will show up in the record queue instead, and `None` is returned.
    /// A blocking resume waits for the reply and then for the next stop.
    pub async fn resume(&mut self, blocking: bool) -> Result<Option<StopEvent>> {
        self.discard_records().await;
        let wait = if blocking {
            self.budget()
        } else {
            self.resume_reply_timeout.min(self.budget())
        };
        match self.send_command_with_timeout("-exec-continue", wait).await {
            Ok(records) => {
                expect_reply("-exec-continue", &records)?;
                if blocking {
                    self.wait_for_stop().await
                } else {
                    Ok(None)
                }
            }
            Err(GraderError::CommandTimeout { command }) if !blocking => {
                warn!("No immediate reply to '{command}', continuing");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn step(&mut self) -> Result<Option<StopEvent>> {
        let records = self.send_command("-exec-step").await?;
        expect_reply("-exec-step", &records)?;
        self.wait_for_stop().await
    }

    pub async fn step_instruction(&mut self) -> Result<Option<StopEvent>> {
        let records = self.send_command("-exec-step-instruction").await?;
        expect_reply("-exec-step-instruction", &records)?;
        self.wait_for_stop().await
    }

    pub async fn interrupt(&mut self) -> Result<Option<StopEvent>> {
        let records = self.send_command("-exec-interrupt").await?;
        expect_reply("-exec-interrupt", &records)?;
        self.wait_for_stop().await
    }

    /// Current value of a register as an unsigned machine word.
    ///
    /// Register numbers are fetched once per debugger. `Ok(None)` means the debugger
    /// answered but the value could not be decoded.
    pub async fn read_register(&mut self, name: &str) -> Result<Option<u64>> {
        if self.register_numbers.is_none() {
            let records = self.send_command("-data-list-register-names").await?;
            let numbers = reply_payload(&records)
                .and_then(|p| p.get("register-names"))
                .and_then(Value::as_array)
                .map(|names| {
                    names
                        .iter()
                        .enumerate()
                        .filter_map(|(i, name)| {
                            let name = name.as_str().filter(|n| !n.is_empty())?;
                            Some((name.to_string(), i))
                        })
                        .collect::<HashMap<_, _>>()
                });
            match numbers {
                Some(numbers) => self.register_numbers = Some(numbers),
                None => return Ok(None),
            }
        }

        let Some(number) = self
            .register_numbers
            .as_ref()
            .and_then(|numbers| numbers.get(name).copied())
        else {
            return Ok(None);
        };

        let records = self
            .send_command(&format!("-data-list-register-values x {number}"))
            .await?;
        let value = reply_payload(&records)
            .and_then(|p| p.get("register-values"))
            .and_then(Value::as_array)
            .and_then(|values| {
                values.iter().find(|v| {
                    v.get("number")
                        .and_then(Value::as_str)
                        .and_then(|n| n.parse::<usize>().ok())
                        == Some(number)
                })
            })
            .and_then(|v| v.get("value"))
            .and_then(Value::as_str)
            .and_then(mi::parse_int);
        Ok(value)
    }

    pub async fn read_memory(&mut self, address: u64, length: usize) -> Result<Option<Vec<u8>>> {
        let records = self
            .send_command(&format!("-data-read-memory-bytes {address:#x} {length}"))
            .await?;
        let bytes = reply_payload(&records)
            .and_then(|p| p.get("memory"))
            .and_then(Value::as_array)
            .and_then(|blocks| blocks.first())
            .and_then(|block| block.get("contents"))
            .and_then(Value::as_str)
            .and_then(mi::decode_hex);
        Ok(bytes)
    }

    pub async fn evaluate(&mut self, expression: &str) -> Result<Option<String>> {
        let records = self
            .send_command(&format!(
                "-data-evaluate-expression {}",
                mi::mi_quote(expression)
            ))
            .await?;
        Ok(reply_payload(&records)
            .and_then(|p| p.get("value"))
            .and_then(Value::as_str)
            .map(String::from))
    }

    pub async fn stack_frames(&mut self) -> Result<Vec<Frame>> {
        let records = self.send_command("-stack-list-frames").await?;
        let frames = reply_payload(&records)
            .and_then(|p| p.get("stack"))
            .cloned()
            .and_then(|stack| serde_json::from_value::<Vec<Frame>>(stack).ok())
            .unwrap_or_default();
        Ok(frames)
    }

    /// Inserts a debugger breakpoint at an instruction address and returns its number.
    pub async fn set_breakpoint(&mut self, address: u64) -> Result<Option<u32>> {
        let command = format!("-break-insert *{address:#x}");
        let records = self.send_command(&command).await?;
        let payload = expect_reply(&command, &records)?;
        Ok(payload
            .get("bkpt")
            .and_then(|b| b.get("number"))
            .and_then(Value::as_str)
            .and_then(|n| n.parse().ok()))
    }

    pub async fn delete_breakpoint(&mut self, number: u32) -> Result<()> {
        let command = format!("-break-delete {number}");
        let records = self.send_command(&command).await?;
        expect_reply(&command, &records)?;
        Ok(())
    }

    /// Resolves `location`, sets a debugger breakpoint there and records `callback`
    /// with its hit budget. Returns the resolved address.
    ///
    /// Symbols are resolved before any command is sent.
    pub async fn install(
        &mut self,
        location: impl Into<Location>,
        callback: Option<BreakpointCallback<Debugger>>,
        hits: Hits,
    ) -> Result<u64> {
        let location = location.into();
        let address = location.resolve(&self.symbols)?;
        let number = self.set_breakpoint(address).await?;
        debug!("breakpoint installed at {location} ({address:#x}), hits {hits:?}");

        if let Some(previous) = self.breakpoints.insert(address, callback, hits, number) {
            if let Some(old) = previous.number().filter(|old| Some(*old) != number) {
                self.delete_breakpoint(old).await?;
            }
        }
        Ok(address)
    }

    /// Drops the registry entry at `address` and its debugger breakpoint.
    pub async fn remove_breakpoint(&mut self, address: u64) -> Result<bool> {
        let Some(entry) = self.breakpoints.remove(address) else {
            return Ok(false);
        };
        if let Some(number) = entry.number() {
            self.delete_breakpoint(number).await?;
        }
        Ok(true)
    }

    /// Runs the callback registered at `address`.
    ///
    /// `Ok(None)` means the address is not registered. The callback runs to
    /// completion before this returns, so it can safely edit the registry. An
    /// exhausted entry loses its debugger breakpoint even when the callback failed;
    /// the callback's error is reported first.
    pub async fn dispatch(&mut self, address: u64) -> Result<Option<Control>> {
        let Some(callback) = self.breakpoints.begin_dispatch(address) else {
            return Ok(None);
        };
        debug!("breakpoint hit at {address:#x}");

        let (callback, result) = match callback {
            Some(mut callback) => {
                let result = callback(self).await;
                (Some(callback), result)
            }
            None => (None, Ok(Control::Continue)),
        };

        let mut deleted = Ok(());
        if let Some(exhausted) = self.breakpoints.finish_dispatch(callback) {
            debug!("breakpoint at {address:#x} exhausted its hit budget");
            if let Some(number) = exhausted.number() {
                deleted = self.delete_breakpoint(number).await;
            }
        }
        let control = result?;
        deleted?;
        Ok(Some(control))
    }

    /// Waits until the record queue is non-empty or `deadline` passes, then drains it.
    ///
    /// Cancel-safe: the queue is only drained once its lock is held and nothing is
    /// awaited between draining and returning.
    pub async fn wait_for_records(&self, deadline: Instant) -> Result<Vec<ResponseRecord>> {
        loop {
            {
                let mut queue = self.records.lock().await;
                if !queue.is_empty() {
                    return Ok(queue.drain(..).map(|(_, record)| record).collect());
                }
            }
            if self.closed.load(Ordering::SeqCst) {
                return Err(GraderError::DebuggerClosed);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Waits for the next stop notification within the command budget.
    pub async fn wait_for_stop(&mut self) -> Result<Option<StopEvent>> {
        let deadline = Instant::now() + self.budget();
        loop {
            let records = self.wait_for_records(deadline).await?;
            if let Some(stop) = mi::find_stop(&records) {
                return Ok(Some(stop));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    pub async fn take_records(&self) -> Vec<ResponseRecord> {
        let mut queue = self.records.lock().await;
        queue.drain(..).map(|(_, record)| record).collect()
    }

    async fn discard_records(&self) {
        let discarded = self.take_records().await;
        if !discarded.is_empty() {
            debug!(count = discarded.len(), "discarding stale debugger records");
        }
    }

    /// Asks GDB to exit, then kills it if it is still around after `drain`.
    ///
    /// Calling this again is a no-op.
    pub async fn close(&mut self, drain: Duration) -> Result<()> {
        if self.exited {
            return Ok(());
        }
        self.exited = true;
        debug!("closing debugger");

        if !self.closed.load(Ordering::SeqCst) {
            let _ = self.writer.write_all(b"-gdb-exit\n").await;
            let _ = self.writer.flush().await;
        }

        let outcome = match timeout(drain, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(%status, "debugger exited");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                debug!("debugger did not exit in time, killing it");
                match self.child.kill().await {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
                    Err(e) => Err(e),
                }
            }
        };

        self.reader_task.abort();
        self.pending.lock().await.clear();

        outcome.map_err(GraderError::Io)
    }
}

impl Drop for Debugger {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

fn probe_startup(child: &mut Child) -> std::io::Result<Option<std::process::ExitStatus>> {
    child.try_wait()
}

/// Payload of the reply record, or `None` when the command failed.
fn reply_payload(records: &[ResponseRecord]) -> Option<&Value> {
    match records.iter().rev().find(|r| r.is_reply())? {
        ResponseRecord::Result { payload, .. } => Some(payload),
        _ => None,
    }
}

fn expect_reply<'r>(command: &str, records: &'r [ResponseRecord]) -> Result<&'r Value> {
    match records.iter().rev().find(|r| r.is_reply()) {
        Some(ResponseRecord::Result { payload, .. }) => Ok(payload),
        Some(ResponseRecord::Error { message, .. }) => Err(GraderError::Command {
            command: command.to_string(),
            message: message.clone(),
        }),
        _ => Err(GraderError::Command {
            command: command.to_string(),
            message: "no reply".to_string(),
        }),
    }
}

async fn reader_loop(
    stdout: ChildStdout,
    pending: PendingReplies,
    records: RecordQueue,
    last_seq: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
    transcript: Option<Arc<Transcript>>,
) {
    let mut reader = BufReader::new(stdout);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                if let Some(transcript) = &transcript {
                    let _ = transcript
                        .log(
                            "internal",
                            &json!({"type": "reader_error", "message": e.to_string()}),
                        )
                        .await;
                }
                break;
            }
        }

        let text = String::from_utf8_lossy(&line);
        let Some(record) = mi::parse_record(&text) else {
            continue;
        };
        debug!(?record, "gdb ->");
        if let Some(transcript) = &transcript {
            if let Ok(payload) = serde_json::to_value(&record) {
                let _ = transcript.log("inbound", &payload).await;
            }
        }

        let seq = last_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let record = match (record.is_reply(), record.token()) {
            (true, Some(token)) => {
                let waiter = pending.lock().await.remove(&token);
                match waiter {
                    Some(tx) => match tx.send((seq, record)) {
                        Ok(()) => continue,
                        Err((_, record)) => record,
                    },
                    None => record,
                }
            }
            _ => record,
        };

        let mut queue = records.lock().await;
        queue.push_back((seq, record));
        while queue.len() > MAX_QUEUED_RECORDS {
            queue.pop_front();
        }
    }

    closed.store(true, Ordering::SeqCst);
    pending.lock().await.clear();
}
