use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, warn};

use crate::error::GraderError;
use crate::output::OutputBuffer;
use crate::{CallbackResult, Control, Result};

const READ_CHUNK: usize = 4096;
const PORT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);
const EXIT_WAIT_AFTER_EOF: Duration = Duration::from_secs(1);
const KILL_WAIT: Duration = Duration::from_secs(2);

/// Program and arguments that start the emulator, usually `make debug`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl TargetCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Shell line that execs the command with stderr folded into stdout.
    pub fn shell_line(&self) -> String {
        let mut line = String::from("exec");
        for word in std::iter::once(&self.program).chain(&self.args) {
            line.push(' ');
            line.push_str(&shell_quote(word));
        }
        line.push_str(" 2>&1");
        line
    }
}

fn shell_quote(word: &str) -> String {
    format!("'{}'", word.replace('\'', r"'\''"))
}

/// Called with every chunk the target prints, in registration order.
pub type OutputObserver = Box<dyn FnMut(&[u8]) -> CallbackResult + Send>;

/// The emulator process group and everything it printed.
pub struct Target {
    child: Child,
    stdout: Option<ChildStdout>,
    stdin: Option<ChildStdin>,
    pgid: Option<u32>,
    output: OutputBuffer,
    observers: Vec<OutputObserver>,
    command: TargetCommand,
    exit_status: Option<ExitStatus>,
}

impl Target {
    /// Starts `command` in `dir` as the leader of a new process group.
    ///
    /// Fails with [`GraderError::PortInUse`] when something already listens on the
    /// debug stub port, since that is almost always a leftover emulator.
    pub async fn launch(
        command: TargetCommand,
        dir: &Path,
        host: &str,
        port: u16,
    ) -> Result<Self> {
        if port_in_use(host, port).await {
            return Err(GraderError::PortInUse { port });
        }

        let shell_line = command.shell_line();
        debug!(command = %shell_line, dir = %dir.display(), "starting target");
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&shell_line)
            .current_dir(dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| GraderError::Spawn {
                command: shell_line,
                source,
            })?;

        let stdout = child.stdout.take();
        let stdin = child.stdin.take();
        let pgid = child.id();

        Ok(Self {
            child,
            stdout,
            stdin,
            pgid,
            output: OutputBuffer::new(),
            observers: Vec::new(),
            command,
            exit_status: None,
        })
    }

    pub fn command(&self) -> &TargetCommand {
        &self.command
    }

    pub fn output(&self) -> &OutputBuffer {
        &self.output
    }

    pub fn output_mut(&mut self) -> &mut OutputBuffer {
        &mut self.output
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Whether stdout is still open.
    pub fn is_reading(&self) -> bool {
        self.stdout.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.pgid.is_some() && self.exit_status.is_none()
    }

    /// Reads the next chunk of output into the buffer and returns it.
    ///
    /// An empty chunk means end of stream; the process is then reaped if it exits
    /// promptly. Cancel-safe: bytes are recorded only after a read completes.
    pub async fn read_output(&mut self) -> Result<Vec<u8>> {
        let Some(stdout) = self.stdout.as_mut() else {
            return Ok(Vec::new());
        };

        let mut chunk = vec![0_u8; READ_CHUNK];
        let n = stdout.read(&mut chunk).await?;
        chunk.truncate(n);
        self.output.append(&chunk);

        if n == 0 {
            debug!("target closed its output");
            self.stdout = None;
            if let Ok(Ok(status)) = timeout(EXIT_WAIT_AFTER_EOF, self.child.wait()).await {
                debug!(%status, "target exited");
                self.exit_status = Some(status);
            }
        }
        Ok(chunk)
    }

    pub async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let stdin = self.stdin.as_mut().ok_or(GraderError::NotRunning("target"))?;
        stdin.write_all(bytes).await?;
        stdin.flush().await?;
        Ok(())
    }

    pub fn observe(&mut self, observer: OutputObserver) {
        self.observers.push(observer);
    }

    /// Hands `chunk` to every observer.
    ///
    /// All observers see the chunk even when an earlier one fails or asks to stop.
    /// The first error wins; otherwise any `Stop` stops.
    pub fn notify(&mut self, chunk: &[u8]) -> CallbackResult {
        let mut verdict: CallbackResult = Ok(Control::Continue);
        for observer in &mut self.observers {
            let result = observer(chunk);
            verdict = match (verdict, result) {
                (Err(e), _) => Err(e),
                (Ok(_), Err(e)) => Err(e),
                (Ok(a), Ok(b)) => Ok(a.merge(b)),
            };
        }
        verdict
    }

    /// Sends SIGTERM to the process group, keeps collecting output for up to `drain`,
    /// then kills whatever is left.
    ///
    /// Terminating an already terminated target does nothing.
    pub async fn terminate(&mut self, drain: Duration) -> Result<()> {
        let Some(pgid) = self.pgid.take() else {
            return Ok(());
        };
        debug!(pgid, "terminating target process group");

        let result = self.terminate_group(pgid, drain).await;
        self.stdin = None;
        self.stdout = None;

        result.map_err(GraderError::Io)
    }

    async fn terminate_group(&mut self, pgid: u32, drain: Duration) -> std::io::Result<()> {
        signal_group(pgid, libc::SIGTERM)?;

        let deadline = Instant::now() + drain;
        while self.is_reading() {
            match timeout_at(deadline, self.read_output()).await {
                Ok(Ok(chunk)) if chunk.is_empty() => break,
                Ok(Ok(chunk)) => {
                    if let Err(e) = self.notify(&chunk) {
                        warn!("output observer failed during shutdown: {e}");
                    }
                }
                Ok(Err(_)) | Err(_) => break,
            }
        }

        if self.exit_status.is_none() {
            match timeout_at(deadline, self.child.wait()).await {
                Ok(status) => self.exit_status = Some(status?),
                Err(_) => {
                    debug!(pgid, "target ignored SIGTERM, killing process group");
                    signal_group(pgid, libc::SIGKILL)?;
                    let status = timeout(KILL_WAIT, self.child.wait())
                        .await
                        .map_err(|_| std::io::Error::other("target did not exit after SIGKILL"))??;
                    self.exit_status = Some(status);
                }
            }
        }
        Ok(())
    }
}

impl Drop for Target {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            let _ = signal_group(pgid, libc::SIGKILL);
        }
    }
}

async fn port_in_use(host: &str, port: u16) -> bool {
    matches!(
        timeout(PORT_PROBE_TIMEOUT, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

/// Signals every process in the group led by `pgid`. A group that is already gone
/// counts as success.
fn signal_group(pgid: u32, signal: libc::c_int) -> std::io::Result<()> {
    let pid: libc::pid_t = pgid
        .try_into()
        .map_err(|_| std::io::Error::other(format!("invalid process group {pgid}")))?;
    // SAFETY: a negative pid addresses the process group; no memory is shared.
    let rc = unsafe { libc::kill(-pid, signal) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}
