use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// A failed expectation raised by a test body or a breakpoint callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestFailure(String);

impl TestFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for TestFailure {}

#[derive(Error, Debug)]
pub enum GraderError {
    #[error("GDB stub found on port {port}. It seems QEMU is already running; exit it or use 'killall qemu-system-riscv64'")]
    PortInUse { port: u16 },

    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No output from QEMU, likely failed{}", output_suffix(.output))]
    TargetExited { output: String },

    #[error("Failure when GDB is connecting to QEMU at {endpoint}{}", output_suffix(.output))]
    Attach { endpoint: String, output: String },

    #[error("Failed to load executable and symbols from {}{}", .path.display(), output_suffix(.output))]
    LoadSymbols { path: PathBuf, output: String },

    #[error("Symbol {0} not found")]
    SymbolNotFound(String),

    #[error("No termination after timeout! ({after:?}){}", detail_suffix(.detail))]
    Timeout { after: Duration, detail: String },

    #[error("{0}")]
    Assertion(#[from] TestFailure),

    #[error("GDB did not hit any breakpoint (stopped: {reason})")]
    UnexpectedStop { reason: String },

    #[error("{0} is not running")]
    NotRunning(&'static str),

    #[error("GDB connection closed")]
    DebuggerClosed,

    #[error("Timeout while waiting for GDB response to '{command}'")]
    CommandTimeout { command: String },

    #[error("GDB command '{command}' failed: {message}")]
    Command { command: String, message: String },

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GraderError {
    pub fn assertion(message: impl Into<String>) -> Self {
        Self::Assertion(TestFailure::new(message))
    }

    /// Errors raised while bringing the target and debugger up or installing
    /// breakpoints. They are never retried.
    pub fn is_setup(&self) -> bool {
        matches!(
            self,
            Self::PortInUse { .. }
                | Self::Spawn { .. }
                | Self::TargetExited { .. }
                | Self::Attach { .. }
                | Self::LoadSymbols { .. }
                | Self::SymbolNotFound(_)
        )
    }

    /// Setup errors that make every later run in the same batch pointless.
    pub fn is_fatal(&self) -> bool {
        self.is_setup() && !matches!(self, Self::SymbolNotFound(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

fn output_suffix(output: &str) -> String {
    if output.is_empty() {
        String::new()
    } else {
        format!("; output:\n{output}")
    }
}

fn detail_suffix(detail: &str) -> String {
    if detail.is_empty() {
        String::new()
    } else {
        format!("\n{detail}")
    }
}

/// Compares two values and fails with a got/expected report when they differ.
pub fn assert_equal<T>(got: T, expected: T, message: &str) -> Result<(), TestFailure>
where
    T: PartialEq + fmt::Display,
{
    if got == expected {
        return Ok(());
    }
    let mut text = String::new();
    if !message.is_empty() {
        text.push_str(message);
        text.push('\n');
    }
    text.push_str(&format!(
        "got:\n  {}\nexpected:\n  {}",
        indent(&got.to_string()),
        indent(&expected.to_string())
    ));
    Err(TestFailure::new(text))
}

fn indent(text: &str) -> String {
    text.replace('\n', "\n  ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assert_equal_passes_on_equal_values() {
        assert!(assert_equal(3_u64, 3, "unused").is_ok());
    }

    #[test]
    fn test_assert_equal_reports_got_and_expected() {
        let err = assert_equal(
            "0x8000000000000005",
            "0x8000000000000001",
            "scause should indicate software interrupt!",
        )
        .expect_err("different values must fail");
        assert_eq!(
            err.message(),
            "scause should indicate software interrupt!\ngot:\n  0x8000000000000005\nexpected:\n  0x8000000000000001"
        );
    }

    #[test]
    fn test_assert_equal_indents_multiline_values() {
        let err = assert_equal("a\nb", "c", "").expect_err("must fail");
        assert_eq!(err.message(), "got:\n  a\n  b\nexpected:\n  c");
    }

    #[test]
    fn test_timeout_display_names_the_condition() {
        let err = GraderError::Timeout {
            after: Duration::from_secs(5),
            detail: String::new(),
        };
        assert_eq!(err.to_string(), "No termination after timeout! (5s)");

        let err = GraderError::Timeout {
            after: Duration::from_secs(1),
            detail: "MISSING 'hello'".into(),
        };
        assert!(err.to_string().ends_with("\nMISSING 'hello'"));
    }

    #[test]
    fn test_setup_classification() {
        assert!(GraderError::PortInUse { port: 1234 }.is_fatal());
        assert!(GraderError::SymbolNotFound("printk".into()).is_setup());
        assert!(!GraderError::SymbolNotFound("printk".into()).is_fatal());
        assert!(!GraderError::assertion("nope").is_setup());
        assert!(GraderError::Timeout {
            after: Duration::ZERO,
            detail: String::new()
        }
        .is_timeout());
    }

    #[test]
    fn test_attach_error_carries_target_output() {
        let err = GraderError::Attach {
            endpoint: "localhost:1234".into(),
            output: "OpenSBI v1.3\n".into(),
        };
        assert!(err.to_string().contains("output:\nOpenSBI v1.3"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: GraderError = io_err.into();
        match err {
            GraderError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::NotFound),
            _ => panic!("Expected Io variant"),
        }
    }
}
