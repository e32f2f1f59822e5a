//! Grader Core
//!
//! Boots a kernel under an emulator, attaches GDB to the emulator's remote stub and
//! drives both processes as one event stream so lab tests can assert on breakpoint
//! hits, register state and console text within a deadline.

pub mod breakpoints;
pub mod config;
pub mod error;
pub mod gdb;
pub mod matcher;
pub mod mi;
pub mod monitor;
pub mod output;
pub mod report;
pub mod runner;
pub mod session;
pub mod suite;
pub mod symbols;
pub mod target;
pub mod transcript;

// Re-export commonly used types
pub use breakpoints::{BreakpointRegistry, Hits, Location};
pub use config::{ColorMode, GraderConfig};
pub use error::{assert_equal, GraderError, TestFailure};
pub use gdb::Debugger;
pub use matcher::OutputMatcher;
pub use runner::{RunMode, RunOptions, RunReport, Runner};
pub use session::{Phase, RunSession};
pub use suite::{Scoreboard, TestSuite};
pub use symbols::SymbolTable;

pub use futures_util::future::BoxFuture;
pub use futures_util::FutureExt;

/// Result type alias using GraderError
pub type Result<T> = std::result::Result<T, GraderError>;

/// What a callback asks the monitoring loop to do next.
///
/// `Stop` ends the run early. The run still succeeds unless a failure was already
/// recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    Stop,
}

impl Control {
    pub fn is_stop(self) -> bool {
        matches!(self, Control::Stop)
    }

    /// Combines the verdicts of several callbacks that saw the same event.
    pub fn merge(self, other: Control) -> Control {
        if self.is_stop() || other.is_stop() {
            Control::Stop
        } else {
            Control::Continue
        }
    }
}

/// Outcome of a breakpoint callback or output observer.
pub type CallbackResult = Result<Control>;
