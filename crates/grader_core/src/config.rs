use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::target::TargetCommand;

/// When to color OK/FAIL markers and matcher diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ColorMode {
    #[default]
    Auto,
    Always,
    Never,
}

impl FromStr for ColorMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "always" => Ok(Self::Always),
            "never" => Ok(Self::Never),
            other => Err(format!("invalid color mode '{other}', expected auto, always or never")),
        }
    }
}

impl ColorMode {
    pub fn enabled(self) -> bool {
        match self {
            Self::Auto => {
                std::io::stdout().is_terminal()
                    && std::env::var_os("TERM").is_some_and(|t| t != "dumb")
            }
            Self::Always => true,
            Self::Never => false,
        }
    }

    /// Wraps `text` in an ANSI color sequence when coloring is enabled.
    pub fn paint(self, color: Color, text: &str) -> String {
        if !self.enabled() {
            return text.to_string();
        }
        format!("\x1b[{}m{text}\x1b[0m", color.code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    Red,
    Green,
    Blue,
}

impl Color {
    fn code(self) -> &'static str {
        match self {
            Color::Red => "31",
            Color::Green => "32",
            Color::Blue => "34",
        }
    }
}

#[derive(Debug, Clone)]
pub struct GraderConfig {
    /// Directory holding the kernel tree; relative paths below resolve against it.
    pub test_dir: PathBuf,
    pub target_program: String,
    pub target_args: Vec<String>,
    pub gdb_program: String,
    pub gdb_args: Vec<String>,
    pub gdb_host: String,
    pub gdb_port: u16,
    pub kernel_image: PathBuf,
    pub symbol_files: Vec<PathBuf>,
    pub boot_timeout: Duration,
    /// Pause between the first console newline and launching the debugger.
    pub stub_settle: Duration,
    pub command_timeout: Duration,
    pub resume_reply_timeout: Duration,
    pub poll_interval: Duration,
    pub drain_timeout: Duration,
    pub color: ColorMode,
    pub results_path: Option<PathBuf>,
    pub transcript_dir: Option<PathBuf>,
}

impl Default for GraderConfig {
    fn default() -> Self {
        Self {
            test_dir: PathBuf::from("."),
            target_program: "make".to_string(),
            target_args: Vec::new(),
            gdb_program: "gdb-multiarch".to_string(),
            gdb_args: ["--nx", "--quiet", "--interpreter=mi3"]
                .into_iter()
                .map(String::from)
                .collect(),
            gdb_host: "localhost".to_string(),
            gdb_port: 1234,
            kernel_image: PathBuf::from("kernel/vmlinux"),
            symbol_files: vec![
                PathBuf::from("kernel/System.map"),
                PathBuf::from("kernel/kernel.sym"),
            ],
            boot_timeout: Duration::from_secs(90),
            stub_settle: Duration::from_millis(100),
            command_timeout: Duration::from_secs(10),
            resume_reply_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(100),
            drain_timeout: Duration::from_secs(5),
            color: ColorMode::Auto,
            results_path: None,
            transcript_dir: None,
        }
    }
}

impl GraderConfig {
    pub fn new(test_dir: impl Into<PathBuf>) -> Self {
        Self {
            test_dir: test_dir.into(),
            ..Self::default()
        }
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("GRADER_TEST_DIR") {
            config.test_dir = PathBuf::from(dir);
        }
        if let Ok(program) = std::env::var("GRADER_TARGET") {
            config.target_program = program;
        }
        if let Ok(program) = std::env::var("GRADER_GDB") {
            config.gdb_program = program;
        }
        if let Some(port) = std::env::var("GRADER_GDB_PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
        {
            config.gdb_port = port;
        }
        if let Ok(kernel) = std::env::var("GRADER_KERNEL") {
            config.kernel_image = PathBuf::from(kernel);
        }
        if let Some(timeout) = std::env::var("GRADER_BOOT_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
        {
            config.boot_timeout = timeout;
        }
        if let Ok(dir) = std::env::var("GRADER_TRANSCRIPT_DIR") {
            config.transcript_dir = Some(PathBuf::from(dir));
        }

        config
    }

    /// Resolves `path` against the test directory unless it is already absolute.
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.test_dir.join(path)
        }
    }

    pub fn gdb_endpoint(&self) -> String {
        format!("{}:{}", self.gdb_host, self.gdb_port)
    }

    /// Command line for one target launch: the configured program and arguments,
    /// then the per-run target name, then per-run extra arguments.
    pub fn target_command(&self, run_target: Option<&str>, extra_args: &[String]) -> TargetCommand {
        let mut args = self.target_args.clone();
        args.extend(run_target.map(String::from));
        args.extend(extra_args.iter().cloned());
        TargetCommand::new(self.target_program.clone(), args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GraderConfig::default();
        assert_eq!(config.gdb_program, "gdb-multiarch");
        assert_eq!(config.gdb_args, vec!["--nx", "--quiet", "--interpreter=mi3"]);
        assert_eq!(config.gdb_endpoint(), "localhost:1234");
        assert_eq!(config.boot_timeout, Duration::from_secs(90));
        assert_eq!(config.color, ColorMode::Auto);
    }

    #[test]
    fn test_resolve_relative_and_absolute() {
        let config = GraderConfig::new("/work/os");
        assert_eq!(config.resolve("kernel/vmlinux"), PathBuf::from("/work/os/kernel/vmlinux"));
        assert_eq!(config.resolve("/tmp/x"), PathBuf::from("/tmp/x"));
    }

    #[test]
    fn test_target_command_appends_run_target_then_extra_args() {
        let mut config = GraderConfig::default();
        config.target_args = vec!["-s".to_string()];
        let command = config.target_command(Some("debug"), &["LOG=1".to_string()]);
        assert_eq!(command.program, "make");
        assert_eq!(command.args, vec!["-s", "debug", "LOG=1"]);

        let command = config.target_command(None, &[]);
        assert_eq!(command.args, vec!["-s"]);
    }

    #[test]
    fn test_color_mode_parsing() {
        assert_eq!("ALWAYS".parse::<ColorMode>(), Ok(ColorMode::Always));
        assert_eq!("never".parse::<ColorMode>(), Ok(ColorMode::Never));
        assert!("sometimes".parse::<ColorMode>().is_err());
        assert_eq!(ColorMode::Never.paint(Color::Red, "FAIL"), "FAIL");
        assert_eq!(ColorMode::Always.paint(Color::Green, "OK"), "\x1b[32mOK\x1b[0m");
    }

    #[test]
    fn test_from_env_custom() {
        std::env::set_var("GRADER_GDB_PORT", "4321");
        std::env::set_var("GRADER_BOOT_TIMEOUT_MS", "5000");
        std::env::set_var("GRADER_GDB", "riscv64-elf-gdb");

        let config = GraderConfig::from_env();
        assert_eq!(config.gdb_port, 4321);
        assert_eq!(config.boot_timeout, Duration::from_millis(5000));
        assert_eq!(config.gdb_program, "riscv64-elf-gdb");

        std::env::remove_var("GRADER_GDB_PORT");
        std::env::remove_var("GRADER_BOOT_TIMEOUT_MS");
        std::env::remove_var("GRADER_GDB");
    }
}
