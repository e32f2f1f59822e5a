#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use grader_core::{ColorMode, GraderConfig};

pub const PRINTK: u64 = 0xffff_ffe0_0020_0000;
pub const TRAP_HANDLER: u64 = 0xffff_ffe0_0020_0148;

const SYSTEM_MAP: &str = "\
ffffffe000200000 T printk
ffffffe000200148 T trap_handler
ffffffe000201000 D jiffies
";

/// A throwaway kernel tree with a symbol map and a shared event log that both the
/// fake debugger and the fake target append to.
pub struct Lab {
    pub dir: PathBuf,
    pub log: PathBuf,
}

impl Lab {
    pub fn new(name: &str) -> Self {
        let lab = Self::unbuilt(name);
        std::fs::create_dir_all(lab.dir.join("kernel")).expect("create kernel dir");
        std::fs::write(lab.dir.join("kernel/System.map"), SYSTEM_MAP).expect("write System.map");
        lab
    }

    /// A tree whose kernel has not been built yet: no symbol tables at all.
    pub fn unbuilt(name: &str) -> Self {
        let dir = Path::new(env!("CARGO_TARGET_TMPDIR"))
            .join(format!("{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).expect("create lab dir");
        let log = dir.join("events.log");
        Self { dir, log }
    }

    /// Config whose target runs `script` under `sh` and whose debugger is the fake
    /// MI peer started with `gdb_flags`.
    pub fn config(&self, script: &str, gdb_flags: &[&str]) -> GraderConfig {
        let mut config = GraderConfig::new(&self.dir);
        config.target_program = "sh".to_string();
        config.target_args = vec!["-c".to_string(), script.to_string()];
        config.gdb_program = "sh".to_string();
        config.gdb_args = std::iter::once(fixture().display().to_string())
            .chain(gdb_flags.iter().map(|f| f.to_string()))
            .chain(std::iter::once(format!("--log={}", self.log.display())))
            .collect();
        config.gdb_host = "127.0.0.1".to_string();
        config.gdb_port = free_port();
        config.boot_timeout = Duration::from_secs(5);
        config.stub_settle = Duration::from_millis(10);
        config.command_timeout = Duration::from_secs(2);
        config.resume_reply_timeout = Duration::from_secs(1);
        config.poll_interval = Duration::from_millis(10);
        config.drain_timeout = Duration::from_secs(2);
        config.color = ColorMode::Never;
        config
    }

    /// A target that prints `lines` (each may contain `\n`), then idles until
    /// SIGTERM, which it records in the event log.
    pub fn target(&self, lines: &str) -> String {
        format!(
            "trap 'echo target-term >> \"{}\"; exit 0' TERM; printf '{}'; sleep 30",
            self.log.display(),
            lines
        )
    }

    /// A target that runs `script` after arming the same SIGTERM trap as
    /// [`target`](Self::target). `on_term` runs inside the trap first.
    pub fn target_script(&self, on_term: &str, script: &str) -> String {
        format!(
            "trap '{on_term} echo target-term >> \"{}\"; exit 0' TERM; {script}; sleep 30",
            self.log.display()
        )
    }

    pub fn events(&self) -> Vec<String> {
        std::fs::read_to_string(&self.log)
            .map(|text| text.lines().map(String::from).collect())
            .unwrap_or_default()
    }

    pub fn position(&self, event: &str) -> Option<usize> {
        self.events().iter().position(|e| e.starts_with(event))
    }
}

impl Drop for Lab {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

pub fn fixture() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/fake_gdb.sh")
}

pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|l| l.local_addr())
        .map(|a| a.port())
        .expect("bind ephemeral port")
}

pub fn stop_at(address: u64) -> String {
    format!("--stop={address:#x}")
}
