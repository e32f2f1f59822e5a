mod labs;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::Parser;
use grader_core::report::write_results;
use grader_core::{ColorMode, GraderConfig, Runner, Scoreboard};
use tracing::{debug, Level};

#[derive(Parser, Debug)]
#[command(name = "grader", about = "Grades kernel labs by booting them under QEMU and GDB")]
struct Cli {
    /// Log every debugger command, record and run phase
    #[arg(short, long)]
    verbose: bool,

    /// Color OK/FAIL markers: auto, always or never
    #[arg(long, default_value = "auto")]
    color: ColorMode,

    /// Write per-test grades to this JSON file
    #[arg(long)]
    results: Option<PathBuf>,

    /// Kernel source tree to run `make` in
    #[arg(long)]
    test_dir: Option<PathBuf>,

    /// Lab to grade, e.g. `lab1`; defaults to CI_COMMIT_BRANCH or the git branch
    #[arg(long)]
    lab: Option<String>,

    /// Only run tests whose title contains one of these (case-insensitive)
    filters: Vec<String>,
}

impl Cli {
    fn config(&self) -> GraderConfig {
        let mut config = GraderConfig::from_env();
        if let Some(dir) = &self.test_dir {
            config.test_dir = dir.clone();
        }
        config.color = self.color;
        config.results_path = self.results.clone();
        config
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::WARN })
        .init();

    let config = cli.config();
    let Some(lab) = select_lab(cli.lab.as_deref(), &config.test_dir) else {
        println!("Could not determine lab number.");
        return Ok(ExitCode::FAILURE);
    };

    let runner = Runner::new(config.clone());
    let mut board = Scoreboard::default();
    for number in 1..=lab {
        println!("Running tests for lab{number}");
        let Some(suite) = labs::suite(number, config.color) else {
            println!("Could not find tests for lab{number}");
            continue;
        };
        board.absorb(suite.run(&runner, &cli.filters).await);
        if let Some(reason) = &board.aborted {
            println!("An error occurred while running tests for lab{number}: {reason}");
            break;
        }
    }

    if cli.filters.is_empty() {
        if let Some(path) = &config.results_path {
            if let Err(e) = write_results(path, &board.grades).await {
                println!("Provided a bad results path. Error: {e}");
            }
        }
    }

    println!("Total Score: {}/{}", board.total, board.possible);
    Ok(if board.passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Lab number from `--lab`, then `CI_COMMIT_BRANCH`, then the checked out branch.
fn select_lab(flag: Option<&str>, repo: &Path) -> Option<u32> {
    if let Some(lab) = flag.and_then(labs::parse_lab) {
        return Some(lab);
    }
    if let Some(lab) = std::env::var("CI_COMMIT_BRANCH")
        .ok()
        .as_deref()
        .and_then(labs::parse_lab)
    {
        return Some(lab);
    }
    match current_branch(repo) {
        Ok(branch) => labs::parse_lab(&branch),
        Err(e) => {
            debug!("no branch to pick a lab from: {e:#}");
            None
        }
    }
}

fn current_branch(repo: &Path) -> Result<String> {
    let output = std::process::Command::new("git")
        .args(["rev-parse", "--abbrev-ref", "HEAD"])
        .current_dir(repo)
        .output()
        .context("failed to run git")?;
    if !output.status.success() {
        bail!("git rev-parse exited with {}", output.status);
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
