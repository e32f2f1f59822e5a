//! Points-based test harness for lab tests.
//!
//! Tests run in registration order and print a one-line verdict each. A test may
//! depend on a parent, which is run first and fails the child when it fails.

use std::collections::BTreeMap;
use std::io::Write;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use tracing::error;

use crate::config::{Color, ColorMode};
use crate::runner::Runner;
use crate::Result;

const SHOW_ELAPSED_AFTER: Duration = Duration::from_millis(100);

pub type TestBody = Box<dyn for<'a> Fn(&'a Runner) -> BoxFuture<'a, Result<()>> + Send + Sync>;

/// Boxes a closure as a [`TestBody`].
pub fn test_body<F>(f: F) -> TestBody
where
    F: for<'a> Fn(&'a Runner) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
{
    Box::new(f)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestId(usize);

struct TestCase {
    title: String,
    points: u32,
    parent: Option<TestId>,
    body: TestBody,
}

enum Item {
    Test(TestId),
    Part(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scoreboard {
    pub total: u32,
    pub possible: u32,
    pub grades: BTreeMap<String, u32>,
    /// Set when a setup error made the remaining tests pointless.
    pub aborted: Option<String>,
}

impl Scoreboard {
    pub fn passed(&self) -> bool {
        self.total >= self.possible && self.aborted.is_none()
    }

    pub fn absorb(&mut self, other: Scoreboard) {
        self.total += other.total;
        self.possible += other.possible;
        self.grades.extend(other.grades);
        if self.aborted.is_none() {
            self.aborted = other.aborted;
        }
    }
}

pub struct TestSuite {
    name: String,
    tests: Vec<TestCase>,
    items: Vec<Item>,
    color: ColorMode,
}

struct RunState {
    board: Scoreboard,
    outcomes: Vec<Option<bool>>,
    part_total: u32,
    part_possible: u32,
}

impl TestSuite {
    pub fn new(name: impl Into<String>, color: ColorMode) -> Self {
        Self {
            name: name.into(),
            tests: Vec::new(),
            items: Vec::new(),
            color,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of registered tests, not counting part markers.
    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    pub fn test(&mut self, points: u32, title: impl Into<String>, body: TestBody) -> TestId {
        self.push(points, title.into(), None, body)
    }

    /// Registers a test that only passes if `parent` passed. Its title is indented.
    pub fn test_after(
        &mut self,
        parent: TestId,
        points: u32,
        title: impl Into<String>,
        body: TestBody,
    ) -> TestId {
        self.push(points, format!("  {}", title.into()), Some(parent), body)
    }

    fn push(
        &mut self,
        points: u32,
        title: String,
        parent: Option<TestId>,
        body: TestBody,
    ) -> TestId {
        let id = TestId(self.tests.len());
        self.tests.push(TestCase {
            title,
            points,
            parent,
            body,
        });
        self.items.push(Item::Test(id));
        id
    }

    /// Prints the score earned since the previous part.
    pub fn end_part(&mut self, name: impl Into<String>) {
        self.items.push(Item::Part(name.into()));
    }

    /// Runs the tests whose title contains one of `filters` (all when empty).
    ///
    /// Part summaries and the final score are printed only for unfiltered runs. A
    /// fatal setup error stops the suite.
    pub async fn run(&self, runner: &Runner, filters: &[String]) -> Scoreboard {
        let limit: Vec<String> = filters.iter().map(|f| f.to_lowercase()).collect();
        let mut state = RunState {
            board: Scoreboard::default(),
            outcomes: vec![None; self.tests.len()],
            part_total: 0,
            part_possible: 0,
        };

        for item in &self.items {
            if state.board.aborted.is_some() {
                break;
            }
            match item {
                Item::Test(id) => {
                    let title = self.tests[id.0].title.to_lowercase();
                    if limit.is_empty() || limit.iter().any(|l| title.contains(l.as_str())) {
                        self.run_with_ancestors(*id, runner, &mut state).await;
                    }
                }
                Item::Part(name) if limit.is_empty() => {
                    println!(
                        "Part {name} score: {}/{}",
                        state.board.total - state.part_total,
                        state.board.possible - state.part_possible
                    );
                    println!();
                    state.part_total = state.board.total;
                    state.part_possible = state.board.possible;
                }
                Item::Part(_) => {}
            }
        }

        if let Some(reason) = &state.board.aborted {
            error!("{} aborted: {reason}", self.name);
        } else if limit.is_empty() {
            println!("Score: {}/{}", state.board.total, state.board.possible);
        }
        state.board
    }

    async fn run_with_ancestors(&self, id: TestId, runner: &Runner, state: &mut RunState) {
        let mut chain = vec![id];
        let mut cursor = self.tests[id.0].parent;
        while let Some(parent) = cursor {
            if state.outcomes[parent.0].is_some() {
                break;
            }
            chain.push(parent);
            cursor = self.tests[parent.0].parent;
        }

        for id in chain.into_iter().rev() {
            if state.outcomes[id.0].is_some() || state.board.aborted.is_some() {
                continue;
            }
            self.run_one(id, runner, state).await;
        }
    }

    async fn run_one(&self, id: TestId, runner: &Runner, state: &mut RunState) {
        let case = &self.tests[id.0];
        print!("== Test {} == ", case.title);
        if case.parent.is_some() {
            println!();
        }
        let _ = std::io::stdout().flush();

        let started = Instant::now();
        let parent_failed = case
            .parent
            .filter(|parent| state.outcomes[parent.0] == Some(false));
        let failure = match parent_failed {
            Some(parent) => Some(format!(
                "Parent failed: {}",
                self.tests[parent.0].title.trim_start()
            )),
            None => {
                runner.set_current_test(Some(file_stem(&case.title)));
                let result = (case.body)(runner).await;
                runner.set_current_test(None);
                match result {
                    Ok(()) => None,
                    Err(e) => {
                        if e.is_fatal() {
                            state.board.aborted = Some(e.to_string());
                        }
                        Some(e.to_string())
                    }
                }
            }
        };
        let elapsed = started.elapsed();

        state.board.possible += case.points;
        let mut line = String::new();
        if case.points > 0 {
            let status = match failure {
                Some(_) => self.color.paint(Color::Red, "FAIL"),
                None => self.color.paint(Color::Green, "OK"),
            };
            line.push_str(&format!("{}: {status} ", case.title));
        }
        if elapsed > SHOW_ELAPSED_AFTER {
            line.push_str(&format!("({:.1}s) ", elapsed.as_secs_f64()));
        }
        println!("{line}");

        match &failure {
            Some(message) => println!("    {}", message.replace('\n', "\n    ")),
            None => state.board.total += case.points,
        }
        if case.points > 0 {
            let grade = if failure.is_some() { 0 } else { case.points };
            state.board.grades.insert(case.title.clone(), grade);
        }
        state.outcomes[id.0] = Some(failure.is_none());
    }
}

/// `hello output` becomes `hello_output`.
fn file_stem(title: &str) -> String {
    title.split_whitespace().collect::<Vec<_>>().join("_")
}
