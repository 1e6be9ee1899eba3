//! The suite tree: projects, files, describe groups and test cases.
//!
//! The tree is built by the [`loader`](crate::loader) and is read-only from
//! then on. Invariants: exactly one `Root`; `Project` sits directly under the
//! root; `File` under a project; `Describe` under a file or another describe.
//! Option inheritance and test identity are derived by walking the tree from
//! the root, so nodes carry no parent pointers.
//!
//! Test ids are stable across runs and across the orchestrator/worker
//! boundary: both sides build the same tree from the same registration
//! functions and the same id assignment pass.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::shell::Shell;
use crate::snapshot::SnapshotStatus;
use crate::term::TestRun;

/// A test body: an async closure over the per-attempt [`TestRun`].
pub type TestBody = Arc<dyn Fn(TestRun) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Node kinds of the suite tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuiteKind {
    Root,
    Project,
    File,
    Describe,
}

/// Declaration-time annotation on a test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Annotation {
    /// Run only annotated tests (global gate).
    Only,
    /// Keep the test in the set but never dispatch it.
    Skip,
    /// The test is expected to fail; success becomes a failure.
    Fail,
}

/// Per-test options, inherited down the tree with nearest-ancestor wins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestOptions {
    pub shell: Option<Shell>,
    pub rows: Option<u16>,
    pub columns: Option<u16>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl TestOptions {
    pub fn new() -> TestOptions {
        TestOptions::default()
    }

    pub fn shell(mut self, shell: Shell) -> TestOptions {
        self.shell = Some(shell);
        self
    }

    pub fn rows(mut self, rows: u16) -> TestOptions {
        self.rows = Some(rows);
        self
    }

    pub fn columns(mut self, columns: u16) -> TestOptions {
        self.columns = Some(columns);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> TestOptions {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> TestOptions {
        self.cwd = Some(cwd.into());
        self
    }

    /// Shallow merge: `child` wins per key; env maps merge key-wise.
    pub fn overlay(&self, child: &TestOptions) -> TestOptions {
        let mut env = self.env.clone();
        env.extend(child.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        TestOptions {
            shell: child.shell.or(self.shell),
            rows: child.rows.or(self.rows),
            columns: child.columns.or(self.columns),
            env,
            cwd: child.cwd.clone().or_else(|| self.cwd.clone()),
        }
    }
}

/// Status of one attempt, and of a test's overall outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Expected,
    Unexpected,
    Pending,
    Skipped,
    Flaky,
}

/// The record of a single attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub status: Status,
    pub error: Option<String>,
    pub duration: Duration,
    pub snapshots: Vec<SnapshotStatus>,
}

/// A single declared test.
pub struct TestCase {
    /// Stable identity derived from the title path; assigned by
    /// [`Suite::finalize`].
    pub id: String,
    pub title: String,
    /// `(row, column)` of the declaration; `(0, 0)` when unavailable.
    pub location: (u32, u32),
    pub annotation: Option<Annotation>,
    pub(crate) body: TestBody,
    results: Mutex<Vec<TestResult>>,
}

impl TestCase {
    pub(crate) fn new(
        title: String,
        location: (u32, u32),
        annotation: Option<Annotation>,
        body: TestBody,
    ) -> TestCase {
        TestCase {
            id: String::new(),
            title,
            location,
            annotation,
            body,
            results: Mutex::new(Vec::new()),
        }
    }

    /// Appends the result of one attempt.
    pub fn push_result(&self, result: TestResult) {
        self.results.lock().unwrap().push(result);
    }

    /// All attempt results recorded so far, in attempt order.
    pub fn results(&self) -> Vec<TestResult> {
        self.results.lock().unwrap().clone()
    }

    /// Folds the attempt results into the overall outcome.
    ///
    /// No results means the test never ran: `Skipped`. Any transition from
    /// `Unexpected` to `Expected`, or from `Expected` to anything else, marks
    /// the test `Flaky`; otherwise the outcome is the final status.
    pub fn outcome(&self) -> Status {
        let results = self.results.lock().unwrap();
        let mut statuses = results.iter().map(|r| r.status);
        let Some(first) = statuses.next() else {
            return Status::Skipped;
        };
        let mut prev = first;
        let mut flaky = false;
        for status in statuses {
            if (prev == Status::Unexpected && status == Status::Expected)
                || (prev == Status::Expected && status != Status::Expected)
            {
                flaky = true;
            }
            prev = status;
        }
        if flaky { Status::Flaky } else { prev }
    }
}

impl std::fmt::Debug for TestCase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestCase")
            .field("id", &self.id)
            .field("title", &self.title)
            .field("location", &self.location)
            .field("annotation", &self.annotation)
            .finish_non_exhaustive()
    }
}

/// A node of the suite tree.
pub struct Suite {
    pub title: String,
    pub kind: SuiteKind,
    pub options: TestOptions,
    /// Resolved loadable path; `Some` only for `File` suites.
    pub source: Option<PathBuf>,
    pub suites: Vec<Suite>,
    pub tests: Vec<TestCase>,
    pub(crate) before_each: Vec<TestBody>,
    pub(crate) after_each: Vec<TestBody>,
}

impl Suite {
    pub fn new(kind: SuiteKind, title: impl Into<String>) -> Suite {
        Suite {
            title: title.into(),
            kind,
            options: TestOptions::default(),
            source: None,
            suites: Vec::new(),
            tests: Vec::new(),
            before_each: Vec::new(),
            after_each: Vec::new(),
        }
    }

    /// All tests in depth-first pre-order.
    pub fn all_tests(&self) -> Vec<&TestCase> {
        let mut out = Vec::new();
        self.walk_tests(&mut out);
        out
    }

    fn walk_tests<'a>(&'a self, out: &mut Vec<&'a TestCase>) {
        out.extend(self.tests.iter());
        for suite in &self.suites {
            suite.walk_tests(out);
        }
    }

    /// Assigns stable ids to every test in the subtree.
    ///
    /// The id is the title path joined with `" > "`: `[project-title]` for
    /// projects with a non-empty title, `file-title:row:row` at the file node
    /// (the declaration row twice, kept for compatibility with existing
    /// snapshot keys), describe titles in declaration order, then the test
    /// title.
    pub fn finalize(&mut self) {
        let mut chain = Vec::new();
        self.assign_ids(&mut chain);
    }

    fn assign_ids(&mut self, chain: &mut Vec<(SuiteKind, String)>) {
        let pushed = !matches!(self.kind, SuiteKind::Root);
        if pushed {
            chain.push((self.kind, self.title.clone()));
        }
        for test in &mut self.tests {
            test.id = compose_id(chain, &test.title, test.location.0);
        }
        for suite in &mut self.suites {
            suite.assign_ids(chain);
        }
        if pushed {
            chain.pop();
        }
    }

    /// Flattens the tree into dispatchable tests with their context.
    pub fn plan(&self) -> Vec<PlannedTest<'_>> {
        let mut out = Vec::new();
        self.plan_rec(None, None, &TestOptions::default(), &mut out);
        out
    }

    fn plan_rec<'a>(
        &'a self,
        project: Option<&'a Suite>,
        file: Option<&'a Suite>,
        inherited: &TestOptions,
        out: &mut Vec<PlannedTest<'a>>,
    ) {
        let acc = inherited.overlay(&self.options);
        let project = if self.kind == SuiteKind::Project { Some(self) } else { project };
        let file = if self.kind == SuiteKind::File { Some(self) } else { file };
        if let Some(file) = file {
            for test in &self.tests {
                out.push(PlannedTest { test, options: acc.clone(), file, project });
            }
        }
        for suite in &self.suites {
            suite.plan_rec(project, file, &acc, out);
        }
    }

    /// Finds a test anywhere in the subtree by id.
    pub fn find_test(&self, id: &str) -> Option<&TestCase> {
        self.tests
            .iter()
            .find(|t| t.id == id)
            .or_else(|| self.suites.iter().find_map(|s| s.find_test(id)))
    }

    /// Looks up a test by id, resolving its effective options and hook
    /// chains along the way. Used by workers after re-registering a file.
    pub fn resolve(&self, id: &str) -> Option<ResolvedTest<'_>> {
        let mut before = Vec::new();
        let mut after = Vec::new();
        self.resolve_rec(id, &TestOptions::default(), &mut before, &mut after)
    }

    fn resolve_rec<'a>(
        &'a self,
        id: &str,
        inherited: &TestOptions,
        before: &mut Vec<TestBody>,
        after: &mut Vec<TestBody>,
    ) -> Option<ResolvedTest<'a>> {
        let acc = inherited.overlay(&self.options);
        before.extend(self.before_each.iter().cloned());
        after.extend(self.after_each.iter().cloned());

        for test in &self.tests {
            if test.id == id {
                // after_each runs innermost-first.
                let mut after_each = after.clone();
                after_each.reverse();
                return Some(ResolvedTest {
                    test,
                    options: acc,
                    before_each: before.clone(),
                    after_each,
                });
            }
        }
        for suite in &self.suites {
            if let Some(found) = suite.resolve_rec(id, &acc, before, after) {
                return Some(found);
            }
        }

        before.truncate(before.len() - self.before_each.len());
        after.truncate(after.len() - self.after_each.len());
        None
    }
}

impl std::fmt::Debug for Suite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Suite")
            .field("title", &self.title)
            .field("kind", &self.kind)
            .field("suites", &self.suites)
            .field("tests", &self.tests)
            .finish_non_exhaustive()
    }
}

fn compose_id(chain: &[(SuiteKind, String)], title: &str, row: u32) -> String {
    let mut parts = Vec::new();
    for (kind, node_title) in chain {
        match kind {
            SuiteKind::Project if !node_title.is_empty() => {
                parts.push(format!("[{node_title}]"));
            }
            SuiteKind::Project | SuiteKind::Root => {}
            SuiteKind::File => parts.push(format!("{node_title}:{row}:{row}")),
            SuiteKind::Describe => parts.push(node_title.clone()),
        }
    }
    parts.push(title.to_string());
    parts.join(" > ")
}

/// A test selected for dispatch, with its resolved context.
pub struct PlannedTest<'a> {
    pub test: &'a TestCase,
    /// Effective options: shallow merge of ancestor options, nearest wins.
    pub options: TestOptions,
    pub file: &'a Suite,
    pub project: Option<&'a Suite>,
}

impl PlannedTest<'_> {
    /// The shell this test will spawn.
    pub fn shell(&self) -> Shell {
        self.options.shell.unwrap_or_else(Shell::platform_default)
    }
}

/// A test located by a worker, ready to run.
pub struct ResolvedTest<'a> {
    pub test: &'a TestCase,
    pub options: TestOptions,
    pub before_each: Vec<TestBody>,
    pub after_each: Vec<TestBody>,
}

/// Whether an overall outcome should fail the run.
pub fn counts_as_failure(outcome: Status, fail_on_flaky: bool) -> bool {
    match outcome {
        Status::Unexpected | Status::Pending => true,
        Status::Flaky => fail_on_flaky,
        Status::Expected | Status::Skipped => false,
    }
}

#[cfg(test)]
pub(crate) fn stub_body() -> TestBody {
    Arc::new(|_run| Box::pin(async { Ok(()) }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(status: Status) -> TestResult {
        TestResult { status, error: None, duration: Duration::ZERO, snapshots: Vec::new() }
    }

    fn tree() -> Suite {
        let mut root = Suite::new(SuiteKind::Root, "");
        let mut project = Suite::new(SuiteKind::Project, "shells");
        project.options = TestOptions::new().shell(Shell::Zsh).rows(24);

        let mut file = Suite::new(SuiteKind::File, "tests/ui/prompt.rs");
        file.source = Some(PathBuf::from("tests/ui/prompt.rs"));
        file.tests.push(TestCase::new("shows prompt".into(), (3, 5), None, stub_body()));

        let mut group = Suite::new(SuiteKind::Describe, "editing");
        group.options = TestOptions::new().rows(50).env("LANG", "C");
        group
            .tests
            .push(TestCase::new("inserts".into(), (9, 5), Some(Annotation::Skip), stub_body()));
        file.suites.push(group);

        project.suites.push(file);
        root.suites.push(project);
        root.finalize();
        root
    }

    #[test]
    fn ids_follow_the_title_path() {
        let root = tree();
        let tests = root.all_tests();
        assert_eq!(tests[0].id, "[shells] > tests/ui/prompt.rs:3:3 > shows prompt");
        assert_eq!(tests[1].id, "[shells] > tests/ui/prompt.rs:9:9 > editing > inserts");
    }

    #[test]
    fn ids_are_unique_and_stable() {
        let a = tree();
        let b = tree();
        let ids_a: Vec<_> = a.all_tests().iter().map(|t| t.id.clone()).collect();
        let ids_b: Vec<_> = b.all_tests().iter().map(|t| t.id.clone()).collect();
        assert_eq!(ids_a, ids_b);
        let mut deduped = ids_a.clone();
        deduped.dedup();
        assert_eq!(ids_a, deduped);
    }

    #[test]
    fn empty_project_title_is_omitted_from_ids() {
        let mut root = Suite::new(SuiteKind::Root, "");
        let mut project = Suite::new(SuiteKind::Project, "");
        let mut file = Suite::new(SuiteKind::File, "t.rs");
        file.tests.push(TestCase::new("x".into(), (1, 1), None, stub_body()));
        project.suites.push(file);
        root.suites.push(project);
        root.finalize();

        assert_eq!(root.all_tests()[0].id, "t.rs:1:1 > x");
    }

    #[test]
    fn effective_options_merge_nearest_wins() {
        let root = tree();
        let planned = root.plan();

        // File-level test inherits the project options.
        assert_eq!(planned[0].options.shell, Some(Shell::Zsh));
        assert_eq!(planned[0].options.rows, Some(24));
        assert_eq!(planned[0].options.columns, None);

        // Describe-level test overrides rows, keeps shell, adds env.
        assert_eq!(planned[1].options.shell, Some(Shell::Zsh));
        assert_eq!(planned[1].options.rows, Some(50));
        assert_eq!(planned[1].options.env.get("LANG").map(String::as_str), Some("C"));
    }

    #[test]
    fn plan_is_preorder_and_carries_file_context() {
        let root = tree();
        let planned = root.plan();
        assert_eq!(planned.len(), 2);
        assert_eq!(planned[0].test.title, "shows prompt");
        assert_eq!(planned[1].test.title, "inserts");
        assert_eq!(planned[0].file.title, "tests/ui/prompt.rs");
        assert_eq!(planned[0].project.unwrap().title, "shells");
    }

    #[test]
    fn resolve_finds_test_with_effective_options() {
        let root = tree();
        let resolved = root
            .resolve("[shells] > tests/ui/prompt.rs:9:9 > editing > inserts")
            .unwrap();
        assert_eq!(resolved.test.title, "inserts");
        assert_eq!(resolved.options.rows, Some(50));
        assert!(root.resolve("no such id").is_none());
    }

    #[test]
    fn outcome_fold_matches_the_documented_rule() {
        let test = TestCase::new("t".into(), (0, 0), None, stub_body());
        assert_eq!(test.outcome(), Status::Skipped);

        test.push_result(result(Status::Unexpected));
        assert_eq!(test.outcome(), Status::Unexpected);

        test.push_result(result(Status::Expected));
        assert_eq!(test.outcome(), Status::Flaky);
    }

    #[test]
    fn outcome_expected_then_unexpected_is_flaky() {
        let test = TestCase::new("t".into(), (0, 0), None, stub_body());
        test.push_result(result(Status::Expected));
        test.push_result(result(Status::Unexpected));
        assert_eq!(test.outcome(), Status::Flaky);
    }

    #[test]
    fn outcome_single_expected_is_expected() {
        let test = TestCase::new("t".into(), (0, 0), None, stub_body());
        test.push_result(result(Status::Expected));
        assert_eq!(test.outcome(), Status::Expected);
    }

    #[test]
    fn failure_counting_respects_flaky_config() {
        assert!(counts_as_failure(Status::Unexpected, false));
        assert!(!counts_as_failure(Status::Flaky, false));
        assert!(counts_as_failure(Status::Flaky, true));
        assert!(!counts_as_failure(Status::Skipped, false));
        assert!(!counts_as_failure(Status::Expected, false));
    }

    #[test]
    fn overlay_env_merges_keywise() {
        let parent = TestOptions::new().env("A", "1").env("B", "1");
        let child = TestOptions::new().env("B", "2").env("C", "3");
        let merged = parent.overlay(&child);
        assert_eq!(merged.env.get("A").map(String::as_str), Some("1"));
        assert_eq!(merged.env.get("B").map(String::as_str), Some("2"));
        assert_eq!(merged.env.get("C").map(String::as_str), Some("3"));
    }
}
