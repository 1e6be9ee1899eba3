//! Building the suite tree from registered test files.
//!
//! Test files are compiled into the harness binary and expose a registration
//! function; [`FileSpec`] pairs that function with the file's source path.
//! Loading a file means creating its `File` suite, installing it as the
//! ambient suite at the bottom of a [`Dsl`] stack, and running the
//! registration function; every declaration call mutates the suite on top
//! of the stack. The same code path runs in the orchestrator (to enumerate
//! tests) and in each worker (to rebuild the file it was asked to run), so
//! ids line up on both sides.

use std::future::Future;
use std::panic::Location;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::debug;

use crate::cache;
use crate::config::{Config, ProjectConfig};
use crate::suite::{Annotation, Suite, SuiteKind, TestBody, TestCase, TestOptions};
use crate::term::TestRun;

/// A test file compiled into the harness binary.
#[derive(Clone, Copy)]
pub struct FileSpec {
    /// Source path of the file, relative to the project root. Used for
    /// project matching, filters, identity and snapshot placement.
    pub path: &'static str,
    /// Registration function; runs once per process per file.
    pub register: fn(&mut Dsl),
}

impl FileSpec {
    pub const fn new(path: &'static str, register: fn(&mut Dsl)) -> FileSpec {
        FileSpec { path, register }
    }
}

/// The ambient-suite stack handed to registration functions.
///
/// The suite on top of the stack is the one declarations append to;
/// [`describe`](Dsl::describe) pushes a child suite for the duration of its
/// body. Hooks receive a [`TestRun`], not a `Dsl`, so suite-level options
/// cannot be rewritten from inside a hook.
pub struct Dsl {
    stack: Vec<Suite>,
}

impl Dsl {
    fn ambient(&mut self) -> &mut Suite {
        self.stack.last_mut().expect("ambient suite stack is never empty")
    }

    /// Declares a test.
    #[track_caller]
    pub fn test<F, Fut>(&mut self, title: impl Into<String>, body: F)
    where
        F: Fn(TestRun) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let location = caller_location();
        self.push_test(title.into(), location, None, into_body(body));
    }

    /// Declares a test and gates the run to annotated tests only.
    #[track_caller]
    pub fn only<F, Fut>(&mut self, title: impl Into<String>, body: F)
    where
        F: Fn(TestRun) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let location = caller_location();
        self.push_test(title.into(), location, Some(Annotation::Only), into_body(body));
    }

    /// Declares a test that is reported but never dispatched.
    #[track_caller]
    pub fn skip<F, Fut>(&mut self, title: impl Into<String>, body: F)
    where
        F: Fn(TestRun) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let location = caller_location();
        self.push_test(title.into(), location, Some(Annotation::Skip), into_body(body));
    }

    /// Declares a test that is expected to fail.
    #[track_caller]
    pub fn fail<F, Fut>(&mut self, title: impl Into<String>, body: F)
    where
        F: Fn(TestRun) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let location = caller_location();
        self.push_test(title.into(), location, Some(Annotation::Fail), into_body(body));
    }

    /// Opens a describe group: declarations inside `body` land in a child
    /// suite.
    pub fn describe(&mut self, title: impl Into<String>, body: impl FnOnce(&mut Dsl)) {
        self.stack.push(Suite::new(SuiteKind::Describe, title));
        body(self);
        let suite = self.stack.pop().expect("describe suite was pushed above");
        self.ambient().suites.push(suite);
    }

    /// Merges options into the ambient suite; inherited by everything
    /// declared below it.
    pub fn use_options(&mut self, options: TestOptions) {
        let ambient = self.ambient();
        ambient.options = ambient.options.overlay(&options);
    }

    /// Runs before every test declared in the ambient suite's subtree.
    pub fn before_each<F, Fut>(&mut self, hook: F)
    where
        F: Fn(TestRun) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.ambient().before_each.push(into_body(hook));
    }

    /// Runs after every test declared in the ambient suite's subtree,
    /// innermost group first.
    pub fn after_each<F, Fut>(&mut self, hook: F)
    where
        F: Fn(TestRun) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.ambient().after_each.push(into_body(hook));
    }

    fn push_test(
        &mut self,
        title: String,
        location: (u32, u32),
        annotation: Option<Annotation>,
        body: TestBody,
    ) {
        self.ambient().tests.push(TestCase::new(title, location, annotation, body));
    }
}

fn into_body<F, Fut>(f: F) -> TestBody
where
    F: Fn(TestRun) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |run| Box::pin(f(run)))
}

#[track_caller]
fn caller_location() -> (u32, u32) {
    let location = Location::caller();
    (location.line(), location.column())
}

/// Evaluates one registered file into its `File` suite.
pub(crate) fn load_file(spec: &FileSpec, cwd: &Path) -> Suite {
    let mut file = Suite::new(SuiteKind::File, spec.path);
    file.source = Some(cache::resolve(Path::new(spec.path), cwd));

    let mut dsl = Dsl { stack: vec![file] };
    (spec.register)(&mut dsl);
    debug_assert_eq!(dsl.stack.len(), 1, "describe stack must unwind");
    dsl.stack.pop().expect("file suite was pushed above")
}

/// Builds the full suite tree for a run: one `Project` node per configured
/// project (or a single anonymous one), each holding the registered files
/// its `test-match` globs select.
pub fn load(config: &Config, files: &[FileSpec], cwd: &Path) -> Result<Suite> {
    let projects = if config.projects.is_empty() {
        vec![ProjectConfig::default()]
    } else {
        config.projects.clone()
    };

    let mut root = Suite::new(SuiteKind::Root, "");
    for project_config in &projects {
        let matchers = compile_globs(&project_config.test_match)?;

        let mut project = Suite::new(SuiteKind::Project, project_config.name.clone());
        project.options = project_config.use_options.clone();

        for spec in files {
            if matches_any(&matchers, spec.path) {
                project.suites.push(load_file(spec, cwd));
            }
        }
        debug!(
            "project {:?} selected {} file(s)",
            project_config.name,
            project.suites.len()
        );
        root.suites.push(project);
    }

    root.finalize();
    Ok(root)
}

fn compile_globs(patterns: &[String]) -> Result<Vec<glob::Pattern>> {
    patterns
        .iter()
        .map(|p| {
            glob::Pattern::new(p).with_context(|| format!("invalid test-match pattern {p:?}"))
        })
        .collect()
}

fn matches_any(matchers: &[glob::Pattern], path: &str) -> bool {
    // No patterns means the project takes every registered file.
    if matchers.is_empty() {
        return true;
    }
    matchers.iter().any(|m| m.matches(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::Shell;
    use tempfile::TempDir;

    fn register_demo(t: &mut Dsl) {
        t.use_options(TestOptions::new().shell(Shell::Fish).rows(20));
        t.test("top level", |_run| async { Ok(()) });
        t.skip("skipped", |_run| async { Ok(()) });
        t.describe("group", |t| {
            t.use_options(TestOptions::new().rows(40));
            t.fail("fails on purpose", |_run| async { Ok(()) });
            t.describe("nested", |t| {
                t.only("focused", |_run| async { Ok(()) });
            });
        });
    }

    fn load_demo() -> Suite {
        let dir = TempDir::new().unwrap();
        let config = Config::default();
        let files = [FileSpec::new("tests/ui/demo.rs", register_demo)];
        load(&config, &files, dir.path()).unwrap()
    }

    #[test]
    fn registration_builds_the_expected_shape() {
        let root = load_demo();
        assert_eq!(root.kind, SuiteKind::Root);
        assert_eq!(root.suites.len(), 1); // anonymous project

        let project = &root.suites[0];
        assert_eq!(project.kind, SuiteKind::Project);
        assert_eq!(project.title, "");

        let file = &project.suites[0];
        assert_eq!(file.kind, SuiteKind::File);
        assert_eq!(file.title, "tests/ui/demo.rs");
        assert_eq!(file.tests.len(), 2);
        assert_eq!(file.suites.len(), 1);

        let group = &file.suites[0];
        assert_eq!(group.title, "group");
        assert_eq!(group.suites[0].title, "nested");
    }

    #[test]
    fn annotations_and_options_are_recorded() {
        let root = load_demo();
        let tests = root.all_tests();
        assert_eq!(tests[0].annotation, None);
        assert_eq!(tests[1].annotation, Some(Annotation::Skip));
        assert_eq!(tests[2].annotation, Some(Annotation::Fail));
        assert_eq!(tests[3].annotation, Some(Annotation::Only));

        let planned = root.plan();
        // use_options at file level, overridden inside the group.
        assert_eq!(planned[0].options.shell, Some(Shell::Fish));
        assert_eq!(planned[0].options.rows, Some(20));
        assert_eq!(planned[2].options.rows, Some(40));
    }

    #[test]
    fn declaration_locations_are_captured() {
        let root = load_demo();
        for test in root.all_tests() {
            assert!(test.location.0 > 0, "row must come from the call site");
        }
    }

    #[test]
    fn ids_embed_file_path_and_describe_chain() {
        let root = load_demo();
        let tests = root.all_tests();
        let row = tests[3].location.0;
        assert_eq!(
            tests[3].id,
            format!("tests/ui/demo.rs:{row}:{row} > group > nested > focused")
        );
    }

    #[test]
    fn worker_and_orchestrator_loads_agree_on_ids() {
        let a = load_demo();
        let b = load_demo();
        let ids_a: Vec<_> = a.all_tests().iter().map(|t| t.id.clone()).collect();
        let ids_b: Vec<_> = b.all_tests().iter().map(|t| t.id.clone()).collect();
        assert_eq!(ids_a, ids_b);
    }

    #[test]
    fn projects_partition_files_by_glob() {
        fn register_other(t: &mut Dsl) {
            t.test("other", |_run| async { Ok(()) });
        }

        let dir = TempDir::new().unwrap();
        let config = crate::config::load_str(
            r#"
            [[projects]]
            name = "ui"
            test-match = ["tests/ui/*.rs"]

            [[projects]]
            name = "api"
            test-match = ["tests/api/*.rs"]
            "#,
        )
        .unwrap();
        let files = [
            FileSpec::new("tests/ui/demo.rs", register_demo),
            FileSpec::new("tests/api/other.rs", register_other),
        ];
        let root = load(&config, &files, dir.path()).unwrap();

        assert_eq!(root.suites[0].suites.len(), 1);
        assert_eq!(root.suites[0].suites[0].title, "tests/ui/demo.rs");
        assert_eq!(root.suites[1].suites.len(), 1);
        assert_eq!(root.suites[1].suites[0].title, "tests/api/other.rs");

        // Project titles show up bracketed in ids.
        let ids: Vec<_> = root.all_tests().iter().map(|t| t.id.clone()).collect();
        assert!(ids.iter().any(|id| id.starts_with("[ui] > ")));
        assert!(ids.iter().any(|id| id.starts_with("[api] > ")));
    }

    #[test]
    fn invalid_glob_is_a_config_error() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            projects: vec![ProjectConfig {
                name: "bad".into(),
                test_match: vec!["tests/[".into()],
                use_options: TestOptions::default(),
            }],
            ..Config::default()
        };
        assert!(load(&config, &[], dir.path()).is_err());
    }

    #[test]
    fn hooks_attach_to_the_ambient_suite() {
        fn register(t: &mut Dsl) {
            t.before_each(|_run| async { Ok(()) });
            t.describe("g", |t| {
                t.before_each(|_run| async { Ok(()) });
                t.after_each(|_run| async { Ok(()) });
                t.test("x", |_run| async { Ok(()) });
            });
        }

        let dir = TempDir::new().unwrap();
        let files = [FileSpec::new("tests/hooked.rs", register)];
        let root = load(&Config::default(), &files, dir.path()).unwrap();

        let id = &root.all_tests()[0].id;
        let resolved = root.resolve(id).unwrap();
        assert_eq!(resolved.before_each.len(), 2);
        assert_eq!(resolved.after_each.len(), 1);
    }
}
