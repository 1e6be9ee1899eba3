//! Run reporting.
//!
//! The orchestrator drives a narrow [`Reporter`] interface and serializes
//! every call, so implementations never see concurrent events. The built-in
//! [`ListReporter`] prints a progress bar plus a line per finished test; the
//! [`NullReporter`] swallows everything and exists for tests and embedding.

use async_trait::async_trait;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::shell::Shell;
use crate::suite::{Status, Suite, TestCase, TestResult, counts_as_failure};

/// Receives lifecycle events during a run.
#[async_trait]
pub trait Reporter: Send {
    /// Called once before any test is dispatched.
    async fn start(&mut self, total_tests: usize, shells: &[Shell]);

    /// Called once per attempt result, serialized across tests.
    async fn end_test(&mut self, test: &TestCase, result: &TestResult);

    /// Called once after the pool is drained; returns the failure count
    /// from the reporter's point of view.
    async fn end(&mut self, root: &Suite) -> usize;
}

/// A reporter that does nothing.
pub struct NullReporter;

#[async_trait]
impl Reporter for NullReporter {
    async fn start(&mut self, _total_tests: usize, _shells: &[Shell]) {}
    async fn end_test(&mut self, _test: &TestCase, _result: &TestResult) {}
    async fn end(&mut self, _root: &Suite) -> usize {
        0
    }
}

/// Console reporter: progress bar while running, one line per result,
/// summary at the end.
pub struct ListReporter {
    progress: Option<ProgressBar>,
    fail_on_flaky: bool,
}

impl ListReporter {
    pub fn new(fail_on_flaky: bool) -> ListReporter {
        ListReporter { progress: None, fail_on_flaky }
    }

    fn status_label(status: Status) -> console::StyledObject<&'static str> {
        match status {
            Status::Expected => style("ok  ").green(),
            Status::Unexpected => style("FAIL").red(),
            Status::Skipped => style("skip").yellow(),
            Status::Flaky => style("flak").yellow(),
            Status::Pending => style("....").dim(),
        }
    }
}

#[async_trait]
impl Reporter for ListReporter {
    async fn start(&mut self, total_tests: usize, shells: &[Shell]) {
        let shells = shells.iter().map(Shell::to_string).collect::<Vec<_>>().join(", ");
        println!("running {total_tests} test(s) across shells: {shells}");

        let bar = ProgressBar::new(total_tests as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len}")
                .expect("static template is valid")
                .progress_chars("#>-"),
        );
        self.progress = Some(bar);
    }

    async fn end_test(&mut self, test: &TestCase, result: &TestResult) {
        if let Some(bar) = &self.progress {
            bar.inc(1);
            let line = format!(
                "{} {} ({} ms)",
                Self::status_label(result.status),
                test.id,
                result.duration.as_millis()
            );
            if result.status == Status::Unexpected {
                bar.println(line);
                if let Some(error) = &result.error {
                    for l in error.lines() {
                        bar.println(format!("     {}", style(l).dim()));
                    }
                }
            } else {
                bar.println(line);
            }
        }
    }

    async fn end(&mut self, root: &Suite) -> usize {
        if let Some(bar) = self.progress.take() {
            bar.finish_and_clear();
        }

        let mut passed = 0;
        let mut failed = 0;
        let mut skipped = 0;
        let mut flaky = 0;
        for test in root.all_tests() {
            match test.outcome() {
                Status::Expected => passed += 1,
                Status::Unexpected | Status::Pending => failed += 1,
                Status::Skipped => skipped += 1,
                Status::Flaky => flaky += 1,
            }
        }

        println!();
        println!("  passed:  {}", style(passed).green());
        if failed > 0 {
            println!("  failed:  {}", style(failed).red());
        }
        if skipped > 0 {
            println!("  skipped: {}", style(skipped).yellow());
        }
        if flaky > 0 {
            println!("  flaky:   {}", style(flaky).yellow());
        }

        root.all_tests()
            .iter()
            .filter(|t| counts_as_failure(t.outcome(), self.fail_on_flaky))
            .count()
    }
}
