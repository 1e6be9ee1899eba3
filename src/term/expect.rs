//! Polling predicates for screen assertions.
//!
//! The matcher in [`crate::term`] is a thin builder over three pure pieces
//! kept here: the [`Pattern`] to search for, the match test, and the shared
//! [`poll`] loop. Keeping them free of PTY state makes the timing and
//! inversion rules testable without spawning a shell.

use std::time::Duration;

use regex::Regex;
use tokio::time::Instant;

/// How often the matcher re-samples the screen.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// What `to_have_value` searches for: a literal substring or a regex.
#[derive(Debug, Clone)]
pub enum Pattern {
    Substring(String),
    Regex(Regex),
}

impl Pattern {
    /// True when the rendered buffer satisfies the pattern.
    pub(crate) fn matches(&self, haystack: &str) -> bool {
        match self {
            Pattern::Substring(needle) => haystack.contains(needle),
            Pattern::Regex(regex) => regex.is_match(haystack),
        }
    }

    fn mode(&self) -> &'static str {
        match self {
            Pattern::Substring(_) => "substring match",
            Pattern::Regex(_) => "regex match",
        }
    }

    /// Source form of the expected value, for failure messages.
    fn expected(&self) -> String {
        match self {
            Pattern::Substring(needle) => format!("{needle:?}"),
            Pattern::Regex(regex) => format!("/{}/", regex.as_str()),
        }
    }
}

impl From<&str> for Pattern {
    fn from(needle: &str) -> Pattern {
        Pattern::Substring(needle.to_string())
    }
}

impl From<String> for Pattern {
    fn from(needle: String) -> Pattern {
        Pattern::Substring(needle)
    }
}

impl From<Regex> for Pattern {
    fn from(regex: Regex) -> Pattern {
        Pattern::Regex(regex)
    }
}

/// Failure message for `to_have_value`, covering both directions.
pub(crate) fn failure_message(pattern: &Pattern, negated: bool, timeout: Duration) -> String {
    let verb = match (pattern, negated) {
        (Pattern::Substring(_), false) => "to contain",
        (Pattern::Substring(_), true) => "not to contain",
        (Pattern::Regex(_), false) => "to match",
        (Pattern::Regex(_), true) => "not to match",
    };
    format!(
        "expected terminal buffer {verb} {} ({}); gave up after {} ms",
        pattern.expected(),
        pattern.mode(),
        timeout.as_millis(),
    )
}

/// Samples `predicate` until it resolves or the deadline passes.
///
/// The first sample happens before any sleep, then one sample per
/// `interval`. With `expect_truthy` the loop resolves on the first truthy
/// sample; without it, on the first falsy sample (the negated matcher).
/// Returns whether the condition resolved before the deadline.
pub(crate) async fn poll(
    mut predicate: impl FnMut() -> bool,
    interval: Duration,
    deadline: Duration,
    expect_truthy: bool,
) -> bool {
    let start = Instant::now();
    loop {
        if predicate() == expect_truthy {
            return true;
        }
        if start.elapsed() >= deadline {
            return false;
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substring_and_regex_matching() {
        let sub = Pattern::from("$ ");
        assert!(sub.matches("bash-5.2$ "));
        assert!(!sub.matches("zsh %"));

        let re = Pattern::from(Regex::new(r"\$\s*$").unwrap());
        assert!(re.matches("bash-5.2$ "));
        assert!(!re.matches("$ done"));
    }

    #[test]
    fn failure_messages_name_value_and_mode() {
        let msg = failure_message(&Pattern::from(">"), false, Duration::from_millis(2000));
        assert!(msg.contains("\">\""));
        assert!(msg.contains("substring match"));
        assert!(msg.contains("2000 ms"));

        let re = Pattern::from(Regex::new("a+").unwrap());
        let msg = failure_message(&re, true, Duration::from_millis(100));
        assert!(msg.contains("/a+/"));
        assert!(msg.contains("regex match"));
        assert!(msg.contains("not to match"));
    }

    #[tokio::test(start_paused = true)]
    async fn first_sample_happens_before_any_sleep() {
        // The predicate is already true; with paused time the poll must
        // resolve without ever sleeping.
        let start = Instant::now();
        let resolved = poll(|| true, POLL_INTERVAL, Duration::from_secs(5), true).await;
        assert!(resolved);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn predicate_turning_true_resolves_before_deadline() {
        let mut samples = 0;
        let resolved = poll(
            || {
                samples += 1;
                samples > 3
            },
            POLL_INTERVAL,
            Duration::from_secs(5),
            true,
        )
        .await;
        assert!(resolved);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_failure_never_reports_success() {
        let resolved = poll(|| false, POLL_INTERVAL, Duration::from_millis(200), true).await;
        assert!(!resolved);
    }

    #[tokio::test(start_paused = true)]
    async fn inversion_duality_on_a_stable_buffer() {
        // For a buffer that never changes, the positive and negated matchers
        // cannot both resolve.
        let buffer = "prompt> ";
        let pattern = Pattern::from("prompt");
        let deadline = Duration::from_millis(200);

        let positive = poll(|| pattern.matches(buffer), POLL_INTERVAL, deadline, true).await;
        let negated = poll(|| pattern.matches(buffer), POLL_INTERVAL, deadline, false).await;
        assert!(positive);
        assert!(!negated);

        let absent = Pattern::from("missing");
        let positive = poll(|| absent.matches(buffer), POLL_INTERVAL, deadline, true).await;
        let negated = poll(|| absent.matches(buffer), POLL_INTERVAL, deadline, false).await;
        assert!(!positive);
        assert!(negated);
    }

    #[tokio::test(start_paused = true)]
    async fn negated_poll_resolves_on_first_absent_sample() {
        let mut present = true;
        let mut samples = 0;
        let resolved = poll(
            || {
                samples += 1;
                if samples > 2 {
                    present = false;
                }
                present
            },
            POLL_INTERVAL,
            Duration::from_secs(5),
            false,
        )
        .await;
        assert!(resolved);
    }
}
