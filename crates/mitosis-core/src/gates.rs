//! Structured results for the checkpoints between engine states: test runs,
//! lint passes, reviewer verdicts. Parsers here accept the messy, interleaved
//! output real tools produce and fall back to the exit code as truth.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Test execution outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub output: String,
    pub exit_code: Option<i32>,
    /// Whether the run counts as GREEN.
    pub passing: bool,
}

/// Lint pass outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LintResult {
    pub passing: bool,
    pub issues: Vec<String>,
    pub critical: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewVote {
    Approve,
    Reject,
}

/// One reviewer's verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewResult {
    pub role: String,
    pub vote: ReviewVote,
    pub rationale: String,
    #[serde(default)]
    pub severity: Option<String>,
    /// Advisory verdicts are recorded but cannot fail the task.
    #[serde(default)]
    pub advisory: bool,
}

/// Aggregated outcome of the review gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewDecision {
    pub approved: bool,
    pub votes: Vec<ReviewResult>,
}

impl ReviewDecision {
    /// Rationales of the required reviewers that rejected.
    pub fn rejection_rationales(&self) -> Vec<String> {
        self.votes
            .iter()
            .filter(|v| !v.advisory && v.vote == ReviewVote::Reject)
            .map(|v| format!("{}: {}", v.role, v.rationale))
            .collect()
    }
}

fn passed_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(\d+)\s+pass(?:ed|ing)?\b").expect("static regex"))
}

fn failed_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(\d+)\s+fail(?:ed|ing|ures?)?\b").expect("static regex"))
}

fn failure_token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?m)(FAILED|FAIL\b|\berror\[|panicked at|test result: FAILED)")
            .expect("static regex")
    })
}

/// Parse test-runner output into a [`TestResult`].
///
/// Count lines like `5 passed` / `2 failed` are preferred. When the output is
/// garbled beyond counting, the exit code decides; with neither, a failure
/// token scan is the last resort.
pub fn parse_test_output(output: &str, exit_code: Option<i32>) -> TestResult {
    let passed = last_count(passed_pattern(), output);
    let failed = last_count(failed_pattern(), output);

    let (passing, passed, failed) = match (passed, failed) {
        (Some(p), Some(f)) => (f == 0 && p > 0, p, f),
        (Some(p), None) => (p > 0 && !failure_token_pattern().is_match(output), p, 0),
        (None, Some(f)) => (false, 0, f),
        (None, None) => match exit_code {
            Some(code) => (code == 0, 0, 0),
            None => (!failure_token_pattern().is_match(output), 0, 0),
        },
    };

    TestResult {
        total: passed + failed,
        passed,
        failed,
        output: output.to_string(),
        exit_code,
        passing,
    }
}

/// Take the last match of a count pattern; runners print totals last.
fn last_count(pattern: &Regex, output: &str) -> Option<u32> {
    pattern
        .captures_iter(output)
        .last()
        .and_then(|c| c[1].parse().ok())
}

/// Parse lint output into structured issues.
///
/// `error:` lines are critical; `warning:` lines are recorded but do not
/// fail the gate. A nonzero exit code with nothing parsed is still a failure.
pub fn parse_lint_output(output: &str, exit_code: Option<i32>) -> LintResult {
    let mut issues = Vec::new();
    let mut critical = Vec::new();

    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("error:") || trimmed.starts_with("error[") {
            critical.push(trimmed.to_string());
        } else if trimmed.starts_with("warning:") {
            issues.push(trimmed.to_string());
        }
    }

    let passing = if critical.is_empty() && issues.is_empty() {
        exit_code.map_or(true, |code| code == 0)
    } else {
        critical.is_empty()
    };

    LintResult {
        passing,
        issues,
        critical,
    }
}

fn approve_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)\b(approve[d]?|lgtm)\b").expect("static regex"))
}

fn reject_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)\breject(ed)?\b").expect("static regex"))
}

fn severity_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)severity:\s*(\w+)").expect("static regex"))
}

/// Extract a reviewer verdict from free-form reviewer output.
///
/// A reject token wins over an approve token (reviewers often write
/// "cannot approve, reject"). With no explicit verdict the vote is a
/// reject: silence is not approval.
pub fn parse_review_output(role: &str, output: &str, advisory: bool) -> ReviewResult {
    let vote = if reject_pattern().is_match(output) {
        ReviewVote::Reject
    } else if approve_pattern().is_match(output) {
        ReviewVote::Approve
    } else {
        ReviewVote::Reject
    };

    let rationale = if output.trim().is_empty() {
        "no reviewer output".to_string()
    } else {
        let trimmed = output.trim();
        // Keep the rationale bounded for results and logs.
        trimmed.chars().take(2_000).collect()
    };

    let severity = severity_pattern()
        .captures(output)
        .map(|c| c[1].to_lowercase());

    ReviewResult {
        role: role.to_string(),
        vote,
        rationale,
        severity,
        advisory,
    }
}

/// Aggregate reviewer votes: every required reviewer must approve.
/// Advisory votes are recorded but excluded from the quorum.
pub fn aggregate_reviews(votes: Vec<ReviewResult>) -> ReviewDecision {
    let approved = votes
        .iter()
        .filter(|v| !v.advisory)
        .all(|v| v.vote == ReviewVote::Approve);

    ReviewDecision { approved, votes }
}
