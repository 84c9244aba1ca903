use std::sync::LazyLock;

use aw_core::types::{CheckResult, CheckStatus, SkipReason};
use regex::Regex;

static ERROR_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(error|fail(ed|ure)?|panic|exception|vulnerab\w*)\b|✗|✖")
        .expect("static regex")
});

fn hint(check: &CheckResult) -> String {
    match check.name.as_str() {
        "TypeScript Compilation" => "Fix the reported type errors until `tsc --noEmit` is clean.".into(),
        "Lint" => "Resolve the lint findings or apply the project formatter.".into(),
        "Tests" => "Make the failing tests pass without weakening their assertions.".into(),
        "Build" => "Fix the errors that break the production build.".into(),
        "Coverage" => "Add tests for the uncovered code paths.".into(),
        "Security Audit" => "Upgrade or replace the dependencies flagged by the audit.".into(),
        _ => format!("Re-run `{}` and address what it reports.", check.command),
    }
}

/// First line of the output tail that looks like an error.
pub fn first_error_line(output: &[String]) -> Option<&str> {
    output
        .iter()
        .map(|l| l.trim())
        .find(|l| !l.is_empty() && ERROR_LINE.is_match(l))
}

/// One suggestion per failed check, plus one per required check that did not
/// finish.
pub fn suggestions(checks: &[&CheckResult]) -> Vec<String> {
    checks
        .iter()
        .map(|check| match (check.status, check.skip_reason) {
            (CheckStatus::Skipped, reason) => {
                let why = match reason {
                    Some(SkipReason::Timeout) => "timed out",
                    Some(SkipReason::BudgetExhausted) => "ran out of QA budget",
                    Some(SkipReason::FailFast) => "was skipped after an earlier failure",
                    None => "did not run",
                };
                format!(
                    "{}: required check {why}. {}",
                    check.name,
                    hint(check)
                )
            }
            _ => match first_error_line(&check.output_tail) {
                Some(line) => format!("{}: {} First error: {line}", check.name, hint(check)),
                None => format!("{}: {}", check.name, hint(check)),
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(name: &str, status: CheckStatus, tail: &[&str]) -> CheckResult {
        CheckResult {
            name: name.into(),
            command: "npm run x".into(),
            required: true,
            status,
            skip_reason: None,
            exit_code: Some(1),
            duration_ms: 10,
            output_tail: tail.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn quotes_the_first_error_line() {
        let tests = check(
            "Tests",
            CheckStatus::Failed,
            &["PASS src/a.test.ts", "FAIL src/b.test.ts", "Error: expected 2"],
        );
        let out = suggestions(&[&tests]);
        assert_eq!(out.len(), 1);
        assert!(out[0].starts_with("Tests: Make the failing tests pass"));
        assert!(out[0].ends_with("First error: FAIL src/b.test.ts"));
    }

    #[test]
    fn unknown_checks_get_a_generic_hint() {
        let custom = check("Storybook", CheckStatus::Failed, &[]);
        assert_eq!(
            suggestions(&[&custom]),
            vec!["Storybook: Re-run `npm run x` and address what it reports."]
        );
    }

    #[test]
    fn skipped_required_checks_explain_why() {
        let mut build = check("Build", CheckStatus::Skipped, &[]);
        build.skip_reason = Some(SkipReason::Timeout);
        assert!(suggestions(&[&build])[0].contains("required check timed out"));
    }
}
