//! Pass criteria: parsing them out of a task's description and mapping
//! each one onto an executed check.

use std::sync::LazyLock;

use aw_core::types::{CheckResult, CheckStatus, CriterionResult, CriterionStatus};
use regex::Regex;

static HEADING_PHRASE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(pass|acceptance|success)\s+criteria\b").expect("static regex")
});
static MARKDOWN_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*#{1,6}\s+\S").expect("static regex"));
/// `Label:` or `**Label:**` on a line of its own.
static LABEL_HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\*\*|__)?[A-Za-z][A-Za-z0-9 /&()-]{0,60}:(\*\*|__)?\s*$")
        .expect("static regex")
});
static ITEM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:[-*+]|\d+[.)])\s+(?:\[[ xX]\]\s+)?(.+?)\s*$").expect("static regex")
});

/// Keyword table, most specific first. A criterion maps onto the first row
/// whose pattern it matches.
static KEYWORDS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"(?i)\bcoverage", "Coverage"),
        (r"(?i)\b(security|audit|vulnerab)", "Security Audit"),
        (r"(?i)\b(lint|eslint|format)", "Lint"),
        (r"(?i)\b(type|compile|tsc)", "TypeScript Compilation"),
        (r"(?i)\b(test|spec)", "Tests"),
        (r"(?i)\b(build|bundle)", "Build"),
    ]
    .into_iter()
    .map(|(pattern, check)| (Regex::new(pattern).expect("static regex"), check))
    .collect()
});

fn is_heading(line: &str) -> bool {
    MARKDOWN_HEADING.is_match(line) || LABEL_HEADING.is_match(line)
}

/// Every list item under a "pass/acceptance/success criteria" heading, up to
/// the next heading. Several such sections are concatenated.
pub fn parse_pass_criteria(description: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut collecting = false;
    for line in description.lines() {
        if is_heading(line) {
            collecting = HEADING_PHRASE.is_match(line);
            continue;
        }
        // Prose between items is ignored.
        if collecting {
            if let Some(cap) = ITEM.captures(line) {
                out.push(cap[1].to_string());
            }
        }
    }
    out
}

/// Name of the check a criterion is about, if the keyword table knows it.
pub fn keyword_check(criterion: &str) -> Option<&'static str> {
    KEYWORDS
        .iter()
        .find(|(re, _)| re.is_match(criterion))
        .map(|(_, check)| *check)
}

/// A criterion takes the status of its mapped check. Unmapped criteria, and
/// criteria whose check was skipped or is not part of the level, are manual.
pub fn map_criteria(criteria: &[String], checks: &[CheckResult]) -> Vec<CriterionResult> {
    criteria
        .iter()
        .map(|criterion| {
            let executed = keyword_check(criterion)
                .and_then(|name| checks.iter().find(|c| c.name == name));
            let (mapped_check, status) = match executed {
                Some(check) => (
                    Some(check.name.clone()),
                    match check.status {
                        CheckStatus::Passed => CriterionStatus::Passed,
                        CheckStatus::Failed => CriterionStatus::Failed,
                        CheckStatus::Skipped => CriterionStatus::Manual,
                    },
                ),
                None => (None, CriterionStatus::Manual),
            };
            CriterionResult {
                criterion: criterion.clone(),
                mapped_check,
                status,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESCRIPTION: &str = "\
## Summary
Add a checkout button.

- not a criterion

## Acceptance Criteria
- [ ] Unit tests cover the click handler
- [x] No type errors
1. Lint passes
2) Button matches the design mock

Some prose in between.
* Coverage stays above 80%

## Notes
- also not a criterion

**Pass criteria:**
+ Production bundle builds
";

    #[test]
    fn collects_items_under_criteria_headings_only() {
        let parsed = parse_pass_criteria(DESCRIPTION);
        assert_eq!(
            parsed,
            vec![
                "Unit tests cover the click handler",
                "No type errors",
                "Lint passes",
                "Button matches the design mock",
                "Coverage stays above 80%",
                "Production bundle builds",
            ]
        );
    }

    #[test]
    fn label_heading_form() {
        let text = "Success criteria:\n- build succeeds\nOwner:\n- someone";
        assert_eq!(parse_pass_criteria(text), vec!["build succeeds"]);
    }

    #[test]
    fn no_heading_means_no_criteria() {
        assert!(parse_pass_criteria("- tests pass\n- lint clean").is_empty());
    }

    #[test]
    fn keyword_table() {
        assert_eq!(keyword_check("All specs green"), Some("Tests"));
        assert_eq!(keyword_check("tsc reports nothing"), Some("TypeScript Compilation"));
        assert_eq!(keyword_check("ESLint clean"), Some("Lint"));
        assert_eq!(keyword_check("bundle size unchanged"), Some("Build"));
        assert_eq!(keyword_check("test coverage above 80%"), Some("Coverage"));
        assert_eq!(keyword_check("no known vulnerabilities"), Some("Security Audit"));
        assert_eq!(keyword_check("button is blue"), None);
        // Word starts only: "inspect" is not "spec".
        assert_eq!(keyword_check("inspect the layout"), None);
    }
}
