//! Prompt builders for review loop workers
//!
//! The producer gets the original requirements on every call; the adversarial
//! reviewer additionally gets the response format it must follow so its output
//! can be parsed.

use conclave_validation::{review_format_instructions, ReviewIssue};

/// Prompt for the producer's first attempt
pub fn build_generation_prompt(requirements: &str) -> String {
    let mut prompt = String::new();

    prompt.push_str("# CODE GENERATION\n\n");
    prompt.push_str("## REQUIREMENTS\n\n");
    prompt.push_str(requirements.trim());
    prompt.push_str("\n\n");

    prompt.push_str("## OBJECTIVE\n\n");
    prompt.push_str("1. Implement the requirements completely\n");
    prompt.push_str("2. Handle errors and edge cases explicitly\n");
    prompt.push_str("3. Return only the code, in a single fenced block\n");

    prompt
}

/// Prompt for one adversarial review pass
pub fn build_review_prompt(
    requirements: &str,
    code: &str,
    iteration: usize,
    max_iterations: usize,
) -> String {
    let mut prompt = String::new();

    prompt.push_str(&format!(
        "# ADVERSARIAL REVIEW - Iteration {} of {}\n\n",
        iteration, max_iterations
    ));
    prompt.push_str(
        "You are trying to break this code. Look for security holes, incorrect \
         behavior, unhandled failures and requirements that were not met.\n\n",
    );

    prompt.push_str("## ORIGINAL REQUIREMENTS\n\n");
    prompt.push_str(requirements.trim());
    prompt.push_str("\n\n");

    prompt.push_str("## CODE UNDER REVIEW\n\n");
    prompt.push_str(code.trim());
    prompt.push_str("\n\n");

    prompt.push_str(review_format_instructions());

    prompt
}

/// Prompt for a fix pass after a rejection
pub fn build_fix_prompt(
    requirements: &str,
    code: &str,
    issues: &[ReviewIssue],
    iteration: usize,
) -> String {
    let mut prompt = String::new();

    prompt.push_str(&format!("# FIX PASS - After Review {}\n\n", iteration));

    prompt.push_str("## ORIGINAL REQUIREMENTS\n\n");
    prompt.push_str(requirements.trim());
    prompt.push_str("\n\n");

    prompt.push_str("## CURRENT CODE\n\n");
    prompt.push_str(code.trim());
    prompt.push_str("\n\n");

    prompt.push_str("## ISSUES TO FIX\n\n");
    prompt.push_str("You MUST address every issue below:\n\n");
    for issue in issues {
        prompt.push_str(&format!(
            "### {} [{}] {}\n",
            issue.id, issue.severity, issue.title
        ));
        if let Some(location) = &issue.location {
            prompt.push_str(&format!("- Location: {}\n", location));
        }
        if let Some(attack_vector) = &issue.attack_vector {
            prompt.push_str(&format!("- Attack Vector: {}\n", attack_vector));
        }
        if let Some(impact) = &issue.impact {
            prompt.push_str(&format!("- Impact: {}\n", impact));
        }
        prompt.push_str(&format!("- Required Fix: {}\n\n", issue.required_fix));
    }

    prompt.push_str("## OBJECTIVE\n\n");
    prompt.push_str("Return the complete corrected code in a single fenced block.\n");

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_validation::{Severity, DEFAULT_REQUIRED_FIX};

    #[test]
    fn test_generation_prompt() {
        let prompt = build_generation_prompt("  Write a rate limiter  ");
        assert!(prompt.contains("## REQUIREMENTS\n\nWrite a rate limiter\n"));
    }

    #[test]
    fn test_review_prompt_includes_grammar() {
        let prompt = build_review_prompt("Write a parser", "fn parse() {}", 2, 3);
        assert!(prompt.contains("Iteration 2 of 3"));
        assert!(prompt.contains("fn parse() {}"));
        assert!(prompt.contains("[SEVERITY:"));
        assert!(prompt.contains("**VERDICT: REJECT**"));
    }

    #[test]
    fn test_fix_prompt_lists_issues() {
        let issues = vec![ReviewIssue {
            id: "issue-1".to_string(),
            severity: Severity::High,
            title: "Unbounded buffer".to_string(),
            location: Some("parse()".to_string()),
            attack_vector: None,
            impact: Some("memory exhaustion".to_string()),
            required_fix: DEFAULT_REQUIRED_FIX.to_string(),
        }];

        let prompt = build_fix_prompt("Write a parser", "fn parse() {}", &issues, 1);
        assert!(prompt.contains("### issue-1 [HIGH] Unbounded buffer"));
        assert!(prompt.contains("- Location: parse()"));
        assert!(!prompt.contains("Attack Vector"));
        assert!(prompt.contains(DEFAULT_REQUIRED_FIX));
    }
}
