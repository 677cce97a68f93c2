//! Adversarial review parsing
//!
//! Reviewer agents are instructed to answer in a small fixed format, and this
//! module turns that text into a [`ReviewResult`].
//!
//! ## Format
//!
//! ```text
//! [SEVERITY: HIGH] - SQL injection in login handler
//! Location: src/auth.rs:42
//! Attack Vector: attacker supplies `' OR 1=1 --` as the username
//! Impact: full authentication bypass
//! Required Fix: use parameterized queries
//!
//! [SEVERITY: LOW] - Missing rate limit
//! Required Fix: add a limiter in front of /login
//!
//! **VERDICT: REJECT**
//! ```
//!
//! The verdict must sit inside bold/emphasis markers and is matched case
//! insensitively. A missing or contradictory verdict counts as REJECT. Each
//! issue block runs until the next severity marker, the verdict line, or the
//! end of the text.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use uuid::Uuid;

/// Fix text used when a block has no `Required Fix:` field
pub const DEFAULT_REQUIRED_FIX: &str = "Address the issue described above";

/// Outcome of one adversarial review pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Approve,
    Reject,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Approve => write!(f, "APPROVE"),
            Self::Reject => write!(f, "REJECT"),
        }
    }
}

/// Issue severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Critical => write!(f, "CRITICAL"),
            Self::High => write!(f, "HIGH"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::Low => write!(f, "LOW"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "CRITICAL" => Ok(Self::Critical),
            "HIGH" => Ok(Self::High),
            "MEDIUM" => Ok(Self::Medium),
            "LOW" => Ok(Self::Low),
            _ => Err(format!("Invalid severity: {}", s)),
        }
    }
}

/// A single issue raised by the reviewer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewIssue {
    pub id: String,
    pub severity: Severity,
    pub title: String,
    pub location: Option<String>,
    pub attack_vector: Option<String>,
    pub impact: Option<String>,
    pub required_fix: String,
}

impl ReviewIssue {
    /// Stand-in issue for a rejection that listed nothing parseable
    fn unitemized(id: String) -> Self {
        Self {
            id,
            severity: Severity::Medium,
            title: "Reviewer rejected the code without itemized issues".to_string(),
            location: None,
            attack_vector: None,
            impact: None,
            required_fix: "Re-read the review summary and address every concern it raises"
                .to_string(),
        }
    }
}

/// Parsed result of one review pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewResult {
    pub review_id: String,
    pub verdict: Verdict,
    pub issues: Vec<ReviewIssue>,
    /// Raw reviewer text
    pub summary: String,
    pub timestamp: DateTime<Utc>,
}

impl ReviewResult {
    pub fn is_approved(&self) -> bool {
        self.verdict == Verdict::Approve
    }

    /// Issues at the given severity
    pub fn issues_with_severity(&self, severity: Severity) -> Vec<&ReviewIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == severity)
            .collect()
    }
}

fn verdict_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(?:\*{1,2}|_{1,2})[^\S\n]*VERDICT[^\S\n]*:[^\S\n]*(?:\*{1,2}|_{1,2})?[^\S\n]*(APPROVE|REJECT)\b",
        )
        .expect("verdict pattern is valid")
    })
}

fn issue_header_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\[SEVERITY[^\S\n]*:[^\S\n]*(CRITICAL|HIGH|MEDIUM|LOW)[^\S\n]*\][^\S\n]*[-:][^\S\n]*([^\n]*)",
        )
        .expect("issue header pattern is valid")
    })
}

fn field_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^\s*(?:[-*][^\S\n]*)?(?:\*\*|__)?(Location|Attack Vector|Impact|Required Fix)(?:\*\*|__)?[^\S\n]*:(?:\*\*|__)?\s*(.*)$",
        )
        .expect("field pattern is valid")
    })
}

/// Extract the verdict; anything other than an unambiguous APPROVE is REJECT
pub fn parse_verdict(text: &str) -> Verdict {
    let mut approve = false;
    let mut reject = false;

    for caps in verdict_regex().captures_iter(text) {
        if caps[1].eq_ignore_ascii_case("APPROVE") {
            approve = true;
        } else {
            reject = true;
        }
    }

    if approve && !reject {
        Verdict::Approve
    } else {
        Verdict::Reject
    }
}

/// Extract every `[SEVERITY: ...]` block
pub fn parse_issues(text: &str) -> Vec<ReviewIssue> {
    let headers: Vec<_> = issue_header_regex().captures_iter(text).collect();
    let verdict_starts: Vec<usize> = verdict_regex().find_iter(text).map(|m| m.start()).collect();

    let mut issues = Vec::with_capacity(headers.len());
    for (index, caps) in headers.iter().enumerate() {
        let Some(header) = caps.get(0) else {
            continue;
        };
        let Ok(severity) = caps[1].parse::<Severity>() else {
            continue;
        };

        let body_start = header.end();
        let mut body_end = headers
            .get(index + 1)
            .and_then(|next| next.get(0))
            .map(|m| m.start())
            .unwrap_or(text.len());
        if let Some(verdict_start) = verdict_starts.iter().find(|&&s| s >= body_start) {
            body_end = body_end.min(*verdict_start);
        }

        let fields = IssueFields::parse(&text[body_start..body_end]);
        let title = clean_value(&caps[2]);

        issues.push(ReviewIssue {
            id: format!("issue-{}", index + 1),
            severity,
            title: if title.is_empty() {
                "Untitled issue".to_string()
            } else {
                title
            },
            location: fields.location,
            attack_vector: fields.attack_vector,
            impact: fields.impact,
            required_fix: fields
                .required_fix
                .unwrap_or_else(|| DEFAULT_REQUIRED_FIX.to_string()),
        });
    }

    issues
}

/// Parse a full reviewer response
///
/// A REJECT with no parseable issue blocks gets exactly one MEDIUM issue so a
/// fix pass always has something to act on.
pub fn parse_review_response(text: &str) -> ReviewResult {
    let verdict = parse_verdict(text);
    let mut issues = parse_issues(text);

    if verdict == Verdict::Reject && issues.is_empty() {
        issues.push(ReviewIssue::unitemized("issue-1".to_string()));
    }

    ReviewResult {
        review_id: format!("review-{}", Uuid::new_v4()),
        verdict,
        issues,
        summary: text.to_string(),
        timestamp: Utc::now(),
    }
}

/// Instructions appended to every review prompt
pub fn review_format_instructions() -> &'static str {
    r#"## RESPONSE FORMAT

List every problem you find as its own block:

[SEVERITY: CRITICAL|HIGH|MEDIUM|LOW] - <short title>
Location: <file, function or line>
Attack Vector: <how the problem is triggered>
Impact: <what goes wrong>
Required Fix: <the concrete change needed>

Finish with exactly one verdict line, in bold:

**VERDICT: APPROVE**  (nothing blocking remains)
**VERDICT: REJECT**   (at least one issue must be fixed)
"#
}

#[derive(Default)]
struct IssueFields {
    location: Option<String>,
    attack_vector: Option<String>,
    impact: Option<String>,
    required_fix: Option<String>,
}

impl IssueFields {
    fn parse(body: &str) -> Self {
        let mut fields = Self::default();
        let mut current: Option<(String, String)> = None;

        for line in body.lines() {
            if let Some(caps) = field_regex().captures(line) {
                if let Some((label, value)) = current.take() {
                    fields.set(&label, &value);
                }
                current = Some((caps[1].to_lowercase(), caps[2].to_string()));
            } else if let Some((_, value)) = current.as_mut() {
                let line = line.trim();
                if line.is_empty() || is_rule(line) {
                    continue;
                }
                if !value.trim().is_empty() {
                    value.push(' ');
                }
                value.push_str(line);
            }
        }
        if let Some((label, value)) = current {
            fields.set(&label, &value);
        }

        fields
    }

    fn set(&mut self, label: &str, raw: &str) {
        let value = clean_value(raw);
        if value.is_empty() {
            return;
        }
        match label {
            "location" => self.location = Some(value),
            "attack vector" => self.attack_vector = Some(value),
            "impact" => self.impact = Some(value),
            "required fix" => self.required_fix = Some(value),
            _ => {}
        }
    }
}

fn clean_value(raw: &str) -> String {
    raw.trim().trim_matches('*').trim_matches('_').trim().to_string()
}

/// Markdown horizontal rules between blocks
fn is_rule(line: &str) -> bool {
    line.chars().all(|c| matches!(c, '-' | '*' | '=' | '_'))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_ISSUES: &str = r#"I reviewed the handler carefully.

[SEVERITY: HIGH] - SQL injection in login handler
Location: src/auth.rs:42
Attack Vector: attacker supplies `' OR 1=1 --` as the username
Impact: full authentication bypass
Required Fix: use parameterized queries

[SEVERITY: LOW] - Missing rate limit
Location: routes/login
Required Fix: add a limiter in front of /login

**VERDICT: REJECT**
"#;

    #[test]
    fn test_two_blocks_parse_with_fields() {
        let result = parse_review_response(TWO_ISSUES);

        assert_eq!(result.verdict, Verdict::Reject);
        assert_eq!(result.issues.len(), 2);

        let first = &result.issues[0];
        assert_eq!(first.severity, Severity::High);
        assert_eq!(first.title, "SQL injection in login handler");
        assert_eq!(first.location.as_deref(), Some("src/auth.rs:42"));
        assert_eq!(
            first.attack_vector.as_deref(),
            Some("attacker supplies `' OR 1=1 --` as the username")
        );
        assert_eq!(first.impact.as_deref(), Some("full authentication bypass"));
        assert_eq!(first.required_fix, "use parameterized queries");

        let second = &result.issues[1];
        assert_eq!(second.severity, Severity::Low);
        assert_eq!(second.title, "Missing rate limit");
        assert_eq!(second.location.as_deref(), Some("routes/login"));
        assert!(second.impact.is_none());
        assert_eq!(second.required_fix, "add a limiter in front of /login");
    }

    #[test]
    fn test_reject_without_blocks_yields_one_medium_issue() {
        let result = parse_review_response("This is not safe.\n\n**VERDICT: REJECT**");
        assert_eq!(result.verdict, Verdict::Reject);
        assert_eq!(result.issues.len(), 1);
        assert_eq!(result.issues[0].severity, Severity::Medium);
    }

    #[test]
    fn test_missing_verdict_defaults_to_reject() {
        let result = parse_review_response("Looks fine to me overall.");
        assert_eq!(result.verdict, Verdict::Reject);
        assert_eq!(result.issues.len(), 1);
    }

    #[test]
    fn test_verdict_requires_emphasis_markers() {
        assert_eq!(parse_verdict("VERDICT: APPROVE"), Verdict::Reject);
        assert_eq!(parse_verdict("**VERDICT: APPROVE**"), Verdict::Approve);
        assert_eq!(parse_verdict("*verdict: approve*"), Verdict::Approve);
        assert_eq!(parse_verdict("__VERDICT: APPROVE__"), Verdict::Approve);
        assert_eq!(parse_verdict("**VERDICT:** APPROVE"), Verdict::Approve);
    }

    #[test]
    fn test_contradictory_verdicts_reject() {
        let text = "**VERDICT: APPROVE**\n\nOn reflection:\n\n**VERDICT: REJECT**";
        assert_eq!(parse_verdict(text), Verdict::Reject);
    }

    #[test]
    fn test_approve_keeps_advisory_issues() {
        let text = "[SEVERITY: LOW] - Naming nit\nRequired Fix: rename tmp to buffer\n\n**VERDICT: APPROVE**";
        let result = parse_review_response(text);
        assert!(result.is_approved());
        assert_eq!(result.issues.len(), 1);
        assert_eq!(result.issues_with_severity(Severity::Low).len(), 1);
    }

    #[test]
    fn test_missing_required_fix_uses_default() {
        let issues = parse_issues("[SEVERITY: CRITICAL] - Secrets in logs\nLocation: logger.rs");
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, Severity::Critical);
        assert_eq!(issues[0].required_fix, DEFAULT_REQUIRED_FIX);
    }

    #[test]
    fn test_block_stops_at_verdict_line() {
        let text = "[SEVERITY: MEDIUM] - Unbounded retry\nImpact: hammers the provider\n**VERDICT: REJECT**\nRequired Fix: this line is after the verdict";
        let issues = parse_issues(text);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].impact.as_deref(), Some("hammers the provider"));
        assert_eq!(issues[0].required_fix, DEFAULT_REQUIRED_FIX);
    }

    #[test]
    fn test_markdown_decorated_fields_and_continuations() {
        let text = r#"**[SEVERITY: high] - Race in cache refresh**
- **Location:** cache.rs
- **Impact:** stale reads
  under concurrent writers
- **Required Fix:** hold the lock across refresh
---
*VERDICT: REJECT*"#;
        let issues = parse_issues(text);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, Severity::High);
        assert_eq!(issues[0].title, "Race in cache refresh");
        assert_eq!(issues[0].location.as_deref(), Some("cache.rs"));
        assert_eq!(
            issues[0].impact.as_deref(),
            Some("stale reads under concurrent writers")
        );
        assert_eq!(issues[0].required_fix, "hold the lock across refresh");
    }

    #[test]
    fn test_format_instructions_mention_grammar() {
        let instructions = review_format_instructions();
        assert!(instructions.contains("[SEVERITY:"));
        assert!(instructions.contains("**VERDICT: APPROVE**"));
    }
}
