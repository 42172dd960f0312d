//! Static permission policy for destructive operations.
//!
//! Two tiers share the pattern banks defined here:
//!
//! - [`PermissionGuard::check`] is authoritative: a hard-block match refuses
//!   the operation outright and no approval can override it. It runs on
//!   instruction intake and again on every `tool_use` payload parsed from
//!   agent stdout.
//! - [`PermissionGuard::detect_destructive`] is advisory: it scans free text
//!   (the agent's final response) for destructive commands the agent claims
//!   to have run, and each finding is routed through the approval gate.

use crate::{ConductorError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
}

/// Outcome of a guard check. `allowed=false` carries the refusal reason;
/// `allowed=true` may still carry an advisory warning.
#[derive(Debug, Clone, PartialEq)]
pub struct PermissionCheck {
    pub allowed: bool,
    pub blocked_reason: Option<String>,
    pub severity: Option<Severity>,
    pub warning: Option<String>,
}

impl PermissionCheck {
    fn allowed() -> Self {
        Self {
            allowed: true,
            blocked_reason: None,
            severity: None,
            warning: None,
        }
    }

    fn blocked(reason: String, severity: Severity) -> Self {
        Self {
            allowed: false,
            blocked_reason: Some(reason),
            severity: Some(severity),
            warning: None,
        }
    }

    fn warned(warning: String) -> Self {
        Self {
            allowed: true,
            blocked_reason: None,
            severity: None,
            warning: Some(warning),
        }
    }
}

/// A destructive command found in free text by the approval detector.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedCommand {
    pub command: String,
    pub action: String,
    pub severity: Severity,
}

struct Rule {
    pattern: Regex,
    description: &'static str,
    severity: Severity,
}

struct WarningRule {
    pattern: Regex,
    advisory: &'static str,
}

/// (pattern, human-readable action, severity) for operations that are never
/// allowed regardless of user consent.
const HARD_BLOCK_PATTERNS: &[(&str, &str, Severity)] = &[
    (
        r"(?i)git\s+push\b.*\s(--force|-f)(\s|$)",
        "Force push rewrites remote history",
        Severity::Critical,
    ),
    (
        r"(?i)git\s+reset\s+--hard\b",
        "Hard reset discards local changes",
        Severity::High,
    ),
    (
        r"(?i)\brm\s+-[a-z]+\s+(?:/|~/?)(?:\s|$)",
        "Recursive delete of the filesystem root or home directory",
        Severity::Critical,
    ),
    (
        r"(?i)\bsudo\s+rm\b",
        "Privileged file deletion",
        Severity::Critical,
    ),
    (
        r"(?i)\bgh\s+repo\s+delete\b",
        "Repository deletion",
        Severity::Critical,
    ),
    (
        r"(?i)\bnpm\s+unpublish\b",
        "Unpublishing a released package",
        Severity::High,
    ),
    (
        r"(?i)git\s+push\b.*\s(--delete|-d)\s+\S+",
        "Remote branch deletion",
        Severity::High,
    ),
    (
        r"(?i)git\s+push\s+\S+\s+:\S+",
        "Remote branch deletion",
        Severity::High,
    ),
    (
        r"(?i)git\s+filter-branch\b",
        "History rewrite across the repository",
        Severity::High,
    ),
    (
        r"(?i)\bch(?:mod|own)\s+-R\b.*\s+/(\s|$)",
        "Recursive permission change on the filesystem root",
        Severity::High,
    ),
];

/// Operations that proceed but deserve a heads-up.
const WARNING_PATTERNS: &[(&str, &str)] = &[
    (
        r"(?i)git\s+push\b.*\b(main|master)\b",
        "Pushing directly to a protected branch",
    ),
    (r"(?i)\bnpm\s+publish\b", "Publishing a package to npm"),
    (r"(?i)\bcargo\s+publish\b", "Publishing a crate to crates.io"),
];

/// Destructive-but-overridable operations. A match here does not block;
/// it warrants user confirmation through the approval gate.
const CONFIRMATION_PATTERNS: &[(&str, &str, Severity)] = &[
    (
        r"(?i)git\s+push\b.*--force-with-lease\b",
        "Force push (with lease) to a remote branch",
        Severity::High,
    ),
    (
        r"(?i)\brm\s+-[a-z]*r[a-z]*\s+\S+",
        "Recursive delete of a directory",
        Severity::High,
    ),
    (
        r"(?i)git\s+clean\s+-[a-z]*f[a-z]*\b",
        "Removal of untracked files",
        Severity::High,
    ),
    (
        r"(?i)git\s+branch\s+-D\s+\S+",
        "Forced local branch deletion",
        Severity::High,
    ),
    (
        r"(?i)git\s+checkout\s+--\s+\.",
        "Discarding all working-tree changes",
        Severity::High,
    ),
    (
        r"(?i)git\s+stash\s+(drop|clear)\b",
        "Dropping stashed changes",
        Severity::High,
    ),
    (
        r"(?i)\bdrop\s+(table|database)\b",
        "Dropping a database object",
        Severity::Critical,
    ),
];

/// Pattern-matching policy over instructions and commands. Stateless after
/// construction; `check` is a pure function of its input.
pub struct PermissionGuard {
    hard_rules: Vec<Rule>,
    warning_rules: Vec<WarningRule>,
    confirmation_rules: Vec<Rule>,
}

fn compile_pattern(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| {
        ConductorError::ConfigurationError(format!("Invalid guard pattern {pattern:?}: {e}"))
    })
}

fn compile_rules(patterns: &[(&str, &'static str, Severity)]) -> Result<Vec<Rule>> {
    patterns
        .iter()
        .map(|&(pattern, description, severity)| {
            Ok(Rule {
                pattern: compile_pattern(pattern)?,
                description,
                severity,
            })
        })
        .collect()
}

impl PermissionGuard {
    pub fn new() -> Result<Self> {
        Ok(Self {
            hard_rules: compile_rules(HARD_BLOCK_PATTERNS)?,
            warning_rules: WARNING_PATTERNS
                .iter()
                .map(|&(pattern, advisory)| {
                    Ok(WarningRule {
                        pattern: compile_pattern(pattern)?,
                        advisory,
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            confirmation_rules: compile_rules(CONFIRMATION_PATTERNS)?,
        })
    }

    /// Check one command or instruction against the policy.
    pub fn check(&self, command: &str) -> PermissionCheck {
        for rule in &self.hard_rules {
            if rule.pattern.is_match(command) {
                return PermissionCheck::blocked(
                    format!("{} is not permitted", rule.description),
                    rule.severity,
                );
            }
        }

        for rule in &self.warning_rules {
            if rule.pattern.is_match(command) {
                return PermissionCheck::warned(rule.advisory.to_string());
            }
        }

        PermissionCheck::allowed()
    }

    /// Check a multi-line body, skipping blank and comment lines. The result
    /// is blocked if any line is blocked (first refusal wins); warnings from
    /// allowed lines are joined.
    pub fn check_multiple(&self, text: &str) -> PermissionCheck {
        let mut warnings = Vec::new();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
                continue;
            }
            let check = self.check(line);
            if !check.allowed {
                return check;
            }
            if let Some(warning) = check.warning {
                warnings.push(warning);
            }
        }

        if warnings.is_empty() {
            PermissionCheck::allowed()
        } else {
            PermissionCheck::warned(warnings.join("; "))
        }
    }

    /// Scan free text for destructive commands the agent declared. Matches
    /// both the hard-block bank (the agent should never have run these) and
    /// the confirmation bank; every finding is surfaced for approval.
    pub fn detect_destructive(&self, text: &str) -> Vec<DetectedCommand> {
        let mut detections = Vec::new();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            for rule in self.hard_rules.iter().chain(&self.confirmation_rules) {
                if let Some(found) = rule.pattern.find(line) {
                    detections.push(DetectedCommand {
                        command: found.as_str().trim().to_string(),
                        action: rule.description.to_string(),
                        severity: rule.severity,
                    });
                    // One finding per line keeps approval prompts readable.
                    break;
                }
            }
        }

        detections
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_force_push() {
        let guard = PermissionGuard::new().unwrap();
        let check = guard.check("git push --force origin main");
        assert!(!check.allowed);
        assert_eq!(check.severity, Some(Severity::Critical));
        assert!(check.blocked_reason.unwrap().contains("Force push"));
    }

    #[test]
    fn blocks_short_force_flag() {
        let guard = PermissionGuard::new().unwrap();
        assert!(!guard.check("git push -f origin feature").allowed);
    }

    #[test]
    fn force_with_lease_is_not_hard_blocked() {
        let guard = PermissionGuard::new().unwrap();
        let check = guard.check("git push --force-with-lease origin feature");
        assert!(check.allowed);
        // But the detector flags it for confirmation.
        let detections = guard.detect_destructive("git push --force-with-lease origin feature");
        assert_eq!(detections.len(), 1);
        assert!(detections[0].action.contains("lease"));
    }

    #[test]
    fn blocks_filesystem_wipes() {
        let guard = PermissionGuard::new().unwrap();
        assert!(!guard.check("rm -rf /").allowed);
        assert!(!guard.check("rm -rf ~").allowed);
        assert!(!guard.check("rm -rf ~/").allowed);
        assert!(!guard.check("sudo rm important.txt").allowed);
    }

    #[test]
    fn allows_scoped_recursive_delete() {
        let guard = PermissionGuard::new().unwrap();
        // Deleting a project subdirectory is approval-worthy, not blocked.
        let check = guard.check("rm -rf target/debug");
        assert!(check.allowed);
        assert!(!guard.detect_destructive("rm -rf target/debug").is_empty());
    }

    #[test]
    fn blocks_repo_and_branch_deletion() {
        let guard = PermissionGuard::new().unwrap();
        assert!(!guard.check("gh repo delete acme/app --yes").allowed);
        assert!(!guard.check("git push origin --delete feature-x").allowed);
        assert!(!guard.check("git push origin :feature-x").allowed);
        assert!(!guard.check("npm unpublish my-pkg@1.0.0").allowed);
    }

    #[test]
    fn warns_on_protected_branch_push() {
        let guard = PermissionGuard::new().unwrap();
        let check = guard.check("git push origin main");
        assert!(check.allowed);
        assert!(check.warning.unwrap().contains("protected branch"));

        let check = guard.check("npm publish");
        assert!(check.allowed);
        assert!(check.warning.is_some());
    }

    #[test]
    fn plain_operations_pass_clean() {
        let guard = PermissionGuard::new().unwrap();
        for command in [
            "git status",
            "git commit -m 'fix readme'",
            "cargo test",
            "update the readme with install steps",
        ] {
            let check = guard.check(command);
            assert!(check.allowed, "{command} should be allowed");
            assert!(check.warning.is_none(), "{command} should not warn");
        }
    }

    #[test]
    fn check_is_deterministic() {
        let guard = PermissionGuard::new().unwrap();
        let first = guard.check("git reset --hard HEAD~3");
        let second = guard.check("git reset --hard HEAD~3");
        assert_eq!(first, second);
        assert!(!first.allowed);
    }

    #[test]
    fn check_multiple_skips_comments() {
        let guard = PermissionGuard::new().unwrap();
        let script = "# cleanup script\n// old: git push --force\ngit status\n\ngit push origin main\n";
        let check = guard.check_multiple(script);
        assert!(check.allowed);
        assert!(check.warning.is_some());

        let script = "git status\ngit push --force origin main\n";
        assert!(!guard.check_multiple(script).allowed);
    }

    #[test]
    fn detector_reports_one_finding_per_line() {
        let guard = PermissionGuard::new().unwrap();
        let response =
            "I cleaned up:\nrm -rf build/\ngit clean -fd\nThen committed the changes.";
        let detections = guard.detect_destructive(response);
        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].command, "rm -rf build/");
    }

    #[test]
    fn detector_is_quiet_on_benign_text() {
        let guard = PermissionGuard::new().unwrap();
        assert!(guard
            .detect_destructive("Updated the README and added tests; all green.")
            .is_empty());
    }
}
