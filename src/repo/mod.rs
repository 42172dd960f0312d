//! Repo detection over free-form instruction text.
//!
//! The detector turns "fix the login bug in acme/webapp" into the queue
//! partition key `acme/webapp`. It never blocks an instruction: a miss is
//! simply the default workspace at low confidence.

use crate::{constants::DEFAULT_REPO_KEY, ConductorError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

/// What the detector extracted from one instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct RepoDetection {
    pub repo_key: String,
    pub org: Option<String>,
    pub repo: Option<String>,
    pub is_new_repo: bool,
    pub confidence: Confidence,
}

impl RepoDetection {
    fn default_key() -> Self {
        Self {
            repo_key: DEFAULT_REPO_KEY.to_string(),
            org: None,
            repo: None,
            is_new_repo: false,
            confidence: Confidence::Low,
        }
    }
}

/// Ordered pattern ladder, most specific first; the first match wins.
pub struct RepoDetector {
    new_repo: Regex,
    github_url: Regex,
    clone_command: Regex,
    org_then_repo: Regex,
    switch_repo: Regex,
    org_slash_repo: Regex,
    the_x_repo: Regex,
    same_repo: Regex,
    github_org: Option<String>,
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| {
        ConductorError::ConfigurationError(format!("Invalid repo pattern {pattern:?}: {e}"))
    })
}

impl RepoDetector {
    pub fn new(github_org: Option<String>) -> Result<Self> {
        // Repo-name grammar: GitHub allows word chars, dots and dashes.
        Ok(Self {
            new_repo: compile(
                r"(?i)(?:create|make|start)\s+(?:a\s+)?new\s+repo(?:sitory)?\s+(?:called|named)\s+([\w.-]+)",
            )?,
            github_url: compile(
                r"(?i)github\.com[:/]([\w.-]+)/([\w.-]+?)(?:\.git)?(?:[/\s]|$)",
            )?,
            clone_command: compile(
                r"(?i)(?:git\s+clone|gh\s+repo\s+clone)\s+(?:https://github\.com/|git@github\.com:)?([\w.-]+)/([\w.-]+?)(?:\.git)?(?:\s|$)",
            )?,
            org_then_repo: compile(
                r"(?i)go\s+to\s+org(?:anization)?\s+([\w.-]+),?\s+(?:and\s+)?repo(?:sitory)?\s+([\w.-]+)",
            )?,
            switch_repo: compile(
                r"(?i)(?:switch\s+to|use|work\s+on)\s+(?:the\s+)?repo(?:sitory)?\s+([\w.-]+(?:/[\w.-]+)?)",
            )?,
            org_slash_repo: compile(
                r"(?i)(?:\b(?:in|on|to|for|at|from)\s+)([\w.-]+)/([\w.-]+)",
            )?,
            the_x_repo: compile(r"(?i)\bthe\s+([\w.-]+)\s+repo(?:sitory)?\b")?,
            same_repo: compile(r"(?i)\b(?:same|current|this)\s+repo(?:sitory)?\b")?,
            github_org,
        })
    }

    /// Extract a repo key from instruction text. Never fails; falls through
    /// to the default key at low confidence.
    pub fn detect(&self, text: &str) -> RepoDetection {
        let text = text.trim();
        if text.is_empty() {
            return RepoDetection::default_key();
        }

        if let Some(caps) = self.new_repo.captures(text) {
            return self.qualified(&caps[1], None, true, Confidence::High);
        }

        if let Some(caps) = self.github_url.captures(text) {
            return self.qualified(&caps[2], Some(&caps[1]), false, Confidence::High);
        }

        if let Some(caps) = self.clone_command.captures(text) {
            return self.qualified(&caps[2], Some(&caps[1]), false, Confidence::High);
        }

        if let Some(caps) = self.org_then_repo.captures(text) {
            return self.qualified(&caps[2], Some(&caps[1]), false, Confidence::High);
        }

        if let Some(caps) = self.switch_repo.captures(text) {
            let target = &caps[1];
            return match target.split_once('/') {
                Some((org, repo)) => self.qualified(repo, Some(org), false, Confidence::Medium),
                None => self.qualified(target, None, false, Confidence::Medium),
            };
        }

        if let Some(caps) = self.org_slash_repo.captures(text) {
            return self.qualified(&caps[2], Some(&caps[1]), false, Confidence::Medium);
        }

        if let Some(caps) = self.the_x_repo.captures(text) {
            let name = &caps[1];
            // "the same repo" and friends are handled below, not as a name.
            if !matches!(
                name.to_lowercase().as_str(),
                "same" | "current" | "this" | "new"
            ) {
                return self.qualified(name, None, false, Confidence::Medium);
            }
        }

        if self.same_repo.is_match(text) {
            return RepoDetection {
                confidence: Confidence::High,
                ..RepoDetection::default_key()
            };
        }

        RepoDetection::default_key()
    }

    fn qualified(
        &self,
        repo: &str,
        org: Option<&str>,
        is_new_repo: bool,
        confidence: Confidence,
    ) -> RepoDetection {
        let repo = normalize(repo);
        let org = org
            .map(normalize)
            .or_else(|| self.github_org.as_deref().map(normalize))
            .filter(|o| !o.is_empty());

        let repo_key = match &org {
            Some(org) => format!("{org}/{repo}"),
            None => repo.clone(),
        };

        RepoDetection {
            repo_key,
            org,
            repo: Some(repo),
            is_new_repo,
            confidence,
        }
    }
}

/// Canonical repo-key form: lowercase, trimmed, no trailing slash, no
/// `.git` suffix.
pub fn normalize(part: &str) -> String {
    let part = part.trim().trim_end_matches('/').to_lowercase();
    part.strip_suffix(".git").unwrap_or(&part).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> RepoDetector {
        RepoDetector::new(None).unwrap()
    }

    #[test]
    fn detects_github_url() {
        let detection = detector().detect("look at https://github.com/Acme/WebApp and fix CI");
        assert_eq!(detection.repo_key, "acme/webapp");
        assert_eq!(detection.org.as_deref(), Some("acme"));
        assert_eq!(detection.confidence, Confidence::High);
        assert!(!detection.is_new_repo);
    }

    #[test]
    fn detects_url_with_git_suffix() {
        let detection = detector().detect("clone git@github.com:acme/webapp.git please");
        assert_eq!(detection.repo_key, "acme/webapp");
    }

    #[test]
    fn detects_new_repo_request() {
        let detection = detector().detect("create a new repo called scratchpad");
        assert_eq!(detection.repo_key, "scratchpad");
        assert!(detection.is_new_repo);
        assert_eq!(detection.confidence, Confidence::High);
    }

    #[test]
    fn detects_clone_command() {
        let detection = detector().detect("run gh repo clone acme/tooling");
        assert_eq!(detection.repo_key, "acme/tooling");
        assert_eq!(detection.confidence, Confidence::High);
    }

    #[test]
    fn detects_org_then_repo_phrase() {
        let detection = detector().detect("go to org acme, repo billing");
        assert_eq!(detection.repo_key, "acme/billing");
    }

    #[test]
    fn detects_switch_phrase() {
        let detection = detector().detect("switch to the repo dashboard");
        assert_eq!(detection.repo_key, "dashboard");
        assert_eq!(detection.confidence, Confidence::Medium);
    }

    #[test]
    fn detects_bareword_with_preposition() {
        let detection = detector().detect("fix the login bug in acme/webapp");
        assert_eq!(detection.repo_key, "acme/webapp");
        assert_eq!(detection.confidence, Confidence::Medium);
    }

    #[test]
    fn detects_the_x_repo() {
        let detection = detector().detect("update the changelog in the billing repo");
        assert_eq!(detection.repo_key, "billing");
    }

    #[test]
    fn same_repo_resolves_to_default() {
        let detection = detector().detect("do the same thing in the same repo");
        assert_eq!(detection.repo_key, DEFAULT_REPO_KEY);
        assert_eq!(detection.confidence, Confidence::High);
    }

    #[test]
    fn miss_falls_through_to_default() {
        let detection = detector().detect("what's the weather like");
        assert_eq!(detection.repo_key, DEFAULT_REPO_KEY);
        assert_eq!(detection.confidence, Confidence::Low);
    }

    #[test]
    fn empty_instruction_is_default_low() {
        let detection = detector().detect("");
        assert_eq!(detection.repo_key, DEFAULT_REPO_KEY);
        assert_eq!(detection.confidence, Confidence::Low);
    }

    #[test]
    fn bare_names_pick_up_configured_org() {
        let detector = RepoDetector::new(Some("Acme".to_string())).unwrap();
        let detection = detector.detect("switch to repo dashboard");
        assert_eq!(detection.repo_key, "acme/dashboard");
        assert_eq!(detection.org.as_deref(), Some("acme"));
    }

    #[test]
    fn explicit_org_beats_configured_org() {
        let detector = RepoDetector::new(Some("acme".to_string())).unwrap();
        let detection = detector.detect("fix tests in other/webapp");
        assert_eq!(detection.repo_key, "other/webapp");
    }

    #[test]
    fn detect_is_idempotent_on_its_own_output() {
        let detector = detector();
        let first = detector.detect("work on acme/webapp for me");
        let second = detector.detect(&format!("work on {} for me", first.repo_key));
        assert_eq!(first.repo_key, second.repo_key);
    }

    #[test]
    fn normalize_canonicalizes() {
        assert_eq!(normalize("  Acme/"), "acme");
        assert_eq!(normalize("WebApp.git"), "webapp");
    }
}
