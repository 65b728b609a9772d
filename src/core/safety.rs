//! Input admission limits.
//!
//! Keeps the pipeline away from:
//! - Oversized inputs
//! - Secrets (denylisted glob patterns)
//! - Runaway external calls (per-call timeout)

use std::path::Path;
use std::time::Duration;

use glob::Pattern;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Limits applied before and during processing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyLimits {
    /// Maximum input file size in bytes (default: 2GB)
    #[serde(default = "default_max_input_bytes")]
    pub max_input_bytes: u64,

    /// Maximum characters handed to Refinery (default: 400k)
    #[serde(default = "default_max_text_chars")]
    pub max_text_chars: usize,

    /// Timeout for any single external call in seconds (default: 1800)
    #[serde(default = "default_step_timeout")]
    pub step_timeout_seconds: u64,

    /// Glob patterns to reject (files matching these won't be processed)
    #[serde(default = "default_denylist")]
    pub denylist_patterns: Vec<String>,
}

fn default_max_input_bytes() -> u64 {
    2 * 1024 * 1024 * 1024
}
fn default_max_text_chars() -> usize {
    400_000
}
fn default_step_timeout() -> u64 {
    1800
} // 30 min, long recordings

fn default_denylist() -> Vec<String> {
    vec![
        "**/.env*".to_string(),
        "**/secrets*".to_string(),
        "**/*credential*".to_string(),
        "**/*.pem".to_string(),
        "**/*.key".to_string(),
    ]
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_input_bytes: default_max_input_bytes(),
            max_text_chars: default_max_text_chars(),
            step_timeout_seconds: default_step_timeout(),
            denylist_patterns: default_denylist(),
        }
    }
}

impl SafetyLimits {
    /// Check if a path matches any denylist pattern
    pub fn is_denylisted(&self, path: &str) -> bool {
        for pattern_str in &self.denylist_patterns {
            if let Ok(pattern) = Pattern::new(pattern_str) {
                if pattern.matches(path) {
                    return true;
                }
            }
        }
        false
    }

    /// Validate a candidate file against size limit and denylist
    pub fn validate_file(&self, path: &Path, size: u64) -> Result<(), SafetyViolation> {
        let path_str = path.to_string_lossy();
        if self.is_denylisted(&path_str) {
            return Err(SafetyViolation::DenylistMatch {
                path: path_str.to_string(),
            });
        }

        if size > self.max_input_bytes {
            return Err(SafetyViolation::MaxInputBytes {
                actual: size,
                limit: self.max_input_bytes,
            });
        }

        Ok(())
    }

    /// Clip text to the Refinery limit on a char boundary
    pub fn clip_text<'a>(&self, text: &'a str) -> &'a str {
        match text.char_indices().nth(self.max_text_chars) {
            Some((idx, _)) => &text[..idx],
            None => text,
        }
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_seconds)
    }
}

/// Safety violation errors
#[derive(Debug, Clone, Error)]
pub enum SafetyViolation {
    #[error("Maximum input bytes exceeded: {actual} > {limit}")]
    MaxInputBytes { actual: u64, limit: u64 },

    #[error("Path matches denylist pattern: {path}")]
    DenylistMatch { path: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = SafetyLimits::default();
        assert_eq!(limits.max_input_bytes, 2 * 1024 * 1024 * 1024);
        assert_eq!(limits.step_timeout(), Duration::from_secs(1800));
    }

    #[test]
    fn test_denylist_matching() {
        let limits = SafetyLimits::default();

        assert!(limits.is_denylisted(".env"));
        assert!(limits.is_denylisted("drop/.env.local"));
        assert!(limits.is_denylisted("drop/secrets.txt"));
        assert!(limits.is_denylisted("keys/server.key"));

        assert!(!limits.is_denylisted("drop/memo.m4a"));
        assert!(!limits.is_denylisted("drop/notes.md"));
    }

    #[test]
    fn test_validate_file_size() {
        let limits = SafetyLimits {
            max_input_bytes: 100,
            ..Default::default()
        };

        assert!(limits.validate_file(Path::new("a.md"), 50).is_ok());
        assert!(matches!(
            limits.validate_file(Path::new("a.md"), 200),
            Err(SafetyViolation::MaxInputBytes { .. })
        ));
    }

    #[test]
    fn test_clip_text_respects_char_boundaries() {
        let limits = SafetyLimits {
            max_text_chars: 3,
            ..Default::default()
        };
        assert_eq!(limits.clip_text("żółw"), "żół");
        assert_eq!(limits.clip_text("ab"), "ab");
    }
}
