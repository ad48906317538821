//! Failure classification for dead jobs.
//!
//! Rules are checked in order against the lowercased error text; the first
//! match wins. No match means `Unknown`.

use serde::Serialize;

use jobq_core::Job;

/// Coarse failure cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    CommandNotFound,
    PermissionDenied,
    Timeout,
    ConnectionError,
    MemoryError,
    Unknown,
}

struct Rule {
    category: FailureCategory,
    matches: fn(&str) -> bool,
}

const RULES: [Rule; 5] = [
    Rule {
        category: FailureCategory::CommandNotFound,
        matches: |e| e.contains("command not found") || e.contains("no such file"),
    },
    Rule {
        category: FailureCategory::PermissionDenied,
        matches: |e| e.contains("permission denied"),
    },
    Rule {
        category: FailureCategory::Timeout,
        matches: |e| e.contains("timeout") || e.contains("timed out"),
    },
    Rule {
        category: FailureCategory::ConnectionError,
        matches: |e| e.contains("connection") && (e.contains("refused") || e.contains("failed")),
    },
    Rule {
        category: FailureCategory::MemoryError,
        matches: |e| e.contains("out of memory") || e.contains("memory error"),
    },
];

impl FailureCategory {
    pub fn classify(error: &str) -> Self {
        let lowered = error.to_lowercase();
        RULES
            .iter()
            .find(|rule| (rule.matches)(&lowered))
            .map_or(Self::Unknown, |rule| rule.category)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::CommandNotFound => "command_not_found",
            Self::PermissionDenied => "permission_denied",
            Self::Timeout => "timeout",
            Self::ConnectionError => "connection_error",
            Self::MemoryError => "memory_error",
            Self::Unknown => "unknown",
        }
    }

    pub fn likely_cause(self) -> &'static str {
        match self {
            Self::CommandNotFound => "Command or file does not exist",
            Self::PermissionDenied => "Insufficient permissions",
            Self::Timeout => "Command execution timeout",
            Self::ConnectionError => "Network or service connectivity issue",
            Self::MemoryError => "Insufficient memory",
            Self::Unknown => "Unknown error",
        }
    }

    /// Whether running the same command again might succeed.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Timeout | Self::ConnectionError | Self::MemoryError)
    }

    fn remedies(self, job: &Job) -> Vec<String> {
        let fixed: &[&str] = match self {
            Self::CommandNotFound => &[
                "Check if the command exists and is in PATH",
                "Verify file paths are correct",
                "Install missing dependencies",
            ],
            Self::PermissionDenied => &[
                "Check file/directory permissions",
                "Run with appropriate user privileges",
                "Verify access to required resources",
            ],
            Self::Timeout => {
                let current = job
                    .timeout
                    .map_or_else(|| "default".to_string(), |t| t.to_string());
                return vec![
                    format!("Increase job timeout (currently {current})"),
                    "Optimize command performance".to_string(),
                    "Check for hanging processes".to_string(),
                ];
            }
            Self::ConnectionError => &[
                "Check network connectivity",
                "Verify service availability",
                "Check firewall settings",
            ],
            Self::MemoryError => &[
                "Increase available memory",
                "Optimize command memory usage",
                "Process data in smaller chunks",
            ],
            Self::Unknown => &[],
        };
        fixed.iter().map(|s| s.to_string()).collect()
    }
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of one error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ErrorAnalysis {
    pub error_type: FailureCategory,
    pub likely_cause: &'static str,
    pub is_retryable: bool,
}

pub fn analyze_error(error: &str) -> ErrorAnalysis {
    let category = FailureCategory::classify(error);
    ErrorAnalysis {
        error_type: category,
        likely_cause: category.likely_cause(),
        is_retryable: category.is_retryable(),
    }
}

/// Remediation hints for a dead job, most specific first.
pub fn failure_suggestions(job: &Job) -> Vec<String> {
    let mut suggestions = job
        .error
        .as_deref()
        .map(|e| FailureCategory::classify(e).remedies(job))
        .unwrap_or_default();

    if job.attempts >= job.max_retries {
        suggestions.push(format!(
            "Job exceeded max retries ({}), consider increasing max_retries",
            job.max_retries
        ));
    }
    suggestions.push("Check command syntax and arguments".to_string());
    suggestions.push("Test command manually in same environment".to_string());
    suggestions
}
