//! Intake checks for producer-supplied commands.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{JobError, JobResult};

static DANGEROUS_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"(?i)rm\s+-rf\s+/", "recursive delete from root"),
        (r"(?i):\(\)\{.*\};", "fork bomb"),
        (r"(?i)>\s*/dev/sd[a-z]", "raw disk write"),
    ]
    .into_iter()
    .filter_map(|(pattern, label)| Regex::new(pattern).ok().map(|re| (re, label)))
    .collect()
});

/// Reject empty commands and a small set of obviously destructive ones.
pub fn validate_command(command: &str) -> JobResult<()> {
    if command.trim().is_empty() {
        return Err(JobError::validation("command must not be empty"));
    }

    if let Some((_, label)) = DANGEROUS_PATTERNS
        .iter()
        .find(|(re, _)| re.is_match(command))
    {
        return Err(JobError::validation(format!(
            "command rejected as potentially dangerous ({label})"
        )));
    }

    Ok(())
}
