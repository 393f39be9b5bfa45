//! Shared utilities

use ember_agent::{BudgetPass, CompactionReason};

/// Truncate a string to `max` characters, appending "..." if truncated.
/// Operates on Unicode char boundaries, not bytes.
pub fn truncate_chars(s: &str, max: usize) -> String {
    let mut chars = s.chars();
    let truncated: String = chars.by_ref().take(max).collect();
    if chars.next().is_some() {
        format!("{}...", truncated)
    } else {
        truncated
    }
}

/// Format a compaction reason for display.
pub fn compaction_reason_str(reason: CompactionReason) -> &'static str {
    match reason {
        CompactionReason::Budget => "over budget",
        CompactionReason::Overflow => "rejected as too large",
        CompactionReason::Manual => "manual",
    }
}

pub fn budget_passes_str(passes: &[BudgetPass]) -> String {
    passes
        .iter()
        .map(|p| match p {
            BudgetPass::Truncate => "truncate",
            BudgetPass::Prune => "prune",
            BudgetPass::Summarize => "summarize",
        })
        .collect::<Vec<_>>()
        .join(" + ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("hello", 10), "hello");
        assert_eq!(truncate_chars("hello world", 5), "hello...");
        assert_eq!(truncate_chars("ééé", 2), "éé...");
    }

    #[test]
    fn test_budget_passes_str() {
        assert_eq!(
            budget_passes_str(&[BudgetPass::Truncate, BudgetPass::Prune]),
            "truncate + prune"
        );
    }
}
