//! Subcommand orchestration.

pub mod merge;
pub mod unmerge;

/// Use the patterns given on the command line, or fall back to a
/// whitespace-separated environment value.
fn patterns_or(given: Vec<String>, fallback: Option<String>) -> Vec<String> {
    if !given.is_empty() {
        return given;
    }
    fallback
        .map(|value| value.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}
