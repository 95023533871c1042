//! Config-protection policy.
//!
//! A path is protected when it matches any pattern from the protect list and
//! no pattern from the mask list.  Patterns name directories or prefixes:
//! protection applies to paths *under* a pattern, not to the pattern path
//! itself.  The mask always wins, and both lists are pure ORs with no
//! ordering sensitivity.

use globset::{Glob, GlobSet, GlobSetBuilder};
use thiserror::Error;

/// A protect or mask pattern failed to compile.
#[derive(Error, Debug)]
#[error("invalid config-protect pattern '{pattern}': {source}")]
pub struct PatternError {
    /// The offending pattern as given.
    pub pattern: String,
    /// Underlying glob compilation error.
    source: globset::Error,
}

/// Compiled protect/mask pattern lists.
///
/// Built once per merge or unmerge operation and immutable thereafter.
#[derive(Debug)]
pub struct ProtectionPolicy {
    protect: GlobSet,
    mask: GlobSet,
}

impl ProtectionPolicy {
    /// Compile `protect` and `mask` pattern lists into a policy.
    ///
    /// Each pattern is normalised by stripping trailing slashes and compiled
    /// as `<pattern>/*`, so `/etc` protects `/etc/passwd` and `/etc/a/b` but
    /// not `/etc` itself, and a bare `/` protects everything.
    ///
    /// # Errors
    ///
    /// Returns [`PatternError`] if any pattern fails to compile.
    pub fn new(protect: &[String], mask: &[String]) -> Result<Self, PatternError> {
        Ok(Self {
            protect: compile(protect)?,
            mask: compile(mask)?,
        })
    }

    /// Is the root-relative `path` config-protected?
    ///
    /// An empty path is treated as `/`.
    #[must_use]
    pub fn is_protected(&self, path: &str) -> bool {
        let path = if path.is_empty() { "/" } else { path };
        self.protect.is_match(path) && !self.mask.is_match(path)
    }
}

fn compile(patterns: &[String]) -> Result<GlobSet, PatternError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let base = pattern.trim_end_matches('/');
        // `*` must be able to cross `/` here (fnmatch without FNM_PATHNAME),
        // which is globset's default.
        let glob = Glob::new(&format!("{base}/*")).map_err(|source| PatternError {
            pattern: pattern.clone(),
            source,
        })?;
        builder.add(glob);
    }
    builder.build().map_err(|source| PatternError {
        pattern: patterns.join(" "),
        source,
    })
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn policy(protect: &[&str], mask: &[&str]) -> ProtectionPolicy {
        let protect: Vec<String> = protect.iter().map(ToString::to_string).collect();
        let mask: Vec<String> = mask.iter().map(ToString::to_string).collect();
        ProtectionPolicy::new(&protect, &mask).unwrap()
    }

    #[test]
    fn path_under_protected_prefix() {
        let p = policy(&["/etc"], &[]);
        assert!(p.is_protected("/etc/passwd"));
        assert!(p.is_protected("/etc/env.d/gcc"));
        assert!(!p.is_protected("/usr/bin/ls"));
    }

    #[test]
    fn prefix_itself_is_not_protected() {
        let p = policy(&["/etc"], &[]);
        assert!(!p.is_protected("/etc"));
    }

    #[test]
    fn bare_root_protects_everything() {
        let p = policy(&["/"], &[]);
        assert!(p.is_protected("/protected_file"));
        assert!(p.is_protected("/deep/ly/nested"));
    }

    #[test]
    fn trailing_slash_is_normalised() {
        let p = policy(&["/etc/"], &[]);
        assert!(p.is_protected("/etc/passwd"));
    }

    #[test]
    fn mask_overrides_protect() {
        let p = policy(&["/etc"], &["/etc/env.d"]);
        assert!(p.is_protected("/etc/passwd"));
        assert!(!p.is_protected("/etc/env.d/gcc"));
    }

    #[test]
    fn mask_without_protect_match_is_irrelevant() {
        let p = policy(&["/etc"], &["/usr"]);
        assert!(p.is_protected("/etc/passwd"));
        assert!(!p.is_protected("/usr/share/doc"));
    }

    #[test]
    fn multiple_protect_entries_are_ored() {
        let p = policy(&["/etc", "/usr/share/config"], &[]);
        assert!(p.is_protected("/etc/hosts"));
        assert!(p.is_protected("/usr/share/config/kdeglobals"));
        assert!(!p.is_protected("/usr/share/doc/README"));
    }

    #[test]
    fn empty_candidate_is_treated_as_root() {
        let p = policy(&["/"], &[]);
        // "" normalises to "/", which is the prefix itself, not under it.
        assert!(!p.is_protected(""));
    }

    #[test]
    fn empty_lists_protect_nothing() {
        let p = policy(&[], &[]);
        assert!(!p.is_protected("/etc/passwd"));
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let err = ProtectionPolicy::new(&["/etc/[".to_string()], &[]);
        assert!(err.is_err());
    }
}
