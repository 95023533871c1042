//! The `merge` subcommand.

use std::env;

use anyhow::{Context as _, Result};

use crate::cli::MergeArgs;
use crate::logging::Logger;
use crate::merge::{MergeOptions, Merger};

/// Merge the image onto the root and persist the contents manifest.
///
/// # Errors
///
/// Fails if the trees are unusable, the merge itself aborts, or the manifest
/// cannot be written.
pub fn run(args: MergeArgs, log: Logger) -> Result<()> {
    let options = MergeOptions {
        image: args.image,
        root: args.root,
        config_protect: super::patterns_or(args.config_protect, env::var("CONFIG_PROTECT").ok()),
        config_protect_mask: super::patterns_or(
            args.config_protect_mask,
            env::var("CONFIG_PROTECT_MASK").ok(),
        ),
        fix_mtimes_before: args.fix_mtimes_before,
        no_chown: args.no_chown,
        allow_empty_dirs: args.allow_empty_dirs,
        rewrite_symlinks: args.rewrite_symlinks,
        replace_conflicting: args.replace_conflicting,
    };

    let merger = Merger::new(options, log).context("cannot start merge")?;
    let manifest = merger.run().context("merge aborted")?;
    manifest.save(&args.contents).with_context(|| {
        format!(
            "cannot write contents manifest '{}'",
            args.contents.display()
        )
    })?;
    log.info(&format!("merged {} entries", manifest.entries().len()));
    Ok(())
}
