//! The `unmerge` subcommand.

use std::env;

use anyhow::{Context as _, Result};

use crate::cli::UnmergeArgs;
use crate::contents::ContentsManifest;
use crate::logging::Logger;
use crate::unmerge::{UnmergeOptions, Unmerger};

/// Replay the contents manifest against the root and return the anomaly
/// bitset, which becomes the process exit code.
///
/// # Errors
///
/// Fails if the manifest or root is unusable, or a deletion fails outright.
/// Skipped entries are not errors; they are reflected in the returned bits.
pub fn run(args: UnmergeArgs, log: Logger) -> Result<u8> {
    let (manifest, defects) = ContentsManifest::load(&args.contents).with_context(|| {
        format!(
            "cannot read contents manifest '{}'",
            args.contents.display()
        )
    })?;

    let options = UnmergeOptions {
        root: args.root,
        config_protect: super::patterns_or(args.config_protect, env::var("CONFIG_PROTECT").ok()),
        config_protect_mask: super::patterns_or(
            args.config_protect_mask,
            env::var("CONFIG_PROTECT_MASK").ok(),
        ),
    };

    let unmerger = Unmerger::new(options, manifest, defects, log).context("cannot start unmerge")?;
    let status = unmerger.run().context("unmerge aborted")?;
    if status == 0 {
        log.info("unmerge completed cleanly");
    } else {
        log.warn(&format!("unmerge completed with residue (status {status})"));
    }
    Ok(status)
}
