//! Command-line interface.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Install package images onto a live root and remove them again.
#[derive(Parser, Debug)]
#[command(name = "pkgmerge", version, about)]
pub struct Cli {
    /// Print informational notes as well as status lines.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Install a prepared image onto a root, writing a contents manifest.
    Merge(MergeArgs),
    /// Remove a merged package by replaying its contents manifest.
    Unmerge(UnmergeArgs),
}

#[derive(Args, Debug)]
pub struct MergeArgs {
    /// The fully prepared image tree to install.
    #[arg(long, value_name = "DIR")]
    pub image: PathBuf,

    /// The destination root.
    #[arg(long, value_name = "DIR")]
    pub root: PathBuf,

    /// Where to write the contents manifest.
    #[arg(long, value_name = "FILE")]
    pub contents: PathBuf,

    /// Config-protection pattern; repeatable. Falls back to $CONFIG_PROTECT.
    #[arg(long = "config-protect", value_name = "PATTERN")]
    pub config_protect: Vec<String>,

    /// Pattern that switches protection back off; repeatable. Falls back to
    /// $CONFIG_PROTECT_MASK.
    #[arg(long = "config-protect-mask", value_name = "PATTERN")]
    pub config_protect_mask: Vec<String>,

    /// Bump source mtimes older than this (seconds since the epoch).
    #[arg(long, value_name = "SECS")]
    pub fix_mtimes_before: Option<i64>,

    /// Skip ownership normalisation.
    #[arg(long)]
    pub no_chown: bool,

    /// Merge empty image directories without a warning.
    #[arg(long)]
    pub allow_empty_dirs: bool,

    /// Rebase absolute symlink targets that point into the image.
    #[arg(long)]
    pub rewrite_symlinks: bool,

    /// Replace destination objects of a conflicting kind instead of failing.
    #[arg(long)]
    pub replace_conflicting: bool,
}

#[derive(Args, Debug)]
pub struct UnmergeArgs {
    /// The root the package was merged onto.
    #[arg(long, value_name = "DIR")]
    pub root: PathBuf,

    /// The contents manifest written at merge time.
    #[arg(long, value_name = "FILE")]
    pub contents: PathBuf,

    /// Config-protection pattern; repeatable. Falls back to $CONFIG_PROTECT.
    #[arg(long = "config-protect", value_name = "PATTERN")]
    pub config_protect: Vec<String>,

    /// Pattern that switches protection back off; repeatable. Falls back to
    /// $CONFIG_PROTECT_MASK.
    #[arg(long = "config-protect-mask", value_name = "PATTERN")]
    pub config_protect_mask: Vec<String>,
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]
mod tests {
    use clap::CommandFactory as _;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_merge_with_all_flags() {
        let cli = Cli::parse_from([
            "pkgmerge",
            "merge",
            "--image",
            "/tmp/image",
            "--root",
            "/",
            "--contents",
            "/var/db/pkg/CONTENTS",
            "--config-protect",
            "/etc",
            "--config-protect",
            "/usr/share/config",
            "--config-protect-mask",
            "/etc/env.d",
            "--fix-mtimes-before",
            "1600000000",
            "--no-chown",
            "--allow-empty-dirs",
            "--rewrite-symlinks",
            "--replace-conflicting",
        ]);
        let Command::Merge(args) = cli.command else {
            panic!("expected merge subcommand");
        };
        assert_eq!(args.image, PathBuf::from("/tmp/image"));
        assert_eq!(args.config_protect, vec!["/etc", "/usr/share/config"]);
        assert_eq!(args.config_protect_mask, vec!["/etc/env.d"]);
        assert_eq!(args.fix_mtimes_before, Some(1_600_000_000));
        assert!(args.no_chown);
        assert!(args.allow_empty_dirs);
        assert!(args.rewrite_symlinks);
        assert!(args.replace_conflicting);
    }

    #[test]
    fn parses_unmerge() {
        let cli = Cli::parse_from([
            "pkgmerge",
            "unmerge",
            "--root",
            "/",
            "--contents",
            "/var/db/pkg/CONTENTS",
        ]);
        let Command::Unmerge(args) = cli.command else {
            panic!("expected unmerge subcommand");
        };
        assert_eq!(args.root, PathBuf::from("/"));
        assert!(args.config_protect.is_empty());
    }

    #[test]
    fn merge_requires_an_image() {
        let result = Cli::try_parse_from(["pkgmerge", "merge", "--root", "/", "--contents", "c"]);
        assert!(result.is_err());
    }

    #[test]
    fn verbose_is_global() {
        let cli = Cli::parse_from([
            "pkgmerge",
            "unmerge",
            "--root",
            "/",
            "--contents",
            "c",
            "--verbose",
        ]);
        assert!(cli.verbose);
    }
}
