// Shared helpers for integration tests.
//
// Provides a temporary image/root pair and argument builders so each test can
// set up an isolated merge without repeating filesystem boilerplate.
//
// Used by all integration test binaries that declare `mod common;`.
#![allow(dead_code)]

use std::path::{Path, PathBuf};

use pkgmerge::cli::{MergeArgs, UnmergeArgs};
use pkgmerge::logging::Logger;

/// A disposable image/root/contents triple under one tempdir.
pub struct Sandbox {
    dir: tempfile::TempDir,
    pub image: PathBuf,
    pub root: PathBuf,
    pub contents: PathBuf,
}

impl Sandbox {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("create tempdir");
        let image = dir.path().join("image");
        let root = dir.path().join("root");
        let contents = dir.path().join("CONTENTS");
        std::fs::create_dir(&image).expect("create image dir");
        std::fs::create_dir(&root).expect("create root dir");
        Self {
            dir,
            image,
            root,
            contents,
        }
    }

    /// Merge arguments with ownership normalisation off, suitable for
    /// unprivileged test runs.
    pub fn merge_args(&self) -> MergeArgs {
        MergeArgs {
            image: self.image.clone(),
            root: self.root.clone(),
            contents: self.contents.clone(),
            config_protect: Vec::new(),
            config_protect_mask: Vec::new(),
            fix_mtimes_before: None,
            no_chown: true,
            allow_empty_dirs: true,
            rewrite_symlinks: false,
            replace_conflicting: false,
        }
    }

    pub fn unmerge_args(&self) -> UnmergeArgs {
        UnmergeArgs {
            root: self.root.clone(),
            contents: self.contents.clone(),
            config_protect: Vec::new(),
            config_protect_mask: Vec::new(),
        }
    }
}

pub fn quiet() -> Logger {
    Logger::new(false)
}

/// Create parent directories as needed and write `content` at `path`.
pub fn write(path: &Path, content: &[u8]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create parent dirs");
    }
    std::fs::write(path, content).expect("write file");
}
