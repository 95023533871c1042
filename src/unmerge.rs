//! The unmerge engine: replay a contents manifest and remove what it names.
//!
//! Deletion is conservative. Every entry is verified against its record
//! before anything is unlinked, and a file the user has touched since the
//! merge is left alone. Processing is two-pass: files, symlinks and misc
//! entries in manifest order first, then directories in reverse manifest
//! order so they have a chance to be empty by the time rmdir runs.
//!
//! Every entry produces exactly one status line: `<<<` when deleted,
//! `--- [code ]` when skipped. The run's return value is a bitset summarising
//! the anomalies encountered; zero means a fully clean unmerge.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::contents::{ContentsEntry, ContentsManifest, ManifestDefect};
use crate::error::UnmergeError;
use crate::fingerprint::fingerprint_file;
use crate::logging::Logger;
use crate::protect::ProtectionPolicy;

/// A manifest line could not be parsed for its kind.
pub const STATUS_MALFORMED_ENTRY: u8 = 1;
/// A manifest line carried an unknown entry kind.
pub const STATUS_UNKNOWN_KIND: u8 = 1 << 1;
/// An entry was skipped because the live object diverged from its record.
pub const STATUS_SKIPPED_MISMATCH: u8 = 1 << 2;
/// An entry was skipped because it is config-protected.
pub const STATUS_SKIPPED_PROTECTED: u8 = 1 << 3;

/// Everything an unmerge needs to know, gathered by the caller.
#[derive(Debug, Clone)]
pub struct UnmergeOptions {
    /// The root the package was merged onto.
    pub root: PathBuf,
    /// Config-protection patterns.
    pub config_protect: Vec<String>,
    /// Patterns that switch protection back off.
    pub config_protect_mask: Vec<String>,
}

/// One unmerge operation. Construct, then [`run`](Self::run) once.
#[derive(Debug)]
pub struct Unmerger {
    root: PathBuf,
    policy: ProtectionPolicy,
    manifest: ContentsManifest,
    defects: Vec<ManifestDefect>,
    log: Logger,
    status: u8,
}

impl Unmerger {
    /// Validate the root and compile the protection policy.
    ///
    /// # Errors
    ///
    /// Returns [`UnmergeError::BadRoot`] if the root is not a usable
    /// directory, or [`UnmergeError::Pattern`] for a bad protect pattern.
    pub fn new(
        options: UnmergeOptions,
        manifest: ContentsManifest,
        defects: Vec<ManifestDefect>,
        log: Logger,
    ) -> Result<Self, UnmergeError> {
        if !options.root.is_dir() {
            return Err(UnmergeError::BadRoot {
                path: options.root.display().to_string(),
            });
        }
        let policy = ProtectionPolicy::new(&options.config_protect, &options.config_protect_mask)?;
        Ok(Self {
            root: options.root,
            policy,
            manifest,
            defects,
            log,
            status: 0,
        })
    }

    /// Process every manifest entry and return the anomaly bitset.
    ///
    /// # Errors
    ///
    /// A deletion that fails for any reason other than the object already
    /// being gone is fatal. Verification mismatches are not errors.
    pub fn run(mut self) -> Result<u8, UnmergeError> {
        for defect in std::mem::take(&mut self.defects) {
            match defect {
                ManifestDefect::Malformed(line) => {
                    self.log.warn(&format!("malformed contents entry '{line}'"));
                    self.status |= STATUS_MALFORMED_ENTRY;
                }
                ManifestDefect::UnknownKind(line) => {
                    self.log
                        .warn(&format!("skipping contents entry of unknown kind '{line}'"));
                    self.status |= STATUS_UNKNOWN_KIND;
                }
            }
        }

        let entries = self.manifest.entries().to_vec();
        for entry in &entries {
            match entry {
                ContentsEntry::File { path, md5, mtime } => {
                    self.unmerge_file(path, md5, *mtime)?;
                }
                ContentsEntry::Sym {
                    path,
                    target,
                    mtime,
                } => self.unmerge_sym(path, target, *mtime)?,
                ContentsEntry::Other { path } => self.unmerge_other(path),
                ContentsEntry::Dir { .. } => {}
            }
        }
        for entry in entries.iter().rev() {
            if let ContentsEntry::Dir { path } = entry {
                self.unmerge_dir(path)?;
            }
        }
        Ok(self.status)
    }

    fn unmerge_file(&mut self, path: &str, md5: &str, mtime: i64) -> Result<(), UnmergeError> {
        use std::os::unix::fs::MetadataExt as _;

        let full = self.resolve(path);
        let Some(meta) = lstat(&full)? else {
            self.skip("gone ", path, 0);
            return Ok(());
        };
        if !meta.is_file() {
            self.skip("!type", path, STATUS_SKIPPED_MISMATCH);
            return Ok(());
        }
        if meta.mtime() != mtime {
            self.skip("!time", path, STATUS_SKIPPED_MISMATCH);
            return Ok(());
        }
        match fingerprint_file(&full) {
            Err(e) => {
                self.log
                    .warn(&format!("cannot fingerprint '{path}': {e}"));
                self.skip("!md5?", path, STATUS_SKIPPED_MISMATCH);
            }
            Ok(found) if found != md5 => self.skip("!md5 ", path, STATUS_SKIPPED_MISMATCH),
            Ok(_) if self.policy.is_protected(path) => {
                self.skip("cfgpr", path, STATUS_SKIPPED_PROTECTED);
            }
            Ok(_) => {
                fs::remove_file(&full).map_err(|e| UnmergeError::io("unlink", &full, e))?;
                self.deleted(path);
            }
        }
        Ok(())
    }

    fn unmerge_sym(&mut self, path: &str, target: &str, mtime: i64) -> Result<(), UnmergeError> {
        use std::os::unix::fs::MetadataExt as _;

        let full = self.resolve(path);
        let Some(meta) = lstat(&full)? else {
            self.skip("gone ", path, 0);
            return Ok(());
        };
        if !meta.file_type().is_symlink() {
            self.skip("!type", path, STATUS_SKIPPED_MISMATCH);
            return Ok(());
        }
        if meta.mtime() != mtime {
            self.skip("!time", path, STATUS_SKIPPED_MISMATCH);
            return Ok(());
        }
        let found = fs::read_link(&full).map_err(|e| UnmergeError::io("read symlink", &full, e))?;
        if found.to_string_lossy() != target {
            self.skip("!dest", path, STATUS_SKIPPED_MISMATCH);
            return Ok(());
        }
        if self.policy.is_protected(path) {
            self.skip("cfgpr", path, STATUS_SKIPPED_PROTECTED);
            return Ok(());
        }
        fs::remove_file(&full).map_err(|e| UnmergeError::io("unlink", &full, e))?;
        self.deleted(path);
        Ok(())
    }

    fn unmerge_dir(&mut self, path: &str) -> Result<(), UnmergeError> {
        let full = self.resolve(path);
        let Some(meta) = lstat(&full)? else {
            self.skip("gone ", path, 0);
            return Ok(());
        };
        if !meta.is_dir() {
            self.skip("!type", path, STATUS_SKIPPED_MISMATCH);
            return Ok(());
        }
        let occupied = fs::read_dir(&full)
            .map_err(|e| UnmergeError::io("read directory", &full, e))?
            .next()
            .is_some();
        if occupied {
            self.skip("!empt", path, STATUS_SKIPPED_MISMATCH);
            return Ok(());
        }
        fs::remove_dir(&full).map_err(|e| UnmergeError::io("remove directory", &full, e))?;
        self.deleted(path);
        Ok(())
    }

    /// Misc entries are tracked by existence only and never deleted.
    fn unmerge_other(&mut self, path: &str) {
        let full = self.resolve(path);
        if full.symlink_metadata().is_ok() {
            self.skip("misc ", path, 0);
        } else {
            self.skip("gone ", path, 0);
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    fn skip(&mut self, code: &str, path: &str, bit: u8) {
        self.log.status(&format!("--- [{code}] {path}"));
        self.status |= bit;
    }

    fn deleted(&self, path: &str) {
        self.log.status(&format!("<<<         {path}"));
    }
}

fn lstat(path: &Path) -> Result<Option<fs::Metadata>, UnmergeError> {
    match fs::symlink_metadata(path) {
        Ok(meta) => Ok(Some(meta)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(UnmergeError::io("stat", path, e)),
    }
}
