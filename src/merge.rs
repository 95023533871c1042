//! The merge engine: install a prepared image tree onto a live root.
//!
//! Traversal is depth-first pre-order with children visited in sorted name
//! order, so the recorded manifest always lists a directory before anything
//! inside it. Every source kind / destination state pair has explicit
//! behaviour; nothing falls through to a default.
//!
//! Regular files are staged to a sibling temporary name and renamed into
//! place, so a half-written file is never visible under its final name.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt, chown, lchown, symlink};
use std::path::{Path, PathBuf};

use filetime::FileTime;
use nix::sys::stat::Mode;

use crate::contents::{ContentsEntry, ContentsManifest};
use crate::error::MergeError;
use crate::fingerprint::fingerprint_file;
use crate::logging::Logger;
use crate::protect::ProtectionPolicy;
use crate::report::{EntryClass, MergeStatusFlags, merge_line};

/// Alternate-name counter is four digits, so this many candidates exist.
const CONFIG_PROTECT_NAME_LIMIT: u32 = 10_000;

/// Everything a merge needs to know, gathered by the caller.
#[derive(Debug, Clone)]
pub struct MergeOptions {
    /// The fully prepared source tree.
    pub image: PathBuf,
    /// The destination root.
    pub root: PathBuf,
    /// Config-protection patterns.
    pub config_protect: Vec<String>,
    /// Patterns that switch protection back off.
    pub config_protect_mask: Vec<String>,
    /// Source mtimes below this floor are bumped up to it.
    pub fix_mtimes_before: Option<i64>,
    /// Skip ownership normalisation entirely.
    pub no_chown: bool,
    /// Merge empty image directories without a warning.
    pub allow_empty_dirs: bool,
    /// Rebase absolute symlink targets that point into the image.
    pub rewrite_symlinks: bool,
    /// Replace destination objects of a conflicting kind instead of failing.
    pub replace_conflicting: bool,
}

/// What currently occupies a destination path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DestState {
    Nothing,
    File,
    Dir,
    Sym,
    Misc,
}

/// One merge operation. Construct, then [`run`](Self::run) once.
#[derive(Debug)]
pub struct Merger {
    options: MergeOptions,
    policy: ProtectionPolicy,
    image: PathBuf,
    root: PathBuf,
    owner_uid: u32,
    owner_gid: u32,
    manifest: ContentsManifest,
    log: Logger,
}

impl Merger {
    /// Validate the trees, compile the protection policy.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::BadTree`] if the image or root is not a usable
    /// directory, or [`MergeError::Pattern`] for a bad protect pattern.
    pub fn new(options: MergeOptions, log: Logger) -> Result<Self, MergeError> {
        let image = canonical_dir(&options.image, "image")?;
        let root = canonical_dir(&options.root, "root")?;
        let policy = ProtectionPolicy::new(&options.config_protect, &options.config_protect_mask)?;
        let root_meta = fs::metadata(&root).map_err(|e| MergeError::io("stat", &root, e))?;
        Ok(Self {
            owner_uid: root_meta.uid(),
            owner_gid: root_meta.gid(),
            options,
            policy,
            image,
            root,
            manifest: ContentsManifest::new(),
            log,
        })
    }

    /// Merge the image onto the root and return the resulting manifest.
    ///
    /// # Errors
    ///
    /// Any conflict or I/O failure aborts the whole merge. Entries already
    /// installed stay installed; the caller decides whether to roll back.
    pub fn run(mut self) -> Result<ContentsManifest, MergeError> {
        let image = self.image.clone();
        let root = self.root.clone();
        self.merge_dir(&image, &root, "")?;
        Ok(self.manifest)
    }

    fn merge_dir(&mut self, src_dir: &Path, dst_dir: &Path, rel: &str) -> Result<(), MergeError> {
        let mut names: Vec<OsString> = Vec::new();
        for entry in
            fs::read_dir(src_dir).map_err(|e| MergeError::io("read directory", src_dir, e))?
        {
            let entry = entry.map_err(|e| MergeError::io("read directory", src_dir, e))?;
            names.push(entry.file_name());
        }
        names.sort();

        if names.is_empty() && !self.options.allow_empty_dirs {
            let shown = if rel.is_empty() { "/" } else { rel };
            self.log.warn(&format!("merging empty directory '{shown}'"));
        }

        for name in names {
            let src = src_dir.join(&name);
            let dst = dst_dir.join(&name);
            // a lossy conversion would record a path the unmerge can never
            // find again, so non-unicode names are refused up front
            let Some(name) = name.to_str() else {
                return Err(MergeError::NonUnicodeName {
                    path: src.display().to_string(),
                });
            };
            let rel = format!("{rel}/{name}");
            let meta =
                fs::symlink_metadata(&src).map_err(|e| MergeError::io("stat", &src, e))?;
            let file_type = meta.file_type();
            if file_type.is_symlink() {
                self.merge_sym(&src, &dst, &rel)?;
            } else if file_type.is_dir() {
                self.merge_subdir(&src, &dst, &rel)?;
            } else if file_type.is_file() {
                self.merge_file(&src, &dst, &rel)?;
            } else {
                self.merge_other(&dst, &rel, &meta)?;
            }
        }
        Ok(())
    }

    fn merge_subdir(&mut self, src: &Path, dst: &Path, rel: &str) -> Result<(), MergeError> {
        let mut flags = MergeStatusFlags::default();
        let state = dest_state(dst)?;
        match state {
            DestState::Dir => flags.used_existing = true,
            DestState::Nothing => self.create_dir(src, dst, &mut flags)?,
            DestState::File | DestState::Sym | DestState::Misc => {
                if !self.options.replace_conflicting {
                    let found = match state {
                        DestState::File => "file",
                        DestState::Sym => "symlink",
                        _ => "special file",
                    };
                    return Err(MergeError::Conflict {
                        path: rel.to_string(),
                        found,
                        wanted: "directory",
                    });
                }
                self.unlink_dest(dst, &mut flags)?;
                self.create_dir(src, dst, &mut flags)?;
            }
        }

        self.log.status(&merge_line(flags, EntryClass::Dir, rel, None));
        self.manifest.record(ContentsEntry::Dir {
            path: rel.to_string(),
        });
        self.merge_dir(src, dst, rel)
    }

    fn merge_file(&mut self, src: &Path, dst: &Path, rel: &str) -> Result<(), MergeError> {
        let mut flags = MergeStatusFlags::default();
        let mut install_dst = dst.to_path_buf();
        let mut installed_name = None;

        match dest_state(dst)? {
            DestState::Nothing => {}
            DestState::File => {
                let src_md5 = fingerprint_file(src).map_err(|e| MergeError::io("read", src, e))?;
                let dst_md5 = fingerprint_file(dst).map_err(|e| MergeError::io("read", dst, e))?;
                if src_md5 == dst_md5 {
                    // identical content: leave the destination alone and
                    // record what is on disk, so re-merging is a no-op
                    flags.unchanged = true;
                    let meta = fs::metadata(dst).map_err(|e| MergeError::io("stat", dst, e))?;
                    self.log
                        .status(&merge_line(flags, EntryClass::Object, rel, None));
                    self.manifest.record(ContentsEntry::File {
                        path: rel.to_string(),
                        md5: dst_md5,
                        mtime: meta.mtime(),
                    });
                    return Ok(());
                }
                if self.policy.is_protected(rel) {
                    let name = self.config_protect_name(dst, Some(src))?;
                    install_dst = dst.with_file_name(&name);
                    flags.renamed = true;
                    installed_name = Some(name);
                } else {
                    self.unlink_dest(dst, &mut flags)?;
                }
            }
            DestState::Dir => self.replace_dir(dst, rel, "file", &mut flags)?,
            DestState::Sym => {
                if !self.options.replace_conflicting {
                    return Err(MergeError::Conflict {
                        path: rel.to_string(),
                        found: "symlink",
                        wanted: "file",
                    });
                }
                self.unlink_dest(dst, &mut flags)?;
            }
            DestState::Misc => {
                if !self.options.replace_conflicting {
                    return Err(MergeError::Conflict {
                        path: rel.to_string(),
                        found: "special file",
                        wanted: "file",
                    });
                }
                self.unlink_dest(dst, &mut flags)?;
            }
        }

        let md5 = self.install_file(src, &install_dst, &mut flags)?;
        let meta =
            fs::metadata(&install_dst).map_err(|e| MergeError::io("stat", &install_dst, e))?;
        self.log.status(&merge_line(
            flags,
            EntryClass::Object,
            rel,
            installed_name.as_deref(),
        ));
        self.manifest.record(ContentsEntry::File {
            path: rel.to_string(),
            md5,
            mtime: meta.mtime(),
        });
        Ok(())
    }

    fn merge_sym(&mut self, src: &Path, dst: &Path, rel: &str) -> Result<(), MergeError> {
        let raw = fs::read_link(src).map_err(|e| MergeError::io("read symlink", src, e))?;
        let mut target = raw.to_string_lossy().into_owned();

        let image_prefix = self.image.to_string_lossy().into_owned();
        let rewritten = target.strip_prefix(image_prefix.as_str()).map(|rest| {
            if rest.is_empty() {
                "/".to_string()
            } else {
                rest.to_string()
            }
        });
        if let Some(rebased) = rewritten {
            if !self.options.rewrite_symlinks {
                return Err(MergeError::ImageSymlink {
                    path: rel.to_string(),
                    target,
                });
            }
            target = rebased;
        }

        let mut flags = MergeStatusFlags::default();
        let mut install_dst = dst.to_path_buf();
        let mut installed_name = None;

        match dest_state(dst)? {
            DestState::Nothing => {}
            DestState::Sym => {
                let existing =
                    fs::read_link(dst).map_err(|e| MergeError::io("read symlink", dst, e))?;
                if existing.to_string_lossy() == target {
                    flags.unchanged = true;
                    let meta =
                        fs::symlink_metadata(dst).map_err(|e| MergeError::io("stat", dst, e))?;
                    self.log
                        .status(&merge_line(flags, EntryClass::Sym, rel, None));
                    self.manifest.record(ContentsEntry::Sym {
                        path: rel.to_string(),
                        target,
                        mtime: meta.mtime(),
                    });
                    return Ok(());
                }
                if self.policy.is_protected(rel) {
                    let name = self.config_protect_name(dst, None)?;
                    install_dst = dst.with_file_name(&name);
                    flags.renamed = true;
                    installed_name = Some(name);
                } else {
                    self.unlink_dest(dst, &mut flags)?;
                }
            }
            DestState::File => {
                if self.policy.is_protected(rel) {
                    let name = self.config_protect_name(dst, None)?;
                    install_dst = dst.with_file_name(&name);
                    flags.renamed = true;
                    installed_name = Some(name);
                } else {
                    self.unlink_dest(dst, &mut flags)?;
                }
            }
            DestState::Dir => self.replace_dir(dst, rel, "symlink", &mut flags)?,
            DestState::Misc => {
                if !self.options.replace_conflicting {
                    return Err(MergeError::Conflict {
                        path: rel.to_string(),
                        found: "special file",
                        wanted: "symlink",
                    });
                }
                self.unlink_dest(dst, &mut flags)?;
            }
        }

        let mtime = self.install_sym(src, &target, &install_dst, &mut flags)?;
        self.log.status(&merge_line(
            flags,
            EntryClass::Sym,
            rel,
            installed_name.as_deref(),
        ));
        self.manifest.record(ContentsEntry::Sym {
            path: rel.to_string(),
            target,
            mtime,
        });
        Ok(())
    }

    fn merge_other(
        &mut self,
        dst: &Path,
        rel: &str,
        meta: &fs::Metadata,
    ) -> Result<(), MergeError> {
        let mut flags = MergeStatusFlags::default();
        match dest_state(dst)? {
            DestState::Nothing => {}
            DestState::Dir => self.replace_dir(dst, rel, "special file", &mut flags)?,
            DestState::Misc => {
                let existing =
                    fs::symlink_metadata(dst).map_err(|e| MergeError::io("stat", dst, e))?;
                if same_special_kind(existing.file_type(), meta.file_type()) {
                    // only existence matters for special files, so a node of
                    // the matching kind is left alone
                    flags.unchanged = true;
                    self.log.status(&merge_line(flags, EntryClass::Misc, rel, None));
                    self.manifest.record(ContentsEntry::Other {
                        path: rel.to_string(),
                    });
                    return Ok(());
                }
                if !self.options.replace_conflicting {
                    return Err(MergeError::Conflict {
                        path: rel.to_string(),
                        found: "a special file of another kind",
                        wanted: "special file",
                    });
                }
                self.unlink_dest(dst, &mut flags)?;
            }
            DestState::File | DestState::Sym => {
                if !self.options.replace_conflicting {
                    return Err(MergeError::Conflict {
                        path: rel.to_string(),
                        found: "an existing entry",
                        wanted: "special file",
                    });
                }
                self.unlink_dest(dst, &mut flags)?;
            }
        }

        if meta.file_type().is_fifo() {
            let mode = Mode::from_bits_truncate(meta.mode());
            nix::unistd::mkfifo(dst, mode)
                .map_err(|e| MergeError::io("create fifo", dst, io::Error::from(e)))?;
        } else {
            // device nodes and sockets need privileges and make no sense to
            // copy; track them by existence only
            self.log
                .warn(&format!("not replicating special file '{rel}', recording only"));
        }

        self.log.status(&merge_line(flags, EntryClass::Misc, rel, None));
        self.manifest.record(ContentsEntry::Other {
            path: rel.to_string(),
        });
        Ok(())
    }

    /// Stage `src` to a sibling temporary name at the destination, apply
    /// mode, ownership and the mtime floor, then rename into place. Returns
    /// the fingerprint of the installed bytes.
    fn install_file(
        &self,
        src: &Path,
        dst: &Path,
        flags: &mut MergeStatusFlags,
    ) -> Result<String, MergeError> {
        let meta = fs::symlink_metadata(src).map_err(|e| MergeError::io("stat", src, e))?;
        let name = dst
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = dst.with_file_name(format!(".pkgmerge-{name}"));

        fs::copy(src, &tmp).map_err(|e| MergeError::io("copy", src, e))?;

        let mut mode = meta.mode() & 0o7777;
        if !self.options.no_chown && (meta.uid() != self.owner_uid || meta.gid() != self.owner_gid)
        {
            chown(&tmp, Some(self.owner_uid), Some(self.owner_gid))
                .map_err(|e| MergeError::io("chown", &tmp, e))?;
            flags.fixed_ownership = true;
            if mode & 0o6000 != 0 {
                mode &= !0o6000;
                flags.setid_bits = true;
            }
        }
        fs::set_permissions(&tmp, fs::Permissions::from_mode(mode))
            .map_err(|e| MergeError::io("chmod", &tmp, e))?;

        let mtime = self.floored_mtime(meta.mtime());
        filetime::set_file_mtime(&tmp, FileTime::from_unix_time(mtime, 0))
            .map_err(|e| MergeError::io("set mtime on", &tmp, e))?;

        fs::rename(&tmp, dst).map_err(|e| MergeError::io("rename into place", dst, e))?;
        fingerprint_file(dst).map_err(|e| MergeError::io("read", dst, e))
    }

    /// Create the symlink at `dst` and return the mtime recorded for it.
    fn install_sym(
        &self,
        src: &Path,
        target: &str,
        dst: &Path,
        flags: &mut MergeStatusFlags,
    ) -> Result<i64, MergeError> {
        let meta = fs::symlink_metadata(src).map_err(|e| MergeError::io("stat", src, e))?;
        symlink(target, dst).map_err(|e| MergeError::io("create symlink", dst, e))?;

        if !self.options.no_chown && (meta.uid() != self.owner_uid || meta.gid() != self.owner_gid)
        {
            lchown(dst, Some(self.owner_uid), Some(self.owner_gid))
                .map_err(|e| MergeError::io("chown", dst, e))?;
            flags.fixed_ownership = true;
        }

        let mtime = self.floored_mtime(meta.mtime());
        let stamp = FileTime::from_unix_time(mtime, 0);
        filetime::set_symlink_file_times(dst, stamp, stamp)
            .map_err(|e| MergeError::io("set mtime on", dst, e))?;
        Ok(mtime)
    }

    fn create_dir(
        &self,
        src: &Path,
        dst: &Path,
        flags: &mut MergeStatusFlags,
    ) -> Result<(), MergeError> {
        let meta = fs::symlink_metadata(src).map_err(|e| MergeError::io("stat", src, e))?;
        fs::create_dir(dst).map_err(|e| MergeError::io("create directory", dst, e))?;

        let mut mode = meta.mode() & 0o7777;
        if !self.options.no_chown && (meta.uid() != self.owner_uid || meta.gid() != self.owner_gid)
        {
            chown(dst, Some(self.owner_uid), Some(self.owner_gid))
                .map_err(|e| MergeError::io("chown", dst, e))?;
            flags.fixed_ownership = true;
            if mode & 0o6000 != 0 {
                mode &= !0o6000;
                flags.setid_bits = true;
            }
        }
        fs::set_permissions(dst, fs::Permissions::from_mode(mode))
            .map_err(|e| MergeError::io("chmod", dst, e))
    }

    /// Pick the `._cfgNNNN_<name>` alternate for a protected destination.
    ///
    /// The first free candidate wins; a candidate whose content already
    /// equals `content_src` is reused so repeated merges never pile up
    /// identical copies.
    fn config_protect_name(
        &self,
        dst: &Path,
        content_src: Option<&Path>,
    ) -> Result<String, MergeError> {
        let base = dst
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let src_md5 = match content_src {
            Some(src) => Some(fingerprint_file(src).map_err(|e| MergeError::io("read", src, e))?),
            None => None,
        };

        for i in 0..CONFIG_PROTECT_NAME_LIMIT {
            let name = format!("._cfg{i:04}_{base}");
            let candidate = dst.with_file_name(&name);
            match fs::symlink_metadata(&candidate) {
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(name),
                Err(e) => return Err(MergeError::io("stat", &candidate, e)),
                Ok(meta) => {
                    if let Some(md5) = &src_md5 {
                        if meta.is_file()
                            && fingerprint_file(&candidate)
                                .map_err(|e| MergeError::io("read", &candidate, e))?
                                == *md5
                        {
                            return Ok(name);
                        }
                    }
                }
            }
        }
        Err(MergeError::io(
            "choose alternate name for",
            dst,
            io::Error::other("all candidate names are taken"),
        ))
    }

    /// Remove a conflicting destination directory, which must be empty.
    fn replace_dir(
        &self,
        dst: &Path,
        rel: &str,
        wanted: &'static str,
        flags: &mut MergeStatusFlags,
    ) -> Result<(), MergeError> {
        if !self.options.replace_conflicting {
            return Err(MergeError::Conflict {
                path: rel.to_string(),
                found: "directory",
                wanted,
            });
        }
        let empty = fs::read_dir(dst)
            .map_err(|e| MergeError::io("read directory", dst, e))?
            .next()
            .is_none();
        if !empty {
            return Err(MergeError::NotEmpty {
                path: rel.to_string(),
            });
        }
        fs::remove_dir(dst).map_err(|e| MergeError::io("remove directory", dst, e))?;
        flags.unlinked_first = true;
        Ok(())
    }

    fn unlink_dest(&self, dst: &Path, flags: &mut MergeStatusFlags) -> Result<(), MergeError> {
        fs::remove_file(dst).map_err(|e| MergeError::io("unlink", dst, e))?;
        flags.unlinked_first = true;
        Ok(())
    }

    fn floored_mtime(&self, mtime: i64) -> i64 {
        match self.options.fix_mtimes_before {
            Some(floor) if mtime < floor => floor,
            _ => mtime,
        }
    }
}

fn same_special_kind(a: fs::FileType, b: fs::FileType) -> bool {
    (a.is_fifo() && b.is_fifo())
        || (a.is_socket() && b.is_socket())
        || (a.is_char_device() && b.is_char_device())
        || (a.is_block_device() && b.is_block_device())
}

fn dest_state(path: &Path) -> Result<DestState, MergeError> {
    match fs::symlink_metadata(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(DestState::Nothing),
        Err(e) => Err(MergeError::io("stat", path, e)),
        Ok(meta) => {
            let file_type = meta.file_type();
            if file_type.is_symlink() {
                Ok(DestState::Sym)
            } else if file_type.is_dir() {
                Ok(DestState::Dir)
            } else if file_type.is_file() {
                Ok(DestState::File)
            } else {
                Ok(DestState::Misc)
            }
        }
    }
}

fn canonical_dir(path: &Path, role: &'static str) -> Result<PathBuf, MergeError> {
    let bad = || MergeError::BadTree {
        path: path.display().to_string(),
        role,
    };
    let canon = fs::canonicalize(path).map_err(|_| bad())?;
    if canon.is_dir() { Ok(canon) } else { Err(bad()) }
}
