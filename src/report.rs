//! Per-entry merge outcome reporting.
//!
//! Every merged entry emits one status line built from a three-character
//! arrow template plus a class tag, for example:
//!
//! ```text
//! >>> [dir] /etc
//! =>> [dir] /etc/env.d
//! <>> [obj] /etc/env.d/gcc
//! >>~ [obj] /usr/bin/tool
//! >>> [obj] /etc/passwd (._cfg0000_passwd)
//! ```
//!
//! The arrow string starts as `>>>` and individual flags overwrite fixed
//! positions, so combinations compose without ambiguity.

use std::fmt;

/// What happened to one entry during the merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStatusFlags {
    /// A pre-existing destination object was unlinked before installing.
    pub unlinked_first: bool,
    /// The existing destination was kept as-is (directory reuse).
    pub used_existing: bool,
    /// A protected destination already had identical content; nothing was
    /// written.
    pub unchanged: bool,
    /// Installed under a protected alternate name instead of the intended
    /// path.
    pub renamed: bool,
    /// Ownership was normalised to the invoking user.
    pub fixed_ownership: bool,
    /// Setuid or setgid bits were stripped while fixing ownership.
    pub setid_bits: bool,
}

/// The display class of a merged entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryClass {
    /// Regular file.
    Object,
    /// Directory.
    Dir,
    /// Symbolic link.
    Sym,
    /// FIFO, device or socket.
    Misc,
}

impl fmt::Display for EntryClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Object => "[obj]",
            Self::Dir => "[dir]",
            Self::Sym => "[sym]",
            Self::Misc => "[msc]",
        })
    }
}

/// Render the three-character arrow prefix for `flags`.
#[must_use]
pub fn make_arrows(flags: MergeStatusFlags) -> String {
    let mut arrows = [b'>', b'>', b'>'];
    if flags.unlinked_first {
        arrows[0] = b'<';
    }
    if flags.used_existing || flags.unchanged {
        arrows[0] = b'=';
    }
    if flags.renamed {
        arrows[1] = b'-';
    }
    if flags.fixed_ownership {
        arrows[2] = b'~';
    }
    if flags.setid_bits {
        arrows[2] = b'*';
    }
    // arrows only ever holds ASCII
    String::from_utf8_lossy(&arrows).into_owned()
}

/// Build the full status line for one merged entry.
///
/// `installed_as` is the basename actually written; when it differs from the
/// basename of `path` (a protected install) it is appended in parentheses.
#[must_use]
pub fn merge_line(
    flags: MergeStatusFlags,
    class: EntryClass,
    path: &str,
    installed_as: Option<&str>,
) -> String {
    let mut line = format!("{} {class} {path}", make_arrows(flags));
    if let Some(name) = installed_as {
        let intended = path.rsplit('/').next().unwrap_or(path);
        if name != intended {
            line.push_str(" (");
            line.push_str(name);
            line.push(')');
        }
    }
    line
}
