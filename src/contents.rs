//! The contents manifest: what a merge installed, in installation order.
//!
//! The on-disk format is a stable external contract, one entry per line:
//!
//! ```text
//! type=file path=<esc> md5=<hex> mtime=<secs>
//! type=dir path=<esc>
//! type=sym path=<esc> target=<esc> mtime=<secs>
//! type=misc path=<esc>
//! ```
//!
//! Escaping passes alphanumerics and `/ - _ .` through, turns a newline into
//! `\n`, and backslash-prefixes every other byte. Paths are root-relative and
//! always begin with `/`.

use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use thiserror::Error;

/// A single installed filesystem entry.
///
/// Entries are immutable once recorded; the manifest is append-only during a
/// merge and read-only during an unmerge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentsEntry {
    /// A regular file with its content fingerprint and mtime at install time.
    File {
        /// Root-relative destination path.
        path: String,
        /// Lowercase hex MD5 of the installed bytes.
        md5: String,
        /// Seconds since the epoch.
        mtime: i64,
    },
    /// A directory.
    Dir {
        /// Root-relative destination path.
        path: String,
    },
    /// A symbolic link with its target string and lstat mtime.
    Sym {
        /// Root-relative destination path.
        path: String,
        /// Link target, verbatim.
        target: String,
        /// Seconds since the epoch, from lstat.
        mtime: i64,
    },
    /// Anything else (FIFO, device, socket). Tracked by existence only.
    Other {
        /// Root-relative destination path.
        path: String,
    },
}

impl ContentsEntry {
    /// The root-relative path this entry describes.
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Self::File { path, .. }
            | Self::Dir { path }
            | Self::Sym { path, .. }
            | Self::Other { path } => path,
        }
    }
}

impl fmt::Display for ContentsEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File { path, md5, mtime } => {
                write!(f, "type=file path={} md5={md5} mtime={mtime}", escape(path))
            }
            Self::Dir { path } => write!(f, "type=dir path={}", escape(path)),
            Self::Sym {
                path,
                target,
                mtime,
            } => write!(
                f,
                "type=sym path={} target={} mtime={mtime}",
                escape(path),
                escape(target)
            ),
            Self::Other { path } => write!(f, "type=misc path={}", escape(path)),
        }
    }
}

/// A manifest line that could not be turned into an entry.
///
/// Defects are reported to the caller but never abort loading; the entries
/// around them remain usable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestDefect {
    /// The line's kind was recognised but its fields were not.
    Malformed(String),
    /// The line carried a `type=` value this version does not know.
    UnknownKind(String),
}

/// The manifest file itself could not be read or written.
#[derive(Error, Debug)]
pub enum ManifestError {
    /// Opening or creating the manifest file failed.
    #[error("cannot open contents manifest '{path}': {source}")]
    Open {
        /// Manifest file path.
        path: String,
        /// Underlying I/O error.
        source: io::Error,
    },
    /// Reading or writing manifest data failed.
    #[error("i/o on contents manifest '{path}': {source}")]
    Io {
        /// Manifest file path.
        path: String,
        /// Underlying I/O error.
        source: io::Error,
    },
}

/// An ordered record of everything one merge installed.
///
/// Insertion order is the merge's pre-order traversal order, which the
/// unmerger depends on for its directory pass.
#[derive(Debug, Default)]
pub struct ContentsManifest {
    entries: Vec<ContentsEntry>,
}

impl ContentsManifest {
    /// An empty manifest.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Append an entry. Entries are never reordered or removed.
    pub fn record(&mut self, entry: ContentsEntry) {
        self.entries.push(entry);
    }

    /// The recorded entries, in installation order.
    #[must_use]
    pub fn entries(&self) -> &[ContentsEntry] {
        &self.entries
    }

    /// Serialise all entries to `writer`, one line each.
    ///
    /// # Errors
    ///
    /// Returns any I/O error from the writer.
    pub fn write_to<W: Write>(&self, mut writer: W) -> io::Result<()> {
        for entry in &self.entries {
            writeln!(writer, "{entry}")?;
        }
        Ok(())
    }

    /// Write the manifest to the file at `path`, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError`] if the file cannot be created or written.
    pub fn save(&self, path: &Path) -> Result<(), ManifestError> {
        let display = path.display().to_string();
        let file = File::create(path).map_err(|source| ManifestError::Open {
            path: display.clone(),
            source,
        })?;
        let mut writer = BufWriter::new(file);
        self.write_to(&mut writer)
            .and_then(|()| writer.flush())
            .map_err(|source| ManifestError::Io {
                path: display,
                source,
            })
    }

    /// Parse a manifest from `reader`.
    ///
    /// Lines that cannot be parsed become [`ManifestDefect`]s rather than
    /// errors, so one bad line never blocks the removal of everything else.
    /// Blank lines are ignored.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the reader itself fails.
    pub fn parse<R: BufRead>(reader: R) -> io::Result<(Self, Vec<ManifestDefect>)> {
        let mut manifest = Self::new();
        let mut defects = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            match parse_line(&line) {
                Ok(entry) => manifest.entries.push(entry),
                Err(defect) => defects.push(defect),
            }
        }
        Ok((manifest, defects))
    }

    /// Load a manifest from the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError`] if the file cannot be opened or read.
    /// Per-line problems are returned as defects, not errors.
    pub fn load(path: &Path) -> Result<(Self, Vec<ManifestDefect>), ManifestError> {
        let display = path.display().to_string();
        let file = File::open(path).map_err(|source| ManifestError::Open {
            path: display.clone(),
            source,
        })?;
        Self::parse(BufReader::new(file)).map_err(|source| ManifestError::Io {
            path: display,
            source,
        })
    }
}

/// Escape a path or target string for the manifest line format.
#[must_use]
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '/' | '-' | '_' | '.' => out.push(c),
            '\n' => out.push_str("\\n"),
            other => {
                out.push('\\');
                out.push(other);
            }
        }
    }
    out
}

/// Undo [`escape`]. A trailing lone backslash is dropped.
#[must_use]
pub fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some(other) => out.push(other),
                None => {}
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Split a manifest line into `key=value` tokens, honouring escaped spaces
/// inside values. Values are returned still escaped.
fn tokenise(line: &str) -> Vec<(String, String)> {
    let mut tokens = Vec::new();
    let mut key = String::new();
    let mut value = String::new();
    let mut in_value = false;
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            ' ' => {
                if in_value {
                    tokens.push((std::mem::take(&mut key), std::mem::take(&mut value)));
                } else {
                    key.clear();
                }
                in_value = false;
            }
            '=' if !in_value => in_value = true,
            '\\' if in_value => {
                // keep the escape sequence intact for unescape()
                value.push('\\');
                if let Some(next) = chars.next() {
                    value.push(next);
                }
            }
            _ if in_value => value.push(c),
            _ => key.push(c),
        }
    }
    if in_value {
        tokens.push((key, value));
    }
    tokens
}

fn parse_line(line: &str) -> Result<ContentsEntry, ManifestDefect> {
    let tokens = tokenise(line);
    let get = |k: &str| {
        tokens
            .iter()
            .find(|(key, _)| key == k)
            .map(|(_, v)| v.as_str())
    };
    let Some(kind) = get("type") else {
        return Err(ManifestDefect::Malformed(line.to_string()));
    };
    let path = get("path").map(unescape);
    match (kind, path) {
        ("file", Some(path)) => {
            let md5 = get("md5");
            let mtime = get("mtime").and_then(|m| m.parse().ok());
            match (md5, mtime) {
                (Some(md5), Some(mtime)) => Ok(ContentsEntry::File {
                    path,
                    md5: md5.to_string(),
                    mtime,
                }),
                _ => Err(ManifestDefect::Malformed(line.to_string())),
            }
        }
        ("dir", Some(path)) => Ok(ContentsEntry::Dir { path }),
        ("sym", Some(path)) => {
            let target = get("target").map(unescape);
            let mtime = get("mtime").and_then(|m| m.parse().ok());
            match (target, mtime) {
                (Some(target), Some(mtime)) => Ok(ContentsEntry::Sym {
                    path,
                    target,
                    mtime,
                }),
                _ => Err(ManifestDefect::Malformed(line.to_string())),
            }
        }
        ("misc", Some(path)) => Ok(ContentsEntry::Other { path }),
        ("file" | "dir" | "sym" | "misc", None) => {
            Err(ManifestDefect::Malformed(line.to_string()))
        }
        _ => Err(ManifestDefect::UnknownKind(line.to_string())),
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn escape_passes_safe_bytes_through() {
        assert_eq!(escape("/usr/lib64/libfoo-1.2.so"), "/usr/lib64/libfoo-1.2.so");
    }

    #[test]
    fn escape_special_bytes() {
        assert_eq!(escape("/a b"), "/a\\ b");
        assert_eq!(escape("/x\ny"), "/x\\ny");
        assert_eq!(escape("/it's"), "/it\\'s");
        assert_eq!(escape("/back\\slash"), "/back\\\\slash");
    }

    #[test]
    fn unescape_round_trips() {
        for s in ["/a b", "/x\ny", "/it's=odd", "/back\\slash", "/plain"] {
            assert_eq!(unescape(&escape(s)), s);
        }
    }

    #[test]
    fn serialised_lines_match_format() {
        let mut m = ContentsManifest::new();
        m.record(ContentsEntry::Dir {
            path: "/etc".to_string(),
        });
        m.record(ContentsEntry::File {
            path: "/etc/my conf".to_string(),
            md5: "acbd18db4cc2f85cedef654fccc4a4d8".to_string(),
            mtime: 1_234_567,
        });
        m.record(ContentsEntry::Sym {
            path: "/usr/lib/libz.so".to_string(),
            target: "libz.so.1".to_string(),
            mtime: 99,
        });
        m.record(ContentsEntry::Other {
            path: "/run/app.fifo".to_string(),
        });

        let mut buf = Vec::new();
        m.write_to(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(
            text,
            "type=dir path=/etc\n\
             type=file path=/etc/my\\ conf md5=acbd18db4cc2f85cedef654fccc4a4d8 mtime=1234567\n\
             type=sym path=/usr/lib/libz.so target=libz.so.1 mtime=99\n\
             type=misc path=/run/app.fifo\n"
        );
    }

    #[test]
    fn parse_round_trips_entries() {
        let text = "type=dir path=/etc\n\
                    type=file path=/etc/my\\ conf md5=abc mtime=7\n\
                    type=sym path=/l target=t\\ gt mtime=3\n\
                    type=misc path=/f\n";
        let (m, defects) = ContentsManifest::parse(text.as_bytes()).unwrap();
        assert!(defects.is_empty());
        assert_eq!(
            m.entries(),
            &[
                ContentsEntry::Dir {
                    path: "/etc".to_string()
                },
                ContentsEntry::File {
                    path: "/etc/my conf".to_string(),
                    md5: "abc".to_string(),
                    mtime: 7,
                },
                ContentsEntry::Sym {
                    path: "/l".to_string(),
                    target: "t gt".to_string(),
                    mtime: 3,
                },
                ContentsEntry::Other {
                    path: "/f".to_string()
                },
            ]
        );
    }

    #[test]
    fn malformed_line_is_a_defect_not_an_error() {
        let text = "type=file path=/a\ntype=dir path=/ok\n";
        let (m, defects) = ContentsManifest::parse(text.as_bytes()).unwrap();
        assert_eq!(m.entries().len(), 1);
        assert_eq!(
            defects,
            vec![ManifestDefect::Malformed("type=file path=/a".to_string())]
        );
    }

    #[test]
    fn unknown_kind_is_a_defect() {
        let text = "type=hardlink path=/a target=/b\n";
        let (m, defects) = ContentsManifest::parse(text.as_bytes()).unwrap();
        assert!(m.entries().is_empty());
        assert_eq!(
            defects,
            vec![ManifestDefect::UnknownKind(
                "type=hardlink path=/a target=/b".to_string()
            )]
        );
    }

    #[test]
    fn line_without_type_is_malformed() {
        let (m, defects) = ContentsManifest::parse("path=/a\n".as_bytes()).unwrap();
        assert!(m.entries().is_empty());
        assert_eq!(defects.len(), 1);
        assert!(matches!(defects[0], ManifestDefect::Malformed(_)));
    }

    #[test]
    fn blank_lines_are_ignored() {
        let (m, defects) = ContentsManifest::parse("\n\ntype=dir path=/x\n\n".as_bytes()).unwrap();
        assert_eq!(m.entries().len(), 1);
        assert!(defects.is_empty());
    }

    #[test]
    fn non_numeric_mtime_is_malformed() {
        let (m, defects) =
            ContentsManifest::parse("type=file path=/a md5=x mtime=soon\n".as_bytes()).unwrap();
        assert!(m.entries().is_empty());
        assert_eq!(defects.len(), 1);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("CONTENTS");

        let mut m = ContentsManifest::new();
        m.record(ContentsEntry::Dir {
            path: "/opt".to_string(),
        });
        m.record(ContentsEntry::File {
            path: "/opt/tool".to_string(),
            md5: "00112233445566778899aabbccddeeff".to_string(),
            mtime: 1_600_000_000,
        });
        m.save(&path).unwrap();

        let (loaded, defects) = ContentsManifest::load(&path).unwrap();
        assert!(defects.is_empty());
        assert_eq!(loaded.entries(), m.entries());
    }

    #[test]
    fn load_missing_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = ContentsManifest::load(&dir.path().join("absent")).unwrap_err();
        assert!(matches!(err, ManifestError::Open { .. }));
    }
}
