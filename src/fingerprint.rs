//! Content fingerprinting for installed files.
//!
//! The contents manifest records an MD5 digest for every regular file so
//! that a later unmerge can tell whether the bytes on disk are still the
//! bytes that were installed.  The digest is computed over the full byte
//! stream; a short read is an error, never a partial digest.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use md5::{Digest, Md5};

/// Compute the lowercase hex MD5 digest of everything `reader` yields.
///
/// The result is independent of read buffering; the stream is consumed to
/// EOF in fixed-size chunks.
///
/// # Errors
///
/// Returns any I/O error raised while reading.  No digest is produced for a
/// stream that cannot be fully consumed.
pub fn fingerprint_reader<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = Md5::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(to_hex(&hasher.finalize()))
}

/// Compute the lowercase hex MD5 digest of the file at `path`.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or read.
pub fn fingerprint_file(path: &Path) -> io::Result<String> {
    fingerprint_reader(File::open(path)?)
}

fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;

    let mut hex = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        // write! to a String is infallible; unwrap_or(()) makes that explicit.
        write!(hex, "{b:02x}").unwrap_or(());
    }
    hex
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn empty_stream() {
        let digest = fingerprint_reader(io::empty()).unwrap();
        assert_eq!(digest, "d41d8cd98f00b204e9800998ecf8428e");
    }

    #[test]
    fn known_vector() {
        let digest = fingerprint_reader("foo".as_bytes()).unwrap();
        assert_eq!(digest, "acbd18db4cc2f85cedef654fccc4a4d8");
    }

    #[test]
    fn buffering_does_not_change_digest() {
        /// Reader that yields one byte per read call.
        struct OneByte<'a>(&'a [u8]);

        impl Read for OneByte<'_> {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                match self.0.split_first() {
                    Some((first, rest)) => {
                        buf[0] = *first;
                        self.0 = rest;
                        Ok(1)
                    }
                    None => Ok(0),
                }
            }
        }

        let data = b"the quick brown fox jumps over the lazy dog".repeat(100);
        let chunked = fingerprint_reader(data.as_slice()).unwrap();
        let dribbled = fingerprint_reader(OneByte(&data)).unwrap();
        assert_eq!(chunked, dribbled);
    }

    #[test]
    fn file_digest_matches_reader_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload");
        std::fs::write(&path, b"some file content\n").unwrap();

        let from_file = fingerprint_file(&path).unwrap();
        let from_reader = fingerprint_reader(&b"some file content\n"[..]).unwrap();
        assert_eq!(from_file, from_reader);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(fingerprint_file(&dir.path().join("nope")).is_err());
    }

    #[test]
    fn read_error_propagates() {
        /// Reader that fails after the first chunk.
        struct Broken(bool);

        impl Read for Broken {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                if self.0 {
                    Err(io::Error::new(io::ErrorKind::Other, "disk on fire"))
                } else {
                    self.0 = true;
                    buf[0] = b'x';
                    Ok(1)
                }
            }
        }

        assert!(fingerprint_reader(Broken(false)).is_err());
    }
}
