//! A filesystem merge/unmerge engine for package images.
//!
//! A *merge* installs a fully prepared image tree onto a live root,
//! protecting user-modified configuration files and writing an ordered
//! contents manifest of everything it touched. An *unmerge* replays that
//! manifest and removes exactly what was installed, verifying each entry
//! against its record first so user changes survive.

pub mod cli;
pub mod commands;
pub mod contents;
pub mod error;
pub mod fingerprint;
pub mod logging;
pub mod merge;
pub mod protect;
pub mod report;
pub mod unmerge;
