//! Error types surfaced while packaging layers and assembling images

use std::path::PathBuf;

use thiserror::Error;

/// Fatal input and assembly errors.
///
/// Anything not listed here travels as a plain `anyhow::Error`.
#[derive(Error, Debug)]
pub enum PackError {
    /// the .deb is structurally wrong (missing member, bad metadata)
    #[error("{}: {reason}", deb.display())]
    BadPackage { deb: PathBuf, reason: String },

    /// unexpected failure while reading the control metadata of a .deb
    #[error("unknown error reading metadata of {}: {source}. Please report an issue.", deb.display())]
    PackageMetadata {
        deb: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    /// no in-process codec and no usable external xz binary
    #[error("cannot handle .xz compression: xz not found (build with the `xz` feature or pass --xz_path)")]
    XzUnavailable,

    /// associative argument with the wrong number of fields
    #[error("expected associative list {expected}, got: {entry}")]
    InvalidAssociation { entry: String, expected: &'static str },

    /// diff id referenced by a config that no source can provide
    #[error("blob for diff id {diff_id} not found in any layer or legacy image")]
    UnresolvedBlob { diff_id: String },

    /// stamp file line without a `KEY value` shape
    #[error("invalid stamp line in {}: {line:?}", file.display())]
    InvalidStampLine { file: PathBuf, line: String },

    /// `{KEY}` placeholder with no stamp value
    #[error("no stamp value for key {key:?} in {template:?}")]
    MissingStampKey { key: String, template: String },

    #[error("invalid exclusion pattern {pattern:?}: {reason}")]
    InvalidGlob { pattern: String, reason: String },

    #[error("invalid octal mode: {0:?}")]
    InvalidMode(String),

    #[error("invalid owner, expected two '.'-separated fields: {0:?}")]
    InvalidOwner(String),

    #[error("invalid link, expected 'name:target': {0:?}")]
    InvalidLink(String),

    #[error("unknown compression: {0:?}")]
    UnknownCompression(String),
}
