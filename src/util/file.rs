use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

/// Reads the value of an `@file` argument, trimmed; other values are returned as given.
pub fn extract_value(value: &str) -> Result<String> {
    match value.strip_prefix('@') {
        Some(path) => Ok(fs::read_to_string(path)
            .with_context(|| format!("reading value file {}", path))?
            .trim()
            .to_string()),
        None => Ok(value.to_string()),
    }
}

/// Like [`extract_value`] but keeps `@file` content byte for byte.
pub fn extract_content(value: &str) -> Result<String> {
    match value.strip_prefix('@') {
        Some(path) => fs::read_to_string(path).with_context(|| format!("reading value file {}", path)),
        None => Ok(value.to_string()),
    }
}

/// Reads the whole file named by an argument, with or without a leading `@`.
pub fn read_file_arg(value: &str) -> Result<String> {
    let path = value.strip_prefix('@').unwrap_or(value);
    fs::read_to_string(path).with_context(|| format!("reading {}", path))
}

#[cfg(unix)]
pub fn is_executable(path: &Path) -> Result<bool> {
    use std::os::unix::fs::PermissionsExt;
    Ok(fs::metadata(path)?.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
pub fn is_executable(path: &Path) -> Result<bool> {
    fs::metadata(path)?;
    Ok(false)
}

/// Separator policy for archive member names.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathStyle {
    Posix,
    Native,
}

impl PathStyle {
    pub fn from_force_posix(force_posixpath: bool) -> PathStyle {
        if force_posixpath {
            PathStyle::Posix
        } else {
            PathStyle::Native
        }
    }

    fn separator(self) -> char {
        match self {
            PathStyle::Posix => '/',
            PathStyle::Native => std::path::MAIN_SEPARATOR,
        }
    }
}

/// Lexical normalisation: collapses repeated separators and `.` segments and
/// folds `..` into its parent where one exists.
pub fn normpath(path: &str, style: PathStyle) -> String {
    let sep = style.separator();
    let is_sep = |c: char| c == '/' || c == sep;
    if path.is_empty() {
        return ".".to_string();
    }
    let absolute = path.starts_with(is_sep);
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split(is_sep) {
        match part {
            "" | "." => {}
            ".." => {
                if parts.last().map_or(false, |last| *last != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push(part);
                }
            }
            _ => parts.push(part),
        }
    }
    let joined = parts.join(&sep.to_string());
    match (absolute, joined.is_empty()) {
        (true, _) => format!("{}{}", sep, joined),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}
