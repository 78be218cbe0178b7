//! Copies a layer while dropping entries that match exclusion globs. Removing
//! a directory removes everything below it.

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use glob::{MatchOptions, Pattern};
use log::{debug, info};
use serde::Deserialize;
use tar::{Archive, Builder};

use crate::archive::{append_raw, copy_metadata};
use crate::error::PackError;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

#[derive(Default, Debug, Clone, PartialEq, Deserialize)]
pub struct PruneManifest {
    #[serde(default)]
    pub remove_paths: Vec<String>,
    #[serde(default)]
    pub unzipped_layer: PathBuf,
}

impl PruneManifest {
    pub fn load(path: &Path) -> Result<PruneManifest> {
        let file = File::open(path).with_context(|| format!("opening prune manifest {}", path.display()))?;
        serde_json::from_reader(BufReader::new(file)).with_context(|| format!("parsing prune manifest {}", path.display()))
    }
}

/// A glob over path components. A relative pattern matches the trailing
/// components of a path, an absolute one the whole path.
#[derive(Debug)]
struct PathPattern {
    absolute: bool,
    parts: Vec<Pattern>,
}

impl PathPattern {
    fn new(pattern: &str) -> Result<PathPattern> {
        let invalid = |reason: &str| PackError::InvalidGlob {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };
        let parts = components(pattern)
            .into_iter()
            .map(|part| Pattern::new(part).map_err(|e| invalid(e.msg)))
            .collect::<Result<Vec<Pattern>, PackError>>()?;
        let absolute = pattern.starts_with('/');
        if parts.is_empty() && !absolute {
            return Err(invalid("empty pattern").into());
        }
        Ok(PathPattern { absolute, parts })
    }

    /// `parts` are the components of an absolute path, without the root.
    fn matches(&self, parts: &[&str]) -> bool {
        if self.absolute {
            parts.len() == self.parts.len()
                && self.parts.iter().zip(parts).all(|(pattern, part)| pattern.matches_with(part, MATCH_OPTIONS))
        } else {
            // the root itself counts as one component
            if self.parts.len() > parts.len() + 1 {
                return false;
            }
            let mut path = parts.iter().rev().copied().chain(std::iter::once("/"));
            self.parts
                .iter()
                .rev()
                .all(|pattern| path.next().map_or(false, |part| pattern.matches_with(part, MATCH_OPTIONS)))
        }
    }
}

fn components(path: &str) -> Vec<&str> {
    path.split('/').filter(|part| !part.is_empty() && *part != ".").collect()
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PruneStats {
    pub kept: usize,
    pub removed: usize,
}

pub struct Pruner {
    root: String,
    patterns: Vec<PathPattern>,
}

impl Pruner {
    pub fn new(root_directory: &str, remove_paths: &[String]) -> Result<Pruner> {
        Ok(Pruner {
            root: root_directory.trim_end_matches('/').to_string(),
            patterns: remove_paths
                .iter()
                .map(|pattern| PathPattern::new(pattern))
                .collect::<Result<Vec<PathPattern>>>()?,
        })
    }

    /// Whether an entry named `name` survives. Entries outside the root are
    /// always kept.
    pub fn keep(&self, name: &str) -> bool {
        let name = name.trim_end_matches('/');
        let relative = match name.strip_prefix(&self.root).filter(|rest| rest.starts_with('/')) {
            Some(relative) => relative,
            None => return true,
        };
        let parts = components(relative);
        // the entry itself, then every ancestor up to the root
        !(0..=parts.len())
            .rev()
            .any(|depth| self.patterns.iter().any(|pattern| pattern.matches(&parts[..depth])))
    }

    /// Streams `input` into a plain tar on `output`, copying kept entries with
    /// their original metadata.
    pub fn prune<R: Read, W: Write>(&self, input: R, output: W) -> Result<(W, PruneStats)> {
        let mut archive = Archive::new(input);
        let mut builder = Builder::new(output);
        let mut stats = PruneStats::default();
        for entry in archive.entries()? {
            let mut entry = entry?;
            let name = entry.path_bytes().into_owned();
            if !self.keep(&String::from_utf8_lossy(&name)) {
                debug!("pruned {}", String::from_utf8_lossy(&name));
                stats.removed += 1;
                continue;
            }
            let link = entry.link_name_bytes().map(|link| link.into_owned());
            let mut header = copy_metadata(entry.header())?;
            append_raw(&mut builder, &mut header, &name, link.as_deref(), &mut entry)?;
            stats.kept += 1;
        }
        Ok((builder.into_inner()?, stats))
    }

    pub fn prune_file<R: Read>(&self, input: R, output: &Path) -> Result<PruneStats> {
        let file = File::create(output).with_context(|| format!("creating {}", output.display()))?;
        let (mut file, stats) = self.prune(input, file)?;
        file.flush()?;
        info!("Pruned {} entries, kept {}", stats.removed, stats.kept);
        Ok(stats)
    }
}
