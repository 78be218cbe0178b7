use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use log::warn;
use regex::{Captures, Regex};

use crate::error::PackError;

/// Workspace status values substituted into `{KEY}` placeholders.
#[derive(Default, Debug, Clone)]
pub struct StampInfo {
    values: HashMap<String, String>,
}

impl StampInfo {
    /// Reads `KEY value` lines from every file in order; a key seen twice keeps
    /// its last value.
    pub fn load(files: &[PathBuf]) -> Result<StampInfo> {
        let mut values = HashMap::new();
        for file in files {
            let content = fs::read_to_string(file).with_context(|| format!("reading stamp file {}", file.display()))?;
            for line in content.lines() {
                if line.is_empty() {
                    continue;
                }
                let (key, value) = line.split_once(' ').ok_or_else(|| PackError::InvalidStampLine {
                    file: file.clone(),
                    line: line.to_string(),
                })?;
                if values.contains_key(key) {
                    warn!("Duplicate value for workspace status key '{}': using '{}'", key, value);
                }
                values.insert(key.to_string(), value.to_string());
            }
        }
        Ok(StampInfo { values })
    }

    #[cfg(test)]
    pub fn from_pairs<K: Into<String>, V: Into<String>>(pairs: impl IntoIterator<Item = (K, V)>) -> StampInfo {
        StampInfo {
            values: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    #[cfg(test)]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Replaces `{KEY}` placeholders; `{{` and `}}` stand for literal braces.
    pub fn format(&self, template: &str) -> Result<String> {
        let placeholder = Regex::new(r"\{\{|\}\}|\{([^{}]*)\}")?;
        let mut missing = None;
        let formatted = placeholder.replace_all(template, |caps: &Captures| match caps.get(1) {
            None => caps[0][..1].to_string(),
            Some(key) => match self.values.get(key.as_str()) {
                Some(value) => value.clone(),
                None => {
                    missing.get_or_insert_with(|| key.as_str().to_string());
                    String::new()
                }
            },
        });
        if let Some(key) = missing {
            return Err(PackError::MissingStampKey {
                key,
                template: template.to_string(),
            }
            .into());
        }
        Ok(formatted.into_owned())
    }
}
