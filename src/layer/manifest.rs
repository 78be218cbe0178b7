use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Declarative contents of one layer, as handed over by the build rule.
#[derive(Default, Debug, Clone, PartialEq, Deserialize)]
pub struct TarManifest {
    #[serde(default)]
    pub files: Vec<ManifestFile>,
    #[serde(default)]
    pub empty_files: Vec<String>,
    #[serde(default)]
    pub empty_dirs: Vec<String>,
    #[serde(default)]
    pub empty_root_dirs: Vec<String>,
    #[serde(default)]
    pub symlinks: Vec<ManifestLink>,
    #[serde(default)]
    pub tars: Vec<PathBuf>,
    #[serde(default)]
    pub debs: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ManifestFile {
    pub src: PathBuf,
    pub dst: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ManifestLink {
    pub linkname: String,
    pub target: String,
}

impl TarManifest {
    pub fn load(path: &Path) -> Result<TarManifest> {
        let file = File::open(path).with_context(|| format!("opening layer manifest {}", path.display()))?;
        serde_json::from_reader(BufReader::new(file)).with_context(|| format!("parsing layer manifest {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_default_to_empty() -> Result<()> {
        let manifest: TarManifest = serde_json::from_str(
            r#"{"files": [{"src": "bazel-out/app", "dst": "/app"}], "symlinks": [{"linkname": "bin/sh", "target": "busybox"}]}"#,
        )?;
        assert_eq!(manifest.files[0].dst, "/app");
        assert_eq!(manifest.symlinks[0].target, "busybox");
        assert!(manifest.debs.is_empty() && manifest.empty_root_dirs.is_empty());
        Ok(())
    }
}
