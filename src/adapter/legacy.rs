//! Images written by `docker save`, used as a fallback source of layer blobs.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use flate2::read::MultiGzDecoder;
use log::info;
use tar::Archive;
use tempfile::TempDir;

use crate::adapter::tar::TarManifestJson;
use crate::adapter::{BlobSource, LayerBlob, LayerContent};
use crate::container::image::config_diff_ids;
use crate::container::{RegContentType, RegDigest};
use crate::util::compress::{gz_copy, Codec};
use crate::util::sha::file_sha256;

struct LegacyLayer {
    blob_sum: RegDigest,
    unzipped: PathBuf,
    size: u64,
}

pub struct LegacyImage {
    path: PathBuf,
    layers: HashMap<RegDigest, LegacyLayer>,
    /// Holds the extracted layer files for as long as the image is alive
    _scratch: TempDir,
}

impl LegacyImage {
    /// Extracts the first image of a saved tarball. Layers stored without
    /// compression are gzipped so that every layer has a blob digest.
    pub fn open(path: &Path) -> Result<LegacyImage> {
        let scratch = tempfile::tempdir()?;
        let mut manifest = None;
        let mut members: HashMap<String, PathBuf> = HashMap::new();

        let file = File::open(path).with_context(|| format!("opening legacy image {}", path.display()))?;
        let mut archive = Archive::new(BufReader::new(file));
        for (index, entry) in archive.entries()?.enumerate() {
            let mut entry = entry?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let name = entry.path()?.to_string_lossy().trim_start_matches("./").to_string();
            if name == "manifest.json" {
                let mut data = Vec::new();
                entry.read_to_end(&mut data)?;
                manifest = Some(data);
            } else {
                let target = scratch.path().join(format!("member-{}", index));
                io::copy(&mut entry, &mut File::create(&target)?)?;
                members.insert(name, target);
            }
        }

        let manifest: Vec<TarManifestJson> = serde_json::from_slice(
            &manifest.ok_or_else(|| anyhow!("{} has no manifest.json", path.display()))?,
        )?;
        let image = manifest
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("{} does not contain an image", path.display()))?;
        // configs may be `<hex>.json` or an OCI style `blobs/sha256/<hex>`
        let config = members
            .get(image.config.trim_start_matches("./"))
            .ok_or_else(|| anyhow!("{} has no config {}", path.display(), image.config))?;
        let diff_ids = config_diff_ids(&fs::read_to_string(config)?)?;
        if diff_ids.len() != image.layers.len() {
            return Err(anyhow!(
                "{}: config lists {} diff ids but the image has {} layers",
                path.display(),
                diff_ids.len(),
                image.layers.len()
            ));
        }

        let mut layers = HashMap::new();
        for (index, (diff_id, layer_name)) in diff_ids.into_iter().zip(&image.layers).enumerate() {
            let stored = members
                .get(layer_name.trim_start_matches("./"))
                .ok_or_else(|| anyhow!("{} has no layer {}", path.display(), layer_name))?;
            layers.insert(diff_id, LegacyLayer::load(stored, scratch.path(), index)?);
        }
        info!("Loaded {} layers from legacy image {}", layers.len(), path.display());
        Ok(LegacyImage {
            path: path.to_path_buf(),
            layers,
            _scratch: scratch,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LegacyLayer {
    fn load(stored: &Path, scratch: &Path, index: usize) -> Result<LegacyLayer> {
        let mut magic = [0u8; 2];
        let read_size = File::open(stored)?.read(&mut magic)?;
        let (unzipped, zipped) = match Codec::detect(&magic[..read_size]) {
            Codec::Gzip => {
                let unzipped = scratch.join(format!("layer-{}.tar", index));
                let mut decoder = MultiGzDecoder::new(BufReader::new(File::open(stored)?));
                io::copy(&mut decoder, &mut File::create(&unzipped)?)?;
                (unzipped, stored.to_path_buf())
            }
            _ => {
                let zipped = scratch.join(format!("layer-{}.tar.gz", index));
                let mut reader = BufReader::new(File::open(stored)?);
                gz_copy(&mut reader, File::create(&zipped)?)?;
                (stored.to_path_buf(), zipped)
            }
        };
        Ok(LegacyLayer {
            blob_sum: RegDigest::new_with_sha256(file_sha256(&zipped)?),
            size: fs::metadata(&zipped)?.len(),
            unzipped,
        })
    }
}

impl BlobSource for LegacyImage {
    fn find(&self, diff_id: &RegDigest) -> Result<Option<LayerBlob>> {
        Ok(self.layers.get(diff_id).map(|layer| LayerBlob {
            digest: layer.blob_sum.clone(),
            media_type: RegContentType::DOCKER_LAYER_TGZ.val(),
            size: layer.size,
            urls: None,
            content: LayerContent::File(layer.unzipped.clone()),
        }))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use tar::{Builder, Header};

    use super::*;
    use crate::util::sha::bytes_sha256;

    pub(crate) fn tar_of(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = Builder::new(Vec::new());
        for (name, data) in files {
            let mut header = Header::new_gnu();
            header.set_mode(0o644);
            header.set_size(data.len() as u64);
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    /// A `docker save` style tarball with one image built from `layers`.
    pub(crate) fn saved_image(layers: &[Vec<u8>], diff_ids: &[String]) -> Vec<u8> {
        let config = serde_json::json!({"rootfs": {"type": "layers", "diff_ids": diff_ids}}).to_string();
        let names: Vec<String> = (0..layers.len()).map(|i| format!("l{}/layer.tar", i)).collect();
        let manifest = serde_json::json!([{"Config": "cfg.json", "RepoTags": null, "Layers": names}]).to_string();
        let mut files: Vec<(&str, &[u8])> = vec![("manifest.json", manifest.as_bytes()), ("cfg.json", config.as_bytes())];
        for (name, layer) in names.iter().zip(layers) {
            files.push((name.as_str(), &layer[..]));
        }
        tar_of(&files)
    }

    #[test]
    fn plain_and_gzipped_layers_get_blob_digests() -> Result<()> {
        let plain = tar_of(&[("./etc/os-release", &b"ID=test"[..])]);
        let gzipped = gz_copy(&mut &tar_of(&[("./bin/sh", &b"sh"[..])])[..], Vec::new())?;
        let expected_plain_blob = bytes_sha256(&gz_copy(&mut &plain[..], Vec::new())?);

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("legacy.tar");
        fs::write(&path, saved_image(&[plain.clone(), gzipped.clone()], &["sha256:d0".into(), "sha256:d1".into()]))?;
        let image = LegacyImage::open(&path)?;

        let base = image.find(&RegDigest::parse("sha256:d0")?)?.unwrap();
        assert_eq!(base.digest.sha256, expected_plain_blob);
        match &base.content {
            LayerContent::File(unzipped) => assert_eq!(fs::read(unzipped)?, plain),
            other => panic!("unexpected content {:?}", other),
        }

        let top = image.find(&RegDigest::parse("sha256:d1")?)?.unwrap();
        assert_eq!((top.digest.sha256.clone(), top.size), (bytes_sha256(&gzipped), gzipped.len() as u64));
        assert!(image.find(&RegDigest::parse("sha256:d2")?)?.is_none());
        Ok(())
    }

    #[test]
    fn layer_count_must_match_config() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("legacy.tar");
        fs::write(&path, saved_image(&[tar_of(&[])], &[]))?;
        assert!(LegacyImage::open(&path).is_err());
        Ok(())
    }

    #[test]
    fn config_is_found_by_any_member_name() -> Result<()> {
        let layer = tar_of(&[("./etc/hostname", &b"box"[..])]);
        let config = serde_json::json!({"rootfs": {"type": "layers", "diff_ids": ["sha256:d0"]}}).to_string();
        let manifest =
            serde_json::json!([{"Config": "blobs/sha256/c0", "Layers": ["blobs/sha256/l0"]}]).to_string();
        let saved = tar_of(&[
            ("manifest.json", manifest.as_bytes()),
            ("blobs/sha256/c0", config.as_bytes()),
            ("blobs/sha256/l0", &layer[..]),
        ]);

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("oci-layout.tar");
        fs::write(&path, saved)?;
        let image = LegacyImage::open(&path)?;
        assert!(image.find(&RegDigest::parse("sha256:d0")?)?.is_some());
        Ok(())
    }
}
