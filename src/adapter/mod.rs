use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use log::debug;
use url::Url;

use crate::container::manifest::CommonManifestLayer;
use crate::container::{RegContentType, RegDigest};
use crate::error::PackError;

pub mod legacy;
pub mod tar;

/// Where the uncompressed bytes of a layer come from when writing a bundle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LayerContent {
    File(PathBuf),
    /// Foreign layers are not shipped, their content stays empty
    Empty,
}

/// A layer resolved from its diff id.
#[derive(Clone, Debug, PartialEq)]
pub struct LayerBlob {
    pub digest: RegDigest,
    pub media_type: &'static str,
    pub size: u64,
    pub urls: Option<Vec<String>>,
    pub content: LayerContent,
}

impl LayerBlob {
    pub fn is_foreign(&self) -> bool {
        self.media_type == RegContentType::DOCKER_FOREIGN_LAYER_TGZ.val()
    }

    pub fn descriptor(&self) -> CommonManifestLayer {
        CommonManifestLayer {
            media_type: self.media_type.to_string(),
            size: self.size,
            digest: self.digest.digest.clone(),
            urls: self.urls.clone(),
        }
    }
}

/// One lookup strategy for layer blobs. Bundling asks each source in turn and
/// takes the first hit.
pub trait BlobSource {
    fn find(&self, diff_id: &RegDigest) -> Result<Option<LayerBlob>>;
}

/// Resolves `diff_id` against `sources` in order.
pub fn resolve(sources: &[&dyn BlobSource], diff_id: &RegDigest) -> Result<LayerBlob> {
    for source in sources {
        if let Some(blob) = source.find(diff_id)? {
            debug!("{} resolved to blob {}", diff_id.digest, blob.digest.digest);
            return Ok(blob);
        }
    }
    Err(PackError::UnresolvedBlob {
        diff_id: diff_id.digest.clone(),
    }
    .into())
}

pub struct LocalLayer {
    pub blob_sum: RegDigest,
    pub unzipped: PathBuf,
    pub zipped: PathBuf,
}

/// Layers built in this workspace; a later record for a diff id replaces an
/// earlier one.
#[derive(Default)]
pub struct LocalLayers {
    layers: HashMap<RegDigest, LocalLayer>,
}

impl LocalLayers {
    pub fn register(&mut self, diff_id: RegDigest, layer: LocalLayer) {
        self.layers.insert(diff_id, layer);
    }
}

impl BlobSource for LocalLayers {
    fn find(&self, diff_id: &RegDigest) -> Result<Option<LayerBlob>> {
        let layer = match self.layers.get(diff_id) {
            Some(layer) => layer,
            None => return Ok(None),
        };
        let size = fs::metadata(&layer.zipped)
            .with_context(|| format!("reading layer blob {}", layer.zipped.display()))?
            .len();
        Ok(Some(LayerBlob {
            digest: layer.blob_sum.clone(),
            media_type: RegContentType::DOCKER_LAYER_TGZ.val(),
            size,
            urls: None,
            content: LayerContent::File(layer.unzipped.clone()),
        }))
    }
}

/// Layers of one image that live outside the bundle, keyed by diff id.
#[derive(Default)]
pub struct ForeignLayers {
    layers: HashMap<RegDigest, CommonManifestLayer>,
}

impl ForeignLayers {
    /// Marks the diff ids at the positions of foreign descriptors in
    /// `manifest_layers` as foreign.
    pub fn from_manifest(diff_ids: &[RegDigest], manifest_layers: &[CommonManifestLayer]) -> Result<ForeignLayers> {
        let mut layers = HashMap::new();
        for (index, layer) in manifest_layers.iter().enumerate() {
            if layer.media_type != RegContentType::DOCKER_FOREIGN_LAYER_TGZ.val() {
                continue;
            }
            let diff_id = diff_ids.get(index).ok_or_else(|| {
                anyhow::anyhow!(
                    "manifest layer {} has no diff id, config only has {} layers",
                    index,
                    diff_ids.len()
                )
            })?;
            for url in layer.urls.iter().flatten() {
                Url::parse(url).with_context(|| format!("invalid url {:?} for foreign layer {}", url, layer.digest))?;
            }
            layers.insert(diff_id.clone(), layer.clone());
        }
        Ok(ForeignLayers { layers })
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl BlobSource for ForeignLayers {
    fn find(&self, diff_id: &RegDigest) -> Result<Option<LayerBlob>> {
        let layer = match self.layers.get(diff_id) {
            Some(layer) => layer,
            None => return Ok(None),
        };
        Ok(Some(LayerBlob {
            digest: RegDigest::new_with_digest(layer.digest.clone())?,
            media_type: RegContentType::DOCKER_FOREIGN_LAYER_TGZ.val(),
            size: layer.size,
            urls: layer.urls.clone(),
            content: LayerContent::Empty,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(hex: &str) -> RegDigest {
        RegDigest::new_with_sha256(hex.to_string())
    }

    fn foreign(hex: &str, url: &str) -> CommonManifestLayer {
        CommonManifestLayer {
            media_type: RegContentType::DOCKER_FOREIGN_LAYER_TGZ.val().to_string(),
            size: 1234,
            digest: format!("sha256:{}", hex),
            urls: Some(vec![url.to_string()]),
        }
    }

    #[test]
    fn first_source_wins() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let zipped = dir.path().join("layer.tar.gz");
        fs::write(&zipped, b"12345")?;
        let mut local = LocalLayers::default();
        local.register(
            digest("d1"),
            LocalLayer { blob_sum: digest("b1"), unzipped: dir.path().join("layer.tar"), zipped },
        );
        let foreign = ForeignLayers::from_manifest(&[digest("d1")], &[foreign("f1", "https://example.com/f1")])?;

        let blob = resolve(&[&foreign, &local], &digest("d1"))?;
        assert!(blob.is_foreign());
        assert_eq!(blob.content, LayerContent::Empty);
        assert_eq!(blob.size, 1234);

        let blob = resolve(&[&local, &foreign], &digest("d1"))?;
        assert_eq!((blob.digest.sha256.as_str(), blob.size), ("b1", 5));
        Ok(())
    }

    #[test]
    fn unknown_diff_id_is_unresolved() {
        let local = LocalLayers::default();
        let err = resolve(&[&local], &digest("dd")).unwrap_err();
        assert!(matches!(err.downcast_ref::<PackError>(), Some(PackError::UnresolvedBlob { diff_id }) if diff_id == "sha256:dd"));
    }

    #[test]
    fn foreign_layers_need_valid_urls_and_positions() {
        assert!(ForeignLayers::from_manifest(&[digest("d1")], &[foreign("f1", "not a url")]).is_err());
        assert!(ForeignLayers::from_manifest(&[], &[foreign("f1", "https://example.com")]).is_err());
    }
}
