//! Writes images as a single tarball in the layout `docker load` reads.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tar::{Builder, EntryType, Header};

use crate::adapter::{LayerBlob, LayerContent};
use crate::archive::append_raw;
use crate::container::manifest::CommonManifestLayer;
use crate::container::{to_sorted_json, ConfigBlobSerialize, RegDigest};

const LAYER_VERSION: &[u8] = b"1.0";

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TarManifestJson {
    pub config: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_tags: Option<Vec<String>>,
    #[serde(default)]
    pub layers: Vec<String>,
    /// Descriptors of layers not shipped in the tarball, keyed by diff id
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub layer_sources: BTreeMap<String, CommonManifestLayer>,
}

pub struct BundleLayer {
    pub diff_id: RegDigest,
    pub blob: LayerBlob,
}

/// One tagged image ready to be written.
pub struct BundleImage {
    pub tag: String,
    pub config: ConfigBlobSerialize,
    pub manifest: ConfigBlobSerialize,
    pub layers: Vec<BundleLayer>,
}

enum Member {
    Bytes(Vec<u8>),
    File(PathBuf),
}

pub struct TarTargetAdapter {
    images: Vec<BundleImage>,
}

impl TarTargetAdapter {
    pub fn new(images: Vec<BundleImage>) -> TarTargetAdapter {
        TarTargetAdapter { images }
    }

    /// Writes all images into one archive. Members are sorted by name and
    /// carry fixed metadata, so equal inputs give equal bytes.
    pub fn save<W: Write>(self, writer: W) -> Result<W> {
        let mut members: BTreeMap<String, Member> = BTreeMap::new();
        let mut manifest = Vec::with_capacity(self.images.len());
        let mut repositories: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();

        for image in &self.images {
            let config_name = format!("{}.json", image.config.digest.sha256);
            members.insert(config_name.clone(), Member::Bytes(image.config.json_str.clone().into_bytes()));
            members.insert(
                format!("{}.manifest.json", image.manifest.digest.sha256),
                Member::Bytes(image.manifest.json_str.clone().into_bytes()),
            );

            let mut layers = Vec::with_capacity(image.layers.len());
            let mut layer_sources = BTreeMap::new();
            for layer in &image.layers {
                let dir = &layer.diff_id.sha256;
                let layer_name = format!("{}/layer.tar", dir);
                // a diff id shipped by one tag stays shipped when another marks it foreign
                if !matches!(members.get(&layer_name), Some(Member::File(_))) {
                    let content = match &layer.blob.content {
                        LayerContent::File(path) => Member::File(path.clone()),
                        LayerContent::Empty => Member::Bytes(vec![]),
                    };
                    members.insert(layer_name, content);
                }
                members.insert(format!("{}/VERSION", dir), Member::Bytes(LAYER_VERSION.to_vec()));
                members.insert(format!("{}/json", dir), Member::Bytes(to_sorted_json(&json!({ "id": dir }))?.into_bytes()));
                if layer.blob.is_foreign() {
                    layer_sources.insert(layer.diff_id.digest.clone(), layer.blob.descriptor());
                }
                layers.push(format!("{}/layer.tar", dir));
            }

            if let Some(top) = image.layers.last() {
                let (repository, tag) = split_tag(&image.tag);
                repositories
                    .entry(repository.to_string())
                    .or_default()
                    .insert(tag.to_string(), top.diff_id.sha256.clone());
            }
            manifest.push(TarManifestJson {
                config: config_name,
                repo_tags: Some(vec![image.tag.clone()]),
                layers,
                layer_sources,
            });
        }
        members.insert("manifest.json".to_string(), Member::Bytes(to_sorted_json(&manifest)?.into_bytes()));
        members.insert("repositories".to_string(), Member::Bytes(to_sorted_json(&repositories)?.into_bytes()));

        let mut builder = Builder::new(writer);
        for (name, member) in members {
            match member {
                Member::Bytes(data) => append_member(&mut builder, &name, data.len() as u64, data.as_slice())?,
                Member::File(path) => {
                    let file = File::open(&path).with_context(|| format!("opening layer {}", path.display()))?;
                    let size = file.metadata()?.len();
                    append_member(&mut builder, &name, size, BufReader::new(file))?
                }
            }
        }
        Ok(builder.into_inner()?)
    }
}

fn append_member<W: Write, R: std::io::Read>(builder: &mut Builder<W>, name: &str, size: u64, data: R) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_mode(0o644);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    header.set_size(size);
    append_raw(builder, &mut header, name.as_bytes(), None, data)?;
    Ok(())
}

/// Splits `registry:5000/app:v1` into `registry:5000/app` and `v1`.
pub fn split_tag(tag: &str) -> (&str, &str) {
    match tag.rfind(':') {
        Some(colon) if tag.rfind('/').map_or(true, |slash| colon > slash) => (&tag[..colon], &tag[colon + 1..]),
        _ => (tag, "latest"),
    }
}
