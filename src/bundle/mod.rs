//! Joins independently built layers and configs into one multi-tag bundle.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use log::{debug, info};

use crate::adapter::legacy::LegacyImage;
use crate::adapter::tar::{split_tag, BundleImage, BundleLayer, TarTargetAdapter};
use crate::adapter::{resolve, BlobSource, ForeignLayers, LocalLayer, LocalLayers};
use crate::config::cmd::JoinCmdArgs;
use crate::config::stamp::StampInfo;
use crate::container::image::config_diff_ids;
use crate::container::image::docker::DockerManifest;
use crate::container::manifest::{CommonManifestConfig, ManifestLayers};
use crate::container::{to_sorted_json, ConfigBlobSerialize, RegContentType, RegDigest};
use crate::util::file::{extract_value, read_file_arg};

/// A freshly built layer as recorded by the packager.
#[derive(Clone, Debug, PartialEq)]
pub struct LayerRecord {
    pub diff_id: RegDigest,
    pub blob_sum: RegDigest,
    pub unzipped: PathBuf,
    pub zipped: PathBuf,
}

/// Everything the bundler reads, with tags already stamped and normalised.
#[derive(Default, Debug)]
pub struct JoinInputs {
    /// tag to config document
    pub tags: BTreeMap<String, String>,
    /// tag to the manifest that may declare foreign layers
    pub manifests: HashMap<String, PathBuf>,
    pub layers: Vec<LayerRecord>,
    pub legacy: Vec<PathBuf>,
}

impl JoinInputs {
    pub fn from_args(args: &JoinCmdArgs) -> Result<JoinInputs> {
        let stamp = StampInfo::load(&args.stamp_info_file)?;
        let mut inputs = JoinInputs::default();
        for association in &args.tags {
            let tag = normalize_tag(&stamp.format(&association.key)?);
            let config = read_file_arg(&association.value).with_context(|| format!("reading config of {}", tag))?;
            inputs.tags.insert(tag, config);
        }
        for association in &args.manifests {
            let tag = normalize_tag(&stamp.format(&association.key)?);
            let path = association.value.strip_prefix('@').unwrap_or(&association.value);
            inputs.manifests.insert(tag, PathBuf::from(path));
        }
        for parts in &args.layer {
            inputs.layers.push(LayerRecord {
                diff_id: RegDigest::parse(&extract_value(&parts.diff_id_file)?)?,
                blob_sum: RegDigest::parse(&extract_value(&parts.blob_sum_file)?)?,
                unzipped: parts.unzipped.clone(),
                zipped: parts.zipped.clone(),
            });
        }
        inputs.legacy = args.legacy.clone();
        Ok(inputs)
    }
}

/// Appends `:latest` to a tag without a label.
pub fn normalize_tag(tag: &str) -> String {
    let (repository, label) = split_tag(tag);
    format!("{}:{}", repository, label)
}

pub struct Bundler {
    inputs: JoinInputs,
    local: LocalLayers,
    legacy: Vec<LegacyImage>,
}

impl Bundler {
    /// Registers legacy images first and fresh layers after them.
    pub fn new(inputs: JoinInputs) -> Result<Bundler> {
        let mut legacy = Vec::with_capacity(inputs.legacy.len());
        for path in &inputs.legacy {
            let image = LegacyImage::open(path)?;
            debug!("registered legacy image {}", image.path().display());
            legacy.push(image);
        }
        let mut local = LocalLayers::default();
        for record in &inputs.layers {
            debug!("registering {} as blob {}", record.diff_id.digest, record.blob_sum.digest);
            local.register(
                record.diff_id.clone(),
                LocalLayer {
                    blob_sum: record.blob_sum.clone(),
                    unzipped: record.unzipped.clone(),
                    zipped: record.zipped.clone(),
                },
            );
        }
        Ok(Bundler { inputs, local, legacy })
    }

    /// Resolves every tag into a complete image.
    pub fn images(&self) -> Result<Vec<BundleImage>> {
        let mut images = Vec::with_capacity(self.inputs.tags.len());
        for (tag, config) in &self.inputs.tags {
            images.push(self.image(tag, config)?);
        }
        Ok(images)
    }

    pub fn save<W: Write>(&self, writer: W) -> Result<W> {
        let images = self.images()?;
        info!("Writing bundle with {} tags", images.len());
        TarTargetAdapter::new(images).save(writer)
    }

    fn image(&self, tag: &str, config: &str) -> Result<BundleImage> {
        let diff_ids = config_diff_ids(config).with_context(|| format!("reading config of {}", tag))?;
        let foreign = self.foreign_layers(tag, &diff_ids)?;

        let mut sources: Vec<&dyn BlobSource> = vec![&foreign, &self.local];
        sources.extend(self.legacy.iter().map(|image| image as &dyn BlobSource));

        let mut layers = Vec::with_capacity(diff_ids.len());
        for diff_id in diff_ids {
            let blob = resolve(&sources, &diff_id)?;
            layers.push(BundleLayer { diff_id, blob });
        }

        let config = ConfigBlobSerialize::from_json(config.to_string());
        let manifest = DockerManifest::new(
            CommonManifestConfig {
                media_type: RegContentType::DOCKER_CONTAINER_IMAGE.val().to_string(),
                size: config.size,
                digest: config.digest.digest.clone(),
            },
            layers.iter().map(|layer| layer.blob.descriptor()).collect(),
        );
        let manifest = ConfigBlobSerialize::from_json(to_sorted_json(&manifest)?);
        debug!("{} resolved to manifest {}", tag, manifest.digest.digest);
        Ok(BundleImage {
            tag: tag.to_string(),
            config,
            manifest,
            layers,
        })
    }

    fn foreign_layers(&self, tag: &str, diff_ids: &[RegDigest]) -> Result<ForeignLayers> {
        let path = match self.inputs.manifests.get(tag) {
            Some(path) => path,
            None => return Ok(ForeignLayers::default()),
        };
        let content = fs::read_to_string(path).with_context(|| format!("reading manifest {}", path.display()))?;
        let manifest: ManifestLayers =
            serde_json::from_str(&content).with_context(|| format!("parsing manifest {}", path.display()))?;
        let foreign = ForeignLayers::from_manifest(diff_ids, &manifest.layers)
            .with_context(|| format!("foreign layers of {}", tag))?;
        if !foreign.is_empty() {
            info!("{} references foreign layers from {}", tag, path.display());
        }
        Ok(foreign)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use clap::Parser;
    use serde_json::json;
    use tar::Archive;

    use super::*;
    use crate::adapter::legacy::tests::{saved_image, tar_of};
    use crate::adapter::tar::TarManifestJson;
    use crate::config::cmd::CmdArgs;
    use crate::error::PackError;
    use crate::util::compress::gz_copy;

    fn members(bytes: &[u8]) -> BTreeMap<String, Vec<u8>> {
        let mut archive = Archive::new(bytes);
        archive
            .entries()
            .unwrap()
            .map(|entry| {
                let mut entry = entry.unwrap();
                let name = entry.path().unwrap().to_string_lossy().into_owned();
                let mut data = Vec::new();
                entry.read_to_end(&mut data).unwrap();
                (name, data)
            })
            .collect()
    }

    fn config_with(diff_ids: &[&str]) -> String {
        json!({"architecture": "amd64", "os": "linux", "rootfs": {"type": "layers", "diff_ids": diff_ids}}).to_string()
    }

    fn fresh_layer(dir: &std::path::Path, name: &str, diff: &str, blob: &str) -> Result<LayerRecord> {
        let unzipped = dir.join(format!("{}.tar", name));
        let zipped = dir.join(format!("{}.tar.gz", name));
        fs::write(&unzipped, tar_of(&[(name, &b"fresh"[..])]))?;
        fs::write(&zipped, b"zipped-bytes")?;
        Ok(LayerRecord {
            diff_id: RegDigest::parse(diff)?,
            blob_sum: RegDigest::parse(blob)?,
            unzipped,
            zipped,
        })
    }

    fn manifest_of(bundle: &BTreeMap<String, Vec<u8>>, entry: &TarManifestJson) -> Result<serde_json::Value> {
        let config_hex = entry.config.trim_end_matches(".json");
        let name = bundle
            .keys()
            .find(|name| name.ends_with(".manifest.json"))
            .cloned()
            .unwrap_or_default();
        let manifest: serde_json::Value = serde_json::from_slice(&bundle[&name])?;
        assert_eq!(manifest["config"]["digest"], format!("sha256:{}", config_hex));
        Ok(manifest)
    }

    #[test]
    fn fresh_layer_wins_over_legacy() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let legacy_layer = tar_of(&[("./old", &b"legacy"[..])]);
        let legacy_path = dir.path().join("base.tar");
        fs::write(&legacy_path, saved_image(&[legacy_layer.clone()], &["sha256:dd".to_string()]))?;
        let legacy_blob = crate::util::sha::bytes_sha256(&gz_copy(&mut &legacy_layer[..], Vec::new())?);

        let mut inputs = JoinInputs {
            legacy: vec![legacy_path.clone()],
            ..Default::default()
        };
        inputs.tags.insert("app:v1".to_string(), config_with(&["sha256:dd"]));
        let legacy_only = Bundler::new(inputs)?.images()?;
        assert_eq!(legacy_only[0].layers[0].blob.digest.sha256, legacy_blob);

        let mut inputs = JoinInputs {
            legacy: vec![legacy_path],
            layers: vec![fresh_layer(dir.path(), "new", "sha256:dd", "sha256:b0b")?],
            ..Default::default()
        };
        inputs.tags.insert("app:v1".to_string(), config_with(&["sha256:dd"]));
        let bundle = members(&Bundler::new(inputs)?.save(Vec::new())?);

        let index: Vec<TarManifestJson> = serde_json::from_slice(&bundle["manifest.json"])?;
        let manifest = manifest_of(&bundle, &index[0])?;
        assert_eq!(manifest["layers"][0]["digest"], "sha256:b0b");
        assert_eq!(manifest["layers"][0]["size"], 12);
        assert_eq!(manifest["layers"][0]["mediaType"], RegContentType::DOCKER_LAYER_TGZ.val());
        assert_eq!(bundle["dd/layer.tar"], tar_of(&[("new", &b"fresh"[..])]));
        Ok(())
    }

    #[test]
    fn foreign_layer_ships_no_content() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let manifest_path = dir.path().join("base.manifest.json");
        fs::write(
            &manifest_path,
            json!({"schemaVersion": 2, "layers": [{
                "mediaType": RegContentType::DOCKER_FOREIGN_LAYER_TGZ.val(),
                "size": 4096,
                "digest": "sha256:f0",
                "urls": ["https://mcr.example.com/f0"],
            }]})
            .to_string(),
        )?;
        let mut inputs = JoinInputs {
            layers: vec![fresh_layer(dir.path(), "app", "sha256:a1", "sha256:b1")?],
            ..Default::default()
        };
        inputs.tags.insert("win:v1".to_string(), config_with(&["sha256:e0", "sha256:a1"]));
        inputs.manifests.insert("win:v1".to_string(), manifest_path);

        let bundle = members(&Bundler::new(inputs)?.save(Vec::new())?);
        let index: Vec<TarManifestJson> = serde_json::from_slice(&bundle["manifest.json"])?;
        let manifest = manifest_of(&bundle, &index[0])?;
        assert_eq!(manifest["layers"][0]["mediaType"], RegContentType::DOCKER_FOREIGN_LAYER_TGZ.val());
        assert_eq!(manifest["layers"][0]["size"], 4096);
        assert_eq!(manifest["layers"][0]["urls"][0], "https://mcr.example.com/f0");
        assert_eq!(manifest["layers"][1]["digest"], "sha256:b1");
        assert!(bundle["e0/layer.tar"].is_empty());
        assert_eq!(index[0].layer_sources["sha256:e0"].digest, "sha256:f0");

        let repositories: serde_json::Value = serde_json::from_slice(&bundle["repositories"])?;
        assert_eq!(repositories["win"]["v1"], "a1");
        Ok(())
    }

    #[test]
    fn missing_blob_is_an_assembly_error() -> Result<()> {
        let mut inputs = JoinInputs::default();
        inputs.tags.insert("app:latest".to_string(), config_with(&["sha256:404"]));
        let err = Bundler::new(inputs)?.images().err().unwrap();
        assert!(matches!(err.downcast_ref::<PackError>(), Some(PackError::UnresolvedBlob { .. })));
        Ok(())
    }

    #[test]
    fn bundling_is_deterministic_across_tags() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let build = || -> Result<Vec<u8>> {
            let mut inputs = JoinInputs {
                layers: vec![fresh_layer(dir.path(), "app", "sha256:a1", "sha256:b1")?],
                ..Default::default()
            };
            inputs.tags.insert("b/app:v2".to_string(), config_with(&["sha256:a1"]));
            inputs.tags.insert("a/app:v1".to_string(), config_with(&["sha256:a1"]));
            Bundler::new(inputs)?.save(Vec::new())
        };
        let first = build()?;
        assert_eq!(first, build()?);
        let index: Vec<TarManifestJson> = serde_json::from_slice(&members(&first)["manifest.json"])?;
        let tags: Vec<String> = index.iter().flat_map(|entry| entry.repo_tags.clone().unwrap_or_default()).collect();
        assert_eq!(tags, vec!["a/app:v1", "b/app:v2"]);
        Ok(())
    }

    #[test]
    fn join_args_are_stamped_and_read() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let stamp = dir.path().join("stable-status.txt");
        let config = dir.path().join("config.json");
        let diff = dir.path().join("layer.diffid");
        let blob = dir.path().join("layer.blobsum");
        fs::write(&stamp, "BUILD_USER ci\n")?;
        fs::write(&config, config_with(&["sha256:a1"]))?;
        fs::write(&diff, "a1\n")?;
        fs::write(&blob, "sha256:b1")?;

        let args = CmdArgs::try_parse_from([
            "imagepack".to_string(),
            "join".to_string(),
            "--output".to_string(),
            "out.tar".to_string(),
            "--tags".to_string(),
            format!("gcr.io/{{BUILD_USER}}/app=@{}", config.display()),
            "--layer".to_string(),
            format!("@{}=@{}=u.tar=z.tar.gz", diff.display(), blob.display()),
            "--stamp-info-file".to_string(),
            stamp.display().to_string(),
        ])?;
        let join = match args {
            CmdArgs::Join(join) => join,
            _ => panic!("expected join"),
        };
        let inputs = JoinInputs::from_args(&join)?;
        assert!(inputs.tags.contains_key("gcr.io/ci/app:latest"));
        assert_eq!(inputs.layers[0].diff_id.digest, "sha256:a1");
        assert_eq!(inputs.layers[0].blob_sum.digest, "sha256:b1");
        Ok(())
    }

    #[test]
    fn association_arity_is_checked() {
        let err = CmdArgs::try_parse_from([
            "imagepack", "join", "--output", "o", "--tags", "app=a=b", "--layer", "a=b=c=d",
        ])
        .err()
        .unwrap();
        assert!(err.to_string().contains("app=a=b"));

        let err = "a=b=c".parse::<crate::config::cmd::LayerParts>().unwrap_err();
        assert!(matches!(err.downcast_ref::<PackError>(), Some(PackError::InvalidAssociation { .. })));
    }
}
