use std::fs::{self, File};
use std::io::{BufWriter, Write};

use anyhow::{Context, Result};
use log::info;
use ubyte::ToByteUnit;

use crate::archive::writer::LayerDigests;
use crate::config::cmd::LayerCmdArgs;
use crate::config::PackOptions;
use crate::layer::manifest::TarManifest;
use crate::layer::LayerBuilder;
use crate::subcmd::report;

pub struct LayerCommand {}

impl LayerCommand {
    pub fn layer(layer_args: &LayerCmdArgs) -> Result<()> {
        let result = layer_handle(layer_args);
        report("Layer", result, |digests| {
            format!("Layer: {}\nDiff id: sha256:{}", layer_args.output.display(), digests.diff_id)
        })?;
        Ok(())
    }
}

fn layer_handle(layer_args: &LayerCmdArgs) -> Result<LayerDigests> {
    let options = PackOptions::from_args(layer_args);
    let attributes = &options.attributes;
    let output = File::create(&layer_args.output)
        .with_context(|| format!("creating layer {}", layer_args.output.display()))?;
    let mut builder = LayerBuilder::new(BufWriter::new(output), &options)?;

    if let Some(manifest) = &layer_args.manifest {
        builder.add_manifest(&TarManifest::load(manifest)?)?;
    }
    for file in &layer_args.file {
        builder.add_file(&file.src, &file.dst, attributes.mode(&file.dst), &attributes.owner(&file.dst))?;
    }
    for path in &layer_args.empty_file {
        builder.add_empty_file(path, attributes.mode(path), &attributes.owner(path))?;
    }
    for path in &layer_args.empty_dir {
        builder.add_empty_dir(path, attributes.mode(path), &attributes.owner(path))?;
    }
    for path in &layer_args.empty_root_dir {
        builder.add_empty_root_dir(path, attributes.mode(path), &attributes.owner(path))?;
    }
    for tar in &layer_args.tar {
        builder.add_tar(tar)?;
    }
    for deb in &layer_args.deb {
        builder.add_deb(deb)?;
    }
    for link in &layer_args.link {
        builder.add_link(&link.name, &link.target)?;
    }

    let (mut output, digests) = builder.finish()?;
    output.flush()?;
    if let Some(path) = &layer_args.diffid_output {
        fs::write(path, &digests.diff_id).with_context(|| format!("writing {}", path.display()))?;
    }
    if let Some(path) = &layer_args.blobsum_output {
        fs::write(path, &digests.blob_sum).with_context(|| format!("writing {}", path.display()))?;
    }
    info!(
        "Wrote {} ({}), diff id sha256:{}",
        layer_args.output.display(),
        digests.size.bytes(),
        digests.diff_id
    );
    Ok(digests)
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::archive::writer::tests::read_members;
    use crate::config::cmd::CmdArgs;
    use crate::util::sha::file_sha256;

    #[test]
    fn flags_are_applied_after_the_manifest() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let src = dir.path().join("hello.txt");
        fs::write(&src, "hello")?;
        let manifest = dir.path().join("layer.manifest.json");
        fs::write(&manifest, r#"{"empty_dirs": ["/srv"]}"#)?;
        let output = dir.path().join("layer.tar");
        let diffid = dir.path().join("layer.diffid");

        let args = CmdArgs::try_parse_from([
            "imagepack".to_string(),
            "layer".to_string(),
            format!("--output={}", output.display()),
            format!("--manifest={}", manifest.display()),
            format!("--file={}=/srv/hello.txt", src.display()),
            "--modes=srv/hello.txt=0600".to_string(),
            "--link=/srv/latest:/srv/hello.txt".to_string(),
            format!("--diffid_output={}", diffid.display()),
        ])?;
        let layer_args = match args {
            CmdArgs::Layer(layer_args) => layer_args,
            _ => panic!("expected layer"),
        };
        LayerCommand::layer(&layer_args)?;

        let members = read_members(&fs::read(&output)?);
        let names: Vec<&str> = members.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["./srv/", "./srv/hello.txt", "./srv/latest"]);
        assert_eq!(members[1].mode, 0o600);
        assert_eq!(fs::read_to_string(&diffid)?, file_sha256(&output)?);
        Ok(())
    }
}
