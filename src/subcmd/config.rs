use std::fs;

use anyhow::{Context, Result};
use log::info;

use crate::compose::{finalize, load_base, override_config, render, Overrides};
use crate::config::cmd::ConfigCmdArgs;
use crate::container::ConfigBlobSerialize;
use crate::subcmd::report;

pub struct ConfigCommand {}

impl ConfigCommand {
    pub fn config(config_args: &ConfigCmdArgs) -> Result<()> {
        let result = config_handle(config_args);
        report("Config", result, |digest| {
            format!("Config: {}\nDigest: {}", config_args.output.display(), digest)
        })?;
        Ok(())
    }
}

/// Writes the composed config and returns its digest.
fn config_handle(config_args: &ConfigCmdArgs) -> Result<String> {
    let base = load_base(config_args.base.as_deref())?;
    let overrides = Overrides::from_args(config_args)?;
    let mut output = override_config(
        &base,
        &overrides,
        &config_args.architecture,
        &config_args.operating_system,
    )?;
    finalize(
        &mut output,
        config_args.null_entrypoint.0,
        config_args.null_cmd.0,
        &config_args.entrypoint_prefix,
    );

    let blob = ConfigBlobSerialize::from_json(render(&output)?);
    fs::write(&config_args.output, &blob.json_str)
        .with_context(|| format!("writing config {}", config_args.output.display()))?;

    if let Some(manifest_output) = &config_args.manifestoutput {
        let manifest = match &config_args.basemanifest {
            Some(base_manifest) => fs::read_to_string(base_manifest)
                .with_context(|| format!("reading base manifest {}", base_manifest.display()))?,
            None => "{}".to_string(),
        };
        fs::write(manifest_output, manifest).with_context(|| format!("writing {}", manifest_output.display()))?;
    }
    info!(
        "Wrote {} with {} layers",
        config_args.output.display(),
        output.rootfs.diff_ids.len()
    );
    Ok(blob.digest.digest)
}
