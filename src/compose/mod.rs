//! Config composer: lays one override pass over a base image config.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use derive_builder::Builder;
use regex::{Captures, Regex};
use serde_json::{Map, Value};

use crate::config::cmd::ConfigCmdArgs;
use crate::config::stamp::StampInfo;
use crate::container::image::docker::DockerConfigBlob;
use crate::container::image::History;
use crate::container::{to_sorted_json, RegDigest};
use crate::util::file::{extract_content, extract_value};

pub const DEFAULT_CREATED: &str = "1970-01-01T00:00:00Z";
pub const AUTHOR: &str = "Bazel";
pub const CREATED_BY: &str = "bazel build ...";

/// Values above this are epoch milliseconds written by older tooling.
const MILLIS_THRESHOLD: f64 = 1.0e11;

#[derive(Builder, Debug, Clone, Default, PartialEq)]
#[builder(default)]
pub struct Overrides {
    /// New diff ids, bottom first, with or without the `sha256:` prefix
    #[builder(setter(into))]
    pub layers: Vec<String>,
    #[builder(setter(into))]
    pub entrypoint: Vec<String>,
    #[builder(setter(into))]
    pub cmd: Vec<String>,
    #[builder(setter(into, strip_option))]
    pub creation_time: Option<String>,
    #[builder(setter(into, strip_option))]
    pub user: Option<String>,
    #[builder(setter(into))]
    pub labels: Vec<(String, String)>,
    #[builder(setter(into))]
    pub env: Vec<(String, String)>,
    #[builder(setter(into))]
    pub ports: Vec<String>,
    #[builder(setter(into))]
    pub volumes: Vec<String>,
    #[builder(setter(into, strip_option))]
    pub workdir: Option<String>,
}

impl Overrides {
    /// Resolves `@file` values, stamps and the creation time of the command line.
    pub fn from_args(args: &ConfigCmdArgs) -> Result<Overrides> {
        let stamp_info = if args.stamp_info_file.is_empty() {
            None
        } else {
            Some(StampInfo::load(&args.stamp_info_file)?)
        };
        let stamp = |value: &str| -> Result<String> {
            match &stamp_info {
                Some(info) if !value.is_empty() => info.format(value),
                _ => Ok(value.to_string()),
            }
        };
        let stamp_all = |values: Vec<String>| values.iter().map(|v| stamp(v)).collect::<Result<Vec<String>>>();

        let mut labels = Vec::with_capacity(args.labels.len());
        for label in &args.labels {
            let value = if label.value.starts_with('@') {
                extract_content(&label.value)?
            } else if label.value.contains('{') {
                stamp(&label.value)?
            } else {
                label.value.clone()
            };
            labels.push((label.key.clone(), value));
        }
        let env = args
            .env
            .iter()
            .map(|kv| Ok((kv.key.clone(), stamp(&kv.value)?)))
            .collect::<Result<Vec<(String, String)>>>()?;
        let layers = args.layer.iter().map(|l| extract_value(l)).collect::<Result<Vec<String>>>()?;

        let mut builder = OverridesBuilder::default();
        builder
            .layers(layers)
            .entrypoint(stamp_all(fix_dashdash(args.entrypoint.clone()))?)
            .cmd(stamp_all(fix_dashdash(args.command.clone()))?)
            .labels(labels)
            .env(env)
            .ports(args.ports.clone())
            .volumes(args.volumes.clone());
        if let Some(creation_time) = &args.creation_time {
            builder.creation_time(parse_creation_time(&stamp(creation_time)?));
        }
        if let Some(user) = &args.user {
            builder.user(stamp(user)?);
        }
        if let Some(workdir) = &args.workdir {
            builder.workdir(stamp(workdir)?);
        }
        Ok(builder.build()?)
    }
}

/// Flag parsers collapse a lone `--` argument to nothing; put it back.
pub fn fix_dashdash(args: Vec<String>) -> Vec<String> {
    args.into_iter()
        .map(|arg| if arg.is_empty() { "--".to_string() } else { arg })
        .collect()
}

/// Seconds since the epoch (fractional allowed) become RFC 3339 with
/// microseconds, anything else is taken as already formatted.
pub fn parse_creation_time(value: &str) -> String {
    let seconds = match value.trim().parse::<f64>() {
        Ok(seconds) if seconds.is_finite() => seconds,
        _ => return value.to_string(),
    };
    let seconds = if seconds > MILLIS_THRESHOLD { seconds / 1000.0 } else { seconds };
    let micros = (seconds * 1_000_000.0).round() as i64;
    let timestamp = DateTime::<Utc>::from_timestamp(
        micros.div_euclid(1_000_000),
        (micros.rem_euclid(1_000_000) * 1000) as u32,
    );
    match timestamp {
        Some(timestamp) => timestamp.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string(),
        None => value.to_string(),
    }
}

/// Applies `overrides` on top of `base`. The result gets exactly one history
/// entry per new diff id, or a single empty-layer entry when there is none.
pub fn override_config(base: &DockerConfigBlob, overrides: &Overrides, architecture: &str, os: &str) -> Result<DockerConfigBlob> {
    let mut output = base.clone();
    output.architecture = Some(architecture.to_string());
    output.os = Some(os.to_string());
    output.author = Some(AUTHOR.to_string());
    let created = overrides.creation_time.clone().unwrap_or_else(|| DEFAULT_CREATED.to_string());
    output.created = Some(created.clone());

    let config = &mut output.config;
    if !overrides.entrypoint.is_empty() {
        config.entrypoint = Some(overrides.entrypoint.clone());
    }
    if !overrides.cmd.is_empty() {
        config.cmd = Some(overrides.cmd.clone());
    }
    if let Some(user) = overrides.user.as_ref().filter(|u| !u.is_empty()) {
        config.user = Some(user.clone());
    }
    if !overrides.env.is_empty() {
        let mut environ: BTreeMap<String, String> = config
            .env
            .iter()
            .flatten()
            .map(|kv| match kv.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (kv.clone(), String::new()),
            })
            .collect();
        for (key, value) in &overrides.env {
            let resolved = expand_vars(value, &environ)?;
            environ.insert(key.clone(), resolved);
        }
        config.env = Some(environ.into_iter().map(|(k, v)| format!("{}={}", k, v)).collect());
    }
    if !overrides.labels.is_empty() {
        let labels = config.labels.get_or_insert_with(BTreeMap::new);
        labels.extend(overrides.labels.iter().cloned());
    }
    if !overrides.ports.is_empty() {
        let ports = config.exposed_ports.get_or_insert_with(BTreeMap::new);
        for port in &overrides.ports {
            let port = if port.contains('/') { port.clone() } else { format!("{}/tcp", port) };
            ports.insert(port, Value::Object(Map::new()));
        }
    }
    if !overrides.volumes.is_empty() {
        let volumes = config.volumes.get_or_insert_with(BTreeMap::new);
        for volume in &overrides.volumes {
            volumes.insert(volume.clone(), Value::Object(Map::new()));
        }
    }
    if let Some(workdir) = overrides.workdir.as_ref().filter(|w| !w.is_empty()) {
        config.working_dir = Some(workdir.clone());
    }

    let entry = History {
        created: Some(created),
        created_by: Some(CREATED_BY.to_string()),
        author: Some(AUTHOR.to_string()),
        ..Default::default()
    };
    if overrides.layers.is_empty() {
        output.history.push(History {
            empty_layer: Some(true),
            ..entry.clone()
        });
    }
    for layer in &overrides.layers {
        output.rootfs.diff_ids.push(RegDigest::parse(layer)?.digest);
        output.history.push(entry.clone());
    }
    Ok(output)
}

/// Drops `Entrypoint`/`Cmd` when asked to and prepends the entrypoint prefix.
pub fn finalize(output: &mut DockerConfigBlob, null_entrypoint: bool, null_cmd: bool, entrypoint_prefix: &[String]) {
    if null_cmd {
        output.config.cmd = None;
    }
    if null_entrypoint {
        output.config.entrypoint = None;
    }
    if !entrypoint_prefix.is_empty() {
        let mut entrypoint = entrypoint_prefix.to_vec();
        entrypoint.extend(output.config.entrypoint.take().unwrap_or_default());
        output.config.entrypoint = Some(entrypoint);
    }
}

/// Config bytes as stored: sorted keys and a trailing newline.
pub fn render(config: &DockerConfigBlob) -> Result<String> {
    Ok(to_sorted_json(config)? + "\n")
}

pub fn load_base(path: Option<&Path>) -> Result<DockerConfigBlob> {
    match path {
        Some(path) => {
            let content = fs::read_to_string(path).with_context(|| format!("reading base config {}", path.display()))?;
            Ok(serde_json::from_str(&content)?)
        }
        None => Ok(DockerConfigBlob::default()),
    }
}

/// Expands `$NAME` and `${NAME}`; unknown names stay as written.
fn expand_vars(value: &str, environ: &BTreeMap<String, String>) -> Result<String> {
    let var = Regex::new(r"\$(\w+|\{[^}]*\})")?;
    Ok(var
        .replace_all(value, |caps: &Captures| {
            let name = caps[1].trim_start_matches('{').trim_end_matches('}');
            environ.get(name).cloned().unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned())
}
