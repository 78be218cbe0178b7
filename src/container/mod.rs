use anyhow::{anyhow, Result};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::util::sha::bytes_sha256;

pub mod image;
pub mod manifest;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegDigest {
    pub sha256: String,
    pub digest: String,
}

impl RegDigest {
    pub fn new_with_sha256(sha256: String) -> RegDigest {
        RegDigest {
            digest: format!("sha256:{}", &sha256),
            sha256,
        }
    }

    pub fn new_with_digest(digest: String) -> Result<RegDigest> {
        let sha256 = digest
            .strip_prefix("sha256:")
            .ok_or_else(|| anyhow!("unsupported digest algorithm: {}", digest))?
            .to_string();
        Ok(RegDigest { sha256, digest })
    }

    /// Accepts both `sha256:<hex>` and a bare hex string.
    pub fn parse(value: &str) -> Result<RegDigest> {
        let value = value.trim();
        if value.starts_with("sha256:") {
            RegDigest::new_with_digest(value.to_string())
        } else {
            Ok(RegDigest::new_with_sha256(value.to_string()))
        }
    }
}

#[derive(Debug)]
pub struct RegContentType(pub &'static str);

impl RegContentType {
    pub const DOCKER_MANIFEST: Self = Self("application/vnd.docker.distribution.manifest.v2+json");
    pub const DOCKER_FOREIGN_LAYER_TGZ: Self = Self("application/vnd.docker.image.rootfs.foreign.diff.tar.gzip");
    pub const DOCKER_LAYER_TGZ: Self = Self("application/vnd.docker.image.rootfs.diff.tar.gzip");
    pub const DOCKER_CONTAINER_IMAGE: Self = Self("application/vnd.docker.container.image.v1+json");

    pub fn val(&self) -> &'static str {
        self.0
    }
}

/// A JSON document in the byte form that gets hashed and stored.
pub struct ConfigBlobSerialize {
    pub json_str: String,
    pub digest: RegDigest,
    pub size: u64,
}

impl ConfigBlobSerialize {
    pub fn from_json(json_str: String) -> ConfigBlobSerialize {
        let digest = RegDigest::new_with_sha256(bytes_sha256(json_str.as_bytes()));
        ConfigBlobSerialize {
            size: json_str.len() as u64,
            json_str,
            digest,
        }
    }
}

/// Serialises with object keys sorted at every level, so equal documents
/// always hash the same.
pub fn to_sorted_json<T: Serialize>(value: &T) -> Result<String> {
    let value = sort_keys(serde_json::to_value(value)?);
    Ok(serde_json::to_string(&value)?)
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(entries.into_iter().map(|(k, v)| (k, sort_keys(v))).collect::<Map<String, Value>>())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn sorted_json_orders_nested_keys() -> Result<()> {
        let doc = json!({"b": 1, "a": {"z": [{"y": 1, "x": 2}], "c": null}});
        assert_eq!(to_sorted_json(&doc)?, r#"{"a":{"c":null,"z":[{"x":2,"y":1}]},"b":1}"#);
        Ok(())
    }

    #[test]
    fn digest_parsing() -> Result<()> {
        assert_eq!(RegDigest::parse("sha256:abc\n")?.sha256, "abc");
        assert_eq!(RegDigest::parse("abc")?.digest, "sha256:abc");
        assert!(RegDigest::new_with_digest("md5:abc".to_string()).is_err());
        Ok(())
    }
}
