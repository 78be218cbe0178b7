use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::container::RegDigest;

pub mod docker;

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct History {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(rename = "created_by", skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(rename = "empty_layer", skip_serializing_if = "Option::is_none")]
    pub empty_layer: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rootfs {
    #[serde(rename = "diff_ids", default)]
    pub diff_ids: Vec<String>,
    #[serde(rename = "type")]
    pub type_field: String,
}

impl Default for Rootfs {
    fn default() -> Self {
        Rootfs {
            diff_ids: vec![],
            type_field: "layers".to_string(),
        }
    }
}

/// Layer chain of a config document. Only `rootfs.diff_ids` has to be well
/// formed, the rest of the document is not inspected.
pub fn config_diff_ids(config_json: &str) -> Result<Vec<RegDigest>> {
    let config: Value = serde_json::from_str(config_json)?;
    match config.pointer("/rootfs/diff_ids") {
        None | Some(Value::Null) => Ok(vec![]),
        Some(Value::Array(diff_ids)) => diff_ids
            .iter()
            .map(|diff_id| {
                diff_id
                    .as_str()
                    .ok_or_else(|| anyhow!("diff id is not a string: {}", diff_id))
                    .and_then(RegDigest::parse)
            })
            .collect(),
        Some(other) => Err(anyhow!("rootfs.diff_ids is not a list: {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_ids_from_partial_config() -> Result<()> {
        let diff_ids = config_diff_ids(r#"{"rootfs": {"diff_ids": ["sha256:aa", "sha256:bb"]}, "config": null}"#)?;
        assert_eq!(diff_ids.iter().map(|d| d.sha256.as_str()).collect::<Vec<_>>(), vec!["aa", "bb"]);
        assert!(config_diff_ids("{}")?.is_empty());
        assert!(config_diff_ids(r#"{"rootfs": {"diff_ids": "sha256:aa"}}"#).is_err());
        Ok(())
    }
}
