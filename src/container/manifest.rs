use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommonManifestLayer {
    pub media_type: String,
    pub size: u64,
    pub digest: String,
    /// Download locations of a foreign layer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CommonManifestConfig {
    pub media_type: String,
    pub size: u64,
    pub digest: String,
}

/// Only the layer list of a distribution manifest; other fields are ignored
/// and an empty document is accepted.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ManifestLayers {
    #[serde(default)]
    pub layers: Vec<CommonManifestLayer>,
}
