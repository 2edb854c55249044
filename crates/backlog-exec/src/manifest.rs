//! Result manifest of a finished execution.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One execution's entry in `GET /history/<id>`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryEntry {
    /// Named outputs per graph node.
    #[serde(default)]
    pub outputs: BTreeMap<String, NodeOutput>,
    #[serde(default)]
    pub status: Option<HistoryStatus>,
}

/// Final status the backend recorded for an execution.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryStatus {
    #[serde(default)]
    pub status_str: Option<String>,
    #[serde(default)]
    pub completed: bool,
}

/// Outputs produced by a single node. Keys other than images and videos
/// (text, latents, …) are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeOutput {
    #[serde(default)]
    pub images: Vec<ArtifactRef>,
    #[serde(default)]
    pub videos: Vec<ArtifactRef>,
}

/// Locator of a stored artifact, as accepted by `GET /view`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
}

fn default_kind() -> String {
    "output".to_string()
}

impl ArtifactRef {
    /// Query string for `/view`.
    pub fn view_query(&self) -> String {
        url::form_urlencoded::Serializer::new(String::new())
            .append_pair("filename", &self.filename)
            .append_pair("subfolder", &self.subfolder)
            .append_pair("type", &self.kind)
            .finish()
    }
}

impl NodeOutput {
    /// Images then videos, each in manifest order.
    pub fn artifacts(&self) -> impl Iterator<Item = &ArtifactRef> {
        self.images.iter().chain(self.videos.iter())
    }

    pub fn has_artifacts(&self) -> bool {
        !self.images.is_empty() || !self.videos.is_empty()
    }
}

impl HistoryEntry {
    /// Decode the `{<id>: entry}` document returned for `execution_id`.
    ///
    /// Returns `None` while the backend has not recorded the execution.
    pub fn from_history(doc: &serde_json::Value, execution_id: &str) -> Result<Option<Self>, serde_json::Error> {
        match doc.get(execution_id) {
            None => Ok(None),
            Some(entry) => Ok(Some(serde_json::from_value(entry.clone())?)),
        }
    }

    /// Whether the backend recorded the execution as failed. Outputs of
    /// a failed execution are partial.
    pub fn is_error(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.status_str.as_deref())
            .is_some_and(|s| s == "error")
    }

    /// Nodes that produced at least one image or video.
    pub fn artifact_nodes(&self) -> impl Iterator<Item = (&String, &NodeOutput)> {
        self.outputs.iter().filter(|(_, out)| out.has_artifacts())
    }

    /// Every artifact locator, node by node.
    pub fn artifact_refs(&self) -> Vec<ArtifactRef> {
        self.artifact_nodes()
            .flat_map(|(_, out)| out.artifacts().cloned())
            .collect()
    }
}
