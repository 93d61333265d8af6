use crate::error::{BgError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a supported segmentation model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelId {
    Rmbg14,
    Rmbg20,
}

/// Numeric pipeline a model family runs through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    /// IS-Net (RMBG 1.4): mean 0.5 / std 1.0 input, min-max normalized output map
    Isnet,
    /// BiRefNet (RMBG 2.0): ImageNet-normalized input, sigmoid over the last output head
    BiRefNet,
}

/// Kind of Hugging Face repository holding the artifacts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoKind {
    Model,
    Dataset,
    Space,
}

/// Everything needed to fetch, verify and load one model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelDescriptor {
    pub id: ModelId,
    pub display_name: &'static str,
    pub size_mb: u64,
    pub hf_repo: &'static str,
    pub hf_revision: &'static str,
    pub repo_kind: RepoKind,
    /// Required files, relative to the model directory
    pub files: &'static [&'static str],
    /// Manifest entry the runtime loads the network from
    pub weights: &'static str,
    pub variant: Variant,
}

pub static RMBG14: ModelDescriptor = ModelDescriptor {
    id: ModelId::Rmbg14,
    display_name: "RMBG 1.4",
    size_mb: 200,
    hf_repo: "regitBT/rmbg14fork",
    hf_revision: "main",
    repo_kind: RepoKind::Model,
    files: &["config.json", "briarmbg.py", "model.safetensors", "MyConfig.py"],
    weights: "model.safetensors",
    variant: Variant::Isnet,
};

pub static RMBG20: ModelDescriptor = ModelDescriptor {
    id: ModelId::Rmbg20,
    display_name: "RMBG 2.0",
    size_mb: 900,
    hf_repo: "regitBT/rmbg20fork",
    hf_revision: "main",
    repo_kind: RepoKind::Model,
    files: &[
        "config.json",
        "BiRefNet_config.py",
        "model.safetensors",
        "birefnet.py",
        "onnx/model.onnx",
    ],
    weights: "onnx/model.onnx",
    variant: Variant::BiRefNet,
};

/// Registry of supported models, in presentation order
pub static MODELS: [&ModelDescriptor; 2] = [&RMBG14, &RMBG20];

/// Look up a model by identifier
pub fn lookup(name: &str) -> Result<&'static ModelDescriptor> {
    MODELS
        .iter()
        .copied()
        .find(|m| m.id.as_str() == name)
        .ok_or_else(|| {
            let hint = suggest(name)
                .map(|s| format!(" (did you mean '{s}'?)"))
                .unwrap_or_default();
            BgError::ModelNotFound(format!(
                "'{name}'{hint}. Available models: {}",
                all_names().join(", ")
            ))
        })
}

/// All registered models
#[must_use]
pub fn all() -> &'static [&'static ModelDescriptor] {
    &MODELS
}

/// Get all model names
#[must_use]
pub fn all_names() -> Vec<&'static str> {
    MODELS.iter().map(|m| m.id.as_str()).collect()
}

/// Find closest match using Levenshtein distance
#[must_use]
pub fn suggest(name: &str) -> Option<&'static str> {
    if name.is_empty() {
        return None;
    }

    MODELS
        .iter()
        .map(|m| (m.id.as_str(), levenshtein_distance(name, m.id.as_str())))
        .min_by_key(|(_, dist)| *dist)
        .filter(|(_, dist)| *dist <= 2) // Only suggest if within 2 edits
        .map(|(model_name, _)| model_name)
}

impl ModelId {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Rmbg14 => "rmbg14",
            Self::Rmbg20 => "rmbg20",
        }
    }

    #[must_use]
    pub fn descriptor(self) -> &'static ModelDescriptor {
        match self {
            Self::Rmbg14 => &RMBG14,
            Self::Rmbg20 => &RMBG20,
        }
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelId {
    type Err = BgError;

    fn from_str(s: &str) -> Result<Self> {
        lookup(s).map(|m| m.id)
    }
}

impl From<RepoKind> for hf_hub::RepoType {
    fn from(kind: RepoKind) -> Self {
        match kind {
            RepoKind::Model => Self::Model,
            RepoKind::Dataset => Self::Dataset,
            RepoKind::Space => Self::Space,
        }
    }
}

/// Calculate Levenshtein distance between two strings
fn levenshtein_distance(s1: &str, s2: &str) -> usize {
    let s2_chars: Vec<char> = s2.chars().collect();
    let mut prev: Vec<usize> = (0..=s2_chars.len()).collect();

    for (i, c1) in s1.chars().enumerate() {
        let mut row = Vec::with_capacity(prev.len());
        row.push(i + 1);
        for (j, c2) in s2_chars.iter().enumerate() {
            let cost = usize::from(c1 != *c2);
            row.push((prev[j + 1] + 1).min(row[j] + 1).min(prev[j] + cost));
        }
        prev = row;
    }

    prev[s2_chars.len()]
}
