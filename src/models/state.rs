use crate::error::Result;
use crate::inference::InferenceEngine;
use crate::models::download::DownloadManager;
use crate::models::registry;
use std::fmt;

/// Readiness of a model, derived from disk and the inference engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelState {
    NotPresent,
    Present,
    Loaded,
}

impl ModelState {
    /// Compute the current state of `name`
    ///
    /// A model whose files disappeared after loading reports `NotPresent`, so
    /// `Loaded` always implies the artifacts are on disk.
    pub fn resolve(
        name: &str,
        downloads: &DownloadManager,
        engine: &InferenceEngine,
    ) -> Result<Self> {
        let descriptor = registry::lookup(name)?;
        if !downloads.verify(name)? {
            return Ok(Self::NotPresent);
        }
        if engine.loaded_model() == Some(descriptor.id) {
            Ok(Self::Loaded)
        } else {
            Ok(Self::Present)
        }
    }
}

impl fmt::Display for ModelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotPresent => "not downloaded",
            Self::Present => "downloaded",
            Self::Loaded => "loaded",
        })
    }
}
