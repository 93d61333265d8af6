use std::path::PathBuf;
use thiserror::Error;

/// Main error type for bgstrip
#[derive(Error, Debug)]
pub enum BgError {
    #[error("Model not found: {0}\n\nTroubleshooting:\n- List supported models: bgstrip models\n- Check the [models] default entry in config")]
    ModelNotFound(String),

    #[error("Download of model '{model}' failed: {reason}\n\nTroubleshooting:\n- Check internet connection\n- Ensure sufficient disk space in the models directory\n- Retry the download; completed files are not fetched again")]
    DownloadFailure { model: String, reason: String },

    #[error("Model '{model}' is incomplete after download, missing: {}", missing.join(", "))]
    VerificationFailure { model: String, missing: Vec<String> },

    #[error("A download of model '{0}' is already in progress")]
    DownloadInProgress(String),

    #[error("Model loading error for '{model}': {reason}\n\nTroubleshooting:\n- Delete the model directory and download it again\n- Try device = \"cpu\" in config if the accelerator is out of memory")]
    ModelLoadFailure { model: String, reason: String },

    #[error("No model loaded. Load a model before removing backgrounds")]
    NoModelLoaded,

    #[error("Inference failed for {}: {reason}", path.display())]
    InferenceFailure { path: PathBuf, reason: String },

    #[error("A batch run is already active")]
    BatchAlreadyRunning,

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("File error for {}: {reason}", path.display())]
    FileIo { path: PathBuf, reason: String },

    #[error("Config error: {0}\n\nTroubleshooting:\n- Check config file: ~/.config/bgstrip/config.toml\n- Run with RUST_LOG=debug for more details")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl BgError {
    pub(crate) fn download(model: impl ToString, reason: impl ToString) -> Self {
        Self::DownloadFailure {
            model: model.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn load(model: impl ToString, reason: impl ToString) -> Self {
        Self::ModelLoadFailure {
            model: model.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn inference(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::InferenceFailure {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn file(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::FileIo {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BgError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verification_failure_lists_missing_files() {
        let err = BgError::VerificationFailure {
            model: "rmbg14".to_string(),
            missing: vec!["config.json".to_string(), "model.safetensors".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Model 'rmbg14' is incomplete after download, missing: config.json, model.safetensors"
        );
    }

    #[test]
    fn test_inference_failure_names_path() {
        let err = BgError::inference("/tmp/cat.png", "corrupt PNG");
        assert!(err.to_string().contains("/tmp/cat.png"));
        assert!(err.to_string().contains("corrupt PNG"));
    }
}
