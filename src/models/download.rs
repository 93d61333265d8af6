use crate::error::{BgError, Result};
use crate::models::registry::{self, ModelDescriptor, ModelId};
use async_trait::async_trait;
use hf_hub::api::tokio::{Api, ApiBuilder};
use hf_hub::Repo;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Source of model artifacts
///
/// Implementations place fetched files in a cache they own and return the
/// cached path. Fetching a file that is already complete in the cache must
/// not transfer it again, and an interrupted transfer must be resumable.
#[async_trait]
pub trait RemoteRepository: Send + Sync {
    /// Fetch one manifest file of `descriptor`
    async fn fetch(&self, descriptor: &ModelDescriptor, file: &str) -> Result<PathBuf>;
}

/// `HuggingFace` Hub repository backed by the hf-hub cache
pub struct HfHubRepository {
    api: Api,
    revision: Option<String>,
}

impl HfHubRepository {
    /// Create a client whose cache lives in `cache_dir`
    pub fn new(cache_dir: PathBuf) -> Result<Self> {
        let api = ApiBuilder::new()
            .with_cache_dir(cache_dir)
            .with_progress(false)
            .build()
            .map_err(|e| {
                BgError::Other(format!("Failed to initialize HuggingFace API: {e}"))
            })?;
        Ok(Self {
            api,
            revision: None,
        })
    }

    /// Fetch `revision` instead of the revision pinned by each descriptor
    #[must_use]
    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }
}

#[async_trait]
impl RemoteRepository for HfHubRepository {
    async fn fetch(&self, descriptor: &ModelDescriptor, file: &str) -> Result<PathBuf> {
        let repo = self.api.repo(Repo::with_revision(
            descriptor.hf_repo.to_string(),
            descriptor.repo_kind.into(),
            self.revision
                .clone()
                .unwrap_or_else(|| descriptor.hf_revision.to_string()),
        ));

        repo.get(file)
            .await
            .map_err(|e| BgError::download(descriptor.id, format!("Failed to fetch {file}: {e}")))
    }
}

/// Event emitted by a running download
#[derive(Debug)]
pub enum DownloadEvent {
    /// Human-readable status line
    Progress(String),
    /// Terminal outcome; always the last event
    Finished(Result<()>),
}

/// Handle to an in-flight download
#[derive(Debug)]
pub struct DownloadTask {
    pub model: ModelId,
    pub target_dir: PathBuf,
    events: mpsc::Receiver<DownloadEvent>,
}

impl DownloadTask {
    /// Wait for the next event; `None` once the terminal event was consumed
    pub async fn next_event(&mut self) -> Option<DownloadEvent> {
        self.events.recv().await
    }

    /// Take an already queued event without waiting
    pub fn try_next_event(&mut self) -> Option<DownloadEvent> {
        self.events.try_recv().ok()
    }

    /// Drive the task to completion, handing each status line to `on_progress`
    pub async fn wait(mut self, mut on_progress: impl FnMut(&str)) -> Result<()> {
        while let Some(event) = self.events.recv().await {
            match event {
                DownloadEvent::Progress(line) => on_progress(&line),
                DownloadEvent::Finished(result) => return result,
            }
        }
        Err(BgError::download(
            self.model,
            "download worker stopped without reporting a result",
        ))
    }
}

/// Verifies local model directories and fetches missing artifacts
pub struct DownloadManager {
    models_dir: PathBuf,
    remote: Arc<dyn RemoteRepository>,
    in_flight: Arc<Mutex<HashSet<ModelId>>>,
    check_disk_space: bool,
}

impl DownloadManager {
    /// Create a manager rooted at `models_dir`
    pub fn new(models_dir: impl Into<PathBuf>, remote: Arc<dyn RemoteRepository>) -> Self {
        Self {
            models_dir: models_dir.into(),
            remote,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            check_disk_space: true,
        }
    }

    /// Enable or disable the free-space check before fetching
    #[must_use]
    pub fn with_disk_check(mut self, enabled: bool) -> Self {
        self.check_disk_space = enabled;
        self
    }

    #[must_use]
    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Shared cache the remote repository resumes transfers from
    #[must_use]
    pub fn cache_dir(&self) -> PathBuf {
        cache_dir(&self.models_dir)
    }

    /// Get path where model files are stored
    #[must_use]
    pub fn model_path(&self, id: ModelId) -> PathBuf {
        self.models_dir.join(id.as_str())
    }

    /// Check that every manifest file of `name` exists locally
    pub fn verify(&self, name: &str) -> Result<bool> {
        let descriptor = registry::lookup(name)?;
        Ok(missing_files(descriptor, &self.model_path(descriptor.id)).is_empty())
    }

    /// Manifest files of `id` that are not present locally
    #[must_use]
    pub fn missing(&self, id: ModelId) -> Vec<&'static str> {
        missing_files(id.descriptor(), &self.model_path(id))
    }

    /// Whether a download of `id` is currently running
    #[must_use]
    pub fn is_downloading(&self, id: ModelId) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&id)
    }

    /// Start fetching every missing artifact of `name` on a background task
    ///
    /// Must be called from within a Tokio runtime. Progress and the terminal
    /// result are delivered through the returned task. Only one download per
    /// model may run at a time; a second request is rejected.
    pub fn download(&self, name: &str, cancel: Option<CancellationToken>) -> Result<DownloadTask> {
        let descriptor = registry::lookup(name)?;
        let guard = InFlightGuard::acquire(&self.in_flight, descriptor.id)?;

        let target_dir = self.model_path(descriptor.id);
        let (tx, rx) = mpsc::channel(64);
        let job = DownloadJob {
            descriptor,
            models_dir: self.models_dir.clone(),
            target_dir: target_dir.clone(),
            remote: Arc::clone(&self.remote),
            check_disk_space: self.check_disk_space,
            cancel: cancel.unwrap_or_default(),
            events: tx,
        };

        tokio::spawn(async move {
            let result = job.run().await;
            if let Err(e) = &result {
                tracing::error!("Download of {} failed: {e}", job.descriptor.id);
            }
            // Free the slot before the caller can observe the outcome
            drop(guard);
            job.events.send(DownloadEvent::Finished(result)).await.ok();
        });

        Ok(DownloadTask {
            model: descriptor.id,
            target_dir,
            events: rx,
        })
    }
}

/// Removes its model from the in-flight set when dropped
struct InFlightGuard {
    set: Arc<Mutex<HashSet<ModelId>>>,
    id: ModelId,
}

impl InFlightGuard {
    fn acquire(set: &Arc<Mutex<HashSet<ModelId>>>, id: ModelId) -> Result<Self> {
        let inserted = set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
        if !inserted {
            return Err(BgError::DownloadInProgress(id.to_string()));
        }
        Ok(Self {
            set: Arc::clone(set),
            id,
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

struct DownloadJob {
    descriptor: &'static ModelDescriptor,
    models_dir: PathBuf,
    target_dir: PathBuf,
    remote: Arc<dyn RemoteRepository>,
    check_disk_space: bool,
    cancel: CancellationToken,
    events: mpsc::Sender<DownloadEvent>,
}

impl DownloadJob {
    async fn progress(&self, line: String) {
        tracing::info!("{line}");
        self.events.send(DownloadEvent::Progress(line)).await.ok();
    }

    async fn run(&self) -> Result<()> {
        let id = self.descriptor.id;

        tokio::fs::create_dir_all(&self.target_dir)
            .await
            .map_err(|e| {
                BgError::download(
                    id,
                    format!("Failed to create {}: {e}", self.target_dir.display()),
                )
            })?;

        let missing = missing_files(self.descriptor, &self.target_dir);
        if missing.is_empty() {
            self.progress(format!("All files for {id} are already present"))
                .await;
            return Ok(());
        }

        if self.check_disk_space {
            check_disk_space(&self.models_dir, self.descriptor.size_mb)
                .map_err(|reason| BgError::download(id, reason))?;
        }

        self.progress(format!(
            "Downloading {} from {} ({} of {} files missing)",
            self.descriptor.display_name,
            self.descriptor.hf_repo,
            missing.len(),
            self.descriptor.files.len()
        ))
        .await;

        let total = missing.len();
        for (i, file) in missing.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(BgError::Cancelled(format!("download of {id}")));
            }

            self.progress(format!("Fetching {file} ({}/{total})", i + 1))
                .await;

            let cached = tokio::select! {
                () = self.cancel.cancelled() => {
                    return Err(BgError::Cancelled(format!("download of {id}")));
                }
                fetched = self.remote.fetch(self.descriptor, file) => fetched?,
            };

            let size = place_file(&cached, &self.target_dir.join(file))
                .await
                .map_err(|e| BgError::download(id, format!("Failed to store {file}: {e}")))?;

            self.progress(format!("Fetched {file} ({})", format_bytes(size)))
                .await;
        }

        let still_missing = missing_files(self.descriptor, &self.target_dir);
        if !still_missing.is_empty() {
            return Err(BgError::VerificationFailure {
                model: id.to_string(),
                missing: still_missing.iter().map(ToString::to_string).collect(),
            });
        }

        self.progress(format!("Downloaded {} model", self.descriptor.display_name))
            .await;
        Ok(())
    }
}

/// Manifest files of `descriptor` missing under `dir`
pub(crate) fn missing_files(descriptor: &ModelDescriptor, dir: &Path) -> Vec<&'static str> {
    if !dir.is_dir() {
        return descriptor.files.to_vec();
    }

    descriptor
        .files
        .iter()
        .copied()
        .filter(|file| !dir.join(file).is_file())
        .collect()
}

/// Shared fetch cache below a models directory
#[must_use]
pub fn cache_dir(models_dir: &Path) -> PathBuf {
    models_dir.join(".cache")
}

/// Move a cached artifact into the model directory
///
/// Hard links the cache blob when possible and falls back to a copy. The file
/// only appears under its final name once complete, so a crash mid-copy never
/// leaves an artifact that passes verification.
async fn place_file(cached: &Path, dest: &Path) -> std::io::Result<u64> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let blob = tokio::fs::canonicalize(cached).await?;
    let mut partial = dest.as_os_str().to_owned();
    partial.push(".incomplete");
    let partial = PathBuf::from(partial);

    if tokio::fs::metadata(&partial).await.is_ok() {
        tokio::fs::remove_file(&partial).await?;
    }

    if tokio::fs::hard_link(&blob, &partial).await.is_err() {
        tokio::fs::copy(&blob, &partial).await?;
    }
    tokio::fs::rename(&partial, dest).await?;

    Ok(tokio::fs::metadata(dest).await?.len())
}

/// Check if enough disk space is available
fn check_disk_space(dir: &Path, required_mb: u64) -> std::result::Result<(), String> {
    let stats = nix::sys::statvfs::statvfs(dir)
        .map_err(|e| format!("Failed to check disk space: {e}"))?;

    #[allow(clippy::useless_conversion)]
    let available_bytes = u64::from(stats.blocks_available()) * u64::from(stats.fragment_size());
    let required_bytes = required_mb * 1_024 * 1_024;

    // 100MB headroom on top of the model size
    let required_with_buffer = required_bytes + (100 * 1_024 * 1_024);

    if available_bytes < required_with_buffer {
        return Err(format!(
            "Not enough disk space: {} required, {} available",
            format_bytes(required_with_buffer),
            format_bytes(available_bytes)
        ));
    }

    Ok(())
}

/// Format bytes as human-readable string
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}
