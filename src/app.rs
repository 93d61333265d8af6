use crate::batch::BatchWorker;
use crate::config::Config;
use crate::controller::{Confirm, RemoveBgController};
use crate::error::Result;
use crate::inference::{InferenceEngine, NetworkLoader, RuntimeLoader};
use crate::logging::LogSink;
use crate::models::registry::{self, ModelDescriptor};
use crate::models::{DownloadManager, HfHubRepository, ModelState, RemoteRepository};
use crate::output::TempOutput;
use std::sync::Arc;

/// Process-wide services, built once from config and shared by handle
pub struct App {
    pub config: Config,
    pub downloads: Arc<DownloadManager>,
    pub engine: Arc<InferenceEngine>,
    pub worker: BatchWorker,
    pub output: Arc<TempOutput>,
}

impl App {
    /// Wire the services against the Hugging Face Hub and the bundled runtimes
    pub fn from_config(config: Config) -> Result<Self> {
        let cache_dir = crate::models::download::cache_dir(&config.models.dir);
        let remote = HfHubRepository::new(cache_dir)?.with_revision(config.download.revision.clone());
        let loader = RuntimeLoader::new(config.processing.intra_threads);
        Self::with_parts(config, Arc::new(remote), Box::new(loader))
    }

    /// Wire the services with a custom remote and network loader
    pub fn with_parts(
        config: Config,
        remote: Arc<dyn RemoteRepository>,
        loader: Box<dyn NetworkLoader>,
    ) -> Result<Self> {
        let downloads = DownloadManager::new(config.models.dir.clone(), remote)
            .with_disk_check(config.download.check_disk_space);
        let engine = InferenceEngine::new(config.models.dir.clone(), config.models.device, loader);

        Ok(Self {
            downloads: Arc::new(downloads),
            engine: Arc::new(engine),
            worker: BatchWorker::new(),
            output: Arc::new(TempOutput::new()?),
            config,
        })
    }

    /// Controller sharing this app's services, with the configured default model selected
    pub fn controller(&self, log: Arc<dyn LogSink>, confirm: Arc<dyn Confirm>) -> RemoveBgController {
        let controller = RemoveBgController::new(
            Arc::clone(&self.downloads),
            Arc::clone(&self.engine),
            self.worker.clone(),
            Arc::clone(&self.output),
            log,
            confirm,
        );
        controller.selection().set(self.config.models.default);
        controller
    }

    /// Every registered model with its current state
    pub fn model_states(&self) -> Result<Vec<(&'static ModelDescriptor, ModelState)>> {
        registry::all()
            .iter()
            .map(|descriptor| {
                ModelState::resolve(descriptor.id.as_str(), &self.downloads, &self.engine)
                    .map(|state| (*descriptor, state))
            })
            .collect()
    }
}
