//! The remove-backgrounds flow: ensure the model, load it, run the batch,
//! collect results
//!
//! Everything here runs on the async presentation task. Downloads, model
//! loading and inference are handed to background tasks and awaited, so the
//! caller is never blocked on them.

use crate::batch::{BatchEvent, BatchItem, BatchSummary, BatchWorker};
use crate::collection::ImageCollection;
use crate::error::{BgError, Result};
use crate::inference::InferenceEngine;
use crate::logging::LogSink;
use crate::models::registry::{self, ModelDescriptor, ModelId};
use crate::models::DownloadManager;
use crate::output::{self, TempOutput};
use async_trait::async_trait;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Asks the user a yes/no question
#[async_trait]
pub trait Confirm: Send + Sync {
    async fn confirm(&self, prompt: &str) -> bool;
}

/// Answers every question the same way
#[derive(Debug, Clone, Copy)]
pub struct AutoConfirm(pub bool);

#[async_trait]
impl Confirm for AutoConfirm {
    async fn confirm(&self, prompt: &str) -> bool {
        tracing::debug!("{prompt} -> {}", if self.0 { "yes" } else { "no" });
        self.0
    }
}

/// Asks on the terminal
///
/// Only an explicit answer other than "n"/"no" counts as yes. End of input
/// and read errors count as no, so a closed stdin never starts a download.
#[derive(Debug, Clone, Copy)]
pub struct StdinConfirm;

#[async_trait]
impl Confirm for StdinConfirm {
    async fn confirm(&self, prompt: &str) -> bool {
        let prompt = prompt.to_string();
        tokio::task::spawn_blocking(move || {
            print!("{prompt} [Y/n] ");
            std::io::stdout().flush().ok();
            read_answer(&mut std::io::stdin().lock())
        })
        .await
        .unwrap_or(false)
    }
}

/// Read one yes/no answer line; an empty line means yes
pub fn read_answer(input: &mut impl BufRead) -> bool {
    let mut answer = String::new();
    match input.read_line(&mut answer) {
        Ok(0) | Err(_) => false,
        Ok(_) => !matches!(answer.trim().to_ascii_lowercase().as_str(), "n" | "no"),
    }
}

/// Currently selected model with change notification
#[derive(Debug)]
pub struct ModelSelection {
    current: watch::Sender<ModelId>,
}

impl Default for ModelSelection {
    fn default() -> Self {
        Self::new(ModelId::Rmbg14)
    }
}

impl ModelSelection {
    #[must_use]
    pub fn new(initial: ModelId) -> Self {
        let (current, _) = watch::channel(initial);
        Self { current }
    }

    #[must_use]
    pub fn get(&self) -> ModelId {
        *self.current.borrow()
    }

    /// Select `id`; subscribers are notified only if the selection changed
    pub fn set(&self, id: ModelId) {
        let changed = self.current.send_if_modified(|current| {
            if *current == id {
                false
            } else {
                *current = id;
                true
            }
        });
        if changed {
            tracing::info!("Model set to {id}");
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ModelId> {
        self.current.subscribe()
    }

    /// Models that can be selected, in presentation order
    #[must_use]
    pub fn available(&self) -> &'static [&'static ModelDescriptor] {
        registry::all()
    }
}

/// How a remove-backgrounds request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The model was missing and the user declined to download it
    DownloadDeclined,
    /// The source collection was empty
    NoImages,
    Completed(BatchSummary),
}

/// Drives the remove-backgrounds flow
pub struct RemoveBgController {
    downloads: Arc<DownloadManager>,
    engine: Arc<InferenceEngine>,
    worker: BatchWorker,
    output: Arc<TempOutput>,
    log: Arc<dyn LogSink>,
    confirm: Arc<dyn Confirm>,
    selection: ModelSelection,
    sources: ImageCollection,
    results: ImageCollection,
}

impl RemoveBgController {
    pub fn new(
        downloads: Arc<DownloadManager>,
        engine: Arc<InferenceEngine>,
        worker: BatchWorker,
        output: Arc<TempOutput>,
        log: Arc<dyn LogSink>,
        confirm: Arc<dyn Confirm>,
    ) -> Self {
        Self {
            downloads,
            engine,
            worker,
            output,
            log,
            confirm,
            selection: ModelSelection::default(),
            sources: ImageCollection::new(),
            results: ImageCollection::new(),
        }
    }

    #[must_use]
    pub fn selection(&self) -> &ModelSelection {
        &self.selection
    }

    #[must_use]
    pub fn sources(&self) -> &ImageCollection {
        &self.sources
    }

    pub fn sources_mut(&mut self) -> &mut ImageCollection {
        &mut self.sources
    }

    /// Processed images from the last run, in the temporary output directory
    #[must_use]
    pub fn results(&self) -> &ImageCollection {
        &self.results
    }

    #[must_use]
    pub fn output_dir(&self) -> &Path {
        self.output.path()
    }

    /// Remove backgrounds from every source image with the selected model
    ///
    /// The process-wide batch slot is claimed before anything else, so a
    /// concurrent request fails with `BatchAlreadyRunning` without touching
    /// the loaded model. Results of the previous run are discarded next. A
    /// missing model is downloaded after the user confirms. Per-image failures are logged and
    /// counted in the summary; errors are returned only for failures that
    /// stop the whole run.
    pub async fn remove_backgrounds(
        &mut self,
        cancel: Option<CancellationToken>,
    ) -> Result<RunOutcome> {
        let model = self.selection.get();
        // Held from here on so no other run can swap the model before ours starts
        let slot = self.report(self.worker.try_acquire())?;

        self.results.clear();
        self.report(self.output.clear())?;

        if !self.downloads.verify(model.as_str())? {
            let descriptor = model.descriptor();
            let prompt = format!(
                "Do you want to download the {} (~{}MB)?",
                descriptor.display_name, descriptor.size_mb
            );
            if !self.confirm.confirm(&prompt).await {
                self.log.info(&format!("Download of model {model} declined."));
                return Ok(RunOutcome::DownloadDeclined);
            }
            self.download(model, cancel.clone()).await?;
        }

        if self.sources.is_empty() {
            self.log.info("No images to process.");
            return Ok(RunOutcome::NoImages);
        }

        if self.engine.loaded_model() != Some(model) {
            self.load(model).await?;
        }

        self.log.info("Starting background removal.");
        let paths = self.sources.list();
        let total = paths.len();
        let engine = Arc::clone(&self.engine);
        let mut run = slot.start(
            paths,
            move |path| engine.remove_background_with(model, path),
            cancel,
        );

        let mut summary = None;
        while let Some(event) = run.next_event().await {
            match event {
                BatchEvent::Item(item) => self.on_item(item, total),
                BatchEvent::Done(done) => summary = Some(done),
            }
        }
        let summary = summary.ok_or_else(|| {
            BgError::Other("Batch worker stopped without reporting completion".to_string())
        })?;

        if summary.cancelled {
            self.log.warn(&format!(
                "Background removal cancelled after {}/{total} image(s).",
                summary.succeeded + summary.failed
            ));
        } else {
            self.log.info("Background removal completed.");
        }
        Ok(RunOutcome::Completed(summary))
    }

    /// Copy the results of the last run to `dest`
    pub fn save_results(&self, dest: &Path) -> Result<Vec<PathBuf>> {
        self.report(output::save_results(
            &self.results.list(),
            dest,
            self.log.as_ref(),
        ))
    }

    async fn download(&self, model: ModelId, cancel: Option<CancellationToken>) -> Result<()> {
        self.log.info(&format!("Downloading model {model}."));
        let task = self.report(self.downloads.download(model.as_str(), cancel))?;
        let log = Arc::clone(&self.log);
        self.report(task.wait(|line| log.info(line)).await)
    }

    async fn load(&self, model: ModelId) -> Result<()> {
        self.log.info(&format!("Loading model {model}."));
        let engine = Arc::clone(&self.engine);
        let loaded = tokio::task::spawn_blocking(move || engine.load_model(model.as_str()))
            .await
            .map_err(|e| BgError::load(model, format!("loader task failed: {e}")))
            .and_then(|result| result);
        self.report(loaded)
    }

    fn on_item(&mut self, item: BatchItem, total: usize) {
        let saved = item
            .result
            .and_then(|image| self.output.save(&item.path, &image));
        match saved {
            Ok(path) => {
                self.results.add([path]);
                self.log
                    .info(&format!("Processed image {}/{total}", item.index + 1));
            }
            Err(e) => self.log.error(&e.to_string()),
        }
    }

    /// Log a failure on the sink before handing it back
    fn report<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.log.error(&e.to_string());
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selection_defaults_to_rmbg14() {
        assert_eq!(ModelSelection::default().get(), ModelId::Rmbg14);
    }

    #[test]
    fn test_selection_notifies_on_change_only() {
        let selection = ModelSelection::default();
        let mut rx = selection.subscribe();

        selection.set(ModelId::Rmbg14);
        assert!(!rx.has_changed().unwrap());

        selection.set(ModelId::Rmbg20);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), ModelId::Rmbg20);
        assert_eq!(selection.get(), ModelId::Rmbg20);
    }

    #[test]
    fn test_available_models() {
        let ids: Vec<_> = ModelSelection::default()
            .available()
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec![ModelId::Rmbg14, ModelId::Rmbg20]);
    }

    #[test]
    fn test_read_answer() {
        use std::io::Cursor;

        assert!(read_answer(&mut Cursor::new("\n")));
        assert!(read_answer(&mut Cursor::new("y\n")));
        assert!(read_answer(&mut Cursor::new("Yes\n")));
        assert!(!read_answer(&mut Cursor::new("n\n")));
        assert!(!read_answer(&mut Cursor::new(" NO \n")));
        // Closed or non-interactive stdin
        assert!(!read_answer(&mut Cursor::new("")));
    }

    #[tokio::test]
    async fn test_auto_confirm() {
        assert!(AutoConfirm(true).confirm("ok?").await);
        assert!(!AutoConfirm(false).confirm("ok?").await);
    }
}
