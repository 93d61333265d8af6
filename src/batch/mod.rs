//! Sequential batch processing off the async runtime
//!
//! A run walks its paths in order on one blocking thread and streams an
//! [`BatchEvent::Item`] per path followed by exactly one [`BatchEvent::Done`].
//! A failing item is reported and the run moves on to the next one.

use crate::error::{BgError, Result};
use image::RgbaImage;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Outcome for one input path
#[derive(Debug)]
pub struct BatchItem {
    /// Position of the path in the submitted list
    pub index: usize,
    pub path: PathBuf,
    pub result: Result<RgbaImage>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// The run stopped early; `succeeded + failed < total` unless the token
    /// fired after the last item
    pub cancelled: bool,
}

#[derive(Debug)]
pub enum BatchEvent {
    Item(BatchItem),
    Done(BatchSummary),
}

/// Handle to a running batch
#[derive(Debug)]
pub struct BatchRun {
    events: mpsc::Receiver<BatchEvent>,
}

impl BatchRun {
    /// Next event, or `None` once the run has finished and all events were read
    pub async fn next_event(&mut self) -> Option<BatchEvent> {
        self.events.recv().await
    }

    pub fn try_next_event(&mut self) -> Option<BatchEvent> {
        self.events.try_recv().ok()
    }

    /// Drain the run, returning items in submission order and the summary
    pub async fn collect(mut self) -> Result<(Vec<BatchItem>, BatchSummary)> {
        let mut items = Vec::new();
        while let Some(event) = self.next_event().await {
            match event {
                BatchEvent::Item(item) => items.push(item),
                BatchEvent::Done(summary) => return Ok((items, summary)),
            }
        }
        Err(BgError::Other(
            "Batch worker stopped without reporting completion".to_string(),
        ))
    }
}

/// Runs at most one batch at a time across all its clones
#[derive(Debug, Clone, Default)]
pub struct BatchWorker {
    running: Arc<AtomicBool>,
}

/// Clears the running flag however the worker thread exits
#[derive(Debug)]
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl BatchWorker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Claim the process-wide batch slot without starting a run yet
    ///
    /// Callers that must prepare shared state before a run (loading a model)
    /// claim the slot first so no other run starts in between. Dropping the
    /// slot unused releases it.
    pub fn try_acquire(&self) -> Result<RunSlot> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(BgError::BatchAlreadyRunning);
        }
        Ok(RunSlot {
            guard: RunningGuard(Arc::clone(&self.running)),
        })
    }

    /// Start processing `paths` with `infer`
    ///
    /// Shorthand for [`try_acquire`](Self::try_acquire) followed by
    /// [`RunSlot::start`].
    pub fn run<F>(
        &self,
        paths: Vec<PathBuf>,
        infer: F,
        cancel: Option<CancellationToken>,
    ) -> Result<BatchRun>
    where
        F: FnMut(&Path) -> Result<RgbaImage> + Send + 'static,
    {
        Ok(self.try_acquire()?.start(paths, infer, cancel))
    }
}

/// Exclusive right to run one batch
#[derive(Debug)]
pub struct RunSlot {
    guard: RunningGuard,
}

impl RunSlot {
    /// Process `paths` with `infer`, consuming the slot
    ///
    /// Must be called from within a tokio runtime. The cancel token is
    /// checked before each item; an item already started runs to completion.
    /// The slot is released once the last item has been processed.
    pub fn start<F>(
        self,
        paths: Vec<PathBuf>,
        mut infer: F,
        cancel: Option<CancellationToken>,
    ) -> BatchRun
    where
        F: FnMut(&Path) -> Result<RgbaImage> + Send + 'static,
    {
        let guard = self.guard;
        let (tx, rx) = mpsc::channel(16);
        let cancel = cancel.unwrap_or_default();

        tokio::task::spawn_blocking(move || {
            let mut summary = BatchSummary {
                total: paths.len(),
                ..BatchSummary::default()
            };
            tracing::info!("Batch started with {} image(s)", summary.total);

            for (index, path) in paths.into_iter().enumerate() {
                if cancel.is_cancelled() {
                    tracing::info!("Batch cancelled before item {}", index + 1);
                    summary.cancelled = true;
                    break;
                }

                let result = infer(&path);
                match &result {
                    Ok(_) => summary.succeeded += 1,
                    Err(e) => {
                        tracing::error!("{e}");
                        summary.failed += 1;
                    }
                }

                let item = BatchItem {
                    index,
                    path,
                    result,
                };
                if tx.blocking_send(BatchEvent::Item(item)).is_err() {
                    tracing::debug!("Batch receiver dropped, stopping");
                    return;
                }
            }

            // Free the slot before Done so a consumer can start the next run immediately
            drop(guard);
            tracing::info!(
                "Batch finished: {} ok, {} failed{}",
                summary.succeeded,
                summary.failed,
                if summary.cancelled { ", cancelled" } else { "" }
            );
            tx.blocking_send(BatchEvent::Done(summary)).ok();
        });

        BatchRun { events: rx }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pixel(_: &Path) -> Result<RgbaImage> {
        Ok(RgbaImage::new(1, 1))
    }

    #[tokio::test]
    async fn test_empty_batch_reports_done() {
        let run = BatchWorker::new().run(Vec::new(), pixel, None).unwrap();
        let (items, summary) = run.collect().await.unwrap();
        assert!(items.is_empty());
        assert_eq!(summary, BatchSummary::default());
    }

    #[tokio::test]
    async fn test_worker_released_after_run() {
        let worker = BatchWorker::new();
        let run = worker
            .run(vec![PathBuf::from("a.png")], pixel, None)
            .unwrap();
        run.collect().await.unwrap();
        assert!(!worker.is_running());
        assert!(worker.run(Vec::new(), pixel, None).is_ok());
    }

    #[tokio::test]
    async fn test_slot_blocks_runs_until_dropped() {
        let worker = BatchWorker::new();
        let slot = worker.try_acquire().unwrap();
        assert!(worker.is_running());
        assert!(matches!(
            worker.run(Vec::new(), pixel, None),
            Err(BgError::BatchAlreadyRunning)
        ));
        assert!(matches!(
            worker.clone().try_acquire(),
            Err(BgError::BatchAlreadyRunning)
        ));

        drop(slot);
        assert!(!worker.is_running());

        let slot = worker.try_acquire().unwrap();
        let (items, _) = slot
            .start(vec![PathBuf::from("a.png")], pixel, None)
            .collect()
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
        assert!(!worker.is_running());
    }
}
