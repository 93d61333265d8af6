#![allow(clippy::multiple_crate_versions)]

use bgstrip::app::App;
use bgstrip::config::Config;
use bgstrip::controller::{AutoConfirm, Confirm, RunOutcome, StdinConfirm};
use bgstrip::error::{BgError, Result};
use bgstrip::logging::TracingLogSink;
use bgstrip::models::registry::MODELS;
use bgstrip::models::{DownloadEvent, ModelId, ModelState};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bgstrip")]
#[command(about = "Remove image backgrounds with local RMBG models", long_about = None)]
struct Cli {
    /// Config file (default: ~/.config/bgstrip/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Remove the background of each image
    Remove {
        /// Images to process (.png, .jpg, .jpeg)
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Model to use instead of the configured default
        #[arg(short, long)]
        model: Option<ModelId>,
        /// Download a missing model without asking
        #[arg(short, long)]
        yes: bool,
        /// Copy results here (a file for one image, a folder for several)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Download a model
    Download {
        model: ModelId,
    },
    /// Show which models are downloaded
    Status,
    /// List supported models
    Models,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("bgstrip={}", config.logging.level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Remove {
            paths,
            model,
            yes,
            out,
        } => run_remove(config, paths, model, yes, out).await,
        Commands::Download { model } => run_download(config, model).await,
        Commands::Status => run_status(config),
        Commands::Models => {
            run_models();
            Ok(())
        }
    }
}

async fn run_remove(
    config: Config,
    paths: Vec<PathBuf>,
    model: Option<ModelId>,
    yes: bool,
    out: Option<PathBuf>,
) -> Result<()> {
    let app = App::from_config(config)?;
    let confirm: Arc<dyn Confirm> = if yes {
        Arc::new(AutoConfirm(true))
    } else {
        Arc::new(StdinConfirm)
    };
    let mut controller = app.controller(Arc::new(TracingLogSink), confirm);

    if let Some(model) = model {
        controller.selection().set(model);
    }
    controller.sources_mut().add(paths);

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, stopping after the current image");
            on_ctrl_c.cancel();
        }
    });

    match controller.remove_backgrounds(Some(cancel)).await? {
        RunOutcome::DownloadDeclined => {
            println!("Model not downloaded, nothing to do.");
            return Ok(());
        }
        RunOutcome::NoImages => return Ok(()),
        RunOutcome::Completed(summary) => {
            println!(
                "✓ {}/{} image(s) processed, {} failed",
                summary.succeeded, summary.total, summary.failed
            );
        }
    }

    // Without --out, copy next to the caller; the temporary directory is removed on exit
    let dest = match out {
        Some(dest) => dest,
        None => std::env::current_dir()?,
    };
    for path in controller.save_results(&dest)? {
        println!("  {}", path.display());
    }

    Ok(())
}

async fn run_download(config: Config, model: ModelId) -> Result<()> {
    let app = App::from_config(config)?;
    let mut task = app.downloads.download(model.as_str(), None)?;

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .map_err(|e| BgError::Other(format!("Invalid progress template: {e}")))?,
    );
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner.set_message(format!("Downloading {}", model.descriptor().display_name));

    while let Some(event) = task.next_event().await {
        match event {
            DownloadEvent::Progress(line) => spinner.set_message(line),
            DownloadEvent::Finished(Ok(())) => {
                spinner.finish_with_message(format!(
                    "✓ {} ready in {}",
                    model.descriptor().display_name,
                    task.target_dir.display()
                ));
                return Ok(());
            }
            DownloadEvent::Finished(Err(e)) => {
                spinner.abandon_with_message("Download failed");
                return Err(e);
            }
        }
    }

    spinner.abandon();
    Err(BgError::DownloadFailure {
        model: model.to_string(),
        reason: "download worker stopped unexpectedly".to_string(),
    })
}

fn run_status(config: Config) -> Result<()> {
    let app = App::from_config(config)?;
    println!("Models directory: {}", app.downloads.models_dir().display());
    for (descriptor, state) in app.model_states()? {
        println!(
            "  {:<8} {:<10} {state}",
            descriptor.id.as_str(),
            descriptor.display_name
        );
        if state != ModelState::NotPresent {
            continue;
        }
        let missing = app.downloads.missing(descriptor.id);
        if missing.len() < descriptor.files.len() {
            println!("           missing: {}", missing.join(", "));
        }
    }
    Ok(())
}

fn run_models() {
    println!("Available models:\n");
    for descriptor in MODELS {
        println!(
            "  {:<8} {:<10} ~{} MB  ({})",
            descriptor.id.as_str(),
            descriptor.display_name,
            descriptor.size_mb,
            descriptor.hf_repo
        );
    }
    println!("\nDownload with: bgstrip download <model>");
}
