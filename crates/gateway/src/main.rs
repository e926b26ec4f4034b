//! `sds-gateway` -- run one generation against a ComfyUI instance.
//!
//! Progress lines are printed as they arrive; on success the artifact is
//! written to the current directory. Configuration comes from the
//! environment (see `GatewayConfig::from_env`).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use sds_comfyui::backend::ComfyUIBackend;
use sds_comfyui::workflow::{WorkflowError, WorkflowTemplate};
use sds_gateway::config::GatewayConfig;
use sds_gateway::error::GenerationError;
use sds_gateway::prompt::{PromptWriter, TemplatePrompter};
use sds_gateway::recipe::{HdriRecipe, JobRecipe, ObjRecipe};
use sds_gateway::registry::TaskRegistry;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Parser)]
#[command(name = "sds-gateway")]
#[command(about = "Run one generation against a ComfyUI instance", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Turn a sketch image into a 3D object
    Obj {
        /// Sketch image (png, jpeg or webp)
        image: PathBuf,
        /// Short description of the subject
        hint: Option<String>,
    },
    /// Generate an HDRI environment map from a scene description
    Hdri {
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },
}

/// Failures while turning command-line input into a recipe.
#[derive(Debug, thiserror::Error)]
enum SetupError {
    #[error("Failed to read image {path}: {source}")]
    ReadImage {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to prepare prompt: {0}")]
    Prompt(#[from] GenerationError),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sds_gateway=debug,sds_comfyui=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = GatewayConfig::from_env().unwrap_or_else(|e| {
        tracing::error!(error = %e, "Invalid configuration");
        std::process::exit(1);
    });
    tracing::info!(api_url = %config.api_url, ws_url = %config.ws_url, "Loaded gateway configuration");

    let recipe = build_recipe(&config, cli.command).await.unwrap_or_else(|e| {
        tracing::error!(error = %e, "Failed to prepare generation");
        std::process::exit(1);
    });

    // --- Registry ---
    let backend = Arc::new(ComfyUIBackend::new(config.api_url.clone(), config.ws_url.clone()));
    let registry = Arc::new(TaskRegistry::new(backend, config.task.clone()));
    let shutdown = CancellationToken::new();
    let evictor = registry.spawn_evictor(config.eviction.clone(), shutdown.clone());

    let client_id = uuid::Uuid::new_v4().simple().to_string();
    let task_id = registry
        .create_task(&client_id, recipe)
        .await
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to start task");
            std::process::exit(1);
        });

    let succeeded = follow(&registry, &client_id, &task_id).await;

    shutdown.cancel();
    if let Err(e) = evictor.await {
        tracing::warn!(error = %e, "Evictor task ended abnormally");
    }

    if !succeeded {
        std::process::exit(1);
    }
}

fn image_format(path: &Path) -> (String, &'static str) {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("png")
        .to_ascii_lowercase();
    let mime = match extension.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        _ => "image/png",
    };
    (extension, mime)
}

async fn build_recipe(
    config: &GatewayConfig,
    command: Command,
) -> Result<Box<dyn JobRecipe>, SetupError> {
    let prompter = TemplatePrompter::default();

    match command {
        Command::Obj { image, hint } => {
            let bytes = tokio::fs::read(&image)
                .await
                .map_err(|source| SetupError::ReadImage {
                    path: image.clone(),
                    source,
                })?;
            let (extension, mime) = image_format(&image);

            let description = prompter.describe(&bytes, hint.as_deref()).await?;
            tracing::info!(description = %description, "Object prompt");

            let template = WorkflowTemplate::load(&config.obj_workflow_path())?;
            Ok(Box::new(ObjRecipe::new(
                Arc::new(template),
                bytes,
                extension,
                mime,
                description,
            )))
        }
        Command::Hdri { text } => {
            let (t5, clip) = prompter.expand(&text.join(" ")).await?;
            let template = WorkflowTemplate::load(&config.hdri_workflow_path())?;
            Ok(Box::new(HdriRecipe::new(Arc::new(template), t5, clip)))
        }
    }
}

/// Print new event lines until the task finishes; save the artifact.
/// Ctrl-C stops tracking locally.
async fn follow(registry: &TaskRegistry, client_id: &str, task_id: &str) -> bool {
    let mut seen = 0;
    let mut interval = tokio::time::interval(POLL_INTERVAL);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!(task_id, "Interrupted, cancelling task");
                if let Err(e) = registry.cancel_task(client_id, task_id).await {
                    tracing::error!(error = %e, "Failed to cancel task");
                }
            }
            _ = interval.tick() => {}
        }

        let (slice, status) = match (
            registry.get_events(client_id, task_id, seen).await,
            registry.get_status(client_id, task_id).await,
        ) {
            (Ok(slice), Ok(status)) => (slice, status),
            (Err(e), _) | (_, Err(e)) => {
                tracing::error!(error = %e, "Lost track of task");
                return false;
            }
        };

        for line in &slice.events {
            println!("{line}");
        }
        seen = slice.total;

        if status.is_terminal() {
            // Lines appended between the two reads above.
            if let Ok(rest) = registry.get_events(client_id, task_id, seen).await {
                for line in &rest.events {
                    println!("{line}");
                }
            }
            break;
        }
    }

    match registry.get_result(client_id, task_id).await {
        Ok(Some(artifact)) => {
            let name = Path::new(&artifact.filename)
                .file_name()
                .unwrap_or_else(|| "artifact".as_ref());
            match tokio::fs::write(name, &artifact.bytes).await {
                Ok(()) => {
                    tracing::info!(file = ?name, size = artifact.bytes.len(), "Artifact saved");
                    true
                }
                Err(e) => {
                    tracing::error!(file = ?name, error = %e, "Failed to save artifact");
                    false
                }
            }
        }
        Ok(None) => false,
        Err(e) => {
            tracing::error!(error = %e, "Failed to read result");
            false
        }
    }
}
