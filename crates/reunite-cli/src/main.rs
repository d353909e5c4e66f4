mod config;
mod store;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use config::Config;
use reunite_core::{
    ArcFaceExtractor, GalleryMatcher, GallerySource, IdentificationService, IdentifyError, Outcome,
    ScrfdLocator,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use store::{JsonGalleryStore, MissingPersonRecord};
use tokio::sync::Semaphore;

type Service = IdentificationService<ScrfdLocator, ArcFaceExtractor>;

#[derive(Parser)]
#[command(name = "reunite", about = "Match found persons against registered missing persons")]
struct Cli {
    /// TOML configuration file (defaults to $REUNITE_CONFIG if set)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Identify the person in a found-person photo
    Identify {
        /// Photo to search with
        image: PathBuf,
        /// Override the acceptance threshold for this run
        #[arg(long)]
        threshold: Option<f32>,
    },
    /// Identify several photos, one JSON line per photo
    Batch {
        /// Photos to search with
        #[arg(required = true)]
        images: Vec<PathBuf>,
        #[arg(long)]
        threshold: Option<f32>,
    },
    /// Register a missing person from a photo
    Enroll {
        /// Name of the missing person
        #[arg(short, long)]
        name: String,
        image: PathBuf,
    },
    /// List registered missing persons
    List,
    /// Remove a registered missing person
    Remove {
        /// Record ID to remove
        id: String,
    },
    /// Check models and gallery
    Check,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    let store = Arc::new(JsonGalleryStore::new(&config.gallery_path));

    match cli.command {
        Commands::Identify { image, threshold } => {
            let service = Arc::new(build_service(&config, threshold)?);
            preflight(&service, &store)?;

            let bytes = read_image(&image)?;
            let result = {
                let service = Arc::clone(&service);
                let store = Arc::clone(&store);
                tokio::task::spawn_blocking(move || service.identify(&bytes, &*store))
                    .await
                    .context("identification task panicked")?
            };

            let code = exit_code(&result);
            println!("{}", report(&result));
            Ok(code)
        }
        Commands::Batch { images, threshold } => {
            let service = Arc::new(build_service(&config, threshold)?);
            preflight(&service, &store)?;
            batch(service, store, images, config.max_concurrency).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Enroll { name, image } => {
            let service = Arc::new(build_service(&config, None)?);
            preflight(&service, &store)?;

            let bytes = read_image(&image)?;
            let enrollment = {
                let service = Arc::clone(&service);
                tokio::task::spawn_blocking(move || service.enroll(&bytes))
                    .await
                    .context("enrollment task panicked")??
            };
            let Some(enrollment) = enrollment else {
                bail!("no face detected in {}", image.display());
            };
            if enrollment.faces_detected > 1 {
                tracing::warn!(
                    faces = enrollment.faces_detected,
                    "photo contains several faces, enrolling the first"
                );
            }

            let record = MissingPersonRecord::new(name, enrollment.embedding);
            let summary = json!({
                "id": record.id,
                "name": record.name,
                "created_at": record.created_at,
                "faces_detected": enrollment.faces_detected,
                "face": enrollment.face,
            });
            store.insert(record)?;
            println!("{summary}");
            Ok(ExitCode::SUCCESS)
        }
        Commands::List => {
            let records = store.records()?;
            if records.is_empty() {
                tracing::info!(path = %store.path().display(), "no missing persons registered");
            }
            for r in records {
                println!(
                    "{}",
                    json!({
                        "id": r.id,
                        "name": r.name,
                        "created_at": r.created_at,
                        "dimension": r.embedding.dimension(),
                    })
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Remove { id } => {
            if !store.remove(&id)? {
                bail!("no missing person with id {id}");
            }
            println!("{}", json!({ "removed": id }));
            Ok(ExitCode::SUCCESS)
        }
        Commands::Check => {
            let status = check(&config, &store);
            let healthy = status["healthy"].as_bool().unwrap_or(false);
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(if healthy { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
    }
}

/// Load both models and wire them into an identification service.
fn build_service(config: &Config, threshold: Option<f32>) -> Result<Service> {
    let matcher = GalleryMatcher::new(config.matcher_config(threshold)?);

    let locator = ScrfdLocator::load(&config.scrfd_model_path(), config.intra_threads)
        .context("loading face detection model")?;
    let extractor = ArcFaceExtractor::load(&config.arcface_model_path(), config.intra_threads)
        .context("loading face recognition model")?;

    let service = IdentificationService::new(locator, extractor, matcher);
    if service.embedding_dimension() != config.embedding_dim {
        bail!(
            "recognition model produces {}-dim embeddings but embedding_dim is {}",
            service.embedding_dimension(),
            config.embedding_dim
        );
    }

    let matcher = service.matcher().config();
    tracing::info!(
        metric = %matcher.metric,
        threshold = matcher.threshold,
        dimension = service.embedding_dimension(),
        "identification service ready"
    );
    Ok(service)
}

/// Refuse to start if the stored gallery cannot be compared with our embeddings.
fn preflight(service: &Service, store: &JsonGalleryStore) -> Result<()> {
    let entries = store.fetch()?;
    service.check_gallery(&entries).with_context(|| {
        format!("gallery {} is incompatible with the recognition model", store.path().display())
    })?;
    tracing::debug!(entries = entries.len(), "gallery dimension check passed");
    Ok(())
}

async fn batch(
    service: Arc<Service>,
    store: Arc<JsonGalleryStore>,
    images: Vec<PathBuf>,
    max_concurrency: usize,
) -> Result<()> {
    let semaphore = Arc::new(Semaphore::new(max_concurrency));
    let mut handles = Vec::with_capacity(images.len());

    for image in images {
        let permit = Arc::clone(&semaphore).acquire_owned().await?;
        let service = Arc::clone(&service);
        let store = Arc::clone(&store);
        handles.push(tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let mut line = match read_image(&image) {
                Ok(bytes) => report(&service.identify(&bytes, &*store)),
                Err(e) => json!({ "outcome": "error", "error": "io_error", "message": format!("{e:#}") }),
            };
            line["image"] = json!(image.display().to_string());
            line
        }));
    }

    for handle in handles {
        let line = handle.await.context("identification task panicked")?;
        println!("{line}");
    }
    Ok(())
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading image {}", path.display()))
}

/// JSON report for one identification request.
fn report(result: &Result<Outcome, IdentifyError>) -> Value {
    match result {
        Ok(outcome) => {
            let mut value = serde_json::to_value(outcome)
                .unwrap_or_else(|e| json!({ "outcome": "error", "error": e.to_string() }));
            value["message"] = json!(outcome.message());
            value
        }
        Err(e) => {
            if e.is_client_error() {
                tracing::warn!(error = %e, "rejected input");
            } else {
                tracing::error!(error = %e, "identification failed");
            }
            json!({ "outcome": "error", "error": e.kind(), "message": e.to_string() })
        }
    }
}

fn exit_code(result: &Result<Outcome, IdentifyError>) -> ExitCode {
    match result {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) if e.is_client_error() => ExitCode::from(2),
        Err(_) => ExitCode::FAILURE,
    }
}

/// Model and gallery status, without running any inference.
fn check(config: &Config, store: &JsonGalleryStore) -> Value {
    let detector_path = config.scrfd_model_path();
    let extractor_path = config.arcface_model_path();
    let models_present = detector_path.exists() && extractor_path.exists();

    let gallery = match store.fetch() {
        Ok(entries) => {
            let dimension_check = reunite_core::matcher::check_dimensions(&entries, config.embedding_dim);
            json!({
                "path": store.path().display().to_string(),
                "entries": entries.len(),
                "ok": dimension_check.is_ok(),
                "error": dimension_check.err().map(|e| e.to_string()),
            })
        }
        Err(e) => json!({
            "path": store.path().display().to_string(),
            "ok": false,
            "error": e.to_string(),
        }),
    };
    let gallery_ok = gallery["ok"].as_bool().unwrap_or(false);

    json!({
        "healthy": models_present && gallery_ok,
        "models": {
            "detector": { "path": detector_path.display().to_string(), "present": detector_path.exists() },
            "extractor": { "path": extractor_path.display().to_string(), "present": extractor_path.exists() },
        },
        "embedding_dim": config.embedding_dim,
        "metric": config.distance_metric.to_string(),
        "gallery": gallery,
    })
}
