//! Attachs maintenance CLI
//!
//! Runs the lifecycle operations that are triggered from outside the engine:
//! sweeping, reprocessing after style changes, and restoring missing styles.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use attachs_core::{AttachsConfig, ConfigError, Id};
use attachs_db::{Database, DatabaseConfig, PgAttachmentStore};
use attachs_lifecycle::{
    AttachmentProcessor, AttachmentService, BatchReport, KeyDeriver, LifecycleSweeper,
    LocalStorage, PassthroughTransformer, StaticRegistry, StyleRegistry,
};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type Service = AttachmentService<PgAttachmentStore, LocalStorage>;

#[derive(Parser)]
#[command(name = "attachs")]
#[command(author, version, about = "Attachment lifecycle maintenance")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply database migrations
    Migrate,

    /// Destroy stale unattached attachments and reclaim orphaned files
    Sweep {
        /// List what would be removed without removing it
        #[arg(long)]
        dry_run: bool,
    },

    /// Rematerialize styles after a configuration change
    Reprocess {
        /// Only this attachment (default: every processed attachment)
        #[arg(long)]
        id: Option<Id>,
    },

    /// Restore styles whose files are missing
    FixMissing {
        /// Only this attachment (default: every processed attachment)
        #[arg(long)]
        id: Option<Id>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "Command failed");
            ExitCode::FAILURE
        }
    }
}

/// Initialize tracing/logging
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "info,attachs_lifecycle=debug,attachs_db=debug".into()
            }),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_file(true)
                .with_line_number(true),
        )
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = AttachsConfig::from_env().context("loading configuration")?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        strategy = config.key_strategy.as_str(),
        storage = %config.storage.local_path,
        "Starting attachs"
    );

    let db = Database::connect(&DatabaseConfig::from_env())
        .await
        .context("connecting to database")?;

    if let Commands::Migrate = cli.command {
        db.migrate().await.context("applying migrations")?;
        return Ok(ExitCode::SUCCESS);
    }

    let service = build_service(&config, &db).await?;

    let code = match cli.command {
        Commands::Migrate => ExitCode::SUCCESS,
        Commands::Sweep { dry_run } => sweep(&service, &config, dry_run).await?,
        Commands::Reprocess { id: Some(id) } => {
            let report = service.processor().reprocess(id).await?;
            info!(
                id = id,
                written = report.written.len(),
                removed = report.removed.len(),
                unchanged = report.unchanged.len(),
                "Reprocess finished"
            );
            ExitCode::SUCCESS
        }
        Commands::Reprocess { id: None } => {
            exit_code(report_batch("reprocess", &service.processor().reprocess_all().await?))
        }
        Commands::FixMissing { id: Some(id) } => {
            let restored = service.processor().fix_missing(id).await?;
            info!(id = id, restored = restored.len(), "Fix missing finished");
            ExitCode::SUCCESS
        }
        Commands::FixMissing { id: None } => {
            exit_code(report_batch("fix-missing", &service.processor().fix_missing_all().await?))
        }
    };

    db.close().await;
    Ok(code)
}

async fn build_service(config: &AttachsConfig, db: &Database) -> anyhow::Result<Arc<Service>> {
    let registry = load_registry(config).await?;
    let processor = AttachmentProcessor::new(
        Arc::new(PgAttachmentStore::new(db.pool().clone())),
        Arc::new(LocalStorage::new(
            &config.storage.local_path,
            config.storage.base_url.clone(),
        )),
        Arc::new(PassthroughTransformer),
        KeyDeriver::from_config(config),
        StyleRegistry::new(Arc::new(registry), config),
    );

    Ok(Arc::new(AttachmentService::new(Arc::new(processor), config)))
}

async fn load_registry(config: &AttachsConfig) -> Result<StaticRegistry, ConfigError> {
    let Some(path) = config.registry_path.as_deref() else {
        warn!("ATTACHS_REGISTRY_PATH not set, no owner types are attachable");
        return Ok(StaticRegistry::new());
    };

    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ConfigError::FileError(format!("{}: {}", path, e)))?;
    StaticRegistry::from_yaml(&raw).map_err(|e| ConfigError::FileError(format!("{}: {}", path, e)))
}

async fn sweep(service: &Arc<Service>, config: &AttachsConfig, dry_run: bool) -> anyhow::Result<ExitCode> {
    let sweeper = LifecycleSweeper::new(service.clone(), config);
    let now = chrono::Utc::now();

    if dry_run {
        for attachment in sweeper.expired(now).await? {
            info!(
                id = ?attachment.id,
                state = %attachment.state,
                requested_at = %attachment.requested_at,
                "Would destroy"
            );
        }
        for object in sweeper.orphans(now).await? {
            info!(path = %object.path, size = object.size, "Would reclaim");
        }
        return Ok(ExitCode::SUCCESS);
    }

    let report = sweeper.run(now).await?;
    info!(
        destroyed = report.destroyed,
        skipped = report.skipped,
        reclaimed = report.reclaimed,
        "Sweep finished"
    );
    Ok(ExitCode::SUCCESS)
}

/// Log a batch outcome; `true` when every attachment succeeded
fn report_batch(operation: &str, report: &BatchReport) -> bool {
    info!(
        operation = operation,
        succeeded = report.succeeded,
        failed = report.failed.len(),
        "Batch finished"
    );
    if !report.failed.is_empty() {
        warn!(operation = operation, ids = ?report.failed, "Some attachments failed");
    }
    report.failed.is_empty()
}

fn exit_code(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
