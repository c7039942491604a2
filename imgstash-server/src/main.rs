mod config;
use anyhow::Context;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use config::Config;
use imgstash_core::operations::{
    DeleteImageOperation, DeleteImageOperationOutcome, DeleteImageOperationRequest,
    ListRecentOperation, ListRecentOperationRequest, PutImageOperation, PutImageOperationRequest,
    SweepOperation, SweepOperationRequest,
};
use imgstash_core::{FsBlobStore, GarbageCollector, ImageCatalog, Retention};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "imgstash")]
#[command(about = "Image metadata store with a background garbage collector")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Database file, overrides the configured `db`
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Blob directory, overrides the configured `data`
    #[arg(long, global = true)]
    data: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the garbage collector until Ctrl-C
    Serve {
        /// Seconds between sweeps
        #[arg(long)]
        gc_interval: Option<u64>,

        /// Maximum expired images reclaimed per sweep
        #[arg(long)]
        gc_limit: Option<usize>,
    },
    /// Run one sweep now and print its report
    Sweep,
    /// Store an image file
    Put {
        file: PathBuf,

        /// Pre-rendered thumbnail for the image
        #[arg(long)]
        thumbnail: Option<PathBuf>,

        /// Keep the image out of the recent list
        #[arg(long)]
        unlisted: bool,

        /// day, month or forever
        #[arg(long, default_value = "forever")]
        retention: String,

        #[arg(long)]
        owner: Option<String>,
    },
    /// Print the most recently listed images
    Recent {
        #[arg(short = 'n', long, default_value_t = imgstash_core::RECENT_LIMIT)]
        limit: usize,
    },
    /// Print one image record
    Show { uuid: String },
    /// Delete an image with its delete token
    Delete {
        uuid: String,

        #[arg(long)]
        token: String,
    },
}

struct App {
    config: Config,
    catalog: Arc<ImageCatalog>,
    blob_store: Arc<FsBlobStore>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "imgstash=info,imgstash_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut cfg = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(db) = cli.db {
        cfg.db = db;
    }
    if let Some(data) = cli.data {
        cfg.data = data;
    }
    if let Commands::Serve {
        gc_interval,
        gc_limit,
    } = &cli.command
    {
        if let Some(interval) = gc_interval {
            cfg.gc.interval_secs = *interval;
        }
        if let Some(limit) = gc_limit {
            cfg.gc.limit = *limit;
        }
    }

    if let Err(e) = cfg.validate() {
        tracing::error!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    let app = match App::open(cfg) {
        Ok(app) => app,
        Err(e) => {
            tracing::error!("Failed to open store: {:#}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = app.run(cli.command).await {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}

impl App {
    fn open(config: Config) -> anyhow::Result<Self> {
        let catalog = ImageCatalog::open(&config.db)
            .with_context(|| format!("opening database {}", config.db.display()))?;
        let blob_store = FsBlobStore::new(config.data.clone())
            .with_context(|| format!("opening data directory {}", config.data.display()))?;

        Ok(Self {
            config,
            catalog: Arc::new(catalog),
            blob_store: Arc::new(blob_store),
        })
    }

    async fn run(self, command: Commands) -> anyhow::Result<()> {
        match command {
            Commands::Serve { .. } => self.serve().await,
            Commands::Sweep => self.sweep().await,
            Commands::Put {
                file,
                thumbnail,
                unlisted,
                retention,
                owner,
            } => {
                self.put(&file, thumbnail.as_deref(), unlisted, &retention, owner)
                    .await
            }
            Commands::Recent { limit } => self.recent(limit).await,
            Commands::Show { uuid } => self.show(&uuid),
            Commands::Delete { uuid, token } => self.delete(uuid, token).await,
        }
    }

    async fn serve(self) -> anyhow::Result<()> {
        tracing::info!(
            "Serving {} (data: {})",
            self.catalog.db_path().display(),
            self.config.data.display()
        );

        let handle = GarbageCollector::spawn(
            self.catalog.clone(),
            self.blob_store.clone(),
            self.config.gc.clone(),
        );

        tokio::signal::ctrl_c()
            .await
            .context("waiting for Ctrl-C")?;
        tracing::info!("Shutdown requested, stopping garbage collector");
        handle.stop().await;
        Ok(())
    }

    async fn sweep(self) -> anyhow::Result<()> {
        let report = SweepOperation::new(self.catalog.clone(), self.blob_store.clone())
            .run(SweepOperationRequest {
                now: chrono::Utc::now(),
                gc_limit: self.config.gc.limit,
                recent_limit: self.config.gc.recent_limit,
            })
            .await
            .context("sweep failed")?;

        println!("{}", serde_json::to_string_pretty(&report)?);
        Ok(())
    }

    async fn put(
        self,
        file: &Path,
        thumbnail: Option<&Path>,
        unlisted: bool,
        retention: &str,
        owner: Option<String>,
    ) -> anyhow::Result<()> {
        let retention: Retention = retention.parse()?;
        let body = tokio::fs::read(file)
            .await
            .with_context(|| format!("reading {}", file.display()))?;
        let thumbnail = match thumbnail {
            Some(path) => Some(Bytes::from(
                tokio::fs::read(path)
                    .await
                    .with_context(|| format!("reading {}", path.display()))?,
            )),
            None => None,
        };
        let extension = file
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("bin")
            .to_string();

        let result = PutImageOperation::new(self.catalog.clone(), self.blob_store.clone())
            .run(PutImageOperationRequest {
                body: Bytes::from(body),
                thumbnail,
                extension,
                owner,
                unlisted,
                retention,
                owner_cookie: String::new(),
            })
            .await?;

        println!("{}", serde_json::to_string_pretty(&result.record)?);
        Ok(())
    }

    async fn recent(self, limit: usize) -> anyhow::Result<()> {
        let result = ListRecentOperation::new(self.catalog.clone())
            .run(ListRecentOperationRequest { limit })
            .await?;

        for record in result.items {
            println!(
                "{}\t{}\t{}",
                record.uuid,
                record.added_at.to_rfc3339(),
                record.blob_path
            );
        }
        Ok(())
    }

    fn show(self, uuid: &str) -> anyhow::Result<()> {
        match self.catalog.load(uuid)? {
            Some(record) => {
                println!("{}", serde_json::to_string_pretty(&record)?);
                Ok(())
            }
            None => anyhow::bail!("image {} not found", uuid),
        }
    }

    async fn delete(self, uuid: String, token: String) -> anyhow::Result<()> {
        let outcome = DeleteImageOperation::new(self.catalog.clone(), self.blob_store.clone())
            .run(DeleteImageOperationRequest {
                uuid: uuid.clone(),
                token,
            })
            .await?;

        match outcome {
            DeleteImageOperationOutcome::Deleted(result) => {
                if !result.blob_failures.is_empty() {
                    tracing::warn!(
                        "Image {} deleted, but blobs remain: {}",
                        uuid,
                        result.blob_failures.join(", ")
                    );
                }
                println!("deleted {}", uuid);
                Ok(())
            }
            DeleteImageOperationOutcome::NotFound => anyhow::bail!("image {} not found", uuid),
            DeleteImageOperationOutcome::Forbidden => {
                anyhow::bail!("delete token does not match image {}", uuid)
            }
        }
    }
}
