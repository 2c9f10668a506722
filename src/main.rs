use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use progimage::app::ImageService;
use progimage::models::{Config, UploadResponse};
use std::path::PathBuf;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "progimage")]
#[command(about = "Store images and fetch them in other formats")]
struct CliArgs {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the storage bucket if it does not exist yet.
    EnsureBucket,
    /// Validate and store an image file, printing its id as JSON.
    Upload {
        #[arg(value_name = "FILE")]
        path: PathBuf,
    },
    /// Fetch an image by id; `<id>.<ext>` converts it to png, jpg or gif.
    Get {
        #[arg(value_name = "ID")]
        name: String,
        /// Write to this file instead of stdout.
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
}

async fn run(service: &ImageService, command: Command) -> Result<()> {
    match command {
        Command::EnsureBucket => {
            service.ensure_bucket().await?;
            info!("Bucket ready");
        }
        Command::Upload { path } => {
            let file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("unable to open {}", path.display()))?;
            let id = service.upload(Box::pin(file)).await?;
            println!("{}", serde_json::to_string(&UploadResponse { id })?);
        }
        Command::Get { name, output } => {
            let (mut image, completion) = service.resolve(&name).await?;
            let mut out: Box<dyn AsyncWrite + Unpin + Send> = match &output {
                Some(path) => Box::new(tokio::fs::File::create(path).await?),
                None => Box::new(tokio::io::stdout()),
            };

            let written = tokio::io::copy(&mut image.data, &mut out).await;
            out.flush().await?;
            completion
                .wait()
                .await
                .with_context(|| format!("converting {} failed", name))?;
            let written = written?;
            info!("Wrote {} bytes of {}", written, image.content_type);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "progimage=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = CliArgs::parse();
    let config = Config::from_env()?;

    let service = match ImageService::from_config(&config).await {
        Ok(service) => service,
        Err(e) => {
            error!("Failed to initialize image service: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(&service, args.command).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
    Ok(())
}
