use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use clap::Parser;
use gallery_core::{FileBackend, Gallery, GalleryConfig};
use gallery_server::build_app;
use tokio::net::TcpListener;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
struct Args {
    /// Data directory of the backing store
    #[arg(long, env = "GALLERY_DATA", default_value = "./data")]
    data: PathBuf,
    /// Host to bind
    #[arg(long, env = "GALLERY_HOST", default_value = "0.0.0.0")]
    host: String,
    /// Port to bind
    #[arg(long, env = "GALLERY_PORT", default_value_t = 8080)]
    port: u16,
    /// Seconds between checks for a pending re-sort
    #[arg(long, env = "GALLERY_REGEN_SECS", default_value_t = 180)]
    regen_secs: u64,
    /// Only re-sort on explicit admin request
    #[arg(long)]
    no_auto_regenerate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let args = Args::parse();
    gallery_core::tokenizer::init();

    let backend = FileBackend::open(&args.data)
        .with_context(|| format!("opening data directory {}", args.data.display()))?;
    let config = GalleryConfig {
        regenerate_interval: Duration::from_secs(args.regen_secs.max(1)),
        auto_regenerate: !args.no_auto_regenerate,
        ..GalleryConfig::default()
    };
    let gallery = Arc::new(Gallery::open(Arc::new(backend), config).context("filling the cache")?);
    let app: Router = build_app(Arc::clone(&gallery));

    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, data = %args.data.display(), "server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    gallery.shutdown();
    tracing::info!("server stopped");
    Ok(())
}
