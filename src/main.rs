use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

use kiosk_frame::config::Configuration;
use kiosk_frame::coordinator::SyncCoordinator;
use kiosk_frame::hub::BroadcastHub;
use kiosk_frame::library::{ImageLibrary, LibraryOptions};
use kiosk_frame::settings::{FileSettings, SettingsStore};
use kiosk_frame::storage::{AssetStore, FsAssetStore};
use kiosk_frame::web::{self, WebOptions};

#[derive(Debug, Parser)]
#[command(
    name = "kiosk-frame",
    version,
    about = "Kiosk slideshow backend with live viewer sync"
)]
struct Args {
    /// Path to YAML config
    #[arg(short, long, value_name = "FILE", default_value = "config.yaml")]
    config: PathBuf,
    /// Increase log verbosity (repeatable)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbosity: u8) -> Result<()> {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"))
        .add_directive(
            format!("kiosk_frame={level}")
                .parse()
                .context("invalid log directive")?,
        );
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let Args { config, verbose } = Args::parse();
    init_tracing(verbose)?;

    let loaded = if config.exists() {
        Configuration::from_yaml_file(&config)
            .with_context(|| format!("failed to load configuration from {}", config.display()))?
    } else {
        tracing::warn!(path = %config.display(), "configuration file not found; using defaults");
        Configuration::default()
    };
    let cfg = loaded.validated().context("invalid configuration values")?;
    tracing::info!("Loaded configuration from {}:\n{:#?}", config.display(), cfg);

    let settings: Arc<dyn SettingsStore> = Arc::new(FileSettings::open(&cfg.settings_path));
    let assets: Arc<dyn AssetStore> = Arc::new(
        FsAssetStore::open(&cfg.image_root, cfg.public_image_prefix.clone())
            .context("failed to prepare image storage")?,
    );
    let library = ImageLibrary::open(
        Arc::clone(&settings),
        assets,
        LibraryOptions {
            thumbnail_size: cfg.thumbnail_size,
            encoding: cfg.encoding,
        },
    );
    let hub = Arc::new(BroadcastHub::new());
    let coordinator = Arc::new(SyncCoordinator::new(library, settings, hub));

    let cancel = CancellationToken::new();

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!("ctrl-c handler failed: {err}");
                return;
            }
            tracing::info!("ctrl-c received; initiating shutdown");
            cancel.cancel();
        });
    }

    #[cfg(unix)]
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = sigterm.recv() => {
                            tracing::info!("SIGTERM received; initiating shutdown");
                            cancel.cancel();
                        }
                    }
                }
                Err(err) => tracing::warn!("failed to register SIGTERM handler: {err}"),
            }
        });
    }

    #[cfg(unix)]
    {
        let cancel = cancel.clone();
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            match signal(SignalKind::hangup()) {
                Ok(mut sighup) => loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        received = sighup.recv() => {
                            if received.is_none() {
                                break;
                            }
                            tracing::info!("SIGHUP received; reconciling image library");
                            if let Err(err) = coordinator.reconcile().await {
                                tracing::warn!("reconcile failed: {err}");
                            }
                        }
                    }
                },
                Err(err) => tracing::warn!("failed to register SIGHUP handler: {err}"),
            }
        });
    }

    let server = web::spawn(
        coordinator,
        WebOptions {
            bind_address: cfg.bind_address,
            viewer_queue_depth: cfg.viewer_queue_depth,
            max_upload_bytes: cfg.max_upload_bytes,
        },
        cancel.clone(),
    );
    server.await.context("web server task panicked")?;
    cancel.cancel();
    tracing::info!("shutdown complete");
    Ok(())
}
