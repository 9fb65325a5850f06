//! baggageclaimd - Baggageclaim daemon.
//!
//! Serves the volume HTTP API on top of a [`VolumeRepository`].

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use baggageclaim::VolumeRepository;
use baggageclaim::driver::{BtrfsDriver, Driver, NaiveDriver, OverlayDriver};
use baggageclaim::filesystem::Filesystem;
use baggageclaim::namespace::{Mapper, MapperKind, Namespacer, NoopNamespacer, UidNamespacer};
use baggageclaim::stream::Archiver;
use baggageclaim_common::{OverlayPaths, VolumePaths};
use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;

/// Volume storage backend.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum DriverKind {
    /// Plain directories, full copies.
    Naive,
    /// Overlay mounts.
    Overlay,
    /// btrfs subvolumes and snapshots.
    Btrfs,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// IP address to listen on
    #[arg(long, env = "BAGGAGECLAIM_BIND_IP", default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    bind_ip: IpAddr,

    /// Port to listen on
    #[arg(long, env = "BAGGAGECLAIM_BIND_PORT", default_value_t = 7788)]
    bind_port: u16,

    /// Directory holding the init, live and dead volume directories
    #[arg(long, env = "BAGGAGECLAIM_VOLUMES")]
    volumes: Option<PathBuf>,

    /// Directory holding overlay layers (overlay driver only)
    #[arg(long, env = "BAGGAGECLAIM_OVERLAYS_DIR", default_value = "/var/lib/baggageclaim/overlays")]
    overlays_dir: PathBuf,

    /// Volume driver
    #[arg(long, env = "BAGGAGECLAIM_DRIVER", value_enum, default_value_t = DriverKind::Naive)]
    driver: DriverKind,

    /// Path to the btrfs binary (btrfs driver only)
    #[arg(long, env = "BAGGAGECLAIM_BTRFS_BIN", default_value = "btrfs")]
    btrfs_bin: PathBuf,

    /// Stream through this tar binary instead of archiving in-process
    #[arg(long, env = "BAGGAGECLAIM_TAR_BIN")]
    tar_bin: Option<PathBuf>,

    /// Leave unprivileged volume ownership untouched
    #[arg(long, env = "BAGGAGECLAIM_DISABLE_USER_NAMESPACES")]
    disable_user_namespaces: bool,

    /// Log filter, overridden by RUST_LOG
    #[arg(long, env = "BAGGAGECLAIM_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, env = "BAGGAGECLAIM_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn init_logging(args: &Args) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level));

    let registry = tracing_subscriber::registry().with(filter);
    match args.log_format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

fn build_driver(args: &Args) -> anyhow::Result<Arc<dyn Driver>> {
    Ok(match args.driver {
        DriverKind::Naive => Arc::new(NaiveDriver::new()),
        DriverKind::Overlay => Arc::new(
            OverlayDriver::new(OverlayPaths::with_root(&args.overlays_dir))
                .context("failed to prepare overlays directory")?,
        ),
        DriverKind::Btrfs => Arc::new(BtrfsDriver::new(&args.btrfs_bin)),
    })
}

/// Privileged and unprivileged namespacers.
fn build_namespacers(args: &Args) -> anyhow::Result<(Arc<dyn Namespacer>, Arc<dyn Namespacer>)> {
    let noop: Arc<dyn Namespacer> = Arc::new(NoopNamespacer);

    if args.disable_user_namespaces || !rustix::process::geteuid().is_root() {
        tracing::info!("User namespaces disabled, volume ownership is left untouched");
        return Ok((Arc::clone(&noop), noop));
    }

    let privileged = Mapper::detect(MapperKind::Privileged).context("failed to read id maps")?;
    let unprivileged = Mapper::detect(MapperKind::Unprivileged).context("failed to read id maps")?;
    tracing::debug!(max_id = unprivileged.max_id(), "Detected id mapping");

    Ok((
        Arc::new(UidNamespacer::new(privileged)),
        Arc::new(UidNamespacer::new(unprivileged)),
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let paths = args
        .volumes
        .clone()
        .map_or_else(VolumePaths::new, VolumePaths::with_root);

    let driver = build_driver(&args)?;
    let filesystem =
        Filesystem::new(paths, Arc::clone(&driver)).context("failed to open volumes directory")?;

    driver
        .recover(&filesystem)
        .context("failed to recover volumes")?;

    let (privileged, unprivileged) = build_namespacers(&args)?;
    let archiver = args
        .tar_bin
        .clone()
        .map_or(Archiver::InProcess, |tar_bin| Archiver::External { tar_bin });

    let repo = VolumeRepository::new(filesystem, privileged, unprivileged, &archiver);
    let app = api::server::app(api::AppState::new(repo));

    let addr = SocketAddr::new(args.bind_ip, args.bind_port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!(%addr, driver = driver.name(), "baggageclaimd started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server exited")?;

    tracing::info!("baggageclaimd stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
