use crate::config::GatewayConfig;
use crate::registry::Registry;
use crate::server::{self, GatewayState};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
}

/// Gateway lifecycle: config → registry → state → restore → serve → drain.
///
/// Returns the process exit code: 0 for a clean shutdown, 1 when the drain
/// timed out. Startup misconfiguration surfaces as an `Err` (also exit 1).
pub async fn run(args: BootstrapArgs) -> Result<i32> {
    init_tracing();

    // Phase 1: configuration and durable state.
    let config = Arc::new(GatewayConfig::load(&args.config_path)?);
    let registry = Arc::new(Registry::open(&config.data_dir).await?);

    if config.admin_api_key.is_none() {
        tracing::warn!(
            "server: ADMIN_API_KEY is not set — the admin surface is fail-closed \
             and will answer 503 until a key is configured"
        );
    }

    // Phase 2: runtime state + tenant restoration from persisted specs.
    let state = GatewayState::new(config.clone(), registry)?;
    let restored = state.restore_from_registry().await;
    tracing::info!(
        "server: startup restore complete, tenants={}, cap={}",
        restored,
        config.max_registrations
    );

    // Phase 3: serve until a signal arrives.
    let shutdown = Arc::new(Notify::new());
    let listen = config.listen_addr();
    tracing::info!("server: starting gateway, listen={}", listen);

    let mut server_handle = tokio::spawn(server::run_server(
        listen,
        state.clone(),
        shutdown.clone(),
    ));

    tokio::select! {
        _ = wait_for_signal() => {
            shutdown.notify_waiters();
        }
        result = &mut server_handle => {
            // The accept loop only exits on its own for startup failures
            // (e.g. the port is taken).
            state.shutdown();
            result??;
            anyhow::bail!("server exited unexpectedly");
        }
    }

    // Phase 4: drain, then ordered teardown.
    let drained = server_handle.await??;
    state.shutdown();

    if drained {
        tracing::info!("server: shutdown complete");
        Ok(0)
    } else {
        tracing::error!("server: forced shutdown after drain timeout");
        Ok(1)
    }
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }
}
