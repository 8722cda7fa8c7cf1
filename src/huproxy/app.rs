use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::task::JoinSet;

use crate::huproxy::{admin, config, logging, net, server, telemetry};

pub async fn run(config_path: Option<PathBuf>, overrides: config::Overrides) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;

    let mut cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;
    cfg.apply(&overrides).context("command line")?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %resolved.path.display(),
        config_source = %resolved.source,
        listen_addr = %cfg.listen_addr,
        url = %cfg.url,
        admin_addr = %cfg.admin_addr,
        dial_timeout = ?cfg.timeouts.dial_timeout,
        handshake_timeout = ?cfg.timeouts.handshake_timeout,
        write_timeout = ?cfg.timeouts.write_timeout,
        buffer_size = cfg.buffer_size,
        "huproxy: starting"
    );

    let prom = Arc::new(telemetry::init_prometheus()?);
    let tunnels = Arc::new(telemetry::TunnelRegistry::new());

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let mut tasks = JoinSet::new();

    // Admin server.
    if !cfg.admin_addr.trim().is_empty() {
        let admin_addr = net::normalize_bind_addr(&cfg.admin_addr);
        let addr: SocketAddr = admin_addr
            .parse()
            .with_context(|| format!("invalid admin_addr: {}", cfg.admin_addr))?;

        let admin_state = admin::AdminState {
            prom: prom.clone(),
            tunnels: tunnels.clone(),
            config_path: resolved.path.clone(),
        };

        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve_with_shutdown(addr, admin_state, shutdown).await });
    }

    // Tunnel listener.
    {
        let state = Arc::new(server::ServerState::new(cfg.tunnel(), tunnels.clone()));
        let listen_addr = cfg.listen_addr.clone();
        let url = cfg.url.clone();
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            server::serve_with_shutdown(&listen_addr, &url, state, shutdown).await
        });
    }

    // Wait for shutdown signal (Ctrl-C / SIGTERM) or unexpected task termination.
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!(active_tunnels = tunnels.len(), "shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        let _ = shutdown_tx.send(true);
                        return Err(err);
                    }
                    Err(join_err) => return Err(join_err.into()),
                }
            }
        }
    }

    let drain = async { while tasks.join_next().await.is_some() {} };

    // Hard cap so `docker stop` doesn't stall on long-lived tunnels.
    let drain_timeout = Duration::from_secs(5);
    if tokio::time::timeout(drain_timeout, drain).await.is_err() {
        tracing::warn!(active_tunnels = tunnels.len(), "shutdown: drain timed out");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
