//! Daemon construction graph and listener set
//!
//! Everything the proxy needs is built here in `PafDaemon::new` and passed
//! down by reference; no module-level mutable state exists. Three listeners
//! run concurrently: the dashboard/API server and one proxy listener per
//! family.

use crate::logger::SqliteRequestLogger;
use crate::probe::HttpCredentialTester;
use crate::reprobe::spawn_reprobe_loop;
use crate::settings::Settings;
use crate::state_dir::StateDir;
use paf_core::{ConfigStore, Error, Family, Result};
use paf_http::{dashboard_router, proxy_router, AppState, Forwarder};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};

/// A fully wired proxy daemon
pub struct PafDaemon {
    settings: Settings,
    state: AppState,
}

impl PafDaemon {
    /// Build the daemon: stores, logger, forwarders, tester
    ///
    /// # Errors
    ///
    /// Fatal configuration problems (unreadable system file, config
    /// directory I/O) surface here; the caller exits non-zero.
    pub fn new(settings: Settings, state_dir: &StateDir) -> Result<Self> {
        state_dir.create_directories()?;

        let logger = Arc::new(SqliteRequestLogger::new(
            &state_dir.request_log_path(),
            settings.max_logs,
        )?);

        let request_timeout = Duration::from_secs(settings.request_timeout_secs);
        let claude_store = Arc::new(ConfigStore::open_or_init(Family::Claude, state_dir.base())?);
        let codex_store = Arc::new(ConfigStore::open_or_init(Family::Codex, state_dir.base())?);

        let claude = Arc::new(Forwarder::new(
            Family::Claude,
            claude_store,
            logger.clone(),
            request_timeout,
        )?);
        let codex = Arc::new(Forwarder::new(
            Family::Codex,
            codex_store,
            logger.clone(),
            request_timeout,
        )?);

        let tester = Arc::new(HttpCredentialTester::new(logger.clone())?);
        let state = AppState::new(claude, codex, logger, tester);

        Ok(Self { settings, state })
    }

    /// Shared state, exposed for tests
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Bind all three listeners and serve until one of them fails
    pub async fn run(self) -> Result<()> {
        let web_addr = SocketAddr::from(([0, 0, 0, 0], self.settings.web_port));
        let claude_addr = SocketAddr::from(([0, 0, 0, 0], self.settings.claude_port));
        let codex_addr = SocketAddr::from(([0, 0, 0, 0], self.settings.codex_port));

        let web_listener = bind(web_addr).await?;
        let claude_listener = bind(claude_addr).await?;
        let codex_listener = bind(codex_addr).await?;

        info!("Claude proxy listening on {claude_addr}");
        let claude_app = proxy_router(self.state.claude.clone());
        tokio::spawn(async move {
            if let Err(err) = axum::serve(claude_listener, claude_app).await {
                error!("Claude proxy server error: {err}");
            }
        });

        info!("Codex proxy listening on {codex_addr}");
        let codex_app = proxy_router(self.state.codex.clone());
        tokio::spawn(async move {
            if let Err(err) = axum::serve(codex_listener, codex_app).await {
                error!("Codex proxy server error: {err}");
            }
        });

        spawn_reprobe_loop(self.state.claude.clone());
        spawn_reprobe_loop(self.state.codex.clone());

        info!("Dashboard listening on {web_addr}");
        let web_app = dashboard_router(self.state);
        axum::serve(web_listener, web_app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| Error::internal(format!("dashboard server error: {e}")))
    }
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutdown signal received, stopping listeners");
    }
}

async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| Error::internal(format!("failed to bind {addr}: {e}")))
}
