//! tracegate node
//!
//! Answers `trace_block` and `trace_transaction` from an indexer store,
//! consulting the upstream node when the store alone cannot tell an empty
//! result from a lagging index, and proxies every other method upstream.

pub mod engine;
pub mod error;
pub mod format;
pub mod readiness;
pub mod rpc;
pub mod server;
pub mod upstream;

use std::{net::SocketAddr, sync::Arc};

pub use engine::TraceEngine;
pub use error::{JsonRpcError, TraceError};
use eyre::Result;
pub use server::{TraceServerHandle, launch_server};
use tokio::sync::RwLock;
use tracegate_config::TracegateConfig;
use tracegate_storage::{PgTraceStore, TraceStore};
use tracing::{info, warn};
pub use upstream::{ChainOracle, Existence, HttpUpstream, Lookup};

/// The trace adapter: store, upstream client, engine and HTTP server
pub struct TracegateNode {
    config: TracegateConfig,
    store: Arc<dyn TraceStore>,
    upstream: Arc<HttpUpstream>,
    engine: Arc<TraceEngine>,
    is_running: Arc<RwLock<bool>>,
    server: Option<TraceServerHandle>,
}

impl TracegateNode {
    /// Create a node over a Postgres pool built from `config.database`.
    ///
    /// The pool connects lazily; nothing touches the database until the first
    /// request.
    pub fn new(config: TracegateConfig) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(PgTraceStore::connect(&config.database)?);
        info!(
            host = %config.database.host,
            pool_size = config.database.pool_size,
            "Indexer database pool initialized"
        );
        Self::with_store(config, store)
    }

    /// Create a node over any [`TraceStore`]
    pub fn with_store(config: TracegateConfig, store: Arc<dyn TraceStore>) -> Result<Self> {
        config.validate()?;

        let upstream = Arc::new(HttpUpstream::new(&config.upstream)?);
        info!(url = upstream.url(), "Upstream client initialized");

        let engine = Arc::new(TraceEngine::new(
            store.clone(),
            upstream.clone(),
            config.readiness.clone(),
            config.database.query_timeout(),
        ));

        Ok(Self {
            config,
            store,
            upstream,
            engine,
            is_running: Arc::new(RwLock::new(false)),
            server: None,
        })
    }

    /// Bind the HTTP server and start serving
    pub async fn start(&mut self) -> Result<()> {
        let mut running = self.is_running.write().await;
        if *running {
            warn!("Node is already running");
            return Ok(());
        }

        let handle =
            launch_server(&self.config.server, self.engine.clone(), self.upstream.clone()).await?;
        info!(addr = %handle.local_addr(), "tracegate started");
        self.server = Some(handle);

        *running = true;
        Ok(())
    }

    /// Stop the server, drain in-flight requests and close the store
    pub async fn stop(&self) -> Result<()> {
        let mut running = self.is_running.write().await;
        if !*running {
            warn!("Node is already stopped");
            return Ok(());
        }

        info!("Stopping tracegate...");
        if let Some(handle) = &self.server {
            handle.stop().await?;
            handle.wait().await?;
        }
        self.store.close().await;

        *running = false;
        info!("tracegate stopped");
        Ok(())
    }

    /// Wait for the HTTP server to exit
    pub async fn wait_for_shutdown(&self) -> Result<()> {
        if let Some(handle) = &self.server {
            handle.wait().await?;
        }
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    /// Address the server is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(TraceServerHandle::local_addr)
    }

    pub fn config(&self) -> &TracegateConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<TraceEngine> {
        &self.engine
    }
}
