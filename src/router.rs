//! Router lifecycle: snapshot loading, both listeners, and graceful shutdown.
//!
//! The data-plane listener only starts accepting once all three routing tables have
//! been loaded. Both listeners share one set of tables and one shutdown signal.

use crate::{
    admin::serve_admin,
    config::{load_config, RouterConfig},
    error::utils::internal_error,
    metrics::init_metrics,
    probe::HyperTransport,
    proxy::{serve_proxy, ProxyContext},
    tables::{RoutingTables, Table},
    Result,
};
use std::{future::Future, net::SocketAddr, path::Path, sync::Arc, time::Duration};
use tokio::{
    signal,
    sync::broadcast,
    task::JoinHandle,
    time::timeout,
};
use tracing::{error, info, warn};

/// How long listeners get to drain in-flight requests after shutdown is signalled.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Both listeners, bound and serving.
pub struct Listeners {
    pub proxy_addr: SocketAddr,
    pub admin_addr: SocketAddr,
    pub tables: Arc<RoutingTables>,
    tasks: Vec<JoinHandle<()>>,
}

impl Listeners {
    /// Wait until both listeners have stopped.
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("Listener task failed: {}", e);
            }
        }
    }
}

/// Orchestrates the data plane and the admin API.
pub struct Router {
    config: RouterConfig,
    shutdown_sender: broadcast::Sender<()>,
}

impl Router {
    pub fn new(config: RouterConfig) -> Self {
        let (shutdown_sender, _) = broadcast::channel(4);
        Self {
            config,
            shutdown_sender,
        }
    }

    /// Load router from configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = load_config(path)?;
        Ok(Self::new(config))
    }

    /// Run until Ctrl+C, SIGTERM or [`Router::trigger_shutdown`], then drain both
    /// listeners.
    pub async fn start(&self) -> Result<()> {
        info!("Starting revision router v{}", crate::VERSION);

        if let Some(addr) = self.config.metrics_addr {
            init_metrics(addr)?;
            info!("Prometheus exporter listening on {}", addr);
        }

        let listeners = self.launch().await?;

        self.wait_for_shutdown().await;

        info!("Starting graceful shutdown...");
        let _ = self.shutdown_sender.send(());

        if timeout(DRAIN_TIMEOUT, listeners.join()).await.is_err() {
            warn!("Shutdown timeout exceeded, forcing exit");
        }

        info!("Graceful shutdown completed");
        Ok(())
    }

    /// Load the routing snapshot and bind both listeners.
    pub async fn launch(&self) -> Result<Listeners> {
        let tables = Arc::new(RoutingTables::load_snapshot(&self.config.data_dir).await?);

        let ctx = ProxyContext::new(
            tables.clone(),
            Arc::new(HyperTransport::new()),
            self.config.probe_timeout(),
        );

        let (proxy_addr, proxy) = serve_proxy(self.config.proxy_addr, ctx, self.shutdown_signal())?;
        let (admin_addr, admin) = serve_admin(self.config.admin_addr, tables.clone(), self.shutdown_signal())?;

        let proxy_task = tokio::spawn(async move {
            if let Err(e) = proxy.await {
                error!("Proxy server failed: {}", e);
            }
        });
        let admin_task = tokio::spawn(admin);

        info!(
            "Routing {} revisions on {}, admin API on {}",
            tables.len(Table::RevisionBackend),
            proxy_addr,
            admin_addr
        );

        Ok(Listeners {
            proxy_addr,
            admin_addr,
            tables,
            tasks: vec![proxy_task, admin_task],
        })
    }

    /// Trigger programmatic shutdown.
    pub fn trigger_shutdown(&self) -> Result<()> {
        self.shutdown_sender
            .send(())
            .map_err(|e| internal_error(format!("Failed to send shutdown signal: {}", e)))?;
        Ok(())
    }

    fn shutdown_signal(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut receiver = self.shutdown_sender.subscribe();
        async move {
            let _ = receiver.recv().await;
        }
    }

    /// Wait for shutdown signal (SIGTERM, SIGINT, or CTRL+C).
    async fn wait_for_shutdown(&self) {
        let mut shutdown_receiver = self.shutdown_sender.subscribe();

        #[cfg(unix)]
        {
            tokio::select! {
                _ = signal::ctrl_c() => {
                    info!("Received CTRL+C signal");
                }
                _ = shutdown_receiver.recv() => {
                    info!("Received programmatic shutdown signal");
                }
                _ = wait_for_sigterm() => {
                    info!("Received SIGTERM signal");
                }
            }
        }

        #[cfg(not(unix))]
        {
            tokio::select! {
                _ = signal::ctrl_c() => {
                    info!("Received CTRL+C signal");
                }
                _ = shutdown_receiver.recv() => {
                    info!("Received programmatic shutdown signal");
                }
            }
        }
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{client::AdminClient, error::RouterError, tables::STABLE_VERSION};
    use std::fs;

    fn write_snapshot(dir: &Path) {
        fs::write(dir.join("sv.json"), r#"{"beta": "canary"}"#).unwrap();
        fs::write(dir.join("vr.json"), r#"{"stable": "900", "canary": "901"}"#).unwrap();
        fs::write(
            dir.join("rp.json"),
            r#"{"900": "http://127.0.0.1:1", "901": "http://127.0.0.1:2"}"#,
        )
        .unwrap();
    }

    fn test_config(data_dir: &Path) -> RouterConfig {
        RouterConfig {
            proxy_addr: "127.0.0.1:0".parse().unwrap(),
            admin_addr: "127.0.0.1:0".parse().unwrap(),
            data_dir: data_dir.to_path_buf(),
            ..RouterConfig::default()
        }
    }

    #[tokio::test]
    async fn test_launch_serves_snapshot_until_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        write_snapshot(dir.path());

        let router = Router::new(test_config(dir.path()));
        let listeners = router.launch().await.unwrap();
        assert_eq!(
            listeners.tables.revision_for_version(STABLE_VERSION).as_deref(),
            Some("900")
        );

        {
            let client = AdminClient::new(&format!("http://{}", listeners.admin_addr)).unwrap();
            client.set_entry(Table::VersionRevision, STABLE_VERSION, "901").await.unwrap();
            assert_eq!(
                client.get_entry(Table::VersionRevision, STABLE_VERSION).await.unwrap().as_deref(),
                Some("901")
            );
        }

        // The data plane sees admin mutations immediately.
        let response = reqwest::get(format!("http://{}/api/lb/version", listeners.proxy_addr))
            .await
            .unwrap();
        let table: std::collections::BTreeMap<String, String> = response.json().await.unwrap();
        assert_eq!(table[STABLE_VERSION], "901");

        router.trigger_shutdown().unwrap();
        timeout(Duration::from_secs(5), listeners.join()).await.unwrap();
    }

    #[tokio::test]
    async fn test_launch_requires_full_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("sv.json"), "{}").unwrap();
        fs::write(dir.path().join("vr.json"), "{}").unwrap();

        let router = Router::new(test_config(dir.path()));
        let err = router.launch().await.err().unwrap();
        assert!(matches!(err, RouterError::SnapshotNotFound { .. }));
    }

    #[test]
    fn test_trigger_shutdown_without_listeners_fails() {
        let router = Router::new(RouterConfig::default());
        assert!(router.trigger_shutdown().is_err());
    }
}
