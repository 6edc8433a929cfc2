//! HTTP server: accept loop, connection admission and graceful shutdown

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::recording::{spawn_reconciler, SessionManager};
use crate::Result;

use super::connection_pool::{ConnectionLimit, ConnectionPermit};
use super::router::Router;
use super::SHUTDOWN_TIMEOUT_MS;

/// The control API server and the session manager behind it
pub struct Server {
    config: Arc<Config>,
    manager: Arc<SessionManager>,
    router: Arc<Router>,
    connections: ConnectionLimit,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Create a server; sessions are managed from here until shutdown
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or the recordings
    /// directory cannot be created
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let config = Arc::new(config);
        let manager = Arc::new(SessionManager::new(Arc::clone(&config))?);
        let router = Arc::new(Router::new(Arc::clone(&manager)));
        let connections = ConnectionLimit::new(config.server.max_connections);
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            manager,
            router,
            connections,
            shutdown_tx,
        })
    }

    /// Session manager owned by this server
    #[must_use]
    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Bind the configured address and serve until SIGINT or SIGTERM
    ///
    /// # Errors
    ///
    /// Returns error if the address cannot be bound
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.config.server.bind).await?;
        self.serve(listener, shutdown_signal()).await
    }

    /// Serve on `listener` until `signal` resolves, then stop every live
    /// session and drain connections
    ///
    /// # Errors
    ///
    /// Returns error if the listener address cannot be read
    pub async fn serve<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let addr = listener.local_addr()?;
        info!(
            "Listening on {} (recordings in {})",
            addr,
            self.config.capture.recordings_dir.display()
        );

        let reconciler = spawn_reconciler(Arc::clone(&self.manager), self.shutdown_tx.subscribe());
        let mut tasks = JoinSet::new();
        tokio::pin!(signal);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let Some(permit) = self.connections.try_admit() else {
                                warn!("Connection limit reached, rejecting {}", peer_addr);
                                drop(stream);
                                continue;
                            };

                            tasks.spawn(serve_connection(
                                stream,
                                peer_addr,
                                Arc::clone(&self.router),
                                self.shutdown_tx.subscribe(),
                                permit,
                            ));
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                () = &mut signal => {
                    info!("Initiating graceful shutdown");
                    break;
                }
                Some(result) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = result {
                        warn!("Connection task failed: {}", e);
                    }
                }
            }
        }

        drop(listener);
        self.shutdown_tx.send(()).ok();

        self.manager.shutdown().await;

        let shutdown_timeout = Duration::from_millis(SHUTDOWN_TIMEOUT_MS);
        let drained = tokio::time::timeout(shutdown_timeout, async {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    warn!("Task cleanup error: {}", e);
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                "{} connections still open after {:?}, aborting",
                tasks.len(),
                shutdown_timeout
            );
            tasks.shutdown().await;
        }

        if let Err(e) = reconciler.await {
            warn!("Reconciler task failed: {}", e);
        }

        info!("Shutdown complete");
        Ok(())
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("bind", &self.config.server.bind)
            .field("active_connections", &self.connections.active())
            .finish_non_exhaustive()
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    router: Arc<Router>,
    mut shutdown: broadcast::Receiver<()>,
    _permit: ConnectionPermit,
) {
    let service = service_fn(move |request: Request<Incoming>| {
        let router = Arc::clone(&router);
        async move { Ok::<_, Infallible>(router.handle(request).await) }
    });

    let connection = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades();
    tokio::pin!(connection);

    let result = tokio::select! {
        result = connection.as_mut() => result,
        _ = shutdown.recv() => {
            connection.as_mut().graceful_shutdown();
            connection.as_mut().await
        }
    };

    if let Err(e) = result {
        debug!("Connection from {} ended with error: {}", peer_addr, e);
    }
}

/// Resolves on SIGINT or, on unix, SIGTERM
pub async fn shutdown_signal() {
    let terminate = async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for SIGINT: {}", e);
            }
            info!("Received SIGINT, shutting down");
        }
        () = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
