//! Server implementation for the MySQL proxy
//!
//! Accepts client connections, logs them in against the configured
//! principals and hands each one to an [`Engine`].

use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use sqlgate_core::clock::SystemClock;
use sqlgate_core::lease::{HttpLeaseManager, InMemoryLeaseManager, LeaseManager};
use sqlgate_core::models::{DatabaseSpec, Session};
use sqlgate_core::RoleSet;

use crate::audit::LogAudit;
use crate::backend::BackendConnector;
use crate::config::{LeaseBackend, ProxyConfig};
use crate::credentials::StaticCredentialProvider;
use crate::engine::{Engine, EngineConfig, EngineDeps};
use crate::error::{to_err_packet, ProxyError, Result};
use crate::frontend::accept_client;
use crate::protocol::packet::{write_packet, Packet};
use crate::security::RateLimiter;

/// How often idle rate limiter entries are dropped
const RATE_LIMITER_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Main proxy server implementation
pub struct ProxyServer {
    /// Server configuration
    config: ProxyConfig,

    /// Database every session is proxied to
    database: Arc<DatabaseSpec>,

    /// Shared engine dependencies
    deps: EngineDeps,

    /// Connection admission
    rate_limiter: RateLimiter,

    /// Id announced in the next greeting
    next_connection_id: AtomicU32,

    /// Cancelled on stop; every session holds a child token
    shutdown: CancellationToken,

    /// Whether the server is running
    running: AtomicBool,
}

impl ProxyServer {
    /// Create a new proxy server
    pub fn new(config: ProxyConfig) -> Result<Self> {
        let credentials = Arc::new(StaticCredentialProvider::new(
            config.credentials.clone(),
            config.auth_preference,
        ));
        let leases: Arc<dyn LeaseManager> = match &config.leases {
            LeaseBackend::Memory => Arc::new(InMemoryLeaseManager::new(Arc::new(SystemClock))),
            LeaseBackend::Http { url, timeout_ms } => {
                Arc::new(HttpLeaseManager::new(url).with_timeout(Duration::from_millis(*timeout_ms)))
            }
        };
        let connector = BackendConnector::new(
            credentials.clone(),
            leases,
            Arc::new(SystemClock),
            config.connect_timeout(),
        );

        let deps = EngineDeps {
            connector,
            credentials,
            audit: Arc::new(LogAudit),
        };
        Self::with_deps(config, deps)
    }

    /// Create a server with caller-provided engine dependencies
    pub fn with_deps(config: ProxyConfig, deps: EngineDeps) -> Result<Self> {
        config.validate()?;
        let rate_limiter = RateLimiter::new(&config.rate_limiter)?;

        Ok(Self {
            database: Arc::new(config.database.clone()),
            config,
            deps,
            rate_limiter,
            next_connection_id: AtomicU32::new(1),
            shutdown: CancellationToken::new(),
            running: AtomicBool::new(false),
        })
    }

    /// Start the proxy server, returning the bound address
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr> {
        if self.shutdown.is_cancelled() {
            return Err(ProxyError::Server("Server was stopped".to_string()));
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ProxyError::Server("Server is already running".to_string()));
        }

        let listen_addr = self.config.listen_socket_addr()?;
        let listener = match TcpListener::bind(listen_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(ProxyError::Server(format!("Failed to bind to {}: {}", listen_addr, e)));
            }
        };
        let local_addr = listener.local_addr()?;
        info!(
            "Proxy server listening on {}, proxying to {} at {}",
            local_addr, self.database.name, self.database.uri
        );

        let server = self.clone();
        tokio::spawn(async move { server.accept_loop(listener).await });

        Ok(local_addr)
    }

    /// Stop the proxy server and cancel every session
    pub fn stop(&self) {
        info!("Stopping proxy server...");
        self.shutdown.cancel();
        self.running.store(false, Ordering::SeqCst);
    }

    /// Get server configuration
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Check if the server is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut cleanup = tokio::time::interval(RATE_LIMITER_CLEANUP_INTERVAL);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = cleanup.tick() => self.rate_limiter.cleanup(),
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let server = self.clone();
                        let cancel = self.shutdown.child_token();
                        tokio::spawn(async move { server.handle_client(stream, addr, cancel).await });
                    }
                    Err(e) => error!("Error accepting connection: {}", e),
                },
            }
        }

        info!("Proxy server stopped");
    }

    /// Handle a client connection
    async fn handle_client(&self, mut stream: TcpStream, addr: SocketAddr, cancel: CancellationToken) {
        if let Err(err) = self.rate_limiter.admit(addr.ip()) {
            debug!("Connection from {} rejected: {}", addr, err);
            let reply = Packet::new(0, to_err_packet(&err).encode());
            if let Err(e) = write_packet(&mut stream, &reply).await {
                debug!("Failed to send error to {}: {}", addr, e);
            }
            return;
        }
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY for {}: {}", addr, e);
        }
        info!("New connection from {}", addr);

        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let login = tokio::select! {
            _ = cancel.cancelled() => return,
            result = tokio::time::timeout(
                self.config.handshake_timeout(),
                accept_client(&mut stream, connection_id, &self.config.principals),
            ) => match result {
                Ok(Ok(login)) => login,
                Ok(Err(e)) => {
                    warn!("Client {} failed to log in: {}", addr, e);
                    return;
                }
                Err(_) => {
                    warn!("Client {} did not log in within {:?}", addr, self.config.handshake_timeout());
                    return;
                }
            },
        };

        let checker = Arc::new(RoleSet::new(self.config.roles_for(&login.identity.roles)));
        let session = Session::new(
            login.identity,
            self.database.clone(),
            login.database_user,
            login.database_name,
            checker,
        )
        .with_client_addr(addr);

        let mut engine = Engine::new(
            EngineConfig {
                max_packet_size: self.config.max_packet_size,
            },
            self.deps.clone(),
        );
        if let Err(e) = engine.initialize_connection(Box::new(stream), login.next_sequence, login.capabilities) {
            error!("Failed to set up {}: {}", session, e);
            return;
        }
        if let Err(err) = engine.handle_connection(cancel, &session).await {
            warn!("Failed to serve {}: {}", session, err);
            engine.send_error(&err).await;
        }

        info!("Connection from {} closed", addr);
    }
}
