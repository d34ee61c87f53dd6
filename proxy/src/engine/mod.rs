//! Session engine
//!
//! One engine serves one client connection: it authorizes the session,
//! connects it to its database, tells the client the connection is ready and
//! then relays packets in both directions until either side goes away or the
//! owner cancels the session.

use futures_util::StreamExt;
use log::{debug, error, warn};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use sqlgate_core::access::{database_role_matchers, AccessMfaParams};
use sqlgate_core::models::Session;

use crate::audit::Audit;
use crate::backend::{BackendConn, BackendConnector, BackendStream};
use crate::credentials::CredentialProvider;
use crate::error::{to_err_packet, ProxyError, Result, TRY_AGAIN_LATER};
use crate::protocol::packet::MAX_PAYLOAD_LEN;
use crate::protocol::{write_packet, ClientPacket, OkPacket, Packet, PacketCodec};

#[cfg(test)]
mod tests;

/// Byte stream of a client connection
pub trait ClientStream: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static {}

impl<T> ClientStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static {}

/// Engine settings
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Largest client packet payload relayed to the database
    pub max_packet_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_packet_size: MAX_PAYLOAD_LEN,
        }
    }
}

/// Collaborators shared by all engines of a server
#[derive(Clone)]
pub struct EngineDeps {
    /// Logs in to databases
    pub connector: BackendConnector,

    /// Source of the cluster authentication preference
    pub credentials: Arc<dyn CredentialProvider>,

    /// Audit sink
    pub audit: Arc<dyn Audit>,
}

struct ClientConn {
    stream: Box<dyn ClientStream>,
    sequence_id: u8,
    capabilities: u32,
}

/// Proxies a single client connection
pub struct Engine {
    config: EngineConfig,
    deps: EngineDeps,
    client: Option<ClientConn>,
    initialized: bool,
}

impl Engine {
    /// Create an engine
    pub fn new(config: EngineConfig, deps: EngineDeps) -> Self {
        Self {
            config,
            deps,
            client: None,
            initialized: false,
        }
    }

    /// Bind the engine to a client whose connection phase has reached the
    /// point where the server sends its final OK or ERR reply
    ///
    /// `next_sequence` is the sequence id of that reply and `capabilities`
    /// the flags negotiated with the client. No I/O happens here.
    pub fn initialize_connection(
        &mut self,
        stream: Box<dyn ClientStream>,
        next_sequence: u8,
        capabilities: u32,
    ) -> Result<()> {
        if self.initialized {
            return Err(ProxyError::Protocol(
                "engine is already bound to a client connection".into(),
            ));
        }
        self.initialized = true;
        self.client = Some(ClientConn {
            stream,
            sequence_id: next_sequence,
            capabilities,
        });
        Ok(())
    }

    /// Send an error to the client in the MySQL ERR format
    ///
    /// Only meaningful before relaying starts. Write failures are logged.
    pub async fn send_error(&mut self, err: &ProxyError) {
        let client = match self.client.as_mut() {
            Some(client) => client,
            None => {
                debug!("No client connection to send error to: {}", err);
                return;
            }
        };
        let packet = Packet::new(client.sequence_id, to_err_packet(err).encode());
        if let Err(e) = write_packet(&mut client.stream, &packet).await {
            error!("Failed to send error to client: {}", e);
        }
    }

    /// Serve the session until either side disconnects or `cancel` fires
    ///
    /// Errors are returned only for failures before the client was told the
    /// connection is ready. Once relaying starts the session ends, it does
    /// not fail.
    pub async fn handle_connection(&mut self, cancel: CancellationToken, session: &Session) -> Result<()> {
        let capabilities = match &self.client {
            Some(client) => client.capabilities,
            None => return Err(ProxyError::Protocol("engine has no client connection".into())),
        };

        self.check_access(session).await?;

        let backend = tokio::select! {
            result = self.connect(session, capabilities) => result?,
            _ = cancel.cancelled() => return Err(ProxyError::Cancelled),
        };

        let mut client = self
            .client
            .take()
            .ok_or_else(|| ProxyError::Protocol("engine has no client connection".into()))?;
        let ok = Packet::new(client.sequence_id, OkPacket::default().encode(client.capabilities));
        write_packet(&mut client.stream, &ok).await?;

        self.deps.audit.on_session_start(session, None);
        let _session_end = SessionEndGuard {
            audit: self.deps.audit.clone(),
            session,
        };

        self.relay(cancel, session, client.stream, backend).await;
        Ok(())
    }

    async fn check_access(&self, session: &Session) -> Result<()> {
        let preference = self.deps.credentials.get_auth_preference().await?;
        let mfa = AccessMfaParams {
            verified: session.identity.is_mfa_verified(),
            always_required: preference.require_session_mfa,
        };
        let matchers = database_role_matchers(
            &session.database.protocol,
            &session.database_user,
            &session.database_name,
        );

        if let Err(denied) = session.checker.check_access(&session.database, &mfa, &matchers) {
            let err = ProxyError::AccessDenied(denied.reason);
            self.deps.audit.on_session_start(session, Some(&err));
            return Err(err);
        }
        Ok(())
    }

    async fn connect(&self, session: &Session, capabilities: u32) -> Result<BackendConn> {
        match self.deps.connector.connect(session, capabilities).await {
            Ok(conn) => Ok(conn),
            Err(err) if err.is_limit_exceeded() => {
                // Provider detail stays in the log
                warn!("Connection attempt for {} was throttled: {}", session, err);
                Err(ProxyError::LimitExceeded(TRY_AGAIN_LATER.to_string()))
            }
            Err(err) => Err(err),
        }
    }

    async fn relay(
        &self,
        cancel: CancellationToken,
        session: &Session,
        client: Box<dyn ClientStream>,
        backend: BackendConn,
    ) {
        let server = backend.into_stream();
        let peers = Arc::new(Peers {
            client: session
                .client_addr
                .map(|addr| addr.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            server: server
                .peer_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| session.database.uri.clone()),
        });

        let (client_reader, client_writer) = tokio::io::split(client);
        let (server_reader, server_writer) = tokio::io::split(server);
        let (client_done_tx, mut client_done) = mpsc::channel(1);
        let (server_done_tx, mut server_done) = mpsc::channel(1);

        let from_client = ClientRelay {
            session: Arc::new(session.clone()),
            audit: self.deps.audit.clone(),
            max_packet_size: self.config.max_packet_size,
            peers: peers.clone(),
        };
        let tasks = RelayTasks(vec![
            tokio::spawn(from_client.run(client_reader, server_writer, client_done_tx)),
            tokio::spawn(receive_from_server(server_reader, client_writer, peers, server_done_tx)),
        ]);

        tokio::select! {
            err = client_done.recv() => log_relay_end(session, "client", err),
            err = server_done.recv() => log_relay_end(session, "server", err),
            _ = cancel.cancelled() => debug!("{} cancelled", session),
        }
        tasks.shutdown().await;
    }
}

/// Emits the session-end audit event on every exit path
struct SessionEndGuard<'a> {
    audit: Arc<dyn Audit>,
    session: &'a Session,
}

impl Drop for SessionEndGuard<'_> {
    fn drop(&mut self) {
        self.audit.on_session_end(self.session);
    }
}

/// Relay task handles, aborted when dropped
struct RelayTasks(Vec<JoinHandle<()>>);

impl RelayTasks {
    /// Stop both directions and wait until their sockets are released
    async fn shutdown(mut self) {
        for task in self.0.drain(..) {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for RelayTasks {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}

#[derive(Debug)]
struct Peers {
    client: String,
    server: String,
}

fn log_relay_end(session: &Session, from: &str, err: Option<ProxyError>) {
    match err {
        Some(err) => debug!("{} ended after a {} relay failure: {}", session, from, err),
        None => debug!("{} ended by {}", session, from),
    }
}

/// Reports how a relay direction finished
///
/// Expected closes are logged quietly; anything else is logged and sent on
/// the direction's completion channel.
async fn finish_relay(from: &str, peers: &Peers, result: Result<()>, done: mpsc::Sender<ProxyError>) {
    match result {
        Ok(()) => debug!("Stop receiving from {} (client={} server={})", from, peers.client, peers.server),
        Err(err) if err.is_ok_network_error() => debug!(
            "Connection closed while receiving from {} (client={} server={}): {}",
            from, peers.client, peers.server, err
        ),
        Err(err) => {
            error!(
                "Failed to relay from {} (client={} server={}): {}",
                from, peers.client, peers.server, err
            );
            let _ = done.send(err).await;
        }
    }
}

struct ClientRelay {
    session: Arc<Session>,
    audit: Arc<dyn Audit>,
    max_packet_size: usize,
    peers: Arc<Peers>,
}

impl ClientRelay {
    async fn run(
        self,
        client: ReadHalf<Box<dyn ClientStream>>,
        mut server: WriteHalf<BackendStream>,
        done: mpsc::Sender<ProxyError>,
    ) {
        let mut frames = FramedRead::new(client, PacketCodec::with_max_payload_len(self.max_packet_size));
        let result = self.relay(&mut frames, &mut server).await;
        finish_relay("client", &self.peers, result, done).await;
    }

    async fn relay(
        &self,
        frames: &mut FramedRead<ReadHalf<Box<dyn ClientStream>>, PacketCodec>,
        server: &mut WriteHalf<BackendStream>,
    ) -> Result<()> {
        while let Some(packet) = frames.next().await {
            let packet = packet?;
            let command = ClientPacket::parse(&packet);
            if let Some(statement) = command.statement() {
                self.audit.on_query(&self.session, statement);
            }
            match command {
                ClientPacket::ChangeUser { user } => {
                    // Switching accounts would bypass the access check made
                    // for this connection
                    warn!(
                        "Client of session {} tried to change user to {:?}, closing the connection",
                        self.session.id, user
                    );
                    return Ok(());
                }
                ClientPacket::Quit => return Ok(()),
                _ => {}
            }
            server.write_all(&packet.to_bytes()).await?;
            server.flush().await?;
        }
        Ok(())
    }
}

async fn receive_from_server(
    server: ReadHalf<BackendStream>,
    mut client: WriteHalf<Box<dyn ClientStream>>,
    peers: Arc<Peers>,
    done: mpsc::Sender<ProxyError>,
) {
    let mut frames = FramedRead::new(server, PacketCodec::new());
    let result = relay_server_packets(&mut frames, &mut client).await;
    finish_relay("server", &peers, result, done).await;
}

async fn relay_server_packets(
    frames: &mut FramedRead<ReadHalf<BackendStream>, PacketCodec>,
    client: &mut WriteHalf<Box<dyn ClientStream>>,
) -> Result<()> {
    while let Some(packet) = frames.next().await {
        client.write_all(&packet?.to_bytes()).await?;
        client.flush().await?;
    }
    Ok(())
}
