use super::*;
use async_trait::async_trait;
use bytes::Bytes;
use proptest::prelude::*;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Notify};
use tokio::time::timeout;

use sqlgate_core::access::{AuthPreference, Role, RoleConditions, RoleSet};
use sqlgate_core::clock::SystemClock;
use sqlgate_core::error::CoreError;
use sqlgate_core::lease::{InMemoryLeaseManager, Lease, LeaseManager, LeaseRequest};
use sqlgate_core::models::{BackendKind, DatabaseSpec, Identity, TlsMode, TlsSettings};
use sqlgate_core::retry::LinearRetry;

use crate::audit::{MemoryAudit, SESSION_END_EVENT, SESSION_QUERY_EVENT, SESSION_START_EVENT};
use crate::backend::client::tests::{
    insecure_client_config, serve_login, serve_ssl_login, test_tls_acceptor, FakeAuth, Login,
};
use crate::error::{ER_ACCESS_DENIED_ERROR, ER_CON_COUNT_ERROR};
use crate::protocol::command::{COM_CHANGE_USER, COM_PING, COM_QUERY, COM_QUIT};
use crate::protocol::handshake::{is_ok_packet, ErrPacket, CLIENT_SSL, PROXY_CAPABILITIES};
use crate::protocol::packet::read_packet;

const IO_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct FakeCredentials {
    require_session_mfa: bool,
    cloud_sql_calls: AtomicUsize,
    tls: Option<Arc<rustls::ClientConfig>>,
}

#[async_trait]
impl CredentialProvider for FakeCredentials {
    async fn get_auth_preference(&self) -> Result<AuthPreference> {
        Ok(AuthPreference {
            require_session_mfa: self.require_session_mfa,
        })
    }

    async fn get_tls_config(&self, _session: &Session) -> Result<Option<Arc<rustls::ClientConfig>>> {
        Ok(self.tls.clone())
    }

    async fn get_static_password(&self, _session: &Session) -> Result<String> {
        Ok("static-pw".into())
    }

    async fn get_rds_auth_token(&self, _session: &Session) -> Result<String> {
        Ok("rds-token".into())
    }

    async fn get_cloud_sql_password(&self, _session: &Session) -> Result<String> {
        self.cloud_sql_calls.fetch_add(1, Ordering::SeqCst);
        Ok("cloud-pw".into())
    }

    async fn get_azure_access_token(&self, _session: &Session) -> Result<String> {
        Ok("azure-token".into())
    }
}

/// Lease manager reporting the resource as busy for the first few attempts
struct FlakyLeases {
    inner: InMemoryLeaseManager,
    failures: usize,
    attempts: AtomicUsize,
    cancelled: AtomicUsize,
}

impl FlakyLeases {
    fn new(failures: usize) -> Self {
        Self {
            inner: InMemoryLeaseManager::new(Arc::new(SystemClock)),
            failures,
            attempts: AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl LeaseManager for FlakyLeases {
    async fn acquire_lease(&self, request: &LeaseRequest) -> sqlgate_core::Result<Lease> {
        if self.attempts.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(CoreError::LimitExceeded("lease is held".into()));
        }
        self.inner.acquire_lease(request).await
    }

    async fn cancel_lease(&self, lease: &Lease) -> sqlgate_core::Result<()> {
        self.cancelled.fetch_add(1, Ordering::SeqCst);
        self.inner.cancel_lease(lease).await
    }
}

/// Loopback MySQL server counting connection attempts
struct FakeDatabase {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    logins: mpsc::Receiver<(TcpStream, Login)>,
}

impl FakeDatabase {
    async fn start(auth: FakeAuth) -> Self {
        Self::start_gated(auth, None).await
    }

    /// Holds the greeting until `gate` is notified
    async fn start_gated(auth: FakeAuth, gate: Option<Arc<Notify>>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let (tx, logins) = mpsc::channel(4);

        let counter = accepted.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                if let Some(gate) = &gate {
                    gate.notified().await;
                }
                let login = serve_login(socket, auth.clone()).await;
                if tx.send(login).await.is_err() {
                    break;
                }
            }
        });

        Self { addr, accepted, logins }
    }

    async fn next_login(&mut self) -> (TcpStream, Login) {
        timeout(IO_TIMEOUT, self.logins.recv()).await.unwrap().unwrap()
    }

    fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

struct Harness {
    audit: Arc<MemoryAudit>,
    credentials: Arc<FakeCredentials>,
    leases: Arc<dyn LeaseManager>,
    connect_timeout: Duration,
}

impl Harness {
    fn new() -> Self {
        Self::with_leases(Arc::new(InMemoryLeaseManager::new(Arc::new(SystemClock))))
    }

    fn with_leases(leases: Arc<dyn LeaseManager>) -> Self {
        Self {
            audit: Arc::new(MemoryAudit::new()),
            credentials: Arc::new(FakeCredentials::default()),
            leases,
            connect_timeout: IO_TIMEOUT,
        }
    }

    fn engine(&self) -> Engine {
        let connector = BackendConnector::new(
            self.credentials.clone(),
            self.leases.clone(),
            Arc::new(SystemClock),
            self.connect_timeout,
        )
        .with_lease_retry(LinearRetry::new(Duration::from_millis(10), Duration::from_millis(10)));
        Engine::new(
            EngineConfig::default(),
            EngineDeps {
                connector,
                credentials: self.credentials.clone(),
                audit: self.audit.clone(),
            },
        )
    }

    /// Engine bound to one end of an in-memory client connection
    fn bound_engine(&self) -> (Engine, DuplexStream) {
        let (client, proxy_side) = duplex(64 * 1024);
        let mut engine = self.engine();
        engine
            .initialize_connection(Box::new(proxy_side), 2, PROXY_CAPABILITIES)
            .unwrap();
        (engine, client)
    }

    fn event_names(&self) -> Vec<String> {
        self.audit.events().into_iter().map(|e| e.event).collect()
    }
}

fn session(database: DatabaseSpec, database_user: &str) -> Session {
    let role = Role {
        name: "dev".into(),
        allow: RoleConditions {
            db_services: vec!["*".into()],
            db_users: vec!["app".into(), "alice".into()],
            db_names: vec![],
        },
        ..Default::default()
    };
    Session::new(
        Identity::new("alice", vec!["dev".into()]),
        Arc::new(database),
        database_user,
        "sales",
        Arc::new(RoleSet::new(vec![role])),
    )
    .with_client_addr("127.0.0.1:50000".parse().unwrap())
}

fn command(sequence_id: u8, command: u8, body: &[u8]) -> Packet {
    let mut payload = vec![command];
    payload.extend_from_slice(body);
    Packet::new(sequence_id, payload)
}

async fn read_client_packet(client: &mut DuplexStream) -> Packet {
    timeout(IO_TIMEOUT, read_packet(client)).await.unwrap().unwrap()
}

/// Start a session and wait for the OK packet
async fn start_session(
    harness: &Harness,
    session: Session,
) -> (DuplexStream, tokio::task::JoinHandle<Result<()>>, CancellationToken) {
    let (mut engine, mut client) = harness.bound_engine();
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let handle = tokio::spawn(async move { engine.handle_connection(token, &session).await });

    let ok = read_client_packet(&mut client).await;
    assert!(is_ok_packet(&ok.payload));
    assert_eq!(ok.sequence_id, 2);
    (client, handle, cancel)
}

/// Loopback MySQL server serving one login over TLS
///
/// With `ssl_request` the greeting is plain text and TLS starts after the
/// client's SSL request, otherwise TLS starts with the first byte.
async fn start_tls_database(ssl_request: bool, auth: FakeAuth) -> (SocketAddr, tokio::task::JoinHandle<Login>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let acceptor = test_tls_acceptor();
        if ssl_request {
            serve_ssl_login(socket, &acceptor, auth).await.1
        } else {
            let tls = acceptor.accept(socket).await.unwrap();
            serve_login(tls, auth).await.1
        }
    });
    (addr, handle)
}

fn cloud_sql(addr: SocketAddr, mode: TlsMode) -> DatabaseSpec {
    DatabaseSpec::new("orders", addr.to_string())
        .with_kind(BackendKind::CloudSql {
            project_id: "acme".into(),
            instance_id: "orders-1".into(),
        })
        .with_tls(TlsSettings {
            mode,
            ..Default::default()
        })
}

async fn read_to_end(socket: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    timeout(IO_TIMEOUT, socket.read_to_end(&mut buf)).await.unwrap().unwrap();
    buf
}

#[tokio::test]
async fn test_access_denied_is_audited_without_connecting() {
    let harness = Harness::new();
    let db = FakeDatabase::start(FakeAuth::Native("static-pw".into())).await;
    let (mut engine, mut client) = harness.bound_engine();
    let s = session(DatabaseSpec::new("orders", db.addr.to_string()), "root");

    let err = engine.handle_connection(CancellationToken::new(), &s).await.unwrap_err();
    assert!(matches!(err, ProxyError::AccessDenied(_)));
    assert_eq!(db.accepted(), 0);

    let events = harness.audit.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event, SESSION_START_EVENT);
    assert!(!events[0].success);

    engine.send_error(&err).await;
    let packet = read_client_packet(&mut client).await;
    assert_eq!(packet.sequence_id, 2);
    assert_eq!(ErrPacket::parse(&packet.payload).unwrap().code, ER_ACCESS_DENIED_ERROR);
}

#[tokio::test]
async fn test_session_mfa_required() {
    let mut harness = Harness::new();
    harness.credentials = Arc::new(FakeCredentials {
        require_session_mfa: true,
        ..Default::default()
    });
    let (mut engine, _client) = harness.bound_engine();
    let s = session(DatabaseSpec::new("orders", "127.0.0.1:1"), "app");

    let err = engine.handle_connection(CancellationToken::new(), &s).await.unwrap_err();
    assert!(err.to_string().contains("MFA"));
    assert_eq!(harness.event_names(), vec![SESSION_START_EVENT]);
}

#[tokio::test]
async fn test_initialize_twice_fails() {
    let harness = Harness::new();
    let (mut engine, _client) = harness.bound_engine();
    let (_other, proxy_side) = duplex(1024);
    assert!(engine
        .initialize_connection(Box::new(proxy_side), 2, PROXY_CAPABILITIES)
        .is_err());
}

#[tokio::test]
async fn test_ok_only_after_backend_is_connected() {
    let harness = Harness::new();
    let gate = Arc::new(Notify::new());
    let mut db = FakeDatabase::start_gated(FakeAuth::Native("static-pw".into()), Some(gate.clone())).await;
    let (mut engine, mut client) = harness.bound_engine();
    let s = session(DatabaseSpec::new("orders", db.addr.to_string()), "app");
    let handle = tokio::spawn(async move { engine.handle_connection(CancellationToken::new(), &s).await });

    // The database has not greeted yet, so the client must not hear anything
    let mut byte = [0u8; 1];
    assert!(timeout(Duration::from_millis(200), client.read(&mut byte)).await.is_err());
    assert!(harness.audit.events().is_empty());

    gate.notify_one();
    let ok = read_client_packet(&mut client).await;
    assert!(is_ok_packet(&ok.payload));

    let (server, login) = db.next_login().await;
    assert_eq!(login.username, "app");
    assert_eq!(login.database.as_deref(), Some("sales"));
    drop(server);

    timeout(IO_TIMEOUT, handle).await.unwrap().unwrap().unwrap();
    assert_eq!(harness.event_names(), vec![SESSION_START_EVENT, SESSION_END_EVENT]);
}

#[tokio::test]
async fn test_relay_audits_queries_and_stops_on_quit() {
    let harness = Harness::new();
    let mut db = FakeDatabase::start(FakeAuth::Native("static-pw".into())).await;
    let s = session(DatabaseSpec::new("orders", db.addr.to_string()), "app");
    let (mut client, handle, _cancel) = start_session(&harness, s).await;
    let (mut server, _) = db.next_login().await;

    let query = command(0, COM_QUERY, b"select * from orders");
    write_packet(&mut client, &query).await.unwrap();
    let forwarded = timeout(IO_TIMEOUT, read_packet(&mut server)).await.unwrap().unwrap();
    assert_eq!(forwarded.to_bytes(), query.to_bytes());

    let ping = command(0, COM_PING, b"");
    write_packet(&mut client, &ping).await.unwrap();
    let forwarded = timeout(IO_TIMEOUT, read_packet(&mut server)).await.unwrap().unwrap();
    assert_eq!(forwarded.payload, ping.payload);

    // Server replies are passed through untouched
    let reply = Packet::new(1, Bytes::from_static(b"\x00\x00\x00\x02\x00\x00\x00"));
    write_packet(&mut server, &reply).await.unwrap();
    assert_eq!(read_client_packet(&mut client).await, reply);

    write_packet(&mut client, &command(0, COM_QUIT, b"")).await.unwrap();
    timeout(IO_TIMEOUT, handle).await.unwrap().unwrap().unwrap();

    // Quit is not forwarded and the database connection is closed
    assert!(read_to_end(&mut server).await.is_empty());

    let queries = harness.audit.events_named(SESSION_QUERY_EVENT);
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0].query.as_deref(), Some("select * from orders"));
    assert_eq!(
        harness.event_names(),
        vec![SESSION_START_EVENT, SESSION_QUERY_EVENT, SESSION_END_EVENT]
    );
}

#[tokio::test]
async fn test_change_user_is_not_forwarded() {
    let harness = Harness::new();
    let mut db = FakeDatabase::start(FakeAuth::Native("static-pw".into())).await;
    let s = session(DatabaseSpec::new("orders", db.addr.to_string()), "app");
    let (mut client, handle, _cancel) = start_session(&harness, s).await;
    let (mut server, _) = db.next_login().await;

    write_packet(&mut client, &command(0, COM_CHANGE_USER, b"root\0")).await.unwrap();
    timeout(IO_TIMEOUT, handle).await.unwrap().unwrap().unwrap();

    assert!(read_to_end(&mut server).await.is_empty());
    let mut rest = Vec::new();
    timeout(IO_TIMEOUT, client.read_to_end(&mut rest)).await.unwrap().unwrap();
    assert!(rest.is_empty());
    assert_eq!(harness.event_names().last().map(String::as_str), Some(SESSION_END_EVENT));
}

#[tokio::test]
async fn test_server_close_ends_session() {
    let harness = Harness::new();
    let mut db = FakeDatabase::start(FakeAuth::Native("static-pw".into())).await;
    let s = session(DatabaseSpec::new("orders", db.addr.to_string()), "app");
    let (mut client, handle, _cancel) = start_session(&harness, s).await;
    let (server, _) = db.next_login().await;

    drop(server);
    timeout(IO_TIMEOUT, handle).await.unwrap().unwrap().unwrap();

    let mut rest = Vec::new();
    timeout(IO_TIMEOUT, client.read_to_end(&mut rest)).await.unwrap().unwrap();
    assert!(rest.is_empty());
    assert_eq!(harness.event_names(), vec![SESSION_START_EVENT, SESSION_END_EVENT]);
}

#[tokio::test]
async fn test_truncated_server_frame_ends_session() {
    let harness = Harness::new();
    let mut db = FakeDatabase::start(FakeAuth::Native("static-pw".into())).await;
    let s = session(DatabaseSpec::new("orders", db.addr.to_string()), "app");
    let (mut client, handle, _cancel) = start_session(&harness, s).await;
    let (mut server, _) = db.next_login().await;

    // Header promises ten bytes but only two arrive before the close
    server.write_all(&[10, 0, 0, 1, 0xAA, 0xBB]).await.unwrap();
    drop(server);
    timeout(IO_TIMEOUT, handle).await.unwrap().unwrap().unwrap();

    let mut rest = Vec::new();
    timeout(IO_TIMEOUT, client.read_to_end(&mut rest)).await.unwrap().unwrap();
    assert!(rest.is_empty());
    assert_eq!(harness.audit.events_named(SESSION_END_EVENT).len(), 1);
    assert_eq!(harness.event_names(), vec![SESSION_START_EVENT, SESSION_END_EVENT]);
}

#[tokio::test]
async fn test_finish_relay_reports_only_unexpected_failures() {
    let peers = Peers {
        client: "127.0.0.1:50000".into(),
        server: "127.0.0.1:3306".into(),
    };

    let (tx, mut rx) = mpsc::channel(1);
    finish_relay("server", &peers, Err(ProxyError::Protocol("bad frame".into())), tx).await;
    assert!(matches!(rx.recv().await, Some(ProxyError::Protocol(_))));
    assert!(rx.recv().await.is_none());

    let (tx, mut rx) = mpsc::channel(1);
    let eof = ProxyError::Io(std::io::ErrorKind::UnexpectedEof.into());
    finish_relay("server", &peers, Err(eof), tx).await;
    assert!(rx.recv().await.is_none());

    let (tx, mut rx) = mpsc::channel(1);
    finish_relay("client", &peers, Ok(()), tx).await;
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn test_client_close_ends_session() {
    let harness = Harness::new();
    let mut db = FakeDatabase::start(FakeAuth::Native("static-pw".into())).await;
    let s = session(DatabaseSpec::new("orders", db.addr.to_string()), "app");
    let (client, handle, _cancel) = start_session(&harness, s).await;
    let (mut server, _) = db.next_login().await;

    drop(client);
    timeout(IO_TIMEOUT, handle).await.unwrap().unwrap().unwrap();
    assert!(read_to_end(&mut server).await.is_empty());
}

#[tokio::test]
async fn test_cancel_ends_session() {
    let harness = Harness::new();
    let mut db = FakeDatabase::start(FakeAuth::Native("static-pw".into())).await;
    let s = session(DatabaseSpec::new("orders", db.addr.to_string()), "app");
    let (_client, handle, cancel) = start_session(&harness, s).await;
    let (mut server, _) = db.next_login().await;

    cancel.cancel();
    timeout(IO_TIMEOUT, handle).await.unwrap().unwrap().unwrap();
    assert!(read_to_end(&mut server).await.is_empty());
    assert_eq!(harness.event_names(), vec![SESSION_START_EVENT, SESSION_END_EVENT]);
}

#[tokio::test]
async fn test_oversized_client_packet_ends_session() {
    let harness = Harness::new();
    let mut db = FakeDatabase::start(FakeAuth::Native("static-pw".into())).await;
    let (client, proxy_side) = duplex(64 * 1024);
    let mut engine = harness.engine();
    engine.config.max_packet_size = 16;
    engine
        .initialize_connection(Box::new(proxy_side), 2, PROXY_CAPABILITIES)
        .unwrap();
    let s = session(DatabaseSpec::new("orders", db.addr.to_string()), "app");
    let handle = tokio::spawn(async move { engine.handle_connection(CancellationToken::new(), &s).await });

    let mut client = client;
    read_client_packet(&mut client).await;
    let (mut server, _) = db.next_login().await;

    write_packet(&mut client, &command(0, COM_QUERY, &[b'x'; 64])).await.unwrap();
    timeout(IO_TIMEOUT, handle).await.unwrap().unwrap().unwrap();
    assert!(read_to_end(&mut server).await.is_empty());
    assert!(harness.audit.events_named(SESSION_QUERY_EVENT).is_empty());
}

#[tokio::test]
async fn test_throttled_database_asks_to_retry_later() {
    let harness = Harness::new();
    let db = FakeDatabase::start(FakeAuth::Reject(1040, "Too many connections".into())).await;
    let (mut engine, mut client) = harness.bound_engine();
    let s = session(DatabaseSpec::new("orders", db.addr.to_string()), "app");

    let err = engine.handle_connection(CancellationToken::new(), &s).await.unwrap_err();
    assert!(matches!(&err, ProxyError::LimitExceeded(msg) if msg == TRY_AGAIN_LATER));

    engine.send_error(&err).await;
    let packet = ErrPacket::parse(&read_client_packet(&mut client).await.payload).unwrap();
    assert_eq!(packet.code, ER_CON_COUNT_ERROR);
    assert_eq!(packet.message, TRY_AGAIN_LATER);
    assert!(harness.audit.events().is_empty());
}

#[tokio::test]
async fn test_rds_access_denied_is_actionable() {
    let harness = Harness::new();
    let db = FakeDatabase::start(FakeAuth::Native("other-token".into())).await;
    let (mut engine, _client) = harness.bound_engine();
    let database = DatabaseSpec::new("orders", db.addr.to_string()).with_kind(BackendKind::Rds {
        region: "us-east-1".into(),
        account_id: "123456789012".into(),
        resource_id: "db-ABCDEFGH".into(),
    });
    let s = session(database, "app");

    let err = engine.handle_connection(CancellationToken::new(), &s).await.unwrap_err();
    match err {
        ProxyError::BackendAccessDenied(message) => {
            assert!(message.contains("\"app\""));
            assert!(message.contains("rds-db:connect"));
            assert!(message.contains("db-ABCDEFGH"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_azure_login_is_qualified_with_server_name() {
    let harness = Harness::new();
    let mut db = FakeDatabase::start(FakeAuth::Native("azure-token".into())).await;
    let database = DatabaseSpec::new("orders", db.addr.to_string()).with_kind(BackendKind::Azure {
        server_name: "my-server".into(),
    });
    let (_client, _handle, _cancel) = start_session(&harness, session(database, "alice")).await;

    let (_server, login) = db.next_login().await;
    assert_eq!(login.username, "alice@my-server");
}

#[tokio::test]
async fn test_cloud_sql_password_rotation_holds_lease() {
    let leases = Arc::new(FlakyLeases::new(2));
    let harness = Harness::with_leases(leases.clone());
    let mut db = FakeDatabase::start(FakeAuth::Native("cloud-pw".into())).await;
    let database = DatabaseSpec::new("orders", db.addr.to_string()).with_kind(BackendKind::CloudSql {
        project_id: "acme".into(),
        instance_id: "orders-1".into(),
    });
    let (_client, _handle, _cancel) = start_session(&harness, session(database, "app")).await;

    let (_server, login) = db.next_login().await;
    assert_eq!(login.username, "app");
    assert_eq!(leases.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(harness.credentials.cloud_sql_calls.load(Ordering::SeqCst), 1);
    assert_eq!(db.accepted(), 1);

    // Released right after the login, not at the end of the session
    assert_eq!(leases.cancelled.load(Ordering::SeqCst), 1);
    assert_eq!(leases.inner.active_leases("provider-token", "orders+app"), 0);
}

#[tokio::test]
async fn test_cloud_sql_logs_in_over_tls_side_channel() {
    let leases = Arc::new(FlakyLeases::new(0));
    let mut harness = Harness::with_leases(leases.clone());
    harness.credentials = Arc::new(FakeCredentials {
        tls: Some(insecure_client_config()),
        ..Default::default()
    });
    let (addr, db) = start_tls_database(false, FakeAuth::Native("cloud-pw".into())).await;
    let database = cloud_sql(addr, TlsMode::VerifyCa);
    let (_client, handle, _cancel) = start_session(&harness, session(database, "app")).await;

    // TLS from the first byte, so the login never asked for an upgrade
    let login = timeout(IO_TIMEOUT, db).await.unwrap().unwrap();
    assert_eq!(login.username, "app");
    assert_eq!(login.capabilities & CLIENT_SSL, 0);
    assert_eq!(leases.cancelled.load(Ordering::SeqCst), 1);
    assert_eq!(leases.inner.active_leases("provider-token", "orders+app"), 0);

    timeout(IO_TIMEOUT, handle).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_cloud_sql_insecure_mode_upgrades_in_protocol() {
    let leases = Arc::new(FlakyLeases::new(0));
    let mut harness = Harness::with_leases(leases.clone());
    harness.credentials = Arc::new(FakeCredentials {
        tls: Some(insecure_client_config()),
        ..Default::default()
    });
    let (addr, db) = start_tls_database(true, FakeAuth::Native("cloud-pw".into())).await;
    let database = cloud_sql(addr, TlsMode::Insecure);
    let (_client, handle, _cancel) = start_session(&harness, session(database, "app")).await;

    // The only connection greeted in plain text and got an SSL request
    let login = timeout(IO_TIMEOUT, db).await.unwrap().unwrap();
    assert_ne!(login.capabilities & CLIENT_SSL, 0);
    assert_eq!(leases.cancelled.load(Ordering::SeqCst), 1);

    timeout(IO_TIMEOUT, handle).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_cloud_sql_lease_timeout_asks_to_retry_later() {
    let leases = Arc::new(FlakyLeases::new(usize::MAX));
    let mut harness = Harness::with_leases(leases.clone());
    harness.connect_timeout = Duration::from_millis(100);
    let db = FakeDatabase::start(FakeAuth::Native("cloud-pw".into())).await;
    let database = DatabaseSpec::new("orders", db.addr.to_string()).with_kind(BackendKind::CloudSql {
        project_id: "acme".into(),
        instance_id: "orders-1".into(),
    });
    let (mut engine, _client) = harness.bound_engine();

    let err = engine
        .handle_connection(CancellationToken::new(), &session(database, "app"))
        .await
        .unwrap_err();
    assert!(matches!(&err, ProxyError::LimitExceeded(msg) if msg == TRY_AGAIN_LATER));
    assert_eq!(db.accepted(), 0);
    assert_eq!(harness.credentials.cloud_sql_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_cancel_while_connecting() {
    let harness = Harness::new();
    let gate = Arc::new(Notify::new());
    let db = FakeDatabase::start_gated(FakeAuth::Native("static-pw".into()), Some(gate)).await;
    let (mut engine, _client) = harness.bound_engine();
    let s = session(DatabaseSpec::new("orders", db.addr.to_string()), "app");
    let cancel = CancellationToken::new();

    let (started_tx, started_rx) = oneshot::channel();
    let token = cancel.clone();
    let handle = tokio::spawn(async move {
        let _ = started_tx.send(());
        engine.handle_connection(token, &s).await
    });
    started_rx.await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let err = timeout(IO_TIMEOUT, handle).await.unwrap().unwrap().unwrap_err();
    assert!(matches!(err, ProxyError::Cancelled));
    assert!(harness.audit.events().is_empty());
}

/// Relays a batch of statements and returns what the database received
fn relay_statements(statements: Vec<String>) -> (Vec<u8>, Vec<u8>) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(async move {
        let harness = Harness::new();
        let mut db = FakeDatabase::start(FakeAuth::Native("static-pw".into())).await;
        let s = session(DatabaseSpec::new("orders", db.addr.to_string()), "app");
        let (mut client, handle, _cancel) = start_session(&harness, s).await;
        let (mut server, _) = db.next_login().await;

        let mut sent = Vec::new();
        for statement in &statements {
            let packet = command(0, COM_QUERY, statement.as_bytes());
            sent.extend_from_slice(&packet.to_bytes());
            write_packet(&mut client, &packet).await.unwrap();
        }
        write_packet(&mut client, &command(0, COM_QUIT, b"")).await.unwrap();
        handle.await.unwrap().unwrap();

        (sent, read_to_end(&mut server).await)
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_statements_reach_database_unchanged(statements in prop::collection::vec(".{0,200}", 1..8)) {
        let (sent, received) = relay_statements(statements);
        prop_assert_eq!(sent, received);
    }
}
