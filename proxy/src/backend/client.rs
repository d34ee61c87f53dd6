//! MySQL client side of the connection phase
//!
//! Logs in to a database on behalf of a session and hands back the
//! authenticated stream for relaying.

use log::{debug, warn};
use rustls::ClientConfig;
use std::fmt;
use std::sync::Arc;

use crate::backend::stream::BackendStream;
use crate::error::{ProxyError, Result};
use crate::protocol::auth::{
    clear_password, AuthPlugin, CACHING_SHA2_FAST_AUTH_SUCCESS, CACHING_SHA2_PERFORM_FULL_AUTH,
    CACHING_SHA2_REQUEST_PUBLIC_KEY,
};
use crate::protocol::handshake::{
    encode_ssl_request, AuthSwitchRequest, ErrPacket, HandshakeResponse41, HandshakeV10,
    AUTH_MORE_DATA_HEADER, AUTH_SWITCH_HEADER, CLIENT_CONNECT_ATTRS, CLIENT_CONNECT_WITH_DB,
    CLIENT_DEPRECATE_EOF, CLIENT_PLUGIN_AUTH, CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA, CLIENT_PROTOCOL_41,
    CLIENT_SECURE_CONNECTION, CLIENT_SSL, DEFAULT_CHARACTER_SET, DEFAULT_MAX_PACKET_SIZE, ERR_HEADER,
    OK_HEADER, PROXY_CAPABILITIES,
};
use crate::protocol::packet::{read_packet, write_packet, Packet};

/// Upper bound on auth exchange round trips
const MAX_AUTH_ROUNDS: usize = 8;

/// Parameters for logging in to a database
pub struct ConnectOptions {
    /// Database address, `host:port`
    pub addr: String,

    /// Login name
    pub user: String,

    /// Password or token
    pub password: String,

    /// Initial database, empty for none
    pub database: String,

    /// TLS configuration and the name to verify, for an in-protocol upgrade
    pub tls: Option<(Arc<ClientConfig>, String)>,

    /// Pre-established stream used instead of dialing `addr`
    ///
    /// The stream is used as is: no in-protocol TLS upgrade happens on it.
    pub stream: Option<BackendStream>,

    /// Capabilities the client negotiated with the proxy
    pub client_capabilities: u32,
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("addr", &self.addr)
            .field("user", &self.user)
            .field("database", &self.database)
            .field("tls", &self.tls.as_ref().map(|(_, name)| name))
            .field("stream", &self.stream.is_some())
            .finish()
    }
}

/// An authenticated database connection
#[derive(Debug)]
pub struct BackendConn {
    stream: BackendStream,

    /// Server version from the greeting
    pub server_version: String,

    /// Server-side connection id
    pub connection_id: u32,

    /// Capabilities in effect on the connection
    pub capabilities: u32,
}

impl BackendConn {
    /// Take the stream for relaying
    pub fn into_stream(self) -> BackendStream {
        self.stream
    }
}

/// Log in to a MySQL database
pub async fn connect_mysql(opts: ConnectOptions) -> Result<BackendConn> {
    let byo_stream = opts.stream.is_some();
    let mut stream = match opts.stream {
        Some(stream) => stream,
        None => BackendStream::connect(&opts.addr).await?,
    };

    let greeting = read_packet(&mut stream).await?;
    let handshake = HandshakeV10::parse(&greeting.payload)?;
    debug!(
        "Connected to MySQL {} at {} (connection id {})",
        handshake.server_version, opts.addr, handshake.connection_id
    );

    let mut capabilities = (opts.client_capabilities & PROXY_CAPABILITIES
        | CLIENT_PROTOCOL_41
        | CLIENT_SECURE_CONNECTION
        | CLIENT_PLUGIN_AUTH
        | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
        | CLIENT_CONNECT_ATTRS)
        & handshake.capabilities;
    if opts.database.is_empty() {
        capabilities &= !CLIENT_CONNECT_WITH_DB;
    } else {
        capabilities |= CLIENT_CONNECT_WITH_DB & handshake.capabilities;
    }
    if opts.client_capabilities & CLIENT_DEPRECATE_EOF != 0 && capabilities & CLIENT_DEPRECATE_EOF == 0 {
        warn!(
            "MySQL server at {} does not support CLIENT_DEPRECATE_EOF, result sets may confuse the client",
            opts.addr
        );
    }

    let mut sequence_id = greeting.sequence_id.wrapping_add(1);
    if let (Some((config, server_name)), false) = (opts.tls, byo_stream) {
        if handshake.capabilities & CLIENT_SSL == 0 {
            return Err(ProxyError::Tls(format!("MySQL server at {} does not support TLS", opts.addr)));
        }
        capabilities |= CLIENT_SSL;
        let request = encode_ssl_request(capabilities, DEFAULT_MAX_PACKET_SIZE, DEFAULT_CHARACTER_SET);
        write_packet(&mut stream, &Packet::new(sequence_id, request)).await?;
        sequence_id = sequence_id.wrapping_add(1);

        stream = match stream {
            BackendStream::Plain(tcp) => BackendStream::upgrade(tcp, config, &server_name).await?,
            tls => tls,
        };
    }

    let mut plugin = AuthPlugin::from_name(&handshake.auth_plugin_name).unwrap_or(AuthPlugin::NativePassword);
    let mut scramble = handshake.scramble.clone();
    let auth_response = match plugin {
        // Never put a clear text secret in the first response unless asked
        AuthPlugin::ClearPassword if !stream.is_tls() => Vec::new(),
        _ => plugin.auth_response(&opts.password, &scramble),
    };

    let response = HandshakeResponse41 {
        capabilities,
        max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        character_set: DEFAULT_CHARACTER_SET,
        username: opts.user.clone(),
        auth_response,
        database: (!opts.database.is_empty()).then(|| opts.database.clone()),
        auth_plugin_name: Some(plugin.name().to_string()),
        connect_attrs: vec![("program_name".to_string(), "sqlgate".to_string())],
    };
    write_packet(&mut stream, &Packet::new(sequence_id, response.encode()?)).await?;

    for _ in 0..MAX_AUTH_ROUNDS {
        let reply = read_packet(&mut stream).await?;
        let next_id = reply.sequence_id.wrapping_add(1);

        match reply.payload.first().copied() {
            Some(OK_HEADER) => {
                return Ok(BackendConn {
                    stream,
                    server_version: handshake.server_version,
                    connection_id: handshake.connection_id,
                    capabilities,
                });
            }
            Some(ERR_HEADER) => return Err(ErrPacket::parse(&reply.payload)?.into_error()),
            Some(AUTH_SWITCH_HEADER) => {
                let switch = AuthSwitchRequest::parse(&reply.payload)?;
                plugin = AuthPlugin::from_name(&switch.plugin_name).ok_or_else(|| {
                    ProxyError::Protocol(format!("unsupported auth plugin {:?}", switch.plugin_name))
                })?;
                if plugin == AuthPlugin::ClearPassword && !stream.is_tls() {
                    return Err(ProxyError::Protocol(
                        "refusing to send a clear text password over an unencrypted connection".into(),
                    ));
                }
                debug!("MySQL server at {} switched auth to {}", opts.addr, plugin.name());
                scramble = switch.plugin_data;
                let data = plugin.auth_response(&opts.password, &scramble);
                write_packet(&mut stream, &Packet::new(next_id, data)).await?;
            }
            Some(AUTH_MORE_DATA_HEADER) if plugin == AuthPlugin::CachingSha2Password => {
                match reply.payload.get(1).copied() {
                    Some(CACHING_SHA2_FAST_AUTH_SUCCESS) => continue,
                    Some(CACHING_SHA2_PERFORM_FULL_AUTH) if stream.is_tls() => {
                        write_packet(&mut stream, &Packet::new(next_id, clear_password(&opts.password)))
                            .await?;
                    }
                    Some(CACHING_SHA2_PERFORM_FULL_AUTH) | Some(CACHING_SHA2_REQUEST_PUBLIC_KEY) => {
                        return Err(ProxyError::Protocol(
                            "caching_sha2_password full authentication requires TLS".into(),
                        ));
                    }
                    other => {
                        return Err(ProxyError::Protocol(format!(
                            "unexpected caching_sha2_password status {:?}",
                            other
                        )));
                    }
                }
            }
            other => {
                return Err(ProxyError::Protocol(format!(
                    "unexpected packet 0x{:02x} during authentication",
                    other.unwrap_or_default()
                )));
            }
        }
    }

    Err(ProxyError::Protocol("too many authentication round trips".into()))
}
