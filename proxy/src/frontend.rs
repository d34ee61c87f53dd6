//! Client side of the MySQL connection phase
//!
//! The proxy greets the client as a MySQL server, authenticates the principal
//! with `mysql_native_password` and stops right before the final OK, which the
//! engine sends once the database connection is up.

use bytes::{BufMut, BytesMut};
use log::{debug, error};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncWrite};

use sqlgate_core::models::Identity;

use crate::credentials::Secret;
use crate::error::{to_err_packet, ProxyError, Result};
use crate::protocol::auth::{generate_scramble, native_password_hash, verify_native_password, MYSQL_NATIVE_PASSWORD};
use crate::protocol::handshake::{
    is_ssl_request, HandshakeResponse41, HandshakeV10, AUTH_SWITCH_HEADER, CLIENT_PROTOCOL_41, CLIENT_SSL,
    DEFAULT_CHARACTER_SET, PROXY_CAPABILITIES, SERVER_STATUS_AUTOCOMMIT,
};
use crate::protocol::packet::{read_packet, write_packet, Packet};

/// Version string announced to clients
pub const SERVER_VERSION: &str = "8.0.36-sqlgate";

/// Separates the principal from the database account in the login name
pub const LOGIN_SEPARATOR: char = '/';

/// A principal allowed to log in to the proxy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    /// Proxy password
    pub password: Secret,

    /// Roles granted to the principal
    #[serde(default)]
    pub roles: Vec<String>,

    /// MFA device the principal verified with, if any
    #[serde(default)]
    pub mfa_device: Option<String>,
}

/// Result of a successful client login
#[derive(Debug, Clone)]
pub struct ClientLogin {
    /// Authenticated principal
    pub identity: Identity,

    /// Database account to log in as
    pub database_user: String,

    /// Initial database, empty for none
    pub database_name: String,

    /// Sequence id of the final OK or ERR reply
    pub next_sequence: u8,

    /// Capabilities in effect with the client
    pub capabilities: u32,
}

/// Split `principal[/db_user]`, defaulting the account to the principal
pub fn parse_login_name(login: &str) -> (String, String) {
    match login.split_once(LOGIN_SEPARATOR) {
        Some((principal, user)) if !user.is_empty() => (principal.to_string(), user.to_string()),
        Some((principal, _)) => (principal.to_string(), principal.to_string()),
        None => (login.to_string(), login.to_string()),
    }
}

/// Run the connection phase up to the final reply
///
/// Failures after the greeting are reported to the client with an ERR packet
/// before being returned.
pub async fn accept_client<S>(
    stream: &mut S,
    connection_id: u32,
    principals: &HashMap<String, Principal>,
) -> Result<ClientLogin>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let scramble = generate_scramble().to_vec();
    let greeting = HandshakeV10 {
        server_version: SERVER_VERSION.to_string(),
        connection_id,
        scramble: scramble.clone(),
        capabilities: PROXY_CAPABILITIES & !CLIENT_SSL,
        character_set: DEFAULT_CHARACTER_SET,
        status_flags: SERVER_STATUS_AUTOCOMMIT,
        auth_plugin_name: MYSQL_NATIVE_PASSWORD.to_string(),
    };
    write_packet(stream, &Packet::new(0, greeting.encode())).await?;

    let packet = read_packet(stream).await?;
    let mut reply_sequence = packet.sequence_id.wrapping_add(1);

    match authenticate(stream, &packet, &scramble, principals, &mut reply_sequence).await {
        Ok(mut login) => {
            login.next_sequence = reply_sequence;
            Ok(login)
        }
        Err(err) => {
            let reply = Packet::new(reply_sequence, to_err_packet(&err).encode());
            if let Err(e) = write_packet(stream, &reply).await {
                error!("Failed to send error to client: {}", e);
            }
            Err(err)
        }
    }
}

async fn authenticate<S>(
    stream: &mut S,
    packet: &Packet,
    scramble: &[u8],
    principals: &HashMap<String, Principal>,
    reply_sequence: &mut u8,
) -> Result<ClientLogin>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if is_ssl_request(&packet.payload) {
        return Err(ProxyError::Protocol("TLS connections to the proxy are not supported".into()));
    }
    let response = HandshakeResponse41::parse(&packet.payload)?;
    if response.capabilities & CLIENT_PROTOCOL_41 == 0 {
        return Err(ProxyError::Protocol("client does not support protocol 4.1".into()));
    }

    let mut auth_response = response.auth_response.clone();
    match response.auth_plugin_name.as_deref() {
        Some(plugin) if !plugin.is_empty() && plugin != MYSQL_NATIVE_PASSWORD => {
            debug!("Switching client from {} to {}", plugin, MYSQL_NATIVE_PASSWORD);
            let switch = Packet::new(*reply_sequence, auth_switch_request(scramble));
            write_packet(stream, &switch).await?;
            let answer = read_packet(stream).await?;
            *reply_sequence = answer.sequence_id.wrapping_add(1);
            auth_response = answer.payload.to_vec();
        }
        _ => {}
    }

    let (name, database_user) = parse_login_name(&response.username);
    let denied = || ProxyError::AccessDenied(format!("Access denied for user '{}'", response.username));
    let principal = principals.get(&name).ok_or_else(denied)?;

    let password = principal.password.resolve()?;
    let verified = if password.is_empty() {
        auth_response.is_empty()
    } else {
        verify_native_password(&auth_response, scramble, &native_password_hash(&password))
    };
    if !verified {
        return Err(denied());
    }

    let mut identity = Identity::new(name, principal.roles.clone());
    if let Some(device) = &principal.mfa_device {
        identity = identity.with_mfa_verified(device.clone());
    }
    debug!("Client authenticated as {} for database user {:?}", identity, database_user);

    Ok(ClientLogin {
        identity,
        database_user,
        database_name: response.database.unwrap_or_default(),
        next_sequence: *reply_sequence,
        capabilities: response.capabilities & PROXY_CAPABILITIES,
    })
}

fn auth_switch_request(scramble: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(2 + MYSQL_NATIVE_PASSWORD.len() + scramble.len());
    buf.put_u8(AUTH_SWITCH_HEADER);
    buf.put_slice(MYSQL_NATIVE_PASSWORD.as_bytes());
    buf.put_u8(0);
    buf.put_slice(scramble);
    buf.put_u8(0);
    buf
}
