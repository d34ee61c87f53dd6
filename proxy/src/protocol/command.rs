//! Client command classification
//!
//! Only the commands that change what the proxy does are decoded. Everything
//! else is `Other` and is relayed without being looked at.

use super::packet::Packet;

/// Close the connection
pub const COM_QUIT: u8 = 0x01;
/// Switch the default database
pub const COM_INIT_DB: u8 = 0x02;
/// Run a text statement
pub const COM_QUERY: u8 = 0x03;
/// Check that the server is alive
pub const COM_PING: u8 = 0x0e;
/// Re-authenticate the connection as another account
pub const COM_CHANGE_USER: u8 = 0x11;
/// Prepare a statement
pub const COM_STMT_PREPARE: u8 = 0x16;

/// A client packet as seen by the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientPacket {
    /// COM_QUERY with its statement text
    Query(String),

    /// COM_STMT_PREPARE with its statement text
    Prepare(String),

    /// COM_CHANGE_USER with the requested account
    ChangeUser {
        /// Account the client asked to switch to, empty if unreadable
        user: String,
    },

    /// COM_QUIT
    Quit,

    /// Anything else, relayed verbatim
    Other,
}

impl ClientPacket {
    /// Classify a client packet
    ///
    /// COM_CHANGE_USER and COM_QUIT are recognized from the command byte
    /// alone, so a malformed body never lets them through as `Other`.
    pub fn parse(packet: &Packet) -> Self {
        let command = match packet.command() {
            Some(command) => command,
            None => return ClientPacket::Other,
        };
        let body = &packet.payload[1..];

        match command {
            COM_QUERY => ClientPacket::Query(String::from_utf8_lossy(body).into_owned()),
            COM_STMT_PREPARE => ClientPacket::Prepare(String::from_utf8_lossy(body).into_owned()),
            COM_CHANGE_USER => {
                let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
                ClientPacket::ChangeUser {
                    user: String::from_utf8_lossy(&body[..end]).into_owned(),
                }
            }
            COM_QUIT => ClientPacket::Quit,
            _ => ClientPacket::Other,
        }
    }

    /// Statement text of an auditable command
    pub fn statement(&self) -> Option<&str> {
        match self {
            ClientPacket::Query(text) | ClientPacket::Prepare(text) => Some(text),
            _ => None,
        }
    }
}
