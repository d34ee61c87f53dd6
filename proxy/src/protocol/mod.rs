//! MySQL wire protocol implementation
//!
//! This module provides the subset of the MySQL client/server protocol the
//! proxy needs: packet framing, the connection phase handshake and the
//! classification of client commands. Everything else is relayed opaquely.

/// Packet framing
pub mod packet;

/// Client command classification
pub mod command;

/// Connection phase packets
pub mod handshake;

/// Authentication plugins
pub mod auth;

// Re-export common types
pub use self::auth::AuthPlugin;
pub use self::command::ClientPacket;
pub use self::handshake::{ErrPacket, HandshakeResponse41, HandshakeV10, OkPacket};
pub use self::packet::{read_packet, write_packet, Packet, PacketCodec, PacketHeader};
