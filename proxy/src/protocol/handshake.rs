//! MySQL connection phase packets
//!
//! Reference: <https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_connection_phase.html>

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ProxyError, Result};

/// Use the improved old password scheme
pub const CLIENT_LONG_PASSWORD: u32 = 0x0000_0001;
/// Report found rows instead of affected rows
pub const CLIENT_FOUND_ROWS: u32 = 0x0000_0002;
/// Full column flags
pub const CLIENT_LONG_FLAG: u32 = 0x0000_0004;
/// Database name in the handshake response
pub const CLIENT_CONNECT_WITH_DB: u32 = 0x0000_0008;
/// LOAD DATA LOCAL support
pub const CLIENT_LOCAL_FILES: u32 = 0x0000_0080;
/// 4.1 protocol
pub const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
/// Switch to TLS after the greeting
pub const CLIENT_SSL: u32 = 0x0000_0800;
/// Transaction status in OK packets
pub const CLIENT_TRANSACTIONS: u32 = 0x0000_2000;
/// 4.1 authentication
pub const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
/// Multiple statements per COM_QUERY
pub const CLIENT_MULTI_STATEMENTS: u32 = 0x0001_0000;
/// Multiple result sets
pub const CLIENT_MULTI_RESULTS: u32 = 0x0002_0000;
/// Multiple result sets for prepared statements
pub const CLIENT_PS_MULTI_RESULTS: u32 = 0x0004_0000;
/// Pluggable authentication
pub const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;
/// Connection attributes
pub const CLIENT_CONNECT_ATTRS: u32 = 0x0010_0000;
/// Length-encoded auth response
pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 0x0020_0000;
/// Session state tracking in OK packets
pub const CLIENT_SESSION_TRACK: u32 = 0x0080_0000;
/// OK packets replace EOF packets
pub const CLIENT_DEPRECATE_EOF: u32 = 0x0100_0000;

/// Capabilities the proxy offers clients and requests from databases
pub const PROXY_CAPABILITIES: u32 = CLIENT_LONG_PASSWORD
    | CLIENT_FOUND_ROWS
    | CLIENT_LONG_FLAG
    | CLIENT_CONNECT_WITH_DB
    | CLIENT_LOCAL_FILES
    | CLIENT_PROTOCOL_41
    | CLIENT_TRANSACTIONS
    | CLIENT_SECURE_CONNECTION
    | CLIENT_MULTI_STATEMENTS
    | CLIENT_MULTI_RESULTS
    | CLIENT_PS_MULTI_RESULTS
    | CLIENT_PLUGIN_AUTH
    | CLIENT_CONNECT_ATTRS
    | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
    | CLIENT_DEPRECATE_EOF;

/// Autocommit is enabled
pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;

/// utf8mb4_general_ci
pub const DEFAULT_CHARACTER_SET: u8 = 45;

/// Maximum packet size announced to databases
pub const DEFAULT_MAX_PACKET_SIZE: u32 = 0x0100_0000;

/// First byte of an OK packet
pub const OK_HEADER: u8 = 0x00;
/// First byte of an auth-more-data packet
pub const AUTH_MORE_DATA_HEADER: u8 = 0x01;
/// First byte of an auth switch request (and of legacy EOF packets)
pub const AUTH_SWITCH_HEADER: u8 = 0xFE;
/// First byte of an ERR packet
pub const ERR_HEADER: u8 = 0xFF;

/// Length of an SSL request packet
const SSL_REQUEST_LEN: usize = 32;

/// Whether a payload is an OK packet
pub fn is_ok_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&OK_HEADER)
}

/// Whether a payload is an ERR packet
pub fn is_err_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&ERR_HEADER)
}

/// Bounds-checked reader over a packet payload
pub(crate) struct PayloadReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub(crate) fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(ProxyError::Protocol(format!(
                "truncated packet: wanted {} bytes, {} left",
                n,
                self.remaining()
            )));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn rest(&mut self) -> &'a [u8] {
        let out = &self.data[self.pos..];
        self.pos = self.data.len();
        out
    }

    /// Null-terminated string, or the rest of the payload if unterminated
    pub(crate) fn null_str(&mut self) -> String {
        let rest = &self.data[self.pos..];
        match rest.iter().position(|&b| b == 0) {
            Some(end) => {
                self.pos += end + 1;
                String::from_utf8_lossy(&rest[..end]).into_owned()
            }
            None => {
                self.pos = self.data.len();
                String::from_utf8_lossy(rest).into_owned()
            }
        }
    }

    pub(crate) fn lenenc_int(&mut self) -> Result<u64> {
        match self.u8()? {
            n @ 0x00..=0xFA => Ok(n as u64),
            0xFC => Ok(self.u16()? as u64),
            0xFD => {
                let b = self.bytes(3)?;
                Ok(u32::from_le_bytes([b[0], b[1], b[2], 0]) as u64)
            }
            0xFE => {
                let b = self.bytes(8)?;
                let mut buf = [0u8; 8];
                buf.copy_from_slice(b);
                Ok(u64::from_le_bytes(buf))
            }
            other => Err(ProxyError::Protocol(format!(
                "invalid length-encoded integer prefix 0x{:02x}",
                other
            ))),
        }
    }

    pub(crate) fn lenenc_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.lenenc_int()? as usize;
        self.bytes(len)
    }
}

/// Append a length-encoded integer
pub fn put_lenenc_int(buf: &mut BytesMut, value: u64) {
    match value {
        0..=0xFA => buf.put_u8(value as u8),
        0xFB..=0xFFFF => {
            buf.put_u8(0xFC);
            buf.put_u16_le(value as u16);
        }
        0x1_0000..=0xFF_FFFF => {
            buf.put_u8(0xFD);
            buf.put_slice(&(value as u32).to_le_bytes()[..3]);
        }
        _ => {
            buf.put_u8(0xFE);
            buf.put_u64_le(value);
        }
    }
}

fn put_lenenc_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    put_lenenc_int(buf, bytes.len() as u64);
    buf.put_slice(bytes);
}

fn put_null_str(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Initial server greeting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeV10 {
    /// Server version string
    pub server_version: String,

    /// Connection id
    pub connection_id: u32,

    /// Auth plugin data, 20 bytes for the built-in plugins
    pub scramble: Vec<u8>,

    /// Server capabilities
    pub capabilities: u32,

    /// Default character set
    pub character_set: u8,

    /// Server status flags
    pub status_flags: u16,

    /// Default auth plugin
    pub auth_plugin_name: String,
}

impl HandshakeV10 {
    /// Encode the greeting payload
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(128);
        buf.put_u8(10);
        put_null_str(&mut buf, &self.server_version);
        buf.put_u32_le(self.connection_id);

        let (part1, part2) = self.scramble.split_at(self.scramble.len().min(8));
        buf.put_slice(part1);
        buf.put_bytes(0, 8 - part1.len());
        buf.put_u8(0);

        buf.put_u16_le((self.capabilities & 0xFFFF) as u16);
        buf.put_u8(self.character_set);
        buf.put_u16_le(self.status_flags);
        buf.put_u16_le((self.capabilities >> 16) as u16);
        buf.put_u8((self.scramble.len() + 1) as u8);
        buf.put_bytes(0, 10);

        // Part two is at least 13 bytes including its terminator
        buf.put_slice(part2);
        buf.put_bytes(0, 13usize.saturating_sub(part2.len()).max(1));
        put_null_str(&mut buf, &self.auth_plugin_name);
        buf.freeze()
    }

    /// Parse a greeting payload
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if is_err_packet(payload) {
            return Err(ErrPacket::parse(payload)?.into_error());
        }

        let mut r = PayloadReader::new(payload);
        let version = r.u8()?;
        if version != 10 {
            return Err(ProxyError::Protocol(format!(
                "unsupported protocol version {}",
                version
            )));
        }
        let server_version = r.null_str();
        let connection_id = r.u32()?;
        let mut scramble = r.bytes(8)?.to_vec();
        r.u8()?;
        let mut capabilities = r.u16()? as u32;

        let mut character_set = DEFAULT_CHARACTER_SET;
        let mut status_flags = 0;
        let mut auth_plugin_name = String::new();
        if r.remaining() > 0 {
            character_set = r.u8()?;
            status_flags = r.u16()?;
            capabilities |= (r.u16()? as u32) << 16;
            let auth_data_len = r.u8()? as usize;
            r.bytes(10)?;

            if capabilities & CLIENT_SECURE_CONNECTION != 0 {
                let len = auth_data_len.saturating_sub(8).max(13);
                let part2 = r.bytes(len.min(r.remaining()))?;
                // The announced length counts the terminating null
                let take = if auth_data_len > 8 { auth_data_len - 9 } else { 12 };
                scramble.extend_from_slice(&part2[..take.min(part2.len())]);
            }
            if capabilities & CLIENT_PLUGIN_AUTH != 0 {
                auth_plugin_name = r.null_str();
            }
        }

        Ok(Self {
            server_version,
            connection_id,
            scramble,
            capabilities,
            character_set,
            status_flags,
            auth_plugin_name,
        })
    }
}

/// Client reply to the greeting
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeResponse41 {
    /// Client capabilities
    pub capabilities: u32,

    /// Maximum packet size the client accepts
    pub max_packet_size: u32,

    /// Character set
    pub character_set: u8,

    /// Login name
    pub username: String,

    /// Auth plugin response
    pub auth_response: Vec<u8>,

    /// Initial database
    pub database: Option<String>,

    /// Auth plugin the response was computed with
    pub auth_plugin_name: Option<String>,

    /// Connection attributes
    pub connect_attrs: Vec<(String, String)>,
}

impl HandshakeResponse41 {
    /// Encode the response payload
    ///
    /// Without `CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA` the auth response carries a one
    /// byte length, so responses longer than 255 bytes are rejected.
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(128);
        put_ssl_request_fields(&mut buf, self.capabilities, self.max_packet_size, self.character_set);
        put_null_str(&mut buf, &self.username);

        if self.capabilities & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            put_lenenc_bytes(&mut buf, &self.auth_response);
        } else {
            let len = u8::try_from(self.auth_response.len()).map_err(|_| {
                ProxyError::Protocol(format!(
                    "auth response of {} bytes needs length-encoded client data",
                    self.auth_response.len()
                ))
            })?;
            buf.put_u8(len);
            buf.put_slice(&self.auth_response);
        }

        if self.capabilities & CLIENT_CONNECT_WITH_DB != 0 {
            put_null_str(&mut buf, self.database.as_deref().unwrap_or_default());
        }
        if self.capabilities & CLIENT_PLUGIN_AUTH != 0 {
            put_null_str(&mut buf, self.auth_plugin_name.as_deref().unwrap_or_default());
        }
        if self.capabilities & CLIENT_CONNECT_ATTRS != 0 {
            let mut attrs = BytesMut::new();
            for (key, value) in &self.connect_attrs {
                put_lenenc_bytes(&mut attrs, key.as_bytes());
                put_lenenc_bytes(&mut attrs, value.as_bytes());
            }
            put_lenenc_bytes(&mut buf, &attrs);
        }
        Ok(buf.freeze())
    }

    /// Parse a response payload
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut r = PayloadReader::new(payload);
        let capabilities = r.u32()?;
        if capabilities & CLIENT_PROTOCOL_41 == 0 {
            return Err(ProxyError::Protocol("client does not support protocol 4.1".into()));
        }
        let max_packet_size = r.u32()?;
        let character_set = r.u8()?;
        r.bytes(23)?;

        let username = r.null_str();
        let auth_response = if capabilities & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            r.lenenc_bytes()?.to_vec()
        } else {
            let len = r.u8()? as usize;
            r.bytes(len)?.to_vec()
        };

        let database = if capabilities & CLIENT_CONNECT_WITH_DB != 0 && r.remaining() > 0 {
            Some(r.null_str())
        } else {
            None
        };
        let auth_plugin_name = if capabilities & CLIENT_PLUGIN_AUTH != 0 && r.remaining() > 0 {
            Some(r.null_str())
        } else {
            None
        };

        let mut connect_attrs = Vec::new();
        if capabilities & CLIENT_CONNECT_ATTRS != 0 && r.remaining() > 0 {
            let mut attrs = PayloadReader::new(r.lenenc_bytes()?);
            while attrs.remaining() > 0 {
                let key = String::from_utf8_lossy(attrs.lenenc_bytes()?).into_owned();
                let value = String::from_utf8_lossy(attrs.lenenc_bytes()?).into_owned();
                connect_attrs.push((key, value));
            }
        }

        Ok(Self {
            capabilities,
            max_packet_size,
            character_set,
            username,
            auth_response,
            database,
            auth_plugin_name,
            connect_attrs,
        })
    }
}

fn put_ssl_request_fields(buf: &mut BytesMut, capabilities: u32, max_packet_size: u32, charset: u8) {
    buf.put_u32_le(capabilities);
    buf.put_u32_le(max_packet_size);
    buf.put_u8(charset);
    buf.put_bytes(0, 23);
}

/// Encode an SSL request, the truncated handshake response sent before
/// upgrading to TLS
pub fn encode_ssl_request(capabilities: u32, max_packet_size: u32, charset: u8) -> Bytes {
    let mut buf = BytesMut::with_capacity(SSL_REQUEST_LEN);
    put_ssl_request_fields(&mut buf, capabilities | CLIENT_SSL, max_packet_size, charset);
    buf.freeze()
}

/// Whether a handshake response payload is an SSL request
pub fn is_ssl_request(payload: &[u8]) -> bool {
    payload.len() == SSL_REQUEST_LEN
        && u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) & CLIENT_SSL != 0
}

/// OK packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OkPacket {
    /// Affected rows
    pub affected_rows: u64,

    /// Last insert id
    pub last_insert_id: u64,

    /// Server status flags
    pub status_flags: u16,

    /// Warning count
    pub warnings: u16,

    /// Human-readable status
    pub info: String,
}

impl Default for OkPacket {
    fn default() -> Self {
        Self {
            affected_rows: 0,
            last_insert_id: 0,
            status_flags: SERVER_STATUS_AUTOCOMMIT,
            warnings: 0,
            info: String::new(),
        }
    }
}

impl OkPacket {
    /// Encode the OK payload
    pub fn encode(&self, capabilities: u32) -> Bytes {
        let mut buf = BytesMut::with_capacity(16 + self.info.len());
        buf.put_u8(OK_HEADER);
        put_lenenc_int(&mut buf, self.affected_rows);
        put_lenenc_int(&mut buf, self.last_insert_id);
        if capabilities & CLIENT_PROTOCOL_41 != 0 {
            buf.put_u16_le(self.status_flags);
            buf.put_u16_le(self.warnings);
        } else if capabilities & CLIENT_TRANSACTIONS != 0 {
            buf.put_u16_le(self.status_flags);
        }
        buf.put_slice(self.info.as_bytes());
        buf.freeze()
    }
}

/// ERR packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrPacket {
    /// Error code
    pub code: u16,

    /// Five-character SQL state
    pub sql_state: String,

    /// Error message
    pub message: String,
}

impl ErrPacket {
    /// Create an ERR packet with a generic SQL state
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self::with_state(code, "HY000", message)
    }

    /// Create an ERR packet with an explicit SQL state
    pub fn with_state(code: u16, sql_state: &str, message: impl Into<String>) -> Self {
        Self {
            code,
            sql_state: sql_state.to_string(),
            message: message.into(),
        }
    }

    /// Encode the ERR payload for a 4.1 client
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(9 + self.message.len());
        buf.put_u8(ERR_HEADER);
        buf.put_u16_le(self.code);
        buf.put_u8(b'#');
        let mut state = [b'H', b'Y', b'0', b'0', b'0'];
        for (dst, src) in state.iter_mut().zip(self.sql_state.bytes()) {
            *dst = src;
        }
        buf.put_slice(&state);
        buf.put_slice(self.message.as_bytes());
        buf.freeze()
    }

    /// Parse an ERR payload
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut r = PayloadReader::new(payload);
        if r.u8()? != ERR_HEADER {
            return Err(ProxyError::Protocol("not an ERR packet".into()));
        }
        let code = r.u16()?;
        let mut sql_state = "HY000".to_string();
        if r.remaining() >= 6 && payload[3] == b'#' {
            r.u8()?;
            sql_state = String::from_utf8_lossy(r.bytes(5)?).into_owned();
        }
        let message = String::from_utf8_lossy(r.rest()).into_owned();
        Ok(Self { code, sql_state, message })
    }

    /// Convert into the error a database reported
    pub fn into_error(self) -> ProxyError {
        ProxyError::Backend {
            code: self.code,
            state: self.sql_state,
            message: self.message,
        }
    }
}

/// Request from the server to continue authentication with another plugin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSwitchRequest {
    /// Plugin to switch to
    pub plugin_name: String,

    /// New auth plugin data
    pub plugin_data: Vec<u8>,
}

impl AuthSwitchRequest {
    /// Parse an auth switch payload
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut r = PayloadReader::new(payload);
        if r.u8()? != AUTH_SWITCH_HEADER {
            return Err(ProxyError::Protocol("not an auth switch request".into()));
        }
        let plugin_name = r.null_str();
        let mut plugin_data = r.rest().to_vec();
        if plugin_data.last() == Some(&0) {
            plugin_data.pop();
        }
        Ok(Self { plugin_name, plugin_data })
    }
}
