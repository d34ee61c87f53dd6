//! Session audit events
//!
//! The audit sink is synchronous so that the session-end event can be
//! emitted from a drop guard on every exit path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use uuid::Uuid;

use sqlgate_core::models::Session;

use crate::error::ProxyError;

/// Target used for audit log lines
pub const AUDIT_TARGET: &str = "audit";

/// Event names
pub const SESSION_START_EVENT: &str = "db.session.start";
/// Session end
pub const SESSION_END_EVENT: &str = "db.session.end";
/// Statement executed
pub const SESSION_QUERY_EVENT: &str = "db.session.query";

/// Event codes
pub const SESSION_START_CODE: &str = "DB000I";
/// Session rejected
pub const SESSION_START_FAILURE_CODE: &str = "DB000W";
/// Session end
pub const SESSION_END_CODE: &str = "DB001I";
/// Statement executed
pub const SESSION_QUERY_CODE: &str = "DB002I";

/// Records session activity
pub trait Audit: Send + Sync {
    /// A session started, or was refused when `error` is set
    fn on_session_start(&self, session: &Session, error: Option<&ProxyError>);

    /// A session ended
    fn on_session_end(&self, session: &Session);

    /// A client sent a statement
    fn on_query(&self, session: &Session, query: &str);
}

/// One audit record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Event name
    pub event: String,
    /// Event code
    pub code: String,
    /// When the event happened
    pub time: DateTime<Utc>,
    /// Session id
    pub sid: Uuid,
    /// Principal
    pub user: String,
    /// Client address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_addr: Option<String>,
    /// Database service name
    pub db_service: String,
    /// Database protocol
    pub db_protocol: String,
    /// Database address
    pub db_uri: String,
    /// Database account
    pub db_user: String,
    /// Database name
    pub db_name: String,
    /// Whether the action succeeded
    pub success: bool,
    /// Failure reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Statement text
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

impl AuditEvent {
    fn new(event: &str, code: &str, session: &Session) -> Self {
        Self {
            event: event.to_string(),
            code: code.to_string(),
            time: Utc::now(),
            sid: session.id,
            user: session.identity.username.clone(),
            client_addr: session.client_addr.map(|a| a.to_string()),
            db_service: session.database.name.clone(),
            db_protocol: session.database.protocol.clone(),
            db_uri: session.database.uri.clone(),
            db_user: session.database_user.clone(),
            db_name: session.database_name.clone(),
            success: true,
            error: None,
            query: None,
        }
    }

    /// Session start, or refusal
    pub fn session_start(session: &Session, error: Option<&ProxyError>) -> Self {
        match error {
            None => Self::new(SESSION_START_EVENT, SESSION_START_CODE, session),
            Some(err) => Self {
                success: false,
                error: Some(err.to_string()),
                ..Self::new(SESSION_START_EVENT, SESSION_START_FAILURE_CODE, session)
            },
        }
    }

    /// Session end
    pub fn session_end(session: &Session) -> Self {
        Self::new(SESSION_END_EVENT, SESSION_END_CODE, session)
    }

    /// Statement
    pub fn query(session: &Session, query: &str) -> Self {
        Self {
            query: Some(query.to_string()),
            ..Self::new(SESSION_QUERY_EVENT, SESSION_QUERY_CODE, session)
        }
    }
}

/// Writes one JSON object per event to the `audit` log target
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAudit;

impl LogAudit {
    fn emit(&self, event: AuditEvent) {
        match serde_json::to_string(&event) {
            Ok(line) => log::info!(target: AUDIT_TARGET, "{}", line),
            Err(e) => log::error!("Failed to encode audit event {}: {}", event.event, e),
        }
    }
}

impl Audit for LogAudit {
    fn on_session_start(&self, session: &Session, error: Option<&ProxyError>) {
        self.emit(AuditEvent::session_start(session, error));
    }

    fn on_session_end(&self, session: &Session) {
        self.emit(AuditEvent::session_end(session));
    }

    fn on_query(&self, session: &Session, query: &str) {
        self.emit(AuditEvent::query(session, query));
    }
}

/// Keeps events in memory
#[derive(Debug, Default)]
pub struct MemoryAudit {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAudit {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Events recorded so far
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Recorded events with the given name
    pub fn events_named(&self, name: &str) -> Vec<AuditEvent> {
        self.events().into_iter().filter(|e| e.event == name).collect()
    }

    fn push(&self, event: AuditEvent) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).push(event);
    }
}

impl Audit for MemoryAudit {
    fn on_session_start(&self, session: &Session, error: Option<&ProxyError>) {
        self.push(AuditEvent::session_start(session, error));
    }

    fn on_session_end(&self, session: &Session) {
        self.push(AuditEvent::session_end(session));
    }

    fn on_query(&self, session: &Session, query: &str) {
        self.push(AuditEvent::query(session, query));
    }
}
