//! Outgoing database connections

pub mod client;
pub mod negotiate;
pub mod stream;

pub use client::{connect_mysql, BackendConn, ConnectOptions};
pub use negotiate::BackendConnector;
pub use stream::BackendStream;
