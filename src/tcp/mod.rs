//! TCP transport: plain hosts and identity-declaring secure hosts.

pub mod host;
pub mod secure;

pub use host::{HostConfig, TcpConn, TcpHost, Traffic};
pub use secure::{SecureTcpConn, SecureTcpHost};
