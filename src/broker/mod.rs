//! Connection brokering between page origins and the session

pub mod connect;

pub use connect::{ConnectBroker, ConnectionGrant, PendingConnect, PendingConnectInfo};
