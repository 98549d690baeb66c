//! Peer connections and the connection manager actor.
//!
//! Dialing, TLS and framing live outside the core; the core sees peers
//! through the [`Connection`] trait and coordinates them through the
//! manager.

pub mod connection;
pub mod manager;
pub mod sender;

pub use connection::{ConnMap, Connection, ConnectionId};
pub use manager::{ConnectionManager, ConnectionManagerHandle, TopologySubscriber};
pub use sender::{ConnectionObserver, OneShotSender, RepeatingSender};
