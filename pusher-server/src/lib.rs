//! The pusher: a session-multiplexing WebSocket gateway between front
//! clients and the pool of authoritative back-end servers. Clients connect
//! here; the pusher routes each of them to the back owning their room and to
//! the spaces they join, forwarding framed messages in both directions.

pub mod admin_api;
pub mod admin_socket;
pub mod back;
pub mod batch;
pub mod client;
pub mod client_socket;
pub mod config;
pub mod embeddable;
pub mod error;
pub mod hand_shake;
pub mod multiplexer;
pub mod room;
pub mod space;
pub mod zone;
