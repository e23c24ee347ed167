//! Relay: routes frames between one host and N clients per session, owns the
//! controller lease and the per-session sequence counter, and exposes the
//! HTTP/WebSocket surface.

pub mod auth;
pub mod hub;
pub mod server;
pub mod store;
pub mod users;

pub use hub::{Connection, Hub, HubError, Role};
pub use server::RelayServer;
pub use store::{ShareScope, Store};
pub use users::UserStore;
