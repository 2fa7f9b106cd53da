//! profiled - profile server daemon
//!
//! Hosts identities' signed profiles, replicates them to and from a
//! neighborhood of peer servers, relays calls between checked-in clients,
//! and validates relationship cards submitted by the application service.

pub mod action_queue;
pub mod config;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod server;
pub mod storage;
pub mod validator;
pub mod worker;

pub use config::Config;
pub use error::ServerError;
pub use server::Server;
pub use storage::Storage;
