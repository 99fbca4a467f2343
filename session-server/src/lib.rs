//! The authoritative session server for the turn-based tactics game.
//! Clients connect over a WebSocket, authenticate, and create or join a
//! session; from there every mutation flows through the owning session
//! actor. The binary in `main.rs` wires these modules to the network.

pub mod auth;
pub mod config;
pub mod connection;
pub mod rate_limit;
pub mod registry;
pub mod session;
pub mod store;
pub mod time;
