//! Multi-user terminal chat over long-lived TCP streams.
//!
//! Each participant holds one duplex stream to the hub. The hub keeps a
//! registry of live connections, rate-limits chat messages per connection,
//! persists accepted messages and fans events out to everyone else. The
//! client mirrors it with a local typing state machine and a terminal view.
//!
//! - [`cli`] parses the `server` and `client` subcommands.
//! - [`hub`] accepts TCP connections and owns the shared hub state.
//! - [`connection`] runs one participant's handshake, receive loop and teardown.
//! - [`registry`] maps participant names to live connections.
//! - [`broadcast`] fans events out across the registry.
//! - [`limiter`] is the per-connection token bucket.
//! - [`store`] persists message history.
//! - [`message`] defines the events and their JSON line framing.
//! - [`client`] connects to a hub and drives the terminal session.
//! - [`typing`] turns local keystrokes into typing events and tracks remote ones.
//! - [`terminal`] is the line editor and renderer the client draws with.

pub mod broadcast;
pub mod cli;
pub mod client;
pub mod connection;
pub mod hub;
pub mod limiter;
pub mod message;
pub mod registry;
pub mod store;
pub mod terminal;
pub mod typing;
