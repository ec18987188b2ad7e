//! Transport-independent link core.
//!
//! Adapter state, the device registry, discovery, the connection lifecycle
//! and inbound data handling. None of these types spawn tasks or hold locks
//! across radio calls; the manager actor drives them.

pub mod adapter;
pub mod connection;
pub mod device;
pub mod discovery;
pub mod permission;
pub mod registry;
pub mod stream;
