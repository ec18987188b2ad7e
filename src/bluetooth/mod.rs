//! Bluetooth layer for the serial link.
//!
//! This module provides the transport abstraction, its BlueZ/RFCOMM
//! implementation and the manager actor that owns all link state.

pub mod bluez;
pub mod manager;
#[cfg(test)]
pub mod mock;
pub mod rfcomm;
pub mod subscription;
pub mod transport;
