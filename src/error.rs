//! Error types for the link service.
//!
//! Every fault raised by the transport is converted into one of the
//! [`ErrorKind`] categories at the component boundary that observed it,
//! so callers always receive a classified failure instead of a raw error.

use thiserror::Error;

/// Classification reported upward in events and D-Bus errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
   PermissionDenied,
   AdapterUnavailable,
   DiscoveryFailed,
   ConnectFailed,
   DisconnectFailed,
   OperationInProgress,
   ReadFailed,
   NotConnected,
   WriteFailed,
   Internal,
}

impl ErrorKind {
   pub fn to_str(self) -> &'static str {
      self.into()
   }
}

/// Main error type for the link service.
#[derive(Error, Debug)]
pub enum LinkError {
   #[error("Permission denied")]
   PermissionDenied,

   #[error("Adapter unavailable: {0}")]
   AdapterUnavailable(String),

   #[error("Discovery failed: {0}")]
   DiscoveryFailed(String),

   #[error("Connect failed: {0}")]
   ConnectFailed(String),

   #[error("Disconnect failed: {0}")]
   DisconnectFailed(String),

   #[error("Operation already in progress")]
   OperationInProgress,

   #[error("Read failed: {0}")]
   ReadFailed(String),

   #[error("Device not connected")]
   NotConnected,

   #[error("Write failed: {0}")]
   WriteFailed(String),

   #[error("Invalid device address: {0}")]
   InvalidAddress(String),

   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus connection error: {0}")]
   DBusConnection(#[from] zbus::fdo::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("Invalid configuration: {0}")]
   InvalidConfig(String),

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Manager has been shut down")]
   ManagerShutdown,
}

impl LinkError {
   pub const fn kind(&self) -> ErrorKind {
      match self {
         Self::PermissionDenied => ErrorKind::PermissionDenied,
         Self::AdapterUnavailable(_) => ErrorKind::AdapterUnavailable,
         Self::DiscoveryFailed(_) => ErrorKind::DiscoveryFailed,
         Self::ConnectFailed(_) => ErrorKind::ConnectFailed,
         Self::DisconnectFailed(_) => ErrorKind::DisconnectFailed,
         Self::OperationInProgress => ErrorKind::OperationInProgress,
         Self::ReadFailed(_) => ErrorKind::ReadFailed,
         Self::NotConnected => ErrorKind::NotConnected,
         Self::WriteFailed(_) => ErrorKind::WriteFailed,
         _ => ErrorKind::Internal,
      }
   }
}

/// Convenience type alias for Results with `LinkError`.
pub type Result<T> = std::result::Result<T, LinkError>;

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_kind_names() {
      assert_eq!(LinkError::PermissionDenied.kind().to_str(), "permission_denied");
      assert_eq!(
         LinkError::ConnectFailed("refused".into()).kind().to_str(),
         "connect_failed"
      );
      assert_eq!(LinkError::ManagerShutdown.kind(), ErrorKind::Internal);
   }
}
