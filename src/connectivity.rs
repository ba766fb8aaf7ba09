//! Network status as seen by the cache.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Link type reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
  Wifi,
  Ethernet,
  Cellular2g,
  Cellular3g,
  Cellular4g,
  Cellular5g,
  Unknown,
  None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionQuality {
  Good,
  Poor,
}

/// Point-in-time connectivity snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStatus {
  pub is_connected: bool,
  pub connection_type: ConnectionType,
}

impl NetworkStatus {
  pub fn online(connection_type: ConnectionType) -> Self {
    Self {
      is_connected: true,
      connection_type,
    }
  }

  pub fn offline() -> Self {
    Self {
      is_connected: false,
      connection_type: ConnectionType::None,
    }
  }

  /// 2G/3G links are treated as poor; everything else as good.
  pub fn quality(&self) -> ConnectionQuality {
    match self.connection_type {
      ConnectionType::Cellular2g | ConnectionType::Cellular3g => ConnectionQuality::Poor,
      _ => ConnectionQuality::Good,
    }
  }
}

/// Source of connectivity information.
#[async_trait]
pub trait ConnectivityProvider: Send + Sync {
  /// Fetch the current status.
  async fn current(&self) -> NetworkStatus;

  /// Subscribe to status changes.
  fn subscribe(&self) -> watch::Receiver<NetworkStatus>;
}

/// Provider the platform layer pushes status updates into.
pub struct WatchConnectivity {
  tx: watch::Sender<NetworkStatus>,
}

impl WatchConnectivity {
  pub fn new(initial: NetworkStatus) -> Self {
    let (tx, _rx) = watch::channel(initial);
    Self { tx }
  }

  /// Publish a new status. Subscribers only wake on actual changes.
  pub fn set_status(&self, status: NetworkStatus) {
    self.tx.send_if_modified(|current| {
      if *current == status {
        false
      } else {
        tracing::info!(
          connected = status.is_connected,
          connection_type = ?status.connection_type,
          "connectivity changed"
        );
        *current = status;
        true
      }
    });
  }
}

impl Default for WatchConnectivity {
  fn default() -> Self {
    Self::new(NetworkStatus::online(ConnectionType::Wifi))
  }
}

#[async_trait]
impl ConnectivityProvider for WatchConnectivity {
  async fn current(&self) -> NetworkStatus {
    *self.tx.borrow()
  }

  fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
    self.tx.subscribe()
  }
}
