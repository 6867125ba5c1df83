//! Network reachability flag driven by platform signals.

use std::str::FromStr;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Platform connectivity transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivitySignal {
  Online,
  Offline,
}

impl FromStr for ConnectivitySignal {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim() {
      "online" => Ok(Self::Online),
      "offline" => Ok(Self::Offline),
      other => Err(format!("Unknown connectivity signal: {}", other)),
    }
  }
}

/// Holds the current reachability flag.
///
/// The flag only changes through [`ConnectivityMonitor::handle_signal`];
/// there is no polling. Clones share the same flag.
#[derive(Clone)]
pub struct ConnectivityMonitor {
  tx: watch::Sender<bool>,
}

impl ConnectivityMonitor {
  pub fn new(online: bool) -> Self {
    let (tx, _rx) = watch::channel(online);
    Self { tx }
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Receiver notified whenever the flag actually changes.
  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }

  pub fn handle_signal(&self, signal: ConnectivitySignal) {
    let online = signal == ConnectivitySignal::Online;
    let changed = self.tx.send_if_modified(|current| {
      if *current == online {
        false
      } else {
        *current = online;
        true
      }
    });

    if changed {
      info!(online, "Connectivity changed");
    } else {
      debug!(online, "Connectivity signal without change");
    }
  }
}

/// One-shot reachability check used to seed the flag at startup.
///
/// Opens a TCP connection to the origin's host and port.
pub async fn probe(origin: &url::Url, timeout: Duration) -> bool {
  let host = match origin.host_str() {
    Some(host) => host.to_string(),
    None => return false,
  };
  let port = origin.port_or_known_default().unwrap_or(80);

  match tokio::time::timeout(timeout, tokio::net::TcpStream::connect((host.as_str(), port))).await {
    Ok(Ok(_)) => true,
    Ok(Err(e)) => {
      debug!(%host, port, error = %e, "Reachability probe failed");
      false
    }
    Err(_) => {
      debug!(%host, port, "Reachability probe timed out");
      false
    }
  }
}
