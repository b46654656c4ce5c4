//! Online/offline detection by probing the remote store's health endpoint.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};
use url::Url;

use crate::net::{fetch_with_timeout, Network, Request};

/// Connectivity transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
  /// The remote store became reachable
  Restored,
  /// The remote store stopped answering
  Lost,
}

/// Turns probe results into transitions. The first probe always reports.
#[derive(Debug, Default)]
struct Tracker {
  online: Option<bool>,
}

impl Tracker {
  fn observe(&mut self, online: bool) -> Option<ConnectivityEvent> {
    if self.online == Some(online) {
      return None;
    }
    self.online = Some(online);
    Some(if online {
      ConnectivityEvent::Restored
    } else {
      ConnectivityEvent::Lost
    })
  }
}

/// Receiver side of a running monitor
pub struct ConnectivityMonitor {
  rx: mpsc::UnboundedReceiver<ConnectivityEvent>,
}

impl ConnectivityMonitor {
  /// Probe `health_url` every `interval` in a background task.
  pub fn spawn<N: Network>(
    network: Arc<N>,
    health_url: Url,
    interval: Duration,
    timeout: Duration,
  ) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
      let mut tracker = Tracker::default();
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

      loop {
        ticker.tick().await;
        let online = probe(network.as_ref(), &health_url, timeout).await;
        if let Some(event) = tracker.observe(online) {
          info!(?event, url = %health_url, "Connectivity changed");
          if tx.send(event).is_err() {
            break;
          }
        }
      }
    });

    Self { rx }
  }

  pub fn into_receiver(self) -> mpsc::UnboundedReceiver<ConnectivityEvent> {
    self.rx
  }
}

/// Any 2xx answer within the deadline counts as online.
async fn probe<N: Network + ?Sized>(network: &N, url: &Url, timeout: Duration) -> bool {
  match fetch_with_timeout(network, &Request::get(url.clone()), timeout).await {
    Ok(response) => response.is_success(),
    Err(e) => {
      debug!(url = %url, error = %e, "Health probe failed");
      false
    }
  }
}
