//! Connectivity monitoring.
//!
//! The platform pushes online/offline notifications; nothing here polls.
//! A [`ConnectivitySource`] exposes the current state plus a watch channel,
//! and [`ConnectivityMonitor`] turns that channel into a stream of
//! transition events.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Platform connectivity signal
pub trait ConnectivitySource: Send + Sync {
    /// Whether the platform currently reports a network connection
    fn is_online(&self) -> bool;

    /// Watch connectivity changes
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Connectivity source driven by hand.
///
/// Used by tests and by the harness binary to simulate losing and regaining
/// the network.
pub struct ManualConnectivity {
    online: watch::Sender<bool>,
}

impl ManualConnectivity {
    pub fn new(online: bool) -> Self {
        Self {
            online: watch::channel(online).0,
        }
    }

    /// Report a connectivity change. Repeating the current state is ignored.
    pub fn set_online(&self, online: bool) {
        self.online.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
    }
}

impl ConnectivitySource for ManualConnectivity {
    fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }
}

/// Connectivity transition
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectivityEvent {
    Online,
    Offline,
}

impl ConnectivityEvent {
    fn from_state(online: bool) -> Self {
        if online {
            ConnectivityEvent::Online
        } else {
            ConnectivityEvent::Offline
        }
    }
}

/// Tracks the last known connectivity state and yields transitions
pub struct ConnectivityMonitor {
    rx: watch::Receiver<bool>,
    is_online: bool,
}

impl ConnectivityMonitor {
    /// Start monitoring `source`, initialized from its current state
    pub fn new(source: &dyn ConnectivitySource) -> Self {
        let mut rx = source.subscribe();
        let is_online = *rx.borrow_and_update();
        Self { rx, is_online }
    }

    /// Last known state
    pub fn is_online(&self) -> bool {
        self.is_online
    }

    /// Wait for the next transition.
    ///
    /// Notifications are coalesced, so an offline/online flap that lands
    /// before the monitor wakes shows up as a single event for the state the
    /// source ended in, even when that matches the last known state. A
    /// reconnect is never swallowed that way.
    ///
    /// Returns `None` once the source has gone away.
    pub async fn next_event(&mut self) -> Option<ConnectivityEvent> {
        self.rx.changed().await.ok()?;
        let online = *self.rx.borrow_and_update();
        if online == self.is_online {
            tracing::debug!(online, "Network flapped");
        }
        self.is_online = online;
        let event = ConnectivityEvent::from_state(online);
        match event {
            ConnectivityEvent::Online => tracing::info!("Network: online"),
            ConnectivityEvent::Offline => tracing::warn!("Network: offline"),
        }
        Some(event)
    }
}
