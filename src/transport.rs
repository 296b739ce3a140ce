use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

use crate::{
    error::TransportError,
    types::{DeviceId, LinkState},
};

/// Low-level link to one device
///
/// The core only consumes this capability: it never scans or touches the
/// radio itself. Subscriptions are broadcast receivers; dropping the receiver
/// unsubscribes.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a link to the device
    async fn connect(&self, device: &DeviceId) -> Result<(), TransportError>;

    /// Close the link
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Write one command payload
    async fn write(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Raw inbound notifications in delivery order
    fn subscribe_notifications(&self) -> broadcast::Receiver<Bytes>;

    /// Link state changes, including unexpected drops
    fn subscribe_link_state(&self) -> broadcast::Receiver<LinkState>;

    /// Current link state
    async fn link_state(&self) -> LinkState;

    /// Whether the link is up
    async fn is_connected(&self) -> bool {
        self.link_state().await == LinkState::Connected
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! In-memory transport that records every write with its timestamp.

    use super::*;
    use crate::error::TransportErrorKind;
    use std::sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    };
    use tokio::time::Instant;

    pub(crate) struct MockTransport {
        writes: Mutex<Vec<(Instant, Bytes)>>,
        link: Mutex<LinkState>,
        notifications: broadcast::Sender<Bytes>,
        link_events: broadcast::Sender<LinkState>,
        pub(crate) fail_connect: Mutex<Option<TransportErrorKind>>,
        /// Fail the write with this zero-based index (counted across the session)
        pub(crate) fail_write_at: Mutex<Option<usize>>,
        pub(crate) fail_disconnect: AtomicBool,
        pub(crate) connect_calls: AtomicUsize,
        pub(crate) disconnect_calls: AtomicUsize,
    }

    impl MockTransport {
        pub(crate) fn new() -> Self {
            let (notifications, _) = broadcast::channel(1024);
            let (link_events, _) = broadcast::channel(16);
            Self {
                writes: Mutex::new(Vec::new()),
                link: Mutex::new(LinkState::Disconnected),
                notifications,
                link_events,
                fail_connect: Mutex::new(None),
                fail_write_at: Mutex::new(None),
                fail_disconnect: AtomicBool::new(false),
                connect_calls: AtomicUsize::new(0),
                disconnect_calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn writes(&self) -> Vec<(Instant, Bytes)> {
            self.writes.lock().unwrap().clone()
        }

        pub(crate) fn written(&self) -> Vec<Bytes> {
            self.writes().into_iter().map(|(_, b)| b).collect()
        }

        pub(crate) fn write_count(&self) -> usize {
            self.writes.lock().unwrap().len()
        }

        pub(crate) fn clear_writes(&self) {
            self.writes.lock().unwrap().clear();
        }

        pub(crate) fn fail_write_at(&self, index: Option<usize>) {
            *self.fail_write_at.lock().unwrap() = index;
        }

        /// Deliver a notification as if it came from the device
        pub(crate) fn notify(&self, data: Bytes) {
            let _ = self.notifications.send(data);
        }

        /// Simulate the device dropping the link
        pub(crate) fn drop_link(&self) {
            *self.link.lock().unwrap() = LinkState::Disconnected;
            let _ = self.link_events.send(LinkState::Disconnected);
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn connect(&self, _device: &DeviceId) -> Result<(), TransportError> {
            self.connect_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(kind) = *self.fail_connect.lock().unwrap() {
                return Err(TransportError::new(kind, "mock connect failure"));
            }
            *self.link.lock().unwrap() = LinkState::Connected;
            let _ = self.link_events.send(LinkState::Connected);
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), TransportError> {
            self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
            *self.link.lock().unwrap() = LinkState::Disconnected;
            if self.fail_disconnect.load(Ordering::SeqCst) {
                return Err(TransportError::other("mock disconnect failure"));
            }
            Ok(())
        }

        async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
            if *self.link.lock().unwrap() != LinkState::Connected {
                return Err(TransportError::other("link down"));
            }
            let mut writes = self.writes.lock().unwrap();
            if *self.fail_write_at.lock().unwrap() == Some(writes.len()) {
                return Err(TransportError::timeout("mock write failure"));
            }
            writes.push((Instant::now(), Bytes::copy_from_slice(data)));
            Ok(())
        }

        fn subscribe_notifications(&self) -> broadcast::Receiver<Bytes> {
            self.notifications.subscribe()
        }

        fn subscribe_link_state(&self) -> broadcast::Receiver<LinkState> {
            self.link_events.subscribe()
        }

        async fn link_state(&self) -> LinkState {
            *self.link.lock().unwrap()
        }
    }
}
