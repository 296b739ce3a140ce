use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};
use tokio::{
    sync::{broadcast, Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    commands::CommandEntry,
    error::{Result, VoltraError},
    protocol,
    transport::Transport,
    types::{ConnectedDevice, ConnectionState, DeviceId, LinkState, TimingConfig},
};

/// Inputs accepted by the connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionInput {
    /// Caller asked to connect
    Connect,
    /// Transport link came up
    LinkUp,
    /// Auth payload and init sequence were written
    HandshakeComplete,
    /// A connect step failed
    Fail,
    /// Caller asked to disconnect
    Disconnect,
    /// Transport link went down
    LinkClosed,
}

impl ConnectionState {
    /// Pure transition function
    ///
    /// # Errors
    ///
    /// Returns [`VoltraError::InvalidStateTransition`] for inputs the current
    /// state does not accept.
    pub fn on(self, input: ConnectionInput) -> Result<Self> {
        use ConnectionInput as I;
        use ConnectionState as S;

        match (self, input) {
            (S::Disconnected, I::Connect) => Ok(S::Connecting),
            (S::Connecting, I::LinkUp) => Ok(S::Authenticating),
            (S::Authenticating, I::HandshakeComplete) => Ok(S::Connected),
            (S::Connecting | S::Authenticating, I::Fail | I::LinkClosed) => Ok(S::Disconnected),
            (S::Connecting | S::Authenticating | S::Connected, I::Disconnect) => {
                Ok(S::Disconnecting)
            }
            (S::Connected | S::Disconnecting, I::LinkClosed) => Ok(S::Disconnected),
            (from, input) => Err(VoltraError::InvalidStateTransition {
                from: from.to_string(),
                input: format!("{input:?}"),
            }),
        }
    }
}

/// Events published by the [`ConnectionStateMachine`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Lifecycle state changed
    StateChanged(ConnectionState),
    /// Handshake completed with this device
    Connected(DeviceId),
    /// Connection ended, requested or not
    Disconnected,
    /// Connect failed; the machine is back in `Disconnected`
    Error(VoltraError),
}

/// Owns the authenticate/initialize handshake and the link to one device
///
/// Cloning is cheap; clones share the same state and transport. All command
/// writes for the device go through [`write`](Self::write) or
/// [`send`](Self::send), which refuse to write unless the handshake has
/// completed.
#[derive(Clone)]
pub struct ConnectionStateMachine {
    transport: Arc<dyn Transport>,
    state: Arc<RwLock<ConnectionState>>,
    device: Arc<RwLock<Option<ConnectedDevice>>>,
    timing: TimingConfig,
    events: broadcast::Sender<ConnectionEvent>,
    reconnecting: Arc<AtomicBool>,
    link_monitor: Arc<Mutex<Option<JoinHandle<()>>>>,
}

struct ReconnectGuard<'a>(&'a AtomicBool);

impl Drop for ReconnectGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl ConnectionStateMachine {
    /// Create a machine in `Disconnected` that exclusively owns `transport`
    pub fn new(transport: Arc<dyn Transport>, timing: TimingConfig, event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            transport,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            device: Arc::new(RwLock::new(None)),
            timing,
            events,
            reconnecting: Arc::new(AtomicBool::new(false)),
            link_monitor: Arc::new(Mutex::new(None)),
        }
    }

    /// Subscribe to connection events
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Current lifecycle state
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Whether the handshake has completed
    pub async fn is_connected(&self) -> bool {
        self.state().await == ConnectionState::Connected
    }

    /// Device the machine is bound to, if connected
    pub async fn device(&self) -> Option<ConnectedDevice> {
        self.device.read().await.clone()
    }

    /// Timing used for handshake and command sequences
    #[must_use]
    pub const fn timing(&self) -> &TimingConfig {
        &self.timing
    }

    /// Connect to a device and run the authentication handshake
    ///
    /// Sequence: transport connect, auth payload, auth wait, then the init
    /// commands with a fixed gap between consecutive writes.
    ///
    /// # Errors
    ///
    /// Returns [`VoltraError::AlreadyConnected`] unless the machine is
    /// `Disconnected`. Any transport failure during the handshake returns the
    /// machine to `Disconnected`, clears the bound device, emits
    /// [`ConnectionEvent::Error`] and is returned as [`VoltraError::Transport`].
    pub async fn connect(&self, device_id: DeviceId) -> Result<ConnectedDevice> {
        {
            let mut state = self.state.write().await;
            if *state != ConnectionState::Disconnected {
                return Err(VoltraError::AlreadyConnected);
            }
            *state = state.on(ConnectionInput::Connect)?;
        }
        self.publish_state(ConnectionState::Connecting);
        info!("Connecting to device: {}", device_id);

        let link_events = self.transport.subscribe_link_state();

        match self.handshake(&device_id).await {
            Ok(handle) => {
                self.start_link_monitoring(link_events).await;
                info!("Successfully connected to {}", device_id);
                let _ = self.events.send(ConnectionEvent::Connected(device_id));
                Ok(handle)
            }
            Err(e) => {
                self.abort_connect(&device_id, &e).await;
                Err(e)
            }
        }
    }

    async fn handshake(&self, device_id: &DeviceId) -> Result<ConnectedDevice> {
        self.transport.connect(device_id).await?;
        self.apply(ConnectionInput::LinkUp).await?;

        debug!("Writing authentication payload");
        self.transport.write(&protocol::authenticate()).await?;
        tokio::time::sleep(Duration::from_millis(self.timing.auth_timeout_ms)).await;

        for (i, command) in protocol::init_sequence().iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(Duration::from_millis(self.timing.init_command_delay_ms)).await;
            }
            debug!("Writing init command {}: {:02X?}", i, &command[..]);
            self.transport.write(command).await?;
        }

        let handle = ConnectedDevice {
            id: device_id.clone(),
            connected_at: SystemTime::now(),
        };
        *self.device.write().await = Some(handle.clone());
        self.apply(ConnectionInput::HandshakeComplete).await?;

        Ok(handle)
    }

    async fn abort_connect(&self, device_id: &DeviceId, cause: &VoltraError) {
        error!("Connection to {} failed: {}", device_id, cause);

        *self.device.write().await = None;

        if self.transport.is_connected().await {
            if let Err(e) = self.transport.disconnect().await {
                warn!("Cleanup disconnect after failed connect also failed: {}", e);
            }
        }

        // A concurrent disconnect may already have moved the state on
        if self.apply(ConnectionInput::Fail).await.is_err() {
            self.force(ConnectionState::Disconnected).await;
        }
        let _ = self.events.send(ConnectionEvent::Error(cause.clone()));
    }

    /// Disconnect from the device
    ///
    /// No-op when already `Disconnected`. Transport failures are logged; the
    /// machine always ends in `Disconnected`.
    pub async fn disconnect(&self) {
        {
            let mut state = self.state.write().await;
            match state.on(ConnectionInput::Disconnect) {
                Ok(next) => *state = next,
                Err(_) => return,
            }
        }
        self.publish_state(ConnectionState::Disconnecting);
        info!("Disconnecting");

        if let Some(monitor) = self.link_monitor.lock().await.take() {
            monitor.abort();
        }

        if let Err(e) = self.transport.disconnect().await {
            warn!("Transport disconnect failed: {}", e);
        }

        *self.device.write().await = None;
        self.force(ConnectionState::Disconnected).await;
        let _ = self.events.send(ConnectionEvent::Disconnected);
    }

    /// Connect again, at most one attempt at a time
    ///
    /// Returns `None` immediately if another reconnect is in flight, and
    /// `None` (after logging) if the attempt fails.
    pub async fn reconnect(&self, device_id: DeviceId) -> Option<ConnectedDevice> {
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Reconnect already in progress, ignoring");
            return None;
        }
        let _guard = ReconnectGuard(&self.reconnecting);

        info!("Reconnecting to {}", device_id);
        match self.connect(device_id).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Reconnect failed: {}", e);
                None
            }
        }
    }

    /// Write one payload to the connected device
    ///
    /// # Errors
    ///
    /// Returns [`VoltraError::NotConnected`] unless the handshake has
    /// completed, or [`VoltraError::Transport`] if the write fails.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        self.ensure_connected().await?;
        debug!("Sending command: {:02X?}", data);
        self.transport.write(data).await?;
        Ok(())
    }

    /// Write a table entry, honoring the pause between the halves of a dual command
    ///
    /// # Errors
    ///
    /// Same as [`write`](Self::write). If the first half of a dual command
    /// fails the second is not attempted.
    pub async fn send(&self, entry: &CommandEntry) -> Result<()> {
        match entry {
            CommandEntry::Single(data) => self.write(data).await,
            CommandEntry::Dual { step1, step2, .. } => {
                self.write(step1).await?;
                tokio::time::sleep(entry.inter_step_delay()).await;
                self.write(step2).await
            }
        }
    }

    async fn ensure_connected(&self) -> Result<ConnectedDevice> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(VoltraError::NotConnected);
        }
        self.device
            .read()
            .await
            .clone()
            .ok_or(VoltraError::NotConnected)
    }

    /// Watch the transport for link loss while connected
    async fn start_link_monitoring(&self, mut link_events: broadcast::Receiver<LinkState>) {
        let machine = self.clone();
        let monitor = tokio::spawn(async move {
            loop {
                match link_events.recv().await {
                    Ok(LinkState::Disconnected) => {
                        machine.handle_link_lost().await;
                        break;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if !machine.transport.is_connected().await {
                            machine.handle_link_lost().await;
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        if let Some(previous) = self.link_monitor.lock().await.replace(monitor) {
            previous.abort();
        }
    }

    async fn handle_link_lost(&self) {
        {
            let mut state = self.state.write().await;
            if *state != ConnectionState::Connected {
                return;
            }
            warn!("Link lost unexpectedly");
            *state = state
                .on(ConnectionInput::LinkClosed)
                .unwrap_or(ConnectionState::Disconnected);
        }
        *self.device.write().await = None;
        self.publish_state(ConnectionState::Disconnected);
        let _ = self.events.send(ConnectionEvent::Disconnected);
    }

    async fn apply(&self, input: ConnectionInput) -> Result<ConnectionState> {
        let next = {
            let mut state = self.state.write().await;
            let next = state.on(input)?;
            *state = next;
            next
        };
        self.publish_state(next);
        Ok(next)
    }

    async fn force(&self, next: ConnectionState) {
        let previous = std::mem::replace(&mut *self.state.write().await, next);
        if previous != next {
            self.publish_state(next);
        }
    }

    fn publish_state(&self, state: ConnectionState) {
        info!("Connection state: {}", state);
        let _ = self.events.send(ConnectionEvent::StateChanged(state));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        commands::CommandTable,
        error::{TransportErrorKind, VoltraError},
        transport::mock::MockTransport,
    };
    use std::sync::atomic::Ordering;
    use tokio::sync::broadcast::Receiver;

    fn machine() -> (Arc<MockTransport>, ConnectionStateMachine) {
        let transport = Arc::new(MockTransport::new());
        let machine = ConnectionStateMachine::new(transport.clone(), TimingConfig::default(), 64);
        (transport, machine)
    }

    fn drain(events: &mut Receiver<ConnectionEvent>) -> Vec<ConnectionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn test_transition_table() {
        use ConnectionInput as I;
        use ConnectionState as S;

        assert_eq!(S::Disconnected.on(I::Connect).unwrap(), S::Connecting);
        assert_eq!(S::Connecting.on(I::LinkUp).unwrap(), S::Authenticating);
        assert_eq!(S::Authenticating.on(I::HandshakeComplete).unwrap(), S::Connected);
        assert_eq!(S::Connecting.on(I::Fail).unwrap(), S::Disconnected);
        assert_eq!(S::Authenticating.on(I::Fail).unwrap(), S::Disconnected);
        assert_eq!(S::Connected.on(I::Disconnect).unwrap(), S::Disconnecting);
        assert_eq!(S::Disconnecting.on(I::LinkClosed).unwrap(), S::Disconnected);
        assert_eq!(S::Connected.on(I::LinkClosed).unwrap(), S::Disconnected);
    }

    #[test]
    fn test_only_connect_is_legal_from_disconnected() {
        use ConnectionInput as I;

        for input in [
            I::LinkUp,
            I::HandshakeComplete,
            I::Fail,
            I::Disconnect,
            I::LinkClosed,
        ] {
            assert!(matches!(
                ConnectionState::Disconnected.on(input),
                Err(VoltraError::InvalidStateTransition { .. })
            ));
        }
        assert!(ConnectionState::Connected.on(I::Connect).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_runs_handshake_in_order() {
        let (transport, machine) = machine();
        let mut events = machine.subscribe();

        let handle = machine.connect(DeviceId::from("dev-1")).await.unwrap();

        assert_eq!(handle.id, DeviceId::from("dev-1"));
        assert_eq!(machine.state().await, ConnectionState::Connected);
        assert_eq!(machine.device().await.map(|d| d.id), Some(DeviceId::from("dev-1")));

        let mut expected = vec![protocol::authenticate()];
        expected.extend(protocol::init_sequence());
        assert_eq!(transport.written(), expected);

        let events = drain(&mut events);
        assert_eq!(
            events,
            vec![
                ConnectionEvent::StateChanged(ConnectionState::Connecting),
                ConnectionEvent::StateChanged(ConnectionState::Authenticating),
                ConnectionEvent::StateChanged(ConnectionState::Connected),
                ConnectionEvent::Connected(DeviceId::from("dev-1")),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timing() {
        let (transport, machine) = machine();
        let timing = TimingConfig::default();
        machine.connect(DeviceId::from("dev-1")).await.unwrap();

        let writes = transport.writes();
        let auth_gap = writes[1].0 - writes[0].0;
        assert!(auth_gap >= Duration::from_millis(timing.auth_timeout_ms));

        for pair in writes[1..].windows(2) {
            assert!(pair[1].0 - pair[0].0 >= Duration::from_millis(timing.init_command_delay_ms));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_twice_fails() {
        let (_transport, machine) = machine();
        machine.connect(DeviceId::from("dev-1")).await.unwrap();

        assert_eq!(
            machine.connect(DeviceId::from("dev-2")).await,
            Err(VoltraError::AlreadyConnected)
        );
        assert_eq!(machine.state().await, ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_connect_failure_regresses() {
        let (transport, machine) = machine();
        *transport.fail_connect.lock().unwrap() = Some(TransportErrorKind::RelayUnreachable);
        let mut events = machine.subscribe();

        let err = machine.connect(DeviceId::from("dev-1")).await.unwrap_err();

        let VoltraError::Transport(ref transport_error) = err else {
            panic!("expected transport error, got {err:?}");
        };
        assert_eq!(transport_error.kind, TransportErrorKind::RelayUnreachable);
        assert_eq!(machine.state().await, ConnectionState::Disconnected);
        assert!(machine.device().await.is_none());
        assert_eq!(transport.write_count(), 0);

        let events = drain(&mut events);
        assert_eq!(
            events.last(),
            Some(&ConnectionEvent::Error(err.clone()))
        );
        assert!(events.contains(&ConnectionEvent::StateChanged(ConnectionState::Disconnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_write_failure_regresses_and_drops_link() {
        let (transport, machine) = machine();
        transport.fail_write_at(Some(2));

        let err = machine.connect(DeviceId::from("dev-1")).await.unwrap_err();

        assert!(err.is_connection_error());
        assert_eq!(machine.state().await, ConnectionState::Disconnected);
        assert!(machine.device().await.is_none());
        assert_eq!(transport.disconnect_calls.load(Ordering::SeqCst), 1);

        transport.fail_write_at(None);
        assert!(machine.connect(DeviceId::from("dev-1")).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect() {
        let (transport, machine) = machine();

        machine.disconnect().await;
        assert_eq!(transport.disconnect_calls.load(Ordering::SeqCst), 0);

        machine.connect(DeviceId::from("dev-1")).await.unwrap();
        transport.fail_disconnect.store(true, Ordering::SeqCst);
        let mut events = machine.subscribe();

        machine.disconnect().await;

        assert_eq!(machine.state().await, ConnectionState::Disconnected);
        assert!(machine.device().await.is_none());
        assert_eq!(
            drain(&mut events),
            vec![
                ConnectionEvent::StateChanged(ConnectionState::Disconnecting),
                ConnectionEvent::StateChanged(ConnectionState::Disconnected),
                ConnectionEvent::Disconnected,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_is_single_flight() {
        let (transport, machine) = machine();

        let (first, second) = tokio::join!(
            machine.reconnect(DeviceId::from("dev-1")),
            machine.reconnect(DeviceId::from("dev-1"))
        );

        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(transport.connect_calls.load(Ordering::SeqCst), 1);

        machine.disconnect().await;
        assert!(machine.reconnect(DeviceId::from("dev-1")).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_swallows_failure() {
        let (transport, machine) = machine();
        *transport.fail_connect.lock().unwrap() = Some(TransportErrorKind::Timeout);

        assert!(machine.reconnect(DeviceId::from("dev-1")).await.is_none());
        assert_eq!(machine.state().await, ConnectionState::Disconnected);

        *transport.fail_connect.lock().unwrap() = None;
        assert!(machine.reconnect(DeviceId::from("dev-1")).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_link_loss() {
        let (transport, machine) = machine();
        machine.connect(DeviceId::from("dev-1")).await.unwrap();
        let mut events = machine.subscribe();

        transport.drop_link();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(machine.state().await, ConnectionState::Disconnected);
        assert!(machine.device().await.is_none());
        assert!(drain(&mut events).contains(&ConnectionEvent::Disconnected));
    }

    #[tokio::test]
    async fn test_write_requires_connection() {
        let (transport, machine) = machine();
        assert_eq!(
            machine.write(&protocol::go()).await,
            Err(VoltraError::NotConnected)
        );
        assert_eq!(transport.write_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dual_command_waits_between_steps() {
        let (transport, machine) = machine();
        machine.connect(DeviceId::from("dev-1")).await.unwrap();
        transport.clear_writes();

        let entry = CommandTable::chains().lookup(40).unwrap();
        machine.send(entry).await.unwrap();

        let writes = transport.writes();
        assert_eq!(writes.len(), 2);
        assert!(writes[1].0 - writes[0].0 >= entry.inter_step_delay());
    }
}
