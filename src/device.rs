use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::info;

use crate::{
    ble::BleTransport,
    connection::ConnectionStateMachine,
    error::{Result, VoltraError},
    recording::RecordingStateMachine,
    session::TelemetrySession,
    transport::Transport,
    types::{ConnectedDevice, DeviceConfig, DeviceId},
};

/// One Voltra unit and the components that drive it
///
/// `VoltraDevice` builds the connection machine, telemetry session and
/// recording machine once, wires inbound notifications into the session and
/// keeps the recording machine reset whenever the connection drops. The
/// components are exposed by reference; they are cheap to clone if a caller
/// needs to move one into a task.
///
/// # Examples
///
/// ```no_run
/// use voltra::VoltraDevice;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let device = VoltraDevice::connect_first().await?;
///
///     device.recording().set_weight(50).await?;
///     device.recording().prepare().await?;
///     device.recording().engage().await?;
///
///     let duration = device.recording().stop().await?;
///     println!("Workout lasted {duration:.1}s");
///
///     device.disconnect().await;
///     Ok(())
/// }
/// ```
pub struct VoltraDevice {
    connection: ConnectionStateMachine,
    session: TelemetrySession,
    recording: RecordingStateMachine,
    tasks: Vec<JoinHandle<()>>,
}

impl VoltraDevice {
    /// Scan over BLE and connect to the unit with the strongest signal
    ///
    /// # Errors
    ///
    /// Returns [`VoltraError::DeviceNotFound`] if no unit answers the scan,
    /// or any handshake error from [`connect`](Self::connect).
    pub async fn connect_first() -> Result<Self> {
        Self::connect_first_with_config(DeviceConfig::default(), Duration::from_secs(5)).await
    }

    /// Same as [`connect_first`](Self::connect_first) with explicit settings
    ///
    /// # Errors
    ///
    /// See [`connect_first`](Self::connect_first); also
    /// [`VoltraError::InvalidConfig`] for an invalid `config`.
    pub async fn connect_first_with_config(
        config: DeviceConfig,
        scan_duration: Duration,
    ) -> Result<Self> {
        let transport = BleTransport::new().await?;
        let mut devices = transport.scan(scan_duration).await?;
        devices.sort_by_key(|d| std::cmp::Reverse(d.rssi.unwrap_or(i16::MIN)));
        let target = devices.into_iter().next().ok_or(VoltraError::DeviceNotFound)?;

        info!("Selected {} ({})", target.name, target.id);
        let device = Self::new(Arc::new(transport), config)?;
        device.connect(target.id).await?;
        Ok(device)
    }

    /// Build the components on top of an existing transport
    ///
    /// Must be called inside a Tokio runtime: the notification pump and the
    /// connection watcher are spawned immediately.
    ///
    /// # Errors
    ///
    /// Returns [`VoltraError::InvalidConfig`] if `config` fails validation.
    pub fn new(transport: Arc<dyn Transport>, config: DeviceConfig) -> Result<Self> {
        config.validate()?;

        let notifications = transport.subscribe_notifications();
        let connection =
            ConnectionStateMachine::new(transport, config.timing, config.event_capacity);
        let session = TelemetrySession::new(config.recent_frame_capacity, config.event_capacity);
        let recording =
            RecordingStateMachine::new(connection.clone(), session.clone(), config.event_capacity);

        let tasks = vec![session.attach(notifications), recording.watch_connection()];

        Ok(Self {
            connection,
            session,
            recording,
            tasks,
        })
    }

    /// Run the connection handshake
    ///
    /// # Errors
    ///
    /// See [`ConnectionStateMachine::connect`].
    pub async fn connect(&self, device_id: DeviceId) -> Result<ConnectedDevice> {
        self.connection.connect(device_id).await
    }

    /// Reconnect, swallowing failures
    pub async fn reconnect(&self, device_id: DeviceId) -> Option<ConnectedDevice> {
        self.connection.reconnect(device_id).await
    }

    /// Tear the connection down; the recording machine falls back to `Idle`
    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    /// Whether the handshake has completed and the link is up
    pub async fn is_connected(&self) -> bool {
        self.connection.is_connected().await
    }

    /// Connection state machine
    #[must_use]
    pub const fn connection(&self) -> &ConnectionStateMachine {
        &self.connection
    }

    /// Recording state machine
    #[must_use]
    pub const fn recording(&self) -> &RecordingStateMachine {
        &self.recording
    }

    /// Telemetry session fed by the notification pump
    #[must_use]
    pub const fn session(&self) -> &TelemetrySession {
        &self.session
    }
}

impl Drop for VoltraDevice {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
