use async_trait::async_trait;
use btleplug::{
    api::{
        Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
        WriteType,
    },
    platform::{Adapter, Manager, Peripheral},
};
use bytes::Bytes;
use futures::stream::StreamExt;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{broadcast, Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{Result, TransportError, VoltraError},
    transport::Transport,
    types::{DeviceId, DiscoveredDevice, LinkState},
    VOLTRA_NAME_PREFIX, VOLTRA_NOTIFY_CHAR_UUID, VOLTRA_SERVICE_UUID, VOLTRA_WRITE_CHAR_UUID,
};

const NOTIFICATION_CAPACITY: usize = 1024;
const LINK_EVENT_CAPACITY: usize = 16;

impl From<btleplug::Error> for TransportError {
    fn from(err: btleplug::Error) -> Self {
        match err {
            btleplug::Error::TimedOut(_) => Self::timeout(err.to_string()),
            other => Self::other(other.to_string()),
        }
    }
}

impl From<btleplug::Error> for VoltraError {
    fn from(err: btleplug::Error) -> Self {
        Self::Transport(err.into())
    }
}

fn parse_uuid(value: &str) -> std::result::Result<Uuid, TransportError> {
    Uuid::parse_str(value).map_err(|e| TransportError::other(format!("Invalid UUID {value}: {e}")))
}

/// Characteristics whose notifications are forwarded: telemetry, then
/// command echoes
fn notification_sources() -> std::result::Result<[Uuid; 2], TransportError> {
    Ok([
        parse_uuid(VOLTRA_NOTIFY_CHAR_UUID)?,
        parse_uuid(VOLTRA_WRITE_CHAR_UUID)?,
    ])
}

/// Whether an advertised name belongs to a Voltra unit
#[must_use]
pub fn is_voltra_name(name: &str) -> bool {
    name.starts_with(VOLTRA_NAME_PREFIX)
}

struct ActiveLink {
    peripheral: Peripheral,
    write_char: Characteristic,
    tasks: Vec<JoinHandle<()>>,
}

impl ActiveLink {
    fn stop_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Holds the open link, tagged with the connect attempt that installed it
///
/// A link-loss watcher only releases the link its own attempt installed, so a
/// late watcher can never tear down a newer connection.
struct LinkSlot<L> {
    current: Mutex<Option<(u64, L)>>,
    attempts: AtomicU64,
}

impl<L> LinkSlot<L> {
    fn new() -> Self {
        Self {
            current: Mutex::new(None),
            attempts: AtomicU64::new(0),
        }
    }

    fn next_attempt(&self) -> u64 {
        self.attempts.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Install `link`, returning whatever it replaced
    async fn install(&self, attempt: u64, link: L) -> Option<L> {
        self.current
            .lock()
            .await
            .replace((attempt, link))
            .map(|(_, previous)| previous)
    }

    /// Remove the link only if `attempt` installed it
    async fn release(&self, attempt: u64) -> Option<L> {
        let mut current = self.current.lock().await;
        if current.as_ref().is_some_and(|(owner, _)| *owner == attempt) {
            current.take().map(|(_, link)| link)
        } else {
            None
        }
    }

    async fn take(&self) -> Option<L> {
        self.current.lock().await.take().map(|(_, link)| link)
    }
}

/// [`Transport`] over Bluetooth Low Energy using the first local adapter
pub struct BleTransport {
    central: Adapter,
    peripherals: Arc<Mutex<HashMap<DeviceId, Peripheral>>>,
    link: Arc<LinkSlot<ActiveLink>>,
    link_state: Arc<RwLock<LinkState>>,
    notifications: broadcast::Sender<Bytes>,
    link_events: broadcast::Sender<LinkState>,
}

impl BleTransport {
    /// Open the first Bluetooth adapter
    ///
    /// # Errors
    ///
    /// Returns [`VoltraError::DeviceNotFound`] if no adapter is available, or
    /// [`VoltraError::Transport`] if the Bluetooth stack cannot be initialized.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let central = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(VoltraError::DeviceNotFound)?;

        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let (link_events, _) = broadcast::channel(LINK_EVENT_CAPACITY);

        Ok(Self {
            central,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
            link: Arc::new(LinkSlot::new()),
            link_state: Arc::new(RwLock::new(LinkState::Disconnected)),
            notifications,
            link_events,
        })
    }

    /// Scan for Voltra units advertising the workout service
    ///
    /// Discovered peripherals are remembered so they can be connected to by
    /// [`DeviceId`] afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`VoltraError::Transport`] if scanning fails.
    pub async fn scan(&self, duration: Duration) -> Result<Vec<DiscoveredDevice>> {
        info!("Scanning for Voltra devices for {:?}...", duration);

        let filter = ScanFilter {
            services: vec![parse_uuid(VOLTRA_SERVICE_UUID)?],
        };
        self.central.start_scan(filter).await?;
        tokio::time::sleep(duration).await;
        self.central.stop_scan().await?;

        let mut devices = Vec::new();
        let mut known = self.peripherals.lock().await;
        for peripheral in self.central.peripherals().await? {
            let Ok(Some(properties)) = peripheral.properties().await else {
                continue;
            };
            let Some(name) = properties.local_name.filter(|n| is_voltra_name(n)) else {
                continue;
            };

            let id = DeviceId::new(peripheral.address().to_string());
            info!("Found Voltra device: {} ({})", name, id);
            devices.push(DiscoveredDevice {
                id: id.clone(),
                name,
                rssi: properties.rssi,
            });
            known.insert(id, peripheral);
        }

        info!("Scan completed. Found {} Voltra device(s)", devices.len());
        Ok(devices)
    }

    async fn find_peripheral(&self, device: &DeviceId) -> std::result::Result<Peripheral, TransportError> {
        if let Some(peripheral) = self.peripherals.lock().await.get(device) {
            return Ok(peripheral.clone());
        }

        // Not scanned in this process; the adapter may still know it
        self.central
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.address().to_string() == device.as_str())
            .ok_or_else(|| TransportError::other(format!("Unknown device {device}")))
    }

    async fn set_link_state(&self, state: LinkState) {
        *self.link_state.write().await = state;
        let _ = self.link_events.send(state);
    }

    async fn spawn_forwarders(
        &self,
        peripheral: &Peripheral,
        attempt: u64,
    ) -> std::result::Result<Vec<JoinHandle<()>>, TransportError> {
        let sources = notification_sources()?;
        let mut notifications = peripheral.notifications().await?;
        let mut central_events = self.central.events().await?;

        let sender = self.notifications.clone();
        let forward = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if sources.contains(&notification.uuid) {
                    let _ = sender.send(Bytes::from(notification.value));
                }
            }
            debug!("Notification stream ended");
        });

        let peripheral_id = peripheral.id();
        let link = self.link.clone();
        let link_state = self.link_state.clone();
        let link_events = self.link_events.clone();
        let watch = tokio::spawn(async move {
            while let Some(event) = central_events.next().await {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    if id == peripheral_id {
                        warn!("BLE link dropped by peer");
                        *link_state.write().await = LinkState::Disconnected;
                        let _ = link_events.send(LinkState::Disconnected);
                        // Aborts this task too, so it must come last
                        if let Some(mut stale) = link.release(attempt).await {
                            stale.stop_tasks();
                        }
                        break;
                    }
                }
            }
        });

        Ok(vec![forward, watch])
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn connect(&self, device: &DeviceId) -> std::result::Result<(), TransportError> {
        info!("Connecting to {}", device);
        let peripheral = self.find_peripheral(device).await?;

        self.set_link_state(LinkState::Connecting).await;
        let attempt = self.link.next_attempt();
        let result = async {
            peripheral.connect().await?;
            peripheral.discover_services().await?;

            let service_uuid = parse_uuid(VOLTRA_SERVICE_UUID)?;
            let notify_uuid = parse_uuid(VOLTRA_NOTIFY_CHAR_UUID)?;
            let write_uuid = parse_uuid(VOLTRA_WRITE_CHAR_UUID)?;

            let service = peripheral
                .services()
                .into_iter()
                .find(|s| s.uuid == service_uuid)
                .ok_or_else(|| TransportError::other("Voltra service not found"))?;
            let find_char = |uuid: Uuid, label: &str| {
                service
                    .characteristics
                    .iter()
                    .find(|c| c.uuid == uuid)
                    .cloned()
                    .ok_or_else(|| TransportError::other(format!("{label} characteristic not found")))
            };
            let notify_char = find_char(notify_uuid, "Notify")?;
            let write_char = find_char(write_uuid, "Write")?;

            peripheral.subscribe(&notify_char).await?;
            // Echoes of written commands arrive here; the decoder ignores them
            if let Err(e) = peripheral.subscribe(&write_char).await {
                debug!("Write characteristic does not notify: {}", e);
            }

            let tasks = self.spawn_forwarders(&peripheral, attempt).await?;
            Ok::<_, TransportError>(ActiveLink {
                peripheral: peripheral.clone(),
                write_char,
                tasks,
            })
        }
        .await;

        match result {
            Ok(active) => {
                if let Some(mut previous) = self.link.install(attempt, active).await {
                    previous.stop_tasks();
                }
                self.set_link_state(LinkState::Connected).await;
                info!("BLE link up to {}", device);
                Ok(())
            }
            Err(e) => {
                let _ = peripheral.disconnect().await;
                self.set_link_state(LinkState::Disconnected).await;
                Err(e)
            }
        }
    }

    async fn disconnect(&self) -> std::result::Result<(), TransportError> {
        let active = self.link.take().await;
        let result = match active {
            Some(mut active) => {
                active.stop_tasks();
                active.peripheral.disconnect().await.map_err(TransportError::from)
            }
            None => Ok(()),
        };
        self.set_link_state(LinkState::Disconnected).await;
        result
    }

    async fn write(&self, data: &[u8]) -> std::result::Result<(), TransportError> {
        let current = self.link.current.lock().await;
        let (_, active) = current
            .as_ref()
            .ok_or_else(|| TransportError::other("BLE link not open"))?;

        debug!("BLE write: {:02X?}", data);
        active
            .peripheral
            .write(&active.write_char, data, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    fn subscribe_notifications(&self) -> broadcast::Receiver<Bytes> {
        self.notifications.subscribe()
    }

    fn subscribe_link_state(&self) -> broadcast::Receiver<LinkState> {
        self.link_events.subscribe()
    }

    async fn link_state(&self) -> LinkState {
        *self.link_state.read().await
    }
}
