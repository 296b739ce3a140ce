use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{broadcast, RwLock},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    commands::CommandTable,
    connection::{ConnectionEvent, ConnectionStateMachine},
    error::{Result, Setting, VoltraError},
    protocol,
    session::TelemetrySession,
    types::{ConnectionState, RecordingState},
};

/// Inputs accepted by the recording lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingInput {
    /// Begin the PREPARE/SETUP sequence
    Prepare,
    /// PREPARE/SETUP sequence finished
    SetupComplete,
    /// PREPARE/SETUP sequence failed
    Fail,
    /// Engage the motor
    Engage,
    /// Disengage the motor, more sets pending
    Disengage,
    /// End the workout
    Stop,
    /// Final STOP written (or given up on)
    StopComplete,
    /// Connection left `Connected`
    ConnectionLost,
}

impl RecordingState {
    /// Pure transition function
    ///
    /// # Errors
    ///
    /// Returns [`VoltraError::InvalidStateTransition`] for inputs the current
    /// state does not accept.
    pub fn on(self, input: RecordingInput) -> Result<Self> {
        use RecordingInput as I;
        use RecordingState as S;

        match (self, input) {
            (S::Idle | S::Ready, I::Prepare) => Ok(S::Preparing),
            (S::Preparing, I::SetupComplete) => Ok(S::Ready),
            (S::Preparing, I::Fail) => Ok(S::Idle),
            (S::Idle | S::Ready, I::Engage) => Ok(S::Active),
            (S::Active | S::Ready, I::Disengage) => Ok(S::Ready),
            (S::Idle | S::Ready | S::Active, I::Stop) => Ok(S::Stopping),
            (S::Stopping, I::StopComplete) => Ok(S::Idle),
            (_, I::ConnectionLost) => Ok(S::Idle),
            (from, input) => Err(VoltraError::InvalidStateTransition {
                from: from.to_string(),
                input: format!("{input:?}"),
            }),
        }
    }
}

/// Events published by the [`RecordingStateMachine`]
#[derive(Debug, Clone, PartialEq)]
pub enum RecordingEvent {
    /// Lifecycle state changed
    StateChanged(RecordingState),
    /// Motor engaged
    Started,
    /// Workout ended
    Stopped {
        /// Elapsed recording time in seconds
        duration_secs: f64,
    },
    /// `prepare` or `engage` failed
    Error(VoltraError),
}

/// Owns the prepare/engage/disengage/stop lifecycle of one connected device
///
/// Only valid while the connection is `Connected`; whenever the connection
/// leaves that state the machine falls back to `Idle`. The reset happens both
/// from [`watch_connection`](Self::watch_connection) and lazily on every state
/// read, so callers never observe a stale engaged state.
///
/// Operations on one machine must not overlap; concurrent calls are a caller
/// error and are not arbitrated.
#[derive(Clone)]
pub struct RecordingStateMachine {
    connection: ConnectionStateMachine,
    session: TelemetrySession,
    state: Arc<RwLock<RecordingState>>,
    configured_weight: Arc<RwLock<Option<i32>>>,
    /// Recording time captured when a connection loss cut a set short
    interrupted_secs: Arc<RwLock<Option<f64>>>,
    events: broadcast::Sender<RecordingEvent>,
}

impl RecordingStateMachine {
    /// Create a machine in `Idle`
    pub fn new(
        connection: ConnectionStateMachine,
        session: TelemetrySession,
        event_capacity: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            connection,
            session,
            state: Arc::new(RwLock::new(RecordingState::Idle)),
            configured_weight: Arc::new(RwLock::new(None)),
            interrupted_secs: Arc::new(RwLock::new(None)),
            events,
        }
    }

    /// Subscribe to recording events
    pub fn subscribe(&self) -> broadcast::Receiver<RecordingEvent> {
        self.events.subscribe()
    }

    /// Current lifecycle state
    pub async fn state(&self) -> RecordingState {
        if !self.connection.is_connected().await {
            self.force_idle().await;
        }
        *self.state.read().await
    }

    /// Last base weight accepted by the device
    pub async fn configured_weight(&self) -> Option<i32> {
        *self.configured_weight.read().await
    }

    /// Telemetry session driven by this machine
    #[must_use]
    pub const fn session(&self) -> &TelemetrySession {
        &self.session
    }

    /// Enter workout mode: PREPARE, settle, SETUP, settle
    ///
    /// # Errors
    ///
    /// Returns [`VoltraError::NotConnected`] if the device is not connected,
    /// [`VoltraError::InvalidStateTransition`] unless `Idle` or `Ready`, or
    /// the write error; on write failure the machine returns to `Idle`.
    pub async fn prepare(&self) -> Result<()> {
        self.ensure_connected().await?;
        self.apply(RecordingInput::Prepare).await?;

        self.session.reset().await;
        self.session.set_weight(self.configured_weight().await).await;
        *self.interrupted_secs.write().await = None;

        let timing = *self.connection.timing();
        let result = async {
            self.connection.write(&protocol::prepare()).await?;
            tokio::time::sleep(Duration::from_millis(timing.prepare_delay_ms)).await;
            self.connection.write(&protocol::setup()).await?;
            tokio::time::sleep(Duration::from_millis(timing.setup_delay_ms)).await;
            Ok::<(), VoltraError>(())
        }
        .await;

        match result {
            Ok(()) => {
                self.apply(RecordingInput::SetupComplete).await?;
                info!("Workout mode ready");
                Ok(())
            }
            Err(e) => {
                error!("Prepare failed: {}", e);
                if self.apply(RecordingInput::Fail).await.is_err() {
                    self.force_idle().await;
                }
                let _ = self.events.send(RecordingEvent::Error(e.clone()));
                Err(e)
            }
        }
    }

    /// Engage the motor
    ///
    /// Legal from `Ready`, or from `Idle` to start another set without a full
    /// re-prepare. In any other state the call is logged and ignored.
    ///
    /// # Errors
    ///
    /// Returns [`VoltraError::NotConnected`] if the device is not connected,
    /// or the GO write error (the state is left unchanged).
    pub async fn engage(&self) -> Result<()> {
        self.ensure_connected().await?;

        let current = *self.state.read().await;
        if current.on(RecordingInput::Engage).is_err() {
            warn!("Ignoring engage while {}", current);
            return Ok(());
        }

        if let Err(e) = self.connection.write(&protocol::go()).await {
            error!("Engage failed: {}", e);
            let _ = self.events.send(RecordingEvent::Error(e.clone()));
            return Err(e);
        }

        self.apply(RecordingInput::Engage).await?;
        self.session.start_recording().await;
        info!("Motor engaged");
        let _ = self.events.send(RecordingEvent::Started);
        Ok(())
    }

    /// Disengage the motor and return to `Ready` for the next set
    ///
    /// A failed STOP write is logged and the machine still returns to `Ready`.
    /// Outside `Active`/`Ready` the call is logged and ignored.
    ///
    /// # Errors
    ///
    /// Returns [`VoltraError::NotConnected`] if the device is not connected.
    pub async fn disengage(&self) -> Result<()> {
        self.ensure_connected().await?;

        let current = *self.state.read().await;
        if current.on(RecordingInput::Disengage).is_err() {
            warn!("Ignoring disengage while {}", current);
            return Ok(());
        }

        if let Err(e) = self.connection.write(&protocol::stop()).await {
            warn!("STOP write failed while disengaging, continuing: {}", e);
        }

        self.apply(RecordingInput::Disengage).await?;
        info!("Motor disengaged");
        Ok(())
    }

    /// End the current set: capture its duration, then disengage
    ///
    /// # Errors
    ///
    /// Same as [`disengage`](Self::disengage).
    pub async fn end_set(&self) -> Result<f64> {
        let duration_secs = self.session.end_recording().await;
        self.disengage().await?;
        Ok(duration_secs)
    }

    /// End the workout and return the recording duration in seconds
    ///
    /// Local state always resolves to `Idle` and a
    /// [`RecordingEvent::Stopped`] is always emitted. A failed STOP write is
    /// logged, not returned. Time recorded before a connection loss counts
    /// towards the duration.
    ///
    /// # Errors
    ///
    /// Returns [`VoltraError::NotConnected`] if there was neither a
    /// connection to write STOP on nor a recording to report; local teardown
    /// has still happened.
    pub async fn stop(&self) -> Result<f64> {
        let interrupted = self.interrupted_secs.write().await.take();
        let was_recording = interrupted.is_some() || self.session.is_recording().await;
        let duration_secs = interrupted.unwrap_or(0.0) + self.session.end_recording().await;

        let outcome = if self.connection.is_connected().await {
            if self.apply(RecordingInput::Stop).await.is_err() {
                self.set_state(RecordingState::Stopping).await;
            }
            if let Err(e) = self.connection.write(&protocol::stop()).await {
                warn!("STOP write failed, stopping locally: {}", e);
            }
            if self.apply(RecordingInput::StopComplete).await.is_err() {
                self.force_idle().await;
            }
            Ok(duration_secs)
        } else {
            debug!("Stopping without a connection");
            self.force_idle().await;
            if was_recording {
                Ok(duration_secs)
            } else {
                Err(VoltraError::NotConnected)
            }
        };

        info!("Workout stopped after {:.1}s", duration_secs);
        let _ = self.events.send(RecordingEvent::Stopped { duration_secs });
        outcome
    }

    /// Set the base weight in pounds
    ///
    /// # Errors
    ///
    /// Returns [`VoltraError::InvalidSettingValue`] (nothing is written) for
    /// values not in the weight table, otherwise any write error.
    pub async fn set_weight(&self, pounds: i32) -> Result<()> {
        self.send_setting(Setting::Weight, pounds).await?;
        *self.configured_weight.write().await = Some(pounds);
        self.session.set_weight(Some(pounds)).await;
        Ok(())
    }

    /// Set the chains load in pounds
    ///
    /// # Errors
    ///
    /// Same as [`set_weight`](Self::set_weight), against the chains table.
    pub async fn set_chains(&self, pounds: i32) -> Result<()> {
        self.send_setting(Setting::Chains, pounds).await
    }

    /// Set the eccentric offset in pounds
    ///
    /// # Errors
    ///
    /// Same as [`set_weight`](Self::set_weight), against the eccentric table.
    pub async fn set_eccentric(&self, pounds: i32) -> Result<()> {
        self.send_setting(Setting::Eccentric, pounds).await
    }

    async fn send_setting(&self, setting: Setting, value: i32) -> Result<()> {
        let entry = CommandTable::for_setting(setting).lookup(value)?;
        self.ensure_connected().await?;
        info!("Setting {} to {}", setting, value);
        self.connection.send(entry).await
    }

    /// Reset to `Idle` whenever the connection leaves `Connected`
    ///
    /// The returned task ends when the connection machine is dropped.
    pub fn watch_connection(&self) -> JoinHandle<()> {
        let mut events = self.connection.subscribe();
        let machine = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ConnectionEvent::StateChanged(state))
                        if state != ConnectionState::Connected =>
                    {
                        machine.force_idle().await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if !machine.connection.is_connected().await {
                            machine.force_idle().await;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn ensure_connected(&self) -> Result<()> {
        if self.connection.is_connected().await {
            Ok(())
        } else {
            self.force_idle().await;
            Err(VoltraError::NotConnected)
        }
    }

    async fn force_idle(&self) {
        let previous = {
            let mut state = self.state.write().await;
            let previous = *state;
            *state = previous.on(RecordingInput::ConnectionLost).unwrap_or(RecordingState::Idle);
            previous
        };
        if previous != RecordingState::Idle {
            warn!("Recording reset from {} to Idle", previous);
            self.publish_state(RecordingState::Idle);
            if self.session.is_recording().await {
                let elapsed = self.session.end_recording().await;
                let mut interrupted = self.interrupted_secs.write().await;
                *interrupted.get_or_insert(0.0) += elapsed;
            }
        }
    }

    async fn apply(&self, input: RecordingInput) -> Result<RecordingState> {
        let next = {
            let mut state = self.state.write().await;
            let next = state.on(input)?;
            *state = next;
            next
        };
        self.publish_state(next);
        Ok(next)
    }

    async fn set_state(&self, next: RecordingState) {
        *self.state.write().await = next;
        self.publish_state(next);
    }

    fn publish_state(&self, state: RecordingState) {
        info!("Recording state: {}", state);
        let _ = self.events.send(RecordingEvent::StateChanged(state));
    }
}
