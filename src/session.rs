use bytes::Bytes;
use std::{collections::VecDeque, sync::Arc};
use tokio::{
    sync::{broadcast, RwLock},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::{
    decoder::decode,
    normalize::normalize,
    types::{DecodedEvent, Sample, TelemetryFrame},
};

/// Events published by a [`TelemetrySession`]
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    /// A frame was buffered
    Frame(TelemetryFrame),
    /// Device signalled the end of a repetition
    RepBoundary,
    /// Device signalled the end of a set
    SetBoundary,
    /// Sequence counter skipped; the frame was still processed
    SequenceGap {
        /// Sequence that should have arrived
        expected: u32,
        /// Sequence that did arrive
        received: u32,
    },
    /// Recording clock started
    RecordingStarted,
    /// Recording clock stopped
    RecordingEnded {
        /// Elapsed time in seconds
        duration_secs: f64,
    },
}

/// Point-in-time copy of the session state
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    /// Most recent frame
    pub current_frame: Option<TelemetryFrame>,
    /// Buffered frames, oldest first
    pub recent_frames: Vec<TelemetryFrame>,
    /// When the current recording started
    pub start_time: Option<Instant>,
    /// Configured base weight in pounds
    pub weight: Option<i32>,
    /// Whether a recording is in progress
    pub recording: bool,
    /// Last sequence number seen
    pub last_sequence: Option<u32>,
    /// Number of sequence gaps since the last reset
    pub gap_count: u64,
}

#[derive(Debug)]
struct SessionState {
    current_frame: Option<TelemetryFrame>,
    recent_frames: VecDeque<TelemetryFrame>,
    capacity: usize,
    start_time: Option<Instant>,
    weight: Option<i32>,
    recording: bool,
    last_sequence: Option<u32>,
    gap_count: u64,
}

impl SessionState {
    fn new(capacity: usize) -> Self {
        Self {
            current_frame: None,
            recent_frames: VecDeque::with_capacity(capacity),
            capacity,
            start_time: None,
            weight: None,
            recording: false,
            last_sequence: None,
            gap_count: 0,
        }
    }

    fn push(&mut self, frame: TelemetryFrame) {
        while self.recent_frames.len() >= self.capacity {
            self.recent_frames.pop_front();
        }
        self.recent_frames.push_back(frame);
        self.current_frame = Some(frame);
    }
}

/// Buffers decoded telemetry for the device's current recording
///
/// Cloning is cheap; clones share the same state. The session has a single
/// writer (the notification pump and the recording state machine); everyone
/// else reads snapshots or subscribes to events.
#[derive(Clone)]
pub struct TelemetrySession {
    state: Arc<RwLock<SessionState>>,
    events: broadcast::Sender<TelemetryEvent>,
}

impl TelemetrySession {
    /// Create a session keeping at most `capacity` recent frames
    ///
    /// A zero capacity is treated as one.
    pub fn new(capacity: usize, event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            state: Arc::new(RwLock::new(SessionState::new(capacity.max(1)))),
            events,
        }
    }

    /// Subscribe to telemetry events
    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.events.subscribe()
    }

    /// Decode and buffer one notification
    ///
    /// Malformed buffers are logged and reported as
    /// [`DecodedEvent::Unrecognized`]; they never interrupt the session.
    pub async fn process_notification(&self, data: &[u8]) -> DecodedEvent {
        let event = match decode(data) {
            Ok(event) => event,
            Err(e) => {
                debug!("Ignoring notification ({} bytes): {}", data.len(), e);
                return DecodedEvent::Unrecognized;
            }
        };

        match event {
            DecodedEvent::Frame(frame) => self.accept_frame(frame).await,
            DecodedEvent::RepBoundary => {
                let _ = self.events.send(TelemetryEvent::RepBoundary);
            }
            DecodedEvent::SetBoundary => {
                let _ = self.events.send(TelemetryEvent::SetBoundary);
            }
            DecodedEvent::Unrecognized => {}
        }

        event
    }

    async fn accept_frame(&self, frame: TelemetryFrame) {
        let gap = {
            let mut state = self.state.write().await;

            let gap = state.last_sequence.and_then(|last| {
                let expected = last.wrapping_add(1);
                (frame.sequence != expected).then_some(expected)
            });
            if gap.is_some() {
                state.gap_count += 1;
            }
            state.last_sequence = Some(frame.sequence);

            // Idle telemetry between sets must not start the clock
            if state.recording && state.start_time.is_none() {
                state.start_time = Some(Instant::now());
            }
            state.push(frame);
            gap
        };

        if let Some(expected) = gap {
            warn!(
                "Telemetry sequence gap: expected {}, received {}",
                expected, frame.sequence
            );
            let _ = self.events.send(TelemetryEvent::SequenceGap {
                expected,
                received: frame.sequence,
            });
        }

        let _ = self.events.send(TelemetryEvent::Frame(frame));
    }

    /// Clear everything except the configured weight
    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        let weight = state.weight;
        let capacity = state.capacity;
        *state = SessionState::new(capacity);
        state.weight = weight;
        debug!("Telemetry session reset");
    }

    /// Record the configured base weight
    pub async fn set_weight(&self, weight: Option<i32>) {
        self.state.write().await.weight = weight;
    }

    /// Mark the session as recording and stamp the start time if unset
    pub async fn start_recording(&self) {
        let newly_started = {
            let mut state = self.state.write().await;
            if state.start_time.is_none() {
                state.start_time = Some(Instant::now());
            }
            !std::mem::replace(&mut state.recording, true)
        };

        if newly_started {
            info!("Recording started");
            let _ = self.events.send(TelemetryEvent::RecordingStarted);
        }
    }

    /// Stop the recording clock and return elapsed seconds
    ///
    /// Returns `0.0` if the clock was never started. The start stamp is cleared
    /// so the next recording measures its own duration.
    pub async fn end_recording(&self) -> f64 {
        let (duration_secs, was_active) = {
            let mut state = self.state.write().await;
            let start = state.start_time.take();
            let was_recording = std::mem::replace(&mut state.recording, false);
            (
                start.map_or(0.0, |t| t.elapsed().as_secs_f64()),
                was_recording || start.is_some(),
            )
        };

        if was_active {
            info!("Recording ended after {:.1}s", duration_secs);
            let _ = self.events.send(TelemetryEvent::RecordingEnded { duration_secs });
        }
        duration_secs
    }

    /// Whether a recording is in progress
    pub async fn is_recording(&self) -> bool {
        self.state.read().await.recording
    }

    /// Most recent frame
    pub async fn current_frame(&self) -> Option<TelemetryFrame> {
        self.state.read().await.current_frame
    }

    /// Buffered frames, oldest first
    pub async fn recent_frames(&self) -> Vec<TelemetryFrame> {
        self.state.read().await.recent_frames.iter().copied().collect()
    }

    /// Buffered frames converted to physical units
    pub async fn recent_samples(&self) -> Vec<Sample> {
        self.state
            .read()
            .await
            .recent_frames
            .iter()
            .map(normalize)
            .collect()
    }

    /// Configured base weight
    pub async fn weight(&self) -> Option<i32> {
        self.state.read().await.weight
    }

    /// Copy of the whole state
    pub async fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.read().await;
        SessionSnapshot {
            current_frame: state.current_frame,
            recent_frames: state.recent_frames.iter().copied().collect(),
            start_time: state.start_time,
            weight: state.weight,
            recording: state.recording,
            last_sequence: state.last_sequence,
            gap_count: state.gap_count,
        }
    }

    /// Feed notifications from a transport subscription until it closes
    ///
    /// Notifications are processed in delivery order. If the pump falls behind
    /// and the channel drops buffers, the loss is logged and surfaces as a
    /// sequence gap on the next frame.
    pub fn attach(&self, mut notifications: broadcast::Receiver<Bytes>) -> JoinHandle<()> {
        let session = self.clone();
        tokio::spawn(async move {
            loop {
                match notifications.recv().await {
                    Ok(data) => {
                        session.process_notification(&data).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Notification pump lagged, {} buffers dropped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Notification stream closed");
                        break;
                    }
                }
            }
        })
    }
}
