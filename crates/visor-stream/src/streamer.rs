//! The per-session event streamer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use visor_core::{ControlFrame, RecorderEvent, SessionId, StreamingConfig, WireEvent, WireMetadata};

use crate::buffer::EventBuffer;
use crate::client::{ClientConnection, QueuedFrame};

/// Capacity of the ingest channel between the browser bridge and the session
/// task. Overflow drops the event rather than stalling the bridge.
const INGEST_CHANNEL_CAPACITY: usize = 1024;

struct Inner {
    buffer: EventBuffer,
    next_seq: u64,
}

/// Status snapshot exposed over the HTTP status endpoint.
#[derive(Clone, Debug, Serialize)]
pub struct StreamerStatus {
    /// Session this status describes.
    pub session_id: SessionId,
    /// Whether the session task is running.
    pub streaming_active: bool,
    /// Whether the buffer holds a FullSnapshot (late joins can be served).
    pub streaming_ready: bool,
    /// Total events sequenced.
    pub events_processed: u64,
    /// Events currently buffered.
    pub events_buffered: usize,
    /// Connected stream clients.
    pub connected_clients: usize,
}

/// Cloneable handle the recorder bridge uses to submit raw events.
#[derive(Clone)]
pub struct IngestHandle {
    session_id: SessionId,
    tx: mpsc::Sender<RecorderEvent>,
}

impl IngestHandle {
    /// Parse and submit a raw payload from the page bridge.
    ///
    /// Never blocks: malformed payloads are logged and dropped, and a full
    /// ingest channel drops the event rather than stalling the browser.
    pub fn submit_raw(&self, raw: &str) -> bool {
        let mut event = match RecorderEvent::parse(raw) {
            Ok(event) => event,
            Err(err) => {
                warn!(session_id = %self.session_id, error = %err, "dropping unparseable recorder event");
                return false;
            }
        };
        event.ensure_timestamp(now_millis());
        self.submit(event)
    }

    /// Submit an already-parsed event.
    pub fn submit(&self, event: RecorderEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(err) => {
                warn!(session_id = %self.session_id, error = %err, "ingest channel rejected event");
                false
            }
        }
    }
}

/// Per-session queue, sequencer, ring buffer, client registry, broadcaster.
pub struct EventStreamer {
    session_id: SessionId,
    config: StreamingConfig,
    state: Mutex<Inner>,
    clients: DashMap<String, Arc<ClientConnection>>,
    ingest_tx: mpsc::Sender<RecorderEvent>,
    ingest_rx: Mutex<Option<mpsc::Receiver<RecorderEvent>>>,
    cancel: CancellationToken,
    events_processed: AtomicU64,
    streaming_active: AtomicBool,
}

impl EventStreamer {
    /// Create a streamer for one session.
    #[must_use]
    pub fn new(session_id: SessionId, config: StreamingConfig) -> Arc<Self> {
        let (ingest_tx, ingest_rx) = mpsc::channel(INGEST_CHANNEL_CAPACITY);
        Arc::new(Self {
            state: Mutex::new(Inner {
                buffer: EventBuffer::new(config.event_buffer_size),
                next_seq: 0,
            }),
            session_id,
            config,
            clients: DashMap::new(),
            ingest_tx,
            ingest_rx: Mutex::new(Some(ingest_rx)),
            cancel: CancellationToken::new(),
            events_processed: AtomicU64::new(0),
            streaming_active: AtomicBool::new(false),
        })
    }

    /// The session this streamer serves.
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Handle for submitting recorder events.
    #[must_use]
    pub fn ingest_handle(&self) -> IngestHandle {
        IngestHandle {
            session_id: self.session_id.clone(),
            tx: self.ingest_tx.clone(),
        }
    }

    /// Spawn the session task that drains the ingest channel.
    ///
    /// Shutdown: cancel via [`shutdown`](Self::shutdown); remaining queued
    /// events are drained, then all viewers get `session_expired`.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let streamer = Arc::clone(self);
        let mut rx = streamer
            .ingest_rx
            .lock()
            .take()
            .expect("streamer started twice");
        self.streaming_active.store(true, Ordering::Relaxed);
        info!(session_id = %self.session_id, "event streaming started");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = streamer.cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => streamer.enqueue(event),
                        None => break,
                    },
                }
            }
            // Bounded drain of events already submitted.
            while let Ok(event) = rx.try_recv() {
                streamer.enqueue(event);
            }
            streamer.streaming_active.store(false, Ordering::Relaxed);
            streamer.broadcast_control(&ControlFrame::SessionExpired);
            for entry in streamer.clients.iter() {
                entry.value().close();
            }
            info!(session_id = %streamer.session_id, "event streaming stopped");
        })
    }

    /// Request shutdown of the session task.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Sequence, buffer, and fan out one recorder event.
    pub fn enqueue(&self, event: RecorderEvent) {
        let is_snapshot = event.is_full_snapshot();
        let wire = {
            let mut state = self.state.lock();
            let wire = WireEvent {
                session_id: self.session_id.clone(),
                timestamp: now_secs(),
                sequence_id: state.next_seq,
                metadata: is_snapshot.then(|| WireMetadata {
                    origin_url: None,
                    is_snapshot: Some(true),
                }),
                event,
            };
            state.next_seq += 1;
            state.buffer.push(wire.clone());
            wire
        };
        let _ = self.events_processed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("stream_events_total").increment(1);

        let Some(frame) = QueuedFrame::event(&wire) else {
            return;
        };

        for entry in self.clients.iter() {
            let client = entry.value();
            if client.is_closed() {
                continue;
            }
            if client.is_awaiting_snapshot() {
                if is_snapshot {
                    client.replace_queue(vec![frame.clone()]);
                    client.set_awaiting_snapshot(false);
                    debug!(client_id = %client.id, seq = wire.sequence_id, "held client released by snapshot");
                }
                continue;
            }
            if !client.try_push(frame.clone()) {
                self.reset_slow_client(client);
            }
        }
    }

    /// Register a new client and return its connection handle.
    #[must_use]
    pub fn register_client(&self, client_id: String) -> Arc<ClientConnection> {
        let client = Arc::new(ClientConnection::new(
            client_id.clone(),
            self.config.client_write_queue,
        ));
        let _ = self.clients.insert(client_id.clone(), Arc::clone(&client));
        metrics::gauge!("stream_clients_connected").increment(1.0);
        info!(session_id = %self.session_id, client_id, clients = self.clients.len(), "client registered");
        client
    }

    /// Deregister and close a client; outstanding sends are dropped.
    pub fn remove_client(&self, client_id: &str) {
        if let Some((_, client)) = self.clients.remove(client_id) {
            client.close();
            metrics::gauge!("stream_clients_connected").decrement(1.0);
            info!(session_id = %self.session_id, client_id, clients = self.clients.len(), "client removed");
        }
    }

    /// Look up a registered client.
    #[must_use]
    pub fn client(&self, client_id: &str) -> Option<Arc<ClientConnection>> {
        self.clients.get(client_id).map(|c| Arc::clone(c.value()))
    }

    /// Handle a `client_ready` handshake: replay the snapshot-anchored
    /// buffer suffix, or hold the client until the next snapshot (bounded by
    /// the configured wait, after which the channel expires).
    pub fn client_ready(self: &Arc<Self>, client_id: &str) {
        let Some(client) = self.client(client_id) else {
            return;
        };
        let suffix = self.state.lock().buffer.snapshot_suffix();
        match suffix {
            Some(events) => {
                let frames: Vec<QueuedFrame> = events.iter().filter_map(QueuedFrame::event).collect();
                debug!(client_id, frames = frames.len(), "replaying snapshot-anchored suffix");
                client.push_burst(frames);
            }
            None => {
                client.set_awaiting_snapshot(true);
                debug!(client_id, "no snapshot buffered, holding client");
                let streamer = Arc::clone(self);
                let client_id = client_id.to_string();
                let wait = Duration::from_secs(self.config.snapshot_wait_secs);
                let _ = tokio::spawn(async move {
                    tokio::time::sleep(wait).await;
                    if let Some(client) = streamer.client(&client_id) {
                        if client.is_awaiting_snapshot() && !client.is_closed() {
                            warn!(client_id, "snapshot wait expired, closing client");
                            if let Some(frame) = QueuedFrame::control(&ControlFrame::SessionExpired) {
                                client.push_burst(vec![frame]);
                            }
                            client.close();
                        }
                    }
                });
            }
        }
    }

    /// Re-send the snapshot-anchored suffix, preceded by a `sequence_reset`.
    pub fn sequence_reset_request(&self, client_id: &str) {
        let Some(client) = self.client(client_id) else {
            return;
        };
        let suffix = self.state.lock().buffer.snapshot_suffix();
        let Some(events) = suffix else {
            debug!(client_id, "sequence reset requested with no buffered snapshot");
            return;
        };
        let base = events[0].sequence_id;
        let mut frames = Vec::with_capacity(events.len() + 1);
        if let Some(reset) = QueuedFrame::control(&ControlFrame::SequenceReset { base }) {
            frames.push(reset);
        }
        frames.extend(events.iter().filter_map(QueuedFrame::event));
        client.push_burst(frames);
    }

    /// Current status snapshot.
    #[must_use]
    pub fn status(&self) -> StreamerStatus {
        let state = self.state.lock();
        StreamerStatus {
            session_id: self.session_id.clone(),
            streaming_active: self.streaming_active.load(Ordering::Relaxed),
            streaming_ready: state.buffer.has_snapshot(),
            events_processed: self.events_processed.load(Ordering::Relaxed),
            events_buffered: state.buffer.len(),
            connected_clients: self.clients.len(),
        }
    }

    /// Number of connected clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Send a control frame to every connected client.
    pub fn broadcast_control(&self, frame: &ControlFrame) {
        let Some(queued) = QueuedFrame::control(frame) else {
            return;
        };
        for entry in self.clients.iter() {
            entry.value().push_burst(vec![queued.clone()]);
        }
    }

    /// Slow-client policy: drop undelivered frames back to the newest
    /// buffered FullSnapshot and resume from a `sequence_reset`.
    fn reset_slow_client(&self, client: &Arc<ClientConnection>) {
        let suffix = self.state.lock().buffer.snapshot_suffix();
        match suffix {
            Some(events) => {
                let base = events[0].sequence_id;
                let mut frames = Vec::with_capacity(events.len() + 1);
                if let Some(reset) = QueuedFrame::control(&ControlFrame::SequenceReset { base }) {
                    frames.push(reset);
                }
                frames.extend(events.iter().filter_map(QueuedFrame::event));
                warn!(
                    client_id = %client.id,
                    base,
                    dropped = client.queue_len(),
                    "slow client reset to newest snapshot"
                );
                client.replace_queue(frames);
            }
            None => {
                warn!(client_id = %client.id, "slow client with no buffered snapshot, holding");
                client.replace_queue(Vec::new());
                client.set_awaiting_snapshot(true);
            }
        }
    }
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
