//! WebSocket sync client for a track room.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect) with the session token in
//!   the connection URI
//! - A local replica kept in sync through the two-way state-vector handshake
//! - History mutations executed by the room (`submit`)
//! - Presence view and in-band upload credential requests
//!
//! Local edits made while disconnected stay in the replica and reach the
//! room through the handshake on the next `connect`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use stemroom_core::{
    ChangeOrigin, ObserverId, SharedDocument, TrackDocument, TrackError, TrackHistory, TrackOp,
    UploadCredential, UploadRequest,
};

use crate::gateway::AUTH_FAILED_CLOSE_CODE;
use crate::presence::{AwarenessMessage, PresenceEntry, PresenceView};
use crate::protocol::{MessageType, ProtocolError, SyncMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Closed by the server during admission; needs a fresh token.
    Rejected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    /// The server refused the session.
    Rejected { code: u16, reason: String },
    /// The room's answer to our state vector has been merged.
    Synced,
    /// A room update was merged into the local replica.
    RemoteUpdate { clock: u64 },
    PresenceChanged,
    UploadGranted(UploadCredential),
    Error(TrackError),
    Pong,
}

type Outgoing = Arc<Mutex<Option<mpsc::UnboundedSender<Message>>>>;

/// The sync client.
pub struct SyncClient {
    server_url: String,
    room: String,
    token: Option<String>,

    /// Local replica
    doc: Arc<SharedDocument>,
    observer: ObserverId,

    state: Arc<RwLock<ConnectionState>>,
    presence: Arc<RwLock<PresenceView>>,

    /// Writer task input; `None` while disconnected
    outgoing: Outgoing,
    clock: Arc<AtomicU64>,

    event_rx: Option<mpsc::UnboundedReceiver<SyncEvent>>,
    event_tx: mpsc::UnboundedSender<SyncEvent>,

    /// Sender id stamped on outgoing messages
    sender_id: Uuid,
}

impl SyncClient {
    pub fn new(server_url: impl Into<String>, room: impl Into<String>) -> Self {
        Self::with_document(server_url, room, Arc::new(SharedDocument::new()))
    }

    /// Client over an existing replica, e.g. one edited while offline.
    pub fn with_document(
        server_url: impl Into<String>,
        room: impl Into<String>,
        doc: Arc<SharedDocument>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let room = room.into();
        let outgoing: Outgoing = Arc::new(Mutex::new(None));
        let clock = Arc::new(AtomicU64::new(0));
        let sender_id = Uuid::new_v4();

        // Forward local edits while connected.
        let observer = {
            let outgoing = outgoing.clone();
            let clock = clock.clone();
            let room = room.clone();
            doc.subscribe(move |change| {
                if change.origin != ChangeOrigin::Local {
                    return;
                }
                let clock = clock.fetch_add(1, Ordering::SeqCst) + 1;
                let msg = SyncMessage::update(sender_id, &room, clock, change.update.to_vec());
                if let Ok(bytes) = msg.encode() {
                    push(&outgoing, Message::Binary(bytes.into()));
                }
            })
        };

        Self {
            server_url: server_url.into().trim_end_matches('/').to_string(),
            room,
            token: None,
            doc,
            observer,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            presence: Arc::new(RwLock::new(PresenceView::new())),
            outgoing,
            clock,
            event_rx: Some(event_rx),
            event_tx,
            sender_id,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// `{server_url}/{room}?token=…`
    pub fn connection_url(&self) -> String {
        match &self.token {
            Some(token) => format!("{}/{}?token={}", self.server_url, self.room, token),
            None => format!("{}/{}", self.server_url, self.room),
        }
    }

    /// Connect and start the handshake.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages and
    /// returns once the socket is open. Admission arrives as
    /// [`SyncEvent::Connected`], a refused token as [`SyncEvent::Rejected`].
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(self.connection_url()).await {
            Ok(connected) => connected,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(e.into());
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward the outgoing channel to the socket
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });
        if let Ok(mut slot) = self.outgoing.lock() {
            *slot = Some(out_tx);
        }

        // Our half of the handshake: "send me what I am missing".
        let step1 = SyncMessage::sync_step1(self.sender_id, &self.room, self.doc.state_vector());
        push(&self.outgoing, Message::Binary(step1.encode()?.into()));

        // `Connected` waits for the server's first message: a rejected
        // session only ever sees a close frame.
        let reader = Reader {
            state: self.state.clone(),
            room: self.room.clone(),
            sender_id: self.sender_id,
            doc: self.doc.clone(),
            outgoing: self.outgoing.clone(),
            presence: self.presence.clone(),
            events: self.event_tx.clone(),
        };
        let state = self.state.clone();
        let outgoing = self.outgoing.clone();
        let presence = self.presence.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let mut rejected = None;
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => reader.handle(&data).await,
                    Ok(Message::Close(frame)) => {
                        if let Some(frame) = frame {
                            let code = u16::from(frame.code);
                            if code == AUTH_FAILED_CLOSE_CODE {
                                rejected = Some((code, frame.reason.as_str().to_string()));
                            }
                        }
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::debug!("Connection to room {} failed: {e}", reader.room);
                        break;
                    }
                }
            }

            if let Ok(mut slot) = outgoing.lock() {
                *slot = None;
            }
            presence.write().await.clear();
            match rejected {
                Some((code, reason)) => {
                    log::warn!("Room {} rejected the session: {reason}", reader.room);
                    *state.write().await = ConnectionState::Rejected;
                    let _ = event_tx.send(SyncEvent::Rejected { code, reason });
                }
                None => {
                    *state.write().await = ConnectionState::Disconnected;
                    let _ = event_tx.send(SyncEvent::Disconnected);
                }
            }
        });

        Ok(())
    }

    /// Ask the room to run a history operation.
    pub fn submit(&self, op: &TrackOp) -> Result<(), ProtocolError> {
        let clock = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        let msg = SyncMessage::mutation(self.sender_id, &self.room, clock, op)?;
        self.send(msg)
    }

    /// Request an upload credential; the answer arrives as
    /// [`SyncEvent::UploadGranted`] or [`SyncEvent::Error`].
    pub fn request_upload(&self, request: &UploadRequest) -> Result<(), ProtocolError> {
        let msg = SyncMessage::upload_request(self.sender_id, &self.room, request)?;
        self.send(msg)
    }

    /// Publish opaque presence state (playhead, selection, ...).
    pub async fn set_presence_state(&self, state: Option<String>) -> Result<(), ProtocolError> {
        let connection_id = self.presence.read().await.local().unwrap_or_else(Uuid::nil);
        let entry = PresenceEntry {
            connection_id,
            user_id: String::new(),
            name: String::new(),
            avatar: None,
            state,
        };
        let msg = SyncMessage::awareness(self.sender_id, &self.room, &AwarenessMessage::Update(entry))?;
        self.send(msg)
    }

    pub fn ping(&self) -> Result<(), ProtocolError> {
        self.send(SyncMessage::ping(self.sender_id, &self.room))
    }

    fn send(&self, msg: SyncMessage) -> Result<(), ProtocolError> {
        let bytes = msg.encode()?;
        let slot = self
            .outgoing
            .lock()
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        match slot.as_ref() {
            Some(tx) => tx
                .send(Message::Binary(bytes.into()))
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Close the connection. The local replica is kept.
    pub async fn disconnect(&self) {
        push(&self.outgoing, Message::Close(None));
        if let Ok(mut slot) = self.outgoing.lock() {
            *slot = None;
        }
    }

    /// The local replica.
    pub fn document(&self) -> &Arc<SharedDocument> {
        &self.doc
    }

    /// History operations straight on the local replica (last-writer-wins
    /// per register; prefer [`submit`](Self::submit) for concurrent edits).
    pub fn history(&self) -> TrackHistory<'_> {
        TrackHistory::new(&self.doc)
    }

    pub fn track(&self) -> Result<TrackDocument, TrackError> {
        TrackDocument::read(&self.doc)
    }

    pub async fn presence(&self) -> PresenceView {
        self.presence.read().await.clone()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.doc.unsubscribe(self.observer);
        push(&self.outgoing, Message::Close(None));
    }
}

fn push(outgoing: &Outgoing, msg: Message) {
    if let Ok(slot) = outgoing.lock() {
        if let Some(tx) = slot.as_ref() {
            let _ = tx.send(msg);
        }
    }
}

/// Inbound side of one connection.
struct Reader {
    state: Arc<RwLock<ConnectionState>>,
    room: String,
    sender_id: Uuid,
    doc: Arc<SharedDocument>,
    outgoing: Outgoing,
    presence: Arc<RwLock<PresenceView>>,
    events: mpsc::UnboundedSender<SyncEvent>,
}

impl Reader {
    async fn handle(&self, data: &[u8]) {
        let msg = match SyncMessage::decode(data) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Malformed message from room {}: {e}", self.room);
                return;
            }
        };

        if matches!(msg.msg_type, MessageType::SyncStep1 | MessageType::Awareness) {
            self.mark_admitted().await;
        }

        let event = match msg.msg_type {
            MessageType::SyncStep1 => {
                match self.doc.encode_diff(&msg.payload) {
                    Ok(diff) => {
                        let reply = SyncMessage::sync_step2(self.sender_id, &self.room, diff);
                        if let Ok(bytes) = reply.encode() {
                            push(&self.outgoing, Message::Binary(bytes.into()));
                        }
                    }
                    Err(e) => log::warn!("Bad state vector from room {}: {e}", self.room),
                }
                None
            }
            MessageType::SyncStep2 | MessageType::Update => {
                match self.doc.apply_update(&msg.payload, ChangeOrigin::Remote(None)) {
                    Ok(()) if msg.msg_type == MessageType::SyncStep2 => Some(SyncEvent::Synced),
                    Ok(()) => Some(SyncEvent::RemoteUpdate { clock: msg.clock }),
                    Err(e) => {
                        log::warn!("Failed to merge update from room {}: {e}", self.room);
                        None
                    }
                }
            }
            MessageType::Awareness => match msg.awareness_message() {
                Ok(awareness) => self
                    .presence
                    .write()
                    .await
                    .handle(&awareness)
                    .then_some(SyncEvent::PresenceChanged),
                Err(e) => {
                    log::warn!("Bad awareness message from room {}: {e}", self.room);
                    None
                }
            },
            MessageType::UploadGrant => msg.upload_credential().ok().map(SyncEvent::UploadGranted),
            MessageType::Error => msg
                .error_payload()
                .ok()
                .map(|payload| SyncEvent::Error(payload.into_error())),
            MessageType::Pong => Some(SyncEvent::Pong),
            other => {
                log::debug!("Unhandled message type from room {}: {other:?}", self.room);
                None
            }
        };

        if let Some(event) = event {
            let _ = self.events.send(event);
        }
    }

    /// The server only starts the handshake for an admitted session.
    async fn mark_admitted(&self) {
        let mut state = self.state.write().await;
        if *state == ConnectionState::Connecting {
            *state = ConnectionState::Connected;
            let _ = self.events.send(SyncEvent::Connected);
        }
    }
}
