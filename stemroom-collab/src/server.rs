//! WebSocket sync server with per-track rooms.
//!
//! Architecture:
//! ```text
//! ws://host/{track_id}?token=…
//!        │
//!        ▼
//!   Connection FSM ──invalid──► close 1002 "authentication failed"
//!        │ admitted
//!        ▼
//!   RoomManager ── TrackRoom (track_id) ── SharedDocument ── BroadcastGroup
//!                        │                                       │
//!                        ├── Awareness (presence)                ▼
//!                        └── DocumentStore (RocksDB)     Client A, B, C …
//! ```
//!
//! After admission the server sends its state vector (`SyncStep1`) and the
//! presence snapshot; the client answers with its own `SyncStep1` and a
//! `SyncStep2` diff. From then on every merge at the room is fanned out as
//! an `Update` in merge order.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast::error::RecvError, RwLock};
use tokio::time::{interval_at, timeout, Instant};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use stemroom_core::{
    unix_seconds, HmacUrlSigner, Identity, TokenCodec, TokenSecret, TrackError, UploadCoordinator,
};

use crate::gateway::{room_from_path, token_from_query, CloseReason, Connection, AUTH_FAILED_REASON};
use crate::protocol::{MessageType, SyncMessage, SERVER_SENDER};
use crate::room::{RoomManager, TrackRoom};
use crate::storage::{DocumentStore, StoreConfig};

/// Object-storage settings for upload credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct ObjectStorageConfig {
    pub endpoint: String,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Base of the public URL stems are served from.
    pub public_base_url: Option<String>,
}

impl std::fmt::Debug for ObjectStorageConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStorageConfig")
            .field("endpoint", &self.endpoint)
            .field("bucket", &self.bucket)
            .field("access_key_id", &self.access_key_id)
            .field("public_base_url", &self.public_base_url)
            .finish_non_exhaustive()
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum connections per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Session token signing key
    pub token_secret: TokenSecret,
    /// Web application base URL, used for login redirects
    pub app_url: Option<String>,
    /// Upload credentials are refused when unset
    pub object_storage: Option<ObjectStorageConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
            storage_path: None,
            token_secret: TokenSecret::new(""),
            app_url: None,
            object_storage: None,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), TrackError> {
        if self.token_secret.is_empty() {
            return Err(TrackError::InvalidRequest(
                "token secret must not be empty".into(),
            ));
        }
        if self.broadcast_capacity == 0 {
            return Err(TrackError::InvalidRequest(
                "broadcast capacity must be positive".into(),
            ));
        }
        if self.max_peers_per_room == 0 {
            return Err(TrackError::InvalidRequest(
                "max peers per room must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    /// Connections closed during admission
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub persisted_snapshots: u64,
    /// Room updates that could not be appended to the store
    pub persist_failures: u64,
}

struct ServerContext {
    config: ServerConfig,
    codec: TokenCodec,
    rooms: RoomManager,
    uploads: Option<UploadCoordinator>,
    stats: RwLock<ServerStats>,
    store: Option<Arc<DocumentStore>>,
}

/// The sync server.
pub struct SyncServer {
    ctx: Arc<ServerContext>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Result<Self, TrackError> {
        config.validate()?;

        let store = match &config.storage_path {
            Some(path) => Some(Arc::new(DocumentStore::open(StoreConfig::new(path.clone()))?)),
            None => None,
        };
        let uploads = config.object_storage.as_ref().map(|storage| {
            let signer = HmacUrlSigner::new(
                storage.endpoint.clone(),
                storage.bucket.clone(),
                storage.access_key_id.clone(),
                storage.secret_access_key.as_bytes(),
            );
            UploadCoordinator::new(signer, storage.public_base_url.clone())
        });

        let ctx = ServerContext {
            codec: TokenCodec::new(config.token_secret.clone()),
            rooms: RoomManager::new(
                config.broadcast_capacity,
                config.max_peers_per_room,
                store.clone(),
            ),
            uploads,
            stats: RwLock::new(ServerStats::default()),
            store,
            config,
        };
        Ok(Self { ctx: Arc::new(ctx) })
    }

    /// Load every stored track into memory.
    pub async fn recover(&self) -> Result<usize, TrackError> {
        let recovered = self.ctx.rooms.recover().await?;
        self.ctx.stats.write().await.active_rooms = self.ctx.rooms.room_count().await;
        Ok(recovered)
    }

    /// Accept connections until the listener fails.
    pub async fn run(&self) -> Result<(), TrackError> {
        let recovered = self.recover().await?;
        if recovered > 0 {
            log::info!("Recovered {recovered} tracks from persistent storage");
        }

        let listener = TcpListener::bind(&self.ctx.config.bind_addr)
            .await
            .map_err(|e| TrackError::Internal(format!("bind {}: {e}", self.ctx.config.bind_addr)))?;
        log::info!("Sync server listening on {}", self.ctx.config.bind_addr);

        loop {
            let (stream, addr) = listener
                .accept()
                .await
                .map_err(|e| TrackError::Internal(format!("accept: {e}")))?;
            log::debug!("New TCP connection from {addr}");

            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(ctx, stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Snapshot every resident room; used on shutdown.
    pub async fn persist_all(&self) -> Result<usize, TrackError> {
        let persisted = self.ctx.rooms.persist_all().await?;
        if let Some(store) = &self.ctx.store {
            store.flush()?;
        }
        self.ctx.stats.write().await.persisted_snapshots += persisted as u64;
        Ok(persisted)
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.ctx.stats.read().await.clone();
        stats.persist_failures = self.ctx.rooms.persist_failures().await;
        stats
    }

    pub async fn room(&self, track_id: &str) -> Option<Arc<TrackRoom>> {
        self.ctx.rooms.get(track_id).await
    }

    pub fn bind_addr(&self) -> &str {
        &self.ctx.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.ctx.config
    }

    pub fn codec(&self) -> &TokenCodec {
        &self.ctx.codec
    }

    /// Post-login landing URL carrying `token`, when an app URL is set.
    pub fn login_redirect(&self, token: &str) -> Option<String> {
        self.ctx
            .config
            .app_url
            .as_deref()
            .map(|app_url| stemroom_core::token::login_redirect(app_url, token))
    }

    pub fn store(&self) -> Option<&Arc<DocumentStore>> {
        self.ctx.store.as_ref()
    }
}

type WsStream = tokio_tungstenite::WebSocketStream<TcpStream>;

async fn handle_connection(
    ctx: Arc<ServerContext>,
    stream: TcpStream,
    addr: SocketAddr,
) -> Result<(), TrackError> {
    let mut target: Option<(String, Option<String>)> = None;
    let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        match room_from_path(req.uri().path()) {
            Some(room) => {
                target = Some((room, token_from_query(req.uri().query())));
                Ok(resp)
            }
            None => {
                let mut err = ErrorResponse::new(Some("invalid track id".to_string()));
                *err.status_mut() = StatusCode::BAD_REQUEST;
                Err(err)
            }
        }
    })
    .await
    .map_err(|e| TrackError::InvalidRequest(format!("handshake: {e}")))?;

    let Some((room_id, token)) = target else {
        return Ok(());
    };

    {
        let mut s = ctx.stats.write().await;
        s.total_connections += 1;
    }

    let mut conn = Connection::new(room_id);
    let identity = match conn.admit(token.as_deref(), &ctx.codec, unix_seconds()) {
        Ok(identity) => identity,
        Err(reason) => {
            log::warn!("Rejected connection from {addr} to room {}: {reason:?}", conn.room());
            ctx.stats.write().await.rejected_connections += 1;
            reject(ws, &reason).await;
            return Ok(());
        }
    };
    log::info!(
        "Admitted {} ({}) from {addr} to room {}",
        identity.username,
        identity.subject_id,
        conn.room()
    );

    let (room, handshake) = match ctx.rooms.join(conn.room(), conn.id(), &identity).await {
        Ok(joined) => joined,
        Err(e) => {
            log::warn!("Room {} refused {}: {e}", conn.room(), identity.subject_id);
            let mut ws = ws;
            if let Ok(msg) = SyncMessage::error(conn.room(), &e) {
                if let Ok(bytes) = msg.encode() {
                    let _ = ws.send(Message::Binary(bytes.into())).await;
                }
            }
            let _ = ws
                .close(Some(CloseFrame {
                    code: CloseCode::Again,
                    reason: "room unavailable".into(),
                }))
                .await;
            return Ok(());
        }
    };

    {
        let mut s = ctx.stats.write().await;
        s.active_connections += 1;
        s.active_rooms = ctx.rooms.room_count().await;
    }

    let result = serve_admitted(&ctx, ws, &conn, &identity, &room, handshake).await;

    conn.close(match &result {
        Ok(()) => CloseReason::ClientClosed,
        Err(e) => CloseReason::Transport(e.to_string()),
    });
    drop(room);
    if let Err(e) = ctx.rooms.leave(conn.room(), conn.id()).await {
        log::error!("Failed to release room {}: {e}", conn.room());
    }

    let active_rooms = ctx.rooms.room_count().await;
    let mut s = ctx.stats.write().await;
    s.active_connections = s.active_connections.saturating_sub(1);
    s.active_rooms = active_rooms;
    log::info!("Connection {} from {addr} closed: {:?}", conn.id(), conn.state());
    result
}

/// Close an unadmitted socket with the reason's close code.
async fn reject(mut ws: WsStream, reason: &CloseReason) {
    let frame = CloseFrame {
        code: CloseCode::from(reason.close_code()),
        reason: AUTH_FAILED_REASON.into(),
    };
    if ws.close(Some(frame)).await.is_err() {
        return;
    }
    // Let the client acknowledge the close before the socket drops.
    let _ = timeout(Duration::from_secs(1), async {
        while let Some(Ok(_)) = ws.next().await {}
    })
    .await;
}

async fn serve_admitted(
    ctx: &ServerContext,
    ws: WsStream,
    conn: &Connection,
    identity: &Identity,
    room: &TrackRoom,
    handshake: crate::room::JoinHandshake,
) -> Result<(), TrackError> {
    let (mut ws_sender, mut ws_receiver) = ws.split();
    let mut broadcast_rx = handshake.receiver;
    let connection_id = conn.id();
    let room_id = conn.room();

    send(&mut ws_sender, &SyncMessage::sync_step1(SERVER_SENDER, room_id, handshake.state_vector)).await?;
    send(
        &mut ws_sender,
        &SyncMessage::awareness(SERVER_SENDER, room_id, &handshake.presence)?,
    )
    .await?;

    let period = Duration::from_secs(ctx.config.heartbeat_interval_secs.max(1));
    let mut heartbeat = interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        {
                            let mut s = ctx.stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += data.len() as u64;
                        }
                        let sync_msg = match SyncMessage::decode(&data) {
                            Ok(m) => m,
                            Err(e) => {
                                log::warn!("Malformed message on {connection_id}: {e}");
                                continue;
                            }
                        };
                        if sync_msg.room != room_id {
                            log::warn!(
                                "Connection {connection_id} sent a message for room {} while joined to {room_id}",
                                sync_msg.room
                            );
                            continue;
                        }
                        let reply = match dispatch(ctx, room, connection_id, identity, sync_msg).await {
                            Ok(reply) => reply,
                            Err(e) => {
                                if matches!(e, TrackError::Internal(_)) {
                                    log::error!("Request from {connection_id} failed: {e}");
                                } else {
                                    log::debug!("Request from {connection_id} rejected: {e}");
                                }
                                Some(SyncMessage::error(room_id, &e)?)
                            }
                        };
                        if let Some(reply) = reply {
                            send(&mut ws_sender, &reply).await?;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender
                            .send(Message::Pong(data))
                            .await
                            .map_err(crate::protocol::ProtocolError::from)?;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::debug!("Connection {connection_id} closed by client");
                        return Ok(());
                    }
                    Some(Err(e)) => {
                        return Err(crate::protocol::ProtocolError::from(e).into());
                    }
                    Some(Ok(_)) => {}
                }
            }

            frame = broadcast_rx.recv() => {
                match frame {
                    Ok(frame) => {
                        if frame.is_from(connection_id) {
                            continue;
                        }
                        ws_sender
                            .send(Message::Binary(frame.bytes.clone().into()))
                            .await
                            .map_err(crate::protocol::ProtocolError::from)?;
                    }
                    Err(RecvError::Lagged(n)) => {
                        log::warn!("Connection {connection_id} lagged by {n} messages; resending state and presence");
                        room.broadcast_group().record_dropped(n);
                        for msg in room.resync(connection_id).await? {
                            send(&mut ws_sender, &msg).await?;
                        }
                    }
                    Err(RecvError::Closed) => return Ok(()),
                }
            }

            _ = heartbeat.tick() => {
                ws_sender
                    .send(Message::Ping(Default::default()))
                    .await
                    .map_err(crate::protocol::ProtocolError::from)?;
            }
        }
    }
}

/// Handle one inbound message from an admitted connection. Returns the
/// direct reply, if any.
async fn dispatch(
    ctx: &ServerContext,
    room: &TrackRoom,
    connection_id: Uuid,
    identity: &Identity,
    msg: SyncMessage,
) -> Result<Option<SyncMessage>, TrackError> {
    let room_id = room.track_id();
    match msg.msg_type {
        MessageType::SyncStep1 => {
            let diff = room.sync_diff(&msg.payload).await?;
            Ok(Some(SyncMessage::sync_step2(SERVER_SENDER, room_id, diff)))
        }
        MessageType::SyncStep2 | MessageType::Update => {
            room.apply_update(connection_id, &msg.payload).await?;
            Ok(None)
        }
        MessageType::Mutation => {
            let op = msg.track_op()?;
            room.apply_op(identity, op).await?;
            Ok(None)
        }
        MessageType::Awareness => {
            use crate::presence::AwarenessMessage;
            match msg.awareness_message()? {
                // Identity fields come from the session; only state is taken.
                AwarenessMessage::Update(entry) => {
                    room.update_presence(connection_id, entry.state).await;
                }
                other => log::trace!("Ignoring client awareness message {other:?}"),
            }
            Ok(None)
        }
        MessageType::UploadRequest => {
            let request = msg.upload_request_payload()?;
            let uploads = ctx.uploads.as_ref().ok_or_else(|| {
                TrackError::UpstreamFailure("object storage is not configured".into())
            })?;
            let credential = uploads.request_upload_credential(Some(identity), &request)?;
            Ok(Some(SyncMessage::upload_grant(room_id, &credential)?))
        }
        MessageType::Ping => Ok(Some(SyncMessage::pong(room_id))),
        MessageType::Pong => Ok(None),
        other => Err(crate::protocol::ProtocolError::InvalidMessageType(other).into()),
    }
}

async fn send<S>(sink: &mut S, msg: &SyncMessage) -> Result<(), TrackError>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let bytes = msg.encode()?;
    sink.send(Message::Binary(bytes.into()))
        .await
        .map_err(crate::protocol::ProtocolError::from)?;
    Ok(())
}
