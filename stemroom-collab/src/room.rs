//! Track rooms: one authoritative replica per track id.
//!
//! ```text
//!             ┌──────────────── TrackRoom ────────────────┐
//! update ──►  │ Mutex<RoomState> ── SharedDocument ──┐     │
//! mutation ─► │        │                  observer ──┼──► BroadcastGroup ──► connections
//!             │        └── Awareness               └──► DocumentStore (append)
//!             └───────────────────────────────────────────┘
//! ```
//!
//! Every merge into a room happens under its mutex and the document
//! observer broadcasts from inside that merge, so peers receive updates in
//! exactly the order the room applied them. History operations submitted as
//! `Mutation` messages run read-compute-write under the same lock, which
//! makes them atomic per room.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex, RwLock};
use uuid::Uuid;

use stemroom_core::{
    ChangeOrigin, Identity, SharedDocument, TrackDocument, TrackError, TrackHistory, TrackOp,
};

use crate::broadcast::{BroadcastGroup, Frame};
use crate::presence::{Awareness, AwarenessMessage};
use crate::protocol::{SyncMessage, SERVER_SENDER};
use crate::storage::{DocumentStore, StoreError};

/// What a connection needs right after joining.
pub struct JoinHandshake {
    pub receiver: broadcast::Receiver<Arc<Frame>>,
    /// Room state vector at join time.
    pub state_vector: Vec<u8>,
    /// Presence list including the joining connection.
    pub presence: AwarenessMessage,
}

struct RoomState {
    doc: SharedDocument,
    awareness: Awareness,
}

/// Counters shared with the document observer.
#[derive(Default)]
struct RoomCounters {
    clock: AtomicU64,
    persisted_updates: AtomicU64,
    persist_failures: AtomicU64,
}

pub struct TrackRoom {
    track_id: String,
    state: Mutex<RoomState>,
    broadcast: Arc<BroadcastGroup>,
    store: Option<Arc<DocumentStore>>,
    counters: Arc<RoomCounters>,
}

impl TrackRoom {
    /// Create a room, restoring its document from `store` when present.
    pub fn open(
        track_id: &str,
        broadcast_capacity: usize,
        store: Option<Arc<DocumentStore>>,
    ) -> Result<Self, TrackError> {
        let doc = SharedDocument::new();
        if let Some(store) = &store {
            restore(&doc, store, track_id)?;
        }

        let broadcast = Arc::new(BroadcastGroup::new(broadcast_capacity));
        let counters = Arc::new(RoomCounters::default());

        // Installed after the restore so replayed history is neither
        // re-broadcast nor appended twice.
        {
            let track_id = track_id.to_string();
            let broadcast = broadcast.clone();
            let counters = counters.clone();
            let store = store.clone();
            doc.subscribe(move |change| {
                let clock = counters.clock.fetch_add(1, Ordering::SeqCst) + 1;
                let origin = match change.origin {
                    ChangeOrigin::Remote(Some(connection)) => Some(connection),
                    _ => None,
                };
                let msg = SyncMessage::update(
                    origin.unwrap_or(SERVER_SENDER),
                    &track_id,
                    clock,
                    change.update.to_vec(),
                );
                if let Err(e) = broadcast.broadcast(&msg, origin) {
                    log::error!("Failed to broadcast update {clock} in room {track_id}: {e}");
                }

                if let Some(store) = &store {
                    match store.append_update(&track_id, change.update) {
                        Ok(_) => {
                            counters.persisted_updates.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            counters.persist_failures.fetch_add(1, Ordering::Relaxed);
                            log::error!("Failed to persist update for room {track_id}: {e}");
                        }
                    }
                }
            });
        }

        Ok(Self {
            track_id: track_id.to_string(),
            state: Mutex::new(RoomState {
                doc,
                awareness: Awareness::new(),
            }),
            broadcast,
            store,
            counters,
        })
    }

    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    /// Admit a connection: subscribe it, register its presence and tell
    /// everyone else it arrived.
    pub async fn join(&self, connection_id: Uuid, identity: &Identity) -> JoinHandshake {
        let mut state = self.state.lock().await;
        self.admit(&mut state, connection_id, identity).await
    }

    /// Like [`TrackRoom::join`], but `None` when `max_peers` connections
    /// are already in the room.
    pub async fn try_join(
        &self,
        connection_id: Uuid,
        identity: &Identity,
        max_peers: usize,
    ) -> Option<JoinHandshake> {
        let mut state = self.state.lock().await;
        if state.awareness.len() >= max_peers {
            return None;
        }
        Some(self.admit(&mut state, connection_id, identity).await)
    }

    async fn admit(
        &self,
        state: &mut RoomState,
        connection_id: Uuid,
        identity: &Identity,
    ) -> JoinHandshake {
        let receiver = self.broadcast.add_peer(connection_id, identity.clone()).await;

        let joined = state.awareness.join(connection_id, identity);
        self.publish_presence(&joined, connection_id);
        log::info!(
            "Presence: {} joined room {} ({} connected)",
            identity.username,
            self.track_id,
            state.awareness.len()
        );

        JoinHandshake {
            receiver,
            state_vector: state.doc.state_vector(),
            presence: state.awareness.snapshot_for(connection_id),
        }
    }

    /// Drop a connection and its presence entry. Returns the number of
    /// connections still in the room.
    pub async fn leave(&self, connection_id: Uuid) -> usize {
        let mut state = self.state.lock().await;
        self.broadcast.remove_peer(&connection_id).await;
        if let Some(left) = state.awareness.leave(connection_id) {
            self.publish_presence(&left, connection_id);
            log::info!("Presence: connection {connection_id} left room {}", self.track_id);
        }
        state.awareness.len()
    }

    /// Replace the opaque presence state of a connection.
    pub async fn update_presence(&self, connection_id: Uuid, presence_state: Option<String>) -> bool {
        let mut state = self.state.lock().await;
        match state.awareness.update(connection_id, presence_state) {
            Some(msg) => {
                self.publish_presence(&msg, connection_id);
                true
            }
            None => false,
        }
    }

    fn publish_presence(&self, msg: &AwarenessMessage, origin: Uuid) {
        let result = SyncMessage::awareness(origin, &self.track_id, msg)
            .and_then(|wire| self.broadcast.broadcast(&wire, Some(origin)));
        if let Err(e) = result {
            log::error!("Failed to publish presence in room {}: {e}", self.track_id);
        }
    }

    /// Merge a CRDT update received from `origin`.
    ///
    /// The update is first merged into a scratch copy; it is refused with
    /// `InvalidRequest` when the result is not a readable, valid track, and
    /// the room document is left untouched.
    pub async fn apply_update(&self, origin: Uuid, update: &[u8]) -> Result<(), TrackError> {
        let state = self.state.lock().await;
        if let Err(e) = check_merge(&state.doc, update) {
            log::warn!("Refused update from {origin} in room {}: {e}", self.track_id);
            return Err(e);
        }
        state
            .doc
            .apply_update(update, ChangeOrigin::Remote(Some(origin)))?;
        Ok(())
    }

    /// Run a history operation on the authoritative replica.
    ///
    /// Returns whether the document changed.
    pub async fn apply_op(&self, author: &Identity, op: TrackOp) -> Result<bool, TrackError> {
        let state = self.state.lock().await;
        let name = op.name();
        let changed = TrackHistory::with_author(&state.doc, author.clone()).apply(op)?;
        log::debug!(
            "{name} by {} in room {}: changed={changed}",
            author.subject_id,
            self.track_id
        );
        Ok(changed)
    }

    /// Update carrying everything the holder of `state_vector` lacks.
    pub async fn sync_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, TrackError> {
        let state = self.state.lock().await;
        Ok(state.doc.encode_diff(state_vector)?)
    }

    pub async fn state_vector(&self) -> Vec<u8> {
        self.state.lock().await.doc.state_vector()
    }

    pub async fn encode_state(&self) -> Vec<u8> {
        self.state.lock().await.doc.encode_state()
    }

    pub async fn snapshot(&self) -> Result<TrackDocument, TrackError> {
        let state = self.state.lock().await;
        TrackDocument::read(&state.doc)
    }

    /// What a connection that fell behind the broadcast needs to catch up:
    /// the full document and the current presence list.
    pub async fn resync(&self, connection_id: Uuid) -> Result<Vec<SyncMessage>, TrackError> {
        let state = self.state.lock().await;
        Ok(vec![
            SyncMessage::sync_step2(SERVER_SENDER, &self.track_id, state.doc.encode_state()),
            SyncMessage::awareness(
                SERVER_SENDER,
                &self.track_id,
                &state.awareness.snapshot_for(connection_id),
            )?,
        ])
    }

    /// Write the full state to the store and compact its update log.
    /// Returns `false` when the room has no store.
    pub async fn persist_snapshot(&self) -> Result<bool, TrackError> {
        let Some(store) = &self.store else {
            return Ok(false);
        };
        // Held until the write lands so no update is logged between the
        // encode and the log compaction.
        let state = self.state.lock().await;
        let snapshot = state.doc.encode_state();
        let (store, track_id) = (store.clone(), self.track_id.clone());
        let meta = tokio::task::spawn_blocking(move || store.save_snapshot(&track_id, &snapshot))
            .await
            .map_err(|e| TrackError::Internal(format!("snapshot task: {e}")))??;
        drop(state);
        log::info!(
            "Persisted snapshot for room {} ({} bytes, seq {})",
            self.track_id,
            meta.compressed_size,
            meta.snapshot_seq
        );
        Ok(true)
    }

    pub async fn peer_count(&self) -> usize {
        self.broadcast.peer_count().await
    }

    pub fn broadcast_group(&self) -> &Arc<BroadcastGroup> {
        &self.broadcast
    }

    /// Updates merged since the room opened.
    pub fn clock(&self) -> u64 {
        self.counters.clock.load(Ordering::SeqCst)
    }

    pub fn persisted_updates(&self) -> u64 {
        self.counters.persisted_updates.load(Ordering::Relaxed)
    }

    pub fn persist_failures(&self) -> u64 {
        self.counters.persist_failures.load(Ordering::Relaxed)
    }
}

fn check_merge(doc: &SharedDocument, update: &[u8]) -> Result<(), TrackError> {
    let merged = doc.preview_update(update)?;
    TrackDocument::read(&merged)
        .map_err(|e| TrackError::InvalidRequest(format!("update leaves the track unreadable: {e}")))?
        .validate()
}

fn restore(doc: &SharedDocument, store: &DocumentStore, track_id: &str) -> Result<(), TrackError> {
    if !store.track_exists(track_id)? {
        return Ok(());
    }
    let snapshot_seq = match store.load_snapshot(track_id) {
        Ok(snapshot) => {
            doc.apply_update(&snapshot, ChangeOrigin::Remote(None))?;
            store.load_metadata(track_id)?.snapshot_seq
        }
        Err(StoreError::NotFound(_)) => 0,
        Err(e) => return Err(e.into()),
    };

    let updates = store.load_updates_since(track_id, snapshot_seq)?;
    for (seq, update) in &updates {
        if let Err(e) = doc.apply_update(update, ChangeOrigin::Remote(None)) {
            log::warn!("Skipping corrupt update {seq} for room {track_id}: {e}");
        }
    }
    if snapshot_seq > 0 || !updates.is_empty() {
        log::info!(
            "Restored room {track_id} from storage ({} pending updates)",
            updates.len()
        );
    }
    Ok(())
}

/// Live rooms keyed by track id.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<TrackRoom>>>,
    broadcast_capacity: usize,
    max_peers_per_room: usize,
    store: Option<Arc<DocumentStore>>,
}

impl RoomManager {
    pub fn new(
        broadcast_capacity: usize,
        max_peers_per_room: usize,
        store: Option<Arc<DocumentStore>>,
    ) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            broadcast_capacity,
            max_peers_per_room,
            store,
        }
    }

    /// Open the room if needed and admit the connection.
    ///
    /// The manager lock is only held for lookup and insert, so a busy or
    /// restoring room never delays joins to other rooms.
    pub async fn join(
        &self,
        track_id: &str,
        connection_id: Uuid,
        identity: &Identity,
    ) -> Result<(Arc<TrackRoom>, JoinHandshake), TrackError> {
        loop {
            let room = self.get_or_open(track_id).await?;
            let Some(handshake) = room
                .try_join(connection_id, identity, self.max_peers_per_room)
                .await
            else {
                return Err(TrackError::InvalidRequest(format!(
                    "room {track_id} is full ({} connections)",
                    self.max_peers_per_room
                )));
            };

            // The room may have been evicted between lookup and join.
            if self.is_resident(track_id, &room).await {
                return Ok((room, handshake));
            }
            log::debug!("Room {track_id} was evicted during join; retrying");
            room.leave(connection_id).await;
        }
    }

    /// Remove a connection. The last one out snapshots the room and evicts
    /// it when durable storage is configured; without storage the room
    /// stays resident so its document survives.
    pub async fn leave(&self, track_id: &str, connection_id: Uuid) -> Result<(), TrackError> {
        let Some(room) = self.get(track_id).await else {
            return Ok(());
        };
        if room.leave(connection_id).await > 0 || self.store.is_none() {
            return Ok(());
        }

        room.persist_snapshot().await?;

        let mut rooms = self.rooms.write().await;
        let still_empty = room.peer_count().await == 0;
        let same_room = rooms
            .get(track_id)
            .is_some_and(|resident| Arc::ptr_eq(resident, &room));
        if same_room && still_empty {
            rooms.remove(track_id);
            log::info!("Room {track_id} evicted (empty, {} active)", rooms.len());
        }
        Ok(())
    }

    /// Open every stored track so it is resident before clients arrive.
    pub async fn recover(&self) -> Result<usize, TrackError> {
        let Some(store) = self.store.clone() else {
            return Ok(0);
        };
        let track_ids = tokio::task::spawn_blocking(move || store.list_tracks())
            .await
            .map_err(|e| TrackError::Internal(format!("list tracks task: {e}")))??;

        let mut recovered = 0;
        for track_id in &track_ids {
            if self.get(track_id).await.is_some() {
                continue;
            }
            match self.open_detached(track_id).await {
                Ok(room) => {
                    let mut rooms = self.rooms.write().await;
                    if !rooms.contains_key(track_id) {
                        rooms.insert(track_id.clone(), Arc::new(room));
                        recovered += 1;
                    }
                }
                Err(e) => log::error!("Failed to recover room {track_id}: {e}"),
            }
        }
        log::info!("Recovery complete: {recovered}/{} rooms restored", track_ids.len());
        Ok(recovered)
    }

    async fn get_or_open(&self, track_id: &str) -> Result<Arc<TrackRoom>, TrackError> {
        if let Some(room) = self.get(track_id).await {
            return Ok(room);
        }
        let opened = self.open_detached(track_id).await?;

        // Another join may have opened the room meanwhile; theirs wins.
        let mut rooms = self.rooms.write().await;
        let count = rooms.len();
        let room = rooms.entry(track_id.to_string()).or_insert_with(|| {
            log::info!("Room {track_id} created ({} active)", count + 1);
            Arc::new(opened)
        });
        Ok(room.clone())
    }

    /// Open a room off the async workers; restoring reads RocksDB.
    async fn open_detached(&self, track_id: &str) -> Result<TrackRoom, TrackError> {
        let (track_id, capacity, store) = (
            track_id.to_string(),
            self.broadcast_capacity,
            self.store.clone(),
        );
        tokio::task::spawn_blocking(move || TrackRoom::open(&track_id, capacity, store))
            .await
            .map_err(|e| TrackError::Internal(format!("open room task: {e}")))?
    }

    async fn is_resident(&self, track_id: &str, room: &Arc<TrackRoom>) -> bool {
        self.rooms
            .read()
            .await
            .get(track_id)
            .is_some_and(|resident| Arc::ptr_eq(resident, room))
    }

    /// Snapshot every resident room.
    pub async fn persist_all(&self) -> Result<usize, TrackError> {
        let rooms: Vec<Arc<TrackRoom>> = self.rooms.read().await.values().cloned().collect();
        let mut persisted = 0;
        for room in rooms {
            if room.persist_snapshot().await? {
                persisted += 1;
            }
        }
        Ok(persisted)
    }

    pub async fn get(&self, track_id: &str) -> Option<Arc<TrackRoom>> {
        self.rooms.read().await.get(track_id).cloned()
    }

    /// Updates that failed to reach the store, summed over resident rooms.
    pub async fn persist_failures(&self) -> u64 {
        self.rooms
            .read()
            .await
            .values()
            .map(|room| room.persist_failures())
            .sum()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn track_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.rooms.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}
