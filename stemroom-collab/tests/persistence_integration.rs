//! Persistence integration tests.
//!
//! Verifies:
//! - Rooms are snapshotted and evicted when the last connection leaves
//! - Evicted rooms are restored on the next connection
//! - Track content survives a server restart
//! - Updates logged before a crash (no snapshot) are replayed on recovery

use std::path::Path;
use std::sync::Arc;

use stemroom_collab::client::{SyncClient, SyncEvent};
use stemroom_collab::server::{ServerConfig, SyncServer};
use stemroom_collab::storage::{DocumentStore, StoreConfig};
use stemroom_core::{
    unix_seconds, SessionClaims, SharedDocument, Stem, TokenCodec, TokenSecret, TrackDocument,
    TrackHistory, TrackOp,
};
use tempfile::tempdir;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration, Instant};

const SECRET: &str = "persistence-test-secret";
const WAIT: Duration = Duration::from_secs(5);

// ─── Helpers ─────────────────────────────────────────────────────────────────

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn config(port: u16, db_path: &Path) -> ServerConfig {
    ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        storage_path: Some(db_path.to_path_buf()),
        token_secret: TokenSecret::new(SECRET),
        ..ServerConfig::default()
    }
}

struct RunningServer {
    server: Arc<SyncServer>,
    url: String,
    handle: JoinHandle<()>,
}

impl RunningServer {
    /// Stop accepting and release the store.
    async fn shutdown(self) {
        self.handle.abort();
        let _ = self.handle.await;
        drop(self.server);
    }
}

async fn start_server(db_path: &Path) -> RunningServer {
    let port = free_port().await;

    // The previous instance may still be releasing the RocksDB lock.
    let deadline = Instant::now() + WAIT;
    let server = loop {
        match SyncServer::new(config(port, db_path)) {
            Ok(server) => break Arc::new(server),
            Err(e) if Instant::now() < deadline => {
                log::debug!("store busy: {e}");
                sleep(Duration::from_millis(50)).await;
            }
            Err(e) => panic!("server did not start: {e}"),
        }
    };

    let running = server.clone();
    let handle = tokio::spawn(async move {
        running.run().await.unwrap();
    });

    // Recovery runs before the listener binds.
    let addr = format!("127.0.0.1:{port}");
    let deadline = Instant::now() + WAIT;
    while tokio::net::TcpStream::connect(&addr).await.is_err() {
        assert!(Instant::now() < deadline, "server never bound {addr}");
        sleep(Duration::from_millis(20)).await;
    }
    RunningServer {
        server,
        url: format!("ws://127.0.0.1:{port}"),
        handle,
    }
}

fn token_for(sub: &str, username: &str) -> String {
    TokenCodec::new(TokenSecret::new(SECRET))
        .issue(&SessionClaims::new(sub, username, unix_seconds(), 3600))
        .unwrap()
}

async fn connect(url: &str, room: &str) -> (SyncClient, UnboundedReceiver<SyncEvent>) {
    let mut client = SyncClient::new(url, room).with_token(token_for("1", "alice"));
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    timeout(WAIT, async {
        while let Some(event) = events.recv().await {
            if event == SyncEvent::Synced {
                return;
            }
        }
    })
    .await
    .unwrap();
    (client, events)
}

async fn wait_for_track<F>(client: &SyncClient, pred: F) -> TrackDocument
where
    F: Fn(&TrackDocument) -> bool,
{
    let deadline = Instant::now() + WAIT;
    loop {
        let track = client.track().unwrap();
        if pred(&track) {
            return track;
        }
        assert!(Instant::now() < deadline, "timed out, track is {track:?}");
        sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_for_eviction(server: &SyncServer, room: &str) {
    let deadline = Instant::now() + WAIT;
    while server.room(room).await.is_some() {
        assert!(Instant::now() < deadline, "room {room} was never evicted");
        sleep(Duration::from_millis(20)).await;
    }
}

async fn record_two_stems(url: &str, room: &str) {
    let (client, _events) = connect(url, room).await;
    client.submit(&TrackOp::Initialize).unwrap();
    for name in ["Vocals", "Keys"] {
        client
            .submit(&TrackOp::AddStem {
                stem: Stem::new(name, format!("https://cdn/{name}.wav")),
            })
            .unwrap();
    }
    wait_for_track(&client, |t| {
        t.current_take().map_or(0, |take| take.stems.len()) == 2
    })
    .await;
    client.disconnect().await;
}

fn stem_names(track: &TrackDocument) -> Vec<String> {
    track
        .current_take()
        .map(|take| take.stems.iter().map(|s| s.display_name.clone()).collect())
        .unwrap_or_default()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_last_leave_snapshots_and_evicts() {
    let dir = tempdir().unwrap();
    let running = start_server(&dir.path().join("db")).await;

    record_two_stems(&running.url, "track-42").await;
    wait_for_eviction(&running.server, "track-42").await;

    let store = running.server.store().unwrap();
    assert!(store.track_exists("track-42").unwrap());
    assert!(store.load_updates("track-42").unwrap().is_empty());

    let doc = SharedDocument::new();
    doc.apply_update(
        &store.load_snapshot("track-42").unwrap(),
        stemroom_core::ChangeOrigin::Remote(None),
    )
    .unwrap();
    assert_eq!(
        stem_names(&TrackDocument::read(&doc).unwrap()),
        vec!["Vocals", "Keys"]
    );
    running.shutdown().await;
}

#[tokio::test]
async fn test_evicted_room_restores_on_next_connection() {
    let dir = tempdir().unwrap();
    let running = start_server(&dir.path().join("db")).await;

    record_two_stems(&running.url, "track-42").await;
    wait_for_eviction(&running.server, "track-42").await;

    let (client, _events) = connect(&running.url, "track-42").await;
    let track = wait_for_track(&client, |t| !t.is_empty()).await;
    assert_eq!(stem_names(&track), vec!["Vocals", "Keys"]);
    assert_eq!(track.owner_id.as_deref(), Some("1"));
    running.shutdown().await;
}

#[tokio::test]
async fn test_track_survives_restart() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("db");

    // Phase 1: record, leave, stop
    {
        let running = start_server(&db_path).await;
        record_two_stems(&running.url, "track-42").await;
        wait_for_eviction(&running.server, "track-42").await;
        running.shutdown().await;
    }

    // Phase 2: fresh server over the same store
    let running = start_server(&db_path).await;
    assert!(running.server.room("track-42").await.is_some());
    assert_eq!(running.server.stats().await.active_rooms, 1);

    let (client, _events) = connect(&running.url, "track-42").await;
    let track = wait_for_track(&client, |t| !t.is_empty()).await;
    assert_eq!(stem_names(&track), vec!["Vocals", "Keys"]);
    running.shutdown().await;
}

#[tokio::test]
async fn test_logged_updates_replay_without_snapshot() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("db");

    // A crash before the last leave leaves only the update log behind.
    {
        let store = DocumentStore::open(StoreConfig::for_testing(&db_path)).unwrap();
        let doc = SharedDocument::new();
        let history = TrackHistory::new(&doc);
        history.initialize_if_empty().unwrap();
        let after_init = doc.state_vector();
        store.append_update("track-9", &doc.encode_state()).unwrap();

        history
            .add_stem(Stem::new("Strings", "https://cdn/strings.wav"))
            .unwrap();
        store
            .append_update("track-9", &doc.encode_diff(&after_init).unwrap())
            .unwrap();
        assert!(store.load_snapshot("track-9").is_err());
    }

    let running = start_server(&db_path).await;
    let room = running.server.room("track-9").await.unwrap();
    assert_eq!(stem_names(&room.snapshot().await.unwrap()), vec!["Strings"]);
    drop(room);
    running.shutdown().await;
}

#[tokio::test]
async fn test_persist_all_writes_resident_rooms() {
    let dir = tempdir().unwrap();
    let running = start_server(&dir.path().join("db")).await;

    let (client, _events) = connect(&running.url, "track-live").await;
    client.submit(&TrackOp::Initialize).unwrap();
    wait_for_track(&client, |t| !t.is_empty()).await;

    assert_eq!(running.server.persist_all().await.unwrap(), 1);
    let store = running.server.store().unwrap();
    assert!(store.load_snapshot("track-live").is_ok());
    assert_eq!(store.load_metadata("track-live").unwrap().update_count, 0);
    assert_eq!(running.server.stats().await.persisted_snapshots, 1);

    client.disconnect().await;
    running.shutdown().await;
}
