//! Replicated register-per-key map backed by a yrs document.
//!
//! Each key holds one JSON value written by full replacement, so concurrent
//! writes to the same key resolve last-writer-wins at every replica. Nothing
//! merges inside a value: two replicas that each append to a `takes` array
//! from the same stale read will converge on one of the two arrays.
//!
//! All mutations go through [`SharedDocument::set_many`] or
//! [`SharedDocument::apply_update`]; registered observers run synchronously
//! right after the merge, on the calling thread.

use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Any, Doc, Map, Out, ReadTxn, StateVector, Transact, Update};

use crate::error::TrackError;

/// Name of the root map inside the yrs document.
pub const TRACK_MAP: &str = "trackData";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocumentError {
    #[error("cannot decode update: {0}")]
    Decode(String),
    #[error("cannot merge update: {0}")]
    Merge(String),
    #[error("cannot serialize value: {0}")]
    Serialization(String),
    #[error("key {0} does not hold a JSON register")]
    UnexpectedValue(String),
}

impl From<DocumentError> for TrackError {
    fn from(e: DocumentError) -> Self {
        match e {
            DocumentError::Decode(_) => TrackError::InvalidRequest(e.to_string()),
            _ => TrackError::Internal(e.to_string()),
        }
    }
}

/// Where a merged change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// A `set` on this replica.
    Local,
    /// An update received from elsewhere, tagged with the sending
    /// connection when known.
    Remote(Option<Uuid>),
}

/// Passed to observers after every merge.
#[derive(Debug)]
pub struct DocumentChange<'a> {
    pub origin: ChangeOrigin,
    /// yrs v1 update that produced this change.
    pub update: &'a [u8],
}

pub type ObserverId = u64;

type Observer = Arc<dyn Fn(&DocumentChange<'_>) + Send + Sync>;

pub struct SharedDocument {
    doc: Doc,
    observers: Mutex<Vec<(ObserverId, Observer)>>,
    next_observer: AtomicU64,
}

impl SharedDocument {
    pub fn new() -> Self {
        Self::from_doc(Doc::new())
    }

    /// Replica with a fixed yrs client id (deterministic conflict
    /// resolution in tests).
    pub fn with_client_id(client_id: u64) -> Self {
        Self::from_doc(Doc::with_client_id(client_id))
    }

    fn from_doc(doc: Doc) -> Self {
        Self {
            doc,
            observers: Mutex::new(Vec::new()),
            next_observer: AtomicU64::new(1),
        }
    }

    /// Current value of `key`, if any replica ever wrote it.
    pub fn get(&self, key: &str) -> Result<Option<Value>, DocumentError> {
        let map = self.doc.get_or_insert_map(TRACK_MAP);
        let txn = self.doc.transact();
        match map.get(&txn, key) {
            None => Ok(None),
            Some(Out::Any(Any::String(json))) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| DocumentError::Serialization(e.to_string())),
            Some(_) => Err(DocumentError::UnexpectedValue(key.to_string())),
        }
    }

    pub fn set(&self, key: &str, value: Value) -> Result<(), DocumentError> {
        self.set_many(vec![(key, value)])
    }

    /// Replace several registers in one transaction (one update, one
    /// observer notification).
    pub fn set_many(&self, entries: Vec<(&str, Value)>) -> Result<(), DocumentError> {
        if entries.is_empty() {
            return Ok(());
        }
        let encoded: Vec<(&str, String)> = entries
            .into_iter()
            .map(|(key, value)| {
                serde_json::to_string(&value)
                    .map(|json| (key, json))
                    .map_err(|e| DocumentError::Serialization(e.to_string()))
            })
            .collect::<Result<_, _>>()?;

        let map = self.doc.get_or_insert_map(TRACK_MAP);
        let update = {
            let mut txn = self.doc.transact_mut();
            for (key, json) in encoded {
                map.insert(&mut txn, key, json);
            }
            txn.encode_update_v1()
        };

        self.notify(ChangeOrigin::Local, &update);
        Ok(())
    }

    /// Merge an update produced by another replica.
    pub fn apply_update(&self, update: &[u8], origin: ChangeOrigin) -> Result<(), DocumentError> {
        let decoded =
            Update::decode_v1(update).map_err(|e| DocumentError::Decode(e.to_string()))?;
        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(decoded)
                .map_err(|e| DocumentError::Merge(e.to_string()))?;
        }

        self.notify(origin, update);
        Ok(())
    }

    /// Encoded state vector (what this replica has already seen).
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Update containing everything the holder of `remote_state_vector`
    /// is missing.
    pub fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, DocumentError> {
        let sv = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| DocumentError::Decode(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Full document state as a single update.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Scratch replica holding this state with `update` merged on top.
    /// Neither this replica nor its observers see the merge.
    pub fn preview_update(&self, update: &[u8]) -> Result<SharedDocument, DocumentError> {
        let scratch = SharedDocument::new();
        scratch.apply_update(&self.encode_state(), ChangeOrigin::Remote(None))?;
        scratch.apply_update(update, ChangeOrigin::Remote(None))?;
        Ok(scratch)
    }

    pub fn client_id(&self) -> u64 {
        self.doc.client_id()
    }

    /// Register an observer; it runs after every local or remote merge.
    pub fn subscribe<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&DocumentChange<'_>) + Send + Sync + 'static,
    {
        let id = self.next_observer.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut observers) = self.observers.lock() {
            observers.push((id, Arc::new(observer)));
        }
        id
    }

    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        match self.observers.lock() {
            Ok(mut observers) => {
                let before = observers.len();
                observers.retain(|(oid, _)| *oid != id);
                observers.len() != before
            }
            Err(_) => false,
        }
    }

    fn notify(&self, origin: ChangeOrigin, update: &[u8]) {
        // Snapshot so observers may (un)subscribe without deadlocking.
        let observers: Vec<Observer> = match self.observers.lock() {
            Ok(observers) => observers.iter().map(|(_, o)| o.clone()).collect(),
            Err(_) => return,
        };
        let change = DocumentChange { origin, update };
        for observer in observers {
            observer(&change);
        }
    }
}

impl Default for SharedDocument {
    fn default() -> Self {
        Self::new()
    }
}
