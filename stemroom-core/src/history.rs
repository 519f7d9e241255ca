//! Take history: branching versions of a track on top of [`SharedDocument`].
//!
//! Every operation is read → compute → `set`. The read-compute-write span is
//! not atomic on its own; two replicas mutating from the same stale read lose
//! one of the writes. Callers that need every mutation to land route
//! [`TrackOp`]s through a single serialized processor (the room in
//! `stemroom-collab`) instead of mutating their own replica.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::SharedDocument;
use crate::error::TrackError;
use crate::{unix_millis, Comment, Identity, Stem, StemUpdate, Take, TakeAuthor};

pub const TAKES_KEY: &str = "takes";
pub const CURRENT_TAKE_KEY: &str = "currentTakeId";
pub const OWNER_KEY: &str = "ownerId";

/// Id of the take created by [`TrackHistory::initialize_if_empty`]. Fixed so
/// two replicas initialising concurrently agree on it.
pub const DEFAULT_TAKE_ID: &str = "take-1";

/// Decoded view of the document registers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackDocument {
    pub takes: Vec<Take>,
    pub current_take_id: Option<String>,
    pub owner_id: Option<String>,
}

impl TrackDocument {
    pub fn read(doc: &SharedDocument) -> Result<Self, TrackError> {
        Ok(Self {
            takes: decode_register(doc.get(TAKES_KEY)?, TAKES_KEY)?.unwrap_or_default(),
            current_take_id: decode_register(doc.get(CURRENT_TAKE_KEY)?, CURRENT_TAKE_KEY)?,
            owner_id: decode_register(doc.get(OWNER_KEY)?, OWNER_KEY)?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.takes.is_empty()
    }

    pub fn take(&self, take_id: &str) -> Option<&Take> {
        self.takes.iter().find(|t| t.id == take_id)
    }

    pub fn current_take(&self) -> Option<&Take> {
        self.current_take_id.as_deref().and_then(|id| self.take(id))
    }

    /// Take ids are unique, and `current_take_id` names one of the takes
    /// exactly when there are takes.
    pub fn validate(&self) -> Result<(), TrackError> {
        let mut ids = HashSet::new();
        if let Some(dup) = self.takes.iter().find(|t| !ids.insert(t.id.as_str())) {
            return Err(TrackError::InvalidRequest(format!(
                "duplicate take id {}",
                dup.id
            )));
        }
        match (&self.current_take_id, self.takes.is_empty()) {
            (None, true) => Ok(()),
            (Some(id), false) if self.take(id).is_some() => Ok(()),
            (Some(id), _) => Err(TrackError::InvalidRequest(format!(
                "current take {id} does not exist"
            ))),
            (None, false) => Err(TrackError::InvalidRequest(
                "track has takes but no current take".into(),
            )),
        }
    }
}

fn decode_register<T: serde::de::DeserializeOwned>(
    value: Option<Value>,
    key: &str,
) -> Result<Option<T>, TrackError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(v) => serde_json::from_value(v)
            .map(Some)
            .map_err(|e| TrackError::Internal(format!("register {key}: {e}"))),
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Value, TrackError> {
    serde_json::to_value(value).map_err(|e| TrackError::Internal(e.to_string()))
}

/// A history mutation in wire form, applied by [`TrackHistory::apply`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum TrackOp {
    Initialize,
    AddStem {
        stem: Stem,
    },
    AddComment {
        comment: Comment,
    },
    UpdateStem {
        #[serde(rename = "stemId")]
        stem_id: String,
        update: StemUpdate,
    },
    CreateTake {
        label: String,
        #[serde(default)]
        description: Option<String>,
    },
    SwitchTake {
        #[serde(rename = "takeId")]
        take_id: String,
    },
}

impl TrackOp {
    pub fn name(&self) -> &'static str {
        match self {
            TrackOp::Initialize => "initialize",
            TrackOp::AddStem { .. } => "addStem",
            TrackOp::AddComment { .. } => "addComment",
            TrackOp::UpdateStem { .. } => "updateStem",
            TrackOp::CreateTake { .. } => "createTake",
            TrackOp::SwitchTake { .. } => "switchTake",
        }
    }
}

/// Take operations against one replica, attributed to an optional author.
pub struct TrackHistory<'a> {
    doc: &'a SharedDocument,
    author: Option<Identity>,
}

impl<'a> TrackHistory<'a> {
    pub fn new(doc: &'a SharedDocument) -> Self {
        Self { doc, author: None }
    }

    pub fn with_author(doc: &'a SharedDocument, author: Identity) -> Self {
        Self {
            doc,
            author: Some(author),
        }
    }

    pub fn snapshot(&self) -> Result<TrackDocument, TrackError> {
        TrackDocument::read(self.doc)
    }

    /// Create the default take when the track has none.
    ///
    /// Returns `false` (and writes nothing) when takes already exist.
    pub fn initialize_if_empty(&self) -> Result<bool, TrackError> {
        let track = self.snapshot()?;
        if !track.is_empty() {
            return Ok(false);
        }

        let take = Take {
            id: DEFAULT_TAKE_ID.to_string(),
            label: "Take 1".to_string(),
            description: None,
            stems: Vec::new(),
            comments: Vec::new(),
            created_at: unix_millis(),
            author: self.author.as_ref().map(TakeAuthor::from),
        };

        let mut entries = vec![
            (TAKES_KEY, encode(&vec![take])?),
            (CURRENT_TAKE_KEY, Value::String(DEFAULT_TAKE_ID.to_string())),
        ];
        if let (None, Some(author)) = (&track.owner_id, &self.author) {
            entries.push((OWNER_KEY, Value::String(author.subject_id.clone())));
        }
        self.doc.set_many(entries)?;
        log::debug!("Initialized track with default take {DEFAULT_TAKE_ID}");
        Ok(true)
    }

    /// Append a stem to the current take. `false` when there is no current take.
    pub fn add_stem(&self, stem: Stem) -> Result<bool, TrackError> {
        self.modify_current(|take| {
            take.stems.push(stem);
            true
        })
    }

    /// Append a comment to the current take. `false` when there is no current take.
    pub fn add_comment(&self, comment: Comment) -> Result<bool, TrackError> {
        self.modify_current(|take| {
            take.comments.push(comment);
            true
        })
    }

    /// Patch a stem of the current take. `false` when the stem is not there.
    pub fn update_stem(&self, stem_id: &str, update: &StemUpdate) -> Result<bool, TrackError> {
        self.modify_current(|take| match take.stems.iter_mut().find(|s| s.id == stem_id) {
            Some(stem) => {
                update.apply_to(stem);
                true
            }
            None => false,
        })
    }

    /// Branch the current take into a new take and make it current.
    ///
    /// Stems and comments are copied by value; the two takes share nothing
    /// afterwards. An empty `label` becomes "Take N".
    pub fn create_new_take(
        &self,
        label: &str,
        description: Option<String>,
    ) -> Result<String, TrackError> {
        let mut track = self.snapshot()?;
        let source = track
            .current_take()
            .ok_or_else(|| TrackError::NotFound("no current take to branch from".into()))?;

        let id = crate::short_id();
        let label = if label.trim().is_empty() {
            format!("Take {}", track.takes.len() + 1)
        } else {
            label.to_string()
        };
        let take = Take {
            id: id.clone(),
            label,
            description,
            stems: source.stems.clone(),
            comments: source.comments.clone(),
            created_at: unix_millis(),
            author: self.author.as_ref().map(TakeAuthor::from),
        };
        track.takes.push(take);

        self.doc.set_many(vec![
            (TAKES_KEY, encode(&track.takes)?),
            (CURRENT_TAKE_KEY, Value::String(id.clone())),
        ])?;
        log::debug!("Branched take {id} from {:?}", track.current_take_id);
        Ok(id)
    }

    /// Make `take_id` current. Unknown ids fail with `NotFound` and leave
    /// the document untouched.
    pub fn switch_take(&self, take_id: &str) -> Result<(), TrackError> {
        let track = self.snapshot()?;
        if track.take(take_id).is_none() {
            return Err(TrackError::NotFound(format!("take {take_id}")));
        }
        if track.current_take_id.as_deref() == Some(take_id) {
            return Ok(());
        }
        self.doc
            .set(CURRENT_TAKE_KEY, Value::String(take_id.to_string()))?;
        Ok(())
    }

    /// Apply a wire-form operation. Returns whether the document changed.
    pub fn apply(&self, op: TrackOp) -> Result<bool, TrackError> {
        match op {
            TrackOp::Initialize => self.initialize_if_empty(),
            TrackOp::AddStem { stem } => self.add_stem(stem),
            TrackOp::AddComment { comment } => self.add_comment(comment),
            TrackOp::UpdateStem { stem_id, update } => self.update_stem(&stem_id, &update),
            TrackOp::CreateTake { label, description } => {
                self.create_new_take(&label, description).map(|_| true)
            }
            TrackOp::SwitchTake { take_id } => self.switch_take(&take_id).map(|_| true),
        }
    }

    fn modify_current<F>(&self, f: F) -> Result<bool, TrackError>
    where
        F: FnOnce(&mut Take) -> bool,
    {
        let mut track = self.snapshot()?;
        let Some(current_id) = track.current_take_id.clone() else {
            return Ok(false);
        };
        let Some(take) = track.takes.iter_mut().find(|t| t.id == current_id) else {
            return Ok(false);
        };
        if !f(take) {
            return Ok(false);
        }
        self.doc.set(TAKES_KEY, encode(&track.takes)?)?;
        Ok(true)
    }
}
