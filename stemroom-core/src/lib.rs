//! # stemroom-core — track model, session tokens and take history
//!
//! Everything here is transport-free: the realtime layer in
//! `stemroom-collab` drives these types over WebSockets, but every
//! operation can be exercised directly in-process.
//!
//! ```text
//! ┌──────────────┐   verify    ┌──────────────┐
//! │ TokenCodec   │ ──────────► │ Identity     │
//! └──────────────┘             └──────┬───────┘
//!                                     │ author
//!                                     ▼
//! ┌──────────────┐   read/set  ┌──────────────┐
//! │ TrackHistory │ ──────────► │SharedDocument│ ── observers ──► replication
//! └──────────────┘             │ (yrs map)    │
//!        ▲                     └──────────────┘
//!        │ Stem::from_upload
//! ┌──────────────────┐
//! │ UploadCoordinator│ ── presigned URL ──► object storage
//! └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`token`] — HS256 session token issue/verify
//! - [`document`] — register-per-key replicated map backed by yrs
//! - [`history`] — take/version operations layered on the document
//! - [`upload`] — scoped upload credentials for stem audio
//! - [`error`] — shared error taxonomy

pub mod document;
pub mod error;
pub mod history;
pub mod token;
pub mod upload;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

pub use document::{ChangeOrigin, DocumentChange, DocumentError, ObserverId, SharedDocument};
pub use error::{ErrorKind, TrackError};
pub use history::{TrackDocument, TrackHistory, TrackOp};
pub use token::{SessionClaims, TokenCodec, TokenError, TokenSecret};
pub use upload::{HmacUrlSigner, UploadCoordinator, UploadCredential, UploadRequest, UploadSigner};

/// Authenticated user attached to a connection or request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub subject_id: String,
    pub username: String,
    pub avatar: Option<String>,
}

impl Identity {
    pub fn new(subject_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            username: username.into(),
            avatar: None,
        }
    }

    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar = Some(avatar.into());
        self
    }
}

/// One audio layer of a take.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stem {
    pub id: String,
    #[serde(rename = "name")]
    pub display_name: String,
    #[serde(rename = "url")]
    pub storage_url: String,
    /// Zero until a client has decoded the audio and reported its length.
    #[serde(rename = "duration", default)]
    pub duration_seconds: f64,
    #[serde(default)]
    pub is_muted: bool,
    #[serde(default)]
    pub is_solo: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_avatar: Option<String>,
}

impl Stem {
    pub fn new(display_name: impl Into<String>, storage_url: impl Into<String>) -> Self {
        Self {
            id: short_id(),
            display_name: display_name.into(),
            storage_url: storage_url.into(),
            duration_seconds: 0.0,
            is_muted: false,
            is_solo: false,
            author_id: None,
            author_name: None,
            author_avatar: None,
        }
    }

    pub fn with_author(mut self, author: &Identity) -> Self {
        self.author_id = Some(author.subject_id.clone());
        self.author_name = Some(author.username.clone());
        self.author_avatar = author.avatar.clone();
        self
    }
}

/// Partial update for a stem. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StemUpdate {
    #[serde(default, rename = "name", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, rename = "url", skip_serializing_if = "Option::is_none")]
    pub storage_url: Option<String>,
    #[serde(default, rename = "duration", skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_muted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_solo: Option<bool>,
}

impl StemUpdate {
    pub fn apply_to(&self, stem: &mut Stem) {
        if let Some(name) = &self.display_name {
            stem.display_name = name.clone();
        }
        if let Some(url) = &self.storage_url {
            stem.storage_url = url.clone();
        }
        if let Some(duration) = self.duration_seconds {
            stem.duration_seconds = duration;
        }
        if let Some(muted) = self.is_muted {
            stem.is_muted = muted;
        }
        if let Some(solo) = self.is_solo {
            stem.is_solo = solo;
        }
    }
}

/// Timestamped remark pinned to a position in the take.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: String,
    /// Position in the take, in seconds.
    #[serde(rename = "timestamp")]
    pub timestamp_seconds: f64,
    pub text: String,
    #[serde(default)]
    pub author_id: String,
    #[serde(rename = "author")]
    pub author_name: String,
    /// Unix milliseconds.
    pub created_at: u64,
}

impl Comment {
    pub fn new(timestamp_seconds: f64, text: impl Into<String>, author: &Identity) -> Self {
        Self {
            id: short_id(),
            timestamp_seconds,
            text: text.into(),
            author_id: author.subject_id.clone(),
            author_name: author.username.clone(),
            created_at: unix_millis(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TakeAuthor {
    pub id: String,
    pub name: String,
}

impl From<&Identity> for TakeAuthor {
    fn from(identity: &Identity) -> Self {
        Self {
            id: identity.subject_id.clone(),
            name: identity.username.clone(),
        }
    }
}

/// A named snapshot of stems and comments in the track's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Take {
    pub id: String,
    #[serde(rename = "name")]
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub stems: Vec<Stem>,
    #[serde(default)]
    pub comments: Vec<Comment>,
    /// Unix milliseconds.
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<TakeAuthor>,
}

/// Short random id for takes, stems and comments.
pub fn short_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect()
}

pub fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
