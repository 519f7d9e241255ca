//! Durable room storage.
//!
//! ```text
//! TrackRoom ──append_update──► updates (LZ4, per-track seq)
//!     │
//!     └──last peer leaves──► save_snapshot ──► documents (LZ4) + compaction
//! ```

pub mod rocks;

pub use rocks::{DocumentStore, StoreConfig, StoreError, TrackMetadata};
