//! Share indexing for peer-to-peer file sharing.
//!
//! A [`Scanner`] walks the configured share roots into a masked snapshot. The
//! [`ShareCache`] keeps that snapshot in memory behind a full-text index and refreshes it
//! when its time-to-live runs out; the [`Repository`] mirrors it durably in SQLite so
//! searches and file resolution survive restarts.

pub mod browse;
pub mod cache;
pub mod config;
pub mod error;
pub mod fulltext;
pub mod model;
pub mod query;
pub mod repository;
pub mod scan;
pub mod service;

pub use cache::{CacheStats, Clock, RefreshEvent, ShareCache, SystemClock};
pub use config::{Config, ScanFailurePolicy, ShareConfig};
pub use error::{Error, Result};
pub use fulltext::{FullTextIndex, TokenIndex};
pub use model::{
    AttributeKind, BrowseDirectory, FileAttribute, FileEntry, FileMetadata, SharedDirectory,
    SharedFile,
};
pub use query::{MatchExpression, QueryError, SearchQuery};
pub use repository::{Repository, RepositoryStats};
pub use scan::{GenerationClock, ScanResult, ScanWarning, Scanner};
pub use service::{RescanSummary, ShareService};
