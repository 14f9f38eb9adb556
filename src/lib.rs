//! Tag-indexed image retrieval.
//!
//! Images are scanned into a SQLite store, tagged by a multi-label
//! classifier and retrieved by requiring a set of tags to co-occur above a
//! probability floor, filtered by four content-rating scores.

pub mod database;
pub mod error;
pub mod ingest;
pub mod media;
pub mod ml;
pub mod models;
pub mod service;
pub mod utils;
pub mod vocabulary;

pub use database::curation::{DiffOutcome, TagDiff};
pub use database::{Store, StoreConfig};
pub use error::{EngineError, Result};
pub use ingest::tagger::{TagRunReport, Tagger};
pub use ml::engine::{Classification, Classifier, OnnxTagger};
pub use models::{ImageRecord, SearchFilters, SearchPage, SearchRequest, TagType};
pub use service::{ServedFile, TagIndex, TempUpload, UploadOutcome};
pub use utils::config::Config;
pub use vocabulary::Vocabulary;
