#![deny(warnings)]

//! Ingestion-and-indexing pipeline for raw camera images: metadata
//! normalization, idempotent re-processing, and maintenance of the derived
//! per-tag indexes and popularity counters.

use {
    anyhow::Result,
    std::{path::PathBuf, sync::Arc},
    structopt::StructOpt,
    thiserror::Error,
};

pub use {
    labeling::{
        analyze, Analysis, Disabled, FaceAttribute, FaceDetail, Label, Labeler, LabelingError,
        FACE_CONFIDENCE_THRESHOLD, UNCATEGORIZED_LABEL,
    },
    metadata::{extract, ExtractedImage},
    process::{Outcome, Pipeline, RunSummary, PREVIEW_CONTENT_TYPE},
    record::{
        discovery_tags, AgeRange, BoundingBox, FaceSummary, ImageRecord, TagIndexEntry, UNKNOWN,
    },
    store::{BlobStore, FsBlobStore, RecordStore, SqliteStore, StoreError},
};

mod identity;
mod index;
mod labeling;
mod metadata;
mod normalize;
mod process;
mod record;
mod schema;
mod store;

/// Per-file and per-run failure modes.
///
/// Failures are isolated per file: none of these abort the worker pool or
/// sibling tasks.
#[derive(Error, Debug)]
pub enum ProcessError {
    /// The metadata tool exited non-zero or returned no structured data.
    #[error("metadata extraction failed for {path}: {message}")]
    ExtractionFailed { path: String, message: String },

    /// No embedded-image tag yielded preview bytes.
    #[error("no embedded preview available in {path}")]
    NoPreviewAvailable { path: String },

    /// No candidate capture-date field was present or parseable.
    #[error("no usable capture date in {name}")]
    MissingCaptureDate { name: String },

    #[error(transparent)]
    Labeling(#[from] LabelingError),

    #[error("store write failed: {0}")]
    StoreWrite(#[from] StoreError),
}

/// Values consumed by the pipeline core.
///
/// Loading these (config files, environment) is the caller's concern.
#[derive(Clone, Debug)]
pub struct Config {
    /// Path to the exiftool binary.
    pub exiftool_path: String,

    /// Reprocess files that already have records, correcting tag and counter
    /// effects.
    pub force_reprocess: bool,

    /// Wipe all tag counters once at the start of a force-reprocessing run.
    pub reset_counters: bool,

    /// Maximum number of labels requested per image.
    pub max_labels: u32,

    /// Minimum confidence for returned labels.
    pub min_confidence: f32,

    /// Number of files processed concurrently.
    pub worker_count: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            exiftool_path: "exiftool".to_owned(),
            force_reprocess: false,
            reset_counters: false,
            max_labels: 15,
            min_confidence: 75.0,
            worker_count: 4,
        }
    }
}

#[derive(StructOpt, Debug)]
#[structopt(name = "carnus-ingest", about = "RAW photo ingestion and indexing backend")]
pub struct Options {
    /// Owner identifier under which records are stored
    #[structopt(long)]
    pub owner: String,

    /// SQLite database to create or reuse
    #[structopt(long)]
    pub state_file: String,

    /// Directory in which to store preview renditions
    #[structopt(long)]
    pub asset_directory: String,

    /// Path to the exiftool binary
    #[structopt(long, default_value = "exiftool")]
    pub exiftool: String,

    /// Reprocess files even if they already have records
    #[structopt(long)]
    pub force_reprocess: bool,

    /// Wipe all tag counters once before a force-reprocessing run
    #[structopt(long)]
    pub reset_counters: bool,

    /// Maximum number of labels to request per image
    #[structopt(long, default_value = "15")]
    pub max_labels: u32,

    /// Minimum confidence for returned labels
    #[structopt(long, default_value = "75")]
    pub min_confidence: f32,

    /// Number of files to process concurrently
    #[structopt(long, default_value = "4")]
    pub workers: usize,

    /// Files to process
    #[structopt(parse(from_os_str))]
    pub files: Vec<PathBuf>,
}

impl Options {
    pub fn config(&self) -> Config {
        Config {
            exiftool_path: self.exiftool.clone(),
            force_reprocess: self.force_reprocess,
            reset_counters: self.reset_counters,
            max_labels: self.max_labels,
            min_confidence: self.min_confidence,
            worker_count: self.workers,
        }
    }
}

/// Wire up the bundled store implementations and process `options.files`.
///
/// No labeling service is wired here, so records fall back to the
/// [UNCATEGORIZED_LABEL] sentinel; deployments with a labeling client
/// construct a [Pipeline] directly.
pub async fn run(options: &Options) -> Result<RunSummary> {
    let store = Arc::new(SqliteStore::open(&options.state_file).await?);
    let blobs = Arc::new(FsBlobStore::new(&options.asset_directory));

    let pipeline = Pipeline::new(store, blobs, Arc::new(Disabled), options.config());

    Ok(pipeline.run(&options.owner, options.files.clone()).await)
}
