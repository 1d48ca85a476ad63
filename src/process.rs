//! The per-file processing pipeline and the concurrency coordinator.

use {
    crate::{
        identity,
        index::{self, Disposition},
        labeling::{self, Analysis, Labeler},
        metadata::{self, ExtractedImage},
        normalize,
        record::{ImageRecord, UNKNOWN},
        store::{BlobStore, RecordStore},
        Config, ProcessError,
    },
    chrono::{NaiveDateTime, Utc},
    futures::{stream, StreamExt},
    lazy_static::lazy_static,
    regex::Regex,
    std::{
        path::{Path, PathBuf},
        sync::Arc,
        time::Instant,
    },
    tokio::sync::OnceCell,
    tracing::{debug, info, warn},
};

/// Content type of every stored preview rendition.
pub const PREVIEW_CONTENT_TYPE: &str = "image/jpeg";

lazy_static! {
    static ref MAKE_PATTERN: Regex = normalize::tag_pattern("Make$|Manufacturer$");
    static ref MODEL_PATTERN: Regex = normalize::tag_pattern("Model$|UniqueCameraModel$");
    static ref LENS_PATTERN: Regex = normalize::tag_pattern("LensID$|LensModel$|^Lens$");
    static ref ISO_PATTERN: Regex = normalize::tag_pattern("ISO$");
    static ref APERTURE_PATTERN: Regex = normalize::tag_pattern("FNumber$|Aperture$");
    static ref SHUTTER_PATTERN: Regex = normalize::tag_pattern("ExposureTime$|ShutterSpeed$");
    static ref LATITUDE_PATTERN: Regex = normalize::tag_pattern("GPSLatitude$");
    static ref LATITUDE_REF_PATTERN: Regex = normalize::tag_pattern("GPSLatitudeRef$");
    static ref LONGITUDE_PATTERN: Regex = normalize::tag_pattern("GPSLongitude$");
    static ref LONGITUDE_REF_PATTERN: Regex = normalize::tag_pattern("GPSLongitudeRef$");
}

/// Result of processing one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Fully processed; carries the image identifier.
    Processed(String),

    /// A current record already existed and force-reprocessing was off.
    Skipped,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// The ingestion pipeline: extraction, normalization, labeling, and index
/// maintenance over pluggable external collaborators.
pub struct Pipeline {
    store: Arc<dyn RecordStore>,
    blobs: Arc<dyn BlobStore>,
    labeler: Arc<dyn Labeler>,
    config: Config,
    counters_reset: OnceCell<()>,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn RecordStore>,
        blobs: Arc<dyn BlobStore>,
        labeler: Arc<dyn Labeler>,
        config: Config,
    ) -> Self {
        Self {
            store,
            blobs,
            labeler,
            config,
            counters_reset: OnceCell::new(),
        }
    }

    /// Process every file in `files` for `owner`, `worker_count` at a time.
    ///
    /// Files are independent: no ordering is guaranteed across them, and one
    /// file's failure never aborts its siblings. Returns the overall tally.
    pub async fn run(&self, owner: &str, files: Vec<PathBuf>) -> RunSummary {
        let then = Instant::now();
        let total = files.len();

        info!("processing {} files for {}", total, owner);

        let mut results = stream::iter(files)
            .map(|path| async move {
                let name = path.to_string_lossy().into_owned();

                (name, self.process_path(owner, &path).await)
            })
            .buffer_unordered(self.config.worker_count.max(1));

        let mut summary = RunSummary::default();

        while let Some((name, result)) = results.next().await {
            match result {
                Ok(Outcome::Processed(image_id)) => {
                    debug!("processed {} as {}", name, image_id);

                    summary.processed += 1;
                }

                Ok(Outcome::Skipped) => summary.skipped += 1,

                Err(e) => {
                    warn!("failed to process {}: {:?}", name, e);

                    summary.failed += 1;
                }
            }
        }

        info!(
            "run took {:?} (processed {}; skipped {}; failed {})",
            then.elapsed(),
            summary.processed,
            summary.skipped,
            summary.failed
        );

        summary
    }

    /// Extract and process one source file.
    pub async fn process_path(&self, owner: &str, path: &Path) -> Result<Outcome, ProcessError> {
        let extracted = metadata::extract(&self.config.exiftool_path, path).await?;

        self.process_extracted(owner, extracted).await
    }

    /// Run the pipeline phases for one already-extracted image: resolve
    /// identity, decide disposition, store the preview, analyze it, and
    /// write the record, index entries, and counters.
    pub async fn process_extracted(
        &self,
        owner: &str,
        image: ExtractedImage,
    ) -> Result<Outcome, ProcessError> {
        let raw_date = identity::capture_date_raw(&image.metadata).ok_or_else(|| {
            ProcessError::MissingCaptureDate {
                name: image.filename.clone(),
            }
        })?;

        let capture_time = identity::parse_capture_date(&raw_date).ok_or_else(|| {
            ProcessError::MissingCaptureDate {
                name: image.filename.clone(),
            }
        })?;

        let image_id = identity::image_id(&raw_date, &image.filename);

        match index::disposition(
            self.store.as_ref(),
            owner,
            &image_id,
            self.config.force_reprocess,
        )
        .await?
        {
            Disposition::Skip => {
                debug!("{} already processed; skipping {}", image_id, image.filename);

                return Ok(Outcome::Skipped);
            }

            Disposition::ForceCorrect => {
                let counters_were_reset = self.ensure_counters_reset(owner).await;

                index::undo_previous(self.store.as_ref(), owner, &image_id, counters_were_reset)
                    .await;
            }

            Disposition::New => (),
        }

        let preview_key = format!(
            "protected/{}/{}/{}.jpg",
            owner,
            capture_time.format("%Y/%m/%d"),
            image.filename
        );

        self.blobs
            .put(&preview_key, &image.preview, PREVIEW_CONTENT_TYPE)
            .await?;

        let analysis = labeling::analyze(
            self.labeler.as_ref(),
            &image.preview,
            self.config.max_labels,
            self.config.min_confidence,
        )
        .await?;

        let record = assemble_record(owner, &image, image_id, capture_time, preview_key, analysis);

        let tags = index::write_image(self.store.as_ref(), &record).await?;

        debug!("indexed {} under {} tags", record.image_id, tags.len());

        Ok(Outcome::Processed(record.image_id))
    }

    /// Wipe the owner's tag counters exactly once per run, no matter how many
    /// workers reach a force-correction concurrently.
    ///
    /// Returns whether the wipe has happened, in which case per-file tag
    /// decrements must be skipped to avoid double-correcting. A failed wipe
    /// is retried by whichever worker gets here next.
    async fn ensure_counters_reset(&self, owner: &str) -> bool {
        if !self.config.reset_counters {
            return false;
        }

        let result = self
            .counters_reset
            .get_or_try_init(|| async {
                info!("wiping tag counters for {}", owner);

                self.store.reset_tag_counts(owner).await
            })
            .await;

        match result {
            Ok(()) => true,

            Err(e) => {
                warn!("tag counter wipe failed: {:?}", e);

                false
            }
        }
    }
}

fn assemble_record(
    owner: &str,
    image: &ExtractedImage,
    image_id: String,
    capture_time: NaiveDateTime,
    preview_key: String,
    analysis: Analysis,
) -> ImageRecord {
    let metadata = &image.metadata;

    let hardware = |pattern: &Regex| {
        normalize::fuzzy_tag(metadata, pattern).unwrap_or_else(|| UNKNOWN.to_owned())
    };

    let coordinate = |value_pattern: &Regex, reference_pattern: &Regex| {
        normalize::fuzzy_tag(metadata, value_pattern).and_then(|value| {
            normalize::parse_gps(
                &value,
                normalize::fuzzy_tag(metadata, reference_pattern).as_deref(),
            )
        })
    };

    ImageRecord {
        image_id,
        owner: owner.to_owned(),
        name: image.filename.clone(),
        capture_time,
        processed_at: Utc::now(),
        preview_key,
        size: image.preview.len() as u64,
        make: hardware(&MAKE_PATTERN),
        model: hardware(&MODEL_PATTERN),
        lens: hardware(&LENS_PATTERN),
        iso: normalize::fuzzy_tag(metadata, &ISO_PATTERN)
            .and_then(|value| normalize::parse_exif_numeric(&value)),
        aperture: normalize::fuzzy_tag(metadata, &APERTURE_PATTERN)
            .and_then(|value| normalize::parse_exif_numeric(&value)),
        shutter_speed: normalize::fuzzy_tag(metadata, &SHUTTER_PATTERN),
        latitude: coordinate(&LATITUDE_PATTERN, &LATITUDE_REF_PATTERN),
        longitude: coordinate(&LONGITUDE_PATTERN, &LONGITUDE_REF_PATTERN),
        labels: analysis.labels,
        faces: analysis.faces,
        metadata: normalize::sanitize_metadata(metadata),
    }
}
