//! The index writer and the idempotency/correction controller.
//!
//! Writes for one image happen in three phases: the primary record plus its
//! per-tag index entries as a single batch, then one signed increment per
//! discovery tag, then the owner aggregate. The phases are deliberately not
//! atomic; a failure between them leaves indexes written but counters stale
//! until the next correction run, which is the documented inconsistency
//! window.

use {
    crate::{
        record::{discovery_tags, ImageRecord},
        store::{RecordStore, StoreError},
    },
    std::{collections::BTreeSet, future::Future},
    tracing::{debug, warn},
};

/// What to do with an incoming file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// No record exists; process normally.
    New,

    /// A record exists and force-reprocessing is off; do nothing.
    Skip,

    /// Force-reprocessing is on; revert prior effects, then process.
    ForceCorrect,
}

/// Decide whether to skip, process, or force-reprocess the image.
pub async fn disposition(
    store: &dyn RecordStore,
    owner: &str,
    image_id: &str,
    force_reprocess: bool,
) -> Result<Disposition, StoreError> {
    if force_reprocess {
        return Ok(Disposition::ForceCorrect);
    }

    Ok(if store.get_record(owner, image_id).await?.is_some() {
        Disposition::Skip
    } else {
        Disposition::New
    })
}

/// Run `operation`, refreshing credentials and retrying exactly once if the
/// store reports they have expired.
async fn with_refresh<T, F, Fut>(store: &dyn RecordStore, mut operation: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    match operation().await {
        Err(StoreError::CredentialsExpired) => {
            store.refresh_credentials().await?;
            operation().await
        }
        other => other,
    }
}

/// Subtract the counter and aggregate effects of a previously-processed image
/// before it is reprocessed.
///
/// When `counters_were_reset`, the session-wide wipe has already zeroed the
/// tag counters, so per-tag decrements are skipped; stale index entries are
/// superseded by the subsequent batch either way.
///
/// Best-effort: failures are logged and swallowed so they never block
/// reprocessing, at the cost of a possible residual counter skew.
pub async fn undo_previous(
    store: &dyn RecordStore,
    owner: &str,
    image_id: &str,
    counters_were_reset: bool,
) {
    if let Err(e) = try_undo_previous(store, owner, image_id, counters_were_reset).await {
        warn!("unable to revert prior effects of {}: {:?}", image_id, e);
    }
}

async fn try_undo_previous(
    store: &dyn RecordStore,
    owner: &str,
    image_id: &str,
    counters_were_reset: bool,
) -> Result<(), StoreError> {
    let previous = match store.get_record(owner, image_id).await? {
        Some(record) => record,
        None => return Ok(()),
    };

    if !counters_were_reset {
        for tag in discovery_tags(&previous) {
            store.add_tag_count(owner, &tag, -1).await?;
        }
    }

    store
        .add_profile_totals(owner, -(previous.size as i64), -1)
        .await?;

    debug!("reverted prior effects of {}", image_id);

    Ok(())
}

/// Persist one image across the three write phases, returning its
/// discovery-tag set.
///
/// The primary batch must succeed for the image to count as processed; a
/// counter or aggregate failure afterwards is logged and dropped, since those
/// effects converge on the next correction run.
pub async fn write_image(
    store: &dyn RecordStore,
    record: &ImageRecord,
) -> Result<BTreeSet<String>, StoreError> {
    let tags = discovery_tags(record);
    let entries = record.tag_entries(&tags);

    with_refresh(store, || store.put_image(record, &entries)).await?;

    for tag in &tags {
        if let Err(e) = with_refresh(store, || store.add_tag_count(&record.owner, tag, 1)).await {
            warn!("dropping counter update for tag {:?}: {:?}", tag, e);
        }
    }

    if let Err(e) = with_refresh(store, || {
        store.add_profile_totals(&record.owner, record.size as i64, 1)
    })
    .await
    {
        warn!(
            "dropping profile aggregate update for {}: {:?}",
            record.owner, e
        );
    }

    Ok(tags)
}
