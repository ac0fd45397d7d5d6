use crate::clients::{AnalysisClient, BatchContext};
use crate::models::FusedRecord;
use futures::stream::{self, StreamExt};
use std::time::Instant;

/// Records after analysis, in their original order, plus the two phase markers.
#[derive(Debug)]
pub struct DispatchOutcome {
    pub records: Vec<FusedRecord>,
    pub upload_started: Instant,
    pub analysis_started: Instant,
    pub upload_failures: usize,
    pub analysis_failures: usize,
}

/// Splits records into consecutive batches of `batch_size`; the last one may be shorter.
pub fn into_batches(records: Vec<FusedRecord>, batch_size: usize) -> Vec<Vec<FusedRecord>> {
    let size = batch_size.max(1);
    let mut batches = Vec::new();
    let mut iter = records.into_iter().peekable();
    while iter.peek().is_some() {
        batches.push(iter.by_ref().take(size).collect());
    }
    batches
}

/// Uploads every frame image, then analyzes every uploaded frame.
///
/// At most `workers` batches are in flight in each phase. Records inside a
/// batch are handled one after another, so each record is only ever touched by
/// the task that owns its batch. Failures stay with the record that caused
/// them: a failed upload skips that record's analysis, a failed analysis
/// leaves its verdict empty.
pub async fn dispatch(
    client: &dyn AnalysisClient,
    records: Vec<FusedRecord>,
    batch_size: usize,
    workers: usize,
) -> DispatchOutcome {
    let workers = workers.max(1);
    let batches = into_batches(records, batch_size);
    let batch_count = batches.len();
    tracing::info!(batches = batch_count, workers, "dispatching frames for analysis");

    let upload_started = Instant::now();
    let uploaded: Vec<(Vec<FusedRecord>, usize)> = stream::iter(batches.into_iter().enumerate())
        .map(|(batch_index, batch)| upload_batch(client, batch_index, batch))
        .buffered(workers)
        .collect()
        .await;
    let upload_failures: usize = uploaded.iter().map(|(_, failed)| failed).sum();

    let analysis_started = Instant::now();
    let analyzed: Vec<(Vec<FusedRecord>, usize)> = stream::iter(uploaded.into_iter().enumerate())
        .map(|(batch_index, (batch, _))| analyze_batch(client, batch_index, batch_count, batch))
        .buffered(workers)
        .collect()
        .await;
    let analysis_failures: usize = analyzed.iter().map(|(_, failed)| failed).sum();

    let records: Vec<FusedRecord> = analyzed.into_iter().flat_map(|(batch, _)| batch).collect();
    tracing::info!(
        records = records.len(),
        upload_failures,
        analysis_failures,
        "analysis dispatch finished"
    );

    DispatchOutcome { records, upload_started, analysis_started, upload_failures, analysis_failures }
}

async fn upload_batch(
    client: &dyn AnalysisClient,
    batch_index: usize,
    mut batch: Vec<FusedRecord>,
) -> (Vec<FusedRecord>, usize) {
    let mut failed = 0;
    for record in batch.iter_mut() {
        match client.upload_image(&record.filepath).await {
            Ok(file_id) => {
                tracing::debug!(batch = batch_index, frame = %record.filename, file_id = %file_id, "image uploaded");
                record.external_reference_id = Some(file_id);
            }
            Err(e) => {
                failed += 1;
                tracing::error!(batch = batch_index, frame = %record.filename, "image upload failed: {:#}", e);
            }
        }
    }
    (batch, failed)
}

async fn analyze_batch(
    client: &dyn AnalysisClient,
    batch_index: usize,
    batch_count: usize,
    mut batch: Vec<FusedRecord>,
) -> (Vec<FusedRecord>, usize) {
    let batch_len = batch.len();
    let mut failed = 0;
    for (position, record) in batch.iter_mut().enumerate() {
        let Some(file_id) = record.external_reference_id.clone() else {
            failed += 1;
            continue;
        };
        let ctx = BatchContext { batch_index, batch_count, batch_len, position };
        match client.analyze(&file_id, &ctx).await {
            Ok(verdict) => record.analysis = verdict,
            Err(e) => {
                failed += 1;
                tracing::warn!(batch = batch_index, frame = %record.filename, "analysis failed: {:#}", e);
            }
        }
    }
    tracing::info!(batch = batch_index + 1, of = batch_count, "batch analyzed");
    (batch, failed)
}
