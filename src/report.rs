use crate::models::{DefectCategory, FusedRecord};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const HISTOGRAM_BUCKETS: [&str; 5] = ["0-19", "20-39", "40-59", "60-79", "80-100"];

/// Run-wide summary written to the overview document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub video: String,
    pub generated_at: DateTime<Utc>,
    pub total_frames: usize,
    pub counts: BTreeMap<DefectCategory, usize>,
    pub average_confidence: BTreeMap<DefectCategory, f64>,
    pub road_health_index_average: Option<f64>,
    pub health_histogram: BTreeMap<String, usize>,
    pub detections: Vec<Detection>,
    pub seconds_analyzed: u64,
    pub minutes_analyzed: u64,
}

/// A positive finding at or above the confidence threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub filename: String,
    pub category: DefectCategory,
    pub confidence: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
}

/// Histogram bucket for a 0-100 health index; anything else has no bucket.
pub fn histogram_bucket(value: f64) -> Option<usize> {
    if !(0.0..=100.0).contains(&value) {
        return None;
    }
    Some(((value / 20.0).floor() as usize).min(4))
}

/// `(seconds, minutes)` of footage covered by `frame_count` samples. Half
/// seconds round to even.
pub fn coverage(frame_count: usize, sampling_rate: f64) -> (u64, u64) {
    if sampling_rate <= 0.0 {
        return (0, 0);
    }
    let seconds = (frame_count as f64 / sampling_rate).round_ties_even() as u64;
    (seconds, seconds / 60)
}

pub fn high_confidence_detections(records: &[FusedRecord], threshold: f64) -> Vec<Detection> {
    let mut detections = Vec::new();
    for record in records {
        for category in DefectCategory::ALL {
            if record.analysis.is_confident(category, threshold) {
                detections.push(Detection {
                    filename: record.filename.clone(),
                    category,
                    confidence: record.analysis.confidence(category).unwrap_or(0.0),
                    latitude: record.latitude,
                    longitude: record.longitude,
                    timestamp: record.timestamp,
                });
            }
        }
    }
    detections
}

pub fn summarize(records: &[FusedRecord], video: &str, sampling_rate: f64, threshold: f64) -> RunSummary {
    let total = records.len();

    let mut counts = BTreeMap::new();
    let mut average_confidence = BTreeMap::new();
    for category in DefectCategory::ALL {
        let positives = records.iter().filter(|r| r.analysis.is_positive(category)).count();
        let confidence_sum: f64 = records
            .iter()
            .map(|r| r.analysis.confidence(category).unwrap_or(0.0))
            .sum();
        counts.insert(category, positives);
        average_confidence.insert(category, if total > 0 { confidence_sum / total as f64 } else { 0.0 });
    }

    let indices: Vec<f64> = records.iter().filter_map(|r| r.analysis.road_health_index).collect();
    let road_health_index_average =
        (!indices.is_empty()).then(|| indices.iter().sum::<f64>() / indices.len() as f64);

    let mut buckets = [0usize; 5];
    for value in &indices {
        match histogram_bucket(*value) {
            Some(i) => buckets[i] += 1,
            None => tracing::warn!("health index {} outside 0-100, left out of histogram", value),
        }
    }
    let health_histogram = HISTOGRAM_BUCKETS
        .iter()
        .zip(buckets)
        .map(|(label, n)| (label.to_string(), n))
        .collect();

    let (seconds_analyzed, minutes_analyzed) = coverage(total, sampling_rate);

    RunSummary {
        run_id: Uuid::new_v4(),
        video: video.to_string(),
        generated_at: Utc::now(),
        total_frames: total,
        counts,
        average_confidence,
        road_health_index_average,
        health_histogram,
        detections: high_confidence_detections(records, threshold),
        seconds_analyzed,
        minutes_analyzed,
    }
}

async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("failed to write {}", path.display()))
}

/// One JSON document beside each frame image. A failed write does not stop
/// the remaining ones.
pub async fn write_record_documents(records: &[FusedRecord]) -> Result<()> {
    let mut failed = 0usize;
    for record in records {
        if let Err(e) = write_json(&record.json_path(), record).await {
            failed += 1;
            tracing::error!(frame = %record.filename, "failed to save record document: {:#}", e);
        }
    }
    if failed > 0 {
        return Err(anyhow!("failed to save {} of {} record documents", failed, records.len()));
    }
    tracing::info!("saved {} record documents", records.len());
    Ok(())
}

pub async fn write_summary(path: &Path, summary: &RunSummary) -> Result<()> {
    write_json(path, summary).await?;
    tracing::info!("saved run summary to {}", path.display());
    Ok(())
}

pub async fn write_full_list(path: &Path, records: &[FusedRecord]) -> Result<()> {
    write_json(path, records).await?;
    tracing::info!("saved {} records to {}", records.len(), path.display());
    Ok(())
}

/// Writes the three run artifacts concurrently. Every writer runs to
/// completion; the result is an error if any of them failed.
pub async fn persist(
    records: &[FusedRecord],
    summary: &RunSummary,
    summary_path: &Path,
    full_list_path: &Path,
) -> Result<()> {
    let (per_record, overview, full_list) = tokio::join!(
        write_record_documents(records),
        write_summary(summary_path, summary),
        write_full_list(full_list_path, records),
    );

    let mut failed = Vec::new();
    for (name, result) in [("record documents", per_record), ("summary", overview), ("full list", full_list)] {
        if let Err(e) = result {
            tracing::error!("failed to save {}: {:#}", name, e);
            failed.push(name);
        }
    }
    if failed.is_empty() {
        Ok(())
    } else {
        Err(anyhow!("failed to save {}", failed.join(", ")))
    }
}

/// Copies image and JSON of every confident detection in `categories` into
/// `dir`. Returns the copied image paths.
pub async fn copy_work_order_frames(
    records: &[FusedRecord],
    categories: &[DefectCategory],
    threshold: f64,
    dir: &Path,
) -> Result<Vec<PathBuf>> {
    tokio::fs::create_dir_all(dir).await?;
    let mut copied = Vec::new();
    for record in records {
        let Some(category) = categories.iter().find(|c| record.analysis.is_confident(**c, threshold)) else {
            continue;
        };
        match copy_record(record, dir).await {
            Ok(image_dest) => {
                tracing::info!(
                    frame = %record.filename,
                    category = category.name(),
                    confidence = record.analysis.confidence(*category).unwrap_or(0.0),
                    "copied frame for work order"
                );
                copied.push(image_dest);
            }
            Err(e) => tracing::warn!(frame = %record.filename, "work-order copy skipped: {:#}", e),
        }
    }
    Ok(copied)
}

async fn copy_record(record: &FusedRecord, dir: &Path) -> Result<PathBuf> {
    let image_dest = dir.join(&record.filename);
    tokio::fs::copy(&record.filepath, &image_dest)
        .await
        .with_context(|| format!("failed to copy {}", record.filepath.display()))?;
    let json_src = record.json_path();
    if let Some(json_name) = json_src.file_name() {
        tokio::fs::copy(&json_src, dir.join(json_name))
            .await
            .with_context(|| format!("failed to copy {}", json_src.display()))?;
    }
    Ok(image_dest)
}
