use crate::models::{AnalysisVerdict, FusedRecord, SampledFrame, TelemetrySample};
use crate::telemetry::{truncate_to_second, TelemetryTrack};
use chrono::{DateTime, Duration, Utc};

/// Closest sample to `target` in a series sorted by timestamp.
///
/// Binary search for the insertion point, then compare the neighbours on
/// either side of it. An exact tie in distance goes to the earlier sample.
pub fn nearest_sample(series: &[TelemetrySample], target: DateTime<Utc>) -> Option<&TelemetrySample> {
    let last = series.last()?;
    let pos = series.partition_point(|s| s.timestamp < target);

    if pos == 0 {
        return series.first();
    }
    if pos == series.len() {
        return Some(last);
    }

    let before = &series[pos - 1];
    let after = &series[pos];
    if (target - before.timestamp).abs() <= (after.timestamp - target).abs() {
        Some(before)
    } else {
        Some(after)
    }
}

/// `base + offset_seconds`, or `None` when the offset cannot be represented.
pub fn absolute_instant(base: DateTime<Utc>, offset_seconds: f64) -> Option<DateTime<Utc>> {
    if !offset_seconds.is_finite() {
        return None;
    }
    let nanos = (offset_seconds * 1e9).round();
    if nanos.abs() >= i64::MAX as f64 {
        return None;
    }
    base.checked_add_signed(Duration::nanoseconds(nanos as i64))
}

/// Fuses one frame with its nearest sample. Frames whose instant cannot be
/// computed get zeroed telemetry instead of failing the run.
pub fn fuse(frame: &SampledFrame, track: &TelemetryTrack) -> FusedRecord {
    let filename = frame
        .image_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let aligned = absolute_instant(track.base_timestamp, frame.relative_offset_seconds)
        .and_then(|instant| nearest_sample(&track.samples, instant).map(|s| (instant, s)));

    let (timestamp, sample) = match aligned {
        Some((instant, sample)) => {
            tracing::debug!(
                frame = frame.index,
                target = %instant,
                matched = %sample.timestamp,
                "closest telemetry found"
            );
            (truncate_to_second(instant), sample.clone())
        }
        None => {
            tracing::error!(
                frame = frame.index,
                offset = frame.relative_offset_seconds,
                "cannot align frame to telemetry, using zeroed sample"
            );
            let sentinel = TelemetrySample::sentinel();
            (sentinel.timestamp, sentinel)
        }
    };

    FusedRecord {
        frame_index: frame.index,
        filename,
        filepath: frame.image_path.clone(),
        timestamp,
        latitude: sample.latitude,
        longitude: sample.longitude,
        external_reference_id: None,
        analysis: AnalysisVerdict::default(),
    }
}

/// One record per frame, in frame order.
pub fn fuse_all(frames: &[SampledFrame], track: &TelemetryTrack) -> Vec<FusedRecord> {
    let records: Vec<FusedRecord> = frames.iter().map(|f| fuse(f, track)).collect();
    tracing::info!("aligned {} frames to telemetry", records.len());
    records
}
