use crate::diagnostics::{run_tool, ToolChain};
use crate::models::TelemetrySample;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

/// Time-ordered telemetry for one recording.
#[derive(Debug, Clone)]
pub struct TelemetryTrack {
    /// Sorted ascending by timestamp; equal timestamps keep track order.
    pub samples: Vec<TelemetrySample>,
    /// Absolute start of the recording, full precision.
    pub base_timestamp: DateTime<Utc>,
}

/// Temporary decode artifacts written while extracting telemetry.
#[derive(Debug, Clone)]
pub struct DecodeArtifacts {
    pub raw_track: PathBuf,
    pub gpx: PathBuf,
}

impl DecodeArtifacts {
    pub fn in_dir(dir: &Path) -> Self {
        DecodeArtifacts {
            raw_track: dir.join("temp_metadata.bin"),
            gpx: dir.join("temp_metadata.gpx"),
        }
    }

    /// Delete-if-exists; safe to call repeatedly.
    pub async fn cleanup(&self) {
        for path in [&self.raw_track, &self.gpx] {
            match tokio::fs::remove_file(path).await {
                Ok(()) => tracing::debug!("removed {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("failed to remove {}: {}", path.display(), e),
            }
        }
    }
}

/// Demuxes the embedded telemetry track and decodes it into a sorted sample series.
pub async fn extract_telemetry(
    tools: &ToolChain,
    video: &Path,
    artifacts: &DecodeArtifacts,
) -> Result<TelemetryTrack> {
    tracing::info!("extracting telemetry from {}", video.display());

    let mut demux: Vec<OsString> = vec!["-y".into(), "-i".into(), video.as_os_str().to_owned()];
    demux.extend(
        ["-codec", "copy", "-map", tools.telemetry_stream.as_str(), "-f", "rawvideo"]
            .into_iter()
            .map(OsString::from),
    );
    demux.push(artifacts.raw_track.as_os_str().to_owned());
    run_tool(&tools.ffmpeg, &demux)
        .await
        .context("telemetry track demux failed")?;
    tracing::info!("extracted raw telemetry track to {}", artifacts.raw_track.display());

    // The decoder appends ".gpx" to the prefix it is given.
    let prefix = artifacts.gpx.with_extension("");
    run_tool(
        &tools.gpx_decoder,
        [OsStr::new("-s"), OsStr::new("-vv"), video.as_os_str(), prefix.as_os_str()],
    )
    .await
    .context("telemetry decode failed")?;

    if !artifacts.gpx.exists() {
        return Err(anyhow!("decoder did not produce {}", artifacts.gpx.display()));
    }

    let xml = tokio::fs::read_to_string(&artifacts.gpx)
        .await
        .with_context(|| format!("failed to read {}", artifacts.gpx.display()))?;
    let track = parse_gpx(&xml)?;
    tracing::info!(
        "decoded {} telemetry samples, base timestamp {}",
        track.samples.len(),
        track.base_timestamp
    );
    Ok(track)
}

/// Parses GPX text into a sorted track. Samples without a usable time are discarded.
pub fn parse_gpx(xml: &str) -> Result<TelemetryTrack> {
    let doc = roxmltree::Document::parse(xml).context("telemetry is not valid GPX")?;

    let mut trackpoints = 0usize;
    let mut samples = Vec::new();
    for trkpt in doc.descendants().filter(|n| n.tag_name().name() == "trkpt") {
        trackpoints += 1;
        let time = child_text(&trkpt, "time").and_then(parse_gpx_time);
        let Some(time) = time else {
            tracing::debug!("discarding trackpoint without timestamp");
            continue;
        };
        samples.push(TelemetrySample {
            timestamp: truncate_to_second(time),
            latitude: attr_f64(&trkpt, "lat"),
            longitude: attr_f64(&trkpt, "lon"),
            elevation: child_text(&trkpt, "ele").and_then(|s| s.trim().parse().ok()),
            heart_rate: descendant_text(&trkpt, "hr").and_then(|s| s.trim().parse().ok()),
            speed: descendant_text(&trkpt, "speed").and_then(|s| s.trim().parse().ok()),
        });
    }

    if trackpoints == 0 {
        return Err(anyhow!("GPX contains no trackpoints"));
    }
    if samples.is_empty() {
        return Err(anyhow!("none of the {} trackpoints carries a timestamp", trackpoints));
    }

    // Stable sort keeps track order among equal seconds.
    samples.sort_by_key(|s| s.timestamp);

    let metadata_time = doc
        .descendants()
        .find(|n| n.tag_name().name() == "metadata")
        .and_then(|m| child_text(&m, "time"))
        .and_then(parse_gpx_time);
    let base_timestamp = match metadata_time {
        Some(t) => t,
        None => {
            tracing::warn!("GPX metadata has no start time, using first trackpoint");
            samples[0].timestamp
        }
    };

    Ok(TelemetryTrack { samples, base_timestamp })
}

pub fn parse_gpx_time(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text.trim_end_matches('Z'), "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

pub fn truncate_to_second(t: DateTime<Utc>) -> DateTime<Utc> {
    t.with_nanosecond(0).unwrap_or(t)
}

fn child_text<'a>(node: &roxmltree::Node<'a, '_>, name: &str) -> Option<&'a str> {
    node.children()
        .find(|c| c.is_element() && c.tag_name().name() == name)
        .and_then(|c| c.text())
}

fn descendant_text<'a>(node: &roxmltree::Node<'a, '_>, name: &str) -> Option<&'a str> {
    node.descendants()
        .find(|c| c.is_element() && c.tag_name().name() == name)
        .and_then(|c| c.text())
}

fn attr_f64(node: &roxmltree::Node, name: &str) -> f64 {
    node.attribute(name).and_then(|v| v.trim().parse().ok()).unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    const SAMPLE_GPX: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<gpx version="1.1" xmlns="http://www.topografix.com/GPX/1/1"
     xmlns:gpxtpx="http://www.garmin.com/xmlschemas/TrackPointExtension/v2">
  <metadata><time>2024-09-26T16:33:33.250000Z</time></metadata>
  <trk><trkseg>
    <trkpt lat="35.7563" lon="-78.7452">
      <ele>101.5</ele>
      <time>2024-09-26T16:33:35.800000Z</time>
      <extensions><gpxtpx:TrackPointExtension><gpxtpx:speed>8.2</gpxtpx:speed></gpxtpx:TrackPointExtension></extensions>
    </trkpt>
    <trkpt lat="35.7561" lon="-78.7451">
      <time>2024-09-26T16:33:34.100000Z</time>
    </trkpt>
    <trkpt lat="1.0" lon="1.0"><ele>3</ele></trkpt>
    <trkpt lat="35.7562" lon="-78.7450">
      <time>2024-09-26T16:33:34.900000Z</time>
    </trkpt>
  </trkseg></trk>
</gpx>"#;

    #[test]
    fn test_parse_gpx_sorts_and_truncates() {
        let track = parse_gpx(SAMPLE_GPX).unwrap();

        assert_eq!(track.samples.len(), 3);
        let t = |s| Utc.with_ymd_and_hms(2024, 9, 26, 16, 33, s).unwrap();
        assert_eq!(track.samples[0].timestamp, t(34));
        assert_eq!(track.samples[1].timestamp, t(34));
        assert_eq!(track.samples[2].timestamp, t(35));
        // duplicates keep track order
        assert_eq!(track.samples[0].longitude, -78.7451);
        assert_eq!(track.samples[1].longitude, -78.7450);

        assert_eq!(track.samples[2].elevation, Some(101.5));
        assert_eq!(track.samples[2].speed, Some(8.2));
        assert_eq!(track.samples[2].heart_rate, None);

        assert_eq!(track.base_timestamp, t(33) + chrono::Duration::milliseconds(250));
    }

    #[test]
    fn test_parse_gpx_without_trackpoints_fails() {
        let xml = r#"<gpx xmlns="http://www.topografix.com/GPX/1/1"><trk><trkseg/></trk></gpx>"#;
        assert!(parse_gpx(xml).is_err());
    }

    #[test]
    fn test_parse_gpx_without_timestamps_fails() {
        let xml = r#"<gpx><trk><trkseg><trkpt lat="1" lon="2"/></trkseg></trk></gpx>"#;
        assert!(parse_gpx(xml).is_err());
    }

    #[test]
    fn test_base_timestamp_falls_back_to_first_sample() {
        let xml = r#"<gpx><trk><trkseg>
            <trkpt lat="1" lon="2"><time>2024-01-01T00:00:05Z</time></trkpt>
            <trkpt lat="1" lon="2"><time>2024-01-01T00:00:03Z</time></trkpt>
        </trkseg></trk></gpx>"#;
        let track = parse_gpx(xml).unwrap();
        assert_eq!(track.base_timestamp, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 3).unwrap());
    }

    #[test]
    fn test_parse_time_without_zone() {
        let t = parse_gpx_time("2024-09-26T16:33:34.500000").unwrap();
        assert_eq!(truncate_to_second(t), Utc.with_ymd_and_hms(2024, 9, 26, 16, 33, 34).unwrap());
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() -> Result<()> {
        let tmpdir = TempDir::new()?;
        let artifacts = DecodeArtifacts::in_dir(tmpdir.path());
        std::fs::write(&artifacts.gpx, SAMPLE_GPX)?;

        artifacts.cleanup().await;
        assert!(!artifacts.gpx.exists());
        artifacts.cleanup().await;
        Ok(())
    }
}
