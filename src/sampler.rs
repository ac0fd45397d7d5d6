use crate::config::PipelineSettings;
use crate::diagnostics::{run_tool, ToolChain};
use crate::models::SampledFrame;
use anyhow::{anyhow, Context, Result};
use std::ffi::OsStr;
use std::path::Path;

/// Geometry and timing of a video's first video stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub total_frames: u64,
}

/// Reads stream metadata with ffprobe.
pub async fn probe_stream(tools: &ToolChain, video: &Path) -> Result<StreamInfo> {
    let output = run_tool(
        &tools.ffprobe,
        [
            OsStr::new("-v"),
            OsStr::new("error"),
            OsStr::new("-select_streams"),
            OsStr::new("v:0"),
            OsStr::new("-show_entries"),
            OsStr::new("stream=width,height,nb_frames,avg_frame_rate,duration"),
            OsStr::new("-of"),
            OsStr::new("json"),
            video.as_os_str(),
        ],
    )
    .await
    .context("stream probe failed")?;

    parse_probe_output(&output.stdout)
        .with_context(|| format!("unreadable stream metadata for {}", video.display()))
}

pub fn parse_probe_output(stdout: &[u8]) -> Result<StreamInfo> {
    let json: serde_json::Value = serde_json::from_slice(stdout)?;
    let stream = json["streams"]
        .as_array()
        .and_then(|s| s.first())
        .ok_or_else(|| anyhow!("no video stream found"))?;

    let width = stream["width"].as_u64().ok_or_else(|| anyhow!("missing stream width"))? as u32;
    let height = stream["height"].as_u64().ok_or_else(|| anyhow!("missing stream height"))? as u32;

    let fps = stream["avg_frame_rate"]
        .as_str()
        .and_then(parse_frame_rate)
        .filter(|fps| *fps > 0.0)
        .ok_or_else(|| anyhow!("missing or zero frame rate"))?;

    // nb_frames is absent for some containers; fall back to duration * fps.
    let total_frames = match json_u64(&stream["nb_frames"]) {
        Some(n) => n,
        None => {
            let duration = json_f64(&stream["duration"])
                .ok_or_else(|| anyhow!("neither frame count nor duration available"))?;
            (duration * fps).round() as u64
        }
    };

    Ok(StreamInfo { width, height, fps, total_frames })
}

/// Parses "30000/1001" or "30" style rates.
pub fn parse_frame_rate(fps_str: &str) -> Option<f64> {
    if let Some((num, den)) = fps_str.split_once('/') {
        let num: f64 = num.trim().parse().ok()?;
        let den: f64 = den.trim().parse().ok()?;
        if den == 0.0 {
            return None;
        }
        return Some(num / den);
    }
    fps_str.trim().parse().ok()
}

fn json_u64(v: &serde_json::Value) -> Option<u64> {
    v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
}

fn json_f64(v: &serde_json::Value) -> Option<f64> {
    v.as_f64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
}

/// Distance between sampled source frames.
pub fn frame_stride(fps: f64, sampling_rate: f64) -> u64 {
    ((fps / sampling_rate).round() as u64).max(1)
}

/// Frame indices and their offsets from video start, evenly spaced and capped.
pub fn plan_samples(
    fps: f64,
    total_frames: u64,
    sampling_rate: f64,
    max_samples: Option<usize>,
) -> Vec<(u64, f64)> {
    let stride = frame_stride(fps, sampling_rate);
    (0..total_frames)
        .step_by(stride as usize)
        .take(max_samples.unwrap_or(usize::MAX))
        .map(|index| (index, index as f64 / fps))
        .collect()
}

/// ffmpeg crop expression removing `crop_top` pixels from the top of each frame.
pub fn crop_filter(width: u32, height: u32, crop_top: u32) -> Result<String> {
    let crop_height = height as i64 - crop_top as i64;
    if crop_height <= 0 {
        return Err(anyhow!(
            "invalid crop height {}: crop_top {} is not smaller than video height {}",
            crop_height,
            crop_top,
            height
        ));
    }
    Ok(format!("crop={}:{}:0:{}", width, crop_height, crop_top))
}

/// Extracts the planned frames as `frame_NNNN.jpg` files under `output_dir`.
/// Either every planned frame is returned or the call fails. Frames left
/// from an earlier run of the same video are removed first.
pub async fn sample_frames(
    tools: &ToolChain,
    video: &Path,
    output_dir: &Path,
    settings: &PipelineSettings,
) -> Result<Vec<SampledFrame>> {
    if tokio::fs::try_exists(output_dir).await? {
        tokio::fs::remove_dir_all(output_dir)
            .await
            .with_context(|| format!("failed to clear {}", output_dir.display()))?;
    }
    tokio::fs::create_dir_all(output_dir).await?;

    let info = probe_stream(tools, video).await?;
    tracing::info!(
        "stream {}x{} at {:.3} fps, {} frames",
        info.width,
        info.height,
        info.fps,
        info.total_frames
    );

    let plan = plan_samples(info.fps, info.total_frames, settings.sampling_rate, settings.max_samples);
    if plan.is_empty() {
        return Err(anyhow!("{} contains no frames to sample", video.display()));
    }
    let crop = crop_filter(info.width, info.height, settings.crop_top)?;
    let stride = frame_stride(info.fps, settings.sampling_rate);

    let filter = format!("select='not(mod(n\\,{}))',setpts=N/FRAME_RATE/TB,{}", stride, crop);
    let pattern = output_dir.join("frame_%04d.jpg");
    let count = plan.len().to_string();
    run_tool(
        &tools.ffmpeg,
        [
            OsStr::new("-y"),
            OsStr::new("-i"),
            video.as_os_str(),
            OsStr::new("-map"),
            OsStr::new("0:v:0"),
            OsStr::new("-an"),
            OsStr::new("-vf"),
            OsStr::new(&filter),
            OsStr::new("-vsync"),
            OsStr::new("vfr"),
            OsStr::new("-frames:v"),
            OsStr::new(&count),
            pattern.as_os_str(),
        ],
    )
    .await
    .context("frame extraction failed")?;

    let frames: Vec<SampledFrame> = plan
        .into_iter()
        .enumerate()
        .map(|(i, (index, offset))| SampledFrame {
            index,
            image_path: output_dir.join(format!("frame_{:04}.jpg", i + 1)),
            relative_offset_seconds: offset,
        })
        .collect();

    if let Some(missing) = frames.iter().find(|f| !f.image_path.exists()) {
        return Err(anyhow!(
            "frame extraction produced {} of {} frames; {} is missing",
            frames.iter().filter(|f| f.image_path.exists()).count(),
            frames.len(),
            missing.image_path.display()
        ));
    }

    tracing::info!("extracted {} frames to {}", frames.len(), output_dir.display());
    Ok(frames)
}
