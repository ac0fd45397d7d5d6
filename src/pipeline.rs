use crate::aligner::fuse_all;
use crate::clients::AnalysisClient;
use crate::config::{OutputConfig, PipelineSettings, WorkOrderConfig};
use crate::diagnostics::{StageTimer, ToolChain};
use crate::dispatcher::dispatch;
use crate::error::PipelineError;
use crate::models::{DefectCategory, FusedRecord};
use crate::report::{self, RunSummary};
use crate::sampler::sample_frames;
use crate::stages::{Stage, StageStatus, StageTracker};
use crate::status::{StatusReporter, StatusUpdate};
use crate::telemetry::{extract_telemetry, DecodeArtifacts};
use crate::workorders::{WorkOrderEngine, WorkOrderTally};
use anyhow::anyhow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Everything a successful run produced.
#[derive(Debug)]
pub struct RunReport {
    pub run_dir: PathBuf,
    pub records: Vec<FusedRecord>,
    pub summary: RunSummary,
    pub work_order_frames: Vec<PathBuf>,
    pub work_orders: Option<WorkOrderTally>,
}

/// Runs one video through the five stages.
pub struct Pipeline {
    tools: ToolChain,
    analysis: Arc<dyn AnalysisClient>,
    output: OutputConfig,
    work_order_categories: Vec<DefectCategory>,
    work_orders: Option<WorkOrderEngine>,
    status: Option<StatusReporter>,
}

impl Pipeline {
    pub fn new(
        tools: ToolChain,
        analysis: Arc<dyn AnalysisClient>,
        output: OutputConfig,
        work_order_cfg: &WorkOrderConfig,
    ) -> Self {
        let work_order_categories = work_order_cfg
            .categories
            .iter()
            .filter_map(|name| DefectCategory::from_name(name))
            .collect();
        Pipeline { tools, analysis, output, work_order_categories, work_orders: None, status: None }
    }

    pub fn with_status(mut self, reporter: StatusReporter) -> Self {
        self.status = Some(reporter);
        self
    }

    pub fn with_work_orders(mut self, engine: WorkOrderEngine) -> Self {
        self.work_orders = Some(engine);
        self
    }

    fn notify(&self, update: StatusUpdate) {
        if let Some(reporter) = &self.status {
            reporter.notify(update);
        }
    }

    pub async fn run(&self, video: &Path, settings: &PipelineSettings) -> Result<RunReport, PipelineError> {
        let mut tracker = StageTracker::new();
        self.run_tracked(video, settings, &mut tracker).await
    }

    /// Like [`Pipeline::run`], leaving the final stage states in `tracker`.
    pub async fn run_tracked(
        &self,
        video: &Path,
        settings: &PipelineSettings,
        tracker: &mut StageTracker,
    ) -> Result<RunReport, PipelineError> {
        settings.validate().map_err(PipelineError::InvalidSettings)?;

        let video_name = video
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| video.display().to_string());
        let run_name = video
            .file_stem()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "run".to_string());
        let run_dir = self.output.root.join(run_name);
        let artifacts = DecodeArtifacts::in_dir(&run_dir);
        let mut timer = StageTimer::new();

        tracing::info!(video = %video_name, ?settings, "starting pipeline");
        let result = self
            .execute(video, &video_name, &run_dir, &artifacts, settings, tracker, &mut timer)
            .await;

        artifacts.cleanup().await;
        if run_dir.is_dir() {
            if let Err(e) = timer.write_log(&run_dir.join(&self.output.timing_log_file)).await {
                tracing::warn!("failed to write timing log: {:#}", e);
            }
        }

        match result {
            Ok(report) => {
                self.notify(StatusUpdate::completed(&video_name));
                tracing::info!(
                    video = %video_name,
                    frames = report.records.len(),
                    minutes = report.summary.minutes_analyzed,
                    "pipeline completed"
                );
                Ok(report)
            }
            Err(e) => {
                let stage = e.stage().or_else(|| tracker.current()).unwrap_or(Stage::Metadata);
                tracing::error!(video = %video_name, stage = stage.name(), "{}", e);
                tracing::debug!(stages = ?tracker.snapshot(), "stage states at failure");
                self.notify(StatusUpdate::failed(&video_name, stage, &e.to_string()));
                Err(e)
            }
        }
    }

    fn begin(&self, tracker: &mut StageTracker, stage: Stage, video_name: &str) -> Result<(), PipelineError> {
        tracker
            .transition(stage, StageStatus::InProgress)
            .map_err(|e| PipelineError::StageFailed { stage, source: e.into() })?;
        self.notify(StatusUpdate::stage_progress(video_name, stage));
        Ok(())
    }

    fn complete(tracker: &mut StageTracker, stage: Stage) -> Result<(), PipelineError> {
        tracker
            .transition(stage, StageStatus::Complete)
            .map_err(|e| PipelineError::StageFailed { stage, source: e.into() })
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute(
        &self,
        video: &Path,
        video_name: &str,
        run_dir: &Path,
        artifacts: &DecodeArtifacts,
        settings: &PipelineSettings,
        tracker: &mut StageTracker,
        timer: &mut StageTimer,
    ) -> Result<RunReport, PipelineError> {
        let failed = |stage: Stage| move |source: anyhow::Error| PipelineError::StageFailed { stage, source };

        let stage = Stage::Metadata;
        self.begin(tracker, stage, video_name)?;
        let started = Instant::now();
        if !video.is_file() {
            return Err(failed(stage)(anyhow!("video file {} not found", video.display())));
        }
        let frames_dir = run_dir.join("frames");
        tokio::fs::create_dir_all(&frames_dir)
            .await
            .map_err(|e| failed(stage)(e.into()))?;
        let track = extract_telemetry(&self.tools, video, artifacts)
            .await
            .map_err(failed(stage))?;
        timer.record("Metadata: extract telemetry", started);
        Self::complete(tracker, stage)?;

        let stage = Stage::FrameExtraction;
        self.begin(tracker, stage, video_name)?;
        let started = Instant::now();
        let frames = sample_frames(&self.tools, video, &frames_dir, settings)
            .await
            .map_err(failed(stage))?;
        timer.record("Frame Extraction: sample frames", started);
        Self::complete(tracker, stage)?;

        let stage = Stage::AnalysisPrep;
        self.begin(tracker, stage, video_name)?;
        let started = Instant::now();
        let records = fuse_all(&frames, &track);
        timer.record("Analysis Prep: align frames to telemetry", started);
        Self::complete(tracker, stage)?;

        let stage = Stage::AiAnalysis;
        self.begin(tracker, stage, video_name)?;
        let outcome = dispatch(self.analysis.as_ref(), records, settings.batch_size, settings.workers).await;
        timer.record("AI Analysis: upload frames", outcome.upload_started);
        timer.record("AI Analysis: analyze frames", outcome.analysis_started);
        if outcome.upload_failures + outcome.analysis_failures > 0 {
            tracing::warn!(
                upload_failures = outcome.upload_failures,
                analysis_failures = outcome.analysis_failures,
                "some frames carry no analysis"
            );
        }
        let records = outcome.records;
        Self::complete(tracker, stage)?;

        let stage = Stage::Finalization;
        self.begin(tracker, stage, video_name)?;
        let started = Instant::now();
        let summary = report::summarize(
            &records,
            video_name,
            settings.sampling_rate,
            settings.high_confidence_threshold,
        );
        report::persist(
            &records,
            &summary,
            &run_dir.join(&self.output.summary_file),
            &run_dir.join(&self.output.full_list_file),
        )
        .await
        .map_err(failed(stage))?;
        let work_order_frames = match report::copy_work_order_frames(
            &records,
            &self.work_order_categories,
            settings.high_confidence_threshold,
            &run_dir.join(&self.output.work_order_dir),
        )
        .await
        {
            Ok(copied) => copied,
            Err(e) => {
                tracing::warn!("failed to prepare work-order folder: {:#}", e);
                Vec::new()
            }
        };
        timer.record("Finalization: save reports", started);
        Self::complete(tracker, stage)?;

        tracing::info!(
            frames = records.len(),
            seconds = summary.seconds_analyzed,
            minutes = summary.minutes_analyzed,
            "analyzed footage"
        );

        let work_orders = match &self.work_orders {
            Some(engine) => Some(engine.run(&records, settings.high_confidence_threshold).await),
            None => None,
        };

        Ok(RunReport { run_dir: run_dir.to_path_buf(), records, summary, work_order_frames, work_orders })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::BatchContext;
    use crate::models::{AnalysisVerdict, DefectFlag};
    use crate::status::StatusTransport;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    // Scripts are written then executed; keep tool-spawning tests apart.
    static TOOLS: Mutex<()> = Mutex::new(());

    struct FlagFirstFrame;

    #[async_trait]
    impl AnalysisClient for FlagFirstFrame {
        async fn upload_image(&self, path: &Path) -> Result<String> {
            Ok(format!("file-{}", path.file_name().unwrap().to_string_lossy()))
        }

        async fn analyze(&self, file_id: &str, _ctx: &BatchContext) -> Result<AnalysisVerdict> {
            if file_id == "file-frame_0001.jpg" {
                return Ok(AnalysisVerdict {
                    pothole: Some(DefectFlag::Yes),
                    pothole_confidence: Some(0.95),
                    road_health_index: Some(35.0),
                    ..Default::default()
                });
            }
            Ok(AnalysisVerdict { road_health_index: Some(85.0), ..Default::default() })
        }
    }

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<StatusUpdate>>,
    }

    #[async_trait]
    impl StatusTransport for Recording {
        async fn deliver(&self, update: &StatusUpdate) -> Result<()> {
            self.seen.lock().unwrap().push(update.clone());
            Ok(())
        }
    }

    const FFPROBE: &str = r#"#!/bin/sh
echo '{"streams":[{"width":640,"height":800,"avg_frame_rate":"30/1","nb_frames":"150"}]}'
"#;

    const FFMPEG: &str = r#"#!/bin/sh
out=""
prev=""
count=0
for arg in "$@"; do
  if [ "$prev" = "-frames:v" ]; then count="$arg"; fi
  prev="$arg"
  out="$arg"
done
case "$out" in
  *%04d*)
    i=1
    while [ "$i" -le "$count" ]; do
      printf 'jpeg' > "$(printf "$out" "$i")"
      i=$((i + 1))
    done
    ;;
  *) printf 'raw' > "$out" ;;
esac
"#;

    // Writes only the first frame when asked for a numbered sequence.
    const SHORT_FFMPEG: &str = r#"#!/bin/sh
for arg in "$@"; do out="$arg"; done
case "$out" in
  *%04d*) printf 'jpeg' > "$(printf "$out" 1)" ;;
  *) printf 'raw' > "$out" ;;
esac
"#;

    const GPX_DECODER: &str = r#"#!/bin/sh
cat > "$4.gpx" <<'GPX'
<?xml version="1.0" encoding="UTF-8"?>
<gpx version="1.1" xmlns="http://www.topografix.com/GPX/1/1">
  <metadata><time>2024-09-26T16:33:33Z</time></metadata>
  <trk><trkseg>
    <trkpt lat="35.0" lon="-78.0"><time>2024-09-26T16:33:33Z</time></trkpt>
    <trkpt lat="35.1" lon="-78.1"><time>2024-09-26T16:33:34Z</time></trkpt>
    <trkpt lat="35.2" lon="-78.2"><time>2024-09-26T16:33:35Z</time></trkpt>
    <trkpt lat="35.3" lon="-78.3"><time>2024-09-26T16:33:36Z</time></trkpt>
    <trkpt lat="35.4" lon="-78.4"><time>2024-09-26T16:33:37Z</time></trkpt>
  </trkseg></trk>
</gpx>
GPX
"#;

    #[cfg(unix)]
    fn script(dir: &Path, name: &str, body: &str) -> Result<PathBuf> {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, body)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
        Ok(path)
    }

    #[cfg(unix)]
    fn fake_tools(bin: &Path, ffmpeg: &str, ffprobe: &str) -> Result<ToolChain> {
        std::fs::create_dir_all(bin)?;
        Ok(ToolChain {
            ffmpeg: script(bin, "ffmpeg", ffmpeg)?,
            ffprobe: script(bin, "ffprobe", ffprobe)?,
            gpx_decoder: script(bin, "gopro2gpx", GPX_DECODER)?,
            telemetry_stream: "0:3".to_string(),
        })
    }

    fn output(root: &Path) -> OutputConfig {
        OutputConfig {
            root: root.join("runs"),
            summary_file: "overview.json".to_string(),
            full_list_file: "all_frames.json".to_string(),
            timing_log_file: "pipeline_timing_log.txt".to_string(),
            work_order_dir: "work_order_frames".to_string(),
        }
    }

    fn settings() -> PipelineSettings {
        PipelineSettings {
            sampling_rate: 1.0,
            max_samples: Some(5),
            batch_size: 2,
            workers: 2,
            crop_top: 713,
            high_confidence_threshold: 0.9,
        }
    }

    fn tools_without_binaries() -> ToolChain {
        ToolChain {
            ffmpeg: PathBuf::from("/nonexistent/ffmpeg"),
            ffprobe: PathBuf::from("/nonexistent/ffprobe"),
            gpx_decoder: PathBuf::from("/nonexistent/gopro2gpx"),
            telemetry_stream: "0:3".to_string(),
        }
    }

    #[tokio::test]
    async fn test_invalid_settings_rejected_before_any_stage() {
        let tmpdir = TempDir::new().unwrap();
        let pipeline = Pipeline::new(
            tools_without_binaries(),
            Arc::new(FlagFirstFrame),
            output(tmpdir.path()),
            &WorkOrderConfig::default(),
        );
        let mut tracker = StageTracker::new();
        let bad = PipelineSettings { batch_size: 0, ..settings() };
        let err = pipeline
            .run_tracked(&tmpdir.path().join("drive.mp4"), &bad, &mut tracker)
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::InvalidSettings(_)));
        assert_eq!(tracker.status(Stage::Metadata), StageStatus::Pending);
    }

    #[tokio::test]
    async fn test_missing_video_fails_in_metadata() {
        let tmpdir = TempDir::new().unwrap();
        let transport = Arc::new(Recording::default());
        let (reporter, handle) = StatusReporter::spawn(transport.clone(), 16);
        let pipeline = Pipeline::new(
            tools_without_binaries(),
            Arc::new(FlagFirstFrame),
            output(tmpdir.path()),
            &WorkOrderConfig::default(),
        )
        .with_status(reporter);

        let mut tracker = StageTracker::new();
        let err = pipeline
            .run_tracked(&tmpdir.path().join("missing.mp4"), &settings(), &mut tracker)
            .await
            .unwrap_err();

        assert_eq!(err.stage(), Some(Stage::Metadata));
        assert_eq!(tracker.status(Stage::Metadata), StageStatus::InProgress);
        assert_eq!(tracker.status(Stage::FrameExtraction), StageStatus::Pending);

        drop(pipeline);
        handle.await.unwrap();
        let seen = transport.seen.lock().unwrap();
        let last = seen.last().unwrap();
        assert_eq!(last.status, "Failed");
        assert_eq!(last.details["stage"], "Metadata");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_full_run_with_fake_tools() -> Result<()> {
        let _guard = TOOLS.lock().unwrap_or_else(|e| e.into_inner());
        let tmpdir = TempDir::new()?;
        let video = tmpdir.path().join("drive.mp4");
        std::fs::write(&video, b"not really a video")?;

        let pipeline = Pipeline::new(
            fake_tools(&tmpdir.path().join("bin"), FFMPEG, FFPROBE)?,
            Arc::new(FlagFirstFrame),
            output(tmpdir.path()),
            &WorkOrderConfig::default(),
        );
        let mut tracker = StageTracker::new();
        let report = pipeline.run_tracked(&video, &settings(), &mut tracker).await?;

        assert!(tracker.is_finished());
        assert_eq!(report.records.len(), 5);
        let indices: Vec<u64> = report.records.iter().map(|r| r.frame_index).collect();
        assert_eq!(indices, vec![0, 30, 60, 90, 120]);
        let lats: Vec<f64> = report.records.iter().map(|r| r.latitude).collect();
        assert_eq!(lats, vec![35.0, 35.1, 35.2, 35.3, 35.4]);
        assert_eq!(report.records[0].external_reference_id.as_deref(), Some("file-frame_0001.jpg"));

        assert_eq!(report.summary.counts[&DefectCategory::Pothole], 1);
        assert_eq!(report.summary.detections.len(), 1);
        assert_eq!(report.summary.seconds_analyzed, 5);
        assert_eq!(report.summary.health_histogram["20-39"], 1);
        assert_eq!(report.summary.health_histogram["80-100"], 4);

        let run_dir = tmpdir.path().join("runs").join("drive");
        assert_eq!(report.run_dir, run_dir);
        assert!(run_dir.join("overview.json").exists());
        assert!(run_dir.join("all_frames.json").exists());
        assert!(run_dir.join("pipeline_timing_log.txt").exists());
        assert!(run_dir.join("frames").join("frame_0005.json").exists());
        assert_eq!(report.work_order_frames, vec![run_dir.join("work_order_frames").join("frame_0001.jpg")]);
        assert!(!run_dir.join("temp_metadata.bin").exists());
        assert!(!run_dir.join("temp_metadata.gpx").exists());
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tool_failure_halts_run_and_cleans_up() -> Result<()> {
        let _guard = TOOLS.lock().unwrap_or_else(|e| e.into_inner());
        let tmpdir = TempDir::new()?;
        let video = tmpdir.path().join("drive.mp4");
        std::fs::write(&video, b"not really a video")?;

        let broken_probe = "#!/bin/sh\necho 'moov atom not found' >&2\nexit 1\n";
        let pipeline = Pipeline::new(
            fake_tools(&tmpdir.path().join("bin"), FFMPEG, broken_probe)?,
            Arc::new(FlagFirstFrame),
            output(tmpdir.path()),
            &WorkOrderConfig::default(),
        );
        let mut tracker = StageTracker::new();
        let err = pipeline.run_tracked(&video, &settings(), &mut tracker).await.unwrap_err();

        assert_eq!(err.stage(), Some(Stage::FrameExtraction));
        assert!(format!("{}", err).contains("moov atom not found"));
        assert_eq!(tracker.status(Stage::Metadata), StageStatus::Complete);
        assert_eq!(tracker.status(Stage::FrameExtraction), StageStatus::InProgress);

        let run_dir = tmpdir.path().join("runs").join("drive");
        assert!(!run_dir.join("temp_metadata.bin").exists());
        assert!(!run_dir.join("temp_metadata.gpx").exists());
        assert!(run_dir.join("pipeline_timing_log.txt").exists());
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rerun_does_not_reuse_stale_frames() -> Result<()> {
        let _guard = TOOLS.lock().unwrap_or_else(|e| e.into_inner());
        let tmpdir = TempDir::new()?;
        let video = tmpdir.path().join("drive.mp4");
        std::fs::write(&video, b"not really a video")?;

        let first = Pipeline::new(
            fake_tools(&tmpdir.path().join("bin"), FFMPEG, FFPROBE)?,
            Arc::new(FlagFirstFrame),
            output(tmpdir.path()),
            &WorkOrderConfig::default(),
        );
        first.run_tracked(&video, &settings(), &mut StageTracker::new()).await?;
        let frames = tmpdir.path().join("runs").join("drive").join("frames");
        assert!(frames.join("frame_0005.jpg").exists());

        let second = Pipeline::new(
            fake_tools(&tmpdir.path().join("short-bin"), SHORT_FFMPEG, FFPROBE)?,
            Arc::new(FlagFirstFrame),
            output(tmpdir.path()),
            &WorkOrderConfig::default(),
        );
        let mut tracker = StageTracker::new();
        let err = second.run_tracked(&video, &settings(), &mut tracker).await.unwrap_err();

        assert_eq!(err.stage(), Some(Stage::FrameExtraction));
        assert_eq!(tracker.status(Stage::FrameExtraction), StageStatus::InProgress);
        assert!(frames.join("frame_0001.jpg").exists());
        assert!(!frames.join("frame_0005.jpg").exists());
        Ok(())
    }
}
