use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

mod aligner;
mod clients;
mod config;
mod diagnostics;
mod dispatcher;
mod error;
mod models;
mod pipeline;
mod report;
mod sampler;
mod stages;
mod status;
mod telemetry;
mod workorders;

use clients::{AnalysisClient, HttpAnalysisClient, HttpObjectStore, HttpWorkOrderClient, ObjectStore};
use config::{AppConfig, PipelineSettings};
use diagnostics::ToolChain;
use pipeline::Pipeline;
use status::{HttpStatusTransport, LogTransport, StatusReporter, StatusTransport};
use workorders::WorkOrderEngine;

#[derive(Parser)]
#[command(name = "dashcam_survey", about = "Geotag and analyze road-survey dash-cam footage")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Configuration file; the built-in defaults are used when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Frames sampled per second of video.
    #[arg(long, global = true)]
    sampling_rate: Option<f64>,

    #[arg(long, global = true)]
    max_samples: Option<usize>,

    #[arg(long, global = true)]
    batch_size: Option<usize>,

    /// Concurrent analysis batches.
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Pixel rows removed from the top of every frame.
    #[arg(long, global = true)]
    crop_top: Option<u32>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the pipeline on one local video.
    Process { video: PathBuf },
    /// Run the pipeline on every .mp4 in a folder, one after another.
    Sweep { dir: PathBuf },
    /// Download every .mp4 in a remote folder.
    Fetch { folder: String, dest: PathBuf },
}

impl Cli {
    fn settings(&self, cfg: &AppConfig) -> PipelineSettings {
        let mut settings = PipelineSettings::from(&cfg.pipeline);
        if let Some(rate) = self.sampling_rate {
            settings.sampling_rate = rate;
        }
        if let Some(max) = self.max_samples {
            settings.max_samples = Some(max);
        }
        if let Some(size) = self.batch_size {
            settings.batch_size = size;
        }
        if let Some(workers) = self.workers {
            settings.workers = workers;
        }
        if let Some(crop) = self.crop_top {
            settings.crop_top = crop;
        }
        settings
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = match &cli.config {
        Some(path) => AppConfig::load_from(path).with_context(|| format!("failed to load {}", path.display()))?,
        None => AppConfig::load_default()?,
    };
    let settings = cli.settings(&cfg);

    match &cli.command {
        Command::Process { video } => {
            let (pipeline, reporter_handle) = build_pipeline(&cfg)?;
            let result = pipeline.run(video, &settings).await;
            drop(pipeline);
            if let Err(e) = reporter_handle.await {
                tracing::warn!("status reporter task failed: {}", e);
            }
            let report = result?;
            info!(
                "processed {} frames into {} ({} flagged for work orders)",
                report.records.len(),
                report.run_dir.display(),
                report.work_order_frames.len()
            );
            if let Some(tally) = report.work_orders {
                info!("work orders: {} created, {} excluded, {} failed", tally.created, tally.excluded, tally.failed);
            }
        }
        Command::Sweep { dir } => {
            let videos = list_videos(dir).await?;
            info!("found {} videos in {}", videos.len(), dir.display());
            let (pipeline, reporter_handle) = build_pipeline(&cfg)?;
            let mut failures = 0usize;
            for video in &videos {
                if let Err(e) = pipeline.run(video, &settings).await {
                    failures += 1;
                    tracing::error!("skipping {}: {}", video.display(), e);
                }
            }
            drop(pipeline);
            if let Err(e) = reporter_handle.await {
                tracing::warn!("status reporter task failed: {}", e);
            }
            info!("sweep finished: {} processed, {} failed", videos.len() - failures, failures);
        }
        Command::Fetch { folder, dest } => {
            let store_cfg = cfg
                .services
                .object_store
                .as_ref()
                .ok_or_else(|| anyhow!("no object store configured"))?;
            let store = HttpObjectStore::new(store_cfg)?;
            let fetched = fetch_videos(&store, folder, dest).await?;
            info!("downloaded {} videos to {}", fetched.len(), dest.display());
        }
    }

    Ok(())
}

fn build_pipeline(cfg: &AppConfig) -> Result<(Pipeline, tokio::task::JoinHandle<()>)> {
    let tools = ToolChain::detect(&cfg.tools)?;

    let analysis_cfg = cfg
        .services
        .analysis
        .as_ref()
        .ok_or_else(|| anyhow!("no analysis service configured"))?;
    let analysis: Arc<dyn AnalysisClient> = Arc::new(HttpAnalysisClient::new(analysis_cfg)?);

    let transport: Arc<dyn StatusTransport> = match &cfg.services.status {
        Some(endpoint) => Arc::new(HttpStatusTransport::new(endpoint)?),
        None => Arc::new(LogTransport),
    };
    let (reporter, handle) = StatusReporter::spawn(transport, cfg.services.status_queue);

    let mut pipeline = Pipeline::new(tools, analysis, cfg.output.clone(), &cfg.work_orders).with_status(reporter);

    if let Some(crm_cfg) = &cfg.services.crm {
        let store: Option<Arc<dyn ObjectStore>> = match &cfg.services.object_store {
            Some(store_cfg) => Some(Arc::new(HttpObjectStore::new(store_cfg)?)),
            None => None,
        };
        let folder = cfg.services.archive_folder.clone().unwrap_or_else(|| "work_orders".to_string());
        let engine = WorkOrderEngine::new(Arc::new(HttpWorkOrderClient::new(crm_cfg)?), store, folder, &cfg.work_orders);
        info!("work orders enabled for {:?}", engine.categories());
        pipeline = pipeline.with_work_orders(engine);
    }

    Ok((pipeline, handle))
}

fn is_video(name: &str) -> bool {
    Path::new(name)
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("mp4"))
        .unwrap_or(false)
}

/// `.mp4` files directly inside `dir`, sorted by name.
async fn list_videos(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("failed to read {}", dir.display()))?;
    let mut videos = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.is_file() && is_video(&entry.file_name().to_string_lossy()) {
            videos.push(path);
        }
    }
    videos.sort();
    Ok(videos)
}

async fn fetch_videos(store: &dyn ObjectStore, folder: &str, dest: &Path) -> Result<Vec<PathBuf>> {
    tokio::fs::create_dir_all(dest).await?;
    let mut fetched = Vec::new();
    for item in store.list(folder).await? {
        if !is_video(&item.name) {
            continue;
        }
        let path = store.download(&item.id, &dest.join(&item.name)).await?;
        fetched.push(path);
    }
    Ok(fetched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::RemoteItem;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct Folder(Vec<RemoteItem>);

    #[async_trait]
    impl ObjectStore for Folder {
        async fn upload(&self, _local_path: &Path, _folder: &str) -> Result<String> {
            Ok("unused".to_string())
        }
        async fn download(&self, remote_id: &str, dest_path: &Path) -> Result<PathBuf> {
            tokio::fs::write(dest_path, remote_id).await?;
            Ok(dest_path.to_path_buf())
        }
        async fn list(&self, _folder: &str) -> Result<Vec<RemoteItem>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_cli_overrides_settings() {
        let cfg = AppConfig::load_default().unwrap();
        let cli = Cli::parse_from(["dashcam_survey", "process", "drive.mp4", "--sampling-rate", "1", "--crop-top", "0"]);
        let settings = cli.settings(&cfg);
        assert_eq!(settings.sampling_rate, 1.0);
        assert_eq!(settings.crop_top, 0);
        assert_eq!(settings.batch_size, cfg.pipeline.batch_size);
        assert!(matches!(cli.command, Command::Process { .. }));
    }

    #[tokio::test]
    async fn test_list_videos_filters_and_sorts() -> Result<()> {
        let tmpdir = TempDir::new()?;
        for name in ["b.MP4", "a.mp4", "notes.txt", "c.mov"] {
            std::fs::write(tmpdir.path().join(name), b"")?;
        }
        std::fs::create_dir(tmpdir.path().join("d.mp4"))?;

        let videos = list_videos(tmpdir.path()).await?;
        let names: Vec<String> = videos
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.mp4", "b.MP4"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_fetch_downloads_only_videos() -> Result<()> {
        let tmpdir = TempDir::new()?;
        let store = Folder(vec![
            RemoteItem { name: "drive1.mp4".into(), id: "101".into() },
            RemoteItem { name: "readme.txt".into(), id: "102".into() },
        ]);
        let dest = tmpdir.path().join("unprocessed");
        let fetched = fetch_videos(&store, "uploads", &dest).await?;

        assert_eq!(fetched, vec![dest.join("drive1.mp4")]);
        assert_eq!(std::fs::read_to_string(dest.join("drive1.mp4"))?, "101");
        Ok(())
    }
}
