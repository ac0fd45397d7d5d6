use crate::config::ToolsConfig;
use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Resolved paths of the external executables the pipeline shells out to.
#[derive(Debug, Clone)]
pub struct ToolChain {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    pub gpx_decoder: PathBuf,
    pub telemetry_stream: String,
}

impl ToolChain {
    pub fn detect(cfg: &ToolsConfig) -> Result<Self> {
        let chain = ToolChain {
            ffmpeg: resolve_tool(&cfg.ffmpeg)?,
            ffprobe: resolve_tool(&cfg.ffprobe)?,
            gpx_decoder: resolve_tool(&cfg.gpx_decoder)?,
            telemetry_stream: cfg.telemetry_stream.clone(),
        };
        tracing::info!(
            "toolchain detected: ffmpeg={}, ffprobe={}, gpx_decoder={}",
            chain.ffmpeg.display(),
            chain.ffprobe.display(),
            chain.gpx_decoder.display()
        );
        Ok(chain)
    }
}

/// Explicit paths must name an executable file; bare names are searched on `PATH`.
fn resolve_tool(name: &str) -> Result<PathBuf> {
    which::which(name).with_context(|| format!("{} is not an executable on PATH or at that location", name))
}

/// Runs an external tool to completion. A non-zero exit is an error carrying stderr.
pub async fn run_tool<I, S>(program: &Path, args: I) -> Result<std::process::Output>
where
    I: IntoIterator<Item = S>,
    S: AsRef<std::ffi::OsStr>,
{
    let name = program
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| program.display().to_string());

    let output = tokio::process::Command::new(program)
        .args(args)
        .stdin(std::process::Stdio::null())
        .output()
        .await
        .with_context(|| format!("failed to execute {}", name))?;

    if !output.status.success() {
        return Err(anyhow!(
            "{} exited with {}: {}",
            name,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(output)
}

/// Wall-clock durations of the named pipeline steps.
pub struct StageTimer {
    started: Instant,
    entries: Vec<(String, Duration)>,
}

impl StageTimer {
    pub fn new() -> Self {
        StageTimer { started: Instant::now(), entries: Vec::new() }
    }

    /// Records the time elapsed since `since` under `step`.
    pub fn record(&mut self, step: &str, since: Instant) -> Duration {
        let elapsed = since.elapsed();
        tracing::info!("{} took {:.2} seconds", step, elapsed.as_secs_f64());
        self.entries.push((step.to_string(), elapsed));
        elapsed
    }

    pub fn entries(&self) -> &[(String, Duration)] {
        &self.entries
    }

    pub fn render(&self) -> String {
        let mut out = String::from("Stage Timing Log:\n");
        for (step, elapsed) in &self.entries {
            out.push_str(&format!("{} took {:.2} seconds\n", step, elapsed.as_secs_f64()));
        }
        out.push_str(&format!(
            "Total pipeline duration: {:.2} seconds\n",
            self.started.elapsed().as_secs_f64()
        ));
        out
    }

    pub async fn write_log(&self, path: &Path) -> Result<()> {
        tokio::fs::write(path, self.render()).await?;
        Ok(())
    }
}

impl Default for StageTimer {
    fn default() -> Self {
        Self::new()
    }
}
