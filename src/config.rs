use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub sampling_rate: f64,
    pub max_samples: Option<usize>,
    pub batch_size: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_crop_top")]
    pub crop_top: u32,
    #[serde(default = "default_threshold")]
    pub high_confidence_threshold: f64,
}

fn default_workers() -> usize {
    4
}

fn default_crop_top() -> u32 {
    713
}

fn default_threshold() -> f64 {
    0.9
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolsConfig {
    pub ffmpeg: String,
    pub ffprobe: String,
    pub gpx_decoder: String,
    #[serde(default = "default_telemetry_stream")]
    pub telemetry_stream: String,
}

fn default_telemetry_stream() -> String {
    "0:3".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    pub root: PathBuf,
    pub summary_file: String,
    pub full_list_file: String,
    pub timing_log_file: String,
    pub work_order_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceEndpoint {
    pub endpoint: String,
    /// Name of the environment variable holding the API key.
    pub key_env: Option<String>,
}

impl ServiceEndpoint {
    pub fn api_key(&self) -> Option<String> {
        self.key_env.as_ref().and_then(|var| std::env::var(var).ok())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisServiceConfig {
    pub endpoint: String,
    pub key_env: Option<String>,
    pub model: String,
    #[serde(default = "default_prompt")]
    pub prompt: String,
}

fn default_prompt() -> String {
    "Inspect this road surface image. Reply with a JSON object containing: \
     pothole (yes/no), pothole_confidence (0-1), alligator_cracking (yes/no), \
     alligator_cracking_confidence (0-1), line_cracking (yes/no), \
     line_cracking_confidence (0-1), debris (yes/no), debris_confidence (0-1), \
     summary (text) and road_health_index (0-100)."
        .to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServicesConfig {
    pub object_store: Option<ServiceEndpoint>,
    /// Remote folder that receives work-order frame images.
    pub archive_folder: Option<String>,
    pub analysis: Option<AnalysisServiceConfig>,
    pub crm: Option<ServiceEndpoint>,
    pub status: Option<ServiceEndpoint>,
    #[serde(default = "default_status_queue")]
    pub status_queue: usize,
}

fn default_status_queue() -> usize {
    64
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExcludedArea {
    pub name: String,
    pub lat_min: f64,
    pub lat_max: f64,
    pub lon_min: f64,
    pub lon_max: f64,
}

impl ExcludedArea {
    /// Bounds may be written in either order; the box is normalised before testing.
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        let (lat_lo, lat_hi) = ordered(self.lat_min, self.lat_max);
        let (lon_lo, lon_hi) = ordered(self.lon_min, self.lon_max);
        (lat_lo..=lat_hi).contains(&lat) && (lon_lo..=lon_hi).contains(&lon)
    }
}

fn ordered(a: f64, b: f64) -> (f64, f64) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkOrderConfig {
    #[serde(default = "default_categories")]
    pub categories: Vec<String>,
    #[serde(default)]
    pub excluded_areas: Vec<ExcludedArea>,
}

fn default_categories() -> Vec<String> {
    vec!["pothole".to_string()]
}

impl Default for WorkOrderConfig {
    fn default() -> Self {
        WorkOrderConfig { categories: default_categories(), excluded_areas: Vec::new() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub pipeline: PipelineConfig,
    pub tools: ToolsConfig,
    pub output: OutputConfig,
    #[serde(default)]
    pub services: ServicesConfig,
    #[serde(default)]
    pub work_orders: WorkOrderConfig,
}

impl AppConfig {
    pub fn load_default() -> anyhow::Result<Self> {
        let default = include_str!("../config/default.toml");
        let cfg: AppConfig = toml::from_str(default)?;
        Ok(cfg)
    }

    pub fn load_from(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let p = path.into();
        let s = fs::read_to_string(&p)?;
        let cfg: AppConfig = toml::from_str(&s)?;
        Ok(cfg)
    }
}

/// Immutable per-run settings threaded through every stage.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub sampling_rate: f64,
    pub max_samples: Option<usize>,
    pub batch_size: usize,
    pub workers: usize,
    pub crop_top: u32,
    pub high_confidence_threshold: f64,
}

impl PipelineSettings {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.sampling_rate.is_finite() && self.sampling_rate > 0.0) {
            return Err(format!("sampling rate must be positive, got {}", self.sampling_rate));
        }
        if self.batch_size == 0 {
            return Err("batch size must be at least 1".to_string());
        }
        if self.workers == 0 {
            return Err("worker count must be at least 1".to_string());
        }
        if self.max_samples == Some(0) {
            return Err("max samples must be at least 1 when given".to_string());
        }
        Ok(())
    }
}

impl From<&PipelineConfig> for PipelineSettings {
    fn from(cfg: &PipelineConfig) -> Self {
        PipelineSettings {
            sampling_rate: cfg.sampling_rate,
            max_samples: cfg.max_samples,
            batch_size: cfg.batch_size,
            workers: cfg.workers,
            crop_top: cfg.crop_top,
            high_confidence_threshold: cfg.high_confidence_threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_parses() {
        let cfg = AppConfig::load_default().unwrap();
        assert_eq!(cfg.pipeline.batch_size, 6);
        assert_eq!(cfg.pipeline.crop_top, 713);
        assert_eq!(cfg.tools.telemetry_stream, "0:3");
        assert_eq!(cfg.work_orders.categories, vec!["pothole".to_string()]);
        assert_eq!(cfg.work_orders.excluded_areas.len(), 2);

        let settings = PipelineSettings::from(&cfg.pipeline);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_settings_validation() {
        let base = PipelineSettings {
            sampling_rate: 1.0,
            max_samples: Some(5),
            batch_size: 3,
            workers: 2,
            crop_top: 0,
            high_confidence_threshold: 0.9,
        };
        assert!(base.validate().is_ok());
        assert!(PipelineSettings { sampling_rate: 0.0, ..base.clone() }.validate().is_err());
        assert!(PipelineSettings { sampling_rate: f64::NAN, ..base.clone() }.validate().is_err());
        assert!(PipelineSettings { batch_size: 0, ..base.clone() }.validate().is_err());
        assert!(PipelineSettings { workers: 0, ..base.clone() }.validate().is_err());
        assert!(PipelineSettings { max_samples: Some(0), ..base }.validate().is_err());
    }

    #[test]
    fn test_excluded_area_accepts_swapped_bounds() {
        let area = ExcludedArea {
            name: "yard".to_string(),
            lat_min: 35.79,
            lat_max: 35.80,
            lon_min: -78.79,
            lon_max: -78.81,
        };
        assert!(area.contains(35.795, -78.80));
        assert!(!area.contains(35.795, -78.70));
    }
}
