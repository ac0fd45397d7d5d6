use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// One geolocated reading from a recording's embedded track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// Whole-second resolution.
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub elevation: Option<f64>,
    pub heart_rate: Option<f64>,
    pub speed: Option<f64>,
}

impl TelemetrySample {
    /// Zeroed sample returned when a frame cannot be aligned.
    pub fn sentinel() -> Self {
        TelemetrySample {
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
            latitude: 0.0,
            longitude: 0.0,
            elevation: Some(0.0),
            heart_rate: Some(0.0),
            speed: Some(0.0),
        }
    }
}

/// A frame pulled out of the video, not yet aligned to telemetry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampledFrame {
    /// Source frame number in the video stream.
    pub index: u64,
    pub image_path: PathBuf,
    pub relative_offset_seconds: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefectCategory {
    Pothole,
    AlligatorCracking,
    LineCracking,
    Debris,
}

impl DefectCategory {
    pub const ALL: [DefectCategory; 4] = [
        DefectCategory::Pothole,
        DefectCategory::AlligatorCracking,
        DefectCategory::LineCracking,
        DefectCategory::Debris,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            DefectCategory::Pothole => "pothole",
            DefectCategory::AlligatorCracking => "alligator_cracking",
            DefectCategory::LineCracking => "line_cracking",
            DefectCategory::Debris => "debris",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            DefectCategory::Pothole => "Pothole",
            DefectCategory::AlligatorCracking => "Alligator Cracking",
            DefectCategory::LineCracking => "Line Cracking",
            DefectCategory::Debris => "Debris",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        DefectCategory::ALL.into_iter().find(|c| c.name() == name)
    }
}

impl fmt::Display for DefectCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Boolean-like finding reported by the analysis service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawFlag", into = "String")]
pub enum DefectFlag {
    Yes,
    No,
    /// Severity words such as "light" or "moderate"; not counted as positive.
    Other(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawFlag {
    Bool(bool),
    Text(String),
}

impl From<RawFlag> for DefectFlag {
    fn from(raw: RawFlag) -> Self {
        match raw {
            RawFlag::Bool(true) => DefectFlag::Yes,
            RawFlag::Bool(false) => DefectFlag::No,
            RawFlag::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "yes" | "true" => DefectFlag::Yes,
                "no" | "false" | "none" => DefectFlag::No,
                _ => DefectFlag::Other(s),
            },
        }
    }
}

impl From<DefectFlag> for String {
    fn from(flag: DefectFlag) -> Self {
        match flag {
            DefectFlag::Yes => "yes".to_string(),
            DefectFlag::No => "no".to_string(),
            DefectFlag::Other(s) => s,
        }
    }
}

/// Structured verdict for one frame. Fields the service sends beyond the
/// named ones are kept in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisVerdict {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pothole: Option<DefectFlag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pothole_confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alligator_cracking: Option<DefectFlag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alligator_cracking_confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_cracking: Option<DefectFlag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_cracking_confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debris: Option<DefectFlag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debris_confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub road_health_index: Option<f64>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl AnalysisVerdict {
    pub fn flag(&self, category: DefectCategory) -> Option<&DefectFlag> {
        match category {
            DefectCategory::Pothole => self.pothole.as_ref(),
            DefectCategory::AlligatorCracking => self.alligator_cracking.as_ref(),
            DefectCategory::LineCracking => self.line_cracking.as_ref(),
            DefectCategory::Debris => self.debris.as_ref(),
        }
    }

    pub fn confidence(&self, category: DefectCategory) -> Option<f64> {
        match category {
            DefectCategory::Pothole => self.pothole_confidence,
            DefectCategory::AlligatorCracking => self.alligator_cracking_confidence,
            DefectCategory::LineCracking => self.line_cracking_confidence,
            DefectCategory::Debris => self.debris_confidence,
        }
    }

    pub fn is_positive(&self, category: DefectCategory) -> bool {
        matches!(self.flag(category), Some(DefectFlag::Yes))
    }

    /// Positive with confidence at or above `threshold`.
    pub fn is_confident(&self, category: DefectCategory, threshold: f64) -> bool {
        self.is_positive(category) && self.confidence(category).unwrap_or(0.0) >= threshold
    }

    pub fn is_empty(&self) -> bool {
        *self == AnalysisVerdict::default()
    }
}

/// A sampled frame fused with its nearest telemetry sample and, later, its verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedRecord {
    pub frame_index: u64,
    pub filename: String,
    pub filepath: PathBuf,
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub external_reference_id: Option<String>,
    #[serde(default)]
    pub analysis: AnalysisVerdict,
}

impl FusedRecord {
    pub fn json_path(&self) -> PathBuf {
        self.filepath.with_extension("json")
    }
}
