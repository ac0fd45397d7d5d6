use crate::clients::{NamedLocation, ObjectStore, WorkOrderClient, WorkOrderEvent};
use crate::config::{ExcludedArea, WorkOrderConfig};
use crate::models::{DefectCategory, FusedRecord};
use std::sync::Arc;

/// Half-width in degrees of the first nearby-location search box.
const SEARCH_RADIUS: f64 = 0.0002;
const SEARCH_GROWTH: f64 = 0.001;
const MAX_SEARCHES: usize = 5;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkOrderTally {
    pub created: usize,
    pub excluded: usize,
    pub failed: usize,
}

/// Opens CRM events for confident detections. Best effort: nothing in here
/// fails the run.
pub struct WorkOrderEngine {
    client: Arc<dyn WorkOrderClient>,
    store: Option<Arc<dyn ObjectStore>>,
    archive_folder: String,
    categories: Vec<DefectCategory>,
    excluded_areas: Vec<ExcludedArea>,
}

impl WorkOrderEngine {
    pub fn new(
        client: Arc<dyn WorkOrderClient>,
        store: Option<Arc<dyn ObjectStore>>,
        archive_folder: impl Into<String>,
        cfg: &WorkOrderConfig,
    ) -> Self {
        let categories = cfg
            .categories
            .iter()
            .filter_map(|name| {
                let category = DefectCategory::from_name(name);
                if category.is_none() {
                    tracing::warn!("ignoring unknown work-order category {}", name);
                }
                category
            })
            .collect();
        WorkOrderEngine {
            client,
            store,
            archive_folder: archive_folder.into(),
            categories,
            excluded_areas: cfg.excluded_areas.clone(),
        }
    }

    pub fn categories(&self) -> &[DefectCategory] {
        &self.categories
    }

    pub fn excluded_area(&self, lat: f64, lon: f64) -> Option<&ExcludedArea> {
        self.excluded_areas.iter().find(|area| area.contains(lat, lon))
    }

    /// Records with a confident finding in one of the configured categories,
    /// paired with the first such category.
    pub fn candidates<'r>(&self, records: &'r [FusedRecord], threshold: f64) -> Vec<(&'r FusedRecord, DefectCategory)> {
        records
            .iter()
            .filter_map(|r| {
                self.categories
                    .iter()
                    .find(|c| r.analysis.is_confident(**c, threshold))
                    .map(|c| (r, *c))
            })
            .collect()
    }

    /// Closest CRM location to the point, widening the search box until
    /// something turns up. Lookup failures are logged and give `None`.
    pub async fn nearest_location(&self, lat: f64, lon: f64) -> Option<(NamedLocation, f64)> {
        let mut radius = SEARCH_RADIUS;
        for _ in 0..MAX_SEARCHES {
            let locations = match self.client.nearby_locations(lat, lon, radius).await {
                Ok(locations) => locations,
                Err(e) => {
                    tracing::warn!("nearby location lookup failed: {:#}", e);
                    return None;
                }
            };
            let nearest = locations
                .into_iter()
                .map(|loc| {
                    let km = approx_distance_km(lat, lon, loc.latitude, loc.longitude);
                    (loc, km)
                })
                .min_by(|a, b| a.1.total_cmp(&b.1));
            if nearest.is_some() {
                return nearest;
            }
            radius += SEARCH_GROWTH;
        }
        None
    }

    pub async fn run(&self, records: &[FusedRecord], threshold: f64) -> WorkOrderTally {
        let mut tally = WorkOrderTally::default();
        for (record, category) in self.candidates(records, threshold) {
            if let Some(area) = self.excluded_area(record.latitude, record.longitude) {
                tracing::info!(frame = %record.filename, area = %area.name, "detection inside excluded area, skipped");
                tally.excluded += 1;
                continue;
            }

            let image_reference = match &self.store {
                Some(store) => match store.upload(&record.filepath, &self.archive_folder).await {
                    Ok(id) => Some(id),
                    Err(e) => {
                        tracing::warn!(frame = %record.filename, "image archive failed: {:#}", e);
                        None
                    }
                },
                None => None,
            };

            let nearest = self.nearest_location(record.latitude, record.longitude).await;
            let event = build_event(record, category, image_reference, nearest.as_ref());
            match self.client.create_event(&event).await {
                Ok(id) => {
                    tally.created += 1;
                    tracing::info!(frame = %record.filename, record_id = %id, "work order created");
                }
                Err(e) => {
                    tally.failed += 1;
                    tracing::error!(frame = %record.filename, "work order creation failed: {:#}", e);
                }
            }
        }
        tracing::info!(
            created = tally.created,
            excluded = tally.excluded,
            failed = tally.failed,
            "work order engine finished"
        );
        tally
    }
}

pub fn subject(category: DefectCategory, confidence: f64) -> String {
    format!("{} Detected - Confidence {:.1}%", category.label(), confidence * 100.0)
}

/// Flat-earth distance, good enough at street scale: degrees times 110 km.
pub fn approx_distance_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    (lat2 - lat1).hypot(lon2 - lon1) * 110.0
}

pub fn describe(record: &FusedRecord, category: DefectCategory, nearest: Option<&(NamedLocation, f64)>) -> String {
    let analysis = &record.analysis;
    let summary = analysis.summary.as_deref().unwrap_or("No analysis summary provided.");

    let mut findings = Vec::new();
    for c in DefectCategory::ALL {
        let Some(flag) = analysis.flag(c) else { continue };
        let value: String = flag.clone().into();
        match analysis.confidence(c) {
            Some(conf) => findings.push(format!("{}: {} ({:.1}%)", c.label(), value, conf * 100.0)),
            None => findings.push(format!("{}: {}", c.label(), value)),
        }
    }
    if let Some(index) = analysis.road_health_index {
        findings.push(format!("Road Health Index: {}", index));
    }

    let location = match nearest {
        Some((loc, km)) => format!("Nearest location: {} ({:.3} km away)\n", loc.name, km),
        None => String::new(),
    };

    format!(
        "This work order was created automatically after a detected {}. \
         If the analysis is wrong or no repair is needed, reject this record.\n\n\
         Analysis summary:\n{}\n\n\
         Assessment results:\n{}\n\n\
         Captured {} at {:.6}, {:.6}\n\
         {}\
         https://www.google.com/maps/place/{},{}\n",
        category.label().to_lowercase(),
        summary,
        findings.join("\n"),
        record.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
        record.latitude,
        record.longitude,
        location,
        record.latitude,
        record.longitude,
    )
}

pub fn build_event(
    record: &FusedRecord,
    category: DefectCategory,
    image_reference: Option<String>,
    nearest: Option<&(NamedLocation, f64)>,
) -> WorkOrderEvent {
    let confidence = record.analysis.confidence(category).unwrap_or(0.0);
    WorkOrderEvent {
        subject: subject(category, confidence),
        description: describe(record, category, nearest),
        category,
        confidence,
        latitude: record.latitude,
        longitude: record.longitude,
        image_reference,
        location_id: nearest.map(|(loc, _)| loc.id.clone()),
    }
}
