// src/compliance.rs
//
// PPE compliance rules and alert generation.
//
// Coverage is decided at the frame level: a required class counts as worn
// when any detection of it sufficiently overlaps any detected person.
// Persons are not individually matched to their own equipment; the overlap
// ratio is normalized by the PPE box area so a small item fully inside a
// large person box still counts.

use crate::types::{Alert, BoundingBox, ComplianceResult, ComplianceSummary, Detection};
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};
use tracing::debug;

/// Minimum intersection / PPE-box-area ratio for a PPE item to count as
/// worn by a person.
const OVERLAP_RATIO_THRESHOLD: f32 = 0.3;

const PERSON_CLASS: &str = "person";

/// Marker prefix for classes the model reports as explicit non-wearing
/// (e.g. `no_hardhat`).
const NEGATIVE_CLASS_PREFIX: &str = "no_";

/// True when the PPE box overlaps the person box by more than the ratio
/// threshold, measured against the PPE box's own area. Zero-area boxes
/// never overlap.
fn covers(person: &BoundingBox, ppe: &BoundingBox) -> bool {
    let ppe_area = ppe.area();
    if ppe_area <= 0.0 {
        return false;
    }
    person.intersection_area(ppe) / ppe_area > OVERLAP_RATIO_THRESHOLD
}

/// Evaluate one frame's detections against the required PPE set.
pub fn check_compliance(detections: &[Detection], required_ppe: &[String]) -> ComplianceResult {
    let persons: Vec<&Detection> = detections
        .iter()
        .filter(|d| d.class_name == PERSON_CLASS)
        .collect();

    let required: BTreeSet<&str> = required_ppe.iter().map(String::as_str).collect();

    // Union of required classes covered by any person.
    let mut detected_ppe: BTreeSet<&str> = BTreeSet::new();
    for person in &persons {
        for det in detections {
            if required.contains(det.class_name.as_str()) && covers(&person.bbox, &det.bbox) {
                detected_ppe.insert(det.class_name.as_str());
            }
        }
    }

    let missing_ppe: Vec<String> = required
        .difference(&detected_ppe)
        .map(|s| s.to_string())
        .collect();

    let violations: Vec<String> = detections
        .iter()
        .filter(|d| d.class_name.starts_with(NEGATIVE_CLASS_PREFIX))
        .map(|d| d.class_name.clone())
        .collect();

    let compliant = missing_ppe.is_empty() && violations.is_empty();

    ComplianceResult {
        compliant,
        persons_detected: persons.len(),
        detected_ppe: detected_ppe.iter().map(|s| s.to_string()).collect(),
        summary: ComplianceSummary {
            total_persons: persons.len(),
            compliant_count: persons.len().saturating_sub(violations.len()),
            violation_count: violations.len(),
        },
        missing_ppe,
        violations,
    }
}

/// Per-class last-alert timestamps. Owned by the orchestrator, created at
/// startup, reset only on process restart. Entries never expire, only get
/// overwritten by newer alerts.
#[derive(Debug, Default)]
pub struct CooldownTracker {
    last_alert: HashMap<String, Instant>,
}

impl CooldownTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn in_cooldown(&self, class_name: &str, now: Instant, cooldown: Duration) -> bool {
        self.last_alert
            .get(class_name)
            .is_some_and(|&last| now.duration_since(last) < cooldown)
    }

    fn record(&mut self, class_name: &str, now: Instant) {
        self.last_alert.insert(class_name.to_string(), now);
    }
}

/// Produce at most one alert per missing required class, honoring the
/// per-class cooldown. The cooldown table is mutated only for classes that
/// actually emit. Alerts carry the first detected person's box and
/// confidence; with no person in frame nothing is emitted.
pub fn generate_alerts(
    detections: &[Detection],
    result: &ComplianceResult,
    cooldowns: &mut CooldownTracker,
    cooldown: Duration,
    now: Instant,
) -> Vec<Alert> {
    let first_person = detections.iter().find(|d| d.class_name == PERSON_CLASS);
    let Some(person) = first_person else {
        return Vec::new();
    };

    let mut alerts = Vec::new();
    for class_name in &result.missing_ppe {
        if cooldowns.in_cooldown(class_name, now, cooldown) {
            debug!("Alert for {} suppressed by cooldown", class_name);
            continue;
        }
        cooldowns.record(class_name, now);
        alerts.push(Alert {
            class_name: class_name.clone(),
            alert_type: "missing_ppe".to_string(),
            message: format!("PPE violation detected: {} not worn", class_name),
            person_bbox: person.bbox,
            confidence: person.confidence,
        });
    }

    alerts
}
