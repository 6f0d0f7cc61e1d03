use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{GlucoseUnit, TEMP_TARGET_MANUAL, TempTarget};

/// Nightscout treatment for an override activation or closure. Overrides
/// travel as exercise events; the label goes in the notes field.
#[derive(Debug, Serialize)]
pub struct ExerciseEvent {
    #[serde(rename = "eventType")]
    pub event_type: &'static str,
    pub created_at: DateTime<Utc>,
    pub duration: i64,
    pub notes: String,
    #[serde(rename = "enteredBy")]
    pub entered_by: &'static str,
}

/// Nightscout treatment for a temp target entry. Targets are expressed in
/// the configured display unit, matching what the Nightscout site shows.
#[derive(Debug, Serialize)]
pub struct TempTargetEvent {
    #[serde(rename = "eventType")]
    pub event_type: &'static str,
    pub created_at: DateTime<Utc>,
    #[serde(rename = "targetTop", skip_serializing_if = "Option::is_none")]
    pub target_top: Option<f64>,
    #[serde(rename = "targetBottom", skip_serializing_if = "Option::is_none")]
    pub target_bottom: Option<f64>,
    pub duration: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(rename = "enteredBy", skip_serializing_if = "Option::is_none")]
    pub entered_by: Option<String>,
    pub units: &'static str,
}

const EVENT_EXERCISE: &str = "Exercise";
const EVENT_TEMP_TARGET: &str = "Temporary Target";

#[must_use]
pub fn override_started_event(
    label: &str,
    duration_min: i64,
    started_at: DateTime<Utc>,
) -> ExerciseEvent {
    ExerciseEvent {
        event_type: EVENT_EXERCISE,
        created_at: started_at,
        duration: duration_min,
        notes: label.to_string(),
        entered_by: TEMP_TARGET_MANUAL,
    }
}

/// Closure is reported as a fresh event carrying the elapsed duration, so
/// the remote timeline shows how long the override actually ran.
#[must_use]
pub fn override_closed_event(
    label: &str,
    elapsed_min: i64,
    started_at: DateTime<Utc>,
) -> ExerciseEvent {
    ExerciseEvent {
        event_type: EVENT_EXERCISE,
        created_at: started_at,
        duration: elapsed_min,
        notes: label.to_string(),
        entered_by: TEMP_TARGET_MANUAL,
    }
}

/// Map a stored temp target (canonical mg/dL) into a Nightscout treatment
/// in the display unit. Cancel markers map to a zero-duration entry, which
/// is how Nightscout ends a running temp target.
#[must_use]
pub fn temp_target_event(tt: &TempTarget, units: GlucoseUnit) -> TempTargetEvent {
    TempTargetEvent {
        event_type: EVENT_TEMP_TARGET,
        created_at: tt.created_at,
        target_top: tt.target_top.map(|v| units.from_mgdl(v)),
        target_bottom: tt.target_bottom.map(|v| units.from_mgdl(v)),
        duration: tt.duration_min,
        reason: tt.reason.clone().or_else(|| tt.name.clone()),
        entered_by: tt.entered_by.clone(),
        units: units.as_str(),
    }
}
