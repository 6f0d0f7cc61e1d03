use anyhow::{Result, bail};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// mmol/L per mg/dL, the conversion factor the looping ecosystem settled on.
pub const MMOLL_PER_MGDL: f64 = 0.0555;

/// Reported duration for an indefinite override (48 hours), used when a
/// remote report needs a concrete number.
pub const INDEFINITE_REPORT_MINUTES: i64 = 2880;

/// Upper bound on user-supplied durations (one year in minutes). Keeps
/// time arithmetic on stored durations away from chrono's overflow panic.
pub const MAX_DURATION_MINUTES: i64 = 525_600;

/// Reserved name of the temp target cancellation marker.
pub const TEMP_TARGET_CANCEL: &str = "Cancel";
/// Entered-by tag for user-created entries.
pub const TEMP_TARGET_MANUAL: &str = "loopctl";
/// Display label fallback for unnamed temp targets.
pub const TEMP_TARGET_CUSTOM: &str = "Temp Profile";

/// Label for an override that is neither preset-derived nor a plain
/// percentage adjustment.
pub const OVERRIDE_CUSTOM_LABEL: &str = "Custom";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlucoseUnit {
    MgDl,
    MmolL,
}

impl GlucoseUnit {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "mgdl" | "mg/dl" => Ok(Self::MgDl),
            "mmoll" | "mmol/l" => Ok(Self::MmolL),
            _ => bail!("Invalid glucose unit '{s}'. Use mgdl or mmoll"),
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MgDl => "mg/dL",
            Self::MmolL => "mmol/L",
        }
    }

    /// Canonicalize a value expressed in this unit into mg/dL.
    #[must_use]
    pub fn to_mgdl(self, value: f64) -> f64 {
        match self {
            Self::MgDl => value,
            Self::MmolL => mmoll_to_mgdl(value),
        }
    }

    /// Convert a canonical mg/dL value into this unit for display.
    #[must_use]
    pub fn from_mgdl(self, value: f64) -> f64 {
        match self {
            Self::MgDl => value,
            Self::MmolL => mgdl_to_mmoll(value),
        }
    }
}

#[must_use]
pub fn mgdl_to_mmoll(mgdl: f64) -> f64 {
    mgdl * MMOLL_PER_MGDL
}

#[must_use]
pub fn mmoll_to_mgdl(mmoll: f64) -> f64 {
    mmoll / MMOLL_PER_MGDL
}

/// Read-only settings handed in by the host: the configured display unit
/// and the default minute caps for the two automated bolus categories.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TherapySettings {
    pub units: GlucoseUnit,
    pub default_smb_minutes: i64,
    pub default_uam_minutes: i64,
}

impl Default for TherapySettings {
    fn default() -> Self {
        Self {
            units: GlucoseUnit::MgDl,
            default_smb_minutes: 30,
            default_uam_minutes: 30,
        }
    }
}

// --- Temp targets ---

/// One entry in the append-only temp target log. Target values are stored
/// in mg/dL regardless of the display unit. A row with the reserved cancel
/// name, zero duration, and zero targets is a cancellation marker, not a
/// real target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TempTarget {
    pub id: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub target_top: Option<f64>,
    pub target_bottom: Option<f64>,
    pub duration_min: i64,
    pub entered_by: Option<String>,
    pub reason: Option<String>,
    pub low_carb: Option<bool>,
    pub medium_carb: Option<bool>,
    pub high_carb: Option<bool>,
}

impl TempTarget {
    /// Build the cancellation marker for `at`.
    #[must_use]
    pub fn cancel(at: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: Some(TEMP_TARGET_CANCEL.to_string()),
            created_at: at,
            target_top: Some(0.0),
            target_bottom: Some(0.0),
            duration_min: 0,
            entered_by: Some(TEMP_TARGET_MANUAL.to_string()),
            reason: Some(TEMP_TARGET_CANCEL.to_string()),
            low_carb: Some(true),
            medium_carb: Some(false),
            high_carb: Some(false),
        }
    }

    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .or(self.reason.as_deref())
            .unwrap_or(TEMP_TARGET_CUSTOM)
    }

    #[must_use]
    pub fn is_cancel(&self) -> bool {
        self.name.as_deref() == Some(TEMP_TARGET_CANCEL)
    }

    /// Activity is a pure function of the record and the query time:
    /// active iff this is not a cancel marker, the duration is at least a
    /// minute, and `created_at <= now < created_at + duration`.
    #[must_use]
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        if self.is_cancel() || self.duration_min < 1 {
            return false;
        }
        let end = self.created_at + Duration::minutes(self.duration_min);
        self.created_at <= now && now < end
    }
}

// Identity of a temp target is its creation timestamp alone; two entries
// with equal timestamps collapse to one logical entity.
impl PartialEq for TempTarget {
    fn eq(&self, other: &Self) -> bool {
        self.created_at == other.created_at
    }
}

impl Eq for TempTarget {}

/// Caller-facing temp target candidate. Targets are in `unit` (or the
/// configured display unit when `unit` is None) and are canonicalized on
/// enactment.
#[derive(Debug, Clone)]
pub struct NewTempTarget {
    pub name: Option<String>,
    pub target_top: Option<f64>,
    pub target_bottom: Option<f64>,
    pub duration_min: i64,
    pub unit: Option<GlucoseUnit>,
    pub reason: Option<String>,
    pub low_carb: Option<bool>,
    pub medium_carb: Option<bool>,
    pub high_carb: Option<bool>,
}

// --- Overrides ---

/// One row in the override log. `target_mgdl == 0` means no override
/// target was requested. `enabled` is flipped off on closure; natural
/// expiry is computed at read time and leaves the flag untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Override {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub percentage: f64,
    pub indefinite: bool,
    pub duration_min: i64,
    pub target_mgdl: f64,
    pub smb_off: bool,
    pub advanced: bool,
    pub isf_and_cr: bool,
    pub isf: bool,
    pub cr: bool,
    pub smb_scheduled_off: bool,
    pub start_hour: i64,
    pub end_hour: i64,
    pub smb_minutes: i64,
    pub uam_minutes: i64,
    pub preset_id: Option<String>,
    pub is_preset: bool,
    pub enabled: bool,
}

impl Override {
    /// Display label for sync reports: the preset name when this row was
    /// instantiated from a preset, otherwise the literal percentage
    /// (e.g. "120 %"), or "Custom" at the neutral 100 %.
    #[must_use]
    pub fn label(&self, preset_name: Option<&str>) -> String {
        if self.is_preset {
            if let Some(name) = preset_name {
                return name.to_string();
            }
        }
        if (self.percentage - 100.0).abs() > f64::EPSILON {
            format!("{} %", self.percentage)
        } else {
            OVERRIDE_CUSTOM_LABEL.to_string()
        }
    }

    /// Duration to report upstream: the stored duration, or 48 hours when
    /// the override is indefinite (or was saved with no duration).
    #[must_use]
    pub fn reported_duration(&self) -> i64 {
        if self.indefinite || self.duration_min == 0 {
            INDEFINITE_REPORT_MINUTES
        } else {
            self.duration_min
        }
    }

    #[must_use]
    pub fn end_time(&self) -> DateTime<Utc> {
        self.created_at + Duration::minutes(self.duration_min)
    }

    /// Natural expiry, computed lazily. Indefinite overrides never expire.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        !self.indefinite && self.end_time() <= now
    }

    /// Minutes elapsed since activation, clamped to non-negative.
    #[must_use]
    pub fn elapsed_minutes(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_minutes().max(0)
    }

    /// Minutes left before natural expiry, clamped to non-negative.
    #[must_use]
    pub fn remaining_minutes(&self, now: DateTime<Utc>) -> i64 {
        (self.end_time() - now).num_minutes().max(0)
    }
}

/// Input for saving an override: everything the user can dial in, with the
/// target expressed in the configured display unit. Advanced sub-settings
/// are persisted only when `advanced` is set; the target only when
/// `override_target` is set.
#[derive(Debug, Clone)]
pub struct OverrideSettings {
    pub percentage: f64,
    pub indefinite: bool,
    pub duration_min: i64,
    pub override_target: bool,
    pub target: f64,
    pub smb_off: bool,
    pub advanced: bool,
    pub isf_and_cr: bool,
    pub isf: bool,
    pub cr: bool,
    pub smb_scheduled_off: bool,
    pub start_hour: i64,
    pub end_hour: i64,
    pub smb_minutes: i64,
    pub uam_minutes: i64,
}

impl Default for OverrideSettings {
    fn default() -> Self {
        Self {
            percentage: 100.0,
            indefinite: true,
            duration_min: 0,
            override_target: false,
            target: 0.0,
            smb_off: false,
            advanced: false,
            isf_and_cr: true,
            isf: true,
            cr: true,
            smb_scheduled_off: false,
            start_hour: 0,
            end_hour: 23,
            smb_minutes: 0,
            uam_minutes: 0,
        }
    }
}

/// Immutable override template. Saving a preset never touches the active
/// override; applying one copies every field into a fresh override row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverridePreset {
    pub id: String,
    pub name: String,
    pub emoji: Option<String>,
    pub created_at: DateTime<Utc>,
    pub percentage: f64,
    pub indefinite: bool,
    pub duration_min: i64,
    pub target_mgdl: f64,
    pub smb_off: bool,
    pub advanced: bool,
    pub isf_and_cr: bool,
    pub isf: bool,
    pub cr: bool,
    pub smb_scheduled_off: bool,
    pub start_hour: i64,
    pub end_hour: i64,
    pub smb_minutes: i64,
    pub uam_minutes: i64,
}

/// Snapshot of the override state as of a query time, with the target
/// already converted into the display unit. This is what a UI binds to;
/// it is returned by value, never held as ambient mutable state.
#[derive(Debug, Clone, Serialize)]
pub struct OverrideView {
    pub enabled: bool,
    pub percentage: f64,
    pub indefinite: bool,
    /// Remaining minutes for an active bounded override, 0 otherwise.
    pub duration_min: i64,
    /// Override target in the display unit, None when not overridden.
    pub target: Option<f64>,
    pub smb_off: bool,
    pub advanced: bool,
    pub isf_and_cr: bool,
    pub isf: bool,
    pub cr: bool,
    pub smb_scheduled_off: bool,
    pub start_hour: i64,
    pub end_hour: i64,
    pub smb_minutes: i64,
    pub uam_minutes: i64,
    pub preset_id: Option<String>,
}

impl OverrideView {
    /// The reset state: neutral percentage, no duration, no target, all
    /// toggles off, minute caps back at the configured defaults.
    #[must_use]
    pub fn inactive(settings: &TherapySettings) -> Self {
        Self {
            enabled: false,
            percentage: 100.0,
            indefinite: true,
            duration_min: 0,
            target: None,
            smb_off: false,
            advanced: false,
            isf_and_cr: true,
            isf: true,
            cr: true,
            smb_scheduled_off: false,
            start_hour: 0,
            end_hour: 23,
            smb_minutes: settings.default_smb_minutes,
            uam_minutes: settings.default_uam_minutes,
            preset_id: None,
        }
    }
}

// --- Validation ---

pub fn validate_percentage(percentage: f64) -> Result<()> {
    if !(10.0..=200.0).contains(&percentage) {
        bail!("Override percentage must be between 10 and 200 (got {percentage})");
    }
    Ok(())
}

pub fn validate_duration(duration_min: i64) -> Result<()> {
    if duration_min < 0 {
        bail!("Duration must not be negative (got {duration_min})");
    }
    if duration_min > MAX_DURATION_MINUTES {
        bail!("Duration must not exceed {MAX_DURATION_MINUTES} minutes (got {duration_min})");
    }
    Ok(())
}

pub fn validate_target_range(top: Option<f64>, bottom: Option<f64>) -> Result<()> {
    if let Some(t) = top {
        if t < 0.0 {
            bail!("Target top must not be negative");
        }
    }
    if let Some(b) = bottom {
        if b < 0.0 {
            bail!("Target bottom must not be negative");
        }
    }
    if let (Some(t), Some(b)) = (top, bottom) {
        if t < b {
            bail!("Target top must not be below target bottom");
        }
    }
    Ok(())
}

pub fn validate_schedule_window(start_hour: i64, end_hour: i64) -> Result<()> {
    if !(0..24).contains(&start_hour) || !(0..24).contains(&end_hour) {
        bail!("Schedule hours must be between 0 and 23");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap() + Duration::minutes(minute)
    }

    #[test]
    fn test_unit_round_trip() {
        let mmoll = mgdl_to_mmoll(100.0);
        assert!((mmoll - 5.55).abs() < 0.01);
        let back = mmoll_to_mgdl(mmoll);
        assert!((back - 100.0).abs() < 0.01);
    }

    #[test]
    fn test_unit_canonicalization_boundary() {
        assert!((GlucoseUnit::MgDl.to_mgdl(120.0) - 120.0).abs() < f64::EPSILON);
        assert!((GlucoseUnit::MmolL.to_mgdl(5.55) - 100.0).abs() < 0.01);
        assert!((GlucoseUnit::MmolL.from_mgdl(100.0) - 5.55).abs() < 0.01);
    }

    #[test]
    fn test_unit_parse() {
        assert_eq!(GlucoseUnit::parse("mgdl").unwrap(), GlucoseUnit::MgDl);
        assert_eq!(GlucoseUnit::parse("mg/dL").unwrap(), GlucoseUnit::MgDl);
        assert_eq!(GlucoseUnit::parse("MMOLL").unwrap(), GlucoseUnit::MmolL);
        assert!(GlucoseUnit::parse("mol").is_err());
    }

    fn sample_target(duration_min: i64) -> TempTarget {
        TempTarget {
            id: "t1".to_string(),
            name: Some("Exercise".to_string()),
            created_at: at(0),
            target_top: Some(140.0),
            target_bottom: Some(140.0),
            duration_min,
            entered_by: Some(TEMP_TARGET_MANUAL.to_string()),
            reason: None,
            low_carb: None,
            medium_carb: None,
            high_carb: None,
        }
    }

    #[test]
    fn test_temp_target_active_window() {
        let tt = sample_target(60);
        assert!(tt.is_active_at(at(0)));
        assert!(tt.is_active_at(at(30)));
        assert!(tt.is_active_at(at(59)));
        assert!(!tt.is_active_at(at(60)));
        assert!(!tt.is_active_at(at(61)));
        // Not yet started
        assert!(!tt.is_active_at(at(-1)));
    }

    #[test]
    fn test_temp_target_zero_duration_never_active() {
        let tt = sample_target(0);
        assert!(!tt.is_active_at(at(0)));
    }

    #[test]
    fn test_cancel_marker_shape() {
        let marker = TempTarget::cancel(at(5));
        assert!(marker.is_cancel());
        assert_eq!(marker.duration_min, 0);
        assert_eq!(marker.target_top, Some(0.0));
        assert_eq!(marker.target_bottom, Some(0.0));
        assert!(!marker.is_active_at(at(5)));
        assert_eq!(marker.entered_by.as_deref(), Some(TEMP_TARGET_MANUAL));
    }

    #[test]
    fn test_display_name_fallback() {
        let mut tt = sample_target(30);
        assert_eq!(tt.display_name(), "Exercise");
        tt.name = None;
        tt.reason = Some("pre-meal".to_string());
        assert_eq!(tt.display_name(), "pre-meal");
        tt.reason = None;
        assert_eq!(tt.display_name(), TEMP_TARGET_CUSTOM);
    }

    #[test]
    fn test_temp_target_identity_by_timestamp() {
        let a = sample_target(30);
        let mut b = sample_target(60);
        b.id = "other".to_string();
        assert_eq!(a, b);
        b.created_at = at(1);
        assert_ne!(a, b);
    }

    fn sample_override() -> Override {
        Override {
            id: 1,
            created_at: at(0),
            percentage: 80.0,
            indefinite: false,
            duration_min: 120,
            target_mgdl: 0.0,
            smb_off: false,
            advanced: false,
            isf_and_cr: true,
            isf: true,
            cr: true,
            smb_scheduled_off: false,
            start_hour: 0,
            end_hour: 23,
            smb_minutes: 0,
            uam_minutes: 0,
            preset_id: None,
            is_preset: false,
            enabled: true,
        }
    }

    #[test]
    fn test_override_label_rule() {
        let mut ov = sample_override();
        assert_eq!(ov.label(None), "80 %");
        ov.percentage = 100.0;
        assert_eq!(ov.label(None), OVERRIDE_CUSTOM_LABEL);
        ov.is_preset = true;
        ov.preset_id = Some("p1".to_string());
        assert_eq!(ov.label(Some("Sport")), "Sport");
        // Preset row whose preset has since vanished falls back
        assert_eq!(ov.label(None), OVERRIDE_CUSTOM_LABEL);
    }

    #[test]
    fn test_reported_duration_indefinite_default() {
        let mut ov = sample_override();
        assert_eq!(ov.reported_duration(), 120);
        ov.indefinite = true;
        assert_eq!(ov.reported_duration(), INDEFINITE_REPORT_MINUTES);
        ov.indefinite = false;
        ov.duration_min = 0;
        assert_eq!(ov.reported_duration(), INDEFINITE_REPORT_MINUTES);
    }

    #[test]
    fn test_override_expiry_and_remaining() {
        let ov = sample_override();
        assert!(!ov.is_expired_at(at(119)));
        assert!(ov.is_expired_at(at(120)));
        assert_eq!(ov.remaining_minutes(at(30)), 90);
        assert_eq!(ov.remaining_minutes(at(150)), 0);
        assert_eq!(ov.elapsed_minutes(at(10)), 10);
        assert_eq!(ov.elapsed_minutes(at(-5)), 0);
    }

    #[test]
    fn test_indefinite_never_expires() {
        let mut ov = sample_override();
        ov.indefinite = true;
        assert!(!ov.is_expired_at(at(100_000)));
    }

    #[test]
    fn test_validate_percentage() {
        assert!(validate_percentage(100.0).is_ok());
        assert!(validate_percentage(10.0).is_ok());
        assert!(validate_percentage(200.0).is_ok());
        assert!(validate_percentage(0.0).is_err());
        assert!(validate_percentage(250.0).is_err());
    }

    #[test]
    fn test_validate_duration_bounds() {
        assert!(validate_duration(0).is_ok());
        assert!(validate_duration(2880).is_ok());
        assert!(validate_duration(MAX_DURATION_MINUTES).is_ok());
        assert!(validate_duration(-1).is_err());
        assert!(validate_duration(MAX_DURATION_MINUTES + 1).is_err());
        assert!(validate_duration(i64::MAX).is_err());
    }

    #[test]
    fn test_validate_target_range() {
        assert!(validate_target_range(Some(140.0), Some(120.0)).is_ok());
        assert!(validate_target_range(Some(100.0), Some(100.0)).is_ok());
        assert!(validate_target_range(None, None).is_ok());
        assert!(validate_target_range(Some(90.0), Some(120.0)).is_err());
        assert!(validate_target_range(Some(-1.0), None).is_err());
    }

    #[test]
    fn test_validate_schedule_window() {
        assert!(validate_schedule_window(0, 23).is_ok());
        assert!(validate_schedule_window(22, 6).is_ok());
        assert!(validate_schedule_window(24, 0).is_err());
        assert!(validate_schedule_window(0, -1).is_err());
    }

    #[test]
    fn test_inactive_view_resets_to_defaults() {
        let settings = TherapySettings {
            units: GlucoseUnit::MmolL,
            default_smb_minutes: 45,
            default_uam_minutes: 60,
        };
        let view = OverrideView::inactive(&settings);
        assert!(!view.enabled);
        assert!((view.percentage - 100.0).abs() < f64::EPSILON);
        assert!(view.indefinite);
        assert_eq!(view.duration_min, 0);
        assert!(view.target.is_none());
        assert_eq!(view.smb_minutes, 45);
        assert_eq!(view.uam_minutes, 60);
    }
}
