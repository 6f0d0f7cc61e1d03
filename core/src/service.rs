use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::db::Database;
use crate::models::{
    NewTempTarget, Override, OverridePreset, OverrideSettings, OverrideView, TEMP_TARGET_MANUAL,
    TempTarget, TherapySettings, validate_duration, validate_percentage, validate_schedule_window,
    validate_target_range,
};

/// Remote reporting collaborator (Nightscout in practice).
///
/// Reporting is best-effort and fire-and-forget: the service invokes these
/// and drops any error. Local state is the source of truth; a failed
/// report never rolls back a local write and is never surfaced.
pub trait SyncReporter: Send + Sync {
    fn report_temp_target(&self, target: &TempTarget) -> Result<()>;

    fn report_override_started(
        &self,
        label: &str,
        duration_min: i64,
        started_at: DateTime<Utc>,
    ) -> Result<()>;

    fn report_override_closed(
        &self,
        label: &str,
        duration_min: i64,
        started_at: DateTime<Utc>,
    ) -> Result<()>;
}

/// Owns the notion of "the currently active override" and "the currently
/// active temp target". At most one of each kind is active at any time;
/// activity is derived at read time, never driven by a timer.
pub struct TherapyService {
    db: Database,
    settings: TherapySettings,
}

impl TherapyService {
    pub fn new(db_path: &Path, settings: TherapySettings) -> Result<Self> {
        let db = Database::open(db_path)?;
        Ok(Self { db, settings })
    }

    pub fn new_in_memory(settings: TherapySettings) -> Result<Self> {
        let db = Database::open_in_memory()?;
        Ok(Self { db, settings })
    }

    #[must_use]
    pub fn settings(&self) -> &TherapySettings {
        &self.settings
    }

    /// Canonicalize a candidate into a storable temp target: values into
    /// mg/dL, creation stamped, manual entered-by tag.
    fn canonical_temp_target(&self, candidate: &NewTempTarget, now: DateTime<Utc>) -> TempTarget {
        let unit = candidate.unit.unwrap_or(self.settings.units);
        TempTarget {
            id: Uuid::new_v4().to_string(),
            name: candidate.name.clone(),
            created_at: now,
            target_top: candidate.target_top.map(|v| unit.to_mgdl(v)),
            target_bottom: candidate.target_bottom.map(|v| unit.to_mgdl(v)),
            duration_min: candidate.duration_min,
            entered_by: Some(TEMP_TARGET_MANUAL.to_string()),
            reason: candidate.reason.clone(),
            low_carb: candidate.low_carb,
            medium_carb: candidate.medium_carb,
            high_carb: candidate.high_carb,
        }
    }

    // --- Temp target lifecycle ---

    /// Append a new temp target to the log, report it upstream, and return
    /// the stored, canonicalized record. History is never mutated.
    pub fn enact_temp_target(
        &self,
        reporter: &dyn SyncReporter,
        candidate: &NewTempTarget,
        now: DateTime<Utc>,
    ) -> Result<TempTarget> {
        validate_duration(candidate.duration_min)?;
        validate_target_range(candidate.target_top, candidate.target_bottom)?;
        let tt = self.canonical_temp_target(candidate, now);
        self.db.append_temp_target(&tt)?;
        reporter.report_temp_target(&tt).ok();
        Ok(tt)
    }

    /// Append the reserved cancellation marker stamped `at`. The only way
    /// to end an active temp target before its duration elapses. Reported
    /// upstream as a zero-duration entry.
    pub fn cancel_temp_target(
        &self,
        reporter: &dyn SyncReporter,
        at: DateTime<Utc>,
    ) -> Result<TempTarget> {
        let marker = TempTarget::cancel(at);
        self.db.append_temp_target(&marker)?;
        reporter.report_temp_target(&marker).ok();
        Ok(marker)
    }

    /// Derived query: the most recent entry if it is a real target whose
    /// window contains `as_of`. A cancel marker, a zero duration, a
    /// not-yet-started entry, or an expired one all yield None.
    pub fn active_temp_target(&self, as_of: DateTime<Utc>) -> Result<Option<TempTarget>> {
        Ok(self
            .db
            .latest_temp_target()?
            .filter(|tt| tt.is_active_at(as_of)))
    }

    pub fn recent_temp_targets(&self, limit: i64) -> Result<Vec<TempTarget>> {
        self.db.recent_temp_targets(limit)
    }

    // --- Temp target presets ---

    /// Persist a temp target template. Does not touch the live log and is
    /// never reported anywhere; presets are local until applied.
    pub fn save_temp_target_preset(
        &self,
        candidate: &NewTempTarget,
        now: DateTime<Utc>,
    ) -> Result<TempTarget> {
        validate_duration(candidate.duration_min)?;
        validate_target_range(candidate.target_top, candidate.target_bottom)?;
        let preset = self.canonical_temp_target(candidate, now);
        self.db.insert_temp_target_preset(&preset)?;
        Ok(preset)
    }

    pub fn list_temp_target_presets(&self) -> Result<Vec<TempTarget>> {
        self.db.list_temp_target_presets()
    }

    /// Enact a stored preset: re-stamp creation to `now`, append to the
    /// live log, and report upstream. A missing id is not an error; the
    /// preset may have been deleted between selection and application.
    pub fn enact_temp_target_preset(
        &self,
        reporter: &dyn SyncReporter,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<TempTarget>> {
        let Some(mut preset) = self.db.get_temp_target_preset(id)? else {
            return Ok(None);
        };
        preset.created_at = now;
        self.db.append_temp_target(&preset)?;
        reporter.report_temp_target(&preset).ok();
        Ok(Some(preset))
    }

    // --- Override lifecycle ---

    /// Close the enabled override, if any, and report the closure with the
    /// elapsed (not scheduled) duration. Reporter errors are dropped.
    fn close_active_override(
        &self,
        reporter: &dyn SyncReporter,
        now: DateTime<Utc>,
    ) -> Result<Option<Override>> {
        let Some(closed) = self.db.close_latest_override()? else {
            return Ok(None);
        };
        let preset_name = match &closed.preset_id {
            Some(id) => self.db.get_override_preset_name(id)?,
            None => None,
        };
        let label = closed.label(preset_name.as_deref());
        reporter
            .report_override_closed(&label, closed.elapsed_minutes(now), closed.created_at)
            .ok();
        Ok(Some(closed))
    }

    /// Activate a new override from user settings. Any enabled override is
    /// closed (and its closure reported) first, so at most one is enabled
    /// at any instant.
    pub fn save_override(
        &self,
        reporter: &dyn SyncReporter,
        settings: &OverrideSettings,
        now: DateTime<Utc>,
    ) -> Result<Override> {
        validate_percentage(settings.percentage)?;
        validate_duration(settings.duration_min)?;
        if settings.advanced && settings.smb_scheduled_off {
            validate_schedule_window(settings.start_hour, settings.end_hour)?;
        }

        self.close_active_override(reporter, now)?;

        let stored = self.db.insert_override(&Override {
            id: 0,
            created_at: now,
            percentage: settings.percentage,
            indefinite: settings.indefinite,
            duration_min: settings.duration_min,
            target_mgdl: if settings.override_target {
                self.settings.units.to_mgdl(settings.target)
            } else {
                0.0
            },
            smb_off: settings.smb_off,
            advanced: settings.advanced,
            isf_and_cr: !settings.advanced || settings.isf_and_cr,
            isf: if settings.advanced && !settings.isf_and_cr {
                settings.isf
            } else {
                true
            },
            cr: if settings.advanced && !settings.isf_and_cr {
                settings.cr
            } else {
                true
            },
            smb_scheduled_off: settings.advanced && settings.smb_scheduled_off,
            start_hour: if settings.advanced && settings.smb_scheduled_off {
                settings.start_hour
            } else {
                0
            },
            end_hour: if settings.advanced && settings.smb_scheduled_off {
                settings.end_hour
            } else {
                23
            },
            smb_minutes: if settings.advanced {
                settings.smb_minutes
            } else {
                0
            },
            uam_minutes: if settings.advanced {
                settings.uam_minutes
            } else {
                0
            },
            preset_id: None,
            is_preset: false,
            enabled: true,
        })?;

        reporter
            .report_override_started(&stored.label(None), stored.reported_duration(), now)
            .ok();
        Ok(stored)
    }

    /// Persist an immutable override template. Active state is untouched
    /// and nothing is reported; presets are local until applied.
    pub fn save_override_preset(
        &self,
        settings: &OverrideSettings,
        name: &str,
        emoji: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<OverridePreset> {
        validate_percentage(settings.percentage)?;
        validate_duration(settings.duration_min)?;
        if settings.advanced && settings.smb_scheduled_off {
            validate_schedule_window(settings.start_hour, settings.end_hour)?;
        }

        let preset = OverridePreset {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            emoji: emoji.map(ToString::to_string),
            created_at: now,
            percentage: settings.percentage,
            indefinite: settings.indefinite,
            duration_min: settings.duration_min,
            target_mgdl: if settings.override_target {
                self.settings.units.to_mgdl(settings.target)
            } else {
                0.0
            },
            smb_off: settings.smb_off,
            advanced: settings.advanced,
            isf_and_cr: !settings.advanced || settings.isf_and_cr,
            isf: if settings.advanced && !settings.isf_and_cr {
                settings.isf
            } else {
                true
            },
            cr: if settings.advanced && !settings.isf_and_cr {
                settings.cr
            } else {
                true
            },
            smb_scheduled_off: settings.advanced && settings.smb_scheduled_off,
            start_hour: if settings.advanced && settings.smb_scheduled_off {
                settings.start_hour
            } else {
                0
            },
            end_hour: if settings.advanced && settings.smb_scheduled_off {
                settings.end_hour
            } else {
                23
            },
            smb_minutes: if settings.advanced {
                settings.smb_minutes
            } else {
                0
            },
            uam_minutes: if settings.advanced {
                settings.uam_minutes
            } else {
                0
            },
        };
        self.db.insert_override_preset(&preset)?;
        Ok(preset)
    }

    pub fn list_override_presets(&self) -> Result<Vec<OverridePreset>> {
        self.db.list_override_presets()
    }

    /// Activate an override from a stored preset, copying every field
    /// verbatim. A missing preset id is a no-op: no state change, no
    /// report, no error — the preset may have been deleted between
    /// selection and application.
    pub fn apply_override_preset(
        &self,
        reporter: &dyn SyncReporter,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Override>> {
        let Some(preset) = self.db.get_override_preset(id)? else {
            return Ok(None);
        };

        self.close_active_override(reporter, now)?;

        let stored = self.db.insert_override(&Override {
            id: 0,
            created_at: now,
            percentage: preset.percentage,
            indefinite: preset.indefinite,
            duration_min: preset.duration_min,
            target_mgdl: preset.target_mgdl,
            smb_off: preset.smb_off,
            advanced: preset.advanced,
            isf_and_cr: preset.isf_and_cr,
            isf: preset.isf,
            cr: preset.cr,
            smb_scheduled_off: preset.smb_scheduled_off,
            start_hour: preset.start_hour,
            end_hour: preset.end_hour,
            smb_minutes: preset.smb_minutes,
            uam_minutes: preset.uam_minutes,
            preset_id: Some(preset.id.clone()),
            is_preset: true,
            enabled: true,
        })?;

        reporter
            .report_override_started(&preset.name, stored.reported_duration(), now)
            .ok();
        Ok(Some(stored))
    }

    /// Reconciliation query: the override state as of `now`, with the
    /// target converted into the display unit. Natural expiry is computed
    /// here and reflected in the view, but nothing is written — the stored
    /// enabled flag may stay stale true until the next explicit cancel or
    /// save.
    pub fn restore_active_state(&self, now: DateTime<Utc>) -> Result<OverrideView> {
        let Some(latest) = self.db.latest_override()? else {
            return Ok(OverrideView::inactive(&self.settings));
        };
        if !latest.enabled || latest.is_expired_at(now) {
            return Ok(OverrideView::inactive(&self.settings));
        }

        Ok(OverrideView {
            enabled: true,
            percentage: latest.percentage,
            indefinite: latest.indefinite,
            duration_min: if latest.indefinite {
                0
            } else {
                latest.remaining_minutes(now)
            },
            target: if latest.target_mgdl > 0.0 {
                Some(self.settings.units.from_mgdl(latest.target_mgdl))
            } else {
                None
            },
            smb_off: latest.smb_off,
            advanced: latest.advanced,
            isf_and_cr: latest.isf_and_cr,
            isf: latest.isf,
            cr: latest.cr,
            smb_scheduled_off: latest.smb_scheduled_off,
            start_hour: latest.start_hour,
            end_hour: latest.end_hour,
            smb_minutes: if latest.advanced {
                latest.smb_minutes
            } else {
                self.settings.default_smb_minutes
            },
            uam_minutes: if latest.advanced {
                latest.uam_minutes
            } else {
                self.settings.default_uam_minutes
            },
            preset_id: latest.preset_id,
        })
    }

    /// Explicit cancel: close the enabled override if there is one, report
    /// its closure, and return the reset view.
    pub fn cancel_override(
        &self,
        reporter: &dyn SyncReporter,
        now: DateTime<Utc>,
    ) -> Result<OverrideView> {
        self.close_active_override(reporter, now)?;
        Ok(OverrideView::inactive(&self.settings))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GlucoseUnit, TEMP_TARGET_CANCEL};
    use chrono::{Duration, TimeZone};
    use std::sync::Mutex;

    fn at(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap() + Duration::minutes(minute)
    }

    #[derive(Default)]
    struct MockReporter {
        targets: Mutex<Vec<TempTarget>>,
        started: Mutex<Vec<(String, i64, DateTime<Utc>)>>,
        closed: Mutex<Vec<(String, i64, DateTime<Utc>)>>,
        fail: bool,
    }

    impl SyncReporter for MockReporter {
        fn report_temp_target(&self, target: &TempTarget) -> Result<()> {
            if self.fail {
                anyhow::bail!("network down");
            }
            self.targets.lock().unwrap().push(target.clone());
            Ok(())
        }

        fn report_override_started(
            &self,
            label: &str,
            duration_min: i64,
            started_at: DateTime<Utc>,
        ) -> Result<()> {
            if self.fail {
                anyhow::bail!("network down");
            }
            self.started
                .lock()
                .unwrap()
                .push((label.to_string(), duration_min, started_at));
            Ok(())
        }

        fn report_override_closed(
            &self,
            label: &str,
            duration_min: i64,
            started_at: DateTime<Utc>,
        ) -> Result<()> {
            if self.fail {
                anyhow::bail!("network down");
            }
            self.closed
                .lock()
                .unwrap()
                .push((label.to_string(), duration_min, started_at));
            Ok(())
        }
    }

    fn svc() -> TherapyService {
        TherapyService::new_in_memory(TherapySettings::default()).unwrap()
    }

    fn candidate(top: f64, bottom: f64, duration_min: i64) -> NewTempTarget {
        NewTempTarget {
            name: None,
            target_top: Some(top),
            target_bottom: Some(bottom),
            duration_min,
            unit: Some(GlucoseUnit::MgDl),
            reason: None,
            low_carb: None,
            medium_carb: None,
            high_carb: None,
        }
    }

    #[test]
    fn test_enact_then_active_window() {
        let svc = svc();
        let reporter = MockReporter::default();
        let tt = svc
            .enact_temp_target(&reporter, &candidate(100.0, 100.0, 60), at(0))
            .unwrap();
        assert_eq!(tt.created_at, at(0));
        assert_eq!(tt.entered_by.as_deref(), Some(TEMP_TARGET_MANUAL));

        let active = svc.active_temp_target(at(30)).unwrap().unwrap();
        assert_eq!(active.target_top, Some(100.0));
        assert!(svc.active_temp_target(at(61)).unwrap().is_none());
        assert!(svc.active_temp_target(at(60)).unwrap().is_none());
    }

    #[test]
    fn test_enact_reports_stored_record() {
        let svc = svc();
        let reporter = MockReporter::default();
        let mut c = candidate(5.55, 5.55, 30);
        c.unit = Some(GlucoseUnit::MmolL);
        svc.enact_temp_target(&reporter, &c, at(0)).unwrap();

        let reported = reporter.targets.lock().unwrap();
        assert_eq!(reported.len(), 1);
        // What goes upstream is the canonical stored record
        assert!((reported[0].target_top.unwrap() - 100.0).abs() < 0.01);
        assert_eq!(reported[0].duration_min, 30);
        assert_eq!(reported[0].created_at, at(0));
    }

    #[test]
    fn test_enact_converts_caller_unit_to_canonical() {
        let svc = svc(); // display unit mg/dL
        let reporter = MockReporter::default();
        let mut c = candidate(5.55, 5.55, 30);
        c.unit = Some(GlucoseUnit::MmolL);
        let tt = svc.enact_temp_target(&reporter, &c, at(0)).unwrap();
        assert!((tt.target_top.unwrap() - 100.0).abs() < 0.01);
        assert!((tt.target_bottom.unwrap() - 100.0).abs() < 0.01);
    }

    #[test]
    fn test_enact_defaults_to_settings_unit() {
        let settings = TherapySettings {
            units: GlucoseUnit::MmolL,
            ..TherapySettings::default()
        };
        let svc = TherapyService::new_in_memory(settings).unwrap();
        let reporter = MockReporter::default();
        let mut c = candidate(5.55, 5.55, 30);
        c.unit = None;
        let tt = svc.enact_temp_target(&reporter, &c, at(0)).unwrap();
        assert!((tt.target_top.unwrap() - 100.0).abs() < 0.01);
    }

    #[test]
    fn test_enact_rejects_absurd_duration() {
        let svc = svc();
        let reporter = MockReporter::default();
        let c = candidate(100.0, 100.0, i64::MAX);
        assert!(svc.enact_temp_target(&reporter, &c, at(0)).is_err());
        // Nothing stored, nothing reported
        assert!(svc.recent_temp_targets(10).unwrap().is_empty());
        assert!(reporter.targets.lock().unwrap().is_empty());
    }

    #[test]
    fn test_cancel_ends_target_for_all_later_times() {
        let svc = svc();
        let reporter = MockReporter::default();
        svc.enact_temp_target(&reporter, &candidate(100.0, 100.0, 60), at(0))
            .unwrap();
        assert!(svc.active_temp_target(at(10)).unwrap().is_some());

        let marker = svc.cancel_temp_target(&reporter, at(10)).unwrap();
        assert_eq!(marker.name.as_deref(), Some(TEMP_TARGET_CANCEL));

        assert!(svc.active_temp_target(at(10)).unwrap().is_none());
        assert!(svc.active_temp_target(at(30)).unwrap().is_none());
        assert!(svc.active_temp_target(at(10_000)).unwrap().is_none());

        // Both the target and its cancellation went upstream
        let reported = reporter.targets.lock().unwrap();
        assert_eq!(reported.len(), 2);
        assert!(reported[1].is_cancel());
        assert_eq!(reported[1].duration_min, 0);
    }

    #[test]
    fn test_zero_duration_immediately_inactive() {
        let svc = svc();
        let reporter = MockReporter::default();
        svc.enact_temp_target(&reporter, &candidate(100.0, 100.0, 0), at(0))
            .unwrap();
        assert!(svc.active_temp_target(at(0)).unwrap().is_none());
    }

    #[test]
    fn test_enact_appends_never_mutates() {
        let svc = svc();
        let reporter = MockReporter::default();
        svc.enact_temp_target(&reporter, &candidate(100.0, 100.0, 60), at(0))
            .unwrap();
        svc.cancel_temp_target(&reporter, at(5)).unwrap();
        svc.enact_temp_target(&reporter, &candidate(120.0, 110.0, 30), at(10))
            .unwrap();

        let log = svc.recent_temp_targets(10).unwrap();
        assert_eq!(log.len(), 3);
        // Oldest entry still intact
        assert_eq!(log[2].target_top, Some(100.0));
        assert_eq!(log[2].duration_min, 60);
    }

    #[test]
    fn test_temp_target_report_failure_keeps_local_state() {
        let svc = svc();
        let failing = MockReporter {
            fail: true,
            ..MockReporter::default()
        };
        let tt = svc
            .enact_temp_target(&failing, &candidate(100.0, 100.0, 60), at(0))
            .unwrap();
        assert_eq!(tt.duration_min, 60);
        assert!(svc.active_temp_target(at(10)).unwrap().is_some());

        svc.cancel_temp_target(&failing, at(20)).unwrap();
        assert!(svc.active_temp_target(at(20)).unwrap().is_none());
    }

    #[test]
    fn test_temp_target_preset_enact_restamps() {
        let svc = svc();
        let reporter = MockReporter::default();
        let mut c = candidate(130.0, 120.0, 45);
        c.name = Some("Exercise".to_string());
        let preset = svc.save_temp_target_preset(&c, at(0)).unwrap();

        // Saving a preset does not activate or report anything
        assert!(svc.active_temp_target(at(1)).unwrap().is_none());
        assert!(reporter.targets.lock().unwrap().is_empty());

        let enacted = svc
            .enact_temp_target_preset(&reporter, &preset.id, at(20))
            .unwrap()
            .unwrap();
        assert_eq!(enacted.created_at, at(20));
        assert_eq!(enacted.name.as_deref(), Some("Exercise"));
        assert!(svc.active_temp_target(at(30)).unwrap().is_some());
        assert!(svc.active_temp_target(at(70)).unwrap().is_none());

        let reported = reporter.targets.lock().unwrap();
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].created_at, at(20));
    }

    #[test]
    fn test_temp_target_preset_miss_is_noop() {
        let svc = svc();
        let reporter = MockReporter::default();
        assert!(svc
            .enact_temp_target_preset(&reporter, "missing", at(0))
            .unwrap()
            .is_none());
        assert!(svc.active_temp_target(at(0)).unwrap().is_none());
        assert!(reporter.targets.lock().unwrap().is_empty());
    }

    fn settings_80_for_120() -> OverrideSettings {
        OverrideSettings {
            percentage: 80.0,
            indefinite: false,
            duration_min: 120,
            ..OverrideSettings::default()
        }
    }

    #[test]
    fn test_save_override_reports_activation() {
        let svc = svc();
        let reporter = MockReporter::default();

        let ov = svc.save_override(&reporter, &settings_80_for_120(), at(0)).unwrap();
        assert!(ov.enabled);
        assert!(!ov.is_preset);

        let started = reporter.started.lock().unwrap();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0], ("80 %".to_string(), 120, at(0)));
        assert!(reporter.closed.lock().unwrap().is_empty());
    }

    #[test]
    fn test_save_indefinite_reports_fixed_long_duration() {
        let svc = svc();
        let reporter = MockReporter::default();
        let settings = OverrideSettings {
            percentage: 110.0,
            indefinite: true,
            duration_min: 0,
            ..OverrideSettings::default()
        };
        svc.save_override(&reporter, &settings, at(0)).unwrap();

        let started = reporter.started.lock().unwrap();
        assert_eq!(started[0].1, 2880);
    }

    #[test]
    fn test_save_closes_prior_with_elapsed_duration() {
        let svc = svc();
        let reporter = MockReporter::default();

        svc.save_override(&reporter, &settings_80_for_120(), at(0)).unwrap();
        let second = OverrideSettings {
            percentage: 120.0,
            indefinite: false,
            duration_min: 60,
            ..OverrideSettings::default()
        };
        svc.save_override(&reporter, &second, at(10)).unwrap();

        let closed = reporter.closed.lock().unwrap();
        assert_eq!(closed.len(), 1);
        // Elapsed 10 minutes, not the scheduled 120
        assert_eq!(closed[0], ("80 %".to_string(), 10, at(0)));

        let started = reporter.started.lock().unwrap();
        assert_eq!(started.len(), 2);
        assert_eq!(started[1], ("120 %".to_string(), 60, at(10)));
    }

    #[test]
    fn test_at_most_one_enabled_override() {
        let svc = svc();
        let reporter = MockReporter::default();

        svc.save_override(&reporter, &settings_80_for_120(), at(0)).unwrap();
        svc.save_override(&reporter, &settings_80_for_120(), at(5)).unwrap();
        svc.save_override(&reporter, &settings_80_for_120(), at(10)).unwrap();

        // Each save closed exactly one prior override
        assert_eq!(reporter.closed.lock().unwrap().len(), 2);
        let view = svc.restore_active_state(at(11)).unwrap();
        assert!(view.enabled);
    }

    #[test]
    fn test_save_with_target_canonicalizes_only_when_requested() {
        let settings = TherapySettings {
            units: GlucoseUnit::MmolL,
            ..TherapySettings::default()
        };
        let svc = TherapyService::new_in_memory(settings).unwrap();
        let reporter = MockReporter::default();

        let with_target = OverrideSettings {
            percentage: 90.0,
            override_target: true,
            target: 5.55, // display units, mmol/L
            indefinite: false,
            duration_min: 60,
            ..OverrideSettings::default()
        };
        let ov = svc.save_override(&reporter, &with_target, at(0)).unwrap();
        assert!((ov.target_mgdl - 100.0).abs() < 0.01);

        let without_target = OverrideSettings {
            percentage: 90.0,
            override_target: false,
            target: 5.55,
            indefinite: false,
            duration_min: 60,
            ..OverrideSettings::default()
        };
        let ov = svc.save_override(&reporter, &without_target, at(1)).unwrap();
        assert!((ov.target_mgdl - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_advanced_subsettings_persist_only_when_toggled() {
        let svc = svc();
        let reporter = MockReporter::default();

        let settings = OverrideSettings {
            percentage: 80.0,
            indefinite: false,
            duration_min: 60,
            advanced: false,
            // Set but ignored without the advanced toggle
            smb_scheduled_off: true,
            start_hour: 22,
            end_hour: 6,
            smb_minutes: 90,
            uam_minutes: 90,
            ..OverrideSettings::default()
        };
        let ov = svc.save_override(&reporter, &settings, at(0)).unwrap();
        assert!(!ov.advanced);
        assert!(!ov.smb_scheduled_off);
        assert_eq!(ov.smb_minutes, 0);
        assert_eq!(ov.uam_minutes, 0);

        let advanced = OverrideSettings {
            advanced: true,
            isf_and_cr: false,
            isf: true,
            cr: false,
            ..settings
        };
        let ov = svc.save_override(&reporter, &advanced, at(1)).unwrap();
        assert!(ov.advanced);
        assert!(ov.smb_scheduled_off);
        assert_eq!(ov.start_hour, 22);
        assert_eq!(ov.end_hour, 6);
        assert_eq!(ov.smb_minutes, 90);
        assert!(!ov.isf_and_cr);
        assert!(ov.isf);
        assert!(!ov.cr);
    }

    #[test]
    fn test_apply_preset_full_scenario() {
        let svc = svc();
        let reporter = MockReporter::default();

        // Save 80% for 120 min at t=0
        svc.save_override(&reporter, &settings_80_for_120(), at(0)).unwrap();

        // Create a preset and apply it at t=10
        let preset_settings = OverrideSettings {
            percentage: 120.0,
            indefinite: false,
            duration_min: 90,
            ..OverrideSettings::default()
        };
        let preset = svc
            .save_override_preset(&preset_settings, "Sport", Some("🏃"), at(0))
            .unwrap();
        // Saving the preset reported nothing
        assert_eq!(reporter.started.lock().unwrap().len(), 1);

        let applied = svc
            .apply_override_preset(&reporter, &preset.id, at(10))
            .unwrap()
            .unwrap();
        assert!(applied.is_preset);
        assert_eq!(applied.preset_id.as_deref(), Some(preset.id.as_str()));

        let closed = reporter.closed.lock().unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0], ("80 %".to_string(), 10, at(0)));

        let started = reporter.started.lock().unwrap();
        assert_eq!(started.len(), 2);
        assert_eq!(started[1], ("Sport".to_string(), 90, at(10)));
    }

    #[test]
    fn test_apply_preset_closure_label_uses_prior_preset_name() {
        let svc = svc();
        let reporter = MockReporter::default();

        let a = svc
            .save_override_preset(&settings_80_for_120(), "Night", None, at(0))
            .unwrap();
        let b = svc
            .save_override_preset(&settings_80_for_120(), "Sport", None, at(0))
            .unwrap();

        svc.apply_override_preset(&reporter, &a.id, at(0)).unwrap();
        svc.apply_override_preset(&reporter, &b.id, at(15)).unwrap();

        let closed = reporter.closed.lock().unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0], ("Night".to_string(), 15, at(0)));
    }

    #[test]
    fn test_apply_preset_idempotent_on_target_state() {
        let svc = svc();
        let reporter = MockReporter::default();
        let preset = svc
            .save_override_preset(
                &OverrideSettings {
                    percentage: 120.0,
                    indefinite: false,
                    duration_min: 90,
                    override_target: true,
                    target: 140.0,
                    smb_off: true,
                    ..OverrideSettings::default()
                },
                "Sport",
                None,
                at(0),
            )
            .unwrap();

        let first = svc
            .apply_override_preset(&reporter, &preset.id, at(0))
            .unwrap()
            .unwrap();
        let second = svc
            .apply_override_preset(&reporter, &preset.id, at(5))
            .unwrap()
            .unwrap();

        assert_eq!(first.percentage, second.percentage);
        assert_eq!(first.duration_min, second.duration_min);
        assert_eq!(first.target_mgdl, second.target_mgdl);
        assert_eq!(first.smb_off, second.smb_off);
        assert_eq!(first.preset_id, second.preset_id);
        assert_ne!(first.created_at, second.created_at);
        // Two activations, one closure
        assert_eq!(reporter.started.lock().unwrap().len(), 2);
        assert_eq!(reporter.closed.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_apply_unknown_preset_is_noop() {
        let svc = svc();
        let reporter = MockReporter::default();
        svc.save_override(&reporter, &settings_80_for_120(), at(0)).unwrap();

        let result = svc.apply_override_preset(&reporter, "missing", at(10)).unwrap();
        assert!(result.is_none());

        // Prior override untouched, nothing reported beyond the first save
        assert_eq!(reporter.started.lock().unwrap().len(), 1);
        assert!(reporter.closed.lock().unwrap().is_empty());
        assert!(svc.restore_active_state(at(11)).unwrap().enabled);
    }

    #[test]
    fn test_restore_active_state_remaining_and_target_conversion() {
        let settings = TherapySettings {
            units: GlucoseUnit::MmolL,
            ..TherapySettings::default()
        };
        let svc = TherapyService::new_in_memory(settings).unwrap();
        let reporter = MockReporter::default();
        svc.save_override(
            &reporter,
            &OverrideSettings {
                percentage: 80.0,
                indefinite: false,
                duration_min: 120,
                override_target: true,
                target: 5.55,
                ..OverrideSettings::default()
            },
            at(0),
        )
        .unwrap();

        let view = svc.restore_active_state(at(30)).unwrap();
        assert!(view.enabled);
        assert_eq!(view.duration_min, 90);
        assert!((view.target.unwrap() - 5.55).abs() < 0.01);
    }

    #[test]
    fn test_restore_inactive_when_nothing_saved() {
        let svc = svc();
        let view = svc.restore_active_state(at(0)).unwrap();
        assert!(!view.enabled);
        assert!((view.percentage - 100.0).abs() < f64::EPSILON);
        assert_eq!(view.smb_minutes, 30);
        assert_eq!(view.uam_minutes, 30);
    }

    #[test]
    fn test_expiry_is_lazy_and_writes_nothing() {
        let svc = svc();
        let reporter = MockReporter::default();
        svc.save_override(&reporter, &settings_80_for_120(), at(0)).unwrap();

        // Expired at read time
        let view = svc.restore_active_state(at(121)).unwrap();
        assert!(!view.enabled);

        // The stored flag stays stale true; the next cancel still closes
        // it and reports the full elapsed time.
        let view = svc.cancel_override(&reporter, at(130)).unwrap();
        assert!(!view.enabled);
        let closed = reporter.closed.lock().unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0], ("80 %".to_string(), 130, at(0)));
    }

    #[test]
    fn test_indefinite_override_survives_restore_forever() {
        let svc = svc();
        let reporter = MockReporter::default();
        svc.save_override(
            &reporter,
            &OverrideSettings {
                percentage: 110.0,
                indefinite: true,
                duration_min: 0,
                ..OverrideSettings::default()
            },
            at(0),
        )
        .unwrap();

        let view = svc.restore_active_state(at(100_000)).unwrap();
        assert!(view.enabled);
        assert!(view.indefinite);
        assert_eq!(view.duration_min, 0);
    }

    #[test]
    fn test_cancel_without_active_override_reports_nothing() {
        let svc = svc();
        let reporter = MockReporter::default();
        let view = svc.cancel_override(&reporter, at(0)).unwrap();
        assert!(!view.enabled);
        assert!(reporter.closed.lock().unwrap().is_empty());
    }

    #[test]
    fn test_reporter_failure_never_rolls_back_local_state() {
        let svc = svc();
        let failing = MockReporter {
            fail: true,
            ..MockReporter::default()
        };

        let ov = svc.save_override(&failing, &settings_80_for_120(), at(0)).unwrap();
        assert!(ov.enabled);
        assert!(svc.restore_active_state(at(1)).unwrap().enabled);

        let view = svc.cancel_override(&failing, at(10)).unwrap();
        assert!(!view.enabled);
        assert!(!svc.restore_active_state(at(11)).unwrap().enabled);
    }

    #[test]
    fn test_neutral_percentage_closure_label_is_custom() {
        let svc = svc();
        let reporter = MockReporter::default();
        svc.save_override(
            &reporter,
            &OverrideSettings {
                percentage: 100.0,
                indefinite: false,
                duration_min: 60,
                smb_off: true,
                ..OverrideSettings::default()
            },
            at(0),
        )
        .unwrap();
        svc.cancel_override(&reporter, at(20)).unwrap();

        assert_eq!(reporter.started.lock().unwrap()[0].0, "Custom");
        assert_eq!(reporter.closed.lock().unwrap()[0].0, "Custom");
    }
}
