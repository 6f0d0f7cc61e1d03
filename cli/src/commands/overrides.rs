use anyhow::{Result, bail};
use chrono::Utc;
use clap::Args;

use loopctl_core::models::{Override, OverrideSettings, OverrideView};
use loopctl_core::service::{SyncReporter, TherapyService};

use super::helpers::{fmt_duration, fmt_glucose, print_override_preset_table, resolve_preset_key};

#[derive(Args)]
pub(crate) struct OverrideArgs {
    /// Insulin percentage, 10-200 (100 leaves dosing unchanged)
    pub percentage: f64,
    /// Duration in minutes (omit for an indefinite override)
    #[arg(short, long)]
    pub duration: Option<i64>,
    /// Override the glucose target, in the configured display unit
    #[arg(long)]
    pub target: Option<f64>,
    /// Disable SMBs for the whole override
    #[arg(long)]
    pub smb_off: bool,
    /// Enable the advanced sub-settings
    #[arg(long)]
    pub advanced: bool,
    /// Do not scale ISF (implies --advanced)
    #[arg(long)]
    pub no_isf: bool,
    /// Do not scale CR (implies --advanced)
    #[arg(long)]
    pub no_cr: bool,
    /// Disable SMBs from this hour (0-23; implies --advanced)
    #[arg(long, value_name = "HOUR")]
    pub smb_off_start: Option<i64>,
    /// Disable SMBs until this hour (0-23; implies --advanced)
    #[arg(long, value_name = "HOUR")]
    pub smb_off_end: Option<i64>,
    /// Cap on SMB minutes (implies --advanced)
    #[arg(long)]
    pub smb_minutes: Option<i64>,
    /// Cap on UAM SMB minutes (implies --advanced)
    #[arg(long)]
    pub uam_minutes: Option<i64>,
}

impl OverrideArgs {
    fn to_settings(&self) -> Result<OverrideSettings> {
        if self.smb_off_start.is_some() != self.smb_off_end.is_some() {
            bail!("--smb-off-start and --smb-off-end must be given together");
        }
        let scheduled = self.smb_off_start.is_some();
        let advanced = self.advanced
            || self.no_isf
            || self.no_cr
            || scheduled
            || self.smb_minutes.is_some()
            || self.uam_minutes.is_some();

        Ok(OverrideSettings {
            percentage: self.percentage,
            indefinite: self.duration.is_none(),
            duration_min: self.duration.unwrap_or(0),
            override_target: self.target.is_some(),
            target: self.target.unwrap_or(0.0),
            smb_off: self.smb_off,
            advanced,
            isf_and_cr: !(self.no_isf || self.no_cr),
            isf: !self.no_isf,
            cr: !self.no_cr,
            smb_scheduled_off: scheduled,
            start_hour: self.smb_off_start.unwrap_or(0),
            end_hour: self.smb_off_end.unwrap_or(23),
            smb_minutes: self.smb_minutes.unwrap_or(0),
            uam_minutes: self.uam_minutes.unwrap_or(0),
        })
    }
}

fn print_activated(svc: &TherapyService, ov: &Override, label: &str) {
    println!(
        "Override {label} active for {}",
        fmt_duration(ov.indefinite, ov.duration_min)
    );
    if ov.target_mgdl > 0.0 {
        let units = svc.settings().units;
        println!("Target: {}", fmt_glucose(units.from_mgdl(ov.target_mgdl), units));
    }
    if ov.smb_off {
        println!("SMBs disabled");
    }
}

pub(crate) fn cmd_override_set(
    svc: &TherapyService,
    reporter: &dyn SyncReporter,
    args: &OverrideArgs,
    json: bool,
) -> Result<()> {
    let settings = args.to_settings()?;
    let ov = svc.save_override(reporter, &settings, Utc::now())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&ov)?);
    } else {
        print_activated(svc, &ov, &ov.label(None));
    }
    Ok(())
}

pub(crate) fn cmd_override_cancel(
    svc: &TherapyService,
    reporter: &dyn SyncReporter,
    json: bool,
) -> Result<()> {
    let view = svc.cancel_override(reporter, Utc::now())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
    } else {
        println!("Override cancelled");
    }
    Ok(())
}

fn print_view(svc: &TherapyService, view: &OverrideView) {
    if !view.enabled {
        eprintln!("No active override");
        return;
    }
    let pct = view.percentage;
    println!(
        "Override {pct:.0} % active, {}",
        if view.indefinite {
            "indefinite".to_string()
        } else {
            format!("{} min remaining", view.duration_min)
        }
    );
    if let Some(target) = view.target {
        println!("Target: {}", fmt_glucose(target, svc.settings().units));
    }
    if view.smb_off {
        println!("SMBs disabled");
    }
    if view.smb_scheduled_off {
        println!(
            "SMBs disabled between {:02}:00 and {:02}:00",
            view.start_hour, view.end_hour
        );
    }
}

pub(crate) fn cmd_override_show(svc: &TherapyService, json: bool) -> Result<()> {
    let view = svc.restore_active_state(Utc::now())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
    } else {
        print_view(svc, &view);
    }
    Ok(())
}

pub(crate) fn cmd_override_preset_save(
    svc: &TherapyService,
    name: &str,
    emoji: Option<&str>,
    args: &OverrideArgs,
    json: bool,
) -> Result<()> {
    let settings = args.to_settings()?;
    let preset = svc.save_override_preset(&settings, name, emoji, Utc::now())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&preset)?);
    } else {
        println!("Saved override preset {} ({})", preset.name, preset.id);
    }
    Ok(())
}

pub(crate) fn cmd_override_preset_list(svc: &TherapyService, json: bool) -> Result<()> {
    let presets = svc.list_override_presets()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&presets)?);
    } else if presets.is_empty() {
        eprintln!("No override presets. Use `loopctl override preset save` to add one.");
    } else {
        print_override_preset_table(&presets, svc.settings().units);
    }
    Ok(())
}

pub(crate) fn cmd_override_preset_apply(
    svc: &TherapyService,
    reporter: &dyn SyncReporter,
    key: &str,
    json: bool,
) -> Result<()> {
    let presets = svc.list_override_presets()?;
    let pairs: Vec<(String, String)> = presets
        .iter()
        .map(|p| (p.id.clone(), p.name.clone()))
        .collect();
    let id = resolve_preset_key(key, &pairs)?;
    let name = presets
        .iter()
        .find(|p| p.id == id)
        .map(|p| p.name.clone())
        .unwrap_or_default();

    let Some(ov) = svc.apply_override_preset(reporter, &id, Utc::now())? else {
        bail!("No preset found with id '{id}'");
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&ov)?);
    } else {
        print_activated(svc, &ov, &name);
    }
    Ok(())
}
