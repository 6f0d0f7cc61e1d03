use anyhow::{Result, bail};
use chrono::Utc;
use clap::Args;

use loopctl_core::models::{GlucoseUnit, NewTempTarget, TempTarget};
use loopctl_core::service::{SyncReporter, TherapyService};

use super::helpers::{
    fmt_range, print_temp_target_preset_table, print_temp_target_table, resolve_preset_key,
};

#[derive(Args)]
pub(crate) struct TargetArgs {
    /// Top of the target range
    pub top: f64,
    /// Bottom of the target range (defaults to the top value)
    pub bottom: Option<f64>,
    /// Duration in minutes
    #[arg(short, long)]
    pub duration: i64,
    /// Name shown in history and remote reports
    #[arg(long)]
    pub name: Option<String>,
    /// Free-form reason
    #[arg(long)]
    pub reason: Option<String>,
    /// Unit of the given values: mgdl or mmoll (default: configured unit)
    #[arg(long)]
    pub unit: Option<String>,
    /// Tag as a low-carb profile
    #[arg(long)]
    pub low_carb: bool,
    /// Tag as a medium-carb profile
    #[arg(long)]
    pub medium_carb: bool,
    /// Tag as a high-carb profile
    #[arg(long)]
    pub high_carb: bool,
}

impl TargetArgs {
    fn to_candidate(&self) -> Result<NewTempTarget> {
        let unit = self.unit.as_deref().map(GlucoseUnit::parse).transpose()?;
        Ok(NewTempTarget {
            name: self.name.clone(),
            target_top: Some(self.top),
            target_bottom: Some(self.bottom.unwrap_or(self.top)),
            duration_min: self.duration,
            unit,
            reason: self.reason.clone(),
            low_carb: self.low_carb.then_some(true),
            medium_carb: self.medium_carb.then_some(true),
            high_carb: self.high_carb.then_some(true),
        })
    }
}

fn print_enacted(tt: &TempTarget, unit: GlucoseUnit) {
    println!(
        "Temp target {} ({}) for {} min",
        tt.display_name(),
        fmt_range(tt.target_top, tt.target_bottom, unit),
        tt.duration_min
    );
}

pub(crate) fn cmd_target_set(
    svc: &TherapyService,
    reporter: &dyn SyncReporter,
    args: &TargetArgs,
    json: bool,
) -> Result<()> {
    let candidate = args.to_candidate()?;
    let tt = svc.enact_temp_target(reporter, &candidate, Utc::now())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&tt)?);
    } else {
        print_enacted(&tt, svc.settings().units);
    }
    Ok(())
}

pub(crate) fn cmd_target_cancel(
    svc: &TherapyService,
    reporter: &dyn SyncReporter,
    json: bool,
) -> Result<()> {
    let marker = svc.cancel_temp_target(reporter, Utc::now())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&marker)?);
    } else {
        println!("Temp target cancelled");
    }
    Ok(())
}

pub(crate) fn cmd_target_show(svc: &TherapyService, json: bool) -> Result<()> {
    let now = Utc::now();
    let active = svc.active_temp_target(now)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&active)?);
        return Ok(());
    }

    match active {
        Some(tt) => {
            let remaining =
                (tt.created_at + chrono::Duration::minutes(tt.duration_min) - now).num_minutes();
            println!(
                "Temp target {} ({}), {remaining} min remaining",
                tt.display_name(),
                fmt_range(tt.target_top, tt.target_bottom, svc.settings().units),
            );
        }
        None => eprintln!("No active temp target"),
    }
    Ok(())
}

pub(crate) fn cmd_target_history(svc: &TherapyService, limit: i64, json: bool) -> Result<()> {
    let targets = svc.recent_temp_targets(limit)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&targets)?);
    } else if targets.is_empty() {
        eprintln!("No temp targets recorded");
    } else {
        print_temp_target_table(&targets, svc.settings().units);
    }
    Ok(())
}

pub(crate) fn cmd_target_preset_save(
    svc: &TherapyService,
    args: &TargetArgs,
    json: bool,
) -> Result<()> {
    if args.name.is_none() {
        bail!("Presets need a --name");
    }
    let candidate = args.to_candidate()?;
    let preset = svc.save_temp_target_preset(&candidate, Utc::now())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&preset)?);
    } else {
        println!("Saved temp target preset {} ({})", preset.display_name(), preset.id);
    }
    Ok(())
}

pub(crate) fn cmd_target_preset_list(svc: &TherapyService, json: bool) -> Result<()> {
    let presets = svc.list_temp_target_presets()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&presets)?);
    } else if presets.is_empty() {
        eprintln!("No temp target presets. Use `loopctl target preset save` to add one.");
    } else {
        print_temp_target_preset_table(&presets, svc.settings().units);
    }
    Ok(())
}

pub(crate) fn cmd_target_preset_apply(
    svc: &TherapyService,
    reporter: &dyn SyncReporter,
    key: &str,
    json: bool,
) -> Result<()> {
    let presets = svc.list_temp_target_presets()?;
    let pairs: Vec<(String, String)> = presets
        .iter()
        .map(|p| (p.id.clone(), p.display_name().to_string()))
        .collect();
    let id = resolve_preset_key(key, &pairs)?;

    let Some(tt) = svc.enact_temp_target_preset(reporter, &id, Utc::now())? else {
        bail!("No preset found with id '{id}'");
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&tt)?);
    } else {
        print_enacted(&tt, svc.settings().units);
    }
    Ok(())
}
