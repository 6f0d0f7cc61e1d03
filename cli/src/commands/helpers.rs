use anyhow::{Result, bail};
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use loopctl_core::models::{GlucoseUnit, OverridePreset, TempTarget};

/// Format a glucose value already expressed in `unit` for display.
/// mg/dL values are whole numbers; mmol/L gets one decimal.
pub(crate) fn fmt_glucose(value: f64, unit: GlucoseUnit) -> String {
    match unit {
        GlucoseUnit::MgDl => format!("{value:.0} {}", unit.as_str()),
        GlucoseUnit::MmolL => format!("{value:.1} {}", unit.as_str()),
    }
}

pub(crate) fn fmt_duration(indefinite: bool, minutes: i64) -> String {
    if indefinite {
        "indefinite".to_string()
    } else {
        format!("{minutes} min")
    }
}

pub(crate) fn fmt_range(top: Option<f64>, bottom: Option<f64>, unit: GlucoseUnit) -> String {
    match (bottom.map(|v| unit.from_mgdl(v)), top.map(|v| unit.from_mgdl(v))) {
        (Some(b), Some(t)) if (t - b).abs() > f64::EPSILON => {
            format!("{}-{}", fmt_glucose(b, unit), fmt_glucose(t, unit))
        }
        (_, Some(t)) => fmt_glucose(t, unit),
        (Some(b), None) => fmt_glucose(b, unit),
        (None, None) => "-".to_string(),
    }
}

/// Resolve a user-supplied preset key against `(id, name)` pairs. An exact
/// id match wins; otherwise the name must match exactly one preset.
pub(crate) fn resolve_preset_key(key: &str, presets: &[(String, String)]) -> Result<String> {
    if let Some((id, _)) = presets.iter().find(|(id, _)| id == key) {
        return Ok(id.clone());
    }
    let by_name: Vec<&(String, String)> =
        presets.iter().filter(|(_, name)| name == key).collect();
    match by_name.len() {
        0 => bail!("No preset found with id or name '{key}'"),
        1 => Ok(by_name[0].0.clone()),
        _ => bail!("Preset name '{key}' is ambiguous; use the id instead"),
    }
}

pub(crate) fn print_temp_target_table(targets: &[TempTarget], unit: GlucoseUnit) {
    #[derive(Tabled)]
    struct TargetRow {
        #[tabled(rename = "When")]
        when: String,
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Target")]
        target: String,
        #[tabled(rename = "Duration")]
        duration: String,
    }

    let rows: Vec<TargetRow> = targets
        .iter()
        .map(|tt| TargetRow {
            when: tt.created_at.format("%Y-%m-%d %H:%M").to_string(),
            name: tt.display_name().to_string(),
            target: if tt.is_cancel() {
                "-".to_string()
            } else {
                fmt_range(tt.target_top, tt.target_bottom, unit)
            },
            duration: format!("{} min", tt.duration_min),
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(3..4)).with(Alignment::right()))
        .to_string();
    println!("{table}");
}

pub(crate) fn print_temp_target_preset_table(presets: &[TempTarget], unit: GlucoseUnit) {
    #[derive(Tabled)]
    struct PresetRow {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Target")]
        target: String,
        #[tabled(rename = "Duration")]
        duration: String,
    }

    let rows: Vec<PresetRow> = presets
        .iter()
        .map(|p| PresetRow {
            id: p.id.clone(),
            name: p.display_name().to_string(),
            target: fmt_range(p.target_top, p.target_bottom, unit),
            duration: format!("{} min", p.duration_min),
        })
        .collect();

    let table = Table::new(&rows).with(Style::rounded()).to_string();
    println!("{table}");
}

pub(crate) fn print_override_preset_table(presets: &[OverridePreset], unit: GlucoseUnit) {
    #[derive(Tabled)]
    struct PresetRow {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "%")]
        percentage: String,
        #[tabled(rename = "Duration")]
        duration: String,
        #[tabled(rename = "Target")]
        target: String,
        #[tabled(rename = "SMBs")]
        smbs: String,
    }

    let rows: Vec<PresetRow> = presets
        .iter()
        .map(|p| PresetRow {
            id: p.id.clone(),
            name: match &p.emoji {
                Some(e) => format!("{e} {}", p.name),
                None => p.name.clone(),
            },
            percentage: format!("{:.0}", p.percentage),
            duration: fmt_duration(p.indefinite, p.duration_min),
            target: if p.target_mgdl > 0.0 {
                fmt_glucose(unit.from_mgdl(p.target_mgdl), unit)
            } else {
                "-".to_string()
            },
            smbs: if p.smb_off { "off" } else { "on" }.to_string(),
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(2..3)).with(Alignment::right()))
        .to_string();
    println!("{table}");
}
