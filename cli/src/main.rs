mod commands;
mod config;
mod nightscout;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::process;

use crate::commands::{
    OverrideArgs, TargetArgs, cmd_override_cancel, cmd_override_preset_apply,
    cmd_override_preset_list, cmd_override_preset_save, cmd_override_set, cmd_override_show,
    cmd_target_cancel, cmd_target_history, cmd_target_preset_apply, cmd_target_preset_list,
    cmd_target_preset_save, cmd_target_set, cmd_target_show,
};
use crate::config::Config;
use crate::nightscout::{NightscoutClient, NoopReporter};
use loopctl_core::service::{SyncReporter, TherapyService};

#[derive(Parser)]
#[command(
    name = "loopctl",
    version,
    about = "Manage insulin therapy overrides and temporary glucose targets"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage temporary glucose targets
    Target {
        #[command(subcommand)]
        command: TargetCommands,
    },
    /// Manage therapy overrides
    Override {
        #[command(subcommand)]
        command: OverrideCommands,
    },
}

#[derive(Subcommand)]
enum TargetCommands {
    /// Set a temporary glucose target
    Set {
        #[command(flatten)]
        args: TargetArgs,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Cancel the active temp target
    Cancel {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the currently active temp target
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show recent temp target entries
    History {
        /// Number of entries to show
        #[arg(short, long, default_value = "20")]
        limit: i64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage temp target presets
    Preset {
        #[command(subcommand)]
        command: TargetPresetCommands,
    },
}

#[derive(Subcommand)]
enum TargetPresetCommands {
    /// Save a temp target preset (requires --name)
    Save {
        #[command(flatten)]
        args: TargetArgs,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List saved temp target presets
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Enact a saved preset by id or name
    Apply {
        /// Preset id or name
        preset: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum OverrideCommands {
    /// Activate an override (closes any active one first)
    Set {
        #[command(flatten)]
        args: OverrideArgs,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Cancel the active override
    Cancel {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the override state as of now
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage override presets
    Preset {
        #[command(subcommand)]
        command: OverridePresetCommands,
    },
}

#[derive(Subcommand)]
enum OverridePresetCommands {
    /// Save an override preset
    Save {
        /// Preset name
        name: String,
        /// Emoji shown next to the name
        #[arg(long)]
        emoji: Option<String>,
        #[command(flatten)]
        args: OverrideArgs,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List saved override presets
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Activate a saved preset by id or name
    Apply {
        /// Preset id or name
        preset: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let svc = TherapyService::new(&config.db_path, config.settings)?;
    let reporter: Box<dyn SyncReporter> = match &config.nightscout_url {
        Some(url) => Box::new(NightscoutClient::new(
            url.clone(),
            config.nightscout_secret.clone(),
            config.settings.units,
        )),
        None => Box::new(NoopReporter),
    };

    match cli.command {
        Commands::Target { command } => match command {
            TargetCommands::Set { args, json } => {
                cmd_target_set(&svc, reporter.as_ref(), &args, json)
            }
            TargetCommands::Cancel { json } => cmd_target_cancel(&svc, reporter.as_ref(), json),
            TargetCommands::Show { json } => cmd_target_show(&svc, json),
            TargetCommands::History { limit, json } => cmd_target_history(&svc, limit, json),
            TargetCommands::Preset { command } => match command {
                TargetPresetCommands::Save { args, json } => {
                    cmd_target_preset_save(&svc, &args, json)
                }
                TargetPresetCommands::List { json } => cmd_target_preset_list(&svc, json),
                TargetPresetCommands::Apply { preset, json } => {
                    cmd_target_preset_apply(&svc, reporter.as_ref(), &preset, json)
                }
            },
        },
        Commands::Override { command } => match command {
            OverrideCommands::Set { args, json } => {
                cmd_override_set(&svc, reporter.as_ref(), &args, json)
            }
            OverrideCommands::Cancel { json } => cmd_override_cancel(&svc, reporter.as_ref(), json),
            OverrideCommands::Show { json } => cmd_override_show(&svc, json),
            OverrideCommands::Preset { command } => match command {
                OverridePresetCommands::Save {
                    name,
                    emoji,
                    args,
                    json,
                } => cmd_override_preset_save(&svc, &name, emoji.as_deref(), &args, json),
                OverridePresetCommands::List { json } => cmd_override_preset_list(&svc, json),
                OverridePresetCommands::Apply { preset, json } => {
                    cmd_override_preset_apply(&svc, reporter.as_ref(), &preset, json)
                }
            },
        },
    }
}
