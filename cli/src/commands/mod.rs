mod helpers;
mod overrides;
mod target;

pub(crate) use overrides::{
    OverrideArgs, cmd_override_cancel, cmd_override_preset_apply, cmd_override_preset_list,
    cmd_override_preset_save, cmd_override_set, cmd_override_show,
};
pub(crate) use target::{
    TargetArgs, cmd_target_cancel, cmd_target_history, cmd_target_preset_apply,
    cmd_target_preset_list, cmd_target_preset_save, cmd_target_set, cmd_target_show,
};
