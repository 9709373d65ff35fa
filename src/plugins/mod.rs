//! Instruction dispatch.
//!
//! Every script instruction is handled by exactly one plugin. The registry routes an
//! instruction to its owner and answers the scheduler's questions about it: whether it must be
//! polled until it passes, whether it registers a continuous check and whether its failure ends
//! the test.

pub mod cfs;
pub mod control_flow;
pub mod variable;

pub use cfs::CfsPlugin;
pub use control_flow::ControlFlowPlugin;
pub use variable::VariablePlugin;

use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{error, info};

use crate::config::Config;
use crate::context::ExecutionContext;
use crate::error::{ConditionError, TestError};
use crate::time::{PollHooks, TimeManager};

/// Argument categories exported with the plugin info for script editors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgKind {
    CmdMid,
    CmdCode,
    CmdArg,
    TlmMid,
    Comparison,
    String,
    Boolean,
    Number,
    #[serde(rename = "loop_condition")]
    Condition,
    Event,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ArgInfo {
    pub name: &'static str,
    #[serde(rename = "type")]
    pub kind: ArgKind,
    pub required: bool,
}

const fn arg(name: &'static str, kind: ArgKind) -> ArgInfo {
    ArgInfo {
        name,
        kind,
        required: true,
    }
}

const fn optional(name: &'static str, kind: ArgKind) -> ArgInfo {
    ArgInfo {
        name,
        kind,
        required: false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InstructionInfo {
    pub name: &'static str,
    pub args: &'static [ArgInfo],
    #[serde(skip)]
    pub verify_required: bool,
    #[serde(skip)]
    pub continuous: bool,
    #[serde(skip)]
    pub end_test_on_fail: bool,
}

impl InstructionInfo {
    pub const fn new(name: &'static str, args: &'static [ArgInfo]) -> Self {
        Self {
            name,
            args,
            verify_required: false,
            continuous: false,
            end_test_on_fail: false,
        }
    }

    pub const fn verify(mut self) -> Self {
        self.verify_required = true;
        self
    }

    pub const fn continuous(mut self) -> Self {
        self.continuous = true;
        self
    }

    pub const fn end_test_on_fail(mut self) -> Self {
        self.end_test_on_fail = true;
        self
    }
}

/// Static description of a plugin.
pub trait Plugin {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    fn instructions(&self) -> &'static [InstructionInfo];

    fn handles(&self, instruction: &str) -> bool {
        self.instructions().iter().any(|info| info.name == instruction)
    }

    /// JSON description written by `--pluginInfo`.
    fn info(&self) -> Value {
        let mut commands = Map::new();
        for instruction in self.instructions() {
            commands.insert(
                instruction.name.to_string(),
                json!({ "args": instruction.args }),
            );
        }
        json!({
            "name": self.name(),
            "description": self.description(),
            "commands": commands,
        })
    }
}

/// Decode an instruction's `data` into its argument struct. `null` reads as `{}`.
pub(crate) fn parse_args<T: DeserializeOwned>(instruction: &str, data: &Value) -> Result<T, TestError> {
    let data = if data.is_null() {
        Value::Object(Map::new())
    } else {
        data.clone()
    };
    serde_json::from_value(data).map_err(|source| {
        error!("Invalid parameters passed to {}: {}", instruction, source);
        TestError::InvalidArguments {
            instruction: instruction.to_string(),
            source,
        }
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Cfs,
    ControlFlow,
    Variable,
}

/// Owns every plugin for the lifetime of a run.
#[derive(Debug)]
pub struct PluginRegistry {
    cfs: CfsPlugin,
    control_flow: ControlFlowPlugin,
    variable: VariablePlugin,
}

impl PluginRegistry {
    pub fn new(config: Arc<Config>) -> Self {
        let time = TimeManager::new(config.core.ctf_verification_poll_period);
        Self {
            cfs: CfsPlugin::new(config, time),
            control_flow: ControlFlowPlugin::new(),
            variable: VariablePlugin::new(),
        }
    }

    pub fn plugins(&self) -> [&dyn Plugin; 3] {
        [&self.cfs, &self.control_flow, &self.variable]
    }

    pub fn cfs(&self) -> &CfsPlugin {
        &self.cfs
    }

    pub fn cfs_mut(&mut self) -> &mut CfsPlugin {
        &mut self.cfs
    }

    fn owner(&self, instruction: &str) -> Option<Owner> {
        if self.cfs.handles(instruction) {
            Some(Owner::Cfs)
        } else if self.control_flow.handles(instruction) {
            Some(Owner::ControlFlow)
        } else if self.variable.handles(instruction) {
            Some(Owner::Variable)
        } else {
            None
        }
    }

    fn info(&self, instruction: &str) -> Option<&'static InstructionInfo> {
        self.plugins()
            .into_iter()
            .flat_map(|plugin| plugin.instructions().iter())
            .find(|info| info.name == instruction)
    }

    pub fn is_known(&self, instruction: &str) -> bool {
        self.owner(instruction).is_some()
    }

    pub fn is_verify_required(&self, instruction: &str) -> bool {
        self.info(instruction).is_some_and(|info| info.verify_required)
    }

    pub fn is_continuous(&self, instruction: &str) -> bool {
        self.info(instruction).is_some_and(|info| info.continuous)
    }

    pub fn ends_test_on_fail(&self, instruction: &str) -> bool {
        self.info(instruction).is_some_and(|info| info.end_test_on_fail)
    }

    pub fn initialize(&mut self) {
        for plugin in self.plugins() {
            info!("Initialized {}", plugin.name());
        }
    }

    /// Run one instruction. `Ok(false)` is an ordinary failure (or "not yet" while polling);
    /// errors stop a verification immediately.
    pub async fn execute(
        &mut self,
        instruction: &str,
        data: &Value,
        ctx: &mut ExecutionContext,
    ) -> Result<bool, TestError> {
        match self.owner(instruction) {
            Some(Owner::Cfs) => self.cfs.execute(instruction, data, ctx).await,
            Some(Owner::ControlFlow) => self.control_flow.execute(instruction, data, ctx),
            Some(Owner::Variable) => self.variable.execute(instruction, data, ctx, &self.cfs),
            None => {
                error!("Unknown Command. No plugin to handle {}", instruction);
                Err(TestError::UnknownInstruction(instruction.to_string()))
            }
        }
    }

    /// Release targets at the end of a script or run.
    pub async fn shutdown(&mut self) {
        self.cfs.shutdown().await;
        info!("Plugins shut down");
    }

    /// Write one `<name>.json` description per plugin into `dir`.
    pub fn write_plugin_info(&self, dir: &Path) -> std::io::Result<()> {
        fs::create_dir_all(dir)?;
        for plugin in self.plugins() {
            let path = dir.join(format!("{}.json", plugin.name()));
            let text = serde_json::to_string_pretty(&plugin.info())?;
            fs::write(&path, text)?;
            info!("Wrote plugin info for {} to {}", plugin.name(), path.display());
        }
        Ok(())
    }
}

impl PollHooks for PluginRegistry {
    async fn pre_command(&mut self, ctx: &mut ExecutionContext) -> Result<(), ConditionError> {
        self.cfs.pre_command(ctx).await
    }

    async fn post_command(&mut self, ctx: &mut ExecutionContext) -> Result<(), ConditionError> {
        self.cfs.post_command(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry() -> PluginRegistry {
        PluginRegistry::new(Arc::new(Config::default()))
    }

    #[test]
    fn test_instruction_sets() {
        let registry = registry();
        assert!(registry.is_verify_required("CheckTlmValue"));
        assert!(registry.is_verify_required("CheckNoEvent"));
        assert!(!registry.is_verify_required("SendCfsCommand"));
        assert!(registry.is_continuous("CheckTlmContinuous"));
        assert!(registry.ends_test_on_fail("StartCfs"));
        assert!(registry.ends_test_on_fail("BuildCfs"));
        assert!(!registry.ends_test_on_fail("CheckEvent"));
        assert!(registry.is_known("BeginLoop"));
        assert!(registry.is_known("SetUserVariable"));
        assert!(!registry.is_known("Nope"));
    }

    #[tokio::test]
    async fn test_unknown_instruction_is_an_error() {
        let mut registry = registry();
        let mut ctx = ExecutionContext::new();
        let result = registry.execute("Nope", &Value::Null, &mut ctx).await;
        assert!(matches!(result, Err(TestError::UnknownInstruction(_))));
    }

    #[test]
    fn test_plugin_info_files() {
        let dir = TempDir::new().unwrap();
        registry().write_plugin_info(dir.path()).unwrap();
        let text = fs::read_to_string(dir.path().join("CFS Plugin.json")).unwrap();
        let info: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(info["name"], "CFS Plugin");
        assert_eq!(info["commands"]["SendCfsCommand"]["args"][0]["name"], "mid");
        assert_eq!(info["commands"]["SendCfsCommand"]["args"][0]["type"], "cmd_mid");
    }
}
