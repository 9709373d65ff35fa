//! User variables: assignment, arithmetic updates, telemetry capture and comparison.

use serde::Deserialize;
use serde_json::Value;
use tracing::{error, info};

use super::{arg, optional, parse_args, ArgInfo, ArgKind, InstructionInfo, Plugin};
use super::CfsPlugin;
use crate::context::ExecutionContext;
use crate::error::TestError;
use crate::types::display_value;

const SET_ARGS: &[ArgInfo] = &[
    arg("variable_name", ArgKind::String),
    arg("operator", ArgKind::String),
    arg("value", ArgKind::Other),
];
const FROM_TLM_ARGS: &[ArgInfo] = &[
    arg("user_variable", ArgKind::String),
    arg("mid", ArgKind::TlmMid),
    arg("tlm_variable", ArgKind::String),
    optional("target", ArgKind::String),
];
const GET_ARGS: &[ArgInfo] = &[arg("variable_name", ArgKind::String)];

const INSTRUCTIONS: &[InstructionInfo] = &[
    InstructionInfo::new("SetUserVariable", SET_ARGS),
    InstructionInfo::new("SetUserVariableFromTlm", FROM_TLM_ARGS),
    InstructionInfo::new("GetUserVariable", GET_ARGS),
    InstructionInfo::new("CheckUserVariable", SET_ARGS),
];

#[derive(Debug, Deserialize)]
struct OperatorArgs {
    variable_name: String,
    operator: String,
    value: Value,
}

#[derive(Debug, Deserialize)]
struct FromTlmArgs {
    user_variable: String,
    mid: Value,
    tlm_variable: String,
    #[serde(default)]
    target: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GetArgs {
    variable_name: String,
}

#[derive(Debug, Default)]
pub struct VariablePlugin;

impl Plugin for VariablePlugin {
    fn name(&self) -> &'static str {
        "VariablePlugin"
    }

    fn description(&self) -> &'static str {
        "Variable Plugin"
    }

    fn instructions(&self) -> &'static [InstructionInfo] {
        INSTRUCTIONS
    }
}

impl VariablePlugin {
    pub fn new() -> Self {
        Self
    }

    /// Telemetry lookups go through `cfs`, which owns the registered targets.
    pub fn execute(
        &mut self,
        instruction: &str,
        data: &Value,
        ctx: &mut ExecutionContext,
        cfs: &CfsPlugin,
    ) -> Result<bool, TestError> {
        match instruction {
            "SetUserVariable" => {
                let args: OperatorArgs = parse_args(instruction, data)?;
                Ok(ctx
                    .variables
                    .set(&args.variable_name, &args.operator, &args.value))
            }
            "SetUserVariableFromTlm" => {
                let args: FromTlmArgs = parse_args(instruction, data)?;
                let target = args.target.filter(|name| !name.is_empty());
                match cfs.latest_tlm_value(target.as_ref(), &args.mid, &args.tlm_variable) {
                    Some(value) => {
                        info!(
                            "Set user variable {} from {} {} = {}",
                            args.user_variable,
                            display_value(&args.mid),
                            args.tlm_variable,
                            display_value(&value)
                        );
                        Ok(ctx.variables.set(&args.user_variable, "=", &value))
                    }
                    None => {
                        error!(
                            "No telemetry value for {} in {}",
                            args.tlm_variable,
                            display_value(&args.mid)
                        );
                        Ok(false)
                    }
                }
            }
            "GetUserVariable" => {
                let args: GetArgs = parse_args(instruction, data)?;
                match ctx.variables.get(&args.variable_name) {
                    Some(value) => {
                        info!("Variable {} = {}", args.variable_name, display_value(value));
                        Ok(true)
                    }
                    None => {
                        error!("Variable {} is not defined", args.variable_name);
                        Ok(false)
                    }
                }
            }
            "CheckUserVariable" => {
                let args: OperatorArgs = parse_args(instruction, data)?;
                Ok(ctx
                    .variables
                    .check(&args.variable_name, &args.operator, &args.value))
            }
            other => Err(TestError::UnknownInstruction(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::time::TimeManager;
    use serde_json::json;
    use std::sync::Arc;

    fn cfs() -> CfsPlugin {
        CfsPlugin::new(Arc::new(Config::default()), TimeManager::new(0.5))
    }

    #[test]
    fn test_set_and_check() {
        let mut plugin = VariablePlugin::new();
        let mut ctx = ExecutionContext::new();
        let cfs = cfs();

        let set = |name: &str, op: &str, value: Value| {
            json!({"variable_name": name, "operator": op, "value": value})
        };
        assert!(plugin
            .execute("SetUserVariable", &set("count", "=", json!(1)), &mut ctx, &cfs)
            .unwrap());
        assert!(plugin
            .execute("SetUserVariable", &set("count", "+", json!(2)), &mut ctx, &cfs)
            .unwrap());
        assert!(!plugin
            .execute("SetUserVariable", &set("missing", "+", json!(2)), &mut ctx, &cfs)
            .unwrap());
        assert!(plugin
            .execute("CheckUserVariable", &set("count", "==", json!(3)), &mut ctx, &cfs)
            .unwrap());
        assert!(!plugin
            .execute("CheckUserVariable", &set("count", ">", json!(3)), &mut ctx, &cfs)
            .unwrap());
    }

    #[test]
    fn test_get_user_variable() {
        let mut plugin = VariablePlugin::new();
        let mut ctx = ExecutionContext::new();
        let cfs = cfs();
        ctx.variables.set("name", "=", &json!("to_lab"));
        assert!(plugin
            .execute("GetUserVariable", &json!({"variable_name": "name"}), &mut ctx, &cfs)
            .unwrap());
        assert!(!plugin
            .execute("GetUserVariable", &json!({"variable_name": "other"}), &mut ctx, &cfs)
            .unwrap());
    }

    #[test]
    fn test_from_tlm_without_targets_fails() {
        let mut plugin = VariablePlugin::new();
        let mut ctx = ExecutionContext::new();
        let cfs = cfs();
        let data = json!({"user_variable": "x", "mid": "TO_HK_TLM_MID", "tlm_variable": "usCmdCnt"});
        assert!(!plugin
            .execute("SetUserVariableFromTlm", &data, &mut ctx, &cfs)
            .unwrap());
        assert!(ctx.variables.get("x").is_none());
    }

    #[test]
    fn test_missing_arguments() {
        let mut plugin = VariablePlugin::new();
        let mut ctx = ExecutionContext::new();
        let result = plugin.execute("SetUserVariable", &json!({"variable_name": "x"}), &mut ctx, &cfs());
        assert!(matches!(result, Err(TestError::InvalidArguments { .. })));
    }
}
