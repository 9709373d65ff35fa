//! Labels, jumps, loops and conditional branches.
//!
//! The scheduler resolves every label before a test starts (see
//! [`preflight`](crate::scheduler::preflight)); these instructions only read the label maps
//! and request a jump through [`ExecutionContext::set_goto`].

use serde::Deserialize;
use serde_json::Value;
use tracing::{error, info};

use super::{arg, parse_args, ArgInfo, ArgKind, InstructionInfo, Plugin};
use crate::context::{ExecutionContext, VariableStore};
use crate::error::TestError;
use crate::types::display_value;

const LABEL_ARGS: &[ArgInfo] = &[arg("label", ArgKind::String)];
const CONDITION_ARGS: &[ArgInfo] = &[
    arg("label", ArgKind::String),
    arg("conditions", ArgKind::Condition),
];

const INSTRUCTIONS: &[InstructionInfo] = &[
    InstructionInfo::new("SetLabel", LABEL_ARGS),
    InstructionInfo::new("Goto", LABEL_ARGS),
    InstructionInfo::new("BeginLoop", CONDITION_ARGS),
    InstructionInfo::new("EndLoop", LABEL_ARGS),
    InstructionInfo::new("IfCondition", CONDITION_ARGS),
    InstructionInfo::new("ElseCondition", LABEL_ARGS),
    InstructionInfo::new("EndCondition", LABEL_ARGS),
];

/// One `{variable, compare, value}` test against the variable store.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Condition {
    pub variable: String,
    pub compare: String,
    pub value: Value,
}

#[derive(Debug, Deserialize)]
struct LabelArgs {
    label: String,
}

#[derive(Debug, Deserialize)]
struct ConditionArgs {
    label: String,
    #[serde(default)]
    conditions: Value,
}

/// True when every condition holds. Anything but a list of conditions is false.
pub fn evaluate_conditions(conditions: &Value, variables: &VariableStore) -> bool {
    let Value::Array(items) = conditions else {
        error!("Conditions must be a list of {{variable, compare, value}}: {}", conditions);
        return false;
    };
    let mut status = true;
    for item in items {
        match serde_json::from_value::<Condition>(item.clone()) {
            Ok(condition) => {
                status = status
                    && variables.check(&condition.variable, &condition.compare, &condition.value);
            }
            Err(e) => {
                error!("Invalid condition {}: {}", item, e);
                return false;
            }
        }
    }
    info!("{} => {}", display_value(conditions), status);
    status
}

fn unknown_label(instruction: &str, label: &str) -> TestError {
    error!("{} label {} was not found in this test", instruction, label);
    TestError::Failed {
        instruction: instruction.to_string(),
        reason: format!("unknown label {}", label),
    }
}

#[derive(Debug, Default)]
pub struct ControlFlowPlugin;

impl Plugin for ControlFlowPlugin {
    fn name(&self) -> &'static str {
        "ControlFlow Plugin"
    }

    fn description(&self) -> &'static str {
        "CTF ControlFlow Plugin"
    }

    fn instructions(&self) -> &'static [InstructionInfo] {
        INSTRUCTIONS
    }
}

impl ControlFlowPlugin {
    pub fn new() -> Self {
        Self
    }

    pub fn execute(
        &mut self,
        instruction: &str,
        data: &Value,
        ctx: &mut ExecutionContext,
    ) -> Result<bool, TestError> {
        match instruction {
            "SetLabel" => {
                let args: LabelArgs = parse_args(instruction, data)?;
                info!("Set label '{}' for control flow instructions", args.label);
                Ok(true)
            }
            "Goto" => {
                let args: LabelArgs = parse_args(instruction, data)?;
                let index = *ctx
                    .labels
                    .goto
                    .get(&args.label)
                    .ok_or_else(|| unknown_label(instruction, &args.label))?;
                info!("Goto label '{}' at instruction {}", args.label, index);
                ctx.set_goto(index);
                Ok(true)
            }
            "BeginLoop" => {
                let args: ConditionArgs = parse_args(instruction, data)?;
                info!("Begin_loop instruction is labeled with '{}'", args.label);
                let status = evaluate_conditions(&args.conditions, &ctx.variables);
                let entry = ctx
                    .labels
                    .loops
                    .get_mut(&args.label)
                    .ok_or_else(|| unknown_label(instruction, &args.label))?;
                entry.condition = status;
                if status {
                    info!("Continuing Loop...  Proceed To The Next Test Instruction");
                } else {
                    info!("Ending Loop... Jump past the End_loop");
                    let after = entry.end + 1;
                    ctx.set_goto(after);
                }
                Ok(true)
            }
            "EndLoop" => {
                let args: LabelArgs = parse_args(instruction, data)?;
                let entry = *ctx
                    .labels
                    .loops
                    .get(&args.label)
                    .ok_or_else(|| unknown_label(instruction, &args.label))?;
                if entry.condition {
                    info!(
                        "Continuing Loop... Jump to the Begin_loop instruction labeled with '{}'",
                        args.label
                    );
                    ctx.set_goto(entry.begin);
                } else {
                    info!("Ending Loop... ");
                }
                Ok(true)
            }
            "IfCondition" => {
                let args: ConditionArgs = parse_args(instruction, data)?;
                let status = evaluate_conditions(&args.conditions, &ctx.variables);
                let branch = ctx
                    .labels
                    .conditions
                    .get_mut(&args.label)
                    .ok_or_else(|| unknown_label(instruction, &args.label))?;
                branch.condition = status;
                if status {
                    info!("IfCondition '{}' is true", args.label);
                } else {
                    let target = branch.else_index.unwrap_or(branch.end_index);
                    info!("IfCondition '{}' is false. Jump to instruction {}", args.label, target);
                    ctx.set_goto(target);
                }
                Ok(true)
            }
            "ElseCondition" => {
                let args: LabelArgs = parse_args(instruction, data)?;
                let branch = *ctx
                    .labels
                    .conditions
                    .get(&args.label)
                    .ok_or_else(|| unknown_label(instruction, &args.label))?;
                if branch.condition {
                    info!("Skipping ElseCondition '{}' branch", args.label);
                    ctx.set_goto(branch.end_index);
                }
                Ok(true)
            }
            "EndCondition" => {
                let args: LabelArgs = parse_args(instruction, data)?;
                info!("EndCondition '{}'", args.label);
                Ok(true)
            }
            other => Err(TestError::UnknownInstruction(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ConditionalBranch, LabelMaps, LoopLabel};
    use serde_json::json;

    fn context() -> ExecutionContext {
        let mut labels = LabelMaps::default();
        labels.goto.insert("top".into(), 0);
        labels.loops.insert(
            "L".into(),
            LoopLabel {
                begin: 1,
                end: 3,
                condition: false,
            },
        );
        labels.conditions.insert(
            "C".into(),
            ConditionalBranch {
                if_index: 4,
                else_index: Some(6),
                end_index: 8,
                condition: false,
            },
        );
        let mut ctx = ExecutionContext::new();
        ctx.begin_test(labels);
        ctx
    }

    #[test]
    fn test_loop_jumps() {
        let mut plugin = ControlFlowPlugin::new();
        let mut ctx = context();
        ctx.variables.set("counter", "=", &json!(0));
        let begin = json!({"label": "L", "conditions": [{"variable": "counter", "compare": "<", "value": 3}]});

        assert!(plugin.execute("BeginLoop", &begin, &mut ctx).unwrap());
        assert_eq!(ctx.goto_index, None);
        assert!(plugin.execute("EndLoop", &json!({"label": "L"}), &mut ctx).unwrap());
        assert_eq!(ctx.goto_index, Some(1));

        ctx.goto_index = None;
        ctx.variables.set("counter", "=", &json!(3));
        assert!(plugin.execute("BeginLoop", &begin, &mut ctx).unwrap());
        assert_eq!(ctx.goto_index, Some(4));
    }

    #[test]
    fn test_if_else_jumps() {
        let mut plugin = ControlFlowPlugin::new();
        let mut ctx = context();
        let cond = json!({"label": "C", "conditions": [{"variable": "flag", "compare": "==", "value": 1}]});

        ctx.variables.set("flag", "=", &json!(0));
        plugin.execute("IfCondition", &cond, &mut ctx).unwrap();
        assert_eq!(ctx.goto_index, Some(6));
        ctx.goto_index = None;
        plugin.execute("ElseCondition", &json!({"label": "C"}), &mut ctx).unwrap();
        assert_eq!(ctx.goto_index, None);

        ctx.variables.set("flag", "=", &json!(1));
        plugin.execute("IfCondition", &cond, &mut ctx).unwrap();
        assert_eq!(ctx.goto_index, None);
        plugin.execute("ElseCondition", &json!({"label": "C"}), &mut ctx).unwrap();
        assert_eq!(ctx.goto_index, Some(8));
    }

    #[test]
    fn test_goto_and_unknown_label() {
        let mut plugin = ControlFlowPlugin::new();
        let mut ctx = context();
        plugin.execute("Goto", &json!({"label": "top"}), &mut ctx).unwrap();
        assert_eq!(ctx.goto_index, Some(0));
        assert!(plugin.execute("Goto", &json!({"label": "nowhere"}), &mut ctx).is_err());
        assert!(plugin.execute("SetLabel", &json!({}), &mut ctx).is_err());
    }

    #[test]
    fn test_conditions_require_a_list() {
        let mut variables = VariableStore::new();
        variables.set("x", "=", &json!(2));
        assert!(evaluate_conditions(
            &json!([{"variable": "x", "compare": ">", "value": 1}, {"variable": "x", "compare": "<", "value": 5}]),
            &variables
        ));
        assert!(!evaluate_conditions(&json!({"variable": "x", "compare": ">", "value": 1}), &variables));
        assert!(!evaluate_conditions(&json!([{"variable": "y", "compare": ">", "value": 1}]), &variables));
    }
}
