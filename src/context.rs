//! Mutable state shared by the scheduler and plugins while a test runs.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::types::display_value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStage {
    #[default]
    None,
    FirstVer,
    Polling,
    LastVer,
}

/// `BeginLoop`/`EndLoop` pair. `condition` holds the last evaluation at `BeginLoop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopLabel {
    pub begin: usize,
    pub end: usize,
    pub condition: bool,
}

/// `IfCondition`/`ElseCondition`/`EndCondition` triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConditionalBranch {
    pub if_index: usize,
    pub else_index: Option<usize>,
    pub end_index: usize,
    pub condition: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelMaps {
    pub goto: HashMap<String, usize>,
    pub loops: HashMap<String, LoopLabel>,
    pub conditions: HashMap<String, ConditionalBranch>,
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::Bool(flag) => Some(f64::from(u8::from(*flag))),
        _ => None,
    }
}

fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64(),
        Value::Bool(flag) => Some(i64::from(*flag)),
        _ => None,
    }
}

fn number_value(value: f64) -> Value {
    serde_json::Number::from_f64(value).map_or(Value::Null, Value::Number)
}

/// Apply one of `+ - * / < <= > >= == !=` to two values.
///
/// Integer arithmetic stays integral except for `/`. Strings concatenate with `+` and
/// compare lexically. Returns `None` for unsupported operators or operand types.
pub fn apply_operator(op: &str, lhs: &Value, rhs: &Value) -> Option<Value> {
    if let (Value::String(a), Value::String(b)) = (lhs, rhs) {
        return match op {
            "+" => Some(Value::String(format!("{}{}", a, b))),
            "<" => Some(Value::Bool(a < b)),
            "<=" => Some(Value::Bool(a <= b)),
            ">" => Some(Value::Bool(a > b)),
            ">=" => Some(Value::Bool(a >= b)),
            "==" => Some(Value::Bool(a == b)),
            "!=" => Some(Value::Bool(a != b)),
            _ => None,
        };
    }

    let (Some(a), Some(b)) = (as_number(lhs), as_number(rhs)) else {
        return match op {
            "==" => Some(Value::Bool(lhs == rhs)),
            "!=" => Some(Value::Bool(lhs != rhs)),
            _ => None,
        };
    };

    let integers = as_integer(lhs).zip(as_integer(rhs));
    let result = match op {
        "+" => match integers.and_then(|(x, y)| x.checked_add(y)) {
            Some(v) => Value::from(v),
            None => number_value(a + b),
        },
        "-" => match integers.and_then(|(x, y)| x.checked_sub(y)) {
            Some(v) => Value::from(v),
            None => number_value(a - b),
        },
        "*" => match integers.and_then(|(x, y)| x.checked_mul(y)) {
            Some(v) => Value::from(v),
            None => number_value(a * b),
        },
        "/" => {
            if b == 0.0 {
                return None;
            }
            number_value(a / b)
        }
        "<" => Value::Bool(a < b),
        "<=" => Value::Bool(a <= b),
        ">" => Value::Bool(a > b),
        ">=" => Value::Bool(a >= b),
        "==" => Value::Bool((a - b).abs() < f64::EPSILON),
        "!=" => Value::Bool((a - b).abs() >= f64::EPSILON),
        _ => return None,
    };
    Some(result)
}

/// User variables set by scripts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VariableStore {
    values: HashMap<String, Value>,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// `=` assigns; any arithmetic operator updates the existing value.
    pub fn set(&mut self, name: &str, op: &str, value: &Value) -> bool {
        if op == "=" {
            info!("Set Variable {} {} {}", name, op, display_value(value));
            self.values.insert(name.to_string(), value.clone());
            return true;
        }
        if !matches!(op, "+" | "-" | "*" | "/") {
            error!("Operator {} not defined in operator_map.", op);
            return false;
        }
        let Some(current) = self.values.get(name) else {
            error!("Variable {} does not exist.", name);
            return false;
        };
        match apply_operator(op, current, value) {
            Some(updated) => {
                info!("Set Variable {} = '{}' {}", name, op, display_value(value));
                self.values.insert(name.to_string(), updated);
                true
            }
            None => {
                error!(
                    "Cannot apply {} to variable {} ({}) and {}",
                    op,
                    name,
                    display_value(current),
                    display_value(value)
                );
                false
            }
        }
    }

    /// Compare a variable against `value`. A missing variable or unknown operator is false.
    pub fn check(&self, name: &str, op: &str, value: &Value) -> bool {
        let Some(current) = self.values.get(name) else {
            warn!("Variable {} is None", name);
            return false;
        };
        if !matches!(op, "<" | "<=" | ">" | ">=" | "==" | "!=") {
            warn!("operator {} is not supported", op);
            return false;
        }
        info!("Variable {} = {}", name, display_value(current));
        let status = apply_operator(op, current, value) == Some(Value::Bool(true));
        let line = format!(
            "Checking {} {} {} => {}",
            display_value(current),
            op,
            display_value(value),
            status
        );
        if status {
            info!("{}", line);
        } else {
            warn!("{}", line);
        }
        status
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Execution state threaded through the scheduler into every plugin call.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub stage: VerificationStage,
    pub current_index: usize,
    pub goto_index: Option<usize>,
    pub variables: VariableStore,
    pub labels: LabelMaps,
    /// Set during the first poll of a verification, including a single `last_ver` poll.
    pub first_poll: bool,
    /// Execution time at the first poll of the running verification.
    pub verification_start_time: f64,
    /// Canonical time in seconds, advanced only by the time manager.
    pub exec_time: f64,
    pub test_start_time: SystemTime,
    pub script_log_dir: Option<PathBuf>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self {
            stage: VerificationStage::None,
            current_index: 0,
            goto_index: None,
            variables: VariableStore::new(),
            labels: LabelMaps::default(),
            first_poll: false,
            verification_start_time: 0.0,
            exec_time: 0.0,
            test_start_time: SystemTime::now(),
            script_log_dir: None,
        }
    }
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_goto(&mut self, index: usize) {
        self.goto_index = Some(index);
    }

    /// True on the first poll of a verification. A zero-length window polls once, at
    /// `last_ver`, and that poll is also the first.
    pub fn is_first_ver(&self) -> bool {
        match self.stage {
            VerificationStage::FirstVer => true,
            VerificationStage::LastVer => self.first_poll,
            _ => false,
        }
    }

    /// Reset per-test state. Variables persist across tests of one script.
    pub fn begin_test(&mut self, labels: LabelMaps) {
        self.stage = VerificationStage::None;
        self.first_poll = false;
        self.current_index = 0;
        self.goto_index = None;
        self.labels = labels;
        self.test_start_time = SystemTime::now();
    }
}

impl fmt::Display for VerificationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VerificationStage::None => "none",
            VerificationStage::FirstVer => "first_ver",
            VerificationStage::Polling => "polling",
            VerificationStage::LastVer => "last_ver",
        };
        write!(f, "{}", name)
    }
}
