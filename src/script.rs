//! JSON test script loading.
//!
//! A script is read once into [`Script`]: header metadata, advisory watchlists and an ordered
//! list of [`TestCase`]s. Function calls are inlined at load time so every test holds a flat
//! instruction stream whose indices are final.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, warn};

use crate::error::ScriptError;

const FUNCTION_DEPTH_LIMIT: usize = 32;

/// One unit of execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    /// Seconds to wait before executing.
    #[serde(default)]
    pub delay: f64,
    #[serde(default)]
    pub index: usize,
    #[serde(default)]
    pub disabled: bool,
    /// Per-instruction verification timeout.
    #[serde(default)]
    pub timeout: Option<f64>,
}

impl Instruction {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            delay: 0.0,
            index: 0,
            disabled: false,
            timeout: None,
        }
    }

    pub fn with_delay(mut self, delay: f64) -> Self {
        self.delay = delay;
        self
    }

    /// Build from a raw script entry (`instruction`, `data`, `wait`, `disabled`, `timeout`).
    fn from_raw(raw: &Map<String, Value>, position: usize) -> Result<Self, ScriptError> {
        let kind = raw
            .get("instruction")
            .and_then(Value::as_str)
            .ok_or_else(|| ScriptError::MalformedInstruction {
                position,
                reason: "missing 'instruction' name".to_string(),
            })?;
        Ok(Self {
            kind: kind.to_string(),
            data: raw.get("data").cloned().unwrap_or(Value::Object(Map::new())),
            delay: number_field(raw, "wait", position)?.unwrap_or(0.0),
            index: 0,
            disabled: raw.get("disabled").is_some_and(truthy),
            timeout: number_field(raw, "timeout", position)?,
        })
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|v| v != 0.0),
        Value::String(text) => !text.is_empty() && text != "false" && text != "0",
        _ => false,
    }
}

fn number_field(
    raw: &Map<String, Value>,
    key: &str,
    position: usize,
) -> Result<Option<f64>, ScriptError> {
    match raw.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(number)) => Ok(number.as_f64()),
        Some(Value::String(text)) => text.trim().parse().map(Some).map_err(|_| {
            ScriptError::MalformedInstruction {
                position,
                reason: format!("'{}' must be a number, got {}", key, text),
            }
        }),
        Some(other) => Err(ScriptError::MalformedInstruction {
            position,
            reason: format!("'{}' must be a number, got {}", key, other),
        }),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptMetadata {
    pub number: String,
    pub name: String,
    pub requirements: Vec<String>,
    pub description: String,
    pub owner: String,
    pub setup: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub case_number: String,
    pub description: String,
    pub instructions: Vec<Instruction>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub varlist: Vec<String>,
    pub instructions: Vec<Value>,
}

/// A loaded test script. Read-only during execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Script {
    pub path: PathBuf,
    pub metadata: ScriptMetadata,
    /// Script-level default verification timeout.
    pub verify_timeout: Option<f64>,
    pub telemetry_watchlist: Vec<String>,
    pub command_watchlist: Vec<String>,
    pub tests: Vec<TestCase>,
    /// False when required header keys were missing. Such scripts are reported but not run.
    pub valid: bool,
}

fn display(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn first_of<'a>(raw: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| raw.get(*key))
}

/// Keys of an object, or the items of an array, as strings.
fn names(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Object(map)) => map.keys().cloned().collect(),
        Some(Value::Array(items)) => items.iter().map(display).collect(),
        Some(Value::Null) | None => Vec::new(),
        Some(other) => vec![display(other)],
    }
}

fn read_json(path: &Path) -> Result<Value, ScriptError> {
    let text = fs::read_to_string(path).map_err(|source| ScriptError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| ScriptError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Locate an import: as given, then relative to the script's directory, then its real path.
fn resolve_import(name: &str, script_dir: &Path) -> Result<PathBuf, ScriptError> {
    let given = PathBuf::from(name);
    if given.exists() {
        return Ok(given);
    }
    let relative = script_dir.join(name);
    if relative.exists() {
        return Ok(relative);
    }
    if let Ok(real) = fs::canonicalize(&relative) {
        if real.exists() {
            return Ok(real);
        }
    }
    error!("Error opening file {} while importing functions", name);
    Err(ScriptError::ImportNotFound(name.to_string()))
}

fn parse_functions(value: Option<&Value>, path: &Path) -> Result<BTreeMap<String, Function>, ScriptError> {
    let Some(Value::Object(map)) = value else {
        return Ok(BTreeMap::new());
    };
    let mut functions = BTreeMap::new();
    for (name, body) in map {
        let Value::Object(body) = body else {
            error!("Function {} in {} is not an object", name, path.display());
            return Err(ScriptError::MissingKey("instructions"));
        };
        let varlist = match body.get("varlist") {
            Some(Value::Array(items)) => items.iter().map(display).collect(),
            Some(Value::Object(map)) => map.keys().cloned().collect(),
            _ => {
                error!("Function {} in {} does not contain varlist", name, path.display());
                return Err(ScriptError::MissingKey("varlist"));
            }
        };
        let instructions = match body.get("instructions") {
            Some(Value::Array(items)) => items.clone(),
            _ => {
                error!("Function {} in {} does not contain instructions", name, path.display());
                return Err(ScriptError::MissingKey("instructions"));
            }
        };
        functions.insert(
            name.clone(),
            Function {
                varlist,
                instructions,
            },
        );
    }
    Ok(functions)
}

/// Replace every scalar equal to a parameter name with the caller's value.
fn substitute(value: &Value, params: &Map<String, Value>) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, inner)| (key.clone(), substitute(inner, params)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|item| substitute(item, params)).collect()),
        Value::String(text) => params.get(text).cloned().unwrap_or_else(|| value.clone()),
        other => other.clone(),
    }
}

struct Inliner<'a> {
    functions: &'a BTreeMap<String, Function>,
}

impl Inliner<'_> {
    /// Expand a function call into its raw instructions with parameters substituted.
    fn expand(
        &self,
        name: &str,
        params: &Map<String, Value>,
        position: usize,
        depth: usize,
    ) -> Result<Vec<Map<String, Value>>, ScriptError> {
        if depth > FUNCTION_DEPTH_LIMIT {
            return Err(ScriptError::MalformedInstruction {
                position,
                reason: format!("function {} nests deeper than {} calls", name, FUNCTION_DEPTH_LIMIT),
            });
        }
        let function = self.functions.get(name).ok_or_else(|| {
            error!("Function {} not found in JSON input file", name);
            ScriptError::UnknownFunction(name.to_string())
        })?;

        let expected: BTreeSet<&String> = function.varlist.iter().collect();
        let actual: BTreeSet<&String> = params.keys().collect();
        if expected != actual {
            error!("Function {} parameter mismatch", name);
            return Err(ScriptError::ParameterMismatch {
                function: name.to_string(),
                expected: function.varlist.clone(),
                actual: params.keys().cloned().collect(),
            });
        }

        let mut out = Vec::with_capacity(function.instructions.len());
        for raw in &function.instructions {
            let Value::Object(raw) = raw else {
                return Err(ScriptError::MalformedInstruction {
                    position,
                    reason: format!("instruction in function {} is not an object", name),
                });
            };
            if let Some(inner) = raw.get("function").and_then(Value::as_str) {
                let inner_params = match raw.get("params") {
                    Some(Value::Object(map)) => match substitute(&Value::Object(map.clone()), params) {
                        Value::Object(map) => map,
                        _ => Map::new(),
                    },
                    _ => Map::new(),
                };
                let mut nested = self.expand(inner, &inner_params, position, depth + 1)?;
                apply_call_site(raw, &mut nested, position)?;
                out.extend(nested);
            } else {
                let mut resolved = raw.clone();
                if let Some(data) = raw.get("data") {
                    resolved.insert("data".to_string(), substitute(data, params));
                }
                out.push(resolved);
            }
        }
        Ok(out)
    }
}

/// Add the call-site `wait` to the first inlined instruction and propagate `disabled`.
fn apply_call_site(
    call: &Map<String, Value>,
    inlined: &mut [Map<String, Value>],
    position: usize,
) -> Result<(), ScriptError> {
    let call_wait = number_field(call, "wait", position)?.unwrap_or(0.0);
    let disabled = call.get("disabled").is_some_and(truthy);
    if let Some(first) = inlined.first_mut() {
        let wait = number_field(first, "wait", position)?.unwrap_or(0.0) + call_wait;
        first.insert("wait".to_string(), Value::from(wait));
    }
    if disabled {
        for raw in inlined.iter_mut() {
            raw.insert("disabled".to_string(), Value::Bool(true));
        }
    }
    Ok(())
}

impl Script {
    /// Load a script and inline its functions. Unreadable files, unresolved imports and
    /// function errors fail the whole script.
    pub fn load(path: &Path) -> Result<Self, ScriptError> {
        let raw = read_json(path)?;
        let Value::Object(raw) = raw else {
            return Err(ScriptError::MissingKey("tests"));
        };
        let script_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();

        let mut script = Script {
            path: path.to_path_buf(),
            valid: true,
            ..Script::default()
        };
        script.read_header(&raw);
        script.telemetry_watchlist = names(raw.get("telemetry_watch_list"));
        script.command_watchlist = names(raw.get("command_watch_list"));

        let mut functions = parse_functions(raw.get("functions"), path)?;
        for import in names(raw.get("import")) {
            let import_path = resolve_import(&import, &script_dir)?;
            debug!("Importing functions from {}", import_path.display());
            let imported = read_json(&import_path)?;
            functions.extend(parse_functions(imported.get("functions"), &import_path)?);
        }

        match raw.get("tests") {
            Some(Value::Array(tests)) => {
                let inliner = Inliner {
                    functions: &functions,
                };
                for (number, test) in tests.iter().enumerate() {
                    script.tests.push(Self::read_test(test, number, &inliner)?);
                }
            }
            _ => {
                error!("Invalid Json Script file: {} does not contain tests", path.display());
                script.valid = false;
            }
        }
        Ok(script)
    }

    fn read_header(&mut self, raw: &Map<String, Value>) {
        let mut missing = |key: &str| {
            error!(
                "Invalid Json Script file: {} does not contain {}",
                self.path.display(),
                key
            );
            self.valid = false;
        };

        let number = first_of(raw, &["test_number", "test_script_number"]);
        let name = first_of(raw, &["test_name", "test_script_name"]);
        if number.is_none() {
            missing("test_number");
        }
        if name.is_none() {
            missing("test_name");
        }
        for key in ["requirements", "description", "owner"] {
            if !raw.contains_key(key) {
                missing(key);
            }
        }

        self.metadata = ScriptMetadata {
            number: number.map(display).unwrap_or_default(),
            name: name.map(display).unwrap_or_default(),
            requirements: names(raw.get("requirements")),
            description: raw.get("description").map(display).unwrap_or_default(),
            owner: raw.get("owner").map(display).unwrap_or_default(),
            setup: raw.get("test_setup").map(display).unwrap_or_default(),
        };
        self.verify_timeout = raw
            .get("ctf_options")
            .and_then(|options| first_of(options.as_object()?, &["verify_timeout", "verif_timeout"]))
            .and_then(Value::as_f64)
            .filter(|timeout| *timeout > 0.0);
    }

    fn read_test(test: &Value, number: usize, inliner: &Inliner<'_>) -> Result<TestCase, ScriptError> {
        let Value::Object(test) = test else {
            return Err(ScriptError::MalformedInstruction {
                position: number,
                reason: "test is not an object".to_string(),
            });
        };
        let case_number = first_of(test, &["case_number", "test_number"])
            .map(display)
            .unwrap_or_else(|| {
                warn!("Test {} has no case_number", number);
                format!("Test {}", number + 1)
            });
        let description = test.get("description").map(display).unwrap_or_default();
        let Some(Value::Array(raws)) = test.get("instructions") else {
            return Err(ScriptError::MissingKey("instructions"));
        };

        let mut instructions = Vec::with_capacity(raws.len());
        for (position, raw) in raws.iter().enumerate() {
            let Value::Object(raw) = raw else {
                return Err(ScriptError::MalformedInstruction {
                    position,
                    reason: "instruction is not an object".to_string(),
                });
            };
            let Some(function) = raw.get("function").and_then(Value::as_str) else {
                instructions.push(Instruction::from_raw(raw, position)?);
                continue;
            };

            let params = match raw.get("params") {
                Some(Value::Object(map)) => map.clone(),
                _ => Map::new(),
            };
            let mut inlined = inliner.expand(function, &params, position, 0).map_err(|e| {
                error!("Failed to process test case {} due to the error(s) above", case_number);
                e
            })?;
            if inlined.is_empty() {
                error!("No commands in function {}", function);
                continue;
            }
            apply_call_site(raw, &mut inlined, position)?;
            for inner in &inlined {
                instructions.push(Instruction::from_raw(inner, position)?);
            }
        }

        for (index, instruction) in instructions.iter_mut().enumerate() {
            instruction.index = index;
        }
        Ok(TestCase {
            case_number,
            description,
            instructions,
        })
    }

    /// File name used in logs and the results summary.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "script".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, value: &Value) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, serde_json::to_string_pretty(value).unwrap()).unwrap();
        path
    }

    fn header() -> Map<String, Value> {
        match json!({
            "test_number": "CFE-1",
            "test_name": "Noop",
            "requirements": {"REQ-1": "N/A"},
            "description": "noop",
            "owner": "ctf",
            "ctf_options": {"verify_timeout": 6}
        }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn script(extra: Value) -> Value {
        let mut map = header();
        if let Value::Object(extra) = extra {
            map.extend(extra);
        }
        Value::Object(map)
    }

    #[test]
    fn test_load_header_and_instructions() {
        let dir = TempDir::new().unwrap();
        let path = write(
            dir.path(),
            "noop.json",
            &script(json!({
                "telemetry_watch_list": {"TO_HK_TLM_MID": ["usCmdCnt"]},
                "tests": [{
                    "case_number": "CFE-1-001",
                    "description": "send noop",
                    "instructions": [
                        {"instruction": "StartCfs", "data": {"target": ""}, "wait": 1},
                        {"instruction": "SendCfsCommand", "data": {"mid": "TO_CMD_MID"}, "disabled": true, "timeout": 2}
                    ]
                }]
            })),
        );
        let loaded = Script::load(&path).unwrap();
        assert!(loaded.valid);
        assert_eq!(loaded.metadata.requirements, vec!["REQ-1"]);
        assert_eq!(loaded.verify_timeout, Some(6.0));
        assert_eq!(loaded.telemetry_watchlist, vec!["TO_HK_TLM_MID"]);
        let test = &loaded.tests[0];
        assert_eq!(test.case_number, "CFE-1-001");
        assert_eq!(test.instructions[0].delay, 1.0);
        assert!(test.instructions[1].disabled);
        assert_eq!(test.instructions[1].timeout, Some(2.0));
        assert_eq!(test.instructions[1].index, 1);
    }

    #[test]
    fn test_function_inlining_adds_call_site_wait() {
        let dir = TempDir::new().unwrap();
        let path = write(
            dir.path(),
            "func.json",
            &script(json!({
                "functions": {
                    "f": {
                        "varlist": ["x"],
                        "instructions": [
                            {"instruction": "SetUserVariable", "data": {"variable_name": "a", "operator": "=", "value": "x"}, "wait": 0},
                            {"instruction": "CheckUserVariable", "data": {"variable_name": "a", "operator": "==", "value": ["x"]}, "wait": 0}
                        ]
                    }
                },
                "tests": [{
                    "case_number": "1",
                    "description": "",
                    "instructions": [{"function": "f", "params": {"x": 5}, "wait": 2}]
                }]
            })),
        );
        let loaded = Script::load(&path).unwrap();
        let instructions = &loaded.tests[0].instructions;
        assert_eq!(instructions.len(), 2);
        assert_eq!(instructions[0].delay, 2.0);
        assert_eq!(instructions[1].delay, 0.0);
        assert_eq!(instructions[0].data["value"], json!(5));
        assert_eq!(instructions[1].data["value"], json!([5]));
        assert_eq!(instructions[0].data["variable_name"], json!("a"));
        assert_eq!((instructions[0].index, instructions[1].index), (0, 1));
    }

    #[test]
    fn test_nested_function_and_import() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "lib.json",
            &json!({"functions": {
                "inner": {"varlist": ["y"], "instructions": [
                    {"instruction": "GetUserVariable", "data": {"variable_name": "y"}}
                ]}
            }}),
        );
        let path = write(
            dir.path(),
            "outer.json",
            &script(json!({
                "import": {"lib.json": ["inner"]},
                "functions": {
                    "outer": {"varlist": ["z"], "instructions": [
                        {"function": "inner", "params": {"y": "z"}, "wait": 3}
                    ]}
                },
                "tests": [{"case_number": "1", "description": "", "instructions": [
                    {"function": "outer", "params": {"z": "counter"}}
                ]}]
            })),
        );
        let loaded = Script::load(&path).unwrap();
        let instruction = &loaded.tests[0].instructions[0];
        assert_eq!(instruction.kind, "GetUserVariable");
        assert_eq!(instruction.data["variable_name"], json!("counter"));
        assert_eq!(instruction.delay, 3.0);
    }

    #[test]
    fn test_function_errors_fail_the_script() {
        let dir = TempDir::new().unwrap();
        let unknown = write(
            dir.path(),
            "unknown.json",
            &script(json!({"tests": [{"case_number": "1", "description": "", "instructions": [
                {"function": "missing", "params": {}}
            ]}]})),
        );
        assert!(matches!(Script::load(&unknown), Err(ScriptError::UnknownFunction(_))));

        let mismatch = write(
            dir.path(),
            "mismatch.json",
            &script(json!({
                "functions": {"f": {"varlist": ["x"], "instructions": []}},
                "tests": [{"case_number": "1", "description": "", "instructions": [
                    {"function": "f", "params": {"y": 1}}
                ]}]
            })),
        );
        assert!(matches!(
            Script::load(&mismatch),
            Err(ScriptError::ParameterMismatch { .. })
        ));

        let import = write(dir.path(), "import.json", &script(json!({"import": {"nope.json": []}, "tests": []})));
        assert!(matches!(Script::load(&import), Err(ScriptError::ImportNotFound(_))));
    }

    #[test]
    fn test_missing_header_keys_mark_script_invalid() {
        let dir = TempDir::new().unwrap();
        let path = write(
            dir.path(),
            "bare.json",
            &json!({"tests": [{"case_number": "1", "description": "", "instructions": []}]}),
        );
        let loaded = Script::load(&path).unwrap();
        assert!(!loaded.valid);
        assert_eq!(loaded.tests.len(), 1);

        let bad = dir.path().join("bad.json");
        fs::write(&bad, "{ not json").unwrap();
        assert!(matches!(Script::load(&bad), Err(ScriptError::Json { .. })));
    }
}
