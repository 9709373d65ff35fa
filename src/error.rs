use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while reading the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("no configuration section [{0}]")]
    MissingSection(String),

    #[error("config value {section}:{field} is missing or has the wrong type")]
    MissingField { section: String, field: String },

    #[error("invalid config value {section}:{field}: {reason}")]
    Invalid {
        section: String,
        field: String,
        reason: String,
    },
}

/// Errors raised while loading a data dictionary. Every variant aborts the load.
#[derive(Debug, Error)]
pub enum DictionaryError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("MID name {0} is defined more than once")]
    DuplicateMidName(String),

    #[error("MID value {value:#06x} is used by both {first} and {second}")]
    DuplicateMidValue {
        value: u16,
        first: String,
        second: String,
    },

    #[error("invalid MID value {value:?} for {name}")]
    InvalidMidValue { name: String, value: String },

    #[error("unknown data type {type_name} for {field}")]
    UnknownType { type_name: String, field: String },

    #[error("invalid array size {size} for {field}")]
    InvalidArraySize { size: String, field: String },

    #[error("invalid bit length {bits} for {field}")]
    InvalidBitLength { bits: String, field: String },

    #[error("bitfield {field} in {type_name} mixes storage widths without padding")]
    MixedBitfieldWidths { type_name: String, field: String },

    #[error("invalid command code {value:?} for {name}")]
    InvalidCommandCode { name: String, value: String },

    #[error("invalid definition in {path}: {reason}")]
    InvalidDefinition { path: PathBuf, reason: String },

    #[error("conflicting definitions for {0} while merging dictionaries")]
    MergeConflict(String),
}

/// Errors raised when reading or writing a field of a typed payload.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TypeError {
    #[error("no field {field} in {type_name}")]
    NoSuchField { field: String, type_name: String },

    #[error("index {index} out of range for {field} (length {len})")]
    IndexOutOfRange {
        field: String,
        index: usize,
        len: usize,
    },

    #[error("invalid path {0}")]
    InvalidPath(String),

    #[error("value {value} does not fit field {field}")]
    ValueOutOfRange { field: String, value: String },

    #[error("field {field} expects {expected}")]
    WrongKind { field: String, expected: &'static str },

    #[error("buffer holds {actual} bytes, {type_name} needs {expected}")]
    ShortBuffer {
        type_name: String,
        expected: usize,
        actual: usize,
    },
}

/// Errors raised while loading a test script.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("failed to read script {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in script {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("script is missing required key {0}")]
    MissingKey(&'static str),

    #[error("unable to locate import {0}")]
    ImportNotFound(String),

    #[error("unknown function {0}")]
    UnknownFunction(String),

    #[error("parameter mismatch calling {function}: expected {expected:?}, got {actual:?}")]
    ParameterMismatch {
        function: String,
        expected: Vec<String>,
        actual: Vec<String>,
    },

    #[error("malformed instruction at position {position}: {reason}")]
    MalformedInstruction { position: usize, reason: String },
}

/// Invalid control-flow structure detected before a test starts.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PreflightError {
    #[error("duplicate label {label} for {instruction}")]
    DuplicateLabel { label: String, instruction: String },

    #[error("{instruction} {label} at index {index} has no matching {expected}")]
    Unmatched {
        instruction: String,
        label: String,
        index: usize,
        expected: &'static str,
    },

    #[error("{instruction} at index {index} is missing a label")]
    MissingLabel { instruction: String, index: usize },

    #[error("Goto {0} references an undefined label")]
    UndefinedLabel(String),
}

/// A continuous verification failed. Ends the current test.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("continuous verification {verification_id} failed on {target}")]
pub struct ConditionError {
    pub verification_id: String,
    pub target: String,
}

/// Errors raised by a target controller. Plugin handlers log these and report failure.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Dictionary(#[from] DictionaryError),

    #[error(transparent)]
    Type(#[from] TypeError),

    #[error("failed to spawn {command}: {reason}")]
    Spawn { command: String, reason: String },

    #[error("{0} is already running")]
    AlreadyRunning(String),

    #[error("{0} is not running")]
    NotRunning(String),

    #[error("remote command failed on {destination}: {reason}")]
    Remote { destination: String, reason: String },

    #[error("MID {0} not in the MID map")]
    UnknownMid(String),

    #[error("could not find command code {cc} for MID {mid}")]
    UnknownCommandCode { mid: String, cc: String },

    #[error("unknown macro {macro_name} in {arg}")]
    UnknownMacro { macro_name: String, arg: String },

    #[error("undefined variable {0}")]
    UnknownVariable(String),

    #[error("invalid argument {arg}: {reason}")]
    InvalidArgument { arg: String, reason: String },

    #[error("failed to send command: {0}")]
    Send(String),
}

/// An instruction could not be carried out. Plugins report these and the scheduler records a
/// failure; a verification stops polling on the first one.
#[derive(Debug, Error)]
pub enum TestError {
    #[error("Unknown Command. No plugin to handle {0}")]
    UnknownInstruction(String),

    #[error("invalid arguments for {instruction}: {source}")]
    InvalidArguments {
        instruction: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{instruction}: {reason}")]
    Failed { instruction: String, reason: String },

    #[error(transparent)]
    Condition(#[from] ConditionError),
}

/// Suite-level failures: the run cannot proceed.
#[derive(Debug, Error)]
pub enum SuiteError {
    #[error("directory {path} could not be created: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write results summary: {0}")]
    Summary(#[from] std::io::Error),

    #[error("failed to encode results: {0}")]
    Json(#[from] serde_json::Error),
}
