//! Flight-software command and telemetry instructions.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::{error, info, warn};

use super::ArgKind::{Boolean, CmdArg, CmdCode, CmdMid, Comparison, Event, Number, TlmMid};
use super::{arg, optional, parse_args, ArgInfo, ArgKind, InstructionInfo, Plugin};
use crate::config::{expand_path, Config, Protocol, BASE_TARGET};
use crate::context::ExecutionContext;
use crate::controller::{CommandRequest, PayloadSpec, TargetController};
use crate::error::{ConditionError, TestError};
use crate::predicate::Predicate;
use crate::telemetry::latest_field;
use crate::time::{PollHooks, TimeManager};
use crate::types::display_value;

/// Seconds to let a freshly started target come up.
const START_SETTLE_TIME: f64 = 3.0;

/// One-second attempts at getting telemetry flowing.
const ENABLE_OUTPUT_ATTEMPTS: usize = 60;

const TARGET: ArgInfo = optional("target", ArgKind::String);
const TARGET_ARGS: &[ArgInfo] = &[TARGET];
const START_ARGS: &[ArgInfo] = &[TARGET, optional("run_args", ArgKind::String)];
const SEND_ARGS: &[ArgInfo] = &[
    arg("mid", CmdMid),
    arg("cc", CmdCode),
    optional("args", CmdArg),
    optional("header", CmdArg),
    TARGET,
];
const INVALID_LENGTH_ARGS: &[ArgInfo] = &[
    arg("mid", CmdMid),
    arg("cc", CmdCode),
    optional("args", CmdArg),
    arg("payload_length", Number),
    optional("header", CmdArg),
    TARGET,
];
const RAW_PAYLOAD_ARGS: &[ArgInfo] = &[
    arg("mid", CmdMid),
    arg("cc", CmdCode),
    arg("hex", ArgKind::String),
    optional("header", CmdArg),
    TARGET,
];
const TLM_ARGS: &[ArgInfo] = &[arg("mid", TlmMid), arg("args", Comparison), TARGET];
const NO_TLM_ARGS: &[ArgInfo] = &[arg("mid", TlmMid), optional("args", Comparison), TARGET];
const CONTINUOUS_ARGS: &[ArgInfo] = &[
    arg("verification_id", ArgKind::String),
    arg("mid", TlmMid),
    arg("args", Comparison),
    TARGET,
];
const REMOVE_ARGS: &[ArgInfo] = &[arg("verification_id", ArgKind::String), TARGET];
const EVENT_ARGS: &[ArgInfo] = &[
    arg("app", ArgKind::String),
    arg("id", Event),
    optional("msg", ArgKind::String),
    optional("is_regex", Boolean),
    optional("msg_args", CmdArg),
    TARGET,
];
const ARCHIVE_ARGS: &[ArgInfo] = &[arg("source_path", ArgKind::String), TARGET];

const INSTRUCTIONS: &[InstructionInfo] = &[
    InstructionInfo::new("RegisterCfs", TARGET_ARGS).end_test_on_fail(),
    InstructionInfo::new("BuildCfs", TARGET_ARGS).end_test_on_fail(),
    InstructionInfo::new("StartCfs", START_ARGS).end_test_on_fail(),
    InstructionInfo::new("EnableCfsOutput", TARGET_ARGS),
    InstructionInfo::new("SendCfsCommand", SEND_ARGS),
    InstructionInfo::new("SendInvalidLengthCfsCommand", INVALID_LENGTH_ARGS),
    InstructionInfo::new("SendCfsCommandWithRawPayload", RAW_PAYLOAD_ARGS),
    InstructionInfo::new("CheckTlmValue", TLM_ARGS).verify(),
    InstructionInfo::new("CheckNoTlmPacket", NO_TLM_ARGS).verify(),
    InstructionInfo::new("CheckTlmContinuous", CONTINUOUS_ARGS).continuous(),
    InstructionInfo::new("RemoveCheckTlmContinuous", REMOVE_ARGS),
    InstructionInfo::new("CheckEvent", EVENT_ARGS).verify(),
    InstructionInfo::new("CheckNoEvent", EVENT_ARGS).verify(),
    InstructionInfo::new("ArchiveCfsFiles", ARCHIVE_ARGS),
    InstructionInfo::new("ShutdownCfs", TARGET_ARGS),
];

#[derive(Debug, Default, Deserialize)]
struct TargetArgs {
    #[serde(default)]
    target: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StartArgs {
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    run_args: String,
}

#[derive(Debug, Deserialize)]
struct SendArgs {
    mid: Value,
    cc: Value,
    #[serde(default)]
    args: Value,
    #[serde(default)]
    payload_length: Option<usize>,
    #[serde(default)]
    hex: Option<String>,
    #[serde(default)]
    header: Option<Value>,
    #[serde(default)]
    target: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TlmArgs {
    mid: Value,
    #[serde(default)]
    args: Value,
    #[serde(default)]
    target: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContinuousArgs {
    verification_id: String,
    #[serde(default)]
    mid: Value,
    #[serde(default)]
    args: Value,
    #[serde(default)]
    target: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventArgs {
    app: String,
    id: Value,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    is_regex: bool,
    #[serde(default)]
    msg_args: Option<Value>,
    #[serde(default)]
    target: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ArchiveArgs {
    source_path: String,
    #[serde(default)]
    target: Option<String>,
}

/// Treat `""` like an absent target.
fn target_name(target: Option<&String>) -> Option<&str> {
    target.map(String::as_str).filter(|name| !name.is_empty())
}

fn all_passed(results: &[bool]) -> bool {
    !results.is_empty() && results.iter().all(|passed| *passed)
}

fn decode_hex(instruction: &str, text: &str) -> Result<Vec<u8>, TestError> {
    let digits = text
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    hex::decode(digits).map_err(|e| TestError::Failed {
        instruction: instruction.to_string(),
        reason: format!("invalid hex payload {}: {}", text, e),
    })
}

fn predicates(instruction: &str, args: &Value) -> Result<Vec<Predicate>, TestError> {
    Predicate::list_from_value(args).map_err(|source| {
        error!("Invalid comparison args for {}: {}", instruction, source);
        TestError::InvalidArguments {
            instruction: instruction.to_string(),
            source,
        }
    })
}

/// Manages every registered flight-software target.
#[derive(Debug)]
pub struct CfsPlugin {
    config: Arc<Config>,
    targets: BTreeMap<String, TargetController>,
    has_attempted_register: bool,
    time: TimeManager,
}

impl Plugin for CfsPlugin {
    fn name(&self) -> &'static str {
        "CFS Plugin"
    }

    fn description(&self) -> &'static str {
        "Provide CFS command/telemetry support for CTF"
    }

    fn instructions(&self) -> &'static [InstructionInfo] {
        INSTRUCTIONS
    }
}

impl CfsPlugin {
    pub fn new(config: Arc<Config>, time: TimeManager) -> Self {
        Self {
            config,
            targets: BTreeMap::new(),
            has_attempted_register: false,
            time,
        }
    }

    pub fn target(&self, name: &str) -> Option<&TargetController> {
        self.targets.get(name)
    }

    pub fn target_mut(&mut self, name: &str) -> Option<&mut TargetController> {
        self.targets.get_mut(name)
    }

    pub fn target_names(&self) -> Vec<String> {
        self.targets.keys().cloned().collect()
    }

    /// Add an already constructed controller under its configured name.
    pub fn insert_target(&mut self, controller: TargetController) {
        self.has_attempted_register = true;
        self.targets.insert(controller.name().to_string(), controller);
    }

    /// Point every target's per-script logs at `dir`.
    pub fn set_log_dir(&mut self, dir: &std::path::Path) {
        for controller in self.targets.values_mut() {
            controller.set_log_dir(dir);
        }
    }

    pub async fn execute(
        &mut self,
        instruction: &str,
        data: &Value,
        ctx: &mut ExecutionContext,
    ) -> Result<bool, TestError> {
        if instruction == "RegisterCfs" {
            let args: TargetArgs = parse_args(instruction, data)?;
            let target = args.target.unwrap_or_default();
            return Ok(self.register(&target, ctx).await);
        }

        let requested: TargetArgs = parse_args(instruction, &target_only(data))?;
        if !self.has_attempted_register {
            let target = target_name(requested.target.as_ref()).unwrap_or("");
            if !self.register(target, ctx).await {
                error!("Failed to configure CFS target(s) {} from config file.", target);
                return Ok(false);
            }
        }

        match instruction {
            "BuildCfs" => Ok(self.build(requested.target.as_ref()).await),
            "StartCfs" => {
                let args: StartArgs = parse_args(instruction, data)?;
                self.start(args.target.as_ref(), &args.run_args, ctx).await
            }
            "EnableCfsOutput" => self.enable_output(requested.target.as_ref(), ctx).await,
            "SendCfsCommand" | "SendInvalidLengthCfsCommand" | "SendCfsCommandWithRawPayload" => {
                let args: SendArgs = parse_args(instruction, data)?;
                self.send_command(instruction, args, ctx).await
            }
            "CheckTlmValue" | "CheckNoTlmPacket" => {
                let args: TlmArgs = parse_args(instruction, data)?;
                self.check_tlm(instruction, &args, ctx)
            }
            "CheckTlmContinuous" => {
                let args: ContinuousArgs = parse_args(instruction, data)?;
                self.check_tlm_continuous(instruction, &args)
            }
            "RemoveCheckTlmContinuous" => {
                let args: ContinuousArgs = parse_args(instruction, data)?;
                Ok(self.remove_check_tlm_continuous(&args))
            }
            "CheckEvent" | "CheckNoEvent" => {
                let args: EventArgs = parse_args(instruction, data)?;
                Ok(self.check_event(instruction, &args, ctx))
            }
            "ArchiveCfsFiles" => {
                let args: ArchiveArgs = parse_args(instruction, data)?;
                Ok(self.archive(&args, ctx).await)
            }
            "ShutdownCfs" => Ok(self.shutdown_cfs(requested.target.as_ref()).await),
            other => Err(TestError::UnknownInstruction(other.to_string())),
        }
    }

    /// Register `target`, or every configured target when empty.
    pub async fn register(&mut self, target: &str, ctx: &ExecutionContext) -> bool {
        info!("RegisterCfs for target: {}", target);
        self.has_attempted_register = true;
        if !target.is_empty() {
            return self.register_one(target, ctx).await;
        }

        let sections = self.config.target_sections();
        if sections.is_empty() {
            info!("No CFS targets found in config file. Registering default local target.");
            return self.register_one(BASE_TARGET, ctx).await;
        }
        info!("Found {} CFS targets in config file. Registering...", sections.len());
        let mut results = Vec::with_capacity(sections.len());
        for section in sections {
            results.push(self.register_one(&section, ctx).await);
        }
        all_passed(&results)
    }

    async fn register_one(&mut self, target: &str, ctx: &ExecutionContext) -> bool {
        if self.targets.contains_key(target) {
            error!("CFS target {} is already registered", target);
            return false;
        }
        if target != BASE_TARGET && !self.config.has_section(target) {
            error!("No CFS configuration defined in config file for {}.", target);
            return false;
        }
        let mut config = match self.config.target(target) {
            Ok(config) => config,
            Err(e) => {
                error!("Missing or invalid configuration for CFS target {}: {}", target, e);
                return false;
            }
        };
        if target == BASE_TARGET {
            config.cfs_protocol = Protocol::Local;
        }

        let result = match TargetController::initialize(config).await {
            Ok(mut controller) => {
                if let Some(dir) = &ctx.script_log_dir {
                    controller.set_log_dir(dir);
                }
                self.targets.insert(target.to_string(), controller);
                true
            }
            Err(e) => {
                error!("Register for {} failed: {}", target, e);
                false
            }
        };
        info!("Register for {} finished.", target);
        result
    }

    /// Names of the targets an instruction applies to.
    fn selected(&self, target: Option<&String>) -> Vec<String> {
        match target_name(target) {
            Some(name) if self.targets.contains_key(name) => vec![name.to_string()],
            Some(name) => {
                error!("CFS target {} not found.", name);
                Vec::new()
            }
            None => {
                if self.targets.is_empty() {
                    error!("No Cfs target Registered");
                }
                self.targets.keys().cloned().collect()
            }
        }
    }

    fn each_target<F>(&mut self, target: Option<&String>, mut op: F) -> bool
    where
        F: FnMut(&mut TargetController) -> bool,
    {
        let mut results = Vec::new();
        for name in self.selected(target) {
            if let Some(controller) = self.targets.get_mut(&name) {
                results.push(op(controller));
            }
        }
        all_passed(&results)
    }

    async fn build(&mut self, target: Option<&String>) -> bool {
        info!("BuildCfs for Target: {}", target_name(target).unwrap_or(""));
        let mut results = Vec::new();
        for name in self.selected(target) {
            let Some(controller) = self.targets.get_mut(&name) else {
                continue;
            };
            results.push(match controller.build().await {
                Ok(built) => built,
                Err(e) => {
                    error!("Failed to build CFS on {}: {}", name, e);
                    false
                }
            });
        }
        all_passed(&results)
    }

    async fn start(
        &mut self,
        target: Option<&String>,
        run_args: &str,
        ctx: &mut ExecutionContext,
    ) -> Result<bool, TestError> {
        info!("StartCfs for target: {}", target_name(target).unwrap_or(""));
        let mut results = Vec::new();
        for name in self.selected(target) {
            let Some(controller) = self.targets.get_mut(&name) else {
                continue;
            };
            match controller.start(run_args).await {
                Ok(_) => {
                    let time = self.time;
                    time.wait(START_SETTLE_TIME, ctx, self).await?;
                    results.push(true);
                }
                Err(e) => {
                    error!("Failed to start CFS on {}: {}", name, e);
                    results.push(false);
                }
            }
        }
        Ok(all_passed(&results))
    }

    async fn enable_output(
        &mut self,
        target: Option<&String>,
        ctx: &mut ExecutionContext,
    ) -> Result<bool, TestError> {
        info!("EnableCfsOutput for target: {}", target_name(target).unwrap_or(""));
        let time = self.time;
        let mut results = Vec::new();
        for name in self.selected(target) {
            let mut enabled = false;
            for attempt in 1..=ENABLE_OUTPUT_ATTEMPTS {
                let Some(controller) = self.targets.get_mut(&name) else {
                    break;
                };
                if let Err(e) = controller.send_enable_output().await {
                    error!("Failed to send enable output command to {}: {}", name, e);
                    break;
                }
                time.wait(1.0, ctx, self).await?;
                if self
                    .targets
                    .get(&name)
                    .is_some_and(|controller| controller.telemetry().received_any())
                {
                    info!("Telemetry output enabled on {} after {} attempt(s)", name, attempt);
                    enabled = true;
                    break;
                }
            }
            if !enabled {
                error!("No telemetry received from {}", name);
            }
            results.push(enabled);
        }
        Ok(all_passed(&results))
    }

    async fn send_command(
        &mut self,
        instruction: &str,
        args: SendArgs,
        ctx: &ExecutionContext,
    ) -> Result<bool, TestError> {
        let payload = match instruction {
            "SendInvalidLengthCfsCommand" => match args.payload_length {
                Some(length) => PayloadSpec::Sized {
                    args: args.args,
                    length,
                },
                None => {
                    return Err(TestError::Failed {
                        instruction: instruction.to_string(),
                        reason: "payload_length is required".to_string(),
                    })
                }
            },
            "SendCfsCommandWithRawPayload" => {
                let hex = args.hex.as_deref().unwrap_or_default();
                PayloadSpec::Raw(decode_hex(instruction, hex)?)
            }
            _ => PayloadSpec::Args(args.args),
        };
        let request = CommandRequest {
            mid: args.mid,
            cc: args.cc,
            payload,
            header: args.header,
        };

        let mut results = Vec::new();
        for name in self.selected(args.target.as_ref()) {
            let Some(controller) = self.targets.get_mut(&name) else {
                continue;
            };
            results.push(match controller.send_command(&request, &ctx.variables).await {
                Ok(()) => true,
                Err(e) => {
                    error!("{} failed on {}: {}", instruction, name, e);
                    false
                }
            });
        }
        Ok(all_passed(&results))
    }

    fn check_tlm(
        &mut self,
        instruction: &str,
        args: &TlmArgs,
        ctx: &ExecutionContext,
    ) -> Result<bool, TestError> {
        let predicates = predicates(instruction, &args.args)?;
        if ctx.is_first_ver() {
            info!(
                "{}: CFS Target: {}, MID {}, Args {}",
                instruction,
                target_name(args.target.as_ref()).unwrap_or(""),
                display_value(&args.mid),
                args.args
            );
        }
        let negative = instruction == "CheckNoTlmPacket";
        Ok(self.each_target(args.target.as_ref(), |controller| {
            if negative {
                controller.check_no_tlm_packet(&args.mid, &predicates, ctx)
            } else {
                controller.check_tlm_value(&args.mid, &predicates, ctx)
            }
        }))
    }

    fn check_tlm_continuous(&mut self, instruction: &str, args: &ContinuousArgs) -> Result<bool, TestError> {
        let predicates = predicates(instruction, &args.args)?;
        info!(
            "CheckTlmContinuous for target: {}, Verification ID: {}, MID: {}, Args: {}",
            target_name(args.target.as_ref()).unwrap_or(""),
            args.verification_id,
            display_value(&args.mid),
            args.args
        );
        Ok(self.each_target(args.target.as_ref(), |controller| {
            controller.check_tlm_continuous(&args.verification_id, &args.mid, &predicates)
        }))
    }

    fn remove_check_tlm_continuous(&mut self, args: &ContinuousArgs) -> bool {
        info!(
            "RemoveCheckTlmContinuous for target: {}, Verification ID: {}",
            target_name(args.target.as_ref()).unwrap_or(""),
            args.verification_id
        );
        self.each_target(args.target.as_ref(), |controller| {
            controller.remove_check_tlm_continuous(&args.verification_id)
        })
    }

    fn check_event(&mut self, instruction: &str, args: &EventArgs, ctx: &ExecutionContext) -> bool {
        if ctx.is_first_ver() {
            info!(
                "{} for target - {}, APP {}, ID {}, MSG {}, Msg Args {}",
                instruction,
                target_name(args.target.as_ref()).unwrap_or(""),
                args.app,
                display_value(&args.id),
                args.msg.as_deref().unwrap_or(""),
                args.msg_args.as_ref().map(display_value).unwrap_or_default()
            );
        }
        let negative = instruction == "CheckNoEvent";
        let msg = args.msg.as_deref();
        let msg_args = args.msg_args.as_ref();
        self.each_target(args.target.as_ref(), |controller| {
            if negative {
                controller.check_no_event(&args.app, &args.id, msg, args.is_regex, msg_args, ctx)
            } else {
                controller.check_event(&args.app, &args.id, msg, args.is_regex, msg_args, ctx)
            }
        })
    }

    async fn archive(&mut self, args: &ArchiveArgs, ctx: &ExecutionContext) -> bool {
        info!(
            "ArchiveCfsFiles for target: {}, Source Path: {}",
            target_name(args.target.as_ref()).unwrap_or(""),
            args.source_path
        );
        let source = expand_path(&args.source_path);
        let mut results = Vec::new();
        for name in self.selected(args.target.as_ref()) {
            let Some(controller) = self.targets.get(&name) else {
                continue;
            };
            results.push(match controller.archive(&source, ctx.test_start_time).await {
                Ok(count) => {
                    info!("Archived {} file(s) from {} on {}", count, source.display(), name);
                    true
                }
                Err(e) => {
                    error!("Failed to archive {} on {}: {}", source.display(), name, e);
                    false
                }
            });
        }
        all_passed(&results)
    }

    async fn shutdown_cfs(&mut self, target: Option<&String>) -> bool {
        info!("ShutdownCfs for target: {}", target_name(target).unwrap_or(""));
        let mut results = Vec::new();
        for name in self.selected(target) {
            if let Some(controller) = self.targets.get_mut(&name) {
                results.push(controller.shutdown_cfs().await);
            }
        }
        all_passed(&results)
    }

    /// Latest value of `path` in the newest packet of `mid` on the selected targets.
    pub fn latest_tlm_value(&self, target: Option<&String>, mid: &Value, path: &str) -> Option<Value> {
        self.selected(target).into_iter().find_map(|name| {
            let controller = self.targets.get(&name)?;
            let entry = match controller.dictionary().resolve_mid(mid) {
                Ok(entry) => entry,
                Err(e) => {
                    error!("{}", e);
                    return None;
                }
            };
            latest_field(controller.telemetry(), entry.mid, path)
        })
    }

    /// Release every target. The plugin can register targets again afterwards.
    pub async fn shutdown(&mut self) {
        for (name, controller) in &mut self.targets {
            info!("Shutting down CFS target: {}", name);
            controller.shutdown().await;
        }
        self.targets.clear();
        self.has_attempted_register = false;
    }
}

/// Only the `target` key of an instruction's data.
fn target_only(data: &Value) -> Value {
    match data.get("target") {
        Some(target) if target.is_string() || target.is_null() => {
            serde_json::json!({ "target": target })
        }
        _ => serde_json::json!({}),
    }
}

impl PollHooks for CfsPlugin {
    /// Drain every target's telemetry, then sweep continuous checks.
    async fn pre_command(&mut self, ctx: &mut ExecutionContext) -> Result<(), ConditionError> {
        for controller in self.targets.values_mut() {
            controller.drain(ctx.exec_time);
        }
        let mut failure = None;
        for controller in self.targets.values_mut() {
            if let Err(e) = controller.check_tlm_conditions() {
                warn!("{}", e);
                if failure.is_none() {
                    failure = Some(e);
                }
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
