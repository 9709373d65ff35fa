//! Target controller: one flight-software instance with its dictionary, command channel,
//! telemetry channel and process host.

pub mod host;

pub use host::{copy_modified_since, LocalHost, SshHost, TargetHost};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::SystemTime;

use regex::Regex;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use crate::command::{CommandChannel, HeaderOverride};
use crate::config::{Protocol, TargetConfig};
use crate::context::{ExecutionContext, VariableStore, VerificationStage};
use crate::dictionary::{Dictionary, MacroMap, MidEntry, ReaderOptions};
use crate::error::{ConditionError, ControllerError};
use crate::predicate::{evaluate, Predicate};
use crate::telemetry::{TelemetryChannel, TelemetryOptions};
use crate::types::{display_value, parse_int, Payload, TypeDef};

/// Command code of the output app that starts telemetry forwarding.
pub const TO_ENABLE_OUTPUT_CC: &str = "TO_ENABLE_OUTPUT_CC";

const EVS_APP_NAME: &str = "Payload.PacketID.AppName";
const EVS_EVENT_ID: &str = "Payload.PacketID.EventID";
const EVS_MESSAGE: &str = "Payload.Message";

/// How the payload bytes of a command are produced.
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadSpec {
    /// Field values encoded with the command code's argument type.
    Args(Value),
    /// As `Args`, then truncated or zero padded to exactly `length` bytes.
    Sized { args: Value, length: usize },
    /// Bytes sent as-is.
    Raw(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    pub mid: Value,
    pub cc: Value,
    pub payload: PayloadSpec,
    /// Header overrides, e.g. `{"pheader.sequence_count": 7}` or nested objects.
    pub header: Option<Value>,
}

impl CommandRequest {
    pub fn new(mid: Value, cc: Value, args: Value) -> Self {
        Self {
            mid,
            cc,
            payload: PayloadSpec::Args(args),
            header: None,
        }
    }
}

/// A command ready for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedCommand {
    pub mid: u16,
    pub function_code: u8,
    pub payload: Vec<u8>,
    pub overrides: Vec<HeaderOverride>,
}

/// A telemetry assertion evaluated on every sweep until removed.
#[derive(Debug, Clone)]
pub struct ContinuousVerification {
    pub id: String,
    pub mid: u16,
    pub mid_name: String,
    pub predicates: Vec<Predicate>,
    pub pass_count: usize,
    pub fail_count: usize,
    last_checked: usize,
}

/// Parse `msg_args`: a JSON array, or a string holding a JSON array or a tuple literal.
pub fn parse_msg_args(args: &Value) -> Result<Vec<Value>, ControllerError> {
    let invalid = |reason: &str| ControllerError::InvalidArgument {
        arg: args.to_string(),
        reason: reason.to_string(),
    };
    match args {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => Ok(items.clone()),
        Value::String(text) => {
            let text = text.trim();
            if text.is_empty() {
                return Ok(Vec::new());
            }
            if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(text) {
                return Ok(items);
            }
            let inner = text
                .strip_prefix('(')
                .and_then(|rest| rest.strip_suffix(')'))
                .unwrap_or(text)
                .trim()
                .trim_end_matches(',');
            let normalized = format!("[{}]", inner.replace('\'', "\""));
            match serde_json::from_str::<Value>(&normalized) {
                Ok(Value::Array(items)) => Ok(items),
                _ => Err(invalid("expected a list of message arguments")),
            }
        }
        other => Ok(vec![other.clone()]),
    }
}

/// Substitute printf-style conversions (`%d %i %u %s %x %X %f %%`) in order.
pub fn format_message(format: &str, args: &[Value]) -> Result<String, ControllerError> {
    static SPEC: OnceLock<Regex> = OnceLock::new();
    let re = SPEC.get_or_init(|| {
        Regex::new(r"%([-0]?)(\d+)?(?:\.(\d+))?([diuxXfs%])").expect("format regex is valid")
    });

    let invalid = |reason: String| ControllerError::InvalidArgument {
        arg: format.to_string(),
        reason,
    };
    let mut out = String::with_capacity(format.len());
    let mut last = 0;
    let mut next = args.iter();

    for caps in re.captures_iter(format) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&format[last..whole.start()]);
        last = whole.end();

        let conversion = caps.get(4).map_or("", |m| m.as_str());
        if conversion == "%" {
            out.push('%');
            continue;
        }
        let arg = next
            .next()
            .ok_or_else(|| invalid("not enough arguments for format string".to_string()))?;
        let flag = caps.get(1).map_or("", |m| m.as_str());
        let width: usize = caps.get(2).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
        let precision: Option<usize> = caps.get(3).and_then(|m| m.as_str().parse().ok());

        let integer = || -> Result<i64, ControllerError> {
            match arg {
                Value::Number(n) => n
                    .as_i64()
                    .or_else(|| n.as_f64().map(|f| f as i64))
                    .ok_or_else(|| invalid(format!("{} is not an integer", arg))),
                Value::Bool(b) => Ok(i64::from(*b)),
                Value::String(s) => parse_int(s)
                    .and_then(|v| i64::try_from(v).ok())
                    .ok_or_else(|| invalid(format!("{} is not an integer", s))),
                _ => Err(invalid(format!("{} is not an integer", arg))),
            }
        };
        let text = match conversion {
            "d" | "i" | "u" => integer()?.to_string(),
            "x" => format!("{:x}", integer()?),
            "X" => format!("{:X}", integer()?),
            "f" => {
                let value = match arg {
                    Value::Number(n) => n.as_f64(),
                    Value::String(s) => s.trim().parse().ok(),
                    _ => None,
                }
                .ok_or_else(|| invalid(format!("{} is not a number", arg)))?;
                format!("{:.*}", precision.unwrap_or(6), value)
            }
            _ => display_value(arg),
        };

        let padded = match flag {
            "-" => format!("{:<width$}", text, width = width),
            "0" if conversion != "s" => format!("{:0>width$}", text, width = width),
            _ => format!("{:>width$}", text, width = width),
        };
        out.push_str(&padded);
    }
    out.push_str(&format[last..]);
    Ok(out)
}

/// Drivers and state for one registered target.
#[derive(Debug)]
pub struct TargetController {
    config: TargetConfig,
    dictionary: Dictionary,
    host: TargetHost,
    command: CommandChannel,
    telemetry: TelemetryChannel,
    continuous: BTreeMap<String, ContinuousVerification>,
    evs_short_mid: Option<u16>,
    evs_long_mid: Option<u16>,
    log_dir: Option<PathBuf>,
    running: bool,
}

impl TargetController {
    /// Load the target's dictionary and open its sockets.
    pub async fn initialize(config: TargetConfig) -> Result<Self, ControllerError> {
        info!(
            "Creating MID Map from CCDD Data at {}",
            config.ccsds_data_dir.display()
        );
        let options = ReaderOptions {
            endianness: config.endianess_of_target,
            ccsds_target: config.ccsds_target.clone(),
            log_imports: config.log_ccsds_imports,
        };
        let dictionary = Dictionary::load(&config.ccsds_data_dir, &options)?;
        Self::with_dictionary(config, dictionary).await
    }

    /// Open the sockets for an already loaded dictionary.
    pub async fn with_dictionary(
        config: TargetConfig,
        dictionary: Dictionary,
    ) -> Result<Self, ControllerError> {
        let version = config.version()?;
        let evs_mid = |name: &str| {
            let mid = dictionary.mids.get(name).map(|entry| entry.mid);
            if mid.is_none() {
                warn!("{} not found in MID map. EVS event messages will not be captured.", name);
            }
            mid
        };
        let evs_short_mid = evs_mid(&config.evs_short_event_mid_name);
        let evs_long_mid = evs_mid(&config.evs_long_event_mid_name);

        let telemetry = TelemetryChannel::bind(
            config.telemetry_address()?,
            TelemetryOptions {
                version,
                skip_header: !config.ccsds_header_info_included,
                evs_mids: evs_short_mid.into_iter().chain(evs_long_mid).collect(),
                target_name: config.name.clone(),
                tlm_log_file: config.tlm_log_file.clone(),
                evs_log_file: config.evs_log_file.clone(),
            },
        )
        .await?;
        let command = CommandChannel::connect(
            config.command_address()?,
            version,
            config.endianess_of_target == crate::types::Endianness::Big,
            config.command_crc,
        )
        .await?;

        let host = match config.cfs_protocol {
            Protocol::Local => TargetHost::Local(LocalHost::new()),
            Protocol::Ssh => TargetHost::Remote(SshHost::new(
                config.destination.clone().unwrap_or_default(),
            )),
        };

        info!(
            "Target {} initialized: {} MIDs, {} macros, telemetry on {}",
            config.name,
            dictionary.mids.len(),
            dictionary.macros.len(),
            telemetry.local_addr()
        );
        Ok(Self {
            config,
            dictionary,
            host,
            command,
            telemetry,
            continuous: BTreeMap::new(),
            evs_short_mid,
            evs_long_mid,
            log_dir: None,
            running: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &TargetConfig {
        &self.config
    }

    pub fn dictionary(&self) -> &Dictionary {
        &self.dictionary
    }

    pub fn telemetry(&self) -> &TelemetryChannel {
        &self.telemetry
    }

    pub fn telemetry_mut(&mut self) -> &mut TelemetryChannel {
        &mut self.telemetry
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn continuous_verification(&self, id: &str) -> Option<&ContinuousVerification> {
        self.continuous.get(id)
    }

    /// Direct per-target logs (stdout, build output, TLM/EVS logs) into `dir`.
    pub fn set_log_dir(&mut self, dir: &Path) {
        self.log_dir = Some(dir.to_path_buf());
        self.telemetry.set_log_dir(dir);
    }

    fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("."))
    }

    pub async fn build(&mut self) -> Result<bool, ControllerError> {
        if !self.config.build_cfs {
            info!("build_cfs is disabled for {}; skipping build", self.config.name);
            return Ok(true);
        }
        info!("Building CFS on {}", self.config.name);
        self.host.build(&self.config, &self.log_dir()).await
    }

    pub async fn start(&mut self, run_args: &str) -> Result<u32, ControllerError> {
        if self.running {
            return Err(ControllerError::AlreadyRunning(self.config.name.clone()));
        }
        info!("Starting CFS on {}", self.config.name);
        let pid = self.host.start(&self.config, run_args, &self.log_dir()).await?;
        info!("CFS on {} started with PID {}", self.config.name, pid);
        self.running = true;
        Ok(pid)
    }

    /// Ask the output app to forward telemetry to this machine.
    pub async fn send_enable_output(&mut self) -> Result<(), ControllerError> {
        let mid = self
            .dictionary
            .mids
            .iter()
            .find(|entry| entry.command_code(TO_ENABLE_OUTPUT_CC).is_some())
            .map(|entry| entry.name.clone())
            .ok_or_else(|| ControllerError::UnknownCommandCode {
                mid: "*".to_string(),
                cc: TO_ENABLE_OUTPUT_CC.to_string(),
            })?;
        let args = json!({
            "cDestIp": self.config.local_ip(),
            "usDestPort": self.telemetry.port(),
        });
        let request = CommandRequest::new(Value::String(mid), json!(TO_ENABLE_OUTPUT_CC), args);
        self.send_command(&request, &VariableStore::new()).await
    }

    /// Receive pending telemetry stamped with `exec_time`.
    pub fn drain(&mut self, exec_time: f64) -> usize {
        self.telemetry.drain(&self.dictionary, exec_time)
    }

    fn resolve_mid(&self, mid: &Value) -> Result<&MidEntry, ControllerError> {
        self.dictionary.resolve_mid(mid).map_err(|e| {
            error!("{} not in MID Map. Ensure it is defined in CCSDS Exports.", mid);
            e
        })
    }

    fn resolve_command_code(
        entry: &MidEntry,
        cc: &Value,
        macros: &MacroMap,
    ) -> Result<(u8, Option<Arc<TypeDef>>), ControllerError> {
        let unknown = || ControllerError::UnknownCommandCode {
            mid: entry.name.clone(),
            cc: display_value(cc),
        };
        match cc {
            Value::Number(number) => {
                let code = number
                    .as_u64()
                    .and_then(|v| u8::try_from(v).ok())
                    .ok_or_else(unknown)?;
                Ok((code, None))
            }
            Value::String(text) => {
                let name = if MacroMap::contains_macro(text) {
                    macros.expand(text)?
                } else {
                    text.clone()
                };
                if let Some(code) = entry.command_code(name.trim()) {
                    return Ok((code.code, Some(code.arg_type.clone())));
                }
                let code = parse_int(&name)
                    .and_then(|v| u8::try_from(v).ok())
                    .ok_or_else(unknown)?;
                Ok((code, entry.command_by_value(code).map(|cc| cc.arg_type.clone())))
            }
            _ => Err(unknown()),
        }
    }

    /// Expand macros in both keys and values of an argument tree.
    fn expand_args(&self, args: &Value) -> Result<Value, ControllerError> {
        match args {
            Value::Object(map) => {
                let mut out = Map::new();
                for (key, value) in map {
                    let key = if MacroMap::contains_macro(key) {
                        self.dictionary.macros.expand(key)?
                    } else {
                        key.clone()
                    };
                    if value.is_array() {
                        return Err(ControllerError::InvalidArgument {
                            arg: key,
                            reason: "lists are not a supported args format; use name[i] keys"
                                .to_string(),
                        });
                    }
                    out.insert(key, self.expand_args(value)?);
                }
                Ok(Value::Object(out))
            }
            other => self.dictionary.macros.expand_value(other),
        }
    }

    fn encode_args(&self, arg_type: Option<&Arc<TypeDef>>, args: &Value) -> Result<Vec<u8>, ControllerError> {
        let args = match args {
            Value::Array(items) if items.is_empty() => Value::Object(Map::new()),
            other => other.clone(),
        };
        let Some(arg_type) = arg_type else {
            if !matches!(&args, Value::Object(map) if map.is_empty()) && !args.is_null() {
                warn!("Command code has no argument type; ignoring args {}", args);
            }
            return Ok(Vec::new());
        };
        let expanded = self.expand_args(&args)?;
        let payload = Payload::from_value(arg_type.clone(), &expanded)?;
        Ok(payload.into_bytes())
    }

    fn header_overrides(
        &self,
        header: &Value,
        variables: &VariableStore,
    ) -> Result<Vec<HeaderOverride>, ControllerError> {
        fn flatten(prefix: &str, value: &Value, out: &mut Vec<(String, Value)>) {
            match value {
                Value::Object(map) => {
                    for (key, inner) in map {
                        let path = if prefix.is_empty() {
                            key.clone()
                        } else {
                            format!("{}.{}", prefix, key)
                        };
                        flatten(&path, inner, out);
                    }
                }
                other => out.push((prefix.to_string(), other.clone())),
            }
        }

        let mut fields = Vec::new();
        flatten("", header, &mut fields);
        let mut overrides = Vec::with_capacity(fields.len());
        for (path, value) in fields {
            let invalid = |reason: &str| ControllerError::InvalidArgument {
                arg: path.clone(),
                reason: reason.to_string(),
            };
            let value = match &value {
                Value::String(text) if text.len() > 2 && text.starts_with('$') && text.ends_with('$') => {
                    let name = &text[1..text.len() - 1];
                    variables
                        .get(name)
                        .cloned()
                        .ok_or_else(|| ControllerError::UnknownVariable(name.to_string()))?
                }
                other => self.dictionary.macros.expand_value(other)?,
            };
            let number = match &value {
                Value::Number(n) => n
                    .as_u64()
                    .or_else(|| n.as_i64().map(|v| v as u64))
                    .ok_or_else(|| invalid("header values must be integers"))?,
                Value::Bool(b) => u64::from(*b),
                Value::String(s) => parse_int(s)
                    .and_then(|v| u64::try_from(v).ok())
                    .ok_or_else(|| invalid("header values must be integers"))?,
                _ => return Err(invalid("header values must be integers")),
            };
            overrides.push(HeaderOverride::new(path, number));
        }
        Ok(overrides)
    }

    /// Resolve MID, command code, payload and header overrides without sending.
    pub fn encode_command(
        &self,
        request: &CommandRequest,
        variables: &VariableStore,
    ) -> Result<EncodedCommand, ControllerError> {
        let entry = self.resolve_mid(&request.mid)?;
        let (function_code, arg_type) =
            Self::resolve_command_code(entry, &request.cc, &self.dictionary.macros)?;

        let payload = match &request.payload {
            PayloadSpec::Args(args) => self.encode_args(arg_type.as_ref(), args)?,
            PayloadSpec::Sized { args, length } => {
                let mut bytes = self.encode_args(arg_type.as_ref(), args)?;
                bytes.resize(*length, 0);
                bytes
            }
            PayloadSpec::Raw(bytes) => bytes.clone(),
        };
        let overrides = match &request.header {
            Some(header) => self.header_overrides(header, variables)?,
            None => Vec::new(),
        };

        Ok(EncodedCommand {
            mid: entry.mid,
            function_code,
            payload,
            overrides,
        })
    }

    pub async fn send_command(
        &mut self,
        request: &CommandRequest,
        variables: &VariableStore,
    ) -> Result<(), ControllerError> {
        info!(
            "Sending CFS Command to target: {}, {}:{} with Args: {:?}",
            self.config.name,
            display_value(&request.mid),
            display_value(&request.cc),
            request.payload
        );
        let encoded = self.encode_command(request, variables)?;
        self.command
            .send_command(
                encoded.mid,
                encoded.function_code,
                &encoded.payload,
                &encoded.overrides,
            )
            .await?;
        Ok(())
    }

    fn resolve_predicates(&self, predicates: &[Predicate]) -> Result<Vec<Predicate>, ControllerError> {
        predicates
            .iter()
            .map(|predicate| {
                let mut resolved = predicate.clone();
                if let Some(variable) = &predicate.variable {
                    if MacroMap::contains_macro(variable) {
                        resolved.variable = Some(self.dictionary.macros.expand(variable)?);
                    }
                }
                if let Some(value) = &predicate.value {
                    resolved.value = Some(self.dictionary.macros.expand_value(value)?);
                }
                Ok(resolved)
            })
            .collect()
    }

    /// Evaluate the retained packets of `mid`, newest first.
    fn check_history(
        &mut self,
        mid: u16,
        predicates: &[Predicate],
        ctx: &ExecutionContext,
        discard: bool,
    ) -> bool {
        let first_ver = ctx.is_first_ver();
        if first_ver {
            let offset = if self.telemetry.is_evs_mid(mid) {
                self.config.evs_messages_clear_after_time
            } else {
                0.0
            };
            self.telemetry
                .prune_before(mid, ctx.verification_start_time - offset);
        }

        let history = self.telemetry.history(mid);
        if history.is_empty() {
            debug!("No messages received between polling to check. MID = {:#x}", mid);
            return false;
        }

        let mut result = false;
        for packet in history.iter().rev() {
            let Some(payload) = &packet.payload else {
                error!("Failed to extract packet from received MID: {:#x}. Continuing...", mid);
                continue;
            };
            if evaluate(payload, predicates, first_ver) {
                result = true;
                break;
            }
        }

        if discard {
            self.telemetry.clear(mid);
        }
        result
    }

    /// True when any packet of `mid` received during this verification satisfies every predicate.
    pub fn check_tlm_value(
        &mut self,
        mid: &Value,
        predicates: &[Predicate],
        ctx: &ExecutionContext,
    ) -> bool {
        let first_ver = ctx.is_first_ver();
        let entry = match self.dictionary.resolve_mid(mid) {
            Ok(entry) => entry,
            Err(e) => {
                if first_ver {
                    error!("{}", e);
                }
                return false;
            }
        };
        let (mid_value, mid_name) = (entry.mid, entry.name.clone());
        if !self.telemetry.has_history(mid_value) {
            if first_ver {
                error!("Messages never received for MID {}:{:#x}.", mid_name, mid_value);
            }
            return false;
        }

        let predicates = match self.resolve_predicates(predicates) {
            Ok(predicates) => predicates,
            Err(e) => {
                error!("{}", e);
                return false;
            }
        };
        let result = self.check_history(mid_value, &predicates, ctx, true);
        if result {
            info!("PASSED Final Check for MID:{}, Args:{:?}", mid_name, predicates);
        }
        result
    }

    /// Negative form of [`check_tlm_value`](Self::check_tlm_value): true only at the last poll
    /// when no retained packet matched.
    pub fn check_no_tlm_packet(
        &mut self,
        mid: &Value,
        predicates: &[Predicate],
        ctx: &ExecutionContext,
    ) -> bool {
        let mid_value = match self.dictionary.resolve_mid(mid) {
            Ok(entry) => entry.mid,
            Err(e) => {
                if ctx.is_first_ver() {
                    error!("{}", e);
                }
                return false;
            }
        };
        let predicates = match self.resolve_predicates(predicates) {
            Ok(predicates) => predicates,
            Err(e) => {
                error!("{}", e);
                return false;
            }
        };
        let matched = self.check_history(mid_value, &predicates, ctx, false);
        if ctx.stage != VerificationStage::LastVer {
            return false;
        }
        self.telemetry.clear(mid_value);
        if matched {
            warn!("Found packet for MID {} matching {:?}", display_value(mid), predicates);
        }
        !matched
    }

    pub fn check_tlm_continuous(
        &mut self,
        verification_id: &str,
        mid: &Value,
        predicates: &[Predicate],
    ) -> bool {
        info!(
            "Adding continuous telemetry check {} on {}",
            verification_id, self.config.name
        );
        let entry = match self.resolve_mid(mid) {
            Ok(entry) => entry,
            Err(_) => return false,
        };
        let (mid_value, mid_name) = (entry.mid, entry.name.clone());
        if !self.telemetry.has_history(mid_value) {
            error!("Messages never received for MID {}:{:#x}.", mid_name, mid_value);
            return false;
        }
        if self.continuous.contains_key(verification_id) {
            error!(
                "Condition with id {} is already registered! Check your test instructions",
                verification_id
            );
            return false;
        }
        let predicates = match self.resolve_predicates(predicates) {
            Ok(predicates) => predicates,
            Err(e) => {
                error!("{}", e);
                return false;
            }
        };
        let last_checked = self.telemetry.latest(mid_value).map_or(0, |p| p.count.saturating_sub(1));
        self.continuous.insert(
            verification_id.to_string(),
            ContinuousVerification {
                id: verification_id.to_string(),
                mid: mid_value,
                mid_name,
                predicates,
                pass_count: 0,
                fail_count: 0,
                last_checked,
            },
        );
        true
    }

    fn log_continuous_counts(&self, verification: &ContinuousVerification) {
        info!(
            "Continuous Telemetry Check {} on {}:",
            verification.id, self.config.name
        );
        info!("Number times Passed:                {}", verification.pass_count);
        info!("Number times Failed:                {}", verification.fail_count);
    }

    pub fn remove_check_tlm_continuous(&mut self, verification_id: &str) -> bool {
        info!(
            "Removing continuous telemetry check {} on {}",
            verification_id, self.config.name
        );
        match self.continuous.remove(verification_id) {
            Some(verification) => {
                self.log_continuous_counts(&verification);
                true
            }
            None => {
                if self.config.remove_continuous_on_fail {
                    error!(
                        "Condition with id {} is not registered! It may have failed earlier in the test.",
                        verification_id
                    );
                } else {
                    error!(
                        "Condition with id {} is not registered! Check your test instructions.",
                        verification_id
                    );
                }
                false
            }
        }
    }

    /// Sweep continuous verifications over MIDs received since the last sweep.
    pub fn check_tlm_conditions(&mut self) -> Result<(), ConditionError> {
        let unchecked = self.telemetry.take_unchecked();
        let ids: Vec<String> = self
            .continuous
            .values()
            .filter(|v| unchecked.contains(&v.mid))
            .map(|v| v.id.clone())
            .collect();

        for id in ids {
            let Some(verification) = self.continuous.get_mut(&id) else {
                continue;
            };
            let history = self.telemetry.history(verification.mid);
            // The first sample after registration is the reference packet.
            if history.len() == 1 {
                verification.last_checked = history[0].count;
                continue;
            }

            let since = verification.last_checked;
            let mut passed = true;
            for packet in history.iter().filter(|p| p.count > since) {
                verification.last_checked = packet.count;
                let Some(payload) = &packet.payload else {
                    continue;
                };
                if !evaluate(payload, &verification.predicates, false) {
                    passed = false;
                    break;
                }
            }

            if passed {
                verification.pass_count += 1;
                continue;
            }

            verification.fail_count += 1;
            error!("Continuous Telemetry Check {} Failed.", id);
            if self.config.remove_continuous_on_fail {
                if let Some(removed) = self.continuous.remove(&id) {
                    self.log_continuous_counts(&removed);
                }
            }
            return Err(ConditionError {
                verification_id: id,
                target: self.config.name.clone(),
            });
        }
        Ok(())
    }

    fn event_predicates(
        &self,
        app: &str,
        id: &Value,
        msg: Option<&str>,
        is_regex: bool,
        msg_args: Option<&Value>,
    ) -> Result<Vec<Predicate>, ControllerError> {
        let id = self.dictionary.macros.expand_value(id)?;
        let mut predicates = vec![
            Predicate::new(EVS_APP_NAME, "streq", json!(app)),
            Predicate::new(EVS_EVENT_ID, "==", id),
        ];
        match msg.filter(|m| !m.is_empty()) {
            Some(msg) => {
                let msg = match msg_args {
                    Some(args) => {
                        let args = parse_msg_args(args)?;
                        if args.is_empty() {
                            msg.to_string()
                        } else {
                            format_message(msg, &args)?
                        }
                    }
                    None => msg.to_string(),
                };
                let compare = if is_regex { "regex" } else { "streq" };
                predicates.push(Predicate::new(EVS_MESSAGE, compare, json!(msg)));
            }
            None => warn!(
                "No msg provided; any message for App {} and Event ID {} will be matched.",
                app,
                display_value(&predicates[1].value.clone().unwrap_or_default())
            ),
        }
        Ok(predicates)
    }

    fn match_event(&mut self, predicates: &[Predicate], ctx: &ExecutionContext) -> bool {
        for mid in [self.evs_short_mid, self.evs_long_mid].into_iter().flatten() {
            if self.check_history(mid, predicates, ctx, false) {
                return true;
            }
        }
        false
    }

    pub fn check_event(
        &mut self,
        app: &str,
        id: &Value,
        msg: Option<&str>,
        is_regex: bool,
        msg_args: Option<&Value>,
        ctx: &ExecutionContext,
    ) -> bool {
        if self.evs_short_mid.is_none() && self.evs_long_mid.is_none() {
            error!("No EVS event MIDs configured for {}", self.config.name);
            return false;
        }
        let predicates = match self.event_predicates(app, id, msg, is_regex, msg_args) {
            Ok(predicates) => predicates,
            Err(e) => {
                error!(
                    "Failed to check Event ID {} in App {} with message: '{}': {}",
                    display_value(id),
                    app,
                    msg.unwrap_or_default(),
                    e
                );
                return false;
            }
        };
        self.match_event(&predicates, ctx)
    }

    /// True only at the last poll, when no matching event was retained.
    pub fn check_no_event(
        &mut self,
        app: &str,
        id: &Value,
        msg: Option<&str>,
        is_regex: bool,
        msg_args: Option<&Value>,
        ctx: &ExecutionContext,
    ) -> bool {
        let predicates = match self.event_predicates(app, id, msg, is_regex, msg_args) {
            Ok(predicates) => predicates,
            Err(e) => {
                error!("Failed to check for no Event ID {} in App {}: {}", display_value(id), app, e);
                return false;
            }
        };
        let matched = self.match_event(&predicates, ctx);
        if ctx.stage != VerificationStage::LastVer {
            return false;
        }
        if matched {
            warn!("Found event for App {} Event ID {}", app, display_value(id));
        }
        !matched
    }

    /// Copy files from `source` modified since the test started into `<log dir>/artifacts`.
    pub async fn archive(&self, source: &Path, since: SystemTime) -> Result<usize, ControllerError> {
        info!("Archiving CFS files from {}", self.config.name);
        let dest = self.log_dir().join("artifacts");
        self.host.archive(source, &dest, since).await
    }

    /// Stop the flight software. The target stays registered and can be restarted.
    pub async fn shutdown_cfs(&mut self) -> bool {
        info!("Shutting down CFS on {}", self.config.name);
        for verification in self.continuous.values() {
            self.log_continuous_counts(verification);
        }
        let result = self.host.stop().await;
        self.running = false;
        result
    }

    /// Release the target at the end of a script.
    pub async fn shutdown(&mut self) {
        info!("Shutting down controller for {}", self.config.name);
        if self.running {
            self.shutdown_cfs().await;
        }
        let log_dir = self.log_dir();
        self.host.finish(&log_dir).await;
        self.command.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ccsds::{CcsdsVersion, TelemetryHeader};
    use crate::config::Config;
    use crate::dictionary::{CommandCode, MacroValue, MessageKind};
    use crate::types::{Endianness, FieldType, Primitive, TypeDefBuilder};

    fn dictionary() -> Dictionary {
        let mut dictionary = Dictionary::default();
        let enable = Arc::new(
            TypeDef::builder("TO_EnableOutput_t", Endianness::Little)
                .field("cDestIp", FieldType::Primitive(Primitive::Char).repeated(16))
                .field("usDestPort", FieldType::Primitive(Primitive::U16))
                .build(),
        );
        let mut codes = BTreeMap::new();
        codes.insert(
            "TO_NOOP_CC".to_string(),
            CommandCode {
                name: "TO_NOOP_CC".into(),
                code: 0,
                arg_type: Arc::new(TypeDef::empty("TO_NoArgs_t", Endianness::Little)),
            },
        );
        codes.insert(
            TO_ENABLE_OUTPUT_CC.to_string(),
            CommandCode {
                name: TO_ENABLE_OUTPUT_CC.into(),
                code: 2,
                arg_type: enable,
            },
        );
        dictionary
            .mids
            .insert(MidEntry {
                name: "TO_CMD_MID".into(),
                mid: 0x1880,
                kind: MessageKind::Command { codes },
            })
            .unwrap();

        let hk = Arc::new(
            TypeDef::builder("TO_HkTlm_t", Endianness::Little)
                .field("usCmdCnt", FieldType::Primitive(Primitive::U16))
                .build(),
        );
        dictionary
            .mids
            .insert(MidEntry {
                name: "TO_HK_TLM_MID".into(),
                mid: 0x0880,
                kind: MessageKind::Telemetry { payload: hk },
            })
            .unwrap();

        let mut packet_id = TypeDefBuilder::new("CFE_EVS_PacketID_t", Endianness::Little);
        packet_id.push_field("AppName", FieldType::Primitive(Primitive::Char).repeated(20));
        packet_id.push_field("EventID", FieldType::Primitive(Primitive::U16));
        let mut body = TypeDefBuilder::new("CFE_EVS_LongEventTlm_Payload_t", Endianness::Little);
        body.push_field("PacketID", FieldType::Struct(Arc::new(packet_id.build())));
        body.push_field("Message", FieldType::Primitive(Primitive::Char).repeated(32));
        let event = Arc::new(
            TypeDef::builder("CFE_EVS_LongEventTlm_t", Endianness::Little)
                .field("Payload", FieldType::Struct(Arc::new(body.build())))
                .build(),
        );
        dictionary
            .mids
            .insert(MidEntry {
                name: "CFE_EVS_LONG_EVENT_MSG_MID".into(),
                mid: 0x0808,
                kind: MessageKind::Telemetry { payload: event },
            })
            .unwrap();
        dictionary
            .macros
            .insert("TO_NOOP_EID", MacroValue::Int(3));
        dictionary
    }

    async fn controller() -> TargetController {
        let config = Config::from_toml(
            "[cfs]\nccsds_data_dir = \".\"\ncfs_run_dir = \".\"\ncfs_exe = \"core\"\nctf_ip = \"127.0.0.1\"\ntlm_udp_port = 0\ncmd_udp_port = 9\n",
        )
        .unwrap()
        .target("cfs")
        .unwrap();
        TargetController::with_dictionary(config, dictionary()).await.unwrap()
    }

    fn tlm(mid: u16, payload: &[u8]) -> Vec<u8> {
        let mut bytes = TelemetryHeader::new(CcsdsVersion::V1, mid, payload.len()).encode();
        bytes.extend_from_slice(payload);
        bytes
    }

    fn event(app: &str, id: u16, msg: &str) -> Vec<u8> {
        let mut payload = vec![0u8; 20 + 2 + 32];
        payload[..app.len()].copy_from_slice(app.as_bytes());
        payload[20..22].copy_from_slice(&id.to_le_bytes());
        payload[22..22 + msg.len()].copy_from_slice(msg.as_bytes());
        tlm(0x0808, &payload)
    }

    fn stage(stage: VerificationStage) -> ExecutionContext {
        let mut ctx = ExecutionContext::new();
        ctx.stage = stage;
        ctx
    }

    #[test]
    fn test_format_message() {
        let args = parse_msg_args(&json!("(5, 'TO', 255)")).unwrap();
        assert_eq!(
            format_message("cnt=%d app=%s mask=0x%04X %%", &args).unwrap(),
            "cnt=5 app=TO mask=0x00FF %"
        );
        assert_eq!(format_message("%.2f", &[json!(1.5)]).unwrap(), "1.50");
        assert!(format_message("%d %d", &[json!(1)]).is_err());
        assert_eq!(parse_msg_args(&json!([1, "a"])).unwrap(), vec![json!(1), json!("a")]);
    }

    #[tokio::test]
    async fn test_encode_noop_and_enable_output() {
        let controller = controller().await;
        let vars = VariableStore::new();
        let noop = controller
            .encode_command(
                &CommandRequest::new(json!("TO_CMD_MID"), json!("TO_NOOP_CC"), json!({})),
                &vars,
            )
            .unwrap();
        assert_eq!((noop.mid, noop.function_code), (0x1880, 0));
        assert!(noop.payload.is_empty());

        let enable = controller
            .encode_command(
                &CommandRequest::new(
                    json!(0x1880),
                    json!(TO_ENABLE_OUTPUT_CC),
                    json!({"cDestIp": "127.0.0.1", "usDestPort": "0x1388"}),
                ),
                &vars,
            )
            .unwrap();
        assert_eq!(enable.function_code, 2);
        assert_eq!(&enable.payload[..9], b"127.0.0.1");
        assert_eq!(&enable.payload[16..], &[0x88, 0x13]);
    }

    #[tokio::test]
    async fn test_encode_payload_variants_and_header() {
        let controller = controller().await;
        let mut vars = VariableStore::new();
        vars.set("seq", "=", &json!(9));

        let sized = CommandRequest {
            payload: PayloadSpec::Sized {
                args: json!([]),
                length: 4,
            },
            header: Some(json!({"pheader": {"sequence_count": "$seq$"}})),
            ..CommandRequest::new(json!("TO_CMD_MID"), json!(TO_ENABLE_OUTPUT_CC), json!({}))
        };
        let encoded = controller.encode_command(&sized, &vars).unwrap();
        assert_eq!(encoded.payload, vec![0; 4]);
        assert_eq!(encoded.overrides, vec![HeaderOverride::new("pheader.sequence_count", 9)]);

        let raw = CommandRequest {
            payload: PayloadSpec::Raw(vec![0xAB, 0xCD, 0xEF]),
            ..CommandRequest::new(json!("TO_CMD_MID"), json!(TO_ENABLE_OUTPUT_CC), json!({}))
        };
        assert_eq!(
            controller.encode_command(&raw, &vars).unwrap().payload,
            vec![0xAB, 0xCD, 0xEF]
        );

        let bare = CommandRequest::new(json!("TO_CMD_MID"), json!(7), json!({}));
        assert_eq!(controller.encode_command(&bare, &vars).unwrap().function_code, 7);

        let unknown = CommandRequest::new(json!("TO_CMD_MID"), json!("NOPE_CC"), json!({}));
        assert!(matches!(
            controller.encode_command(&unknown, &vars),
            Err(ControllerError::UnknownCommandCode { .. })
        ));
        let list = CommandRequest::new(
            json!("TO_CMD_MID"),
            json!(TO_ENABLE_OUTPUT_CC),
            json!({"usDestPort": [1, 2]}),
        );
        assert!(controller.encode_command(&list, &vars).is_err());
    }

    #[tokio::test]
    async fn test_check_tlm_value_clears_history() {
        let mut controller = controller().await;
        let dictionary = controller.dictionary().clone();
        controller
            .telemetry_mut()
            .ingest(&tlm(0x0880, &[1, 0]), &dictionary, 0.0);

        let ctx = stage(VerificationStage::FirstVer);
        let predicates = vec![Predicate::new("usCmdCnt", "==", json!(1))];
        assert!(controller.check_tlm_value(&json!("TO_HK_TLM_MID"), &predicates, &ctx));
        assert!(controller.telemetry().history(0x0880).is_empty());
        assert!(!controller.check_tlm_value(&json!("TO_HK_TLM_MID"), &predicates, &ctx));
        assert!(!controller.check_tlm_value(&json!("UNKNOWN_MID"), &predicates, &ctx));
    }

    #[tokio::test]
    async fn test_continuous_check_fails_and_deregisters() {
        let mut controller = controller().await;
        let dictionary = controller.dictionary().clone();
        let predicates = vec![Predicate::new("usCmdCnt", "<", json!(5))];

        assert!(!controller.check_tlm_continuous("hk", &json!("TO_HK_TLM_MID"), &predicates));
        controller
            .telemetry_mut()
            .ingest(&tlm(0x0880, &[1, 0]), &dictionary, 0.0);
        assert!(controller.check_tlm_continuous("hk", &json!("TO_HK_TLM_MID"), &predicates));
        assert!(!controller.check_tlm_continuous("hk", &json!("TO_HK_TLM_MID"), &predicates));

        controller.check_tlm_conditions().unwrap();
        controller
            .telemetry_mut()
            .ingest(&tlm(0x0880, &[2, 0]), &dictionary, 0.1);
        controller.check_tlm_conditions().unwrap();
        assert_eq!(controller.continuous_verification("hk").unwrap().pass_count, 1);

        controller
            .telemetry_mut()
            .ingest(&tlm(0x0880, &[9, 0]), &dictionary, 0.2);
        let err = controller.check_tlm_conditions().unwrap_err();
        assert_eq!(err.verification_id, "hk");
        assert!(controller.continuous_verification("hk").is_none());
        assert!(!controller.remove_check_tlm_continuous("hk"));
    }

    #[tokio::test]
    async fn test_check_event_and_no_event() {
        let mut controller = controller().await;
        let dictionary = controller.dictionary().clone();
        let first = stage(VerificationStage::FirstVer);
        let last = stage(VerificationStage::LastVer);

        assert!(!controller.check_no_event("TO", &json!(3), None, false, None, &first));
        assert!(controller.check_no_event("TO", &json!(3), None, false, None, &last));

        controller.telemetry_mut().ingest(
            &event("TO", 3, "TO - NOOP cmd 5"),
            &dictionary,
            0.0,
        );
        assert!(controller.check_event(
            "TO",
            &json!("#TO_NOOP_EID#"),
            Some("TO - NOOP cmd %d"),
            false,
            Some(&json!("(5,)")),
            &first
        ));
        assert!(controller.check_event("TO", &json!(3), Some("^TO - NOOP"), true, None, &first));
        assert!(!controller.check_event("CI", &json!(3), None, false, None, &first));
        assert!(!controller.check_no_event("TO", &json!(3), None, false, None, &last));
    }

    #[tokio::test]
    async fn test_check_no_tlm_packet() {
        let mut controller = controller().await;
        let dictionary = controller.dictionary().clone();
        let first = stage(VerificationStage::FirstVer);
        let last = stage(VerificationStage::LastVer);
        let predicates = vec![Predicate::new("usCmdCnt", "==", json!(1))];
        let mid = json!("TO_HK_TLM_MID");

        assert!(!controller.check_no_tlm_packet(&mid, &predicates, &first));
        assert!(controller.check_no_tlm_packet(&mid, &predicates, &last));

        controller
            .telemetry_mut()
            .ingest(&tlm(0x0880, &[2, 0]), &dictionary, 0.0);
        assert!(controller.check_no_tlm_packet(&mid, &predicates, &last));
        assert!(controller.telemetry().history(0x0880).is_empty());

        controller
            .telemetry_mut()
            .ingest(&tlm(0x0880, &[1, 0]), &dictionary, 0.0);
        assert!(!controller.check_no_tlm_packet(&mid, &predicates, &first));
        assert!(!controller.check_no_tlm_packet(&mid, &predicates, &last));
        assert!(controller.telemetry().history(0x0880).is_empty());
        assert!(!controller.check_no_tlm_packet(&json!("UNKNOWN_MID"), &predicates, &last));
    }

    #[tokio::test]
    async fn test_single_poll_ignores_packets_before_window() {
        let mut controller = controller().await;
        let dictionary = controller.dictionary().clone();
        let predicates = vec![Predicate::new("usCmdCnt", "==", json!(1))];
        let mid = json!("TO_HK_TLM_MID");
        let mut only_poll = stage(VerificationStage::LastVer);
        only_poll.first_poll = true;
        only_poll.exec_time = 5.0;
        only_poll.verification_start_time = 5.0;

        controller
            .telemetry_mut()
            .ingest(&tlm(0x0880, &[1, 0]), &dictionary, 0.0);
        assert!(!controller.check_tlm_value(&mid, &predicates, &only_poll));
        assert!(controller.telemetry().history(0x0880).is_empty());

        controller
            .telemetry_mut()
            .ingest(&tlm(0x0880, &[1, 0]), &dictionary, 0.0);
        assert!(controller.check_no_tlm_packet(&mid, &predicates, &only_poll));

        controller
            .telemetry_mut()
            .ingest(&tlm(0x0880, &[1, 0]), &dictionary, 5.0);
        assert!(controller.check_tlm_value(&mid, &predicates, &only_poll));
    }
}
