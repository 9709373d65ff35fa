//! Loader for JSON dictionary exports.
//!
//! Files are classified by their keys: `cmd_mid_name` (command message), `tlm_mid_name`
//! (telemetry message), `data_type` (reusable record type) or a top level array (aliases,
//! constants and MID tables). Loading runs in four passes so files may reference types
//! defined in other files:
//!
//! 1. tables: primitive aliases, constants, MID tables (custom-type aliases are deferred)
//! 2. reusable record types, repeated until every cross reference resolves
//! 3. command and telemetry messages
//! 4. deferred aliases

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use super::{CommandCode, Dictionary, MacroMap, MacroValue, MessageKind, MidEntry, MidMap};
use crate::error::DictionaryError;
use crate::types::payload::parse_int;
use crate::types::{Endianness, FieldType, Primitive, TypeDef, TypeDefBuilder};

#[derive(Debug, Clone, Default)]
pub struct ReaderOptions {
    pub endianness: Endianness,
    /// Only MID tables whose `target` matches are used. Empty accepts every table.
    pub ccsds_target: String,
    pub log_imports: bool,
}

enum DictFile {
    Command(Map<String, Value>),
    Telemetry(Map<String, Value>),
    DataType(Map<String, Value>),
    Table(Vec<Value>),
}

impl DictFile {
    fn classify(value: Value) -> Option<Self> {
        match value {
            Value::Array(items) => Some(DictFile::Table(items)),
            Value::Object(map) => {
                if map.get("cmd_mid_name").is_some_and(|v| !v.is_null()) {
                    Some(DictFile::Command(map))
                } else if map.get("tlm_mid_name").is_some_and(|v| !v.is_null()) {
                    Some(DictFile::Telemetry(map))
                } else if map.contains_key("data_type") {
                    Some(DictFile::DataType(map))
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}

fn text_of(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn integer_of(value: &Value) -> Option<i128> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .map(i128::from)
            .or_else(|| number.as_u64().map(i128::from)),
        Value::String(text) => parse_int(text),
        _ => None,
    }
}

/// Every `*.json` under `dir`, sorted for a stable load order.
fn collect_json_files(dir: &Path) -> Result<Vec<PathBuf>, DictionaryError> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let entries = fs::read_dir(&current).map_err(|source| DictionaryError::Io {
            path: current.clone(),
            source,
        })?;
        for entry in entries {
            let path = entry
                .map_err(|source| DictionaryError::Io {
                    path: current.clone(),
                    source,
                })?
                .path();
            if path.is_dir() {
                pending.push(path);
            } else if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

fn read_json(path: &Path) -> Result<Value, DictionaryError> {
    let text = fs::read_to_string(path).map_err(|source| DictionaryError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| DictionaryError::Json {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug)]
pub struct DictionaryReader {
    options: ReaderOptions,
    mids: BTreeMap<String, u16>,
    mid_names: HashMap<u16, String>,
    types: HashMap<String, FieldType>,
    constants: HashMap<String, MacroValue>,
    deferred_aliases: Vec<(String, String, PathBuf)>,
    macros: MacroMap,
    mid_map: MidMap,
}

impl DictionaryReader {
    pub fn new(options: ReaderOptions) -> Self {
        Self {
            options,
            mids: BTreeMap::new(),
            mid_names: HashMap::new(),
            types: HashMap::new(),
            constants: HashMap::new(),
            deferred_aliases: Vec::new(),
            macros: MacroMap::new(),
            mid_map: MidMap::new(),
        }
    }

    pub fn read_dir(mut self, dir: &Path) -> Result<Dictionary, DictionaryError> {
        let mut tables = Vec::new();
        let mut data_types = Vec::new();
        let mut messages = Vec::new();

        for path in collect_json_files(dir)? {
            let value = match read_json(&path) {
                Ok(value) => value,
                Err(e) => {
                    error!("Invalid dictionary file, skipping: {}", e);
                    continue;
                }
            };
            match DictFile::classify(value) {
                Some(DictFile::Table(items)) => tables.push((path, items)),
                Some(DictFile::DataType(map)) => data_types.push((path, map)),
                Some(file @ (DictFile::Command(_) | DictFile::Telemetry(_))) => {
                    messages.push((path, file));
                }
                None => warn!("Unrecognized dictionary file {}", path.display()),
            }
        }

        for (path, items) in &tables {
            self.process_table(path, items)?;
        }
        self.process_data_types(data_types)?;
        for (path, file) in messages {
            if self.options.log_imports {
                info!("Processing {}", path.display());
            }
            match file {
                DictFile::Command(map) => self.process_command(&path, &map)?,
                DictFile::Telemetry(map) => self.process_telemetry(&path, &map)?,
                _ => {}
            }
        }
        self.resolve_deferred_aliases();

        for (name, value) in &self.constants {
            self.macros.insert(name.clone(), value.clone());
        }
        for entry in self.mid_map.iter() {
            self.macros
                .insert(entry.name.clone(), MacroValue::Int(i64::from(entry.mid)));
        }

        debug!(
            "Loaded {} MIDs and {} macros from {}",
            self.mid_map.len(),
            self.macros.len(),
            dir.display()
        );
        Ok(Dictionary {
            mids: self.mid_map,
            macros: self.macros,
        })
    }

    fn add_mid(&mut self, name: &str, value: u16) -> Result<(), DictionaryError> {
        match self.mids.get(name) {
            Some(existing) if *existing == value => return Ok(()),
            Some(_) => return Err(DictionaryError::DuplicateMidName(name.to_string())),
            None => {}
        }
        if let Some(first) = self.mid_names.get(&value) {
            return Err(DictionaryError::DuplicateMidValue {
                value,
                first: first.clone(),
                second: name.to_string(),
            });
        }
        self.mids.insert(name.to_string(), value);
        self.mid_names.insert(value, name.to_string());
        Ok(())
    }

    fn process_table(&mut self, path: &Path, items: &[Value]) -> Result<(), DictionaryError> {
        for item in items {
            let Some(entry) = item.as_object() else {
                error!("Invalid type definition in {}", path.display());
                continue;
            };

            if let Some(alias) = text_of(entry.get("alias_name")) {
                let actual = text_of(entry.get("actual_name")).unwrap_or_default();
                match Primitive::from_name(&actual) {
                    Some(primitive) => {
                        self.types.insert(alias, FieldType::Primitive(primitive));
                    }
                    None => self
                        .deferred_aliases
                        .push((alias, actual, path.to_path_buf())),
                }
            } else if let Some(name) = text_of(entry.get("constant_name")) {
                let value = entry
                    .get("constant_value")
                    .and_then(MacroValue::from_json)
                    .map(|value| match &value {
                        MacroValue::Text(text) => parse_int(text)
                            .and_then(|v| i64::try_from(v).ok())
                            .map_or(value.clone(), MacroValue::Int),
                        _ => value,
                    });
                match value {
                    Some(value) => {
                        self.constants.insert(name, value);
                    }
                    None => error!("Constant {} in {} has no value", name, path.display()),
                }
            } else if let Some(target) = text_of(entry.get("target")) {
                if !self.options.ccsds_target.is_empty() && target != self.options.ccsds_target {
                    continue;
                }
                let mids = entry
                    .get("mids")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                if self.options.log_imports {
                    info!("Found {} MIDs for {}", mids.len(), target);
                }
                for mid in &mids {
                    let name = text_of(mid.get("mid_name")).unwrap_or_default();
                    let raw = mid.get("mid_value").cloned().unwrap_or(Value::Null);
                    let value = integer_of(&raw)
                        .and_then(|v| u16::try_from(v).ok())
                        .ok_or_else(|| DictionaryError::InvalidMidValue {
                            name: name.clone(),
                            value: raw.to_string(),
                        })?;
                    self.add_mid(&name, value)?;
                }
            } else {
                error!("Invalid type definition in {}", path.display());
            }
        }
        Ok(())
    }

    fn process_data_types(
        &mut self,
        mut pending: Vec<(PathBuf, Map<String, Value>)>,
    ) -> Result<(), DictionaryError> {
        while !pending.is_empty() {
            let mut unresolved = Vec::new();
            let mut last_error = None;
            let before = pending.len();

            for (path, map) in pending {
                let name = text_of(map.get("data_type")).unwrap_or_default();
                if self.types.contains_key(&name) {
                    warn!("Data type {} already defined, ignoring {}", name, path.display());
                    continue;
                }
                let params = map
                    .get("parameters")
                    .and_then(Value::as_array)
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                match self.build_struct(&name, params) {
                    Ok(def) => {
                        if self.options.log_imports {
                            info!("Added data type {}", name);
                        }
                        self.types
                            .insert(name, FieldType::Struct(Arc::new(def)));
                    }
                    Err(e @ DictionaryError::UnknownType { .. }) => {
                        last_error = Some(e);
                        unresolved.push((path, map));
                    }
                    Err(e) => return Err(e),
                }
            }

            if unresolved.len() == before {
                if let Some(e) = last_error {
                    return Err(e);
                }
            }
            pending = unresolved;
        }
        Ok(())
    }

    /// Build a record from a parameter list. Enumeration labels become macros.
    fn build_struct(&mut self, name: &str, params: &[Value]) -> Result<TypeDef, DictionaryError> {
        let mut builder = TypeDefBuilder::new(name, self.options.endianness);

        for param in params {
            let Some(param) = param.as_object() else {
                continue;
            };
            let field_name = text_of(param.get("name")).unwrap_or_default();
            if field_name.is_empty() {
                continue;
            }
            if builder.contains(&field_name) {
                warn!("Field {} repeated in {}, ignoring", field_name, name);
                continue;
            }
            let type_name = text_of(param.get("data_type")).unwrap_or_default();

            let nested = param
                .get("parameters")
                .and_then(Value::as_array)
                .filter(|inner| !inner.is_empty());
            let base = match nested {
                Some(inner) => FieldType::Struct(Arc::new(self.build_struct(&type_name, inner)?)),
                None => self.resolve_type(&type_name, &field_name)?,
            };

            let array_len = self.array_len(param.get("array_size"), &field_name)?;
            let bits = Self::bit_length(param.get("bit_length"), &field_name)?;

            match (bits, array_len) {
                (Some(width), None) => {
                    let FieldType::Primitive(storage) = base else {
                        return Err(DictionaryError::InvalidBitLength {
                            bits: width.to_string(),
                            field: field_name,
                        });
                    };
                    builder.push_bitfield(field_name.clone(), storage, width)?;
                }
                (Some(width), Some(_)) => {
                    return Err(DictionaryError::InvalidBitLength {
                        bits: width.to_string(),
                        field: field_name,
                    });
                }
                (None, Some(len)) => builder.push_field(field_name.clone(), base.repeated(len)),
                (None, None) => builder.push_field(field_name.clone(), base),
            }

            self.collect_enumeration(param.get("enumeration"));
        }

        Ok(builder.build())
    }

    fn resolve_type(&self, type_name: &str, field: &str) -> Result<FieldType, DictionaryError> {
        if let Some(found) = self.types.get(type_name) {
            return Ok(found.clone());
        }
        Primitive::from_name(type_name)
            .map(FieldType::Primitive)
            .ok_or_else(|| DictionaryError::UnknownType {
                type_name: type_name.to_string(),
                field: field.to_string(),
            })
    }

    fn array_len(&self, raw: Option<&Value>, field: &str) -> Result<Option<usize>, DictionaryError> {
        let invalid = |size: String| DictionaryError::InvalidArraySize {
            size,
            field: field.to_string(),
        };
        let len = match raw {
            None | Some(Value::Null) => return Ok(None),
            Some(Value::Number(number)) => number
                .as_u64()
                .ok_or_else(|| invalid(number.to_string()))?,
            Some(Value::String(text)) => {
                let text = text.trim();
                if text.is_empty() || text == "None" {
                    return Ok(None);
                }
                if text.chars().all(|c| c.is_ascii_digit()) {
                    text.parse::<u64>().map_err(|_| invalid(text.to_string()))?
                } else {
                    self.constants
                        .get(text)
                        .and_then(MacroValue::as_int)
                        .and_then(|v| u64::try_from(v).ok())
                        .ok_or_else(|| invalid(text.to_string()))?
                }
            }
            Some(other) => return Err(invalid(other.to_string())),
        };
        if len == 0 {
            return Ok(None);
        }
        usize::try_from(len)
            .map(Some)
            .map_err(|_| invalid(len.to_string()))
    }

    fn bit_length(raw: Option<&Value>, field: &str) -> Result<Option<u8>, DictionaryError> {
        let invalid = |bits: String| DictionaryError::InvalidBitLength {
            bits,
            field: field.to_string(),
        };
        let bits = match raw {
            None | Some(Value::Null) => return Ok(None),
            Some(Value::Number(number)) => number.as_u64().ok_or_else(|| invalid(number.to_string()))?,
            Some(Value::String(text)) => {
                let text = text.trim();
                if text.is_empty() || text == "None" {
                    return Ok(None);
                }
                text.parse::<u64>().map_err(|_| invalid(text.to_string()))?
            }
            Some(other) => return Err(invalid(other.to_string())),
        };
        if bits == 0 {
            return Ok(None);
        }
        u8::try_from(bits)
            .map(Some)
            .map_err(|_| invalid(bits.to_string()))
    }

    fn collect_enumeration(&mut self, raw: Option<&Value>) {
        let list = match raw {
            Some(Value::Array(list)) => list,
            Some(Value::Object(map)) => match map.get("definition") {
                Some(Value::Array(list)) => list,
                _ => return,
            },
            _ => return,
        };
        for item in list {
            let Some(label) = text_of(item.get("label")) else {
                continue;
            };
            let value = item.get("value").and_then(MacroValue::from_json).map(|value| {
                match &value {
                    MacroValue::Text(text) => parse_int(text)
                        .and_then(|v| i64::try_from(v).ok())
                        .map_or(value.clone(), MacroValue::Int),
                    _ => value,
                }
            });
            if let Some(value) = value {
                if self.options.log_imports {
                    info!("Added Enumeration {}:{}", label, value);
                }
                self.macros.insert(label, value);
            }
        }
    }

    fn message_type(
        &mut self,
        type_name: &str,
        params: &[Value],
    ) -> Result<Arc<TypeDef>, DictionaryError> {
        if params.is_empty() {
            if let Some(FieldType::Struct(existing)) = self.types.get(type_name) {
                return Ok(Arc::clone(existing));
            }
        }
        Ok(Arc::new(self.build_struct(type_name, params)?))
    }

    fn process_command(&mut self, path: &Path, map: &Map<String, Value>) -> Result<(), DictionaryError> {
        let mid_name = text_of(map.get("cmd_mid_name")).unwrap_or_default();

        let mut raw_codes: Vec<(String, Value, String, Vec<Value>)> = Vec::new();
        if let Some(codes) = map.get("cmd_codes").and_then(Value::as_array) {
            for cc in codes {
                let name = text_of(cc.get("cc_name")).unwrap_or_default();
                let value = cc.get("cc_value").cloned().unwrap_or(Value::Null);
                let type_name = text_of(cc.get("cc_data_type")).unwrap_or_else(|| name.clone());
                let params = cc
                    .get("cc_parameters")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                raw_codes.push((name, value, type_name, params));
            }
        } else if let Some(params) = map.get("cmd_parameters").and_then(Value::as_array) {
            let type_name = text_of(map.get("cmd_data_type")).unwrap_or_else(|| mid_name.clone());
            raw_codes.push((String::new(), Value::from(0), type_name, params.clone()));
        }

        let mut codes = BTreeMap::new();
        for (name, value, type_name, params) in raw_codes {
            let code = integer_of(&value)
                .and_then(|v| u8::try_from(v).ok())
                .ok_or_else(|| DictionaryError::InvalidCommandCode {
                    name: name.clone(),
                    value: value.to_string(),
                })?;
            let arg_type = self.message_type(&type_name, &params)?;
            if !name.is_empty() {
                self.macros.insert(name.clone(), MacroValue::Int(i64::from(code)));
            }
            codes.insert(
                name.clone(),
                CommandCode {
                    name,
                    code,
                    arg_type,
                },
            );
        }

        let Some(mid) = self.mids.get(&mid_name).copied() else {
            warn!(
                "Unknown MID name {} in {}. Skipping this message",
                mid_name,
                path.display()
            );
            return Ok(());
        };
        if self.options.log_imports {
            info!("Added Command Message {} with MID {:#06x}", mid_name, mid);
        }
        self.mid_map.insert(MidEntry {
            name: mid_name,
            mid,
            kind: MessageKind::Command { codes },
        })
    }

    fn process_telemetry(&mut self, path: &Path, map: &Map<String, Value>) -> Result<(), DictionaryError> {
        let mid_name = text_of(map.get("tlm_mid_name")).unwrap_or_default();
        let type_name = text_of(map.get("tlm_data_type")).unwrap_or_else(|| mid_name.clone());
        let params = map
            .get("tlm_parameters")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let payload = self.message_type(&type_name, &params)?;
        self.types
            .entry(type_name.clone())
            .or_insert_with(|| FieldType::Struct(Arc::clone(&payload)));

        let Some(mid) = self.mids.get(&mid_name).copied() else {
            warn!(
                "Unknown MID name {} in {}. Skipping this message",
                mid_name,
                path.display()
            );
            return Ok(());
        };
        if self.options.log_imports {
            info!("Added Telemetry Message {}:{} with MID {:#06x}", type_name, mid_name, mid);
        }
        self.mid_map.insert(MidEntry {
            name: mid_name,
            mid,
            kind: MessageKind::Telemetry { payload },
        })
    }

    fn resolve_deferred_aliases(&mut self) {
        for (alias, actual, path) in std::mem::take(&mut self.deferred_aliases) {
            match self.types.get(&actual).cloned() {
                Some(FieldType::Struct(def)) => {
                    self.types
                        .insert(alias.clone(), FieldType::Struct(Arc::new(def.renamed(alias))));
                }
                Some(found) => {
                    self.types.insert(alias, found);
                }
                None => error!(
                    "Unknown type name {} for alias {} in {}",
                    actual,
                    alias,
                    path.display()
                ),
            }
        }
    }

    /// Type lookup after loading, including aliases resolved in the last pass.
    pub fn type_named(&self, name: &str) -> Option<&FieldType> {
        self.types.get(name)
    }
}
