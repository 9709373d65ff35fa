//! Data dictionary: message IDs, command codes, payload types and macros.
//!
//! A [`Dictionary`] is loaded once per target from a directory of JSON exports
//! (see [`reader`]) and is read-only afterwards.

pub mod reader;

pub use reader::{DictionaryReader, ReaderOptions};

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ControllerError, DictionaryError};
use crate::types::TypeDef;

/// A named constant usable in script arguments as `#NAME#`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MacroValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl MacroValue {
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(flag) => Some(MacroValue::Bool(*flag)),
            Value::Number(number) => number
                .as_i64()
                .map(MacroValue::Int)
                .or_else(|| number.as_u64().map(|v| MacroValue::Int(v as i64)))
                .or_else(|| number.as_f64().map(MacroValue::Float)),
            Value::String(text) => Some(MacroValue::Text(text.clone())),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            MacroValue::Int(v) => Some(*v),
            MacroValue::Bool(flag) => Some(i64::from(*flag)),
            MacroValue::Text(text) => {
                crate::types::payload::parse_int(text).and_then(|v| i64::try_from(v).ok())
            }
            MacroValue::Float(_) => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            MacroValue::Int(v) => Value::from(*v),
            MacroValue::Float(v) => Value::from(*v),
            MacroValue::Bool(flag) => Value::Bool(*flag),
            MacroValue::Text(text) => Value::String(text.clone()),
        }
    }
}

impl fmt::Display for MacroValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MacroValue::Int(v) => write!(f, "{}", v),
            MacroValue::Float(v) => write!(f, "{}", v),
            MacroValue::Bool(flag) => write!(f, "{}", flag),
            MacroValue::Text(text) => write!(f, "{}", text),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandCode {
    pub name: String,
    pub code: u8,
    pub arg_type: Arc<TypeDef>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageKind {
    Command {
        codes: BTreeMap<String, CommandCode>,
    },
    Telemetry {
        payload: Arc<TypeDef>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct MidEntry {
    pub name: String,
    pub mid: u16,
    pub kind: MessageKind,
}

impl MidEntry {
    pub fn is_command(&self) -> bool {
        matches!(self.kind, MessageKind::Command { .. })
    }

    pub fn payload_type(&self) -> Option<&Arc<TypeDef>> {
        match &self.kind {
            MessageKind::Telemetry { payload } => Some(payload),
            MessageKind::Command { .. } => None,
        }
    }

    pub fn command_code(&self, name: &str) -> Option<&CommandCode> {
        match &self.kind {
            MessageKind::Command { codes } => codes.get(name),
            MessageKind::Telemetry { .. } => None,
        }
    }

    pub fn command_by_value(&self, code: u8) -> Option<&CommandCode> {
        match &self.kind {
            MessageKind::Command { codes } => codes.values().find(|cc| cc.code == code),
            MessageKind::Telemetry { .. } => None,
        }
    }
}

/// MID name to message description. Names and numeric values are both unique.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MidMap {
    entries: BTreeMap<String, MidEntry>,
    by_value: HashMap<u16, String>,
}

impl MidMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: MidEntry) -> Result<(), DictionaryError> {
        if self.entries.contains_key(&entry.name) {
            return Err(DictionaryError::DuplicateMidName(entry.name));
        }
        if let Some(first) = self.by_value.get(&entry.mid) {
            return Err(DictionaryError::DuplicateMidValue {
                value: entry.mid,
                first: first.clone(),
                second: entry.name,
            });
        }
        self.by_value.insert(entry.mid, entry.name.clone());
        self.entries.insert(entry.name.clone(), entry);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&MidEntry> {
        self.entries.get(name)
    }

    pub fn by_value(&self, mid: u16) -> Option<&MidEntry> {
        self.by_value.get(&mid).and_then(|name| self.entries.get(name))
    }

    pub fn contains_value(&self, mid: u16) -> bool {
        self.by_value.contains_key(&mid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MidEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Union of two maps. Shared names must carry identical entries.
    pub fn merge(mut self, other: MidMap) -> Result<Self, DictionaryError> {
        for (name, entry) in other.entries {
            match self.entries.get(&name) {
                Some(existing) if *existing == entry => {}
                Some(_) => return Err(DictionaryError::MergeConflict(name)),
                None => {
                    if let Some(first) = self.by_value.get(&entry.mid) {
                        return Err(DictionaryError::DuplicateMidValue {
                            value: entry.mid,
                            first: first.clone(),
                            second: name,
                        });
                    }
                    self.by_value.insert(entry.mid, name.clone());
                    self.entries.insert(name, entry);
                }
            }
        }
        Ok(self)
    }
}

fn macro_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"#(\w+)#?").expect("macro regex is valid"))
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MacroMap {
    values: BTreeMap<String, MacroValue>,
}

impl MacroMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: MacroValue) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&MacroValue> {
        self.values.get(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &MacroValue)> {
        self.values.iter()
    }

    pub fn merge(mut self, other: MacroMap) -> Result<Self, DictionaryError> {
        for (name, value) in other.values {
            match self.values.get(&name) {
                Some(existing) if *existing == value => {}
                Some(_) => return Err(DictionaryError::MergeConflict(name)),
                None => {
                    self.values.insert(name, value);
                }
            }
        }
        Ok(self)
    }

    pub fn contains_macro(text: &str) -> bool {
        macro_pattern().is_match(text)
    }

    /// Replace every `#NAME#` (or open `#NAME`) with the macro's value.
    pub fn expand(&self, text: &str) -> Result<String, ControllerError> {
        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for caps in macro_pattern().captures_iter(text) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let value = self
                .values
                .get(name.as_str())
                .ok_or_else(|| ControllerError::UnknownMacro {
                    macro_name: name.as_str().to_string(),
                    arg: text.to_string(),
                })?;
            out.push_str(&text[last..whole.start()]);
            out.push_str(&value.to_string());
            last = whole.end();
        }
        out.push_str(&text[last..]);
        Ok(out)
    }

    /// Expand a whole JSON string value. A string that is exactly one macro keeps the macro's type.
    pub fn expand_value(&self, value: &Value) -> Result<Value, ControllerError> {
        match value {
            Value::String(text) if Self::contains_macro(text) => {
                if let Some(caps) = macro_pattern().captures(text) {
                    let whole = caps.get(0).map_or("", |m| m.as_str());
                    if whole.len() == text.trim().len() {
                        let name = caps.get(1).map_or("", |m| m.as_str());
                        if let Some(found) = self.values.get(name) {
                            return Ok(found.to_json());
                        }
                    }
                }
                Ok(Value::String(self.expand(text)?))
            }
            Value::Array(items) => items
                .iter()
                .map(|item| self.expand_value(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = serde_json::Map::new();
                for (key, item) in map {
                    out.insert(key.clone(), self.expand_value(item)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }
}

/// Everything loaded from one target's dictionary directories.
#[derive(Debug, Clone, Default)]
pub struct Dictionary {
    pub mids: MidMap,
    pub macros: MacroMap,
}

impl Dictionary {
    pub fn load(dir: &Path, options: &ReaderOptions) -> Result<Self, DictionaryError> {
        DictionaryReader::new(options.clone()).read_dir(dir)
    }

    /// Load several directories (base set first, then overlays) and merge them.
    pub fn load_all<P: AsRef<Path>>(
        dirs: &[P],
        options: &ReaderOptions,
    ) -> Result<Self, DictionaryError> {
        let mut merged = Dictionary::default();
        for dir in dirs {
            let loaded = Self::load(dir.as_ref(), options)?;
            merged = merged.merge(loaded)?;
        }
        Ok(merged)
    }

    pub fn merge(self, other: Dictionary) -> Result<Self, DictionaryError> {
        Ok(Self {
            mids: self.mids.merge(other.mids)?,
            macros: self.macros.merge(other.macros)?,
        })
    }

    /// Resolve a MID given as a name, a number, a hex string or a macro.
    pub fn resolve_mid(&self, mid: &Value) -> Result<&MidEntry, ControllerError> {
        let unknown = || ControllerError::UnknownMid(mid.to_string());
        match mid {
            Value::String(text) => {
                let text = if MacroMap::contains_macro(text) {
                    self.macros.expand(text)?
                } else {
                    text.clone()
                };
                if let Some(entry) = self.mids.get(text.trim()) {
                    return Ok(entry);
                }
                let value = crate::types::payload::parse_int(&text).ok_or_else(unknown)?;
                let value = u16::try_from(value).map_err(|_| unknown())?;
                self.mids.by_value(value).ok_or_else(unknown)
            }
            Value::Number(number) => {
                let value = number
                    .as_u64()
                    .and_then(|v| u16::try_from(v).ok())
                    .ok_or_else(unknown)?;
                self.mids.by_value(value).ok_or_else(unknown)
            }
            _ => Err(unknown()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Endianness, TypeDef};
    use serde_json::json;

    fn telemetry(name: &str, mid: u16) -> MidEntry {
        MidEntry {
            name: name.to_string(),
            mid,
            kind: MessageKind::Telemetry {
                payload: Arc::new(TypeDef::empty(format!("{}_t", name), Endianness::Little)),
            },
        }
    }

    #[test]
    fn test_mid_map_rejects_duplicates() {
        let mut map = MidMap::new();
        map.insert(telemetry("TO_HK_TLM_MID", 0x0880)).unwrap();
        assert!(matches!(
            map.insert(telemetry("TO_HK_TLM_MID", 0x0881)),
            Err(DictionaryError::DuplicateMidName(_))
        ));
        assert!(matches!(
            map.insert(telemetry("OTHER_MID", 0x0880)),
            Err(DictionaryError::DuplicateMidValue { value: 0x0880, .. })
        ));
        assert_eq!(map.by_value(0x0880).map(|e| e.name.as_str()), Some("TO_HK_TLM_MID"));
    }

    #[test]
    fn test_merge_unifies_identical_and_rejects_conflicts() {
        let mut base = MidMap::new();
        base.insert(telemetry("A_MID", 1)).unwrap();
        let mut overlay = MidMap::new();
        overlay.insert(telemetry("A_MID", 1)).unwrap();
        overlay.insert(telemetry("B_MID", 2)).unwrap();
        let merged = base.clone().merge(overlay).unwrap();
        assert_eq!(merged.len(), 2);

        let mut conflicting = MidMap::new();
        conflicting.insert(telemetry("A_MID", 3)).unwrap();
        assert!(matches!(
            base.merge(conflicting),
            Err(DictionaryError::MergeConflict(name)) if name == "A_MID"
        ));
    }

    #[test]
    fn test_macro_expansion() {
        let mut macros = MacroMap::new();
        macros.insert("TO_NOOP_CC", MacroValue::Int(0));
        macros.insert("NAME", MacroValue::Text("TO_LAB".into()));

        assert_eq!(macros.expand("#TO_NOOP_CC#").unwrap(), "0");
        assert_eq!(macros.expand("app #NAME# ok").unwrap(), "app TO_LAB ok");
        assert_eq!(macros.expand("#NAME").unwrap(), "TO_LAB");
        assert!(matches!(
            macros.expand("#MISSING#"),
            Err(ControllerError::UnknownMacro { .. })
        ));
        assert_eq!(macros.expand_value(&json!("#TO_NOOP_CC#")).unwrap(), json!(0));
    }

    #[test]
    fn test_resolve_mid_by_name_number_and_hex() {
        let mut dictionary = Dictionary::default();
        dictionary.mids.insert(telemetry("TO_HK_TLM_MID", 0x0880)).unwrap();
        dictionary
            .macros
            .insert("HK", MacroValue::Text("TO_HK_TLM_MID".into()));

        for mid in [json!("TO_HK_TLM_MID"), json!(0x0880), json!("0x880"), json!("#HK#")] {
            assert_eq!(dictionary.resolve_mid(&mid).unwrap().mid, 0x0880);
        }
        assert!(dictionary.resolve_mid(&json!("NOPE")).is_err());
    }
}
