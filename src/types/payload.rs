use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Number, Value};

use super::{Bitfield, Endianness, FieldType, Primitive, TypeDef};
use crate::error::TypeError;

static CHAR_TYPE: FieldType = FieldType::Primitive(Primitive::Char);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Name(String),
    Index(usize),
}

/// Split `foo.bar[2].baz` into names and indices. Indices accept `0x`/`0o`/`0b` prefixes.
pub fn parse_path(path: &str) -> Result<Vec<PathSegment>, TypeError> {
    let invalid = || TypeError::InvalidPath(path.to_string());
    let mut segments = Vec::new();

    for part in path.trim().split('.') {
        let (name, mut rest) = match part.find('[') {
            Some(pos) => (&part[..pos], &part[pos..]),
            None => (part, ""),
        };
        if name.is_empty() {
            return Err(invalid());
        }
        segments.push(PathSegment::Name(name.to_string()));

        while !rest.is_empty() {
            let close = rest.find(']').ok_or_else(invalid)?;
            if !rest.starts_with('[') {
                return Err(invalid());
            }
            let index = parse_int(&rest[1..close])
                .and_then(|value| usize::try_from(value).ok())
                .ok_or_else(invalid)?;
            segments.push(PathSegment::Index(index));
            rest = &rest[close + 1..];
        }
    }
    Ok(segments)
}

/// Integer literal with an optional sign and `0x`, `0o` or `0b` prefix.
pub fn parse_int(text: &str) -> Option<i128> {
    let text = text.trim();
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let lower = digits.to_ascii_lowercase();
    let (radix, body) = if let Some(body) = lower.strip_prefix("0x") {
        (16, body)
    } else if let Some(body) = lower.strip_prefix("0o") {
        (8, body)
    } else if let Some(body) = lower.strip_prefix("0b") {
        (2, body)
    } else {
        (10, lower.as_str())
    };
    let body = body.replace('_', "");
    if body.is_empty() {
        return None;
    }
    let value = i128::from_str_radix(&body, radix).ok()?;
    Some(if negative { -value } else { value })
}

/// Text form of a field value: strings without quotes, everything else as JSON.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn read_uint(bytes: &[u8], endianness: Endianness) -> u64 {
    match endianness {
        Endianness::Little => bytes
            .iter()
            .rev()
            .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte)),
        Endianness::Big => bytes
            .iter()
            .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte)),
    }
}

fn write_uint(bytes: &mut [u8], value: u64, endianness: Endianness) {
    let len = bytes.len();
    for (i, byte) in bytes.iter_mut().enumerate() {
        let shift = match endianness {
            Endianness::Little => 8 * i,
            Endianness::Big => 8 * (len - 1 - i),
        };
        *byte = (value >> shift) as u8;
    }
}

fn sign_extend(value: u64, bits: u32) -> i64 {
    if bits >= 64 {
        return value as i64;
    }
    let shift = 64 - bits;
    ((value << shift) as i64) >> shift
}

fn float_value(value: f64) -> Value {
    Number::from_f64(value).map_or(Value::Null, Value::Number)
}

/// Integer view of a JSON scalar. Floats truncate toward zero.
fn integer_of(value: &Value) -> Option<i128> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .map(i128::from)
            .or_else(|| number.as_u64().map(i128::from))
            .or_else(|| number.as_f64().map(|v| v.trunc() as i128)),
        Value::Bool(flag) => Some(i128::from(*flag)),
        Value::String(text) => parse_int(text),
        _ => None,
    }
}

fn float_of(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::Bool(flag) => Some(f64::from(u8::from(*flag))),
        Value::String(text) => text
            .trim()
            .parse::<f64>()
            .ok()
            .or_else(|| parse_int(text).map(|v| v as f64)),
        _ => None,
    }
}

/// Bytes of a string or of a list of byte values.
fn bytes_of(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::String(text) => Some(text.as_bytes().to_vec()),
        Value::Array(items) => items
            .iter()
            .map(|item| integer_of(item).and_then(|v| u8::try_from(v).ok()))
            .collect(),
        Value::Null => Some(Vec::new()),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy)]
struct Cursor<'a> {
    field_type: &'a FieldType,
    offset: usize,
    bits: Option<Bitfield>,
}

/// A typed byte buffer: one record of a [`TypeDef`].
#[derive(Debug, Clone)]
pub struct Payload {
    typedef: Arc<TypeDef>,
    bytes: Vec<u8>,
}

impl Payload {
    /// Zero filled record.
    pub fn new(typedef: Arc<TypeDef>) -> Self {
        let bytes = vec![0u8; typedef.size()];
        Self { typedef, bytes }
    }

    /// Decode from the front of `bytes`; trailing bytes are ignored.
    pub fn from_bytes(typedef: Arc<TypeDef>, bytes: &[u8]) -> Result<Self, TypeError> {
        let size = typedef.size();
        if bytes.len() < size {
            return Err(TypeError::ShortBuffer {
                type_name: typedef.name().to_string(),
                expected: size,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            typedef,
            bytes: bytes[..size].to_vec(),
        })
    }

    /// Build a record from nested JSON objects keyed by field name (`name[i]` keys allowed).
    pub fn from_value(typedef: Arc<TypeDef>, value: &Value) -> Result<Self, TypeError> {
        let mut payload = Self::new(typedef);
        match value {
            Value::Object(map) => payload.set_object(map)?,
            Value::Null => {}
            _ => {
                return Err(TypeError::WrongKind {
                    field: payload.typedef.name().to_string(),
                    expected: "an object of field values",
                })
            }
        }
        Ok(payload)
    }

    pub fn typedef(&self) -> &Arc<TypeDef> {
        &self.typedef
    }

    pub fn type_name(&self) -> &str {
        self.typedef.name()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Read a field by path. Byte strings come back as text, structs as objects.
    pub fn get(&self, path: &str) -> Result<Value, TypeError> {
        let segments = parse_path(path)?;
        let cursor = Self::resolve(&self.typedef, 0, &segments, path)?;
        Ok(self.read(cursor))
    }

    pub fn set(&mut self, path: &str, value: &Value) -> Result<(), TypeError> {
        let typedef = Arc::clone(&self.typedef);
        let segments = parse_path(path)?;
        let cursor = Self::resolve(&typedef, 0, &segments, path)?;
        self.write(cursor, value, path)
    }

    pub fn set_object(&mut self, map: &Map<String, Value>) -> Result<(), TypeError> {
        for (key, value) in map {
            self.set(key, value)?;
        }
        Ok(())
    }

    /// Every field as a JSON object.
    pub fn to_value(&self) -> Value {
        self.read_struct(&self.typedef, 0)
    }

    fn resolve<'a>(
        def: &'a TypeDef,
        base: usize,
        segments: &[PathSegment],
        path: &str,
    ) -> Result<Cursor<'a>, TypeError> {
        let mut cursor: Option<Cursor<'a>> = None;

        for segment in segments {
            cursor = Some(match segment {
                PathSegment::Name(name) => {
                    let (owner, offset) = match cursor {
                        None => (def, base),
                        Some(Cursor {
                            field_type: FieldType::Struct(inner),
                            offset,
                            ..
                        }) => (inner.as_ref(), offset),
                        Some(_) => {
                            return Err(TypeError::WrongKind {
                                field: path.to_string(),
                                expected: "a struct",
                            })
                        }
                    };
                    let field = owner.field(name).ok_or_else(|| TypeError::NoSuchField {
                        field: name.clone(),
                        type_name: owner.name().to_string(),
                    })?;
                    Cursor {
                        field_type: &field.field_type,
                        offset: offset + field.offset,
                        bits: field.bits,
                    }
                }
                PathSegment::Index(index) => {
                    let current = cursor.ok_or_else(|| TypeError::InvalidPath(path.to_string()))?;
                    match current.field_type {
                        FieldType::Array { element, len } => {
                            if index >= len {
                                return Err(TypeError::IndexOutOfRange {
                                    field: path.to_string(),
                                    index: *index,
                                    len: *len,
                                });
                            }
                            Cursor {
                                field_type: element.as_ref(),
                                offset: current.offset + index * element.size(),
                                bits: None,
                            }
                        }
                        FieldType::Bytes(len) => {
                            if index >= len {
                                return Err(TypeError::IndexOutOfRange {
                                    field: path.to_string(),
                                    index: *index,
                                    len: *len,
                                });
                            }
                            Cursor {
                                field_type: &CHAR_TYPE,
                                offset: current.offset + index,
                                bits: None,
                            }
                        }
                        _ => {
                            return Err(TypeError::WrongKind {
                                field: path.to_string(),
                                expected: "an array",
                            })
                        }
                    }
                }
            });
        }

        cursor.ok_or_else(|| TypeError::InvalidPath(path.to_string()))
    }

    fn read(&self, cursor: Cursor<'_>) -> Value {
        match cursor.field_type {
            FieldType::Primitive(primitive) => self.read_primitive(*primitive, cursor),
            FieldType::Struct(def) => self.read_struct(def, cursor.offset),
            FieldType::Bytes(len) => {
                let raw = &self.bytes[cursor.offset..cursor.offset + len];
                let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
                Value::String(String::from_utf8_lossy(&raw[..end]).into_owned())
            }
            FieldType::Array { element, len } => Value::Array(
                (0..*len)
                    .map(|i| {
                        self.read(Cursor {
                            field_type: element,
                            offset: cursor.offset + i * element.size(),
                            bits: None,
                        })
                    })
                    .collect(),
            ),
        }
    }

    fn read_struct(&self, def: &TypeDef, offset: usize) -> Value {
        let map = def
            .fields()
            .iter()
            .map(|field| {
                let value = self.read(Cursor {
                    field_type: &field.field_type,
                    offset: offset + field.offset,
                    bits: field.bits,
                });
                (field.name.clone(), value)
            })
            .collect();
        Value::Object(map)
    }

    fn read_primitive(&self, primitive: Primitive, cursor: Cursor<'_>) -> Value {
        let endianness = self.typedef.endianness();
        let raw = &self.bytes[cursor.offset..cursor.offset + primitive.size()];
        let mut unsigned = read_uint(raw, endianness);
        let mut width = (primitive.size() * 8) as u32;

        if let Some(bits) = cursor.bits {
            let mask = if bits.width >= 64 {
                u64::MAX
            } else {
                (1u64 << bits.width) - 1
            };
            unsigned = (unsigned >> bits.shift) & mask;
            width = u32::from(bits.width);
        }

        match primitive {
            Primitive::Bool => Value::Bool(unsigned != 0),
            Primitive::Char => {
                if unsigned == 0 {
                    Value::String(String::new())
                } else {
                    Value::String(String::from_utf8_lossy(&[unsigned as u8]).into_owned())
                }
            }
            Primitive::F32 => float_value(f64::from(f32::from_bits(unsigned as u32))),
            Primitive::F64 => float_value(f64::from_bits(unsigned)),
            p if p.is_signed() => Value::from(sign_extend(unsigned, width)),
            _ => Value::from(unsigned),
        }
    }

    fn write(&mut self, cursor: Cursor<'_>, value: &Value, path: &str) -> Result<(), TypeError> {
        match cursor.field_type {
            FieldType::Primitive(primitive) => self.write_primitive(*primitive, cursor, value, path),
            FieldType::Struct(def) => {
                let map = value.as_object().ok_or_else(|| TypeError::WrongKind {
                    field: path.to_string(),
                    expected: "an object",
                })?;
                for (key, item) in map {
                    let segments = parse_path(key)?;
                    let inner = Self::resolve(def, cursor.offset, &segments, key)?;
                    self.write(inner, item, key)?;
                }
                Ok(())
            }
            FieldType::Bytes(len) => {
                let data = bytes_of(value).ok_or_else(|| TypeError::WrongKind {
                    field: path.to_string(),
                    expected: "a string",
                })?;
                let slot = &mut self.bytes[cursor.offset..cursor.offset + len];
                slot.fill(0);
                let count = data.len().min(*len);
                slot[..count].copy_from_slice(&data[..count]);
                Ok(())
            }
            FieldType::Array { element, len } => {
                let step = element.size();
                let element_cursor = |i: usize| Cursor {
                    field_type: element.as_ref(),
                    offset: cursor.offset + i * step,
                    bits: None,
                };
                match value {
                    Value::Array(items) => {
                        if items.len() > *len {
                            return Err(TypeError::IndexOutOfRange {
                                field: path.to_string(),
                                index: items.len() - 1,
                                len: *len,
                            });
                        }
                        for (i, item) in items.iter().enumerate() {
                            self.write(element_cursor(i), item, path)?;
                        }
                    }
                    scalar => {
                        for i in 0..*len {
                            self.write(element_cursor(i), scalar, path)?;
                        }
                    }
                }
                Ok(())
            }
        }
    }

    fn write_primitive(
        &mut self,
        primitive: Primitive,
        cursor: Cursor<'_>,
        value: &Value,
        path: &str,
    ) -> Result<(), TypeError> {
        let endianness = self.typedef.endianness();
        let size = primitive.size();
        let out_of_range = || TypeError::ValueOutOfRange {
            field: path.to_string(),
            value: value.to_string(),
        };

        let encoded: u64 = match primitive {
            Primitive::F32 => {
                let v = float_of(value).ok_or_else(out_of_range)?;
                u64::from((v as f32).to_bits())
            }
            Primitive::F64 => float_of(value).ok_or_else(out_of_range)?.to_bits(),
            Primitive::Char => match value {
                Value::String(text) => u64::from(text.as_bytes().first().copied().unwrap_or(0)),
                other => {
                    let v = integer_of(other).ok_or_else(out_of_range)?;
                    u64::from(u8::try_from(v).map_err(|_| out_of_range())?)
                }
            },
            Primitive::Bool => match value {
                Value::Bool(flag) => u64::from(*flag),
                other => u64::from(integer_of(other).ok_or_else(out_of_range)? != 0),
            },
            _ => {
                let v = integer_of(value).ok_or_else(out_of_range)?;
                let width = cursor
                    .bits
                    .map_or((size * 8) as u32, |bits| u32::from(bits.width));
                // Accept anything representable as either the signed or unsigned view.
                let min = -(1i128 << (width - 1));
                let max = (1i128 << width) - 1;
                if v < min || v > max {
                    return Err(out_of_range());
                }
                v as u64
            }
        };

        let slot = &mut self.bytes[cursor.offset..cursor.offset + size];
        match cursor.bits {
            None => write_uint(slot, encoded, endianness),
            Some(bits) => {
                let mask = if bits.width >= 64 {
                    u64::MAX
                } else {
                    (1u64 << bits.width) - 1
                };
                let unit = read_uint(slot, endianness);
                let updated = (unit & !(mask << bits.shift)) | ((encoded & mask) << bits.shift);
                write_uint(slot, updated, endianness);
            }
        }
        Ok(())
    }

    fn fmt_struct(&self, def: &TypeDef, offset: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {{", def.name())?;
        for (i, field) in def.fields().iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: ", field.name)?;
            self.fmt_field(
                Cursor {
                    field_type: &field.field_type,
                    offset: offset + field.offset,
                    bits: field.bits,
                },
                f,
            )?;
        }
        write!(f, "}}")
    }

    fn fmt_field(&self, cursor: Cursor<'_>, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match cursor.field_type {
            FieldType::Struct(def) => self.fmt_struct(def, cursor.offset, f),
            FieldType::Array { element, len } => {
                write!(f, "[")?;
                for i in 0..*len {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    self.fmt_field(
                        Cursor {
                            field_type: element,
                            offset: cursor.offset + i * element.size(),
                            bits: None,
                        },
                        f,
                    )?;
                }
                write!(f, "]")
            }
            _ => write!(f, "{}", display_value(&self.read(cursor))),
        }
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        self.typedef.name() == other.typedef.name() && self.to_value() == other.to_value()
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_struct(&self.typedef, 0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event_type(endianness: Endianness) -> Arc<TypeDef> {
        let packet_id = Arc::new(
            TypeDef::builder("CFE_EVS_PacketID_t", endianness)
                .field("AppName", FieldType::Primitive(Primitive::Char).repeated(20))
                .field("EventID", FieldType::Primitive(Primitive::U16))
                .field("EventType", FieldType::Primitive(Primitive::U16))
                .build(),
        );
        let payload = Arc::new(
            TypeDef::builder("CFE_EVS_LongEventTlm_Payload_t", endianness)
                .field("PacketID", FieldType::Struct(packet_id))
                .field("Message", FieldType::Primitive(Primitive::Char).repeated(122))
                .build(),
        );
        Arc::new(
            TypeDef::builder("CFE_EVS_LongEventTlm_t", endianness)
                .field("Payload", FieldType::Struct(payload))
                .build(),
        )
    }

    #[test]
    fn test_parse_path() {
        assert_eq!(
            parse_path("foo.bar[2].baz").unwrap(),
            vec![
                PathSegment::Name("foo".into()),
                PathSegment::Name("bar".into()),
                PathSegment::Index(2),
                PathSegment::Name("baz".into()),
            ]
        );
        assert_eq!(
            parse_path("grid[0x1][3]").unwrap(),
            vec![
                PathSegment::Name("grid".into()),
                PathSegment::Index(1),
                PathSegment::Index(3),
            ]
        );
        assert!(parse_path("foo..bar").is_err());
        assert!(parse_path("foo[x]").is_err());
    }

    #[test]
    fn test_parse_int_prefixes() {
        assert_eq!(parse_int("0x1F"), Some(31));
        assert_eq!(parse_int("-12"), Some(-12));
        assert_eq!(parse_int("0b101"), Some(5));
        assert_eq!(parse_int("ten"), None);
    }

    #[test]
    fn test_nested_get_decodes_strings() {
        let def = event_type(Endianness::Little);
        let payload = Payload::from_value(
            Arc::clone(&def),
            &json!({"Payload": {"PacketID": {"AppName": "TO", "EventID": 3}, "Message": "No-op"}}),
        )
        .unwrap();

        assert_eq!(payload.get("Payload.PacketID.AppName").unwrap(), json!("TO"));
        assert_eq!(payload.get("Payload.PacketID.EventID").unwrap(), json!(3));
        assert_eq!(payload.get("Payload.Message").unwrap(), json!("No-op"));
        assert_eq!(payload.len(), def.size());
    }

    #[test]
    fn test_round_trip_through_bytes() {
        let def = event_type(Endianness::Big);
        let original = Payload::from_value(
            Arc::clone(&def),
            &json!({"Payload": {"PacketID": {"AppName": "CFE_ES", "EventID": 0x1234}}}),
        )
        .unwrap();
        let decoded = Payload::from_bytes(Arc::clone(&def), original.as_bytes()).unwrap();
        assert_eq!(original, decoded);
        assert_eq!(&original.as_bytes()[20..22], &[0x12, 0x34]);
    }

    #[test]
    fn test_indexed_writes_share_one_array() {
        let def = Arc::new(
            TypeDef::builder("Table", Endianness::Little)
                .field("arr", FieldType::Primitive(Primitive::U8).repeated(8))
                .build(),
        );
        let payload = Payload::from_value(def, &json!({"arr[0]": 1, "arr[7]": 9})).unwrap();
        assert_eq!(payload.as_bytes(), &[1, 0, 0, 0, 0, 0, 0, 9]);
    }

    #[test]
    fn test_scalar_broadcasts_to_array() {
        let def = Arc::new(
            TypeDef::builder("Table", Endianness::Little)
                .field("arr", FieldType::Primitive(Primitive::U16).repeated(3))
                .build(),
        );
        let payload = Payload::from_value(def, &json!({"arr": 2})).unwrap();
        assert_eq!(payload.get("arr").unwrap(), json!([2, 2, 2]));
    }

    #[test]
    fn test_bitfield_get_set() {
        let def = Arc::new(
            TypeDef::builder("Flags", Endianness::Little)
                .bitfield("low", Primitive::U8, 3)
                .unwrap()
                .bitfield("high", Primitive::U8, 5)
                .unwrap()
                .build(),
        );
        let mut payload = Payload::new(def);
        payload.set("low", &json!(5)).unwrap();
        payload.set("high", &json!(0x1F)).unwrap();
        assert_eq!(payload.as_bytes(), &[0xFD]);
        assert_eq!(payload.get("low").unwrap(), json!(5));
        assert!(payload.set("low", &json!(8)).is_err());
    }

    #[test]
    fn test_out_of_range_values_are_rejected() {
        let def = Arc::new(
            TypeDef::builder("Small", Endianness::Little)
                .field("x", FieldType::Primitive(Primitive::U8))
                .build(),
        );
        let mut payload = Payload::new(def);
        assert!(payload.set("x", &json!(255)).is_ok());
        assert!(payload.set("x", &json!(-1)).is_ok());
        assert_eq!(payload.get("x").unwrap(), json!(255));
        assert!(payload.set("x", &json!(256)).is_err());
        assert!(payload.set("y", &json!(1)).is_err());
    }

    #[test]
    fn test_display_names_type_and_fields() {
        let inner = Arc::new(
            TypeDef::builder("Inner", Endianness::Little)
                .field("a", FieldType::Primitive(Primitive::U8))
                .build(),
        );
        let def = Arc::new(
            TypeDef::builder("Outer", Endianness::Little)
                .field("count", FieldType::Primitive(Primitive::U16))
                .field("inner", FieldType::Struct(inner))
                .field("name", FieldType::Primitive(Primitive::Char).repeated(4))
                .build(),
        );
        let payload =
            Payload::from_value(def, &json!({"count": 7, "inner": {"a": 1}, "name": "ab"})).unwrap();
        assert_eq!(payload.to_string(), "Outer: {count: 7, inner: Inner: {a: 1}, name: ab}");
    }

    #[test]
    fn test_short_buffer_is_an_error() {
        let def = event_type(Endianness::Little);
        assert!(matches!(
            Payload::from_bytes(def, &[0u8; 4]),
            Err(TypeError::ShortBuffer { .. })
        ));
    }

    #[test]
    fn test_floats_and_signed_values() {
        let def = Arc::new(
            TypeDef::builder("Mixed", Endianness::Big)
                .field("temp", FieldType::Primitive(Primitive::F32))
                .field("delta", FieldType::Primitive(Primitive::I16))
                .build(),
        );
        let payload = Payload::from_value(def, &json!({"temp": 1.5, "delta": -2})).unwrap();
        assert_eq!(payload.get("temp").unwrap(), json!(1.5));
        assert_eq!(payload.get("delta").unwrap(), json!(-2));
        assert_eq!(&payload.as_bytes()[4..], &[0xFF, 0xFE]);
    }
}
