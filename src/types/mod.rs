//! Packed binary record types built at runtime from data-dictionary definitions.
//!
//! A [`TypeDef`] is a field descriptor list with byte offsets; a [`Payload`] pairs a
//! descriptor with a byte buffer and exposes path based `get`/`set`.

pub mod payload;

pub use payload::{display_value, parse_int, parse_path, Payload, PathSegment};

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::DictionaryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endianness {
    #[default]
    Little,
    Big,
}

impl Endianness {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "little" => Some(Endianness::Little),
            "big" => Some(Endianness::Big),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Primitive {
    Bool,
    Char,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
}

impl Primitive {
    /// Resolve a C type name as written in dictionary files (`uint16`, `uint16_t`,
    /// `c_uint16`, `float`, `char`, ...).
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        let name = name.strip_prefix("c_").unwrap_or(name);
        let name = name.strip_suffix("_t").unwrap_or(name);
        let primitive = match name {
            "bool" | "boolean" => Primitive::Bool,
            "char" => Primitive::Char,
            "int8" | "byte" | "schar" => Primitive::I8,
            "uint8" | "ubyte" | "uchar" => Primitive::U8,
            "int16" | "short" => Primitive::I16,
            "uint16" | "ushort" => Primitive::U16,
            "int32" | "int" => Primitive::I32,
            "uint32" | "uint" => Primitive::U32,
            "int64" | "long" | "longlong" | "ssize" => Primitive::I64,
            "uint64" | "ulong" | "ulonglong" | "size" => Primitive::U64,
            "float" => Primitive::F32,
            "double" | "longdouble" => Primitive::F64,
            _ => return None,
        };
        Some(primitive)
    }

    pub fn size(self) -> usize {
        match self {
            Primitive::Bool | Primitive::Char | Primitive::I8 | Primitive::U8 => 1,
            Primitive::I16 | Primitive::U16 => 2,
            Primitive::I32 | Primitive::U32 | Primitive::F32 => 4,
            Primitive::I64 | Primitive::U64 | Primitive::F64 => 8,
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            Primitive::I8 | Primitive::I16 | Primitive::I32 | Primitive::I64
        )
    }

    pub fn is_float(self) -> bool {
        matches!(self, Primitive::F32 | Primitive::F64)
    }

    pub fn is_integer(self) -> bool {
        !self.is_float() && self != Primitive::Char
    }

    pub fn name(self) -> &'static str {
        match self {
            Primitive::Bool => "bool",
            Primitive::Char => "char",
            Primitive::I8 => "int8",
            Primitive::U8 => "uint8",
            Primitive::I16 => "int16",
            Primitive::U16 => "uint16",
            Primitive::I32 => "int32",
            Primitive::U32 => "uint32",
            Primitive::I64 => "int64",
            Primitive::U64 => "uint64",
            Primitive::F32 => "float",
            Primitive::F64 => "double",
        }
    }
}

/// Wire type of a single field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    Primitive(Primitive),
    Struct(Arc<TypeDef>),
    /// `char[N]`: a NUL padded byte string of exactly N bytes.
    Bytes(usize),
    Array { element: Box<FieldType>, len: usize },
}

impl FieldType {
    pub fn size(&self) -> usize {
        match self {
            FieldType::Primitive(primitive) => primitive.size(),
            FieldType::Struct(def) => def.size(),
            FieldType::Bytes(len) => *len,
            FieldType::Array { element, len } => element.size() * len,
        }
    }

    /// `len` copies of `self`. Arrays of `char` collapse into a byte field.
    pub fn repeated(self, len: usize) -> FieldType {
        match self {
            FieldType::Primitive(Primitive::Char) => FieldType::Bytes(len),
            element => FieldType::Array {
                element: Box::new(element),
                len,
            },
        }
    }

    pub fn type_name(&self) -> String {
        match self {
            FieldType::Primitive(primitive) => primitive.name().to_string(),
            FieldType::Struct(def) => def.name().to_string(),
            FieldType::Bytes(len) => format!("char[{}]", len),
            FieldType::Array { element, len } => format!("{}[{}]", element.type_name(), len),
        }
    }
}

/// Position of a bitfield inside its storage unit, counted from the least significant bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bitfield {
    pub width: u8,
    pub shift: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
    /// Byte offset from the start of the enclosing record.
    pub offset: usize,
    pub bits: Option<Bitfield>,
}

/// A packed (no alignment padding) record type with fixed endianness.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeDef {
    name: String,
    endianness: Endianness,
    fields: Vec<Field>,
    size: usize,
}

impl TypeDef {
    pub fn builder(name: impl Into<String>, endianness: Endianness) -> TypeDefBuilder {
        TypeDefBuilder::new(name, endianness)
    }

    pub fn empty(name: impl Into<String>, endianness: Endianness) -> Self {
        Self {
            name: name.into(),
            endianness,
            fields: Vec::new(),
            size: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// Total wire size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Same layout under a different name, used when a dictionary aliases a record type.
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct BitUnit {
    storage: Primitive,
    offset: usize,
    used: u8,
}

/// Lays fields out back to back. Adjacent bitfields of the same storage type share a unit.
#[derive(Debug)]
pub struct TypeDefBuilder {
    name: String,
    endianness: Endianness,
    fields: Vec<Field>,
    offset: usize,
    unit: Option<BitUnit>,
}

impl TypeDefBuilder {
    pub fn new(name: impl Into<String>, endianness: Endianness) -> Self {
        Self {
            name: name.into(),
            endianness,
            fields: Vec::new(),
            offset: 0,
            unit: None,
        }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|field| field.name == name)
    }

    pub fn field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.push_field(name, field_type);
        self
    }

    pub fn push_field(&mut self, name: impl Into<String>, field_type: FieldType) {
        self.unit = None;
        let size = field_type.size();
        self.fields.push(Field {
            name: name.into(),
            field_type,
            offset: self.offset,
            bits: None,
        });
        self.offset += size;
    }

    pub fn bitfield(
        mut self,
        name: impl Into<String>,
        storage: Primitive,
        width: u8,
    ) -> Result<Self, DictionaryError> {
        self.push_bitfield(name, storage, width)?;
        Ok(self)
    }

    pub fn push_bitfield(
        &mut self,
        name: impl Into<String>,
        storage: Primitive,
        width: u8,
    ) -> Result<(), DictionaryError> {
        let name = name.into();
        let unit_bits = (storage.size() * 8) as u8;
        if !storage.is_integer() || width == 0 || width > unit_bits {
            return Err(DictionaryError::InvalidBitLength {
                bits: width.to_string(),
                field: name,
            });
        }

        let unit = match self.unit {
            Some(unit) if unit.storage.size() != storage.size() => {
                return Err(DictionaryError::MixedBitfieldWidths {
                    type_name: self.name.clone(),
                    field: name,
                });
            }
            Some(unit) if unit.used + width <= unit_bits => unit,
            _ => {
                let unit = BitUnit {
                    storage,
                    offset: self.offset,
                    used: 0,
                };
                self.offset += storage.size();
                unit
            }
        };

        let shift = match self.endianness {
            Endianness::Little => unit.used,
            Endianness::Big => unit_bits - unit.used - width,
        };

        self.fields.push(Field {
            name,
            field_type: FieldType::Primitive(storage),
            offset: unit.offset,
            bits: Some(Bitfield { width, shift }),
        });
        self.unit = Some(BitUnit {
            used: unit.used + width,
            ..unit
        });
        Ok(())
    }

    pub fn build(self) -> TypeDef {
        TypeDef {
            name: self.name,
            endianness: self.endianness,
            fields: self.fields,
            size: self.offset,
        }
    }
}
