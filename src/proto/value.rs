//! Typed payload values and their little-endian wire encodings.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValueError {
    #[error("payload too short for {vtype:?}: need {need} bytes got {got}")]
    ShortPayload {
        vtype: VarType,
        need: usize,
        got: usize,
    },
}

/// Declared type of a device variable or function argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VarType {
    Bool,
    Int8,
    Int16,
    Int32,
    Uint8,
    Uint16,
    Uint32,
    Float,
    Double,
    String,
    Buffer,
}

impl Default for VarType {
    fn default() -> Self {
        VarType::String
    }
}

impl VarType {
    /// Parse an introspection type name; unknown names fall back to
    /// `string`.
    pub fn parse(name: &str) -> Self {
        match name {
            "bool" => VarType::Bool,
            "int8" => VarType::Int8,
            "int16" => VarType::Int16,
            "int" | "int32" => VarType::Int32,
            "uint8" => VarType::Uint8,
            "uint16" => VarType::Uint16,
            "uint32" => VarType::Uint32,
            "float" => VarType::Float,
            "double" => VarType::Double,
            "buffer" => VarType::Buffer,
            _ => VarType::String,
        }
    }
}

/// A decoded payload value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Uint8(u8),
    Uint16(u16),
    Uint32(u32),
    Float(f32),
    Double(f64),
    String(String),
    Buffer(Vec<u8>),
}

impl Value {
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Value::Bool(v) => vec![u8::from(*v)],
            Value::Int8(v) => v.to_le_bytes().to_vec(),
            Value::Int16(v) => v.to_le_bytes().to_vec(),
            Value::Int32(v) => v.to_le_bytes().to_vec(),
            Value::Uint8(v) => v.to_le_bytes().to_vec(),
            Value::Uint16(v) => v.to_le_bytes().to_vec(),
            Value::Uint32(v) => v.to_le_bytes().to_vec(),
            Value::Float(v) => v.to_le_bytes().to_vec(),
            Value::Double(v) => v.to_le_bytes().to_vec(),
            Value::String(v) => v.as_bytes().to_vec(),
            Value::Buffer(v) => v.clone(),
        }
    }

    pub fn decode(vtype: VarType, raw: &[u8]) -> Result<Value, ValueError> {
        fn take<const N: usize>(vtype: VarType, raw: &[u8]) -> Result<[u8; N], ValueError> {
            raw.get(..N)
                .and_then(|s| s.try_into().ok())
                .ok_or(ValueError::ShortPayload {
                    vtype,
                    need: N,
                    got: raw.len(),
                })
        }

        Ok(match vtype {
            VarType::Bool => Value::Bool(take::<1>(vtype, raw)?[0] != 0),
            VarType::Int8 => Value::Int8(i8::from_le_bytes(take(vtype, raw)?)),
            VarType::Int16 => Value::Int16(i16::from_le_bytes(take(vtype, raw)?)),
            VarType::Int32 => Value::Int32(i32::from_le_bytes(take(vtype, raw)?)),
            VarType::Uint8 => Value::Uint8(u8::from_le_bytes(take(vtype, raw)?)),
            VarType::Uint16 => Value::Uint16(u16::from_le_bytes(take(vtype, raw)?)),
            VarType::Uint32 => Value::Uint32(u32::from_le_bytes(take(vtype, raw)?)),
            VarType::Float => Value::Float(f32::from_le_bytes(take(vtype, raw)?)),
            VarType::Double => Value::Double(f64::from_le_bytes(take(vtype, raw)?)),
            VarType::String => Value::String(String::from_utf8_lossy(raw).into_owned()),
            VarType::Buffer => Value::Buffer(raw.to_vec()),
        })
    }

    /// Validate a textual function argument against its declared type.
    pub fn argument_fits(vtype: VarType, arg: &str) -> bool {
        match vtype {
            VarType::Bool => matches!(arg, "0" | "1" | "true" | "false"),
            VarType::Int8 => arg.parse::<i8>().is_ok(),
            VarType::Int16 => arg.parse::<i16>().is_ok(),
            VarType::Int32 => arg.parse::<i32>().is_ok(),
            VarType::Uint8 => arg.parse::<u8>().is_ok(),
            VarType::Uint16 => arg.parse::<u16>().is_ok(),
            VarType::Uint32 => arg.parse::<u32>().is_ok(),
            VarType::Float => arg.parse::<f32>().is_ok(),
            VarType::Double => arg.parse::<f64>().is_ok(),
            VarType::String | VarType::Buffer => true,
        }
    }
}
