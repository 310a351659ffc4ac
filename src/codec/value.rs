use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

use crate::{
    error::ForceError,
    properties::{DecodedRecord, DeclaredType, MetadataRecord},
};

/// A raw value decoded according to its declared type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum DecodedValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Decoding failed. Carries the type that was attempted.
    Invalid(DeclaredType),
}

impl DecodedValue {
    pub fn is_invalid(&self) -> bool {
        matches!(self, DecodedValue::Invalid(_))
    }

    /// Tagged text form used by the force store. Unlike JSON this keeps non-finite floats.
    pub fn to_stored(&self) -> String {
        match self {
            DecodedValue::Bool(b) => format!("bool:{b}"),
            DecodedValue::Int(i) => format!("int:{i}"),
            DecodedValue::Float(x) => format!("float:{x:?}"),
            DecodedValue::Invalid(declared) => format!("invalid:{declared}"),
        }
    }

    pub fn from_stored(stored: &str) -> Result<DecodedValue, ForceError> {
        let parse_err =
            || ForceError::Serialization(format!("unrecognised stored value {stored:?}"));
        let (tag, body) = stored.split_once(':').ok_or_else(parse_err)?;
        match tag {
            "bool" => body.parse().map(DecodedValue::Bool).map_err(|_| parse_err()),
            "int" => body.parse().map(DecodedValue::Int).map_err(|_| parse_err()),
            "float" => body.parse().map(DecodedValue::Float).map_err(|_| parse_err()),
            "invalid" => Ok(DecodedValue::Invalid(DeclaredType::from(body))),
            _ => Err(parse_err()),
        }
    }
}

impl Display for DecodedValue {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            DecodedValue::Bool(b) => write!(f, "{b}"),
            DecodedValue::Int(i) => write!(f, "{i}"),
            DecodedValue::Float(x) => write!(f, "{x:?}"),
            DecodedValue::Invalid(declared) => write!(f, "Invalid {declared}"),
        }
    }
}

/// Decode a record's raw value words. Total: every failure becomes [`DecodedValue::Invalid`].
pub fn decode(record: &MetadataRecord) -> DecodedValue {
    decode_tokens(&record.declared_type, &record.raw_value_tokens)
}

pub fn decode_tokens(declared: &DeclaredType, tokens: &[String]) -> DecodedValue {
    let first = tokens.first().map(String::as_str);
    let decoded = match declared {
        DeclaredType::Bool => first.and_then(decode_bool),
        DeclaredType::Lint => first.and_then(decode_lint),
        DeclaredType::Real => first.and_then(decode_real),
        DeclaredType::Double => decode_double(tokens),
        DeclaredType::Other(_) => None,
    };
    decoded.unwrap_or_else(|| DecodedValue::Invalid(declared.clone()))
}

/// Decode every real record of a matched batch. Scope placeholders carry no bits and are
/// dropped here.
pub fn decode_all(records: Vec<MetadataRecord>) -> Vec<DecodedRecord> {
    records
        .into_iter()
        .filter(|record| !record.is_placeholder())
        .map(|metadata| {
            let value = decode(&metadata);
            if value.is_invalid() {
                tracing::debug!(
                    "{} {}: could not decode {:?} as {}",
                    metadata.scope,
                    metadata.name_id,
                    metadata.raw_value_tokens,
                    metadata.declared_type
                );
            }
            DecodedRecord { metadata, value }
        })
        .collect()
}

fn is_hex_word(token: &str) -> bool {
    !token.is_empty() && token.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Any width is accepted; the value is true iff any digit is non-zero.
fn decode_bool(token: &str) -> Option<DecodedValue> {
    is_hex_word(token).then(|| DecodedValue::Bool(token.bytes().any(|b| b != b'0')))
}

/// LINT words are 64-bit two's complement.
fn decode_lint(token: &str) -> Option<DecodedValue> {
    u64::from_str_radix(token, 16)
        .ok()
        .map(|raw| DecodedValue::Int(raw as i64))
}

fn decode_real(token: &str) -> Option<DecodedValue> {
    u32::from_str_radix(token, 16)
        .ok()
        .map(|bits| DecodedValue::Float(f64::from(f32::from_bits(bits))))
}

/// The controller writes 64-bit values low word first, so the words are concatenated in
/// reverse before the big-endian reinterpretation.
fn decode_double(tokens: &[String]) -> Option<DecodedValue> {
    if tokens.is_empty() || !tokens.iter().all(|t| is_hex_word(t)) {
        return None;
    }
    let combined: String = tokens.iter().rev().map(String::as_str).collect();
    u64::from_str_radix(&combined, 16)
        .ok()
        .map(|bits| DecodedValue::Float(f64::from_bits(bits)))
}
