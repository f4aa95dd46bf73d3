//! Payload decoding and integrity checks.
//!
//! Every update of a `sinewavesimple` channel carries its array as
//!
//! ```json
//! { "base64Array": { "numberType": "FLOAT64", "base64": "AAAAAAAAAAA..." } }
//! ```
//!
//! The base64 text decodes to a contiguous buffer of little-endian IEEE-754 doubles,
//! eight bytes per element. Only `FLOAT64` is decoded; the other element types the
//! server can advertise are recognised so they can be reported by name, but rejected.
//!
//! For a channel of size `N` the generator only ever rotates the array `0..N`, so a
//! healthy payload always holds exactly the distinct values `{0, 1, ..., N-1}` in some
//! order. [`validate`] checks that as a set property.

use std::borrow::Cow;

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

/// Width of one float64 element in the encoded buffer.
pub const F64_STRIDE: usize = 8;

/// Element type tag attached to an encoded array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NumberType {
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Float32,
    Float64,
}

impl NumberType {
    /// Wire name, e.g. `FLOAT64`.
    pub fn as_str(&self) -> &'static str {
        match self {
            NumberType::Int8 => "INT8",
            NumberType::Uint8 => "UINT8",
            NumberType::Int16 => "INT16",
            NumberType::Uint16 => "UINT16",
            NumberType::Int32 => "INT32",
            NumberType::Uint32 => "UINT32",
            NumberType::Int64 => "INT64",
            NumberType::Uint64 => "UINT64",
            NumberType::Float32 => "FLOAT32",
            NumberType::Float64 => "FLOAT64",
        }
    }
}

/// Base64 encoded array with its element type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Base64Array<'a> {
    /// Declared element type.
    #[serde(rename = "numberType")]
    pub number_type: NumberType,
    /// Standard (padded) base64 of the raw element bytes.
    #[serde(borrow)]
    pub base64: Cow<'a, str>,
}

/// The `value` object of a channel update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelValue<'a> {
    /// Array form of the value; absent for scalar channels.
    #[serde(rename = "base64Array", borrow, default)]
    pub base64_array: Option<Base64Array<'a>>,
}

/// One inbound channel update, as delivered by a transport.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Channel id echoed by the server, when selected.
    pub id: Option<String>,
    /// Raw `value` object; decoded lazily by [`decode`].
    pub value: serde_json::Value,
}

/// Encode float64 values the way the server does: little-endian bytes, standard base64.
pub fn encode_f64(values: &[f64]) -> Base64Array<'static> {
    let mut bytes = Vec::with_capacity(values.len() * F64_STRIDE);
    for v in values {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    Base64Array {
        number_type: NumberType::Float64,
        base64: Cow::Owned(BASE64_STANDARD.encode(bytes)),
    }
}

/// Decode a message's `value.base64Array` into float64 values.
pub fn decode(message: &Message) -> Result<Vec<f64>, DecodeError> {
    let value = ChannelValue::deserialize(&message.value)
        .map_err(|e| DecodeError::Malformed(e.to_string()))?;
    let array = value.base64_array.ok_or(DecodeError::MissingArray)?;
    decode_array(&array)
}

/// Decode a single encoded array.
pub fn decode_array(array: &Base64Array<'_>) -> Result<Vec<f64>, DecodeError> {
    if array.number_type != NumberType::Float64 {
        return Err(DecodeError::UnsupportedType(array.number_type.as_str().to_string()));
    }
    let bytes = BASE64_STANDARD.decode(array.base64.as_bytes())?;
    f64_from_le_bytes(&bytes)
}

/// Reinterpret a byte buffer as consecutive little-endian float64 values.
pub fn f64_from_le_bytes(bytes: &[u8]) -> Result<Vec<f64>, DecodeError> {
    if bytes.len() % F64_STRIDE != 0 {
        return Err(DecodeError::Misaligned(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(F64_STRIDE)
        .map(|chunk| {
            let mut word = [0u8; F64_STRIDE];
            word.copy_from_slice(chunk);
            f64::from_le_bytes(word)
        })
        .collect())
}

/// The integers `0..len` viewed as a set of float64 values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpectedSet {
    len: usize,
}

impl ExpectedSet {
    /// Expected values for a channel of `size` elements.
    pub fn for_size(size: usize) -> Self {
        Self { len: size }
    }

    /// Number of distinct members.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for the size-0 set.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Position of `value` within `0..len`, if it is a member.
    pub fn index_of(&self, value: f64) -> Option<usize> {
        if !value.is_finite() || value < 0.0 || value.fract() != 0.0 || value >= self.len as f64 {
            return None;
        }
        Some(value as usize)
    }

    /// Membership test.
    pub fn contains(&self, value: f64) -> bool {
        self.index_of(value).is_some()
    }
}

/// True iff the distinct values of `decoded` are exactly `expected`.
///
/// Order and repetition within `decoded` do not matter.
pub fn validate(decoded: &[f64], expected: &ExpectedSet) -> bool {
    let mut seen = vec![0u64; expected.len().div_ceil(64)];
    let mut distinct = 0usize;
    for &value in decoded {
        let Some(index) = expected.index_of(value) else {
            return false;
        };
        let (word, bit) = (index / 64, 1u64 << (index % 64));
        if seen[word] & bit == 0 {
            seen[word] |= bit;
            distinct += 1;
        }
    }
    distinct == expected.len()
}
