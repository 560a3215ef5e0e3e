//! Tagged binary codec for values that have no native row column
//!
//! ```text
//! 'O' len:u8 property:[u8; len] <value>   nested record link
//! 'R' len:u8 uri:[u8; len]                URI reference
//! anything else                           scalar, see `encode_scalar`
//! ```
//!
//! Record chains are walked iteratively in both directions, so chain depth
//! never translates into call depth.

use bigdecimal::BigDecimal;
use num_bigint::BigInt;

use crate::core::{Record, Value};
use crate::error::{Error, Result};

pub const RECORD_TAG: u8 = b'O';
pub const URI_TAG: u8 = b'R';

const INT_TAG: u8 = b'i';
const LONG_TAG: u8 = b'l';
const FLOAT_TAG: u8 = b'f';
const DOUBLE_TAG: u8 = b'd';
const STRING_TAG: u8 = b's';
const BOOL_TAG: u8 = b'b';
const SHORT_TAG: u8 = b'h';
const BIGINT_TAG: u8 = b'I';
const BIGDECIMAL_TAG: u8 = b'D';

/// Deepest record chain accepted by the codec.
pub const MAX_RECORD_DEPTH: usize = 1024;

/// Encode a value into its tagged byte representation
pub fn encode(value: &Value) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut current = value;
    let mut depth = 0;
    while let Value::Record(record) = current {
        depth += 1;
        if depth > MAX_RECORD_DEPTH {
            return Err(Error::InvalidArgument(format!(
                "record chain deeper than {} links",
                MAX_RECORD_DEPTH
            )));
        }
        out.push(RECORD_TAG);
        push_short_str(&mut out, &record.property, "record property")?;
        current = &record.value;
    }
    match current {
        Value::Uri(uri) => {
            out.push(URI_TAG);
            push_short_str(&mut out, uri, "URI")?;
        }
        scalar => encode_scalar(scalar, &mut out)?,
    }
    Ok(out)
}

/// Decode bytes produced by [`encode`]
pub fn decode(bytes: &[u8]) -> Result<Value> {
    let mut reader = ByteReader::new(bytes);
    let mut properties: Vec<String> = Vec::new();
    let leaf = loop {
        match reader.u8()? {
            RECORD_TAG => {
                if properties.len() == MAX_RECORD_DEPTH {
                    return Err(Error::Codec(format!(
                        "record chain deeper than {} links",
                        MAX_RECORD_DEPTH
                    )));
                }
                properties.push(reader.short_str()?);
            }
            URI_TAG => break Value::Uri(reader.short_str()?),
            tag => break decode_scalar(tag, &mut reader)?,
        }
    };
    if !reader.is_empty() {
        return Err(Error::Codec(format!("{} trailing bytes after value", reader.remaining())));
    }

    let mut value = leaf;
    while let Some(property) = properties.pop() {
        value = Value::Record(Record { property, value: Box::new(value) });
    }
    Ok(value)
}

fn push_short_str(out: &mut Vec<u8>, s: &str, what: &str) -> Result<()> {
    let len = u8::try_from(s.len()).map_err(|_| {
        Error::InvalidArgument(format!("{} of {} bytes exceeds 255 bytes: {}", what, s.len(), s))
    })?;
    out.push(len);
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

fn push_long_bytes(out: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| Error::InvalidArgument(format!("value of {} bytes is too large", bytes.len())))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

/// Generic scalar encoding, also used for scalars nested inside records.
fn encode_scalar(value: &Value, out: &mut Vec<u8>) -> Result<()> {
    match value {
        Value::Int(v) => {
            out.push(INT_TAG);
            out.extend_from_slice(&v.to_be_bytes());
        }
        Value::Long(v) => {
            out.push(LONG_TAG);
            out.extend_from_slice(&v.to_be_bytes());
        }
        Value::Float(v) => {
            out.push(FLOAT_TAG);
            out.extend_from_slice(&v.to_be_bytes());
        }
        Value::Double(v) => {
            out.push(DOUBLE_TAG);
            out.extend_from_slice(&v.to_be_bytes());
        }
        Value::Str(s) => {
            out.push(STRING_TAG);
            push_long_bytes(out, s.as_bytes())?;
        }
        Value::Bool(b) => {
            out.push(BOOL_TAG);
            out.push(u8::from(*b));
        }
        Value::Short(v) => {
            out.push(SHORT_TAG);
            out.extend_from_slice(&v.to_be_bytes());
        }
        Value::BigInt(v) => {
            out.push(BIGINT_TAG);
            push_long_bytes(out, &v.to_signed_bytes_be())?;
        }
        Value::BigDecimal(v) => {
            let (unscaled, scale) = v.as_bigint_and_exponent();
            out.push(BIGDECIMAL_TAG);
            out.extend_from_slice(&scale.to_be_bytes());
            push_long_bytes(out, &unscaled.to_signed_bytes_be())?;
        }
        Value::Record(_) | Value::Uri(_) => {
            return Err(Error::InvalidArgument("composite value passed to scalar codec".to_string()));
        }
    }
    Ok(())
}

fn decode_scalar(tag: u8, reader: &mut ByteReader<'_>) -> Result<Value> {
    Ok(match tag {
        INT_TAG => Value::Int(i32::from_be_bytes(reader.array()?)),
        LONG_TAG => Value::Long(i64::from_be_bytes(reader.array()?)),
        FLOAT_TAG => Value::Float(f32::from_be_bytes(reader.array()?)),
        DOUBLE_TAG => Value::Double(f64::from_be_bytes(reader.array()?)),
        STRING_TAG => {
            let bytes = reader.long_bytes()?;
            Value::Str(
                String::from_utf8(bytes.to_vec()).map_err(|e| Error::Codec(format!("invalid UTF-8: {}", e)))?,
            )
        }
        BOOL_TAG => match reader.u8()? {
            0 => Value::Bool(false),
            1 => Value::Bool(true),
            other => return Err(Error::Codec(format!("invalid boolean byte {}", other))),
        },
        SHORT_TAG => Value::Short(i16::from_be_bytes(reader.array()?)),
        BIGINT_TAG => Value::BigInt(BigInt::from_signed_bytes_be(reader.long_bytes()?)),
        BIGDECIMAL_TAG => {
            let scale = i64::from_be_bytes(reader.array()?);
            let unscaled = BigInt::from_signed_bytes_be(reader.long_bytes()?);
            Value::BigDecimal(BigDecimal::new(unscaled, scale))
        }
        other => return Err(Error::Codec(format!("unknown value tag 0x{:02x}", other))),
    })
}

struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::Codec(format!(
                "truncated value: needed {} bytes at offset {}, {} left",
                n,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn short_str(&mut self) -> Result<String> {
        let len = self.u8()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| Error::Codec(format!("invalid UTF-8: {}", e)))
    }

    fn long_bytes(&mut self) -> Result<&'a [u8]> {
        let len = u32::from_be_bytes(self.array()?) as usize;
        self.take(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_uri_layout() {
        let bytes = encode(&Value::Uri("ex:a".to_string())).unwrap();
        assert_eq!(bytes, vec![b'R', 4, b'e', b'x', b':', b'a']);
        assert_eq!(decode(&bytes).unwrap(), Value::Uri("ex:a".to_string()));
    }

    #[test]
    fn test_record_chain_layout() {
        let value = Value::Record(Record::new("ex:p", Value::Uri("ex:o".to_string())));
        let bytes = encode(&value).unwrap();
        assert_eq!(&bytes[..6], &[b'O', 4, b'e', b'x', b':', b'p']);
        assert_eq!(bytes[6], b'R');
        assert_eq!(decode(&bytes).unwrap(), value);
    }

    #[test]
    fn test_deep_record_chain() {
        let value = Value::Record(Record::new(
            "ex:a",
            Record::new("ex:b", Record::new("ex:c", Record::new("ex:d", 42i64))),
        ));
        if let Value::Record(record) = &value {
            assert_eq!(record.depth(), 4);
        }
        assert_eq!(decode(&encode(&value).unwrap()).unwrap(), value);
    }

    #[test]
    fn test_scalars_without_native_column() {
        let big = BigInt::from_str("-123456789012345678901234567890").unwrap();
        let dec = BigDecimal::from_str("3.14159265358979323846264338327950288").unwrap();
        for value in [Value::Short(-7), Value::BigInt(big), Value::BigDecimal(dec)] {
            assert_eq!(decode(&encode(&value).unwrap()).unwrap(), value);
        }
    }

    #[test]
    fn test_record_with_native_scalar_leaf() {
        let value = Value::Record(Record::new("ex:label", "héllo"));
        assert_eq!(decode(&encode(&value).unwrap()).unwrap(), value);
    }

    #[test]
    fn test_overlong_property_is_rejected() {
        let long = "x".repeat(256);
        let value = Value::Record(Record::new(&long, 1));
        assert!(matches!(encode(&value), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_malformed_input() {
        assert!(matches!(decode(&[]), Err(Error::Codec(_))));
        assert!(matches!(decode(&[b'R', 10, b'a']), Err(Error::Codec(_))));
        assert!(matches!(decode(&[b'?']), Err(Error::Codec(_))));
        assert!(matches!(decode(&[b'b', 1, 0]), Err(Error::Codec(_))));
    }

    #[test]
    fn test_adversarial_depth_is_bounded() {
        let mut bytes = Vec::new();
        for _ in 0..=MAX_RECORD_DEPTH {
            bytes.extend_from_slice(&[b'O', 1, b'p']);
        }
        bytes.extend_from_slice(&[b'b', 1]);
        assert!(matches!(decode(&bytes), Err(Error::Codec(_))));
    }
}
