//! Brine: a compact, self-describing codec for [`Value`].
//!
//! Every value starts with a one-byte tag. Singletons and small integers are
//! a single byte; short strings, byte strings and tuples carry their length in
//! the tag; longer ones use a one-byte or four-byte big-endian length.
//! Integers outside the immediate window are big-endian two's complement.
//!
//! ```text
//! 0x00..=0x07  singletons (None, '', (), True, False, NotImplemented, ..., b'')
//! 0x08..=0x0D  str     (L1, L4, len 1..=4)
//! 0x0E..=0x13  bytes   (L1, L4, len 1..=4)
//! 0x14..=0x19  tuple   (len 1..=4, L1, L4)
//! 0x1A..=0x1B  int     (L1, L4)
//! 0x1C..=0x1F  float, complex, slice, frozenset
//! 0x20..=0xEF  immediate ints -48..=159
//! ```
//!
//! The encoder always picks the shortest form, so encoding is deterministic.

use crate::config::CodecConfig;
use crate::value::{FrozenSet, Value};
use num_bigint::BigInt;
use num_traits::ToPrimitive;
use thiserror::Error;

const TAG_NONE: u8 = 0x00;
const TAG_EMPTY_STR: u8 = 0x01;
const TAG_EMPTY_TUPLE: u8 = 0x02;
const TAG_TRUE: u8 = 0x03;
const TAG_FALSE: u8 = 0x04;
const TAG_NOT_IMPLEMENTED: u8 = 0x05;
const TAG_ELLIPSIS: u8 = 0x06;
const TAG_EMPTY_BYTES: u8 = 0x07;
const TAG_STR_L1: u8 = 0x08;
const TAG_STR_L4: u8 = 0x09;
const TAG_STR1: u8 = 0x0A;
const TAG_STR4: u8 = 0x0D;
const TAG_BYTES_L1: u8 = 0x0E;
const TAG_BYTES_L4: u8 = 0x0F;
const TAG_BYTES1: u8 = 0x10;
const TAG_BYTES4: u8 = 0x13;
const TAG_TUP1: u8 = 0x14;
const TAG_TUP4: u8 = 0x17;
const TAG_TUP_L1: u8 = 0x18;
const TAG_TUP_L4: u8 = 0x19;
const TAG_INT_L1: u8 = 0x1A;
const TAG_INT_L4: u8 = 0x1B;
const TAG_FLOAT: u8 = 0x1C;
const TAG_COMPLEX: u8 = 0x1D;
const TAG_SLICE: u8 = 0x1E;
const TAG_FSET: u8 = 0x1F;
const TAG_IMM_FIRST: u8 = 0x20;
const TAG_IMM_LAST: u8 = 0xEF;

const IMM_MIN: i64 = -0x30;
const IMM_MAX: i64 = 0x9F;
const IMM_BIAS: i64 = 0x50;

/// Errors produced by the brine codec.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrineError {
    #[error("truncated input at offset {offset}: needed {needed} more bytes")]
    Truncated { offset: usize, needed: usize },

    #[error("unknown tag 0x{tag:02x} at offset {offset}")]
    UnknownTag { tag: u8, offset: usize },

    #[error("invalid UTF-8 in string at offset {0}")]
    InvalidUtf8(usize),

    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),

    #[error("cannot serialize object of type {0}")]
    Undumpable(String),

    #[error("length {0} exceeds the four-byte length field")]
    TooLarge(usize),

    #[error("nesting deeper than {0} levels")]
    NestingTooDeep(usize),

    #[error("malformed input: {0}")]
    Malformed(String),
}

/// Encode a value into a fresh buffer.
pub fn dump(value: &Value) -> Result<Vec<u8>, BrineError> {
    let mut out = Vec::new();
    dump_into(value, &mut out)?;
    Ok(out)
}

/// Encode a value, appending to `out`.
pub fn dump_into(value: &Value, out: &mut Vec<u8>) -> Result<(), BrineError> {
    encode(value, out, 0)
}

/// Decode exactly one value from `data`; trailing bytes are an error.
pub fn load(data: &[u8]) -> Result<Value, BrineError> {
    let mut decoder = Decoder { data, pos: 0 };
    let value = decoder.value(0)?;
    let rest = data.len() - decoder.pos;
    if rest > 0 {
        return Err(BrineError::TrailingBytes(rest));
    }
    Ok(value)
}

fn check_depth(depth: usize) -> Result<(), BrineError> {
    if depth > CodecConfig::MAX_NESTING_DEPTH {
        return Err(BrineError::NestingTooDeep(CodecConfig::MAX_NESTING_DEPTH));
    }
    Ok(())
}

fn encode(value: &Value, out: &mut Vec<u8>, depth: usize) -> Result<(), BrineError> {
    check_depth(depth)?;
    match value {
        Value::None => out.push(TAG_NONE),
        Value::Bool(true) => out.push(TAG_TRUE),
        Value::Bool(false) => out.push(TAG_FALSE),
        Value::NotImplemented => out.push(TAG_NOT_IMPLEMENTED),
        Value::Ellipsis => out.push(TAG_ELLIPSIS),
        Value::Int(i) => encode_int(i, out)?,
        Value::Float(f) => {
            out.push(TAG_FLOAT);
            out.extend_from_slice(&f.to_be_bytes());
        }
        Value::Complex(re, im) => {
            out.push(TAG_COMPLEX);
            out.extend_from_slice(&re.to_be_bytes());
            out.extend_from_slice(&im.to_be_bytes());
        }
        Value::Str(s) => encode_sized(
            s.as_bytes(),
            out,
            TAG_EMPTY_STR,
            TAG_STR1,
            TAG_STR_L1,
            TAG_STR_L4,
        )?,
        Value::Bytes(b) => encode_sized(
            b,
            out,
            TAG_EMPTY_BYTES,
            TAG_BYTES1,
            TAG_BYTES_L1,
            TAG_BYTES_L4,
        )?,
        Value::Tuple(items) => encode_tuple(items, out, depth)?,
        Value::FrozenSet(set) => {
            out.push(TAG_FSET);
            encode_tuple(set.items(), out, depth)?;
        }
        Value::Slice(slice) => {
            out.push(TAG_SLICE);
            encode(&slice.start, out, depth + 1)?;
            encode(&slice.stop, out, depth + 1)?;
            encode(&slice.step, out, depth + 1)?;
        }
    }
    Ok(())
}

fn encode_int(i: &BigInt, out: &mut Vec<u8>) -> Result<(), BrineError> {
    if let Some(small) = i.to_i64().filter(|v| (IMM_MIN..=IMM_MAX).contains(v)) {
        out.push((small + IMM_BIAS) as u8);
        return Ok(());
    }
    let bytes = i.to_signed_bytes_be();
    if bytes.len() < 256 {
        out.push(TAG_INT_L1);
        out.push(bytes.len() as u8);
    } else {
        out.push(TAG_INT_L4);
        out.extend_from_slice(&length_u32(bytes.len())?.to_be_bytes());
    }
    out.extend_from_slice(&bytes);
    Ok(())
}

fn encode_sized(
    data: &[u8],
    out: &mut Vec<u8>,
    empty: u8,
    first_short: u8,
    l1: u8,
    l4: u8,
) -> Result<(), BrineError> {
    match data.len() {
        0 => out.push(empty),
        n @ 1..=4 => out.push(first_short + (n as u8 - 1)),
        n if n < 256 => {
            out.push(l1);
            out.push(n as u8);
        }
        n => {
            out.push(l4);
            out.extend_from_slice(&length_u32(n)?.to_be_bytes());
        }
    }
    out.extend_from_slice(data);
    Ok(())
}

fn encode_tuple(items: &[Value], out: &mut Vec<u8>, depth: usize) -> Result<(), BrineError> {
    match items.len() {
        0 => out.push(TAG_EMPTY_TUPLE),
        n @ 1..=4 => out.push(TAG_TUP1 + (n as u8 - 1)),
        n if n < 256 => {
            out.push(TAG_TUP_L1);
            out.push(n as u8);
        }
        n => {
            out.push(TAG_TUP_L4);
            out.extend_from_slice(&length_u32(n)?.to_be_bytes());
        }
    }
    for item in items {
        encode(item, out, depth + 1)?;
    }
    Ok(())
}

fn length_u32(len: usize) -> Result<u32, BrineError> {
    u32::try_from(len).map_err(|_| BrineError::TooLarge(len))
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], BrineError> {
        let available = self.data.len() - self.pos;
        if available < n {
            return Err(BrineError::Truncated {
                offset: self.pos,
                needed: n - available,
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn byte(&mut self) -> Result<u8, BrineError> {
        Ok(self.take(1)?[0])
    }

    fn len_u8(&mut self) -> Result<usize, BrineError> {
        Ok(self.byte()? as usize)
    }

    fn len_u32(&mut self) -> Result<usize, BrineError> {
        let raw = self.take(4)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize)
    }

    fn f64(&mut self) -> Result<f64, BrineError> {
        let raw = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(raw);
        Ok(f64::from_be_bytes(buf))
    }

    fn string(&mut self, len: usize) -> Result<Value, BrineError> {
        let offset = self.pos;
        let raw = self.take(len)?;
        let s = std::str::from_utf8(raw).map_err(|_| BrineError::InvalidUtf8(offset))?;
        Ok(Value::Str(s.to_string()))
    }

    fn bytes(&mut self, len: usize) -> Result<Value, BrineError> {
        Ok(Value::Bytes(self.take(len)?.to_vec()))
    }

    fn items(&mut self, count: usize, depth: usize) -> Result<Vec<Value>, BrineError> {
        // Every item is at least one byte, so the remaining input bounds the
        // allocation even for a hostile length field.
        let mut items = Vec::with_capacity(count.min(self.data.len() - self.pos));
        for _ in 0..count {
            items.push(self.value(depth + 1)?);
        }
        Ok(items)
    }

    fn tuple(&mut self, depth: usize) -> Result<Vec<Value>, BrineError> {
        let offset = self.pos;
        let tag = self.byte()?;
        let count = match tag {
            TAG_EMPTY_TUPLE => 0,
            TAG_TUP1..=TAG_TUP4 => (tag - TAG_TUP1 + 1) as usize,
            TAG_TUP_L1 => self.len_u8()?,
            TAG_TUP_L4 => self.len_u32()?,
            _ => {
                return Err(BrineError::Malformed(format!(
                    "expected tuple tag at offset {}, found 0x{:02x}",
                    offset, tag
                )))
            }
        };
        self.items(count, depth)
    }

    fn value(&mut self, depth: usize) -> Result<Value, BrineError> {
        check_depth(depth)?;
        let offset = self.pos;
        let tag = self.byte()?;
        let value = match tag {
            TAG_NONE => Value::None,
            TAG_EMPTY_STR => Value::Str(String::new()),
            TAG_EMPTY_TUPLE => Value::Tuple(Vec::new()),
            TAG_TRUE => Value::Bool(true),
            TAG_FALSE => Value::Bool(false),
            TAG_NOT_IMPLEMENTED => Value::NotImplemented,
            TAG_ELLIPSIS => Value::Ellipsis,
            TAG_EMPTY_BYTES => Value::Bytes(Vec::new()),
            TAG_STR_L1 => {
                let len = self.len_u8()?;
                self.string(len)?
            }
            TAG_STR_L4 => {
                let len = self.len_u32()?;
                self.string(len)?
            }
            TAG_STR1..=TAG_STR4 => self.string((tag - TAG_STR1 + 1) as usize)?,
            TAG_BYTES_L1 => {
                let len = self.len_u8()?;
                self.bytes(len)?
            }
            TAG_BYTES_L4 => {
                let len = self.len_u32()?;
                self.bytes(len)?
            }
            TAG_BYTES1..=TAG_BYTES4 => self.bytes((tag - TAG_BYTES1 + 1) as usize)?,
            TAG_TUP1..=TAG_TUP4 => {
                Value::Tuple(self.items((tag - TAG_TUP1 + 1) as usize, depth)?)
            }
            TAG_TUP_L1 => {
                let count = self.len_u8()?;
                Value::Tuple(self.items(count, depth)?)
            }
            TAG_TUP_L4 => {
                let count = self.len_u32()?;
                Value::Tuple(self.items(count, depth)?)
            }
            TAG_INT_L1 | TAG_INT_L4 => {
                let len = if tag == TAG_INT_L1 {
                    self.len_u8()?
                } else {
                    self.len_u32()?
                };
                Value::Int(BigInt::from_signed_bytes_be(self.take(len)?))
            }
            TAG_FLOAT => Value::Float(self.f64()?),
            TAG_COMPLEX => {
                let re = self.f64()?;
                let im = self.f64()?;
                Value::Complex(re, im)
            }
            TAG_SLICE => {
                let start = self.value(depth + 1)?;
                let stop = self.value(depth + 1)?;
                let step = self.value(depth + 1)?;
                Value::slice(start, stop, step)
            }
            TAG_FSET => Value::FrozenSet(FrozenSet::new(self.tuple(depth)?)),
            TAG_IMM_FIRST..=TAG_IMM_LAST => Value::Int(BigInt::from(tag as i64 - IMM_BIAS)),
            _ => return Err(BrineError::UnknownTag { tag, offset }),
        };
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: Value) -> Vec<u8> {
        let encoded = dump(&value).unwrap();
        assert_eq!(load(&encoded).unwrap(), value, "roundtrip of {:?}", value);
        assert_eq!(dump(&value).unwrap(), encoded, "deterministic {:?}", value);
        encoded
    }

    #[test]
    fn test_singletons_are_one_byte() {
        for value in [
            Value::None,
            Value::Bool(true),
            Value::Bool(false),
            Value::NotImplemented,
            Value::Ellipsis,
            Value::from(""),
            Value::Tuple(vec![]),
            Value::Bytes(vec![]),
        ] {
            assert_eq!(roundtrip(value).len(), 1);
        }
    }

    #[test]
    fn test_immediate_int_window() {
        assert_eq!(roundtrip(Value::from(-48)), vec![0x20]);
        assert_eq!(roundtrip(Value::from(0)), vec![0x50]);
        assert_eq!(roundtrip(Value::from(159)), vec![0xEF]);
        // Just outside the window on both sides
        assert_eq!(roundtrip(Value::from(160)), vec![TAG_INT_L1, 2, 0x00, 0xA0]);
        assert_eq!(roundtrip(Value::from(-49)), vec![TAG_INT_L1, 1, 0xCF]);
    }

    #[test]
    fn test_big_integers() {
        let huge: BigInt = BigInt::from(1u8) << 4000;
        let encoded = roundtrip(Value::Int(huge.clone()));
        assert_eq!(encoded[0], TAG_INT_L4);
        roundtrip(Value::Int(-huge));
        roundtrip(Value::from(i64::MIN));
        roundtrip(Value::from(u64::MAX));
    }

    #[test]
    fn test_string_forms_pick_shortest() {
        assert_eq!(roundtrip(Value::from("a")), vec![TAG_STR1, b'a']);
        assert_eq!(roundtrip(Value::from("abcd"))[0], TAG_STR4);
        assert_eq!(roundtrip(Value::from("abcde"))[..2], [TAG_STR_L1, 5]);
        assert_eq!(roundtrip(Value::from("x".repeat(300)))[0], TAG_STR_L4);
        assert_eq!(roundtrip(Value::from("héllo")).len(), 2 + "héllo".len());
        assert_eq!(roundtrip(Value::bytes(vec![1, 2]))[0], TAG_BYTES1 + 1);
        assert_eq!(roundtrip(Value::bytes(vec![7; 256]))[0], TAG_BYTES_L4);
    }

    #[test]
    fn test_nested_containers() {
        let value = Value::tuple([
            Value::from(1),
            Value::tuple([Value::from("x"), Value::None]),
            Value::FrozenSet(FrozenSet::new([Value::from(2), Value::from(1)])),
            Value::slice(Value::from(1), Value::None, Value::from(-1)),
            Value::Complex(1.5, -2.0),
            Value::Float(f64::INFINITY),
        ]);
        roundtrip(value);

        let long = Value::Tuple((0..300).map(Value::from).collect());
        assert_eq!(roundtrip(long)[0], TAG_TUP_L4);
    }

    #[test]
    fn test_frozenset_encoding_ignores_insertion_order() {
        let a = Value::FrozenSet(FrozenSet::new([Value::from("b"), Value::from("a")]));
        let b = Value::FrozenSet(FrozenSet::new([Value::from("a"), Value::from("b")]));
        assert_eq!(dump(&a).unwrap(), dump(&b).unwrap());
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(
            load(&[TAG_STR_L1, 10, b'a']),
            Err(BrineError::Truncated { offset: 2, needed: 9 })
        );
        assert_eq!(
            load(&[0xF5]),
            Err(BrineError::UnknownTag { tag: 0xF5, offset: 0 })
        );
        assert_eq!(load(&[TAG_NONE, TAG_NONE]), Err(BrineError::TrailingBytes(1)));
        assert_eq!(load(&[TAG_STR1 + 1, 0xC3, 0x28]), Err(BrineError::InvalidUtf8(1)));
        assert!(matches!(
            load(&[TAG_FSET, TAG_NONE]),
            Err(BrineError::Malformed(_))
        ));
    }

    #[test]
    fn test_hostile_length_does_not_allocate() {
        let data = [TAG_TUP_L4, 0xFF, 0xFF, 0xFF, 0xFF, TAG_NONE];
        assert!(matches!(load(&data), Err(BrineError::Truncated { .. })));
    }

    #[test]
    fn test_nesting_limit() {
        let mut data = vec![TAG_TUP1; CodecConfig::MAX_NESTING_DEPTH + 2];
        data.push(TAG_NONE);
        assert_eq!(
            load(&data),
            Err(BrineError::NestingTooDeep(CodecConfig::MAX_NESTING_DEPTH))
        );
    }
}
