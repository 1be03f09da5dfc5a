//! Byte-stream encoding for values.
//!
//! Used by segment files and groupby spill files. Layout is a one-byte
//! variant tag followed by little-endian fixed-width payloads; variable
//! length payloads are u64 length prefixed.

use std::io::{Read, Write};

use sframe_error::{Result, ResultExt, SframeError};

use super::{DateTimeValue, ImageValue, NdArrayValue, Value};

const TAG_UNDEFINED: u8 = 0;
const TAG_INTEGER: u8 = 1;
const TAG_FLOAT: u8 = 2;
const TAG_STRING: u8 = 3;
const TAG_VECTOR: u8 = 4;
const TAG_LIST: u8 = 5;
const TAG_DICT: u8 = 6;
const TAG_DATETIME: u8 = 7;
const TAG_IMAGE: u8 = 8;
const TAG_NDARRAY: u8 = 9;

pub fn write_u64(out: &mut impl Write, v: u64) -> Result<()> {
    out.write_all(&v.to_le_bytes())?;
    Ok(())
}

pub fn read_u64(input: &mut impl Read) -> Result<u64> {
    let mut buf = [0u8; 8];
    input.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn write_len(out: &mut impl Write, len: usize) -> Result<()> {
    write_u64(out, len as u64)
}

fn read_len(input: &mut impl Read) -> Result<usize> {
    let len = read_u64(input)?;
    usize::try_from(len).map_err(|_| SframeError::new("Length prefix exceeds address space"))
}

/// Encode a single value to a byte stream.
pub fn encode_value(out: &mut impl Write, value: &Value) -> Result<()> {
    match value {
        Value::Undefined => out.write_all(&[TAG_UNDEFINED])?,
        Value::Integer(v) => {
            out.write_all(&[TAG_INTEGER])?;
            out.write_all(&v.to_le_bytes())?;
        }
        Value::Float(v) => {
            out.write_all(&[TAG_FLOAT])?;
            out.write_all(&v.to_le_bytes())?;
        }
        Value::String(v) => {
            out.write_all(&[TAG_STRING])?;
            write_len(out, v.len())?;
            out.write_all(v.as_bytes())?;
        }
        Value::Vector(v) => {
            out.write_all(&[TAG_VECTOR])?;
            write_len(out, v.len())?;
            for f in v {
                out.write_all(&f.to_le_bytes())?;
            }
        }
        Value::List(v) => {
            out.write_all(&[TAG_LIST])?;
            write_len(out, v.len())?;
            for item in v {
                encode_value(out, item)?;
            }
        }
        Value::Dict(v) => {
            out.write_all(&[TAG_DICT])?;
            write_len(out, v.len())?;
            for (k, val) in v {
                encode_value(out, k)?;
                encode_value(out, val)?;
            }
        }
        Value::DateTime(v) => {
            out.write_all(&[TAG_DATETIME])?;
            out.write_all(&v.posix.to_le_bytes())?;
            out.write_all(&v.tz_offset_15min.to_le_bytes())?;
            out.write_all(&v.microsecond.to_le_bytes())?;
        }
        Value::Image(v) => {
            out.write_all(&[TAG_IMAGE])?;
            out.write_all(&v.width.to_le_bytes())?;
            out.write_all(&v.height.to_le_bytes())?;
            out.write_all(&v.channels.to_le_bytes())?;
            out.write_all(&[v.format])?;
            write_len(out, v.data.len())?;
            out.write_all(&v.data)?;
        }
        Value::NdArray(v) => {
            out.write_all(&[TAG_NDARRAY])?;
            write_len(out, v.shape.len())?;
            for dim in &v.shape {
                write_u64(out, *dim as u64)?;
            }
            write_len(out, v.data.len())?;
            for f in &v.data {
                out.write_all(&f.to_le_bytes())?;
            }
        }
    }
    Ok(())
}

/// Decode a single value from a byte stream.
pub fn decode_value(input: &mut impl Read) -> Result<Value> {
    let mut tag = [0u8; 1];
    input.read_exact(&mut tag).context("Reading value tag")?;

    Ok(match tag[0] {
        TAG_UNDEFINED => Value::Undefined,
        TAG_INTEGER => {
            let mut buf = [0u8; 8];
            input.read_exact(&mut buf)?;
            Value::Integer(i64::from_le_bytes(buf))
        }
        TAG_FLOAT => {
            let mut buf = [0u8; 8];
            input.read_exact(&mut buf)?;
            Value::Float(f64::from_le_bytes(buf))
        }
        TAG_STRING => {
            let len = read_len(input)?;
            let mut buf = vec![0u8; len];
            input.read_exact(&mut buf)?;
            let s = String::from_utf8(buf)
                .map_err(|e| SframeError::with_source("Invalid UTF8 in string value", e))?;
            Value::String(s)
        }
        TAG_VECTOR => {
            let len = read_len(input)?;
            let mut vals = Vec::with_capacity(len);
            let mut buf = [0u8; 8];
            for _ in 0..len {
                input.read_exact(&mut buf)?;
                vals.push(f64::from_le_bytes(buf));
            }
            Value::Vector(vals)
        }
        TAG_LIST => {
            let len = read_len(input)?;
            let mut vals = Vec::with_capacity(len);
            for _ in 0..len {
                vals.push(decode_value(input)?);
            }
            Value::List(vals)
        }
        TAG_DICT => {
            let len = read_len(input)?;
            let mut pairs = Vec::with_capacity(len);
            for _ in 0..len {
                let k = decode_value(input)?;
                let v = decode_value(input)?;
                pairs.push((k, v));
            }
            Value::Dict(pairs)
        }
        TAG_DATETIME => {
            let mut b8 = [0u8; 8];
            let mut b4 = [0u8; 4];
            input.read_exact(&mut b8)?;
            let posix = i64::from_le_bytes(b8);
            input.read_exact(&mut b4)?;
            let tz_offset_15min = i32::from_le_bytes(b4);
            input.read_exact(&mut b4)?;
            let microsecond = u32::from_le_bytes(b4);
            Value::DateTime(DateTimeValue {
                posix,
                tz_offset_15min,
                microsecond,
            })
        }
        TAG_IMAGE => {
            let mut b4 = [0u8; 4];
            input.read_exact(&mut b4)?;
            let width = u32::from_le_bytes(b4);
            input.read_exact(&mut b4)?;
            let height = u32::from_le_bytes(b4);
            input.read_exact(&mut b4)?;
            let channels = u32::from_le_bytes(b4);
            let mut fmt = [0u8; 1];
            input.read_exact(&mut fmt)?;
            let len = read_len(input)?;
            let mut data = vec![0u8; len];
            input.read_exact(&mut data)?;
            Value::Image(ImageValue {
                width,
                height,
                channels,
                format: fmt[0],
                data,
            })
        }
        TAG_NDARRAY => {
            let ndim = read_len(input)?;
            let mut shape = Vec::with_capacity(ndim);
            for _ in 0..ndim {
                shape.push(read_u64(input)? as usize);
            }
            let len = read_len(input)?;
            let mut data = Vec::with_capacity(len);
            let mut buf = [0u8; 8];
            for _ in 0..len {
                input.read_exact(&mut buf)?;
                data.push(f64::from_le_bytes(buf));
            }
            Value::NdArray(NdArrayValue { shape, data })
        }
        other => return Err(SframeError::new(format!("Unknown value tag {other}"))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(v: Value) -> Value {
        let mut buf = Vec::new();
        encode_value(&mut buf, &v).unwrap();
        decode_value(&mut buf.as_slice()).unwrap()
    }

    #[test]
    fn scalar_roundtrips() {
        for v in [
            Value::Undefined,
            Value::Integer(-42),
            Value::Float(2.5),
            Value::String("hello".into()),
            Value::Vector(vec![1.0, -2.0, 3.5]),
        ] {
            assert_eq!(v, roundtrip(v.clone()));
        }
    }

    #[test]
    fn nested_roundtrips() {
        let v = Value::Dict(vec![
            (Value::String("a".into()), Value::List(vec![1.into(), 2.into()])),
            (Value::Integer(7), Value::Undefined),
        ]);
        assert_eq!(v, roundtrip(v.clone()));
    }

    #[test]
    fn datetime_roundtrip() {
        let v = Value::DateTime(DateTimeValue {
            posix: 1_700_000_000,
            tz_offset_15min: -20,
            microsecond: 123_456,
        });
        assert_eq!(v, roundtrip(v.clone()));
    }

    #[test]
    fn truncated_stream_errors() {
        let mut buf = Vec::new();
        encode_value(&mut buf, &Value::String("hello".into())).unwrap();
        buf.truncate(buf.len() - 2);
        assert!(decode_value(&mut buf.as_slice()).is_err());
    }
}
