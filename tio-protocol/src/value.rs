use std::fmt;
use std::io::{self, Read, Write};

use anyhow::{anyhow, Context};
use byteorder::{LittleEndian, ReadBytesExt as _, WriteBytesExt as _};

use crate::wire::DataType;

/// A scalar value flowing through a container: the key, value, or metadata
/// slot of a [`crate::Record`].
///
/// This is a closed, four-variant union rather than an open-ended `enum`
/// with room for extension, because the wire format hard-codes exactly
/// these four data types (see [`crate::wire::DataType`]).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Int(i64),
    Double(f64),
    String(Vec<u8>),
}

impl Default for Value {
    fn default() -> Self {
        Value::None
    }
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::None => DataType::None,
            Value::String(_) => DataType::String,
            Value::Int(_) => DataType::Int,
            Value::Double(_) => DataType::Double,
        }
    }

    pub fn as_str(&self) -> Option<&[u8]> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Writes `self` as a binary field body: `[data_type:u16][size:u32][bytes]`.
    /// The field id itself is written by the caller, since it is a property
    /// of the slot this value occupies, not of the value.
    pub fn write_field_body<W: Write>(&self, w: &mut W) -> anyhow::Result<()> {
        w.write_u16::<LittleEndian>(self.data_type() as u16)?;
        match self {
            Value::None => {
                w.write_u32::<LittleEndian>(0)?;
            }
            Value::String(s) => {
                w.write_u32::<LittleEndian>(s.len() as u32)?;
                w.write_all(s)?;
            }
            Value::Int(i) => {
                w.write_u32::<LittleEndian>(8)?;
                w.write_i64::<LittleEndian>(*i)?;
            }
            Value::Double(d) => {
                w.write_u32::<LittleEndian>(8)?;
                w.write_f64::<LittleEndian>(*d)?;
            }
        }
        Ok(())
    }

    /// Reads back a field body given the `data_type` and `size` already
    /// parsed from the frame header, bounded by `max_bytes` (the codec's
    /// configured oversize-frame cap).
    pub fn read_field_body<R: Read>(
        r: &mut R,
        data_type: DataType,
        size: u32,
        max_bytes: u32,
    ) -> anyhow::Result<Value> {
        if size > max_bytes {
            return Err(anyhow!("oversize field: {} bytes exceeds cap of {}", size, max_bytes));
        }
        match data_type {
            DataType::None => {
                skip(r, size)?;
                Ok(Value::None)
            }
            DataType::String => {
                let mut buf = vec![0u8; size as usize];
                r.read_exact(&mut buf).context("reading string field body")?;
                Ok(Value::String(buf))
            }
            DataType::Int => match size {
                4 => Ok(Value::Int(r.read_i32::<LittleEndian>()? as i64)),
                8 => Ok(Value::Int(r.read_i64::<LittleEndian>()?)),
                other => Err(anyhow!("int field of unsupported size {}", other)),
            },
            DataType::Double => {
                if size != 8 {
                    return Err(anyhow!("double field of unsupported size {}", size));
                }
                Ok(Value::Double(r.read_f64::<LittleEndian>()?))
            }
        }
    }
}

fn skip<R: Read>(r: &mut R, n: u32) -> io::Result<()> {
    let mut remaining = n as u64;
    let mut buf = [0u8; 256];
    while remaining > 0 {
        let chunk = remaining.min(buf.len() as u64) as usize;
        r.read_exact(&mut buf[..chunk])?;
        remaining -= chunk as u64;
    }
    Ok(())
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "n"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Double(d) => write!(f, "{d}"),
            Value::String(s) => write!(f, "{}", String::from_utf8_lossy(s)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip_all_variants() {
        let cases = vec![
            Value::None,
            Value::Int(0),
            Value::Int(-1),
            Value::Int(i64::MAX),
            Value::Double(0.0),
            Value::Double(-3.5),
            Value::String(vec![]),
            Value::String(b"hello world".to_vec()),
        ];

        for v in cases {
            let mut buf = Vec::new();
            v.write_field_body(&mut buf).expect("encode");

            let mut cursor = io::Cursor::new(&buf);
            let data_type_raw = cursor.read_u16::<LittleEndian>().unwrap();
            let data_type = DataType::try_from(data_type_raw).unwrap();
            let size = cursor.read_u32::<LittleEndian>().unwrap();
            let decoded = Value::read_field_body(&mut cursor, data_type, size, u32::MAX).unwrap();
            assert_eq!(v, decoded);
        }
    }
}
