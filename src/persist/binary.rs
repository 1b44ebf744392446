//! Tagged little-endian binary encoding of a [`FieldMap`].
//!
//! Layout: magic `CKFM`, format version (u8), entry count (u32), then per entry the key
//! (u32 length + UTF-8 bytes) followed by a tagged value.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

use super::{FieldMap, FieldValue, PersistError};

const MAGIC: &[u8; 4] = b"CKFM";
const VERSION: u8 = 1;

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_FLOAT: u8 = 3;
const TAG_STR: u8 = 4;
const TAG_LIST: u8 = 5;

pub fn encode<W: Write>(writer: &mut W, data: &FieldMap) -> Result<(), PersistError> {
    writer.write_all(MAGIC)?;
    writer.write_u8(VERSION)?;
    writer.write_u32::<LittleEndian>(len_u32(data.len())?)?;
    for (key, value) in data {
        write_str(writer, key)?;
        write_value(writer, value)?;
    }
    Ok(())
}

pub fn decode<R: Read>(reader: &mut R) -> Result<FieldMap, PersistError> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(PersistError::Binary("bad magic".to_string()));
    }
    let version = reader.read_u8()?;
    if version != VERSION {
        return Err(PersistError::Binary(format!("unknown version {version}")));
    }
    let count = reader.read_u32::<LittleEndian>()?;
    let mut data = FieldMap::new();
    for _ in 0..count {
        let key = read_str(reader)?;
        let value = read_value(reader)?;
        data.insert(key, value);
    }
    Ok(data)
}

fn len_u32(len: usize) -> Result<u32, PersistError> {
    u32::try_from(len).map_err(|_| PersistError::Binary(format!("length {len} too large")))
}

fn write_str<W: Write>(writer: &mut W, s: &str) -> Result<(), PersistError> {
    writer.write_u32::<LittleEndian>(len_u32(s.len())?)?;
    writer.write_all(s.as_bytes())?;
    Ok(())
}

fn read_str<R: Read>(reader: &mut R) -> Result<String, PersistError> {
    let len = reader.read_u32::<LittleEndian>()? as usize;
    let mut buffer = vec![0u8; len];
    reader.read_exact(&mut buffer)?;
    String::from_utf8(buffer).map_err(|e| PersistError::Binary(e.to_string()))
}

fn write_value<W: Write>(writer: &mut W, value: &FieldValue) -> Result<(), PersistError> {
    match value {
        FieldValue::Null => writer.write_u8(TAG_NULL)?,
        FieldValue::Bool(b) => {
            writer.write_u8(TAG_BOOL)?;
            writer.write_u8(u8::from(*b))?;
        }
        FieldValue::Int(i) => {
            writer.write_u8(TAG_INT)?;
            writer.write_i64::<LittleEndian>(*i)?;
        }
        FieldValue::Float(f) => {
            writer.write_u8(TAG_FLOAT)?;
            writer.write_f64::<LittleEndian>(*f)?;
        }
        FieldValue::Str(s) => {
            writer.write_u8(TAG_STR)?;
            write_str(writer, s)?;
        }
        FieldValue::List(items) => {
            writer.write_u8(TAG_LIST)?;
            writer.write_u32::<LittleEndian>(len_u32(items.len())?)?;
            for item in items {
                write_value(writer, item)?;
            }
        }
    }
    Ok(())
}

fn read_value<R: Read>(reader: &mut R) -> Result<FieldValue, PersistError> {
    let tag = reader.read_u8()?;
    Ok(match tag {
        TAG_NULL => FieldValue::Null,
        TAG_BOOL => FieldValue::Bool(reader.read_u8()? != 0),
        TAG_INT => FieldValue::Int(reader.read_i64::<LittleEndian>()?),
        TAG_FLOAT => FieldValue::Float(reader.read_f64::<LittleEndian>()?),
        TAG_STR => FieldValue::Str(read_str(reader)?),
        TAG_LIST => {
            let len = reader.read_u32::<LittleEndian>()?;
            let mut items = Vec::with_capacity(len.min(1 << 16) as usize);
            for _ in 0..len {
                items.push(read_value(reader)?);
            }
            FieldValue::List(items)
        }
        other => return Err(PersistError::Binary(format!("unknown tag {other}"))),
    })
}
