//! `[magic:4][message_size:u32][field_count:u16]{field}*` where each field
//! is `[field_id:u16][data_type:u16][size:u32][bytes]` (§4.1). `message_size`
//! covers everything after itself — `field_count` plus all field bytes —
//! so a reader can bound a single `read_exact` before parsing anything.

use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tio_protocol::wire::{field, DataType, MAGIC};
use tio_protocol::Value;

use super::Frame;
use crate::error::{TioError, TioResult};

pub fn write_frame<W: Write>(w: &mut W, frame: &Frame) -> std::io::Result<()> {
    let mut body = Vec::new();
    let field_count = frame.fields.len() as u16 + 1; // +1 for COMMAND
    body.write_u16::<LittleEndian>(field_count)?;
    write_field(&mut body, field::COMMAND, &Value::String(frame.command.as_bytes().to_vec()))?;
    for (&id, value) in &frame.fields {
        write_field(&mut body, id, value)?;
    }
    w.write_all(&MAGIC)?;
    w.write_u32::<LittleEndian>(body.len() as u32)?;
    w.write_all(&body)?;
    Ok(())
}

fn write_field<W: Write>(w: &mut W, id: u16, value: &Value) -> std::io::Result<()> {
    w.write_u16::<LittleEndian>(id)?;
    value.write_field_body(w).map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
}

/// Reads one frame, having already consumed the magic bytes (the reactor
/// peeks those to pick the protocol before handing the stream to this
/// codec, so they aren't re-checked here).
pub fn read_frame<R: Read>(r: &mut R, max_frame_bytes: u32) -> TioResult<Frame> {
    let message_size = r
        .read_u32::<LittleEndian>()
        .map_err(|e| TioError::BadCommand(format!("reading frame length: {e}")))?;
    if message_size > max_frame_bytes {
        return Err(TioError::OversizeFrame(message_size));
    }
    let mut body = vec![0u8; message_size as usize];
    r.read_exact(&mut body).map_err(|e| TioError::BadCommand(format!("reading frame body: {e}")))?;
    let mut cursor = Cursor::new(body);
    let field_count = cursor
        .read_u16::<LittleEndian>()
        .map_err(|e| TioError::BadCommand(format!("reading field count: {e}")))?;

    let mut frame = Frame::default();
    let mut saw_command = false;
    for _ in 0..field_count {
        let id = cursor
            .read_u16::<LittleEndian>()
            .map_err(|e| TioError::BadCommand(format!("reading field id: {e}")))?;
        let data_type_raw = cursor
            .read_u16::<LittleEndian>()
            .map_err(|e| TioError::BadCommand(format!("reading data type: {e}")))?;
        let data_type = DataType::try_from(data_type_raw)
            .map_err(|e| TioError::BadCommand(format!("unknown data type: {e}")))?;
        let size = cursor
            .read_u32::<LittleEndian>()
            .map_err(|e| TioError::BadCommand(format!("reading field size: {e}")))?;
        let value = Value::read_field_body(&mut cursor, data_type, size, max_frame_bytes)
            .map_err(|e| TioError::BadCommand(format!("reading field body: {e}")))?;

        if id == field::COMMAND {
            frame.command = value.as_str().map(|b| String::from_utf8_lossy(b).to_string()).unwrap_or_default();
            saw_command = true;
        } else {
            frame.fields.insert(id, value);
        }
    }
    if !saw_command {
        return Err(TioError::BadCommand("frame missing COMMAND field".into()));
    }
    Ok(frame)
}
