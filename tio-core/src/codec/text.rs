//! Line-based protocol: `<cmd> <args...>\r\n`, optionally followed by a
//! `<payload_len>\r\n<payload_bytes>` carrying the (key, value, metadata)
//! triple (§4.1). Responses: `answer ok[ <tail>]\r\n`, `answer error
//! <message>\r\n`, and `event <handle> <event_name> <payload>\r\n`.

use std::io::{BufRead, Read};

use tio_protocol::wire::field;
use tio_protocol::{Record, Value};

use super::Frame;
use crate::error::{TioError, TioResult};

/// Commands whose text-protocol line ends in a trailing payload length
/// followed by a (key, value, metadata) triple on the next line.
fn command_has_payload(cmd: &str) -> bool {
    matches!(cmd, "push_back" | "push_front" | "set" | "insert" | "propset" | "modify")
}

/// Reads one command line (skipping blank/whitespace-only lines, which are
/// accepted as no-ops per the codec's leniency) and, for payload-bearing
/// commands, the payload that follows. Returns `Ok(None)` at EOF.
pub fn read_frame<R: BufRead>(r: &mut R, max_frame_bytes: u32) -> TioResult<Option<Frame>> {
    loop {
        let mut line = String::new();
        let n = r.read_line(&mut line).map_err(|e| TioError::BadCommand(format!("reading line: {e}")))?;
        if n == 0 {
            return Ok(None);
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.trim().is_empty() {
            continue;
        }
        let mut tokens: Vec<String> = trimmed.split_whitespace().map(str::to_string).collect();
        let command = tokens.remove(0);

        let mut frame = Frame::new(command.clone());
        if command_has_payload(&command) {
            let len_token = tokens.pop().ok_or_else(|| TioError::BadCommand(format!("{command}: missing payload length")))?;
            let len: u32 = len_token
                .parse()
                .map_err(|_| TioError::BadCommand(format!("{command}: bad payload length '{len_token}'")))?;
            if len > max_frame_bytes {
                return Err(TioError::OversizeFrame(len));
            }
            frame.args = tokens;
            let mut payload = vec![0u8; len as usize];
            r.read_exact(&mut payload).map_err(|e| TioError::BadCommand(format!("reading payload: {e}")))?;
            let record = parse_payload(&payload)?;
            frame.fields.insert(field::KEY, record.key);
            frame.fields.insert(field::VALUE, record.value);
            frame.fields.insert(field::METADATA, record.metadata);
            // payload lines are still terminated; consume the trailing CRLF.
            let mut tail = String::new();
            let _ = r.read_line(&mut tail);
        } else {
            frame.args = tokens;
        }
        return Ok(Some(frame));
    }
}

/// `<type-letter><length> <bytes>` for each of key, value, metadata, back
/// to back with no separator beyond what each item's own length implies.
fn parse_payload(bytes: &[u8]) -> TioResult<Record> {
    let mut pos = 0;
    let key = parse_value_item(bytes, &mut pos)?;
    let value = parse_value_item(bytes, &mut pos)?;
    let metadata = parse_value_item(bytes, &mut pos)?;
    Ok(Record::new(key, value, metadata))
}

fn parse_value_item(bytes: &[u8], pos: &mut usize) -> TioResult<Value> {
    if *pos >= bytes.len() {
        return Err(TioError::BadCommand("truncated payload item".into()));
    }
    let type_letter = bytes[*pos] as char;
    *pos += 1;
    let space_idx = bytes[*pos..]
        .iter()
        .position(|&b| b == b' ')
        .ok_or_else(|| TioError::BadCommand("missing length separator in payload item".into()))?;
    let len_str = std::str::from_utf8(&bytes[*pos..*pos + space_idx])
        .map_err(|_| TioError::BadCommand("non-utf8 payload length".into()))?;
    let len: usize = len_str.parse().map_err(|_| TioError::BadCommand(format!("bad payload item length '{len_str}'")))?;
    *pos += space_idx + 1;
    if *pos + len > bytes.len() {
        return Err(TioError::BadCommand("payload item length exceeds payload".into()));
    }
    let item_bytes = &bytes[*pos..*pos + len];
    *pos += len;
    let value = match type_letter {
        'n' => Value::None,
        's' => Value::String(item_bytes.to_vec()),
        'i' => {
            let s = std::str::from_utf8(item_bytes).map_err(|_| TioError::BadCommand("non-utf8 int payload item".into()))?;
            Value::Int(s.parse().map_err(|_| TioError::BadCommand(format!("bad int payload item '{s}'")))?)
        }
        'd' => {
            let s = std::str::from_utf8(item_bytes).map_err(|_| TioError::BadCommand("non-utf8 double payload item".into()))?;
            Value::Double(s.parse().map_err(|_| TioError::BadCommand(format!("bad double payload item '{s}'")))?)
        }
        other => return Err(TioError::BadCommand(format!("unknown payload type letter '{other}'"))),
    };
    Ok(value)
}

fn encode_value_item(v: &Value) -> String {
    match v {
        Value::None => "n0 ".to_string(),
        Value::String(s) => {
            let text = String::from_utf8_lossy(s);
            format!("s{} {}", text.len(), text)
        }
        Value::Int(i) => {
            let s = i.to_string();
            format!("i{} {}", s.len(), s)
        }
        Value::Double(d) => {
            let s = d.to_string();
            format!("d{} {}", s.len(), s)
        }
    }
}

pub fn encode_payload(record: &Record) -> String {
    format!(
        "{}{}{}",
        encode_value_item(&record.key),
        encode_value_item(&record.value),
        encode_value_item(&record.metadata),
    )
}

pub fn encode_answer_ok(tail: Option<&str>) -> String {
    match tail {
        Some(t) if !t.is_empty() => format!("answer ok {t}\r\n"),
        _ => "answer ok\r\n".to_string(),
    }
}

pub fn encode_answer_error(err: &TioError) -> String {
    format!("answer error {err}\r\n")
}

pub fn encode_event(handle: u32, event_name: &str, payload: Option<&Record>) -> String {
    match payload {
        Some(r) => format!("event {handle} {event_name} {}\r\n", encode_payload(r)),
        None => format!("event {handle} {event_name}\r\n"),
    }
}
