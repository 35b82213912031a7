//! Two coexisting framings chosen per connection on first meaningful byte
//! (§4.1): binary frames prefixed with a magic + length, or text lines
//! terminated `\r\n`. Both produce/consume the same [`Frame`] shape so the
//! dispatcher doesn't need to know which protocol a session is speaking.

pub mod binary;
pub mod text;

use std::collections::HashMap;

use tio_protocol::wire::field;
use tio_protocol::Value;

/// A parsed command, protocol-agnostic: the command word plus whatever
/// fields it carried. Binary frames arrive as field-id keyed maps already;
/// text lines are parsed into the same shape positionally per command.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    pub command: String,
    pub fields: HashMap<u16, Value>,
    /// Positional arguments as parsed from a text-protocol command line
    /// (empty for binary frames, which carry everything in `fields`).
    /// Text-mode command handlers read these directly rather than forcing
    /// every command's argument shape through the field-id table.
    pub args: Vec<String>,
}

impl Frame {
    pub fn new(command: impl Into<String>) -> Self {
        Frame { command: command.into(), fields: HashMap::new(), args: Vec::new() }
    }

    pub fn with_field(mut self, id: u16, value: Value) -> Self {
        self.fields.insert(id, value);
        self
    }

    pub fn get(&self, id: u16) -> Option<&Value> {
        self.fields.get(&id)
    }

    pub fn handle(&self) -> Option<u32> {
        match self.get(field::HANDLE) {
            Some(Value::Int(i)) => Some(*i as u32),
            _ => None,
        }
    }

    pub fn container_name(&self) -> Option<String> {
        self.string_field(field::CONTAINER_NAME)
    }

    pub fn container_type(&self) -> Option<String> {
        self.string_field(field::CONTAINER_TYPE)
    }

    pub fn group_name(&self) -> Option<String> {
        self.string_field(field::GROUP_NAME)
    }

    pub fn start_spec(&self) -> String {
        self.string_field(field::START).unwrap_or_default()
    }

    pub fn key(&self) -> Value {
        self.get(field::KEY).cloned().unwrap_or(Value::None)
    }

    pub fn value(&self) -> Value {
        self.get(field::VALUE).cloned().unwrap_or(Value::None)
    }

    pub fn metadata(&self) -> Value {
        self.get(field::METADATA).cloned().unwrap_or(Value::None)
    }

    fn string_field(&self, id: u16) -> Option<String> {
        match self.get(id) {
            Some(Value::String(s)) => Some(String::from_utf8_lossy(s).to_string()),
            _ => None,
        }
    }
}

/// Formats one event (live, snapshot, or `snapshot_end`) as an outbound
/// frame for `mode`. Shared by the Publisher (live events) and the
/// snapshot task (synthetic `snapshot`/`snapshot_end` events) so both
/// paths agree on wire shape.
pub fn encode_event_frame(
    mode: crate::session::ProtocolMode,
    handle: u32,
    event_name: &str,
    record: Option<&tio_protocol::Record>,
) -> Vec<u8> {
    use crate::session::ProtocolMode;
    match mode {
        ProtocolMode::Text | ProtocolMode::HttpOneShot => text::encode_event(handle, event_name, record).into_bytes(),
        ProtocolMode::Binary => {
            let mut frame = Frame::new("event")
                .with_field(field::HANDLE, Value::Int(handle as i64))
                .with_field(field::EVENT_CODE, Value::String(event_name.as_bytes().to_vec()));
            if let Some(r) = record {
                frame = frame
                    .with_field(field::KEY, r.key.clone())
                    .with_field(field::VALUE, r.value.clone())
                    .with_field(field::METADATA, r.metadata.clone());
            }
            let mut buf = Vec::new();
            binary::write_frame(&mut buf, &frame).expect("encoding an event frame to a Vec cannot fail");
            buf
        }
    }
}

/// Formats an `answer ok`/`answer error` outcome for `mode`.
pub fn encode_answer_frame(mode: crate::session::ProtocolMode, result: &Result<Option<Value>, crate::error::TioError>) -> Vec<u8> {
    use crate::session::ProtocolMode;
    match mode {
        ProtocolMode::Text | ProtocolMode::HttpOneShot => match result {
            Ok(tail) => text::encode_answer_ok(tail.as_ref().map(|v| v.to_string()).as_deref()).into_bytes(),
            Err(e) => text::encode_answer_error(e).into_bytes(),
        },
        ProtocolMode::Binary => {
            let frame = match result {
                Ok(tail) => {
                    let mut f = Frame::new("answer_ok");
                    if let Some(v) = tail {
                        f = f.with_field(field::VALUE, v.clone());
                    }
                    f
                }
                Err(e) => Frame::new("answer_error")
                    .with_field(field::ERROR_MESSAGE, Value::String(e.to_string().into_bytes()))
                    .with_field(field::ERROR_CODE, Value::Int(e.code() as i64)),
            };
            let mut buf = Vec::new();
            binary::write_frame(&mut buf, &frame).expect("encoding an answer frame to a Vec cannot fail");
            buf
        }
    }
}
