//! Pluggable wire encoding for kernel messages.
//!
//! The connection negotiates a subprotocol at socket-open time and picks the
//! matching serializer:
//!
//! - default (no subprotocol): one JSON object per frame, binary buffers
//!   base64-encoded in a `buffers` array
//! - `v1.kernel.websocket.jupyter.org`: binary offset-table framing
//!
//! ```text
//! [8 bytes: segment count (little-endian u64)]
//! [count * 8 bytes: absolute segment offsets (little-endian u64)]
//! [segments: channel, header, parent_header, metadata, content, buffers...]
//! ```
//!
//! An absent `parent_header` is encoded as `{}` on the wire in both forms.

use base64::prelude::*;
use bytes::Bytes;
use serde_json::Value;

use crate::error::KernelError;
use crate::messages::{Channel, Header, KernelMessage};

/// Subprotocol name for the binary offset-table encoding.
pub const V1_PROTOCOL: &str = "v1.kernel.websocket.jupyter.org";

/// Fixed segments before buffers: channel, header, parent, metadata, content.
const FIXED_SEGMENTS: usize = 5;

/// A single frame on the wire, text or binary.
#[derive(Debug, Clone, PartialEq)]
pub enum WireFrame {
    Text(String),
    Binary(Vec<u8>),
}

/// Converts messages to and from wire frames.
pub trait MessageSerializer: Send + Sync {
    fn serialize(&self, msg: &KernelMessage) -> Result<WireFrame, KernelError>;
    fn deserialize(&self, frame: WireFrame) -> Result<KernelMessage, KernelError>;
}

/// Pick the serializer for a negotiated subprotocol.
pub fn serializer_for(subprotocol: Option<&str>) -> std::sync::Arc<dyn MessageSerializer> {
    match subprotocol {
        Some(V1_PROTOCOL) => std::sync::Arc::new(BinarySerializer),
        _ => std::sync::Arc::new(JsonSerializer),
    }
}

/// Default JSON encoding with base64 buffers.
pub struct JsonSerializer;

impl MessageSerializer for JsonSerializer {
    fn serialize(&self, msg: &KernelMessage) -> Result<WireFrame, KernelError> {
        let parent = match &msg.parent_header {
            Some(h) => serde_json::to_value(h)?,
            None => Value::Object(Default::default()),
        };
        let buffers: Vec<String> = msg
            .buffers
            .iter()
            .map(|b| BASE64_STANDARD.encode(b))
            .collect();
        let envelope = serde_json::json!({
            "header": &msg.header,
            "parent_header": parent,
            "metadata": &msg.metadata,
            "content": &msg.content,
            "channel": msg.channel,
            "buffers": buffers,
        });
        Ok(WireFrame::Text(envelope.to_string()))
    }

    fn deserialize(&self, frame: WireFrame) -> Result<KernelMessage, KernelError> {
        let text = match frame {
            WireFrame::Text(t) => t,
            WireFrame::Binary(_) => {
                return Err(KernelError::MalformedFrame(
                    "binary frame on JSON subprotocol".to_string(),
                ))
            }
        };
        let value: Value = serde_json::from_str(&text)?;

        let header: Header = serde_json::from_value(
            value
                .get("header")
                .cloned()
                .ok_or_else(|| KernelError::MalformedFrame("missing header".to_string()))?,
        )?;
        let parent_header = parse_parent(value.get("parent_header"))?;
        let channel: Channel = serde_json::from_value(
            value
                .get("channel")
                .cloned()
                .ok_or_else(|| KernelError::MalformedFrame("missing channel".to_string()))?,
        )?;
        let buffers = value
            .get("buffers")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .map(|b| {
                        let encoded = b.as_str().ok_or_else(|| {
                            KernelError::MalformedFrame("buffer is not a string".to_string())
                        })?;
                        BASE64_STANDARD
                            .decode(encoded)
                            .map(Bytes::from)
                            .map_err(|e| KernelError::MalformedFrame(format!("bad base64: {}", e)))
                    })
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?
            .unwrap_or_default();

        Ok(KernelMessage {
            header,
            parent_header,
            channel,
            metadata: value.get("metadata").cloned().unwrap_or(Value::Null),
            content: value.get("content").cloned().unwrap_or(Value::Null),
            buffers,
        })
    }
}

/// Binary offset-table encoding (`v1.kernel.websocket.jupyter.org`).
pub struct BinarySerializer;

impl MessageSerializer for BinarySerializer {
    fn serialize(&self, msg: &KernelMessage) -> Result<WireFrame, KernelError> {
        let parent = match &msg.parent_header {
            Some(h) => serde_json::to_vec(h)?,
            None => b"{}".to_vec(),
        };
        let segments: Vec<Vec<u8>> = vec![
            msg.channel.to_string().into_bytes(),
            serde_json::to_vec(&msg.header)?,
            parent,
            serde_json::to_vec(&msg.metadata)?,
            serde_json::to_vec(&msg.content)?,
        ];

        let count = segments.len() + msg.buffers.len();
        let header_len = 8 + 8 * count;
        let mut out = Vec::with_capacity(
            header_len
                + segments.iter().map(Vec::len).sum::<usize>()
                + msg.buffers.iter().map(Bytes::len).sum::<usize>(),
        );
        out.extend_from_slice(&(count as u64).to_le_bytes());

        let mut offset = header_len as u64;
        for segment in &segments {
            out.extend_from_slice(&offset.to_le_bytes());
            offset += segment.len() as u64;
        }
        for buffer in &msg.buffers {
            out.extend_from_slice(&offset.to_le_bytes());
            offset += buffer.len() as u64;
        }
        for segment in &segments {
            out.extend_from_slice(segment);
        }
        for buffer in &msg.buffers {
            out.extend_from_slice(buffer);
        }
        Ok(WireFrame::Binary(out))
    }

    fn deserialize(&self, frame: WireFrame) -> Result<KernelMessage, KernelError> {
        let data = match frame {
            WireFrame::Binary(d) => d,
            WireFrame::Text(_) => {
                return Err(KernelError::MalformedFrame(
                    "text frame on binary subprotocol".to_string(),
                ))
            }
        };
        if data.len() < 8 {
            return Err(KernelError::MalformedFrame("frame too short".to_string()));
        }
        let count = u64::from_le_bytes(data[0..8].try_into().unwrap()) as usize;
        if count < FIXED_SEGMENTS {
            return Err(KernelError::MalformedFrame(format!(
                "expected at least {} segments, got {}",
                FIXED_SEGMENTS, count
            )));
        }
        if count > data.len() / 8 {
            return Err(KernelError::MalformedFrame(
                "offset table larger than frame".to_string(),
            ));
        }
        let table_end = 8 + 8 * count;
        if data.len() < table_end {
            return Err(KernelError::MalformedFrame(
                "truncated offset table".to_string(),
            ));
        }

        let mut offsets = Vec::with_capacity(count + 1);
        for i in 0..count {
            let start = 8 + 8 * i;
            offsets.push(u64::from_le_bytes(data[start..start + 8].try_into().unwrap()) as usize);
        }
        offsets.push(data.len());

        for pair in offsets.windows(2) {
            if pair[0] > pair[1] || pair[1] > data.len() {
                return Err(KernelError::MalformedFrame(
                    "offsets out of bounds".to_string(),
                ));
            }
        }

        let segment = |i: usize| &data[offsets[i]..offsets[i + 1]];

        let channel: Channel = std::str::from_utf8(segment(0))
            .map_err(|e| KernelError::MalformedFrame(format!("bad channel utf8: {}", e)))?
            .parse()
            .map_err(KernelError::MalformedFrame)?;
        let header: Header = serde_json::from_slice(segment(1))?;
        let parent_value: Value = serde_json::from_slice(segment(2))?;
        let parent_header = parse_parent(Some(&parent_value))?;
        let metadata: Value = serde_json::from_slice(segment(3))?;
        let content: Value = serde_json::from_slice(segment(4))?;
        let buffers = (FIXED_SEGMENTS..count)
            .map(|i| Bytes::copy_from_slice(segment(i)))
            .collect();

        Ok(KernelMessage {
            header,
            parent_header,
            channel,
            metadata,
            content,
            buffers,
        })
    }
}

/// Parse a `parent_header` value where `{}`, `null`, or absence mean "none".
fn parse_parent(value: Option<&Value>) -> Result<Option<Header>, KernelError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) if map.is_empty() => Ok(None),
        Some(v) => Ok(Some(serde_json::from_value(v.clone())?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Channel;

    fn sample_message() -> KernelMessage {
        let mut msg = KernelMessage::new(
            "execute_reply",
            Channel::Shell,
            serde_json::json!({"status": "ok", "execution_count": 1}),
            "session-1",
            "tester",
        );
        msg.set_parent(Header::new("execute_request", "session-1", "tester"));
        msg.with_buffers(vec![Bytes::from_static(b"\x00\x01\x02"), Bytes::from_static(b"blob")])
    }

    #[test]
    fn test_json_roundtrip() {
        let msg = sample_message();
        let frame = JsonSerializer.serialize(&msg).unwrap();
        let parsed = JsonSerializer.deserialize(frame).unwrap();

        assert_eq!(parsed.header, msg.header);
        assert_eq!(parsed.parent_header, msg.parent_header);
        assert_eq!(parsed.channel, Channel::Shell);
        assert_eq!(parsed.content, msg.content);
        assert_eq!(parsed.buffers, msg.buffers);
    }

    #[test]
    fn test_json_empty_parent_is_none() {
        let msg = KernelMessage::new(
            "kernel_info_request",
            Channel::Shell,
            serde_json::json!({}),
            "s",
            "u",
        );
        let frame = JsonSerializer.serialize(&msg).unwrap();
        // The wire form carries `{}` for an absent parent
        if let WireFrame::Text(ref text) = frame {
            let value: Value = serde_json::from_str(text).unwrap();
            assert!(value["parent_header"].as_object().unwrap().is_empty());
        } else {
            panic!("expected text frame");
        }
        let parsed = JsonSerializer.deserialize(frame).unwrap();
        assert!(parsed.parent_header.is_none());
    }

    #[test]
    fn test_json_rejects_binary_frame() {
        let result = JsonSerializer.deserialize(WireFrame::Binary(vec![0, 1, 2]));
        assert!(matches!(result, Err(KernelError::MalformedFrame(_))));
    }

    #[test]
    fn test_binary_roundtrip() {
        let msg = sample_message();
        let frame = BinarySerializer.serialize(&msg).unwrap();
        let parsed = BinarySerializer.deserialize(frame).unwrap();

        assert_eq!(parsed.header, msg.header);
        assert_eq!(parsed.parent_header, msg.parent_header);
        assert_eq!(parsed.channel, Channel::Shell);
        assert_eq!(parsed.content, msg.content);
        assert_eq!(parsed.buffers, msg.buffers);
    }

    #[test]
    fn test_binary_roundtrip_without_buffers_or_parent() {
        let msg = KernelMessage::new(
            "status",
            Channel::IOPub,
            serde_json::json!({"execution_state": "idle"}),
            "s",
            "u",
        );
        let frame = BinarySerializer.serialize(&msg).unwrap();
        let parsed = BinarySerializer.deserialize(frame).unwrap();
        assert!(parsed.parent_header.is_none());
        assert!(parsed.buffers.is_empty());
        assert_eq!(parsed.channel, Channel::IOPub);
    }

    #[test]
    fn test_binary_truncated_frame() {
        let result = BinarySerializer.deserialize(WireFrame::Binary(vec![1, 0, 0]));
        assert!(matches!(result, Err(KernelError::MalformedFrame(_))));
    }

    #[test]
    fn test_binary_bogus_offsets() {
        // Claims 5 segments but the offset table points past the end
        let mut data = Vec::new();
        data.extend_from_slice(&5u64.to_le_bytes());
        for _ in 0..5 {
            data.extend_from_slice(&10_000u64.to_le_bytes());
        }
        let result = BinarySerializer.deserialize(WireFrame::Binary(data));
        assert!(result.is_err());
    }

    #[test]
    fn test_serializer_selection() {
        let msg = sample_message();

        let binary = serializer_for(Some(V1_PROTOCOL));
        assert!(matches!(
            binary.serialize(&msg).unwrap(),
            WireFrame::Binary(_)
        ));

        let json = serializer_for(None);
        assert!(matches!(json.serialize(&msg).unwrap(), WireFrame::Text(_)));

        let unknown = serializer_for(Some("v2.experimental"));
        assert!(matches!(
            unknown.serialize(&msg).unwrap(),
            WireFrame::Text(_)
        ));
    }
}
