use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// JSON control frames interleaved with raw binary chunks on the bulk channel.
/// Binary chunks carry no header: they belong to the oldest open transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "t")]
pub enum BulkControl {
    #[serde(rename = "img-start", rename_all = "camelCase")]
    Start {
        id: String,
        name: String,
        mime: String,
        size: u64,
        chunk_size: u32,
        total_chunks: u32,
    },
    #[serde(rename = "img-end")]
    End { id: String },
}

impl BulkControl {
    pub fn transfer_id(&self) -> &str {
        match self {
            BulkControl::Start { id, .. } | BulkControl::End { id } => id,
        }
    }
}

pub fn encode_control(frame: &BulkControl) -> Result<String, ProtocolError> {
    serde_json::to_string(frame).map_err(|err| ProtocolError::Serialize(err.to_string()))
}

pub fn decode_control(text: &str) -> Result<BulkControl, ProtocolError> {
    serde_json::from_str(text).map_err(|err| ProtocolError::MalformedPayload(err.to_string()))
}

pub fn total_chunks(size: u64, chunk_size: u32) -> u32 {
    if chunk_size == 0 {
        return 0;
    }
    let chunks = size.div_ceil(u64::from(chunk_size));
    u32::try_from(chunks).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_frame_uses_camel_case_fields() {
        let frame = BulkControl::Start {
            id: "t1".into(),
            name: "cat.png".into(),
            mime: "image/png".into(),
            size: 40_000,
            chunk_size: 16_384,
            total_chunks: 3,
        };
        let text = encode_control(&frame).expect("encode");
        let value: serde_json::Value = serde_json::from_str(&text).expect("json");
        assert_eq!(value["t"], "img-start");
        assert_eq!(value["chunkSize"], 16_384);
        assert_eq!(value["totalChunks"], 3);
        assert_eq!(decode_control(&text).expect("decode"), frame);
    }

    #[test]
    fn end_frame_decodes_from_browser_json() {
        let frame = decode_control(r#"{"t":"img-end","id":"abc"}"#).expect("decode");
        assert_eq!(frame, BulkControl::End { id: "abc".into() });
        assert_eq!(frame.transfer_id(), "abc");
    }

    #[test]
    fn unknown_tag_is_malformed() {
        let err = decode_control(r#"{"t":"img-middle","id":"abc"}"#).expect_err("tag");
        assert!(matches!(err, ProtocolError::MalformedPayload(_)));
    }

    #[test]
    fn chunk_count_rounds_up() {
        assert_eq!(total_chunks(0, 16), 0);
        assert_eq!(total_chunks(16, 16), 1);
        assert_eq!(total_chunks(17, 16), 2);
        assert_eq!(total_chunks(5, 0), 0);
    }
}
