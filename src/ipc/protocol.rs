//! IPC protocol definitions
//!
//! Newline-delimited JSON over a Unix domain socket. Each line from the client
//! is one [`Command`]; the daemon answers each with one [`Response`] line.
//! Blob content travels base64-encoded.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::CacheStats;
use crate::store::{Blob, StoreError};

/// Protocol version for future compatibility
pub const PROTOCOL_VERSION: u32 = 1;

/// Socket file name, placed in the runtime directory by default
pub const SOCKET_NAME: &str = "nodestore.sock";

/// Commands sent by clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Command {
    /// Read a node's document
    #[serde(rename_all = "camelCase")]
    GetNode { node_id: String },
    /// Replace a node's document
    #[serde(rename_all = "camelCase")]
    SetNode { node_id: String, value: Value },
    /// Delete a node's document
    #[serde(rename_all = "camelCase")]
    DeleteNode { node_id: String },
    /// Store a blob
    PutBlob {
        /// Client-supplied file name (sanitized by the daemon)
        name: String,
        /// Base64 content
        data: String,
    },
    /// Read a blob
    GetBlob { name: String },
    /// Delete a blob
    DeleteBlob { name: String },
    /// Write out one dirty node now, or every dirty node if none is named
    #[serde(rename_all = "camelCase")]
    Flush {
        #[serde(default)]
        node_id: Option<String>,
    },
    /// Get daemon status and cache statistics
    GetStatus,
}

/// Responses sent back to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Response {
    /// Success response
    Success {
        /// Optional success message
        message: Option<String>,
    },
    /// Error response
    Error {
        /// Error message
        error: String,
        /// Machine-readable error class
        code: String,
    },
    /// A node's document
    #[serde(rename_all = "camelCase")]
    Node { node_id: String, value: Value },
    /// A blob's content and metadata
    #[serde(rename_all = "camelCase")]
    Blob {
        /// Sanitized name
        name: String,
        media_type: String,
        size: u64,
        etag: String,
        /// Base64 content
        data: String,
    },
    /// Status response with daemon state
    Status {
        /// Protocol version
        version: u32,
        /// Whether daemon is healthy
        healthy: bool,
        /// Client connections currently open
        connections: u32,
        /// Node cache statistics
        stats: CacheStats,
    },
}

impl Response {
    pub fn success(message: impl Into<String>) -> Self {
        Response::Success {
            message: Some(message.into()),
        }
    }

    /// Error response for a malformed request
    pub fn invalid(error: impl Into<String>) -> Self {
        Response::Error {
            error: error.into(),
            code: "invalidInput".to_string(),
        }
    }

    pub fn blob(blob: Blob) -> Self {
        Response::Blob {
            size: blob.size(),
            data: encode_data(&blob.content),
            media_type: blob.media_type.to_string(),
            name: blob.name,
            etag: blob.etag,
        }
    }
}

impl From<StoreError> for Response {
    fn from(err: StoreError) -> Self {
        Response::Error {
            code: err.code().to_string(),
            error: err.to_string(),
        }
    }
}

/// Parse a JSON command from bytes
pub fn parse_command(data: &[u8]) -> Result<Command, serde_json::Error> {
    serde_json::from_slice(data)
}

/// Serialize a response to JSON bytes
pub fn serialize_response(response: &Response) -> Result<Vec<u8>, serde_json::Error> {
    let mut json = serde_json::to_vec(response)?;
    json.push(b'\n'); // Add newline delimiter
    Ok(json)
}

pub fn encode_data(content: &[u8]) -> String {
    STANDARD.encode(content)
}

pub fn decode_data(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_set_node_command() {
        let line = r#"{"type":"setNode","nodeId":"prompts-1","value":{"prompts":{"1":"a cat"}}}"#;
        let cmd = parse_command(line.as_bytes()).unwrap();
        match cmd {
            Command::SetNode { node_id, value } => {
                assert_eq!(node_id, "prompts-1");
                assert_eq!(value, json!({"prompts": {"1": "a cat"}}));
            }
            _ => panic!("Expected SetNode command"),
        }
    }

    #[test]
    fn test_parse_put_blob_command() {
        let line = r#"{"type":"putBlob","name":"clip.mp4","data":"AAECAw=="}"#;
        let cmd = parse_command(line.as_bytes()).unwrap();
        match cmd {
            Command::PutBlob { name, data } => {
                assert_eq!(name, "clip.mp4");
                assert_eq!(decode_data(&data).unwrap(), vec![0, 1, 2, 3]);
            }
            _ => panic!("Expected PutBlob command"),
        }
    }

    #[test]
    fn test_parse_unit_commands() {
        assert!(matches!(
            parse_command(br#"{"type":"getStatus"}"#).unwrap(),
            Command::GetStatus
        ));
        assert!(matches!(
            parse_command(br#"{"type":"flush"}"#).unwrap(),
            Command::Flush { node_id: None }
        ));
        assert!(matches!(
            parse_command(br#"{"type":"flush","nodeId":"n1"}"#).unwrap(),
            Command::Flush { node_id: Some(id) } if id == "n1"
        ));
    }

    #[test]
    fn test_parse_rejects_missing_fields() {
        assert!(parse_command(br#"{"type":"getNode"}"#).is_err());
        assert!(parse_command(br#"{"type":"unknown"}"#).is_err());
    }

    #[test]
    fn test_serialize_error_from_store_error() {
        let response = Response::from(StoreError::NotFound("clip.mp4".to_string()));
        let json = serialize_response(&response).unwrap();
        assert_eq!(json.last(), Some(&b'\n'));

        let parsed: Value = serde_json::from_slice(&json).unwrap();
        assert_eq!(parsed["type"], "error");
        assert_eq!(parsed["code"], "notFound");
        assert_eq!(parsed["error"], "Not found: clip.mp4");
    }

    #[test]
    fn test_serialize_blob_response() {
        let response = Response::blob(Blob {
            name: "a.wav".to_string(),
            content: vec![1, 2, 3],
            media_type: "audio/mpeg",
            etag: "deadbeef".to_string(),
        });
        let parsed: Value = serde_json::from_slice(&serialize_response(&response).unwrap()).unwrap();
        assert_eq!(parsed["type"], "blob");
        assert_eq!(parsed["mediaType"], "audio/mpeg");
        assert_eq!(parsed["size"], 3);
        assert_eq!(parsed["data"], "AQID");
    }
}
