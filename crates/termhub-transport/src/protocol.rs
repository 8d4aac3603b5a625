//! Wire protocol for push-channel clients.

use serde::{Deserialize, Serialize};

/// Message from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Terminal input.
    Input { data: String },
    /// Resize terminal.
    Resize { rows: u16, cols: u16 },
    /// Ping for keepalive.
    Ping,
}

impl ClientMessage {
    /// Parse a JSON text frame.
    ///
    /// # Errors
    /// Returns error if the frame is not a known message.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Message from server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Terminal output.
    Output { data: String },
    /// Error message.
    Error { message: String },
    /// Pong response.
    Pong,
}

impl ServerMessage {
    #[must_use]
    pub fn output(data: impl Into<String>) -> Self {
        Self::Output { data: data.into() }
    }

    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// Incremental UTF-8 decoder for chunked terminal output.
///
/// A multi-byte character split across chunks is held back until the rest
/// arrives; genuinely invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    /// Decode as much of `chunk` as forms complete characters.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                        // Incomplete sequence at the end: wait for more bytes.
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        self.pending = rest.to_vec();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_frames() {
        assert_eq!(
            ClientMessage::parse(r#"{"type":"input","data":"ls\n"}"#).unwrap(),
            ClientMessage::Input {
                data: "ls\n".to_string()
            }
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":"resize","rows":24,"cols":80}"#).unwrap(),
            ClientMessage::Resize { rows: 24, cols: 80 }
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":"ping"}"#).unwrap(),
            ClientMessage::Ping
        );
        assert!(ClientMessage::parse(r#"{"type":"shutdown"}"#).is_err());
        assert!(ClientMessage::parse("not json").is_err());
    }

    #[test]
    fn test_server_frames() {
        let json = serde_json::to_value(ServerMessage::output("hi")).unwrap();
        assert_eq!(json, serde_json::json!({"type": "output", "data": "hi"}));

        let json = serde_json::to_value(ServerMessage::error("Session not found")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "error", "message": "Session not found"})
        );

        let json = serde_json::to_string(&ServerMessage::Pong).unwrap();
        assert_eq!(json, r#"{"type":"pong"}"#);
    }

    #[test]
    fn test_decoder_holds_split_character() {
        let mut decoder = Utf8Decoder::default();
        let bytes = "héllo".as_bytes();

        assert_eq!(decoder.decode(&bytes[..2]), "h");
        assert_eq!(decoder.decode(&bytes[2..]), "éllo");
    }

    #[test]
    fn test_decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(b"a\xffb"), "a\u{fffd}b");
        assert_eq!(decoder.decode(b""), "");
    }
}
