use std::io;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::NodeError;

/// A single envelope exchanged between nodes, clients and services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub src: String,
    pub dest: String,
    pub body: Body,
}

/// Message payload. `type` selects the handler; every other field is kept
/// verbatim so handlers can decode exactly the shape they expect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Body {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<u64>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Body {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            msg_id: None,
            in_reply_to: None,
            fields: Map::new(),
        }
    }

    /// Builds a body from a `json!` object. Non-object values yield no fields.
    pub fn with_fields(kind: impl Into<String>, fields: Value) -> Self {
        let mut body = Self::new(kind);
        if let Value::Object(map) = fields {
            body.fields = map;
        }
        body
    }

    pub fn error(code: u32, text: impl Into<String>) -> Self {
        Self::with_fields(
            "error",
            serde_json::json!({ "code": code, "text": text.into() }),
        )
    }

    pub fn is_error(&self) -> bool {
        self.kind == "error"
    }

    /// Decodes the non-envelope fields into a typed request.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, NodeError> {
        serde_json::from_value(Value::Object(self.fields.clone())).map_err(NodeError::malformed)
    }

    /// Interprets an `error` body as a typed failure.
    pub fn into_error(self) -> NodeError {
        match self.parse::<ErrorBody>() {
            Ok(ErrorBody { code, text }) => NodeError::from_wire(code, text),
            Err(err) => err,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ErrorBody {
    code: u32,
    #[serde(default)]
    text: String,
}

/// Envelope stream over a line-oriented reader.
///
/// One JSON envelope per line; blank lines are skipped. The line buffer is
/// kept between reads.
pub struct Frames<R> {
    reader: R,
    line: String,
}

impl<R> Frames<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
        }
    }

    /// Next envelope, or `Ok(None)` at EOF. A line that is not an envelope
    /// comes back as `io::ErrorKind::InvalidData` and the stream stays usable.
    pub async fn next(&mut self) -> io::Result<Option<Message>> {
        loop {
            self.line.clear();
            if self.reader.read_line(&mut self.line).await? == 0 {
                return Ok(None);
            }
            let frame = self.line.trim();
            if frame.is_empty() {
                continue;
            }
            return serde_json::from_str(frame).map(Some).map_err(|err| {
                io::Error::new(io::ErrorKind::InvalidData, format!("{err}: {frame:?}"))
            });
        }
    }
}

/// Writes `message` as a single line and flushes it.
pub async fn write_frame<W>(writer: &mut W, message: &Message) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut frame = serde_json::to_string(message)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    frame.push('\n');
    writer.write_all(frame.as_bytes()).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn envelope_keeps_unknown_fields() {
        let raw = r#"{"src":"c1","dest":"n1","body":{"type":"echo","msg_id":1,"echo":"hi"}}"#;
        let message: Message = serde_json::from_str(raw).expect("decode");

        assert_eq!(message.body.kind, "echo");
        assert_eq!(message.body.msg_id, Some(1));
        assert_eq!(message.body.in_reply_to, None);
        assert_eq!(message.body.fields.get("echo"), Some(&json!("hi")));
    }

    #[test]
    fn error_body_becomes_typed_error() {
        let body = Body::error(20, "no such key");
        assert_eq!(
            body.into_error(),
            NodeError::KeyDoesNotExist("no such key".into())
        );
    }

    #[test]
    fn missing_field_is_malformed() {
        #[derive(Debug, Deserialize)]
        struct Add {
            #[allow(dead_code)]
            delta: i64,
        }

        let body = Body::with_fields("add", json!({ "delta": "five" }));
        assert!(matches!(
            body.parse::<Add>(),
            Err(NodeError::MalformedRequest(_))
        ));
    }

    #[tokio::test]
    async fn frames_skip_blank_lines_and_survive_garbage() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut frames = Frames::new(tokio::io::BufReader::new(reader));
        writer.write_all(b"\n\r\n{\"src\":1}\n").await.expect("write noise");

        let message = Message {
            src: "n1".into(),
            dest: "n2".into(),
            body: Body::with_fields("broadcast", json!({ "message": 7 })),
        };
        write_frame(&mut writer, &message).await.expect("write frame");
        drop(writer);

        let garbage = frames.next().await.expect_err("not an envelope");
        assert_eq!(garbage.kind(), io::ErrorKind::InvalidData);
        assert_eq!(frames.next().await.expect("read"), Some(message));
        assert_eq!(frames.next().await.expect("eof"), None);
    }
}
