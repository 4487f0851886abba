use std::{fmt, io};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

pub type NodeId = u64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Request,
    Reply,
    Release,
    Application,
}

impl MessageKind {
    /// Whether this kind takes part in the mutual-exclusion protocol.
    pub fn is_protocol(self) -> bool {
        !matches!(self, MessageKind::Application)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Request => "request",
            MessageKind::Reply => "reply",
            MessageKind::Release => "release",
            MessageKind::Application => "application",
        };
        f.write_str(name)
    }
}

/// A single message between two nodes.
///
/// `seq` numbers messages on the (sender, receiver) link so the receiver can
/// restore send order; connections themselves carry no ordering.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub sender: NodeId,
    pub receiver: NodeId,
    pub timestamp: u64,
    pub kind: MessageKind,
    #[serde(default)]
    pub seq: u64,
}

impl Message {
    pub fn new(sender: NodeId, receiver: NodeId, timestamp: u64, kind: MessageKind) -> Self {
        Self {
            sender,
            receiver,
            timestamp,
            kind,
            seq: 0,
        }
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {} @{} #{}",
            self.kind, self.sender, self.receiver, self.timestamp, self.seq
        )
    }
}

pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }

        let parsed = serde_json::from_str(trimmed).map_err(to_io_error)?;
        return Ok(Some(parsed));
    }
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    // One JSON object per line, flushed so the peer can read it before we close.
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serializes_as_lowercase_string() {
        let msg = Message::new(1, 2, 5, MessageKind::Request).with_seq(3);
        let json = serde_json::to_string(&msg).expect("serialize");
        assert_eq!(
            json,
            r#"{"sender":1,"receiver":2,"timestamp":5,"kind":"request","seq":3}"#
        );
    }

    #[test]
    fn missing_seq_defaults_to_zero() {
        let msg: Message =
            serde_json::from_str(r#"{"sender":3,"receiver":1,"timestamp":9,"kind":"release"}"#)
                .expect("deserialize");
        assert_eq!(msg, Message::new(3, 1, 9, MessageKind::Release));
    }

    #[test]
    fn application_is_not_protocol() {
        assert!(!MessageKind::Application.is_protocol());
        assert!(MessageKind::Request.is_protocol());
        assert!(MessageKind::Reply.is_protocol());
        assert!(MessageKind::Release.is_protocol());
    }

    #[tokio::test]
    async fn reader_skips_blank_lines_and_stops_at_eof() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = tokio::io::BufReader::new(reader);
        let message = Message::new(2, 1, 7, MessageKind::Reply);

        writer.write_all(b"\r\n\n").await.expect("write blanks");
        write_message(&mut writer, &message)
            .await
            .expect("write message");
        drop(writer);

        let parsed = read_message::<_, Message>(&mut reader)
            .await
            .expect("read message")
            .expect("expected message");
        assert_eq!(parsed, message);

        let eof = read_message::<_, Message>(&mut reader)
            .await
            .expect("read eof");
        assert!(eof.is_none());
    }

    #[tokio::test]
    async fn reader_rejects_garbage() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = tokio::io::BufReader::new(reader);
        writer.write_all(b"not json\n").await.expect("write");

        let err = read_message::<_, Message>(&mut reader)
            .await
            .expect_err("garbage should fail");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
