use std::io;

use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Read a length-prefixed message: `[u32 LE length][payload bytes]`.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;

    if len > 16 * 1024 * 1024 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "message too large (>16 MiB)",
        ));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Write a length-prefixed message: `[u32 LE length][payload bytes]`.
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> io::Result<()> {
    let len = (data.len() as u32).to_le_bytes();
    writer.write_all(&len).await?;
    writer.write_all(data).await?;
    writer.flush().await
}

/// The channel a connection is bound to, selected by the first framed
/// message on that connection (spec §4.5, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPath {
    Event,
    Find,
    Live,
}

#[derive(Deserialize)]
struct PathSelector {
    path: String,
}

/// Parse the first inbound message as a `{"path": "/event"|"/find"|"/live"}`
/// selector. Returns `None` for anything else, including malformed JSON.
pub fn parse_path(bytes: &[u8]) -> Option<ChannelPath> {
    let selector: PathSelector = serde_json::from_slice(bytes).ok()?;
    match selector.path.as_str() {
        "/event" => Some(ChannelPath::Event),
        "/find" => Some(ChannelPath::Find),
        "/live" => Some(ChannelPath::Live),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_paths() {
        assert_eq!(parse_path(br#"{"path":"/event"}"#), Some(ChannelPath::Event));
        assert_eq!(parse_path(br#"{"path":"/find"}"#), Some(ChannelPath::Find));
        assert_eq!(parse_path(br#"{"path":"/live"}"#), Some(ChannelPath::Live));
    }

    #[test]
    fn rejects_unknown_path() {
        assert_eq!(parse_path(br#"{"path":"/bogus"}"#), None);
    }

    #[test]
    fn rejects_malformed_json() {
        assert_eq!(parse_path(b"not json"), None);
    }

    #[tokio::test]
    async fn message_roundtrip() {
        let mut buf = Vec::new();
        write_message(&mut buf, b"hello world").await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let got = read_message(&mut cursor).await.unwrap();
        assert_eq!(got, b"hello world");
    }
}
