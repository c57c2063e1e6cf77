//! DAP transport layer: Content-Length based message framing.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::DapError;

/// Encode a JSON value into a DAP wire-format message with Content-Length header.
pub fn encode_message(value: &serde_json::Value) -> Vec<u8> {
    let body = serde_json::to_string(value).unwrap_or_default();
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    let mut buf = Vec::with_capacity(header.len() + body.len());
    buf.extend_from_slice(header.as_bytes());
    buf.extend_from_slice(body.as_bytes());
    buf
}

/// Decode a DAP wire-format message from a byte buffer.
///
/// Returns the parsed JSON value and the number of bytes consumed from the
/// buffer. If the buffer does not contain a complete message, returns a
/// `Transport` error.
pub fn decode_message(data: &[u8]) -> Result<(serde_json::Value, usize), DapError> {
    let separator = b"\r\n\r\n";
    let sep_pos = data
        .windows(separator.len())
        .position(|w| w == separator)
        .ok_or_else(|| DapError::Transport("incomplete header: missing \\r\\n\\r\\n".into()))?;

    let header = std::str::from_utf8(&data[..sep_pos])
        .map_err(|e| DapError::Transport(format!("invalid UTF-8 in header: {e}")))?;
    let content_length = parse_content_length(header)?
        .ok_or_else(|| DapError::Transport("missing Content-Length header".into()))?;

    let body_start = sep_pos + separator.len();
    let total_consumed = body_start + content_length;
    if data.len() < total_consumed {
        return Err(DapError::Transport(format!(
            "incomplete body: expected {content_length} bytes, have {}",
            data.len() - body_start
        )));
    }

    let value = serde_json::from_slice(&data[body_start..total_consumed])
        .map_err(|e| DapError::InvalidResponse(format!("JSON parse error: {e}")))?;
    Ok((value, total_consumed))
}

/// Read the next framed message from an adapter's output stream.
///
/// Returns `Ok(None)` on a clean end of stream between messages.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<serde_json::Value>, DapError>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length: Option<usize> = None;
    let mut saw_header = false;
    loop {
        let mut line = String::new();
        let read = reader
            .read_line(&mut line)
            .await
            .map_err(|e| DapError::Transport(e.to_string()))?;
        if read == 0 {
            if saw_header {
                return Err(DapError::Transport("stream ended inside a header".into()));
            }
            return Ok(None);
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            if saw_header {
                break;
            }
            continue;
        }
        saw_header = true;
        if let Some(length) = parse_content_length(trimmed)? {
            content_length = Some(length);
        }
    }

    let length =
        content_length.ok_or_else(|| DapError::Transport("missing Content-Length header".into()))?;
    let mut body = vec![0u8; length];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| DapError::Transport(format!("incomplete body: {e}")))?;
    serde_json::from_slice(&body)
        .map(Some)
        .map_err(|e| DapError::InvalidResponse(format!("JSON parse error: {e}")))
}

/// Parse the Content-Length value from a header block, if present.
fn parse_content_length(header: &str) -> Result<Option<usize>, DapError> {
    for line in header.split("\r\n") {
        if let Some(value) = line.trim().strip_prefix("Content-Length:") {
            let value = value.trim();
            return value.parse::<usize>().map(Some).map_err(|e| {
                DapError::Transport(format!("invalid Content-Length value '{value}': {e}"))
            });
        }
    }
    Ok(None)
}
