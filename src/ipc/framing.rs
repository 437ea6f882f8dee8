//! Content-Length message framing.
//!
//! ```text
//! Content-Length: <length>\r\n
//! \r\n
//! <message-body>
//! ```
//!
//! Header names are case-insensitive; CRLF and bare LF line endings are both
//! accepted. Unknown headers are skipped.

use anyhow::{anyhow, bail, Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single message body (16MB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Read one framed message.
///
/// Returns `Ok(None)` on a clean EOF between messages, so callers can tell a
/// peer that hung up from one that broke the protocol.
///
/// # Errors
///
/// - EOF in the middle of a header block or body
/// - missing or unparsable `Content-Length`
/// - `Content-Length` above [`MAX_MESSAGE_SIZE`]
/// - body that is not valid UTF-8
pub async fn read_message<R>(reader: &mut R) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length: Option<usize> = None;
    let mut saw_header = false;

    loop {
        let mut line = String::new();
        let bytes_read = reader
            .read_line(&mut line)
            .await
            .context("Failed to read header line")?;

        if bytes_read == 0 {
            if saw_header {
                bail!("Connection closed in the middle of a header block");
            }
            return Ok(None);
        }
        saw_header = true;

        let trimmed = line.trim();
        if trimmed.is_empty() {
            break;
        }

        if let Some((key, value)) = trimmed.split_once(':') {
            if key.trim().eq_ignore_ascii_case("Content-Length") {
                let value = value.trim();
                content_length = Some(
                    value
                        .parse()
                        .with_context(|| format!("Invalid Content-Length value: {}", value))?,
                );
            }
        }
    }

    let size = content_length.ok_or_else(|| anyhow!("Missing Content-Length header"))?;
    if size > MAX_MESSAGE_SIZE {
        bail!(
            "Message size {} exceeds maximum {} bytes",
            size,
            MAX_MESSAGE_SIZE
        );
    }

    let mut body = vec![0u8; size];
    reader
        .read_exact(&mut body)
        .await
        .context("Failed to read message body")?;

    String::from_utf8(body)
        .map(Some)
        .context("Message body is not valid UTF-8")
}

/// Write one framed message and flush.
pub async fn write_message<W>(writer: &mut W, body: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let header = format!("Content-Length: {}\r\n\r\n", body.len());

    writer
        .write_all(header.as_bytes())
        .await
        .context("Failed to write message header")?;
    writer
        .write_all(body.as_bytes())
        .await
        .context("Failed to write message body")?;
    writer.flush().await.context("Failed to flush message")?;

    Ok(())
}
