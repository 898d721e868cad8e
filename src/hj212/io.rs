//! Low-level socket I/O operations with deadline handling.

use super::error::{Hj212Error, Result};
use super::types::{CM_FRAME_SIZE, CM_MAGIC, FRAME_TERMINATOR, has_cm_magic};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, error};

const READ_CHUNK: usize = 1024;

/// Hex dump for logs.
pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect::<Vec<_>>().join(" ")
}

/// Write bytes to the stream with a timeout.
pub(crate) async fn write_all<S>(stream: &mut S, bytes: &[u8], timeout_duration: Duration) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    debug!("TX ({} bytes): {}", bytes.len(), hex(&bytes[..bytes.len().min(64)]));
    timeout(timeout_duration, async {
        stream.write_all(bytes).await?;
        stream.flush().await
    })
    .await
    .map_err(|_| Hj212Error::Timeout("write"))?
    .map_err(|e| {
        error!("Write failed: {e}");
        Hj212Error::Io(e)
    })
}

/// Read the connect-time greeting, if any.
///
/// Returns whatever arrived before the deadline. Once the first bytes carry the
/// `CM` magic the read continues until a full 9-byte frame is buffered; an empty
/// result means the peer stayed silent or closed.
pub(crate) async fn read_greeting<S>(stream: &mut S, timeout_duration: Duration) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let deadline = Instant::now() + timeout_duration;
    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        match timeout_at(deadline, stream.read(&mut chunk)).await {
            Err(_) => break,
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() >= CM_FRAME_SIZE || !(has_cm_magic(&buffer) || is_partial_magic(&buffer)) {
                    break;
                }
            }
            Ok(Err(e)) => {
                if buffer.is_empty() {
                    return Err(Hj212Error::Io(e));
                }
                break;
            }
        }
    }

    if !buffer.is_empty() {
        debug!("RX greeting ({} bytes): {}", buffer.len(), hex(&buffer));
    }
    Ok(buffer)
}

/// Read a single chunk, returning an empty buffer on timeout or EOF.
pub(crate) async fn read_once<S>(stream: &mut S, timeout_duration: Duration) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK];
    match timeout(timeout_duration, stream.read(&mut chunk)).await {
        Err(_) => Ok(Vec::new()),
        Ok(Ok(n)) => {
            if n > 0 {
                debug!("RX ({n} bytes): {}", hex(&chunk[..n]));
            }
            Ok(chunk[..n].to_vec())
        }
        Ok(Err(e)) => Err(Hj212Error::Io(e)),
    }
}

/// Accumulate a response until it is complete.
///
/// Stops at `\r\n`, at a complete 9-byte `CM` status frame, at `ceiling` bytes,
/// or at EOF. If the deadline expires with bytes buffered they are returned;
/// with nothing buffered the result is `Timeout`.
pub(crate) async fn read_response<S>(stream: &mut S, timeout_duration: Duration, ceiling: usize) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let deadline = Instant::now() + timeout_duration;
    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];

    while buffer.len() < ceiling {
        let want = (ceiling - buffer.len()).min(READ_CHUNK);
        match timeout_at(deadline, stream.read(&mut chunk[..want])).await {
            Err(_) => {
                if buffer.is_empty() {
                    error!("Response timeout after {timeout_duration:?}");
                    return Err(Hj212Error::Timeout("response"));
                }
                debug!("Response deadline reached with {} bytes buffered", buffer.len());
                break;
            }
            Ok(Ok(0)) => {
                debug!("Peer closed connection after {} bytes", buffer.len());
                break;
            }
            Ok(Ok(n)) => {
                buffer.extend_from_slice(&chunk[..n]);
                if response_complete(&buffer) {
                    break;
                }
            }
            Ok(Err(e)) => {
                if buffer.is_empty() {
                    error!("Response read failed: {e}");
                    return Err(Hj212Error::Io(e));
                }
                break;
            }
        }
    }

    debug!("RX response ({} bytes): {}", buffer.len(), hex(&buffer));
    Ok(buffer)
}

/// `C` alone may still become a greeting once the next segment arrives.
fn is_partial_magic(buffer: &[u8]) -> bool {
    buffer.len() < CM_MAGIC.len() && CM_MAGIC.starts_with(buffer)
}

fn response_complete(buffer: &[u8]) -> bool {
    buffer.windows(FRAME_TERMINATOR.len()).any(|w| w == FRAME_TERMINATOR)
        || (has_cm_magic(buffer) && buffer.len() >= CM_FRAME_SIZE)
}
