//! Message I/O.
//!
//! A frame is `i32 length`, `i32 checksum`, then `length` bytes of JSON
//! payload. Integers are little-endian. The checksum is `length` XOR-folded
//! with every payload byte; a reader that computes a different checksum fails
//! with [`TetherError::CorruptMessage`].

use tether_types::{Message, TetherError, TetherResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum single payload size (16 MB).
pub const MAX_MESSAGE_SIZE: i32 = 16 * 1024 * 1024;

/// Size of the length + checksum header.
pub const HEADER_LEN: usize = 8;

/// `length` XOR-accumulated with every payload byte.
pub fn checksum(length: i32, payload: &[u8]) -> i32 {
    payload
        .iter()
        .fold(length, |acc, byte| acc ^ i32::from(*byte))
}

/// Frame an already-serialized payload.
pub fn encode_frame(payload: &[u8]) -> TetherResult<Vec<u8>> {
    let length = i32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_MESSAGE_SIZE)
        .ok_or(TetherError::MessageTooLarge {
            size: payload.len() as i64,
            max: MAX_MESSAGE_SIZE,
        })?;

    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.extend_from_slice(&length.to_le_bytes());
    bytes.extend_from_slice(&checksum(length, payload).to_le_bytes());
    bytes.extend_from_slice(payload);
    Ok(bytes)
}

/// Serialize and frame a message. Fails if the correlation id is missing.
pub fn encode_message(msg: &Message) -> TetherResult<Vec<u8>> {
    msg.require_id()?;
    let payload = serde_json::to_vec(msg)?;
    encode_frame(&payload)
}

/// Parse a JSON payload into a message.
pub fn decode_message(payload: &[u8]) -> TetherResult<Message> {
    Ok(serde_json::from_slice(payload)?)
}

/// Write a framed message.
pub async fn write_message<W>(writer: &mut W, msg: &Message) -> TetherResult<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_message(msg)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame and return its verified payload.
pub async fn read_frame<R>(reader: &mut R) -> TetherResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    read_exact_or_closed(reader, &mut header).await?;

    let length = i32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let expected = i32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if !(0..=MAX_MESSAGE_SIZE).contains(&length) {
        return Err(TetherError::MessageTooLarge {
            size: i64::from(length),
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut payload = vec![0u8; length as usize];
    read_exact_or_closed(reader, &mut payload).await?;

    let actual = checksum(length, &payload);
    if actual != expected {
        return Err(TetherError::CorruptMessage { expected, actual });
    }
    Ok(payload)
}

/// Read one framed message.
pub async fn read_message<R>(reader: &mut R) -> TetherResult<Message>
where
    R: AsyncRead + Unpin,
{
    let payload = read_frame(reader).await?;
    decode_message(&payload)
}

async fn read_exact_or_closed<R>(reader: &mut R, buf: &mut [u8]) -> TetherResult<()>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(TetherError::ConnectionClosed)
        }
        Err(e) => Err(TetherError::Io(e)),
    }
}
