/// Frame and field encoding for the world model wire protocol.
///
/// Every message is a length-prefixed frame on TCP: a 4-byte big-endian
/// length counting the message-id byte plus the payload, the 1-byte message
/// id, then the payload. Strings travel as a 4-byte big-endian byte length
/// followed by UTF-16BE code units. Both peer roles open with the identical
/// fixed handshake sequence; a mismatch closes the connection.
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{WmError, WmResult};

/// Maximum accepted frame size (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Protocol name carried in the handshake.
const HANDSHAKE_NAME: &[u8] = b"mundus world model protocol";
/// Protocol version carried in the handshake, major then minor.
const HANDSHAKE_VERSION: [u8; 2] = [0, 1];

/// The fixed byte sequence each side sends on connect.
pub fn handshake_bytes() -> Vec<u8> {
    let mut bytes = Vec::with_capacity(4 + HANDSHAKE_NAME.len() + 2);
    put_u32(&mut bytes, HANDSHAKE_NAME.len() as u32);
    bytes.extend_from_slice(HANDSHAKE_NAME);
    bytes.extend_from_slice(&HANDSHAKE_VERSION);
    bytes
}

/// Assemble a complete frame from a message id and payload.
pub fn frame_bytes(id: u8, payload: &[u8]) -> Vec<u8> {
    let length = payload.len() + 1;
    debug_assert!(length <= MAX_FRAME_SIZE);
    let mut frame = Vec::with_capacity(4 + length);
    put_u32(&mut frame, length as u32);
    frame.push(id);
    frame.extend_from_slice(payload);
    frame
}

/// Read one frame, returning the message id and payload.
pub async fn read_frame<R>(reader: &mut R) -> WmResult<(u8, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut length_bytes = [0u8; 4];
    reader.read_exact(&mut length_bytes).await?;
    let length = u32::from_be_bytes(length_bytes) as usize;
    if length == 0 {
        return Err(WmError::Protocol("zero-length frame".to_string()));
    }
    if length > MAX_FRAME_SIZE {
        return Err(WmError::Protocol(format!(
            "frame of {length} bytes exceeds the {MAX_FRAME_SIZE} byte limit"
        )));
    }
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;
    let id = body[0];
    body.remove(0);
    Ok((id, body))
}

/// Write raw bytes and flush.
pub async fn write_all<W>(writer: &mut W, bytes: &[u8]) -> WmResult<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Field encoding
// ---------------------------------------------------------------------------

pub fn put_u8(buf: &mut Vec<u8>, value: u8) {
    buf.push(value);
}

pub fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

pub fn put_i32(buf: &mut Vec<u8>, value: i32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

pub fn put_i64(buf: &mut Vec<u8>, value: i64) {
    buf.extend_from_slice(&value.to_be_bytes());
}

/// Length-prefixed UTF-16BE string.
pub fn put_string(buf: &mut Vec<u8>, value: &str) {
    let units: Vec<u16> = value.encode_utf16().collect();
    put_u32(buf, (units.len() * 2) as u32);
    for unit in units {
        buf.extend_from_slice(&unit.to_be_bytes());
    }
}

/// Length-prefixed opaque bytes.
pub fn put_bytes(buf: &mut Vec<u8>, value: &[u8]) {
    put_u32(buf, value.len() as u32);
    buf.extend_from_slice(value);
}

// ---------------------------------------------------------------------------
// Field decoding
// ---------------------------------------------------------------------------

/// Cursor over a received payload.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> WmResult<&'a [u8]> {
        if self.pos + len > self.buf.len() {
            return Err(WmError::Protocol(format!(
                "truncated frame: wanted {len} bytes at offset {}, {} available",
                self.pos,
                self.buf.len() - self.pos
            )));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn u8(&mut self) -> WmResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u32(&mut self) -> WmResult<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn i32(&mut self) -> WmResult<i32> {
        let bytes = self.take(4)?;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn i64(&mut self) -> WmResult<i64> {
        let bytes = self.take(8)?;
        let mut array = [0u8; 8];
        array.copy_from_slice(bytes);
        Ok(i64::from_be_bytes(array))
    }

    /// Length-prefixed UTF-16BE string.
    pub fn string(&mut self) -> WmResult<String> {
        let byte_len = self.u32()? as usize;
        if byte_len % 2 != 0 {
            return Err(WmError::Protocol(format!(
                "UTF-16 string with odd byte length {byte_len}"
            )));
        }
        let bytes = self.take(byte_len)?;
        let units: Vec<u16> =
            bytes.chunks_exact(2).map(|pair| u16::from_be_bytes([pair[0], pair[1]])).collect();
        String::from_utf16(&units)
            .map_err(|_| WmError::Protocol("invalid UTF-16 in string field".to_string()))
    }

    /// Length-prefixed opaque bytes.
    pub fn bytes(&mut self) -> WmResult<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// Fail unless the whole payload was consumed.
    pub fn finish(self) -> WmResult<()> {
        if self.pos != self.buf.len() {
            return Err(WmError::Protocol(format!(
                "{} trailing bytes after message payload",
                self.buf.len() - self.pos
            )));
        }
        Ok(())
    }
}
