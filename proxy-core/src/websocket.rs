//! RFC 6455 WebSocket frame codec for the splicing mode.
//!
//! The proxy relays frames between the client and upstream legs,
//! recording text and binary payloads on the parent flow. Client-bound
//! writes are unmasked, upstream-bound writes are masked as required of
//! a client endpoint.

use crate::error::ProxyError;
use crate::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const OPCODE_CONTINUATION: u8 = 0x0;
pub const OPCODE_TEXT: u8 = 0x1;
pub const OPCODE_BINARY: u8 = 0x2;
pub const OPCODE_CLOSE: u8 = 0x8;
pub const OPCODE_PING: u8 = 0x9;
pub const OPCODE_PONG: u8 = 0xa;

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Frames beyond this are refused rather than buffered.
const MAX_FRAME_PAYLOAD: usize = 16 * 1024 * 1024;

/// Compute the `Sec-WebSocket-Accept` value for a handshake key.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn close() -> Self {
        Self {
            fin: true,
            opcode: OPCODE_CLOSE,
            payload: Vec::new(),
        }
    }

    pub fn is_close(&self) -> bool {
        self.opcode == OPCODE_CLOSE
    }

    pub fn is_data(&self) -> bool {
        matches!(self.opcode, OPCODE_TEXT | OPCODE_BINARY)
    }
}

/// Read one frame, unmasking the payload when a mask is present.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; 2];
    reader
        .read_exact(&mut head)
        .await
        .map_err(|e| ProxyError::ClientProtocol(format!("websocket frame read failed: {}", e)))?;

    let fin = head[0] & 0x80 != 0;
    let opcode = head[0] & 0x0f;
    let masked = head[1] & 0x80 != 0;
    let len7 = (head[1] & 0x7f) as u64;

    let length = match len7 {
        126 => {
            let mut ext = [0u8; 2];
            reader.read_exact(&mut ext).await?;
            u16::from_be_bytes(ext) as u64
        }
        127 => {
            let mut ext = [0u8; 8];
            reader.read_exact(&mut ext).await?;
            u64::from_be_bytes(ext)
        }
        n => n,
    };
    if length as usize > MAX_FRAME_PAYLOAD {
        return Err(ProxyError::ClientProtocol(format!(
            "websocket frame too large: {} bytes",
            length
        )));
    }

    let mask = if masked {
        let mut key = [0u8; 4];
        reader.read_exact(&mut key).await?;
        Some(key)
    } else {
        None
    };

    let mut payload = vec![0u8; length as usize];
    reader.read_exact(&mut payload).await?;
    if let Some(key) = mask {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= key[i % 4];
        }
    }

    Ok(Frame { fin, opcode, payload })
}

/// Write one frame. `mask` must be true on the upstream (client-role) leg
/// and false on the client-facing (server-role) leg.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame, mask: bool) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut head = Vec::with_capacity(14);
    head.push((if frame.fin { 0x80 } else { 0x00 }) | (frame.opcode & 0x0f));

    let mask_bit = if mask { 0x80u8 } else { 0x00 };
    let len = frame.payload.len();
    if len < 126 {
        head.push(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        head.push(mask_bit | 126);
        head.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        head.push(mask_bit | 127);
        head.extend_from_slice(&(len as u64).to_be_bytes());
    }

    if mask {
        let mut key = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut key);
        head.extend_from_slice(&key);
        writer.write_all(&head).await?;
        let mut masked: Vec<u8> = frame.payload.clone();
        for (i, byte) in masked.iter_mut().enumerate() {
            *byte ^= key[i % 4];
        }
        writer.write_all(&masked).await?;
    } else {
        writer.write_all(&head).await?;
        writer.write_all(&frame.payload).await?;
    }
    writer.flush().await?;
    Ok(())
}
