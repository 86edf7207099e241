// src/frame.rs

//! A minimal WebSocket frame codec. Decodes server-to-client frames (opcode,
//! 7/16/64-bit length, no masking expected); encodes client-to-server frames
//! as `[0x81, len] + payload` for the short ASCII control/subscribe strings
//! this feed's protocol variants emit. Fragmentation is not supported — the
//! feed never fragments.

use tokio::io::{AsyncRead, AsyncReadExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    Other(u8),
}

impl From<u8> for Opcode {
    fn from(byte0: u8) -> Self {
        match byte0 & 0x0F {
            0x0 => Opcode::Continuation,
            0x1 => Opcode::Text,
            0x2 => Opcode::Binary,
            0x8 => Opcode::Close,
            0x9 => Opcode::Ping,
            0xA => Opcode::Pong,
            other => Opcode::Other(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

/// Reads and decodes a single server frame from `r`. No masking is expected
/// on server-to-client frames.
pub async fn decode_frame<R: AsyncRead + Unpin>(r: &mut R) -> std::io::Result<DecodedFrame> {
    let mut header = [0u8; 2];
    r.read_exact(&mut header).await?;
    let opcode = Opcode::from(header[0]);

    let len7 = header[1] & 0b0111_1111;
    let len: u64 = match len7 {
        126 => {
            let mut ext = [0u8; 2];
            r.read_exact(&mut ext).await?;
            u16::from_be_bytes(ext) as u64
        }
        127 => {
            let mut ext = [0u8; 8];
            r.read_exact(&mut ext).await?;
            u64::from_be_bytes(ext)
        }
        n => n as u64,
    };

    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).await?;
    Ok(DecodedFrame { opcode, payload })
}

/// Encodes a short (≤125 byte) client control/subscribe frame. This feed's
/// server side does not require client masking for these frames.
pub fn encode_client_frame(payload: &[u8]) -> Vec<u8> {
    assert!(payload.len() <= 125, "client control frames here are always short");
    let mut out = Vec::with_capacity(2 + payload.len());
    out.push(0x81); // FIN + text opcode
    out.push(payload.len() as u8);
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn decodes_short_frame() {
        let mut buf = Cursor::new(vec![0x81, 0x03, b'2', b':', b':']);
        let frame = decode_frame(&mut buf).await.unwrap();
        assert_eq!(frame.opcode, Opcode::Text);
        assert_eq!(frame.payload, b"2::");
    }

    #[tokio::test]
    async fn decodes_extended_16bit_length() {
        let payload = vec![b'x'; 200];
        let mut raw = vec![0x82, 126];
        raw.extend_from_slice(&(200u16).to_be_bytes());
        raw.extend_from_slice(&payload);
        let mut buf = Cursor::new(raw);
        let frame = decode_frame(&mut buf).await.unwrap();
        assert_eq!(frame.opcode, Opcode::Binary);
        assert_eq!(frame.payload.len(), 200);
    }

    #[tokio::test]
    async fn decodes_extended_64bit_length() {
        let payload = vec![b'y'; 5];
        let mut raw = vec![0x81, 127];
        raw.extend_from_slice(&(5u64).to_be_bytes());
        raw.extend_from_slice(&payload);
        let mut buf = Cursor::new(raw);
        let frame = decode_frame(&mut buf).await.unwrap();
        assert_eq!(frame.payload, payload);
    }

    #[test]
    fn encodes_short_control_frame() {
        let encoded = encode_client_frame(b"2::");
        assert_eq!(encoded, vec![0x81, 0x03, b'2', b':', b':']);
    }
}
