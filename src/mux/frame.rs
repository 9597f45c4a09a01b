//! Upstream link framing
//!
//! ```text
//! +------+------------+--------+-----------------+
//! | kind | session id | length |     payload     |
//! |  u8  |    u64     |  u16   |  length bytes   |
//! +------+------------+--------+-----------------+
//! ```
//!
//! All integers are big-endian. DATA frames carry one whole IP packet.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::config::Credentials;
use crate::error::{Error, Result};
use crate::session::SessionId;

pub const HEADER_LEN: usize = 1 + 8 + 2;
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// Frame kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Data,
    Auth,
    Close,
}

impl FrameKind {
    pub fn to_byte(self) -> u8 {
        match self {
            FrameKind::Data => 0x01,
            FrameKind::Auth => 0x02,
            FrameKind::Close => 0x03,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(FrameKind::Data),
            0x02 => Some(FrameKind::Auth),
            0x03 => Some(FrameKind::Close),
            _ => None,
        }
    }
}

/// One frame on an upstream link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub session: SessionId,
    pub payload: Bytes,
}

impl Frame {
    pub fn data(session: SessionId, packet: Bytes) -> Self {
        Self {
            kind: FrameKind::Data,
            session,
            payload: packet,
        }
    }

    pub fn close(session: SessionId) -> Self {
        Self {
            kind: FrameKind::Close,
            session,
            payload: Bytes::new(),
        }
    }

    /// Authentication frame: `[method len u8][method][password len u8][password]`
    pub fn auth(credentials: &Credentials) -> Result<Self> {
        let method = credentials.method.as_bytes();
        let password = credentials.password.as_bytes();
        if method.len() > u8::MAX as usize || password.len() > u8::MAX as usize {
            return Err(Error::Config("credentials longer than 255 bytes".into()));
        }
        let mut payload = BytesMut::with_capacity(2 + method.len() + password.len());
        payload.put_u8(method.len() as u8);
        payload.put_slice(method);
        payload.put_u8(password.len() as u8);
        payload.put_slice(password);
        Ok(Self {
            kind: FrameKind::Auth,
            session: 0,
            payload: payload.freeze(),
        })
    }

    /// Append the encoded frame to `dst`
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(Error::Transport(format!(
                "frame payload of {} bytes exceeds limit",
                self.payload.len()
            )));
        }
        dst.reserve(HEADER_LEN + self.payload.len());
        dst.put_u8(self.kind.to_byte());
        dst.put_u64(self.session);
        dst.put_u16(self.payload.len() as u16);
        dst.put_slice(&self.payload);
        Ok(())
    }

    /// Decode one frame from the front of `src`.
    ///
    /// Returns `Ok(None)` when more bytes are needed; consumed bytes are
    /// removed from `src` only when a whole frame is available.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let kind = FrameKind::from_byte(src[0])
            .ok_or_else(|| Error::Transport(format!("unknown frame kind 0x{:02x}", src[0])))?;
        let len = u16::from_be_bytes([src[9], src[10]]) as usize;
        if src.len() < HEADER_LEN + len {
            return Ok(None);
        }

        src.advance(1);
        let session = src.get_u64();
        src.advance(2);
        let payload = src.split_to(len).freeze();
        Ok(Some(Self {
            kind,
            session,
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_frames() {
        let frame = Frame::data(42, Bytes::from_static(b"\x45packet"));
        let mut encoded = BytesMut::new();
        frame.encode(&mut encoded).unwrap();
        assert_eq!(encoded.len(), HEADER_LEN + 7);

        // Feed byte by byte: nothing decodes until the last byte arrives
        let mut buf = BytesMut::new();
        for (i, b) in encoded.iter().enumerate() {
            buf.put_u8(*b);
            let decoded = Frame::decode(&mut buf).unwrap();
            if i + 1 < encoded.len() {
                assert!(decoded.is_none());
            } else {
                assert_eq!(decoded, Some(frame.clone()));
            }
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut buf = BytesMut::new();
        Frame::data(1, Bytes::from_static(b"a")).encode(&mut buf).unwrap();
        Frame::close(2).encode(&mut buf).unwrap();

        let first = Frame::decode(&mut buf).unwrap().unwrap();
        let second = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.session, 1);
        assert_eq!(second.kind, FrameKind::Close);
        assert_eq!(second.session, 2);
        assert!(Frame::decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_auth_layout() {
        let frame = Frame::auth(&Credentials {
            method: "aes-256-gcm".into(),
            password: "pw".into(),
        })
        .unwrap();
        assert_eq!(frame.kind, FrameKind::Auth);
        assert_eq!(&frame.payload[..], b"\x0baes-256-gcm\x02pw");
    }

    #[test]
    fn test_unknown_kind() {
        let mut buf = BytesMut::from(&[0x7f, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0][..]);
        assert!(Frame::decode(&mut buf).is_err());
    }
}
